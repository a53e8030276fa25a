//! Billing, analytics, and webhook boundaries
//!
//! The dispatch engine does not know how plans are priced or where usage
//! events go; it talks to these traits. The shipped implementations cover
//! the common cases: a plan-based quota backed by the intent table, a
//! tracing-backed analytics sink, and the sqlite webhook ledger.

use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::Mutex;
use std::time::{Duration, Instant};
use tracing::info;

use crate::db::Database;
use crate::error::{Result, SyndicaError};
use crate::platforms::PlatformId;
use crate::types::IntentStatus;

/// A user's plan as billing sees it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Plan {
    pub name: String,
    /// None means unmetered.
    pub daily_publish_limit: Option<u32>,
}

impl Plan {
    pub fn free() -> Self {
        Self {
            name: "free".to_string(),
            daily_publish_limit: Some(10),
        }
    }

    pub fn unlimited(name: &str) -> Self {
        Self {
            name: name.to_string(),
            daily_publish_limit: None,
        }
    }
}

/// Gate on whether a user may schedule another publish.
#[async_trait]
pub trait LimitChecker: Send + Sync {
    /// # Errors
    ///
    /// `SyndicaError::QuotaExceeded` when the user's plan is out of
    /// headroom.
    async fn check_publish(&self, user_id: &str, platform: PlatformId) -> Result<()>;
}

/// Usage event emitted after a dispatch reaches a terminal state.
#[derive(Debug, Clone)]
pub struct PublishEvent {
    pub intent_id: String,
    pub user_id: String,
    pub platform: PlatformId,
    pub status: IntentStatus,
    pub attempts: u32,
    pub at: i64,
}

/// Destination for usage events. Delivery is fire-and-forget; a sink must
/// never fail a dispatch.
#[async_trait]
pub trait AnalyticsSink: Send + Sync {
    async fn record(&self, event: PublishEvent);
}

/// Dedupe gate for inbound platform webhooks.
#[async_trait]
pub trait WebhookLedger: Send + Sync {
    /// Claim a delivery for processing. Returns false when the (platform,
    /// event) pair was already claimed, so duplicate deliveries collapse
    /// into one processing.
    async fn claim(&self, platform: PlatformId, event_id: &str) -> Result<bool>;
}

/// In-process cache of plan lookups so the dispatch path does not hit the
/// billing backend per intent. Entries expire after the TTL; webhook-driven
/// plan changes call `invalidate`.
pub struct PlanCache {
    ttl: Duration,
    entries: Mutex<HashMap<String, (Plan, Instant)>>,
}

impl PlanCache {
    pub fn new(ttl: Duration) -> Self {
        Self {
            ttl,
            entries: Mutex::new(HashMap::new()),
        }
    }

    pub fn get(&self, user_id: &str) -> Option<Plan> {
        let entries = self.entries.lock().unwrap();
        entries.get(user_id).and_then(|(plan, cached_at)| {
            if cached_at.elapsed() < self.ttl {
                Some(plan.clone())
            } else {
                None
            }
        })
    }

    pub fn put(&self, user_id: &str, plan: Plan) {
        self.entries
            .lock()
            .unwrap()
            .insert(user_id.to_string(), (plan, Instant::now()));
    }

    /// Drop one user's cached plan, forcing a reload on next lookup.
    pub fn invalidate(&self, user_id: &str) {
        self.entries.lock().unwrap().remove(user_id);
    }

    pub fn invalidate_all(&self) {
        self.entries.lock().unwrap().clear();
    }
}

/// Quota check backed by the intent table: intents created in the last 24
/// hours count against the plan's daily limit.
pub struct PlanLimitChecker {
    db: Database,
    cache: PlanCache,
    default_plan: Plan,
}

impl PlanLimitChecker {
    pub fn new(db: Database, default_plan: Plan) -> Self {
        Self {
            db,
            cache: PlanCache::new(Duration::from_secs(300)),
            default_plan,
        }
    }

    pub fn cache(&self) -> &PlanCache {
        &self.cache
    }

    fn plan_for(&self, user_id: &str) -> Plan {
        self.cache.get(user_id).unwrap_or_else(|| {
            // No billing backend wired up: fall back to the default plan
            // and cache the answer.
            self.cache.put(user_id, self.default_plan.clone());
            self.default_plan.clone()
        })
    }
}

#[async_trait]
impl LimitChecker for PlanLimitChecker {
    async fn check_publish(&self, user_id: &str, _platform: PlatformId) -> Result<()> {
        let plan = self.plan_for(user_id);
        let Some(limit) = plan.daily_publish_limit else {
            return Ok(());
        };

        let since = chrono::Utc::now().timestamp_millis() - 24 * 60 * 60 * 1000;
        let used = self.db.count_user_intents_since(user_id, since).await?;
        if used >= limit as i64 {
            return Err(SyndicaError::QuotaExceeded {
                resource: format!("daily publishes ({} plan)", plan.name),
            });
        }
        Ok(())
    }
}

/// Checker that admits everything, for deployments without billing.
pub struct UnlimitedChecker;

#[async_trait]
impl LimitChecker for UnlimitedChecker {
    async fn check_publish(&self, _user_id: &str, _platform: PlatformId) -> Result<()> {
        Ok(())
    }
}

/// Sink that emits usage events as structured log lines.
pub struct TracingSink;

#[async_trait]
impl AnalyticsSink for TracingSink {
    async fn record(&self, event: PublishEvent) {
        info!(
            intent_id = %event.intent_id,
            user_id = %event.user_id,
            platform = %event.platform,
            status = %event.status,
            attempts = event.attempts,
            "publish event"
        );
    }
}

/// Sink that collects events in memory, for tests.
#[derive(Default)]
pub struct MemorySink {
    events: Mutex<Vec<PublishEvent>>,
}

impl MemorySink {
    pub fn events(&self) -> Vec<PublishEvent> {
        self.events.lock().unwrap().clone()
    }
}

#[async_trait]
impl AnalyticsSink for MemorySink {
    async fn record(&self, event: PublishEvent) {
        self.events.lock().unwrap().push(event);
    }
}

/// Webhook ledger backed by the `webhook_events` table; the insert-or-
/// ignore write makes the claim atomic.
pub struct SqliteWebhookLedger {
    db: Database,
}

impl SqliteWebhookLedger {
    pub fn new(db: Database) -> Self {
        Self { db }
    }
}

#[async_trait]
impl WebhookLedger for SqliteWebhookLedger {
    async fn claim(&self, platform: PlatformId, event_id: &str) -> Result<bool> {
        self.db
            .webhook_mark_processed(platform, event_id, chrono::Utc::now().timestamp_millis())
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{PostIntent, PublishContent};

    async fn test_db() -> (Database, tempfile::TempDir) {
        let dir = tempfile::tempdir().unwrap();
        let db_path = dir.path().join("billing.db");
        let db = Database::new(db_path.to_str().unwrap()).await.unwrap();
        (db, dir)
    }

    async fn seed_intents(db: &Database, user_id: &str, count: usize) {
        let now = chrono::Utc::now().timestamp_millis();
        for _ in 0..count {
            let intent = PostIntent::new(
                user_id.to_string(),
                PlatformId::Mock,
                PublishContent::text("x"),
                serde_json::json!({}),
                now,
            );
            db.create_intent(&intent).await.unwrap();
        }
    }

    #[tokio::test]
    async fn test_quota_enforced_at_limit() {
        let (db, _dir) = test_db().await;
        let checker = PlanLimitChecker::new(
            db.clone(),
            Plan {
                name: "starter".to_string(),
                daily_publish_limit: Some(2),
            },
        );

        checker.check_publish("u1", PlatformId::Mock).await.unwrap();
        seed_intents(&db, "u1", 2).await;

        let err = checker
            .check_publish("u1", PlatformId::Mock)
            .await
            .unwrap_err();
        assert!(matches!(err, SyndicaError::QuotaExceeded { .. }));
    }

    #[tokio::test]
    async fn test_quota_is_per_user() {
        let (db, _dir) = test_db().await;
        let checker = PlanLimitChecker::new(
            db.clone(),
            Plan {
                name: "starter".to_string(),
                daily_publish_limit: Some(1),
            },
        );

        seed_intents(&db, "u1", 1).await;
        assert!(checker.check_publish("u1", PlatformId::Mock).await.is_err());
        assert!(checker.check_publish("u2", PlatformId::Mock).await.is_ok());
    }

    #[tokio::test]
    async fn test_unmetered_plan_never_blocks() {
        let (db, _dir) = test_db().await;
        let checker = PlanLimitChecker::new(db.clone(), Plan::unlimited("business"));
        seed_intents(&db, "u1", 50).await;
        assert!(checker.check_publish("u1", PlatformId::Mock).await.is_ok());
    }

    #[tokio::test]
    async fn test_invalidate_forces_plan_reload() {
        let (db, _dir) = test_db().await;
        let checker = PlanLimitChecker::new(
            db.clone(),
            Plan {
                name: "starter".to_string(),
                daily_publish_limit: Some(1),
            },
        );
        seed_intents(&db, "u1", 1).await;
        assert!(checker.check_publish("u1", PlatformId::Mock).await.is_err());

        // Upgrade arrives via webhook: put the new plan and it takes effect
        checker.cache().invalidate("u1");
        checker.cache().put("u1", Plan::unlimited("business"));
        assert!(checker.check_publish("u1", PlatformId::Mock).await.is_ok());
    }

    #[test]
    fn test_plan_cache_expiry() {
        let cache = PlanCache::new(Duration::ZERO);
        cache.put("u1", Plan::free());
        // Zero TTL: everything is already stale
        assert!(cache.get("u1").is_none());

        let cache = PlanCache::new(Duration::from_secs(60));
        cache.put("u1", Plan::free());
        assert_eq!(cache.get("u1"), Some(Plan::free()));
        cache.invalidate("u1");
        assert!(cache.get("u1").is_none());
    }

    #[tokio::test]
    async fn test_memory_sink_collects() {
        let sink = MemorySink::default();
        sink.record(PublishEvent {
            intent_id: "i1".to_string(),
            user_id: "u1".to_string(),
            platform: PlatformId::Mock,
            status: IntentStatus::Published,
            attempts: 1,
            at: 1000,
        })
        .await;
        assert_eq!(sink.events().len(), 1);
    }

    #[tokio::test]
    async fn test_webhook_ledger_claims_once() {
        let (db, _dir) = test_db().await;
        let ledger = SqliteWebhookLedger::new(db);
        assert!(ledger.claim(PlatformId::Buzzly, "ev-1").await.unwrap());
        assert!(!ledger.claim(PlatformId::Buzzly, "ev-1").await.unwrap());
    }
}
