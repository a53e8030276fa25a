//! Intent dispatch engine
//!
//! Turns a due post intent into exactly one platform publish. The flow is
//! claim, load, execute, finalize, report: the atomic claim guarantees a
//! single dispatcher per intent, the executor handles retries and refresh,
//! and the terminal status lands in storage before analytics hears about
//! it. An analytics failure can never affect the dispatch outcome.

use std::sync::Arc;
use tracing::{debug, error, info, warn};

use crate::billing::{AnalyticsSink, LimitChecker, PublishEvent};
use crate::db::Database;
use crate::error::{Result, SyndicaError};
use crate::executor::Executor;
use crate::platforms::{AdapterRegistry, PlatformId};
use crate::types::{ErrorSnapshot, IntentStatus, PostIntent, PublishContent, PublishOutcome};

/// Outcome of one dispatch call.
#[derive(Debug, Clone)]
pub enum DispatchResult {
    /// Another dispatcher holds the claim, or the intent is already
    /// terminal.
    Skipped,
    Published(PublishOutcome),
    Failed(ErrorSnapshot),
}

pub struct DispatchEngine {
    db: Database,
    registry: Arc<AdapterRegistry>,
    executor: Arc<Executor>,
    analytics: Arc<dyn AnalyticsSink>,
}

impl DispatchEngine {
    pub fn new(
        db: Database,
        registry: Arc<AdapterRegistry>,
        executor: Arc<Executor>,
        analytics: Arc<dyn AnalyticsSink>,
    ) -> Self {
        Self {
            db,
            registry,
            executor,
            analytics,
        }
    }

    /// Dispatch one intent end to end.
    ///
    /// Safe to call concurrently for the same intent from any number of
    /// processes; all but the claim winner return `Skipped`.
    pub async fn dispatch(&self, intent_id: &str) -> Result<DispatchResult> {
        let now = chrono::Utc::now().timestamp_millis();
        if !self.db.claim_intent(intent_id, now).await? {
            debug!(intent_id, "claim lost, skipping");
            return Ok(DispatchResult::Skipped);
        }

        let Some(intent) = self.db.get_intent(intent_id).await? else {
            // Claimed a row that vanished; nothing left to do.
            warn!(intent_id, "claimed intent no longer exists");
            return Ok(DispatchResult::Skipped);
        };

        let correlation_id = uuid::Uuid::new_v4().simple().to_string();
        info!(
            intent_id,
            user_id = %intent.user_id,
            platform = %intent.platform,
            correlation_id = %correlation_id,
            "dispatching intent"
        );

        let Some(adapter) = self.registry.adapter(intent.platform) else {
            let snapshot = ErrorSnapshot {
                message: format!("platform {} is not available", intent.platform),
                upstream_status: None,
                upstream_body: None,
                correlation_id,
            };
            return self.finalize_failed(&intent, snapshot, 0).await;
        };

        match self
            .executor
            .publish(adapter, &intent.user_id, &intent.content, &intent.options)
            .await
        {
            Ok((outcome, report)) => {
                self.db.finish_published(intent_id, &outcome).await?;
                info!(
                    intent_id,
                    remote_id = %outcome.remote_id,
                    attempts = report.attempts,
                    "intent published"
                );
                self.report(&intent, IntentStatus::Published, report.attempts)
                    .await;
                Ok(DispatchResult::Published(outcome))
            }
            Err(SyndicaError::Platform(platform_error)) => {
                let snapshot = ErrorSnapshot::from_platform_error(&platform_error, correlation_id);
                self.finalize_failed(&intent, snapshot, 1).await
            }
            Err(error @ SyndicaError::NotConnected { .. }) => {
                let snapshot = ErrorSnapshot {
                    message: error.to_string(),
                    upstream_status: None,
                    upstream_body: None,
                    correlation_id,
                };
                self.finalize_failed(&intent, snapshot, 0).await
            }
            Err(SyndicaError::Vault(vault_error)) => {
                // No secrets in vault error messages, safe to persist
                let snapshot = ErrorSnapshot {
                    message: format!("credential unavailable: {}", vault_error),
                    upstream_status: None,
                    upstream_body: None,
                    correlation_id,
                };
                self.finalize_failed(&intent, snapshot, 0).await
            }
            Err(other) => {
                // Infrastructure failure: leave the claim for stale
                // recovery rather than marking the intent failed.
                error!(intent_id, error = %other, "dispatch aborted");
                Err(other)
            }
        }
    }

    async fn finalize_failed(
        &self,
        intent: &PostIntent,
        snapshot: ErrorSnapshot,
        attempts: u32,
    ) -> Result<DispatchResult> {
        warn!(
            intent_id = %intent.id,
            platform = %intent.platform,
            correlation_id = %snapshot.correlation_id,
            error = %snapshot.message,
            "intent failed"
        );
        self.db.finish_failed(&intent.id, &snapshot).await?;
        self.report(intent, IntentStatus::Failed, attempts).await;
        Ok(DispatchResult::Failed(snapshot))
    }

    async fn report(&self, intent: &PostIntent, status: IntentStatus, attempts: u32) {
        self.analytics
            .record(PublishEvent {
                intent_id: intent.id.clone(),
                user_id: intent.user_id.clone(),
                platform: intent.platform,
                status,
                attempts,
                at: chrono::Utc::now().timestamp_millis(),
            })
            .await;
    }
}

/// User-facing intent operations: create, cancel, reschedule, redispatch.
pub struct IntentService {
    db: Database,
    limits: Arc<dyn LimitChecker>,
}

impl IntentService {
    pub fn new(db: Database, limits: Arc<dyn LimitChecker>) -> Self {
        Self { db, limits }
    }

    /// Create a scheduled intent after validating content and quota.
    pub async fn create(
        &self,
        user_id: &str,
        platform: PlatformId,
        content: PublishContent,
        options: serde_json::Value,
        scheduled_at: i64,
    ) -> Result<PostIntent> {
        if content.text.trim().is_empty() && content.media_urls.is_empty() {
            return Err(SyndicaError::InvalidInput(
                "post content is empty".to_string(),
            ));
        }

        self.limits.check_publish(user_id, platform).await?;

        let intent = PostIntent::new(user_id.to_string(), platform, content, options, scheduled_at);
        self.db.create_intent(&intent).await?;
        info!(
            intent_id = %intent.id,
            user_id,
            platform = %platform,
            scheduled_at,
            "intent created"
        );
        Ok(intent)
    }

    /// Cancel a not-yet-dispatched intent.
    ///
    /// # Errors
    ///
    /// `InvalidInput` when the intent is unknown or already past the
    /// scheduled state.
    pub async fn cancel(&self, intent_id: &str) -> Result<()> {
        if self.db.cancel_intent(intent_id).await? {
            info!(intent_id, "intent cancelled");
            return Ok(());
        }
        match self.db.get_intent(intent_id).await? {
            Some(intent) => Err(SyndicaError::InvalidInput(format!(
                "intent is {} and can no longer be cancelled",
                intent.status
            ))),
            None => Err(SyndicaError::InvalidInput(format!(
                "no such intent: {}",
                intent_id
            ))),
        }
    }

    /// Move a not-yet-dispatched intent to a new time.
    pub async fn reschedule(&self, intent_id: &str, scheduled_at: i64) -> Result<()> {
        if self.db.reschedule_intent(intent_id, scheduled_at).await? {
            info!(intent_id, scheduled_at, "intent rescheduled");
            return Ok(());
        }
        match self.db.get_intent(intent_id).await? {
            Some(intent) => Err(SyndicaError::InvalidInput(format!(
                "intent is {} and can no longer be rescheduled",
                intent.status
            ))),
            None => Err(SyndicaError::InvalidInput(format!(
                "no such intent: {}",
                intent_id
            ))),
        }
    }

    /// Re-dispatch a failed intent as a brand-new intent scheduled now.
    /// The failed record keeps its history; retrying never rewinds a
    /// terminal status.
    pub async fn redispatch(&self, intent_id: &str) -> Result<PostIntent> {
        let original = self
            .db
            .get_intent(intent_id)
            .await?
            .ok_or_else(|| SyndicaError::InvalidInput(format!("no such intent: {}", intent_id)))?;

        if original.status != IntentStatus::Failed {
            return Err(SyndicaError::InvalidInput(format!(
                "only failed intents can be re-dispatched, this one is {}",
                original.status
            )));
        }

        self.limits
            .check_publish(&original.user_id, original.platform)
            .await?;

        let intent = PostIntent::new(
            original.user_id,
            original.platform,
            original.content,
            original.options,
            chrono::Utc::now().timestamp_millis(),
        );
        self.db.create_intent(&intent).await?;
        info!(
            intent_id = %intent.id,
            replaces = %original.id,
            "failed intent re-dispatched as new intent"
        );
        Ok(intent)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::billing::{MemorySink, UnlimitedChecker};
    use crate::config::Config;
    use crate::error::PlatformError;
    use crate::executor::RetryPolicy;
    use crate::platforms::mock::MockAdapter;
    use crate::vault::{Credential, Vault};
    use secrecy::SecretString;
    use std::time::Duration;

    struct Fixture {
        engine: DispatchEngine,
        service: IntentService,
        db: Database,
        mock: MockAdapter,
        sink: Arc<MemorySink>,
        _dir: tempfile::TempDir,
    }

    async fn fixture() -> Fixture {
        let dir = tempfile::tempdir().unwrap();
        let db_path = dir.path().join("dispatch.db");
        let db = Database::new(db_path.to_str().unwrap()).await.unwrap();
        let vault = Vault::new([7u8; 32], db.clone());

        vault
            .store(
                "u1",
                PlatformId::Mock,
                &Credential::new(
                    SecretString::from("access".to_string()),
                    None,
                    None,
                    None,
                    vec![],
                    None,
                ),
            )
            .await
            .unwrap();

        let mock = MockAdapter::new();
        let config = Config::for_tests();
        let registry = Arc::new(AdapterRegistry::with_mock(&config, mock.clone()).unwrap());
        let executor = Arc::new(Executor::new(
            vault,
            RetryPolicy {
                max_attempts: 2,
                base_delay: Duration::from_millis(1),
                max_delay: Duration::from_millis(10),
            },
        ));
        let sink = Arc::new(MemorySink::default());
        let engine = DispatchEngine::new(
            db.clone(),
            registry,
            executor,
            sink.clone() as Arc<dyn AnalyticsSink>,
        );
        let service = IntentService::new(db.clone(), Arc::new(UnlimitedChecker));

        Fixture {
            engine,
            service,
            db,
            mock,
            sink,
            _dir: dir,
        }
    }

    async fn due_intent(f: &Fixture, user_id: &str) -> PostIntent {
        f.service
            .create(
                user_id,
                PlatformId::Mock,
                PublishContent::text("hello world"),
                serde_json::json!({}),
                chrono::Utc::now().timestamp_millis() - 1000,
            )
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn test_dispatch_publishes_and_records() {
        let f = fixture().await;
        let intent = due_intent(&f, "u1").await;

        let result = f.engine.dispatch(&intent.id).await.unwrap();
        let DispatchResult::Published(outcome) = result else {
            panic!("expected publish");
        };
        assert_eq!(outcome.remote_id, "mock-1");

        let loaded = f.db.get_intent(&intent.id).await.unwrap().unwrap();
        assert_eq!(loaded.status, IntentStatus::Published);
        assert_eq!(loaded.result.unwrap().remote_id, "mock-1");

        let events = f.sink.events();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].status, IntentStatus::Published);
    }

    #[tokio::test]
    async fn test_dispatch_is_exactly_once() {
        let f = fixture().await;
        let intent = due_intent(&f, "u1").await;

        f.engine.dispatch(&intent.id).await.unwrap();
        // Second dispatch of a terminal intent does nothing
        let result = f.engine.dispatch(&intent.id).await.unwrap();
        assert!(matches!(result, DispatchResult::Skipped));
        assert_eq!(f.mock.publish_calls(), 1);
    }

    #[tokio::test]
    async fn test_terminal_platform_error_fails_intent() {
        let f = fixture().await;
        let intent = due_intent(&f, "u1").await;
        f.mock.push_publish(Err(PlatformError::Upstream {
            status: 422,
            body: "post too long".to_string(),
        }));

        let result = f.engine.dispatch(&intent.id).await.unwrap();
        let DispatchResult::Failed(snapshot) = result else {
            panic!("expected failure");
        };
        assert_eq!(snapshot.upstream_status, Some(422));
        assert!(!snapshot.correlation_id.is_empty());

        let loaded = f.db.get_intent(&intent.id).await.unwrap().unwrap();
        assert_eq!(loaded.status, IntentStatus::Failed);
        assert_eq!(loaded.last_error.unwrap().upstream_body.as_deref(), Some("post too long"));
    }

    #[tokio::test]
    async fn test_missing_credential_fails_without_platform_call() {
        let f = fixture().await;
        let intent = due_intent(&f, "unconnected").await;

        let result = f.engine.dispatch(&intent.id).await.unwrap();
        assert!(matches!(result, DispatchResult::Failed(_)));
        assert_eq!(f.mock.publish_calls(), 0);

        let loaded = f.db.get_intent(&intent.id).await.unwrap().unwrap();
        let message = loaded.last_error.unwrap().message;
        assert!(
            message.contains("No connected account for user unconnected on mock"),
            "unexpected message: {}",
            message
        );
    }

    #[tokio::test]
    async fn test_create_rejects_empty_content() {
        let f = fixture().await;
        let err = f
            .service
            .create(
                "u1",
                PlatformId::Mock,
                PublishContent::text("   "),
                serde_json::json!({}),
                0,
            )
            .await
            .unwrap_err();
        assert!(matches!(err, SyndicaError::InvalidInput(_)));
    }

    #[tokio::test]
    async fn test_create_enforces_quota() {
        let f = fixture().await;
        let service = IntentService::new(
            f.db.clone(),
            Arc::new(crate::billing::PlanLimitChecker::new(
                f.db.clone(),
                crate::billing::Plan {
                    name: "starter".to_string(),
                    daily_publish_limit: Some(1),
                },
            )),
        );

        service
            .create(
                "u1",
                PlatformId::Mock,
                PublishContent::text("one"),
                serde_json::json!({}),
                0,
            )
            .await
            .unwrap();
        let err = service
            .create(
                "u1",
                PlatformId::Mock,
                PublishContent::text("two"),
                serde_json::json!({}),
                0,
            )
            .await
            .unwrap_err();
        assert!(matches!(err, SyndicaError::QuotaExceeded { .. }));
    }

    #[tokio::test]
    async fn test_cancel_paths() {
        let f = fixture().await;
        let intent = due_intent(&f, "u1").await;
        f.service.cancel(&intent.id).await.unwrap();

        assert!(f.service.cancel("nope").await.is_err());

        let published = due_intent(&f, "u1").await;
        f.engine.dispatch(&published.id).await.unwrap();
        let err = f.service.cancel(&published.id).await.unwrap_err();
        assert!(format!("{}", err).contains("published"));
    }

    #[tokio::test]
    async fn test_redispatch_creates_new_intent() {
        let f = fixture().await;
        let intent = due_intent(&f, "u1").await;
        f.mock.push_publish(Err(PlatformError::Upstream {
            status: 400,
            body: String::new(),
        }));
        f.engine.dispatch(&intent.id).await.unwrap();

        let replacement = f.service.redispatch(&intent.id).await.unwrap();
        assert_ne!(replacement.id, intent.id);
        assert_eq!(replacement.status, IntentStatus::Scheduled);
        assert_eq!(replacement.content.text, "hello world");

        // The failed record keeps its history
        let original = f.db.get_intent(&intent.id).await.unwrap().unwrap();
        assert_eq!(original.status, IntentStatus::Failed);
    }

    #[tokio::test]
    async fn test_redispatch_requires_failed_status() {
        let f = fixture().await;
        let intent = due_intent(&f, "u1").await;
        let err = f.service.redispatch(&intent.id).await.unwrap_err();
        assert!(format!("{}", err).contains("only failed intents"));
    }
}
