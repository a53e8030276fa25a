//! Scheduler loop
//!
//! Periodically sweeps the intent table: stuck claims from dead workers are
//! returned to the pool first, then every due intent is dispatched. The
//! dispatch engine's atomic claim makes sweeps safe to overlap across
//! processes, so the sweep itself stays simple.
//!
//! `sweep` takes the clock as an argument and owns no background state, so
//! tests drive it directly with a synthetic `now`.

use futures::future::join_all;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error, info};

use crate::config::SchedulerConfig;
use crate::db::Database;
use crate::dispatch::{DispatchEngine, DispatchResult};
use crate::error::Result;

/// What one sweep did.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SweepStats {
    /// Stuck claims returned to the scheduled pool.
    pub reclaimed: u64,
    pub published: usize,
    pub failed: usize,
    /// Claim races lost to another dispatcher.
    pub skipped: usize,
    /// Expired handshakes purged as sweep housekeeping.
    pub purged_handshakes: u64,
}

/// Run one sweep at the given time.
///
/// Dispatches run concurrently; one intent's failure never affects the
/// others, and infrastructure errors are logged and counted rather than
/// aborting the sweep.
pub async fn sweep(
    db: &Database,
    engine: &DispatchEngine,
    config: &SchedulerConfig,
    now: i64,
) -> Result<SweepStats> {
    let mut stats = SweepStats::default();

    let cutoff = now - config.stale_claim_timeout * 1000;
    stats.reclaimed = db.reclaim_stale(cutoff).await?;
    if stats.reclaimed > 0 {
        info!(reclaimed = stats.reclaimed, "returned stale claims to the pool");
    }

    stats.purged_handshakes = db.purge_expired_handshakes(now).await?;

    let due = db.due_intents(now).await?;
    if due.is_empty() {
        return Ok(stats);
    }
    debug!(due = due.len(), "dispatching due intents");

    let dispatches = due.iter().map(|intent| {
        let intent_id = intent.id.clone();
        async move {
            match engine.dispatch(&intent_id).await {
                Ok(result) => Some(result),
                Err(error) => {
                    error!(intent_id = %intent_id, error = %error, "dispatch errored");
                    None
                }
            }
        }
    });

    for result in join_all(dispatches).await {
        match result {
            Some(DispatchResult::Published(_)) => stats.published += 1,
            Some(DispatchResult::Failed(_)) => stats.failed += 1,
            Some(DispatchResult::Skipped) | None => stats.skipped += 1,
        }
    }

    info!(
        published = stats.published,
        failed = stats.failed,
        skipped = stats.skipped,
        "sweep complete"
    );
    Ok(stats)
}

/// The long-running scheduler.
pub struct Scheduler {
    db: Database,
    engine: Arc<DispatchEngine>,
    config: SchedulerConfig,
    shutdown: Arc<AtomicBool>,
}

impl Scheduler {
    pub fn new(
        db: Database,
        engine: Arc<DispatchEngine>,
        config: SchedulerConfig,
        shutdown: Arc<AtomicBool>,
    ) -> Self {
        Self {
            db,
            engine,
            config,
            shutdown,
        }
    }

    /// One sweep at the current time.
    pub async fn run_once(&self) -> Result<SweepStats> {
        sweep(
            &self.db,
            &self.engine,
            &self.config,
            chrono::Utc::now().timestamp_millis(),
        )
        .await
    }

    /// Sweep until shutdown is requested. A sweep that errors (storage
    /// unavailable and the like) is logged and retried on the next tick.
    pub async fn run(&self) {
        info!(
            poll_interval = self.config.poll_interval,
            "scheduler started"
        );
        while !self.shutdown.load(Ordering::SeqCst) {
            if let Err(error) = self.run_once().await {
                error!(error = %error, "sweep failed");
            }
            self.idle(Duration::from_secs(self.config.poll_interval))
                .await;
        }
        info!("scheduler stopped");
    }

    /// Sleep between sweeps in one-second slices so shutdown is prompt.
    async fn idle(&self, total: Duration) {
        const SLICE: Duration = Duration::from_secs(1);
        let mut remaining = total;
        while remaining > Duration::ZERO && !self.shutdown.load(Ordering::SeqCst) {
            let step = remaining.min(SLICE);
            tokio::time::sleep(step).await;
            remaining = remaining.saturating_sub(step);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::billing::{MemorySink, UnlimitedChecker};
    use crate::config::Config;
    use crate::dispatch::IntentService;
    use crate::error::PlatformError;
    use crate::executor::{Executor, RetryPolicy};
    use crate::platforms::mock::MockAdapter;
    use crate::platforms::{AdapterRegistry, PlatformId};
    use crate::types::{IntentStatus, PublishContent};
    use crate::vault::{Credential, Vault};
    use secrecy::SecretString;

    struct Fixture {
        db: Database,
        engine: Arc<DispatchEngine>,
        service: IntentService,
        mock: MockAdapter,
        config: SchedulerConfig,
        _dir: tempfile::TempDir,
    }

    async fn fixture() -> Fixture {
        let dir = tempfile::tempdir().unwrap();
        let db_path = dir.path().join("scheduler.db");
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
        let app_config = Config::for_tests();
        let registry = Arc::new(AdapterRegistry::with_mock(&app_config, mock.clone()).unwrap());
        let executor = Arc::new(Executor::new(
            vault,
            RetryPolicy {
                max_attempts: 2,
                base_delay: Duration::from_millis(1),
                max_delay: Duration::from_millis(10),
            },
        ));
        let engine = Arc::new(DispatchEngine::new(
            db.clone(),
            registry,
            executor,
            Arc::new(MemorySink::default()),
        ));
        let service = IntentService::new(db.clone(), Arc::new(UnlimitedChecker));

        Fixture {
            db,
            engine,
            service,
            mock,
            config: SchedulerConfig {
                stale_claim_timeout: 600,
                ..Default::default()
            },
            _dir: dir,
        }
    }

    async fn schedule(f: &Fixture, text: &str, at: i64) -> String {
        f.service
            .create(
                "u1",
                PlatformId::Mock,
                PublishContent::text(text),
                serde_json::json!({}),
                at,
            )
            .await
            .unwrap()
            .id
    }

    #[tokio::test]
    async fn test_sweep_dispatches_only_due_intents() {
        let f = fixture().await;
        let now = chrono::Utc::now().timestamp_millis();
        let due = schedule(&f, "due", now - 1000).await;
        let future = schedule(&f, "future", now + 60_000).await;

        let stats = sweep(&f.db, &f.engine, &f.config, now).await.unwrap();
        assert_eq!(stats.published, 1);
        assert_eq!(stats.failed, 0);

        let due_row = f.db.get_intent(&due).await.unwrap().unwrap();
        assert_eq!(due_row.status, IntentStatus::Published);
        let future_row = f.db.get_intent(&future).await.unwrap().unwrap();
        assert_eq!(future_row.status, IntentStatus::Scheduled);

        // Once its time arrives, the future intent goes out too
        let stats = sweep(&f.db, &f.engine, &f.config, now + 61_000).await.unwrap();
        assert_eq!(stats.published, 1);
        let future_row = f.db.get_intent(&future).await.unwrap().unwrap();
        assert_eq!(future_row.status, IntentStatus::Published);
    }

    #[tokio::test]
    async fn test_one_failure_does_not_stop_the_sweep() {
        let f = fixture().await;
        let now = chrono::Utc::now().timestamp_millis();
        schedule(&f, "first", now - 2000).await;
        schedule(&f, "second", now - 1000).await;

        // One of the two dispatches fails terminally
        f.mock.push_publish(Err(PlatformError::Upstream {
            status: 400,
            body: String::new(),
        }));

        let stats = sweep(&f.db, &f.engine, &f.config, now).await.unwrap();
        assert_eq!(stats.published + stats.failed, 2);
        assert_eq!(stats.failed, 1);
    }

    #[tokio::test]
    async fn test_sweep_reclaims_stale_claims() {
        let f = fixture().await;
        let now = chrono::Utc::now().timestamp_millis();
        let id = schedule(&f, "stuck", now - 1000).await;

        // Simulate a worker that claimed long ago and died
        let long_ago = now - f.config.stale_claim_timeout * 1000 - 1000;
        assert!(f.db.claim_intent(&id, long_ago).await.unwrap());

        let stats = sweep(&f.db, &f.engine, &f.config, now).await.unwrap();
        assert_eq!(stats.reclaimed, 1);
        // The reclaimed intent dispatched in the same sweep
        assert_eq!(stats.published, 1);
    }

    #[tokio::test]
    async fn test_fresh_claim_not_reclaimed() {
        let f = fixture().await;
        let now = chrono::Utc::now().timestamp_millis();
        let id = schedule(&f, "in flight", now - 1000).await;
        assert!(f.db.claim_intent(&id, now).await.unwrap());

        let stats = sweep(&f.db, &f.engine, &f.config, now).await.unwrap();
        assert_eq!(stats.reclaimed, 0);
        assert_eq!(stats.published, 0);
        assert_eq!(f.mock.publish_calls(), 0);
    }

    #[tokio::test]
    async fn test_overlapping_sweeps_publish_once() {
        let f = fixture().await;
        let now = chrono::Utc::now().timestamp_millis();
        schedule(&f, "contested", now - 1000).await;

        let (a, b) = tokio::join!(
            sweep(&f.db, &f.engine, &f.config, now),
            sweep(&f.db, &f.engine, &f.config, now),
        );
        let (a, b) = (a.unwrap(), b.unwrap());

        assert_eq!(a.published + b.published, 1);
        assert_eq!(f.mock.publish_calls(), 1);
    }

    #[tokio::test]
    async fn test_failed_intent_never_swept_again() {
        let f = fixture().await;
        let now = chrono::Utc::now().timestamp_millis();
        let id = schedule(&f, "doomed", now - 1000).await;
        f.mock.push_publish(Err(PlatformError::Upstream {
            status: 422,
            body: String::new(),
        }));

        let stats = sweep(&f.db, &f.engine, &f.config, now).await.unwrap();
        assert_eq!(stats.failed, 1);

        // Later sweeps leave the failed intent alone
        let stats = sweep(&f.db, &f.engine, &f.config, now + 60_000).await.unwrap();
        assert_eq!(stats, SweepStats::default());
        assert_eq!(f.mock.publish_calls(), 1);

        let row = f.db.get_intent(&id).await.unwrap().unwrap();
        assert_eq!(row.status, IntentStatus::Failed);
    }

    #[tokio::test]
    async fn test_empty_sweep_is_quiet() {
        let f = fixture().await;
        let stats = sweep(
            &f.db,
            &f.engine,
            &f.config,
            chrono::Utc::now().timestamp_millis(),
        )
        .await
        .unwrap();
        assert_eq!(stats, SweepStats::default());
    }

    #[tokio::test]
    async fn test_scheduler_run_stops_on_shutdown() {
        let f = fixture().await;
        let shutdown = Arc::new(AtomicBool::new(false));
        let scheduler = Scheduler::new(
            f.db.clone(),
            f.engine.clone(),
            SchedulerConfig {
                poll_interval: 1,
                ..f.config.clone()
            },
            shutdown.clone(),
        );

        let handle = tokio::spawn(async move { scheduler.run().await });
        tokio::time::sleep(Duration::from_millis(50)).await;
        shutdown.store(true, Ordering::SeqCst);

        tokio::time::timeout(Duration::from_secs(3), handle)
            .await
            .expect("scheduler should stop promptly")
            .unwrap();
    }
}
