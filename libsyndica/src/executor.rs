//! Resilient request executor
//!
//! Wraps every outbound platform call with bounded exponential backoff and
//! one credential-refresh cycle. Retry decisions key off the error variant:
//! network trouble, rate limiting, and 5xx responses are retried; other 4xx
//! responses are terminal. An expired credential triggers exactly one
//! refresh-and-retry outside the attempt budget, so a refresh can never
//! loop.
//!
//! The same idempotency token is attached to every attempt of one call, so
//! platforms that support deduplication collapse retries into one resource.

use rand::Rng;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

use crate::config::SchedulerConfig;
use crate::error::{PlatformError, Result, SyndicaError, VaultError};
use crate::platforms::{PlatformAdapter, PlatformId, RefreshFlow};
use crate::types::{idempotency_token, PublishContent, PublishOutcome};
use crate::vault::{Credential, Vault};

/// Retry behavior for one executor.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    /// Total attempts, including the first.
    pub max_attempts: u32,
    /// Backoff for attempt n is `base_delay * 2^(n-1)` plus up to 30%
    /// jitter.
    pub base_delay: Duration,
    /// Ceiling for any single wait, including provider Retry-After hints.
    pub max_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(60),
        }
    }
}

impl RetryPolicy {
    pub fn from_config(config: &SchedulerConfig) -> Self {
        Self {
            max_attempts: config.max_attempts,
            base_delay: Duration::from_millis(config.base_delay_ms),
            ..Default::default()
        }
    }
}

/// What one executor call did, for logging and tests.
#[derive(Debug, Clone, Default)]
pub struct ExecutionReport {
    /// Publish attempts made.
    pub attempts: u32,
    /// Waits taken between attempts, in order.
    pub delays: Vec<Duration>,
    /// Whether the refresh-and-retry cycle ran.
    pub refreshed: bool,
}

pub struct Executor {
    vault: Vault,
    policy: RetryPolicy,
    shutdown: Arc<AtomicBool>,
}

impl Executor {
    pub fn new(vault: Vault, policy: RetryPolicy) -> Self {
        Self {
            vault,
            policy,
            shutdown: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Share a shutdown flag; a pending backoff wait aborts when it flips.
    pub fn with_shutdown(mut self, shutdown: Arc<AtomicBool>) -> Self {
        self.shutdown = shutdown;
        self
    }

    /// Publish through the adapter with retries and at most one credential
    /// refresh.
    ///
    /// # Errors
    ///
    /// `SyndicaError::NotConnected` when the user has no credential for the
    /// platform; `PlatformError` (wrapped) when the call fails past the
    /// retry budget or terminally.
    pub async fn publish(
        &self,
        adapter: &dyn PlatformAdapter,
        user_id: &str,
        content: &PublishContent,
        options: &serde_json::Value,
    ) -> Result<(PublishOutcome, ExecutionReport)> {
        let platform = adapter.id();
        let mut credential = self.load_credential(user_id, platform).await?;

        // Fixed for the lifetime of this call so every retry carries the
        // same token.
        let token = idempotency_token(
            platform,
            user_id,
            content,
            chrono::Utc::now().timestamp_millis(),
        );

        let mut report = ExecutionReport::default();
        let mut attempt: u32 = 0;

        loop {
            attempt += 1;
            report.attempts += 1;

            let error = match adapter.publish(&credential, content, options, &token).await {
                Ok(outcome) => {
                    debug!(
                        user_id,
                        platform = %platform,
                        attempts = report.attempts,
                        refreshed = report.refreshed,
                        "publish succeeded"
                    );
                    return Ok((outcome, report));
                }
                Err(error) => error,
            };

            if error.is_auth_failure() && !report.refreshed {
                // One refresh cycle per call, outside the attempt budget.
                info!(user_id, platform = %platform, "credential rejected, refreshing");
                self.refresh_credential(adapter, user_id).await?;
                credential = self.load_credential(user_id, platform).await?;
                report.refreshed = true;
                attempt -= 1;
                continue;
            }

            if !error.is_transient() || attempt >= self.policy.max_attempts {
                warn!(
                    user_id,
                    platform = %platform,
                    attempts = report.attempts,
                    error = %error,
                    "publish failed"
                );
                return Err(error.into());
            }

            let delay = self.next_delay(attempt, &error);
            debug!(
                user_id,
                platform = %platform,
                attempt,
                delay_ms = delay.as_millis() as u64,
                "transient failure, backing off"
            );
            report.delays.push(delay);
            if !self.sleep(delay).await {
                return Err(PlatformError::Cancelled.into());
            }
        }
    }

    /// Run the platform's refresh flow and persist the result. On any
    /// failure the stored credential is left untouched.
    pub async fn refresh_credential(
        &self,
        adapter: &dyn PlatformAdapter,
        user_id: &str,
    ) -> Result<()> {
        let platform = adapter.id();
        let credential = self.load_credential(user_id, platform).await?;
        let update = adapter.refresh(&credential).await?;

        if adapter.descriptor().refresh_flow == RefreshFlow::RotatingRefreshToken
            && update.refresh_secret.is_none()
        {
            // A rotating provider that withholds the new refresh token
            // would orphan the connection on the next renewal.
            warn!(user_id, platform = %platform, "refresh response missing rotated token");
        }

        self.vault.update(user_id, platform, update).await?;
        info!(user_id, platform = %platform, "credential refreshed");
        Ok(())
    }

    /// Fetch the stored credential, naming the disconnected account when
    /// there is none.
    async fn load_credential(&self, user_id: &str, platform: PlatformId) -> Result<Credential> {
        match self.vault.retrieve(user_id, platform).await {
            Err(SyndicaError::Vault(VaultError::NotFound(_))) => Err(SyndicaError::NotConnected {
                user_id: user_id.to_string(),
                platform: platform.to_string(),
            }),
            other => other,
        }
    }

    /// Backoff for the attempt just failed, honoring a provider
    /// Retry-After hint and capping at the policy ceiling.
    fn next_delay(&self, attempt: u32, error: &PlatformError) -> Duration {
        let exponential = self
            .policy
            .base_delay
            .saturating_mul(1u32 << (attempt - 1).min(16));
        let jittered = exponential.mul_f64(1.0 + rand::thread_rng().gen_range(0.0..0.3));

        let floor = match error {
            PlatformError::RateLimited {
                retry_after_secs: Some(secs),
            } => Duration::from_secs(*secs),
            _ => Duration::ZERO,
        };

        jittered.max(floor).min(self.policy.max_delay)
    }

    /// Sleep in slices so shutdown interrupts a long backoff. Returns false
    /// when shutdown was requested.
    async fn sleep(&self, total: Duration) -> bool {
        const SLICE: Duration = Duration::from_secs(1);
        let mut remaining = total;
        while remaining > Duration::ZERO {
            if self.shutdown.load(Ordering::SeqCst) {
                return false;
            }
            let step = remaining.min(SLICE);
            tokio::time::sleep(step).await;
            remaining = remaining.saturating_sub(step);
        }
        !self.shutdown.load(Ordering::SeqCst)
    }
}
