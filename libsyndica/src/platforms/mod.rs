//! Platform adapter registry
//!
//! One row of static configuration per platform plus one adapter that maps
//! normalized content onto the platform's native publish call. Adding a
//! platform means adding a `PlatformId` variant, a descriptor row, and an
//! adapter — the compiler flags every match that needs extending, so a new
//! platform cannot be silently missed at runtime.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::error::PlatformError;
use crate::types::{PublishContent, PublishOutcome};
use crate::vault::{Credential, CredentialUpdate};

pub mod buzzly;
pub mod loopd;
pub mod pagely;

// Mock adapter is available for all builds (not just tests) to support
// integration tests in dependent crates.
pub mod mock;

/// Identifier for a supported platform.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "TEXT", rename_all = "lowercase")]
#[serde(rename_all = "lowercase")]
pub enum PlatformId {
    Buzzly,
    Loopd,
    Pagely,
    Mock,
}

impl PlatformId {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Buzzly => "buzzly",
            Self::Loopd => "loopd",
            Self::Pagely => "pagely",
            Self::Mock => "mock",
        }
    }

    pub fn from_str_opt(s: &str) -> Option<Self> {
        match s {
            "buzzly" => Some(Self::Buzzly),
            "loopd" => Some(Self::Loopd),
            "pagely" => Some(Self::Pagely),
            "mock" => Some(Self::Mock),
            _ => None,
        }
    }
}

impl std::fmt::Display for PlatformId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// How a platform renews an expired credential.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RefreshFlow {
    /// Standard OAuth refresh grant; the provider rotates the refresh token
    /// on every use.
    RotatingRefreshToken,
    /// No refresh token: the still-valid long-lived token is re-exchanged
    /// for a fresh one before it expires.
    ReExchangeLongLived,
    /// Refreshing the primary user token also requires renewing the
    /// secondary page/channel token derived from it.
    PageTokenChain,
}

/// Static per-platform configuration.
#[derive(Debug, Clone)]
pub struct PlatformDescriptor {
    pub id: PlatformId,
    pub authorize_url: &'static str,
    pub token_url: &'static str,
    pub scopes: &'static [&'static str],
    pub pkce_required: bool,
    pub refresh_flow: RefreshFlow,
    /// Whether the platform's write API accepts an idempotency key header.
    pub supports_idempotency: bool,
}

/// The descriptor table. One row per platform.
pub fn descriptor(id: PlatformId) -> &'static PlatformDescriptor {
    match id {
        PlatformId::Buzzly => &buzzly::DESCRIPTOR,
        PlatformId::Loopd => &loopd::DESCRIPTOR,
        PlatformId::Pagely => &pagely::DESCRIPTOR,
        PlatformId::Mock => &mock::DESCRIPTOR,
    }
}

/// A platform adapter: publishes one unit of content and refreshes
/// credentials according to the platform's grant shape.
///
/// Adapters contain no retry logic; every call is routed through the
/// resilient executor.
#[async_trait]
pub trait PlatformAdapter: Send + Sync {
    fn id(&self) -> PlatformId;

    fn descriptor(&self) -> &'static PlatformDescriptor {
        descriptor(self.id())
    }

    /// Publish one unit of content.
    ///
    /// `idempotency_token` is attached to the outbound write where the
    /// platform supports deduplication.
    ///
    /// # Errors
    ///
    /// `PlatformError::AuthExpired` when the credential is rejected,
    /// `PlatformError::Network`/`RateLimited`/`Upstream` for transport and
    /// provider failures. The executor decides what is retryable.
    async fn publish(
        &self,
        credential: &Credential,
        content: &PublishContent,
        options: &serde_json::Value,
        idempotency_token: &str,
    ) -> Result<PublishOutcome, PlatformError>;

    /// Exchange an authorization code for a full credential, completing the
    /// authorize leg. `pkce_verifier` is present iff the platform's
    /// descriptor requires PKCE.
    async fn exchange(
        &self,
        code: &str,
        pkce_verifier: Option<&str>,
    ) -> Result<Credential, PlatformError>;

    /// Renew the credential according to the platform's refresh flow.
    ///
    /// Returns only the fields that changed; the vault merges and
    /// re-encrypts them. A failed refresh must return an error without
    /// partial results — the vault is never mutated on failure.
    async fn refresh(&self, credential: &Credential)
        -> Result<CredentialUpdate, PlatformError>;
}

/// Typed registry over the shipped adapters.
pub struct AdapterRegistry {
    buzzly: buzzly::BuzzlyAdapter,
    loopd: loopd::LoopdAdapter,
    pagely: pagely::PagelyAdapter,
    mock: Option<mock::MockAdapter>,
}

impl AdapterRegistry {
    /// Build the registry with HTTP adapters for every real platform.
    ///
    /// # Errors
    ///
    /// Returns an error if the shared HTTP client cannot be constructed.
    pub fn new(config: &crate::config::Config) -> crate::error::Result<Self> {
        let timeout = std::time::Duration::from_secs(config.scheduler.request_timeout_secs);
        let client = reqwest::Client::builder()
            .connect_timeout(std::time::Duration::from_secs(10))
            .timeout(timeout)
            .build()
            .map_err(|e| PlatformError::Network(e.to_string()))?;

        Ok(Self {
            buzzly: buzzly::BuzzlyAdapter::new(client.clone(), config.platforms.buzzly.clone()),
            loopd: loopd::LoopdAdapter::new(client.clone(), config.platforms.loopd.clone()),
            pagely: pagely::PagelyAdapter::new(client, config.platforms.pagely.clone()),
            mock: None,
        })
    }

    /// Registry with a mock adapter wired in, for tests.
    pub fn with_mock(config: &crate::config::Config, mock: mock::MockAdapter) -> crate::error::Result<Self> {
        let mut registry = Self::new(config)?;
        registry.mock = Some(mock);
        Ok(registry)
    }

    /// Look up the adapter for a platform.
    ///
    /// Returns `None` only for `Mock` when no mock was installed; real
    /// platforms always resolve.
    pub fn adapter(&self, id: PlatformId) -> Option<&dyn PlatformAdapter> {
        match id {
            PlatformId::Buzzly => Some(&self.buzzly),
            PlatformId::Loopd => Some(&self.loopd),
            PlatformId::Pagely => Some(&self.pagely),
            PlatformId::Mock => self.mock.as_ref().map(|m| m as &dyn PlatformAdapter),
        }
    }
}

/// Map an HTTP response status and body to a `PlatformError`.
///
/// Shared by all HTTP adapters so retryability is classified in one place:
/// 401 means the credential is stale, 429 is rate limiting, 5xx is upstream
/// trouble; every other 4xx is terminal.
pub(crate) fn classify_response(status: u16, body: String, retry_after: Option<u64>) -> PlatformError {
    match status {
        401 => PlatformError::AuthExpired(scrub(&body)),
        429 => PlatformError::RateLimited {
            retry_after_secs: retry_after,
        },
        s => PlatformError::Upstream {
            status: s,
            body: scrub(&body),
        },
    }
}

/// Consume a non-success HTTP response into a `PlatformError`, capturing the
/// Retry-After header before the body is drained.
pub(crate) async fn error_from_response(response: reqwest::Response) -> PlatformError {
    let status = response.status().as_u16();
    let retry_after = response
        .headers()
        .get(reqwest::header::RETRY_AFTER)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.parse::<u64>().ok());
    let body = response.text().await.unwrap_or_default();
    classify_response(status, body, retry_after)
}

/// Like [`error_from_response`], but for token endpoints: a rejected grant
/// is terminal for the credential, so non-transient failures collapse into
/// `RefreshFailed`.
pub(crate) async fn refresh_error(response: reqwest::Response) -> PlatformError {
    match error_from_response(response).await {
        PlatformError::Network(e) => PlatformError::Network(e),
        PlatformError::RateLimited { retry_after_secs } => {
            PlatformError::RateLimited { retry_after_secs }
        }
        other => PlatformError::RefreshFailed(other.to_string()),
    }
}

/// Truncate upstream bodies before they land in logs or error snapshots.
fn scrub(body: &str) -> String {
    const MAX: usize = 512;
    if body.len() <= MAX {
        body.to_string()
    } else {
        let cut = body
            .char_indices()
            .take_while(|(i, _)| *i < MAX)
            .last()
            .map(|(i, c)| i + c.len_utf8())
            .unwrap_or(0);
        format!("{}…", &body[..cut])
    }
}
