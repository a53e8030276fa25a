//! Core types for Syndica

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use uuid::Uuid;

use crate::platforms::PlatformId;

/// One unit of content to publish: opaque text plus ordered media references.
///
/// The core never generates content; it arrives fully formed from the
/// content/AI collaborator.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PublishContent {
    pub text: String,
    #[serde(default)]
    pub media_urls: Vec<String>,
}

impl PublishContent {
    pub fn text(text: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            media_urls: Vec::new(),
        }
    }
}

/// A requested publish action, scheduled or immediate.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PostIntent {
    pub id: String,
    pub user_id: String,
    pub platform: PlatformId,
    pub content: PublishContent,
    /// Platform-specific options, passed through to the adapter untouched.
    pub options: serde_json::Value,
    /// Epoch millis; "now" intents carry the creation time.
    pub scheduled_at: i64,
    pub status: IntentStatus,
    /// Present only once published.
    pub result: Option<PublishOutcome>,
    /// Present only once failed.
    pub last_error: Option<ErrorSnapshot>,
    pub created_at: i64,
}

impl PostIntent {
    pub fn new(
        user_id: String,
        platform: PlatformId,
        content: PublishContent,
        options: serde_json::Value,
        scheduled_at: i64,
    ) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            user_id,
            platform,
            content,
            options,
            scheduled_at,
            status: IntentStatus::Scheduled,
            result: None,
            last_error: None,
            created_at: chrono::Utc::now().timestamp_millis(),
        }
    }
}

/// Intent lifecycle. Transitions are monotonic:
/// scheduled → dispatching → published | failed.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, sqlx::Type, PartialEq, Eq)]
#[sqlx(type_name = "TEXT", rename_all = "lowercase")]
#[serde(rename_all = "lowercase")]
pub enum IntentStatus {
    Scheduled,
    Dispatching,
    Published,
    Failed,
}

impl std::fmt::Display for IntentStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Scheduled => write!(f, "scheduled"),
            Self::Dispatching => write!(f, "dispatching"),
            Self::Published => write!(f, "published"),
            Self::Failed => write!(f, "failed"),
        }
    }
}

/// Normalized result of a successful publish.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PublishOutcome {
    pub remote_id: String,
    pub canonical_url: String,
}

/// Structured failure retained on a failed intent.
///
/// Human-readable `message` is kept distinct from the raw upstream payload;
/// neither ever contains secret material.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorSnapshot {
    pub message: String,
    pub upstream_status: Option<u16>,
    pub upstream_body: Option<String>,
    pub correlation_id: String,
}

impl ErrorSnapshot {
    pub fn from_platform_error(error: &crate::error::PlatformError, correlation_id: String) -> Self {
        use crate::error::PlatformError;
        match error {
            PlatformError::Upstream { status, body } => Self {
                message: format!("Platform returned HTTP {}", status),
                upstream_status: Some(*status),
                upstream_body: Some(body.clone()),
                correlation_id,
            },
            PlatformError::RateLimited { .. } => Self {
                message: "Platform rate limit exhausted the retry budget".to_string(),
                upstream_status: Some(429),
                upstream_body: None,
                correlation_id,
            },
            other => Self {
                message: other.to_string(),
                upstream_status: None,
                upstream_body: None,
                correlation_id,
            },
        }
    }
}

/// Derive the idempotency token used to tag an outbound write.
///
/// Stable across retries within a single executor call (the salt is fixed
/// when the call starts), so a platform that supports idempotency reconciles
/// a retried request to a single created resource.
pub fn idempotency_token(
    platform: PlatformId,
    user_id: &str,
    content: &PublishContent,
    salt_millis: i64,
) -> String {
    let mut hasher = Sha256::new();
    hasher.update(platform.as_str().as_bytes());
    hasher.update(b"\x1f");
    hasher.update(user_id.as_bytes());
    hasher.update(b"\x1f");
    hasher.update(content.text.as_bytes());
    for url in &content.media_urls {
        hasher.update(b"\x1f");
        hasher.update(url.as_bytes());
    }
    hasher.update(b"\x1f");
    hasher.update(salt_millis.to_be_bytes());
    let digest = hasher.finalize();
    digest.iter().map(|b| format!("{:02x}", b)).collect()
}
