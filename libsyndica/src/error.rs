//! Error types for Syndica

use thiserror::Error;

pub type Result<T> = std::result::Result<T, SyndicaError>;

#[derive(Error, Debug)]
pub enum SyndicaError {
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("Database error: {0}")]
    Database(#[from] DbError),

    #[error("Vault error: {0}")]
    Vault(#[from] VaultError),

    #[error("Authorization error: {0}")]
    Auth(#[from] AuthError),

    #[error("Platform error: {0}")]
    Platform(#[from] PlatformError),

    #[error("Unsupported platform: {0}")]
    UnsupportedPlatform(String),

    #[error("No connected account for user {user_id} on {platform}")]
    NotConnected { user_id: String, platform: String },

    #[error("Quota exceeded for {resource}")]
    QuotaExceeded { resource: String },

    #[error("Invalid input: {0}")]
    InvalidInput(String),
}

impl SyndicaError {
    /// Returns the appropriate exit code for this error
    pub fn exit_code(&self) -> i32 {
        match self {
            SyndicaError::InvalidInput(_) => 3,
            SyndicaError::Auth(_) => 2,
            SyndicaError::NotConnected { .. } => 2,
            SyndicaError::Vault(VaultError::Integrity(_)) => 2,
            _ => 1,
        }
    }
}

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Failed to read config file: {0}")]
    ReadError(#[from] std::io::Error),

    #[error("Failed to parse config: {0}")]
    ParseError(#[from] toml::de::Error),

    #[error("Missing required field: {0}")]
    MissingField(String),

    #[error("Invalid key material for {name}: expected {expected} hex-encoded bytes")]
    InvalidKey { name: String, expected: usize },
}

#[derive(Error, Debug)]
pub enum DbError {
    #[error("Database operation failed: {0}")]
    SqlxError(#[from] sqlx::Error),

    #[error("Migration failed: {0}")]
    MigrationError(#[from] sqlx::migrate::MigrateError),

    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),
}

#[derive(Error, Debug)]
pub enum VaultError {
    #[error("Credential not found: {0}")]
    NotFound(String),

    #[error("Credential integrity check failed: {0}")]
    Integrity(String),

    #[error("Encryption failed: {0}")]
    Encryption(String),
}

#[derive(Error, Debug)]
pub enum AuthError {
    #[error("Invalid or expired authorization state: {0}")]
    InvalidState(String),

    #[error("Authorization handshake not found or already consumed")]
    NotFound,

    #[error("Provider denied authorization: {0}")]
    ProviderDenied(String),
}

/// Errors produced by platform adapter calls.
///
/// The executor keys its retry decisions off these variants: `Network`,
/// `RateLimited` and 5xx `Upstream` responses are transient, `AuthExpired`
/// triggers the single refresh-and-retry cycle, everything else is terminal.
#[derive(Error, Debug, Clone)]
pub enum PlatformError {
    #[error("Network error: {0}")]
    Network(String),

    #[error("Rate limit exceeded (retry after {retry_after_secs:?}s)")]
    RateLimited { retry_after_secs: Option<u64> },

    #[error("Upstream error (HTTP {status}): {body}")]
    Upstream { status: u16, body: String },

    #[error("Credential expired or revoked: {0}")]
    AuthExpired(String),

    #[error("Refresh failed: {0}")]
    RefreshFailed(String),

    #[error("Content rejected: {0}")]
    Validation(String),

    #[error("Operation cancelled by shutdown")]
    Cancelled,
}

impl PlatformError {
    /// Whether the executor may retry this error with backoff.
    pub fn is_transient(&self) -> bool {
        match self {
            PlatformError::Network(_) | PlatformError::RateLimited { .. } => true,
            PlatformError::Upstream { status, .. } => *status >= 500,
            PlatformError::AuthExpired(_)
            | PlatformError::RefreshFailed(_)
            | PlatformError::Validation(_)
            | PlatformError::Cancelled => false,
        }
    }

    /// Whether this error indicates the stored credential is no longer valid.
    pub fn is_auth_failure(&self) -> bool {
        matches!(self, PlatformError::AuthExpired(_))
            || matches!(self, PlatformError::Upstream { status: 401, .. })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_exit_code_invalid_input() {
        let error = SyndicaError::InvalidInput("Empty content".to_string());
        assert_eq!(error.exit_code(), 3);
    }

    #[test]
    fn test_exit_code_auth_errors() {
        let error = SyndicaError::Auth(AuthError::NotFound);
        assert_eq!(error.exit_code(), 2);

        let error = SyndicaError::NotConnected {
            user_id: "u1".to_string(),
            platform: "buzzly".to_string(),
        };
        assert_eq!(error.exit_code(), 2);
    }

    #[test]
    fn test_exit_code_integrity_error() {
        let error = SyndicaError::Vault(VaultError::Integrity("tag mismatch".to_string()));
        assert_eq!(error.exit_code(), 2);
    }

    #[test]
    fn test_exit_code_config_error() {
        let error = SyndicaError::Config(ConfigError::MissingField("vault.key".to_string()));
        assert_eq!(error.exit_code(), 1);
    }

    #[test]
    fn test_exit_code_quota_exceeded() {
        let error = SyndicaError::QuotaExceeded {
            resource: "scheduled_posts".to_string(),
        };
        assert_eq!(error.exit_code(), 1);
    }

    #[test]
    fn test_network_errors_are_transient() {
        assert!(PlatformError::Network("connection reset".to_string()).is_transient());
        assert!(PlatformError::RateLimited {
            retry_after_secs: Some(30)
        }
        .is_transient());
    }

    #[test]
    fn test_server_errors_are_transient() {
        assert!(PlatformError::Upstream {
            status: 500,
            body: "internal".to_string()
        }
        .is_transient());
        assert!(PlatformError::Upstream {
            status: 503,
            body: "unavailable".to_string()
        }
        .is_transient());
    }

    #[test]
    fn test_client_errors_are_not_transient() {
        assert!(!PlatformError::Upstream {
            status: 400,
            body: "bad request".to_string()
        }
        .is_transient());
        assert!(!PlatformError::Upstream {
            status: 403,
            body: "forbidden".to_string()
        }
        .is_transient());
        assert!(!PlatformError::Validation("too long".to_string()).is_transient());
    }

    #[test]
    fn test_auth_failure_detection() {
        assert!(PlatformError::AuthExpired("token invalid".to_string()).is_auth_failure());
        assert!(PlatformError::Upstream {
            status: 401,
            body: "unauthorized".to_string()
        }
        .is_auth_failure());
        assert!(!PlatformError::Upstream {
            status: 500,
            body: "internal".to_string()
        }
        .is_auth_failure());
    }

    #[test]
    fn test_auth_expired_not_retried_via_backoff() {
        // 401s go through the refresh cycle, never the backoff budget
        let error = PlatformError::AuthExpired("expired".to_string());
        assert!(!error.is_transient());
        assert!(error.is_auth_failure());
    }

    #[test]
    fn test_error_message_formatting() {
        let error = SyndicaError::UnsupportedPlatform("frendly".to_string());
        assert_eq!(format!("{}", error), "Unsupported platform: frendly");

        let error = SyndicaError::QuotaExceeded {
            resource: "scheduled_posts".to_string(),
        };
        assert_eq!(format!("{}", error), "Quota exceeded for scheduled_posts");
    }

    #[test]
    fn test_error_conversion_from_vault_error() {
        let vault_error = VaultError::NotFound("u1/buzzly".to_string());
        let error: SyndicaError = vault_error.into();
        assert!(matches!(error, SyndicaError::Vault(_)));
    }

    #[test]
    fn test_platform_error_clone() {
        // Clone is required so the executor can record attempt errors
        let original = PlatformError::Network("connection refused".to_string());
        let cloned = original.clone();
        assert_eq!(format!("{}", original), format!("{}", cloned));
    }
}
