//! Configuration management for Syndica
//!
//! Key material is validated eagerly when the config is loaded so that a
//! misconfigured process fails at startup, never on first traffic.

use serde::{Deserialize, Serialize};
use std::path::PathBuf;

use crate::error::{ConfigError, Result};

/// Length in bytes of the vault encryption key and the state signing key.
pub const KEY_LEN: usize = 32;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    pub database: DatabaseConfig,
    pub vault: VaultConfig,
    pub handshake: HandshakeConfig,
    #[serde(default)]
    pub scheduler: SchedulerConfig,
    #[serde(default)]
    pub platforms: PlatformCredentials,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DatabaseConfig {
    pub path: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VaultConfig {
    /// Hex-encoded 256-bit AES key. Overridden by SYNDICA_VAULT_KEY.
    pub key: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HandshakeConfig {
    /// Hex-encoded 256-bit HMAC key for the signed state parameter.
    /// Overridden by SYNDICA_STATE_KEY.
    pub signing_key: Option<String>,
    #[serde(default = "default_handshake_ttl")]
    pub ttl_minutes: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SchedulerConfig {
    /// Seconds between sweeps.
    #[serde(default = "default_poll_interval")]
    pub poll_interval: u64,
    /// Seconds after which a dispatching claim is considered stuck.
    #[serde(default = "default_stale_claim_timeout")]
    pub stale_claim_timeout: i64,
    /// Total attempts for a platform call (including the first).
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    /// Base backoff delay in milliseconds.
    #[serde(default = "default_base_delay_ms")]
    pub base_delay_ms: u64,
    /// Overall deadline for a single outbound call, in seconds.
    #[serde(default = "default_request_timeout")]
    pub request_timeout_secs: u64,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            poll_interval: default_poll_interval(),
            stale_claim_timeout: default_stale_claim_timeout(),
            max_attempts: default_max_attempts(),
            base_delay_ms: default_base_delay_ms(),
            request_timeout_secs: default_request_timeout(),
        }
    }
}

/// OAuth client registrations, one per platform.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PlatformCredentials {
    pub buzzly: Option<OAuthClient>,
    pub loopd: Option<OAuthClient>,
    pub pagely: Option<OAuthClient>,
    /// Used only by tests; never set in a real deployment.
    pub mock: Option<OAuthClient>,
}

impl PlatformCredentials {
    pub fn for_platform(&self, platform: crate::platforms::PlatformId) -> Option<&OAuthClient> {
        use crate::platforms::PlatformId;
        match platform {
            PlatformId::Buzzly => self.buzzly.as_ref(),
            PlatformId::Loopd => self.loopd.as_ref(),
            PlatformId::Pagely => self.pagely.as_ref(),
            PlatformId::Mock => self.mock.as_ref(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OAuthClient {
    pub client_id: String,
    pub client_secret: String,
    pub redirect_uri: String,
}

fn default_handshake_ttl() -> i64 {
    15
}

fn default_poll_interval() -> u64 {
    60
}

fn default_stale_claim_timeout() -> i64 {
    600
}

fn default_max_attempts() -> u32 {
    3
}

fn default_base_delay_ms() -> u64 {
    1000
}

fn default_request_timeout() -> u64 {
    30
}

impl Config {
    /// Load configuration from the default location
    pub fn load() -> Result<Self> {
        let config_path = resolve_config_path()?;
        Self::load_from_path(&config_path)
    }

    /// Load configuration from a specific path
    pub fn load_from_path(path: &PathBuf) -> Result<Self> {
        let content = std::fs::read_to_string(path).map_err(ConfigError::ReadError)?;
        let mut config: Config = toml::from_str(&content).map_err(ConfigError::ParseError)?;
        config.apply_env_overrides();
        config.validate()?;
        Ok(config)
    }

    /// Pull key material from the environment when present.
    fn apply_env_overrides(&mut self) {
        if let Ok(key) = std::env::var("SYNDICA_VAULT_KEY") {
            self.vault.key = Some(key);
        }
        if let Ok(key) = std::env::var("SYNDICA_STATE_KEY") {
            self.handshake.signing_key = Some(key);
        }
    }

    /// Validate the config, in particular that both 256-bit keys are present
    /// and well-formed. Called at load time so misconfiguration surfaces
    /// before any traffic is served.
    pub fn validate(&self) -> Result<()> {
        self.vault_key()?;
        self.state_signing_key()?;
        if self.handshake.ttl_minutes <= 0 {
            return Err(ConfigError::MissingField("handshake.ttl_minutes".to_string()).into());
        }
        Ok(())
    }

    /// The decoded vault encryption key.
    pub fn vault_key(&self) -> Result<[u8; KEY_LEN]> {
        decode_key("vault.key", self.vault.key.as_deref())
    }

    /// The decoded state-parameter signing key.
    pub fn state_signing_key(&self) -> Result<[u8; KEY_LEN]> {
        decode_key("handshake.signing_key", self.handshake.signing_key.as_deref())
    }

    /// A valid config with throwaway keys, for use in tests.
    pub fn for_tests() -> Self {
        let key = "01".repeat(KEY_LEN);
        Config {
            database: DatabaseConfig {
                path: ":memory:".to_string(),
            },
            vault: VaultConfig {
                key: Some(key.clone()),
            },
            handshake: HandshakeConfig {
                signing_key: Some(key),
                ttl_minutes: 15,
            },
            scheduler: SchedulerConfig::default(),
            platforms: PlatformCredentials::default(),
        }
    }
}

fn decode_key(name: &str, hex: Option<&str>) -> Result<[u8; KEY_LEN]> {
    let hex = hex.ok_or_else(|| ConfigError::MissingField(name.to_string()))?;
    let bytes = decode_hex(hex).ok_or(ConfigError::InvalidKey {
        name: name.to_string(),
        expected: KEY_LEN,
    })?;
    let key: [u8; KEY_LEN] = bytes.try_into().map_err(|_| ConfigError::InvalidKey {
        name: name.to_string(),
        expected: KEY_LEN,
    })?;
    Ok(key)
}

fn decode_hex(s: &str) -> Option<Vec<u8>> {
    if s.len() % 2 != 0 {
        return None;
    }
    (0..s.len())
        .step_by(2)
        .map(|i| u8::from_str_radix(&s[i..i + 2], 16).ok())
        .collect()
}

/// Resolve the configuration file path following XDG Base Directory spec
pub fn resolve_config_path() -> Result<PathBuf> {
    if let Ok(path) = std::env::var("SYNDICA_CONFIG") {
        return Ok(PathBuf::from(shellexpand::tilde(&path).to_string()));
    }

    let config_dir = dirs::config_dir()
        .ok_or_else(|| ConfigError::MissingField("config directory".to_string()))?;

    Ok(config_dir.join("syndica").join("config.toml"))
}

/// Resolve the data directory path following XDG Base Directory spec
pub fn resolve_data_path() -> Result<PathBuf> {
    let data_dir = dirs::data_dir()
        .ok_or_else(|| ConfigError::MissingField("data directory".to_string()))?;

    Ok(data_dir.join("syndica"))
}

#[cfg(test)]
mod tests {
    use super::*;

    const TEST_KEY: &str = "0101010101010101010101010101010101010101010101010101010101010101";

    fn base_config() -> Config {
        Config {
            database: DatabaseConfig {
                path: ":memory:".to_string(),
            },
            vault: VaultConfig {
                key: Some(TEST_KEY.to_string()),
            },
            handshake: HandshakeConfig {
                signing_key: Some(TEST_KEY.to_string()),
                ttl_minutes: 15,
            },
            scheduler: SchedulerConfig::default(),
            platforms: PlatformCredentials::default(),
        }
    }

    #[test]
    fn test_valid_config_passes_validation() {
        assert!(base_config().validate().is_ok());
    }

    #[test]
    fn test_missing_vault_key_fails_at_load() {
        let mut config = base_config();
        config.vault.key = None;
        let err = config.validate().unwrap_err();
        assert!(format!("{}", err).contains("vault.key"));
    }

    #[test]
    fn test_short_vault_key_rejected() {
        let mut config = base_config();
        config.vault.key = Some("0102".to_string());
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_non_hex_key_rejected() {
        let mut config = base_config();
        config.vault.key = Some("zz".repeat(32));
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_vault_key_decodes() {
        let key = base_config().vault_key().unwrap();
        assert_eq!(key, [0x01; 32]);
    }

    #[test]
    fn test_zero_ttl_rejected() {
        let mut config = base_config();
        config.handshake.ttl_minutes = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_scheduler_defaults() {
        let s = SchedulerConfig::default();
        assert_eq!(s.poll_interval, 60);
        assert_eq!(s.stale_claim_timeout, 600);
        assert_eq!(s.max_attempts, 3);
        assert_eq!(s.base_delay_ms, 1000);
    }

    #[test]
    #[serial_test::serial]
    fn test_env_keys_override_config() {
        let env_key = "02".repeat(KEY_LEN);
        std::env::set_var("SYNDICA_VAULT_KEY", &env_key);
        std::env::set_var("SYNDICA_STATE_KEY", &env_key);

        let mut config = base_config();
        config.apply_env_overrides();
        assert_eq!(config.vault_key().unwrap(), [0x02; 32]);
        assert_eq!(config.state_signing_key().unwrap(), [0x02; 32]);

        std::env::remove_var("SYNDICA_VAULT_KEY");
        std::env::remove_var("SYNDICA_STATE_KEY");
    }

    #[test]
    #[serial_test::serial]
    fn test_parse_minimal_toml() {
        let toml = format!(
            r#"
            [database]
            path = "~/.local/share/syndica/syndica.db"

            [vault]
            key = "{TEST_KEY}"

            [handshake]
            signing_key = "{TEST_KEY}"
            "#
        );
        let mut config: Config = toml::from_str(&toml).unwrap();
        config.apply_env_overrides();
        // Defaults fill in scheduler and platform sections
        assert_eq!(config.handshake.ttl_minutes, 15);
        assert_eq!(config.scheduler.poll_interval, 60);
        assert!(config.platforms.buzzly.is_none());
    }
}
