//! Authorization handshake state machine
//!
//! Connecting a platform account runs in two legs. `begin` mints a pending
//! handshake and hands back the provider authorize URL; `complete` consumes
//! the handshake when the provider redirects back and exchanges the code
//! for a credential that lands in the vault.
//!
//! The `state` parameter is HMAC-SHA256 signed and carries its issue time,
//! so a forged, tampered, or stale callback is rejected before any storage
//! lookup happens. Handshakes are
//! single-use: consumption deletes the row atomically, and a replayed
//! callback finds nothing.

use base64::{engine::general_purpose::URL_SAFE_NO_PAD, Engine};
use hmac::{Hmac, Mac};
use rand::RngCore;
use sha2::{Digest, Sha256};
use std::sync::Arc;
use tracing::{debug, info, warn};

use crate::config::Config;
use crate::db::{Database, HandshakeRow};
use crate::error::{AuthError, Result, SyndicaError};
use crate::platforms::{descriptor, AdapterRegistry, PlatformId};
use crate::vault::Vault;

type HmacSha256 = Hmac<Sha256>;

/// Separator between the signed fields of a state parameter.
const STATE_SEP: char = '.';

/// Result of `begin`: where to send the user's browser.
#[derive(Debug, Clone)]
pub struct AuthorizeRedirect {
    pub url: String,
    pub handshake_id: String,
}

/// What the provider sent back on its redirect.
#[derive(Debug, Clone)]
pub enum Callback<'a> {
    Code(&'a str),
    Denied {
        error: &'a str,
        description: Option<&'a str>,
    },
}

/// A handshake that reached the vault.
#[derive(Debug, Clone)]
pub struct CompletedHandshake {
    pub user_id: String,
    pub platform: PlatformId,
}

pub struct HandshakeManager {
    db: Database,
    vault: Vault,
    registry: Arc<AdapterRegistry>,
    config: Config,
    signing_key: [u8; 32],
}

impl HandshakeManager {
    pub fn new(
        db: Database,
        vault: Vault,
        registry: Arc<AdapterRegistry>,
        config: Config,
    ) -> Result<Self> {
        let signing_key = config.state_signing_key()?;
        Ok(Self {
            db,
            vault,
            registry,
            config,
            signing_key,
        })
    }

    /// Start a handshake: persist the pending record and build the
    /// provider's authorize URL with signed state and, where the platform
    /// requires it, a PKCE challenge.
    pub async fn begin(&self, user_id: &str, platform: PlatformId) -> Result<AuthorizeRedirect> {
        let descriptor = descriptor(platform);
        let oauth = self
            .config
            .platforms
            .for_platform(platform)
            .ok_or_else(|| {
                crate::error::ConfigError::MissingField(format!("platforms.{}", platform))
            })?;

        let id = uuid::Uuid::new_v4().simple().to_string();
        let now = chrono::Utc::now().timestamp_millis();
        let expires_at = now + self.config.handshake.ttl_minutes * 60_000;

        let pkce = if descriptor.pkce_required {
            Some(pkce_pair())
        } else {
            None
        };

        self.db
            .insert_handshake(&HandshakeRow {
                id: id.clone(),
                user_id: user_id.to_string(),
                platform,
                pkce_verifier: pkce.as_ref().map(|(verifier, _)| verifier.clone()),
                created_at: now,
                expires_at,
            })
            .await?;

        let state = sign_state(&id, now, &self.signing_key);
        let mut url = format!(
            "{}?response_type=code&client_id={}&redirect_uri={}&scope={}&state={}",
            descriptor.authorize_url,
            urlencoding::encode(&oauth.client_id),
            urlencoding::encode(&oauth.redirect_uri),
            urlencoding::encode(&descriptor.scopes.join(" ")),
            urlencoding::encode(&state),
        );
        if let Some((_, challenge)) = &pkce {
            url.push_str(&format!(
                "&code_challenge={}&code_challenge_method=S256",
                challenge
            ));
        }

        debug!(user_id, platform = %platform, handshake_id = %id, "handshake started");
        Ok(AuthorizeRedirect {
            url,
            handshake_id: id,
        })
    }

    /// Finish a handshake from the provider's redirect.
    ///
    /// The signature and age of `state` are checked first; only then is the
    /// pending record consumed. A parameter older than the handshake TTL is
    /// rejected on its signed timestamp alone, without touching storage.
    /// Consumption happens even when the provider denied or the exchange
    /// fails, so a handshake never gets a second chance.
    ///
    /// # Errors
    ///
    /// `AuthError::InvalidState` for a bad signature or expired handshake,
    /// `AuthError::NotFound` for unknown or already-consumed state,
    /// `AuthError::ProviderDenied` when the user declined at the provider.
    pub async fn complete(
        &self,
        state: &str,
        callback: Callback<'_>,
    ) -> Result<CompletedHandshake> {
        let (id, issued_at) = verify_state(state, &self.signing_key)?;

        let now = chrono::Utc::now().timestamp_millis();
        if now.saturating_sub(issued_at) > self.config.handshake.ttl_minutes * 60_000 {
            warn!(handshake_id = %id, "state parameter past its ttl");
            return Err(AuthError::InvalidState("state expired".to_string()).into());
        }

        let row = self
            .db
            .take_handshake(&id)
            .await?
            .ok_or(AuthError::NotFound)?;

        if row.expires_at <= now {
            warn!(handshake_id = %id, "handshake expired before completion");
            return Err(AuthError::InvalidState("handshake expired".to_string()).into());
        }

        let code = match callback {
            Callback::Code(code) => code,
            Callback::Denied { error, description } => {
                info!(handshake_id = %id, platform = %row.platform, error, "provider denied authorization");
                let detail = match description {
                    Some(description) => format!("{}: {}", error, description),
                    None => error.to_string(),
                };
                return Err(AuthError::ProviderDenied(detail).into());
            }
        };

        let adapter = self
            .registry
            .adapter(row.platform)
            .ok_or_else(|| SyndicaError::UnsupportedPlatform(row.platform.to_string()))?;

        let credential = adapter
            .exchange(code, row.pkce_verifier.as_deref())
            .await?;
        self.vault.store(&row.user_id, row.platform, &credential).await?;

        info!(user_id = %row.user_id, platform = %row.platform, "platform account connected");
        Ok(CompletedHandshake {
            user_id: row.user_id,
            platform: row.platform,
        })
    }

    /// Drop pending handshakes whose TTL has lapsed.
    pub async fn purge_expired(&self) -> Result<u64> {
        let purged = self
            .db
            .purge_expired_handshakes(chrono::Utc::now().timestamp_millis())
            .await?;
        if purged > 0 {
            debug!(purged, "purged expired handshakes");
        }
        Ok(purged)
    }
}

/// Generate a PKCE verifier and its S256 challenge.
fn pkce_pair() -> (String, String) {
    let mut bytes = [0u8; 32];
    rand::thread_rng().fill_bytes(&mut bytes);
    let verifier = URL_SAFE_NO_PAD.encode(bytes);
    let challenge = URL_SAFE_NO_PAD.encode(Sha256::digest(verifier.as_bytes()));
    (verifier, challenge)
}

/// Produce the signed state parameter: `b64(id).b64(millis).b64(tag)`.
fn sign_state(id: &str, issued_at: i64, key: &[u8; 32]) -> String {
    let tag = state_tag(id, issued_at, key);
    format!(
        "{}{}{}{}{}",
        URL_SAFE_NO_PAD.encode(id.as_bytes()),
        STATE_SEP,
        URL_SAFE_NO_PAD.encode(issued_at.to_be_bytes()),
        STATE_SEP,
        URL_SAFE_NO_PAD.encode(tag),
    )
}

/// Check the signature and unpack the state parameter. Verification is
/// constant-time via the MAC itself.
fn verify_state(state: &str, key: &[u8; 32]) -> Result<(String, i64)> {
    let invalid = || AuthError::InvalidState("malformed state parameter".to_string());

    let mut parts = state.split(STATE_SEP);
    let (id_part, ts_part, tag_part) = match (parts.next(), parts.next(), parts.next(), parts.next())
    {
        (Some(id), Some(ts), Some(tag), None) => (id, ts, tag),
        _ => return Err(invalid().into()),
    };

    let id_bytes = URL_SAFE_NO_PAD.decode(id_part).map_err(|_| invalid())?;
    let id = String::from_utf8(id_bytes).map_err(|_| invalid())?;
    let ts_bytes = URL_SAFE_NO_PAD.decode(ts_part).map_err(|_| invalid())?;
    let ts_bytes: [u8; 8] = ts_bytes.as_slice().try_into().map_err(|_| invalid())?;
    let issued_at = i64::from_be_bytes(ts_bytes);
    let tag = URL_SAFE_NO_PAD.decode(tag_part).map_err(|_| invalid())?;

    let mut mac = HmacSha256::new_from_slice(key).expect("HMAC accepts any key length");
    mac.update(id.as_bytes());
    mac.update(&[0x1f]);
    mac.update(&issued_at.to_be_bytes());
    mac.verify_slice(&tag)
        .map_err(|_| AuthError::InvalidState("signature mismatch".to_string()))?;

    Ok((id, issued_at))
}

fn state_tag(id: &str, issued_at: i64, key: &[u8; 32]) -> Vec<u8> {
    let mut mac = HmacSha256::new_from_slice(key).expect("HMAC accepts any key length");
    mac.update(id.as_bytes());
    mac.update(&[0x1f]);
    mac.update(&issued_at.to_be_bytes());
    mac.finalize().into_bytes().to_vec()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{OAuthClient, PlatformCredentials};
    use crate::error::PlatformError;
    use crate::platforms::mock::MockAdapter;
    use secrecy::ExposeSecret;

    const KEY: [u8; 32] = [9u8; 32];

    fn test_config() -> Config {
        let mut config = Config::for_tests();
        config.platforms = PlatformCredentials {
            mock: Some(OAuthClient {
                client_id: "mock-client".to_string(),
                client_secret: "mock-secret".to_string(),
                redirect_uri: "https://app.example/callback".to_string(),
            }),
            ..Default::default()
        };
        config
    }

    async fn test_manager() -> (HandshakeManager, MockAdapter, Database, tempfile::TempDir) {
        let dir = tempfile::tempdir().unwrap();
        let db_path = dir.path().join("handshake.db");
        let db = Database::new(db_path.to_str().unwrap()).await.unwrap();
        let vault = Vault::new([7u8; 32], db.clone());
        let mock = MockAdapter::new();
        let config = test_config();
        let registry = Arc::new(AdapterRegistry::with_mock(&config, mock.clone()).unwrap());
        let manager = HandshakeManager::new(db.clone(), vault, registry, config).unwrap();
        (manager, mock, db, dir)
    }

    #[test]
    fn test_state_round_trip() {
        let state = sign_state("abc123", 1_700_000_000_000, &KEY);
        let (id, issued_at) = verify_state(&state, &KEY).unwrap();
        assert_eq!(id, "abc123");
        assert_eq!(issued_at, 1_700_000_000_000);
    }

    #[test]
    fn test_tampered_state_rejected() {
        let state = sign_state("abc123", 1_700_000_000_000, &KEY);

        // Swap the id segment for another valid encoding
        let mut parts: Vec<&str> = state.split('.').collect();
        let forged_id = URL_SAFE_NO_PAD.encode("zzz999");
        parts[0] = &forged_id;
        let forged = parts.join(".");

        assert!(verify_state(&forged, &KEY).is_err());
    }

    #[test]
    fn test_wrong_key_rejected() {
        let state = sign_state("abc123", 1_700_000_000_000, &KEY);
        assert!(verify_state(&state, &[8u8; 32]).is_err());
    }

    #[test]
    fn test_malformed_state_rejected() {
        for junk in ["", "a", "a.b", "a.b.c.d", "!!.@@.##"] {
            assert!(verify_state(junk, &KEY).is_err(), "accepted {:?}", junk);
        }
    }

    #[test]
    fn test_pkce_challenge_matches_verifier() {
        let (verifier, challenge) = pkce_pair();
        let expected = URL_SAFE_NO_PAD.encode(Sha256::digest(verifier.as_bytes()));
        assert_eq!(challenge, expected);
        // RFC 7636 verifier length bounds
        assert!(verifier.len() >= 43 && verifier.len() <= 128);
    }

    #[tokio::test]
    async fn test_begin_builds_authorize_url() {
        let (manager, _mock, _db, _dir) = test_manager().await;
        let redirect = manager.begin("u1", PlatformId::Mock).await.unwrap();

        assert!(redirect.url.starts_with("https://mock.invalid/authorize?"));
        assert!(redirect.url.contains("client_id=mock-client"));
        assert!(redirect.url.contains("state="));
        assert!(redirect.url.contains("code_challenge="));
        assert!(redirect.url.contains("code_challenge_method=S256"));
    }

    #[tokio::test]
    async fn test_complete_stores_credential() {
        let (manager, mock, _db, _dir) = test_manager().await;
        let redirect = manager.begin("u1", PlatformId::Mock).await.unwrap();
        let state = extract_state(&redirect.url);

        let completed = manager
            .complete(&state, Callback::Code("auth-code"))
            .await
            .unwrap();
        assert_eq!(completed.user_id, "u1");
        assert_eq!(completed.platform, PlatformId::Mock);

        // The PKCE verifier recorded at begin reached the exchange
        let exchanges = mock.exchanged_codes();
        assert_eq!(exchanges.len(), 1);
        assert_eq!(exchanges[0].0, "auth-code");
        assert!(exchanges[0].1.is_some());

        // Credential landed in the vault
        let vault = Vault::new([7u8; 32], manager.db.clone());
        let credential = vault.retrieve("u1", PlatformId::Mock).await.unwrap();
        assert_eq!(credential.access_secret.expose_secret(), "mock-access-1");
    }

    #[tokio::test]
    async fn test_replay_is_rejected() {
        let (manager, _mock, _db, _dir) = test_manager().await;
        let redirect = manager.begin("u1", PlatformId::Mock).await.unwrap();
        let state = extract_state(&redirect.url);

        manager
            .complete(&state, Callback::Code("auth-code"))
            .await
            .unwrap();

        let err = manager
            .complete(&state, Callback::Code("auth-code"))
            .await
            .unwrap_err();
        assert!(matches!(err, SyndicaError::Auth(AuthError::NotFound)));
    }

    #[tokio::test]
    async fn test_denied_consumes_handshake() {
        let (manager, mock, db, _dir) = test_manager().await;
        let redirect = manager.begin("u1", PlatformId::Mock).await.unwrap();
        let state = extract_state(&redirect.url);

        let err = manager
            .complete(
                &state,
                Callback::Denied {
                    error: "access_denied",
                    description: Some("user clicked cancel"),
                },
            )
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            SyndicaError::Auth(AuthError::ProviderDenied(_))
        ));
        assert_eq!(mock.exchange_calls(), 0);

        // Even a denial burns the handshake
        assert!(db.take_handshake(&redirect.handshake_id).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_expired_handshake_rejected() {
        let (manager, _mock, db, _dir) = test_manager().await;
        let redirect = manager.begin("u1", PlatformId::Mock).await.unwrap();
        let state = extract_state(&redirect.url);

        // Force the row into the past
        let row = db.take_handshake(&redirect.handshake_id).await.unwrap().unwrap();
        db.insert_handshake(&HandshakeRow {
            expires_at: 1,
            ..row
        })
        .await
        .unwrap();

        let err = manager
            .complete(&state, Callback::Code("auth-code"))
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            SyndicaError::Auth(AuthError::InvalidState(_))
        ));
    }

    #[tokio::test]
    async fn test_stale_state_rejected_before_storage() {
        let (manager, mock, db, _dir) = test_manager().await;
        let redirect = manager.begin("u1", PlatformId::Mock).await.unwrap();

        // Validly signed, but issued well past the 15 minute ttl
        let issued_at = chrono::Utc::now().timestamp_millis() - 20 * 60_000;
        let stale = sign_state(&redirect.handshake_id, issued_at, &manager.signing_key);

        let err = manager
            .complete(&stale, Callback::Code("auth-code"))
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            SyndicaError::Auth(AuthError::InvalidState(_))
        ));
        assert_eq!(mock.exchange_calls(), 0);

        // The pending row was never consulted, let alone consumed
        assert!(db.take_handshake(&redirect.handshake_id).await.unwrap().is_some());
    }

    #[tokio::test]
    async fn test_forged_state_never_touches_storage() {
        let (manager, _mock, db, _dir) = test_manager().await;
        let redirect = manager.begin("u1", PlatformId::Mock).await.unwrap();

        let err = manager
            .complete("AAAA.BBBB.CCCC", Callback::Code("auth-code"))
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            SyndicaError::Auth(AuthError::InvalidState(_))
        ));

        // The real handshake survives the forgery attempt
        assert!(db.take_handshake(&redirect.handshake_id).await.unwrap().is_some());
    }

    #[tokio::test]
    async fn test_begin_unconfigured_platform_fails() {
        let (manager, _mock, _db, _dir) = test_manager().await;
        let err = manager.begin("u1", PlatformId::Buzzly).await.unwrap_err();
        assert!(format!("{}", err).contains("platforms.buzzly"));
    }

    #[tokio::test]
    async fn test_purge_expired() {
        let (manager, _mock, db, _dir) = test_manager().await;
        db.insert_handshake(&HandshakeRow {
            id: "stale".to_string(),
            user_id: "u1".to_string(),
            platform: PlatformId::Mock,
            pkce_verifier: None,
            created_at: 1,
            expires_at: 2,
        })
        .await
        .unwrap();

        assert_eq!(manager.purge_expired().await.unwrap(), 1);
    }

    fn extract_state(url: &str) -> String {
        let raw = url
            .split('&')
            .find_map(|p| p.strip_prefix("state="))
            .or_else(|| {
                url.split('?')
                    .nth(1)
                    .and_then(|q| q.split('&').find_map(|p| p.strip_prefix("state=")))
            })
            .expect("authorize url carries state");
        urlencoding::decode(raw).unwrap().into_owned()
    }
}
