//! Encrypted credential vault
//!
//! Stores per-(user, platform) publishing credentials encrypted at rest with
//! AES-256-GCM. Every secret field is sealed independently with a fresh
//! random nonce on every write; the authentication tag means any tampering
//! with stored ciphertext surfaces as an integrity error rather than
//! corrupted plaintext.
//!
//! Plaintext secrets only exist inside `secrecy::SecretString` and never
//! appear in logs, error messages, or serialized output.

use aes_gcm::{
    aead::{Aead, KeyInit, OsRng},
    AeadCore, Aes256Gcm, Nonce,
};
use base64::{engine::general_purpose::STANDARD as BASE64, Engine};
use secrecy::{ExposeSecret, SecretString};
use zeroize::Zeroizing;

use crate::db::{CredentialRow, Database};
use crate::error::{Result, VaultError};
use crate::platforms::PlatformId;

const NONCE_LEN: usize = 12;

/// Plaintext view of a stored credential. Secret fields are wrapped so that
/// Debug output redacts them.
#[derive(Debug, Clone)]
pub struct Credential {
    pub access_secret: SecretString,
    pub refresh_secret: Option<SecretString>,
    /// Secondary token some platforms require for posting to a page or
    /// channel owned by the connected account.
    pub page_secret: Option<SecretString>,
    /// Business/page account identifier required by some platforms.
    pub external_account_id: Option<String>,
    pub scope: Vec<String>,
    /// Epoch millis, or None when the credential never expires.
    pub expires_at: Option<i64>,
    pub connected_at: i64,
    pub updated_at: i64,
}

impl Credential {
    /// Build a credential as produced by a successful OAuth exchange.
    pub fn new(
        access_secret: SecretString,
        refresh_secret: Option<SecretString>,
        page_secret: Option<SecretString>,
        external_account_id: Option<String>,
        scope: Vec<String>,
        expires_at: Option<i64>,
    ) -> Self {
        let now = chrono::Utc::now().timestamp_millis();
        Self {
            access_secret,
            refresh_secret,
            page_secret,
            external_account_id,
            scope,
            expires_at,
            connected_at: now,
            updated_at: now,
        }
    }
}

/// Partial credential mutation: only supplied fields are re-encrypted and
/// written, so a refresh does not force the caller to resupply unrelated
/// secrets.
#[derive(Debug, Default)]
pub struct CredentialUpdate {
    pub access_secret: Option<SecretString>,
    pub refresh_secret: Option<SecretString>,
    pub page_secret: Option<SecretString>,
    /// `Some(None)` clears the expiry, `Some(Some(t))` sets it.
    pub expires_at: Option<Option<i64>>,
    pub scope: Option<Vec<String>>,
}

impl CredentialUpdate {
    pub fn is_empty(&self) -> bool {
        self.access_secret.is_none()
            && self.refresh_secret.is_none()
            && self.page_secret.is_none()
            && self.expires_at.is_none()
            && self.scope.is_none()
    }
}

/// The vault. Owns the cipher; all persistence goes through [`Database`].
#[derive(Clone)]
pub struct Vault {
    cipher: Aes256Gcm,
    db: Database,
}

impl Vault {
    /// Construct the vault from the already-validated 256-bit key.
    ///
    /// Key presence and length are enforced by `Config::validate` at process
    /// start, so misconfiguration fails before any traffic is served.
    pub fn new(key: [u8; 32], db: Database) -> Self {
        let cipher = Aes256Gcm::new((&key).into());
        Self { cipher, db }
    }

    /// Encrypt and persist a credential, replacing any existing record for
    /// the same (user, platform).
    pub async fn store(
        &self,
        user_id: &str,
        platform: PlatformId,
        credential: &Credential,
    ) -> Result<()> {
        let row = CredentialRow {
            user_id: user_id.to_string(),
            platform,
            access_sealed: self.seal(credential.access_secret.expose_secret())?,
            refresh_sealed: credential
                .refresh_secret
                .as_ref()
                .map(|s| self.seal(s.expose_secret()))
                .transpose()?,
            page_sealed: credential
                .page_secret
                .as_ref()
                .map(|s| self.seal(s.expose_secret()))
                .transpose()?,
            external_account_id: credential.external_account_id.clone(),
            scope: credential.scope.join(" "),
            expires_at: credential.expires_at,
            connected_at: credential.connected_at,
            updated_at: chrono::Utc::now().timestamp_millis(),
        };
        self.db.upsert_credential(&row).await?;
        tracing::debug!(user_id, platform = %platform, "stored credential");
        Ok(())
    }

    /// Decrypt and return the credential for (user, platform).
    ///
    /// # Errors
    ///
    /// `VaultError::NotFound` when no record exists; `VaultError::Integrity`
    /// when any sealed field fails authentication — never partial data.
    pub async fn retrieve(&self, user_id: &str, platform: PlatformId) -> Result<Credential> {
        let row = self
            .db
            .get_credential(user_id, platform)
            .await?
            .ok_or_else(|| VaultError::NotFound(format!("{}/{}", user_id, platform)))?;

        Ok(Credential {
            access_secret: self.open(&row.access_sealed)?,
            refresh_secret: row.refresh_sealed.as_deref().map(|s| self.open(s)).transpose()?,
            page_secret: row.page_sealed.as_deref().map(|s| self.open(s)).transpose()?,
            external_account_id: row.external_account_id,
            scope: split_scope(&row.scope),
            expires_at: row.expires_at,
            connected_at: row.connected_at,
            updated_at: row.updated_at,
        })
    }

    /// Merge and re-encrypt only the supplied fields.
    pub async fn update(
        &self,
        user_id: &str,
        platform: PlatformId,
        update: CredentialUpdate,
    ) -> Result<()> {
        if update.is_empty() {
            return Ok(());
        }

        let mut row = self
            .db
            .get_credential(user_id, platform)
            .await?
            .ok_or_else(|| VaultError::NotFound(format!("{}/{}", user_id, platform)))?;

        if let Some(secret) = update.access_secret {
            row.access_sealed = self.seal(secret.expose_secret())?;
        }
        if let Some(secret) = update.refresh_secret {
            row.refresh_sealed = Some(self.seal(secret.expose_secret())?);
        }
        if let Some(secret) = update.page_secret {
            row.page_sealed = Some(self.seal(secret.expose_secret())?);
        }
        if let Some(expires_at) = update.expires_at {
            row.expires_at = expires_at;
        }
        if let Some(scope) = update.scope {
            row.scope = scope.join(" ");
        }
        row.updated_at = chrono::Utc::now().timestamp_millis();

        self.db.upsert_credential(&row).await?;
        tracing::debug!(user_id, platform = %platform, "updated credential");
        Ok(())
    }

    /// Hard delete, used on user-initiated disconnect.
    pub async fn remove(&self, user_id: &str, platform: PlatformId) -> Result<()> {
        let deleted = self.db.delete_credential(user_id, platform).await?;
        if !deleted {
            return Err(VaultError::NotFound(format!("{}/{}", user_id, platform)).into());
        }
        tracing::info!(user_id, platform = %platform, "removed credential");
        Ok(())
    }

    /// Whether a credential exists without decrypting it.
    pub async fn is_connected(&self, user_id: &str, platform: PlatformId) -> Result<bool> {
        Ok(self.db.get_credential(user_id, platform).await?.is_some())
    }

    /// Seal one secret field: fresh random nonce, AES-256-GCM, then
    /// base64(nonce || ciphertext). The GCM tag rides at the end of the
    /// ciphertext.
    fn seal(&self, plaintext: &str) -> Result<String> {
        let nonce = Aes256Gcm::generate_nonce(&mut OsRng);
        let ciphertext = self
            .cipher
            .encrypt(&nonce, plaintext.as_bytes())
            .map_err(|_| VaultError::Encryption("AEAD encryption failed".to_string()))?;

        let mut blob = Vec::with_capacity(NONCE_LEN + ciphertext.len());
        blob.extend_from_slice(&nonce);
        blob.extend_from_slice(&ciphertext);
        Ok(BASE64.encode(blob))
    }

    /// Open one sealed field. Any decoding or authentication failure is an
    /// integrity error; no partial plaintext is ever returned.
    fn open(&self, sealed: &str) -> Result<SecretString> {
        let blob = BASE64
            .decode(sealed)
            .map_err(|_| VaultError::Integrity("invalid ciphertext encoding".to_string()))?;
        if blob.len() <= NONCE_LEN {
            return Err(VaultError::Integrity("ciphertext too short".to_string()).into());
        }
        let (nonce, ciphertext) = blob.split_at(NONCE_LEN);
        let plaintext = Zeroizing::new(
            self.cipher
                .decrypt(Nonce::from_slice(nonce), ciphertext)
                .map_err(|_| VaultError::Integrity("authentication tag mismatch".to_string()))?,
        );
        let plaintext = std::str::from_utf8(&plaintext)
            .map_err(|_| VaultError::Integrity("decrypted data is not UTF-8".to_string()))?;
        Ok(SecretString::from(plaintext))
    }
}

fn split_scope(scope: &str) -> Vec<String> {
    scope
        .split_whitespace()
        .map(|s| s.to_string())
        .collect()
}
