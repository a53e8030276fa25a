//! Buzzly platform adapter
//!
//! Buzzly is a standard OAuth 2.0 provider: PKCE on the authorize leg, a
//! refresh grant that rotates the refresh token on every use, and an
//! idempotency key header on the publish endpoint.

use async_trait::async_trait;
use secrecy::{ExposeSecret, SecretString};
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::config::OAuthClient;
use crate::error::PlatformError;
use crate::platforms::{
    error_from_response, refresh_error, PlatformAdapter, PlatformDescriptor, PlatformId,
    RefreshFlow,
};
use crate::types::{PublishContent, PublishOutcome};
use crate::vault::{Credential, CredentialUpdate};

pub static DESCRIPTOR: PlatformDescriptor = PlatformDescriptor {
    id: PlatformId::Buzzly,
    authorize_url: "https://auth.buzzly.example/oauth/authorize",
    token_url: "https://auth.buzzly.example/oauth/token",
    scopes: &["post:write", "profile:read"],
    pkce_required: true,
    refresh_flow: RefreshFlow::RotatingRefreshToken,
    supports_idempotency: true,
};

const PUBLISH_URL: &str = "https://api.buzzly.example/v1/posts";

#[derive(Debug, Serialize)]
struct PublishRequest<'a> {
    text: &'a str,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    media_urls: Vec<&'a str>,
}

#[derive(Debug, Deserialize)]
struct PublishResponse {
    id: String,
    url: String,
}

#[derive(Debug, Deserialize)]
struct TokenResponse {
    access_token: String,
    refresh_token: String,
    expires_in: i64,
    #[serde(default)]
    scope: Option<String>,
}

pub struct BuzzlyAdapter {
    client: reqwest::Client,
    oauth: Option<OAuthClient>,
}

impl BuzzlyAdapter {
    pub fn new(client: reqwest::Client, oauth: Option<OAuthClient>) -> Self {
        Self { client, oauth }
    }
}

#[async_trait]
impl PlatformAdapter for BuzzlyAdapter {
    fn id(&self) -> PlatformId {
        PlatformId::Buzzly
    }

    async fn publish(
        &self,
        credential: &Credential,
        content: &PublishContent,
        _options: &serde_json::Value,
        idempotency_token: &str,
    ) -> Result<PublishOutcome, PlatformError> {
        let request = PublishRequest {
            text: &content.text,
            media_urls: content.media_urls.iter().map(String::as_str).collect(),
        };

        let response = self
            .client
            .post(PUBLISH_URL)
            .bearer_auth(credential.access_secret.expose_secret())
            .header("Idempotency-Key", idempotency_token)
            .json(&request)
            .send()
            .await
            .map_err(|e| PlatformError::Network(e.to_string()))?;

        if !response.status().is_success() {
            return Err(error_from_response(response).await);
        }

        let body: PublishResponse = response
            .json()
            .await
            .map_err(|e| PlatformError::Network(e.to_string()))?;

        debug!(remote_id = %body.id, "published to buzzly");
        Ok(PublishOutcome {
            remote_id: body.id,
            canonical_url: body.url,
        })
    }

    async fn exchange(
        &self,
        code: &str,
        pkce_verifier: Option<&str>,
    ) -> Result<Credential, PlatformError> {
        let oauth = self
            .oauth
            .as_ref()
            .ok_or_else(|| PlatformError::RefreshFailed("buzzly client not configured".to_string()))?;
        let verifier = pkce_verifier.ok_or_else(|| {
            PlatformError::Validation("buzzly exchange requires a PKCE verifier".to_string())
        })?;

        let response = self
            .client
            .post(DESCRIPTOR.token_url)
            .form(&[
                ("grant_type", "authorization_code"),
                ("code", code),
                ("code_verifier", verifier),
                ("client_id", &oauth.client_id),
                ("client_secret", &oauth.client_secret),
                ("redirect_uri", &oauth.redirect_uri),
            ])
            .send()
            .await
            .map_err(|e| PlatformError::Network(e.to_string()))?;

        if !response.status().is_success() {
            return Err(error_from_response(response).await);
        }

        let token: TokenResponse = response
            .json()
            .await
            .map_err(|e| PlatformError::Network(e.to_string()))?;

        let expires_at = chrono::Utc::now().timestamp_millis() + token.expires_in * 1000;
        let scope = token
            .scope
            .map(|s| s.split_whitespace().map(|p| p.to_string()).collect())
            .unwrap_or_else(|| DESCRIPTOR.scopes.iter().map(|s| s.to_string()).collect());
        Ok(Credential::new(
            SecretString::from(token.access_token),
            Some(SecretString::from(token.refresh_token)),
            None,
            None,
            scope,
            Some(expires_at),
        ))
    }

    /// Standard refresh grant. Buzzly rotates the refresh token, so the
    /// update carries both new tokens; losing the rotated refresh token
    /// would orphan the connection.
    async fn refresh(
        &self,
        credential: &Credential,
    ) -> Result<CredentialUpdate, PlatformError> {
        let oauth = self
            .oauth
            .as_ref()
            .ok_or_else(|| PlatformError::RefreshFailed("buzzly client not configured".to_string()))?;
        let refresh_token = credential
            .refresh_secret
            .as_ref()
            .ok_or_else(|| PlatformError::RefreshFailed("no refresh token on record".to_string()))?;

        let response = self
            .client
            .post(DESCRIPTOR.token_url)
            .form(&[
                ("grant_type", "refresh_token"),
                ("refresh_token", refresh_token.expose_secret()),
                ("client_id", &oauth.client_id),
                ("client_secret", &oauth.client_secret),
            ])
            .send()
            .await
            .map_err(|e| PlatformError::Network(e.to_string()))?;

        if !response.status().is_success() {
            return Err(refresh_error(response).await);
        }

        let token: TokenResponse = response
            .json()
            .await
            .map_err(|e| PlatformError::RefreshFailed(e.to_string()))?;

        let expires_at = chrono::Utc::now().timestamp_millis() + token.expires_in * 1000;
        Ok(CredentialUpdate {
            access_secret: Some(SecretString::from(token.access_token)),
            refresh_secret: Some(SecretString::from(token.refresh_token)),
            expires_at: Some(Some(expires_at)),
            scope: token
                .scope
                .map(|s| s.split_whitespace().map(|p| p.to_string()).collect()),
            ..Default::default()
        })
    }
}
