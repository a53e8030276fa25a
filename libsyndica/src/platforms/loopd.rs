//! Loopd platform adapter
//!
//! Loopd issues long-lived tokens and has no refresh grant: renewal
//! re-exchanges the still-valid token for a fresh one. Once the token has
//! actually expired there is nothing to exchange and the user must
//! reconnect. Loopd's publish endpoint has no idempotency support, so a
//! retried publish can double-post there; the executor's single-attempt
//! accounting is the only guard.

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
    id: PlatformId::Loopd,
    authorize_url: "https://loopd.example/oauth/dialog",
    token_url: "https://graph.loopd.example/oauth/access_token",
    scopes: &["publish_content"],
    pkce_required: false,
    refresh_flow: RefreshFlow::ReExchangeLongLived,
    supports_idempotency: false,
};

const PUBLISH_URL: &str = "https://graph.loopd.example/v2/statuses";

#[derive(Debug, Serialize)]
struct PublishRequest<'a> {
    message: &'a str,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    attachments: Vec<&'a str>,
}

#[derive(Debug, Deserialize)]
struct PublishResponse {
    status_id: String,
    permalink: String,
}

#[derive(Debug, Deserialize)]
struct ExchangeResponse {
    access_token: String,
    expires_in: i64,
}

pub struct LoopdAdapter {
    client: reqwest::Client,
    oauth: Option<OAuthClient>,
}

impl LoopdAdapter {
    pub fn new(client: reqwest::Client, oauth: Option<OAuthClient>) -> Self {
        Self { client, oauth }
    }
}

#[async_trait]
impl PlatformAdapter for LoopdAdapter {
    fn id(&self) -> PlatformId {
        PlatformId::Loopd
    }

    async fn publish(
        &self,
        credential: &Credential,
        content: &PublishContent,
        _options: &serde_json::Value,
        _idempotency_token: &str,
    ) -> Result<PublishOutcome, PlatformError> {
        let request = PublishRequest {
            message: &content.text,
            attachments: content.media_urls.iter().map(String::as_str).collect(),
        };

        let response = self
            .client
            .post(PUBLISH_URL)
            .bearer_auth(credential.access_secret.expose_secret())
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

        debug!(remote_id = %body.status_id, "published to loopd");
        Ok(PublishOutcome {
            remote_id: body.status_id,
            canonical_url: body.permalink,
        })
    }

    async fn exchange(
        &self,
        code: &str,
        _pkce_verifier: Option<&str>,
    ) -> Result<Credential, PlatformError> {
        let oauth = self
            .oauth
            .as_ref()
            .ok_or_else(|| PlatformError::RefreshFailed("loopd client not configured".to_string()))?;

        let response = self
            .client
            .get(DESCRIPTOR.token_url)
            .query(&[
                ("code", code),
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

        let token: ExchangeResponse = response
            .json()
            .await
            .map_err(|e| PlatformError::Network(e.to_string()))?;

        let expires_at = chrono::Utc::now().timestamp_millis() + token.expires_in * 1000;
        Ok(Credential::new(
            SecretString::from(token.access_token),
            None,
            None,
            None,
            DESCRIPTOR.scopes.iter().map(|s| s.to_string()).collect(),
            Some(expires_at),
        ))
    }

    /// Re-exchange the current long-lived token. There is no refresh token;
    /// the exchange only works while the current token is still accepted.
    async fn refresh(
        &self,
        credential: &Credential,
    ) -> Result<CredentialUpdate, PlatformError> {
        let oauth = self
            .oauth
            .as_ref()
            .ok_or_else(|| PlatformError::RefreshFailed("loopd client not configured".to_string()))?;

        let response = self
            .client
            .get(DESCRIPTOR.token_url)
            .query(&[
                ("grant_type", "ld_exchange_token"),
                ("client_id", &oauth.client_id),
                ("client_secret", &oauth.client_secret),
                ("ld_exchange_token", credential.access_secret.expose_secret()),
            ])
            .send()
            .await
            .map_err(|e| PlatformError::Network(e.to_string()))?;

        if !response.status().is_success() {
            return Err(refresh_error(response).await);
        }

        let token: ExchangeResponse = response
            .json()
            .await
            .map_err(|e| PlatformError::RefreshFailed(e.to_string()))?;

        let expires_at = chrono::Utc::now().timestamp_millis() + token.expires_in * 1000;
        Ok(CredentialUpdate {
            access_secret: Some(SecretString::from(token.access_token)),
            expires_at: Some(Some(expires_at)),
            ..Default::default()
        })
    }
}
