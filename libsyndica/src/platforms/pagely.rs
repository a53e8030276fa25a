//! Pagely platform adapter
//!
//! Pagely posts go to a page feed, not the user's own profile. The user
//! token only authorizes page management; the actual publish call needs a
//! secondary page token derived from it. Renewal therefore runs a chain:
//! exchange the user token, then mint a fresh page token with the result.

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
    id: PlatformId::Pagely,
    authorize_url: "https://www.pagely.example/v4/dialog/oauth",
    token_url: "https://graph.pagely.example/v4/oauth/access_token",
    scopes: &["pages_manage_posts", "pages_read_engagement"],
    pkce_required: false,
    refresh_flow: RefreshFlow::PageTokenChain,
    supports_idempotency: true,
};

const GRAPH_BASE: &str = "https://graph.pagely.example/v4";

#[derive(Debug, Serialize)]
struct FeedRequest<'a> {
    message: &'a str,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    link_urls: Vec<&'a str>,
}

#[derive(Debug, Deserialize)]
struct FeedResponse {
    post_id: String,
    permalink_url: String,
}

#[derive(Debug, Deserialize)]
struct UserTokenResponse {
    access_token: String,
    expires_in: i64,
}

/// The code exchange additionally reports which page the user authorized
/// and its initial page token.
#[derive(Debug, Deserialize)]
struct CodeExchangeResponse {
    access_token: String,
    expires_in: i64,
    page_id: String,
    page_token: String,
}

#[derive(Debug, Deserialize)]
struct PageTokenResponse {
    page_token: String,
}

pub struct PagelyAdapter {
    client: reqwest::Client,
    oauth: Option<OAuthClient>,
}

impl PagelyAdapter {
    pub fn new(client: reqwest::Client, oauth: Option<OAuthClient>) -> Self {
        Self { client, oauth }
    }
}

#[async_trait]
impl PlatformAdapter for PagelyAdapter {
    fn id(&self) -> PlatformId {
        PlatformId::Pagely
    }

    async fn publish(
        &self,
        credential: &Credential,
        content: &PublishContent,
        _options: &serde_json::Value,
        idempotency_token: &str,
    ) -> Result<PublishOutcome, PlatformError> {
        let page_token = credential.page_secret.as_ref().ok_or_else(|| {
            PlatformError::Validation("pagely connection has no page token".to_string())
        })?;
        let page_id = credential.external_account_id.as_deref().ok_or_else(|| {
            PlatformError::Validation("pagely connection has no page id".to_string())
        })?;

        let request = FeedRequest {
            message: &content.text,
            link_urls: content.media_urls.iter().map(String::as_str).collect(),
        };

        let response = self
            .client
            .post(format!("{}/{}/feed", GRAPH_BASE, page_id))
            .bearer_auth(page_token.expose_secret())
            .header("X-Dedupe-Token", idempotency_token)
            .json(&request)
            .send()
            .await
            .map_err(|e| PlatformError::Network(e.to_string()))?;

        if !response.status().is_success() {
            return Err(error_from_response(response).await);
        }

        let body: FeedResponse = response
            .json()
            .await
            .map_err(|e| PlatformError::Network(e.to_string()))?;

        debug!(remote_id = %body.post_id, "published to pagely");
        Ok(PublishOutcome {
            remote_id: body.post_id,
            canonical_url: body.permalink_url,
        })
    }

    async fn exchange(
        &self,
        code: &str,
        _pkce_verifier: Option<&str>,
    ) -> Result<Credential, PlatformError> {
        let oauth = self.oauth.as_ref().ok_or_else(|| {
            PlatformError::RefreshFailed("pagely client not configured".to_string())
        })?;

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

        let token: CodeExchangeResponse = response
            .json()
            .await
            .map_err(|e| PlatformError::Network(e.to_string()))?;

        let expires_at = chrono::Utc::now().timestamp_millis() + token.expires_in * 1000;
        Ok(Credential::new(
            SecretString::from(token.access_token),
            None,
            Some(SecretString::from(token.page_token)),
            Some(token.page_id),
            DESCRIPTOR.scopes.iter().map(|s| s.to_string()).collect(),
            Some(expires_at),
        ))
    }

    /// Two-step renewal. Both steps must succeed; a failure at either point
    /// returns an error with no partial update, leaving the stored
    /// credential untouched.
    async fn refresh(
        &self,
        credential: &Credential,
    ) -> Result<CredentialUpdate, PlatformError> {
        let oauth = self.oauth.as_ref().ok_or_else(|| {
            PlatformError::RefreshFailed("pagely client not configured".to_string())
        })?;
        let page_id = credential.external_account_id.as_deref().ok_or_else(|| {
            PlatformError::RefreshFailed("pagely connection has no page id".to_string())
        })?;

        // Step 1: exchange the user token
        let response = self
            .client
            .get(DESCRIPTOR.token_url)
            .query(&[
                ("grant_type", "pg_exchange_token"),
                ("client_id", &oauth.client_id),
                ("client_secret", &oauth.client_secret),
                ("pg_exchange_token", credential.access_secret.expose_secret()),
            ])
            .send()
            .await
            .map_err(|e| PlatformError::Network(e.to_string()))?;

        if !response.status().is_success() {
            return Err(refresh_error(response).await);
        }
        let user_token: UserTokenResponse = response
            .json()
            .await
            .map_err(|e| PlatformError::RefreshFailed(e.to_string()))?;

        // Step 2: mint a page token with the fresh user token
        let response = self
            .client
            .get(format!("{}/{}/page_token", GRAPH_BASE, page_id))
            .bearer_auth(&user_token.access_token)
            .send()
            .await
            .map_err(|e| PlatformError::Network(e.to_string()))?;

        if !response.status().is_success() {
            return Err(refresh_error(response).await);
        }
        let page: PageTokenResponse = response
            .json()
            .await
            .map_err(|e| PlatformError::RefreshFailed(e.to_string()))?;

        let expires_at = chrono::Utc::now().timestamp_millis() + user_token.expires_in * 1000;
        Ok(CredentialUpdate {
            access_secret: Some(SecretString::from(user_token.access_token)),
            page_secret: Some(SecretString::from(page.page_token)),
            expires_at: Some(Some(expires_at)),
            ..Default::default()
        })
    }
}
