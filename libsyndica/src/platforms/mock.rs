//! Mock platform adapter for testing
//!
//! A scriptable adapter used by integration tests to exercise the executor,
//! dispatch engine, and scheduler without real platform credentials or
//! network access. Responses are queued ahead of time; once a queue runs
//! dry the adapter falls back to deterministic successes.
//!
//! Clones share state, so a test can keep a handle for assertions while the
//! registry owns another.

use async_trait::async_trait;
use secrecy::SecretString;
use std::collections::VecDeque;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::time::sleep;

use crate::error::PlatformError;
use crate::platforms::{PlatformAdapter, PlatformDescriptor, PlatformId, RefreshFlow};
use crate::types::{PublishContent, PublishOutcome};
use crate::vault::{Credential, CredentialUpdate};

pub static DESCRIPTOR: PlatformDescriptor = PlatformDescriptor {
    id: PlatformId::Mock,
    authorize_url: "https://mock.invalid/authorize",
    token_url: "https://mock.invalid/token",
    scopes: &["mock:write"],
    pkce_required: true,
    refresh_flow: RefreshFlow::RotatingRefreshToken,
    supports_idempotency: true,
};

#[derive(Default)]
struct MockState {
    publish_script: VecDeque<Result<PublishOutcome, PlatformError>>,
    refresh_script: VecDeque<Result<CredentialUpdate, PlatformError>>,
    exchange_script: VecDeque<Result<Credential, PlatformError>>,
    publish_calls: usize,
    refresh_calls: usize,
    exchange_calls: usize,
    published_texts: Vec<String>,
    idempotency_tokens: Vec<String>,
    exchanged_codes: Vec<(String, Option<String>)>,
}

/// Scriptable mock adapter
#[derive(Clone, Default)]
pub struct MockAdapter {
    state: Arc<Mutex<MockState>>,
    delay: Duration,
}

impl MockAdapter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Mock with simulated latency on every call
    pub fn with_delay(delay: Duration) -> Self {
        Self {
            state: Arc::default(),
            delay,
        }
    }

    /// Queue the next publish result
    pub fn push_publish(&self, result: Result<PublishOutcome, PlatformError>) {
        self.state.lock().unwrap().publish_script.push_back(result);
    }

    /// Queue the next refresh result
    pub fn push_refresh(&self, result: Result<CredentialUpdate, PlatformError>) {
        self.state.lock().unwrap().refresh_script.push_back(result);
    }

    /// Queue the next code-exchange result
    pub fn push_exchange(&self, result: Result<Credential, PlatformError>) {
        self.state.lock().unwrap().exchange_script.push_back(result);
    }

    pub fn publish_calls(&self) -> usize {
        self.state.lock().unwrap().publish_calls
    }

    pub fn refresh_calls(&self) -> usize {
        self.state.lock().unwrap().refresh_calls
    }

    pub fn exchange_calls(&self) -> usize {
        self.state.lock().unwrap().exchange_calls
    }

    /// Texts passed to publish, in call order
    pub fn published_texts(&self) -> Vec<String> {
        self.state.lock().unwrap().published_texts.clone()
    }

    /// Idempotency tokens seen by publish, in call order
    pub fn idempotency_tokens(&self) -> Vec<String> {
        self.state.lock().unwrap().idempotency_tokens.clone()
    }

    /// (code, pkce_verifier) pairs seen by exchange, in call order
    pub fn exchanged_codes(&self) -> Vec<(String, Option<String>)> {
        self.state.lock().unwrap().exchanged_codes.clone()
    }
}

#[async_trait]
impl PlatformAdapter for MockAdapter {
    fn id(&self) -> PlatformId {
        PlatformId::Mock
    }

    async fn publish(
        &self,
        _credential: &Credential,
        content: &PublishContent,
        _options: &serde_json::Value,
        idempotency_token: &str,
    ) -> Result<PublishOutcome, PlatformError> {
        if !self.delay.is_zero() {
            sleep(self.delay).await;
        }

        let mut state = self.state.lock().unwrap();
        state.publish_calls += 1;
        state.published_texts.push(content.text.clone());
        state.idempotency_tokens.push(idempotency_token.to_string());

        let call = state.publish_calls;
        state.publish_script.pop_front().unwrap_or_else(|| {
            Ok(PublishOutcome {
                remote_id: format!("mock-{}", call),
                canonical_url: format!("https://mock.invalid/p/mock-{}", call),
            })
        })
    }

    async fn exchange(
        &self,
        code: &str,
        pkce_verifier: Option<&str>,
    ) -> Result<Credential, PlatformError> {
        if !self.delay.is_zero() {
            sleep(self.delay).await;
        }

        let mut state = self.state.lock().unwrap();
        state.exchange_calls += 1;
        state
            .exchanged_codes
            .push((code.to_string(), pkce_verifier.map(|v| v.to_string())));

        let call = state.exchange_calls;
        state.exchange_script.pop_front().unwrap_or_else(|| {
            Ok(Credential::new(
                SecretString::from(format!("mock-access-{}", call)),
                Some(SecretString::from(format!("mock-refresh-{}", call))),
                None,
                None,
                vec!["mock:write".to_string()],
                None,
            ))
        })
    }

    async fn refresh(
        &self,
        _credential: &Credential,
    ) -> Result<CredentialUpdate, PlatformError> {
        if !self.delay.is_zero() {
            sleep(self.delay).await;
        }

        let mut state = self.state.lock().unwrap();
        state.refresh_calls += 1;

        let call = state.refresh_calls;
        state.refresh_script.pop_front().unwrap_or_else(|| {
            Ok(CredentialUpdate {
                access_secret: Some(SecretString::from(format!("mock-refreshed-{}", call))),
                refresh_secret: Some(SecretString::from(format!("mock-rotated-{}", call))),
                ..Default::default()
            })
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn dummy_credential() -> Credential {
        Credential::new(
            SecretString::from("t".to_string()),
            None,
            None,
            None,
            vec![],
            None,
        )
    }

    #[tokio::test]
    async fn test_scripted_then_default_publish() {
        let mock = MockAdapter::new();
        mock.push_publish(Err(PlatformError::Upstream {
            status: 503,
            body: "maintenance".to_string(),
        }));

        let credential = dummy_credential();
        let content = PublishContent::text("hi");
        let options = serde_json::json!({});

        let first = mock.publish(&credential, &content, &options, "tok").await;
        assert!(first.is_err());

        let second = mock
            .publish(&credential, &content, &options, "tok")
            .await
            .unwrap();
        assert_eq!(second.remote_id, "mock-2");
        assert_eq!(mock.publish_calls(), 2);
        assert_eq!(mock.idempotency_tokens(), vec!["tok", "tok"]);
    }

    #[tokio::test]
    async fn test_clones_share_state() {
        let mock = MockAdapter::new();
        let handle = mock.clone();

        mock.publish(
            &dummy_credential(),
            &PublishContent::text("shared"),
            &serde_json::json!({}),
            "tok",
        )
        .await
        .unwrap();

        assert_eq!(handle.publish_calls(), 1);
        assert_eq!(handle.published_texts(), vec!["shared"]);
    }

    #[tokio::test]
    async fn test_exchange_records_verifier() {
        let mock = MockAdapter::new();
        mock.exchange("code-1", Some("verifier-1")).await.unwrap();
        mock.exchange("code-2", None).await.unwrap();

        assert_eq!(
            mock.exchanged_codes(),
            vec![
                ("code-1".to_string(), Some("verifier-1".to_string())),
                ("code-2".to_string(), None),
            ]
        );
    }
}
