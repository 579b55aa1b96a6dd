use std::time::Duration;

use async_trait::async_trait;
use reqwest::{Client, StatusCode};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::debug;

use crate::config::PlatformConfig;
use crate::models::CustomerProfile;

#[derive(Error, Debug)]
pub enum PlatformError {
    #[error("platform request failed: {0}")]
    Network(#[from] reqwest::Error),

    #[error("platform API error ({status}): {message}")]
    Api { status: u16, message: String },

    #[error("unexpected platform response: {0}")]
    InvalidResponse(String),
}

impl PlatformError {
    /// Network failures, throttling and 5xx are worth retrying.
    pub fn is_transient(&self) -> bool {
        match self {
            Self::Network(_) => true,
            Self::Api { status, .. } => {
                *status == StatusCode::TOO_MANY_REQUESTS.as_u16() || *status >= 500
            }
            Self::InvalidResponse(_) => false,
        }
    }
}

/// Outbound calls to the messaging platform, tokens already decrypted.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait PlatformClient: Send + Sync {
    async fn fetch_profile(
        &self,
        access_token: &str,
        sender_id: &str,
    ) -> Result<CustomerProfile, PlatformError>;

    /// Sends a text reply and returns the platform message id.
    async fn send_text(
        &self,
        access_token: &str,
        recipient_id: &str,
        text: &str,
    ) -> Result<String, PlatformError>;
}

#[derive(Debug, Deserialize)]
struct ProfileResponse {
    #[serde(default)]
    first_name: Option<String>,
    #[serde(default)]
    last_name: Option<String>,
    #[serde(default)]
    profile_pic: Option<String>,
    #[serde(default)]
    locale: Option<String>,
}

#[derive(Debug, Serialize)]
struct SendRequest<'a> {
    recipient: Recipient<'a>,
    message: OutboundText<'a>,
    messaging_type: &'static str,
}

#[derive(Debug, Serialize)]
struct Recipient<'a> {
    id: &'a str,
}

#[derive(Debug, Serialize)]
struct OutboundText<'a> {
    text: &'a str,
}

#[derive(Debug, Deserialize)]
struct SendResponse {
    #[serde(default)]
    message_id: Option<String>,
}

/// Graph API client for page messaging.
pub struct GraphApiClient {
    client: Client,
    base_url: String,
}

impl GraphApiClient {
    pub fn new(config: &PlatformConfig) -> anyhow::Result<Self> {
        let client = Client::builder()
            .timeout(Duration::from_secs(config.timeout_seconds))
            .build()?;
        Ok(Self {
            client,
            base_url: format!(
                "{}/{}",
                config.graph_base_url.trim_end_matches('/'),
                config.api_version
            ),
        })
    }

    async fn check(response: reqwest::Response) -> Result<reqwest::Response, PlatformError> {
        let status = response.status();
        if status.is_success() {
            return Ok(response);
        }
        let body = response.text().await.unwrap_or_default();
        Err(PlatformError::Api {
            status: status.as_u16(),
            message: body,
        })
    }
}

#[async_trait]
impl PlatformClient for GraphApiClient {
    async fn fetch_profile(
        &self,
        access_token: &str,
        sender_id: &str,
    ) -> Result<CustomerProfile, PlatformError> {
        let response = self
            .client
            .get(format!("{}/{}", self.base_url, sender_id))
            .query(&[
                ("fields", "first_name,last_name,profile_pic,locale"),
                ("access_token", access_token),
            ])
            .send()
            .await?;
        let profile: ProfileResponse = Self::check(response).await?.json().await?;

        let name = match (profile.first_name, profile.last_name) {
            (Some(first), Some(last)) => Some(format!("{first} {last}")),
            (first, last) => first.or(last),
        };

        Ok(CustomerProfile {
            name,
            locale: profile.locale,
            avatar_url: profile.profile_pic,
        })
    }

    async fn send_text(
        &self,
        access_token: &str,
        recipient_id: &str,
        text: &str,
    ) -> Result<String, PlatformError> {
        debug!(recipient_id, chars = text.chars().count(), "Sending platform message");

        let request = SendRequest {
            recipient: Recipient { id: recipient_id },
            message: OutboundText { text },
            messaging_type: "RESPONSE",
        };
        let response = self
            .client
            .post(format!("{}/me/messages", self.base_url))
            .query(&[("access_token", access_token)])
            .json(&request)
            .send()
            .await?;
        let body: SendResponse = Self::check(response).await?.json().await?;

        body.message_id
            .ok_or_else(|| PlatformError::InvalidResponse("missing message_id".into()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use wiremock::matchers::{body_json, method, path, query_param};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn client(server: &MockServer) -> GraphApiClient {
        GraphApiClient::new(&PlatformConfig {
            graph_base_url: server.uri(),
            api_version: "v19.0".into(),
            timeout_seconds: 5,
        })
        .unwrap()
    }

    #[tokio::test]
    async fn send_text_returns_platform_id() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/v19.0/me/messages"))
            .and(query_param("access_token", "page-token"))
            .and(body_json(json!({
                "recipient": {"id": "psid1"},
                "message": {"text": "hello"},
                "messaging_type": "RESPONSE"
            })))
            .respond_with(
                ResponseTemplate::new(200)
                    .set_body_json(json!({"recipient_id": "psid1", "message_id": "m_abc"})),
            )
            .mount(&server)
            .await;

        let mid = client(&server)
            .send_text("page-token", "psid1", "hello")
            .await
            .unwrap();
        assert_eq!(mid, "m_abc");
    }

    #[tokio::test]
    async fn server_errors_are_transient_client_errors_are_not() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/v19.0/me/messages"))
            .and(query_param("access_token", "throttled"))
            .respond_with(ResponseTemplate::new(503))
            .mount(&server)
            .await;
        Mock::given(method("POST"))
            .and(path("/v19.0/me/messages"))
            .and(query_param("access_token", "revoked"))
            .respond_with(ResponseTemplate::new(400).set_body_string("invalid token"))
            .mount(&server)
            .await;

        let c = client(&server);
        let err = c.send_text("throttled", "psid1", "hi").await.unwrap_err();
        assert!(err.is_transient());
        let err = c.send_text("revoked", "psid1", "hi").await.unwrap_err();
        assert!(!err.is_transient());
        assert!(err.to_string().contains("invalid token"));
    }

    #[tokio::test]
    async fn fetch_profile_joins_names() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/v19.0/psid9"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "first_name": "Ana",
                "last_name": "Lopez",
                "profile_pic": "https://cdn/p.png",
                "locale": "es_ES"
            })))
            .mount(&server)
            .await;

        let profile = client(&server).fetch_profile("t", "psid9").await.unwrap();
        assert_eq!(profile.name.as_deref(), Some("Ana Lopez"));
        assert_eq!(profile.locale.as_deref(), Some("es_ES"));
        assert_eq!(profile.avatar_url.as_deref(), Some("https://cdn/p.png"));
    }
}
