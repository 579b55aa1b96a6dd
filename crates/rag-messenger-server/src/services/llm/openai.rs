use anyhow::{Context, Result};
use async_trait::async_trait;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use tracing::debug;

use super::provider::{ChatMessage, GenerationConfig, GenerationResponse, Provider, ProviderAdapter};
use crate::models::TokenUsage;

#[derive(Debug, Serialize)]
struct ChatCompletionRequest<'a> {
    model: &'a str,
    messages: Vec<&'a ChatMessage>,
    max_tokens: u32,
    temperature: f32,
    stream: bool,
}

#[derive(Debug, Deserialize)]
struct ChatCompletionResponse {
    choices: Vec<Choice>,
    #[serde(default)]
    usage: Option<Usage>,
}

#[derive(Debug, Deserialize)]
struct Choice {
    message: ResponseMessage,
}

#[derive(Debug, Deserialize)]
struct ResponseMessage {
    #[serde(default)]
    content: Option<String>,
}

#[derive(Debug, Deserialize)]
struct Usage {
    #[serde(default)]
    prompt_tokens: u32,
    #[serde(default)]
    completion_tokens: u32,
    #[serde(default)]
    total_tokens: u32,
}

/// Chat-completions adapter. Serves OpenAI and any backend exposing the same
/// surface, Gemini's OpenAI-compatible endpoint included.
pub struct OpenAiCompatibleAdapter {
    client: Client,
    endpoint: String,
    provider: Provider,
}

impl OpenAiCompatibleAdapter {
    pub fn openai(client: Client, base_url: &str) -> Self {
        Self {
            client,
            endpoint: format!("{}/v1/chat/completions", base_url.trim_end_matches('/')),
            provider: Provider::OpenAi,
        }
    }

    pub fn gemini(client: Client, base_url: &str) -> Self {
        Self {
            client,
            endpoint: format!("{}/chat/completions", base_url.trim_end_matches('/')),
            provider: Provider::Gemini,
        }
    }
}

#[async_trait]
impl ProviderAdapter for OpenAiCompatibleAdapter {
    fn provider(&self) -> Provider {
        self.provider
    }

    async fn generate(
        &self,
        config: &GenerationConfig,
        messages: &[ChatMessage],
    ) -> Result<GenerationResponse> {
        debug!("Calling {} with {} messages", self.provider, messages.len());

        let system = config.system_prompt.as_ref().map(ChatMessage::system);
        let request = ChatCompletionRequest {
            model: &config.model,
            messages: system.iter().chain(messages.iter()).collect(),
            max_tokens: config.max_tokens,
            temperature: config.temperature,
            stream: false,
        };

        let response = self
            .client
            .post(&self.endpoint)
            .bearer_auth(&config.api_key)
            .json(&request)
            .send()
            .await
            .context("Failed to call chat completions API")?;

        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            anyhow::bail!("API error ({}): {}", status, body);
        }

        let body: ChatCompletionResponse = response
            .json()
            .await
            .context("Failed to parse chat completions response")?;

        let text = body
            .choices
            .into_iter()
            .next()
            .and_then(|c| c.message.content)
            .unwrap_or_default();

        Ok(GenerationResponse {
            text,
            usage: body.usage.map(|u| TokenUsage {
                prompt_tokens: u.prompt_tokens,
                completion_tokens: u.completion_tokens,
                total_tokens: u.total_tokens,
            }),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::services::llm::provider::ChatRole;
    use serde_json::json;
    use wiremock::matchers::{body_partial_json, header, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn config() -> GenerationConfig {
        GenerationConfig {
            provider: Provider::OpenAi,
            api_key: "sk-test".into(),
            model: "gpt-4o-mini".into(),
            temperature: 0.3,
            max_tokens: 128,
            system_prompt: Some("You are a helpful shop assistant.".into()),
        }
    }

    #[tokio::test]
    async fn sends_system_prompt_first_and_reads_usage() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/v1/chat/completions"))
            .and(header("authorization", "Bearer sk-test"))
            .and(body_partial_json(json!({
                "model": "gpt-4o-mini",
                "messages": [
                    {"role": "system", "content": "You are a helpful shop assistant."},
                    {"role": "user", "content": "hello"}
                ]
            })))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "choices": [{"message": {"role": "assistant", "content": "Hi there!"}}],
                "usage": {"prompt_tokens": 12, "completion_tokens": 3, "total_tokens": 15}
            })))
            .expect(1)
            .mount(&server)
            .await;

        let adapter = OpenAiCompatibleAdapter::openai(Client::new(), &server.uri());
        let response = adapter
            .generate(&config(), &[ChatMessage::user("hello")])
            .await
            .unwrap();

        assert_eq!(response.text, "Hi there!");
        assert_eq!(response.usage.unwrap().total_tokens, 15);
    }

    #[tokio::test]
    async fn gemini_uses_compat_path() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/v1beta/openai/chat/completions"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "choices": [{"message": {"content": "ok"}}]
            })))
            .mount(&server)
            .await;

        let adapter = OpenAiCompatibleAdapter::gemini(
            Client::new(),
            &format!("{}/v1beta/openai", server.uri()),
        );
        let response = adapter
            .generate(&config(), &[ChatMessage::user("hello")])
            .await
            .unwrap();
        assert_eq!(response.text, "ok");
        assert!(response.usage.is_none());
        assert_eq!(adapter.provider(), Provider::Gemini);
        assert_eq!(ChatMessage::user("x").role, ChatRole::User);
    }

    #[tokio::test]
    async fn http_error_carries_status() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(401).set_body_string("invalid api key"))
            .mount(&server)
            .await;

        let adapter = OpenAiCompatibleAdapter::openai(Client::new(), &server.uri());
        let err = adapter
            .generate(&config(), &[ChatMessage::user("hello")])
            .await
            .unwrap_err();
        assert!(err.to_string().contains("401"));
    }
}
