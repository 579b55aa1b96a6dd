use anyhow::{Context, Result};
use async_trait::async_trait;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use tracing::debug;

use super::provider::{
    ChatMessage, ChatRole, GenerationConfig, GenerationResponse, Provider, ProviderAdapter,
};
use crate::models::TokenUsage;

const ANTHROPIC_VERSION: &str = "2023-06-01";

#[derive(Debug, Serialize)]
struct MessagesRequest<'a> {
    model: &'a str,
    max_tokens: u32,
    temperature: f32,
    #[serde(skip_serializing_if = "Option::is_none")]
    system: Option<String>,
    messages: Vec<&'a ChatMessage>,
}

#[derive(Debug, Deserialize)]
struct MessagesResponse {
    #[serde(default)]
    content: Vec<ContentBlock>,
    #[serde(default)]
    usage: Option<Usage>,
}

#[derive(Debug, Deserialize)]
struct ContentBlock {
    #[serde(rename = "type")]
    kind: String,
    #[serde(default)]
    text: Option<String>,
}

#[derive(Debug, Deserialize)]
struct Usage {
    #[serde(default)]
    input_tokens: u32,
    #[serde(default)]
    output_tokens: u32,
}

/// Anthropic Messages API adapter.
pub struct AnthropicAdapter {
    client: Client,
    endpoint: String,
}

impl AnthropicAdapter {
    pub fn new(client: Client, base_url: &str) -> Self {
        Self {
            client,
            endpoint: format!("{}/v1/messages", base_url.trim_end_matches('/')),
        }
    }
}

#[async_trait]
impl ProviderAdapter for AnthropicAdapter {
    fn provider(&self) -> Provider {
        Provider::Anthropic
    }

    async fn generate(
        &self,
        config: &GenerationConfig,
        messages: &[ChatMessage],
    ) -> Result<GenerationResponse> {
        debug!("Calling anthropic with {} messages", messages.len());

        // The Messages API takes system text out of band.
        let system_parts: Vec<&str> = config
            .system_prompt
            .as_deref()
            .into_iter()
            .chain(
                messages
                    .iter()
                    .filter(|m| m.role == ChatRole::System)
                    .map(|m| m.content.as_str()),
            )
            .collect();
        let system = (!system_parts.is_empty()).then(|| system_parts.join("\n\n"));

        let request = MessagesRequest {
            model: &config.model,
            max_tokens: config.max_tokens,
            temperature: config.temperature,
            system,
            messages: messages
                .iter()
                .filter(|m| m.role != ChatRole::System)
                .collect(),
        };

        let response = self
            .client
            .post(&self.endpoint)
            .header("x-api-key", &config.api_key)
            .header("anthropic-version", ANTHROPIC_VERSION)
            .json(&request)
            .send()
            .await
            .context("Failed to call messages API")?;

        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            anyhow::bail!("API error ({}): {}", status, body);
        }

        let body: MessagesResponse = response
            .json()
            .await
            .context("Failed to parse messages response")?;

        let text = body
            .content
            .iter()
            .filter(|block| block.kind == "text")
            .filter_map(|block| block.text.as_deref())
            .collect::<Vec<_>>()
            .join("");

        Ok(GenerationResponse {
            text,
            usage: body.usage.map(|u| TokenUsage {
                prompt_tokens: u.input_tokens,
                completion_tokens: u.output_tokens,
                total_tokens: u.input_tokens + u.output_tokens,
            }),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use wiremock::matchers::{body_partial_json, header, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    #[tokio::test]
    async fn moves_system_out_of_band_and_maps_usage() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/v1/messages"))
            .and(header("x-api-key", "ak-test"))
            .and(header("anthropic-version", ANTHROPIC_VERSION))
            .and(body_partial_json(json!({
                "model": "claude-3-5-haiku-latest",
                "system": "Be brief.\n\nContext: store opens at 9",
                "messages": [{"role": "user", "content": "when do you open?"}]
            })))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "content": [{"type": "text", "text": "At 9am."}],
                "usage": {"input_tokens": 20, "output_tokens": 4}
            })))
            .expect(1)
            .mount(&server)
            .await;

        let adapter = AnthropicAdapter::new(Client::new(), &server.uri());
        let config = GenerationConfig {
            provider: Provider::Anthropic,
            api_key: "ak-test".into(),
            model: "claude-3-5-haiku-latest".into(),
            temperature: 0.2,
            max_tokens: 200,
            system_prompt: Some("Be brief.".into()),
        };
        let response = adapter
            .generate(
                &config,
                &[
                    ChatMessage::system("Context: store opens at 9"),
                    ChatMessage::user("when do you open?"),
                ],
            )
            .await
            .unwrap();

        assert_eq!(response.text, "At 9am.");
        let usage = response.usage.unwrap();
        assert_eq!(usage.prompt_tokens, 20);
        assert_eq!(usage.total_tokens, 24);
    }
}
