use crate::config::EmbeddingConfig;
use anyhow::{Context, Result};
use async_trait::async_trait;
use reqwest::Client;
use serde::Serialize;
use serde_json::Value;
use tracing::debug;

/// Text to vector.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait EmbeddingProvider: Send + Sync {
    async fn embed(&self, text: &str) -> Result<Vec<f32>>;
}

#[derive(Debug, Serialize)]
struct EmbeddingRequest<'a> {
    model: &'a str,
    input: &'a str,
    // llama.cpp servers read `content`
    content: &'a str,
}

/// HTTP client for an OpenAI-compatible or llama.cpp embedding endpoint.
#[derive(Clone)]
pub struct EmbeddingService {
    client: Client,
    base_url: String,
    model: String,
    api_key: Option<String>,
    dimension: usize,
}

impl EmbeddingService {
    pub fn new(config: &EmbeddingConfig) -> Self {
        Self {
            client: Client::builder()
                .timeout(std::time::Duration::from_secs(config.timeout_seconds))
                .build()
                .unwrap_or_else(|_| Client::new()),
            base_url: config.base_url.trim_end_matches('/').to_string(),
            model: config.model.clone(),
            api_key: config.api_key.clone().filter(|k| !k.is_empty()),
            dimension: config.dimension,
        }
    }

    async fn embed_internal(&self, text: &str) -> Result<Vec<f32>> {
        debug!("Generating embedding for {} chars", text.len());

        let request = EmbeddingRequest {
            model: &self.model,
            input: text,
            content: text,
        };

        let url = format!("{}/embeddings", self.base_url);
        let mut builder = self.client.post(&url).json(&request);
        if let Some(key) = &self.api_key {
            builder = builder.bearer_auth(key);
        }

        let response = builder
            .send()
            .await
            .context("Failed to connect to embedding server")?;

        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            anyhow::bail!("Embedding API error ({}): {}", status, body);
        }

        let json_value: Value = response
            .json()
            .await
            .context("Failed to parse embedding response as JSON")?;

        let embedding = parse_embedding(&json_value)?;

        if embedding.len() != self.dimension {
            anyhow::bail!(
                "Embedding dimension mismatch: expected {}, got {}",
                self.dimension,
                embedding.len()
            );
        }

        Ok(embedding)
    }
}

/// Accepts the response shapes seen in the wild:
/// `{"data":[{"embedding":[..]}]}`, `{"embedding":[..]}`,
/// `[{"embedding":[..]}]` and a bare `[..]`.
fn parse_embedding(json_value: &Value) -> Result<Vec<f32>> {
    let floats = |arr: &[Value]| -> Vec<f32> {
        arr.iter()
            .filter_map(|v| v.as_f64().map(|f| f as f32))
            .collect()
    };

    let embedding = match json_value {
        Value::Object(obj) => {
            if let Some(Value::Array(arr)) = obj.get("embedding") {
                floats(arr)
            } else if let Some(Value::Array(data)) = obj.get("data") {
                match data.first().and_then(|d| d.get("embedding")) {
                    Some(Value::Array(arr)) => floats(arr),
                    _ => anyhow::bail!("Unrecognized embedding response format: {}", json_value),
                }
            } else {
                anyhow::bail!("Unrecognized embedding response format: {}", json_value);
            }
        }
        Value::Array(arr) => match arr.first() {
            None => anyhow::bail!("Empty array returned from embedding server"),
            Some(first) => match first.get("embedding") {
                Some(Value::Array(inner)) => floats(inner),
                _ => floats(arr),
            },
        },
        _ => anyhow::bail!("Unrecognized embedding response format: {}", json_value),
    };

    if embedding.is_empty() {
        anyhow::bail!("Generated embedding is empty");
    }

    Ok(embedding)
}

#[async_trait]
impl EmbeddingProvider for EmbeddingService {
    async fn embed(&self, text: &str) -> Result<Vec<f32>> {
        self.embed_internal(text).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use wiremock::matchers::{header, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn config(base_url: String, dimension: usize) -> EmbeddingConfig {
        EmbeddingConfig {
            model: "text-embedding-3-small".into(),
            base_url,
            dimension,
            api_key: Some("sk-test".into()),
            timeout_seconds: 5,
        }
    }

    #[test]
    fn parses_known_shapes() {
        let shapes = [
            json!({"data": [{"embedding": [0.1, 0.2]}]}),
            json!({"embedding": [0.1, 0.2]}),
            json!([{"embedding": [0.1, 0.2]}]),
            json!([0.1, 0.2]),
        ];
        for shape in shapes {
            assert_eq!(parse_embedding(&shape).unwrap().len(), 2, "{shape}");
        }
        assert!(parse_embedding(&json!({"vector": [1.0]})).is_err());
        assert!(parse_embedding(&json!([])).is_err());
    }

    #[tokio::test]
    async fn embeds_through_openai_shape() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/embeddings"))
            .and(header("authorization", "Bearer sk-test"))
            .respond_with(
                ResponseTemplate::new(200)
                    .set_body_json(json!({"data": [{"embedding": [0.1, 0.2, 0.3]}]})),
            )
            .mount(&server)
            .await;

        let service = EmbeddingService::new(&config(server.uri(), 3));
        let vector = service.embed("hello").await.unwrap();
        assert_eq!(vector, vec![0.1, 0.2, 0.3]);
    }

    #[tokio::test]
    async fn dimension_mismatch_is_rejected() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({"embedding": [0.1]})))
            .mount(&server)
            .await;

        let service = EmbeddingService::new(&config(server.uri(), 3));
        assert!(service.embed("hello").await.is_err());
    }

    #[tokio::test]
    async fn server_error_is_reported() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(503).set_body_string("loading model"))
            .mount(&server)
            .await;

        let service = EmbeddingService::new(&config(server.uri(), 3));
        let err = service.embed("hello").await.unwrap_err();
        assert!(err.to_string().contains("503"));
    }
}
