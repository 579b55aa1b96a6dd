use tracing::debug;

use super::types::SystemContextComponents;
use crate::database::ChunkMatch;
use crate::utils::token_estimator::{estimate_tokens, would_exceed_limit};

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ContextMetrics {
    pub chunks_used: usize,
    pub estimated_tokens: usize,
    pub truncated: bool,
}

/// Assembles the system message: instruction, summary and retrieved knowledge.
pub struct ContextBuilder {
    default_instruction: String,
    max_context_tokens: usize,
}

impl ContextBuilder {
    pub fn new(default_instruction: String, max_context_tokens: usize) -> Self {
        Self {
            default_instruction,
            max_context_tokens,
        }
    }

    pub fn default_base_instruction() -> String {
        r#"You are the customer support assistant for this business, answering messages sent to its page.

Guidelines:
- Answer from the knowledge provided below when it is relevant
- If the knowledge does not cover the question, say so and offer to connect a human agent
- Keep replies short and friendly, suitable for a chat window
- Never invent prices, policies or opening hours"#
            .to_string()
    }

    /// Knowledge section from ranked chunks, stopping before the token budget.
    pub fn build_retrieval_context(&self, chunks: &[ChunkMatch]) -> (String, ContextMetrics) {
        let mut metrics = ContextMetrics::default();
        if chunks.is_empty() {
            return (String::new(), metrics);
        }

        let mut context = String::from("Relevant knowledge:\n");
        let mut used_tokens = estimate_tokens(&context);

        for (i, chunk) in chunks.iter().enumerate() {
            let source = chunk
                .metadata
                .get("source")
                .and_then(|s| s.as_str())
                .unwrap_or("document");
            let entry = format!("[{}] ({}) {}\n", i + 1, source, chunk.content.trim());

            if would_exceed_limit(used_tokens, &entry, self.max_context_tokens) {
                debug!(
                    "Context budget reached after {} of {} chunks",
                    metrics.chunks_used,
                    chunks.len()
                );
                metrics.truncated = true;
                break;
            }

            used_tokens += estimate_tokens(&entry);
            context.push_str(&entry);
            metrics.chunks_used += 1;
        }

        metrics.estimated_tokens = used_tokens;
        if metrics.chunks_used == 0 {
            return (String::new(), metrics);
        }
        (context, metrics)
    }

    pub fn build_system_context(
        &self,
        tenant_instruction: Option<&str>,
        summary: Option<&str>,
        retrieval_context: String,
    ) -> String {
        let base_instruction = tenant_instruction
            .filter(|s| !s.trim().is_empty())
            .map(str::to_string)
            .unwrap_or_else(|| self.default_instruction.clone());

        SystemContextComponents {
            base_instruction,
            summary: summary.map(str::to_string),
            retrieval_context,
        }
        .build()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use uuid::Uuid;

    fn chunk(content: &str) -> ChunkMatch {
        ChunkMatch {
            id: Uuid::new_v4(),
            content: content.into(),
            metadata: json!({"source": "faq.pdf"}),
            similarity: 0.9,
        }
    }

    #[test]
    fn stops_at_token_budget() {
        let builder = ContextBuilder::new("base".into(), 60);
        let long = "word ".repeat(30);
        let (context, metrics) = builder.build_retrieval_context(&[
            chunk("Shipping takes 3 days."),
            chunk(&long),
            chunk("Returns within 30 days."),
        ]);

        assert_eq!(metrics.chunks_used, 1);
        assert!(metrics.truncated);
        assert!(context.contains("(faq.pdf) Shipping takes 3 days."));
        assert!(!context.contains("Returns"));
    }

    #[test]
    fn system_context_prefers_tenant_instruction() {
        let builder = ContextBuilder::new("default".into(), 500);
        let system = builder.build_system_context(
            Some("You are Ana from Bakery Co."),
            Some("Customer asked about cakes."),
            "Relevant knowledge:\n[1] (menu) Cakes from $20\n".into(),
        );
        assert!(system.starts_with("You are Ana from Bakery Co."));
        assert!(system.contains("Conversation so far:\nCustomer asked about cakes."));
        assert!(system.contains("Cakes from $20"));

        let fallback = builder.build_system_context(Some("  "), None, String::new());
        assert_eq!(fallback, "default");
    }
}
