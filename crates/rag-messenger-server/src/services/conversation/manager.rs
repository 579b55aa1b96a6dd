use std::sync::Arc;

use anyhow::Result;
use async_trait::async_trait;
use thiserror::Error;
use tracing::{debug, info, warn};
use uuid::Uuid;

use super::types::{ConversationMemory, MemoryTurn};
use crate::config::MemoryConfig;
use crate::database::{ConversationStore, StoreError};
use crate::services::llm::{ChatMessage, GenerationConfig, LlmGateway};

#[derive(Error, Debug)]
pub enum MemoryError {
    #[error("conversation {0} not found")]
    ConversationNotFound(Uuid),

    #[error(transparent)]
    Store(#[from] StoreError),
}

/// Condenses older turns into a short summary.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait Summarizer: Send + Sync {
    async fn summarize(&self, config: &GenerationConfig, turns: &[MemoryTurn]) -> Result<String>;
}

const SUMMARY_INSTRUCTION: &str = "Summarize the conversation above in at most three sentences. \
Keep facts the customer shared (names, orders, preferences) and any open questions. \
Reply with the summary only.";

#[async_trait]
impl Summarizer for LlmGateway {
    async fn summarize(&self, config: &GenerationConfig, turns: &[MemoryTurn]) -> Result<String> {
        let mut messages: Vec<ChatMessage> = turns.iter().map(MemoryTurn::to_chat_message).collect();
        messages.push(ChatMessage::user(SUMMARY_INSTRUCTION));

        let config = GenerationConfig {
            temperature: 0.2,
            max_tokens: config.max_tokens.min(300),
            system_prompt: Some("You write compact summaries of support chats.".to_string()),
            ..config.clone()
        };

        let response = self.generate(&config, &messages).await?;
        Ok(response.text.trim().to_string())
    }
}

/// Loads, bounds and persists per-conversation memory.
pub struct MemoryManager {
    store: Arc<dyn ConversationStore>,
    summarizer: Arc<dyn Summarizer>,
    config: MemoryConfig,
}

impl MemoryManager {
    pub fn new(
        store: Arc<dyn ConversationStore>,
        summarizer: Arc<dyn Summarizer>,
        config: MemoryConfig,
    ) -> Self {
        Self {
            store,
            summarizer,
            config,
        }
    }

    /// Most recent `window` messages (oldest first) plus the stored summary.
    pub async fn load(&self, conversation_id: Uuid) -> Result<ConversationMemory, MemoryError> {
        let conversation = self
            .store
            .conversation(conversation_id)
            .await?
            .ok_or(MemoryError::ConversationNotFound(conversation_id))?;

        let messages = self
            .store
            .recent_messages(conversation_id, self.config.window)
            .await?;

        debug!(
            conversation_id = %conversation_id,
            "Loaded memory window of {} messages",
            messages.len()
        );

        Ok(ConversationMemory {
            conversation_id,
            window: messages.iter().map(MemoryTurn::from).collect(),
            summary: conversation.notes.filter(|n| !n.trim().is_empty()),
        })
    }

    /// In-memory append; the oldest turns fall off past the hard cap.
    pub fn append(&self, memory: &mut ConversationMemory, turn: MemoryTurn) {
        memory.window.push(turn);
        let overflow = memory.window.len().saturating_sub(self.config.hard_cap);
        if overflow > 0 {
            memory.window.drain(..overflow);
        }
    }

    /// Summarizes the older part of the window once it passes the threshold.
    ///
    /// Keeps the last `keep_recent` turns and folds the rest into the summary.
    /// When summarization fails the window is kept, bounded by the hard cap.
    pub async fn reconcile(
        &self,
        mut memory: ConversationMemory,
        generation: &GenerationConfig,
    ) -> ConversationMemory {
        if memory.window.len() <= self.config.summarize_threshold {
            return memory;
        }

        let split = memory.window.len() - self.config.keep_recent;
        let older = &memory.window[..split];

        match self.summarizer.summarize(generation, older).await {
            Ok(fresh) if !fresh.is_empty() => {
                let merged = merge_summaries(
                    memory.summary.as_deref(),
                    &fresh,
                    self.config.summary_max_chars,
                );
                info!(
                    conversation_id = %memory.conversation_id,
                    "Summarized {} older turns, keeping {}",
                    split,
                    self.config.keep_recent
                );
                memory.window.drain(..split);
                memory.summary = Some(merged);
            }
            Ok(_) => {
                warn!(
                    conversation_id = %memory.conversation_id,
                    "Summarizer returned empty text, keeping full window"
                );
                self.cap_window(&mut memory);
            }
            Err(e) => {
                warn!(
                    conversation_id = %memory.conversation_id,
                    error = %e,
                    "Summarization failed, keeping full window"
                );
                self.cap_window(&mut memory);
            }
        }

        memory
    }

    /// Writes the summary to the conversation notes.
    pub async fn persist(&self, memory: &ConversationMemory) -> Result<(), MemoryError> {
        if let Some(summary) = &memory.summary {
            self.store
                .update_notes(memory.conversation_id, summary)
                .await?;
        }
        Ok(())
    }

    fn cap_window(&self, memory: &mut ConversationMemory) {
        let overflow = memory.window.len().saturating_sub(self.config.hard_cap);
        memory.window.drain(..overflow);
    }
}

/// `existing + fresh`, trimmed from the front to `max_chars` on a word boundary.
pub fn merge_summaries(existing: Option<&str>, fresh: &str, max_chars: usize) -> String {
    let merged = match existing.map(str::trim).filter(|s| !s.is_empty()) {
        Some(existing) => format!("{} {}", existing, fresh.trim()),
        None => fresh.trim().to_string(),
    };

    let len = merged.chars().count();
    if len <= max_chars {
        return merged;
    }

    let tail: String = merged.chars().skip(len - max_chars).collect();
    match tail.find(char::is_whitespace) {
        Some(idx) if idx + 1 < tail.len() => tail[idx + 1..].to_string(),
        _ => tail,
    }
}
