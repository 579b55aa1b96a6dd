use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::models::{Message, MessageRole};
use crate::services::llm::ChatMessage;

/// One entry of the memory window.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MemoryTurn {
    pub role: MessageRole,
    pub text: String,
    /// Stored message this turn came from, if persisted.
    pub message_id: Option<Uuid>,
}

impl MemoryTurn {
    pub fn new(role: MessageRole, text: impl Into<String>) -> Self {
        Self {
            role,
            text: text.into(),
            message_id: None,
        }
    }

    pub fn to_chat_message(&self) -> ChatMessage {
        match self.role {
            MessageRole::User => ChatMessage::user(&self.text),
            MessageRole::Bot | MessageRole::Agent => ChatMessage::assistant(&self.text),
        }
    }
}

impl From<&Message> for MemoryTurn {
    fn from(message: &Message) -> Self {
        Self {
            role: message.role,
            text: message.text.clone(),
            message_id: Some(message.id),
        }
    }
}

/// Bounded recent window plus rolling summary for one conversation.
///
/// Only the summary is ever written back; the window is rebuilt from stored
/// messages on every load.
#[derive(Debug, Clone, PartialEq)]
pub struct ConversationMemory {
    pub conversation_id: Uuid,
    /// Oldest first.
    pub window: Vec<MemoryTurn>,
    pub summary: Option<String>,
}

impl ConversationMemory {
    pub fn contains_message(&self, message_id: Uuid) -> bool {
        self.window.iter().any(|t| t.message_id == Some(message_id))
    }

    pub fn to_chat_messages(&self) -> Vec<ChatMessage> {
        self.window.iter().map(MemoryTurn::to_chat_message).collect()
    }
}

/// Pieces of the system message sent with every reply.
#[derive(Debug, Clone)]
pub struct SystemContextComponents {
    /// Tenant persona or the default instruction.
    pub base_instruction: String,

    /// Rolling summary of older turns.
    pub summary: Option<String>,

    /// Retrieved knowledge, already bounded.
    pub retrieval_context: String,
}

impl SystemContextComponents {
    pub fn build(&self) -> String {
        let mut parts = vec![self.base_instruction.clone()];

        if let Some(summary) = self.summary.as_deref().filter(|s| !s.is_empty()) {
            parts.push(String::new());
            parts.push(format!("Conversation so far:\n{summary}"));
        }

        if !self.retrieval_context.is_empty() {
            parts.push(String::new());
            parts.push(self.retrieval_context.clone());
        }

        parts.join("\n")
    }
}
