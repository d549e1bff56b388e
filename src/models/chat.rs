//! Chat thread models.

use serde::{Deserialize, Serialize};

/// Author of a chat turn.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChatAuthor {
    User,
    Agent,
    System,
}

impl std::fmt::Display for ChatAuthor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ChatAuthor::User => write!(f, "user"),
            ChatAuthor::Agent => write!(f, "agent"),
            ChatAuthor::System => write!(f, "system"),
        }
    }
}

/// One message in a thread. Append-only; ordered by creation time.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChatTurn {
    pub thread_id: String,
    pub author: ChatAuthor,
    pub text: String,
    /// Epoch milliseconds.
    pub created_at: i64,
}

impl ChatTurn {
    pub fn agent(thread_id: impl Into<String>, text: impl Into<String>) -> Self {
        Self::new(thread_id, ChatAuthor::Agent, text)
    }

    pub fn user(thread_id: impl Into<String>, text: impl Into<String>) -> Self {
        Self::new(thread_id, ChatAuthor::User, text)
    }

    fn new(thread_id: impl Into<String>, author: ChatAuthor, text: impl Into<String>) -> Self {
        Self {
            thread_id: thread_id.into(),
            author,
            text: text.into(),
            created_at: chrono::Utc::now().timestamp_millis(),
        }
    }
}

/// Body of a chat turn request.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChatRequest {
    pub message: String,
    pub document_id: String,
    pub thread_id: String,
}

/// Prompt + completion unit counts reported at the end of a model stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TokenUsage {
    #[serde(rename = "promptTokens")]
    pub prompt: u64,
    #[serde(rename = "completionTokens")]
    pub completion: u64,
}

impl TokenUsage {
    pub fn total(&self) -> u64 {
        self.prompt + self.completion
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_author_display() {
        assert_eq!(ChatAuthor::Agent.to_string(), "agent");
        assert_eq!(ChatAuthor::User.to_string(), "user");
    }

    #[test]
    fn test_usage_total() {
        let usage = TokenUsage { prompt: 12, completion: 30 };
        assert_eq!(usage.total(), 42);
    }
}
