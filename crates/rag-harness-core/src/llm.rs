//! Text-generation trait.
//!
//! Providers (OpenAI chat completions, Ollama) implement [`LanguageModel`]
//! in the app crate. The context assembler only needs `generate`.

use anyhow::Result;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChatRole {
    System,
    User,
    Assistant,
}

/// One prior message forwarded to chat-capable providers.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChatTurn {
    pub role: ChatRole,
    pub content: String,
}

impl ChatTurn {
    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: ChatRole::User,
            content: content.into(),
        }
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self {
            role: ChatRole::Assistant,
            content: content.into(),
        }
    }
}

#[async_trait]
pub trait LanguageModel: Send + Sync {
    /// Model identifier sent to the provider.
    fn model_name(&self) -> &str;

    /// Maximum prompt size in tokens, if the model declares one.
    fn context_length(&self) -> Option<usize>;

    /// Generate a completion for `prompt`, optionally continuing a chat.
    async fn generate(&self, prompt: &str, chat_context: &[ChatTurn]) -> Result<String>;
}
