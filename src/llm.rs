//! Text-generation providers.
//!
//! | `provider` | Endpoint |
//! |------------|----------|
//! | `"openai"` | `POST {url}/chat/completions` (OpenAI or any compatible gateway) |
//! | `"ollama"` | `POST {url}/api/chat` |
//!
//! Engines name a model id (`llm_type`); [`LlmRegistry`] resolves it against
//! `[llm.models.<id>]`. Provider failures surface as errors the query
//! service reports as internal.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::{anyhow, bail, Result};
use async_trait::async_trait;
use rag_harness_core::llm::{ChatRole, ChatTurn, LanguageModel};
use serde::{Deserialize, Serialize};

use crate::config::{Config, LlmModelConfig};
use crate::http::send_json_with_retry;

#[derive(Debug, Serialize)]
struct ChatMessage<'a> {
    role: ChatRole,
    content: &'a str,
}

/// Prior turns followed by the new prompt as a user message.
fn chat_messages<'a>(prompt: &'a str, chat_context: &'a [ChatTurn]) -> Vec<ChatMessage<'a>> {
    chat_context
        .iter()
        .map(|turn| ChatMessage {
            role: turn.role,
            content: &turn.content,
        })
        .chain(std::iter::once(ChatMessage {
            role: ChatRole::User,
            content: prompt,
        }))
        .collect()
}

// ============ OpenAI ============

#[derive(Debug, Serialize)]
struct OpenAiChatRequest<'a> {
    model: &'a str,
    messages: Vec<ChatMessage<'a>>,
    temperature: f32,
}

#[derive(Debug, Deserialize)]
struct OpenAiChatResponse {
    choices: Vec<OpenAiChoice>,
}

#[derive(Debug, Deserialize)]
struct OpenAiChoice {
    message: OpenAiMessage,
}

#[derive(Debug, Deserialize)]
struct OpenAiMessage {
    content: Option<String>,
}

pub struct OpenAiChatModel {
    model: String,
    context_length: Option<usize>,
    base_url: String,
    api_key: String,
    temperature: f32,
    max_retries: u32,
    client: reqwest::Client,
}

impl OpenAiChatModel {
    pub fn new(config: &LlmModelConfig) -> Result<Self> {
        let key_env = config.api_key_env.as_deref().unwrap_or("OPENAI_API_KEY");
        let api_key = std::env::var(key_env)
            .map_err(|_| anyhow!("{} environment variable not set", key_env))?;
        Ok(Self {
            model: config.model.clone(),
            context_length: config.context_length,
            base_url: config
                .url
                .clone()
                .unwrap_or_else(|| "https://api.openai.com/v1".to_string()),
            api_key,
            temperature: config.temperature,
            max_retries: config.max_retries,
            client: reqwest::Client::builder()
                .timeout(Duration::from_secs(config.timeout_secs))
                .build()?,
        })
    }
}

#[async_trait]
impl LanguageModel for OpenAiChatModel {
    fn model_name(&self) -> &str {
        &self.model
    }

    fn context_length(&self) -> Option<usize> {
        self.context_length
    }

    async fn generate(&self, prompt: &str, chat_context: &[ChatTurn]) -> Result<String> {
        let url = format!("{}/chat/completions", self.base_url.trim_end_matches('/'));
        let request = OpenAiChatRequest {
            model: &self.model,
            messages: chat_messages(prompt, chat_context),
            temperature: self.temperature,
        };
        let json = send_json_with_retry("OpenAI", self.max_retries, || {
            self.client
                .post(&url)
                .bearer_auth(&self.api_key)
                .json(&request)
        })
        .await?;
        let response: OpenAiChatResponse = serde_json::from_value(json)?;
        response
            .choices
            .into_iter()
            .next()
            .and_then(|c| c.message.content)
            .ok_or_else(|| anyhow!("OpenAI response has no message content"))
    }
}

// ============ Ollama ============

#[derive(Debug, Serialize)]
struct OllamaChatRequest<'a> {
    model: &'a str,
    messages: Vec<ChatMessage<'a>>,
    stream: bool,
    options: OllamaOptions,
}

#[derive(Debug, Serialize)]
struct OllamaOptions {
    temperature: f32,
    #[serde(skip_serializing_if = "Option::is_none")]
    num_ctx: Option<usize>,
}

#[derive(Debug, Deserialize)]
struct OllamaChatResponse {
    message: OllamaMessage,
}

#[derive(Debug, Deserialize)]
struct OllamaMessage {
    content: String,
}

pub struct OllamaChatModel {
    model: String,
    context_length: Option<usize>,
    url: String,
    temperature: f32,
    max_retries: u32,
    client: reqwest::Client,
}

impl OllamaChatModel {
    pub fn new(config: &LlmModelConfig) -> Result<Self> {
        Ok(Self {
            model: config.model.clone(),
            context_length: config.context_length,
            url: config
                .url
                .clone()
                .unwrap_or_else(|| "http://localhost:11434".to_string()),
            temperature: config.temperature,
            max_retries: config.max_retries,
            client: reqwest::Client::builder()
                .timeout(Duration::from_secs(config.timeout_secs))
                .build()?,
        })
    }
}

#[async_trait]
impl LanguageModel for OllamaChatModel {
    fn model_name(&self) -> &str {
        &self.model
    }

    fn context_length(&self) -> Option<usize> {
        self.context_length
    }

    async fn generate(&self, prompt: &str, chat_context: &[ChatTurn]) -> Result<String> {
        let url = format!("{}/api/chat", self.url.trim_end_matches('/'));
        let request = OllamaChatRequest {
            model: &self.model,
            messages: chat_messages(prompt, chat_context),
            stream: false,
            options: OllamaOptions {
                temperature: self.temperature,
                num_ctx: self.context_length,
            },
        };
        let json = send_json_with_retry("Ollama", self.max_retries, || {
            self.client.post(&url).json(&request)
        })
        .await?;
        let response: OllamaChatResponse = serde_json::from_value(json)?;
        Ok(response.message.content)
    }
}

// ============ Registry ============

pub fn create_language_model(id: &str, config: &LlmModelConfig) -> Result<Arc<dyn LanguageModel>> {
    match config.provider.as_str() {
        "openai" => Ok(Arc::new(OpenAiChatModel::new(config)?)),
        "ollama" => Ok(Arc::new(OllamaChatModel::new(config)?)),
        other => bail!("Unknown llm provider for '{}': {}", id, other),
    }
}

/// Language models keyed by model id, created on first use.
pub struct LlmRegistry {
    models: HashMap<String, LlmModelConfig>,
    summary_model: Option<String>,
    cache: Mutex<HashMap<String, Arc<dyn LanguageModel>>>,
}

impl LlmRegistry {
    pub fn from_config(config: &Config) -> Self {
        Self {
            models: config.llm.models.clone().into_iter().collect(),
            summary_model: config.llm.summary_model.clone(),
            cache: Mutex::new(HashMap::new()),
        }
    }

    pub fn insert(&self, id: &str, model: Arc<dyn LanguageModel>) {
        if let Ok(mut cache) = self.cache.lock() {
            cache.insert(id.to_string(), model);
        }
    }

    pub fn get(&self, id: &str) -> Result<Arc<dyn LanguageModel>> {
        let mut cache = self
            .cache
            .lock()
            .map_err(|_| anyhow!("llm cache lock poisoned"))?;
        if let Some(model) = cache.get(id) {
            return Ok(model.clone());
        }
        let config = self
            .models
            .get(id)
            .ok_or_else(|| anyhow!("llm model '{}' is not configured", id))?;
        let model = create_language_model(id, config)?;
        cache.insert(id.to_string(), model.clone());
        Ok(model)
    }

    /// Model used to summarize chat history: `llm.summary_model`, or the
    /// generating model itself.
    pub fn summarizer(&self, generating_id: &str) -> Result<Arc<dyn LanguageModel>> {
        self.get(self.summary_model.as_deref().unwrap_or(generating_id))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_chat_messages_appends_prompt() {
        let history = vec![ChatTurn::user("hi"), ChatTurn::assistant("hello")];
        let messages = chat_messages("next?", &history);
        let json = serde_json::to_value(&messages).unwrap();
        assert_eq!(
            json,
            serde_json::json!([
                {"role": "user", "content": "hi"},
                {"role": "assistant", "content": "hello"},
                {"role": "user", "content": "next?"},
            ])
        );
    }

    #[test]
    fn test_ollama_request_serialization() {
        let request = OllamaChatRequest {
            model: "llama3",
            messages: chat_messages("q", &[]),
            stream: false,
            options: OllamaOptions {
                temperature: 0.5,
                num_ctx: None,
            },
        };
        let json = serde_json::to_value(&request).unwrap();
        assert_eq!(json["stream"], false);
        assert!(json["options"].get("num_ctx").is_none());
    }

    #[test]
    fn test_openai_response_parse() {
        let response: OpenAiChatResponse = serde_json::from_value(serde_json::json!({
            "choices": [{"message": {"role": "assistant", "content": "answer"}}]
        }))
        .unwrap();
        assert_eq!(response.choices[0].message.content.as_deref(), Some("answer"));
    }

    #[test]
    fn test_registry_unknown_model() {
        let dir = tempfile::tempdir().unwrap();
        let registry = LlmRegistry::from_config(&Config::for_root(dir.path()));
        assert!(registry.get("nope").is_err());
        assert!(registry.summarizer("nope").is_err());
    }
}
