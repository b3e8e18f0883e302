//! Embedding providers.
//!
//! Implements `rag_harness_core::embedding::Embedder` for each backend:
//! - **[`OpenAiEmbedder`]**: `POST /v1/embeddings` on OpenAI or a compatible gateway.
//! - **[`OllamaEmbedder`]**: a local Ollama instance's `/api/embed` endpoint.
//! - **[`LocalEmbedder`]**: fastembed models run in-process (feature `local-models`).
//! - **[`VertexMultimodalEmbedder`]**: text+image pairs into a shared space.
//!
//! Engines name a model id (`embedding_type`), which [`EmbedderRegistry`]
//! resolves against `[embedding.models.<id>]` and caches.
//!
//! # Provider Selection
//!
//! | `provider` | Embedder | Multimodal |
//! |------------|----------|------------|
//! | `"openai"` | [`OpenAiEmbedder`] | no |
//! | `"ollama"` | [`OllamaEmbedder`] | no |
//! | `"local"` | [`LocalEmbedder`] | no |
//! | `"vertex"` | [`VertexMultimodalEmbedder`] | yes |
//!
//! Remote providers retry with [`crate::http::send_json_with_retry`].

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::{anyhow, bail, Context, Result};
use async_trait::async_trait;
use base64::Engine as _;
use rag_harness_core::embedding::{Embedder, MultimodalEmbedding};
use rag_harness_core::models::Modality;
use serde_json::{json, Value};

use crate::config::{Config, EmbeddingModelConfig};
use crate::http::{json_f32_vec, send_json_with_retry};

// ============ OpenAI ============

/// Embedder backed by the OpenAI embeddings API.
///
/// Requires the API key in `OPENAI_API_KEY` (or the configured `api_key_env`).
pub struct OpenAiEmbedder {
    model: String,
    dims: usize,
    base_url: String,
    api_key: String,
    max_retries: u32,
    client: reqwest::Client,
}

impl OpenAiEmbedder {
    pub fn new(config: &EmbeddingModelConfig) -> Result<Self> {
        let model = config
            .model
            .clone()
            .ok_or_else(|| anyhow!("embedding model name required for OpenAI provider"))?;
        let dims = config
            .dims
            .ok_or_else(|| anyhow!("embedding dims required for OpenAI provider"))?;
        let key_env = config.api_key_env.as_deref().unwrap_or("OPENAI_API_KEY");
        let api_key = std::env::var(key_env)
            .map_err(|_| anyhow!("{} environment variable not set", key_env))?;

        Ok(Self {
            model,
            dims,
            base_url: config
                .url
                .clone()
                .unwrap_or_else(|| "https://api.openai.com/v1".to_string()),
            api_key,
            max_retries: config.max_retries,
            client: reqwest::Client::builder()
                .timeout(Duration::from_secs(config.timeout_secs))
                .build()?,
        })
    }
}

#[async_trait]
impl Embedder for OpenAiEmbedder {
    fn model_name(&self) -> &str {
        &self.model
    }

    fn dims(&self) -> usize {
        self.dims
    }

    async fn embed(&self, texts: &[String]) -> Result<Vec<Vec<f32>>> {
        let url = format!("{}/embeddings", self.base_url.trim_end_matches('/'));
        let body = json!({ "model": self.model, "input": texts });
        let json = send_json_with_retry("OpenAI", self.max_retries, || {
            self.client
                .post(&url)
                .bearer_auth(&self.api_key)
                .json(&body)
        })
        .await?;
        parse_openai_response(&json)
    }
}

/// Extract `data[].embedding`, ordered by each item's `index`.
fn parse_openai_response(json: &Value) -> Result<Vec<Vec<f32>>> {
    let data = json
        .get("data")
        .and_then(|d| d.as_array())
        .ok_or_else(|| anyhow!("Invalid OpenAI response: missing data array"))?;

    let mut indexed = Vec::with_capacity(data.len());
    for (pos, item) in data.iter().enumerate() {
        let index = item.get("index").and_then(|i| i.as_u64()).unwrap_or(pos as u64);
        let embedding = item
            .get("embedding")
            .ok_or_else(|| anyhow!("Invalid OpenAI response: missing embedding"))?;
        indexed.push((index, json_f32_vec(embedding)?));
    }
    indexed.sort_by_key(|(index, _)| *index);
    Ok(indexed.into_iter().map(|(_, v)| v).collect())
}

// ============ Ollama ============

/// Embedder backed by a local Ollama instance (default `http://localhost:11434`).
pub struct OllamaEmbedder {
    model: String,
    dims: usize,
    url: String,
    max_retries: u32,
    client: reqwest::Client,
}

impl OllamaEmbedder {
    pub fn new(config: &EmbeddingModelConfig) -> Result<Self> {
        let model = config
            .model
            .clone()
            .ok_or_else(|| anyhow!("embedding model name required for Ollama provider"))?;
        let dims = config
            .dims
            .ok_or_else(|| anyhow!("embedding dims required for Ollama provider"))?;
        Ok(Self {
            model,
            dims,
            url: config
                .url
                .clone()
                .unwrap_or_else(|| "http://localhost:11434".to_string()),
            max_retries: config.max_retries,
            client: reqwest::Client::builder()
                .timeout(Duration::from_secs(config.timeout_secs))
                .build()?,
        })
    }
}

#[async_trait]
impl Embedder for OllamaEmbedder {
    fn model_name(&self) -> &str {
        &self.model
    }

    fn dims(&self) -> usize {
        self.dims
    }

    async fn embed(&self, texts: &[String]) -> Result<Vec<Vec<f32>>> {
        let url = format!("{}/api/embed", self.url.trim_end_matches('/'));
        let body = json!({ "model": self.model, "input": texts });
        let json = send_json_with_retry("Ollama", self.max_retries, || {
            self.client.post(&url).json(&body)
        })
        .await
        .with_context(|| format!("is Ollama running at {}?", self.url))?;
        parse_ollama_response(&json)
    }
}

fn parse_ollama_response(json: &Value) -> Result<Vec<Vec<f32>>> {
    json.get("embeddings")
        .and_then(|e| e.as_array())
        .ok_or_else(|| anyhow!("Invalid Ollama response: missing embeddings array"))?
        .iter()
        .map(json_f32_vec)
        .collect()
}

// ============ Local (fastembed) ============

/// In-process embedder using fastembed. The model is downloaded on first
/// use and kept loaded for the life of the embedder.
#[cfg(feature = "local-models")]
pub struct LocalEmbedder {
    model_name: String,
    dims: usize,
    model: fastembed::EmbeddingModel,
    loaded: Arc<Mutex<Option<fastembed::TextEmbedding>>>,
}

#[cfg(feature = "local-models")]
impl LocalEmbedder {
    pub fn new(config: &EmbeddingModelConfig) -> Result<Self> {
        let model_name = config
            .model
            .clone()
            .unwrap_or_else(|| "all-minilm-l6-v2".to_string());
        let dims = config.dims.unwrap_or(match model_name.as_str() {
            "bge-base-en-v1.5" | "nomic-embed-text-v1" | "nomic-embed-text-v1.5" => 768,
            "multilingual-e5-base" => 768,
            "bge-large-en-v1.5" | "multilingual-e5-large" => 1024,
            _ => 384,
        });
        let model = fastembed_model(&model_name)?;
        Ok(Self {
            model_name,
            dims,
            model,
            loaded: Arc::new(Mutex::new(None)),
        })
    }
}

#[cfg(feature = "local-models")]
fn fastembed_model(name: &str) -> Result<fastembed::EmbeddingModel> {
    match name {
        "all-minilm-l6-v2" => Ok(fastembed::EmbeddingModel::AllMiniLML6V2),
        "bge-small-en-v1.5" => Ok(fastembed::EmbeddingModel::BGESmallENV15),
        "bge-base-en-v1.5" => Ok(fastembed::EmbeddingModel::BGEBaseENV15),
        "bge-large-en-v1.5" => Ok(fastembed::EmbeddingModel::BGELargeENV15),
        "nomic-embed-text-v1" => Ok(fastembed::EmbeddingModel::NomicEmbedTextV1),
        "nomic-embed-text-v1.5" => Ok(fastembed::EmbeddingModel::NomicEmbedTextV15),
        "multilingual-e5-small" => Ok(fastembed::EmbeddingModel::MultilingualE5Small),
        "multilingual-e5-base" => Ok(fastembed::EmbeddingModel::MultilingualE5Base),
        "multilingual-e5-large" => Ok(fastembed::EmbeddingModel::MultilingualE5Large),
        other => bail!(
            "Unknown local embedding model: '{}'. Supported models: \
             all-minilm-l6-v2, bge-small-en-v1.5, bge-base-en-v1.5, bge-large-en-v1.5, \
             nomic-embed-text-v1, nomic-embed-text-v1.5, \
             multilingual-e5-small, multilingual-e5-base, multilingual-e5-large",
            other
        ),
    }
}

#[cfg(feature = "local-models")]
#[async_trait]
impl Embedder for LocalEmbedder {
    fn model_name(&self) -> &str {
        &self.model_name
    }

    fn dims(&self) -> usize {
        self.dims
    }

    async fn embed(&self, texts: &[String]) -> Result<Vec<Vec<f32>>> {
        let texts = texts.to_vec();
        let model = self.model.clone();
        let loaded = self.loaded.clone();

        tokio::task::spawn_blocking(move || {
            let mut guard = loaded
                .lock()
                .map_err(|_| anyhow!("local embedding model lock poisoned"))?;
            if guard.is_none() {
                let init = fastembed::InitOptions::new(model).with_show_download_progress(false);
                let embedding = fastembed::TextEmbedding::try_new(init)
                    .map_err(|e| anyhow!("Failed to initialize local embedding model: {}", e))?;
                *guard = Some(embedding);
            }
            let embedding = guard
                .as_mut()
                .ok_or_else(|| anyhow!("local embedding model not loaded"))?;
            embedding
                .embed(texts, None)
                .map_err(|e| anyhow!("Local embedding failed: {}", e))
        })
        .await?
    }
}

// ============ Vertex multimodal ============

/// Text+image embedder on the Vertex AI `multimodalembedding` model.
///
/// Text and image vectors share one space, so an image chunk can be found
/// from a text query. Auth uses an OAuth access token from
/// `GOOGLE_OAUTH_ACCESS_TOKEN` (or the configured `api_key_env`).
pub struct VertexMultimodalEmbedder {
    model: String,
    dims: usize,
    endpoint: String,
    token_env: String,
    max_retries: u32,
    client: reqwest::Client,
}

impl VertexMultimodalEmbedder {
    pub fn new(config: &EmbeddingModelConfig, project_id: &str) -> Result<Self> {
        let model = config
            .model
            .clone()
            .unwrap_or_else(|| "multimodalembedding@001".to_string());
        let region = config.region.as_deref().unwrap_or("us-central1");
        let endpoint = config.url.clone().unwrap_or_else(|| {
            format!(
                "https://{region}-aiplatform.googleapis.com/v1/projects/{project_id}/locations/{region}/publishers/google/models/{model}:predict"
            )
        });
        Ok(Self {
            dims: config.dims.unwrap_or(1408),
            model,
            endpoint,
            token_env: config
                .api_key_env
                .clone()
                .unwrap_or_else(|| "GOOGLE_OAUTH_ACCESS_TOKEN".to_string()),
            max_retries: config.max_retries,
            client: reqwest::Client::builder()
                .timeout(Duration::from_secs(config.timeout_secs))
                .build()?,
        })
    }

    async fn predict(&self, instances: Vec<Value>) -> Result<Vec<Value>> {
        let token = std::env::var(&self.token_env)
            .map_err(|_| anyhow!("{} environment variable not set", self.token_env))?;
        let body = json!({
            "instances": instances,
            "parameters": { "dimension": self.dims },
        });
        let json = send_json_with_retry("Vertex AI", self.max_retries, || {
            self.client.post(&self.endpoint).bearer_auth(&token).json(&body)
        })
        .await?;
        json.get("predictions")
            .and_then(|p| p.as_array())
            .cloned()
            .ok_or_else(|| anyhow!("Invalid Vertex response: missing predictions"))
    }
}

#[async_trait]
impl Embedder for VertexMultimodalEmbedder {
    fn model_name(&self) -> &str {
        &self.model
    }

    fn dims(&self) -> usize {
        self.dims
    }

    async fn embed(&self, texts: &[String]) -> Result<Vec<Vec<f32>>> {
        let instances = texts.iter().map(|t| json!({ "text": t })).collect();
        self.predict(instances)
            .await?
            .iter()
            .map(|p| {
                p.get("textEmbedding")
                    .ok_or_else(|| anyhow!("Invalid Vertex response: missing textEmbedding"))
                    .and_then(json_f32_vec)
            })
            .collect()
    }

    async fn embed_multimodal(&self, text: &str, image: &[u8]) -> Result<MultimodalEmbedding> {
        let b64 = base64::engine::general_purpose::STANDARD.encode(image);
        let predictions = self
            .predict(vec![json!({
                "text": text,
                "image": { "bytesBase64Encoded": b64 },
            })])
            .await?;
        let prediction = predictions
            .first()
            .ok_or_else(|| anyhow!("Invalid Vertex response: empty predictions"))?;
        parse_multimodal_prediction(prediction)
    }
}

fn parse_multimodal_prediction(prediction: &Value) -> Result<MultimodalEmbedding> {
    let mut out = MultimodalEmbedding::new();
    if let Some(text) = prediction.get("textEmbedding") {
        out.insert(Modality::Text, json_f32_vec(text)?);
    }
    if let Some(image) = prediction.get("imageEmbedding") {
        out.insert(Modality::Image, json_f32_vec(image)?);
    }
    if out.is_empty() {
        bail!("Invalid Vertex response: no embeddings in prediction");
    }
    Ok(out)
}

// ============ Registry ============

/// Create the embedder for one configured model.
pub fn create_embedder(
    id: &str,
    config: &EmbeddingModelConfig,
    project_id: &str,
) -> Result<Arc<dyn Embedder>> {
    match config.provider.as_str() {
        "openai" => Ok(Arc::new(OpenAiEmbedder::new(config)?)),
        "ollama" => Ok(Arc::new(OllamaEmbedder::new(config)?)),
        "vertex" => Ok(Arc::new(VertexMultimodalEmbedder::new(config, project_id)?)),
        #[cfg(feature = "local-models")]
        "local" => Ok(Arc::new(LocalEmbedder::new(config)?)),
        #[cfg(not(feature = "local-models"))]
        "local" => bail!("embedding model '{}' needs the local-models feature", id),
        other => bail!("Unknown embedding provider for '{}': {}", id, other),
    }
}

/// Embedders keyed by model id, created on first use.
pub struct EmbedderRegistry {
    models: HashMap<String, EmbeddingModelConfig>,
    project_id: String,
    cache: Mutex<HashMap<String, Arc<dyn Embedder>>>,
}

impl EmbedderRegistry {
    pub fn from_config(config: &Config) -> Self {
        Self {
            models: config.embedding.models.clone().into_iter().collect(),
            project_id: config.project.id.clone(),
            cache: Mutex::new(HashMap::new()),
        }
    }

    /// Register a ready-made embedder under `id`, replacing any config entry.
    pub fn insert(&self, id: &str, embedder: Arc<dyn Embedder>) {
        if let Ok(mut cache) = self.cache.lock() {
            cache.insert(id.to_string(), embedder);
        }
    }

    pub fn get(&self, id: &str) -> Result<Arc<dyn Embedder>> {
        let mut cache = self
            .cache
            .lock()
            .map_err(|_| anyhow!("embedder cache lock poisoned"))?;
        if let Some(embedder) = cache.get(id) {
            return Ok(embedder.clone());
        }
        let config = self
            .models
            .get(id)
            .ok_or_else(|| anyhow!("embedding model '{}' is not configured", id))?;
        let embedder = create_embedder(id, config, &self.project_id)?;
        tracing::debug!(id, model = embedder.model_name(), "created embedder");
        cache.insert(id.to_string(), embedder.clone());
        Ok(embedder)
    }
}
