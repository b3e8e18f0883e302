//! TOML configuration.
//!
//! Every section except `[db]` and `[project]` is optional and falls back to
//! defaults. Secrets never live in the file: providers read API keys and
//! OAuth tokens from the environment variables named here.
//!
//! ```toml
//! [db]
//! path = "./data/qe.sqlite"
//!
//! [project]
//! id = "acme-rag"
//!
//! [embedding.models.text]
//! provider = "openai"
//! model = "text-embedding-3-small"
//! dims = 1536
//!
//! [llm.models.chat]
//! provider = "openai"
//! model = "gpt-4o-mini"
//! context_length = 128000
//! ```

use anyhow::{bail, Context, Result};
use serde::Deserialize;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

#[derive(Debug, Deserialize, Clone)]
pub struct Config {
    pub db: DbConfig,
    pub project: ProjectConfig,
    #[serde(default)]
    pub storage: StorageConfig,
    #[serde(default)]
    pub embedding: EmbeddingConfig,
    #[serde(default)]
    pub llm: LlmConfig,
    #[serde(default)]
    pub reranker: RerankerConfig,
    #[serde(default)]
    pub retrieval: RetrievalConfig,
    #[serde(default)]
    pub vector_store: VectorStoreConfig,
    #[serde(default)]
    pub web: WebConfig,
    #[serde(default)]
    pub sharepoint: SharePointConfig,
}

#[derive(Debug, Deserialize, Clone)]
pub struct DbConfig {
    pub path: PathBuf,
}

#[derive(Debug, Deserialize, Clone)]
pub struct ProjectConfig {
    /// Prefix for every bucket the service creates.
    pub id: String,
    #[serde(default = "default_user")]
    pub default_user: String,
}

fn default_user() -> String {
    "local".to_string()
}

// ── Storage ─────────────────────────────────────────────────────────────

#[derive(Debug, Deserialize, Clone)]
pub struct StorageConfig {
    /// `"local"` or `"gcs"`.
    #[serde(default = "default_storage_provider")]
    pub provider: String,
    /// Root directory of the local provider; one subdirectory per bucket.
    #[serde(default = "default_storage_root")]
    pub root: PathBuf,
    #[serde(default = "default_gcs_api_base")]
    pub api_base: String,
    #[serde(default = "default_gcs_token_env")]
    pub token_env: String,
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            provider: default_storage_provider(),
            root: default_storage_root(),
            api_base: default_gcs_api_base(),
            token_env: default_gcs_token_env(),
            timeout_secs: default_timeout_secs(),
        }
    }
}

fn default_storage_provider() -> String {
    "local".to_string()
}
fn default_storage_root() -> PathBuf {
    PathBuf::from("./data/buckets")
}
fn default_gcs_api_base() -> String {
    "https://storage.googleapis.com".to_string()
}
fn default_gcs_token_env() -> String {
    "GOOGLE_OAUTH_ACCESS_TOKEN".to_string()
}

// ── Models ──────────────────────────────────────────────────────────────

#[derive(Debug, Deserialize, Clone)]
pub struct EmbeddingConfig {
    /// Model id used when a text engine does not name one.
    #[serde(default = "default_text_model_id")]
    pub default_text: String,
    /// Model id used when a multimodal engine does not name one.
    #[serde(default = "default_multimodal_model_id")]
    pub default_multimodal: String,
    /// Maximum texts per embedding API call.
    #[serde(default = "default_embedding_batch")]
    pub batch_size: usize,
    #[serde(default)]
    pub models: BTreeMap<String, EmbeddingModelConfig>,
}

impl Default for EmbeddingConfig {
    fn default() -> Self {
        Self {
            default_text: default_text_model_id(),
            default_multimodal: default_multimodal_model_id(),
            batch_size: default_embedding_batch(),
            models: BTreeMap::new(),
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct EmbeddingModelConfig {
    /// `"openai"`, `"ollama"`, `"local"`, or `"vertex"`.
    pub provider: String,
    #[serde(default)]
    pub model: Option<String>,
    #[serde(default)]
    pub dims: Option<usize>,
    /// Base URL override (Ollama host, OpenAI-compatible gateway).
    #[serde(default)]
    pub url: Option<String>,
    /// Region of the Vertex multimodal endpoint.
    #[serde(default)]
    pub region: Option<String>,
    /// Environment variable holding the API key or OAuth token. Defaults to
    /// `OPENAI_API_KEY` for openai and `GOOGLE_OAUTH_ACCESS_TOKEN` for vertex.
    #[serde(default)]
    pub api_key_env: Option<String>,
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
}

fn default_text_model_id() -> String {
    "text".to_string()
}
fn default_multimodal_model_id() -> String {
    "multimodal".to_string()
}
fn default_embedding_batch() -> usize {
    1000
}
fn default_max_retries() -> u32 {
    5
}
fn default_timeout_secs() -> u64 {
    60
}

#[derive(Debug, Deserialize, Clone)]
pub struct LlmConfig {
    #[serde(default = "default_chat_model_id")]
    pub default_text: String,
    #[serde(default = "default_chat_model_id")]
    pub default_multimodal: String,
    /// Model used to summarize chat history when the context overflows.
    #[serde(default)]
    pub summary_model: Option<String>,
    #[serde(default)]
    pub models: BTreeMap<String, LlmModelConfig>,
}

impl Default for LlmConfig {
    fn default() -> Self {
        Self {
            default_text: default_chat_model_id(),
            default_multimodal: default_chat_model_id(),
            summary_model: None,
            models: BTreeMap::new(),
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct LlmModelConfig {
    /// `"openai"` or `"ollama"`.
    pub provider: String,
    pub model: String,
    /// Context window in tokens; unset disables the length check.
    #[serde(default)]
    pub context_length: Option<usize>,
    #[serde(default)]
    pub url: Option<String>,
    /// Environment variable holding the API key; defaults to `OPENAI_API_KEY`.
    #[serde(default)]
    pub api_key_env: Option<String>,
    #[serde(default = "default_temperature")]
    pub temperature: f32,
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
}

fn default_chat_model_id() -> String {
    "chat".to_string()
}
fn default_temperature() -> f32 {
    0.2
}

#[derive(Debug, Deserialize, Clone)]
pub struct RerankerConfig {
    /// `"embedding"` (cosine against the query) or `"local"` (cross-encoder).
    #[serde(default = "default_reranker_provider")]
    pub provider: String,
    /// Embedding model id used by the `"embedding"` reranker.
    #[serde(default)]
    pub embedding_model: Option<String>,
}

impl Default for RerankerConfig {
    fn default() -> Self {
        Self {
            provider: default_reranker_provider(),
            embedding_model: None,
        }
    }
}

fn default_reranker_provider() -> String {
    "embedding".to_string()
}

// ── Retrieval ───────────────────────────────────────────────────────────

#[derive(Debug, Deserialize, Clone)]
pub struct RetrievalConfig {
    #[serde(default = "default_num_matches")]
    pub num_matches: usize,
    #[serde(default = "default_min_references")]
    pub min_query_references: usize,
    #[serde(default = "default_integrated_references")]
    pub num_integrated_references: usize,
    #[serde(default = "default_chars_per_token")]
    pub chars_per_token: usize,
    #[serde(default = "default_sentence_window")]
    pub sentence_window: usize,
    #[serde(default = "default_rerank_radius")]
    pub sentence_rerank_radius: usize,
    #[serde(default = "default_contextual_chars")]
    pub contextual_text_max_chars: usize,
    #[serde(default)]
    pub rerank_sentences: bool,
}

impl Default for RetrievalConfig {
    fn default() -> Self {
        Self {
            num_matches: default_num_matches(),
            min_query_references: default_min_references(),
            num_integrated_references: default_integrated_references(),
            chars_per_token: default_chars_per_token(),
            sentence_window: default_sentence_window(),
            sentence_rerank_radius: default_rerank_radius(),
            contextual_text_max_chars: default_contextual_chars(),
            rerank_sentences: false,
        }
    }
}

fn default_num_matches() -> usize {
    5
}
fn default_min_references() -> usize {
    2
}
fn default_integrated_references() -> usize {
    6
}
fn default_chars_per_token() -> usize {
    3
}
fn default_sentence_window() -> usize {
    1
}
fn default_rerank_radius() -> usize {
    2
}
fn default_contextual_chars() -> usize {
    1024
}

// ── Vector stores ───────────────────────────────────────────────────────

#[derive(Debug, Deserialize, Clone)]
pub struct VectorStoreConfig {
    /// Backend id used when an engine does not name one.
    #[serde(default = "default_vector_store")]
    pub default: String,
    #[serde(default = "default_region")]
    pub region: String,
    /// Override of the regional ANN service endpoint.
    #[serde(default)]
    pub api_base: Option<String>,
    #[serde(default = "default_gcs_token_env")]
    pub token_env: String,
    #[serde(default = "default_dimensions")]
    pub dimensions: usize,
    #[serde(default = "default_approximate_neighbors")]
    pub approximate_neighbors: usize,
    #[serde(default = "default_leaf_node_count")]
    pub leaf_node_embedding_count: usize,
    #[serde(default = "default_leaf_search_percent")]
    pub leaf_nodes_to_search_percent: usize,
    #[serde(default = "default_machine_type")]
    pub machine_type: String,
    #[serde(default = "default_operation_poll_secs")]
    pub operation_poll_secs: u64,
    #[serde(default = "default_operation_timeout_secs")]
    pub operation_timeout_secs: u64,
}

impl Default for VectorStoreConfig {
    fn default() -> Self {
        Self {
            default: default_vector_store(),
            region: default_region(),
            api_base: None,
            token_env: default_gcs_token_env(),
            dimensions: default_dimensions(),
            approximate_neighbors: default_approximate_neighbors(),
            leaf_node_embedding_count: default_leaf_node_count(),
            leaf_nodes_to_search_percent: default_leaf_search_percent(),
            machine_type: default_machine_type(),
            operation_poll_secs: default_operation_poll_secs(),
            operation_timeout_secs: default_operation_timeout_secs(),
        }
    }
}

fn default_vector_store() -> String {
    "sqlite_vector".to_string()
}
fn default_region() -> String {
    "us-central1".to_string()
}
fn default_dimensions() -> usize {
    768
}
fn default_approximate_neighbors() -> usize {
    150
}
fn default_leaf_node_count() -> usize {
    500
}
fn default_leaf_search_percent() -> usize {
    80
}
fn default_machine_type() -> String {
    "e2-standard-16".to_string()
}
fn default_operation_poll_secs() -> u64 {
    30
}
fn default_operation_timeout_secs() -> u64 {
    3 * 60 * 60
}

// ── Data sources ────────────────────────────────────────────────────────

#[derive(Debug, Deserialize, Clone)]
pub struct WebConfig {
    #[serde(default = "default_depth_limit")]
    pub depth_limit: usize,
    #[serde(default = "default_max_pages")]
    pub max_pages: usize,
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
    #[serde(default = "default_user_agent")]
    pub user_agent: String,
}

impl Default for WebConfig {
    fn default() -> Self {
        Self {
            depth_limit: default_depth_limit(),
            max_pages: default_max_pages(),
            timeout_secs: default_timeout_secs(),
            user_agent: default_user_agent(),
        }
    }
}

fn default_depth_limit() -> usize {
    1
}
fn default_max_pages() -> usize {
    200
}
fn default_user_agent() -> String {
    concat!("rag-harness/", env!("CARGO_PKG_VERSION")).to_string()
}

#[derive(Debug, Deserialize, Clone)]
pub struct SharePointConfig {
    #[serde(default = "default_graph_api_base")]
    pub api_base: String,
    #[serde(default = "default_sharepoint_token_env")]
    pub token_env: String,
    /// Only files matching these globs are downloaded.
    #[serde(default = "default_sharepoint_globs")]
    pub include_globs: Vec<String>,
}

impl Default for SharePointConfig {
    fn default() -> Self {
        Self {
            api_base: default_graph_api_base(),
            token_env: default_sharepoint_token_env(),
            include_globs: default_sharepoint_globs(),
        }
    }
}

fn default_graph_api_base() -> String {
    "https://graph.microsoft.com/v1.0".to_string()
}
fn default_sharepoint_token_env() -> String {
    "SHAREPOINT_ACCESS_TOKEN".to_string()
}
fn default_sharepoint_globs() -> Vec<String> {
    vec!["**/*".to_string()]
}

impl Config {
    /// Configuration for tests and scratch use: local storage and SQLite
    /// under `root`, no model providers.
    pub fn for_root(root: &Path) -> Self {
        Self {
            db: DbConfig {
                path: root.join("qe.sqlite"),
            },
            project: ProjectConfig {
                id: "local-project".to_string(),
                default_user: default_user(),
            },
            storage: StorageConfig {
                root: root.join("buckets"),
                ..StorageConfig::default()
            },
            embedding: EmbeddingConfig::default(),
            llm: LlmConfig::default(),
            reranker: RerankerConfig::default(),
            retrieval: RetrievalConfig::default(),
            vector_store: VectorStoreConfig::default(),
            web: WebConfig::default(),
            sharepoint: SharePointConfig::default(),
        }
    }
}

pub fn load_config(path: &Path) -> Result<Config> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read config file: {}", path.display()))?;

    let config: Config = toml::from_str(&content).with_context(|| "Failed to parse config file")?;
    validate(&config)?;
    Ok(config)
}

fn validate(config: &Config) -> Result<()> {
    if config.project.id.trim().is_empty() {
        bail!("project.id must not be empty");
    }

    match config.storage.provider.as_str() {
        "local" | "gcs" => {}
        other => bail!("Unknown storage provider: '{}'. Must be local or gcs.", other),
    }

    if config.embedding.batch_size == 0 {
        bail!("embedding.batch_size must be > 0");
    }

    for (id, model) in &config.embedding.models {
        match model.provider.as_str() {
            "openai" | "ollama" | "vertex" => {
                if model.model.is_none() {
                    bail!("embedding.models.{}.model must be set for provider '{}'", id, model.provider);
                }
                if model.dims.unwrap_or(0) == 0 {
                    bail!("embedding.models.{}.dims must be > 0 for provider '{}'", id, model.provider);
                }
            }
            "local" => {}
            other => bail!(
                "Unknown embedding provider for '{}': '{}'. Must be openai, ollama, local, or vertex.",
                id,
                other
            ),
        }
    }

    for (id, model) in &config.llm.models {
        match model.provider.as_str() {
            "openai" | "ollama" => {}
            other => bail!(
                "Unknown llm provider for '{}': '{}'. Must be openai or ollama.",
                id,
                other
            ),
        }
        if model.context_length == Some(0) {
            bail!("llm.models.{}.context_length must be > 0", id);
        }
    }

    match config.reranker.provider.as_str() {
        "embedding" | "local" => {}
        other => bail!("Unknown reranker provider: '{}'. Must be embedding or local.", other),
    }

    let r = &config.retrieval;
    if r.num_matches == 0 {
        bail!("retrieval.num_matches must be >= 1");
    }
    if r.chars_per_token == 0 {
        bail!("retrieval.chars_per_token must be >= 1");
    }
    if r.num_integrated_references < r.min_query_references {
        bail!("retrieval.num_integrated_references must be >= retrieval.min_query_references");
    }

    let v = &config.vector_store;
    if v.dimensions == 0 {
        bail!("vector_store.dimensions must be > 0");
    }
    if v.leaf_nodes_to_search_percent == 0 || v.leaf_nodes_to_search_percent > 100 {
        bail!("vector_store.leaf_nodes_to_search_percent must be in 1..=100");
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(toml_text: &str) -> Result<Config> {
        let config: Config = toml::from_str(toml_text)?;
        validate(&config)?;
        Ok(config)
    }

    #[test]
    fn test_minimal_config_defaults() {
        let config = parse(
            r#"
            [db]
            path = "./data/qe.sqlite"
            [project]
            id = "acme"
            "#,
        )
        .unwrap();
        assert_eq!(config.storage.provider, "local");
        assert_eq!(config.retrieval.num_matches, 5);
        assert_eq!(config.retrieval.min_query_references, 2);
        assert_eq!(config.retrieval.num_integrated_references, 6);
        assert_eq!(config.retrieval.chars_per_token, 3);
        assert_eq!(config.embedding.batch_size, 1000);
        assert_eq!(config.vector_store.default, "sqlite_vector");
        assert_eq!(config.web.depth_limit, 1);
    }

    #[test]
    fn test_model_tables() {
        let config = parse(
            r#"
            [db]
            path = "x.sqlite"
            [project]
            id = "acme"
            [embedding.models.text]
            provider = "openai"
            model = "text-embedding-3-small"
            dims = 1536
            [llm.models.chat]
            provider = "ollama"
            model = "llama3"
            context_length = 8192
            "#,
        )
        .unwrap();
        assert_eq!(config.embedding.models["text"].dims, Some(1536));
        assert_eq!(config.llm.models["chat"].context_length, Some(8192));
    }

    #[test]
    fn test_rejects_unknown_provider() {
        let err = parse(
            r#"
            [db]
            path = "x.sqlite"
            [project]
            id = "acme"
            [embedding.models.text]
            provider = "cohere"
            "#,
        )
        .unwrap_err();
        assert!(err.to_string().contains("Unknown embedding provider"));
    }

    #[test]
    fn test_rejects_missing_dims() {
        assert!(parse(
            r#"
            [db]
            path = "x.sqlite"
            [project]
            id = "acme"
            [embedding.models.text]
            provider = "openai"
            model = "m"
            "#,
        )
        .is_err());
    }

    #[test]
    fn test_for_root_is_valid() {
        let config = Config::for_root(Path::new("/tmp/qe"));
        validate(&config).unwrap();
        assert!(config.db.path.ends_with("qe.sqlite"));
    }
}
