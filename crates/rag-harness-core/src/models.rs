//! Query-engine data model.
//!
//! These records flow between the build orchestrator, the vector stores, and
//! the retrieval service. Modality-specific payloads are tagged unions
//! ([`ChunkContent`], [`ReferenceContent`]) so each variant carries exactly
//! the fields that make sense for it.
//!
//! ```text
//! QueryEngine ──owns──▶ QueryDocument [index_start, index_end)
//!      │                     │
//!      │                     └──▶ QueryDocumentChunk { index, content }
//!      │
//!      └── per query ──▶ QueryReference ──▶ QueryResult / UserQuery.history
//! ```

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

fn new_id() -> String {
    uuid::Uuid::new_v4().to_string()
}

// ═══════════════════════════════════════════════════════════════════════
// Query engines
// ═══════════════════════════════════════════════════════════════════════

/// How an engine is built and searched.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum QueryEngineType {
    /// Delegates indexing and search to an external managed search service.
    ManagedSearch,
    /// Chunks, embeds, and indexes documents into a vector store.
    LlmService,
    /// Composite engine that searches its child engines.
    Integrated,
}

impl QueryEngineType {
    pub fn as_str(&self) -> &'static str {
        match self {
            QueryEngineType::ManagedSearch => "managed_search",
            QueryEngineType::LlmService => "llm_service",
            QueryEngineType::Integrated => "integrated",
        }
    }
}

impl fmt::Display for QueryEngineType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for QueryEngineType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "managed_search" => Ok(QueryEngineType::ManagedSearch),
            "llm_service" => Ok(QueryEngineType::LlmService),
            "integrated" => Ok(QueryEngineType::Integrated),
            other => Err(format!(
                "unknown query engine type '{}' (expected managed_search, llm_service, or integrated)",
                other
            )),
        }
    }
}

/// String-valued build parameters with tolerant typed accessors.
///
/// Parameters arrive as strings from the CLI (`--param key=value`) and are
/// persisted verbatim on the engine record.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct BuildParams(pub BTreeMap<String, String>);

impl BuildParams {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, key: &str, value: impl Into<String>) -> Self {
        self.0.insert(key.to_string(), value.into());
        self
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.0.get(key).map(String::as_str)
    }

    /// `"true"`, `"True"`, `"yes"`, and `"1"` are truthy; anything else,
    /// including a missing key, is false.
    pub fn get_bool(&self, key: &str) -> bool {
        matches!(
            self.get(key).map(|v| v.trim().to_ascii_lowercase()).as_deref(),
            Some("true" | "yes" | "1")
        )
    }

    pub fn get_usize(&self, key: &str) -> Option<usize> {
        self.get(key).and_then(|v| v.trim().parse().ok())
    }

    /// Comma-separated list, blanks removed.
    pub fn get_list(&self, key: &str) -> Vec<String> {
        self.get(key)
            .map(|v| {
                v.split(',')
                    .map(str::trim)
                    .filter(|s| !s.is_empty())
                    .map(String::from)
                    .collect()
            })
            .unwrap_or_default()
    }
}

/// A named index over a document collection plus its retrieval settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QueryEngine {
    pub id: String,
    pub name: String,
    pub engine_type: QueryEngineType,
    pub description: String,
    pub embedding_type: String,
    pub llm_type: String,
    /// Backend identifier of the vector store, set once the store is resolved.
    pub vector_store: Option<String>,
    pub is_public: bool,
    pub doc_url: Option<String>,
    pub created_by: String,
    pub parent_engine_id: Option<String>,
    pub params: BuildParams,
    /// Backend resource handles, populated after a successful deploy.
    pub index_id: Option<String>,
    pub endpoint: Option<String>,
    pub deployed_index_name: Option<String>,
    pub created_at: DateTime<Utc>,
    pub deleted_at: Option<DateTime<Utc>>,
}

impl QueryEngine {
    pub fn new(name: &str, engine_type: QueryEngineType, created_by: &str) -> Self {
        Self {
            id: new_id(),
            name: name.to_string(),
            engine_type,
            description: String::new(),
            embedding_type: String::new(),
            llm_type: String::new(),
            vector_store: None,
            is_public: false,
            doc_url: None,
            created_by: created_by.to_string(),
            parent_engine_id: None,
            params: BuildParams::new(),
            index_id: None,
            endpoint: None,
            deployed_index_name: None,
            created_at: Utc::now(),
            deleted_at: None,
        }
    }

    pub fn is_multimodal(&self) -> bool {
        self.params.get_bool("is_multimodal")
    }

    pub fn is_deleted(&self) -> bool {
        self.deleted_at.is_some()
    }
}

// ═══════════════════════════════════════════════════════════════════════
// Documents and chunks
// ═══════════════════════════════════════════════════════════════════════

/// One indexed source document and the vector-store slots it occupies.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QueryDocument {
    pub id: String,
    pub engine_id: String,
    pub doc_url: String,
    /// First slot owned by this document.
    pub index_start: i64,
    /// One past the last slot owned by this document.
    pub index_end: i64,
    pub created_at: DateTime<Utc>,
    pub deleted_at: Option<DateTime<Utc>>,
}

impl QueryDocument {
    pub fn new(engine_id: &str, doc_url: &str, index_start: i64, index_end: i64) -> Self {
        Self {
            id: new_id(),
            engine_id: engine_id.to_string(),
            doc_url: doc_url.to_string(),
            index_start,
            index_end,
            created_at: Utc::now(),
            deleted_at: None,
        }
    }

    pub fn contains(&self, index: i64) -> bool {
        self.index_start <= index && index < self.index_end
    }

    pub fn len(&self) -> usize {
        (self.index_end - self.index_start).max(0) as usize
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Modality {
    Text,
    Image,
    Video,
    Audio,
}

impl Modality {
    pub fn as_str(&self) -> &'static str {
        match self {
            Modality::Text => "text",
            Modality::Image => "image",
            Modality::Video => "video",
            Modality::Audio => "audio",
        }
    }
}

/// Modality-specific payload of a chunk.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "modality", rename_all = "lowercase")]
pub enum ChunkContent {
    Text {
        /// Sentence window as produced by the chunker.
        text: String,
        clean_text: String,
        sentences: Vec<String>,
    },
    Image {
        /// Storage URL of the page or image.
        url: String,
        /// Contextual text extracted alongside the image.
        text: String,
    },
    Video {
        url: String,
        start_secs: f64,
        end_secs: f64,
    },
    Audio {
        url: String,
        start_secs: f64,
        end_secs: f64,
    },
}

impl ChunkContent {
    pub fn modality(&self) -> Modality {
        match self {
            ChunkContent::Text { .. } => Modality::Text,
            ChunkContent::Image { .. } => Modality::Image,
            ChunkContent::Video { .. } => Modality::Video,
            ChunkContent::Audio { .. } => Modality::Audio,
        }
    }
}

/// One retrievable unit; `index` is its slot in the engine's vector store.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QueryDocumentChunk {
    pub id: String,
    pub engine_id: String,
    pub document_id: String,
    pub index: i64,
    /// Zero-based page for multimodal page chunks.
    pub page: Option<i64>,
    pub content: ChunkContent,
    pub created_at: DateTime<Utc>,
    pub deleted_at: Option<DateTime<Utc>>,
}

impl QueryDocumentChunk {
    pub fn new(engine_id: &str, document_id: &str, index: i64, content: ChunkContent) -> Self {
        Self {
            id: new_id(),
            engine_id: engine_id.to_string(),
            document_id: document_id.to_string(),
            index,
            page: None,
            content,
            created_at: Utc::now(),
            deleted_at: None,
        }
    }

    pub fn modality(&self) -> Modality {
        self.content.modality()
    }
}

// ═══════════════════════════════════════════════════════════════════════
// Retrieval and conversation records
// ═══════════════════════════════════════════════════════════════════════

/// Renderable content of a search hit.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "modality", rename_all = "lowercase")]
pub enum ReferenceContent {
    /// Cleaned, possibly highlighted text.
    Text { text: String },
    Image { url: String, text: String },
    Video { url: String, start_secs: f64, end_secs: f64 },
    Audio { url: String, start_secs: f64, end_secs: f64 },
}

impl ReferenceContent {
    pub fn modality(&self) -> Modality {
        match self {
            ReferenceContent::Text { .. } => Modality::Text,
            ReferenceContent::Image { .. } => Modality::Image,
            ReferenceContent::Video { .. } => Modality::Video,
            ReferenceContent::Audio { .. } => Modality::Audio,
        }
    }
}

/// A search hit materialized for one query.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QueryReference {
    pub id: String,
    pub engine_id: String,
    pub engine_name: String,
    pub user_id: String,
    pub document_id: Option<String>,
    pub document_url: String,
    pub chunk_id: Option<String>,
    pub page: Option<i64>,
    pub content: ReferenceContent,
    pub created_at: DateTime<Utc>,
    pub deleted_at: Option<DateTime<Utc>>,
}

impl QueryReference {
    pub fn new(engine: &QueryEngine, user_id: &str, document_url: &str, content: ReferenceContent) -> Self {
        Self {
            id: new_id(),
            engine_id: engine.id.clone(),
            engine_name: engine.name.clone(),
            user_id: user_id.to_string(),
            document_id: None,
            document_url: document_url.to_string(),
            chunk_id: None,
            page: None,
            content,
            created_at: Utc::now(),
            deleted_at: None,
        }
    }

    /// Text fed to rerankers and prompts. Non-text references fall back to
    /// their contextual text or URL.
    pub fn text(&self) -> &str {
        match &self.content {
            ReferenceContent::Text { text } => text,
            ReferenceContent::Image { text, url } if text.is_empty() => url,
            ReferenceContent::Image { text, .. } => text,
            ReferenceContent::Video { url, .. } | ReferenceContent::Audio { url, .. } => url,
        }
    }
}

/// One turn of a conversation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HistoryEntry {
    pub prompt: String,
    pub response: String,
    pub reference_ids: Vec<String>,
}

/// A user's conversation with one engine.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UserQuery {
    pub id: String,
    pub user_id: String,
    pub engine_id: String,
    /// First prompt of the conversation.
    pub prompt: String,
    pub history: Vec<HistoryEntry>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub deleted_at: Option<DateTime<Utc>>,
}

impl UserQuery {
    pub fn new(user_id: &str, engine_id: &str, prompt: &str) -> Self {
        let now = Utc::now();
        Self {
            id: new_id(),
            user_id: user_id.to_string(),
            engine_id: engine_id.to_string(),
            prompt: prompt.to_string(),
            history: Vec::new(),
            created_at: now,
            updated_at: now,
            deleted_at: None,
        }
    }

    pub fn append(&mut self, prompt: &str, response: &str, reference_ids: Vec<String>) {
        self.history.push(HistoryEntry {
            prompt: prompt.to_string(),
            response: response.to_string(),
            reference_ids,
        });
        self.updated_at = Utc::now();
    }
}

/// Snapshot of a single generation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QueryResult {
    pub id: String,
    pub engine_id: String,
    pub user_id: String,
    pub prompt: String,
    pub response: String,
    pub reference_ids: Vec<String>,
    pub created_at: DateTime<Utc>,
    pub deleted_at: Option<DateTime<Utc>>,
}

impl QueryResult {
    pub fn new(engine_id: &str, user_id: &str, prompt: &str, response: &str, reference_ids: Vec<String>) -> Self {
        Self {
            id: new_id(),
            engine_id: engine_id.to_string(),
            user_id: user_id.to_string(),
            prompt: prompt.to_string(),
            response: response.to_string(),
            reference_ids,
            created_at: Utc::now(),
            deleted_at: None,
        }
    }
}
