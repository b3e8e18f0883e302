//! Vector stores: where chunk embeddings live and how they are searched.
//!
//! Every engine of type `llm_service` owns one vector store. A build
//! drives the store through a fixed lifecycle:
//!
//! ```text
//! init_index ─▶ index_document* ─▶ deploy ─▶ similarity_search*
//!                                     │
//!                                     └─ may be re-run alone after a failure
//! ```
//!
//! `index_document` assigns contiguous slot ids starting at `index_base`
//! and returns the next free id, so consecutive documents share one
//! contiguous id space. `delete` tears down whatever backing resources
//! exist and is a no-op when nothing was deployed.
//!
//! # Backends
//!
//! | Id | Storage | Deploy |
//! |----|---------|--------|
//! | `"sqlite_vector"` | `engine_vectors` table in the record database | no-op |
//! | `"matching_engine"` | JSONL files in the engine's data bucket | ANN index + endpoint |
//!
//! Backends are looked up by id in a [`VectorStoreRegistry`]; adding a
//! backend means registering one more factory.

pub mod ann_service;
pub mod matching_engine;
pub mod sqlite;

use std::collections::HashMap;
use std::sync::Arc;

use anyhow::{anyhow, bail, Result};
use async_trait::async_trait;
use rag_harness_core::embedding::{embed_in_batches, Embedder};
use rag_harness_core::filter::FilterExpr;
use rag_harness_core::models::{Modality, QueryEngine};
use serde_json::{Map, Value};
use sqlx::SqlitePool;

use crate::config::Config;
use crate::data_source::MultimodalChunk;
use crate::storage::ObjectStorage;

pub use ann_service::{AnnIndexService, VertexAnnService};
pub use matching_engine::MatchingEngineVectorStore;
pub use sqlite::SqliteVectorStore;

pub const SQLITE_VECTOR: &str = "sqlite_vector";
pub const MATCHING_ENGINE: &str = "matching_engine";

/// Upper bound on texts sent to the embedding service in one call.
pub const MAX_CHUNKS_PER_CALL: usize = 1000;

/// Handles of a deployed ANN index, persisted on the engine record.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeployedIndex {
    pub index_id: String,
    pub endpoint: String,
    pub deployed_index_name: String,
}

#[async_trait]
pub trait VectorStore: Send + Sync {
    /// Backend id recorded on the engine, e.g. `"sqlite_vector"`.
    fn store_type(&self) -> &str;

    /// Prepare backing storage. Safe to call once per build.
    async fn init_index(&self) -> Result<()>;

    /// Embed `texts` and store them at slots `index_base..`. Returns the
    /// next free slot.
    async fn index_document(
        &self,
        doc_name: &str,
        texts: &[String],
        index_base: i64,
        metadata: &Map<String, Value>,
    ) -> Result<i64>;

    /// Embed text+image pairs and store the image vector of each at slots
    /// `index_base..`. Returns the next free slot.
    async fn index_document_multi(
        &self,
        doc_name: &str,
        chunks: &[MultimodalChunk],
        index_base: i64,
        metadata: &Map<String, Value>,
    ) -> Result<i64>;

    /// Make the index queryable. `Some` carries handles the caller should
    /// persist on the engine.
    async fn deploy(&self) -> Result<Option<DeployedIndex>>;

    /// Slot ids of the nearest neighbors of `embedding`, best first.
    async fn similarity_search(
        &self,
        embedding: &[f32],
        filter: Option<&FilterExpr>,
    ) -> Result<Vec<i64>>;

    async fn delete(&self) -> Result<()>;
}

/// Embed document chunks, failing if any item did not produce a vector.
pub(crate) async fn embed_chunks(
    embedder: &dyn Embedder,
    doc_name: &str,
    texts: &[String],
    batch_size: usize,
) -> Result<Vec<Vec<f32>>> {
    let batch_size = batch_size.clamp(1, MAX_CHUNKS_PER_CALL);
    let batch = embed_in_batches(embedder, texts, batch_size).await;
    if batch.vectors.is_empty() || !batch.all_succeeded() {
        bail!("failed to generate embeddings for {}", doc_name);
    }
    Ok(batch.vectors)
}

/// Image vector of each multimodal chunk, one embedding call per chunk.
pub(crate) async fn embed_image_chunks(
    embedder: &dyn Embedder,
    doc_name: &str,
    chunks: &[MultimodalChunk],
) -> Result<Vec<Vec<f32>>> {
    if chunks.is_empty() {
        bail!("failed to generate embeddings for {}", doc_name);
    }
    let mut vectors = Vec::with_capacity(chunks.len());
    for chunk in chunks {
        let mut embedding = embedder.embed_multimodal(&chunk.text, &chunk.image).await?;
        let image = embedding
            .remove(&Modality::Image)
            .filter(|v| !v.is_empty())
            .ok_or_else(|| {
                anyhow!(
                    "failed to generate image embedding for {} page {}",
                    doc_name,
                    chunk.page
                )
            })?;
        vectors.push(image);
    }
    Ok(vectors)
}

/// What a vector store factory may use for one engine.
pub struct StoreContext<'a> {
    pub config: &'a Config,
    pub engine: &'a QueryEngine,
    pub embedder: Arc<dyn Embedder>,
}

pub type StoreFactory =
    Box<dyn Fn(&StoreContext<'_>) -> Result<Box<dyn VectorStore>> + Send + Sync>;

/// Vector store backends keyed by id.
pub struct VectorStoreRegistry {
    factories: HashMap<String, StoreFactory>,
}

impl VectorStoreRegistry {
    pub fn new() -> Self {
        Self {
            factories: HashMap::new(),
        }
    }

    /// Registry with the SQLite and ANN-index backends.
    pub fn with_defaults(
        pool: SqlitePool,
        storage: Arc<dyn ObjectStorage>,
        ann: Arc<dyn AnnIndexService>,
    ) -> Self {
        let mut registry = Self::new();
        registry.register(
            SQLITE_VECTOR,
            Box::new(move |ctx| Ok(Box::new(SqliteVectorStore::for_engine(pool.clone(), ctx)))),
        );
        registry.register(
            MATCHING_ENGINE,
            Box::new(move |ctx| {
                Ok(Box::new(MatchingEngineVectorStore::for_engine(
                    storage.clone(),
                    ann.clone(),
                    ctx,
                )?))
            }),
        );
        registry
    }

    pub fn register(&mut self, id: &str, factory: StoreFactory) {
        self.factories.insert(id.to_string(), factory);
    }

    pub fn ids(&self) -> Vec<&str> {
        let mut ids: Vec<&str> = self.factories.keys().map(String::as_str).collect();
        ids.sort_unstable();
        ids
    }

    /// Construct backend `id` for the engine in `ctx`.
    pub fn resolve(&self, id: &str, ctx: &StoreContext<'_>) -> Result<Box<dyn VectorStore>> {
        let factory = self
            .factories
            .get(id)
            .ok_or_else(|| anyhow!("Unknown vector store: {}", id))?;
        factory(ctx)
    }
}

impl Default for VectorStoreRegistry {
    fn default() -> Self {
        Self::new()
    }
}
