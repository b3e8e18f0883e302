//! Relevance rerankers for cross-engine retrieval.
//!
//! - `"local"`: a fastembed cross-encoder (`BGERerankerBase`), feature `local-models`.
//! - `"embedding"`: cosine similarity between the query embedding and each
//!   document embedding, using any configured embedder.

use std::sync::Arc;

use anyhow::{anyhow, bail, Result};
use async_trait::async_trait;
use rag_harness_core::embedding::{cosine_similarity, Embedder};
use rag_harness_core::rerank::{RankedResult, RankedResults, Reranker};

use crate::config::Config;
use crate::embedding::EmbedderRegistry;

/// Scores documents by embedding cosine similarity to the query.
pub struct EmbeddingReranker {
    embedder: Arc<dyn Embedder>,
}

impl EmbeddingReranker {
    pub fn new(embedder: Arc<dyn Embedder>) -> Self {
        Self { embedder }
    }
}

#[async_trait]
impl Reranker for EmbeddingReranker {
    async fn rank(&self, query: &str, docs: &[String], doc_ids: &[String]) -> Result<RankedResults> {
        if docs.len() != doc_ids.len() {
            bail!("reranker got {} docs but {} ids", docs.len(), doc_ids.len());
        }
        let mut inputs = Vec::with_capacity(docs.len() + 1);
        inputs.push(query.to_string());
        inputs.extend(docs.iter().cloned());

        let vectors = self.embedder.embed(&inputs).await?;
        let (query_vec, doc_vecs) = vectors
            .split_first()
            .ok_or_else(|| anyhow!("reranker embedding returned no vectors"))?;
        if doc_vecs.len() != docs.len() {
            bail!("reranker embedding returned {} vectors for {} docs", doc_vecs.len(), docs.len());
        }

        Ok(RankedResults(
            doc_ids
                .iter()
                .zip(doc_vecs)
                .map(|(id, v)| RankedResult {
                    doc_id: id.clone(),
                    score: cosine_similarity(query_vec, v),
                })
                .collect(),
        ))
    }
}

/// Cross-encoder reranker run in-process.
#[cfg(feature = "local-models")]
pub struct FastembedReranker {
    loaded: Arc<std::sync::Mutex<Option<fastembed::TextRerank>>>,
}

#[cfg(feature = "local-models")]
impl FastembedReranker {
    pub fn new() -> Self {
        Self {
            loaded: Arc::new(std::sync::Mutex::new(None)),
        }
    }
}

#[cfg(feature = "local-models")]
impl Default for FastembedReranker {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(feature = "local-models")]
#[async_trait]
impl Reranker for FastembedReranker {
    async fn rank(&self, query: &str, docs: &[String], doc_ids: &[String]) -> Result<RankedResults> {
        if docs.len() != doc_ids.len() {
            bail!("reranker got {} docs but {} ids", docs.len(), doc_ids.len());
        }
        let query = query.to_string();
        let docs = docs.to_vec();
        let loaded = self.loaded.clone();

        let scored = tokio::task::spawn_blocking(move || {
            let mut guard = loaded
                .lock()
                .map_err(|_| anyhow!("reranker lock poisoned"))?;
            if guard.is_none() {
                let init = fastembed::RerankInitOptions::new(fastembed::RerankerModel::BGERerankerBase);
                let model = fastembed::TextRerank::try_new(init)
                    .map_err(|e| anyhow!("Failed to initialize reranker: {}", e))?;
                *guard = Some(model);
            }
            let model = guard
                .as_mut()
                .ok_or_else(|| anyhow!("reranker not loaded"))?;
            model
                .rerank(query, docs, false, None)
                .map_err(|e| anyhow!("Rerank failed: {}", e))
        })
        .await??;

        Ok(RankedResults(
            scored
                .into_iter()
                .filter_map(|r| {
                    doc_ids.get(r.index).map(|id| RankedResult {
                        doc_id: id.clone(),
                        score: r.score,
                    })
                })
                .collect(),
        ))
    }
}

/// Build the reranker named by `reranker.provider`.
pub fn create_reranker(config: &Config, embedders: &EmbedderRegistry) -> Result<Arc<dyn Reranker>> {
    match config.reranker.provider.as_str() {
        "embedding" => {
            let id = config
                .reranker
                .embedding_model
                .as_deref()
                .unwrap_or(&config.embedding.default_text);
            Ok(Arc::new(EmbeddingReranker::new(embedders.get(id)?)))
        }
        #[cfg(feature = "local-models")]
        "local" => Ok(Arc::new(FastembedReranker::new())),
        #[cfg(not(feature = "local-models"))]
        "local" => bail!("reranker provider 'local' needs the local-models feature"),
        other => bail!("Unknown reranker provider: {}", other),
    }
}
