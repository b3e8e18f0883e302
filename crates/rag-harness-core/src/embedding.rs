//! Embedding trait and vector utilities.
//!
//! Defines the [`Embedder`] trait every embedding backend implements, the
//! per-item success bookkeeping used during indexing, and pure helpers for
//! vector serialization and similarity.
//!
//! Concrete providers (OpenAI, Ollama, fastembed, Vertex multimodal) live in
//! the `rag-harness` app crate.

use std::collections::HashMap;

use anyhow::{bail, Result};
use async_trait::async_trait;

use crate::models::Modality;

/// Result of embedding a list of texts.
///
/// `success[i]` says whether input `i` produced a vector. `vectors` holds
/// only the successful vectors, in input order.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct EmbeddingBatch {
    pub success: Vec<bool>,
    pub vectors: Vec<Vec<f32>>,
}

impl EmbeddingBatch {
    /// A batch where every input succeeded.
    pub fn complete(vectors: Vec<Vec<f32>>) -> Self {
        Self {
            success: vec![true; vectors.len()],
            vectors,
        }
    }

    /// A batch where every one of `len` inputs failed.
    pub fn failed(len: usize) -> Self {
        Self {
            success: vec![false; len],
            vectors: Vec::new(),
        }
    }

    pub fn all_succeeded(&self) -> bool {
        !self.success.is_empty() && self.success.iter().all(|ok| *ok)
    }

    pub fn extend(&mut self, other: EmbeddingBatch) {
        self.success.extend(other.success);
        self.vectors.extend(other.vectors);
    }
}

/// Vectors for one text+image pair, keyed by the modality they embed.
pub type MultimodalEmbedding = HashMap<Modality, Vec<f32>>;

/// An embedding backend.
///
/// `embed` receives at most one API batch worth of texts; callers split
/// larger inputs with [`embed_in_batches`].
#[async_trait]
pub trait Embedder: Send + Sync {
    /// Model identifier, e.g. `"text-embedding-3-small"`.
    fn model_name(&self) -> &str;

    /// Vector dimensionality.
    fn dims(&self) -> usize;

    /// Embed a batch of texts.
    async fn embed(&self, texts: &[String]) -> Result<Vec<Vec<f32>>>;

    /// Embed a text and an image into a shared space.
    ///
    /// Text-only models return an error.
    async fn embed_multimodal(&self, _text: &str, _image: &[u8]) -> Result<MultimodalEmbedding> {
        bail!(
            "embedding model '{}' does not support multimodal input",
            self.model_name()
        )
    }
}

/// Embed `texts` in batches of at most `batch_size`.
///
/// A failing batch marks all of its inputs unsuccessful instead of aborting
/// the remaining batches.
pub async fn embed_in_batches(
    embedder: &dyn Embedder,
    texts: &[String],
    batch_size: usize,
) -> EmbeddingBatch {
    let mut out = EmbeddingBatch::default();
    for batch in texts.chunks(batch_size.max(1)) {
        match embedder.embed(batch).await {
            Ok(vectors) if vectors.len() == batch.len() => {
                out.extend(EmbeddingBatch::complete(vectors));
            }
            Ok(vectors) => {
                tracing::warn!(
                    model = embedder.model_name(),
                    expected = batch.len(),
                    got = vectors.len(),
                    "embedding batch size mismatch"
                );
                out.extend(EmbeddingBatch::failed(batch.len()));
            }
            Err(e) => {
                tracing::warn!(model = embedder.model_name(), error = %e, "embedding batch failed");
                out.extend(EmbeddingBatch::failed(batch.len()));
            }
        }
    }
    out
}

/// Encode a float vector as little-endian f32 bytes.
pub fn vec_to_blob(vec: &[f32]) -> Vec<u8> {
    let mut bytes = Vec::with_capacity(vec.len() * 4);
    for &v in vec {
        bytes.extend_from_slice(&v.to_le_bytes());
    }
    bytes
}

/// Decode bytes written by [`vec_to_blob`].
pub fn blob_to_vec(blob: &[u8]) -> Vec<f32> {
    blob.chunks_exact(4)
        .map(|chunk| f32::from_le_bytes([chunk[0], chunk[1], chunk[2], chunk[3]]))
        .collect()
}

/// Cosine similarity in `[-1.0, 1.0]`.
///
/// Returns `0.0` for empty vectors or vectors of different lengths.
pub fn cosine_similarity(a: &[f32], b: &[f32]) -> f32 {
    if a.len() != b.len() || a.is_empty() {
        return 0.0;
    }

    let mut dot = 0.0f32;
    let mut norm_a = 0.0f32;
    let mut norm_b = 0.0f32;

    for (x, y) in a.iter().zip(b.iter()) {
        dot += x * y;
        norm_a += x * x;
        norm_b += y * y;
    }

    let denom = norm_a.sqrt() * norm_b.sqrt();
    if denom < f32::EPSILON {
        return 0.0;
    }

    dot / denom
}
