//! Reranking: reorder retrieved candidates by a secondary relevance model.
//!
//! Two levels:
//!
//! - **Cross-engine**: a [`Reranker`] scores reference texts against the
//!   query; [`rerank_references`] keeps the best `top_k`.
//! - **Sentence-level**: [`top_relevant_sentences`] picks the sentence of a
//!   chunk closest to the query and returns it with its neighbors.

use std::collections::HashMap;

use anyhow::Result;
use async_trait::async_trait;

use crate::models::QueryReference;

#[derive(Debug, Clone, PartialEq)]
pub struct RankedResult {
    pub doc_id: String,
    pub score: f32,
}

/// Reranker output in arbitrary order.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RankedResults(pub Vec<RankedResult>);

impl RankedResults {
    /// The `n` highest-scoring results, best first. Ties keep input order.
    pub fn top_k(mut self, n: usize) -> Vec<RankedResult> {
        self.0
            .sort_by(|a, b| b.score.partial_cmp(&a.score).unwrap_or(std::cmp::Ordering::Equal));
        self.0.truncate(n);
        self.0
    }
}

#[async_trait]
pub trait Reranker: Send + Sync {
    /// Score `docs` against `query`. `doc_ids[i]` identifies `docs[i]`.
    async fn rank(&self, query: &str, docs: &[String], doc_ids: &[String]) -> Result<RankedResults>;
}

/// Reorder references by reranker score, keeping at most `top_k`.
pub async fn rerank_references(
    reranker: &dyn Reranker,
    query: &str,
    references: Vec<QueryReference>,
    top_k: usize,
) -> Result<Vec<QueryReference>> {
    tracing::info!(count = references.len(), "reranking references");

    let texts: Vec<String> = references.iter().map(|r| r.text().to_string()).collect();
    let ids: Vec<String> = references.iter().map(|r| r.id.clone()).collect();
    let ranked = reranker.rank(query, &texts, &ids).await?.top_k(top_k);

    let mut lookup: HashMap<String, QueryReference> =
        references.into_iter().map(|r| (r.id.clone(), r)).collect();

    Ok(ranked
        .into_iter()
        .filter_map(|r| lookup.remove(&r.doc_id))
        .collect())
}

/// Window of sentences around the one most similar to the query.
///
/// `similarities[i]` scores `sentences[i]`. The best sentence is expanded by
/// `expand_neighbors` on each side, clamped to the list, and optionally
/// wrapped in `<b>` tags. Returns `None` when there is nothing to rank.
pub fn top_relevant_sentences(
    similarities: &[f32],
    sentences: &[String],
    expand_neighbors: usize,
    highlight: bool,
) -> Option<Vec<String>> {
    let len = similarities.len().min(sentences.len());
    if len == 0 {
        return None;
    }

    let mut top = 0;
    for i in 1..len {
        if similarities[i] > similarities[top] {
            top = i;
        }
    }

    let start = top.saturating_sub(expand_neighbors);
    let end = (top + expand_neighbors + 1).min(len);

    Some(
        (start..end)
            .map(|i| {
                if highlight && i == top {
                    format!("<b>{}</b>", sentences[i])
                } else {
                    sentences[i].clone()
                }
            })
            .collect(),
    )
}
