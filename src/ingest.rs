//! Ingestion pipeline for `llm_service` engines.
//!
//! Coordinates one build's document flow:
//!
//! ```text
//! doc_url ─▶ DataSource::download ─▶ per file:
//!              chunk (text windows | page images)
//!              ─▶ VectorStore::index_document[_multi]   slots [base, next)
//!              ─▶ QueryDocument [base, next) + one QueryDocumentChunk per slot
//!           ─▶ VectorStore::deploy (once)
//! ```
//!
//! Files are processed strictly in order so each document claims a
//! contiguous slot range. A file that yields no chunks or fails to embed is
//! recorded as not processed and the build moves on; only a build with no
//! processed document at all fails.

use std::path::Path;

use rag_harness_core::models::{ChunkContent, QueryDocument, QueryDocumentChunk, QueryEngine};
use rag_harness_core::text::{clean_text, text_to_sentence_list, TextChunks};
use rag_harness_core::{Error, Result};

use crate::app::AppContext;
use crate::data_source::{DataSourceFile, Manifest, MultimodalChunk, SourceContext};
use crate::vector_store::{DeployedIndex, VectorStore};

/// What a pipeline run did.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct IngestOutcome {
    /// Source URLs of indexed documents, in processing order.
    pub docs_processed: Vec<String>,
    pub docs_not_processed: Vec<String>,
    /// Total chunks (= slots) written.
    pub chunks: usize,
    /// Handles from a deploy that created serving resources.
    pub deployed: Option<DeployedIndex>,
}

enum FileChunks {
    Text(TextChunks),
    Pages(Vec<MultimodalChunk>),
}

impl FileChunks {
    fn len(&self) -> usize {
        match self {
            FileChunks::Text(c) => c.len(),
            FileChunks::Pages(p) => p.len(),
        }
    }

    fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Download, chunk, index, and record every document under the engine's
/// `doc_url`, then deploy the store.
///
/// # Errors
///
/// [`Error::Validation`] when the engine has no `doc_url`,
/// [`Error::NoDocumentsIndexed`] when nothing could be indexed, and
/// [`Error::Internal`] for source, storage, or record-store failures.
pub async fn build_doc_index(
    app: &AppContext,
    engine: &QueryEngine,
    vector_store: &dyn VectorStore,
) -> Result<IngestOutcome> {
    let doc_url = engine
        .doc_url
        .as_deref()
        .ok_or_else(|| Error::Validation(format!("engine {} has no doc_url", engine.name)))?;

    let source_ctx = SourceContext {
        config: &app.config,
        engine,
        storage: app.storage.clone(),
    };
    let source = app.data_sources.resolve(doc_url, &source_ctx)?;
    let manifest = Manifest::load(engine, app.storage.as_ref()).await?;

    let scratch = tempfile::tempdir().map_err(anyhow::Error::from)?;
    tracing::info!(engine = %engine.name, source = source.source_type(), url = %doc_url, "downloading documents");
    let mut files = source.download(doc_url, scratch.path()).await?;
    if files.is_empty() {
        return Err(Error::NoDocumentsIndexed(format!(
            "no documents found at {}",
            doc_url
        )));
    }
    manifest.apply(&mut files);
    tracing::info!(engine = %engine.name, files = files.len(), "downloaded documents");

    vector_store.init_index().await?;

    let multimodal = engine.is_multimodal();
    let mut outcome = IngestOutcome::default();
    let mut index_base: i64 = 0;

    for file in &files {
        let chunks = if multimodal {
            FileChunks::Pages(app.chunker.chunk_multimodal(file).await)
        } else {
            match app.chunker.chunk_text(file).await {
                Some(chunks) => FileChunks::Text(chunks),
                None => FileChunks::Text(TextChunks::default()),
            }
        };
        if chunks.is_empty() {
            tracing::warn!(doc = %file.src_url, "no chunks extracted, skipping");
            outcome.docs_not_processed.push(file.src_url.clone());
            continue;
        }

        let indexed = match &chunks {
            FileChunks::Text(c) => {
                vector_store
                    .index_document(&file.name, &c.sentences, index_base, &file.metadata)
                    .await
            }
            FileChunks::Pages(p) => {
                vector_store
                    .index_document_multi(&file.name, p, index_base, &file.metadata)
                    .await
            }
        };
        let next_base = match indexed {
            Ok(next) => next,
            Err(e) => {
                tracing::warn!(doc = %file.src_url, error = %e, "indexing failed, skipping");
                outcome.docs_not_processed.push(file.src_url.clone());
                continue;
            }
        };

        remove_local(&file.local_path).await;
        record_document(app, engine, file, &chunks, index_base, next_base).await?;

        tracing::info!(
            doc = %file.src_url,
            index_start = index_base,
            index_end = next_base,
            "indexed document"
        );
        outcome.chunks += chunks.len();
        outcome.docs_processed.push(file.src_url.clone());
        index_base = next_base;
    }

    if outcome.docs_processed.is_empty() {
        return Err(Error::NoDocumentsIndexed(format!(
            "none of the {} documents at {} could be indexed",
            files.len(),
            doc_url
        )));
    }

    outcome.deployed = match vector_store.deploy().await {
        Ok(deployed) => deployed,
        Err(e) => {
            tracing::error!(engine = %engine.name, error = %e, "deploy failed; retry with `qe deploy`");
            None
        }
    };

    tracing::info!(
        engine = %engine.name,
        processed = outcome.docs_processed.len(),
        not_processed = outcome.docs_not_processed.len(),
        chunks = outcome.chunks,
        "document index built"
    );
    Ok(outcome)
}

async fn remove_local(path: &Path) {
    if let Err(e) = tokio::fs::remove_file(path).await {
        tracing::debug!(path = %path.display(), error = %e, "could not remove downloaded file");
    }
}

/// Persist the document and one chunk record per slot.
async fn record_document(
    app: &AppContext,
    engine: &QueryEngine,
    file: &DataSourceFile,
    chunks: &FileChunks,
    index_start: i64,
    index_end: i64,
) -> Result<()> {
    let doc = QueryDocument::new(&engine.id, &file.src_url, index_start, index_end);
    app.store.save_document(&doc).await?;

    let records: Vec<QueryDocumentChunk> = match chunks {
        FileChunks::Text(c) => c
            .windows
            .iter()
            .enumerate()
            .map(|(i, window)| {
                let clean = clean_text(window);
                let content = ChunkContent::Text {
                    text: window.clone(),
                    sentences: text_to_sentence_list(&clean),
                    clean_text: clean,
                };
                QueryDocumentChunk::new(&engine.id, &doc.id, index_start + i as i64, content)
            })
            .collect(),
        // Every multimodal chunk is recorded as an image; video and audio
        // chunks are not produced yet.
        FileChunks::Pages(pages) => pages
            .iter()
            .enumerate()
            .map(|(i, page)| {
                let content = ChunkContent::Image {
                    url: page.image_url.clone(),
                    text: page.text.clone(),
                };
                let mut chunk =
                    QueryDocumentChunk::new(&engine.id, &doc.id, index_start + i as i64, content);
                chunk.page = Some(page.page as i64);
                chunk
            })
            .collect(),
    };
    app.store.save_chunks(&records).await?;
    Ok(())
}
