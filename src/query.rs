//! Retrieval and generation over built engines.
//!
//! ```text
//! query_search ──▶ retrieve_references ──▶ rerank (integrated, > 1 hit)
//!                    ├─ managed_search   external service
//!                    ├─ llm_service      embed prompt ─▶ similarity_search
//!                    │                   ─▶ chunk + document lookup ─▶ QueryReference
//!                    └─ integrated       every child engine, in link order
//!
//! query_generate ──▶ query_search ──▶ ContextAssembler ──▶ LanguageModel
//!                ──▶ QueryResult + UserQuery history
//! ```
//!
//! Every reference handed back has already been persisted.

use std::collections::HashSet;

use rag_harness_core::context::{ContextAssembler, ContextBudget};
use rag_harness_core::embedding::cosine_similarity;
use rag_harness_core::filter::{parse_filter, FilterExpr};
use rag_harness_core::models::{
    ChunkContent, QueryDocumentChunk, QueryEngine, QueryEngineType, QueryReference, QueryResult,
    ReferenceContent, UserQuery,
};
use rag_harness_core::rerank::{rerank_references, top_relevant_sentences};
use rag_harness_core::text::{clean_text, text_to_sentence_list};
use rag_harness_core::{Error, Result};

use crate::app::AppContext;
use crate::orchestrator::engine_vector_store;

/// Per-call retrieval switches.
#[derive(Debug, Clone, Default)]
pub struct RetrieveOptions {
    /// Metadata filter applied by each vector store searched.
    pub filter: Option<FilterExpr>,
    /// Narrow text references to the sentences closest to the prompt.
    pub rank_sentences: bool,
}

/// A generated answer with the references that went into its prompt.
#[derive(Debug, Clone)]
pub struct Generation {
    pub result: QueryResult,
    pub references: Vec<QueryReference>,
    pub user_query: UserQuery,
}

/// Fold an adapter error back into the service error it may carry.
pub(crate) fn service_error(err: anyhow::Error) -> Error {
    match err.downcast::<Error>() {
        Ok(err) => err,
        Err(err) => Error::Internal(err),
    }
}

/// Search `engine` and persist one reference per hit.
///
/// Integrated engines search each child depth-first; an engine reachable
/// twice is searched once.
///
/// # Errors
///
/// [`Error::Internal`] when the vector store returns a slot with no chunk or
/// document record, or a provider call fails.
pub async fn retrieve_references(
    app: &AppContext,
    prompt: &str,
    engine: &QueryEngine,
    user_id: &str,
    options: &RetrieveOptions,
) -> Result<Vec<QueryReference>> {
    tracing::info!(engine = %engine.name, prompt, "retrieving references");

    let mut references = Vec::new();
    let mut visited = HashSet::new();
    let mut pending = vec![engine.clone()];

    while let Some(current) = pending.pop() {
        if !visited.insert(current.id.clone()) {
            continue;
        }
        match current.engine_type {
            QueryEngineType::Integrated => {
                let mut children = app.store.child_engines(&current.id).await?;
                if children.is_empty() {
                    tracing::warn!(engine = %current.name, "integrated engine has no children");
                }
                children.reverse();
                pending.extend(children);
            }
            QueryEngineType::ManagedSearch => {
                references.extend(managed_references(app, prompt, &current, user_id).await?);
            }
            QueryEngineType::LlmService => {
                references.extend(index_references(app, prompt, &current, user_id, options).await?);
            }
        }
    }

    tracing::info!(engine = %engine.name, count = references.len(), "retrieved references");
    Ok(references)
}

async fn managed_references(
    app: &AppContext,
    prompt: &str,
    engine: &QueryEngine,
    user_id: &str,
) -> Result<Vec<QueryReference>> {
    let service = app.managed_search.as_ref().ok_or_else(|| {
        Error::Validation("no managed search service is configured".to_string())
    })?;
    let references = service
        .search(engine, prompt, user_id)
        .await
        .map_err(service_error)?;
    for reference in &references {
        app.store.save_reference(reference).await?;
    }
    Ok(references)
}

async fn index_references(
    app: &AppContext,
    prompt: &str,
    engine: &QueryEngine,
    user_id: &str,
    options: &RetrieveOptions,
) -> Result<Vec<QueryReference>> {
    let embedder = app.embedders.get(&engine.embedding_type)?;
    let query_vec = embedder
        .embed(&[prompt.to_string()])
        .await?
        .into_iter()
        .next()
        .ok_or_else(|| anyhow::anyhow!("embedder returned no vector for the prompt"))?;

    let store = engine_vector_store(app, engine)?;
    let matches = store
        .similarity_search(&query_vec, options.filter.as_ref())
        .await
        .map_err(service_error)?;

    let mut references = Vec::with_capacity(matches.len());
    for index in matches {
        let chunk = app
            .store
            .find_chunk_by_index(&engine.id, index)
            .await?
            .ok_or_else(|| {
                anyhow::anyhow!("missing chunk for match index {} of engine {}", index, engine.name)
            })?;
        let doc = app
            .store
            .get_document(&chunk.document_id)
            .await?
            .ok_or_else(|| {
                anyhow::anyhow!("missing document {} of engine {}", chunk.document_id, engine.name)
            })?;

        let content = if options.rank_sentences {
            ranked_content(app, &chunk, embedder.as_ref(), &query_vec).await?
        } else {
            reference_content(&chunk)
        };

        let mut reference = QueryReference::new(engine, user_id, &doc.doc_url, content);
        reference.document_id = Some(doc.id.clone());
        reference.chunk_id = Some(chunk.id.clone());
        reference.page = chunk.page;
        app.store.save_reference(&reference).await?;
        references.push(reference);
    }
    Ok(references)
}

fn reference_content(chunk: &QueryDocumentChunk) -> ReferenceContent {
    match &chunk.content {
        ChunkContent::Text {
            text, clean_text: clean, ..
        } => ReferenceContent::Text {
            text: if clean.is_empty() {
                clean_text(text)
            } else {
                clean.clone()
            },
        },
        ChunkContent::Image { url, text } => ReferenceContent::Image {
            url: url.clone(),
            text: text.clone(),
        },
        ChunkContent::Video {
            url,
            start_secs,
            end_secs,
        } => ReferenceContent::Video {
            url: url.clone(),
            start_secs: *start_secs,
            end_secs: *end_secs,
        },
        ChunkContent::Audio {
            url,
            start_secs,
            end_secs,
        } => ReferenceContent::Audio {
            url: url.clone(),
            start_secs: *start_secs,
            end_secs: *end_secs,
        },
    }
}

/// Text content narrowed to the window around the best sentence.
async fn ranked_content(
    app: &AppContext,
    chunk: &QueryDocumentChunk,
    embedder: &dyn rag_harness_core::embedding::Embedder,
    query_vec: &[f32],
) -> Result<ReferenceContent> {
    let ChunkContent::Text { text, sentences, .. } = &chunk.content else {
        return Ok(reference_content(chunk));
    };
    // Chunks recorded without a sentence list are split on the fly.
    let sentences = if sentences.is_empty() {
        text_to_sentence_list(text)
    } else {
        sentences.clone()
    };
    if sentences.is_empty() {
        return Ok(reference_content(chunk));
    }

    tracing::debug!(chunk = %chunk.id, sentences = sentences.len(), "ranking sentences");
    let vectors = embedder.embed(&sentences).await?;
    let similarities: Vec<f32> = vectors
        .iter()
        .map(|v| cosine_similarity(query_vec, v))
        .collect();

    match top_relevant_sentences(
        &similarities,
        &sentences,
        app.config.retrieval.sentence_rerank_radius,
        true,
    ) {
        Some(window) => Ok(ReferenceContent::Text {
            text: window.join(" "),
        }),
        None => Ok(reference_content(chunk)),
    }
}

/// Retrieve references for `prompt`, reranking the merged list when the
/// engine is integrated.
///
/// # Errors
///
/// [`Error::FilterParse`] for a malformed `filter`; otherwise as
/// [`retrieve_references`].
pub async fn query_search(
    app: &AppContext,
    prompt: &str,
    engine: &QueryEngine,
    user_id: &str,
    filter: Option<&str>,
    rank_sentences: bool,
) -> Result<Vec<QueryReference>> {
    let filter = match filter {
        Some(text) if !text.trim().is_empty() => Some(parse_filter(text)?),
        _ => None,
    };
    let options = RetrieveOptions {
        filter,
        rank_sentences,
    };
    let references = retrieve_references(app, prompt, engine, user_id, &options).await?;
    rerank_if_integrated(app, prompt, engine, references).await
}

async fn rerank_if_integrated(
    app: &AppContext,
    prompt: &str,
    engine: &QueryEngine,
    references: Vec<QueryReference>,
) -> Result<Vec<QueryReference>> {
    if engine.engine_type != QueryEngineType::Integrated || references.len() <= 1 {
        return Ok(references);
    }
    let reranker = app.reranker()?;
    let ranked = rerank_references(
        reranker.as_ref(),
        prompt,
        references,
        app.config.retrieval.num_integrated_references,
    )
    .await?;
    Ok(ranked)
}

/// Answer `prompt` from `engine`'s documents and record the exchange.
///
/// The model is `llm_type`, else the engine's model. A `user_query`
/// continues that conversation; its history is part of the prompt.
///
/// # Errors
///
/// [`Error::ContextWindowExceeded`] when the prompt cannot be made to fit
/// the model's window; [`Error::Internal`] for provider failures.
pub async fn query_generate(
    app: &AppContext,
    user_id: &str,
    prompt: &str,
    engine: &QueryEngine,
    llm_type: Option<&str>,
    user_query: Option<UserQuery>,
    rank_sentences: bool,
) -> Result<Generation> {
    let model_id = llm_type
        .filter(|id| !id.is_empty())
        .unwrap_or(&engine.llm_type)
        .to_string();
    let model = app.llms.get(&model_id)?;
    let summarizer = app.llms.summarizer(&model_id)?;

    let references = query_search(app, prompt, engine, user_id, None, rank_sentences).await?;

    let history = user_query
        .as_ref()
        .map(|q| q.history.clone())
        .unwrap_or_default();
    let budget = ContextBudget::new(app.config.retrieval.chars_per_token, model.context_length());
    let assembler = ContextAssembler::new(
        budget,
        app.config.retrieval.min_query_references,
        summarizer.as_ref(),
    );
    let assembled = assembler.assemble(prompt, &history, references).await?;
    tracing::info!(
        engine = %engine.name,
        model = %model_id,
        references = assembled.references.len(),
        stage = ?assembled.stage,
        "generating answer"
    );

    let response = model.generate(&assembled.prompt, &[]).await?;

    let reference_ids: Vec<String> = assembled.references.iter().map(|r| r.id.clone()).collect();
    let result = QueryResult::new(&engine.id, user_id, prompt, &response, reference_ids);
    app.store.save_query_result(&result).await?;

    let user_query = update_user_query(
        app,
        prompt,
        &response,
        user_id,
        engine,
        &assembled.references,
        user_query,
    )
    .await?;

    Ok(Generation {
        result,
        references: assembled.references,
        user_query,
    })
}

/// Append a turn to `user_query`, creating the conversation if needed.
pub async fn update_user_query(
    app: &AppContext,
    prompt: &str,
    response: &str,
    user_id: &str,
    engine: &QueryEngine,
    references: &[QueryReference],
    user_query: Option<UserQuery>,
) -> Result<UserQuery> {
    let mut query = user_query.unwrap_or_else(|| UserQuery::new(user_id, &engine.id, prompt));
    query.append(
        prompt,
        response,
        references.iter().map(|r| r.id.clone()).collect(),
    );
    app.store.save_user_query(&query).await?;
    Ok(query)
}

/// Load a conversation by id.
pub async fn find_user_query(app: &AppContext, id: &str) -> Result<UserQuery> {
    app.store
        .get_user_query(id)
        .await?
        .ok_or_else(|| Error::not_found("user query", id))
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use async_trait::async_trait;
    use rag_harness_core::llm::{ChatTurn, LanguageModel};
    use rag_harness_core::models::QueryDocument;

    use super::*;
    use crate::config::Config;
    use crate::orchestrator::open_vector_store;
    use crate::vector_store::testing::KeywordEmbedder;

    const KEYWORDS: &[&str] = &["cat", "dogs", "fish", "birds"];

    struct CountingModel;

    #[async_trait]
    impl LanguageModel for CountingModel {
        fn model_name(&self) -> &str {
            "counting"
        }
        fn context_length(&self) -> Option<usize> {
            None
        }
        async fn generate(&self, prompt: &str, _chat: &[ChatTurn]) -> anyhow::Result<String> {
            Ok(format!("{} chars", prompt.len()))
        }
    }

    async fn test_app(dir: &std::path::Path) -> AppContext {
        let app = AppContext::open(Config::for_root(dir)).await.unwrap();
        app.embedders.insert("kw", Arc::new(KeywordEmbedder::new(KEYWORDS)));
        app.llms.insert("chat", Arc::new(CountingModel));
        app
    }

    /// An indexed engine with one document of one chunk per text.
    async fn indexed_engine(app: &AppContext, name: &str, texts: &[&str]) -> QueryEngine {
        let mut engine = QueryEngine::new(name, QueryEngineType::LlmService, "u1");
        engine.embedding_type = "kw".to_string();
        engine.llm_type = "chat".to_string();
        engine.vector_store = Some("sqlite_vector".to_string());
        app.store.save_engine(&engine).await.unwrap();

        let texts: Vec<String> = texts.iter().map(|t| t.to_string()).collect();
        let store = open_vector_store(app, &engine, "sqlite_vector").unwrap();
        let end = store
            .index_document("doc.txt", &texts, 0, &serde_json::Map::new())
            .await
            .unwrap();

        let doc = QueryDocument::new(&engine.id, &format!("gs://b/{}.txt", name), 0, end);
        app.store.save_document(&doc).await.unwrap();
        let chunks: Vec<QueryDocumentChunk> = texts
            .iter()
            .enumerate()
            .map(|(i, t)| {
                let content = ChunkContent::Text {
                    text: t.clone(),
                    clean_text: clean_text(t),
                    sentences: text_to_sentence_list(t),
                };
                QueryDocumentChunk::new(&engine.id, &doc.id, i as i64, content)
            })
            .collect();
        app.store.save_chunks(&chunks).await.unwrap();
        engine
    }

    #[tokio::test]
    async fn test_retrieve_builds_and_saves_references() {
        let dir = tempfile::tempdir().unwrap();
        let app = test_app(dir.path()).await;
        let engine = indexed_engine(&app, "pets", &["A cat naps.", "Fish swim in tanks."]).await;

        let refs = retrieve_references(&app, "fish", &engine, "u1", &RetrieveOptions::default())
            .await
            .unwrap();

        assert_eq!(refs[0].text(), "Fish swim in tanks.");
        assert_eq!(refs[0].document_url, "gs://b/pets.txt");
        assert!(refs[0].chunk_id.is_some());
        let saved = app.store.get_reference(&refs[0].id).await.unwrap();
        assert_eq!(saved.as_ref().map(|r| r.engine_name.as_str()), Some("pets"));
    }

    #[tokio::test]
    async fn test_sentence_ranking_highlights_best_sentence() {
        let dir = tempfile::tempdir().unwrap();
        let app = test_app(dir.path()).await;
        let text = "Cows graze. The cat sat. Dogs bark loudly. A fish swims. Birds fly. Rain falls.";
        let engine = indexed_engine(&app, "farm", &[text]).await;

        let options = RetrieveOptions {
            filter: None,
            rank_sentences: true,
        };
        let refs = retrieve_references(&app, "dogs", &engine, "u1", &options)
            .await
            .unwrap();

        let shown = refs[0].text();
        assert!(shown.contains("<b>Dogs bark loudly.</b>"));
        assert!(shown.starts_with("Cows graze."));
        assert!(shown.ends_with("Birds fly."));
        assert!(!shown.contains("Rain"));
    }

    #[tokio::test]
    async fn test_missing_chunk_is_internal_error() {
        let dir = tempfile::tempdir().unwrap();
        let app = test_app(dir.path()).await;
        let engine = indexed_engine(&app, "pets", &["A cat naps."]).await;

        // Vectors without chunk records.
        let store = open_vector_store(&app, &engine, "sqlite_vector").unwrap();
        store
            .index_document("extra.txt", &["cat again".to_string()], 5, &serde_json::Map::new())
            .await
            .unwrap();

        let err = retrieve_references(&app, "cat", &engine, "u1", &RetrieveOptions::default())
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Internal(_)));
    }

    #[tokio::test]
    async fn test_integrated_concatenates_children_in_order() {
        let dir = tempfile::tempdir().unwrap();
        let app = test_app(dir.path()).await;
        let mut first = indexed_engine(&app, "first", &["The cat sat."]).await;
        let mut second = indexed_engine(&app, "second", &["The cat ran."]).await;

        let parent = QueryEngine::new("both", QueryEngineType::Integrated, "u1");
        app.store.save_engine(&parent).await.unwrap();
        for child in [&mut first, &mut second] {
            child.parent_engine_id = Some(parent.id.clone());
            app.store.save_engine(child).await.unwrap();
        }

        let refs = retrieve_references(&app, "cat", &parent, "u1", &RetrieveOptions::default())
            .await
            .unwrap();
        let names: Vec<&str> = refs.iter().map(|r| r.engine_name.as_str()).collect();
        assert_eq!(names, vec!["first", "second"]);
    }

    #[tokio::test]
    async fn test_bad_filter_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let app = test_app(dir.path()).await;
        let engine = indexed_engine(&app, "pets", &["A cat naps."]).await;

        let err = query_search(&app, "cat", &engine, "u1", Some("year >"), false)
            .await
            .unwrap_err();
        assert!(matches!(err, Error::FilterParse(_)));
    }

    #[tokio::test]
    async fn test_generate_records_result_and_history() {
        let dir = tempfile::tempdir().unwrap();
        let app = test_app(dir.path()).await;
        let engine = indexed_engine(&app, "pets", &["A cat naps.", "Fish swim."]).await;

        let first = query_generate(&app, "u1", "cat?", &engine, None, None, false)
            .await
            .unwrap();
        assert!(first.result.response.ends_with("chars"));
        assert_eq!(first.user_query.history.len(), 1);
        let saved = app.store.get_query_result(&first.result.id).await.unwrap();
        assert!(saved.is_some());

        let second = query_generate(
            &app,
            "u1",
            "and fish?",
            &engine,
            Some("chat"),
            Some(first.user_query.clone()),
            false,
        )
        .await
        .unwrap();
        assert_eq!(second.user_query.id, first.user_query.id);
        assert_eq!(second.user_query.history.len(), 2);
        assert_eq!(second.user_query.history[1].prompt, "and fish?");

        let loaded = find_user_query(&app, &first.user_query.id).await.unwrap();
        assert_eq!(loaded.history.len(), 2);
    }

    #[test]
    fn test_service_error_keeps_typed_errors() {
        let typed = anyhow::Error::new(Error::Validation("or is unsupported".into()));
        assert!(matches!(service_error(typed), Error::Validation(_)));
        assert!(matches!(service_error(anyhow::anyhow!("io")), Error::Internal(_)));
    }
}
