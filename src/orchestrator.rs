//! Query-engine build, deploy, and delete.
//!
//! A build runs as a small state machine with two terminal states:
//!
//! ```text
//! validate name ─▶ resolve defaults ─▶ persist engine ─▶ dispatch on type ─┬─▶ built
//!                                                                          └─▶ failed
//!                                                        (hard delete of everything
//!                                                         the build created)
//! ```
//!
//! Dispatch by engine type:
//!
//! | Type | Work |
//! |------|------|
//! | `managed_search` | hand the document URL to the managed search service |
//! | `llm_service` | resolve a vector store, run the ingestion pipeline |
//! | `integrated` | link the engines named in `associated_engines` as children |
//!
//! A failed build leaves no engine record behind. Errors the caller can fix
//! (duplicate name, missing child engine, nothing indexable) keep their
//! type; everything else surfaces as [`Error::Internal`].

use rag_harness_core::models::{BuildParams, QueryEngine, QueryEngineType};
use rag_harness_core::store::DeleteMode;
use rag_harness_core::{Error, Result};

use crate::app::AppContext;
use crate::ingest::build_doc_index;
use crate::vector_store::{StoreContext, VectorStore};

/// Everything needed to build one engine.
#[derive(Debug, Clone)]
pub struct BuildRequest {
    pub name: String,
    pub engine_type: QueryEngineType,
    pub doc_url: Option<String>,
    pub user_id: String,
    pub description: String,
    pub embedding_type: Option<String>,
    pub llm_type: Option<String>,
    /// Vector store backend id; defaults to `vector_store.default`.
    pub vector_store: Option<String>,
    pub is_public: Option<bool>,
    pub params: BuildParams,
}

impl BuildRequest {
    pub fn new(name: &str, engine_type: QueryEngineType, user_id: &str) -> Self {
        Self {
            name: name.to_string(),
            engine_type,
            doc_url: None,
            user_id: user_id.to_string(),
            description: String::new(),
            embedding_type: None,
            llm_type: None,
            vector_store: None,
            is_public: None,
            params: BuildParams::new(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct BuildOutcome {
    pub engine: QueryEngine,
    pub docs_processed: Vec<String>,
    pub docs_not_processed: Vec<String>,
}

/// Build a query engine.
///
/// # Errors
///
/// - [`Error::Validation`] for a duplicate name, a build of the same name
///   already running in this process, or missing build inputs.
/// - [`Error::NotFound`] for an unknown child engine.
/// - [`Error::NoDocumentsIndexed`] when no document could be indexed.
/// - [`Error::Internal`] for backend failures.
pub async fn query_engine_build(app: &AppContext, request: BuildRequest) -> Result<BuildOutcome> {
    let _claim = app.claim_build(&request.name).ok_or_else(|| {
        Error::Validation(format!("a build of {} is already running", request.name))
    })?;

    if app.store.find_engine_by_name(&request.name).await?.is_some() {
        return Err(Error::Validation(format!(
            "Query engine {} already exists",
            request.name
        )));
    }

    let mut engine = new_engine(app, &request);
    app.store.save_engine(&engine).await?;
    tracing::info!(engine = %engine.name, id = %engine.id, engine_type = %engine.engine_type, "starting build");

    match run_build(app, &mut engine, &request).await {
        Ok((docs_processed, docs_not_processed)) => {
            tracing::info!(engine = %engine.name, processed = docs_processed.len(), "build complete");
            Ok(BuildOutcome {
                engine,
                docs_processed,
                docs_not_processed,
            })
        }
        Err(e) => {
            tracing::error!(engine = %engine.name, error = %e, "build failed, removing engine");
            if let Err(cleanup) = rollback(app, &engine).await {
                tracing::warn!(engine = %engine.name, error = %cleanup, "rollback incomplete");
            }
            Err(e)
        }
    }
}

fn new_engine(app: &AppContext, request: &BuildRequest) -> QueryEngine {
    let multimodal = request.params.get_bool("is_multimodal");
    let (default_embedding, default_llm) = if multimodal {
        (
            &app.config.embedding.default_multimodal,
            &app.config.llm.default_multimodal,
        )
    } else {
        (&app.config.embedding.default_text, &app.config.llm.default_text)
    };

    let mut engine = QueryEngine::new(&request.name, request.engine_type, &request.user_id);
    engine.description = request.description.clone();
    engine.embedding_type = request
        .embedding_type
        .clone()
        .unwrap_or_else(|| default_embedding.clone());
    engine.llm_type = request.llm_type.clone().unwrap_or_else(|| default_llm.clone());
    engine.is_public = request.is_public.unwrap_or(true);
    engine.doc_url = request.doc_url.clone();
    engine.params = request.params.clone();
    engine
}

/// Type-specific work. Returns processed and unprocessed document URLs.
async fn run_build(
    app: &AppContext,
    engine: &mut QueryEngine,
    request: &BuildRequest,
) -> Result<(Vec<String>, Vec<String>)> {
    match engine.engine_type {
        QueryEngineType::ManagedSearch => {
            let service = app.managed_search.as_ref().ok_or_else(|| {
                Error::Validation("no managed search service is configured".to_string())
            })?;
            let doc_url = engine.doc_url.clone().ok_or_else(|| {
                Error::Validation(format!("engine {} has no doc_url", engine.name))
            })?;
            let built = service.build(engine, &doc_url).await?;
            Ok((built.docs_processed, built.docs_not_processed))
        }
        QueryEngineType::LlmService => {
            let store_id = request
                .vector_store
                .clone()
                .unwrap_or_else(|| app.config.vector_store.default.clone());
            let vector_store = open_vector_store(app, engine, &store_id)?;
            engine.vector_store = Some(vector_store.store_type().to_string());
            app.store.save_engine(engine).await?;

            let outcome = build_doc_index(app, engine, vector_store.as_ref()).await?;
            if let Some(deployed) = outcome.deployed {
                engine.index_id = Some(deployed.index_id);
                engine.endpoint = Some(deployed.endpoint);
                engine.deployed_index_name = Some(deployed.deployed_index_name);
                app.store.save_engine(engine).await?;
            }
            Ok((outcome.docs_processed, outcome.docs_not_processed))
        }
        QueryEngineType::Integrated => {
            let names = engine.params.get_list("associated_engines");
            if names.is_empty() {
                return Err(Error::Validation(
                    "integrated engines need an associated_engines parameter".to_string(),
                ));
            }
            for name in &names {
                let mut child = app
                    .store
                    .find_engine_by_name(name)
                    .await?
                    .ok_or_else(|| Error::not_found("query engine", name.as_str()))?;
                child.parent_engine_id = Some(engine.id.clone());
                app.store.save_engine(&child).await?;
                tracing::info!(engine = %engine.name, child = %child.name, "linked child engine");
            }
            Ok((Vec::new(), Vec::new()))
        }
    }
}

/// Construct backend `store_id` for `engine`.
pub fn open_vector_store(
    app: &AppContext,
    engine: &QueryEngine,
    store_id: &str,
) -> anyhow::Result<Box<dyn VectorStore>> {
    let embedder = app.embedders.get(&engine.embedding_type)?;
    let ctx = StoreContext {
        config: &app.config,
        engine,
        embedder,
    };
    app.vector_stores.resolve(store_id, &ctx)
}

/// The vector store an engine was built with.
pub fn engine_vector_store(app: &AppContext, engine: &QueryEngine) -> anyhow::Result<Box<dyn VectorStore>> {
    let store_id = engine
        .vector_store
        .as_deref()
        .ok_or_else(|| anyhow::anyhow!("engine {} has no vector store", engine.name))?;
    open_vector_store(app, engine, store_id)
}

async fn rollback(app: &AppContext, engine: &QueryEngine) -> Result<()> {
    unlink_children(app, engine).await?;
    delete_engine(app, engine, true).await
}

async fn unlink_children(app: &AppContext, engine: &QueryEngine) -> Result<()> {
    for mut child in app.store.child_engines(&engine.id).await? {
        child.parent_engine_id = None;
        app.store.save_engine(&child).await?;
    }
    Ok(())
}

/// Delete an engine's backing index, then soft- or hard-delete its records.
///
/// Failing to remove backing resources is logged, not returned, so records
/// are always cleaned up.
pub async fn delete_engine(app: &AppContext, engine: &QueryEngine, hard: bool) -> Result<()> {
    match engine.engine_type {
        QueryEngineType::ManagedSearch => {
            if let Some(service) = &app.managed_search {
                if let Err(e) = service.delete(engine).await {
                    tracing::error!(engine = %engine.name, error = %e, "error deleting managed search store");
                }
            }
        }
        QueryEngineType::LlmService if engine.vector_store.is_some() => {
            let deleted = match engine_vector_store(app, engine) {
                Ok(store) => store.delete().await,
                Err(e) => Err(e),
            };
            if let Err(e) = deleted {
                tracing::error!(engine = %engine.name, error = %e, "error deleting vector store");
            }
        }
        QueryEngineType::Integrated => unlink_children(app, engine).await?,
        QueryEngineType::LlmService => {}
    }

    let mode = if hard { DeleteMode::Hard } else { DeleteMode::Soft };
    tracing::info!(engine = %engine.name, id = %engine.id, ?mode, "deleting query engine");
    app.store.delete_engine(&engine.id, mode).await?;
    Ok(())
}

/// Look up a live engine by name.
pub async fn find_engine(app: &AppContext, name: &str) -> Result<QueryEngine> {
    app.store
        .find_engine_by_name(name)
        .await?
        .ok_or_else(|| Error::not_found("query engine", name))
}

/// Re-run `deploy` for an already indexed engine and persist its handles.
pub async fn deploy_engine(app: &AppContext, name: &str) -> Result<QueryEngine> {
    let mut engine = find_engine(app, name).await?;
    if engine.engine_type != QueryEngineType::LlmService {
        return Err(Error::Validation(format!(
            "engine {} is of type {} and has no vector store to deploy",
            engine.name, engine.engine_type
        )));
    }
    let store = engine_vector_store(app, &engine)?;
    if let Some(deployed) = store.deploy().await? {
        engine.index_id = Some(deployed.index_id);
        engine.endpoint = Some(deployed.endpoint);
        engine.deployed_index_name = Some(deployed.deployed_index_name);
        app.store.save_engine(&engine).await?;
    }
    tracing::info!(engine = %engine.name, "deploy finished");
    Ok(engine)
}
