//! Process-scoped application context.
//!
//! [`AppContext`] is constructed once (in `main`, or per test) and passed
//! by reference to the build and query services. It owns every backend
//! and registry those services need:
//!
//! ```text
//! AppContext
//! ├── config
//! ├── store            RecordStore (SQLite)
//! ├── storage          ObjectStorage (local dir or GCS)
//! ├── embedders        model id → Embedder
//! ├── llms             model id → LanguageModel
//! ├── vector_stores    backend id → VectorStore factory
//! ├── data_sources     URL scheme → DataSource factory
//! ├── chunker          text + multimodal chunking
//! ├── reranker         created on first use
//! └── managed_search   optional external search service
//! ```
//!
//! Individual parts are public so tests can swap in deterministic fakes.

use std::collections::HashSet;
use std::sync::{Arc, Mutex};

use anyhow::{anyhow, Result};
use rag_harness_core::rerank::Reranker;
use rag_harness_core::store::RecordStore;
use sqlx::SqlitePool;

use crate::config::Config;
use crate::data_source::{DataSourceRegistry, DocumentChunker, PdftoppmRasterizer};
use crate::db;
use crate::embedding::EmbedderRegistry;
use crate::llm::LlmRegistry;
use crate::managed_search::ManagedSearch;
use crate::migrate;
use crate::reranker::create_reranker;
use crate::sqlite_store::SqliteRecordStore;
use crate::storage::{create_storage, ObjectStorage};
use crate::vector_store::{AnnIndexService, VectorStoreRegistry, VertexAnnService};

pub struct AppContext {
    pub config: Config,
    pub pool: SqlitePool,
    pub store: Arc<dyn RecordStore>,
    pub storage: Arc<dyn ObjectStorage>,
    pub embedders: EmbedderRegistry,
    pub llms: LlmRegistry,
    pub vector_stores: VectorStoreRegistry,
    pub data_sources: DataSourceRegistry,
    pub chunker: DocumentChunker,
    pub managed_search: Option<Arc<dyn ManagedSearch>>,
    reranker: Mutex<Option<Arc<dyn Reranker>>>,
    building: Mutex<HashSet<String>>,
}

impl AppContext {
    /// Connect to the database (applying migrations), then construct the
    /// storage backend and registries from `config`.
    pub async fn open(config: Config) -> Result<Self> {
        let pool = db::connect(&config).await?;
        migrate::apply(&pool).await?;

        let storage = create_storage(&config)?;
        let ann: Arc<dyn AnnIndexService> = Arc::new(VertexAnnService::new(&config)?);
        let vector_stores = VectorStoreRegistry::with_defaults(pool.clone(), storage.clone(), ann);
        let chunker = DocumentChunker::new(
            storage.clone(),
            Arc::new(PdftoppmRasterizer::new()),
            &config.retrieval,
        );

        Ok(Self {
            store: Arc::new(SqliteRecordStore::new(pool.clone())),
            embedders: EmbedderRegistry::from_config(&config),
            llms: LlmRegistry::from_config(&config),
            data_sources: DataSourceRegistry::with_defaults(),
            managed_search: None,
            reranker: Mutex::new(None),
            building: Mutex::new(HashSet::new()),
            pool,
            storage,
            vector_stores,
            chunker,
            config,
        })
    }

    /// The configured reranker, created on first use.
    pub fn reranker(&self) -> Result<Arc<dyn Reranker>> {
        let mut cached = self
            .reranker
            .lock()
            .map_err(|_| anyhow!("reranker lock poisoned"))?;
        if let Some(reranker) = cached.as_ref() {
            return Ok(reranker.clone());
        }
        let reranker = create_reranker(&self.config, &self.embedders)?;
        *cached = Some(reranker.clone());
        Ok(reranker)
    }

    pub fn set_reranker(&self, reranker: Arc<dyn Reranker>) {
        if let Ok(mut cached) = self.reranker.lock() {
            *cached = Some(reranker);
        }
    }

    /// Mark `name` as being built in this process. `None` if another build
    /// of the same name holds it.
    pub fn claim_build(&self, name: &str) -> Option<BuildClaim<'_>> {
        let mut building = self.building.lock().ok()?;
        if !building.insert(name.to_string()) {
            return None;
        }
        Some(BuildClaim {
            set: &self.building,
            name: name.to_string(),
        })
    }

    pub async fn close(&self) {
        self.pool.close().await;
    }
}

/// Releases a build name when dropped.
pub struct BuildClaim<'a> {
    set: &'a Mutex<HashSet<String>>,
    name: String,
}

impl Drop for BuildClaim<'_> {
    fn drop(&mut self) {
        if let Ok(mut set) = self.set.lock() {
            set.remove(&self.name);
        }
    }
}
