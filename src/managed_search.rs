//! Seam for engines of type `managed_search`.
//!
//! Such engines hand document ingestion and search to an external search
//! service. The service client is optional on [`crate::app::AppContext`];
//! building or searching a managed-search engine without one is a
//! validation error.

use anyhow::Result;
use async_trait::async_trait;
use rag_harness_core::models::{QueryEngine, QueryReference};

/// Per-document outcome of a managed build.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ManagedBuild {
    pub docs_processed: Vec<String>,
    pub docs_not_processed: Vec<String>,
}

#[async_trait]
pub trait ManagedSearch: Send + Sync {
    /// Create the service-side data store for `engine` and import `doc_url`.
    async fn build(&self, engine: &QueryEngine, doc_url: &str) -> Result<ManagedBuild>;

    /// Search the engine's data store. References are returned unsaved.
    async fn search(&self, engine: &QueryEngine, prompt: &str, user_id: &str) -> Result<Vec<QueryReference>>;

    /// Remove the service-side data store. Absent stores are not an error.
    async fn delete(&self, engine: &QueryEngine) -> Result<()>;
}
