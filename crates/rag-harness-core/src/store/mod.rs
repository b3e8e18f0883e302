//! Record storage for query engines and everything they own.
//!
//! The [`RecordStore`] trait covers exactly the operations the build and
//! query services consume: keyed save/lookup, the engine-scoped lookups used
//! during retrieval, and engine-scoped teardown. Backends: SQLite in the app
//! crate, [`memory::InMemoryRecordStore`] here.
//!
//! Lookups skip soft-deleted rows unless the method says otherwise.

pub mod memory;

use anyhow::Result;
use async_trait::async_trait;

use crate::models::{
    QueryDocument, QueryDocumentChunk, QueryEngine, QueryReference, QueryResult, UserQuery,
};

/// Engine-scoped delete mode.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeleteMode {
    /// Stamp `deleted_at`; rows stay for audit.
    Soft,
    /// Remove rows.
    Hard,
}

#[async_trait]
pub trait RecordStore: Send + Sync {
    // ── Engines ──────────────────────────────────────────────────────

    /// Insert or replace an engine record.
    async fn save_engine(&self, engine: &QueryEngine) -> Result<()>;

    /// Look up by id, including soft-deleted engines.
    async fn get_engine(&self, id: &str) -> Result<Option<QueryEngine>>;

    /// The non-deleted engine with this name, if any.
    async fn find_engine_by_name(&self, name: &str) -> Result<Option<QueryEngine>>;

    /// All non-deleted engines, oldest first.
    async fn list_engines(&self) -> Result<Vec<QueryEngine>>;

    /// Non-deleted engines whose parent is `parent_id`.
    async fn child_engines(&self, parent_id: &str) -> Result<Vec<QueryEngine>>;

    // ── Documents and chunks ─────────────────────────────────────────

    async fn save_document(&self, doc: &QueryDocument) -> Result<()>;

    async fn get_document(&self, id: &str) -> Result<Option<QueryDocument>>;

    /// Documents of an engine ordered by `index_start`.
    async fn documents_for_engine(&self, engine_id: &str) -> Result<Vec<QueryDocument>>;

    async fn save_chunks(&self, chunks: &[QueryDocumentChunk]) -> Result<()>;

    async fn get_chunk(&self, id: &str) -> Result<Option<QueryDocumentChunk>>;

    /// The chunk occupying vector-store slot `index` of an engine.
    async fn find_chunk_by_index(
        &self,
        engine_id: &str,
        index: i64,
    ) -> Result<Option<QueryDocumentChunk>>;

    /// Chunks of an engine ordered by index.
    async fn chunks_for_engine(&self, engine_id: &str) -> Result<Vec<QueryDocumentChunk>>;

    // ── Query history ────────────────────────────────────────────────

    async fn save_reference(&self, reference: &QueryReference) -> Result<()>;

    async fn get_reference(&self, id: &str) -> Result<Option<QueryReference>>;

    async fn save_query_result(&self, result: &QueryResult) -> Result<()>;

    async fn get_query_result(&self, id: &str) -> Result<Option<QueryResult>>;

    /// Insert or replace a user query with its full history.
    async fn save_user_query(&self, query: &UserQuery) -> Result<()>;

    async fn get_user_query(&self, id: &str) -> Result<Option<UserQuery>>;

    // ── Teardown ─────────────────────────────────────────────────────

    /// Delete an engine together with its documents, chunks, references, and
    /// query results.
    async fn delete_engine(&self, engine_id: &str, mode: DeleteMode) -> Result<()>;
}
