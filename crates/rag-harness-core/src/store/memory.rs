//! In-memory [`RecordStore`] for tests and embedded use.
//!
//! Each record kind lives in a `HashMap` behind `std::sync::RwLock`.
//! Ordering guarantees of the trait are applied at read time.

use std::collections::HashMap;
use std::sync::{RwLock, RwLockReadGuard, RwLockWriteGuard};

use anyhow::{anyhow, Result};
use async_trait::async_trait;
use chrono::Utc;

use crate::models::{
    QueryDocument, QueryDocumentChunk, QueryEngine, QueryReference, QueryResult, UserQuery,
};

use super::{DeleteMode, RecordStore};

#[derive(Default)]
struct Tables {
    engines: HashMap<String, QueryEngine>,
    documents: HashMap<String, QueryDocument>,
    chunks: HashMap<String, QueryDocumentChunk>,
    references: HashMap<String, QueryReference>,
    results: HashMap<String, QueryResult>,
    user_queries: HashMap<String, UserQuery>,
}

#[derive(Default)]
pub struct InMemoryRecordStore {
    tables: RwLock<Tables>,
}

impl InMemoryRecordStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn read(&self) -> Result<RwLockReadGuard<'_, Tables>> {
        self.tables
            .read()
            .map_err(|_| anyhow!("record store lock poisoned"))
    }

    fn write(&self) -> Result<RwLockWriteGuard<'_, Tables>> {
        self.tables
            .write()
            .map_err(|_| anyhow!("record store lock poisoned"))
    }
}

#[async_trait]
impl RecordStore for InMemoryRecordStore {
    async fn save_engine(&self, engine: &QueryEngine) -> Result<()> {
        self.write()?
            .engines
            .insert(engine.id.clone(), engine.clone());
        Ok(())
    }

    async fn get_engine(&self, id: &str) -> Result<Option<QueryEngine>> {
        Ok(self.read()?.engines.get(id).cloned())
    }

    async fn find_engine_by_name(&self, name: &str) -> Result<Option<QueryEngine>> {
        Ok(self
            .read()?
            .engines
            .values()
            .find(|e| e.name == name && e.deleted_at.is_none())
            .cloned())
    }

    async fn list_engines(&self) -> Result<Vec<QueryEngine>> {
        let mut engines: Vec<QueryEngine> = self
            .read()?
            .engines
            .values()
            .filter(|e| e.deleted_at.is_none())
            .cloned()
            .collect();
        engines.sort_by(|a, b| a.created_at.cmp(&b.created_at).then(a.name.cmp(&b.name)));
        Ok(engines)
    }

    async fn child_engines(&self, parent_id: &str) -> Result<Vec<QueryEngine>> {
        let mut children: Vec<QueryEngine> = self
            .read()?
            .engines
            .values()
            .filter(|e| e.deleted_at.is_none() && e.parent_engine_id.as_deref() == Some(parent_id))
            .cloned()
            .collect();
        children.sort_by(|a, b| a.created_at.cmp(&b.created_at).then(a.name.cmp(&b.name)));
        Ok(children)
    }

    async fn save_document(&self, doc: &QueryDocument) -> Result<()> {
        self.write()?.documents.insert(doc.id.clone(), doc.clone());
        Ok(())
    }

    async fn get_document(&self, id: &str) -> Result<Option<QueryDocument>> {
        Ok(self
            .read()?
            .documents
            .get(id)
            .filter(|d| d.deleted_at.is_none())
            .cloned())
    }

    async fn documents_for_engine(&self, engine_id: &str) -> Result<Vec<QueryDocument>> {
        let mut docs: Vec<QueryDocument> = self
            .read()?
            .documents
            .values()
            .filter(|d| d.engine_id == engine_id && d.deleted_at.is_none())
            .cloned()
            .collect();
        docs.sort_by_key(|d| d.index_start);
        Ok(docs)
    }

    async fn save_chunks(&self, chunks: &[QueryDocumentChunk]) -> Result<()> {
        let mut tables = self.write()?;
        for chunk in chunks {
            tables.chunks.insert(chunk.id.clone(), chunk.clone());
        }
        Ok(())
    }

    async fn get_chunk(&self, id: &str) -> Result<Option<QueryDocumentChunk>> {
        Ok(self
            .read()?
            .chunks
            .get(id)
            .filter(|c| c.deleted_at.is_none())
            .cloned())
    }

    async fn find_chunk_by_index(
        &self,
        engine_id: &str,
        index: i64,
    ) -> Result<Option<QueryDocumentChunk>> {
        Ok(self
            .read()?
            .chunks
            .values()
            .find(|c| c.engine_id == engine_id && c.index == index && c.deleted_at.is_none())
            .cloned())
    }

    async fn chunks_for_engine(&self, engine_id: &str) -> Result<Vec<QueryDocumentChunk>> {
        let mut chunks: Vec<QueryDocumentChunk> = self
            .read()?
            .chunks
            .values()
            .filter(|c| c.engine_id == engine_id && c.deleted_at.is_none())
            .cloned()
            .collect();
        chunks.sort_by_key(|c| c.index);
        Ok(chunks)
    }

    async fn save_reference(&self, reference: &QueryReference) -> Result<()> {
        self.write()?
            .references
            .insert(reference.id.clone(), reference.clone());
        Ok(())
    }

    async fn get_reference(&self, id: &str) -> Result<Option<QueryReference>> {
        Ok(self
            .read()?
            .references
            .get(id)
            .filter(|r| r.deleted_at.is_none())
            .cloned())
    }

    async fn save_query_result(&self, result: &QueryResult) -> Result<()> {
        self.write()?
            .results
            .insert(result.id.clone(), result.clone());
        Ok(())
    }

    async fn get_query_result(&self, id: &str) -> Result<Option<QueryResult>> {
        Ok(self
            .read()?
            .results
            .get(id)
            .filter(|r| r.deleted_at.is_none())
            .cloned())
    }

    async fn save_user_query(&self, query: &UserQuery) -> Result<()> {
        self.write()?
            .user_queries
            .insert(query.id.clone(), query.clone());
        Ok(())
    }

    async fn get_user_query(&self, id: &str) -> Result<Option<UserQuery>> {
        Ok(self
            .read()?
            .user_queries
            .get(id)
            .filter(|q| q.deleted_at.is_none())
            .cloned())
    }

    async fn delete_engine(&self, engine_id: &str, mode: DeleteMode) -> Result<()> {
        let mut tables = self.write()?;
        match mode {
            DeleteMode::Hard => {
                tables.documents.retain(|_, d| d.engine_id != engine_id);
                tables.chunks.retain(|_, c| c.engine_id != engine_id);
                tables.references.retain(|_, r| r.engine_id != engine_id);
                tables.results.retain(|_, r| r.engine_id != engine_id);
                tables.engines.remove(engine_id);
            }
            DeleteMode::Soft => {
                let now = Some(Utc::now());
                for d in tables.documents.values_mut().filter(|d| d.engine_id == engine_id) {
                    d.deleted_at = now;
                }
                for c in tables.chunks.values_mut().filter(|c| c.engine_id == engine_id) {
                    c.deleted_at = now;
                }
                for r in tables.references.values_mut().filter(|r| r.engine_id == engine_id) {
                    r.deleted_at = now;
                }
                for r in tables.results.values_mut().filter(|r| r.engine_id == engine_id) {
                    r.deleted_at = now;
                }
                if let Some(engine) = tables.engines.get_mut(engine_id) {
                    engine.deleted_at = now;
                }
            }
        }
        Ok(())
    }
}
