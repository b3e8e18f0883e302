//! SQLite-backed [`RecordStore`] implementation.
//!
//! Wraps a `SqlitePool`; each trait method is one or a few queries. Rows
//! map to the core models through small `row_to_*` helpers, with JSON text
//! columns for nested payloads.

use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::sqlite::SqliteRow;
use sqlx::{Row, SqlitePool};

use rag_harness_core::models::{
    BuildParams, ChunkContent, HistoryEntry, QueryDocument, QueryDocumentChunk, QueryEngine,
    QueryReference, QueryResult, ReferenceContent, UserQuery,
};
use rag_harness_core::store::{DeleteMode, RecordStore};

pub struct SqliteRecordStore {
    pool: SqlitePool,
}

impl SqliteRecordStore {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }
}

fn to_micros(ts: DateTime<Utc>) -> i64 {
    ts.timestamp_micros()
}

fn opt_micros(ts: Option<DateTime<Utc>>) -> Option<i64> {
    ts.map(to_micros)
}

fn from_micros(us: i64) -> DateTime<Utc> {
    DateTime::from_timestamp_micros(us).unwrap_or_default()
}

fn opt_from_micros(us: Option<i64>) -> Option<DateTime<Utc>> {
    us.map(from_micros)
}

const ENGINE_COLUMNS: &str = "id, name, engine_type, description, embedding_type, llm_type, \
     vector_store, is_public, doc_url, created_by, parent_engine_id, params_json, index_id, \
     endpoint, deployed_index_name, created_at, deleted_at";

fn row_to_engine(row: &SqliteRow) -> Result<QueryEngine> {
    let engine_type: String = row.get("engine_type");
    let params_json: String = row.get("params_json");
    let is_public: i64 = row.get("is_public");
    Ok(QueryEngine {
        id: row.get("id"),
        name: row.get("name"),
        engine_type: engine_type.parse().map_err(anyhow::Error::msg)?,
        description: row.get("description"),
        embedding_type: row.get("embedding_type"),
        llm_type: row.get("llm_type"),
        vector_store: row.get("vector_store"),
        is_public: is_public != 0,
        doc_url: row.get("doc_url"),
        created_by: row.get("created_by"),
        parent_engine_id: row.get("parent_engine_id"),
        params: serde_json::from_str::<BuildParams>(&params_json)
            .context("corrupt params_json on query engine")?,
        index_id: row.get("index_id"),
        endpoint: row.get("endpoint"),
        deployed_index_name: row.get("deployed_index_name"),
        created_at: from_micros(row.get("created_at")),
        deleted_at: opt_from_micros(row.get("deleted_at")),
    })
}

fn row_to_document(row: &SqliteRow) -> QueryDocument {
    QueryDocument {
        id: row.get("id"),
        engine_id: row.get("engine_id"),
        doc_url: row.get("doc_url"),
        index_start: row.get("index_start"),
        index_end: row.get("index_end"),
        created_at: from_micros(row.get("created_at")),
        deleted_at: opt_from_micros(row.get("deleted_at")),
    }
}

fn row_to_chunk(row: &SqliteRow) -> Result<QueryDocumentChunk> {
    let content_json: String = row.get("content_json");
    Ok(QueryDocumentChunk {
        id: row.get("id"),
        engine_id: row.get("engine_id"),
        document_id: row.get("document_id"),
        index: row.get("chunk_index"),
        page: row.get("page"),
        content: serde_json::from_str::<ChunkContent>(&content_json)
            .context("corrupt content_json on chunk")?,
        created_at: from_micros(row.get("created_at")),
        deleted_at: opt_from_micros(row.get("deleted_at")),
    })
}

fn row_to_reference(row: &SqliteRow) -> Result<QueryReference> {
    let content_json: String = row.get("content_json");
    Ok(QueryReference {
        id: row.get("id"),
        engine_id: row.get("engine_id"),
        engine_name: row.get("engine_name"),
        user_id: row.get("user_id"),
        document_id: row.get("document_id"),
        document_url: row.get("document_url"),
        chunk_id: row.get("chunk_id"),
        page: row.get("page"),
        content: serde_json::from_str::<ReferenceContent>(&content_json)
            .context("corrupt content_json on reference")?,
        created_at: from_micros(row.get("created_at")),
        deleted_at: opt_from_micros(row.get("deleted_at")),
    })
}

#[async_trait]
impl RecordStore for SqliteRecordStore {
    async fn save_engine(&self, engine: &QueryEngine) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO query_engines (id, name, engine_type, description, embedding_type,
                llm_type, vector_store, is_public, doc_url, created_by, parent_engine_id,
                params_json, index_id, endpoint, deployed_index_name, created_at, deleted_at)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            ON CONFLICT(id) DO UPDATE SET
                name = excluded.name,
                engine_type = excluded.engine_type,
                description = excluded.description,
                embedding_type = excluded.embedding_type,
                llm_type = excluded.llm_type,
                vector_store = excluded.vector_store,
                is_public = excluded.is_public,
                doc_url = excluded.doc_url,
                parent_engine_id = excluded.parent_engine_id,
                params_json = excluded.params_json,
                index_id = excluded.index_id,
                endpoint = excluded.endpoint,
                deployed_index_name = excluded.deployed_index_name,
                deleted_at = excluded.deleted_at
            "#,
        )
        .bind(&engine.id)
        .bind(&engine.name)
        .bind(engine.engine_type.as_str())
        .bind(&engine.description)
        .bind(&engine.embedding_type)
        .bind(&engine.llm_type)
        .bind(&engine.vector_store)
        .bind(engine.is_public as i64)
        .bind(&engine.doc_url)
        .bind(&engine.created_by)
        .bind(&engine.parent_engine_id)
        .bind(serde_json::to_string(&engine.params)?)
        .bind(&engine.index_id)
        .bind(&engine.endpoint)
        .bind(&engine.deployed_index_name)
        .bind(to_micros(engine.created_at))
        .bind(opt_micros(engine.deleted_at))
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn get_engine(&self, id: &str) -> Result<Option<QueryEngine>> {
        let row = sqlx::query(&format!(
            "SELECT {} FROM query_engines WHERE id = ?",
            ENGINE_COLUMNS
        ))
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;
        row.as_ref().map(row_to_engine).transpose()
    }

    async fn find_engine_by_name(&self, name: &str) -> Result<Option<QueryEngine>> {
        let row = sqlx::query(&format!(
            "SELECT {} FROM query_engines WHERE name = ? AND deleted_at IS NULL LIMIT 1",
            ENGINE_COLUMNS
        ))
        .bind(name)
        .fetch_optional(&self.pool)
        .await?;
        row.as_ref().map(row_to_engine).transpose()
    }

    async fn list_engines(&self) -> Result<Vec<QueryEngine>> {
        let rows = sqlx::query(&format!(
            "SELECT {} FROM query_engines WHERE deleted_at IS NULL ORDER BY created_at, name",
            ENGINE_COLUMNS
        ))
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(row_to_engine).collect()
    }

    async fn child_engines(&self, parent_id: &str) -> Result<Vec<QueryEngine>> {
        let rows = sqlx::query(&format!(
            "SELECT {} FROM query_engines WHERE parent_engine_id = ? AND deleted_at IS NULL \
             ORDER BY created_at, name",
            ENGINE_COLUMNS
        ))
        .bind(parent_id)
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(row_to_engine).collect()
    }

    async fn save_document(&self, doc: &QueryDocument) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO query_documents (id, engine_id, doc_url, index_start, index_end,
                created_at, deleted_at)
            VALUES (?, ?, ?, ?, ?, ?, ?)
            ON CONFLICT(id) DO UPDATE SET deleted_at = excluded.deleted_at
            "#,
        )
        .bind(&doc.id)
        .bind(&doc.engine_id)
        .bind(&doc.doc_url)
        .bind(doc.index_start)
        .bind(doc.index_end)
        .bind(to_micros(doc.created_at))
        .bind(opt_micros(doc.deleted_at))
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn get_document(&self, id: &str) -> Result<Option<QueryDocument>> {
        let row = sqlx::query("SELECT * FROM query_documents WHERE id = ? AND deleted_at IS NULL")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        Ok(row.as_ref().map(row_to_document))
    }

    async fn documents_for_engine(&self, engine_id: &str) -> Result<Vec<QueryDocument>> {
        let rows = sqlx::query(
            "SELECT * FROM query_documents WHERE engine_id = ? AND deleted_at IS NULL \
             ORDER BY index_start",
        )
        .bind(engine_id)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows.iter().map(row_to_document).collect())
    }

    async fn save_chunks(&self, chunks: &[QueryDocumentChunk]) -> Result<()> {
        let mut tx = self.pool.begin().await?;
        for chunk in chunks {
            sqlx::query(
                r#"
                INSERT INTO query_document_chunks (id, engine_id, document_id, chunk_index,
                    page, modality, content_json, created_at, deleted_at)
                VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?)
                ON CONFLICT(id) DO UPDATE SET deleted_at = excluded.deleted_at
                "#,
            )
            .bind(&chunk.id)
            .bind(&chunk.engine_id)
            .bind(&chunk.document_id)
            .bind(chunk.index)
            .bind(chunk.page)
            .bind(chunk.modality().as_str())
            .bind(serde_json::to_string(&chunk.content)?)
            .bind(to_micros(chunk.created_at))
            .bind(opt_micros(chunk.deleted_at))
            .execute(&mut *tx)
            .await?;
        }
        tx.commit().await?;
        Ok(())
    }

    async fn get_chunk(&self, id: &str) -> Result<Option<QueryDocumentChunk>> {
        let row = sqlx::query(
            "SELECT * FROM query_document_chunks WHERE id = ? AND deleted_at IS NULL",
        )
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;
        row.as_ref().map(row_to_chunk).transpose()
    }

    async fn find_chunk_by_index(
        &self,
        engine_id: &str,
        index: i64,
    ) -> Result<Option<QueryDocumentChunk>> {
        let row = sqlx::query(
            "SELECT * FROM query_document_chunks \
             WHERE engine_id = ? AND chunk_index = ? AND deleted_at IS NULL LIMIT 1",
        )
        .bind(engine_id)
        .bind(index)
        .fetch_optional(&self.pool)
        .await?;
        row.as_ref().map(row_to_chunk).transpose()
    }

    async fn chunks_for_engine(&self, engine_id: &str) -> Result<Vec<QueryDocumentChunk>> {
        let rows = sqlx::query(
            "SELECT * FROM query_document_chunks WHERE engine_id = ? AND deleted_at IS NULL \
             ORDER BY chunk_index",
        )
        .bind(engine_id)
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(row_to_chunk).collect()
    }

    async fn save_reference(&self, reference: &QueryReference) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO query_references (id, engine_id, engine_name, user_id, document_id,
                document_url, chunk_id, page, modality, content_json, created_at, deleted_at)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            ON CONFLICT(id) DO UPDATE SET
                content_json = excluded.content_json,
                deleted_at = excluded.deleted_at
            "#,
        )
        .bind(&reference.id)
        .bind(&reference.engine_id)
        .bind(&reference.engine_name)
        .bind(&reference.user_id)
        .bind(&reference.document_id)
        .bind(&reference.document_url)
        .bind(&reference.chunk_id)
        .bind(reference.page)
        .bind(reference.content.modality().as_str())
        .bind(serde_json::to_string(&reference.content)?)
        .bind(to_micros(reference.created_at))
        .bind(opt_micros(reference.deleted_at))
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn get_reference(&self, id: &str) -> Result<Option<QueryReference>> {
        let row = sqlx::query("SELECT * FROM query_references WHERE id = ? AND deleted_at IS NULL")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        row.as_ref().map(row_to_reference).transpose()
    }

    async fn save_query_result(&self, result: &QueryResult) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO query_results (id, engine_id, user_id, prompt, response,
                reference_ids_json, created_at, deleted_at)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?)
            ON CONFLICT(id) DO UPDATE SET
                response = excluded.response,
                reference_ids_json = excluded.reference_ids_json,
                deleted_at = excluded.deleted_at
            "#,
        )
        .bind(&result.id)
        .bind(&result.engine_id)
        .bind(&result.user_id)
        .bind(&result.prompt)
        .bind(&result.response)
        .bind(serde_json::to_string(&result.reference_ids)?)
        .bind(to_micros(result.created_at))
        .bind(opt_micros(result.deleted_at))
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn get_query_result(&self, id: &str) -> Result<Option<QueryResult>> {
        let row = sqlx::query("SELECT * FROM query_results WHERE id = ? AND deleted_at IS NULL")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        let Some(row) = row else {
            return Ok(None);
        };
        let ids_json: String = row.get("reference_ids_json");
        Ok(Some(QueryResult {
            id: row.get("id"),
            engine_id: row.get("engine_id"),
            user_id: row.get("user_id"),
            prompt: row.get("prompt"),
            response: row.get("response"),
            reference_ids: serde_json::from_str(&ids_json)
                .context("corrupt reference_ids_json on query result")?,
            created_at: from_micros(row.get("created_at")),
            deleted_at: opt_from_micros(row.get("deleted_at")),
        }))
    }

    async fn save_user_query(&self, query: &UserQuery) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO user_queries (id, user_id, engine_id, prompt, history_json,
                created_at, updated_at, deleted_at)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?)
            ON CONFLICT(id) DO UPDATE SET
                history_json = excluded.history_json,
                updated_at = excluded.updated_at,
                deleted_at = excluded.deleted_at
            "#,
        )
        .bind(&query.id)
        .bind(&query.user_id)
        .bind(&query.engine_id)
        .bind(&query.prompt)
        .bind(serde_json::to_string(&query.history)?)
        .bind(to_micros(query.created_at))
        .bind(to_micros(query.updated_at))
        .bind(opt_micros(query.deleted_at))
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn get_user_query(&self, id: &str) -> Result<Option<UserQuery>> {
        let row = sqlx::query("SELECT * FROM user_queries WHERE id = ? AND deleted_at IS NULL")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        let Some(row) = row else {
            return Ok(None);
        };
        let history_json: String = row.get("history_json");
        Ok(Some(UserQuery {
            id: row.get("id"),
            user_id: row.get("user_id"),
            engine_id: row.get("engine_id"),
            prompt: row.get("prompt"),
            history: serde_json::from_str::<Vec<HistoryEntry>>(&history_json)
                .context("corrupt history_json on user query")?,
            created_at: from_micros(row.get("created_at")),
            updated_at: from_micros(row.get("updated_at")),
            deleted_at: opt_from_micros(row.get("deleted_at")),
        }))
    }

    async fn delete_engine(&self, engine_id: &str, mode: DeleteMode) -> Result<()> {
        let owned_tables = [
            "query_documents",
            "query_document_chunks",
            "query_references",
            "query_results",
        ];
        let mut tx = self.pool.begin().await?;
        match mode {
            DeleteMode::Hard => {
                for table in owned_tables {
                    sqlx::query(&format!("DELETE FROM {} WHERE engine_id = ?", table))
                        .bind(engine_id)
                        .execute(&mut *tx)
                        .await?;
                }
                sqlx::query("DELETE FROM query_engines WHERE id = ?")
                    .bind(engine_id)
                    .execute(&mut *tx)
                    .await?;
            }
            DeleteMode::Soft => {
                let now = to_micros(Utc::now());
                for table in owned_tables {
                    sqlx::query(&format!(
                        "UPDATE {} SET deleted_at = ? WHERE engine_id = ? AND deleted_at IS NULL",
                        table
                    ))
                    .bind(now)
                    .bind(engine_id)
                    .execute(&mut *tx)
                    .await?;
                }
                sqlx::query("UPDATE query_engines SET deleted_at = ? WHERE id = ?")
                    .bind(now)
                    .bind(engine_id)
                    .execute(&mut *tx)
                    .await?;
            }
        }
        tx.commit().await?;
        Ok(())
    }
}
