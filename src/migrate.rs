//! Schema for the record store.
//!
//! Every statement is idempotent, so `qe init` can run any number of times.
//! Timestamps are Unix microseconds; structured payloads (build params,
//! chunk content, history) are JSON text columns.

use anyhow::Result;
use sqlx::SqlitePool;

use crate::config::Config;
use crate::db;

pub async fn run_migrations(config: &Config) -> Result<()> {
    let pool = db::connect(config).await?;
    apply(&pool).await?;
    pool.close().await;
    Ok(())
}

/// Create all tables and indexes on an open pool.
pub async fn apply(pool: &SqlitePool) -> Result<()> {
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS query_engines (
            id TEXT PRIMARY KEY,
            name TEXT NOT NULL,
            engine_type TEXT NOT NULL,
            description TEXT NOT NULL DEFAULT '',
            embedding_type TEXT NOT NULL,
            llm_type TEXT NOT NULL,
            vector_store TEXT,
            is_public INTEGER NOT NULL DEFAULT 0,
            doc_url TEXT,
            created_by TEXT NOT NULL,
            parent_engine_id TEXT,
            params_json TEXT NOT NULL DEFAULT '{}',
            index_id TEXT,
            endpoint TEXT,
            deployed_index_name TEXT,
            created_at INTEGER NOT NULL,
            deleted_at INTEGER
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS query_documents (
            id TEXT PRIMARY KEY,
            engine_id TEXT NOT NULL,
            doc_url TEXT NOT NULL,
            index_start INTEGER NOT NULL,
            index_end INTEGER NOT NULL,
            created_at INTEGER NOT NULL,
            deleted_at INTEGER
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS query_document_chunks (
            id TEXT PRIMARY KEY,
            engine_id TEXT NOT NULL,
            document_id TEXT NOT NULL,
            chunk_index INTEGER NOT NULL,
            page INTEGER,
            modality TEXT NOT NULL,
            content_json TEXT NOT NULL,
            created_at INTEGER NOT NULL,
            deleted_at INTEGER
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS query_references (
            id TEXT PRIMARY KEY,
            engine_id TEXT NOT NULL,
            engine_name TEXT NOT NULL,
            user_id TEXT NOT NULL,
            document_id TEXT,
            document_url TEXT NOT NULL,
            chunk_id TEXT,
            page INTEGER,
            modality TEXT NOT NULL,
            content_json TEXT NOT NULL,
            created_at INTEGER NOT NULL,
            deleted_at INTEGER
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS query_results (
            id TEXT PRIMARY KEY,
            engine_id TEXT NOT NULL,
            user_id TEXT NOT NULL,
            prompt TEXT NOT NULL,
            response TEXT NOT NULL,
            reference_ids_json TEXT NOT NULL DEFAULT '[]',
            created_at INTEGER NOT NULL,
            deleted_at INTEGER
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS user_queries (
            id TEXT PRIMARY KEY,
            user_id TEXT NOT NULL,
            engine_id TEXT NOT NULL,
            prompt TEXT NOT NULL,
            history_json TEXT NOT NULL DEFAULT '[]',
            created_at INTEGER NOT NULL,
            updated_at INTEGER NOT NULL,
            deleted_at INTEGER
        )
        "#,
    )
    .execute(pool)
    .await?;

    for stmt in [
        "CREATE INDEX IF NOT EXISTS idx_engines_name ON query_engines(name)",
        "CREATE INDEX IF NOT EXISTS idx_engines_parent ON query_engines(parent_engine_id)",
        "CREATE INDEX IF NOT EXISTS idx_documents_engine ON query_documents(engine_id, index_start)",
        "CREATE INDEX IF NOT EXISTS idx_chunks_engine_index ON query_document_chunks(engine_id, chunk_index)",
        "CREATE INDEX IF NOT EXISTS idx_references_engine ON query_references(engine_id)",
        "CREATE INDEX IF NOT EXISTS idx_results_engine ON query_results(engine_id)",
    ] {
        sqlx::query(stmt).execute(pool).await?;
    }

    crate::vector_store::sqlite::create_table(pool).await?;

    Ok(())
}
