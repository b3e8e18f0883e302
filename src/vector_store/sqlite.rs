//! Relational vector store on the record database.
//!
//! Vectors are little-endian f32 blobs keyed by `(engine_id, idx)`, next to
//! the document metadata they were indexed with. Search narrows rows with a
//! SQL `WHERE` compiled from the filter tree (over `json_extract` of the
//! metadata column), then ranks the survivors by cosine similarity in
//! process.
//!
//! Writes use `INSERT OR REPLACE`, so re-indexing a slot overwrites it.

use anyhow::{bail, Result};
use async_trait::async_trait;
use rag_harness_core::embedding::{blob_to_vec, cosine_similarity, vec_to_blob, Embedder};
use rag_harness_core::filter::{Bound, FilterExpr};
use rag_harness_core::models::Modality;
use serde_json::{Map, Value};
use sqlx::{Row, SqlitePool};
use std::sync::Arc;

use super::{embed_chunks, embed_image_chunks, DeployedIndex, StoreContext, VectorStore, SQLITE_VECTOR};
use crate::data_source::MultimodalChunk;

/// Create the vectors table. Idempotent.
pub async fn create_table(pool: &SqlitePool) -> Result<()> {
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS engine_vectors (
            engine_id TEXT NOT NULL,
            idx INTEGER NOT NULL,
            modality TEXT NOT NULL,
            embedding BLOB NOT NULL,
            metadata_json TEXT NOT NULL DEFAULT '{}',
            PRIMARY KEY (engine_id, idx)
        )
        "#,
    )
    .execute(pool)
    .await?;
    Ok(())
}

pub struct SqliteVectorStore {
    pool: SqlitePool,
    engine_id: String,
    embedder: Arc<dyn Embedder>,
    batch_size: usize,
    num_matches: usize,
}

impl SqliteVectorStore {
    pub fn new(
        pool: SqlitePool,
        engine_id: &str,
        embedder: Arc<dyn Embedder>,
        batch_size: usize,
        num_matches: usize,
    ) -> Self {
        Self {
            pool,
            engine_id: engine_id.to_string(),
            embedder,
            batch_size,
            num_matches,
        }
    }

    pub fn for_engine(pool: SqlitePool, ctx: &StoreContext<'_>) -> Self {
        Self::new(
            pool,
            &ctx.engine.id,
            ctx.embedder.clone(),
            ctx.config.embedding.batch_size,
            ctx.config.retrieval.num_matches,
        )
    }

    async fn insert(
        &self,
        vectors: &[Vec<f32>],
        modality: Modality,
        index_base: i64,
        metadata: &Map<String, Value>,
    ) -> Result<()> {
        let metadata_json = serde_json::to_string(metadata)?;
        let mut tx = self.pool.begin().await?;
        for (offset, vector) in vectors.iter().enumerate() {
            sqlx::query(
                "INSERT OR REPLACE INTO engine_vectors (engine_id, idx, modality, embedding, metadata_json) \
                 VALUES (?, ?, ?, ?, ?)",
            )
            .bind(&self.engine_id)
            .bind(index_base + offset as i64)
            .bind(modality.as_str())
            .bind(vec_to_blob(vector))
            .bind(&metadata_json)
            .execute(&mut *tx)
            .await?;
        }
        tx.commit().await?;
        Ok(())
    }

    /// Number of stored vectors for this engine.
    pub async fn count(&self) -> Result<i64> {
        let row = sqlx::query("SELECT COUNT(*) AS n FROM engine_vectors WHERE engine_id = ?")
            .bind(&self.engine_id)
            .fetch_one(&self.pool)
            .await?;
        Ok(row.get("n"))
    }
}

#[async_trait]
impl VectorStore for SqliteVectorStore {
    fn store_type(&self) -> &str {
        SQLITE_VECTOR
    }

    async fn init_index(&self) -> Result<()> {
        create_table(&self.pool).await
    }

    async fn index_document(
        &self,
        doc_name: &str,
        texts: &[String],
        index_base: i64,
        metadata: &Map<String, Value>,
    ) -> Result<i64> {
        let vectors = embed_chunks(self.embedder.as_ref(), doc_name, texts, self.batch_size).await?;
        self.insert(&vectors, Modality::Text, index_base, metadata).await?;
        tracing::debug!(doc = %doc_name, count = vectors.len(), index_base, "stored text vectors");
        Ok(index_base + texts.len() as i64)
    }

    async fn index_document_multi(
        &self,
        doc_name: &str,
        chunks: &[MultimodalChunk],
        index_base: i64,
        metadata: &Map<String, Value>,
    ) -> Result<i64> {
        let vectors = embed_image_chunks(self.embedder.as_ref(), doc_name, chunks).await?;
        self.insert(&vectors, Modality::Image, index_base, metadata).await?;
        tracing::debug!(doc = %doc_name, count = vectors.len(), index_base, "stored image vectors");
        Ok(index_base + chunks.len() as i64)
    }

    async fn deploy(&self) -> Result<Option<DeployedIndex>> {
        Ok(None)
    }

    async fn similarity_search(
        &self,
        embedding: &[f32],
        filter: Option<&FilterExpr>,
    ) -> Result<Vec<i64>> {
        let mut binds = Vec::new();
        let mut sql = String::from("SELECT idx, embedding FROM engine_vectors WHERE engine_id = ?");
        if let Some(filter) = filter {
            sql.push_str(" AND ");
            sql.push_str(&compile_filter(filter, &mut binds)?);
        }

        let mut query = sqlx::query(&sql).bind(&self.engine_id);
        for bind in binds {
            query = match bind {
                SqlValue::Text(s) => query.bind(s),
                SqlValue::Real(v) => query.bind(v),
            };
        }
        let rows = query.fetch_all(&self.pool).await?;

        let mut scored: Vec<(i64, f32)> = rows
            .iter()
            .map(|row| {
                let blob: Vec<u8> = row.get("embedding");
                (row.get("idx"), cosine_similarity(embedding, &blob_to_vec(&blob)))
            })
            .collect();
        scored.sort_by(|a, b| b.1.partial_cmp(&a.1).unwrap_or(std::cmp::Ordering::Equal));
        scored.truncate(self.num_matches);

        Ok(scored.into_iter().map(|(idx, _)| idx).collect())
    }

    async fn delete(&self) -> Result<()> {
        let result = sqlx::query("DELETE FROM engine_vectors WHERE engine_id = ?")
            .bind(&self.engine_id)
            .execute(&self.pool)
            .await?;
        tracing::info!(engine_id = %self.engine_id, rows = result.rows_affected(), "deleted vectors");
        Ok(())
    }
}

// ============ Filter compilation ============

#[derive(Debug, Clone, PartialEq)]
enum SqlValue {
    Text(String),
    Real(f64),
}

fn json_path(field: &str) -> Result<String> {
    if field.contains('"') {
        bail!("invalid metadata field name: {}", field);
    }
    Ok(format!("$.\"{}\"", field))
}

/// Compile a filter to a boolean SQL expression over `metadata_json`.
fn compile_filter(expr: &FilterExpr, binds: &mut Vec<SqlValue>) -> Result<String> {
    let sql = match expr {
        FilterExpr::AnyOf { field, values } => {
            binds.push(SqlValue::Text(json_path(field)?));
            let placeholders = vec!["?"; values.len()].join(", ");
            binds.extend(values.iter().cloned().map(SqlValue::Text));
            // json_each yields one row for a scalar and one per element for an array.
            format!(
                "EXISTS (SELECT 1 FROM json_each(engine_vectors.metadata_json, ?) AS m WHERE m.value IN ({}))",
                placeholders
            )
        }
        FilterExpr::Compare { field, op, value } => {
            binds.push(SqlValue::Text(json_path(field)?));
            binds.push(SqlValue::Real(*value));
            format!("CAST(json_extract(metadata_json, ?) AS REAL) {} ?", op.as_str())
        }
        FilterExpr::Range {
            field,
            lower,
            upper,
        } => {
            let mut parts = Vec::new();
            let mut bound = |b: &Bound, inclusive_op: &str, exclusive_op: &str| -> Result<()> {
                binds.push(SqlValue::Text(json_path(field)?));
                binds.push(SqlValue::Real(b.value));
                let op = if b.inclusive { inclusive_op } else { exclusive_op };
                parts.push(format!("CAST(json_extract(metadata_json, ?) AS REAL) {} ?", op));
                Ok(())
            };
            if let Some(b) = lower {
                bound(b, ">=", ">")?;
            }
            if let Some(b) = upper {
                bound(b, "<=", "<")?;
            }
            if parts.is_empty() {
                binds.push(SqlValue::Text(json_path(field)?));
                "json_extract(metadata_json, ?) IS NOT NULL".to_string()
            } else {
                format!("({})", parts.join(" AND "))
            }
        }
        FilterExpr::Not(inner) => format!("NOT COALESCE({}, 0)", compile_filter(inner, binds)?),
        FilterExpr::And(clauses) => join_clauses(clauses, " AND ", "1", binds)?,
        FilterExpr::Or(clauses) => join_clauses(clauses, " OR ", "0", binds)?,
    };
    Ok(format!("({})", sql))
}

fn join_clauses(
    clauses: &[FilterExpr],
    sep: &str,
    empty: &str,
    binds: &mut Vec<SqlValue>,
) -> Result<String> {
    if clauses.is_empty() {
        return Ok(empty.to_string());
    }
    let parts = clauses
        .iter()
        .map(|c| compile_filter(c, binds))
        .collect::<Result<Vec<_>>>()?;
    Ok(parts.join(sep))
}

#[cfg(test)]
mod tests {
    use super::super::testing::KeywordEmbedder;
    use super::*;
    use rag_harness_core::filter::parse_filter;
    use serde_json::json;

    async fn pool(dir: &tempfile::TempDir) -> SqlitePool {
        let config = crate::config::Config::for_root(dir.path());
        let pool = crate::db::connect(&config).await.unwrap();
        create_table(&pool).await.unwrap();
        pool
    }

    fn store(pool: &SqlitePool, engine_id: &str) -> SqliteVectorStore {
        let embedder = Arc::new(KeywordEmbedder::new(&["rust", "python", "cooking"]));
        SqliteVectorStore::new(pool.clone(), engine_id, embedder, 2, 5)
    }

    fn texts(items: &[&str]) -> Vec<String> {
        items.iter().map(|s| s.to_string()).collect()
    }

    fn meta(value: Value) -> Map<String, Value> {
        value.as_object().cloned().unwrap_or_default()
    }

    #[tokio::test]
    async fn test_index_returns_next_base_and_search_ranks() {
        let dir = tempfile::tempdir().unwrap();
        let pool = pool(&dir).await;
        let vs = store(&pool, "e1");

        let next = vs
            .index_document("a.txt", &texts(&["rust ownership", "python typing"]), 0, &Map::new())
            .await
            .unwrap();
        assert_eq!(next, 2);
        let next = vs
            .index_document("b.txt", &texts(&["cooking pasta"]), next, &Map::new())
            .await
            .unwrap();
        assert_eq!(next, 3);

        let query = KeywordEmbedder::new(&["rust", "python", "cooking"]).vector("cooking tips");
        let hits = vs.similarity_search(&query, None).await.unwrap();
        assert_eq!(hits[0], 2);
        assert_eq!(hits.len(), 3);
    }

    #[tokio::test]
    async fn test_reindexing_same_slots_does_not_duplicate() {
        let dir = tempfile::tempdir().unwrap();
        let pool = pool(&dir).await;
        let vs = store(&pool, "e1");
        let chunks = texts(&["rust", "python"]);

        vs.index_document("a.txt", &chunks, 0, &Map::new()).await.unwrap();
        vs.deploy().await.unwrap();
        vs.index_document("a.txt", &chunks, 0, &Map::new()).await.unwrap();
        vs.deploy().await.unwrap();
        assert_eq!(vs.count().await.unwrap(), 2);
    }

    #[tokio::test]
    async fn test_filter_narrows_results() {
        let dir = tempfile::tempdir().unwrap();
        let pool = pool(&dir).await;
        let vs = store(&pool, "e1");

        vs.index_document("old.txt", &texts(&["rust old"]), 0, &meta(json!({"genre": "drama", "year": 1990})))
            .await
            .unwrap();
        vs.index_document("new.txt", &texts(&["rust new"]), 1, &meta(json!({"genre": ["comedy", "drama"], "year": 2010})))
            .await
            .unwrap();
        vs.index_document("none.txt", &texts(&["rust bare"]), 2, &Map::new())
            .await
            .unwrap();

        let query = vec![1.0, 0.0, 0.0, 0.01];

        let filter = parse_filter(r#"genre:ANY("comedy","drama") AND year > 2000"#).unwrap();
        assert_eq!(vs.similarity_search(&query, Some(&filter)).await.unwrap(), vec![1]);

        let filter = parse_filter(r#"genre:ANY("drama")"#).unwrap();
        let mut hits = vs.similarity_search(&query, Some(&filter)).await.unwrap();
        hits.sort();
        assert_eq!(hits, vec![0, 1]);

        let filter = parse_filter("year:IN(1990i, 2010e)").unwrap();
        assert_eq!(vs.similarity_search(&query, Some(&filter)).await.unwrap(), vec![0]);

        let filter = parse_filter(r#"NOT genre:ANY("comedy")"#).unwrap();
        let mut hits = vs.similarity_search(&query, Some(&filter)).await.unwrap();
        hits.sort();
        assert_eq!(hits, vec![0, 2]);
    }

    #[tokio::test]
    async fn test_engines_are_isolated_and_delete_is_scoped() {
        let dir = tempfile::tempdir().unwrap();
        let pool = pool(&dir).await;
        let a = store(&pool, "a");
        let b = store(&pool, "b");
        a.index_document("a.txt", &texts(&["rust"]), 0, &Map::new()).await.unwrap();
        b.index_document("b.txt", &texts(&["python"]), 0, &Map::new()).await.unwrap();

        a.delete().await.unwrap();
        assert_eq!(a.count().await.unwrap(), 0);
        assert_eq!(b.count().await.unwrap(), 1);
        // Nothing left to delete is not an error.
        a.delete().await.unwrap();
    }

    #[test]
    fn test_compile_rejects_quoted_field() {
        let expr = FilterExpr::Compare {
            field: "a\"b".to_string(),
            op: rag_harness_core::filter::CompareOp::Gt,
            value: 1.0,
        };
        assert!(compile_filter(&expr, &mut Vec::new()).is_err());
    }

    #[test]
    fn test_compile_binds_in_order() {
        let expr = parse_filter(r#"genre:ANY("a","b") OR year <= 3"#).unwrap();
        let mut binds = Vec::new();
        let sql = compile_filter(&expr, &mut binds).unwrap();
        assert_eq!(sql.matches('?').count(), binds.len());
        assert_eq!(
            binds,
            vec![
                SqlValue::Text("$.\"genre\"".to_string()),
                SqlValue::Text("a".to_string()),
                SqlValue::Text("b".to_string()),
                SqlValue::Text("$.\"year\"".to_string()),
                SqlValue::Real(3.0),
            ]
        );
        assert!(sql.contains(" OR "));
    }
}
