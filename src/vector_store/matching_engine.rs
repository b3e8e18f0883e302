//! Vector store backed by the managed ANN index service.
//!
//! Indexing writes JSONL datapoint files into the engine's data bucket
//! (`{project}-{engine}-data`), one file per embedding batch named
//! `{doc_stem}_{index_base}_index.json`:
//!
//! ```json
//! {"id": "12", "embedding": ["0.013", "-0.2", ...], "restricts": [...], "numeric_restricts": [...]}
//! ```
//!
//! Document metadata becomes datapoint restricts: string and string-list
//! values are token namespaces, numbers are numeric namespaces.
//!
//! `deploy` builds a tree-AH index over the bucket, creates a public
//! endpoint, and deploys the index to it. Handles already recorded on the
//! engine are reused, so a retried deploy does not create a second index.

use std::path::Path;
use std::sync::{Arc, Mutex};

use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use rag_harness_core::embedding::Embedder;
use rag_harness_core::filter::{CompareOp, FilterExpr};
use rag_harness_core::Error;
use serde_json::{json, Map, Value};

use super::ann_service::{
    AnnIndexService, AnnIndexSpec, NeighborRestricts, NumericRestrict, TokenRestrict,
};
use super::{
    embed_chunks, embed_image_chunks, DeployedIndex, StoreContext, VectorStore, MATCHING_ENGINE,
    MAX_CHUNKS_PER_CALL,
};
use crate::config::VectorStoreConfig;
use crate::data_source::MultimodalChunk;
use crate::storage::{data_bucket_name, slug, ObjectStorage};

/// Deployed-index id for an engine: letters, digits, and underscores only,
/// starting with a letter.
pub fn deployed_index_id(engine_name: &str) -> String {
    let id: String = slug(engine_name)
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() { c } else { '_' })
        .collect();
    format!("qe_{}", id)
}

#[derive(Debug, Clone, Default)]
struct Handles {
    index_id: Option<String>,
    endpoint: Option<String>,
}

pub struct MatchingEngineVectorStore {
    storage: Arc<dyn ObjectStorage>,
    ann: Arc<dyn AnnIndexService>,
    embedder: Arc<dyn Embedder>,
    bucket: String,
    index_name: String,
    description: String,
    deployed_index_name: String,
    settings: VectorStoreConfig,
    batch_size: usize,
    num_matches: usize,
    handles: Mutex<Handles>,
}

impl MatchingEngineVectorStore {
    pub fn for_engine(
        storage: Arc<dyn ObjectStorage>,
        ann: Arc<dyn AnnIndexService>,
        ctx: &StoreContext<'_>,
    ) -> Result<Self> {
        let engine = ctx.engine;
        Ok(Self {
            storage,
            ann,
            embedder: ctx.embedder.clone(),
            bucket: data_bucket_name(&ctx.config.project.id, &engine.name)?,
            index_name: format!("{}_MEindex", slug(&engine.name)),
            description: format!("ANN index for query engine: {}", engine.name),
            deployed_index_name: engine
                .deployed_index_name
                .clone()
                .unwrap_or_else(|| deployed_index_id(&engine.name)),
            settings: ctx.config.vector_store.clone(),
            batch_size: ctx.config.embedding.batch_size,
            num_matches: ctx.config.retrieval.num_matches,
            handles: Mutex::new(Handles {
                index_id: engine.index_id.clone(),
                endpoint: engine.endpoint.clone(),
            }),
        })
    }

    pub fn bucket(&self) -> &str {
        &self.bucket
    }

    fn handles(&self) -> Result<Handles> {
        self.handles
            .lock()
            .map(|h| h.clone())
            .map_err(|_| anyhow!("index handles lock poisoned"))
    }

    fn set_handles(&self, handles: Handles) -> Result<()> {
        let mut guard = self
            .handles
            .lock()
            .map_err(|_| anyhow!("index handles lock poisoned"))?;
        *guard = handles;
        Ok(())
    }

    async fn write_datapoints(
        &self,
        doc_name: &str,
        vectors: &[Vec<f32>],
        index_base: i64,
        metadata: &Map<String, Value>,
    ) -> Result<String> {
        let mut body = String::new();
        for (offset, vector) in vectors.iter().enumerate() {
            body.push_str(&datapoint_line(index_base + offset as i64, vector, metadata)?);
            body.push('\n');
        }
        let stem = Path::new(doc_name)
            .file_stem()
            .and_then(|s| s.to_str())
            .unwrap_or(doc_name);
        let object = format!("{}_{}_index.json", stem, index_base);
        self.storage
            .write(&self.bucket, &object, body.into_bytes())
            .await
            .with_context(|| format!("writing index data for {}", doc_name))?;
        tracing::info!(doc = %doc_name, object = %object, count = vectors.len(), "wrote index data file");
        Ok(object)
    }

    /// Best-effort removal of data files a failed document already wrote.
    async fn remove_objects(&self, doc_name: &str, objects: &[String]) {
        for object in objects {
            match self.storage.delete_object(&self.bucket, object).await {
                Ok(()) => tracing::info!(doc = %doc_name, object = %object, "removed partial index data file"),
                Err(e) => tracing::error!(doc = %doc_name, object = %object, error = %e, "could not remove partial index data file"),
            }
        }
    }
}

/// One JSONL datapoint.
pub fn datapoint_line(id: i64, vector: &[f32], metadata: &Map<String, Value>) -> Result<String> {
    let mut point = json!({
        "id": id.to_string(),
        "embedding": vector.iter().map(|v| v.to_string()).collect::<Vec<_>>(),
    });
    let mut restricts = Vec::new();
    let mut numeric = Vec::new();
    for (key, value) in metadata {
        match value {
            Value::String(s) => restricts.push(json!({"namespace": key, "allow": [s]})),
            Value::Array(items) => {
                let allow: Vec<&str> = items.iter().filter_map(Value::as_str).collect();
                if !allow.is_empty() {
                    restricts.push(json!({"namespace": key, "allow": allow}));
                }
            }
            Value::Number(n) => {
                if let Some(f) = n.as_f64() {
                    numeric.push(json!({"namespace": key, "value_double": f}));
                }
            }
            _ => {}
        }
    }
    if !restricts.is_empty() {
        point["restricts"] = Value::Array(restricts);
    }
    if !numeric.is_empty() {
        point["numeric_restricts"] = Value::Array(numeric);
    }
    Ok(serde_json::to_string(&point)?)
}

/// Translate a filter into query restricts.
///
/// The service intersects restricts, so only conjunctions of membership,
/// comparison, and range clauses (each optionally negated) translate.
pub fn filter_to_restricts(expr: &FilterExpr) -> Result<NeighborRestricts, Error> {
    let mut out = NeighborRestricts::default();
    add_clause(expr, false, &mut out)?;
    Ok(out)
}

fn add_clause(expr: &FilterExpr, negated: bool, out: &mut NeighborRestricts) -> Result<(), Error> {
    match expr {
        FilterExpr::And(clauses) if !negated => {
            for clause in clauses {
                add_clause(clause, false, out)?;
            }
        }
        FilterExpr::Not(inner) => add_clause(inner, !negated, out)?,
        FilterExpr::AnyOf { field, values } => {
            let mut restrict = TokenRestrict {
                namespace: field.clone(),
                ..TokenRestrict::default()
            };
            if negated {
                restrict.deny = values.clone();
            } else {
                restrict.allow = values.clone();
            }
            out.tokens.push(restrict);
        }
        FilterExpr::Compare { field, op, value } => out.numeric.push(NumericRestrict {
            namespace: field.clone(),
            value: *value,
            op: numeric_op(*op, negated),
        }),
        FilterExpr::Range {
            field,
            lower,
            upper,
        } if !negated => {
            if let Some(b) = lower {
                let op = if b.inclusive { CompareOp::Ge } else { CompareOp::Gt };
                out.numeric.push(NumericRestrict {
                    namespace: field.clone(),
                    value: b.value,
                    op: numeric_op(op, false),
                });
            }
            if let Some(b) = upper {
                let op = if b.inclusive { CompareOp::Le } else { CompareOp::Lt };
                out.numeric.push(NumericRestrict {
                    namespace: field.clone(),
                    value: b.value,
                    op: numeric_op(op, false),
                });
            }
        }
        _ => {
            return Err(Error::Validation(
                "the matching_engine store supports only AND-combined ANY, comparison, and IN filters"
                    .to_string(),
            ))
        }
    }
    Ok(())
}

fn numeric_op(op: CompareOp, negated: bool) -> &'static str {
    match (op, negated) {
        (CompareOp::Lt, false) | (CompareOp::Ge, true) => "LESS",
        (CompareOp::Le, false) | (CompareOp::Gt, true) => "LESS_EQUAL",
        (CompareOp::Eq, false) => "EQUAL",
        (CompareOp::Eq, true) => "NOT_EQUAL",
        (CompareOp::Ge, false) | (CompareOp::Lt, true) => "GREATER_EQUAL",
        (CompareOp::Gt, false) | (CompareOp::Le, true) => "GREATER",
    }
}

#[async_trait]
impl VectorStore for MatchingEngineVectorStore {
    fn store_type(&self) -> &str {
        MATCHING_ENGINE
    }

    async fn init_index(&self) -> Result<()> {
        self.storage.create_bucket(&self.bucket, true).await
    }

    async fn index_document(
        &self,
        doc_name: &str,
        texts: &[String],
        index_base: i64,
        metadata: &Map<String, Value>,
    ) -> Result<i64> {
        if texts.is_empty() {
            anyhow::bail!("failed to generate embeddings for {}", doc_name);
        }
        // A document's slots are either all written or none are, so the
        // next document can reuse `index_base` after a failure.
        let mut vectors = Vec::with_capacity(texts.len());
        for (n, batch) in texts.chunks(MAX_CHUNKS_PER_CALL).enumerate() {
            tracing::info!(
                doc = %doc_name,
                batch = n,
                size = batch.len(),
                remaining = texts.len() - n * MAX_CHUNKS_PER_CALL,
                "embedding chunks"
            );
            vectors.extend(embed_chunks(self.embedder.as_ref(), doc_name, batch, self.batch_size).await?);
        }

        let mut written = Vec::new();
        let mut base = index_base;
        for batch in vectors.chunks(MAX_CHUNKS_PER_CALL) {
            match self.write_datapoints(doc_name, batch, base, metadata).await {
                Ok(object) => written.push(object),
                Err(e) => {
                    self.remove_objects(doc_name, &written).await;
                    return Err(e);
                }
            }
            base += batch.len() as i64;
        }
        Ok(base)
    }

    async fn index_document_multi(
        &self,
        doc_name: &str,
        chunks: &[MultimodalChunk],
        index_base: i64,
        metadata: &Map<String, Value>,
    ) -> Result<i64> {
        let vectors = embed_image_chunks(self.embedder.as_ref(), doc_name, chunks).await?;
        self.write_datapoints(doc_name, &vectors, index_base, metadata).await?;
        Ok(index_base + chunks.len() as i64)
    }

    async fn deploy(&self) -> Result<Option<DeployedIndex>> {
        let mut handles = self.handles()?;

        let index_id = match handles.index_id.clone() {
            Some(id) => id,
            None => {
                tracing::info!(index = %self.index_name, "creating ANN index");
                let index_spec = AnnIndexSpec {
                    display_name: self.index_name.clone(),
                    description: self.description.clone(),
                    contents_uri: format!("gs://{}", self.bucket),
                    dimensions: self.settings.dimensions,
                    approximate_neighbors: self.settings.approximate_neighbors,
                    distance_measure: "DOT_PRODUCT_DISTANCE".to_string(),
                    leaf_node_embedding_count: self.settings.leaf_node_embedding_count,
                    leaf_nodes_to_search_percent: self.settings.leaf_nodes_to_search_percent,
                };
                let id = self.ann.create_index(&index_spec).await?;
                handles.index_id = Some(id.clone());
                self.set_handles(handles.clone())?;
                id
            }
        };

        let endpoint = match handles.endpoint.clone() {
            Some(endpoint) => endpoint,
            None => {
                let endpoint = self
                    .ann
                    .create_endpoint(&self.index_name, &self.index_name)
                    .await?;
                tracing::info!(index = %self.index_name, endpoint = %endpoint, "created index endpoint");
                handles.endpoint = Some(endpoint.clone());
                self.set_handles(handles)?;
                endpoint
            }
        };

        // Deploying often outlives the client deadline while still succeeding
        // server side; the handles are returned either way.
        match self
            .ann
            .deploy_index(&endpoint, &index_id, &self.deployed_index_name)
            .await
        {
            Ok(()) => tracing::info!(index = %self.index_name, "deployed ANN index"),
            Err(e) => tracing::error!(index = %self.index_name, error = %e, "error deploying ANN index"),
        }

        Ok(Some(DeployedIndex {
            index_id,
            endpoint,
            deployed_index_name: self.deployed_index_name.clone(),
        }))
    }

    async fn similarity_search(
        &self,
        embedding: &[f32],
        filter: Option<&FilterExpr>,
    ) -> Result<Vec<i64>> {
        let endpoint = self
            .handles()?
            .endpoint
            .ok_or_else(|| anyhow!("index {} has not been deployed", self.index_name))?;
        let restricts = match filter {
            Some(expr) => filter_to_restricts(expr)?,
            None => NeighborRestricts::default(),
        };

        let ids = self
            .ann
            .find_neighbors(
                &endpoint,
                &self.deployed_index_name,
                embedding,
                self.num_matches,
                &restricts,
            )
            .await?;
        ids.iter()
            .map(|id| {
                id.parse::<i64>()
                    .with_context(|| format!("non-numeric datapoint id {}", id))
            })
            .collect()
    }

    async fn delete(&self) -> Result<()> {
        let handles = self.handles()?;
        tracing::info!(index = %self.index_name, "deleting ANN index");
        if let Some(endpoint) = &handles.endpoint {
            self.ann.delete_endpoint(endpoint).await?;
        }
        if let Some(index_id) = &handles.index_id {
            self.ann.delete_index(index_id).await?;
        }
        self.set_handles(Handles::default())
    }
}

#[cfg(test)]
mod tests {
    use super::super::testing::KeywordEmbedder;
    use super::*;
    use crate::config::Config;
    use crate::storage::LocalStorage;
    use rag_harness_core::filter::parse_filter;
    use rag_harness_core::models::{QueryEngine, QueryEngineType};

    /// Records calls; deploy_index fails to mimic a client-side timeout.
    #[derive(Default)]
    struct FakeAnn {
        calls: Mutex<Vec<String>>,
    }

    impl FakeAnn {
        fn calls(&self) -> Vec<String> {
            self.calls.lock().unwrap().clone()
        }
        fn record(&self, call: String) {
            self.calls.lock().unwrap().push(call);
        }
    }

    #[async_trait]
    impl AnnIndexService for FakeAnn {
        async fn create_index(&self, index: &AnnIndexSpec) -> Result<String> {
            self.record(format!("create_index {} {}", index.contents_uri, index.approximate_neighbors));
            Ok("indexes/1".to_string())
        }
        async fn create_endpoint(&self, _name: &str, _description: &str) -> Result<String> {
            self.record("create_endpoint".to_string());
            Ok("indexEndpoints/2".to_string())
        }
        async fn deploy_index(&self, endpoint: &str, index: &str, id: &str) -> Result<()> {
            self.record(format!("deploy {} {} {}", endpoint, index, id));
            anyhow::bail!("deadline exceeded")
        }
        async fn find_neighbors(
            &self,
            _endpoint: &str,
            _id: &str,
            _query: &[f32],
            k: usize,
            restricts: &NeighborRestricts,
        ) -> Result<Vec<String>> {
            self.record(format!("find k={} tokens={}", k, restricts.tokens.len()));
            Ok(vec!["4".to_string(), "0".to_string()])
        }
        async fn delete_endpoint(&self, endpoint: &str) -> Result<()> {
            self.record(format!("delete_endpoint {}", endpoint));
            Ok(())
        }
        async fn delete_index(&self, index: &str) -> Result<()> {
            self.record(format!("delete_index {}", index));
            Ok(())
        }
    }

    struct Fixture {
        _dir: tempfile::TempDir,
        storage: Arc<LocalStorage>,
        ann: Arc<FakeAnn>,
        store: MatchingEngineVectorStore,
    }

    fn fixture(engine: QueryEngine) -> Fixture {
        let dir = tempfile::tempdir().unwrap();
        let config = Config::for_root(dir.path());
        let storage = Arc::new(LocalStorage::new(dir.path().join("buckets")));
        let ann = Arc::new(FakeAnn::default());
        let ctx = StoreContext {
            config: &config,
            engine: &engine,
            embedder: Arc::new(KeywordEmbedder::new(&["rust"])),
        };
        let store = MatchingEngineVectorStore::for_engine(storage.clone(), ann.clone(), &ctx).unwrap();
        Fixture {
            _dir: dir,
            storage,
            ann,
            store,
        }
    }

    fn engine(name: &str) -> QueryEngine {
        QueryEngine::new(name, QueryEngineType::LlmService, "u")
    }

    #[test]
    fn test_deployed_index_id_is_identifier() {
        assert_eq!(deployed_index_id("My Docs_v2"), "qe_my_docs_v2");
    }

    #[test]
    fn test_datapoint_line_carries_restricts() {
        let metadata = json!({"genre": ["comedy", "drama"], "year": 2001, "flag": true});
        let line = datapoint_line(7, &[0.5, -1.0], metadata.as_object().unwrap()).unwrap();
        let v: Value = serde_json::from_str(&line).unwrap();
        assert_eq!(v["id"], "7");
        assert_eq!(v["embedding"], json!(["0.5", "-1"]));
        assert_eq!(v["restricts"], json!([{"namespace": "genre", "allow": ["comedy", "drama"]}]));
        assert_eq!(v["numeric_restricts"], json!([{"namespace": "year", "value_double": 2001.0}]));
    }

    #[test]
    fn test_filter_translation() {
        let expr = parse_filter(r#"genre:ANY("comedy") AND NOT year > 2000 AND n:IN(1, *)"#).unwrap();
        let restricts = filter_to_restricts(&expr).unwrap();
        assert_eq!(restricts.tokens[0].allow, vec!["comedy"]);
        assert_eq!(restricts.numeric[0].op, "LESS_EQUAL");
        assert_eq!(restricts.numeric[1].op, "GREATER_EQUAL");

        let or = parse_filter("a > 1 OR b > 2").unwrap();
        assert!(matches!(filter_to_restricts(&or), Err(Error::Validation(_))));
    }

    #[tokio::test]
    async fn test_index_writes_jsonl_to_data_bucket() {
        let f = fixture(engine("docs"));
        f.store.init_index().await.unwrap();
        let texts = vec!["rust a".to_string(), "other b".to_string()];
        let next = f
            .store
            .index_document("guide.pdf", &texts, 3, &Map::new())
            .await
            .unwrap();
        assert_eq!(next, 5);

        let data = f.storage.read("local-project-docs-data", "guide_3_index.json").await.unwrap();
        let lines: Vec<&str> = std::str::from_utf8(&data).unwrap().lines().collect();
        assert_eq!(lines.len(), 2);
        assert!(lines[1].contains("\"id\":\"4\""));
    }

    /// Local storage whose writes fail for objects containing `fail_on`.
    struct FlakyStorage {
        inner: LocalStorage,
        fail_on: &'static str,
    }

    #[async_trait]
    impl ObjectStorage for FlakyStorage {
        async fn create_bucket(&self, bucket: &str, clear: bool) -> Result<()> {
            self.inner.create_bucket(bucket, clear).await
        }
        async fn clear_bucket(&self, bucket: &str) -> Result<usize> {
            self.inner.clear_bucket(bucket).await
        }
        async fn list(&self, bucket: &str, prefix: Option<&str>) -> Result<Vec<crate::storage::StoredObject>> {
            self.inner.list(bucket, prefix).await
        }
        async fn read(&self, bucket: &str, object: &str) -> Result<Vec<u8>> {
            self.inner.read(bucket, object).await
        }
        async fn write(&self, bucket: &str, object: &str, bytes: Vec<u8>) -> Result<String> {
            if object.contains(self.fail_on) {
                anyhow::bail!("upload interrupted: {}", object);
            }
            self.inner.write(bucket, object, bytes).await
        }
        async fn delete_object(&self, bucket: &str, object: &str) -> Result<()> {
            self.inner.delete_object(bucket, object).await
        }
        fn public_url(&self, bucket: &str, object: &str) -> String {
            self.inner.public_url(bucket, object)
        }
    }

    #[tokio::test]
    async fn test_failed_upload_removes_earlier_batches() {
        let dir = tempfile::tempdir().unwrap();
        let config = Config::for_root(dir.path());
        let storage = Arc::new(FlakyStorage {
            inner: LocalStorage::new(dir.path().join("buckets")),
            fail_on: "_1000_",
        });
        let engine = engine("docs");
        let ctx = StoreContext {
            config: &config,
            engine: &engine,
            embedder: Arc::new(KeywordEmbedder::new(&["rust"])),
        };
        let store =
            MatchingEngineVectorStore::for_engine(storage.clone(), Arc::new(FakeAnn::default()), &ctx)
                .unwrap();
        store.init_index().await.unwrap();

        let texts: Vec<String> = (0..1001).map(|i| format!("Line {}.", i)).collect();
        assert!(store.index_document("big.txt", &texts, 0, &Map::new()).await.is_err());
        assert!(storage.list("local-project-docs-data", None).await.unwrap().is_empty());

        let next = store
            .index_document("small.txt", &["rust".to_string()], 0, &Map::new())
            .await
            .unwrap();
        assert_eq!(next, 1);
        let objects = storage.list("local-project-docs-data", None).await.unwrap();
        assert_eq!(objects.len(), 1);
        assert_eq!(objects[0].name, "small_0_index.json");
    }

    #[tokio::test]
    async fn test_deploy_failure_is_not_fatal_and_reuses_handles() {
        let f = fixture(engine("docs"));
        let deployed = f.store.deploy().await.unwrap().unwrap();
        assert_eq!(deployed.index_id, "indexes/1");
        assert_eq!(deployed.endpoint, "indexEndpoints/2");
        assert_eq!(deployed.deployed_index_name, "qe_docs");

        f.store.deploy().await.unwrap();
        let calls = f.ann.calls();
        assert_eq!(calls.iter().filter(|c| c.starts_with("create_index")).count(), 1);
        assert_eq!(calls.iter().filter(|c| c.starts_with("deploy")).count(), 2);
        assert!(calls[0].contains("gs://local-project-docs-data 150"));
    }

    #[tokio::test]
    async fn test_search_requires_deployment() {
        let f = fixture(engine("docs"));
        assert!(f.store.similarity_search(&[1.0, 0.0], None).await.is_err());

        let mut deployed = engine("docs");
        deployed.index_id = Some("indexes/1".to_string());
        deployed.endpoint = Some("indexEndpoints/2".to_string());
        let f = fixture(deployed);
        assert_eq!(f.store.similarity_search(&[1.0, 0.0], None).await.unwrap(), vec![4, 0]);
        assert_eq!(f.ann.calls(), vec!["find k=5 tokens=0"]);
    }

    #[tokio::test]
    async fn test_delete_only_touches_existing_resources() {
        let f = fixture(engine("docs"));
        f.store.delete().await.unwrap();
        assert!(f.ann.calls().is_empty());

        let mut deployed = engine("docs");
        deployed.endpoint = Some("indexEndpoints/2".to_string());
        let f = fixture(deployed);
        f.store.delete().await.unwrap();
        assert_eq!(f.ann.calls(), vec!["delete_endpoint indexEndpoints/2"]);
    }
}
