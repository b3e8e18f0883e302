//! End-to-end build and query tests against local storage, the SQLite
//! record store, and deterministic in-process model providers.

use std::sync::{Arc, Mutex};

use anyhow::Result;
use async_trait::async_trait;
use rag_harness::config::Config;
use rag_harness::data_source::{DocumentChunker, PageRasterizer};
use rag_harness::managed_search::{ManagedBuild, ManagedSearch};
use rag_harness::orchestrator::{self, BuildRequest};
use rag_harness::query::{self, RetrieveOptions};
use rag_harness::storage::data_bucket_name;
use rag_harness::vector_store::ann_service::{AnnIndexSpec, NeighborRestricts};
use rag_harness::vector_store::{AnnIndexService, MatchingEngineVectorStore};
use rag_harness::AppContext;
use rag_harness_core::context::question_prompt;
use rag_harness_core::embedding::{Embedder, MultimodalEmbedding};
use rag_harness_core::llm::{ChatTurn, LanguageModel};
use rag_harness_core::models::{
    BuildParams, ChunkContent, Modality, QueryEngine, QueryEngineType, QueryReference,
    ReferenceContent, UserQuery,
};
use rag_harness_core::rerank::{RankedResult, RankedResults, Reranker};
use rag_harness_core::Error;
use tempfile::TempDir;

// ── Providers ───────────────────────────────────────────────────────────

const KEYWORDS: &[&str] = &["cat", "dog", "fish", "bird", "horse"];

/// One dimension per keyword plus a constant, so every text has a direction.
struct KeywordEmbedder;

impl KeywordEmbedder {
    fn vector(text: &str) -> Vec<f32> {
        let lower = text.to_lowercase();
        let mut v: Vec<f32> = KEYWORDS
            .iter()
            .map(|k| if lower.contains(k) { 1.0 } else { 0.0 })
            .collect();
        v.push(0.05);
        v
    }
}

#[async_trait]
impl Embedder for KeywordEmbedder {
    fn model_name(&self) -> &str {
        "keyword"
    }
    fn dims(&self) -> usize {
        KEYWORDS.len() + 1
    }
    async fn embed(&self, texts: &[String]) -> Result<Vec<Vec<f32>>> {
        Ok(texts.iter().map(|t| Self::vector(t)).collect())
    }
    async fn embed_multimodal(&self, text: &str, _image: &[u8]) -> Result<MultimodalEmbedding> {
        let mut out = MultimodalEmbedding::new();
        out.insert(Modality::Image, Self::vector(text));
        Ok(out)
    }
}

/// Keyword embedder that refuses any batch mentioning "poison".
struct PoisonedEmbedder;

#[async_trait]
impl Embedder for PoisonedEmbedder {
    fn model_name(&self) -> &str {
        "poisoned"
    }
    fn dims(&self) -> usize {
        KEYWORDS.len() + 1
    }
    async fn embed(&self, texts: &[String]) -> Result<Vec<Vec<f32>>> {
        if texts.iter().any(|t| t.contains("poison")) {
            anyhow::bail!("embedding service rejected the batch");
        }
        Ok(texts.iter().map(|t| KeywordEmbedder::vector(t)).collect())
    }
}

/// Stands in for pdftoppm.
struct FakeRasterizer;

#[async_trait]
impl PageRasterizer for FakeRasterizer {
    async fn rasterize(&self, page_pdf: &[u8]) -> Result<Vec<u8>> {
        Ok(format!("png:{}", page_pdf.len()).into_bytes())
    }
}

/// Records every prompt; answers with a fixed reply.
struct RecordingModel {
    context_length: Option<usize>,
    reply: String,
    prompts: Mutex<Vec<String>>,
}

impl RecordingModel {
    fn new(context_length: Option<usize>, reply: &str) -> Arc<Self> {
        Arc::new(Self {
            context_length,
            reply: reply.to_string(),
            prompts: Mutex::new(Vec::new()),
        })
    }

    fn prompts(&self) -> Vec<String> {
        self.prompts.lock().unwrap().clone()
    }
}

#[async_trait]
impl LanguageModel for RecordingModel {
    fn model_name(&self) -> &str {
        "recording"
    }
    fn context_length(&self) -> Option<usize> {
        self.context_length
    }
    async fn generate(&self, prompt: &str, _chat: &[ChatTurn]) -> Result<String> {
        self.prompts.lock().unwrap().push(prompt.to_string());
        Ok(self.reply.clone())
    }
}

/// Scores a document by its length, longest first.
struct LengthReranker;

#[async_trait]
impl Reranker for LengthReranker {
    async fn rank(&self, _query: &str, docs: &[String], doc_ids: &[String]) -> Result<RankedResults> {
        Ok(RankedResults(
            docs.iter()
                .zip(doc_ids)
                .map(|(d, id)| RankedResult {
                    doc_id: id.clone(),
                    score: d.len() as f32,
                })
                .collect(),
        ))
    }
}

#[derive(Default)]
struct CountingAnn {
    calls: Mutex<Vec<String>>,
}

impl CountingAnn {
    fn count(&self, prefix: &str) -> usize {
        self.calls
            .lock()
            .unwrap()
            .iter()
            .filter(|c| c.starts_with(prefix))
            .count()
    }

    fn record(&self, call: &str) {
        self.calls.lock().unwrap().push(call.to_string());
    }
}

#[async_trait]
impl AnnIndexService for CountingAnn {
    async fn create_index(&self, _index: &AnnIndexSpec) -> Result<String> {
        self.record("create_index");
        Ok("projects/p/locations/r/indexes/11".to_string())
    }
    async fn create_endpoint(&self, _name: &str, _description: &str) -> Result<String> {
        self.record("create_endpoint");
        Ok("projects/p/locations/r/indexEndpoints/22".to_string())
    }
    async fn deploy_index(&self, _endpoint: &str, _index: &str, _id: &str) -> Result<()> {
        self.record("deploy_index");
        Ok(())
    }
    async fn find_neighbors(
        &self,
        _endpoint: &str,
        _id: &str,
        _query: &[f32],
        _k: usize,
        _restricts: &NeighborRestricts,
    ) -> Result<Vec<String>> {
        self.record("find_neighbors");
        Ok(vec!["0".to_string()])
    }
    async fn delete_endpoint(&self, _endpoint: &str) -> Result<()> {
        self.record("delete_endpoint");
        Ok(())
    }
    async fn delete_index(&self, _index: &str) -> Result<()> {
        self.record("delete_index");
        Ok(())
    }
}

/// Managed search service that returns one reference per search.
#[derive(Default)]
struct StubManagedSearch {
    deleted: Mutex<Vec<String>>,
}

#[async_trait]
impl ManagedSearch for StubManagedSearch {
    async fn build(&self, _engine: &QueryEngine, doc_url: &str) -> Result<ManagedBuild> {
        Ok(ManagedBuild {
            docs_processed: vec![format!("{}/one.pdf", doc_url)],
            docs_not_processed: Vec::new(),
        })
    }
    async fn search(&self, engine: &QueryEngine, prompt: &str, user_id: &str) -> Result<Vec<QueryReference>> {
        let content = ReferenceContent::Text {
            text: format!("managed answer to {}", prompt),
        };
        Ok(vec![QueryReference::new(engine, user_id, "gs://managed/one.pdf", content)])
    }
    async fn delete(&self, engine: &QueryEngine) -> Result<()> {
        self.deleted.lock().unwrap().push(engine.name.clone());
        Ok(())
    }
}

// ── Fixtures ────────────────────────────────────────────────────────────

async fn open_app(dir: &TempDir, configure: impl FnOnce(&mut Config)) -> AppContext {
    let mut config = Config::for_root(dir.path());
    configure(&mut config);
    let app = AppContext::open(config).await.unwrap();
    app.embedders.insert("text", Arc::new(KeywordEmbedder));
    app.llms.insert("chat", RecordingModel::new(None, "ok"));
    app
}

async fn put_docs(app: &AppContext, bucket: &str, folder: &str, docs: &[(&str, &str)]) {
    for (name, body) in docs {
        app.storage
            .write(bucket, &format!("{}/{}", folder, name), body.as_bytes().to_vec())
            .await
            .unwrap();
    }
}

fn register_matching_engine(app: &mut AppContext, ann: Arc<CountingAnn>) {
    let storage = app.storage.clone();
    let service: Arc<dyn AnnIndexService> = ann;
    app.vector_stores.register(
        "matching_engine",
        Box::new(move |ctx| {
            Ok(Box::new(MatchingEngineVectorStore::for_engine(
                storage.clone(),
                service.clone(),
                ctx,
            )?))
        }),
    );
}

/// A PDF with one line of Helvetica text per page.
fn pdf_with_pages(texts: &[&str]) -> Vec<u8> {
    use lopdf::content::{Content, Operation};
    use lopdf::{dictionary, Document, Object, Stream};

    let mut doc = Document::with_version("1.5");
    let pages_id = doc.new_object_id();
    let font_id = doc.add_object(dictionary! {
        "Type" => "Font",
        "Subtype" => "Type1",
        "BaseFont" => "Helvetica",
    });
    let resources_id = doc.add_object(dictionary! {
        "Font" => dictionary! { "F1" => font_id },
    });
    let mut kids: Vec<Object> = Vec::new();
    for text in texts {
        let content = Content {
            operations: vec![
                Operation::new("BT", vec![]),
                Operation::new("Tf", vec!["F1".into(), 12.into()]),
                Operation::new("Td", vec![72.into(), 700.into()]),
                Operation::new("Tj", vec![Object::string_literal(*text)]),
                Operation::new("ET", vec![]),
            ],
        };
        let content_id = doc.add_object(Stream::new(dictionary! {}, content.encode().unwrap()));
        let page_id = doc.add_object(dictionary! {
            "Type" => "Page",
            "Parent" => pages_id,
            "Contents" => content_id,
        });
        kids.push(page_id.into());
    }
    let count = kids.len() as i64;
    doc.objects.insert(
        pages_id,
        Object::Dictionary(dictionary! {
            "Type" => "Pages",
            "Kids" => kids,
            "Count" => count,
            "Resources" => resources_id,
            "MediaBox" => vec![0.into(), 0.into(), 612.into(), 792.into()],
        }),
    );
    let catalog_id = doc.add_object(dictionary! {
        "Type" => "Catalog",
        "Pages" => pages_id,
    });
    doc.trailer.set("Root", catalog_id);
    let mut out = Vec::new();
    doc.save_to(&mut out).unwrap();
    out
}

fn text_build(name: &str, doc_url: &str) -> BuildRequest {
    let mut request = BuildRequest::new(name, QueryEngineType::LlmService, "tester");
    request.doc_url = Some(doc_url.to_string());
    request
}

// ── Build ───────────────────────────────────────────────────────────────

#[tokio::test]
async fn test_build_assigns_contiguous_index_ranges() {
    let dir = TempDir::new().unwrap();
    let app = open_app(&dir, |_| {}).await;
    put_docs(
        &app,
        "docs",
        "pets",
        &[
            ("a.txt", "The cat sleeps. The cat eats. The cat plays."),
            ("b.txt", ""),
            ("c.txt", "A dog barks. A dog runs."),
            ("d.txt", "Fish swim. Birds fly. Horses gallop. Dogs dig."),
        ],
    )
    .await;

    let outcome = orchestrator::query_engine_build(&app, text_build("pets", "gs://docs/pets"))
        .await
        .unwrap();

    assert_eq!(outcome.docs_processed.len(), 3);
    assert_eq!(outcome.docs_not_processed, vec!["gs://docs/pets/b.txt".to_string()]);
    assert_eq!(outcome.engine.vector_store.as_deref(), Some("sqlite_vector"));

    let docs = app.store.documents_for_engine(&outcome.engine.id).await.unwrap();
    let chunks = app.store.chunks_for_engine(&outcome.engine.id).await.unwrap();
    assert_eq!(docs.len(), 3);
    assert_eq!(docs[0].index_start, 0);
    for pair in docs.windows(2) {
        assert_eq!(pair[0].index_end, pair[1].index_start);
    }
    assert_eq!(docs.last().unwrap().index_end as usize, chunks.len());
    assert_eq!(chunks.len(), 3 + 2 + 4);

    for (i, chunk) in chunks.iter().enumerate() {
        assert_eq!(chunk.index, i as i64);
        let owner = docs.iter().find(|d| d.id == chunk.document_id).unwrap();
        assert!(owner.contains(chunk.index));
    }
}

#[tokio::test]
async fn test_build_without_indexable_documents_leaves_nothing() {
    let dir = TempDir::new().unwrap();
    let app = open_app(&dir, |_| {}).await;
    put_docs(&app, "docs", "empty", &[("a.txt", ""), ("b.txt", "   ")]).await;

    let err = orchestrator::query_engine_build(&app, text_build("empty", "gs://docs/empty"))
        .await
        .unwrap_err();

    assert!(matches!(err, Error::NoDocumentsIndexed(_)), "got {err}");
    assert!(err.is_user_error());
    assert!(app.store.find_engine_by_name("empty").await.unwrap().is_none());
    assert!(app.store.list_engines().await.unwrap().is_empty());
}

#[tokio::test]
async fn test_duplicate_name_is_rejected() {
    let dir = TempDir::new().unwrap();
    let app = open_app(&dir, |_| {}).await;
    put_docs(&app, "docs", "pets", &[("a.txt", "The cat sleeps.")]).await;

    orchestrator::query_engine_build(&app, text_build("pets", "gs://docs/pets"))
        .await
        .unwrap();
    let err = orchestrator::query_engine_build(&app, text_build("pets", "gs://docs/pets"))
        .await
        .unwrap_err();

    assert!(matches!(err, Error::Validation(ref m) if m.contains("already exists")));
    assert_eq!(app.store.list_engines().await.unwrap().len(), 1);
}

#[tokio::test]
async fn test_soft_deleted_name_can_be_reused() {
    let dir = TempDir::new().unwrap();
    let app = open_app(&dir, |_| {}).await;
    put_docs(&app, "docs", "pets", &[("a.txt", "The cat sleeps.")]).await;

    let first = orchestrator::query_engine_build(&app, text_build("pets", "gs://docs/pets"))
        .await
        .unwrap();
    orchestrator::delete_engine(&app, &first.engine, false).await.unwrap();

    let second = orchestrator::query_engine_build(&app, text_build("pets", "gs://docs/pets"))
        .await
        .unwrap();
    assert_ne!(first.engine.id, second.engine.id);
    let old = app.store.get_engine(&first.engine.id).await.unwrap().unwrap();
    assert!(old.is_deleted());
    assert_eq!(app.store.list_engines().await.unwrap().len(), 1);
}

#[tokio::test]
async fn test_integrated_build_with_missing_child_rolls_back() {
    let dir = TempDir::new().unwrap();
    let app = open_app(&dir, |_| {}).await;
    put_docs(&app, "docs", "pets", &[("a.txt", "The cat sleeps.")]).await;
    orchestrator::query_engine_build(&app, text_build("pets", "gs://docs/pets"))
        .await
        .unwrap();

    let mut request = BuildRequest::new("all", QueryEngineType::Integrated, "tester");
    request.params = BuildParams::new().with("associated_engines", "pets, missing");
    let err = orchestrator::query_engine_build(&app, request).await.unwrap_err();

    assert!(matches!(err, Error::NotFound { .. }), "got {err}");
    assert!(app.store.find_engine_by_name("all").await.unwrap().is_none());
    let child = app.store.find_engine_by_name("pets").await.unwrap().unwrap();
    assert_eq!(child.parent_engine_id, None);
}

#[tokio::test]
async fn test_deploy_is_idempotent() {
    let dir = TempDir::new().unwrap();
    let mut app = open_app(&dir, |_| {}).await;
    let ann = Arc::new(CountingAnn::default());
    register_matching_engine(&mut app, ann.clone());
    put_docs(&app, "docs", "pets", &[("a.txt", "The cat sleeps. The dog barks.")]).await;

    let mut request = text_build("pets", "gs://docs/pets");
    request.vector_store = Some("matching_engine".to_string());
    let built = orchestrator::query_engine_build(&app, request).await.unwrap();
    assert_eq!(built.engine.index_id.as_deref(), Some("projects/p/locations/r/indexes/11"));

    let again = orchestrator::deploy_engine(&app, "pets").await.unwrap();
    let third = orchestrator::deploy_engine(&app, "pets").await.unwrap();

    assert_eq!(ann.count("create_index"), 1);
    assert_eq!(ann.count("create_endpoint"), 1);
    assert_eq!(ann.count("deploy_index"), 3);
    assert_eq!(again.endpoint, built.engine.endpoint);
    assert_eq!(third.deployed_index_name, built.engine.deployed_index_name);

    orchestrator::delete_engine(&app, &third, true).await.unwrap();
    assert_eq!(ann.count("delete_endpoint"), 1);
    assert_eq!(ann.count("delete_index"), 1);
}

#[tokio::test]
async fn test_deploy_rejects_integrated_engine() {
    let dir = TempDir::new().unwrap();
    let app = open_app(&dir, |_| {}).await;
    put_docs(&app, "docs", "pets", &[("a.txt", "The cat sleeps.")]).await;
    orchestrator::query_engine_build(&app, text_build("pets", "gs://docs/pets"))
        .await
        .unwrap();
    let mut request = BuildRequest::new("all", QueryEngineType::Integrated, "tester");
    request.params = BuildParams::new().with("associated_engines", "pets");
    orchestrator::query_engine_build(&app, request).await.unwrap();

    let err = orchestrator::deploy_engine(&app, "all").await.unwrap_err();
    assert!(matches!(err, Error::Validation(_)));
}

#[tokio::test]
async fn test_failed_document_leaves_no_ann_datapoints() {
    let dir = TempDir::new().unwrap();
    let mut app = open_app(&dir, |_| {}).await;
    app.embedders.insert("text", Arc::new(PoisonedEmbedder));
    register_matching_engine(&mut app, Arc::new(CountingAnn::default()));

    // 1001 sentences: the first embedding call succeeds, the second fails.
    let mut big: String = (0..1000).map(|i| format!("Cat number {} sleeps. ", i)).collect();
    big.push_str("This one is poison.");
    put_docs(&app, "docs", "pets", &[("a.txt", big.as_str()), ("b.txt", "The dog barks.")]).await;

    let mut request = text_build("pets", "gs://docs/pets");
    request.vector_store = Some("matching_engine".to_string());
    let outcome = orchestrator::query_engine_build(&app, request).await.unwrap();
    assert_eq!(outcome.docs_not_processed, vec!["gs://docs/pets/a.txt".to_string()]);
    assert_eq!(outcome.docs_processed, vec!["gs://docs/pets/b.txt".to_string()]);

    let bucket = data_bucket_name(&app.config.project.id, "pets").unwrap();
    let mut ids = Vec::new();
    for object in app.storage.list(&bucket, None).await.unwrap() {
        let data = app.storage.read(&bucket, &object.name).await.unwrap();
        for line in String::from_utf8(data).unwrap().lines() {
            let point: serde_json::Value = serde_json::from_str(line).unwrap();
            ids.push(point["id"].as_str().unwrap().to_string());
        }
    }
    let chunks = app.store.chunks_for_engine(&outcome.engine.id).await.unwrap();
    assert_eq!(ids, vec!["0".to_string()]);
    assert_eq!(ids.len(), chunks.len());

    let refs = query::query_search(&app, "dog", &outcome.engine, "tester", None, false)
        .await
        .unwrap();
    assert_eq!(refs.len(), 1);
    assert_eq!(refs[0].document_url, "gs://docs/pets/b.txt");
}

#[tokio::test]
async fn test_multimodal_build_indexes_page_images() {
    let dir = TempDir::new().unwrap();
    let mut app = open_app(&dir, |_| {}).await;
    app.embedders.insert("multimodal", Arc::new(KeywordEmbedder));
    app.chunker = DocumentChunker::new(
        app.storage.clone(),
        Arc::new(FakeRasterizer),
        &app.config.retrieval,
    );
    app.storage
        .write(
            "docs",
            "movies/alien.pdf",
            pdf_with_pages(&["The cat hides.", "The dog hunts."]),
        )
        .await
        .unwrap();

    let mut request = text_build("movies", "gs://docs/movies");
    request.params = BuildParams::default().with("is_multimodal", "true");
    let outcome = orchestrator::query_engine_build(&app, request).await.unwrap();
    assert!(outcome.engine.is_multimodal());
    assert_eq!(outcome.engine.embedding_type, "multimodal");
    assert_eq!(outcome.docs_processed, vec!["gs://docs/movies/alien.pdf".to_string()]);

    let docs = app.store.documents_for_engine(&outcome.engine.id).await.unwrap();
    assert_eq!(docs.len(), 1);
    assert_eq!((docs[0].index_start, docs[0].index_end), (0, 2));

    let chunks = app.store.chunks_for_engine(&outcome.engine.id).await.unwrap();
    assert_eq!(chunks.len(), 2);
    for (i, chunk) in chunks.iter().enumerate() {
        assert_eq!(chunk.index, i as i64);
        assert_eq!(chunk.page, Some(i as i64));
        match &chunk.content {
            ChunkContent::Image { url, .. } => {
                assert!(url.ends_with(&format!("/alien_{}.png", i)), "url: {}", url)
            }
            other => panic!("expected an image chunk, got {:?}", other),
        }
    }

    let refs = query::query_search(&app, "cat", &outcome.engine, "tester", None, false)
        .await
        .unwrap();
    assert_eq!(refs.len(), 2);
    let mut pages: Vec<i64> = refs.iter().filter_map(|r| r.page).collect();
    pages.sort();
    assert_eq!(pages, vec![0, 1]);
    for r in &refs {
        assert_eq!(r.document_url, "gs://docs/movies/alien.pdf");
        assert!(matches!(r.content, ReferenceContent::Image { .. }));
    }
}

// ── Retrieval ───────────────────────────────────────────────────────────

#[tokio::test]
async fn test_manifest_metadata_filters_search() {
    let dir = TempDir::new().unwrap();
    let app = open_app(&dir, |_| {}).await;
    put_docs(
        &app,
        "docs",
        "movies",
        &[
            ("alien.txt", "A cat named Jones survives."),
            ("babe.txt", "A cat and a pig on a farm."),
        ],
    )
    .await;
    app.storage
        .write(
            "meta",
            "manifest.json",
            br#"{
                "gs://docs/movies/alien.txt": {"genre": "horror", "year": 1979},
                "gs://docs/movies/babe.txt": {"genre": "family", "year": 1995}
            }"#
            .to_vec(),
        )
        .await
        .unwrap();

    let mut request = text_build("movies", "gs://docs/movies");
    request.params = BuildParams::new().with("manifest_url", "gs://meta/manifest.json");
    let engine = orchestrator::query_engine_build(&app, request).await.unwrap().engine;

    let horror = query::query_search(&app, "cat", &engine, "u", Some(r#"genre:ANY("horror")"#), false)
        .await
        .unwrap();
    assert_eq!(horror.len(), 1);
    assert_eq!(horror[0].document_url, "gs://docs/movies/alien.txt");

    let recent = query::query_search(&app, "cat", &engine, "u", Some("year > 1990"), false)
        .await
        .unwrap();
    assert_eq!(recent.len(), 1);
    assert_eq!(recent[0].document_url, "gs://docs/movies/babe.txt");

    let neither = query::query_search(
        &app,
        "cat",
        &engine,
        "u",
        Some(r#"genre:ANY("horror") AND year > 1990"#),
        false,
    )
    .await
    .unwrap();
    assert!(neither.is_empty());
}

#[tokio::test]
async fn test_integrated_search_reranks_across_children() {
    let dir = TempDir::new().unwrap();
    let app = open_app(&dir, |_| {}).await;
    app.set_reranker(Arc::new(LengthReranker));
    put_docs(
        &app,
        "docs",
        "alpha",
        &[
            ("1.txt", "Cat."),
            ("2.txt", "The cat."),
            ("3.txt", "A tiny cat."),
            ("4.txt", "Cats nap all day."),
        ],
    )
    .await;
    put_docs(
        &app,
        "docs",
        "beta",
        &[
            ("1.txt", "A big cat sat."),
            ("2.txt", "The cat sat on a mat."),
            ("3.txt", "One cat, two cats, three."),
            ("4.txt", "Every cat in town was asleep."),
        ],
    )
    .await;
    for (name, url) in [("alpha", "gs://docs/alpha"), ("beta", "gs://docs/beta")] {
        orchestrator::query_engine_build(&app, text_build(name, url))
            .await
            .unwrap();
    }
    let mut request = BuildRequest::new("all", QueryEngineType::Integrated, "tester");
    request.params = BuildParams::new().with("associated_engines", "alpha,beta");
    let all = orchestrator::query_engine_build(&app, request).await.unwrap().engine;

    // Children are concatenated before reranking.
    let merged = query::retrieve_references(&app, "cat", &all, "u", &RetrieveOptions::default())
        .await
        .unwrap();
    assert_eq!(merged.len(), 8);
    assert!(merged[..4].iter().all(|r| r.engine_name == "alpha"));
    assert!(merged[4..].iter().all(|r| r.engine_name == "beta"));

    let ranked = query::query_search(&app, "cat", &all, "u", None, false).await.unwrap();
    assert_eq!(ranked.len(), 6);
    for pair in ranked.windows(2) {
        assert!(pair[0].text().len() >= pair[1].text().len());
    }
    assert_eq!(ranked[0].text(), "Every cat in town was asleep.");
    assert!(ranked.iter().all(|r| r.text() != "Cat."));
}

#[tokio::test]
async fn test_managed_search_engine_round_trip() {
    let dir = TempDir::new().unwrap();
    let mut app = open_app(&dir, |_| {}).await;
    let service = Arc::new(StubManagedSearch::default());
    app.managed_search = Some(service.clone());

    let mut request = BuildRequest::new("vendor", QueryEngineType::ManagedSearch, "tester");
    request.doc_url = Some("gs://vendor/docs".to_string());
    let outcome = orchestrator::query_engine_build(&app, request).await.unwrap();
    assert_eq!(outcome.docs_processed, vec!["gs://vendor/docs/one.pdf".to_string()]);

    let refs = query::query_search(&app, "pricing", &outcome.engine, "u", None, false)
        .await
        .unwrap();
    assert_eq!(refs.len(), 1);
    assert!(app.store.get_reference(&refs[0].id).await.unwrap().is_some());

    orchestrator::delete_engine(&app, &outcome.engine, true).await.unwrap();
    assert_eq!(*service.deleted.lock().unwrap(), vec!["vendor".to_string()]);
}

#[tokio::test]
async fn test_managed_search_requires_service() {
    let dir = TempDir::new().unwrap();
    let app = open_app(&dir, |_| {}).await;
    let mut request = BuildRequest::new("vendor", QueryEngineType::ManagedSearch, "tester");
    request.doc_url = Some("gs://vendor/docs".to_string());

    let err = orchestrator::query_engine_build(&app, request).await.unwrap_err();
    assert!(matches!(err, Error::Validation(_)));
    assert!(app.store.find_engine_by_name("vendor").await.unwrap().is_none());
}

// ── Generation ──────────────────────────────────────────────────────────

/// Five one-sentence documents of equal length, all about cats.
async fn cat_engine(app: &AppContext) -> QueryEngine {
    let docs: Vec<(String, String)> = (1..=5)
        .map(|n| (format!("{}.txt", n), format!("A cat story, part {}.", n)))
        .collect();
    let docs: Vec<(&str, &str)> = docs.iter().map(|(a, b)| (a.as_str(), b.as_str())).collect();
    put_docs(app, "docs", "cats", &docs).await;
    orchestrator::query_engine_build(app, text_build("cats", "gs://docs/cats"))
        .await
        .unwrap()
        .engine
}

/// Token estimate of a prompt carrying `n` of the cat references.
async fn tokens_with(app: &AppContext, engine: &QueryEngine, n: usize, history: &str) -> usize {
    let refs = query::query_search(app, "cat?", engine, "u", None, false)
        .await
        .unwrap();
    assert_eq!(refs.len(), 5);
    let prompt = question_prompt("cat?", history, &refs[..n]);
    prompt.chars().count().div_ceil(app.config.retrieval.chars_per_token)
}

#[tokio::test]
async fn test_generation_drops_references_down_to_minimum() {
    let dir = TempDir::new().unwrap();
    let app = open_app(&dir, |_| {}).await;
    let engine = cat_engine(&app).await;

    let limit = tokens_with(&app, &engine, 2, "").await;
    let model = RecordingModel::new(Some(limit), "cats are great");
    app.llms.insert("chat", model.clone());

    let generation = query::query_generate(&app, "u", "cat?", &engine, None, None, false)
        .await
        .unwrap();

    assert_eq!(generation.references.len(), 2);
    assert_eq!(generation.result.reference_ids.len(), 2);
    assert_eq!(generation.result.response, "cats are great");
    let sent = model.prompts();
    assert_eq!(sent.len(), 1);
    assert_eq!(sent[0].matches("Context: ").count(), 2);
}

#[tokio::test]
async fn test_generation_summarizes_history_after_dropping_references() {
    let dir = TempDir::new().unwrap();
    let app = open_app(&dir, |c| c.llm.summary_model = Some("summary".to_string())).await;
    let engine = cat_engine(&app).await;

    let limit = tokens_with(&app, &engine, 2, "short").await;
    let model = RecordingModel::new(Some(limit), "answer");
    let summarizer = RecordingModel::new(None, "short");
    app.llms.insert("chat", model.clone());
    app.llms.insert("summary", summarizer.clone());

    let mut conversation = UserQuery::new("u", &engine.id, "earlier");
    conversation.append("earlier", &"a long earlier answer ".repeat(50), Vec::new());
    app.store.save_user_query(&conversation).await.unwrap();

    let generation = query::query_generate(&app, "u", "cat?", &engine, None, Some(conversation), false)
        .await
        .unwrap();

    assert_eq!(summarizer.prompts().len(), 1);
    assert_eq!(generation.references.len(), 2);
    assert!(model.prompts()[0].contains("Previous conversation:\nshort"));
    assert_eq!(generation.user_query.history.len(), 2);
}

#[tokio::test]
async fn test_generation_fails_when_nothing_fits() {
    let dir = TempDir::new().unwrap();
    let app = open_app(&dir, |_| {}).await;
    let engine = cat_engine(&app).await;
    let model = RecordingModel::new(Some(10), "never");
    app.llms.insert("chat", model.clone());

    let err = query::query_generate(&app, "u", "cat?", &engine, None, None, false)
        .await
        .unwrap_err();

    assert!(matches!(err, Error::ContextWindowExceeded { limit: 10, .. }), "got {err}");
    assert!(model.prompts().is_empty());
}
