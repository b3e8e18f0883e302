//! Data sources: fetch a document collection into a scratch directory.
//!
//! A build's `doc_url` selects the source by scheme:
//!
//! | Scheme | Source | Downloads to |
//! |--------|--------|--------------|
//! | `gs://bucket[/prefix]` | [`BucketSource`] | scratch dir, flattened |
//! | `http://`, `https://` | [`WebSource`] (crawl to `depth_limit`) | downloads bucket, then scratch |
//! | `shpt://site/drive[/folder]` | [`SharePointSource`] | downloads bucket, then scratch |
//!
//! Every source returns [`DataSourceFile`]s; chunking is shared and lives in
//! [`chunking`]. Sources are resolved through a [`DataSourceRegistry`] so new
//! schemes can be added without touching the pipeline.

pub mod bucket;
pub mod chunking;
pub mod sharepoint;
pub mod web;

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use async_trait::async_trait;
use rag_harness_core::models::QueryEngine;
use serde_json::{Map, Value};

use crate::config::Config;
use crate::storage::{ObjectStorage, StorageUrl};

pub use bucket::BucketSource;
pub use chunking::{DocumentChunker, MultimodalChunk, PageRasterizer, PdftoppmRasterizer};
pub use sharepoint::SharePointSource;
pub use web::WebSource;

/// One file fetched for a build. Lives only for the duration of the build.
#[derive(Debug, Clone, PartialEq)]
pub struct DataSourceFile {
    /// Object name or path relative to the collection root.
    pub name: String,
    /// URL recorded on the `QueryDocument` and shown in references.
    pub src_url: String,
    pub local_path: PathBuf,
    /// `gs://` URL of the stored copy, when one exists.
    pub gcs_path: Option<String>,
    pub mime_type: String,
    /// Manifest fields forwarded to the vector store for filtering.
    pub metadata: Map<String, Value>,
}

impl DataSourceFile {
    pub fn extension(&self) -> String {
        crate::extract::file_extension(&self.name)
    }
}

/// A URL-addressed document collection.
#[async_trait]
pub trait DataSource: Send + Sync {
    /// Short identifier for logs, e.g. `"bucket"`.
    fn source_type(&self) -> &str;

    /// Fetch every document under `url` into `dest`.
    ///
    /// Returning an empty list is not an error here; the pipeline turns it
    /// into "no documents indexed".
    async fn download(&self, url: &str, dest: &Path) -> Result<Vec<DataSourceFile>>;
}

/// What a source factory may use to construct a source for one build.
pub struct SourceContext<'a> {
    pub config: &'a Config,
    pub engine: &'a QueryEngine,
    pub storage: Arc<dyn ObjectStorage>,
}

pub type SourceFactory =
    Box<dyn Fn(&SourceContext<'_>) -> Result<Box<dyn DataSource>> + Send + Sync>;

/// Data sources keyed by URL prefix.
pub struct DataSourceRegistry {
    factories: Vec<(String, SourceFactory)>,
}

impl DataSourceRegistry {
    pub fn new() -> Self {
        Self {
            factories: Vec::new(),
        }
    }

    /// Registry with the bucket, web, and SharePoint sources.
    pub fn with_defaults() -> Self {
        let mut registry = Self::new();
        registry.register(
            "gs://",
            Box::new(|ctx| Ok(Box::new(BucketSource::new(ctx.storage.clone())))),
        );
        for prefix in ["http://", "https://"] {
            registry.register(prefix, Box::new(|ctx| Ok(Box::new(WebSource::for_engine(ctx)?))));
        }
        registry.register(
            "shpt://",
            Box::new(|ctx| Ok(Box::new(SharePointSource::for_engine(ctx)?))),
        );
        registry
    }

    /// Register a factory for URLs starting with `prefix`. Later
    /// registrations win over earlier ones.
    pub fn register(&mut self, prefix: &str, factory: SourceFactory) {
        self.factories.retain(|(p, _)| p != prefix);
        self.factories.push((prefix.to_string(), factory));
    }

    pub fn prefixes(&self) -> Vec<&str> {
        self.factories.iter().map(|(p, _)| p.as_str()).collect()
    }

    /// Construct the source that handles `url`.
    pub fn resolve(&self, url: &str, ctx: &SourceContext<'_>) -> Result<Box<dyn DataSource>> {
        match self.factories.iter().find(|(prefix, _)| url.starts_with(prefix.as_str())) {
            Some((_, factory)) => factory(ctx),
            None => bail!("No datasource available for doc url [{}]", url),
        }
    }
}

impl Default for DataSourceRegistry {
    fn default() -> Self {
        Self::with_defaults()
    }
}

// ═══════════════════════════════════════════════════════════════════════
// Manifest
// ═══════════════════════════════════════════════════════════════════════

/// Per-document metadata keyed by document URL.
///
/// ```json
/// {"gs://docs/movies/alien.pdf": {"genre": "horror", "year": 1979}}
/// ```
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Manifest(pub HashMap<String, Map<String, Value>>);

impl Manifest {
    pub fn parse(json: &[u8]) -> Result<Self> {
        let raw: HashMap<String, Value> =
            serde_json::from_slice(json).context("manifest must be a JSON object")?;
        let mut entries = HashMap::with_capacity(raw.len());
        for (url, value) in raw {
            match value {
                Value::Object(fields) => {
                    entries.insert(url, fields);
                }
                _ => bail!("manifest entry for {} must be an object", url),
            }
        }
        Ok(Self(entries))
    }

    /// Load the manifest named by the engine's `manifest_url` param, or an
    /// empty one when none is set. `gs://` URLs and local paths are accepted.
    pub async fn load(engine: &QueryEngine, storage: &dyn ObjectStorage) -> Result<Self> {
        let Some(url) = engine.params.get("manifest_url") else {
            return Ok(Self::default());
        };
        let bytes = if url.starts_with("gs://") {
            let parsed = StorageUrl::parse(url)?;
            storage.read(&parsed.bucket, &parsed.object).await?
        } else if url.contains("://") {
            bail!("unsupported manifest URL {}", url);
        } else {
            tokio::fs::read(url)
                .await
                .with_context(|| format!("Failed to read manifest {}", url))?
        };
        let manifest = Self::parse(&bytes)?;
        tracing::info!(url = %url, entries = manifest.0.len(), "loaded document manifest");
        Ok(manifest)
    }

    /// Attach metadata to each file whose source URL, storage URL, or name
    /// appears in the manifest.
    pub fn apply(&self, files: &mut [DataSourceFile]) {
        if self.0.is_empty() {
            return;
        }
        for file in files {
            let keys = [Some(&file.src_url), file.gcs_path.as_ref(), Some(&file.name)];
            if let Some(fields) = keys.into_iter().flatten().find_map(|k| self.0.get(k)) {
                file.metadata = fields.clone();
            }
        }
    }
}
