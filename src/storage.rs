//! Document storage.
//!
//! Every document, crawled page, page image, and ANN index file lives in a
//! bucket addressed by `gs://bucket/object` URLs. Two backends implement
//! [`ObjectStorage`]:
//!
//! | Provider | Backend |
//! |----------|---------|
//! | `"local"` | [`LocalStorage`]: one directory per bucket under `storage.root` |
//! | `"gcs"` | [`GcsStorage`]: Cloud Storage JSON API with a bearer token from the environment |
//!
//! Bucket names are derived from the project id and the engine name and
//! must match `^[a-z0-9][a-z0-9._-]{1,61}[a-z0-9]$`.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{anyhow, bail, Context, Result};
use async_trait::async_trait;
use regex::Regex;
use walkdir::WalkDir;

use crate::config::Config;
use crate::extract::detect_mime_type;

/// One object in a bucket listing.
#[derive(Debug, Clone, PartialEq)]
pub struct StoredObject {
    pub bucket: String,
    /// Object path inside the bucket, `/`-separated.
    pub name: String,
    pub size: u64,
}

impl StoredObject {
    pub fn gs_url(&self) -> String {
        format!("gs://{}/{}", self.bucket, self.name)
    }

    /// Final path component.
    pub fn file_name(&self) -> &str {
        self.name.rsplit('/').next().unwrap_or(&self.name)
    }
}

#[async_trait]
pub trait ObjectStorage: Send + Sync {
    /// Create `bucket` if missing. An existing bucket is emptied when `clear`
    /// is set.
    async fn create_bucket(&self, bucket: &str, clear: bool) -> Result<()>;

    /// Delete every object in `bucket`. Returns the number removed.
    async fn clear_bucket(&self, bucket: &str) -> Result<usize>;

    /// Objects under `prefix`, sorted by name.
    async fn list(&self, bucket: &str, prefix: Option<&str>) -> Result<Vec<StoredObject>>;

    async fn read(&self, bucket: &str, object: &str) -> Result<Vec<u8>>;

    /// Store `bytes` at `object` and return its `gs://` URL.
    async fn write(&self, bucket: &str, object: &str, bytes: Vec<u8>) -> Result<String>;

    /// Remove one object. Missing objects are not an error.
    async fn delete_object(&self, bucket: &str, object: &str) -> Result<()>;

    /// URL a browser can open for the object.
    fn public_url(&self, bucket: &str, object: &str) -> String;

    /// Copy an object to a local file, creating parent directories.
    async fn download(&self, bucket: &str, object: &str, dest: &Path) -> Result<()> {
        let bytes = self.read(bucket, object).await?;
        if let Some(parent) = dest.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        tokio::fs::write(dest, bytes)
            .await
            .with_context(|| format!("Failed to write {}", dest.display()))?;
        Ok(())
    }
}

/// Upload a local file into `folder` of `bucket`, keeping its file name.
pub async fn upload_file(
    storage: &dyn ObjectStorage,
    bucket: &str,
    local_path: &Path,
    folder: Option<&str>,
) -> Result<String> {
    let file_name = local_path
        .file_name()
        .and_then(|n| n.to_str())
        .ok_or_else(|| anyhow!("invalid upload path {}", local_path.display()))?;
    let object = match folder {
        Some(folder) if !folder.is_empty() => {
            format!("{}/{}", folder.trim_end_matches('/'), file_name)
        }
        _ => file_name.to_string(),
    };
    let bytes = tokio::fs::read(local_path)
        .await
        .with_context(|| format!("Failed to read {}", local_path.display()))?;
    let url = storage.write(bucket, &object, bytes).await?;
    tracing::debug!(url = %url, "uploaded file");
    Ok(url)
}

// ═══════════════════════════════════════════════════════════════════════
// URLs and bucket names
// ═══════════════════════════════════════════════════════════════════════

/// A parsed `gs://bucket/object` or `https://storage.googleapis.com/bucket/object` URL.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StorageUrl {
    pub bucket: String,
    /// Object path, possibly empty (whole bucket) or a prefix.
    pub object: String,
}

impl StorageUrl {
    pub fn parse(url: &str) -> Result<Self> {
        let rest = if let Some(rest) = url.strip_prefix("gs://") {
            rest.to_string()
        } else if let Some(rest) = url.strip_prefix("https://storage.googleapis.com/") {
            percent_decode(rest)
        } else {
            bail!("not a storage URL: {}", url);
        };
        let (bucket, object) = match rest.split_once('/') {
            Some((bucket, object)) => (bucket.to_string(), object.to_string()),
            None => (rest.clone(), String::new()),
        };
        if bucket.is_empty() {
            bail!("storage URL has no bucket: {}", url);
        }
        Ok(Self { bucket, object })
    }

    /// Directory part of the object path, if any.
    pub fn folder(&self) -> Option<&str> {
        self.object.rsplit_once('/').map(|(folder, _)| folder)
    }

    /// Last path component of the object.
    pub fn file_name(&self) -> &str {
        self.object.rsplit('/').next().unwrap_or(&self.object)
    }
}

fn percent_decode(s: &str) -> String {
    let bytes = s.as_bytes();
    let mut out = Vec::with_capacity(bytes.len());
    let mut i = 0;
    while i < bytes.len() {
        if bytes[i] == b'%' && i + 2 < bytes.len() {
            let hex = std::str::from_utf8(&bytes[i + 1..i + 3]).ok();
            if let Some(byte) = hex.and_then(|h| u8::from_str_radix(h, 16).ok()) {
                out.push(byte);
                i += 3;
                continue;
            }
        }
        out.push(bytes[i]);
        i += 1;
    }
    String::from_utf8_lossy(&out).into_owned()
}

const BUCKET_NAME_PATTERN: &str = r"^[a-z0-9][a-z0-9._-]{1,61}[a-z0-9]$";

/// Lowercase an engine name and replace spaces and underscores with `-`.
pub fn slug(name: &str) -> String {
    name.replace([' ', '_'], "-").to_lowercase()
}

pub fn validate_bucket_name(name: &str) -> Result<()> {
    if !Regex::new(BUCKET_NAME_PATTERN)?.is_match(name) {
        bail!("invalid bucket name '{}'", name);
    }
    Ok(())
}

/// Bucket holding ANN index files: `{project}-{engine}-data`.
pub fn data_bucket_name(project_id: &str, engine_name: &str) -> Result<String> {
    let name = format!("{}-{}-data", project_id, slug(engine_name));
    validate_bucket_name(&name)?;
    Ok(name)
}

/// Bucket holding crawled and synced files: `{project}-downloads-{engine}`.
pub fn downloads_bucket_name(project_id: &str, engine_name: &str) -> Result<String> {
    let name = format!("{}-downloads-{}", project_id, slug(engine_name));
    validate_bucket_name(&name)?;
    Ok(name)
}

/// Build the storage backend named by `storage.provider`.
pub fn create_storage(config: &Config) -> Result<Arc<dyn ObjectStorage>> {
    match config.storage.provider.as_str() {
        "local" => Ok(Arc::new(LocalStorage::new(config.storage.root.clone()))),
        "gcs" => Ok(Arc::new(GcsStorage::new(config)?)),
        other => bail!("Unknown storage provider: {}", other),
    }
}

// ═══════════════════════════════════════════════════════════════════════
// Local directory storage
// ═══════════════════════════════════════════════════════════════════════

/// Buckets as directories under a root.
pub struct LocalStorage {
    root: PathBuf,
}

impl LocalStorage {
    pub fn new(root: PathBuf) -> Self {
        Self { root }
    }

    fn bucket_dir(&self, bucket: &str) -> PathBuf {
        self.root.join(bucket)
    }

    fn object_path(&self, bucket: &str, object: &str) -> Result<PathBuf> {
        if object.split('/').any(|part| part == "..") {
            bail!("object path escapes bucket: {}", object);
        }
        Ok(self.bucket_dir(bucket).join(object))
    }
}

#[async_trait]
impl ObjectStorage for LocalStorage {
    async fn create_bucket(&self, bucket: &str, clear: bool) -> Result<()> {
        let dir = self.bucket_dir(bucket);
        if dir.exists() {
            if clear {
                let removed = self.clear_bucket(bucket).await?;
                tracing::info!(bucket, removed, "cleared existing bucket");
            }
            return Ok(());
        }
        tokio::fs::create_dir_all(&dir)
            .await
            .with_context(|| format!("Failed to create bucket dir {}", dir.display()))?;
        tracing::info!(bucket, "created bucket");
        Ok(())
    }

    async fn clear_bucket(&self, bucket: &str) -> Result<usize> {
        let objects = self.list(bucket, None).await?;
        for obj in &objects {
            tokio::fs::remove_file(self.object_path(bucket, &obj.name)?).await?;
        }
        Ok(objects.len())
    }

    async fn list(&self, bucket: &str, prefix: Option<&str>) -> Result<Vec<StoredObject>> {
        let dir = self.bucket_dir(bucket);
        if !dir.is_dir() {
            bail!("bucket not found: {}", bucket);
        }
        let mut objects = Vec::new();
        for entry in WalkDir::new(&dir).follow_links(true) {
            let entry = entry?;
            if !entry.file_type().is_file() {
                continue;
            }
            let rel = entry
                .path()
                .strip_prefix(&dir)?
                .components()
                .map(|c| c.as_os_str().to_string_lossy().into_owned())
                .collect::<Vec<_>>()
                .join("/");
            if let Some(prefix) = prefix {
                if !rel.starts_with(prefix) {
                    continue;
                }
            }
            objects.push(StoredObject {
                bucket: bucket.to_string(),
                name: rel,
                size: entry.metadata()?.len(),
            });
        }
        objects.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(objects)
    }

    async fn read(&self, bucket: &str, object: &str) -> Result<Vec<u8>> {
        let path = self.object_path(bucket, object)?;
        tokio::fs::read(&path)
            .await
            .with_context(|| format!("object not found: gs://{}/{}", bucket, object))
    }

    async fn write(&self, bucket: &str, object: &str, bytes: Vec<u8>) -> Result<String> {
        let path = self.object_path(bucket, object)?;
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        tokio::fs::write(&path, bytes).await?;
        Ok(format!("gs://{}/{}", bucket, object))
    }

    async fn delete_object(&self, bucket: &str, object: &str) -> Result<()> {
        let path = self.object_path(bucket, object)?;
        match tokio::fs::remove_file(&path).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e).with_context(|| format!("Failed to delete gs://{}/{}", bucket, object)),
        }
    }

    fn public_url(&self, bucket: &str, object: &str) -> String {
        format!("gs://{}/{}", bucket, object)
    }
}

// ═══════════════════════════════════════════════════════════════════════
// Cloud Storage JSON API
// ═══════════════════════════════════════════════════════════════════════

/// Cloud Storage over its JSON API.
///
/// Reads an OAuth access token from the environment variable named by
/// `storage.token_env` on every request, so rotated tokens are picked up.
pub struct GcsStorage {
    client: reqwest::Client,
    api_base: String,
    token_env: String,
    project_id: String,
    location: String,
}

impl GcsStorage {
    pub fn new(config: &Config) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.storage.timeout_secs))
            .build()?;
        Ok(Self {
            client,
            api_base: config.storage.api_base.trim_end_matches('/').to_string(),
            token_env: config.storage.token_env.clone(),
            project_id: config.project.id.clone(),
            location: config.vector_store.region.clone(),
        })
    }

    fn token(&self) -> Result<String> {
        std::env::var(&self.token_env)
            .with_context(|| format!("{} environment variable not set", self.token_env))
    }

    fn object_url(&self, bucket: &str, object: &str, upload: bool) -> Result<reqwest::Url> {
        let mut url = reqwest::Url::parse(&self.api_base)?;
        {
            let mut segments = url
                .path_segments_mut()
                .map_err(|_| anyhow!("invalid storage api_base {}", self.api_base))?;
            if upload {
                segments.extend(["upload", "storage", "v1", "b", bucket, "o"]);
            } else {
                segments.extend(["storage", "v1", "b", bucket, "o"]);
                if !object.is_empty() {
                    segments.push(object);
                }
            }
        }
        Ok(url)
    }
}

#[async_trait]
impl ObjectStorage for GcsStorage {
    async fn delete_object(&self, bucket: &str, object: &str) -> Result<()> {
        let resp = self
            .client
            .delete(self.object_url(bucket, object, false)?)
            .bearer_auth(self.token()?)
            .send()
            .await?;
        if !resp.status().is_success() && resp.status().as_u16() != 404 {
            let status = resp.status();
            let body = resp.text().await.unwrap_or_default();
            bail!("GCS delete error {}: {}", status, body);
        }
        Ok(())
    }

    async fn create_bucket(&self, bucket: &str, clear: bool) -> Result<()> {
        let mut url = reqwest::Url::parse(&format!("{}/storage/v1/b", self.api_base))?;
        url.query_pairs_mut().append_pair("project", &self.project_id);
        let resp = self
            .client
            .post(url)
            .bearer_auth(self.token()?)
            .json(&serde_json::json!({ "name": bucket, "location": self.location }))
            .send()
            .await?;
        match resp.status().as_u16() {
            200..=299 => {
                tracing::info!(bucket, "created bucket");
                Ok(())
            }
            409 => {
                if clear {
                    let removed = self.clear_bucket(bucket).await?;
                    tracing::info!(bucket, removed, "cleared existing bucket");
                }
                Ok(())
            }
            _ => {
                let status = resp.status();
                let body = resp.text().await.unwrap_or_default();
                bail!("GCS create bucket error {}: {}", status, body)
            }
        }
    }

    async fn clear_bucket(&self, bucket: &str) -> Result<usize> {
        let objects = self.list(bucket, None).await?;
        for obj in &objects {
            self.delete_object(bucket, &obj.name).await?;
        }
        Ok(objects.len())
    }

    async fn list(&self, bucket: &str, prefix: Option<&str>) -> Result<Vec<StoredObject>> {
        let mut objects = Vec::new();
        let mut page_token: Option<String> = None;
        loop {
            let mut url = self.object_url(bucket, "", false)?;
            {
                let mut query = url.query_pairs_mut();
                if let Some(prefix) = prefix {
                    query.append_pair("prefix", prefix);
                }
                if let Some(ref token) = page_token {
                    query.append_pair("pageToken", token);
                }
            }
            let resp = self.client.get(url).bearer_auth(self.token()?).send().await?;
            if !resp.status().is_success() {
                let status = resp.status();
                let body = resp.text().await.unwrap_or_default();
                bail!("GCS list error {}: {}", status, body);
            }
            let json: serde_json::Value = resp.json().await?;
            for item in json
                .get("items")
                .and_then(|i| i.as_array())
                .into_iter()
                .flatten()
            {
                let Some(name) = item.get("name").and_then(|n| n.as_str()) else {
                    continue;
                };
                if name.ends_with('/') {
                    continue;
                }
                let size = item
                    .get("size")
                    .and_then(|s| s.as_str())
                    .and_then(|s| s.parse().ok())
                    .unwrap_or(0);
                objects.push(StoredObject {
                    bucket: bucket.to_string(),
                    name: name.to_string(),
                    size,
                });
            }
            page_token = json
                .get("nextPageToken")
                .and_then(|t| t.as_str())
                .map(String::from);
            if page_token.is_none() {
                break;
            }
        }
        objects.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(objects)
    }

    async fn read(&self, bucket: &str, object: &str) -> Result<Vec<u8>> {
        let mut url = self.object_url(bucket, object, false)?;
        url.query_pairs_mut().append_pair("alt", "media");
        let resp = self.client.get(url).bearer_auth(self.token()?).send().await?;
        if !resp.status().is_success() {
            let status = resp.status();
            let body = resp.text().await.unwrap_or_default();
            bail!("GCS download error {} for gs://{}/{}: {}", status, bucket, object, body);
        }
        Ok(resp.bytes().await?.to_vec())
    }

    async fn write(&self, bucket: &str, object: &str, bytes: Vec<u8>) -> Result<String> {
        let mut url = self.object_url(bucket, object, true)?;
        url.query_pairs_mut()
            .append_pair("uploadType", "media")
            .append_pair("name", object);
        let resp = self
            .client
            .post(url)
            .bearer_auth(self.token()?)
            .header("Content-Type", detect_mime_type(object))
            .body(bytes)
            .send()
            .await?;
        if !resp.status().is_success() {
            let status = resp.status();
            let body = resp.text().await.unwrap_or_default();
            bail!("GCS upload error {}: {}", status, body);
        }
        Ok(format!("gs://{}/{}", bucket, object))
    }

    fn public_url(&self, bucket: &str, object: &str) -> String {
        format!("https://storage.googleapis.com/{}/{}", bucket, object)
    }
}
