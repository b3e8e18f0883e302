//! Web source: breadth-first crawl from a start URL.
//!
//! Pages are fetched up to `depth_limit` link hops from the start page,
//! restricted to the start page's host, deduplicated by content hash, and
//! capped at `web.max_pages`. Each fetched page is copied into the engine's
//! downloads bucket (cleared at the start of every crawl) so references keep
//! pointing at a stable copy.

use std::collections::{HashSet, VecDeque};
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use regex::Regex;
use reqwest::Url;
use serde_json::Map;
use sha2::{Digest, Sha256};

use super::{DataSource, DataSourceFile, SourceContext};
use crate::extract::detect_mime_type;
use crate::storage::{downloads_bucket_name, ObjectStorage};

pub struct WebSource {
    storage: Arc<dyn ObjectStorage>,
    bucket: String,
    depth_limit: usize,
    max_pages: usize,
    client: reqwest::Client,
}

impl WebSource {
    pub fn new(
        storage: Arc<dyn ObjectStorage>,
        bucket: String,
        depth_limit: usize,
        max_pages: usize,
        client: reqwest::Client,
    ) -> Self {
        Self {
            storage,
            bucket,
            depth_limit,
            max_pages,
            client,
        }
    }

    /// Source for one engine build. `depth_limit` in the engine params
    /// overrides the configured default.
    pub fn for_engine(ctx: &SourceContext<'_>) -> Result<Self> {
        let depth_limit = ctx
            .engine
            .params
            .get_usize("depth_limit")
            .unwrap_or(ctx.config.web.depth_limit);
        let bucket = downloads_bucket_name(&ctx.config.project.id, &ctx.engine.name)?;
        tracing::info!(depth_limit, bucket = %bucket, "creating web source");
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(ctx.config.web.timeout_secs))
            .user_agent(ctx.config.web.user_agent.clone())
            .build()?;
        Ok(Self::new(
            ctx.storage.clone(),
            bucket,
            depth_limit,
            ctx.config.web.max_pages,
            client,
        ))
    }

    async fn fetch(&self, url: &Url) -> Result<Option<(Vec<u8>, String)>> {
        let resp = self.client.get(url.clone()).send().await?;
        if !resp.status().is_success() {
            tracing::warn!(url = %url, status = %resp.status(), "skipping page");
            return Ok(None);
        }
        let content_type = resp
            .headers()
            .get(reqwest::header::CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .map(|v| v.split(';').next().unwrap_or(v).trim().to_ascii_lowercase())
            .unwrap_or_default();
        let bytes = resp.bytes().await?.to_vec();
        Ok(Some((bytes, content_type)))
    }
}

#[async_trait]
impl DataSource for WebSource {
    fn source_type(&self) -> &str {
        "web"
    }

    async fn download(&self, url: &str, dest: &Path) -> Result<Vec<DataSourceFile>> {
        let start = Url::parse(url).with_context(|| format!("Invalid web URL: {}", url))?;
        self.storage.create_bucket(&self.bucket, true).await?;
        tokio::fs::create_dir_all(dest).await?;

        let mut queue = VecDeque::from([(start.clone(), 0usize)]);
        let mut visited: HashSet<String> = HashSet::from([start.to_string()]);
        let mut seen_content: HashSet<Vec<u8>> = HashSet::new();
        let mut files = Vec::new();

        while let Some((page_url, depth)) = queue.pop_front() {
            if files.len() >= self.max_pages {
                tracing::info!(max_pages = self.max_pages, "crawl page limit reached");
                break;
            }
            let (bytes, content_type) = match self.fetch(&page_url).await {
                Ok(Some(page)) => page,
                Ok(None) => continue,
                Err(e) => {
                    tracing::warn!(url = %page_url, error = %e, "fetch failed");
                    continue;
                }
            };
            if !seen_content.insert(Sha256::digest(&bytes).to_vec()) {
                tracing::debug!(url = %page_url, "duplicate content");
                continue;
            }

            let is_html = content_type.contains("html") || content_type.is_empty();
            if is_html && depth < self.depth_limit {
                for link in extract_links(&page_url, &String::from_utf8_lossy(&bytes)) {
                    if link.host_str() == start.host_str() && visited.insert(link.to_string()) {
                        queue.push_back((link, depth + 1));
                    }
                }
            }

            let name = page_file_name(&page_url, &content_type);
            let local_path = dest.join(&name);
            tokio::fs::write(&local_path, &bytes).await?;
            let gcs_path = self.storage.write(&self.bucket, &name, bytes).await?;
            tracing::debug!(url = %page_url, depth, "downloaded page");

            files.push(DataSourceFile {
                mime_type: detect_mime_type(&name).to_string(),
                name,
                src_url: page_url.to_string(),
                local_path,
                gcs_path: Some(gcs_path),
                metadata: Map::new(),
            });
        }

        tracing::info!(url = %url, pages = files.len(), "crawl complete");
        Ok(files)
    }
}

/// Absolute http(s) links in an HTML page, fragments removed.
pub fn extract_links(base: &Url, html: &str) -> Vec<Url> {
    let Ok(href) = Regex::new(r#"(?i)<a\s[^>]*?href\s*=\s*["']([^"']+)["']"#) else {
        return Vec::new();
    };
    href.captures_iter(html)
        .filter_map(|cap| base.join(cap[1].trim()).ok())
        .filter(|url| matches!(url.scheme(), "http" | "https"))
        .map(|mut url| {
            url.set_fragment(None);
            url
        })
        .collect()
}

/// Flat, filesystem-safe file name for a page URL.
///
/// HTML pages without an `.html`/`.htm` extension get `.html` appended so
/// the extractor recognizes them.
pub fn page_file_name(url: &Url, content_type: &str) -> String {
    let mut name = format!("{}{}", url.host_str().unwrap_or("page"), url.path())
        .trim_end_matches('/')
        .replace(|c: char| !(c.is_ascii_alphanumeric() || c == '.' || c == '-'), "_");
    if let Some(query) = url.query() {
        let digest = Sha256::digest(query.as_bytes());
        name.push_str(&format!("_{:02x}{:02x}{:02x}{:02x}", digest[0], digest[1], digest[2], digest[3]));
    }
    let ext = crate::extract::file_extension(&name);
    let is_html = content_type.contains("html") || content_type.is_empty();
    if is_html && ext != "html" && ext != "htm" {
        name.push_str(".html");
    }
    name
}
