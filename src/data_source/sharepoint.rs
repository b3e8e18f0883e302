//! SharePoint source over Microsoft Graph.
//!
//! URL form: `shpt://{hostname}/sites/{site}[/{folder}]`, e.g.
//! `shpt://acme.sharepoint.com/sites/eng/Specs/2024`.
//!
//! The site's default document library is walked recursively from the
//! folder. Files matching `sharepoint.include_globs` are downloaded, copied
//! into the engine's downloads bucket, and handed to the pipeline.
//!
//! # Environment Variables
//!
//! - the variable named by `sharepoint.token_env` (default
//!   `SHAREPOINT_ACCESS_TOKEN`) holds a Graph bearer token.

use std::path::Path;
use std::sync::Arc;

use anyhow::{anyhow, bail, Context, Result};
use async_trait::async_trait;
use globset::{Glob, GlobSet, GlobSetBuilder};
use serde::Deserialize;
use serde_json::Map;

use super::{DataSource, DataSourceFile, SourceContext};
use crate::extract::detect_mime_type;
use crate::storage::{downloads_bucket_name, ObjectStorage};

/// Parsed `shpt://` URL.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SharePointLocation {
    pub hostname: String,
    /// `sites/{name}` or `teams/{name}`.
    pub site_path: String,
    /// Folder inside the document library, empty for the root.
    pub folder: String,
}

impl SharePointLocation {
    pub fn parse(url: &str) -> Result<Self> {
        let rest = url
            .strip_prefix("shpt://")
            .ok_or_else(|| anyhow!("not a SharePoint URL: {}", url))?;
        let mut parts = rest.trim_end_matches('/').splitn(4, '/');
        let hostname = parts.next().unwrap_or("");
        let kind = parts.next().unwrap_or("");
        let site = parts.next().unwrap_or("");
        if hostname.is_empty() || !matches!(kind, "sites" | "teams") || site.is_empty() {
            bail!("SharePoint URL must look like shpt://host/sites/name[/folder]: {}", url);
        }
        Ok(Self {
            hostname: hostname.to_string(),
            site_path: format!("{}/{}", kind, site),
            folder: parts.next().unwrap_or("").to_string(),
        })
    }
}

#[derive(Debug, Deserialize)]
struct GraphSite {
    id: String,
}

#[derive(Debug, Deserialize)]
struct DriveItemPage {
    value: Vec<DriveItem>,
    #[serde(rename = "@odata.nextLink")]
    next_link: Option<String>,
}

#[derive(Debug, Deserialize)]
struct DriveItem {
    id: String,
    name: String,
    #[serde(rename = "webUrl")]
    web_url: Option<String>,
    folder: Option<serde_json::Value>,
    #[serde(rename = "@microsoft.graph.downloadUrl")]
    download_url: Option<String>,
}

pub struct SharePointSource {
    storage: Arc<dyn ObjectStorage>,
    bucket: String,
    api_base: String,
    token_env: String,
    include: GlobSet,
    client: reqwest::Client,
}

impl SharePointSource {
    pub fn for_engine(ctx: &SourceContext<'_>) -> Result<Self> {
        let bucket = downloads_bucket_name(&ctx.config.project.id, &ctx.engine.name)?;
        Ok(Self {
            storage: ctx.storage.clone(),
            bucket,
            api_base: ctx.config.sharepoint.api_base.trim_end_matches('/').to_string(),
            token_env: ctx.config.sharepoint.token_env.clone(),
            include: build_globset(&ctx.config.sharepoint.include_globs)?,
            client: reqwest::Client::new(),
        })
    }

    fn token(&self) -> Result<String> {
        std::env::var(&self.token_env)
            .with_context(|| format!("{} environment variable not set", self.token_env))
    }

    async fn get_json<T: for<'de> Deserialize<'de>>(&self, url: &str) -> Result<T> {
        let resp = self
            .client
            .get(url)
            .bearer_auth(self.token()?)
            .send()
            .await
            .with_context(|| format!("Graph request failed: {}", url))?;
        let status = resp.status();
        if !status.is_success() {
            let body = resp.text().await.unwrap_or_default();
            bail!("Graph API error ({}): {}", status, body);
        }
        Ok(resp.json().await?)
    }

    /// All files under the folder, depth-first, with their library-relative paths.
    async fn list_files(&self, site_id: &str, folder: &str) -> Result<Vec<(String, DriveItem)>> {
        let mut files = Vec::new();
        let mut pending = vec![(folder.to_string(), self.children_url(site_id, None, folder))];

        while let Some((path, first_url)) = pending.pop() {
            let mut next = Some(first_url);
            while let Some(url) = next {
                let page: DriveItemPage = self.get_json(&url).await?;
                for item in page.value {
                    let rel = if path.is_empty() {
                        item.name.clone()
                    } else {
                        format!("{}/{}", path, item.name)
                    };
                    if item.folder.is_some() {
                        pending.push((rel, self.children_url(site_id, Some(&item.id), "")));
                    } else {
                        files.push((rel, item));
                    }
                }
                next = page.next_link;
            }
        }
        Ok(files)
    }

    fn children_url(&self, site_id: &str, item_id: Option<&str>, folder: &str) -> String {
        match item_id {
            Some(id) => format!("{}/sites/{}/drive/items/{}/children", self.api_base, site_id, id),
            None if folder.is_empty() => {
                format!("{}/sites/{}/drive/root/children", self.api_base, site_id)
            }
            None => format!(
                "{}/sites/{}/drive/root:/{}:/children",
                self.api_base, site_id, folder
            ),
        }
    }
}

#[async_trait]
impl DataSource for SharePointSource {
    fn source_type(&self) -> &str {
        "sharepoint"
    }

    async fn download(&self, url: &str, dest: &Path) -> Result<Vec<DataSourceFile>> {
        let location = SharePointLocation::parse(url)?;
        self.storage.create_bucket(&self.bucket, true).await?;
        tokio::fs::create_dir_all(dest).await?;

        let site: GraphSite = self
            .get_json(&format!(
                "{}/sites/{}:/{}",
                self.api_base, location.hostname, location.site_path
            ))
            .await?;
        let items = self.list_files(&site.id, &location.folder).await?;
        tracing::info!(url = %url, items = items.len(), "listed SharePoint files");

        let mut files = Vec::new();
        for (rel, item) in items {
            if !self.include.is_match(&rel) {
                continue;
            }
            let Some(download_url) = item.download_url else {
                tracing::warn!(file = %rel, "no download URL, skipping");
                continue;
            };
            let resp = self.client.get(&download_url).send().await?;
            if !resp.status().is_success() {
                tracing::warn!(file = %rel, status = %resp.status(), "download failed, skipping");
                continue;
            }
            let bytes = resp.bytes().await?.to_vec();

            let local_path = dest.join(&item.name);
            tokio::fs::write(&local_path, &bytes).await?;
            let gcs_path = self.storage.write(&self.bucket, &rel, bytes).await?;
            files.push(DataSourceFile {
                name: rel.clone(),
                src_url: item.web_url.unwrap_or_else(|| format!("{}/{}", url, rel)),
                local_path,
                gcs_path: Some(gcs_path),
                mime_type: detect_mime_type(&rel).to_string(),
                metadata: Map::new(),
            });
        }
        Ok(files)
    }
}

fn build_globset(patterns: &[String]) -> Result<GlobSet> {
    let mut builder = GlobSetBuilder::new();
    for pattern in patterns {
        builder.add(Glob::new(pattern).with_context(|| format!("Invalid glob: {}", pattern))?);
    }
    Ok(builder.build()?)
}
