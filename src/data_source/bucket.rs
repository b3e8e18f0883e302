//! Bucket source: every object under a `gs://bucket[/prefix]` URL.

use std::path::Path;
use std::sync::Arc;

use anyhow::Result;
use async_trait::async_trait;
use serde_json::Map;

use super::{DataSource, DataSourceFile};
use crate::extract::detect_mime_type;
use crate::storage::{ObjectStorage, StorageUrl};

pub struct BucketSource {
    storage: Arc<dyn ObjectStorage>,
}

impl BucketSource {
    pub fn new(storage: Arc<dyn ObjectStorage>) -> Self {
        Self { storage }
    }
}

#[async_trait]
impl DataSource for BucketSource {
    fn source_type(&self) -> &str {
        "bucket"
    }

    /// Objects are flattened into `dest` by file name; a later object with
    /// the same name overwrites an earlier one.
    async fn download(&self, url: &str, dest: &Path) -> Result<Vec<DataSourceFile>> {
        let parsed = StorageUrl::parse(url)?;
        let prefix = (!parsed.object.is_empty()).then_some(parsed.object.as_str());
        tracing::info!(url = %url, bucket = %parsed.bucket, "downloading bucket documents");

        let objects = self.storage.list(&parsed.bucket, prefix).await?;
        let mut files = Vec::with_capacity(objects.len());
        for object in objects {
            if object.name.ends_with('/') {
                continue;
            }
            let local_path = dest.join(object.file_name());
            self.storage
                .download(&object.bucket, &object.name, &local_path)
                .await?;
            files.push(DataSourceFile {
                src_url: self.storage.public_url(&object.bucket, &object.name),
                gcs_path: Some(object.gs_url()),
                mime_type: detect_mime_type(&object.name).to_string(),
                name: object.name,
                local_path,
                metadata: Map::new(),
            });
        }
        tracing::debug!(count = files.len(), "downloaded bucket documents");
        Ok(files)
    }
}
