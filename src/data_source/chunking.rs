//! Document chunking.
//!
//! Text mode reads a document into pages, cleans each page, and splits the
//! joined text into sentence windows (see `rag_harness_core::text`).
//!
//! Multimodal mode turns each PDF page into a PNG plus a single-page PDF,
//! both uploaded next to the source document under a per-run folder:
//!
//! ```text
//! gs://bucket/movies/alien.pdf
//!   → gs://bucket/movies/alien_1718000000000_4821/alien_0.png
//!   → gs://bucket/movies/alien_1718000000000_4821/alien_0.pdf
//! ```
//!
//! Raster images become a single chunk pointing at the original file.
//! Failures in either mode are logged and produce no chunks; they never
//! abort the build.

use std::path::Path;
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use async_trait::async_trait;
use base64::Engine as _;
use rand::Rng;
use rag_harness_core::text::{chunk_pages, clean_text, contextual_text, TextChunks};

use super::DataSourceFile;
use crate::config::RetrievalConfig;
use crate::extract::{pdf_page_texts, read_document, split_pdf_pages};
use crate::storage::{ObjectStorage, StorageUrl};

/// Raster image extensions accepted in multimodal mode.
pub const IMAGE_EXTENSIONS: &[&str] = &["png", "jpeg", "jpg", "bmp", "gif"];

/// One page (or image) ready for multimodal embedding.
#[derive(Debug, Clone, PartialEq)]
pub struct MultimodalChunk {
    /// Zero-based page within the source document.
    pub page: usize,
    /// PNG (or original image) bytes.
    pub image: Vec<u8>,
    pub image_url: String,
    pub text: String,
}

impl MultimodalChunk {
    pub fn image_b64(&self) -> String {
        base64::engine::general_purpose::STANDARD.encode(&self.image)
    }
}

/// Renders a single-page PDF to PNG bytes.
#[async_trait]
pub trait PageRasterizer: Send + Sync {
    async fn rasterize(&self, page_pdf: &[u8]) -> Result<Vec<u8>>;
}

/// Rasterizes with poppler's `pdftoppm`.
pub struct PdftoppmRasterizer {
    program: String,
    dpi: u32,
}

impl PdftoppmRasterizer {
    pub fn new() -> Self {
        Self {
            program: "pdftoppm".to_string(),
            dpi: 150,
        }
    }
}

impl Default for PdftoppmRasterizer {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl PageRasterizer for PdftoppmRasterizer {
    async fn rasterize(&self, page_pdf: &[u8]) -> Result<Vec<u8>> {
        let dir = tempfile::tempdir()?;
        let input = dir.path().join("page.pdf");
        let prefix = dir.path().join("page");
        tokio::fs::write(&input, page_pdf).await?;

        let output = tokio::process::Command::new(&self.program)
            .arg("-png")
            .arg("-r")
            .arg(self.dpi.to_string())
            .arg("-singlefile")
            .arg(&input)
            .arg(&prefix)
            .output()
            .await
            .with_context(|| format!("Failed to run {}", self.program))?;
        if !output.status.success() {
            bail!(
                "{} failed: {}",
                self.program,
                String::from_utf8_lossy(&output.stderr).trim()
            );
        }
        let png = tokio::fs::read(prefix.with_extension("png")).await?;
        Ok(png)
    }
}

/// Splits downloaded files into chunks.
pub struct DocumentChunker {
    storage: Arc<dyn ObjectStorage>,
    rasterizer: Arc<dyn PageRasterizer>,
    sentence_window: usize,
    contextual_max_chars: usize,
}

impl DocumentChunker {
    pub fn new(
        storage: Arc<dyn ObjectStorage>,
        rasterizer: Arc<dyn PageRasterizer>,
        retrieval: &RetrievalConfig,
    ) -> Self {
        Self {
            storage,
            rasterizer,
            sentence_window: retrieval.sentence_window,
            contextual_max_chars: retrieval.contextual_text_max_chars,
        }
    }

    /// Sentence windows for a document, or `None` if nothing readable was
    /// extracted.
    pub async fn chunk_text(&self, file: &DataSourceFile) -> Option<TextChunks> {
        tracing::info!(doc = %file.name, "generating index data");
        let name = file.name.clone();
        let path = file.local_path.clone();
        let pages = match tokio::task::spawn_blocking(move || read_document(&name, &path)).await {
            Ok(Ok(pages)) => pages,
            Ok(Err(e)) => {
                tracing::warn!(doc = %file.name, error = %e, "error reading doc");
                return None;
            }
            Err(e) => {
                tracing::warn!(doc = %file.name, error = %e, "document reader panicked");
                return None;
            }
        };

        let chunks = chunks_from_pages(&pages, self.sentence_window);
        match &chunks {
            Some(c) => tracing::info!(doc = %file.name, chunks = c.len(), "generated text chunks"),
            None => tracing::warn!(doc = %file.name, "all extracted pages are empty"),
        }
        chunks
    }

    /// Page chunks for a PDF or raster image. Other types yield nothing.
    pub async fn chunk_multimodal(&self, file: &DataSourceFile) -> Vec<MultimodalChunk> {
        let ext = file.extension();
        if ext != "pdf" && !IMAGE_EXTENSIONS.contains(&ext.as_str()) {
            tracing::warn!(doc = %file.name, "must be a PDF, PNG, JPG, BMP, or GIF");
            return Vec::new();
        }
        let result = if ext == "pdf" {
            self.chunk_pdf_pages(file).await
        } else {
            self.chunk_image(file).await
        };
        match result {
            Ok(chunks) => chunks,
            Err(e) => {
                tracing::warn!(doc = %file.name, error = %e, "error processing doc");
                Vec::new()
            }
        }
    }

    async fn chunk_pdf_pages(&self, file: &DataSourceFile) -> Result<Vec<MultimodalChunk>> {
        let bytes = tokio::fs::read(&file.local_path).await?;
        let pages = tokio::task::spawn_blocking(move || split_pdf_pages(&bytes)).await??;
        let (bucket, folder) = upload_folder(file)?;
        let stem = file_stem(&file.name);

        let mut chunks = Vec::with_capacity(pages.len());
        for (i, page_pdf) in pages.into_iter().enumerate() {
            let png = self.rasterizer.rasterize(&page_pdf).await?;
            let text = self.page_contextual_text(page_pdf.clone()).await;

            let png_url = self
                .storage
                .write(&bucket, &format!("{}/{}_{}.png", folder, stem, i), png.clone())
                .await?;
            self.storage
                .write(&bucket, &format!("{}/{}_{}.pdf", folder, stem, i), page_pdf)
                .await?;

            chunks.push(MultimodalChunk {
                page: i,
                image: png,
                image_url: png_url,
                text,
            });
        }
        tracing::info!(doc = %file.name, pages = chunks.len(), folder = %folder, "generated page chunks");
        Ok(chunks)
    }

    async fn chunk_image(&self, file: &DataSourceFile) -> Result<Vec<MultimodalChunk>> {
        let image = tokio::fs::read(&file.local_path).await?;
        let image_url = file.gcs_path.clone().unwrap_or_else(|| file.src_url.clone());
        Ok(vec![MultimodalChunk {
            page: 0,
            image,
            image_url,
            text: String::new(),
        }])
    }

    /// Anchor sentences of one page, truncated.
    async fn page_contextual_text(&self, page_pdf: Vec<u8>) -> String {
        let pages = match tokio::task::spawn_blocking(move || pdf_page_texts(&page_pdf)).await {
            Ok(Ok(pages)) => pages,
            _ => return String::new(),
        };
        chunks_from_pages(&pages, self.sentence_window)
            .map(|c| contextual_text(&c, self.contextual_max_chars))
            .unwrap_or_default()
    }
}

/// Clean pages, split into windows, and drop windows whose anchor is blank.
pub fn chunks_from_pages(pages: &[String], padding: usize) -> Option<TextChunks> {
    let cleaned: Vec<String> = pages.iter().map(|p| clean_text(p)).collect();
    let chunks = chunk_pages(&cleaned, padding)?;
    let (windows, sentences): (Vec<_>, Vec<_>) = chunks
        .windows
        .into_iter()
        .zip(chunks.sentences)
        .filter(|(_, sentence)| !sentence.trim().is_empty())
        .unzip();
    if windows.is_empty() {
        None
    } else {
        Some(TextChunks { windows, sentences })
    }
}

fn file_stem(name: &str) -> String {
    Path::new(name)
        .file_stem()
        .and_then(|s| s.to_str())
        .unwrap_or("doc")
        .to_string()
}

/// Bucket and unique folder for a document's page uploads.
fn upload_folder(file: &DataSourceFile) -> Result<(String, String)> {
    let url = file.gcs_path.as_deref().unwrap_or(&file.src_url);
    let parsed = StorageUrl::parse(url)
        .with_context(|| format!("Invalid Doc URL: {}", url))?;
    let millis = chrono::Utc::now().timestamp_millis();
    let suffix: u32 = rand::rng().random_range(1000..=9999);
    let run = format!("{}_{}_{}", file_stem(&file.name), millis, suffix);
    let folder = match parsed.folder() {
        Some(parent) if !parent.is_empty() => format!("{}/{}", parent, run),
        _ => run,
    };
    Ok((parsed.bucket, folder))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::LocalStorage;
    use lopdf::content::{Content, Operation};
    use lopdf::{dictionary, Document, Object, Stream};
    use serde_json::Map;
    use std::path::PathBuf;

    struct FakeRasterizer;

    #[async_trait]
    impl PageRasterizer for FakeRasterizer {
        async fn rasterize(&self, page_pdf: &[u8]) -> Result<Vec<u8>> {
            Ok(format!("png:{}", page_pdf.len()).into_bytes())
        }
    }

    fn pdf_with_pages(texts: &[&str]) -> Vec<u8> {
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

    fn local_file(dir: &Path, name: &str, bytes: &[u8]) -> DataSourceFile {
        let local_path = dir.join(name);
        std::fs::write(&local_path, bytes).unwrap();
        DataSourceFile {
            name: name.to_string(),
            src_url: format!("gs://docs/movies/{}", name),
            local_path,
            gcs_path: Some(format!("gs://docs/movies/{}", name)),
            mime_type: crate::extract::detect_mime_type(name).to_string(),
            metadata: Map::new(),
        }
    }

    fn chunker(root: PathBuf) -> DocumentChunker {
        DocumentChunker::new(
            Arc::new(LocalStorage::new(root)),
            Arc::new(FakeRasterizer),
            &RetrievalConfig::default(),
        )
    }

    #[test]
    fn test_chunks_from_pages_drops_blank_pages() {
        let pages = vec!["  \u{0007} ".to_string(), "One. Two. Three.".to_string()];
        let chunks = chunks_from_pages(&pages, 1).unwrap();
        assert_eq!(chunks.sentences, vec!["One.", "Two.", "Three."]);
        assert_eq!(chunks.windows[1], "One. Two. Three.");
        assert!(chunks_from_pages(&["\n\t".to_string()], 1).is_none());
    }

    #[tokio::test]
    async fn test_chunk_text_file() {
        let dir = tempfile::tempdir().unwrap();
        let file = local_file(dir.path(), "a.txt", b"Alpha beta. Gamma delta.");
        let chunks = chunker(dir.path().join("buckets")).chunk_text(&file).await.unwrap();
        assert_eq!(chunks.len(), 2);
        assert_eq!(chunks.windows[0], "Alpha beta. Gamma delta.");
    }

    #[tokio::test]
    async fn test_chunk_text_empty_file_is_none() {
        let dir = tempfile::tempdir().unwrap();
        let file = local_file(dir.path(), "blank.txt", b"   \n\n ");
        assert!(chunker(dir.path().join("buckets")).chunk_text(&file).await.is_none());
    }

    #[tokio::test]
    async fn test_multimodal_pdf_uploads_each_page() {
        let dir = tempfile::tempdir().unwrap();
        let file = local_file(dir.path(), "alien.pdf", &pdf_with_pages(&["First page.", "Second page."]));
        let chunks = chunker(dir.path().join("buckets")).chunk_multimodal(&file).await;

        assert_eq!(chunks.len(), 2);
        assert_eq!(chunks[1].page, 1);
        assert!(chunks[0].image_url.starts_with("gs://docs/movies/alien_"));
        assert!(chunks[0].image_url.ends_with("/alien_0.png"));
        assert!(chunks[0].image.starts_with(b"png:"));

        let folder = dir.path().join("buckets/docs/movies");
        let run_dirs: Vec<_> = std::fs::read_dir(&folder).unwrap().flatten().collect();
        assert_eq!(run_dirs.len(), 1);
        assert!(run_dirs[0].path().join("alien_1.pdf").exists());
    }

    #[tokio::test]
    async fn test_multimodal_image_is_single_chunk() {
        let dir = tempfile::tempdir().unwrap();
        let file = local_file(dir.path(), "poster.png", b"\x89PNG fake");
        let chunks = chunker(dir.path().join("buckets")).chunk_multimodal(&file).await;
        assert_eq!(chunks.len(), 1);
        assert_eq!(chunks[0].image_url, "gs://docs/movies/poster.png");
        assert_eq!(chunks[0].image_b64(), "iVBORyBmYWtl");
    }

    #[tokio::test]
    async fn test_multimodal_rejects_other_types() {
        let dir = tempfile::tempdir().unwrap();
        let file = local_file(dir.path(), "notes.txt", b"Text.");
        assert!(chunker(dir.path().join("buckets")).chunk_multimodal(&file).await.is_empty());
    }
}
