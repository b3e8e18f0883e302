//! Document text extraction.
//!
//! [`read_document`] turns a downloaded file into a list of text blocks
//! (one per PDF page, one per CSV row, one for everything else). Callers
//! clean and chunk the blocks; nothing here interprets sentences.
//!
//! | Extension | Blocks |
//! |-----------|--------|
//! | `txt` | whole file |
//! | `html`, `htm` | whole file, tags stripped |
//! | `csv` | one per row, `header: value` lines |
//! | `pdf` | one per page |
//! | `docx`, `pptx`, `pptm`, `xlsx` | whole document |
//!
//! Extraction never panics on malformed input; the pipeline records the
//! document as not processed and moves on.

use std::io::Read;
use std::path::Path;

use regex::Regex;

pub const MIME_PDF: &str = "application/pdf";
pub const MIME_DOCX: &str =
    "application/vnd.openxmlformats-officedocument.wordprocessingml.document";
pub const MIME_PPTX: &str =
    "application/vnd.openxmlformats-officedocument.presentationml.presentation";
pub const MIME_XLSX: &str = "application/vnd.openxmlformats-officedocument.spreadsheetml.sheet";

/// Maximum sheets to process in an xlsx.
const XLSX_MAX_SHEETS: usize = 100;
/// Maximum cells to process per sheet.
const XLSX_MAX_CELLS_PER_SHEET: usize = 100_000;
/// Maximum decompressed bytes to read from a single ZIP entry (zip-bomb protection).
const MAX_XML_ENTRY_BYTES: u64 = 50 * 1024 * 1024;

#[derive(Debug, thiserror::Error)]
pub enum ExtractError {
    #[error("unsupported document type: {0}")]
    UnsupportedType(String),
    #[error("PDF extraction failed: {0}")]
    Pdf(String),
    #[error("OOXML extraction failed: {0}")]
    Ooxml(String),
    #[error("CSV extraction failed: {0}")]
    Csv(String),
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

/// Lowercased extension of a file name, without the dot.
pub fn file_extension(name: &str) -> String {
    Path::new(name)
        .extension()
        .and_then(|e| e.to_str())
        .unwrap_or("")
        .to_ascii_lowercase()
}

/// MIME type from a file name's extension.
pub fn detect_mime_type(name: &str) -> &'static str {
    match file_extension(name).as_str() {
        "txt" => "text/plain",
        "html" | "htm" => "text/html",
        "csv" => "text/csv",
        "json" => "application/json",
        "jsonl" => "application/jsonl",
        "pdf" => MIME_PDF,
        "docx" => MIME_DOCX,
        "pptx" | "pptm" => MIME_PPTX,
        "xlsx" => MIME_XLSX,
        "png" => "image/png",
        "jpg" | "jpeg" => "image/jpeg",
        "bmp" => "image/bmp",
        "gif" => "image/gif",
        _ => "application/octet-stream",
    }
}

/// Read a document into raw text blocks by its extension.
pub fn read_document(name: &str, path: &Path) -> Result<Vec<String>, ExtractError> {
    let ext = file_extension(name);
    match ext.as_str() {
        "txt" => Ok(vec![read_utf8(path)?]),
        "html" | "htm" => Ok(vec![html_to_text(&read_utf8(path)?)]),
        "csv" => read_csv_rows(path),
        "pdf" => pdf_page_texts(&std::fs::read(path)?),
        "docx" => Ok(vec![extract_docx(&std::fs::read(path)?)?]),
        "pptx" | "pptm" => Ok(vec![extract_pptx(&std::fs::read(path)?)?]),
        "xlsx" => Ok(vec![extract_xlsx(&std::fs::read(path)?)?]),
        _ => Err(ExtractError::UnsupportedType(ext)),
    }
}

fn read_utf8(path: &Path) -> Result<String, ExtractError> {
    let bytes = std::fs::read(path)?;
    Ok(String::from_utf8_lossy(&bytes).into_owned())
}

// ═══════════════════════════════════════════════════════════════════════
// HTML and CSV
// ═══════════════════════════════════════════════════════════════════════

/// Strip markup, scripts, and styles from an HTML page.
pub fn html_to_text(html: &str) -> String {
    let mut text = html.to_string();
    for pattern in [
        r"(?is)<script\b.*?</script>",
        r"(?is)<style\b.*?</style>",
        r"(?s)<!--.*?-->",
    ] {
        if let Ok(re) = Regex::new(pattern) {
            text = re.replace_all(&text, " ").into_owned();
        }
    }
    if let Ok(block) = Regex::new(r"(?i)</?(p|div|br|li|h[1-6]|tr|section|article)\b[^>]*>") {
        text = block.replace_all(&text, "\n").into_owned();
    }
    if let Ok(tag) = Regex::new(r"(?s)<[^>]*>") {
        text = tag.replace_all(&text, " ").into_owned();
    }
    decode_entities(&text)
}

fn decode_entities(text: &str) -> String {
    text.replace("&nbsp;", " ")
        .replace("&lt;", "<")
        .replace("&gt;", ">")
        .replace("&quot;", "\"")
        .replace("&#39;", "'")
        .replace("&apos;", "'")
        .replace("&amp;", "&")
}

/// One block per row, each line `header: value`.
fn read_csv_rows(path: &Path) -> Result<Vec<String>, ExtractError> {
    let mut reader = csv::ReaderBuilder::new()
        .flexible(true)
        .from_path(path)
        .map_err(|e| ExtractError::Csv(e.to_string()))?;
    let headers = reader
        .headers()
        .map_err(|e| ExtractError::Csv(e.to_string()))?
        .clone();

    let mut rows = Vec::new();
    for record in reader.records() {
        let record = record.map_err(|e| ExtractError::Csv(e.to_string()))?;
        let lines: Vec<String> = record
            .iter()
            .enumerate()
            .map(|(i, value)| match headers.get(i) {
                Some(header) => format!("{}: {}", header.trim(), value.trim()),
                None => value.trim().to_string(),
            })
            .collect();
        rows.push(lines.join("\n"));
    }
    Ok(rows)
}

// ═══════════════════════════════════════════════════════════════════════
// PDF
// ═══════════════════════════════════════════════════════════════════════

/// Split a PDF into standalone single-page documents, in page order.
pub fn split_pdf_pages(bytes: &[u8]) -> Result<Vec<Vec<u8>>, ExtractError> {
    let doc = lopdf::Document::load_mem(bytes).map_err(|e| ExtractError::Pdf(e.to_string()))?;
    let page_numbers: Vec<u32> = doc.get_pages().keys().copied().collect();

    let mut pages = Vec::with_capacity(page_numbers.len());
    for &keep in &page_numbers {
        let mut single = doc.clone();
        let others: Vec<u32> = page_numbers.iter().copied().filter(|&p| p != keep).collect();
        single.delete_pages(&others);
        single.prune_objects();
        let mut out = Vec::new();
        single
            .save_to(&mut out)
            .map_err(|e| ExtractError::Pdf(e.to_string()))?;
        pages.push(out);
    }
    Ok(pages)
}

/// Text of each page of a PDF.
pub fn pdf_page_texts(bytes: &[u8]) -> Result<Vec<String>, ExtractError> {
    let pages = split_pdf_pages(bytes)?;
    tracing::debug!(pages = pages.len(), "reading pdf");
    pages.iter().map(|page| extract_pdf(page)).collect()
}

fn extract_pdf(bytes: &[u8]) -> Result<String, ExtractError> {
    pdf_extract::extract_text_from_mem(bytes).map_err(|e| ExtractError::Pdf(e.to_string()))
}

// ═══════════════════════════════════════════════════════════════════════
// OOXML
// ═══════════════════════════════════════════════════════════════════════

fn read_zip_entry_bounded(
    archive: &mut zip::ZipArchive<std::io::Cursor<&[u8]>>,
    name: &str,
    max_bytes: u64,
) -> Result<Vec<u8>, ExtractError> {
    let entry = archive
        .by_name(name)
        .map_err(|e| ExtractError::Ooxml(e.to_string()))?;
    let mut out = Vec::new();
    entry
        .take(max_bytes)
        .read_to_end(&mut out)
        .map_err(|e| ExtractError::Ooxml(e.to_string()))?;
    if out.len() as u64 >= max_bytes {
        return Err(ExtractError::Ooxml(format!(
            "ZIP entry {} exceeds size limit ({} bytes)",
            name, max_bytes
        )));
    }
    Ok(out)
}

fn open_zip(bytes: &[u8]) -> Result<zip::ZipArchive<std::io::Cursor<&[u8]>>, ExtractError> {
    zip::ZipArchive::new(std::io::Cursor::new(bytes)).map_err(|e| ExtractError::Ooxml(e.to_string()))
}

/// Paragraphs of a Word document, one per line.
fn extract_docx(bytes: &[u8]) -> Result<String, ExtractError> {
    let mut archive = open_zip(bytes)?;
    let xml = read_zip_entry_bounded(&mut archive, "word/document.xml", MAX_XML_ENTRY_BYTES)?;
    collect_text_runs(&xml, Some(b"p"))
}

fn extract_pptx(bytes: &[u8]) -> Result<String, ExtractError> {
    let mut archive = open_zip(bytes)?;
    let mut slide_names: Vec<String> = archive
        .file_names()
        .filter(|n| n.starts_with("ppt/slides/slide") && n.ends_with(".xml"))
        .map(String::from)
        .collect();
    slide_names.sort_by_key(|name| numbered_part(name, "ppt/slides/slide"));

    let mut slides = Vec::new();
    for name in slide_names {
        let xml = read_zip_entry_bounded(&mut archive, &name, MAX_XML_ENTRY_BYTES)?;
        let text = collect_text_runs(&xml, Some(b"p"))?;
        if !text.is_empty() {
            slides.push(text);
        }
    }
    Ok(slides.join("\n"))
}

fn numbered_part(name: &str, prefix: &str) -> u32 {
    name.trim_start_matches(prefix)
        .trim_end_matches(".xml")
        .parse::<u32>()
        .unwrap_or(u32::MAX)
}

/// Concatenate `<t>` runs; a newline ends each `paragraph` element.
fn collect_text_runs(xml: &[u8], paragraph: Option<&[u8]>) -> Result<String, ExtractError> {
    use quick_xml::events::Event;

    let mut out = String::new();
    let mut reader = quick_xml::Reader::from_reader(xml);
    let mut buf = Vec::new();
    let mut in_text = false;
    loop {
        match reader.read_event_into(&mut buf) {
            Ok(Event::Start(e)) if e.local_name().as_ref() == b"t" => in_text = true,
            Ok(Event::Text(te)) if in_text => {
                out.push_str(te.unescape().unwrap_or_default().as_ref());
            }
            Ok(Event::End(e)) => {
                let name = e.local_name();
                if name.as_ref() == b"t" {
                    in_text = false;
                } else if paragraph == Some(name.as_ref()) && !out.ends_with('\n') {
                    out.push('\n');
                }
            }
            Ok(Event::Eof) => break,
            Err(e) => return Err(ExtractError::Ooxml(e.to_string())),
            _ => {}
        }
        buf.clear();
    }
    Ok(out.trim_end().to_string())
}

fn extract_xlsx(bytes: &[u8]) -> Result<String, ExtractError> {
    let mut archive = open_zip(bytes)?;
    let shared_strings = read_shared_strings(&mut archive)?;
    let mut sheet_names: Vec<String> = archive
        .file_names()
        .filter(|n| n.starts_with("xl/worksheets/sheet") && n.ends_with(".xml"))
        .map(String::from)
        .collect();
    sheet_names.sort_by_key(|name| numbered_part(name, "xl/worksheets/sheet"));

    let mut sheets = Vec::new();
    for name in sheet_names.into_iter().take(XLSX_MAX_SHEETS) {
        let xml = read_zip_entry_bounded(&mut archive, &name, MAX_XML_ENTRY_BYTES)?;
        sheets.push(extract_sheet_cells(&xml, &shared_strings)?);
    }
    Ok(sheets.join("\n"))
}

fn read_shared_strings(
    archive: &mut zip::ZipArchive<std::io::Cursor<&[u8]>>,
) -> Result<Vec<String>, ExtractError> {
    if archive.by_name("xl/sharedStrings.xml").is_err() {
        return Ok(Vec::new());
    }
    let xml = read_zip_entry_bounded(archive, "xl/sharedStrings.xml", MAX_XML_ENTRY_BYTES)?;
    Ok(collect_text_runs(&xml, Some(b"si"))?
        .lines()
        .map(String::from)
        .collect())
}

fn extract_sheet_cells(xml: &[u8], shared_strings: &[String]) -> Result<String, ExtractError> {
    use quick_xml::events::Event;

    let mut cells: Vec<String> = Vec::new();
    let mut reader = quick_xml::Reader::from_reader(xml);
    let mut buf = Vec::new();
    let mut in_value = false;
    let mut shared = false;
    while cells.len() < XLSX_MAX_CELLS_PER_SHEET {
        match reader.read_event_into(&mut buf) {
            Ok(Event::Start(e)) if e.local_name().as_ref() == b"c" => {
                shared = e.attributes().flatten().any(|a| {
                    a.key.as_ref() == b"t" && a.value.as_ref() == b"s"
                });
            }
            Ok(Event::Start(e)) if e.local_name().as_ref() == b"v" => in_value = true,
            Ok(Event::Text(te)) if in_value => {
                let raw = te.unescape().unwrap_or_default();
                let value = raw.trim();
                if shared {
                    if let Some(s) = value.parse::<usize>().ok().and_then(|i| shared_strings.get(i)) {
                        cells.push(s.clone());
                    }
                } else if !value.is_empty() {
                    cells.push(value.to_string());
                }
            }
            Ok(Event::End(e)) if e.local_name().as_ref() == b"v" => in_value = false,
            Ok(Event::Eof) => break,
            Err(e) => return Err(ExtractError::Ooxml(e.to_string())),
            _ => {}
        }
        buf.clear();
    }
    Ok(cells.join(" "))
}
