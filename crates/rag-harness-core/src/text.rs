//! Text cleaning and sentence-window chunking.
//!
//! Each chunk is built around one *anchor* sentence. The anchor alone is
//! embedded, which keeps similarity search precise, while the surrounding
//! *window* (the anchor plus `padding` sentences on each side) is what
//! retrieval displays.
//!
//! ```text
//! sentences:  s0  s1  s2  s3  s4
//! padding=1:      [s1  s2  s3]     window for anchor s2
//! ```
//!
//! Sentence boundaries follow Unicode UAX #29. Whitespace is collapsed
//! before splitting, so joining the sentences of a window with single spaces
//! reproduces the window exactly.

use unicode_segmentation::UnicodeSegmentation;

/// Remove control and unprintable characters while keeping line structure.
///
/// Tabs and runs of spaces collapse to a single space, each line is trimmed,
/// and blank lines are dropped.
pub fn clean_text(text: &str) -> String {
    let filtered: String = text
        .chars()
        .filter(|c| *c == '\n' || *c == '\t' || !(c.is_control() || *c == '\u{FFFD}'))
        .collect();

    filtered
        .lines()
        .map(collapse_whitespace)
        .filter(|line| !line.is_empty())
        .collect::<Vec<_>>()
        .join("\n")
}

/// Collapse every whitespace run (including newlines) to one space and trim.
pub fn collapse_whitespace(text: &str) -> String {
    text.split_whitespace().collect::<Vec<_>>().join(" ")
}

/// Split text into trimmed, non-empty sentences.
pub fn text_to_sentence_list(text: &str) -> Vec<String> {
    let normalized = collapse_whitespace(text);
    normalized
        .split_sentence_bounds()
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(String::from)
        .collect()
}

/// Output of sentence-window chunking for one document.
///
/// `windows[i]` is displayed at retrieval time; `sentences[i]` is embedded.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct TextChunks {
    pub windows: Vec<String>,
    pub sentences: Vec<String>,
}

impl TextChunks {
    pub fn len(&self) -> usize {
        self.windows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.windows.is_empty()
    }
}

/// Build one window per sentence, padded with `padding` neighbors per side.
pub fn sentence_window_split(text: &str, padding: usize) -> TextChunks {
    let sentences = text_to_sentence_list(text);
    let mut windows = Vec::with_capacity(sentences.len());

    for i in 0..sentences.len() {
        let start = i.saturating_sub(padding);
        let end = (i + padding + 1).min(sentences.len());
        windows.push(sentences[start..end].join(" "));
    }

    TextChunks { windows, sentences }
}

/// Chunk already-cleaned page texts into sentence windows.
///
/// Pages are joined with newlines first so a page holding only a title does
/// not become its own tiny chunk. Returns `None` when nothing but whitespace
/// was extracted.
pub fn chunk_pages(pages: &[String], padding: usize) -> Option<TextChunks> {
    let joined = pages.join("\n");
    let chunks = sentence_window_split(&joined, padding);
    if chunks.windows.iter().all(|w| w.trim().is_empty()) {
        None
    } else {
        Some(chunks)
    }
}

/// Summary text stored alongside a multimodal page: the anchor sentences
/// joined by spaces, cut to `max_chars` characters.
pub fn contextual_text(chunks: &TextChunks, max_chars: usize) -> String {
    let joined = chunks
        .sentences
        .iter()
        .map(|s| s.trim())
        .collect::<Vec<_>>()
        .join(" ");
    truncate_chars(&joined, max_chars)
}

/// Truncate on a character boundary.
pub fn truncate_chars(text: &str, max_chars: usize) -> String {
    match text.char_indices().nth(max_chars) {
        Some((byte_idx, _)) => text[..byte_idx].to_string(),
        None => text.to_string(),
    }
}
