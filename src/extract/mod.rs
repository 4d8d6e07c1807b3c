//! Plain-text extraction from uploaded course documents.
//!
//! Each format lives in its own module and returns raw text; [`extract`]
//! dispatches on the file extension and applies [`clean_text`].

pub mod office;
pub mod pdf;
pub mod text;

use anyhow::{anyhow, Result};
use std::path::Path;

/// Supported document formats, keyed by lower-cased extension.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FileKind {
    Pdf,
    Docx,
    Pptx,
    Text,
    Markdown,
}

impl FileKind {
    pub fn from_path(path: &Path) -> Option<Self> {
        let ext = path.extension()?.to_str()?.to_ascii_lowercase();
        match ext.as_str() {
            "pdf" => Some(FileKind::Pdf),
            "docx" => Some(FileKind::Docx),
            "pptx" => Some(FileKind::Pptx),
            "txt" => Some(FileKind::Text),
            "md" | "markdown" => Some(FileKind::Markdown),
            _ => None,
        }
    }

    pub fn extension(&self) -> &'static str {
        match self {
            FileKind::Pdf => "pdf",
            FileKind::Docx => "docx",
            FileKind::Pptx => "pptx",
            FileKind::Text => "txt",
            FileKind::Markdown => "md",
        }
    }
}

/// Text recovered from a document plus a tally of sections read and skipped.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ExtractedText {
    pub text: String,
    /// Pages, slides or other units that produced text.
    pub sections: usize,
    /// Units that failed to parse and were left out.
    pub skipped: usize,
}

impl ExtractedText {
    pub fn whole(text: String) -> Self {
        let sections = usize::from(!text.trim().is_empty());
        Self {
            text,
            sections,
            skipped: 0,
        }
    }
}

/// Extracts and cleans the text of `path`. Unsupported extensions yield
/// empty text rather than an error.
pub fn extract(path: &Path) -> Result<ExtractedText> {
    if !path.exists() {
        return Err(anyhow!("file not found: {}", path.display()));
    }

    let Some(kind) = FileKind::from_path(path) else {
        tracing::warn!(path = %path.display(), "Unsupported file type, nothing extracted");
        return Ok(ExtractedText::default());
    };

    let mut extracted = match kind {
        FileKind::Pdf => pdf::extract_pdf(path)?,
        FileKind::Docx => office::extract_docx(path)?,
        FileKind::Pptx => office::extract_pptx(path)?,
        FileKind::Text => text::extract_plain(path)?,
        FileKind::Markdown => text::extract_markdown(path)?,
    };
    extracted.text = clean_text(&extracted.text);

    tracing::debug!(
        path = %path.display(),
        chars = extracted.text.chars().count(),
        sections = extracted.sections,
        skipped = extracted.skipped,
        "Extracted text"
    );
    Ok(extracted)
}

fn is_invisible(c: char) -> bool {
    matches!(c, '\0' | '\u{200b}' | '\u{200c}' | '\u{200d}' | '\u{feff}')
}

/// Normalizes extracted text: drops NUL and zero-width characters, collapses
/// whitespace inside lines and keeps at most one blank line between paragraphs.
pub fn clean_text(raw: &str) -> String {
    let normalized = raw.replace("\r\n", "\n").replace('\r', "\n");

    let mut out = String::with_capacity(normalized.len());
    let mut pending_blank = false;

    for line in normalized.lines() {
        let line: String = line.chars().filter(|c| !is_invisible(*c)).collect();
        let collapsed = line.split_whitespace().collect::<Vec<_>>().join(" ");

        if collapsed.is_empty() {
            pending_blank = !out.is_empty();
            continue;
        }

        if !out.is_empty() {
            out.push_str(if pending_blank { "\n\n" } else { "\n" });
        }
        out.push_str(&collapsed);
        pending_blank = false;
    }

    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use tempfile::TempDir;

    #[test]
    fn test_clean_text_preserves_paragraphs() {
        let raw = "  Chương 1\u{200b}:   Giới thiệu \r\n\r\n\r\n\tNội dung\0 chính  \nDòng hai\n\n";
        assert_eq!(
            clean_text(raw),
            "Chương 1: Giới thiệu\n\nNội dung chính\nDòng hai"
        );
    }

    #[test]
    fn test_clean_text_empty() {
        assert_eq!(clean_text(" \n\n \u{feff}\t"), "");
    }

    #[test]
    fn test_file_kind_from_path() {
        assert_eq!(FileKind::from_path(Path::new("a/B.PDF")), Some(FileKind::Pdf));
        assert_eq!(FileKind::from_path(Path::new("slides.pptx")), Some(FileKind::Pptx));
        assert_eq!(FileKind::from_path(Path::new("notes.md")), Some(FileKind::Markdown));
        assert_eq!(FileKind::from_path(Path::new("image.png")), None);
        assert_eq!(FileKind::from_path(Path::new("README")), None);
    }

    #[test]
    fn test_unsupported_extension_is_empty() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("photo.png");
        fs::write(&path, [0u8, 1, 2]).unwrap();

        let extracted = extract(&path).unwrap();
        assert!(extracted.text.is_empty());
    }

    #[test]
    fn test_missing_file_is_error() {
        assert!(extract(Path::new("/nonexistent/file.txt")).is_err());
    }
}
