use anyhow::{bail, Context, Result};
use lopdf::{Document, Object, ObjectId};
use std::path::Path;

use super::ExtractedText;

/// Extracts each page independently; unreadable pages are logged and skipped.
pub fn extract_pdf(path: &Path) -> Result<ExtractedText> {
    let document =
        Document::load(path).with_context(|| format!("opening PDF {}", path.display()))?;

    let pages = document
        .get_pages()
        .into_iter()
        .map(|(number, page_id)| (number, page_text(&document, number, page_id)));

    Ok(assemble_pages(pages))
}

/// lopdf falls back to the raw bytes (or nothing) when a compressed content
/// stream is corrupt, so each filtered stream is decoded up front.
fn page_text(document: &Document, number: u32, page_id: ObjectId) -> Result<String> {
    for stream_id in document.get_page_contents(page_id) {
        let stream = document
            .get_object(stream_id)
            .and_then(Object::as_stream)
            .with_context(|| format!("content stream {:?} of page {}", stream_id, number))?;
        if stream.filters().is_err() {
            continue;
        }

        match stream.decompressed_content() {
            Ok(data) if data.is_empty() && !stream.content.is_empty() => {
                bail!("content stream {:?} of page {} did not decode", stream_id, number)
            }
            Ok(_) => {}
            Err(e) => bail!("content stream {:?} of page {}: {}", stream_id, number, e),
        }
    }

    Ok(document.extract_text(&[number])?)
}

/// Joins page texts as `[Trang N]` blocks, skipping pages that failed.
pub fn assemble_pages<I>(pages: I) -> ExtractedText
where
    I: IntoIterator<Item = (u32, Result<String>)>,
{
    let mut blocks = Vec::new();
    let mut skipped = 0;

    for (number, page) in pages {
        match page {
            Ok(text) if text.trim().is_empty() => {}
            Ok(text) => blocks.push(format!("[Trang {}]\n{}", number, text.trim())),
            Err(e) => {
                tracing::warn!(page = number, error = %e, "Skipping unreadable PDF page");
                skipped += 1;
            }
        }
    }

    ExtractedText {
        sections: blocks.len(),
        text: blocks.join("\n\n"),
        skipped,
    }
}
