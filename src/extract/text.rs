use anyhow::Result;
use pulldown_cmark::{Event, Options, Parser, Tag};
use std::path::Path;

use super::ExtractedText;

/// Decodes UTF-8, falling back to Latin-1 so legacy files still load.
pub fn decode_text(bytes: &[u8]) -> String {
    match std::str::from_utf8(bytes) {
        Ok(text) => text.trim_start_matches('\u{feff}').to_string(),
        Err(_) => {
            tracing::debug!("Input is not UTF-8, decoding as Latin-1");
            bytes.iter().map(|&b| b as char).collect()
        }
    }
}

pub fn extract_plain(path: &Path) -> Result<ExtractedText> {
    let bytes = std::fs::read(path)?;
    Ok(ExtractedText::whole(decode_text(&bytes)))
}

pub fn extract_markdown(path: &Path) -> Result<ExtractedText> {
    let bytes = std::fs::read(path)?;
    Ok(ExtractedText::whole(markdown_to_text(&decode_text(&bytes))))
}

/// Strips Markdown markup, turning block boundaries into paragraph breaks.
pub fn markdown_to_text(content: &str) -> String {
    let mut options = Options::empty();
    options.insert(Options::ENABLE_TABLES);
    options.insert(Options::ENABLE_STRIKETHROUGH);

    let mut out = String::new();
    for event in Parser::new_ext(content, options) {
        match event {
            Event::Text(text) | Event::Code(text) => out.push_str(&text),
            Event::SoftBreak | Event::HardBreak => out.push('\n'),
            Event::End(Tag::TableCell) => out.push_str(" | "),
            Event::End(Tag::Paragraph)
            | Event::End(Tag::Heading(..))
            | Event::End(Tag::CodeBlock(_))
            | Event::End(Tag::Item)
            | Event::End(Tag::TableHead)
            | Event::End(Tag::TableRow) => out.push_str("\n\n"),
            _ => {}
        }
    }
    out
}
