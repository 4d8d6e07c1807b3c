//! DOCX and PPTX extraction. Both formats are zip archives of XML parts;
//! text is read from `w:t` / `a:t` runs with `quick-xml`.

use anyhow::{anyhow, Context, Result};
use quick_xml::events::Event;
use quick_xml::Reader;
use std::fs::File;
use std::io::{Read, Seek};
use std::path::Path;
use zip::ZipArchive;

use super::ExtractedText;

const TABLE_MARKER: &str = "[Bảng]";

fn open_archive(path: &Path) -> Result<ZipArchive<File>> {
    let file = File::open(path).with_context(|| format!("opening {}", path.display()))?;
    ZipArchive::new(file).with_context(|| format!("reading archive {}", path.display()))
}

fn read_part<R: Read + Seek>(archive: &mut ZipArchive<R>, name: &str) -> Result<String> {
    let mut part = archive
        .by_name(name)
        .with_context(|| format!("missing part {}", name))?;
    let mut xml = String::new();
    part.read_to_string(&mut xml)?;
    Ok(xml)
}

pub fn extract_docx(path: &Path) -> Result<ExtractedText> {
    let mut archive = open_archive(path)?;
    let xml = read_part(&mut archive, "word/document.xml")?;
    let body = parse_docx_body(&xml)?;

    let mut blocks: Vec<String> = body.paragraphs;
    for table in &body.tables {
        let rows: Vec<String> = table
            .iter()
            .map(|cells| cells.join(" | "))
            .filter(|row| !row.trim_matches(|c| c == '|' || c == ' ').is_empty())
            .collect();
        if !rows.is_empty() {
            blocks.push(format!("{}\n{}", TABLE_MARKER, rows.join("\n")));
        }
    }

    Ok(ExtractedText {
        sections: blocks.len(),
        text: blocks.join("\n\n"),
        skipped: 0,
    })
}

/// Body paragraphs and tables (rows of cell texts) of a DOCX document.
#[derive(Debug, Default, PartialEq)]
pub struct DocxBody {
    pub paragraphs: Vec<String>,
    pub tables: Vec<Vec<Vec<String>>>,
}

/// Parses `word/document.xml`. Paragraphs nested in tables belong to their
/// cell, not to the body paragraph list.
pub fn parse_docx_body(xml: &str) -> Result<DocxBody> {
    let mut reader = Reader::from_str(xml);
    let mut body = DocxBody::default();

    let mut table_depth = 0usize;
    let mut in_text = false;
    let mut paragraph = String::new();
    let mut cell = String::new();
    let mut row: Vec<String> = Vec::new();
    let mut table: Vec<Vec<String>> = Vec::new();

    loop {
        match reader.read_event() {
            Ok(Event::Start(e)) => match e.name().as_ref() {
                b"w:tbl" => {
                    table_depth += 1;
                    if table_depth == 1 {
                        table.clear();
                    }
                }
                b"w:tr" if table_depth == 1 => row.clear(),
                b"w:tc" if table_depth == 1 => cell.clear(),
                b"w:p" => paragraph.clear(),
                b"w:t" => in_text = true,
                _ => {}
            },
            Ok(Event::Empty(e)) => match e.name().as_ref() {
                b"w:tab" => paragraph.push('\t'),
                b"w:br" | b"w:cr" => paragraph.push('\n'),
                _ => {}
            },
            Ok(Event::Text(t)) if in_text => {
                let text = t.unescape()?;
                paragraph.push_str(&text);
            }
            Ok(Event::End(e)) => match e.name().as_ref() {
                b"w:t" => in_text = false,
                b"w:p" => {
                    let text = paragraph.trim();
                    if table_depth == 0 {
                        if !text.is_empty() {
                            body.paragraphs.push(text.to_string());
                        }
                    } else if !text.is_empty() {
                        if !cell.is_empty() {
                            cell.push(' ');
                        }
                        cell.push_str(text);
                    }
                    paragraph.clear();
                }
                b"w:tc" if table_depth == 1 => row.push(std::mem::take(&mut cell)),
                b"w:tr" if table_depth == 1 => table.push(std::mem::take(&mut row)),
                b"w:tbl" => {
                    table_depth = table_depth.saturating_sub(1);
                    if table_depth == 0 && !table.is_empty() {
                        body.tables.push(std::mem::take(&mut table));
                    }
                }
                _ => {}
            },
            Ok(Event::Eof) => break,
            Err(e) => {
                return Err(anyhow!(
                    "malformed document XML at byte {}: {}",
                    reader.buffer_position(),
                    e
                ))
            }
            _ => {}
        }
    }

    Ok(body)
}

/// Slide part names in presentation order (`slide2.xml` before `slide10.xml`).
fn slide_parts<R: Read + Seek>(archive: &ZipArchive<R>) -> Vec<String> {
    let mut slides: Vec<(u32, String)> = archive
        .file_names()
        .filter_map(|name| {
            let number = name
                .strip_prefix("ppt/slides/slide")?
                .strip_suffix(".xml")?
                .parse()
                .ok()?;
            Some((number, name.to_string()))
        })
        .collect();
    slides.sort();
    slides.into_iter().map(|(_, name)| name).collect()
}

pub fn extract_pptx(path: &Path) -> Result<ExtractedText> {
    let mut archive = open_archive(path)?;
    let parts = slide_parts(&archive);

    let mut blocks = Vec::new();
    let mut skipped = 0;

    for (index, part) in parts.iter().enumerate() {
        let number = index + 1;
        let shapes = read_part(&mut archive, part).and_then(|xml| parse_slide_shapes(&xml));
        match shapes {
            Ok(shapes) if shapes.is_empty() => {}
            Ok(shapes) => blocks.push(format!("[Slide {}]\n{}", number, shapes.join("\n"))),
            Err(e) => {
                tracing::warn!(slide = number, error = %e, "Skipping unreadable slide");
                skipped += 1;
            }
        }
    }

    Ok(ExtractedText {
        sections: blocks.len(),
        text: blocks.join("\n\n"),
        skipped,
    })
}

/// Text of each text-bearing shape on a slide; paragraphs inside a shape are
/// joined by newlines.
pub fn parse_slide_shapes(xml: &str) -> Result<Vec<String>> {
    let mut reader = Reader::from_str(xml);
    let mut shapes = Vec::new();

    let mut in_shape = false;
    let mut in_text = false;
    let mut paragraphs: Vec<String> = Vec::new();
    let mut paragraph = String::new();

    loop {
        match reader.read_event() {
            Ok(Event::Start(e)) => match e.name().as_ref() {
                b"p:sp" | b"p:graphicFrame" => {
                    in_shape = true;
                    paragraphs.clear();
                }
                b"a:p" => paragraph.clear(),
                b"a:t" => in_text = true,
                _ => {}
            },
            Ok(Event::Empty(e)) if e.name().as_ref() == b"a:br" => paragraph.push('\n'),
            Ok(Event::Text(t)) if in_text && in_shape => {
                paragraph.push_str(&t.unescape()?);
            }
            Ok(Event::End(e)) => match e.name().as_ref() {
                b"a:t" => in_text = false,
                b"a:p" if in_shape => {
                    paragraphs.push(std::mem::take(&mut paragraph));
                }
                b"p:sp" | b"p:graphicFrame" => {
                    let text = paragraphs.join("\n");
                    if !text.trim().is_empty() {
                        shapes.push(text.trim().to_string());
                    }
                    paragraphs.clear();
                    in_shape = false;
                }
                _ => {}
            },
            Ok(Event::Eof) => break,
            Err(e) => return Err(anyhow!("malformed slide XML: {}", e)),
            _ => {}
        }
    }

    Ok(shapes)
}
