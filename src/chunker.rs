use serde::{Deserialize, Serialize};

use crate::external::embedding::CHARS_PER_TOKEN;

/// A chunk is an exact slice of the input; `start`/`end` are char offsets.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TextChunk {
    pub text: String,
    pub start: usize,
    pub end: usize,
}

/// Splits text into overlapping windows, preferring paragraph, then
/// sentence, then word boundaries.
#[derive(Debug, Clone, Copy)]
pub struct Chunker {
    window: usize,
    overlap: usize,
}

impl Default for Chunker {
    fn default() -> Self {
        Self::from_tokens(512, 50)
    }
}

impl Chunker {
    /// Sizes given in tokens, converted at four characters per token.
    pub fn from_tokens(chunk_size: usize, chunk_overlap: usize) -> Self {
        Self::from_chars(chunk_size * CHARS_PER_TOKEN, chunk_overlap * CHARS_PER_TOKEN)
    }

    pub fn from_chars(window: usize, overlap: usize) -> Self {
        let window = window.max(1);
        Self {
            window,
            overlap: overlap.min(window / 2),
        }
    }

    pub fn window(&self) -> usize {
        self.window
    }

    pub fn overlap(&self) -> usize {
        self.overlap
    }

    pub fn split(&self, text: &str) -> Vec<TextChunk> {
        let chars: Vec<char> = text.chars().collect();
        let len = chars.len();
        if len == 0 || chars.iter().all(|c| c.is_whitespace()) {
            return Vec::new();
        }

        // Byte offset of every char position, plus the end of the string.
        let mut offsets: Vec<usize> = text.char_indices().map(|(i, _)| i).collect();
        offsets.push(text.len());

        let mut chunks = Vec::new();
        let mut start = 0;

        loop {
            let hard_end = (start + self.window).min(len);
            let end = if hard_end < len {
                self.break_point(&chars, start, hard_end)
            } else {
                hard_end
            };

            chunks.push(TextChunk {
                text: text[offsets[start]..offsets[end]].to_string(),
                start,
                end,
            });

            if end >= len {
                break;
            }

            start = self.next_start(&chars, start, end);
        }

        chunks
    }

    /// Best cut inside the back half of `[start, hard_end)`.
    fn break_point(&self, chars: &[char], start: usize, hard_end: usize) -> usize {
        let search_from = start + (hard_end - start) / 2;

        let paragraph = (search_from..hard_end)
            .rev()
            .find(|&i| i > 0 && chars[i - 1] == '\n' && chars[i] == '\n');
        if let Some(i) = paragraph {
            return i + 1;
        }

        let sentence = (search_from..hard_end).rev().find(|&i| {
            i > 0 && matches!(chars[i - 1], '.' | '!' | '?' | '…') && chars[i].is_whitespace()
        });
        if let Some(i) = sentence {
            return i + 1;
        }

        let word = (search_from..hard_end)
            .rev()
            .find(|&i| chars[i].is_whitespace());
        if let Some(i) = word {
            return i + 1;
        }

        hard_end
    }

    /// Steps back by the overlap, then forward to the next word start so the
    /// next chunk does not open mid-word. Always makes progress.
    fn next_start(&self, chars: &[char], start: usize, end: usize) -> usize {
        let raw = end.saturating_sub(self.overlap).max(start + 1);
        if raw == 0 || chars[raw - 1].is_whitespace() {
            return raw;
        }

        (raw..end)
            .find(|&i| chars[i - 1].is_whitespace() && !chars[i].is_whitespace())
            .unwrap_or(raw)
    }
}
