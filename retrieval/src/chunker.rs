//! Fixed-size, overlapping text chunking.
//!
//! Sizes and offsets are counted in characters, never bytes, so a chunk
//! boundary can not fall inside a multi-byte character.

use serde::{Deserialize, Serialize};

use crate::error::{Result, RetrievalError};

/// A contiguous slice of a source document.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Chunk {
    /// The chunk text. Never blank.
    pub content: String,

    /// Identifier of the owning document, usually its URI or path.
    pub source_id: String,

    /// Position of this chunk among the chunks of its source.
    pub sequence_index: usize,

    /// Language tag of the source. Advisory only.
    pub language: String,

    /// Character offset of the chunk in the source text.
    pub start_offset: usize,
}

/// Splits text into chunks of at most `chunk_size` characters, where each
/// chunk repeats the last `chunk_overlap` characters of the previous one.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TextChunker {
    chunk_size: usize,
    chunk_overlap: usize,
}

impl TextChunker {
    /// Create a chunker. Fails unless `chunk_overlap < chunk_size`.
    pub fn new(chunk_size: usize, chunk_overlap: usize) -> Result<Self> {
        if chunk_size == 0 {
            return Err(RetrievalError::Chunker(
                "chunk_size must be positive".to_string(),
            ));
        }
        if chunk_overlap >= chunk_size {
            return Err(RetrievalError::Chunker(format!(
                "chunk_overlap ({chunk_overlap}) must be smaller than chunk_size ({chunk_size})"
            )));
        }
        Ok(Self {
            chunk_size,
            chunk_overlap,
        })
    }

    pub fn chunk_size(&self) -> usize {
        self.chunk_size
    }

    pub fn chunk_overlap(&self) -> usize {
        self.chunk_overlap
    }

    fn step(&self) -> usize {
        self.chunk_size - self.chunk_overlap
    }

    /// Upper bound on the number of chunks `text` splits into.
    pub fn max_chunks(&self, text: &str) -> usize {
        text.chars().count().div_ceil(self.step())
    }

    /// Lazily split `text`. Blank text yields nothing.
    ///
    /// The returned iterator can be cloned to restart from its current
    /// position; calling `split` again starts over.
    pub fn split<'a>(&self, text: &'a str) -> impl Iterator<Item = &'a str> + Clone + use<'a> {
        self.spans(text).map(|span| span.text)
    }

    /// Like [`TextChunker::split`], with the character offset of each chunk.
    pub fn spans<'a>(&self, text: &'a str) -> Spans<'a> {
        Spans {
            text,
            byte_start: 0,
            char_start: 0,
            chunk_size: self.chunk_size,
            step: self.step(),
            done: text.trim().is_empty(),
        }
    }

    /// Split a document into [`Chunk`]s, dropping chunks that are only
    /// whitespace.
    pub fn chunk_document(&self, source_id: &str, language: &str, text: &str) -> Vec<Chunk> {
        self.spans(text)
            .filter(|span| !span.text.trim().is_empty())
            .enumerate()
            .map(|(sequence_index, span)| Chunk {
                content: span.text.to_string(),
                source_id: source_id.to_string(),
                sequence_index,
                language: language.to_string(),
                start_offset: span.char_offset,
            })
            .collect()
    }
}

/// One chunk produced by [`Spans`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Span<'a> {
    /// Character offset of the chunk in the source text.
    pub char_offset: usize,

    /// The chunk text.
    pub text: &'a str,
}

/// Iterator over the chunks of one text.
#[derive(Debug, Clone)]
pub struct Spans<'a> {
    text: &'a str,
    byte_start: usize,
    char_start: usize,
    chunk_size: usize,
    step: usize,
    done: bool,
}

impl<'a> Iterator for Spans<'a> {
    type Item = Span<'a>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.done {
            return None;
        }

        let rest = &self.text[self.byte_start..];
        let span = Span {
            char_offset: self.char_start,
            text: rest,
        };

        match byte_offset_of_char(rest, self.chunk_size) {
            // The remainder fits: this is the final chunk.
            None => {
                self.done = true;
                Some(span)
            }
            Some(end) => {
                let advance = byte_offset_of_char(rest, self.step).unwrap_or(rest.len());
                self.byte_start += advance;
                self.char_start += self.step;
                Some(Span {
                    text: &rest[..end],
                    ..span
                })
            }
        }
    }
}

/// Byte offset of the `n`th character of `text`, if `text` has more than
/// `n` characters.
fn byte_offset_of_char(text: &str, n: usize) -> Option<usize> {
    text.char_indices().nth(n).map(|(offset, _)| offset)
}
