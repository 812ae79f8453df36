//! Byte-bounded text chunker.
//!
//! Splits document text into [`Chunk`]s whose UTF-8 encoding fits within
//! `max_bytes`, so each one can be sent to an embedding model with a hard
//! input limit.
//!
//! # Algorithm
//!
//! Text that already fits is returned as a single trimmed chunk. Otherwise
//! the chunker falls back through three tiers:
//!
//! 1. Split on blank lines into paragraphs. Accumulate paragraphs into a
//!    buffer (joined with `\n\n`) and flush the buffer whenever the next
//!    paragraph would push it past `max_bytes`.
//! 2. A paragraph that alone exceeds `max_bytes` is split into sentences
//!    (terminated by `.`, `!`, `?` or `।` followed by whitespace), which go
//!    through the same accumulate-and-flush policy joined with a space.
//! 3. A sentence that alone exceeds `max_bytes` is cut to the last char
//!    boundary at or before `max_bytes` (exactly `max_bytes` for ASCII).
//!    The remainder of that sentence is dropped and the chunk is flagged
//!    with [`Chunk::truncated`].
//!
//! Apart from tier 3, concatenating the chunks in order reproduces the
//! input modulo separator whitespace: nothing is reordered or duplicated.
//!
//! # Example
//!
//! ```rust
//! use patrika_assist_core::chunk::chunk_text;
//!
//! let chunks = chunk_text("First.\n\nSecond.", 1024);
//! assert_eq!(chunks.len(), 1);
//! assert_eq!(chunks[0].text, "First.\n\nSecond.");
//! ```

use sha2::{Digest, Sha256};

use crate::models::Chunk;

/// Characters that end a sentence when followed by whitespace.
const SENTENCE_TERMINATORS: &[char] = &['.', '!', '?', '।'];

/// Suffix appended to shortened previews.
const ELLIPSIS: &str = "...";

/// Split `text` into chunks of at most `max_bytes` UTF-8 bytes.
///
/// Returns an empty vector only when `text` is empty or whitespace. Chunk
/// indices are contiguous from 0 in source order. A `max_bytes` of 0 is
/// treated as 1.
pub fn chunk_text(text: &str, max_bytes: usize) -> Vec<Chunk> {
    let max_bytes = max_bytes.max(1);
    let trimmed = text.trim();
    if trimmed.is_empty() {
        return Vec::new();
    }
    if trimmed.len() <= max_bytes {
        return vec![make_chunk(0, trimmed, false)];
    }

    let mut acc = Accumulator::new(max_bytes);
    for para in split_paragraphs(text) {
        if acc.try_append(para, "\n\n") {
            continue;
        }
        acc.flush();
        if para.len() <= max_bytes {
            acc.start(para);
            continue;
        }
        for sentence in split_sentences(para) {
            if acc.try_append(sentence, " ") {
                continue;
            }
            acc.flush();
            if sentence.len() <= max_bytes {
                acc.start(sentence);
            } else {
                acc.push_truncated(sentence);
            }
        }
    }
    acc.finish()
}

struct Accumulator {
    max_bytes: usize,
    buf: String,
    chunks: Vec<Chunk>,
}

impl Accumulator {
    fn new(max_bytes: usize) -> Self {
        Self {
            max_bytes,
            buf: String::new(),
            chunks: Vec::new(),
        }
    }

    /// Append `piece` to the buffer if the result still fits.
    fn try_append(&mut self, piece: &str, sep: &str) -> bool {
        let would_be = if self.buf.is_empty() {
            piece.len()
        } else {
            self.buf.len() + sep.len() + piece.len()
        };
        if would_be > self.max_bytes {
            return false;
        }
        if !self.buf.is_empty() {
            self.buf.push_str(sep);
        }
        self.buf.push_str(piece);
        true
    }

    fn start(&mut self, piece: &str) {
        debug_assert!(self.buf.is_empty());
        self.buf.push_str(piece);
    }

    fn flush(&mut self) {
        if self.buf.is_empty() {
            return;
        }
        let text = std::mem::take(&mut self.buf);
        self.push(text.trim(), false);
    }

    fn push_truncated(&mut self, sentence: &str) {
        let cut = floor_char_boundary(sentence, self.max_bytes);
        self.push(&sentence[..cut], true);
    }

    fn push(&mut self, text: &str, truncated: bool) {
        if text.is_empty() {
            return;
        }
        let index = self.chunks.len() as i64;
        self.chunks.push(make_chunk(index, text, truncated));
    }

    fn finish(mut self) -> Vec<Chunk> {
        self.flush();
        self.chunks
    }
}

/// Split on blank lines. Returned slices are trimmed and non-empty, and
/// keep their internal single newlines.
fn split_paragraphs(text: &str) -> Vec<&str> {
    let mut out = Vec::new();
    let mut start = 0;
    let mut offset = 0;
    for line in text.split_inclusive('\n') {
        if line.trim().is_empty() {
            let para = text[start..offset].trim();
            if !para.is_empty() {
                out.push(para);
            }
            start = offset + line.len();
        }
        offset += line.len();
    }
    let tail = text[start..].trim();
    if !tail.is_empty() {
        out.push(tail);
    }
    out
}

/// Split a paragraph into trimmed sentences, keeping terminators.
fn split_sentences(para: &str) -> Vec<&str> {
    let mut out = Vec::new();
    let mut start = 0;
    let mut prev_terminal = false;
    for (i, c) in para.char_indices() {
        if prev_terminal && c.is_whitespace() {
            let sentence = para[start..i].trim();
            if !sentence.is_empty() {
                out.push(sentence);
            }
            start = i;
        }
        prev_terminal = SENTENCE_TERMINATORS.contains(&c);
    }
    let tail = para[start..].trim();
    if !tail.is_empty() {
        out.push(tail);
    }
    out
}

/// Largest char boundary `<= index`.
pub fn floor_char_boundary(s: &str, index: usize) -> usize {
    if index >= s.len() {
        return s.len();
    }
    let mut i = index;
    while i > 0 && !s.is_char_boundary(i) {
        i -= 1;
    }
    i
}

/// Hex SHA-256 of `text`.
pub fn content_hash(text: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(text.as_bytes());
    hex::encode(hasher.finalize())
}

/// Deterministic vector id for a chunk: `{source_id}_chunk_{index}_{hash8}`.
///
/// Re-ingesting the same content under the same source id produces the same
/// ids, so upserts overwrite rather than duplicate.
pub fn vector_id(source_id: &str, chunk_index: i64, hash: &str) -> String {
    let short = &hash[..hash.len().min(8)];
    format!("{source_id}_chunk_{chunk_index}_{short}")
}

/// Shorten `text` to at most `max_chars` characters, ending in `...` when
/// anything was cut.
pub fn preview(text: &str, max_chars: usize) -> String {
    if text.chars().count() <= max_chars {
        return text.to_string();
    }
    let keep = max_chars.saturating_sub(ELLIPSIS.len());
    let mut out: String = text.chars().take(keep).collect();
    out.push_str(ELLIPSIS);
    out
}

fn make_chunk(index: i64, text: &str, truncated: bool) -> Chunk {
    Chunk {
        chunk_index: index,
        text: text.to_string(),
        hash: content_hash(text),
        truncated,
    }
}
