//! Chunking utilities for splitting documents into overlapping segments.
//!
//! Text is split recursively over a priority list of separators (paragraph,
//! line, sentence, word, character). At each level the first separator found
//! in the text is used; fragments that still exceed the chunk size are split
//! again with the next separator, and small neighbouring fragments are merged
//! greedily until the next one would overflow the chunk size. Consecutive
//! chunks share roughly `overlap` tokens of text.
//!
//! Sizes are measured with a pluggable [`Tokenizer`], never in bytes. The
//! chunk size is a target, not a ceiling: a fragment that cannot be split by
//! any remaining separator is emitted whole.

use std::{collections::VecDeque, ops::Range, sync::Arc};

use serde::{Deserialize, Serialize};

use crate::{
    error::{Error, Result},
    tokenizer::Tokenizer,
};

/// Default chunk size in tokens.
pub const DEFAULT_CHUNK_SIZE: usize = 1000;

/// Default overlap between consecutive chunks in tokens.
pub const DEFAULT_CHUNK_OVERLAP: usize = 200;

/// Separators tried in order. The empty string splits between characters.
pub const DEFAULT_SEPARATORS: &[&str] = &["\n\n", "\n", ". ", " ", ""];

/// A chunk of text from a larger document.
///
/// Produced by [`chunk_text`] and [`Chunker::chunk`]. Chunks are immutable
/// once created.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Chunk {
    /// Zero-based index, unique within the owning document.
    pub chunk_id: usize,
    /// Display title, `"Chunk {chunk_id + 1}"`.
    pub title: String,
    /// The chunk text, trimmed of surrounding whitespace.
    pub content: String,
    /// Token count of `content` as measured by the chunker's tokenizer.
    pub token_count: usize,
    /// Byte offset of `content` in the original text.
    pub start_offset: usize,
}

/// Chunking configuration.
///
/// # Examples
///
/// ```
/// use knowbase::chunking::{ChunkingConfig, DEFAULT_CHUNK_OVERLAP, DEFAULT_CHUNK_SIZE};
///
/// let config = ChunkingConfig::default();
/// assert_eq!(config.chunk_size, DEFAULT_CHUNK_SIZE);
/// assert_eq!(config.overlap, DEFAULT_CHUNK_OVERLAP);
/// assert!(config.validate().is_ok());
/// ```
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChunkingConfig {
    /// Target chunk size in tokens.
    pub chunk_size: usize,
    /// Tokens shared between consecutive chunks.
    pub overlap: usize,
    /// Separators in priority order.
    pub separators: Vec<String>,
}

impl Default for ChunkingConfig {
    fn default() -> Self {
        Self::new(DEFAULT_CHUNK_SIZE, DEFAULT_CHUNK_OVERLAP)
    }
}

impl ChunkingConfig {
    /// A configuration using [`DEFAULT_SEPARATORS`].
    pub fn new(chunk_size: usize, overlap: usize) -> Self {
        Self {
            chunk_size,
            overlap,
            separators: DEFAULT_SEPARATORS
                .iter()
                .map(|s| s.to_string())
                .collect(),
        }
    }

    /// Reject sizes the merge step cannot honour.
    pub fn validate(&self) -> Result<()> {
        if self.chunk_size == 0 {
            return Err(Error::Config("chunk_size must be at least 1".into()));
        }
        if self.overlap >= self.chunk_size {
            return Err(Error::Config(format!(
                "chunk_overlap ({}) must be smaller than chunk_size ({})",
                self.overlap, self.chunk_size
            )));
        }
        Ok(())
    }
}

/// Splits text into [`Chunk`]s with a fixed configuration and tokenizer.
#[derive(Clone)]
pub struct Chunker {
    config: ChunkingConfig,
    tokenizer: Arc<dyn Tokenizer>,
}

impl Chunker {
    pub fn new(
        config: ChunkingConfig,
        tokenizer: Arc<dyn Tokenizer>,
    ) -> Result<Self> {
        config.validate()?;
        Ok(Self { config, tokenizer })
    }

    pub fn config(&self) -> &ChunkingConfig {
        &self.config
    }

    pub fn tokenizer(&self) -> &dyn Tokenizer {
        self.tokenizer.as_ref()
    }

    /// Split `text` into ordered chunks. Empty or whitespace-only input
    /// yields no chunks.
    pub fn chunk(&self, text: &str) -> Vec<Chunk> {
        Splitter {
            config: &self.config,
            tokenizer: self.tokenizer.as_ref(),
        }
        .chunk(text)
    }
}

struct Splitter<'a> {
    config: &'a ChunkingConfig,
    tokenizer: &'a dyn Tokenizer,
}

impl Splitter<'_> {
    fn chunk(&self, text: &str) -> Vec<Chunk> {
        if text.trim().is_empty() {
            return Vec::new();
        }

        let separators: Vec<&str> =
            self.config.separators.iter().map(String::as_str).collect();
        let mut ranges = Vec::new();
        self.split(text, 0..text.len(), &separators, &mut ranges);

        let chunks: Vec<Chunk> = ranges
            .into_iter()
            .filter_map(|range| trimmed(text, range))
            .enumerate()
            .map(|(chunk_id, range)| {
                let content = &text[range.clone()];
                Chunk {
                    chunk_id,
                    title: format!("Chunk {}", chunk_id + 1),
                    content: content.to_string(),
                    token_count: self.tokenizer.token_count(content),
                    start_offset: range.start,
                }
            })
            .collect();

        log_stats(&chunks);
        chunks
    }

    fn split(
        &self,
        text: &str,
        span: Range<usize>,
        separators: &[&str],
        out: &mut Vec<Range<usize>>,
    ) {
        let segment = &text[span.clone()];

        // First separator present in the segment wins; "" always applies.
        // If none applies, the whole segment is one unsplittable piece.
        let chosen = separators
            .iter()
            .position(|sep| sep.is_empty() || segment.contains(sep));
        let (pieces, remaining) = match chosen {
            Some(i) => (
                split_keep(segment, separators[i], span.start),
                &separators[i + 1..],
            ),
            None => (vec![span.clone()], &[][..]),
        };

        let mut fitting: Vec<Piece> = Vec::new();
        for range in pieces {
            let tokens = self.tokenizer.token_count(&text[range.clone()]);
            if tokens <= self.config.chunk_size {
                fitting.push(Piece { range, tokens });
                continue;
            }

            if !fitting.is_empty() {
                self.merge(&fitting, out);
                fitting.clear();
            }
            if remaining.is_empty() {
                out.push(range);
            } else {
                self.split(text, range, remaining, out);
            }
        }

        if !fitting.is_empty() {
            self.merge(&fitting, out);
        }
    }

    /// Greedily merge adjacent pieces into windows of at most `chunk_size`
    /// tokens, carrying up to `overlap` tokens into the next window.
    fn merge(&self, pieces: &[Piece], out: &mut Vec<Range<usize>>) {
        let chunk_size = self.config.chunk_size;
        let overlap = self.config.overlap;

        let mut window: VecDeque<&Piece> = VecDeque::new();
        let mut total = 0usize;

        for piece in pieces {
            if total + piece.tokens > chunk_size
                && let Some(range) = window_range(&window)
            {
                out.push(range);

                while total > overlap
                    || (total + piece.tokens > chunk_size && total > 0)
                {
                    let Some(dropped) = window.pop_front() else {
                        break;
                    };
                    total -= dropped.tokens;
                }
            }

            window.push_back(piece);
            total += piece.tokens;
        }

        if let Some(range) = window_range(&window) {
            out.push(range);
        }
    }
}

fn window_range(window: &VecDeque<&Piece>) -> Option<Range<usize>> {
    let first = window.front()?;
    let last = window.back()?;
    Some(first.range.start..last.range.end)
}

impl std::fmt::Debug for Chunker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Chunker")
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

/// Split `text` into ordered, overlapping chunks using the default
/// separators.
///
/// Out-of-range sizes are clamped (`chunk_size >= 1`,
/// `overlap < chunk_size`); use [`Chunker::new`] to reject them instead.
///
/// # Examples
///
/// ```
/// use knowbase::chunking::chunk_text;
/// use knowbase::tokenizer::WhitespaceTokenizer;
///
/// let chunks = chunk_text("the cat sat\n\nthe dog ran", 3, 0, &WhitespaceTokenizer);
/// assert_eq!(chunks.len(), 2);
/// assert_eq!(chunks[0].content, "the cat sat");
/// assert_eq!(chunks[1].title, "Chunk 2");
///
/// assert!(chunk_text("", 3, 0, &WhitespaceTokenizer).is_empty());
/// ```
pub fn chunk_text(
    text: &str,
    chunk_size: usize,
    overlap: usize,
    tokenizer: &dyn Tokenizer,
) -> Vec<Chunk> {
    let chunk_size = chunk_size.max(1);
    let config = ChunkingConfig::new(chunk_size, overlap.min(chunk_size - 1));
    Splitter {
        config: &config,
        tokenizer,
    }
    .chunk(text)
}

#[derive(Debug)]
struct Piece {
    range: Range<usize>,
    tokens: usize,
}

/// Split `segment` at every occurrence of `separator`, keeping the separator
/// at the start of the following piece. Ranges are offset by `base` so they
/// index the original text. Pieces cover the segment without gaps.
fn split_keep(segment: &str, separator: &str, base: usize) -> Vec<Range<usize>> {
    if separator.is_empty() {
        return segment
            .char_indices()
            .map(|(i, c)| base + i..base + i + c.len_utf8())
            .collect();
    }

    let mut pieces = Vec::new();
    let mut last = 0;
    for (idx, _) in segment.match_indices(separator) {
        if idx > last {
            pieces.push(base + last..base + idx);
        }
        last = idx;
    }
    if last < segment.len() {
        pieces.push(base + last..base + segment.len());
    }
    pieces
}

/// Narrow `range` to exclude surrounding whitespace; `None` if nothing is
/// left.
fn trimmed(text: &str, range: Range<usize>) -> Option<Range<usize>> {
    let slice = &text[range.clone()];
    let start = range.start + (slice.len() - slice.trim_start().len());
    let end = range.end - (slice.len() - slice.trim_end().len());
    (start < end).then_some(start..end)
}

fn log_stats(chunks: &[Chunk]) {
    let counts = chunks.iter().map(|c| c.token_count);
    let (Some(min), Some(max)) = (counts.clone().min(), counts.clone().max())
    else {
        return;
    };
    let avg = counts.sum::<usize>() as f64 / chunks.len() as f64;
    tracing::debug!(
        chunks = chunks.len(),
        avg_tokens = format_args!("{avg:.2}"),
        min_tokens = min,
        max_tokens = max,
        "chunked document"
    );
}

#[cfg(test)]
mod tests {
    use proptest::prelude::*;

    use super::*;
    use crate::tokenizer::{CharEstimateTokenizer, WhitespaceTokenizer};

    fn words(chunk_size: usize, overlap: usize) -> Chunker {
        Chunker::new(
            ChunkingConfig::new(chunk_size, overlap),
            Arc::new(WhitespaceTokenizer),
        )
        .unwrap()
    }

    /// Rebuild the text from the non-overlapping part of each chunk.
    fn reconstruct(text: &str, chunks: &[Chunk]) -> String {
        let mut out = String::new();
        let mut covered = 0;
        for chunk in chunks {
            let start = chunk.start_offset;
            let end = start + chunk.content.len();
            if end > covered {
                out.push_str(&text[start.max(covered)..end]);
                covered = end;
            }
        }
        out
    }

    fn strip_ws(s: &str) -> String {
        s.chars().filter(|c| !c.is_whitespace()).collect()
    }

    #[test]
    fn empty_input_yields_nothing() {
        assert!(words(10, 2).chunk("").is_empty());
        assert!(words(10, 2).chunk(" \n\n\t ").is_empty());
    }

    #[test]
    fn short_text_single_chunk() {
        let chunks = words(10, 2).chunk("Hello, world!");
        assert_eq!(chunks.len(), 1);
        assert_eq!(chunks[0].content, "Hello, world!");
        assert_eq!(chunks[0].chunk_id, 0);
        assert_eq!(chunks[0].title, "Chunk 1");
        assert_eq!(chunks[0].token_count, 2);
        assert_eq!(chunks[0].start_offset, 0);
    }

    #[test]
    fn splits_on_paragraphs_first() {
        let text = "the cat sat\n\nthe dog ran";
        let chunks = words(3, 0).chunk(text);
        let contents: Vec<_> = chunks.iter().map(|c| c.content.as_str()).collect();
        assert_eq!(contents, vec!["the cat sat", "the dog ran"]);
        assert_eq!(chunks[1].start_offset, text.find("the dog").unwrap());
        assert_eq!(chunks[1].chunk_id, 1);
        assert_eq!(chunks[1].title, "Chunk 2");
    }

    #[test]
    fn merges_small_paragraphs() {
        let text = "one two\n\nthree\n\nfour five six";
        let chunks = words(10, 0).chunk(text);
        assert_eq!(chunks.len(), 1);
        assert_eq!(chunks[0].content, text);
    }

    #[test]
    fn falls_back_to_words_for_long_paragraphs() {
        let text = (0..30).map(|i| format!("w{i}")).collect::<Vec<_>>().join(" ");
        let chunks = words(10, 0).chunk(&text);
        assert_eq!(chunks.len(), 3);
        for chunk in &chunks {
            assert!(chunk.token_count <= 10);
        }
        assert_eq!(strip_ws(&reconstruct(&text, &chunks)), strip_ws(&text));
    }

    #[test]
    fn consecutive_chunks_overlap() {
        let text = (0..40).map(|i| format!("w{i}")).collect::<Vec<_>>().join(" ");
        let chunks = words(10, 4).chunk(&text);
        assert!(chunks.len() >= 2);

        for pair in chunks.windows(2) {
            let first_end = pair[0].start_offset + pair[0].content.len();
            assert!(
                pair[1].start_offset < first_end,
                "chunks should overlap"
            );
            // The shared region is at most `overlap` tokens.
            let shared = &text[pair[1].start_offset..first_end];
            assert!(WhitespaceTokenizer.token_count(shared) <= 4);
        }
    }

    #[test]
    fn oversized_atomic_unit_is_kept_whole() {
        let long_word = "x".repeat(200);
        let config = ChunkingConfig {
            chunk_size: 10,
            overlap: 0,
            separators: vec!["\n\n".into(), " ".into()],
        };
        let chunker =
            Chunker::new(config, Arc::new(CharEstimateTokenizer)).unwrap();

        let text = format!("short intro\n\n{long_word}");
        let chunks = chunker.chunk(&text);

        assert!(chunks.iter().any(|c| c.content == long_word));
        let big = chunks.iter().find(|c| c.content == long_word).unwrap();
        assert_eq!(big.token_count, 50);
    }

    #[test]
    fn character_fallback_splits_unbroken_text() {
        let text = "a".repeat(100);
        let chunker =
            Chunker::new(ChunkingConfig::new(5, 1), Arc::new(CharEstimateTokenizer))
                .unwrap();
        let chunks = chunker.chunk(&text);
        assert!(chunks.len() > 1);
        for chunk in &chunks {
            assert!(chunk.token_count <= 5);
        }
        assert_eq!(reconstruct(&text, &chunks), text);
    }

    #[test]
    fn handles_multibyte_chars() {
        let text = "café ☕ naïve 日本語 🎉 ".repeat(50);
        let chunker =
            Chunker::new(ChunkingConfig::new(20, 5), Arc::new(CharEstimateTokenizer))
                .unwrap();
        let chunks = chunker.chunk(&text);
        assert!(!chunks.is_empty());
        for chunk in &chunks {
            assert_eq!(
                &text[chunk.start_offset..chunk.start_offset + chunk.content.len()],
                chunk.content
            );
        }
    }

    #[test]
    fn rejects_invalid_config() {
        let tok: Arc<dyn Tokenizer> = Arc::new(WhitespaceTokenizer);
        assert!(Chunker::new(ChunkingConfig::new(0, 0), tok.clone()).is_err());
        assert!(Chunker::new(ChunkingConfig::new(10, 10), tok.clone()).is_err());
        assert!(Chunker::new(ChunkingConfig::new(10, 9), tok).is_ok());
    }

    #[test]
    fn chunk_text_clamps_sizes() {
        let chunks = chunk_text("a b c d e", 0, 5, &WhitespaceTokenizer);
        assert_eq!(chunks.len(), 5);
    }

    proptest! {
        #[test]
        fn chunking_properties(
            text in "[a-z]{1,8}([ .\n]{1,3}[a-z]{1,8}){0,80}",
            chunk_size in 2usize..40,
            overlap_pct in 0usize..90,
        ) {
            let overlap = chunk_size * overlap_pct / 100;
            let chunks = words(chunk_size, overlap.min(chunk_size - 1)).chunk(&text);

            prop_assert!(!chunks.is_empty());
            for (i, chunk) in chunks.iter().enumerate() {
                prop_assert_eq!(chunk.chunk_id, i);
                prop_assert_eq!(
                    chunk.token_count,
                    WhitespaceTokenizer.token_count(&chunk.content)
                );
                prop_assert_eq!(
                    &text[chunk.start_offset..chunk.start_offset + chunk.content.len()],
                    chunk.content.as_str()
                );
            }
            prop_assert_eq!(strip_ws(&reconstruct(&text, &chunks)), strip_ws(&text));
        }
    }
}
