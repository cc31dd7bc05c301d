//! Token counting used to size chunks.
//!
//! The chunker measures every fragment in tokens rather than bytes, so the
//! counting strategy is pluggable: a whitespace word count, the 4-characters
//! per token estimate, or a real HuggingFace tokenizer.

use std::path::Path;

use crate::error::{Error, Result};

/// Approximate characters per token for English text.
pub const CHARS_PER_TOKEN: usize = 4;

/// Counts tokens in a piece of text.
pub trait Tokenizer: Send + Sync {
    fn token_count(&self, text: &str) -> usize;
}

/// Counts whitespace-separated words.
#[derive(Debug, Clone, Copy, Default)]
pub struct WhitespaceTokenizer;

impl Tokenizer for WhitespaceTokenizer {
    fn token_count(&self, text: &str) -> usize {
        text.split_whitespace().count()
    }
}

/// Estimates tokens as `ceil(chars / 4)`.
#[derive(Debug, Clone, Copy, Default)]
pub struct CharEstimateTokenizer;

impl Tokenizer for CharEstimateTokenizer {
    fn token_count(&self, text: &str) -> usize {
        text.chars().count().div_ceil(CHARS_PER_TOKEN)
    }
}

/// A HuggingFace `tokenizer.json` tokenizer.
pub struct HfTokenizer {
    inner: tokenizers::Tokenizer,
}

impl HfTokenizer {
    /// Load a tokenizer from a local `tokenizer.json`.
    pub fn from_file(path: &Path) -> Result<Self> {
        let inner = tokenizers::Tokenizer::from_file(path).map_err(|e| {
            Error::Config(format!(
                "failed to load tokenizer from {}: {e}",
                path.display()
            ))
        })?;
        Ok(Self { inner })
    }

    /// Resolve a tokenizer from a local path (file or directory containing
    /// `tokenizer.json`) or download it from the HuggingFace Hub.
    pub fn from_pretrained(model: &str) -> Result<Self> {
        let local = Path::new(model);
        if local.is_file() {
            return Self::from_file(local);
        }
        if local.is_dir() {
            return Self::from_file(&local.join("tokenizer.json"));
        }

        let api = hf_hub::api::sync::Api::new().map_err(|e| {
            Error::Config(format!("failed to reach HuggingFace Hub: {e}"))
        })?;
        let path = api.model(model.to_string()).get("tokenizer.json").map_err(
            |e| {
                Error::Config(format!(
                    "failed to fetch tokenizer for {model}: {e}"
                ))
            },
        )?;
        Self::from_file(&path)
    }
}

impl Tokenizer for HfTokenizer {
    fn token_count(&self, text: &str) -> usize {
        match self.inner.encode(text, false) {
            Ok(encoding) => encoding.get_ids().len(),
            // Fall back to the estimate rather than report a zero-size text.
            Err(_) => CharEstimateTokenizer.token_count(text),
        }
    }
}

impl std::fmt::Debug for HfTokenizer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HfTokenizer").finish_non_exhaustive()
    }
}

/// Build a tokenizer from its settings name: `words`, `chars` or
/// `hf:<model id or path>`.
pub fn from_setting(name: &str) -> Result<Box<dyn Tokenizer>> {
    match name {
        "words" => Ok(Box::new(WhitespaceTokenizer)),
        "chars" => Ok(Box::new(CharEstimateTokenizer)),
        other => match other.strip_prefix("hf:") {
            Some(model) if !model.is_empty() => {
                Ok(Box::new(HfTokenizer::from_pretrained(model)?))
            }
            _ => Err(Error::Config(format!(
                "unknown tokenizer '{other}' (expected words, chars or hf:<model>)"
            ))),
        },
    }
}
