use std::path::Path;

use tracing::debug;

use crate::error::{Error, Result};

/// File extensions [`PlainTextExtractor`] reads.
pub const TEXT_EXTENSIONS: &[&str] = &["md", "markdown", "txt"];

/// File extensions [`PdfExtractor`] reads.
pub const PDF_EXTENSIONS: &[&str] = &["pdf"];

/// Every extension [`FileExtractor`] accepts.
pub const SUPPORTED_EXTENSIONS: &[&str] = &["md", "markdown", "txt", "pdf"];

/// Turns a source file into plain text for chunking.
pub trait TextExtractor: Send + Sync {
    fn extract(&self, path: &Path) -> Result<String>;

    /// Whether `path` looks like something this extractor can read.
    fn supports(&self, path: &Path) -> bool;
}

fn has_extension(path: &Path, extensions: &[&str]) -> bool {
    path.extension()
        .and_then(|ext| ext.to_str())
        .is_some_and(|ext| extensions.iter().any(|s| s.eq_ignore_ascii_case(ext)))
}

fn extraction_error(path: &Path, reason: impl Into<String>) -> Error {
    Error::Extraction {
        source_name: path.display().to_string(),
        reason: reason.into(),
    }
}

fn non_empty(path: &Path, text: String) -> Result<String> {
    if text.trim().is_empty() {
        return Err(extraction_error(path, "file contains no text"));
    }
    Ok(text)
}

/// Reads markdown and text files as (lossy) UTF-8.
#[derive(Debug, Clone, Copy, Default)]
pub struct PlainTextExtractor;

impl TextExtractor for PlainTextExtractor {
    fn extract(&self, path: &Path) -> Result<String> {
        if !self.supports(path) {
            return Err(extraction_error(path, "unsupported file type"));
        }

        let bytes =
            std::fs::read(path).map_err(|e| extraction_error(path, e.to_string()))?;
        non_empty(path, String::from_utf8_lossy(&bytes).into_owned())
    }

    fn supports(&self, path: &Path) -> bool {
        has_extension(path, TEXT_EXTENSIONS)
    }
}

/// Extracts the text layer of a PDF, page by page.
///
/// Scanned PDFs without a text layer yield no text and are reported as an
/// extraction failure.
#[derive(Debug, Clone, Copy, Default)]
pub struct PdfExtractor;

impl TextExtractor for PdfExtractor {
    fn extract(&self, path: &Path) -> Result<String> {
        if !self.supports(path) {
            return Err(extraction_error(path, "unsupported file type"));
        }

        let bytes =
            std::fs::read(path).map_err(|e| extraction_error(path, e.to_string()))?;
        // pdf-extract panics on some malformed files.
        let text = std::panic::catch_unwind(|| pdf_extract::extract_text_from_mem(&bytes))
            .map_err(|_| extraction_error(path, "malformed PDF"))?
            .map_err(|e| extraction_error(path, e.to_string()))?;

        debug!(path = %path.display(), chars = text.len(), "extracted PDF text");
        non_empty(path, text)
    }

    fn supports(&self, path: &Path) -> bool {
        has_extension(path, PDF_EXTENSIONS)
    }
}

/// Picks the extractor by file extension: PDFs go to [`PdfExtractor`],
/// markdown and text to [`PlainTextExtractor`].
#[derive(Debug, Clone, Copy, Default)]
pub struct FileExtractor;

impl TextExtractor for FileExtractor {
    fn extract(&self, path: &Path) -> Result<String> {
        if PdfExtractor.supports(path) {
            PdfExtractor.extract(path)
        } else {
            PlainTextExtractor.extract(path)
        }
    }

    fn supports(&self, path: &Path) -> bool {
        has_extension(path, SUPPORTED_EXTENSIONS)
    }
}
