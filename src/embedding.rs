//! Embedding providers and the vector math the index relies on.
//!
//! Every vector that enters the index is L2-normalised, so similarity is a
//! plain dot product (cosine similarity) and a larger score means a closer
//! match.

use rayon::prelude::*;
use sha2::{Digest, Sha256};

use crate::error::{Error, Result};

/// Dimension of [`HashingEmbedder`] vectors unless configured otherwise.
pub const DEFAULT_HASHING_DIMENSION: usize = 384;

/// Converts text into fixed-length vectors.
///
/// Implementations may block on network or model I/O. `embed_batch` must
/// return one vector per input, in input order.
pub trait EmbeddingProvider: Send + Sync {
    /// Identifier recorded with the index so a model change can be detected.
    fn model_id(&self) -> &str;

    fn embed(&self, text: &str) -> Result<Vec<f32>>;

    fn embed_batch(&self, texts: &[String]) -> Result<Vec<Vec<f32>>> {
        texts.par_iter().map(|text| self.embed(text)).collect()
    }
}

/// Scale `vector` to unit length in place. Zero vectors are left untouched.
pub fn normalize(vector: &mut [f32]) {
    let norm = vector.iter().map(|x| x * x).sum::<f32>().sqrt();
    if norm > f32::EPSILON {
        for x in vector.iter_mut() {
            *x /= norm;
        }
    }
}

pub fn dot(a: &[f32], b: &[f32]) -> f32 {
    a.iter().zip(b).map(|(x, y)| x * y).sum()
}

/// Cosine similarity of two vectors of any length; 0.0 if either is zero.
pub fn cosine_similarity(a: &[f32], b: &[f32]) -> f32 {
    let na = dot(a, a).sqrt();
    let nb = dot(b, b).sqrt();
    if na <= f32::EPSILON || nb <= f32::EPSILON {
        return 0.0;
    }
    dot(a, b) / (na * nb)
}

/// Check a provider's output before it reaches the index.
pub(crate) fn check_vectors(
    vectors: &[Vec<f32>],
    expected_len: usize,
    dimension: Option<usize>,
) -> Result<()> {
    if vectors.len() != expected_len {
        return Err(Error::Embedding(format!(
            "provider returned {} vectors for {expected_len} inputs",
            vectors.len()
        )));
    }
    let want = dimension.or_else(|| vectors.first().map(Vec::len));
    for v in vectors {
        if v.is_empty() {
            return Err(Error::Embedding("provider returned an empty vector".into()));
        }
        if Some(v.len()) != want {
            return Err(Error::Embedding(format!(
                "dimension mismatch: expected {}, got {}",
                want.unwrap_or_default(),
                v.len()
            )));
        }
        if v.iter().any(|x| !x.is_finite()) {
            return Err(Error::Embedding(
                "provider returned a non-finite value".into(),
            ));
        }
    }
    Ok(())
}

/// Offline embedder based on feature hashing.
///
/// Each lower-cased alphanumeric word is hashed with SHA-256; the digest
/// picks a bucket and a sign. The result is deterministic across runs and
/// platforms, which makes it suitable as a default and for tests, but it only
/// captures lexical overlap.
#[derive(Debug, Clone)]
pub struct HashingEmbedder {
    dimension: usize,
    model_id: String,
}

impl Default for HashingEmbedder {
    fn default() -> Self {
        Self::new(DEFAULT_HASHING_DIMENSION)
    }
}

impl HashingEmbedder {
    pub fn new(dimension: usize) -> Self {
        let dimension = dimension.max(1);
        Self {
            dimension,
            model_id: format!("hashing-{dimension}"),
        }
    }

    pub fn dimension(&self) -> usize {
        self.dimension
    }
}

impl EmbeddingProvider for HashingEmbedder {
    fn model_id(&self) -> &str {
        &self.model_id
    }

    fn embed(&self, text: &str) -> Result<Vec<f32>> {
        let mut vector = vec![0.0f32; self.dimension];
        let words = text
            .split(|c: char| !c.is_alphanumeric())
            .filter(|w| !w.is_empty());

        for word in words {
            let digest = Sha256::digest(word.to_lowercase().as_bytes());
            let mut bucket = [0u8; 8];
            bucket.copy_from_slice(&digest[..8]);
            let index = (u64::from_le_bytes(bucket) % self.dimension as u64) as usize;
            let sign = if digest[8] & 1 == 0 { 1.0 } else { -1.0 };
            vector[index] += sign;
        }

        normalize(&mut vector);
        Ok(vector)
    }
}
