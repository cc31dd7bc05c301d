//! Flat, exact nearest-neighbour index over normalised chunk embeddings.
//!
//! Records are kept in insertion order and scored by dot product against a
//! normalised query (cosine similarity). Results come back by descending
//! score; equal scores keep insertion order. There is no delete: removing a
//! document means rebuilding the index from the surviving chunks.

use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::{
    chunking::Chunk,
    doc_id::DocumentId,
    embedding::{EmbeddingProvider, check_vectors, dot, normalize},
    error::{Error, Result},
    store,
};

/// Fixed metadata attached to every vector.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChunkMetadata {
    pub chunk_id: usize,
    pub doc_id: DocumentId,
    pub doc_name: String,
    pub title: String,
    pub token_count: usize,
}

impl ChunkMetadata {
    pub fn new(doc_id: DocumentId, doc_name: &str, chunk: &Chunk) -> Self {
        Self {
            chunk_id: chunk.chunk_id,
            doc_id,
            doc_name: doc_name.to_string(),
            title: chunk.title.clone(),
            token_count: chunk.token_count,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct VectorRecord {
    pub vector: Vec<f32>,
    pub metadata: ChunkMetadata,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct VectorIndex {
    dimension: Option<usize>,
    records: Vec<VectorRecord>,
}

impl VectorIndex {
    pub fn new() -> Self {
        Self::default()
    }

    /// Build an index from stored records, checking that every vector has
    /// the same length.
    pub fn from_records(records: Vec<VectorRecord>) -> Result<Self> {
        let dimension = records.first().map(|r| r.vector.len());
        if let Some(bad) = records
            .iter()
            .find(|r| Some(r.vector.len()) != dimension || r.vector.is_empty())
        {
            return Err(Error::Config(format!(
                "vector for {} chunk {} has dimension {}, expected {}",
                bad.metadata.doc_id,
                bad.metadata.chunk_id,
                bad.vector.len(),
                dimension.unwrap_or_default()
            )));
        }
        Ok(Self { dimension, records })
    }

    /// Dimensionality, fixed by the first append. `None` while empty.
    pub fn dimension(&self) -> Option<usize> {
        self.dimension
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    pub fn records(&self) -> &[VectorRecord] {
        &self.records
    }

    /// Embed `texts` and append one record per text.
    ///
    /// All texts are embedded before anything is appended; if the provider
    /// fails or returns malformed vectors the index is unchanged.
    pub fn append(
        &mut self,
        provider: &dyn EmbeddingProvider,
        texts: &[String],
        metadatas: Vec<ChunkMetadata>,
    ) -> Result<()> {
        if texts.len() != metadatas.len() {
            return Err(Error::Config(format!(
                "{} texts but {} metadata entries",
                texts.len(),
                metadatas.len()
            )));
        }
        if texts.is_empty() {
            return Ok(());
        }

        let mut vectors = provider.embed_batch(texts)?;
        check_vectors(&vectors, texts.len(), self.dimension)?;
        for v in &mut vectors {
            normalize(v);
        }

        if self.dimension.is_none() {
            self.dimension = vectors.first().map(Vec::len);
        }
        self.records.extend(
            vectors
                .into_iter()
                .zip(metadatas)
                .map(|(vector, metadata)| VectorRecord { vector, metadata }),
        );
        Ok(())
    }

    /// Embed a query and normalise it, checking it matches the index.
    pub fn embed_query(
        &self,
        provider: &dyn EmbeddingProvider,
        query: &str,
    ) -> Result<Vec<f32>> {
        let mut vector = provider.embed(query)?;
        check_vectors(std::slice::from_ref(&vector), 1, self.dimension)?;
        normalize(&mut vector);
        Ok(vector)
    }

    /// Top `k` records for `query`, best first.
    pub fn search(
        &self,
        provider: &dyn EmbeddingProvider,
        query: &str,
        k: usize,
    ) -> Result<Vec<(&ChunkMetadata, f32)>> {
        if k == 0 || self.is_empty() {
            return Ok(Vec::new());
        }
        let query = self.embed_query(provider, query)?;
        Ok(self.search_vector(&query, k))
    }

    /// Top `k` records for an already normalised query vector.
    pub fn search_vector(
        &self,
        query: &[f32],
        k: usize,
    ) -> Vec<(&ChunkMetadata, f32)> {
        let mut scored: Vec<(usize, f32)> = self
            .records
            .iter()
            .enumerate()
            .map(|(i, r)| (i, dot(&r.vector, query)))
            .collect();

        let by_rank = |a: &(usize, f32), b: &(usize, f32)| {
            b.1.total_cmp(&a.1).then(a.0.cmp(&b.0))
        };
        if k < scored.len() {
            scored.select_nth_unstable_by(k, by_rank);
            scored.truncate(k);
        }
        scored.sort_by(by_rank);

        scored
            .into_iter()
            .map(|(i, score)| (&self.records[i].metadata, score))
            .collect()
    }

    /// Build a fresh index by re-embedding `entries` in order.
    ///
    /// This is the expensive path: its cost is one embedding per entry.
    pub fn rebuild(
        provider: &dyn EmbeddingProvider,
        entries: Vec<(String, ChunkMetadata)>,
    ) -> Result<Self> {
        let (texts, metadatas): (Vec<String>, Vec<ChunkMetadata>) =
            entries.into_iter().unzip();
        let mut index = Self::new();
        index.append(provider, &texts, metadatas)?;
        tracing::info!(
            vectors = index.len(),
            model = provider.model_id(),
            "rebuilt vector index"
        );
        Ok(index)
    }

    /// Persist the index on its own, atomically replacing `path`.
    pub fn save(&self, path: &Path) -> Result<()> {
        store::save_index(path, self)
    }

    /// Load an index saved with [`VectorIndex::save`].
    ///
    /// A missing or corrupt file is an error; callers fall back to
    /// `VectorIndex::default()`.
    pub fn load(path: &Path) -> Result<Self> {
        store::load_index(path)
    }
}
