use std::{
    collections::{BTreeMap, HashSet},
    time::{SystemTime, UNIX_EPOCH},
};

use serde::{Deserialize, Serialize};

use crate::{chunking::Chunk, doc_id::DocumentId};

/// An ingested document.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Document {
    pub doc_id: DocumentId,
    pub name: String,
    /// Seconds since the Unix epoch.
    pub added_at: u64,
    pub chunk_count: usize,
}

pub(crate) fn unix_now() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or_default()
}

/// Live documents keyed by id. Iteration is in id order, which is also
/// insertion order.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DocumentRegistry {
    documents: BTreeMap<DocumentId, Document>,
}

impl DocumentRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a document added now.
    pub fn insert(
        &mut self,
        doc_id: DocumentId,
        name: &str,
        chunk_count: usize,
    ) -> &Document {
        self.insert_document(Document {
            doc_id,
            name: name.to_string(),
            added_at: unix_now(),
            chunk_count,
        })
    }

    /// Register a document as-is, e.g. when read back from storage.
    pub fn insert_document(&mut self, document: Document) -> &Document {
        let doc_id = document.doc_id;
        self.documents.insert(doc_id, document);
        &self.documents[&doc_id]
    }

    pub fn remove(&mut self, doc_id: DocumentId) -> Option<Document> {
        self.documents.remove(&doc_id)
    }

    pub fn get(&self, doc_id: DocumentId) -> Option<&Document> {
        self.documents.get(&doc_id)
    }

    pub fn contains(&self, doc_id: DocumentId) -> bool {
        self.documents.contains_key(&doc_id)
    }

    pub fn all(&self) -> &BTreeMap<DocumentId, Document> {
        &self.documents
    }

    pub fn len(&self) -> usize {
        self.documents.len()
    }

    pub fn is_empty(&self) -> bool {
        self.documents.is_empty()
    }
}

/// Chunk text retained per document so the index can be rebuilt.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ChunkStore {
    chunks: BTreeMap<DocumentId, Vec<Chunk>>,
}

impl ChunkStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Store the chunks of a document, replacing any previous set.
    pub fn put(&mut self, doc_id: DocumentId, chunks: Vec<Chunk>) {
        self.chunks.insert(doc_id, chunks);
    }

    pub fn remove(&mut self, doc_id: DocumentId) -> Option<Vec<Chunk>> {
        self.chunks.remove(&doc_id)
    }

    /// Chunks of `doc_id` in chunk order; empty if the document is unknown.
    pub fn chunks_for(&self, doc_id: DocumentId) -> &[Chunk] {
        self.chunks.get(&doc_id).map(Vec::as_slice).unwrap_or_default()
    }

    pub fn get(&self, doc_id: DocumentId, chunk_id: usize) -> Option<&Chunk> {
        self.chunks_for(doc_id).iter().find(|c| c.chunk_id == chunk_id)
    }

    /// Every document's chunks except those in `excluding`, in id order.
    pub fn all_surviving(
        &self,
        excluding: &HashSet<DocumentId>,
    ) -> BTreeMap<DocumentId, &[Chunk]> {
        self.chunks
            .iter()
            .filter(|(id, _)| !excluding.contains(id))
            .map(|(id, chunks)| (*id, chunks.as_slice()))
            .collect()
    }

    pub fn doc_ids(&self) -> impl Iterator<Item = DocumentId> + '_ {
        self.chunks.keys().copied()
    }

    pub fn total_chunks(&self) -> usize {
        self.chunks.values().map(Vec::len).sum()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{chunking::chunk_text, tokenizer::WhitespaceTokenizer};

    fn id(n: u64) -> DocumentId {
        DocumentId::from_raw(n)
    }

    #[test]
    fn registry_insert_and_remove() {
        let mut registry = DocumentRegistry::new();
        let doc = registry.insert(id(1), "notes.md", 4).clone();
        assert_eq!(doc.name, "notes.md");
        assert_eq!(doc.chunk_count, 4);
        assert!(doc.added_at > 0);
        assert!(registry.contains(id(1)));

        assert_eq!(registry.remove(id(1)), Some(doc));
        assert!(registry.remove(id(1)).is_none());
        assert!(registry.is_empty());
    }

    #[test]
    fn registry_iterates_in_id_order() {
        let mut registry = DocumentRegistry::new();
        registry.insert(id(3), "c", 1);
        registry.insert(id(1), "a", 1);
        registry.insert(id(2), "b", 1);
        let names: Vec<_> =
            registry.all().values().map(|d| d.name.as_str()).collect();
        assert_eq!(names, vec!["a", "b", "c"]);
    }

    #[test]
    fn chunk_store_lookup() {
        let mut store = ChunkStore::new();
        let chunks =
            chunk_text("the cat sat\n\nthe dog ran", 3, 0, &WhitespaceTokenizer);
        store.put(id(1), chunks);

        assert_eq!(store.chunks_for(id(1)).len(), 2);
        assert!(store.chunks_for(id(9)).is_empty());
        assert_eq!(store.get(id(1), 1).unwrap().content, "the dog ran");
        assert!(store.get(id(1), 5).is_none());
        assert_eq!(store.total_chunks(), 2);
    }

    #[test]
    fn all_surviving_excludes() {
        let mut store = ChunkStore::new();
        for n in 1..=3 {
            store.put(id(n), chunk_text("text", 10, 0, &WhitespaceTokenizer));
        }
        let excluded = HashSet::from([id(2)]);
        let surviving = store.all_surviving(&excluded);
        let ids: Vec<_> = surviving.keys().map(|d| d.numeric()).collect();
        assert_eq!(ids, vec![1, 3]);

        assert_eq!(store.all_surviving(&HashSet::new()).len(), 3);
    }
}
