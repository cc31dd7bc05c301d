//! The knowledge base: documents in, ranked passages out.
//!
//! All state lives in one [`Snapshot`] (registry, chunk store, vector index)
//! that is loaded at open and saved after every mutation. Mutations run one
//! at a time under a writer lock. Each builds a new snapshot, persists it and
//! only then publishes it, so readers always see either the state before a
//! mutation or the state after it.
//!
//! Several processes may share one file. A mutation holds the file's
//! [`WriteLock`] and first reloads the snapshot if another process saved a
//! newer generation, so ids are never handed out twice and no update is
//! lost. Reads pick up such saves when the file's stamp changes.

use std::{
    collections::{BTreeMap, HashSet},
    path::{Path, PathBuf},
    sync::{Arc, Mutex, MutexGuard, RwLock},
};

use serde::Serialize;
use tracing::{debug, info, warn};

use crate::{
    chunking::{Chunk, Chunker},
    doc_id::DocumentId,
    embedding::EmbeddingProvider,
    error::{Error, Result},
    extract::TextExtractor,
    registry::Document,
    store::{self, FileStamp, Snapshot, WriteLock},
    vector_index::{ChunkMetadata, VectorIndex},
};

/// Default number of results returned by a search.
pub const DEFAULT_TOP_K: usize = 3;

/// Initial over-fetch multiplier for filtered searches.
const OVERFETCH_FACTOR: usize = 2;

/// One ranked passage.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SearchResult {
    pub content: String,
    #[serde(flatten)]
    pub metadata: ChunkMetadata,
    /// Cosine similarity; larger is closer.
    pub score: f32,
}

/// Result of ingesting one document of a batch.
#[derive(Debug)]
pub struct IngestOutcome {
    pub name: String,
    pub result: Result<Document>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Stats {
    pub path: PathBuf,
    pub documents: usize,
    pub chunks: usize,
    pub vectors: usize,
    pub dimension: Option<usize>,
    pub model_id: Option<String>,
}

/// Observer for batch ingestion, called with `(index, total, name)` before
/// each document is processed.
pub type Progress<'a> = &'a mut dyn FnMut(usize, usize, &str);

pub struct KnowledgeBase {
    path: PathBuf,
    state: RwLock<Arc<Snapshot>>,
    writer: Mutex<()>,
    /// Stamp of the file the current snapshot was read from or saved to.
    stamp: Mutex<Option<FileStamp>>,
    chunker: Chunker,
    embedder: Arc<dyn EmbeddingProvider>,
    load_warning: Option<String>,
}

impl KnowledgeBase {
    /// Open the knowledge base stored at `path`.
    ///
    /// A missing file starts an empty knowledge base. A corrupt or
    /// inconsistent file is not fatal: the knowledge base starts empty and
    /// [`load_warning`](Self::load_warning) reports why. If the stored index
    /// was built with a different embedding model, it is rebuilt.
    ///
    /// # Examples
    ///
    /// ```
    /// # let tmp = tempfile::tempdir().unwrap();
    /// use std::sync::Arc;
    /// use knowbase::{Chunker, ChunkingConfig, HashingEmbedder, KnowledgeBase};
    /// use knowbase::tokenizer::WhitespaceTokenizer;
    ///
    /// let chunker = Chunker::new(ChunkingConfig::default(), Arc::new(WhitespaceTokenizer)).unwrap();
    /// let kb = KnowledgeBase::open(
    ///     tmp.path().join("knowledge.redb"),
    ///     chunker,
    ///     Arc::new(HashingEmbedder::default()),
    /// )
    /// .unwrap();
    ///
    /// let id = kb.add_document("pets.md", "The cat sat on the mat.").unwrap();
    /// let hits = kb.search("cat", 1, None).unwrap();
    /// assert_eq!(hits[0].metadata.doc_id, id);
    /// ```
    pub fn open(
        path: impl Into<PathBuf>,
        chunker: Chunker,
        embedder: Arc<dyn EmbeddingProvider>,
    ) -> Result<Self> {
        let path = path.into();
        let lock = WriteLock::acquire(&path)?;
        let stamp = FileStamp::of(&path);
        let (snapshot, load_warning) = match store::load(&path) {
            Ok(Some(snapshot)) => (snapshot, None),
            Ok(None) => (Snapshot::default(), None),
            Err(e) => {
                warn!(
                    path = %path.display(),
                    error = %e,
                    "could not load knowledge base, starting empty"
                );
                (Snapshot::default(), Some(e.to_string()))
            }
        };
        drop(lock);

        info!(
            path = %path.display(),
            documents = snapshot.registry.len(),
            vectors = snapshot.index.len(),
            "opened knowledge base"
        );

        let kb = Self {
            path,
            state: RwLock::new(Arc::new(snapshot)),
            writer: Mutex::new(()),
            stamp: Mutex::new(stamp),
            chunker,
            embedder,
            load_warning,
        };
        kb.reconcile_model()?;
        Ok(kb)
    }

    /// Rebuild the index if it was built with another embedding model.
    fn reconcile_model(&self) -> Result<()> {
        let current = self.snapshot();
        let configured = self.embedder.model_id();
        match current.model_id.as_deref() {
            Some(stored) if stored != configured && !current.index.is_empty() => {
                warn!(
                    stored,
                    configured, "embedding model changed, rebuilding index"
                );
                self.rebuild()?;
            }
            _ => {}
        }
        Ok(())
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn chunker(&self) -> &Chunker {
        &self.chunker
    }

    pub fn embedder(&self) -> &dyn EmbeddingProvider {
        self.embedder.as_ref()
    }

    /// Why the stored state could not be loaded, if it could not.
    pub fn load_warning(&self) -> Option<&str> {
        self.load_warning.as_deref()
    }

    /// The current consistent state, including saves made by other
    /// processes since the last call.
    pub fn snapshot(&self) -> Arc<Snapshot> {
        self.refresh();
        self.current()
    }

    fn current(&self) -> Arc<Snapshot> {
        match self.state.read() {
            Ok(guard) => Arc::clone(&guard),
            Err(poisoned) => Arc::clone(&poisoned.into_inner()),
        }
    }

    fn last_stamp(&self) -> MutexGuard<'_, Option<FileStamp>> {
        self.stamp.lock().unwrap_or_else(|p| p.into_inner())
    }

    /// Replace the current state with `snapshot` unless a newer generation
    /// is already published.
    fn publish_if_newer(&self, snapshot: Snapshot) {
        let mut guard = self.state.write().unwrap_or_else(|p| p.into_inner());
        if snapshot.generation <= guard.generation {
            return;
        }
        debug!(
            from = guard.generation,
            to = snapshot.generation,
            "picked up knowledge base saved elsewhere"
        );
        *guard = Arc::new(snapshot);
    }

    /// Reload if the file was replaced since this instance last touched it.
    fn refresh(&self) {
        let stamp = FileStamp::of(&self.path);
        if stamp.is_none() || stamp == *self.last_stamp() {
            return;
        }
        match WriteLock::acquire(&self.path) {
            Ok(_lock) => self.reload_if_newer(),
            Err(e) => warn!(error = %e, "could not lock knowledge base for reading"),
        }
    }

    /// Load the file if it holds a newer generation. Callers hold the
    /// [`WriteLock`].
    fn reload_if_newer(&self) {
        let stamp = FileStamp::of(&self.path);
        let known = self.current().generation;
        let loaded = match store::read_generation(&self.path) {
            Ok(Some(generation)) if generation > known => store::load(&self.path),
            Ok(_) => Ok(None),
            Err(e) => Err(e),
        };
        match loaded {
            Ok(Some(snapshot)) => self.publish_if_newer(snapshot),
            Ok(None) => {}
            Err(e) => {
                warn!(error = %e, "could not reload knowledge base, keeping current state");
            }
        }
        *self.last_stamp() = stamp;
    }

    /// Serialise a mutation against this instance's other writers and
    /// against writers in other processes, then bring the state up to date.
    fn begin_write(&self) -> Result<Writer<'_>> {
        let local = self.writer.lock().unwrap_or_else(|p| p.into_inner());
        let file = WriteLock::acquire(&self.path)?;
        self.reload_if_newer();
        Ok(Writer {
            _file: file,
            _local: local,
        })
    }

    /// Persist `next` and make it the current state. On failure the current
    /// state is left untouched. Called with the [`Writer`] held.
    fn commit(&self, mut next: Snapshot) -> Result<()> {
        next.model_id = Some(self.embedder.model_id().to_string());
        next.generation = self.current().generation + 1;
        debug_assert!(next.check_consistency().is_ok());

        store::save(&self.path, &next)?;
        *self.last_stamp() = FileStamp::of(&self.path);

        let mut guard = self.state.write().unwrap_or_else(|p| p.into_inner());
        *guard = Arc::new(next);
        Ok(())
    }

    /// Chunk, embed and store a document.
    ///
    /// Nothing changes unless every step succeeds: an empty document, an
    /// embedding failure or a failed save leave the previous state in place.
    pub fn add_document(&self, name: &str, text: &str) -> Result<DocumentId> {
        self.add(name, text).map(|doc| doc.doc_id)
    }

    /// Like [`add_document`](Self::add_document), returning the stored
    /// registry record.
    pub fn add(&self, name: &str, text: &str) -> Result<Document> {
        let chunks = self.chunker.chunk(text);
        if chunks.is_empty() {
            return Err(Error::EmptyDocument {
                name: name.to_string(),
            });
        }

        let _writer = self.begin_write()?;
        let mut next = (*self.current()).clone();
        let doc_id = next.allocate_id();

        let texts: Vec<String> = chunks.iter().map(|c| c.content.clone()).collect();
        let metadatas = chunks
            .iter()
            .map(|c| ChunkMetadata::new(doc_id, name, c))
            .collect();
        next.index.append(self.embedder.as_ref(), &texts, metadatas)?;

        let chunk_count = chunks.len();
        log_token_stats(name, &chunks);
        next.chunks.put(doc_id, chunks);
        let doc = next.registry.insert(doc_id, name, chunk_count).clone();

        self.commit(next)?;
        info!(%doc_id, name, chunks = chunk_count, "added document");
        Ok(doc)
    }

    /// Add several `(name, text)` documents one after another.
    ///
    /// Each document is its own atomic unit: a failure is reported in its
    /// outcome and does not undo or stop the others.
    pub fn add_documents(
        &self,
        batch: &[(String, String)],
        mut progress: Option<Progress<'_>>,
    ) -> Vec<IngestOutcome> {
        let total = batch.len();
        batch
            .iter()
            .enumerate()
            .map(|(i, (name, text))| {
                if let Some(report) = progress.as_mut() {
                    report(i, total, name);
                }
                IngestOutcome {
                    name: name.clone(),
                    result: self.add(name, text),
                }
            })
            .inspect(log_outcome)
            .collect()
    }

    /// Extract and add files one after another, named by file name.
    pub fn ingest_files(
        &self,
        paths: &[PathBuf],
        extractor: &dyn TextExtractor,
        mut progress: Option<Progress<'_>>,
    ) -> Vec<IngestOutcome> {
        let total = paths.len();
        paths
            .iter()
            .enumerate()
            .map(|(i, path)| {
                let name = path
                    .file_name()
                    .map(|n| n.to_string_lossy().into_owned())
                    .unwrap_or_else(|| path.display().to_string());
                if let Some(report) = progress.as_mut() {
                    report(i, total, &name);
                }
                let result = extractor
                    .extract(path)
                    .and_then(|text| self.add(&name, &text));
                IngestOutcome { name, result }
            })
            .inspect(log_outcome)
            .collect()
    }

    /// Remove a document and everything derived from it.
    ///
    /// The vector index has no delete, so this re-embeds every surviving
    /// chunk and rebuilds the index from scratch. Its cost grows with the
    /// total number of chunks in the knowledge base.
    pub fn remove_document(&self, doc_id: DocumentId) -> Result<()> {
        let _writer = self.begin_write()?;

        let mut next = (*self.current()).clone();
        let Some(doc) = next.registry.remove(doc_id) else {
            return Err(Error::UnknownDocument(doc_id));
        };
        next.chunks.remove(doc_id);
        next.index = self.rebuild_index(&next, &HashSet::from([doc_id]))?;

        self.commit(next)?;
        info!(%doc_id, name = %doc.name, "removed document");
        Ok(())
    }

    /// Re-embed every stored chunk and replace the index. Returns the number
    /// of vectors in the new index.
    pub fn rebuild(&self) -> Result<usize> {
        let _writer = self.begin_write()?;

        let mut next = (*self.current()).clone();
        next.index = self.rebuild_index(&next, &HashSet::new())?;
        let vectors = next.index.len();

        self.commit(next)?;
        Ok(vectors)
    }

    fn rebuild_index(
        &self,
        snapshot: &Snapshot,
        excluding: &HashSet<DocumentId>,
    ) -> Result<VectorIndex> {
        let mut entries = Vec::new();
        for (doc_id, chunks) in snapshot.chunks.all_surviving(excluding) {
            let Some(doc) = snapshot.registry.get(doc_id) else {
                continue;
            };
            entries.extend(chunks.iter().map(|c| {
                (c.content.clone(), ChunkMetadata::new(doc_id, &doc.name, c))
            }));
        }
        VectorIndex::rebuild(self.embedder.as_ref(), entries)
    }

    /// The `k` passages most similar to `query`, best first.
    ///
    /// With a filter, only passages from the listed documents are returned.
    /// The index is over-fetched (starting at `k * 2`, doubling) until `k`
    /// matching passages are found or the whole index has been ranked. An
    /// empty filter yields no results; a filter naming an unknown document
    /// is an error.
    pub fn search(
        &self,
        query: &str,
        k: usize,
        filter: Option<&HashSet<DocumentId>>,
    ) -> Result<Vec<SearchResult>> {
        let snapshot = self.snapshot();

        if let Some(filter) = filter {
            if let Some(unknown) =
                filter.iter().find(|id| !snapshot.registry.contains(**id))
            {
                return Err(Error::UnknownDocument(*unknown));
            }
            if filter.is_empty() {
                return Ok(Vec::new());
            }
        }
        if k == 0 || snapshot.index.is_empty() {
            return Ok(Vec::new());
        }

        let index = &snapshot.index;
        let query_vector = index.embed_query(self.embedder.as_ref(), query)?;

        let hits = match filter {
            None => index.search_vector(&query_vector, k),
            Some(filter) => {
                let total = index.len();
                let mut fetch = k.saturating_mul(OVERFETCH_FACTOR).min(total);
                loop {
                    let hits: Vec<_> = index
                        .search_vector(&query_vector, fetch)
                        .into_iter()
                        .filter(|(m, _)| filter.contains(&m.doc_id))
                        .take(k)
                        .collect();
                    if hits.len() >= k || fetch >= total {
                        break hits;
                    }
                    debug!(fetch, found = hits.len(), k, "widening filtered search");
                    fetch = fetch.saturating_mul(2).min(total);
                }
            }
        };

        debug!(query, k, results = hits.len(), "search");

        Ok(hits
            .into_iter()
            .filter_map(|(metadata, score)| {
                let chunk = snapshot.chunks.get(metadata.doc_id, metadata.chunk_id)?;
                Some(SearchResult {
                    content: chunk.content.clone(),
                    metadata: metadata.clone(),
                    score,
                })
            })
            .collect())
    }

    /// All live documents, in id order.
    pub fn list_documents(&self) -> BTreeMap<DocumentId, Document> {
        self.snapshot().registry.all().clone()
    }

    pub fn document(&self, doc_id: DocumentId) -> Option<Document> {
        self.snapshot().registry.get(doc_id).cloned()
    }

    /// The stored chunks of one document, in chunk order.
    pub fn chunks(&self, doc_id: DocumentId) -> Result<Vec<Chunk>> {
        let snapshot = self.snapshot();
        if !snapshot.registry.contains(doc_id) {
            return Err(Error::UnknownDocument(doc_id));
        }
        Ok(snapshot.chunks.chunks_for(doc_id).to_vec())
    }

    pub fn stats(&self) -> Stats {
        let snapshot = self.snapshot();
        Stats {
            path: self.path.clone(),
            documents: snapshot.registry.len(),
            chunks: snapshot.chunks.total_chunks(),
            vectors: snapshot.index.len(),
            dimension: snapshot.index.dimension(),
            model_id: snapshot.model_id.clone(),
        }
    }
}

/// Held for the duration of a mutation.
struct Writer<'a> {
    _file: WriteLock,
    _local: MutexGuard<'a, ()>,
}

impl std::fmt::Debug for KnowledgeBase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("KnowledgeBase")
            .field("path", &self.path)
            .field("model_id", &self.embedder.model_id())
            .finish_non_exhaustive()
    }
}

fn log_token_stats(name: &str, chunks: &[Chunk]) {
    let counts = || chunks.iter().map(|c| c.token_count);
    let (Some(min), Some(max)) = (counts().min(), counts().max()) else {
        return;
    };
    let avg = counts().sum::<usize>() as f64 / chunks.len() as f64;
    info!(
        name,
        chunks = chunks.len(),
        avg_tokens = format_args!("{avg:.1}"),
        min_tokens = min,
        max_tokens = max,
        "chunked document"
    );
}

fn log_outcome(outcome: &IngestOutcome) {
    if let Err(e) = &outcome.result {
        warn!(name = %outcome.name, error = %e, "failed to add document");
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicBool, Ordering};

    use super::*;
    use crate::{
        chunking::ChunkingConfig,
        embedding::HashingEmbedder,
        tokenizer::WhitespaceTokenizer,
    };

    /// Delegates to a hashing embedder until told to fail.
    #[derive(Default)]
    struct FlakyEmbedder {
        inner: HashingEmbedder,
        failing: AtomicBool,
    }

    impl EmbeddingProvider for FlakyEmbedder {
        fn model_id(&self) -> &str {
            self.inner.model_id()
        }

        fn embed(&self, text: &str) -> Result<Vec<f32>> {
            if self.failing.load(Ordering::SeqCst) {
                return Err(Error::Embedding("provider unavailable".into()));
            }
            self.inner.embed(text)
        }
    }

    fn small_chunker() -> Chunker {
        Chunker::new(ChunkingConfig::new(3, 0), Arc::new(WhitespaceTokenizer))
            .unwrap()
    }

    fn open_with(
        dir: &Path,
        embedder: Arc<dyn EmbeddingProvider>,
    ) -> KnowledgeBase {
        KnowledgeBase::open(dir.join("knowledge.redb"), small_chunker(), embedder)
            .unwrap()
    }

    fn open(dir: &Path) -> KnowledgeBase {
        open_with(dir, Arc::new(HashingEmbedder::default()))
    }

    #[test]
    fn empty_document_is_rejected_without_changes() {
        let tmp = tempfile::tempdir().unwrap();
        let kb = open(tmp.path());
        let err = kb.add_document("blank.md", "  \n\n ").unwrap_err();
        assert!(matches!(err, Error::EmptyDocument { .. }));
        assert!(kb.list_documents().is_empty());
        assert!(!kb.path().exists());
    }

    #[test]
    fn add_records_consistent_counts() {
        let tmp = tempfile::tempdir().unwrap();
        let kb = open(tmp.path());
        let id = kb.add_document("a.md", "the cat sat\n\nthe dog ran").unwrap();

        let doc = kb.document(id).unwrap();
        assert_eq!(doc.chunk_count, 2);
        assert_eq!(kb.chunks(id).unwrap().len(), 2);
        let stats = kb.stats();
        assert_eq!((stats.documents, stats.chunks, stats.vectors), (1, 2, 2));
        assert_eq!(stats.model_id.as_deref(), Some("hashing-384"));
        kb.snapshot().check_consistency().unwrap();
    }

    #[test]
    fn embedding_failure_leaves_state_unchanged() {
        let tmp = tempfile::tempdir().unwrap();
        let embedder = Arc::new(FlakyEmbedder::default());
        let kb = open_with(tmp.path(), embedder.clone());
        kb.add_document("a.md", "the cat sat").unwrap();
        let before = kb.snapshot();

        embedder.failing.store(true, Ordering::SeqCst);
        let err = kb.add_document("b.md", "a fish swam").unwrap_err();
        assert!(matches!(err, Error::Embedding(_)));
        assert_eq!(*kb.snapshot(), *before);

        let err = kb.search("cat", 1, None).unwrap_err();
        assert!(matches!(err, Error::Embedding(_)));
    }

    #[test]
    fn failed_removal_keeps_document() {
        let tmp = tempfile::tempdir().unwrap();
        let embedder = Arc::new(FlakyEmbedder::default());
        let kb = open_with(tmp.path(), embedder.clone());
        let a = kb.add_document("a.md", "the cat sat").unwrap();
        kb.add_document("b.md", "a fish swam").unwrap();

        embedder.failing.store(true, Ordering::SeqCst);
        assert!(kb.remove_document(a).is_err());
        assert!(kb.document(a).is_some());
        assert_eq!(kb.stats().vectors, 2);
    }

    #[test]
    fn remove_unknown_fails() {
        let tmp = tempfile::tempdir().unwrap();
        let kb = open(tmp.path());
        let ghost = DocumentId::from_raw(77);
        assert!(matches!(
            kb.remove_document(ghost),
            Err(Error::UnknownDocument(id)) if id == ghost
        ));
        assert!(kb.chunks(ghost).is_err());
    }

    #[test]
    fn ids_are_never_reused() {
        let tmp = tempfile::tempdir().unwrap();
        let kb = open(tmp.path());
        let a = kb.add_document("a.md", "one").unwrap();
        kb.remove_document(a).unwrap();
        let b = kb.add_document("b.md", "two").unwrap();
        assert!(b > a);
        drop(kb);

        let kb = open(tmp.path());
        let c = kb.add_document("c.md", "three").unwrap();
        assert!(c > b);
    }

    #[test]
    fn filter_edge_cases() {
        let tmp = tempfile::tempdir().unwrap();
        let embedder = Arc::new(FlakyEmbedder::default());
        let kb = open_with(tmp.path(), embedder.clone());
        let a = kb.add_document("a.md", "the cat sat").unwrap();

        // An empty filter short-circuits before the provider is called.
        embedder.failing.store(true, Ordering::SeqCst);
        assert!(kb.search("cat", 3, Some(&HashSet::new())).unwrap().is_empty());
        assert!(kb.search("cat", 0, None).unwrap().is_empty());
        embedder.failing.store(false, Ordering::SeqCst);

        let unknown = HashSet::from([a, DocumentId::from_raw(999)]);
        assert!(matches!(
            kb.search("cat", 3, Some(&unknown)),
            Err(Error::UnknownDocument(_))
        ));
    }

    #[test]
    fn filtered_search_widens_until_enough_hits() {
        let tmp = tempfile::tempdir().unwrap();
        let kb = open(tmp.path());
        // Many near-identical distractors outrank the target document.
        for i in 0..12 {
            kb.add_document(&format!("noise-{i}.md"), "cat cat cat").unwrap();
        }
        let target = kb
            .add_document("target.md", "cat dog\n\ncat fish\n\ncat bird")
            .unwrap();

        let filter = HashSet::from([target]);
        let hits = kb.search("cat", 3, Some(&filter)).unwrap();
        assert_eq!(hits.len(), 3);
        assert!(hits.iter().all(|h| h.metadata.doc_id == target));
        assert!(hits.windows(2).all(|w| w[0].score >= w[1].score));
    }

    #[test]
    fn empty_index_search_is_empty() {
        let tmp = tempfile::tempdir().unwrap();
        let kb = open(tmp.path());
        assert!(kb.search("anything", 3, None).unwrap().is_empty());
    }

    #[test]
    fn batch_reports_each_document() {
        let tmp = tempfile::tempdir().unwrap();
        let kb = open(tmp.path());
        let batch = vec![
            ("a.md".to_string(), "the cat sat".to_string()),
            ("empty.md".to_string(), "   ".to_string()),
            ("b.md".to_string(), "a fish swam".to_string()),
        ];

        let mut seen = Vec::new();
        let mut progress = |i: usize, total: usize, name: &str| {
            seen.push((i, total, name.to_string()));
        };
        let outcomes = kb.add_documents(&batch, Some(&mut progress));

        assert_eq!(outcomes.len(), 3);
        assert!(outcomes[0].result.is_ok());
        assert!(matches!(
            outcomes[1].result,
            Err(Error::EmptyDocument { .. })
        ));
        assert!(outcomes[2].result.is_ok());
        assert_eq!(kb.list_documents().len(), 2);
        assert_eq!(seen[1], (1, 3, "empty.md".to_string()));
    }

    #[test]
    fn corrupt_file_starts_empty_with_warning() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("knowledge.redb");
        std::fs::write(&path, b"not a database").unwrap();

        let kb = KnowledgeBase::open(
            &path,
            small_chunker(),
            Arc::new(HashingEmbedder::default()),
        )
        .unwrap();
        assert!(kb.list_documents().is_empty());
        assert!(kb.load_warning().is_some());

        // The next save replaces the corrupt file.
        kb.add_document("a.md", "the cat sat").unwrap();
        let reopened = open(tmp.path());
        assert!(reopened.load_warning().is_none());
        assert_eq!(reopened.list_documents().len(), 1);
    }

    #[test]
    fn model_change_triggers_rebuild() {
        let tmp = tempfile::tempdir().unwrap();
        {
            let kb = open(tmp.path());
            kb.add_document("a.md", "the cat sat\n\nthe dog ran").unwrap();
        }

        let kb = open_with(tmp.path(), Arc::new(HashingEmbedder::new(64)));
        let stats = kb.stats();
        assert_eq!(stats.dimension, Some(64));
        assert_eq!(stats.vectors, 2);
        assert_eq!(stats.model_id.as_deref(), Some("hashing-64"));
    }

    #[test]
    fn readers_see_whole_snapshots() {
        let tmp = tempfile::tempdir().unwrap();
        let kb = Arc::new(open(tmp.path()));
        kb.add_document("seed.md", "the cat sat").unwrap();

        std::thread::scope(|s| {
            let writer = Arc::clone(&kb);
            s.spawn(move || {
                for i in 0..5 {
                    let id = writer
                        .add_document(&format!("d{i}.md"), "the dog ran far")
                        .unwrap();
                    writer.remove_document(id).unwrap();
                }
            });
            for _ in 0..20 {
                let snapshot = kb.snapshot();
                snapshot.check_consistency().unwrap();
                let hits = kb.search("dog", 10, None).unwrap();
                assert!(!hits.is_empty());
            }
        });
    }

    #[test]
    fn add_returns_the_stored_record() {
        let tmp = tempfile::tempdir().unwrap();
        let kb = open(tmp.path());
        let doc = kb.add("a.md", "the cat sat\n\nthe dog ran").unwrap();
        assert_eq!(doc.name, "a.md");
        assert_eq!(doc.chunk_count, 2);
        assert_eq!(kb.document(doc.doc_id), Some(doc));
    }

    #[test]
    fn instances_sharing_a_file_do_not_lose_updates() {
        let tmp = tempfile::tempdir().unwrap();
        let first = open(tmp.path());
        let second = open(tmp.path());

        let a = first.add_document("a.md", "the cat sat").unwrap();
        let b = second.add_document("b.md", "a fish swam").unwrap();
        assert_ne!(a, b);

        // The first instance sees the second one's save.
        assert_eq!(first.list_documents().len(), 2);
        let c = first.add_document("c.md", "the dog ran").unwrap();
        assert!(c > b);

        second.remove_document(a).unwrap();
        assert!(first.document(a).is_none());
        let hits = first.search("cat", 10, None).unwrap();
        assert!(hits.iter().all(|h| h.metadata.doc_id != a));

        let reopened = open(tmp.path());
        let names: Vec<_> = reopened
            .list_documents()
            .into_values()
            .map(|d| d.name)
            .collect();
        assert_eq!(names, vec!["b.md", "c.md"]);
        reopened.snapshot().check_consistency().unwrap();
    }

    #[test]
    fn concurrent_instances_hand_out_distinct_ids() {
        let tmp = tempfile::tempdir().unwrap();
        let instances = [open(tmp.path()), open(tmp.path())];

        let ids: Vec<DocumentId> = std::thread::scope(|s| {
            let handles: Vec<_> = instances
                .iter()
                .enumerate()
                .map(|(n, kb)| {
                    s.spawn(move || {
                        (0..5)
                            .map(|i| {
                                kb.add_document(&format!("{n}-{i}.md"), "the cat sat")
                                    .unwrap()
                            })
                            .collect::<Vec<_>>()
                    })
                })
                .collect();
            handles
                .into_iter()
                .flat_map(|h| h.join().unwrap())
                .collect()
        });

        let distinct: HashSet<_> = ids.iter().copied().collect();
        assert_eq!(distinct.len(), 10);

        let reopened = open(tmp.path());
        assert_eq!(reopened.list_documents().len(), 10);
        assert_eq!(reopened.stats().vectors, 10);
    }
}
