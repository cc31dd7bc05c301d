//! On-disk form of the knowledge base.
//!
//! The registry, chunk store and vector index live in one redb file and are
//! always written together. A save builds a complete new file next to the
//! target (`<name>.tmp`) in a single transaction and renames it into place,
//! so the previous file stays intact until the new one is complete.
//!
//! Writers in other processes are serialised through an advisory lock on
//! `<name>.lock` ([`WriteLock`]). Every save bumps the snapshot's
//! `generation`, so a holder of the lock can tell whether the file moved on
//! since it last read it.
//!
//! Vector binary format per entry:
//! - 4 bytes: dimension D (u32 LE)
//! - D * 4 bytes: f32 values

use std::{
    collections::HashMap,
    fs::{self, OpenOptions},
    path::{Path, PathBuf},
    time::SystemTime,
};

use fs2::FileExt;

use redb::{
    Database,
    ReadTransaction,
    ReadableDatabase,
    ReadableTable,
    TableDefinition,
    WriteTransaction,
};

use crate::{
    chunking::Chunk,
    doc_id::DocumentId,
    error::{Error, Result},
    registry::{ChunkStore, Document, DocumentRegistry},
    vector_index::{ChunkMetadata, VectorIndex, VectorRecord},
};

const META: TableDefinition<&str, &str> = TableDefinition::new("meta");
const DOCUMENTS: TableDefinition<u64, &[u8]> = TableDefinition::new("documents");
const CHUNKS: TableDefinition<u64, &[u8]> = TableDefinition::new("chunks");
const VECTORS: TableDefinition<u64, &[u8]> = TableDefinition::new("vectors");
const RECORDS: TableDefinition<u64, &[u8]> = TableDefinition::new("records");

const FORMAT_VERSION: &str = "1";

const KEY_FORMAT: &str = "format_version";
const KEY_NEXT_ID: &str = "next_doc_id";
const KEY_GENERATION: &str = "generation";
const KEY_MODEL: &str = "model_id";

/// Header size: 4 bytes dimension.
const HEADER_SIZE: usize = 4;

/// Everything that is persisted together.
#[derive(Debug, Clone, PartialEq)]
pub struct Snapshot {
    pub registry: DocumentRegistry,
    pub chunks: ChunkStore,
    pub index: VectorIndex,
    /// Next id to hand out. Never decreases.
    pub next_doc_id: DocumentId,
    /// Embedding model the index was built with.
    pub model_id: Option<String>,
    /// Number of saves that produced this snapshot.
    pub generation: u64,
}

impl Default for Snapshot {
    fn default() -> Self {
        Self {
            registry: DocumentRegistry::default(),
            chunks: ChunkStore::default(),
            index: VectorIndex::default(),
            next_doc_id: DocumentId::from_raw(1),
            model_id: None,
            generation: 0,
        }
    }
}

impl Snapshot {
    pub fn allocate_id(&mut self) -> DocumentId {
        let id = self.next_doc_id;
        self.next_doc_id = id.next();
        id
    }

    /// Verify that registry, chunk store and index describe the same set of
    /// documents and chunk counts.
    pub fn check_consistency(&self) -> Result<()> {
        let mut vector_counts: HashMap<DocumentId, usize> = HashMap::new();
        for record in self.index.records() {
            *vector_counts.entry(record.metadata.doc_id).or_default() += 1;
        }

        for (doc_id, doc) in self.registry.all() {
            let stored = self.chunks.chunks_for(*doc_id).len();
            let vectors = vector_counts.remove(doc_id).unwrap_or_default();
            if stored != doc.chunk_count || vectors != doc.chunk_count {
                return Err(inconsistent(format!(
                    "{doc_id} records {} chunks but has {stored} stored and {vectors} indexed",
                    doc.chunk_count
                )));
            }
            if *doc_id >= self.next_doc_id {
                return Err(inconsistent(format!(
                    "{doc_id} is not below the id counter {}",
                    self.next_doc_id
                )));
            }
        }

        if let Some(orphan) = vector_counts.keys().next() {
            return Err(inconsistent(format!(
                "vectors reference unknown document {orphan}"
            )));
        }
        if let Some(orphan) =
            self.chunks.doc_ids().find(|id| !self.registry.contains(*id))
        {
            return Err(inconsistent(format!(
                "chunks stored for unknown document {orphan}"
            )));
        }
        Ok(())
    }
}

fn inconsistent(msg: String) -> Error {
    Error::Config(format!("inconsistent knowledge base: {msg}"))
}

fn corrupt(msg: impl Into<String>) -> Error {
    Error::Config(format!("corrupt knowledge base: {}", msg.into()))
}

/// Atomically replace `path` with `snapshot`.
pub fn save(path: &Path, snapshot: &Snapshot) -> Result<()> {
    write_atomically(path, |txn| {
        {
            let mut meta = txn.open_table(META)?;
            meta.insert(KEY_FORMAT, FORMAT_VERSION)?;
            meta.insert(
                KEY_NEXT_ID,
                snapshot.next_doc_id.numeric().to_string().as_str(),
            )?;
            meta.insert(
                KEY_GENERATION,
                snapshot.generation.to_string().as_str(),
            )?;
            if let Some(model) = &snapshot.model_id {
                meta.insert(KEY_MODEL, model.as_str())?;
            }
        }
        {
            let mut documents = txn.open_table(DOCUMENTS)?;
            for (doc_id, doc) in snapshot.registry.all() {
                let json = serde_json::to_vec(doc)?;
                documents.insert(doc_id.numeric(), json.as_slice())?;
            }
        }
        {
            let mut chunks = txn.open_table(CHUNKS)?;
            for doc_id in snapshot.chunks.doc_ids() {
                let json = serde_json::to_vec(snapshot.chunks.chunks_for(doc_id))?;
                chunks.insert(doc_id.numeric(), json.as_slice())?;
            }
        }
        write_index(txn, &snapshot.index)
    })
    .map_err(|e| Error::persistence(path, e))?;

    tracing::debug!(
        path = %path.display(),
        documents = snapshot.registry.len(),
        vectors = snapshot.index.len(),
        generation = snapshot.generation,
        "saved knowledge base"
    );
    Ok(())
}

/// Load a snapshot. A missing file is `Ok(None)`; an unreadable, corrupt or
/// inconsistent file is a `Persistence` error and nothing is returned.
pub fn load(path: &Path) -> Result<Option<Snapshot>> {
    if !path.exists() {
        return Ok(None);
    }
    read_snapshot(path)
        .map(Some)
        .map_err(|e| Error::persistence(path, e))
}

/// The generation recorded in the file at `path`, without loading the rest.
pub fn read_generation(path: &Path) -> Result<Option<u64>> {
    if !path.exists() {
        return Ok(None);
    }
    let read = || -> Result<u64> {
        let db = Database::open(path)?;
        let txn = db.begin_read()?;
        parse_generation(&read_meta(&txn)?)
    };
    read().map(Some).map_err(|e| Error::persistence(path, e))
}

/// Size and modification time of a file, used to notice that another
/// process replaced it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FileStamp {
    modified: Option<SystemTime>,
    len: u64,
}

impl FileStamp {
    /// `None` when the file does not exist.
    pub fn of(path: &Path) -> Option<Self> {
        let meta = fs::metadata(path).ok()?;
        Some(Self {
            modified: meta.modified().ok(),
            len: meta.len(),
        })
    }
}

/// Exclusive advisory lock guarding a knowledge base file against writers
/// in other processes. Released on drop.
#[derive(Debug)]
pub struct WriteLock {
    file: fs::File,
}

impl WriteLock {
    /// Block until the lock for the knowledge base at `path` is held.
    pub fn acquire(path: &Path) -> Result<Self> {
        let lock_path = sibling_path(path, ".lock");
        if let Some(parent) = lock_path.parent()
            && !parent.as_os_str().is_empty()
        {
            fs::create_dir_all(parent)?;
        }

        let file = OpenOptions::new()
            .create(true)
            .read(true)
            .write(true)
            .truncate(false)
            .open(&lock_path)
            .map_err(|e| Error::persistence(&lock_path, Error::Io(e)))?;
        file.lock_exclusive()
            .map_err(|e| Error::persistence(&lock_path, Error::Io(e)))?;
        Ok(Self { file })
    }
}

impl Drop for WriteLock {
    fn drop(&mut self) {
        let _ = self.file.unlock();
    }
}

/// Atomically replace `path` with an index-only file.
pub fn save_index(path: &Path, index: &VectorIndex) -> Result<()> {
    write_atomically(path, |txn| {
        {
            let mut meta = txn.open_table(META)?;
            meta.insert(KEY_FORMAT, FORMAT_VERSION)?;
        }
        write_index(txn, index)
    })
    .map_err(|e| Error::persistence(path, e))
}

pub fn load_index(path: &Path) -> Result<VectorIndex> {
    let read = || -> Result<VectorIndex> {
        let db = Database::open(path)?;
        let txn = db.begin_read()?;
        read_meta(&txn)?;
        read_index(&txn)
    };
    read().map_err(|e| Error::persistence(path, e))
}

fn sibling_path(path: &Path, suffix: &str) -> PathBuf {
    let mut name = path.file_name().unwrap_or_default().to_os_string();
    name.push(suffix);
    path.with_file_name(name)
}

fn temp_path(path: &Path) -> PathBuf {
    sibling_path(path, ".tmp")
}

fn write_atomically(
    path: &Path,
    fill: impl FnOnce(&WriteTransaction) -> Result<()>,
) -> Result<()> {
    if let Some(parent) = path.parent()
        && !parent.as_os_str().is_empty()
    {
        fs::create_dir_all(parent)?;
    }

    let tmp = temp_path(path);
    if tmp.exists() {
        fs::remove_file(&tmp)?;
    }

    if let Err(e) = write_file(&tmp, fill) {
        let _ = fs::remove_file(&tmp);
        return Err(e);
    }
    fs::rename(&tmp, path)?;
    Ok(())
}

fn write_file(
    path: &Path,
    fill: impl FnOnce(&WriteTransaction) -> Result<()>,
) -> Result<()> {
    let db = Database::create(path)?;
    let txn = db.begin_write()?;
    fill(&txn)?;
    txn.commit()?;
    Ok(())
}

/// Uses `insert_reserve` for zero-copy vector writes.
fn write_index(txn: &WriteTransaction, index: &VectorIndex) -> Result<()> {
    let mut vectors = txn.open_table(VECTORS)?;
    let mut records = txn.open_table(RECORDS)?;

    for (pos, record) in index.records().iter().enumerate() {
        let key = pos as u64;
        let data = record.vector.as_slice();
        {
            let mut guard = vectors
                .insert_reserve(key, HEADER_SIZE + std::mem::size_of_val(data))?;
            let dest = guard.as_mut();
            dest[..HEADER_SIZE]
                .copy_from_slice(&(data.len() as u32).to_le_bytes());
            dest[HEADER_SIZE..].copy_from_slice(bytemuck::cast_slice(data));
        }
        let json = serde_json::to_vec(&record.metadata)?;
        records.insert(key, json.as_slice())?;
    }
    Ok(())
}

fn decode_vector(bytes: &[u8]) -> Result<Vec<f32>> {
    let header: [u8; HEADER_SIZE] = bytes
        .get(..HEADER_SIZE)
        .and_then(|h| h.try_into().ok())
        .ok_or_else(|| corrupt("truncated vector header"))?;
    let dimension = u32::from_le_bytes(header) as usize;

    let expected = HEADER_SIZE + dimension * std::mem::size_of::<f32>();
    if bytes.len() != expected {
        return Err(corrupt(format!(
            "vector of dimension {dimension} has {} bytes, expected {expected}",
            bytes.len()
        )));
    }
    // The payload is not guaranteed to be 4-byte aligned; copy it out.
    Ok(bytemuck::pod_collect_to_vec(&bytes[HEADER_SIZE..]))
}

fn read_meta(txn: &ReadTransaction) -> Result<HashMap<String, String>> {
    let table = txn.open_table(META)?;
    let mut meta = HashMap::new();
    for entry in table.iter()? {
        let (k, v) = entry?;
        meta.insert(k.value().to_string(), v.value().to_string());
    }

    match meta.get(KEY_FORMAT).map(String::as_str) {
        Some(FORMAT_VERSION) => Ok(meta),
        Some(other) => Err(corrupt(format!("unsupported format version {other}"))),
        None => Err(corrupt("missing format version")),
    }
}

fn parse_generation(meta: &HashMap<String, String>) -> Result<u64> {
    match meta.get(KEY_GENERATION) {
        Some(v) => v
            .parse()
            .map_err(|_| corrupt(format!("invalid generation {v:?}"))),
        None => Ok(0),
    }
}

fn read_index(txn: &ReadTransaction) -> Result<VectorIndex> {
    let vectors = txn.open_table(VECTORS)?;
    let records = txn.open_table(RECORDS)?;

    let mut out = Vec::new();
    for entry in vectors.iter()? {
        let (key, value) = entry?;
        let pos = key.value();
        if pos != out.len() as u64 {
            return Err(corrupt(format!("vector positions skip at {pos}")));
        }
        let vector = decode_vector(value.value())?;
        let metadata: ChunkMetadata = match records.get(pos)? {
            Some(guard) => serde_json::from_slice(guard.value())?,
            None => return Err(corrupt(format!("vector {pos} has no metadata"))),
        };
        out.push(VectorRecord { vector, metadata });
    }

    let mut record_count = 0usize;
    for entry in records.iter()? {
        entry?;
        record_count += 1;
    }
    if record_count != out.len() {
        return Err(corrupt(format!(
            "{record_count} metadata records for {} vectors",
            out.len()
        )));
    }

    VectorIndex::from_records(out)
}

fn read_snapshot(path: &Path) -> Result<Snapshot> {
    let db = Database::open(path)?;
    let txn = db.begin_read()?;
    let meta = read_meta(&txn)?;

    let next_doc_id = meta
        .get(KEY_NEXT_ID)
        .and_then(|v| v.parse::<u64>().ok())
        .map(DocumentId::from_raw)
        .ok_or_else(|| corrupt("missing or invalid id counter"))?;
    let model_id = meta.get(KEY_MODEL).cloned();
    let generation = parse_generation(&meta)?;

    let mut registry = DocumentRegistry::new();
    {
        let table = txn.open_table(DOCUMENTS)?;
        for entry in table.iter()? {
            let (key, value) = entry?;
            let doc: Document = serde_json::from_slice(value.value())?;
            if doc.doc_id.numeric() != key.value() {
                return Err(corrupt(format!(
                    "document stored under key {} claims id {}",
                    key.value(),
                    doc.doc_id
                )));
            }
            registry.insert_document(doc);
        }
    }

    let mut chunks = ChunkStore::new();
    {
        let table = txn.open_table(CHUNKS)?;
        for entry in table.iter()? {
            let (key, value) = entry?;
            let doc_chunks: Vec<Chunk> = serde_json::from_slice(value.value())?;
            chunks.put(DocumentId::from_raw(key.value()), doc_chunks);
        }
    }

    let index = read_index(&txn)?;

    let snapshot = Snapshot {
        registry,
        chunks,
        index,
        next_doc_id,
        model_id,
        generation,
    };
    snapshot.check_consistency()?;
    Ok(snapshot)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        chunking::chunk_text,
        embedding::HashingEmbedder,
        tokenizer::WhitespaceTokenizer,
    };

    fn sample() -> Snapshot {
        let embedder = HashingEmbedder::new(16);
        let mut snapshot = Snapshot::default();
        for (name, text) in [("a.md", "the cat sat\n\nthe dog ran"), ("b.md", "a fish swam")]
        {
            let doc_id = snapshot.allocate_id();
            let chunks = chunk_text(text, 3, 0, &WhitespaceTokenizer);
            let texts: Vec<String> = chunks.iter().map(|c| c.content.clone()).collect();
            let metas = chunks
                .iter()
                .map(|c| ChunkMetadata::new(doc_id, name, c))
                .collect();
            snapshot.index.append(&embedder, &texts, metas).unwrap();
            snapshot.registry.insert(doc_id, name, chunks.len());
            snapshot.chunks.put(doc_id, chunks);
        }
        snapshot.model_id = Some("hashing-16".into());
        snapshot.generation = 4;
        snapshot
    }

    #[test]
    fn save_and_load_roundtrip() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("knowledge.redb");
        let snapshot = sample();
        snapshot.check_consistency().unwrap();

        save(&path, &snapshot).unwrap();
        let loaded = load(&path).unwrap().unwrap();
        assert_eq!(loaded, snapshot);
        assert!(!temp_path(&path).exists());
        assert_eq!(read_generation(&path).unwrap(), Some(4));
    }

    #[test]
    fn generation_of_missing_file_is_none() {
        let tmp = tempfile::tempdir().unwrap();
        assert_eq!(read_generation(&tmp.path().join("nope.redb")).unwrap(), None);
    }

    #[test]
    fn stamp_changes_when_file_is_replaced() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("knowledge.redb");
        assert_eq!(FileStamp::of(&path), None);

        save(&path, &Snapshot::default()).unwrap();
        let before = FileStamp::of(&path).unwrap();
        save(&path, &sample()).unwrap();
        assert_ne!(FileStamp::of(&path), Some(before));
    }

    #[test]
    fn write_lock_is_exclusive_until_dropped() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("nested").join("knowledge.redb");
        let held = WriteLock::acquire(&path).unwrap();

        let other = OpenOptions::new()
            .write(true)
            .open(sibling_path(&path, ".lock"))
            .unwrap();
        assert!(other.try_lock_exclusive().is_err());

        drop(held);
        other.try_lock_exclusive().unwrap();
        other.unlock().unwrap();
    }

    #[test]
    fn load_missing_is_none() {
        let tmp = tempfile::tempdir().unwrap();
        assert!(load(&tmp.path().join("nope.redb")).unwrap().is_none());
    }

    #[test]
    fn load_corrupt_is_persistence_error() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("knowledge.redb");
        fs::write(&path, b"garbage bytes").unwrap();
        let err = load(&path).unwrap_err();
        assert!(matches!(err, Error::Persistence { .. }));
    }

    #[test]
    fn save_replaces_previous_file() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("knowledge.redb");
        save(&path, &sample()).unwrap();

        let empty = Snapshot {
            next_doc_id: DocumentId::from_raw(3),
            ..Snapshot::default()
        };
        save(&path, &empty).unwrap();
        let loaded = load(&path).unwrap().unwrap();
        assert!(loaded.registry.is_empty());
        assert_eq!(loaded.next_doc_id.numeric(), 3);
    }

    #[test]
    fn failed_save_keeps_previous_file() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("knowledge.redb");
        let snapshot = sample();
        save(&path, &snapshot).unwrap();

        // A directory squatting on the temp path makes the write fail.
        fs::create_dir(temp_path(&path)).unwrap();
        let err = save(&path, &Snapshot::default()).unwrap_err();
        assert!(err.is_persistence());

        assert_eq!(load(&path).unwrap().unwrap(), snapshot);
    }

    #[test]
    fn inconsistent_snapshot_detected() {
        let mut snapshot = sample();
        let first = *snapshot.registry.all().keys().next().unwrap();
        snapshot.chunks.remove(first);
        assert!(snapshot.check_consistency().is_err());

        let mut snapshot = sample();
        snapshot.next_doc_id = DocumentId::from_raw(1);
        assert!(snapshot.check_consistency().is_err());
    }

    #[test]
    fn decode_rejects_bad_lengths() {
        assert!(decode_vector(&[1, 0]).is_err());
        let mut bytes = 2u32.to_le_bytes().to_vec();
        bytes.extend_from_slice(bytemuck::cast_slice(&[1.0f32]));
        assert!(decode_vector(&bytes).is_err());
        bytes.extend_from_slice(bytemuck::cast_slice(&[2.0f32]));
        assert_eq!(decode_vector(&bytes).unwrap(), vec![1.0, 2.0]);
    }
}
