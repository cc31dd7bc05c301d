use std::path::PathBuf;

use crate::doc_id::DocumentId;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("no text could be extracted from {source_name}: {reason}")]
    Extraction { source_name: String, reason: String },

    #[error("document '{name}' produced no chunks")]
    EmptyDocument { name: String },

    #[error("embedding failed: {0}")]
    Embedding(String),

    #[error("unknown document {0}")]
    UnknownDocument(DocumentId),

    #[error("persistence failed for {path}: {source}")]
    Persistence {
        path: PathBuf,
        #[source]
        source: Box<Error>,
    },

    #[error("answer generation failed: {0}")]
    Generation(String),

    #[error("database error: {0}")]
    Redb(#[from] redb::Error),

    #[error("database open error: {0}")]
    RedbDatabase(#[from] redb::DatabaseError),

    #[error("database storage error: {0}")]
    RedbStorage(#[from] redb::StorageError),

    #[error("database transaction error: {0}")]
    RedbTransaction(#[from] redb::TransactionError),

    #[error("database table error: {0}")]
    RedbTable(#[from] redb::TableError),

    #[error("database commit error: {0}")]
    RedbCommit(#[from] redb::CommitError),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("configuration error: {0}")]
    Config(String),

    #[error("{kind} not found: {name}")]
    NotFound { kind: &'static str, name: String },

    #[error("data directory does not exist and could not be created: {0}")]
    DataDir(PathBuf),
}

impl Error {
    /// Wrap a lower-level failure as a persistence failure for `path`.
    pub fn persistence(path: impl Into<PathBuf>, source: Error) -> Self {
        Self::Persistence {
            path: path.into(),
            source: Box::new(source),
        }
    }

    /// Whether this error came from reading or writing on-disk state.
    pub fn is_persistence(&self) -> bool {
        matches!(
            self,
            Self::Io(_)
                | Self::Persistence { .. }
                | Self::Redb(_)
                | Self::RedbDatabase(_)
                | Self::RedbStorage(_)
                | Self::RedbTransaction(_)
                | Self::RedbTable(_)
                | Self::RedbCommit(_)
        )
    }
}
