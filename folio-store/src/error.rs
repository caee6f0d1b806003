use thiserror::Error;
use uuid::Uuid;

/// Storage errors.
#[derive(Debug, Clone, Error)]
pub enum StoreError {
    /// RocksDB internal error
    #[error("database error: {0}")]
    Database(String),

    /// A concurrent transaction touched the same rows first
    #[error("write conflict: {0}")]
    Conflict(String),

    #[error("document not found: {0}")]
    DocumentNotFound(Uuid),

    #[error("revision {number} of document {doc_id} not found")]
    RevisionNotFound { doc_id: Uuid, number: u64 },

    #[error("session not found: {0}")]
    SessionNotFound(Uuid),

    /// Request rejected before any write happened
    #[error("invalid request: {0}")]
    Invalid(String),

    #[error("serialization error: {0}")]
    Serialization(String),

    #[error("deserialization error: {0}")]
    Deserialization(String),

    #[error("compression error: {0}")]
    Compression(String),
}

impl StoreError {
    /// True for "row does not exist" failures.
    pub fn is_not_found(&self) -> bool {
        matches!(
            self,
            StoreError::DocumentNotFound(_)
                | StoreError::RevisionNotFound { .. }
                | StoreError::SessionNotFound(_)
        )
    }
}

impl From<rocksdb::Error> for StoreError {
    fn from(e: rocksdb::Error) -> Self {
        match e.kind() {
            rocksdb::ErrorKind::Busy | rocksdb::ErrorKind::TryAgain => {
                StoreError::Conflict(e.to_string())
            }
            _ => StoreError::Database(e.to_string()),
        }
    }
}

/// Durable object-storage errors.
#[derive(Debug, Error)]
pub enum ArchiveError {
    #[error("archive I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("archive object is corrupt: {0}")]
    Corrupt(String),

    #[error("archive pointer is invalid: {0}")]
    InvalidPointer(String),

    #[error("archive unavailable: {0}")]
    Unavailable(String),
}
