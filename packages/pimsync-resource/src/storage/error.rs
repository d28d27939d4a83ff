//! Storage error taxonomy (spec.md §4.1): `NotFound`, `Corruption`, `Full`,
//! `IOError`, `LockTimeout`, mapped from the underlying `redb` errors.

use pimsync_core::ErrorKind;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("key not found")]
    NotFound,
    #[error("database corrupted: {0}")]
    Corruption(String),
    #[error("storage full: {0}")]
    Full(String),
    #[error("I/O error: {0}")]
    IoError(#[from] std::io::Error),
    #[error("lock timeout acquiring write transaction")]
    LockTimeout,
    #[error("optimistic concurrency conflict: expected revision {expected}, found {actual}")]
    Conflict { expected: u64, actual: u64 },
}

impl StoreError {
    /// Maps to the spec.md §7 error kind driving retry/fatal handling.
    #[must_use]
    pub fn kind(&self) -> ErrorKind {
        match self {
            StoreError::NotFound => ErrorKind::InvalidCommand,
            StoreError::Corruption(_) => ErrorKind::StorageCorruption,
            StoreError::Full(_) => ErrorKind::StorageFull,
            StoreError::IoError(_) => ErrorKind::StorageFull,
            StoreError::LockTimeout => ErrorKind::TransientNetwork,
            StoreError::Conflict { .. } => ErrorKind::Conflict,
        }
    }
}

impl From<redb::DatabaseError> for StoreError {
    fn from(err: redb::DatabaseError) -> Self {
        match err {
            redb::DatabaseError::Storage(redb::StorageError::Corrupted(msg)) => {
                StoreError::Corruption(msg)
            }
            redb::DatabaseError::Storage(redb::StorageError::Io(e)) => StoreError::IoError(e),
            other => StoreError::Corruption(other.to_string()),
        }
    }
}

impl From<redb::TransactionError> for StoreError {
    fn from(err: redb::TransactionError) -> Self {
        match err {
            redb::TransactionError::Storage(redb::StorageError::Corrupted(msg)) => {
                StoreError::Corruption(msg)
            }
            redb::TransactionError::Storage(redb::StorageError::Io(e)) => StoreError::IoError(e),
            other => StoreError::Corruption(other.to_string()),
        }
    }
}

impl From<redb::TableError> for StoreError {
    fn from(err: redb::TableError) -> Self {
        match err {
            redb::TableError::Storage(redb::StorageError::Corrupted(msg)) => {
                StoreError::Corruption(msg)
            }
            redb::TableError::Storage(redb::StorageError::Io(e)) => StoreError::IoError(e),
            other => StoreError::Corruption(other.to_string()),
        }
    }
}

impl From<redb::StorageError> for StoreError {
    fn from(err: redb::StorageError) -> Self {
        match err {
            redb::StorageError::Corrupted(msg) => StoreError::Corruption(msg),
            redb::StorageError::ValueTooLarge(n) => {
                StoreError::Full(format!("value of {n} bytes exceeds maximum"))
            }
            redb::StorageError::Io(e) => StoreError::IoError(e),
            other => StoreError::Corruption(other.to_string()),
        }
    }
}

impl From<redb::CommitError> for StoreError {
    fn from(err: redb::CommitError) -> Self {
        match err {
            redb::CommitError::Storage(redb::StorageError::Corrupted(msg)) => {
                StoreError::Corruption(msg)
            }
            redb::CommitError::Storage(redb::StorageError::Io(e)) => StoreError::IoError(e),
            other => StoreError::Corruption(other.to_string()),
        }
    }
}
