//! Error types for tether-core

use thiserror::Error;

use crate::crypto::CryptoError;

/// Result type alias using tether-core's Error
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur in tether-core operations
#[derive(Error, Debug)]
pub enum Error {
    /// Database error
    #[error("Database error: {0}")]
    Database(rusqlite::Error),

    /// A concurrent writer invalidated the transaction; the whole
    /// reconciliation pass may be retried against a fresh one
    #[error("Storage merge conflict")]
    MergeConflict,

    /// Crypto error
    #[error("Crypto error: {0}")]
    Crypto(#[from] CryptoError),

    /// Serialization error
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Record not found
    #[error("Record not found: {0}")]
    NotFound(String),

    /// Invalid input
    #[error("Invalid input: {0}")]
    InvalidInput(String),
}

impl Error {
    /// Whether this error is a retriable storage merge conflict
    #[must_use]
    pub const fn is_merge_conflict(&self) -> bool {
        matches!(self, Self::MergeConflict)
    }
}

impl From<rusqlite::Error> for Error {
    fn from(error: rusqlite::Error) -> Self {
        if let rusqlite::Error::SqliteFailure(failure, _) = &error {
            if matches!(
                failure.code,
                rusqlite::ErrorCode::DatabaseBusy | rusqlite::ErrorCode::DatabaseLocked
            ) {
                return Self::MergeConflict;
            }
        }
        Self::Database(error)
    }
}
