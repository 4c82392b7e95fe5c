//! Error types for the sync engine.
//!
//! Each variant names the stage of a cycle that failed. None of them is
//! fatal: the loop logs the error, backs off, and tries again.

use thiserror::Error;

/// Errors a sync cycle can end with.
#[derive(Debug, Error)]
pub enum SyncError {
    /// The change log could not be read.
    #[error("Read error: {0}")]
    Read(String),

    /// No document of the cycle could be embedded.
    #[error("Embedding error: {0}")]
    Embedding(String),

    /// The vector index rejected or did not confirm the batch.
    #[error("Upsert error: {0}")]
    Upsert(String),

    /// Documents were upserted but the change log could not be updated.
    #[error("Mark error: {0}")]
    Mark(String),

    /// Retry bookkeeping for rejected records failed.
    #[error("Ledger error: {0}")]
    Ledger(String),
}

impl SyncError {
    pub fn read(err: impl std::fmt::Display) -> Self {
        SyncError::Read(err.to_string())
    }

    pub fn mark(err: impl std::fmt::Display) -> Self {
        SyncError::Mark(err.to_string())
    }

    pub fn ledger(err: impl std::fmt::Display) -> Self {
        SyncError::Ledger(err.to_string())
    }

    /// Short stage label for structured logs.
    pub fn stage(&self) -> &'static str {
        match self {
            SyncError::Read(_) => "read",
            SyncError::Embedding(_) => "embed",
            SyncError::Upsert(_) => "upsert",
            SyncError::Mark(_) => "mark",
            SyncError::Ledger(_) => "ledger",
        }
    }
}
