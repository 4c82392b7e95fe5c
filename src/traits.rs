//! Seams of the sync pipeline.
//!
//! The engine only talks to its collaborators through these traits, so a
//! cycle can run against SQLite and a real index in production, or against
//! fakes in tests.
//!
//! ```text
//!  ChangeFeed ──▶ group_rows ──▶ Embedder ──▶ VectorSink ──▶ ProcessedLedger
//!  (reader)       (grouper)      (embedding)   (sink)         (marker)
//! ```

use std::collections::BTreeSet;

use anyhow::Result;
use async_trait::async_trait;

use crate::error::SyncError;
use crate::models::{JoinedRow, RejectedRecord, VectorRecord};

/// Source of unprocessed changes.
#[async_trait]
pub trait ChangeFeed: Send + Sync {
    /// Rows whose change-log entry is still unprocessed, oldest change first.
    ///
    /// An empty vector means there is nothing to do this cycle.
    async fn fetch_changed(&self) -> Result<Vec<JoinedRow>, SyncError>;
}

/// Durable record of what the engine has handled.
#[async_trait]
pub trait ProcessedLedger: Send + Sync {
    /// Flip `processed` for exactly these change-log entries in one
    /// transaction. Entries for the same records written after the read
    /// are not touched.
    ///
    /// Returns the number of change-log rows updated.
    async fn mark_processed(&self, change_ids: &BTreeSet<i64>) -> Result<u64, SyncError>;

    /// Charge one attempt to each rejected record and quarantine the ones
    /// that reached `max_attempts`. Returns the newly dead-lettered ids.
    async fn record_failures(
        &self,
        rejected: &[RejectedRecord],
        max_attempts: u32,
    ) -> Result<Vec<i64>, SyncError>;
}

/// Destination vector index.
#[async_trait]
pub trait VectorSink: Send + Sync {
    /// Short backend name for logs (e.g. `"local"`, `"pinecone"`).
    fn name(&self) -> &str;

    /// Insert or overwrite every record under `namespace`.
    ///
    /// `Ok` means the whole batch is durable. Any error means the caller
    /// must assume nothing was written.
    async fn upsert(&self, records: &[VectorRecord], namespace: &str) -> Result<()>;
}
