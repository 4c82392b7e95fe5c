//! The sync loop.
//!
//! Each cycle reads pending changes, groups them into purchase documents,
//! embeds and upserts them, and only then marks the source records
//! processed. Cycles repeat until the cancellation token fires.
//!
//! # Failure Handling
//!
//! A cycle error is logged and followed by a backoff sleep; it never ends
//! the loop. The delay after a failure doubles with each consecutive
//! failure, starting at one interval and capped at `sync.max_backoff_secs`.
//!
//! Records are only charged an attempt when they fail on their own: rows
//! the grouper rejects, and documents that fail to embed while the rest of
//! the cycle embeds fine. Records reaching `sync.max_attempts` are
//! dead-lettered.
//!
//! A document that fails to embed while it is alone in its cycle cannot be
//! told apart from an outage, so it is not charged. The engine keeps a
//! streak of such solo failures per document id and warns with the id on
//! every repeat.
//!
//! Marking is gated on an [`UpsertReceipt`], which only a successful upsert
//! step can produce. It names the change-log entries that were read, never
//! whole records, so changes that land mid-cycle stay pending.

use anyhow::Result;
use std::collections::BTreeSet;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::config::Config;
use crate::db;
use crate::embedding::{create_embedder, Embedder};
use crate::error::SyncError;
use crate::grouper::group_rows;
use crate::marker::ProcessedMarker;
use crate::models::{LogicalDocument, RejectedRecord, VectorRecord};
use crate::reader::ChangeLogReader;
use crate::seed;
use crate::sink::create_sink;
use crate::traits::{ChangeFeed, ProcessedLedger, VectorSink};

/// Runtime knobs of the engine.
#[derive(Debug, Clone)]
pub struct SyncSettings {
    pub interval: Duration,
    pub max_backoff: Duration,
    pub max_attempts: u32,
    pub skip_empty: bool,
    pub namespace: String,
    pub batch_size: usize,
}

impl SyncSettings {
    pub fn from_config(config: &Config) -> Self {
        Self {
            interval: config.sync.interval(),
            max_backoff: config.sync.max_backoff(),
            max_attempts: config.sync.max_attempts,
            skip_empty: config.sync.skip_empty_documents,
            namespace: config.index.namespace.clone(),
            batch_size: config.embedding.batch_size.max(1),
        }
    }
}

/// What one cycle did.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct CycleReport {
    pub rows: usize,
    pub documents: usize,
    pub upserted: usize,
    pub skipped_empty: usize,
    pub rejected: usize,
    pub dead_lettered: Vec<i64>,
    pub marked: u64,
}

/// Proof that the documents built from these change-log entries are in the
/// index.
#[derive(Debug)]
pub struct UpsertReceipt {
    change_ids: BTreeSet<i64>,
}

impl UpsertReceipt {
    pub fn change_ids(&self) -> &BTreeSet<i64> {
        &self.change_ids
    }
}

/// Consecutive cycles in which the same document was the only one and
/// failed to embed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SoloFailureStreak {
    pub document_id: String,
    pub cycles: u32,
}

/// Delay policy between cycles.
#[derive(Debug, Clone)]
pub struct Backoff {
    interval: Duration,
    max: Duration,
    failures: u32,
}

impl Backoff {
    pub fn new(interval: Duration, max: Duration) -> Self {
        Self {
            interval,
            max: max.max(interval),
            failures: 0,
        }
    }

    pub fn failures(&self) -> u32 {
        self.failures
    }

    /// Delay after a good cycle. Resets the failure streak.
    pub fn succeeded(&mut self) -> Duration {
        self.failures = 0;
        self.interval
    }

    /// Delay after the next consecutive failure: `interval × 2^(n-1)`, capped.
    pub fn failed(&mut self) -> Duration {
        self.failures = self.failures.saturating_add(1);
        let factor = 1u32 << (self.failures - 1).min(16);
        self.interval.saturating_mul(factor).min(self.max)
    }
}

pub struct SyncEngine {
    feed: Arc<dyn ChangeFeed>,
    embedder: Arc<dyn Embedder>,
    sink: Arc<dyn VectorSink>,
    ledger: Arc<dyn ProcessedLedger>,
    settings: SyncSettings,
    solo_failures: Mutex<Option<SoloFailureStreak>>,
}

impl SyncEngine {
    pub fn new(
        feed: Arc<dyn ChangeFeed>,
        embedder: Arc<dyn Embedder>,
        sink: Arc<dyn VectorSink>,
        ledger: Arc<dyn ProcessedLedger>,
        settings: SyncSettings,
    ) -> Self {
        Self {
            feed,
            embedder,
            sink,
            ledger,
            settings,
            solo_failures: Mutex::new(None),
        }
    }

    /// Wire the engine to the store, embedder and index named in `config`.
    pub async fn from_config(config: &Config) -> Result<Self> {
        let pool = db::connect(config).await?;
        let embedder = create_embedder(&config.embedding)?;
        let sink = create_sink(config).await?;

        Ok(Self::new(
            Arc::new(ChangeLogReader::new(pool.clone())),
            embedder,
            sink,
            Arc::new(ProcessedMarker::new(pool)),
            SyncSettings::from_config(config),
        ))
    }

    /// One pass: read, group, embed, upsert, mark.
    pub async fn run_cycle(&self) -> Result<CycleReport, SyncError> {
        let rows = self.feed.fetch_changed().await?;
        if rows.is_empty() {
            return Ok(CycleReport::default());
        }

        let grouping = group_rows(&rows);
        let mut report = CycleReport {
            rows: rows.len(),
            documents: grouping.documents.len(),
            rejected: grouping.rejected.len(),
            ..Default::default()
        };

        if !grouping.rejected.is_empty() {
            report.dead_lettered = self
                .ledger
                .record_failures(&grouping.rejected, self.settings.max_attempts)
                .await?;
        }

        let (empty, to_embed): (Vec<LogicalDocument>, Vec<LogicalDocument>) = grouping
            .documents
            .into_iter()
            .partition(|doc| self.settings.skip_empty && doc.is_empty());
        report.skipped_empty = empty.len();
        for doc in &empty {
            debug!(id = %doc.id(), "skipping document without products");
        }

        let (records, poisoned) = self.embed_documents(&to_embed).await?;

        if !poisoned.is_empty() {
            let mut dead = self
                .ledger
                .record_failures(&poisoned, self.settings.max_attempts)
                .await?;
            report.dead_lettered.append(&mut dead);
        }

        let receipt = self.upsert(&records, &to_embed, &empty).await?;
        report.upserted = records.len();

        report.marked = self.ledger.mark_processed(receipt.change_ids()).await?;
        Ok(report)
    }

    /// Embed every document, isolating the ones that fail alone.
    ///
    /// Returns the records ready to upsert and one rejection per record id
    /// of each document that could not be embedded. Fails as a whole only
    /// when nothing could be embedded.
    async fn embed_documents(
        &self,
        documents: &[LogicalDocument],
    ) -> Result<(Vec<(usize, VectorRecord)>, Vec<RejectedRecord>), SyncError> {
        let mut records = Vec::with_capacity(documents.len());
        let mut failed: Vec<(usize, String)> = Vec::new();
        let mut offset = 0;

        for batch in documents.chunks(self.settings.batch_size) {
            match self.embed_batch(batch).await {
                Ok(vectors) => {
                    for (i, (doc, values)) in batch.iter().zip(vectors).enumerate() {
                        records.push((offset + i, VectorRecord::from_document(doc, values)));
                    }
                }
                Err(err) if batch.len() > 1 => {
                    warn!(
                        documents = batch.len(),
                        error = %err,
                        "embedding batch failed; retrying documents one at a time"
                    );
                    for (i, doc) in batch.iter().enumerate() {
                        match self.embed_batch(std::slice::from_ref(doc)).await {
                            Ok(mut vectors) => {
                                if let Some(values) = vectors.pop() {
                                    records.push((offset + i, VectorRecord::from_document(doc, values)));
                                }
                            }
                            Err(err) => failed.push((offset + i, format!("{:#}", err))),
                        }
                    }
                }
                Err(err) => failed.push((offset, format!("{:#}", err))),
            }
            offset += batch.len();
        }

        if records.is_empty() {
            if let Some((index, reason)) = failed.into_iter().last() {
                if documents.len() == 1 {
                    self.note_solo_failure(&documents[index], &reason);
                }
                return Err(SyncError::Embedding(reason));
            }
            return Ok((records, Vec::new()));
        }
        self.clear_solo_failures();

        let mut poisoned = Vec::new();
        for (index, reason) in failed {
            let doc = &documents[index];
            warn!(id = %doc.id(), error = %reason, "document failed to embed on its own");
            poisoned.extend(doc.record_ids.iter().map(|&record_id| RejectedRecord {
                record_id,
                reason: format!("embedding failed for {}: {}", doc.id(), reason),
            }));
        }

        Ok((records, poisoned))
    }

    fn note_solo_failure(&self, doc: &LogicalDocument, reason: &str) {
        let id = doc.id();
        let mut streak = match self.solo_failures.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        let cycles = match streak.as_mut() {
            Some(current) if current.document_id == id => {
                current.cycles = current.cycles.saturating_add(1);
                current.cycles
            }
            _ => {
                *streak = Some(SoloFailureStreak {
                    document_id: id.clone(),
                    cycles: 1,
                });
                1
            }
        };
        warn!(
            id = %id,
            records = ?doc.record_ids,
            cycles,
            error = %reason,
            "only document in cycle failed to embed; not charging it"
        );
    }

    fn clear_solo_failures(&self) {
        let mut streak = match self.solo_failures.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        *streak = None;
    }

    /// The current solo embedding failure streak, if any.
    pub fn solo_failure_streak(&self) -> Option<SoloFailureStreak> {
        match self.solo_failures.lock() {
            Ok(guard) => guard.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        }
    }

    async fn embed_batch(&self, batch: &[LogicalDocument]) -> Result<Vec<Vec<f32>>> {
        let texts: Vec<String> = batch.iter().map(|d| d.summary_text.clone()).collect();
        let vectors = self.embedder.embed(&texts).await?;
        if vectors.len() != texts.len() {
            anyhow::bail!(
                "embedder returned {} vectors for {} texts",
                vectors.len(),
                texts.len()
            );
        }
        Ok(vectors)
    }

    /// Push the embedded records to the index. The receipt covers their
    /// documents plus the suppressed empty ones.
    async fn upsert(
        &self,
        records: &[(usize, VectorRecord)],
        documents: &[LogicalDocument],
        empty: &[LogicalDocument],
    ) -> Result<UpsertReceipt, SyncError> {
        if !records.is_empty() {
            let batch: Vec<VectorRecord> = records.iter().map(|(_, r)| r.clone()).collect();
            self.sink
                .upsert(&batch, &self.settings.namespace)
                .await
                .map_err(|e| SyncError::Upsert(format!("{} sink: {:#}", self.sink.name(), e)))?;
        }

        let change_ids = records
            .iter()
            .flat_map(|(index, _)| documents[*index].change_ids.iter().copied())
            .chain(empty.iter().flat_map(|doc| doc.change_ids.iter().copied()))
            .collect();

        Ok(UpsertReceipt { change_ids })
    }

    /// Run cycles until `cancel` fires.
    pub async fn run(&self, cancel: CancellationToken) {
        let mut backoff = Backoff::new(self.settings.interval, self.settings.max_backoff);

        info!(
            interval_secs = self.settings.interval.as_secs_f64(),
            namespace = %self.settings.namespace,
            sink = self.sink.name(),
            model = self.embedder.model_name(),
            "sync loop started"
        );

        loop {
            if cancel.is_cancelled() {
                break;
            }

            let result = tokio::select! {
                biased;
                _ = cancel.cancelled() => break,
                result = self.run_cycle() => result,
            };

            let delay = match result {
                Ok(report) => {
                    if report.rows > 0 {
                        info!(
                            rows = report.rows,
                            documents = report.documents,
                            upserted = report.upserted,
                            skipped_empty = report.skipped_empty,
                            rejected = report.rejected,
                            marked = report.marked,
                            "sync cycle complete"
                        );
                    } else {
                        debug!("no pending changes");
                    }
                    if backoff.failures() > 0 {
                        info!(after_failures = backoff.failures(), "sync recovered");
                    }
                    backoff.succeeded()
                }
                Err(err) => {
                    let delay = backoff.failed();
                    error!(
                        stage = err.stage(),
                        error = %err,
                        consecutive_failures = backoff.failures(),
                        retry_in_secs = delay.as_secs_f64(),
                        "sync cycle failed"
                    );
                    delay
                }
            };

            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = tokio::time::sleep(delay) => {}
            }
        }

        info!("sync loop stopped");
    }
}

/// `psync sync`: run the engine until Ctrl+C (or once with `--once`),
/// optionally alongside the synthetic order writer.
pub async fn run_sync(
    config: &Config,
    once: bool,
    follow_writer: bool,
    cancel: CancellationToken,
) -> Result<()> {
    let engine = SyncEngine::from_config(config).await?;

    if once {
        let report = engine.run_cycle().await?;
        println!(
            "Sync complete: {} change rows, {} documents, {} upserted, {} skipped (empty), {} rejected, {} marked processed",
            report.rows,
            report.documents,
            report.upserted,
            report.skipped_empty,
            report.rejected,
            report.marked
        );
        if !report.dead_lettered.is_empty() {
            println!("Dead-lettered records: {:?}", report.dead_lettered);
        }
        return Ok(());
    }

    let writer = if follow_writer {
        let pool = db::connect(config).await?;
        let token = cancel.clone();
        Some(tokio::spawn(async move {
            if let Err(e) = seed::run_writer(&pool, token).await {
                error!(error = %format!("{:#}", e), "order writer stopped");
            }
            pool.close().await;
        }))
    } else {
        None
    };

    engine.run(cancel).await;

    if let Some(handle) = writer {
        let _ = handle.await;
    }
    Ok(())
}
