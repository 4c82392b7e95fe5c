//! Processed marker and retry ledger.
//!
//! Flips `change_log.processed` once a cycle's documents are durably in the
//! index, and keeps per-record attempt counts for records that keep failing
//! on their own. Records that reach the attempt ceiling move to
//! `dead_letters`, where the reader stops seeing them.

use async_trait::async_trait;
use sqlx::{QueryBuilder, Row, Sqlite, SqlitePool};
use std::collections::BTreeSet;
use tracing::{debug, warn};

use crate::error::SyncError;
use crate::models::{DeadLetter, RejectedRecord};
use crate::traits::ProcessedLedger;

pub struct ProcessedMarker {
    pool: SqlitePool,
}

impl ProcessedMarker {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    /// Mark the change-log entries `change_ids` processed, in one
    /// transaction, and reset the failure counts of their records.
    ///
    /// Only the listed entries are touched. An entry written for the same
    /// order after the cycle read the log stays pending for the next cycle.
    pub async fn mark_processed(&self, change_ids: &BTreeSet<i64>) -> Result<u64, SyncError> {
        if change_ids.is_empty() {
            return Ok(0);
        }

        let mut tx = self.pool.begin().await.map_err(SyncError::mark)?;

        let mut update: QueryBuilder<Sqlite> = QueryBuilder::new(
            "UPDATE change_log SET processed = 1 WHERE processed = 0 AND change_id IN (",
        );
        push_id_list(&mut update, change_ids);
        let updated = update
            .build()
            .execute(&mut *tx)
            .await
            .map_err(SyncError::mark)?
            .rows_affected();

        let mut clear: QueryBuilder<Sqlite> = QueryBuilder::new(
            "DELETE FROM sync_failures WHERE record_id IN \
             (SELECT record_id FROM change_log WHERE change_id IN (",
        );
        push_id_list(&mut clear, change_ids);
        clear.push(")");
        clear
            .build()
            .execute(&mut *tx)
            .await
            .map_err(SyncError::mark)?;

        tx.commit().await.map_err(SyncError::mark)?;

        debug!(entries = change_ids.len(), rows = updated, "marked processed");
        Ok(updated)
    }

    /// Charge one attempt per rejected record. Records that reach
    /// `max_attempts` are dead-lettered; their ids are returned.
    pub async fn record_failures(
        &self,
        rejected: &[RejectedRecord],
        max_attempts: u32,
    ) -> Result<Vec<i64>, SyncError> {
        if rejected.is_empty() {
            return Ok(Vec::new());
        }

        let now = chrono::Utc::now().timestamp();
        let mut seen = BTreeSet::new();
        let mut dead = Vec::new();
        let mut tx = self.pool.begin().await.map_err(SyncError::ledger)?;

        for record in rejected {
            // One charge per record per cycle
            if !seen.insert(record.record_id) {
                continue;
            }

            let attempts: i64 = sqlx::query_scalar(
                r#"
                INSERT INTO sync_failures (record_id, attempts, last_error, updated_at)
                VALUES (?, 1, ?, ?)
                ON CONFLICT(record_id) DO UPDATE SET
                    attempts = attempts + 1,
                    last_error = excluded.last_error,
                    updated_at = excluded.updated_at
                RETURNING attempts
                "#,
            )
            .bind(record.record_id)
            .bind(&record.reason)
            .bind(now)
            .fetch_one(&mut *tx)
            .await
            .map_err(SyncError::ledger)?;

            if attempts < i64::from(max_attempts) {
                continue;
            }

            sqlx::query(
                r#"
                INSERT INTO dead_letters (record_id, attempts, last_error, dead_lettered_at)
                VALUES (?, ?, ?, ?)
                ON CONFLICT(record_id) DO UPDATE SET
                    attempts = excluded.attempts,
                    last_error = excluded.last_error,
                    dead_lettered_at = excluded.dead_lettered_at
                "#,
            )
            .bind(record.record_id)
            .bind(attempts)
            .bind(&record.reason)
            .bind(now)
            .execute(&mut *tx)
            .await
            .map_err(SyncError::ledger)?;

            sqlx::query("DELETE FROM sync_failures WHERE record_id = ?")
                .bind(record.record_id)
                .execute(&mut *tx)
                .await
                .map_err(SyncError::ledger)?;

            warn!(
                record_id = record.record_id,
                attempts,
                reason = %record.reason,
                "record dead-lettered"
            );
            dead.push(record.record_id);
        }

        tx.commit().await.map_err(SyncError::ledger)?;
        Ok(dead)
    }

    /// Every quarantined record, oldest first.
    pub async fn list_dead_letters(&self) -> Result<Vec<DeadLetter>, SyncError> {
        let rows = sqlx::query(
            "SELECT record_id, attempts, last_error, dead_lettered_at FROM dead_letters ORDER BY dead_lettered_at, record_id",
        )
        .fetch_all(&self.pool)
        .await
        .map_err(SyncError::ledger)?;

        rows.iter()
            .map(|row| -> Result<DeadLetter, sqlx::Error> {
                Ok(DeadLetter {
                    record_id: row.try_get("record_id")?,
                    attempts: row.try_get("attempts")?,
                    last_error: row.try_get("last_error")?,
                    dead_lettered_at: row.try_get("dead_lettered_at")?,
                })
            })
            .collect::<Result<Vec<_>, sqlx::Error>>()
            .map_err(SyncError::ledger)
    }

    /// Put dead-lettered records back in play with a fresh attempt budget.
    /// `None` requeues everything. Returns how many were released.
    pub async fn requeue(&self, record_ids: Option<&[i64]>) -> Result<u64, SyncError> {
        let released = match record_ids {
            None => sqlx::query("DELETE FROM dead_letters")
                .execute(&self.pool)
                .await
                .map_err(SyncError::ledger)?
                .rows_affected(),
            Some([]) => 0,
            Some(ids) => {
                let ids: BTreeSet<i64> = ids.iter().copied().collect();
                let mut delete: QueryBuilder<Sqlite> =
                    QueryBuilder::new("DELETE FROM dead_letters WHERE record_id IN (");
                push_id_list(&mut delete, &ids);
                delete
                    .build()
                    .execute(&self.pool)
                    .await
                    .map_err(SyncError::ledger)?
                    .rows_affected()
            }
        };
        Ok(released)
    }
}

/// Append `a, b, c)` to a query that ends in `IN (`.
fn push_id_list(builder: &mut QueryBuilder<'_, Sqlite>, ids: &BTreeSet<i64>) {
    let mut separated = builder.separated(", ");
    for id in ids {
        separated.push_bind(*id);
    }
    separated.push_unseparated(")");
}

#[async_trait]
impl ProcessedLedger for ProcessedMarker {
    async fn mark_processed(&self, change_ids: &BTreeSet<i64>) -> Result<u64, SyncError> {
        ProcessedMarker::mark_processed(self, change_ids).await
    }

    async fn record_failures(
        &self,
        rejected: &[RejectedRecord],
        max_attempts: u32,
    ) -> Result<Vec<i64>, SyncError> {
        ProcessedMarker::record_failures(self, rejected, max_attempts).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::{insert_order, insert_product, insert_user, store};

    async fn processed_flags(pool: &SqlitePool) -> Vec<(i64, i64)> {
        sqlx::query_as("SELECT record_id, processed FROM change_log ORDER BY change_id")
            .fetch_all(pool)
            .await
            .unwrap()
    }

    fn rejected(record_id: i64) -> RejectedRecord {
        RejectedRecord {
            record_id,
            reason: "unparseable order_date 'soon'".to_string(),
        }
    }

    #[tokio::test]
    async fn test_marks_exactly_the_given_ids() {
        let (_tmp, pool) = store().await;
        let alice = insert_user(&pool, "Alice").await;
        let pen = insert_product(&pool, "Pen (Red)", "Stationery").await;
        insert_order(&pool, 1, alice, pen, "2024-01-05").await;
        insert_order(&pool, 2, alice, pen, "2024-01-05").await;
        insert_order(&pool, 3, alice, pen, "2024-01-05").await;

        let marker = ProcessedMarker::new(pool.clone());
        let updated = marker
            .mark_processed(&BTreeSet::from([1, 3]))
            .await
            .unwrap();
        assert_eq!(updated, 2);
        assert_eq!(processed_flags(&pool).await, vec![(1, 1), (2, 0), (3, 1)]);

        // Re-marking is harmless
        let updated = marker
            .mark_processed(&BTreeSet::from([1, 3]))
            .await
            .unwrap();
        assert_eq!(updated, 0);
    }

    #[tokio::test]
    async fn test_later_entry_for_same_order_stays_pending() {
        let (_tmp, pool) = store().await;
        let alice = insert_user(&pool, "Alice").await;
        let pen = insert_product(&pool, "Pen (Red)", "Stationery").await;
        insert_order(&pool, 1, alice, pen, "2024-01-05").await;
        sqlx::query("UPDATE orders SET order_date = '2024-01-09' WHERE order_id = 1")
            .execute(&pool)
            .await
            .unwrap();

        let marker = ProcessedMarker::new(pool.clone());
        marker.record_failures(&[rejected(1)], 5).await.unwrap();
        let updated = marker
            .mark_processed(&BTreeSet::from([1]))
            .await
            .unwrap();
        assert_eq!(updated, 1);
        assert_eq!(processed_flags(&pool).await, vec![(1, 1), (1, 0)]);

        let pending: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM sync_failures")
            .fetch_one(&pool)
            .await
            .unwrap();
        assert_eq!(pending, 0);
    }

    #[tokio::test]
    async fn test_empty_set_is_noop() {
        let (_tmp, pool) = store().await;
        let marker = ProcessedMarker::new(pool);
        assert_eq!(marker.mark_processed(&BTreeSet::new()).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_closed_pool_is_a_mark_error() {
        let (_tmp, pool) = store().await;
        pool.close().await;
        let err = ProcessedMarker::new(pool)
            .mark_processed(&BTreeSet::from([1]))
            .await
            .unwrap_err();
        assert!(matches!(err, SyncError::Mark(_)));
    }

    #[tokio::test]
    async fn test_dead_letter_after_max_attempts() {
        let (_tmp, pool) = store().await;
        let marker = ProcessedMarker::new(pool.clone());

        for _ in 0..2 {
            let dead = marker.record_failures(&[rejected(5)], 3).await.unwrap();
            assert!(dead.is_empty());
        }
        let dead = marker
            .record_failures(&[rejected(5), rejected(5)], 3)
            .await
            .unwrap();
        assert_eq!(dead, vec![5]);

        let letters = marker.list_dead_letters().await.unwrap();
        assert_eq!(letters.len(), 1);
        assert_eq!(letters[0].record_id, 5);
        assert_eq!(letters[0].attempts, 3);
        assert!(letters[0].last_error.contains("order_date"));

        let pending: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM sync_failures")
            .fetch_one(&pool)
            .await
            .unwrap();
        assert_eq!(pending, 0);
    }

    #[tokio::test]
    async fn test_marking_clears_failure_count() {
        let (_tmp, pool) = store().await;
        let alice = insert_user(&pool, "Alice").await;
        let pen = insert_product(&pool, "Pen (Red)", "Stationery").await;
        insert_order(&pool, 1, alice, pen, "2024-01-05").await;

        let marker = ProcessedMarker::new(pool.clone());
        marker.record_failures(&[rejected(1)], 5).await.unwrap();
        marker.mark_processed(&BTreeSet::from([1])).await.unwrap();

        let pending: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM sync_failures")
            .fetch_one(&pool)
            .await
            .unwrap();
        assert_eq!(pending, 0);
    }

    #[tokio::test]
    async fn test_requeue() {
        let (_tmp, pool) = store().await;
        let marker = ProcessedMarker::new(pool);
        marker
            .record_failures(&[rejected(1), rejected(2), rejected(3)], 1)
            .await
            .unwrap();
        assert_eq!(marker.list_dead_letters().await.unwrap().len(), 3);

        assert_eq!(marker.requeue(Some(&[2, 99])).await.unwrap(), 1);
        assert_eq!(marker.requeue(Some(&[])).await.unwrap(), 0);
        let remaining: Vec<i64> = marker
            .list_dead_letters()
            .await
            .unwrap()
            .iter()
            .map(|d| d.record_id)
            .collect();
        assert_eq!(remaining, vec![1, 3]);

        assert_eq!(marker.requeue(None).await.unwrap(), 2);
        assert!(marker.list_dead_letters().await.unwrap().is_empty());
    }
}
