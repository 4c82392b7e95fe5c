//! Change-log reader.
//!
//! Finds unprocessed change-log entries and joins them with the current
//! state of the order, user and product they point at.

use async_trait::async_trait;
use sqlx::sqlite::SqliteRow;
use sqlx::{Row, SqlitePool};
use tracing::debug;

use crate::error::SyncError;
use crate::models::JoinedRow;
use crate::traits::ChangeFeed;

const FETCH_CHANGED_SQL: &str = r#"
    SELECT
        c.change_id,
        c.record_id,
        c.operation,
        c.change_time,
        u.user_id,
        u.user_name,
        o.order_id,
        o.product_id,
        o.order_date,
        p.product_name,
        p.category
    FROM change_log c
    JOIN orders o ON o.order_id = c.record_id
    JOIN users u ON u.user_id = o.user_id
    JOIN products p ON p.product_id = o.product_id
    WHERE c.processed = 0
      AND c.record_id NOT IN (SELECT record_id FROM dead_letters)
    ORDER BY c.change_time ASC, c.change_id ASC
"#;

pub struct ChangeLogReader {
    pool: SqlitePool,
}

impl ChangeLogReader {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    /// Read every pending change. Does not retry; errors are the caller's.
    pub async fn fetch_changed(&self) -> Result<Vec<JoinedRow>, SyncError> {
        let mut conn = self.pool.acquire().await.map_err(SyncError::read)?;

        let rows = sqlx::query(FETCH_CHANGED_SQL)
            .fetch_all(&mut *conn)
            .await
            .map_err(SyncError::read)?;

        let joined = rows
            .iter()
            .map(row_to_joined)
            .collect::<Result<Vec<_>, _>>()
            .map_err(SyncError::read)?;

        debug!(rows = joined.len(), "fetched pending changes");
        Ok(joined)
    }
}

fn row_to_joined(row: &SqliteRow) -> Result<JoinedRow, sqlx::Error> {
    Ok(JoinedRow {
        change_id: row.try_get("change_id")?,
        record_id: row.try_get("record_id")?,
        operation: row.try_get("operation")?,
        change_time: row.try_get("change_time")?,
        user_id: row.try_get("user_id")?,
        user_name: row.try_get("user_name")?,
        order_id: row.try_get("order_id")?,
        product_id: row.try_get("product_id")?,
        order_date: row.try_get("order_date")?,
        product_name: row.try_get("product_name")?,
        category: row.try_get("category")?,
    })
}

#[async_trait]
impl ChangeFeed for ChangeLogReader {
    async fn fetch_changed(&self) -> Result<Vec<JoinedRow>, SyncError> {
        ChangeLogReader::fetch_changed(self).await
    }
}
