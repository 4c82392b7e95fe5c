//! Sync status overview.
//!
//! Summarizes the change log, the retry ledger, dead letters and the local
//! index, so it is easy to see whether the loop is keeping up. Used by
//! `psync status`.

use anyhow::Result;
use sqlx::SqlitePool;

use crate::config::Config;
use crate::db;
use crate::sink::LocalIndex;

/// Counts behind `psync status`.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct SyncStatus {
    pub pending: i64,
    pub processed: i64,
    pub retrying: i64,
    pub dead_letters: i64,
    pub oldest_pending: Option<String>,
    pub last_change: Option<String>,
    /// `None` when the index is not local.
    pub vectors: Option<i64>,
}

pub async fn collect_status(pool: &SqlitePool) -> Result<SyncStatus> {
    let (pending, processed): (i64, i64) = sqlx::query_as(
        r#"
        SELECT
            COALESCE(SUM(CASE WHEN processed = 0 THEN 1 ELSE 0 END), 0),
            COALESCE(SUM(CASE WHEN processed = 1 THEN 1 ELSE 0 END), 0)
        FROM change_log
        "#,
    )
    .fetch_one(pool)
    .await?;

    let retrying: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM sync_failures")
        .fetch_one(pool)
        .await?;
    let dead_letters: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM dead_letters")
        .fetch_one(pool)
        .await?;

    let oldest_pending: Option<String> =
        sqlx::query_scalar("SELECT MIN(change_time) FROM change_log WHERE processed = 0")
            .fetch_one(pool)
            .await?;
    let last_change: Option<String> = sqlx::query_scalar("SELECT MAX(change_time) FROM change_log")
        .fetch_one(pool)
        .await?;

    Ok(SyncStatus {
        pending,
        processed,
        retrying,
        dead_letters,
        oldest_pending,
        last_change,
        vectors: None,
    })
}

/// Run the status command: query the store and print a summary.
pub async fn run_status(config: &Config) -> Result<()> {
    let pool = db::connect(config).await?;
    let mut status = collect_status(&pool).await?;
    pool.close().await;

    if config.index.provider == "local" {
        let index = LocalIndex::open(config.index_path()).await?;
        status.vectors = Some(index.count(&config.index.namespace).await?);
        index.close().await;
    }

    let db_size = std::fs::metadata(&config.db.path)
        .map(|m| m.len())
        .unwrap_or(0);

    println!("Purchase Sync Status");
    println!("====================");
    println!();
    println!("  Database:    {}", config.db.path.display());
    println!("  Size:        {}", format_bytes(db_size));
    println!(
        "  Index:       {} / {} ({})",
        config.index.name, config.index.namespace, config.index.provider
    );
    println!();
    println!("  Pending:     {}", status.pending);
    println!("  Processed:   {}", status.processed);
    println!("  Retrying:    {}", status.retrying);
    println!("  Dead:        {}", status.dead_letters);
    if let Some(vectors) = status.vectors {
        println!("  Vectors:     {}", vectors);
    }
    println!();
    println!(
        "  Oldest pending change: {}",
        status.oldest_pending.as_deref().unwrap_or("none")
    );
    println!(
        "  Last change:           {}",
        status.last_change.as_deref().unwrap_or("never")
    );
    println!();

    Ok(())
}

/// Format a byte count as a human-readable string.
fn format_bytes(bytes: u64) -> String {
    if bytes < 1024 {
        format!("{} B", bytes)
    } else if bytes < 1024 * 1024 {
        format!("{:.1} KB", bytes as f64 / 1024.0)
    } else if bytes < 1024 * 1024 * 1024 {
        format!("{:.1} MB", bytes as f64 / (1024.0 * 1024.0))
    } else {
        format!("{:.2} GB", bytes as f64 / (1024.0 * 1024.0 * 1024.0))
    }
}
