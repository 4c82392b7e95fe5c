use anyhow::Result;
use sqlx::SqlitePool;

use crate::config::Config;
use crate::db;
use crate::sink::LocalIndex;

pub async fn run_migrations(config: &Config) -> Result<()> {
    let pool = db::connect(config).await?;
    migrate_store(&pool).await?;
    pool.close().await;

    if config.index.provider == "local" {
        let index = LocalIndex::open(config.index_path()).await?;
        index.close().await;
    }

    Ok(())
}

/// Create the relational schema, the change-log triggers and the engine's
/// bookkeeping tables. Idempotent.
pub async fn migrate_store(pool: &SqlitePool) -> Result<()> {
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS users (
            user_id INTEGER PRIMARY KEY AUTOINCREMENT,
            user_name TEXT
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS products (
            product_id INTEGER PRIMARY KEY AUTOINCREMENT,
            product_name TEXT,
            category TEXT
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS orders (
            order_id INTEGER PRIMARY KEY AUTOINCREMENT,
            user_id INTEGER NOT NULL,
            product_id INTEGER NOT NULL,
            order_date TEXT NOT NULL,
            FOREIGN KEY (user_id) REFERENCES users(user_id),
            FOREIGN KEY (product_id) REFERENCES products(product_id)
        )
        "#,
    )
    .execute(pool)
    .await?;

    // Change log written by the triggers below
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS change_log (
            change_id INTEGER PRIMARY KEY AUTOINCREMENT,
            record_id INTEGER NOT NULL,
            operation TEXT NOT NULL,
            change_time TEXT NOT NULL,
            processed INTEGER NOT NULL DEFAULT 0
        )
        "#,
    )
    .execute(pool)
    .await?;

    for (name, event, operation) in [
        ("orders_change_insert", "INSERT", "INSERT"),
        ("orders_change_update", "UPDATE", "UPDATE"),
    ] {
        sqlx::query(&format!(
            r#"
            CREATE TRIGGER IF NOT EXISTS {name}
            AFTER {event} ON orders
            BEGIN
                INSERT INTO change_log (record_id, operation, change_time, processed)
                VALUES (NEW.order_id, '{operation}', strftime('%Y-%m-%d %H:%M:%f', 'now'), 0);
            END
            "#
        ))
        .execute(pool)
        .await?;
    }

    // Retry ledger for record-specific failures
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS sync_failures (
            record_id INTEGER PRIMARY KEY,
            attempts INTEGER NOT NULL,
            last_error TEXT NOT NULL,
            updated_at INTEGER NOT NULL
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS dead_letters (
            record_id INTEGER PRIMARY KEY,
            attempts INTEGER NOT NULL,
            last_error TEXT NOT NULL,
            dead_lettered_at INTEGER NOT NULL
        )
        "#,
    )
    .execute(pool)
    .await?;

    // Create indexes
    sqlx::query(
        "CREATE INDEX IF NOT EXISTS idx_change_log_pending ON change_log(processed, change_time)",
    )
    .execute(pool)
    .await?;
    sqlx::query("CREATE INDEX IF NOT EXISTS idx_change_log_record ON change_log(record_id)")
        .execute(pool)
        .await?;
    sqlx::query(
        "CREATE INDEX IF NOT EXISTS idx_orders_user_date ON orders(user_id, order_date)",
    )
    .execute(pool)
    .await?;

    Ok(())
}
