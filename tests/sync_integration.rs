//! End-to-end cycles against a real SQLite store and local index.

use anyhow::Result;
use async_trait::async_trait;
use sqlx::SqlitePool;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tempfile::TempDir;
use tokio_util::sync::CancellationToken;

use purchase_sync::config::Config;
use purchase_sync::db;
use purchase_sync::embedding::create_embedder;
use purchase_sync::error::SyncError;
use purchase_sync::marker::ProcessedMarker;
use purchase_sync::migrate::run_migrations;
use purchase_sync::models::VectorRecord;
use purchase_sync::reader::ChangeLogReader;
use purchase_sync::sink::LocalIndex;
use purchase_sync::sync_loop::{SyncEngine, SyncSettings};
use purchase_sync::traits::VectorSink;

struct Env {
    _tmp: TempDir,
    config: Config,
    pool: SqlitePool,
}

async fn setup() -> Env {
    let tmp = TempDir::new().unwrap();
    let mut config = Config::with_db_path(tmp.path().join("store.sqlite"));
    config.index.path = Some(tmp.path().join("vectors.sqlite"));
    config.sync.max_attempts = 2;
    run_migrations(&config).await.unwrap();
    let pool = db::connect(&config).await.unwrap();
    Env {
        _tmp: tmp,
        config,
        pool,
    }
}

async fn insert_user(pool: &SqlitePool, name: &str) -> i64 {
    sqlx::query("INSERT INTO users (user_name) VALUES (?)")
        .bind(name)
        .execute(pool)
        .await
        .unwrap()
        .last_insert_rowid()
}

async fn insert_product(pool: &SqlitePool, name: &str, category: &str) -> i64 {
    sqlx::query("INSERT INTO products (product_name, category) VALUES (?, ?)")
        .bind(name)
        .bind(category)
        .execute(pool)
        .await
        .unwrap()
        .last_insert_rowid()
}

async fn insert_order(pool: &SqlitePool, order_id: i64, user_id: i64, product_id: i64, date: &str) {
    sqlx::query(
        "INSERT INTO orders (order_id, user_id, product_id, order_date) VALUES (?, ?, ?, ?)",
    )
    .bind(order_id)
    .bind(user_id)
    .bind(product_id)
    .bind(date)
    .execute(pool)
    .await
    .unwrap();
}

async fn processed(pool: &SqlitePool, record_id: i64) -> Vec<i64> {
    sqlx::query_scalar("SELECT processed FROM change_log WHERE record_id = ? ORDER BY change_id")
        .bind(record_id)
        .fetch_all(pool)
        .await
        .unwrap()
}

/// Alice buys shampoo and body lotion on 2024-01-05 (orders 10 and 11).
async fn alice_scenario(pool: &SqlitePool) -> i64 {
    let alice = insert_user(pool, "Alice").await;
    let shampoo = insert_product(pool, "Shampoo (Yellow)", "Personal Care").await;
    let lotion = insert_product(pool, "Body Lotion (Pink)", "Personal Care").await;
    insert_order(pool, 10, alice, shampoo, "2024-01-05").await;
    insert_order(pool, 11, alice, lotion, "2024-01-05").await;
    alice
}

struct DownSink {
    down: AtomicBool,
    inner: LocalIndex,
}

#[async_trait]
impl VectorSink for DownSink {
    fn name(&self) -> &str {
        "down"
    }

    async fn upsert(&self, records: &[VectorRecord], namespace: &str) -> Result<()> {
        if self.down.load(Ordering::SeqCst) {
            anyhow::bail!("503 Service Unavailable");
        }
        self.inner.upsert(records, namespace).await
    }
}

#[tokio::test]
async fn test_alice_purchase_becomes_one_document() {
    let env = setup().await;
    let alice = alice_scenario(&env.pool).await;

    let engine = SyncEngine::from_config(&env.config).await.unwrap();
    let report = engine.run_cycle().await.unwrap();
    assert_eq!(report.documents, 1);
    assert_eq!(report.marked, 2);

    assert_eq!(processed(&env.pool, 10).await, vec![1]);
    assert_eq!(processed(&env.pool, 11).await, vec![1]);

    let index = LocalIndex::open(env.config.index_path()).await.unwrap();
    let id = format!("{}_2024-01-05", alice);
    let hit = index
        .get(&id, &env.config.index.namespace)
        .await
        .unwrap()
        .expect("document indexed");
    assert_eq!(
        hit.text,
        "User Alice ordered Shampoo (Yellow) (Personal Care) and Body Lotion (Pink) (Personal Care) on 2024-01-05"
    );
    assert_eq!(hit.metadata["user_id"], alice);
    assert_eq!(hit.metadata["products"][0], "Shampoo (Yellow)");
    assert_eq!(hit.metadata["categories"][1], "Personal Care");
    assert_eq!(index.count(&env.config.index.namespace).await.unwrap(), 1);
}

#[tokio::test]
async fn test_upsert_outage_keeps_rows_pending_and_loop_alive() {
    let env = setup().await;
    alice_scenario(&env.pool).await;

    let sink = Arc::new(DownSink {
        down: AtomicBool::new(true),
        inner: LocalIndex::open(env.config.index_path()).await.unwrap(),
    });
    let settings = SyncSettings {
        interval: Duration::from_millis(20),
        max_backoff: Duration::from_millis(80),
        ..SyncSettings::from_config(&env.config)
    };
    let engine = Arc::new(SyncEngine::new(
        Arc::new(ChangeLogReader::new(env.pool.clone())),
        create_embedder(&env.config.embedding).unwrap(),
        sink.clone(),
        Arc::new(ProcessedMarker::new(env.pool.clone())),
        settings,
    ));

    let err = engine.run_cycle().await.unwrap_err();
    assert!(matches!(err, SyncError::Upsert(_)));
    assert_eq!(processed(&env.pool, 10).await, vec![0]);
    assert_eq!(processed(&env.pool, 11).await, vec![0]);

    let cancel = CancellationToken::new();
    let handle = tokio::spawn({
        let engine = engine.clone();
        let cancel = cancel.clone();
        async move { engine.run(cancel).await }
    });

    tokio::time::sleep(Duration::from_millis(100)).await;
    assert!(!handle.is_finished());
    assert_eq!(processed(&env.pool, 10).await, vec![0]);

    sink.down.store(false, Ordering::SeqCst);
    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    while processed(&env.pool, 11).await != vec![1] {
        assert!(tokio::time::Instant::now() < deadline, "loop never recovered");
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    assert_eq!(processed(&env.pool, 10).await, vec![1]);

    cancel.cancel();
    tokio::time::timeout(Duration::from_secs(2), handle)
        .await
        .expect("loop did not stop")
        .unwrap();
}

#[tokio::test]
async fn test_bad_rows_are_dead_lettered_and_requeueable() {
    let env = setup().await;
    let bob = insert_user(&env.pool, "Bob").await;
    let ring = insert_product(&env.pool, "Ring (Gold)", "Jewelry").await;
    insert_order(&env.pool, 50, bob, ring, "the day after tomorrow").await;

    let engine = SyncEngine::from_config(&env.config).await.unwrap();
    let first = engine.run_cycle().await.unwrap();
    assert_eq!(first.rejected, 1);
    assert!(first.dead_lettered.is_empty());

    let second = engine.run_cycle().await.unwrap();
    assert_eq!(second.dead_lettered, vec![50]);
    assert_eq!(engine.run_cycle().await.unwrap().rows, 0);

    // Fix the row and release it
    sqlx::query("UPDATE orders SET order_date = '2024-02-14' WHERE order_id = 50")
        .execute(&env.pool)
        .await
        .unwrap();
    let marker = ProcessedMarker::new(env.pool.clone());
    assert_eq!(marker.requeue(Some(&[50])).await.unwrap(), 1);

    let report = engine.run_cycle().await.unwrap();
    assert_eq!(report.documents, 1);
    assert_eq!(report.upserted, 1);
    // The original INSERT entry and the fixing UPDATE entry
    assert_eq!(report.marked, 2);
    assert_eq!(processed(&env.pool, 50).await, vec![1, 1]);
}

#[tokio::test]
async fn test_later_change_overwrites_same_document_id() {
    let env = setup().await;
    let alice = alice_scenario(&env.pool).await;

    let engine = SyncEngine::from_config(&env.config).await.unwrap();
    engine.run_cycle().await.unwrap();

    // A product rename reaches the index through the next order change
    sqlx::query("UPDATE products SET product_name = 'Shampoo (Blue)' WHERE product_name = 'Shampoo (Yellow)'")
        .execute(&env.pool)
        .await
        .unwrap();
    sqlx::query("UPDATE orders SET order_date = '2024-01-05' WHERE order_id = 10")
        .execute(&env.pool)
        .await
        .unwrap();

    let report = engine.run_cycle().await.unwrap();
    assert_eq!(report.rows, 1);
    assert_eq!(report.upserted, 1);

    let index = LocalIndex::open(env.config.index_path()).await.unwrap();
    let namespace = &env.config.index.namespace;
    assert_eq!(index.count(namespace).await.unwrap(), 1);
    let hit = index
        .get(&format!("{}_2024-01-05", alice), namespace)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(
        hit.text,
        "User Alice ordered Shampoo (Blue) (Personal Care) on 2024-01-05"
    );
}
