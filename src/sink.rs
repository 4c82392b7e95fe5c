//! Vector index backends.
//!
//! - **[`LocalIndex`]** stores vectors in a SQLite table and answers
//!   brute-force cosine queries. Used for development, tests and the
//!   `search` command.
//! - **[`PineconeSink`]** upserts into a hosted Pinecone index over REST.
//!
//! Both overwrite on id collision, so replaying a cycle is harmless.

use anyhow::{bail, Context, Result};
use async_trait::async_trait;
use sqlx::{Row, SqlitePool};
use std::path::Path;
use std::sync::Arc;
use tracing::debug;

use crate::config::Config;
use crate::db;
use crate::embedding::{blob_to_vec, cosine_similarity, vec_to_blob};
use crate::http;
use crate::models::VectorRecord;
use crate::traits::VectorSink;

/// Build the sink named by `index.provider`.
pub async fn create_sink(config: &Config) -> Result<Arc<dyn VectorSink>> {
    match config.index.provider.as_str() {
        "local" => Ok(Arc::new(LocalIndex::open(config.index_path()).await?)),
        "pinecone" => Ok(Arc::new(PineconeSink::new(config)?)),
        other => bail!("Unknown index provider: {}", other),
    }
}

// ============ Local index ============

/// A stored vector with its similarity to a query.
#[derive(Debug, Clone)]
pub struct SearchHit {
    pub id: String,
    pub score: f32,
    pub text: String,
    pub metadata: serde_json::Value,
}

/// SQLite-backed vector index.
pub struct LocalIndex {
    pool: SqlitePool,
}

impl LocalIndex {
    /// Open (creating if needed) the index database at `path`.
    pub async fn open(path: &Path) -> Result<Self> {
        let pool = db::connect_path(path)
            .await
            .with_context(|| format!("Failed to open vector index: {}", path.display()))?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS vector_records (
                namespace TEXT NOT NULL,
                id TEXT NOT NULL,
                embedding BLOB NOT NULL,
                dims INTEGER NOT NULL,
                text TEXT NOT NULL,
                metadata_json TEXT NOT NULL,
                updated_at INTEGER NOT NULL,
                PRIMARY KEY (namespace, id)
            )
            "#,
        )
        .execute(&pool)
        .await?;

        Ok(Self { pool })
    }

    /// Insert or overwrite `records` in one transaction.
    pub async fn upsert(&self, records: &[VectorRecord], namespace: &str) -> Result<()> {
        if records.is_empty() {
            return Ok(());
        }

        let now = chrono::Utc::now().timestamp();
        let mut tx = self.pool.begin().await?;

        for record in records {
            sqlx::query(
                r#"
                INSERT INTO vector_records (namespace, id, embedding, dims, text, metadata_json, updated_at)
                VALUES (?, ?, ?, ?, ?, ?, ?)
                ON CONFLICT(namespace, id) DO UPDATE SET
                    embedding = excluded.embedding,
                    dims = excluded.dims,
                    text = excluded.text,
                    metadata_json = excluded.metadata_json,
                    updated_at = excluded.updated_at
                "#,
            )
            .bind(namespace)
            .bind(&record.id)
            .bind(vec_to_blob(&record.values))
            .bind(record.values.len() as i64)
            .bind(&record.text)
            .bind(record.metadata_json().to_string())
            .bind(now)
            .execute(&mut *tx)
            .await?;
        }

        tx.commit().await?;
        debug!(namespace, count = records.len(), "local index upsert committed");
        Ok(())
    }

    /// Top-`k` records of `namespace` by cosine similarity to `query`.
    pub async fn search(&self, query: &[f32], namespace: &str, k: usize) -> Result<Vec<SearchHit>> {
        let rows = sqlx::query(
            "SELECT id, embedding, text, metadata_json FROM vector_records WHERE namespace = ?",
        )
        .bind(namespace)
        .fetch_all(&self.pool)
        .await?;

        let mut hits: Vec<SearchHit> = rows
            .iter()
            .map(|row| {
                let blob: Vec<u8> = row.get("embedding");
                let metadata: String = row.get("metadata_json");
                SearchHit {
                    id: row.get("id"),
                    score: cosine_similarity(query, &blob_to_vec(&blob)),
                    text: row.get("text"),
                    metadata: serde_json::from_str(&metadata).unwrap_or_default(),
                }
            })
            .collect();

        hits.sort_by(|a, b| {
            b.score
                .partial_cmp(&a.score)
                .unwrap_or(std::cmp::Ordering::Equal)
                .then_with(|| a.id.cmp(&b.id))
        });
        hits.truncate(k);
        Ok(hits)
    }

    /// Fetch one record by id.
    pub async fn get(&self, id: &str, namespace: &str) -> Result<Option<SearchHit>> {
        let row = sqlx::query(
            "SELECT id, text, metadata_json FROM vector_records WHERE namespace = ? AND id = ?",
        )
        .bind(namespace)
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;

        Ok(row.map(|row| {
            let metadata: String = row.get("metadata_json");
            SearchHit {
                id: row.get("id"),
                score: 1.0,
                text: row.get("text"),
                metadata: serde_json::from_str(&metadata).unwrap_or_default(),
            }
        }))
    }

    pub async fn count(&self, namespace: &str) -> Result<i64> {
        let count: i64 =
            sqlx::query_scalar("SELECT COUNT(*) FROM vector_records WHERE namespace = ?")
                .bind(namespace)
                .fetch_one(&self.pool)
                .await?;
        Ok(count)
    }

    pub async fn close(&self) {
        self.pool.close().await;
    }
}

#[async_trait]
impl VectorSink for LocalIndex {
    fn name(&self) -> &str {
        "local"
    }

    async fn upsert(&self, records: &[VectorRecord], namespace: &str) -> Result<()> {
        LocalIndex::upsert(self, records, namespace).await
    }
}

// ============ Pinecone ============

/// Upserts into a Pinecone serverless index.
///
/// Requires `index.host` in config and `PINECONE_API_KEY` in the environment.
pub struct PineconeSink {
    host: String,
    api_key: String,
    batch_size: usize,
    max_retries: u32,
    client: reqwest::Client,
}

impl PineconeSink {
    pub fn new(config: &Config) -> Result<Self> {
        let host = config
            .index
            .host
            .clone()
            .ok_or_else(|| anyhow::anyhow!("index.host required for Pinecone provider"))?;
        let api_key = std::env::var("PINECONE_API_KEY")
            .map_err(|_| anyhow::anyhow!("PINECONE_API_KEY environment variable not set"))?;

        let host = host.trim_end_matches('/');
        let host = if host.starts_with("http://") || host.starts_with("https://") {
            host.to_string()
        } else {
            format!("https://{}", host)
        };

        Ok(Self {
            host,
            api_key,
            batch_size: config.index.batch_size.max(1),
            max_retries: config.index.max_retries,
            client: http::client(config.index.timeout_secs)?,
        })
    }
}

fn upsert_body(records: &[VectorRecord], namespace: &str) -> serde_json::Value {
    let vectors: Vec<serde_json::Value> = records
        .iter()
        .map(|record| {
            serde_json::json!({
                "id": record.id,
                "values": record.values,
                "metadata": record.metadata_json(),
            })
        })
        .collect();

    serde_json::json!({
        "vectors": vectors,
        "namespace": namespace,
    })
}

/// Pinecone answers `{"upsertedCount": n}`; anything short of the batch
/// size is treated as a failed call.
fn check_upserted(json: &serde_json::Value, expected: usize) -> Result<()> {
    let upserted = json
        .get("upsertedCount")
        .and_then(|c| c.as_u64())
        .ok_or_else(|| anyhow::anyhow!("Invalid Pinecone response: missing upsertedCount"))?;
    if upserted as usize != expected {
        bail!(
            "Pinecone upserted {} of {} vectors",
            upserted,
            expected
        );
    }
    Ok(())
}

#[async_trait]
impl VectorSink for PineconeSink {
    fn name(&self) -> &str {
        "pinecone"
    }

    async fn upsert(&self, records: &[VectorRecord], namespace: &str) -> Result<()> {
        let url = format!("{}/vectors/upsert", self.host);

        for batch in records.chunks(self.batch_size) {
            let json = http::post_json(
                &self.client,
                "Pinecone",
                &url,
                &[("Api-Key", self.api_key.as_str())],
                &upsert_body(batch, namespace),
                self.max_retries,
            )
            .await?;
            check_upserted(&json, batch.len())?;
            debug!(namespace, count = batch.len(), "pinecone batch upserted");
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::DocumentMetadata;
    use tempfile::TempDir;

    fn record(id: &str, values: Vec<f32>, products: &[&str]) -> VectorRecord {
        VectorRecord {
            id: id.to_string(),
            values,
            metadata: DocumentMetadata {
                user_id: 1,
                user_name: "Alice".to_string(),
                order_date: "2024-01-05".to_string(),
                products: products.iter().map(|p| p.to_string()).collect(),
                categories: products.iter().map(|_| "Stationery".to_string()).collect(),
            },
            text: format!("User Alice ordered {}", products.join(" and ")),
        }
    }

    #[tokio::test]
    async fn test_upsert_same_id_keeps_latest() {
        let tmp = TempDir::new().unwrap();
        let index = LocalIndex::open(&tmp.path().join("index.sqlite"))
            .await
            .unwrap();

        index
            .upsert(&[record("1_2024-01-05", vec![1.0, 0.0], &["Pen (Red)"])], "ns")
            .await
            .unwrap();
        index
            .upsert(
                &[record("1_2024-01-05", vec![0.0, 1.0], &["Pen (Red)", "Ink (Blue)"])],
                "ns",
            )
            .await
            .unwrap();

        assert_eq!(index.count("ns").await.unwrap(), 1);
        let hit = index.get("1_2024-01-05", "ns").await.unwrap().unwrap();
        assert_eq!(hit.metadata["products"][1], "Ink (Blue)");
        assert!(hit.text.contains("Ink (Blue)"));
    }

    #[tokio::test]
    async fn test_open_creates_parent_dirs_in_wal_mode() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("nested").join("index.sqlite");
        let index = LocalIndex::open(&path).await.unwrap();
        assert!(path.exists());

        let mode: String = sqlx::query_scalar("PRAGMA journal_mode")
            .fetch_one(&index.pool)
            .await
            .unwrap();
        assert_eq!(mode, "wal");
    }

    #[tokio::test]
    async fn test_namespaces_are_separate() {
        let tmp = TempDir::new().unwrap();
        let index = LocalIndex::open(&tmp.path().join("index.sqlite"))
            .await
            .unwrap();

        index
            .upsert(&[record("1_2024-01-05", vec![1.0], &["Pen (Red)"])], "a")
            .await
            .unwrap();
        assert_eq!(index.count("a").await.unwrap(), 1);
        assert_eq!(index.count("b").await.unwrap(), 0);
        assert!(index.get("1_2024-01-05", "b").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_search_ranks_by_similarity() {
        let tmp = TempDir::new().unwrap();
        let index = LocalIndex::open(&tmp.path().join("index.sqlite"))
            .await
            .unwrap();

        index
            .upsert(
                &[
                    record("1_2024-01-05", vec![1.0, 0.0], &["Pen (Red)"]),
                    record("2_2024-01-05", vec![0.6, 0.8], &["Ring (Gold)"]),
                    record("3_2024-01-05", vec![0.0, 1.0], &["Lamp (White)"]),
                ],
                "ns",
            )
            .await
            .unwrap();

        let hits = index.search(&[0.0, 1.0], "ns", 2).await.unwrap();
        let ids: Vec<&str> = hits.iter().map(|h| h.id.as_str()).collect();
        assert_eq!(ids, vec!["3_2024-01-05", "2_2024-01-05"]);
        assert!(hits[0].score > hits[1].score);
    }

    #[tokio::test]
    async fn test_empty_upsert_is_noop() {
        let tmp = TempDir::new().unwrap();
        let index = LocalIndex::open(&tmp.path().join("index.sqlite"))
            .await
            .unwrap();
        index.upsert(&[], "ns").await.unwrap();
        assert_eq!(index.count("ns").await.unwrap(), 0);
    }

    #[test]
    fn test_pinecone_body_shape() {
        let body = upsert_body(&[record("1_2024-01-05", vec![0.5], &["Pen (Red)"])], "ecommerce-22");
        assert_eq!(body["namespace"], "ecommerce-22");
        assert_eq!(body["vectors"][0]["id"], "1_2024-01-05");
        assert_eq!(body["vectors"][0]["metadata"]["user_name"], "Alice");
        assert!(body["vectors"][0]["metadata"]["text"].is_string());
    }

    #[test]
    fn test_check_upserted() {
        assert!(check_upserted(&serde_json::json!({"upsertedCount": 3}), 3).is_ok());
        assert!(check_upserted(&serde_json::json!({"upsertedCount": 2}), 3).is_err());
        assert!(check_upserted(&serde_json::json!({}), 3).is_err());
    }
}
