//! Semantic lookup over the local index.
//!
//! Embeds the query with the configured provider and prints the closest
//! purchase documents. Handy for checking what the sync loop has indexed.

use anyhow::{bail, Result};

use crate::config::Config;
use crate::embedding::{self, create_embedder};
use crate::sink::{LocalIndex, SearchHit};

/// Query the local index and return the top `limit` hits.
pub async fn search_local(config: &Config, query: &str, limit: usize) -> Result<Vec<SearchHit>> {
    if config.index.provider != "local" {
        bail!(
            "search reads the local index; index.provider is '{}'",
            config.index.provider
        );
    }
    if query.trim().is_empty() || limit == 0 {
        return Ok(Vec::new());
    }

    let embedder = create_embedder(&config.embedding)?;
    let query_vec = embedding::embed_query(embedder.as_ref(), query).await?;

    let index = LocalIndex::open(config.index_path()).await?;
    let hits = index
        .search(&query_vec, &config.index.namespace, limit)
        .await;
    index.close().await;
    hits
}

pub async fn run_search(config: &Config, query: &str, limit: usize) -> Result<()> {
    let hits = search_local(config, query, limit).await?;

    if hits.is_empty() {
        println!("No results.");
        return Ok(());
    }

    for (i, hit) in hits.iter().enumerate() {
        println!("{}. [{:.3}] {}", i + 1, hit.score, hit.id);
        println!("    {}", hit.text);
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{DocumentMetadata, VectorRecord};
    use tempfile::TempDir;

    async fn indexed_config(tmp: &TempDir) -> Config {
        let config = Config::with_db_path(tmp.path().join("store.sqlite"));
        let embedder = create_embedder(&config.embedding).unwrap();
        let index = LocalIndex::open(config.index_path()).await.unwrap();

        let docs = [
            (1, "Alice", "Shampoo (Yellow)", "Personal Care"),
            (2, "Bob", "Laptop (Black)", "Electronics"),
        ];
        let mut records = Vec::new();
        for (user_id, name, product, category) in docs {
            let text = format!("User {} ordered {} ({}) on 2024-01-05", name, product, category);
            let values = embedding::embed_query(embedder.as_ref(), &text).await.unwrap();
            records.push(VectorRecord {
                id: format!("{}_2024-01-05", user_id),
                values,
                metadata: DocumentMetadata {
                    user_id,
                    user_name: name.to_string(),
                    order_date: "2024-01-05".to_string(),
                    products: vec![product.to_string()],
                    categories: vec![category.to_string()],
                },
                text,
            });
        }
        index
            .upsert(&records, &config.index.namespace)
            .await
            .unwrap();
        index.close().await;
        config
    }

    #[tokio::test]
    async fn test_search_finds_matching_purchase() {
        let tmp = TempDir::new().unwrap();
        let config = indexed_config(&tmp).await;

        let hits = search_local(&config, "Bob Laptop Black Electronics", 1).await.unwrap();
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].id, "2_2024-01-05");
        assert_eq!(hits[0].metadata["user_name"], "Bob");
    }

    #[tokio::test]
    async fn test_blank_query_returns_nothing() {
        let tmp = TempDir::new().unwrap();
        let config = indexed_config(&tmp).await;
        assert!(search_local(&config, "   ", 5).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_requires_local_index() {
        let tmp = TempDir::new().unwrap();
        let mut config = Config::with_db_path(tmp.path().join("store.sqlite"));
        config.index.provider = "pinecone".to_string();
        assert!(search_local(&config, "shampoo", 5).await.is_err());
    }
}
