//! Synthetic store data.
//!
//! Fills the store with random users, colour-variant products and
//! multi-line orders, and can keep writing new orders in the background so
//! the sync loop has something to chase.

use anyhow::{bail, Result};
use chrono::{Duration as ChronoDuration, NaiveDateTime, Utc};
use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::{Rng, SeedableRng};
use sqlx::SqlitePool;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::config::Config;
use crate::db;

const FIRST_NAMES: &[&str] = &[
    "Alice", "Bob", "Carol", "David", "Emma", "Frank", "Grace", "Henry", "Isla", "Jack", "Karen",
    "Liam", "Maria", "Noah", "Olivia", "Peter", "Quinn", "Rachel", "Samuel", "Tara", "Umar",
    "Vera", "William", "Yusuf", "Zoe",
];

const LAST_NAMES: &[&str] = &[
    "Anderson", "Brown", "Clark", "Davis", "Evans", "Garcia", "Hughes", "Johnson", "King",
    "Lopez", "Miller", "Nguyen", "Owens", "Parker", "Reed", "Smith", "Taylor", "Walker", "Young",
];

const CATALOG: &[(&str, &[&str])] = &[
    (
        "Clothing",
        &[
            "T-shirt",
            "V-neck T-shirt",
            "Winter Coat",
            "Waterproof Coat",
            "Wool Coat",
            "Wool Sweater",
            "Buttoned Sweater",
            "Women Blazer",
            "Men Blazer",
            "Straight Jeans",
            "Mom Jeans",
            "Short Sleeve Shirt",
            "Long Sleeve Shirt",
        ],
    ),
    ("Jewelry", &["Necklace", "Bracelet", "Ring", "Earrings"]),
    (
        "Flower Type",
        &["Succulent", "Cactus", "Ficus", "Begonia", "Daisy", "Rose", "Tulip", "Orchid"],
    ),
    (
        "Electronics",
        &["Smartphone", "Powerbank", "Laptop", "Bluetooth Headset", "Smartwatch", "Keyboard", "Mouse"],
    ),
    ("Stationery", &["Notebook", "Pen", "Backpack", "Colorful Post-it"]),
    (
        "Home Goods",
        &["Lamp", "Table Clock", "Curtain", "Carpet", "Pot", "Knife Set", "Pitcher", "Food Processor"],
    ),
    ("Personal Care", &["Shampoo", "Body Lotion", "Perfume", "Toothbrush"]),
];

const COLORS: &[&str] = &[
    "Red", "Blue", "Green", "Yellow", "Black", "White", "Pink", "Purple", "Orange", "Brown",
];

const ORDER_DATE_FORMAT: &str = "%Y-%m-%d %H:%M:%S%.6f";

/// How much data to generate.
#[derive(Debug, Clone, Copy)]
pub struct SeedCounts {
    pub users: usize,
    pub products: usize,
    pub orders: usize,
}

impl Default for SeedCounts {
    fn default() -> Self {
        Self {
            users: 100,
            products: 500,
            orders: 1000,
        }
    }
}

/// Rows actually written.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct SeedSummary {
    pub users: usize,
    pub products: usize,
    pub orders: usize,
    pub order_lines: usize,
}

fn random_name(rng: &mut impl Rng) -> String {
    let first = FIRST_NAMES.choose(rng).copied().unwrap_or("Alex");
    let last = LAST_NAMES.choose(rng).copied().unwrap_or("Doe");
    format!("{} {}", first, last)
}

/// `("Shampoo (Yellow)", "Personal Care")`.
fn random_product(rng: &mut impl Rng) -> (String, &'static str) {
    let (category, items) = CATALOG[rng.gen_range(0..CATALOG.len())];
    let item = items.choose(rng).copied().unwrap_or("Gift Card");
    let color = COLORS.choose(rng).copied().unwrap_or("White");
    (format!("{} ({})", item, color), category)
}

/// Insert one order of 1–5 lines for `user_id`, all sharing `order_date`.
async fn insert_order_lines(
    pool: &SqlitePool,
    user_id: i64,
    product_ids: &[i64],
    order_date: &NaiveDateTime,
) -> Result<()> {
    let date = order_date.format(ORDER_DATE_FORMAT).to_string();
    let mut tx = pool.begin().await?;
    for product_id in product_ids {
        sqlx::query("INSERT INTO orders (user_id, product_id, order_date) VALUES (?, ?, ?)")
            .bind(user_id)
            .bind(product_id)
            .bind(&date)
            .execute(&mut *tx)
            .await?;
    }
    tx.commit().await?;
    Ok(())
}

fn pick_lines(rng: &mut impl Rng, products: &[i64]) -> Vec<i64> {
    let count = rng.gen_range(1..=5);
    (0..count)
        .filter_map(|_| products.choose(rng).copied())
        .collect()
}

/// Generate `counts` worth of data. Orders are dated within the last day.
pub async fn seed(pool: &SqlitePool, counts: SeedCounts, rng: &mut StdRng) -> Result<SeedSummary> {
    let mut summary = SeedSummary::default();

    let mut tx = pool.begin().await?;
    let mut users = Vec::with_capacity(counts.users);
    for _ in 0..counts.users {
        let id = sqlx::query("INSERT INTO users (user_name) VALUES (?)")
            .bind(random_name(rng))
            .execute(&mut *tx)
            .await?
            .last_insert_rowid();
        users.push(id);
    }

    let mut products = Vec::with_capacity(counts.products);
    for _ in 0..counts.products {
        let (name, category) = random_product(rng);
        let id = sqlx::query("INSERT INTO products (product_name, category) VALUES (?, ?)")
            .bind(name)
            .bind(category)
            .execute(&mut *tx)
            .await?
            .last_insert_rowid();
        products.push(id);
    }
    tx.commit().await?;

    summary.users = users.len();
    summary.products = products.len();

    if counts.orders > 0 && (users.is_empty() || products.is_empty()) {
        bail!("Cannot generate orders without users and products");
    }

    let now = Utc::now().naive_utc();
    for _ in 0..counts.orders {
        let Some(&user_id) = users.choose(rng) else {
            break;
        };
        let order_date = now - ChronoDuration::microseconds(rng.gen_range(0..86_400_000_000));
        let lines = pick_lines(rng, &products);
        insert_order_lines(pool, user_id, &lines, &order_date).await?;
        summary.orders += 1;
        summary.order_lines += lines.len();
    }

    Ok(summary)
}

/// Keep placing orders for existing users every 3–5 seconds until
/// cancelled.
pub async fn run_writer(pool: &SqlitePool, cancel: CancellationToken) -> Result<()> {
    let users: Vec<i64> = sqlx::query_scalar("SELECT user_id FROM users")
        .fetch_all(pool)
        .await?;
    let products: Vec<i64> = sqlx::query_scalar("SELECT product_id FROM products")
        .fetch_all(pool)
        .await?;
    if users.is_empty() || products.is_empty() {
        bail!("No users or products to order with. Run `psync seed` first.");
    }

    let mut rng = StdRng::from_entropy();
    info!(users = users.len(), products = products.len(), "order writer started");

    loop {
        let pause = Duration::from_secs(rng.gen_range(3..=5));
        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = tokio::time::sleep(pause) => {}
        }

        let Some(&user_id) = users.choose(&mut rng) else {
            break;
        };
        let lines = pick_lines(&mut rng, &products);
        insert_order_lines(pool, user_id, &lines, &Utc::now().naive_utc()).await?;
        debug!(user_id, lines = lines.len(), "order written");
    }

    info!("order writer stopped");
    Ok(())
}

/// `psync seed`.
pub async fn run_seed(
    config: &Config,
    counts: SeedCounts,
    follow: bool,
    cancel: CancellationToken,
) -> Result<()> {
    let pool = db::connect(config).await?;
    let mut rng = StdRng::from_entropy();

    let summary = seed(&pool, counts, &mut rng).await?;
    println!(
        "Seeded {} users, {} products, {} orders ({} order lines)",
        summary.users, summary.products, summary.orders, summary.order_lines
    );

    if follow {
        println!("Writing new orders every 3-5 seconds. Press Ctrl+C to stop.");
        run_writer(&pool, cancel).await?;
    }

    pool.close().await;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::OrderDate;
    use crate::test_support::store;

    #[test]
    fn test_product_names_have_colour_variant() {
        let mut rng = StdRng::seed_from_u64(7);
        for _ in 0..50 {
            let (name, category) = random_product(&mut rng);
            assert!(name.ends_with(')'));
            assert!(COLORS.iter().any(|c| name.ends_with(&format!("({})", c))));
            assert!(CATALOG.iter().any(|(cat, _)| *cat == category));
        }
    }

    #[tokio::test]
    async fn test_seed_writes_orders_through_the_change_log() {
        let (_tmp, pool) = store().await;
        let mut rng = StdRng::seed_from_u64(42);

        let summary = seed(
            &pool,
            SeedCounts {
                users: 5,
                products: 12,
                orders: 8,
            },
            &mut rng,
        )
        .await
        .unwrap();

        assert_eq!(summary.users, 5);
        assert_eq!(summary.products, 12);
        assert_eq!(summary.orders, 8);
        assert!(summary.order_lines >= 8 && summary.order_lines <= 40);

        let changes: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM change_log")
            .fetch_one(&pool)
            .await
            .unwrap();
        assert_eq!(changes as usize, summary.order_lines);

        let dates: Vec<String> = sqlx::query_scalar("SELECT order_date FROM orders")
            .fetch_all(&pool)
            .await
            .unwrap();
        assert!(dates.iter().all(|d| OrderDate::parse(d).is_some()));
    }

    #[tokio::test]
    async fn test_orders_need_users_and_products() {
        let (_tmp, pool) = store().await;
        let mut rng = StdRng::seed_from_u64(1);
        let err = seed(
            &pool,
            SeedCounts {
                users: 0,
                products: 3,
                orders: 1,
            },
            &mut rng,
        )
        .await
        .unwrap_err();
        assert!(err.to_string().contains("without users"));
    }

    #[tokio::test]
    async fn test_writer_refuses_empty_store() {
        let (_tmp, pool) = store().await;
        assert!(run_writer(&pool, CancellationToken::new()).await.is_err());
    }

    #[tokio::test]
    async fn test_writer_stops_on_cancel() {
        let (_tmp, pool) = store().await;
        let mut rng = StdRng::seed_from_u64(3);
        seed(
            &pool,
            SeedCounts {
                users: 1,
                products: 1,
                orders: 0,
            },
            &mut rng,
        )
        .await
        .unwrap();

        let cancel = CancellationToken::new();
        cancel.cancel();
        tokio::time::timeout(Duration::from_secs(1), run_writer(&pool, cancel))
            .await
            .unwrap()
            .unwrap();
    }
}
