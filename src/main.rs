//! # Purchase Sync CLI (`psync`)
//!
//! The `psync` binary bootstraps the store, generates test data, runs the
//! sync loop and inspects its results.
//!
//! ## Usage
//!
//! ```bash
//! psync --config ./config/psync.toml <command>
//! ```
//!
//! ## Commands
//!
//! | Command | Description |
//! |---------|-------------|
//! | `psync init` | Create tables, change-log triggers and the local index |
//! | `psync seed` | Insert synthetic users, products and orders |
//! | `psync sync` | Run the sync loop until Ctrl+C |
//! | `psync sync --once` | Run a single cycle and report what it did |
//! | `psync status` | Show pending, processed and dead-lettered counts |
//! | `psync search "<query>"` | Semantic lookup over the local index |
//! | `psync dead-letter list` | Show quarantined change records |
//! | `psync dead-letter requeue` | Return quarantined records to the loop |

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::sync::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use purchase_sync::config::{self, Config};
use purchase_sync::marker::ProcessedMarker;
use purchase_sync::seed::SeedCounts;
use purchase_sync::{db, migrate, search, seed, stats, sync_loop};

/// Purchase Sync CLI: keeps a vector index of purchase events in step with
/// an order store.
///
/// All commands accept a `--config` flag pointing to a TOML configuration
/// file. See `config/psync.example.toml` for a full example.
#[derive(Parser)]
#[command(
    name = "psync",
    about = "Purchase Sync: change-data-capture from an order store into a vector index",
    version
)]
struct Cli {
    /// Path to configuration file (TOML).
    #[arg(long, global = true, default_value = "./config/psync.toml")]
    config: PathBuf,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Create the store schema, change-log triggers and local index.
    ///
    /// Idempotent: running it multiple times is safe.
    Init,

    /// Insert synthetic users, products and orders.
    Seed {
        #[arg(long, default_value_t = 100)]
        users: usize,

        #[arg(long, default_value_t = 500)]
        products: usize,

        #[arg(long, default_value_t = 1000)]
        orders: usize,

        /// Keep writing a new order every 3-5 seconds until Ctrl+C.
        #[arg(long)]
        follow: bool,
    },

    /// Run the sync loop.
    Sync {
        /// Run a single cycle and exit.
        #[arg(long)]
        once: bool,

        /// Also run the synthetic order writer in the background.
        #[arg(long, conflicts_with = "once")]
        follow_writer: bool,
    },

    /// Show change-log, retry and index counts.
    Status,

    /// Semantic search over the local index.
    Search {
        query: String,

        #[arg(long, default_value_t = 5)]
        limit: usize,
    },

    /// Inspect or release quarantined change records.
    DeadLetter {
        #[command(subcommand)]
        action: DeadLetterAction,
    },
}

#[derive(Subcommand)]
enum DeadLetterAction {
    /// List dead-lettered records.
    List,
    /// Return records to the sync loop with a fresh attempt budget.
    Requeue {
        /// Record ids to requeue.
        ids: Vec<i64>,

        /// Requeue every dead-lettered record.
        #[arg(long, conflicts_with = "ids")]
        all: bool,
    },
}

fn init_logging(cfg: &Config) -> Result<()> {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(&cfg.log.level));

    match &cfg.log.file {
        Some(path) => {
            if let Some(parent) = path.parent() {
                if !parent.as_os_str().is_empty() {
                    std::fs::create_dir_all(parent)?;
                }
            }
            let file = std::fs::OpenOptions::new()
                .create(true)
                .append(true)
                .open(path)
                .with_context(|| format!("Failed to open log file: {}", path.display()))?;
            let subscriber = tracing_subscriber::fmt()
                .with_env_filter(filter)
                .with_ansi(false)
                .with_writer(Mutex::new(file))
                .finish();
            tracing::subscriber::set_global_default(subscriber)
                .context("Failed to set tracing subscriber")?;
        }
        None => {
            let subscriber = tracing_subscriber::fmt()
                .with_env_filter(filter)
                .with_writer(std::io::stderr)
                .finish();
            tracing::subscriber::set_global_default(subscriber)
                .context("Failed to set tracing subscriber")?;
        }
    }
    Ok(())
}

/// Token cancelled on the first Ctrl+C.
fn shutdown_token() -> CancellationToken {
    let token = CancellationToken::new();
    let trigger = token.clone();
    tokio::spawn(async move {
        match tokio::signal::ctrl_c().await {
            Ok(()) => info!("Received Ctrl+C, shutting down..."),
            Err(e) => warn!(error = %e, "Failed to listen for Ctrl+C"),
        }
        trigger.cancel();
    });
    token
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let cfg = config::load_config(&cli.config)?;
    init_logging(&cfg)?;

    match cli.command {
        Commands::Init => {
            migrate::run_migrations(&cfg).await?;
            println!("Database initialized successfully.");
        }
        Commands::Seed {
            users,
            products,
            orders,
            follow,
        } => {
            let counts = SeedCounts {
                users,
                products,
                orders,
            };
            seed::run_seed(&cfg, counts, follow, shutdown_token()).await?;
        }
        Commands::Sync {
            once,
            follow_writer,
        } => {
            sync_loop::run_sync(&cfg, once, follow_writer, shutdown_token()).await?;
        }
        Commands::Status => {
            stats::run_status(&cfg).await?;
        }
        Commands::Search { query, limit } => {
            search::run_search(&cfg, &query, limit).await?;
        }
        Commands::DeadLetter { action } => {
            let pool = db::connect(&cfg).await?;
            let marker = ProcessedMarker::new(pool.clone());
            match action {
                DeadLetterAction::List => {
                    let letters = marker.list_dead_letters().await?;
                    if letters.is_empty() {
                        println!("No dead-lettered records.");
                    }
                    for letter in letters {
                        println!(
                            "{:>8}  attempts={}  {}",
                            letter.record_id, letter.attempts, letter.last_error
                        );
                    }
                }
                DeadLetterAction::Requeue { ids, all } => {
                    let released = if all {
                        marker.requeue(None).await?
                    } else {
                        marker.requeue(Some(&ids)).await?
                    };
                    println!("Requeued {} record(s).", released);
                }
            }
            pool.close().await;
        }
    }

    Ok(())
}
