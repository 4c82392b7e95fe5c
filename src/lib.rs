//! # Purchase Sync
//!
//! Change-data-capture sync that keeps a vector index of purchase events in
//! step with a relational order store.
//!
//! Triggers on `orders` append to a change log. The sync loop polls that
//! log, regroups the changed order lines into one document per user and
//! order date, embeds a natural-language summary of each, upserts it under
//! a deterministic id, and only then marks the change-log rows processed.
//! Replaying a cycle overwrites the same vectors, so a crash between
//! upsert and mark costs a little work and nothing else.
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────────┐   ┌──────────┐   ┌──────────┐   ┌────────────┐
//! │ change_log   │──▶│ grouper  │──▶│ embedder │──▶│ vector     │
//! │ (reader)     │   │ per-user │   │ hash/API │   │ index      │
//! └──────▲───────┘   │ per-date │   └──────────┘   │ local/     │
//!        │           └──────────┘                  │ pinecone   │
//!        │                                         └─────┬──────┘
//!        │             processed = 1 (marker)            │
//!        └───────────────────────────────────────────────┘
//! ```
//!
//! ## Quick Start
//!
//! ```bash
//! psync init                    # create store, triggers and index
//! psync seed                    # synthetic users, products, orders
//! psync sync --follow-writer    # run the loop next to a live order writer
//! psync search "who bought shampoo"
//! psync status
//! ```
//!
//! ## Modules
//!
//! | Module | Purpose |
//! |--------|---------|
//! | [`config`] | TOML configuration parsing |
//! | [`models`] | Core data types |
//! | [`error`] | Cycle error type |
//! | [`traits`] | Pipeline seams (feed, sink, ledger) |
//! | [`reader`] | Change-log reader |
//! | [`grouper`] | Rows → purchase documents |
//! | [`embedding`] | Embedding provider abstraction |
//! | [`sink`] | Local and Pinecone vector indexes |
//! | [`marker`] | Processed marker, retry ledger, dead letters |
//! | [`sync_loop`] | The polling engine |
//! | [`seed`] | Synthetic data and live order writer |
//! | [`search`] | Semantic lookup over the local index |
//! | [`stats`] | Status overview |
//! | [`http`] | JSON-over-HTTP with retry |
//! | [`db`] | Database connection |
//! | [`migrate`] | Schema migrations |

pub mod config;
pub mod db;
pub mod embedding;
pub mod error;
pub mod grouper;
pub mod http;
pub mod marker;
pub mod migrate;
pub mod models;
pub mod reader;
pub mod search;
pub mod seed;
pub mod sink;
pub mod stats;
pub mod sync_loop;
pub mod traits;
