//! # Site Index
//!
//! An embedded content index with hybrid search for a single process.
//!
//! Producers such as feed readers call
//! [`ContentIndex::index`](engine::ContentIndex::index) from any task. A
//! worker pool stores changed entries and notifies subscribers; a single
//! rate-limited worker computes embeddings in the background; queries mix
//! keyword and vector relevance into one ranking.
//!
//! ## Architecture
//!
//! ```text
//! ┌───────────┐   ┌──────────────┐   ┌──────────────┐
//! │ Producers │──▶│  Ingestion   │──▶│  EntryStore  │
//! │ index()   │   │ queue+pool   │   │ snapshot/SQL │
//! └───────────┘   └──────┬───────┘   └──────▲───────┘
//!                        │ ids               │ vectors
//!                        ▼                   │
//!                 ┌──────────────┐   ┌───────┴──────┐
//!                 │   EventBus   │   │  Embedding   │
//!                 │ index.*      │   │ single worker│
//!                 └──────────────┘   └──────────────┘
//! ```
//!
//! ## Quick Start
//!
//! ```bash
//! sidx init                        # create storage
//! sidx ingest items.jsonl          # index JSON lines
//! sidx search "fed rates" --limit 5
//! sidx migrate --from ./data/old   # snapshot → SQLite, once
//! ```
//!
//! ## Modules
//!
//! | Module | Purpose |
//! |--------|---------|
//! | [`config`] | TOML configuration parsing |
//! | [`models`] | Entries, events, search hits |
//! | [`events`] | In-process publish/subscribe |
//! | [`store`] | Storage trait, snapshot and SQLite backends |
//! | [`ingest`] | Ingestion queue and workers |
//! | [`embed_worker`] | Rate-limited embedding worker |
//! | [`embedding`] | Embedding providers, vector helpers, query cache |
//! | [`search`] | Hybrid ranking |
//! | [`engine`] | The [`ContentIndex`](engine::ContentIndex) service |
//! | [`import`] | Snapshot → SQLite migration |
//! | [`db`] | Database connection |
//! | [`migrate`] | Schema migrations |

pub mod config;
pub mod db;
pub mod embed_worker;
pub mod embedding;
pub mod engine;
pub mod error;
pub mod events;
pub mod import;
mod inflight;
pub mod ingest;
pub mod logging;
pub mod migrate;
pub mod models;
pub mod search;
pub mod store;

pub use engine::ContentIndex;
pub use error::IndexError;
