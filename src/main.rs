//! # Site Index CLI (`sidx`)
//!
//! Operator interface to the content index: create storage, bulk-load
//! JSON lines, query, inspect, backfill embeddings and migrate legacy
//! snapshots into SQLite.
//!
//! ## Usage
//!
//! ```bash
//! sidx --config ./config/sidx.toml <command>
//! ```
//!
//! ## Commands
//!
//! | Command | Description |
//! |---------|-------------|
//! | `sidx init` | Create the snapshot directory or SQLite schema |
//! | `sidx ingest <file.jsonl>` | Index one JSON object per line |
//! | `sidx search "<query>"` | Hybrid search |
//! | `sidx get <id>` | Print one entry |
//! | `sidx recent <type>` | Newest entries of a type |
//! | `sidx embed pending` | Embed every entry that lacks a vector |
//! | `sidx migrate --from <dir>` | Copy a snapshot directory into SQLite |
//! | `sidx stats` | Counts and pipeline state |
//! | `sidx clear --yes` | Delete everything |

use std::io::BufRead;
use std::path::{Path, PathBuf};

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use serde::Deserialize;

use site_index::config::{self, Config};
use site_index::engine::{open_snapshot, ContentIndex};
use site_index::import::migrate_snapshot;
use site_index::logging;
use site_index::models::Metadata;
use site_index::store::snapshot::SnapshotStore;
use site_index::store::sqlite::SqliteStore;

/// Site Index CLI: embedded content indexing with hybrid search.
///
/// All commands accept a `--config` flag pointing to a TOML file. A
/// missing file means built-in defaults.
#[derive(Parser)]
#[command(name = "sidx", about = "Embedded content index with hybrid search", version)]
struct Cli {
    /// Path to configuration file (TOML).
    #[arg(long, global = true, default_value = "./config/sidx.toml")]
    config: PathBuf,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Create storage for the configured backend. Idempotent.
    Init,

    /// Index a JSON-lines file of `{id, type, title, content, metadata?}`.
    ///
    /// Waits for ingestion and embedding to finish before exiting.
    Ingest {
        file: PathBuf,
    },

    /// Search indexed entries.
    Search {
        query: String,

        /// Only return entries of this type.
        #[arg(long = "type")]
        kind: Option<String>,

        /// Maximum number of results (default: `[retrieval] default_limit`).
        #[arg(long)]
        limit: Option<usize>,
    },

    /// Print one entry by id.
    Get {
        id: String,
    },

    /// List the newest entries of one type.
    Recent {
        kind: String,

        #[arg(long, default_value_t = 10)]
        limit: usize,
    },

    /// Embedding maintenance.
    Embed {
        #[command(subcommand)]
        action: EmbedAction,
    },

    /// Copy a snapshot directory into the configured SQLite database.
    ///
    /// Safe to re-run: a populated target is left alone.
    Migrate {
        /// Snapshot directory holding `entries.json` / `embeddings.json`.
        #[arg(long)]
        from: PathBuf,
    },

    /// Show counts and pipeline state.
    Stats,

    /// Delete every entry and embedding.
    Clear {
        /// Required confirmation.
        #[arg(long)]
        yes: bool,
    },
}

#[derive(Subcommand)]
enum EmbedAction {
    /// Queue and embed entries without a vector, then wait.
    Pending,
}

/// One line of an `ingest` file.
#[derive(Deserialize)]
struct IngestLine {
    id: String,
    #[serde(rename = "type")]
    kind: String,
    title: String,
    content: String,
    #[serde(default)]
    metadata: Metadata,
}

fn load(path: &Path) -> Result<Config> {
    if path.exists() {
        config::load_config(path)
    } else {
        Ok(Config::default())
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let cfg = load(&cli.config)?;
    logging::init(&cfg.logging);

    match cli.command {
        Commands::Init => run_init(&cfg).await?,
        Commands::Ingest { file } => run_ingest(&cfg, &file).await?,
        Commands::Search { query, kind, limit } => {
            let index = ContentIndex::open(&cfg).await?;
            let limit = limit.unwrap_or(index.default_limit());
            let hits = index.search(&query, limit, kind.as_deref()).await?;
            if hits.is_empty() {
                println!("No results.");
            }
            for (rank, hit) in hits.iter().enumerate() {
                println!(
                    "{}. [{:.3}] {} ({}) {}",
                    rank + 1,
                    hit.score,
                    hit.entry.id,
                    hit.entry.kind,
                    hit.entry.title
                );
                println!(
                    "    keyword: {:.3}  semantic: {:.3}",
                    hit.keyword_score, hit.semantic_score
                );
            }
            index.shutdown().await?;
        }
        Commands::Get { id } => {
            let index = ContentIndex::open(&cfg).await?;
            match index.get_by_id(&id).await {
                Some(entry) => {
                    println!("{}", serde_json::to_string_pretty(&entry)?);
                    match index.get_embedding(&id).await {
                        Some(v) => println!("embedding: {} dims", v.len()),
                        None => println!("embedding: none"),
                    }
                }
                None => println!("No entry with id '{}'.", id),
            }
            index.shutdown().await?;
        }
        Commands::Recent { kind, limit } => {
            let index = ContentIndex::open(&cfg).await?;
            for entry in index.get_by_type(&kind, limit).await {
                println!(
                    "{}  {}  {}",
                    entry.indexed_at.format("%Y-%m-%d %H:%M:%S"),
                    entry.id,
                    entry.title
                );
            }
            index.shutdown().await?;
        }
        Commands::Embed {
            action: EmbedAction::Pending,
        } => {
            if !cfg.embedding.is_enabled() {
                bail!("Embedding provider is disabled. Set [embedding] provider in config.");
            }
            let index = ContentIndex::open(&cfg).await?;
            let queued = index.backfill().await?;
            index.settle().await;
            let stats = index.stats().await?;
            println!("embed pending");
            println!("  queued: {}", queued);
            println!("  embedded: {} / {}", stats.embedded, stats.entries);
            println!("  provider failures: {}", stats.provider_failures);
            index.shutdown().await?;
        }
        Commands::Migrate { from } => run_migrate(&cfg, &from).await?,
        Commands::Stats => {
            let index = ContentIndex::open(&cfg).await?;
            let stats = index.stats().await?;
            println!("backend:     {}", stats.backend);
            println!("model:       {}", stats.model);
            println!("entries:     {}", stats.entries);
            println!("embedded:    {} (cap {})", stats.embedded, stats.embedding_cap);
            println!("pending:     ingest {}, embeddings {}", stats.pending_ingest, stats.pending_embeddings);
            index.shutdown().await?;
        }
        Commands::Clear { yes } => {
            if !yes {
                bail!("Refusing to clear without --yes.");
            }
            let index = ContentIndex::open(&cfg).await?;
            index.clear().await?;
            index.shutdown().await?;
            println!("Index cleared.");
        }
    }

    Ok(())
}

async fn run_init(cfg: &Config) -> Result<()> {
    match cfg.store.backend.as_str() {
        "sqlite" => {
            let store = SqliteStore::open(
                &cfg.store.db_path,
                cfg.retrieval.title_pass_limit,
                cfg.retrieval.content_pass_limit,
            )
            .await?;
            store.close().await;
            println!("Database initialized at {}.", cfg.store.db_path.display());
        }
        _ => {
            open_snapshot(&cfg.store.snapshot_dir, cfg)?;
            println!("Snapshot directory ready at {}.", cfg.store.snapshot_dir.display());
        }
    }
    Ok(())
}

async fn run_ingest(cfg: &Config, file: &Path) -> Result<()> {
    let reader = std::io::BufReader::new(
        std::fs::File::open(file).with_context(|| format!("Failed to open {}", file.display()))?,
    );
    let index = ContentIndex::open(cfg).await?;

    let mut submitted = 0u64;
    let mut malformed = 0u64;
    for (n, line) in reader.lines().enumerate() {
        let line = line?;
        if line.trim().is_empty() {
            continue;
        }
        match serde_json::from_str::<IngestLine>(&line) {
            Ok(item) => {
                index
                    .index(item.id, item.kind, item.title, item.content, item.metadata)
                    .await;
                submitted += 1;
            }
            Err(e) => {
                tracing::warn!(line = n + 1, error = %e, "skipping malformed line");
                malformed += 1;
            }
        }
    }

    index.settle().await;
    let stats = index.stats().await?;
    index.shutdown().await?;

    println!("ingest {}", file.display());
    println!("  submitted: {}", submitted);
    println!("  malformed: {}", malformed);
    println!("  entries: {}", stats.entries);
    println!("  embedded: {}", stats.embedded);
    Ok(())
}

async fn run_migrate(cfg: &Config, from: &Path) -> Result<()> {
    if cfg.store.backend != "sqlite" {
        tracing::warn!("store.backend is not sqlite; migrating into {} anyway", cfg.store.db_path.display());
    }
    let source = SnapshotStore::load(from, cfg.store.flush_debounce())?;
    let target = SqliteStore::open(
        &cfg.store.db_path,
        cfg.retrieval.title_pass_limit,
        cfg.retrieval.content_pass_limit,
    )
    .await?;

    let report = migrate_snapshot(&source, &target).await?;
    target.close().await;

    println!("migrate {} -> {}", from.display(), cfg.store.db_path.display());
    if report.is_noop() {
        println!("  target already populated; nothing to do");
    } else {
        println!("  entries: {}", report.entries_migrated);
        println!("  embeddings: {}", report.embeddings_migrated);
        println!("  skipped: {}", report.skipped);
    }
    Ok(())
}
