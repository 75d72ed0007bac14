//! The index as a service object.
//!
//! [`ContentIndex`] owns the store, the event bus, both pipelines and the
//! search engine. All background work runs as tasks sharing one
//! [`CancellationToken`]:
//!
//! | Task | Count | Stops by |
//! |------|-------|----------|
//! | ingest worker | `ingest.workers` | draining the queue |
//! | embedding worker | 1 | discarding the queue (backfill re-finds it) |
//! | snapshot flusher | 0 or 1 | a final flush |
//!
//! Several instances can coexist in one process (tests do this).

use std::path::Path;
use std::sync::Arc;

use anyhow::{Context, Result};
use parking_lot::Mutex;
use serde::Serialize;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::config::Config;
use crate::embed_worker::{self, EmbedQueue, EmbeddingCounters};
use crate::embedding::{create_provider, EmbeddingProvider, QueryEmbeddingCache};
use crate::error::IndexError;
use crate::events::{EventBus, Subscription};
use crate::ingest::{IngestionPipeline, Ingestor};
use crate::models::{Entry, Event, IndexRequest, Metadata, SearchHit};
use crate::search::{HybridSearch, SearchParams};
use crate::store::snapshot::SnapshotStore;
use crate::store::sqlite::SqliteStore;
use crate::store::EntryStore;

/// Point-in-time counters from [`ContentIndex::stats`].
#[derive(Debug, Clone, Serialize)]
pub struct IndexStats {
    pub backend: String,
    pub model: String,
    pub entries: usize,
    pub embedded: usize,
    pub embedding_cap: usize,
    pub pending_ingest: usize,
    pub pending_embeddings: usize,
    pub provider_requests: u64,
    pub provider_failures: u64,
    pub vectors_discarded: u64,
    pub cached_queries: usize,
}

pub struct ContentIndex {
    store: Arc<dyn EntryStore>,
    provider: Arc<dyn EmbeddingProvider>,
    bus: EventBus,
    ingest: IngestionPipeline,
    embed_queue: EmbedQueue,
    counters: Arc<EmbeddingCounters>,
    search: HybridSearch,
    cancel: CancellationToken,
    tasks: Mutex<Vec<JoinHandle<()>>>,
    max_embedded: usize,
    backfill_limit: usize,
    default_limit: usize,
}

/// Open the store selected by `[store]`.
pub async fn open_store(config: &Config) -> Result<Arc<dyn EntryStore>> {
    let store: Arc<dyn EntryStore> = match config.store.backend.as_str() {
        "sqlite" => Arc::new(
            SqliteStore::open(
                &config.store.db_path,
                config.retrieval.title_pass_limit,
                config.retrieval.content_pass_limit,
            )
            .await
            .with_context(|| format!("opening {}", config.store.db_path.display()))?,
        ),
        _ => Arc::new(open_snapshot(&config.store.snapshot_dir, config)?),
    };
    Ok(store)
}

pub fn open_snapshot(dir: &Path, config: &Config) -> Result<SnapshotStore> {
    SnapshotStore::open(dir, config.store.flush_debounce())
}

impl ContentIndex {
    /// Build the store and provider from `config` and start.
    pub async fn open(config: &Config) -> Result<Self> {
        let store = open_store(config).await?;
        let provider: Arc<dyn EmbeddingProvider> = Arc::from(create_provider(&config.embedding)?);
        Ok(Self::start(store, provider, config).await)
    }

    /// Wire an open store and an injected provider, spawn the background
    /// tasks, and queue every un-embedded entry.
    pub async fn start(
        store: Arc<dyn EntryStore>,
        provider: Arc<dyn EmbeddingProvider>,
        config: &Config,
    ) -> Self {
        let cancel = CancellationToken::new();
        let bus = EventBus::new();
        let mut tasks = Vec::new();

        if let Some(handle) = store.clone().spawn_background(cancel.child_token()) {
            tasks.push(handle);
        }

        let (embed_queue, counters, embed_handle) = embed_worker::spawn(
            store.clone(),
            provider.clone(),
            bus.clone(),
            &config.embedding,
            cancel.child_token(),
        );
        tasks.push(embed_handle);

        let ingestor = Ingestor::new(store.clone(), bus.clone(), embed_queue.clone());
        let (ingest, ingest_handles) =
            IngestionPipeline::spawn(ingestor, &config.ingest, cancel.child_token());
        tasks.extend(ingest_handles);

        let search = HybridSearch::new(
            store.clone(),
            provider.clone(),
            QueryEmbeddingCache::new(config.embedding.query_cache_size),
            SearchParams::from(&config.retrieval),
        );

        let index = Self {
            store,
            provider,
            bus,
            ingest,
            embed_queue,
            counters,
            search,
            cancel,
            tasks: Mutex::new(tasks),
            max_embedded: config.embedding.max_embedded,
            backfill_limit: config.embedding.queue_capacity,
            default_limit: config.retrieval.default_limit,
        };

        match index.backfill().await {
            Ok(0) => {}
            Ok(n) => info!(queued = n, "queued entries without embeddings"),
            Err(e) => warn!(error = %e, "embedding backfill failed"),
        }
        info!(
            backend = index.store.backend_name(),
            model = index.provider.model_name(),
            "content index started"
        );
        index
    }

    // ============ Producer API ============

    /// Fire-and-forget ingestion. Never fails visibly.
    pub async fn index(
        &self,
        id: impl Into<String>,
        kind: impl Into<String>,
        title: impl Into<String>,
        content: impl Into<String>,
        metadata: Metadata,
    ) {
        self.ingest
            .submit(IndexRequest {
                id: id.into(),
                kind: kind.into(),
                title: title.into(),
                content: content.into(),
                metadata,
            })
            .await;
    }

    pub async fn get_by_id(&self, id: &str) -> Option<Entry> {
        self.store.get(id).await.unwrap_or_else(|e| {
            warn!(id, error = %e, "lookup failed");
            None
        })
    }

    /// Entries of one type, newest first, unscored.
    pub async fn get_by_type(&self, kind: &str, limit: usize) -> Vec<Entry> {
        self.store.get_by_type(kind, limit).await.unwrap_or_else(|e| {
            warn!(kind, error = %e, "type listing failed");
            Vec::new()
        })
    }

    pub async fn get_embedding(&self, id: &str) -> Option<Vec<f32>> {
        self.store.get_embedding(id).await.unwrap_or_else(|e| {
            warn!(id, error = %e, "embedding lookup failed");
            None
        })
    }

    pub async fn search(
        &self,
        query: &str,
        limit: usize,
        kind: Option<&str>,
    ) -> Result<Vec<SearchHit>, IndexError> {
        self.search.search(query, limit, kind).await
    }

    /// `[retrieval] default_limit`, for callers without their own limit.
    pub fn default_limit(&self) -> usize {
        self.default_limit
    }

    pub fn subscribe(&self, kind: &str) -> Subscription {
        self.bus.subscribe(kind)
    }

    pub fn publish(&self, event: Event) {
        self.bus.publish(event)
    }

    pub fn store(&self) -> &Arc<dyn EntryStore> {
        &self.store
    }

    // ============ Maintenance ============

    /// Wipe every entry and embedding, and the query-embedding cache.
    pub async fn clear(&self) -> Result<()> {
        self.store.clear().await?;
        self.search.cache().clear();
        self.store.flush().await?;
        info!("index cleared");
        Ok(())
    }

    /// Queue entries that have no embedding. Returns how many were queued.
    pub async fn backfill(&self) -> Result<usize> {
        if !self.provider.is_enabled() {
            return Ok(0);
        }
        let room = self
            .max_embedded
            .saturating_sub(self.store.embedding_count().await?);
        let limit = room.min(self.backfill_limit);
        if limit == 0 {
            return Ok(0);
        }
        let ids = self.store.missing_embeddings(limit).await?;
        Ok(ids
            .iter()
            .filter(|id| self.embed_queue.try_enqueue(id))
            .count())
    }

    /// Wait until both queues are empty and nothing is in flight.
    pub async fn settle(&self) {
        loop {
            self.ingest.idle().await;
            self.embed_queue.idle().await;
            if self.ingest.pending() == 0 && self.embed_queue.pending() == 0 {
                return;
            }
        }
    }

    pub async fn stats(&self) -> Result<IndexStats> {
        Ok(IndexStats {
            backend: self.store.backend_name().to_string(),
            model: self.provider.model_name().to_string(),
            entries: self.store.entry_count().await?,
            embedded: self.store.embedding_count().await?,
            embedding_cap: self.max_embedded,
            pending_ingest: self.ingest.pending(),
            pending_embeddings: self.embed_queue.pending(),
            provider_requests: self.counters.requests(),
            provider_failures: self.counters.failures(),
            vectors_discarded: self.counters.discarded(),
            cached_queries: self.search.cache().len(),
        })
    }

    /// Stop every task, let ingestion drain, and flush the store.
    /// Later `index` calls are applied inline.
    pub async fn shutdown(&self) -> Result<()> {
        self.cancel.cancel();
        let tasks: Vec<JoinHandle<()>> = std::mem::take(&mut *self.tasks.lock());
        for task in tasks {
            if let Err(e) = task.await {
                warn!(error = %e, "background task panicked");
            }
        }
        self.store.flush().await.context("final flush")?;
        info!("content index stopped");
        Ok(())
    }
}

impl Drop for ContentIndex {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}
