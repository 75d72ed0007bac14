//! Ingestion pipeline: turns raw `index()` calls into stored entries.
//!
//! # Flow
//!
//! ```text
//! index() ──try_send──▶ bounded queue ──▶ N workers ──▶ Ingestor::apply
//!    │                                                     │
//!    └──── queue full / stopped: apply inline ─────────────┘
//! ```
//!
//! [`Ingestor::apply`] is the change-detection step:
//!
//! | Stored entry | Action |
//! |--------------|--------|
//! | same title and content, same metadata | nothing |
//! | same title and content, new metadata | `update_metadata` only |
//! | absent, or title/content differ | `put`, fire `index.complete`, queue for embedding |
//!
//! Nothing here returns an error to producers. Store failures are logged
//! and the item is dropped; the store's own retry (the snapshot flusher
//! re-flushing dirty state) covers persistence.

use std::sync::Arc;

use chrono::{Duration as ChronoDuration, Utc};
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::IngestConfig;
use crate::embed_worker::EmbedQueue;
use crate::events::EventBus;
use crate::inflight::InFlight;
use crate::models::{Entry, Event, IndexRequest, INDEX_COMPLETE};
use crate::store::EntryStore;

/// What [`Ingestor::apply`] did with a request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IngestOutcome {
    Unchanged,
    MetadataUpdated,
    Written,
    Failed,
}

/// Applies a single request against the store.
pub struct Ingestor {
    store: Arc<dyn EntryStore>,
    bus: EventBus,
    embed_queue: EmbedQueue,
}

impl Ingestor {
    pub fn new(store: Arc<dyn EntryStore>, bus: EventBus, embed_queue: EmbedQueue) -> Self {
        Self {
            store,
            bus,
            embed_queue,
        }
    }

    pub async fn apply(&self, req: IndexRequest) -> IngestOutcome {
        let existing = match self.store.get(&req.id).await {
            Ok(existing) => existing,
            Err(e) => {
                warn!(id = %req.id, error = %e, "ingest lookup failed");
                return IngestOutcome::Failed;
            }
        };

        if let Some(existing) = &existing {
            if existing.same_content(&req.title, &req.content) {
                if existing.metadata == req.metadata {
                    return IngestOutcome::Unchanged;
                }
                return match self.store.update_metadata(&req.id, &req.metadata).await {
                    Ok(_) => {
                        debug!(id = %req.id, "metadata updated");
                        IngestOutcome::MetadataUpdated
                    }
                    Err(e) => {
                        warn!(id = %req.id, error = %e, "metadata update failed");
                        IngestOutcome::Failed
                    }
                };
            }
        }

        // Strictly after the previous write, even within one millisecond.
        let now = Utc::now();
        let indexed_at = match &existing {
            Some(prev) if prev.indexed_at >= now => prev.indexed_at + ChronoDuration::milliseconds(1),
            _ => now,
        };

        let entry = Entry {
            id: req.id,
            kind: req.kind,
            title: req.title,
            content: req.content,
            metadata: req.metadata,
            indexed_at,
        };
        if let Err(e) = self.store.put(&entry).await {
            warn!(id = %entry.id, error = %e, "entry write failed");
            return IngestOutcome::Failed;
        }
        debug!(id = %entry.id, kind = %entry.kind, "entry written");

        self.bus.publish(
            Event::new(INDEX_COMPLETE)
                .with("id", entry.id.as_str())
                .with("type", entry.kind.as_str()),
        );

        match self.store.has_embedding(&entry.id).await {
            Ok(false) => {
                self.embed_queue.try_enqueue(&entry.id);
            }
            Ok(true) => {}
            Err(e) => warn!(id = %entry.id, error = %e, "embedding lookup failed"),
        }
        IngestOutcome::Written
    }
}

/// Bounded queue plus a fixed pool of workers sharing one receiver.
pub struct IngestionPipeline {
    tx: mpsc::Sender<IndexRequest>,
    ingestor: Arc<Ingestor>,
    inflight: InFlight,
    cancel: CancellationToken,
}

impl IngestionPipeline {
    /// Spawn `config.workers` workers. They stop when `cancel` fires, after
    /// applying whatever is still queued.
    pub fn spawn(
        ingestor: Ingestor,
        config: &IngestConfig,
        cancel: CancellationToken,
    ) -> (Self, Vec<JoinHandle<()>>) {
        let (tx, rx) = mpsc::channel(config.queue_capacity.max(1));
        let rx = Arc::new(Mutex::new(rx));
        let ingestor = Arc::new(ingestor);
        let inflight = InFlight::new();

        let handles = (0..config.workers.max(1))
            .map(|worker| {
                tokio::spawn(run_worker(
                    worker,
                    rx.clone(),
                    ingestor.clone(),
                    inflight.clone(),
                    cancel.clone(),
                ))
            })
            .collect();

        (
            Self {
                tx,
                ingestor,
                inflight,
                cancel,
            },
            handles,
        )
    }

    /// Queue a request. Never blocks on a full queue and never drops: when
    /// the queue is full (or the workers have stopped) the request is
    /// applied on the caller's task instead.
    pub async fn submit(&self, req: IndexRequest) {
        if self.cancel.is_cancelled() {
            self.ingestor.apply(req).await;
            return;
        }

        self.inflight.begin();
        match self.tx.try_send(req) {
            Ok(()) => {}
            Err(mpsc::error::TrySendError::Full(req)) | Err(mpsc::error::TrySendError::Closed(req)) => {
                self.inflight.finish();
                debug!(id = %req.id, "ingest queue full; applying inline");
                self.ingestor.apply(req).await;
            }
        }
    }

    /// Requests queued or being applied.
    pub fn pending(&self) -> usize {
        self.inflight.count()
    }

    pub(crate) async fn idle(&self) {
        self.inflight.idle().await
    }
}

async fn run_worker(
    worker: usize,
    rx: Arc<Mutex<mpsc::Receiver<IndexRequest>>>,
    ingestor: Arc<Ingestor>,
    inflight: InFlight,
    cancel: CancellationToken,
) {
    loop {
        let next = {
            let mut rx = rx.lock().await;
            tokio::select! {
                biased;
                _ = cancel.cancelled() => None,
                item = rx.recv() => item,
            }
        };
        let Some(req) = next else { break };
        ingestor.apply(req).await;
        inflight.finish();
    }

    // Drain what producers queued before shutdown.
    let mut drained = 0usize;
    loop {
        let item = rx.lock().await.try_recv();
        let Ok(req) = item else { break };
        ingestor.apply(req).await;
        inflight.finish();
        drained += 1;
    }
    info!(worker, drained, "ingest worker stopped");
}
