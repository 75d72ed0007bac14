//! The embedding pipeline: a bounded id queue drained by one serial worker.
//!
//! The worker is deliberately single: providers are rate-sensitive, so calls
//! are spaced at least `embedding.min_interval_ms` apart no matter how deep
//! the queue is. For each id it:
//!
//! 1. skips if the global cap (`embedding.max_embedded`) is reached, the
//!    entry is gone, or it already has a vector;
//! 2. embeds `title` plus a bounded content prefix under a timeout;
//! 3. re-reads the entry and stores the vector only if the content is
//!    still the one that was embedded, then fires `embedding.complete`.
//!
//! Provider failures are logged and followed by a fixed backoff. They are
//! never fatal; the entry stays keyword-only until it is queued again.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::EmbeddingConfig;
use crate::embedding::{embedding_text, EmbeddingProvider};
use crate::events::EventBus;
use crate::inflight::InFlight;
use crate::models::{Event, EMBEDDING_COMPLETE};
use crate::store::EntryStore;

/// Producer handle for the embedding queue. Cheap to clone.
#[derive(Clone)]
pub struct EmbedQueue {
    tx: mpsc::Sender<String>,
    inflight: InFlight,
}

impl EmbedQueue {
    /// Queue `id` without waiting. Returns `false` (and drops the id) when
    /// the queue is full or the worker has stopped.
    pub fn try_enqueue(&self, id: &str) -> bool {
        self.inflight.begin();
        match self.tx.try_send(id.to_string()) {
            Ok(()) => true,
            Err(e) => {
                self.inflight.finish();
                debug!(id, error = %e, "embedding queue rejected id");
                false
            }
        }
    }

    /// Ids queued or being processed.
    pub fn pending(&self) -> usize {
        self.inflight.count()
    }

    pub(crate) async fn idle(&self) {
        self.inflight.idle().await
    }
}

/// Provider call counters, shared with [`crate::engine::ContentIndex::stats`].
#[derive(Debug, Default)]
pub struct EmbeddingCounters {
    requests: AtomicU64,
    failures: AtomicU64,
    stored: AtomicU64,
    discarded: AtomicU64,
}

impl EmbeddingCounters {
    pub fn requests(&self) -> u64 {
        self.requests.load(Ordering::Relaxed)
    }
    pub fn failures(&self) -> u64 {
        self.failures.load(Ordering::Relaxed)
    }
    pub fn stored(&self) -> u64 {
        self.stored.load(Ordering::Relaxed)
    }
    /// Vectors dropped because the entry changed during the call.
    pub fn discarded(&self) -> u64 {
        self.discarded.load(Ordering::Relaxed)
    }
}

struct EmbedWorker {
    store: Arc<dyn EntryStore>,
    provider: Arc<dyn EmbeddingProvider>,
    bus: EventBus,
    counters: Arc<EmbeddingCounters>,
    max_embedded: usize,
    prefix_chars: usize,
    min_interval: Duration,
    backoff: Duration,
    timeout: Duration,
    dims: Option<usize>,
    last_call: Option<Instant>,
}

/// Start the worker. Returns the queue handle, the shared counters and the
/// task handle; the task exits when `cancel` fires, discarding ids still
/// queued (they are found again by the next backfill).
pub fn spawn(
    store: Arc<dyn EntryStore>,
    provider: Arc<dyn EmbeddingProvider>,
    bus: EventBus,
    config: &EmbeddingConfig,
    cancel: CancellationToken,
) -> (EmbedQueue, Arc<EmbeddingCounters>, JoinHandle<()>) {
    let (tx, rx) = mpsc::channel(config.queue_capacity.max(1));
    let inflight = InFlight::new();
    let counters = Arc::new(EmbeddingCounters::default());

    let worker = EmbedWorker {
        store,
        provider,
        bus,
        counters: counters.clone(),
        max_embedded: config.max_embedded,
        prefix_chars: config.content_prefix_chars,
        min_interval: Duration::from_millis(config.min_interval_ms),
        backoff: Duration::from_millis(config.failure_backoff_ms),
        timeout: Duration::from_secs(config.timeout_secs),
        dims: config.dims,
        last_call: None,
    };
    let handle = tokio::spawn(worker.run(rx, inflight.clone(), cancel));

    (EmbedQueue { tx, inflight }, counters, handle)
}

impl EmbedWorker {
    async fn run(mut self, mut rx: mpsc::Receiver<String>, inflight: InFlight, cancel: CancellationToken) {
        info!(model = self.provider.model_name(), "embedding worker started");
        loop {
            let id = tokio::select! {
                biased;
                _ = cancel.cancelled() => break,
                item = rx.recv() => match item {
                    Some(id) => id,
                    None => break,
                },
            };
            if let Err(e) = self.process(&id, &cancel).await {
                warn!(id = %id, error = %e, "embedding store error");
            }
            inflight.finish();
        }

        rx.close();
        let mut dropped = 0usize;
        while rx.try_recv().is_ok() {
            inflight.finish();
            dropped += 1;
        }
        info!(dropped, "embedding worker stopped");
    }

    async fn process(&mut self, id: &str, cancel: &CancellationToken) -> Result<()> {
        if !self.provider.is_enabled() {
            return Ok(());
        }
        if self.store.embedding_count().await? >= self.max_embedded {
            debug!(id, cap = self.max_embedded, "embedding cap reached; skipping");
            return Ok(());
        }
        let Some(entry) = self.store.get(id).await? else {
            debug!(id, "entry gone before embedding");
            return Ok(());
        };
        if self.store.has_embedding(id).await? {
            return Ok(());
        }

        if !self.wait_for_slot(cancel).await {
            return Ok(());
        }

        let text = embedding_text(&entry.title, &entry.content, self.prefix_chars);
        self.counters.requests.fetch_add(1, Ordering::Relaxed);
        self.last_call = Some(Instant::now());

        let result = match tokio::time::timeout(self.timeout, self.provider.embed(&text)).await {
            Ok(Ok(vector)) if vector.is_empty() => {
                Err(anyhow::anyhow!("provider returned an empty vector"))
            }
            Ok(Ok(vector)) if self.dims.is_some_and(|d| d != vector.len()) => Err(anyhow::anyhow!(
                "provider returned {} dims, expected {}",
                vector.len(),
                self.dims.unwrap_or_default()
            )),
            Ok(Ok(vector)) => Ok(vector),
            Ok(Err(e)) => Err(e),
            Err(_) => Err(anyhow::anyhow!("timed out after {:?}", self.timeout)),
        };

        let vector = match result {
            Ok(v) => v,
            Err(e) => {
                self.counters.failures.fetch_add(1, Ordering::Relaxed);
                warn!(id, error = %e, "embedding request failed");
                tokio::select! {
                    _ = cancel.cancelled() => {}
                    _ = tokio::time::sleep(self.backoff) => {}
                }
                return Ok(());
            }
        };

        if self
            .store
            .put_embedding_if(id, &entry.title, &entry.content, &vector)
            .await?
        {
            self.counters.stored.fetch_add(1, Ordering::Relaxed);
            debug!(id, dims = vector.len(), "embedding stored");
            self.bus.publish(Event::new(EMBEDDING_COMPLETE).with("id", id));
        } else {
            self.counters.discarded.fetch_add(1, Ordering::Relaxed);
            debug!(id, "entry changed during embedding; vector discarded");
        }
        Ok(())
    }

    /// Sleep until `min_interval` has passed since the previous call.
    /// Returns `false` if cancelled while waiting.
    async fn wait_for_slot(&self, cancel: &CancellationToken) -> bool {
        let Some(last) = self.last_call else {
            return true;
        };
        let ready_at = last + self.min_interval;
        if Instant::now() >= ready_at {
            return true;
        }
        tokio::select! {
            _ = cancel.cancelled() => false,
            _ = tokio::time::sleep_until(ready_at) => true,
        }
    }
}
