//! Storage abstraction for the index.
//!
//! The [`EntryStore`] trait defines every storage operation needed by the
//! ingestion, embedding, and search pipelines, with two interchangeable
//! backends:
//!
//! - [`snapshot::SnapshotStore`]: in-memory maps mirrored to two JSON
//!   snapshot files by a debounced flusher.
//! - [`sqlite::SqliteStore`]: `entries` and `entry_embeddings` tables in
//!   SQLite; every write is committed immediately.
//!
//! Implementations must be `Send + Sync` to work with async runtimes.

pub mod snapshot;
pub mod sqlite;

use std::sync::Arc;

use anyhow::Result;
use async_trait::async_trait;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::models::{Entry, Metadata};

/// An entry paired with its raw cosine similarity to a query vector.
#[derive(Debug, Clone)]
pub struct VectorCandidate {
    pub entry: Entry,
    pub similarity: f32,
}

/// Abstract storage backend.
///
/// # Operations
///
/// | Method | Purpose |
/// |--------|---------|
/// | [`put`](EntryStore::put) | Insert or replace an entry (drops its stale embedding) |
/// | [`update_metadata`](EntryStore::update_metadata) | Metadata-only update |
/// | [`get`](EntryStore::get) | Lookup by id |
/// | [`get_by_type`](EntryStore::get_by_type) | Newest-first listing of one type |
/// | [`put_embedding`](EntryStore::put_embedding) | Store a vector for an entry |
/// | [`put_embedding_if`](EntryStore::put_embedding_if) | Store a vector only if the entry's content still matches |
/// | [`get_embedding`](EntryStore::get_embedding) | Fetch an entry's vector |
/// | [`keyword_candidates`](EntryStore::keyword_candidates) | Entries whose title or content contains a term |
/// | [`vector_search`](EntryStore::vector_search) | Full-scan cosine similarity |
/// | [`clear`](EntryStore::clear) | Wipe all entries and embeddings |
#[async_trait]
pub trait EntryStore: Send + Sync {
    /// Short name for logs and stats (`"snapshot"`, `"sqlite"`).
    fn backend_name(&self) -> &'static str;

    /// Start any background task the backend needs (the snapshot
    /// backend's debounced flusher). The task must exit once `cancel`
    /// fires, persisting buffered state first.
    fn spawn_background(self: Arc<Self>, _cancel: CancellationToken) -> Option<JoinHandle<()>> {
        None
    }

    /// Insert or replace an entry.
    ///
    /// Any embedding stored for `entry.id` is removed: a replaced entry's
    /// content changed, so its old vector no longer describes it.
    async fn put(&self, entry: &Entry) -> Result<()>;

    /// Replace the metadata of an existing entry without touching its
    /// content, `indexed_at`, or embedding. Returns `false` if absent.
    async fn update_metadata(&self, id: &str, metadata: &Metadata) -> Result<bool>;

    async fn get(&self, id: &str) -> Result<Option<Entry>>;

    /// Entries of one type, most recently indexed first.
    async fn get_by_type(&self, kind: &str, limit: usize) -> Result<Vec<Entry>>;

    /// Store the embedding for an existing entry.
    async fn put_embedding(&self, id: &str, vector: &[f32]) -> Result<()>;

    /// Store the embedding only if the entry still has this `title` and
    /// `content`. The check and the write are one atomic step, so a
    /// concurrent [`put`](EntryStore::put) either lands first (and the
    /// vector is refused) or drops the vector afterwards. Returns `false`
    /// when the vector was refused.
    async fn put_embedding_if(
        &self,
        id: &str,
        title: &str,
        content: &str,
        vector: &[f32],
    ) -> Result<bool>;

    async fn get_embedding(&self, id: &str) -> Result<Option<Vec<f32>>>;

    async fn has_embedding(&self, id: &str) -> Result<bool> {
        Ok(self.get_embedding(id).await?.is_some())
    }

    async fn embedding_count(&self) -> Result<usize>;

    async fn entry_count(&self) -> Result<usize>;

    /// Ids of entries with no embedding, most recently indexed first.
    async fn missing_embeddings(&self, limit: usize) -> Result<Vec<String>>;

    /// Entries whose title or content contains any of the lowercase
    /// `terms`, optionally restricted to one type. Scoring happens in
    /// [`crate::search`].
    async fn keyword_candidates(&self, terms: &[String], kind: Option<&str>) -> Result<Vec<Entry>>;

    /// Cosine similarity of `query` against every stored embedding,
    /// optionally restricted to one type. Unsorted and unthresholded.
    async fn vector_search(&self, query: &[f32], kind: Option<&str>) -> Result<Vec<VectorCandidate>>;

    /// Remove all entries and embeddings.
    async fn clear(&self) -> Result<()>;

    /// Persist any buffered state now. No-op for backends that write through.
    async fn flush(&self) -> Result<()> {
        Ok(())
    }
}

/// Case-insensitive containment test used by scan-based keyword matching.
pub(crate) fn contains_any(haystack_lower: &str, terms: &[String]) -> bool {
    terms.iter().any(|t| haystack_lower.contains(t.as_str()))
}
