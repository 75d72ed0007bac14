//! Core data models used throughout the index.
//!
//! These types represent the entries, events, and search hits that flow
//! through the ingestion, embedding, and retrieval pipelines.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Schema-less, producer-defined key/value bag attached to an entry.
///
/// Preserved verbatim; the index never validates its contents.
pub type Metadata = serde_json::Map<String, serde_json::Value>;

/// Metadata keys consulted (in order) for an entry's "posted at" time.
pub const POSTED_AT_KEYS: [&str; 2] = ["posted_at", "published_at"];

/// A unit of indexed content.
///
/// The optional embedding vector is kept in the store's parallel
/// embedding table, keyed by the same `id` (see
/// [`EntryStore::get_embedding`](crate::store::EntryStore::get_embedding)).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Entry {
    /// Producer-assigned identifier, stable across re-indexing.
    pub id: String,
    /// Open type tag (`news`, `market`, `reminder`, ...), used as a query filter.
    #[serde(rename = "type")]
    pub kind: String,
    pub title: String,
    pub content: String,
    #[serde(default)]
    pub metadata: Metadata,
    /// Time of the last content write.
    #[serde(default = "Utc::now")]
    pub indexed_at: DateTime<Utc>,
}

impl Entry {
    /// True if `title` and `content` match, i.e. the content identity is unchanged.
    pub fn same_content(&self, title: &str, content: &str) -> bool {
        self.title == title && self.content == content
    }

    /// The timestamp used to break ranking ties.
    ///
    /// A metadata-provided "posted at" time wins (RFC 3339 string or unix
    /// seconds); otherwise `indexed_at`.
    pub fn effective_timestamp(&self) -> DateTime<Utc> {
        POSTED_AT_KEYS
            .iter()
            .filter_map(|key| self.metadata.get(*key))
            .find_map(parse_timestamp)
            .unwrap_or(self.indexed_at)
    }
}

fn parse_timestamp(value: &serde_json::Value) -> Option<DateTime<Utc>> {
    match value {
        serde_json::Value::String(s) => DateTime::parse_from_rfc3339(s)
            .ok()
            .map(|dt| dt.with_timezone(&Utc)),
        serde_json::Value::Number(n) => n.as_i64().and_then(|secs| DateTime::from_timestamp(secs, 0)),
        _ => None,
    }
}

/// A raw `index()` call, queued for the ingestion workers.
#[derive(Debug, Clone)]
pub struct IndexRequest {
    pub id: String,
    pub kind: String,
    pub title: String,
    pub content: String,
    pub metadata: Metadata,
}

/// Built-in event type fired when an entry's content is (re)written.
pub const INDEX_COMPLETE: &str = "index.complete";
/// Built-in event type fired when an entry's embedding is stored.
pub const EMBEDDING_COMPLETE: &str = "embedding.complete";
/// Event type producers use to announce a generated summary.
pub const SUMMARY_GENERATED: &str = "summary.generated";

/// An ephemeral in-process notification. Never persisted.
#[derive(Debug, Clone, PartialEq)]
pub struct Event {
    pub kind: String,
    pub data: serde_json::Map<String, serde_json::Value>,
}

impl Event {
    pub fn new(kind: impl Into<String>) -> Self {
        Self {
            kind: kind.into(),
            data: serde_json::Map::new(),
        }
    }

    /// Builder-style helper for attaching a data field.
    pub fn with(mut self, key: &str, value: impl Into<serde_json::Value>) -> Self {
        self.data.insert(key.to_string(), value.into());
        self
    }
}

/// A ranked search result.
#[derive(Debug, Clone, Serialize)]
pub struct SearchHit {
    pub entry: Entry,
    /// Final merged score: `max(keyword_score, semantic_score)`.
    pub score: f64,
    /// Weighted keyword score (0.0 if the entry had no keyword match).
    pub keyword_score: f64,
    /// Weighted cosine similarity (0.0 if absent from the vector pass).
    pub semantic_score: f64,
}
