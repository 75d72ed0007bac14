use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use async_trait::async_trait;
use serde_json::json;
use tempfile::TempDir;

use site_index::config::Config;
use site_index::embedding::EmbeddingProvider;
use site_index::models::{Event, Metadata, EMBEDDING_COMPLETE, INDEX_COMPLETE, SUMMARY_GENERATED};
use site_index::store::snapshot::SnapshotStore;
use site_index::store::sqlite::SqliteStore;
use site_index::store::EntryStore;
use site_index::{ContentIndex, IndexError};

/// Deterministic provider that counts calls.
struct CountingProvider {
    calls: AtomicUsize,
}

impl CountingProvider {
    fn new() -> Arc<Self> {
        Arc::new(Self {
            calls: AtomicUsize::new(0),
        })
    }

    fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl EmbeddingProvider for CountingProvider {
    fn model_name(&self) -> &str {
        "counting"
    }

    async fn embed(&self, text: &str) -> Result<Vec<f32>> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        Ok(vec![1.0, (text.len() % 13) as f32 + 1.0])
    }
}

fn test_config() -> Config {
    let mut config = Config::default();
    config.embedding.min_interval_ms = 0;
    config.embedding.failure_backoff_ms = 10;
    config.store.flush_debounce_ms = 20;
    config
}

fn snapshot(tmp: &TempDir) -> Arc<SnapshotStore> {
    Arc::new(SnapshotStore::open(&tmp.path().join("snapshot"), Duration::from_millis(20)).unwrap())
}

fn meta(value: serde_json::Value) -> Metadata {
    value.as_object().cloned().unwrap_or_default()
}

async fn settle(index: &ContentIndex) {
    tokio::time::timeout(Duration::from_secs(10), index.settle())
        .await
        .expect("index did not settle");
}

#[tokio::test]
async fn test_index_then_search_returns_entry() {
    let tmp = TempDir::new().unwrap();
    let provider = CountingProvider::new();
    let index = ContentIndex::start(snapshot(&tmp), provider.clone(), &test_config()).await;

    index
        .index(
            "a1",
            "news",
            "Fed raises rates",
            "The Federal Reserve raised interest rates today.",
            Metadata::new(),
        )
        .await;
    settle(&index).await;

    let hits = index.search("Fed", 10, None).await.unwrap();
    assert_eq!(hits.len(), 1);
    assert_eq!(hits[0].entry.id, "a1");
    assert!(index.get_embedding("a1").await.is_some());

    index.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_metadata_only_reindex() {
    let tmp = TempDir::new().unwrap();
    let provider = CountingProvider::new();
    let index = ContentIndex::start(snapshot(&tmp), provider.clone(), &test_config()).await;

    index
        .index("a1", "news", "T", "C", meta(json!({"views": 1})))
        .await;
    settle(&index).await;
    let first = index.get_by_id("a1").await.unwrap();

    index
        .index("a1", "news", "T", "C", meta(json!({"views": 2})))
        .await;
    settle(&index).await;

    let entry = index.get_by_id("a1").await.unwrap();
    assert_eq!(entry.metadata["views"], 2);
    assert_eq!(entry.indexed_at, first.indexed_at);
    assert_eq!(provider.calls(), 1);

    index.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_content_change_triggers_one_reembed() {
    let tmp = TempDir::new().unwrap();
    let provider = CountingProvider::new();
    let index = ContentIndex::start(snapshot(&tmp), provider.clone(), &test_config()).await;

    index.index("a1", "news", "T", "first", Metadata::new()).await;
    settle(&index).await;
    index.index("a1", "news", "T", "first", Metadata::new()).await;
    settle(&index).await;
    assert_eq!(provider.calls(), 1);

    index.index("a1", "news", "T", "second", Metadata::new()).await;
    settle(&index).await;
    assert_eq!(provider.calls(), 2);
    assert!(index.get_embedding("a1").await.is_some());
    assert_eq!(index.get_by_id("a1").await.unwrap().content, "second");

    index.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_events_delivered_to_current_subscribers_only() {
    let tmp = TempDir::new().unwrap();
    let index = ContentIndex::start(snapshot(&tmp), CountingProvider::new(), &test_config()).await;

    let mut indexed = index.subscribe(INDEX_COMPLETE);
    let mut embedded = index.subscribe(EMBEDDING_COMPLETE);
    index.index("a1", "market", "Gold", "up", Metadata::new()).await;
    settle(&index).await;

    let event = indexed.recv().await.unwrap();
    assert_eq!(event.data["id"], "a1");
    assert_eq!(event.data["type"], "market");
    assert_eq!(embedded.recv().await.unwrap().data["id"], "a1");

    let mut first = index.subscribe(SUMMARY_GENERATED);
    index.publish(Event::new(SUMMARY_GENERATED).with("id", "s1"));
    let mut late = index.subscribe(SUMMARY_GENERATED);
    index.publish(Event::new(SUMMARY_GENERATED).with("id", "s2"));

    assert_eq!(first.recv().await.unwrap().data["id"], "s1");
    assert_eq!(first.recv().await.unwrap().data["id"], "s2");
    assert_eq!(late.recv().await.unwrap().data["id"], "s2");
    assert!(late.try_recv().is_none());

    index.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_embedding_cap_leaves_rest_keyword_only() {
    let tmp = TempDir::new().unwrap();
    let provider = CountingProvider::new();
    let mut config = test_config();
    config.embedding.max_embedded = 2;
    let index = ContentIndex::start(snapshot(&tmp), provider.clone(), &config).await;

    for i in 0..4 {
        index
            .index(format!("n{}", i), "news", format!("copper {}", i), "", Metadata::new())
            .await;
    }
    settle(&index).await;

    let stats = index.stats().await.unwrap();
    assert_eq!(stats.entries, 4);
    assert_eq!(stats.embedded, 2);
    assert_eq!(provider.calls(), 2);
    assert_eq!(index.search("copper", 10, None).await.unwrap().len(), 4);

    index.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_shutdown_persists_snapshot() {
    let tmp = TempDir::new().unwrap();
    let index = ContentIndex::start(snapshot(&tmp), CountingProvider::new(), &test_config()).await;
    index
        .index("a1", "news", "Persisted", "body", meta(json!({"url": "https://example.com"})))
        .await;
    settle(&index).await;
    index.shutdown().await.unwrap();

    let reopened = snapshot(&tmp);
    let entry = reopened.get("a1").await.unwrap().unwrap();
    assert_eq!(entry.metadata["url"], "https://example.com");
    assert!(reopened.get_embedding("a1").await.unwrap().is_some());
}

#[tokio::test]
async fn test_start_backfills_missing_embeddings() {
    let tmp = TempDir::new().unwrap();
    let store = snapshot(&tmp);
    let seed = ContentIndex::start(
        store.clone(),
        Arc::new(site_index::embedding::DisabledProvider),
        &test_config(),
    )
    .await;
    for id in ["a", "b", "c"] {
        seed.index(id, "news", "t", id, Metadata::new()).await;
    }
    seed.settle().await;
    seed.shutdown().await.unwrap();
    assert_eq!(store.embedding_count().await.unwrap(), 0);

    let provider = CountingProvider::new();
    let index = ContentIndex::start(store.clone(), provider.clone(), &test_config()).await;
    settle(&index).await;
    assert_eq!(provider.calls(), 3);
    assert_eq!(store.embedding_count().await.unwrap(), 3);

    index.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_concurrent_producers_lose_nothing() {
    let tmp = TempDir::new().unwrap();
    let mut config = test_config();
    config.ingest.queue_capacity = 4;
    config.ingest.workers = 2;
    let index = Arc::new(
        ContentIndex::start(
            snapshot(&tmp),
            Arc::new(site_index::embedding::DisabledProvider),
            &config,
        )
        .await,
    );

    let mut producers = Vec::new();
    for p in 0..8 {
        let index = index.clone();
        producers.push(tokio::spawn(async move {
            for i in 0..50 {
                index
                    .index(format!("{}-{}", p, i), "news", "t", "c", Metadata::new())
                    .await;
            }
        }));
    }
    for producer in producers {
        producer.await.unwrap();
    }
    settle(&index).await;

    assert_eq!(index.stats().await.unwrap().entries, 400);
    index.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_clear_and_contract_errors() {
    let tmp = TempDir::new().unwrap();
    let index = ContentIndex::start(snapshot(&tmp), CountingProvider::new(), &test_config()).await;
    index.index("a1", "news", "Gold", "c", Metadata::new()).await;
    settle(&index).await;
    index.search("gold", 5, None).await.unwrap();

    assert_eq!(
        index.search("gold", 0, None).await.unwrap_err(),
        IndexError::InvalidLimit
    );

    index.clear().await.unwrap();
    let stats = index.stats().await.unwrap();
    assert_eq!(stats.entries, 0);
    assert_eq!(stats.embedded, 0);
    assert_eq!(stats.cached_queries, 0);
    assert!(index.get_by_id("a1").await.is_none());

    index.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_sqlite_backend_end_to_end() {
    let tmp = TempDir::new().unwrap();
    let store = Arc::new(
        SqliteStore::open(&tmp.path().join("index.sqlite"), 50, 200)
            .await
            .unwrap(),
    );
    let provider = CountingProvider::new();
    let index = ContentIndex::start(store, provider.clone(), &test_config()).await;

    index
        .index("old", "news", "Fed minutes", "notes", Metadata::new())
        .await;
    index
        .index("new", "news", "Markets", "the fed held", Metadata::new())
        .await;
    index.index("m1", "market", "Oil", "barrels", Metadata::new()).await;
    settle(&index).await;
    assert_eq!(provider.calls(), 3);

    let hits = index.search("fed", 10, Some("news")).await.unwrap();
    assert_eq!(hits[0].entry.id, "old");
    assert!(hits.iter().any(|h| h.entry.id == "new"));
    assert!(hits.iter().all(|h| h.entry.kind == "news"));

    let news = index.get_by_type("news", 10).await;
    assert_eq!(news.len(), 2);
    assert_eq!(index.stats().await.unwrap().backend, "sqlite");

    index.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_non_ascii_query_matches_on_both_backends() {
    let tmp = TempDir::new().unwrap();
    let sqlite: Arc<dyn EntryStore> = Arc::new(
        SqliteStore::open(&tmp.path().join("index.sqlite"), 50, 200)
            .await
            .unwrap(),
    );
    let snap: Arc<dyn EntryStore> = snapshot(&tmp);
    let stores = vec![snap, sqlite];

    for store in stores {
        let index = ContentIndex::start(
            store,
            Arc::new(site_index::embedding::DisabledProvider),
            &test_config(),
        )
        .await;
        index
            .index("z", "news", "Émile Zola obituary", "", Metadata::new())
            .await;
        index
            .index("b", "news", "Bridges", "DIE BRÜCKE wurde eröffnet", Metadata::new())
            .await;
        settle(&index).await;

        let backend = index.stats().await.unwrap().backend;
        let hits = index.search("émile", 5, None).await.unwrap();
        assert_eq!(hits.len(), 1, "backend {}", backend);
        assert_eq!(hits[0].entry.id, "z");
        let hits = index.search("brücke", 5, None).await.unwrap();
        assert_eq!(hits.len(), 1, "backend {}", backend);
        assert_eq!(hits[0].entry.id, "b");

        index.shutdown().await.unwrap();
    }
}
