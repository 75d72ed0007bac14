//! SQLite-backed [`EntryStore`] implementation.
//!
//! Entries and embeddings are two related tables (see
//! [`crate::migrate`]). Lookups by id are direct; type listings use the
//! `(type, indexed_at)` index. Keyword candidates come from a two-phase
//! `LIKE` scan over the lowercase shadow columns: a small pass over titles,
//! then a pass over the content of only the most recent rows, unioned by id. Vector search is a full scan
//! of every stored embedding with cosine similarity computed in Rust; there
//! is no approximate index, which is only reasonable while the embedding
//! cap keeps the table small.

use std::collections::HashSet;
use std::path::Path;

use anyhow::{bail, Result};
use async_trait::async_trait;
use chrono::DateTime;
use sqlx::sqlite::SqliteRow;
use sqlx::{Row, SqlitePool};

use crate::db;
use crate::embedding::{blob_to_vec, cosine_similarity, vec_to_blob};
use crate::migrate;
use crate::models::{Entry, Metadata};

use super::{EntryStore, VectorCandidate};

const ENTRY_COLUMNS: &str = "e.id, e.type, e.title, e.content, e.metadata_json, e.indexed_at";

/// SQLite implementation of the [`EntryStore`] trait.
pub struct SqliteStore {
    pool: SqlitePool,
    title_pass_limit: usize,
    content_pass_limit: usize,
}

impl SqliteStore {
    pub fn new(pool: SqlitePool, title_pass_limit: usize, content_pass_limit: usize) -> Self {
        Self {
            pool,
            title_pass_limit,
            content_pass_limit,
        }
    }

    /// Connect to `db_path`, creating the file and schema if needed.
    pub async fn open(
        db_path: &Path,
        title_pass_limit: usize,
        content_pass_limit: usize,
    ) -> Result<Self> {
        let pool = db::connect(db_path).await?;
        migrate::run_migrations(&pool).await?;
        Ok(Self::new(pool, title_pass_limit, content_pass_limit))
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    pub async fn close(&self) {
        self.pool.close().await;
    }

    /// Bulk upsert of entries in one transaction. Leaves embeddings alone.
    pub async fn import_entries(&self, entries: &[Entry]) -> Result<u64> {
        let mut tx = self.pool.begin().await?;
        let mut written = 0u64;
        for entry in entries {
            written += upsert_entry(&mut *tx, entry).await?;
        }
        tx.commit().await?;
        Ok(written)
    }

    /// Bulk upsert of embeddings in one transaction. Vectors whose entry
    /// does not exist are ignored.
    pub async fn import_embeddings(&self, embeddings: &[(String, Vec<f32>)]) -> Result<u64> {
        let mut tx = self.pool.begin().await?;
        let mut written = 0u64;
        for (id, vector) in embeddings {
            written += upsert_embedding(&mut *tx, id, vector).await?;
        }
        tx.commit().await?;
        Ok(written)
    }
}

async fn upsert_entry<'e, E>(executor: E, entry: &Entry) -> Result<u64>
where
    E: sqlx::Executor<'e, Database = sqlx::Sqlite>,
{
    let metadata_json = serde_json::to_string(&entry.metadata)?;
    let result = sqlx::query(
        r#"
        INSERT INTO entries (id, type, title, content, metadata_json, indexed_at, title_lc, content_lc)
        VALUES (?, ?, ?, ?, ?, ?, ?, ?)
        ON CONFLICT(id) DO UPDATE SET
            type = excluded.type,
            title = excluded.title,
            content = excluded.content,
            metadata_json = excluded.metadata_json,
            indexed_at = excluded.indexed_at,
            title_lc = excluded.title_lc,
            content_lc = excluded.content_lc
        "#,
    )
    .bind(&entry.id)
    .bind(&entry.kind)
    .bind(&entry.title)
    .bind(&entry.content)
    .bind(metadata_json)
    .bind(entry.indexed_at.timestamp_millis())
    .bind(entry.title.to_lowercase())
    .bind(entry.content.to_lowercase())
    .execute(executor)
    .await?;
    Ok(result.rows_affected())
}

/// Returns the number of rows written: 0 when the entry does not exist.
async fn upsert_embedding<'e, E>(executor: E, id: &str, vector: &[f32]) -> Result<u64>
where
    E: sqlx::Executor<'e, Database = sqlx::Sqlite>,
{
    let now = chrono::Utc::now().timestamp();
    let result = sqlx::query(
        r#"
        INSERT INTO entry_embeddings (entry_id, embedding, dims, created_at)
        SELECT id, ?, ?, ? FROM entries WHERE id = ?
        ON CONFLICT(entry_id) DO UPDATE SET
            embedding = excluded.embedding,
            dims = excluded.dims,
            created_at = excluded.created_at
        "#,
    )
    .bind(vec_to_blob(vector))
    .bind(vector.len() as i64)
    .bind(now)
    .bind(id)
    .execute(executor)
    .await?;
    Ok(result.rows_affected())
}

fn row_to_entry(row: &SqliteRow) -> Entry {
    let metadata_json: String = row.get("metadata_json");
    let metadata: Metadata = serde_json::from_str(&metadata_json).unwrap_or_default();
    let indexed_at: i64 = row.get("indexed_at");
    Entry {
        id: row.get("id"),
        kind: row.get("type"),
        title: row.get("title"),
        content: row.get("content"),
        metadata,
        indexed_at: DateTime::from_timestamp_millis(indexed_at).unwrap_or_default(),
    }
}

/// `%term%` with LIKE wildcards in the term escaped.
fn like_pattern(term: &str) -> String {
    let mut escaped = String::with_capacity(term.len() + 2);
    escaped.push('%');
    for c in term.chars() {
        if matches!(c, '\\' | '%' | '_') {
            escaped.push('\\');
        }
        escaped.push(c);
    }
    escaped.push('%');
    escaped
}

fn like_clause(column: &str, terms: usize) -> String {
    (0..terms)
        .map(|_| format!("{} LIKE ? ESCAPE '\\'", column))
        .collect::<Vec<_>>()
        .join(" OR ")
}

#[async_trait]
impl EntryStore for SqliteStore {
    fn backend_name(&self) -> &'static str {
        "sqlite"
    }

    async fn put(&self, entry: &Entry) -> Result<()> {
        let mut tx = self.pool.begin().await?;
        upsert_entry(&mut *tx, entry).await?;
        sqlx::query("DELETE FROM entry_embeddings WHERE entry_id = ?")
            .bind(&entry.id)
            .execute(&mut *tx)
            .await?;
        tx.commit().await?;
        Ok(())
    }

    async fn update_metadata(&self, id: &str, metadata: &Metadata) -> Result<bool> {
        let result = sqlx::query("UPDATE entries SET metadata_json = ? WHERE id = ?")
            .bind(serde_json::to_string(metadata)?)
            .bind(id)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected() > 0)
    }

    async fn get(&self, id: &str) -> Result<Option<Entry>> {
        let sql = format!("SELECT {} FROM entries e WHERE e.id = ?", ENTRY_COLUMNS);
        let row = sqlx::query(&sql)
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        Ok(row.as_ref().map(row_to_entry))
    }

    async fn get_by_type(&self, kind: &str, limit: usize) -> Result<Vec<Entry>> {
        let sql = format!(
            "SELECT {} FROM entries e WHERE e.type = ? ORDER BY e.indexed_at DESC, e.id ASC LIMIT ?",
            ENTRY_COLUMNS
        );
        let rows = sqlx::query(&sql)
            .bind(kind)
            .bind(limit as i64)
            .fetch_all(&self.pool)
            .await?;
        Ok(rows.iter().map(row_to_entry).collect())
    }

    async fn put_embedding(&self, id: &str, vector: &[f32]) -> Result<()> {
        if upsert_embedding(&self.pool, id, vector).await? == 0 {
            bail!("no entry with id '{}'", id);
        }
        Ok(())
    }

    async fn put_embedding_if(
        &self,
        id: &str,
        title: &str,
        content: &str,
        vector: &[f32],
    ) -> Result<bool> {
        let now = chrono::Utc::now().timestamp();
        let result = sqlx::query(
            r#"
            INSERT INTO entry_embeddings (entry_id, embedding, dims, created_at)
            SELECT id, ?, ?, ? FROM entries WHERE id = ? AND title = ? AND content = ?
            ON CONFLICT(entry_id) DO UPDATE SET
                embedding = excluded.embedding,
                dims = excluded.dims,
                created_at = excluded.created_at
            "#,
        )
        .bind(vec_to_blob(vector))
        .bind(vector.len() as i64)
        .bind(now)
        .bind(id)
        .bind(title)
        .bind(content)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() > 0)
    }

    async fn get_embedding(&self, id: &str) -> Result<Option<Vec<f32>>> {
        let blob: Option<Vec<u8>> =
            sqlx::query_scalar("SELECT embedding FROM entry_embeddings WHERE entry_id = ?")
                .bind(id)
                .fetch_optional(&self.pool)
                .await?;
        Ok(blob.map(|b| blob_to_vec(&b)))
    }

    async fn has_embedding(&self, id: &str) -> Result<bool> {
        let found: bool =
            sqlx::query_scalar("SELECT COUNT(*) > 0 FROM entry_embeddings WHERE entry_id = ?")
                .bind(id)
                .fetch_one(&self.pool)
                .await?;
        Ok(found)
    }

    async fn embedding_count(&self) -> Result<usize> {
        let n: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM entry_embeddings")
            .fetch_one(&self.pool)
            .await?;
        Ok(n as usize)
    }

    async fn entry_count(&self) -> Result<usize> {
        let n: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM entries")
            .fetch_one(&self.pool)
            .await?;
        Ok(n as usize)
    }

    async fn missing_embeddings(&self, limit: usize) -> Result<Vec<String>> {
        let ids: Vec<String> = sqlx::query_scalar(
            r#"
            SELECT e.id FROM entries e
            LEFT JOIN entry_embeddings v ON v.entry_id = e.id
            WHERE v.entry_id IS NULL
            ORDER BY e.indexed_at DESC, e.id ASC
            LIMIT ?
            "#,
        )
        .bind(limit as i64)
        .fetch_all(&self.pool)
        .await?;
        Ok(ids)
    }

    async fn keyword_candidates(&self, terms: &[String], kind: Option<&str>) -> Result<Vec<Entry>> {
        if terms.is_empty() {
            return Ok(Vec::new());
        }
        let patterns: Vec<String> = terms.iter().map(|t| like_pattern(t)).collect();
        let type_filter = if kind.is_some() { " AND e.type = ?" } else { "" };

        // Phase 1: titles, across the whole table.
        let title_sql = format!(
            "SELECT {} FROM entries e WHERE ({}){} ORDER BY e.indexed_at DESC LIMIT ?",
            ENTRY_COLUMNS,
            like_clause("e.title_lc", patterns.len()),
            type_filter
        );
        let mut query = sqlx::query(&title_sql);
        for p in &patterns {
            query = query.bind(p);
        }
        if let Some(k) = kind {
            query = query.bind(k);
        }
        let title_rows = query
            .bind(self.title_pass_limit as i64)
            .fetch_all(&self.pool)
            .await?;

        // Phase 2: content, within the most recent rows only.
        let recent_filter = if kind.is_some() { " WHERE type = ?" } else { "" };
        let content_sql = format!(
            "SELECT {} FROM (SELECT * FROM entries{} ORDER BY indexed_at DESC LIMIT ?) AS e WHERE ({})",
            ENTRY_COLUMNS,
            recent_filter,
            like_clause("e.content_lc", patterns.len())
        );
        let mut query = sqlx::query(&content_sql);
        if let Some(k) = kind {
            query = query.bind(k);
        }
        query = query.bind(self.content_pass_limit as i64);
        for p in &patterns {
            query = query.bind(p);
        }
        let content_rows = query.fetch_all(&self.pool).await?;

        let mut seen = HashSet::new();
        Ok(title_rows
            .iter()
            .chain(content_rows.iter())
            .map(row_to_entry)
            .filter(|e| seen.insert(e.id.clone()))
            .collect())
    }

    async fn vector_search(&self, query: &[f32], kind: Option<&str>) -> Result<Vec<VectorCandidate>> {
        let type_filter = if kind.is_some() { " WHERE e.type = ?" } else { "" };
        let sql = format!(
            "SELECT {}, v.embedding FROM entry_embeddings v JOIN entries e ON e.id = v.entry_id{}",
            ENTRY_COLUMNS, type_filter
        );
        let mut q = sqlx::query(&sql);
        if let Some(k) = kind {
            q = q.bind(k);
        }
        let rows = q.fetch_all(&self.pool).await?;

        Ok(rows
            .iter()
            .map(|row| {
                let blob: Vec<u8> = row.get("embedding");
                VectorCandidate {
                    entry: row_to_entry(row),
                    similarity: cosine_similarity(query, &blob_to_vec(&blob)),
                }
            })
            .collect())
    }

    async fn clear(&self) -> Result<()> {
        let mut tx = self.pool.begin().await?;
        sqlx::query("DELETE FROM entry_embeddings")
            .execute(&mut *tx)
            .await?;
        sqlx::query("DELETE FROM entries").execute(&mut *tx).await?;
        tx.commit().await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use serde_json::json;
    use tempfile::TempDir;

    fn entry(id: &str, kind: &str, title: &str, content: &str, ts_ms: i64) -> Entry {
        Entry {
            id: id.to_string(),
            kind: kind.to_string(),
            title: title.to_string(),
            content: content.to_string(),
            metadata: Metadata::new(),
            indexed_at: DateTime::<Utc>::from_timestamp_millis(ts_ms).unwrap(),
        }
    }

    async fn open(dir: &TempDir, content_pass_limit: usize) -> SqliteStore {
        SqliteStore::open(&dir.path().join("index.sqlite"), 50, content_pass_limit)
            .await
            .unwrap()
    }

    fn ids(entries: &[Entry]) -> Vec<String> {
        let mut ids: Vec<String> = entries.iter().map(|e| e.id.clone()).collect();
        ids.sort();
        ids
    }

    #[tokio::test]
    async fn test_migrations_idempotent() {
        let dir = TempDir::new().unwrap();
        let store = open(&dir, 200).await;
        migrate::run_migrations(store.pool()).await.unwrap();
        migrate::run_migrations(store.pool()).await.unwrap();
    }

    #[tokio::test]
    async fn test_put_get_roundtrips_metadata_and_time() {
        let dir = TempDir::new().unwrap();
        let store = open(&dir, 200).await;
        let mut e = entry("a1", "news", "Fed raises rates", "body", 1_700_000_000_123);
        e.metadata.insert("url".to_string(), json!("https://example.com/a1"));
        e.metadata.insert("tags".to_string(), json!(["econ", "fed"]));
        store.put(&e).await.unwrap();

        let got = store.get("a1").await.unwrap().unwrap();
        assert_eq!(got, e);
        assert!(store.get("nope").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_get_by_type_newest_first() {
        let dir = TempDir::new().unwrap();
        let store = open(&dir, 200).await;
        store.put(&entry("old", "news", "t", "c", 1_000)).await.unwrap();
        store.put(&entry("new", "news", "t", "c", 3_000)).await.unwrap();
        store.put(&entry("mid", "market", "t", "c", 2_000)).await.unwrap();

        let news = store.get_by_type("news", 10).await.unwrap();
        let order: Vec<&str> = news.iter().map(|e| e.id.as_str()).collect();
        assert_eq!(order, vec!["new", "old"]);
    }

    #[tokio::test]
    async fn test_embeddings_lifecycle() {
        let dir = TempDir::new().unwrap();
        let store = open(&dir, 200).await;
        store.put(&entry("a", "news", "t", "c", 1)).await.unwrap();
        assert!(store.put_embedding("ghost", &[1.0]).await.is_err());

        store.put_embedding("a", &[0.25, -0.5]).await.unwrap();
        assert_eq!(store.get_embedding("a").await.unwrap(), Some(vec![0.25, -0.5]));
        assert!(store.has_embedding("a").await.unwrap());
        assert_eq!(store.embedding_count().await.unwrap(), 1);

        let mut md = Metadata::new();
        md.insert("views".to_string(), json!(3));
        assert!(store.update_metadata("a", &md).await.unwrap());
        assert!(store.has_embedding("a").await.unwrap());

        store.put(&entry("a", "news", "t", "changed", 2)).await.unwrap();
        assert!(!store.has_embedding("a").await.unwrap());
        assert_eq!(store.missing_embeddings(10).await.unwrap(), vec!["a".to_string()]);
    }

    #[tokio::test]
    async fn test_keyword_two_phase_scan() {
        let dir = TempDir::new().unwrap();
        let store = open(&dir, 2).await;
        // Oldest row: term only in title; found by the title pass.
        store.put(&entry("t-old", "news", "Fed minutes", "x", 1)).await.unwrap();
        // Term only in content of an old row: outside the 2-row window.
        store.put(&entry("c-old", "news", "x", "the fed said", 2)).await.unwrap();
        store.put(&entry("c-new", "news", "x", "FED policy", 3)).await.unwrap();
        store.put(&entry("other", "news", "x", "nothing", 4)).await.unwrap();

        let terms = vec!["fed".to_string()];
        let found = store.keyword_candidates(&terms, None).await.unwrap();
        assert_eq!(ids(&found), vec!["c-new", "t-old"]);
    }

    #[tokio::test]
    async fn test_keyword_type_filter_and_dedup() {
        let dir = TempDir::new().unwrap();
        let store = open(&dir, 200).await;
        store.put(&entry("a", "news", "Fed", "fed fed", 1)).await.unwrap();
        store.put(&entry("b", "market", "Fed", "fed", 2)).await.unwrap();

        let terms = vec!["fed".to_string()];
        let all = store.keyword_candidates(&terms, None).await.unwrap();
        assert_eq!(ids(&all), vec!["a", "b"]);
        let news = store.keyword_candidates(&terms, Some("news")).await.unwrap();
        assert_eq!(ids(&news), vec!["a"]);
    }

    #[tokio::test]
    async fn test_like_wildcards_are_literal() {
        let dir = TempDir::new().unwrap();
        let store = open(&dir, 200).await;
        store.put(&entry("pct", "news", "up 50% today", "", 1)).await.unwrap();
        store.put(&entry("num", "news", "up 500 today", "", 2)).await.unwrap();

        let terms = vec!["50%".to_string()];
        let found = store.keyword_candidates(&terms, None).await.unwrap();
        assert_eq!(ids(&found), vec!["pct"]);
        assert_eq!(like_pattern("a_b"), "%a\\_b%");
    }

    #[tokio::test]
    async fn test_keyword_scan_folds_non_ascii_case() {
        let dir = TempDir::new().unwrap();
        let store = open(&dir, 200).await;
        store.put(&entry("z", "news", "Émile Zola obituary", "", 1)).await.unwrap();
        store.put(&entry("s", "news", "x", "STRASSE ÜBER BRÜCKE", 2)).await.unwrap();

        let found = store.keyword_candidates(&["émile".to_string()], None).await.unwrap();
        assert_eq!(ids(&found), vec!["z"]);
        let found = store.keyword_candidates(&["über".to_string()], None).await.unwrap();
        assert_eq!(ids(&found), vec!["s"]);
    }

    #[tokio::test]
    async fn test_migration_fills_lowercase_columns_of_old_rows() {
        let dir = TempDir::new().unwrap();
        let pool = db::connect(&dir.path().join("index.sqlite")).await.unwrap();
        sqlx::query(
            "CREATE TABLE entries (id TEXT PRIMARY KEY, type TEXT NOT NULL, title TEXT NOT NULL, \
             content TEXT NOT NULL, metadata_json TEXT NOT NULL DEFAULT '{}', indexed_at INTEGER NOT NULL)",
        )
        .execute(&pool)
        .await
        .unwrap();
        sqlx::query("INSERT INTO entries (id, type, title, content, indexed_at) VALUES ('z', 'news', 'Émile', 'Ça va', 1)")
            .execute(&pool)
            .await
            .unwrap();

        migrate::run_migrations(&pool).await.unwrap();
        let store = SqliteStore::new(pool, 50, 200);
        let found = store.keyword_candidates(&["ça".to_string()], None).await.unwrap();
        assert_eq!(ids(&found), vec!["z"]);
        let found = store.keyword_candidates(&["émile".to_string()], None).await.unwrap();
        assert_eq!(ids(&found), vec!["z"]);
    }

    #[tokio::test]
    async fn test_conditional_embedding_write() {
        let dir = TempDir::new().unwrap();
        let store = open(&dir, 200).await;
        store.put(&entry("a", "news", "t", "c", 1)).await.unwrap();

        assert!(!store.put_embedding_if("a", "t", "old", &[1.0]).await.unwrap());
        assert!(!store.put_embedding_if("ghost", "t", "c", &[1.0]).await.unwrap());
        assert!(!store.has_embedding("a").await.unwrap());

        assert!(store.put_embedding_if("a", "t", "c", &[0.5]).await.unwrap());
        assert_eq!(store.get_embedding("a").await.unwrap(), Some(vec![0.5]));
    }

    #[tokio::test]
    async fn test_vector_search_full_scan_with_type_filter() {
        let dir = TempDir::new().unwrap();
        let store = open(&dir, 200).await;
        store.put(&entry("a", "news", "t", "c", 1)).await.unwrap();
        store.put(&entry("b", "market", "t", "c", 2)).await.unwrap();
        store.put(&entry("c", "news", "t", "c", 3)).await.unwrap();
        store.put_embedding("a", &[1.0, 0.0]).await.unwrap();
        store.put_embedding("b", &[0.0, 1.0]).await.unwrap();

        let all = store.vector_search(&[1.0, 0.0], None).await.unwrap();
        assert_eq!(all.len(), 2);
        let a = all.iter().find(|c| c.entry.id == "a").unwrap();
        assert!((a.similarity - 1.0).abs() < 1e-6);

        let news = store.vector_search(&[1.0, 0.0], Some("news")).await.unwrap();
        assert_eq!(news.len(), 1);
        assert_eq!(news[0].entry.id, "a");
    }

    #[tokio::test]
    async fn test_import_and_clear() {
        let dir = TempDir::new().unwrap();
        let store = open(&dir, 200).await;
        let written = store
            .import_entries(&[entry("a", "news", "t", "c", 1), entry("b", "news", "t", "c", 2)])
            .await
            .unwrap();
        assert_eq!(written, 2);
        let embedded = store
            .import_embeddings(&[("a".to_string(), vec![1.0]), ("ghost".to_string(), vec![1.0])])
            .await
            .unwrap();
        assert_eq!(embedded, 1);

        store.clear().await.unwrap();
        assert_eq!(store.entry_count().await.unwrap(), 0);
        assert_eq!(store.embedding_count().await.unwrap(), 0);
    }
}
