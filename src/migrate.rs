//! Schema creation for the SQLite backend. Every statement is idempotent.
//!
//! `title_lc` and `content_lc` hold Rust-lowercased copies of `title` and
//! `content`. Keyword scans run `LIKE` against them because SQLite's
//! `LIKE` only folds ASCII case.

use anyhow::Result;
use sqlx::{Row, SqlitePool};

pub async fn run_migrations(pool: &SqlitePool) -> Result<()> {
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS entries (
            id TEXT PRIMARY KEY,
            type TEXT NOT NULL,
            title TEXT NOT NULL,
            content TEXT NOT NULL,
            metadata_json TEXT NOT NULL DEFAULT '{}',
            indexed_at INTEGER NOT NULL,
            title_lc TEXT,
            content_lc TEXT
        )
        "#,
    )
    .execute(pool)
    .await?;

    add_lowercase_columns(pool).await?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS entry_embeddings (
            entry_id TEXT PRIMARY KEY,
            embedding BLOB NOT NULL,
            dims INTEGER NOT NULL,
            created_at INTEGER NOT NULL,
            FOREIGN KEY (entry_id) REFERENCES entries(id) ON DELETE CASCADE
        )
        "#,
    )
    .execute(pool)
    .await?;

    // Type-filtered, newest-first scans
    sqlx::query(
        "CREATE INDEX IF NOT EXISTS idx_entries_type_indexed_at ON entries(type, indexed_at DESC)",
    )
    .execute(pool)
    .await?;
    sqlx::query("CREATE INDEX IF NOT EXISTS idx_entries_indexed_at ON entries(indexed_at DESC)")
        .execute(pool)
        .await?;

    Ok(())
}

/// Add the lowercase shadow columns to databases created without them,
/// then fill any rows that lack them.
async fn add_lowercase_columns(pool: &SqlitePool) -> Result<()> {
    let columns: Vec<String> = sqlx::query("PRAGMA table_info(entries)")
        .fetch_all(pool)
        .await?
        .iter()
        .map(|row| row.get::<String, _>("name"))
        .collect();
    for column in ["title_lc", "content_lc"] {
        if !columns.iter().any(|c| c == column) {
            sqlx::query(&format!("ALTER TABLE entries ADD COLUMN {} TEXT", column))
                .execute(pool)
                .await?;
        }
    }

    let rows = sqlx::query(
        "SELECT id, title, content FROM entries WHERE title_lc IS NULL OR content_lc IS NULL",
    )
    .fetch_all(pool)
    .await?;
    if rows.is_empty() {
        return Ok(());
    }
    let mut tx = pool.begin().await?;
    for row in &rows {
        let id: String = row.get("id");
        let title: String = row.get("title");
        let content: String = row.get("content");
        sqlx::query("UPDATE entries SET title_lc = ?, content_lc = ? WHERE id = ?")
            .bind(title.to_lowercase())
            .bind(content.to_lowercase())
            .bind(id)
            .execute(&mut *tx)
            .await?;
    }
    tx.commit().await?;
    tracing::info!(rows = rows.len(), "filled lowercase search columns");
    Ok(())
}
