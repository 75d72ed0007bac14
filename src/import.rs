//! One-time transfer of a snapshot directory into the SQLite backend.
//!
//! Safe to re-run. The decision is made from what the target already holds:
//!
//! | Target state | Action |
//! |--------------|--------|
//! | entries and embeddings | nothing |
//! | entries, no embeddings | embeddings only |
//! | empty | all entries, then all embeddings |
//!
//! Each phase runs in a single transaction, so an interrupted run leaves
//! the target in one of the three states above and the next run resumes.

use anyhow::{Context, Result};
use tracing::info;

use crate::store::snapshot::SnapshotStore;
use crate::store::sqlite::SqliteStore;
use crate::store::EntryStore;

/// What a [`migrate_snapshot`] run did.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MigrationReport {
    pub entries_migrated: u64,
    pub embeddings_migrated: u64,
    /// Embeddings not written because their entry is absent from the target.
    pub skipped: u64,
}

impl MigrationReport {
    pub fn is_noop(&self) -> bool {
        self.entries_migrated == 0 && self.embeddings_migrated == 0
    }
}

pub async fn migrate_snapshot(source: &SnapshotStore, target: &SqliteStore) -> Result<MigrationReport> {
    let existing_entries = target.entry_count().await?;
    let existing_embeddings = target.embedding_count().await?;
    let mut report = MigrationReport::default();

    if existing_entries > 0 && existing_embeddings > 0 {
        info!(
            entries = existing_entries,
            embeddings = existing_embeddings,
            "target already populated; skipping migration"
        );
        return Ok(report);
    }

    if existing_entries == 0 {
        let entries = source.entries();
        report.entries_migrated = target
            .import_entries(&entries)
            .await
            .context("importing entries")?;
        info!(count = report.entries_migrated, "migrated entries");
    }

    let embeddings = source.embeddings();
    report.embeddings_migrated = target
        .import_embeddings(&embeddings)
        .await
        .context("importing embeddings")?;
    report.skipped = (embeddings.len() as u64).saturating_sub(report.embeddings_migrated);
    info!(
        count = report.embeddings_migrated,
        skipped = report.skipped,
        "migrated embeddings"
    );

    Ok(report)
}
