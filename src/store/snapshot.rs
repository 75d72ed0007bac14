//! Flat-file snapshot backend.
//!
//! Entries and embeddings live in memory behind one `RwLock` and are
//! mirrored to `entries.json` and `embeddings.json` in the snapshot
//! directory. Writes only mark the store dirty; the flusher task started by
//! [`EntryStore::spawn_background`] waits out the debounce window and then
//! serializes the current state once, so a burst of writes costs a single
//! flush. The read path always serves the in-memory state.
//!
//! Loading tolerates older layouts: `entries.json` may be an object keyed
//! by id rather than an array, and records may carry their embedding
//! inline. Inline vectors are moved into the embedding map and the next
//! flush rewrites the split layout.

use std::collections::{BTreeMap, HashMap};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use async_trait::async_trait;
use parking_lot::RwLock;
use serde_json::Value;
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::embedding::cosine_similarity;
use crate::models::{Entry, Metadata};

use super::{contains_any, EntryStore, VectorCandidate};

pub const ENTRIES_FILE: &str = "entries.json";
pub const EMBEDDINGS_FILE: &str = "embeddings.json";

#[derive(Default)]
struct State {
    entries: HashMap<String, Entry>,
    embeddings: HashMap<String, Vec<f32>>,
}

/// Snapshot-file store. See the module docs for the persistence model.
pub struct SnapshotStore {
    dir: PathBuf,
    state: RwLock<State>,
    dirty: AtomicBool,
    wake: Notify,
    debounce: Duration,
    flush_lock: tokio::sync::Mutex<()>,
}

impl SnapshotStore {
    /// Open (or create) the snapshot directory and load any existing state.
    ///
    /// Unreadable snapshot files never fail the open: they are renamed to
    /// `*.bad` and the store starts from whatever could be recovered.
    pub fn open(dir: &Path, debounce: Duration) -> Result<Self> {
        std::fs::create_dir_all(dir)
            .with_context(|| format!("Failed to create snapshot dir: {}", dir.display()))?;
        Ok(Self::from_dir(dir, debounce, true))
    }

    /// Load an existing snapshot directory without changing anything on
    /// disk. Corrupt files are skipped in place. Used to read a migration
    /// source.
    pub fn load(dir: &Path, debounce: Duration) -> Result<Self> {
        if !dir.is_dir() {
            bail!("Snapshot directory not found: {}", dir.display());
        }
        Ok(Self::from_dir(dir, debounce, false))
    }

    fn from_dir(dir: &Path, debounce: Duration, quarantine: bool) -> Self {
        let (state, needs_rewrite) = load_state(dir, quarantine);
        tracing::info!(
            dir = %dir.display(),
            entries = state.entries.len(),
            embeddings = state.embeddings.len(),
            "snapshot store loaded"
        );

        Self {
            dir: dir.to_path_buf(),
            state: RwLock::new(state),
            dirty: AtomicBool::new(needs_rewrite),
            wake: Notify::new(),
            debounce,
            flush_lock: tokio::sync::Mutex::new(()),
        }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// True if there are writes not yet flushed to disk.
    pub fn is_dirty(&self) -> bool {
        self.dirty.load(Ordering::SeqCst)
    }

    /// Copy of every entry, ordered by id.
    pub fn entries(&self) -> Vec<Entry> {
        let state = self.state.read();
        let mut entries: Vec<Entry> = state.entries.values().cloned().collect();
        entries.sort_by(|a, b| a.id.cmp(&b.id));
        entries
    }

    /// Copy of every embedding, ordered by id.
    pub fn embeddings(&self) -> Vec<(String, Vec<f32>)> {
        let state = self.state.read();
        let mut embeddings: Vec<(String, Vec<f32>)> = state
            .embeddings
            .iter()
            .map(|(id, v)| (id.clone(), v.clone()))
            .collect();
        embeddings.sort_by(|a, b| a.0.cmp(&b.0));
        embeddings
    }

    fn mark_dirty(&self) {
        self.dirty.store(true, Ordering::SeqCst);
        self.wake.notify_one();
    }

    /// Serialize the current state and write both files.
    async fn write_snapshot(&self) -> Result<()> {
        let _guard = self.flush_lock.lock().await;
        if !self.dirty.swap(false, Ordering::SeqCst) {
            return Ok(());
        }

        // Serialize under the read lock, write with no lock held.
        let (entries_json, embeddings_json) = {
            let state = self.state.read();
            let mut entries: Vec<&Entry> = state.entries.values().collect();
            entries.sort_by(|a, b| a.id.cmp(&b.id));
            let embeddings: BTreeMap<&String, &Vec<f32>> = state.embeddings.iter().collect();
            (
                serde_json::to_vec(&entries),
                serde_json::to_vec(&embeddings),
            )
        };

        let result = async {
            write_atomic(&self.dir.join(ENTRIES_FILE), &entries_json?).await?;
            write_atomic(&self.dir.join(EMBEDDINGS_FILE), &embeddings_json?).await?;
            Ok::<(), anyhow::Error>(())
        }
        .await;

        if result.is_err() {
            // Next cycle retries with whatever state is current by then.
            self.dirty.store(true, Ordering::SeqCst);
        }
        result
    }

    async fn run_flusher(self: Arc<Self>, cancel: CancellationToken) {
        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = self.wake.notified() => {}
            }
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = tokio::time::sleep(self.debounce) => {}
            }
            if let Err(e) = self.write_snapshot().await {
                tracing::warn!(dir = %self.dir.display(), error = %e, "snapshot flush failed");
            }
        }
        if let Err(e) = self.write_snapshot().await {
            tracing::warn!(dir = %self.dir.display(), error = %e, "final snapshot flush failed");
        }
        tracing::debug!("snapshot flusher stopped");
    }
}

async fn write_atomic(path: &Path, bytes: &[u8]) -> Result<()> {
    let tmp = path.with_extension("json.tmp");
    tokio::fs::write(&tmp, bytes)
        .await
        .with_context(|| format!("Failed to write {}", tmp.display()))?;
    tokio::fs::rename(&tmp, path)
        .await
        .with_context(|| format!("Failed to replace {}", path.display()))?;
    Ok(())
}

/// Load whatever can be recovered from `dir`. The flag is true when the
/// on-disk layout should be rewritten (legacy inline embeddings, records
/// stamped at load time). With `quarantine`, corrupt files are moved aside.
fn load_state(dir: &Path, quarantine: bool) -> (State, bool) {
    let mut state = State::default();
    let mut needs_rewrite = false;

    let mut inline = Vec::new();
    if let Some(doc) = read_json(&dir.join(ENTRIES_FILE), quarantine) {
        for (key, record) in records(doc) {
            match parse_record(key, record) {
                Ok((entry, embedding, stamped)) => {
                    if stamped {
                        needs_rewrite = true;
                    }
                    if let Some(vector) = embedding {
                        inline.push((entry.id.clone(), vector));
                    }
                    state.entries.insert(entry.id.clone(), entry);
                }
                Err(e) => tracing::warn!(error = %e, "skipping unreadable snapshot entry"),
            }
        }
    }

    if let Some(Value::Object(map)) = read_json(&dir.join(EMBEDDINGS_FILE), quarantine) {
        for (id, value) in map {
            if !state.entries.contains_key(&id) {
                tracing::warn!(id = %id, "dropping embedding for unknown entry");
                needs_rewrite = true;
                continue;
            }
            match serde_json::from_value::<Vec<f32>>(value) {
                Ok(vector) => {
                    state.embeddings.insert(id, vector);
                }
                Err(e) => tracing::warn!(id = %id, error = %e, "skipping unreadable embedding"),
            }
        }
    }

    for (id, vector) in inline {
        needs_rewrite = true;
        state.embeddings.entry(id).or_insert(vector);
    }
    if needs_rewrite {
        tracing::info!("legacy snapshot layout detected, will rewrite as split files");
    }

    (state, needs_rewrite)
}

fn read_json(path: &Path, quarantine: bool) -> Option<Value> {
    let bytes = match std::fs::read(path) {
        Ok(bytes) => bytes,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return None,
        Err(e) => {
            tracing::error!(path = %path.display(), error = %e, "cannot read snapshot file");
            return None;
        }
    };
    match serde_json::from_slice(&bytes) {
        Ok(value) => Some(value),
        Err(e) if !quarantine => {
            tracing::error!(path = %path.display(), error = %e, "snapshot file is corrupt, skipping");
            None
        }
        Err(e) => {
            let backup = path.with_extension("json.bad");
            tracing::error!(
                path = %path.display(),
                backup = %backup.display(),
                error = %e,
                "snapshot file is corrupt, starting empty"
            );
            if let Err(e) = std::fs::rename(path, &backup) {
                tracing::warn!(error = %e, "could not move corrupt snapshot aside");
            }
            None
        }
    }
}

/// Flatten the two accepted `entries.json` shapes into `(key, record)` pairs.
fn records(doc: Value) -> Vec<(Option<String>, Value)> {
    match doc {
        Value::Array(items) => items.into_iter().map(|v| (None, v)).collect(),
        Value::Object(map) => map.into_iter().map(|(k, v)| (Some(k), v)).collect(),
        _ => {
            tracing::warn!("entries snapshot is neither an array nor an object");
            Vec::new()
        }
    }
}

/// Returns the entry, its inline embedding, and whether `indexed_at` was
/// missing and stamped with the load time.
fn parse_record(key: Option<String>, record: Value) -> Result<(Entry, Option<Vec<f32>>, bool)> {
    let Value::Object(mut obj) = record else {
        bail!("entry record is not an object");
    };
    let stamped = matches!(obj.get("indexed_at"), None | Some(Value::Null));
    if stamped {
        obj.remove("indexed_at");
    }
    let embedding = match obj.remove("embedding") {
        None | Some(Value::Null) => None,
        Some(v) => Some(serde_json::from_value::<Vec<f32>>(v)?),
    };
    if let Some(key) = key {
        obj.entry("id").or_insert(Value::String(key));
    }
    let entry: Entry = serde_json::from_value(Value::Object(obj))?;
    let embedding = embedding.filter(|v| !v.is_empty());
    Ok((entry, embedding, stamped))
}

#[async_trait]
impl EntryStore for SnapshotStore {
    fn backend_name(&self) -> &'static str {
        "snapshot"
    }

    fn spawn_background(self: Arc<Self>, cancel: CancellationToken) -> Option<JoinHandle<()>> {
        Some(tokio::spawn(self.run_flusher(cancel)))
    }

    async fn put(&self, entry: &Entry) -> Result<()> {
        {
            let mut state = self.state.write();
            state.embeddings.remove(&entry.id);
            state.entries.insert(entry.id.clone(), entry.clone());
        }
        self.mark_dirty();
        Ok(())
    }

    async fn update_metadata(&self, id: &str, metadata: &Metadata) -> Result<bool> {
        let updated = {
            let mut state = self.state.write();
            match state.entries.get_mut(id) {
                Some(entry) => {
                    entry.metadata = metadata.clone();
                    true
                }
                None => false,
            }
        };
        if updated {
            self.mark_dirty();
        }
        Ok(updated)
    }

    async fn get(&self, id: &str) -> Result<Option<Entry>> {
        Ok(self.state.read().entries.get(id).cloned())
    }

    async fn get_by_type(&self, kind: &str, limit: usize) -> Result<Vec<Entry>> {
        let state = self.state.read();
        let mut entries: Vec<&Entry> = state.entries.values().filter(|e| e.kind == kind).collect();
        entries.sort_by(|a, b| b.indexed_at.cmp(&a.indexed_at).then(a.id.cmp(&b.id)));
        Ok(entries.into_iter().take(limit).cloned().collect())
    }

    async fn put_embedding(&self, id: &str, vector: &[f32]) -> Result<()> {
        {
            let mut state = self.state.write();
            if !state.entries.contains_key(id) {
                bail!("no entry with id '{}'", id);
            }
            state.embeddings.insert(id.to_string(), vector.to_vec());
        }
        self.mark_dirty();
        Ok(())
    }

    async fn put_embedding_if(
        &self,
        id: &str,
        title: &str,
        content: &str,
        vector: &[f32],
    ) -> Result<bool> {
        {
            let mut state = self.state.write();
            let current = state.entries.get(id).is_some_and(|e| e.same_content(title, content));
            if !current {
                return Ok(false);
            }
            state.embeddings.insert(id.to_string(), vector.to_vec());
        }
        self.mark_dirty();
        Ok(true)
    }

    async fn get_embedding(&self, id: &str) -> Result<Option<Vec<f32>>> {
        Ok(self.state.read().embeddings.get(id).cloned())
    }

    async fn has_embedding(&self, id: &str) -> Result<bool> {
        Ok(self.state.read().embeddings.contains_key(id))
    }

    async fn embedding_count(&self) -> Result<usize> {
        Ok(self.state.read().embeddings.len())
    }

    async fn entry_count(&self) -> Result<usize> {
        Ok(self.state.read().entries.len())
    }

    async fn missing_embeddings(&self, limit: usize) -> Result<Vec<String>> {
        let state = self.state.read();
        let mut missing: Vec<&Entry> = state
            .entries
            .values()
            .filter(|e| !state.embeddings.contains_key(&e.id))
            .collect();
        missing.sort_by(|a, b| b.indexed_at.cmp(&a.indexed_at).then(a.id.cmp(&b.id)));
        Ok(missing.into_iter().take(limit).map(|e| e.id.clone()).collect())
    }

    async fn keyword_candidates(&self, terms: &[String], kind: Option<&str>) -> Result<Vec<Entry>> {
        if terms.is_empty() {
            return Ok(Vec::new());
        }
        let state = self.state.read();
        Ok(state
            .entries
            .values()
            .filter(|e| kind.map_or(true, |k| e.kind == k))
            .filter(|e| {
                contains_any(&e.title.to_lowercase(), terms)
                    || contains_any(&e.content.to_lowercase(), terms)
            })
            .cloned()
            .collect())
    }

    async fn vector_search(&self, query: &[f32], kind: Option<&str>) -> Result<Vec<VectorCandidate>> {
        let state = self.state.read();
        Ok(state
            .embeddings
            .iter()
            .filter_map(|(id, vector)| {
                let entry = state.entries.get(id)?;
                if kind.is_some_and(|k| entry.kind != k) {
                    return None;
                }
                Some(VectorCandidate {
                    entry: entry.clone(),
                    similarity: cosine_similarity(query, vector),
                })
            })
            .collect())
    }

    async fn clear(&self) -> Result<()> {
        {
            let mut state = self.state.write();
            state.entries.clear();
            state.embeddings.clear();
        }
        self.mark_dirty();
        Ok(())
    }

    async fn flush(&self) -> Result<()> {
        self.write_snapshot().await
    }
}
