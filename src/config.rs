use anyhow::{Context, Result};
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;

#[derive(Debug, Deserialize, Clone, Default)]
pub struct Config {
    #[serde(default)]
    pub store: StoreConfig,
    #[serde(default)]
    pub ingest: IngestConfig,
    #[serde(default)]
    pub embedding: EmbeddingConfig,
    #[serde(default)]
    pub retrieval: RetrievalConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

#[derive(Debug, Deserialize, Clone)]
pub struct StoreConfig {
    #[serde(default = "default_backend")]
    pub backend: String,
    #[serde(default = "default_snapshot_dir")]
    pub snapshot_dir: PathBuf,
    #[serde(default = "default_db_path")]
    pub db_path: PathBuf,
    #[serde(default = "default_flush_debounce_ms")]
    pub flush_debounce_ms: u64,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            backend: default_backend(),
            snapshot_dir: default_snapshot_dir(),
            db_path: default_db_path(),
            flush_debounce_ms: default_flush_debounce_ms(),
        }
    }
}

impl StoreConfig {
    pub fn flush_debounce(&self) -> Duration {
        Duration::from_millis(self.flush_debounce_ms)
    }
}

fn default_backend() -> String {
    "snapshot".to_string()
}
fn default_snapshot_dir() -> PathBuf {
    PathBuf::from("./data/index")
}
fn default_db_path() -> PathBuf {
    PathBuf::from("./data/index.sqlite")
}
fn default_flush_debounce_ms() -> u64 {
    1000
}

#[derive(Debug, Deserialize, Clone)]
pub struct IngestConfig {
    #[serde(default = "default_ingest_queue")]
    pub queue_capacity: usize,
    #[serde(default = "default_workers")]
    pub workers: usize,
}

impl Default for IngestConfig {
    fn default() -> Self {
        Self {
            queue_capacity: default_ingest_queue(),
            workers: default_workers(),
        }
    }
}

fn default_ingest_queue() -> usize {
    500
}
fn default_workers() -> usize {
    4
}

#[derive(Debug, Deserialize, Clone)]
pub struct EmbeddingConfig {
    #[serde(default = "default_provider")]
    pub provider: String,
    #[serde(default)]
    pub model: Option<String>,
    /// Base URL for the provider (Ollama only).
    #[serde(default)]
    pub url: Option<String>,
    /// Expected vector length. Vectors of any other length are rejected
    /// as provider failures.
    #[serde(default)]
    pub dims: Option<usize>,
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
    #[serde(default = "default_embed_queue")]
    pub queue_capacity: usize,
    /// Minimum spacing between successive provider calls.
    #[serde(default = "default_min_interval_ms")]
    pub min_interval_ms: u64,
    /// Pause after a failed provider call.
    #[serde(default = "default_failure_backoff_ms")]
    pub failure_backoff_ms: u64,
    /// Global cap on embedded entries; beyond it entries stay keyword-only.
    #[serde(default = "default_max_embedded")]
    pub max_embedded: usize,
    #[serde(default = "default_content_prefix_chars")]
    pub content_prefix_chars: usize,
    /// Query-embedding LRU capacity. 0 disables the cache.
    #[serde(default = "default_query_cache_size")]
    pub query_cache_size: usize,
}

impl Default for EmbeddingConfig {
    fn default() -> Self {
        Self {
            provider: default_provider(),
            model: None,
            url: None,
            dims: None,
            timeout_secs: default_timeout_secs(),
            queue_capacity: default_embed_queue(),
            min_interval_ms: default_min_interval_ms(),
            failure_backoff_ms: default_failure_backoff_ms(),
            max_embedded: default_max_embedded(),
            content_prefix_chars: default_content_prefix_chars(),
            query_cache_size: default_query_cache_size(),
        }
    }
}

fn default_provider() -> String {
    "disabled".to_string()
}
fn default_timeout_secs() -> u64 {
    30
}
fn default_embed_queue() -> usize {
    1000
}
fn default_min_interval_ms() -> u64 {
    200
}
fn default_failure_backoff_ms() -> u64 {
    1000
}
fn default_max_embedded() -> usize {
    10_000
}
fn default_content_prefix_chars() -> usize {
    500
}
fn default_query_cache_size() -> usize {
    100
}

impl EmbeddingConfig {
    pub fn is_enabled(&self) -> bool {
        self.provider != "disabled"
    }
}

/// Ranking constants. The weights are empirical and exposed as tunables.
#[derive(Debug, Deserialize, Clone)]
pub struct RetrievalConfig {
    #[serde(default = "default_similarity_threshold")]
    pub similarity_threshold: f64,
    /// Multiplier applied to cosine similarity before the max-merge.
    #[serde(default = "default_vector_weight")]
    pub vector_weight: f64,
    #[serde(default = "default_title_word_weight")]
    pub title_word_weight: f64,
    #[serde(default = "default_title_substring_weight")]
    pub title_substring_weight: f64,
    #[serde(default = "default_content_word_weight")]
    pub content_word_weight: f64,
    #[serde(default = "default_content_substring_weight")]
    pub content_substring_weight: f64,
    /// Rows considered by the SQLite title pass.
    #[serde(default = "default_title_pass_limit")]
    pub title_pass_limit: usize,
    /// Most recent rows considered by the SQLite content pass.
    #[serde(default = "default_content_pass_limit")]
    pub content_pass_limit: usize,
    #[serde(default = "default_limit")]
    pub default_limit: usize,
}

impl Default for RetrievalConfig {
    fn default() -> Self {
        Self {
            similarity_threshold: default_similarity_threshold(),
            vector_weight: default_vector_weight(),
            title_word_weight: default_title_word_weight(),
            title_substring_weight: default_title_substring_weight(),
            content_word_weight: default_content_word_weight(),
            content_substring_weight: default_content_substring_weight(),
            title_pass_limit: default_title_pass_limit(),
            content_pass_limit: default_content_pass_limit(),
            default_limit: default_limit(),
        }
    }
}

fn default_similarity_threshold() -> f64 {
    0.3
}
fn default_vector_weight() -> f64 {
    1.0
}
fn default_title_word_weight() -> f64 {
    10.0
}
fn default_title_substring_weight() -> f64 {
    4.0
}
fn default_content_word_weight() -> f64 {
    2.0
}
fn default_content_substring_weight() -> f64 {
    1.0
}
fn default_title_pass_limit() -> usize {
    50
}
fn default_content_pass_limit() -> usize {
    200
}
fn default_limit() -> usize {
    10
}

#[derive(Debug, Deserialize, Clone)]
pub struct LoggingConfig {
    #[serde(default = "default_log_filter")]
    pub filter: String,
    /// `text` or `json`.
    #[serde(default = "default_log_format")]
    pub format: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            filter: default_log_filter(),
            format: default_log_format(),
        }
    }
}

fn default_log_filter() -> String {
    "site_index=info".to_string()
}
fn default_log_format() -> String {
    "text".to_string()
}

pub fn load_config(path: &Path) -> Result<Config> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read config file: {}", path.display()))?;

    let config: Config = toml::from_str(&content).with_context(|| "Failed to parse config file")?;
    validate(&config)?;
    Ok(config)
}

/// Check invariants the pipelines and ranking rely on.
pub fn validate(config: &Config) -> Result<()> {
    match config.store.backend.as_str() {
        "snapshot" | "sqlite" => {}
        other => anyhow::bail!(
            "Unknown store backend: '{}'. Must be snapshot or sqlite.",
            other
        ),
    }

    if config.ingest.workers == 0 {
        anyhow::bail!("ingest.workers must be >= 1");
    }
    if config.ingest.queue_capacity == 0 {
        anyhow::bail!("ingest.queue_capacity must be >= 1");
    }
    if config.embedding.queue_capacity == 0 {
        anyhow::bail!("embedding.queue_capacity must be >= 1");
    }
    if config.embedding.dims == Some(0) {
        anyhow::bail!("embedding.dims must be >= 1 when set");
    }

    let r = &config.retrieval;
    if !(-1.0..=1.0).contains(&r.similarity_threshold) {
        anyhow::bail!("retrieval.similarity_threshold must be in [-1.0, 1.0]");
    }
    let weights = [
        r.vector_weight,
        r.title_word_weight,
        r.title_substring_weight,
        r.content_word_weight,
        r.content_substring_weight,
    ];
    if weights.iter().any(|w| *w < 0.0) {
        anyhow::bail!("retrieval weights must be >= 0");
    }
    // A title hit of either kind must outrank any single-term content or vector hit.
    let min_title = r.title_word_weight.min(r.title_substring_weight);
    let max_other = r
        .content_word_weight
        .max(r.content_substring_weight)
        .max(r.vector_weight);
    if min_title <= max_other {
        anyhow::bail!(
            "retrieval title weights must exceed the content weights and vector_weight"
        );
    }
    if r.default_limit == 0 {
        anyhow::bail!("retrieval.default_limit must be >= 1");
    }

    match config.embedding.provider.as_str() {
        "disabled" | "ollama" | "openai" => {}
        other => anyhow::bail!(
            "Unknown embedding provider: '{}'. Must be disabled, ollama, or openai.",
            other
        ),
    }
    if config.embedding.is_enabled() && config.embedding.model.is_none() {
        anyhow::bail!(
            "embedding.model must be specified when provider is '{}'",
            config.embedding.provider
        );
    }

    match config.logging.format.as_str() {
        "text" | "json" => {}
        other => anyhow::bail!("Unknown logging.format: '{}'. Must be text or json.", other),
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_empty_config_uses_defaults() {
        let config: Config = toml::from_str("").unwrap();
        validate(&config).unwrap();
        assert_eq!(config.store.backend, "snapshot");
        assert_eq!(config.ingest.workers, 4);
        assert_eq!(config.ingest.queue_capacity, 500);
        assert_eq!(config.embedding.max_embedded, 10_000);
        assert_eq!(config.embedding.min_interval_ms, 200);
        assert!((config.retrieval.similarity_threshold - 0.3).abs() < 1e-9);
        assert!(!config.embedding.is_enabled());
    }

    #[test]
    fn test_partial_section_keeps_other_defaults() {
        let config: Config = toml::from_str(
            r#"
            [retrieval]
            similarity_threshold = 0.5

            [store]
            backend = "sqlite"
            "#,
        )
        .unwrap();
        validate(&config).unwrap();
        assert!((config.retrieval.similarity_threshold - 0.5).abs() < 1e-9);
        assert!((config.retrieval.title_word_weight - 10.0).abs() < 1e-9);
        assert_eq!(config.store.backend, "sqlite");
        assert_eq!(config.store.flush_debounce_ms, 1000);
    }

    #[test]
    fn test_rejects_unknown_backend() {
        let config: Config = toml::from_str("[store]\nbackend = \"redis\"").unwrap();
        assert!(validate(&config).is_err());
    }

    #[test]
    fn test_rejects_zero_workers() {
        let config: Config = toml::from_str("[ingest]\nworkers = 0").unwrap();
        assert!(validate(&config).is_err());
    }

    #[test]
    fn test_rejects_inverted_weights() {
        let config: Config =
            toml::from_str("[retrieval]\ntitle_word_weight = 1.0\ncontent_word_weight = 2.0")
                .unwrap();
        assert!(validate(&config).is_err());
    }

    #[test]
    fn test_rejects_vector_weight_above_title() {
        let config: Config = toml::from_str("[retrieval]\nvector_weight = 5.0").unwrap();
        assert!(validate(&config).is_err());
    }

    #[test]
    fn test_rejects_zero_dims() {
        let config: Config = toml::from_str("[embedding]\ndims = 0").unwrap();
        assert!(validate(&config).is_err());
        let config: Config = toml::from_str("[embedding]\ndims = 768").unwrap();
        assert_eq!(config.embedding.dims, Some(768));
        validate(&config).unwrap();
    }

    #[test]
    fn test_enabled_provider_requires_model() {
        let config: Config = toml::from_str("[embedding]\nprovider = \"ollama\"").unwrap();
        assert!(validate(&config).is_err());

        let config: Config =
            toml::from_str("[embedding]\nprovider = \"ollama\"\nmodel = \"nomic-embed-text\"")
                .unwrap();
        validate(&config).unwrap();
    }

    #[test]
    fn test_load_config_reads_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("sidx.toml");
        std::fs::write(&path, "[ingest]\nworkers = 2\n").unwrap();
        let config = load_config(&path).unwrap();
        assert_eq!(config.ingest.workers, 2);
    }
}
