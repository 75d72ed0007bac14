//! Hybrid retrieval: keyword scoring merged with vector similarity.
//!
//! # Algorithm
//!
//! 1. Split the query into lowercase terms.
//! 2. If the store holds no embeddings, or the query cannot be embedded
//!    (cache miss and provider failure), run the keyword pass alone.
//! 3. **Vector pass**: cosine similarity against every stored vector,
//!    keeping similarity strictly above `similarity_threshold`, scaled by
//!    `vector_weight`.
//! 4. **Keyword pass**: per term, a title hit and a content hit each score;
//!    a word-boundary hit beats a bare substring hit in the same field.
//!    Per-term scores are summed.
//! 5. **Merge** by id with `max(keyword, semantic)`, so a pure semantic
//!    hit is kept and a strong keyword hit can outrank it.
//! 6. **Rank**: score desc, effective timestamp desc, id asc. Truncate.
//!
//! With the default weights (title word 10, title substring 4, content
//! word 2, content substring 1, vector weight 1.0) a title hit always
//! outranks a content-only hit: similarity never exceeds 1.0.

use std::cmp::Ordering;
use std::collections::HashMap;
use std::sync::Arc;

use tracing::{debug, warn};

use crate::config::RetrievalConfig;
use crate::embedding::{EmbeddingProvider, QueryEmbeddingCache};
use crate::error::IndexError;
use crate::models::{Entry, SearchHit};
use crate::store::EntryStore;

/// Scoring constants, taken from `[retrieval]`.
#[derive(Debug, Clone)]
pub struct SearchParams {
    pub similarity_threshold: f64,
    pub vector_weight: f64,
    pub title_word_weight: f64,
    pub title_substring_weight: f64,
    pub content_word_weight: f64,
    pub content_substring_weight: f64,
}

impl From<&RetrievalConfig> for SearchParams {
    fn from(config: &RetrievalConfig) -> Self {
        Self {
            similarity_threshold: config.similarity_threshold,
            vector_weight: config.vector_weight,
            title_word_weight: config.title_word_weight,
            title_substring_weight: config.title_substring_weight,
            content_word_weight: config.content_word_weight,
            content_substring_weight: config.content_substring_weight,
        }
    }
}

impl Default for SearchParams {
    fn default() -> Self {
        Self::from(&RetrievalConfig::default())
    }
}

/// Lowercase, deduplicated query terms with surrounding punctuation removed.
pub fn query_terms(query: &str) -> Vec<String> {
    let mut terms: Vec<String> = Vec::new();
    for raw in query.split_whitespace() {
        let term = raw
            .trim_matches(|c: char| !c.is_alphanumeric())
            .to_lowercase();
        if !term.is_empty() && !terms.contains(&term) {
            terms.push(term);
        }
    }
    terms
}

/// True if `term` occurs in `haystack` with no alphanumeric character
/// directly before or after it.
fn contains_word(haystack: &str, term: &str) -> bool {
    haystack.match_indices(term).any(|(start, matched)| {
        let before = haystack[..start].chars().next_back();
        let after = haystack[start + matched.len()..].chars().next();
        !before.is_some_and(char::is_alphanumeric) && !after.is_some_and(char::is_alphanumeric)
    })
}

fn field_score(field_lower: &str, term: &str, word: f64, substring: f64) -> f64 {
    if !field_lower.contains(term) {
        0.0
    } else if contains_word(field_lower, term) {
        word
    } else {
        substring
    }
}

/// Keyword relevance of `entry` for lowercase `terms`. Zero means no match.
pub fn keyword_score(entry: &Entry, terms: &[String], params: &SearchParams) -> f64 {
    let title = entry.title.to_lowercase();
    let content = entry.content.to_lowercase();
    terms
        .iter()
        .map(|term| {
            field_score(&title, term, params.title_word_weight, params.title_substring_weight)
                + field_score(
                    &content,
                    term,
                    params.content_word_weight,
                    params.content_substring_weight,
                )
        })
        .sum()
}

/// Sort hits best-first and keep the top `limit`.
fn rank(mut hits: Vec<SearchHit>, limit: usize) -> Vec<SearchHit> {
    hits.sort_by(|a, b| {
        b.score
            .partial_cmp(&a.score)
            .unwrap_or(Ordering::Equal)
            .then_with(|| {
                b.entry
                    .effective_timestamp()
                    .cmp(&a.entry.effective_timestamp())
            })
            .then_with(|| a.entry.id.cmp(&b.entry.id))
    });
    hits.truncate(limit);
    hits
}

/// The read path. Owns the query-embedding cache.
pub struct HybridSearch {
    store: Arc<dyn EntryStore>,
    provider: Arc<dyn EmbeddingProvider>,
    cache: QueryEmbeddingCache,
    params: SearchParams,
}

impl HybridSearch {
    pub fn new(
        store: Arc<dyn EntryStore>,
        provider: Arc<dyn EmbeddingProvider>,
        cache: QueryEmbeddingCache,
        params: SearchParams,
    ) -> Self {
        Self {
            store,
            provider,
            cache,
            params,
        }
    }

    pub fn cache(&self) -> &QueryEmbeddingCache {
        &self.cache
    }

    /// Ranked hybrid search. Store and provider failures degrade the
    /// result; only an invalid `limit` is an error.
    pub async fn search(
        &self,
        query: &str,
        limit: usize,
        kind: Option<&str>,
    ) -> Result<Vec<SearchHit>, IndexError> {
        if limit == 0 {
            return Err(IndexError::InvalidLimit);
        }
        let query = query.trim();
        if query.is_empty() {
            return Ok(Vec::new());
        }
        let terms = query_terms(query);

        let embedded = match self.store.embedding_count().await {
            Ok(n) => n,
            Err(e) => {
                warn!(error = %e, "embedding count failed; keyword-only search");
                0
            }
        };
        if embedded == 0 {
            return Ok(rank(self.keyword_hits(&terms, kind).await, limit));
        }
        let Some(query_vector) = self.query_embedding(query).await else {
            return Ok(rank(self.keyword_hits(&terms, kind).await, limit));
        };

        let mut merged: HashMap<String, SearchHit> = HashMap::new();
        match self.store.vector_search(&query_vector, kind).await {
            Ok(candidates) => {
                for candidate in candidates {
                    let similarity = candidate.similarity as f64;
                    if similarity <= self.params.similarity_threshold {
                        continue;
                    }
                    let semantic = similarity * self.params.vector_weight;
                    merged.insert(
                        candidate.entry.id.clone(),
                        SearchHit {
                            entry: candidate.entry,
                            score: semantic,
                            keyword_score: 0.0,
                            semantic_score: semantic,
                        },
                    );
                }
            }
            Err(e) => warn!(error = %e, "vector search failed; keyword-only search"),
        }

        for hit in self.keyword_hits(&terms, kind).await {
            match merged.get_mut(&hit.entry.id) {
                Some(existing) => {
                    existing.keyword_score = hit.keyword_score;
                    existing.score = existing.semantic_score.max(hit.keyword_score);
                }
                None => {
                    merged.insert(hit.entry.id.clone(), hit);
                }
            }
        }

        Ok(rank(merged.into_values().collect(), limit))
    }

    /// The keyword-only ranking, with the same ordering rules as
    /// [`search`](Self::search).
    pub async fn keyword_search(
        &self,
        query: &str,
        limit: usize,
        kind: Option<&str>,
    ) -> Result<Vec<SearchHit>, IndexError> {
        if limit == 0 {
            return Err(IndexError::InvalidLimit);
        }
        let terms = query_terms(query);
        Ok(rank(self.keyword_hits(&terms, kind).await, limit))
    }

    async fn keyword_hits(&self, terms: &[String], kind: Option<&str>) -> Vec<SearchHit> {
        if terms.is_empty() {
            return Vec::new();
        }
        let candidates = match self.store.keyword_candidates(terms, kind).await {
            Ok(c) => c,
            Err(e) => {
                warn!(error = %e, "keyword candidate scan failed");
                return Vec::new();
            }
        };
        candidates
            .into_iter()
            .filter_map(|entry| {
                let score = keyword_score(&entry, terms, &self.params);
                (score > 0.0).then_some(SearchHit {
                    entry,
                    score,
                    keyword_score: score,
                    semantic_score: 0.0,
                })
            })
            .collect()
    }

    async fn query_embedding(&self, query: &str) -> Option<Vec<f32>> {
        if let Some(v) = self.cache.get(query) {
            return Some(v);
        }
        match self.provider.embed(query).await {
            Ok(v) if !v.is_empty() => {
                self.cache.insert(query, v.clone());
                Some(v)
            }
            Ok(_) => None,
            Err(e) => {
                debug!(error = %e, "query embedding unavailable; keyword-only search");
                None
            }
        }
    }
}
