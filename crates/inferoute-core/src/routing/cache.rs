//! Semantic response cache
//!
//! Bounded store of previously served responses, matched by cosine
//! similarity of prompt embeddings.
//!
//! ## Matching
//!
//! A stored entry answers a lookup when its similarity to the query is at
//! least the configured threshold, its task category equals the current
//! one, and its token estimate fits within the current token budget. Among
//! several matches the most similar wins, then the most recently used.
//!
//! ## Eviction
//!
//! Least recently used. Every insert and every hit stamps the entry with a
//! logical clock tick; when an insert pushes the cache past capacity the
//! entry with the oldest tick is removed. Ticks are unique, so eviction is
//! fully deterministic.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::debug;

use super::embedding::{Embedder, cosine_similarity};
use super::types::RequestAnalysis;

/// Default capacity
pub const DEFAULT_CAPACITY: usize = 1000;

/// Default similarity threshold
pub const DEFAULT_SIMILARITY_THRESHOLD: f32 = 0.8;

/// Cache configuration
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct SemanticCacheConfig {
    pub capacity: usize,
    pub similarity_threshold: f32,
}

impl Default for SemanticCacheConfig {
    fn default() -> Self {
        Self {
            capacity: DEFAULT_CAPACITY,
            similarity_threshold: DEFAULT_SIMILARITY_THRESHOLD,
        }
    }
}

/// The payload stored for a served response
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CachedResponse {
    /// Response id of the original, uncached answer
    pub response_id: String,
    pub content: String,
    pub backend_id: String,
}

/// One cached request/response pair
#[derive(Debug, Clone)]
pub struct CacheEntry {
    pub prompt: String,
    pub response: CachedResponse,
    pub analysis: RequestAnalysis,
    pub vector: Vec<f32>,
    pub created_at: DateTime<Utc>,
    pub usage_count: u64,
    last_used: u64,
    inserted: u64,
}

/// Serializable form of a cache entry; the vector is recomputed on restore
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CacheRecord {
    pub prompt: String,
    pub response: CachedResponse,
    pub analysis: RequestAnalysis,
    pub created_at: DateTime<Utc>,
    #[serde(default)]
    pub usage_count: u64,
}

impl From<&CacheEntry> for CacheRecord {
    fn from(entry: &CacheEntry) -> Self {
        Self {
            prompt: entry.prompt.clone(),
            response: entry.response.clone(),
            analysis: entry.analysis.clone(),
            created_at: entry.created_at,
            usage_count: entry.usage_count,
        }
    }
}

/// A successful lookup
#[derive(Debug, Clone)]
pub struct CacheHit {
    pub entry: CacheEntry,
    pub similarity: f32,
}

/// Counters describing cache effectiveness
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct CacheStats {
    pub entries: usize,
    pub hits: u64,
    pub misses: u64,
    pub evictions: u64,
}

impl CacheStats {
    /// Fraction of lookups that hit
    pub fn hit_rate(&self) -> f64 {
        let total = self.hits + self.misses;
        if total == 0 {
            return 0.0;
        }
        self.hits as f64 / total as f64
    }
}

#[derive(Debug, Default)]
struct CacheInner {
    entries: Vec<CacheEntry>,
    clock: u64,
}

impl CacheInner {
    fn tick(&mut self) -> u64 {
        self.clock += 1;
        self.clock
    }
}

/// Approximate-match response cache
#[derive(Debug)]
pub struct SemanticCache {
    config: SemanticCacheConfig,
    embedder: Arc<dyn Embedder>,
    inner: Mutex<CacheInner>,
    hits: AtomicU64,
    misses: AtomicU64,
    evictions: AtomicU64,
}

impl SemanticCache {
    /// Create an empty cache
    pub fn new(config: SemanticCacheConfig, embedder: Arc<dyn Embedder>) -> Self {
        Self {
            config,
            embedder,
            inner: Mutex::new(CacheInner::default()),
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
            evictions: AtomicU64::new(0),
        }
    }

    /// Cache configuration
    pub fn config(&self) -> &SemanticCacheConfig {
        &self.config
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, CacheInner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Find a previously served response equivalent to this request
    pub fn lookup(&self, prompt: &str, analysis: &RequestAnalysis) -> Option<CacheHit> {
        let query = self.embedder.embed(prompt);
        let threshold = self.config.similarity_threshold;

        let mut inner = self.lock();

        let best = inner
            .entries
            .iter()
            .enumerate()
            .filter(|(_, e)| is_compatible(&e.analysis, analysis))
            .map(|(i, e)| (i, cosine_similarity(&query, &e.vector), e.last_used))
            .filter(|(_, similarity, _)| *similarity >= threshold)
            .max_by(|a, b| a.1.total_cmp(&b.1).then(a.2.cmp(&b.2)));

        let Some((index, similarity, _)) = best else {
            self.misses.fetch_add(1, Ordering::Relaxed);
            return None;
        };

        let tick = inner.tick();
        let entry = &mut inner.entries[index];
        entry.usage_count += 1;
        entry.last_used = tick;
        self.hits.fetch_add(1, Ordering::Relaxed);

        debug!(similarity, usage_count = entry.usage_count, "Semantic cache hit");

        Some(CacheHit {
            entry: entry.clone(),
            similarity,
        })
    }

    /// Store a served response; replaces an entry with the identical prompt
    pub fn insert(&self, prompt: &str, response: CachedResponse, analysis: RequestAnalysis) {
        let vector = self.embedder.embed(prompt);
        self.insert_entry(prompt.to_string(), response, analysis, vector, Utc::now(), 0);
    }

    fn insert_entry(
        &self,
        prompt: String,
        response: CachedResponse,
        analysis: RequestAnalysis,
        vector: Vec<f32>,
        created_at: DateTime<Utc>,
        usage_count: u64,
    ) {
        let mut inner = self.lock();
        let tick = inner.tick();

        if let Some(existing) = inner.entries.iter_mut().find(|e| e.prompt == prompt) {
            existing.response = response;
            existing.analysis = analysis;
            existing.vector = vector;
            existing.created_at = created_at;
            existing.last_used = tick;
            existing.inserted = tick;
            return;
        }

        inner.entries.push(CacheEntry {
            prompt,
            response,
            analysis,
            vector,
            created_at,
            usage_count,
            last_used: tick,
            inserted: tick,
        });

        while inner.entries.len() > self.config.capacity.max(1) {
            let coldest = inner
                .entries
                .iter()
                .enumerate()
                .min_by_key(|(_, e)| e.last_used)
                .map(|(i, _)| i);
            if let Some(index) = coldest {
                let evicted = inner.entries.remove(index);
                self.evictions.fetch_add(1, Ordering::Relaxed);
                debug!(prompt_len = evicted.prompt.len(), "Evicted cache entry");
            }
        }
    }

    /// The `n` most recently inserted entries, newest first
    pub fn newest(&self, n: usize) -> Vec<CacheRecord> {
        let inner = self.lock();
        let mut entries: Vec<&CacheEntry> = inner.entries.iter().collect();
        entries.sort_by(|a, b| b.inserted.cmp(&a.inserted));
        entries.into_iter().take(n).map(CacheRecord::from).collect()
    }

    /// Replace the contents with restored records (oldest first wins the oldest tick)
    pub fn restore(&self, mut records: Vec<CacheRecord>) {
        records.sort_by(|a, b| a.created_at.cmp(&b.created_at));
        self.clear();
        for record in records {
            let vector = self.embedder.embed(&record.prompt);
            self.insert_entry(
                record.prompt,
                record.response,
                record.analysis,
                vector,
                record.created_at,
                record.usage_count,
            );
        }
    }

    /// Remove every entry
    pub fn clear(&self) {
        let mut inner = self.lock();
        inner.entries.clear();
    }

    /// Number of entries
    pub fn len(&self) -> usize {
        self.lock().entries.len()
    }

    /// Whether the cache is empty
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Whether an entry with exactly this prompt is stored
    pub fn contains_prompt(&self, prompt: &str) -> bool {
        self.lock().entries.iter().any(|e| e.prompt == prompt)
    }

    /// Current counters
    pub fn stats(&self) -> CacheStats {
        CacheStats {
            entries: self.len(),
            hits: self.hits.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
            evictions: self.evictions.load(Ordering::Relaxed),
        }
    }
}

/// Same category, and the cached request fits the current token budget
fn is_compatible(cached: &RequestAnalysis, current: &RequestAnalysis) -> bool {
    cached.category == current.category && cached.estimated_tokens <= current.token_budget
}
