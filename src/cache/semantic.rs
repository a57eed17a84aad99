//! Similarity-matched query cache.

use lru::LruCache;
use std::collections::HashSet;
use std::num::NonZeroUsize;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use crate::types::ChatResponse;

/// Compares two query texts, returning similarity in `[0, 1]`.
///
/// The default [`KeywordComparator`] is dependency-free; deployments with
/// an embedding service can implement this trait over precomputed vectors.
pub trait QueryComparator: Send + Sync {
    fn similarity(&self, a: &str, b: &str) -> f64;
}

/// Jaccard similarity over lowercase alphanumeric word sets.
#[derive(Debug, Clone, Default)]
pub struct KeywordComparator;

impl KeywordComparator {
    pub fn new() -> Self {
        Self
    }

    fn terms(text: &str) -> HashSet<String> {
        text.split(|c: char| !c.is_alphanumeric())
            .filter(|w| !w.is_empty())
            .map(|w| w.to_lowercase())
            .collect()
    }
}

impl QueryComparator for KeywordComparator {
    fn similarity(&self, a: &str, b: &str) -> f64 {
        let sa = Self::terms(a);
        let sb = Self::terms(b);
        if sa.is_empty() && sb.is_empty() {
            return 1.0;
        }
        if sa.is_empty() || sb.is_empty() {
            return 0.0;
        }
        let intersection = sa.intersection(&sb).count() as f64;
        let union = sa.union(&sb).count() as f64;
        intersection / union
    }
}

struct SemanticEntry {
    query: String,
    response: ChatResponse,
    inserted_at: Instant,
}

/// Bounded, TTL-aware cache matched by query-text similarity.
///
/// Entries are indexed in an LRU so the linear similarity scan stays
/// bounded by the configured capacity.
pub struct SemanticCache {
    entries: Mutex<LruCache<String, SemanticEntry>>,
    comparator: Arc<dyn QueryComparator>,
    threshold: f64,
    ttl: Duration,
}

impl SemanticCache {
    pub fn new(capacity: usize, threshold: f64, ttl: Duration) -> Self {
        Self::with_comparator(capacity, threshold, ttl, Arc::new(KeywordComparator::new()))
    }

    pub fn with_comparator(
        capacity: usize,
        threshold: f64,
        ttl: Duration,
        comparator: Arc<dyn QueryComparator>,
    ) -> Self {
        let capacity = NonZeroUsize::new(capacity.max(1)).unwrap();
        Self {
            entries: Mutex::new(LruCache::new(capacity)),
            comparator,
            threshold,
            ttl,
        }
    }

    /// Best match at or above the threshold, if any.
    pub fn lookup(&self, query: &str) -> Option<ChatResponse> {
        let mut entries = self.entries.lock().unwrap();
        let mut best: Option<(String, f64)> = None;
        for (key, entry) in entries.iter() {
            if entry.inserted_at.elapsed() > self.ttl {
                continue;
            }
            let score = self.comparator.similarity(query, &entry.query);
            if score >= self.threshold && best.as_ref().map(|(_, s)| score > *s).unwrap_or(true) {
                best = Some((key.clone(), score));
            }
        }
        let (key, _) = best?;
        // Touch the winner so frequently matched queries stay resident.
        entries.get(&key).map(|e| e.response.clone())
    }

    pub fn insert(&self, query: impl Into<String>, response: ChatResponse) {
        let query = query.into();
        let mut entries = self.entries.lock().unwrap();
        entries.put(
            query.clone(),
            SemanticEntry {
                query,
                response,
                inserted_at: Instant::now(),
            },
        );
    }

    pub fn clear(&self) {
        self.entries.lock().unwrap().clear();
    }

    pub fn len(&self) -> usize {
        self.entries.lock().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
