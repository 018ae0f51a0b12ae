//! TTL + LRU cache of completed search outcomes.
//!
//! Keyed by a request fingerprint. Entries older than the TTL are never
//! returned. A poisoned lock is treated as a miss, so cache trouble only
//! ever costs a recomputation.

use serde::Serialize;
use sha2::{Digest, Sha256};
use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use crate::models::{SearchMode, SearchOutcome};

struct CacheEntry {
    outcome: Arc<SearchOutcome>,
    inserted: Instant,
    tick: u64,
}

#[derive(Default)]
struct CacheState {
    entries: HashMap<String, CacheEntry>,
    /// Recency tick to key; the first entry is the least recently used.
    recency: BTreeMap<u64, String>,
    tick: u64,
}

impl CacheState {
    fn next_tick(&mut self) -> u64 {
        self.tick += 1;
        self.tick
    }

    fn remove(&mut self, key: &str) {
        if let Some(entry) = self.entries.remove(key) {
            self.recency.remove(&entry.tick);
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize)]
pub struct CacheStats {
    pub entries: usize,
    pub capacity: usize,
    pub hits: u64,
    pub misses: u64,
}

pub struct QueryCache {
    ttl: Duration,
    capacity: usize,
    state: Mutex<CacheState>,
    hits: AtomicU64,
    misses: AtomicU64,
}

impl QueryCache {
    /// `capacity == 0` disables caching entirely.
    pub fn new(ttl: Duration, capacity: usize) -> Self {
        Self {
            ttl,
            capacity,
            state: Mutex::new(CacheState::default()),
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
        }
    }

    pub fn ttl(&self) -> Duration {
        self.ttl
    }

    pub fn get(&self, fingerprint: &str) -> Option<Arc<SearchOutcome>> {
        let found = self.lookup(fingerprint);
        if found.is_some() {
            self.hits.fetch_add(1, Ordering::Relaxed);
        } else {
            self.misses.fetch_add(1, Ordering::Relaxed);
        }
        found
    }

    fn lookup(&self, fingerprint: &str) -> Option<Arc<SearchOutcome>> {
        let mut state = self.state.lock().ok()?;
        let (expired, old_tick) = {
            let entry = state.entries.get(fingerprint)?;
            (entry.inserted.elapsed() >= self.ttl, entry.tick)
        };
        if expired {
            state.remove(fingerprint);
            return None;
        }

        let tick = state.next_tick();
        state.recency.remove(&old_tick);
        state.recency.insert(tick, fingerprint.to_string());
        let entry = state.entries.get_mut(fingerprint)?;
        entry.tick = tick;
        Some(entry.outcome.clone())
    }

    pub fn put(&self, fingerprint: &str, outcome: Arc<SearchOutcome>) {
        if self.capacity == 0 {
            return;
        }
        let Ok(mut state) = self.state.lock() else {
            return;
        };

        state.remove(fingerprint);
        let tick = state.next_tick();
        state.recency.insert(tick, fingerprint.to_string());
        state.entries.insert(
            fingerprint.to_string(),
            CacheEntry {
                outcome,
                inserted: Instant::now(),
                tick,
            },
        );

        while state.entries.len() > self.capacity {
            let Some((_, oldest)) = state.recency.pop_first() else {
                break;
            };
            state.entries.remove(&oldest);
        }
    }

    pub fn clear(&self) {
        if let Ok(mut state) = self.state.lock() {
            state.entries.clear();
            state.recency.clear();
        }
    }

    /// Drop expired entries. Returns how many were removed.
    pub fn purge_expired(&self) -> usize {
        let Ok(mut state) = self.state.lock() else {
            return 0;
        };
        let expired: Vec<String> = state
            .entries
            .iter()
            .filter(|(_, e)| e.inserted.elapsed() >= self.ttl)
            .map(|(k, _)| k.clone())
            .collect();
        for key in &expired {
            state.remove(key);
        }
        expired.len()
    }

    pub fn len(&self) -> usize {
        self.state.lock().map(|s| s.entries.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn stats(&self) -> CacheStats {
        CacheStats {
            entries: self.len(),
            capacity: self.capacity,
            hits: self.hits.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
        }
    }
}

/// Everything that determines a search's outcome, as passed to
/// [`fingerprint`]. Caps are the effective, already clamped values.
pub struct FingerprintInput<'a> {
    pub file_ids: &'a [String],
    /// Catalog signature, so results from an older version of the files
    /// never answer a search over the newer one.
    pub catalog_signature: &'a str,
    pub column: &'a str,
    pub term: &'a str,
    pub mode: SearchMode,
    pub case_sensitive: bool,
    pub per_file_cap: usize,
    pub global_cap: usize,
}

/// Hex SHA-256 over the sorted file ids, the catalog signature and the
/// request parameters.
pub fn fingerprint(input: &FingerprintInput<'_>) -> String {
    let mut ids: Vec<&str> = input.file_ids.iter().map(String::as_str).collect();
    ids.sort_unstable();
    ids.dedup();

    let mut hasher = Sha256::new();
    let mut field = |bytes: &[u8]| {
        hasher.update((bytes.len() as u64).to_le_bytes());
        hasher.update(bytes);
    };
    field(&(ids.len() as u64).to_le_bytes());
    for id in ids {
        field(id.as_bytes());
    }
    field(input.catalog_signature.as_bytes());
    field(input.column.as_bytes());
    field(input.term.as_bytes());
    field(input.mode.as_str().as_bytes());
    field(&[u8::from(input.case_sensitive)]);
    field(&(input.per_file_cap as u64).to_le_bytes());
    field(&(input.global_cap as u64).to_le_bytes());
    hex::encode(hasher.finalize())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::SearchRequest;

    fn outcome(term: &str) -> Arc<SearchOutcome> {
        Arc::new(SearchOutcome {
            request: SearchRequest::new("name", term, SearchMode::Contains),
            fingerprint: term.to_string(),
            results: Vec::new(),
            errors: Vec::new(),
            skipped: Vec::new(),
            total_rows: 0,
            truncated: false,
            cached: false,
            elapsed_ms: 0,
        })
    }

    fn input<'a>(ids: &'a [String], term: &'a str) -> FingerprintInput<'a> {
        FingerprintInput {
            file_ids: ids,
            catalog_signature: "sig-1",
            column: "name",
            term,
            mode: SearchMode::Contains,
            case_sensitive: false,
            per_file_cap: 100,
            global_cap: 1000,
        }
    }

    #[test]
    fn fingerprint_ignores_file_order() {
        let a = vec!["f1".to_string(), "f2".to_string()];
        let b = vec!["f2".to_string(), "f1".to_string()];
        assert_eq!(fingerprint(&input(&a, "x")), fingerprint(&input(&b, "x")));
        assert_ne!(fingerprint(&input(&a, "x")), fingerprint(&input(&a, "y")));
    }

    #[test]
    fn fingerprint_covers_caps_and_case() {
        let ids = vec!["f1".to_string()];
        let base = fingerprint(&input(&ids, "x"));

        let mut other = input(&ids, "x");
        other.per_file_cap = 5;
        assert_ne!(base, fingerprint(&other));

        let mut other = input(&ids, "x");
        other.case_sensitive = true;
        assert_ne!(base, fingerprint(&other));

        let mut other = input(&ids, "x");
        other.catalog_signature = "sig-2";
        assert_ne!(base, fingerprint(&other));

        let mut other = input(&ids, "x");
        other.mode = SearchMode::Exact;
        assert_ne!(base, fingerprint(&other));
    }

    #[test]
    fn hit_and_miss_are_counted() {
        let cache = QueryCache::new(Duration::from_secs(60), 4);
        assert!(cache.get("a").is_none());
        cache.put("a", outcome("a"));
        assert_eq!(cache.get("a").unwrap().fingerprint, "a");
        let stats = cache.stats();
        assert_eq!((stats.hits, stats.misses, stats.entries), (1, 1, 1));
    }

    #[test]
    fn least_recently_used_is_evicted() {
        let cache = QueryCache::new(Duration::from_secs(60), 2);
        cache.put("a", outcome("a"));
        cache.put("b", outcome("b"));
        assert!(cache.get("a").is_some());
        cache.put("c", outcome("c"));
        assert!(cache.get("a").is_some());
        assert!(cache.get("b").is_none());
        assert!(cache.get("c").is_some());
        assert_eq!(cache.len(), 2);
    }

    #[test]
    fn expired_entries_are_never_returned() {
        let cache = QueryCache::new(Duration::from_millis(40), 8);
        cache.put("a", outcome("a"));
        cache.put("b", outcome("b"));
        std::thread::sleep(Duration::from_millis(80));
        assert!(cache.get("a").is_none());
        assert_eq!(cache.purge_expired(), 1);
        assert!(cache.is_empty());
    }

    #[test]
    fn zero_capacity_disables() {
        let cache = QueryCache::new(Duration::from_secs(60), 0);
        cache.put("a", outcome("a"));
        assert!(cache.get("a").is_none());
    }

    #[test]
    fn clear_empties() {
        let cache = QueryCache::new(Duration::from_secs(60), 8);
        cache.put("a", outcome("a"));
        cache.clear();
        assert!(cache.get("a").is_none());
    }
}
