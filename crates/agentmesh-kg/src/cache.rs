//! Query result cache with TTL and LRU eviction.
//!
//! The cache lock is held only while looking up or storing an entry, never
//! across a backend call. Each entry remembers the predicates its query
//! depends on. An update drops only the entries whose scope overlaps the
//! predicates it touched, and bumps a generation counter. A result computed
//! under an older generation is stored only if no overlapping invalidation
//! happened in between, so a repeated query after a mutation never sees stale
//! bindings.

use crate::query::{BindingRow, Query};
use crate::store::{TripleStore, Update, UpdateReceipt};
use crate::term::{Iri, Triple};
use agentmesh_core::StoreError;
use lru::LruCache;
use parking_lot::Mutex;
use std::collections::{BTreeSet, VecDeque};
use std::num::NonZeroUsize;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::debug;

#[derive(Clone, Debug)]
pub struct CacheEntry {
    pub rows: Arc<Vec<BindingRow>>,
    pub expires_at: Instant,
    pub last_access: Instant,
    /// Predicates the result depends on; `None` means any.
    pub scope: Option<BTreeSet<Iri>>,
}

/// Predicate set touched by an update, `None` for "unknown, assume all".
pub type Scope = Option<BTreeSet<Iri>>;

const RECENT_INVALIDATIONS: usize = 64;

struct CacheInner {
    entries: LruCache<String, CacheEntry>,
    generation: u64,
    /// (generation after the bump, touched scope), oldest first
    recent: VecDeque<(u64, Scope)>,
}

fn overlaps(a: &Scope, b: &Scope) -> bool {
    match (a, b) {
        (Some(a), Some(b)) => a.intersection(b).next().is_some(),
        _ => true,
    }
}

fn touched<'a>(triples: impl IntoIterator<Item = &'a Triple>) -> Scope {
    Some(triples.into_iter().map(|t| t.predicate.clone()).collect())
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct CacheStats {
    pub hits: u64,
    pub misses: u64,
    pub len: usize,
    pub generation: u64,
}

pub struct QueryCache {
    inner: Mutex<CacheInner>,
    ttl: Duration,
    hits: AtomicU64,
    misses: AtomicU64,
}

impl QueryCache {
    pub fn new(capacity: usize, ttl: Duration) -> Self {
        let capacity = NonZeroUsize::new(capacity).unwrap_or(NonZeroUsize::MIN);
        Self {
            inner: Mutex::new(CacheInner {
                entries: LruCache::new(capacity),
                generation: 0,
                recent: VecDeque::new(),
            }),
            ttl,
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
        }
    }

    /// Look up a key. On a miss, returns the generation the caller must
    /// present when storing the freshly computed result.
    pub fn lookup(&self, key: &str) -> Result<Arc<Vec<BindingRow>>, u64> {
        let now = Instant::now();
        let mut inner = self.inner.lock();
        let generation = inner.generation;
        let expired = match inner.entries.get_mut(key) {
            Some(entry) if entry.expires_at > now => {
                entry.last_access = now;
                self.hits.fetch_add(1, Ordering::Relaxed);
                return Ok(entry.rows.clone());
            }
            Some(_) => true,
            None => false,
        };
        if expired {
            inner.entries.pop(key);
        }
        self.misses.fetch_add(1, Ordering::Relaxed);
        Err(generation)
    }

    /// Store a result that may depend on any predicate.
    pub fn store(&self, key: String, rows: Arc<Vec<BindingRow>>, generation: u64) -> bool {
        self.store_scoped(key, rows, generation, None)
    }

    /// Store a result computed under `generation`. Dropped if an update
    /// touching `scope` happened in between.
    pub fn store_scoped(&self, key: String, rows: Arc<Vec<BindingRow>>, generation: u64, scope: Scope) -> bool {
        let now = Instant::now();
        let mut inner = self.inner.lock();
        if inner.generation != generation {
            let covered = inner.recent.front().is_some_and(|(g, _)| *g <= generation + 1);
            let stale = inner
                .recent
                .iter()
                .any(|(g, touched)| *g > generation && overlaps(touched, &scope));
            if !covered || stale {
                return false;
            }
        }
        inner.entries.put(
            key,
            CacheEntry {
                rows,
                expires_at: now + self.ttl,
                last_access: now,
                scope,
            },
        );
        true
    }

    pub fn invalidate(&self) {
        self.invalidate_scope(None);
    }

    /// Drop every entry whose scope overlaps `touched`.
    pub fn invalidate_scope(&self, touched: Scope) {
        let mut inner = self.inner.lock();
        inner.generation += 1;
        let generation = inner.generation;
        let doomed: Vec<String> = inner
            .entries
            .iter()
            .filter(|(_, entry)| overlaps(&entry.scope, &touched))
            .map(|(key, _)| key.clone())
            .collect();
        for key in &doomed {
            inner.entries.pop(key);
        }
        inner.recent.push_back((generation, touched));
        if inner.recent.len() > RECENT_INVALIDATIONS {
            inner.recent.pop_front();
        }
    }

    pub fn stats(&self) -> CacheStats {
        let inner = self.inner.lock();
        CacheStats {
            hits: self.hits.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
            len: inner.entries.len(),
            generation: inner.generation,
        }
    }
}

/// Any backend with a query cache in front of it.
pub struct CachedStore<S> {
    inner: S,
    cache: QueryCache,
}

impl<S: TripleStore> CachedStore<S> {
    pub fn new(inner: S, capacity: usize, ttl: Duration) -> Self {
        Self {
            inner,
            cache: QueryCache::new(capacity, ttl),
        }
    }

    pub fn inner(&self) -> &S {
        &self.inner
    }

    pub fn cache(&self) -> &QueryCache {
        &self.cache
    }
}

#[async_trait::async_trait]
impl<S: TripleStore> TripleStore for CachedStore<S> {
    async fn execute_query(
        &self,
        query: &Query,
        timeout: Option<Duration>,
    ) -> Result<Vec<BindingRow>, StoreError> {
        let key = query.cache_key();
        let generation = match self.cache.lookup(&key) {
            Ok(rows) => return Ok(rows.as_ref().clone()),
            Err(generation) => generation,
        };
        let rows = self.inner.execute_query(query, timeout).await?;
        self.cache
            .store_scoped(key, Arc::new(rows.clone()), generation, query.predicates());
        Ok(rows)
    }

    async fn apply_update(
        &self,
        update: &Update,
        timeout: Option<Duration>,
    ) -> Result<UpdateReceipt, StoreError> {
        let result = self.inner.apply_update(update, timeout).await;
        let scope = match &result {
            Ok(receipt) if receipt.is_noop() => None,
            Ok(receipt) => Some(touched(receipt.inserted.iter().chain(&receipt.removed))),
            // a timed-out remote update may still land
            Err(_) => Some(touched(update.insert.iter().chain(&update.remove))),
        };
        if let Some(scope) = scope {
            debug!("query cache invalidated for {:?}", scope);
            self.cache.invalidate_scope(scope);
        }
        result
    }

    fn location(&self) -> String {
        self.inner.location()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn rows(n: i64) -> Arc<Vec<BindingRow>> {
        let mut row = BindingRow::default();
        row.bind("n", crate::term::Value::Int(n));
        Arc::new(vec![row])
    }

    #[test]
    fn stale_generation_is_not_stored() {
        let cache = QueryCache::new(4, Duration::from_secs(60));
        let generation = cache.lookup("q").unwrap_err();
        cache.invalidate();
        assert!(!cache.store("q".into(), rows(1), generation));
        assert!(cache.lookup("q").is_err());
    }

    #[test]
    fn lru_evicts_least_recently_used() {
        let cache = QueryCache::new(2, Duration::from_secs(60));
        let g = cache.lookup("a").unwrap_err();
        cache.store("a".into(), rows(1), g);
        cache.store("b".into(), rows(2), g);
        assert!(cache.lookup("a").is_ok());
        cache.store("c".into(), rows(3), g);
        assert!(cache.lookup("b").is_err());
        assert!(cache.lookup("a").is_ok());
        assert!(cache.lookup("c").is_ok());
    }

    fn scope(predicates: &[&str]) -> Scope {
        Some(predicates.iter().map(|p| Iri::new(*p)).collect())
    }

    #[test]
    fn invalidation_only_drops_overlapping_entries() {
        let cache = QueryCache::new(4, Duration::from_secs(60));
        let g = cache.lookup("readings").unwrap_err();
        cache.store_scoped("readings".into(), rows(1), g, scope(&["ex:reading"]));
        cache.store_scoped("labels".into(), rows(2), g, scope(&["ex:label"]));
        cache.store("anything".into(), rows(3), g);

        cache.invalidate_scope(scope(&["ex:label"]));
        assert!(cache.lookup("readings").is_ok());
        assert!(cache.lookup("labels").is_err());
        assert!(cache.lookup("anything").is_err());
    }

    #[test]
    fn fill_survives_unrelated_invalidation_only() {
        let cache = QueryCache::new(4, Duration::from_secs(60));
        let g = cache.lookup("readings").unwrap_err();
        cache.invalidate_scope(scope(&["mesh:diary"]));
        assert!(cache.store_scoped("readings".into(), rows(1), g, scope(&["ex:reading"])));

        let g = cache.lookup("labels").unwrap_err();
        cache.invalidate_scope(scope(&["ex:label"]));
        assert!(!cache.store_scoped("labels".into(), rows(2), g, scope(&["ex:label"])));
    }

    #[test]
    fn fill_older_than_the_invalidation_log_is_dropped() {
        let cache = QueryCache::new(4, Duration::from_secs(60));
        let g = cache.lookup("readings").unwrap_err();
        for _ in 0..RECENT_INVALIDATIONS + 1 {
            cache.invalidate_scope(scope(&["mesh:diary"]));
        }
        assert!(!cache.store_scoped("readings".into(), rows(1), g, scope(&["ex:reading"])));
    }

    #[test]
    fn expired_entries_miss() {
        let cache = QueryCache::new(2, Duration::from_millis(0));
        let g = cache.lookup("a").unwrap_err();
        cache.store("a".into(), rows(1), g);
        assert!(cache.lookup("a").is_err());
        assert_eq!(cache.stats().len, 0);
    }
}
