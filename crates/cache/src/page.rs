//! Decoded page cache with insertion-order eviction
//!
//! Holds decoded page bitmaps keyed by page index. Eviction is driven by the
//! order in which pages were inserted, not by access recency: a page that is
//! read many times keeps its original sequence number. When the entry count
//! exceeds the capacity, the oldest entries are dropped until the cache is
//! back at its target size. The caller may pin one page (normally the page on
//! screen) which is skipped by eviction.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, RwLock, RwLockReadGuard, RwLockWriteGuard};

/// Zero-based page index used as the cache key
pub type PageIndex = u32;

/// Default maximum number of cached pages before eviction kicks in
pub const DEFAULT_CAPACITY: usize = 20;

/// Default number of pages kept after an eviction pass
pub const DEFAULT_TARGET_SIZE: usize = 15;

/// A cached page together with its insertion sequence
#[derive(Debug, Clone)]
struct CacheEntry<V> {
    value: V,
    sequence: u64,
}

/// Statistics about cache usage
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PageCacheStats {
    /// Number of pages currently in cache
    pub page_count: usize,

    /// Maximum number of pages before eviction
    pub capacity: usize,

    /// Number of pages kept after eviction
    pub target_size: usize,

    /// Number of cache hits
    pub hits: u64,

    /// Number of cache misses
    pub misses: u64,

    /// Number of pages inserted (including overwrites)
    pub insertions: u64,

    /// Number of pages evicted due to capacity pressure
    pub evictions: u64,
}

impl PageCacheStats {
    /// Calculate the cache hit rate (0.0 to 1.0)
    pub fn hit_rate(&self) -> f64 {
        let total = self.hits + self.misses;
        if total == 0 {
            0.0
        } else {
            self.hits as f64 / total as f64
        }
    }
}

/// Internal cache state, guarded by the cache's lock
struct CacheState<V> {
    entries: HashMap<PageIndex, CacheEntry<V>>,
    next_sequence: u64,
    capacity: usize,
    target_size: usize,
    insertions: u64,
    evictions: u64,
}

impl<V> CacheState<V> {
    fn new(capacity: usize, target_size: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            entries: HashMap::new(),
            next_sequence: 0,
            capacity,
            target_size: target_size.min(capacity),
            insertions: 0,
            evictions: 0,
        }
    }

    /// Drop the oldest entries until the target size is reached.
    ///
    /// Only runs when the entry count is above capacity. The pinned page is
    /// never selected.
    fn evict_if_over_capacity(&mut self, pinned: Option<PageIndex>) -> Vec<PageIndex> {
        if self.entries.len() <= self.capacity {
            return Vec::new();
        }

        let mut candidates: Vec<(u64, PageIndex)> = self
            .entries
            .iter()
            .filter(|(page, _)| Some(**page) != pinned)
            .map(|(page, entry)| (entry.sequence, *page))
            .collect();
        candidates.sort_unstable();

        let excess = self.entries.len() - self.target_size;
        let mut evicted = Vec::with_capacity(excess);

        for (_, page) in candidates.into_iter().take(excess) {
            self.entries.remove(&page);
            evicted.push(page);
        }

        self.evictions += evicted.len() as u64;
        evicted
    }
}

/// Bounded page cache with pinning
///
/// Thread-safe: lookups take a shared read lock so concurrent readers never
/// wait on each other, while insertion and eviction take the write lock so
/// eviction decisions are made against a consistent view of every entry.
///
/// # Example
///
/// ```
/// use djvu_reader_cache::PageCache;
///
/// let cache = PageCache::new(3, 2);
/// cache.put(0, "cover", None);
/// cache.put(1, "one", Some(0));
/// cache.put(2, "two", Some(0));
/// cache.put(3, "three", Some(0)); // over capacity: drop down to 2 entries
///
/// assert_eq!(cache.get(0), Some("cover")); // pinned page survives
/// assert_eq!(cache.get(3), Some("three"));
/// assert_eq!(cache.len(), 2);
/// ```
pub struct PageCache<V> {
    state: Arc<RwLock<CacheState<V>>>,
    hits: AtomicU64,
    misses: AtomicU64,
}

impl<V: Clone> PageCache<V> {
    /// Create a cache that evicts down to `target_size` once it holds more
    /// than `capacity` pages
    pub fn new(capacity: usize, target_size: usize) -> Self {
        Self {
            state: Arc::new(RwLock::new(CacheState::new(capacity, target_size))),
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
        }
    }

    fn read(&self) -> RwLockReadGuard<'_, CacheState<V>> {
        self.state.read().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn write(&self) -> RwLockWriteGuard<'_, CacheState<V>> {
        self.state.write().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Look up a page
    ///
    /// Does not change the page's position in the eviction order.
    pub fn get(&self, page: PageIndex) -> Option<V> {
        let found = self.read().entries.get(&page).map(|entry| entry.value.clone());

        if found.is_some() {
            self.hits.fetch_add(1, Ordering::Relaxed);
        } else {
            self.misses.fetch_add(1, Ordering::Relaxed);
        }

        found
    }

    /// Store a page, evicting the oldest entries if the cache is over capacity
    ///
    /// Overwriting an existing page gives it a fresh sequence number. The
    /// `pinned` page is never evicted by this call. Returns the evicted pages
    /// in eviction order.
    pub fn put(&self, page: PageIndex, value: V, pinned: Option<PageIndex>) -> Vec<PageIndex> {
        let mut state = self.write();

        let sequence = state.next_sequence;
        state.next_sequence += 1;
        state.insertions += 1;
        state.entries.insert(page, CacheEntry { value, sequence });

        let evicted = state.evict_if_over_capacity(pinned);
        if !evicted.is_empty() {
            tracing::debug!(?evicted, ?pinned, remaining = state.entries.len(), "evicted pages");
        }

        evicted
    }

    /// Check whether a page is cached without touching hit/miss statistics
    pub fn contains(&self, page: PageIndex) -> bool {
        self.read().entries.contains_key(&page)
    }

    /// Remove a single page
    pub fn remove(&self, page: PageIndex) -> Option<V> {
        self.write().entries.remove(&page).map(|entry| entry.value)
    }

    /// Remove all pages
    pub fn clear(&self) {
        self.write().entries.clear();
    }

    /// Number of cached pages
    pub fn len(&self) -> usize {
        self.read().entries.len()
    }

    /// Whether the cache is empty
    pub fn is_empty(&self) -> bool {
        self.read().entries.is_empty()
    }

    /// Cached page indices in ascending page order
    pub fn pages(&self) -> Vec<PageIndex> {
        let mut pages: Vec<PageIndex> = self.read().entries.keys().copied().collect();
        pages.sort_unstable();
        pages
    }

    /// Copy of every cached page, in ascending page order
    pub fn snapshot(&self) -> Vec<(PageIndex, V)> {
        let state = self.read();
        let mut pages: Vec<(PageIndex, V)> = state
            .entries
            .iter()
            .map(|(page, entry)| (*page, entry.value.clone()))
            .collect();
        pages.sort_unstable_by_key(|(page, _)| *page);
        pages
    }

    /// Change the eviction thresholds
    ///
    /// If the cache currently holds more than the new capacity, it is trimmed
    /// immediately, sparing `pinned`.
    pub fn set_limits(
        &self,
        capacity: usize,
        target_size: usize,
        pinned: Option<PageIndex>,
    ) -> Vec<PageIndex> {
        let mut state = self.write();
        state.capacity = capacity.max(1);
        state.target_size = target_size.min(state.capacity);
        state.evict_if_over_capacity(pinned)
    }

    /// Maximum number of pages before eviction
    pub fn capacity(&self) -> usize {
        self.read().capacity
    }

    /// Number of pages kept after an eviction pass
    pub fn target_size(&self) -> usize {
        self.read().target_size
    }

    /// Get current cache statistics
    pub fn stats(&self) -> PageCacheStats {
        let state = self.read();
        PageCacheStats {
            page_count: state.entries.len(),
            capacity: state.capacity,
            target_size: state.target_size,
            hits: self.hits.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
            insertions: state.insertions,
            evictions: state.evictions,
        }
    }
}

impl<V: Clone> Default for PageCache<V> {
    fn default() -> Self {
        Self::new(DEFAULT_CAPACITY, DEFAULT_TARGET_SIZE)
    }
}
