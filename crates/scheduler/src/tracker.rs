//! In-flight decode tracking
//!
//! Records which pages currently have a decode running so that no two
//! decodes of the same page overlap. Every decode path (interactive,
//! adjacent, sweep) goes through the same tracker instance for a document.

use djvu_reader_cache::PageIndex;
use std::collections::HashSet;
use std::sync::{Arc, Mutex, MutexGuard};

#[derive(Debug, Default)]
struct TrackerState {
    pages: HashSet<PageIndex>,
    peak: usize,
}

/// Set of pages with a decode currently underway
///
/// # Example
///
/// ```
/// use djvu_reader_scheduler::InFlightTracker;
///
/// let tracker = InFlightTracker::new();
/// assert!(tracker.try_begin(4));
/// assert!(!tracker.try_begin(4)); // already decoding
///
/// tracker.end(4);
/// tracker.end(4); // idempotent
/// assert!(tracker.try_begin(4));
/// ```
#[derive(Debug, Default)]
pub struct InFlightTracker {
    state: Mutex<TrackerState>,
}

impl InFlightTracker {
    /// Create an empty tracker
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, TrackerState> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Mark a page as being decoded
    ///
    /// Returns `false` if the page is already marked, in which case the
    /// caller must not start another decode for it.
    pub fn try_begin(&self, page: PageIndex) -> bool {
        let mut state = self.lock();
        let inserted = state.pages.insert(page);
        if inserted {
            state.peak = state.peak.max(state.pages.len());
        }
        inserted
    }

    /// Clear the mark for a page. Calling this for an unmarked page is a no-op.
    pub fn end(&self, page: PageIndex) {
        self.lock().pages.remove(&page);
    }

    /// Mark a page and return a guard that clears the mark when dropped
    pub fn begin_guard(self: &Arc<Self>, page: PageIndex) -> Option<InFlightGuard> {
        if self.try_begin(page) {
            Some(InFlightGuard { tracker: Arc::clone(self), page })
        } else {
            None
        }
    }

    /// Whether a decode for the page is underway
    pub fn contains(&self, page: PageIndex) -> bool {
        self.lock().pages.contains(&page)
    }

    /// Number of pages currently being decoded
    pub fn len(&self) -> usize {
        self.lock().pages.len()
    }

    /// Whether no decode is underway
    pub fn is_empty(&self) -> bool {
        self.lock().pages.is_empty()
    }

    /// Highest number of simultaneous decodes seen by this tracker
    pub fn peak(&self) -> usize {
        self.lock().peak
    }
}

/// Clears a page's in-flight mark on drop
///
/// Held by a worker for the duration of a decode, so the mark is released on
/// success, failure, discard, and unwinding alike.
#[derive(Debug)]
pub struct InFlightGuard {
    tracker: Arc<InFlightTracker>,
    page: PageIndex,
}

impl InFlightGuard {
    /// The page this guard covers
    pub fn page(&self) -> PageIndex {
        self.page
    }
}

impl Drop for InFlightGuard {
    fn drop(&mut self) {
        self.tracker.end(self.page);
    }
}
