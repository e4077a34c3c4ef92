//! Page decode scheduler
//!
//! Owns the tiered queue, the current generation and the in-flight tracker,
//! and hands work to decode workers. Admission checks and queue updates run
//! under one lock, so a page is never queued twice, never dispatched while
//! already decoding, and never dispatched for a superseded generation.

use crate::priority::{Admission, Generation, PriorityQueue, Tier, WorkItem};
use crate::tracker::{InFlightGuard, InFlightTracker};
use djvu_reader_cache::PageIndex;
use std::sync::{Arc, Condvar, Mutex, MutexGuard};
use std::time::{Duration, Instant};

/// Answers whether a page is already decoded and cached
pub type ResidencyCheck = Arc<dyn Fn(PageIndex) -> bool + Send + Sync>;

/// How a dispatched decode ended
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JobOutcome {
    /// The page was decoded and stored
    Completed,
    /// The decoder reported an error
    Failed,
    /// The result was dropped because its generation went stale
    Discarded,
}

/// Scheduler statistics
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SchedulerStats {
    /// Pages newly queued
    pub submitted: u64,

    /// Queued pages moved to a higher tier
    pub promoted: u64,

    /// Submissions absorbed by an existing queue entry or in-flight decode
    pub coalesced: u64,

    /// Pages handed to a worker
    pub dispatched: u64,

    /// Decodes that completed
    pub completed: u64,

    /// Decodes that failed
    pub failed: u64,

    /// Items dropped because their generation was stale
    pub discarded: u64,

    /// Current queue size
    pub queue_size: usize,

    /// Decodes currently running
    pub in_flight: usize,
}

/// A page handed to a worker
///
/// Holds the in-flight mark for the page until dropped.
#[derive(Debug)]
pub struct Dispatch {
    /// The dispatched work item
    pub item: WorkItem,
    _guard: InFlightGuard,
}

impl Dispatch {
    /// Clear the in-flight mark and keep the item
    pub fn release(self) -> WorkItem {
        self.item
    }
}

struct SchedulerState {
    queue: PriorityQueue,
    generation: Generation,
    tracker: Arc<InFlightTracker>,
    active: usize,
    stats: SchedulerStats,
    closed: bool,
}

/// Tiered page decode scheduler
///
/// # Example
///
/// ```
/// use djvu_reader_scheduler::{Admission, PriorityScheduler, Tier};
///
/// let scheduler = PriorityScheduler::default();
/// let generation = scheduler.begin_generation();
///
/// assert_eq!(scheduler.submit(5, Tier::Sweep, generation), Admission::Queued);
/// assert_eq!(scheduler.submit(5, Tier::Interactive, generation), Admission::Promoted);
///
/// let dispatch = scheduler.next_dispatch().unwrap();
/// assert_eq!(dispatch.item.page_index, 5);
/// assert_eq!(dispatch.item.tier, Tier::Interactive);
/// ```
pub struct PriorityScheduler {
    state: Mutex<SchedulerState>,
    work_available: Condvar,
    idle: Condvar,
    residency: ResidencyCheck,
}

impl PriorityScheduler {
    /// Create a scheduler that consults `residency` before queueing or
    /// dispatching a page
    pub fn new(residency: ResidencyCheck) -> Self {
        Self {
            state: Mutex::new(SchedulerState {
                queue: PriorityQueue::new(),
                generation: 0,
                tracker: Arc::new(InFlightTracker::new()),
                active: 0,
                stats: SchedulerStats::default(),
                closed: false,
            }),
            work_available: Condvar::new(),
            idle: Condvar::new(),
            residency,
        }
    }

    fn lock(&self) -> MutexGuard<'_, SchedulerState> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Offer a page for decoding
    ///
    /// A page that is already queued, decoding, or cached is not queued
    /// again. Submissions carrying a generation other than the current one
    /// are refused.
    pub fn submit(&self, page_index: PageIndex, tier: Tier, generation: Generation) -> Admission {
        let mut state = self.lock();

        if generation != state.generation {
            return Admission::Stale;
        }
        if state.tracker.contains(page_index) {
            state.stats.coalesced += 1;
            return Admission::InFlight;
        }
        if (self.residency)(page_index) {
            return Admission::Resident;
        }

        let admission = state.queue.push(page_index, tier, generation);
        match admission {
            Admission::Queued => state.stats.submitted += 1,
            Admission::Promoted => state.stats.promoted += 1,
            _ => state.stats.coalesced += 1,
        }
        drop(state);

        if admission.is_enqueued() {
            tracing::trace!(page = page_index, tier = tier.as_str(), ?admission, "page queued");
            self.work_available.notify_one();
        }
        admission
    }

    fn pop_dispatch(&self, state: &mut SchedulerState) -> Option<Dispatch> {
        while let Some(item) = state.queue.pop() {
            if item.generation != state.generation {
                state.stats.discarded += 1;
                tracing::trace!(page = item.page_index, generation = item.generation, "dropping stale item");
                continue;
            }
            if (self.residency)(item.page_index) {
                state.stats.coalesced += 1;
                continue;
            }
            match state.tracker.begin_guard(item.page_index) {
                Some(guard) => {
                    state.active += 1;
                    state.stats.dispatched += 1;
                    return Some(Dispatch {
                        item,
                        _guard: guard,
                    });
                }
                None => state.stats.coalesced += 1,
            }
        }

        if state.active == 0 {
            self.idle.notify_all();
        }
        None
    }

    /// Take the front item if one can be dispatched now
    pub fn next_dispatch(&self) -> Option<Dispatch> {
        let mut state = self.lock();
        self.pop_dispatch(&mut state)
    }

    /// Wait up to `timeout` for an item to dispatch
    ///
    /// Returns `None` straight away once the scheduler is closed.
    pub fn wait_for_dispatch(&self, timeout: Duration) -> Option<Dispatch> {
        let deadline = Instant::now() + timeout;
        let mut state = self.lock();

        loop {
            if state.closed {
                return None;
            }
            if let Some(dispatch) = self.pop_dispatch(&mut state) {
                return Some(dispatch);
            }
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                return None;
            }
            state = self
                .work_available
                .wait_timeout(state, remaining)
                .map(|(guard, _)| guard)
                .unwrap_or_else(|poisoned| poisoned.into_inner().0);
        }
    }

    /// Record the end of a dispatched decode
    ///
    /// Workers call this after dropping the [`Dispatch`].
    pub fn finish(&self, outcome: JobOutcome) {
        let mut state = self.lock();
        state.active = state.active.saturating_sub(1);
        match outcome {
            JobOutcome::Completed => state.stats.completed += 1,
            JobOutcome::Failed => state.stats.failed += 1,
            JobOutcome::Discarded => state.stats.discarded += 1,
        }
        if state.active == 0 && state.queue.is_empty() {
            self.idle.notify_all();
        }
    }

    /// Start a new generation
    ///
    /// Queued items from earlier generations are discarded when they reach
    /// the front. The in-flight tracker is replaced, so decodes still running
    /// for the old generation do not block the new one.
    pub fn begin_generation(&self) -> Generation {
        let mut state = self.lock();
        state.generation += 1;
        state.tracker = Arc::new(InFlightTracker::new());
        tracing::debug!(generation = state.generation, "scheduler generation advanced");
        state.generation
    }

    /// The current generation
    pub fn generation(&self) -> Generation {
        self.lock().generation
    }

    /// Whether `generation` is still the current one
    pub fn is_current(&self, generation: Generation) -> bool {
        self.lock().generation == generation
    }

    /// In-flight tracker for the current generation
    pub fn tracker(&self) -> Arc<InFlightTracker> {
        self.lock().tracker.clone()
    }

    /// Number of queued pages, stale ones included until they are drained
    pub fn pending(&self) -> usize {
        self.lock().queue.len()
    }

    /// Tier a page is queued at, if queued
    pub fn queued_tier(&self, page_index: PageIndex) -> Option<Tier> {
        self.lock().queue.tier_of(page_index)
    }

    /// Queued items in dispatch order
    pub fn pending_items(&self) -> Vec<WorkItem> {
        self.lock().queue.items()
    }

    /// Whether nothing is queued or running
    pub fn is_idle(&self) -> bool {
        let state = self.lock();
        state.queue.is_empty() && state.active == 0
    }

    /// Block until nothing is queued or running, or until `timeout` elapses
    ///
    /// Returns `true` if the scheduler went idle.
    pub fn wait_idle(&self, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        let mut state = self.lock();

        while !(state.queue.is_empty() && state.active == 0) {
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                return false;
            }
            state = self
                .idle
                .wait_timeout(state, remaining)
                .map(|(guard, _)| guard)
                .unwrap_or_else(|poisoned| poisoned.into_inner().0);
        }
        true
    }

    /// Drop every queued item
    ///
    /// Running decodes are unaffected. Returns the number of items dropped.
    pub fn clear(&self) -> usize {
        let mut state = self.lock();
        let dropped = state.queue.len();
        state.queue.clear();
        state.stats.discarded += dropped as u64;
        if state.active == 0 {
            self.idle.notify_all();
        }
        dropped
    }

    /// Stop handing out work and wake every thread blocked in
    /// [`wait_for_dispatch`](Self::wait_for_dispatch)
    pub fn close(&self) {
        self.lock().closed = true;
        self.work_available.notify_all();
    }

    /// Whether [`close`](Self::close) has been called
    pub fn is_closed(&self) -> bool {
        self.lock().closed
    }

    /// Get scheduler statistics
    pub fn stats(&self) -> SchedulerStats {
        let state = self.lock();
        let mut stats = state.stats.clone();
        stats.queue_size = state.queue.len();
        stats.in_flight = state.active;
        stats
    }
}

impl Default for PriorityScheduler {
    fn default() -> Self {
        Self::new(Arc::new(|_: PageIndex| false))
    }
}

impl std::fmt::Debug for PriorityScheduler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.lock();
        f.debug_struct("PriorityScheduler")
            .field("generation", &state.generation)
            .field("queued", &state.queue.len())
            .field("active", &state.active)
            .finish()
    }
}
