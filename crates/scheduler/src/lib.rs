//! DJVU Reader Scheduler Library
//!
//! Tiered scheduling of background page decodes.
//!
//! Pages are queued in three tiers (interactive, adjacent, sweep) and
//! dispatched highest tier first, FIFO within a tier. Each page is queued at
//! most once and decoded at most once at a time. Every request carries a
//! generation; starting a new generation makes all older work stale.
//!
//! # Example
//!
//! ```
//! use djvu_reader_scheduler::{JobOutcome, PriorityScheduler, Tier};
//!
//! let scheduler = PriorityScheduler::default();
//! let generation = scheduler.begin_generation();
//!
//! scheduler.submit(3, Tier::Sweep, generation);
//! scheduler.submit(4, Tier::Adjacent, generation);
//!
//! if let Some(dispatch) = scheduler.next_dispatch() {
//!     assert_eq!(dispatch.item.page_index, 4);
//!     // ... decode the page ...
//!     drop(dispatch);
//!     scheduler.finish(JobOutcome::Completed);
//! }
//!
//! // Navigating elsewhere makes everything still queued stale
//! let next = scheduler.begin_generation();
//! assert!(!scheduler.is_current(generation));
//! assert!(scheduler.is_current(next));
//! ```

mod priority;
mod scheduler;
mod tracker;
mod worker;

// Re-export public API
pub use priority::{Admission, Generation, PriorityQueue, Tier, WorkItem};
pub use scheduler::{Dispatch, JobOutcome, PriorityScheduler, ResidencyCheck, SchedulerStats};
pub use tracker::{InFlightGuard, InFlightTracker};
pub use worker::{
    DecodeExecutor, WorkerPool, WorkerPoolConfig, DEFAULT_POLL_INTERVAL, DEFAULT_WORKER_COUNT,
};
