//! DJVU Reader Cache Library
//!
//! Bounded in-memory cache for decoded pages with insertion-order eviction
//! and a pinning exception for the page currently on screen.

pub mod page;

pub use page::{PageCache, PageCacheStats, PageIndex, DEFAULT_CAPACITY, DEFAULT_TARGET_SIZE};
