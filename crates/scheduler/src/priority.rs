//! Tiered page queue
//!
//! Orders pending page decodes by tier, with FIFO ordering inside a tier.
//! A page appears at most once; submitting it again at a higher tier
//! promotes it, and submitting it at the same or a lower tier is a no-op.

use djvu_reader_cache::PageIndex;
use std::cmp::Ordering;
use std::collections::{BinaryHeap, HashMap};

/// Session generation a work item belongs to
pub type Generation = u64;

/// Priority tier of a page decode
///
/// Higher tiers are dispatched first.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Tier {
    /// Whole-document background sweep (lowest)
    Sweep = 0,

    /// Pages next to the one the user is looking at
    Adjacent = 1,

    /// The page the user asked for (highest)
    Interactive = 2,
}

impl Tier {
    /// Lower-case name, used in log output
    pub fn as_str(self) -> &'static str {
        match self {
            Tier::Sweep => "sweep",
            Tier::Adjacent => "adjacent",
            Tier::Interactive => "interactive",
        }
    }
}

/// Result of offering a page to the scheduler
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Admission {
    /// Newly queued
    Queued,
    /// Already queued at a lower tier; moved up
    Promoted,
    /// Already queued at the same or a higher tier
    AlreadyQueued,
    /// A decode for the page is underway
    InFlight,
    /// The page is already in the cache
    Resident,
    /// The generation no longer matches the scheduler's
    Stale,
}

impl Admission {
    /// Whether the page now has a queue entry it did not have before,
    /// or an existing entry moved to a higher tier
    pub fn is_enqueued(self) -> bool {
        matches!(self, Admission::Queued | Admission::Promoted)
    }
}

/// A queued page decode
///
/// Items are ordered by tier (higher first), then by sequence number
/// (earlier first) so each tier drains in FIFO order.
#[derive(Debug, Clone)]
pub struct WorkItem {
    /// Page to decode
    pub page_index: PageIndex,

    /// Tier the page was queued at
    pub tier: Tier,

    /// Generation the request was made under
    pub generation: Generation,

    /// Position within the tier
    sequence: u64,
}

impl WorkItem {
    /// Create a work item
    pub fn new(page_index: PageIndex, tier: Tier, generation: Generation, sequence: u64) -> Self {
        Self {
            page_index,
            tier,
            generation,
            sequence,
        }
    }
}

impl PartialEq for WorkItem {
    fn eq(&self, other: &Self) -> bool {
        self.page_index == other.page_index && self.sequence == other.sequence
    }
}

impl Eq for WorkItem {}

impl PartialOrd for WorkItem {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for WorkItem {
    fn cmp(&self, other: &Self) -> Ordering {
        match self.tier.cmp(&other.tier) {
            // BinaryHeap is a max heap, so the earlier sequence must compare greater
            Ordering::Equal => other.sequence.cmp(&self.sequence),
            other => other,
        }
    }
}

#[derive(Debug, Clone, Copy)]
struct PendingEntry {
    tier: Tier,
    generation: Generation,
    sequence: u64,
}

/// Queue of pending page decodes
///
/// Not synchronized; the scheduler holds it under its own lock so that
/// admission checks and queue updates happen atomically. Promotion pushes a
/// fresh heap entry and leaves the old one behind; superseded entries are
/// skipped when they surface.
#[derive(Debug, Default)]
pub struct PriorityQueue {
    heap: BinaryHeap<WorkItem>,
    pending: HashMap<PageIndex, PendingEntry>,
    insertion_counter: u64,
}

impl PriorityQueue {
    /// Create an empty queue
    pub fn new() -> Self {
        Self::default()
    }

    /// Offer a page to the queue
    ///
    /// Returns [`Admission::Queued`], [`Admission::Promoted`] or
    /// [`Admission::AlreadyQueued`]. An entry left over from a different
    /// generation is replaced outright.
    pub fn push(&mut self, page_index: PageIndex, tier: Tier, generation: Generation) -> Admission {
        let admission = match self.pending.get(&page_index) {
            Some(existing) if existing.generation == generation && existing.tier >= tier => {
                return Admission::AlreadyQueued;
            }
            Some(existing) if existing.generation == generation => Admission::Promoted,
            _ => Admission::Queued,
        };

        let sequence = self.insertion_counter;
        self.insertion_counter += 1;

        self.pending.insert(
            page_index,
            PendingEntry {
                tier,
                generation,
                sequence,
            },
        );
        self.heap
            .push(WorkItem::new(page_index, tier, generation, sequence));

        admission
    }

    fn is_live(pending: &HashMap<PageIndex, PendingEntry>, item: &WorkItem) -> bool {
        pending
            .get(&item.page_index)
            .is_some_and(|entry| entry.sequence == item.sequence)
    }

    /// Remove and return the front item
    pub fn pop(&mut self) -> Option<WorkItem> {
        while let Some(item) = self.heap.pop() {
            if Self::is_live(&self.pending, &item) {
                self.pending.remove(&item.page_index);
                return Some(item);
            }
        }
        None
    }

    /// Number of distinct pages queued
    pub fn len(&self) -> usize {
        self.pending.len()
    }

    /// Whether no page is queued
    pub fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }

    /// Whether a page is queued
    pub fn contains(&self, page_index: PageIndex) -> bool {
        self.pending.contains_key(&page_index)
    }

    /// Tier a page is currently queued at
    pub fn tier_of(&self, page_index: PageIndex) -> Option<Tier> {
        self.pending.get(&page_index).map(|entry| entry.tier)
    }

    /// Drop every queued item
    pub fn clear(&mut self) {
        self.heap.clear();
        self.pending.clear();
    }

    /// Queued items in dispatch order
    pub fn items(&self) -> Vec<WorkItem> {
        let mut items: Vec<WorkItem> = self
            .heap
            .iter()
            .filter(|item| Self::is_live(&self.pending, item))
            .cloned()
            .collect();
        items.sort_by(|a, b| b.cmp(a));
        items
    }
}
