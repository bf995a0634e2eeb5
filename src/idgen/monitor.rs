use std::sync::atomic::{AtomicU64, Ordering};

use serde::Serialize;

/// Observes allocator events for tests and metrics.
///
/// Every method has an empty default so implementations only override what
/// they track. Calls happen inline on the calling thread, sometimes while
/// the scan lock or the marker lock is held, so implementations must be cheap.
pub trait IdMonitor: Send + Sync {
    /// The allocator opened with these watermarks.
    fn opened(&self, _highest_written_id: Option<u64>, _high_id: u64) {}
    /// Ids were handed out by advancing the high id.
    fn allocated_from_high(&self, _id: u64, _number_of_ids: usize) {}
    /// Ids were handed out from the cache.
    fn allocated_from_reused(&self, _id: u64, _number_of_ids: usize) {}
    /// The scanner placed ids in the cache.
    fn cached(&self, _id: u64, _number_of_ids: usize) {}
    /// A marker moved ids to USED.
    fn marked_as_used(&self, _id: u64, _number_of_ids: usize) {}
    /// A marker moved ids to DELETED.
    fn marked_as_deleted(&self, _id: u64, _number_of_ids: usize) {}
    /// A marker moved ids to FREE.
    fn marked_as_free(&self, _id: u64, _number_of_ids: usize) {}
    /// A marker moved ids to RESERVED.
    fn marked_as_reserved(&self, _id: u64, _number_of_ids: usize) {}
    /// A marker moved ids from RESERVED back to FREE.
    fn marked_as_unreserved(&self, _id: u64, _number_of_ids: usize) {}
    /// An entry from an older generation was normalized during a merge.
    fn normalized(&self, _range_key: u64) {}
    /// Ids skipped below a newly used id were settled as deleted.
    fn bridged(&self, _first_id: u64, _number_of_ids: u64) {}
    /// A checkpoint persisted these watermarks.
    fn checkpoint(&self, _highest_written_id: Option<u64>, _high_id: u64) {}
    /// `clear_cache` is about to drain the cache.
    fn clearing_cache(&self) {}
    /// `clear_cache` finished.
    fn cleared_cache(&self) {}
    /// The tail of a larger cache slot was set aside after a smaller request.
    fn skipped_ids_at_allocation(&self, _first_id: u64, _number_of_ids: usize) {}
}

/// [`IdMonitor`] that ignores everything.
#[derive(Default, Debug, Clone, Copy)]
pub struct NoopMonitor;

impl IdMonitor for NoopMonitor {}

/// Thread-safe counting [`IdMonitor`].
#[derive(Default, Debug)]
pub struct CounterMonitor {
    allocated_from_high: AtomicU64,
    allocated_from_reused: AtomicU64,
    cached: AtomicU64,
    marked_used: AtomicU64,
    marked_deleted: AtomicU64,
    marked_free: AtomicU64,
    marked_reserved: AtomicU64,
    marked_unreserved: AtomicU64,
    normalized: AtomicU64,
    bridged: AtomicU64,
    checkpoints: AtomicU64,
    cache_clears: AtomicU64,
    skipped_at_allocation: AtomicU64,
}

/// Point-in-time copy of a [`CounterMonitor`]; counts are in ids unless
/// named otherwise.
#[derive(Default, Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct MonitorSnapshot {
    /// Ids allocated by advancing the high id.
    pub allocated_from_high: u64,
    /// Ids allocated from the cache.
    pub allocated_from_reused: u64,
    /// Ids placed in the cache by the scanner.
    pub cached: u64,
    /// Ids marked used.
    pub marked_used: u64,
    /// Ids marked deleted.
    pub marked_deleted: u64,
    /// Ids marked free.
    pub marked_free: u64,
    /// Ids marked reserved.
    pub marked_reserved: u64,
    /// Ids moved from reserved back to free.
    pub marked_unreserved: u64,
    /// Entries normalized on merge.
    pub normalized_entries: u64,
    /// Ids settled by gap bridging.
    pub bridged: u64,
    /// Checkpoints taken.
    pub checkpoints: u64,
    /// Completed cache clears.
    pub cache_clears: u64,
    /// Ids set aside from partially used cache slots.
    pub skipped_at_allocation: u64,
}

impl CounterMonitor {
    /// Copies the counters.
    pub fn snapshot(&self) -> MonitorSnapshot {
        let get = |c: &AtomicU64| c.load(Ordering::Relaxed);
        MonitorSnapshot {
            allocated_from_high: get(&self.allocated_from_high),
            allocated_from_reused: get(&self.allocated_from_reused),
            cached: get(&self.cached),
            marked_used: get(&self.marked_used),
            marked_deleted: get(&self.marked_deleted),
            marked_free: get(&self.marked_free),
            marked_reserved: get(&self.marked_reserved),
            marked_unreserved: get(&self.marked_unreserved),
            normalized_entries: get(&self.normalized),
            bridged: get(&self.bridged),
            checkpoints: get(&self.checkpoints),
            cache_clears: get(&self.cache_clears),
            skipped_at_allocation: get(&self.skipped_at_allocation),
        }
    }
}

fn add(counter: &AtomicU64, n: usize) {
    counter.fetch_add(n as u64, Ordering::Relaxed);
}

impl IdMonitor for CounterMonitor {
    fn allocated_from_high(&self, _id: u64, number_of_ids: usize) {
        add(&self.allocated_from_high, number_of_ids);
    }

    fn allocated_from_reused(&self, _id: u64, number_of_ids: usize) {
        add(&self.allocated_from_reused, number_of_ids);
    }

    fn cached(&self, _id: u64, number_of_ids: usize) {
        add(&self.cached, number_of_ids);
    }

    fn marked_as_used(&self, _id: u64, number_of_ids: usize) {
        add(&self.marked_used, number_of_ids);
    }

    fn marked_as_deleted(&self, _id: u64, number_of_ids: usize) {
        add(&self.marked_deleted, number_of_ids);
    }

    fn marked_as_free(&self, _id: u64, number_of_ids: usize) {
        add(&self.marked_free, number_of_ids);
    }

    fn marked_as_reserved(&self, _id: u64, number_of_ids: usize) {
        add(&self.marked_reserved, number_of_ids);
    }

    fn marked_as_unreserved(&self, _id: u64, number_of_ids: usize) {
        add(&self.marked_unreserved, number_of_ids);
    }

    fn normalized(&self, _range_key: u64) {
        add(&self.normalized, 1);
    }

    fn bridged(&self, _first_id: u64, number_of_ids: u64) {
        self.bridged.fetch_add(number_of_ids, Ordering::Relaxed);
    }

    fn checkpoint(&self, _highest_written_id: Option<u64>, _high_id: u64) {
        add(&self.checkpoints, 1);
    }

    fn cleared_cache(&self) {
        add(&self.cache_clears, 1);
    }

    fn skipped_ids_at_allocation(&self, _first_id: u64, number_of_ids: usize) {
        add(&self.skipped_at_allocation, number_of_ids);
    }
}
