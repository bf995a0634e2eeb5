#![forbid(unsafe_code)]

//! Crash-safe id allocator.
//!
//! [`IdGenerator`] hands out dense `u64` ids. Freed ids are tracked in a
//! [`RangeStore`] as per-id states and come back through a size-classed
//! cache that a single-flight scanner refills; everything else is served by
//! advancing the high id.
//!
//! Lifecycle: open, then exactly one [`IdGenerator::start`] per session,
//! then [`IdGenerator::close`]. Markers created between open and start are
//! recovery replays: they merge without verification, or are dropped
//! entirely when the store is about to be rebuilt.

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use tracing::{debug, info};

mod cache;
mod iter;
mod marker;
mod monitor;
mod options;
mod scanner;
mod verify;

pub use cache::{IdCache, PendingIdQueue};
pub use iter::IdStateIter;
pub use marker::{CommitMarker, IdRangeMarker, ReuseMarker};
pub use monitor::{CounterMonitor, IdMonitor, MonitorSnapshot, NoopMonitor};
pub use options::{
    IdGeneratorOptions, QueueKind, DEFAULT_MAX_ID, LARGE_CACHE_CAPACITY, SMALL_CACHE_CAPACITY,
};
pub use verify::{
    ConsistencyCounts, ConsistencyFinding, ConsistencyReport, ConsistencySeverity,
    InconsistencyReporter,
};

pub(crate) use verify::check_store;

use marker::MarkerSource;
use scanner::FreeIdScanner;

use crate::primitives::io::IoLimiter;
use crate::storage::{
    FileRangeStore, IdRangeLayout, MemoryRangeStore, RangeStore, StoreHeader, STARTING_GENERATION,
};
use crate::types::{has_reserved_id_in_range, is_reserved_id, IdError, Result, NO_ID, RESERVED_ID};

/// Source of the initial id states when a store has to be rebuilt.
pub trait FreeIds {
    /// True if [`FreeIds::accept`] lists free ids; false if it lists used
    /// ids and everything in between is free.
    fn visits_deleted_ids(&self) -> bool {
        true
    }

    /// Feeds `(id, number_of_ids)` runs to `visitor`; returns the highest id
    /// in use by the owner, if any.
    fn accept(&self, visitor: &mut dyn FnMut(u64, usize) -> Result<()>) -> Result<Option<u64>>;
}

/// Rebuild source for an owner without any ids.
#[derive(Clone, Copy, Debug, Default)]
pub struct NoFreeIds;

impl FreeIds for NoFreeIds {
    fn accept(&self, _visitor: &mut dyn FnMut(u64, usize) -> Result<()>) -> Result<Option<u64>> {
        Ok(None)
    }
}

/// Rebuild source listing the ids that are free.
#[derive(Clone, Copy, Debug)]
pub struct DeletedIds<'a>(pub &'a [u64]);

impl FreeIds for DeletedIds<'_> {
    fn accept(&self, visitor: &mut dyn FnMut(u64, usize) -> Result<()>) -> Result<Option<u64>> {
        visit_each(self.0, visitor)
    }
}

/// Rebuild source listing the ids that are in use; gaps become free.
#[derive(Clone, Copy, Debug)]
pub struct UsedIds<'a>(pub &'a [u64]);

impl FreeIds for UsedIds<'_> {
    fn visits_deleted_ids(&self) -> bool {
        false
    }

    fn accept(&self, visitor: &mut dyn FnMut(u64, usize) -> Result<()>) -> Result<Option<u64>> {
        visit_each(self.0, visitor)
    }
}

fn visit_each(ids: &[u64], visitor: &mut dyn FnMut(u64, usize) -> Result<()>) -> Result<Option<u64>> {
    for id in ids {
        visitor(*id, 1)?;
    }
    Ok(ids.iter().max().copied())
}

/// Ids returned by [`IdGenerator::next_id_batch`]: the reused `defrag_ids`
/// followed by `range_length` ids starting at `range_start`.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct IdBatch {
    /// First id of the contiguous part; [`NO_ID`] when it is empty.
    pub range_start: u64,
    /// Length of the contiguous part.
    pub range_length: usize,
    /// Individually reused ids.
    pub defrag_ids: Vec<u64>,
}

impl IdBatch {
    /// Total number of ids.
    pub fn len(&self) -> usize {
        self.defrag_ids.len() + self.range_length
    }

    /// Returns true if the batch holds no id.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// All ids, reused ones first.
    pub fn iter(&self) -> impl Iterator<Item = u64> + '_ {
        let range = if self.range_length == 0 {
            0..0
        } else {
            self.range_start..self.range_start + self.range_length as u64
        };
        self.defrag_ids.iter().copied().chain(range)
    }
}

/// The id allocator.
pub struct IdGenerator {
    path: Option<PathBuf>,
    options: IdGeneratorOptions,
    source: Arc<MarkerSource>,
    cache: Arc<IdCache>,
    scanner: FreeIdScanner,
    high_id: AtomicU64,
    refill_threshold: usize,
    lifecycle: Mutex<()>,
    closed: AtomicBool,
}

impl IdGenerator {
    /// Opens or creates the id file at `path`.
    ///
    /// `initial_high_id` is only used when the file is created.
    pub fn open(
        path: impl AsRef<Path>,
        options: IdGeneratorOptions,
        monitor: Arc<dyn IdMonitor>,
        initial_high_id: u64,
    ) -> Result<Self> {
        options.validate()?;
        let path = path.as_ref().to_path_buf();
        let layout = IdRangeLayout::new(options.ids_per_entry)?;
        let store = FileRangeStore::open(&path, layout, options.read_only)?;
        let mut generator = Self::with_store(Arc::new(store), options, monitor, initial_high_id)?;
        generator.path = Some(path);
        Ok(generator)
    }

    /// Creates an allocator over a fresh in-memory store.
    pub fn in_memory(options: IdGeneratorOptions, monitor: Arc<dyn IdMonitor>, initial_high_id: u64) -> Result<Self> {
        options.validate()?;
        let layout = IdRangeLayout::new(options.ids_per_entry)?;
        Self::with_store(Arc::new(MemoryRangeStore::new(layout)), options, monitor, initial_high_id)
    }

    /// Creates an allocator over an already opened store.
    pub fn with_store(
        store: Arc<dyn RangeStore>,
        options: IdGeneratorOptions,
        monitor: Arc<dyn IdMonitor>,
        initial_high_id: u64,
    ) -> Result<Self> {
        options.validate()?;
        if store.layout().ids_per_entry() != options.ids_per_entry {
            return Err(IdError::IllegalState(
                "range store and options disagree on ids_per_entry",
            ));
        }
        let header = store.header();
        let needs_rebuild = header.is_none();
        let (high_id, watermark, generation) = match header {
            Some(header) => (
                header.high_id,
                header.highest_written_id.map_or(0, |id| id + 1),
                header.generation + 1,
            ),
            None => (initial_high_id, initial_high_id, STARTING_GENERATION + 1),
        };
        let source = Arc::new(MarkerSource::new(
            store,
            generation,
            needs_rebuild,
            options.read_only,
            watermark,
            Arc::clone(&monitor),
        ));
        if !needs_rebuild {
            // Assume the previous session left free ids behind.
            source.notify_free_ids();
        }
        let cache = Arc::new(IdCache::new(&options)?);
        let scanner = FreeIdScanner::new(Arc::clone(&source), Arc::clone(&cache));
        let refill_threshold = if options.strictly_prioritize_freelist {
            0
        } else {
            cache.capacity() / 4
        };
        monitor.opened(source.highest_written_id(), high_id);
        info!(
            high_id,
            highest_written = ?source.highest_written_id(),
            generation,
            needs_rebuild,
            read_only = options.read_only,
            "idgen.open"
        );
        Ok(Self {
            path: None,
            options,
            source,
            cache,
            scanner,
            high_id: AtomicU64::new(high_id),
            refill_threshold,
            lifecycle: Mutex::new(()),
            closed: AtomicBool::new(false),
        })
    }

    /// Starts the session, rebuilding the store from `free_ids` if it was
    /// never checkpointed, then fills the cache.
    pub fn start(&self, free_ids: &dyn FreeIds) -> Result<()> {
        let _lifecycle = self.lifecycle.lock();
        self.ensure_open()?;
        if self.source.is_started() {
            return Err(IdError::IllegalState("id generator already started"));
        }
        if self.source.needs_rebuild() {
            if self.options.read_only {
                return Err(IdError::ReadOnly("id generator needs a rebuild"));
            }
            let visits_deleted = free_ids.visits_deleted_ids();
            let highest = {
                let mut marker = self.source.locked_marker(!visits_deleted, true)?;
                let mut apply = |id, number_of_ids| {
                    if visits_deleted {
                        marker.mark_deleted_range(id, number_of_ids)
                    } else {
                        marker.mark_used_range(id, number_of_ids)
                    }
                };
                free_ids.accept(&mut apply)?
            };
            if let Some(highest) = highest {
                self.high_id.fetch_max(highest + 1, Ordering::AcqRel);
                self.source.raise_written_watermark(highest + 1);
            }
            info!(highest = ?highest, visits_deleted, "idgen.rebuild.done");
        }
        self.source.set_started();
        self.maintenance()
    }

    /// Allocates one id.
    pub fn next_id(&self) -> Result<u64> {
        self.ensure_writable()?;
        let strict = self.options.strictly_prioritize_freelist;
        loop {
            self.check_refill()?;
            let id = self.cache.take_or_default(NO_ID);
            if id != NO_ID {
                self.source.monitor().allocated_from_reused(id, 1);
                return Ok(id);
            }
            if !(strict && self.scanner.scan_might_find_free_ids()) {
                break;
            }
            // Wider slots may keep the cache above the refill threshold.
            self.scanner.try_load_free_ids_into_cache(true)?;
        }
        loop {
            let id = self.high_id.fetch_add(1, Ordering::AcqRel);
            self.ensure_within_capacity(id)?;
            if !is_reserved_id(id) {
                self.source.monitor().allocated_from_high(id, 1);
                return Ok(id);
            }
        }
    }

    /// Allocates `size` ids.
    ///
    /// A `consecutive` batch is always a fresh range from the high id. Other
    /// batches take reused ids from the cache first.
    pub fn next_id_batch(&self, size: usize, consecutive: bool) -> Result<IdBatch> {
        self.ensure_writable()?;
        if size == 0 {
            return Err(IdError::Invalid("batch size must be positive"));
        }
        if consecutive {
            let start = self.consecutive_from_high(size)?;
            return Ok(IdBatch {
                range_start: start,
                range_length: size,
                defrag_ids: Vec::new(),
            });
        }

        self.check_refill()?;
        let mut defrag_ids = Vec::new();
        while defrag_ids.len() < size {
            let id = self.cache.take_or_default(NO_ID);
            if id == NO_ID {
                break;
            }
            self.source.monitor().allocated_from_reused(id, 1);
            defrag_ids.push(id);
        }
        let remaining = size - defrag_ids.len();
        if remaining == 0 {
            return Ok(IdBatch {
                range_start: NO_ID,
                range_length: 0,
                defrag_ids,
            });
        }
        let (mut start, end) = match self.range_from_high(remaining) {
            Ok(range) => range,
            Err(err) => {
                for id in &defrag_ids {
                    self.scanner.queue_wasted(*id, 1);
                }
                return Err(err);
            }
        };
        if has_reserved_id_in_range(start, end) {
            defrag_ids.extend(start..RESERVED_ID);
            start = RESERVED_ID + 1;
        }
        Ok(IdBatch {
            range_start: start,
            range_length: (end - start) as usize,
            defrag_ids,
        })
    }

    /// Allocates `number_of_ids` consecutive ids and returns the first.
    ///
    /// Served from a cache slot when one is wide enough; the slot's unused
    /// tail is re-offered by the next scan.
    pub fn next_consecutive_id_range(&self, number_of_ids: usize) -> Result<u64> {
        self.ensure_writable()?;
        if number_of_ids == 0 {
            return Err(IdError::Invalid("range size must be positive"));
        }
        if number_of_ids <= self.cache.biggest_slot_size() {
            self.check_refill()?;
            let scanner = &self.scanner;
            let taken = self.cache.take(number_of_ids, self.source.monitor(), &mut |id, n| {
                scanner.queue_wasted(id, n)
            });
            if let Some(id) = taken {
                self.source.monitor().allocated_from_reused(id, number_of_ids);
                return Ok(id);
            }
        }
        self.consecutive_from_high(number_of_ids)
    }

    /// Scoped marker with gap bridging, for committing transactions.
    pub fn marker(&self) -> Result<IdRangeMarker<'_>> {
        self.ensure_open()?;
        self.source.marker(true)
    }

    /// Scoped marker for used and deleted marks.
    pub fn commit_marker(&self) -> Result<CommitMarker<'_>> {
        self.ensure_open()?;
        Ok(CommitMarker::new(self.source.marker(true)?))
    }

    /// Scoped marker for free, reserved and unreserved marks.
    pub fn reuse_marker(&self) -> Result<ReuseMarker<'_>> {
        self.ensure_open()?;
        Ok(ReuseMarker::new(self.source.marker(false)?))
    }

    /// Makes the store durable together with the high id, the highest
    /// written id and this session's generation.
    ///
    /// Until a pending rebuild has run, the store stays header-less so the
    /// next open rebuilds again.
    pub fn checkpoint(&self, limiter: &dyn IoLimiter) -> Result<()> {
        self.ensure_open()?;
        if self.options.read_only {
            return Ok(());
        }
        let high_id = self.high_id();
        let highest_written = self.source.highest_written_id();
        let generation = self.source.generation();
        let header = if self.source.needs_rebuild() && !self.source.is_started() {
            None
        } else {
            Some(StoreHeader {
                high_id,
                highest_written_id: highest_written,
                generation,
                ids_per_entry: self.options.ids_per_entry as u32,
            })
        };
        self.source.store().checkpoint(header.as_ref(), limiter)?;
        self.source.monitor().checkpoint(highest_written, high_id);
        debug!(high_id, highest_written = ?highest_written, generation, "idgen.checkpoint");
        Ok(())
    }

    /// Fills the cache if it has room, waiting for an ongoing scan.
    pub fn maintenance(&self) -> Result<()> {
        if self.source.is_started() && !self.options.read_only && !self.cache.is_full() {
            self.scanner.try_load_free_ids_into_cache(true)?;
        }
        Ok(())
    }

    /// Empties the cache and rescans from the first entry.
    pub fn clear_cache(&self) -> Result<()> {
        if self.options.read_only {
            return Ok(());
        }
        self.source.monitor().clearing_cache();
        self.scanner.clear_cache()?;
        self.source.monitor().cleared_cache();
        Ok(())
    }

    /// Waits for an ongoing scan and for the live marker, if any, then closes
    /// the store.
    ///
    /// Does not checkpoint: closing behaves like a crash, so anything not
    /// checkpointed is recovered on the next open. In particular a session
    /// that ran a rebuild in [`Self::start`] must call [`Self::checkpoint`]
    /// before closing, or the next open rebuilds again.
    ///
    /// Must not be called by a thread that holds a marker of this allocator.
    pub fn close(&self) -> Result<()> {
        let _lifecycle = self.lifecycle.lock();
        if self.closed.swap(true, Ordering::AcqRel) {
            return Ok(());
        }
        self.scanner.close();
        self.source.store().close()?;
        info!(high_id = self.high_id(), "idgen.close");
        Ok(())
    }

    /// Raises the high id; lower values are ignored.
    pub fn set_high_id(&self, high_id: u64) -> Result<()> {
        self.ensure_writable()?;
        self.high_id.fetch_max(high_id, Ordering::AcqRel);
        Ok(())
    }

    /// Next id that was never handed out.
    pub fn high_id(&self) -> u64 {
        self.high_id.load(Ordering::Acquire)
    }

    /// Highest id that may be in use.
    pub fn highest_possible_id_in_use(&self) -> Option<u64> {
        self.high_id().checked_sub(1)
    }

    /// Highest id ever marked used, the gap bridging watermark.
    pub fn highest_written_id(&self) -> Option<u64> {
        self.source.highest_written_id()
    }

    /// Treats everything below the high id as written, so ids written
    /// without markers (bulk import) are not bridged afterwards.
    pub fn mark_highest_written_at_high_id(&self) -> Result<()> {
        self.ensure_writable()?;
        self.source.set_written_watermark(self.high_id());
        Ok(())
    }

    /// Walks the store and reports ids violating the allocator invariants.
    pub fn consistency_check(&self, reporter: &mut dyn InconsistencyReporter) -> Result<bool> {
        check_store(
            self.source.store(),
            self.high_id(),
            self.source.generation(),
            reporter,
            None,
        )
    }

    /// Runs [`Self::consistency_check`] into a fresh report with state counts.
    pub fn consistency_report(&self) -> Result<ConsistencyReport> {
        let mut report = ConsistencyReport::new();
        let mut counts = ConsistencyCounts::default();
        check_store(
            self.source.store(),
            self.high_id(),
            self.source.generation(),
            &mut report,
            Some(&mut counts),
        )?;
        report.counts = counts;
        Ok(report)
    }

    /// Number of ids below the high id that are not USED.
    pub fn unused_id_count(&self) -> Result<u64> {
        let mut count = 0;
        for id in self.not_used_ids(0, self.high_id())? {
            id?;
            count += 1;
        }
        Ok(count)
    }

    /// Ids in `[from, to)` that are not USED.
    pub fn not_used_ids(&self, from: u64, to: u64) -> Result<IdStateIter<'_>> {
        IdStateIter::not_used(self.source.store(), from, to)
    }

    /// FREE ids below the high id.
    pub fn free_ids(&self) -> Result<IdStateIter<'_>> {
        IdStateIter::free(self.source.store(), 0, self.high_id())
    }

    /// Returns true if the cache only serves single ids.
    pub fn has_only_single_ids(&self) -> bool {
        self.cache.has_only_single_ids()
    }

    /// Returns true while a scan is paused mid-store or running.
    pub fn is_scanning(&self) -> bool {
        self.scanner.is_scanning()
    }

    /// Ids currently waiting in the cache.
    pub fn cached_id_count(&self) -> usize {
        self.cache.size()
    }

    /// Generation of this session.
    pub fn generation(&self) -> u64 {
        self.source.generation()
    }

    /// Returns true if the store was never checkpointed after a rebuild.
    pub fn needs_rebuild(&self) -> bool {
        self.source.needs_rebuild()
    }

    /// Returns true once [`Self::start`] has completed its rebuild.
    pub fn is_started(&self) -> bool {
        self.source.is_started()
    }

    /// Returns true if mutating calls are refused.
    pub fn is_read_only(&self) -> bool {
        self.options.read_only
    }

    /// Location of the id file, if file backed.
    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    fn check_refill(&self) -> Result<()> {
        if self.cache.size() <= self.refill_threshold {
            self.scanner
                .try_load_free_ids_into_cache(self.options.strictly_prioritize_freelist)?;
        }
        Ok(())
    }

    /// Advances the high id by exactly `number_of_ids`, skipping ranges that
    /// would contain the reserved id.
    fn consecutive_from_high(&self, number_of_ids: usize) -> Result<u64> {
        loop {
            let (start, end) = self.cas_high(number_of_ids as u64)?;
            if !has_reserved_id_in_range(start, end) {
                self.source.monitor().allocated_from_high(start, number_of_ids);
                return Ok(start);
            }
        }
    }

    /// Advances the high id by `number_of_ids`, plus one when the range
    /// covers the reserved id.
    fn range_from_high(&self, number_of_ids: usize) -> Result<(u64, u64)> {
        loop {
            let start = self.high_id.load(Ordering::Acquire);
            let mut end = start + number_of_ids as u64;
            if has_reserved_id_in_range(start, end) {
                end += 1;
            }
            self.ensure_within_capacity(end - 1)?;
            if self
                .high_id
                .compare_exchange_weak(start, end, Ordering::AcqRel, Ordering::Acquire)
                .is_ok()
            {
                self.source.monitor().allocated_from_high(start, (end - start) as usize);
                return Ok((start, end));
            }
        }
    }

    fn cas_high(&self, number_of_ids: u64) -> Result<(u64, u64)> {
        loop {
            let start = self.high_id.load(Ordering::Acquire);
            let end = start + number_of_ids;
            self.ensure_within_capacity(end - 1)?;
            if self
                .high_id
                .compare_exchange_weak(start, end, Ordering::AcqRel, Ordering::Acquire)
                .is_ok()
            {
                return Ok((start, end));
            }
        }
    }

    fn ensure_within_capacity(&self, id: u64) -> Result<()> {
        if id > self.options.max_id {
            return Err(IdError::CapacityExceeded {
                id,
                max_id: self.options.max_id,
            });
        }
        Ok(())
    }

    fn ensure_open(&self) -> Result<()> {
        if self.closed.load(Ordering::Acquire) {
            return Err(IdError::IllegalState("id generator is closed"));
        }
        Ok(())
    }

    fn ensure_writable(&self) -> Result<()> {
        self.ensure_open()?;
        if self.options.read_only {
            return Err(IdError::ReadOnly("id generator opened read-only"));
        }
        Ok(())
    }
}
