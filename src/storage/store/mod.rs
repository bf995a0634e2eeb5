//! Ordered key to [`IdRange`] index consumed by the allocator.
//!
//! The allocator never touches ids directly: every change is a merge of a
//! [`RangeDelta`] into the entry at a range key. Entries that end up all USED
//! are dropped, so the index stays sparse.

use std::collections::btree_map::Entry;
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};

use parking_lot::{Mutex, MutexGuard, RwLock};

use crate::primitives::io::IoLimiter;
use crate::storage::header::StoreHeader;
use crate::storage::range::{IdRange, IdRangeLayout, IdRangeMerger, RangeDelta};
use crate::types::{IdError, Result};

mod file;

pub use file::FileRangeStore;

/// Exclusive mutation handle; dropping it releases the store's writer lock.
pub trait RangeWriter {
    /// Merges `delta` into the entry at `key`, creating it when absent.
    fn merge(&mut self, key: u64, delta: &RangeDelta, merger: &IdRangeMerger) -> Result<()>;
    /// Merges `delta` only if an entry exists at `key`.
    fn merge_if_exists(&mut self, key: u64, delta: &RangeDelta, merger: &IdRangeMerger) -> Result<()>;
}

/// Ordered cursor over `(key, entry)` pairs.
pub trait RangeSeeker {
    /// Advances to the next entry, returning a copy of it.
    fn next(&mut self) -> Result<Option<(u64, IdRange)>>;
}

/// Callback for whole-store walks.
pub trait RangeVisitor {
    /// Called once per persisted entry in key order.
    fn entry(&mut self, key: u64, range: &IdRange) -> Result<()>;
}

impl<F> RangeVisitor for F
where
    F: FnMut(u64, &IdRange) -> Result<()>,
{
    fn entry(&mut self, key: u64, range: &IdRange) -> Result<()> {
        self(key, range)
    }
}

/// Persisted range index contract.
pub trait RangeStore: Send + Sync {
    /// Entry width of this store.
    fn layout(&self) -> IdRangeLayout;
    /// Allocator header from the last checkpoint, `None` for a fresh store.
    fn header(&self) -> Option<StoreHeader>;
    /// Whether writers are refused.
    fn is_read_only(&self) -> bool;
    /// Acquires the single writer, blocking while another one is alive.
    fn writer(&self) -> Result<Box<dyn RangeWriter + '_>>;
    /// Cursor over keys in `[from_key, to_key)`.
    fn seek(&self, from_key: u64, to_key: u64) -> Result<Box<dyn RangeSeeker + '_>>;
    /// Walks every entry in key order.
    fn visit(&self, visitor: &mut dyn RangeVisitor) -> Result<()>;
    /// Makes the current entries durable; `header` replaces the stored one
    /// when given.
    fn checkpoint(&self, header: Option<&StoreHeader>, limiter: &dyn IoLimiter) -> Result<()>;
    /// Refuses further writers.
    fn close(&self) -> Result<()>;
}

/// In-memory [`RangeStore`]; also the working set behind [`FileRangeStore`].
pub struct MemoryRangeStore {
    layout: IdRangeLayout,
    entries: RwLock<BTreeMap<u64, IdRange>>,
    header: RwLock<Option<StoreHeader>>,
    writer_lock: Mutex<()>,
    read_only: bool,
    closed: AtomicBool,
}

impl MemoryRangeStore {
    /// Creates an empty, writable store.
    pub fn new(layout: IdRangeLayout) -> Self {
        Self::with_contents(layout, BTreeMap::new(), None, false)
    }

    pub(crate) fn with_contents(
        layout: IdRangeLayout,
        entries: BTreeMap<u64, IdRange>,
        header: Option<StoreHeader>,
        read_only: bool,
    ) -> Self {
        Self {
            layout,
            entries: RwLock::new(entries),
            header: RwLock::new(header),
            writer_lock: Mutex::new(()),
            read_only,
            closed: AtomicBool::new(false),
        }
    }

    /// Number of persisted (non-empty) entries.
    pub fn len(&self) -> usize {
        self.entries.read().len()
    }

    /// Returns true if no entry is stored.
    pub fn is_empty(&self) -> bool {
        self.entries.read().is_empty()
    }

    pub(crate) fn snapshot(&self) -> (Option<StoreHeader>, Vec<(u64, IdRange)>) {
        let entries = self.entries.read();
        let header = *self.header.read();
        (header, entries.iter().map(|(k, v)| (*k, v.clone())).collect())
    }

    pub(crate) fn set_header(&self, header: Option<&StoreHeader>) {
        if let Some(header) = header {
            *self.header.write() = Some(*header);
        }
    }

    fn apply(&self, key: u64, delta: &RangeDelta, merger: &IdRangeMerger, create: bool) -> Result<()> {
        let mut entries = self.entries.write();
        match entries.entry(key) {
            Entry::Occupied(mut slot) => {
                let mut updated = slot.get().clone();
                merger.merge(key, &mut updated, delta)?;
                if updated.is_empty() {
                    slot.remove();
                } else {
                    *slot.get_mut() = updated;
                }
            }
            Entry::Vacant(slot) => {
                if !create {
                    return Ok(());
                }
                let mut fresh = IdRange::new(self.layout.ids_per_entry(), delta.generation());
                merger.merge(key, &mut fresh, delta)?;
                if !fresh.is_empty() {
                    slot.insert(fresh);
                }
            }
        }
        Ok(())
    }
}

struct MemoryRangeWriter<'a> {
    store: &'a MemoryRangeStore,
    _guard: MutexGuard<'a, ()>,
}

impl RangeWriter for MemoryRangeWriter<'_> {
    fn merge(&mut self, key: u64, delta: &RangeDelta, merger: &IdRangeMerger) -> Result<()> {
        self.store.apply(key, delta, merger, true)
    }

    fn merge_if_exists(&mut self, key: u64, delta: &RangeDelta, merger: &IdRangeMerger) -> Result<()> {
        self.store.apply(key, delta, merger, false)
    }
}

struct MemoryRangeSeeker<'a> {
    store: &'a MemoryRangeStore,
    next_key: Option<u64>,
    to_key: u64,
}

impl RangeSeeker for MemoryRangeSeeker<'_> {
    fn next(&mut self) -> Result<Option<(u64, IdRange)>> {
        let Some(from) = self.next_key else {
            return Ok(None);
        };
        if from >= self.to_key {
            self.next_key = None;
            return Ok(None);
        }
        let entries = self.store.entries.read();
        match entries.range(from..self.to_key).next() {
            Some((key, range)) => {
                self.next_key = key.checked_add(1);
                Ok(Some((*key, range.clone())))
            }
            None => {
                self.next_key = None;
                Ok(None)
            }
        }
    }
}

impl RangeStore for MemoryRangeStore {
    fn layout(&self) -> IdRangeLayout {
        self.layout
    }

    fn header(&self) -> Option<StoreHeader> {
        *self.header.read()
    }

    fn is_read_only(&self) -> bool {
        self.read_only
    }

    fn writer(&self) -> Result<Box<dyn RangeWriter + '_>> {
        if self.read_only {
            return Err(IdError::ReadOnly("range store opened read-only"));
        }
        let guard = self.writer_lock.lock();
        if self.closed.load(Ordering::Acquire) {
            return Err(IdError::IllegalState("range store is closed"));
        }
        Ok(Box::new(MemoryRangeWriter {
            store: self,
            _guard: guard,
        }))
    }

    fn seek(&self, from_key: u64, to_key: u64) -> Result<Box<dyn RangeSeeker + '_>> {
        Ok(Box::new(MemoryRangeSeeker {
            store: self,
            next_key: Some(from_key),
            to_key,
        }))
    }

    fn visit(&self, visitor: &mut dyn RangeVisitor) -> Result<()> {
        let entries = self.entries.read();
        for (key, range) in entries.iter() {
            visitor.entry(*key, range)?;
        }
        Ok(())
    }

    fn checkpoint(&self, header: Option<&StoreHeader>, _limiter: &dyn IoLimiter) -> Result<()> {
        if self.read_only {
            return Ok(());
        }
        let _guard = self.writer_lock.lock();
        self.set_header(header);
        Ok(())
    }

    fn close(&self) -> Result<()> {
        // Waits for the live writer, if any.
        let _guard = self.writer_lock.lock();
        self.closed.store(true, Ordering::Release);
        Ok(())
    }
}
