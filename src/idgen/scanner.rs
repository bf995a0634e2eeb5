//! Resumable scan of the range store for reusable ids.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use tracing::{debug, trace, warn};

use super::cache::{IdCache, PendingIdQueue};
use super::marker::MarkerSource;
use crate::primitives::concurrency::ScanLock;
use crate::storage::IdRange;
use crate::types::Result;

/// Where a paused scan resumes.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
struct ScanCursor {
    key: u64,
    offset: usize,
}

/// Single-flight producer of the id cache.
///
/// Each pass walks the range store from the cursor, reserves every reusable
/// id it can fit into the cache and offers them. A pass that fills the cache
/// pauses at the first id that did not fit and the next call resumes there.
pub(crate) struct FreeIdScanner {
    source: Arc<MarkerSource>,
    cache: Arc<IdCache>,
    lock: ScanLock,
    /// Owned by the scan lock holder.
    cursor: Mutex<Option<ScanCursor>>,
    ongoing: AtomicBool,
    /// Notifier value observed when the current pass started.
    seen_notification: AtomicU64,
    /// Reserved ids that were taken out of the cache but not handed out.
    wasted: Mutex<VecDeque<(u64, usize)>>,
    wasted_len: AtomicUsize,
}

impl FreeIdScanner {
    pub(crate) fn new(source: Arc<MarkerSource>, cache: Arc<IdCache>) -> Self {
        // One behind the notifier so an existing store is scanned at least once.
        let seen = source.free_ids_notification().wrapping_sub(1);
        Self {
            source,
            cache,
            lock: ScanLock::new(),
            cursor: Mutex::new(None),
            ongoing: AtomicBool::new(false),
            seen_notification: AtomicU64::new(seen),
            wasted: Mutex::new(VecDeque::new()),
            wasted_len: AtomicUsize::new(0),
        }
    }

    /// Cheap hint: false means a scan would certainly find nothing new.
    pub(crate) fn scan_might_find_free_ids(&self) -> bool {
        self.ongoing.load(Ordering::Acquire)
            || self.wasted_len.load(Ordering::Acquire) > 0
            || self.source.free_ids_notification() != self.seen_notification.load(Ordering::Acquire)
    }

    /// Returns true while some thread is scanning.
    pub(crate) fn is_scanning(&self) -> bool {
        self.lock.is_locked()
    }

    /// Runs one scan pass unless another thread already is.
    ///
    /// With `blocking` the call waits for an ongoing pass and then runs its
    /// own. Returns whether this call scanned.
    pub(crate) fn try_load_free_ids_into_cache(&self, blocking: bool) -> Result<bool> {
        if !self.scan_might_find_free_ids() {
            return Ok(false);
        }
        let guard = if blocking {
            self.lock.lock()
        } else {
            self.lock.try_lock()
        };
        let Some(_guard) = guard else {
            return Ok(false);
        };
        self.requeue_wasted();
        if self.cache.is_full() {
            return Ok(true);
        }
        self.scan_pass()?;
        Ok(true)
    }

    /// Parks the unused tail of a cache slot until the next pass re-offers it.
    pub(crate) fn queue_wasted(&self, id: u64, number_of_ids: usize) {
        let mut wasted = self.wasted.lock();
        wasted.push_back((id, number_of_ids));
        self.wasted_len.store(wasted.len(), Ordering::Release);
    }

    /// Empties the cache, returns its ids to FREE and restarts scanning from
    /// the first entry.
    pub(crate) fn clear_cache(&self) -> Result<()> {
        let Some(_guard) = self.lock.lock() else {
            return Ok(());
        };
        let mut released = self.cache.drain();
        {
            let mut wasted = self.wasted.lock();
            released.extend(wasted.drain(..));
            self.wasted_len.store(0, Ordering::Release);
        }
        *self.cursor.lock() = None;
        self.ongoing.store(false, Ordering::Release);
        if !released.is_empty() {
            let mut marker = self.source.marker(false)?;
            for (id, number_of_ids) in &released {
                marker.mark_unreserved_range(*id, *number_of_ids)?;
            }
        }
        debug!(released = released.len(), "idgen.scan.cache_cleared");
        Ok(())
    }

    /// Waits for an ongoing pass and refuses later ones.
    pub(crate) fn close(&self) {
        self.lock.close();
    }

    fn requeue_wasted(&self) {
        let mut wasted = self.wasted.lock();
        while let Some((id, number_of_ids)) = wasted.pop_front() {
            let accepted = self.cache.offer(id, number_of_ids, self.source.monitor());
            if accepted < number_of_ids {
                wasted.push_front((id + accepted as u64, number_of_ids - accepted));
                break;
            }
        }
        self.wasted_len.store(wasted.len(), Ordering::Release);
    }

    fn scan_pass(&self) -> Result<()> {
        let mut cursor = self.cursor.lock();
        let start = match *cursor {
            Some(position) => position,
            None => {
                let notification = self.source.free_ids_notification();
                if notification == self.seen_notification.load(Ordering::Acquire) {
                    return Ok(());
                }
                self.seen_notification.store(notification, Ordering::Release);
                trace!(notification, "idgen.scan.pass_started");
                ScanCursor { key: 0, offset: 0 }
            }
        };

        let layout = self.source.layout();
        let generation = self.source.generation();
        let mut pending = PendingIdQueue::new(self.cache.slots_by_available_space());
        let mut staged: Vec<(u64, usize)> = Vec::new();
        let mut paused_at = None;
        let mut seeker = self.source.store().seek(start.key, u64::MAX)?;
        'entries: while let Some((key, range)) = seeker.next()? {
            let from = if key == start.key { start.offset } else { 0 };
            // Older entries were settled by a previous session.
            let stale = range.generation() < generation;
            let base = layout.first_id(key);
            for (offset, len) in reusable_runs(&range, from, stale) {
                if pending.is_full() {
                    paused_at = Some(ScanCursor { key, offset });
                    break 'entries;
                }
                let id = base + offset as u64;
                let accepted = pending.offer(id, len);
                if accepted > 0 {
                    staged.push((id, accepted));
                }
                if accepted < len {
                    paused_at = Some(ScanCursor {
                        key,
                        offset: offset + accepted,
                    });
                    break 'entries;
                }
            }
        }
        drop(seeker);

        *cursor = paused_at;
        self.ongoing.store(paused_at.is_some(), Ordering::Release);
        if let Some(position) = paused_at {
            debug!(key = position.key, offset = position.offset, "idgen.scan.paused");
        }
        if staged.is_empty() {
            return Ok(());
        }

        {
            let mut marker = self.source.marker(false)?;
            for (id, number_of_ids) in &staged {
                marker.mark_reserved_range(*id, *number_of_ids)?;
            }
        }
        let rejected = self.cache.offer_pending(&pending, self.source.monitor());
        if !rejected.is_empty() {
            warn!(rejected = rejected.len(), "idgen.scan.offer_rejected");
            let mut marker = self.source.marker(false)?;
            for (id, number_of_ids) in rejected {
                marker.mark_unreserved_range(id, number_of_ids)?;
            }
        }
        Ok(())
    }
}

/// Maximal `(offset, len)` runs of reusable ids in `range` from `from` on.
fn reusable_runs(range: &IdRange, from: usize, stale: bool) -> Vec<(usize, usize)> {
    let ids = range.ids_per_entry();
    let word_bits = u64::BITS as usize;
    let reusable = |offset: usize| range.reusable_word(offset / word_bits, stale) & (1 << (offset % word_bits)) != 0;
    let mut runs = Vec::new();
    let mut offset = from;
    while offset < ids {
        if offset % word_bits == 0 && range.reusable_word(offset / word_bits, stale) == 0 {
            offset += word_bits;
            continue;
        }
        if !reusable(offset) {
            offset += 1;
            continue;
        }
        let start = offset;
        while offset < ids && reusable(offset) {
            offset += 1;
        }
        runs.push((start, offset - start));
    }
    runs
}
