//! Size-classed cache of reusable ids.
//!
//! Each slot is a queue of run starts: an id offered to the slot of size 4
//! stands for four consecutive ids. The scanner is the only producer; any
//! allocating thread may consume.

use smallvec::SmallVec;

use super::monitor::IdMonitor;
use super::options::{IdGeneratorOptions, QueueKind};
use crate::primitives::concurrency::{LongQueue, MpmcLongQueue, SpmcLongQueue};
use crate::types::{Result, NO_ID};

struct CacheSlot {
    slot_size: usize,
    queue: Box<dyn LongQueue>,
}

/// Per-slot-size queues of cached ids.
pub struct IdCache {
    /// Sorted by ascending slot size.
    slots: Vec<CacheSlot>,
}

impl IdCache {
    /// Builds the cache described by `options`.
    pub fn new(options: &IdGeneratorOptions) -> Result<Self> {
        options.validate()?;
        let slots = options
            .slot_layout()
            .into_iter()
            .map(|(slot_size, capacity)| {
                let queue: Box<dyn LongQueue> = match options.queue_kind {
                    QueueKind::Mpmc => Box::new(MpmcLongQueue::new(capacity)?),
                    QueueKind::Spmc => Box::new(SpmcLongQueue::new(capacity)?),
                };
                Ok(CacheSlot { slot_size, queue })
            })
            .collect::<Result<Vec<_>>>()?;
        Ok(Self { slots })
    }

    /// Largest run length one slot entry covers.
    pub fn biggest_slot_size(&self) -> usize {
        self.slots.last().map_or(1, |s| s.slot_size)
    }

    /// Returns true if every slot serves single ids.
    pub fn has_only_single_ids(&self) -> bool {
        self.biggest_slot_size() == 1
    }

    /// Total capacity in ids.
    pub fn capacity(&self) -> usize {
        self.slots.iter().map(|s| s.queue.capacity() * s.slot_size).sum()
    }

    /// Cached ids across all slots.
    pub fn size(&self) -> usize {
        self.slots.iter().map(|s| s.queue.size() * s.slot_size).sum()
    }

    /// Free room in ids across all slots.
    pub fn available_space_by_id(&self) -> usize {
        self.slots_by_available_space()
            .iter()
            .map(|(size, free)| size * free)
            .sum()
    }

    /// `(slot_size, free_entries)` per slot, ascending by slot size.
    pub fn slots_by_available_space(&self) -> Vec<(usize, usize)> {
        self.slots
            .iter()
            .map(|s| (s.slot_size, s.queue.capacity().saturating_sub(s.queue.size())))
            .collect()
    }

    /// Returns true if no slot has room.
    pub fn is_full(&self) -> bool {
        self.available_space_by_id() == 0
    }

    /// Caches the run `[id, id + number_of_ids)`, largest slots first.
    ///
    /// Returns how many ids were accepted; those always form a prefix of the
    /// run, so the caller still owns `[id + accepted, id + number_of_ids)`.
    pub fn offer(&self, id: u64, number_of_ids: usize, monitor: &dyn IdMonitor) -> usize {
        let mut accepted = 0;
        for slot in self.slots.iter().rev() {
            while number_of_ids - accepted >= slot.slot_size {
                let start = id + accepted as u64;
                if !slot.queue.offer(start) {
                    break;
                }
                monitor.cached(start, slot.slot_size);
                accepted += slot.slot_size;
            }
        }
        accepted
    }

    /// Publishes a staged batch; returns the runs that did not fit.
    pub fn offer_pending(&self, pending: &PendingIdQueue, monitor: &dyn IdMonitor) -> Vec<(u64, usize)> {
        let mut rejected = Vec::new();
        for (slot_size, ids) in pending.staged() {
            let Some(slot) = self.slots.iter().find(|s| s.slot_size == slot_size) else {
                rejected.extend(ids.iter().map(|id| (*id, slot_size)));
                continue;
            };
            for id in ids {
                if slot.queue.offer(*id) {
                    monitor.cached(*id, slot_size);
                } else {
                    rejected.push((*id, slot_size));
                }
            }
        }
        rejected
    }

    /// Takes a single id, or returns `default` when the single-id slot is
    /// empty.
    pub fn take_or_default(&self, default: u64) -> u64 {
        match self.slots.first() {
            Some(slot) if slot.slot_size == 1 => slot.queue.take_or_default(default),
            _ => default,
        }
    }

    /// Takes `number_of_ids` consecutive ids from the smallest slot that
    /// fits; any unused tail of that slot entry is passed to `wasted`.
    pub fn take(
        &self,
        number_of_ids: usize,
        monitor: &dyn IdMonitor,
        wasted: &mut dyn FnMut(u64, usize),
    ) -> Option<u64> {
        for slot in self.slots.iter().filter(|s| s.slot_size >= number_of_ids) {
            let id = slot.queue.take_or_default(NO_ID);
            if id == NO_ID {
                continue;
            }
            let spare = slot.slot_size - number_of_ids;
            if spare > 0 {
                let first = id + number_of_ids as u64;
                monitor.skipped_ids_at_allocation(first, spare);
                wasted(first, spare);
            }
            return Some(id);
        }
        None
    }

    /// Takes up to `range_size` single ids that all fall into the same
    /// `range_size`-aligned partition as the first one taken.
    ///
    /// Ids outside that partition stay queued.
    pub fn drain_range(&self, range_size: usize) -> Vec<u64> {
        let Some(slot) = self.slots.first().filter(|s| s.slot_size == 1) else {
            return Vec::new();
        };
        let first = slot.queue.take_or_default(NO_ID);
        if first == NO_ID || range_size == 0 {
            return if first == NO_ID { Vec::new() } else { vec![first] };
        }
        let width = range_size as u64;
        let min = first - first % width;
        let max = min + (width - 1);
        let mut ids = Vec::with_capacity(range_size);
        ids.push(first);
        while ids.len() < range_size {
            match slot.queue.take_in_range(min, max) {
                Some(id) => ids.push(id),
                None => break,
            }
        }
        ids
    }

    /// Removes everything, returning `(id, slot_size)` runs.
    pub fn drain(&self) -> Vec<(u64, usize)> {
        let mut out = Vec::new();
        for slot in &self.slots {
            loop {
                let id = slot.queue.take_or_default(NO_ID);
                if id == NO_ID {
                    break;
                }
                out.push((id, slot.slot_size));
            }
        }
        out
    }
}

/// Scan results staged per slot size before they are published to the cache.
pub struct PendingIdQueue {
    /// `(slot_size, room, staged run starts)`, ascending by slot size.
    slots: Vec<(usize, usize, SmallVec<[u64; 8]>)>,
}

impl PendingIdQueue {
    /// Creates a staging area bounded by `slots_by_available_space`.
    pub fn new(slots_by_available_space: Vec<(usize, usize)>) -> Self {
        Self {
            slots: slots_by_available_space
                .into_iter()
                .map(|(size, room)| (size, room, SmallVec::new()))
                .collect(),
        }
    }

    /// Stages as much of `[id, id + number_of_ids)` as fits, largest slots
    /// first; returns the accepted prefix length.
    pub fn offer(&mut self, id: u64, number_of_ids: usize) -> usize {
        let mut accepted = 0;
        for (size, room, staged) in self.slots.iter_mut().rev() {
            while number_of_ids - accepted >= *size && staged.len() < *room {
                staged.push(id + accepted as u64);
                accepted += *size;
            }
        }
        accepted
    }

    /// Returns true when no slot has room left.
    pub fn is_full(&self) -> bool {
        self.slots.iter().all(|(_, room, staged)| staged.len() >= *room)
    }

    /// Staged `(start, slot_size)` runs.
    pub fn runs(&self) -> impl Iterator<Item = (u64, usize)> + '_ {
        self.slots
            .iter()
            .flat_map(|(size, _, staged)| staged.iter().map(move |id| (*id, *size)))
    }

    fn staged(&self) -> impl Iterator<Item = (usize, &[u64])> + '_ {
        self.slots.iter().map(|(size, _, staged)| (*size, staged.as_slice()))
    }
}
