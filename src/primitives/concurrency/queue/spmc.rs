use std::sync::atomic::{AtomicU64, Ordering};

use super::{check_capacity, LongQueue, Padded};
use crate::types::Result;

/// Single-producer/multi-consumer bounded queue.
///
/// Only one thread may `offer` at a time; in the id cache that is the thread
/// holding the scan lock. Consumers race on the read index with
/// compare-and-swap, and the producer publishes a slot by advancing the write
/// index with release ordering.
pub struct SpmcLongQueue {
    mask: usize,
    slots: Box<[AtomicU64]>,
    read: Padded,
    write: Padded,
}

impl SpmcLongQueue {
    /// Creates a queue with `capacity` slots (power of two).
    pub fn new(capacity: usize) -> Result<Self> {
        let mask = check_capacity(capacity)?;
        let slots = (0..capacity).map(|_| AtomicU64::new(0)).collect();
        Ok(Self {
            mask,
            slots,
            read: Padded::default(),
            write: Padded::default(),
        })
    }

    fn take_if(&self, accept: impl Fn(u64) -> bool) -> Option<u64> {
        loop {
            let read = self.read.0.load(Ordering::Acquire);
            let write = self.write.0.load(Ordering::Acquire);
            if read >= write {
                return None;
            }
            let value = self.slots[read as usize & self.mask].load(Ordering::Relaxed);
            if !accept(value) {
                if self.read.0.load(Ordering::Acquire) == read {
                    return None;
                }
                continue;
            }
            if self
                .read
                .0
                .compare_exchange_weak(read, read + 1, Ordering::AcqRel, Ordering::Relaxed)
                .is_ok()
            {
                return Some(value);
            }
        }
    }
}

impl LongQueue for SpmcLongQueue {
    fn offer(&self, value: u64) -> bool {
        let write = self.write.0.load(Ordering::Relaxed);
        let read = self.read.0.load(Ordering::Acquire);
        if write - read > self.mask as u64 {
            return false;
        }
        self.slots[write as usize & self.mask].store(value, Ordering::Relaxed);
        self.write.0.store(write + 1, Ordering::Release);
        true
    }

    fn take_or_default(&self, default: u64) -> u64 {
        self.take_if(|_| true).unwrap_or(default)
    }

    fn take_in_range(&self, min: u64, max: u64) -> Option<u64> {
        self.take_if(|value| value >= min && value <= max)
    }

    fn size(&self) -> usize {
        let read = self.read.0.load(Ordering::Acquire);
        let write = self.write.0.load(Ordering::Acquire);
        write.saturating_sub(read) as usize
    }

    fn capacity(&self) -> usize {
        self.mask + 1
    }

    fn clear(&self) {
        while self.take_if(|_| true).is_some() {}
    }
}
