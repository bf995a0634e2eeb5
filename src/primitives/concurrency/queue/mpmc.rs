use std::hint;
use std::sync::atomic::{AtomicU64, Ordering};

use super::{check_capacity, LongQueue, Padded};
use crate::types::Result;

struct Slot {
    /// `pos` when writable for position `pos`, `pos + 1` once filled for it.
    seq: AtomicU64,
    value: AtomicU64,
}

/// Multi-producer/multi-consumer bounded queue with per-slot sequence numbers.
///
/// Producers claim `tail` and consumers claim `head` with compare-and-swap;
/// a slot's sequence tells whether it is ready for the claimed lap, so a
/// claim never waits on another thread's half-finished write.
pub struct MpmcLongQueue {
    mask: usize,
    slots: Box<[Slot]>,
    head: Padded,
    tail: Padded,
}

impl MpmcLongQueue {
    /// Creates a queue with `capacity` slots (power of two).
    pub fn new(capacity: usize) -> Result<Self> {
        let mask = check_capacity(capacity)?;
        let slots = (0..capacity as u64)
            .map(|pos| Slot {
                seq: AtomicU64::new(pos),
                value: AtomicU64::new(0),
            })
            .collect();
        Ok(Self {
            mask,
            slots,
            head: Padded::default(),
            tail: Padded::default(),
        })
    }

    #[inline]
    fn slot(&self, pos: u64) -> &Slot {
        &self.slots[pos as usize & self.mask]
    }

    /// Claims the head if `accept` approves the value found there.
    fn take_if(&self, accept: impl Fn(u64) -> bool) -> Option<u64> {
        loop {
            let pos = self.head.0.load(Ordering::Relaxed);
            let slot = self.slot(pos);
            let seq = slot.seq.load(Ordering::Acquire);
            let ready = pos.wrapping_add(1);
            if seq == ready {
                let value = slot.value.load(Ordering::Relaxed);
                if !accept(value) {
                    if self.head.0.load(Ordering::Acquire) == pos {
                        return None;
                    }
                    continue;
                }
                if self
                    .head
                    .0
                    .compare_exchange_weak(pos, ready, Ordering::AcqRel, Ordering::Relaxed)
                    .is_ok()
                {
                    slot.seq
                        .store(pos.wrapping_add(self.mask as u64 + 1), Ordering::Release);
                    return Some(value);
                }
            } else if (seq.wrapping_sub(ready) as i64) < 0 {
                return None;
            } else {
                hint::spin_loop();
            }
        }
    }
}

impl LongQueue for MpmcLongQueue {
    fn offer(&self, value: u64) -> bool {
        loop {
            let pos = self.tail.0.load(Ordering::Relaxed);
            let slot = self.slot(pos);
            let seq = slot.seq.load(Ordering::Acquire);
            let diff = seq.wrapping_sub(pos) as i64;
            if diff == 0 {
                if self
                    .tail
                    .0
                    .compare_exchange_weak(pos, pos.wrapping_add(1), Ordering::AcqRel, Ordering::Relaxed)
                    .is_ok()
                {
                    slot.value.store(value, Ordering::Relaxed);
                    slot.seq.store(pos.wrapping_add(1), Ordering::Release);
                    return true;
                }
            } else if diff < 0 {
                return false;
            } else {
                hint::spin_loop();
            }
        }
    }

    fn take_or_default(&self, default: u64) -> u64 {
        self.take_if(|_| true).unwrap_or(default)
    }

    fn take_in_range(&self, min: u64, max: u64) -> Option<u64> {
        self.take_if(|value| value >= min && value <= max)
    }

    fn size(&self) -> usize {
        let head = self.head.0.load(Ordering::Acquire);
        let tail = self.tail.0.load(Ordering::Acquire);
        (tail.saturating_sub(head) as usize).min(self.mask + 1)
    }

    fn capacity(&self) -> usize {
        self.mask + 1
    }

    fn clear(&self) {
        while self.take_if(|_| true).is_some() {}
    }
}
