//! Bounded lock-free ring buffers of ids.
//!
//! Both queues are arrays of atomics indexed by monotonically increasing
//! 64-bit positions; `position & mask` selects the slot, so capacities are
//! powers of two and wrap-around keeps FIFO order.

use std::sync::atomic::AtomicU64;

mod mpmc;
mod spmc;

pub use mpmc::MpmcLongQueue;
pub use spmc::SpmcLongQueue;

use crate::types::{IdError, Result};

/// Common contract of the id reuse queues.
pub trait LongQueue: Send + Sync {
    /// Appends `value`; returns false if the queue is full.
    fn offer(&self, value: u64) -> bool;
    /// Removes the head, or returns `default` when empty.
    fn take_or_default(&self, default: u64) -> u64;
    /// Removes the head only if it lies in `[min, max]`.
    fn take_in_range(&self, min: u64, max: u64) -> Option<u64>;
    /// Number of queued values at some recent instant.
    fn size(&self) -> usize;
    /// Fixed number of slots.
    fn capacity(&self) -> usize;
    /// Drains everything currently visible; concurrent offers may survive.
    fn clear(&self);
}

/// Pads a hot counter to its own cache line.
#[repr(align(64))]
#[derive(Default)]
pub(crate) struct Padded(pub(crate) AtomicU64);

pub(crate) fn check_capacity(capacity: usize) -> Result<usize> {
    if capacity < 2 || !capacity.is_power_of_two() {
        return Err(IdError::Invalid("queue capacity must be a power of two >= 2"));
    }
    Ok(capacity - 1)
}
