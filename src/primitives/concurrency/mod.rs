#![forbid(unsafe_code)]

//! Lock-free building blocks of the allocation fast path.

/// Bounded ring buffers used as id reuse queues.
pub mod queue;
/// Single-flight lock guarding the free-id scanner.
pub mod scan_lock;

pub use queue::{LongQueue, MpmcLongQueue, SpmcLongQueue};
pub use scan_lock::{ScanGuard, ScanLock};
