//! Low-level primitives for building the id allocator.
//!
//! Includes the lock-free queues and scan lock used on the allocation path,
//! and the file persistence helpers used by the range store.

/// Concurrency primitives and synchronization.
///
/// Lock-free queues and the single-flight scan lock.
pub mod concurrency;

/// I/O abstractions and utilities.
///
/// Atomic snapshot writes and checkpoint throttling.
pub mod io;
