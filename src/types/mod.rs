//! Shared identifier constants, error type and checksum helpers.

#![forbid(unsafe_code)]

use std::io;
use std::path::PathBuf;

use crate::storage::IdState;

/// Checksum primitives used by the range snapshot file.
pub mod checksum;

pub use checksum::{snapshot_crc32, Checksum, Crc32Fast};

/// Sentinel meaning "no id", returned by queues and caches when empty.
pub const NO_ID: u64 = u64::MAX;

/// Id value reserved by record formats that encode `-1` in 32 bits; never handed out.
pub const RESERVED_ID: u64 = u32::MAX as u64;

/// Returns true if `id` must never be allocated.
#[inline]
pub fn is_reserved_id(id: u64) -> bool {
    id == RESERVED_ID
}

/// Returns true if `[from, to)` contains the reserved id.
#[inline]
pub fn has_reserved_id_in_range(from: u64, to: u64) -> bool {
    from <= RESERVED_ID && to > RESERVED_ID
}

/// Errors produced by the id allocator and its range store.
#[derive(thiserror::Error, Debug)]
pub enum IdError {
    /// Underlying file I/O failed.
    #[error("IO: {0}")]
    Io(#[from] io::Error),
    /// Persisted state failed validation.
    #[error("corruption: {0}")]
    Corruption(&'static str),
    /// Caller supplied an invalid argument or option.
    #[error("invalid argument: {0}")]
    Invalid(&'static str),
    /// The id file is missing and may not be created.
    #[error("id file not found: {}", path.display())]
    NotFound {
        /// Path that was looked up.
        path: PathBuf,
        /// The I/O error reported by the filesystem.
        #[source]
        source: io::Error,
    },
    /// A mutating operation was attempted on a read-only allocator.
    #[error("read-only: {0}")]
    ReadOnly(&'static str),
    /// A per-id state transition is not allowed by the state machine.
    #[error("illegal state transition for id {id}: {from:?} -> {to:?}")]
    IllegalStateTransition {
        /// The id whose transition was rejected.
        id: u64,
        /// State currently persisted.
        from: IdState,
        /// State requested by the delta.
        to: IdState,
    },
    /// Allocation would go beyond the configured maximum id.
    #[error("id capacity exceeded: id {id} is beyond max id {max_id}")]
    CapacityExceeded {
        /// First id that did not fit.
        id: u64,
        /// Configured maximum id.
        max_id: u64,
    },
    /// The allocator was used outside of its lifecycle.
    #[error("illegal state: {0}")]
    IllegalState(&'static str),
}

impl IdError {
    /// Returns true for the expected, caller-recoverable capacity condition.
    pub fn is_capacity_exceeded(&self) -> bool {
        matches!(self, IdError::CapacityExceeded { .. })
    }
}

/// Result alias used throughout the crate.
pub type Result<T> = std::result::Result<T, IdError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn reserved_id_range_checks() {
        assert!(is_reserved_id(RESERVED_ID));
        assert!(!is_reserved_id(RESERVED_ID - 1));
        assert!(has_reserved_id_in_range(RESERVED_ID, RESERVED_ID + 1));
        assert!(has_reserved_id_in_range(RESERVED_ID - 10, RESERVED_ID + 10));
        assert!(!has_reserved_id_in_range(0, RESERVED_ID));
        assert!(!has_reserved_id_in_range(RESERVED_ID + 1, RESERVED_ID + 100));
    }

    #[test]
    fn capacity_error_is_distinguishable() {
        let err = IdError::CapacityExceeded { id: 11, max_id: 10 };
        assert!(err.is_capacity_exceeded());
        assert!(!IdError::ReadOnly("x").is_capacity_exceeded());
        assert_eq!(
            err.to_string(),
            "id capacity exceeded: id 11 is beyond max id 10"
        );
    }
}
