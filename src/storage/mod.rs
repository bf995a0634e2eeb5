//! Persisted id range state: per-id bit encoding, the allocator header and
//! the range stores.

/// Allocator header persisted with each checkpoint.
pub mod header;
/// Bit-pair encoding of id states and the generation-aware merger.
pub mod range;
/// Range store contract plus in-memory and file-backed implementations.
pub mod store;

pub use header::StoreHeader;
pub use range::{
    IdRange, IdRangeLayout, IdRangeMerger, IdState, RangeDelta, DEFAULT_IDS_PER_ENTRY,
    STARTING_GENERATION,
};
pub use store::{
    FileRangeStore, MemoryRangeStore, RangeSeeker, RangeStore, RangeVisitor, RangeWriter,
};
