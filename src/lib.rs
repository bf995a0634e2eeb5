//! Crash-safe id allocation for record stores.
//!
//! [`IdGenerator`] hands out `u64` ids, tracks deleted ids in a persisted
//! range store and reuses them once they are freed. The store survives
//! crashes: a header-less file is rebuilt from the owner's records, and
//! marks made after the last checkpoint are replayed by recovery.

#![warn(missing_docs)]

pub mod admin;
pub mod idgen;
pub mod primitives;
pub mod storage;
pub mod types;

pub use idgen::{
    CommitMarker, ConsistencyReport, CounterMonitor, DeletedIds, FreeIds, IdBatch, IdGenerator,
    IdGeneratorOptions, IdMonitor, IdRangeMarker, NoFreeIds, NoopMonitor, ReuseMarker, UsedIds,
};
pub use primitives::io::{IoLimiter, Unlimited};
pub use types::{IdError, Result, NO_ID, RESERVED_ID};
