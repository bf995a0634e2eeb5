#![forbid(unsafe_code)]

//! Offline inspection of id files.
//!
//! These tools open an id file read-only without starting an allocator, so
//! they never rebuild, normalize or checkpoint it.

mod dump;
mod error;
mod options;
mod util;
mod verify;

/// Human and JSON readable listing of an id file.
pub use dump::{dump, DumpCounts, DumpEntry, DumpReport};

/// Error types for offline tools.
pub use error::{AdminError, Result};

/// Configuration options for opening an id file offline.
pub use options::AdminOpenOptions;

/// Consistency check of an id file against its own header.
pub use verify::verify;

/// Read-only store opening shared by the tools.
pub use util::open_store;
