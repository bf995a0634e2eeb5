use std::fmt;
use std::path::Path;

use serde::Serialize;

use crate::storage::{IdRange, IdState, RangeStore, StoreHeader};

use crate::admin::options::AdminOpenOptions;
use crate::admin::util::open_store;
use crate::admin::Result;

/// Non-USED ids of one persisted entry.
#[derive(Clone, Debug, Serialize)]
pub struct DumpEntry {
    /// Range key.
    pub key: u64,
    /// First id covered by the entry.
    pub first_id: u64,
    /// Generation the entry was last written in.
    pub generation: u64,
    /// Ids in DELETED.
    pub deleted: Vec<u64>,
    /// Ids in FREE.
    pub free: Vec<u64>,
    /// Ids in RESERVED.
    pub reserved: Vec<u64>,
}

/// Totals over every entry.
#[derive(Clone, Debug, Default, Serialize)]
pub struct DumpCounts {
    /// Persisted entries.
    pub entries: u64,
    /// Deleted, not yet available for reuse.
    pub deleted_not_freed: u64,
    /// Deleted and available for reuse.
    pub deleted_and_freed: u64,
    /// Reserved by a scanner when the file was written.
    pub reserved: u64,
}

/// Contents of an id file.
#[derive(Clone, Debug, Serialize)]
pub struct DumpReport {
    /// Location of the file.
    pub path: String,
    /// Entry width.
    pub ids_per_entry: usize,
    /// Allocator header; `None` means the next open rebuilds.
    pub header: Option<StoreHeader>,
    /// Totals.
    pub counts: DumpCounts,
    /// Entries in key order.
    pub entries: Vec<DumpEntry>,
}

impl DumpReport {
    /// Renders the report as pretty-printed JSON.
    pub fn to_json(&self) -> Result<String> {
        Ok(serde_json::to_string_pretty(self)?)
    }
}

impl fmt::Display for DumpReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "id file: {}", self.path)?;
        writeln!(f, "ids per entry: {}", self.ids_per_entry)?;
        match &self.header {
            Some(header) => {
                writeln!(f, "high id: {}", header.high_id)?;
                match header.highest_written_id {
                    Some(id) => writeln!(f, "highest written id: {id}")?,
                    None => writeln!(f, "highest written id: none")?,
                }
                writeln!(f, "generation: {}", header.generation)?;
            }
            None => writeln!(f, "no header, rebuilt on next open")?,
        }
        for entry in &self.entries {
            writeln!(
                f,
                "[{}] ids {}.. generation {}: deleted {:?} free {:?} reserved {:?}",
                entry.key, entry.first_id, entry.generation, entry.deleted, entry.free, entry.reserved
            )?;
        }
        writeln!(f, "deleted and available for reuse: {}", self.counts.deleted_and_freed)?;
        writeln!(f, "deleted, not yet available for reuse: {}", self.counts.deleted_not_freed)?;
        write!(f, "reserved: {}", self.counts.reserved)
    }
}

/// Reads the id file at `path` without modifying it.
pub fn dump(path: impl AsRef<Path>, opts: &AdminOpenOptions) -> Result<DumpReport> {
    let path = path.as_ref();
    let store = open_store(path, opts)?;
    let layout = store.layout();
    let mut counts = DumpCounts::default();
    let mut entries = Vec::new();
    store.visit(&mut |key: u64, range: &IdRange| -> crate::types::Result<()> {
        let first_id = layout.first_id(key);
        let mut entry = DumpEntry {
            key,
            first_id,
            generation: range.generation(),
            deleted: Vec::new(),
            free: Vec::new(),
            reserved: Vec::new(),
        };
        for offset in 0..layout.ids_per_entry() {
            let id = first_id + offset as u64;
            match range.state(offset) {
                IdState::Used => {}
                IdState::Deleted => entry.deleted.push(id),
                IdState::Free => entry.free.push(id),
                IdState::Reserved => entry.reserved.push(id),
            }
        }
        counts.entries += 1;
        counts.deleted_not_freed += entry.deleted.len() as u64;
        counts.deleted_and_freed += entry.free.len() as u64;
        counts.reserved += entry.reserved.len() as u64;
        entries.push(entry);
        Ok(())
    })?;
    Ok(DumpReport {
        path: path.display().to_string(),
        ids_per_entry: layout.ids_per_entry(),
        header: store.header(),
        counts,
        entries,
    })
}
