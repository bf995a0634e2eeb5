use crate::storage::DEFAULT_IDS_PER_ENTRY;

/// Options used when opening an id file for offline inspection.
#[derive(Clone, Debug)]
pub struct AdminOpenOptions {
    /// Entry width the file was created with.
    pub ids_per_entry: usize,
}

impl Default for AdminOpenOptions {
    fn default() -> Self {
        Self {
            ids_per_entry: DEFAULT_IDS_PER_ENTRY,
        }
    }
}
