use std::path::Path;

use crate::storage::{FileRangeStore, IdRangeLayout};
use crate::types::IdError;

use crate::admin::options::AdminOpenOptions;
use crate::admin::{AdminError, Result};

/// Opens an existing id file read-only; never creates one.
pub fn open_store(path: &Path, opts: &AdminOpenOptions) -> Result<FileRangeStore> {
    let layout = IdRangeLayout::new(opts.ids_per_entry)?;
    match FileRangeStore::open(path, layout, true) {
        Ok(store) => Ok(store),
        Err(IdError::NotFound { .. }) => Err(AdminError::missing_id_file(path)),
        Err(err) => Err(err.into()),
    }
}
