use std::path::{Path, PathBuf};

use crate::types::IdError;
use thiserror::Error;

/// Error type for offline id file tools.
#[derive(Debug, Error)]
pub enum AdminError {
    /// Id file not found at the specified path.
    #[error("id file not found: {0}")]
    MissingIdFile(PathBuf),
    /// Core allocator error.
    #[error(transparent)]
    Core(#[from] IdError),
    /// Report serialization failed.
    #[error(transparent)]
    Json(#[from] serde_json::Error),
}

/// Result type alias for offline id file tools.
pub type Result<T> = std::result::Result<T, AdminError>;

impl AdminError {
    pub(crate) fn missing_id_file(path: impl AsRef<Path>) -> Self {
        AdminError::MissingIdFile(path.as_ref().to_path_buf())
    }
}
