#![forbid(unsafe_code)]

use std::{
    fs::{self, File, OpenOptions},
    io::{ErrorKind, Read, Write},
    path::{Path, PathBuf},
};

use tracing::debug;

use crate::types::{IdError, Result};

/// Bytes handed to the writer between two [`IoLimiter`] calls.
pub const WRITE_CHUNK: usize = 64 * 1024;

/// Throttles background writes such as checkpoints.
pub trait IoLimiter: Send + Sync {
    /// Called after each chunk of `bytes` has been written; may sleep.
    fn maybe_limit(&self, bytes: usize);
}

/// [`IoLimiter`] that never throttles.
#[derive(Clone, Copy, Debug, Default)]
pub struct Unlimited;

impl IoLimiter for Unlimited {
    fn maybe_limit(&self, _bytes: usize) {}
}

/// Reads the whole file at `path`, or `None` if it does not exist.
pub fn read_file(path: &Path) -> Result<Option<Vec<u8>>> {
    let mut file = match File::open(path) {
        Ok(file) => file,
        Err(err) if err.kind() == ErrorKind::NotFound => return Ok(None),
        Err(err) => return Err(IdError::from(err)),
    };
    let mut buf = Vec::new();
    file.read_to_end(&mut buf)?;
    Ok(Some(buf))
}

/// Replaces the file at `path` with `bytes` so that a crash leaves either the
/// old or the new content.
///
/// The bytes go to a sibling `.tmp` file which is synced and renamed over the
/// target; the parent directory is synced afterwards on unix.
pub fn persist_atomically(path: &Path, bytes: &[u8], limiter: &dyn IoLimiter) -> Result<()> {
    let tmp = tmp_path(path);
    {
        let mut file = OpenOptions::new()
            .write(true)
            .create(true)
            .truncate(true)
            .open(&tmp)?;
        for chunk in bytes.chunks(WRITE_CHUNK) {
            file.write_all(chunk)?;
            limiter.maybe_limit(chunk.len());
        }
        file.sync_all()?;
    }
    fs::rename(&tmp, path)?;
    sync_parent(path)?;
    debug!(path = %path.display(), bytes = bytes.len(), "io.persist_atomically");
    Ok(())
}

fn tmp_path(path: &Path) -> PathBuf {
    let mut name = path.file_name().map(|n| n.to_os_string()).unwrap_or_default();
    name.push(".tmp");
    path.with_file_name(name)
}

#[cfg(unix)]
fn sync_parent(path: &Path) -> Result<()> {
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        File::open(parent)?.sync_all()?;
    }
    Ok(())
}

#[cfg(not(unix))]
fn sync_parent(_path: &Path) -> Result<()> {
    Ok(())
}
