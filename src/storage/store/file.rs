use std::collections::BTreeMap;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};

use tracing::{debug, info};

use super::{MemoryRangeStore, RangeSeeker, RangeStore, RangeVisitor, RangeWriter};
use crate::primitives::io::{persist_atomically, read_file, IoLimiter, Unlimited};
use crate::storage::header::{fixed, Prologue, StoreHeader, HEADER_LEN};
use crate::storage::range::{IdRange, IdRangeLayout};
use crate::types::{snapshot_crc32, Checksum, Crc32Fast, IdError, Result};

const CRC_LEN: usize = 4;

/// [`RangeStore`] persisted as a single snapshot file.
///
/// Merges are applied to an in-memory working set; `checkpoint` rewrites the
/// whole file atomically. Anything merged after the last checkpoint is lost
/// on crash and is expected to be replayed by recovery.
pub struct FileRangeStore {
    path: PathBuf,
    inner: MemoryRangeStore,
}

impl FileRangeStore {
    /// Opens the store at `path`, creating an empty header-less file when it
    /// is missing and `read_only` is false.
    pub fn open(path: impl AsRef<Path>, layout: IdRangeLayout, read_only: bool) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        match read_file(&path)? {
            Some(bytes) => {
                let (prologue, entries) = decode(&bytes)?;
                if prologue.ids_per_entry as usize != layout.ids_per_entry() {
                    return Err(IdError::IllegalState(
                        "id file was created with a different ids_per_entry",
                    ));
                }
                debug!(
                    path = %path.display(),
                    entries = entries.len(),
                    has_header = prologue.header.is_some(),
                    "range_store.open"
                );
                Ok(Self {
                    path,
                    inner: MemoryRangeStore::with_contents(layout, entries, prologue.header, read_only),
                })
            }
            None if read_only => Err(IdError::NotFound {
                source: std::io::Error::new(ErrorKind::NotFound, "id file missing in read-only mode"),
                path,
            }),
            None => {
                let store = Self {
                    path,
                    inner: MemoryRangeStore::new(layout),
                };
                store.persist(&Unlimited)?;
                info!(path = %store.path.display(), "range_store.created");
                Ok(store)
            }
        }
    }

    /// Location of the snapshot file.
    pub fn path(&self) -> &Path {
        &self.path
    }

    fn persist(&self, limiter: &dyn IoLimiter) -> Result<()> {
        let (header, entries) = self.inner.snapshot();
        let bytes = encode(self.inner.layout, header, &entries)?;
        persist_atomically(&self.path, &bytes, limiter)
    }
}

impl RangeStore for FileRangeStore {
    fn layout(&self) -> IdRangeLayout {
        self.inner.layout()
    }

    fn header(&self) -> Option<StoreHeader> {
        self.inner.header()
    }

    fn is_read_only(&self) -> bool {
        self.inner.is_read_only()
    }

    fn writer(&self) -> Result<Box<dyn RangeWriter + '_>> {
        self.inner.writer()
    }

    fn seek(&self, from_key: u64, to_key: u64) -> Result<Box<dyn RangeSeeker + '_>> {
        self.inner.seek(from_key, to_key)
    }

    fn visit(&self, visitor: &mut dyn RangeVisitor) -> Result<()> {
        self.inner.visit(visitor)
    }

    fn checkpoint(&self, header: Option<&StoreHeader>, limiter: &dyn IoLimiter) -> Result<()> {
        if self.inner.read_only {
            return Ok(());
        }
        let _writer = self.inner.writer_lock.lock();
        self.inner.set_header(header);
        self.persist(limiter)
    }

    fn close(&self) -> Result<()> {
        self.inner.close()
    }
}

fn encode(layout: IdRangeLayout, header: Option<StoreHeader>, entries: &[(u64, IdRange)]) -> Result<Vec<u8>> {
    let words = layout.words();
    let entry_len = 16 + words * 16;
    let mut buf = vec![0u8; HEADER_LEN + entries.len() * entry_len + CRC_LEN];
    let ids_per_entry = u32::try_from(layout.ids_per_entry())
        .map_err(|_| IdError::Invalid("ids_per_entry exceeds u32::MAX"))?;
    Prologue {
        ids_per_entry,
        header,
        entry_count: entries.len() as u64,
    }
    .write(&mut buf[..HEADER_LEN])?;

    let mut off = HEADER_LEN;
    for (key, range) in entries {
        put_u64(&mut buf, &mut off, *key);
        put_u64(&mut buf, &mut off, range.generation());
        for word in range.commit_words().iter().chain(range.reuse_words()) {
            put_u64(&mut buf, &mut off, *word);
        }
    }
    let mut crc = Crc32Fast::default();
    crc.update(&ids_per_entry.to_be_bytes());
    crc.update(&buf[..off]);
    buf[off..off + CRC_LEN].copy_from_slice(&crc.finalize().to_be_bytes());
    Ok(buf)
}

fn decode(bytes: &[u8]) -> Result<(Prologue, BTreeMap<u64, IdRange>)> {
    let prologue = Prologue::read(bytes)?;
    let layout = IdRangeLayout::new(prologue.ids_per_entry as usize)
        .map_err(|_| IdError::Corruption("id file has an invalid ids_per_entry"))?;
    let words = layout.words();
    let entry_len = 16 + words * 16;
    let body_len = usize::try_from(prologue.entry_count)
        .ok()
        .and_then(|n| n.checked_mul(entry_len))
        .and_then(|n| n.checked_add(HEADER_LEN))
        .ok_or(IdError::Corruption("id file entry count overflows"))?;
    if bytes.len() != body_len + CRC_LEN {
        return Err(IdError::Corruption("id file length does not match its entry count"));
    }
    let stored = u32::from_be_bytes(fixed(bytes, body_len..body_len + CRC_LEN)?);
    if stored != snapshot_crc32(prologue.ids_per_entry, &bytes[..body_len]) {
        return Err(IdError::Corruption("id file checksum mismatch"));
    }

    let mut entries = BTreeMap::new();
    let mut off = HEADER_LEN;
    let mut commit = vec![0u64; words];
    let mut reuse = vec![0u64; words];
    for _ in 0..prologue.entry_count {
        let key = get_u64(bytes, &mut off)?;
        let generation = get_u64(bytes, &mut off)?;
        for word in commit.iter_mut().chain(reuse.iter_mut()) {
            *word = get_u64(bytes, &mut off)?;
        }
        if entries
            .insert(key, IdRange::from_words(generation, &commit, &reuse))
            .is_some()
        {
            return Err(IdError::Corruption("duplicate range key in id file"));
        }
    }
    Ok((prologue, entries))
}

fn put_u64(buf: &mut [u8], off: &mut usize, value: u64) {
    buf[*off..*off + 8].copy_from_slice(&value.to_be_bytes());
    *off += 8;
}

fn get_u64(buf: &[u8], off: &mut usize) -> Result<u64> {
    let value = u64::from_be_bytes(fixed(buf, *off..*off + 8)?);
    *off += 8;
    Ok(value)
}
