use std::convert::TryInto;
use std::ops::Range;

use serde::Serialize;

use crate::types::{IdError, Result, NO_ID};

pub(crate) const MAGIC: &[u8; 8] = b"SMBRAIDS";
pub(crate) const FORMAT_VERSION: u16 = 1;

const HDR_MAGIC: Range<usize> = 0..8;
const HDR_VERSION: Range<usize> = 8..10;
const HDR_FLAGS: Range<usize> = 10..12;
const HDR_IDS_PER_ENTRY: Range<usize> = 12..16;
const HDR_HIGH_ID: Range<usize> = 16..24;
const HDR_HIGHEST_WRITTEN: Range<usize> = 24..32;
const HDR_GENERATION: Range<usize> = 32..40;
const HDR_ENTRY_COUNT: Range<usize> = 40..48;

/// Bytes occupied by the fixed file prologue.
pub(crate) const HEADER_LEN: usize = 48;

const FLAG_HAS_HEADER: u16 = 1;

/// Allocator state persisted at checkpoint.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
pub struct StoreHeader {
    /// Next id that has never been handed out.
    pub high_id: u64,
    /// Highest id ever marked used, if any.
    pub highest_written_id: Option<u64>,
    /// Generation of the session that wrote this header.
    pub generation: u64,
    /// Entry width the store was created with.
    pub ids_per_entry: u32,
}

/// Decoded file prologue: the entry width, the optional allocator header and
/// how many entries follow.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) struct Prologue {
    pub ids_per_entry: u32,
    pub header: Option<StoreHeader>,
    pub entry_count: u64,
}

impl Prologue {
    pub(crate) fn write(&self, dst: &mut [u8]) -> Result<()> {
        if dst.len() < HEADER_LEN {
            return Err(IdError::Invalid("header buffer too small"));
        }
        dst[..HEADER_LEN].fill(0);
        dst[HDR_MAGIC].copy_from_slice(MAGIC);
        dst[HDR_VERSION].copy_from_slice(&FORMAT_VERSION.to_be_bytes());
        dst[HDR_IDS_PER_ENTRY].copy_from_slice(&self.ids_per_entry.to_be_bytes());
        dst[HDR_ENTRY_COUNT].copy_from_slice(&self.entry_count.to_be_bytes());
        if let Some(header) = &self.header {
            dst[HDR_FLAGS].copy_from_slice(&FLAG_HAS_HEADER.to_be_bytes());
            dst[HDR_HIGH_ID].copy_from_slice(&header.high_id.to_be_bytes());
            let written = header.highest_written_id.unwrap_or(NO_ID);
            dst[HDR_HIGHEST_WRITTEN].copy_from_slice(&written.to_be_bytes());
            dst[HDR_GENERATION].copy_from_slice(&header.generation.to_be_bytes());
        }
        Ok(())
    }

    pub(crate) fn read(src: &[u8]) -> Result<Self> {
        if src.len() < HEADER_LEN {
            return Err(IdError::Corruption("id file shorter than its header"));
        }
        if &src[HDR_MAGIC] != MAGIC {
            return Err(IdError::Corruption("invalid id file magic"));
        }
        if u16::from_be_bytes(fixed(src, HDR_VERSION)?) != FORMAT_VERSION {
            return Err(IdError::Corruption("unsupported id file version"));
        }
        let flags = u16::from_be_bytes(fixed(src, HDR_FLAGS)?);
        let ids_per_entry = u32::from_be_bytes(fixed(src, HDR_IDS_PER_ENTRY)?);
        let entry_count = u64::from_be_bytes(fixed(src, HDR_ENTRY_COUNT)?);
        let header = if flags & FLAG_HAS_HEADER != 0 {
            let written = u64::from_be_bytes(fixed(src, HDR_HIGHEST_WRITTEN)?);
            Some(StoreHeader {
                high_id: u64::from_be_bytes(fixed(src, HDR_HIGH_ID)?),
                highest_written_id: (written != NO_ID).then_some(written),
                generation: u64::from_be_bytes(fixed(src, HDR_GENERATION)?),
                ids_per_entry,
            })
        } else {
            None
        };
        Ok(Self {
            ids_per_entry,
            header,
            entry_count,
        })
    }
}

pub(crate) fn fixed<const N: usize>(src: &[u8], range: Range<usize>) -> Result<[u8; N]> {
    src.get(range)
        .and_then(|slice| slice.try_into().ok())
        .ok_or(IdError::Corruption("truncated id file field"))
}
