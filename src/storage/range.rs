//! Per-id state encoding inside fixed-size id range entries.
//!
//! Every id owns two bits, one in the `commit` bitset and one in the `reuse`
//! bitset of the entry covering it:
//!
//! | commit | reuse | state    |
//! |--------|-------|----------|
//! | 0      | 0     | USED     |
//! | 1      | 0     | DELETED  |
//! | 1      | 1     | FREE     |
//! | 0      | 1     | RESERVED |
//!
//! Untouched bits decode to USED, so a missing entry means "all in use".
//! RESERVED only lives within one generation; normalization folds it (and
//! DELETED) into FREE once the entry is seen from a newer generation.

use std::sync::Arc;

use serde::Serialize;
use smallvec::{smallvec, SmallVec};

use crate::idgen::IdMonitor;
use crate::types::{IdError, Result};

/// Default number of ids covered by one range entry.
pub const DEFAULT_IDS_PER_ENTRY: usize = 128;

/// Generation a brand new store would have had before its first session.
pub const STARTING_GENERATION: u64 = 1;

const WORD_BITS: usize = u64::BITS as usize;

type Words = SmallVec<[u64; 4]>;

/// Lifecycle state of a single id.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum IdState {
    /// In use, or never written.
    Used,
    /// Deleted by a committed transaction, not yet safe to reuse.
    Deleted,
    /// Deleted and released for reuse.
    Free,
    /// Picked up by the scanner and handed to the cache.
    Reserved,
}

impl IdState {
    #[inline]
    pub(crate) fn from_bits(commit: bool, reuse: bool) -> Self {
        match (commit, reuse) {
            (false, false) => IdState::Used,
            (true, false) => IdState::Deleted,
            (true, true) => IdState::Free,
            (false, true) => IdState::Reserved,
        }
    }

    #[inline]
    pub(crate) fn bits(self) -> (bool, bool) {
        match self {
            IdState::Used => (false, false),
            IdState::Deleted => (true, false),
            IdState::Free => (true, true),
            IdState::Reserved => (false, true),
        }
    }

    /// Returns whether a non-recovery merge may move an id from `self` to `to`.
    pub fn can_transition_to(self, to: IdState) -> bool {
        use IdState::*;
        match (self, to) {
            (Used, Used) | (Used, Deleted) => true,
            (Used, Free) | (Used, Reserved) => false,
            (Deleted, Used) | (Deleted, Free) => true,
            (Deleted, Deleted) | (Deleted, Reserved) => false,
            (Free, _) => true,
            (Reserved, Used) | (Reserved, Free) => true,
            (Reserved, Deleted) | (Reserved, Reserved) => false,
        }
    }
}

/// Maps ids to range keys and offsets for a fixed entry width.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct IdRangeLayout {
    ids_per_entry: usize,
}

impl IdRangeLayout {
    /// Creates a layout; `ids_per_entry` must be a power of two and at least 64.
    pub fn new(ids_per_entry: usize) -> Result<Self> {
        if !ids_per_entry.is_power_of_two() || ids_per_entry < WORD_BITS {
            return Err(IdError::Invalid(
                "ids_per_entry must be a power of two of at least 64",
            ));
        }
        Ok(Self { ids_per_entry })
    }

    /// Number of ids covered by one entry.
    #[inline]
    pub fn ids_per_entry(&self) -> usize {
        self.ids_per_entry
    }

    /// Key of the entry covering `id`.
    #[inline]
    pub fn range_key(&self, id: u64) -> u64 {
        id / self.ids_per_entry as u64
    }

    /// Offset of `id` inside its entry.
    #[inline]
    pub fn offset(&self, id: u64) -> usize {
        (id % self.ids_per_entry as u64) as usize
    }

    /// First id covered by the entry at `key`.
    #[inline]
    pub fn first_id(&self, key: u64) -> u64 {
        key * self.ids_per_entry as u64
    }

    pub(crate) fn words(&self) -> usize {
        self.ids_per_entry / WORD_BITS
    }
}

/// Persisted value for one range key.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct IdRange {
    generation: u64,
    commit: Words,
    reuse: Words,
}

impl IdRange {
    /// Creates an all-USED entry stamped with `generation`.
    pub fn new(ids_per_entry: usize, generation: u64) -> Self {
        let words = ids_per_entry / WORD_BITS;
        Self {
            generation,
            commit: smallvec![0; words],
            reuse: smallvec![0; words],
        }
    }

    pub(crate) fn from_words(generation: u64, commit: &[u64], reuse: &[u64]) -> Self {
        Self {
            generation,
            commit: Words::from_slice(commit),
            reuse: Words::from_slice(reuse),
        }
    }

    /// Generation of the last non-recovery merge into this entry.
    pub fn generation(&self) -> u64 {
        self.generation
    }

    /// Number of ids this entry covers.
    pub fn ids_per_entry(&self) -> usize {
        self.commit.len() * WORD_BITS
    }

    /// Decodes the state of the id at `offset`.
    pub fn state(&self, offset: usize) -> IdState {
        let (word, mask) = bit(offset);
        IdState::from_bits(self.commit[word] & mask != 0, self.reuse[word] & mask != 0)
    }

    /// Returns true if every id in the entry is USED.
    pub fn is_empty(&self) -> bool {
        self.commit.iter().chain(self.reuse.iter()).all(|w| *w == 0)
    }

    /// Folds every non-USED id into FREE.
    pub fn normalize(&mut self) {
        for (commit, reuse) in self.commit.iter_mut().zip(self.reuse.iter_mut()) {
            let any = *commit | *reuse;
            *commit = any;
            *reuse = any;
        }
    }

    pub(crate) fn commit_words(&self) -> &[u64] {
        &self.commit
    }

    pub(crate) fn reuse_words(&self) -> &[u64] {
        &self.reuse
    }

    /// Bitmask of reusable ids in word `word`.
    ///
    /// A `stale` entry was last merged in an older generation: anything not
    /// USED in it was settled before that session ended, so its normalized
    /// view (every non-USED id is free) applies.
    pub(crate) fn reusable_word(&self, word: usize, stale: bool) -> u64 {
        if stale {
            self.commit[word] | self.reuse[word]
        } else {
            self.commit[word] & self.reuse[word]
        }
    }

    fn merge_from(&mut self, key: u64, delta: &RangeDelta, recovery: bool) -> Result<()> {
        let ids_per_entry = self.ids_per_entry() as u64;
        let mut applied: Words = delta.touched.clone();
        if !recovery || delta.bridge {
            for (w, touched) in delta.touched.iter().enumerate() {
                let mut bits = *touched;
                while bits != 0 {
                    let b = bits.trailing_zeros() as usize;
                    bits &= bits - 1;
                    let mask = 1u64 << b;
                    let from = IdState::from_bits(self.commit[w] & mask != 0, self.reuse[w] & mask != 0);
                    if delta.bridge {
                        if from != IdState::Used {
                            applied[w] &= !mask;
                        }
                        continue;
                    }
                    let to = IdState::from_bits(delta.commit[w] & mask != 0, delta.reuse[w] & mask != 0);
                    if !from.can_transition_to(to) {
                        let id = key * ids_per_entry + (w * WORD_BITS + b) as u64;
                        return Err(IdError::IllegalStateTransition { id, from, to });
                    }
                }
            }
        }
        for (w, mask) in applied.iter().enumerate() {
            self.commit[w] = (self.commit[w] & !mask) | (delta.commit[w] & mask);
            self.reuse[w] = (self.reuse[w] & !mask) | (delta.reuse[w] & mask);
        }
        Ok(())
    }
}

/// Sparse change to one range entry: only `touched` ids are modified.
#[derive(Clone, Debug)]
pub struct RangeDelta {
    generation: u64,
    touched: Words,
    commit: Words,
    reuse: Words,
    bridge: bool,
}

impl RangeDelta {
    /// Creates an empty delta for an entry width, stamped with `generation`.
    pub fn new(ids_per_entry: usize, generation: u64) -> Self {
        let words = ids_per_entry / WORD_BITS;
        Self {
            generation,
            touched: smallvec![0; words],
            commit: smallvec![0; words],
            reuse: smallvec![0; words],
            bridge: false,
        }
    }

    /// Marks this delta as gap bridging: it only settles ids still USED and
    /// leaves everything else untouched.
    pub fn bridging(mut self) -> Self {
        self.bridge = true;
        self
    }

    /// Generation the merge stamps on the entry.
    pub fn generation(&self) -> u64 {
        self.generation
    }

    /// Requests `count` ids starting at `offset` to move to `state`.
    pub fn set_run(&mut self, offset: usize, count: usize, state: IdState) {
        let (commit, reuse) = state.bits();
        let mut pos = offset;
        let end = offset + count;
        while pos < end {
            let w = pos / WORD_BITS;
            let lo = pos % WORD_BITS;
            let n = (WORD_BITS - lo).min(end - pos);
            let mask = if n == WORD_BITS { u64::MAX } else { ((1u64 << n) - 1) << lo };
            self.touched[w] |= mask;
            if commit {
                self.commit[w] |= mask;
            } else {
                self.commit[w] &= !mask;
            }
            if reuse {
                self.reuse[w] |= mask;
            } else {
                self.reuse[w] &= !mask;
            }
            pos += n;
        }
    }

    /// Requests the id at `offset` to move to `state`.
    pub fn set(&mut self, offset: usize, state: IdState) {
        self.set_run(offset, 1, state);
    }

    /// Returns true if the delta touches no id.
    pub fn is_empty(&self) -> bool {
        self.touched.iter().all(|w| *w == 0)
    }
}

/// Generation-aware merge function applied by range store writers.
#[derive(Clone)]
pub struct IdRangeMerger {
    recovery: bool,
    monitor: Arc<dyn IdMonitor>,
}

impl IdRangeMerger {
    /// Creates a merger; `recovery` disables verification and normalization.
    pub fn new(recovery: bool, monitor: Arc<dyn IdMonitor>) -> Self {
        Self { recovery, monitor }
    }

    /// Returns true for the recovery merger.
    pub fn is_recovery(&self) -> bool {
        self.recovery
    }

    /// Applies `delta` on top of `existing`.
    ///
    /// On error `existing` may already be normalized but no touched id has
    /// changed state.
    pub fn merge(&self, key: u64, existing: &mut IdRange, delta: &RangeDelta) -> Result<()> {
        if !self.recovery && existing.generation != delta.generation {
            existing.normalize();
            existing.generation = delta.generation;
            self.monitor.normalized(key);
        }
        existing.merge_from(key, delta, self.recovery)
    }
}

#[inline]
fn bit(offset: usize) -> (usize, u64) {
    (offset / WORD_BITS, 1u64 << (offset % WORD_BITS))
}
