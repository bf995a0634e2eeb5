use serde::{Deserialize, Serialize};

use crate::storage::DEFAULT_IDS_PER_ENTRY;
use crate::types::{IdError, Result};

/// Cache capacity, in ids, of an allocator with ordinary allocation rates.
pub const SMALL_CACHE_CAPACITY: usize = 1 << 8;
/// Cache capacity, in ids, of an allocator with high allocation rates.
pub const LARGE_CACHE_CAPACITY: usize = 1 << 13;
/// Default upper bound for allocated ids.
pub const DEFAULT_MAX_ID: u64 = (1 << 50) - 1;

/// Queue implementation backing each cache slot.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum QueueKind {
    /// Multi-producer/multi-consumer.
    #[default]
    Mpmc,
    /// Single-producer/multi-consumer; only the scanner offers.
    Spmc,
}

/// Configuration supplied when opening an [`super::IdGenerator`].
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct IdGeneratorOptions {
    /// Ids per persisted range entry; power of two, at least 64.
    pub ids_per_entry: usize,
    /// Total cache capacity in ids, split across the slot sizes.
    pub cache_capacity: usize,
    /// Contiguous run lengths the cache serves; powers of two including 1,
    /// so every free run fits some slot.
    pub slot_sizes: Vec<usize>,
    /// Queue flavour for the cache slots.
    pub queue_kind: QueueKind,
    /// Highest id that may be handed out.
    pub max_id: u64,
    /// Refuse every mutating operation.
    pub read_only: bool,
    /// Wait for ongoing scans before growing the high id.
    pub strictly_prioritize_freelist: bool,
}

impl Default for IdGeneratorOptions {
    fn default() -> Self {
        Self {
            ids_per_entry: DEFAULT_IDS_PER_ENTRY,
            cache_capacity: SMALL_CACHE_CAPACITY,
            slot_sizes: vec![1],
            queue_kind: QueueKind::Mpmc,
            max_id: DEFAULT_MAX_ID,
            read_only: false,
            strictly_prioritize_freelist: false,
        }
    }
}

impl IdGeneratorOptions {
    /// Creates options with default settings.
    pub fn new() -> Self {
        Self::default()
    }

    /// Parses options from a TOML table; missing keys keep their defaults.
    pub fn from_toml_str(text: &str) -> Result<Self> {
        let options: Self =
            toml::from_str(text).map_err(|_| IdError::Invalid("malformed id generator options"))?;
        options.validate()?;
        Ok(options)
    }

    /// Sets the number of ids per range entry.
    pub fn ids_per_entry(mut self, ids_per_entry: usize) -> Self {
        self.ids_per_entry = ids_per_entry;
        self
    }

    /// Sets the total cache capacity in ids.
    pub fn cache_capacity(mut self, capacity: usize) -> Self {
        self.cache_capacity = capacity;
        self
    }

    /// Sets the cache slot sizes.
    pub fn slot_sizes(mut self, sizes: impl Into<Vec<usize>>) -> Self {
        self.slot_sizes = sizes.into();
        self
    }

    /// Uses power-of-two slot sizes `1, 2, 4, ..` up to `max_slot_size`.
    pub fn power_of_two_slots(self, max_slot_size: usize) -> Self {
        let sizes = std::iter::successors(Some(1usize), |s| s.checked_mul(2))
            .take_while(|s| *s <= max_slot_size)
            .collect::<Vec<_>>();
        self.slot_sizes(sizes)
    }

    /// Sets the cache queue flavour.
    pub fn queue_kind(mut self, kind: QueueKind) -> Self {
        self.queue_kind = kind;
        self
    }

    /// Sets the highest id that may be allocated.
    pub fn max_id(mut self, max_id: u64) -> Self {
        self.max_id = max_id;
        self
    }

    /// Opens the allocator read-only.
    pub fn read_only(mut self, read_only: bool) -> Self {
        self.read_only = read_only;
        self
    }

    /// Makes allocation wait for ongoing scans before growing the high id.
    pub fn strictly_prioritize_freelist(mut self, enabled: bool) -> Self {
        self.strictly_prioritize_freelist = enabled;
        self
    }

    /// Checks option combinations.
    pub fn validate(&self) -> Result<()> {
        if !self.ids_per_entry.is_power_of_two() || self.ids_per_entry < 64 {
            return Err(IdError::Invalid("ids_per_entry must be a power of two of at least 64"));
        }
        if self.slot_sizes.is_empty() {
            return Err(IdError::Invalid("at least one cache slot size is required"));
        }
        if !self.slot_sizes.contains(&1) {
            return Err(IdError::Invalid("cache slot sizes must include 1"));
        }
        if self.slot_sizes.iter().any(|s| !s.is_power_of_two()) {
            return Err(IdError::Invalid("cache slot sizes must be powers of two"));
        }
        if self.slot_sizes.iter().any(|s| *s > self.ids_per_entry) {
            return Err(IdError::Invalid("cache slot sizes may not exceed ids_per_entry"));
        }
        if self.cache_capacity < self.slot_sizes.len() * 2 {
            return Err(IdError::Invalid("cache capacity too small for its slots"));
        }
        Ok(())
    }

    /// Per-slot `(slot_size, queue_capacity)` pairs sorted by slot size.
    ///
    /// Each slot gets an even share of the capacity, counted in queue
    /// entries and rounded up to a power of two.
    pub(crate) fn slot_layout(&self) -> Vec<(usize, usize)> {
        let mut sizes = self.slot_sizes.clone();
        sizes.sort_unstable();
        sizes.dedup();
        let share = (self.cache_capacity / sizes.len()).max(2);
        sizes
            .into_iter()
            .map(|size| (size, (share / size).max(2).next_power_of_two()))
            .collect()
    }
}
