use crate::storage::{IdRange, IdRangeLayout, IdState, RangeSeeker, RangeStore};
use crate::types::{IdError, Result};

/// Iterator over persisted ids in `[from, to)` whose raw state passes a
/// filter.
///
/// Reads the store lazily, one entry at a time, so entries merged while
/// iterating may or may not be observed.
pub struct IdStateIter<'a> {
    seeker: Box<dyn RangeSeeker + 'a>,
    layout: IdRangeLayout,
    current: Option<(u64, IdRange)>,
    next_offset: usize,
    from: u64,
    to: u64,
    filter: fn(IdState) -> bool,
    done: bool,
}

impl<'a> IdStateIter<'a> {
    pub(crate) fn new(
        store: &'a dyn RangeStore,
        from: u64,
        to: u64,
        filter: fn(IdState) -> bool,
    ) -> Result<Self> {
        if from > to {
            return Err(IdError::Invalid("id iteration requires from <= to"));
        }
        let layout = store.layout();
        let to_key = layout.range_key(to).saturating_add(1);
        Ok(Self {
            seeker: store.seek(layout.range_key(from), to_key)?,
            layout,
            current: None,
            next_offset: 0,
            from,
            to,
            filter,
            done: from == to,
        })
    }

    /// Ids that are anything but USED.
    pub(crate) fn not_used(store: &'a dyn RangeStore, from: u64, to: u64) -> Result<Self> {
        Self::new(store, from, to, |state| state != IdState::Used)
    }

    /// Ids that are FREE.
    pub(crate) fn free(store: &'a dyn RangeStore, from: u64, to: u64) -> Result<Self> {
        Self::new(store, from, to, |state| state == IdState::Free)
    }

    fn advance(&mut self) -> Result<Option<u64>> {
        while !self.done {
            let Some((key, range)) = &self.current else {
                match self.seeker.next()? {
                    Some(entry) => {
                        self.current = Some(entry);
                        self.next_offset = 0;
                    }
                    None => self.done = true,
                }
                continue;
            };
            let base = self.layout.first_id(*key);
            while self.next_offset < self.layout.ids_per_entry() {
                let offset = self.next_offset;
                self.next_offset += 1;
                let id = base + offset as u64;
                if id >= self.to {
                    self.done = true;
                    return Ok(None);
                }
                if id >= self.from && (self.filter)(range.state(offset)) {
                    return Ok(Some(id));
                }
            }
            self.current = None;
        }
        Ok(None)
    }
}

impl Iterator for IdStateIter<'_> {
    type Item = Result<u64>;

    fn next(&mut self) -> Option<Self::Item> {
        match self.advance() {
            Ok(Some(id)) => Some(Ok(id)),
            Ok(None) => None,
            Err(err) => {
                self.done = true;
                Some(Err(err))
            }
        }
    }
}
