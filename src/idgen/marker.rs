//! Scoped writers turning per-id marks into range merges.
//!
//! A marker holds the range store's single writer for its whole lifetime, so
//! all markers serialize against each other. Never allocate ids or trigger a
//! scan while holding one: the scanner needs the same writer to reserve ids.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use smallvec::SmallVec;
use tracing::trace;

use super::monitor::IdMonitor;
use crate::storage::{IdRangeLayout, IdRangeMerger, IdState, RangeDelta, RangeStore, RangeWriter};
use crate::types::{has_reserved_id_in_range, IdError, Result, RESERVED_ID};

/// Allocator state every marker reads or advances.
pub(crate) struct MarkerSource {
    store: Arc<dyn RangeStore>,
    layout: IdRangeLayout,
    generation: u64,
    needs_rebuild: bool,
    read_only: bool,
    started: AtomicBool,
    /// One past the highest id ever marked used; 0 when nothing was written.
    written_watermark: AtomicU64,
    /// Bumped whenever an id becomes FREE.
    notifier: AtomicU64,
    monitor: Arc<dyn IdMonitor>,
    default_merger: IdRangeMerger,
    recovery_merger: IdRangeMerger,
}

impl MarkerSource {
    pub(crate) fn new(
        store: Arc<dyn RangeStore>,
        generation: u64,
        needs_rebuild: bool,
        read_only: bool,
        written_watermark: u64,
        monitor: Arc<dyn IdMonitor>,
    ) -> Self {
        Self {
            layout: store.layout(),
            store,
            generation,
            needs_rebuild,
            read_only,
            started: AtomicBool::new(false),
            written_watermark: AtomicU64::new(written_watermark),
            notifier: AtomicU64::new(0),
            default_merger: IdRangeMerger::new(false, Arc::clone(&monitor)),
            recovery_merger: IdRangeMerger::new(true, Arc::clone(&monitor)),
            monitor,
        }
    }

    pub(crate) fn store(&self) -> &dyn RangeStore {
        self.store.as_ref()
    }

    pub(crate) fn layout(&self) -> IdRangeLayout {
        self.layout
    }

    pub(crate) fn generation(&self) -> u64 {
        self.generation
    }

    pub(crate) fn needs_rebuild(&self) -> bool {
        self.needs_rebuild
    }

    pub(crate) fn is_started(&self) -> bool {
        self.started.load(Ordering::Acquire)
    }

    pub(crate) fn set_started(&self) {
        self.started.store(true, Ordering::Release);
    }

    pub(crate) fn written_watermark(&self) -> u64 {
        self.written_watermark.load(Ordering::Acquire)
    }

    pub(crate) fn raise_written_watermark(&self, watermark: u64) {
        self.written_watermark.fetch_max(watermark, Ordering::AcqRel);
    }

    pub(crate) fn set_written_watermark(&self, watermark: u64) {
        self.written_watermark.store(watermark, Ordering::Release);
    }

    /// Highest id ever marked used.
    pub(crate) fn highest_written_id(&self) -> Option<u64> {
        self.written_watermark().checked_sub(1)
    }

    pub(crate) fn free_ids_notification(&self) -> u64 {
        self.notifier.load(Ordering::Acquire)
    }

    pub(crate) fn notify_free_ids(&self) {
        self.notifier.fetch_add(1, Ordering::AcqRel);
    }

    pub(crate) fn monitor(&self) -> &dyn IdMonitor {
        self.monitor.as_ref()
    }

    /// Marker for callers: a no-op before `start` when a rebuild will
    /// overwrite whatever it would write.
    pub(crate) fn marker(&self, bridge_gaps: bool) -> Result<IdRangeMarker<'_>> {
        if self.read_only {
            return Err(IdError::ReadOnly("id generator opened read-only"));
        }
        if !self.is_started() && self.needs_rebuild {
            return Ok(IdRangeMarker::noop(self));
        }
        self.locked_marker(bridge_gaps, false)
    }

    /// Marker that always writes; before `start` it merges in recovery mode.
    pub(crate) fn locked_marker(&self, bridge_gaps: bool, deletes_also_free: bool) -> Result<IdRangeMarker<'_>> {
        if self.read_only {
            return Err(IdError::ReadOnly("id generator opened read-only"));
        }
        let merger = if self.is_started() {
            &self.default_merger
        } else {
            &self.recovery_merger
        };
        let writer = self.store.writer()?;
        Ok(IdRangeMarker {
            source: self,
            writer: Some(writer),
            merger,
            bridge_gaps,
            deletes_also_free,
        })
    }
}

/// Exclusive, scoped writer of id states.
///
/// Dropping the marker releases the store writer.
pub struct IdRangeMarker<'a> {
    source: &'a MarkerSource,
    writer: Option<Box<dyn RangeWriter + 'a>>,
    merger: &'a IdRangeMerger,
    bridge_gaps: bool,
    deletes_also_free: bool,
}

impl<'a> IdRangeMarker<'a> {
    fn noop(source: &'a MarkerSource) -> Self {
        Self {
            source,
            writer: None,
            merger: &source.recovery_merger,
            bridge_gaps: false,
            deletes_also_free: false,
        }
    }

    /// Returns true if marks are discarded.
    pub fn is_noop(&self) -> bool {
        self.writer.is_none()
    }

    /// Marks `id` as used.
    pub fn mark_used(&mut self, id: u64) -> Result<()> {
        self.mark_used_range(id, 1)
    }

    /// Marks `[id, id + number_of_ids)` as used, first settling ids skipped
    /// since the highest written id when gap bridging is on.
    pub fn mark_used_range(&mut self, id: u64, number_of_ids: usize) -> Result<()> {
        if self.is_noop() || number_of_ids == 0 {
            return Ok(());
        }
        if self.bridge_gaps {
            self.bridge_gap_below(id)?;
        }
        self.apply(id, number_of_ids, IdState::Used, true)?;
        self.source.monitor().marked_as_used(id, number_of_ids);
        self.source.raise_written_watermark(id + number_of_ids as u64);
        Ok(())
    }

    /// Marks `id` as deleted.
    pub fn mark_deleted(&mut self, id: u64) -> Result<()> {
        self.mark_deleted_range(id, 1)
    }

    /// Marks `[id, id + number_of_ids)` as deleted; straight to FREE while
    /// rebuilding.
    pub fn mark_deleted_range(&mut self, id: u64, number_of_ids: usize) -> Result<()> {
        if self.is_noop() || number_of_ids == 0 {
            return Ok(());
        }
        if self.deletes_also_free {
            self.apply(id, number_of_ids, IdState::Free, false)?;
            self.source.monitor().marked_as_deleted(id, number_of_ids);
            self.source.monitor().marked_as_free(id, number_of_ids);
            self.source.notify_free_ids();
        } else {
            self.apply(id, number_of_ids, IdState::Deleted, false)?;
            self.source.monitor().marked_as_deleted(id, number_of_ids);
        }
        Ok(())
    }

    /// Marks `id` as free.
    pub fn mark_free(&mut self, id: u64) -> Result<()> {
        self.mark_free_range(id, 1)
    }

    /// Marks `[id, id + number_of_ids)` as free and wakes the scanner.
    pub fn mark_free_range(&mut self, id: u64, number_of_ids: usize) -> Result<()> {
        if self.is_noop() || number_of_ids == 0 {
            return Ok(());
        }
        self.apply(id, number_of_ids, IdState::Free, false)?;
        self.source.monitor().marked_as_free(id, number_of_ids);
        self.source.notify_free_ids();
        Ok(())
    }

    /// Marks `id` as deleted, then as free.
    pub fn mark_deleted_and_free(&mut self, id: u64) -> Result<()> {
        self.mark_deleted_and_free_range(id, 1)
    }

    /// Range form of [`Self::mark_deleted_and_free`].
    pub fn mark_deleted_and_free_range(&mut self, id: u64, number_of_ids: usize) -> Result<()> {
        self.mark_deleted_range(id, number_of_ids)?;
        if !self.deletes_also_free {
            self.mark_free_range(id, number_of_ids)?;
        }
        Ok(())
    }

    /// Marks `id` as reserved by the scanner.
    pub fn mark_reserved(&mut self, id: u64) -> Result<()> {
        self.mark_reserved_range(id, 1)
    }

    /// Marks `[id, id + number_of_ids)` as reserved.
    pub fn mark_reserved_range(&mut self, id: u64, number_of_ids: usize) -> Result<()> {
        if self.is_noop() || number_of_ids == 0 {
            return Ok(());
        }
        self.apply(id, number_of_ids, IdState::Reserved, false)?;
        self.source.monitor().marked_as_reserved(id, number_of_ids);
        Ok(())
    }

    /// Returns a reserved `id` to FREE.
    pub fn mark_unreserved(&mut self, id: u64) -> Result<()> {
        self.mark_unreserved_range(id, 1)
    }

    /// Returns reserved `[id, id + number_of_ids)` to FREE.
    pub fn mark_unreserved_range(&mut self, id: u64, number_of_ids: usize) -> Result<()> {
        if self.is_noop() || number_of_ids == 0 {
            return Ok(());
        }
        self.apply(id, number_of_ids, IdState::Free, false)?;
        self.source.monitor().marked_as_unreserved(id, number_of_ids);
        self.source.notify_free_ids();
        Ok(())
    }

    /// Settles `[watermark, id)` so no skipped id stays silently USED.
    ///
    /// Skipped ids become DELETED rather than FREE: a slower transaction may
    /// still commit one of them in this session. The next session normalizes
    /// them to FREE.
    fn bridge_gap_below(&mut self, id: u64) -> Result<()> {
        let watermark = self.source.written_watermark();
        if id <= watermark {
            return Ok(());
        }
        let state = if self.deletes_also_free {
            IdState::Free
        } else {
            IdState::Deleted
        };
        let layout = self.source.layout();
        let generation = self.source.generation();
        let merger = self.merger;
        let Some(writer) = self.writer.as_mut() else {
            return Ok(());
        };
        for_each_entry_run(layout, watermark, id, |key, runs| {
            let mut delta = RangeDelta::new(layout.ids_per_entry(), generation).bridging();
            for (offset, count) in runs {
                delta.set_run(offset, count, state);
            }
            if delta.is_empty() {
                return Ok(());
            }
            writer.merge(key, &delta, merger)
        })?;
        trace!(from = watermark, to = id, "idgen.marker.bridged");
        self.source.monitor().bridged(watermark, id - watermark);
        if state == IdState::Free {
            self.source.notify_free_ids();
        }
        Ok(())
    }

    fn apply(&mut self, id: u64, number_of_ids: usize, state: IdState, if_exists: bool) -> Result<()> {
        let layout = self.source.layout();
        let generation = self.source.generation();
        let merger = self.merger;
        let Some(writer) = self.writer.as_mut() else {
            return Ok(());
        };
        let end = id
            .checked_add(number_of_ids as u64)
            .ok_or(IdError::Invalid("id range overflows"))?;
        for_each_entry_run(layout, id, end, |key, runs| {
            let mut delta = RangeDelta::new(layout.ids_per_entry(), generation);
            for (offset, count) in runs {
                delta.set_run(offset, count, state);
            }
            if delta.is_empty() {
                return Ok(());
            }
            if if_exists {
                writer.merge_if_exists(key, &delta, merger)
            } else {
                writer.merge(key, &delta, merger)
            }
        })
    }
}

/// Splits `[from, to)` per range entry, cutting out the reserved id, and
/// calls `f` with each key and its `(offset, count)` runs.
fn for_each_entry_run<F>(layout: IdRangeLayout, from: u64, to: u64, mut f: F) -> Result<()>
where
    F: FnMut(u64, SmallVec<[(usize, usize); 2]>) -> Result<()>,
{
    let mut pos = from;
    while pos < to {
        let key = layout.range_key(pos);
        let entry_end = layout.first_id(key + 1).min(to);
        let mut runs = SmallVec::new();
        if has_reserved_id_in_range(pos, entry_end) {
            if RESERVED_ID > pos {
                runs.push((layout.offset(pos), (RESERVED_ID - pos) as usize));
            }
            if entry_end > RESERVED_ID + 1 {
                runs.push((layout.offset(RESERVED_ID + 1), (entry_end - RESERVED_ID - 1) as usize));
            }
        } else {
            runs.push((layout.offset(pos), (entry_end - pos) as usize));
        }
        f(key, runs)?;
        pos = entry_end;
    }
    Ok(())
}

/// Marker for committing transactions: used and deleted marks, with gap
/// bridging.
pub struct CommitMarker<'a>(IdRangeMarker<'a>);

impl<'a> CommitMarker<'a> {
    pub(crate) fn new(inner: IdRangeMarker<'a>) -> Self {
        Self(inner)
    }

    /// See [`IdRangeMarker::mark_used`].
    pub fn mark_used(&mut self, id: u64) -> Result<()> {
        self.0.mark_used(id)
    }

    /// See [`IdRangeMarker::mark_used_range`].
    pub fn mark_used_range(&mut self, id: u64, number_of_ids: usize) -> Result<()> {
        self.0.mark_used_range(id, number_of_ids)
    }

    /// See [`IdRangeMarker::mark_deleted`].
    pub fn mark_deleted(&mut self, id: u64) -> Result<()> {
        self.0.mark_deleted(id)
    }

    /// See [`IdRangeMarker::mark_deleted_range`].
    pub fn mark_deleted_range(&mut self, id: u64, number_of_ids: usize) -> Result<()> {
        self.0.mark_deleted_range(id, number_of_ids)
    }

    /// See [`IdRangeMarker::mark_deleted_and_free`].
    pub fn mark_deleted_and_free(&mut self, id: u64) -> Result<()> {
        self.0.mark_deleted_and_free(id)
    }

    /// See [`IdRangeMarker::mark_deleted_and_free_range`].
    pub fn mark_deleted_and_free_range(&mut self, id: u64, number_of_ids: usize) -> Result<()> {
        self.0.mark_deleted_and_free_range(id, number_of_ids)
    }
}

/// Marker for releasing ids once no reader can see them: free, reserved and
/// unreserved marks. Never bridges.
pub struct ReuseMarker<'a>(IdRangeMarker<'a>);

impl<'a> ReuseMarker<'a> {
    pub(crate) fn new(inner: IdRangeMarker<'a>) -> Self {
        Self(inner)
    }

    /// See [`IdRangeMarker::mark_free`].
    pub fn mark_free(&mut self, id: u64) -> Result<()> {
        self.0.mark_free(id)
    }

    /// See [`IdRangeMarker::mark_free_range`].
    pub fn mark_free_range(&mut self, id: u64, number_of_ids: usize) -> Result<()> {
        self.0.mark_free_range(id, number_of_ids)
    }

    /// See [`IdRangeMarker::mark_reserved`].
    pub fn mark_reserved(&mut self, id: u64) -> Result<()> {
        self.0.mark_reserved(id)
    }

    /// See [`IdRangeMarker::mark_reserved_range`].
    pub fn mark_reserved_range(&mut self, id: u64, number_of_ids: usize) -> Result<()> {
        self.0.mark_reserved_range(id, number_of_ids)
    }

    /// See [`IdRangeMarker::mark_unreserved`].
    pub fn mark_unreserved(&mut self, id: u64) -> Result<()> {
        self.0.mark_unreserved(id)
    }

    /// See [`IdRangeMarker::mark_unreserved_range`].
    pub fn mark_unreserved_range(&mut self, id: u64, number_of_ids: usize) -> Result<()> {
        self.0.mark_unreserved_range(id, number_of_ids)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::idgen::monitor::CounterMonitor;
    use crate::storage::MemoryRangeStore;

    const GEN: u64 = 3;

    fn source(started: bool, needs_rebuild: bool) -> (Arc<MemoryRangeStore>, Arc<CounterMonitor>, MarkerSource) {
        let store = Arc::new(MemoryRangeStore::new(IdRangeLayout::new(128).unwrap()));
        let monitor = Arc::new(CounterMonitor::default());
        let source = MarkerSource::new(
            Arc::clone(&store) as Arc<dyn RangeStore>,
            GEN,
            needs_rebuild,
            false,
            0,
            Arc::clone(&monitor) as Arc<dyn IdMonitor>,
        );
        if started {
            source.set_started();
        }
        (store, monitor, source)
    }

    fn state_of(store: &MemoryRangeStore, id: u64) -> IdState {
        let (_, entries) = store.snapshot();
        entries
            .iter()
            .find(|(key, _)| *key == id / 128)
            .map_or(IdState::Used, |(_, range)| range.state((id % 128) as usize))
    }

    #[test]
    fn lifecycle_marks_reach_the_store() -> Result<()> {
        let (store, monitor, source) = source(true, false);
        {
            let mut marker = source.marker(false)?;
            marker.mark_used(5)?;
            marker.mark_deleted(5)?;
        }
        assert_eq!(state_of(&store, 5), IdState::Deleted);
        let before = source.free_ids_notification();
        {
            let mut marker = source.marker(false)?;
            marker.mark_free(5)?;
        }
        assert_eq!(state_of(&store, 5), IdState::Free);
        assert!(source.free_ids_notification() > before);
        {
            let mut marker = source.marker(false)?;
            marker.mark_reserved(5)?;
            assert_eq!(state_of(&store, 5), IdState::Reserved);
            marker.mark_unreserved(5)?;
        }
        assert_eq!(state_of(&store, 5), IdState::Free);
        let snap = monitor.snapshot();
        assert_eq!(snap.marked_used, 1);
        assert_eq!(snap.marked_unreserved, 1);
        Ok(())
    }

    #[test]
    fn illegal_transition_surfaces_as_error() -> Result<()> {
        let (_store, _monitor, source) = source(true, false);
        let mut marker = source.marker(false)?;
        marker.mark_deleted(9)?;
        let err = marker.mark_deleted(9).unwrap_err();
        assert!(matches!(
            err,
            IdError::IllegalStateTransition { id: 9, from: IdState::Deleted, to: IdState::Deleted }
        ));
        Ok(())
    }

    #[test]
    fn used_bridges_skipped_ids_as_deleted() -> Result<()> {
        let (store, monitor, source) = source(true, false);
        {
            let mut marker = source.marker(true)?;
            marker.mark_used(0)?;
            marker.mark_used(200)?;
        }
        assert_eq!(state_of(&store, 0), IdState::Used);
        assert_eq!(state_of(&store, 1), IdState::Deleted);
        assert_eq!(state_of(&store, 199), IdState::Deleted);
        assert_eq!(state_of(&store, 200), IdState::Used);
        assert_eq!(source.highest_written_id(), Some(200));
        assert_eq!(monitor.snapshot().bridged, 199);
        Ok(())
    }

    #[test]
    fn bridging_leaves_settled_ids_alone() -> Result<()> {
        let (store, _monitor, source) = source(true, false);
        {
            let mut marker = source.marker(false)?;
            marker.mark_deleted_and_free(3)?;
        }
        {
            let mut marker = source.marker(true)?;
            marker.mark_used(10)?;
        }
        assert_eq!(state_of(&store, 3), IdState::Free);
        assert_eq!(state_of(&store, 4), IdState::Deleted);
        Ok(())
    }

    #[test]
    fn range_marks_span_entries_and_skip_reserved_id() -> Result<()> {
        let (store, _monitor, source) = source(true, false);
        {
            let mut marker = source.marker(false)?;
            marker.mark_deleted_range(120, 16)?;
            marker.mark_deleted_range(RESERVED_ID - 1, 3)?;
        }
        assert_eq!(state_of(&store, 120), IdState::Deleted);
        assert_eq!(state_of(&store, 135), IdState::Deleted);
        assert_eq!(state_of(&store, 136), IdState::Used);
        assert_eq!(state_of(&store, RESERVED_ID - 1), IdState::Deleted);
        assert_eq!(state_of(&store, RESERVED_ID), IdState::Used);
        assert_eq!(state_of(&store, RESERVED_ID + 1), IdState::Deleted);
        Ok(())
    }

    #[test]
    fn markers_before_start_are_noops_when_rebuilding() -> Result<()> {
        let (store, _monitor, source) = source(false, true);
        let mut marker = source.marker(true)?;
        assert!(marker.is_noop());
        marker.mark_used(100)?;
        drop(marker);
        assert!(store.is_empty());
        assert_eq!(source.highest_written_id(), None);
        Ok(())
    }

    #[test]
    fn markers_before_start_replay_in_recovery_mode() -> Result<()> {
        let (store, _monitor, source) = source(false, false);
        for _ in 0..2 {
            let mut marker = source.marker(false)?;
            marker.mark_deleted(7)?;
        }
        assert_eq!(state_of(&store, 7), IdState::Deleted);
        Ok(())
    }

    #[test]
    fn read_only_source_refuses_markers() {
        let store = Arc::new(MemoryRangeStore::new(IdRangeLayout::new(128).unwrap()));
        let source = MarkerSource::new(store, GEN, false, true, 0, Arc::new(crate::idgen::NoopMonitor));
        assert!(matches!(source.marker(true), Err(IdError::ReadOnly(_))));
    }
}
