#![allow(missing_docs)]

#[path = "../common/mod.rs"]
mod common;

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use sombra_ids::idgen::{CounterMonitor, IdGeneratorOptions};
use sombra_ids::{DeletedIds, FreeIds, NoFreeIds, Result, Unlimited};
use tempfile::tempdir;

use common::{open, open_with};

struct CountingFreeIds(AtomicUsize);

impl FreeIds for CountingFreeIds {
    fn accept(&self, _visitor: &mut dyn FnMut(u64, usize) -> Result<()>) -> Result<Option<u64>> {
        self.0.fetch_add(1, Ordering::SeqCst);
        Ok(None)
    }
}

#[test]
fn first_open_rebuilds_from_free_ids() -> Result<()> {
    let dir = tempdir()?;
    let path = dir.path().join("nodes.id");
    let generator = open(&path)?;
    assert!(generator.needs_rebuild());
    generator.start(&DeletedIds(&[10, 20, 30]))?;
    assert_eq!(generator.high_id(), 31);
    assert_eq!(generator.next_id()?, 10);
    assert_eq!(generator.next_id()?, 20);
    assert_eq!(generator.next_id()?, 30);
    assert_eq!(generator.next_id()?, 31);
    generator.checkpoint(&Unlimited)?;
    generator.close()?;

    let reopened = open(&path)?;
    assert!(!reopened.needs_rebuild());
    assert_eq!(reopened.high_id(), 32);
    reopened.close()?;
    Ok(())
}

#[test]
fn checkpointed_store_is_not_rebuilt() -> Result<()> {
    let dir = tempdir()?;
    let path = dir.path().join("rels.id");
    let first_session = CountingFreeIds(AtomicUsize::new(0));
    let generator = open(&path)?;
    generator.start(&first_session)?;
    generator.checkpoint(&Unlimited)?;
    generator.close()?;
    assert_eq!(first_session.0.load(Ordering::SeqCst), 1);

    let second_session = CountingFreeIds(AtomicUsize::new(0));
    let generator = open(&path)?;
    generator.start(&second_session)?;
    generator.close()?;
    assert_eq!(second_session.0.load(Ordering::SeqCst), 0);
    Ok(())
}

#[test]
fn crash_before_first_checkpoint_forces_rebuild() -> Result<()> {
    let dir = tempdir()?;
    let path = dir.path().join("labels.id");
    let generator = open(&path)?;
    generator.start(&NoFreeIds)?;
    let id = generator.next_id()?;
    generator.marker()?.mark_used(id)?;
    generator.close()?;

    let reopened = open(&path)?;
    assert!(reopened.needs_rebuild());
    reopened.close()?;
    Ok(())
}

#[test]
fn reused_then_committed_id_is_not_reused_after_restart() -> Result<()> {
    let dir = tempdir()?;
    let path = dir.path().join("props.id");
    let generator = open(&path)?;
    generator.start(&NoFreeIds)?;
    let id = generator.next_id()?;
    generator.commit_marker()?.mark_used(id)?;
    generator.checkpoint(&Unlimited)?;

    generator.commit_marker()?.mark_deleted(id)?;
    generator.reuse_marker()?.mark_free(id)?;
    generator.maintenance()?;
    assert_eq!(generator.next_id()?, id);
    generator.commit_marker()?.mark_used(id)?;
    generator.checkpoint(&Unlimited)?;
    generator.close()?;

    let reopened = open(&path)?;
    reopened.start(&NoFreeIds)?;
    assert_ne!(reopened.next_id()?, id);
    assert_eq!(reopened.unused_id_count()?, 0);
    reopened.close()?;
    Ok(())
}

#[test]
fn id_skipped_by_rollback_is_reused_after_restart() -> Result<()> {
    let dir = tempdir()?;
    let path = dir.path().join("strings.id");
    let monitor = Arc::new(CounterMonitor::default());
    let generator = open_with(&path, IdGeneratorOptions::default(), monitor.clone())?;
    generator.start(&NoFreeIds)?;
    let first = generator.next_id()?;
    let dropped = generator.next_id()?;
    let third = generator.next_id()?;
    {
        let mut marker = generator.marker()?;
        marker.mark_used(first)?;
        marker.mark_used(third)?;
    }
    assert_eq!(monitor.snapshot().bridged, 1);
    generator.maintenance()?;
    assert_eq!(generator.next_id()?, third + 1);
    generator.checkpoint(&Unlimited)?;
    generator.close()?;

    let reopened = open(&path)?;
    reopened.start(&NoFreeIds)?;
    assert_eq!(reopened.next_id()?, dropped);
    reopened.close()?;
    Ok(())
}

#[test]
fn recovery_replays_marks_lost_in_a_crash() -> Result<()> {
    let dir = tempdir()?;
    let path = dir.path().join("arrays.id");
    let generator = open(&path)?;
    generator.start(&NoFreeIds)?;
    generator.checkpoint(&Unlimited)?;
    let batch = generator.next_id_batch(3, true)?;
    {
        let mut marker = generator.marker()?;
        marker.mark_used_range(batch.range_start, 3)?;
        marker.mark_deleted(batch.range_start + 1)?;
    }
    // No checkpoint: the marks above are lost.
    generator.close()?;

    let recovering = open(&path)?;
    assert_eq!(recovering.high_id(), 0);
    recovering.set_high_id(3)?;
    for _ in 0..2 {
        let mut marker = recovering.marker()?;
        marker.mark_used_range(0, 3)?;
        marker.mark_deleted(1)?;
    }
    recovering.start(&NoFreeIds)?;
    assert_eq!(recovering.next_id()?, 3);
    assert!(recovering.consistency_report()?.success);
    recovering.checkpoint(&Unlimited)?;
    recovering.close()?;

    let restarted = open(&path)?;
    restarted.start(&NoFreeIds)?;
    assert_eq!(restarted.next_id()?, 1);
    restarted.close()?;
    Ok(())
}

#[test]
fn reuse_keeps_high_id_flat() -> Result<()> {
    let dir = tempdir()?;
    let path = dir.path().join("churn.id");
    let generator = open(&path)?;
    generator.start(&NoFreeIds)?;
    for _ in 0..100 {
        let id = generator.next_id()?;
        let mut marker = generator.marker()?;
        marker.mark_used(id)?;
        marker.mark_deleted_and_free(id)?;
    }
    assert!(generator.high_id() <= 2, "high id grew to {}", generator.high_id());
    generator.close()?;
    Ok(())
}

#[test]
fn wide_slots_survive_restart() -> Result<()> {
    let dir = tempdir()?;
    let path = dir.path().join("blocks.id");
    let options = IdGeneratorOptions::new().power_of_two_slots(8);
    let generator = open_with(&path, options.clone(), Arc::new(sombra_ids::NoopMonitor))?;
    generator.start(&NoFreeIds)?;
    let start = generator.next_consecutive_id_range(8)?;
    {
        let mut marker = generator.marker()?;
        marker.mark_used_range(start, 8)?;
        marker.mark_deleted_and_free_range(start, 8)?;
    }
    generator.checkpoint(&Unlimited)?;
    generator.close()?;

    let reopened = open_with(&path, options, Arc::new(sombra_ids::NoopMonitor))?;
    reopened.start(&NoFreeIds)?;
    assert_eq!(reopened.next_consecutive_id_range(8)?, start);
    reopened.close()?;
    Ok(())
}
