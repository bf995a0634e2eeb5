#![allow(missing_docs)]

#[path = "../common/mod.rs"]
mod common;

use std::sync::Arc;

use sombra_ids::{IdError, IdGeneratorOptions, NoFreeIds, NoopMonitor, Result, Unlimited};
use tempfile::tempdir;

use common::{open, open_with};

fn read_only() -> IdGeneratorOptions {
    IdGeneratorOptions::new().read_only(true)
}

#[test]
fn read_only_generator_refuses_mutation() -> Result<()> {
    let dir = tempdir()?;
    let path = dir.path().join("nodes.id");
    let generator = open(&path)?;
    generator.start(&NoFreeIds)?;
    let batch = generator.next_id_batch(10, true)?;
    {
        let mut marker = generator.marker()?;
        marker.mark_used_range(batch.range_start, batch.range_length)?;
        marker.mark_deleted_and_free(4)?;
    }
    generator.checkpoint(&Unlimited)?;
    generator.close()?;

    let viewer = open_with(&path, read_only(), Arc::new(NoopMonitor))?;
    viewer.start(&NoFreeIds)?;
    assert!(viewer.is_read_only());
    assert_eq!(viewer.high_id(), 10);
    assert_eq!(viewer.highest_written_id(), Some(9));
    assert!(matches!(viewer.next_id(), Err(IdError::ReadOnly(_))));
    assert!(matches!(viewer.next_id_batch(2, false), Err(IdError::ReadOnly(_))));
    assert!(matches!(viewer.next_consecutive_id_range(2), Err(IdError::ReadOnly(_))));
    assert!(matches!(viewer.marker(), Err(IdError::ReadOnly(_))));
    assert!(matches!(viewer.reuse_marker(), Err(IdError::ReadOnly(_))));
    assert!(matches!(viewer.set_high_id(20), Err(IdError::ReadOnly(_))));
    assert!(matches!(
        viewer.mark_highest_written_at_high_id(),
        Err(IdError::ReadOnly(_))
    ));

    assert_eq!(viewer.free_ids()?.collect::<Result<Vec<_>>>()?, vec![4]);
    assert_eq!(viewer.cached_id_count(), 0);
    viewer.clear_cache()?;
    viewer.maintenance()?;
    viewer.checkpoint(&Unlimited)?;
    viewer.close()?;

    let reopened = open(&path)?;
    assert_eq!(reopened.generation(), viewer.generation());
    reopened.close()?;
    Ok(())
}

#[test]
fn read_only_open_of_missing_file_fails() {
    let dir = tempdir().expect("tempdir");
    let err = open_with(&dir.path().join("missing.id"), read_only(), Arc::new(NoopMonitor))
        .err()
        .expect("missing file must not be created");
    assert!(matches!(err, IdError::NotFound { .. }));
    assert!(!dir.path().join("missing.id").exists());
}

#[test]
fn read_only_cannot_rebuild() -> Result<()> {
    let dir = tempdir()?;
    let path = dir.path().join("fresh.id");
    open(&path)?.close()?;

    let viewer = open_with(&path, read_only(), Arc::new(NoopMonitor))?;
    assert!(viewer.needs_rebuild());
    assert!(matches!(viewer.start(&NoFreeIds), Err(IdError::ReadOnly(_))));
    Ok(())
}
