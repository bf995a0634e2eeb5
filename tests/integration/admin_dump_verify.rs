#![allow(missing_docs)]

#[path = "../common/mod.rs"]
mod common;

use std::fs;

use sombra_ids::admin::{self, AdminError, AdminOpenOptions};
use sombra_ids::{NoFreeIds, Unlimited};
use tempfile::tempdir;

use common::open;

#[test]
fn dump_and_verify_agree_on_counts() -> Result<(), AdminError> {
    let dir = tempdir().map_err(sombra_ids::IdError::from)?;
    let path = dir.path().join("nodes.id");
    let generator = open(&path)?;
    generator.start(&NoFreeIds)?;
    let batch = generator.next_id_batch(300, true)?;
    {
        let mut marker = generator.marker()?;
        marker.mark_used_range(batch.range_start, batch.range_length)?;
        marker.mark_deleted_range(10, 5)?;
        marker.mark_deleted_and_free_range(200, 3)?;
    }
    generator.checkpoint(&Unlimited)?;
    generator.close()?;
    let before = fs::read(&path).map_err(sombra_ids::IdError::from)?;

    let opts = AdminOpenOptions::default();
    let dump = admin::dump(&path, &opts)?;
    assert_eq!(dump.counts.deleted_not_freed, 5);
    assert_eq!(dump.counts.deleted_and_freed, 3);
    assert_eq!(dump.counts.entries, 2);
    assert_eq!(dump.header.map(|h| h.high_id), Some(300));

    let report = admin::verify(&path, &opts)?;
    assert!(report.success);
    assert_eq!(report.counts.deleted, dump.counts.deleted_not_freed);
    assert_eq!(report.counts.free, dump.counts.deleted_and_freed);
    assert_eq!(report.counts.entries, dump.counts.entries);

    let json: serde_json::Value = serde_json::from_str(&dump.to_json()?)?;
    assert_eq!(json["counts"]["deleted_and_freed"], 3);

    assert_eq!(fs::read(&path).map_err(sombra_ids::IdError::from)?, before);
    Ok(())
}

#[test]
fn verify_rejects_mismatched_entry_width() -> Result<(), AdminError> {
    let dir = tempdir().map_err(sombra_ids::IdError::from)?;
    let path = dir.path().join("rels.id");
    open(&path)?.close()?;
    let opts = AdminOpenOptions { ids_per_entry: 256 };
    assert!(matches!(
        admin::verify(&path, &opts),
        Err(AdminError::Core(sombra_ids::IdError::IllegalState(_)))
    ));
    Ok(())
}
