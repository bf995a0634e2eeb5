use std::path::Path;

use crate::idgen::{
    check_store, ConsistencyCounts, ConsistencyFinding, ConsistencyReport, ConsistencySeverity,
    InconsistencyReporter,
};
use crate::storage::RangeStore;

use crate::admin::options::AdminOpenOptions;
use crate::admin::util::open_store;
use crate::admin::Result;

/// Checks the id file at `path` against the header it was checkpointed with.
///
/// A header-less file is rebuilt on its next open, so only entry generations
/// are meaningful there; it is reported as a warning and checked without an
/// upper id bound.
pub fn verify(path: impl AsRef<Path>, opts: &AdminOpenOptions) -> Result<ConsistencyReport> {
    let store = open_store(path.as_ref(), opts)?;
    let mut report = ConsistencyReport::new();
    let (high_id, generation) = match store.header() {
        Some(header) => (header.high_id, header.generation),
        None => {
            report.report(ConsistencyFinding {
                severity: ConsistencySeverity::Warning,
                range_key: 0,
                id: None,
                message: "id file has no header and will be rebuilt on next open".to_owned(),
            });
            (u64::MAX, u64::MAX)
        }
    };
    let mut counts = ConsistencyCounts::default();
    check_store(&store, high_id, generation, &mut report, Some(&mut counts))?;
    report.counts = counts;
    Ok(report)
}
