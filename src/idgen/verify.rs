use serde::Serialize;

use crate::storage::{IdRange, IdRangeLayout, IdState, RangeStore};
use crate::types::Result;

const MAX_FINDINGS: usize = 32;

/// Severity of a consistency finding.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ConsistencySeverity {
    /// Harmless but unexpected layout.
    Warning,
    /// The store violates an allocator invariant.
    Error,
}

/// One problem found by the consistency check.
#[derive(Clone, Debug, Serialize)]
pub struct ConsistencyFinding {
    /// How bad it is.
    pub severity: ConsistencySeverity,
    /// Range key of the offending entry.
    pub range_key: u64,
    /// Offending id, when the finding is about a single id.
    pub id: Option<u64>,
    /// Human-readable description.
    pub message: String,
}

/// Receives findings while the store is walked.
pub trait InconsistencyReporter {
    /// Called once per finding.
    fn report(&mut self, finding: ConsistencyFinding);
}

/// Per-state id counts gathered by the check.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize)]
pub struct ConsistencyCounts {
    /// Persisted entries.
    pub entries: u64,
    /// Ids in DELETED.
    pub deleted: u64,
    /// Ids in FREE.
    pub free: u64,
    /// Ids in RESERVED.
    pub reserved: u64,
}

/// Collected outcome of a consistency check.
#[derive(Clone, Debug, Serialize)]
pub struct ConsistencyReport {
    /// Whether no error-level finding was reported.
    pub success: bool,
    /// Findings, capped to the first few.
    pub findings: Vec<ConsistencyFinding>,
    /// Findings dropped after the cap.
    pub truncated: u64,
    /// State counts over all entries.
    pub counts: ConsistencyCounts,
}

impl ConsistencyReport {
    /// Creates an empty, successful report.
    pub fn new() -> Self {
        Self {
            success: true,
            findings: Vec::new(),
            truncated: 0,
            counts: ConsistencyCounts::default(),
        }
    }
}

impl Default for ConsistencyReport {
    fn default() -> Self {
        Self::new()
    }
}

impl InconsistencyReporter for ConsistencyReport {
    fn report(&mut self, finding: ConsistencyFinding) {
        if finding.severity == ConsistencySeverity::Error {
            self.success = false;
        }
        if self.findings.len() < MAX_FINDINGS {
            self.findings.push(finding);
        } else {
            self.truncated += 1;
        }
    }
}

/// Walks every entry of `store` and reports ids that violate the allocator
/// invariants for the given `high_id` and `generation`.
///
/// Returns true if no error-level finding was reported.
pub(crate) fn check_store(
    store: &dyn RangeStore,
    high_id: u64,
    generation: u64,
    reporter: &mut dyn InconsistencyReporter,
    counts: Option<&mut ConsistencyCounts>,
) -> Result<bool> {
    let layout = store.layout();
    let mut clean = true;
    let mut local = ConsistencyCounts::default();
    store.visit(&mut |key: u64, range: &IdRange| -> Result<()> {
        local.entries += 1;
        clean &= check_entry(layout, key, range, high_id, generation, &mut *reporter, &mut local);
        Ok(())
    })?;
    if let Some(counts) = counts {
        *counts = local;
    }
    Ok(clean)
}

fn check_entry(
    layout: IdRangeLayout,
    key: u64,
    range: &IdRange,
    high_id: u64,
    generation: u64,
    reporter: &mut dyn InconsistencyReporter,
    counts: &mut ConsistencyCounts,
) -> bool {
    let mut clean = true;
    if range.generation() > generation {
        clean = false;
        reporter.report(ConsistencyFinding {
            severity: ConsistencySeverity::Error,
            range_key: key,
            id: None,
            message: format!(
                "entry generation {} is newer than the allocator generation {generation}",
                range.generation()
            ),
        });
    }
    if range.is_empty() {
        reporter.report(ConsistencyFinding {
            severity: ConsistencySeverity::Warning,
            range_key: key,
            id: None,
            message: "entry with every id used is still persisted".to_owned(),
        });
    }
    let first = layout.first_id(key);
    for offset in 0..layout.ids_per_entry() {
        let state = range.state(offset);
        match state {
            IdState::Used => continue,
            IdState::Deleted => counts.deleted += 1,
            IdState::Free => counts.free += 1,
            IdState::Reserved => counts.reserved += 1,
        }
        let id = first + offset as u64;
        if id >= high_id {
            clean = false;
            reporter.report(ConsistencyFinding {
                severity: ConsistencySeverity::Error,
                range_key: key,
                id: Some(id),
                message: format!("id {id} is {state:?} but not below high id {high_id}"),
            });
        }
    }
    clean
}
