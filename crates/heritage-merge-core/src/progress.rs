use crate::merge::{CollapsedRow, MergeState};
use crate::schema::EntityType;

/// Trait for reporting duplicate scans and merge progress.
///
/// The CLI implements it with indicatif and colored output. All methods have
/// default no-op implementations.
pub trait MergeReporter: Send + Sync {
    fn on_labels_indexed(&self, _records: usize) {}
    fn on_candidates_ready(&self, _labels: usize, _pairs: usize, _duration_secs: f64) {}
    fn on_state(&self, _entity: EntityType, _winner_id: &str, _state: MergeState) {}
    fn on_references_rewritten(&self, _table: &str, _count: usize) {}
    fn on_collapse(&self, _row: &CollapsedRow) {}
}

/// No-op reporter for silent operation.
pub struct SilentReporter;

impl MergeReporter for SilentReporter {}
