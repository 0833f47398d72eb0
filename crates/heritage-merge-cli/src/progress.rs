use colored::*;
use heritage_merge_core::merge::{CollapsedRow, MergeState};
use heritage_merge_core::{EntityType, MergeReporter};
use indicatif::{ProgressBar, ProgressStyle};
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Duration;

/// CLI reporter: a spinner while labels are indexed or a merge runs, and a
/// check line per finished phase.
pub struct CliReporter {
    bar: Mutex<Option<ProgressBar>>,
}

impl CliReporter {
    pub fn new() -> Self {
        Self {
            bar: Mutex::new(None),
        }
    }

    fn bar(&self) -> MutexGuard<'_, Option<ProgressBar>> {
        self.bar.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn spin(&self, message: String) {
        let mut guard = self.bar();
        if let Some(pb) = guard.as_ref() {
            pb.set_message(message);
            return;
        }
        let pb = ProgressBar::new_spinner();
        let style = ProgressStyle::with_template("{spinner:.cyan} {msg}")
            .unwrap_or_else(|_| ProgressStyle::default_spinner())
            .tick_chars("⠋⠙⠹⠸⠼⠴⠦⠧⠇⠏");
        pb.set_style(style);
        pb.set_message(message);
        pb.enable_steady_tick(Duration::from_millis(80));
        *guard = Some(pb);
    }

    fn finish_bar(&self) {
        if let Some(pb) = self.bar().take() {
            pb.finish_and_clear();
        }
    }
}

impl MergeReporter for CliReporter {
    fn on_labels_indexed(&self, records: usize) {
        self.spin(format!("Indexing labels... {} records", records));
    }

    fn on_candidates_ready(&self, labels: usize, pairs: usize, duration_secs: f64) {
        self.finish_bar();
        eprintln!(
            "  {} Indexed {} distinct labels, {} candidate pairs in {:.2}s",
            "✓".green(),
            labels,
            pairs,
            duration_secs
        );
    }

    fn on_state(&self, entity: EntityType, winner_id: &str, state: MergeState) {
        match state {
            MergeState::Executing => self.spin(format!("Merging into {} {}...", entity, winner_id)),
            MergeState::Committed => {
                self.finish_bar();
                eprintln!("  {} Merge committed", "✓".green());
            }
            MergeState::RolledBack | MergeState::Rejected => {
                self.finish_bar();
                eprintln!("  {} Merge {}", "✗".red(), state);
            }
            MergeState::Validating | MergeState::Previewing => {}
        }
    }

    fn on_references_rewritten(&self, table: &str, count: usize) {
        if let Some(pb) = self.bar().as_ref() {
            pb.println(format!(
                "  {} {}: {} reference(s) rewritten",
                "✓".green(),
                table,
                count
            ));
        }
    }

    fn on_collapse(&self, row: &CollapsedRow) {
        if let Some(pb) = self.bar().as_ref() {
            pb.println(format!(
                "  {} {}: collapsed {} into {}",
                "!".yellow(),
                row.table,
                row.removed.join(", "),
                row.kept
            ));
        }
    }
}
