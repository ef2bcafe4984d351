//! Report observers
//!
//! Progress display and per-chunk logging subscribe to report snapshots; the
//! pipeline itself never formats progress.

use indicatif::{ProgressBar, ProgressStyle};
use std::time::Duration;
use tracing::{info, warn};

use crate::framework::types::PipelineSnapshot;
use crate::report::ReportSummary;

/// Notified after every committed chunk and once at the end of a run
pub trait ReportObserver: Send + Sync {
    fn on_chunk(&self, _snapshot: &PipelineSnapshot) {}

    fn on_finish(&self, _summary: &ReportSummary) {}
}

/// Structured log line per chunk and a summary line at the end
#[derive(Debug, Default)]
pub struct TracingObserver;

impl ReportObserver for TracingObserver {
    fn on_chunk(&self, snapshot: &PipelineSnapshot) {
        info!(
            chunk_index = snapshot.chunk_index,
            offset = snapshot.offset,
            read = snapshot.counts.read,
            merged = snapshot.counts.merged,
            emitted = snapshot.counts.emitted,
            groups = snapshot.resolved_groups,
            "Chunk committed"
        );
    }

    fn on_finish(&self, summary: &ReportSummary) {
        let errors: u64 = summary.errors_by_stage.values().sum();
        if errors > 0 {
            warn!(
                state = summary.state.as_str(),
                errors,
                duration_ms = summary.duration_ms,
                "Run finished with errors"
            );
        } else {
            info!(
                state = summary.state.as_str(),
                groups = summary.resolved_groups,
                duration_ms = summary.duration_ms,
                "Run finished"
            );
        }
    }
}

/// Spinner with processed and merged counts
pub struct ProgressObserver {
    bar: ProgressBar,
}

impl ProgressObserver {
    pub fn new(message: &str) -> Self {
        let bar = ProgressBar::new_spinner();
        if let Ok(style) = ProgressStyle::default_spinner().template("{spinner:.green} [{elapsed_precise}] {msg}") {
            bar.set_style(style);
        }
        bar.set_message(message.to_string());
        bar.enable_steady_tick(Duration::from_millis(100));
        Self { bar }
    }

    /// Observer drawing to nowhere, for tests and non-interactive runs
    pub fn hidden() -> Self {
        Self {
            bar: ProgressBar::hidden(),
        }
    }

    pub fn message(&self) -> String {
        self.bar.message()
    }
}

impl ReportObserver for ProgressObserver {
    fn on_chunk(&self, snapshot: &PipelineSnapshot) {
        self.bar.set_message(format!(
            "chunk {} | read {} | merged {} | groups {} | errors {}",
            snapshot.chunk_index,
            snapshot.counts.read,
            snapshot.counts.merged,
            snapshot.resolved_groups,
            snapshot.counts.normalization_errors
                + snapshot.counts.validation_rejected
                + snapshot.counts.merge_conflicts
                + snapshot.counts.source_errors
                + snapshot.counts.write_errors,
        ));
    }

    fn on_finish(&self, summary: &ReportSummary) {
        self.bar.finish_with_message(format!(
            "{} | {} groups from {} rows",
            summary.state, summary.resolved_groups, summary.counts.read
        ));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::report::ReportCounts;

    #[test]
    fn test_progress_message_tracks_counts() {
        let observer = ProgressObserver::hidden();
        observer.on_chunk(&PipelineSnapshot {
            chunk_index: 3,
            counts: ReportCounts {
                read: 10,
                merged: 8,
                normalization_errors: 1,
                ..ReportCounts::default()
            },
            resolved_groups: 6,
            ..PipelineSnapshot::default()
        });

        assert_eq!(observer.message(), "chunk 3 | read 10 | merged 8 | groups 6 | errors 1");
    }
}
