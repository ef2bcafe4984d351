//! Error and quality report collector
//!
//! The only object every stage writes to. It is append-only during a chunk;
//! [`ProcessingReport::mark`] / [`ProcessingReport::rewind`] undo a chunk that
//! gets rolled back, so committed counts never decrease.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use uuid::Uuid;

use crate::error::Stage;
use crate::framework::types::RunState;
use crate::validate::{Severity, ValidationResult};

/// Number of equal-width buckets over [0, 1]
pub const QUALITY_BUCKETS: usize = 10;

/// Cumulative counters
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct ReportCounts {
    /// Rows that carried a raw record
    pub read: u64,
    pub normalized: u64,
    pub normalization_errors: u64,
    pub validated: u64,
    /// Records excluded from merge by an error-severity violation
    pub validation_rejected: u64,
    pub merged: u64,
    pub merge_conflicts: u64,
    /// Rows the source could not decode
    pub source_errors: u64,
    pub write_errors: u64,
    pub emitted: u64,
    pub chunks: u64,
}

/// One recorded error
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ErrorEntry {
    pub stage: Stage,
    pub chunk_index: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub offset: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub identity_key: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rule_id: Option<String>,
    pub message: String,
}

/// Violations of one rule
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct RuleTally {
    pub warnings: u64,
    pub errors: u64,
}

impl RuleTally {
    pub fn total(&self) -> u64 {
        self.warnings + self.errors
    }
}

/// Quality score distribution
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct QualityHistogram {
    pub buckets: [u64; QUALITY_BUCKETS],
    pub count: u64,
    pub sum: f64,
}

impl QualityHistogram {
    pub fn record(&mut self, score: f64) {
        let score = score.clamp(0.0, 1.0);
        let index = ((score * QUALITY_BUCKETS as f64) as usize).min(QUALITY_BUCKETS - 1);
        self.buckets[index] += 1;
        self.count += 1;
        self.sum += score;
    }

    pub fn mean(&self) -> Option<f64> {
        (self.count > 0).then(|| self.sum / self.count as f64)
    }
}

/// Saved position for [`ProcessingReport::rewind`]
#[derive(Debug, Clone)]
pub struct ReportMark {
    counts: ReportCounts,
    errors: usize,
    rule_tallies: BTreeMap<String, RuleTally>,
    coercion_warnings: BTreeMap<String, u64>,
    quality: QualityHistogram,
}

/// Process-wide report, accumulated across chunks
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProcessingReport {
    pub run_id: Uuid,
    pub started_at: DateTime<Utc>,
    pub counts: ReportCounts,
    pub errors: Vec<ErrorEntry>,
    pub rule_tallies: BTreeMap<String, RuleTally>,
    /// `coerce:<field>` -> optional values discarded by the normalizer
    pub coercion_warnings: BTreeMap<String, u64>,
    pub quality: QualityHistogram,
}

impl Default for ProcessingReport {
    fn default() -> Self {
        Self::new()
    }
}

impl ProcessingReport {
    pub fn new() -> Self {
        Self {
            run_id: Uuid::new_v4(),
            started_at: Utc::now(),
            counts: ReportCounts::default(),
            errors: Vec::new(),
            rule_tallies: BTreeMap::new(),
            coercion_warnings: BTreeMap::new(),
            quality: QualityHistogram::default(),
        }
    }

    pub fn mark(&self) -> ReportMark {
        ReportMark {
            counts: self.counts,
            errors: self.errors.len(),
            rule_tallies: self.rule_tallies.clone(),
            coercion_warnings: self.coercion_warnings.clone(),
            quality: self.quality.clone(),
        }
    }

    /// Drop everything recorded since `mark`
    pub fn rewind(&mut self, mark: ReportMark) {
        self.counts = mark.counts;
        self.errors.truncate(mark.errors);
        self.rule_tallies = mark.rule_tallies;
        self.coercion_warnings = mark.coercion_warnings;
        self.quality = mark.quality;
    }

    /// Append an error entry
    pub fn record(&mut self, entry: ErrorEntry) {
        self.errors.push(entry);
    }

    pub fn record_source_error(&mut self, chunk_index: u64, offset: u64, message: impl Into<String>) {
        self.counts.source_errors += 1;
        self.record(ErrorEntry {
            stage: Stage::Source,
            chunk_index,
            offset: Some(offset),
            identity_key: None,
            rule_id: None,
            message: message.into(),
        });
    }

    pub fn record_normalization_error(
        &mut self,
        chunk_index: u64,
        offset: u64,
        message: impl Into<String>,
    ) {
        self.counts.normalization_errors += 1;
        self.record(ErrorEntry {
            stage: Stage::Normalization,
            chunk_index,
            offset: Some(offset),
            identity_key: None,
            rule_id: None,
            message: message.into(),
        });
    }

    pub fn record_coercion_warning(&mut self, field: &str) {
        *self
            .coercion_warnings
            .entry(format!("coerce:{}", field))
            .or_default() += 1;
    }

    /// Tally a validation outcome; error-severity violations become entries
    pub fn record_validation(
        &mut self,
        chunk_index: u64,
        offset: u64,
        identity_key: &str,
        result: &ValidationResult,
    ) {
        self.counts.validated += 1;
        self.quality.record(result.quality_score);

        for violation in &result.violations {
            let tally = self.rule_tallies.entry(violation.rule_id.clone()).or_default();
            match violation.severity {
                Severity::Warning => tally.warnings += 1,
                Severity::Error => tally.errors += 1,
            }
        }

        if result.has_errors() {
            self.counts.validation_rejected += 1;
            for violation in result.errors() {
                self.record(ErrorEntry {
                    stage: Stage::Validation,
                    chunk_index,
                    offset: Some(offset),
                    identity_key: Some(identity_key.to_string()),
                    rule_id: Some(violation.rule_id.clone()),
                    message: format!("{}: {}", violation.field, violation.message),
                });
            }
        }
    }

    pub fn record_merge_conflict(
        &mut self,
        chunk_index: u64,
        offset: u64,
        identity_key: &str,
        message: impl Into<String>,
    ) {
        self.counts.merge_conflicts += 1;
        self.record(ErrorEntry {
            stage: Stage::Merge,
            chunk_index,
            offset: Some(offset),
            identity_key: Some(identity_key.to_string()),
            rule_id: None,
            message: message.into(),
        });
    }

    pub fn record_write_error(&mut self, chunk_index: u64, identity_key: &str, message: impl Into<String>) {
        self.counts.write_errors += 1;
        self.record(ErrorEntry {
            stage: Stage::Write,
            chunk_index,
            offset: None,
            identity_key: Some(identity_key.to_string()),
            rule_id: None,
            message: message.into(),
        });
    }

    /// Error entry counts per stage
    pub fn errors_by_stage(&self) -> BTreeMap<Stage, u64> {
        let mut by_stage = BTreeMap::new();
        for entry in &self.errors {
            *by_stage.entry(entry.stage).or_default() += 1;
        }
        by_stage
    }

    /// Most frequently violated rules, ties broken by rule id
    pub fn top_violations(&self, n: usize) -> Vec<ViolationCount> {
        let mut counts: Vec<ViolationCount> = self
            .rule_tallies
            .iter()
            .map(|(rule_id, tally)| ViolationCount {
                rule_id: rule_id.clone(),
                warnings: tally.warnings,
                errors: tally.errors,
                total: tally.total(),
            })
            .collect();
        counts.sort_by(|a, b| b.total.cmp(&a.total).then_with(|| a.rule_id.cmp(&b.rule_id)));
        counts.truncate(n);
        counts
    }

    /// Produce the immutable export shape
    pub fn finalize(&self, state: &RunState, resolved_groups: usize, top_n: usize) -> ReportSummary {
        let finished_at = Utc::now();
        let attempted = self.counts.read + self.counts.source_errors;
        let success_rate = if attempted == 0 {
            1.0
        } else {
            self.counts.merged as f64 / attempted as f64
        };

        ReportSummary {
            run_id: self.run_id,
            state: state.clone(),
            started_at: self.started_at,
            finished_at,
            duration_ms: (finished_at - self.started_at).num_milliseconds().max(0) as u64,
            counts: self.counts,
            resolved_groups,
            success_rate,
            errors_by_stage: self.errors_by_stage(),
            top_violations: self.top_violations(top_n),
            coercion_warnings: self.coercion_warnings.clone(),
            quality: QualitySummary {
                buckets: self.quality.buckets.to_vec(),
                mean: self.quality.mean(),
            },
            errors: self.errors.clone(),
        }
    }
}

/// Rule id with its violation counts
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ViolationCount {
    pub rule_id: String,
    pub warnings: u64,
    pub errors: u64,
    pub total: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QualitySummary {
    pub buckets: Vec<u64>,
    pub mean: Option<f64>,
}

/// Finalized, read-only report handed to external formatters
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReportSummary {
    pub run_id: Uuid,
    pub state: RunState,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub duration_ms: u64,
    pub counts: ReportCounts,
    pub resolved_groups: usize,
    /// Merged records over rows read
    pub success_rate: f64,
    pub errors_by_stage: BTreeMap<Stage, u64>,
    pub top_violations: Vec<ViolationCount>,
    pub coercion_warnings: BTreeMap<String, u64>,
    pub quality: QualitySummary,
    pub errors: Vec<ErrorEntry>,
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use crate::validate::Violation;

    fn violation(rule_id: &str, severity: Severity) -> Violation {
        Violation {
            field: "sku".into(),
            rule_id: rule_id.into(),
            severity,
            message: "bad".into(),
        }
    }

    #[test]
    fn test_histogram_buckets() {
        let mut histogram = QualityHistogram::default();
        histogram.record(0.0);
        histogram.record(0.55);
        histogram.record(1.0);
        histogram.record(1.0);

        assert_eq!(histogram.buckets[0], 1);
        assert_eq!(histogram.buckets[5], 1);
        assert_eq!(histogram.buckets[9], 2);
        assert!((histogram.mean().unwrap() - 0.6375).abs() < 1e-9);
        assert_eq!(QualityHistogram::default().mean(), None);
    }

    #[test]
    fn test_validation_tallies_and_rejections() {
        let mut report = ProcessingReport::new();
        let rejected = ValidationResult {
            violations: vec![violation("sku-required", Severity::Error), violation("sku-format", Severity::Warning)],
            quality_score: 0.0,
        };
        let warned = ValidationResult {
            violations: vec![violation("sku-format", Severity::Warning)],
            quality_score: 0.5,
        };

        report.record_validation(0, 1, "product|a", &rejected);
        report.record_validation(0, 2, "product|b", &warned);

        assert_eq!(report.counts.validated, 2);
        assert_eq!(report.counts.validation_rejected, 1);
        assert_eq!(report.errors.len(), 1);
        assert_eq!(report.errors[0].stage, Stage::Validation);
        assert_eq!(report.errors[0].rule_id.as_deref(), Some("sku-required"));

        let top = report.top_violations(10);
        assert_eq!(top[0].rule_id, "sku-format");
        assert_eq!(top[0].warnings, 2);
        assert_eq!(top[1].rule_id, "sku-required");
        assert_eq!(report.top_violations(1).len(), 1);
    }

    #[test]
    fn test_rewind_restores_mark() {
        let mut report = ProcessingReport::new();
        report.counts.read = 3;
        report.record_normalization_error(0, 0, "field 'mrp': missing required value");
        let mark = report.mark();
        let before = report.clone();

        report.counts.read += 2;
        report.record_source_error(1, 5, "bad row");
        report.record_coercion_warning("stock");
        report.quality.record(0.3);
        report.rewind(mark);

        assert_eq!(report, before);
    }

    #[test]
    fn test_finalize_summary() {
        let mut report = ProcessingReport::new();
        report.counts.read = 4;
        report.counts.merged = 3;
        report.record_normalization_error(0, 2, "field 'mrp': missing required value");
        report.record_write_error(0, "product|a", "rejected");

        let summary = report.finalize(&RunState::Done, 2, 5);
        assert_eq!(summary.state, RunState::Done);
        assert_eq!(summary.resolved_groups, 2);
        assert!((summary.success_rate - 0.75).abs() < 1e-9);
        assert_eq!(summary.errors_by_stage.get(&Stage::Normalization), Some(&1));
        assert_eq!(summary.errors_by_stage.get(&Stage::Write), Some(&1));
        assert_eq!(summary.quality.buckets.len(), QUALITY_BUCKETS);

        let json = serde_json::to_value(&summary).unwrap();
        assert_eq!(json["state"]["state"], "done");
        assert_eq!(json["errors_by_stage"]["normalization"], 1);
    }
}
