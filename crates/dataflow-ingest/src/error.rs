//! Error taxonomy for the record pipeline
//!
//! Per-record errors ([`NormalizationError`], [`MergeConflictError`], validation
//! violations) are data: they land in the [`ProcessingReport`] and never unwind
//! the chunk loop. [`SourceError`] and [`WriteError`] are I/O-level and only end
//! a run when they persist across a whole chunk. [`ConfigError`] is fatal at
//! startup.
//!
//! [`ProcessingReport`]: crate::report::ProcessingReport

use dataflow_common::{DataflowError, FieldType};
use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

use crate::normalize::IdentityKey;

/// Pipeline stage an error is attributed to
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Stage {
    Source,
    Normalization,
    Validation,
    Merge,
    Write,
}

impl Stage {
    pub fn as_str(&self) -> &str {
        match self {
            Stage::Source => "source",
            Stage::Normalization => "normalization",
            Stage::Validation => "validation",
            Stage::Merge => "merge",
            Stage::Write => "write",
        }
    }
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A single record could not be mapped onto its canonical schema
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("field '{field}': {reason}")]
pub struct NormalizationError {
    pub field: String,
    pub reason: String,
}

impl NormalizationError {
    pub fn new(field: impl Into<String>, reason: impl Into<String>) -> Self {
        Self {
            field: field.into(),
            reason: reason.into(),
        }
    }
}

/// Incoming record cannot be folded into its resolved record.
///
/// Either way the incoming record is dropped and the resolved record stays
/// as it was.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum MergeConflictError {
    /// The two records disagree on a field's type
    #[error("type conflict on field '{field}': existing {existing}, incoming {incoming}")]
    TypeMismatch {
        field: String,
        existing: FieldType,
        incoming: FieldType,
    },

    /// A numeric policy would leave the field's representable range
    #[error("field '{field}' overflows under the {policy} policy")]
    Overflow { field: String, policy: &'static str },
}

impl MergeConflictError {
    pub fn field(&self) -> &str {
        match self {
            MergeConflictError::TypeMismatch { field, .. } | MergeConflictError::Overflow { field, .. } => field,
        }
    }
}

/// Failure reading from a record source
#[derive(Error, Debug)]
pub enum SourceError {
    #[error("Source unavailable: {0}")]
    Unavailable(String),

    #[error("Source I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("CSV error: {0}")]
    Csv(#[from] csv::Error),
}

/// One record a sink refused
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WriteFailure {
    pub key: IdentityKey,
    pub reason: String,
}

/// Failure writing resolved records to a sink
#[derive(Error, Debug, Clone)]
pub enum WriteError {
    /// Some (possibly all) records of the batch were refused
    #[error("{} record(s) rejected by sink", failures.len())]
    Rejected { failures: Vec<WriteFailure> },

    /// The whole batch failed
    #[error("Sink unavailable: {0}")]
    Unavailable(String),
}

/// Invalid configuration; always surfaced before a run starts
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Invalid field mapping for '{record_type}': {reason}")]
    InvalidMapping { record_type: String, reason: String },

    #[error("Invalid rule '{rule_id}' for '{record_type}': {reason}")]
    InvalidRule {
        record_type: String,
        rule_id: String,
        reason: String,
    },

    #[error("Invalid merge strategy for '{record_type}': {reason}")]
    InvalidStrategy { record_type: String, reason: String },

    #[error("Invalid pipeline option '{option}': {reason}")]
    InvalidOption { option: String, reason: String },

    #[error("Record type '{0}' is registered twice")]
    DuplicateRecordType(String),

    #[error("Checkpoint incompatible with configuration: {0}")]
    Checkpoint(String),

    #[error("Failed to load configuration: {0}")]
    Load(#[from] config::ConfigError),
}

impl ConfigError {
    pub(crate) fn option(option: &str, reason: impl Into<String>) -> Self {
        ConfigError::InvalidOption {
            option: option.to_string(),
            reason: reason.into(),
        }
    }
}

impl From<ConfigError> for DataflowError {
    fn from(err: ConfigError) -> Self {
        DataflowError::Config(err.to_string())
    }
}

impl From<SourceError> for DataflowError {
    fn from(err: SourceError) -> Self {
        DataflowError::Source(err.to_string())
    }
}

impl From<WriteError> for DataflowError {
    fn from(err: WriteError) -> Self {
        DataflowError::Write(err.to_string())
    }
}
