//! Core types shared by the orchestrator and its collaborators

use dataflow_common::{RawRecord, RecordType};
use serde::{Deserialize, Serialize};
use std::fmt;

use crate::report::ReportCounts;

/// Orchestrator state.
///
/// `Idle -> Reading -> Processing -> (Reading | Finalizing) -> Done`, with
/// `Stopped` on cooperative cancellation and `Aborted` on fatal conditions.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum RunState {
    #[default]
    Idle,
    Reading,
    Processing {
        chunk_index: u64,
    },
    Finalizing,
    Done,
    /// Cancelled between chunks; the last checkpoint is valid for resume
    Stopped,
    Aborted {
        reason: String,
    },
}

impl RunState {
    pub fn as_str(&self) -> &str {
        match self {
            RunState::Idle => "idle",
            RunState::Reading => "reading",
            RunState::Processing { .. } => "processing",
            RunState::Finalizing => "finalizing",
            RunState::Done => "done",
            RunState::Stopped => "stopped",
            RunState::Aborted { .. } => "aborted",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, RunState::Done | RunState::Stopped | RunState::Aborted { .. })
    }
}

impl fmt::Display for RunState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RunState::Processing { chunk_index } => write!(f, "processing (chunk {})", chunk_index),
            RunState::Aborted { reason } => write!(f, "aborted: {}", reason),
            other => f.write_str(other.as_str()),
        }
    }
}

/// One row pulled from a source.
///
/// A row the source could not decode carries the reason instead of a record.
#[derive(Debug, Clone, PartialEq)]
pub struct SourceRow {
    pub offset: u64,
    pub record_type: RecordType,
    pub record: Result<RawRecord, String>,
}

impl SourceRow {
    pub fn new(offset: u64, record_type: RecordType, record: RawRecord) -> Self {
        Self {
            offset,
            record_type,
            record: Ok(record),
        }
    }

    pub fn failed(offset: u64, record_type: RecordType, reason: impl Into<String>) -> Self {
        Self {
            offset,
            record_type,
            record: Err(reason.into()),
        }
    }
}

/// Bounded batch returned by a source
#[derive(Debug, Clone, PartialEq, Default)]
pub struct SourceBatch {
    pub rows: Vec<SourceRow>,
    /// Offset to request next
    pub next_offset: u64,
    /// No rows remain at or after `next_offset`
    pub exhausted: bool,
}

/// Point-in-time view of a run, published after every state change
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct PipelineSnapshot {
    pub state: RunState,
    /// Next source offset to read; everything before it is committed
    pub offset: u64,
    /// Number of committed chunks
    pub chunk_index: u64,
    pub counts: ReportCounts,
    pub resolved_groups: usize,
}
