//! Resume checkpoints
//!
//! A [`Checkpoint`] carries the next source offset plus the resolved table and
//! cumulative report, so a resumed run ends with exactly the table and counts
//! of an uninterrupted one.
//!
//! Every save serializes the whole table and report, so the cost of a save
//! grows with the run. The pipeline saves every `checkpoint_interval` commits
//! and once more when a run ends.

use dataflow_common::{DataflowError, Result};
use serde::{Deserialize, Serialize};
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use tracing::debug;

use crate::merge::ResolvedTable;
use crate::report::ProcessingReport;

/// On-disk format version
pub const CHECKPOINT_VERSION: u32 = 1;

/// Resume state as of the last committed chunk
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Checkpoint {
    pub version: u32,
    /// Next source offset to read
    pub offset: u64,
    /// Number of committed chunks
    pub chunk_index: u64,
    /// Shard count the table was built with
    pub worker_concurrency: usize,
    pub table: ResolvedTable,
    pub report: ProcessingReport,
}

/// Persists checkpoints as JSON, replacing the file atomically
#[derive(Debug, Clone)]
pub struct CheckpointStore {
    path: PathBuf,
}

impl CheckpointStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Write to a temp file next to the target, then rename over it
    pub fn save(&self, checkpoint: &Checkpoint) -> Result<()> {
        if let Some(parent) = self.path.parent().filter(|p| !p.as_os_str().is_empty()) {
            fs::create_dir_all(parent)?;
        }

        let temp = self.path.with_extension("tmp");
        {
            let mut file = fs::File::create(&temp)?;
            serde_json::to_writer(&mut file, checkpoint)?;
            file.flush()?;
            file.sync_all()?;
        }
        fs::rename(&temp, &self.path)?;

        debug!(
            path = %self.path.display(),
            offset = checkpoint.offset,
            chunk_index = checkpoint.chunk_index,
            "Checkpoint saved"
        );
        Ok(())
    }

    /// Load the checkpoint, `None` when there is none yet
    pub fn load(&self) -> Result<Option<Checkpoint>> {
        let content = match fs::read(&self.path) {
            Ok(content) => content,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e.into()),
        };

        let checkpoint: Checkpoint = serde_json::from_slice(&content)?;
        if checkpoint.version != CHECKPOINT_VERSION {
            return Err(DataflowError::Parse(format!(
                "unsupported checkpoint version {} in {}",
                checkpoint.version,
                self.path.display()
            )));
        }
        Ok(Some(checkpoint))
    }

    /// Remove the checkpoint after a completed run
    pub fn clear(&self) -> Result<()> {
        match fs::remove_file(&self.path) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }
}
