//! Record sink trait and adapters

use async_trait::async_trait;
use std::fs::{File, OpenOptions};
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use crate::error::WriteError;
use crate::merge::ResolvedRecord;

/// Destination for resolved records.
///
/// A sink may refuse individual records with [`WriteError::Rejected`]; the
/// pipeline records those and carries on. Only a chunk whose every record
/// fails ends the run.
#[async_trait]
pub trait RecordSink: Send + Sync {
    async fn write(&self, records: &[ResolvedRecord]) -> Result<(), WriteError>;

    /// Human-readable sink name for logs
    fn describe(&self) -> String {
        "sink".to_string()
    }
}

// ============================================================================
// In-memory Sink
// ============================================================================

/// Collects written records; clones share the same buffer
#[derive(Debug, Clone, Default)]
pub struct MemorySink {
    written: Arc<Mutex<Vec<ResolvedRecord>>>,
    batches: Arc<Mutex<usize>>,
}

impl MemorySink {
    pub fn new() -> Self {
        Self::default()
    }

    /// Every record written so far, in write order
    pub fn records(&self) -> Vec<ResolvedRecord> {
        self.written.lock().map(|w| w.clone()).unwrap_or_default()
    }

    /// Number of write calls
    pub fn batches(&self) -> usize {
        self.batches.lock().map(|b| *b).unwrap_or_default()
    }
}

#[async_trait]
impl RecordSink for MemorySink {
    async fn write(&self, records: &[ResolvedRecord]) -> Result<(), WriteError> {
        let mut written = self
            .written
            .lock()
            .map_err(|_| WriteError::Unavailable("memory sink lock poisoned".to_string()))?;
        written.extend_from_slice(records);
        if let Ok(mut batches) = self.batches.lock() {
            *batches += 1;
        }
        Ok(())
    }

    fn describe(&self) -> String {
        "memory".to_string()
    }
}

// ============================================================================
// JSON Lines Sink
// ============================================================================

/// Appends one JSON object per resolved record
pub struct JsonLinesSink {
    path: PathBuf,
    writer: Mutex<BufWriter<File>>,
}

impl JsonLinesSink {
    /// Open `path` for appending, creating it if needed
    pub fn open(path: impl AsRef<Path>) -> dataflow_common::Result<Self> {
        let path = path.as_ref().to_path_buf();
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent)?;
        }
        let file = OpenOptions::new().create(true).append(true).open(&path)?;
        Ok(Self {
            path,
            writer: Mutex::new(BufWriter::new(file)),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

#[async_trait]
impl RecordSink for JsonLinesSink {
    async fn write(&self, records: &[ResolvedRecord]) -> Result<(), WriteError> {
        let mut writer = self
            .writer
            .lock()
            .map_err(|_| WriteError::Unavailable("writer lock poisoned".to_string()))?;

        let mut buffer = Vec::new();
        for record in records {
            serde_json::to_writer(&mut buffer, &record.to_json())
                .map_err(|e| WriteError::Unavailable(e.to_string()))?;
            buffer.push(b'\n');
        }

        writer
            .write_all(&buffer)
            .and_then(|_| writer.flush())
            .map_err(|e| WriteError::Unavailable(format!("{}: {}", self.path.display(), e)))
    }

    fn describe(&self) -> String {
        format!("jsonl {}", self.path.display())
    }
}
