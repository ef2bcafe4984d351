//! Record source trait and adapters
//!
//! Implement [`RecordSource`] for anything that can hand out raw rows by
//! offset. Sources must be stable under resume: the same offset always yields
//! the same rows.

use async_trait::async_trait;
use dataflow_common::{RawRecord, RawValue, RecordType};
use std::fs::File;
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use tracing::debug;

use super::types::{SourceBatch, SourceRow};
use crate::error::SourceError;

/// Cursor-like source of raw rows
#[async_trait]
pub trait RecordSource: Send + Sync {
    /// Read up to `chunk_size` rows starting at `offset`
    async fn next(&self, chunk_size: usize, offset: u64) -> Result<SourceBatch, SourceError>;

    /// Human-readable source name for logs
    fn describe(&self) -> String {
        "source".to_string()
    }
}

// ============================================================================
// In-memory Source
// ============================================================================

/// Rows held in memory; offsets are row indices
#[derive(Debug, Clone, Default)]
pub struct MemorySource {
    rows: Vec<(RecordType, Result<RawRecord, String>)>,
}

impl MemorySource {
    /// All rows of a single record type
    pub fn new(record_type: RecordType, records: Vec<RawRecord>) -> Self {
        Self {
            rows: records
                .into_iter()
                .map(|r| (record_type.clone(), Ok(r)))
                .collect(),
        }
    }

    pub fn push(&mut self, record_type: RecordType, record: RawRecord) {
        self.rows.push((record_type, Ok(record)));
    }

    /// Append a row the source failed to decode
    pub fn push_failed(&mut self, record_type: RecordType, reason: impl Into<String>) {
        self.rows.push((record_type, Err(reason.into())));
    }

    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }
}

#[async_trait]
impl RecordSource for MemorySource {
    async fn next(&self, chunk_size: usize, offset: u64) -> Result<SourceBatch, SourceError> {
        let total = self.rows.len() as u64;
        let start = offset.min(total);
        let end = start.saturating_add(chunk_size as u64).min(total);

        let rows = (start..end)
            .zip(&self.rows[start as usize..end as usize])
            .map(|(offset, (record_type, record))| SourceRow {
                offset,
                record_type: record_type.clone(),
                record: record.clone(),
            })
            .collect();

        Ok(SourceBatch {
            rows,
            next_offset: end,
            exhausted: end >= total,
        })
    }

    fn describe(&self) -> String {
        format!("memory ({} rows)", self.rows.len())
    }
}

// ============================================================================
// CSV Source
// ============================================================================

struct CsvCursor {
    reader: csv::Reader<File>,
    headers: Vec<String>,
    /// Offset of the next data row the reader will yield
    position: u64,
    exhausted: bool,
}

/// Header-based CSV file of a single record type; offsets are data-row indices
pub struct CsvSource {
    path: PathBuf,
    record_type: RecordType,
    delimiter: u8,
    cursor: Mutex<Option<CsvCursor>>,
}

impl CsvSource {
    pub fn open(path: impl AsRef<Path>, record_type: RecordType) -> Result<Self, SourceError> {
        let source = Self {
            path: path.as_ref().to_path_buf(),
            record_type,
            delimiter: b',',
            cursor: Mutex::new(None),
        };
        // Fail fast on a missing or headerless file
        let cursor = source.reopen()?;
        *source.lock()? = Some(cursor);
        Ok(source)
    }

    pub fn with_delimiter(mut self, delimiter: u8) -> Self {
        self.delimiter = delimiter;
        // Re-read lazily with the new delimiter
        if let Ok(cursor) = self.cursor.get_mut() {
            *cursor = None;
        }
        self
    }

    fn reopen(&self) -> Result<CsvCursor, SourceError> {
        let mut reader = csv::ReaderBuilder::new()
            .delimiter(self.delimiter)
            .has_headers(true)
            .flexible(false)
            .from_path(&self.path)?;
        let headers = reader
            .headers()?
            .iter()
            .map(|h| h.trim().to_string())
            .collect();

        Ok(CsvCursor {
            reader,
            headers,
            position: 0,
            exhausted: false,
        })
    }

    fn lock(&self) -> Result<std::sync::MutexGuard<'_, Option<CsvCursor>>, SourceError> {
        self.cursor
            .lock()
            .map_err(|_| SourceError::Unavailable("CSV cursor lock poisoned".to_string()))
    }

    fn row(&self, headers: &[String], record: &csv::StringRecord) -> RawRecord {
        RawRecord::from_pairs(headers.iter().zip(record.iter()).map(|(name, cell)| {
            let value = if cell.trim().is_empty() {
                RawValue::Blank
            } else {
                RawValue::text(cell)
            };
            (name.clone(), value)
        }))
    }
}

#[async_trait]
impl RecordSource for CsvSource {
    async fn next(&self, chunk_size: usize, offset: u64) -> Result<SourceBatch, SourceError> {
        let mut guard = self.lock()?;

        let rewind = match guard.as_ref() {
            None => true,
            Some(cursor) => cursor.position > offset,
        };
        if rewind {
            debug!(path = %self.path.display(), offset, "Reopening CSV source");
            *guard = Some(self.reopen()?);
        }
        let Some(cursor) = guard.as_mut() else {
            return Err(SourceError::Unavailable("CSV cursor missing".to_string()));
        };

        let mut record = csv::StringRecord::new();
        let mut rows = Vec::with_capacity(chunk_size);

        while !cursor.exhausted && rows.len() < chunk_size {
            let read = cursor.reader.read_record(&mut record);
            let row_offset = cursor.position;
            match read {
                Ok(false) => cursor.exhausted = true,
                Ok(true) => {
                    cursor.position += 1;
                    if row_offset >= offset {
                        rows.push(SourceRow::new(
                            row_offset,
                            self.record_type.clone(),
                            self.row(&cursor.headers, &record),
                        ));
                    }
                }
                Err(err) if err.is_io_error() => return Err(SourceError::Csv(err)),
                Err(err) => {
                    cursor.position += 1;
                    if row_offset >= offset {
                        rows.push(SourceRow::failed(row_offset, self.record_type.clone(), err.to_string()));
                    }
                }
            }
        }

        let next_offset = cursor.position.max(offset);
        Ok(SourceBatch {
            rows,
            next_offset,
            exhausted: cursor.exhausted,
        })
    }

    fn describe(&self) -> String {
        format!("csv {}", self.path.display())
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use std::io::Write;

    fn rows(n: usize) -> Vec<RawRecord> {
        (0..n)
            .map(|i| RawRecord::from_pairs([("SKU", RawValue::text(format!("S{}", i)))]))
            .collect()
    }

    #[tokio::test]
    async fn test_memory_source_chunks() {
        let source = MemorySource::new(RecordType::product(), rows(5));

        let first = source.next(2, 0).await.unwrap();
        assert_eq!(first.rows.len(), 2);
        assert_eq!(first.next_offset, 2);
        assert!(!first.exhausted);

        let last = source.next(2, 4).await.unwrap();
        assert_eq!(last.rows.len(), 1);
        assert_eq!(last.rows[0].offset, 4);
        assert!(last.exhausted);

        let past = source.next(2, 9).await.unwrap();
        assert!(past.rows.is_empty());
        assert!(past.exhausted);
    }

    #[tokio::test]
    async fn test_memory_source_is_stable_under_resume() {
        let source = MemorySource::new(RecordType::product(), rows(5));
        assert_eq!(source.next(3, 1).await.unwrap(), source.next(3, 1).await.unwrap());
    }

    #[tokio::test]
    async fn test_csv_source_reads_by_offset() {
        let mut file = tempfile::Builder::new().suffix(".csv").tempfile().unwrap();
        writeln!(file, "SKU,MRP").unwrap();
        writeln!(file, "A,10").unwrap();
        writeln!(file, "B,").unwrap();
        writeln!(file, "C,30,extra").unwrap();
        writeln!(file, "D,40").unwrap();
        file.flush().unwrap();

        let source = CsvSource::open(file.path(), RecordType::product()).unwrap();

        let first = source.next(2, 0).await.unwrap();
        assert_eq!(first.rows.len(), 2);
        assert_eq!(first.next_offset, 2);
        let b = first.rows[1].record.as_ref().unwrap();
        assert_eq!(b.get("MRP"), Some(&RawValue::Blank));

        let second = source.next(2, 2).await.unwrap();
        assert_eq!(second.rows[0].offset, 2);
        assert!(second.rows[0].record.is_err());
        assert_eq!(second.rows[1].record.as_ref().unwrap().get("SKU"), Some(&RawValue::text("D")));

        let rest = source.next(2, 4).await.unwrap();
        assert!(rest.rows.is_empty());
        assert!(rest.exhausted);

        // Seeking backwards re-reads the same rows
        let again = source.next(1, 1).await.unwrap();
        assert_eq!(again.rows[0].offset, 1);
        assert_eq!(again.rows[0].record, first.rows[1].record);
    }

    #[test]
    fn test_csv_source_missing_file() {
        assert!(CsvSource::open("/nonexistent/input.csv", RecordType::product()).is_err());
    }
}
