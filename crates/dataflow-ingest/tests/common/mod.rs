//! Shared fixtures for the pipeline integration tests
#![allow(dead_code)]

use async_trait::async_trait;
use dataflow_common::{FieldType, RawRecord, RawValue, RecordType};
use dataflow_ingest::config::{FieldSpec, RecordTypeConfig, Transform};
use dataflow_ingest::error::{SourceError, WriteError, WriteFailure};
use dataflow_ingest::framework::{MemorySink, MemorySource, PipelineSnapshot, RecordSink, RecordSource, SourceBatch};
use dataflow_ingest::merge::{FieldPolicy, MergeStrategy, ResolvedRecord};
use dataflow_ingest::validate::{RuleKind, RuleSpec, Severity};
use dataflow_ingest::{IdentityKey, PipelineConfig, ReportObserver};
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Mutex;
use tokio_util::sync::CancellationToken;

pub fn init_tracing() {
    use tracing_subscriber::{fmt, EnvFilter};

    let _ = fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info,dataflow_ingest=debug")),
        )
        .with_test_writer()
        .try_init();
}

// ============================================================================
// Configuration builders
// ============================================================================

pub fn field(name: &str, field_type: FieldType) -> FieldSpec {
    FieldSpec {
        name: name.to_string(),
        field_type,
        sources: Vec::new(),
        required: false,
        transform: Transform::Trim,
        default: None,
    }
}

/// Product mapping: `sku` (required key), `name`, `price`, `desc`, `stock`.
///
/// Rules: `price-non-negative` (error) and `name-length` (warning).
pub fn product_type(strategy: MergeStrategy) -> RecordTypeConfig {
    RecordTypeConfig {
        identity_key: vec!["sku".into()],
        merge_strategy: strategy,
        fields: vec![
            FieldSpec {
                sources: vec!["SKU".into(), "Item Code".into()],
                required: true,
                ..field("sku", FieldType::String)
            },
            field("name", FieldType::String),
            FieldSpec {
                required: true,
                ..field("price", FieldType::Decimal)
            },
            field("desc", FieldType::String),
            field("stock", FieldType::Integer),
        ],
        null_tokens: vec!["n/a".into(), "null".into()],
        rules: vec![
            RuleSpec::new(
                "price-non-negative",
                Severity::Error,
                RuleKind::Range {
                    field: "price".into(),
                    min: Some(0.0),
                    max: None,
                },
            )
            .with_weight(2.0),
            RuleSpec::new(
                "name-length",
                Severity::Warning,
                RuleKind::MaxLength {
                    field: "name".into(),
                    max: 20,
                },
            ),
        ],
    }
}

pub fn field_rules(pairs: &[(&str, FieldPolicy)]) -> MergeStrategy {
    MergeStrategy::FieldRules {
        default: FieldPolicy::KeepLast,
        fields: pairs.iter().map(|(k, p)| (k.to_string(), *p)).collect(),
    }
}

pub fn product_config(strategy: MergeStrategy, chunk_size: usize) -> PipelineConfig {
    PipelineConfig::default()
        .with_record_type("product", product_type(strategy))
        .with_chunk_size(chunk_size)
}

// ============================================================================
// Raw rows
// ============================================================================

pub fn product(sku: &str, name: &str, price: &str, desc: &str) -> RawRecord {
    RawRecord::from_pairs([
        ("SKU", RawValue::text(sku)),
        ("name", RawValue::text(name)),
        ("price", RawValue::text(price)),
        ("desc", RawValue::text(desc)),
    ])
}

pub fn products(rows: Vec<RawRecord>) -> MemorySource {
    MemorySource::new(RecordType::product(), rows)
}

pub fn key(sku: &str) -> IdentityKey {
    IdentityKey::from_fields(RecordType::product(), &[sku.to_lowercase()])
}

/// Records written to `sink`, grouped by identity key in write order
pub fn written_by_key(sink: &MemorySink) -> BTreeMap<String, Vec<ResolvedRecord>> {
    let mut by_key: BTreeMap<String, Vec<ResolvedRecord>> = BTreeMap::new();
    for record in sink.records() {
        by_key.entry(record.key.to_string()).or_default().push(record);
    }
    by_key
}

// ============================================================================
// Failing collaborators
// ============================================================================

/// Refuses every record whose key matches the predicate
pub struct RejectingSink {
    pub inner: MemorySink,
    reject: Box<dyn Fn(&ResolvedRecord) -> bool + Send + Sync>,
}

impl RejectingSink {
    pub fn new(reject: impl Fn(&ResolvedRecord) -> bool + Send + Sync + 'static) -> Self {
        Self {
            inner: MemorySink::new(),
            reject: Box::new(reject),
        }
    }

    pub fn all() -> Self {
        Self::new(|_| true)
    }
}

#[async_trait]
impl RecordSink for RejectingSink {
    async fn write(&self, records: &[ResolvedRecord]) -> Result<(), WriteError> {
        let (rejected, accepted): (Vec<&ResolvedRecord>, Vec<&ResolvedRecord>) =
            records.iter().partition(|r| (self.reject)(r));

        let accepted: Vec<ResolvedRecord> = accepted.into_iter().cloned().collect();
        self.inner.write(&accepted).await?;

        if rejected.is_empty() {
            return Ok(());
        }
        Err(WriteError::Rejected {
            failures: rejected
                .into_iter()
                .map(|r| WriteFailure {
                    key: r.key.clone(),
                    reason: "constraint violation".to_string(),
                })
                .collect(),
        })
    }
}

/// Fails the first `failures` reads, then delegates
pub struct FlakySource {
    inner: MemorySource,
    failures: u32,
    calls: AtomicU32,
}

impl FlakySource {
    pub fn new(inner: MemorySource, failures: u32) -> Self {
        Self {
            inner,
            failures,
            calls: AtomicU32::new(0),
        }
    }

    pub fn calls(&self) -> u32 {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl RecordSource for FlakySource {
    async fn next(&self, chunk_size: usize, offset: u64) -> Result<SourceBatch, SourceError> {
        let call = self.calls.fetch_add(1, Ordering::SeqCst);
        if call < self.failures {
            return Err(SourceError::Unavailable("connection reset".to_string()));
        }
        self.inner.next(chunk_size, offset).await
    }
}

// ============================================================================
// Observers
// ============================================================================

/// Cancels the run once `chunks` chunks have committed
pub struct CancelAfter {
    chunks: u64,
    token: CancellationToken,
}

impl CancelAfter {
    pub fn new(chunks: u64, token: CancellationToken) -> Self {
        Self { chunks, token }
    }
}

impl ReportObserver for CancelAfter {
    fn on_chunk(&self, snapshot: &PipelineSnapshot) {
        if snapshot.chunk_index >= self.chunks {
            self.token.cancel();
        }
    }
}

/// Keeps every snapshot it sees
#[derive(Default)]
pub struct Recorder {
    pub snapshots: Mutex<Vec<PipelineSnapshot>>,
    pub finished: Mutex<Option<dataflow_ingest::ReportSummary>>,
}

impl ReportObserver for Recorder {
    fn on_chunk(&self, snapshot: &PipelineSnapshot) {
        if let Ok(mut snapshots) = self.snapshots.lock() {
            snapshots.push(snapshot.clone());
        }
    }

    fn on_finish(&self, summary: &dataflow_ingest::ReportSummary) {
        if let Ok(mut finished) = self.finished.lock() {
            *finished = Some(summary.clone());
        }
    }
}
