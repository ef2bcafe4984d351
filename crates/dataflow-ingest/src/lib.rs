//! DataFlow Ingest Library
//!
//! Chunked, resumable ingestion of heterogeneous business records (products,
//! invoices, purchases): schema normalization, rule-based validation,
//! identity-key deduplication with configurable merge strategies, and a
//! cumulative quality report.
//!
//! # Stages
//!
//! - **Normalize**: map source fields onto a record type's canonical schema
//! - **Validate**: score each record against its ordered rule list
//! - **Merge**: fold eligible records into one resolved record per identity key
//! - **Report**: counts, error entries, rule tallies and quality histogram
//!
//! # Example
//!
//! ```no_run
//! use dataflow_common::RecordType;
//! use dataflow_ingest::framework::{CsvSource, JsonLinesSink};
//! use dataflow_ingest::{Pipeline, PipelineConfig};
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let config = PipelineConfig::load("dataflow.toml")?;
//!     let source = CsvSource::open("products.csv", RecordType::product())?;
//!     let sink = JsonLinesSink::open("resolved.jsonl")?;
//!
//!     let mut pipeline = Pipeline::new(&config)?;
//!     let outcome = pipeline.run(&source, &sink).await;
//!     println!("{} groups", outcome.summary.resolved_groups);
//!     Ok(())
//! }
//! ```

#![deny(clippy::unwrap_used, clippy::expect_used)]

pub mod checkpoint;
pub mod config;
pub mod error;
pub mod framework;
pub mod merge;
pub mod normalize;
pub mod observer;
pub mod pipeline;
pub mod registry;
pub mod report;
pub mod validate;

// Re-export commonly used types
pub use checkpoint::{Checkpoint, CheckpointStore};
pub use config::{EmitPolicy, PipelineConfig, PipelineOptions, RecordTypeConfig};
pub use error::{ConfigError, MergeConflictError, NormalizationError, SourceError, Stage, WriteError};
pub use merge::{merge, MergeStrategy, ResolvedRecord};
pub use normalize::{normalize, IdentityKey, NormalizedRecord};
pub use observer::{ProgressObserver, ReportObserver, TracingObserver};
pub use pipeline::{Pipeline, RunOutcome};
pub use registry::{ConfiguredHandler, HandlerRegistry, RecordHandler};
pub use report::{ProcessingReport, ReportSummary};
pub use validate::{validate, RuleSet, ValidationResult};
