//! Collaborator framework
//!
//! Traits for the pipeline's input and output collaborators plus the adapters
//! shipped with the crate. Sources and sinks are the only suspension points
//! of a run; every transform stage between them is synchronous.

pub mod sink;
pub mod source;
pub mod types;

// Re-export commonly used types
pub use sink::{JsonLinesSink, MemorySink, RecordSink};
pub use source::{CsvSource, MemorySource, RecordSource};
pub use types::{PipelineSnapshot, RunState, SourceBatch, SourceRow};
