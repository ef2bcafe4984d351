//! Pipeline configuration
//!
//! Configuration is read from a TOML/JSON/YAML file and overlaid with
//! `DATAFLOW__*` environment variables (double underscore separates nesting,
//! e.g. `DATAFLOW__PIPELINE__CHUNK_SIZE=1000`).
//!
//! ```toml
//! [pipeline]
//! chunk_size = 500
//! emit = "changed"
//!
//! [record_types.product]
//! identity_key = ["sku"]
//! merge_strategy = { kind = "field-rules", default = "keep-last", fields = { mrp = "keep-max" } }
//!
//! [[record_types.product.fields]]
//! name = "sku"
//! type = "string"
//! sources = ["SKU", "Item Code"]
//! transform = "uppercase"
//!
//! [[record_types.product.rules]]
//! id = "sku-required"
//! kind = "required"
//! field = "sku"
//! severity = "error"
//! ```

use config::{Config, Environment, File, FileFormat};
use dataflow_common::{FieldType, RecordType};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::Path;

use crate::error::ConfigError;
use crate::merge::MergeStrategy;
use crate::validate::RuleSpec;

pub const DEFAULT_CHUNK_SIZE: usize = 500;
pub const DEFAULT_OFFSET: u64 = 0;
pub const DEFAULT_MAX_PROVENANCE_HISTORY: usize = 32;
pub const DEFAULT_WORKER_CONCURRENCY: usize = 1;
pub const DEFAULT_SOURCE_RETRIES: u32 = 3;
pub const DEFAULT_RETRY_BACKOFF_MS: u64 = 200;
pub const DEFAULT_TOP_VIOLATIONS: usize = 10;
pub const DEFAULT_CHECKPOINT_INTERVAL: u64 = 1;
pub const DEFAULT_NULL_TOKENS: &[&str] = &["nan", "null", "none", "n/a"];

/// Environment prefix for configuration overrides
pub const ENV_PREFIX: &str = "DATAFLOW";

/// Which resolved records are handed to the sink after a chunk
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum EmitPolicy {
    /// Every record touched by the chunk
    Touched,
    /// Only records whose content differs from the last written version
    #[default]
    Changed,
}

/// Run-level options
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PipelineOptions {
    #[serde(default = "default_chunk_size")]
    pub chunk_size: usize,
    /// Source offset to start from when not resuming from a checkpoint
    #[serde(default)]
    pub offset: u64,
    #[serde(default = "default_max_provenance_history")]
    pub max_provenance_history: usize,
    /// 1 = sequential merge; N > 1 partitions identity keys over N shards
    #[serde(default = "default_worker_concurrency")]
    pub worker_concurrency: usize,
    #[serde(default)]
    pub emit: EmitPolicy,
    #[serde(default = "default_source_retries")]
    pub source_retries: u32,
    #[serde(default = "default_retry_backoff_ms")]
    pub retry_backoff_ms: u64,
    #[serde(default = "default_top_violations")]
    pub top_violations: usize,
    /// Committed chunks between checkpoint saves.
    ///
    /// Every save rewrites the whole table and report. With N > 1 a crash can
    /// replay up to N - 1 already emitted chunks on resume; a stopped or
    /// aborted run still saves its last commit.
    #[serde(default = "default_checkpoint_interval")]
    pub checkpoint_interval: u64,
}

fn default_chunk_size() -> usize {
    DEFAULT_CHUNK_SIZE
}

fn default_max_provenance_history() -> usize {
    DEFAULT_MAX_PROVENANCE_HISTORY
}

fn default_worker_concurrency() -> usize {
    DEFAULT_WORKER_CONCURRENCY
}

fn default_source_retries() -> u32 {
    DEFAULT_SOURCE_RETRIES
}

fn default_retry_backoff_ms() -> u64 {
    DEFAULT_RETRY_BACKOFF_MS
}

fn default_top_violations() -> usize {
    DEFAULT_TOP_VIOLATIONS
}

fn default_checkpoint_interval() -> u64 {
    DEFAULT_CHECKPOINT_INTERVAL
}

fn default_null_tokens() -> Vec<String> {
    DEFAULT_NULL_TOKENS.iter().map(|s| s.to_string()).collect()
}

impl Default for PipelineOptions {
    fn default() -> Self {
        Self {
            chunk_size: DEFAULT_CHUNK_SIZE,
            offset: DEFAULT_OFFSET,
            max_provenance_history: DEFAULT_MAX_PROVENANCE_HISTORY,
            worker_concurrency: DEFAULT_WORKER_CONCURRENCY,
            emit: EmitPolicy::default(),
            source_retries: DEFAULT_SOURCE_RETRIES,
            retry_backoff_ms: DEFAULT_RETRY_BACKOFF_MS,
            top_violations: DEFAULT_TOP_VIOLATIONS,
            checkpoint_interval: DEFAULT_CHECKPOINT_INTERVAL,
        }
    }
}

impl PipelineOptions {
    /// Check run-level options
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.chunk_size == 0 {
            return Err(ConfigError::option("chunk_size", "must be greater than 0"));
        }
        if self.max_provenance_history == 0 {
            return Err(ConfigError::option(
                "max_provenance_history",
                "must be greater than 0",
            ));
        }
        if self.worker_concurrency == 0 {
            return Err(ConfigError::option("worker_concurrency", "must be at least 1"));
        }
        if self.checkpoint_interval == 0 {
            return Err(ConfigError::option("checkpoint_interval", "must be at least 1"));
        }
        Ok(())
    }
}

/// Text transform applied before type coercion
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum Transform {
    #[default]
    Trim,
    Uppercase,
    Lowercase,
    /// Keep ASCII alphanumerics and '-'
    Barcode,
    CollapseWhitespace,
    /// GST component of a tax category such as "GST 18% (18+0)"
    GstPercent,
    /// Cess component of a tax category
    CessPercent,
}

/// One canonical field of a record type
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FieldSpec {
    pub name: String,
    #[serde(rename = "type")]
    pub field_type: FieldType,
    /// Source field names, first non-blank wins; empty means the field's own name
    #[serde(default)]
    pub sources: Vec<String>,
    #[serde(default)]
    pub required: bool,
    #[serde(default)]
    pub transform: Transform,
    /// Raw text used when every source is blank
    #[serde(default)]
    pub default: Option<String>,
}

/// Mapping, rules and merge strategy of one record type
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RecordTypeConfig {
    pub identity_key: Vec<String>,
    pub merge_strategy: MergeStrategy,
    pub fields: Vec<FieldSpec>,
    #[serde(default = "default_null_tokens")]
    pub null_tokens: Vec<String>,
    #[serde(default)]
    pub rules: Vec<RuleSpec>,
}

/// Complete pipeline configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct PipelineConfig {
    #[serde(default)]
    pub pipeline: PipelineOptions,
    #[serde(default)]
    pub record_types: BTreeMap<String, RecordTypeConfig>,
}

impl PipelineConfig {
    /// Load from a file plus `DATAFLOW__*` environment overrides.
    ///
    /// The file format follows its extension (toml, json, yaml).
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let _ = dotenvy::dotenv();

        let config: Self = Config::builder()
            .add_source(File::from(path))
            .add_source(Self::environment())
            .build()?
            .try_deserialize()?;

        config.validate()?;
        Ok(config)
    }

    /// Parse an in-memory document of the given format
    pub fn from_str(content: &str, format: FileFormat) -> Result<Self, ConfigError> {
        let config: Self = Config::builder()
            .add_source(File::from_str(content, format))
            .build()?
            .try_deserialize()?;

        config.validate()?;
        Ok(config)
    }

    fn environment() -> Environment {
        Environment::with_prefix(ENV_PREFIX)
            .prefix_separator("__")
            .separator("__")
            .try_parsing(true)
    }

    /// Check options and that at least one record type is configured.
    ///
    /// Per-type mapping, rule and strategy checks happen when the handler
    /// registry is compiled.
    pub fn validate(&self) -> Result<(), ConfigError> {
        self.pipeline.validate()?;
        if self.record_types.is_empty() {
            return Err(ConfigError::option("record_types", "no record types configured"));
        }
        Ok(())
    }

    pub fn record_type(&self, name: &RecordType) -> Option<&RecordTypeConfig> {
        self.record_types
            .iter()
            .find(|(key, _)| RecordType::new(key) == *name)
            .map(|(_, config)| config)
    }

    pub fn with_record_type(mut self, name: impl Into<String>, config: RecordTypeConfig) -> Self {
        self.record_types.insert(name.into(), config);
        self
    }

    pub fn with_chunk_size(mut self, chunk_size: usize) -> Self {
        self.pipeline.chunk_size = chunk_size;
        self
    }

    pub fn with_offset(mut self, offset: u64) -> Self {
        self.pipeline.offset = offset;
        self
    }

    pub fn with_worker_concurrency(mut self, workers: usize) -> Self {
        self.pipeline.worker_concurrency = workers;
        self
    }

    pub fn with_emit(mut self, emit: EmitPolicy) -> Self {
        self.pipeline.emit = emit;
        self
    }

    pub fn with_checkpoint_interval(mut self, chunks: u64) -> Self {
        self.pipeline.checkpoint_interval = chunks;
        self
    }
}
