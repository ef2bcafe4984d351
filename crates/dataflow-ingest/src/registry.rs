//! Record-type handlers
//!
//! Each record type is served by a [`RecordHandler`] exposing its normalize,
//! validate and identity-key capabilities. The [`HandlerRegistry`] maps record
//! types to handlers; configuration-driven handlers are compiled up front so
//! every malformed mapping, rule or strategy fails before a run starts.

use dataflow_common::{RawRecord, RecordType};
use std::collections::HashMap;
use std::sync::Arc;

use crate::config::{PipelineConfig, RecordTypeConfig};
use crate::error::{ConfigError, NormalizationError};
use crate::merge::MergeStrategy;
use crate::normalize::{self, FieldMapping, Normalized, NormalizedRecord};
use crate::validate::{RuleSet, ValidationResult};

/// Capabilities the pipeline needs from a record type
pub trait RecordHandler: Send + Sync {
    fn record_type(&self) -> &RecordType;

    /// Canonical fields forming the identity key
    fn identity_key_fields(&self) -> &[String];

    fn normalize(&self, raw: &RawRecord, offset: u64) -> Result<Normalized, NormalizationError>;

    fn validate(&self, record: &NormalizedRecord) -> ValidationResult;

    fn merge_strategy(&self) -> Arc<MergeStrategy>;
}

/// Handler compiled from a [`RecordTypeConfig`]
#[derive(Debug, Clone)]
pub struct ConfiguredHandler {
    mapping: FieldMapping,
    rules: RuleSet,
    strategy: Arc<MergeStrategy>,
}

impl ConfiguredHandler {
    pub fn compile(record_type: &RecordType, config: &RecordTypeConfig) -> Result<Self, ConfigError> {
        let mapping = FieldMapping::compile(record_type, config)?;
        let rules = RuleSet::compile(record_type, &config.rules, &mapping)?;
        config.merge_strategy.check(&mapping)?;

        Ok(Self {
            mapping,
            rules,
            strategy: Arc::new(config.merge_strategy.clone()),
        })
    }

    pub fn rule_count(&self) -> usize {
        self.rules.len()
    }
}

impl RecordHandler for ConfiguredHandler {
    fn record_type(&self) -> &RecordType {
        self.mapping.record_type()
    }

    fn identity_key_fields(&self) -> &[String] {
        self.mapping.identity_key_fields()
    }

    fn normalize(&self, raw: &RawRecord, offset: u64) -> Result<Normalized, NormalizationError> {
        normalize::normalize(raw, offset, &self.mapping)
    }

    fn validate(&self, record: &NormalizedRecord) -> ValidationResult {
        self.rules.validate(record)
    }

    fn merge_strategy(&self) -> Arc<MergeStrategy> {
        self.strategy.clone()
    }
}

/// Record type -> handler lookup
#[derive(Clone, Default)]
pub struct HandlerRegistry {
    handlers: HashMap<RecordType, Arc<dyn RecordHandler>>,
}

impl std::fmt::Debug for HandlerRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HandlerRegistry")
            .field("record_types", &self.record_types())
            .finish()
    }
}

impl HandlerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Compile a handler for every configured record type
    pub fn from_config(config: &PipelineConfig) -> Result<Self, ConfigError> {
        let mut registry = Self::new();
        for (name, type_config) in &config.record_types {
            let record_type = RecordType::new(name);
            let handler = ConfiguredHandler::compile(&record_type, type_config)?;
            registry.register(Arc::new(handler))?;
        }
        Ok(registry)
    }

    pub fn register(&mut self, handler: Arc<dyn RecordHandler>) -> Result<(), ConfigError> {
        let record_type = handler.record_type().clone();
        if self.handlers.contains_key(&record_type) {
            return Err(ConfigError::DuplicateRecordType(record_type.to_string()));
        }
        self.handlers.insert(record_type, handler);
        Ok(())
    }

    pub fn get(&self, record_type: &RecordType) -> Option<&Arc<dyn RecordHandler>> {
        self.handlers.get(record_type)
    }

    /// Registered record types, sorted
    pub fn record_types(&self) -> Vec<&RecordType> {
        let mut types: Vec<&RecordType> = self.handlers.keys().collect();
        types.sort();
        types
    }

    pub fn len(&self) -> usize {
        self.handlers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.handlers.is_empty()
    }
}
