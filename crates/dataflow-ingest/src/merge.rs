//! Deduplication and merge engine
//!
//! Maintains the `identity key -> resolved record` table and folds eligible
//! records into it according to the record type's [`MergeStrategy`].
//!
//! The table is transactional per chunk: [`ResolvedTable::begin_chunk`] opens
//! an undo journal, [`ResolvedTable::rollback_chunk`] restores every entry the
//! chunk touched. [`ShardedTable`] partitions keys over disjoint shards so that
//! shards can be merged concurrently without two workers ever sharing a key.

use dataflow_common::fingerprint::{content_fingerprint, stable_shard};
use dataflow_common::{FieldType, FieldValue, RecordType};
use rayon::prelude::*;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::cmp::Ordering;
use std::collections::{BTreeMap, VecDeque};
use std::sync::Arc;

use crate::error::{ConfigError, MergeConflictError};
use crate::normalize::{FieldMapping, IdentityKey, NormalizedRecord};

/// Separator used by the `concat` field policy
const CONCAT_SEPARATOR: &str = " | ";

// ============================================================================
// Strategies
// ============================================================================

/// Conflict-resolution policy of a record type; fixed for the whole run
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "kebab-case")]
pub enum MergeStrategy {
    /// Existing record wins
    KeepFirst,
    /// Incoming record replaces the existing one wholesale
    KeepLast,
    /// Record with more non-blank fields wins as a whole; ties keep existing
    KeepMostComplete,
    /// Per-field policies, synthesizing a record from both inputs
    FieldRules {
        #[serde(default)]
        default: FieldPolicy,
        #[serde(default)]
        fields: BTreeMap<String, FieldPolicy>,
    },
}

/// Per-field policy used by [`MergeStrategy::FieldRules`].
///
/// Blank always loses to non-blank.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "kebab-case")]
pub enum FieldPolicy {
    KeepMax,
    KeepMin,
    KeepLongest,
    KeepFirst,
    #[default]
    KeepLast,
    /// Numeric accumulation
    Sum,
    /// Running mean over the non-blank values seen; decimal fields only
    Avg,
    /// Distinct text values joined with " | "
    Concat,
}

impl FieldPolicy {
    pub fn name(&self) -> &'static str {
        match self {
            FieldPolicy::KeepMax => "keep-max",
            FieldPolicy::KeepMin => "keep-min",
            FieldPolicy::KeepLongest => "keep-longest",
            FieldPolicy::KeepFirst => "keep-first",
            FieldPolicy::KeepLast => "keep-last",
            FieldPolicy::Sum => "sum",
            FieldPolicy::Avg => "avg",
            FieldPolicy::Concat => "concat",
        }
    }

    /// Policies that only make sense for some field types
    fn is_typed(&self) -> bool {
        matches!(self, FieldPolicy::Sum | FieldPolicy::Avg | FieldPolicy::Concat)
    }
}

impl MergeStrategy {
    pub fn name(&self) -> &str {
        match self {
            MergeStrategy::KeepFirst => "keep-first",
            MergeStrategy::KeepLast => "keep-last",
            MergeStrategy::KeepMostComplete => "keep-most-complete",
            MergeStrategy::FieldRules { .. } => "field-rules",
        }
    }

    /// Check field-rules entries against the record type's mapping
    pub fn check(&self, mapping: &FieldMapping) -> Result<(), ConfigError> {
        let MergeStrategy::FieldRules { default, fields } = self else {
            return Ok(());
        };

        let invalid = |reason: String| ConfigError::InvalidStrategy {
            record_type: mapping.record_type().to_string(),
            reason,
        };

        if default.is_typed() {
            return Err(invalid(format!(
                "{} cannot be the default policy; name the fields it applies to",
                default.name()
            )));
        }

        for (field, policy) in fields {
            let field_type = mapping
                .field_type(field)
                .ok_or_else(|| invalid(format!("field '{}' is not declared", field)))?;
            let supported = match policy {
                FieldPolicy::Sum => matches!(
                    field_type,
                    FieldType::Integer | FieldType::Decimal
                ),
                FieldPolicy::Avg => field_type == FieldType::Decimal,
                FieldPolicy::Concat => field_type == FieldType::String,
                FieldPolicy::KeepMax | FieldPolicy::KeepMin => {
                    field_type != FieldType::Boolean
                }
                _ => true,
            };
            if !supported {
                return Err(invalid(format!(
                    "policy {} does not apply to {} field '{}'",
                    policy.name(),
                    field_type,
                    field
                )));
            }
        }
        Ok(())
    }
}

// ============================================================================
// Resolved Records
// ============================================================================

/// How many and which source rows contributed to a resolved record
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Provenance {
    pub count: u64,
    /// Contributing source offsets, oldest first, capped
    pub offsets: VecDeque<u64>,
}

impl Provenance {
    fn first(offset: u64) -> Self {
        Self {
            count: 1,
            offsets: VecDeque::from([offset]),
        }
    }

    fn record(&mut self, offset: u64, max_history: usize) {
        self.count += 1;
        self.offsets.push_back(offset);
        while self.offsets.len() > max_history.max(1) {
            self.offsets.pop_front();
        }
    }
}

/// The single record kept per identity key
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResolvedRecord {
    pub key: IdentityKey,
    pub record_type: RecordType,
    pub fields: BTreeMap<String, FieldValue>,
    pub provenance: Provenance,
    /// Content fingerprint of the version last accepted by the sink
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub(crate) emitted_fingerprint: Option<String>,
    /// Non-blank values folded into each `avg` field so far
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub(crate) avg_samples: BTreeMap<String, u64>,
}

impl ResolvedRecord {
    fn from_incoming(incoming: NormalizedRecord) -> Self {
        Self {
            key: incoming.identity_key,
            record_type: incoming.record_type,
            fields: incoming.fields,
            provenance: Provenance::first(incoming.offset),
            emitted_fingerprint: None,
            avg_samples: BTreeMap::new(),
        }
    }

    pub fn get(&self, field: &str) -> Option<&FieldValue> {
        self.fields.get(field)
    }

    /// Fingerprint of the field contents (provenance excluded)
    pub fn fingerprint(&self) -> dataflow_common::Result<String> {
        content_fingerprint(&self.fields)
    }

    /// True when the current content differs from what the sink last accepted
    pub fn changed_since_emit(&self) -> bool {
        match (&self.emitted_fingerprint, self.fingerprint()) {
            (Some(previous), Ok(current)) => *previous != current,
            _ => true,
        }
    }

    /// Plain JSON shape handed to output sinks
    pub fn to_json(&self) -> serde_json::Value {
        let fields: serde_json::Map<String, serde_json::Value> = self
            .fields
            .iter()
            .map(|(name, value)| (name.clone(), value.to_json_value()))
            .collect();

        serde_json::json!({
            "identity_key": self.key.to_string(),
            "record_type": self.record_type,
            "fields": fields,
            "provenance": {
                "count": self.provenance.count,
                "offsets": self.provenance.offsets,
            },
        })
    }

    fn completeness(&self) -> usize {
        self.fields.values().filter(|v| !v.is_blank()).count()
    }
}

// ============================================================================
// Merge
// ============================================================================

/// Fold `incoming` into `existing` (or start a new group).
///
/// Type conflicts between non-blank values, and numeric policies that would
/// overflow, leave nothing changed and return [`MergeConflictError`]; the
/// caller keeps the existing record.
pub fn merge(
    existing: Option<&ResolvedRecord>,
    incoming: NormalizedRecord,
    strategy: &MergeStrategy,
    max_history: usize,
) -> Result<ResolvedRecord, MergeConflictError> {
    let Some(existing) = existing else {
        return Ok(ResolvedRecord::from_incoming(incoming));
    };

    check_types(existing, &incoming)?;

    let mut resolved = existing.clone();
    let offset = incoming.offset;

    match strategy {
        MergeStrategy::KeepFirst => {}
        MergeStrategy::KeepLast => resolved.fields = incoming.fields,
        MergeStrategy::KeepMostComplete => {
            if incoming.completeness() > existing.completeness() {
                resolved.fields = incoming.fields;
            }
        }
        MergeStrategy::FieldRules { default, fields } => {
            let mut incoming_fields = incoming.fields;
            let mut merged = BTreeMap::new();

            for (name, current) in &existing.fields {
                let policy = fields.get(name).copied().unwrap_or(*default);
                let value = match incoming_fields.remove(name) {
                    Some(new) if policy == FieldPolicy::Avg => {
                        average_field(name, current, new, &mut resolved.avg_samples)?
                    }
                    Some(new) => resolve_field(name, current, new, policy)?,
                    None => current.clone(),
                };
                merged.insert(name.clone(), value);
            }
            merged.extend(incoming_fields);
            resolved.fields = merged;
        }
    }

    resolved.provenance.record(offset, max_history);
    Ok(resolved)
}

fn check_types(existing: &ResolvedRecord, incoming: &NormalizedRecord) -> Result<(), MergeConflictError> {
    for (name, new) in &incoming.fields {
        let (Some(current), Some(new_type)) = (existing.fields.get(name), new.field_type()) else {
            continue;
        };
        if let Some(current_type) = current.field_type() {
            if current_type != new_type {
                return Err(MergeConflictError::TypeMismatch {
                    field: name.clone(),
                    existing: current_type,
                    incoming: new_type,
                });
            }
        }
    }
    Ok(())
}

fn overflow(field: &str, policy: FieldPolicy) -> MergeConflictError {
    MergeConflictError::Overflow {
        field: field.to_string(),
        policy: policy.name(),
    }
}

fn resolve_field(
    name: &str,
    current: &FieldValue,
    new: FieldValue,
    policy: FieldPolicy,
) -> Result<FieldValue, MergeConflictError> {
    if new.is_blank() {
        return Ok(current.clone());
    }
    if current.is_blank() {
        return Ok(new);
    }

    let value = match policy {
        FieldPolicy::KeepFirst => current.clone(),
        FieldPolicy::KeepLast => new,
        FieldPolicy::KeepMax => match new.compare(current) {
            Some(Ordering::Greater) => new,
            _ => current.clone(),
        },
        FieldPolicy::KeepMin => match new.compare(current) {
            Some(Ordering::Less) => new,
            _ => current.clone(),
        },
        FieldPolicy::KeepLongest => {
            if new.display_len() > current.display_len() {
                new
            } else {
                current.clone()
            }
        }
        FieldPolicy::Sum => match (current, &new) {
            (FieldValue::Integer(a), FieldValue::Integer(b)) => {
                FieldValue::Integer(a.checked_add(*b).ok_or_else(|| overflow(name, policy))?)
            }
            (FieldValue::Decimal(a), FieldValue::Decimal(b)) => {
                let total = a + b;
                if !total.is_finite() {
                    return Err(overflow(name, policy));
                }
                FieldValue::Decimal(total)
            }
            _ => current.clone(),
        },
        // Handled by average_field; a non-decimal value keeps the existing one
        FieldPolicy::Avg => current.clone(),
        FieldPolicy::Concat => match (current, &new) {
            (FieldValue::Text(joined), FieldValue::Text(add)) => {
                let add = add.trim();
                if joined.split(CONCAT_SEPARATOR).any(|part| part == add) {
                    current.clone()
                } else {
                    FieldValue::Text(format!("{}{}{}", joined, CONCAT_SEPARATOR, add))
                }
            }
            _ => new,
        },
    };
    Ok(value)
}

/// Fold `new` into the running mean held in `current`
fn average_field(
    name: &str,
    current: &FieldValue,
    new: FieldValue,
    samples: &mut BTreeMap<String, u64>,
) -> Result<FieldValue, MergeConflictError> {
    if new.is_blank() {
        return Ok(current.clone());
    }
    if current.is_blank() {
        samples.insert(name.to_string(), 1);
        return Ok(new);
    }

    let (FieldValue::Decimal(mean), FieldValue::Decimal(value)) = (current, &new) else {
        return Ok(current.clone());
    };
    let seen = samples.get(name).copied().unwrap_or(1);
    let next = mean + (value - mean) / (seen + 1) as f64;
    if !next.is_finite() {
        return Err(overflow(name, FieldPolicy::Avg));
    }
    samples.insert(name.to_string(), seen + 1);
    Ok(FieldValue::Decimal(next))
}

// ============================================================================
// Resolved Table
// ============================================================================

/// Result of folding one record into the table
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FoldOutcome {
    /// First record for its key
    Created,
    /// Merged into an existing group
    Merged,
}

/// Process-wide `identity key -> resolved record` table
#[derive(Debug, Clone, Default)]
pub struct ResolvedTable {
    entries: BTreeMap<IdentityKey, ResolvedRecord>,
    /// Pre-chunk state of every key touched by the open chunk
    journal: Option<BTreeMap<IdentityKey, Option<ResolvedRecord>>>,
}

impl PartialEq for ResolvedTable {
    fn eq(&self, other: &Self) -> bool {
        self.entries == other.entries
    }
}

impl ResolvedTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn get(&self, key: &IdentityKey) -> Option<&ResolvedRecord> {
        self.entries.get(key)
    }

    pub fn records(&self) -> impl Iterator<Item = &ResolvedRecord> {
        self.entries.values()
    }

    /// Fold an eligible record into its group
    pub fn fold(
        &mut self,
        incoming: NormalizedRecord,
        strategy: &MergeStrategy,
        max_history: usize,
    ) -> Result<FoldOutcome, MergeConflictError> {
        let key = incoming.identity_key.clone();
        let existing = self.entries.get(&key);
        let outcome = if existing.is_some() {
            FoldOutcome::Merged
        } else {
            FoldOutcome::Created
        };

        let resolved = merge(existing, incoming, strategy, max_history)?;

        if let Some(journal) = self.journal.as_mut() {
            if !journal.contains_key(&key) {
                journal.insert(key.clone(), self.entries.get(&key).cloned());
            }
        }
        self.entries.insert(key, resolved);
        Ok(outcome)
    }

    /// Open the undo journal for a chunk
    pub fn begin_chunk(&mut self) {
        self.journal = Some(BTreeMap::new());
    }

    /// Keys touched by the open chunk, in key order
    pub fn touched(&self) -> Vec<IdentityKey> {
        self.journal
            .as_ref()
            .map(|journal| journal.keys().cloned().collect())
            .unwrap_or_default()
    }

    /// Close the journal, keeping every change
    pub fn commit_chunk(&mut self) {
        self.journal = None;
    }

    /// Restore every key touched since [`begin_chunk`](Self::begin_chunk)
    pub fn rollback_chunk(&mut self) {
        let Some(journal) = self.journal.take() else {
            return;
        };
        for (key, previous) in journal {
            match previous {
                Some(record) => {
                    self.entries.insert(key, record);
                }
                None => {
                    self.entries.remove(&key);
                }
            }
        }
    }

    /// Remember the fingerprint the sink accepted for `key`
    pub(crate) fn mark_emitted(&mut self, key: &IdentityKey, fingerprint: String) {
        if let Some(record) = self.entries.get_mut(key) {
            record.emitted_fingerprint = Some(fingerprint);
        }
    }

    fn insert(&mut self, record: ResolvedRecord) {
        self.entries.insert(record.key.clone(), record);
    }

    fn absorb(&mut self, other: ResolvedTable) {
        self.entries.extend(other.entries);
    }
}

impl Serialize for ResolvedTable {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_seq(self.entries.values())
    }
}

impl<'de> Deserialize<'de> for ResolvedTable {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let records = Vec::<ResolvedRecord>::deserialize(deserializer)?;
        let mut table = ResolvedTable::new();
        for record in records {
            table.insert(record);
        }
        Ok(table)
    }
}

// ============================================================================
// Sharded Table
// ============================================================================

/// Record queued for a shard, with the strategy of its record type
pub struct FoldItem {
    pub record: NormalizedRecord,
    pub strategy: Arc<MergeStrategy>,
}

/// Result of a queued fold, reported in source order
#[derive(Debug, Clone)]
pub struct FoldResult {
    pub offset: u64,
    pub key: IdentityKey,
    pub outcome: Result<FoldOutcome, MergeConflictError>,
}

/// Resolved table split into disjoint shards by a stable hash of the key.
///
/// Every key lives in exactly one shard, so shards merge independently and
/// each preserves arrival order; the result equals a sequential fold.
#[derive(Debug, Clone)]
pub struct ShardedTable {
    shards: Vec<ResolvedTable>,
}

impl ShardedTable {
    pub fn new(shards: usize) -> Self {
        Self {
            shards: vec![ResolvedTable::new(); shards.max(1)],
        }
    }

    /// Redistribute a flat table over `shards` shards
    pub fn restore(table: ResolvedTable, shards: usize) -> Self {
        let mut sharded = Self::new(shards);
        for (key, record) in table.entries {
            let index = sharded.shard_for(&key);
            sharded.shards[index].entries.insert(key, record);
        }
        sharded
    }

    /// Flatten into a single table
    pub fn snapshot(&self) -> ResolvedTable {
        let mut table = ResolvedTable::new();
        for shard in &self.shards {
            let mut copy = shard.clone();
            copy.journal = None;
            table.absorb(copy);
        }
        table
    }

    pub fn shard_count(&self) -> usize {
        self.shards.len()
    }

    pub fn shard_for(&self, key: &IdentityKey) -> usize {
        stable_shard(&key.to_string(), self.shards.len())
    }

    pub fn len(&self) -> usize {
        self.shards.iter().map(ResolvedTable::len).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.shards.iter().all(ResolvedTable::is_empty)
    }

    pub fn get(&self, key: &IdentityKey) -> Option<&ResolvedRecord> {
        self.shards[self.shard_for(key)].get(key)
    }

    /// Fold a chunk's eligible records; results come back sorted by offset
    pub fn fold_batch(&mut self, items: Vec<FoldItem>, max_history: usize) -> Vec<FoldResult> {
        let mut results = if self.shards.len() == 1 {
            fold_sequential(&mut self.shards[0], items, max_history)
        } else {
            let mut buckets: Vec<Vec<FoldItem>> = (0..self.shards.len()).map(|_| Vec::new()).collect();
            for item in items {
                let index = self.shard_for(&item.record.identity_key);
                buckets[index].push(item);
            }

            self.shards
                .par_iter_mut()
                .zip(buckets.into_par_iter())
                .map(|(shard, bucket)| fold_sequential(shard, bucket, max_history))
                .flatten()
                .collect::<Vec<_>>()
        };

        results.sort_by_key(|r| r.offset);
        results
    }

    pub fn begin_chunk(&mut self) {
        self.shards.iter_mut().for_each(ResolvedTable::begin_chunk);
    }

    pub fn commit_chunk(&mut self) {
        self.shards.iter_mut().for_each(ResolvedTable::commit_chunk);
    }

    pub fn rollback_chunk(&mut self) {
        self.shards.iter_mut().for_each(ResolvedTable::rollback_chunk);
    }

    /// Records touched by the open chunk, in key order
    pub fn touched(&self) -> Vec<&ResolvedRecord> {
        let mut keys: Vec<IdentityKey> = self.shards.iter().flat_map(ResolvedTable::touched).collect();
        keys.sort();
        keys.iter().filter_map(|key| self.get(key)).collect()
    }

    pub(crate) fn mark_emitted(&mut self, key: &IdentityKey, fingerprint: String) {
        let index = self.shard_for(key);
        self.shards[index].mark_emitted(key, fingerprint);
    }
}

fn fold_sequential(table: &mut ResolvedTable, items: Vec<FoldItem>, max_history: usize) -> Vec<FoldResult> {
    items
        .into_iter()
        .map(|item| {
            let offset = item.record.offset;
            let key = item.record.identity_key.clone();
            let outcome = table.fold(item.record, &item.strategy, max_history);
            FoldResult { offset, key, outcome }
        })
        .collect()
}
