//! Schema normalizer
//!
//! Maps a [`RawRecord`] onto the canonical fields of its record type, coercing
//! every value to the field's declared [`FieldType`], and derives the record's
//! [`IdentityKey`]. Pure: no shared state is touched.

use chrono::{DateTime, NaiveDate};
use dataflow_common::{FieldType, FieldValue, RawRecord, RawValue, RecordType};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashSet};
use std::fmt;

use crate::config::{FieldSpec, RecordTypeConfig, Transform};
use crate::error::{ConfigError, NormalizationError};

/// Date layouts tried in order after ISO-8601
const DATE_FORMATS: &[&str] = &[
    "%Y-%m-%d", "%d-%m-%Y", "%Y/%m/%d", "%d/%m/%Y", "%m/%d/%Y", "%d.%m.%Y", "%Y.%m.%d",
];

/// Separator between key fragments
const KEY_SEPARATOR: &str = "|";

// ============================================================================
// Identity Keys
// ============================================================================

/// Grouping key for deduplication.
///
/// Keys are scoped by record type, so a product and an invoice never merge.
/// Records whose key fields are all blank get a singleton key derived from
/// their source offset: unique within a run and stable across resume.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct IdentityKey {
    record_type: RecordType,
    scope: KeyScope,
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(tag = "kind", content = "value", rename_all = "snake_case")]
enum KeyScope {
    /// One fragment per configured key field, compared as a tuple
    Fields(Vec<String>),
    Singleton(u64),
}

impl IdentityKey {
    pub fn from_fields(record_type: RecordType, fragments: &[String]) -> Self {
        Self {
            record_type,
            scope: KeyScope::Fields(fragments.to_vec()),
        }
    }

    pub fn singleton(record_type: RecordType, offset: u64) -> Self {
        Self {
            record_type,
            scope: KeyScope::Singleton(offset),
        }
    }

    pub fn record_type(&self) -> &RecordType {
        &self.record_type
    }

    /// True for keys of records that never merge with anything
    pub fn is_singleton(&self) -> bool {
        matches!(self.scope, KeyScope::Singleton(_))
    }
}

impl fmt::Display for IdentityKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.scope {
            KeyScope::Fields(fragments) => {
                write!(f, "{}{}{}", self.record_type, KEY_SEPARATOR, fragments.join(KEY_SEPARATOR))
            }
            KeyScope::Singleton(offset) => write!(f, "{}#{}", self.record_type, offset),
        }
    }
}

// ============================================================================
// Normalized Records
// ============================================================================

/// Record mapped onto canonical fields; owned by the pipeline for one chunk
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NormalizedRecord {
    pub record_type: RecordType,
    pub identity_key: IdentityKey,
    /// Source offset the raw row was read from
    pub offset: u64,
    pub fields: BTreeMap<String, FieldValue>,
}

impl NormalizedRecord {
    pub fn get(&self, field: &str) -> Option<&FieldValue> {
        self.fields.get(field)
    }

    /// Number of non-blank fields, used by keep-most-complete
    pub fn completeness(&self) -> usize {
        self.fields.values().filter(|v| !v.is_blank()).count()
    }
}

/// Normalizer output: the record plus optional fields whose value was discarded
#[derive(Debug, Clone)]
pub struct Normalized {
    pub record: NormalizedRecord,
    pub coercion_warnings: Vec<String>,
}

// ============================================================================
// Field Mapping
// ============================================================================

#[derive(Debug, Clone)]
struct CompiledField {
    name: String,
    field_type: FieldType,
    sources: Vec<String>,
    required: bool,
    transform: Transform,
    default: Option<String>,
}

/// Compiled per-record-type mapping table
#[derive(Debug, Clone)]
pub struct FieldMapping {
    record_type: RecordType,
    identity_key: Vec<String>,
    fields: Vec<CompiledField>,
    null_tokens: HashSet<String>,
}

impl FieldMapping {
    /// Check and compile a record type's mapping
    pub fn compile(record_type: &RecordType, config: &RecordTypeConfig) -> Result<Self, ConfigError> {
        let invalid = |reason: String| ConfigError::InvalidMapping {
            record_type: record_type.to_string(),
            reason,
        };

        if config.fields.is_empty() {
            return Err(invalid("no fields declared".to_string()));
        }

        let mut seen = HashSet::new();
        let mut fields = Vec::with_capacity(config.fields.len());
        for spec in &config.fields {
            let name = spec.name.trim();
            if name.is_empty() {
                return Err(invalid("field with empty name".to_string()));
            }
            if !seen.insert(name.to_string()) {
                return Err(invalid(format!("field '{}' declared twice", name)));
            }
            fields.push(compile_field(name, spec).map_err(invalid)?);
        }

        if config.identity_key.is_empty() {
            return Err(invalid("identity_key lists no fields".to_string()));
        }
        for key_field in &config.identity_key {
            if !seen.contains(key_field.as_str()) {
                return Err(invalid(format!(
                    "identity key field '{}' is not declared",
                    key_field
                )));
            }
        }

        Ok(Self {
            record_type: record_type.clone(),
            identity_key: config.identity_key.clone(),
            fields,
            null_tokens: config
                .null_tokens
                .iter()
                .map(|t| t.trim().to_lowercase())
                .collect(),
        })
    }

    pub fn record_type(&self) -> &RecordType {
        &self.record_type
    }

    pub fn identity_key_fields(&self) -> &[String] {
        &self.identity_key
    }

    /// Declared type of a canonical field, `None` if undeclared
    pub fn field_type(&self, name: &str) -> Option<FieldType> {
        self.fields
            .iter()
            .find(|f| f.name == name)
            .map(|f| f.field_type)
    }

    fn is_null(&self, value: &RawValue) -> bool {
        if value.is_blank() {
            return true;
        }
        match value {
            RawValue::Text(s) => self.null_tokens.contains(&s.trim().to_lowercase()),
            _ => false,
        }
    }
}

fn compile_field(name: &str, spec: &FieldSpec) -> Result<CompiledField, String> {
    let sources = if spec.sources.is_empty() {
        vec![name.to_string()]
    } else {
        spec.sources.clone()
    };

    if let Some(default) = &spec.default {
        let probe = RawValue::Text(default.clone());
        match coerce(&probe, spec.field_type, spec.transform) {
            Ok(Some(_)) => {}
            Ok(None) => return Err(format!("default for '{}' is blank after transform", name)),
            Err(reason) => return Err(format!("default for '{}' is invalid: {}", name, reason)),
        }
    }

    if matches!(spec.transform, Transform::GstPercent | Transform::CessPercent)
        && !matches!(spec.field_type, FieldType::Integer | FieldType::Decimal)
    {
        return Err(format!(
            "transform on '{}' yields a percentage but the field is {}",
            name, spec.field_type
        ));
    }

    Ok(CompiledField {
        name: name.to_string(),
        field_type: spec.field_type,
        sources,
        required: spec.required,
        transform: spec.transform,
        default: spec.default.clone(),
    })
}

// ============================================================================
// Normalization
// ============================================================================

/// Normalize one raw row read at `offset`.
///
/// A missing or uncoercible value on a `required` field fails the record. On
/// an optional field the value becomes blank and the field is reported in
/// [`Normalized::coercion_warnings`].
pub fn normalize(
    raw: &RawRecord,
    offset: u64,
    mapping: &FieldMapping,
) -> Result<Normalized, NormalizationError> {
    let mut fields = BTreeMap::new();
    let mut coercion_warnings = Vec::new();

    for field in &mapping.fields {
        let picked = field
            .sources
            .iter()
            .filter_map(|source| raw.get(source))
            .find(|value| !mapping.is_null(value))
            .cloned()
            .or_else(|| field.default.clone().map(RawValue::Text));

        let value = match picked {
            None => None,
            Some(value) => match coerce(&value, field.field_type, field.transform) {
                Ok(v) => v,
                Err(reason) if field.required => {
                    return Err(NormalizationError::new(&field.name, reason));
                }
                Err(_) => {
                    coercion_warnings.push(field.name.clone());
                    None
                }
            },
        };

        match value {
            Some(v) => {
                fields.insert(field.name.clone(), v);
            }
            None if field.required => {
                return Err(NormalizationError::new(&field.name, "missing required value"));
            }
            None => {
                fields.insert(field.name.clone(), FieldValue::Blank);
            }
        }
    }

    let fragments: Vec<String> = mapping
        .identity_key
        .iter()
        .map(|name| fields.get(name).map(FieldValue::key_fragment).unwrap_or_default())
        .collect();

    let record_type = mapping.record_type.clone();
    let identity_key = if fragments.iter().all(String::is_empty) {
        IdentityKey::singleton(record_type.clone(), offset)
    } else {
        IdentityKey::from_fields(record_type.clone(), &fragments)
    };

    Ok(Normalized {
        record: NormalizedRecord {
            record_type,
            identity_key,
            offset,
            fields,
        },
        coercion_warnings,
    })
}

/// Coerce a raw value; `Ok(None)` when the transform leaves nothing
fn coerce(
    value: &RawValue,
    field_type: FieldType,
    transform: Transform,
) -> Result<Option<FieldValue>, String> {
    match (value, field_type) {
        (RawValue::Number(n), FieldType::Integer) if transform.is_passthrough() => {
            integer_from_f64(*n).map(Some)
        }
        (RawValue::Number(n), FieldType::Decimal) if transform.is_passthrough() => {
            Ok(Some(FieldValue::Decimal(*n)))
        }
        (RawValue::Date(d), FieldType::Date) => Ok(Some(FieldValue::Date(*d))),
        _ => {
            let Some(rendered) = value.render() else {
                return Ok(None);
            };
            let Some(text) = apply_transform(&rendered, transform) else {
                return Ok(None);
            };
            parse_text(&text, field_type).map(Some)
        }
    }
}

fn parse_text(text: &str, field_type: FieldType) -> Result<FieldValue, String> {
    match field_type {
        FieldType::String => Ok(FieldValue::Text(text.to_string())),
        FieldType::Integer => {
            let cleaned = strip_number(text);
            if let Ok(i) = cleaned.parse::<i64>() {
                return Ok(FieldValue::Integer(i));
            }
            cleaned
                .parse::<f64>()
                .map_err(|_| format!("cannot parse '{}' as integer", text))
                .and_then(integer_from_f64)
        }
        FieldType::Decimal => strip_number(text)
            .parse::<f64>()
            .ok()
            .filter(|d| d.is_finite())
            .map(FieldValue::Decimal)
            .ok_or_else(|| format!("cannot parse '{}' as decimal", text)),
        FieldType::Date => parse_date(text)
            .map(FieldValue::Date)
            .ok_or_else(|| format!("cannot parse '{}' as date", text)),
        FieldType::Boolean => match text.trim().to_lowercase().as_str() {
            "true" | "yes" | "y" | "1" => Ok(FieldValue::Boolean(true)),
            "false" | "no" | "n" | "0" => Ok(FieldValue::Boolean(false)),
            _ => Err(format!("cannot parse '{}' as boolean", text)),
        },
    }
}

fn integer_from_f64(n: f64) -> Result<FieldValue, String> {
    if n.is_finite() && n.fract() == 0.0 && n.abs() < i64::MAX as f64 {
        Ok(FieldValue::Integer(n as i64))
    } else {
        Err(format!("'{}' is not an integer", n))
    }
}

/// Drop thousands separators and surrounding whitespace
fn strip_number(text: &str) -> String {
    text.trim().chars().filter(|c| *c != ',').collect()
}

fn parse_date(text: &str) -> Option<NaiveDate> {
    let text = text.trim();
    DATE_FORMATS
        .iter()
        .find_map(|format| NaiveDate::parse_from_str(text, format).ok())
        .or_else(|| {
            DateTime::parse_from_rfc3339(text)
                .ok()
                .map(|dt| dt.date_naive())
        })
}

/// Apply a text transform; `None` when nothing usable remains
fn apply_transform(text: &str, transform: Transform) -> Option<String> {
    let out = match transform {
        Transform::Trim => text.trim().to_string(),
        Transform::Uppercase => text.trim().to_uppercase(),
        Transform::Lowercase => text.trim().to_lowercase(),
        Transform::Barcode => text
            .chars()
            .filter(|c| c.is_ascii_alphanumeric() || *c == '-')
            .collect(),
        Transform::CollapseWhitespace => text.split_whitespace().collect::<Vec<_>>().join(" "),
        Transform::GstPercent => tax_component(text, 0)?,
        Transform::CessPercent => tax_component(text, 1)?,
    };
    (!out.is_empty()).then_some(out)
}

/// Pull a component out of tax categories such as `"GST 18% (18+0)"`.
///
/// Component 0 is GST, 1 is cess. Without parentheses the whole value is the
/// GST rate and there is no cess.
fn tax_component(text: &str, index: usize) -> Option<String> {
    let text = text.trim();
    let inside = text
        .split_once('(')
        .and_then(|(_, rest)| rest.split_once(')'))
        .map(|(inside, _)| inside);

    match inside {
        Some(inside) => inside
            .split('+')
            .nth(index)
            .map(|part| part.trim().trim_end_matches('%').trim().to_string()),
        None if index == 0 => Some(
            text.trim_start_matches(|c: char| !c.is_ascii_digit() && c != '.' && c != '-')
                .trim_end_matches('%')
                .trim()
                .to_string(),
        ),
        None => None,
    }
}

impl Transform {
    /// Transforms that leave numeric raw values untouched
    fn is_passthrough(self) -> bool {
        matches!(
            self,
            Transform::Trim
                | Transform::Uppercase
                | Transform::Lowercase
                | Transform::CollapseWhitespace
        )
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use crate::config::DEFAULT_NULL_TOKENS;
    use crate::merge::MergeStrategy;

    fn field(name: &str, field_type: FieldType) -> FieldSpec {
        FieldSpec {
            name: name.to_string(),
            field_type,
            sources: Vec::new(),
            required: false,
            transform: Transform::Trim,
            default: None,
        }
    }

    fn product_mapping() -> FieldMapping {
        let mut sku = field("sku", FieldType::String);
        sku.sources = vec!["SKU".into(), "Item Code".into()];
        sku.transform = Transform::Uppercase;
        let mut mrp = field("mrp", FieldType::Decimal);
        mrp.required = true;
        mrp.sources = vec!["MRP".into()];
        let mut expiry = field("expiry", FieldType::Date);
        expiry.sources = vec!["Expiry Date".into()];
        expiry.default = Some("9999-12-31".into());
        let mut gst = field("gst", FieldType::Integer);
        gst.sources = vec!["Tax Category".into()];
        gst.transform = Transform::GstPercent;
        let mut cess = field("cess", FieldType::Integer);
        cess.sources = vec!["Tax Category".into()];
        cess.transform = Transform::CessPercent;

        let config = RecordTypeConfig {
            identity_key: vec!["sku".into()],
            merge_strategy: MergeStrategy::KeepLast,
            fields: vec![sku, mrp, expiry, gst, cess, field("stock", FieldType::Integer)],
            null_tokens: DEFAULT_NULL_TOKENS.iter().map(|s| s.to_string()).collect(),
            rules: Vec::new(),
        };
        FieldMapping::compile(&RecordType::product(), &config).unwrap()
    }

    #[test]
    fn test_normalize_maps_and_coerces() {
        let raw = RawRecord::from_pairs([
            ("Item Code", RawValue::text(" abc123 ")),
            ("MRP", RawValue::text("1,250.50")),
            ("Expiry Date", RawValue::text("31/12/2025")),
            ("Tax Category", RawValue::text("GST 18% (18+0)")),
            ("stock", RawValue::Number(12.0)),
        ]);

        let out = normalize(&raw, 7, &product_mapping()).unwrap();
        let record = out.record;

        assert_eq!(record.get("sku"), Some(&FieldValue::Text("ABC123".into())));
        assert_eq!(record.get("mrp"), Some(&FieldValue::Decimal(1250.5)));
        assert_eq!(
            record.get("expiry"),
            Some(&FieldValue::Date(NaiveDate::from_ymd_opt(2025, 12, 31).unwrap()))
        );
        assert_eq!(record.get("gst"), Some(&FieldValue::Integer(18)));
        assert_eq!(record.get("cess"), Some(&FieldValue::Integer(0)));
        assert_eq!(record.get("stock"), Some(&FieldValue::Integer(12)));
        assert_eq!(record.identity_key.to_string(), "product|abc123");
        assert!(out.coercion_warnings.is_empty());
    }

    #[test]
    fn test_first_non_blank_source_wins() {
        let raw = RawRecord::from_pairs([
            ("SKU", RawValue::text("N/A")),
            ("Item Code", RawValue::text("x-1")),
            ("MRP", RawValue::Number(10.0)),
        ]);

        let record = normalize(&raw, 0, &product_mapping()).unwrap().record;
        assert_eq!(record.get("sku"), Some(&FieldValue::Text("X-1".into())));
    }

    #[test]
    fn test_default_applies_when_blank() {
        let raw = RawRecord::from_pairs([
            ("SKU", RawValue::text("A")),
            ("MRP", RawValue::Number(10.0)),
            ("Expiry Date", RawValue::text("nan")),
        ]);

        let record = normalize(&raw, 0, &product_mapping()).unwrap().record;
        assert_eq!(
            record.get("expiry"),
            Some(&FieldValue::Date(NaiveDate::from_ymd_opt(9999, 12, 31).unwrap()))
        );
        assert_eq!(record.get("cess"), Some(&FieldValue::Blank));
    }

    #[test]
    fn test_required_coercion_failure_is_error() {
        let raw = RawRecord::from_pairs([
            ("SKU", RawValue::text("A")),
            ("MRP", RawValue::text("ten rupees")),
        ]);

        let err = normalize(&raw, 0, &product_mapping()).unwrap_err();
        assert_eq!(err.field, "mrp");
        assert!(err.reason.contains("decimal"));
    }

    #[test]
    fn test_required_missing_is_error() {
        let raw = RawRecord::from_pairs([("SKU", RawValue::text("A"))]);
        let err = normalize(&raw, 0, &product_mapping()).unwrap_err();
        assert_eq!(err.reason, "missing required value");
    }

    #[test]
    fn test_optional_coercion_failure_blanks_and_warns() {
        let raw = RawRecord::from_pairs([
            ("SKU", RawValue::text("A")),
            ("MRP", RawValue::Number(5.0)),
            ("stock", RawValue::text("12.5")),
        ]);

        let out = normalize(&raw, 0, &product_mapping()).unwrap();
        assert_eq!(out.record.get("stock"), Some(&FieldValue::Blank));
        assert_eq!(out.coercion_warnings, vec!["stock".to_string()]);
    }

    #[test]
    fn test_blank_key_becomes_singleton() {
        let raw = RawRecord::from_pairs([("MRP", RawValue::Number(5.0))]);

        let first = normalize(&raw, 3, &product_mapping()).unwrap().record;
        let second = normalize(&raw, 4, &product_mapping()).unwrap().record;

        assert!(first.identity_key.is_singleton());
        assert_ne!(first.identity_key, second.identity_key);
        assert_eq!(first.identity_key, normalize(&raw, 3, &product_mapping()).unwrap().record.identity_key);
    }

    #[test]
    fn test_composite_key_fragments_do_not_collide() {
        let config = RecordTypeConfig {
            identity_key: vec!["sku".into(), "batch".into()],
            merge_strategy: MergeStrategy::KeepLast,
            fields: vec![field("sku", FieldType::String), field("batch", FieldType::String)],
            null_tokens: Vec::new(),
            rules: Vec::new(),
        };
        let mapping = FieldMapping::compile(&RecordType::product(), &config).unwrap();
        let row = |sku: &str, batch: &str| {
            RawRecord::from_pairs([("sku", RawValue::text(sku)), ("batch", RawValue::text(batch))])
        };

        let left = normalize(&row("x|y", "z"), 0, &mapping).unwrap().record;
        let right = normalize(&row("x", "y|z"), 1, &mapping).unwrap().record;
        assert_ne!(left.identity_key, right.identity_key);
        assert_eq!(left.identity_key, normalize(&row("X|Y", "z"), 2, &mapping).unwrap().record.identity_key);

        let mut table = crate::merge::ResolvedTable::new();
        table.fold(left, &MergeStrategy::KeepLast, 8).unwrap();
        table.fold(right, &MergeStrategy::KeepLast, 8).unwrap();
        assert_eq!(table.len(), 2);

        let json = serde_json::to_string(&table).unwrap();
        let back: crate::merge::ResolvedTable = serde_json::from_str(&json).unwrap();
        assert_eq!(back, table);
    }

    #[test]
    fn test_parse_date_formats() {
        let expected = NaiveDate::from_ymd_opt(2024, 3, 5).unwrap();
        for text in ["2024-03-05", "05-03-2024", "2024/03/05", "05.03.2024", "2024-03-05T10:00:00Z"] {
            assert_eq!(parse_date(text), Some(expected), "{}", text);
        }
        assert_eq!(parse_date("03/25/2024"), NaiveDate::from_ymd_opt(2024, 3, 25));
        assert_eq!(parse_date("yesterday"), None);
    }

    #[test]
    fn test_transforms() {
        assert_eq!(apply_transform(" 89 01-23 4/5 ", Transform::Barcode).as_deref(), Some("8901-2345"));
        assert_eq!(
            apply_transform("  Dark   Chocolate ", Transform::CollapseWhitespace).as_deref(),
            Some("Dark Chocolate")
        );
        assert_eq!(apply_transform("GST 28% (28+12)", Transform::CessPercent).as_deref(), Some("12"));
        assert_eq!(apply_transform("5%", Transform::GstPercent).as_deref(), Some("5"));
        assert_eq!(apply_transform("5%", Transform::CessPercent), None);
        assert_eq!(apply_transform("   ", Transform::Trim), None);
    }

    #[test]
    fn test_compile_rejects_bad_mapping() {
        let mut config = RecordTypeConfig {
            identity_key: vec!["missing".into()],
            merge_strategy: MergeStrategy::KeepFirst,
            fields: vec![field("sku", FieldType::String)],
            null_tokens: Vec::new(),
            rules: Vec::new(),
        };
        assert!(FieldMapping::compile(&RecordType::product(), &config).is_err());

        config.identity_key = vec!["sku".into()];
        config.fields.push(field("sku", FieldType::Integer));
        assert!(FieldMapping::compile(&RecordType::product(), &config).is_err());

        let mut bad_default = field("expiry", FieldType::Date);
        bad_default.default = Some("someday".into());
        config.fields = vec![field("sku", FieldType::String), bad_default];
        assert!(FieldMapping::compile(&RecordType::product(), &config).is_err());
    }
}
