//! Value model shared across DataFlow
//!
//! Raw rows arrive as [`RawRecord`]s holding untyped [`RawValue`]s. The
//! normalizer turns them into typed [`FieldValue`]s keyed by canonical field
//! names; every later stage (validation, merge, emission) works on those.

use chrono::NaiveDate;
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::fmt;

// ============================================================================
// Record Types
// ============================================================================

/// Tag naming the kind of business record (product, invoice, purchase, ...).
///
/// Names are stored lowercase and trimmed so that `"Product"` and `"product"`
/// select the same registry entry.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub struct RecordType(String);

impl RecordType {
    pub fn new(name: impl AsRef<str>) -> Self {
        Self(name.as_ref().trim().to_lowercase())
    }

    pub fn product() -> Self {
        Self::new("product")
    }

    pub fn invoice() -> Self {
        Self::new("invoice")
    }

    pub fn purchase() -> Self {
        Self::new("purchase")
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<String> for RecordType {
    fn from(value: String) -> Self {
        Self::new(value)
    }
}

impl From<&str> for RecordType {
    fn from(value: &str) -> Self {
        Self::new(value)
    }
}

impl From<RecordType> for String {
    fn from(value: RecordType) -> Self {
        value.0
    }
}

impl fmt::Display for RecordType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

// ============================================================================
// Raw Values
// ============================================================================

/// Untyped scalar produced by a source reader
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum RawValue {
    Number(f64),
    Date(NaiveDate),
    Text(String),
    Blank,
}

impl RawValue {
    pub fn text(value: impl Into<String>) -> Self {
        RawValue::Text(value.into())
    }

    /// True for [`RawValue::Blank`] and whitespace-only text
    pub fn is_blank(&self) -> bool {
        match self {
            RawValue::Blank => true,
            RawValue::Text(s) => s.trim().is_empty(),
            RawValue::Number(n) => n.is_nan(),
            RawValue::Date(_) => false,
        }
    }

    /// Render the value as text, `None` when blank
    pub fn render(&self) -> Option<String> {
        if self.is_blank() {
            return None;
        }
        match self {
            RawValue::Text(s) => Some(s.clone()),
            RawValue::Number(n) => Some(format_number(*n)),
            RawValue::Date(d) => Some(d.format("%Y-%m-%d").to_string()),
            RawValue::Blank => None,
        }
    }
}

impl From<&str> for RawValue {
    fn from(value: &str) -> Self {
        RawValue::Text(value.to_string())
    }
}

impl From<f64> for RawValue {
    fn from(value: f64) -> Self {
        RawValue::Number(value)
    }
}

impl From<i64> for RawValue {
    fn from(value: i64) -> Self {
        RawValue::Number(value as f64)
    }
}

/// Ordered mapping of source field name to raw value, as read from a source
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct RawRecord {
    fields: Vec<(String, RawValue)>,
}

impl RawRecord {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_pairs<I, K, V>(pairs: I) -> Self
    where
        I: IntoIterator<Item = (K, V)>,
        K: Into<String>,
        V: Into<RawValue>,
    {
        Self {
            fields: pairs
                .into_iter()
                .map(|(k, v)| (k.into(), v.into()))
                .collect(),
        }
    }

    pub fn push(&mut self, name: impl Into<String>, value: impl Into<RawValue>) {
        self.fields.push((name.into(), value.into()));
    }

    /// Look up a source field.
    ///
    /// Exact header match first, then a case- and whitespace-insensitive match
    /// (spreadsheet headers drift: `"Item Name "` vs `"item name"`).
    pub fn get(&self, name: &str) -> Option<&RawValue> {
        if let Some((_, v)) = self.fields.iter().find(|(k, _)| k == name) {
            return Some(v);
        }
        let wanted = fold_header(name);
        self.fields
            .iter()
            .find(|(k, _)| fold_header(k) == wanted)
            .map(|(_, v)| v)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &RawValue)> {
        self.fields.iter().map(|(k, v)| (k.as_str(), v))
    }

    pub fn len(&self) -> usize {
        self.fields.len()
    }

    pub fn is_empty(&self) -> bool {
        self.fields.is_empty()
    }
}

fn fold_header(name: &str) -> String {
    name.split_whitespace()
        .collect::<Vec<_>>()
        .join(" ")
        .to_lowercase()
}

// ============================================================================
// Typed Values
// ============================================================================

/// Declared type of a canonical field
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FieldType {
    String,
    Integer,
    Decimal,
    Date,
    Boolean,
}

impl fmt::Display for FieldType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FieldType::String => write!(f, "string"),
            FieldType::Integer => write!(f, "integer"),
            FieldType::Decimal => write!(f, "decimal"),
            FieldType::Date => write!(f, "date"),
            FieldType::Boolean => write!(f, "boolean"),
        }
    }
}

/// Typed value of a canonical field.
///
/// Serialized adjacently tagged so checkpoints restore the exact type; use
/// [`FieldValue::to_json_value`] for plain output.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "value", rename_all = "lowercase")]
pub enum FieldValue {
    Text(String),
    Integer(i64),
    Decimal(f64),
    Date(NaiveDate),
    Boolean(bool),
    Blank,
}

impl FieldValue {
    /// Type of a non-blank value
    pub fn field_type(&self) -> Option<FieldType> {
        match self {
            FieldValue::Text(_) => Some(FieldType::String),
            FieldValue::Integer(_) => Some(FieldType::Integer),
            FieldValue::Decimal(_) => Some(FieldType::Decimal),
            FieldValue::Date(_) => Some(FieldType::Date),
            FieldValue::Boolean(_) => Some(FieldType::Boolean),
            FieldValue::Blank => None,
        }
    }

    pub fn is_blank(&self) -> bool {
        match self {
            FieldValue::Blank => true,
            FieldValue::Text(s) => s.trim().is_empty(),
            FieldValue::Decimal(d) => d.is_nan(),
            _ => false,
        }
    }

    /// Canonical rendering used to build identity keys.
    ///
    /// Text is trimmed and lowercased so `" ABC123"` and `"abc123"` group together.
    pub fn key_fragment(&self) -> String {
        if self.is_blank() {
            return String::new();
        }
        match self {
            FieldValue::Text(s) => s.trim().to_lowercase(),
            FieldValue::Integer(i) => i.to_string(),
            FieldValue::Decimal(d) => format_number(*d),
            FieldValue::Date(d) => d.format("%Y-%m-%d").to_string(),
            FieldValue::Boolean(b) => b.to_string(),
            FieldValue::Blank => String::new(),
        }
    }

    /// Numeric view of integer and decimal values
    pub fn as_f64(&self) -> Option<f64> {
        match self {
            FieldValue::Integer(i) => Some(*i as f64),
            FieldValue::Decimal(d) if !d.is_nan() => Some(*d),
            _ => None,
        }
    }

    /// Length used by keep-longest; blank is zero
    pub fn display_len(&self) -> usize {
        match self {
            FieldValue::Text(s) => s.trim().chars().count(),
            other => other.key_fragment().chars().count(),
        }
    }

    /// Order two values of the same type; `None` across types or for NaN
    pub fn compare(&self, other: &FieldValue) -> Option<Ordering> {
        match (self, other) {
            (FieldValue::Text(a), FieldValue::Text(b)) => Some(a.cmp(b)),
            (FieldValue::Integer(a), FieldValue::Integer(b)) => Some(a.cmp(b)),
            (FieldValue::Decimal(a), FieldValue::Decimal(b)) => a.partial_cmp(b),
            (FieldValue::Date(a), FieldValue::Date(b)) => Some(a.cmp(b)),
            (FieldValue::Boolean(a), FieldValue::Boolean(b)) => Some(a.cmp(b)),
            _ => None,
        }
    }

    /// Plain JSON rendering (no type tags) for output sinks
    pub fn to_json_value(&self) -> serde_json::Value {
        if self.is_blank() {
            return serde_json::Value::Null;
        }
        match self {
            FieldValue::Text(s) => serde_json::Value::String(s.clone()),
            FieldValue::Integer(i) => serde_json::Value::from(*i),
            FieldValue::Decimal(d) => serde_json::Number::from_f64(*d)
                .map(serde_json::Value::Number)
                .unwrap_or(serde_json::Value::Null),
            FieldValue::Date(d) => serde_json::Value::String(d.format("%Y-%m-%d").to_string()),
            FieldValue::Boolean(b) => serde_json::Value::Bool(*b),
            FieldValue::Blank => serde_json::Value::Null,
        }
    }
}

impl fmt::Display for FieldValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FieldValue::Text(s) => f.write_str(s),
            FieldValue::Blank => f.write_str(""),
            other => f.write_str(&other.key_fragment()),
        }
    }
}

/// Integral floats render without a fractional part (`12.0` -> `"12"`)
fn format_number(n: f64) -> String {
    if n.fract() == 0.0 && n.abs() < 1e15 {
        format!("{}", n as i64)
    } else {
        format!("{}", n)
    }
}
