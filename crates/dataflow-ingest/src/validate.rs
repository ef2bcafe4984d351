//! Rule-based validation and quality scoring
//!
//! Rules run in declaration order. A failed rule appends a [`Violation`] with
//! the severity the rule declares; nothing here returns an error for a failing
//! record. Only malformed rule definitions fail, at compile time.

use dataflow_common::{FieldType, FieldValue, RecordType};
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::fmt;

use crate::error::ConfigError;
use crate::normalize::{FieldMapping, NormalizedRecord};

const DEFAULT_SUM_TOLERANCE: f64 = 0.01;

/// Severity declared by a rule
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    Warning,
    Error,
}

impl fmt::Display for Severity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Severity::Warning => write!(f, "warning"),
            Severity::Error => write!(f, "error"),
        }
    }
}

/// Configured rule
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RuleSpec {
    pub id: String,
    pub severity: Severity,
    #[serde(default = "default_weight")]
    pub weight: f64,
    #[serde(flatten)]
    pub kind: RuleKind,
}

fn default_weight() -> f64 {
    1.0
}

fn default_tolerance() -> f64 {
    DEFAULT_SUM_TOLERANCE
}

/// Rule check and its parameters
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum RuleKind {
    Required {
        field: String,
    },
    Range {
        field: String,
        #[serde(default)]
        min: Option<f64>,
        #[serde(default)]
        max: Option<f64>,
    },
    Pattern {
        field: String,
        pattern: String,
    },
    OneOf {
        field: String,
        values: Vec<String>,
    },
    MaxLength {
        field: String,
        max: usize,
    },
    /// `before <= after`, e.g. manufacture date before expiry date
    FieldOrder {
        before: String,
        after: String,
    },
    /// Record-level: `target == sum(addends)` within `tolerance`
    SumEquals {
        target: String,
        addends: Vec<String>,
        #[serde(default = "default_tolerance")]
        tolerance: f64,
    },
}

impl RuleSpec {
    pub fn new(id: impl Into<String>, severity: Severity, kind: RuleKind) -> Self {
        Self {
            id: id.into(),
            severity,
            weight: default_weight(),
            kind,
        }
    }

    pub fn with_weight(mut self, weight: f64) -> Self {
        self.weight = weight;
        self
    }
}

/// One failed rule
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Violation {
    pub field: String,
    pub rule_id: String,
    pub severity: Severity,
    pub message: String,
}

/// Outcome of validating one record
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ValidationResult {
    pub violations: Vec<Violation>,
    /// Weighted fraction of passed rules, in [0, 1]
    pub quality_score: f64,
}

impl ValidationResult {
    /// Any error-severity violation excludes the record from merge
    pub fn has_errors(&self) -> bool {
        self.violations.iter().any(|v| v.severity == Severity::Error)
    }

    pub fn errors(&self) -> impl Iterator<Item = &Violation> {
        self.violations.iter().filter(|v| v.severity == Severity::Error)
    }
}

#[derive(Debug, Clone)]
enum Check {
    Required(String),
    Range {
        field: String,
        min: Option<f64>,
        max: Option<f64>,
    },
    Pattern {
        field: String,
        regex: Regex,
    },
    OneOf {
        field: String,
        values: HashSet<String>,
    },
    MaxLength {
        field: String,
        max: usize,
    },
    FieldOrder {
        before: String,
        after: String,
    },
    SumEquals {
        target: String,
        addends: Vec<String>,
        tolerance: f64,
    },
}

#[derive(Debug, Clone)]
struct CompiledRule {
    id: String,
    severity: Severity,
    weight: f64,
    check: Check,
}

/// Ordered, compiled rules of one record type
#[derive(Debug, Clone, Default)]
pub struct RuleSet {
    rules: Vec<CompiledRule>,
    total_weight: f64,
}

impl RuleSet {
    /// Compile rules against a record type's mapping.
    ///
    /// Rejects duplicate ids, bad weights, unknown fields, invalid regexes,
    /// and checks applied to fields of the wrong type.
    pub fn compile(
        record_type: &RecordType,
        specs: &[RuleSpec],
        mapping: &FieldMapping,
    ) -> Result<Self, ConfigError> {
        let mut ids = HashSet::new();
        let mut rules = Vec::with_capacity(specs.len());

        for spec in specs {
            let invalid = |reason: String| ConfigError::InvalidRule {
                record_type: record_type.to_string(),
                rule_id: spec.id.clone(),
                reason,
            };

            if spec.id.trim().is_empty() {
                return Err(invalid("rule id is empty".to_string()));
            }
            if !ids.insert(spec.id.as_str()) {
                return Err(invalid("duplicate rule id".to_string()));
            }
            if !spec.weight.is_finite() || spec.weight < 0.0 {
                return Err(invalid(format!("weight {} must be finite and >= 0", spec.weight)));
            }

            let check = compile_check(&spec.kind, mapping).map_err(invalid)?;
            rules.push(CompiledRule {
                id: spec.id.clone(),
                severity: spec.severity,
                weight: spec.weight,
                check,
            });
        }

        let total_weight: f64 = rules.iter().map(|r| r.weight).sum();
        if !rules.is_empty() && total_weight <= 0.0 {
            return Err(ConfigError::InvalidRule {
                record_type: record_type.to_string(),
                rule_id: "*".to_string(),
                reason: "rule weights sum to zero".to_string(),
            });
        }

        Ok(Self {
            rules,
            total_weight,
        })
    }

    pub fn len(&self) -> usize {
        self.rules.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rules.is_empty()
    }

    pub fn validate(&self, record: &NormalizedRecord) -> ValidationResult {
        let mut violations = Vec::new();
        let mut passed_weight = 0.0;

        for rule in &self.rules {
            match evaluate(&rule.check, record) {
                None => passed_weight += rule.weight,
                Some((field, message)) => violations.push(Violation {
                    field,
                    rule_id: rule.id.clone(),
                    severity: rule.severity,
                    message,
                }),
            }
        }

        let quality_score = if self.total_weight > 0.0 {
            (passed_weight / self.total_weight).clamp(0.0, 1.0)
        } else {
            1.0
        };

        ValidationResult {
            violations,
            quality_score,
        }
    }
}

/// Validate a normalized record against a rule set
pub fn validate(record: &NormalizedRecord, rules: &RuleSet) -> ValidationResult {
    rules.validate(record)
}

fn compile_check(kind: &RuleKind, mapping: &FieldMapping) -> Result<Check, String> {
    let declared = |field: &str| {
        mapping
            .field_type(field)
            .ok_or_else(|| format!("field '{}' is not declared", field))
    };
    let numeric = |field: &str| {
        let ty = declared(field)?;
        if matches!(ty, FieldType::Integer | FieldType::Decimal) {
            Ok(ty)
        } else {
            Err(format!("field '{}' is {}, expected a number", field, ty))
        }
    };

    Ok(match kind {
        RuleKind::Required { field } => {
            declared(field)?;
            Check::Required(field.clone())
        }
        RuleKind::Range { field, min, max } => {
            numeric(field)?;
            match (min, max) {
                (None, None) => return Err("range needs min or max".to_string()),
                (Some(lo), Some(hi)) if lo > hi => {
                    return Err(format!("min {} is greater than max {}", lo, hi))
                }
                _ => {}
            }
            Check::Range {
                field: field.clone(),
                min: *min,
                max: *max,
            }
        }
        RuleKind::Pattern { field, pattern } => {
            declared(field)?;
            let regex = Regex::new(pattern).map_err(|e| format!("invalid pattern: {}", e))?;
            Check::Pattern {
                field: field.clone(),
                regex,
            }
        }
        RuleKind::OneOf { field, values } => {
            declared(field)?;
            if values.is_empty() {
                return Err("one_of needs at least one value".to_string());
            }
            Check::OneOf {
                field: field.clone(),
                values: values.iter().map(|v| v.trim().to_lowercase()).collect(),
            }
        }
        RuleKind::MaxLength { field, max } => {
            declared(field)?;
            Check::MaxLength {
                field: field.clone(),
                max: *max,
            }
        }
        RuleKind::FieldOrder { before, after } => {
            let first = declared(before)?;
            let second = declared(after)?;
            let comparable = match (first, second) {
                (FieldType::Date, FieldType::Date) => true,
                (a, b) => {
                    matches!(a, FieldType::Integer | FieldType::Decimal)
                        && matches!(b, FieldType::Integer | FieldType::Decimal)
                }
            };
            if !comparable {
                return Err(format!("cannot order {} against {}", first, second));
            }
            Check::FieldOrder {
                before: before.clone(),
                after: after.clone(),
            }
        }
        RuleKind::SumEquals {
            target,
            addends,
            tolerance,
        } => {
            numeric(target)?;
            if addends.is_empty() {
                return Err("sum_equals needs at least one addend".to_string());
            }
            for addend in addends {
                numeric(addend)?;
            }
            if !tolerance.is_finite() || *tolerance < 0.0 {
                return Err(format!("tolerance {} must be finite and >= 0", tolerance));
            }
            Check::SumEquals {
                target: target.clone(),
                addends: addends.clone(),
                tolerance: *tolerance,
            }
        }
    })
}

/// `None` when the rule passes, otherwise the offending field and a message.
/// Rules other than `required` pass on blank inputs.
fn evaluate(check: &Check, record: &NormalizedRecord) -> Option<(String, String)> {
    let value = |field: &str| record.get(field).filter(|v| !v.is_blank());

    match check {
        Check::Required(field) => value(field)
            .is_none()
            .then(|| (field.clone(), "value is missing".to_string())),
        Check::Range { field, min, max } => {
            let n = value(field)?.as_f64()?;
            let below = min.is_some_and(|lo| n < lo);
            let above = max.is_some_and(|hi| n > hi);
            (below || above).then(|| {
                (
                    field.clone(),
                    format!("{} outside [{}, {}]", n, bound(*min), bound(*max)),
                )
            })
        }
        Check::Pattern { field, regex } => {
            let text = value(field)?.to_string();
            (!regex.is_match(&text)).then(|| {
                (
                    field.clone(),
                    format!("'{}' does not match {}", text, regex.as_str()),
                )
            })
        }
        Check::OneOf { field, values } => {
            let v = value(field)?;
            (!values.contains(&v.key_fragment()))
                .then(|| (field.clone(), format!("'{}' is not an allowed value", v)))
        }
        Check::MaxLength { field, max } => {
            let len = value(field)?.display_len();
            (len > *max).then(|| (field.clone(), format!("length {} exceeds {}", len, max)))
        }
        Check::FieldOrder { before, after } => {
            let first = value(before)?;
            let second = value(after)?;
            let out_of_order = match (first, second) {
                (FieldValue::Date(a), FieldValue::Date(b)) => a > b,
                (a, b) => match (a.as_f64(), b.as_f64()) {
                    (Some(a), Some(b)) => a > b,
                    _ => false,
                },
            };
            out_of_order.then(|| (after.clone(), format!("{} is after {}", before, after)))
        }
        Check::SumEquals {
            target,
            addends,
            tolerance,
        } => {
            let expected = value(target)?.as_f64()?;
            let sum: f64 = addends
                .iter()
                .filter_map(|a| value(a).and_then(FieldValue::as_f64))
                .sum();
            ((expected - sum).abs() > *tolerance).then(|| {
                (
                    target.clone(),
                    format!("{} != sum of {} ({})", expected, addends.join(" + "), sum),
                )
            })
        }
    }
}

fn bound(b: Option<f64>) -> String {
    b.map(|v| v.to_string()).unwrap_or_else(|| "*".to_string())
}
