//! Evidence events and the canonical evidence builder
//!
//! `build_evidence` is the single code path that turns a
//! (control, outcome, details) triple into the attribute list exported for
//! auditors. Framework helpers only assemble `Details`; they never touch
//! export logic.

use crate::taxonomy::ComplianceControl;
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::BTreeMap;
use std::fmt;

/// Attribute key prefix for every evidence attribute
pub const ATTRIBUTE_PREFIX: &str = "compliance.";

/// Fixed evidence type marker
pub const EVIDENCE_TYPE: &str = "audit_trail";

/// Base overhead of the advisory size estimate, in bytes
pub const BASE_SIZE_ESTIMATE: usize = 200;

/// Per-value contribution of numeric and boolean details to the size estimate
pub const SCALAR_SIZE_ESTIMATE: usize = 8;

/// Detail keys that would collide with base attributes
const RESERVED_KEYS: [&str; 8] = [
    "framework",
    "control",
    "outcome",
    "notes",
    "timestamp",
    "evidence_type",
    "tamper_evident",
    "evidence_id",
];

/// A typed detail or attribute value
///
/// Closed set: supporting a new value type means adding a variant here and
/// handling it in every exhaustive match.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(untagged)]
pub enum EvidenceValue {
    String(String),
    Int(i32),
    Int64(i64),
    Bool(bool),
    Float64(f64),
}

impl EvidenceValue {
    /// Explicitly stringify any displayable value
    pub fn display(value: impl fmt::Display) -> Self {
        EvidenceValue::String(value.to_string())
    }

    /// Contribution of this value to the size estimate
    fn size_contribution(&self) -> usize {
        match self {
            EvidenceValue::String(s) => s.len(),
            EvidenceValue::Int(_)
            | EvidenceValue::Int64(_)
            | EvidenceValue::Bool(_)
            | EvidenceValue::Float64(_) => SCALAR_SIZE_ESTIMATE,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            EvidenceValue::String(s) => Some(s),
            _ => None,
        }
    }
}

impl fmt::Display for EvidenceValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            EvidenceValue::String(v) => f.write_str(v),
            EvidenceValue::Int(v) => write!(f, "{}", v),
            EvidenceValue::Int64(v) => write!(f, "{}", v),
            EvidenceValue::Bool(v) => write!(f, "{}", v),
            EvidenceValue::Float64(v) => write!(f, "{}", v),
        }
    }
}

impl From<&str> for EvidenceValue {
    fn from(v: &str) -> Self {
        EvidenceValue::String(v.to_string())
    }
}

impl From<String> for EvidenceValue {
    fn from(v: String) -> Self {
        EvidenceValue::String(v)
    }
}

impl From<i32> for EvidenceValue {
    fn from(v: i32) -> Self {
        EvidenceValue::Int(v)
    }
}

impl From<i64> for EvidenceValue {
    fn from(v: i64) -> Self {
        EvidenceValue::Int64(v)
    }
}

impl From<bool> for EvidenceValue {
    fn from(v: bool) -> Self {
        EvidenceValue::Bool(v)
    }
}

impl From<f64> for EvidenceValue {
    fn from(v: f64) -> Self {
        EvidenceValue::Float64(v)
    }
}

/// Detail map attached to a piece of evidence
///
/// Ordered so exported attributes come out in a stable order.
pub type Details = BTreeMap<String, EvidenceValue>;

/// Build a `Details` map from key/value pairs
///
/// ```rust
/// use betrace_telemetry::details;
///
/// let d = details! { "user_id" => "u1", "granted" => true };
/// assert_eq!(d.len(), 2);
/// ```
#[macro_export]
macro_rules! details {
    () => { $crate::evidence::Details::new() };
    ($($key:expr => $value:expr),+ $(,)?) => {{
        let mut map = $crate::evidence::Details::new();
        $( map.insert(::std::string::String::from($key), $crate::evidence::EvidenceValue::from($value)); )+
        map
    }};
}

/// A single exported attribute
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct EvidenceAttribute {
    pub key: String,
    pub value: EvidenceValue,
}

impl EvidenceAttribute {
    fn new(key: impl Into<String>, value: impl Into<EvidenceValue>) -> Self {
        Self {
            key: key.into(),
            value: value.into(),
        }
    }
}

/// Canonical evidence: the attribute list plus the advisory size estimate
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Evidence {
    pub attributes: Vec<EvidenceAttribute>,

    /// Advisory size in bytes, fed to the evidence size histogram.
    /// Not a serialized wire size.
    pub size_estimate: usize,
}

impl Evidence {
    /// Find an attribute by its full key (e.g. `compliance.user_id`)
    pub fn attribute(&self, key: &str) -> Option<&EvidenceValue> {
        self.attributes
            .iter()
            .find(|a| a.key == key)
            .map(|a| &a.value)
    }
}

/// Turn a (control, outcome, details) triple into canonical evidence
///
/// Pure: the same inputs always produce the same output. Detail keys that
/// collide with a base attribute are skipped so the base attributes, and the
/// tamper-evident marker in particular, cannot be overridden.
pub fn build_evidence(
    control: &ComplianceControl,
    outcome: &str,
    details: &Details,
    timestamp: DateTime<Utc>,
) -> Evidence {
    let mut attributes = Vec::with_capacity(7 + details.len());
    attributes.push(EvidenceAttribute::new(
        "compliance.framework",
        control.framework().as_str(),
    ));
    attributes.push(EvidenceAttribute::new(
        "compliance.control",
        control.control_id(),
    ));
    attributes.push(EvidenceAttribute::new("compliance.outcome", outcome));
    attributes.push(EvidenceAttribute::new("compliance.notes", control.notes()));
    attributes.push(EvidenceAttribute::new(
        "compliance.timestamp",
        timestamp.timestamp(),
    ));
    attributes.push(EvidenceAttribute::new(
        "compliance.evidence_type",
        EVIDENCE_TYPE,
    ));
    attributes.push(EvidenceAttribute::new("compliance.tamper_evident", true));

    for (key, value) in details {
        if RESERVED_KEYS.contains(&key.as_str()) {
            continue;
        }
        attributes.push(EvidenceAttribute::new(
            format!("{}{}", ATTRIBUTE_PREFIX, key),
            value.clone(),
        ));
    }

    Evidence {
        attributes,
        size_estimate: estimate_size(details),
    }
}

/// Advisory size estimate: base overhead plus key length and value
/// contribution per detail
pub fn estimate_size(details: &Details) -> usize {
    details.iter().fold(BASE_SIZE_ESTIMATE, |size, (key, value)| {
        size + key.len() + value.size_contribution()
    })
}

/// A queued piece of evidence, owned by the emitter between enqueue and export
#[derive(Debug, Clone)]
pub struct EvidenceEvent {
    /// Unique evidence identifier (evd-<uuid>)
    pub evidence_id: String,

    pub control: ComplianceControl,

    /// Decision outcome (e.g., "granted", "denied", "logged")
    pub outcome: String,

    pub details: Details,

    /// Enqueue time; becomes the span start time and `compliance.timestamp`
    pub timestamp: DateTime<Utc>,
}

impl EvidenceEvent {
    /// Create a new event with auto-generated id and timestamp
    pub fn new(control: ComplianceControl, outcome: impl Into<String>, details: Details) -> Self {
        Self {
            evidence_id: format!("evd-{}", uuid::Uuid::new_v4()),
            control,
            outcome: outcome.into(),
            details,
            timestamp: Utc::now(),
        }
    }

    /// Canonical evidence for this event, tagged with its evidence id
    pub fn to_evidence(&self) -> Evidence {
        let mut evidence = build_evidence(&self.control, &self.outcome, &self.details, self.timestamp);
        evidence.attributes.push(EvidenceAttribute::new(
            "compliance.evidence_id",
            self.evidence_id.as_str(),
        ));
        evidence
    }
}
