//! Dual-backend metrics recording
//!
//! Every semantic instrument is defined once in [`CATALOG`]. A
//! [`MetricsRecorder`] fans each recording call out to all live
//! [`MetricSink`] adapters, so the pull and push backends always see the same
//! events and differ only in when they export them.
//!
//! Registration is isolated per sink and per instrument: a backend that
//! rejects an instrument loses only that instrument, and a backend that
//! rejects everything is dropped with a warning. Recording never fails.

pub mod otel;
pub mod prometheus;

pub use otel::OtelSink;
pub use prometheus::PrometheusSink;

use crate::config::{Buckets, HistogramBuckets};
use crate::error::Result;
use crate::taxonomy::{ComplianceControl, Framework};
use serde::Serialize;
use std::fmt;

/// Identifier of a semantic instrument
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
pub enum MetricId {
    RuleEvaluationDuration,
    RuleEvaluations,
    SpansProcessed,
    SpanAttributes,
    SpanSize,
    RuleLoadDuration,
    RuleLoads,
    RulesActive,
    LazyFieldsLoaded,
    LazyCacheHits,
    ComplianceSpansEmitted,
    ComplianceViolations,
    ComplianceEvidenceSize,
    AuditTrailGaps,
    EvidenceDropped,
    Soc2AccessControlChecks,
    Soc2DataIsolationChecks,
    HipaaAccessLogEntries,
    HipaaEncryptionEvents,
    GdprDataAccessRequests,
    GdprDataDeletionRequests,
    GdprConsentEvents,
    FedRampAuditEvents,
    FedRampAccessControlDecisions,
}

/// Which bucket layout a histogram uses
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BucketClass {
    Latency,
    EvidenceSize,
    SpanSize,
    AttributeCount,
    FieldsLoaded,
}

impl BucketClass {
    fn select(self, buckets: &HistogramBuckets) -> &Buckets {
        match self {
            BucketClass::Latency => &buckets.latency,
            BucketClass::EvidenceSize => &buckets.evidence_size,
            BucketClass::SpanSize => &buckets.span_size,
            BucketClass::AttributeCount => &buckets.attribute_count,
            BucketClass::FieldsLoaded => &buckets.fields_loaded,
        }
    }
}

/// Instrument kind
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MetricKind {
    /// Monotonic counter
    Counter,
    /// Distribution with explicit bucket boundaries
    Histogram(BucketClass),
    /// Value that moves both ways (gauge on pull, up/down counter on push)
    UpDown,
}

/// Backend-neutral instrument definition
#[derive(Debug, Clone, Copy)]
pub struct MetricDescriptor {
    pub id: MetricId,

    /// Base name without namespace, in Prometheus form (`_total` suffix for
    /// counters, unit suffix for histograms)
    pub name: &'static str,

    pub help: &'static str,

    /// UCUM unit for the push backend
    pub unit: Option<&'static str>,

    pub kind: MetricKind,

    /// Label names; recording calls pass values in this order
    pub labels: &'static [&'static str],
}

macro_rules! descriptor {
    ($id:ident, $name:literal, $kind:expr, [$($label:literal),*], $unit:expr, $help:literal) => {
        MetricDescriptor {
            id: MetricId::$id,
            name: $name,
            help: $help,
            unit: $unit,
            kind: $kind,
            labels: &[$($label),*],
        }
    };
}

/// Every instrument the pipeline records
pub const CATALOG: &[MetricDescriptor] = &[
    // Rule engine performance
    descriptor!(RuleEvaluationDuration, "rule_evaluation_duration_seconds",
        MetricKind::Histogram(BucketClass::Latency), ["rule_id", "result"], Some("s"),
        "Time taken to evaluate a single rule against a span"),
    descriptor!(RuleEvaluations, "rule_evaluation_total", MetricKind::Counter,
        ["rule_id", "result"], None, "Total number of rule evaluations"),
    descriptor!(SpansProcessed, "rule_engine_spans_processed_total", MetricKind::Counter,
        [], None, "Total number of spans processed by rule engine"),
    descriptor!(SpanAttributes, "rule_engine_span_attributes",
        MetricKind::Histogram(BucketClass::AttributeCount), [], None,
        "Number of attributes in processed spans"),
    descriptor!(SpanSize, "rule_engine_span_size_bytes",
        MetricKind::Histogram(BucketClass::SpanSize), [], Some("By"),
        "Estimated size of processed spans in bytes"),
    descriptor!(RuleLoadDuration, "rule_load_duration_seconds",
        MetricKind::Histogram(BucketClass::Latency), [], Some("s"),
        "Time taken to parse and load a rule"),
    descriptor!(RuleLoads, "rule_load_total", MetricKind::Counter,
        ["status"], None, "Total number of rule load attempts"),
    descriptor!(RulesActive, "rules_active", MetricKind::UpDown,
        [], None, "Number of currently active rules"),
    // Lazy evaluation
    descriptor!(LazyFieldsLoaded, "lazy_evaluation_fields_loaded",
        MetricKind::Histogram(BucketClass::FieldsLoaded), ["rule_id"], None,
        "Number of span fields actually loaded during lazy evaluation"),
    descriptor!(LazyCacheHits, "lazy_evaluation_cache_hits_total", MetricKind::Counter,
        ["field_type"], None, "Number of lazy evaluation cache hits"),
    // Compliance evidence
    descriptor!(ComplianceSpansEmitted, "compliance_spans_emitted_total", MetricKind::Counter,
        ["framework", "control", "outcome"], None,
        "Total number of compliance evidence spans emitted"),
    descriptor!(ComplianceViolations, "compliance_violations_detected_total", MetricKind::Counter,
        ["framework", "control", "severity"], None,
        "Total number of compliance violations detected"),
    descriptor!(ComplianceEvidenceSize, "compliance_evidence_size_bytes",
        MetricKind::Histogram(BucketClass::EvidenceSize), ["framework"], Some("By"),
        "Estimated size of compliance evidence spans in bytes"),
    descriptor!(AuditTrailGaps, "compliance_audit_trail_gaps_total", MetricKind::Counter,
        ["framework", "gap_type"], None,
        "Number of detected gaps in compliance audit trail"),
    descriptor!(EvidenceDropped, "compliance_evidence_dropped_total", MetricKind::Counter,
        ["reason"], None, "Compliance evidence records discarded before export"),
    // Framework-specific
    descriptor!(Soc2AccessControlChecks, "soc2_access_control_checks_total", MetricKind::Counter,
        ["outcome"], None, "SOC2 CC6.1 access control checks"),
    descriptor!(Soc2DataIsolationChecks, "soc2_data_isolation_checks_total", MetricKind::Counter,
        ["outcome"], None, "SOC2 CC6.3 data isolation checks"),
    descriptor!(HipaaAccessLogEntries, "hipaa_access_log_entries_total", MetricKind::Counter,
        ["outcome"], None, "HIPAA 164.312(b) audit log entries"),
    descriptor!(HipaaEncryptionEvents, "hipaa_encryption_events_total", MetricKind::Counter,
        ["outcome"], None, "HIPAA 164.312(a)(2)(iv) encryption/decryption events"),
    descriptor!(GdprDataAccessRequests, "gdpr_data_access_requests_total", MetricKind::Counter,
        ["outcome"], None, "GDPR Art. 15 data access requests"),
    descriptor!(GdprDataDeletionRequests, "gdpr_data_deletion_requests_total", MetricKind::Counter,
        ["outcome"], None, "GDPR Art. 17 data deletion requests"),
    descriptor!(GdprConsentEvents, "gdpr_consent_events_total", MetricKind::Counter,
        ["outcome"], None, "GDPR Art. 7 consent events"),
    descriptor!(FedRampAuditEvents, "fedramp_audit_events_total", MetricKind::Counter,
        ["outcome"], None, "FedRAMP AU-2 audit events"),
    descriptor!(FedRampAccessControlDecisions, "fedramp_access_control_decisions_total",
        MetricKind::Counter, ["outcome"], None, "FedRAMP AC-3 access control decisions"),
];

/// Look up the descriptor of an instrument
///
/// `CATALOG` lists instruments in `MetricId` declaration order.
pub fn descriptor(id: MetricId) -> &'static MetricDescriptor {
    &CATALOG[id as usize]
}

/// Framework-specific sub-counter for a control, if it has one
pub fn framework_counter(control: &ComplianceControl) -> Option<MetricId> {
    match (control.framework(), control.control_id()) {
        (Framework::Soc2, "CC6.1") => Some(MetricId::Soc2AccessControlChecks),
        (Framework::Soc2, "CC6.3") => Some(MetricId::Soc2DataIsolationChecks),
        (Framework::Hipaa, "164.312(b)") => Some(MetricId::HipaaAccessLogEntries),
        (Framework::Hipaa, "164.312(a)(2)(iv)") => Some(MetricId::HipaaEncryptionEvents),
        (Framework::Gdpr, "Art. 15") => Some(MetricId::GdprDataAccessRequests),
        (Framework::Gdpr, "Art. 17") => Some(MetricId::GdprDataDeletionRequests),
        (Framework::Gdpr, "Art. 7") => Some(MetricId::GdprConsentEvents),
        (Framework::FedRamp, "AU-2") => Some(MetricId::FedRampAuditEvents),
        (Framework::FedRamp, "AC-3") => Some(MetricId::FedRampAccessControlDecisions),
        _ => None,
    }
}

/// A single recorded value
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Observation {
    /// Add to a counter
    Increment(u64),
    /// Record into a histogram
    Value(f64),
    /// Move an up/down instrument
    Delta(i64),
}

/// A telemetry backend adapter
///
/// Sinks are configured (`register`) before the recorder is built and are
/// only observed afterwards. `observe` must be cheap, non-blocking and must
/// silently ignore instruments that failed to register.
pub trait MetricSink: Send + Sync {
    /// Backend name for logs and status (e.g., "prometheus", "otlp")
    fn backend(&self) -> &'static str;

    /// Create the backend instrument for a descriptor
    fn register(&mut self, descriptor: &MetricDescriptor, boundaries: Option<&[f64]>) -> Result<()>;

    /// Record one observation with label values in descriptor order
    fn observe(&self, descriptor: &MetricDescriptor, labels: &[&str], observation: Observation);

    /// Current state in text exposition format, for pull backends
    fn exposition(&self) -> Option<Result<String>> {
        None
    }
}

/// Per-backend registration outcome
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct BackendStatus {
    pub backend: &'static str,
    pub registered: usize,
    pub failed: Vec<String>,
}

/// Result of a rule evaluation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EvaluationResult {
    Match,
    NoMatch,
    Error,
}

impl EvaluationResult {
    pub fn as_str(&self) -> &'static str {
        match self {
            EvaluationResult::Match => "match",
            EvaluationResult::NoMatch => "no_match",
            EvaluationResult::Error => "error",
        }
    }
}

impl From<bool> for EvaluationResult {
    fn from(matched: bool) -> Self {
        if matched {
            EvaluationResult::Match
        } else {
            EvaluationResult::NoMatch
        }
    }
}

/// Outcome of loading a rule
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum LoadStatus {
    Success,
    Error,
}

impl LoadStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            LoadStatus::Success => "success",
            LoadStatus::Error => "error",
        }
    }
}

/// Severity of a detected compliance violation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    Critical,
    High,
    Medium,
    Low,
}

impl Severity {
    pub fn as_str(&self) -> &'static str {
        match self {
            Severity::Critical => "critical",
            Severity::High => "high",
            Severity::Medium => "medium",
            Severity::Low => "low",
        }
    }
}

impl fmt::Display for Severity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Why a piece of evidence was not exported
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum DropReason {
    /// Queue at capacity when enqueued
    QueueFull,
    /// Enqueued after stop, or still queued when the drain budget ran out
    Shutdown,
    /// Exporter returned an error or panicked
    ExportFailed,
    /// Control not present in the taxonomy
    UnknownControl,
}

impl DropReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            DropReason::QueueFull => "queue_full",
            DropReason::Shutdown => "shutdown",
            DropReason::ExportFailed => "export_failed",
            DropReason::UnknownControl => "unknown_control",
        }
    }
}

impl fmt::Display for DropReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Builder that registers the catalog on each sink in isolation
pub struct MetricsRecorderBuilder {
    buckets: HistogramBuckets,
    sinks: Vec<Box<dyn MetricSink>>,
}

impl MetricsRecorderBuilder {
    /// Add a backend
    pub fn sink(mut self, sink: impl MetricSink + 'static) -> Self {
        self.sinks.push(Box::new(sink));
        self
    }

    /// Add an already boxed backend
    pub fn boxed_sink(mut self, sink: Box<dyn MetricSink>) -> Self {
        self.sinks.push(sink);
        self
    }

    /// Register every catalog instrument on every sink
    ///
    /// Never fails: registration errors degrade the affected backend.
    pub fn build(self) -> MetricsRecorder {
        let mut sinks = Vec::with_capacity(self.sinks.len());
        let mut backends = Vec::with_capacity(self.sinks.len());

        for mut sink in self.sinks {
            let mut status = BackendStatus {
                backend: sink.backend(),
                registered: 0,
                failed: Vec::new(),
            };

            for descriptor in CATALOG {
                let boundaries = match descriptor.kind {
                    MetricKind::Histogram(class) => Some(class.select(&self.buckets).boundaries()),
                    _ => None,
                };
                match sink.register(descriptor, boundaries.as_deref()) {
                    Ok(()) => status.registered += 1,
                    Err(e) => {
                        tracing::warn!(
                            backend = sink.backend(),
                            metric = descriptor.name,
                            error = %e,
                            "Metric instrument unavailable on backend"
                        );
                        status.failed.push(descriptor.name.to_string());
                    }
                }
            }

            if status.registered == 0 {
                tracing::warn!(
                    backend = sink.backend(),
                    "No instruments registered, continuing without this backend"
                );
            } else {
                tracing::debug!(
                    backend = sink.backend(),
                    registered = status.registered,
                    failed = status.failed.len(),
                    "Metrics backend initialized"
                );
                sinks.push(sink);
            }
            backends.push(status);
        }

        MetricsRecorder { sinks, backends }
    }
}

/// Fan-out recorder for every semantic metric
///
/// Built once at startup and shared by reference (usually behind `Arc`).
pub struct MetricsRecorder {
    sinks: Vec<Box<dyn MetricSink>>,
    backends: Vec<BackendStatus>,
}

impl MetricsRecorder {
    pub fn builder(buckets: HistogramBuckets) -> MetricsRecorderBuilder {
        MetricsRecorderBuilder {
            buckets,
            sinks: Vec::new(),
        }
    }

    /// Recorder with no backends; every call is a no-op
    pub fn disabled() -> Self {
        Self {
            sinks: Vec::new(),
            backends: Vec::new(),
        }
    }

    /// Registration outcome per configured backend, including dropped ones
    pub fn backends(&self) -> &[BackendStatus] {
        &self.backends
    }

    /// Names of the backends currently receiving observations
    pub fn live_backends(&self) -> Vec<&'static str> {
        self.sinks.iter().map(|s| s.backend()).collect()
    }

    /// Text exposition from the first pull backend, if any
    pub fn exposition(&self) -> Option<Result<String>> {
        self.sinks.iter().find_map(|s| s.exposition())
    }

    /// Record one observation on every live backend
    pub fn record(&self, id: MetricId, labels: &[&str], observation: Observation) {
        let descriptor = descriptor(id);
        debug_assert_eq!(
            labels.len(),
            descriptor.labels.len(),
            "label arity mismatch for {}",
            descriptor.name
        );
        for sink in &self.sinks {
            sink.observe(descriptor, labels, observation);
        }
    }

    /// Rule evaluation latency and count
    pub fn record_rule_evaluation(&self, rule_id: &str, result: EvaluationResult, duration_seconds: f64) {
        let labels = [rule_id, result.as_str()];
        self.record(
            MetricId::RuleEvaluationDuration,
            &labels,
            Observation::Value(duration_seconds),
        );
        self.record(MetricId::RuleEvaluations, &labels, Observation::Increment(1));
    }

    pub fn record_span_processed(&self) {
        self.record(MetricId::SpansProcessed, &[], Observation::Increment(1));
    }

    pub fn record_span_attributes(&self, count: u64) {
        self.record(MetricId::SpanAttributes, &[], Observation::Value(count as f64));
    }

    pub fn record_span_size(&self, size_bytes: u64) {
        self.record(MetricId::SpanSize, &[], Observation::Value(size_bytes as f64));
    }

    pub fn record_rule_load(&self, status: LoadStatus, duration_seconds: f64) {
        self.record(MetricId::RuleLoadDuration, &[], Observation::Value(duration_seconds));
        self.record(MetricId::RuleLoads, &[status.as_str()], Observation::Increment(1));
    }

    /// Adjust the active rule count by `delta`
    pub fn update_active_rules(&self, delta: i64) {
        self.record(MetricId::RulesActive, &[], Observation::Delta(delta));
    }

    pub fn record_lazy_fields_loaded(&self, rule_id: &str, count: u64) {
        self.record(
            MetricId::LazyFieldsLoaded,
            &[rule_id],
            Observation::Value(count as f64),
        );
    }

    /// `field_type` is `scalar` or `attribute`
    pub fn record_lazy_cache_hit(&self, field_type: &str) {
        self.record(MetricId::LazyCacheHits, &[field_type], Observation::Increment(1));
    }

    /// An evidence span was exported: bump the generic counter and the
    /// framework-specific one for controls that have it
    pub fn record_compliance_span(&self, control: &ComplianceControl, outcome: &str) {
        self.record(
            MetricId::ComplianceSpansEmitted,
            &[control.framework().as_str(), control.control_id(), outcome],
            Observation::Increment(1),
        );
        if let Some(id) = framework_counter(control) {
            self.record(id, &[outcome], Observation::Increment(1));
        }
    }

    pub fn record_evidence_size(&self, framework: Framework, size_bytes: usize) {
        self.record(
            MetricId::ComplianceEvidenceSize,
            &[framework.as_str()],
            Observation::Value(size_bytes as f64),
        );
    }

    pub fn record_violation(&self, control: &ComplianceControl, severity: Severity) {
        self.record(
            MetricId::ComplianceViolations,
            &[control.framework().as_str(), control.control_id(), severity.as_str()],
            Observation::Increment(1),
        );
    }

    /// `gap_type` is `missing_evidence`, `unsigned_span` or `timestamp_gap`
    pub fn record_audit_trail_gap(&self, framework: Framework, gap_type: &str) {
        self.record(
            MetricId::AuditTrailGaps,
            &[framework.as_str(), gap_type],
            Observation::Increment(1),
        );
    }

    pub fn record_evidence_dropped(&self, reason: DropReason, count: u64) {
        if count == 0 {
            return;
        }
        self.record(
            MetricId::EvidenceDropped,
            &[reason.as_str()],
            Observation::Increment(count),
        );
    }
}

impl fmt::Debug for MetricsRecorder {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MetricsRecorder")
            .field("backends", &self.backends)
            .finish()
    }
}
