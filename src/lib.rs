//! # betrace-telemetry
//!
//! Non-blocking compliance evidence emission and dual-backend metrics for the
//! BeTrace rule engine.
//!
//! ## Overview
//!
//! Rule evaluation must never wait on telemetry. Evidence for SOC2, HIPAA,
//! GDPR and FedRAMP controls goes into a bounded queue and is exported as
//! OpenTelemetry spans by a single background consumer. Metrics are recorded
//! once and fanned out to a Prometheus registry (scraped) and an OTLP meter
//! (pushed). When the queue is full evidence is dropped and counted; nothing
//! is lost silently.
//!
//! ## Quick Start
//!
//! ```rust
//! use betrace_telemetry::{ComplianceRecorder, ComplianceTelemetry, EvaluationResult, TelemetryConfig};
//!
//! # async fn example() -> betrace_telemetry::Result<()> {
//! // Build and start the pipeline (inside a Tokio runtime)
//! let telemetry = ComplianceTelemetry::init(TelemetryConfig::from_env()?)?;
//!
//! // Record from the rule engine hot path
//! telemetry.record_rule_evaluation("pii-access", EvaluationResult::Match, 0.0004);
//! telemetry.soc2_access_control("user-42", "/api/rules", true);
//!
//! // Drain queued evidence and flush exporters
//! if let Some(report) = telemetry.shutdown().await? {
//!     println!("exported {} evidence records on shutdown", report.exported);
//! }
//! # Ok(())
//! # }
//! ```
//!
//! ## Backends
//!
//! - **prometheus**: pull backend, text exposition on `GET /metrics`
//! - **otlp**: push backend, spans and metrics over OTLP/gRPC
//!
//! ## Architecture
//!
//! - **ComplianceRecorder** trait: the API the rule engine depends on
//! - **ComplianceTelemetry**: owns taxonomy, recorder, emitter and providers
//! - **AsyncEmitter**: bounded queue plus one exporting consumer
//! - **RuleTracer**: `rule.evaluate` / `rule.load` spans and their metrics
//! - **MetricSink** trait: adapter every metrics backend implements
//! - **EvidenceExporter** trait: where dequeued evidence goes

pub mod compliance;
pub mod config;
pub mod emitter;
pub mod error;
pub mod evidence;
pub mod export;
pub mod metrics;
pub mod rules;
pub mod server;
pub mod taxonomy;
pub mod telemetry;

// Re-export core types
pub use compliance::ComplianceRecorder;
pub use config::{Buckets, EmitterConfig, HistogramBuckets, TelemetryConfig};
pub use emitter::{AsyncEmitter, DrainReport, EmitterState, EnqueueOutcome, StatsSnapshot};
pub use error::{Result, TelemetryError};
pub use evidence::{build_evidence, Details, Evidence, EvidenceAttribute, EvidenceEvent, EvidenceValue};
pub use export::{EvidenceExporter, MemoryExporter, TracingExporter};
pub use metrics::{
    DropReason, EvaluationResult, LoadStatus, MetricId, MetricSink, MetricsRecorder, OtelSink,
    PrometheusSink, Severity,
};
pub use rules::{RuleEvaluationSpan, RuleLoadSpan, RuleTracer};
pub use taxonomy::{ComplianceControl, Framework, Taxonomy};
pub use telemetry::{ComplianceTelemetry, TelemetryStatus};
