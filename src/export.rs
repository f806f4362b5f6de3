//! Evidence exporters
//!
//! The emitter hands each dequeued event to an `EvidenceExporter`. The
//! production exporter turns it into an OpenTelemetry span; the in-memory
//! exporter keeps it for tests and single-process inspection.

use crate::error::Result;
use crate::evidence::{Evidence, EvidenceEvent, EvidenceValue};
use async_trait::async_trait;
use opentelemetry::trace::{Span, SpanKind, Tracer};
use opentelemetry::{KeyValue, Value};
use std::sync::Arc;
use std::time::SystemTime;
use tokio::sync::RwLock;

/// Name of every evidence span
pub const SPAN_NAME: &str = "compliance.evidence";

/// Event added to every evidence span
pub const SPAN_EVENT: &str = "compliance_evidence_recorded";

/// Sink for canonical evidence
///
/// Called from the emitter's consumer task, one event at a time. An error
/// or panic affects only the event being exported.
#[async_trait]
pub trait EvidenceExporter: Send + Sync {
    /// Export one piece of evidence
    async fn export(&self, event: &EvidenceEvent, evidence: &Evidence) -> Result<()>;

    /// Exporter name for logs
    fn name(&self) -> &str;
}

/// Exports evidence as spans on an OpenTelemetry tracer
pub struct TracingExporter<T> {
    tracer: T,
}

impl<T> TracingExporter<T>
where
    T: Tracer + Send + Sync,
{
    pub fn new(tracer: T) -> Self {
        Self { tracer }
    }
}

#[async_trait]
impl<T> EvidenceExporter for TracingExporter<T>
where
    T: Tracer + Send + Sync,
{
    async fn export(&self, event: &EvidenceEvent, evidence: &Evidence) -> Result<()> {
        let attributes: Vec<KeyValue> = evidence
            .attributes
            .iter()
            .map(|attr| KeyValue::new(attr.key.clone(), otel_value(&attr.value)))
            .collect();

        let mut span = self
            .tracer
            .span_builder(SPAN_NAME)
            .with_kind(SpanKind::Internal)
            .with_start_time(SystemTime::from(event.timestamp))
            .with_attributes(attributes)
            .start(&self.tracer);
        span.add_event(SPAN_EVENT, vec![]);
        span.end();
        Ok(())
    }

    fn name(&self) -> &str {
        "otel-tracer"
    }
}

/// Map an evidence value onto the OpenTelemetry value model
pub fn otel_value(value: &EvidenceValue) -> Value {
    match value {
        EvidenceValue::String(s) => Value::from(s.clone()),
        EvidenceValue::Int(v) => Value::I64(i64::from(*v)),
        EvidenceValue::Int64(v) => Value::I64(*v),
        EvidenceValue::Bool(v) => Value::Bool(*v),
        EvidenceValue::Float64(v) => Value::F64(*v),
    }
}

/// A piece of evidence captured by `MemoryExporter`
#[derive(Debug, Clone)]
pub struct ExportedEvidence {
    pub evidence_id: String,
    pub outcome: String,
    pub evidence: Evidence,
}

/// In-memory exporter for testing and single-process use
#[derive(Clone)]
pub struct MemoryExporter {
    records: Arc<RwLock<Vec<ExportedEvidence>>>,
    max_records: usize,
}

impl MemoryExporter {
    /// Create a new in-memory exporter keeping at most `max_records`
    pub fn new(max_records: usize) -> Self {
        Self {
            records: Arc::new(RwLock::new(Vec::new())),
            max_records,
        }
    }

    /// Everything exported so far, oldest first
    pub async fn records(&self) -> Vec<ExportedEvidence> {
        self.records.read().await.clone()
    }

    pub async fn len(&self) -> usize {
        self.records.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.records.read().await.is_empty()
    }
}

impl Default for MemoryExporter {
    fn default() -> Self {
        Self::new(10_000)
    }
}

#[async_trait]
impl EvidenceExporter for MemoryExporter {
    async fn export(&self, event: &EvidenceEvent, evidence: &Evidence) -> Result<()> {
        let mut records = self.records.write().await;
        records.push(ExportedEvidence {
            evidence_id: event.evidence_id.clone(),
            outcome: event.outcome.clone(),
            evidence: evidence.clone(),
        });

        // Enforce max capacity
        if self.max_records > 0 && records.len() > self.max_records {
            let drain_count = records.len() - self.max_records;
            records.drain(..drain_count);
        }

        Ok(())
    }

    fn name(&self) -> &str {
        "memory"
    }
}
