//! OpenTelemetry span export tests
//!
//! Evidence flows through the real `TracingExporter` into an in-memory span
//! exporter, so the attributes auditors see can be checked exactly.

use betrace_telemetry::taxonomy::{GDPR_ART_7, SOC2_CC6_1};
use betrace_telemetry::{
    details, ComplianceRecorder, ComplianceTelemetry, EvidenceExporter, HistogramBuckets,
    MetricsRecorder, PrometheusSink, Taxonomy, TelemetryConfig, TracingExporter,
};
use opentelemetry::global::BoxedTracer;
use opentelemetry::trace::{Status, TracerProvider as _};
use opentelemetry::{KeyValue, Value};
use opentelemetry_sdk::trace::{InMemorySpanExporter, SdkTracerProvider, SpanData};
use std::sync::Arc;
use std::time::SystemTime;

fn pipeline() -> (ComplianceTelemetry, InMemorySpanExporter, SdkTracerProvider) {
    let spans = InMemorySpanExporter::default();
    let provider = SdkTracerProvider::builder()
        .with_simple_exporter(spans.clone())
        .build();
    let exporter: Arc<dyn EvidenceExporter> =
        Arc::new(TracingExporter::new(provider.tracer("betrace-test")));

    let telemetry = ComplianceTelemetry::from_parts(
        TelemetryConfig::default(),
        Taxonomy::standard(),
        Arc::new(MetricsRecorder::builder(HistogramBuckets::default()).build()),
        exporter,
    )
    .unwrap();
    (telemetry, spans, provider)
}

fn rule_pipeline() -> (ComplianceTelemetry, InMemorySpanExporter, SdkTracerProvider) {
    let spans = InMemorySpanExporter::default();
    let provider = SdkTracerProvider::builder()
        .with_simple_exporter(spans.clone())
        .build();
    let metrics = MetricsRecorder::builder(HistogramBuckets::default())
        .sink(PrometheusSink::new("betrace").unwrap())
        .build();
    let exporter: Arc<dyn EvidenceExporter> =
        Arc::new(TracingExporter::new(provider.tracer("betrace-test")));

    let telemetry = ComplianceTelemetry::from_parts(
        TelemetryConfig::default(),
        Taxonomy::standard(),
        Arc::new(metrics),
        exporter,
    )
    .unwrap()
    .with_rule_tracer(BoxedTracer::new(Box::new(provider.tracer("betrace-test"))));
    (telemetry, spans, provider)
}

fn attribute<'a>(span: &'a SpanData, key: &str) -> Option<&'a Value> {
    span.attributes
        .iter()
        .find(|kv: &&KeyValue| kv.key.as_str() == key)
        .map(|kv| &kv.value)
}

#[tokio::test]
async fn test_evidence_span_attributes() {
    let (telemetry, spans, _provider) = pipeline();
    telemetry.start().unwrap();

    let before = SystemTime::now();
    telemetry.emit_compliance_evidence(
        &SOC2_CC6_1,
        "granted",
        details! { "user_id" => "u1", "resource" => "/api/rules" },
    );
    telemetry.shutdown().await.unwrap();

    let finished = spans.get_finished_spans().unwrap();
    assert_eq!(finished.len(), 1);
    let span = &finished[0];

    assert_eq!(span.name, "compliance.evidence");
    assert_eq!(attribute(span, "compliance.framework"), Some(&Value::from("soc2")));
    assert_eq!(attribute(span, "compliance.control"), Some(&Value::from("CC6.1")));
    assert_eq!(attribute(span, "compliance.outcome"), Some(&Value::from("granted")));
    assert_eq!(
        attribute(span, "compliance.notes"),
        Some(&Value::from("Logical Access Controls"))
    );
    assert_eq!(attribute(span, "compliance.evidence_type"), Some(&Value::from("audit_trail")));
    assert_eq!(attribute(span, "compliance.tamper_evident"), Some(&Value::Bool(true)));
    assert_eq!(attribute(span, "compliance.user_id"), Some(&Value::from("u1")));
    assert_eq!(attribute(span, "compliance.resource"), Some(&Value::from("/api/rules")));
    assert!(matches!(attribute(span, "compliance.timestamp"), Some(Value::I64(_))));

    match attribute(span, "compliance.evidence_id") {
        Some(Value::String(id)) => assert!(id.as_str().starts_with("evd-")),
        other => panic!("unexpected evidence id: {:?}", other),
    }

    assert!(span.start_time >= before - std::time::Duration::from_secs(1));
    assert!(span
        .events
        .iter()
        .any(|event| event.name == "compliance_evidence_recorded"));
}

#[tokio::test]
async fn test_typed_details_keep_their_type() {
    let (telemetry, spans, _provider) = pipeline();
    telemetry.start().unwrap();

    telemetry.emit_compliance_evidence(
        &GDPR_ART_7,
        "given",
        details! {
            "attempts" => 3i32,
            "bytes" => 4096i64,
            "consented" => true,
            "score" => 0.75,
            "outcome" => "overridden",
        },
    );
    telemetry.shutdown().await.unwrap();

    let finished = spans.get_finished_spans().unwrap();
    let span = &finished[0];
    assert_eq!(attribute(span, "compliance.attempts"), Some(&Value::I64(3)));
    assert_eq!(attribute(span, "compliance.bytes"), Some(&Value::I64(4096)));
    assert_eq!(attribute(span, "compliance.consented"), Some(&Value::Bool(true)));
    assert_eq!(attribute(span, "compliance.score"), Some(&Value::F64(0.75)));
    // Base attributes win over colliding detail keys
    assert_eq!(attribute(span, "compliance.outcome"), Some(&Value::from("given")));
}

#[tokio::test]
async fn test_helpers_produce_one_span_each() {
    let (telemetry, spans, _provider) = pipeline();
    telemetry.start().unwrap();

    telemetry.soc2_access_control("u1", "/a", true);
    telemetry.hipaa_encryption("decrypt", "phi", false);
    telemetry.gdpr_consent("ds1", "given", "analytics");
    telemetry.fedramp_access_control("u2", "/b", false);
    telemetry.shutdown().await.unwrap();

    let finished = spans.get_finished_spans().unwrap();
    let outcomes: Vec<_> = finished
        .iter()
        .filter_map(|span| attribute(span, "compliance.outcome").cloned())
        .collect();
    assert_eq!(
        outcomes,
        vec![
            Value::from("granted"),
            Value::from("failure"),
            Value::from("given"),
            Value::from("denied"),
        ]
    );
}

#[test]
fn test_rule_evaluation_span() {
    let (telemetry, spans, _provider) = rule_pipeline();

    let evaluation = telemetry.start_rule_evaluation("pii-access", "00f067aa0ba902b7");
    evaluation.finish(true);
    telemetry
        .start_rule_evaluation("pii-access", "53995c3f42cd8ad8")
        .finish(false);

    let finished = spans.get_finished_spans().unwrap();
    assert_eq!(finished.len(), 2);
    let matched = &finished[0];
    assert_eq!(matched.name, "rule.evaluate");
    assert_eq!(attribute(matched, "rule.id"), Some(&Value::from("pii-access")));
    assert_eq!(attribute(matched, "span.id"), Some(&Value::from("00f067aa0ba902b7")));
    assert_eq!(
        attribute(matched, "betrace.operation"),
        Some(&Value::from("rule_evaluation"))
    );
    assert_eq!(attribute(matched, "rule.matched"), Some(&Value::Bool(true)));
    assert!(matches!(
        attribute(matched, "rule.evaluation_duration_ms"),
        Some(Value::F64(_))
    ));

    let event = matched
        .events
        .iter()
        .find(|event| event.name == "rule.matched")
        .expect("matched event");
    assert!(event
        .attributes
        .contains(&KeyValue::new("match.reason", "pattern_satisfied")));
    assert!(event.attributes.contains(&KeyValue::new("rule.id", "pii-access")));

    let unmatched = &finished[1];
    assert_eq!(attribute(unmatched, "rule.matched"), Some(&Value::Bool(false)));
    assert!(unmatched.events.iter().all(|event| event.name != "rule.matched"));

    let text = telemetry.metrics().exposition().unwrap().unwrap();
    assert!(text.contains(
        "betrace_compliance_spans_emitted_total{framework=\"soc2\",control=\"CC7.1\",outcome=\"monitoring\"} 2"
    ));
    assert!(text.contains("betrace_rule_evaluation_total{rule_id=\"pii-access\",result=\"match\"} 1"));
    assert!(text.contains("betrace_rule_evaluation_total{rule_id=\"pii-access\",result=\"no_match\"} 1"));
}

#[test]
fn test_rule_load_span_status() {
    let (telemetry, spans, _provider) = rule_pipeline();

    telemetry.start_rule_load("pii-access").finish(Ok(()));
    let err = std::io::Error::new(std::io::ErrorKind::InvalidData, "unexpected token at 3:14");
    telemetry.start_rule_load("broken-rule").finish(Err(&err));

    let finished = spans.get_finished_spans().unwrap();
    assert_eq!(finished.len(), 2);

    let loaded = &finished[0];
    assert_eq!(loaded.name, "rule.load");
    assert_eq!(attribute(loaded, "rule.id"), Some(&Value::from("pii-access")));
    assert_eq!(attribute(loaded, "betrace.operation"), Some(&Value::from("rule_load")));
    assert_eq!(loaded.status, Status::Ok);

    let failed = &finished[1];
    assert_eq!(failed.status, Status::error("unexpected token at 3:14"));
    assert!(failed.events.iter().any(|event| event.name == "exception"));

    let text = telemetry.metrics().exposition().unwrap().unwrap();
    assert!(text.contains("betrace_rule_load_total{status=\"success\"} 1"));
    assert!(text.contains("betrace_rule_load_total{status=\"error\"} 1"));
    assert!(text.contains("betrace_rule_load_duration_seconds_count 2"));
}
