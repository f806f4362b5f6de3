//! Evidence pipeline integration tests
//!
//! End-to-end tests driving the emitter, telemetry handle and scrape router
//! with in-memory and deliberately misbehaving exporters. Drain timing runs
//! on a paused Tokio clock.

use async_trait::async_trait;
use axum::body::Body;
use axum::http::{Request, StatusCode};
use betrace_telemetry::taxonomy::{GDPR_ART_17, HIPAA_164_312_B, SOC2_CC6_1};
use betrace_telemetry::{
    details, AsyncEmitter, ComplianceRecorder, ComplianceTelemetry, DropReason, EmitterConfig,
    EmitterState, EnqueueOutcome, Evidence, EvidenceEvent, EvidenceExporter, EvidenceValue,
    HistogramBuckets, MemoryExporter, MetricsRecorder, PrometheusSink, Severity, Taxonomy,
    TelemetryConfig,
};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::time::Instant;
use tower::ServiceExt;

/// Exporter that takes a fixed time per item
struct SlowExporter {
    delay: Duration,
    exported: Mutex<Vec<String>>,
}

impl SlowExporter {
    fn new(delay: Duration) -> Self {
        Self {
            delay,
            exported: Mutex::new(Vec::new()),
        }
    }
}

#[async_trait]
impl EvidenceExporter for SlowExporter {
    async fn export(&self, event: &EvidenceEvent, _evidence: &Evidence) -> betrace_telemetry::Result<()> {
        tokio::time::sleep(self.delay).await;
        self.exported.lock().unwrap().push(event.outcome.clone());
        Ok(())
    }

    fn name(&self) -> &str {
        "slow"
    }
}

/// Exporter that never completes
struct StuckExporter;

#[async_trait]
impl EvidenceExporter for StuckExporter {
    async fn export(&self, _event: &EvidenceEvent, _evidence: &Evidence) -> betrace_telemetry::Result<()> {
        std::future::pending::<()>().await;
        Ok(())
    }

    fn name(&self) -> &str {
        "stuck"
    }
}

fn emitter(capacity: usize, drain: Duration, exporter: Arc<dyn EvidenceExporter>) -> AsyncEmitter {
    AsyncEmitter::new(
        EmitterConfig::new(capacity, drain),
        exporter,
        Arc::new(MetricsRecorder::disabled()),
    )
    .unwrap()
}

fn telemetry(config: TelemetryConfig, exporter: Arc<MemoryExporter>) -> ComplianceTelemetry {
    let mut builder = MetricsRecorder::builder(HistogramBuckets::default());
    if config.prometheus_enabled {
        builder = builder.sink(PrometheusSink::new(&config.namespace).unwrap());
    }
    ComplianceTelemetry::from_parts(config, Taxonomy::standard(), Arc::new(builder.build()), exporter)
        .unwrap()
}

// ─── Backpressure ───────────────────────────────────────────────

#[tokio::test]
async fn test_full_queue_drops_without_blocking() {
    let emitter = emitter(2, Duration::from_secs(5), Arc::new(MemoryExporter::default()));

    let outcomes: Vec<_> = (0..3)
        .map(|_| emitter.enqueue(SOC2_CC6_1, "granted", details! {}))
        .collect();

    assert_eq!(
        outcomes,
        vec![
            EnqueueOutcome::Accepted,
            EnqueueOutcome::Accepted,
            EnqueueOutcome::Dropped(DropReason::QueueFull),
        ]
    );
    assert_eq!(emitter.queue_depth(), 2);
    assert_eq!(emitter.queue_capacity(), 2);
    assert_eq!(emitter.stats().dropped_queue_full, 1);
}

#[tokio::test]
async fn test_queue_full_drops_are_exposed() {
    let exporter = Arc::new(MemoryExporter::default());
    let config = TelemetryConfig {
        emitter: EmitterConfig::new(1, Duration::from_secs(1)),
        ..TelemetryConfig::default()
    };
    let telemetry = telemetry(config, exporter);

    telemetry.gdpr_data_deletion("ds-1", "completed");
    telemetry.gdpr_data_deletion("ds-2", "completed");
    telemetry.gdpr_data_deletion("ds-3", "completed");

    let text = telemetry.metrics().exposition().unwrap().unwrap();
    assert!(text.contains("betrace_compliance_evidence_dropped_total{reason=\"queue_full\"} 2"));
}

// ─── Ordering ───────────────────────────────────────────────────

#[tokio::test]
async fn test_single_producer_fifo() {
    let exporter = Arc::new(MemoryExporter::default());
    let emitter = emitter(100, Duration::from_secs(5), exporter.clone());
    emitter.start().unwrap();

    for i in 0..50 {
        emitter.enqueue(HIPAA_164_312_B, &format!("o{}", i), details! {});
    }
    let report = emitter.stop().await.unwrap();
    assert_eq!(report.dropped, 0);

    let outcomes: Vec<_> = exporter.records().await.into_iter().map(|r| r.outcome).collect();
    let expected: Vec<_> = (0..50).map(|i| format!("o{}", i)).collect();
    assert_eq!(outcomes, expected);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_producers_preserve_per_producer_order() {
    let exporter = Arc::new(MemoryExporter::default());
    let config = TelemetryConfig {
        emitter: EmitterConfig::new(10_000, Duration::from_secs(5)),
        ..TelemetryConfig::default()
    };
    let telemetry = Arc::new(telemetry(config, exporter.clone()));
    telemetry.start().unwrap();

    let mut handles = Vec::new();
    for producer in 0..4i64 {
        let telemetry = Arc::clone(&telemetry);
        handles.push(tokio::spawn(async move {
            for seq in 0..100i64 {
                let outcome = telemetry.emit_compliance_evidence(
                    &SOC2_CC6_1,
                    "granted",
                    details! { "producer" => producer, "seq" => seq },
                );
                assert!(outcome.is_accepted());
            }
        }));
    }
    for handle in handles {
        handle.await.unwrap();
    }

    let report = telemetry.shutdown().await.unwrap().unwrap();
    assert_eq!(report.dropped, 0);

    let records = exporter.records().await;
    assert_eq!(records.len(), 400);
    for producer in 0..4i64 {
        let seqs: Vec<i64> = records
            .iter()
            .filter(|r| r.evidence.attribute("compliance.producer") == Some(&EvidenceValue::Int64(producer)))
            .filter_map(|r| match r.evidence.attribute("compliance.seq") {
                Some(EvidenceValue::Int64(seq)) => Some(*seq),
                _ => None,
            })
            .collect();
        assert_eq!(seqs, (0..100).collect::<Vec<_>>());
    }
}

// ─── Shutdown ───────────────────────────────────────────────────

#[tokio::test(start_paused = true)]
async fn test_drain_completes_within_budget() {
    let exporter = Arc::new(SlowExporter::new(Duration::from_millis(900)));
    let emitter = emitter(10, Duration::from_secs(5), exporter.clone());
    emitter.start().unwrap();

    for i in 0..5 {
        emitter.enqueue(SOC2_CC6_1, &format!("o{}", i), details! {});
    }

    let started = Instant::now();
    let report = emitter.stop().await.unwrap();
    let elapsed = started.elapsed();

    assert_eq!(report.exported, 5);
    assert_eq!(report.dropped, 0);
    assert!(!report.timed_out);
    assert!(elapsed <= Duration::from_secs(5), "drain took {:?}", elapsed);
    assert_eq!(exporter.exported.lock().unwrap().len(), 5);
    assert_eq!(emitter.state(), EmitterState::Stopped);
}

#[tokio::test(start_paused = true)]
async fn test_drain_deadline_counts_leftovers() {
    let exporter = Arc::new(SlowExporter::new(Duration::from_millis(900)));
    let emitter = emitter(20, Duration::from_secs(5), exporter.clone());
    emitter.start().unwrap();

    for i in 0..10 {
        emitter.enqueue(SOC2_CC6_1, &format!("o{}", i), details! {});
    }
    let report = emitter.stop().await.unwrap();

    assert!(report.timed_out);
    assert_eq!(report.exported, 5);
    assert_eq!(report.dropped, 5);
    assert_eq!(report.exported + report.dropped, 10);
    assert_eq!(emitter.stats().dropped_shutdown, 5);

    let exported = exporter.exported.lock().unwrap().clone();
    assert_eq!(exported, vec!["o0", "o1", "o2", "o3", "o4"]);
}

#[tokio::test(start_paused = true)]
async fn test_stuck_exporter_cannot_block_stop() {
    let emitter = emitter(10, Duration::from_secs(1), Arc::new(StuckExporter));
    emitter.start().unwrap();
    for _ in 0..3 {
        emitter.enqueue(SOC2_CC6_1, "granted", details! {});
    }
    // Let the consumer pick up the first item
    tokio::task::yield_now().await;

    let started = Instant::now();
    let report = emitter.stop().await.unwrap();

    assert!(started.elapsed() <= Duration::from_millis(1100));
    assert!(report.timed_out);
    assert_eq!(report.exported, 0);
    assert_eq!(report.dropped, 3);
    assert_eq!(emitter.stats().dropped_shutdown, 3);
}

#[tokio::test]
async fn test_concurrent_stop_drains_once() {
    let exporter = Arc::new(MemoryExporter::default());
    let emitter = Arc::new(emitter(10, Duration::from_secs(5), exporter.clone()));
    emitter.start().unwrap();
    for _ in 0..5 {
        emitter.enqueue(GDPR_ART_17, "completed", details! {});
    }

    let (a, b) = tokio::join!(emitter.stop(), emitter.stop());
    let reports: Vec<_> = [a, b].into_iter().flatten().collect();
    assert_eq!(reports.len(), 1);
    assert_eq!(exporter.len().await, 5);
    assert_eq!(emitter.stats().exported, 5);
}

// ─── Violations ─────────────────────────────────────────────────

#[tokio::test]
async fn test_detect_violation_records_metric_and_evidence() {
    let exporter = Arc::new(MemoryExporter::default());
    let telemetry = telemetry(TelemetryConfig::default(), exporter.clone());
    telemetry.start().unwrap();

    telemetry.detect_violation(&SOC2_CC6_1, Severity::High, "unauthorized tenant read");
    telemetry.shutdown().await.unwrap();

    let records = exporter.records().await;
    assert_eq!(records.len(), 1);
    assert_eq!(records[0].outcome, "violation");
    assert_eq!(
        records[0].evidence.attribute("compliance.severity"),
        Some(&EvidenceValue::from("high"))
    );

    let text = telemetry.metrics().exposition().unwrap().unwrap();
    assert!(text.contains(
        "betrace_compliance_violations_detected_total{framework=\"soc2\",control=\"CC6.1\",severity=\"high\"} 1"
    ));
}

// ─── Scrape Endpoints ───────────────────────────────────────────

#[tokio::test]
async fn test_metrics_endpoint() {
    let telemetry = Arc::new(telemetry(
        TelemetryConfig::default(),
        Arc::new(MemoryExporter::default()),
    ));
    telemetry.record_rule_evaluation("r1", true.into(), 0.002);

    let app = betrace_telemetry::server::router(Arc::clone(&telemetry));
    let response = app
        .oneshot(Request::builder().uri("/metrics").body(Body::empty()).unwrap())
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::OK);
    let content_type = response.headers()["content-type"].to_str().unwrap().to_string();
    assert!(content_type.starts_with("application/openmetrics-text"));

    let body = axum::body::to_bytes(response.into_body(), usize::MAX).await.unwrap();
    let text = String::from_utf8(body.to_vec()).unwrap();
    assert!(text.contains("betrace_rule_evaluation_total{rule_id=\"r1\",result=\"match\"} 1"));
}

#[tokio::test]
async fn test_metrics_endpoint_without_prometheus() {
    let config = TelemetryConfig {
        prometheus_enabled: false,
        ..TelemetryConfig::default()
    };
    let telemetry = Arc::new(telemetry(config, Arc::new(MemoryExporter::default())));

    let response = betrace_telemetry::server::router(telemetry)
        .oneshot(Request::builder().uri("/metrics").body(Body::empty()).unwrap())
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);
}

#[tokio::test]
async fn test_stats_endpoint() {
    let telemetry = Arc::new(telemetry(
        TelemetryConfig::default(),
        Arc::new(MemoryExporter::default()),
    ));
    telemetry.fedramp_audit_event("login", "u1", "authenticate");

    let response = betrace_telemetry::server::router(Arc::clone(&telemetry))
        .oneshot(Request::builder().uri("/stats").body(Body::empty()).unwrap())
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);

    let body = axum::body::to_bytes(response.into_body(), usize::MAX).await.unwrap();
    let json: serde_json::Value = serde_json::from_slice(&body).unwrap();
    assert_eq!(json["serviceName"], "betrace-backend");
    assert_eq!(json["emitter"]["state"], "created");
    assert_eq!(json["emitter"]["queueDepth"], 1);
    assert_eq!(json["emitter"]["queueCapacity"], 1000);
    assert_eq!(json["backends"][0]["backend"], "prometheus");
}
