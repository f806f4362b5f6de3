//! Telemetry handle
//!
//! `ComplianceTelemetry` owns everything the pipeline needs: taxonomy,
//! metrics recorder, evidence emitter and the OpenTelemetry providers. There
//! is no global state; build as many isolated instances as needed.

use crate::compliance::ComplianceRecorder;
use crate::config::TelemetryConfig;
use crate::emitter::{AsyncEmitter, DrainReport, EnqueueOutcome, StatsSnapshot};
use crate::error::{Result, TelemetryError};
use crate::evidence::Details;
use crate::export::{EvidenceExporter, TracingExporter};
use crate::metrics::{
    BackendStatus, DropReason, EvaluationResult, MetricsRecorder, OtelSink, PrometheusSink,
    Severity,
};
use crate::rules::{RuleEvaluationSpan, RuleLoadSpan, RuleTracer};
use crate::taxonomy::{ComplianceControl, Taxonomy};
use opentelemetry::global::BoxedTracer;
use opentelemetry::metrics::MeterProvider as _;
use opentelemetry::trace::TracerProvider as _;
use opentelemetry::KeyValue;
use opentelemetry_otlp::WithExportConfig;
use opentelemetry_sdk::metrics::{PeriodicReader, SdkMeterProvider};
use opentelemetry_sdk::trace::SdkTracerProvider;
use opentelemetry_sdk::Resource;
use serde::Serialize;
use std::sync::{Arc, Mutex, PoisonError};

/// Instrumentation scope of every tracer and meter
pub const INSTRUMENTATION_SCOPE: &str = "betrace";

/// Combined snapshot served on `/stats`
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TelemetryStatus {
    pub service_name: String,
    pub emitter: StatsSnapshot,
    pub backends: Vec<BackendStatus>,
}

#[derive(Default)]
struct Providers {
    tracer: Option<SdkTracerProvider>,
    meter: Option<SdkMeterProvider>,
}

/// Compliance telemetry pipeline
pub struct ComplianceTelemetry {
    config: TelemetryConfig,
    taxonomy: Taxonomy,
    metrics: Arc<MetricsRecorder>,
    emitter: AsyncEmitter,
    rules: RuleTracer,
    providers: Mutex<Providers>,
}

impl ComplianceTelemetry {
    /// Build and start the pipeline
    ///
    /// Order: resource, tracer provider, meter provider, metric sinks,
    /// recorder, evidence exporter, emitter. A backend that fails to come up
    /// is logged and skipped; only invalid configuration is an error. Must be
    /// called from within a Tokio runtime.
    pub fn init(config: TelemetryConfig) -> Result<Self> {
        config.validate()?;

        let resource = Resource::builder()
            .with_service_name(config.service_name.clone())
            .with_attributes([
                KeyValue::new("service.version", config.service_version.clone()),
                KeyValue::new("deployment.environment", config.environment.clone()),
            ])
            .build();

        let mut providers = Providers::default();
        if config.otlp_enabled {
            match build_tracer_provider(&config, resource.clone()) {
                Ok(provider) => providers.tracer = Some(provider),
                Err(e) => tracing::warn!(error = %e, "OTLP trace export unavailable"),
            }
            match build_meter_provider(&config, resource) {
                Ok(provider) => providers.meter = Some(provider),
                Err(e) => tracing::warn!(error = %e, "OTLP metric export unavailable"),
            }
        }

        let mut builder = MetricsRecorder::builder(config.buckets.clone());
        if config.prometheus_enabled {
            match PrometheusSink::new(&config.namespace) {
                Ok(sink) => builder = builder.sink(sink),
                Err(e) => tracing::warn!(error = %e, "Prometheus backend unavailable"),
            }
        }
        if let Some(provider) = &providers.meter {
            builder = builder.sink(OtelSink::new(
                &config.namespace,
                provider.meter(INSTRUMENTATION_SCOPE),
            ));
        }
        let metrics = Arc::new(builder.build());

        let (exporter, rule_tracer): (Arc<dyn EvidenceExporter>, BoxedTracer) = match &providers.tracer {
            Some(provider) => (
                Arc::new(TracingExporter::new(provider.tracer(INSTRUMENTATION_SCOPE))),
                BoxedTracer::new(Box::new(provider.tracer(INSTRUMENTATION_SCOPE))),
            ),
            None => {
                tracing::info!("Exporting compliance evidence through the global tracer provider");
                (
                    Arc::new(TracingExporter::new(opentelemetry::global::tracer(
                        INSTRUMENTATION_SCOPE,
                    ))),
                    opentelemetry::global::tracer(INSTRUMENTATION_SCOPE),
                )
            }
        };

        let telemetry = Self::from_parts(config, Taxonomy::standard(), metrics, exporter)?
            .with_rule_tracer(rule_tracer);
        *telemetry.providers.lock().unwrap_or_else(PoisonError::into_inner) = providers;
        telemetry.start()?;

        tracing::info!(
            service = %telemetry.config.service_name,
            backends = ?telemetry.metrics.live_backends(),
            otlp_endpoint = %telemetry.config.otlp_endpoint_url(),
            "Compliance telemetry initialized"
        );
        Ok(telemetry)
    }

    /// Assemble a pipeline from prepared parts without starting it
    ///
    /// Rule spans go to the global tracer provider until
    /// `with_rule_tracer` replaces it.
    pub fn from_parts(
        config: TelemetryConfig,
        taxonomy: Taxonomy,
        metrics: Arc<MetricsRecorder>,
        exporter: Arc<dyn EvidenceExporter>,
    ) -> Result<Self> {
        let emitter = AsyncEmitter::new(config.emitter.clone(), exporter, Arc::clone(&metrics))?;
        let rules = RuleTracer::new(
            opentelemetry::global::tracer(INSTRUMENTATION_SCOPE),
            Arc::clone(&metrics),
        );
        Ok(Self {
            config,
            taxonomy,
            metrics,
            emitter,
            rules,
            providers: Mutex::new(Providers::default()),
        })
    }

    /// Emit rule spans on `tracer`
    pub fn with_rule_tracer(mut self, tracer: BoxedTracer) -> Self {
        self.rules = RuleTracer::new(tracer, Arc::clone(&self.metrics));
        self
    }

    /// Start the evidence consumer
    pub fn start(&self) -> Result<()> {
        self.emitter.start()
    }

    /// Drain the emitter, then shut down (and so flush) the OTLP providers
    ///
    /// Every step runs even if an earlier one fails; the first provider error
    /// is returned. Calling it again returns `Ok(None)`.
    pub async fn shutdown(&self) -> Result<Option<DrainReport>> {
        let report = self.emitter.stop().await;

        let providers = std::mem::take(&mut *self.providers.lock().unwrap_or_else(PoisonError::into_inner));
        if providers.tracer.is_none() && providers.meter.is_none() {
            return Ok(report);
        }

        let result = tokio::task::spawn_blocking(move || {
            let mut first_error = None;
            if let Some(provider) = providers.tracer {
                if let Err(e) = provider.shutdown() {
                    tracing::warn!(error = %e, "Tracer provider shutdown failed");
                    first_error.get_or_insert(TelemetryError::Exporter(e.to_string()));
                }
            }
            if let Some(provider) = providers.meter {
                if let Err(e) = provider.shutdown() {
                    tracing::warn!(error = %e, "Meter provider shutdown failed");
                    first_error.get_or_insert(TelemetryError::Exporter(e.to_string()));
                }
            }
            first_error
        })
        .await
        .map_err(|e| TelemetryError::Exporter(e.to_string()))?;

        match result {
            Some(e) => Err(e),
            None => Ok(report),
        }
    }

    pub fn config(&self) -> &TelemetryConfig {
        &self.config
    }

    pub fn taxonomy(&self) -> &Taxonomy {
        &self.taxonomy
    }

    pub fn metrics(&self) -> &Arc<MetricsRecorder> {
        &self.metrics
    }

    pub fn emitter(&self) -> &AsyncEmitter {
        &self.emitter
    }

    pub fn rules(&self) -> &RuleTracer {
        &self.rules
    }

    /// Start a traced rule evaluation; see [`RuleTracer::start_evaluation`]
    pub fn start_rule_evaluation(&self, rule_id: &str, span_id: &str) -> RuleEvaluationSpan {
        self.rules.start_evaluation(rule_id, span_id)
    }

    /// Start a traced rule load; see [`RuleTracer::start_load`]
    pub fn start_rule_load(&self, rule_id: &str) -> RuleLoadSpan {
        self.rules.start_load(rule_id)
    }

    pub fn status(&self) -> TelemetryStatus {
        TelemetryStatus {
            service_name: self.config.service_name.clone(),
            emitter: self.emitter.stats(),
            backends: self.metrics.backends().to_vec(),
        }
    }
}

impl ComplianceRecorder for ComplianceTelemetry {
    fn emit_compliance_evidence(
        &self,
        control: &ComplianceControl,
        outcome: &str,
        details: Details,
    ) -> EnqueueOutcome {
        if !self.taxonomy.contains(control) {
            return self.emitter.reject(control, DropReason::UnknownControl);
        }
        self.emitter.enqueue(*control, outcome, details)
    }

    fn record_rule_evaluation(&self, rule_id: &str, result: EvaluationResult, duration_seconds: f64) {
        self.metrics.record_rule_evaluation(rule_id, result, duration_seconds);
    }

    fn record_violation(&self, control: &ComplianceControl, severity: Severity) {
        self.metrics.record_violation(control, severity);
    }
}

impl std::fmt::Debug for ComplianceTelemetry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ComplianceTelemetry")
            .field("service_name", &self.config.service_name)
            .field("emitter", &self.emitter)
            .field("metrics", &self.metrics)
            .finish()
    }
}

fn build_tracer_provider(config: &TelemetryConfig, resource: Resource) -> Result<SdkTracerProvider> {
    let exporter = opentelemetry_otlp::SpanExporter::builder()
        .with_tonic()
        .with_endpoint(config.otlp_endpoint_url())
        .build()
        .map_err(|e| TelemetryError::Exporter(e.to_string()))?;

    Ok(SdkTracerProvider::builder()
        .with_batch_exporter(exporter)
        .with_resource(resource)
        .build())
}

fn build_meter_provider(config: &TelemetryConfig, resource: Resource) -> Result<SdkMeterProvider> {
    let exporter = opentelemetry_otlp::MetricExporter::builder()
        .with_tonic()
        .with_endpoint(config.otlp_endpoint_url())
        .build()
        .map_err(|e| TelemetryError::Exporter(e.to_string()))?;

    let reader = PeriodicReader::builder(exporter)
        .with_interval(config.export_interval())
        .build();

    Ok(SdkMeterProvider::builder()
        .with_reader(reader)
        .with_resource(resource)
        .build())
}
