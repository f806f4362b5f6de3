//! Telemetry configuration
//!
//! Queue sizing, drain budget, export cadence and histogram buckets are all
//! set here rather than in the pipeline code.

use crate::error::{Result, TelemetryError};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

/// Default bounded queue capacity
pub const DEFAULT_QUEUE_CAPACITY: usize = 1000;

/// Largest queue capacity a Tokio channel can be created with
pub const MAX_QUEUE_CAPACITY: usize = tokio::sync::Semaphore::MAX_PERMITS;

/// Default drain budget on shutdown
pub const DEFAULT_DRAIN_TIMEOUT: Duration = Duration::from_secs(5);

/// Default push interval for the OTLP metric exporter
pub const DEFAULT_EXPORT_INTERVAL: Duration = Duration::from_secs(10);

/// Default OTLP collector endpoint (gRPC)
pub const DEFAULT_OTLP_ENDPOINT: &str = "localhost:4317";

/// Histogram bucket layout
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", tag = "type")]
pub enum Buckets {
    /// `count` boundaries starting at `start`, each `factor` times the previous
    Exponential { start: f64, factor: f64, count: u16 },
    /// `count` boundaries starting at `start`, each `width` above the previous
    Linear { start: f64, width: f64, count: u16 },
}

impl Buckets {
    /// Upper bucket boundaries, shared verbatim by every backend
    pub fn boundaries(&self) -> Vec<f64> {
        use prometheus_client::metrics::histogram::{exponential_buckets, linear_buckets};
        match *self {
            Buckets::Exponential {
                start,
                factor,
                count,
            } => exponential_buckets(start, factor, count).collect(),
            Buckets::Linear {
                start,
                width,
                count,
            } => linear_buckets(start, width, count).collect(),
        }
    }

    fn validate(&self, name: &str) -> Result<()> {
        let ok = match *self {
            Buckets::Exponential {
                start,
                factor,
                count,
            } => start > 0.0 && factor > 1.0 && count > 0,
            Buckets::Linear { width, count, .. } => width > 0.0 && count > 0,
        };
        if ok {
            Ok(())
        } else {
            Err(TelemetryError::Config(format!(
                "Invalid bucket layout for {}: {:?}",
                name, self
            )))
        }
    }
}

/// Bucket layouts per metric domain
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HistogramBuckets {
    /// Durations in seconds (1µs to ~1s)
    #[serde(default = "default_latency_buckets")]
    pub latency: Buckets,

    /// Compliance evidence size in bytes (100B to ~1.6MB)
    #[serde(default = "default_evidence_size_buckets")]
    pub evidence_size: Buckets,

    /// Processed span size in bytes (100B to ~50MB)
    #[serde(default = "default_span_size_buckets")]
    pub span_size: Buckets,

    /// Attributes per processed span (1 to 2048)
    #[serde(default = "default_attribute_count_buckets")]
    pub attribute_count: Buckets,

    /// Fields loaded by lazy evaluation (0 to 95)
    #[serde(default = "default_fields_loaded_buckets")]
    pub fields_loaded: Buckets,
}

fn default_latency_buckets() -> Buckets {
    Buckets::Exponential {
        start: 0.000_001,
        factor: 2.0,
        count: 20,
    }
}

fn default_evidence_size_buckets() -> Buckets {
    Buckets::Exponential {
        start: 100.0,
        factor: 2.0,
        count: 15,
    }
}

fn default_span_size_buckets() -> Buckets {
    Buckets::Exponential {
        start: 100.0,
        factor: 2.0,
        count: 20,
    }
}

fn default_attribute_count_buckets() -> Buckets {
    Buckets::Exponential {
        start: 1.0,
        factor: 2.0,
        count: 12,
    }
}

fn default_fields_loaded_buckets() -> Buckets {
    Buckets::Linear {
        start: 0.0,
        width: 5.0,
        count: 20,
    }
}

impl Default for HistogramBuckets {
    fn default() -> Self {
        Self {
            latency: default_latency_buckets(),
            evidence_size: default_evidence_size_buckets(),
            span_size: default_span_size_buckets(),
            attribute_count: default_attribute_count_buckets(),
            fields_loaded: default_fields_loaded_buckets(),
        }
    }
}

impl HistogramBuckets {
    pub fn validate(&self) -> Result<()> {
        self.latency.validate("latency")?;
        self.evidence_size.validate("evidenceSize")?;
        self.span_size.validate("spanSize")?;
        self.attribute_count.validate("attributeCount")?;
        self.fields_loaded.validate("fieldsLoaded")
    }
}

/// AsyncEmitter settings
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EmitterConfig {
    /// Bounded queue capacity (default: 1000)
    #[serde(default = "default_queue_capacity")]
    pub queue_capacity: usize,

    /// Wall-clock drain budget on stop, in milliseconds (default: 5000)
    #[serde(default = "default_drain_timeout_ms")]
    pub drain_timeout_ms: u64,
}

fn default_queue_capacity() -> usize {
    DEFAULT_QUEUE_CAPACITY
}

fn default_drain_timeout_ms() -> u64 {
    DEFAULT_DRAIN_TIMEOUT.as_millis() as u64
}

impl Default for EmitterConfig {
    fn default() -> Self {
        Self {
            queue_capacity: default_queue_capacity(),
            drain_timeout_ms: default_drain_timeout_ms(),
        }
    }
}

impl EmitterConfig {
    pub fn new(queue_capacity: usize, drain_timeout: Duration) -> Self {
        Self {
            queue_capacity,
            drain_timeout_ms: drain_timeout.as_millis() as u64,
        }
    }

    pub fn drain_timeout(&self) -> Duration {
        Duration::from_millis(self.drain_timeout_ms)
    }

    pub fn validate(&self) -> Result<()> {
        if self.queue_capacity == 0 {
            return Err(TelemetryError::Config(
                "Queue capacity must be greater than 0".to_string(),
            ));
        }
        if self.queue_capacity > MAX_QUEUE_CAPACITY {
            return Err(TelemetryError::Config(format!(
                "Queue capacity {} exceeds the maximum of {}",
                self.queue_capacity, MAX_QUEUE_CAPACITY
            )));
        }
        Ok(())
    }
}

/// Top-level telemetry settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TelemetryConfig {
    /// `service.name` resource attribute
    #[serde(default = "default_service_name")]
    pub service_name: String,

    /// `service.version` resource attribute
    #[serde(default = "default_service_version")]
    pub service_version: String,

    /// `deployment.environment` resource attribute
    #[serde(default = "default_environment")]
    pub environment: String,

    /// Metric name namespace (Prometheus prefix `betrace_`, OTel `betrace.`)
    #[serde(default = "default_namespace")]
    pub namespace: String,

    #[serde(default)]
    pub emitter: EmitterConfig,

    /// Enable the pull (Prometheus scrape) backend
    #[serde(default = "default_true")]
    pub prometheus_enabled: bool,

    /// Enable OTLP push export for spans and metrics
    #[serde(default = "default_true")]
    pub otlp_enabled: bool,

    /// OTLP collector endpoint
    #[serde(default = "default_otlp_endpoint")]
    pub otlp_endpoint: String,

    /// OTLP metric push interval in milliseconds (default: 10000)
    #[serde(default = "default_export_interval_ms")]
    pub export_interval_ms: u64,

    /// Scrape server bind address
    #[serde(default = "default_metrics_addr")]
    pub metrics_addr: String,

    #[serde(default)]
    pub buckets: HistogramBuckets,
}

fn default_service_name() -> String {
    "betrace-backend".to_string()
}

fn default_service_version() -> String {
    env!("CARGO_PKG_VERSION").to_string()
}

fn default_environment() -> String {
    "development".to_string()
}

fn default_namespace() -> String {
    "betrace".to_string()
}

fn default_true() -> bool {
    true
}

fn default_otlp_endpoint() -> String {
    DEFAULT_OTLP_ENDPOINT.to_string()
}

fn default_export_interval_ms() -> u64 {
    DEFAULT_EXPORT_INTERVAL.as_millis() as u64
}

fn default_metrics_addr() -> String {
    "127.0.0.1:9464".to_string()
}

impl Default for TelemetryConfig {
    fn default() -> Self {
        Self {
            service_name: default_service_name(),
            service_version: default_service_version(),
            environment: default_environment(),
            namespace: default_namespace(),
            emitter: EmitterConfig::default(),
            prometheus_enabled: true,
            otlp_enabled: true,
            otlp_endpoint: default_otlp_endpoint(),
            export_interval_ms: default_export_interval_ms(),
            metrics_addr: default_metrics_addr(),
            buckets: HistogramBuckets::default(),
        }
    }
}

impl TelemetryConfig {
    /// Load a JSON config file; missing fields take their defaults
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let content = std::fs::read_to_string(path.as_ref())?;
        let config: TelemetryConfig = serde_json::from_str(&content)?;
        config.validate()?;
        Ok(config)
    }

    /// Defaults overlaid with environment variables
    pub fn from_env() -> Result<Self> {
        Self::default().with_env_lookup(|key| std::env::var(key).ok())
    }

    /// Overlay values from an arbitrary lookup (used by `from_env`)
    pub fn with_env_lookup(mut self, lookup: impl Fn(&str) -> Option<String>) -> Result<Self> {
        if let Some(endpoint) = lookup("OTEL_EXPORTER_OTLP_ENDPOINT").filter(|v| !v.is_empty()) {
            self.otlp_endpoint = endpoint;
        }
        if let Some(name) = lookup("OTEL_SERVICE_NAME").filter(|v| !v.is_empty()) {
            self.service_name = name;
        }
        if let Some(raw) = lookup("BETRACE_QUEUE_CAPACITY") {
            self.emitter.queue_capacity = parse_env("BETRACE_QUEUE_CAPACITY", &raw)?;
        }
        if let Some(raw) = lookup("BETRACE_DRAIN_TIMEOUT_MS") {
            self.emitter.drain_timeout_ms = parse_env("BETRACE_DRAIN_TIMEOUT_MS", &raw)?;
        }
        if let Some(raw) = lookup("BETRACE_METRICS_EXPORT_INTERVAL_MS") {
            self.export_interval_ms = parse_env("BETRACE_METRICS_EXPORT_INTERVAL_MS", &raw)?;
        }
        if let Some(addr) = lookup("BETRACE_METRICS_ADDR").filter(|v| !v.is_empty()) {
            self.metrics_addr = addr;
        }
        self.validate()?;
        Ok(self)
    }

    pub fn validate(&self) -> Result<()> {
        self.emitter.validate()?;
        if self.export_interval_ms == 0 {
            return Err(TelemetryError::Config(
                "Export interval must be greater than 0".to_string(),
            ));
        }
        if self.namespace.is_empty() {
            return Err(TelemetryError::Config(
                "Metric namespace cannot be empty".to_string(),
            ));
        }
        self.buckets.validate()
    }

    pub fn export_interval(&self) -> Duration {
        Duration::from_millis(self.export_interval_ms)
    }

    /// OTLP endpoint with an `http://` scheme when none was given
    pub fn otlp_endpoint_url(&self) -> String {
        if self.otlp_endpoint.contains("://") {
            self.otlp_endpoint.clone()
        } else {
            format!("http://{}", self.otlp_endpoint)
        }
    }
}

fn parse_env<T: std::str::FromStr>(key: &str, raw: &str) -> Result<T>
where
    T::Err: std::fmt::Display,
{
    raw.trim().parse().map_err(|e| {
        TelemetryError::Config(format!("Invalid value for {}: '{}' ({})", key, raw, e))
    })
}
