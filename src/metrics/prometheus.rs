//! Pull backend: Prometheus/OpenMetrics registry
//!
//! Instruments live in a `prometheus_client` registry under the configured
//! namespace and are exposed as text on scrape.

use super::{MetricDescriptor, MetricId, MetricKind, MetricSink, Observation};
use crate::error::{Result, TelemetryError};
use prometheus_client::encoding::text::encode;
use prometheus_client::metrics::counter::Counter;
use prometheus_client::metrics::family::{Family, MetricConstructor};
use prometheus_client::metrics::gauge::Gauge;
use prometheus_client::metrics::histogram::Histogram;
use prometheus_client::registry::Registry;
use std::collections::HashMap;

/// Content type of the text exposition
pub const CONTENT_TYPE: &str = "application/openmetrics-text; version=1.0.0; charset=utf-8";

type Labels = Vec<(String, String)>;

/// Builds histograms with a fixed boundary set for a labelled family
#[derive(Debug, Clone)]
struct HistogramCtor {
    boundaries: Vec<f64>,
}

impl MetricConstructor<Histogram> for HistogramCtor {
    fn new_metric(&self) -> Histogram {
        Histogram::new(self.boundaries.iter().copied())
    }
}

enum Instrument {
    Counter(Family<Labels, Counter>),
    Histogram(Family<Labels, Histogram, HistogramCtor>),
    Gauge(Family<Labels, Gauge>),
    UnlabeledCounter(Counter),
    UnlabeledHistogram(Histogram),
    UnlabeledGauge(Gauge),
}

/// Prometheus sink backed by a `prometheus_client` registry
pub struct PrometheusSink {
    namespace: String,
    registry: Registry,
    instruments: HashMap<MetricId, Instrument>,
    names: Vec<String>,
}

impl PrometheusSink {
    /// Create an empty sink; every metric name is prefixed with `namespace_`
    pub fn new(namespace: &str) -> Result<Self> {
        if !is_valid_name(namespace) {
            return Err(TelemetryError::Config(format!(
                "Invalid Prometheus namespace: '{}'",
                namespace
            )));
        }
        Ok(Self {
            namespace: namespace.to_string(),
            registry: Registry::with_prefix(namespace),
            instruments: HashMap::new(),
            names: Vec::new(),
        })
    }

    /// Fully qualified exposition name of an instrument
    pub fn exposed_name(&self, descriptor: &MetricDescriptor) -> String {
        format!("{}_{}", self.namespace, descriptor.name)
    }

    fn registration_error(&self, descriptor: &MetricDescriptor, reason: impl Into<String>) -> TelemetryError {
        TelemetryError::Registration {
            backend: self.backend().to_string(),
            metric: descriptor.name.to_string(),
            reason: reason.into(),
        }
    }
}

impl MetricSink for PrometheusSink {
    fn backend(&self) -> &'static str {
        "prometheus"
    }

    fn register(&mut self, descriptor: &MetricDescriptor, boundaries: Option<&[f64]>) -> Result<()> {
        if !is_valid_name(descriptor.name) {
            return Err(self.registration_error(descriptor, "invalid metric name"));
        }
        if let Some(label) = descriptor.labels.iter().find(|l| !is_valid_label(l)) {
            return Err(self.registration_error(descriptor, format!("invalid label '{}'", label)));
        }
        if self.instruments.contains_key(&descriptor.id)
            || self.names.iter().any(|n| n == descriptor.name)
        {
            return Err(self.registration_error(descriptor, "already registered"));
        }

        // The text encoder appends `_total` to counters itself
        let name = match descriptor.kind {
            MetricKind::Counter => descriptor.name.strip_suffix("_total").unwrap_or(descriptor.name),
            _ => descriptor.name,
        };
        let labelled = !descriptor.labels.is_empty();

        let instrument = match descriptor.kind {
            MetricKind::Counter if labelled => {
                let family = Family::<Labels, Counter>::default();
                self.registry.register(name, descriptor.help, family.clone());
                Instrument::Counter(family)
            }
            MetricKind::Counter => {
                let counter = Counter::default();
                self.registry.register(name, descriptor.help, counter.clone());
                Instrument::UnlabeledCounter(counter)
            }
            MetricKind::Histogram(_) => {
                let boundaries = match boundaries {
                    Some(b) if !b.is_empty() => b.to_vec(),
                    _ => return Err(self.registration_error(descriptor, "missing bucket boundaries")),
                };
                if labelled {
                    let family = Family::new_with_constructor(HistogramCtor { boundaries });
                    self.registry.register(name, descriptor.help, family.clone());
                    Instrument::Histogram(family)
                } else {
                    let histogram = Histogram::new(boundaries.into_iter());
                    self.registry.register(name, descriptor.help, histogram.clone());
                    Instrument::UnlabeledHistogram(histogram)
                }
            }
            MetricKind::UpDown if labelled => {
                let family = Family::<Labels, Gauge>::default();
                self.registry.register(name, descriptor.help, family.clone());
                Instrument::Gauge(family)
            }
            MetricKind::UpDown => {
                let gauge = Gauge::default();
                self.registry.register(name, descriptor.help, gauge.clone());
                Instrument::UnlabeledGauge(gauge)
            }
        };

        self.names.push(descriptor.name.to_string());
        self.instruments.insert(descriptor.id, instrument);
        Ok(())
    }

    fn observe(&self, descriptor: &MetricDescriptor, labels: &[&str], observation: Observation) {
        let Some(instrument) = self.instruments.get(&descriptor.id) else {
            return;
        };
        let label_set = || -> Labels {
            descriptor
                .labels
                .iter()
                .zip(labels)
                .map(|(k, v)| (k.to_string(), v.to_string()))
                .collect()
        };

        match (instrument, observation) {
            (Instrument::Counter(family), Observation::Increment(n)) => {
                family.get_or_create(&label_set()).inc_by(n);
            }
            (Instrument::UnlabeledCounter(counter), Observation::Increment(n)) => {
                counter.inc_by(n);
            }
            (Instrument::Histogram(family), Observation::Value(v)) => {
                family.get_or_create(&label_set()).observe(v);
            }
            (Instrument::UnlabeledHistogram(histogram), Observation::Value(v)) => {
                histogram.observe(v);
            }
            (Instrument::Gauge(family), Observation::Delta(d)) => {
                family.get_or_create(&label_set()).inc_by(d);
            }
            (Instrument::UnlabeledGauge(gauge), Observation::Delta(d)) => {
                gauge.inc_by(d);
            }
            _ => {
                tracing::debug!(metric = descriptor.name, ?observation, "Observation kind mismatch");
            }
        }
    }

    fn exposition(&self) -> Option<Result<String>> {
        let mut buffer = String::new();
        Some(
            encode(&mut buffer, &self.registry)
                .map(|()| buffer)
                .map_err(|e| TelemetryError::Encoding(e.to_string())),
        )
    }
}

impl std::fmt::Debug for PrometheusSink {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PrometheusSink")
            .field("namespace", &self.namespace)
            .field("instruments", &self.instruments.len())
            .finish()
    }
}

fn is_valid_name(name: &str) -> bool {
    let mut chars = name.chars();
    match chars.next() {
        Some(c) if c.is_ascii_alphabetic() || c == '_' || c == ':' => {}
        _ => return false,
    }
    chars.all(|c| c.is_ascii_alphanumeric() || c == '_' || c == ':')
}

fn is_valid_label(name: &str) -> bool {
    !name.starts_with("__") && !name.contains(':') && is_valid_name(name)
}
