//! Push backend: OpenTelemetry meter instruments
//!
//! Instruments are created on a `Meter` from whatever `MeterProvider` the
//! caller built; export cadence belongs to that provider's reader.

use super::{MetricDescriptor, MetricId, MetricKind, MetricSink, Observation};
use crate::error::{Result, TelemetryError};
use opentelemetry::metrics::{Counter, Histogram, Meter, UpDownCounter};
use opentelemetry::KeyValue;
use std::collections::HashMap;

enum Instrument {
    Counter(Counter<u64>),
    Histogram(Histogram<f64>),
    UpDown(UpDownCounter<i64>),
}

/// OpenTelemetry sink
pub struct OtelSink {
    namespace: String,
    meter: Meter,
    instruments: HashMap<MetricId, Instrument>,
    names: Vec<String>,
}

impl OtelSink {
    pub fn new(namespace: &str, meter: Meter) -> Self {
        Self {
            namespace: namespace.to_string(),
            meter,
            instruments: HashMap::new(),
            names: Vec::new(),
        }
    }

    /// Instrument name: `namespace.name`, counters without `_total`
    pub fn instrument_name(&self, descriptor: &MetricDescriptor) -> String {
        let base = match descriptor.kind {
            MetricKind::Counter => descriptor.name.strip_suffix("_total").unwrap_or(descriptor.name),
            _ => descriptor.name,
        };
        if self.namespace.is_empty() {
            base.to_string()
        } else {
            format!("{}.{}", self.namespace, base)
        }
    }
}

impl MetricSink for OtelSink {
    fn backend(&self) -> &'static str {
        "otlp"
    }

    fn register(&mut self, descriptor: &MetricDescriptor, boundaries: Option<&[f64]>) -> Result<()> {
        let name = self.instrument_name(descriptor);
        let fail = |reason: &str| TelemetryError::Registration {
            backend: "otlp".to_string(),
            metric: name.clone(),
            reason: reason.to_string(),
        };

        if !is_valid_instrument_name(&name) {
            return Err(fail("invalid instrument name"));
        }
        if self.instruments.contains_key(&descriptor.id) || self.names.contains(&name) {
            return Err(fail("already registered"));
        }

        let instrument = match descriptor.kind {
            MetricKind::Counter => {
                let builder = self
                    .meter
                    .u64_counter(name.clone())
                    .with_description(descriptor.help);
                let builder = match descriptor.unit {
                    Some(unit) => builder.with_unit(unit),
                    None => builder,
                };
                Instrument::Counter(builder.build())
            }
            MetricKind::Histogram(_) => {
                let boundaries = match boundaries {
                    Some(b) if !b.is_empty() => b.to_vec(),
                    _ => return Err(fail("missing bucket boundaries")),
                };
                let builder = self
                    .meter
                    .f64_histogram(name.clone())
                    .with_description(descriptor.help)
                    .with_boundaries(boundaries);
                let builder = match descriptor.unit {
                    Some(unit) => builder.with_unit(unit),
                    None => builder,
                };
                Instrument::Histogram(builder.build())
            }
            MetricKind::UpDown => {
                let builder = self
                    .meter
                    .i64_up_down_counter(name.clone())
                    .with_description(descriptor.help);
                let builder = match descriptor.unit {
                    Some(unit) => builder.with_unit(unit),
                    None => builder,
                };
                Instrument::UpDown(builder.build())
            }
        };

        self.names.push(name);
        self.instruments.insert(descriptor.id, instrument);
        Ok(())
    }

    fn observe(&self, descriptor: &MetricDescriptor, labels: &[&str], observation: Observation) {
        let Some(instrument) = self.instruments.get(&descriptor.id) else {
            return;
        };
        let attributes: Vec<KeyValue> = descriptor
            .labels
            .iter()
            .zip(labels)
            .map(|(k, v)| KeyValue::new(*k, v.to_string()))
            .collect();

        match (instrument, observation) {
            (Instrument::Counter(c), Observation::Increment(n)) => c.add(n, &attributes),
            (Instrument::Histogram(h), Observation::Value(v)) => h.record(v, &attributes),
            (Instrument::UpDown(u), Observation::Delta(d)) => u.add(d, &attributes),
            _ => {
                tracing::debug!(metric = descriptor.name, ?observation, "Observation kind mismatch");
            }
        }
    }
}

impl std::fmt::Debug for OtelSink {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OtelSink")
            .field("namespace", &self.namespace)
            .field("instruments", &self.instruments.len())
            .finish()
    }
}

// ASCII letter first, then up to 254 of `[A-Za-z0-9_./-]`
fn is_valid_instrument_name(name: &str) -> bool {
    let mut chars = name.chars();
    match chars.next() {
        Some(c) if c.is_ascii_alphabetic() => {}
        _ => return false,
    }
    name.len() <= 255
        && chars.all(|c| c.is_ascii_alphanumeric() || matches!(c, '_' | '.' | '/' | '-'))
}
