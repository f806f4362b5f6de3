//! Rule-engine spans
//!
//! `rule.evaluate` and `rule.load` spans wrap the rule engine's own work.
//! Each span is a guard: start it before the work, then `finish` it with the
//! result. Finishing records the matching metrics on every backend, so
//! callers that trace rules never record those metrics separately.
//!
//! A guard dropped without `finish` still ends its span but records no
//! metrics.

use crate::metrics::{EvaluationResult, LoadStatus, MetricsRecorder};
use crate::taxonomy::SOC2_CC7_1;
use opentelemetry::global::{BoxedSpan, BoxedTracer};
use opentelemetry::trace::{Span, SpanKind, Status, Tracer};
use opentelemetry::KeyValue;
use std::error::Error;
use std::sync::Arc;
use std::time::{Duration, Instant};

/// Name of the span around one rule evaluation
pub const EVALUATE_SPAN: &str = "rule.evaluate";

/// Name of the span around loading one rule
pub const LOAD_SPAN: &str = "rule.load";

/// Event added to an evaluation span when the rule matched
pub const MATCHED_EVENT: &str = "rule.matched";

/// Outcome recorded against SOC2 CC7.1 for every traced evaluation
pub const MONITORING_OUTCOME: &str = "monitoring";

/// Starts rule spans on a tracer and records their metrics
#[derive(Clone)]
pub struct RuleTracer {
    tracer: Arc<BoxedTracer>,
    metrics: Arc<MetricsRecorder>,
}

impl RuleTracer {
    pub fn new(tracer: BoxedTracer, metrics: Arc<MetricsRecorder>) -> Self {
        Self {
            tracer: Arc::new(tracer),
            metrics,
        }
    }

    /// Start a `rule.evaluate` span for `rule_id` evaluated against `span_id`
    ///
    /// Every evaluation is monitoring evidence: the SOC2 CC7.1 compliance
    /// span counter is bumped when the span starts.
    pub fn start_evaluation(&self, rule_id: &str, span_id: &str) -> RuleEvaluationSpan {
        let span = self
            .tracer
            .span_builder(EVALUATE_SPAN)
            .with_kind(SpanKind::Internal)
            .with_attributes([
                KeyValue::new("rule.id", rule_id.to_string()),
                KeyValue::new("span.id", span_id.to_string()),
                KeyValue::new("betrace.operation", "rule_evaluation"),
            ])
            .start(self.tracer.as_ref());
        self.metrics.record_compliance_span(&SOC2_CC7_1, MONITORING_OUTCOME);

        RuleEvaluationSpan {
            span,
            rule_id: rule_id.to_string(),
            metrics: Arc::clone(&self.metrics),
            started: Instant::now(),
        }
    }

    /// Start a `rule.load` span for `rule_id`
    pub fn start_load(&self, rule_id: &str) -> RuleLoadSpan {
        let span = self
            .tracer
            .span_builder(LOAD_SPAN)
            .with_kind(SpanKind::Internal)
            .with_attributes([
                KeyValue::new("rule.id", rule_id.to_string()),
                KeyValue::new("betrace.operation", "rule_load"),
            ])
            .start(self.tracer.as_ref());

        RuleLoadSpan {
            span,
            metrics: Arc::clone(&self.metrics),
            started: Instant::now(),
        }
    }
}

impl std::fmt::Debug for RuleTracer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RuleTracer").finish_non_exhaustive()
    }
}

/// An in-progress rule evaluation
pub struct RuleEvaluationSpan {
    span: BoxedSpan,
    rule_id: String,
    metrics: Arc<MetricsRecorder>,
    started: Instant,
}

impl RuleEvaluationSpan {
    /// End the evaluation, timed from when the span started
    pub fn finish(self, matched: bool) -> Duration {
        let elapsed = self.started.elapsed();
        self.finish_with_duration(matched, elapsed);
        elapsed
    }

    /// End the evaluation with a duration measured by the caller
    pub fn finish_with_duration(mut self, matched: bool, duration: Duration) {
        self.span.set_attributes([
            KeyValue::new("rule.matched", matched),
            KeyValue::new(
                "rule.evaluation_duration_ms",
                duration.as_micros() as f64 / 1000.0,
            ),
        ]);
        if matched {
            self.span.add_event(
                MATCHED_EVENT,
                vec![
                    KeyValue::new("rule.id", self.rule_id.clone()),
                    KeyValue::new("match.reason", "pattern_satisfied"),
                ],
            );
        }
        self.metrics.record_rule_evaluation(
            &self.rule_id,
            EvaluationResult::from(matched),
            duration.as_secs_f64(),
        );
        self.span.end();
    }
}

/// An in-progress rule load
pub struct RuleLoadSpan {
    span: BoxedSpan,
    metrics: Arc<MetricsRecorder>,
    started: Instant,
}

impl RuleLoadSpan {
    /// End the load with its result, timed from when the span started
    ///
    /// A failed load marks the span as errored and records the error on it.
    pub fn finish(mut self, result: std::result::Result<(), &dyn Error>) -> Duration {
        let elapsed = self.started.elapsed();
        let status = match result {
            Ok(()) => {
                self.span.set_status(Status::Ok);
                LoadStatus::Success
            }
            Err(err) => {
                self.span.set_status(Status::error(err.to_string()));
                self.span.record_error(err);
                LoadStatus::Error
            }
        };
        self.metrics.record_rule_load(status, elapsed.as_secs_f64());
        self.span.end();
        elapsed
    }
}
