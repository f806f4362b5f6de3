//! Asynchronous evidence emitter
//!
//! Callers enqueue evidence without blocking; a single consumer task exports
//! it in FIFO order. The queue is bounded: when it is full new evidence is
//! dropped and counted, never waited on. On stop the consumer drains what is
//! queued within a fixed budget and reports whatever it had to abandon.
//!
//! ```text
//! enqueue ──try_send──▶ [bounded queue] ──recv──▶ consumer ──▶ EvidenceExporter
//!    │                                              │
//!    └── queue_full / shutdown drops                └── exported / export_failed
//! ```

use crate::config::EmitterConfig;
use crate::error::{Result, TelemetryError};
use crate::evidence::{Details, EvidenceEvent};
use crate::export::EvidenceExporter;
use crate::metrics::{DropReason, MetricsRecorder};
use crate::taxonomy::ComplianceControl;
use futures::future::BoxFuture;
use futures::FutureExt;
use serde::Serialize;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicU64, AtomicU8, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use tokio::sync::mpsc::{self, error::TrySendError};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

/// Log a queue-full warning on the first drop and then every this many
const QUEUE_FULL_LOG_EVERY: u64 = 1000;

/// Result of a non-blocking enqueue
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EnqueueOutcome {
    Accepted,
    Dropped(DropReason),
}

impl EnqueueOutcome {
    pub fn is_accepted(&self) -> bool {
        matches!(self, EnqueueOutcome::Accepted)
    }
}

/// Emitter lifecycle
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum EmitterState {
    /// Accepting evidence, consumer not yet started
    Created,
    Running,
    /// Stop requested, consumer draining
    Draining,
    Stopped,
}

impl EmitterState {
    fn from_u8(v: u8) -> Self {
        match v {
            0 => EmitterState::Created,
            1 => EmitterState::Running,
            2 => EmitterState::Draining,
            _ => EmitterState::Stopped,
        }
    }

    fn as_u8(self) -> u8 {
        match self {
            EmitterState::Created => 0,
            EmitterState::Running => 1,
            EmitterState::Draining => 2,
            EmitterState::Stopped => 3,
        }
    }
}

/// Running counters, updated lock-free
#[derive(Debug, Default)]
struct EmitterStats {
    enqueued: AtomicU64,
    exported: AtomicU64,
    export_failures: AtomicU64,
    dropped_queue_full: AtomicU64,
    dropped_shutdown: AtomicU64,
    dropped_unknown_control: AtomicU64,
    /// Producers between their state check and the end of `try_send`
    sending: AtomicUsize,
}

/// Marks one producer as inside `enqueue_event`
struct SendGuard<'a>(&'a AtomicUsize);

impl Drop for SendGuard<'_> {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

impl EmitterStats {
    fn begin_send(&self) -> SendGuard<'_> {
        self.sending.fetch_add(1, Ordering::SeqCst);
        SendGuard(&self.sending)
    }

    /// Wait until no producer can still push into a closed queue
    ///
    /// Producers entering after the state left `Running` drop without
    /// touching the queue, so this only waits out `try_send` calls already
    /// in progress.
    async fn senders_settled(&self) {
        while self.sending.load(Ordering::SeqCst) > 0 {
            tokio::task::yield_now().await;
        }
    }

    /// Count `n` drops for `reason`, returning the new total for that reason
    fn record_drop(&self, reason: DropReason, n: u64) -> u64 {
        let counter = match reason {
            DropReason::QueueFull => &self.dropped_queue_full,
            DropReason::Shutdown => &self.dropped_shutdown,
            DropReason::ExportFailed => &self.export_failures,
            DropReason::UnknownControl => &self.dropped_unknown_control,
        };
        counter.fetch_add(n, Ordering::Relaxed) + n
    }

    fn exported(&self) -> u64 {
        self.exported.load(Ordering::Relaxed)
    }

    fn export_failures(&self) -> u64 {
        self.export_failures.load(Ordering::Relaxed)
    }
}

/// Point-in-time view of the emitter
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StatsSnapshot {
    pub state: EmitterState,
    pub queue_depth: usize,
    pub queue_capacity: usize,
    pub enqueued: u64,
    pub exported: u64,
    pub export_failures: u64,
    pub dropped_queue_full: u64,
    pub dropped_shutdown: u64,
    pub dropped_unknown_control: u64,
}

/// Outcome of stopping the emitter
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DrainReport {
    /// Evidence exported after stop was requested
    pub exported: u64,

    /// Export failures after stop was requested
    pub failed: u64,

    /// Evidence abandoned (in flight or still queued)
    pub dropped: u64,

    /// Whether the drain budget ran out
    pub timed_out: bool,

    #[serde(rename = "elapsedMs", serialize_with = "serialize_millis")]
    pub elapsed: Duration,
}

fn serialize_millis<S: serde::Serializer>(d: &Duration, s: S) -> std::result::Result<S::Ok, S::Error> {
    s.serialize_u64(d.as_millis() as u64)
}

#[derive(Default)]
struct Lifecycle {
    receiver: Option<mpsc::Receiver<EvidenceEvent>>,
    consumer: Option<JoinHandle<DrainReport>>,
}

/// Bounded, non-blocking evidence queue with a single exporting consumer
pub struct AsyncEmitter {
    config: EmitterConfig,
    sender: mpsc::Sender<EvidenceEvent>,
    lifecycle: Mutex<Lifecycle>,
    stop_lock: tokio::sync::Mutex<()>,
    shutdown: CancellationToken,
    state: AtomicU8,
    context: ExportContext,
}

impl AsyncEmitter {
    /// Create an emitter in the `Created` state
    ///
    /// Evidence can be enqueued right away and is held until `start`.
    pub fn new(
        config: EmitterConfig,
        exporter: Arc<dyn EvidenceExporter>,
        metrics: Arc<MetricsRecorder>,
    ) -> Result<Self> {
        config.validate()?;
        let (sender, receiver) = mpsc::channel(config.queue_capacity);
        Ok(Self {
            config,
            sender,
            lifecycle: Mutex::new(Lifecycle {
                receiver: Some(receiver),
                consumer: None,
            }),
            stop_lock: tokio::sync::Mutex::new(()),
            shutdown: CancellationToken::new(),
            state: AtomicU8::new(EmitterState::Created.as_u8()),
            context: ExportContext {
                exporter,
                metrics,
                stats: Arc::new(EmitterStats::default()),
            },
        })
    }

    /// Spawn the consumer task
    ///
    /// Must be called from within a Tokio runtime.
    pub fn start(&self) -> Result<()> {
        let mut lifecycle = self.lifecycle.lock().unwrap_or_else(PoisonError::into_inner);
        match self.state() {
            EmitterState::Created => {}
            EmitterState::Running => return Err(TelemetryError::AlreadyStarted),
            EmitterState::Draining | EmitterState::Stopped => return Err(TelemetryError::Stopped),
        }
        let runtime = tokio::runtime::Handle::try_current()
            .map_err(|e| TelemetryError::Config(format!("Emitter requires a Tokio runtime: {}", e)))?;
        let receiver = lifecycle.receiver.take().ok_or(TelemetryError::Stopped)?;

        let consumer = Consumer {
            receiver,
            shutdown: self.shutdown.clone(),
            context: self.context.clone(),
            drain_timeout: self.config.drain_timeout(),
        };
        lifecycle.consumer = Some(runtime.spawn(consumer.run()));
        self.set_state(EmitterState::Running);

        tracing::info!(
            exporter = self.context.exporter.name(),
            queue_capacity = self.config.queue_capacity,
            drain_timeout_ms = self.config.drain_timeout_ms,
            "Compliance evidence emitter started"
        );
        Ok(())
    }

    /// Enqueue a prepared event without blocking
    pub fn enqueue_event(&self, event: EvidenceEvent) -> EnqueueOutcome {
        let _sending = self.context.stats.begin_send();
        if matches!(self.state(), EmitterState::Draining | EmitterState::Stopped) {
            return self.drop_event(&event, DropReason::Shutdown);
        }

        match self.sender.try_send(event) {
            Ok(()) => {
                self.context.stats.enqueued.fetch_add(1, Ordering::Relaxed);
                EnqueueOutcome::Accepted
            }
            Err(TrySendError::Full(event)) => self.drop_event(&event, DropReason::QueueFull),
            Err(TrySendError::Closed(event)) => self.drop_event(&event, DropReason::Shutdown),
        }
    }

    /// Build and enqueue evidence for a control
    pub fn enqueue(&self, control: ComplianceControl, outcome: &str, details: Details) -> EnqueueOutcome {
        self.enqueue_event(EvidenceEvent::new(control, outcome, details))
    }

    /// Count a drop that happened before evidence reached the queue
    pub fn reject(&self, control: &ComplianceControl, reason: DropReason) -> EnqueueOutcome {
        self.context.stats.record_drop(reason, 1);
        self.context.metrics.record_evidence_dropped(reason, 1);
        tracing::warn!(control = %control, reason = %reason, "Compliance evidence rejected");
        EnqueueOutcome::Dropped(reason)
    }

    fn drop_event(&self, event: &EvidenceEvent, reason: DropReason) -> EnqueueOutcome {
        let total = self.context.stats.record_drop(reason, 1);
        self.context.metrics.record_evidence_dropped(reason, 1);

        match reason {
            DropReason::QueueFull if total == 1 || total % QUEUE_FULL_LOG_EVERY == 0 => {
                tracing::warn!(
                    evidence_id = %event.evidence_id,
                    control = %event.control,
                    capacity = self.config.queue_capacity,
                    total_dropped = total,
                    "Compliance evidence queue full, dropping evidence"
                );
            }
            DropReason::QueueFull => {}
            _ => {
                tracing::debug!(
                    evidence_id = %event.evidence_id,
                    reason = %reason,
                    "Compliance evidence dropped"
                );
            }
        }
        EnqueueOutcome::Dropped(reason)
    }

    /// Stop the consumer, draining the queue within the configured budget
    ///
    /// Returns `None` if the emitter was already stopped. Concurrent callers
    /// wait for the first stop to finish.
    pub async fn stop(&self) -> Option<DrainReport> {
        let _guard = self.stop_lock.lock().await;
        let (consumer, receiver) = {
            let mut lifecycle = self.lifecycle.lock().unwrap_or_else(PoisonError::into_inner);
            (lifecycle.consumer.take(), lifecycle.receiver.take())
        };
        if consumer.is_none() && receiver.is_none() {
            return None;
        }

        self.set_state(EmitterState::Draining);
        self.shutdown.cancel();

        let report = if let Some(handle) = consumer {
            handle.await.unwrap_or_else(|e| {
                tracing::error!(error = %e, "Evidence consumer task failed");
                DrainReport::default()
            })
        } else if let Some(mut receiver) = receiver {
            // Never started: everything still queued is lost
            receiver.close();
            self.context.stats.senders_settled().await;
            let mut dropped = 0;
            while receiver.try_recv().is_ok() {
                dropped += 1;
            }
            self.context.record_shutdown_drops(dropped);
            DrainReport {
                dropped,
                ..DrainReport::default()
            }
        } else {
            DrainReport::default()
        };

        self.set_state(EmitterState::Stopped);
        tracing::info!(
            exported = report.exported,
            failed = report.failed,
            dropped = report.dropped,
            timed_out = report.timed_out,
            elapsed_ms = report.elapsed.as_millis() as u64,
            "Compliance evidence emitter stopped"
        );
        Some(report)
    }

    pub fn state(&self) -> EmitterState {
        EmitterState::from_u8(self.state.load(Ordering::SeqCst))
    }

    fn set_state(&self, state: EmitterState) {
        self.state.store(state.as_u8(), Ordering::SeqCst);
    }

    /// Items currently waiting in the queue
    pub fn queue_depth(&self) -> usize {
        self.sender.max_capacity() - self.sender.capacity()
    }

    pub fn queue_capacity(&self) -> usize {
        self.config.queue_capacity
    }

    pub fn stats(&self) -> StatsSnapshot {
        let stats = &self.context.stats;
        StatsSnapshot {
            state: self.state(),
            queue_depth: self.queue_depth(),
            queue_capacity: self.config.queue_capacity,
            enqueued: stats.enqueued.load(Ordering::Relaxed),
            exported: stats.exported.load(Ordering::Relaxed),
            export_failures: stats.export_failures.load(Ordering::Relaxed),
            dropped_queue_full: stats.dropped_queue_full.load(Ordering::Relaxed),
            dropped_shutdown: stats.dropped_shutdown.load(Ordering::Relaxed),
            dropped_unknown_control: stats.dropped_unknown_control.load(Ordering::Relaxed),
        }
    }
}

impl std::fmt::Debug for AsyncEmitter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AsyncEmitter")
            .field("state", &self.state())
            .field("queue_depth", &self.queue_depth())
            .field("queue_capacity", &self.config.queue_capacity)
            .finish()
    }
}

/// Everything an export needs, shareable with the consumer task
#[derive(Clone)]
struct ExportContext {
    exporter: Arc<dyn EvidenceExporter>,
    metrics: Arc<MetricsRecorder>,
    stats: Arc<EmitterStats>,
}

impl ExportContext {
    /// Export one event, isolating errors and panics to that event
    fn export(&self, event: EvidenceEvent) -> BoxFuture<'static, ()> {
        let ctx = self.clone();
        async move {
            let evidence = event.to_evidence();
            let result = AssertUnwindSafe(ctx.exporter.export(&event, &evidence))
                .catch_unwind()
                .await;

            let failure = match result {
                Ok(Ok(())) => None,
                Ok(Err(e)) => Some(e.to_string()),
                Err(panic) => Some(panic_message(panic.as_ref())),
            };

            match failure {
                None => {
                    ctx.stats.exported.fetch_add(1, Ordering::Relaxed);
                    ctx.metrics.record_compliance_span(&event.control, &event.outcome);
                    ctx.metrics
                        .record_evidence_size(event.control.framework(), evidence.size_estimate);
                }
                Some(reason) => {
                    let err = TelemetryError::Export {
                        evidence_id: event.evidence_id.clone(),
                        reason,
                    };
                    tracing::warn!(
                        exporter = ctx.exporter.name(),
                        control = %event.control,
                        error = %err,
                        "Compliance evidence export failed"
                    );
                    ctx.stats.record_drop(DropReason::ExportFailed, 1);
                    ctx.metrics.record_evidence_dropped(DropReason::ExportFailed, 1);
                }
            }
        }
        .boxed()
    }

    fn record_shutdown_drops(&self, dropped: u64) {
        if dropped == 0 {
            return;
        }
        self.stats.record_drop(DropReason::Shutdown, dropped);
        self.metrics.record_evidence_dropped(DropReason::Shutdown, dropped);
        tracing::warn!(dropped, "Compliance evidence dropped on shutdown");
    }
}

fn panic_message(panic: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        format!("exporter panicked: {}", s)
    } else if let Some(s) = panic.downcast_ref::<String>() {
        format!("exporter panicked: {}", s)
    } else {
        "exporter panicked".to_string()
    }
}

struct Consumer {
    receiver: mpsc::Receiver<EvidenceEvent>,
    shutdown: CancellationToken,
    context: ExportContext,
    drain_timeout: Duration,
}

impl Consumer {
    async fn run(mut self) -> DrainReport {
        let mut in_flight = None;

        loop {
            let next = tokio::select! {
                biased;
                _ = self.shutdown.cancelled() => None,
                next = self.receiver.recv() => next,
            };
            let Some(event) = next else { break };

            let mut export = self.context.export(event);
            let finished = tokio::select! {
                biased;
                () = &mut export => true,
                _ = self.shutdown.cancelled() => false,
            };
            if !finished {
                in_flight = Some(export);
                break;
            }
        }

        self.drain(in_flight).await
    }

    /// Export what is queued until the budget runs out
    async fn drain(self, in_flight: Option<BoxFuture<'static, ()>>) -> DrainReport {
        let Consumer {
            mut receiver,
            context,
            drain_timeout,
            ..
        } = self;

        let started = Instant::now();
        let exported_before = context.stats.exported();
        let failed_before = context.stats.export_failures();
        receiver.close();

        let mut in_progress = in_flight.is_some();
        let finished = tokio::time::timeout_at(started + drain_timeout, async {
            if let Some(export) = in_flight {
                export.await;
            }
            in_progress = false;
            while let Some(event) = receiver.recv().await {
                in_progress = true;
                context.export(event).await;
                in_progress = false;
            }
        })
        .await
        .is_ok();

        let mut dropped = u64::from(in_progress);
        context.stats.senders_settled().await;
        while receiver.try_recv().is_ok() {
            dropped += 1;
        }
        context.record_shutdown_drops(dropped);

        if !finished {
            tracing::warn!(
                drain_timeout_ms = drain_timeout.as_millis() as u64,
                dropped,
                "Drain budget exhausted"
            );
        }

        DrainReport {
            exported: context.stats.exported() - exported_before,
            failed: context.stats.export_failures() - failed_before,
            dropped,
            timed_out: !finished,
            elapsed: started.elapsed(),
        }
    }
}
