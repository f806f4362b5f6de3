//! Error types for betrace-telemetry

use thiserror::Error;

/// Errors that can occur while building or driving the telemetry pipeline
///
/// None of these are raised on the evidence hot path. Queue-full drops and
/// per-event export failures are counted, not returned.
#[derive(Debug, Error)]
pub enum TelemetryError {
    /// Invalid configuration value
    #[error("Configuration error: {0}")]
    Config(String),

    /// The emitter consumer is already running
    #[error("Emitter already started")]
    AlreadyStarted,

    /// The emitter has been stopped and cannot be restarted
    #[error("Emitter stopped")]
    Stopped,

    /// A metric instrument could not be registered on a backend
    #[error("Failed to register metric '{metric}' on {backend}: {reason}")]
    Registration {
        backend: String,
        metric: String,
        reason: String,
    },

    /// A single evidence record failed to export
    #[error("Failed to export evidence {evidence_id}: {reason}")]
    Export {
        evidence_id: String,
        reason: String,
    },

    /// An OTLP exporter or provider could not be built or shut down
    #[error("Exporter error: {0}")]
    Exporter(String),

    /// Text exposition encoding failure
    #[error("Encoding error: {0}")]
    Encoding(String),

    /// Scrape server failure
    #[error("Server error: {0}")]
    Server(String),

    /// Serialization/deserialization failure
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// I/O failure
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Result type alias for telemetry operations
pub type Result<T> = std::result::Result<T, TelemetryError>;
