use thiserror::Error;

// ------------------------------------------------------------
// Error taxonomy
// ------------------------------------------------------------
//
// Queue and sink errors are caught per tracked key inside the
// aggregator cycle. Supervisor errors are caught per command.
// Everything else bubbles up as `anyhow::Error`.
//

/// Failures raised by a durable queue backend.
#[derive(Debug, Error)]
pub enum QueueError {
    /// Backend connection lost or refused. Retried on the next cycle.
    #[error("queue unavailable: {0}")]
    Unavailable(String),

    /// An entry came back in a shape we cannot decode.
    #[error("malformed queue entry: {0}")]
    Malformed(String),
}

impl From<redis::RedisError> for QueueError {
    fn from(e: redis::RedisError) -> Self {
        QueueError::Unavailable(e.to_string())
    }
}

/// Failures raised by a storage sink.
#[derive(Debug, Error)]
pub enum SinkError {
    /// Network or host-down class. Retried with backoff.
    #[error("transient write error: {0}")]
    Transient(String),

    /// Schema or validation class. Never retried.
    #[error("permanent write error: {0}")]
    Permanent(String),
}

impl SinkError {
    pub fn is_transient(&self) -> bool {
        matches!(self, SinkError::Transient(_))
    }
}

impl From<std::io::Error> for SinkError {
    fn from(e: std::io::Error) -> Self {
        SinkError::Transient(e.to_string())
    }
}

/// Failures raised while managing ingestion workers.
#[derive(Debug, Error)]
pub enum SupervisorError {
    /// Duplicate live handle or a source stuck in both start and stop.
    /// Self-healing: the redundant operation is skipped.
    #[error("inconsistent source state: {0}")]
    InconsistentSourceState(String),
}

/// Failures raised while loading or validating configuration.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("cannot read config {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("cannot parse config: {0}")]
    Parse(#[from] serde_json::Error),

    #[error("invalid config: {0}")]
    Invalid(String),
}
