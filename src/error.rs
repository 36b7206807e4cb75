use thiserror::Error;

use crate::device::DeviceError;

/// Failure reported to a caller for a single command.
///
/// Never raised across the worker boundary: every variant ends up either as
/// the `message` of a failed [`CommandOutcome`](crate::worker::CommandOutcome)
/// or as the immediate return value of `queue_command`.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum WorkerError {
    /// No live device session (never connected, or mid-reconnect).
    #[error("Device not connected")]
    NotConnected,

    /// Health gate refused a non-critical command. Retriable.
    #[error("Device unhealthy: {0}")]
    Unhealthy(String),

    /// Backpressure: the command queue was already full. Retriable.
    #[error("Queue busy ({capacity} commands pending)")]
    QueueFull { capacity: usize },

    /// The device did not answer within the command timeout.
    /// The session is dropped and the queue flushed.
    #[error("Timeout: {0}")]
    Timeout(String),

    /// Transport-level failure. The session is dropped and the queue flushed.
    #[error("Connection lost: {0}")]
    ConnectionLost(String),

    /// The command ran but the device answered with a logical error.
    #[error("Device rejected command: {0}")]
    DeviceRejected(String),

    /// The worker is stopping and no longer runs commands.
    #[error("Worker shutting down")]
    ShuttingDown,
}

impl WorkerError {
    /// Returns `true` if the caller may simply try again later.
    pub fn is_retriable(&self) -> bool {
        matches!(self, Self::Unhealthy(_) | Self::QueueFull { .. })
    }

    /// Returns `true` for errors that end the current device session.
    pub fn ends_session(&self) -> bool {
        matches!(self, Self::Timeout(_) | Self::ConnectionLost(_))
    }
}

impl From<DeviceError> for WorkerError {
    fn from(err: DeviceError) -> Self {
        match err {
            DeviceError::Timeout { .. } => WorkerError::Timeout(err.to_string()),
            DeviceError::NotConnected => {
                WorkerError::ConnectionLost("device reports not connected".to_string())
            }
            DeviceError::Transport(msg) => WorkerError::ConnectionLost(msg),
            DeviceError::Rejected(msg) => WorkerError::DeviceRejected(msg),
        }
    }
}

/// Configuration loading and validation failures.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("{0} environment variable is required")]
    MissingEnv(&'static str),

    #[error("Failed to read {path}: {source}")]
    Read {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to parse {path}: {source}")]
    Parse {
        path: String,
        #[source]
        source: serde_json::Error,
    },

    #[error("Invalid configuration: {0}")]
    Invalid(String),
}
