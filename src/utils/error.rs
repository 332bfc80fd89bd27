use thiserror::Error;

use crate::server::client::ClientError;
use crate::server::message::ServerMessage;
use crate::server::runner::CheckError;

/// Represents the errors that can occur while serving health-check sessions.
#[derive(Error, Debug)]
pub enum HealthCheckError {
    /// The inbound frame was not valid JSON.
    ///
    /// Non-fatal: the session keeps reading after reporting it.
    #[error("Invalid JSON")]
    InvalidJson,

    /// The inbound frame was JSON but not a well-formed check request.
    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    /// The requested domain failed validation (missing, blank, too long).
    #[error("{0}")]
    Validation(String),

    /// The client has used up its quota for the current window.
    ///
    /// Raised before any admission slot is taken or process spawned.
    #[error("Rate limit exceeded. Maximum {max_requests} checks per {window}. Please try again later.")]
    RateLimited {
        max_requests: usize,
        window: String,
        retry_after: Option<u64>,
    },

    /// The external check routine did not produce a usable result.
    #[error(transparent)]
    Check(#[from] CheckError),

    /// The admission gate was closed because the server is shutting down.
    #[error("Check service is shutting down")]
    Unavailable,

    /// The client went away while its request was queued or running.
    #[error("Client disconnected")]
    Disconnected,

    /// Represents a general connection error.
    #[error("Connection error: {0}")]
    ConnectionError(String),

    /// Represents an error in the server configuration.
    ///
    /// This occurs when an invalid or inconsistent configuration is detected.
    #[error("Configuration error: {0}")]
    ConfigurationError(String),

    /// Indicates a failure in serializing or deserializing data.
    #[error("Serialization error: {0}")]
    SerializationError(String),

    /// Represents an error related to the outbound side of a client connection.
    #[error("Client error: {0}")]
    ClientError(#[from] ClientError),

    /// Metric registration or encoding failed.
    #[error("Metrics error: {0}")]
    MetricsError(#[from] prometheus::Error),

    /// Unexpected failure caught at the session boundary.
    #[error("Internal error: {0}")]
    Internal(String),
}

impl HealthCheckError {
    /// Builds the error frame reported back to the originating client.
    pub fn to_reply(&self) -> ServerMessage {
        match self {
            HealthCheckError::RateLimited { retry_after, .. } => {
                ServerMessage::error(self.to_string()).with_retry_after(*retry_after)
            }
            HealthCheckError::Check(CheckError::Failed { stderr, .. }) => {
                ServerMessage::error(self.to_string()).with_stderr(stderr.clone())
            }
            HealthCheckError::Check(CheckError::MalformedOutput { output }) => {
                ServerMessage::error(self.to_string()).with_output(output.clone())
            }
            other => ServerMessage::error(other.to_string()),
        }
    }
}

/// Implements conversion from `serde_json::Error` to `HealthCheckError`.
impl From<serde_json::Error> for HealthCheckError {
    fn from(err: serde_json::Error) -> Self {
        HealthCheckError::SerializationError(err.to_string())
    }
}

impl From<config::ConfigError> for HealthCheckError {
    fn from(err: config::ConfigError) -> Self {
        HealthCheckError::ConfigurationError(err.to_string())
    }
}
