use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::server::middleware::validation::validate_size;
use crate::utils::error::HealthCheckError;

/// A check request sent by the client.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct CheckRequest {
    /// Domain to check. Missing is treated like blank and rejected by validation.
    #[serde(default)]
    pub domain: String,
}

impl CheckRequest {
    /// Parses one inbound text frame.
    ///
    /// # Errors
    /// * `InvalidRequest` if the frame exceeds `max_size` bytes or is JSON of the wrong shape.
    /// * `InvalidJson` if the frame is not JSON at all.
    pub fn parse(text: &str, max_size: usize) -> Result<Self, HealthCheckError> {
        validate_size(text, max_size)?;

        let value: Value = serde_json::from_str(text).map_err(|_| HealthCheckError::InvalidJson)?;
        serde_json::from_value(value).map_err(|e| HealthCheckError::InvalidRequest(e.to_string()))
    }
}

/// Stage reported by a progress event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ProgressStep {
    /// Waiting for a free slot on the admission gate.
    Queued,
    /// The check routine is being started.
    Starting,
}

/// Events emitted while a check cycle is in progress or has completed.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum CheckEvent {
    Progress { step: ProgressStep, message: String },
    Complete { data: Value },
}

/// Error frame. Optional diagnostics are only serialized when present.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ErrorReply {
    pub error: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub stderr: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub output: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub retry_after: Option<u64>,
}

/// Represents messages that the server sends to the client.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(untagged)]
pub enum ServerMessage {
    Event(CheckEvent),
    Error(ErrorReply),
}

impl ServerMessage {
    pub fn queued() -> Self {
        Self::progress(ProgressStep::Queued, "Waiting for a free check slot...")
    }

    pub fn starting() -> Self {
        Self::progress(ProgressStep::Starting, "Starting mail server health check...")
    }

    pub fn progress(step: ProgressStep, message: impl Into<String>) -> Self {
        ServerMessage::Event(CheckEvent::Progress {
            step,
            message: message.into(),
        })
    }

    pub fn complete(data: Value) -> Self {
        ServerMessage::Event(CheckEvent::Complete { data })
    }

    pub fn error(error: impl Into<String>) -> Self {
        ServerMessage::Error(ErrorReply {
            error: error.into(),
            stderr: None,
            output: None,
            retry_after: None,
        })
    }

    pub fn with_stderr(self, stderr: String) -> Self {
        self.map_error(|reply| reply.stderr = Some(stderr))
    }

    pub fn with_output(self, output: String) -> Self {
        self.map_error(|reply| reply.output = Some(output))
    }

    pub fn with_retry_after(self, retry_after: Option<u64>) -> Self {
        self.map_error(|reply| reply.retry_after = retry_after)
    }

    pub fn is_error(&self) -> bool {
        matches!(self, ServerMessage::Error(_))
    }

    pub fn to_json(&self) -> Result<String, HealthCheckError> {
        Ok(serde_json::to_string(self)?)
    }

    fn map_error(mut self, f: impl FnOnce(&mut ErrorReply)) -> Self {
        if let ServerMessage::Error(reply) = &mut self {
            f(reply);
        }
        self
    }
}
