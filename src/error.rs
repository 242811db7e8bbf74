//! Error taxonomy for the orchestration engine.
//!
//! Every failure the engine records falls into one of four kinds:
//! - `NotFound`: unknown pipeline, step, execution or primitive
//! - `BadRequest`: malformed command, missing field, invalid definition
//! - `Internal`: unexpected failure inside a handler (I/O, serialization)
//! - `PrimitiveFailure`: the step's own business failure

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Result type for engine operations.
pub type Result<T> = std::result::Result<T, OrchestratorError>;

/// Errors raised by handlers, the planner and primitives.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum OrchestratorError {
    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Bad request: {0}")]
    BadRequest(String),

    #[error("Internal error: {0}")]
    Internal(String),

    #[error("Primitive failure: {0}")]
    PrimitiveFailure(String),
}

impl OrchestratorError {
    pub fn not_found(message: impl Into<String>) -> Self {
        Self::NotFound(message.into())
    }

    pub fn bad_request(message: impl Into<String>) -> Self {
        Self::BadRequest(message.into())
    }

    pub fn internal(message: impl Into<String>) -> Self {
        Self::Internal(message.into())
    }

    pub fn primitive(message: impl Into<String>) -> Self {
        Self::PrimitiveFailure(message.into())
    }

    /// The classification of this error
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::NotFound(_) => ErrorKind::NotFound,
            Self::BadRequest(_) => ErrorKind::BadRequest,
            Self::Internal(_) => ErrorKind::Internal,
            Self::PrimitiveFailure(_) => ErrorKind::PrimitiveFailure,
        }
    }

    /// The message without the kind prefix
    pub fn message(&self) -> &str {
        match self {
            Self::NotFound(m) | Self::BadRequest(m) | Self::Internal(m) | Self::PrimitiveFailure(m) => m,
        }
    }
}

impl From<anyhow::Error> for OrchestratorError {
    fn from(err: anyhow::Error) -> Self {
        // {:#} keeps the whole context chain on one line
        Self::Internal(format!("{:#}", err))
    }
}

impl From<serde_json::Error> for OrchestratorError {
    fn from(err: serde_json::Error) -> Self {
        Self::Internal(format!("JSON error: {}", err))
    }
}

/// Serializable error classification carried in failure events
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    NotFound,
    BadRequest,
    Internal,
    PrimitiveFailure,
}

impl std::fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::NotFound => "not_found",
            Self::BadRequest => "bad_request",
            Self::Internal => "internal",
            Self::PrimitiveFailure => "primitive_failure",
        };
        f.write_str(s)
    }
}

/// Error details recorded on `pipeline_step_failed` and `pipeline_failed`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorInfo {
    /// Classification of the failure
    #[serde(rename = "error_kind")]
    pub kind: ErrorKind,

    /// Human-readable message, enough to diagnose without replaying
    #[serde(rename = "error_message")]
    pub message: String,
}

impl ErrorInfo {
    pub fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }
}

impl From<&OrchestratorError> for ErrorInfo {
    fn from(err: &OrchestratorError) -> Self {
        Self::new(err.kind(), err.message())
    }
}

impl From<OrchestratorError> for ErrorInfo {
    fn from(err: OrchestratorError) -> Self {
        Self::from(&err)
    }
}

impl std::fmt::Display for ErrorInfo {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{} ({})", self.message, self.kind)
    }
}
