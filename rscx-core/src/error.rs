//! Core error types.
//!
//! [`CoreError`] is the fatal channel: it terminates a run. Failures inside
//! executable content are reported as [`ExecutionError`] and turned into
//! internal `error.*` events instead.

use crate::ident::{SendId, SessionId};
use rscx_value::ValueError;
use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

/// Boxed error returned by pluggable collaborators.
pub type BoxError = Box<dyn std::error::Error + Send + Sync + 'static>;

/// Fatal errors from the interpreter and its model.
#[derive(Debug, Error)]
pub enum CoreError {
    #[error("infrastructure error: {reason}")]
    Infrastructure { reason: String },

    #[error("live-lock detected: more than {limit} microsteps without reaching stability")]
    LiveLock { limit: usize },

    #[error("event queue closed")]
    QueueClosed,

    #[error("session destroyed")]
    Destroyed,

    #[error("processor error: {reason}")]
    Processor { reason: String },

    #[error(transparent)]
    Platform(#[from] PlatformError),

    #[error("invalid chart definition: {reason}")]
    InvalidDefinition { reason: String },

    #[error("invalid expression: {reason}")]
    InvalidExpression { reason: String },

    #[error("invalid identifier: '{value}'")]
    InvalidIdentifier { value: String },

    #[error("storage error: {reason}")]
    Storage { reason: String },

    #[error("value error: {0}")]
    Value(#[from] ValueError),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl CoreError {
    /// Returns true for errors raised by a caller violating an interface contract.
    pub fn is_protocol_error(&self) -> bool {
        matches!(
            self,
            CoreError::Processor { .. }
                | CoreError::InvalidDefinition { .. }
                | CoreError::InvalidExpression { .. }
                | CoreError::InvalidIdentifier { .. }
        )
    }

    /// Returns whether the operation can be retried.
    pub fn is_retryable(&self) -> bool {
        matches!(self, CoreError::Storage { .. } | CoreError::Io(_))
    }

    /// Returns an error code suitable for reporting.
    pub fn error_code(&self) -> &'static str {
        match self {
            CoreError::Infrastructure { .. } => "INFRASTRUCTURE",
            CoreError::LiveLock { .. } => "LIVE_LOCK",
            CoreError::QueueClosed => "QUEUE_CLOSED",
            CoreError::Destroyed => "DESTROYED",
            CoreError::Processor { .. } => "PROCESSOR",
            CoreError::Platform(_) => "PLATFORM",
            CoreError::InvalidDefinition { .. } => "BAD_DEFINITION",
            CoreError::InvalidExpression { .. } => "BAD_EXPRESSION",
            CoreError::InvalidIdentifier { .. } => "BAD_IDENTIFIER",
            CoreError::Storage { .. } => "STORAGE",
            CoreError::Value(e) => e.error_code(),
            CoreError::Json(_) => "BAD_JSON",
            CoreError::Io(_) => "IO_ERROR",
        }
    }

    pub(crate) fn infrastructure(reason: impl Into<String>) -> Self {
        CoreError::Infrastructure {
            reason: reason.into(),
        }
    }

    pub(crate) fn definition(reason: impl Into<String>) -> Self {
        CoreError::InvalidDefinition {
            reason: reason.into(),
        }
    }
}

/// A collaborator failure tagged with the session it was serving.
#[derive(Debug, Error)]
#[error("platform error in session {session_id}: {source}")]
pub struct PlatformError {
    pub session_id: SessionId,
    #[source]
    pub source: BoxError,
}

impl PlatformError {
    pub fn new(session_id: SessionId, source: impl Into<BoxError>) -> Self {
        Self {
            session_id,
            source: source.into(),
        }
    }
}

/// Kind of recoverable error; selects the `error.*` event that is raised.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorType {
    Execution,
    Communication,
    Platform,
}

impl fmt::Display for ErrorType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ErrorType::Execution => write!(f, "execution"),
            ErrorType::Communication => write!(f, "communication"),
            ErrorType::Platform => write!(f, "platform"),
        }
    }
}

/// A recoverable failure inside executable content or a collaborator call.
#[derive(Debug, Clone, PartialEq, Error)]
#[error("{kind} error: {message}")]
pub struct ExecutionError {
    pub kind: ErrorType,
    pub message: String,
    pub send_id: Option<SendId>,
}

impl ExecutionError {
    pub fn execution(message: impl Into<String>) -> Self {
        Self {
            kind: ErrorType::Execution,
            message: message.into(),
            send_id: None,
        }
    }

    pub fn communication(message: impl Into<String>) -> Self {
        Self {
            kind: ErrorType::Communication,
            message: message.into(),
            send_id: None,
        }
    }

    pub fn platform(message: impl Into<String>) -> Self {
        Self {
            kind: ErrorType::Platform,
            message: message.into(),
            send_id: None,
        }
    }

    pub fn with_send_id(mut self, send_id: Option<SendId>) -> Self {
        self.send_id = send_id;
        self
    }
}

impl From<ValueError> for ExecutionError {
    fn from(e: ValueError) -> Self {
        ExecutionError::execution(e.to_string())
    }
}

impl From<CoreError> for ExecutionError {
    fn from(e: CoreError) -> Self {
        match e {
            CoreError::Platform(p) => ExecutionError::platform(p.to_string()),
            other => ExecutionError::execution(other.to_string()),
        }
    }
}

impl From<PlatformError> for ExecutionError {
    fn from(e: PlatformError) -> Self {
        ExecutionError::platform(e.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_codes() {
        assert_eq!(CoreError::LiveLock { limit: 5 }.error_code(), "LIVE_LOCK");
        assert_eq!(
            CoreError::Value(ValueError::ObjectCannotBeModified).error_code(),
            "OBJECT_CANNOT_BE_MODIFIED"
        );
        assert!(CoreError::Processor {
            reason: "bad".into()
        }
        .is_protocol_error());
        assert!(!CoreError::QueueClosed.is_protocol_error());
    }

    #[test]
    fn test_platform_error_carries_session() {
        let err = PlatformError::new(SessionId::new("s-1"), "sink offline");
        assert_eq!(err.to_string(), "platform error in session s-1: sink offline");

        let exec: ExecutionError = err.into();
        assert_eq!(exec.kind, ErrorType::Platform);
    }
}
