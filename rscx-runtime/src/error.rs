//! Runtime error types.

use crate::config::ConfigError;
use crate::controller::SessionStatus;
use rscx_core::{CoreError, ExecutionError, SessionId};
use thiserror::Error;

/// Runtime errors.
#[derive(Debug, Error)]
pub enum RuntimeError {
    #[error("core error: {0}")]
    Core(#[from] CoreError),

    #[error("configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("session not found: {0}")]
    SessionNotFound(SessionId),

    #[error("chart not registered: {0}")]
    ChartNotFound(String),

    #[error("no processor for type '{event_type}' and target '{target}'")]
    NoProcessor { event_type: String, target: String },

    #[error("unknown target: {0}")]
    UnknownTarget(String),

    #[error("protocol violation: {0}")]
    Protocol(String),

    #[error("mailbox of session {0} is closed")]
    MailboxClosed(SessionId),

    #[error("session {0} already started")]
    AlreadyStarted(SessionId),

    #[error("session ended with status {status}: {reason}")]
    Terminated {
        status: SessionStatus,
        reason: String,
    },

    #[error("router has shut down")]
    RouterGone,
}

impl RuntimeError {
    /// Returns an error code suitable for reporting.
    pub fn error_code(&self) -> &'static str {
        match self {
            RuntimeError::Core(e) => e.error_code(),
            RuntimeError::Config(_) => "CONFIG",
            RuntimeError::SessionNotFound(_) => "SESSION_NOT_FOUND",
            RuntimeError::ChartNotFound(_) => "CHART_NOT_FOUND",
            RuntimeError::NoProcessor { .. } => "NO_PROCESSOR",
            RuntimeError::UnknownTarget(_) => "UNKNOWN_TARGET",
            RuntimeError::Protocol(_) => "PROTOCOL",
            RuntimeError::MailboxClosed(_) => "MAILBOX_CLOSED",
            RuntimeError::AlreadyStarted(_) => "ALREADY_STARTED",
            RuntimeError::Terminated { .. } => "TERMINATED",
            RuntimeError::RouterGone => "ROUTER_GONE",
        }
    }

    /// Returns whether this error is retryable.
    pub fn is_retryable(&self) -> bool {
        match self {
            RuntimeError::Core(e) => e.is_retryable(),
            _ => false,
        }
    }
}

/// Maps a routing failure onto the `error.*` event a session receives.
impl From<RuntimeError> for ExecutionError {
    fn from(err: RuntimeError) -> Self {
        match &err {
            RuntimeError::Core(CoreError::Platform(_)) => ExecutionError::platform(err.to_string()),
            _ => ExecutionError::communication(err.to_string()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rscx_core::ErrorType;

    #[test]
    fn test_error_codes() {
        assert_eq!(
            RuntimeError::UnknownTarget("#_x".into()).error_code(),
            "UNKNOWN_TARGET"
        );
        assert_eq!(
            RuntimeError::Core(CoreError::QueueClosed).error_code(),
            "QUEUE_CLOSED"
        );
        assert!(!RuntimeError::Protocol("bad".into()).is_retryable());
    }

    #[test]
    fn test_routing_failures_become_communication_errors() {
        let err: ExecutionError = RuntimeError::UnknownTarget("#_nowhere".into()).into();
        assert_eq!(err.kind, ErrorType::Communication);
        assert!(err.message.contains("#_nowhere"));
    }
}
