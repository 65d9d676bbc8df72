//! Interpreter logging boundary.

use crate::error::BoxError;
use crate::event::Event;
use crate::ident::SessionId;
use crate::options::InterpreterState;
use rscx_value::Value;

/// Identifies the session a log record belongs to.
#[derive(Debug, Clone)]
pub struct LogContext {
    pub session_id: SessionId,
    pub machine: Option<String>,
}

impl LogContext {
    pub fn machine_name(&self) -> &str {
        self.machine.as_deref().unwrap_or("-")
    }
}

/// A structured trace point emitted while interpreting.
#[derive(Debug)]
pub enum TraceRecord<'a> {
    ProcessingEvent(&'a Event),
    EnteringState(&'a str),
    EnteredState(&'a str),
    ExitingState(&'a str),
    ExitedState(&'a str),
    PerformingTransition {
        kind: &'a str,
        event: &'a str,
        target: &'a str,
    },
    PerformedTransition {
        kind: &'a str,
        event: &'a str,
        target: &'a str,
    },
    InterpreterState(InterpreterState),
}

/// Sink for interpreter traces, user `<log>` output and platform errors.
///
/// Trace hooks are only called when [`is_tracing_enabled`](Self::is_tracing_enabled)
/// returns true. A failing sink is reported to the machine as `error.platform`.
pub trait InterpreterLogger: Send + Sync {
    fn is_tracing_enabled(&self) -> bool {
        false
    }

    fn trace(&self, ctx: &LogContext, record: TraceRecord<'_>) -> Result<(), BoxError>;

    fn log(&self, ctx: &LogContext, label: Option<&str>, data: &Value) -> Result<(), BoxError>;

    fn error(&self, ctx: &LogContext, message: &str) -> Result<(), BoxError>;
}

/// Default logger writing through `tracing`.
#[derive(Debug, Clone, Default)]
pub struct TracingLogger {
    tracing_enabled: bool,
}

impl TracingLogger {
    pub fn new(tracing_enabled: bool) -> Self {
        Self { tracing_enabled }
    }
}

impl InterpreterLogger for TracingLogger {
    fn is_tracing_enabled(&self) -> bool {
        self.tracing_enabled
    }

    fn trace(&self, ctx: &LogContext, record: TraceRecord<'_>) -> Result<(), BoxError> {
        let session_id = ctx.session_id.as_str();
        let machine = ctx.machine_name();
        match record {
            TraceRecord::ProcessingEvent(event) => tracing::debug!(
                session_id,
                machine,
                "Processing {} event '{}'",
                event.event_type,
                event.name
            ),
            TraceRecord::EnteringState(id) => {
                tracing::trace!(session_id, machine, "Entering state '{}'", id)
            }
            TraceRecord::EnteredState(id) => {
                tracing::debug!(session_id, machine, "Entered state '{}'", id)
            }
            TraceRecord::ExitingState(id) => {
                tracing::trace!(session_id, machine, "Exiting state '{}'", id)
            }
            TraceRecord::ExitedState(id) => {
                tracing::debug!(session_id, machine, "Exited state '{}'", id)
            }
            TraceRecord::PerformingTransition {
                kind,
                event,
                target,
            } => tracing::trace!(
                session_id,
                machine,
                "Performing {} transition on '{}' to '{}'",
                kind,
                event,
                target
            ),
            TraceRecord::PerformedTransition {
                kind,
                event,
                target,
            } => tracing::debug!(
                session_id,
                machine,
                "Performed {} transition on '{}' to '{}'",
                kind,
                event,
                target
            ),
            TraceRecord::InterpreterState(state) => {
                tracing::debug!(session_id, machine, "Interpreter state: {:?}", state)
            }
        }
        Ok(())
    }

    fn log(&self, ctx: &LogContext, label: Option<&str>, data: &Value) -> Result<(), BoxError> {
        tracing::info!(
            session_id = ctx.session_id.as_str(),
            machine = ctx.machine_name(),
            "{}: {}",
            label.unwrap_or("log"),
            data
        );
        Ok(())
    }

    fn error(&self, ctx: &LogContext, message: &str) -> Result<(), BoxError> {
        tracing::warn!(
            session_id = ctx.session_id.as_str(),
            machine = ctx.machine_name(),
            "{}",
            message
        );
        Ok(())
    }
}
