//! Child-to-parent communication for invoked sessions.

use crate::error::RuntimeError;
use rscx_core::{Event, InvokeId, OutgoingEvent, SessionId};

/// Target naming the session that invoked the sender.
pub const PARENT_TARGET: &str = "#_parent";

/// Ties an invoked session to the invocation that created it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParentLink {
    pub session_id: SessionId,
    pub invoke_id: InvokeId,
    pub unique_id: String,
}

impl ParentLink {
    /// The origin parents see on events from this child.
    pub fn origin(&self) -> String {
        format!("#_{}", self.invoke_id)
    }

    /// Wraps a child's event for delivery to the parent.
    pub fn to_parent_event(&self, event: OutgoingEvent, origin_type: &str) -> Event {
        Event::external(event.name)
            .with_data(event.data)
            .with_origin(self.origin(), origin_type)
            .with_invoke(self.invoke_id.clone(), self.unique_id.clone())
    }
}

/// Rejects events a child may not send to its parent.
///
/// Events to the parent are immediate and untyped, and cannot be cancelled.
pub fn validate_to_parent(event: &OutgoingEvent) -> Result<(), RuntimeError> {
    if let Some(ty) = &event.event_type {
        return Err(RuntimeError::Protocol(format!(
            "event '{}' to parent must not set type (got '{}')",
            event.name, ty
        )));
    }
    if let Some(id) = &event.send_id {
        return Err(RuntimeError::Protocol(format!(
            "event '{}' to parent must not set a send id (got '{}')",
            event.name, id
        )));
    }
    if !event.delay.is_zero() {
        return Err(RuntimeError::Protocol(format!(
            "event '{}' to parent must not be delayed",
            event.name
        )));
    }
    match event.target.as_deref() {
        None | Some("") | Some(PARENT_TARGET) => Ok(()),
        Some(other) => Err(RuntimeError::Protocol(format!(
            "event '{}' to parent has target '{}'",
            event.name, other
        ))),
    }
}
