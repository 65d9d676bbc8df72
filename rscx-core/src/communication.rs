//! Outbound side effects of a session.
//!
//! The interpreter never talks to other sessions directly. Sends, cancels and
//! invoke lifecycle calls go through [`ExternalCommunication`], which the runtime
//! implements on top of its dispatch router.

use crate::error::ExecutionError;
use crate::event::{Event, OutgoingEvent};
use crate::ident::{InvokeId, SendId};
use crate::model::DocumentId;
use async_trait::async_trait;
use rscx_value::Value;

/// Everything needed to start an invoked service.
#[derive(Debug, Clone)]
pub struct InvokeData {
    pub invoke_id: InvokeId,
    pub unique_id: String,
    pub invoke_type: Option<String>,
    pub source: Option<String>,
    pub content: Value,
    pub parameters: Value,
    pub document_id: DocumentId,
}

/// Collaborator handling a session's outbound traffic.
#[async_trait]
pub trait ExternalCommunication: Send + Sync {
    /// Delivers or schedules an event. Failures become `error.communication`.
    async fn send_event(&self, event: OutgoingEvent) -> Result<(), ExecutionError>;

    async fn cancel_event(&self, send_id: &SendId) -> Result<(), ExecutionError>;

    async fn start_invoke(&self, data: InvokeData) -> Result<(), ExecutionError>;

    async fn cancel_invoke(&self, invoke_id: &InvokeId) -> Result<(), ExecutionError>;

    async fn forward_event(&self, invoke_id: &InvokeId, event: Event) -> Result<(), ExecutionError>;
}

/// Rejects every external send. Used when a session has no router.
#[derive(Debug, Default, Clone)]
pub struct NullCommunication;

#[async_trait]
impl ExternalCommunication for NullCommunication {
    async fn send_event(&self, event: OutgoingEvent) -> Result<(), ExecutionError> {
        Err(ExecutionError::communication(format!(
            "no route for event '{}'",
            event.name
        ))
        .with_send_id(event.send_id))
    }

    async fn cancel_event(&self, _send_id: &SendId) -> Result<(), ExecutionError> {
        Ok(())
    }

    async fn start_invoke(&self, data: InvokeData) -> Result<(), ExecutionError> {
        Err(ExecutionError::communication(format!(
            "cannot start invoke '{}' without a router",
            data.invoke_id
        )))
    }

    async fn cancel_invoke(&self, _invoke_id: &InvokeId) -> Result<(), ExecutionError> {
        Ok(())
    }

    async fn forward_event(&self, invoke_id: &InvokeId, _event: Event) -> Result<(), ExecutionError> {
        Err(ExecutionError::communication(format!(
            "cannot forward to '{}' without a router",
            invoke_id
        )))
    }
}
