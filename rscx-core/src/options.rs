//! Interpreter options, exit statuses and state notifications.

use crate::communication::{ExternalCommunication, NullCommunication};
use crate::event::Event;
use crate::ident::SessionId;
use crate::logger::{InterpreterLogger, TracingLogger};
use crate::persistence::StorageProvider;
use async_trait::async_trait;
use rscx_value::Object;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

/// Default bound on consecutive microsteps within one macrostep.
pub const DEFAULT_MAX_MICROSTEPS: usize = 1000;

/// How a run ended without a fatal error.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExitStatus {
    /// A top-level final state was reached.
    Completed,
    /// The idle-suspend signal fired; a snapshot can be taken.
    Suspended,
    /// The destroy signal fired.
    Destroyed,
    /// The event source closed while the machine was waiting.
    QueueClosed,
}

/// Lifecycle points reported to a [`StateChangeObserver`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InterpreterState {
    /// The first stable configuration has been reached.
    Accepted,
    Started,
    /// Stable and waiting for the next external event.
    Waiting,
    Exited,
    Completed,
    Destroyed,
    Suspended,
    QueueClosed,
    LiveLockAbort,
}

impl fmt::Display for InterpreterState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

/// Told about every [`InterpreterState`] change.
pub trait StateChangeObserver: Send + Sync {
    fn on_state_changed(&self, state: InterpreterState);
}

/// Where a running interpreter takes external events from.
#[async_trait]
pub trait EventSource: Send {
    /// Returns `None` once the source is closed.
    async fn next_event(&mut self) -> Option<Event>;
}

#[async_trait]
impl EventSource for mpsc::UnboundedReceiver<Event> {
    async fn next_event(&mut self) -> Option<Event> {
        self.recv().await
    }
}

/// Per-run knobs and collaborators.
#[derive(Clone)]
pub struct InterpreterOptions {
    pub session_id: SessionId,
    pub max_microsteps: usize,
    /// Hard stop.
    pub destroy_token: CancellationToken,
    /// Soft stop; the run can be resumed from a snapshot.
    pub suspend_token: CancellationToken,
    pub logger: Arc<dyn InterpreterLogger>,
    pub communication: Arc<dyn ExternalCommunication>,
    pub storage: Option<Arc<dyn StorageProvider>>,
    pub notifier: Option<Arc<dyn StateChangeObserver>>,
    /// Values that override `<data>` declarations with the same id.
    pub arguments: Option<Object>,
}

impl Default for InterpreterOptions {
    fn default() -> Self {
        Self {
            session_id: SessionId::generate(),
            max_microsteps: DEFAULT_MAX_MICROSTEPS,
            destroy_token: CancellationToken::new(),
            suspend_token: CancellationToken::new(),
            logger: Arc::new(TracingLogger::default()),
            communication: Arc::new(NullCommunication),
            storage: None,
            notifier: None,
            arguments: None,
        }
    }
}

impl InterpreterOptions {
    pub fn new(session_id: SessionId) -> Self {
        Self {
            session_id,
            ..Self::default()
        }
    }

    pub fn with_max_microsteps(mut self, max: usize) -> Self {
        self.max_microsteps = max;
        self
    }

    pub fn with_logger(mut self, logger: Arc<dyn InterpreterLogger>) -> Self {
        self.logger = logger;
        self
    }

    pub fn with_communication(mut self, communication: Arc<dyn ExternalCommunication>) -> Self {
        self.communication = communication;
        self
    }

    pub fn with_storage(mut self, storage: Arc<dyn StorageProvider>) -> Self {
        self.storage = Some(storage);
        self
    }

    pub fn with_notifier(mut self, notifier: Arc<dyn StateChangeObserver>) -> Self {
        self.notifier = Some(notifier);
        self
    }

    pub fn with_arguments(mut self, arguments: Object) -> Self {
        self.arguments = Some(arguments);
        self
    }

    pub fn with_tokens(mut self, destroy: CancellationToken, suspend: CancellationToken) -> Self {
        self.destroy_token = destroy;
        self.suspend_token = suspend;
        self
    }
}

impl fmt::Debug for InterpreterOptions {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("InterpreterOptions")
            .field("session_id", &self.session_id)
            .field("max_microsteps", &self.max_microsteps)
            .field("destroyed", &self.destroy_token.is_cancelled())
            .field("suspended", &self.suspend_token.is_cancelled())
            .field("storage", &self.storage.is_some())
            .finish()
    }
}
