//! Session controller.
//!
//! A controller drives one interpreter on its own tokio task. Events reach it
//! through an unbounded mailbox, delayed sends through its [`Scheduler`].
//!
//! When a session has been waiting for longer than the idle timeout, the run
//! is suspended: the runtime context is written to storage and the interpreter
//! dropped. The next mailbox event reloads the snapshot and continues.

use crate::config::SessionConfig;
use crate::error::RuntimeError;
use crate::router::DispatchRouter;
use crate::scheduler::{ScheduledEvent, Scheduler};
use crate::service::{validate_to_parent, ParentLink, PARENT_TARGET};
use async_trait::async_trait;
use parking_lot::Mutex;
use rscx_core::{
    CoreError, Event, EventSource, ExecutionError, ExitStatus, ExternalCommunication,
    Interpreter, InterpreterModel, InterpreterOptions, InterpreterState, InvokeData, InvokeId,
    OutgoingEvent, SendId, SessionId, StateChangeObserver, StorageProvider, TracingLogger,
};
use rscx_value::{Object, Value};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Weak};
use tokio::sync::{mpsc, watch};
use tokio_util::sync::CancellationToken;

/// Lifecycle of a session as seen from outside.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionStatus {
    Created,
    Starting,
    /// Processing an event.
    Running,
    /// Stable and waiting for the next event.
    Waiting,
    /// Snapshot written; wakes on the next event.
    Suspended,
    Completed,
    Destroyed,
    QueueClosed,
    LiveLockAbort,
    Failed,
}

impl SessionStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            SessionStatus::Completed
                | SessionStatus::Destroyed
                | SessionStatus::QueueClosed
                | SessionStatus::LiveLockAbort
                | SessionStatus::Failed
        )
    }

    fn is_accepted(&self) -> bool {
        matches!(
            self,
            SessionStatus::Running | SessionStatus::Waiting | SessionStatus::Suspended
        )
    }
}

impl fmt::Display for SessionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            SessionStatus::Created => "created",
            SessionStatus::Starting => "starting",
            SessionStatus::Running => "running",
            SessionStatus::Waiting => "waiting",
            SessionStatus::Suspended => "suspended",
            SessionStatus::Completed => "completed",
            SessionStatus::Destroyed => "destroyed",
            SessionStatus::QueueClosed => "queue_closed",
            SessionStatus::LiveLockAbort => "live_lock_abort",
            SessionStatus::Failed => "failed",
        };
        f.write_str(s)
    }
}

/// How a session ended.
#[derive(Debug, Clone)]
pub struct SessionResult {
    pub status: SessionStatus,
    /// Done data of the top-level final state; undefined unless completed.
    pub result: Value,
    pub error: Option<String>,
}

/// Per-session settings that do not come from configuration.
#[derive(Debug, Clone, Default)]
pub struct SessionOptions {
    pub parent: Option<ParentLink>,
    /// Overrides for top-level `<data>` declarations.
    pub arguments: Option<Object>,
}

impl SessionOptions {
    pub fn with_parent(mut self, parent: ParentLink) -> Self {
        self.parent = Some(parent);
        self
    }

    pub fn with_arguments(mut self, arguments: Object) -> Self {
        self.arguments = Some(arguments);
        self
    }
}

/// Owns one running state machine.
pub struct SessionController {
    me: Weak<SessionController>,
    session_id: SessionId,
    model: Arc<InterpreterModel>,
    config: SessionConfig,
    mailbox_warn_depth: usize,
    router: Weak<DispatchRouter>,
    storage: Arc<dyn StorageProvider>,
    parent: Option<ParentLink>,
    arguments: Option<Object>,
    sender: Mutex<Option<mpsc::UnboundedSender<Event>>>,
    receiver: Mutex<Option<mpsc::UnboundedReceiver<Event>>>,
    /// Events sent but not yet taken by the interpreter.
    depth: AtomicUsize,
    scheduler: Arc<Scheduler>,
    destroy_token: CancellationToken,
    status: watch::Sender<SessionStatus>,
    outcome: Mutex<Option<SessionResult>>,
}

impl SessionController {
    /// Creates a controller bound to `router`.
    ///
    /// Sessions are normally created through
    /// [`DispatchRouter::create_session`], which also registers them for routing.
    pub fn new(
        router: &Arc<DispatchRouter>,
        session_id: SessionId,
        model: Arc<InterpreterModel>,
        options: SessionOptions,
    ) -> Arc<Self> {
        let (sender, receiver) = mpsc::unbounded_channel();
        let (status, _) = watch::channel(SessionStatus::Created);
        Arc::new_cyclic(|me| Self {
            me: me.clone(),
            scheduler: Arc::new(Scheduler::new(session_id.clone())),
            session_id,
            model,
            config: router.config().session.clone(),
            mailbox_warn_depth: router.config().router.mailbox_warn_depth,
            router: Arc::downgrade(router),
            storage: Arc::clone(router.storage()),
            parent: options.parent,
            arguments: options.arguments,
            sender: Mutex::new(Some(sender)),
            receiver: Mutex::new(Some(receiver)),
            depth: AtomicUsize::new(0),
            destroy_token: CancellationToken::new(),
            status,
            outcome: Mutex::new(None),
        })
    }

    pub fn session_id(&self) -> &SessionId {
        &self.session_id
    }

    pub fn model(&self) -> &Arc<InterpreterModel> {
        &self.model
    }

    pub fn parent(&self) -> Option<&ParentLink> {
        self.parent.as_ref()
    }

    pub fn status(&self) -> SessionStatus {
        *self.status.borrow()
    }

    /// Watches status changes.
    pub fn subscribe(&self) -> watch::Receiver<SessionStatus> {
        self.status.subscribe()
    }

    /// Cancelling this token destroys the session.
    pub fn cancellation_token(&self) -> CancellationToken {
        self.destroy_token.clone()
    }

    /// Number of live delayed sends.
    pub fn pending_sends(&self) -> usize {
        self.scheduler.pending()
    }

    /// Spawns the run task and waits until the first stable configuration is reached.
    pub async fn start(self: &Arc<Self>) -> Result<SessionStatus, RuntimeError> {
        if self.status().is_terminal() {
            return Err(self.terminated());
        }
        let receiver = self
            .receiver
            .lock()
            .take()
            .ok_or_else(|| RuntimeError::AlreadyStarted(self.session_id.clone()))?;

        let mut status_rx = self.status.subscribe();
        self.status.send_replace(SessionStatus::Starting);
        tracing::info!(
            "Session {} starting (chart {})",
            self.session_id,
            self.model.name.as_deref().unwrap_or("<unnamed>")
        );

        let mailbox = Mailbox {
            receiver,
            pending: None,
            owner: Arc::clone(self),
        };
        let task = tokio::spawn(Arc::clone(self).run(mailbox));
        let supervisor = Arc::clone(self);
        tokio::spawn(async move {
            if let Err(e) = task.await {
                tracing::error!("Session {} run task failed: {}", supervisor.session_id, e);
                supervisor.finish(
                    SessionStatus::Failed,
                    Value::Undefined,
                    Some(format!("run task failed: {}", e)),
                );
            }
        });

        let status = *status_rx
            .wait_for(|s| s.is_accepted() || s.is_terminal())
            .await
            .map_err(|_| self.terminated())?;

        match status {
            SessionStatus::Failed | SessionStatus::LiveLockAbort => Err(self.terminated()),
            other => Ok(other),
        }
    }

    /// Queues an external event. Never blocks.
    pub fn send(&self, event: Event) -> Result<(), RuntimeError> {
        let guard = self.sender.lock();
        let sender = guard
            .as_ref()
            .ok_or_else(|| RuntimeError::MailboxClosed(self.session_id.clone()))?;

        let depth = self.depth.fetch_add(1, Ordering::AcqRel) + 1;
        if sender.send(event).is_err() {
            self.depth.fetch_sub(1, Ordering::AcqRel);
            return Err(RuntimeError::MailboxClosed(self.session_id.clone()));
        }
        if self.mailbox_warn_depth > 0 && depth == self.mailbox_warn_depth {
            tracing::warn!(
                "Session {} mailbox reached {} pending events",
                self.session_id,
                depth
            );
        }
        Ok(())
    }

    /// Delivers `event` through the router after `event.delay`.
    ///
    /// If delivery fails when the timer fires, the session receives `error.communication`.
    pub fn schedule_send(&self, event: OutgoingEvent) -> Result<Arc<ScheduledEvent>, RuntimeError> {
        if self.status().is_terminal() {
            return Err(RuntimeError::MailboxClosed(self.session_id.clone()));
        }
        if event.target.as_deref() == Some(PARENT_TARGET) {
            validate_to_parent(&event)?;
        }

        let router = self.router.clone();
        let source = self.session_id.clone();
        let cancel = self.destroy_token.clone();
        Ok(self.scheduler.schedule(event, move |event| async move {
            let Some(router) = router.upgrade() else {
                return;
            };
            let send_id = event.send_id.clone();
            if let Err(e) = router.dispatch(&source, event, &cancel).await {
                tracing::debug!("Delayed send from session {} failed: {}", source, e);
                let error = ExecutionError::from(e).with_send_id(send_id);
                let _ = router.deliver(&source, Event::from_error(&error));
            }
        }))
    }

    /// Cancels every pending delayed send with `send_id`.
    pub fn cancel_send(&self, send_id: &SendId) -> usize {
        self.scheduler.cancel(send_id)
    }

    /// Stops the session without running exit handlers.
    pub fn destroy(&self) {
        tracing::info!("Destroying session {}", self.session_id);
        self.destroy_token.cancel();
        self.sender.lock().take();
        if self.receiver.lock().take().is_some() {
            // Never started, so no run task will report the outcome.
            self.finish(SessionStatus::Destroyed, Value::Undefined, None);
        }
    }

    /// Closes the mailbox. The session ends once it has drained.
    pub fn close(&self) {
        self.sender.lock().take();
    }

    /// Waits for the session to end and reports how.
    pub async fn execute(&self) -> SessionResult {
        let mut status_rx = self.status.subscribe();
        let _ = status_rx.wait_for(SessionStatus::is_terminal).await;
        self.outcome.lock().clone().unwrap_or_else(|| SessionResult {
            status: self.status(),
            result: Value::Undefined,
            error: None,
        })
    }

    /// Waits for completion and returns the done data.
    ///
    /// A closed mailbox ends the session normally unless `throw_on_error` is set.
    pub async fn result(&self) -> Result<Value, RuntimeError> {
        let outcome = self.execute().await;
        match outcome.status {
            SessionStatus::Completed => Ok(outcome.result),
            SessionStatus::QueueClosed if !self.config.throw_on_error => Ok(Value::Undefined),
            status => Err(RuntimeError::Terminated {
                status,
                reason: outcome.error.unwrap_or_else(|| status.to_string()),
            }),
        }
    }

    fn terminated(&self) -> RuntimeError {
        let outcome = self.outcome.lock().clone();
        let status = outcome
            .as_ref()
            .map(|o| o.status)
            .unwrap_or_else(|| self.status());
        RuntimeError::Terminated {
            status,
            reason: outcome
                .and_then(|o| o.error)
                .unwrap_or_else(|| status.to_string()),
        }
    }

    fn interpreter_options(&self) -> InterpreterOptions {
        let suspend = self.watch_idle();
        let mut options = InterpreterOptions::new(self.session_id.clone())
            .with_max_microsteps(self.config.max_microsteps)
            .with_logger(Arc::new(TracingLogger::new(self.config.tracing_enabled)))
            .with_communication(Arc::new(SessionCommunication {
                session_id: self.session_id.clone(),
                router: self.router.clone(),
                controller: self.me.clone(),
            }))
            .with_storage(Arc::clone(&self.storage))
            .with_notifier(Arc::new(SessionObserver {
                controller: self.me.clone(),
            }))
            .with_tokens(self.destroy_token.clone(), suspend);
        if let Some(arguments) = &self.arguments {
            options = options.with_arguments(arguments.clone());
        }
        options
    }

    async fn run(self: Arc<Self>, mut mailbox: Mailbox) {
        let mut interpreter = Interpreter::new(Arc::clone(&self.model), self.interpreter_options());
        loop {
            match interpreter.run(&mut mailbox).await {
                Ok(ExitStatus::Suspended) => {
                    drop(interpreter);
                    self.status.send_replace(SessionStatus::Suspended);
                    tracing::info!("Session {} suspended", self.session_id);

                    let wake = tokio::select! {
                        biased;
                        _ = self.destroy_token.cancelled() => None,
                        event = mailbox.next_event() => event,
                    };
                    let Some(event) = wake else {
                        let status = if self.destroy_token.is_cancelled() {
                            SessionStatus::Destroyed
                        } else {
                            SessionStatus::QueueClosed
                        };
                        self.finish(status, Value::Undefined, None);
                        return;
                    };

                    match self.resume() {
                        Ok(resumed) => {
                            interpreter = resumed;
                            mailbox.pending = Some(event);
                        }
                        Err(e) => {
                            tracing::error!("Session {} failed to resume: {}", self.session_id, e);
                            self.finish(SessionStatus::Failed, Value::Undefined, Some(e.to_string()));
                            return;
                        }
                    }
                }
                Ok(exit) => {
                    let (status, result) = match exit {
                        ExitStatus::Completed => {
                            (SessionStatus::Completed, interpreter.result().clone())
                        }
                        ExitStatus::Destroyed => (SessionStatus::Destroyed, Value::Undefined),
                        _ => (SessionStatus::QueueClosed, Value::Undefined),
                    };
                    self.finish(status, result, None);
                    return;
                }
                Err(e) => {
                    let status = match e {
                        CoreError::LiveLock { .. } => SessionStatus::LiveLockAbort,
                        _ => SessionStatus::Failed,
                    };
                    tracing::warn!("Session {} aborted: {}", self.session_id, e);
                    self.finish(status, Value::Undefined, Some(e.to_string()));
                    return;
                }
            }
        }
    }

    fn resume(&self) -> Result<Interpreter, RuntimeError> {
        let key = self.session_id.as_str();
        let snapshot = self.storage.load_bucket(key)?.ok_or_else(|| CoreError::Storage {
            reason: format!("no snapshot for session {}", self.session_id),
        })?;
        let interpreter =
            Interpreter::resume(Arc::clone(&self.model), self.interpreter_options(), &snapshot)?;
        self.storage.remove(key)?;
        tracing::info!("Session {} resumed", self.session_id);
        Ok(interpreter)
    }

    /// Publishes the outcome once. Later calls are ignored.
    fn finish(&self, status: SessionStatus, result: Value, error: Option<String>) {
        {
            let mut outcome = self.outcome.lock();
            if outcome.is_some() {
                return;
            }
            *outcome = Some(SessionResult {
                status,
                result: result.clone(),
                error,
            });
        }
        self.sender.lock().take();
        self.scheduler.dispose_all();
        tracing::info!("Session {} finished: {}", self.session_id, status);

        if let Some(router) = self.router.upgrade() {
            router.on_session_finished(&self.session_id, self.parent.as_ref(), status, &result);
        }
        self.status.send_replace(status);
    }

    /// Returns the suspend token for one interpreter run.
    ///
    /// With an idle timeout configured, a single watcher task restarts its
    /// deadline whenever the session becomes `Waiting` and trips the token once
    /// the deadline passes. It exits when the token is tripped, the session is
    /// destroyed or the session ends.
    fn watch_idle(&self) -> CancellationToken {
        let suspend = CancellationToken::new();
        let Some(idle) = self.config.idle_timeout() else {
            return suspend;
        };

        let token = suspend.clone();
        let destroy = self.destroy_token.clone();
        let session_id = self.session_id.clone();
        let mut status = self.status.subscribe();
        tokio::spawn(async move {
            let mut waiting = *status.borrow_and_update() == SessionStatus::Waiting;
            let deadline = tokio::time::sleep(idle);
            tokio::pin!(deadline);

            loop {
                tokio::select! {
                    biased;
                    _ = destroy.cancelled() => return,
                    _ = token.cancelled() => return,
                    changed = status.changed() => {
                        if changed.is_err() {
                            return;
                        }
                        let current = *status.borrow_and_update();
                        if current.is_terminal() {
                            return;
                        }
                        waiting = current == SessionStatus::Waiting;
                        if waiting {
                            deadline.as_mut().reset(tokio::time::Instant::now() + idle);
                        }
                    }
                    _ = &mut deadline, if waiting => {
                        tracing::debug!("Session {} idle for {:?}, suspending", session_id, idle);
                        token.cancel();
                        return;
                    }
                }
            }
        });
        suspend
    }
}

impl fmt::Debug for SessionController {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SessionController")
            .field("session_id", &self.session_id)
            .field("status", &self.status())
            .field("parent", &self.parent)
            .finish()
    }
}

/// The interpreter's view of the controller's mailbox.
struct Mailbox {
    receiver: mpsc::UnboundedReceiver<Event>,
    /// The event that woke a suspended session.
    pending: Option<Event>,
    owner: Arc<SessionController>,
}

#[async_trait]
impl EventSource for Mailbox {
    async fn next_event(&mut self) -> Option<Event> {
        if let Some(event) = self.pending.take() {
            return Some(event);
        }
        let event = self.receiver.recv().await?;
        let owner = &self.owner;
        owner.depth.fetch_sub(1, Ordering::AcqRel);
        owner.status.send_if_modified(|s| {
            if *s == SessionStatus::Waiting {
                *s = SessionStatus::Running;
                true
            } else {
                false
            }
        });
        Some(event)
    }
}

/// Maps interpreter notifications onto the controller's status.
struct SessionObserver {
    controller: Weak<SessionController>,
}

impl StateChangeObserver for SessionObserver {
    fn on_state_changed(&self, state: InterpreterState) {
        let Some(controller) = self.controller.upgrade() else {
            return;
        };
        match state {
            InterpreterState::Accepted => {
                controller.status.send_replace(SessionStatus::Running);
            }
            InterpreterState::Waiting => {
                controller.status.send_replace(SessionStatus::Waiting);
            }
            // Terminal statuses are published with the outcome by the run task.
            _ => {}
        }
    }
}

/// Connects a session's interpreter to the router and its scheduler.
struct SessionCommunication {
    session_id: SessionId,
    router: Weak<DispatchRouter>,
    controller: Weak<SessionController>,
}

impl SessionCommunication {
    fn router(&self) -> Result<Arc<DispatchRouter>, ExecutionError> {
        self.router
            .upgrade()
            .ok_or_else(|| RuntimeError::RouterGone.into())
    }

    fn controller(&self) -> Result<Arc<SessionController>, ExecutionError> {
        self.controller
            .upgrade()
            .ok_or_else(|| RuntimeError::SessionNotFound(self.session_id.clone()).into())
    }
}

#[async_trait]
impl ExternalCommunication for SessionCommunication {
    async fn send_event(&self, event: OutgoingEvent) -> Result<(), ExecutionError> {
        let send_id = event.send_id.clone();
        let result = if event.delay.is_zero() {
            let router = self.router()?;
            let cancel = self.controller()?.cancellation_token();
            router.dispatch(&self.session_id, event, &cancel).await
        } else {
            self.controller()?.schedule_send(event).map(|_| ())
        };
        result.map_err(|e| ExecutionError::from(e).with_send_id(send_id))
    }

    async fn cancel_event(&self, send_id: &SendId) -> Result<(), ExecutionError> {
        self.controller()?.cancel_send(send_id);
        Ok(())
    }

    async fn start_invoke(&self, data: InvokeData) -> Result<(), ExecutionError> {
        let router = self.router()?;
        router
            .start_invoke(&self.session_id, data)
            .await
            .map_err(ExecutionError::from)
    }

    async fn cancel_invoke(&self, invoke_id: &InvokeId) -> Result<(), ExecutionError> {
        self.router()?
            .cancel_invoke(&self.session_id, invoke_id)
            .await
            .map_err(ExecutionError::from)
    }

    async fn forward_event(&self, invoke_id: &InvokeId, event: Event) -> Result<(), ExecutionError> {
        self.router()?
            .forward_event(&self.session_id, invoke_id, event)
            .map_err(ExecutionError::from)
    }
}
