//! Dispatch router.
//!
//! The router owns every live session of a process. It resolves `<send>`
//! targets through registered [`EventProcessor`]s, starts and cancels invoked
//! child sessions, and reports child completion to the parent as
//! `done.invoke.<id>`.

use crate::config::Config;
use crate::controller::{SessionController, SessionOptions, SessionStatus};
use crate::error::RuntimeError;
use crate::processor::{EventProcessor, ScxmlProcessor, SCXML_PROCESSOR_ID};
use crate::service::ParentLink;
use dashmap::DashMap;
use parking_lot::RwLock;
use rscx_core::{
    ChartDefinition, CoreError, Event, EventName, FileStorage, InMemoryStorage, InterpreterModel,
    InvokeData, InvokeId, OutgoingEvent, SessionId, StorageProvider,
};
use rscx_value::Value;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

/// Router counters.
#[derive(Debug, Default)]
pub struct RouterStats {
    pub sessions_created: AtomicU64,
    pub sessions_finished: AtomicU64,
    pub events_dispatched: AtomicU64,
    pub events_delivered: AtomicU64,
    pub invokes_started: AtomicU64,
}

/// Routes events between the sessions of one process.
pub struct DispatchRouter {
    config: Config,
    storage: Arc<dyn StorageProvider>,
    sessions: DashMap<SessionId, Arc<SessionController>>,
    charts: DashMap<String, Arc<InterpreterModel>>,
    processors: RwLock<Vec<Arc<dyn EventProcessor>>>,
    /// (parent session, invoke id) -> child session.
    invocations: DashMap<(SessionId, InvokeId), SessionId>,
    stats: RouterStats,
}

impl DispatchRouter {
    /// Creates a router with the built-in processor registered.
    ///
    /// Snapshots go to `session.snapshot_dir` when set, otherwise to memory.
    pub fn new(config: Config) -> Result<Arc<Self>, RuntimeError> {
        config.validate()?;
        let storage: Arc<dyn StorageProvider> = match &config.session.snapshot_dir {
            Some(dir) => Arc::new(FileStorage::open(dir)?),
            None => Arc::new(InMemoryStorage::new()),
        };
        Ok(Self::with_storage(config, storage))
    }

    pub fn with_storage(config: Config, storage: Arc<dyn StorageProvider>) -> Arc<Self> {
        Arc::new(Self {
            config,
            storage,
            sessions: DashMap::new(),
            charts: DashMap::new(),
            processors: RwLock::new(vec![Arc::new(ScxmlProcessor)]),
            invocations: DashMap::new(),
            stats: RouterStats::default(),
        })
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn storage(&self) -> &Arc<dyn StorageProvider> {
        &self.storage
    }

    pub fn stats(&self) -> &RouterStats {
        &self.stats
    }

    /// Makes a chart available to [`create_session`](Self::create_session) and `<invoke src>`.
    pub fn register_chart(
        &self,
        name: impl Into<String>,
        model: InterpreterModel,
    ) -> Arc<InterpreterModel> {
        let name = name.into();
        let model = Arc::new(model);
        tracing::info!("Registered chart '{}' ({} states)", name, model.state_count());
        self.charts.insert(name, Arc::clone(&model));
        model
    }

    pub fn chart(&self, name: &str) -> Option<Arc<InterpreterModel>> {
        self.charts.get(name).map(|m| Arc::clone(m.value()))
    }

    /// Adds a processor. Later registrations are consulted first.
    pub fn register_processor(&self, processor: Arc<dyn EventProcessor>) {
        tracing::info!("Registered event processor {}", processor.id());
        self.processors.write().insert(0, processor);
    }

    fn processor_for(
        &self,
        event_type: Option<&str>,
        target: Option<&str>,
    ) -> Option<Arc<dyn EventProcessor>> {
        self.processors
            .read()
            .iter()
            .find(|p| p.can_handle(event_type, target))
            .cloned()
    }

    pub fn can_handle(&self, event_type: Option<&str>, target: Option<&str>) -> bool {
        self.processor_for(event_type, target).is_some()
    }

    /// The address of `session_id` for the built-in processor.
    pub fn get_target(&self, session_id: &SessionId) -> String {
        ScxmlProcessor.get_target(session_id)
    }

    /// Creates a session for a registered chart. The session is not started.
    pub fn create_session(
        self: &Arc<Self>,
        chart: &str,
        options: SessionOptions,
    ) -> Result<Arc<SessionController>, RuntimeError> {
        let model = self
            .chart(chart)
            .ok_or_else(|| RuntimeError::ChartNotFound(chart.to_string()))?;
        Ok(self.create_session_from_model(model, options))
    }

    pub fn create_session_from_model(
        self: &Arc<Self>,
        model: Arc<InterpreterModel>,
        options: SessionOptions,
    ) -> Arc<SessionController> {
        let session_id = SessionId::generate();
        let controller = SessionController::new(self, session_id.clone(), model, options);
        self.sessions.insert(session_id, Arc::clone(&controller));
        self.stats.sessions_created.fetch_add(1, Ordering::Relaxed);
        controller
    }

    pub fn session(&self, session_id: &SessionId) -> Option<Arc<SessionController>> {
        self.sessions.get(session_id).map(|s| Arc::clone(s.value()))
    }

    pub fn session_count(&self) -> usize {
        self.sessions.len()
    }

    /// Routes an event sent by `source`.
    ///
    /// Nothing is delivered once `cancel` has fired.
    pub async fn dispatch(
        &self,
        source: &SessionId,
        event: OutgoingEvent,
        cancel: &CancellationToken,
    ) -> Result<(), RuntimeError> {
        if cancel.is_cancelled() {
            tracing::debug!(
                "Dropped '{}' from session {}: sender is gone",
                event.name,
                source
            );
            return Ok(());
        }

        let processor = self
            .processor_for(event.event_type.as_deref(), event.target.as_deref())
            .ok_or_else(|| RuntimeError::NoProcessor {
                event_type: event
                    .event_type
                    .clone()
                    .unwrap_or_else(|| SCXML_PROCESSOR_ID.to_string()),
                target: event.target.clone().unwrap_or_default(),
            })?;

        self.stats.events_dispatched.fetch_add(1, Ordering::Relaxed);
        processor.dispatch(self, source, event).await
    }

    /// Puts an event into a session's mailbox.
    pub fn deliver(&self, target: &SessionId, event: Event) -> Result<(), RuntimeError> {
        let session = self
            .session(target)
            .ok_or_else(|| RuntimeError::SessionNotFound(target.clone()))?;
        session.send(event)?;
        self.stats.events_delivered.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    pub fn parent_of(&self, session_id: &SessionId) -> Option<ParentLink> {
        self.sessions
            .get(session_id)
            .and_then(|s| s.parent().cloned())
    }

    pub fn child_of(&self, parent: &SessionId, invoke_id: &InvokeId) -> Option<SessionId> {
        self.invocations
            .get(&(parent.clone(), invoke_id.clone()))
            .map(|c| c.value().clone())
    }

    /// Starts a child session for an `<invoke>` of `parent`.
    ///
    /// The chart comes from `src` (a registered chart name) or from inline content.
    pub async fn start_invoke(
        self: &Arc<Self>,
        parent: &SessionId,
        data: InvokeData,
    ) -> Result<(), RuntimeError> {
        if !ScxmlProcessor::is_scxml_type(data.invoke_type.as_deref()) {
            return Err(RuntimeError::NoProcessor {
                event_type: data.invoke_type.unwrap_or_default(),
                target: data.source.unwrap_or_default(),
            });
        }

        let model = match (&data.source, &data.content) {
            (Some(src), _) => self
                .chart(src)
                .ok_or_else(|| RuntimeError::ChartNotFound(src.clone()))?,
            (None, Value::Object(_)) => {
                let json = data.content.to_json().map_err(CoreError::from)?;
                Arc::new(ChartDefinition::from_json(&json)?.compile()?)
            }
            (None, _) => {
                return Err(RuntimeError::ChartNotFound(format!(
                    "invoke '{}' has neither src nor content",
                    data.invoke_id
                )))
            }
        };

        let mut options = SessionOptions::default().with_parent(ParentLink {
            session_id: parent.clone(),
            invoke_id: data.invoke_id.clone(),
            unique_id: data.unique_id.clone(),
        });
        if let Some(params) = data.parameters.as_object() {
            options = options.with_arguments(params.clone_as_writable());
        }

        let child = self.create_session_from_model(model, options);
        let key = (parent.clone(), data.invoke_id.clone());
        self.invocations
            .insert(key.clone(), child.session_id().clone());
        self.stats.invokes_started.fetch_add(1, Ordering::Relaxed);

        tracing::info!(
            "Session {} invoked {} as session {}",
            parent,
            data.invoke_id,
            child.session_id()
        );

        if let Err(e) = child.start().await {
            self.invocations.remove(&key);
            return Err(e);
        }
        Ok(())
    }

    /// Stops a child session. Unknown invocations are ignored.
    pub async fn cancel_invoke(
        &self,
        parent: &SessionId,
        invoke_id: &InvokeId,
    ) -> Result<(), RuntimeError> {
        if let Some((_, child)) = self
            .invocations
            .remove(&(parent.clone(), invoke_id.clone()))
        {
            tracing::info!("Session {} cancelled invoke {}", parent, invoke_id);
            if let Some(session) = self.session(&child) {
                session.destroy();
            }
        }
        Ok(())
    }

    pub fn is_invoke_active(&self, parent: &SessionId, invoke_id: &InvokeId) -> bool {
        self.child_of(parent, invoke_id)
            .and_then(|child| self.session(&child))
            .map(|s| !s.status().is_terminal())
            .unwrap_or(false)
    }

    /// Hands a parent's external event to one of its children.
    pub fn forward_event(
        &self,
        parent: &SessionId,
        invoke_id: &InvokeId,
        event: Event,
    ) -> Result<(), RuntimeError> {
        let child = self
            .child_of(parent, invoke_id)
            .ok_or_else(|| RuntimeError::UnknownTarget(format!("#_{}", invoke_id)))?;
        self.deliver(&child, event)
    }

    /// Called by a controller once its run has ended.
    pub(crate) fn on_session_finished(
        &self,
        session_id: &SessionId,
        parent: Option<&ParentLink>,
        status: SessionStatus,
        result: &Value,
    ) {
        self.sessions.remove(session_id);
        self.stats.sessions_finished.fetch_add(1, Ordering::Relaxed);

        let Some(link) = parent else {
            return;
        };
        let still_invoked = self
            .invocations
            .remove(&(link.session_id.clone(), link.invoke_id.clone()))
            .is_some();
        if !still_invoked || status != SessionStatus::Completed {
            return;
        }

        let done = Event::external(EventName::done_invoke(&link.invoke_id))
            .with_data(result.clone())
            .with_origin(link.origin(), SCXML_PROCESSOR_ID)
            .with_invoke(link.invoke_id.clone(), link.unique_id.clone());
        if let Err(e) = self.deliver(&link.session_id, done) {
            tracing::debug!(
                "Could not report completion of {} to session {}: {}",
                link.invoke_id,
                link.session_id,
                e
            );
        }
    }

    /// Destroys every live session.
    pub fn shutdown(&self) {
        let sessions: Vec<_> = self.sessions.iter().map(|s| Arc::clone(s.value())).collect();
        tracing::info!("Shutting down {} session(s)", sessions.len());
        for session in sessions {
            session.destroy();
        }
    }
}

impl std::fmt::Debug for DispatchRouter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DispatchRouter")
            .field("sessions", &self.sessions.len())
            .field("charts", &self.charts.len())
            .field("processors", &self.processors.read().len())
            .finish()
    }
}
