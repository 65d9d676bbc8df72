//! The macrostep/microstep interpreter.
//!
//! One [`Interpreter`] drives one session. [`Interpreter::run`] enters the
//! initial configuration, then alternates between running a macrostep to a
//! stable configuration and waiting on its [`EventSource`] for the next external
//! event. Transition selection, conflict resolution and the exit/entry sets
//! follow the SCXML algorithm, with [`DocumentId`](crate::model::DocumentId)
//! order as the only tie-break.

use crate::context::RuntimeContext;
use crate::error::{CoreError, PlatformError};
use crate::event::Event;
use crate::exec::Effect;
use crate::ident::{EventName, SessionId};
use crate::logger::{LogContext, TraceRecord};
use crate::model::{HistoryKind, InterpreterModel, StateIdx, StateKind, TransitionIdx, TransitionKind, ROOT};
use crate::options::{EventSource, ExitStatus, InterpreterOptions, InterpreterState};
use crate::persistence::Bucket;
use rscx_value::{Object, Value};
use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;

/// States chosen for entry during one microstep.
#[derive(Default)]
struct EntrySet {
    states: BTreeSet<StateIdx>,
    /// Compound states entered through their initial transition.
    default_entry: BTreeSet<StateIdx>,
    /// Parent state -> default transition of a history state with no record.
    history_content: HashMap<StateIdx, TransitionIdx>,
}

enum Wake {
    Destroy,
    Suspend,
    Event(Option<Event>),
}

/// Interprets one compiled chart for one session.
pub struct Interpreter {
    pub(crate) model: Arc<InterpreterModel>,
    pub(crate) options: InterpreterOptions,
    pub(crate) ctx: RuntimeContext,
    pub(crate) effects: Vec<Effect>,
    pub(crate) log_ctx: LogContext,
}

impl Interpreter {
    /// Creates an interpreter in the idle state. Nothing runs until [`run`](Self::run).
    pub fn new(model: Arc<InterpreterModel>, options: InterpreterOptions) -> Self {
        let log_ctx = LogContext {
            session_id: options.session_id.clone(),
            machine: model.name.clone(),
        };
        Self {
            model,
            options,
            ctx: RuntimeContext::new(),
            effects: Vec::new(),
            log_ctx,
        }
    }

    /// Recreates an interpreter from a snapshot taken when it was suspended.
    pub fn resume(
        model: Arc<InterpreterModel>,
        options: InterpreterOptions,
        snapshot: &Bucket,
    ) -> Result<Self, CoreError> {
        let ctx = RuntimeContext::restore(&model, snapshot)?;
        let mut interp = Self::new(model, options);
        interp.ctx = ctx;
        interp.bind_system_variables()?;

        // Undefined values are not written to snapshots; keep them declared.
        let model = Arc::clone(&interp.model);
        for data in model.states.iter().flat_map(|s| &s.datamodel) {
            if !interp.ctx.data_model.contains(&data.id) {
                interp.ctx.data_model.set(&data.id, Value::Undefined)?;
            }
        }

        tracing::debug!(
            session_id = interp.options.session_id.as_str(),
            "Resumed with {} active states",
            interp.ctx.configuration.len()
        );
        Ok(interp)
    }

    pub fn session_id(&self) -> &SessionId {
        &self.options.session_id
    }

    pub fn model(&self) -> &Arc<InterpreterModel> {
        &self.model
    }

    pub fn context(&self) -> &RuntimeContext {
        &self.ctx
    }

    pub fn data_model(&self) -> &Object {
        &self.ctx.data_model
    }

    /// Ids of the active states in document order.
    pub fn configuration(&self) -> Vec<&str> {
        self.ctx
            .configuration
            .iter()
            .map(|s| self.model.state(*s).id.as_str())
            .collect()
    }

    pub fn is_in_state(&self, id: &str) -> bool {
        self.model
            .state_by_id(id)
            .is_some_and(|s| self.ctx.configuration.contains(&s))
    }

    pub fn is_done(&self) -> bool {
        self.ctx.done
    }

    /// Done data of the top-level final state, once completed.
    pub fn result(&self) -> &Value {
        &self.ctx.result
    }

    /// Serializes the runtime context.
    pub fn snapshot(&self) -> Result<Bucket, CoreError> {
        let mut bucket = Bucket::new();
        self.ctx.store(&self.model, &mut bucket)?;
        Ok(bucket)
    }

    /// Runs until the machine completes, is destroyed or suspended, or the
    /// source closes. Live-lock and engine faults are returned as errors.
    pub async fn run(&mut self, source: &mut dyn EventSource) -> Result<ExitStatus, CoreError> {
        self.notify(InterpreterState::Started);
        let outcome = self.run_loop(source).await;
        let state = match &outcome {
            Ok(ExitStatus::Completed) => InterpreterState::Completed,
            Ok(ExitStatus::Suspended) => InterpreterState::Suspended,
            Ok(ExitStatus::Destroyed) => InterpreterState::Destroyed,
            Ok(ExitStatus::QueueClosed) => InterpreterState::QueueClosed,
            Err(CoreError::LiveLock { .. }) => InterpreterState::LiveLockAbort,
            Err(_) => InterpreterState::Exited,
        };
        self.notify(state);
        outcome
    }

    async fn run_loop(&mut self, source: &mut dyn EventSource) -> Result<ExitStatus, CoreError> {
        if !self.ctx.initialized {
            self.initialize_data_model()?;
            let initial = self
                .model
                .state(ROOT)
                .initial
                .ok_or_else(|| CoreError::infrastructure("chart root has no initial transition"))?;
            self.enter_states(&[initial]);
            self.ctx.initialized = true;
            self.flush_effects().await;
        } else if self.ctx.done {
            return Ok(ExitStatus::Completed);
        }

        let mut accepted = false;
        let mut steps = 0usize;
        loop {
            match self.macrostep(&mut steps).await {
                Err(CoreError::Destroyed) => return self.destroy().await,
                other => other?,
            }
            if self.ctx.done {
                return self.complete().await;
            }

            self.start_invokes().await;
            if !self.ctx.internal_queue.is_empty() {
                continue;
            }

            if !accepted {
                accepted = true;
                self.notify(InterpreterState::Accepted);
            }
            self.notify(InterpreterState::Waiting);

            let destroy = self.options.destroy_token.clone();
            let suspend = self.options.suspend_token.clone();
            let wake = tokio::select! {
                biased;
                _ = destroy.cancelled() => Wake::Destroy,
                _ = suspend.cancelled() => Wake::Suspend,
                event = source.next_event() => Wake::Event(event),
            };

            match wake {
                Wake::Destroy => return self.destroy().await,
                Wake::Suspend => return self.suspend(),
                Wake::Event(None) => return Ok(ExitStatus::QueueClosed),
                Wake::Event(Some(event)) => {
                    steps = 0;
                    self.process_external(event, &mut steps).await?;
                }
            }
        }
    }

    /// Binds system variables and evaluates every `<data>` declaration in
    /// document order. Arguments override declarations with the same id.
    pub(crate) fn initialize_data_model(&mut self) -> Result<(), CoreError> {
        self.bind_system_variables()?;
        let model = Arc::clone(&self.model);
        for data in model.states.iter().flat_map(|s| &s.datamodel) {
            let argument = self
                .options
                .arguments
                .as_ref()
                .filter(|args| args.contains(&data.id))
                .map(|args| args.get(&data.id));
            let value = match (argument, &data.expr) {
                (Some(value), _) => value,
                (None, Some(expr)) => match self.evaluate(expr) {
                    Ok(value) => value,
                    Err(e) => {
                        self.raise_error(e);
                        Value::Undefined
                    }
                },
                (None, None) => Value::Undefined,
            };
            self.ctx.data_model.set(&data.id, value)?;
        }
        Ok(())
    }

    fn bind_system_variables(&mut self) -> Result<(), CoreError> {
        let name = self.model.name.clone().map(Value::from).unwrap_or_default();
        let dm = &self.ctx.data_model;
        dm.define("_sessionid", self.options.session_id.as_str(), true)?;
        dm.define("_name", name, true)?;
        Ok(())
    }

    fn bind_event(&mut self, event: &Event) -> Result<(), CoreError> {
        self.trace(TraceRecord::ProcessingEvent(event));
        self.ctx
            .data_model
            .define("_event", event.to_object(), true)?;
        Ok(())
    }

    /// Takes eventless transitions and internal events until neither is left.
    async fn macrostep(&mut self, steps: &mut usize) -> Result<(), CoreError> {
        loop {
            if self.ctx.done {
                return Ok(());
            }
            if self.options.destroy_token.is_cancelled() {
                return Err(CoreError::Destroyed);
            }

            let mut enabled = self.select_transitions(None);
            if enabled.is_empty() {
                let Some(event) = self.ctx.internal_queue.pop_front() else {
                    return Ok(());
                };
                self.bind_event(&event)?;
                enabled = self.select_transitions(Some(&event));
            }

            // Every pass counts, including internal events that enable nothing.
            *steps += 1;
            if *steps > self.options.max_microsteps {
                tracing::warn!(
                    session_id = self.options.session_id.as_str(),
                    "Live-lock: {} microsteps without reaching a stable configuration",
                    self.options.max_microsteps
                );
                return Err(CoreError::LiveLock {
                    limit: self.options.max_microsteps,
                });
            }
            if enabled.is_empty() {
                continue;
            }
            self.microstep(&enabled);
            self.flush_effects().await;
        }
    }

    async fn process_external(&mut self, event: Event, steps: &mut usize) -> Result<(), CoreError> {
        self.bind_event(&event)?;

        let model = Arc::clone(&self.model);
        for inv in self.ctx.invocations.clone() {
            let from_this = event.invoke_id.as_ref() == Some(&inv.invoke_id);
            if from_this {
                self.execute_block(&model.state(inv.state).invokes[inv.node].finalize);
            } else if inv.autoforward {
                self.effects
                    .push(Effect::Forward(inv.invoke_id.clone(), event.clone()));
            }
        }
        if let Some(done_id) = event.name.done_invoke_id() {
            self.ctx.invocations.retain(|inv| inv.invoke_id != done_id);
        }

        let enabled = self.select_transitions(Some(&event));
        if !enabled.is_empty() {
            *steps += 1;
            self.microstep(&enabled);
        }
        self.flush_effects().await;
        Ok(())
    }

    /// Optimally enabled transitions for `event`, or eventless ones for `None`.
    fn select_transitions(&mut self, event: Option<&Event>) -> Vec<TransitionIdx> {
        let model = Arc::clone(&self.model);
        let atomic: Vec<StateIdx> = self
            .ctx
            .configuration
            .iter()
            .copied()
            .filter(|s| model.is_atomic(*s))
            .collect();

        let mut enabled = Vec::new();
        for state in atomic {
            let chain = std::iter::once(state).chain(model.proper_ancestors(state, None));
            'chain: for s in chain {
                for &t in &model.state(s).transitions {
                    let node = model.transition(t);
                    let matched = match event {
                        None => node.is_eventless(),
                        Some(e) => node.events.iter().any(|d| d.matches(&e.name)),
                    };
                    if matched && self.condition_holds(t) {
                        if !enabled.contains(&t) {
                            enabled.push(t);
                        }
                        break 'chain;
                    }
                }
            }
        }
        self.remove_conflicting(enabled)
    }

    /// A failing guard raises `error.execution` and counts as false.
    fn condition_holds(&mut self, transition: TransitionIdx) -> bool {
        let model = Arc::clone(&self.model);
        match &model.transition(transition).condition {
            None => true,
            Some(cond) => match self.evaluate(cond) {
                Ok(value) => value.is_truthy(),
                Err(e) => {
                    self.raise_error(e);
                    false
                }
            },
        }
    }

    /// Drops transitions whose exit sets intersect an earlier one. A transition
    /// from a descendant source replaces the one it conflicts with.
    fn remove_conflicting(&self, mut enabled: Vec<TransitionIdx>) -> Vec<TransitionIdx> {
        enabled.sort_by_key(|t| self.model.transition(*t).document_id);

        let mut filtered: Vec<TransitionIdx> = Vec::with_capacity(enabled.len());
        for t1 in enabled {
            let exit1 = self.exit_set(&[t1]);
            let source1 = self.model.transition(t1).source;
            let mut preempted = false;
            let mut displaced = Vec::new();
            for &t2 in &filtered {
                if exit1.is_disjoint(&self.exit_set(&[t2])) {
                    continue;
                }
                if self
                    .model
                    .is_descendant(source1, self.model.transition(t2).source)
                {
                    displaced.push(t2);
                } else {
                    preempted = true;
                    break;
                }
            }
            if !preempted {
                filtered.retain(|t| !displaced.contains(t));
                filtered.push(t1);
            }
        }
        filtered
    }

    fn exit_set(&self, transitions: &[TransitionIdx]) -> BTreeSet<StateIdx> {
        let mut out = BTreeSet::new();
        for &t in transitions {
            if self.model.transition(t).is_targetless() {
                continue;
            }
            if let Some(domain) = self.transition_domain(t) {
                out.extend(
                    self.ctx
                        .configuration
                        .iter()
                        .copied()
                        .filter(|s| self.model.is_descendant(*s, domain)),
                );
            }
        }
        out
    }

    fn transition_domain(&self, t: TransitionIdx) -> Option<StateIdx> {
        let node = self.model.transition(t);
        let targets = self.effective_target_states(t);
        if targets.is_empty() {
            return None;
        }
        if node.kind == TransitionKind::Internal
            && self.model.is_compound(node.source)
            && targets
                .iter()
                .all(|s| self.model.is_descendant(*s, node.source))
        {
            return Some(node.source);
        }
        let mut states = vec![node.source];
        states.extend(targets);
        Some(self.find_lca(&states))
    }

    /// Nearest compound (or root) proper ancestor of the first state containing all others.
    fn find_lca(&self, states: &[StateIdx]) -> StateIdx {
        let Some((first, rest)) = states.split_first() else {
            return ROOT;
        };
        self.model
            .proper_ancestors(*first, None)
            .into_iter()
            .find(|anc| {
                (*anc == ROOT || self.model.is_compound(*anc))
                    && rest.iter().all(|s| self.model.is_descendant(*s, *anc))
            })
            .unwrap_or(ROOT)
    }

    fn effective_target_states(&self, t: TransitionIdx) -> BTreeSet<StateIdx> {
        let mut out = BTreeSet::new();
        for &s in &self.model.transition(t).targets {
            if !self.model.is_history(s) {
                out.insert(s);
                continue;
            }
            match self.ctx.history.get(&s) {
                Some(recorded) => out.extend(recorded.iter().copied()),
                None => {
                    if let Some(default) = self.model.state(s).initial {
                        out.extend(self.effective_target_states(default));
                    }
                }
            }
        }
        out
    }

    fn microstep(&mut self, enabled: &[TransitionIdx]) {
        self.exit_states(enabled);
        self.execute_transition_content(enabled);
        self.enter_states(enabled);
    }

    fn exit_states(&mut self, enabled: &[TransitionIdx]) {
        let model = Arc::clone(&self.model);
        let exit = self.exit_set(enabled);
        for s in &exit {
            self.ctx.states_to_invoke.remove(s);
        }

        // Record history before any state leaves the configuration.
        for &s in &exit {
            for h in model.history_children(s) {
                let recorded: Vec<StateIdx> = match model.state(h).kind {
                    StateKind::History(HistoryKind::Deep) => self
                        .ctx
                        .configuration
                        .iter()
                        .copied()
                        .filter(|c| model.is_atomic(*c) && model.is_descendant(*c, s))
                        .collect(),
                    _ => self
                        .ctx
                        .configuration
                        .iter()
                        .copied()
                        .filter(|c| model.state(*c).parent == Some(s))
                        .collect(),
                };
                self.ctx.history.insert(h, recorded);
            }
        }

        for &s in exit.iter().rev() {
            let node = model.state(s);
            self.trace(TraceRecord::ExitingState(node.id.as_str()));
            self.execute_block(&node.on_exit);
            self.cancel_invocations_of(s);
            self.ctx.configuration.remove(&s);
            self.trace(TraceRecord::ExitedState(node.id.as_str()));
        }
    }

    fn cancel_invocations_of(&mut self, state: StateIdx) {
        let (cancelled, kept): (Vec<_>, Vec<_>) = std::mem::take(&mut self.ctx.invocations)
            .into_iter()
            .partition(|inv| inv.state == state);
        self.ctx.invocations = kept;
        for inv in cancelled {
            self.effects.push(Effect::CancelInvoke(inv.invoke_id));
        }
    }

    fn execute_transition_content(&mut self, enabled: &[TransitionIdx]) {
        let model = Arc::clone(&self.model);
        for &t in enabled {
            let node = model.transition(t);
            let kind = node.kind.to_string();
            let event = node.event_text();
            let target = node
                .targets
                .iter()
                .map(|s| model.state(*s).id.as_str())
                .collect::<Vec<_>>()
                .join(" ");

            self.trace(TraceRecord::PerformingTransition {
                kind: &kind,
                event: &event,
                target: &target,
            });
            self.execute_block(&node.actions);
            self.trace(TraceRecord::PerformedTransition {
                kind: &kind,
                event: &event,
                target: &target,
            });
        }
    }

    fn enter_states(&mut self, enabled: &[TransitionIdx]) {
        let model = Arc::clone(&self.model);
        let mut entry = EntrySet::default();
        for &t in enabled {
            for &s in &model.transition(t).targets {
                self.add_descendants(s, &mut entry);
            }
            if let Some(domain) = self.transition_domain(t) {
                for s in self.effective_target_states(t) {
                    self.add_ancestors(s, domain, &mut entry);
                }
            }
        }

        for &s in &entry.states {
            let node = model.state(s);
            self.trace(TraceRecord::EnteringState(node.id.as_str()));
            self.ctx.configuration.insert(s);
            self.ctx.states_to_invoke.insert(s);
            self.execute_block(&node.on_entry);

            if entry.default_entry.contains(&s) {
                if let Some(initial) = node.initial {
                    self.execute_block(&model.transition(initial).actions);
                }
            }
            if let Some(default) = entry.history_content.get(&s) {
                self.execute_block(&model.transition(*default).actions);
            }
            self.trace(TraceRecord::EnteredState(node.id.as_str()));

            if model.is_final(s) {
                self.enter_final(s);
            }
        }
    }

    fn enter_final(&mut self, state: StateIdx) {
        let model = Arc::clone(&self.model);
        let data = match &model.state(state).done_data {
            Some(expr) => match self.evaluate(expr) {
                Ok(value) => value,
                Err(e) => {
                    self.raise_error(e);
                    Value::Undefined
                }
            },
            None => Value::Undefined,
        };

        let parent = model.state(state).parent.unwrap_or(ROOT);
        if parent == ROOT {
            self.ctx.done = true;
            self.ctx.result = data;
            return;
        }

        self.ctx.internal_queue.push_back(
            Event::internal(EventName::done_state(&model.state(parent).id)).with_data(data),
        );
        if let Some(grand) = model.state(parent).parent {
            if model.is_parallel(grand) && model.child_states(grand).all(|c| self.is_in_final_state(c)) {
                self.ctx
                    .internal_queue
                    .push_back(Event::internal(EventName::done_state(&model.state(grand).id)));
            }
        }
    }

    fn is_in_final_state(&self, s: StateIdx) -> bool {
        if self.model.is_compound(s) {
            self.model
                .child_states(s)
                .any(|c| self.model.is_final(c) && self.ctx.configuration.contains(&c))
        } else if self.model.is_parallel(s) {
            self.model.child_states(s).all(|c| self.is_in_final_state(c))
        } else {
            false
        }
    }

    fn add_descendants(&self, s: StateIdx, entry: &mut EntrySet) {
        if self.model.is_history(s) {
            let parent = self.model.state(s).parent.unwrap_or(ROOT);
            let targets = match self.ctx.history.get(&s) {
                Some(recorded) => recorded.clone(),
                None => match self.model.state(s).initial {
                    Some(default) => {
                        entry.history_content.insert(parent, default);
                        self.model.transition(default).targets.clone()
                    }
                    None => Vec::new(),
                },
            };
            for &r in &targets {
                self.add_descendants(r, entry);
            }
            for &r in &targets {
                self.add_ancestors(r, parent, entry);
            }
            return;
        }

        entry.states.insert(s);
        if self.model.is_compound(s) {
            entry.default_entry.insert(s);
            if let Some(initial) = self.model.state(s).initial {
                let targets = &self.model.transition(initial).targets;
                for &r in targets {
                    self.add_descendants(r, entry);
                }
                for &r in targets {
                    self.add_ancestors(r, s, entry);
                }
            }
        } else if self.model.is_parallel(s) {
            self.add_missing_regions(s, entry);
        }
    }

    fn add_ancestors(&self, s: StateIdx, ancestor: StateIdx, entry: &mut EntrySet) {
        for anc in self.model.proper_ancestors(s, Some(ancestor)) {
            if anc == ROOT {
                break;
            }
            entry.states.insert(anc);
            if self.model.is_parallel(anc) {
                self.add_missing_regions(anc, entry);
            }
        }
    }

    fn add_missing_regions(&self, parallel: StateIdx, entry: &mut EntrySet) {
        for child in self.model.child_states(parallel) {
            let covered = entry
                .states
                .iter()
                .any(|e| *e == child || self.model.is_descendant(*e, child));
            if !covered {
                self.add_descendants(child, entry);
            }
        }
    }

    /// Starts the invokes of every state entered during the last macrostep.
    async fn start_invokes(&mut self) {
        let states: Vec<StateIdx> = std::mem::take(&mut self.ctx.states_to_invoke)
            .into_iter()
            .collect();
        let model = Arc::clone(&self.model);
        let comm = Arc::clone(&self.options.communication);

        for s in states {
            for node in 0..model.state(s).invokes.len() {
                let data = match self.prepare_invoke(s, node) {
                    Ok(data) => data,
                    Err(e) => {
                        self.raise_error(e);
                        continue;
                    }
                };
                let invoke_id = data.invoke_id.clone();
                tracing::debug!(
                    session_id = self.options.session_id.as_str(),
                    "Starting invoke '{}' from state '{}'",
                    invoke_id,
                    model.state(s).id
                );
                if let Err(e) = comm.start_invoke(data).await {
                    self.ctx.invocations.retain(|inv| inv.invoke_id != invoke_id);
                    self.raise_error(e);
                }
            }
        }
    }

    async fn flush_effects(&mut self) {
        if self.effects.is_empty() {
            return;
        }
        let comm = Arc::clone(&self.options.communication);
        for effect in std::mem::take(&mut self.effects) {
            let result = match effect {
                Effect::Send(event) => comm.send_event(event).await,
                Effect::Cancel(send_id) => comm.cancel_event(&send_id).await,
                Effect::CancelInvoke(invoke_id) => comm.cancel_invoke(&invoke_id).await,
                Effect::Forward(invoke_id, event) => comm.forward_event(&invoke_id, event).await,
            };
            if let Err(e) = result {
                self.raise_error(e);
            }
        }
    }

    /// Exits every active state after a top-level final state was entered.
    async fn complete(&mut self) -> Result<ExitStatus, CoreError> {
        let model = Arc::clone(&self.model);
        let active: Vec<StateIdx> = self.ctx.configuration.iter().rev().copied().collect();
        for s in active {
            let node = model.state(s);
            self.execute_block(&node.on_exit);
            self.cancel_invocations_of(s);
            self.ctx.configuration.remove(&s);
            self.trace(TraceRecord::ExitedState(node.id.as_str()));
        }
        self.ctx.states_to_invoke.clear();
        self.flush_effects().await;

        tracing::debug!(
            session_id = self.options.session_id.as_str(),
            "Completed with result {}",
            self.ctx.result
        );
        Ok(ExitStatus::Completed)
    }

    async fn destroy(&mut self) -> Result<ExitStatus, CoreError> {
        self.effects.clear();
        for inv in std::mem::take(&mut self.ctx.invocations) {
            self.effects.push(Effect::CancelInvoke(inv.invoke_id));
        }
        self.flush_effects().await;
        Ok(ExitStatus::Destroyed)
    }

    fn suspend(&mut self) -> Result<ExitStatus, CoreError> {
        if let Some(storage) = self.options.storage.clone() {
            let bucket = self.snapshot()?;
            storage.save_bucket(self.options.session_id.as_str(), &bucket)?;
            tracing::debug!(
                session_id = self.options.session_id.as_str(),
                "Snapshot written"
            );
        }
        Ok(ExitStatus::Suspended)
    }

    fn notify(&mut self, state: InterpreterState) {
        self.trace(TraceRecord::InterpreterState(state));
        if let Some(notifier) = &self.options.notifier {
            notifier.on_state_changed(state);
        }
    }

    fn trace(&mut self, record: TraceRecord<'_>) {
        if !self.options.logger.is_tracing_enabled() {
            return;
        }
        if let Err(e) = self.options.logger.trace(&self.log_ctx, record) {
            let error = PlatformError::new(self.options.session_id.clone(), e);
            self.raise_error(error.into());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::communication::tests::RecordingCommunication;
    use crate::definition::ChartDefinition;
    use crate::logger::tests::RecordingLogger;
    use crate::options::StateChangeObserver;
    use crate::persistence::{InMemoryStorage, StorageProvider};
    use async_trait::async_trait;
    use parking_lot::Mutex;
    use proptest::prelude::*;
    use serde_json::json;
    use std::collections::VecDeque;
    use tokio::sync::mpsc;
    use tokio_util::sync::CancellationToken;

    fn compile(chart: serde_json::Value) -> Arc<InterpreterModel> {
        Arc::new(ChartDefinition::from_json(&chart).unwrap().compile().unwrap())
    }

    fn event(name: &str) -> Event {
        Event::external(EventName::parse(name).unwrap())
    }

    async fn run_with(
        model: Arc<InterpreterModel>,
        options: InterpreterOptions,
        events: &[&str],
    ) -> (Interpreter, Result<ExitStatus, CoreError>) {
        let (tx, mut rx) = mpsc::unbounded_channel();
        for name in events {
            tx.send(event(name)).unwrap();
        }
        drop(tx);
        let mut interp = Interpreter::new(model, options);
        let result = interp.run(&mut rx).await;
        (interp, result)
    }

    #[derive(Default)]
    struct RecordingObserver {
        states: Mutex<Vec<InterpreterState>>,
    }

    impl StateChangeObserver for RecordingObserver {
        fn on_state_changed(&self, state: InterpreterState) {
            self.states.lock().push(state);
        }
    }

    /// Yields scripted events, then trips the token and waits forever.
    struct ScriptedSource {
        events: VecDeque<Event>,
        when_drained: CancellationToken,
    }

    #[async_trait]
    impl EventSource for ScriptedSource {
        async fn next_event(&mut self) -> Option<Event> {
            match self.events.pop_front() {
                Some(event) => Some(event),
                None => {
                    self.when_drained.cancel();
                    std::future::pending().await
                }
            }
        }
    }

    #[tokio::test]
    async fn test_single_final_completes() {
        let model = compile(json!({"states": [{"id": "end", "type": "final"}]}));
        let (interp, result) = run_with(model, InterpreterOptions::default(), &[]).await;
        assert_eq!(result.unwrap(), ExitStatus::Completed);
        assert!(interp.result().is_undefined());
        assert!(interp.is_done());
    }

    #[tokio::test]
    async fn test_done_data_becomes_result() {
        let model = compile(json!({
            "datamodel": [{"id": "count", "value": 0}],
            "states": [
                {"id": "work", "transitions": [
                    {"event": "add", "actions": [{"assign": {"location": "count", "expr": "count + 1"}}]},
                    {"event": "finish", "target": "end"}
                ]},
                {"id": "end", "type": "final", "donedata": {"expr": "count"}}
            ]
        }));
        let (interp, result) =
            run_with(model, InterpreterOptions::default(), &["add", "add", "finish"]).await;
        assert_eq!(result.unwrap(), ExitStatus::Completed);
        assert_eq!(interp.result(), &Value::Number(2.0));
    }

    #[tokio::test]
    async fn test_internal_events_before_external() {
        let model = compile(json!({
            "states": [
                {"id": "a", "transitions": [
                    {"event": "go", "target": "b", "actions": [{"raise": {"event": "x"}}]}
                ]},
                {"id": "b", "transitions": [
                    {"event": "x", "target": "c"},
                    {"event": "y", "target": "wrong"}
                ]},
                {"id": "c", "transitions": [{"event": "y", "target": "end"}]},
                {"id": "wrong"},
                {"id": "end", "type": "final"}
            ]
        }));
        let (_, result) = run_with(model, InterpreterOptions::default(), &["go", "y"]).await;
        assert_eq!(result.unwrap(), ExitStatus::Completed);
    }

    #[tokio::test]
    async fn test_shallow_history_restore() {
        let chart = json!({
            "initial": "h",
            "states": [
                {"id": "p",
                 "states": [
                    {"id": "h", "type": "history", "transitions": [{"target": "a"}]},
                    {"id": "a", "transitions": [{"event": "next", "target": "b"}]},
                    {"id": "b"}
                 ],
                 "transitions": [{"event": "out", "target": "q"}]},
                {"id": "q", "transitions": [{"event": "back", "target": "h"}]}
            ]
        });

        let (interp, _) = run_with(compile(chart.clone()), InterpreterOptions::default(), &[]).await;
        assert_eq!(interp.configuration(), vec!["p", "a"]);

        let (interp, result) = run_with(
            compile(chart),
            InterpreterOptions::default(),
            &["next", "out", "back"],
        )
        .await;
        assert_eq!(result.unwrap(), ExitStatus::QueueClosed);
        assert_eq!(interp.configuration(), vec!["p", "b"]);
    }

    #[tokio::test]
    async fn test_deep_history_restore() {
        let model = compile(json!({
            "states": [
                {"id": "p",
                 "states": [
                    {"id": "h", "type": "history", "history": "deep", "transitions": [{"target": "m"}]},
                    {"id": "m", "states": [
                        {"id": "m1", "transitions": [{"event": "next", "target": "m2"}]},
                        {"id": "m2"}
                    ]}
                 ],
                 "transitions": [{"event": "out", "target": "q"}]},
                {"id": "q", "transitions": [{"event": "back", "target": "h"}]}
            ]
        }));
        let (interp, _) =
            run_with(model, InterpreterOptions::default(), &["next", "out", "back"]).await;
        assert_eq!(interp.configuration(), vec!["p", "m", "m2"]);
    }

    #[tokio::test]
    async fn test_parallel_conflict_lower_document_id_wins() {
        let model = compile(json!({
            "datamodel": [{"id": "log", "value": ""}],
            "states": [
                {"id": "par", "type": "parallel", "states": [
                    {"id": "r1", "states": [{"id": "a1", "transitions": [
                        {"event": "e", "target": "x",
                         "actions": [{"assign": {"location": "log", "expr": "log + 'first'"}}]}
                    ]}]},
                    {"id": "r2", "states": [{"id": "a2", "transitions": [
                        {"event": "e", "target": "y",
                         "actions": [{"assign": {"location": "log", "expr": "log + 'second'"}}]}
                    ]}]}
                ]},
                {"id": "x"},
                {"id": "y"}
            ]
        }));
        let (interp, _) = run_with(model, InterpreterOptions::default(), &["e"]).await;
        assert_eq!(interp.configuration(), vec!["x"]);
        assert_eq!(interp.data_model().get("log").as_str(), Some("first"));
    }

    #[tokio::test]
    async fn test_parallel_regions_both_fire_without_conflict() {
        let model = compile(json!({
            "states": [
                {"id": "par", "type": "parallel", "states": [
                    {"id": "r1", "states": [
                        {"id": "a1", "transitions": [{"event": "e", "target": "b1"}]},
                        {"id": "b1"}
                    ]},
                    {"id": "r2", "states": [
                        {"id": "a2", "transitions": [{"event": "e", "target": "b2"}]},
                        {"id": "b2"}
                    ]}
                ]}
            ]
        }));
        let (interp, _) = run_with(model, InterpreterOptions::default(), &["e"]).await;
        assert_eq!(interp.configuration(), vec!["par", "r1", "b1", "r2", "b2"]);
    }

    #[tokio::test]
    async fn test_parallel_done_event() {
        let model = compile(json!({
            "states": [
                {"id": "par", "type": "parallel",
                 "states": [
                    {"id": "r1", "states": [{"id": "f1", "type": "final"}]},
                    {"id": "r2", "states": [
                        {"id": "w", "transitions": [{"event": "go", "target": "f2"}]},
                        {"id": "f2", "type": "final"}
                    ]}
                 ],
                 "transitions": [{"event": "done.state.par", "target": "end"}]},
                {"id": "end", "type": "final"}
            ]
        }));
        let (_, result) = run_with(model, InterpreterOptions::default(), &["go"]).await;
        assert_eq!(result.unwrap(), ExitStatus::Completed);
    }

    #[tokio::test]
    async fn test_eventless_loop_aborts_with_live_lock() {
        let model = compile(json!({"states": [{"id": "a", "transitions": [{"target": "a"}]}]}));
        let observer = Arc::new(RecordingObserver::default());
        let options = InterpreterOptions::default()
            .with_max_microsteps(10)
            .with_notifier(observer.clone());
        let (_, result) = run_with(model, options, &[]).await;
        assert!(matches!(result, Err(CoreError::LiveLock { limit: 10 })));
        assert_eq!(
            observer.states.lock().last(),
            Some(&InterpreterState::LiveLockAbort)
        );
    }

    #[tokio::test]
    async fn test_failing_eventless_guard_aborts_with_live_lock() {
        let model = compile(json!({
            "datamodel": [{"id": "x", "value": 1}],
            "states": [
                {"id": "a", "transitions": [{"cond": "x > 'text'", "target": "b"}]},
                {"id": "b", "type": "final"}
            ]
        }));
        let options = InterpreterOptions::default().with_max_microsteps(10);
        let (interp, result) = tokio::time::timeout(
            std::time::Duration::from_secs(5),
            run_with(model, options, &[]),
        )
        .await
        .unwrap();
        assert!(matches!(result, Err(CoreError::LiveLock { limit: 10 })));
        assert!(interp.is_in_state("a"));
    }

    #[tokio::test]
    async fn test_internal_event_ping_pong_aborts_with_live_lock() {
        let model = compile(json!({
            "states": [
                {"id": "ping",
                 "onentry": [{"raise": {"event": "ball"}}],
                 "transitions": [{"event": "ball", "target": "pong"}]},
                {"id": "pong",
                 "onentry": [{"raise": {"event": "ball"}}],
                 "transitions": [{"event": "ball", "target": "ping"}]}
            ]
        }));
        let options = InterpreterOptions::default().with_max_microsteps(25);
        let (_, result) = run_with(model, options, &[]).await;
        assert!(matches!(result, Err(CoreError::LiveLock { limit: 25 })));
    }

    #[tokio::test]
    async fn test_unhandled_internal_events_count_toward_bound() {
        let model = compile(json!({
            "states": [{"id": "a", "onentry": [
                {"raise": {"event": "e1"}},
                {"raise": {"event": "e2"}},
                {"raise": {"event": "e3"}}
            ]}]
        }));
        let roomy = InterpreterOptions::default().with_max_microsteps(10);
        let (_, result) = run_with(Arc::clone(&model), roomy, &[]).await;
        assert_eq!(result.unwrap(), ExitStatus::QueueClosed);

        let tight = InterpreterOptions::default().with_max_microsteps(2);
        let (_, result) = run_with(model, tight, &[]).await;
        assert!(matches!(result, Err(CoreError::LiveLock { limit: 2 })));
    }

    #[tokio::test]
    async fn test_bad_assign_raises_error_execution() {
        let model = compile(json!({
            "states": [
                {"id": "a",
                 "onentry": [{"assign": {"location": "nowhere", "value": 1}}],
                 "transitions": [{"event": "error.execution", "target": "failed"}]},
                {"id": "failed", "type": "final", "donedata": {"expr": "_event.data.message"}}
            ]
        }));
        let (interp, result) = run_with(model, InterpreterOptions::default(), &[]).await;
        assert_eq!(result.unwrap(), ExitStatus::Completed);
        assert!(interp
            .result()
            .as_str()
            .is_some_and(|m| m.contains("nowhere")));
    }

    #[tokio::test]
    async fn test_guard_error_counts_as_false() {
        let model = compile(json!({
            "datamodel": [{"id": "x", "value": 1}],
            "states": [
                {"id": "a", "transitions": [
                    {"event": "go", "cond": "x > 'text'", "target": "bad"},
                    {"event": "go", "target": "b"}
                ]},
                {"id": "b", "transitions": [{"event": "error.execution", "target": "end"}]},
                {"id": "bad"},
                {"id": "end", "type": "final"}
            ]
        }));
        let (_, result) = run_with(model, InterpreterOptions::default(), &["go"]).await;
        assert_eq!(result.unwrap(), ExitStatus::Completed);
    }

    #[tokio::test]
    async fn test_failed_send_raises_error_communication() {
        let model = compile(json!({
            "states": [
                {"id": "a",
                 "onentry": [{"send": {"event": "ping", "target": "#_unreachable", "id": "s1"}}],
                 "transitions": [{"event": "error.communication", "cond": "_event.sendid == 's1'", "target": "end"}]},
                {"id": "end", "type": "final"}
            ]
        }));
        let comm = Arc::new(RecordingCommunication::default());
        let options = InterpreterOptions::default().with_communication(comm.clone());
        let (_, result) = run_with(model, options, &[]).await;
        assert_eq!(result.unwrap(), ExitStatus::Completed);
        assert!(comm.sent.lock().is_empty());
    }

    #[tokio::test]
    async fn test_failing_trace_sink_raises_platform_error() {
        struct BrokenTrace;
        impl crate::logger::InterpreterLogger for BrokenTrace {
            fn is_tracing_enabled(&self) -> bool {
                true
            }
            fn trace(&self, _: &LogContext, record: TraceRecord<'_>) -> Result<(), crate::error::BoxError> {
                match record {
                    TraceRecord::EnteredState("a") => Err("trace sink down".into()),
                    _ => Ok(()),
                }
            }
            fn log(&self, _: &LogContext, _: Option<&str>, _: &Value) -> Result<(), crate::error::BoxError> {
                Ok(())
            }
            fn error(&self, _: &LogContext, _: &str) -> Result<(), crate::error::BoxError> {
                Ok(())
            }
        }

        let model = compile(json!({
            "states": [
                {"id": "a", "transitions": [{"event": "error.platform", "target": "end"}]},
                {"id": "end", "type": "final", "donedata": {"expr": "_event.data.message"}}
            ]
        }));
        let options = InterpreterOptions::new(SessionId::new("s-9")).with_logger(Arc::new(BrokenTrace));
        let (interp, result) = run_with(model, options, &[]).await;
        assert_eq!(result.unwrap(), ExitStatus::Completed);
        assert_eq!(
            interp.result().as_str(),
            Some("platform error in session s-9: trace sink down")
        );
    }

    #[tokio::test]
    async fn test_trace_order() {
        let model = compile(json!({
            "states": [
                {"id": "a", "transitions": [{"event": "go", "target": "b"}]},
                {"id": "b"}
            ]
        }));
        let logger = Arc::new(RecordingLogger {
            tracing: true,
            ..Default::default()
        });
        let options = InterpreterOptions::default().with_logger(logger.clone());
        run_with(model, options, &["go"]).await.1.unwrap();
        assert_eq!(
            *logger.lines.lock(),
            vec!["entered a", "exited a", "transition go -> b", "entered b"]
        );
    }

    #[tokio::test]
    async fn test_notifications() {
        let model = compile(json!({"states": [{"id": "a"}]}));
        let observer = Arc::new(RecordingObserver::default());
        let options = InterpreterOptions::default().with_notifier(observer.clone());
        let (_, result) = run_with(model, options, &[]).await;
        assert_eq!(result.unwrap(), ExitStatus::QueueClosed);
        assert_eq!(
            *observer.states.lock(),
            vec![
                InterpreterState::Started,
                InterpreterState::Accepted,
                InterpreterState::Waiting,
                InterpreterState::QueueClosed
            ]
        );
    }

    #[tokio::test]
    async fn test_arguments_override_data() {
        let model = compile(json!({
            "datamodel": [{"id": "limit", "value": 3}, {"id": "name", "value": "x"}],
            "states": [{"id": "a"}]
        }));
        let args = Object::new();
        args.set("limit", 10.0).unwrap();
        let options = InterpreterOptions::default().with_arguments(args);
        let (interp, _) = run_with(model, options, &[]).await;
        assert_eq!(interp.data_model().get("limit"), Value::Number(10.0));
        assert_eq!(interp.data_model().get("name").as_str(), Some("x"));
    }

    #[tokio::test]
    async fn test_invoke_lifecycle() {
        let model = compile(json!({
            "datamodel": [{"id": "replies", "value": 0}],
            "states": [
                {"id": "busy",
                 "invoke": [{"id": "svc", "type": "scxml", "src": "child", "autoforward": true,
                             "finalize": [{"assign": {"location": "replies", "expr": "replies + 1"}}]}],
                 "transitions": [{"event": "stop", "target": "idle"}]},
                {"id": "idle"}
            ]
        }));
        let comm = Arc::new(RecordingCommunication::default());
        let options = InterpreterOptions::default().with_communication(comm.clone());

        let (tx, mut rx) = mpsc::unbounded_channel();
        tx.send(event("poke")).unwrap();
        tx.send(event("reply").with_invoke(crate::ident::InvokeId::new("svc"), "u"))
            .unwrap();
        tx.send(event("stop")).unwrap();
        drop(tx);

        let mut interp = Interpreter::new(model, options);
        assert_eq!(interp.run(&mut rx).await.unwrap(), ExitStatus::QueueClosed);

        let invoked = comm.invoked.lock();
        assert_eq!(invoked.len(), 1);
        assert_eq!(invoked[0].invoke_id.as_str(), "svc");
        assert_eq!(invoked[0].source.as_deref(), Some("child"));

        let forwarded = comm.forwarded.lock();
        let names: Vec<String> = forwarded.iter().map(|(_, e)| e.name.to_string()).collect();
        assert_eq!(names, vec!["poke", "stop"]);

        assert_eq!(comm.invoke_cancelled.lock().len(), 1);
        assert_eq!(interp.data_model().get("replies"), Value::Number(1.0));
        assert!(interp.context().invocations.is_empty());
    }

    #[tokio::test]
    async fn test_destroy_cancels_invocations() {
        let model = compile(json!({
            "states": [{"id": "busy", "invoke": [{"id": "svc", "src": "child"}]}]
        }));
        let comm = Arc::new(RecordingCommunication::default());
        let destroy = CancellationToken::new();
        let options = InterpreterOptions::default()
            .with_communication(comm.clone())
            .with_tokens(destroy.clone(), CancellationToken::new());

        let mut source = ScriptedSource {
            events: VecDeque::new(),
            when_drained: destroy,
        };
        let mut interp = Interpreter::new(model, options);
        assert_eq!(interp.run(&mut source).await.unwrap(), ExitStatus::Destroyed);
        assert_eq!(comm.invoke_cancelled.lock().len(), 1);
    }

    #[tokio::test]
    async fn test_suspend_snapshot_and_resume() {
        let chart = json!({
            "datamodel": [{"id": "hits", "value": 0}, {"id": "note"}],
            "states": [
                {"id": "p",
                 "states": [
                    {"id": "h", "type": "history", "transitions": [{"target": "a"}]},
                    {"id": "a", "transitions": [{"event": "next", "target": "b"}]},
                    {"id": "b"}
                 ],
                 "transitions": [
                    {"event": "hit", "actions": [{"assign": {"location": "hits", "expr": "hits + 1"}}]},
                    {"event": "out", "target": "q"}
                 ]},
                {"id": "q", "transitions": [{"event": "back", "target": "h"}]}
            ]
        });
        let model = compile(chart);
        let storage = Arc::new(InMemoryStorage::new());
        let suspend = CancellationToken::new();
        let options = InterpreterOptions::new(SessionId::new("sess-1"))
            .with_storage(storage.clone())
            .with_tokens(CancellationToken::new(), suspend.clone());

        let mut source = ScriptedSource {
            events: ["hit", "next", "out"].into_iter().map(event).collect(),
            when_drained: suspend,
        };
        let mut interp = Interpreter::new(Arc::clone(&model), options);
        assert_eq!(interp.run(&mut source).await.unwrap(), ExitStatus::Suspended);
        assert_eq!(interp.configuration(), vec!["q"]);

        let bucket = storage.load_bucket("sess-1").unwrap().unwrap();
        let options = InterpreterOptions::new(SessionId::new("sess-1"));
        let mut resumed = Interpreter::resume(model, options, &bucket).unwrap();
        assert_eq!(resumed.data_model().get("hits"), Value::Number(1.0));
        assert!(resumed.data_model().contains("note"));

        let (tx, mut rx) = mpsc::unbounded_channel();
        tx.send(event("back")).unwrap();
        drop(tx);
        assert_eq!(resumed.run(&mut rx).await.unwrap(), ExitStatus::QueueClosed);
        assert_eq!(resumed.configuration(), vec!["p", "b"]);
        assert_eq!(
            resumed.data_model().get("_sessionid").as_str(),
            Some("sess-1")
        );
    }

    fn is_legal(interp: &Interpreter) -> bool {
        let model = interp.model();
        let conf = &interp.context().configuration;
        conf.iter().all(|&s| {
            let parent_ok = match model.state(s).parent {
                Some(p) if p != ROOT => conf.contains(&p),
                _ => true,
            };
            let children_ok = if model.is_parallel(s) {
                model.child_states(s).all(|c| conf.contains(&c))
            } else if model.is_compound(s) {
                model.child_states(s).filter(|c| conf.contains(c)).count() == 1
            } else {
                true
            };
            parent_ok && children_ok
        })
    }

    proptest! {
        #[test]
        fn prop_configuration_stays_legal(events in proptest::collection::vec(0usize..5, 0..16)) {
            let model = compile(json!({
                "states": [
                    {"id": "main", "states": [
                        {"id": "idle", "transitions": [
                            {"event": "e1", "target": "work"},
                            {"event": "e2", "target": "par"}
                        ]},
                        {"id": "work", "transitions": [
                            {"event": "e1", "target": "idle"},
                            {"event": "e3", "target": "r2b"}
                        ]},
                        {"id": "par", "type": "parallel", "states": [
                            {"id": "r1", "states": [
                                {"id": "r1a", "transitions": [{"event": "e1", "target": "r1b"}]},
                                {"id": "r1b", "transitions": [{"event": "e2", "target": "r1a"}]}
                            ]},
                            {"id": "r2", "states": [
                                {"id": "r2a", "transitions": [{"event": "e3", "target": "r2b"}]},
                                {"id": "r2b", "transitions": [
                                    {"event": "e3", "target": "r2a"},
                                    {"event": "e4", "target": "idle"}
                                ]}
                            ]}
                        ]}
                    ]}
                ]
            }));
            let names = ["e1", "e2", "e3", "e4", "unknown"];
            let picked: Vec<&str> = events.iter().map(|i| names[*i]).collect();

            let (interp, result) =
                tokio_test::block_on(run_with(model, InterpreterOptions::default(), &picked));
            prop_assert_eq!(result.unwrap(), ExitStatus::QueueClosed);
            prop_assert!(is_legal(&interp));
        }
    }
}
