//! The compiled, immutable state graph.
//!
//! States live in an arena indexed by [`StateIdx`] in document (pre-)order, so
//! comparing two indices compares document positions. Index 0 is the synthetic
//! root that stands for the chart itself; it is never part of the configuration.

use crate::expr::Expr;
use crate::ident::{EventDescriptor, EventName, Identifier, InvokeId, SendId};
use crate::persistence::{Bucket, Key, StoreSupport, TypeInfo};
use rscx_value::Object;
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

/// Index of a state in [`InterpreterModel::states`].
pub type StateIdx = usize;

/// Index of a transition in [`InterpreterModel::transitions`].
pub type TransitionIdx = usize;

/// Compile-time document position shared by states, transitions and invokes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct DocumentId(pub u32);

impl fmt::Display for DocumentId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HistoryKind {
    Shallow,
    Deep,
}

/// The closed set of state node kinds.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StateKind {
    /// Atomic if it has no child states, compound otherwise.
    State,
    Parallel,
    Final,
    History(HistoryKind),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum TransitionKind {
    #[default]
    External,
    Internal,
}

impl fmt::Display for TransitionKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TransitionKind::External => write!(f, "external"),
            TransitionKind::Internal => write!(f, "internal"),
        }
    }
}

/// A host-supplied executable content element.
pub trait CustomAction: Send + Sync + fmt::Debug {
    /// Runs against the session data model. Errors raise `error.execution`.
    fn execute(&self, data_model: &Object) -> Result<(), crate::error::ExecutionError>;
}

/// A `<param>`: `name` bound to the value of `expr`.
#[derive(Debug, Clone)]
pub struct Param {
    pub name: String,
    pub expr: Expr,
}

/// A `<send>` element.
#[derive(Debug, Clone, Default)]
pub struct SendAction {
    pub event: Option<EventName>,
    pub event_expr: Option<Expr>,
    pub target: Option<String>,
    pub target_expr: Option<Expr>,
    pub event_type: Option<String>,
    pub id: Option<SendId>,
    pub id_location: Option<Vec<String>>,
    pub delay: Option<Duration>,
    pub delay_expr: Option<Expr>,
    pub params: Vec<Param>,
    pub content: Option<Expr>,
}

/// One `if`/`elseif`/`else` arm. `condition == None` is the `else` arm.
#[derive(Debug, Clone)]
pub struct Branch {
    pub condition: Option<Expr>,
    pub actions: Vec<Action>,
}

/// Executable content.
#[derive(Debug, Clone)]
pub enum Action {
    Raise {
        event: EventName,
    },
    Send(Box<SendAction>),
    Cancel {
        send_id: Option<SendId>,
        send_id_expr: Option<Expr>,
    },
    Log {
        label: Option<String>,
        expr: Option<Expr>,
    },
    Assign {
        location: Vec<String>,
        expr: Expr,
    },
    If {
        branches: Vec<Branch>,
    },
    Foreach {
        array: Expr,
        item: Vec<String>,
        index: Option<Vec<String>>,
        actions: Vec<Action>,
    },
    Custom {
        name: String,
        action: Arc<dyn CustomAction>,
    },
}

/// A `<data>` declaration.
#[derive(Debug, Clone)]
pub struct DataNode {
    pub id: String,
    pub expr: Option<Expr>,
}

/// An `<invoke>` element.
#[derive(Debug, Clone)]
pub struct InvokeNode {
    pub document_id: DocumentId,
    pub invoke_type: Option<String>,
    pub src: Option<String>,
    pub src_expr: Option<Expr>,
    pub id: Option<InvokeId>,
    pub id_location: Option<Vec<String>>,
    pub params: Vec<Param>,
    pub content: Option<Expr>,
    pub autoforward: bool,
    pub finalize: Vec<Action>,
}

#[derive(Debug, Clone)]
pub struct StateNode {
    pub id: Identifier,
    pub document_id: DocumentId,
    pub kind: StateKind,
    pub parent: Option<StateIdx>,
    pub children: Vec<StateIdx>,
    /// Selectable transitions in document order.
    pub transitions: Vec<TransitionIdx>,
    /// Initial transition of a compound state, or default transition of a history state.
    pub initial: Option<TransitionIdx>,
    pub on_entry: Vec<Action>,
    pub on_exit: Vec<Action>,
    pub invokes: Vec<InvokeNode>,
    pub datamodel: Vec<DataNode>,
    pub done_data: Option<Expr>,
}

#[derive(Debug, Clone)]
pub struct TransitionNode {
    pub document_id: DocumentId,
    pub source: StateIdx,
    /// Empty for eventless transitions.
    pub events: Vec<EventDescriptor>,
    pub condition: Option<Expr>,
    pub targets: Vec<StateIdx>,
    pub kind: TransitionKind,
    pub actions: Vec<Action>,
}

impl TransitionNode {
    pub fn is_eventless(&self) -> bool {
        self.events.is_empty()
    }

    pub fn is_targetless(&self) -> bool {
        self.targets.is_empty()
    }

    /// Space-separated descriptor text, as used in traces.
    pub fn event_text(&self) -> String {
        self.events
            .iter()
            .map(ToString::to_string)
            .collect::<Vec<_>>()
            .join(" ")
    }
}

/// The compiled chart consumed read-only by the interpreter.
#[derive(Debug)]
pub struct InterpreterModel {
    pub name: Option<String>,
    pub states: Vec<StateNode>,
    pub transitions: Vec<TransitionNode>,
    pub checksum: String,
    by_id: HashMap<Identifier, StateIdx>,
    by_document_id: HashMap<DocumentId, StateIdx>,
}

/// Index of the synthetic root.
pub const ROOT: StateIdx = 0;

impl InterpreterModel {
    pub(crate) fn new(
        name: Option<String>,
        states: Vec<StateNode>,
        transitions: Vec<TransitionNode>,
        checksum: String,
    ) -> Self {
        let by_id = states
            .iter()
            .enumerate()
            .map(|(idx, s)| (s.id.clone(), idx))
            .collect();
        let by_document_id = states
            .iter()
            .enumerate()
            .map(|(idx, s)| (s.document_id, idx))
            .collect();
        Self {
            name,
            states,
            transitions,
            checksum,
            by_id,
            by_document_id,
        }
    }

    pub fn state(&self, idx: StateIdx) -> &StateNode {
        &self.states[idx]
    }

    pub fn transition(&self, idx: TransitionIdx) -> &TransitionNode {
        &self.transitions[idx]
    }

    pub fn state_by_id(&self, id: &str) -> Option<StateIdx> {
        Identifier::new(id)
            .ok()
            .and_then(|id| self.by_id.get(&id).copied())
    }

    pub fn state_by_document_id(&self, document_id: DocumentId) -> Option<StateIdx> {
        self.by_document_id.get(&document_id).copied()
    }

    /// Number of user-declared states (the synthetic root is not counted).
    pub fn state_count(&self) -> usize {
        self.states.len() - 1
    }

    pub fn is_history(&self, idx: StateIdx) -> bool {
        matches!(self.states[idx].kind, StateKind::History(_))
    }

    pub fn is_parallel(&self, idx: StateIdx) -> bool {
        self.states[idx].kind == StateKind::Parallel
    }

    pub fn is_final(&self, idx: StateIdx) -> bool {
        self.states[idx].kind == StateKind::Final
    }

    /// Child states excluding history pseudo-states.
    pub fn child_states(&self, idx: StateIdx) -> impl Iterator<Item = StateIdx> + '_ {
        self.states[idx]
            .children
            .iter()
            .copied()
            .filter(move |c| !self.is_history(*c))
    }

    pub fn history_children(&self, idx: StateIdx) -> impl Iterator<Item = StateIdx> + '_ {
        self.states[idx]
            .children
            .iter()
            .copied()
            .filter(move |c| self.is_history(*c))
    }

    pub fn is_compound(&self, idx: StateIdx) -> bool {
        self.states[idx].kind == StateKind::State && self.child_states(idx).next().is_some()
    }

    pub fn is_atomic(&self, idx: StateIdx) -> bool {
        match self.states[idx].kind {
            StateKind::Final => true,
            StateKind::State => self.child_states(idx).next().is_none(),
            StateKind::Parallel | StateKind::History(_) => false,
        }
    }

    /// Proper ancestors from the parent upwards, stopping before `upto`.
    pub fn proper_ancestors(&self, idx: StateIdx, upto: Option<StateIdx>) -> Vec<StateIdx> {
        let mut out = Vec::new();
        let mut current = self.states[idx].parent;
        while let Some(p) = current {
            if Some(p) == upto {
                break;
            }
            out.push(p);
            current = self.states[p].parent;
        }
        out
    }

    /// True if `idx` is a proper descendant of `ancestor`.
    pub fn is_descendant(&self, idx: StateIdx, ancestor: StateIdx) -> bool {
        let mut current = self.states[idx].parent;
        while let Some(p) = current {
            if p == ancestor {
                return true;
            }
            current = self.states[p].parent;
        }
        false
    }
}

impl StoreSupport for StateNode {
    fn store(&self, bucket: &mut Bucket) {
        let type_info = match self.kind {
            StateKind::State => TypeInfo::StateNode,
            StateKind::Parallel => TypeInfo::ParallelNode,
            StateKind::Final => TypeInfo::FinalNode,
            StateKind::History(_) => TypeInfo::HistoryNode,
        };
        bucket.add(Key::TypeInfo, type_info);
        bucket.add(Key::DocumentId, self.document_id.0);
        bucket.add(Key::Id, self.id.as_str());
    }
}

impl StoreSupport for TransitionNode {
    fn store(&self, bucket: &mut Bucket) {
        bucket.add(Key::TypeInfo, TypeInfo::TransitionNode);
        bucket.add(Key::DocumentId, self.document_id.0);
    }
}

impl StoreSupport for InvokeNode {
    fn store(&self, bucket: &mut Bucket) {
        bucket.add(Key::TypeInfo, TypeInfo::InvokeNode);
        bucket.add(Key::DocumentId, self.document_id.0);
    }
}

impl InterpreterModel {
    /// Stores the state subtree rooted at `idx`, children nested recursively.
    pub fn store_state(&self, idx: StateIdx, bucket: &mut Bucket) {
        let state = &self.states[idx];
        state.store(bucket);

        let mut transitions = Bucket::new();
        for (i, t) in state.transitions.iter().enumerate() {
            let mut tb = Bucket::new();
            self.transitions[*t].store(&mut tb);
            transitions.set_nested(Key::Index(i), tb);
        }
        bucket.set_nested(Key::Transitions, transitions);

        let mut invokes = Bucket::new();
        for (i, inv) in state.invokes.iter().enumerate() {
            let mut ib = Bucket::new();
            inv.store(&mut ib);
            invokes.set_nested(Key::Index(i), ib);
        }
        bucket.set_nested(Key::Invokes, invokes);

        let mut children = Bucket::new();
        for (i, child) in state.children.iter().enumerate() {
            let mut cb = Bucket::new();
            self.store_state(*child, &mut cb);
            children.set_nested(Key::Index(i), cb);
        }
        bucket.set_nested(Key::Children, children);
    }
}

impl StoreSupport for InterpreterModel {
    fn store(&self, bucket: &mut Bucket) {
        bucket.add(Key::TypeInfo, TypeInfo::Model);
        if let Some(name) = &self.name {
            bucket.add(Key::Name, name.as_str());
        }
        bucket.add(Key::Checksum, self.checksum.as_str());
        let mut root = Bucket::new();
        self.store_state(ROOT, &mut root);
        bucket.set_nested(Key::Root, root);
    }
}
