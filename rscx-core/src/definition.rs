//! Chart definition DSL.
//!
//! Charts are described as JSON and compiled into an [`InterpreterModel`]:
//!
//! ```json
//! {
//!   "name": "door",
//!   "initial": "closed",
//!   "datamodel": [{"id": "opens", "expr": "0"}],
//!   "states": [
//!     {"id": "closed", "transitions": [
//!       {"event": "open", "target": "opened", "cond": "!locked",
//!        "actions": [{"assign": {"location": "opens", "expr": "opens + 1"}}]}
//!     ]},
//!     {"id": "opened", "transitions": [{"event": "close", "target": "closed"}]},
//!     {"id": "gone", "type": "final"}
//!   ]
//! }
//! ```
//!
//! Document ids are assigned in pre-order: a state, then its transitions, then
//! its invokes, then its children.

use crate::error::CoreError;
use crate::expr::Expr;
use crate::ident::{EventDescriptor, EventName, Identifier, InvokeId, SendId};
use crate::model::{
    Action, Branch, CustomAction, DataNode, DocumentId, HistoryKind, InterpreterModel, InvokeNode,
    Param, SendAction, StateIdx, StateKind, StateNode, TransitionKind, TransitionNode, ROOT,
};
use rscx_value::Value;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

/// A list written either as a space-separated string or a JSON array.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TokenList(#[serde(deserialize_with = "deserialize_tokens")] pub Vec<String>);

fn deserialize_tokens<'de, D>(deserializer: D) -> Result<Vec<String>, D::Error>
where
    D: serde::Deserializer<'de>,
{
    use serde::de::{self, Visitor};
    use std::fmt;

    struct TokensVisitor;

    impl<'de> Visitor<'de> for TokensVisitor {
        type Value = Vec<String>;

        fn expecting(&self, formatter: &mut fmt::Formatter) -> fmt::Result {
            formatter.write_str("a string or array of strings")
        }

        fn visit_str<E>(self, v: &str) -> Result<Self::Value, E>
        where
            E: de::Error,
        {
            Ok(v.split_whitespace().map(str::to_string).collect())
        }

        fn visit_seq<A>(self, mut seq: A) -> Result<Self::Value, A::Error>
        where
            A: de::SeqAccess<'de>,
        {
            let mut tokens = Vec::new();
            while let Some(s) = seq.next_element::<String>()? {
                tokens.push(s);
            }
            Ok(tokens)
        }
    }

    deserializer.deserialize_any(TokensVisitor)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StateType {
    #[default]
    State,
    Parallel,
    Final,
    History,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HistoryType {
    #[default]
    Shallow,
    Deep,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TransitionType {
    #[default]
    External,
    Internal,
}

/// `{"id": "...", "expr": "..."}` or `{"id": "...", "value": <json>}`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DataDef {
    pub id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub expr: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub value: Option<serde_json::Value>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ParamDef {
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub expr: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub value: Option<serde_json::Value>,
}

/// A value given either as an expression or a JSON literal.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ValueDef {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub expr: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub value: Option<serde_json::Value>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SendDef {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub event: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub eventexpr: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub target: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub targetexpr: Option<String>,
    #[serde(default, rename = "type", skip_serializing_if = "Option::is_none")]
    pub send_type: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub idlocation: Option<String>,
    /// Milliseconds as a number, or a duration string like `"250ms"` or `"2s"`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub delay: Option<serde_json::Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub delayexpr: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub params: Vec<ParamDef>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub content: Option<ValueDef>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ElseIfDef {
    pub cond: String,
    #[serde(default)]
    pub actions: Vec<ActionDef>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IfDef {
    pub cond: String,
    #[serde(default)]
    pub actions: Vec<ActionDef>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub elseif: Vec<ElseIfDef>,
    #[serde(default, rename = "else", skip_serializing_if = "Option::is_none")]
    pub else_actions: Option<Vec<ActionDef>>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ForeachDef {
    pub array: String,
    pub item: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub index: Option<String>,
    #[serde(default)]
    pub actions: Vec<ActionDef>,
}

/// Executable content element.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ActionDef {
    Raise {
        event: String,
    },
    Send(SendDef),
    Cancel {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        sendid: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        sendidexpr: Option<String>,
    },
    Log {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        label: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        expr: Option<String>,
    },
    Assign {
        location: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        expr: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        value: Option<serde_json::Value>,
    },
    If(IfDef),
    Foreach(ForeachDef),
    Custom {
        name: String,
        #[serde(default)]
        args: serde_json::Value,
    },
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TransitionDef {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub event: Option<TokenList>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cond: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub target: Option<TokenList>,
    #[serde(default, rename = "type")]
    pub transition_type: TransitionType,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub actions: Vec<ActionDef>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct InvokeDef {
    #[serde(default, rename = "type", skip_serializing_if = "Option::is_none")]
    pub invoke_type: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub src: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub srcexpr: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub idlocation: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub params: Vec<ParamDef>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub content: Option<ValueDef>,
    #[serde(default)]
    pub autoforward: bool,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub finalize: Vec<ActionDef>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct StateDef {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    #[serde(default, rename = "type")]
    pub state_type: StateType,
    /// Only for `"type": "history"`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub history: Option<HistoryType>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub initial: Option<TokenList>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub states: Vec<StateDef>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub transitions: Vec<TransitionDef>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub onentry: Vec<ActionDef>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub onexit: Vec<ActionDef>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub invoke: Vec<InvokeDef>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub datamodel: Vec<DataDef>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub donedata: Option<ValueDef>,
}

/// Raw chart definition as stored/transmitted.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ChartDefinition {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub initial: Option<TokenList>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub datamodel: Vec<DataDef>,
    pub states: Vec<StateDef>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub meta: Option<serde_json::Value>,
}

impl ChartDefinition {
    pub fn from_json(json: &serde_json::Value) -> Result<Self, CoreError> {
        Ok(serde_json::from_value(json.clone())?)
    }

    pub fn from_json_str(text: &str) -> Result<Self, CoreError> {
        Ok(serde_json::from_str(text)?)
    }

    /// crc32c of the canonical JSON encoding.
    pub fn checksum(&self) -> Result<String, CoreError> {
        let json_bytes = serde_json::to_vec(self)?;
        Ok(format!("{:08x}", crc32c::crc32c(&json_bytes)))
    }

    /// Compiles with no custom actions registered.
    pub fn compile(&self) -> Result<InterpreterModel, CoreError> {
        ModelBuilder::new().build(self)
    }
}

/// Builds custom actions from their definition arguments.
pub type CustomActionFactory =
    Arc<dyn Fn(&serde_json::Value) -> Result<Arc<dyn CustomAction>, CoreError> + Send + Sync>;

/// Compiles [`ChartDefinition`]s, resolving custom actions by name.
#[derive(Default, Clone)]
pub struct ModelBuilder {
    custom: HashMap<String, CustomActionFactory>,
}

impl ModelBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn custom_action(mut self, name: impl Into<String>, factory: CustomActionFactory) -> Self {
        self.custom.insert(name.into(), factory);
        self
    }

    /// Validates and compiles a definition.
    pub fn build(&self, def: &ChartDefinition) -> Result<InterpreterModel, CoreError> {
        if def.states.is_empty() {
            return Err(CoreError::definition("chart has no states"));
        }

        let mut compiler = Compiler {
            builder: self,
            states: Vec::new(),
            transitions: Vec::new(),
            pending: Vec::new(),
            next_doc: 0,
            generated: 0,
        };

        let root_def = StateDef {
            id: Some(ROOT_ID.to_string()),
            initial: def.initial.clone(),
            states: def.states.clone(),
            datamodel: def.datamodel.clone(),
            ..StateDef::default()
        };
        compiler.add_state(&root_def, None)?;
        let model_states = compiler.resolve()?;

        let checksum = def.checksum()?;
        let model = InterpreterModel::new(
            def.name.clone(),
            model_states,
            compiler.transitions,
            checksum,
        );
        validate(&model)?;

        tracing::debug!(
            "Compiled chart {}: {} states, {} transitions",
            def.name.as_deref().unwrap_or("<unnamed>"),
            model.state_count(),
            model.transitions.len()
        );

        Ok(model)
    }
}

/// Id of the synthetic root state.
pub const ROOT_ID: &str = "$scxml";

/// Targets are resolved after all ids are known.
struct PendingTargets {
    transition: usize,
    targets: Vec<String>,
}

struct Compiler<'a> {
    builder: &'a ModelBuilder,
    states: Vec<StateNode>,
    transitions: Vec<TransitionNode>,
    pending: Vec<PendingTargets>,
    next_doc: u32,
    generated: u32,
}

impl<'a> Compiler<'a> {
    fn doc_id(&mut self) -> DocumentId {
        let id = DocumentId(self.next_doc);
        self.next_doc += 1;
        id
    }

    fn add_state(&mut self, def: &StateDef, parent: Option<StateIdx>) -> Result<StateIdx, CoreError> {
        let idx = self.states.len();
        let document_id = self.doc_id();

        let id = match &def.id {
            Some(id) => Identifier::new(id)?,
            None => {
                self.generated += 1;
                Identifier::new(format!("$generated-{}", self.generated))?
            }
        };

        let kind = match def.state_type {
            StateType::State => StateKind::State,
            StateType::Parallel => StateKind::Parallel,
            StateType::Final => StateKind::Final,
            StateType::History => StateKind::History(match def.history.unwrap_or_default() {
                HistoryType::Shallow => HistoryKind::Shallow,
                HistoryType::Deep => HistoryKind::Deep,
            }),
        };

        if def.history.is_some() && def.state_type != StateType::History {
            return Err(CoreError::definition(format!(
                "state '{}' sets 'history' but is not a history state",
                id
            )));
        }

        match kind {
            StateKind::Final | StateKind::History(_) if !def.states.is_empty() => {
                return Err(CoreError::definition(format!(
                    "state '{}' cannot have child states",
                    id
                )));
            }
            StateKind::Final if !def.transitions.is_empty() => {
                return Err(CoreError::definition(format!(
                    "final state '{}' cannot have transitions",
                    id
                )));
            }
            StateKind::History(_) if def.transitions.len() > 1 => {
                return Err(CoreError::definition(format!(
                    "history state '{}' has more than one default transition",
                    id
                )));
            }
            _ => {}
        }

        if def.initial.is_some() && (kind != StateKind::State || def.states.is_empty()) {
            return Err(CoreError::definition(format!(
                "'initial' is only allowed on compound states ('{}')",
                id
            )));
        }

        let node = StateNode {
            id,
            document_id,
            kind,
            parent,
            children: Vec::new(),
            transitions: Vec::new(),
            initial: None,
            on_entry: self.actions(&def.onentry)?,
            on_exit: self.actions(&def.onexit)?,
            invokes: Vec::new(),
            datamodel: def
                .datamodel
                .iter()
                .map(|d| {
                    Ok(DataNode {
                        id: d.id.clone(),
                        expr: self.value_expr(d.expr.as_deref(), d.value.as_ref())?,
                    })
                })
                .collect::<Result<_, CoreError>>()?,
            done_data: match &def.donedata {
                Some(v) => self.value_expr(v.expr.as_deref(), v.value.as_ref())?,
                None => None,
            },
        };
        self.states.push(node);

        // Transitions. A history state's only transition is its default.
        for t in &def.transitions {
            let t_idx = self.add_transition(idx, t)?;
            if matches!(kind, StateKind::History(_)) {
                if !self.transitions[t_idx].events.is_empty()
                    || self.transitions[t_idx].condition.is_some()
                {
                    return Err(CoreError::definition(format!(
                        "history state '{}' default transition cannot have event or cond",
                        self.states[idx].id
                    )));
                }
                self.states[idx].initial = Some(t_idx);
            } else {
                self.states[idx].transitions.push(t_idx);
            }
        }

        for inv in &def.invoke {
            let node = self.invoke(inv)?;
            self.states[idx].invokes.push(node);
        }

        for child in &def.states {
            let child_idx = self.add_state(child, Some(idx))?;
            self.states[idx].children.push(child_idx);
        }

        // Initial transition of a compound state: explicit or first child in document order.
        if kind == StateKind::State && !def.states.is_empty() {
            let targets = match &def.initial {
                Some(list) => list.0.clone(),
                None => {
                    let first = self.states[idx]
                        .children
                        .iter()
                        .copied()
                        .find(|c| !matches!(self.states[*c].kind, StateKind::History(_)))
                        .ok_or_else(|| {
                            CoreError::definition(format!(
                                "state '{}' has only history children",
                                self.states[idx].id
                            ))
                        })?;
                    vec![self.states[first].id.to_string()]
                }
            };
            let t_idx = self.transitions.len();
            let document_id = self.doc_id();
            self.transitions.push(TransitionNode {
                document_id,
                source: idx,
                events: Vec::new(),
                condition: None,
                targets: Vec::new(),
                kind: TransitionKind::Internal,
                actions: Vec::new(),
            });
            self.pending.push(PendingTargets {
                transition: t_idx,
                targets,
            });
            self.states[idx].initial = Some(t_idx);
        }

        if let StateKind::History(_) = kind {
            if self.states[idx].initial.is_none() {
                return Err(CoreError::definition(format!(
                    "history state '{}' needs a default transition",
                    self.states[idx].id
                )));
            }
        }

        Ok(idx)
    }

    fn add_transition(&mut self, source: StateIdx, def: &TransitionDef) -> Result<usize, CoreError> {
        let document_id = self.doc_id();
        let events = match &def.event {
            Some(list) => list
                .0
                .iter()
                .map(|e| EventDescriptor::parse(e))
                .collect::<Result<Vec<_>, _>>()?,
            None => Vec::new(),
        };
        let condition = def.cond.as_deref().map(Expr::parse).transpose()?;
        let t_idx = self.transitions.len();
        self.transitions.push(TransitionNode {
            document_id,
            source,
            events,
            condition,
            targets: Vec::new(),
            kind: match def.transition_type {
                TransitionType::External => TransitionKind::External,
                TransitionType::Internal => TransitionKind::Internal,
            },
            actions: self.actions(&def.actions)?,
        });
        if let Some(targets) = &def.target {
            self.pending.push(PendingTargets {
                transition: t_idx,
                targets: targets.0.clone(),
            });
        }
        Ok(t_idx)
    }

    fn invoke(&mut self, def: &InvokeDef) -> Result<InvokeNode, CoreError> {
        if def.src.is_some() && def.srcexpr.is_some() {
            return Err(CoreError::definition("invoke has both 'src' and 'srcexpr'"));
        }
        if def.id.is_some() && def.idlocation.is_some() {
            return Err(CoreError::definition("invoke has both 'id' and 'idlocation'"));
        }
        Ok(InvokeNode {
            document_id: self.doc_id(),
            invoke_type: def.invoke_type.clone(),
            src: def.src.clone(),
            src_expr: def.srcexpr.as_deref().map(Expr::parse).transpose()?,
            id: def.id.as_deref().map(InvokeId::new),
            id_location: def.idlocation.as_deref().map(Expr::parse_location).transpose()?,
            params: self.params(&def.params)?,
            content: match &def.content {
                Some(v) => self.value_expr(v.expr.as_deref(), v.value.as_ref())?,
                None => None,
            },
            autoforward: def.autoforward,
            finalize: self.actions(&def.finalize)?,
        })
    }

    fn value_expr(
        &self,
        expr: Option<&str>,
        value: Option<&serde_json::Value>,
    ) -> Result<Option<Expr>, CoreError> {
        match (expr, value) {
            (Some(_), Some(_)) => Err(CoreError::definition(
                "both 'expr' and 'value' given for one value",
            )),
            (Some(e), None) => Ok(Some(Expr::parse(e)?)),
            (None, Some(v)) => Ok(Some(Expr::literal(Value::from(v)))),
            (None, None) => Ok(None),
        }
    }

    fn params(&self, defs: &[ParamDef]) -> Result<Vec<Param>, CoreError> {
        defs.iter()
            .map(|p| {
                let expr = self
                    .value_expr(p.expr.as_deref(), p.value.as_ref())?
                    .ok_or_else(|| {
                        CoreError::definition(format!("param '{}' has no value", p.name))
                    })?;
                Ok(Param {
                    name: p.name.clone(),
                    expr,
                })
            })
            .collect()
    }

    fn actions(&self, defs: &[ActionDef]) -> Result<Vec<Action>, CoreError> {
        defs.iter().map(|d| self.action(d)).collect()
    }

    fn action(&self, def: &ActionDef) -> Result<Action, CoreError> {
        Ok(match def {
            ActionDef::Raise { event } => Action::Raise {
                event: EventName::parse(event)?,
            },
            ActionDef::Send(send) => Action::Send(Box::new(self.send(send)?)),
            ActionDef::Cancel { sendid, sendidexpr } => {
                if sendid.is_some() == sendidexpr.is_some() {
                    return Err(CoreError::definition(
                        "cancel needs exactly one of 'sendid' and 'sendidexpr'",
                    ));
                }
                Action::Cancel {
                    send_id: sendid.as_deref().map(SendId::new),
                    send_id_expr: sendidexpr.as_deref().map(Expr::parse).transpose()?,
                }
            }
            ActionDef::Log { label, expr } => Action::Log {
                label: label.clone(),
                expr: expr.as_deref().map(Expr::parse).transpose()?,
            },
            ActionDef::Assign {
                location,
                expr,
                value,
            } => Action::Assign {
                location: Expr::parse_location(location)?,
                expr: self
                    .value_expr(expr.as_deref(), value.as_ref())?
                    .unwrap_or(Expr::Literal(Value::Undefined)),
            },
            ActionDef::If(def) => {
                let mut branches = vec![Branch {
                    condition: Some(Expr::parse(&def.cond)?),
                    actions: self.actions(&def.actions)?,
                }];
                for elseif in &def.elseif {
                    branches.push(Branch {
                        condition: Some(Expr::parse(&elseif.cond)?),
                        actions: self.actions(&elseif.actions)?,
                    });
                }
                if let Some(else_actions) = &def.else_actions {
                    branches.push(Branch {
                        condition: None,
                        actions: self.actions(else_actions)?,
                    });
                }
                Action::If { branches }
            }
            ActionDef::Foreach(def) => Action::Foreach {
                array: Expr::parse(&def.array)?,
                item: Expr::parse_location(&def.item)?,
                index: def.index.as_deref().map(Expr::parse_location).transpose()?,
                actions: self.actions(&def.actions)?,
            },
            ActionDef::Custom { name, args } => {
                let factory = self.builder.custom.get(name).ok_or_else(|| {
                    CoreError::definition(format!("unknown custom action '{}'", name))
                })?;
                Action::Custom {
                    name: name.clone(),
                    action: factory(args)?,
                }
            }
        })
    }

    fn send(&self, def: &SendDef) -> Result<SendAction, CoreError> {
        let exclusive = [
            (def.event.is_some(), def.eventexpr.is_some(), "event"),
            (def.target.is_some(), def.targetexpr.is_some(), "target"),
            (def.id.is_some(), def.idlocation.is_some(), "id"),
            (def.delay.is_some(), def.delayexpr.is_some(), "delay"),
        ];
        for (a, b, what) in exclusive {
            if a && b {
                return Err(CoreError::definition(format!(
                    "send has conflicting '{}' attributes",
                    what
                )));
            }
        }
        if def.event.is_none() && def.eventexpr.is_none() && def.content.is_none() {
            return Err(CoreError::definition("send needs an event or content"));
        }

        Ok(SendAction {
            event: def.event.as_deref().map(EventName::parse).transpose()?,
            event_expr: def.eventexpr.as_deref().map(Expr::parse).transpose()?,
            target: def.target.clone(),
            target_expr: def.targetexpr.as_deref().map(Expr::parse).transpose()?,
            event_type: def.send_type.clone(),
            id: def.id.as_deref().map(SendId::new),
            id_location: def.idlocation.as_deref().map(Expr::parse_location).transpose()?,
            delay: def.delay.as_ref().map(parse_delay_json).transpose()?,
            delay_expr: def.delayexpr.as_deref().map(Expr::parse).transpose()?,
            params: self.params(&def.params)?,
            content: match &def.content {
                Some(v) => self.value_expr(v.expr.as_deref(), v.value.as_ref())?,
                None => None,
            },
        })
    }

    /// Converts the index-free arena into final nodes with resolved targets.
    fn resolve(&mut self) -> Result<Vec<StateNode>, CoreError> {
        let mut by_id: HashMap<&Identifier, StateIdx> = HashMap::new();
        for (idx, s) in self.states.iter().enumerate() {
            if by_id.insert(&s.id, idx).is_some() {
                return Err(CoreError::definition(format!(
                    "duplicate state id '{}'",
                    s.id
                )));
            }
        }

        let mut resolved = Vec::with_capacity(self.pending.len());
        for pending in &self.pending {
            let mut targets = Vec::with_capacity(pending.targets.len());
            for target in &pending.targets {
                let id = Identifier::new(target)?;
                let idx = by_id.get(&id).copied().ok_or_else(|| {
                    CoreError::definition(format!("transition target '{}' not found", target))
                })?;
                targets.push(idx);
            }
            resolved.push((pending.transition, targets));
        }
        for (t, targets) in resolved {
            self.transitions[t].targets = targets;
        }

        Ok(std::mem::take(&mut self.states))
    }
}

/// Structural checks that need resolved targets.
fn validate(model: &InterpreterModel) -> Result<(), CoreError> {
    for (idx, state) in model.states.iter().enumerate() {
        let Some(t) = state.initial else { continue };
        let initial = model.transition(t);

        match state.kind {
            StateKind::History(_) => {
                let parent = state.parent.unwrap_or(ROOT);
                for target in &initial.targets {
                    if !model.is_descendant(*target, parent) || *target == idx {
                        return Err(CoreError::definition(format!(
                            "history state '{}' default target '{}' is outside its parent",
                            state.id,
                            model.state(*target).id
                        )));
                    }
                }
            }
            _ => {
                if initial.targets.is_empty() {
                    return Err(CoreError::definition(format!(
                        "state '{}' has an empty initial",
                        state.id
                    )));
                }
                for target in &initial.targets {
                    if !model.is_descendant(*target, idx) {
                        return Err(CoreError::definition(format!(
                            "initial target '{}' is not a descendant of '{}'",
                            model.state(*target).id,
                            state.id
                        )));
                    }
                }
            }
        }
    }

    // Multiple targets must not be ancestors of each other.
    for t in &model.transitions {
        let set: HashSet<StateIdx> = t.targets.iter().copied().collect();
        if set.len() != t.targets.len() {
            return Err(CoreError::definition(format!(
                "transition {} lists a target twice",
                t.document_id
            )));
        }
        for a in &t.targets {
            for b in &t.targets {
                if a != b && model.is_descendant(*a, *b) {
                    return Err(CoreError::definition(format!(
                        "transition {} targets both '{}' and its ancestor '{}'",
                        t.document_id,
                        model.state(*a).id,
                        model.state(*b).id
                    )));
                }
            }
        }
    }

    Ok(())
}

/// Longest delay a `<send>` may request.
pub const MAX_DELAY: Duration = Duration::from_secs(365 * 24 * 60 * 60);

/// Converts a millisecond count to a delay, rejecting negative, non-finite
/// and out-of-range values.
pub fn delay_from_millis(ms: f64) -> Option<Duration> {
    if !ms.is_finite() || ms < 0.0 {
        return None;
    }
    Duration::try_from_secs_f64(ms / 1000.0)
        .ok()
        .filter(|d| *d <= MAX_DELAY)
}

fn parse_delay_json(value: &serde_json::Value) -> Result<Duration, CoreError> {
    match value {
        serde_json::Value::Number(n) => n
            .as_f64()
            .and_then(delay_from_millis)
            .ok_or_else(|| CoreError::definition(format!("invalid delay {}", n))),
        serde_json::Value::String(s) => parse_delay(s),
        other => Err(CoreError::definition(format!("invalid delay {}", other))),
    }
}

/// Parses `"250ms"`, `"1.5s"`, `"2m"` or a bare millisecond count.
pub fn parse_delay(text: &str) -> Result<Duration, CoreError> {
    let text = text.trim();
    let invalid = || CoreError::InvalidExpression {
        reason: format!("invalid delay '{}'", text),
    };

    let (number, scale_ms) = if let Some(n) = text.strip_suffix("ms") {
        (n, 1.0)
    } else if let Some(n) = text.strip_suffix('s') {
        (n, 1000.0)
    } else if let Some(n) = text.strip_suffix('m') {
        (n, 60_000.0)
    } else {
        (text, 1.0)
    };

    let value: f64 = number.trim().parse().map_err(|_| invalid())?;
    delay_from_millis(value * scale_ms).ok_or_else(invalid)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::persistence::{Bucket, Key, StoreSupport, TypeInfo};
    use serde_json::json;

    fn compile(json: serde_json::Value) -> Result<InterpreterModel, CoreError> {
        ChartDefinition::from_json(&json)?.compile()
    }

    fn sample() -> serde_json::Value {
        json!({
            "name": "player",
            "initial": "stopped",
            "datamodel": [{"id": "volume", "value": 5}],
            "states": [
                {"id": "stopped", "transitions": [{"event": "play", "target": "active"}]},
                {"id": "active", "initial": "playing", "states": [
                    {"id": "hist", "type": "history", "transitions": [{"target": "playing"}]},
                    {"id": "playing", "transitions": [{"event": "pause", "target": "paused"}]},
                    {"id": "paused", "transitions": [{"event": "play", "target": "playing"}]}
                ], "transitions": [{"event": "stop", "target": "stopped"}]},
                {"id": "off", "type": "final"}
            ]
        })
    }

    #[test]
    fn test_compile_document_order() {
        let model = compile(sample()).unwrap();
        assert_eq!(model.name.as_deref(), Some("player"));
        assert_eq!(model.state_count(), 6);

        let ids: Vec<&str> = model.states.iter().map(|s| s.id.as_str()).collect();
        assert_eq!(ids, vec!["$scxml", "stopped", "active", "hist", "playing", "paused", "off"]);

        for pair in model.states.windows(2) {
            assert!(pair[0].document_id < pair[1].document_id);
        }

        let active = model.state_by_id("active").unwrap();
        assert!(model.is_compound(active));
        assert!(model.is_atomic(model.state_by_id("playing").unwrap()));
        assert!(model.is_final(model.state_by_id("off").unwrap()));
        assert_eq!(model.child_states(active).count(), 2);
        assert_eq!(model.history_children(active).count(), 1);
    }

    #[test]
    fn test_initial_defaults_to_first_child() {
        let model = compile(json!({
            "states": [{"id": "a"}, {"id": "b"}]
        }))
        .unwrap();
        let initial = model.transition(model.state(ROOT).initial.unwrap());
        assert_eq!(initial.targets, vec![model.state_by_id("a").unwrap()]);
        assert_eq!(initial.kind, TransitionKind::Internal);
    }

    #[test]
    fn test_checksum_is_stable() {
        let a = ChartDefinition::from_json(&sample()).unwrap();
        let b = ChartDefinition::from_json(&sample()).unwrap();
        assert_eq!(a.checksum().unwrap(), b.checksum().unwrap());
        assert_eq!(a.checksum().unwrap().len(), 8);
    }

    #[test]
    fn test_unknown_target_rejected() {
        let result = compile(json!({
            "states": [{"id": "a", "transitions": [{"event": "go", "target": "nowhere"}]}]
        }));
        assert!(matches!(result, Err(CoreError::InvalidDefinition { .. })));
    }

    #[test]
    fn test_duplicate_id_rejected() {
        let result = compile(json!({
            "states": [{"id": "a"}, {"id": "b", "states": [{"id": "a"}]}]
        }));
        assert!(matches!(result, Err(CoreError::InvalidDefinition { .. })));
    }

    #[test]
    fn test_misplaced_initial_rejected() {
        let result = compile(json!({
            "states": [{"id": "a", "initial": "b", "states": [{"id": "x"}]}, {"id": "b"}]
        }));
        assert!(matches!(result, Err(CoreError::InvalidDefinition { .. })));

        let result = compile(json!({
            "states": [{"id": "a", "type": "parallel", "initial": "x", "states": [{"id": "x"}]}]
        }));
        assert!(result.is_err());
    }

    #[test]
    fn test_history_validation() {
        let result = compile(json!({
            "states": [
                {"id": "a", "states": [{"id": "h", "type": "history"}, {"id": "x"}]}
            ]
        }));
        assert!(result.is_err(), "history without default transition");

        let result = compile(json!({
            "states": [
                {"id": "a", "states": [
                    {"id": "h", "type": "history", "transitions": [{"target": "y"}]},
                    {"id": "x"}
                ]},
                {"id": "y"}
            ]
        }));
        assert!(result.is_err(), "history default outside parent");
    }

    #[test]
    fn test_final_with_children_rejected() {
        let result = compile(json!({
            "states": [{"id": "f", "type": "final", "states": [{"id": "x"}]}]
        }));
        assert!(result.is_err());
    }

    #[test]
    fn test_bad_condition_rejected() {
        let result = compile(json!({
            "states": [{"id": "a", "transitions": [{"event": "go", "cond": "(x &&", "target": "a"}]}]
        }));
        assert!(matches!(result, Err(CoreError::InvalidExpression { .. })));
    }

    #[test]
    fn test_unknown_custom_action_rejected() {
        let result = compile(json!({
            "states": [{"id": "a", "onentry": [{"custom": {"name": "beep"}}]}]
        }));
        assert!(result.is_err());
    }

    #[test]
    fn test_custom_action_factory() {
        #[derive(Debug)]
        struct Beep;
        impl CustomAction for Beep {
            fn execute(
                &self,
                data_model: &rscx_value::Object,
            ) -> Result<(), crate::error::ExecutionError> {
                data_model.set("beeped", true)?;
                Ok(())
            }
        }

        let def = ChartDefinition::from_json(&json!({
            "states": [{"id": "a", "onentry": [{"custom": {"name": "beep", "args": {"times": 2}}}]}]
        }))
        .unwrap();
        let model = ModelBuilder::new()
            .custom_action(
                "beep",
                Arc::new(
                    |_args: &serde_json::Value| -> Result<Arc<dyn CustomAction>, CoreError> {
                        Ok(Arc::new(Beep))
                    },
                ),
            )
            .build(&def)
            .unwrap();
        let a = model.state_by_id("a").unwrap();
        assert!(matches!(model.state(a).on_entry[0], Action::Custom { .. }));
    }

    #[test]
    fn test_send_attributes() {
        let model = compile(json!({
            "states": [{"id": "a", "onentry": [
                {"send": {"event": "tick", "delay": "1.5s", "id": "t1", "target": "#_internal"}},
                {"send": {"event": "tock", "delay": 250}}
            ]}]
        }))
        .unwrap();
        let a = model.state(model.state_by_id("a").unwrap());
        match (&a.on_entry[0], &a.on_entry[1]) {
            (Action::Send(first), Action::Send(second)) => {
                assert_eq!(first.delay, Some(Duration::from_millis(1500)));
                assert_eq!(first.id, Some(SendId::new("t1")));
                assert_eq!(second.delay, Some(Duration::from_millis(250)));
            }
            other => panic!("unexpected actions {:?}", other),
        }

        let result = compile(json!({
            "states": [{"id": "a", "onentry": [{"send": {"event": "x", "delay": "1s", "delayexpr": "d"}}]}]
        }));
        assert!(result.is_err());
    }

    #[test]
    fn test_parse_delay() {
        assert_eq!(parse_delay("100ms").unwrap(), Duration::from_millis(100));
        assert_eq!(parse_delay("2s").unwrap(), Duration::from_secs(2));
        assert_eq!(parse_delay("1m").unwrap(), Duration::from_secs(60));
        assert_eq!(parse_delay("40").unwrap(), Duration::from_millis(40));
        assert!(parse_delay("-1s").is_err());
        assert!(parse_delay("soon").is_err());
        assert!(parse_delay("1e300s").is_err());
        assert!(parse_delay("inf").is_err());
    }

    #[test]
    fn test_delay_from_millis_bounds() {
        assert_eq!(delay_from_millis(1500.0), Some(Duration::from_millis(1500)));
        assert_eq!(delay_from_millis(0.0), Some(Duration::ZERO));
        assert_eq!(delay_from_millis(1e300), None);
        assert_eq!(delay_from_millis(f64::NAN), None);
        assert_eq!(delay_from_millis(-5.0), None);
        assert!(delay_from_millis(MAX_DELAY.as_millis() as f64).is_some());
        assert!(delay_from_millis(MAX_DELAY.as_millis() as f64 + 1000.0).is_none());
    }

    #[test]
    fn test_token_lists() {
        let model = compile(json!({
            "states": [
                {"id": "p", "type": "parallel", "states": [
                    {"id": "r1", "states": [{"id": "a"}, {"id": "b"}]},
                    {"id": "r2", "states": [{"id": "c"}, {"id": "d"}]}
                ], "transitions": [{"event": "go reset.*", "target": "b d"}]}
            ]
        }))
        .unwrap();
        let p = model.state_by_id("p").unwrap();
        let t = model.transition(model.state(p).transitions[0]);
        assert_eq!(t.events.len(), 2);
        assert_eq!(t.targets.len(), 2);
        assert_eq!(t.event_text(), "go reset");
    }

    #[test]
    fn test_model_store_support() {
        let model = compile(sample()).unwrap();
        let mut bucket = Bucket::new();
        model.store(&mut bucket);

        assert_eq!(bucket.get_type_info(), Some(TypeInfo::Model));
        let root = bucket.get_nested(&Key::Root).unwrap();
        let children = root.get_nested(&Key::Children).unwrap().indexed();
        assert_eq!(children.len(), 3);
        assert_eq!(children[1].get_str(&Key::Id), Some("active"));
        assert_eq!(children[2].get_type_info(), Some(TypeInfo::FinalNode));

        let active_children = children[1].get_nested(&Key::Children).unwrap().indexed();
        assert_eq!(active_children[0].get_type_info(), Some(TypeInfo::HistoryNode));
        let transitions = children[1].get_nested(&Key::Transitions).unwrap().indexed();
        assert_eq!(transitions[0].get_type_info(), Some(TypeInfo::TransitionNode));
    }
}
