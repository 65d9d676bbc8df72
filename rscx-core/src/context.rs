//! Mutable per-session runtime state.

use crate::error::CoreError;
use crate::event::Event;
use crate::ident::InvokeId;
use crate::model::{DocumentId, InterpreterModel, StateIdx};
use crate::persistence::{Bucket, Key, StoreSupport, TypeInfo};
use rscx_value::{Object, Value};
use std::collections::{BTreeSet, HashMap, VecDeque};

/// Data model names bound by the interpreter itself.
pub const SYSTEM_VARIABLES: [&str; 3] = ["_sessionid", "_name", "_event"];

/// A started invoked service.
#[derive(Debug, Clone, PartialEq)]
pub struct Invocation {
    pub invoke_id: InvokeId,
    pub unique_id: String,
    /// The invoking state.
    pub state: StateIdx,
    /// Position in the invoking state's invoke list.
    pub node: usize,
    pub autoforward: bool,
}

/// Everything the interpreter mutates while running.
#[derive(Debug)]
pub struct RuntimeContext {
    pub configuration: BTreeSet<StateIdx>,
    pub states_to_invoke: BTreeSet<StateIdx>,
    /// History state -> states recorded at the last exit of its parent.
    pub history: HashMap<StateIdx, Vec<StateIdx>>,
    pub internal_queue: VecDeque<Event>,
    pub data_model: Object,
    pub invocations: Vec<Invocation>,
    /// True once the initial configuration has been entered.
    pub initialized: bool,
    pub done: bool,
    pub result: Value,
}

impl Default for RuntimeContext {
    fn default() -> Self {
        Self::new()
    }
}

impl RuntimeContext {
    pub fn new() -> Self {
        Self {
            configuration: BTreeSet::new(),
            states_to_invoke: BTreeSet::new(),
            history: HashMap::new(),
            internal_queue: VecDeque::new(),
            data_model: Object::new(),
            invocations: Vec::new(),
            initialized: false,
            done: false,
            result: Value::Undefined,
        }
    }

    /// Writes a snapshot. Fails if the data model contains a cycle.
    pub fn store(&self, model: &InterpreterModel, bucket: &mut Bucket) -> Result<(), CoreError> {
        bucket.add(Key::TypeInfo, TypeInfo::RuntimeContext);
        bucket.add(Key::Checksum, model.checksum.as_str());
        bucket.add(Key::Done, self.done);

        bucket.set_nested(Key::Configuration, store_states(model, &self.configuration));
        bucket.set_nested(Key::StatesToInvoke, store_states(model, &self.states_to_invoke));

        let mut history = Bucket::new();
        let mut entries: Vec<_> = self.history.iter().collect();
        entries.sort_by_key(|(h, _)| **h);
        for (i, (h, states)) in entries.into_iter().enumerate() {
            let mut hb = Bucket::new();
            model.state(*h).store(&mut hb);
            let recorded: Vec<u32> = states.iter().map(|s| model.state(*s).document_id.0).collect();
            hb.add(Key::Named("recorded".into()), recorded);
            history.set_nested(Key::Index(i), hb);
        }
        bucket.set_nested(Key::History, history);

        let queue = self
            .internal_queue
            .iter()
            .map(serde_json::to_value)
            .collect::<Result<Vec<_>, _>>()?;
        bucket.add(Key::InternalQueue, queue);

        let mut data = serde_json::Map::new();
        for (key, value) in self.data_model.entries() {
            if SYSTEM_VARIABLES.contains(&key.as_str()) || value.is_undefined() {
                continue;
            }
            data.insert(key, value.to_json()?);
        }
        bucket.add(Key::DataModel, serde_json::Value::Object(data));

        let mut invocations = Bucket::new();
        for (i, inv) in self.invocations.iter().enumerate() {
            let mut ib = Bucket::new();
            ib.add(Key::TypeInfo, TypeInfo::Invocation);
            ib.add(Key::Id, inv.invoke_id.as_str());
            ib.add(Key::Named("unique_id".into()), inv.unique_id.as_str());
            ib.add(Key::DocumentId, model.state(inv.state).document_id.0);
            ib.add(Key::Named("node".into()), inv.node as u64);
            ib.add(Key::Named("autoforward".into()), inv.autoforward);
            invocations.set_nested(Key::Index(i), ib);
        }
        bucket.set_nested(Key::Invocations, invocations);

        if self.done {
            bucket.add(Key::Result, self.result.to_json()?);
        }

        Ok(())
    }

    /// Rebuilds a context from a snapshot taken against the same model.
    pub fn restore(model: &InterpreterModel, bucket: &Bucket) -> Result<Self, CoreError> {
        if bucket.get_type_info() != Some(TypeInfo::RuntimeContext) {
            return Err(storage("bucket is not a runtime context snapshot"));
        }
        if bucket.get_str(&Key::Checksum) != Some(model.checksum.as_str()) {
            return Err(storage("snapshot was taken from a different chart"));
        }

        let mut ctx = RuntimeContext::new();
        ctx.initialized = true;
        ctx.done = bucket
            .get(&Key::Done)
            .and_then(serde_json::Value::as_bool)
            .unwrap_or(false);

        ctx.configuration = restore_states(model, bucket.get_nested(&Key::Configuration))?;
        ctx.states_to_invoke = restore_states(model, bucket.get_nested(&Key::StatesToInvoke))?;

        if let Some(history) = bucket.get_nested(&Key::History) {
            for hb in history.indexed() {
                let h = resolve_node(model, &hb)?;
                let recorded = hb
                    .get(&Key::Named("recorded".into()))
                    .and_then(serde_json::Value::as_array)
                    .cloned()
                    .unwrap_or_default();
                let mut states = Vec::with_capacity(recorded.len());
                for doc in recorded {
                    let doc = doc
                        .as_u64()
                        .ok_or_else(|| storage("history entry is not a document id"))?;
                    states.push(state_for_doc(model, doc)?);
                }
                ctx.history.insert(h, states);
            }
        }

        if let Some(serde_json::Value::Array(events)) = bucket.get(&Key::InternalQueue) {
            for e in events {
                ctx.internal_queue.push_back(serde_json::from_value(e.clone())?);
            }
        }

        if let Some(serde_json::Value::Object(data)) = bucket.get(&Key::DataModel) {
            for (key, value) in data {
                ctx.data_model.set(key, Value::from(value))?;
            }
        }

        if let Some(invocations) = bucket.get_nested(&Key::Invocations) {
            for ib in invocations.indexed() {
                let invoke_id = ib
                    .get_str(&Key::Id)
                    .ok_or_else(|| storage("invocation without id"))?;
                let doc = ib
                    .get_u64(&Key::DocumentId)
                    .ok_or_else(|| storage("invocation without state"))?;
                ctx.invocations.push(Invocation {
                    invoke_id: InvokeId::new(invoke_id),
                    unique_id: ib
                        .get_str(&Key::Named("unique_id".into()))
                        .unwrap_or_default()
                        .to_string(),
                    state: state_for_doc(model, doc)?,
                    node: ib.get_u64(&Key::Named("node".into())).unwrap_or(0) as usize,
                    autoforward: ib
                        .get(&Key::Named("autoforward".into()))
                        .and_then(serde_json::Value::as_bool)
                        .unwrap_or(false),
                });
            }
        }

        if let Some(result) = bucket.get(&Key::Result) {
            ctx.result = Value::from(result);
        }

        Ok(ctx)
    }
}

fn storage(reason: &str) -> CoreError {
    CoreError::Storage {
        reason: reason.to_string(),
    }
}

fn store_states(model: &InterpreterModel, states: &BTreeSet<StateIdx>) -> Bucket {
    let mut bucket = Bucket::new();
    for (i, s) in states.iter().enumerate() {
        let mut sb = Bucket::new();
        model.state(*s).store(&mut sb);
        bucket.set_nested(Key::Index(i), sb);
    }
    bucket
}

fn restore_states(
    model: &InterpreterModel,
    bucket: Option<Bucket>,
) -> Result<BTreeSet<StateIdx>, CoreError> {
    let mut out = BTreeSet::new();
    if let Some(bucket) = bucket {
        for sb in bucket.indexed() {
            out.insert(resolve_node(model, &sb)?);
        }
    }
    Ok(out)
}

fn state_for_doc(model: &InterpreterModel, doc: u64) -> Result<StateIdx, CoreError> {
    u32::try_from(doc)
        .ok()
        .and_then(|d| model.state_by_document_id(DocumentId(d)))
        .ok_or_else(|| storage("snapshot references an unknown state"))
}

/// Finds the state a stored node refers to and checks its type tag.
fn resolve_node(model: &InterpreterModel, bucket: &Bucket) -> Result<StateIdx, CoreError> {
    let doc = bucket
        .get_u64(&Key::DocumentId)
        .ok_or_else(|| storage("stored node has no document id"))?;
    let idx = state_for_doc(model, doc)?;

    let mut expected = Bucket::new();
    model.state(idx).store(&mut expected);
    if bucket.get_type_info() != expected.get_type_info() {
        return Err(storage("stored node type does not match the chart"));
    }
    Ok(idx)
}
