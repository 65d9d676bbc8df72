//! Executable content.
//!
//! Actions run synchronously inside a microstep. Anything that has to leave the
//! session (sends, cancels, invoke control) is queued as an [`Effect`] and
//! flushed by the interpreter once the microstep is over.

use crate::communication::InvokeData;
use crate::context::{Invocation, RuntimeContext};
use crate::definition::{delay_from_millis, parse_delay};
use crate::error::{ExecutionError, PlatformError};
use crate::event::{Event, OutgoingEvent};
use crate::expr::{Expr, Scope};
use crate::ident::{EventName, InvokeId, SendId};
use crate::interpreter::Interpreter;
use crate::model::{Action, InterpreterModel, Param, SendAction, StateIdx};
use rscx_value::{Object, Value};
use std::time::Duration;

/// Target that loops a `<send>` back into the internal queue.
pub const INTERNAL_TARGET: &str = "#_internal";

/// A side effect produced during a microstep.
#[derive(Debug)]
pub(crate) enum Effect {
    Send(OutgoingEvent),
    Cancel(SendId),
    CancelInvoke(InvokeId),
    Forward(InvokeId, Event),
}

/// Expression scope over a session's data model and configuration.
pub(crate) struct DataScope<'a> {
    pub model: &'a InterpreterModel,
    pub ctx: &'a RuntimeContext,
}

impl Scope for DataScope<'_> {
    fn lookup(&self, path: &[&str]) -> Value {
        self.ctx.data_model.get_path(path)
    }

    fn in_state(&self, id: &str) -> bool {
        self.model
            .state_by_id(id)
            .is_some_and(|idx| self.ctx.configuration.contains(&idx))
    }
}

fn expect_string(value: Value, what: &str) -> Result<String, ExecutionError> {
    match value {
        Value::String(s) => Ok(s),
        other => Err(ExecutionError::execution(format!(
            "{} must be a string, got {}",
            what,
            other.type_name()
        ))),
    }
}

fn segments(path: &[String]) -> Vec<&str> {
    path.iter().map(String::as_str).collect()
}

impl Interpreter {
    pub(crate) fn evaluate(&self, expr: &Expr) -> Result<Value, ExecutionError> {
        let scope = DataScope {
            model: &self.model,
            ctx: &self.ctx,
        };
        expr.evaluate(&scope)
    }

    /// Queues the `error.*` event for a recoverable failure.
    pub(crate) fn raise_error(&mut self, error: ExecutionError) {
        tracing::debug!(
            session_id = self.options.session_id.as_str(),
            "Raising error.{}: {}",
            error.kind,
            error.message
        );
        self.ctx.internal_queue.push_back(Event::from_error(&error));
    }

    /// Runs a block. The first failing action stops the block and raises its error.
    pub(crate) fn execute_block(&mut self, actions: &[Action]) {
        if let Err(e) = self.execute_actions(actions) {
            self.raise_error(e);
        }
    }

    fn execute_actions(&mut self, actions: &[Action]) -> Result<(), ExecutionError> {
        for action in actions {
            self.execute_action(action)?;
        }
        Ok(())
    }

    fn execute_action(&mut self, action: &Action) -> Result<(), ExecutionError> {
        match action {
            Action::Raise { event } => {
                self.ctx
                    .internal_queue
                    .push_back(Event::internal(event.clone()));
            }
            Action::Send(send) => self.send(send)?,
            Action::Cancel {
                send_id,
                send_id_expr,
            } => {
                let id = match (send_id, send_id_expr) {
                    (Some(id), _) => id.clone(),
                    (None, Some(expr)) => {
                        SendId::new(expect_string(self.evaluate(expr)?, "sendidexpr")?)
                    }
                    (None, None) => return Err(ExecutionError::execution("cancel without send id")),
                };
                self.effects.push(Effect::Cancel(id));
            }
            Action::Log { label, expr } => {
                let value = match expr {
                    Some(expr) => self.evaluate(expr)?,
                    None => Value::Undefined,
                };
                self.options
                    .logger
                    .log(&self.log_ctx, label.as_deref(), &value)
                    .map_err(|e| PlatformError::new(self.options.session_id.clone(), e))?;
            }
            Action::Assign { location, expr } => {
                let value = self.evaluate(expr)?;
                self.assign(location, value)?;
            }
            Action::If { branches } => {
                for branch in branches {
                    let taken = match &branch.condition {
                        Some(cond) => self.evaluate(cond)?.is_truthy(),
                        None => true,
                    };
                    if taken {
                        return self.execute_actions(&branch.actions);
                    }
                }
            }
            Action::Foreach {
                array,
                item,
                index,
                actions,
            } => {
                let values = match self.evaluate(array)? {
                    Value::Array(arr) => arr.values(),
                    other => {
                        return Err(ExecutionError::execution(format!(
                            "foreach needs an array, got {}",
                            other.type_name()
                        )))
                    }
                };
                for (i, value) in values.into_iter().enumerate() {
                    self.assign(item, value)?;
                    if let Some(index) = index {
                        self.assign(index, Value::from(i))?;
                    }
                    self.execute_actions(actions)?;
                }
            }
            Action::Custom { name, action } => {
                action.execute(&self.ctx.data_model).map_err(|e| {
                    ExecutionError::execution(format!("custom action '{}': {}", name, e.message))
                })?;
            }
        }
        Ok(())
    }

    /// Writes to a declared data model location.
    fn assign(&mut self, location: &[String], value: Value) -> Result<(), ExecutionError> {
        let head = location
            .first()
            .ok_or_else(|| ExecutionError::execution("empty assign location"))?;
        if !self.ctx.data_model.contains(head) {
            return Err(ExecutionError::execution(format!(
                "location '{}' is not declared",
                location.join(".")
            )));
        }
        self.ctx
            .data_model
            .set_path(&segments(location), value)
            .map_err(|e| {
                ExecutionError::execution(format!("cannot assign '{}': {}", location.join("."), e))
            })
    }

    fn params_object(&self, params: &[Param]) -> Result<Object, ExecutionError> {
        let obj = Object::with_capacity(params.len());
        for param in params {
            obj.set(&param.name, self.evaluate(&param.expr)?)?;
        }
        Ok(obj)
    }

    fn send(&mut self, send: &SendAction) -> Result<(), ExecutionError> {
        let name = match (&send.event, &send.event_expr) {
            (Some(name), _) => name.clone(),
            (None, Some(expr)) => {
                let text = expect_string(self.evaluate(expr)?, "eventexpr")?;
                EventName::parse(&text)?
            }
            (None, None) => return Err(ExecutionError::execution("send without event name")),
        };

        let target = match (&send.target, &send.target_expr) {
            (Some(t), _) => Some(t.clone()),
            (None, Some(expr)) => Some(expect_string(self.evaluate(expr)?, "targetexpr")?),
            (None, None) => None,
        };

        let delay = match (send.delay, &send.delay_expr) {
            (Some(d), _) => d,
            (None, Some(expr)) => match self.evaluate(expr)? {
                Value::Number(ms) => delay_from_millis(ms).ok_or_else(|| {
                    ExecutionError::execution(format!("invalid delay {}", ms))
                })?,
                Value::String(text) => parse_delay(&text)?,
                other => {
                    return Err(ExecutionError::execution(format!(
                        "invalid delay {}",
                        other
                    )))
                }
            },
            (None, None) => Duration::ZERO,
        };

        let data = match &send.content {
            Some(content) => self.evaluate(content)?,
            None if send.params.is_empty() => Value::Undefined,
            None => Value::Object(self.params_object(&send.params)?),
        };

        // Only sends that can be referenced later carry an id.
        let send_id = match (&send.id, &send.id_location) {
            (Some(id), _) => Some(id.clone()),
            (None, Some(_)) => Some(SendId::generate()),
            (None, None) if !delay.is_zero() => Some(SendId::generate()),
            (None, None) => None,
        };
        if let (Some(location), Some(id)) = (&send.id_location, &send_id) {
            self.assign(location, Value::from(id.as_str()))?;
        }

        if target.as_deref() == Some(INTERNAL_TARGET) {
            if !delay.is_zero() {
                return Err(ExecutionError::execution(
                    "delayed send to #_internal is not supported",
                ));
            }
            let mut event = Event::internal(name).with_data(data);
            event.send_id = send_id;
            self.ctx.internal_queue.push_back(event);
            return Ok(());
        }

        let mut event = OutgoingEvent::new(name).with_delay(delay).with_data(data);
        event.send_id = send_id;
        event.target = target;
        event.event_type = send.event_type.clone();
        self.effects.push(Effect::Send(event));
        Ok(())
    }

    /// Evaluates an `<invoke>` of `state` and registers the invocation.
    pub(crate) fn prepare_invoke(
        &mut self,
        state: StateIdx,
        node: usize,
    ) -> Result<InvokeData, ExecutionError> {
        let model = std::sync::Arc::clone(&self.model);
        let state_node = model.state(state);
        let invoke = &state_node.invokes[node];

        let invoke_id = invoke
            .id
            .clone()
            .unwrap_or_else(|| InvokeId::generate(&state_node.id));
        if let Some(location) = &invoke.id_location {
            self.assign(location, Value::from(invoke_id.as_str()))?;
        }

        let source = match (&invoke.src, &invoke.src_expr) {
            (Some(src), _) => Some(src.clone()),
            (None, Some(expr)) => Some(expect_string(self.evaluate(expr)?, "srcexpr")?),
            (None, None) => None,
        };
        let content = match &invoke.content {
            Some(expr) => self.evaluate(expr)?,
            None => Value::Undefined,
        };
        let parameters = if invoke.params.is_empty() {
            Value::Undefined
        } else {
            Value::Object(self.params_object(&invoke.params)?)
        };

        let unique_id = uuid::Uuid::new_v4().simple().to_string();
        self.ctx.invocations.push(Invocation {
            invoke_id: invoke_id.clone(),
            unique_id: unique_id.clone(),
            state,
            node,
            autoforward: invoke.autoforward,
        });

        Ok(InvokeData {
            invoke_id,
            unique_id,
            invoke_type: invoke.invoke_type.clone(),
            source,
            content,
            parameters,
            document_id: invoke.document_id,
        })
    }
}
