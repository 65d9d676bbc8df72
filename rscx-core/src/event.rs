//! Event objects.

use crate::error::{ErrorType, ExecutionError};
use crate::ident::{EventName, InvokeId, SendId};
use rscx_value::{Access, Object, Value};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Duration;

/// Where an event came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventType {
    Platform,
    Internal,
    External,
}

impl fmt::Display for EventType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            EventType::Platform => write!(f, "platform"),
            EventType::Internal => write!(f, "internal"),
            EventType::External => write!(f, "external"),
        }
    }
}

/// An event as seen by a state machine.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Event {
    pub name: EventName,
    #[serde(rename = "type")]
    pub event_type: EventType,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub send_id: Option<SendId>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub origin: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub origin_type: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub invoke_id: Option<InvokeId>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub invoke_unique_id: Option<String>,
    #[serde(default)]
    pub data: Value,
}

impl Event {
    pub fn new(name: EventName, event_type: EventType) -> Self {
        Self {
            name,
            event_type,
            send_id: None,
            origin: None,
            origin_type: None,
            invoke_id: None,
            invoke_unique_id: None,
            data: Value::Undefined,
        }
    }

    pub fn external(name: EventName) -> Self {
        Self::new(name, EventType::External)
    }

    pub fn internal(name: EventName) -> Self {
        Self::new(name, EventType::Internal)
    }

    /// Builds the `error.*` platform event for a recoverable failure.
    pub fn from_error(error: &ExecutionError) -> Self {
        let data = Object::new();
        let _ = data.set("message", error.message.as_str());
        let mut event = Self::new(EventName::error(error.kind), EventType::Platform);
        if error.kind == ErrorType::Communication {
            event.send_id = error.send_id.clone();
        }
        event.data = Value::Object(data);
        event
    }

    pub fn with_data(mut self, data: impl Into<Value>) -> Self {
        self.data = data.into();
        self
    }

    pub fn with_send_id(mut self, send_id: SendId) -> Self {
        self.send_id = Some(send_id);
        self
    }

    pub fn with_origin(mut self, origin: impl Into<String>, origin_type: impl Into<String>) -> Self {
        self.origin = Some(origin.into());
        self.origin_type = Some(origin_type.into());
        self
    }

    pub fn with_invoke(mut self, invoke_id: InvokeId, unique_id: impl Into<String>) -> Self {
        self.invoke_id = Some(invoke_id);
        self.invoke_unique_id = Some(unique_id.into());
        self
    }

    /// The deep-constant `_event` object bound in the data model.
    pub fn to_object(&self) -> Object {
        let obj = Object::with_capacity(7);
        let opt = |v: &Option<String>| v.clone().map(Value::from).unwrap_or(Value::Undefined);
        let _ = obj.set("name", self.name.to_string());
        let _ = obj.set("type", self.event_type.to_string());
        let _ = obj.set(
            "sendid",
            opt(&self.send_id.as_ref().map(|s| s.to_string())),
        );
        let _ = obj.set("origin", opt(&self.origin));
        let _ = obj.set("origintype", opt(&self.origin_type));
        let _ = obj.set(
            "invokeid",
            opt(&self.invoke_id.as_ref().map(|s| s.to_string())),
        );
        let _ = obj.set("data", self.data.deep_clone(Access::Constant));
        obj.make_deep_constant();
        obj
    }
}

/// An event leaving a session through `<send>`.
#[derive(Debug, Clone)]
pub struct OutgoingEvent {
    pub send_id: Option<SendId>,
    pub name: EventName,
    pub target: Option<String>,
    pub event_type: Option<String>,
    pub delay: Duration,
    pub data: Value,
}

impl OutgoingEvent {
    pub fn new(name: EventName) -> Self {
        Self {
            send_id: None,
            name,
            target: None,
            event_type: None,
            delay: Duration::ZERO,
            data: Value::Undefined,
        }
    }

    pub fn with_target(mut self, target: impl Into<String>) -> Self {
        self.target = Some(target.into());
        self
    }

    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    pub fn with_send_id(mut self, send_id: SendId) -> Self {
        self.send_id = Some(send_id);
        self
    }

    pub fn with_data(mut self, data: impl Into<Value>) -> Self {
        self.data = data.into();
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_event_object_is_constant() {
        let event = Event::external(EventName::parse("go").unwrap())
            .with_send_id(SendId::new("s1"))
            .with_data(42.0);
        let obj = event.to_object();
        assert_eq!(obj.access(), Access::Constant);
        assert_eq!(obj.get("name").as_str(), Some("go"));
        assert_eq!(obj.get("type").as_str(), Some("external"));
        assert_eq!(obj.get("sendid").as_str(), Some("s1"));
        assert!(obj.get("origin").is_undefined());
        assert_eq!(obj.get("data"), Value::Number(42.0));
        assert!(obj.set("name", "x").is_err());
    }

    #[test]
    fn test_error_event() {
        let err = ExecutionError::communication("no route").with_send_id(Some(SendId::new("a")));
        let event = Event::from_error(&err);
        assert_eq!(event.name.to_string(), "error.communication");
        assert_eq!(event.event_type, EventType::Platform);
        assert_eq!(event.send_id, Some(SendId::new("a")));
        assert_eq!(event.data.get_path(&["message"]).as_str(), Some("no route"));
    }
}
