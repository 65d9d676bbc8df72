//! Identifiers, event names and event descriptors.

use crate::error::CoreError;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::fmt;
use std::str::FromStr;
use std::sync::{Arc, LazyLock};

/// A validated token: non-empty, no whitespace.
#[derive(Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Identifier(Arc<str>);

impl Identifier {
    pub fn new(value: impl AsRef<str>) -> Result<Self, CoreError> {
        let value = value.as_ref();
        if value.is_empty() || value.chars().any(char::is_whitespace) {
            return Err(CoreError::InvalidIdentifier {
                value: value.to_string(),
            });
        }
        Ok(Self(Arc::from(value)))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Debug for Identifier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?}", &*self.0)
    }
}

impl fmt::Display for Identifier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl FromStr for Identifier {
    type Err = CoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Identifier::new(s)
    }
}

impl AsRef<str> for Identifier {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

impl Serialize for Identifier {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.0)
    }
}

impl<'de> Deserialize<'de> for Identifier {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        Identifier::new(s).map_err(serde::de::Error::custom)
    }
}

/// A dot-separated sequence of identifiers, e.g. `done.state.idle`.
#[derive(Clone, PartialEq, Eq, Hash)]
pub struct EventName {
    parts: Arc<[Identifier]>,
}

pub static ERROR_EXECUTION: LazyLock<EventName> =
    LazyLock::new(|| EventName::from_static(&["error", "execution"]));
pub static ERROR_COMMUNICATION: LazyLock<EventName> =
    LazyLock::new(|| EventName::from_static(&["error", "communication"]));
pub static ERROR_PLATFORM: LazyLock<EventName> =
    LazyLock::new(|| EventName::from_static(&["error", "platform"]));

impl EventName {
    /// Parses `a.b.c`. Every segment must be a valid identifier.
    pub fn parse(name: &str) -> Result<Self, CoreError> {
        let parts = name
            .split('.')
            .map(Identifier::new)
            .collect::<Result<Vec<_>, _>>()
            .map_err(|_| CoreError::InvalidIdentifier {
                value: name.to_string(),
            })?;
        Ok(Self {
            parts: parts.into(),
        })
    }

    fn from_static(parts: &[&'static str]) -> Self {
        Self {
            parts: parts
                .iter()
                .map(|p| Identifier(Arc::from(*p)))
                .collect::<Vec<_>>()
                .into(),
        }
    }

    fn with_suffix(prefix: &[&'static str], id: &str) -> Self {
        let mut parts: Vec<Identifier> = prefix.iter().map(|p| Identifier(Arc::from(*p))).collect();
        parts.extend(
            id.split('.')
                .filter(|s| !s.is_empty())
                .map(|s| Identifier(Arc::from(s))),
        );
        Self {
            parts: parts.into(),
        }
    }

    /// `done.state.<state_id>`
    pub fn done_state(state_id: &Identifier) -> Self {
        Self::with_suffix(&["done", "state"], state_id.as_str())
    }

    /// `done.invoke.<invoke_id>`
    pub fn done_invoke(invoke_id: &InvokeId) -> Self {
        Self::with_suffix(&["done", "invoke"], invoke_id.as_str())
    }

    pub fn error(kind: crate::error::ErrorType) -> Self {
        use crate::error::ErrorType;
        match kind {
            ErrorType::Execution => ERROR_EXECUTION.clone(),
            ErrorType::Communication => ERROR_COMMUNICATION.clone(),
            ErrorType::Platform => ERROR_PLATFORM.clone(),
        }
    }

    pub fn parts(&self) -> &[Identifier] {
        &self.parts
    }

    pub fn starts_with(&self, prefix: &[Identifier]) -> bool {
        self.parts.len() >= prefix.len() && self.parts[..prefix.len()] == *prefix
    }

    /// Returns the invoke id if this is a `done.invoke.<id>` event.
    pub fn done_invoke_id(&self) -> Option<InvokeId> {
        if self.parts.len() > 2 && self.parts[0].as_str() == "done" && self.parts[1].as_str() == "invoke"
        {
            let id = self.parts[2..]
                .iter()
                .map(Identifier::as_str)
                .collect::<Vec<_>>()
                .join(".");
            return Some(InvokeId::new(id));
        }
        None
    }
}

impl fmt::Display for EventName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (i, part) in self.parts.iter().enumerate() {
            if i > 0 {
                f.write_str(".")?;
            }
            f.write_str(part.as_str())?;
        }
        Ok(())
    }
}

impl fmt::Debug for EventName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "EventName({})", self)
    }
}

impl FromStr for EventName {
    type Err = CoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        EventName::parse(s)
    }
}

impl Serialize for EventName {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for EventName {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        EventName::parse(&s).map_err(serde::de::Error::custom)
    }
}

/// A transition's event matcher.
///
/// `*` matches everything. Otherwise the descriptor matches any event name it is a
/// token prefix of, so `error` and `error.*` both match `error.execution`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EventDescriptor {
    Any,
    Prefix(Vec<Identifier>),
}

impl EventDescriptor {
    pub fn parse(text: &str) -> Result<Self, CoreError> {
        let text = text.trim();
        if text == "*" {
            return Ok(EventDescriptor::Any);
        }
        let text = text.strip_suffix(".*").unwrap_or(text);
        let text = text.strip_suffix('.').unwrap_or(text);
        let name = EventName::parse(text)?;
        Ok(EventDescriptor::Prefix(name.parts().to_vec()))
    }

    /// Parses a space-separated descriptor list.
    pub fn parse_list(text: &str) -> Result<Vec<Self>, CoreError> {
        text.split_whitespace().map(EventDescriptor::parse).collect()
    }

    pub fn matches(&self, name: &EventName) -> bool {
        match self {
            EventDescriptor::Any => true,
            EventDescriptor::Prefix(prefix) => name.starts_with(prefix),
        }
    }
}

impl fmt::Display for EventDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            EventDescriptor::Any => f.write_str("*"),
            EventDescriptor::Prefix(parts) => {
                for (i, part) in parts.iter().enumerate() {
                    if i > 0 {
                        f.write_str(".")?;
                    }
                    f.write_str(part.as_str())?;
                }
                Ok(())
            }
        }
    }
}

macro_rules! string_id {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(Arc<str>);

        impl $name {
            pub fn new(value: impl AsRef<str>) -> Self {
                Self(Arc::from(value.as_ref()))
            }

            pub fn as_str(&self) -> &str {
                &self.0
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(&self.0)
            }
        }

        impl From<&str> for $name {
            fn from(s: &str) -> Self {
                Self::new(s)
            }
        }

        impl From<String> for $name {
            fn from(s: String) -> Self {
                Self(Arc::from(s))
            }
        }
    };
}

string_id!(
    /// Identifies one running state machine session.
    SessionId
);
string_id!(
    /// Correlates a send with later cancellation.
    SendId
);
string_id!(
    /// Identifies an invoked service within its parent session.
    InvokeId
);

impl SessionId {
    pub fn generate() -> Self {
        Self::new(uuid::Uuid::new_v4().simple().to_string())
    }
}

impl SendId {
    pub fn generate() -> Self {
        Self::new(uuid::Uuid::new_v4().simple().to_string())
    }
}

impl InvokeId {
    /// `<state_id>.<uuid>`, the form used when an invoke has no fixed id.
    pub fn generate(state_id: &Identifier) -> Self {
        Self::new(format!("{}.{}", state_id, uuid::Uuid::new_v4().simple()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_identifier_validation() {
        assert!(Identifier::new("idle").is_ok());
        assert!(Identifier::new("a.b").is_ok());
        assert!(Identifier::new("").is_err());
        assert!(Identifier::new("has space").is_err());
        assert!(Identifier::new("tab\there").is_err());
    }

    #[test]
    fn test_event_name_display() {
        let name = EventName::parse("done.state.idle").unwrap();
        assert_eq!(name.to_string(), "done.state.idle");
        assert_eq!(name.parts().len(), 3);
        assert!(EventName::parse("a..b").is_err());
    }

    #[test]
    fn test_reserved_names() {
        let id = Identifier::new("work").unwrap();
        assert_eq!(EventName::done_state(&id).to_string(), "done.state.work");
        assert_eq!(ERROR_EXECUTION.to_string(), "error.execution");

        let invoke = InvokeId::new("child.1");
        let done = EventName::done_invoke(&invoke);
        assert_eq!(done.to_string(), "done.invoke.child.1");
        assert_eq!(done.done_invoke_id(), Some(invoke));
        assert_eq!(ERROR_PLATFORM.done_invoke_id(), None);
    }

    #[test]
    fn test_descriptor_matching() {
        let any = EventDescriptor::parse("*").unwrap();
        let error = EventDescriptor::parse("error.*").unwrap();
        let bare = EventDescriptor::parse("error").unwrap();
        let exact = EventDescriptor::parse("error.execution").unwrap();

        let exec = ERROR_EXECUTION.clone();
        let errors = EventName::parse("errors").unwrap();

        assert!(any.matches(&exec));
        assert!(error.matches(&exec));
        assert!(bare.matches(&exec));
        assert!(exact.matches(&exec));
        assert!(!exact.matches(&ERROR_PLATFORM));
        assert!(!error.matches(&errors));
    }

    #[test]
    fn test_descriptor_list() {
        let list = EventDescriptor::parse_list("go  stop.*").unwrap();
        assert_eq!(list.len(), 2);
        assert_eq!(list[1].to_string(), "stop");
    }

    #[test]
    fn test_generated_invoke_id() {
        let state = Identifier::new("loader").unwrap();
        let a = InvokeId::generate(&state);
        let b = InvokeId::generate(&state);
        assert!(a.as_str().starts_with("loader."));
        assert_ne!(a, b);
    }
}
