//! The tagged dynamic value.

use crate::access::Access;
use crate::array::Array;
use crate::error::ValueError;
use crate::object::Object;
use crate::CloneMap;
use chrono::{DateTime, FixedOffset, Utc};
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::cmp::Ordering;
use std::fmt;

/// A dynamic value.
///
/// Primitives are copied; `Object` and `Array` are shared handles.
#[derive(Clone, Default)]
pub enum Value {
    #[default]
    Undefined,
    Null,
    Boolean(bool),
    Number(f64),
    String(String),
    DateTime(DateTime<FixedOffset>),
    Object(Object),
    Array(Array),
}

impl Value {
    pub fn type_name(&self) -> &'static str {
        match self {
            Value::Undefined => "undefined",
            Value::Null => "null",
            Value::Boolean(_) => "boolean",
            Value::Number(_) => "number",
            Value::String(_) => "string",
            Value::DateTime(_) => "datetime",
            Value::Object(_) => "object",
            Value::Array(_) => "array",
        }
    }

    pub fn is_undefined(&self) -> bool {
        matches!(self, Value::Undefined)
    }

    pub fn is_null(&self) -> bool {
        matches!(self, Value::Null)
    }

    pub fn as_bool(&self) -> Option<bool> {
        match self {
            Value::Boolean(b) => Some(*b),
            _ => None,
        }
    }

    pub fn as_number(&self) -> Option<f64> {
        match self {
            Value::Number(n) => Some(*n),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::String(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_datetime(&self) -> Option<&DateTime<FixedOffset>> {
        match self {
            Value::DateTime(dt) => Some(dt),
            _ => None,
        }
    }

    pub fn as_object(&self) -> Option<&Object> {
        match self {
            Value::Object(o) => Some(o),
            _ => None,
        }
    }

    pub fn as_array(&self) -> Option<&Array> {
        match self {
            Value::Array(a) => Some(a),
            _ => None,
        }
    }

    /// Truthiness used by conditions.
    ///
    /// `Undefined`, `Null`, `false`, `0`, `NaN` and `""` are falsy; containers are
    /// always truthy.
    pub fn is_truthy(&self) -> bool {
        match self {
            Value::Undefined | Value::Null => false,
            Value::Boolean(b) => *b,
            Value::Number(n) => *n != 0.0 && !n.is_nan(),
            Value::String(s) => !s.is_empty(),
            Value::DateTime(_) | Value::Object(_) | Value::Array(_) => true,
        }
    }

    /// Equality used by conditions: `Null` equals `Undefined`, containers compare
    /// by identity.
    pub fn loose_eq(&self, other: &Value) -> bool {
        match (self, other) {
            (Value::Undefined | Value::Null, Value::Undefined | Value::Null) => true,
            _ => self == other,
        }
    }

    /// Ordering for numbers, strings and datetimes. Other pairs are unordered.
    pub fn compare(&self, other: &Value) -> Option<Ordering> {
        match (self, other) {
            (Value::Number(a), Value::Number(b)) => a.partial_cmp(b),
            (Value::String(a), Value::String(b)) => Some(a.cmp(b)),
            (Value::DateTime(a), Value::DateTime(b)) => Some(a.cmp(b)),
            _ => None,
        }
    }

    /// Walks `path` through objects and arrays. Missing segments yield `Undefined`.
    pub fn get_path(&self, path: &[&str]) -> Value {
        let Some((head, rest)) = path.split_first() else {
            return self.clone();
        };
        match self {
            Value::Object(obj) => obj.get(head).get_path(rest),
            Value::Array(arr) => match head.parse::<usize>() {
                Ok(index) => arr.get(index).get_path(rest),
                Err(_) if *head == "length" && rest.is_empty() => Value::Number(arr.len() as f64),
                Err(_) => Value::Undefined,
            },
            _ => Value::Undefined,
        }
    }

    pub fn make_deep_constant(&self) {
        match self {
            Value::Object(o) => o.make_deep_constant(),
            Value::Array(a) => a.make_deep_constant(),
            _ => {}
        }
    }

    /// Structural copy with every container at `target` access.
    pub fn deep_clone(&self, target: Access) -> Value {
        let mut map = CloneMap::default();
        self.deep_clone_with(target, &mut map)
    }

    pub(crate) fn deep_clone_with(&self, target: Access, map: &mut CloneMap) -> Value {
        match self {
            Value::Object(o) => Value::Object(o.deep_clone_with(target, map)),
            Value::Array(a) => Value::Array(a.deep_clone_with(target, map)),
            other => other.clone(),
        }
    }

    /// Converts to a JSON tree.
    ///
    /// Fails with [`ValueError::CyclicReference`] if a container reaches itself.
    /// `Undefined` properties are skipped; non-finite numbers become `null`.
    pub fn to_json(&self) -> Result<serde_json::Value, ValueError> {
        let mut stack = Vec::new();
        self.to_json_inner(&mut stack)
    }

    fn to_json_inner(&self, stack: &mut Vec<usize>) -> Result<serde_json::Value, ValueError> {
        Ok(match self {
            Value::Undefined | Value::Null => serde_json::Value::Null,
            Value::Boolean(b) => serde_json::Value::Bool(*b),
            Value::Number(n) => serde_json::Number::from_f64(*n)
                .map(|num| {
                    if n.fract() == 0.0 && n.abs() < 9.0e15 {
                        serde_json::Value::from(*n as i64)
                    } else {
                        serde_json::Value::Number(num)
                    }
                })
                .unwrap_or(serde_json::Value::Null),
            Value::String(s) => serde_json::Value::String(s.clone()),
            Value::DateTime(dt) => serde_json::Value::String(dt.to_rfc3339()),
            Value::Object(obj) => {
                let addr = obj.addr();
                if stack.contains(&addr) {
                    return Err(ValueError::CyclicReference);
                }
                stack.push(addr);
                let mut map = serde_json::Map::new();
                for (key, value) in obj.entries() {
                    if value.is_undefined() {
                        continue;
                    }
                    map.insert(key, value.to_json_inner(stack)?);
                }
                stack.pop();
                serde_json::Value::Object(map)
            }
            Value::Array(arr) => {
                let addr = arr.addr();
                if stack.contains(&addr) {
                    return Err(ValueError::CyclicReference);
                }
                stack.push(addr);
                let items = arr
                    .values()
                    .iter()
                    .map(|v| v.to_json_inner(stack))
                    .collect::<Result<Vec<_>, _>>()?;
                stack.pop();
                serde_json::Value::Array(items)
            }
        })
    }

    /// Builds a writable value tree from JSON.
    pub fn from_json(json: &serde_json::Value) -> Value {
        match json {
            serde_json::Value::Null => Value::Null,
            serde_json::Value::Bool(b) => Value::Boolean(*b),
            serde_json::Value::Number(n) => Value::Number(n.as_f64().unwrap_or(f64::NAN)),
            serde_json::Value::String(s) => Value::String(s.clone()),
            serde_json::Value::Array(items) => {
                Value::Array(items.iter().map(Value::from_json).collect())
            }
            serde_json::Value::Object(map) => Value::Object(
                map.iter()
                    .map(|(k, v)| (k.clone(), Value::from_json(v)))
                    .collect(),
            ),
        }
    }

    fn fmt_inner(&self, f: &mut fmt::Formatter<'_>, stack: &mut Vec<usize>) -> fmt::Result {
        match self {
            Value::Undefined => write!(f, "undefined"),
            Value::Null => write!(f, "null"),
            Value::Boolean(b) => write!(f, "{}", b),
            Value::Number(n) => {
                if n.fract() == 0.0 && n.abs() < 9.0e15 {
                    write!(f, "{}", *n as i64)
                } else {
                    write!(f, "{}", n)
                }
            }
            Value::String(s) => write!(f, "{}", s),
            Value::DateTime(dt) => write!(f, "{}", dt.to_rfc3339()),
            Value::Object(obj) => {
                if stack.contains(&obj.addr()) {
                    return write!(f, "(...)");
                }
                stack.push(obj.addr());
                write!(f, "(")?;
                for (i, (key, value)) in obj.entries().iter().enumerate() {
                    if i > 0 {
                        write!(f, ",")?;
                    }
                    write!(f, "{}=", key)?;
                    value.fmt_inner(f, stack)?;
                }
                stack.pop();
                write!(f, ")")
            }
            Value::Array(arr) => {
                if stack.contains(&arr.addr()) {
                    return write!(f, "[...]");
                }
                stack.push(arr.addr());
                write!(f, "[")?;
                for (i, value) in arr.values().iter().enumerate() {
                    if i > 0 {
                        write!(f, ",")?;
                    }
                    value.fmt_inner(f, stack)?;
                }
                stack.pop();
                write!(f, "]")
            }
        }
    }
}

impl PartialEq for Value {
    fn eq(&self, other: &Self) -> bool {
        match (self, other) {
            (Value::Undefined, Value::Undefined) | (Value::Null, Value::Null) => true,
            (Value::Boolean(a), Value::Boolean(b)) => a == b,
            (Value::Number(a), Value::Number(b)) => a == b,
            (Value::String(a), Value::String(b)) => a == b,
            (Value::DateTime(a), Value::DateTime(b)) => a == b,
            (Value::Object(a), Value::Object(b)) => Object::ptr_eq(a, b),
            (Value::Array(a), Value::Array(b)) => Array::ptr_eq(a, b),
            _ => false,
        }
    }
}

impl fmt::Debug for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::String(s) => write!(f, "{:?}", s),
            Value::Object(o) => fmt::Debug::fmt(o, f),
            Value::Array(a) => fmt::Debug::fmt(a, f),
            other => fmt::Display::fmt(other, f),
        }
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut stack = Vec::new();
        self.fmt_inner(f, &mut stack)
    }
}

impl Serialize for Value {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let json = self.to_json().map_err(serde::ser::Error::custom)?;
        json.serialize(serializer)
    }
}

impl<'de> Deserialize<'de> for Value {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let json = serde_json::Value::deserialize(deserializer)?;
        Ok(Value::from_json(&json))
    }
}

impl From<bool> for Value {
    fn from(v: bool) -> Self {
        Value::Boolean(v)
    }
}

impl From<f64> for Value {
    fn from(v: f64) -> Self {
        Value::Number(v)
    }
}

impl From<i32> for Value {
    fn from(v: i32) -> Self {
        Value::Number(v as f64)
    }
}

impl From<i64> for Value {
    fn from(v: i64) -> Self {
        Value::Number(v as f64)
    }
}

impl From<u32> for Value {
    fn from(v: u32) -> Self {
        Value::Number(v as f64)
    }
}

impl From<usize> for Value {
    fn from(v: usize) -> Self {
        Value::Number(v as f64)
    }
}

impl From<&str> for Value {
    fn from(v: &str) -> Self {
        Value::String(v.to_string())
    }
}

impl From<String> for Value {
    fn from(v: String) -> Self {
        Value::String(v)
    }
}

impl From<Object> for Value {
    fn from(v: Object) -> Self {
        Value::Object(v)
    }
}

impl From<Array> for Value {
    fn from(v: Array) -> Self {
        Value::Array(v)
    }
}

impl From<DateTime<FixedOffset>> for Value {
    fn from(v: DateTime<FixedOffset>) -> Self {
        Value::DateTime(v)
    }
}

impl From<DateTime<Utc>> for Value {
    fn from(v: DateTime<Utc>) -> Self {
        Value::DateTime(v.fixed_offset())
    }
}

impl From<serde_json::Value> for Value {
    fn from(v: serde_json::Value) -> Self {
        Value::from_json(&v)
    }
}

impl From<&serde_json::Value> for Value {
    fn from(v: &serde_json::Value) -> Self {
        Value::from_json(v)
    }
}

impl<T: Into<Value>> From<Option<T>> for Value {
    fn from(v: Option<T>) -> Self {
        v.map(Into::into).unwrap_or(Value::Null)
    }
}
