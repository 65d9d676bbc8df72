//! Keyed container with access control and change notification.

use crate::access::Access;
use crate::error::ValueError;
use crate::value::Value;
use crate::CloneMap;
use indexmap::IndexMap;
use parking_lot::RwLock;
use std::fmt;
use std::sync::{Arc, LazyLock};

/// Kind of mutation reported to a [`ChangeHandler`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChangeAction {
    Set,
    Remove,
}

/// Callback fired after every set/remove on a container.
///
/// Replacing an existing entry reports `Remove` for the old value, then `Set`.
pub type ChangeHandler = Arc<dyn Fn(ChangeAction, &str, &Value) + Send + Sync>;

/// A stored entry.
#[derive(Debug, Clone)]
pub struct Descriptor {
    pub value: Value,
    pub read_only: bool,
}

impl Descriptor {
    pub fn new(value: Value) -> Self {
        Self {
            value,
            read_only: false,
        }
    }

    pub fn read_only(value: Value) -> Self {
        Self {
            value,
            read_only: true,
        }
    }
}

struct ObjectInner {
    access: Access,
    properties: IndexMap<String, Descriptor>,
    changed: Option<ChangeHandler>,
}

static EMPTY: LazyLock<Object> = LazyLock::new(|| Object::with_access(Access::Constant, 0));

/// A string-keyed container shared by reference.
///
/// Cloning an `Object` clones the handle, not the contents; use
/// [`Object::deep_clone`] for a structural copy. Properties keep insertion order.
#[derive(Clone)]
pub struct Object {
    inner: Arc<RwLock<ObjectInner>>,
}

impl Object {
    /// Creates an empty writable object.
    pub fn new() -> Self {
        Self::with_capacity(0)
    }

    /// Creates an empty writable object with room for `capacity` properties.
    pub fn with_capacity(capacity: usize) -> Self {
        Self::with_access(Access::Writable, capacity)
    }

    pub(crate) fn with_access(access: Access, capacity: usize) -> Self {
        Self {
            inner: Arc::new(RwLock::new(ObjectInner {
                access,
                properties: IndexMap::with_capacity(capacity),
                changed: None,
            })),
        }
    }

    /// Returns the shared empty constant object.
    pub fn empty() -> Self {
        EMPTY.clone()
    }

    /// Returns true if both handles point at the same container.
    pub fn ptr_eq(a: &Object, b: &Object) -> bool {
        Arc::ptr_eq(&a.inner, &b.inner)
    }

    pub(crate) fn addr(&self) -> usize {
        Arc::as_ptr(&self.inner) as *const () as usize
    }

    pub fn access(&self) -> Access {
        self.inner.read().access
    }

    pub fn len(&self) -> usize {
        self.inner.read().properties.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.read().properties.is_empty()
    }

    pub fn ensure_capacity(&self, capacity: usize) {
        let mut inner = self.inner.write();
        let len = inner.properties.len();
        if capacity > len {
            inner.properties.reserve(capacity - len);
        }
    }

    /// Returns the property value, or `Undefined` if absent.
    pub fn get(&self, key: &str) -> Value {
        self.inner
            .read()
            .properties
            .get(key)
            .map(|d| d.value.clone())
            .unwrap_or_default()
    }

    pub fn get_descriptor(&self, key: &str) -> Option<Descriptor> {
        self.inner.read().properties.get(key).cloned()
    }

    pub fn contains(&self, key: &str) -> bool {
        self.inner.read().properties.contains_key(key)
    }

    pub fn keys(&self) -> Vec<String> {
        self.inner.read().properties.keys().cloned().collect()
    }

    pub fn entries(&self) -> Vec<(String, Value)> {
        self.inner
            .read()
            .properties
            .iter()
            .map(|(k, d)| (k.clone(), d.value.clone()))
            .collect()
    }

    pub fn can_set(&self, key: &str) -> bool {
        let inner = self.inner.read();
        Self::writable_entry(&inner, key)
    }

    pub fn can_remove(&self, key: &str) -> bool {
        self.can_set(key)
    }

    fn writable_entry(inner: &ObjectInner, key: &str) -> bool {
        inner.access == Access::Writable
            && !inner
                .properties
                .get(key)
                .map(|d| d.read_only)
                .unwrap_or(false)
    }

    /// Sets a property.
    pub fn set(&self, key: &str, value: impl Into<Value>) -> Result<(), ValueError> {
        self.write_entry(key, Descriptor::new(value.into()), true)
    }

    /// Sets a property bypassing the writable/read-only entry checks.
    ///
    /// Constant objects still reject the write. Used to install system
    /// variables as read-only entries.
    pub fn define(&self, key: &str, value: impl Into<Value>, read_only: bool) -> Result<(), ValueError> {
        let descriptor = Descriptor {
            value: value.into(),
            read_only,
        };
        self.write_entry(key, descriptor, false)
    }

    fn write_entry(&self, key: &str, descriptor: Descriptor, checked: bool) -> Result<(), ValueError> {
        let new_value = descriptor.value.clone();
        let (handler, old) = {
            let mut inner = self.inner.write();
            if inner.access == Access::Constant || (checked && !Self::writable_entry(&inner, key)) {
                return Err(ValueError::ObjectCannotBeModified);
            }
            let old = inner.properties.insert(key.to_string(), descriptor);
            (inner.changed.clone(), old)
        };

        if let Some(handler) = handler {
            if let Some(old) = old {
                handler(ChangeAction::Remove, key, &old.value);
            }
            handler(ChangeAction::Set, key, &new_value);
        }
        Ok(())
    }

    /// Removes a property, returning its previous value.
    pub fn remove(&self, key: &str) -> Result<Option<Value>, ValueError> {
        let (handler, old) = {
            let mut inner = self.inner.write();
            if !Self::writable_entry(&inner, key) {
                return Err(ValueError::ObjectCannotBeModified);
            }
            let old = inner.properties.shift_remove(key);
            (inner.changed.clone(), old)
        };

        let old = old.map(|d| d.value);
        if let (Some(handler), Some(old)) = (handler, old.as_ref()) {
            handler(ChangeAction::Remove, key, old);
        }
        Ok(old)
    }

    /// Walks a dotted path of property names, returning `Undefined` on a miss.
    pub fn get_path(&self, path: &[&str]) -> Value {
        match path.split_first() {
            None => Value::Object(self.clone()),
            Some((head, rest)) => self.get(head).get_path(rest),
        }
    }

    /// Writes through a path, creating intermediate objects as needed.
    pub fn set_path(&self, path: &[&str], value: impl Into<Value>) -> Result<(), ValueError> {
        let (last, parents) = path
            .split_last()
            .ok_or_else(|| ValueError::InvalidPath("empty path".to_string()))?;

        let mut current = self.clone();
        for segment in parents {
            let next = match current.get(segment) {
                Value::Object(obj) => obj,
                Value::Undefined => {
                    let obj = Object::new();
                    current.set(segment, obj.clone())?;
                    obj
                }
                other => {
                    return Err(ValueError::TypeMismatch {
                        expected: "object",
                        found: other.type_name(),
                    })
                }
            };
            current = next;
        }
        current.set(last, value)
    }

    /// Registers the change notification callback, replacing any previous one.
    pub fn on_changed(&self, handler: ChangeHandler) {
        self.inner.write().changed = Some(handler);
    }

    pub fn make_read_only(&self) {
        let mut inner = self.inner.write();
        if inner.access == Access::Writable {
            inner.access = Access::ReadOnly;
        }
    }

    /// Freezes this object and everything reachable from it.
    pub fn make_deep_constant(&self) {
        let children: Vec<Value> = {
            let mut inner = self.inner.write();
            if inner.access == Access::Constant {
                return;
            }
            inner.access = Access::Constant;
            inner.properties.values().map(|d| d.value.clone()).collect()
        };
        for child in children {
            child.make_deep_constant();
        }
    }

    /// Moves the object along the access lattice.
    pub fn set_access(&self, target: Access) -> Result<(), ValueError> {
        let current = self.access();
        if current == target {
            return Ok(());
        }
        match target {
            Access::ReadOnly if current == Access::Writable => {
                self.make_read_only();
                Ok(())
            }
            Access::Constant => {
                self.make_deep_constant();
                Ok(())
            }
            _ => Err(ValueError::AccessCannotBeChanged {
                from: current,
                to: target,
            }),
        }
    }

    /// Clones the whole reachable graph with the given access level.
    pub fn deep_clone(&self, target: Access) -> Object {
        let mut map = CloneMap::default();
        self.deep_clone_with(target, &mut map)
    }

    pub fn clone_as_writable(&self) -> Object {
        self.deep_clone(Access::Writable)
    }

    pub fn clone_as_read_only(&self) -> Object {
        self.deep_clone(Access::ReadOnly)
    }

    pub fn as_constant(&self) -> Object {
        self.deep_clone(Access::Constant)
    }

    pub(crate) fn deep_clone_with(&self, target: Access, map: &mut CloneMap) -> Object {
        if target == Access::Constant {
            let inner = self.inner.read();
            if inner.properties.is_empty() {
                return Object::empty();
            }
            if inner.access == Access::Constant {
                return self.clone();
            }
        }

        if let Some(existing) = map.objects.get(&self.addr()) {
            return existing.clone();
        }

        let entries = self.entries();
        let clone = Object::with_access(target, entries.len());
        map.objects.insert(self.addr(), clone.clone());

        for (key, value) in entries {
            let value = value.deep_clone_with(target, map);
            let descriptor = Descriptor {
                value,
                read_only: target != Access::Writable,
            };
            clone.inner.write().properties.insert(key, descriptor);
        }

        clone
    }
}

impl Default for Object {
    fn default() -> Self {
        Self::new()
    }
}

impl PartialEq for Object {
    fn eq(&self, other: &Self) -> bool {
        Object::ptr_eq(self, other)
    }
}

impl fmt::Debug for Object {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let inner = self.inner.read();
        f.debug_struct("Object")
            .field("access", &inner.access)
            .field("keys", &inner.properties.keys().collect::<Vec<_>>())
            .finish()
    }
}

impl fmt::Display for Object {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(&Value::Object(self.clone()), f)
    }
}

impl<K: Into<String>, V: Into<Value>> FromIterator<(K, V)> for Object {
    fn from_iter<T: IntoIterator<Item = (K, V)>>(iter: T) -> Self {
        let obj = Object::new();
        {
            let mut inner = obj.inner.write();
            for (k, v) in iter {
                inner.properties.insert(k.into(), Descriptor::new(v.into()));
            }
        }
        obj
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex;

    #[test]
    fn test_get_set_remove() {
        let obj = Object::new();
        obj.set("a", 1.0).unwrap();
        obj.set("b", "text").unwrap();

        assert_eq!(obj.get("a"), Value::Number(1.0));
        assert_eq!(obj.get("b").as_str(), Some("text"));
        assert!(obj.get("missing").is_undefined());
        assert!(obj.contains("a"));

        assert_eq!(obj.remove("a").unwrap(), Some(Value::Number(1.0)));
        assert!(!obj.contains("a"));
        assert_eq!(obj.keys(), vec!["b".to_string()]);
    }

    #[test]
    fn test_deep_constant_rejects_mutation() {
        let obj = Object::new();
        obj.set("x", 1.0).unwrap();
        obj.make_deep_constant();

        assert_eq!(obj.set("x", 2.0), Err(ValueError::ObjectCannotBeModified));
        assert_eq!(obj.remove("x"), Err(ValueError::ObjectCannotBeModified));
        assert_eq!(
            obj.set_path(&["y", "z"], 1.0),
            Err(ValueError::ObjectCannotBeModified)
        );
        assert_eq!(
            obj.define("x", 3.0, true),
            Err(ValueError::ObjectCannotBeModified)
        );
        assert!(!obj.can_set("x"));
        assert!(!obj.can_remove("x"));
    }

    #[test]
    fn test_make_read_only_after_constant_is_noop() {
        let obj = Object::new();
        obj.make_deep_constant();
        obj.make_read_only();
        assert_eq!(obj.access(), Access::Constant);
    }

    #[test]
    fn test_set_access_cannot_go_back() {
        let obj = Object::new();
        obj.set_access(Access::ReadOnly).unwrap();
        assert!(matches!(
            obj.set_access(Access::Writable),
            Err(ValueError::AccessCannotBeChanged { .. })
        ));
        obj.set_access(Access::Constant).unwrap();
        assert_eq!(obj.access(), Access::Constant);
    }

    #[test]
    fn test_deep_constant_freezes_nested() {
        let inner = Object::new();
        let outer = Object::new();
        outer.set("inner", inner.clone()).unwrap();
        outer.make_deep_constant();

        assert_eq!(inner.access(), Access::Constant);
        assert!(inner.set("k", 1.0).is_err());
    }

    #[test]
    fn test_read_only_descriptor() {
        let obj = Object::new();
        obj.define("_name", "machine", true).unwrap();
        assert!(!obj.can_set("_name"));
        assert!(obj.set("_name", "other").is_err());
        assert!(obj.remove("_name").is_err());
        assert!(obj.can_set("free"));
    }

    #[test]
    fn test_cycle_safe_clone() {
        let obj = Object::new();
        obj.set("n", 5.0).unwrap();
        obj.set("self", obj.clone()).unwrap();

        let clone = obj.deep_clone(Access::Writable);
        assert!(!Object::ptr_eq(&clone, &obj));

        let self_ref = clone.get("self");
        let self_ref = self_ref.as_object().unwrap();
        assert!(Object::ptr_eq(self_ref, &clone));
        assert_eq!(clone.get("n"), Value::Number(5.0));
    }

    #[test]
    fn test_mutual_references_keep_topology() {
        let a = Object::new();
        let b = Object::new();
        a.set("b", b.clone()).unwrap();
        b.set("a", a.clone()).unwrap();
        a.set("b_again", b.clone()).unwrap();

        let a2 = a.deep_clone(Access::ReadOnly);
        let b2 = a2.get("b");
        let b2 = b2.as_object().unwrap();
        let b2_again = a2.get("b_again");

        assert!(Object::ptr_eq(b2, b2_again.as_object().unwrap()));
        assert!(Object::ptr_eq(b2.get("a").as_object().unwrap(), &a2));
        assert_eq!(a2.access(), Access::ReadOnly);
        assert!(!a2.can_set("b"));
    }

    #[test]
    fn test_empty_constant_is_shared() {
        let a = Object::new().as_constant();
        let b = Object::new().as_constant();
        assert!(Object::ptr_eq(&a, &b));
        assert!(Object::ptr_eq(&a, &Object::empty()));
    }

    #[test]
    fn test_constant_clone_of_constant_is_identity() {
        let obj = Object::new();
        obj.set("k", 1.0).unwrap();
        obj.make_deep_constant();
        assert!(Object::ptr_eq(&obj.as_constant(), &obj));
    }

    #[test]
    fn test_change_notifications() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let obj = Object::new();
        let sink = log.clone();
        obj.on_changed(Arc::new(move |action, key, value| {
            sink.lock().push((action, key.to_string(), value.clone()));
        }));

        obj.set("a", 1.0).unwrap();
        obj.set("a", 2.0).unwrap();
        obj.remove("a").unwrap();

        let log = log.lock();
        assert_eq!(log.len(), 4);
        assert_eq!(log[0], (ChangeAction::Set, "a".to_string(), Value::Number(1.0)));
        assert_eq!(log[1], (ChangeAction::Remove, "a".to_string(), Value::Number(1.0)));
        assert_eq!(log[2], (ChangeAction::Set, "a".to_string(), Value::Number(2.0)));
        assert_eq!(log[3], (ChangeAction::Remove, "a".to_string(), Value::Number(2.0)));
    }

    #[test]
    fn test_set_path_creates_intermediate_objects() {
        let obj = Object::new();
        obj.set_path(&["order", "customer", "name"], "ada").unwrap();
        assert_eq!(
            obj.get_path(&["order", "customer", "name"]).as_str(),
            Some("ada")
        );

        obj.set("flat", 1.0).unwrap();
        assert!(matches!(
            obj.set_path(&["flat", "x"], 1.0),
            Err(ValueError::TypeMismatch { .. })
        ));
    }
}
