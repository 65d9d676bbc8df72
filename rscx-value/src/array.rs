//! Indexed container with access control.

use crate::access::Access;
use crate::error::ValueError;
use crate::object::{ChangeAction, ChangeHandler, Descriptor};
use crate::value::Value;
use crate::CloneMap;
use parking_lot::RwLock;
use std::fmt;
use std::sync::{Arc, LazyLock};

struct ArrayInner {
    access: Access,
    items: Vec<Descriptor>,
    changed: Option<ChangeHandler>,
}

static EMPTY: LazyLock<Array> = LazyLock::new(|| Array::with_access(Access::Constant, 0));

/// An integer-indexed container shared by reference.
///
/// Writing past the end pads the gap with `Undefined`.
#[derive(Clone)]
pub struct Array {
    inner: Arc<RwLock<ArrayInner>>,
}

impl Array {
    pub fn new() -> Self {
        Self::with_capacity(0)
    }

    pub fn with_capacity(capacity: usize) -> Self {
        Self::with_access(Access::Writable, capacity)
    }

    pub(crate) fn with_access(access: Access, capacity: usize) -> Self {
        Self {
            inner: Arc::new(RwLock::new(ArrayInner {
                access,
                items: Vec::with_capacity(capacity),
                changed: None,
            })),
        }
    }

    /// Returns the shared empty constant array.
    pub fn empty() -> Self {
        EMPTY.clone()
    }

    pub fn ptr_eq(a: &Array, b: &Array) -> bool {
        Arc::ptr_eq(&a.inner, &b.inner)
    }

    pub(crate) fn addr(&self) -> usize {
        Arc::as_ptr(&self.inner) as *const () as usize
    }

    pub fn access(&self) -> Access {
        self.inner.read().access
    }

    pub fn len(&self) -> usize {
        self.inner.read().items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.read().items.is_empty()
    }

    /// Returns the item, or `Undefined` if out of range.
    pub fn get(&self, index: usize) -> Value {
        self.inner
            .read()
            .items
            .get(index)
            .map(|d| d.value.clone())
            .unwrap_or_default()
    }

    pub fn values(&self) -> Vec<Value> {
        self.inner
            .read()
            .items
            .iter()
            .map(|d| d.value.clone())
            .collect()
    }

    pub fn can_set(&self, index: usize) -> bool {
        Self::writable_entry(&self.inner.read(), index)
    }

    pub fn can_remove(&self, index: usize) -> bool {
        let inner = self.inner.read();
        index < inner.items.len() && Self::writable_entry(&inner, index)
    }

    fn writable_entry(inner: &ArrayInner, index: usize) -> bool {
        inner.access == Access::Writable
            && !inner
                .items
                .get(index)
                .map(|d| d.read_only)
                .unwrap_or(false)
    }

    pub fn set(&self, index: usize, value: impl Into<Value>) -> Result<(), ValueError> {
        let value = value.into();
        let (handler, old) = {
            let mut inner = self.inner.write();
            if !Self::writable_entry(&inner, index) {
                return Err(ValueError::ObjectCannotBeModified);
            }
            while inner.items.len() <= index {
                inner.items.push(Descriptor::new(Value::Undefined));
            }
            let old = std::mem::replace(&mut inner.items[index], Descriptor::new(value.clone()));
            (inner.changed.clone(), old.value)
        };

        if let Some(handler) = handler {
            let key = index.to_string();
            if !old.is_undefined() {
                handler(ChangeAction::Remove, &key, &old);
            }
            handler(ChangeAction::Set, &key, &value);
        }
        Ok(())
    }

    pub fn push(&self, value: impl Into<Value>) -> Result<(), ValueError> {
        let index = self.len();
        self.set(index, value)
    }

    /// Removes the item at `index`, shifting later items down.
    pub fn remove(&self, index: usize) -> Result<Value, ValueError> {
        let (handler, old) = {
            let mut inner = self.inner.write();
            if !Self::writable_entry(&inner, index) {
                return Err(ValueError::ObjectCannotBeModified);
            }
            if index >= inner.items.len() {
                return Err(ValueError::InvalidPath(format!("index {} out of range", index)));
            }
            let old = inner.items.remove(index);
            (inner.changed.clone(), old.value)
        };

        if let Some(handler) = handler {
            handler(ChangeAction::Remove, &index.to_string(), &old);
        }
        Ok(old)
    }

    pub fn on_changed(&self, handler: ChangeHandler) {
        self.inner.write().changed = Some(handler);
    }

    pub fn make_read_only(&self) {
        let mut inner = self.inner.write();
        if inner.access == Access::Writable {
            inner.access = Access::ReadOnly;
        }
    }

    pub fn make_deep_constant(&self) {
        let children: Vec<Value> = {
            let mut inner = self.inner.write();
            if inner.access == Access::Constant {
                return;
            }
            inner.access = Access::Constant;
            inner.items.iter().map(|d| d.value.clone()).collect()
        };
        for child in children {
            child.make_deep_constant();
        }
    }

    pub fn deep_clone(&self, target: Access) -> Array {
        let mut map = CloneMap::default();
        self.deep_clone_with(target, &mut map)
    }

    pub(crate) fn deep_clone_with(&self, target: Access, map: &mut CloneMap) -> Array {
        if target == Access::Constant {
            let inner = self.inner.read();
            if inner.items.is_empty() {
                return Array::empty();
            }
            if inner.access == Access::Constant {
                return self.clone();
            }
        }

        if let Some(existing) = map.arrays.get(&self.addr()) {
            return existing.clone();
        }

        let values = self.values();
        let clone = Array::with_access(target, values.len());
        map.arrays.insert(self.addr(), clone.clone());

        for value in values {
            let value = value.deep_clone_with(target, map);
            let descriptor = Descriptor {
                value,
                read_only: target != Access::Writable,
            };
            clone.inner.write().items.push(descriptor);
        }

        clone
    }
}

impl Default for Array {
    fn default() -> Self {
        Self::new()
    }
}

impl PartialEq for Array {
    fn eq(&self, other: &Self) -> bool {
        Array::ptr_eq(self, other)
    }
}

impl fmt::Debug for Array {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let inner = self.inner.read();
        f.debug_struct("Array")
            .field("access", &inner.access)
            .field("len", &inner.items.len())
            .finish()
    }
}

impl fmt::Display for Array {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(&Value::Array(self.clone()), f)
    }
}

impl<V: Into<Value>> FromIterator<V> for Array {
    fn from_iter<T: IntoIterator<Item = V>>(iter: T) -> Self {
        let array = Array::new();
        {
            let mut inner = array.inner.write();
            for v in iter {
                inner.items.push(Descriptor::new(v.into()));
            }
        }
        array
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::Object;

    #[test]
    fn test_push_get_remove() {
        let arr = Array::new();
        arr.push(1.0).unwrap();
        arr.push("two").unwrap();
        assert_eq!(arr.len(), 2);
        assert_eq!(arr.get(0), Value::Number(1.0));
        assert!(arr.get(5).is_undefined());

        assert_eq!(arr.remove(0).unwrap(), Value::Number(1.0));
        assert_eq!(arr.get(0).as_str(), Some("two"));
        assert!(arr.remove(3).is_err());
    }

    #[test]
    fn test_set_past_end_pads() {
        let arr = Array::new();
        arr.set(2, true).unwrap();
        assert_eq!(arr.len(), 3);
        assert!(arr.get(0).is_undefined());
        assert_eq!(arr.get(2), Value::Boolean(true));
    }

    #[test]
    fn test_constant_rejects_mutation() {
        let arr: Array = vec![1.0, 2.0].into_iter().collect();
        arr.make_deep_constant();
        assert_eq!(arr.push(3.0), Err(ValueError::ObjectCannotBeModified));
        assert_eq!(arr.set(0, 3.0), Err(ValueError::ObjectCannotBeModified));
        assert_eq!(arr.remove(0), Err(ValueError::ObjectCannotBeModified));
        arr.make_read_only();
        assert_eq!(arr.access(), Access::Constant);
    }

    #[test]
    fn test_array_containing_itself_clones() {
        let arr = Array::new();
        arr.push(arr.clone()).unwrap();
        let clone = arr.deep_clone(Access::Constant);
        let first = clone.get(0);
        assert!(Array::ptr_eq(first.as_array().unwrap(), &clone));
        assert_eq!(clone.access(), Access::Constant);
    }

    #[test]
    fn test_object_array_cycle() {
        let obj = Object::new();
        let arr = Array::new();
        arr.push(obj.clone()).unwrap();
        obj.set("list", arr.clone()).unwrap();

        let clone = obj.deep_clone(Access::Writable);
        let list = clone.get("list");
        let back = list.as_array().unwrap().get(0);
        assert!(Object::ptr_eq(back.as_object().unwrap(), &clone));
    }
}
