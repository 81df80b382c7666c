//! Persistent scoped environments
//!
//! Every pass threads a `ScopedEnv` by value. Entering a scope pushes an
//! empty frame linked to its parent; leaving it simply drops the extended
//! value, so an outer binding of a shadowed name is visible again.

use std::collections::HashMap;
use std::rc::Rc;

#[derive(Debug)]
struct Frame<V> {
    bindings: HashMap<String, V>,
    parent: Option<Rc<Frame<V>>>,
}

#[derive(Debug)]
pub struct ScopedEnv<V> {
    head: Rc<Frame<V>>,
}

impl<V> Clone for ScopedEnv<V> {
    fn clone(&self) -> Self {
        Self {
            head: Rc::clone(&self.head),
        }
    }
}

impl<V: Clone> ScopedEnv<V> {
    pub fn new() -> Self {
        Self {
            head: Rc::new(Frame {
                bindings: HashMap::new(),
                parent: None,
            }),
        }
    }

    /// A new environment with an empty innermost scope
    pub fn enter(&self) -> Self {
        Self {
            head: Rc::new(Frame {
                bindings: HashMap::new(),
                parent: Some(Rc::clone(&self.head)),
            }),
        }
    }

    /// A new environment with `name` bound in the innermost scope.
    /// Returns `None` when the innermost scope already binds `name`.
    pub fn bind(&self, name: impl Into<String>, value: V) -> Option<Self> {
        let name = name.into();
        if self.head.bindings.contains_key(&name) {
            return None;
        }
        Some(self.rebind(name, value))
    }

    /// Like `bind`, but replaces an existing binding in the innermost scope
    pub fn rebind(&self, name: impl Into<String>, value: V) -> Self {
        let mut bindings = self.head.bindings.clone();
        bindings.insert(name.into(), value);
        Self {
            head: Rc::new(Frame {
                bindings,
                parent: self.head.parent.clone(),
            }),
        }
    }

    /// Innermost binding of `name`
    pub fn get(&self, name: &str) -> Option<&V> {
        let mut frame = Some(&self.head);
        while let Some(current) = frame {
            if let Some(value) = current.bindings.get(name) {
                return Some(value);
            }
            frame = current.parent.as_ref();
        }
        None
    }

    pub fn contains(&self, name: &str) -> bool {
        self.get(name).is_some()
    }
}

impl<V: Clone> Default for ScopedEnv<V> {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_shadowing_is_restored() {
        let outer = ScopedEnv::new().bind("x", 1).unwrap();
        let inner = outer.enter().bind("x", 2).unwrap();
        assert_eq!(inner.get("x"), Some(&2));
        assert_eq!(outer.get("x"), Some(&1));
    }

    #[test]
    fn test_no_leak_across_scopes() {
        let outer: ScopedEnv<u32> = ScopedEnv::new();
        let inner = outer.enter().bind("y", 7).unwrap();
        assert!(inner.contains("y"));
        assert!(!outer.contains("y"));
    }

    #[test]
    fn test_rebinding_same_scope_is_rejected() {
        let env = ScopedEnv::new().bind("x", 1).unwrap();
        assert!(env.bind("x", 2).is_none());
        assert!(env.enter().bind("x", 2).is_some());
    }
}
