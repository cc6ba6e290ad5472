/*
 *
 * Copyright 2025 gRPC authors.
 *
 * Permission is hereby granted, free of charge, to any person obtaining a copy
 * of this software and associated documentation files (the "Software"), to
 * deal in the Software without restriction, including without limitation the
 * rights to use, copy, modify, merge, publish, distribute, sublicense, and/or
 * sell copies of the Software, and to permit persons to whom the Software is
 * furnished to do so, subject to the following conditions:
 *
 * The above copyright notice and this permission notice shall be included in
 * all copies or substantial portions of the Software.
 *
 * THE SOFTWARE IS PROVIDED "AS IS", WITHOUT WARRANTY OF ANY KIND, EXPRESS OR
 * IMPLIED, INCLUDING BUT NOT LIMITED TO THE WARRANTIES OF MERCHANTABILITY,
 * FITNESS FOR A PARTICULAR PURPOSE AND NONINFRINGEMENT. IN NO EVENT SHALL THE
 * AUTHORS OR COPYRIGHT HOLDERS BE LIABLE FOR ANY CLAIM, DAMAGES OR OTHER
 * LIABILITY, WHETHER IN AN ACTION OF CONTRACT, TORT OR OTHERWISE, ARISING
 * FROM, OUT OF OR IN CONNECTION WITH THE SOFTWARE OR THE USE OR OTHER DEALINGS
 * IN THE SOFTWARE.
 *
 */

//! Typed key/value data attached to address groups, subchannels and resolver
//! results.

use std::any::{Any, TypeId};
use std::collections::BTreeMap;
use std::fmt::Debug;
use std::sync::Arc;

trait AttributeValue: Any + Send + Sync + Debug {
    fn as_any(&self) -> &dyn Any;
    fn dyn_eq(&self, other: &dyn AttributeValue) -> bool;
}

impl<T: Any + Send + Sync + PartialEq + Debug> AttributeValue for T {
    fn as_any(&self) -> &dyn Any {
        self
    }

    fn dyn_eq(&self, other: &dyn AttributeValue) -> bool {
        other
            .as_any()
            .downcast_ref::<T>()
            .is_some_and(|other| self == other)
    }
}

/// An immutable collection of values indexed by their type.
///
/// Adding or removing a value returns a new `Attributes`; the original is left
/// untouched, so attributes can be shared freely between the resolver, the
/// load balancer and the subchannels it creates.  Equality is structural: two
/// collections are equal if they hold equal values of the same types.
#[derive(Clone, Default, Debug)]
pub struct Attributes {
    map: Arc<BTreeMap<TypeId, Arc<dyn AttributeValue>>>,
}

impl Attributes {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns a copy of these attributes with `value` added, replacing any
    /// existing value of the same type.
    pub fn add<T: Send + Sync + PartialEq + Debug + 'static>(&self, value: T) -> Self {
        let mut map = (*self.map).clone();
        map.insert(TypeId::of::<T>(), Arc::new(value));
        Self { map: Arc::new(map) }
    }

    /// Gets a reference to the value of type T, if present.
    pub fn get<T: 'static>(&self) -> Option<&T> {
        self.map
            .get(&TypeId::of::<T>())
            .and_then(|v| v.as_any().downcast_ref())
    }

    /// Returns a copy of these attributes without the value of type T.
    pub fn remove<T: 'static>(&self) -> Self {
        let mut map = (*self.map).clone();
        map.remove(&TypeId::of::<T>());
        Self { map: Arc::new(map) }
    }

    pub fn is_empty(&self) -> bool {
        self.map.is_empty()
    }
}

impl PartialEq for Attributes {
    fn eq(&self, other: &Self) -> bool {
        self.map.len() == other.map.len()
            && self
                .map
                .iter()
                .zip(other.map.iter())
                .all(|((k1, v1), (k2, v2))| k1 == k2 && v1.dyn_eq(v2.as_ref()))
    }
}

impl Eq for Attributes {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn add_get_remove() {
        let attrs = Attributes::new().add(42i32).add("hello".to_string());
        assert_eq!(attrs.get::<i32>(), Some(&42));
        assert_eq!(attrs.get::<String>(), Some(&"hello".to_string()));
        assert_eq!(attrs.get::<bool>(), None);

        let removed = attrs.remove::<i32>();
        assert_eq!(removed.get::<i32>(), None);
        // The original is unchanged.
        assert_eq!(attrs.get::<i32>(), Some(&42));
    }

    #[test]
    fn structural_equality() {
        let a1 = Attributes::new().add(10i32);
        let a2 = Attributes::new().add(10i32);
        assert_eq!(a1, a2);

        let a3 = a1.add("foo".to_string());
        assert_ne!(a1, a3);
        assert_ne!(a1, Attributes::new().add(11i32));
    }

    #[test]
    fn replace_same_type() {
        let attrs = Attributes::new().add(1u8).add(2u8);
        assert_eq!(attrs.get::<u8>(), Some(&2));
    }
}
