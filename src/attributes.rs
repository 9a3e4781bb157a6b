//! An open-ended, typed attribute map.
//!
//! Addresses, resolver results, and subchannels all carry a bag of optional,
//! implementation-defined data. Rather than a stringly-typed
//! `HashMap<String, String>`, attributes are indexed by [`AttributeKey<T>`],
//! a zero-sized, strongly-typed handle that determines the value type `T`
//! stored under it. This mirrors the typed-extensions idiom used by
//! `http::Extensions` and `tonic`'s own extension maps, which the broader
//! pack leans on for the same purpose.

use std::any::{Any, TypeId};
use std::collections::HashMap;
use std::fmt;
use std::marker::PhantomData;
use std::sync::Arc;

/// A typed key into an [`Attributes`] map. Two keys constructed with
/// different `name`s are distinct even if `T` is the same, so callers
/// don't collide simply by picking the same value type.
pub struct AttributeKey<T> {
    name: &'static str,
    _marker: PhantomData<fn() -> T>,
}

impl<T> AttributeKey<T> {
    pub const fn new(name: &'static str) -> Self {
        Self {
            name,
            _marker: PhantomData,
        }
    }
}

// Manual impls: `#[derive(Clone, Copy)]` would require `T: Clone`/`T: Copy`,
// which isn't meaningful for a phantom marker.
impl<T> Clone for AttributeKey<T> {
    fn clone(&self) -> Self {
        *self
    }
}
impl<T> Copy for AttributeKey<T> {}

impl<T> fmt::Debug for AttributeKey<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AttributeKey").field("name", &self.name).finish()
    }
}

#[derive(Clone)]
struct Slot {
    type_id: TypeId,
    value: Arc<dyn Any + Send + Sync>,
}

/// An immutable-after-construction, typed attribute map.
///
/// `Attributes::new()` produces a normal, writable map. [`Attributes::EMPTY`]
/// is the sentinel instance described by the data model: it rejects any
/// attempt to mutate it, so code can hand it out as a zero-allocation
/// default without accidentally becoming a shared, mutable side channel.
#[derive(Clone, Default)]
pub struct Attributes {
    entries: HashMap<&'static str, Slot>,
    sealed: bool,
}

impl Attributes {
    /// The sentinel, mutation-rejecting empty instance.
    pub fn empty() -> Self {
        Self {
            entries: HashMap::new(),
            sealed: true,
        }
    }

    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Inserts `value` under `key`, returning the previous value if present
    /// and of the same type.
    ///
    /// # Panics
    ///
    /// Panics if called on [`Attributes::empty`] — the sentinel instance is
    /// immutable by contract.
    pub fn set<T: Send + Sync + 'static>(&mut self, key: AttributeKey<T>, value: T) {
        assert!(!self.sealed, "attempt to mutate the empty/sentinel Attributes map");
        self.entries.insert(
            key.name,
            Slot {
                type_id: TypeId::of::<T>(),
                value: Arc::new(value),
            },
        );
    }

    pub fn get<T: Send + Sync + 'static>(&self, key: AttributeKey<T>) -> Option<&T> {
        let slot = self.entries.get(key.name)?;
        if slot.type_id != TypeId::of::<T>() {
            return None;
        }
        slot.value.downcast_ref::<T>()
    }

    pub fn remove<T: Send + Sync + 'static>(&mut self, key: AttributeKey<T>) {
        assert!(!self.sealed, "attempt to mutate the empty/sentinel Attributes map");
        self.entries.remove(key.name);
    }
}

impl fmt::Debug for Attributes {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Attributes")
            .field("len", &self.entries.len())
            .field("sealed", &self.sealed)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    static NAME: AttributeKey<String> = AttributeKey::new("name");
    static COUNT: AttributeKey<u32> = AttributeKey::new("count");

    #[test]
    fn set_and_get_roundtrip() {
        let mut attrs = Attributes::new();
        attrs.set(NAME, "hello".to_string());
        attrs.set(COUNT, 42);
        assert_eq!(attrs.get(NAME), Some(&"hello".to_string()));
        assert_eq!(attrs.get(COUNT), Some(&42));
    }

    #[test]
    fn missing_key_is_none() {
        let attrs = Attributes::new();
        assert_eq!(attrs.get(NAME), None);
    }

    #[test]
    #[should_panic]
    fn empty_rejects_mutation() {
        let mut attrs = Attributes::empty();
        attrs.set(COUNT, 1);
    }
}
