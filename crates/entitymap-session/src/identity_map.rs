//! Identity Map pattern for tracking unique entity instances per primary key.
//!
//! The Identity Map ensures that each database row corresponds to exactly one
//! entity instance within a session. Rows that repeat because of join fan-out
//! resolve to the instance registered first.
//!
//! # Example
//!
//! ```ignore
//! let mut map = IdentityMap::new();
//! let canonical = map.register(&book, Value::BigInt(1));
//! assert_eq!(map.fetch("Book", &Value::BigInt(1)), Some(canonical));
//! ```

use crate::entity::{EntityId, EntityRef};
use entitymap_core::{KeyValue, Value};
use std::collections::HashMap;

/// Identity Map keyed by (entity name, primary key).
#[derive(Debug, Default)]
pub struct IdentityMap {
    entries: HashMap<(String, KeyValue), EntityRef>,
    /// Reverse index so an instance can be evicted without knowing its key.
    keys: HashMap<EntityId, (String, KeyValue)>,
}

impl IdentityMap {
    /// Create a new empty identity map.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// The canonical instance for `(entity, key)`, if registered.
    pub fn fetch(&self, entity: &str, key: &Value) -> Option<EntityRef> {
        if key.is_null() {
            return None;
        }
        self.entries
            .get(&(entity.to_string(), KeyValue::new(key.clone())))
            .cloned()
    }

    /// Register `instance` under `key`.
    ///
    /// If an instance is already registered for the same entity and key, the
    /// existing one is returned and `instance` is ignored. NULL keys are never
    /// registered.
    pub fn register(&mut self, instance: &EntityRef, key: Value) -> EntityRef {
        if key.is_null() {
            return instance.clone();
        }
        let map_key = (instance.entity().to_string(), KeyValue::new(key));
        if let Some(existing) = self.entries.get(&map_key) {
            return existing.clone();
        }
        self.keys.insert(instance.id(), map_key.clone());
        self.entries.insert(map_key, instance.clone());
        instance.clone()
    }

    /// Whether an instance is registered for `(entity, key)`.
    pub fn contains(&self, entity: &str, key: &Value) -> bool {
        self.fetch(entity, key).is_some()
    }

    /// Whether this exact instance is registered.
    pub fn contains_instance(&self, instance: &EntityRef) -> bool {
        self.keys.contains_key(&instance.id())
    }

    /// Remove the entry for `(entity, key)`.
    pub fn remove(&mut self, entity: &str, key: &Value) -> Option<EntityRef> {
        let removed = self
            .entries
            .remove(&(entity.to_string(), KeyValue::new(key.clone())))?;
        self.keys.remove(&removed.id());
        Some(removed)
    }

    /// Remove `instance` wherever it is registered.
    pub fn evict(&mut self, instance: &EntityRef) -> bool {
        match self.keys.remove(&instance.id()) {
            Some(map_key) => {
                self.entries.remove(&map_key);
                true
            }
            None => false,
        }
    }

    /// Clear all entries from the identity map.
    pub fn clear(&mut self) {
        self.entries.clear();
        self.keys.clear();
    }

    /// Get the number of entries in the map.
    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Check if the map is empty.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}
