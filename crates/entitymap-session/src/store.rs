//! Named backing stores.

use entitymap_core::{ConnectionError, ConnectionErrorKind, Connection, Error, Result};
use std::collections::HashMap;

/// Connections keyed by store name, with one default store.
///
/// Mappings without a store name, and queries that do not pick one, use the
/// default store.
#[derive(Debug)]
pub struct Stores<C: Connection> {
    default: String,
    connections: HashMap<String, C>,
}

impl<C: Connection> Stores<C> {
    /// Name of the store created by [`single`](Self::single).
    pub const DEFAULT: &'static str = "default";

    /// A single connection registered as the default store.
    pub fn single(connection: C) -> Self {
        Self::new(Self::DEFAULT, connection)
    }

    /// Register `connection` as the default store under `name`.
    pub fn new(name: impl Into<String>, connection: C) -> Self {
        let default = name.into();
        let mut connections = HashMap::new();
        connections.insert(default.clone(), connection);
        Self {
            default,
            connections,
        }
    }

    /// Add another named store (builder pattern).
    #[must_use]
    pub fn with(mut self, name: impl Into<String>, connection: C) -> Self {
        self.connections.insert(name.into(), connection);
        self
    }

    pub fn default_name(&self) -> &str {
        &self.default
    }

    /// Resolve a store name, `None` meaning the default store.
    pub fn name_of<'a>(&'a self, store: Option<&'a str>) -> &'a str {
        store.unwrap_or(&self.default)
    }

    /// The connection for `store`.
    #[allow(clippy::result_large_err)]
    pub fn get(&self, store: Option<&str>) -> Result<&C> {
        let name = self.name_of(store);
        self.connections.get(name).ok_or_else(|| {
            Error::Connection(ConnectionError {
                kind: ConnectionErrorKind::UnknownStore,
                message: format!("no connection registered for store '{name}'"),
                source: None,
            })
        })
    }

    pub fn len(&self) -> usize {
        self.connections.len()
    }

    pub fn is_empty(&self) -> bool {
        self.connections.is_empty()
    }
}
