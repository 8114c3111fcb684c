use std::sync::Arc;

use dashmap::DashMap;
use parking_lot::RwLock;

use super::StoreClient;
use crate::error::{PersistenceError, Result};

/// Registry of store clients keyed by store name.
///
/// Built once and injected into the session factory. Lookups are lock-free;
/// registration order is kept so batch execution and close sweep clients
/// deterministically.
pub struct ClientRegistry {
    by_name: DashMap<String, Arc<dyn StoreClient>>,
    order: RwLock<Vec<String>>,
}

impl ClientRegistry {
    /// Creates an empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self {
            by_name: DashMap::new(),
            order: RwLock::new(Vec::new()),
        }
    }

    /// Registers a client under its own store name. Registering a name twice
    /// replaces the earlier client and keeps its original position.
    pub fn register(&self, client: Arc<dyn StoreClient>) {
        let name = client.store_name().to_string();
        if self.by_name.insert(name.clone(), client).is_none() {
            self.order.write().push(name);
        }
    }

    /// Resolves the client for a persistence unit.
    ///
    /// # Errors
    ///
    /// Returns [`PersistenceError::ClientNotFound`] when nothing is registered
    /// under `unit`.
    pub fn resolve(&self, unit: &str) -> Result<Arc<dyn StoreClient>> {
        self.by_name
            .get(unit)
            .map(|entry| entry.value().clone())
            .ok_or_else(|| PersistenceError::ClientNotFound {
                unit: unit.to_string(),
            })
    }

    /// Whether a client is registered under `name`.
    #[must_use]
    pub fn contains(&self, name: &str) -> bool {
        self.by_name.contains_key(name)
    }

    /// Registered store names in registration order.
    #[must_use]
    pub fn names(&self) -> Vec<String> {
        self.order.read().clone()
    }

    /// Registered clients in registration order.
    #[must_use]
    pub fn clients(&self) -> Vec<Arc<dyn StoreClient>> {
        self.order
            .read()
            .iter()
            .filter_map(|name| self.by_name.get(name).map(|e| e.value().clone()))
            .collect()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.by_name.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.by_name.is_empty()
    }
}

impl Default for ClientRegistry {
    fn default() -> Self {
        Self::new()
    }
}
