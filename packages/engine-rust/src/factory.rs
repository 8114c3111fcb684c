//! Session factory.
//!
//! A [`SessionFactory`] is built once per application from the validated
//! [`Metamodel`], the [`ClientRegistry`] and the session configuration. It
//! owns the immutable [`SessionContext`] every session shares and checks the
//! transaction setup up front, so misconfigured stores fail at startup rather
//! than on the first `begin`.

use std::sync::Arc;

use polystore_core::Metamodel;
use tracing::{info, warn};
use uuid::Uuid;

use crate::client::ClientRegistry;
use crate::config::SessionConfig;
use crate::delegator::PersistenceDelegator;
use crate::error::{PersistenceError, Result};
use crate::events::{EntityListener, EventDispatcher};
use crate::observer::{CompositeIndexHook, IndexHook};

/// Everything a session needs that does not change after startup.
pub struct SessionContext {
    pub metamodel: Arc<Metamodel>,
    pub clients: Arc<ClientRegistry>,
    pub config: SessionConfig,
    pub events: EventDispatcher,
    pub hooks: CompositeIndexHook,
}

/// Creates sessions sharing one [`SessionContext`].
pub struct SessionFactory {
    context: Arc<SessionContext>,
}

impl SessionFactory {
    /// Starts a builder over `metamodel` and `clients`.
    #[must_use]
    pub fn builder(metamodel: Arc<Metamodel>, clients: Arc<ClientRegistry>) -> SessionFactoryBuilder {
        SessionFactoryBuilder {
            metamodel,
            clients,
            config: SessionConfig::default(),
            events: EventDispatcher::new(),
            hooks: CompositeIndexHook::default(),
        }
    }

    /// Opens a new session with a fresh id.
    #[must_use]
    pub fn create_session(&self) -> PersistenceDelegator {
        let id = Uuid::new_v4();
        info!(session = %id, "session opened");
        PersistenceDelegator::new(id, self.context.clone())
    }

    #[must_use]
    pub fn context(&self) -> &Arc<SessionContext> {
        &self.context
    }
}

/// Builder for [`SessionFactory`].
pub struct SessionFactoryBuilder {
    metamodel: Arc<Metamodel>,
    clients: Arc<ClientRegistry>,
    config: SessionConfig,
    events: EventDispatcher,
    hooks: CompositeIndexHook,
}

impl SessionFactoryBuilder {
    #[must_use]
    pub fn config(mut self, config: SessionConfig) -> Self {
        self.config = config;
        self
    }

    /// Adds a listener for every entity type.
    #[must_use]
    pub fn listener(mut self, listener: Arc<dyn EntityListener>) -> Self {
        self.events.add_listener(listener);
        self
    }

    /// Adds a listener for one entity type.
    #[must_use]
    pub fn entity_listener(mut self, entity: impl Into<String>, listener: Arc<dyn EntityListener>) -> Self {
        self.events.add_entity_listener(entity, listener);
        self
    }

    #[must_use]
    pub fn index_hook(mut self, hook: Arc<dyn IndexHook>) -> Self {
        self.hooks.add(hook);
        self
    }

    /// Validates the store configuration and freezes the context.
    ///
    /// # Errors
    ///
    /// Returns [`PersistenceError::ClientNotFound`] for a configured store with
    /// no registered client, [`PersistenceError::TransactionConfig`] for a
    /// transactional store whose client cannot bind a transaction resource
    /// and [`PersistenceError::BatchConfig`] for a batch size set on a client
    /// that cannot batch.
    pub fn build(self) -> Result<SessionFactory> {
        for store in &self.config.stores {
            let client = self.clients.resolve(&store.name)?;
            if store.transactional && client.as_transaction_binder().is_none() {
                return Err(PersistenceError::TransactionConfig {
                    store: store.name.clone(),
                });
            }
            if store.batch_size > 0 && client.as_batcher().is_none() {
                return Err(PersistenceError::BatchConfig {
                    store: store.name.clone(),
                    batch_size: store.batch_size,
                });
            }
        }
        for unit in self.metamodel.persistence_units() {
            if !self.clients.contains(&unit) {
                warn!(unit = %unit, "no store client registered for persistence unit");
            }
        }
        info!(
            entities = self.metamodel.len(),
            stores = self.clients.len(),
            flush_mode = ?self.config.flush_mode,
            "session factory ready"
        );
        Ok(SessionFactory {
            context: Arc::new(SessionContext {
                metamodel: self.metamodel,
                clients: self.clients,
                config: self.config,
                events: self.events,
                hooks: self.hooks,
            }),
        })
    }
}

#[cfg(test)]
mod tests {
    use polystore_core::{EntityMetadata, ValueKind};

    use super::*;
    use crate::client::InMemoryClient;
    use crate::config::StoreConfig;

    fn metamodel() -> Arc<Metamodel> {
        Arc::new(
            Metamodel::builder()
                .register(EntityMetadata::new("Person", "mem", "persons", "id", ValueKind::Int))
                .build()
                .unwrap(),
        )
    }

    #[test]
    fn transactional_store_needs_binder() {
        let clients = Arc::new(ClientRegistry::new());
        clients.register(Arc::new(InMemoryClient::new("mem").without_transactions()));
        let err = SessionFactory::builder(metamodel(), clients)
            .config(SessionConfig::default().with_store(StoreConfig::new("mem").transactional()))
            .build()
            .err()
            .unwrap();
        assert!(matches!(err, PersistenceError::TransactionConfig { store } if store == "mem"));
    }

    struct Plain;

    impl crate::client::StoreClient for Plain {
        fn store_name(&self) -> &str {
            "plain"
        }
        fn find(
            &self,
            _: &EntityMetadata,
            _: &polystore_core::Value,
        ) -> anyhow::Result<Option<polystore_core::EntityRecord>> {
            Ok(None)
        }
        fn find_by_relation(
            &self,
            _: &EntityMetadata,
            _: &str,
            _: &polystore_core::Value,
        ) -> anyhow::Result<Vec<polystore_core::EntityRecord>> {
            Ok(Vec::new())
        }
        fn join_table_targets(
            &self,
            _: &polystore_core::JoinTableDef,
            _: &polystore_core::Value,
        ) -> anyhow::Result<Vec<polystore_core::Value>> {
            Ok(Vec::new())
        }
        fn write(&self, _: &crate::client::WriteOp) -> anyhow::Result<()> {
            Ok(())
        }
        fn delete(&self, _: &crate::client::WriteOp) -> anyhow::Result<()> {
            Ok(())
        }
        fn persist_join_table(&self, _: &crate::flush::JoinTableData) -> anyhow::Result<()> {
            Ok(())
        }
        fn delete_by_column(
            &self,
            _: &str,
            _: &str,
            _: &str,
            _: &polystore_core::Value,
        ) -> anyhow::Result<usize> {
            Ok(0)
        }
    }

    #[test]
    fn batch_size_needs_batching_client() {
        let clients = Arc::new(ClientRegistry::new());
        clients.register(Arc::new(Plain));
        let err = SessionFactory::builder(metamodel(), clients)
            .config(SessionConfig::default().with_store(StoreConfig::new("plain").batch_size(8)))
            .build()
            .err()
            .unwrap();
        assert!(matches!(
            err,
            PersistenceError::BatchConfig { store, batch_size: 8 } if store == "plain"
        ));
    }

    #[test]
    fn configured_store_must_be_registered() {
        let err = SessionFactory::builder(metamodel(), Arc::new(ClientRegistry::new()))
            .config(SessionConfig::default().with_store(StoreConfig::new("mem")))
            .build()
            .err()
            .unwrap();
        assert!(matches!(err, PersistenceError::ClientNotFound { unit } if unit == "mem"));
    }

    #[test]
    fn sessions_get_distinct_ids() {
        let clients = Arc::new(ClientRegistry::new());
        clients.register(Arc::new(InMemoryClient::new("mem")));
        let factory = SessionFactory::builder(metamodel(), clients)
            .config(SessionConfig::default().with_store(StoreConfig::new("mem").transactional()))
            .build()
            .unwrap();
        let first = factory.create_session();
        let second = factory.create_session();
        assert_ne!(first.id(), second.id());
        assert!(first.is_open());
    }
}
