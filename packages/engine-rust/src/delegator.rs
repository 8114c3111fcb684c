//! Session façade.
//!
//! [`PersistenceDelegator`] is what application code talks to. Every call
//! goes through one session-scoped read/write lock: mutations and
//! transaction boundaries hold the write side for their whole duration,
//! `find` and `refresh` do their store reads under an upgradable read and
//! upgrade it in place to register what they loaded, so no mutation can run
//! between the load and the registration.
//!
//! A mutation builds the object graph of its root, transitions every node,
//! linearizes the graph into the flush stack and drains it (in
//! [`FlushMode::Auto`]). The nodes are then registered in the persistence
//! cache, whether or not the flush succeeded.

use std::collections::HashSet;
use std::sync::Arc;

use parking_lot::{RwLock, RwLockUpgradableReadGuard};
use polystore_core::{
    CascadeType, EntityMetadata, EntityRef, MetadataError, NodeId, Persistable, Value,
};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::cache::PersistenceCache;
use crate::config::FlushMode;
use crate::error::{PersistenceError, Result};
use crate::events::LifecycleEvent;
use crate::factory::SessionContext;
use crate::flush::{
    build_flush_stack, FlushEvent, FlushExecutor, FlushReport, FlushStack, JoinTableData,
};
use crate::graph::{ObjectGraph, ObjectGraphBuilder};
use crate::loader::EntityLoader;
use crate::node::{Node, NodeState};
use crate::transaction::TransactionCoordinator;

// ---------------------------------------------------------------------------
// Mutations
// ---------------------------------------------------------------------------

/// Top-level mutating operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Mutation {
    Persist,
    Merge,
    Remove,
}

impl Mutation {
    fn initial_state(self) -> NodeState {
        match self {
            Self::Persist | Self::Merge => NodeState::Transient,
            Self::Remove => NodeState::Managed,
        }
    }

    fn cascade(self) -> CascadeType {
        match self {
            Self::Persist => CascadeType::Persist,
            Self::Merge => CascadeType::Merge,
            Self::Remove => CascadeType::Remove,
        }
    }

    fn event(self) -> FlushEvent {
        match self {
            Self::Persist => FlushEvent::Insert,
            Self::Merge => FlushEvent::Update,
            Self::Remove => FlushEvent::Delete,
        }
    }

    fn callbacks(self) -> (LifecycleEvent, LifecycleEvent) {
        match self {
            Self::Persist => (LifecycleEvent::PrePersist, LifecycleEvent::PostPersist),
            Self::Merge => (LifecycleEvent::PreUpdate, LifecycleEvent::PostUpdate),
            Self::Remove => (LifecycleEvent::PreRemove, LifecycleEvent::PostRemove),
        }
    }

    fn apply(self, node: &mut Node) -> Result<()> {
        match self {
            Self::Persist => node.persist(),
            Self::Merge => node.merge(),
            Self::Remove => node.remove(),
        }
    }

    /// Mutation that writes a cached node's pending change.
    fn for_pending(state: NodeState) -> Option<Self> {
        match state {
            NodeState::New => Some(Self::Persist),
            NodeState::Managed => Some(Self::Merge),
            NodeState::Removed => Some(Self::Remove),
            NodeState::Transient | NodeState::Detached => None,
        }
    }
}

// ---------------------------------------------------------------------------
// Session state
// ---------------------------------------------------------------------------

#[derive(Default)]
struct SessionState {
    cache: PersistenceCache,
    stack: FlushStack,
    join_tables: Vec<JoinTableData>,
    transaction: TransactionCoordinator,
    closed: bool,
}

impl SessionState {
    fn ensure_open(&self) -> Result<()> {
        if self.closed {
            Err(PersistenceError::SessionClosed)
        } else {
            Ok(())
        }
    }
}

// ---------------------------------------------------------------------------
// PersistenceDelegator
// ---------------------------------------------------------------------------

/// One unit-of-work session.
pub struct PersistenceDelegator {
    id: Uuid,
    context: Arc<SessionContext>,
    state: RwLock<SessionState>,
}

impl PersistenceDelegator {
    pub(crate) fn new(id: Uuid, context: Arc<SessionContext>) -> Self {
        Self {
            id,
            context,
            state: RwLock::new(SessionState::default()),
        }
    }

    #[must_use]
    pub fn id(&self) -> Uuid {
        self.id
    }

    #[must_use]
    pub fn is_open(&self) -> bool {
        !self.state.read().closed
    }

    #[must_use]
    pub fn is_transaction_active(&self) -> bool {
        self.state.read().transaction.is_active()
    }

    /// Number of cached nodes.
    #[must_use]
    pub fn cached_nodes(&self) -> usize {
        self.state.read().cache.len()
    }

    // --- Mutations ---

    /// Makes `entity` and everything reachable through persist-cascading
    /// relations managed, inserting them.
    ///
    /// # Errors
    ///
    /// Validation errors for missing keys or required associations, an
    /// `InvalidState` error for removed or detached entities, and store
    /// failures from the flush.
    pub fn persist(&self, entity: &EntityRef) -> Result<()> {
        self.mutate(entity, Mutation::Persist)
    }

    /// Writes the current state of `entity` as an update.
    ///
    /// # Errors
    ///
    /// As [`persist`](Self::persist); merging a removed entity is an error.
    pub fn merge(&self, entity: &EntityRef) -> Result<()> {
        self.mutate(entity, Mutation::Merge)
    }

    /// Deletes `entity` and everything reachable through remove-cascading
    /// relations.
    ///
    /// # Errors
    ///
    /// As [`persist`](Self::persist); removing a detached entity is an error.
    pub fn remove(&self, entity: &EntityRef) -> Result<()> {
        self.mutate(entity, Mutation::Remove)
    }

    /// Persists a typed value and returns the entity now tracked for it.
    ///
    /// # Errors
    ///
    /// As [`persist`](Self::persist).
    pub fn persist_typed<T: Persistable>(&self, value: &T) -> Result<EntityRef> {
        let entity = EntityRef::new(value.to_entity());
        self.persist(&entity)?;
        Ok(entity)
    }

    fn mutate(&self, entity: &EntityRef, mutation: Mutation) -> Result<()> {
        let metadata = self.context.metamodel.entity(&entity.name())?;
        head_id(&metadata, entity)?;
        self.state.read().ensure_open()?;

        let (pre, post) = mutation.callbacks();
        self.context.events.fire_event_listeners(&metadata, entity, pre);
        {
            let mut guard = self.state.write();
            let state = &mut *guard;
            state.ensure_open()?;

            let mut graph = ObjectGraphBuilder::new(&self.context.metamodel, &state.cache)
                .build_graph(entity, mutation.initial_state(), mutation.cascade())?;
            for node in graph.nodes_mut() {
                mutation.apply(node)?;
            }
            let touched = touched_nodes(&graph);
            debug!(
                session = %self.id,
                node = %graph.head_id(),
                nodes = graph.len(),
                ?mutation,
                "graph built"
            );

            let outcome = if self.context.config.flush_mode == FlushMode::Auto {
                self.flush_graph(state, &mut graph, mutation.event()).map(|_| ())
            } else {
                Ok(())
            };
            register_graph(&mut state.cache, graph, &touched);
            outcome?;
        }
        self.context.events.fire_event_listeners(&metadata, entity, post);
        Ok(())
    }

    /// Linearizes `graph` and drains it.
    fn flush_graph(
        &self,
        state: &mut SessionState,
        graph: &mut ObjectGraph,
        event: FlushEvent,
    ) -> Result<FlushReport> {
        state.stack.clear_flush_stack();
        state.stack = build_flush_stack(graph, event);
        let report = self.executor().flush(
            graph,
            &mut state.stack,
            &mut state.join_tables,
            &state.transaction,
        )?;
        state.stack.clear_flush_stack();
        Ok(report)
    }

    /// Writes every dirty cached node, head nodes first.
    fn flush_dirty(&self, state: &mut SessionState) -> Result<FlushReport> {
        let mut pending = state.cache.dirty_heads();
        for id in state.cache.dirty_nodes() {
            if !pending.contains(&id) {
                pending.push(id);
            }
        }

        let mut report = FlushReport::default();
        for id in pending {
            let Some(node) = state.cache.get_node_from_cache(&id) else {
                continue;
            };
            if node.pending_write().is_none() {
                continue;
            }
            let Some(mutation) = Mutation::for_pending(node.state()) else {
                continue;
            };
            let entity = node.entity().clone();

            let mut graph = ObjectGraphBuilder::new(&self.context.metamodel, &state.cache)
                .build_graph(&entity, NodeState::Transient, mutation.cascade())?;
            for node in graph.nodes_mut() {
                if node.state() == NodeState::Transient {
                    node.persist()?;
                }
            }
            let touched = touched_nodes(&graph);
            let outcome = self.flush_graph(state, &mut graph, mutation.event());
            register_graph(&mut state.cache, graph, &touched);
            report += outcome?;
        }
        Ok(report)
    }

    fn executor(&self) -> FlushExecutor<'_> {
        FlushExecutor::new(
            self.id,
            &self.context.metamodel,
            &self.context.clients,
            &self.context.hooks,
        )
        .with_config(&self.context.config)
    }

    // --- Reads ---

    /// Looks up an entity by primary key.
    ///
    /// A clean cached copy is returned without touching the store; otherwise
    /// the row and its relations are loaded and cached. The caller always
    /// gets an independent copy.
    ///
    /// # Errors
    ///
    /// A validation error for null or non-identifying keys, metadata errors
    /// for unknown entities and store failures.
    pub fn find(&self, entity: &str, key: &Value) -> Result<Option<EntityRef>> {
        if key.is_null() {
            return Err(PersistenceError::validation(format!(
                "find {entity}: primary key must not be null"
            )));
        }
        let metadata = self.context.metamodel.entity(entity)?;
        let id = metadata.node_id_for_key(key).map_err(invalid_key)?;

        let state = self.state.upgradable_read();
        state.ensure_open()?;
        let hit = match state.cache.get_node_from_cache(&id) {
            Some(node) if node.state() == NodeState::Removed => return Ok(None),
            Some(node) if node.state() == NodeState::Managed && !node.is_dirty() => {
                Some(node.entity().deep_copy())
            }
            _ => None,
        };
        if let Some(found) = hit {
            drop(state);
            debug!(session = %self.id, node = %id, "cache hit");
            self.context
                .events
                .fire_event_listeners(&metadata, &found, LifecycleEvent::PostLoad);
            return Ok(Some(found));
        }
        let loaded = EntityLoader::new(&self.context.metamodel, &self.context.clients, &state.cache)
            .load(&metadata, key)?;
        let Some(loaded) = loaded else {
            debug!(session = %self.id, node = %id, "not found");
            return Ok(None);
        };

        let found = loaded.root.deep_copy();
        {
            let mut state = RwLockUpgradableReadGuard::upgrade(state);
            for (index, node) in loaded.nodes.into_iter().enumerate() {
                let cached = state.cache.get_node_from_cache(node.id());
                if index == 0 {
                    if cached.is_some_and(Node::is_dirty) {
                        let id = node.id().clone();
                        state.cache.mark_head(&id);
                    } else {
                        state.cache.add_head_node(node);
                    }
                } else if cached.is_none() {
                    state.cache.add_node(node);
                }
            }
        }
        debug!(session = %self.id, node = %id, "loaded from store");
        self.context
            .events
            .fire_event_listeners(&metadata, &found, LifecycleEvent::PostLoad);
        Ok(Some(found))
    }

    /// Looks up several keys, skipping those with no row.
    ///
    /// # Errors
    ///
    /// As [`find`](Self::find); the first failure aborts.
    pub fn find_many(&self, entity: &str, keys: &[Value]) -> Result<Vec<EntityRef>> {
        let mut found = Vec::with_capacity(keys.len());
        for key in keys {
            if let Some(e) = self.find(entity, key)? {
                found.push(e);
            }
        }
        Ok(found)
    }

    /// Looks up a typed value by primary key.
    ///
    /// # Errors
    ///
    /// As [`find`](Self::find), plus conversion failures.
    pub fn find_as<T: Persistable>(&self, key: impl Into<Value>) -> Result<Option<T>> {
        let Some(entity) = self.find(T::ENTITY, &key.into())? else {
            return Ok(None);
        };
        let value = T::from_entity(&entity.read())?;
        Ok(Some(value))
    }

    /// Overwrites `entity`, and entities reached through refresh-cascading
    /// relations, with their stored rows. Pending changes are discarded.
    ///
    /// # Errors
    ///
    /// `InvalidState` unless `entity` is managed by this session, `NotFound`
    /// when a row has disappeared, and store failures.
    pub fn refresh(&self, entity: &EntityRef) -> Result<()> {
        let metadata = self.context.metamodel.entity(&entity.name())?;
        let id = head_id(&metadata, entity)?;

        let state = self.state.upgradable_read();
        let reloaded = {
            state.ensure_open()?;
            match state.cache.get_node_from_cache(&id) {
                Some(node) => node.clone().refresh()?,
                None => Node::new(entity.clone(), metadata.clone(), NodeState::Transient)?.refresh()?,
            }

            let graph = ObjectGraphBuilder::new(&self.context.metamodel, &state.cache).build_graph(
                entity,
                NodeState::Managed,
                CascadeType::Refresh,
            )?;
            let mut reloaded = Vec::with_capacity(graph.len());
            for mut node in graph.into_nodes().into_values() {
                node.refresh()?;
                let client = self.context.clients.resolve(&node.metadata().persistence_unit)?;
                let stored_key = node
                    .metadata()
                    .id_of(&node.entity().read())
                    .cloned()
                    .ok_or_else(|| PersistenceError::validation(format!("{} has no key", node.id())))?;
                let record = client
                    .find(node.metadata(), &stored_key)
                    .map_err(|source| PersistenceError::store(client.store_name(), "refresh", source))?
                    .ok_or_else(|| PersistenceError::NotFound {
                        node: node.id().clone(),
                    })?;
                reloaded.push((node, record));
            }
            reloaded
        };

        let mut state = RwLockUpgradableReadGuard::upgrade(state);
        for (mut node, record) in reloaded {
            record.apply_to(node.metadata(), &mut node.entity().write());
            let snapshot = node.entity().deep_copy();
            node.set_entity(snapshot);
            node.find();
            debug!(session = %self.id, node = %node.id(), "refreshed");
            if node.id() == &id {
                state.cache.add_head_node(node);
            } else {
                state.cache.add_node(node);
            }
        }
        Ok(())
    }

    /// Stops tracking `entity` and entities reached through detach-cascading
    /// relations.
    ///
    /// # Errors
    ///
    /// Metadata and validation errors for the graph walk.
    pub fn detach(&self, entity: &EntityRef) -> Result<()> {
        let metadata = self.context.metamodel.entity(&entity.name())?;
        head_id(&metadata, entity)?;
        let mut state = self.state.write();
        state.ensure_open()?;
        let graph = ObjectGraphBuilder::new(&self.context.metamodel, &state.cache).build_graph(
            entity,
            NodeState::Detached,
            CascadeType::Detach,
        )?;
        for mut node in graph.into_nodes().into_values() {
            node.detach();
            if state.cache.remove_node(node.id()).is_some() {
                debug!(session = %self.id, node = %node.id(), "detached");
            }
        }
        Ok(())
    }

    /// Whether `entity` is managed by this session.
    ///
    /// # Errors
    ///
    /// Metadata errors and a validation error when `entity` has no key.
    pub fn contains(&self, entity: &EntityRef) -> Result<bool> {
        let metadata = self.context.metamodel.entity(&entity.name())?;
        let id = head_id(&metadata, entity)?;
        let state = self.state.read();
        state.ensure_open()?;
        Ok(state
            .cache
            .get_node_from_cache(&id)
            .is_some_and(|n| !matches!(n.state(), NodeState::Removed | NodeState::Detached)))
    }

    // --- Unit of work ---

    /// Writes every pending change in the cache, then executes pending
    /// batches. Junction-table records are applied unless a transaction is
    /// open.
    ///
    /// # Errors
    ///
    /// The first store failure.
    pub fn flush(&self) -> Result<FlushReport> {
        let mut guard = self.state.write();
        let state = &mut *guard;
        state.ensure_open()?;
        let mut report = self.flush_dirty(state)?;
        let executor = self.executor();
        executor.execute_pending_batches()?;
        if !state.transaction.is_active() {
            report.join_tables += executor.apply_join_tables(&mut state.join_tables)?;
        }
        info!(
            session = %self.id,
            written = report.written,
            batched = report.batched,
            deferred = report.deferred,
            "session flushed"
        );
        Ok(report)
    }

    /// Starts a transaction over every transactional store.
    ///
    /// # Errors
    ///
    /// `TransactionActive` when one is running, and configuration errors.
    pub fn begin(&self) -> Result<()> {
        let mut state = self.state.write();
        state.ensure_open()?;
        state
            .transaction
            .begin(&self.context.config, &self.context.clients)?;
        info!(session = %self.id, "transaction begun");
        Ok(())
    }

    /// Flushes pending changes and commits the running transaction.
    ///
    /// On failure the session state is discarded as on rollback.
    ///
    /// # Errors
    ///
    /// `TransactionNotActive` outside a transaction, store failures, and
    /// `PartialCommit` when some stores had committed before one failed.
    pub fn commit(&self) -> Result<()> {
        let mut guard = self.state.write();
        let state = &mut *guard;
        state.ensure_open()?;
        if !state.transaction.is_active() {
            return Err(PersistenceError::TransactionNotActive);
        }
        let result = self.commit_locked(state);
        if let Err(err) = &result {
            warn!(session = %self.id, error = %err, "commit failed, discarding session state");
            if state.transaction.is_active() {
                if let Err(rollback) = state.transaction.rollback(&self.context.clients) {
                    warn!(session = %self.id, error = %rollback, "rollback after failed commit failed");
                }
            }
            self.discard(state);
        }
        result
    }

    fn commit_locked(&self, state: &mut SessionState) -> Result<()> {
        self.flush_dirty(state)?;
        let executor = self.executor();
        executor.execute_pending_batches()?;
        let applied = state.transaction.commit(&self.context.clients)?;
        for (store, ops) in &applied {
            self.context.hooks.batch_written(store, ops);
        }
        executor.apply_join_tables(&mut state.join_tables)?;
        state.cache.settle();
        state.stack.clear_flush_stack();
        info!(session = %self.id, "transaction committed");
        Ok(())
    }

    /// Discards the running transaction, pending batches and the whole cache.
    ///
    /// # Errors
    ///
    /// `TransactionNotActive` outside a transaction.
    pub fn rollback(&self) -> Result<()> {
        let mut guard = self.state.write();
        let state = &mut *guard;
        state.ensure_open()?;
        state.transaction.rollback(&self.context.clients)?;
        self.discard(state);
        warn!(session = %self.id, "session rolled back");
        Ok(())
    }

    fn discard(&self, state: &mut SessionState) {
        self.executor().discard_pending_batches();
        state.join_tables.clear();
        state.stack.clear_flush_stack();
        state.cache.clean();
    }

    /// Drops every cached node. Pending writes are forgotten.
    ///
    /// # Errors
    ///
    /// `SessionClosed` on a closed session.
    pub fn clear(&self) -> Result<()> {
        let mut state = self.state.write();
        state.ensure_open()?;
        state.cache.clean();
        state.stack.clear_flush_stack();
        debug!(session = %self.id, "cache cleared");
        Ok(())
    }

    /// Ends the session: rolls back an open transaction, executes pending
    /// batches and junction-table records, and clears the cache. Closing twice
    /// is a no-op; every other call on a closed session fails.
    ///
    /// # Errors
    ///
    /// Store failures while executing pending work. The session is closed
    /// regardless.
    pub fn close(&self) -> Result<()> {
        let mut guard = self.state.write();
        let state = &mut *guard;
        if state.closed {
            return Ok(());
        }
        if state.transaction.is_active() {
            warn!(session = %self.id, "closing with an open transaction, rolling back");
            state.transaction.rollback(&self.context.clients)?;
            self.discard(state);
        }
        let executor = self.executor();
        let result = executor
            .execute_pending_batches()
            .and_then(|()| executor.apply_join_tables(&mut state.join_tables))
            .map(|_| ());
        state.join_tables.clear();
        state.stack.clear_flush_stack();
        state.cache.clean();
        state.closed = true;
        info!(session = %self.id, "session closed");
        result
    }
}

impl Drop for PersistenceDelegator {
    fn drop(&mut self) {
        if let Err(err) = self.close() {
            warn!(session = %self.id, error = %err, "close on drop failed");
        }
    }
}

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

fn head_id(metadata: &EntityMetadata, entity: &EntityRef) -> Result<NodeId> {
    metadata.node_id(&entity.read()).map_err(invalid_key)
}

fn invalid_key(err: MetadataError) -> PersistenceError {
    match err {
        MetadataError::InvalidKey { entity } => PersistenceError::validation(format!(
            "{entity}: primary key is missing or cannot identify an instance"
        )),
        other => other.into(),
    }
}

fn touched_nodes(graph: &ObjectGraph) -> HashSet<NodeId> {
    graph
        .nodes()
        .filter(|n| n.is_dirty())
        .map(|n| n.id().clone())
        .collect()
}

/// Moves the nodes of a flushed (or failed) graph into the cache.
///
/// Nodes the operation did not touch keep their cached entry. Written nodes
/// are cached as snapshots so later changes to the caller's instance do not
/// leak into the cache; nodes still pending keep the live instance. Deleted
/// and never-written nodes leave the cache.
fn register_graph(cache: &mut PersistenceCache, graph: ObjectGraph, touched: &HashSet<NodeId>) {
    let head = graph.head_id().clone();
    for (id, mut node) in graph.into_nodes() {
        let is_head = id == head;
        if !touched.contains(&id) && cache.contains(&id) {
            if is_head {
                cache.mark_head(&id);
            }
            continue;
        }
        let gone = match node.state() {
            NodeState::Transient | NodeState::Detached => true,
            NodeState::Removed => !node.is_dirty(),
            NodeState::New | NodeState::Managed => false,
        };
        if gone {
            cache.remove_node(&id);
            continue;
        }
        if !node.is_dirty() {
            let snapshot = node.entity().deep_copy();
            node.set_entity(snapshot);
        }
        if is_head {
            cache.add_head_node(node);
        } else {
            cache.add_node(node);
        }
    }
}

#[cfg(test)]
mod tests {
    use parking_lot::Mutex;
    use polystore_core::{AttributeDef, Entity, EntityRecord, Metamodel, RelationDef, RelationKind, ValueKind};

    use super::*;
    use crate::client::{ClientRegistry, InMemoryClient, StoreClient, WriteKind, WriteOp};
    use crate::config::{SessionConfig, StoreConfig};
    use crate::events::EntityListener;
    use crate::factory::SessionFactory;

    fn metamodel() -> Arc<Metamodel> {
        Arc::new(
            Metamodel::builder()
                .register(
                    EntityMetadata::new("Person", "mem", "persons", "id", ValueKind::Int)
                        .attribute(AttributeDef::new("name", ValueKind::String))
                        .relation(
                            RelationDef::new("address", "Address", RelationKind::ManyToOne)
                                .join_column("address_id")
                                .cascade(&[CascadeType::All]),
                        ),
                )
                .register(
                    EntityMetadata::new("Address", "mem", "addresses", "id", ValueKind::Int)
                        .attribute(AttributeDef::new("city", ValueKind::String)),
                )
                .build()
                .unwrap(),
        )
    }

    fn session(config: SessionConfig) -> (PersistenceDelegator, Arc<InMemoryClient>) {
        let client = Arc::new(InMemoryClient::new("mem"));
        let clients = Arc::new(ClientRegistry::new());
        clients.register(client.clone());
        let factory = SessionFactory::builder(metamodel(), clients)
            .config(config)
            .build()
            .unwrap();
        (factory.create_session(), client)
    }

    fn person(id: i64, name: &str) -> EntityRef {
        EntityRef::new(Entity::new("Person").with("id", id).with("name", name))
    }

    #[test]
    fn persist_then_find_hits_cache() {
        let (session, client) = session(SessionConfig::default());
        let alice = person(1, "alice");
        session.persist(&alice).unwrap();
        let finds = client.stats().finds;

        let found = session.find("Person", &Value::Int(1)).unwrap().unwrap();
        assert_eq!(found.field("name"), Some(Value::from("alice")));
        assert!(!found.ptr_eq(&alice));
        assert_eq!(client.stats().finds, finds);
    }

    #[test]
    fn caller_changes_do_not_leak_into_cache() {
        let (session, _) = session(SessionConfig::default());
        let alice = person(1, "alice");
        session.persist(&alice).unwrap();
        alice.write().set("name", "changed");
        let found = session.find("Person", &Value::Int(1)).unwrap().unwrap();
        assert_eq!(found.field("name"), Some(Value::from("alice")));
    }

    #[test]
    fn null_key_is_validation_error() {
        let (session, client) = session(SessionConfig::default());
        let err = session.find("Person", &Value::Null).unwrap_err();
        assert!(matches!(err, PersistenceError::Validation(_)));
        let keyless = EntityRef::new(Entity::new("Person").with("name", "x"));
        let err = session.persist(&keyless).unwrap_err();
        assert!(matches!(err, PersistenceError::Validation(_)));
        assert_eq!(client.stats().finds, 0);
        assert_eq!(client.stats().writes, 0);
    }

    #[test]
    fn merge_writes_update() {
        let (session, client) = session(SessionConfig::default());
        let alice = person(1, "alice");
        session.persist(&alice).unwrap();
        alice.write().set("name", "alicia");
        session.merge(&alice).unwrap();

        let kinds: Vec<WriteKind> = client.journal().iter().map(|e| e.kind).collect();
        assert_eq!(kinds, vec![WriteKind::Insert, WriteKind::Update]);
        let row = client.record("", "persons", &Value::Int(1)).unwrap();
        assert_eq!(row.fields.get("name"), Some(&Value::from("alicia")));
    }

    #[test]
    fn persist_removed_entity_fails() {
        let (session, _) = session(SessionConfig::default().flush_mode(FlushMode::Commit));
        let alice = person(1, "alice");
        session.persist(&alice).unwrap();
        session.flush().unwrap();
        session.remove(&alice).unwrap();
        let err = session.persist(&alice).unwrap_err();
        assert!(matches!(
            err,
            PersistenceError::InvalidState {
                state: NodeState::Removed,
                ..
            }
        ));
    }

    #[test]
    fn commit_mode_defers_writes_until_flush() {
        let (session, client) = session(SessionConfig::default().flush_mode(FlushMode::Commit));
        let alice = person(1, "alice");
        session.persist(&alice).unwrap();
        assert_eq!(client.stats().writes, 0);
        assert!(session.contains(&alice).unwrap());

        let report = session.flush().unwrap();
        assert_eq!(report.written, 1);
        assert_eq!(client.row_count("", "persons"), 1);
        assert_eq!(session.flush().unwrap().written, 0);
    }

    #[test]
    fn refresh_overwrites_pending_changes() {
        let (session, _) = session(SessionConfig::default());
        let alice = person(1, "alice");
        session.persist(&alice).unwrap();
        alice.write().set("name", "local");
        session.refresh(&alice).unwrap();
        assert_eq!(alice.field("name"), Some(Value::from("alice")));
    }

    #[test]
    fn refresh_requires_managed_entity() {
        let (session, _) = session(SessionConfig::default());
        let err = session.refresh(&person(9, "ghost")).unwrap_err();
        assert!(matches!(err, PersistenceError::InvalidState { .. }));
    }

    #[test]
    fn refresh_of_deleted_row_is_not_found() {
        let (session, client) = session(SessionConfig::default());
        let alice = person(1, "alice");
        session.persist(&alice).unwrap();
        let other = person(1, "alice");
        let metadata = metamodel().entity("Person").unwrap();
        let record = EntityRecord::from_entity(&metadata, &metamodel(), &other.read()).unwrap();
        client
            .delete(&WriteOp::new(WriteKind::Delete, &metadata, record))
            .unwrap();
        let err = session.refresh(&alice).unwrap_err();
        assert!(matches!(err, PersistenceError::NotFound { .. }));
    }

    #[test]
    fn closed_session_rejects_calls() {
        let (session, _) = session(SessionConfig::default());
        session.close().unwrap();
        session.close().unwrap();
        assert!(!session.is_open());
        assert!(matches!(
            session.persist(&person(1, "a")).unwrap_err(),
            PersistenceError::SessionClosed
        ));
        assert!(matches!(
            session.find("Person", &Value::Int(1)).unwrap_err(),
            PersistenceError::SessionClosed
        ));
    }

    #[test]
    fn commit_without_begin_fails() {
        let (session, _) = session(SessionConfig::default());
        assert!(matches!(
            session.commit().unwrap_err(),
            PersistenceError::TransactionNotActive
        ));
        assert!(matches!(
            session.rollback().unwrap_err(),
            PersistenceError::TransactionNotActive
        ));
    }

    #[test]
    fn transactional_writes_wait_for_commit() {
        let config = SessionConfig::default().with_store(StoreConfig::new("mem").transactional());
        let (session, client) = session(config);
        session.begin().unwrap();
        assert!(client.is_bound());
        session.persist(&person(1, "alice")).unwrap();
        assert_eq!(client.row_count("", "persons"), 0);

        session.commit().unwrap();
        assert_eq!(client.row_count("", "persons"), 1);
        assert!(!client.is_bound());
        assert!(!session.is_transaction_active());
        let cached = session.find("Person", &Value::Int(1)).unwrap().unwrap();
        assert_eq!(cached.field("name"), Some(Value::from("alice")));
    }

    #[derive(Default)]
    struct Recorder(Mutex<Vec<String>>);

    impl EntityListener for Recorder {
        fn on_event(&self, metadata: &EntityMetadata, _entity: &EntityRef, event: LifecycleEvent) {
            self.0.lock().push(format!("{}:{event}", metadata.entity));
        }
    }

    #[test]
    fn callbacks_fire_once_per_call() {
        let client = Arc::new(InMemoryClient::new("mem"));
        let clients = Arc::new(ClientRegistry::new());
        clients.register(client);
        let recorder = Arc::new(Recorder::default());
        let factory = SessionFactory::builder(metamodel(), clients)
            .listener(recorder.clone())
            .build()
            .unwrap();
        let session = factory.create_session();

        let address = EntityRef::new(Entity::new("Address").with("id", 7_i64).with("city", "Oslo"));
        let alice = person(1, "alice");
        alice.write().relate("address", &address);
        session.persist(&alice).unwrap();
        session.find("Person", &Value::Int(1)).unwrap();

        assert_eq!(
            *recorder.0.lock(),
            vec![
                "Person:pre-persist".to_string(),
                "Person:post-persist".to_string(),
                "Person:post-load".to_string(),
            ]
        );
    }
}
