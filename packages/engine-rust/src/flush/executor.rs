//! Flush execution.
//!
//! [`FlushExecutor`] drains a [`FlushStack`], writing each node with a
//! pending write to its store. The write path depends on the resolved client:
//!
//! 1. a batching client with a positive batch size queues the write, and the
//!    batch executes as soon as it is full (counter entities skip this path);
//! 2. otherwise, inside a transaction, a transactional store's resource
//!    buffers the write until commit;
//! 3. otherwise the write is applied immediately.
//!
//! Junction-table records collected along the way are applied after the
//! stack drains, once no batch still holds the rows they pair.
//!
//! Batches belong to the session driving the executor; pending-batch
//! execution and discard never reach another session's queued writes.

use std::collections::BTreeMap;

use polystore_core::{EntityRecord, Metamodel};
use tracing::debug;
use uuid::Uuid;

use super::join_table::{JoinTableData, JoinTableOperation};
use super::stack::FlushStack;
use crate::client::{apply_write, Batcher, ClientRegistry, StoreClient, WriteKind, WriteOp};
use crate::config::SessionConfig;
use crate::error::{PersistenceError, Result};
use crate::graph::ObjectGraph;
use crate::node::Node;
use crate::observer::CompositeIndexHook;
use crate::transaction::TransactionCoordinator;

/// How one flush distributed its writes.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FlushReport {
    /// Writes applied immediately.
    pub written: usize,
    /// Writes queued in client batches.
    pub batched: usize,
    /// Writes buffered in transaction resources.
    pub deferred: usize,
    /// Junction-table records applied.
    pub join_tables: usize,
}

impl std::ops::AddAssign for FlushReport {
    fn add_assign(&mut self, other: Self) {
        self.written += other.written;
        self.batched += other.batched;
        self.deferred += other.deferred;
        self.join_tables += other.join_tables;
    }
}

/// Write path a node took.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Dispatch {
    Immediate,
    Batched,
    Deferred,
}

/// Applies flush stacks and pending batches against the registered clients.
pub struct FlushExecutor<'a> {
    session: Uuid,
    metamodel: &'a Metamodel,
    clients: &'a ClientRegistry,
    hooks: &'a CompositeIndexHook,
    config: Option<&'a SessionConfig>,
}

impl<'a> FlushExecutor<'a> {
    /// Executor for `session`. Batch sizes come from the clients until a
    /// configuration is attached with [`with_config`](Self::with_config).
    #[must_use]
    pub fn new(
        session: Uuid,
        metamodel: &'a Metamodel,
        clients: &'a ClientRegistry,
        hooks: &'a CompositeIndexHook,
    ) -> Self {
        Self {
            session,
            metamodel,
            clients,
            hooks,
            config: None,
        }
    }

    /// Takes batch sizes of configured stores from `config`.
    #[must_use]
    pub fn with_config(mut self, config: &'a SessionConfig) -> Self {
        self.config = Some(config);
        self
    }

    /// Effective batch threshold for `store`. A configured store uses its
    /// configured size, zero included; others fall back to the client.
    fn batch_size(&self, store: &str, batcher: &dyn Batcher) -> usize {
        self.config
            .and_then(|config| config.store(store))
            .map_or_else(|| batcher.batch_size(), |s| s.batch_size)
    }

    /// Drains `stack`, writing the nodes of `graph` that have a pending write.
    ///
    /// Written nodes are marked flushed; nodes buffered in a transaction are
    /// marked queued. Junction-table records are appended to `join_tables`
    /// and applied at the end unless a transaction is running or a batch is
    /// still pending.
    ///
    /// # Errors
    ///
    /// The first failure aborts the drain. Nodes not yet popped stay on the
    /// stack.
    pub fn flush(
        &self,
        graph: &mut ObjectGraph,
        stack: &mut FlushStack,
        join_tables: &mut Vec<JoinTableData>,
        transaction: &TransactionCoordinator,
    ) -> Result<FlushReport> {
        let mut report = FlushReport::default();
        while let Some(id) = stack.pop() {
            let Some(node) = graph.node_mut(&id) else {
                continue;
            };
            let Some(kind) = node.pending_write() else {
                continue;
            };
            self.collect_join_tables(node, kind, join_tables)?;
            match self.dispatch(node, kind, transaction)? {
                Dispatch::Immediate => report.written += 1,
                Dispatch::Batched => report.batched += 1,
                Dispatch::Deferred => report.deferred += 1,
            }
        }

        if !transaction.is_active() && !self.has_pending_batches() {
            report.join_tables = self.apply_join_tables(join_tables)?;
        }
        debug!(
            written = report.written,
            batched = report.batched,
            deferred = report.deferred,
            join_tables = report.join_tables,
            "flush stack drained"
        );
        Ok(report)
    }

    fn dispatch(
        &self,
        node: &mut Node,
        kind: WriteKind,
        transaction: &TransactionCoordinator,
    ) -> Result<Dispatch> {
        let client = self.clients.resolve(&node.metadata().persistence_unit)?;
        let store = client.store_name().to_string();
        node.assign_client(&store);
        let op = self.write_op(node, kind)?;

        if let Some(batcher) = client.as_batcher() {
            let batch_size = self.batch_size(&store, batcher);
            if batch_size > 0 && !op.counter {
                debug!(node = %node.id(), store = %store, ?kind, "queued in batch");
                batcher.add_batch(self.session, op);
                node.mark_flushed();
                if batcher.pending_batch(self.session) >= batch_size {
                    self.execute_batch(client.as_ref())?;
                }
                return Ok(Dispatch::Batched);
            }
        }

        if let Some(resource) = transaction.resource(&store) {
            debug!(node = %node.id(), store = %store, ?kind, "buffered in transaction");
            resource.sync_node(op);
            node.mark_queued();
            return Ok(Dispatch::Deferred);
        }

        let operation = if kind == WriteKind::Delete { "delete" } else { "write" };
        apply_write(client.as_ref(), &op)
            .map_err(|source| PersistenceError::store(&store, operation, source))?;
        debug!(node = %node.id(), store = %store, ?kind, "written");
        self.hooks.written(&store, &op);
        node.mark_flushed();
        Ok(Dispatch::Immediate)
    }

    /// Row write for `node`. Deletes carry the key only.
    fn write_op(&self, node: &Node, kind: WriteKind) -> Result<WriteOp> {
        let metadata = node.metadata();
        let record = if kind == WriteKind::Delete {
            let entity = node.entity().read();
            let key = metadata.id_of(&entity).cloned().ok_or_else(|| {
                PersistenceError::validation(format!("{} has no key", node.id()))
            })?;
            EntityRecord {
                entity: metadata.entity.clone(),
                key,
                fields: BTreeMap::new(),
                references: BTreeMap::new(),
            }
        } else {
            let mut record =
                EntityRecord::from_entity(metadata, self.metamodel, &node.entity().read())?;
            for link in node.parents().values() {
                if let Some((column, key)) = &link.injected_key {
                    record.set_reference(column.clone(), key.clone());
                }
            }
            record
        };
        Ok(WriteOp::new(kind, metadata, record))
    }

    fn collect_join_tables(
        &self,
        node: &Node,
        kind: WriteKind,
        join_tables: &mut Vec<JoinTableData>,
    ) -> Result<()> {
        for relation in &node.metadata().relations {
            let Some(data) = JoinTableData::for_relation(node, relation, kind, self.metamodel)?
            else {
                continue;
            };
            if data.operation == JoinTableOperation::Insert && data.targets.is_empty() {
                continue;
            }
            join_tables.push(data);
        }
        Ok(())
    }

    fn execute_batch(&self, client: &dyn StoreClient) -> Result<()> {
        let Some(batcher) = client.as_batcher() else {
            return Ok(());
        };
        let store = client.store_name();
        let ops = batcher
            .execute_batch(self.session)
            .map_err(|source| PersistenceError::store(store, "execute batch", source))?;
        if !ops.is_empty() {
            debug!(store = %store, writes = ops.len(), "batch executed");
            self.hooks.batch_written(store, &ops);
        }
        Ok(())
    }

    /// Executes this session's pending batch on every batching client.
    ///
    /// # Errors
    ///
    /// Returns the first store failure.
    pub fn execute_pending_batches(&self) -> Result<()> {
        for client in self.clients.clients() {
            let pending = client
                .as_batcher()
                .is_some_and(|b| b.pending_batch(self.session) > 0);
            if pending {
                self.execute_batch(client.as_ref())?;
            }
        }
        Ok(())
    }

    /// Drops this session's pending batch on every batching client.
    pub fn discard_pending_batches(&self) {
        for client in self.clients.clients() {
            if let Some(batcher) = client.as_batcher() {
                batcher.clear_batch(self.session);
            }
        }
    }

    fn has_pending_batches(&self) -> bool {
        self.clients
            .clients()
            .iter()
            .any(|c| c.as_batcher().is_some_and(|b| b.pending_batch(self.session) > 0))
    }

    /// Applies every unprocessed junction-table record, then forgets the
    /// processed ones.
    ///
    /// Returns the number applied.
    ///
    /// # Errors
    ///
    /// Returns the first store failure; records after it stay pending.
    pub fn apply_join_tables(&self, join_tables: &mut Vec<JoinTableData>) -> Result<usize> {
        let mut applied = 0;
        let result = join_tables.iter_mut().try_for_each(|data| {
            let client = self.clients.resolve(&data.store)?;
            if data
                .apply(client.as_ref())
                .map_err(|source| PersistenceError::store(&data.store, "join table", source))?
            {
                applied += 1;
            }
            Ok::<(), PersistenceError>(())
        });
        join_tables.retain(|data| !data.is_processed());
        result.map(|()| applied)
    }
}
