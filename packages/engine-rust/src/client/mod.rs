//! Store client abstraction.
//!
//! A [`StoreClient`] is the engine's only path to a backing store. Clients
//! advertise optional capabilities through [`StoreClient::as_batcher`] and
//! [`StoreClient::as_transaction_binder`]; the flush executor picks the write
//! path from what the resolved client supports.

pub mod memory;
pub mod registry;

use std::sync::Arc;

use polystore_core::{EntityMetadata, EntityRecord, JoinTableDef, Value};
use uuid::Uuid;

use crate::flush::join_table::JoinTableData;
use crate::transaction::TransactionResource;

pub use memory::InMemoryClient;
pub use registry::ClientRegistry;

// ---------------------------------------------------------------------------
// Write operations
// ---------------------------------------------------------------------------

/// Kind of row write.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum WriteKind {
    Insert,
    Update,
    Delete,
}

/// One row write handed to a store client, batch or transaction resource.
#[derive(Debug, Clone, PartialEq)]
pub struct WriteOp {
    pub kind: WriteKind,
    pub entity: String,
    pub schema: String,
    pub table: String,
    pub key: Value,
    /// Row as it stood when the write was queued. For deletes this is the
    /// last known state, kept for index maintenance.
    pub record: EntityRecord,
    /// Counter (append-only) rows are never batched.
    pub counter: bool,
    /// Whether index hooks should see this write.
    pub indexed: bool,
}

impl WriteOp {
    /// Builds the write for `record` of an entity described by `metadata`.
    #[must_use]
    pub fn new(kind: WriteKind, metadata: &EntityMetadata, record: EntityRecord) -> Self {
        Self {
            kind,
            entity: metadata.entity.clone(),
            schema: metadata.schema.clone(),
            table: metadata.table.clone(),
            key: record.key.clone(),
            record,
            counter: metadata.counter,
            indexed: metadata.indexed,
        }
    }
}

// ---------------------------------------------------------------------------
// Capabilities
// ---------------------------------------------------------------------------

/// Client that accumulates writes and applies them in one round trip.
///
/// Queued writes are kept apart per session: a session only ever sees,
/// executes or drops its own batch.
pub trait Batcher: Send + Sync {
    /// Threshold used when the session configuration does not set one for
    /// this store. Zero disables batching.
    fn batch_size(&self) -> usize;

    /// Queues one write for `session`.
    fn add_batch(&self, session: Uuid, op: WriteOp);

    /// Number of writes queued for `session`.
    fn pending_batch(&self, session: Uuid) -> usize;

    /// Applies every write queued for `session` in queue order and empties
    /// its queue.
    ///
    /// Returns the applied writes.
    ///
    /// # Errors
    ///
    /// Returns the first store failure. Writes before it stay applied; the
    /// queue is emptied either way.
    fn execute_batch(&self, session: Uuid) -> anyhow::Result<Vec<WriteOp>>;

    /// Drops the writes queued for `session` without applying them.
    fn clear_batch(&self, session: Uuid);
}

/// Client that can route its writes through a transaction resource.
pub trait TransactionBinder: Send + Sync {
    /// Attaches the resource for the current transaction.
    fn bind(&self, resource: Arc<dyn TransactionResource>);

    /// Detaches the resource once the transaction ends.
    fn unbind(&self);
}

// ---------------------------------------------------------------------------
// StoreClient
// ---------------------------------------------------------------------------

/// Synchronous access to one backing store.
///
/// Implementations own encoding and connection handling. Failures are
/// reported as `anyhow::Error`; the engine wraps them with the store name and
/// operation before returning them to callers.
///
/// Used as `Arc<dyn StoreClient>`.
pub trait StoreClient: Send + Sync {
    /// Name the client is registered under. Entity metadata selects a client
    /// through its persistence unit, which must equal this name.
    fn store_name(&self) -> &str;

    /// Loads one row by primary key.
    fn find(&self, metadata: &EntityMetadata, key: &Value) -> anyhow::Result<Option<EntityRecord>>;

    /// Loads rows of `metadata`'s table whose foreign key `column` equals `value`.
    fn find_by_relation(
        &self,
        metadata: &EntityMetadata,
        column: &str,
        value: &Value,
    ) -> anyhow::Result<Vec<EntityRecord>>;

    /// Keys paired with `owner` in a junction table.
    fn join_table_targets(
        &self,
        join_table: &JoinTableDef,
        owner: &Value,
    ) -> anyhow::Result<Vec<Value>>;

    /// Inserts or updates one row.
    fn write(&self, op: &WriteOp) -> anyhow::Result<()>;

    /// Deletes one row by primary key.
    fn delete(&self, op: &WriteOp) -> anyhow::Result<()>;

    /// Inserts junction rows pairing the record's owner with each target.
    fn persist_join_table(&self, data: &JoinTableData) -> anyhow::Result<()>;

    /// Deletes every row of `schema.table` whose `column` equals `value`.
    ///
    /// Returns the number of rows removed.
    fn delete_by_column(
        &self,
        schema: &str,
        table: &str,
        column: &str,
        value: &Value,
    ) -> anyhow::Result<usize>;

    /// Batching capability, if supported.
    fn as_batcher(&self) -> Option<&dyn Batcher> {
        None
    }

    /// Transaction binding capability, if supported.
    fn as_transaction_binder(&self) -> Option<&dyn TransactionBinder> {
        None
    }
}

/// Applies `op` through the plain write path of `client`.
///
/// # Errors
///
/// Propagates the client failure.
pub fn apply_write(client: &dyn StoreClient, op: &WriteOp) -> anyhow::Result<()> {
    match op.kind {
        WriteKind::Insert | WriteKind::Update => client.write(op),
        WriteKind::Delete => client.delete(op),
    }
}
