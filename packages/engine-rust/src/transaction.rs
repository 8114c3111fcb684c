//! Transaction resources and coordination.
//!
//! A transaction spans every store configured as transactional. On
//! [`TransactionCoordinator::begin`] each such store's client is bound to a
//! fresh [`TransactionResource`]; flushes then hand writes for those stores
//! to their resource instead of the store. Commit finalizes resources one at
//! a time, in store registration order. There is no two-phase protocol: a
//! store that fails after an earlier one committed leaves the earlier writes
//! in place and surfaces [`PersistenceError::PartialCommit`].

use std::sync::Arc;

use parking_lot::Mutex;
use tracing::{info, warn};

use crate::client::{apply_write, ClientRegistry, StoreClient, WriteOp};
use crate::config::SessionConfig;
use crate::error::{PersistenceError, Result};

// ---------------------------------------------------------------------------
// TransactionResource
// ---------------------------------------------------------------------------

/// Per-store participant in one transaction.
///
/// Used as `Arc<dyn TransactionResource>`.
pub trait TransactionResource: Send + Sync {
    fn store_name(&self) -> &str;

    /// Called once when the transaction starts.
    fn on_begin(&self) {}

    /// Buffers one write until commit.
    fn sync_node(&self, op: WriteOp);

    /// Number of buffered writes.
    fn pending(&self) -> usize;

    /// Applies buffered writes to the store, in the order they were synced.
    ///
    /// Returns the applied writes.
    ///
    /// # Errors
    ///
    /// Returns the first store failure.
    fn on_flush(&self) -> anyhow::Result<Vec<WriteOp>>;

    /// Finalizes the store-side transaction after [`on_flush`](Self::on_flush).
    ///
    /// # Errors
    ///
    /// Returns the store failure.
    fn on_commit(&self) -> anyhow::Result<()>;

    /// Discards buffered writes.
    fn on_rollback(&self);
}

/// Resource that buffers writes in memory and replays them through its client
/// on flush.
pub struct BufferedTransactionResource {
    client: Arc<dyn StoreClient>,
    buffer: Mutex<Vec<WriteOp>>,
}

impl BufferedTransactionResource {
    #[must_use]
    pub fn new(client: Arc<dyn StoreClient>) -> Self {
        Self {
            client,
            buffer: Mutex::new(Vec::new()),
        }
    }
}

impl TransactionResource for BufferedTransactionResource {
    fn store_name(&self) -> &str {
        self.client.store_name()
    }

    fn sync_node(&self, op: WriteOp) {
        self.buffer.lock().push(op);
    }

    fn pending(&self) -> usize {
        self.buffer.lock().len()
    }

    fn on_flush(&self) -> anyhow::Result<Vec<WriteOp>> {
        let ops = std::mem::take(&mut *self.buffer.lock());
        for op in &ops {
            apply_write(self.client.as_ref(), op)?;
        }
        Ok(ops)
    }

    fn on_commit(&self) -> anyhow::Result<()> {
        Ok(())
    }

    fn on_rollback(&self) {
        self.buffer.lock().clear();
    }
}

// ---------------------------------------------------------------------------
// TransactionCoordinator
// ---------------------------------------------------------------------------

/// Tracks the session's transaction and its participating resources.
#[derive(Default)]
pub struct TransactionCoordinator {
    active: bool,
    resources: Vec<Arc<dyn TransactionResource>>,
}

impl TransactionCoordinator {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn is_active(&self) -> bool {
        self.active
    }

    /// Resource bound for `store` in the running transaction.
    #[must_use]
    pub fn resource(&self, store: &str) -> Option<&Arc<dyn TransactionResource>> {
        if !self.active {
            return None;
        }
        self.resources.iter().find(|r| r.store_name() == store)
    }

    /// Starts a transaction, binding a resource to every transactional store.
    ///
    /// # Errors
    ///
    /// Returns [`PersistenceError::TransactionActive`] when one is already
    /// running, and resolution or configuration errors for stores that cannot
    /// take part.
    pub fn begin(&mut self, config: &SessionConfig, clients: &ClientRegistry) -> Result<()> {
        if self.active {
            return Err(PersistenceError::TransactionActive);
        }
        let mut resources: Vec<Arc<dyn TransactionResource>> = Vec::new();
        for store in config.stores.iter().filter(|s| s.transactional) {
            let client = clients.resolve(&store.name)?;
            let binder = client
                .as_transaction_binder()
                .ok_or_else(|| PersistenceError::TransactionConfig {
                    store: store.name.clone(),
                })?;
            let resource: Arc<dyn TransactionResource> =
                Arc::new(BufferedTransactionResource::new(client.clone()));
            binder.bind(resource.clone());
            resource.on_begin();
            resources.push(resource);
        }
        info!(stores = resources.len(), "transaction started");
        self.resources = resources;
        self.active = true;
        Ok(())
    }

    /// Flushes and commits every resource in order.
    ///
    /// Returns the writes applied, per store, for index maintenance. The
    /// transaction ends whether or not commit succeeds.
    ///
    /// # Errors
    ///
    /// Returns [`PersistenceError::TransactionNotActive`] outside a
    /// transaction. A failing store yields [`PersistenceError::Store`] when
    /// nothing was committed yet and [`PersistenceError::PartialCommit`]
    /// otherwise; resources after the failing one are rolled back.
    pub fn commit(&mut self, clients: &ClientRegistry) -> Result<Vec<(String, Vec<WriteOp>)>> {
        if !self.active {
            return Err(PersistenceError::TransactionNotActive);
        }
        let resources = std::mem::take(&mut self.resources);
        self.active = false;

        let mut applied = Vec::new();
        let mut committed: Vec<String> = Vec::new();
        let mut failure: Option<(String, anyhow::Error)> = None;
        for resource in &resources {
            if failure.is_some() {
                resource.on_rollback();
                continue;
            }
            let outcome = resource
                .on_flush()
                .and_then(|ops| resource.on_commit().map(|()| ops));
            match outcome {
                Ok(ops) => {
                    if !ops.is_empty() {
                        committed.push(resource.store_name().to_string());
                    }
                    applied.push((resource.store_name().to_string(), ops));
                }
                Err(err) => failure = Some((resource.store_name().to_string(), err)),
            }
        }
        unbind_all(&resources, clients);

        match failure {
            None => {
                info!(stores = applied.len(), written = committed.len(), "transaction committed");
                Ok(applied)
            }
            Some((failed, source)) if committed.is_empty() => {
                warn!(store = %failed, error = %source, "transaction commit failed");
                Err(PersistenceError::store(failed, "commit", source))
            }
            Some((failed, source)) => {
                warn!(
                    committed = ?committed,
                    store = %failed,
                    error = %source,
                    "transaction partially committed"
                );
                Err(PersistenceError::PartialCommit {
                    committed,
                    failed,
                    source,
                })
            }
        }
    }

    /// Discards every resource's buffered writes and ends the transaction.
    ///
    /// # Errors
    ///
    /// Returns [`PersistenceError::TransactionNotActive`] outside a transaction.
    pub fn rollback(&mut self, clients: &ClientRegistry) -> Result<()> {
        if !self.active {
            return Err(PersistenceError::TransactionNotActive);
        }
        let resources = std::mem::take(&mut self.resources);
        self.active = false;
        for resource in &resources {
            resource.on_rollback();
        }
        unbind_all(&resources, clients);
        warn!(stores = resources.len(), "transaction rolled back");
        Ok(())
    }
}

fn unbind_all(resources: &[Arc<dyn TransactionResource>], clients: &ClientRegistry) {
    for resource in resources {
        if let Ok(client) = clients.resolve(resource.store_name()) {
            if let Some(binder) = client.as_transaction_binder() {
                binder.unbind();
            }
        }
    }
}
