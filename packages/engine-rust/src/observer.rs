//! Index maintenance hooks.
//!
//! Defines [`IndexHook`], notified whenever row writes reach a store, and
//! [`CompositeIndexHook`], which fans notifications out to several hooks.
//! Only writes of entities whose metadata is flagged `indexed` are reported.

use std::sync::Arc;

use crate::client::WriteOp;

/// Observer for row writes applied to a store.
///
/// Used as `Arc<dyn IndexHook>`.
pub trait IndexHook: Send + Sync {
    /// Called after a single write is applied.
    fn on_write(&self, store: &str, op: &WriteOp);

    /// Called after a batch (or a transaction's buffered writes) is applied.
    fn on_batch(&self, store: &str, ops: &[WriteOp]) {
        for op in ops {
            self.on_write(store, op);
        }
    }
}

/// Hook that fans out to multiple hooks, in registration order.
#[derive(Default)]
pub struct CompositeIndexHook {
    hooks: Vec<Arc<dyn IndexHook>>,
}

impl CompositeIndexHook {
    #[must_use]
    pub fn new(hooks: Vec<Arc<dyn IndexHook>>) -> Self {
        Self { hooks }
    }

    pub fn add(&mut self, hook: Arc<dyn IndexHook>) {
        self.hooks.push(hook);
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.hooks.is_empty()
    }

    /// Reports one applied write, skipping unindexed entities.
    pub fn written(&self, store: &str, op: &WriteOp) {
        if op.indexed {
            self.on_write(store, op);
        }
    }

    /// Reports applied writes, skipping unindexed entities.
    pub fn batch_written(&self, store: &str, ops: &[WriteOp]) {
        let indexed: Vec<WriteOp> = ops.iter().filter(|op| op.indexed).cloned().collect();
        if !indexed.is_empty() {
            self.on_batch(store, &indexed);
        }
    }
}

impl IndexHook for CompositeIndexHook {
    fn on_write(&self, store: &str, op: &WriteOp) {
        for hook in &self.hooks {
            hook.on_write(store, op);
        }
    }

    fn on_batch(&self, store: &str, ops: &[WriteOp]) {
        for hook in &self.hooks {
            hook.on_batch(store, ops);
        }
    }
}
