//! Engine error type.
//!
//! Every failure that reaches a session caller is a [`PersistenceError`].
//! Store clients report with `anyhow::Error`; the flush and graph layers wrap
//! those into [`PersistenceError::Store`] so callers see one error surface.

use polystore_core::{MetadataError, NodeId};

use crate::node::NodeState;

/// Errors returned by session operations.
#[derive(Debug, thiserror::Error)]
pub enum PersistenceError {
    /// Invalid argument to a session operation, raised before any store access.
    #[error("validation failed: {0}")]
    Validation(String),
    /// Metadata lookup or entity/metadata mismatch.
    #[error(transparent)]
    Metadata(#[from] MetadataError),
    /// No store client registered for a persistence unit.
    #[error("no store client configured for persistence unit `{unit}`")]
    ClientNotFound { unit: String },
    /// A store client failed. Not retried at this layer.
    #[error("store `{store}` failed during {operation}: {source}")]
    Store {
        store: String,
        operation: &'static str,
        #[source]
        source: anyhow::Error,
    },
    /// A store is configured as transactional but its client cannot bind a resource.
    #[error("store `{store}` is configured as transactional but its client cannot bind a transaction resource")]
    TransactionConfig { store: String },
    /// A store is configured with a batch size but its client cannot batch.
    #[error("store `{store}` is configured with batch size {batch_size} but its client cannot batch")]
    BatchConfig { store: String, batch_size: usize },
    /// A lifecycle transition is not legal from the node's current state.
    #[error("cannot {operation} {node}: node is {state:?}")]
    InvalidState {
        node: NodeId,
        state: NodeState,
        operation: &'static str,
    },
    /// A row expected in its store is gone.
    #[error("{node} no longer exists in its store")]
    NotFound { node: NodeId },
    #[error("no transaction in progress")]
    TransactionNotActive,
    #[error("a transaction is already in progress")]
    TransactionActive,
    /// Commit failed after some stores had already committed. Not compensated.
    #[error("partial commit: committed {committed:?}, `{failed}` failed: {source}")]
    PartialCommit {
        committed: Vec<String>,
        failed: String,
        #[source]
        source: anyhow::Error,
    },
    #[error("session is closed")]
    SessionClosed,
}

impl PersistenceError {
    /// Wraps a store client failure.
    pub fn store(store: impl Into<String>, operation: &'static str, source: anyhow::Error) -> Self {
        Self::Store {
            store: store.into(),
            operation,
            source,
        }
    }

    /// Builds a validation error.
    pub fn validation(message: impl Into<String>) -> Self {
        Self::Validation(message.into())
    }
}

/// Result alias for engine operations.
pub type Result<T> = std::result::Result<T, PersistenceError>;
