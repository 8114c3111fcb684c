//! Polystore Engine: persistence cache, object graphs, flush coordination and
//! transactions across heterogeneous store clients.

pub mod cache;
pub mod client;
pub mod config;
pub mod delegator;
pub mod error;
pub mod events;
pub mod factory;
pub mod flush;
pub mod graph;
pub mod loader;
pub mod node;
pub mod observer;
pub mod transaction;

pub use cache::PersistenceCache;
pub use client::{
    Batcher, ClientRegistry, InMemoryClient, StoreClient, TransactionBinder, WriteKind, WriteOp,
};
pub use config::{ConfigError, FlushMode, SessionConfig, StoreConfig};
pub use delegator::PersistenceDelegator;
pub use error::{PersistenceError, Result};
pub use events::{EntityListener, EventDispatcher, LifecycleEvent};
pub use factory::{SessionContext, SessionFactory, SessionFactoryBuilder};
pub use flush::{FlushEvent, FlushReport, FlushStack, JoinTableData, JoinTableOperation};
pub use graph::{ObjectGraph, ObjectGraphBuilder};
pub use node::{Node, NodeState};
pub use observer::{CompositeIndexHook, IndexHook};
pub use transaction::{BufferedTransactionResource, TransactionCoordinator, TransactionResource};
