//! Entity nodes and their lifecycle state machine.
//!
//! A [`Node`] wraps one managed entity instance for the duration of a unit of
//! work. Links to other nodes are kept by [`NodeId`], never by pointer, so the
//! nodes of a cyclic object graph can live in a plain id-keyed arena.

use std::collections::BTreeMap;
use std::sync::Arc;

use polystore_core::{EntityMetadata, EntityRef, ForeignKeySide, MetadataError, NodeId, Value};

use crate::client::WriteKind;
use crate::error::{PersistenceError, Result};

/// Lifecycle state of a node.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum NodeState {
    /// Not yet tracked.
    Transient,
    /// Tracked, insert pending.
    New,
    /// Persisted; clean or dirty.
    Managed,
    /// Marked for deletion.
    Removed,
    /// Evicted from the cache, no longer tracked.
    Detached,
}

/// How a node is reached from one of its parents.
#[derive(Debug, Clone, PartialEq)]
pub struct ParentLink {
    /// Relation name on the parent.
    pub relation: String,
    pub side: ForeignKeySide,
    /// Foreign key the child row must carry for this parent, as
    /// `(join column, parent key)`. Set for one-to-many relations mapped by a
    /// join column on the child table.
    pub injected_key: Option<(String, Value)>,
}

/// How a node reaches one of its children.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChildLink {
    /// Relation name on this node.
    pub relation: String,
    pub side: ForeignKeySide,
}

/// One managed entity instance plus its lifecycle state.
#[derive(Debug, Clone)]
pub struct Node {
    id: NodeId,
    entity: EntityRef,
    metadata: Arc<EntityMetadata>,
    state: NodeState,
    dirty: bool,
    processed: bool,
    parents: BTreeMap<NodeId, ParentLink>,
    children: BTreeMap<NodeId, ChildLink>,
    client: Option<String>,
}

impl Node {
    /// Creates a node for `entity` in `state`.
    ///
    /// # Errors
    ///
    /// Returns [`MetadataError`] when the entity does not match its metadata or
    /// has no usable primary key.
    pub fn new(
        entity: EntityRef,
        metadata: Arc<EntityMetadata>,
        state: NodeState,
    ) -> std::result::Result<Self, MetadataError> {
        let id = metadata.node_id(&entity.read())?;
        Ok(Self {
            id,
            entity,
            metadata,
            state,
            dirty: false,
            processed: false,
            parents: BTreeMap::new(),
            children: BTreeMap::new(),
            client: None,
        })
    }

    #[must_use]
    pub fn id(&self) -> &NodeId {
        &self.id
    }

    #[must_use]
    pub fn entity(&self) -> &EntityRef {
        &self.entity
    }

    #[must_use]
    pub fn metadata(&self) -> &Arc<EntityMetadata> {
        &self.metadata
    }

    #[must_use]
    pub fn state(&self) -> NodeState {
        self.state
    }

    /// Whether a write for this node is pending and not yet committed.
    #[must_use]
    pub fn is_dirty(&self) -> bool {
        self.dirty
            && matches!(
                self.state,
                NodeState::New | NodeState::Managed | NodeState::Removed
            )
    }

    /// Whether this node's write was already handed to a batch or a
    /// transaction resource during the current flush cycle.
    #[must_use]
    pub fn is_processed(&self) -> bool {
        self.processed
    }

    /// Write the flush executor should issue for this node, if any.
    #[must_use]
    pub fn pending_write(&self) -> Option<WriteKind> {
        if !self.is_dirty() || self.processed {
            return None;
        }
        match self.state {
            NodeState::New => Some(WriteKind::Insert),
            NodeState::Managed => Some(WriteKind::Update),
            NodeState::Removed => Some(WriteKind::Delete),
            NodeState::Transient | NodeState::Detached => None,
        }
    }

    #[must_use]
    pub fn parents(&self) -> &BTreeMap<NodeId, ParentLink> {
        &self.parents
    }

    #[must_use]
    pub fn children(&self) -> &BTreeMap<NodeId, ChildLink> {
        &self.children
    }

    pub fn add_parent(&mut self, parent: NodeId, link: ParentLink) {
        self.parents.insert(parent, link);
    }

    pub fn add_child(&mut self, child: NodeId, link: ChildLink) {
        self.children.insert(child, link);
    }

    /// Drops graph links; used when a node leaves its graph for the cache.
    pub fn clear_links(&mut self) {
        self.parents.clear();
        self.children.clear();
    }

    /// Store client the node was dispatched to.
    #[must_use]
    pub fn client(&self) -> Option<&str> {
        self.client.as_deref()
    }

    pub fn assign_client(&mut self, store: &str) {
        self.client = Some(store.to_string());
    }

    /// Replaces the entity instance this node tracks.
    pub fn set_entity(&mut self, entity: EntityRef) {
        self.entity = entity;
    }

    // --- Transitions ---

    /// `Transient → New`. No-op when already `New` or `Managed`.
    ///
    /// # Errors
    ///
    /// Fails on `Removed` and `Detached` nodes.
    pub fn persist(&mut self) -> Result<()> {
        match self.state {
            NodeState::Transient => {
                self.state = NodeState::New;
                self.touch();
                Ok(())
            }
            NodeState::New | NodeState::Managed => Ok(()),
            NodeState::Removed | NodeState::Detached => Err(self.illegal("persist")),
        }
    }

    /// Marks the node dirty for update. A node still pending insert stays `New`.
    ///
    /// # Errors
    ///
    /// Fails on `Removed` nodes.
    pub fn merge(&mut self) -> Result<()> {
        match self.state {
            NodeState::Removed => Err(self.illegal("merge")),
            NodeState::New => {
                self.touch();
                Ok(())
            }
            NodeState::Transient | NodeState::Managed | NodeState::Detached => {
                self.state = NodeState::Managed;
                self.touch();
                Ok(())
            }
        }
    }

    /// `Managed → Removed`. Removing a never-written `New` node makes it
    /// `Transient` again, since there is nothing to delete.
    ///
    /// # Errors
    ///
    /// Fails on `Transient` and `Detached` nodes.
    pub fn remove(&mut self) -> Result<()> {
        match self.state {
            NodeState::Managed => {
                self.state = NodeState::Removed;
                self.touch();
                Ok(())
            }
            NodeState::New => {
                self.state = NodeState::Transient;
                self.dirty = false;
                self.processed = false;
                Ok(())
            }
            NodeState::Removed => Ok(()),
            NodeState::Transient | NodeState::Detached => Err(self.illegal("remove")),
        }
    }

    /// Marks the node as loaded from its store: `Managed` and clean.
    pub fn find(&mut self) {
        self.state = NodeState::Managed;
        self.dirty = false;
        self.processed = false;
    }

    /// Checks that a refresh is legal and marks the node clean.
    ///
    /// # Errors
    ///
    /// Fails unless the node is `Managed`.
    pub fn refresh(&mut self) -> Result<()> {
        if self.state != NodeState::Managed {
            return Err(self.illegal("refresh"));
        }
        self.dirty = false;
        self.processed = false;
        Ok(())
    }

    /// Any state → `Detached`.
    pub fn detach(&mut self) {
        self.state = NodeState::Detached;
        self.dirty = false;
        self.processed = false;
    }

    /// The node's write reached its store.
    pub fn mark_flushed(&mut self) {
        if self.state == NodeState::New {
            self.state = NodeState::Managed;
        }
        self.dirty = false;
        self.processed = false;
    }

    /// The node's write was queued in a batch or a transaction resource.
    pub fn mark_queued(&mut self) {
        self.processed = true;
    }

    fn touch(&mut self) {
        self.dirty = true;
        self.processed = false;
    }

    fn illegal(&self, operation: &'static str) -> PersistenceError {
        PersistenceError::InvalidState {
            node: self.id.clone(),
            state: self.state,
            operation,
        }
    }
}
