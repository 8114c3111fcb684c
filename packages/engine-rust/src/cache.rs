//! Session-scoped persistence cache.
//!
//! Maps node ids to nodes and tracks the head-node subset. The cache has no
//! locking of its own: it is owned by the session state and only touched
//! while the session lock is held.

use std::collections::{HashMap, HashSet};

use ahash::RandomState;
use polystore_core::NodeId;

use crate::node::{Node, NodeState};

/// Id-keyed node store plus the set of head nodes.
#[derive(Debug, Default)]
pub struct PersistenceCache {
    nodes: HashMap<NodeId, Node, RandomState>,
    heads: HashSet<NodeId, RandomState>,
}

impl PersistenceCache {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn get_node_from_cache(&self, id: &NodeId) -> Option<&Node> {
        self.nodes.get(id)
    }

    pub fn get_node_mut(&mut self, id: &NodeId) -> Option<&mut Node> {
        self.nodes.get_mut(id)
    }

    /// Stores `node`, replacing any node with the same id. Head membership is
    /// left unchanged.
    pub fn add_node(&mut self, mut node: Node) {
        node.clear_links();
        self.nodes.insert(node.id().clone(), node);
    }

    /// Stores `node` and marks it as a head node. Adding the same node twice
    /// has no further effect.
    pub fn add_head_node(&mut self, node: Node) {
        self.heads.insert(node.id().clone());
        self.add_node(node);
    }

    /// Marks an already cached node as a head node.
    pub fn mark_head(&mut self, id: &NodeId) {
        if self.nodes.contains_key(id) {
            self.heads.insert(id.clone());
        }
    }

    /// Settles nodes whose writes were queued in a transaction that has now
    /// committed: removed nodes leave the cache, others become clean
    /// snapshots.
    pub fn settle(&mut self) {
        let queued: Vec<NodeId> = self
            .nodes
            .values()
            .filter(|n| n.is_processed())
            .map(|n| n.id().clone())
            .collect();
        for id in queued {
            let removed = self
                .nodes
                .get(&id)
                .is_some_and(|n| n.state() == NodeState::Removed);
            if removed {
                self.remove_node(&id);
            } else if let Some(node) = self.nodes.get_mut(&id) {
                let snapshot = node.entity().deep_copy();
                node.set_entity(snapshot);
                node.mark_flushed();
            }
        }
    }

    pub fn remove_node(&mut self, id: &NodeId) -> Option<Node> {
        self.heads.remove(id);
        self.nodes.remove(id)
    }

    #[must_use]
    pub fn contains(&self, id: &NodeId) -> bool {
        self.nodes.contains_key(id)
    }

    #[must_use]
    pub fn is_head(&self, id: &NodeId) -> bool {
        self.heads.contains(id)
    }

    /// Ids of head nodes with a pending write, sorted for a stable flush order.
    #[must_use]
    pub fn dirty_heads(&self) -> Vec<NodeId> {
        let mut ids: Vec<NodeId> = self
            .heads
            .iter()
            .filter(|id| self.nodes.get(*id).is_some_and(Node::is_dirty))
            .cloned()
            .collect();
        ids.sort();
        ids
    }

    /// Ids of every node with a pending write, sorted.
    #[must_use]
    pub fn dirty_nodes(&self) -> Vec<NodeId> {
        let mut ids: Vec<NodeId> = self
            .nodes
            .values()
            .filter(|node| node.is_dirty())
            .map(|node| node.id().clone())
            .collect();
        ids.sort();
        ids
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    /// Drops every node.
    pub fn clean(&mut self) {
        self.nodes.clear();
        self.heads.clear();
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use polystore_core::{Entity, EntityMetadata, EntityRef, ValueKind};

    use super::*;

    fn node(id: i64, state: NodeState) -> Node {
        let metadata = Arc::new(EntityMetadata::new("Person", "pu", "persons", "id", ValueKind::Int));
        Node::new(
            EntityRef::new(Entity::new("Person").with("id", id)),
            metadata,
            state,
        )
        .unwrap()
    }

    #[test]
    fn head_node_is_idempotent() {
        let mut cache = PersistenceCache::new();
        cache.add_head_node(node(1, NodeState::Managed));
        cache.add_head_node(node(1, NodeState::Managed));
        assert_eq!(cache.len(), 1);
        assert!(cache.is_head(node(1, NodeState::Managed).id()));
    }

    #[test]
    fn add_node_keeps_head_membership() {
        let mut cache = PersistenceCache::new();
        let id = node(1, NodeState::Managed).id().clone();
        cache.add_node(node(1, NodeState::Managed));
        assert!(!cache.is_head(&id));
        cache.add_head_node(node(1, NodeState::Managed));
        cache.add_node(node(1, NodeState::Managed));
        assert!(cache.is_head(&id));
    }

    #[test]
    fn remove_drops_node_and_head() {
        let mut cache = PersistenceCache::new();
        let id = node(1, NodeState::Managed).id().clone();
        cache.add_head_node(node(1, NodeState::Managed));
        assert!(cache.remove_node(&id).is_some());
        assert!(!cache.contains(&id));
        assert!(!cache.is_head(&id));
    }

    #[test]
    fn dirty_heads_only_lists_pending_writes() {
        let mut cache = PersistenceCache::new();
        let mut dirty = node(2, NodeState::Transient);
        dirty.persist().unwrap();
        cache.add_head_node(dirty);
        cache.add_head_node(node(1, NodeState::Managed));
        let mut not_head = node(3, NodeState::Managed);
        not_head.merge().unwrap();
        cache.add_node(not_head);

        let heads: Vec<String> = cache.dirty_heads().iter().map(ToString::to_string).collect();
        assert_eq!(heads, vec!["Person#2".to_string()]);
    }

    #[test]
    fn settle_finishes_queued_nodes() {
        let mut cache = PersistenceCache::new();
        let mut updated = node(1, NodeState::Managed);
        updated.merge().unwrap();
        updated.mark_queued();
        let mut removed = node(2, NodeState::Managed);
        removed.remove().unwrap();
        removed.mark_queued();
        let live = updated.entity().clone();
        let updated_id = updated.id().clone();
        let removed_id = removed.id().clone();
        cache.add_head_node(updated);
        cache.add_head_node(removed);

        cache.settle();
        let settled = cache.get_node_from_cache(&updated_id).unwrap();
        assert!(!settled.is_dirty());
        assert!(!settled.entity().ptr_eq(&live), "cached entity is a snapshot");
        assert!(!cache.contains(&removed_id));
    }

    #[test]
    fn mark_head_requires_cached_node() {
        let mut cache = PersistenceCache::new();
        let id = node(1, NodeState::Managed).id().clone();
        cache.mark_head(&id);
        assert!(!cache.is_head(&id));
        cache.add_node(node(1, NodeState::Managed));
        cache.mark_head(&id);
        assert!(cache.is_head(&id));
    }

    #[test]
    fn clean_empties_cache() {
        let mut cache = PersistenceCache::new();
        cache.add_head_node(node(1, NodeState::Managed));
        cache.add_node(node(2, NodeState::Managed));
        cache.clean();
        assert!(cache.is_empty());
        assert!(cache.dirty_heads().is_empty());
    }
}
