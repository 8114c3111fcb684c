//! Object graph construction.
//!
//! [`ObjectGraphBuilder::build_graph`] walks the relations of a root entity
//! that cascade for the operation at hand and produces an [`ObjectGraph`]:
//! an id-keyed arena of [`Node`]s linked parent to child by id. A visited set
//! (the arena itself) makes the walk terminate on cyclic object graphs and
//! guarantees one node per entity instance.

use std::collections::BTreeMap;

use polystore_core::{
    CascadeType, EntityMetadata, EntityRef, ForeignKeySide, Metamodel, NodeId, RelationDef,
};

use crate::cache::PersistenceCache;
use crate::error::{PersistenceError, Result};
use crate::node::{ChildLink, Node, NodeState, ParentLink};

/// Nodes reachable from one head node.
#[derive(Debug)]
pub struct ObjectGraph {
    head: NodeId,
    nodes: BTreeMap<NodeId, Node>,
}

impl ObjectGraph {
    #[must_use]
    pub fn head_id(&self) -> &NodeId {
        &self.head
    }

    /// The head node. Always present until [`clear`](Self::clear).
    #[must_use]
    pub fn head(&self) -> Option<&Node> {
        self.nodes.get(&self.head)
    }

    #[must_use]
    pub fn node(&self, id: &NodeId) -> Option<&Node> {
        self.nodes.get(id)
    }

    pub fn node_mut(&mut self, id: &NodeId) -> Option<&mut Node> {
        self.nodes.get_mut(id)
    }

    pub fn nodes(&self) -> impl Iterator<Item = &Node> {
        self.nodes.values()
    }

    pub fn nodes_mut(&mut self) -> impl Iterator<Item = &mut Node> {
        self.nodes.values_mut()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    /// Hands the nodes over, consuming the graph.
    #[must_use]
    pub fn into_nodes(self) -> BTreeMap<NodeId, Node> {
        self.nodes
    }

    /// Releases every node (and with them the entity references they hold).
    pub fn clear(&mut self) {
        self.nodes.clear();
    }
}

/// Builds object graphs against a metamodel, reusing cached node state.
pub struct ObjectGraphBuilder<'a> {
    metamodel: &'a Metamodel,
    cache: &'a PersistenceCache,
}

impl<'a> ObjectGraphBuilder<'a> {
    #[must_use]
    pub fn new(metamodel: &'a Metamodel, cache: &'a PersistenceCache) -> Self {
        Self { metamodel, cache }
    }

    /// Builds the graph rooted at `root`, following relations that cascade
    /// `cascade`.
    ///
    /// Entities already in the cache keep their cached state; others start in
    /// `initial_state`. Nodes always track the instances reachable from
    /// `root`, not cached copies.
    ///
    /// # Errors
    ///
    /// Fails when an entity's metadata is unknown, an entity has no key, or a
    /// required association is empty.
    pub fn build_graph(
        &self,
        root: &EntityRef,
        initial_state: NodeState,
        cascade: CascadeType,
    ) -> Result<ObjectGraph> {
        let mut nodes = BTreeMap::new();
        let head = self.visit(root, initial_state, cascade, &mut nodes)?;
        Ok(ObjectGraph { head, nodes })
    }

    fn visit(
        &self,
        entity: &EntityRef,
        initial_state: NodeState,
        cascade: CascadeType,
        nodes: &mut BTreeMap<NodeId, Node>,
    ) -> Result<NodeId> {
        let metadata = self.metamodel.entity(&entity.name())?;
        let id = metadata.node_id(&entity.read())?;
        if nodes.contains_key(&id) {
            return Ok(id);
        }

        let node = match self.cache.get_node_from_cache(&id) {
            Some(cached) => {
                let mut node = cached.clone();
                node.set_entity(entity.clone());
                node
            }
            None => Node::new(entity.clone(), metadata.clone(), initial_state)?,
        };
        nodes.insert(id.clone(), node);

        for relation in &metadata.relations {
            let targets = entity.read().related(&relation.name);
            if targets.is_empty() {
                if !relation.optional {
                    return Err(PersistenceError::validation(format!(
                        "required association {}.{} is null",
                        metadata.entity, relation.name
                    )));
                }
                continue;
            }
            if !relation.cascades(cascade) {
                continue;
            }
            let injected_key = injected_key(&metadata, relation, entity);
            for target in &targets {
                let child = self.visit(target, initial_state, cascade, nodes)?;
                link(nodes, &id, &child, relation, injected_key.clone());
            }
        }
        Ok(id)
    }
}

/// Foreign key a child row carries for a one-to-many relation mapped by a join
/// column on the child table.
fn injected_key(
    metadata: &EntityMetadata,
    relation: &RelationDef,
    parent: &EntityRef,
) -> Option<(String, polystore_core::Value)> {
    if relation.foreign_key_side() != ForeignKeySide::Child || relation.mapped_by.is_some() {
        return None;
    }
    let column = relation.join_column.clone()?;
    let key = metadata.id_of(&parent.read()).cloned()?;
    Some((column, key))
}

fn link(
    nodes: &mut BTreeMap<NodeId, Node>,
    parent: &NodeId,
    child: &NodeId,
    relation: &RelationDef,
    injected_key: Option<(String, polystore_core::Value)>,
) {
    let side = relation.foreign_key_side();
    if let Some(node) = nodes.get_mut(parent) {
        node.add_child(
            child.clone(),
            ChildLink {
                relation: relation.name.clone(),
                side,
            },
        );
    }
    if let Some(node) = nodes.get_mut(child) {
        node.add_parent(
            parent.clone(),
            ParentLink {
                relation: relation.name.clone(),
                side,
                injected_key,
            },
        );
    }
}
