//! Eager entity loading.
//!
//! [`EntityLoader::load`] reads one row by key and resolves its relations
//! from the stores: owning-side references by key, one-to-many children by
//! their foreign key column, many-to-many targets through the junction table.
//! Clean cached nodes are reused instead of re-read. Each entity is loaded at
//! most once per call; links back to an entity already loaded are weak, so the
//! loaded graph holds no reference cycles.

use std::collections::HashMap;
use std::sync::Arc;

use polystore_core::{
    EntityMetadata, EntityRecord, EntityRef, ForeignKeySide, JoinTableDef, Metamodel, NodeId,
    RelationDef, Value,
};

use crate::cache::PersistenceCache;
use crate::client::ClientRegistry;
use crate::error::{PersistenceError, Result};
use crate::node::{Node, NodeState};

/// Result of one load: the root entity and every node read from a store.
#[derive(Debug)]
pub struct Loaded {
    pub root: EntityRef,
    /// Freshly read nodes, `Managed` and clean. The root's node comes first.
    pub nodes: Vec<Node>,
}

/// Loads entities with their relations.
pub struct EntityLoader<'a> {
    metamodel: &'a Metamodel,
    clients: &'a ClientRegistry,
    cache: &'a PersistenceCache,
}

impl<'a> EntityLoader<'a> {
    #[must_use]
    pub fn new(metamodel: &'a Metamodel, clients: &'a ClientRegistry, cache: &'a PersistenceCache) -> Self {
        Self {
            metamodel,
            clients,
            cache,
        }
    }

    /// Loads `key` of `metadata`'s entity type from its store.
    ///
    /// The root is always read from the store; related entities come from the
    /// cache when a clean copy is there.
    ///
    /// # Errors
    ///
    /// Store failures, missing clients and unknown relation targets.
    pub fn load(&self, metadata: &Arc<EntityMetadata>, key: &Value) -> Result<Option<Loaded>> {
        let mut seen = HashMap::new();
        let mut nodes = Vec::new();
        let root = self.load_entity(metadata, key, true, &mut seen, &mut nodes)?;
        Ok(root.map(|root| Loaded { root, nodes }))
    }

    fn load_entity(
        &self,
        metadata: &Arc<EntityMetadata>,
        key: &Value,
        is_root: bool,
        seen: &mut HashMap<NodeId, EntityRef>,
        nodes: &mut Vec<Node>,
    ) -> Result<Option<EntityRef>> {
        let id = metadata.node_id_for_key(key)?;
        if let Some(entity) = seen.get(&id) {
            return Ok(Some(entity.clone()));
        }
        if !is_root {
            if let Some(cached) = self.cache.get_node_from_cache(&id) {
                if cached.state() == NodeState::Managed && !cached.is_dirty() {
                    let entity = cached.entity().deep_copy();
                    seen.insert(id, entity.clone());
                    return Ok(Some(entity));
                }
            }
        }

        let client = self.clients.resolve(&metadata.persistence_unit)?;
        let Some(record) = client
            .find(metadata, key)
            .map_err(|source| PersistenceError::store(client.store_name(), "find", source))?
        else {
            return Ok(None);
        };

        let entity = EntityRef::new(record.to_entity(metadata));
        seen.insert(id, entity.clone());
        let mut node = Node::new(entity.clone(), metadata.clone(), NodeState::Managed)?;
        node.find();
        nodes.push(node);

        for relation in &metadata.relations {
            let target_meta = self.metamodel.entity(&relation.target)?;
            let keys = self.related_keys(metadata, &target_meta, relation, key, &record)?;
            for target_key in keys {
                let already_loaded = target_meta
                    .node_id_for_key(&target_key)
                    .is_ok_and(|target_id| seen.contains_key(&target_id));
                let Some(target) =
                    self.load_entity(&target_meta, &target_key, false, seen, nodes)?
                else {
                    continue;
                };
                if already_loaded {
                    entity.write().relate_weak(relation.name.clone(), &target);
                } else {
                    entity.write().relate(relation.name.clone(), &target);
                }
            }
        }
        Ok(Some(entity))
    }

    /// Keys of the entities `relation` points at from the row `owner`.
    fn related_keys(
        &self,
        metadata: &EntityMetadata,
        target_meta: &EntityMetadata,
        relation: &RelationDef,
        owner: &Value,
        record: &EntityRecord,
    ) -> Result<Vec<Value>> {
        match relation.foreign_key_side() {
            ForeignKeySide::Parent => Ok(relation
                .join_column
                .as_deref()
                .and_then(|column| record.reference(column))
                .cloned()
                .into_iter()
                .collect()),
            ForeignKeySide::Child => {
                let Some(column) = child_column(target_meta, relation) else {
                    return Ok(Vec::new());
                };
                let client = self.clients.resolve(&target_meta.persistence_unit)?;
                let rows = client
                    .find_by_relation(target_meta, &column, owner)
                    .map_err(|source| {
                        PersistenceError::store(client.store_name(), "find by relation", source)
                    })?;
                Ok(rows.into_iter().map(|row| row.key).collect())
            }
            ForeignKeySide::JoinTable => {
                let Some((unit, def)) = junction(metadata, target_meta, relation) else {
                    return Ok(Vec::new());
                };
                let client = self.clients.resolve(&unit)?;
                client.join_table_targets(&def, owner).map_err(|source| {
                    PersistenceError::store(client.store_name(), "join table lookup", source)
                })
            }
        }
    }
}

/// Column on the child table holding the owner's key.
fn child_column(target_meta: &EntityMetadata, relation: &RelationDef) -> Option<String> {
    if let Some(inverse) = &relation.mapped_by {
        return target_meta
            .relation_def(inverse)
            .and_then(|r| r.join_column.clone());
    }
    relation.join_column.clone()
}

/// Store and junction table to query, oriented so `join_column` holds the
/// owner's key.
fn junction(
    metadata: &EntityMetadata,
    target_meta: &EntityMetadata,
    relation: &RelationDef,
) -> Option<(String, JoinTableDef)> {
    if let Some(def) = &relation.join_table {
        return Some((metadata.persistence_unit.clone(), def.clone()));
    }
    let inverse = relation.mapped_by.as_deref()?;
    let def = target_meta.relation_def(inverse)?.join_table.as_ref()?;
    Some((
        target_meta.persistence_unit.clone(),
        JoinTableDef {
            schema: def.schema.clone(),
            table: def.table.clone(),
            join_column: def.inverse_join_column.clone(),
            inverse_join_column: def.join_column.clone(),
        },
    ))
}
