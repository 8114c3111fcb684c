//! Pending junction-table writes.
//!
//! Many-to-many relations (and any relation mapped through a join table)
//! are persisted as rows of a junction table rather than as columns of either
//! entity row. The flush executor collects one [`JoinTableData`] per owning
//! node and relation, and applies them once the entity rows they pair exist.

use polystore_core::{EntityMetadata, JoinTableDef, Metamodel, RelationDef, Value};

use crate::client::{StoreClient, WriteKind};
use crate::error::{PersistenceError, Result};
use crate::node::Node;

/// What a junction-table record does to the rows of its owner.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JoinTableOperation {
    /// Adds one row per target.
    Insert,
    /// Replaces the owner's rows with the current target set.
    Replace,
    /// Removes every row of the owner.
    Delete,
}

/// A pending INSERT/DELETE against one junction table, for one owner.
#[derive(Debug, Clone, PartialEq)]
pub struct JoinTableData {
    pub operation: JoinTableOperation,
    /// Store the owning entity lives in.
    pub store: String,
    pub schema: String,
    pub table: String,
    pub join_column: String,
    pub inverse_join_column: String,
    pub owner: Value,
    pub targets: Vec<Value>,
    processed: bool,
}

impl JoinTableData {
    /// Builds the record for `relation` of `node` flushed with `kind`.
    ///
    /// Returns `None` when the relation is not mapped through a join table.
    ///
    /// # Errors
    ///
    /// Fails when a target's metadata is unknown or a target has no key.
    pub fn for_relation(
        node: &Node,
        relation: &RelationDef,
        kind: WriteKind,
        metamodel: &Metamodel,
    ) -> Result<Option<Self>> {
        let Some(def) = &relation.join_table else {
            return Ok(None);
        };
        let metadata = node.metadata();
        let owner = node_key(metadata, node)?;
        let operation = match kind {
            WriteKind::Insert => JoinTableOperation::Insert,
            WriteKind::Update => JoinTableOperation::Replace,
            WriteKind::Delete => JoinTableOperation::Delete,
        };

        let mut targets = Vec::new();
        if operation != JoinTableOperation::Delete {
            let target_meta = metamodel.entity(&relation.target)?;
            for target in node.entity().read().related(&relation.name) {
                let key = target_meta.id_of(&target.read()).cloned();
                let key = key.ok_or_else(|| {
                    PersistenceError::validation(format!(
                        "{} target of {}.{} has no key",
                        relation.target, metadata.entity, relation.name
                    ))
                })?;
                targets.push(key);
            }
        }

        Ok(Some(Self::new(
            operation,
            &metadata.persistence_unit,
            def,
            owner,
            targets,
        )))
    }

    /// Builds a record from its parts.
    #[must_use]
    pub fn new(
        operation: JoinTableOperation,
        store: &str,
        def: &JoinTableDef,
        owner: Value,
        targets: Vec<Value>,
    ) -> Self {
        Self {
            operation,
            store: store.to_string(),
            schema: def.schema.clone(),
            table: def.table.clone(),
            join_column: def.join_column.clone(),
            inverse_join_column: def.inverse_join_column.clone(),
            owner,
            targets,
            processed: false,
        }
    }

    #[must_use]
    pub fn is_processed(&self) -> bool {
        self.processed
    }

    pub fn mark_processed(&mut self) {
        self.processed = true;
    }

    /// Applies the record through `client` and marks it processed.
    ///
    /// Returns `false` without touching the store when the record was
    /// already processed.
    ///
    /// # Errors
    ///
    /// Propagates the client failure; the record then stays unprocessed.
    pub fn apply(&mut self, client: &dyn StoreClient) -> anyhow::Result<bool> {
        if self.processed {
            return Ok(false);
        }
        match self.operation {
            JoinTableOperation::Insert => {
                if !self.targets.is_empty() {
                    client.persist_join_table(self)?;
                }
            }
            JoinTableOperation::Replace => {
                client.delete_by_column(&self.schema, &self.table, &self.join_column, &self.owner)?;
                if !self.targets.is_empty() {
                    client.persist_join_table(self)?;
                }
            }
            JoinTableOperation::Delete => {
                client.delete_by_column(&self.schema, &self.table, &self.join_column, &self.owner)?;
            }
        }
        self.mark_processed();
        Ok(true)
    }
}

fn node_key(metadata: &EntityMetadata, node: &Node) -> Result<Value> {
    let entity = node.entity().read();
    metadata.id_of(&entity).cloned().ok_or_else(|| {
        PersistenceError::validation(format!("{} has no key", node.id()))
    })
}
