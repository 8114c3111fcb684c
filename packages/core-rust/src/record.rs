//! Row form of an entity, as handed to store clients.
//!
//! [`EntityRecord`] is what crosses the boundary between the engine and a
//! store client: the key, the declared attribute values and the foreign keys
//! the row owns. Store clients encode it however their store needs; the
//! in-memory client keeps it as `MsgPack`.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::entity::Entity;
use crate::metadata::{EntityMetadata, ForeignKeySide, MetadataError, Metamodel};
use crate::types::Value;

/// One row: key, attribute values and owned foreign keys.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EntityRecord {
    pub entity: String,
    pub key: Value,
    /// Declared attributes other than the id attribute.
    pub fields: BTreeMap<String, Value>,
    /// Foreign keys by join column.
    #[serde(default)]
    pub references: BTreeMap<String, Value>,
}

impl EntityRecord {
    /// Builds the row for `entity`, validating it against its metadata.
    ///
    /// Attributes not declared in `metadata` are not persisted. Foreign keys
    /// are resolved for relations whose key lives in this row.
    ///
    /// # Errors
    ///
    /// Returns a [`MetadataError`] when the key is missing, an attribute has
    /// the wrong kind or is null while non-nullable, or a required owning
    /// relation is empty.
    pub fn from_entity(
        metadata: &EntityMetadata,
        metamodel: &Metamodel,
        entity: &Entity,
    ) -> Result<Self, MetadataError> {
        metadata.node_id(entity)?;
        let key = metadata
            .id_of(entity)
            .cloned()
            .ok_or_else(|| MetadataError::InvalidKey {
                entity: metadata.entity.clone(),
            })?;

        let mut fields = BTreeMap::new();
        for attribute in &metadata.attributes {
            if attribute.name == metadata.id_attribute {
                continue;
            }
            let value = entity.get(&attribute.name).cloned().unwrap_or(Value::Null);
            if value.is_null() {
                if !attribute.nullable {
                    return Err(MetadataError::NullAttribute {
                        entity: metadata.entity.clone(),
                        attribute: attribute.name.clone(),
                    });
                }
            } else if value.kind() != attribute.kind {
                return Err(MetadataError::AttributeKind {
                    entity: metadata.entity.clone(),
                    attribute: attribute.name.clone(),
                    expected: attribute.kind,
                    found: value.kind(),
                });
            }
            fields.insert(attribute.name.clone(), value);
        }

        let mut references = BTreeMap::new();
        for relation in &metadata.relations {
            if relation.foreign_key_side() != ForeignKeySide::Parent {
                continue;
            }
            let Some(column) = &relation.join_column else {
                continue;
            };
            let reference = match entity.related(&relation.name).first() {
                Some(target) => {
                    let target_meta = metamodel.entity(&relation.target)?;
                    let target_key = target_meta.id_of(&target.read()).cloned();
                    target_key.ok_or_else(|| MetadataError::InvalidKey {
                        entity: target_meta.entity.clone(),
                    })?
                }
                None if !relation.optional => {
                    return Err(MetadataError::RequiredRelation {
                        entity: metadata.entity.clone(),
                        relation: relation.name.clone(),
                    });
                }
                None => Value::Null,
            };
            references.insert(column.clone(), reference);
        }

        Ok(Self {
            entity: metadata.entity.clone(),
            key,
            fields,
            references,
        })
    }

    /// Foreign key stored under `column`, ignoring nulls.
    #[must_use]
    pub fn reference(&self, column: &str) -> Option<&Value> {
        self.references.get(column).filter(|v| !v.is_null())
    }

    /// Sets a foreign key column.
    pub fn set_reference(&mut self, column: impl Into<String>, value: Value) {
        self.references.insert(column.into(), value);
    }

    /// Builds a fresh entity carrying this row's key and attributes.
    ///
    /// Relations are left empty; resolving them is the caller's job.
    #[must_use]
    pub fn to_entity(&self, metadata: &EntityMetadata) -> Entity {
        let mut entity = Entity::new(self.entity.clone());
        self.apply_to(metadata, &mut entity);
        entity
    }

    /// Overwrites `entity`'s key and attributes with this row's values.
    pub fn apply_to(&self, metadata: &EntityMetadata, entity: &mut Entity) {
        let mut fields = self.fields.clone();
        fields.insert(metadata.id_attribute.clone(), self.key.clone());
        entity.replace_fields(fields);
    }

    /// Encodes the row as `MsgPack` with named fields.
    ///
    /// # Errors
    ///
    /// Propagates `rmp-serde` encoding failures.
    pub fn to_msgpack(&self) -> Result<Vec<u8>, rmp_serde::encode::Error> {
        rmp_serde::to_vec_named(self)
    }

    /// Decodes a row produced by [`EntityRecord::to_msgpack`].
    ///
    /// # Errors
    ///
    /// Propagates `rmp-serde` decoding failures.
    pub fn from_msgpack(bytes: &[u8]) -> Result<Self, rmp_serde::decode::Error> {
        rmp_serde::from_slice(bytes)
    }
}
