//! Declarative entity metadata and the validated metamodel.
//!
//! Metadata is plain data: it can be constructed in code or deserialized from
//! JSON. [`MetamodelBuilder::build`] validates it once, at session-factory
//! initialization, and freezes it into a [`Metamodel`] that every component
//! receives by reference.

use std::collections::HashMap;
use std::sync::{Arc, OnceLock};

use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::entity::Entity;
use crate::key::NodeId;
use crate::types::{Value, ValueKind};

/// Errors raised while validating metadata or checking entities against it.
#[derive(Debug, thiserror::Error)]
pub enum MetadataError {
    #[error("unknown entity: {0}")]
    UnknownEntity(String),
    #[error("entity {0} registered more than once")]
    DuplicateEntity(String),
    #[error("invalid identifier `{name}` for {context}")]
    InvalidIdentifier { name: String, context: String },
    #[error("entity {entity}: id attribute `{attribute}` is not declared or cannot identify")]
    InvalidIdAttribute { entity: String, attribute: String },
    #[error("entity {entity}: relation `{relation}` targets unknown entity `{target}`")]
    UnknownTarget {
        entity: String,
        relation: String,
        target: String,
    },
    #[error("entity {entity}: relation `{relation}`: {reason}")]
    InvalidRelation {
        entity: String,
        relation: String,
        reason: String,
    },
    #[error("entity {entity}: attribute `{attribute}` expects {expected}, found {found}")]
    AttributeKind {
        entity: String,
        attribute: String,
        expected: ValueKind,
        found: ValueKind,
    },
    #[error("entity {entity}: attribute `{attribute}` must not be null")]
    NullAttribute { entity: String, attribute: String },
    #[error("entity {entity}: required relation `{relation}` is empty")]
    RequiredRelation { entity: String, relation: String },
    #[error("entity {entity}: primary key is missing or cannot identify an instance")]
    InvalidKey { entity: String },
    #[error("expected entity {expected}, got {found}")]
    EntityMismatch { expected: String, found: String },
    #[error("failed to parse metadata: {0}")]
    Parse(#[from] serde_json::Error),
}

/// Cardinality of a relation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum RelationKind {
    OneToOne,
    ManyToOne,
    OneToMany,
    ManyToMany,
}

/// Operations that propagate along a relation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum CascadeType {
    All,
    Persist,
    Merge,
    Remove,
    Refresh,
    Detach,
}

/// Where the foreign key of a relation physically lives.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ForeignKeySide {
    /// The declaring (parent) row stores the target's key.
    Parent,
    /// The target (child) row stores the declaring entity's key.
    Child,
    /// A junction table stores the pair.
    JoinTable,
}

/// Junction table for many-to-many or externally modeled relations.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JoinTableDef {
    #[serde(default)]
    pub schema: String,
    pub table: String,
    /// Column holding the owning entity's key.
    pub join_column: String,
    /// Column holding the target entity's key.
    pub inverse_join_column: String,
}

/// One declared attribute.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AttributeDef {
    pub name: String,
    pub kind: ValueKind,
    #[serde(default = "default_true")]
    pub nullable: bool,
}

impl AttributeDef {
    /// Nullable attribute of the given kind.
    #[must_use]
    pub fn new(name: impl Into<String>, kind: ValueKind) -> Self {
        Self {
            name: name.into(),
            kind,
            nullable: true,
        }
    }

    /// Marks the attribute as non-nullable.
    #[must_use]
    pub fn required(mut self) -> Self {
        self.nullable = false;
        self
    }
}

/// One declared relation to another entity.
///
/// Exactly one mapping strategy applies: `join_column` (foreign key),
/// `join_table` (junction table) or `mapped_by` (inverse side, the other
/// entity owns the mapping).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RelationDef {
    pub name: String,
    pub target: String,
    pub kind: RelationKind,
    #[serde(default)]
    pub cascade: Vec<CascadeType>,
    #[serde(default)]
    pub join_column: Option<String>,
    #[serde(default)]
    pub join_table: Option<JoinTableDef>,
    #[serde(default)]
    pub mapped_by: Option<String>,
    #[serde(default = "default_true")]
    pub optional: bool,
}

impl RelationDef {
    /// Relation with no mapping and no cascades; fill in with the builder methods.
    #[must_use]
    pub fn new(name: impl Into<String>, target: impl Into<String>, kind: RelationKind) -> Self {
        Self {
            name: name.into(),
            target: target.into(),
            kind,
            cascade: Vec::new(),
            join_column: None,
            join_table: None,
            mapped_by: None,
            optional: true,
        }
    }

    #[must_use]
    pub fn join_column(mut self, column: impl Into<String>) -> Self {
        self.join_column = Some(column.into());
        self
    }

    #[must_use]
    pub fn join_table(mut self, join_table: JoinTableDef) -> Self {
        self.join_table = Some(join_table);
        self
    }

    #[must_use]
    pub fn mapped_by(mut self, relation: impl Into<String>) -> Self {
        self.mapped_by = Some(relation.into());
        self
    }

    #[must_use]
    pub fn cascade(mut self, cascade: &[CascadeType]) -> Self {
        self.cascade = cascade.to_vec();
        self
    }

    #[must_use]
    pub fn required(mut self) -> Self {
        self.optional = false;
        self
    }

    /// Whether `operation` propagates along this relation.
    #[must_use]
    pub fn cascades(&self, operation: CascadeType) -> bool {
        self.cascade
            .iter()
            .any(|c| *c == CascadeType::All || *c == operation)
    }

    /// Where the foreign key of this relation lives.
    #[must_use]
    pub fn foreign_key_side(&self) -> ForeignKeySide {
        if self.join_table.is_some() {
            return ForeignKeySide::JoinTable;
        }
        match (self.kind, self.mapped_by.is_some()) {
            (RelationKind::ManyToMany, _) => ForeignKeySide::JoinTable,
            (RelationKind::OneToMany, _) | (RelationKind::OneToOne, true) => ForeignKeySide::Child,
            (RelationKind::OneToOne | RelationKind::ManyToOne, false) => ForeignKeySide::Parent,
            (RelationKind::ManyToOne, true) => ForeignKeySide::Child,
        }
    }

    fn mapping_count(&self) -> usize {
        usize::from(self.join_column.is_some())
            + usize::from(self.join_table.is_some())
            + usize::from(self.mapped_by.is_some())
    }
}

fn default_true() -> bool {
    true
}

/// Metadata of one entity type: where it is stored and how it is shaped.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EntityMetadata {
    pub entity: String,
    /// Name of the store (persistence unit) that holds this entity.
    pub persistence_unit: String,
    #[serde(default)]
    pub schema: String,
    pub table: String,
    pub id_attribute: String,
    #[serde(default)]
    pub attributes: Vec<AttributeDef>,
    #[serde(default)]
    pub relations: Vec<RelationDef>,
    /// Counter / append-only entity type.
    #[serde(default)]
    pub counter: bool,
    /// Whether writes feed the secondary index hook.
    #[serde(default)]
    pub indexed: bool,
}

impl EntityMetadata {
    /// Metadata with an id attribute of `id_kind` and nothing else declared.
    #[must_use]
    pub fn new(
        entity: impl Into<String>,
        persistence_unit: impl Into<String>,
        table: impl Into<String>,
        id_attribute: impl Into<String>,
        id_kind: ValueKind,
    ) -> Self {
        let id_attribute = id_attribute.into();
        Self {
            entity: entity.into(),
            persistence_unit: persistence_unit.into(),
            schema: String::new(),
            table: table.into(),
            attributes: vec![AttributeDef::new(id_attribute.clone(), id_kind).required()],
            id_attribute,
            relations: Vec::new(),
            counter: false,
            indexed: false,
        }
    }

    #[must_use]
    pub fn schema(mut self, schema: impl Into<String>) -> Self {
        self.schema = schema.into();
        self
    }

    #[must_use]
    pub fn attribute(mut self, attribute: AttributeDef) -> Self {
        self.attributes.push(attribute);
        self
    }

    #[must_use]
    pub fn relation(mut self, relation: RelationDef) -> Self {
        self.relations.push(relation);
        self
    }

    #[must_use]
    pub fn counter(mut self) -> Self {
        self.counter = true;
        self
    }

    #[must_use]
    pub fn indexed(mut self) -> Self {
        self.indexed = true;
        self
    }

    /// Looks up a declared attribute.
    #[must_use]
    pub fn attribute_def(&self, name: &str) -> Option<&AttributeDef> {
        self.attributes.iter().find(|a| a.name == name)
    }

    /// Looks up a declared relation.
    #[must_use]
    pub fn relation_def(&self, name: &str) -> Option<&RelationDef> {
        self.relations.iter().find(|r| r.name == name)
    }

    /// Primary key value of `entity`, if set.
    #[must_use]
    pub fn id_of<'a>(&self, entity: &'a Entity) -> Option<&'a Value> {
        entity.get(&self.id_attribute).filter(|v| !v.is_null())
    }

    /// Node id of `entity`.
    ///
    /// # Errors
    ///
    /// Returns [`MetadataError::EntityMismatch`] when `entity` is of another
    /// type and [`MetadataError::InvalidKey`] when its key is missing.
    pub fn node_id(&self, entity: &Entity) -> Result<NodeId, MetadataError> {
        if entity.name() != self.entity {
            return Err(MetadataError::EntityMismatch {
                expected: self.entity.clone(),
                found: entity.name().to_string(),
            });
        }
        self.id_of(entity)
            .and_then(|id| self.key_id(id))
            .ok_or_else(|| MetadataError::InvalidKey {
                entity: self.entity.clone(),
            })
    }

    /// Node id for a raw key of this entity type.
    ///
    /// # Errors
    ///
    /// Returns [`MetadataError::InvalidKey`] for null or non-identifying keys
    /// and for keys whose kind differs from the id attribute's.
    pub fn node_id_for_key(&self, key: &Value) -> Result<NodeId, MetadataError> {
        self.key_id(key).ok_or_else(|| MetadataError::InvalidKey {
            entity: self.entity.clone(),
        })
    }

    /// Declared kind of the id attribute.
    #[must_use]
    pub fn id_kind(&self) -> Option<ValueKind> {
        self.attribute_def(&self.id_attribute).map(|a| a.kind)
    }

    // `Int(1)` and `String("1")` share a key string, so the kind is checked
    // before the id is built.
    fn key_id(&self, key: &Value) -> Option<NodeId> {
        if self.id_kind() != Some(key.kind()) {
            return None;
        }
        NodeId::new(&self.entity, key)
    }
}

/// Validated, immutable registry of entity metadata.
#[derive(Debug, Clone, Default)]
pub struct Metamodel {
    entities: HashMap<String, Arc<EntityMetadata>>,
}

impl Metamodel {
    /// Starts a new builder.
    #[must_use]
    pub fn builder() -> MetamodelBuilder {
        MetamodelBuilder::default()
    }

    /// Parses a JSON array of [`EntityMetadata`] and validates it.
    ///
    /// # Errors
    ///
    /// Returns [`MetadataError::Parse`] on malformed JSON and any validation
    /// error from [`MetamodelBuilder::build`].
    pub fn from_json_str(json: &str) -> Result<Self, MetadataError> {
        let entities: Vec<EntityMetadata> = serde_json::from_str(json)?;
        entities
            .into_iter()
            .fold(Self::builder(), MetamodelBuilder::register)
            .build()
    }

    /// Metadata for `entity`.
    ///
    /// # Errors
    ///
    /// Returns [`MetadataError::UnknownEntity`] when it is not registered.
    pub fn entity(&self, entity: &str) -> Result<Arc<EntityMetadata>, MetadataError> {
        self.entities
            .get(entity)
            .cloned()
            .ok_or_else(|| MetadataError::UnknownEntity(entity.to_string()))
    }

    /// All registered entity metadata, in no particular order.
    pub fn entities(&self) -> impl Iterator<Item = &Arc<EntityMetadata>> {
        self.entities.values()
    }

    /// Distinct persistence units referenced by registered entities.
    #[must_use]
    pub fn persistence_units(&self) -> Vec<String> {
        let mut units: Vec<String> = self
            .entities
            .values()
            .map(|m| m.persistence_unit.clone())
            .collect();
        units.sort();
        units.dedup();
        units
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.entities.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entities.is_empty()
    }
}

/// Collects entity metadata and validates it into a [`Metamodel`].
#[derive(Debug, Default)]
pub struct MetamodelBuilder {
    pending: Vec<EntityMetadata>,
}

fn identifier_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| {
        Regex::new(r"^[A-Za-z_][A-Za-z0-9_]*$").expect("identifier pattern compiles")
    })
}

fn unit_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| {
        Regex::new(r"^[A-Za-z_][A-Za-z0-9_.\-]*$").expect("unit pattern compiles")
    })
}

fn check_identifier(name: &str, context: impl FnOnce() -> String) -> Result<(), MetadataError> {
    if identifier_pattern().is_match(name) {
        Ok(())
    } else {
        Err(MetadataError::InvalidIdentifier {
            name: name.to_string(),
            context: context(),
        })
    }
}

impl MetamodelBuilder {
    /// Adds one entity's metadata.
    #[must_use]
    pub fn register(mut self, metadata: EntityMetadata) -> Self {
        self.pending.push(metadata);
        self
    }

    /// Validates everything registered and freezes it.
    ///
    /// # Errors
    ///
    /// Returns the first validation failure found.
    pub fn build(self) -> Result<Metamodel, MetadataError> {
        let mut entities = HashMap::with_capacity(self.pending.len());
        for metadata in self.pending {
            Self::validate_shape(&metadata)?;
            if entities.contains_key(&metadata.entity) {
                return Err(MetadataError::DuplicateEntity(metadata.entity));
            }
            entities.insert(metadata.entity.clone(), Arc::new(metadata));
        }

        for metadata in entities.values() {
            for relation in &metadata.relations {
                if !entities.contains_key(&relation.target) {
                    return Err(MetadataError::UnknownTarget {
                        entity: metadata.entity.clone(),
                        relation: relation.name.clone(),
                        target: relation.target.clone(),
                    });
                }
            }
        }

        tracing::debug!(entities = entities.len(), "metamodel built");
        Ok(Metamodel { entities })
    }

    fn validate_shape(metadata: &EntityMetadata) -> Result<(), MetadataError> {
        let entity = &metadata.entity;
        check_identifier(entity, || "entity name".to_string())?;
        check_identifier(&metadata.table, || format!("table of {entity}"))?;
        if !metadata.schema.is_empty() {
            check_identifier(&metadata.schema, || format!("schema of {entity}"))?;
        }
        if !unit_pattern().is_match(&metadata.persistence_unit) {
            return Err(MetadataError::InvalidIdentifier {
                name: metadata.persistence_unit.clone(),
                context: format!("persistence unit of {entity}"),
            });
        }

        for attribute in &metadata.attributes {
            check_identifier(&attribute.name, || format!("attribute of {entity}"))?;
        }

        let id_ok = metadata
            .attribute_def(&metadata.id_attribute)
            .is_some_and(|a| matches!(a.kind, ValueKind::Int | ValueKind::String | ValueKind::Bytes));
        if !id_ok {
            return Err(MetadataError::InvalidIdAttribute {
                entity: entity.clone(),
                attribute: metadata.id_attribute.clone(),
            });
        }

        for relation in &metadata.relations {
            Self::validate_relation(entity, relation)?;
        }
        Ok(())
    }

    fn validate_relation(entity: &str, relation: &RelationDef) -> Result<(), MetadataError> {
        let invalid = |reason: &str| MetadataError::InvalidRelation {
            entity: entity.to_string(),
            relation: relation.name.clone(),
            reason: reason.to_string(),
        };

        check_identifier(&relation.name, || format!("relation of {entity}"))?;
        if let Some(column) = &relation.join_column {
            check_identifier(column, || format!("join column of {entity}.{}", relation.name))?;
        }
        if let Some(join_table) = &relation.join_table {
            check_identifier(&join_table.table, || format!("join table of {entity}.{}", relation.name))?;
            check_identifier(&join_table.join_column, || "join table column".to_string())?;
            check_identifier(&join_table.inverse_join_column, || "join table column".to_string())?;
        }

        if relation.mapping_count() != 1 {
            return Err(invalid(
                "exactly one of joinColumn, joinTable or mappedBy must be set",
            ));
        }

        match relation.kind {
            RelationKind::ManyToOne if relation.join_column.is_none() => {
                Err(invalid("many-to-one requires a join column"))
            }
            RelationKind::OneToOne if relation.join_table.is_some() => {
                Err(invalid("one-to-one cannot use a join table"))
            }
            RelationKind::ManyToMany if relation.join_column.is_some() => {
                Err(invalid("many-to-many requires a join table or mappedBy"))
            }
            _ => Ok(()),
        }
    }
}
