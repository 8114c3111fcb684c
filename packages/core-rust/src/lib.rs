//! Polystore Core: value model, live entities, node ids, entity metadata, row records.

pub mod entity;
pub mod key;
pub mod metadata;
pub mod persistable;
pub mod record;
pub mod types;

pub use entity::{Entity, EntityRef, Link, WeakEntityRef};
pub use key::NodeId;
pub use metadata::{
    AttributeDef, CascadeType, EntityMetadata, ForeignKeySide, JoinTableDef, MetadataError,
    Metamodel, MetamodelBuilder, RelationDef, RelationKind,
};
pub use persistable::{attribute, FromValue, Persistable};
pub use record::EntityRecord;
pub use types::{Value, ValueKind};
