//! Typed accessors for application structs.
//!
//! Implementing [`Persistable`] registers, at compile time, how a struct maps
//! onto an [`Entity`]'s attributes. Sessions use it to accept and return
//! typed values without any runtime reflection.

use crate::entity::Entity;
use crate::metadata::MetadataError;
use crate::types::{Value, ValueKind};

/// A struct that converts to and from an [`Entity`].
pub trait Persistable: Sized {
    /// Entity name this type is registered under in the metamodel.
    const ENTITY: &'static str;

    /// Builds the entity carrying this value's attributes.
    fn to_entity(&self) -> Entity;

    /// Reads a value back from an entity.
    ///
    /// # Errors
    ///
    /// Returns [`MetadataError`] when an attribute is missing or of the wrong kind.
    fn from_entity(entity: &Entity) -> Result<Self, MetadataError>;
}

/// Conversion from one attribute value.
pub trait FromValue: Sized {
    /// Expected kind, for error reporting.
    const KIND: ValueKind;

    fn from_value(value: &Value) -> Option<Self>;
}

impl FromValue for i64 {
    const KIND: ValueKind = ValueKind::Int;

    fn from_value(value: &Value) -> Option<Self> {
        value.as_int()
    }
}

impl FromValue for f64 {
    const KIND: ValueKind = ValueKind::Float;

    fn from_value(value: &Value) -> Option<Self> {
        match value {
            Value::Float(x) => Some(*x),
            _ => None,
        }
    }
}

impl FromValue for bool {
    const KIND: ValueKind = ValueKind::Bool;

    fn from_value(value: &Value) -> Option<Self> {
        match value {
            Value::Bool(b) => Some(*b),
            _ => None,
        }
    }
}

impl FromValue for String {
    const KIND: ValueKind = ValueKind::String;

    fn from_value(value: &Value) -> Option<Self> {
        value.as_str().map(str::to_string)
    }
}

impl FromValue for Vec<u8> {
    const KIND: ValueKind = ValueKind::Bytes;

    fn from_value(value: &Value) -> Option<Self> {
        match value {
            Value::Bytes(bytes) => Some(bytes.clone()),
            _ => None,
        }
    }
}

impl<T: FromValue> FromValue for Option<T> {
    const KIND: ValueKind = T::KIND;

    fn from_value(value: &Value) -> Option<Self> {
        if value.is_null() {
            Some(None)
        } else {
            T::from_value(value).map(Some)
        }
    }
}

/// Reads attribute `name` of `entity` as `T`.
///
/// A missing attribute reads as [`Value::Null`], so `Option<T>` fields accept it.
///
/// # Errors
///
/// Returns [`MetadataError::AttributeKind`] or [`MetadataError::NullAttribute`]
/// when the value cannot be converted.
pub fn attribute<T: FromValue>(entity: &Entity, name: &str) -> Result<T, MetadataError> {
    let value = entity.get(name).unwrap_or(&Value::Null);
    T::from_value(value).ok_or_else(|| {
        if value.is_null() {
            MetadataError::NullAttribute {
                entity: entity.name().to_string(),
                attribute: name.to_string(),
            }
        } else {
            MetadataError::AttributeKind {
                entity: entity.name().to_string(),
                attribute: name.to_string(),
                expected: T::KIND,
                found: value.kind(),
            }
        }
    })
}
