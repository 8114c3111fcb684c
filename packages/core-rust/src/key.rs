//! Stable node identifiers.

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::types::Value;

/// Identity of one managed entity instance: entity name plus canonical key.
///
/// Unique within a persistence cache. Built from the primary key through
/// [`Value::to_key_string`], so two keys of different kinds can only collide
/// across entity types, which the `entity` component already separates.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct NodeId {
    entity: String,
    key: String,
}

impl NodeId {
    /// Builds a node id, returning `None` when `id` cannot identify an entity.
    #[must_use]
    pub fn new(entity: &str, id: &Value) -> Option<Self> {
        id.to_key_string().map(|key| Self {
            entity: entity.to_string(),
            key,
        })
    }

    /// Entity name component.
    #[must_use]
    pub fn entity(&self) -> &str {
        &self.entity
    }

    /// Canonical key component.
    #[must_use]
    pub fn key(&self) -> &str {
        &self.key
    }
}

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}#{}", self.entity, self.key)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn display_joins_entity_and_key() {
        let id = NodeId::new("Person", &Value::Int(7)).unwrap();
        assert_eq!(id.to_string(), "Person#7");
        assert_eq!(id.entity(), "Person");
        assert_eq!(id.key(), "7");
    }

    #[test]
    fn same_key_different_entity_differs() {
        let a = NodeId::new("Person", &Value::from("1")).unwrap();
        let b = NodeId::new("Address", &Value::from("1")).unwrap();
        assert_ne!(a, b);
    }

    #[test]
    fn null_key_has_no_id() {
        assert!(NodeId::new("Person", &Value::Null).is_none());
    }
}
