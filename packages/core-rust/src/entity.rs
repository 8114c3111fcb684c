//! Live application-side entity objects.
//!
//! An [`Entity`] is the in-memory object an application hands to a session:
//! named attribute values plus named relations to other entities. Entities are
//! shared through [`EntityRef`] handles so that the same instance can be
//! reached from several places of an object graph.
//!
//! Relations hold [`Link`]s. A strong link keeps its target alive; a weak link
//! only refers to it. Inverse sides of bidirectional associations should use
//! weak links so the application graph never forms reference cycles that would
//! keep it alive forever.

use std::collections::{BTreeMap, HashMap, VecDeque};
use std::fmt;
use std::sync::{Arc, Weak};

use parking_lot::{RwLock, RwLockReadGuard, RwLockWriteGuard};

use crate::types::Value;

/// In-memory entity instance: attribute values plus relations.
#[derive(Debug, Clone)]
pub struct Entity {
    name: String,
    fields: BTreeMap<String, Value>,
    relations: BTreeMap<String, Vec<Link>>,
}

impl Entity {
    /// Creates an empty instance of the named entity type.
    #[must_use]
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            fields: BTreeMap::new(),
            relations: BTreeMap::new(),
        }
    }

    /// Builder-style attribute setter.
    #[must_use]
    pub fn with(mut self, field: impl Into<String>, value: impl Into<Value>) -> Self {
        self.set(field, value);
        self
    }

    /// Entity type name.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Sets an attribute value, replacing any previous one.
    pub fn set(&mut self, field: impl Into<String>, value: impl Into<Value>) {
        self.fields.insert(field.into(), value.into());
    }

    /// Returns an attribute value.
    #[must_use]
    pub fn get(&self, field: &str) -> Option<&Value> {
        self.fields.get(field)
    }

    /// Removes an attribute, returning its value.
    pub fn remove_field(&mut self, field: &str) -> Option<Value> {
        self.fields.remove(field)
    }

    /// All attribute values.
    #[must_use]
    pub fn fields(&self) -> &BTreeMap<String, Value> {
        &self.fields
    }

    /// Replaces all attribute values at once.
    pub fn replace_fields(&mut self, fields: BTreeMap<String, Value>) {
        self.fields = fields;
    }

    /// Adds a strong link from `relation` to `target`.
    pub fn relate(&mut self, relation: impl Into<String>, target: &EntityRef) {
        self.relations
            .entry(relation.into())
            .or_default()
            .push(Link::Strong(target.clone()));
    }

    /// Adds a weak link from `relation` to `target`.
    pub fn relate_weak(&mut self, relation: impl Into<String>, target: &EntityRef) {
        self.relations
            .entry(relation.into())
            .or_default()
            .push(Link::Weak(target.downgrade()));
    }

    /// Replaces the links of one relation.
    pub fn set_links(&mut self, relation: impl Into<String>, links: Vec<Link>) {
        self.relations.insert(relation.into(), links);
    }

    /// Removes every link of one relation.
    pub fn clear_relation(&mut self, relation: &str) {
        self.relations.remove(relation);
    }

    /// Raw links of one relation (possibly dangling weak links).
    #[must_use]
    pub fn links(&self, relation: &str) -> &[Link] {
        self.relations.get(relation).map_or(&[], Vec::as_slice)
    }

    /// Live targets of one relation. Dangling weak links are skipped.
    #[must_use]
    pub fn related(&self, relation: &str) -> Vec<EntityRef> {
        self.links(relation).iter().filter_map(Link::target).collect()
    }

    /// Names of relations set on this instance.
    pub fn relation_names(&self) -> impl Iterator<Item = &str> {
        self.relations.keys().map(String::as_str)
    }
}

/// A relation edge from one entity to another.
#[derive(Debug, Clone)]
pub enum Link {
    /// Owns the target.
    Strong(EntityRef),
    /// Refers to the target without keeping it alive.
    Weak(WeakEntityRef),
}

impl Link {
    /// Resolves the target if it is still alive.
    #[must_use]
    pub fn target(&self) -> Option<EntityRef> {
        match self {
            Self::Strong(target) => Some(target.clone()),
            Self::Weak(target) => target.upgrade(),
        }
    }

    /// Returns `true` for weak links.
    #[must_use]
    pub fn is_weak(&self) -> bool {
        matches!(self, Self::Weak(_))
    }
}

/// Shared, mutable handle to an [`Entity`].
///
/// Cloning the handle shares the instance. Use [`EntityRef::deep_copy`] to
/// obtain an independent copy of a whole reachable object graph.
#[derive(Clone)]
pub struct EntityRef(Arc<RwLock<Entity>>);

impl EntityRef {
    /// Wraps an entity into a shared handle.
    #[must_use]
    pub fn new(entity: Entity) -> Self {
        Self(Arc::new(RwLock::new(entity)))
    }

    /// Read access to the entity.
    pub fn read(&self) -> RwLockReadGuard<'_, Entity> {
        self.0.read()
    }

    /// Write access to the entity.
    pub fn write(&self) -> RwLockWriteGuard<'_, Entity> {
        self.0.write()
    }

    /// Creates a weak handle to the same instance.
    #[must_use]
    pub fn downgrade(&self) -> WeakEntityRef {
        WeakEntityRef(Arc::downgrade(&self.0))
    }

    /// Returns `true` when both handles point at the same instance.
    #[must_use]
    pub fn ptr_eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.0, &other.0)
    }

    /// Entity type name.
    #[must_use]
    pub fn name(&self) -> String {
        self.0.read().name.clone()
    }

    /// Copy of one attribute value.
    #[must_use]
    pub fn field(&self, field: &str) -> Option<Value> {
        self.0.read().fields.get(field).cloned()
    }

    /// Copies this entity and everything reachable from it.
    ///
    /// Every instance reachable from `self`, through strong or live weak
    /// links, is copied exactly once. In the copy, ownership follows a
    /// breadth-first tree rooted at the returned handle: the first link to
    /// reach an instance is strong, every other link to it is weak. The copy
    /// therefore keeps all its targets alive and holds no strong cycles, even
    /// when `self` is only reachable from them through a weak link.
    #[must_use]
    pub fn deep_copy(&self) -> EntityRef {
        let root = self.shallow_copy();
        let mut copies: HashMap<usize, EntityRef> = HashMap::from([(self.addr(), root.clone())]);
        let mut queue = VecDeque::from([self.clone()]);

        while let Some(original) = queue.pop_front() {
            let relations = original.0.read().relations.clone();
            let mut copied = BTreeMap::new();
            for (relation, links) in relations {
                let mut out = Vec::with_capacity(links.len());
                for target in links.iter().filter_map(Link::target) {
                    match copies.get(&target.addr()) {
                        Some(copy) => out.push(Link::Weak(copy.downgrade())),
                        None => {
                            let copy = target.shallow_copy();
                            copies.insert(target.addr(), copy.clone());
                            queue.push_back(target);
                            out.push(Link::Strong(copy));
                        }
                    }
                }
                copied.insert(relation, out);
            }
            if let Some(copy) = copies.get(&original.addr()) {
                copy.0.write().relations = copied;
            }
        }
        root
    }

    /// Copy of the name and attributes, without relations.
    fn shallow_copy(&self) -> EntityRef {
        let guard = self.0.read();
        EntityRef::new(Entity {
            name: guard.name.clone(),
            fields: guard.fields.clone(),
            relations: BTreeMap::new(),
        })
    }

    fn addr(&self) -> usize {
        Arc::as_ptr(&self.0).cast::<()>() as usize
    }
}

impl fmt::Debug for EntityRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        // Relations are not printed: they may lead back here.
        match self.0.try_read() {
            Some(guard) => f
                .debug_struct("EntityRef")
                .field("name", &guard.name)
                .field("fields", &guard.fields)
                .finish_non_exhaustive(),
            None => f.write_str("EntityRef(<locked>)"),
        }
    }
}

/// Non-owning handle to an [`Entity`].
#[derive(Clone)]
pub struct WeakEntityRef(Weak<RwLock<Entity>>);

impl WeakEntityRef {
    /// Upgrades to a strong handle if the instance is still alive.
    #[must_use]
    pub fn upgrade(&self) -> Option<EntityRef> {
        self.0.upgrade().map(EntityRef)
    }
}

impl fmt::Debug for WeakEntityRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("WeakEntityRef")
    }
}
