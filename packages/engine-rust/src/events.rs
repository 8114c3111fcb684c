//! Entity lifecycle callbacks.
//!
//! Listeners fire once per top-level session call, around its flush, and
//! only for the entity the call was made with. Entities reached by cascade do
//! not get callbacks of their own.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use polystore_core::{EntityMetadata, EntityRef};
use tracing::debug;

/// Point in an entity's lifecycle a listener can observe.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum LifecycleEvent {
    PrePersist,
    PostPersist,
    PreUpdate,
    PostUpdate,
    PreRemove,
    PostRemove,
    /// After `find` returned an entity.
    PostLoad,
}

impl fmt::Display for LifecycleEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::PrePersist => "pre-persist",
            Self::PostPersist => "post-persist",
            Self::PreUpdate => "pre-update",
            Self::PostUpdate => "post-update",
            Self::PreRemove => "pre-remove",
            Self::PostRemove => "post-remove",
            Self::PostLoad => "post-load",
        };
        f.write_str(name)
    }
}

/// Callback for lifecycle events.
///
/// Used as `Arc<dyn EntityListener>`.
pub trait EntityListener: Send + Sync {
    fn on_event(&self, metadata: &EntityMetadata, entity: &EntityRef, event: LifecycleEvent);
}

/// Routes lifecycle events to global and per-entity listeners.
#[derive(Default, Clone)]
pub struct EventDispatcher {
    global: Vec<Arc<dyn EntityListener>>,
    by_entity: HashMap<String, Vec<Arc<dyn EntityListener>>>,
}

impl EventDispatcher {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a listener for every entity type.
    pub fn add_listener(&mut self, listener: Arc<dyn EntityListener>) {
        self.global.push(listener);
    }

    /// Registers a listener for one entity type.
    pub fn add_entity_listener(&mut self, entity: impl Into<String>, listener: Arc<dyn EntityListener>) {
        self.by_entity.entry(entity.into()).or_default().push(listener);
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.global.is_empty() && self.by_entity.is_empty()
    }

    /// Invokes entity-specific listeners, then global ones.
    pub fn fire_event_listeners(
        &self,
        metadata: &EntityMetadata,
        entity: &EntityRef,
        event: LifecycleEvent,
    ) {
        let specific = self.by_entity.get(&metadata.entity).map_or(&[][..], Vec::as_slice);
        if specific.is_empty() && self.global.is_empty() {
            return;
        }
        debug!(entity = %metadata.entity, %event, "firing lifecycle listeners");
        for listener in specific.iter().chain(&self.global) {
            listener.on_event(metadata, entity, event);
        }
    }
}
