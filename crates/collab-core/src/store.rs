//! Observable holder of the rendered value.

use std::sync::{Arc, RwLock};

use crate::document::{Document, PatchError, apply_patches};
use crate::events::{EventBus, Subscription};
use crate::patch::{Origin, Patch};

/// Patches applied to a store, as seen by its subscribers.
#[derive(Debug, Clone, PartialEq)]
pub struct StoreEvent {
    pub patches: Vec<Patch>,
    pub origin: Origin,
}

/// The value an editor renders, shared with whatever displays it.
pub trait DocumentStore: Send + Sync {
    /// Current value.
    fn value(&self) -> Document;

    /// Apply `patches` atomically and notify subscribers.
    fn apply_patches(&self, patches: &[Patch], origin: Origin) -> Result<(), PatchError>;

    /// Listen for applied patches. Dropping the subscription stops delivery.
    fn subscribe(&self, listener: Box<dyn Fn(StoreEvent) + Send + Sync>) -> Subscription;
}

/// In-memory store.
pub struct MemoryStore {
    value: RwLock<Document>,
    events: Arc<EventBus<StoreEvent>>,
}

impl MemoryStore {
    pub fn new(value: Document) -> Self {
        Self {
            value: RwLock::new(value),
            events: Arc::new(EventBus::new()),
        }
    }
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new(Document::default())
    }
}

impl DocumentStore for MemoryStore {
    fn value(&self) -> Document {
        self.value.read().unwrap_or_else(|e| e.into_inner()).clone()
    }

    fn apply_patches(&self, patches: &[Patch], origin: Origin) -> Result<(), PatchError> {
        if patches.is_empty() {
            return Ok(());
        }
        {
            let mut value = self.value.write().unwrap_or_else(|e| e.into_inner());
            *value = apply_patches(&value, patches)?;
        }
        self.events.emit(StoreEvent {
            patches: patches.to_vec(),
            origin,
        });
        Ok(())
    }

    fn subscribe(&self, listener: Box<dyn Fn(StoreEvent) + Send + Sync>) -> Subscription {
        self.events.subscribe(listener)
    }
}
