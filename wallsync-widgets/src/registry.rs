use std::{
    collections::{BTreeMap, HashMap},
    sync::{Mutex, MutexGuard, PoisonError},
};

use wallsync_core::WidgetSize;

/// Live widget instances of this process, keyed by the host's opaque id.
#[derive(Debug, Default)]
pub struct WidgetInstanceRegistry {
    instances: Mutex<HashMap<String, WidgetSize>>,
}

impl WidgetInstanceRegistry {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<String, WidgetSize>> {
        self.instances.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Registers `id`, or records its new size. Returns the previous size.
    pub fn add_or_update(&self, id: impl Into<String>, size: WidgetSize) -> Option<WidgetSize> {
        self.lock().insert(id.into(), size)
    }

    pub fn remove(&self, id: &str) -> Option<WidgetSize> {
        self.lock().remove(id)
    }

    #[must_use]
    pub fn contains(&self, id: &str) -> bool {
        self.lock().contains_key(id)
    }

    #[must_use]
    pub fn size_of(&self, id: &str) -> Option<WidgetSize> {
        self.lock().get(id).copied()
    }

    /// Point-in-time copy, ordered by id.
    #[must_use]
    pub fn snapshot(&self) -> BTreeMap<String, WidgetSize> {
        self.lock()
            .iter()
            .map(|(id, size)| (id.clone(), *size))
            .collect()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.lock().len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }
}
