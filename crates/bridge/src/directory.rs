//! Current entity configuration

use std::collections::HashMap;
use std::sync::{Arc, RwLock};
use storage::EntitySubscription;

type EntityMap = HashMap<String, Arc<EntitySubscription>>;

/// Entity subscriptions from the latest synchronization pass.
///
/// Replaced wholesale; readers get point-in-time copies.
#[derive(Default)]
pub struct EntityDirectory {
    entities: RwLock<Arc<EntityMap>>,
}

impl EntityDirectory {
    pub fn new() -> Self {
        Self::default()
    }

    fn current(&self) -> Arc<EntityMap> {
        match self.entities.read() {
            Ok(guard) => guard.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        }
    }

    /// Subscription of one entity
    pub fn get(&self, entity_id: &str) -> Option<Arc<EntitySubscription>> {
        self.current().get(entity_id).cloned()
    }

    /// Replace the whole directory
    pub fn replace(&self, entities: EntityMap) {
        let entities = Arc::new(entities);
        match self.entities.write() {
            Ok(mut guard) => *guard = entities,
            Err(poisoned) => *poisoned.into_inner() = entities,
        }
    }

    /// All entity IDs
    pub fn ids(&self) -> Vec<String> {
        self.current().keys().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.current().len()
    }

    pub fn is_empty(&self) -> bool {
        self.current().is_empty()
    }
}
