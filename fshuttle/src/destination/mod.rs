pub mod blob;
pub mod noop;
pub mod relational;
pub mod remote;

pub use blob::{BlobDestination, FsObjectStore, ObjectStore};
pub use noop::NoOpDestination;
pub use relational::RelationalDestination;
pub use remote::RemoteApiDestination;

use crate::errors::{Result, ShuttleError};
use crate::models::{Association, Entity, EntityKey, StorageDestination, UpdateMode};
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::Arc;
use uuid::Uuid;

/// A back end that receives the records a flush addressed to it.
#[async_trait]
pub trait IntegrationDestination: Send + Sync {
    /// The destination this handler is registered under.
    fn accepts(&self) -> StorageDestination;

    /// Writes entities and returns how many were written. Must accept an empty map.
    async fn integrate_entities(
        &self,
        entities: &HashMap<EntityKey, Entity>,
        ids: &HashMap<EntityKey, Uuid>,
        update_modes: &HashMap<Uuid, UpdateMode>,
    ) -> Result<usize>;

    /// Writes associations; the ids of every association and of both endpoints
    /// are present in `ids`.
    async fn integrate_associations(
        &self,
        associations: &HashMap<EntityKey, Association>,
        ids: &HashMap<EntityKey, Uuid>,
        update_modes: &HashMap<Uuid, UpdateMode>,
    ) -> Result<usize>;
}

/// Handlers by the destination they accept.
#[derive(Clone, Default)]
pub struct DestinationRouter {
    handlers: HashMap<StorageDestination, Arc<dyn IntegrationDestination>>,
}

impl DestinationRouter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a handler, replacing any earlier one for the same destination.
    pub fn register(&mut self, handler: Arc<dyn IntegrationDestination>) {
        let destination = handler.accepts();
        if self.handlers.insert(destination, handler).is_some() {
            log::warn!("Replacing handler for destination '{}'", destination);
        }
    }

    pub fn with(mut self, handler: Arc<dyn IntegrationDestination>) -> Self {
        self.register(handler);
        self
    }

    pub fn get(&self, destination: StorageDestination) -> Result<Arc<dyn IntegrationDestination>> {
        self.handlers
            .get(&destination)
            .cloned()
            .ok_or_else(|| ShuttleError::MissingDestination(destination.to_string()))
    }

    pub fn contains(&self, destination: StorageDestination) -> bool {
        self.handlers.contains_key(&destination)
    }
}

/// Looks up the surrogate id a flush resolved for `key`.
pub(crate) fn surrogate_id(ids: &HashMap<EntityKey, Uuid>, key: &EntityKey) -> Result<Uuid> {
    ids.get(key)
        .copied()
        .ok_or_else(|| ShuttleError::Resolution(format!("no id resolved for {key}")))
}

/// Default update mode when the plan never wrote an entity set.
pub(crate) fn mode_for(update_modes: &HashMap<Uuid, UpdateMode>, entity_set_id: &Uuid) -> UpdateMode {
    update_modes.get(entity_set_id).copied().unwrap_or_default()
}
