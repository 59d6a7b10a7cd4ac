use super::IntegrationDestination;
use crate::errors::Result;
use crate::models::{Association, Entity, EntityKey, StorageDestination, UpdateMode};
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use uuid::Uuid;

/// Accepts records routed to `none` and drops them.
#[derive(Debug, Default)]
pub struct NoOpDestination {
    discarded: AtomicUsize,
}

impl NoOpDestination {
    /// Entities and associations dropped so far.
    pub fn discarded(&self) -> usize {
        self.discarded.load(Ordering::Relaxed)
    }
}

#[async_trait]
impl IntegrationDestination for NoOpDestination {
    fn accepts(&self) -> StorageDestination {
        StorageDestination::None
    }

    async fn integrate_entities(
        &self,
        entities: &HashMap<EntityKey, Entity>,
        _ids: &HashMap<EntityKey, Uuid>,
        _update_modes: &HashMap<Uuid, UpdateMode>,
    ) -> Result<usize> {
        self.discarded.fetch_add(entities.len(), Ordering::Relaxed);
        Ok(entities.len())
    }

    async fn integrate_associations(
        &self,
        associations: &HashMap<EntityKey, Association>,
        _ids: &HashMap<EntityKey, Uuid>,
        _update_modes: &HashMap<Uuid, UpdateMode>,
    ) -> Result<usize> {
        self.discarded.fetch_add(associations.len(), Ordering::Relaxed);
        Ok(associations.len())
    }
}
