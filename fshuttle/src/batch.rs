//! Destination-partitioned staging buffer shared by all rows of a flush cycle.

use crate::models::{Association, Entity, EntityKey, PropertyValues, StorageDestination};
use std::collections::{HashMap, HashSet};

/// Entities and associations waiting for one destination.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DestinationBatch {
    pub entities: HashMap<EntityKey, Entity>,
    pub associations: HashMap<EntityKey, Association>,
}

impl DestinationBatch {
    pub fn stage_entity(&mut self, key: EntityKey, properties: PropertyValues) {
        match self.entities.get_mut(&key) {
            Some(existing) => existing.absorb(properties),
            None => {
                self.entities
                    .insert(key.clone(), Entity::new(key, properties));
            }
        }
    }

    pub fn stage_association(&mut self, association: Association) {
        match self.associations.get_mut(&association.key) {
            Some(existing) => existing.absorb(association),
            None => {
                self.associations
                    .insert(association.key.clone(), association);
            }
        }
    }

    pub fn merge(&mut self, other: DestinationBatch) {
        for (key, entity) in other.entities {
            self.stage_entity(key, entity.properties);
        }
        for (_, association) in other.associations {
            self.stage_association(association);
        }
    }

    pub fn is_empty(&self) -> bool {
        self.entities.is_empty() && self.associations.is_empty()
    }
}

/// Staged records keyed by the destination that must write them.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AddressedBatch {
    batches: HashMap<StorageDestination, DestinationBatch>,
}

impl AddressedBatch {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn destination_mut(&mut self, destination: StorageDestination) -> &mut DestinationBatch {
        self.batches.entry(destination).or_default()
    }

    pub fn get(&self, destination: StorageDestination) -> Option<&DestinationBatch> {
        self.batches.get(&destination)
    }

    /// Unions `other` into `self`. Same-key records merge their value sets, so the
    /// operation is associative and commutative.
    pub fn merge(&mut self, other: AddressedBatch) {
        for (destination, batch) in other.batches {
            match self.batches.get_mut(&destination) {
                Some(existing) => existing.merge(batch),
                None => {
                    self.batches.insert(destination, batch);
                }
            }
        }
    }

    pub fn merged(mut self, other: AddressedBatch) -> Self {
        self.merge(other);
        self
    }

    /// True once any destination holds more than `threshold` entities or associations.
    pub fn exceeds(&self, threshold: usize) -> bool {
        self.batches
            .values()
            .any(|b| b.entities.len() > threshold || b.associations.len() > threshold)
    }

    /// Every natural key a flush must resolve: entities, and each association's own,
    /// source and destination keys.
    pub fn natural_keys(&self) -> HashSet<EntityKey> {
        let mut keys = HashSet::new();
        for batch in self.batches.values() {
            keys.extend(batch.entities.keys().cloned());
            for association in batch.associations.values() {
                keys.insert(association.key.clone());
                keys.insert(association.src.clone());
                keys.insert(association.dst.clone());
            }
        }
        keys
    }

    pub fn is_empty(&self) -> bool {
        self.batches.values().all(DestinationBatch::is_empty)
    }

    pub fn destinations(&self) -> impl Iterator<Item = StorageDestination> + '_ {
        self.batches.keys().copied()
    }

    pub fn into_batches(self) -> HashMap<StorageDestination, DestinationBatch> {
        self.batches
    }
}
