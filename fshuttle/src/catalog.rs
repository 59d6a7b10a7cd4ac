//! Read-only snapshot of the metadata catalog (property types and entity sets).
//!
//! The snapshot is loaded once per run and shared behind an `Arc` by every
//! mapping worker and destination; nothing mutates it after construction.

use crate::errors::{Result, ShuttleError};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::path::Path;
use uuid::Uuid;

/// Primitive datatype of a property type.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum PrimitiveKind {
    String,
    Int16,
    Int32,
    Int64,
    Double,
    Boolean,
    Date,
    DateTimeOffset,
    Guid,
    Binary,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PropertyType {
    pub id: Uuid,
    /// Fully qualified name, e.g. `general.color`.
    #[serde(rename = "type")]
    pub fqn: String,
    pub datatype: PrimitiveKind,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EntitySet {
    pub id: Uuid,
    pub name: String,
    /// Primary-key property types, in the order identifiers are built from.
    pub key: Vec<Uuid>,
    /// Property types that may be written to this entity set.
    pub properties: Vec<Uuid>,
}

impl EntitySet {
    pub fn is_authorized(&self, property_type_id: &Uuid) -> bool {
        self.properties.contains(property_type_id)
    }
}

#[derive(Serialize, Deserialize)]
struct CatalogDocument {
    property_types: Vec<PropertyType>,
    entity_sets: Vec<EntitySet>,
}

#[derive(Debug, Default)]
pub struct EdmCatalog {
    property_types: HashMap<Uuid, PropertyType>,
    property_type_ids: HashMap<String, Uuid>,
    entity_sets: HashMap<Uuid, EntitySet>,
    entity_set_ids: HashMap<String, Uuid>,
}

impl EdmCatalog {
    pub fn new(property_types: Vec<PropertyType>, entity_sets: Vec<EntitySet>) -> Result<Self> {
        let mut catalog = EdmCatalog::default();
        for property_type in property_types {
            if catalog
                .property_type_ids
                .insert(property_type.fqn.clone(), property_type.id)
                .is_some()
            {
                return Err(ShuttleError::Config(format!(
                    "duplicate property type '{}'",
                    property_type.fqn
                )));
            }
            catalog.property_types.insert(property_type.id, property_type);
        }

        for entity_set in entity_sets {
            let mut seen = HashSet::new();
            for id in entity_set.properties.iter() {
                if !catalog.property_types.contains_key(id) {
                    return Err(ShuttleError::Config(format!(
                        "entity set '{}' references unknown property type {}",
                        entity_set.name, id
                    )));
                }
                seen.insert(*id);
            }
            if let Some(missing) = entity_set.key.iter().find(|id| !seen.contains(id)) {
                return Err(ShuttleError::Config(format!(
                    "key property {} of entity set '{}' is not one of its properties",
                    missing, entity_set.name
                )));
            }
            if catalog
                .entity_set_ids
                .insert(entity_set.name.clone(), entity_set.id)
                .is_some()
            {
                return Err(ShuttleError::Config(format!(
                    "duplicate entity set '{}'",
                    entity_set.name
                )));
            }
            catalog.entity_sets.insert(entity_set.id, entity_set);
        }

        Ok(catalog)
    }

    pub fn from_json(json: &str) -> Result<Self> {
        let document: CatalogDocument = serde_json::from_str(json)?;
        Self::new(document.property_types, document.entity_sets)
    }

    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let content = std::fs::read_to_string(path.as_ref())?;
        Self::from_json(&content)
    }

    pub fn property_type(&self, fqn: &str) -> Option<&PropertyType> {
        self.property_type_ids
            .get(fqn)
            .and_then(|id| self.property_types.get(id))
    }

    pub fn property_type_by_id(&self, id: &Uuid) -> Option<&PropertyType> {
        self.property_types.get(id)
    }

    pub fn entity_set(&self, name: &str) -> Option<&EntitySet> {
        self.entity_set_ids
            .get(name)
            .and_then(|id| self.entity_sets.get(id))
    }

    pub fn entity_set_by_id(&self, id: &Uuid) -> Option<&EntitySet> {
        self.entity_sets.get(id)
    }

    pub fn entity_set_id(&self, name: &str) -> Option<Uuid> {
        self.entity_set_ids.get(name).copied()
    }

    pub fn key_property_ids(&self, entity_set_name: &str) -> Option<&[Uuid]> {
        self.entity_set(entity_set_name).map(|es| es.key.as_slice())
    }

    pub fn authorized_property_ids(&self, entity_set_id: &Uuid) -> Option<&[Uuid]> {
        self.entity_sets
            .get(entity_set_id)
            .map(|es| es.properties.as_slice())
    }
}
