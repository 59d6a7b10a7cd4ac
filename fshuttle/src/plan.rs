//! The extraction plan ("flight"): which entities and associations to build from a row.

use crate::errors::{Result, ShuttleError};
use crate::extract::{Condition, Extractor};
use crate::models::{StorageDestination, UpdateMode};
use serde::{Deserialize, Serialize};
use std::path::Path;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExtractionPlan {
    pub name: String,
    /// Rows failing this condition produce nothing.
    #[serde(default)]
    pub condition: Option<Condition>,
    #[serde(default)]
    pub entities: Vec<EntityDefinition>,
    #[serde(default)]
    pub associations: Vec<AssociationDefinition>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PropertyDefinition {
    /// Fully qualified property type name.
    pub property_type: String,
    pub value: Extractor,
    #[serde(default)]
    pub destination: Option<StorageDestination>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EntityDefinition {
    pub alias: String,
    pub entity_set: String,
    #[serde(default)]
    pub condition: Option<Condition>,
    #[serde(default)]
    pub properties: Vec<PropertyDefinition>,
    /// Replaces the key-derived identifier when present.
    #[serde(default)]
    pub generator: Option<Extractor>,
    #[serde(default)]
    pub update_mode: UpdateMode,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AssociationDefinition {
    pub alias: String,
    pub entity_set: String,
    pub src: String,
    pub dst: String,
    #[serde(default)]
    pub condition: Option<Condition>,
    #[serde(default)]
    pub properties: Vec<PropertyDefinition>,
    #[serde(default)]
    pub generator: Option<Extractor>,
    #[serde(default)]
    pub update_mode: UpdateMode,
}

impl ExtractionPlan {
    pub fn from_json(json: &str) -> Result<Self> {
        serde_json::from_str(json).map_err(|e| ShuttleError::InvalidPlan {
            plan: "<inline>".to_string(),
            reason: e.to_string(),
        })
    }

    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path)?;
        serde_json::from_str(&content).map_err(|e| ShuttleError::InvalidPlan {
            plan: path.display().to_string(),
            reason: e.to_string(),
        })
    }
}
