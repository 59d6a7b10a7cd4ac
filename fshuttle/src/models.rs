use base64::Engine;
use base64::engine::general_purpose::STANDARD as BASE64;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap, HashSet};
use std::fmt;
use std::hash::{Hash, Hasher};
use uuid::Uuid;

/// One input record: column name to raw value.
pub type Row = serde_json::Map<String, serde_json::Value>;

/// Property values grouped by property type id.
pub type PropertyValues = HashMap<Uuid, HashSet<RawValue>>;

/// Which back end receives a property, entity or association.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StorageDestination {
    Relational,
    Blob,
    RemoteApi,
    None,
}

impl fmt::Display for StorageDestination {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            StorageDestination::Relational => "relational",
            StorageDestination::Blob => "blob",
            StorageDestination::RemoteApi => "remote_api",
            StorageDestination::None => "none",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum UpdateMode {
    /// Supersede every authorized property of the written entities.
    Replace,
    /// Supersede only the property types present in the batch.
    PartialReplace,
    /// Append values, never supersede.
    #[default]
    Merge,
}

impl UpdateMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            UpdateMode::Replace => "Replace",
            UpdateMode::PartialReplace => "PartialReplace",
            UpdateMode::Merge => "Merge",
        }
    }
}

/// A value extracted from a row, before coercion to a property datatype.
#[derive(Debug, Clone)]
pub enum RawValue {
    Text(String),
    Integer(i64),
    Float(f64),
    Boolean(bool),
    Binary(Vec<u8>),
}

impl RawValue {
    /// Canonical text used for identifiers and content hashes.
    pub fn canonical_text(&self) -> String {
        match self {
            RawValue::Text(s) => s.clone(),
            RawValue::Integer(i) => i.to_string(),
            RawValue::Float(f) => f.to_string(),
            RawValue::Boolean(b) => b.to_string(),
            RawValue::Binary(bytes) => BASE64.encode(bytes),
        }
    }

    pub fn is_blank(&self) -> bool {
        matches!(self, RawValue::Text(s) if s.trim().is_empty())
    }

    pub fn type_name(&self) -> &'static str {
        match self {
            RawValue::Text(_) => "text",
            RawValue::Integer(_) => "integer",
            RawValue::Float(_) => "float",
            RawValue::Boolean(_) => "boolean",
            RawValue::Binary(_) => "binary",
        }
    }

    pub fn to_json(&self) -> serde_json::Value {
        match self {
            RawValue::Text(s) => serde_json::Value::String(s.clone()),
            RawValue::Integer(i) => serde_json::Value::from(*i),
            RawValue::Float(f) => serde_json::Number::from_f64(*f)
                .map(serde_json::Value::Number)
                .unwrap_or(serde_json::Value::Null),
            RawValue::Boolean(b) => serde_json::Value::Bool(*b),
            RawValue::Binary(bytes) => serde_json::Value::String(BASE64.encode(bytes)),
        }
    }
}

impl PartialEq for RawValue {
    fn eq(&self, other: &Self) -> bool {
        match (self, other) {
            (RawValue::Text(a), RawValue::Text(b)) => a == b,
            (RawValue::Integer(a), RawValue::Integer(b)) => a == b,
            (RawValue::Float(a), RawValue::Float(b)) => a.to_bits() == b.to_bits(),
            (RawValue::Boolean(a), RawValue::Boolean(b)) => a == b,
            (RawValue::Binary(a), RawValue::Binary(b)) => a == b,
            _ => false,
        }
    }
}

impl Eq for RawValue {}

impl Hash for RawValue {
    fn hash<H: Hasher>(&self, state: &mut H) {
        std::mem::discriminant(self).hash(state);
        match self {
            RawValue::Text(s) => s.hash(state),
            RawValue::Integer(i) => i.hash(state),
            RawValue::Float(f) => f.to_bits().hash(state),
            RawValue::Boolean(b) => b.hash(state),
            RawValue::Binary(bytes) => bytes.hash(state),
        }
    }
}

impl From<&str> for RawValue {
    fn from(value: &str) -> Self {
        RawValue::Text(value.to_string())
    }
}

/// Business identity of an entity before it is resolved to a surrogate id.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct EntityKey {
    pub entity_set_id: Uuid,
    pub entity_id: String,
}

impl EntityKey {
    pub fn new(entity_set_id: Uuid, entity_id: impl Into<String>) -> Self {
        Self {
            entity_set_id,
            entity_id: entity_id.into(),
        }
    }
}

impl fmt::Display for EntityKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.entity_set_id, self.entity_id)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Entity {
    pub key: EntityKey,
    pub properties: PropertyValues,
}

impl Entity {
    pub fn new(key: EntityKey, properties: PropertyValues) -> Self {
        Self { key, properties }
    }

    /// Unions the other entity's values into this one.
    pub fn absorb(&mut self, properties: PropertyValues) {
        union_properties(&mut self.properties, properties);
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Association {
    pub key: EntityKey,
    pub src: EntityKey,
    pub dst: EntityKey,
    pub properties: PropertyValues,
}

impl Association {
    pub fn absorb(&mut self, other: Association) {
        if other.src != self.src || other.dst != self.dst {
            log::warn!(
                "Association {} staged with conflicting endpoints; keeping {} -> {}",
                self.key,
                self.src,
                self.dst
            );
        }
        union_properties(&mut self.properties, other.properties);
    }
}

pub(crate) fn union_properties(into: &mut PropertyValues, from: PropertyValues) {
    for (property_type_id, values) in from {
        into.entry(property_type_id).or_default().extend(values);
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DestinationCounts {
    pub entities: usize,
    pub associations: usize,
}

/// Outcome of a completed run.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct IntegrationReport {
    pub plan: String,
    pub rows_read: u64,
    pub flushes: u64,
    pub destinations: BTreeMap<StorageDestination, DestinationCounts>,
}

impl IntegrationReport {
    pub fn total_entities(&self) -> usize {
        self.destinations.values().map(|c| c.entities).sum()
    }

    pub fn total_associations(&self) -> usize {
        self.destinations.values().map(|c| c.associations).sum()
    }
}

// --- Relational store records ---

#[derive(Debug)]
pub struct RunLog {
    pub run_id: i64,
    pub plan: String,
    pub start_time: i64, // Unix timestamp
    pub end_time: Option<i64>,
    pub status: String,
    pub details: Option<String>, // JSON report or error text
}

#[derive(Debug, Clone, PartialEq)]
pub struct StoredProperty {
    pub property_type_id: Uuid,
    pub hash: Vec<u8>,
    pub value: rusqlite::types::Value,
    /// Negative once superseded.
    pub version: i64,
    pub versions: Vec<i64>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoredEdge {
    pub src_entity_set_id: Uuid,
    pub src_id: Uuid,
    pub dst_entity_set_id: Uuid,
    pub dst_id: Uuid,
    pub edge_entity_set_id: Uuid,
    pub edge_id: Uuid,
    pub version: i64,
    pub versions: Vec<i64>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_float_values_hash_by_bits() {
        let mut set = HashSet::new();
        set.insert(RawValue::Float(1.5));
        set.insert(RawValue::Float(1.5));
        set.insert(RawValue::Integer(1));
        assert_eq!(set.len(), 2);
    }

    #[test]
    fn test_blank_only_applies_to_text() {
        assert!(RawValue::from("  ").is_blank());
        assert!(!RawValue::from("x").is_blank());
        assert!(!RawValue::Integer(0).is_blank());
    }

    #[test]
    fn test_entity_absorb_unions_values() {
        let pt = Uuid::new_v4();
        let key = EntityKey::new(Uuid::new_v4(), "42");
        let mut entity = Entity::new(
            key,
            HashMap::from([(pt, HashSet::from([RawValue::from("red")]))]),
        );
        entity.absorb(HashMap::from([(pt, HashSet::from([RawValue::from("blue")]))]));
        assert_eq!(entity.properties[&pt].len(), 2);
    }
}
