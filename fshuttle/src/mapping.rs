//! Turns one row and an extraction plan into staged, destination-addressed records.
//!
//! The engine is built once per run from the plan and the catalog snapshot. Every
//! name in the plan is resolved up front, so `map_row` only reads immutable state
//! and can run on any number of workers at once.

use crate::batch::AddressedBatch;
use crate::catalog::{EdmCatalog, PrimitiveKind};
use crate::errors::{Result, ShuttleError};
use crate::extract::{Condition, Extractor};
use crate::models::{
    Association, EntityKey, PropertyValues, Row, StorageDestination, UpdateMode,
};
use crate::plan::{ExtractionPlan, PropertyDefinition};
use crate::utils::id::default_entity_id;
use std::collections::{BTreeSet, HashMap, HashSet};
use uuid::Uuid;

#[derive(Debug)]
struct CompiledProperty {
    property_type_id: Uuid,
    fqn: String,
    extractor: Extractor,
    destination: StorageDestination,
}

#[derive(Debug)]
struct CompiledDefinition {
    alias: String,
    entity_set_id: Uuid,
    key: Vec<Uuid>,
    condition: Option<Condition>,
    generator: Option<Extractor>,
    properties: Vec<CompiledProperty>,
}

#[derive(Debug)]
struct CompiledAssociation {
    definition: CompiledDefinition,
    src: String,
    dst: String,
}

/// Present values of one definition, split by destination and in total.
#[derive(Default)]
struct Extracted {
    by_destination: HashMap<StorageDestination, PropertyValues>,
    all: PropertyValues,
}

#[derive(Debug)]
pub struct MappingEngine {
    plan_name: String,
    condition: Option<Condition>,
    default_destination: StorageDestination,
    entities: Vec<CompiledDefinition>,
    associations: Vec<CompiledAssociation>,
    update_modes: HashMap<Uuid, UpdateMode>,
}

impl MappingEngine {
    /// Validates `plan` against `catalog`. Unknown entity sets, unknown or unauthorized
    /// property types, duplicate aliases and dangling association aliases are rejected
    /// here, before any row is read.
    pub fn new(
        plan: &ExtractionPlan,
        catalog: &EdmCatalog,
        default_destination: StorageDestination,
    ) -> Result<Self> {
        let invalid = |reason: String| ShuttleError::InvalidPlan {
            plan: plan.name.clone(),
            reason,
        };

        let mut update_modes: HashMap<Uuid, UpdateMode> = HashMap::new();
        let mut register_mode = |entity_set: &str, id: Uuid, mode: UpdateMode| -> Result<()> {
            match update_modes.insert(id, mode) {
                Some(previous) if previous != mode => Err(ShuttleError::InvalidPlan {
                    plan: plan.name.clone(),
                    reason: format!(
                        "entity set '{entity_set}' is written with both {} and {}",
                        previous.as_str(),
                        mode.as_str()
                    ),
                }),
                _ => Ok(()),
            }
        };

        let mut aliases = HashSet::new();
        let mut entities = Vec::with_capacity(plan.entities.len());
        for definition in &plan.entities {
            if !aliases.insert(definition.alias.clone()) {
                return Err(invalid(format!("duplicate alias '{}'", definition.alias)));
            }
            let compiled = compile(
                catalog,
                default_destination,
                &definition.alias,
                &definition.entity_set,
                definition.condition.clone(),
                definition.generator.clone(),
                &definition.properties,
            )?;
            register_mode(&definition.entity_set, compiled.entity_set_id, definition.update_mode)?;
            entities.push(compiled);
        }

        let mut associations = Vec::with_capacity(plan.associations.len());
        for definition in &plan.associations {
            for endpoint in [&definition.src, &definition.dst] {
                if !entities.iter().any(|e| &e.alias == endpoint) {
                    return Err(invalid(format!(
                        "association '{}' references undeclared entity alias '{}'",
                        definition.alias, endpoint
                    )));
                }
            }
            if !aliases.insert(definition.alias.clone()) {
                return Err(invalid(format!("duplicate alias '{}'", definition.alias)));
            }
            let compiled = compile(
                catalog,
                default_destination,
                &definition.alias,
                &definition.entity_set,
                definition.condition.clone(),
                definition.generator.clone(),
                &definition.properties,
            )?;
            register_mode(&definition.entity_set, compiled.entity_set_id, definition.update_mode)?;
            associations.push(CompiledAssociation {
                definition: compiled,
                src: definition.src.clone(),
                dst: definition.dst.clone(),
            });
        }

        Ok(Self {
            plan_name: plan.name.clone(),
            condition: plan.condition.clone(),
            default_destination,
            entities,
            associations,
            update_modes,
        })
    }

    pub fn plan_name(&self) -> &str {
        &self.plan_name
    }

    /// Update mode of every entity set the plan writes to.
    pub fn update_modes(&self) -> &HashMap<Uuid, UpdateMode> {
        &self.update_modes
    }

    /// Every destination a row can be staged in: the route of each property, plus
    /// the default destination when the plan declares associations.
    pub fn destinations(&self) -> BTreeSet<StorageDestination> {
        let mut destinations: BTreeSet<StorageDestination> = self
            .entities
            .iter()
            .chain(self.associations.iter().map(|a| &a.definition))
            .flat_map(|definition| definition.properties.iter().map(|p| p.destination))
            .collect();
        if !self.associations.is_empty() {
            destinations.insert(self.default_destination);
        }
        destinations
    }

    /// Fails with `MissingDestination` for the first reachable destination that
    /// `is_registered` rejects.
    pub fn ensure_routable(&self, is_registered: impl Fn(StorageDestination) -> bool) -> Result<()> {
        match self.destinations().into_iter().find(|d| !is_registered(*d)) {
            Some(missing) => Err(ShuttleError::MissingDestination(missing.to_string())),
            None => Ok(()),
        }
    }

    /// Maps one row. Skipped rows and definitions yield an empty fragment; only
    /// extraction failures are errors.
    pub fn map_row(&self, row_index: u64, row: &Row) -> Result<AddressedBatch> {
        let mut fragment = AddressedBatch::new();
        if let Some(condition) = &self.condition {
            if !condition.evaluate(row) {
                return Ok(fragment);
            }
        }

        let mut created: HashMap<&str, EntityKey> = HashMap::new();
        for definition in &self.entities {
            if let Some(condition) = &definition.condition {
                if !condition.evaluate(row) {
                    continue;
                }
            }

            let extracted = extract(definition, row_index, row)?;
            let entity_id = identify(definition, row_index, row, &extracted.all)?;
            let has_properties = !extracted.all.is_empty();
            let has_id = !entity_id.trim().is_empty();
            if !(has_id && has_properties) {
                log::trace!(
                    "Row {}: entity '{}' not created (id present: {}, properties present: {})",
                    row_index,
                    definition.alias,
                    has_id,
                    has_properties
                );
                continue;
            }

            let key = EntityKey::new(definition.entity_set_id, entity_id);
            for (destination, properties) in extracted.by_destination {
                fragment
                    .destination_mut(destination)
                    .stage_entity(key.clone(), properties);
            }
            created.insert(definition.alias.as_str(), key);
        }

        for association in &self.associations {
            let definition = &association.definition;
            if let Some(condition) = &definition.condition {
                if !condition.evaluate(row) {
                    continue;
                }
            }

            let (src, dst) = match (
                created.get(association.src.as_str()),
                created.get(association.dst.as_str()),
            ) {
                (Some(src), Some(dst)) => (src.clone(), dst.clone()),
                (src, _) => {
                    let missing = if src.is_none() {
                        &association.src
                    } else {
                        &association.dst
                    };
                    log::warn!(
                        "Row {}: skipping association '{}' because entity '{}' was not created",
                        row_index,
                        definition.alias,
                        missing
                    );
                    continue;
                }
            };

            let mut extracted = extract(definition, row_index, row)?;
            let association_id = identify(definition, row_index, row, &extracted.all)?;
            if association_id.trim().is_empty() {
                log::trace!(
                    "Row {}: association '{}' has a blank identifier",
                    row_index,
                    definition.alias
                );
                continue;
            }

            let key = EntityKey::new(definition.entity_set_id, association_id);
            extracted
                .by_destination
                .entry(self.default_destination)
                .or_default();
            for (destination, properties) in extracted.by_destination {
                fragment.destination_mut(destination).stage_association(Association {
                    key: key.clone(),
                    src: src.clone(),
                    dst: dst.clone(),
                    properties,
                });
            }
        }

        Ok(fragment)
    }
}

fn compile(
    catalog: &EdmCatalog,
    default_destination: StorageDestination,
    alias: &str,
    entity_set: &str,
    condition: Option<Condition>,
    generator: Option<Extractor>,
    properties: &[PropertyDefinition],
) -> Result<CompiledDefinition> {
    let set = catalog
        .entity_set(entity_set)
        .ok_or_else(|| ShuttleError::UnknownEntitySet(entity_set.to_string()))?;

    let mut compiled = Vec::with_capacity(properties.len());
    for property in properties {
        let property_type = catalog.property_type(&property.property_type).ok_or_else(|| {
            ShuttleError::UnknownPropertyType {
                entity_set: entity_set.to_string(),
                property_type: property.property_type.clone(),
            }
        })?;
        if !set.is_authorized(&property_type.id) {
            return Err(ShuttleError::UnauthorizedProperty {
                entity_set_id: set.id,
                entity_id: format!("<{alias}>"),
                property_type_id: property_type.id,
            });
        }
        let destination = property.destination.unwrap_or(match property_type.datatype {
            PrimitiveKind::Binary => StorageDestination::Blob,
            _ => default_destination,
        });
        compiled.push(CompiledProperty {
            property_type_id: property_type.id,
            fqn: property_type.fqn.clone(),
            extractor: property.value.clone(),
            destination,
        });
    }

    Ok(CompiledDefinition {
        alias: alias.to_string(),
        entity_set_id: set.id,
        key: set.key.clone(),
        condition,
        generator,
        properties: compiled,
    })
}

fn extract(definition: &CompiledDefinition, row_index: u64, row: &Row) -> Result<Extracted> {
    let mut extracted = Extracted::default();
    for property in &definition.properties {
        let values = property
            .extractor
            .extract(row)
            .map_err(|reason| ShuttleError::Extraction {
                row: row_index,
                context: format!("{}.{}", definition.alias, property.fqn),
                reason,
            })?;
        if values.is_empty() {
            continue;
        }
        extracted
            .by_destination
            .entry(property.destination)
            .or_default()
            .entry(property.property_type_id)
            .or_default()
            .extend(values.iter().cloned());
        extracted
            .all
            .entry(property.property_type_id)
            .or_default()
            .extend(values);
    }
    Ok(extracted)
}

fn identify(
    definition: &CompiledDefinition,
    row_index: u64,
    row: &Row,
    properties: &PropertyValues,
) -> Result<String> {
    match &definition.generator {
        Some(generator) => {
            let values = generator
                .extract(row)
                .map_err(|reason| ShuttleError::Extraction {
                    row: row_index,
                    context: format!("{}.<id>", definition.alias),
                    reason,
                })?;
            Ok(values
                .iter()
                .map(|v| v.canonical_text())
                .collect::<Vec<_>>()
                .join(","))
        }
        None => Ok(default_entity_id(&definition.key, properties)),
    }
}
