//! Versioned upserts into the relational store.
//!
//! Every entity set written in a flush takes one version base from the clock.
//! Superseded values are stamped with `-tombstone`, new values are written at
//! `write`, and the entity-level marker moves to `write` only after every
//! property write for the set has committed. Rows are never deleted.

use super::{IntegrationDestination, mode_for, surrogate_id};
use crate::catalog::{EdmCatalog, EntitySet};
use crate::coerce::{coerce, to_sql};
use crate::errors::{Result, ShuttleError};
use crate::models::{
    Association, Entity, EntityKey, PropertyValues, StorageDestination, UpdateMode,
};
use crate::store::RelationalStore;
use crate::utils::clock::{VersionClock, WriteVersions};
use crate::utils::id::value_hash;
use async_trait::async_trait;
use rusqlite::params;
use rusqlite::types::Value as SqlValue;
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use uuid::Uuid;

const TOMBSTONE_SQL: &str = "UPDATE data
    SET version = -?1, versions = json_insert(versions, '$[#]', -?1), last_write = ?2
    WHERE entity_set_id = ?3 AND id = ?4 AND property_type_id = ?5 AND version > 0";

const UPSERT_VALUE_SQL: &str = "INSERT INTO data
    (entity_set_id, id, property_type_id, hash, value, version, versions, last_write)
    VALUES (?1, ?2, ?3, ?4, ?5, ?6, json_array(?6), ?7)
    ON CONFLICT(entity_set_id, id, property_type_id, hash) DO UPDATE SET
        version = excluded.version,
        versions = json_insert(data.versions, '$[#]', excluded.version),
        last_write = excluded.last_write
    WHERE excluded.version > ABS(data.version)";

const UPSERT_ENTITY_SQL: &str = "INSERT INTO entities (entity_set_id, id, version, versions, last_write)
    VALUES (?1, ?2, ?3, json_array(?3), ?4)
    ON CONFLICT(entity_set_id, id) DO UPDATE SET
        version = excluded.version,
        versions = json_insert(entities.versions, '$[#]', excluded.version),
        last_write = excluded.last_write
    WHERE excluded.version > ABS(entities.version)";

const UPSERT_EDGE_SQL: &str = "INSERT INTO edges
    (src_entity_set_id, src_id, dst_entity_set_id, dst_id, edge_entity_set_id, edge_id, version, versions, last_write)
    VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, json_array(?7), ?8)
    ON CONFLICT(src_entity_set_id, src_id, dst_entity_set_id, dst_id, edge_entity_set_id, edge_id) DO UPDATE SET
        version = excluded.version,
        versions = json_insert(edges.versions, '$[#]', excluded.version),
        last_write = excluded.last_write
    WHERE excluded.version > ABS(edges.version)";

/// An entity or association of one flush, with its resolved id.
struct PendingRecord<'a> {
    key: &'a EntityKey,
    id: Uuid,
    properties: &'a PropertyValues,
}

struct ValueRow {
    id: Uuid,
    hash: [u8; 16],
    value: SqlValue,
}

struct EdgeRow {
    src: (Uuid, Uuid),
    dst: (Uuid, Uuid),
    edge: (Uuid, Uuid),
}

pub struct RelationalDestination {
    store: Arc<RelationalStore>,
    catalog: Arc<EdmCatalog>,
    clock: VersionClock,
}

impl RelationalDestination {
    /// The version clock starts above every version already persisted in `store`.
    pub fn new(store: Arc<RelationalStore>, catalog: Arc<EdmCatalog>) -> Result<Self> {
        let clock = VersionClock::new();
        clock.observe(store.max_version()?);
        Ok(Self {
            store,
            catalog,
            clock,
        })
    }

    /// Authorizes and coerces every incoming value. Nothing is written here, so a
    /// failure leaves the entity set untouched.
    fn prepare(
        &self,
        entity_set_id: Uuid,
        records: &[PendingRecord<'_>],
    ) -> Result<(&EntitySet, BTreeMap<Uuid, Vec<ValueRow>>)> {
        let entity_set = self
            .catalog
            .entity_set_by_id(&entity_set_id)
            .ok_or_else(|| ShuttleError::UnknownEntitySet(entity_set_id.to_string()))?;

        let mut rows: BTreeMap<Uuid, Vec<ValueRow>> = BTreeMap::new();
        for record in records {
            for (property_type_id, values) in record.properties {
                if !entity_set.is_authorized(property_type_id) {
                    return Err(ShuttleError::UnauthorizedProperty {
                        entity_set_id,
                        entity_id: record.key.entity_id.clone(),
                        property_type_id: *property_type_id,
                    });
                }
                let property_type = self
                    .catalog
                    .property_type_by_id(property_type_id)
                    .ok_or_else(|| ShuttleError::UnknownPropertyType {
                        entity_set: entity_set.name.clone(),
                        property_type: property_type_id.to_string(),
                    })?;
                let bucket = rows.entry(*property_type_id).or_default();
                for value in values {
                    let coerced = coerce(property_type.datatype, *property_type_id, value)
                        .map_err(|e| e.for_entity(record.key))?;
                    bucket.push(ValueRow {
                        id: record.id,
                        hash: value_hash(&coerced),
                        value: to_sql(coerced),
                    });
                }
            }
        }
        Ok((entity_set, rows))
    }

    fn upsert_records(
        &self,
        entity_set_id: Uuid,
        records: &[PendingRecord<'_>],
        mode: UpdateMode,
    ) -> Result<WriteVersions> {
        let (entity_set, rows) = self.prepare(entity_set_id, records)?;
        let versions = self.clock.next();

        let superseded: Vec<Uuid> = match mode {
            UpdateMode::Replace => entity_set.properties.clone(),
            UpdateMode::PartialReplace => rows.keys().copied().collect(),
            UpdateMode::Merge => Vec::new(),
        };

        let es = entity_set_id.to_string();
        let now = chrono::Utc::now().timestamp_millis();
        let mut conn = self.store.conn()?;

        if !superseded.is_empty() {
            let tx = conn.transaction()?;
            {
                let mut stmt = tx.prepare_cached(TOMBSTONE_SQL)?;
                for record in records {
                    let id = record.id.to_string();
                    for property_type_id in &superseded {
                        stmt.execute(params![
                            versions.tombstone,
                            now,
                            es,
                            id,
                            property_type_id.to_string()
                        ])?;
                    }
                }
            }
            tx.commit()?;
        }

        for (property_type_id, values) in &rows {
            let pt = property_type_id.to_string();
            let tx = conn.transaction()?;
            {
                let mut stmt = tx.prepare_cached(UPSERT_VALUE_SQL)?;
                for row in values {
                    stmt.execute(params![
                        es,
                        row.id.to_string(),
                        pt,
                        &row.hash[..],
                        row.value,
                        versions.write,
                        now
                    ])?;
                }
            }
            tx.commit()?;
        }

        let tx = conn.transaction()?;
        {
            let mut stmt = tx.prepare_cached(UPSERT_ENTITY_SQL)?;
            for record in records {
                stmt.execute(params![es, record.id.to_string(), versions.write, now])?;
            }
        }
        tx.commit()?;

        log::info!(
            "Relational: wrote {} records to entity set '{}' ({} mode, version {})",
            records.len(),
            entity_set.name,
            mode.as_str(),
            versions.write
        );
        Ok(versions)
    }

    fn upsert_edges(&self, edges: &[EdgeRow], version: i64) -> Result<()> {
        let now = chrono::Utc::now().timestamp_millis();
        let mut conn = self.store.conn()?;
        let tx = conn.transaction()?;
        {
            let mut stmt = tx.prepare_cached(UPSERT_EDGE_SQL)?;
            for edge in edges {
                stmt.execute(params![
                    edge.src.0.to_string(),
                    edge.src.1.to_string(),
                    edge.dst.0.to_string(),
                    edge.dst.1.to_string(),
                    edge.edge.0.to_string(),
                    edge.edge.1.to_string(),
                    version,
                    now
                ])?;
            }
        }
        tx.commit()?;
        Ok(())
    }
}

#[async_trait]
impl IntegrationDestination for RelationalDestination {
    fn accepts(&self) -> StorageDestination {
        StorageDestination::Relational
    }

    async fn integrate_entities(
        &self,
        entities: &HashMap<EntityKey, Entity>,
        ids: &HashMap<EntityKey, Uuid>,
        update_modes: &HashMap<Uuid, UpdateMode>,
    ) -> Result<usize> {
        let mut by_entity_set: BTreeMap<Uuid, Vec<PendingRecord<'_>>> = BTreeMap::new();
        for (key, entity) in entities {
            by_entity_set
                .entry(key.entity_set_id)
                .or_default()
                .push(PendingRecord {
                    key,
                    id: surrogate_id(ids, key)?,
                    properties: &entity.properties,
                });
        }

        let mut written = 0;
        for (entity_set_id, records) in &by_entity_set {
            self.upsert_records(*entity_set_id, records, mode_for(update_modes, entity_set_id))?;
            written += records.len();
        }
        Ok(written)
    }

    async fn integrate_associations(
        &self,
        associations: &HashMap<EntityKey, Association>,
        ids: &HashMap<EntityKey, Uuid>,
        update_modes: &HashMap<Uuid, UpdateMode>,
    ) -> Result<usize> {
        let mut by_entity_set: BTreeMap<Uuid, (Vec<PendingRecord<'_>>, Vec<EdgeRow>)> =
            BTreeMap::new();
        for (key, association) in associations {
            let id = surrogate_id(ids, key)?;
            let src_id = surrogate_id(ids, &association.src)?;
            let dst_id = surrogate_id(ids, &association.dst)?;
            let (records, edges) = by_entity_set.entry(key.entity_set_id).or_default();
            records.push(PendingRecord {
                key,
                id,
                properties: &association.properties,
            });
            edges.push(EdgeRow {
                src: (association.src.entity_set_id, src_id),
                dst: (association.dst.entity_set_id, dst_id),
                edge: (key.entity_set_id, id),
            });
        }

        let mut written = 0;
        for (entity_set_id, (records, edges)) in &by_entity_set {
            let versions =
                self.upsert_records(*entity_set_id, records, mode_for(update_modes, entity_set_id))?;
            self.upsert_edges(edges, versions.write)?;
            written += edges.len();
        }
        Ok(written)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::catalog::{PrimitiveKind, PropertyType};
    use crate::models::RawValue;
    use std::collections::HashSet;

    const CARS: Uuid = Uuid::from_u128(0xa);
    const PEOPLE: Uuid = Uuid::from_u128(0xb);
    const OWNS: Uuid = Uuid::from_u128(0xc);
    const ID: Uuid = Uuid::from_u128(1);
    const COLOR: Uuid = Uuid::from_u128(2);
    const YEAR: Uuid = Uuid::from_u128(3);

    fn catalog() -> Arc<EdmCatalog> {
        let pt = |id, fqn: &str, datatype| PropertyType {
            id,
            fqn: fqn.to_string(),
            datatype,
        };
        let es = |id, name: &str, properties: Vec<Uuid>| EntitySet {
            id,
            name: name.to_string(),
            key: vec![ID],
            properties,
        };
        Arc::new(
            EdmCatalog::new(
                vec![
                    pt(ID, "general.id", PrimitiveKind::String),
                    pt(COLOR, "general.color", PrimitiveKind::String),
                    pt(YEAR, "general.year", PrimitiveKind::Int32),
                ],
                vec![
                    es(CARS, "cars", vec![ID, COLOR, YEAR]),
                    es(PEOPLE, "people", vec![ID]),
                    es(OWNS, "owns", vec![ID]),
                ],
            )
            .unwrap(),
        )
    }

    fn setup() -> (Arc<RelationalStore>, RelationalDestination) {
        let store = Arc::new(RelationalStore::open_in_memory().unwrap());
        store.initialize_schema().unwrap();
        let destination = RelationalDestination::new(Arc::clone(&store), catalog()).unwrap();
        (store, destination)
    }

    fn car(id: &str, colors: &[&str]) -> (EntityKey, Entity) {
        let key = EntityKey::new(CARS, id);
        let properties = HashMap::from([
            (ID, HashSet::from([RawValue::from(id)])),
            (COLOR, colors.iter().map(|c| RawValue::from(*c)).collect()),
        ]);
        (key.clone(), Entity::new(key, properties))
    }

    fn ids_for<'a>(keys: impl IntoIterator<Item = &'a EntityKey>) -> HashMap<EntityKey, Uuid> {
        keys.into_iter().map(|k| (k.clone(), Uuid::new_v4())).collect()
    }

    #[tokio::test]
    async fn test_replace_tombstones_previous_values() {
        let (store, destination) = setup();
        let modes = HashMap::from([(CARS, UpdateMode::Replace)]);
        let first = HashMap::from([car("42", &["red"])]);
        let ids = ids_for(first.keys());
        let id = ids[&EntityKey::new(CARS, "42")];

        destination.integrate_entities(&first, &ids, &modes).await.unwrap();
        let second = HashMap::from([car("42", &["blue"])]);
        destination.integrate_entities(&second, &ids, &modes).await.unwrap();

        assert_eq!(
            store.latest_values(CARS, id, COLOR).unwrap(),
            vec![SqlValue::Text("blue".into())]
        );
        let rows = store.property_rows(CARS, id).unwrap();
        let red = rows
            .iter()
            .find(|r| r.value == SqlValue::Text("red".into()))
            .unwrap();
        assert!(red.version < 0);
        assert_eq!(red.versions.len(), 2);
        let entity_version = store.entity_version(CARS, id).unwrap().unwrap();
        assert!(entity_version > red.version.abs());
    }

    #[tokio::test]
    async fn test_merge_keeps_previous_values_live() {
        let (store, destination) = setup();
        let modes = HashMap::from([(CARS, UpdateMode::Merge)]);
        let first = HashMap::from([car("42", &["red"])]);
        let ids = ids_for(first.keys());
        let id = ids[&EntityKey::new(CARS, "42")];

        destination.integrate_entities(&first, &ids, &modes).await.unwrap();
        destination
            .integrate_entities(&HashMap::from([car("42", &["blue"])]), &ids, &modes)
            .await
            .unwrap();

        let live = store
            .property_rows(CARS, id)
            .unwrap()
            .into_iter()
            .filter(|r| r.property_type_id == COLOR && r.version > 0)
            .count();
        assert_eq!(live, 2);
    }

    #[tokio::test]
    async fn test_partial_replace_leaves_other_properties() {
        let (store, destination) = setup();
        let key = EntityKey::new(CARS, "42");
        let ids = ids_for([&key]);
        let id = ids[&key];
        let with_year = HashMap::from([(
            key.clone(),
            Entity::new(
                key.clone(),
                HashMap::from([
                    (ID, HashSet::from([RawValue::from("42")])),
                    (YEAR, HashSet::from([RawValue::from("1999")])),
                ]),
            ),
        )]);
        let modes = HashMap::from([(CARS, UpdateMode::PartialReplace)]);
        destination.integrate_entities(&with_year, &ids, &modes).await.unwrap();
        destination
            .integrate_entities(&HashMap::from([car("42", &["red"])]), &ids, &modes)
            .await
            .unwrap();

        assert_eq!(
            store.latest_values(CARS, id, YEAR).unwrap(),
            vec![SqlValue::Integer(1999)]
        );
        assert_eq!(
            store.latest_values(CARS, id, COLOR).unwrap(),
            vec![SqlValue::Text("red".into())]
        );
    }

    #[tokio::test]
    async fn test_reapplying_batch_adds_no_rows() {
        let (store, destination) = setup();
        let batch = HashMap::from([car("42", &["red", "blue"]), car("7", &["green"])]);
        let ids = ids_for(batch.keys());
        let modes = HashMap::new();

        destination.integrate_entities(&batch, &ids, &modes).await.unwrap();
        let data_rows = store.count_rows("data").unwrap();
        destination.integrate_entities(&batch, &ids, &modes).await.unwrap();

        assert_eq!(data_rows, 5);
        assert_eq!(store.count_rows("data").unwrap(), data_rows);
        assert_eq!(store.count_rows("entities").unwrap(), 2);
    }

    #[tokio::test]
    async fn test_unauthorized_property_writes_nothing() {
        let (store, destination) = setup();
        let key = EntityKey::new(PEOPLE, "ann");
        let batch = HashMap::from([(
            key.clone(),
            Entity::new(
                key.clone(),
                HashMap::from([
                    (ID, HashSet::from([RawValue::from("ann")])),
                    (COLOR, HashSet::from([RawValue::from("red")])),
                ]),
            ),
        )]);
        let ids = ids_for(batch.keys());

        let err = destination
            .integrate_entities(&batch, &ids, &HashMap::new())
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            ShuttleError::UnauthorizedProperty { entity_set_id, ref entity_id, property_type_id }
                if entity_set_id == PEOPLE && entity_id == "ann" && property_type_id == COLOR
        ));
        assert_eq!(store.count_rows("data").unwrap(), 0);
        assert_eq!(store.count_rows("entities").unwrap(), 0);
    }

    #[tokio::test]
    async fn test_type_mismatch_is_fatal() {
        let (store, destination) = setup();
        let key = EntityKey::new(CARS, "42");
        let batch = HashMap::from([(
            key.clone(),
            Entity::new(
                key.clone(),
                HashMap::from([(YEAR, HashSet::from([RawValue::from("nineteen")]))]),
            ),
        )]);
        let ids = ids_for(batch.keys());
        let err = destination
            .integrate_entities(&batch, &ids, &HashMap::new())
            .await
            .unwrap_err();
        match &err {
            ShuttleError::TypeMismatch {
                entity_set_id,
                entity_id,
                property_type_id,
                ..
            } => {
                assert_eq!(*entity_set_id, CARS);
                assert_eq!(entity_id, "42");
                assert_eq!(*property_type_id, YEAR);
            }
            other => panic!("unexpected error: {other}"),
        }
        assert!(err.is_fatal());
        assert_eq!(store.count_rows("data").unwrap(), 0);
    }

    #[tokio::test]
    async fn test_associations_write_edges() {
        let (store, destination) = setup();
        let src = EntityKey::new(PEOPLE, "ann");
        let dst = EntityKey::new(CARS, "42");
        let key = EntityKey::new(OWNS, "ann-42");
        let association = Association {
            key: key.clone(),
            src: src.clone(),
            dst: dst.clone(),
            properties: HashMap::from([(ID, HashSet::from([RawValue::from("ann-42")]))]),
        };
        let associations = HashMap::from([(key.clone(), association)]);
        let ids = ids_for([&src, &dst, &key]);

        let written = destination
            .integrate_associations(&associations, &ids, &HashMap::new())
            .await
            .unwrap();
        assert_eq!(written, 1);
        destination
            .integrate_associations(&associations, &ids, &HashMap::new())
            .await
            .unwrap();

        let edges = store.edges_from(PEOPLE, ids[&src]).unwrap();
        assert_eq!(edges.len(), 1);
        assert_eq!(edges[0].dst_id, ids[&dst]);
        assert_eq!(edges[0].edge_id, ids[&key]);
        assert_eq!(edges[0].versions.len(), 2);
        assert_eq!(
            store.entity_version(OWNS, ids[&key]).unwrap(),
            Some(edges[0].version)
        );
    }

    #[tokio::test]
    async fn test_missing_endpoint_id_is_resolution_error() {
        let (_store, destination) = setup();
        let key = EntityKey::new(OWNS, "x");
        let association = Association {
            key: key.clone(),
            src: EntityKey::new(PEOPLE, "ann"),
            dst: EntityKey::new(CARS, "42"),
            properties: HashMap::new(),
        };
        let ids = ids_for([&key]);
        let result = destination
            .integrate_associations(&HashMap::from([(key, association)]), &ids, &HashMap::new())
            .await;
        assert!(matches!(result, Err(ShuttleError::Resolution(_))));
    }
}
