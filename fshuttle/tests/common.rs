#![allow(dead_code)]

use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::Mutex;
use std::sync::atomic::{AtomicUsize, Ordering};

use async_trait::async_trait;
use fshuttle::{
    Shuttle,
    catalog::EdmCatalog,
    config::ShuttleConfig,
    destination::IntegrationDestination,
    errors::Result as ShuttleResult,
    models::{Association, Entity, EntityKey, Row, StorageDestination, UpdateMode},
    plan::ExtractionPlan,
    resolver::{KeyResolver, StableKeyResolver},
};
use tempfile::TempDir;
use uuid::Uuid;

pub const CARS: Uuid = Uuid::from_u128(0xa);
pub const PEOPLE: Uuid = Uuid::from_u128(0xb);
pub const OWNS: Uuid = Uuid::from_u128(0xc);
pub const GENERAL_ID: Uuid = Uuid::from_u128(1);
pub const COLOR: Uuid = Uuid::from_u128(2);
pub const YEAR: Uuid = Uuid::from_u128(3);
pub const PHOTO: Uuid = Uuid::from_u128(4);

pub struct TestContext {
    pub temp_dir: TempDir,
    pub config: ShuttleConfig,
    pub shuttle: Shuttle,
    pub plan: ExtractionPlan,
}

pub fn fixture_path(name: &str) -> PathBuf {
    Path::new(env!("CARGO_MANIFEST_DIR"))
        .join("tests")
        .join("fixtures")
        .join(name)
}

pub fn load_catalog() -> anyhow::Result<EdmCatalog> {
    Ok(EdmCatalog::load(fixture_path("catalog.json"))?)
}

pub fn load_plan() -> anyhow::Result<ExtractionPlan> {
    Ok(ExtractionPlan::load(fixture_path("cars_plan.json"))?)
}

pub async fn init_test_context() -> anyhow::Result<TestContext> {
    init_test_context_with(|config| config).await
}

pub async fn init_test_context_with(
    configure: impl FnOnce(ShuttleConfig) -> ShuttleConfig,
) -> anyhow::Result<TestContext> {
    let _ = env_logger::builder().is_test(true).try_init();
    let temp_dir = tempfile::tempdir()?;
    let config = configure(ShuttleConfig::new(temp_dir.path()));
    let shuttle = Shuttle::new(config.clone(), load_catalog()?).await?;

    Ok(TestContext {
        temp_dir,
        config,
        shuttle,
        plan: load_plan()?,
    })
}

pub fn rows(values: Vec<serde_json::Value>) -> Vec<ShuttleResult<Row>> {
    values
        .into_iter()
        .map(|value| Ok(value.as_object().cloned().unwrap_or_default()))
        .collect()
}

/// Surrogate id the store assigned to a natural key.
pub fn surrogate(shuttle: &Shuttle, entity_set_id: Uuid, entity_id: &str) -> anyhow::Result<Uuid> {
    let key = EntityKey::new(entity_set_id, entity_id);
    let ids = shuttle.store.resolve_ids(&HashSet::from([key.clone()]))?;
    ids.get(&key)
        .copied()
        .ok_or_else(|| anyhow::anyhow!("no id for {key}"))
}

/// Records what every flush handed to one destination.
pub struct RecordingDestination {
    destination: StorageDestination,
    pub entity_flushes: Mutex<Vec<HashMap<EntityKey, Entity>>>,
    pub association_flushes: Mutex<Vec<HashMap<EntityKey, Association>>>,
}

impl RecordingDestination {
    pub fn new(destination: StorageDestination) -> Arc<Self> {
        Arc::new(Self {
            destination,
            entity_flushes: Mutex::new(Vec::new()),
            association_flushes: Mutex::new(Vec::new()),
        })
    }

    pub fn entity_counts(&self) -> Vec<usize> {
        self.entity_flushes
            .lock()
            .unwrap()
            .iter()
            .map(HashMap::len)
            .collect()
    }
}

#[async_trait]
impl IntegrationDestination for RecordingDestination {
    fn accepts(&self) -> StorageDestination {
        self.destination
    }

    async fn integrate_entities(
        &self,
        entities: &HashMap<EntityKey, Entity>,
        _ids: &HashMap<EntityKey, Uuid>,
        _update_modes: &HashMap<Uuid, UpdateMode>,
    ) -> ShuttleResult<usize> {
        self.entity_flushes.lock().unwrap().push(entities.clone());
        Ok(entities.len())
    }

    async fn integrate_associations(
        &self,
        associations: &HashMap<EntityKey, Association>,
        _ids: &HashMap<EntityKey, Uuid>,
        _update_modes: &HashMap<Uuid, UpdateMode>,
    ) -> ShuttleResult<usize> {
        self.association_flushes
            .lock()
            .unwrap()
            .push(associations.clone());
        Ok(associations.len())
    }
}

/// Stable resolver that counts how often it is called.
#[derive(Default)]
pub struct CountingResolver {
    pub calls: AtomicUsize,
}

impl CountingResolver {
    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl KeyResolver for CountingResolver {
    async fn resolve(&self, keys: &HashSet<EntityKey>) -> ShuttleResult<HashMap<EntityKey, Uuid>> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        StableKeyResolver.resolve(keys).await
    }
}

/// Text values of a stored property, sorted.
pub fn texts(values: Vec<rusqlite::types::Value>) -> Vec<String> {
    let mut texts: Vec<String> = values
        .into_iter()
        .filter_map(|value| match value {
            rusqlite::types::Value::Text(text) => Some(text),
            _ => None,
        })
        .collect();
    texts.sort();
    texts
}
