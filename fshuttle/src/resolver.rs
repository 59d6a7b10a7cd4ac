use crate::errors::{Result, ShuttleError};
use crate::models::EntityKey;
use crate::store::RelationalStore;
use crate::utils::id::stable_entity_id;
use async_trait::async_trait;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use uuid::Uuid;

/// Maps natural keys to surrogate ids. Called once per flush with every key the
/// flush references; must resolve all of them or fail.
#[async_trait]
pub trait KeyResolver: Send + Sync {
    async fn resolve(&self, keys: &HashSet<EntityKey>) -> Result<HashMap<EntityKey, Uuid>>;
}

/// Fails unless `resolved` covers every key in `keys`.
pub fn ensure_resolved(
    keys: &HashSet<EntityKey>,
    resolved: &HashMap<EntityKey, Uuid>,
) -> Result<()> {
    let missing: Vec<&EntityKey> = keys.iter().filter(|k| !resolved.contains_key(*k)).collect();
    if missing.is_empty() {
        return Ok(());
    }
    let sample: Vec<String> = missing.iter().take(5).map(|k| k.to_string()).collect();
    Err(ShuttleError::Resolution(format!(
        "{} of {} keys unresolved (e.g. {})",
        missing.len(),
        keys.len(),
        sample.join(", ")
    )))
}

/// Persists the key map in the relational store so ids survive across runs.
pub struct StoreKeyResolver {
    store: Arc<RelationalStore>,
}

impl StoreKeyResolver {
    pub fn new(store: Arc<RelationalStore>) -> Self {
        Self { store }
    }
}

#[async_trait]
impl KeyResolver for StoreKeyResolver {
    async fn resolve(&self, keys: &HashSet<EntityKey>) -> Result<HashMap<EntityKey, Uuid>> {
        let resolved = self.store.resolve_ids(keys)?;
        ensure_resolved(keys, &resolved)?;
        log::debug!("Resolved {} natural keys", resolved.len());
        Ok(resolved)
    }
}

/// Derives ids from the keys themselves (UUID v5); needs no storage.
pub struct StableKeyResolver;

#[async_trait]
impl KeyResolver for StableKeyResolver {
    async fn resolve(&self, keys: &HashSet<EntityKey>) -> Result<HashMap<EntityKey, Uuid>> {
        Ok(keys
            .iter()
            .map(|key| (key.clone(), stable_entity_id(key)))
            .collect())
    }
}
