use super::{IntegrationDestination, surrogate_id};
use crate::coerce::to_bytes;
use crate::errors::Result;
use crate::models::{
    Association, Entity, EntityKey, PropertyValues, RawValue, StorageDestination, UpdateMode,
};
use crate::utils::id::value_hash;
use async_trait::async_trait;
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::AsyncWriteExt;
use uuid::Uuid;

/// Minimal write interface of an object store.
#[async_trait]
pub trait ObjectStore: Send + Sync {
    async fn put(&self, path: &str, bytes: &[u8]) -> Result<()>;
}

/// Object store rooted in a local directory.
pub struct FsObjectStore {
    root: PathBuf,
}

impl FsObjectStore {
    pub async fn new(root: impl Into<PathBuf>) -> Result<Self> {
        let root = root.into();
        tokio::fs::create_dir_all(&root).await?;
        Ok(Self { root })
    }
}

#[async_trait]
impl ObjectStore for FsObjectStore {
    async fn put(&self, path: &str, bytes: &[u8]) -> Result<()> {
        let full_path = self.root.join(path);
        if let Some(parent) = full_path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }

        let mut file = tokio::fs::File::create(full_path).await?;
        file.write_all(bytes).await?;
        file.flush().await?;
        Ok(())
    }
}

/// Writes binary property values as content-addressed objects at
/// `<entity set>/<entity id>/<property type>/<hash>`.
///
/// Store failures that `is_retryable` are retried forever after a fixed delay;
/// a value that cannot be turned into bytes fails the flush immediately.
pub struct BlobDestination {
    store: Arc<dyn ObjectStore>,
    retry_delay: Duration,
}

impl BlobDestination {
    pub fn new(store: Arc<dyn ObjectStore>, retry_delay: Duration) -> Self {
        Self { store, retry_delay }
    }

    pub fn object_path(entity_set_id: Uuid, id: Uuid, property_type_id: Uuid, bytes: &[u8]) -> String {
        // 内容寻址：同一值总是落在同一路径
        let hash = Uuid::from_bytes(value_hash(&RawValue::Binary(bytes.to_vec())));
        format!(
            "{}/{}/{}/{}",
            entity_set_id,
            id,
            property_type_id,
            hash.simple()
        )
    }

    async fn put_with_retry(&self, path: &str, bytes: &[u8]) -> Result<()> {
        let mut attempt: u32 = 0;
        loop {
            attempt += 1;
            match self.store.put(path, bytes).await {
                Ok(()) => return Ok(()),
                Err(e) if e.is_retryable() => {
                    log::warn!(
                        "Blob write to '{}' failed (attempt {}): {}. Retrying in {:?}",
                        path,
                        attempt,
                        e,
                        self.retry_delay
                    );
                    tokio::time::sleep(self.retry_delay).await;
                }
                Err(e) => return Err(e),
            }
        }
    }

    /// Converts every value to bytes before the first store call.
    fn objects(
        key: &EntityKey,
        id: Uuid,
        properties: &PropertyValues,
    ) -> Result<Vec<(String, Vec<u8>)>> {
        let mut objects = Vec::new();
        for (property_type_id, values) in properties {
            for value in values {
                let bytes = to_bytes(*property_type_id, value).map_err(|e| e.for_entity(key))?;
                let path = Self::object_path(key.entity_set_id, id, *property_type_id, &bytes);
                objects.push((path, bytes));
            }
        }
        Ok(objects)
    }

    async fn write_records<'a>(
        &self,
        records: impl Iterator<Item = (&'a EntityKey, &'a PropertyValues)>,
        ids: &HashMap<EntityKey, Uuid>,
    ) -> Result<usize> {
        let mut objects = Vec::new();
        let mut count = 0;
        for (key, properties) in records {
            let id = surrogate_id(ids, key)?;
            objects.extend(Self::objects(key, id, properties)?);
            count += 1;
        }
        for (path, bytes) in &objects {
            self.put_with_retry(path, bytes).await?;
        }
        log::info!("Blob: stored {} objects for {} records", objects.len(), count);
        Ok(count)
    }
}

#[async_trait]
impl IntegrationDestination for BlobDestination {
    fn accepts(&self) -> StorageDestination {
        StorageDestination::Blob
    }

    async fn integrate_entities(
        &self,
        entities: &HashMap<EntityKey, Entity>,
        ids: &HashMap<EntityKey, Uuid>,
        _update_modes: &HashMap<Uuid, UpdateMode>,
    ) -> Result<usize> {
        if entities.is_empty() {
            return Ok(0);
        }
        self.write_records(entities.iter().map(|(k, e)| (k, &e.properties)), ids)
            .await
    }

    async fn integrate_associations(
        &self,
        associations: &HashMap<EntityKey, Association>,
        ids: &HashMap<EntityKey, Uuid>,
        _update_modes: &HashMap<Uuid, UpdateMode>,
    ) -> Result<usize> {
        if associations.is_empty() {
            return Ok(0);
        }
        self.write_records(associations.iter().map(|(k, a)| (k, &a.properties)), ids)
            .await
    }
}
