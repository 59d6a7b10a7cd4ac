use crate::models::StorageDestination;
use serde::Deserialize;
use std::path::PathBuf;
use std::time::Duration;
use url::Url;

pub const DEFAULT_UPLOAD_BATCH_SIZE: usize = 10_000;

#[derive(Deserialize, Debug, Clone)]
pub struct ShuttleConfig {
    pub database_path: PathBuf,
    pub blob_path: PathBuf,
    /// A destination flushes once its pending entities or associations exceed this count.
    #[serde(default = "default_upload_batch_size")]
    pub upload_batch_size: usize,
    #[serde(default = "default_parallelism")]
    pub parallelism: usize,
    /// Where non-binary properties land when the plan does not say otherwise.
    #[serde(default = "default_destination")]
    pub default_destination: StorageDestination,
    #[serde(default)]
    pub remote_api_url: Option<Url>,
    #[serde(default)]
    pub remote_api_token: Option<String>,
    #[serde(default)]
    pub notification_url: Option<Url>,
    #[serde(default = "default_blob_retry_delay", with = "millis")]
    pub blob_retry_delay: Duration,
}

impl ShuttleConfig {
    pub fn new(base_path: impl Into<PathBuf>) -> Self {
        let base_path = base_path.into();
        Self {
            database_path: base_path.join("shuttle.sqlite"),
            blob_path: base_path.join("blobs"),
            upload_batch_size: default_upload_batch_size(),
            parallelism: default_parallelism(),
            default_destination: default_destination(),
            remote_api_url: None,
            remote_api_token: None,
            notification_url: None,
            blob_retry_delay: default_blob_retry_delay(),
        }
    }

    pub fn with_upload_batch_size(mut self, size: usize) -> Self {
        self.upload_batch_size = size;
        self
    }

    pub fn with_parallelism(mut self, parallelism: usize) -> Self {
        self.parallelism = parallelism.max(1);
        self
    }
}

fn default_upload_batch_size() -> usize {
    DEFAULT_UPLOAD_BATCH_SIZE
}

fn default_parallelism() -> usize {
    std::thread::available_parallelism()
        .map(|n| n.get())
        .unwrap_or(1)
}

fn default_destination() -> StorageDestination {
    StorageDestination::Relational
}

fn default_blob_retry_delay() -> Duration {
    Duration::from_millis(500)
}

mod millis {
    use serde::{Deserialize, Deserializer};
    use std::time::Duration;

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        u64::deserialize(deserializer).map(Duration::from_millis)
    }
}
