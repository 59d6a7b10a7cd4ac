pub mod batch;
pub mod catalog;
pub mod coerce;
pub mod config;
pub mod destination;
pub mod errors;
pub mod extract;
pub mod integration;
pub mod mapping;
pub mod models;
pub mod notify;
pub mod plan;
pub mod resolver;
pub mod store;
pub mod utils;

use crate::catalog::EdmCatalog;
use crate::config::ShuttleConfig;
use crate::destination::{
    BlobDestination, DestinationRouter, FsObjectStore, IntegrationDestination, NoOpDestination,
    RelationalDestination, RemoteApiDestination,
};
use crate::errors::Result;
use crate::integration::IntegrationRunner;
use crate::mapping::MappingEngine;
use crate::models::{IntegrationReport, Row};
use crate::notify::{RunNotification, WebhookNotifier};
use crate::plan::ExtractionPlan;
use crate::resolver::{KeyResolver, StoreKeyResolver};
use crate::store::RelationalStore;
use std::sync::Arc;

/// The main entry point for the `fshuttle` library.
///
/// `Shuttle` wires a catalog snapshot to the storage back ends an extraction plan
/// can write to:
/// - a SQLite store (`RelationalStore`) holding versioned property values, edges,
///   the natural key map and the run log;
/// - a filesystem object store for binary values;
/// - an optional remote data API;
/// - a sink for properties routed to `none`.
///
/// # Example
///
/// ```rust,no_run
/// use fshuttle::{Shuttle, catalog::EdmCatalog, config::ShuttleConfig, plan::ExtractionPlan};
/// use tempfile::tempdir;
///
/// #[tokio::main]
/// async fn main() {
///     let dir = tempdir().unwrap();
///     let catalog = EdmCatalog::load("catalog.json").unwrap();
///     let plan = ExtractionPlan::load("cars.json").unwrap();
///     let shuttle = Shuttle::new(ShuttleConfig::new(dir.path()), catalog).await.unwrap();
///
///     let row = serde_json::json!({"id": "42", "color": "red"});
///     let rows = vec![Ok(row.as_object().unwrap().clone())];
///     let report = shuttle.integrate(&plan, rows).await.unwrap();
///     println!("{} entities written", report.total_entities());
/// }
/// ```
pub struct Shuttle {
    pub config: ShuttleConfig,
    pub catalog: Arc<EdmCatalog>,
    pub store: Arc<RelationalStore>,
    router: DestinationRouter,
    resolver: Arc<dyn KeyResolver>,
    notifier: Option<WebhookNotifier>,
}

impl Shuttle {
    /// Creates the blob directory, opens the relational store and registers one
    /// handler per destination. The remote API handler is only registered when
    /// `remote_api_url` is set.
    pub async fn new(config: ShuttleConfig, catalog: EdmCatalog) -> Result<Self> {
        let catalog = Arc::new(catalog);

        let store = Arc::new(RelationalStore::new(&config)?);
        store.initialize_schema()?;

        let objects = Arc::new(FsObjectStore::new(&config.blob_path).await?);

        let mut router = DestinationRouter::new();
        router.register(Arc::new(RelationalDestination::new(
            Arc::clone(&store),
            Arc::clone(&catalog),
        )?));
        router.register(Arc::new(BlobDestination::new(objects, config.blob_retry_delay)));
        if let Some(url) = &config.remote_api_url {
            router.register(Arc::new(RemoteApiDestination::new(
                url.clone(),
                config.remote_api_token.clone(),
            )));
        }
        router.register(Arc::new(NoOpDestination::default()));

        let resolver: Arc<dyn KeyResolver> = Arc::new(StoreKeyResolver::new(Arc::clone(&store)));
        let notifier = config.notification_url.clone().map(WebhookNotifier::new);

        Ok(Self {
            config,
            catalog,
            store,
            router,
            resolver,
            notifier,
        })
    }

    pub fn with_resolver(mut self, resolver: Arc<dyn KeyResolver>) -> Self {
        self.resolver = resolver;
        self
    }

    /// Registers an extra handler, replacing the built-in one for its destination.
    pub fn with_destination(mut self, handler: Arc<dyn IntegrationDestination>) -> Self {
        self.router.register(handler);
        self
    }

    /// Checks `plan` against the catalog and the registered destinations without
    /// reading any rows.
    pub fn validate(&self, plan: &ExtractionPlan) -> Result<()> {
        self.engine(plan).map(|_| ())
    }

    fn engine(&self, plan: &ExtractionPlan) -> Result<MappingEngine> {
        let engine = MappingEngine::new(plan, &self.catalog, self.config.default_destination)?;
        engine.ensure_routable(|destination| self.router.contains(destination))?;
        Ok(engine)
    }

    pub fn runner(&self, plan: &ExtractionPlan) -> Result<IntegrationRunner> {
        let engine = self.engine(plan)?;
        Ok(IntegrationRunner::new(
            Arc::new(engine),
            Arc::clone(&self.resolver),
            self.router.clone(),
        )
        .with_config(&self.config))
    }

    /// Runs `plan` over `rows`, recording the run in the `integration_runs` log and
    /// posting the outcome to the notification webhook if one is configured.
    pub async fn integrate<I>(&self, plan: &ExtractionPlan, rows: I) -> Result<IntegrationReport>
    where
        I: IntoIterator<Item = Result<Row>>,
    {
        let run_id = self.store.create_run_log(&plan.name)?;
        log::info!("Starting run {} of plan '{}'", run_id, plan.name);

        let result = match self.runner(plan) {
            Ok(runner) => runner.run(rows).await,
            Err(e) => Err(e),
        };

        match &result {
            Ok(report) => {
                let details = serde_json::to_string(report)?;
                self.store.update_run_status(run_id, "SUCCESS", &details)?;
            }
            Err(e) => {
                log::error!("Run {} of plan '{}' failed: {}", run_id, plan.name, e);
                if let Err(log_err) = self.store.update_run_status(run_id, "FAILED", &e.to_string()) {
                    log::warn!("Could not mark run {} as failed: {}", run_id, log_err);
                }
            }
        }

        if let Some(notifier) = &self.notifier {
            notifier
                .notify(&RunNotification::from_result(&plan.name, &result))
                .await;
        }
        result
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::errors::ShuttleError;
    use crate::models::{Association, Entity, EntityKey, StorageDestination, UpdateMode};
    use async_trait::async_trait;
    use std::collections::HashMap;
    use std::path::PathBuf;
    use tempfile::tempdir;
    use uuid::Uuid;

    /// Loses the run log table, then fails the write.
    struct BrokenStoreDestination {
        store: Arc<RelationalStore>,
    }

    #[async_trait]
    impl IntegrationDestination for BrokenStoreDestination {
        fn accepts(&self) -> StorageDestination {
            StorageDestination::Relational
        }

        async fn integrate_entities(
            &self,
            _entities: &HashMap<EntityKey, Entity>,
            _ids: &HashMap<EntityKey, Uuid>,
            _update_modes: &HashMap<Uuid, UpdateMode>,
        ) -> Result<usize> {
            self.store.conn()?.execute_batch("DROP TABLE integration_runs")?;
            Err(ShuttleError::RemoteApi("backend down".to_string()))
        }

        async fn integrate_associations(
            &self,
            _associations: &HashMap<EntityKey, Association>,
            _ids: &HashMap<EntityKey, Uuid>,
            _update_modes: &HashMap<Uuid, UpdateMode>,
        ) -> Result<usize> {
            Ok(0)
        }
    }

    fn fixture(name: &str) -> PathBuf {
        PathBuf::from(env!("CARGO_MANIFEST_DIR")).join("tests/fixtures").join(name)
    }

    #[tokio::test]
    async fn test_shuttle_initialization() {
        let dir = tempdir().unwrap();
        let config = ShuttleConfig::new(dir.path());

        let shuttle = Shuttle::new(config.clone(), EdmCatalog::default()).await;
        assert!(shuttle.is_ok());

        assert!(config.database_path.exists());
        assert!(config.blob_path.exists());
        let shuttle = shuttle.unwrap();
        assert_eq!(shuttle.store.count_rows("integration_runs").unwrap(), 0);
    }

    #[tokio::test]
    async fn test_failed_run_keeps_its_error_when_status_write_fails() {
        let dir = tempdir().unwrap();
        let catalog = EdmCatalog::load(fixture("catalog.json")).unwrap();
        let plan = ExtractionPlan::load(fixture("cars_plan.json")).unwrap();
        let shuttle = Shuttle::new(ShuttleConfig::new(dir.path()), catalog).await.unwrap();
        let broken = Arc::new(BrokenStoreDestination {
            store: Arc::clone(&shuttle.store),
        });
        let shuttle = shuttle.with_destination(broken);

        let row = serde_json::json!({"id": "42", "color": "red"});
        let rows = vec![Ok(row.as_object().cloned().unwrap_or_default())];
        let err = shuttle.integrate(&plan, rows).await.unwrap_err();

        assert!(matches!(err, ShuttleError::RemoteApi(ref msg) if msg == "backend down"));
    }
}
