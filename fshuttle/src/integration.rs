//! Drives a run: rows are mapped on blocking workers, folded in row order into
//! one accumulator, and flushed whenever a destination grows past the batch size.

use crate::batch::AddressedBatch;
use crate::config::{DEFAULT_UPLOAD_BATCH_SIZE, ShuttleConfig};
use crate::destination::DestinationRouter;
use crate::errors::{Result, ShuttleError};
use crate::mapping::MappingEngine;
use crate::models::{IntegrationReport, Row};
use crate::resolver::{KeyResolver, ensure_resolved};
use std::sync::Arc;

/// Rows handed to one worker per round.
const ROWS_PER_WORKER: usize = 256;

pub struct IntegrationRunner {
    engine: Arc<MappingEngine>,
    resolver: Arc<dyn KeyResolver>,
    router: DestinationRouter,
    upload_batch_size: usize,
    parallelism: usize,
}

impl IntegrationRunner {
    pub fn new(
        engine: Arc<MappingEngine>,
        resolver: Arc<dyn KeyResolver>,
        router: DestinationRouter,
    ) -> Self {
        Self {
            engine,
            resolver,
            router,
            upload_batch_size: DEFAULT_UPLOAD_BATCH_SIZE,
            parallelism: 1,
        }
    }

    pub fn with_config(self, config: &ShuttleConfig) -> Self {
        self.with_upload_batch_size(config.upload_batch_size)
            .with_parallelism(config.parallelism)
    }

    pub fn with_upload_batch_size(mut self, size: usize) -> Self {
        self.upload_batch_size = size;
        self
    }

    pub fn with_parallelism(mut self, parallelism: usize) -> Self {
        self.parallelism = parallelism.max(1);
        self
    }

    /// Consumes `rows` and integrates everything they map to.
    ///
    /// The first error, whether from the source, a mapping worker, the resolver or
    /// a destination, ends the run. Records flushed before the error stay written.
    pub async fn run<I>(&self, rows: I) -> Result<IntegrationReport>
    where
        I: IntoIterator<Item = Result<Row>>,
    {
        let mut report = IntegrationReport {
            plan: self.engine.plan_name().to_string(),
            ..Default::default()
        };
        let mut pending = AddressedBatch::new();
        let mut rows = rows.into_iter();
        let round_size = self.parallelism * ROWS_PER_WORKER;

        loop {
            let mut round = Vec::with_capacity(round_size);
            for row in rows.by_ref().take(round_size) {
                round.push((report.rows_read, row?));
                report.rows_read += 1;
            }
            if round.is_empty() {
                break;
            }

            for fragment in self.map_round(round).await? {
                pending.merge(fragment);
                if pending.exceeds(self.upload_batch_size) {
                    self.flush(&mut pending, &mut report).await?;
                }
            }
        }

        self.flush(&mut pending, &mut report).await?;
        log::info!(
            "Plan '{}' finished: {} rows, {} flushes, {} entities, {} associations",
            report.plan,
            report.rows_read,
            report.flushes,
            report.total_entities(),
            report.total_associations()
        );
        Ok(report)
    }

    /// Maps a round of rows on up to `parallelism` blocking workers and returns the
    /// fragments in row order.
    async fn map_round(&self, round: Vec<(u64, Row)>) -> Result<Vec<AddressedBatch>> {
        let chunk_size = round.len().div_ceil(self.parallelism).max(1);
        let mut chunks = Vec::new();
        let mut round = round.into_iter().peekable();
        while round.peek().is_some() {
            chunks.push(round.by_ref().take(chunk_size).collect::<Vec<_>>());
        }

        let handles: Vec<_> = chunks
            .into_iter()
            .map(|chunk| {
                let engine = Arc::clone(&self.engine);
                tokio::task::spawn_blocking(move || {
                    chunk
                        .iter()
                        .map(|(index, row)| engine.map_row(*index, row))
                        .collect::<Result<Vec<_>>>()
                })
            })
            .collect();

        let mut fragments = Vec::new();
        for handle in handles {
            let mapped = handle
                .await
                .map_err(|e| ShuttleError::Other(anyhow::anyhow!("mapping worker failed: {e}")))?;
            fragments.extend(mapped?);
        }
        Ok(fragments)
    }

    /// Swaps the accumulator out, resolves every key it references in one call and
    /// hands each destination its share, entities first.
    async fn flush(&self, pending: &mut AddressedBatch, report: &mut IntegrationReport) -> Result<()> {
        let batch = std::mem::take(pending);
        if batch.is_empty() {
            return Ok(());
        }

        let keys = batch.natural_keys();
        let mut batches: Vec<_> = batch
            .into_batches()
            .into_iter()
            .filter(|(_, staged)| !staged.is_empty())
            .collect();
        batches.sort_by_key(|(destination, _)| *destination);
        let handlers = batches
            .iter()
            .map(|(destination, _)| self.router.get(*destination))
            .collect::<Result<Vec<_>>>()?;

        let ids = self.resolver.resolve(&keys).await?;
        ensure_resolved(&keys, &ids)?;

        let update_modes = self.engine.update_modes();
        for ((destination, staged), handler) in batches.iter().zip(handlers) {
            let entities = handler
                .integrate_entities(&staged.entities, &ids, update_modes)
                .await?;
            let associations = handler
                .integrate_associations(&staged.associations, &ids, update_modes)
                .await?;
            let counts = report.destinations.entry(*destination).or_default();
            counts.entities += entities;
            counts.associations += associations;
            log::debug!(
                "Flushed {} entities and {} associations to '{}'",
                entities,
                associations,
                destination
            );
        }
        report.flushes += 1;
        log::info!("Flush {} resolved {} keys", report.flushes, keys.len());
        Ok(())
    }
}
