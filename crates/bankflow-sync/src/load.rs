//! Incremental loader: appends transformed rows beyond the watermark into production.

use std::collections::BTreeMap;

use anyhow::{Context, Result};
use bankflow_core::{Entity, TransformedRow};
use bankflow_storage::{ProductionStore, TransformedStore, Watermark};
use serde::Serialize;
use tracing::{error, info, info_span, warn, Instrument};

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct EntityLoad {
    /// Transformed rows beyond the watermark when the entity started loading.
    pub delta: u64,
    pub inserted: u64,
    /// Rows whose key production already held.
    pub skipped: u64,
    pub batches: u64,
    pub failed: bool,
    /// Parent entity whose failure kept this entity from loading.
    pub blocked_by: Option<Entity>,
    pub post_load_count: u64,
    /// Watermark caught up with the transformed store and nothing failed.
    pub synchronized: bool,
    pub watermark: Watermark,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct LoadReport {
    pub entities: BTreeMap<Entity, EntityLoad>,
}

impl LoadReport {
    pub fn total_inserted(&self) -> u64 {
        self.entities.values().map(|l| l.inserted).sum()
    }

    /// `(post_load_count, synchronized)`
    pub fn status(&self, entity: Entity) -> (u64, bool) {
        self.entities
            .get(&entity)
            .map(|l| (l.post_load_count, l.synchronized))
            .unwrap_or((0, false))
    }

    fn parent_failed(&self, entity: Entity) -> Option<Entity> {
        let parent = entity.schema().foreign_key?.parent;
        self.entities
            .get(&parent)
            .filter(|l| l.failed || l.blocked_by.is_some())
            .map(|_| parent)
    }
}

/// Matches each cell to its production column type.
fn to_production_row(mut row: TransformedRow) -> TransformedRow {
    let columns = row.entity.schema().columns;
    row.values = row
        .values
        .into_iter()
        .zip(columns)
        .map(|(value, column)| value.coerce(column.ty))
        .collect();
    row
}

pub struct IncrementalLoader<'a> {
    transformed: &'a TransformedStore,
    production: &'a ProductionStore,
    batch_size: usize,
}

impl<'a> IncrementalLoader<'a> {
    pub fn new(
        transformed: &'a TransformedStore,
        production: &'a ProductionStore,
        batch_size: usize,
    ) -> Self {
        Self {
            transformed,
            production,
            batch_size: batch_size.max(1),
        }
    }

    /// Loads every entity in dependency order. A failed parent blocks its children for this run.
    pub async fn load_all(&self, report: &mut LoadReport) -> Result<()> {
        for entity in Entity::LOAD_ORDER {
            if let Some(parent) = report.parent_failed(entity) {
                warn!(entity = %entity, parent = %parent, "parent load failed; skipping entity");
                let mut blocked = EntityLoad {
                    blocked_by: Some(parent),
                    ..EntityLoad::default()
                };
                blocked.watermark = self.production.watermark(entity).await?;
                blocked.post_load_count = self.production.count(entity).await?;
                report.entities.insert(entity, blocked);
                continue;
            }
            let load = self
                .load_entity(entity)
                .instrument(info_span!("load", entity = %entity))
                .await
                .with_context(|| format!("loading {entity}"))?;
            if load.failed && !entity.children().is_empty() {
                warn!(
                    entity = %entity,
                    children = ?entity.children(),
                    "dependent entities skipped this run"
                );
            }
            report.entities.insert(entity, load);
        }
        Ok(())
    }

    pub async fn load_entity(&self, entity: Entity) -> Result<EntityLoad> {
        let mut load = EntityLoad {
            watermark: self.production.watermark(entity).await?,
            ..EntityLoad::default()
        };
        load.delta = self
            .transformed
            .count_after(entity, load.watermark.last_row_id)
            .await?;

        if load.delta == 0 {
            load.post_load_count = self.production.count(entity).await?;
            load.synchronized = true;
            info!(rows = load.post_load_count, "already synchronized");
            return Ok(load);
        }

        let mut remaining = load.delta;
        while remaining > 0 {
            let limit = remaining.min(self.batch_size as u64) as usize;
            let rows = self
                .transformed
                .fetch_after(entity, load.watermark.last_row_id, limit)
                .await?;
            if rows.is_empty() {
                break;
            }
            let fetched = rows.len() as u64;
            let rows: Vec<TransformedRow> = rows.into_iter().map(to_production_row).collect();

            match self.production.append_batch(entity, &rows).await {
                Ok(outcome) => {
                    load.inserted += outcome.inserted;
                    load.skipped += outcome.skipped;
                    load.batches += 1;
                    load.watermark = outcome.watermark;
                }
                Err(err) if err.is_connectivity() => return Err(err.into()),
                Err(err) => {
                    error!(
                        rows = rows.len(),
                        after_row_id = load.watermark.last_row_id,
                        error = %err,
                        "load batch rolled back; watermark unchanged"
                    );
                    load.failed = true;
                    break;
                }
            }
            remaining = remaining.saturating_sub(fetched);
        }

        load.post_load_count = self.production.count(entity).await?;
        let pending = self
            .transformed
            .count_after(entity, load.watermark.last_row_id)
            .await?;
        load.synchronized = !load.failed && pending == 0;
        info!(
            delta = load.delta,
            inserted = load.inserted,
            skipped = load.skipped,
            last_row_id = load.watermark.last_row_id,
            "entity loaded"
        );
        Ok(load)
    }
}
