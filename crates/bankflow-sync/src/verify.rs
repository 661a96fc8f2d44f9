use anyhow::{Context, Result};
use bankflow_core::{Entity, SyncStatus};
use bankflow_storage::{ProductionStore, TransformedStore};
use tracing::{info, warn};

/// Compares transformed and production row counts per entity. Reports only; never repairs.
pub async fn verify_counts(
    transformed: &TransformedStore,
    production: &ProductionStore,
) -> Result<Vec<SyncStatus>> {
    let mut statuses = Vec::with_capacity(Entity::LOAD_ORDER.len());
    for entity in Entity::LOAD_ORDER {
        let transformed_count = transformed
            .count(entity)
            .await
            .with_context(|| format!("counting transformed {entity}"))?;
        let production_count = production
            .count(entity)
            .await
            .with_context(|| format!("counting production {entity}"))?;
        let status = SyncStatus::new(entity, transformed_count, production_count);
        if status.synchronized {
            info!(entity = %entity, rows = production_count, "in sync");
        } else {
            warn!(
                entity = %entity,
                transformed = transformed_count,
                production = production_count,
                "row counts differ"
            );
        }
        statuses.push(status);
    }
    Ok(statuses)
}

#[cfg(test)]
mod tests {
    use super::*;
    use bankflow_core::{TransformedRow, Value};
    use bankflow_storage::Stores;

    fn branch(id: &str) -> TransformedRow {
        let mut values = vec![Value::text(id)];
        values.resize(Entity::Branch.schema().columns.len(), Value::Null);
        TransformedRow::new(Entity::Branch, values)
    }

    #[tokio::test]
    async fn unloaded_rows_are_reported_not_repaired() {
        let stores = Stores::in_memory().await.expect("stores");
        stores
            .transformed
            .upsert_batch(Entity::Branch, &[branch("BR01"), branch("BR02")])
            .await
            .expect("upsert");

        let statuses = verify_counts(&stores.transformed, &stores.production)
            .await
            .expect("verify");
        assert_eq!(statuses.len(), 4);
        assert_eq!(statuses[0], SyncStatus::new(Entity::Branch, 2, 0));
        assert!(!statuses[0].synchronized);
        assert!(statuses[1..].iter().all(|s| s.synchronized));
        assert_eq!(stores.production.count(Entity::Branch).await.expect("count"), 0);
    }
}
