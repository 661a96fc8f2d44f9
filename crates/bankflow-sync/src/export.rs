//! Per-entity CSV exports of the transformed store for downstream reporting.

use std::path::{Path, PathBuf};

use anyhow::{anyhow, Context, Result};
use bankflow_core::{Entity, SURROGATE_KEY};
use bankflow_storage::{write_atomic, TransformedStore};
use serde::Serialize;
use tracing::info;

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ExportedFile {
    pub entity: Entity,
    pub path: PathBuf,
    pub rows: u64,
}

pub fn export_path(dir: &Path, entity: Entity) -> PathBuf {
    dir.join(format!("transformed_{}.csv", entity.name()))
}

/// Writes `transformed_<entity>.csv` with every missing cell as `NA`. The previous file is
/// replaced only once the new one is complete.
pub async fn export_entity(
    transformed: &TransformedStore,
    entity: Entity,
    dir: &Path,
    page_size: usize,
) -> Result<ExportedFile> {
    let schema = entity.schema();
    let mut writer = csv::Writer::from_writer(Vec::new());
    let mut header = vec![SURROGATE_KEY];
    header.extend(schema.column_names());
    writer.write_record(&header).context("writing export header")?;

    let mut rows = 0u64;
    let mut after = 0i64;
    loop {
        let page = transformed
            .fetch_after(entity, after, page_size.max(1))
            .await
            .with_context(|| format!("reading transformed {entity}"))?;
        let Some(last) = page.last().and_then(|row| row.row_id) else {
            break;
        };
        for row in &page {
            let mut record = Vec::with_capacity(row.values.len() + 1);
            record.push(row.row_id.map(|id| id.to_string()).unwrap_or_default());
            record.extend(row.values.iter().map(|v| v.to_export_string()));
            writer.write_record(&record).context("writing export row")?;
            rows += 1;
        }
        after = last;
    }

    let bytes = writer
        .into_inner()
        .map_err(|err| anyhow!("flushing {entity} export: {}", err.error()))?;
    let path = export_path(dir, entity);
    write_atomic(&path, &bytes)
        .await
        .with_context(|| format!("writing {}", path.display()))?;
    info!(entity = %entity, rows, file = %path.display(), "export written");
    Ok(ExportedFile { entity, path, rows })
}

pub async fn export_all(
    transformed: &TransformedStore,
    dir: &Path,
    page_size: usize,
) -> Result<Vec<ExportedFile>> {
    let mut files = Vec::with_capacity(Entity::LOAD_ORDER.len());
    for entity in Entity::LOAD_ORDER {
        files.push(export_entity(transformed, entity, dir, page_size).await?);
    }
    Ok(files)
}

#[cfg(test)]
mod tests {
    use super::*;
    use bankflow_core::{TransformedRow, Value};
    use bankflow_storage::Stores;
    use tempfile::tempdir;

    #[tokio::test]
    async fn missing_cells_are_exported_as_na() {
        let stores = Stores::in_memory().await.expect("stores");
        let width = Entity::Branch.schema().columns.len();
        let rows: Vec<TransformedRow> = ["BR01", "BR02", "BR03"]
            .into_iter()
            .map(|id| {
                let mut values = vec![Value::text(id)];
                values.resize(width, Value::Null);
                TransformedRow::new(Entity::Branch, values)
            })
            .collect();
        stores
            .transformed
            .upsert_batch(Entity::Branch, &rows)
            .await
            .expect("upsert");

        let dir = tempdir().expect("tempdir");
        let file = export_entity(&stores.transformed, Entity::Branch, dir.path(), 2)
            .await
            .expect("export");
        assert_eq!(file.rows, 3);
        assert!(file.path.ends_with("transformed_branches.csv"));

        let body = std::fs::read_to_string(&file.path).expect("read");
        let mut lines = body.lines();
        assert!(lines.next().expect("header").starts_with("row_id,branch_id"));
        let first = lines.next().expect("row");
        assert!(first.contains(",BR01,"));
        assert!(first.ends_with(",NA"));
        assert_eq!(body.lines().count(), 4);
    }
}
