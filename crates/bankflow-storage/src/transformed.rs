//! Transformed store: cleaned rows with a surrogate `row_id` that only ever grows.

use std::collections::HashSet;

use bankflow_core::{ColumnType, Entity, TransformedRow, SURROGATE_KEY};
use sqlx::sqlite::SqlitePool;
use sqlx::Row;

use crate::values::{bind_value, decode_value, placeholders};
use crate::{ddl, execute_all, StoreResult};

#[derive(Debug, Clone)]
pub struct TransformedStore {
    pool: SqlitePool,
}

impl TransformedStore {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    pub async fn init_schema(&self) -> StoreResult<()> {
        execute_all(&self.pool, &ddl::transformed_tables()).await
    }

    /// Upserts by business key in one transaction. An existing row keeps its `row_id`.
    pub async fn upsert_batch(&self, entity: Entity, rows: &[TransformedRow]) -> StoreResult<()> {
        if rows.is_empty() {
            return Ok(());
        }
        let schema = entity.schema();
        let names: Vec<&str> = schema.column_names().collect();
        let updates: Vec<String> = names
            .iter()
            .filter(|c| **c != schema.primary_key)
            .map(|c| format!("{c} = excluded.{c}"))
            .collect();
        let sql = format!(
            "INSERT INTO {table} ({cols}) VALUES ({params}) \
             ON CONFLICT({key}) DO UPDATE SET {updates}",
            table = entity.transformed_table(),
            cols = names.join(", "),
            params = placeholders(names.len()),
            key = schema.primary_key,
            updates = updates.join(", "),
        );

        let mut tx = self.pool.begin().await?;
        for row in rows {
            let mut query = sqlx::query(&sql);
            for value in &row.values {
                query = bind_value(query, value);
            }
            query.execute(&mut *tx).await?;
        }
        tx.commit().await?;
        Ok(())
    }

    pub async fn primary_keys(&self, entity: Entity) -> StoreResult<HashSet<String>> {
        let sql = format!(
            "SELECT {} FROM {}",
            entity.schema().primary_key,
            entity.transformed_table()
        );
        let rows = sqlx::query(&sql).fetch_all(&self.pool).await?;
        let keys = rows
            .iter()
            .map(|row| row.try_get::<String, _>(0))
            .collect::<Result<HashSet<_>, _>>()?;
        Ok(keys)
    }

    pub async fn count(&self, entity: Entity) -> StoreResult<u64> {
        let sql = format!("SELECT COUNT(*) FROM {}", entity.transformed_table());
        let count: i64 = sqlx::query_scalar(&sql).fetch_one(&self.pool).await?;
        Ok(count.max(0) as u64)
    }

    /// Rows with a surrogate key beyond `row_id`.
    pub async fn count_after(&self, entity: Entity, row_id: i64) -> StoreResult<u64> {
        let sql = format!(
            "SELECT COUNT(*) FROM {} WHERE {SURROGATE_KEY} > ?",
            entity.transformed_table()
        );
        let count: i64 = sqlx::query_scalar(&sql)
            .bind(row_id)
            .fetch_one(&self.pool)
            .await?;
        Ok(count.max(0) as u64)
    }

    /// Up to `limit` rows with `row_id` greater than `after_row_id`, in surrogate-key order.
    pub async fn fetch_after(
        &self,
        entity: Entity,
        after_row_id: i64,
        limit: usize,
    ) -> StoreResult<Vec<TransformedRow>> {
        let schema = entity.schema();
        let table = entity.transformed_table();
        let sql = format!(
            "SELECT {SURROGATE_KEY}, {cols} FROM {table} WHERE {SURROGATE_KEY} > ? \
             ORDER BY {SURROGATE_KEY} LIMIT ?",
            cols = schema.column_names().collect::<Vec<_>>().join(", "),
        );
        let rows = sqlx::query(&sql)
            .bind(after_row_id)
            .bind(limit as i64)
            .fetch_all(&self.pool)
            .await?;

        let mut out = Vec::with_capacity(rows.len());
        for row in &rows {
            let mut values = Vec::with_capacity(schema.columns.len());
            for column in schema.columns {
                values.push(decode_value(row, &table, column.name, column.ty)?);
            }
            let mut transformed = TransformedRow::new(entity, values);
            transformed.row_id = Some(row.try_get::<i64, _>(SURROGATE_KEY)?);
            out.push(transformed);
        }
        Ok(out)
    }

    /// Deletes every row. Surrogate keys are not reused afterwards.
    pub async fn clear(&self, entity: Entity) -> StoreResult<u64> {
        let sql = format!("DELETE FROM {}", entity.transformed_table());
        let result = sqlx::query(&sql).execute(&self.pool).await?;
        Ok(result.rows_affected())
    }

    /// `(missing, total)` over every column cell; missing means NULL or the `NA` sentinel.
    pub async fn missing_cells(&self, entity: Entity) -> StoreResult<(u64, u64)> {
        let schema = entity.schema();
        let missing_terms: Vec<String> = schema
            .columns
            .iter()
            .map(|column| match column.ty {
                ColumnType::Text => format!(
                    "COALESCE(SUM(CASE WHEN {0} IS NULL OR {0} = 'NA' THEN 1 ELSE 0 END), 0)",
                    column.name
                ),
                _ => format!(
                    "COALESCE(SUM(CASE WHEN {} IS NULL THEN 1 ELSE 0 END), 0)",
                    column.name
                ),
            })
            .collect();
        let sql = format!(
            "SELECT COUNT(*), {} FROM {}",
            missing_terms.join(" + "),
            entity.transformed_table()
        );
        let row = sqlx::query(&sql).fetch_one(&self.pool).await?;
        let rows: i64 = row.try_get(0)?;
        let missing: i64 = row.try_get(1)?;
        let total = rows.max(0) as u64 * schema.columns.len() as u64;
        Ok((missing.max(0) as u64, total))
    }

    /// Non-null values of a numeric column.
    pub async fn numeric_values(&self, entity: Entity, column: &str) -> StoreResult<Vec<f64>> {
        let sql = format!(
            "SELECT CAST({column} AS REAL) FROM {} WHERE {column} IS NOT NULL",
            entity.transformed_table()
        );
        let values: Vec<f64> = sqlx::query_scalar(&sql).fetch_all(&self.pool).await?;
        Ok(values)
    }

    /// Sets `outlier_flag` for every row from `[lo, hi]`; `None` clears all flags.
    /// Returns the number of flagged rows.
    pub async fn refresh_outlier_flags(
        &self,
        entity: Entity,
        column: &str,
        bounds: Option<(f64, f64)>,
    ) -> StoreResult<u64> {
        let table = entity.transformed_table();
        match bounds {
            Some((lo, hi)) => {
                let sql = format!(
                    "UPDATE {table} SET outlier_flag = CASE \
                     WHEN {column} IS NOT NULL AND ({column} < ? OR {column} > ?) THEN 1 ELSE 0 END"
                );
                sqlx::query(&sql)
                    .bind(lo)
                    .bind(hi)
                    .execute(&self.pool)
                    .await?;
            }
            None => {
                let sql = format!("UPDATE {table} SET outlier_flag = 0");
                sqlx::query(&sql).execute(&self.pool).await?;
            }
        }
        let sql = format!("SELECT COUNT(*) FROM {table} WHERE outlier_flag = 1");
        let flagged: i64 = sqlx::query_scalar(&sql).fetch_one(&self.pool).await?;
        Ok(flagged.max(0) as u64)
    }
}
