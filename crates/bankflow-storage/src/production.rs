//! Production store: append-only business tables plus per-entity load watermarks.

use bankflow_core::{Entity, TransformedRow};
use chrono::Utc;
use serde::Serialize;
use sqlx::sqlite::SqlitePool;
use sqlx::Row;

use crate::ddl::{self, WATERMARK_TABLE};
use crate::values::{bind_value, placeholders};
use crate::{execute_all, StoreResult};

/// How far the transformed store has been appended into production.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct Watermark {
    pub last_row_id: i64,
    pub rows_loaded: u64,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct AppendOutcome {
    pub inserted: u64,
    /// Rows whose business key was already present; left untouched.
    pub skipped: u64,
    pub watermark: Watermark,
}

#[derive(Debug, Clone)]
pub struct ProductionStore {
    pool: SqlitePool,
}

impl ProductionStore {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    pub async fn init_schema(&self) -> StoreResult<()> {
        execute_all(&self.pool, &ddl::production_tables()).await
    }

    pub async fn watermark(&self, entity: Entity) -> StoreResult<Watermark> {
        let sql = format!("SELECT last_row_id, rows_loaded FROM {WATERMARK_TABLE} WHERE entity = ?");
        let row = sqlx::query(&sql)
            .bind(entity.name())
            .fetch_optional(&self.pool)
            .await?;
        match row {
            Some(row) => Ok(Watermark {
                last_row_id: row.try_get("last_row_id")?,
                rows_loaded: row.try_get::<i64, _>("rows_loaded")?.max(0) as u64,
            }),
            None => Ok(Watermark::default()),
        }
    }

    /// Inserts `rows` (never updating) and advances the watermark in the same transaction.
    ///
    /// `rows` must be in surrogate-key order; the watermark moves to the last row's `row_id`.
    pub async fn append_batch(
        &self,
        entity: Entity,
        rows: &[TransformedRow],
    ) -> StoreResult<AppendOutcome> {
        let mut tx = self.pool.begin().await?;
        let current = {
            let sql = format!("SELECT last_row_id, rows_loaded FROM {WATERMARK_TABLE} WHERE entity = ?");
            match sqlx::query(&sql)
                .bind(entity.name())
                .fetch_optional(&mut *tx)
                .await?
            {
                Some(row) => Watermark {
                    last_row_id: row.try_get("last_row_id")?,
                    rows_loaded: row.try_get::<i64, _>("rows_loaded")?.max(0) as u64,
                },
                None => Watermark::default(),
            }
        };

        let schema = entity.schema();
        let names: Vec<&str> = schema.column_names().collect();
        let sql = format!(
            "INSERT INTO {table} ({cols}) VALUES ({params}) ON CONFLICT({key}) DO NOTHING",
            table = entity.production_table(),
            cols = names.join(", "),
            params = placeholders(names.len()),
            key = schema.primary_key,
        );

        let mut inserted = 0u64;
        let mut skipped = 0u64;
        let mut last_row_id = current.last_row_id;
        for row in rows {
            let mut query = sqlx::query(&sql);
            for value in &row.values {
                query = bind_value(query, value);
            }
            let result = query.execute(&mut *tx).await?;
            if result.rows_affected() == 0 {
                skipped += 1;
            } else {
                inserted += 1;
            }
            if let Some(row_id) = row.row_id {
                last_row_id = last_row_id.max(row_id);
            }
        }

        let watermark = Watermark {
            last_row_id,
            rows_loaded: current.rows_loaded + inserted,
        };
        let sql = format!(
            "INSERT INTO {WATERMARK_TABLE} (entity, last_row_id, rows_loaded, updated_at) \
             VALUES (?, ?, ?, ?) \
             ON CONFLICT(entity) DO UPDATE SET last_row_id = excluded.last_row_id, \
             rows_loaded = excluded.rows_loaded, updated_at = excluded.updated_at"
        );
        sqlx::query(&sql)
            .bind(entity.name())
            .bind(watermark.last_row_id)
            .bind(watermark.rows_loaded as i64)
            .bind(Utc::now().to_rfc3339())
            .execute(&mut *tx)
            .await?;
        tx.commit().await?;

        Ok(AppendOutcome {
            inserted,
            skipped,
            watermark,
        })
    }

    pub async fn count(&self, entity: Entity) -> StoreResult<u64> {
        let sql = format!("SELECT COUNT(*) FROM {}", entity.production_table());
        let count: i64 = sqlx::query_scalar(&sql).fetch_one(&self.pool).await?;
        Ok(count.max(0) as u64)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{connect_store, BackoffPolicy};
    use bankflow_core::Value;

    async fn store() -> ProductionStore {
        let pool = connect_store("sqlite::memory:", &BackoffPolicy::default())
            .await
            .expect("connect");
        let store = ProductionStore::new(pool);
        store.init_schema().await.expect("schema");
        store
    }

    fn branch(row_id: i64, id: &str) -> TransformedRow {
        let mut row = TransformedRow::new(
            Entity::Branch,
            vec![
                Value::text(id),
                Value::text("Main"),
                Value::text("Pune"),
                Value::text("MAHARASHTRA"),
                Value::na(),
                Value::text("West"),
            ],
        );
        row.row_id = Some(row_id);
        row
    }

    #[tokio::test]
    async fn watermark_advances_with_committed_batches() {
        let store = store().await;
        assert_eq!(
            store.watermark(Entity::Branch).await.expect("wm"),
            Watermark::default()
        );

        let first = store
            .append_batch(Entity::Branch, &[branch(1, "BR01"), branch(2, "BR02")])
            .await
            .expect("first");
        assert_eq!(first.inserted, 2);
        assert_eq!(first.watermark.last_row_id, 2);

        let second = store
            .append_batch(Entity::Branch, &[branch(5, "BR01"), branch(6, "BR03")])
            .await
            .expect("second");
        assert_eq!(second.inserted, 1);
        assert_eq!(second.skipped, 1);
        assert_eq!(
            store.watermark(Entity::Branch).await.expect("wm"),
            Watermark {
                last_row_id: 6,
                rows_loaded: 3
            }
        );
        assert_eq!(store.count(Entity::Branch).await.expect("count"), 3);
    }

    #[tokio::test]
    async fn failed_batch_leaves_watermark_untouched() {
        let store = store().await;
        let mut orphan = TransformedRow::new(
            Entity::Loan,
            vec![
                Value::text("L1"),
                Value::text("C404"),
                Value::text("Home"),
                Value::Decimal(1000.0),
                Value::Decimal(7.5),
                Value::Null,
                Value::Null,
                Value::text("Active"),
                Value::Integer(0),
                Value::text("Low"),
                Value::Boolean(false),
            ],
        );
        orphan.row_id = Some(9);

        assert!(store.append_batch(Entity::Loan, &[orphan]).await.is_err());
        assert_eq!(
            store.watermark(Entity::Loan).await.expect("wm"),
            Watermark::default()
        );
        assert_eq!(store.count(Entity::Loan).await.expect("count"), 0);
    }
}
