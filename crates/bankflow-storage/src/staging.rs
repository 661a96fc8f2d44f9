//! Staging store: raw text rows keyed by business primary key, written by upsert.

use std::collections::HashSet;

use bankflow_core::{Entity, StagingRow, STAGING_ROW_KEY};
use chrono::Utc;
use sqlx::sqlite::SqlitePool;
use sqlx::Row;

use crate::values::placeholders;
use crate::{ddl, execute_all, StoreResult, KEY_LOOKUP_CHUNK};

#[derive(Debug, Clone)]
pub struct StagingStore {
    pool: SqlitePool,
}

impl StagingStore {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    pub async fn init_schema(&self) -> StoreResult<()> {
        execute_all(&self.pool, &ddl::staging_tables()).await
    }

    /// Inserts each row, or overwrites every non-key column when the key exists.
    ///
    /// The batch is one transaction; on error nothing from it is kept.
    pub async fn upsert_batch(&self, entity: Entity, rows: &[StagingRow]) -> StoreResult<()> {
        if rows.is_empty() {
            return Ok(());
        }
        let schema = entity.schema();
        let columns = schema.source_columns;
        let updates: Vec<String> = columns
            .iter()
            .filter(|c| **c != schema.primary_key)
            .map(|c| format!("{c} = excluded.{c}"))
            .chain(std::iter::once("updated_at = excluded.updated_at".to_string()))
            .collect();
        let sql = format!(
            "INSERT INTO {table} ({cols}, updated_at) VALUES ({params}, ?) \
             ON CONFLICT({key}) DO UPDATE SET {updates}",
            table = entity.staging_table(),
            cols = columns.join(", "),
            params = placeholders(columns.len()),
            key = schema.primary_key,
            updates = updates.join(", "),
        );
        let now = Utc::now().to_rfc3339();

        let mut tx = self.pool.begin().await?;
        for row in rows {
            let mut query = sqlx::query(&sql);
            for idx in 0..columns.len() {
                query = query.bind(row.values.get(idx).cloned().flatten());
            }
            query.bind(now.clone()).execute(&mut *tx).await?;
        }
        tx.commit().await?;
        Ok(())
    }

    /// Subset of `keys` already present in staging.
    pub async fn existing_keys(&self, entity: Entity, keys: &[&str]) -> StoreResult<HashSet<String>> {
        let key_col = entity.schema().primary_key;
        let mut found = HashSet::new();
        for chunk in keys.chunks(KEY_LOOKUP_CHUNK) {
            let sql = format!(
                "SELECT {key_col} FROM {table} WHERE {key_col} IN ({params})",
                table = entity.staging_table(),
                params = placeholders(chunk.len()),
            );
            let mut query = sqlx::query(&sql);
            for key in chunk {
                query = query.bind(*key);
            }
            for row in query.fetch_all(&self.pool).await? {
                found.insert(row.try_get::<String, _>(0)?);
            }
        }
        Ok(found)
    }

    /// Up to `limit` rows with key greater than `after_key`, ordered by key.
    pub async fn fetch_batch(
        &self,
        entity: Entity,
        after_key: Option<&str>,
        limit: usize,
    ) -> StoreResult<Vec<StagingRow>> {
        let schema = entity.schema();
        let key = schema.primary_key;
        let filter = if after_key.is_some() {
            format!("WHERE {key} > ?")
        } else {
            String::new()
        };
        let sql = format!(
            "SELECT {cols} FROM {table} {filter} ORDER BY {key} LIMIT ?",
            cols = schema.source_columns.join(", "),
            table = entity.staging_table(),
        );
        let mut query = sqlx::query(&sql);
        if let Some(after) = after_key {
            query = query.bind(after);
        }
        let rows = query.bind(limit as i64).fetch_all(&self.pool).await?;

        rows.iter()
            .map(|row| -> StoreResult<StagingRow> {
                let values = (0..schema.source_columns.len())
                    .map(|idx| row.try_get::<Option<String>, _>(idx))
                    .collect::<Result<Vec<_>, _>>()?;
                Ok(StagingRow::new(entity, values))
            })
            .collect()
    }

    /// Business keys in insertion order.
    pub async fn keys_by_insertion(&self, entity: Entity) -> StoreResult<Vec<String>> {
        let key = entity.schema().primary_key;
        let sql = format!(
            "SELECT {key} FROM {table} ORDER BY {STAGING_ROW_KEY}",
            table = entity.staging_table()
        );
        let rows = sqlx::query(&sql).fetch_all(&self.pool).await?;
        let keys = rows
            .iter()
            .map(|row| row.try_get::<String, _>(0))
            .collect::<Result<Vec<_>, _>>()?;
        Ok(keys)
    }

    pub async fn count(&self, entity: Entity) -> StoreResult<u64> {
        let sql = format!("SELECT COUNT(*) FROM {}", entity.staging_table());
        let count: i64 = sqlx::query_scalar(&sql).fetch_one(&self.pool).await?;
        Ok(count.max(0) as u64)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{connect_store, BackoffPolicy};

    async fn store() -> StagingStore {
        let pool = connect_store("sqlite::memory:", &BackoffPolicy::default())
            .await
            .expect("connect");
        let store = StagingStore::new(pool);
        store.init_schema().await.expect("schema");
        store
    }

    fn branch(id: &str, city: &str) -> StagingRow {
        StagingRow::new(
            Entity::Branch,
            vec![
                Some(id.to_string()),
                Some("Main".to_string()),
                Some(city.to_string()),
                None,
                None,
            ],
        )
    }

    #[tokio::test]
    async fn upsert_overwrites_non_key_columns() {
        let store = store().await;
        store
            .upsert_batch(Entity::Branch, &[branch("BR01", "Pune"), branch("BR02", "Goa")])
            .await
            .expect("first");
        store
            .upsert_batch(Entity::Branch, &[branch("BR01", "Mumbai")])
            .await
            .expect("second");

        assert_eq!(store.count(Entity::Branch).await.expect("count"), 2);
        let rows = store
            .fetch_batch(Entity::Branch, None, 10)
            .await
            .expect("fetch");
        assert_eq!(rows[0].field("city"), Some("Mumbai"));
        assert_eq!(
            store.keys_by_insertion(Entity::Branch).await.expect("keys"),
            vec!["BR01", "BR02"]
        );
    }

    #[tokio::test]
    async fn keyset_pages_and_existing_key_lookup() {
        let store = store().await;
        let rows: Vec<StagingRow> = (1..=5).map(|i| branch(&format!("BR0{i}"), "Pune")).collect();
        store.upsert_batch(Entity::Branch, &rows).await.expect("upsert");

        let page = store
            .fetch_batch(Entity::Branch, Some("BR02"), 2)
            .await
            .expect("page");
        let keys: Vec<_> = page.iter().filter_map(|r| r.key()).collect();
        assert_eq!(keys, vec!["BR03", "BR04"]);

        let existing = store
            .existing_keys(Entity::Branch, &["BR01", "BR09", "BR05"])
            .await
            .expect("existing");
        assert_eq!(existing.len(), 2);
        assert!(existing.contains("BR05"));
    }
}
