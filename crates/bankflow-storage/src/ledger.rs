use bankflow_core::FileTrackingEntry;
use chrono::{DateTime, Utc};
use sqlx::Row;

use crate::ddl::LEDGER_TABLE;
use crate::{StagingStore, StoreError, StoreResult};

impl StagingStore {
    pub async fn ledger_entry(&self, file_name: &str) -> StoreResult<Option<FileTrackingEntry>> {
        let sql = format!(
            "SELECT file_name, content_hash, processed_at, row_count, file_size \
             FROM {LEDGER_TABLE} WHERE file_name = ?"
        );
        let Some(row) = sqlx::query(&sql)
            .bind(file_name)
            .fetch_optional(self.pool())
            .await?
        else {
            return Ok(None);
        };

        let processed_at: String = row.try_get("processed_at")?;
        let processed_at = DateTime::parse_from_rfc3339(&processed_at)
            .map_err(|err| StoreError::Decode {
                table: LEDGER_TABLE.to_string(),
                column: "processed_at".to_string(),
                message: err.to_string(),
            })?
            .with_timezone(&Utc);

        Ok(Some(FileTrackingEntry {
            file_name: row.try_get("file_name")?,
            content_hash: row.try_get("content_hash")?,
            processed_at,
            row_count: row.try_get::<i64, _>("row_count")?.max(0) as u64,
            file_size: row.try_get::<i64, _>("file_size")?.max(0) as u64,
        }))
    }

    /// Records a fully processed file. Called only after all of its batches committed.
    pub async fn upsert_ledger_entry(&self, entry: &FileTrackingEntry) -> StoreResult<()> {
        let sql = format!(
            "INSERT INTO {LEDGER_TABLE} (file_name, content_hash, processed_at, row_count, file_size) \
             VALUES (?, ?, ?, ?, ?) \
             ON CONFLICT(file_name) DO UPDATE SET content_hash = excluded.content_hash, \
             processed_at = excluded.processed_at, row_count = excluded.row_count, \
             file_size = excluded.file_size"
        );
        sqlx::query(&sql)
            .bind(&entry.file_name)
            .bind(&entry.content_hash)
            .bind(entry.processed_at.to_rfc3339())
            .bind(entry.row_count as i64)
            .bind(entry.file_size as i64)
            .execute(self.pool())
            .await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{connect_store, BackoffPolicy};

    #[tokio::test]
    async fn ledger_round_trips_and_overwrites() {
        let pool = connect_store("sqlite::memory:", &BackoffPolicy::default())
            .await
            .expect("connect");
        let store = StagingStore::new(pool);
        store.init_schema().await.expect("schema");

        assert!(store.ledger_entry("loans.csv").await.expect("lookup").is_none());

        let mut entry = FileTrackingEntry {
            file_name: "loans.csv".into(),
            content_hash: "abc".into(),
            processed_at: DateTime::parse_from_rfc3339("2024-05-01T10:00:00Z")
                .expect("ts")
                .with_timezone(&Utc),
            row_count: 5,
            file_size: 120,
        };
        store.upsert_ledger_entry(&entry).await.expect("insert");
        entry.content_hash = "def".into();
        entry.row_count = 7;
        store.upsert_ledger_entry(&entry).await.expect("update");

        let stored = store
            .ledger_entry("loans.csv")
            .await
            .expect("lookup")
            .expect("present");
        assert_eq!(stored, entry);
    }
}
