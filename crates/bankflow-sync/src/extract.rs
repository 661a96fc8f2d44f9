//! Staging upserter: parses source files and writes them into staging by upsert.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::io::{Cursor, Read};
use std::path::{Path, PathBuf};

use anyhow::Context;
use bankflow_core::{normalize_raw, numeric_sort_key, Entity, StagingRow};
use bankflow_storage::{HashingReader, StagingStore, StoreError};
use csv::{ByteRecord, ReaderBuilder, Trim};
use serde::Serialize;
use thiserror::Error;
use tokio::fs;
use tracing::{error, info, info_span, warn, Instrument};

use crate::config::PipelineConfig;
use crate::detect::{ChangeDetector, Detection, FileBody, SourceFile};

#[derive(Debug, Error)]
pub enum StageFileError {
    #[error("{file}: header {found:?} does not match columns {expected:?}")]
    SchemaMismatch {
        file: String,
        expected: Vec<String>,
        found: Vec<String>,
    },
    #[error("reading {file}: {source}")]
    Io {
        file: String,
        #[source]
        source: std::io::Error,
    },
    #[error("parsing {file}: {source}")]
    Csv {
        file: String,
        #[source]
        source: csv::Error,
    },
    #[error(transparent)]
    Store(#[from] StoreError),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum FileStatus {
    Processed,
    Unchanged,
    /// At least one batch failed; the file stays eligible for the next run.
    Incomplete,
    Rejected,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct FileOutcome {
    pub file_name: String,
    pub status: FileStatus,
    pub source_rows: u64,
    pub staged_rows: u64,
    pub new_rows: u64,
    pub updated_rows: u64,
    pub missing_key_rows: u64,
    pub duplicate_rows: u64,
    pub failed_batches: u64,
    pub failed_rows: u64,
}

impl FileOutcome {
    fn new(file_name: impl Into<String>, status: FileStatus) -> Self {
        Self {
            file_name: file_name.into(),
            status,
            source_rows: 0,
            staged_rows: 0,
            new_rows: 0,
            updated_rows: 0,
            missing_key_rows: 0,
            duplicate_rows: 0,
            failed_batches: 0,
            failed_rows: 0,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct EntityExtract {
    pub source_rows: u64,
    pub new_rows: u64,
    pub updated_rows: u64,
    pub failed_rows: u64,
    pub files: Vec<FileOutcome>,
}

impl EntityExtract {
    /// `(source_rows, new_rows, updated_rows)`
    pub fn counts(&self) -> (u64, u64, u64) {
        (self.source_rows, self.new_rows, self.updated_rows)
    }

    fn absorb(&mut self, outcome: FileOutcome) {
        self.source_rows += outcome.source_rows;
        self.new_rows += outcome.new_rows;
        self.updated_rows += outcome.updated_rows;
        self.failed_rows += outcome.failed_rows;
        self.files.push(outcome);
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ExtractReport {
    pub entities: BTreeMap<Entity, EntityExtract>,
}

impl ExtractReport {
    pub fn entity(&self, entity: Entity) -> EntityExtract {
        self.entities.get(&entity).cloned().unwrap_or_default()
    }

    pub fn total_source_rows(&self) -> u64 {
        self.entities.values().map(|e| e.source_rows).sum()
    }

    pub fn total_new_rows(&self) -> u64 {
        self.entities.values().map(|e| e.new_rows).sum()
    }
}

/// Source files for `entity`: `<entity><anything>.<ext>` in `data_dir`, sorted by path.
pub async fn discover_files(
    data_dir: &Path,
    entity: Entity,
    extension: &str,
) -> std::io::Result<Vec<PathBuf>> {
    let mut files = Vec::new();
    let mut entries = fs::read_dir(data_dir).await?;
    while let Some(entry) = entries.next_entry().await? {
        let path = entry.path();
        if !entry.file_type().await?.is_file() {
            continue;
        }
        let name_matches = path
            .file_name()
            .map(|n| n.to_string_lossy().starts_with(entity.name()))
            .unwrap_or(false);
        let ext_matches = path
            .extension()
            .map(|e| e.to_string_lossy().eq_ignore_ascii_case(extension))
            .unwrap_or(false);
        if name_matches && ext_matches {
            files.push(path);
        }
    }
    files.sort();
    Ok(files)
}

/// Reads a delimited source in bounded chunks, mapped onto the entity's source columns.
struct CsvChunks<R: Read> {
    entity: Entity,
    reader: csv::Reader<R>,
    positions: Vec<usize>,
    record: ByteRecord,
}

impl<R: Read> CsvChunks<R> {
    fn open(entity: Entity, file_name: &str, source: R) -> Result<Self, StageFileError> {
        let mut reader = ReaderBuilder::new()
            .flexible(true)
            .trim(Trim::Headers)
            .from_reader(source);
        let headers = reader
            .byte_headers()
            .map_err(|source| StageFileError::Csv {
                file: file_name.to_string(),
                source,
            })?;
        let found: Vec<String> = headers
            .iter()
            .map(|h| {
                String::from_utf8_lossy(h)
                    .trim_start_matches('\u{feff}')
                    .trim()
                    .to_ascii_lowercase()
            })
            .collect();

        let columns = entity.schema().source_columns;
        let found_set: HashSet<&str> = found.iter().map(String::as_str).collect();
        let expected_set: HashSet<&str> = columns.iter().copied().collect();
        if found_set != expected_set || found_set.len() != found.len() {
            return Err(StageFileError::SchemaMismatch {
                file: file_name.to_string(),
                expected: columns.iter().map(|c| c.to_string()).collect(),
                found,
            });
        }
        let positions = columns
            .iter()
            .filter_map(|c| found.iter().position(|h| h == c))
            .collect();

        Ok(Self {
            entity,
            reader,
            positions,
            record: ByteRecord::new(),
        })
    }

    /// Up to `max_rows` rows; empty once the source is exhausted.
    fn next_chunk(&mut self, max_rows: usize) -> Result<Vec<StagingRow>, csv::Error> {
        let mut rows = Vec::new();
        while rows.len() < max_rows && self.reader.read_byte_record(&mut self.record)? {
            let values = self
                .positions
                .iter()
                .map(|pos| {
                    self.record
                        .get(*pos)
                        .and_then(|raw| normalize_raw(&String::from_utf8_lossy(raw)))
                })
                .collect();
            rows.push(StagingRow::new(self.entity, values));
        }
        Ok(rows)
    }

    fn into_inner(self) -> R {
        self.reader.into_inner()
    }
}

/// Collapses duplicate keys (last occurrence wins) and drops rows without a key.
/// Returns the surviving rows sorted by numeric sort key; ties keep first-seen order.
pub fn prepare_chunk(rows: Vec<StagingRow>, outcome: &mut FileOutcome) -> Vec<StagingRow> {
    let mut unique: Vec<StagingRow> = Vec::with_capacity(rows.len());
    let mut index: HashMap<String, usize> = HashMap::new();
    for row in rows {
        let Some(key) = row.key().map(str::to_string) else {
            outcome.missing_key_rows += 1;
            continue;
        };
        match index.get(&key) {
            Some(&pos) => {
                unique[pos] = row;
                outcome.duplicate_rows += 1;
            }
            None => {
                index.insert(key, unique.len());
                unique.push(row);
            }
        }
    }
    unique.sort_by_key(|row| numeric_sort_key(row.key()));
    unique
}

pub struct StagingUpserter<'a> {
    config: &'a PipelineConfig,
    staging: &'a StagingStore,
}

impl<'a> StagingUpserter<'a> {
    pub fn new(config: &'a PipelineConfig, staging: &'a StagingStore) -> Self {
        Self { config, staging }
    }

    /// Stages every entity's source files, accumulating into `report` as it goes.
    ///
    /// Rejected headers skip the file. I/O, parse and connectivity failures abort the stage.
    pub async fn extract_all(&self, report: &mut ExtractReport) -> anyhow::Result<()> {
        for entity in Entity::LOAD_ORDER {
            let files = discover_files(&self.config.data_dir, entity, &self.config.file_extension)
                .await
                .with_context(|| {
                    format!("listing source files in {}", self.config.data_dir.display())
                })?;
            let span = info_span!("extract", entity = %entity, files = files.len());
            async {
                for path in &files {
                    let outcome = match self.stage_file(entity, path).await {
                        Ok(outcome) => outcome,
                        Err(err @ StageFileError::SchemaMismatch { .. }) => {
                            error!(error = %err, "skipping file with unexpected columns");
                            let name = path
                                .file_name()
                                .map(|n| n.to_string_lossy().into_owned())
                                .unwrap_or_default();
                            FileOutcome::new(name, FileStatus::Rejected)
                        }
                        Err(err) => {
                            return Err(anyhow::Error::new(err)
                                .context(format!("staging {}", path.display())));
                        }
                    };
                    report.entities.entry(entity).or_default().absorb(outcome);
                }
                let totals = report.entities.entry(entity).or_default();
                info!(
                    source_rows = totals.source_rows,
                    new_rows = totals.new_rows,
                    updated_rows = totals.updated_rows,
                    "entity staged"
                );
                Ok(())
            }
            .instrument(span)
            .await?;
        }
        Ok(())
    }

    /// Fingerprints one file and, when changed, upserts its rows in batches.
    pub async fn stage_file(
        &self,
        entity: Entity,
        path: &Path,
    ) -> Result<FileOutcome, StageFileError> {
        let detector = ChangeDetector::new(self.staging, self.config.large_file_bytes);
        let mut file = match detector.inspect(path).await? {
            Detection::Unchanged(entry) => {
                let mut outcome = FileOutcome::new(entry.file_name, FileStatus::Unchanged);
                outcome.source_rows = entry.row_count;
                return Ok(outcome);
            }
            Detection::Changed(file) => file,
        };

        let mut outcome = FileOutcome::new(file.file_name.clone(), FileStatus::Processed);
        // the parser owns the body from here on
        match std::mem::replace(&mut file.body, FileBody::OnDisk) {
            FileBody::Loaded(bytes) => {
                let chunks = CsvChunks::open(entity, &file.file_name, Cursor::new(bytes))?;
                self.stage_chunks(chunks, &file, usize::MAX, &mut outcome)
                    .await?;
            }
            FileBody::OnDisk => {
                let path = file.path.clone();
                let name = file.file_name.clone();
                let chunks = off_runtime(&file.file_name, move || {
                    let handle = std::fs::File::open(&path).map_err(|source| {
                        StageFileError::Io {
                            file: name.clone(),
                            source,
                        }
                    })?;
                    CsvChunks::open(entity, &name, HashingReader::new(handle))
                })
                .await?;
                let reader = self
                    .stage_chunks(chunks, &file, self.config.chunk_rows, &mut outcome)
                    .await?;
                let (parsed_hash, parsed_size) = reader.finish();
                if parsed_hash != file.content_hash {
                    warn!(
                        file = %file.file_name,
                        fingerprint = %file.content_hash,
                        parsed = %parsed_hash,
                        "file changed while staging; recording the bytes actually staged"
                    );
                    file.content_hash = parsed_hash;
                    file.file_size = parsed_size;
                }
            }
        }

        if outcome.failed_batches == 0 {
            detector.mark_processed(&file, outcome.source_rows).await?;
            info!(
                file = %file.file_name,
                rows = outcome.source_rows,
                new = outcome.new_rows,
                updated = outcome.updated_rows,
                "file staged"
            );
        } else {
            outcome.status = FileStatus::Incomplete;
            warn!(
                file = %file.file_name,
                failed_batches = outcome.failed_batches,
                failed_rows = outcome.failed_rows,
                "file left unmarked for retry"
            );
        }
        Ok(outcome)
    }

    /// Stages every chunk and hands back the exhausted source.
    async fn stage_chunks<R: Read + Send + 'static>(
        &self,
        mut chunks: CsvChunks<R>,
        file: &SourceFile,
        chunk_rows: usize,
        outcome: &mut FileOutcome,
    ) -> Result<R, StageFileError> {
        let entity = chunks.entity;
        loop {
            let name = file.file_name.clone();
            let (returned, rows) = off_runtime(&file.file_name, move || {
                let rows = chunks
                    .next_chunk(chunk_rows)
                    .map_err(|source| StageFileError::Csv { file: name, source })?;
                Ok((chunks, rows))
            })
            .await?;
            chunks = returned;
            if rows.is_empty() {
                return Ok(chunks.into_inner());
            }
            outcome.source_rows += rows.len() as u64;
            let rows = prepare_chunk(rows, outcome);

            let keys: Vec<&str> = rows.iter().filter_map(StagingRow::key).collect();
            let existing = self.staging.existing_keys(entity, &keys).await?;

            for batch in rows.chunks(self.config.batch_size.max(1)) {
                match self.staging.upsert_batch(entity, batch).await {
                    Ok(()) => {
                        let updated = batch
                            .iter()
                            .filter(|r| r.key().map(|k| existing.contains(k)).unwrap_or(false))
                            .count() as u64;
                        outcome.updated_rows += updated;
                        outcome.new_rows += batch.len() as u64 - updated;
                        outcome.staged_rows += batch.len() as u64;
                    }
                    Err(err) if err.is_connectivity() => return Err(err.into()),
                    Err(err) => {
                        error!(
                            file = %file.file_name,
                            rows = batch.len(),
                            error = %err,
                            "staging batch rolled back"
                        );
                        outcome.failed_batches += 1;
                        outcome.failed_rows += batch.len() as u64;
                    }
                }
            }
            if chunk_rows == usize::MAX {
                return Ok(chunks.into_inner());
            }
        }
    }
}

/// Runs blocking file and parser work on tokio's blocking pool.
async fn off_runtime<T, F>(file_name: &str, work: F) -> Result<T, StageFileError>
where
    F: FnOnce() -> Result<T, StageFileError> + Send + 'static,
    T: Send + 'static,
{
    tokio::task::spawn_blocking(work)
        .await
        .map_err(|err| StageFileError::Io {
            file: file_name.to_string(),
            source: std::io::Error::other(err),
        })?
}

#[cfg(test)]
mod tests {
    use super::*;

    fn branch(id: Option<&str>, city: &str) -> StagingRow {
        StagingRow::new(
            Entity::Branch,
            vec![
                id.map(str::to_string),
                None,
                Some(city.to_string()),
                None,
                None,
            ],
        )
    }

    #[test]
    fn prepare_chunk_keeps_last_duplicate_and_sorts_numerically() {
        let mut outcome = FileOutcome::new("branches.csv", FileStatus::Processed);
        let rows = vec![
            branch(Some("BR10"), "Delhi"),
            branch(Some("BR2"), "Pune"),
            branch(None, "Nowhere"),
            branch(Some("BR10"), "Noida"),
        ];
        let prepared = prepare_chunk(rows, &mut outcome);
        let keys: Vec<_> = prepared.iter().filter_map(|r| r.key()).collect();
        assert_eq!(keys, vec!["BR2", "BR10"]);
        assert_eq!(prepared[1].field("city"), Some("Noida"));
        assert_eq!(outcome.missing_key_rows, 1);
        assert_eq!(outcome.duplicate_rows, 1);
    }

    #[test]
    fn header_set_must_match_in_any_order() {
        let body = "city , branch_id,state,manager_name,branch_name\nPune,BR01,MH,Asha,Main\n";
        let mut chunks =
            CsvChunks::open(Entity::Branch, "branches.csv", body.as_bytes()).expect("open");
        let rows = chunks.next_chunk(10).expect("rows");
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].key(), Some("BR01"));
        assert_eq!(rows[0].field("city"), Some("Pune"));

        let bad = "branch_id,city,zip\nBR01,Pune,411001\n";
        assert!(matches!(
            CsvChunks::open(Entity::Branch, "branches.csv", bad.as_bytes()),
            Err(StageFileError::SchemaMismatch { .. })
        ));
    }

    #[test]
    fn short_rows_pad_with_nulls_and_tokens_become_null() {
        let body = "branch_id,branch_name,city,state,manager_name\nBR01,Main,N/A\nBR02,,Pune,MH,nan\n";
        let mut chunks =
            CsvChunks::open(Entity::Branch, "branches.csv", body.as_bytes()).expect("open");
        let first = chunks.next_chunk(1).expect("chunk");
        assert_eq!(first.len(), 1);
        assert_eq!(first[0].field("city"), None);
        assert_eq!(first[0].field("manager_name"), None);
        let rest = chunks.next_chunk(10).expect("chunk");
        assert_eq!(rest[0].field("branch_name"), None);
        assert_eq!(rest[0].field("manager_name"), None);
        assert!(chunks.next_chunk(10).expect("eof").is_empty());
    }
}
