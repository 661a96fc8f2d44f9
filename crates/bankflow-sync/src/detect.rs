//! Content-fingerprint change detection against the file-tracking ledger.

use std::path::{Path, PathBuf};

use bankflow_core::FileTrackingEntry;
use bankflow_storage::{sha256_file, sha256_hex, StagingStore, StoreResult};
use chrono::Utc;
use tokio::fs;
use tracing::debug;

use crate::extract::StageFileError;

/// Where the parser should read a changed file from.
#[derive(Debug, Clone)]
pub enum FileBody {
    /// Small file already read; these exact bytes were fingerprinted.
    Loaded(Vec<u8>),
    /// Large file, hashed by streaming and parsed in chunks from disk.
    OnDisk,
}

#[derive(Debug, Clone)]
pub struct SourceFile {
    pub path: PathBuf,
    pub file_name: String,
    pub content_hash: String,
    pub file_size: u64,
    pub body: FileBody,
}

#[derive(Debug, Clone)]
pub enum Detection {
    Unchanged(FileTrackingEntry),
    Changed(SourceFile),
}

pub struct ChangeDetector<'a> {
    staging: &'a StagingStore,
    large_file_bytes: u64,
}

impl<'a> ChangeDetector<'a> {
    pub fn new(staging: &'a StagingStore, large_file_bytes: u64) -> Self {
        Self {
            staging,
            large_file_bytes,
        }
    }

    pub async fn inspect(&self, path: &Path) -> Result<Detection, StageFileError> {
        let file_name = path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| path.display().to_string());
        let io_err = |source| StageFileError::Io {
            file: file_name.clone(),
            source,
        };

        let metadata = fs::metadata(path).await.map_err(io_err)?;
        let (content_hash, file_size, body) = if metadata.len() > self.large_file_bytes {
            let (hash, size) = sha256_file(path).await.map_err(io_err)?;
            (hash, size, FileBody::OnDisk)
        } else {
            let bytes = fs::read(path).await.map_err(io_err)?;
            (sha256_hex(&bytes), bytes.len() as u64, FileBody::Loaded(bytes))
        };

        if let Some(entry) = self.staging.ledger_entry(&file_name).await? {
            if entry.content_hash == content_hash {
                debug!(file = %file_name, rows = entry.row_count, "fingerprint unchanged");
                return Ok(Detection::Unchanged(entry));
            }
        }

        Ok(Detection::Changed(SourceFile {
            path: path.to_path_buf(),
            file_name,
            content_hash,
            file_size,
            body,
        }))
    }

    /// Records `file` as fully processed.
    pub async fn mark_processed(
        &self,
        file: &SourceFile,
        row_count: u64,
    ) -> StoreResult<FileTrackingEntry> {
        let entry = FileTrackingEntry {
            file_name: file.file_name.clone(),
            content_hash: file.content_hash.clone(),
            processed_at: Utc::now(),
            row_count,
            file_size: file.file_size,
        };
        self.staging.upsert_ledger_entry(&entry).await?;
        Ok(entry)
    }
}
