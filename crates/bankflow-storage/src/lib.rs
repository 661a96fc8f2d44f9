//! Relational stores, file fingerprints and atomic file writes for bankflow.

use std::path::Path;
use std::str::FromStr;
use std::time::Duration;

use anyhow::Context;
use sha2::{Digest, Sha256};
use sqlx::sqlite::{SqliteConnectOptions, SqlitePool, SqlitePoolOptions};
use thiserror::Error;
use tokio::fs;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tracing::{info_span, warn, Instrument};
use uuid::Uuid;

pub mod ddl;
mod ledger;
pub mod production;
pub mod staging;
pub mod transformed;
mod values;

pub use production::{AppendOutcome, ProductionStore, Watermark};
pub use staging::StagingStore;
pub use transformed::TransformedStore;

pub const CRATE_NAME: &str = "bankflow-storage";

/// Rows bound per `IN (...)` lookup, below SQLite's host-parameter limit.
pub(crate) const KEY_LOOKUP_CHUNK: usize = 500;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("connecting to store {url}: {source}")]
    Connect {
        url: String,
        #[source]
        source: sqlx::Error,
    },
    #[error(transparent)]
    Sqlx(#[from] sqlx::Error),
    #[error("decoding {table}.{column}: {message}")]
    Decode {
        table: String,
        column: String,
        message: String,
    },
}

impl StoreError {
    /// True when the store itself is unreachable, as opposed to a single statement failing.
    pub fn is_connectivity(&self) -> bool {
        match self {
            StoreError::Connect { .. } => true,
            StoreError::Sqlx(err) => classify_sqlx_error(err) == RetryDisposition::Retryable,
            StoreError::Decode { .. } => false,
        }
    }
}

pub type StoreResult<T> = Result<T, StoreError>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDisposition {
    Retryable,
    NonRetryable,
}

pub fn classify_sqlx_error(err: &sqlx::Error) -> RetryDisposition {
    match err {
        sqlx::Error::Io(_)
        | sqlx::Error::Tls(_)
        | sqlx::Error::PoolTimedOut
        | sqlx::Error::PoolClosed
        | sqlx::Error::WorkerCrashed => RetryDisposition::Retryable,
        _ => RetryDisposition::NonRetryable,
    }
}

/// Retry schedule for establishing store connections. Never applied to business rules.
#[derive(Debug, Clone, Copy)]
pub struct BackoffPolicy {
    pub max_retries: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            max_retries: 3,
            base_delay: Duration::from_millis(250),
            max_delay: Duration::from_secs(5),
        }
    }
}

impl BackoffPolicy {
    /// Wait before the next connect attempt, or `None` when `err` should surface now:
    /// either it is not transient or `retries` already used up the budget.
    pub fn retry_delay(&self, retries: u32, err: &sqlx::Error) -> Option<Duration> {
        if retries >= self.max_retries
            || classify_sqlx_error(err) == RetryDisposition::NonRetryable
        {
            return None;
        }
        let doubled = self.base_delay.saturating_mul(2u32.saturating_pow(retries));
        Some(doubled.min(self.max_delay))
    }
}

fn is_in_memory(url: &str) -> bool {
    url.contains(":memory:") || url.contains("mode=memory")
}

fn pool_options(in_memory: bool) -> SqlitePoolOptions {
    let options = SqlitePoolOptions::new().acquire_timeout(Duration::from_secs(30));
    if in_memory {
        // each connection to :memory: is a separate database
        options
            .max_connections(1)
            .min_connections(1)
            .idle_timeout(None)
            .max_lifetime(None)
    } else {
        options.max_connections(4)
    }
}

/// Opens a SQLite pool, creating the database file when missing, retrying transient failures.
pub async fn connect_store(url: &str, backoff: &BackoffPolicy) -> StoreResult<SqlitePool> {
    let connect_err = |source| StoreError::Connect {
        url: url.to_string(),
        source,
    };
    let options = SqliteConnectOptions::from_str(url)
        .map_err(connect_err)?
        .create_if_missing(true);
    let in_memory = is_in_memory(url);

    if !in_memory {
        if let Some(parent) = options.get_filename().parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent)
                    .await
                    .map_err(|err| connect_err(sqlx::Error::Io(err)))?;
            }
        }
    }

    let span = info_span!("store_connect", url);
    async {
        let mut attempt = 0u32;
        loop {
            match pool_options(in_memory)
                .connect_with(options.clone())
                .await
            {
                Ok(pool) => return Ok(pool),
                Err(err) => match backoff.retry_delay(attempt, &err) {
                    Some(delay) => {
                        warn!(attempt, ?delay, error = %err, "store connect failed, retrying");
                        tokio::time::sleep(delay).await;
                        attempt += 1;
                    }
                    None => return Err(connect_err(err)),
                },
            }
        }
    }
    .instrument(span)
    .await
}

/// The three stores of one pipeline, each behind its own pool.
#[derive(Debug, Clone)]
pub struct Stores {
    pub staging: StagingStore,
    pub transformed: TransformedStore,
    pub production: ProductionStore,
}

impl Stores {
    pub async fn connect(
        staging_url: &str,
        transformed_url: &str,
        production_url: &str,
        backoff: &BackoffPolicy,
    ) -> StoreResult<Self> {
        Ok(Self {
            staging: StagingStore::new(connect_store(staging_url, backoff).await?),
            transformed: TransformedStore::new(connect_store(transformed_url, backoff).await?),
            production: ProductionStore::new(connect_store(production_url, backoff).await?),
        })
    }

    /// Three independent in-memory databases with their tables created.
    pub async fn in_memory() -> StoreResult<Self> {
        let backoff = BackoffPolicy::default();
        let stores = Self::connect(
            "sqlite::memory:",
            "sqlite::memory:",
            "sqlite::memory:",
            &backoff,
        )
        .await?;
        stores.init_schema().await?;
        Ok(stores)
    }

    /// Creates every table and index if absent.
    pub async fn init_schema(&self) -> StoreResult<()> {
        self.staging.init_schema().await?;
        self.transformed.init_schema().await?;
        self.production.init_schema().await?;
        Ok(())
    }
}

pub(crate) async fn execute_all(pool: &SqlitePool, statements: &[String]) -> StoreResult<()> {
    for statement in statements {
        sqlx::query(statement).execute(pool).await?;
    }
    Ok(())
}

pub fn sha256_hex(bytes: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(bytes);
    hex::encode(hasher.finalize())
}

/// Streams a file through SHA-256, returning the hex digest and byte size.
pub async fn sha256_file(path: &Path) -> std::io::Result<(String, u64)> {
    let mut file = fs::File::open(path).await?;
    let mut hasher = Sha256::new();
    let mut buf = vec![0u8; 64 * 1024];
    let mut size = 0u64;
    loop {
        let read = file.read(&mut buf).await?;
        if read == 0 {
            break;
        }
        hasher.update(&buf[..read]);
        size += read as u64;
    }
    Ok((hex::encode(hasher.finalize()), size))
}

/// Fingerprints everything read through it, so a parse can report the exact bytes it consumed.
pub struct HashingReader<R> {
    inner: R,
    hasher: Sha256,
    size: u64,
}

impl<R: std::io::Read> HashingReader<R> {
    pub fn new(inner: R) -> Self {
        Self {
            inner,
            hasher: Sha256::new(),
            size: 0,
        }
    }

    /// `(sha256 hex, bytes read)` so far.
    pub fn finish(self) -> (String, u64) {
        (hex::encode(self.hasher.finalize()), self.size)
    }
}

impl<R: std::io::Read> std::io::Read for HashingReader<R> {
    fn read(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
        let read = self.inner.read(buf)?;
        self.hasher.update(&buf[..read]);
        self.size += read as u64;
        Ok(read)
    }
}

/// Writes `bytes` to `path` through a sibling temp file and a rename, replacing any previous file.
pub async fn write_atomic(path: &Path, bytes: &[u8]) -> anyhow::Result<()> {
    let parent = match path.parent() {
        Some(p) if !p.as_os_str().is_empty() => p.to_path_buf(),
        _ => Path::new(".").to_path_buf(),
    };
    fs::create_dir_all(&parent)
        .await
        .with_context(|| format!("creating directory {}", parent.display()))?;

    let temp_path = parent.join(format!(".{}.{}.tmp", Uuid::new_v4(), bytes.len()));
    let mut file = fs::OpenOptions::new()
        .create_new(true)
        .write(true)
        .open(&temp_path)
        .await
        .with_context(|| format!("opening temp file {}", temp_path.display()))?;
    file.write_all(bytes)
        .await
        .with_context(|| format!("writing temp file {}", temp_path.display()))?;
    file.flush()
        .await
        .with_context(|| format!("flushing temp file {}", temp_path.display()))?;
    drop(file);

    if let Err(err) = fs::rename(&temp_path, path).await {
        let _ = fs::remove_file(&temp_path).await;
        return Err(err).with_context(|| {
            format!(
                "atomically renaming {} -> {}",
                temp_path.display(),
                path.display()
            )
        });
    }
    Ok(())
}
