//! Pipeline configuration, built once and passed to every stage.

use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;

use anyhow::{Context, Result};
use bankflow_core::NA;
use bankflow_storage::BackoffPolicy;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ScheduleConfig {
    Interval(Duration),
    /// Six-field cron expressions (seconds first).
    Cron(Vec<String>),
}

#[derive(Debug, Clone)]
pub struct PipelineConfig {
    pub staging_url: String,
    pub transformed_url: String,
    pub production_url: String,
    pub data_dir: PathBuf,
    pub file_extension: String,
    pub export_dir: Option<PathBuf>,
    pub reports_dir: Option<PathBuf>,
    /// Rows per write transaction.
    pub batch_size: usize,
    /// Rows per parse chunk for files above `large_file_bytes`.
    pub chunk_rows: usize,
    pub large_file_bytes: u64,
    /// Rows per staging read during normalization.
    pub read_batch_size: usize,
    pub region_rules_path: Option<PathBuf>,
    pub connect_backoff: BackoffPolicy,
    pub schedule: ScheduleConfig,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            staging_url: "sqlite://stores/staging.db".to_string(),
            transformed_url: "sqlite://stores/transformed.db".to_string(),
            production_url: "sqlite://stores/production.db".to_string(),
            data_dir: PathBuf::from("./data"),
            file_extension: "csv".to_string(),
            export_dir: Some(PathBuf::from("./exports")),
            reports_dir: Some(PathBuf::from("./reports")),
            batch_size: 1000,
            chunk_rows: 1000,
            large_file_bytes: 10 * 1024 * 1024,
            read_batch_size: 5000,
            region_rules_path: None,
            connect_backoff: BackoffPolicy::default(),
            schedule: ScheduleConfig::Cron(vec![
                "0 0 6 * * *".to_string(),
                "0 0 18 * * *".to_string(),
            ]),
        }
    }
}

fn env_parse<T: FromStr>(name: &str, default: T) -> T {
    std::env::var(name)
        .ok()
        .and_then(|v| v.trim().parse().ok())
        .unwrap_or(default)
}

fn megabytes(mb: u64) -> u64 {
    mb.saturating_mul(1024 * 1024)
}

/// Unset keeps the default, an empty value disables the directory.
fn env_optional_dir(name: &str, default: Option<PathBuf>) -> Option<PathBuf> {
    match std::env::var(name) {
        Ok(v) if v.trim().is_empty() => None,
        Ok(v) => Some(PathBuf::from(v)),
        Err(_) => default,
    }
}

impl PipelineConfig {
    pub fn from_env() -> Self {
        let defaults = Self::default();
        let schedule = match env_parse::<u64>("BANKFLOW_SCHEDULE_INTERVAL_MINUTES", 0) {
            0 => ScheduleConfig::Cron(vec![
                std::env::var("BANKFLOW_SYNC_CRON_1")
                    .unwrap_or_else(|_| "0 0 6 * * *".to_string()),
                std::env::var("BANKFLOW_SYNC_CRON_2")
                    .unwrap_or_else(|_| "0 0 18 * * *".to_string()),
            ]),
            minutes => ScheduleConfig::Interval(Duration::from_secs(minutes.saturating_mul(60))),
        };

        Self {
            staging_url: std::env::var("BANKFLOW_STAGING_URL").unwrap_or(defaults.staging_url),
            transformed_url: std::env::var("BANKFLOW_TRANSFORMED_URL")
                .unwrap_or(defaults.transformed_url),
            production_url: std::env::var("BANKFLOW_PRODUCTION_URL")
                .unwrap_or(defaults.production_url),
            data_dir: std::env::var("BANKFLOW_DATA_DIR")
                .map(PathBuf::from)
                .unwrap_or(defaults.data_dir),
            file_extension: std::env::var("BANKFLOW_FILE_EXTENSION")
                .map(|ext| ext.trim_start_matches('.').to_string())
                .unwrap_or(defaults.file_extension),
            export_dir: env_optional_dir("BANKFLOW_EXPORT_DIR", defaults.export_dir),
            reports_dir: env_optional_dir("BANKFLOW_REPORTS_DIR", defaults.reports_dir),
            batch_size: env_parse("BANKFLOW_BATCH_SIZE", defaults.batch_size).max(1),
            chunk_rows: env_parse("BANKFLOW_CHUNK_ROWS", defaults.chunk_rows).max(1),
            large_file_bytes: megabytes(env_parse("BANKFLOW_LARGE_FILE_MB", 10)),
            read_batch_size: env_parse("BANKFLOW_READ_BATCH_SIZE", defaults.read_batch_size)
                .max(1),
            region_rules_path: std::env::var("BANKFLOW_REGION_RULES").ok().map(PathBuf::from),
            connect_backoff: BackoffPolicy {
                max_retries: env_parse("BANKFLOW_CONNECT_RETRIES", 3),
                ..BackoffPolicy::default()
            },
            schedule,
        }
    }

    pub fn region_rules(&self) -> Result<RegionRules> {
        match &self.region_rules_path {
            Some(path) => RegionRules::load(path),
            None => Ok(RegionRules::default()),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RegionRule {
    pub region: String,
    pub keywords: Vec<String>,
}

/// Keyword sets mapping a branch's state to a region. The first matching region wins.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RegionRules {
    #[serde(default = "default_rules_version")]
    pub version: u32,
    pub regions: Vec<RegionRule>,
}

fn default_rules_version() -> u32 {
    1
}

impl Default for RegionRules {
    fn default() -> Self {
        let rule = |region: &str, keywords: &[&str]| RegionRule {
            region: region.to_string(),
            keywords: keywords.iter().map(|k| k.to_string()).collect(),
        };
        Self {
            version: 1,
            regions: vec![
                rule("North", &["delhi", "punjab", "haryana", "up", "uttar"]),
                rule("West", &["maharashtra", "gujarat", "goa"]),
                rule(
                    "South",
                    &["karnataka", "tamil", "kerala", "andhra", "telangana"],
                ),
                rule(
                    "East",
                    &[
                        "bengal",
                        "bihar",
                        "odisha",
                        "assam",
                        "meghalaya",
                        "chhattisgarh",
                        "arunachal",
                        "manipur",
                    ],
                ),
            ],
        }
    }
}

impl RegionRules {
    pub fn from_yaml_str(text: &str) -> Result<Self> {
        serde_yaml::from_str(text).context("parsing region rules")
    }

    pub fn load(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path)
            .with_context(|| format!("reading {}", path.display()))?;
        Self::from_yaml_str(&text).with_context(|| format!("loading {}", path.display()))
    }

    /// Region of a cleaned state value, `NA` when nothing matches.
    pub fn infer(&self, state: &str) -> String {
        if state == NA {
            return NA.to_string();
        }
        let lowered = state.to_lowercase();
        self.regions
            .iter()
            .find(|rule| {
                rule.keywords
                    .iter()
                    .any(|k| lowered.contains(&k.to_lowercase()))
            })
            .map(|rule| rule.region.clone())
            .unwrap_or_else(|| NA.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn large_file_threshold_saturates_instead_of_overflowing() {
        assert_eq!(megabytes(10), 10 * 1024 * 1024);
        assert_eq!(megabytes(0), 0);
        assert_eq!(megabytes(u64::MAX / 2), u64::MAX);
    }

    #[test]
    fn default_region_rules_match_by_keyword() {
        let rules = RegionRules::default();
        assert_eq!(rules.infer("MAHARASHTRA"), "West");
        assert_eq!(rules.infer("TAMIL NADU"), "South");
        assert_eq!(rules.infer("WEST BENGAL"), "East");
        assert_eq!(rules.infer("UTTAR PRADESH"), "North");
        assert_eq!(rules.infer("NA"), "NA");
        assert_eq!(rules.infer("ATLANTIS"), "NA");
    }

    #[test]
    fn region_rules_load_from_yaml() {
        let rules = RegionRules::from_yaml_str(
            "regions:\n  - region: Coastal\n    keywords: [goa, kerala]\n",
        )
        .expect("yaml");
        assert_eq!(rules.version, 1);
        assert_eq!(rules.infer("GOA"), "Coastal");
        assert_eq!(rules.infer("DELHI"), "NA");
    }

    #[test]
    fn defaults_use_local_sqlite_files_and_twice_daily_cron() {
        let config = PipelineConfig::default();
        assert!(config.staging_url.starts_with("sqlite://"));
        assert_eq!(config.batch_size, 1000);
        assert_eq!(config.large_file_bytes, 10 * 1024 * 1024);
        assert_eq!(
            config.schedule,
            ScheduleConfig::Cron(vec!["0 0 6 * * *".into(), "0 0 18 * * *".into()])
        );
    }
}
