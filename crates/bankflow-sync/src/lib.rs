//! Incremental ETL engine: stage, normalize, append and verify banking entity files.

use std::fmt;
use std::path::Path;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use anyhow::{Context, Result};
use bankflow_core::SyncStatus;
use bankflow_storage::{write_atomic, Stores};
use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::fs;
use tokio_cron_scheduler::{Job, JobScheduler};
use tracing::{debug, error, info, info_span, warn, Instrument};
use uuid::Uuid;

pub mod config;
pub mod detect;
pub mod export;
pub mod extract;
pub mod load;
pub mod normalize;
pub mod quality;
pub mod rules;
pub mod verify;

pub use config::{PipelineConfig, RegionRule, RegionRules, ScheduleConfig};
pub use export::ExportedFile;
pub use extract::{EntityExtract, ExtractReport, FileOutcome, FileStatus, StageFileError};
pub use load::{EntityLoad, LoadReport};
pub use normalize::{EntityQuality, TransformReport};
pub use quality::{Grade, QualityTracker, RunQuality};

pub const CRATE_NAME: &str = "bankflow-sync";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Stage {
    Extract,
    Transform,
    Export,
    Load,
    Verify,
}

impl Stage {
    /// Order of one full pass. Quality is summarized after whichever stage the run reached.
    pub const PASS: [Stage; 5] = [
        Stage::Extract,
        Stage::Transform,
        Stage::Export,
        Stage::Load,
        Stage::Verify,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            Stage::Extract => "extract",
            Stage::Transform => "transform",
            Stage::Export => "export",
            Stage::Load => "load",
            Stage::Verify => "verify",
        }
    }
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum RunStatus {
    Completed,
    Failed { stage: Stage, error: String },
    Cancelled { before_stage: Stage },
    /// Another run held the guard when this one was triggered.
    Skipped,
}

impl RunStatus {
    pub fn is_failure(&self) -> bool {
        matches!(self, RunStatus::Failed { .. })
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct RunSummary {
    pub run_id: Uuid,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub duration_ms: i64,
    pub status: RunStatus,
    pub extract: ExtractReport,
    pub transform: TransformReport,
    pub exports: Vec<ExportedFile>,
    pub load: LoadReport,
    pub sync: Vec<SyncStatus>,
    pub quality: RunQuality,
    pub reports_dir: Option<String>,
}

impl RunSummary {
    fn new(run_id: Uuid, started_at: DateTime<Utc>) -> Self {
        Self {
            run_id,
            started_at,
            finished_at: started_at,
            duration_ms: 0,
            status: RunStatus::Completed,
            extract: ExtractReport::default(),
            transform: TransformReport::default(),
            exports: Vec::new(),
            load: LoadReport::default(),
            sync: Vec::new(),
            quality: RunQuality::default(),
            reports_dir: None,
        }
    }

    fn finish(&mut self, status: RunStatus) {
        self.status = status;
        self.finished_at = Utc::now();
        self.duration_ms = (self.finished_at - self.started_at).num_milliseconds();
    }

    pub fn render_markdown(&self) -> String {
        let status = match &self.status {
            RunStatus::Completed => "completed".to_string(),
            RunStatus::Failed { stage, error } => format!("failed in {stage}: {error}"),
            RunStatus::Cancelled { before_stage } => format!("cancelled before {before_stage}"),
            RunStatus::Skipped => "skipped".to_string(),
        };
        let extract = self
            .extract
            .entities
            .iter()
            .map(|(entity, e)| {
                format!(
                    "- {entity}: source={} new={} updated={} failed={}",
                    e.source_rows, e.new_rows, e.updated_rows, e.failed_rows
                )
            })
            .collect::<Vec<_>>()
            .join("\n");
        let transform = self
            .transform
            .entities
            .iter()
            .map(|(entity, q)| {
                format!(
                    "- {entity}: transformed={} orphaned={} invalid={} completeness={:.2}% outliers={:.2}%",
                    q.transformed, q.orphaned, q.invalid, q.completeness_pct, q.outlier_rate_pct
                )
            })
            .collect::<Vec<_>>()
            .join("\n");
        let load = self
            .load
            .entities
            .iter()
            .map(|(entity, l)| {
                format!(
                    "- {entity}: inserted={} skipped={} production={} synchronized={}",
                    l.inserted, l.skipped, l.post_load_count, l.synchronized
                )
            })
            .collect::<Vec<_>>()
            .join("\n");
        let sync = self
            .sync
            .iter()
            .map(|s| {
                format!(
                    "- {}: transformed={} production={} synchronized={}",
                    s.entity, s.transformed_count, s.production_count, s.synchronized
                )
            })
            .collect::<Vec<_>>()
            .join("\n");

        format!(
            "# Bankflow Run Summary\n\n- Run ID: `{}`\n- Started: {}\n- Finished: {}\n- Status: {}\n\n\
             ## Extract\n{}\n\n## Transform\n{}\n\n## Load\n{}\n\n## Verify\n{}\n\n## Quality\n```\n{}```\n",
            self.run_id,
            self.started_at,
            self.finished_at,
            status,
            extract,
            transform,
            load,
            sync,
            self.quality.render(),
        )
    }
}

/// Shared flag asking a pass to stop before its next stage.
///
/// A request made while no pass is running stops the next one. Each pass clears the flag
/// when it ends, so a request never outlives the pass that observed it.
#[derive(Debug, Clone, Default)]
pub struct CancelHandle {
    flag: Arc<AtomicBool>,
}

impl CancelHandle {
    pub fn cancel(&self) {
        self.flag.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.flag.load(Ordering::SeqCst)
    }

    fn clear(&self) {
        self.flag.store(false, Ordering::SeqCst);
    }
}

/// Scheduler triggers seen and how many of them completed.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct RunCounts {
    pub total: u64,
    pub succeeded: u64,
}

#[derive(Debug, Default)]
struct RunGuard {
    running: AtomicBool,
}

struct RunPermit<'a> {
    running: &'a AtomicBool,
}

impl RunGuard {
    fn try_acquire(&self) -> Option<RunPermit<'_>> {
        self.running
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .ok()
            .map(|_| RunPermit {
                running: &self.running,
            })
    }
}

impl Drop for RunPermit<'_> {
    fn drop(&mut self) {
        self.running.store(false, Ordering::Release);
    }
}

pub struct Pipeline {
    config: PipelineConfig,
    stores: Stores,
    regions: RegionRules,
    guard: RunGuard,
    cancel: CancelHandle,
    runs_total: AtomicU64,
    runs_succeeded: AtomicU64,
}

impl Pipeline {
    /// Connects the three stores and creates any missing tables.
    pub async fn connect(config: PipelineConfig) -> Result<Self> {
        let stores = Stores::connect(
            &config.staging_url,
            &config.transformed_url,
            &config.production_url,
            &config.connect_backoff,
        )
        .await
        .context("connecting stores")?;
        stores.init_schema().await.context("creating tables")?;
        Self::with_stores(config, stores)
    }

    pub fn with_stores(config: PipelineConfig, stores: Stores) -> Result<Self> {
        let regions = config.region_rules()?;
        Ok(Self {
            config,
            stores,
            regions,
            guard: RunGuard::default(),
            cancel: CancelHandle::default(),
            runs_total: AtomicU64::new(0),
            runs_succeeded: AtomicU64::new(0),
        })
    }

    pub fn config(&self) -> &PipelineConfig {
        &self.config
    }

    pub fn stores(&self) -> &Stores {
        &self.stores
    }

    pub fn cancel_handle(&self) -> CancelHandle {
        self.cancel.clone()
    }

    pub fn run_counts(&self) -> RunCounts {
        RunCounts {
            total: self.runs_total.load(Ordering::Relaxed),
            succeeded: self.runs_succeeded.load(Ordering::Relaxed),
        }
    }

    pub async fn extract(&self) -> Result<ExtractReport> {
        let mut report = ExtractReport::default();
        self.extract_into(&mut report).await?;
        Ok(report)
    }

    pub async fn transform(&self) -> Result<TransformReport> {
        let mut report = TransformReport::default();
        self.transform_into(&mut report).await?;
        Ok(report)
    }

    /// Rebuilds the transformed store from staging. Production history and watermarks are kept;
    /// re-derived rows whose keys production already holds are skipped by the next load.
    pub async fn full_refresh(&self) -> Result<TransformReport> {
        let removed = self.normalizer().clear_all().await?;
        warn!(rows = removed, "full refresh cleared the transformed store");
        self.transform().await
    }

    pub async fn load(&self) -> Result<LoadReport> {
        let mut report = LoadReport::default();
        self.load_into(&mut report).await?;
        Ok(report)
    }

    pub async fn verify(&self) -> Result<Vec<SyncStatus>> {
        verify::verify_counts(&self.stores.transformed, &self.stores.production).await
    }

    /// Writes one CSV per entity into the export directory, if one is configured.
    pub async fn export(&self) -> Result<Vec<ExportedFile>> {
        match &self.config.export_dir {
            Some(dir) => {
                export::export_all(&self.stores.transformed, dir, self.config.read_batch_size)
                    .await
            }
            None => {
                debug!("export directory disabled");
                Ok(Vec::new())
            }
        }
    }

    async fn extract_into(&self, report: &mut ExtractReport) -> Result<()> {
        extract::StagingUpserter::new(&self.config, &self.stores.staging)
            .extract_all(report)
            .await
    }

    async fn transform_into(&self, report: &mut TransformReport) -> Result<()> {
        self.normalizer().transform_all(report).await
    }

    async fn load_into(&self, report: &mut LoadReport) -> Result<()> {
        load::IncrementalLoader::new(
            &self.stores.transformed,
            &self.stores.production,
            self.config.batch_size,
        )
        .load_all(report)
        .await
    }

    fn normalizer(&self) -> normalize::Normalizer<'_> {
        normalize::Normalizer::new(
            &self.config,
            &self.stores.staging,
            &self.stores.transformed,
            &self.regions,
            Utc::now().date_naive(),
        )
    }

    /// One full pass. Never returns an error: failures, cancellation and overlapping triggers
    /// are reported in the summary together with the counts reached so far.
    pub async fn run_once(&self) -> RunSummary {
        let run_id = Uuid::new_v4();
        let mut summary = RunSummary::new(run_id, Utc::now());
        let Some(_permit) = self.guard.try_acquire() else {
            warn!(%run_id, "previous run still in progress; skipping trigger");
            summary.finish(RunStatus::Skipped);
            return summary;
        };

        let status = self
            .run_stages(&mut summary)
            .instrument(info_span!("run", %run_id))
            .await;
        self.cancel.clear();

        let mut tracker = QualityTracker::default();
        tracker.record_extract(&summary.extract);
        tracker.record_transform(&summary.transform);
        tracker.record_load(&summary.load);
        summary.quality = tracker.finish();
        summary.quality.emit();
        summary.finish(status);

        match &summary.status {
            RunStatus::Failed { stage, error } => {
                error!(%run_id, %stage, error = %error, "run failed")
            }
            RunStatus::Cancelled { before_stage } => {
                warn!(%run_id, %before_stage, "run cancelled")
            }
            _ => info!(
                %run_id,
                duration_ms = summary.duration_ms,
                source_rows = summary.extract.total_source_rows(),
                new_rows = summary.extract.total_new_rows(),
                transformed = summary.transform.total_transformed(),
                loaded = summary.load.total_inserted(),
                "run finished"
            ),
        }

        if let Some(root) = &self.config.reports_dir {
            let dir = root.join(run_id.to_string());
            summary.reports_dir = Some(dir.display().to_string());
            if let Err(err) = self.write_reports(&dir, &summary).await {
                warn!(error = %format!("{err:#}"), "writing run reports");
                summary.reports_dir = None;
            }
        }
        summary
    }

    async fn run_stages(&self, summary: &mut RunSummary) -> RunStatus {
        for stage in Stage::PASS {
            if self.cancel.is_cancelled() {
                return RunStatus::Cancelled {
                    before_stage: stage,
                };
            }
            let result = match stage {
                Stage::Extract => self.extract_into(&mut summary.extract).await,
                Stage::Transform => self.transform_into(&mut summary.transform).await,
                Stage::Export => self.export().await.map(|files| summary.exports = files),
                Stage::Load => self.load_into(&mut summary.load).await,
                Stage::Verify => self.verify().await.map(|sync| summary.sync = sync),
            };
            if let Err(err) = result {
                return RunStatus::Failed {
                    stage,
                    error: format!("{err:#}"),
                };
            }
            debug!(%stage, "stage finished");
        }
        RunStatus::Completed
    }

    /// Writes `run_summary.json` and `summary.md` into `dir`.
    pub async fn write_reports(&self, dir: &Path, summary: &RunSummary) -> Result<()> {
        fs::create_dir_all(dir)
            .await
            .with_context(|| format!("creating {}", dir.display()))?;
        let json = serde_json::to_vec_pretty(summary).context("serializing run summary")?;
        write_atomic(&dir.join("run_summary.json"), &json).await?;
        write_atomic(&dir.join("summary.md"), summary.render_markdown().as_bytes()).await?;
        Ok(())
    }

    /// Scheduler whose jobs each trigger `run_once`; overlapping triggers are skipped by the run guard.
    pub async fn build_scheduler(self: &Arc<Self>) -> Result<JobScheduler> {
        let sched = JobScheduler::new().await.context("creating scheduler")?;
        match &self.config.schedule {
            ScheduleConfig::Interval(every) => {
                let pipeline = Arc::clone(self);
                let job = Job::new_repeated_async(*every, move |_uuid, _l| {
                    let pipeline = Arc::clone(&pipeline);
                    Box::pin(async move {
                        pipeline.scheduled_run().await;
                    })
                })
                .with_context(|| format!("creating scheduler job every {every:?}"))?;
                sched.add(job).await.context("adding scheduler job")?;
            }
            ScheduleConfig::Cron(exprs) => {
                for cron in exprs {
                    let pipeline = Arc::clone(self);
                    let job = Job::new_async(cron.as_str(), move |_uuid, _l| {
                        let pipeline = Arc::clone(&pipeline);
                        Box::pin(async move {
                            pipeline.scheduled_run().await;
                        })
                    })
                    .with_context(|| format!("creating scheduler job for cron {cron}"))?;
                    sched.add(job).await.context("adding scheduler job")?;
                }
            }
        }
        Ok(sched)
    }

    /// One scheduler trigger: runs a pass and tallies it in [`Pipeline::run_counts`].
    pub async fn scheduled_run(&self) -> RunSummary {
        let summary = self.run_once().await;
        self.runs_total.fetch_add(1, Ordering::Relaxed);
        if summary.status == RunStatus::Completed {
            self.runs_succeeded.fetch_add(1, Ordering::Relaxed);
        }
        let counts = self.run_counts();
        info!(
            run_id = %summary.run_id,
            status = ?summary.status,
            loaded = summary.quality.loaded,
            runs_total = counts.total,
            runs_succeeded = counts.succeeded,
            "scheduled run finished"
        );
        summary
    }
}

pub async fn run_once_from_env() -> Result<RunSummary> {
    let pipeline = Pipeline::connect(PipelineConfig::from_env()).await?;
    Ok(pipeline.run_once().await)
}
