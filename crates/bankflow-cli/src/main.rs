use std::sync::Arc;

use anyhow::{bail, Context, Result};
use bankflow_sync::{Pipeline, PipelineConfig, RunStatus, TransformReport};
use clap::{Parser, Subcommand, ValueEnum};
use serde::Serialize;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

#[derive(Debug, Parser)]
#[command(name = "bankflow")]
#[command(about = "Incremental banking ETL: stage, normalize, load and verify")]
struct Cli {
    #[arg(long, value_enum, default_value_t = LogFormat::Text, global = true)]
    log_format: LogFormat,
    /// Print stage results as JSON instead of text.
    #[arg(long, global = true)]
    json: bool,
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Debug, Clone, Copy, ValueEnum)]
enum LogFormat {
    Text,
    Json,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// One full pass: extract, transform, export, load, verify.
    Run,
    Extract,
    Transform,
    /// Clear and rebuild the transformed store from staging.
    Refresh,
    Load,
    Verify,
    Export,
    /// Run passes on the configured interval or cron schedule until Ctrl-C.
    Schedule,
}

fn init_tracing(format: LogFormat) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let builder = tracing_subscriber::fmt().with_env_filter(filter);
    match format {
        LogFormat::Text => builder.init(),
        LogFormat::Json => builder.json().init(),
    }
}

fn print_json<T: Serialize>(value: &T) -> Result<()> {
    println!(
        "{}",
        serde_json::to_string_pretty(value).context("serializing output")?
    );
    Ok(())
}

fn print_transform(report: &TransformReport, json: bool) -> Result<()> {
    if json {
        return print_json(report);
    }
    for (entity, quality) in &report.entities {
        println!(
            "{entity}: transformed={} orphaned={} invalid={} completeness={:.2}%",
            quality.transformed, quality.orphaned, quality.invalid, quality.completeness_pct
        );
    }
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.log_format);

    let pipeline = Pipeline::connect(PipelineConfig::from_env()).await?;

    match cli.command.unwrap_or(Commands::Run) {
        Commands::Run => {
            let cancel = pipeline.cancel_handle();
            tokio::spawn(async move {
                if tokio::signal::ctrl_c().await.is_ok() {
                    warn!("interrupt received; stopping after the current stage");
                    cancel.cancel();
                }
            });

            let summary = pipeline.run_once().await;
            if cli.json {
                print_json(&summary)?;
            } else {
                print!("{}", summary.quality.render());
                println!(
                    "run {}: {:?} in {} ms reports={}",
                    summary.run_id,
                    summary.status,
                    summary.duration_ms,
                    summary.reports_dir.as_deref().unwrap_or("-")
                );
            }
            if let RunStatus::Failed { stage, error } = &summary.status {
                bail!("run {} failed in {stage}: {error}", summary.run_id);
            }
        }
        Commands::Extract => {
            let report = pipeline.extract().await?;
            if cli.json {
                print_json(&report)?;
            } else {
                for (entity, extract) in &report.entities {
                    let (source, new, updated) = extract.counts();
                    println!("{entity}: source={source} new={new} updated={updated}");
                }
            }
        }
        Commands::Transform => print_transform(&pipeline.transform().await?, cli.json)?,
        Commands::Refresh => print_transform(&pipeline.full_refresh().await?, cli.json)?,
        Commands::Load => {
            let report = pipeline.load().await?;
            if cli.json {
                print_json(&report)?;
            } else {
                for (entity, load) in &report.entities {
                    println!(
                        "{entity}: rows={} synchronized={} inserted={}",
                        load.post_load_count, load.synchronized, load.inserted
                    );
                }
            }
        }
        Commands::Verify => {
            let statuses = pipeline.verify().await?;
            if cli.json {
                print_json(&statuses)?;
            } else {
                for status in &statuses {
                    println!(
                        "{}: transformed={} production={} synchronized={}",
                        status.entity,
                        status.transformed_count,
                        status.production_count,
                        status.synchronized
                    );
                }
            }
            if statuses.iter().any(|s| !s.synchronized) {
                bail!("stores are out of sync");
            }
        }
        Commands::Export => {
            for file in pipeline.export().await? {
                println!("{}: {} rows -> {}", file.entity, file.rows, file.path.display());
            }
        }
        Commands::Schedule => {
            let pipeline = Arc::new(pipeline);
            let mut sched = pipeline.build_scheduler().await?;
            sched.start().await.context("starting scheduler")?;
            info!(schedule = ?pipeline.config().schedule, "scheduler started");
            let first_pass = tokio::spawn({
                let pipeline = Arc::clone(&pipeline);
                async move { pipeline.scheduled_run().await }
            });

            tokio::signal::ctrl_c()
                .await
                .context("waiting for interrupt")?;
            warn!("interrupt received; stopping scheduler");
            pipeline.cancel_handle().cancel();
            sched.shutdown().await.context("stopping scheduler")?;
            if let Err(err) = first_pass.await {
                warn!(error = %err, "first pass did not finish cleanly");
            }
            let counts = pipeline.run_counts();
            info!(
                runs_total = counts.total,
                runs_succeeded = counts.succeeded,
                "scheduler stopped"
            );
        }
    }

    Ok(())
}
