//! toystudy CLI

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use ts_batch::{BatchReport, JobLauncher, JobStore, Tracker};
use ts_core::{Error, JobDescriptor};

#[derive(Parser)]
#[command(name = "toystudy")]
#[command(about = "ToyStudy - toy-study batches on unreliable clusters")]
#[command(version)]
struct Cli {
    /// Log verbosity level (trace, debug, info, warn, error)
    #[arg(long, global = true, default_value = "warn")]
    log_level: tracing::Level,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Validate a batch configuration and create its job records
    Build {
        /// Batch configuration (YAML, or JSON by extension)
        #[arg(short, long)]
        config: PathBuf,

        /// Study root; the batch lives under `<root>/<batch_id>/`
        #[arg(long, default_value = ".")]
        root: PathBuf,

        /// Output file for the summary (pretty JSON). Defaults to stdout.
        #[arg(short, long)]
        output: Option<PathBuf>,
    },

    /// Submit and track a batch until every job is terminal
    Submit {
        /// Batch identifier
        #[arg(short, long)]
        batch: String,

        /// Study root
        #[arg(long, default_value = ".")]
        root: PathBuf,

        /// Run a single tracker pass and exit.
        #[arg(long)]
        once: bool,

        /// Threads for parallel submission (0 = auto).
        #[arg(long, default_value = "0")]
        threads: usize,

        /// Output file for the final report (pretty JSON). Defaults to stdout.
        #[arg(short, long)]
        output: Option<PathBuf>,
    },

    /// Show the persisted state of a batch
    Status {
        /// Batch identifier
        #[arg(short, long)]
        batch: String,

        /// Study root
        #[arg(long, default_value = ".")]
        root: PathBuf,

        /// Also list every job record.
        #[arg(long)]
        jobs: bool,

        /// Output file (pretty JSON). Defaults to stdout.
        #[arg(short, long)]
        output: Option<PathBuf>,
    },

    /// Request cancellation of a running batch
    Cancel {
        /// Batch identifier
        #[arg(short, long)]
        batch: String,

        /// Study root
        #[arg(long, default_value = ".")]
        root: PathBuf,
    },

    /// Execute one job (invoked by the cluster)
    RunJob {
        /// Job descriptor file
        #[arg(long)]
        descriptor: PathBuf,

        /// Attempt number (1-based)
        #[arg(long, default_value = "1")]
        attempt: u32,
    },

    /// Merge the results of a batch into `aggregate.json`
    Merge {
        /// Batch identifier
        #[arg(short, long)]
        batch: String,

        /// Study root
        #[arg(long, default_value = ".")]
        root: PathBuf,

        /// Output path. Defaults to `<root>/<batch_id>/aggregate.json`.
        #[arg(short, long)]
        output: Option<PathBuf>,
    },

    /// Bias, pull and coverage summary of a merged batch
    Analyze {
        /// Batch identifier
        #[arg(short, long)]
        batch: String,

        /// Study root
        #[arg(long, default_value = ".")]
        root: PathBuf,

        /// Aggregate to analyze. Defaults to the batch's `aggregate.json`.
        #[arg(short, long)]
        input: Option<PathBuf>,

        /// Override `analysis.min_succeeded`.
        #[arg(long)]
        min_succeeded: Option<usize>,

        /// Also use fits that did not converge.
        #[arg(long)]
        include_non_converged: bool,

        /// Output file (pretty JSON). Defaults to stdout.
        #[arg(short, long)]
        output: Option<PathBuf>,
    },

    /// Print version information
    Version,
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    // stdout carries the JSON output.
    tracing_subscriber::fmt()
        .with_max_level(cli.log_level)
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();

    match cli.command {
        Commands::Build { config, root, output } => cmd_build(&config, &root, output.as_ref()),
        Commands::Submit { batch, root, once, threads, output } => {
            cmd_submit(&root, &batch, once, threads, output.as_ref())
        }
        Commands::Status { batch, root, jobs, output } => cmd_status(&root, &batch, jobs, output.as_ref()),
        Commands::Cancel { batch, root } => cmd_cancel(&root, &batch),
        Commands::RunJob { descriptor, attempt } => cmd_run_job(&descriptor, attempt),
        Commands::Merge { batch, root, output } => cmd_merge(&root, &batch, output.as_ref()),
        Commands::Analyze { batch, root, input, min_succeeded, include_non_converged, output } => cmd_analyze(
            &root,
            &batch,
            input.as_ref(),
            min_succeeded,
            include_non_converged,
            output.as_ref(),
        ),
        Commands::Version => {
            println!("toystudy {}", ts_core::VERSION);
            Ok(())
        }
    }
}

fn write_json(output: Option<&PathBuf>, value: serde_json::Value) -> Result<()> {
    if let Some(path) = output {
        std::fs::write(path, serde_json::to_string_pretty(&value)?)?;
    } else {
        println!("{}", serde_json::to_string_pretty(&value)?);
    }
    Ok(())
}

fn cmd_build(config_path: &Path, root: &Path, output: Option<&PathBuf>) -> Result<()> {
    let config = ts_batch::read_batch_config(config_path)?;
    config.validate()?;
    ts_toys::ToyConfig::from_value(&config.payload_config())?.validate(config.kind)?;
    ts_syst::AnalysisConfig::from_value(&config.analysis)?;

    // Descriptors carry absolute paths so jobs can run from any directory.
    std::fs::create_dir_all(root)?;
    let root = std::fs::canonicalize(root).with_context(|| format!("study root {}", root.display()))?;
    let descriptors = ts_batch::build_from_config(&root, &config)?;
    let store = JobStore::new(ts_batch::BatchLayout::new(&root, &config.batch_id));
    let summary = store.init(&config, &descriptors)?;
    tracing::info!(
        batch = %config.batch_id,
        jobs = descriptors.len(),
        created = summary.created,
        kept = summary.kept,
        "batch built"
    );

    write_json(
        output,
        serde_json::json!({
            "batch_id": config.batch_id,
            "kind": config.kind,
            "n_jobs": descriptors.len(),
            "created": summary.created,
            "kept": summary.kept,
            "batch_dir": store.layout().batch_dir(),
        }),
    )
}

fn cmd_submit(root: &Path, batch: &str, once: bool, threads: usize, output: Option<&PathBuf>) -> Result<()> {
    if threads > 0 {
        // Best-effort; if a global pool already exists, keep going.
        let _ = rayon::ThreadPoolBuilder::new().num_threads(threads).build_global();
    }
    let root = std::fs::canonicalize(root).with_context(|| format!("study root {}", root.display()))?;
    let store = JobStore::open(&root, batch)?;
    let config = store.load_config()?;
    let adapter = ts_batch::adapter_for(&config.cluster);
    let program = std::env::current_exe().context("cannot locate the toystudy executable")?;
    let launcher = JobLauncher::from_config(&config.cluster, &program.display().to_string(), root);

    let mut tracker = Tracker::resume(store, adapter, launcher)?;
    let report = if once {
        tracker.tick_at(chrono::Utc::now())?
    } else {
        tracker.run()?
    };
    tracing::info!(
        batch = %report.batch_id,
        succeeded = report.count(ts_batch::JobStatus::Succeeded),
        abandoned = report.count(ts_batch::JobStatus::Abandoned),
        finished = report.is_finished(),
        "tracker stopped"
    );
    write_json(output, report_json(&report))
}

fn report_json(report: &BatchReport) -> serde_json::Value {
    serde_json::json!({
        "batch_id": report.batch_id,
        "total": report.total,
        "counts": report.counts,
        "finished": report.is_finished(),
        "cancelled": report.cancelled,
        "abandoned_fraction": report.abandoned_fraction(),
        "abandoned": report.abandoned,
    })
}

fn cmd_status(root: &Path, batch: &str, jobs: bool, output: Option<&PathBuf>) -> Result<()> {
    let store = JobStore::open(root, batch)?;
    let records = store.load_all()?;
    let report = BatchReport::from_records(batch, &records, store.cancel_requested());
    let mut value = report_json(&report);
    if jobs {
        let rows: Vec<serde_json::Value> = records
            .iter()
            .map(|r| {
                serde_json::json!({
                    "index": r.index(),
                    "status": r.status,
                    "attempts": r.attempt_count,
                    "handle": r.cluster_handle,
                    "last_update_time": r.last_update_time,
                    "retry_not_before": r.retry_not_before,
                    "error": r.error_detail,
                })
            })
            .collect();
        value["jobs"] = serde_json::Value::Array(rows);
    }
    write_json(output, value)
}

fn cmd_cancel(root: &Path, batch: &str) -> Result<()> {
    let store = JobStore::open(root, batch)?;
    store.request_cancel()?;
    tracing::info!(batch, "cancellation requested");
    println!("cancellation requested for batch {batch}");
    Ok(())
}

fn cmd_run_job(descriptor_path: &Path, attempt: u32) -> Result<()> {
    let descriptor: JobDescriptor = ts_core::io::read_json(descriptor_path)
        .with_context(|| format!("reading job descriptor {}", descriptor_path.display()))?;
    tracing::info!(job = %descriptor.job_name(attempt), kind = %descriptor.kind, "running job");
    let record = ts_toys::run_and_store(&descriptor, attempt)?;
    tracing::info!(
        job = %descriptor.job_name(attempt),
        status = %record.fit_status,
        wall_time_s = record.wall_time_s,
        "job complete"
    );
    Ok(())
}

fn cmd_merge(root: &Path, batch: &str, output: Option<&PathBuf>) -> Result<()> {
    let store = JobStore::open(root, batch)?;
    let config = store.load_config()?;
    let records = store.load_all()?;
    let target = output.cloned().unwrap_or_else(|| store.layout().aggregate());

    match ts_batch::merge(batch, config.n_toys, &records) {
        Ok(aggregate) => {
            ts_batch::write_aggregate(&target, &aggregate)?;
            tracing::info!(
                batch,
                succeeded = aggregate.total_succeeded,
                abandoned = aggregate.total_abandoned,
                path = %target.display(),
                "aggregate written"
            );
            write_json(
                None,
                serde_json::json!({
                    "batch_id": aggregate.batch_id,
                    "total_requested": aggregate.total_requested,
                    "total_succeeded": aggregate.total_succeeded,
                    "total_abandoned": aggregate.total_abandoned,
                    "missing_indices": aggregate.missing_indices,
                    "parameters": aggregate.parameter_names(),
                    "path": target,
                }),
            )
        }
        Err(Error::Merge { batch_id, issues, retained }) => {
            let partial = store.layout().partial_aggregate();
            ts_batch::write_aggregate(&partial, &retained)?;
            tracing::error!(batch = %batch_id, retained = retained.total_succeeded, path = %partial.display(), "merge failed");
            Err(Error::Merge { batch_id, issues, retained }.into())
        }
        Err(e) => Err(e.into()),
    }
}

fn cmd_analyze(
    root: &Path,
    batch: &str,
    input: Option<&PathBuf>,
    min_succeeded: Option<usize>,
    include_non_converged: bool,
    output: Option<&PathBuf>,
) -> Result<()> {
    let store = JobStore::open(root, batch)?;
    let mut config = ts_syst::AnalysisConfig::from_value(&store.load_config()?.analysis)?;
    if let Some(n) = min_succeeded {
        config.min_succeeded = n;
        config.validate()?;
    }
    config.include_non_converged |= include_non_converged;
    let path = input.cloned().unwrap_or_else(|| store.layout().aggregate());
    let aggregate = ts_batch::read_aggregate(&path)?;
    let report = ts_syst::analyze(&aggregate, &config)?;
    tracing::info!(batch, used = report.n_used, reduced = report.reduced_sample, "analysis complete");
    write_json(output, serde_json::to_value(&report)?)
}
