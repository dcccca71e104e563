// CLI Interface
//
// This module provides the command-line interface for LeRelais.

use crate::config::RelaisConfig;
use crate::http::HttpFetcher;
use anyhow::{bail, Context, Result as AnyhowResult};
use chrono::{NaiveDate, Utc};
use clap::{Args, Parser, Subcommand};
use lephase::{Phase, PhasedWorkflow, ProgressReporter, WorkflowConfig, WorkflowError, WorkflowReport};
use lerapprochement::{DateRange, Reconciler, SequenceRange, UniverseFilter};
use lestockage::{DataKind, SqliteStore, Store};
use letache::{FsProgressStore, JobController, JobSummary, ProgressRecord, ProgressStore};
use std::future::Future;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, info, warn};

/// LeRelais - Background fetch jobs with incremental reconciliation
#[derive(Parser, Debug)]
#[command(name = "lerelais")]
#[command(author = "LeRelais Contributors")]
#[command(version = env!("CARGO_PKG_VERSION"))]
#[command(about = "Run, watch, and cancel single-instance fetch jobs that only fetch what is missing", long_about = None)]
pub struct Cli {
    /// Path to the project directory
    #[arg(global = true, long = "project", short = 'p')]
    pub project_path: Option<PathBuf>,

    /// Enable verbose logging
    #[arg(global = true, long = "verbose", short = 'v')]
    pub verbose: bool,

    /// Subcommand to execute
    #[command(subcommand)]
    pub command: Commands,
}

/// Available CLI commands
#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Launch a detached worker for a job
    Start {
        /// Job name
        #[arg(value_name = "JOB")]
        job: String,

        /// Workflow options forwarded to the worker
        #[command(flatten)]
        run: RunArgs,
    },

    /// Show a job's progress record
    Status {
        /// Job name
        #[arg(value_name = "JOB")]
        job: String,

        /// Print the record as JSON
        #[arg(long = "json")]
        json: bool,
    },

    /// Stop a running job
    Cancel {
        /// Job name
        #[arg(value_name = "JOB")]
        job: String,
    },

    /// List every known job
    List {
        /// Print the jobs as JSON
        #[arg(long = "json")]
        json: bool,
    },

    /// Run the phased workflow in this process
    Run {
        /// Bind this process to a job slot and report progress into it
        #[arg(long = "job-name")]
        job_name: Option<String>,

        /// Workflow options
        #[command(flatten)]
        run: RunArgs,
    },

    /// Show stored versus expected items per facility and day
    Coverage {
        /// Data kind to inspect (programs, results, odds)
        #[arg(long = "kind", default_value = "results")]
        kind: String,

        /// First day (YYYY-MM-DD)
        #[arg(long = "start-date")]
        start_date: Option<NaiveDate>,

        /// Last day (YYYY-MM-DD)
        #[arg(long = "end-date")]
        end_date: Option<NaiveDate>,

        /// Facility code, repeatable; replaces the configured list
        #[arg(long = "facility")]
        facilities: Vec<String>,

        /// Print the report as JSON
        #[arg(long = "json")]
        json: bool,
    },

    /// Delete finished job records older than the notification window
    Prune {
        /// Retention in hours (default: state.progress_retention_hours)
        #[arg(long = "hours")]
        hours: Option<u64>,
    },
}

/// Options of one workflow run
#[derive(Args, Debug, Clone, Default, PartialEq)]
pub struct RunArgs {
    /// Continue from the saved checkpoint instead of starting over
    #[arg(long = "resume")]
    pub resume: bool,

    /// First day (YYYY-MM-DD)
    #[arg(long = "start-date")]
    pub start_date: Option<NaiveDate>,

    /// Last day (YYYY-MM-DD)
    #[arg(long = "end-date")]
    pub end_date: Option<NaiveDate>,

    /// Concurrent fetches in the programs phase
    #[arg(long = "workers-programs")]
    pub workers_programs: Option<usize>,

    /// Concurrent fetches in the results phase
    #[arg(long = "workers-results")]
    pub workers_results: Option<usize>,

    /// Concurrent fetches in the odds phase
    #[arg(long = "workers-odds")]
    pub workers_odds: Option<usize>,

    /// Facility code, repeatable; replaces the configured list
    #[arg(long = "facility")]
    pub facilities: Vec<String>,
}

impl RunArgs {
    /// Render back into command-line flags.
    pub fn to_args(&self) -> Vec<String> {
        let mut args = Vec::new();
        if self.resume {
            args.push("--resume".to_string());
        }
        if let Some(date) = self.start_date {
            args.extend(["--start-date".to_string(), date.to_string()]);
        }
        if let Some(date) = self.end_date {
            args.extend(["--end-date".to_string(), date.to_string()]);
        }
        for (flag, value) in [
            ("--workers-programs", self.workers_programs),
            ("--workers-results", self.workers_results),
            ("--workers-odds", self.workers_odds),
        ] {
            if let Some(n) = value {
                args.extend([flag.to_string(), n.to_string()]);
            }
        }
        for facility in &self.facilities {
            args.extend(["--facility".to_string(), facility.clone()]);
        }
        args
    }

    /// Apply the overrides to `config`.
    pub fn apply(&self, config: &mut RelaisConfig) {
        for (phase, value) in [
            (Phase::Programs, self.workers_programs),
            (Phase::Results, self.workers_results),
            (Phase::Odds, self.workers_odds),
        ] {
            if let Some(n) = value {
                config.phases.get_mut(phase).workers = n;
            }
        }
        if !self.facilities.is_empty() {
            config.universe.facilities = self.facilities.clone();
        }
    }
}

impl Cli {
    /// Run the CLI
    pub async fn run(self) -> AnyhowResult<()> {
        // Initialize logging
        init_logging_impl(self.verbose);

        // Absolute, since the detached worker gets it on its command line
        let cwd = std::env::current_dir().context("Failed to get current directory")?;
        let project = match self.project_path {
            Some(path) => cwd.join(path),
            None => cwd,
        };
        let config = RelaisConfig::load(&project)?;

        match self.command {
            Commands::Start { job, run } => cmd_start(&project, &config, &job, &run),
            Commands::Status { job, json } => cmd_status(&project, &config, &job, json),
            Commands::Cancel { job } => cmd_cancel(&project, &config, &job),
            Commands::List { json } => cmd_list(&project, &config, json),
            Commands::Run { job_name, run } => cmd_run(&project, config, job_name, run).await,
            Commands::Coverage {
                kind,
                start_date,
                end_date,
                facilities,
                json,
            } => cmd_coverage(&project, config, &kind, start_date, end_date, facilities, json),
            Commands::Prune { hours } => cmd_prune(&project, &config, hours),
        }
    }
}

/// How long detached blocking work may hold up exit once a command returned.
pub const SHUTDOWN_GRACE: Duration = Duration::from_secs(2);

/// Drive `future` to completion on a fresh multi-thread runtime.
///
/// Blocking tasks still running afterwards (a fetch cut off by the pool
/// deadline, say) get `grace` to finish before the runtime is torn down
/// without them.
pub fn block_on_with_grace<F: Future>(future: F, grace: Duration) -> AnyhowResult<F::Output> {
    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .context("Failed to build the async runtime")?;
    let output = runtime.block_on(future);
    runtime.shutdown_timeout(grace);
    Ok(output)
}

fn controller(project: &Path, config: &RelaisConfig) -> JobController {
    JobController::open(config.controller_config(project))
}

fn cmd_start(project: &Path, config: &RelaisConfig, job: &str, run: &RunArgs) -> AnyhowResult<()> {
    // A worker that would reject its own flags is never launched.
    prepare_run(config, run, Utc::now().date_naive())
        .with_context(|| format!("Refusing to start job '{}'", job))?;

    let exe = std::env::current_exe().context("Failed to locate the lerelais executable")?;
    let args = worker_args(project, job, run);

    match controller(project, config).start(job, &exe, &args) {
        Ok(pid) => {
            println!("Started job '{}' (pid {})", job, pid);
            println!(
                "Log: {}",
                config.controller_config(project).log_path(job).display()
            );
            Ok(())
        }
        Err(err) if err.is_conflict() => bail!("{}", err),
        Err(err) => Err(err).with_context(|| format!("Failed to start job '{}'", job)),
    }
}

/// Settings of one workflow run, checked before any worker exists.
#[derive(Debug, Clone)]
pub struct RunPlan {
    /// Configuration with the run's overrides applied
    pub config: RelaisConfig,
    /// Days to cover
    pub dates: DateRange,
    /// Sequence numbers per day
    pub sequences: SequenceRange,
    /// Reference day for date windows
    pub today: NaiveDate,
}

/// Apply `run` to `config` and check the result can drive a workflow.
pub fn prepare_run(config: &RelaisConfig, run: &RunArgs, today: NaiveDate) -> AnyhowResult<RunPlan> {
    let mut config = config.clone();
    run.apply(&mut config);
    config.validate()?;
    if config.universe.facilities.is_empty() {
        bail!("no facilities: set universe.facilities or pass --facility");
    }

    let dates = config.date_range(run.start_date, run.end_date, today)?;
    let sequences = config.sequences()?;
    Ok(RunPlan {
        config,
        dates,
        sequences,
        today,
    })
}

/// Command line of the detached worker for `job`.
pub fn worker_args(project: &Path, job: &str, run: &RunArgs) -> Vec<String> {
    let mut args = vec![
        "--project".to_string(),
        project.display().to_string(),
        "run".to_string(),
        "--job-name".to_string(),
        job.to_string(),
    ];
    args.extend(run.to_args());
    args
}

fn cmd_status(project: &Path, config: &RelaisConfig, job: &str, json: bool) -> AnyhowResult<()> {
    let record = controller(project, config)
        .progress(job)
        .with_context(|| format!("Failed to read progress of '{}'", job))?;

    match (record, json) {
        (Some(record), true) => println!("{}", serde_json::to_string_pretty(&record)?),
        (Some(record), false) => println!("{}", format_record(&record)),
        (None, true) => println!("null"),
        (None, false) => println!("No record for job '{}'", job),
    }
    Ok(())
}

/// One-line human rendering of a progress record.
pub fn format_record(record: &ProgressRecord) -> String {
    let progress = if record.is_error() {
        "--".to_string()
    } else {
        format!("{}%", record.progress)
    };
    let mut line = format!("{:<24} {:<10} {:>4}", record.job_name, record.status.as_str(), progress);
    if let Some(step) = &record.step {
        line.push_str(&format!("  [{}]", step));
    }
    if let Some(message) = &record.message {
        line.push_str(&format!("  {}", message));
    }
    line
}

fn cmd_cancel(project: &Path, config: &RelaisConfig, job: &str) -> AnyhowResult<()> {
    let cancelled = controller(project, config)
        .cancel(job)
        .with_context(|| format!("Failed to cancel '{}'", job))?;
    if cancelled {
        println!("Cancelled job '{}'", job);
    } else {
        println!("Job '{}' is not running", job);
    }
    Ok(())
}

fn cmd_list(project: &Path, config: &RelaisConfig, json: bool) -> AnyhowResult<()> {
    let jobs = controller(project, config).list_all().context("Failed to list jobs")?;

    if json {
        let rows: Vec<_> = jobs
            .iter()
            .map(|job| {
                serde_json::json!({
                    "job_name": job.job_name,
                    "alive": job.alive,
                    "pid": job.lock.as_ref().map(|l| l.pid),
                    "progress": job.progress,
                })
            })
            .collect();
        println!("{}", serde_json::to_string_pretty(&rows)?);
        return Ok(());
    }

    if jobs.is_empty() {
        println!("No jobs");
    }
    for job in &jobs {
        println!("{}", format_summary(job));
    }
    Ok(())
}

fn format_summary(job: &JobSummary) -> String {
    let pid = match (&job.lock, job.alive) {
        (Some(lock), true) => format!("pid {}", lock.pid),
        _ => "-".to_string(),
    };
    match &job.progress {
        Some(record) => format!("{}  {}", format_record(record), pid),
        None => format!("{:<24} {:<10} {:>4}  {}", job.job_name, "locked", "", pid),
    }
}

async fn cmd_run(
    project: &Path,
    config: RelaisConfig,
    job_name: Option<String>,
    run: RunArgs,
) -> AnyhowResult<()> {
    let today = Utc::now().date_naive();

    let Some(job) = job_name else {
        let plan = prepare_run(&config, &run, today)?;
        let report = execute(project, &plan, run.resume, None).await?;
        println!("{}", report.summary());
        return Ok(());
    };

    let controller = controller(project, &config);
    let exe = std::env::current_exe().context("Failed to locate the lerelais executable")?;
    let argv: Vec<String> = std::env::args().skip(1).collect();
    controller
        .attach(
            &job,
            exe,
            &argv,
            Duration::from_secs(config.state.handoff_wait_secs),
        )
        .with_context(|| format!("Failed to attach to job '{}'", job))?;
    info!(job = %job, pid = std::process::id(), "worker attached");

    // From here on every failure, setup included, lands in the job's record.
    let outcome = match prepare_run(&config, &run, today) {
        Ok(plan) => {
            let store: Arc<dyn ProgressStore> =
                Arc::new(FsProgressStore::new(controller.config().progress_dir()));
            let reporter = ProgressReporter::new(job.clone(), store, plan.config.pool.progress_every);
            execute(project, &plan, run.resume, Some((&job, reporter))).await
        }
        Err(err) => Err(err),
    };

    match outcome {
        Ok(report) => {
            let record = controller.complete(&job, !report.stopped, &report.summary())?;
            info!(job = %job, status = %record.status, "{}", report.summary());
            println!("{}", report.summary());
            Ok(())
        }
        Err(err) => {
            let message = failure_message(&err);
            error!(job = %job, error = %message, "workflow failed");
            if let Err(finalize) = controller.complete(&job, false, &message) {
                warn!(job = %job, error = %finalize, "could not record failure");
            }
            Err(err)
        }
    }
}

/// Short message stored in the progress record of a failed run.
fn failure_message(err: &anyhow::Error) -> String {
    match err.downcast_ref::<WorkflowError>() {
        Some(workflow) => workflow.to_string(),
        None => format!("{:#}", err),
    }
}

async fn execute(
    project: &Path,
    plan: &RunPlan,
    resume: bool,
    job: Option<(&str, ProgressReporter)>,
) -> AnyhowResult<WorkflowReport> {
    let config = &plan.config;

    let store_config = config.storage_config(project);
    let store: Arc<dyn Store> = Arc::new(
        SqliteStore::open_with_config(store_config.clone())
            .with_context(|| format!("Failed to open store at {:?}", store_config.db_path))?,
    );

    // The blocking client owns its own runtime thread; build it off the async workers.
    let source = config.source.clone();
    let fetcher = tokio::task::spawn_blocking(move || HttpFetcher::new(&source))
        .await
        .context("HTTP client setup panicked")??;

    let state_name = job.as_ref().map(|(name, _)| *name).unwrap_or("default");
    let mut workflow_config = WorkflowConfig::new(
        config.workflow_state_path(project, state_name),
        config.universe.facilities.clone(),
        plan.dates,
        plan.sequences,
    )
    .with_phases(config.phase_plan())
    .with_today(plan.today);
    workflow_config.pool_timeout = Duration::from_secs(config.pool.timeout_secs);
    workflow_config.item_timeout = config.pool.item_timeout();

    let stop = Arc::new(AtomicBool::new(false));
    spawn_stop_listener(Arc::clone(&stop));

    let mut workflow = PhasedWorkflow::new(workflow_config, store, Arc::new(fetcher)).with_stop_flag(stop);
    if let Some((_, reporter)) = job {
        workflow = workflow.with_reporter(reporter);
    }

    info!(
        start = %plan.dates.start,
        end = %plan.dates.end,
        facilities = config.universe.facilities.len(),
        resume,
        "workflow starting"
    );
    Ok(workflow.run(resume).await?)
}

/// Raise `stop` on Ctrl-C or SIGTERM so in-flight items finish before exit.
fn spawn_stop_listener(stop: Arc<AtomicBool>) {
    tokio::spawn(async move {
        wait_for_shutdown().await;
        warn!("stop requested, finishing in-flight items");
        stop.store(true, Ordering::SeqCst);
    });
}

#[cfg(unix)]
async fn wait_for_shutdown() {
    use tokio::signal::unix::{signal, SignalKind};

    match signal(SignalKind::terminate()) {
        Ok(mut term) => {
            tokio::select! {
                _ = tokio::signal::ctrl_c() => {}
                _ = term.recv() => {}
            }
        }
        Err(err) => {
            warn!(error = %err, "cannot listen for SIGTERM, Ctrl-C only");
            let _ = tokio::signal::ctrl_c().await;
        }
    }
}

#[cfg(not(unix))]
async fn wait_for_shutdown() {
    let _ = tokio::signal::ctrl_c().await;
}

fn cmd_coverage(
    project: &Path,
    mut config: RelaisConfig,
    kind: &str,
    start_date: Option<NaiveDate>,
    end_date: Option<NaiveDate>,
    facilities: Vec<String>,
    json: bool,
) -> AnyhowResult<()> {
    let Some(kind) = DataKind::from_str_name(kind) else {
        bail!("Unknown data kind '{}' (expected programs, results or odds)", kind);
    };
    if !facilities.is_empty() {
        config.universe.facilities = facilities;
    }

    let dates = config.date_range(start_date, end_date, Utc::now().date_naive())?;
    let sequences = config.sequences()?;
    let filter = UniverseFilter::new(kind, config.universe.facilities.iter().cloned(), dates, sequences)
        .context("Invalid universe")?;

    let store = SqliteStore::open_with_config(config.storage_config(project)).context("Failed to open store")?;
    let report = Reconciler::new(store)
        .scheduled_coverage(&filter)
        .context("Coverage query failed")?;

    if json {
        println!("{}", serde_json::to_string_pretty(&report)?);
        return Ok(());
    }

    for (facility, date, cell) in report.iter() {
        let mark = if cell.is_complete() { "" } else { "  incomplete" };
        println!("{:<8} {}  {:>4}/{:<4}{}", facility, date, cell.existing, cell.expected, mark);
    }
    for (facility, total) in report.facility_totals() {
        println!("{:<8} total       {:>4}/{:<4}", facility, total.existing, total.expected);
    }
    println!(
        "{}: {}/{} stored ({:.1}%)",
        kind,
        report.total_existing(),
        report.total_expected(),
        report.ratio() * 100.0
    );
    Ok(())
}

fn cmd_prune(project: &Path, config: &RelaisConfig, hours: Option<u64>) -> AnyhowResult<()> {
    let hours = hours.unwrap_or(config.state.progress_retention_hours);
    let removed = controller(project, config)
        .prune(Duration::from_secs(hours * 3600))
        .context("Failed to prune job records")?;
    println!("Removed {} finished job record(s) older than {}h", removed, hours);
    Ok(())
}

/// Initialize logging
///
/// `RUST_LOG` wins when set; otherwise `info`, or `debug` with `--verbose`.
/// Output goes to stderr so detached workers log into their job log.
fn init_logging_impl(verbose: bool) {
    use tracing_subscriber::EnvFilter;

    let fallback = if verbose { "debug" } else { "info" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(fallback));

    let subscriber = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .finish();

    let _ = tracing::subscriber::set_global_default(subscriber);
}
