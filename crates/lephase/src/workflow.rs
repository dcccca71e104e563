//! Phased, resumable fetch workflow
//!
//! Phases run strictly in sequence. Each one reconciles its universe against
//! the store, fans the missing items through a [`ConcurrentFetchPool`], and
//! checkpoints its [`PhaseState`](crate::state::PhaseState) whether or not
//! some items failed. A resumed run skips completed phases and re-enters the
//! first incomplete one; the per-item store recheck makes re-entry safe after
//! a kill at any point.

use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::{NaiveDate, Utc};
use lerapprochement::{DateRange, ReconcileError, Reconciler, SequenceRange, UniverseFilter};
use lestockage::Store;
use tracing::{debug, info, warn};

use crate::fetcher::{FetchUnit, Fetcher};
use crate::phase::{Phase, PhaseConfig};
use crate::pool::{ConcurrentFetchPool, PoolConfig, PoolReport, DEFAULT_ITEM_TIMEOUT, DEFAULT_POOL_TIMEOUT};
use crate::reporter::ProgressReporter;
use crate::state::WorkflowState;
use crate::{Result, WorkflowError};

/// What a workflow run covers and how.
#[derive(Debug, Clone)]
pub struct WorkflowConfig {
    /// Phases to run, in order, with their policies
    pub phases: Vec<(Phase, PhaseConfig)>,
    /// Facilities in every phase's universe
    pub facilities: Vec<String>,
    /// Requested date range, before each phase's window applies
    pub dates: DateRange,
    /// Sequence numbers per facility and date
    pub sequences: SequenceRange,
    /// Ceiling on one phase's pool run
    pub pool_timeout: Duration,
    /// Ceiling on one item
    pub item_timeout: Option<Duration>,
    /// Checkpoint file
    pub state_path: PathBuf,
    /// Reference day for date windows
    pub today: NaiveDate,
}

impl WorkflowConfig {
    /// All phases with their default policies.
    pub fn new(
        state_path: impl Into<PathBuf>,
        facilities: Vec<String>,
        dates: DateRange,
        sequences: SequenceRange,
    ) -> Self {
        Self {
            phases: Phase::ALL.iter().map(|p| (*p, p.default_config())).collect(),
            facilities,
            dates,
            sequences,
            pool_timeout: DEFAULT_POOL_TIMEOUT,
            item_timeout: Some(DEFAULT_ITEM_TIMEOUT),
            state_path: state_path.into(),
            today: Utc::now().date_naive(),
        }
    }

    /// Replace the phase list.
    pub fn with_phases(mut self, phases: Vec<(Phase, PhaseConfig)>) -> Self {
        self.phases = phases;
        self
    }

    /// Override the reference day.
    pub fn with_today(mut self, today: NaiveDate) -> Self {
        self.today = today;
        self
    }

    fn validate(&self) -> Result<()> {
        if self.phases.is_empty() {
            return Err(WorkflowError::InvalidConfig("no phases configured".into()));
        }
        if self.facilities.is_empty() {
            return Err(WorkflowError::InvalidConfig("no facilities configured".into()));
        }
        for (phase, config) in &self.phases {
            if config.workers == 0 {
                return Err(WorkflowError::InvalidConfig(format!(
                    "phase {} needs at least one worker",
                    phase
                )));
            }
        }
        let mut seen: Vec<Phase> = self.phases.iter().map(|(p, _)| *p).collect();
        seen.sort();
        seen.dedup();
        if seen.len() != self.phases.len() {
            return Err(WorkflowError::InvalidConfig("phase listed twice".into()));
        }
        Ok(())
    }
}

/// Result of one phase within a run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PhaseOutcome {
    /// Phase
    pub phase: Phase,
    /// True when the phase had completed in an earlier run and was skipped
    pub resumed: bool,
    /// Universe size after the date window
    pub universe: usize,
    /// Items missing at phase entry
    pub missing: usize,
    /// Pool counters
    pub report: PoolReport,
}

/// Result of a whole run.
#[derive(Debug, Clone)]
pub struct WorkflowReport {
    /// Per-phase outcomes, in execution order
    pub phases: Vec<PhaseOutcome>,
    /// True when the stop flag ended the run early
    pub stopped: bool,
    /// Final checkpoint
    pub state: WorkflowState,
}

impl WorkflowReport {
    /// Items fetched in this run.
    pub fn processed(&self) -> usize {
        self.phases.iter().map(|p| p.report.processed).sum()
    }

    /// Items that failed in this run.
    pub fn errored(&self) -> usize {
        self.phases.iter().map(|p| p.report.errored).sum()
    }

    /// One-line summary for the job's final message.
    pub fn summary(&self) -> String {
        let skipped: usize = self.phases.iter().map(|p| p.report.skipped).sum();
        let head = if self.stopped { "stopped" } else { "completed" };
        format!(
            "{}: {} fetched, {} skipped, {} errors",
            head,
            self.processed(),
            skipped,
            self.errored()
        )
    }
}

/// Sequential phase runner.
pub struct PhasedWorkflow {
    config: WorkflowConfig,
    store: Arc<dyn Store>,
    fetcher: Arc<dyn Fetcher>,
    reporter: ProgressReporter,
    stop: Arc<AtomicBool>,
}

impl PhasedWorkflow {
    /// Workflow fetching through `fetcher` into `store`.
    pub fn new(config: WorkflowConfig, store: Arc<dyn Store>, fetcher: Arc<dyn Fetcher>) -> Self {
        Self {
            config,
            store,
            fetcher,
            reporter: ProgressReporter::disabled(),
            stop: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Push progress through `reporter`.
    pub fn with_reporter(mut self, reporter: ProgressReporter) -> Self {
        self.reporter = reporter;
        self
    }

    /// Share `stop` with a signal handler; raising it stops at the next item.
    pub fn with_stop_flag(mut self, stop: Arc<AtomicBool>) -> Self {
        self.stop = stop;
        self
    }

    /// The stop flag.
    pub fn stop_flag(&self) -> Arc<AtomicBool> {
        Arc::clone(&self.stop)
    }

    /// Active settings.
    pub fn config(&self) -> &WorkflowConfig {
        &self.config
    }

    /// Universe of `phase` under `config`; `None` when its date window leaves
    /// no day.
    pub fn filter_for(&self, phase: Phase, config: &PhaseConfig) -> Result<Option<UniverseFilter>> {
        let Some(dates) = config.date_window.apply(self.config.dates, self.config.today) else {
            return Ok(None);
        };
        let filter = UniverseFilter::new(
            phase.kind(),
            self.config.facilities.iter().cloned(),
            dates,
            self.config.sequences,
        )
        .map_err(|source| WorkflowError::Reconcile { phase, source })?;
        Ok(Some(filter))
    }

    /// Run every phase not yet completed.
    ///
    /// With `resume`, completed phases of the saved checkpoint are skipped;
    /// without it the checkpoint starts over. Per-item failures are counted,
    /// never returned; only fatal conditions produce an error.
    pub async fn run(&self, resume: bool) -> Result<WorkflowReport> {
        self.config.validate()?;

        let order: Vec<Phase> = self.config.phases.iter().map(|(p, _)| *p).collect();
        let path = &self.config.state_path;
        let mut state = WorkflowState::load_or_new(path, &order, resume)?;
        if resume {
            info!(next = ?state.first_incomplete(), "resuming workflow");
        }
        state.save_to_path(path)?;

        let count = order.len();
        let mut outcomes = Vec::with_capacity(count);
        let mut stopped = false;

        for (index, (phase, phase_config)) in self.config.phases.iter().enumerate() {
            let phase = *phase;

            if state.is_completed(phase) {
                info!(%phase, "phase already completed, skipping");
                let entry = state.phase_mut(phase);
                outcomes.push(PhaseOutcome {
                    phase,
                    resumed: true,
                    universe: entry.counter("universe") as usize,
                    missing: entry.counter("missing") as usize,
                    report: PoolReport::default(),
                });
                continue;
            }
            if self.stop.load(Ordering::SeqCst) {
                stopped = true;
                break;
            }

            let Some(filter) = self.filter_for(phase, phase_config)? else {
                info!(%phase, window = ?phase_config.date_window, "date window is empty, nothing to do");
                let entry = state.phase_mut(phase);
                entry.completed = true;
                entry.counters.clear();
                state.save_to_path(path)?;
                self.reporter
                    .phase_finished(index, count, phase, &PoolReport::default());
                outcomes.push(PhaseOutcome {
                    phase,
                    resumed: false,
                    universe: 0,
                    missing: 0,
                    report: PoolReport::default(),
                });
                continue;
            };

            // An unreachable store ends the run before any item is dispatched.
            self.store.ping().map_err(|err| WorkflowError::Reconcile {
                phase,
                source: ReconcileError::Store(err),
            })?;
            debug!(%phase, "store reachable");

            let reconciliation = Reconciler::new(Arc::clone(&self.store))
                .reconcile(&filter)
                .map_err(|source| WorkflowError::Reconcile { phase, source })?;
            let universe = reconciliation.universe_size;
            let missing = reconciliation.missing.len();
            info!(
                %phase,
                universe,
                existing = reconciliation.existing.len(),
                missing,
                workers = phase_config.workers,
                "phase starting"
            );
            self.reporter.phase_started(index, count, phase, missing);

            let pool = ConcurrentFetchPool::with_stop_flag(
                PoolConfig {
                    workers: phase_config.workers,
                    timeout: self.config.pool_timeout,
                    item_timeout: self.config.item_timeout,
                },
                Arc::clone(&self.stop),
            );
            let unit = FetchUnit::new(phase.kind(), Arc::clone(&self.store), Arc::clone(&self.fetcher));
            let reporter = self.reporter.clone();
            let result = pool
                .run(
                    reconciliation.missing,
                    move |id| unit.run(&id),
                    |progress| reporter.item_done(index, count, phase, &progress),
                )
                .await;

            let report = match &result {
                Ok(report) => *report,
                Err(err) => *err.report(),
            };
            let entry = state.phase_mut(phase);
            entry.set_counter("universe", universe as u64);
            entry.set_counter("missing", missing as u64);
            entry.set_counter("processed", report.processed as u64);
            entry.set_counter("errored", report.errored as u64);
            entry.set_counter("skipped", report.skipped as u64);
            entry.completed = result.is_ok() && !report.stopped;
            state.save_to_path(path)?;

            if let Err(source) = result {
                return Err(WorkflowError::Phase { phase, source });
            }

            outcomes.push(PhaseOutcome {
                phase,
                resumed: false,
                universe,
                missing,
                report,
            });

            if report.stopped {
                warn!(%phase, done = report.done(), missing, "stop requested, phase left incomplete");
                stopped = true;
                break;
            }

            self.reporter.phase_finished(index, count, phase, &report);
            info!(
                %phase,
                processed = report.processed,
                skipped = report.skipped,
                errored = report.errored,
                "phase completed"
            );
        }

        Ok(WorkflowReport {
            phases: outcomes,
            stopped,
            state,
        })
    }
}
