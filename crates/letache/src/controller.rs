//! Job control facade
//!
//! [`JobController`] composes a lock registry, a progress store and a
//! launcher into the start / progress / cancel / complete lifecycle. Every
//! terminal path releases the lock, including a worker crash discovered later
//! by a status query.

use chrono::Utc;
use std::collections::BTreeMap;
use std::path::PathBuf;
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

use crate::launcher::{DefaultLauncher, LaunchSpec, ProcessLauncher};
use crate::lock::{Acquisition, FsLockRegistry, LockRegistry};
use crate::process;
use crate::progress::{FsProgressStore, ProgressStore, ProgressUpdate};
use crate::record::{JobRecord, JobStatus, ProgressRecord};
use crate::{validate_job_name, JobError, Result};

/// Message stored when a running job's worker vanished.
pub const CRASHED_MESSAGE: &str = "worker exited unexpectedly";

/// How long a force-killed worker gets to disappear.
const KILL_WAIT: Duration = Duration::from_secs(5);

/// Controller settings.
#[derive(Debug, Clone)]
pub struct ControllerConfig {
    /// Root of lock, progress, workflow-state and log files
    pub state_dir: PathBuf,
    /// Time a worker gets to exit after the terminate signal
    pub cancel_grace: Duration,
    /// Interval between liveness polls
    pub poll_interval: Duration,
    /// Working directory for launched workers
    pub workdir: Option<PathBuf>,
}

impl Default for ControllerConfig {
    fn default() -> Self {
        Self {
            state_dir: PathBuf::from(".lerelais/state"),
            cancel_grace: Duration::from_secs(10),
            poll_interval: Duration::from_millis(100),
            workdir: None,
        }
    }
}

impl ControllerConfig {
    /// Defaults rooted at `state_dir`.
    pub fn new(state_dir: impl Into<PathBuf>) -> Self {
        Self {
            state_dir: state_dir.into(),
            ..Self::default()
        }
    }

    /// Directory of lock records.
    pub fn locks_dir(&self) -> PathBuf {
        self.state_dir.join("locks")
    }

    /// Directory of progress records.
    pub fn progress_dir(&self) -> PathBuf {
        self.state_dir.join("progress")
    }

    /// Directory of worker logs.
    pub fn logs_dir(&self) -> PathBuf {
        self.state_dir.join("logs")
    }

    /// Log file for one job's worker.
    pub fn log_path(&self, job_name: &str) -> PathBuf {
        self.logs_dir().join(format!("{}.log", job_name))
    }
}

/// One row of [`JobController::list_all`].
#[derive(Debug, Clone, PartialEq)]
pub struct JobSummary {
    /// Job key
    pub job_name: String,
    /// Latest progress record
    pub progress: Option<ProgressRecord>,
    /// Current lock record
    pub lock: Option<JobRecord>,
    /// Whether the lock holder is running
    pub alive: bool,
}

/// Start / query / cancel / complete facade over the job primitives.
pub struct JobController<
    L: LockRegistry = FsLockRegistry,
    P: ProgressStore = FsProgressStore,
    X: ProcessLauncher = DefaultLauncher,
> {
    config: ControllerConfig,
    locks: L,
    progress: P,
    launcher: X,
}

impl JobController {
    /// Controller on the file-backed registry and store under
    /// `config.state_dir`, launching with the platform launcher.
    pub fn open(config: ControllerConfig) -> Self {
        let locks = FsLockRegistry::new(config.locks_dir());
        let progress = FsProgressStore::new(config.progress_dir());
        Self::with_parts(config, locks, progress, DefaultLauncher::default())
    }
}

impl<L: LockRegistry, P: ProgressStore, X: ProcessLauncher> JobController<L, P, X> {
    /// Controller over custom parts.
    pub fn with_parts(config: ControllerConfig, locks: L, progress: P, launcher: X) -> Self {
        Self {
            config,
            locks,
            progress,
            launcher,
        }
    }

    /// Active settings.
    pub fn config(&self) -> &ControllerConfig {
        &self.config
    }

    /// Underlying lock registry.
    pub fn locks(&self) -> &L {
        &self.locks
    }

    /// Underlying progress store.
    pub fn progress_store(&self) -> &P {
        &self.progress
    }

    /// Launch `command` as the detached worker of `job_name`.
    ///
    /// Fails with [`JobError::AlreadyRunning`] while a live worker holds the
    /// slot. A lock left by a dead worker is reclaimed silently. Returns the
    /// worker pid.
    pub fn start(&self, job_name: &str, command: impl Into<PathBuf>, args: &[String]) -> Result<u32> {
        validate_job_name(job_name)?;
        let command = command.into();
        let claim = JobRecord::claim(job_name, command.clone(), args);

        if let Acquisition::AlreadyRunning(holder) = self.locks.acquire(&claim)? {
            return Err(JobError::AlreadyRunning {
                job_name: job_name.to_string(),
                pid: holder.pid,
            });
        }

        if let Err(err) = self.progress.seed(&ProgressRecord::started(job_name)) {
            self.release_quietly(job_name);
            return Err(err);
        }

        let spec = LaunchSpec {
            job_name: job_name.to_string(),
            program: command,
            args: args.to_vec(),
            workdir: self.config.workdir.clone(),
            log_path: Some(self.config.log_path(job_name)),
        };
        let pid = match self.launcher.launch(&spec) {
            Ok(pid) => pid,
            Err(err) => {
                warn!(job = job_name, error = %err, "worker launch failed");
                let _ = self
                    .progress
                    .finalize(job_name, JobStatus::Failed, &format!("failed to launch worker: {}", err));
                self.release_quietly(job_name);
                return Err(err);
            }
        };

        if let Err(err) = self.locks.assign(&claim.handed_to(pid)) {
            // The lock still names this process; a worker it does not track
            // must not keep running.
            warn!(job = job_name, pid, error = %err, "lock handoff failed, stopping worker");
            let _ = process::terminate(pid);
            let _ = self
                .progress
                .finalize(job_name, JobStatus::Failed, "failed to record worker");
            self.release_quietly(job_name);
            return Err(err);
        }

        info!(job = job_name, pid, "job started");
        Ok(pid)
    }

    /// Bind the current process to `job_name` as its worker.
    ///
    /// A worker launched by [`start`](Self::start) waits up to `handoff_wait`
    /// for the controller to hand the lock over. A worker started directly
    /// takes a free or stale slot itself and seeds its own progress record.
    pub fn attach(
        &self,
        job_name: &str,
        command: impl Into<PathBuf>,
        args: &[String],
        handoff_wait: Duration,
    ) -> Result<()> {
        validate_job_name(job_name)?;
        let own = std::process::id();
        let claim = JobRecord::claim(job_name, command, args);
        let deadline = Instant::now() + handoff_wait;

        loop {
            match self.locks.holder(job_name)? {
                Some(holder) if holder.pid == own => {
                    debug!(job = job_name, pid = own, "worker attached to handed-over lock");
                    return Ok(());
                }
                Some(holder) if holder.is_alive() => {
                    if Instant::now() >= deadline {
                        return Err(JobError::AlreadyRunning {
                            job_name: job_name.to_string(),
                            pid: holder.pid,
                        });
                    }
                    std::thread::sleep(self.config.poll_interval);
                }
                _ => {
                    if let Acquisition::Locked = self.locks.acquire(&claim)? {
                        if let Err(err) = self.progress.seed(&ProgressRecord::started(job_name)) {
                            self.release_quietly(job_name);
                            return Err(err);
                        }
                        debug!(job = job_name, pid = own, "worker took the slot directly");
                        return Ok(());
                    }
                }
            }
        }
    }

    /// Push a mid-run update for `job_name`.
    pub fn report(&self, job_name: &str, update: ProgressUpdate) -> Result<Option<ProgressRecord>> {
        self.progress.update(job_name, update)
    }

    /// Current progress of `job_name`.
    ///
    /// A running record whose worker is gone is finalized as failed and its
    /// lock released before being returned. If another start took the slot
    /// over in the meantime, that newer run is returned untouched.
    pub fn progress(&self, job_name: &str) -> Result<Option<ProgressRecord>> {
        match self.progress.get(job_name)? {
            Some(record) if !record.status.is_terminal() => {
                let holder = self.locks.holder(job_name)?;
                let alive = holder.as_ref().map(JobRecord::is_alive).unwrap_or(false);
                if alive {
                    Ok(Some(record))
                } else {
                    self.reap(&record, holder.as_ref()).map(Some)
                }
            }
            other => Ok(other),
        }
    }

    /// Stop `job_name`.
    ///
    /// Sends the terminate signal, waits up to the grace period, then kills.
    /// The record ends `cancelled` and the lock is released whether or not
    /// the worker was still running. Returns `false` when no lock existed.
    pub fn cancel(&self, job_name: &str) -> Result<bool> {
        validate_job_name(job_name)?;

        let Some(holder) = self.locks.holder(job_name)? else {
            if let Some(record) = self.progress.get(job_name)? {
                if !record.status.is_terminal() {
                    self.progress
                        .finalize(job_name, JobStatus::Cancelled, "cancelled (no running worker)")?;
                }
            }
            debug!(job = job_name, "cancel requested but no lock held");
            return Ok(false);
        };

        if holder.pid != std::process::id() && holder.is_alive() {
            self.stop_worker(&holder);
        }

        let finalized = self
            .progress
            .finalize(job_name, JobStatus::Cancelled, "cancelled by request");
        let released = self.locks.release(job_name);
        finalized?;
        released?;

        info!(job = job_name, pid = holder.pid, "job cancelled");
        Ok(true)
    }

    /// Record the natural end of `job_name` and free its slot.
    ///
    /// A job already marked cancelled keeps that status.
    pub fn complete(&self, job_name: &str, success: bool, message: &str) -> Result<ProgressRecord> {
        validate_job_name(job_name)?;

        let status = if success {
            JobStatus::Completed
        } else {
            JobStatus::Failed
        };
        let finalized = match self.progress.get(job_name) {
            Ok(Some(record)) if record.status == JobStatus::Cancelled => Ok(record),
            _ => self.progress.finalize(job_name, status, message),
        };
        let released = self.locks.release(job_name);
        let record = finalized?;
        released?;

        info!(job = job_name, status = %record.status, "job finished");
        Ok(record)
    }

    /// Every known job: progress records merged with lock state, sorted by
    /// name. Crashed workers are reaped on the way.
    pub fn list_all(&self) -> Result<Vec<JobSummary>> {
        let mut rows: BTreeMap<String, JobSummary> = BTreeMap::new();

        for record in self.progress.list()? {
            rows.insert(
                record.job_name.clone(),
                JobSummary {
                    job_name: record.job_name.clone(),
                    progress: Some(record),
                    lock: None,
                    alive: false,
                },
            );
        }
        for lock in self.locks.list()? {
            let alive = lock.is_alive();
            let row = rows.entry(lock.job_name.clone()).or_insert_with(|| JobSummary {
                job_name: lock.job_name.clone(),
                progress: None,
                lock: None,
                alive: false,
            });
            row.alive = alive;
            row.lock = Some(lock);
        }

        for row in rows.values_mut() {
            let running = row
                .progress
                .as_ref()
                .map(|p| !p.status.is_terminal())
                .unwrap_or(false);
            if !running || row.alive {
                continue;
            }
            let Some(seen) = row.progress.clone() else {
                continue;
            };
            let current = self.reap(&seen, row.lock.as_ref())?;
            if current.status.is_terminal() {
                row.lock = None;
                row.alive = false;
            } else {
                row.lock = self.locks.holder(&row.job_name)?;
                row.alive = row.lock.as_ref().map(JobRecord::is_alive).unwrap_or(false);
            }
            row.progress = Some(current);
        }

        Ok(rows.into_values().collect())
    }

    /// Delete terminal progress records older than `retention`.
    pub fn prune(&self, retention: Duration) -> Result<usize> {
        let retention = chrono::Duration::from_std(retention)
            .unwrap_or_else(|_| chrono::Duration::days(365 * 100));
        self.progress.prune(Utc::now() - retention)
    }

    /// Fail the run `seen` whose lock holder `holder` was found dead.
    ///
    /// Both writes are conditional: the lock goes only if it still names
    /// `holder`, the record only if it is still the run started at
    /// `seen.started_at`. Otherwise the current record is returned as is.
    fn reap(&self, seen: &ProgressRecord, holder: Option<&JobRecord>) -> Result<ProgressRecord> {
        let job_name = seen.job_name.as_str();

        if let Some(holder) = holder {
            if !self.locks.release_if(holder)? {
                debug!(job = job_name, "slot taken over before reaping, leaving it");
                return self.current_or(seen);
            }
        }

        match self
            .progress
            .finalize_if(job_name, seen.started_at, JobStatus::Failed, CRASHED_MESSAGE)?
        {
            Some(record) => {
                warn!(job = job_name, "worker is gone, marked job failed");
                Ok(record)
            }
            None => self.current_or(seen),
        }
    }

    fn current_or(&self, seen: &ProgressRecord) -> Result<ProgressRecord> {
        Ok(self
            .progress
            .get(&seen.job_name)?
            .unwrap_or_else(|| seen.clone()))
    }

    fn stop_worker(&self, holder: &JobRecord) {
        let pid = holder.pid;
        let started = holder.process_started_at;

        if let Err(err) = process::terminate(pid) {
            warn!(job = %holder.job_name, pid, error = %err, "terminate signal failed");
        }
        if process::wait_for_exit(pid, started, self.config.cancel_grace, self.config.poll_interval) {
            debug!(job = %holder.job_name, pid, "worker exited after terminate");
            return;
        }

        warn!(
            job = %holder.job_name,
            pid,
            grace_secs = self.config.cancel_grace.as_secs(),
            "worker ignored terminate, killing"
        );
        if let Err(err) = process::kill(pid) {
            warn!(job = %holder.job_name, pid, error = %err, "kill failed");
        }
        process::wait_for_exit(pid, started, KILL_WAIT, self.config.poll_interval);
    }

    fn release_quietly(&self, job_name: &str) {
        if let Err(err) = self.locks.release(job_name) {
            warn!(job = job_name, error = %err, "failed to release lock");
        }
    }
}
