//! Durable progress records
//!
//! One record per job, written by the running worker and finalized once by
//! completion, cancellation, or crash reaping. Records outlive the lock and
//! are pruned after a notification window.

use chrono::{DateTime, Utc};
use std::path::{Path, PathBuf};
use tracing::{debug, warn};

use crate::fsutil::{list_with_extension, lock_dir, read_json, remove_if_exists, write_json_atomic, DirGuard};
use crate::record::{JobStatus, ProgressRecord};
use crate::{validate_job_name, Result};

/// Mid-run mutation pushed by a worker.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ProgressUpdate {
    /// New percentage, clamped to `[0, 100]`
    pub progress: Option<i32>,
    /// New step label
    pub step: Option<String>,
    /// New message
    pub message: Option<String>,
}

impl ProgressUpdate {
    /// Update carrying a percentage and step label.
    pub fn at(progress: i32, step: impl Into<String>) -> Self {
        Self {
            progress: Some(progress),
            step: Some(step.into()),
            message: None,
        }
    }

    /// Attach a message.
    pub fn with_message(mut self, message: impl Into<String>) -> Self {
        self.message = Some(message.into());
        self
    }
}

/// Storage of per-job progress records.
pub trait ProgressStore: Send + Sync {
    /// Write a fresh record, replacing any left from an earlier run.
    fn seed(&self, record: &ProgressRecord) -> Result<()>;

    /// Apply a mid-run update.
    ///
    /// Returns `None` without writing when no record exists or the record is
    /// already terminal, so a late update cannot resurrect a finished job.
    fn update(&self, job_name: &str, update: ProgressUpdate) -> Result<Option<ProgressRecord>>;

    /// Move the record to a terminal status, overwriting whatever is there.
    fn finalize(&self, job_name: &str, status: JobStatus, message: &str) -> Result<ProgressRecord>;

    /// Finalize only the still-running record of the run started at
    /// `started_at`.
    ///
    /// Returns `None` without writing when the record is missing, already
    /// terminal, or belongs to a later run.
    fn finalize_if(
        &self,
        job_name: &str,
        started_at: DateTime<Utc>,
        status: JobStatus,
        message: &str,
    ) -> Result<Option<ProgressRecord>>;

    /// Current record, if any.
    fn get(&self, job_name: &str) -> Result<Option<ProgressRecord>>;

    /// All records.
    fn list(&self) -> Result<Vec<ProgressRecord>>;

    /// Delete a record. Returns whether one existed.
    fn remove(&self, job_name: &str) -> Result<bool>;

    /// Delete terminal records completed before `cutoff`. Returns how many.
    fn prune(&self, cutoff: DateTime<Utc>) -> Result<usize>;
}

/// Progress store backed by one JSON file per job.
#[derive(Debug, Clone)]
pub struct FsProgressStore {
    dir: PathBuf,
}

impl FsProgressStore {
    /// Store keeping records under `dir`.
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    /// Directory holding the records.
    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn path_for(&self, job_name: &str) -> PathBuf {
        self.dir.join(format!("{}.progress", job_name))
    }

    fn guard(&self) -> Result<DirGuard> {
        lock_dir(&self.dir, ".store.guard")
    }

    fn read(&self, job_name: &str) -> Result<Option<ProgressRecord>> {
        match read_json::<ProgressRecord>(&self.path_for(job_name))? {
            Some(record) => {
                record.check_schema()?;
                Ok(Some(record))
            }
            None => Ok(None),
        }
    }
}

impl ProgressStore for FsProgressStore {
    fn seed(&self, record: &ProgressRecord) -> Result<()> {
        validate_job_name(&record.job_name)?;
        let _guard = self.guard()?;
        write_json_atomic(&self.path_for(&record.job_name), record)
    }

    fn update(&self, job_name: &str, update: ProgressUpdate) -> Result<Option<ProgressRecord>> {
        validate_job_name(job_name)?;
        let _guard = self.guard()?;

        let Some(mut record) = self.read(job_name)? else {
            debug!(job = job_name, "progress update for unknown job ignored");
            return Ok(None);
        };
        if record.status.is_terminal() {
            debug!(job = job_name, status = %record.status, "progress update after finish ignored");
            return Ok(None);
        }

        if let Some(progress) = update.progress {
            record.progress = progress.clamp(0, 100);
        }
        if update.step.is_some() {
            record.step = update.step;
        }
        if update.message.is_some() {
            record.message = update.message;
        }
        record.status = JobStatus::Running;
        record.updated_at = Utc::now();

        write_json_atomic(&self.path_for(job_name), &record)?;
        Ok(Some(record))
    }

    fn finalize(&self, job_name: &str, status: JobStatus, message: &str) -> Result<ProgressRecord> {
        validate_job_name(job_name)?;
        let _guard = self.guard()?;

        let mut record = self
            .read(job_name)?
            .unwrap_or_else(|| ProgressRecord::started(job_name));
        record.finish(status, message);
        write_json_atomic(&self.path_for(job_name), &record)?;

        debug!(job = job_name, status = %status, "progress finalized");
        Ok(record)
    }

    fn finalize_if(
        &self,
        job_name: &str,
        started_at: DateTime<Utc>,
        status: JobStatus,
        message: &str,
    ) -> Result<Option<ProgressRecord>> {
        validate_job_name(job_name)?;
        let _guard = self.guard()?;

        match self.read(job_name)? {
            Some(mut record) if !record.status.is_terminal() && record.started_at == started_at => {
                record.finish(status, message);
                write_json_atomic(&self.path_for(job_name), &record)?;
                debug!(job = job_name, status = %status, "progress finalized");
                Ok(Some(record))
            }
            _ => {
                debug!(job = job_name, "record moved on, not finalizing");
                Ok(None)
            }
        }
    }

    fn get(&self, job_name: &str) -> Result<Option<ProgressRecord>> {
        validate_job_name(job_name)?;
        self.read(job_name)
    }

    fn list(&self) -> Result<Vec<ProgressRecord>> {
        let mut records = Vec::new();
        for path in list_with_extension(&self.dir, "progress")? {
            match read_json::<ProgressRecord>(&path) {
                Ok(Some(record)) => records.push(record),
                Ok(None) => {}
                Err(err) => {
                    warn!(path = %path.display(), error = %err, "skipping unreadable progress record")
                }
            }
        }
        Ok(records)
    }

    fn remove(&self, job_name: &str) -> Result<bool> {
        validate_job_name(job_name)?;
        let _guard = self.guard()?;
        remove_if_exists(&self.path_for(job_name))
    }

    fn prune(&self, cutoff: DateTime<Utc>) -> Result<usize> {
        let _guard = self.guard()?;
        let mut removed = 0;
        for record in self.list()? {
            let expired = record.status.is_terminal()
                && record.completed_at.map(|at| at < cutoff).unwrap_or(false);
            if expired && remove_if_exists(&self.path_for(&record.job_name))? {
                removed += 1;
            }
        }
        if removed > 0 {
            debug!(removed, "pruned expired progress records");
        }
        Ok(removed)
    }
}
