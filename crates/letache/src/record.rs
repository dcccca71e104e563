use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

use crate::{process, JobError, Result};

/// Current on-disk format of lock and progress records.
pub const SCHEMA_VERSION: u32 = 1;

/// Progress value marking an error state.
pub const PROGRESS_ERROR: i32 = -1;

/// Lock record: who holds a job slot.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobRecord {
    /// Format version
    pub schema_version: u32,
    /// Unique job key
    pub job_name: String,
    /// Holder process id
    pub pid: u32,
    /// Holder start time (seconds since epoch), used to detect pid reuse
    #[serde(default)]
    pub process_started_at: Option<u64>,
    /// Program launched for the job
    pub command: PathBuf,
    /// Arguments passed to the program
    pub args: Vec<String>,
    /// When the slot was taken
    pub started_at: DateTime<Utc>,
}

impl JobRecord {
    /// Record naming the current process as holder.
    ///
    /// Written on acquisition, before the worker exists; replaced once the
    /// worker is launched.
    pub fn claim(job_name: &str, command: impl Into<PathBuf>, args: &[String]) -> Self {
        let pid = std::process::id();
        Self {
            schema_version: SCHEMA_VERSION,
            job_name: job_name.to_string(),
            pid,
            process_started_at: process::start_time(pid),
            command: command.into(),
            args: args.to_vec(),
            started_at: Utc::now(),
        }
    }

    /// Same record, now held by `pid`.
    pub fn handed_to(&self, pid: u32) -> Self {
        Self {
            pid,
            process_started_at: process::start_time(pid),
            ..self.clone()
        }
    }

    /// Whether the holder process still runs.
    pub fn is_alive(&self) -> bool {
        process::is_alive(self.pid, self.process_started_at)
    }

    pub(crate) fn check_schema(&self) -> Result<()> {
        check_schema(self.schema_version)
    }
}

pub(crate) fn check_schema(found: u32) -> Result<()> {
    if found > SCHEMA_VERSION {
        return Err(JobError::UnsupportedSchema {
            found,
            supported: SCHEMA_VERSION,
        });
    }
    Ok(())
}

/// Job lifecycle status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    /// Accepted, worker not yet reporting
    Pending,
    /// Worker running
    Running,
    /// Finished, possibly with per-item errors
    Completed,
    /// Aborted by a fatal condition or a crash
    Failed,
    /// Stopped on request
    Cancelled,
}

impl JobStatus {
    /// True once the job can no longer change state.
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            JobStatus::Completed | JobStatus::Failed | JobStatus::Cancelled
        )
    }

    /// Lowercase label.
    pub fn as_str(self) -> &'static str {
        match self {
            JobStatus::Pending => "pending",
            JobStatus::Running => "running",
            JobStatus::Completed => "completed",
            JobStatus::Failed => "failed",
            JobStatus::Cancelled => "cancelled",
        }
    }
}

impl std::fmt::Display for JobStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Durable progress of one job, readable after the job ends.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProgressRecord {
    /// Format version
    pub schema_version: u32,
    /// Unique job key
    pub job_name: String,
    /// Lifecycle status
    pub status: JobStatus,
    /// Percentage in `[0, 100]`, or [`PROGRESS_ERROR`]
    pub progress: i32,
    /// Short label of the current step
    pub step: Option<String>,
    /// Human-readable message
    pub message: Option<String>,
    /// When the job started
    pub started_at: DateTime<Utc>,
    /// Last mutation
    pub updated_at: DateTime<Utc>,
    /// When the job reached a terminal status
    pub completed_at: Option<DateTime<Utc>>,
}

impl ProgressRecord {
    /// Fresh running record at 0%.
    pub fn started(job_name: &str) -> Self {
        let now = Utc::now();
        Self {
            schema_version: SCHEMA_VERSION,
            job_name: job_name.to_string(),
            status: JobStatus::Running,
            progress: 0,
            step: Some("starting".to_string()),
            message: None,
            started_at: now,
            updated_at: now,
            completed_at: None,
        }
    }

    /// Move to a terminal status.
    pub fn finish(&mut self, status: JobStatus, message: impl Into<String>) {
        let now = Utc::now();
        self.status = status;
        self.progress = match status {
            JobStatus::Completed => 100,
            JobStatus::Failed => PROGRESS_ERROR,
            _ => self.progress,
        };
        self.message = Some(message.into());
        self.updated_at = now;
        self.completed_at = Some(now);
    }

    /// True when the record shows an error state.
    pub fn is_error(&self) -> bool {
        self.progress < 0 || self.status == JobStatus::Failed
    }

    pub(crate) fn check_schema(&self) -> Result<()> {
        check_schema(self.schema_version)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn claim_names_current_process() {
        let claim = JobRecord::claim("sync", "/usr/bin/true", &["--resume".to_string()]);
        assert_eq!(claim.pid, std::process::id());
        assert_eq!(claim.schema_version, SCHEMA_VERSION);
        assert!(claim.is_alive());
    }

    #[test]
    fn finish_sets_sentinel_on_failure() {
        let mut record = ProgressRecord::started("sync");
        record.progress = 40;
        record.finish(JobStatus::Failed, "store unreachable");
        assert_eq!(record.progress, PROGRESS_ERROR);
        assert!(record.is_error());
        assert!(record.completed_at.is_some());

        let mut cancelled = ProgressRecord::started("sync");
        cancelled.progress = 40;
        cancelled.finish(JobStatus::Cancelled, "cancelled");
        assert_eq!(cancelled.progress, 40);
    }

    #[test]
    fn newer_schema_is_rejected() {
        let mut record = ProgressRecord::started("sync");
        record.schema_version = SCHEMA_VERSION + 1;
        assert!(matches!(
            record.check_schema(),
            Err(JobError::UnsupportedSchema { .. })
        ));
    }

    #[test]
    fn lock_record_without_start_time_still_parses() {
        let json = r#"{
            "schema_version": 1,
            "job_name": "sync",
            "pid": 1,
            "command": "/bin/worker",
            "args": [],
            "started_at": "2024-05-01T00:00:00Z"
        }"#;
        let record: JobRecord = serde_json::from_str(json).unwrap();
        assert_eq!(record.process_started_at, None);
    }
}
