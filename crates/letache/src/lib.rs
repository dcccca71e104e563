//! letache - Background Job Lifecycle
//!
//! *La Tâche* (The Task) - One live instance per named job, surviving crashes without cleanup

#![warn(missing_docs)]
#![warn(unused_extern_crates)]

/// Start / query / cancel / complete facade.
pub mod controller;
/// Detached worker launch.
pub mod launcher;
/// Exclusive job slots.
pub mod lock;
/// OS process probing and signalling.
pub mod process;
/// Durable progress records.
pub mod progress;
/// Versioned lock and progress record types.
pub mod record;

mod fsutil;

pub use controller::{ControllerConfig, JobController, JobSummary, CRASHED_MESSAGE};
pub use launcher::{DefaultLauncher, LaunchSpec, ProcessLauncher};
pub use lock::{Acquisition, FsLockRegistry, LockRegistry};
pub use progress::{FsProgressStore, ProgressStore, ProgressUpdate};
pub use record::{JobRecord, JobStatus, ProgressRecord, PROGRESS_ERROR, SCHEMA_VERSION};

use thiserror::Error;

/// Errors that can occur in job control
#[derive(Debug, Error)]
pub enum JobError {
    /// Another live process holds the job slot
    #[error("Job '{job_name}' is already running (pid {pid})")]
    AlreadyRunning {
        /// Contended job name
        job_name: String,
        /// Process currently holding the slot
        pid: u32,
    },

    /// Job names become file names and must be plain
    #[error("Invalid job name '{0}': use 1-64 characters from [A-Za-z0-9_.-], not starting with '.'")]
    InvalidJobName(String),

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Record could not be encoded or decoded
    #[error("Record format error: {0}")]
    Format(#[from] serde_json::Error),

    /// Record written by a newer release
    #[error("Unsupported schema version {found} (this build understands up to {supported})")]
    UnsupportedSchema {
        /// Version found on disk
        found: u32,
        /// Highest version this build reads
        supported: u32,
    },

    /// The worker process could not be started
    #[error("Launch failed: {0}")]
    Launch(String),

    /// Acquisition kept colliding with concurrent reclaimers
    #[error("Lock for '{0}' is contended, retry shortly")]
    Contended(String),

    /// Delivering a signal failed
    #[error("Signal delivery to pid {pid} failed: {message}")]
    Signal {
        /// Target process
        pid: u32,
        /// OS error text
        message: String,
    },
}

impl JobError {
    /// True when the error is the "already running" conflict rather than a
    /// failure.
    pub fn is_conflict(&self) -> bool {
        matches!(self, JobError::AlreadyRunning { .. })
    }
}

/// Result type for job control
pub type Result<T> = std::result::Result<T, JobError>;

/// Check that `name` is usable as a job key.
pub fn validate_job_name(name: &str) -> Result<()> {
    let valid = !name.is_empty()
        && name.len() <= 64
        && !name.starts_with('.')
        && name
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '_' | '-' | '.'));
    if valid {
        Ok(())
    } else {
        Err(JobError::InvalidJobName(name.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    #[rstest]
    #[case("nightly-sync", true)]
    #[case("results_2024.q1", true)]
    #[case("", false)]
    #[case(".hidden", false)]
    #[case("../escape", false)]
    #[case("with space", false)]
    fn job_name_validation(#[case] name: &str, #[case] ok: bool) {
        assert_eq!(validate_job_name(name).is_ok(), ok, "{name:?}");
    }

    #[test]
    fn conflict_is_distinguishable() {
        let err = JobError::AlreadyRunning {
            job_name: "sync".into(),
            pid: 42,
        };
        assert!(err.is_conflict());
        assert!(err.to_string().contains("already running"));
        assert!(!JobError::Launch("boom".into()).is_conflict());
    }
}
