#![warn(missing_docs)]

//! lephase - phased batch workflows for LeRelais.
//!
//! A workflow walks its phases in order; each phase reconciles what should
//! exist against the store and fetches the difference through a bounded
//! pool, checkpointing as it goes so a killed run resumes where it stopped.

/// Fetch capability and the per-item fetch-and-store unit.
pub mod fetcher;
/// Phase identities and their per-phase policies.
pub mod phase;
/// Bounded-concurrency pool with per-item failure isolation.
pub mod pool;
/// Progress pushes into the job's progress record.
pub mod reporter;
/// Persisted per-phase checkpoints.
pub mod state;
/// Sequential, resumable phase runner.
pub mod workflow;

pub use fetcher::{FetchError, FetchUnit, Fetcher};
pub use phase::{DateWindow, Phase, PhaseConfig};
pub use pool::{
    ConcurrentFetchPool, PoolConfig, PoolError, PoolProgress, PoolReport, UnitError, UnitOutcome,
};
pub use reporter::ProgressReporter;
pub use state::{PhaseState, WorkflowState, STATE_SCHEMA_VERSION};
pub use workflow::{PhaseOutcome, PhasedWorkflow, WorkflowConfig, WorkflowReport};

use lerapprochement::ReconcileError;
use thiserror::Error;

/// Conditions that end a workflow run as failed.
#[derive(Debug, Error)]
pub enum WorkflowError {
    /// Checkpoint file could not be read or written
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Checkpoint file is not valid JSON
    #[error("Checkpoint format error: {0}")]
    Format(#[from] serde_json::Error),

    /// Checkpoint written by a newer release
    #[error("Unsupported checkpoint schema {found} (this build understands up to {supported})")]
    UnsupportedSchema {
        /// Version found on disk
        found: u32,
        /// Highest version this build reads
        supported: u32,
    },

    /// Workflow settings cannot run
    #[error("Invalid workflow configuration: {0}")]
    InvalidConfig(String),

    /// Reconciliation failed at phase entry
    #[error("Phase {phase}: reconciliation failed: {source}")]
    Reconcile {
        /// Phase being entered
        phase: Phase,
        /// Underlying error
        #[source]
        source: ReconcileError,
    },

    /// The phase's pool ended on a fatal error or its deadline
    #[error("Phase {phase}: {source}")]
    Phase {
        /// Phase that aborted
        phase: Phase,
        /// Underlying error
        #[source]
        source: PoolError,
    },
}

/// Result type for workflow operations
pub type Result<T> = std::result::Result<T, WorkflowError>;
