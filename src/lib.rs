//! LeRelais - crash-tolerant background fetch jobs with incremental
//! reconciliation.
//!
//! The facade re-exports the member crates:
//!
//! - [`stockage`]: the work-item store and its SQLite backend
//! - [`rapprochement`]: universe-versus-store reconciliation
//! - [`tache`]: single-instance job locks, progress records, detached launch
//! - [`phase`]: the phased, resumable fetch workflow
//! - `passerelle` (feature `cli`): command line, configuration, HTTP source

#![warn(missing_docs)]

pub use lephase as phase;
pub use lerapprochement as rapprochement;
pub use lestockage as stockage;
pub use letache as tache;

#[cfg(feature = "cli")]
pub use lepasserelle as passerelle;

pub use lephase::{Fetcher, PhasedWorkflow, WorkflowConfig};
pub use lerapprochement::{Reconciler, UniverseFilter};
pub use lestockage::{SqliteStore, Store};
pub use letache::JobController;
