//! lerapprochement - Reconciliation
//!
//! *Le Rapprochement* (The Reconciliation) - What should exist versus what the store holds

#![warn(missing_docs)]
#![warn(unused_extern_crates)]

/// Per-facility, per-date coverage statistics.
pub mod coverage;
/// Universe declaration: facilities, date range, sequence range.
pub mod filter;
/// The reconciler itself.
pub mod reconciler;

pub use coverage::{CoverageCell, CoverageReport};
pub use filter::{DateRange, SequenceRange, UniverseFilter};
pub use reconciler::{Reconciliation, Reconciler};

use lestockage::StoreError;
use thiserror::Error;

/// Errors raised while reconciling
#[derive(Debug, Error)]
pub enum ReconcileError {
    /// The bulk existence query failed
    #[error("Store error: {0}")]
    Store(#[from] StoreError),

    /// The declared universe is malformed
    #[error("Invalid universe: {0}")]
    InvalidFilter(String),
}

impl ReconcileError {
    /// True when the store itself is unusable.
    pub fn is_fatal(&self) -> bool {
        match self {
            ReconcileError::Store(err) => err.is_fatal(),
            ReconcileError::InvalidFilter(_) => false,
        }
    }
}

/// Result type for reconciliation
pub type Result<T> = std::result::Result<T, ReconcileError>;
