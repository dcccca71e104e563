//! Store capability
//!
//! The workflow only ever talks to storage through [`Store`]: one bulk
//! existence query per reconciliation, a point lookup before each fetch, and
//! an upsert per fetched item.

use crate::model::{DataKind, WorkItemId, WorkItemRecord};
use chrono::NaiveDate;
use rusqlite::ErrorCode;
use std::collections::HashSet;
use std::sync::Arc;
use thiserror::Error;

/// Errors raised by store backends
#[derive(Debug, Error)]
pub enum StoreError {
    /// Database error
    #[error("Database error: {0}")]
    Database(#[from] rusqlite::Error),

    /// The backend cannot be reached at all
    #[error("Store unavailable: {0}")]
    Unavailable(String),

    /// A stored row could not be decoded
    #[error("Corrupt row: {0}")]
    Corrupt(String),
}

impl StoreError {
    /// True when the failure means the store as a whole is unusable, as
    /// opposed to one bad row or one rejected write.
    pub fn is_fatal(&self) -> bool {
        match self {
            StoreError::Unavailable(_) => true,
            StoreError::Database(rusqlite::Error::SqliteFailure(err, _)) => matches!(
                err.code,
                ErrorCode::CannotOpen
                    | ErrorCode::DatabaseCorrupt
                    | ErrorCode::NotADatabase
                    | ErrorCode::DiskFull
                    | ErrorCode::SystemIoFailure
                    | ErrorCode::ReadOnly
            ),
            _ => false,
        }
    }
}

/// Result type for store operations
pub type Result<T> = std::result::Result<T, StoreError>;

/// Bounds of one bulk existence query.
///
/// Both ranges are inclusive. An empty facility list matches nothing.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoreQuery {
    /// Data category to look in
    pub kind: DataKind,
    /// Facilities to include
    pub facilities: Vec<String>,
    /// First date (inclusive)
    pub date_from: NaiveDate,
    /// Last date (inclusive)
    pub date_to: NaiveDate,
    /// First sequence number (inclusive)
    pub sequence_from: u32,
    /// Last sequence number (inclusive)
    pub sequence_to: u32,
}

impl StoreQuery {
    /// Whether an identity falls inside the query bounds.
    pub fn matches(&self, id: &WorkItemId) -> bool {
        id.date >= self.date_from
            && id.date <= self.date_to
            && id.sequence >= self.sequence_from
            && id.sequence <= self.sequence_to
            && self.facilities.iter().any(|f| f == &id.facility)
    }
}

/// Persistence capability used by reconciliation and the workflow.
pub trait Store: Send + Sync {
    /// Every stored identity inside `query`, in a single round trip.
    fn existing(&self, query: &StoreQuery) -> Result<HashSet<WorkItemId>>;

    /// Whether one identity is already stored for `kind`.
    fn contains(&self, kind: DataKind, id: &WorkItemId) -> Result<bool>;

    /// Insert or replace one record.
    fn upsert(&self, record: &WorkItemRecord) -> Result<()>;

    /// Cheap reachability check, run by the workflow as each phase starts.
    fn ping(&self) -> Result<()>;
}

impl<S: Store + ?Sized> Store for Arc<S> {
    fn existing(&self, query: &StoreQuery) -> Result<HashSet<WorkItemId>> {
        (**self).existing(query)
    }

    fn contains(&self, kind: DataKind, id: &WorkItemId) -> Result<bool> {
        (**self).contains(kind, id)
    }

    fn upsert(&self, record: &WorkItemRecord) -> Result<()> {
        (**self).upsert(record)
    }

    fn ping(&self) -> Result<()> {
        (**self).ping()
    }
}
