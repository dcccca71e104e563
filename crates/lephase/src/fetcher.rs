//! Fetch capability and the per-item unit built on it

use std::sync::Arc;

use lestockage::{DataKind, Store, WorkItemId, WorkItemRecord};
use thiserror::Error;
use tracing::debug;

use crate::pool::{UnitError, UnitOutcome};

/// Why a single fetch failed.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum FetchError {
    /// The source has no such item (e.g. a cancelled event)
    #[error("not found at source")]
    NotFound,

    /// The source answered with an error for this item
    #[error("fetch failed: {0}")]
    Failed(String),

    /// The request for this item timed out
    #[error("fetch timed out")]
    Timeout,

    /// The source cannot be reached at all
    #[error("source unreachable: {0}")]
    Unreachable(String),
}

impl FetchError {
    /// True when no further item can succeed.
    pub fn is_fatal(&self) -> bool {
        matches!(self, FetchError::Unreachable(_))
    }
}

/// Blocking access to the external data source.
///
/// Given one work item, returns its raw payload. Parsing the payload is the
/// source-specific parser's concern.
pub trait Fetcher: Send + Sync {
    /// Retrieve the payload of `id` for `kind`.
    fn fetch(&self, kind: DataKind, id: &WorkItemId) -> Result<String, FetchError>;
}

impl<F: Fetcher + ?Sized> Fetcher for Arc<F> {
    fn fetch(&self, kind: DataKind, id: &WorkItemId) -> Result<String, FetchError> {
        (**self).fetch(kind, id)
    }
}

/// Fetch-and-store for one work item.
///
/// Rechecks the store first so an item stored since the phase's bulk
/// reconciliation (e.g. by a run that was killed) is skipped, not fetched.
pub struct FetchUnit {
    kind: DataKind,
    store: Arc<dyn Store>,
    fetcher: Arc<dyn Fetcher>,
}

impl FetchUnit {
    /// Unit fetching `kind` items into `store`.
    pub fn new(kind: DataKind, store: Arc<dyn Store>, fetcher: Arc<dyn Fetcher>) -> Self {
        Self {
            kind,
            store,
            fetcher,
        }
    }

    /// Process one item.
    pub fn run(&self, id: &WorkItemId) -> Result<UnitOutcome, UnitError> {
        match self.store.contains(self.kind, id) {
            Ok(true) => {
                debug!(kind = %self.kind, item = %id, "already stored, skipping");
                return Ok(UnitOutcome::Skipped);
            }
            Ok(false) => {}
            Err(e) if e.is_fatal() => return Err(UnitError::Fatal(format!("store: {}", e))),
            Err(e) => return Err(UnitError::Failed(format!("{}: store check: {}", id, e))),
        }

        let payload = match self.fetcher.fetch(self.kind, id) {
            Ok(payload) => payload,
            Err(e) if e.is_fatal() => return Err(UnitError::Fatal(e.to_string())),
            Err(e) => return Err(UnitError::Failed(format!("{}: {}", id, e))),
        };

        let record = WorkItemRecord::new(self.kind, id.clone(), payload);
        match self.store.upsert(&record) {
            Ok(()) => Ok(UnitOutcome::Processed),
            Err(e) if e.is_fatal() => Err(UnitError::Fatal(format!("store: {}", e))),
            Err(e) => Err(UnitError::Failed(format!("{}: store write: {}", id, e))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::NaiveDate;
    use lestockage::MemoryStore;

    struct Scripted(Result<String, FetchError>);

    impl Fetcher for Scripted {
        fn fetch(&self, _kind: DataKind, _id: &WorkItemId) -> Result<String, FetchError> {
            self.0.clone()
        }
    }

    fn id() -> WorkItemId {
        WorkItemId::new("05", NaiveDate::from_ymd_opt(2024, 6, 2).unwrap(), 3)
    }

    fn unit(store: Arc<MemoryStore>, result: Result<String, FetchError>) -> FetchUnit {
        FetchUnit::new(DataKind::Results, store, Arc::new(Scripted(result)))
    }

    #[test]
    fn fetched_payload_is_stored() {
        let store = Arc::new(MemoryStore::new());
        let outcome = unit(store.clone(), Ok("<html/>".into())).run(&id()).unwrap();
        assert_eq!(outcome, UnitOutcome::Processed);
        assert!(store.contains(DataKind::Results, &id()).unwrap());
    }

    #[test]
    fn stored_item_is_skipped() {
        let store = Arc::new(MemoryStore::with_items(DataKind::Results, vec![id()]));
        let outcome = unit(store, Err(FetchError::Failed("must not be called".into())))
            .run(&id())
            .unwrap();
        assert_eq!(outcome, UnitOutcome::Skipped);
    }

    #[test]
    fn errors_are_classified() {
        let store = Arc::new(MemoryStore::new());
        assert!(matches!(
            unit(store.clone(), Err(FetchError::NotFound)).run(&id()),
            Err(UnitError::Failed(_))
        ));
        assert!(matches!(
            unit(store.clone(), Err(FetchError::Timeout)).run(&id()),
            Err(UnitError::Failed(_))
        ));
        assert!(matches!(
            unit(store.clone(), Err(FetchError::Unreachable("dns".into()))).run(&id()),
            Err(UnitError::Fatal(_))
        ));

        store.set_offline(true);
        assert!(matches!(
            unit(store, Ok("x".into())).run(&id()),
            Err(UnitError::Fatal(_))
        ));
    }
}
