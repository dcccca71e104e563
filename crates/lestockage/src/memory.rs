// In-memory store

use crate::model::{DataKind, WorkItemId, WorkItemRecord};
use crate::store::{Result, Store, StoreError, StoreQuery};
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::RwLock;

/// Volatile [`Store`] keyed by `(kind, identity)`.
///
/// Counts bulk queries and can be switched offline to exercise the fatal
/// path of callers.
#[derive(Default)]
pub struct MemoryStore {
    items: RwLock<HashMap<(DataKind, WorkItemId), WorkItemRecord>>,
    existing_calls: AtomicUsize,
    offline: AtomicBool,
}

impl MemoryStore {
    /// Create an empty store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Seed the store with payload-less records of `kind`.
    pub fn with_items<I>(kind: DataKind, ids: I) -> Self
    where
        I: IntoIterator<Item = WorkItemId>,
    {
        let store = Self::new();
        if let Ok(mut items) = store.items.write() {
            for id in ids {
                items.insert((kind, id.clone()), WorkItemRecord::new(kind, id, ""));
            }
        }
        store
    }

    /// Number of stored records of `kind`.
    pub fn len(&self, kind: DataKind) -> usize {
        self.items
            .read()
            .map(|items| items.keys().filter(|(k, _)| *k == kind).count())
            .unwrap_or(0)
    }

    /// True when nothing is stored.
    pub fn is_empty(&self) -> bool {
        self.items.read().map(|items| items.is_empty()).unwrap_or(true)
    }

    /// How many bulk existence queries have been served.
    pub fn existing_calls(&self) -> usize {
        self.existing_calls.load(Ordering::SeqCst)
    }

    /// Make every subsequent operation fail with [`StoreError::Unavailable`].
    pub fn set_offline(&self, offline: bool) {
        self.offline.store(offline, Ordering::SeqCst);
    }

    fn check_online(&self) -> Result<()> {
        if self.offline.load(Ordering::SeqCst) {
            return Err(StoreError::Unavailable("memory store offline".to_string()));
        }
        Ok(())
    }

    fn poisoned() -> StoreError {
        StoreError::Unavailable("memory store lock poisoned".to_string())
    }
}

impl Store for MemoryStore {
    fn existing(&self, query: &StoreQuery) -> Result<HashSet<WorkItemId>> {
        self.check_online()?;
        self.existing_calls.fetch_add(1, Ordering::SeqCst);

        let items = self.items.read().map_err(|_| Self::poisoned())?;
        Ok(items
            .keys()
            .filter(|(kind, id)| *kind == query.kind && query.matches(id))
            .map(|(_, id)| id.clone())
            .collect())
    }

    fn contains(&self, kind: DataKind, id: &WorkItemId) -> Result<bool> {
        self.check_online()?;
        let items = self.items.read().map_err(|_| Self::poisoned())?;
        Ok(items.contains_key(&(kind, id.clone())))
    }

    fn upsert(&self, record: &WorkItemRecord) -> Result<()> {
        self.check_online()?;
        let mut items = self.items.write().map_err(|_| Self::poisoned())?;
        items.insert((record.kind, record.id.clone()), record.clone());
        Ok(())
    }

    fn ping(&self) -> Result<()> {
        self.check_online()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::NaiveDate;

    #[test]
    fn offline_store_reports_fatal_errors() {
        let store = MemoryStore::new();
        store.set_offline(true);

        let err = store.ping().unwrap_err();
        assert!(err.is_fatal());

        store.set_offline(false);
        assert!(store.ping().is_ok());
    }

    #[test]
    fn seeded_items_are_visible_per_kind() {
        let day = NaiveDate::from_ymd_opt(2024, 2, 1).unwrap();
        let store = MemoryStore::with_items(
            DataKind::Results,
            vec![WorkItemId::new("01", day, 1), WorkItemId::new("01", day, 2)],
        );

        assert_eq!(store.len(DataKind::Results), 2);
        assert_eq!(store.len(DataKind::Odds), 0);
        assert!(store
            .contains(DataKind::Results, &WorkItemId::new("01", day, 2))
            .unwrap());
    }
}
