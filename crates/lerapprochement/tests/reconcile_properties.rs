use std::collections::HashSet;

use chrono::NaiveDate;
use lerapprochement::{DateRange, Reconciler, SequenceRange, UniverseFilter};
use lestockage::{DataKind, MemoryStore, SqliteStore, Store, WorkItemId, WorkItemRecord};
use proptest::prelude::*;

fn universe(facilities: usize, days: u32, sequences: u32) -> UniverseFilter {
    let start = NaiveDate::from_ymd_opt(2024, 7, 1).unwrap();
    let end = NaiveDate::from_ymd_opt(2024, 7, days).unwrap();
    UniverseFilter::new(
        DataKind::Results,
        (1..=facilities).map(|f| format!("{f:02}")),
        DateRange::new(start, end).unwrap(),
        SequenceRange::new(1, sequences).unwrap(),
    )
    .unwrap()
}

proptest! {
    #[test]
    fn missing_has_exactly_n_minus_k_items(
        facilities in 1usize..4,
        days in 1u32..5,
        sequences in 1u32..6,
        picks in proptest::collection::vec(any::<bool>(), 0..120),
    ) {
        let filter = universe(facilities, days, sequences);
        let all: Vec<WorkItemId> = filter.universe().collect();
        let seeded: Vec<WorkItemId> = all
            .iter()
            .zip(picks.iter().chain(std::iter::repeat(&false)))
            .filter(|(_, keep)| **keep)
            .map(|(id, _)| id.clone())
            .collect();

        let reconciler = Reconciler::new(MemoryStore::with_items(DataKind::Results, seeded.clone()));
        let missing = reconciler.missing(&filter).unwrap();

        let n = filter.universe_len();
        let k = seeded.len();
        prop_assert_eq!(missing.len(), n - k);

        let unique: HashSet<_> = missing.iter().cloned().collect();
        prop_assert_eq!(unique.len(), missing.len(), "no duplicates");

        let seeded: HashSet<_> = seeded.into_iter().collect();
        for id in &all {
            prop_assert!(seeded.contains(id) ^ unique.contains(id));
        }
    }
}

#[test]
fn k_from_zero_to_n_on_sqlite() {
    let filter = universe(2, 2, 3);
    let all: Vec<WorkItemId> = filter.universe().collect();
    let n = all.len();

    for k in 0..=n {
        let store = SqliteStore::open_in_memory().unwrap();
        for id in &all[..k] {
            store
                .upsert(&WorkItemRecord::new(DataKind::Results, id.clone(), "{}"))
                .unwrap();
        }

        let missing = Reconciler::new(store).missing(&filter).unwrap();
        assert_eq!(missing.len(), n - k, "k = {k}");
        assert_eq!(missing.as_slice(), &all[k..]);
    }
}

#[test]
fn worked_scenario_twelve_items_five_stored() {
    let filter = universe(2, 3, 2);
    assert_eq!(filter.universe_len(), 12);

    let all: Vec<WorkItemId> = filter.universe().collect();
    let stored: Vec<WorkItemId> = all.iter().step_by(2).take(5).cloned().collect();
    let store = MemoryStore::with_items(DataKind::Results, stored.clone());
    let reconciler = Reconciler::new(store);

    let missing = reconciler.missing(&filter).unwrap();
    assert_eq!(missing.len(), 7);

    // Fetch all but one of the missing items.
    for id in missing.iter().skip(1) {
        reconciler
            .store()
            .upsert(&WorkItemRecord::new(DataKind::Results, id.clone(), "{}"))
            .unwrap();
    }

    let coverage = reconciler.coverage(&filter, |_, _| 2).unwrap();
    assert_eq!(coverage.total_existing(), 11);
    assert_eq!(coverage.total_expected(), 12);
}
