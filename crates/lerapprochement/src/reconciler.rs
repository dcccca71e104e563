//! Universe-versus-store reconciliation
//!
//! One bulk existence query per call, then a hash-set difference against the
//! lazily enumerated universe. Cost against the store never depends on the
//! universe size.

use std::collections::{HashMap, HashSet};

use chrono::NaiveDate;
use lestockage::{DataKind, Store, WorkItemId};
use tracing::debug;

use crate::coverage::CoverageReport;
use crate::filter::UniverseFilter;
use crate::Result;

/// Partition of a universe into stored and missing items.
#[derive(Debug, Clone, Default)]
pub struct Reconciliation {
    /// Size of the declared universe
    pub universe_size: usize,
    /// Items already present in the store
    pub existing: HashSet<WorkItemId>,
    /// Items still to fetch, in universe order
    pub missing: Vec<WorkItemId>,
}

impl Reconciliation {
    /// Fraction of the universe already stored, in `[0, 1]`.
    pub fn completeness(&self) -> f64 {
        if self.universe_size == 0 {
            1.0
        } else {
            self.existing.len() as f64 / self.universe_size as f64
        }
    }
}

/// Reconciles declared universes against a [`Store`].
pub struct Reconciler<S: Store> {
    store: S,
}

impl<S: Store> Reconciler<S> {
    /// Create a reconciler over `store`.
    pub fn new(store: S) -> Self {
        Self { store }
    }

    /// Borrow the underlying store.
    pub fn store(&self) -> &S {
        &self.store
    }

    /// Stored identities inside the universe.
    pub fn existing(&self, filter: &UniverseFilter) -> Result<HashSet<WorkItemId>> {
        filter.validate()?;
        let mut found = self.store.existing(&filter.store_query())?;
        // Backends may over-approximate; the universe is the source of truth.
        found.retain(|id| filter.contains(id));
        Ok(found)
    }

    /// Universe minus existing, in universe order.
    pub fn missing(&self, filter: &UniverseFilter) -> Result<Vec<WorkItemId>> {
        Ok(self.reconcile(filter)?.missing)
    }

    /// Full partition of the universe from a single store round trip.
    pub fn reconcile(&self, filter: &UniverseFilter) -> Result<Reconciliation> {
        let existing = self.existing(filter)?;
        let missing: Vec<WorkItemId> = filter
            .universe()
            .filter(|id| !existing.contains(id))
            .collect();

        debug!(
            kind = %filter.kind,
            universe = filter.universe_len(),
            existing = existing.len(),
            missing = missing.len(),
            "reconciled universe"
        );

        Ok(Reconciliation {
            universe_size: filter.universe_len(),
            existing,
            missing,
        })
    }

    /// Per-facility, per-date existing counts against caller-supplied
    /// expectations.
    ///
    /// `expected` returns how many items a facility should have on a date;
    /// counts vary with cancellations, so no uniform default is assumed here.
    pub fn coverage<F>(&self, filter: &UniverseFilter, expected: F) -> Result<CoverageReport>
    where
        F: Fn(&str, NaiveDate) -> usize,
    {
        let existing = self.existing(filter)?;
        let mut report = CoverageReport::default();

        for facility in &filter.facilities {
            for date in filter.dates.days() {
                report.record_expected(facility, date, expected(facility, date));
            }
        }
        for id in &existing {
            report.record_existing(&id.facility, id.date);
        }

        Ok(report)
    }

    /// Stored program count per facility and date within `filter`'s bounds.
    ///
    /// A stored program is one scheduled event, so this is the real number
    /// of items a day should have once cancellations are accounted for.
    pub fn scheduled_counts(&self, filter: &UniverseFilter) -> Result<HashMap<(String, NaiveDate), usize>> {
        let programs = UniverseFilter {
            kind: DataKind::Programs,
            ..filter.clone()
        };
        let mut counts = HashMap::new();
        for id in self.existing(&programs)? {
            *counts.entry((id.facility, id.date)).or_insert(0) += 1;
        }
        Ok(counts)
    }

    /// [`coverage`](Self::coverage) against the stored schedule.
    ///
    /// Days with stored programs expect that many items; days without any
    /// fall back to the full sequence range. Programs themselves are measured
    /// against the sequence range.
    pub fn scheduled_coverage(&self, filter: &UniverseFilter) -> Result<CoverageReport> {
        let per_day = filter.sequences.len();
        if filter.kind == DataKind::Programs {
            return self.coverage(filter, |_, _| per_day);
        }

        let schedule = self.scheduled_counts(filter)?;
        debug!(kind = %filter.kind, scheduled_days = schedule.len(), "coverage against stored schedule");
        self.coverage(filter, |facility, date| {
            schedule
                .get(&(facility.to_string(), date))
                .copied()
                .unwrap_or(per_day)
        })
    }
}
