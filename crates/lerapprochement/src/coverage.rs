use std::collections::BTreeMap;

use chrono::NaiveDate;
use serde::{Deserialize, Serialize};

/// Existing versus expected count for one facility-day.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CoverageCell {
    /// Items present in the store
    pub existing: usize,
    /// Items the caller expects to exist
    pub expected: usize,
}

impl CoverageCell {
    /// True once every expected item is stored.
    pub fn is_complete(&self) -> bool {
        self.existing >= self.expected
    }
}

/// Coverage statistics keyed by facility then date.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CoverageReport {
    cells: BTreeMap<String, BTreeMap<NaiveDate, CoverageCell>>,
}

impl CoverageReport {
    pub(crate) fn record_expected(&mut self, facility: &str, date: NaiveDate, expected: usize) {
        self.cell_mut(facility, date).expected = expected;
    }

    pub(crate) fn record_existing(&mut self, facility: &str, date: NaiveDate) {
        self.cell_mut(facility, date).existing += 1;
    }

    fn cell_mut(&mut self, facility: &str, date: NaiveDate) -> &mut CoverageCell {
        self.cells
            .entry(facility.to_string())
            .or_default()
            .entry(date)
            .or_default()
    }

    /// Look up one facility-day.
    pub fn cell(&self, facility: &str, date: NaiveDate) -> Option<&CoverageCell> {
        self.cells.get(facility).and_then(|days| days.get(&date))
    }

    /// Iterate `(facility, date, cell)` in facility then date order.
    pub fn iter(&self) -> impl Iterator<Item = (&str, NaiveDate, &CoverageCell)> {
        self.cells.iter().flat_map(|(facility, days)| {
            days.iter()
                .map(move |(date, cell)| (facility.as_str(), *date, cell))
        })
    }

    /// Sum per facility.
    pub fn facility_totals(&self) -> BTreeMap<&str, CoverageCell> {
        self.cells
            .iter()
            .map(|(facility, days)| {
                let total = days.values().fold(CoverageCell::default(), |acc, c| CoverageCell {
                    existing: acc.existing + c.existing,
                    expected: acc.expected + c.expected,
                });
                (facility.as_str(), total)
            })
            .collect()
    }

    /// Stored items across all cells.
    pub fn total_existing(&self) -> usize {
        self.iter().map(|(_, _, c)| c.existing).sum()
    }

    /// Expected items across all cells.
    pub fn total_expected(&self) -> usize {
        self.iter().map(|(_, _, c)| c.expected).sum()
    }

    /// Stored fraction of expected items, capped at 1.0.
    pub fn ratio(&self) -> f64 {
        let expected = self.total_expected();
        if expected == 0 {
            return 1.0;
        }
        (self.total_existing() as f64 / expected as f64).min(1.0)
    }

    /// True when every cell is complete.
    pub fn is_complete(&self) -> bool {
        self.iter().all(|(_, _, c)| c.is_complete())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn totals_and_ratio() {
        let day = NaiveDate::from_ymd_opt(2024, 1, 5).unwrap();
        let mut report = CoverageReport::default();
        report.record_expected("01", day, 4);
        report.record_expected("02", day, 2);
        report.record_existing("01", day);
        report.record_existing("02", day);
        report.record_existing("02", day);

        assert_eq!(report.total_expected(), 6);
        assert_eq!(report.total_existing(), 3);
        assert!((report.ratio() - 0.5).abs() < f64::EPSILON);
        assert_eq!(report.facility_totals()["02"].existing, 2);
        assert!(report.cell("02", day).unwrap().is_complete());
        assert!(!report.is_complete());
    }

    #[test]
    fn empty_report_counts_as_complete() {
        let report = CoverageReport::default();
        assert_eq!(report.ratio(), 1.0);
        assert!(report.is_complete());
    }
}
