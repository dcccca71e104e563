use chrono::{Days, NaiveDate};
use lestockage::{DataKind, StoreQuery, WorkItemId};
use serde::{Deserialize, Serialize};

use crate::{ReconcileError, Result};

/// Inclusive range of event dates.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct DateRange {
    /// First date
    pub start: NaiveDate,
    /// Last date
    pub end: NaiveDate,
}

impl DateRange {
    /// Create a range; `start` must not be after `end`.
    pub fn new(start: NaiveDate, end: NaiveDate) -> Result<Self> {
        if start > end {
            return Err(ReconcileError::InvalidFilter(format!(
                "date range start {} is after end {}",
                start, end
            )));
        }
        Ok(Self { start, end })
    }

    /// A single day.
    pub fn day(date: NaiveDate) -> Self {
        Self {
            start: date,
            end: date,
        }
    }

    /// Number of days covered.
    pub fn len(&self) -> usize {
        ((self.end - self.start).num_days().max(-1) + 1) as usize
    }

    /// True if the range covers no day.
    pub fn is_empty(&self) -> bool {
        self.start > self.end
    }

    /// Whether `date` falls inside the range.
    pub fn contains(&self, date: NaiveDate) -> bool {
        date >= self.start && date <= self.end
    }

    /// Overlap of two ranges, if any.
    pub fn intersect(&self, other: &DateRange) -> Option<DateRange> {
        let start = self.start.max(other.start);
        let end = self.end.min(other.end);
        (start <= end).then_some(DateRange { start, end })
    }

    /// Iterate the days of the range in order.
    pub fn days(&self) -> impl Iterator<Item = NaiveDate> + Clone {
        let end = self.end;
        std::iter::successors(Some(self.start), move |d| d.checked_add_days(Days::new(1)))
            .take_while(move |d| *d <= end)
    }
}

/// Inclusive range of sequence numbers within one facility-day.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct SequenceRange {
    /// First sequence number
    pub first: u32,
    /// Last sequence number
    pub last: u32,
}

impl SequenceRange {
    /// Create a range; `first` must not exceed `last`.
    pub fn new(first: u32, last: u32) -> Result<Self> {
        if first > last {
            return Err(ReconcileError::InvalidFilter(format!(
                "sequence range {}..={} is empty",
                first, last
            )));
        }
        Ok(Self { first, last })
    }

    /// Number of sequence numbers covered.
    pub fn len(&self) -> usize {
        if self.first > self.last {
            0
        } else {
            (self.last - self.first) as usize + 1
        }
    }

    /// True if the range covers nothing.
    pub fn is_empty(&self) -> bool {
        self.first > self.last
    }

    /// Iterate the sequence numbers in order.
    pub fn iter(&self) -> std::ops::RangeInclusive<u32> {
        self.first..=self.last
    }
}

/// Declared universe for one reconciliation run: the cartesian product of
/// facilities, dates, and sequence numbers, for one data kind.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UniverseFilter {
    /// Data kind being reconciled
    pub kind: DataKind,
    /// Facilities in the universe
    pub facilities: Vec<String>,
    /// Event dates in the universe
    pub dates: DateRange,
    /// Sequence numbers in the universe
    pub sequences: SequenceRange,
}

impl UniverseFilter {
    /// Build and validate a filter. Duplicate facilities are collapsed.
    pub fn new(
        kind: DataKind,
        facilities: impl IntoIterator<Item = impl Into<String>>,
        dates: DateRange,
        sequences: SequenceRange,
    ) -> Result<Self> {
        let mut facilities: Vec<String> = facilities.into_iter().map(Into::into).collect();
        facilities.sort();
        facilities.dedup();

        let filter = Self {
            kind,
            facilities,
            dates,
            sequences,
        };
        filter.validate()?;
        Ok(filter)
    }

    /// Reject filters that cannot describe a universe.
    pub fn validate(&self) -> Result<()> {
        if self.facilities.iter().any(|f| f.trim().is_empty()) {
            return Err(ReconcileError::InvalidFilter(
                "facility codes must not be blank".to_string(),
            ));
        }
        if self.dates.is_empty() {
            return Err(ReconcileError::InvalidFilter(format!(
                "date range {}..={} is empty",
                self.dates.start, self.dates.end
            )));
        }
        if self.sequences.is_empty() {
            return Err(ReconcileError::InvalidFilter(format!(
                "sequence range {}..={} is empty",
                self.sequences.first, self.sequences.last
            )));
        }
        Ok(())
    }

    /// Size of the universe without materializing it.
    pub fn universe_len(&self) -> usize {
        self.facilities.len() * self.dates.len() * self.sequences.len()
    }

    /// Whether `id` belongs to the universe.
    pub fn contains(&self, id: &WorkItemId) -> bool {
        self.dates.contains(id.date)
            && id.sequence >= self.sequences.first
            && id.sequence <= self.sequences.last
            && self.facilities.iter().any(|f| f == &id.facility)
    }

    /// Lazily enumerate the universe, facility-major then date then sequence.
    pub fn universe(&self) -> impl Iterator<Item = WorkItemId> + '_ {
        let dates = self.dates;
        let sequences = self.sequences;
        self.facilities.iter().flat_map(move |facility| {
            dates.days().flat_map(move |date| {
                sequences
                    .iter()
                    .map(move |sequence| WorkItemId::new(facility.clone(), date, sequence))
            })
        })
    }

    /// The bulk store query covering exactly this universe.
    pub fn store_query(&self) -> StoreQuery {
        StoreQuery {
            kind: self.kind,
            facilities: self.facilities.clone(),
            date_from: self.dates.start,
            date_to: self.dates.end,
            sequence_from: self.sequences.first,
            sequence_to: self.sequences.last,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    fn d(day: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(2024, 2, day).unwrap()
    }

    #[test]
    fn date_range_iterates_inclusive_days_across_month_end() {
        let range = DateRange::new(d(28), NaiveDate::from_ymd_opt(2024, 3, 1).unwrap()).unwrap();
        let days: Vec<_> = range.days().collect();
        assert_eq!(days.len(), 3); // 2024 is a leap year
        assert_eq!(range.len(), 3);
        assert_eq!(days[1], d(29));
    }

    #[test]
    fn inverted_ranges_are_rejected() {
        assert!(DateRange::new(d(5), d(4)).is_err());
        assert!(SequenceRange::new(3, 2).is_err());
    }

    #[rstest]
    #[case(d(1), d(10), d(5), d(20), Some((d(5), d(10))))]
    #[case(d(1), d(4), d(5), d(20), None)]
    #[case(d(3), d(3), d(1), d(9), Some((d(3), d(3))))]
    fn intersect_cases(
        #[case] a_start: NaiveDate,
        #[case] a_end: NaiveDate,
        #[case] b_start: NaiveDate,
        #[case] b_end: NaiveDate,
        #[case] expected: Option<(NaiveDate, NaiveDate)>,
    ) {
        let a = DateRange::new(a_start, a_end).unwrap();
        let b = DateRange::new(b_start, b_end).unwrap();
        assert_eq!(a.intersect(&b).map(|r| (r.start, r.end)), expected);
    }

    #[test]
    fn universe_is_the_cartesian_product() {
        let filter = UniverseFilter::new(
            DataKind::Results,
            ["02", "01", "02"],
            DateRange::new(d(1), d(3)).unwrap(),
            SequenceRange::new(1, 2).unwrap(),
        )
        .unwrap();

        assert_eq!(filter.facilities, vec!["01", "02"]);
        assert_eq!(filter.universe_len(), 12);

        let items: Vec<_> = filter.universe().collect();
        assert_eq!(items.len(), 12);
        assert_eq!(items[0], WorkItemId::new("01", d(1), 1));
        assert_eq!(items[11], WorkItemId::new("02", d(3), 2));
        assert!(items.iter().all(|id| filter.contains(id)));
    }

    #[test]
    fn blank_facility_is_invalid() {
        let err = UniverseFilter::new(
            DataKind::Odds,
            ["01", " "],
            DateRange::day(d(1)),
            SequenceRange::new(1, 1).unwrap(),
        )
        .unwrap_err();
        assert!(err.to_string().contains("blank"));
    }
}
