// Work-item data model

use chrono::NaiveDate;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Date format used for persisted and displayed event dates.
pub const DATE_FORMAT: &str = "%Y-%m-%d";

/// Identity of one fetchable unit: one scheduled event at a facility.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct WorkItemId {
    /// Venue code the event belongs to
    pub facility: String,
    /// Event date
    pub date: NaiveDate,
    /// Position of the event within the facility's day (1-based)
    pub sequence: u32,
}

impl WorkItemId {
    /// Create a new identity.
    pub fn new(facility: impl Into<String>, date: NaiveDate, sequence: u32) -> Self {
        Self {
            facility: facility.into(),
            date,
            sequence,
        }
    }
}

impl fmt::Display for WorkItemId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}/{}/#{}",
            self.facility,
            self.date.format(DATE_FORMAT),
            self.sequence
        )
    }
}

/// Category of data fetched for a work item.
///
/// Each workflow phase writes exactly one kind, so the same identity can be
/// present for one kind and missing for another.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DataKind {
    /// Published race cards (entries, lanes, pre-event data)
    Programs,
    /// Confirmed results
    Results,
    /// Betting odds, volatile until the event closes
    Odds,
}

impl DataKind {
    /// All kinds in workflow order.
    pub const ALL: [DataKind; 3] = [DataKind::Programs, DataKind::Results, DataKind::Odds];

    /// Return the string representation of the kind.
    pub fn as_str(&self) -> &'static str {
        match self {
            DataKind::Programs => "programs",
            DataKind::Results => "results",
            DataKind::Odds => "odds",
        }
    }

    /// Create a kind from its string representation.
    pub fn from_str_name(s: &str) -> Option<Self> {
        match s.to_ascii_lowercase().as_str() {
            "programs" => Some(DataKind::Programs),
            "results" => Some(DataKind::Results),
            "odds" => Some(DataKind::Odds),
            _ => None,
        }
    }
}

impl fmt::Display for DataKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One stored work item.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkItemRecord {
    /// Data category
    pub kind: DataKind,
    /// Item identity
    pub id: WorkItemId,
    /// Raw payload returned by the fetcher
    pub payload: String,
    /// Unix timestamp (seconds) of the fetch
    pub fetched_at: i64,
}

impl WorkItemRecord {
    /// Build a record stamped with the current time.
    pub fn new(kind: DataKind, id: WorkItemId, payload: impl Into<String>) -> Self {
        Self {
            kind,
            id,
            payload: payload.into(),
            fetched_at: chrono::Utc::now().timestamp(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn display_is_stable_and_readable() {
        let id = WorkItemId::new("04", NaiveDate::from_ymd_opt(2024, 3, 9).unwrap(), 7);
        assert_eq!(id.to_string(), "04/2024-03-09/#7");
    }

    #[test]
    fn kind_names_round_trip() {
        for kind in DataKind::ALL {
            assert_eq!(DataKind::from_str_name(kind.as_str()), Some(kind));
        }
        assert_eq!(DataKind::from_str_name("RESULTS"), Some(DataKind::Results));
        assert_eq!(DataKind::from_str_name("weather"), None);
    }

    #[test]
    fn identities_order_by_facility_then_date_then_sequence() {
        let d1 = NaiveDate::from_ymd_opt(2024, 1, 1).unwrap();
        let d2 = NaiveDate::from_ymd_opt(2024, 1, 2).unwrap();
        let mut ids = vec![
            WorkItemId::new("02", d1, 1),
            WorkItemId::new("01", d2, 1),
            WorkItemId::new("01", d1, 2),
            WorkItemId::new("01", d1, 1),
        ];
        ids.sort();
        assert_eq!(ids[0], WorkItemId::new("01", d1, 1));
        assert_eq!(ids[1], WorkItemId::new("01", d1, 2));
        assert_eq!(ids[2], WorkItemId::new("01", d2, 1));
        assert_eq!(ids[3], WorkItemId::new("02", d1, 1));
    }
}
