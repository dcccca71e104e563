use chrono::{Days, NaiveDate};
use lerapprochement::DateRange;
use lestockage::DataKind;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Stages of the fetch workflow, in execution order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Phase {
    /// Scheduled programs
    Programs,
    /// Confirmed results
    Results,
    /// Volatile odds
    Odds,
}

impl Phase {
    /// All phases in execution order.
    pub const ALL: [Phase; 3] = [Phase::Programs, Phase::Results, Phase::Odds];

    /// Lowercase label.
    pub fn as_str(self) -> &'static str {
        match self {
            Phase::Programs => "programs",
            Phase::Results => "results",
            Phase::Odds => "odds",
        }
    }

    /// Parse a label, case-insensitively.
    pub fn from_str_name(s: &str) -> Option<Self> {
        Self::ALL
            .into_iter()
            .find(|p| p.as_str().eq_ignore_ascii_case(s.trim()))
    }

    /// Data kind the phase fetches.
    pub fn kind(self) -> DataKind {
        match self {
            Phase::Programs => DataKind::Programs,
            Phase::Results => DataKind::Results,
            Phase::Odds => DataKind::Odds,
        }
    }

    /// Default policy.
    ///
    /// Results are final and tolerate heavy concurrency; odds move and the
    /// source throttles them, so they run narrow and only for upcoming days.
    pub fn default_config(self) -> PhaseConfig {
        match self {
            Phase::Programs => PhaseConfig::new(8, DateWindow::Unrestricted),
            Phase::Results => PhaseConfig::new(16, DateWindow::PastOnly),
            Phase::Odds => PhaseConfig::new(3, DateWindow::FromToday),
        }
    }
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Which dates of the requested range a phase covers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DateWindow {
    /// The whole range
    #[default]
    Unrestricted,
    /// Days strictly before today
    PastOnly,
    /// Today and later
    FromToday,
}

impl DateWindow {
    /// Restrict `range` to this window, `None` when nothing is left.
    pub fn apply(self, range: DateRange, today: NaiveDate) -> Option<DateRange> {
        match self {
            DateWindow::Unrestricted => Some(range),
            DateWindow::PastOnly => {
                let yesterday = today.checked_sub_days(Days::new(1))?;
                range.intersect(&DateRange {
                    start: NaiveDate::MIN,
                    end: yesterday,
                })
            }
            DateWindow::FromToday => range.intersect(&DateRange {
                start: today,
                end: NaiveDate::MAX,
            }),
        }
    }
}

/// Per-phase execution policy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PhaseConfig {
    /// Concurrent fetches
    pub workers: usize,
    /// Date window
    #[serde(default)]
    pub date_window: DateWindow,
}

impl PhaseConfig {
    /// Policy with `workers` fetches in flight over `date_window`.
    pub fn new(workers: usize, date_window: DateWindow) -> Self {
        Self {
            workers,
            date_window,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    fn d(day: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(2024, 5, day).unwrap()
    }

    #[rstest]
    #[case(DateWindow::Unrestricted, Some((1, 20)))]
    #[case(DateWindow::PastOnly, Some((1, 9)))]
    #[case(DateWindow::FromToday, Some((10, 20)))]
    fn windows_split_around_today(#[case] window: DateWindow, #[case] expected: Option<(u32, u32)>) {
        let range = DateRange::new(d(1), d(20)).unwrap();
        let got = window.apply(range, d(10)).map(|r| (r.start, r.end));
        assert_eq!(got, expected.map(|(a, b)| (d(a), d(b))));
    }

    #[test]
    fn window_outside_range_is_empty() {
        let past = DateRange::new(d(1), d(5)).unwrap();
        assert!(DateWindow::FromToday.apply(past, d(10)).is_none());
        assert!(DateWindow::PastOnly.apply(past, d(1)).is_none());
    }

    #[test]
    fn phase_labels_parse_back() {
        for phase in Phase::ALL {
            assert_eq!(Phase::from_str_name(phase.as_str()), Some(phase));
        }
        assert_eq!(Phase::from_str_name(" ODDS "), Some(Phase::Odds));
        assert_eq!(Phase::from_str_name("weather"), None);
    }

    #[test]
    fn defaults_differ_per_phase() {
        assert!(Phase::Results.default_config().workers > Phase::Odds.default_config().workers);
        assert_eq!(Phase::Odds.default_config().date_window, DateWindow::FromToday);
    }
}
