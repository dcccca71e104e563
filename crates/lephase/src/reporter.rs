//! Progress pushes from a running workflow into the job's progress record.

use std::sync::Arc;

use letache::{ProgressStore, ProgressUpdate};
use tracing::{debug, warn};

use crate::phase::Phase;
use crate::pool::{PoolProgress, PoolReport};

/// Writes workflow checkpoints (phase start, every N items, phase end) to a
/// [`ProgressStore`].
///
/// Failures to write progress are logged and otherwise ignored; they never
/// stop the workflow.
#[derive(Clone)]
pub struct ProgressReporter {
    job_name: String,
    store: Option<Arc<dyn ProgressStore>>,
    every: usize,
}

impl ProgressReporter {
    /// Reporter for `job_name`, pushing every `every` items.
    pub fn new(job_name: impl Into<String>, store: Arc<dyn ProgressStore>, every: usize) -> Self {
        Self {
            job_name: job_name.into(),
            store: Some(store),
            every: every.max(1),
        }
    }

    /// Reporter that only logs, for runs not attached to a job.
    pub fn disabled() -> Self {
        Self {
            job_name: String::new(),
            store: None,
            every: usize::MAX,
        }
    }

    /// Overall percentage after `fraction` of phase `index` out of `count`.
    pub fn overall(index: usize, count: usize, fraction: f64) -> i32 {
        if count == 0 {
            return 100;
        }
        let value = (index as f64 + fraction.clamp(0.0, 1.0)) / count as f64 * 100.0;
        value.floor().clamp(0.0, 100.0) as i32
    }

    /// A phase is about to fetch `missing` items.
    pub fn phase_started(&self, index: usize, count: usize, phase: Phase, missing: usize) {
        self.push(
            ProgressUpdate::at(Self::overall(index, count, 0.0), phase.as_str())
                .with_message(format!("{}: {} items to fetch", phase, missing)),
        );
    }

    /// An item finished; pushes on every N-th item and on the last one.
    pub fn item_done(&self, index: usize, count: usize, phase: Phase, progress: &PoolProgress) {
        if progress.done % self.every != 0 && progress.done != progress.total {
            return;
        }
        self.push(
            ProgressUpdate::at(Self::overall(index, count, progress.fraction()), phase.as_str())
                .with_message(format!(
                    "{}: {}/{} ({} errors)",
                    phase, progress.done, progress.total, progress.report.errored
                )),
        );
    }

    /// A phase drained.
    pub fn phase_finished(&self, index: usize, count: usize, phase: Phase, report: &PoolReport) {
        self.push(
            ProgressUpdate::at(Self::overall(index, count, 1.0), phase.as_str()).with_message(
                format!(
                    "{} done: {} fetched, {} skipped, {} errors",
                    phase, report.processed, report.skipped, report.errored
                ),
            ),
        );
    }

    fn push(&self, update: ProgressUpdate) {
        debug!(
            job = %self.job_name,
            progress = ?update.progress,
            message = ?update.message,
            "progress"
        );
        let Some(store) = &self.store else { return };
        if let Err(err) = store.update(&self.job_name, update) {
            warn!(job = %self.job_name, error = %err, "failed to record progress");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use letache::{FsProgressStore, ProgressRecord};
    use rstest::rstest;
    use tempfile::tempdir;

    #[rstest]
    #[case(0, 3, 0.0, 0)]
    #[case(0, 3, 0.5, 16)]
    #[case(1, 3, 0.0, 33)]
    #[case(2, 3, 1.0, 100)]
    #[case(0, 0, 0.0, 100)]
    fn overall_percentage(#[case] index: usize, #[case] count: usize, #[case] fraction: f64, #[case] expected: i32) {
        assert_eq!(ProgressReporter::overall(index, count, fraction), expected);
    }

    #[test]
    fn pushes_are_throttled() {
        let dir = tempdir().unwrap();
        let store = Arc::new(FsProgressStore::new(dir.path()));
        store.seed(&ProgressRecord::started("job")).unwrap();
        let reporter = ProgressReporter::new("job", store.clone(), 10);

        let mut progress = PoolProgress {
            done: 3,
            total: 40,
            report: PoolReport::default(),
        };
        reporter.item_done(0, 1, Phase::Results, &progress);
        assert_eq!(store.get("job").unwrap().unwrap().progress, 0);

        progress.done = 10;
        reporter.item_done(0, 1, Phase::Results, &progress);
        assert_eq!(store.get("job").unwrap().unwrap().progress, 25);
    }
}
