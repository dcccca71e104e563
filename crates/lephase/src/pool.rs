//! Bounded-concurrency fetch pool
//!
//! Runs a blocking unit of work over a list of items with at most `workers`
//! units in flight. A unit's failure is counted and logged at the item
//! boundary and never affects its siblings. Only a fatal unit error, the
//! global deadline, or the stop flag end a run early, and even then in-flight
//! units are left to finish rather than interrupted mid-item.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tokio::time::Instant;
use tracing::{debug, error, warn};

/// Default ceiling on one pool run.
pub const DEFAULT_POOL_TIMEOUT: Duration = Duration::from_secs(30 * 60);

/// Default ceiling on one item.
pub const DEFAULT_ITEM_TIMEOUT: Duration = Duration::from_secs(120);

/// Successful result of one unit.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UnitOutcome {
    /// Work was done
    Processed,
    /// Nothing to do for this item
    Skipped,
}

/// Failed result of one unit.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum UnitError {
    /// This item failed; the run continues
    Failed(String),
    /// Nothing else can succeed; the run stops dispatching
    Fatal(String),
}

/// Counters of one pool run.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PoolReport {
    /// Items the unit completed
    pub processed: usize,
    /// Items that failed, timed out or panicked
    pub errored: usize,
    /// Items the unit found nothing to do for
    pub skipped: usize,
    /// Items never dispatched because the run stopped early
    pub not_started: usize,
    /// True when the stop flag ended the run
    pub stopped: bool,
}

impl PoolReport {
    /// Items that reached an outcome.
    pub fn done(&self) -> usize {
        self.processed + self.errored + self.skipped
    }
}

/// Snapshot passed to the progress callback after each item.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PoolProgress {
    /// Items finished so far
    pub done: usize,
    /// Items submitted to the run
    pub total: usize,
    /// Counters so far
    pub report: PoolReport,
}

impl PoolProgress {
    /// Fraction finished, in `[0, 1]`.
    pub fn fraction(&self) -> f64 {
        if self.total == 0 {
            1.0
        } else {
            self.done as f64 / self.total as f64
        }
    }
}

/// Reasons a pool run ends without draining its items.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum PoolError {
    /// The global deadline passed
    #[error("pool run exceeded {}s", .limit.as_secs())]
    Timeout {
        /// Configured ceiling
        limit: Duration,
        /// Counters at the deadline
        report: PoolReport,
    },

    /// A unit reported a condition no other item can survive
    #[error("fatal error: {message}")]
    Fatal {
        /// First fatal message
        message: String,
        /// Counters once in-flight units drained
        report: PoolReport,
    },
}

impl PoolError {
    /// Counters at the time the run ended.
    pub fn report(&self) -> &PoolReport {
        match self {
            PoolError::Timeout { report, .. } | PoolError::Fatal { report, .. } => report,
        }
    }
}

/// Pool settings.
#[derive(Debug, Clone)]
pub struct PoolConfig {
    /// Units in flight at once
    pub workers: usize,
    /// Ceiling on the whole run
    pub timeout: Duration,
    /// Ceiling on one item; exceeding it counts as that item's failure
    pub item_timeout: Option<Duration>,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            workers: 4,
            timeout: DEFAULT_POOL_TIMEOUT,
            item_timeout: Some(DEFAULT_ITEM_TIMEOUT),
        }
    }
}

impl PoolConfig {
    /// Defaults with `workers` units in flight.
    pub fn with_workers(workers: usize) -> Self {
        Self {
            workers,
            ..Self::default()
        }
    }
}

/// Outcome of one dispatched item, as seen by the pool.
enum Finished {
    Done(UnitOutcome),
    Failed(String),
    Fatal(String),
}

/// Bounded worker pool over a blocking unit.
#[derive(Debug, Clone)]
pub struct ConcurrentFetchPool {
    config: PoolConfig,
    stop: Arc<AtomicBool>,
}

impl ConcurrentFetchPool {
    /// Pool with its own stop flag.
    pub fn new(config: PoolConfig) -> Self {
        Self::with_stop_flag(config, Arc::new(AtomicBool::new(false)))
    }

    /// Pool sharing `stop` with its owner; raising it stops dispatch.
    pub fn with_stop_flag(config: PoolConfig, stop: Arc<AtomicBool>) -> Self {
        Self { config, stop }
    }

    /// Active settings.
    pub fn config(&self) -> &PoolConfig {
        &self.config
    }

    /// Ask the running pool to stop dispatching new items.
    pub fn stop(&self) {
        self.stop.store(true, Ordering::SeqCst);
    }

    /// Apply `unit` to every item with bounded concurrency.
    ///
    /// `on_progress` runs after each item reaches an outcome. Returns the
    /// counters, or a [`PoolError`] for the global deadline and fatal unit
    /// errors.
    pub async fn run<T, U, P>(
        &self,
        items: Vec<T>,
        unit: U,
        mut on_progress: P,
    ) -> Result<PoolReport, PoolError>
    where
        T: Send + 'static,
        U: Fn(T) -> Result<UnitOutcome, UnitError> + Send + Sync + 'static,
        P: FnMut(PoolProgress),
    {
        let total = items.len();
        let workers = self.config.workers.max(1);
        let semaphore = Arc::new(Semaphore::new(workers));
        let unit = Arc::new(unit);
        let item_timeout = self.config.item_timeout;
        let deadline = Instant::now() + self.config.timeout;

        let mut report = PoolReport::default();
        let mut fatal: Option<String> = None;
        // Raised by the unit's thread itself, before its permit frees, so the
        // next dispatch already sees it.
        let halt = Arc::new(AtomicBool::new(false));

        debug!(total, workers, "pool run starting");

        let drive = async {
            let mut tasks = JoinSet::new();
            let mut pending = items.into_iter();

            loop {
                if halt.load(Ordering::SeqCst) {
                    break;
                }
                if self.stop.load(Ordering::SeqCst) {
                    report.stopped = true;
                    break;
                }

                let Some(item) = pending.next() else { break };
                let permit = match Arc::clone(&semaphore).acquire_owned().await {
                    Ok(permit) => permit,
                    Err(_) => break,
                };

                // Tally whatever finished while waiting for the permit.
                while let Some(joined) = tasks.try_join_next() {
                    tally(joined, &mut report, &mut fatal);
                    on_progress(PoolProgress {
                        done: report.done(),
                        total,
                        report,
                    });
                }
                if halt.load(Ordering::SeqCst) || self.stop.load(Ordering::SeqCst) {
                    report.stopped = !halt.load(Ordering::SeqCst);
                    report.not_started += 1;
                    break;
                }

                let unit = Arc::clone(&unit);
                let halt = Arc::clone(&halt);
                tasks.spawn(async move {
                    // The permit moves into the blocking call so a stuck item
                    // keeps its slot and concurrency never exceeds `workers`.
                    let call = tokio::task::spawn_blocking(move || {
                        let result = unit(item);
                        if matches!(result, Err(UnitError::Fatal(_))) {
                            halt.store(true, Ordering::SeqCst);
                        }
                        drop(permit);
                        result
                    });
                    let joined = match item_timeout {
                        Some(limit) => match tokio::time::timeout(limit, call).await {
                            Ok(joined) => joined,
                            Err(_) => {
                                return Finished::Failed(format!(
                                    "item timed out after {}s",
                                    limit.as_secs()
                                ))
                            }
                        },
                        None => call.await,
                    };
                    match joined {
                        Ok(Ok(outcome)) => Finished::Done(outcome),
                        Ok(Err(UnitError::Failed(msg))) => Finished::Failed(msg),
                        Ok(Err(UnitError::Fatal(msg))) => Finished::Fatal(msg),
                        Err(join_err) => Finished::Failed(format!("unit panicked: {}", join_err)),
                    }
                });
            }
            report.not_started += pending.len();

            while let Some(joined) = tasks.join_next().await {
                tally(joined, &mut report, &mut fatal);
                on_progress(PoolProgress {
                    done: report.done(),
                    total,
                    report,
                });
            }
        };

        if tokio::time::timeout_at(deadline, drive).await.is_err() {
            // Dropping the join set detached the in-flight items.
            report.not_started = total.saturating_sub(report.done());
            error!(
                limit_secs = self.config.timeout.as_secs(),
                done = report.done(),
                total,
                "pool run hit its global timeout"
            );
            return Err(PoolError::Timeout {
                limit: self.config.timeout,
                report,
            });
        }

        if let Some(message) = fatal {
            error!(error = %message, "pool run aborted by fatal error");
            return Err(PoolError::Fatal { message, report });
        }

        debug!(
            processed = report.processed,
            errored = report.errored,
            skipped = report.skipped,
            stopped = report.stopped,
            "pool run finished"
        );
        Ok(report)
    }
}

fn tally(
    joined: Result<Finished, tokio::task::JoinError>,
    report: &mut PoolReport,
    fatal: &mut Option<String>,
) {
    match joined {
        Ok(Finished::Done(UnitOutcome::Processed)) => report.processed += 1,
        Ok(Finished::Done(UnitOutcome::Skipped)) => report.skipped += 1,
        Ok(Finished::Failed(msg)) => {
            warn!(error = %msg, "work item failed");
            report.errored += 1;
        }
        Ok(Finished::Fatal(msg)) => {
            report.errored += 1;
            if fatal.is_none() {
                *fatal = Some(msg);
            }
        }
        Err(join_err) => {
            warn!(error = %join_err, "work item task failed");
            report.errored += 1;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    #[tokio::test]
    async fn one_failure_among_many_is_isolated() {
        let pool = ConcurrentFetchPool::new(PoolConfig::with_workers(4));
        let report = pool
            .run(
                (0..20).collect(),
                |i: u32| {
                    if i == 7 {
                        Err(UnitError::Failed("boom".into()))
                    } else {
                        Ok(UnitOutcome::Processed)
                    }
                },
                |_| {},
            )
            .await
            .unwrap();

        assert_eq!(report.processed, 19);
        assert_eq!(report.errored, 1);
        assert_eq!(report.not_started, 0);
    }

    #[tokio::test]
    async fn concurrency_never_exceeds_workers() {
        let in_flight = Arc::new(AtomicUsize::new(0));
        let peak = Arc::new(AtomicUsize::new(0));
        let (f, p) = (in_flight.clone(), peak.clone());

        let pool = ConcurrentFetchPool::new(PoolConfig::with_workers(3));
        pool.run(
            (0..24).collect::<Vec<u32>>(),
            move |_| {
                let now = f.fetch_add(1, Ordering::SeqCst) + 1;
                p.fetch_max(now, Ordering::SeqCst);
                std::thread::sleep(Duration::from_millis(5));
                f.fetch_sub(1, Ordering::SeqCst);
                Ok(UnitOutcome::Processed)
            },
            |_| {},
        )
        .await
        .unwrap();

        assert!(peak.load(Ordering::SeqCst) <= 3);
        assert!(peak.load(Ordering::SeqCst) >= 1);
    }

    #[tokio::test]
    async fn panicking_unit_counts_as_error() {
        let pool = ConcurrentFetchPool::new(PoolConfig::with_workers(2));
        let report = pool
            .run(
                vec![1u32, 2, 3],
                |i| {
                    if i == 2 {
                        panic!("parser blew up");
                    }
                    Ok(UnitOutcome::Skipped)
                },
                |_| {},
            )
            .await
            .unwrap();
        assert_eq!(report.skipped, 2);
        assert_eq!(report.errored, 1);
    }

    #[tokio::test]
    async fn progress_reaches_total() {
        let pool = ConcurrentFetchPool::new(PoolConfig::with_workers(2));
        let mut seen = Vec::new();
        pool.run((0..5).collect::<Vec<u32>>(), |_| Ok(UnitOutcome::Processed), |p| {
            seen.push(p.done)
        })
        .await
        .unwrap();

        assert_eq!(seen.len(), 5);
        assert_eq!(seen.last(), Some(&5));
    }

    #[tokio::test]
    async fn empty_run_is_trivially_complete() {
        let pool = ConcurrentFetchPool::new(PoolConfig::default());
        let report = pool
            .run(Vec::<u32>::new(), |_| Ok(UnitOutcome::Processed), |_| {})
            .await
            .unwrap();
        assert_eq!(report, PoolReport::default());
    }
}
