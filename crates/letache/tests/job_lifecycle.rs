use std::path::Path;
use std::sync::{Arc, Barrier};
use std::time::{Duration, Instant};

use letache::{
    ControllerConfig, FsLockRegistry, FsProgressStore, JobController, JobError, JobRecord,
    JobStatus, LaunchSpec, LockRegistry, ProcessLauncher, ProgressStore, ProgressUpdate,
    CRASHED_MESSAGE,
};
use rstest::rstest;
use tempfile::tempdir;

/// Launcher that spawns nothing and names the test process as worker.
struct InProcessLauncher;

impl ProcessLauncher for InProcessLauncher {
    fn launch(&self, _spec: &LaunchSpec) -> letache::Result<u32> {
        Ok(std::process::id())
    }
}

fn controller_with<X: ProcessLauncher>(
    state_dir: &Path,
    launcher: X,
    grace: Duration,
) -> JobController<FsLockRegistry, FsProgressStore, X> {
    let mut config = ControllerConfig::new(state_dir);
    config.cancel_grace = grace;
    config.poll_interval = Duration::from_millis(20);
    let locks = FsLockRegistry::new(config.locks_dir());
    let progress = FsProgressStore::new(config.progress_dir());
    JobController::with_parts(config, locks, progress, launcher)
}

#[rstest]
fn concurrent_starts_have_exactly_one_winner(#[values(2, 3, 4, 5, 6, 7, 8, 9, 10)] n: usize) {
    let dir = tempdir().unwrap();
    let state_dir = dir.path().to_path_buf();
    let barrier = Arc::new(Barrier::new(n));

    let handles: Vec<_> = (0..n)
        .map(|_| {
            let state_dir = state_dir.clone();
            let barrier = Arc::clone(&barrier);
            std::thread::spawn(move || {
                let jobs = controller_with(&state_dir, InProcessLauncher, Duration::from_secs(1));
                barrier.wait();
                jobs.start("nightly", "/bin/worker", &[])
            })
        })
        .collect();

    let outcomes: Vec<_> = handles.into_iter().map(|h| h.join().unwrap()).collect();
    let winners = outcomes.iter().filter(|r| r.is_ok()).count();
    let conflicts = outcomes
        .iter()
        .filter(|r| matches!(r, Err(JobError::AlreadyRunning { .. })))
        .count();

    assert_eq!(winners, 1, "{outcomes:?}");
    assert_eq!(conflicts, n - 1, "{outcomes:?}");
}

#[cfg(unix)]
fn dead_pid() -> u32 {
    let mut child = std::process::Command::new("true").spawn().unwrap();
    let pid = child.id();
    child.wait().unwrap();
    pid
}

#[cfg(unix)]
#[test]
fn stale_lock_is_reclaimed_without_cleanup() {
    let dir = tempdir().unwrap();
    let jobs = controller_with(dir.path(), InProcessLauncher, Duration::from_secs(1));

    let mut stale = JobRecord::claim("nightly", "/bin/worker", &[]);
    stale.pid = dead_pid();
    stale.process_started_at = None;
    jobs.locks().assign(&stale).unwrap();

    let pid = jobs.start("nightly", "/bin/worker", &[]).unwrap();
    assert_eq!(jobs.locks().holder("nightly").unwrap().unwrap().pid, pid);
}

#[test]
fn second_start_reports_holder_pid() {
    let dir = tempdir().unwrap();
    let jobs = controller_with(dir.path(), InProcessLauncher, Duration::from_secs(1));

    jobs.start("nightly", "/bin/worker", &[]).unwrap();
    match jobs.start("nightly", "/bin/worker", &[]) {
        Err(JobError::AlreadyRunning { job_name, pid }) => {
            assert_eq!(job_name, "nightly");
            assert_eq!(pid, std::process::id());
        }
        other => panic!("expected conflict, got {other:?}"),
    }
}

#[test]
fn complete_finalizes_and_releases() {
    let dir = tempdir().unwrap();
    let jobs = controller_with(dir.path(), InProcessLauncher, Duration::from_secs(1));

    jobs.start("nightly", "/bin/worker", &[]).unwrap();
    jobs.report("nightly", ProgressUpdate::at(50, "results")).unwrap();

    let record = jobs.complete("nightly", true, "3 errors").unwrap();
    assert_eq!(record.status, JobStatus::Completed);
    assert_eq!(record.progress, 100);
    assert!(jobs.locks().holder("nightly").unwrap().is_none());

    let failed = {
        jobs.start("nightly", "/bin/worker", &[]).unwrap();
        jobs.complete("nightly", false, "store unreachable").unwrap()
    };
    assert_eq!(failed.status, JobStatus::Failed);
    assert!(failed.is_error());
    assert!(jobs.locks().holder("nightly").unwrap().is_none());
}

#[test]
fn list_all_merges_progress_and_locks() {
    let dir = tempdir().unwrap();
    let jobs = controller_with(dir.path(), InProcessLauncher, Duration::from_secs(1));

    jobs.start("alpha", "/bin/worker", &[]).unwrap();
    jobs.start("beta", "/bin/worker", &[]).unwrap();
    jobs.complete("beta", true, "ok").unwrap();
    jobs.locks()
        .acquire(&JobRecord::claim("gamma", "/bin/worker", &[]))
        .unwrap();

    let rows = jobs.list_all().unwrap();
    let names: Vec<_> = rows.iter().map(|r| r.job_name.as_str()).collect();
    assert_eq!(names, vec!["alpha", "beta", "gamma"]);

    assert!(rows[0].alive);
    assert_eq!(rows[0].progress.as_ref().unwrap().status, JobStatus::Running);
    assert!(!rows[1].alive);
    assert!(rows[1].lock.is_none());
    assert!(rows[2].progress.is_none());
    assert!(rows[2].alive);
}

#[test]
fn prune_applies_the_notification_window() {
    let dir = tempdir().unwrap();
    let jobs = controller_with(dir.path(), InProcessLauncher, Duration::from_secs(1));

    jobs.start("nightly", "/bin/worker", &[]).unwrap();
    jobs.complete("nightly", true, "ok").unwrap();

    assert_eq!(jobs.prune(Duration::from_secs(3600)).unwrap(), 0);
    std::thread::sleep(Duration::from_millis(20));
    assert_eq!(jobs.prune(Duration::ZERO).unwrap(), 1);
    assert!(jobs.progress("nightly").unwrap().is_none());
}

#[cfg(unix)]
mod with_real_workers {
    use super::*;
    use letache::launcher::UnixLauncher;
    use letache::process;

    fn sh(jobs: &JobController<FsLockRegistry, FsProgressStore, UnixLauncher>, job: &str, script: &str) -> u32 {
        jobs.start(job, "sh", &["-c".to_string(), script.to_string()])
            .unwrap()
    }

    #[test]
    fn cancel_stops_a_cooperative_worker() {
        let dir = tempdir().unwrap();
        let jobs = controller_with(dir.path(), UnixLauncher, Duration::from_secs(5));
        let pid = sh(&jobs, "sleeper", "exec sleep 30");
        assert!(process::is_alive(pid, None));

        let started = Instant::now();
        assert!(jobs.cancel("sleeper").unwrap());
        assert!(started.elapsed() < Duration::from_secs(5));

        assert!(jobs.locks().holder("sleeper").unwrap().is_none());
        assert_eq!(
            jobs.progress("sleeper").unwrap().unwrap().status,
            JobStatus::Cancelled
        );
    }

    #[test]
    fn cancel_kills_a_worker_that_ignores_terminate() {
        let dir = tempdir().unwrap();
        let grace = Duration::from_millis(300);
        let jobs = controller_with(dir.path(), UnixLauncher, grace);
        let pid = sh(&jobs, "stubborn", "trap '' TERM; sleep 30");

        let started = Instant::now();
        assert!(jobs.cancel("stubborn").unwrap());
        assert!(started.elapsed() < grace + Duration::from_secs(6));

        assert!(process::wait_for_exit(
            pid,
            None,
            Duration::from_secs(5),
            Duration::from_millis(20)
        ));
        assert!(jobs.locks().holder("stubborn").unwrap().is_none());
    }

    #[test]
    fn crashed_worker_is_reaped_on_status_query() {
        let dir = tempdir().unwrap();
        let jobs = controller_with(dir.path(), UnixLauncher, Duration::from_secs(1));
        let pid = sh(&jobs, "crasher", "exit 3");
        assert!(process::wait_for_exit(
            pid,
            None,
            Duration::from_secs(5),
            Duration::from_millis(20)
        ));

        let record = jobs.progress("crasher").unwrap().unwrap();
        assert_eq!(record.status, JobStatus::Failed);
        assert_eq!(record.message.as_deref(), Some(CRASHED_MESSAGE));
        assert!(jobs.locks().holder("crasher").unwrap().is_none());

        // The slot is free again.
        sh(&jobs, "crasher", "exit 0");
    }

    #[test]
    fn worker_output_lands_in_the_job_log() {
        let dir = tempdir().unwrap();
        let jobs = controller_with(dir.path(), UnixLauncher, Duration::from_secs(1));
        let pid = sh(&jobs, "chatty", "echo phase-one >&2");
        process::wait_for_exit(pid, None, Duration::from_secs(5), Duration::from_millis(20));

        let log = jobs.config().log_path("chatty");
        let deadline = Instant::now() + Duration::from_secs(2);
        loop {
            let text = std::fs::read_to_string(&log).unwrap_or_default();
            if text.contains("phase-one") {
                break;
            }
            assert!(Instant::now() < deadline, "log never received worker output");
            std::thread::sleep(Duration::from_millis(20));
        }
    }
}

#[test]
fn progress_store_outlives_the_lock() {
    let dir = tempdir().unwrap();
    let jobs = controller_with(dir.path(), InProcessLauncher, Duration::from_secs(1));
    jobs.start("nightly", "/bin/worker", &[]).unwrap();
    jobs.complete("nightly", true, "ok").unwrap();

    let store = FsProgressStore::new(jobs.config().progress_dir());
    let record = store.get("nightly").unwrap().unwrap();
    assert_eq!(record.status, JobStatus::Completed);
    assert!(record.completed_at.is_some());
}
