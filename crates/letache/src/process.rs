//! OS process probing and signalling
//!
//! Liveness means "exists and is not a zombie". When a start time was
//! recorded alongside the pid, a process whose start time differs is a
//! different process that reused the pid, and counts as dead.

use std::time::{Duration, Instant};

/// Allowed drift between recorded and observed start times, in seconds.
pub const START_TIME_TOLERANCE_SECS: u64 = 2;

/// Whether `pid` is a live process, optionally cross-checking its start time.
pub fn is_alive(pid: u32, expected_start: Option<u64>) -> bool {
    if pid == 0 {
        return false;
    }
    match (sys::probe(pid), expected_start) {
        (Probe::Running { started_at }, Some(expected)) => match started_at {
            Some(actual) => actual.abs_diff(expected) <= START_TIME_TOLERANCE_SECS,
            None => true,
        },
        (Probe::Running { .. }, None) => true,
        (Probe::Zombie, _) | (Probe::Gone, _) => false,
    }
}

/// Start time of `pid` in seconds since the epoch, when the OS reports it.
pub fn start_time(pid: u32) -> Option<u64> {
    match sys::probe(pid) {
        Probe::Running { started_at } => started_at,
        _ => None,
    }
}

/// Ask `pid` to exit.
pub fn terminate(pid: u32) -> crate::Result<()> {
    sys::terminate(pid)
}

/// Force `pid` to exit.
pub fn kill(pid: u32) -> crate::Result<()> {
    sys::kill(pid)
}

/// Poll until `pid` is no longer alive or `timeout` elapses.
///
/// Returns `true` if the process went away in time.
pub fn wait_for_exit(pid: u32, expected_start: Option<u64>, timeout: Duration, poll: Duration) -> bool {
    let deadline = Instant::now() + timeout;
    loop {
        if !is_alive(pid, expected_start) {
            return true;
        }
        if Instant::now() >= deadline {
            return false;
        }
        std::thread::sleep(poll.min(deadline.saturating_duration_since(Instant::now())));
    }
}

enum Probe {
    Running { started_at: Option<u64> },
    Zombie,
    Gone,
}

#[cfg(unix)]
mod sys {
    use super::Probe;
    use crate::JobError;
    use psutil::process::{Process, Status};

    pub(super) fn probe(pid: u32) -> Probe {
        let Ok(process) = Process::new(pid) else {
            return Probe::Gone;
        };
        match process.status() {
            Ok(Status::Zombie) => Probe::Zombie,
            Ok(_) => Probe::Running {
                started_at: Some(process.create_time().as_secs()),
            },
            Err(_) => Probe::Gone,
        }
    }

    fn signal_error(pid: u32, err: impl std::fmt::Display) -> JobError {
        JobError::Signal {
            pid,
            message: err.to_string(),
        }
    }

    pub(super) fn terminate(pid: u32) -> crate::Result<()> {
        let process = Process::new(pid).map_err(|e| signal_error(pid, e))?;
        process.terminate().map_err(|e| signal_error(pid, e))
    }

    pub(super) fn kill(pid: u32) -> crate::Result<()> {
        let process = Process::new(pid).map_err(|e| signal_error(pid, e))?;
        process.kill().map_err(|e| signal_error(pid, e))
    }
}

#[cfg(windows)]
mod sys {
    use super::Probe;
    use crate::JobError;
    use std::process::{Command, Stdio};

    pub(super) fn probe(pid: u32) -> Probe {
        let output = Command::new("tasklist")
            .args(["/FI", &format!("PID eq {}", pid), "/NH", "/FO", "CSV"])
            .stderr(Stdio::null())
            .output();
        match output {
            Ok(out) if String::from_utf8_lossy(&out.stdout).contains(&format!("\"{}\"", pid)) => {
                Probe::Running { started_at: None }
            }
            _ => Probe::Gone,
        }
    }

    fn taskkill(pid: u32, force: bool) -> crate::Result<()> {
        let mut cmd = Command::new("taskkill");
        cmd.args(["/PID", &pid.to_string(), "/T"]);
        if force {
            cmd.arg("/F");
        }
        let status = cmd
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .status()
            .map_err(|e| JobError::Signal {
                pid,
                message: e.to_string(),
            })?;
        if status.success() {
            Ok(())
        } else {
            Err(JobError::Signal {
                pid,
                message: format!("taskkill exited with {}", status),
            })
        }
    }

    pub(super) fn terminate(pid: u32) -> crate::Result<()> {
        taskkill(pid, false)
    }

    pub(super) fn kill(pid: u32) -> crate::Result<()> {
        taskkill(pid, true)
    }
}
