//! Detached worker launch
//!
//! The worker must outlive whoever started it: a CLI invocation that exits
//! right away, or a UI process that restarts. Platform handling lives here
//! and is picked once through [`DefaultLauncher`].

use std::fs::{self, File, OpenOptions};
use std::path::PathBuf;
use std::process::{Command, Stdio};

use crate::{JobError, Result};

/// What to launch for a job.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LaunchSpec {
    /// Job the worker runs for
    pub job_name: String,
    /// Program to execute
    pub program: PathBuf,
    /// Program arguments
    pub args: Vec<String>,
    /// Working directory of the worker
    pub workdir: Option<PathBuf>,
    /// File receiving the worker's stdout and stderr
    pub log_path: Option<PathBuf>,
}

impl LaunchSpec {
    fn command(&self) -> Result<Command> {
        let mut cmd = Command::new(&self.program);
        cmd.args(&self.args).stdin(Stdio::null());
        if let Some(dir) = &self.workdir {
            cmd.current_dir(dir);
        }

        match &self.log_path {
            Some(path) => {
                let log = open_log(path)?;
                let err = log.try_clone()?;
                cmd.stdout(Stdio::from(log)).stderr(Stdio::from(err));
            }
            None => {
                cmd.stdout(Stdio::null()).stderr(Stdio::null());
            }
        }
        Ok(cmd)
    }
}

fn open_log(path: &std::path::Path) -> Result<File> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }
    Ok(OpenOptions::new().create(true).append(true).open(path)?)
}

/// Starts worker processes.
pub trait ProcessLauncher: Send + Sync {
    /// Start the worker described by `spec` and return its pid.
    fn launch(&self, spec: &LaunchSpec) -> Result<u32>;
}

/// Launcher that puts the worker in its own session.
#[cfg(unix)]
#[derive(Debug, Clone, Copy, Default)]
pub struct UnixLauncher;

#[cfg(unix)]
impl ProcessLauncher for UnixLauncher {
    fn launch(&self, spec: &LaunchSpec) -> Result<u32> {
        use std::os::unix::process::CommandExt;

        let mut cmd = spec.command()?;
        // SAFETY: setsid is async-signal-safe and touches no parent state.
        unsafe {
            cmd.pre_exec(|| {
                nix::unistd::setsid()
                    .map(|_| ())
                    .map_err(std::io::Error::from)
            });
        }

        let mut child = cmd
            .spawn()
            .map_err(|e| JobError::Launch(format!("{}: {}", spec.program.display(), e)))?;
        let pid = child.id();

        // Reap the worker when it exits so it never lingers as a zombie of a
        // long-lived launcher.
        std::thread::Builder::new()
            .name(format!("reap-{}", pid))
            .spawn(move || {
                let _ = child.wait();
            })?;

        tracing::info!(job = %spec.job_name, pid, program = %spec.program.display(), "worker launched");
        Ok(pid)
    }
}

/// Launcher that detaches the worker from the parent console.
#[cfg(windows)]
#[derive(Debug, Clone, Copy, Default)]
pub struct WindowsLauncher;

#[cfg(windows)]
impl ProcessLauncher for WindowsLauncher {
    fn launch(&self, spec: &LaunchSpec) -> Result<u32> {
        use std::os::windows::process::CommandExt;

        const DETACHED_PROCESS: u32 = 0x0000_0008;
        const CREATE_NEW_PROCESS_GROUP: u32 = 0x0000_0200;

        let mut cmd = spec.command()?;
        cmd.creation_flags(DETACHED_PROCESS | CREATE_NEW_PROCESS_GROUP);

        let child = cmd
            .spawn()
            .map_err(|e| JobError::Launch(format!("{}: {}", spec.program.display(), e)))?;
        let pid = child.id();
        tracing::info!(job = %spec.job_name, pid, program = %spec.program.display(), "worker launched");
        Ok(pid)
    }
}

/// Launcher for the current platform.
#[cfg(unix)]
pub type DefaultLauncher = UnixLauncher;

/// Launcher for the current platform.
#[cfg(windows)]
pub type DefaultLauncher = WindowsLauncher;
