//! Exclusive job slots
//!
//! A slot is held by a lock record naming a process. Creation is
//! create-if-absent, so of several racing callers exactly one wins. A record
//! whose process is gone is reclaimed during acquisition.

use std::fs::{self, OpenOptions};
use std::io::{ErrorKind, Write};
use std::path::{Path, PathBuf};

use tracing::{debug, info, warn};

use crate::fsutil::{
    list_with_extension, lock_dir, read_json, remove_if_exists, write_json_atomic, DirGuard,
};
use crate::record::JobRecord;
use crate::{validate_job_name, JobError, Result};

/// Attempts before acquisition gives up on a slot that keeps flipping.
const MAX_ACQUIRE_ATTEMPTS: usize = 3;

/// Outcome of [`LockRegistry::acquire`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Acquisition {
    /// The caller now holds the slot
    Locked,
    /// A live process holds the slot
    AlreadyRunning(JobRecord),
}

/// Ownership of named job slots.
pub trait LockRegistry: Send + Sync {
    /// Take the slot for `claim.job_name`, reclaiming it if the holder died.
    fn acquire(&self, claim: &JobRecord) -> Result<Acquisition>;

    /// Replace the record of a held slot, e.g. after the worker launched.
    fn assign(&self, record: &JobRecord) -> Result<()>;

    /// Free the slot. Releasing a free slot is not an error.
    fn release(&self, job_name: &str) -> Result<()>;

    /// Free the slot only while it still holds exactly `expected`.
    ///
    /// Returns `false` when the slot was taken over in the meantime, so a
    /// caller acting on an earlier read cannot drop a newer holder's lock.
    fn release_if(&self, expected: &JobRecord) -> Result<bool>;

    /// Current record for the slot, live or not.
    ///
    /// An unparseable record is removed and reported as absent.
    fn holder(&self, job_name: &str) -> Result<Option<JobRecord>>;

    /// Every lock record present.
    fn list(&self) -> Result<Vec<JobRecord>>;
}

/// Lock registry backed by one JSON file per job.
#[derive(Debug, Clone)]
pub struct FsLockRegistry {
    dir: PathBuf,
}

impl FsLockRegistry {
    /// Registry storing lock files under `dir`.
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    /// Directory holding the lock files.
    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn path_for(&self, job_name: &str) -> PathBuf {
        self.dir.join(format!("{}.lock", job_name))
    }

    fn read(&self, job_name: &str) -> Result<Option<JobRecord>> {
        let path = self.path_for(job_name);
        match read_json::<JobRecord>(&path) {
            Ok(Some(record)) => {
                record.check_schema()?;
                Ok(Some(record))
            }
            Ok(None) => Ok(None),
            Err(JobError::Format(err)) => {
                // A holder that died mid-write leaves an unparseable lock.
                warn!(job = job_name, error = %err, "unreadable lock record, treating as stale");
                remove_if_exists(&path)?;
                Ok(None)
            }
            Err(err) => Err(err),
        }
    }

    fn create_exclusive(&self, claim: &JobRecord) -> std::io::Result<()> {
        let path = self.path_for(&claim.job_name);
        let mut file = OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(&path)?;

        let bytes = serde_json::to_vec_pretty(claim)
            .map_err(|e| std::io::Error::new(ErrorKind::InvalidData, e))?;
        let written = file.write_all(&bytes).and_then(|_| file.sync_all());
        if written.is_err() {
            let _ = fs::remove_file(&path);
        }
        written
    }

    /// Serialise the read-check-reclaim-create sequence across processes.
    fn guard(&self) -> Result<DirGuard> {
        lock_dir(&self.dir, ".registry.guard")
    }
}

impl LockRegistry for FsLockRegistry {
    fn acquire(&self, claim: &JobRecord) -> Result<Acquisition> {
        validate_job_name(&claim.job_name)?;
        let _guard = self.guard()?;

        for _ in 0..MAX_ACQUIRE_ATTEMPTS {
            match self.create_exclusive(claim) {
                Ok(()) => {
                    debug!(job = %claim.job_name, pid = claim.pid, "lock acquired");
                    return Ok(Acquisition::Locked);
                }
                Err(e) if e.kind() == ErrorKind::AlreadyExists => {}
                Err(e) => return Err(e.into()),
            }

            match self.read(&claim.job_name)? {
                Some(existing) if existing.is_alive() => {
                    debug!(job = %claim.job_name, pid = existing.pid, "lock held by live process");
                    return Ok(Acquisition::AlreadyRunning(existing));
                }
                Some(existing) => {
                    info!(
                        job = %claim.job_name,
                        pid = existing.pid,
                        "reclaiming stale lock (holder process is gone)"
                    );
                    remove_if_exists(&self.path_for(&claim.job_name))?;
                }
                None => {}
            }
        }

        Err(JobError::Contended(claim.job_name.clone()))
    }

    fn assign(&self, record: &JobRecord) -> Result<()> {
        validate_job_name(&record.job_name)?;
        let _guard = self.guard()?;
        write_json_atomic(&self.path_for(&record.job_name), record)?;
        debug!(job = %record.job_name, pid = record.pid, "lock reassigned");
        Ok(())
    }

    fn release(&self, job_name: &str) -> Result<()> {
        validate_job_name(job_name)?;
        let _guard = self.guard()?;
        if remove_if_exists(&self.path_for(job_name))? {
            debug!(job = job_name, "lock released");
        }
        Ok(())
    }

    fn release_if(&self, expected: &JobRecord) -> Result<bool> {
        validate_job_name(&expected.job_name)?;
        let _guard = self.guard()?;

        match self.read(&expected.job_name)? {
            Some(current) if current == *expected => {
                remove_if_exists(&self.path_for(&expected.job_name))?;
                debug!(job = %expected.job_name, pid = expected.pid, "lock released");
                Ok(true)
            }
            Some(current) => {
                debug!(
                    job = %expected.job_name,
                    expected = expected.pid,
                    holder = current.pid,
                    "lock changed hands, leaving it"
                );
                Ok(false)
            }
            None => Ok(true),
        }
    }

    fn holder(&self, job_name: &str) -> Result<Option<JobRecord>> {
        validate_job_name(job_name)?;
        // Writers hold the guard, so a partial file seen here is a crash leftover.
        let _guard = self.guard()?;
        self.read(job_name)
    }

    fn list(&self) -> Result<Vec<JobRecord>> {
        let mut records = Vec::new();
        for path in list_with_extension(&self.dir, "lock")? {
            match read_json::<JobRecord>(&path) {
                Ok(Some(record)) => records.push(record),
                Ok(None) => {}
                Err(err) => {
                    warn!(path = %path.display(), error = %err, "skipping unreadable lock record")
                }
            }
        }
        Ok(records)
    }
}
