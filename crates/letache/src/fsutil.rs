// File helpers shared by the lock registry and the progress store

use serde::de::DeserializeOwned;
use serde::Serialize;
use std::fs;
use std::io::{ErrorKind, Write};
use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};

use crate::Result;

static TEMP_COUNTER: AtomicU64 = AtomicU64::new(0);

/// Replace `path` with `value` so readers see either the old or the new
/// record, never a partial one.
pub(crate) fn write_json_atomic<T: Serialize>(path: &Path, value: &T) -> Result<()> {
    let dir = path.parent().unwrap_or_else(|| Path::new("."));
    fs::create_dir_all(dir)?;

    let file_name = path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| "record".to_string());
    let tmp = dir.join(format!(
        ".{}.{}.{}.tmp",
        file_name,
        std::process::id(),
        TEMP_COUNTER.fetch_add(1, Ordering::Relaxed)
    ));

    let bytes = serde_json::to_vec_pretty(value)?;
    let written = (|| -> std::io::Result<()> {
        let mut file = fs::File::create(&tmp)?;
        file.write_all(&bytes)?;
        file.sync_all()?;
        fs::rename(&tmp, path)
    })();

    if written.is_err() {
        let _ = fs::remove_file(&tmp);
    }
    Ok(written?)
}

/// Exclusive advisory lock over a directory, held until dropped.
#[cfg(unix)]
pub(crate) type DirGuard = nix::fcntl::Flock<fs::File>;

#[cfg(not(unix))]
pub(crate) type DirGuard = ();

/// Take the guard file `name` in `dir`, blocking until it is free.
///
/// Serialises read-modify-write sequences across processes sharing `dir`.
#[cfg(unix)]
pub(crate) fn lock_dir(dir: &Path, name: &str) -> Result<DirGuard> {
    use nix::fcntl::{Flock, FlockArg};

    fs::create_dir_all(dir)?;
    let file = fs::OpenOptions::new()
        .read(true)
        .write(true)
        .create(true)
        .truncate(false)
        .open(dir.join(name))?;

    Flock::lock(file, FlockArg::LockExclusive)
        .map_err(|(_, errno)| std::io::Error::from(errno).into())
}

#[cfg(not(unix))]
pub(crate) fn lock_dir(dir: &Path, _name: &str) -> Result<DirGuard> {
    fs::create_dir_all(dir)?;
    Ok(())
}

/// Read and decode a JSON record; `None` when the file does not exist.
pub(crate) fn read_json<T: DeserializeOwned>(path: &Path) -> Result<Option<T>> {
    match fs::read(path) {
        Ok(bytes) => Ok(Some(serde_json::from_slice(&bytes)?)),
        Err(e) if e.kind() == ErrorKind::NotFound => Ok(None),
        Err(e) => Err(e.into()),
    }
}

/// Remove a file, treating "already gone" as success.
pub(crate) fn remove_if_exists(path: &Path) -> Result<bool> {
    match fs::remove_file(path) {
        Ok(()) => Ok(true),
        Err(e) if e.kind() == ErrorKind::NotFound => Ok(false),
        Err(e) => Err(e.into()),
    }
}

/// Files in `dir` with the given extension; empty if `dir` is missing.
pub(crate) fn list_with_extension(dir: &Path, extension: &str) -> Result<Vec<std::path::PathBuf>> {
    let entries = match fs::read_dir(dir) {
        Ok(entries) => entries,
        Err(e) if e.kind() == ErrorKind::NotFound => return Ok(Vec::new()),
        Err(e) => return Err(e.into()),
    };

    let mut paths = Vec::new();
    for entry in entries {
        let path = entry?.path();
        let hidden = path
            .file_name()
            .map(|n| n.to_string_lossy().starts_with('.'))
            .unwrap_or(true);
        if !hidden && path.extension().map(|e| e == extension).unwrap_or(false) {
            paths.push(path);
        }
    }
    paths.sort();
    Ok(paths)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn atomic_write_then_read_and_remove() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("sub/value.json");

        write_json_atomic(&path, &vec![1, 2, 3]).unwrap();
        let back: Option<Vec<i32>> = read_json(&path).unwrap();
        assert_eq!(back, Some(vec![1, 2, 3]));

        assert!(remove_if_exists(&path).unwrap());
        assert!(!remove_if_exists(&path).unwrap());
        let gone: Option<Vec<i32>> = read_json(&path).unwrap();
        assert!(gone.is_none());
    }

    #[test]
    fn listing_skips_temp_files() {
        let dir = tempdir().unwrap();
        fs::write(dir.path().join("a.lock"), "{}").unwrap();
        fs::write(dir.path().join(".a.lock.1.0.tmp"), "{}").unwrap();
        fs::write(dir.path().join("b.txt"), "").unwrap();

        let found = list_with_extension(dir.path(), "lock").unwrap();
        assert_eq!(found.len(), 1);
        assert!(list_with_extension(&dir.path().join("missing"), "lock")
            .unwrap()
            .is_empty());
    }
}
