//! Path composition and atomic file I/O.
//!
//! All writes in silodb go through [`atomic_write`]:
//!
//! ```text
//! <path>.wal.<random>   # temp file, exclusively locked while written
//!        │ write + flush + fsync
//!        ▼
//! <path>                # same-directory rename, then parent fsync
//! ```
//!
//! A reader of `<path>` sees either the pre-existing content or the full new
//! content, never a truncated or interleaved state, provided the filesystem
//! offers atomic same-directory rename (POSIX semantics assumed).
//!
//! Identifier validation lives here too: database, table and row names are
//! path components, and the alphanumeric rule is what keeps composed paths
//! inside the storage root.

use crate::crypto;
use crate::error::{CoreError, CoreResult};
use fs2::FileExt;
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::fs::{self, File, OpenOptions};
use std::io::{BufRead, BufReader, Write};
use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime};

/// Validates that an identifier (database, table or row name) is non-empty
/// ASCII alphanumeric.
///
/// Identifiers become path components, so this rule doubles as path-traversal
/// protection.
///
/// # Errors
///
/// Returns [`CoreError::NameInvalid`] otherwise.
pub fn validate_name(name: &str) -> CoreResult<()> {
    if !name.is_empty() && name.bytes().all(|b| b.is_ascii_alphanumeric()) {
        Ok(())
    } else {
        Err(CoreError::name_invalid(name))
    }
}

/// Writes `bytes` to `path` atomically.
///
/// The content is written to a `<path>.wal.<random>` sibling under an
/// exclusive advisory lock, flushed and fsynced, then renamed over the
/// target. The parent directory is fsynced after the rename so the new
/// directory entry is durable. On any failure after the temp file exists,
/// the temp file is removed and the target is untouched.
///
/// # Errors
///
/// Returns [`CoreError::Io`] if locking, writing, syncing or renaming fails.
pub fn atomic_write(path: &Path, bytes: &[u8]) -> CoreResult<()> {
    let temp = temp_path(path);
    let result = write_locked(&temp, path, bytes);
    if result.is_err() {
        let _ = fs::remove_file(&temp);
    }
    result
}

fn temp_path(path: &Path) -> PathBuf {
    let mut name = path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default();
    name.push_str(".wal.");
    name.push_str(&crypto::random_id(4));
    path.with_file_name(name)
}

fn write_locked(temp: &Path, target: &Path, bytes: &[u8]) -> CoreResult<()> {
    let file = OpenOptions::new()
        .write(true)
        .create_new(true)
        .open(temp)?;
    file.lock_exclusive()?;

    let locked = (|| -> CoreResult<()> {
        let mut file = &file;
        file.write_all(bytes)?;
        file.flush()?;
        file.sync_all()?;
        Ok(())
    })();
    let unlocked = fs2::FileExt::unlock(&file);
    locked?;
    unlocked?;

    fs::rename(temp, target)?;
    sync_parent(target)?;
    Ok(())
}

/// Fsyncs the parent directory so a rename survives a crash.
///
/// Directory fsync is not supported everywhere (notably Windows); failures
/// to open the directory are ignored, failures to sync are not.
fn sync_parent(path: &Path) -> CoreResult<()> {
    if let Some(parent) = path.parent() {
        if let Ok(dir) = File::open(parent) {
            dir.sync_all()?;
        }
    }
    Ok(())
}

/// Reads the `index`-th newline-delimited line without loading the whole
/// file.
///
/// Returns `None` if the file has fewer lines. The trailing newline is
/// stripped.
pub fn read_line(path: &Path, index: usize) -> CoreResult<Option<String>> {
    let reader = BufReader::new(File::open(path)?);
    for (i, line) in reader.lines().enumerate() {
        let line = line?;
        if i == index {
            return Ok(Some(line));
        }
    }
    Ok(None)
}

/// Reads all newline-delimited lines, trailing newlines stripped.
pub fn read_lines(path: &Path) -> CoreResult<Vec<String>> {
    let reader = BufReader::new(File::open(path)?);
    let mut lines = Vec::new();
    for line in reader.lines() {
        lines.push(line?);
    }
    Ok(lines)
}

/// Serializes `value` as JSON and writes it atomically.
pub fn write_json<T: Serialize>(path: &Path, value: &T) -> CoreResult<()> {
    let bytes = serde_json::to_vec(value)?;
    atomic_write(path, &bytes)
}

/// Reads and deserializes a JSON file.
pub fn read_json<T: DeserializeOwned>(path: &Path) -> CoreResult<T> {
    let bytes = fs::read(path)?;
    Ok(serde_json::from_slice(&bytes)?)
}

/// Removes a directory tree, tolerating an already-absent root.
pub fn remove_tree(path: &Path) -> CoreResult<()> {
    match fs::remove_dir_all(path) {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(e.into()),
    }
}

/// Removes leaked `*.wal.*` temp files older than `max_age` under `dir`,
/// one level deep into subdirectories.
///
/// A cancelled or crashed write that never reached its rename leaves its
/// temp file behind; such a file is equivalent to no write and safe to
/// delete. Files younger than `max_age` may belong to an in-flight write in
/// another process and are left alone.
pub fn sweep_stale_temps(dir: &Path, max_age: Duration) -> CoreResult<()> {
    sweep_dir(dir, max_age)?;
    for entry in fs::read_dir(dir)? {
        let entry = entry?;
        if entry.file_type()?.is_dir() {
            sweep_dir(&entry.path(), max_age)?;
        }
    }
    Ok(())
}

fn sweep_dir(dir: &Path, max_age: Duration) -> CoreResult<()> {
    for entry in fs::read_dir(dir)? {
        let entry = entry?;
        let name = entry.file_name();
        let is_temp = name.to_string_lossy().contains(".wal.");
        if !is_temp || !entry.file_type()?.is_file() {
            continue;
        }
        let modified = entry.metadata()?.modified()?;
        let age = SystemTime::now()
            .duration_since(modified)
            .unwrap_or(Duration::ZERO);
        if age >= max_age {
            tracing::warn!(path = %entry.path().display(), "removing stale temp file");
            let _ = fs::remove_file(entry.path());
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn validate_names() {
        assert!(validate_name("users1").is_ok());
        assert!(validate_name("ABC").is_ok());
        assert!(validate_name("").is_err());
        assert!(validate_name("a/b").is_err());
        assert!(validate_name("..").is_err());
        assert!(validate_name("a b").is_err());
    }

    #[test]
    fn atomic_write_creates_file() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("data.txt");

        atomic_write(&path, b"hello").unwrap();
        assert_eq!(fs::read(&path).unwrap(), b"hello");
    }

    #[test]
    fn atomic_write_replaces_content() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("data.txt");

        atomic_write(&path, b"old").unwrap();
        atomic_write(&path, b"new content").unwrap();
        assert_eq!(fs::read(&path).unwrap(), b"new content");
    }

    #[test]
    fn atomic_write_leaves_no_temp_files() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("data.txt");

        atomic_write(&path, b"x").unwrap();

        let names: Vec<_> = fs::read_dir(dir.path())
            .unwrap()
            .map(|e| e.unwrap().file_name().to_string_lossy().into_owned())
            .collect();
        assert_eq!(names, vec!["data.txt"]);
    }

    #[test]
    fn read_line_by_index() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("lines.txt");
        atomic_write(&path, b"zero\none\ntwo\n").unwrap();

        assert_eq!(read_line(&path, 0).unwrap().unwrap(), "zero");
        assert_eq!(read_line(&path, 2).unwrap().unwrap(), "two");
        assert!(read_line(&path, 3).unwrap().is_none());
    }

    #[test]
    fn read_all_lines() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("lines.txt");
        atomic_write(&path, b"a\nb\n").unwrap();

        assert_eq!(read_lines(&path).unwrap(), vec!["a", "b"]);
    }

    #[test]
    fn json_roundtrip() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("meta.json");

        let value = serde_json::json!({"created": 1, "version": "0.1.0"});
        write_json(&path, &value).unwrap();
        let back: serde_json::Value = read_json(&path).unwrap();
        assert_eq!(back, value);
    }

    #[test]
    fn remove_tree_tolerates_missing() {
        let dir = TempDir::new().unwrap();
        remove_tree(&dir.path().join("nope")).unwrap();
    }

    #[test]
    fn sweep_removes_only_stale_temps() {
        let dir = TempDir::new().unwrap();
        let stale = dir.path().join("row.ndjson.wal.abcd1234");
        let keep = dir.path().join("row.ndjson");
        fs::write(&stale, b"partial").unwrap();
        fs::write(&keep, b"full").unwrap();

        // Zero threshold: every temp is stale.
        sweep_stale_temps(dir.path(), Duration::ZERO).unwrap();
        assert!(!stale.exists());
        assert!(keep.exists());

        // Fresh temp under a generous threshold survives.
        let fresh = dir.path().join("row.ndjson.wal.ffff0000");
        fs::write(&fresh, b"partial").unwrap();
        sweep_stale_temps(dir.path(), Duration::from_secs(3600)).unwrap();
        assert!(fresh.exists());
    }
}
