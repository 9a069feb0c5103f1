//! Content-addressed query-result cache.
//!
//! Layout: one file per cached result under
//! `<storage>/<db>/.cache/<table>/<hash>`, where the hash is the hex
//! SHA-256 of the query's canonical payload and the content is the gzipped
//! JSON serialization of the materialized result vector.
//!
//! The per-table directory is the invalidation unit: every successful write
//! to a table removes its whole cache namespace, which is what makes stale
//! entries unreachable. Cache failures are never fatal — a failed read
//! falls through to recomputation, a failed write is logged and ignored by
//! the caller.

use crate::error::CoreResult;
use crate::file;
use crate::row::Record;
use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use flate2::Compression;
use serde_json::Value;
use sha2::{Digest, Sha256};
use std::fs;
use std::io::{Read, Write};
use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime};

/// Name of the cache directory inside a database folder.
pub(crate) const CACHE_DIR: &str = ".cache";

/// Handle to one table's cache namespace, optionally keyed to one query.
#[derive(Debug)]
pub struct QueryCache {
    dir: PathBuf,
    file: Option<PathBuf>,
    ttl: Option<Duration>,
}

impl QueryCache {
    /// Handle to the whole namespace of a table, for invalidation.
    pub(crate) fn namespace(db_folder: &Path, table: &str) -> Self {
        Self {
            dir: db_folder.join(CACHE_DIR).join(table),
            file: None,
            ttl: None,
        }
    }

    /// Handle keyed to one canonical query payload.
    pub(crate) fn keyed(
        db_folder: &Path,
        table: &str,
        payload: &Value,
        ttl: Option<Duration>,
    ) -> Self {
        let dir = db_folder.join(CACHE_DIR).join(table);
        let hash = hex::encode(Sha256::digest(payload.to_string().as_bytes()));
        Self {
            file: Some(dir.join(hash)),
            dir,
            ttl,
        }
    }

    /// Path of the keyed cache file.
    ///
    /// # Panics
    ///
    /// Panics if the handle is a bare namespace (internal misuse).
    fn path(&self) -> &Path {
        self.file
            .as_deref()
            .unwrap_or_else(|| unreachable!("keyed cache operation on a namespace handle"))
    }

    /// Returns whether a usable cache entry exists.
    ///
    /// An entry past its TTL is unlinked and reported invalid.
    pub fn valid(&self) -> bool {
        let path = self.path();
        let Ok(meta) = fs::metadata(path) else {
            return false;
        };
        let Some(ttl) = self.ttl else {
            return true;
        };
        let age = meta
            .modified()
            .ok()
            .and_then(|m| SystemTime::now().duration_since(m).ok())
            .unwrap_or(Duration::ZERO);
        if age > ttl {
            let _ = fs::remove_file(path);
            return false;
        }
        true
    }

    /// Reads and decompresses the cached result vector.
    pub fn get(&self) -> CoreResult<Vec<Record>> {
        let compressed = fs::read(self.path())?;
        let mut decoder = GzDecoder::new(compressed.as_slice());
        let mut bytes = Vec::new();
        decoder.read_to_end(&mut bytes)?;
        Ok(serde_json::from_slice(&bytes)?)
    }

    /// Compresses and atomically writes a result vector.
    pub fn put(&self, rows: &[Record]) -> CoreResult<()> {
        fs::create_dir_all(&self.dir)?;
        let bytes = serde_json::to_vec(rows)?;
        let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
        encoder.write_all(&bytes)?;
        let compressed = encoder.finish()?;
        file::atomic_write(self.path(), &compressed)
    }

    /// Removes the table's whole cache namespace.
    pub fn flush(&self) -> CoreResult<()> {
        file::remove_tree(&self.dir)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::collections::BTreeMap;
    use tempfile::TempDir;

    fn record(id: &str, n: i64) -> Record {
        let mut cols = BTreeMap::new();
        cols.insert("n".to_string(), json!(n));
        Record::with_id(id, cols)
    }

    #[test]
    fn put_get_roundtrip() {
        let dir = TempDir::new().unwrap();
        let payload = json!({"where": {"n": ["=", 1]}});
        let cache = QueryCache::keyed(dir.path(), "t", &payload, None);

        assert!(!cache.valid());
        let rows = vec![record("aa", 1), record("bb", 2)];
        cache.put(&rows).unwrap();
        assert!(cache.valid());
        assert_eq!(cache.get().unwrap(), rows);
    }

    #[test]
    fn key_is_deterministic_per_payload() {
        let dir = TempDir::new().unwrap();
        let a = QueryCache::keyed(dir.path(), "t", &json!({"a": 1}), None);
        let b = QueryCache::keyed(dir.path(), "t", &json!({"a": 1}), None);
        let c = QueryCache::keyed(dir.path(), "t", &json!({"a": 2}), None);

        assert_eq!(a.path(), b.path());
        assert_ne!(a.path(), c.path());
    }

    #[test]
    fn flush_removes_namespace() {
        let dir = TempDir::new().unwrap();
        let cache = QueryCache::keyed(dir.path(), "t", &json!({}), None);
        cache.put(&[record("aa", 1)]).unwrap();
        assert!(cache.valid());

        QueryCache::namespace(dir.path(), "t").flush().unwrap();
        assert!(!cache.valid());
        // Flushing an already-absent namespace is fine.
        QueryCache::namespace(dir.path(), "t").flush().unwrap();
    }

    #[test]
    fn expired_entry_is_unlinked() {
        let dir = TempDir::new().unwrap();
        let payload = json!({});
        let cache = QueryCache::keyed(dir.path(), "t", &payload, Some(Duration::ZERO));
        cache.put(&[record("aa", 1)]).unwrap();

        std::thread::sleep(Duration::from_millis(20));
        assert!(!cache.valid());
        let fresh = QueryCache::keyed(dir.path(), "t", &payload, None);
        assert!(!fresh.valid());
    }
}
