//! Database facade: storage root, table lifecycle, KEK custody.
//!
//! A database is a directory under the storage root:
//!
//! ```text
//! <root>/<db>/
//! ├─ .metadata          # JSON: {created, version, cipher}
//! ├─ .cache/<table>/    # query-result cache namespaces
//! ├─ <table>/           # one directory per table
//! └─ .deleted_<name>/   # transient tombstone during delete
//! ```
//!
//! The KEK is derived from the configured passphrase and lives only inside
//! the handle: it is never written to disk, never serialized into caches or
//! backups, and never logged.

use crate::crypto::{self, SecretKey};
use crate::error::{CoreError, CoreResult};
use crate::file;
use crate::query::Query;
use crate::schema::{Schema, ID_COLUMN};
use crate::table::{Table, TableMeta, METADATA_FILE};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

/// Leaked temp files older than this are removed by the open-time sweep.
const TEMP_SWEEP_AGE: Duration = Duration::from_secs(60 * 60);

/// Persistent database metadata.
#[derive(Debug, Clone, Serialize, Deserialize)]
struct DatabaseMeta {
    created: u64,
    version: String,
    /// AEAD used for encrypted columns; readers dispatch on this.
    cipher: String,
}

/// Database statistics reported by [`Database::metadata`].
#[derive(Debug, Clone)]
pub struct DatabaseReport {
    /// Creation time, Unix seconds.
    pub created: u64,
    /// Version of the crate that created the database.
    pub version: String,
    /// AEAD used for encrypted columns.
    pub cipher: String,
    /// Last modification time of the database directory.
    pub modified: SystemTime,
    /// Table count (only populated in excess mode).
    pub tables: usize,
    /// Cumulative row-file size in bytes (only populated in excess mode).
    pub size: u64,
}

/// Configuration for opening a database.
#[derive(Debug, Clone)]
pub struct DatabaseConfig {
    storage: PathBuf,
    kek: Option<String>,
    cache_ttl: Option<Duration>,
}

impl DatabaseConfig {
    /// Creates a configuration rooted at `storage`.
    ///
    /// The storage root must already exist; database directories are
    /// created beneath it.
    #[must_use]
    pub fn new(storage: impl Into<PathBuf>) -> Self {
        Self {
            storage: storage.into(),
            kek: None,
            cache_ttl: None,
        }
    }

    /// Sets the KEK passphrase for transparent data encryption.
    #[must_use]
    pub fn kek(mut self, passphrase: impl Into<String>) -> Self {
        self.kek = Some(passphrase.into());
        self
    }

    /// Sets an expiration window for query-cache entries. Unset means
    /// entries live until the next table write.
    #[must_use]
    pub fn cache_ttl(mut self, ttl: Duration) -> Self {
        self.cache_ttl = Some(ttl);
        self
    }
}

/// The entry point for all store operations.
///
/// # Example
///
/// ```rust,ignore
/// use silodb_core::{Database, DatabaseConfig};
///
/// let db = Database::open("app", DatabaseConfig::new("./data"))?;
/// db.create_table("users", None)?;
/// let users = db.table("users")?;
/// let id = users.insert(serde_json::json!({"name": "ada"}))?;
/// ```
#[derive(Debug)]
pub struct Database {
    name: String,
    storage: PathBuf,
    kek: Option<SecretKey>,
    cache_ttl: Option<Duration>,
}

impl Database {
    /// Opens (creating on first use) the database `name` under the
    /// configured storage root.
    ///
    /// First open creates the directory and its metadata record; a failure
    /// writing the metadata rolls the directory back. Leaked temp files
    /// from crashed writers are swept here.
    ///
    /// # Errors
    ///
    /// Fails with [`CoreError::NameInvalid`] for a non-alphanumeric name,
    /// [`CoreError::NotFound`] if the storage root is not a directory, and
    /// [`CoreError::Io`] on filesystem failures.
    pub fn open(name: &str, config: DatabaseConfig) -> CoreResult<Self> {
        file::validate_name(name)?;
        if !config.storage.is_dir() {
            return Err(CoreError::not_found(format!(
                "storage root {}",
                config.storage.display()
            )));
        }

        let db = Self {
            name: name.to_string(),
            storage: config.storage.canonicalize()?,
            kek: config
                .kek
                .as_deref()
                .filter(|p| !p.is_empty())
                .map(SecretKey::derive_from_passphrase),
            cache_ttl: config.cache_ttl,
        };

        let folder = db.folder();
        let created = !folder.is_dir();
        if created {
            fs::create_dir(&folder)?;
        }
        if !folder.join(METADATA_FILE).is_file() {
            let meta = DatabaseMeta {
                created: unix_now(),
                version: env!("CARGO_PKG_VERSION").to_string(),
                cipher: crypto::CIPHER_NAME.to_string(),
            };
            if let Err(e) = file::write_json(&folder.join(METADATA_FILE), &meta) {
                if created {
                    let _ = file::remove_tree(&folder);
                }
                return Err(e);
            }
            tracing::info!(database = %db.name, "database created");
        }

        if let Err(e) = file::sweep_stale_temps(&folder, TEMP_SWEEP_AGE) {
            tracing::warn!(database = %db.name, error = %e, "temp sweep failed");
        }
        Ok(db)
    }

    /// Returns the database name.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Returns the absolute storage root.
    #[must_use]
    pub fn storage(&self) -> &Path {
        &self.storage
    }

    /// Returns the absolute path of the database directory.
    #[must_use]
    pub fn folder(&self) -> PathBuf {
        self.storage.join(&self.name)
    }

    /// Returns the derived KEK, if one was configured.
    pub(crate) fn kek(&self) -> Option<&SecretKey> {
        self.kek.as_ref()
    }

    /// Returns the configured cache expiration window.
    pub(crate) fn cache_ttl(&self) -> Option<Duration> {
        self.cache_ttl
    }

    /// Returns database statistics. With `excess`, table count and
    /// cumulative size are computed from every table.
    pub fn metadata(&self, excess: bool) -> CoreResult<DatabaseReport> {
        let meta: DatabaseMeta = file::read_json(&self.folder().join(METADATA_FILE))?;
        let modified = fs::metadata(self.folder())?.modified()?;
        let mut report = DatabaseReport {
            created: meta.created,
            version: meta.version,
            cipher: meta.cipher,
            modified,
            tables: 0,
            size: 0,
        };
        if excess {
            for table in self.tables(&[])? {
                let stats = table.metadata(true)?;
                report.tables += 1;
                report.size += stats.size;
            }
        }
        Ok(report)
    }

    /// Creates a table; returns `Ok(false)` if it already exists.
    ///
    /// With a schema containing encrypted columns, a fresh DEK is generated
    /// and stored wrapped under the KEK. A failure writing the table
    /// metadata rolls the table directory back.
    ///
    /// # Errors
    ///
    /// Fails with [`CoreError::NameInvalid`] for a bad name and
    /// [`CoreError::KekRequired`] for encrypted columns without a KEK.
    pub fn create_table(&self, name: &str, schema: Option<Schema>) -> CoreResult<bool> {
        file::validate_name(name)?;
        let folder = self.folder().join(name);
        if folder.is_dir() {
            return Ok(false);
        }

        let mut schema = schema.unwrap_or_default();
        schema.remove(ID_COLUMN);

        let dek = if schema.has_encrypted_columns() {
            let kek = self.kek.as_ref().ok_or_else(|| {
                CoreError::kek_required("schema has encrypted columns")
            })?;
            let (_, wrapped) = crypto::generate_dek(kek)?;
            wrapped
        } else {
            String::new()
        };

        fs::create_dir(&folder)?;
        let meta = TableMeta {
            created: unix_now(),
            schema,
            dek,
        };
        if let Err(e) = file::write_json(&folder.join(METADATA_FILE), &meta) {
            let _ = file::remove_tree(&folder);
            return Err(e);
        }
        tracing::info!(database = %self.name, table = %name, "table created");
        Ok(true)
    }

    /// Opens an existing table.
    pub fn table(&self, name: &str) -> CoreResult<Table<'_>> {
        Table::open(name, self)
    }

    /// Opens every table, minus `exclude`.
    pub fn tables(&self, exclude: &[&str]) -> CoreResult<Vec<Table<'_>>> {
        let mut tables = Vec::new();
        for entry in fs::read_dir(self.folder())? {
            let entry = entry?;
            if !entry.file_type()?.is_dir() {
                continue;
            }
            let name = entry.file_name();
            let Some(name) = name.to_str() else { continue };
            if file::validate_name(name).is_err() || exclude.contains(&name) {
                continue;
            }
            if entry.path().join(METADATA_FILE).is_file() {
                tables.push(Table::open(name, self)?);
            }
        }
        tables.sort_by(|a, b| a.name().cmp(b.name()));
        Ok(tables)
    }

    /// Returns a query over `table`.
    #[must_use]
    pub fn query(&self, table: &str) -> Query<'_> {
        Query::new(self, table)
    }

    /// Renames the database directory; returns `Ok(false)` if the target
    /// name is taken.
    pub fn rename(&mut self, new_name: &str) -> CoreResult<bool> {
        file::validate_name(new_name)?;
        let target = self.storage.join(new_name);
        if target.is_dir() {
            return Ok(false);
        }
        fs::rename(self.folder(), &target)?;
        self.name = new_name.to_string();
        Ok(true)
    }

    /// Deletes the database: directory renamed to a tombstone, then
    /// removed.
    pub fn delete(self) -> CoreResult<()> {
        let tombstone = self.storage.join(format!(".deleted_{}", self.name));
        file::remove_tree(&tombstone)?;
        fs::rename(self.folder(), &tombstone)?;
        file::remove_tree(&tombstone)?;
        tracing::info!(database = %self.name, "database deleted");
        Ok(())
    }
}

fn unix_now() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schema::{ColumnDef, ColumnType};
    use tempfile::TempDir;

    #[test]
    fn open_creates_directory_and_metadata() {
        let dir = TempDir::new().unwrap();
        let db = Database::open("mydb", DatabaseConfig::new(dir.path())).unwrap();

        assert!(db.folder().is_dir());
        let report = db.metadata(false).unwrap();
        assert_eq!(report.version, env!("CARGO_PKG_VERSION"));
        assert_eq!(report.cipher, "aes-256-gcm");
        assert!(report.created > 0);
    }

    #[test]
    fn reopen_is_idempotent() {
        let dir = TempDir::new().unwrap();
        let first = Database::open("mydb", DatabaseConfig::new(dir.path())).unwrap();
        let created = first.metadata(false).unwrap().created;

        let again = Database::open("mydb", DatabaseConfig::new(dir.path())).unwrap();
        assert_eq!(again.metadata(false).unwrap().created, created);
    }

    #[test]
    fn names_are_validated() {
        let dir = TempDir::new().unwrap();
        assert!(matches!(
            Database::open("bad name", DatabaseConfig::new(dir.path())),
            Err(CoreError::NameInvalid { .. })
        ));

        let db = Database::open("ok", DatabaseConfig::new(dir.path())).unwrap();
        assert!(db.create_table("../evil", None).is_err());
    }

    #[test]
    fn missing_storage_root_is_not_found() {
        let dir = TempDir::new().unwrap();
        let missing = dir.path().join("nope");
        assert!(matches!(
            Database::open("db", DatabaseConfig::new(&missing)),
            Err(CoreError::NotFound { .. })
        ));
    }

    #[test]
    fn create_table_reports_existing() {
        let dir = TempDir::new().unwrap();
        let db = Database::open("db", DatabaseConfig::new(dir.path())).unwrap();

        assert!(db.create_table("t", None).unwrap());
        assert!(!db.create_table("t", None).unwrap());
    }

    #[test]
    fn encrypted_schema_requires_kek() {
        let dir = TempDir::new().unwrap();
        let schema = || Some(Schema::new().add("card", ColumnDef::new(ColumnType::Text).encrypted()));

        let plain = Database::open("db", DatabaseConfig::new(dir.path())).unwrap();
        assert!(matches!(
            plain.create_table("cards", schema()),
            Err(CoreError::KekRequired { .. })
        ));

        let keyed =
            Database::open("db", DatabaseConfig::new(dir.path()).kek("s3cret")).unwrap();
        assert!(keyed.create_table("cards", schema()).unwrap());

        // Wrapped DEK is persisted in the table metadata.
        let meta: TableMeta =
            file::read_json(&keyed.folder().join("cards").join(METADATA_FILE)).unwrap();
        assert!(!meta.dek.is_empty());
    }

    #[test]
    fn tables_lists_and_excludes() {
        let dir = TempDir::new().unwrap();
        let db = Database::open("db", DatabaseConfig::new(dir.path())).unwrap();
        db.create_table("aaa", None).unwrap();
        db.create_table("bbb", None).unwrap();

        let names: Vec<_> = db
            .tables(&[])
            .unwrap()
            .iter()
            .map(|t| t.name().to_string())
            .collect();
        assert_eq!(names, vec!["aaa", "bbb"]);

        let filtered = db.tables(&["aaa"]).unwrap();
        assert_eq!(filtered.len(), 1);
        assert_eq!(filtered[0].name(), "bbb");
    }

    #[test]
    fn rename_and_delete() {
        let dir = TempDir::new().unwrap();
        let mut db = Database::open("one", DatabaseConfig::new(dir.path())).unwrap();
        Database::open("two", DatabaseConfig::new(dir.path())).unwrap();

        assert!(!db.rename("two").unwrap());
        assert!(db.rename("three").unwrap());
        assert!(dir.path().join("three").is_dir());
        assert!(!dir.path().join("one").exists());

        db.delete().unwrap();
        assert!(!dir.path().join("three").exists());
        assert!(!dir.path().join(".deleted_three").exists());
    }

    #[test]
    fn excess_metadata_counts_tables() {
        let dir = TempDir::new().unwrap();
        let db = Database::open("db", DatabaseConfig::new(dir.path())).unwrap();
        db.create_table("t1", None).unwrap();
        db.create_table("t2", None).unwrap();
        db.table("t1")
            .unwrap()
            .insert(serde_json::json!({"x": 1}))
            .unwrap();

        let report = db.metadata(true).unwrap();
        assert_eq!(report.tables, 2);
        assert!(report.size > 0);
    }
}
