//! Tables: row lifecycle, metadata and DEK storage.
//!
//! A table is a directory under its database:
//!
//! ```text
//! <db>/<table>/
//! ├─ .metadata          # JSON: {created, schema, dek}
//! ├─ <rowid>.ndjson     # one file per row
//! └─ .deleted_<name>/   # transient tombstone during delete
//! ```
//!
//! The table exists iff the directory exists and contains the metadata
//! record. The `dek` field is the table's data-encryption key wrapped under
//! the database KEK, or empty for tables without encrypted columns.

use crate::cache::QueryCache;
use crate::collection::Collection;
use crate::crypto::{self, SecretKey};
use crate::database::Database;
use crate::error::{CoreError, CoreResult};
use crate::file;
use crate::query::{Op, Query};
use crate::row::{self, Record, Row, ROW_EXT};
use crate::schema::{Schema, ID_COLUMN};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use std::fs;
use std::path::PathBuf;
use std::time::SystemTime;

/// Name of the metadata file inside database and table directories.
pub(crate) const METADATA_FILE: &str = ".metadata";

/// Persistent table metadata.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub(crate) struct TableMeta {
    /// Creation time, Unix seconds.
    pub created: u64,
    /// Declared column schema.
    pub schema: Schema,
    /// Wrapped DEK (base64), or empty when no column is encrypted.
    pub dek: String,
}

/// Table statistics reported by [`Table::metadata`].
#[derive(Debug, Clone)]
pub struct TableReport {
    /// Creation time, Unix seconds.
    pub created: u64,
    /// Last modification time of the table directory.
    pub modified: SystemTime,
    /// Declared column schema.
    pub schema: Schema,
    /// Row count (only populated in excess mode).
    pub rows: usize,
    /// Cumulative row-file size in bytes (only populated in excess mode).
    pub size: u64,
}

/// A handle to one table of a database.
///
/// Obtained from [`Database::table`]; holds no open files. Metadata is read
/// lazily and cached inside the handle.
#[derive(Debug)]
pub struct Table<'db> {
    name: String,
    database: &'db Database,
    meta: RwLock<Option<TableMeta>>,
}

impl<'db> Table<'db> {
    /// Opens an existing table.
    ///
    /// # Errors
    ///
    /// Fails with [`CoreError::NameInvalid`] for a bad name and
    /// [`CoreError::NotFound`] if the directory or its metadata record is
    /// absent.
    pub(crate) fn open(name: &str, database: &'db Database) -> CoreResult<Self> {
        file::validate_name(name)?;
        let table = Self {
            name: name.to_string(),
            database,
            meta: RwLock::new(None),
        };
        if !table.folder().is_dir() || !table.folder().join(METADATA_FILE).is_file() {
            return Err(CoreError::not_found(format!("table {name:?}")));
        }
        Ok(table)
    }

    /// Returns the table name.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Returns the owning database.
    #[must_use]
    pub fn database(&self) -> &'db Database {
        self.database
    }

    /// Returns the absolute path of the table directory.
    #[must_use]
    pub fn folder(&self) -> PathBuf {
        self.database.folder().join(&self.name)
    }

    fn row_path(&self, id: &str) -> PathBuf {
        self.folder().join(format!("{id}.{ROW_EXT}"))
    }

    fn meta(&self) -> CoreResult<TableMeta> {
        if let Some(meta) = self.meta.read().as_ref() {
            return Ok(meta.clone());
        }
        let meta: TableMeta = file::read_json(&self.folder().join(METADATA_FILE))?;
        *self.meta.write() = Some(meta.clone());
        Ok(meta)
    }

    fn invalidate_meta(&self) {
        *self.meta.write() = None;
    }

    /// Returns the declared schema.
    pub fn schema(&self) -> CoreResult<Schema> {
        Ok(self.meta()?.schema)
    }

    /// Returns table statistics. With `excess`, row count and cumulative
    /// size are computed by statting every row file.
    pub fn metadata(&self, excess: bool) -> CoreResult<TableReport> {
        let meta = self.meta()?;
        let modified = fs::metadata(self.folder())?.modified()?;
        let mut report = TableReport {
            created: meta.created,
            modified,
            schema: meta.schema,
            rows: 0,
            size: 0,
        };
        if excess {
            for id in self.row_ids()? {
                let stat = fs::metadata(self.row_path(&id))?;
                report.rows += 1;
                report.size += stat.len();
            }
        }
        Ok(report)
    }

    /// Unwraps the table DEK for one operation's scope.
    ///
    /// Returns `None` when the schema has no encrypted columns.
    ///
    /// # Errors
    ///
    /// Fails with [`CoreError::KekRequired`] when the database has no KEK
    /// and with [`CoreError::CryptoFailed`] when the KEK does not unwrap
    /// the stored DEK.
    pub(crate) fn read_dek(&self) -> CoreResult<Option<SecretKey>> {
        let meta = self.meta()?;
        if !meta.schema.has_encrypted_columns() {
            return Ok(None);
        }
        if meta.dek.is_empty() {
            return Err(CoreError::internal(format!(
                "table {:?} has encrypted columns but no wrapped DEK",
                self.name
            )));
        }
        let kek = self.database.kek().ok_or_else(|| {
            CoreError::kek_required(format!("table {:?} has encrypted columns", self.name))
        })?;
        Ok(Some(crypto::unwrap_dek(kek, &meta.dek)?))
    }

    /// Returns a handle to the row with `id`.
    #[must_use]
    pub fn row(&self, id: &str) -> Row<'_> {
        Row::new(id, self)
    }

    /// Returns the ids of all row files, sorted.
    pub(crate) fn row_ids(&self) -> CoreResult<Vec<String>> {
        let mut ids = Vec::new();
        for entry in fs::read_dir(self.folder())? {
            let path = entry?.path();
            let is_row = path.is_file()
                && path.extension().is_some_and(|ext| ext == ROW_EXT);
            if !is_row {
                continue;
            }
            if let Some(stem) = path.file_stem().and_then(|s| s.to_str()) {
                if file::validate_name(stem).is_ok() {
                    ids.push(stem.to_string());
                }
            }
        }
        ids.sort_unstable();
        Ok(ids)
    }

    /// Returns handles to all rows, minus `exclude`.
    pub fn rows(&self, exclude: &[&str]) -> CoreResult<Vec<Row<'_>>> {
        Ok(self
            .row_ids()?
            .into_iter()
            .filter(|id| !exclude.contains(&id.as_str()))
            .map(|id| Row::new(id, self))
            .collect())
    }

    /// Materializes one row, decrypting encrypted columns.
    pub fn record(&self, id: &str) -> CoreResult<Record> {
        let schema = self.schema()?;
        let dek = self.read_dek()?;
        self.record_with(id, &schema, dek.as_ref())
    }

    /// Materializes one row with a pre-unwrapped DEK (one unwrap per
    /// operation, not per row).
    pub(crate) fn record_with(
        &self,
        id: &str,
        schema: &Schema,
        dek: Option<&SecretKey>,
    ) -> CoreResult<Record> {
        let path = self.row_path(id);
        if !path.is_file() {
            return Err(CoreError::not_found(format!("row {id:?}")));
        }
        let lines = file::read_lines(&path)?;
        let columns = row::decode_row(&lines, schema, dek)?;
        Ok(Record::with_id(id, columns))
    }

    /// Inserts or updates a row, returning its id.
    ///
    /// `columns` must be a JSON object. With an explicit `"_id"` the row
    /// must already exist and is rewritten with the new values merged over
    /// the old ones; without one a fresh id is generated and schema columns
    /// not supplied default to null.
    ///
    /// The rewrite is atomic and flushes the table's cache namespace before
    /// returning.
    ///
    /// # Errors
    ///
    /// Fails with [`CoreError::NotFound`] for an explicit id without a row,
    /// [`CoreError::SchemaViolation`] for values failing the schema,
    /// [`CoreError::KekRequired`]/[`CoreError::CryptoFailed`] for encrypted
    /// tables without a usable KEK, and [`CoreError::Io`] if the atomic
    /// write fails (in which case the prior row state is intact).
    pub fn insert(&self, columns: Value) -> CoreResult<String> {
        let Value::Object(map) = columns else {
            return Err(CoreError::schema_violation("row columns must be an object"));
        };
        let mut columns: BTreeMap<String, Value> = map.into_iter().collect();

        let explicit_id = match columns.remove(ID_COLUMN) {
            None | Some(Value::Null) => None,
            Some(Value::String(id)) => {
                file::validate_name(&id)?;
                Some(id)
            }
            Some(_) => {
                return Err(CoreError::schema_violation("_id must be a string"));
            }
        };
        if columns.is_empty() {
            return Err(CoreError::schema_violation("columns cannot be empty"));
        }

        let meta = self.meta()?;
        let schema = &meta.schema;
        let dek = self.read_dek()?;

        let id = match explicit_id {
            Some(id) => {
                if !self.row_path(&id).is_file() {
                    return Err(CoreError::not_found(format!("row {id:?}")));
                }
                let existing = self.record_with(&id, schema, dek.as_ref())?;
                for (name, old) in existing.into_columns() {
                    if name != ID_COLUMN {
                        columns.entry(name).or_insert(old);
                    }
                }
                id
            }
            None => {
                for (name, _) in schema.iter() {
                    columns.entry(name.clone()).or_insert(Value::Null);
                }
                let mut id = crypto::random_id(8);
                while self.row_path(&id).is_file() {
                    id = crypto::random_id(8);
                }
                id
            }
        };

        for (name, value) in &columns {
            if !schema.valid(name, value) {
                return Err(CoreError::schema_violation(format!(
                    "invalid data type for column {name:?}"
                )));
            }
        }

        let text = row::encode_row(&columns, schema, dek.as_ref())?;
        file::atomic_write(&self.row_path(&id), text.as_bytes())?;
        tracing::debug!(table = %self.name, row = %id, "row written");
        self.flush_cache();
        Ok(id)
    }

    /// Inserts rows best-effort, returning one status per input row.
    ///
    /// Rows are independent: a failure leaves earlier rows applied and
    /// later rows attempted. There is no cross-row atomicity.
    pub fn insert_many(&self, rows: Vec<Value>) -> Vec<CoreResult<String>> {
        rows.into_iter().map(|columns| self.insert(columns)).collect()
    }

    /// Returns a query over this table.
    #[must_use]
    pub fn query(&self) -> Query<'db> {
        Query::new(self.database, self.name.clone())
    }

    /// Returns all rows matching the equality `criteria` object.
    pub fn find(&self, criteria: Value) -> CoreResult<Collection> {
        let Value::Object(map) = criteria else {
            return Err(CoreError::schema_violation("criteria must be an object"));
        };
        let mut query = self.query();
        for (column, value) in map {
            query = query.and_where(&column, Op::Eq, value);
        }
        query.fetch()
    }

    /// Returns the first row matching the equality `criteria` object.
    ///
    /// Bypasses the cache and stops the window at one row.
    pub fn find_one(&self, criteria: Value) -> CoreResult<Option<Record>> {
        let Value::Object(map) = criteria else {
            return Err(CoreError::schema_violation("criteria must be an object"));
        };
        let mut query = self.query().no_cache();
        for (column, value) in map {
            query = query.and_where(&column, Op::Eq, value);
        }
        let result = query.limit(1, 0)?.fetch()?;
        Ok(result.first().cloned())
    }

    /// Replaces the declared schema; `_id` is stripped.
    ///
    /// Existing rows are not rewritten; they are re-validated on their next
    /// write. If the new schema introduces the table's first encrypted
    /// column, a fresh wrapped DEK is generated (KEK required).
    pub fn alter(&self, mut schema: Schema) -> CoreResult<()> {
        schema.remove(ID_COLUMN);
        let meta = self.meta()?;

        let dek = if schema.has_encrypted_columns() && meta.dek.is_empty() {
            let kek = self.database.kek().ok_or_else(|| {
                CoreError::kek_required("new schema has encrypted columns")
            })?;
            let (_, wrapped) = crypto::generate_dek(kek)?;
            wrapped
        } else {
            meta.dek
        };

        let next = TableMeta {
            created: meta.created,
            schema,
            dek,
        };
        file::write_json(&self.folder().join(METADATA_FILE), &next)?;
        self.invalidate_meta();
        Ok(())
    }

    /// Renames the table directory; returns `Ok(false)` if the target name
    /// is taken.
    pub fn rename(&mut self, new_name: &str) -> CoreResult<bool> {
        file::validate_name(new_name)?;
        let target = self.database.folder().join(new_name);
        if target.is_dir() {
            return Ok(false);
        }
        fs::rename(self.folder(), &target)?;
        self.flush_cache();
        self.name = new_name.to_string();
        Ok(true)
    }

    /// Deletes the table: directory renamed to a tombstone, then removed,
    /// then the cache namespace flushed.
    pub fn delete(self) -> CoreResult<()> {
        let tombstone = self
            .database
            .folder()
            .join(format!(".deleted_{}", self.name));
        file::remove_tree(&tombstone)?;
        fs::rename(self.folder(), &tombstone)?;
        file::remove_tree(&tombstone)?;
        self.flush_cache();
        tracing::info!(table = %self.name, "table deleted");
        Ok(())
    }

    /// Flushes this table's query-cache namespace.
    ///
    /// Failures are logged and swallowed: the cache is advisory, and every
    /// caller is on a path that must not fail because of it.
    pub(crate) fn flush_cache(&self) {
        let cache = QueryCache::namespace(&self.database.folder(), &self.name);
        if let Err(e) = cache.flush() {
            tracing::warn!(table = %self.name, error = %e, "cache flush failed");
        }
    }
}
