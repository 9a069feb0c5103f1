//! Row files and row handles.
//!
//! Each row is one NDJSON file named `<rowid>.ndjson`:
//!
//! ```text
//! line 0:    ["age","email","name"]     # sorted column names, no _id
//! line 1..k: JSON value per column, same order; encrypted columns hold
//!            the base64 AEAD blob as a JSON string
//! ```
//!
//! [`Row`] is a small borrowed handle `{id, &Table}`; the owning
//! [`Table`](crate::Table) supplies schema, KEK and DEK on demand.
//! [`Record`] is the materialized row that flows through queries, the cache
//! and collections.

use crate::crypto::{self, SecretKey};
use crate::error::{CoreError, CoreResult};
use crate::file;
use crate::schema::{Schema, ID_COLUMN};
use crate::table::Table;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use std::path::PathBuf;
use std::time::SystemTime;

/// File extension of row files.
pub(crate) const ROW_EXT: &str = "ndjson";

/// A materialized row: the `_id` plus all column values, decrypted.
///
/// Records serialize as a flat JSON object (including `"_id"`), which is
/// the cache payload format.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Record {
    columns: BTreeMap<String, Value>,
}

impl Record {
    /// Builds a record from an id and decrypted column values.
    pub(crate) fn with_id(id: &str, columns: BTreeMap<String, Value>) -> Self {
        let mut columns = columns;
        columns.insert(ID_COLUMN.to_string(), Value::String(id.to_string()));
        Self { columns }
    }

    /// Returns the row identifier, or `""` if the record was projected away
    /// from it.
    #[must_use]
    pub fn id(&self) -> &str {
        self.columns
            .get(ID_COLUMN)
            .and_then(Value::as_str)
            .unwrap_or_default()
    }

    /// Returns a column value if present.
    #[must_use]
    pub fn get(&self, name: &str) -> Option<&Value> {
        self.columns.get(name)
    }

    /// Returns a column value, or null for absent columns.
    #[must_use]
    pub fn value(&self, name: &str) -> Value {
        self.columns.get(name).cloned().unwrap_or(Value::Null)
    }

    /// Sets a column value.
    pub fn set(&mut self, name: impl Into<String>, value: Value) {
        self.columns.insert(name.into(), value);
    }

    /// Removes a column, returning its value.
    pub fn remove(&mut self, name: &str) -> Option<Value> {
        self.columns.remove(name)
    }

    /// Renames a column in place; absent source names are a no-op.
    pub fn rename(&mut self, from: &str, to: &str) {
        if let Some(value) = self.columns.remove(from) {
            self.columns.insert(to.to_string(), value);
        }
    }

    /// Returns whether the column exists.
    #[must_use]
    pub fn contains(&self, name: &str) -> bool {
        self.columns.contains_key(name)
    }

    /// Iterates `(name, value)` pairs in ascending name order.
    pub fn iter(&self) -> impl Iterator<Item = (&String, &Value)> {
        self.columns.iter()
    }

    /// Number of columns, `_id` included.
    #[must_use]
    pub fn len(&self) -> usize {
        self.columns.len()
    }

    /// Returns whether the record has no columns.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.columns.is_empty()
    }

    /// Consumes the record into its column map (`_id` included).
    #[must_use]
    pub fn into_columns(self) -> BTreeMap<String, Value> {
        self.columns
    }
}

/// Serializes row columns into the NDJSON row-file text.
///
/// `columns` must not contain `_id`; encrypted columns require `dek`.
pub(crate) fn encode_row(
    columns: &BTreeMap<String, Value>,
    schema: &Schema,
    dek: Option<&SecretKey>,
) -> CoreResult<String> {
    let names: Vec<&String> = columns.keys().collect();
    let mut text = serde_json::to_string(&names)?;
    text.push('\n');

    for (name, value) in columns {
        let encrypted = schema.get(name).is_some_and(|def| def.encrypted);
        if encrypted {
            let dek = dek.ok_or_else(|| {
                CoreError::kek_required(format!("column {name:?} is encrypted"))
            })?;
            let blob = crypto::encrypt_value(dek, value)?;
            text.push_str(&serde_json::to_string(&Value::String(blob))?);
        } else {
            text.push_str(&serde_json::to_string(value)?);
        }
        text.push('\n');
    }
    Ok(text)
}

/// Parses row-file lines back into decrypted column values.
pub(crate) fn decode_row(
    lines: &[String],
    schema: &Schema,
    dek: Option<&SecretKey>,
) -> CoreResult<BTreeMap<String, Value>> {
    let header = lines
        .first()
        .ok_or_else(|| CoreError::internal("row file is empty"))?;
    let names: Vec<String> = serde_json::from_str(header)?;

    let mut columns = BTreeMap::new();
    for (i, name) in names.iter().enumerate() {
        let line = lines
            .get(i + 1)
            .ok_or_else(|| CoreError::internal("row file truncated"))?;
        let mut value: Value = serde_json::from_str(line)?;

        if schema.get(name).is_some_and(|def| def.encrypted) {
            let dek = dek.ok_or_else(|| {
                CoreError::kek_required(format!("column {name:?} is encrypted"))
            })?;
            let blob = value.as_str().ok_or_else(|| {
                CoreError::crypto_failed(format!("column {name:?} is not an encrypted blob"))
            })?;
            value = crypto::decrypt_value(dek, blob)?;
        }
        columns.insert(name.clone(), value);
    }
    Ok(columns)
}

/// Metadata about a row file on disk.
#[derive(Debug, Clone)]
pub struct RowMetadata {
    /// The row identifier.
    pub id: String,
    /// Last modification time of the row file.
    pub modified: SystemTime,
    /// Size of the row file in bytes.
    pub size: u64,
}

/// A borrowed handle to one row of a table.
///
/// The handle carries no data; reads go to the row file, with single-column
/// reads touching only the header line and one value line.
#[derive(Debug)]
pub struct Row<'a> {
    id: String,
    table: &'a Table<'a>,
}

impl<'a> Row<'a> {
    pub(crate) fn new(id: impl Into<String>, table: &'a Table<'a>) -> Self {
        Self {
            id: id.into(),
            table,
        }
    }

    /// Returns the row identifier.
    #[must_use]
    pub fn id(&self) -> &str {
        &self.id
    }

    /// Returns the path of the row file.
    #[must_use]
    pub fn path(&self) -> PathBuf {
        self.table.folder().join(format!("{}.{ROW_EXT}", self.id))
    }

    /// Returns whether the row file exists.
    #[must_use]
    pub fn exists(&self) -> bool {
        self.path().is_file()
    }

    /// Reads a single column without loading the whole row.
    ///
    /// Returns null for columns the row does not carry. `_id` resolves to
    /// the identifier.
    ///
    /// # Errors
    ///
    /// Fails with [`CoreError::NotFound`] if the row file is absent, and
    /// with [`CoreError::KekRequired`]/[`CoreError::CryptoFailed`] on
    /// encrypted columns without a usable key.
    pub fn column(&self, name: &str) -> CoreResult<Value> {
        if name == ID_COLUMN {
            return Ok(Value::String(self.id.clone()));
        }

        let path = self.path();
        if !path.is_file() {
            return Err(CoreError::not_found(format!("row {:?}", self.id)));
        }

        let header = file::read_line(&path, 0)?
            .ok_or_else(|| CoreError::internal("row file is empty"))?;
        let names: Vec<String> = serde_json::from_str(&header)?;
        let Some(index) = names.iter().position(|n| n == name) else {
            return Ok(Value::Null);
        };

        let line = file::read_line(&path, index + 1)?
            .ok_or_else(|| CoreError::internal("row file truncated"))?;
        let mut value: Value = serde_json::from_str(&line)?;

        if self.table.schema()?.get(name).is_some_and(|def| def.encrypted) {
            let dek = self.table.read_dek()?.ok_or_else(|| {
                CoreError::kek_required(format!("column {name:?} is encrypted"))
            })?;
            let blob = value.as_str().ok_or_else(|| {
                CoreError::crypto_failed(format!("column {name:?} is not an encrypted blob"))
            })?;
            value = crypto::decrypt_value(&dek, blob)?;
        }
        Ok(value)
    }

    /// Materializes the full row, decrypting encrypted columns.
    pub fn record(&self) -> CoreResult<Record> {
        self.table.record(&self.id)
    }

    /// Merges `columns` into the row and rewrites it atomically.
    ///
    /// Columns not mentioned keep their current values.
    pub fn update(&self, columns: Value) -> CoreResult<()> {
        let Value::Object(map) = columns else {
            return Err(CoreError::schema_violation("row columns must be an object"));
        };
        let mut merged = Value::Object(map);
        merged[ID_COLUMN] = Value::String(self.id.clone());
        self.table.insert(merged)?;
        Ok(())
    }

    /// Deletes the row file and flushes the table's cache namespace.
    pub fn delete(&self) -> CoreResult<()> {
        std::fs::remove_file(self.path())?;
        self.table.flush_cache();
        Ok(())
    }

    /// Returns file-level metadata for the row.
    pub fn metadata(&self) -> CoreResult<RowMetadata> {
        let meta = std::fs::metadata(self.path())?;
        Ok(RowMetadata {
            id: self.id.clone(),
            modified: meta.modified()?,
            size: meta.len(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schema::{ColumnDef, ColumnType};
    use proptest::prelude::*;
    use serde_json::json;

    fn columns(pairs: &[(&str, Value)]) -> BTreeMap<String, Value> {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.clone()))
            .collect()
    }

    #[test]
    fn header_lists_sorted_names() {
        let cols = columns(&[
            ("name", json!("ada")),
            ("age", json!(36)),
            ("email", json!(null)),
        ]);
        let text = encode_row(&cols, &Schema::new(), None).unwrap();
        let mut lines = text.lines();
        assert_eq!(lines.next().unwrap(), r#"["age","email","name"]"#);
        assert_eq!(lines.next().unwrap(), "36");
        assert_eq!(lines.next().unwrap(), "null");
        assert_eq!(lines.next().unwrap(), r#""ada""#);
    }

    #[test]
    fn plain_roundtrip() {
        let cols = columns(&[
            ("a", json!([1, 2, 3])),
            ("b", json!({"nested": true})),
            ("c", json!(2.5)),
        ]);
        let text = encode_row(&cols, &Schema::new(), None).unwrap();
        let lines: Vec<String> = text.lines().map(String::from).collect();
        let back = decode_row(&lines, &Schema::new(), None).unwrap();
        assert_eq!(back, cols);
    }

    #[test]
    fn encrypted_column_is_a_blob_on_disk() {
        let schema = Schema::new().add("card", ColumnDef::new(ColumnType::Text).encrypted());
        let dek = SecretKey::generate();
        let cols = columns(&[("card", json!("4111111111111111")), ("name", json!("ada"))]);

        let text = encode_row(&cols, &schema, Some(&dek)).unwrap();
        let lines: Vec<String> = text.lines().map(String::from).collect();

        // Line 1 is the card value: a JSON string, not the plaintext.
        let stored: Value = serde_json::from_str(&lines[1]).unwrap();
        let blob = stored.as_str().unwrap();
        assert!(!blob.contains("4111111111111111"));

        let back = decode_row(&lines, &schema, Some(&dek)).unwrap();
        assert_eq!(back, cols);
    }

    #[test]
    fn encrypted_without_key_fails() {
        let schema = Schema::new().add("card", ColumnDef::new(ColumnType::Text).encrypted());
        let cols = columns(&[("card", json!("x"))]);
        assert!(matches!(
            encode_row(&cols, &schema, None),
            Err(CoreError::KekRequired { .. })
        ));
    }

    #[test]
    fn record_accessors() {
        let mut record = Record::with_id("ab12", columns(&[("name", json!("ada"))]));
        assert_eq!(record.id(), "ab12");
        assert_eq!(record.value("name"), json!("ada"));
        assert_eq!(record.value("missing"), Value::Null);

        record.rename("name", "who");
        assert!(!record.contains("name"));
        assert_eq!(record.value("who"), json!("ada"));
    }

    fn leaf_value() -> impl Strategy<Value = Value> {
        prop_oneof![
            Just(Value::Null),
            any::<bool>().prop_map(Value::from),
            any::<i64>().prop_map(Value::from),
            (-1.0e9..1.0e9f64).prop_map(Value::from),
            "[ -~]{0,24}".prop_map(Value::from),
        ]
    }

    proptest! {
        #[test]
        fn codec_roundtrip(
            cols in prop::collection::btree_map("[a-z]{1,8}", leaf_value(), 0..6)
        ) {
            let text = encode_row(&cols, &Schema::new(), None).unwrap();
            let lines: Vec<String> = text.lines().map(String::from).collect();
            let back = decode_row(&lines, &Schema::new(), None).unwrap();
            prop_assert_eq!(back, cols);
        }
    }
}
