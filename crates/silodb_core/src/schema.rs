//! Column type registry and validation.
//!
//! A table's schema maps column names to [`ColumnDef`] descriptors. The
//! schema is advisory for unknown columns (they are stored without checks)
//! and enforced for declared ones on every write.
//!
//! The reserved `_id` name is never part of a schema; persistence paths
//! strip it.

use crate::error::{CoreError, CoreResult};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;

/// Name of the reserved row-identifier column.
pub const ID_COLUMN: &str = "_id";

/// The closed set of column data types.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ColumnType {
    /// Boolean.
    Bool,
    /// Integer.
    Int,
    /// Floating-point number.
    Float,
    /// Any number, or a string that parses as one.
    Number,
    /// UTF-8 text.
    Text,
    /// JSON array.
    List,
    /// JSON object.
    Object,
    /// One of a fixed list of values (see [`ColumnDef::enumeration`]).
    Enum,
}

/// Descriptor for one column: type, nullability, encryption.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ColumnDef {
    /// The column data type.
    #[serde(rename = "type")]
    pub ty: ColumnType,
    /// Whether null is rejected for this column.
    #[serde(default)]
    pub required: bool,
    /// Whether values are encrypted at rest under the table DEK.
    #[serde(default)]
    pub encrypted: bool,
    /// Allowed values for [`ColumnType::Enum`] columns.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub enum_values: Option<Vec<Value>>,
}

impl ColumnDef {
    /// Creates a descriptor of the given type.
    ///
    /// For enum columns use [`ColumnDef::enumeration`], which takes the
    /// allowed values.
    #[must_use]
    pub fn new(ty: ColumnType) -> Self {
        Self {
            ty,
            required: false,
            encrypted: false,
            enum_values: None,
        }
    }

    /// Creates an enum descriptor from the caller-supplied allowed values.
    ///
    /// # Errors
    ///
    /// Returns [`CoreError::SchemaViolation`] if the list is empty or mixes
    /// JSON kinds. Duplicates are dropped.
    pub fn enumeration(values: Vec<Value>) -> CoreResult<Self> {
        if values.is_empty() {
            return Err(CoreError::schema_violation("enum values cannot be empty"));
        }
        let kind = std::mem::discriminant(&values[0]);
        if values.iter().any(|v| std::mem::discriminant(v) != kind) {
            return Err(CoreError::schema_violation(
                "enum values must be of the same type",
            ));
        }

        let mut unique: Vec<Value> = Vec::with_capacity(values.len());
        for v in values {
            if !unique.contains(&v) {
                unique.push(v);
            }
        }

        Ok(Self {
            ty: ColumnType::Enum,
            required: false,
            encrypted: false,
            enum_values: Some(unique),
        })
    }

    /// Marks the column as non-nullable.
    #[must_use]
    pub fn required(mut self) -> Self {
        self.required = true;
        self
    }

    /// Marks the column as encrypted at rest.
    #[must_use]
    pub fn encrypted(mut self) -> Self {
        self.encrypted = true;
        self
    }

    /// Returns whether `value` satisfies this descriptor's type predicate.
    fn type_check(&self, value: &Value) -> bool {
        match self.ty {
            ColumnType::Bool => value.is_boolean(),
            ColumnType::Int => value.is_i64() || value.is_u64(),
            ColumnType::Float => value.is_f64(),
            ColumnType::Number => match value {
                Value::Number(_) => true,
                Value::String(s) => s.trim().parse::<f64>().is_ok(),
                _ => false,
            },
            ColumnType::Text => value.is_string(),
            ColumnType::List => value.is_array(),
            ColumnType::Object => value.is_object(),
            ColumnType::Enum => self
                .enum_values
                .as_ref()
                .is_some_and(|vals| vals.contains(value)),
        }
    }
}

/// Ordered mapping from column name to descriptor.
///
/// Columns iterate in ascending lexical order, which is what makes metadata
/// serialization and row headers deterministic.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Schema {
    columns: BTreeMap<String, ColumnDef>,
}

impl Schema {
    /// Creates an empty schema.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds (or replaces) a column, consuming and returning the schema for
    /// chaining.
    #[must_use]
    pub fn add(mut self, name: impl Into<String>, def: ColumnDef) -> Self {
        self.columns.insert(name.into(), def);
        self
    }

    /// Removes a column if present.
    pub fn remove(&mut self, name: &str) {
        self.columns.remove(name);
    }

    /// Returns the descriptor for a column.
    #[must_use]
    pub fn get(&self, name: &str) -> Option<&ColumnDef> {
        self.columns.get(name)
    }

    /// Returns whether `value` is acceptable for `column`.
    ///
    /// Unknown columns are tolerated; null passes for non-required columns;
    /// otherwise the type predicate decides (membership for enums).
    #[must_use]
    pub fn valid(&self, column: &str, value: &Value) -> bool {
        let Some(def) = self.columns.get(column) else {
            return true;
        };
        if value.is_null() {
            return !def.required;
        }
        def.type_check(value)
    }

    /// Returns whether any column is marked encrypted.
    #[must_use]
    pub fn has_encrypted_columns(&self) -> bool {
        self.columns.values().any(|def| def.encrypted)
    }

    /// Iterates columns in ascending lexical order.
    pub fn iter(&self) -> impl Iterator<Item = (&String, &ColumnDef)> {
        self.columns.iter()
    }

    /// Number of declared columns.
    #[must_use]
    pub fn len(&self) -> usize {
        self.columns.len()
    }

    /// Returns whether no columns are declared.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.columns.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn type_predicates() {
        let s = Schema::new()
            .add("flag", ColumnDef::new(ColumnType::Bool))
            .add("age", ColumnDef::new(ColumnType::Int))
            .add("ratio", ColumnDef::new(ColumnType::Float))
            .add("amount", ColumnDef::new(ColumnType::Number))
            .add("name", ColumnDef::new(ColumnType::Text))
            .add("tags", ColumnDef::new(ColumnType::List))
            .add("extra", ColumnDef::new(ColumnType::Object));

        assert!(s.valid("flag", &json!(true)));
        assert!(!s.valid("flag", &json!(1)));
        assert!(s.valid("age", &json!(42)));
        assert!(!s.valid("age", &json!(4.2)));
        assert!(s.valid("ratio", &json!(3.14)));
        assert!(!s.valid("ratio", &json!(3)));
        assert!(s.valid("amount", &json!(7)));
        assert!(s.valid("amount", &json!("19.99")));
        assert!(!s.valid("amount", &json!("lots")));
        assert!(s.valid("name", &json!("x")));
        assert!(s.valid("tags", &json!([1, 2])));
        assert!(s.valid("extra", &json!({"k": "v"})));
        assert!(!s.valid("extra", &json!([])));
    }

    #[test]
    fn unknown_columns_are_tolerated() {
        let s = Schema::new();
        assert!(s.valid("anything", &json!({"deeply": ["nested"]})));
    }

    #[test]
    fn required_rejects_null() {
        let s = Schema::new()
            .add("must", ColumnDef::new(ColumnType::Text).required())
            .add("may", ColumnDef::new(ColumnType::Text));

        assert!(!s.valid("must", &json!(null)));
        assert!(s.valid("may", &json!(null)));
    }

    #[test]
    fn enum_membership() {
        let def = ColumnDef::enumeration(vec![json!("a"), json!("b"), json!("a")]).unwrap();
        assert_eq!(def.enum_values.as_ref().unwrap().len(), 2);

        let s = Schema::new().add("letter", def);
        assert!(s.valid("letter", &json!("a")));
        assert!(!s.valid("letter", &json!("c")));
    }

    #[test]
    fn enum_rejects_empty_and_mixed() {
        assert!(ColumnDef::enumeration(vec![]).is_err());
        assert!(ColumnDef::enumeration(vec![json!(1), json!("x")]).is_err());
    }

    #[test]
    fn encrypted_flag_follows_removal() {
        let mut s = Schema::new()
            .add("card", ColumnDef::new(ColumnType::Text).encrypted())
            .add("name", ColumnDef::new(ColumnType::Text));
        assert!(s.has_encrypted_columns());

        s.remove("card");
        assert!(!s.has_encrypted_columns());
    }

    #[test]
    fn iteration_is_sorted() {
        let s = Schema::new()
            .add("zeta", ColumnDef::new(ColumnType::Int))
            .add("alpha", ColumnDef::new(ColumnType::Int));
        let names: Vec<_> = s.iter().map(|(n, _)| n.as_str()).collect();
        assert_eq!(names, vec!["alpha", "zeta"]);
    }

    #[test]
    fn serde_shape() {
        let s = Schema::new().add(
            "card",
            ColumnDef::new(ColumnType::Text).required().encrypted(),
        );
        let text = serde_json::to_string(&s).unwrap();
        assert_eq!(
            text,
            r#"{"card":{"type":"text","required":true,"encrypted":true}}"#
        );
        let back: Schema = serde_json::from_str(&text).unwrap();
        assert_eq!(back, s);
    }
}
