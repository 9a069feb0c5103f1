//! # silodb core
//!
//! An embeddable, file-backed document store. Data lives in a three-level
//! hierarchy — database → table → row — with every row persisted as its own
//! small NDJSON file:
//!
//! ```text
//! <root>/<db>/
//! ├─ .metadata                  # {created, version, cipher}
//! ├─ .cache/<table>/<hash>      # gzipped query results
//! └─ <table>/
//!    ├─ .metadata               # {created, schema, dek}
//!    └─ <rowid>.ndjson          # header line + one value line per column
//! ```
//!
//! What the crate provides:
//!
//! - **Atomic single-row writes**: every write goes through a locked
//!   temp-file + rename sequence; a crash never leaves a partial row.
//! - **Transparent record-level encryption**: columns marked `encrypted`
//!   are sealed with AES-256-GCM under a per-table DEK, itself wrapped by
//!   the user-supplied KEK.
//! - **A query engine**: joins, transforms, predicates, projection,
//!   dedup, stable multi-key sort, pagination.
//! - **A result cache** keyed by canonical query identity, invalidated
//!   wholesale on every table write.
//!
//! ## Example
//!
//! ```rust,ignore
//! use silodb_core::{Database, DatabaseConfig, Op, SortOrder};
//! use serde_json::json;
//!
//! let db = Database::open("app", DatabaseConfig::new("./data"))?;
//! db.create_table("orders", None)?;
//!
//! let orders = db.table("orders")?;
//! orders.insert(json!({"status": "processing", "total_amount": 18.5}))?;
//!
//! let top = db.query("orders")
//!     .and_where("status", Op::Eq, json!("processing"))
//!     .sort("total_amount", SortOrder::Desc)
//!     .limit(2, 0)?
//!     .fetch()?;
//! ```
//!
//! The core is single-writer per row but safe for concurrent processes
//! sharing a storage root: write serialization rides on advisory file
//! locks and atomic same-directory rename (POSIX semantics assumed).

#![deny(unsafe_code)]
#![warn(missing_docs)]

mod backup;
mod cache;
mod collection;
pub mod crypto;
mod database;
mod error;
mod file;
mod query;
mod row;
pub mod schema;
mod table;
mod value;

pub use backup::Backup;
pub use cache::QueryCache;
pub use collection::Collection;
pub use database::{Database, DatabaseConfig, DatabaseReport};
pub use error::{CoreError, CoreResult};
pub use query::{Op, Predicate, Query, SortOrder, Transform};
pub use row::{Record, Row, RowMetadata};
pub use schema::{ColumnDef, ColumnType, Schema};
pub use table::{Table, TableReport};
