//! Declarative query builder and evaluator.
//!
//! A [`Query`] is built clause by clause and evaluated by [`fetch`](Query::fetch).
//! The caller's clause order does not matter (except for `sort`, where it is
//! the multi-key precedence); the evaluator applies a fixed pipeline:
//!
//! ```text
//! rows → join → map → where → select → distinct → sort → filter
//!      → (cache write) → limit
//! ```
//!
//! This order is a hard contract: result caching stores the pipeline output
//! before the limit window, so the same query with a different window reuses
//! the same cache entry.
//!
//! Cache identity is the canonical payload: every clause bucket present,
//! `join`/`where`/`select` key-sorted, `distinct` sorted, `map`/`filter`
//! reduced to their sorted identity tokens, `sort` kept in insertion order
//! (its order is semantic). Queries carrying an anonymous callable have no
//! stable identity and are evaluated with caching disabled.

use crate::cache::QueryCache;
use crate::collection::Collection;
use crate::database::Database;
use crate::error::{CoreError, CoreResult};
use crate::row::Record;
use crate::value;
use serde_json::Value;
use std::collections::{BTreeMap, HashSet};
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;

/// Comparison operators for `where` and `join` clauses.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Op {
    /// `=` / `eq` / `is`
    Eq,
    /// `!=` / `neq` / `is not`
    Ne,
    /// `<` / `lt`
    Lt,
    /// `<=` / `lte`
    Le,
    /// `>` / `gt`
    Gt,
    /// `>=` / `gte`
    Ge,
    /// `in` / `is in`: membership in a list, or substring of a string.
    In,
    /// `not in`
    NotIn,
    /// `between`: inclusive `[lo, hi]` pair.
    Between,
    /// `not between`: inclusive outside of the pair.
    NotBetween,
    /// `like`: SQL wildcards, `%` = any run, `_` = any one character.
    Like,
    /// `not like`
    NotLike,
}

impl Op {
    /// Canonical spelling, used in cache payloads.
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Op::Eq => "=",
            Op::Ne => "!=",
            Op::Lt => "<",
            Op::Le => "<=",
            Op::Gt => ">",
            Op::Ge => ">=",
            Op::In => "in",
            Op::NotIn => "not in",
            Op::Between => "between",
            Op::NotBetween => "not between",
            Op::Like => "like",
            Op::NotLike => "not like",
        }
    }
}

impl FromStr for Op {
    type Err = CoreError;

    fn from_str(s: &str) -> CoreResult<Self> {
        Ok(match s {
            "=" | "eq" | "is" => Op::Eq,
            "!=" | "neq" | "is not" => Op::Ne,
            "<" | "lt" => Op::Lt,
            "<=" | "lte" => Op::Le,
            ">" | "gt" => Op::Gt,
            ">=" | "gte" => Op::Ge,
            "in" | "is in" => Op::In,
            "not in" => Op::NotIn,
            "between" => Op::Between,
            "not between" => Op::NotBetween,
            "like" => Op::Like,
            "not like" => Op::NotLike,
            other => {
                return Err(CoreError::query_malformed(format!(
                    "unknown operator {other:?}"
                )))
            }
        })
    }
}

/// Sort direction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SortOrder {
    /// Ascending.
    Asc,
    /// Descending.
    Desc,
}

impl SortOrder {
    fn as_str(self) -> &'static str {
        match self {
            SortOrder::Asc => "ASC",
            SortOrder::Desc => "DESC",
        }
    }
}

impl FromStr for SortOrder {
    type Err = CoreError;

    fn from_str(s: &str) -> CoreResult<Self> {
        match s.to_ascii_uppercase().as_str() {
            "ASC" => Ok(SortOrder::Asc),
            "DESC" => Ok(SortOrder::Desc),
            _ => Err(CoreError::query_malformed("invalid order")),
        }
    }
}

/// A user-supplied row mutation for `map` clauses.
///
/// A transform built with [`Transform::named`] carries a stable identity
/// token and participates in cache keys; [`Transform::new`] builds an
/// anonymous transform, which disables caching for any query using it.
#[derive(Clone)]
pub struct Transform {
    token: Option<String>,
    func: Arc<dyn Fn(&mut Record) + Send + Sync>,
}

impl Transform {
    /// Anonymous transform; queries using it are never cached.
    pub fn new(f: impl Fn(&mut Record) + Send + Sync + 'static) -> Self {
        Self {
            token: None,
            func: Arc::new(f),
        }
    }

    /// Transform with a stable identity token for cache keying.
    ///
    /// The token must identify the behavior: two transforms with the same
    /// token are assumed interchangeable.
    pub fn named(token: impl Into<String>, f: impl Fn(&mut Record) + Send + Sync + 'static) -> Self {
        Self {
            token: Some(token.into()),
            func: Arc::new(f),
        }
    }
}

impl fmt::Debug for Transform {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Transform").field("token", &self.token).finish()
    }
}

/// A user-supplied row predicate for `filter` clauses.
///
/// Identity semantics match [`Transform`].
#[derive(Clone)]
pub struct Predicate {
    token: Option<String>,
    func: Arc<dyn Fn(&Record) -> bool + Send + Sync>,
}

impl Predicate {
    /// Anonymous predicate; queries using it are never cached.
    pub fn new(f: impl Fn(&Record) -> bool + Send + Sync + 'static) -> Self {
        Self {
            token: None,
            func: Arc::new(f),
        }
    }

    /// Predicate with a stable identity token for cache keying.
    pub fn named(
        token: impl Into<String>,
        f: impl Fn(&Record) -> bool + Send + Sync + 'static,
    ) -> Self {
        Self {
            token: Some(token.into()),
            func: Arc::new(f),
        }
    }
}

impl fmt::Debug for Predicate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Predicate").field("token", &self.token).finish()
    }
}

#[derive(Debug, Clone)]
struct JoinClause {
    left: String,
    op: Op,
    right: String,
    prefix: String,
}

/// A declarative query against one table.
///
/// Build with [`Database::query`](crate::Database::query) or
/// [`Table::query`](crate::Table::query), chain clauses, then
/// [`fetch`](Self::fetch).
#[derive(Debug)]
pub struct Query<'db> {
    database: &'db Database,
    table: String,
    joins: BTreeMap<String, JoinClause>,
    maps: Vec<Transform>,
    wheres: BTreeMap<String, (Op, Value)>,
    selects: BTreeMap<String, String>,
    distincts: Vec<String>,
    sorts: Vec<(String, SortOrder)>,
    filters: Vec<Predicate>,
    offset: usize,
    max: Option<usize>,
    use_cache: bool,
}

impl<'db> Query<'db> {
    pub(crate) fn new(database: &'db Database, table: impl Into<String>) -> Self {
        Self {
            database,
            table: table.into(),
            joins: BTreeMap::new(),
            maps: Vec::new(),
            wheres: BTreeMap::new(),
            selects: BTreeMap::new(),
            distincts: Vec::new(),
            sorts: Vec::new(),
            filters: Vec::new(),
            offset: 0,
            max: None,
            use_cache: true,
        }
    }

    /// Left-outer-joins `table`, importing the first matching right row's
    /// columns as `prefix + name`.
    ///
    /// `on` is `(left_column, op, right_column)`. The default prefix is
    /// `"<table>."`. Left rows without a match are kept unchanged.
    #[must_use]
    pub fn join(mut self, table: &str, on: (&str, Op, &str), prefix: Option<&str>) -> Self {
        let prefix = prefix.map_or_else(|| format!("{table}."), str::to_string);
        self.joins.insert(
            table.to_string(),
            JoinClause {
                left: on.0.to_string(),
                op: on.1,
                right: on.2.to_string(),
                prefix,
            },
        );
        self
    }

    /// Applies a transform to every row, in input order, before filtering.
    #[must_use]
    pub fn map(mut self, transform: Transform) -> Self {
        self.maps.push(transform);
        self
    }

    /// Adds a predicate; all `where` clauses AND together. A second clause
    /// on the same column replaces the first.
    ///
    /// Columns the row does not carry compare as null and never error.
    #[must_use]
    pub fn and_where(mut self, column: &str, op: Op, value: Value) -> Self {
        self.wheres.insert(column.to_string(), (op, value));
        self
    }

    /// Renames a column in the projected result.
    #[must_use]
    pub fn select(mut self, column: &str, new_name: &str) -> Self {
        self.selects.insert(column.to_string(), new_name.to_string());
        self
    }

    /// Keeps the first row per distinct value of `column`, in iteration
    /// order.
    #[must_use]
    pub fn distinct(mut self, column: &str) -> Self {
        self.distincts.push(column.to_string());
        self
    }

    /// Adds a sort key. Clause-insertion order is the key precedence; the
    /// sort is stable across equal keys.
    #[must_use]
    pub fn sort(mut self, column: &str, order: SortOrder) -> Self {
        self.sorts.push((column.to_string(), order));
        self
    }

    /// Applies a post-sort predicate row by row.
    #[must_use]
    pub fn filter(mut self, predicate: Predicate) -> Self {
        self.filters.push(predicate);
        self
    }

    /// Windows the result to at most `max` rows starting at `offset`.
    ///
    /// # Errors
    ///
    /// Returns [`CoreError::QueryMalformed`] (`"invalid limit"`) if `max`
    /// is zero.
    pub fn limit(mut self, max: usize, offset: usize) -> CoreResult<Self> {
        if max < 1 {
            return Err(CoreError::query_malformed("invalid limit"));
        }
        self.max = Some(max);
        self.offset = offset;
        Ok(self)
    }

    /// Disables read-through and write-through caching for this query.
    #[must_use]
    pub fn no_cache(mut self) -> Self {
        self.use_cache = false;
        self
    }

    /// The canonical cache-identity payload, or `None` when an anonymous
    /// callable makes the query unidentifiable.
    fn canonical_payload(&self) -> Option<Value> {
        let mut map_tokens: Vec<&str> = Vec::with_capacity(self.maps.len());
        for t in &self.maps {
            map_tokens.push(t.token.as_deref()?);
        }
        map_tokens.sort_unstable();

        let mut filter_tokens: Vec<&str> = Vec::with_capacity(self.filters.len());
        for p in &self.filters {
            filter_tokens.push(p.token.as_deref()?);
        }
        filter_tokens.sort_unstable();

        let mut distincts = self.distincts.clone();
        distincts.sort_unstable();

        let joins: serde_json::Map<String, Value> = self
            .joins
            .iter()
            .map(|(table, j)| {
                let clause = serde_json::json!([[j.left, j.op.as_str(), j.right], j.prefix]);
                (table.clone(), clause)
            })
            .collect();
        let wheres: serde_json::Map<String, Value> = self
            .wheres
            .iter()
            .map(|(col, (op, v))| (col.clone(), serde_json::json!([op.as_str(), v])))
            .collect();
        let selects: serde_json::Map<String, Value> = self
            .selects
            .iter()
            .map(|(old, new)| (old.clone(), Value::String(new.clone())))
            .collect();
        let sorts: Vec<Value> = self
            .sorts
            .iter()
            .map(|(col, order)| serde_json::json!([col, order.as_str()]))
            .collect();

        Some(serde_json::json!({
            "distinct": distincts,
            "filter": filter_tokens,
            "join": joins,
            "map": map_tokens,
            "select": selects,
            "sort": sorts,
            "where": wheres,
        }))
    }

    /// Evaluates the query and returns the windowed result.
    ///
    /// # Errors
    ///
    /// Fails with [`CoreError::QueryMalformed`] if no table was specified,
    /// [`CoreError::NotFound`] if a source or joined table is absent, and
    /// propagates row-read and crypto errors. Cache read/write failures are
    /// logged and never fatal.
    pub fn fetch(&self) -> CoreResult<Collection> {
        if self.table.is_empty() {
            return Err(CoreError::query_malformed("table must be specified"));
        }
        let table = self.database.table(&self.table)?;

        let payload = if self.use_cache {
            self.canonical_payload()
        } else {
            None
        };
        let cache = payload.as_ref().map(|p| {
            QueryCache::keyed(
                &self.database.folder(),
                &self.table,
                p,
                self.database.cache_ttl(),
            )
        });

        if let Some(cache) = &cache {
            if cache.valid() {
                match cache.get() {
                    Ok(rows) => {
                        tracing::debug!(table = %self.table, "query cache hit");
                        return Ok(Collection::new(rows, self.offset, self.max));
                    }
                    Err(e) => {
                        tracing::warn!(table = %self.table, error = %e, "cache read failed; recomputing");
                    }
                }
            }
        }

        // Materialize each joined table's right side once.
        let mut join_sides: Vec<(&JoinClause, Vec<Record>)> = Vec::with_capacity(self.joins.len());
        for (right_name, clause) in &self.joins {
            let right = self.database.table(right_name)?;
            let mut side = Vec::new();
            for id in right.row_ids()? {
                side.push(right.record(&id)?);
            }
            join_sides.push((clause, side));
        }

        let schema = table.schema()?;
        let dek = table.read_dek()?;
        let mut rows: Vec<Record> = Vec::new();

        for id in table.row_ids()? {
            let mut record = table.record_with(&id, &schema, dek.as_ref())?;

            for (clause, side) in &join_sides {
                let left_value = record.value(&clause.left);
                let matched = side
                    .iter()
                    .find(|r| matches(&left_value, clause.op, &r.value(&clause.right)));
                if let Some(right) = matched {
                    for (name, v) in right.iter() {
                        record.set(format!("{}{name}", clause.prefix), v.clone());
                    }
                }
            }

            for transform in &self.maps {
                (transform.func)(&mut record);
            }

            let pass = self
                .wheres
                .iter()
                .all(|(col, (op, v))| matches(&record.value(col), *op, v));
            if !pass {
                continue;
            }

            for (old, new) in &self.selects {
                record.rename(old, new);
            }
            rows.push(record);
        }

        for column in &self.distincts {
            let mut seen = HashSet::new();
            rows.retain(|r| seen.insert(value::canonical(&r.value(column))));
        }

        if !self.sorts.is_empty() {
            rows.sort_by(|a, b| {
                for (column, order) in &self.sorts {
                    let ord = value::total_cmp(&a.value(column), &b.value(column));
                    if ord != std::cmp::Ordering::Equal {
                        return match order {
                            SortOrder::Asc => ord,
                            SortOrder::Desc => ord.reverse(),
                        };
                    }
                }
                std::cmp::Ordering::Equal
            });
        }

        for predicate in &self.filters {
            rows.retain(|r| (predicate.func)(r));
        }

        if let Some(cache) = &cache {
            if !rows.is_empty() {
                if let Err(e) = cache.put(&rows) {
                    tracing::warn!(table = %self.table, error = %e, "cache write failed; ignoring");
                }
            }
        }

        Ok(Collection::new(rows, self.offset, self.max))
    }
}

/// Evaluates one comparison. Incomparable operand kinds are never a match.
pub(crate) fn matches(lhs: &Value, op: Op, rhs: &Value) -> bool {
    use std::cmp::Ordering::{Equal, Greater, Less};

    match op {
        Op::Eq => value::eq(lhs, rhs),
        Op::Ne => !value::eq(lhs, rhs),
        Op::Lt => value::partial_cmp(lhs, rhs) == Some(Less),
        Op::Le => matches!(value::partial_cmp(lhs, rhs), Some(Less | Equal)),
        Op::Gt => value::partial_cmp(lhs, rhs) == Some(Greater),
        Op::Ge => matches!(value::partial_cmp(lhs, rhs), Some(Greater | Equal)),
        Op::In => membership(lhs, rhs) == Some(true),
        Op::NotIn => membership(lhs, rhs) == Some(false),
        Op::Between => bounds(lhs, rhs).is_some_and(|(lo, hi)| lo != Less && hi != Greater),
        Op::NotBetween => bounds(lhs, rhs).is_some_and(|(lo, hi)| lo == Less || hi == Greater),
        Op::Like => like_eval(lhs, rhs) == Some(true),
        Op::NotLike => like_eval(lhs, rhs) == Some(false),
    }
}

/// Membership of `lhs` in `rhs`: list element, or substring of a string.
/// `None` when `rhs` is not a container.
fn membership(lhs: &Value, rhs: &Value) -> Option<bool> {
    match rhs {
        Value::Array(items) => Some(items.iter().any(|item| value::eq(lhs, item))),
        Value::String(haystack) => lhs.as_str().map(|needle| haystack.contains(needle)),
        _ => None,
    }
}

/// Comparisons of `lhs` against an inclusive `[lo, hi]` pair.
fn bounds(lhs: &Value, rhs: &Value) -> Option<(std::cmp::Ordering, std::cmp::Ordering)> {
    let pair = rhs.as_array().filter(|p| p.len() == 2)?;
    let lo = value::partial_cmp(lhs, &pair[0])?;
    let hi = value::partial_cmp(lhs, &pair[1])?;
    Some((lo, hi))
}

/// LIKE evaluation: `Some(matched)` for stringifiable operands.
///
/// With neither `%` nor `_` in the pattern this degenerates to equality of
/// the rendered texts. There is no escape syntax for a literal wildcard.
fn like_eval(lhs: &Value, rhs: &Value) -> Option<bool> {
    let text = stringify(lhs)?;
    let pattern = stringify(rhs)?;
    if !pattern.contains('%') && !pattern.contains('_') {
        return Some(text == pattern);
    }
    Some(like_match(&pattern, &text))
}

fn stringify(value: &Value) -> Option<String> {
    match value {
        Value::String(s) => Some(s.clone()),
        Value::Number(_) | Value::Bool(_) => Some(value.to_string()),
        _ => None,
    }
}

/// Anchored SQL-wildcard match: `%` matches any run (including empty),
/// `_` matches exactly one character, everything else is literal.
fn like_match(pattern: &str, text: &str) -> bool {
    let p: Vec<char> = pattern.chars().collect();
    let t: Vec<char> = text.chars().collect();

    let (mut pi, mut ti) = (0, 0);
    let mut backtrack: Option<(usize, usize)> = None;

    while ti < t.len() {
        if pi < p.len() && (p[pi] == '_' || p[pi] == t[ti]) {
            pi += 1;
            ti += 1;
        } else if pi < p.len() && p[pi] == '%' {
            backtrack = Some((pi, ti));
            pi += 1;
        } else if let Some((star_pi, star_ti)) = backtrack {
            backtrack = Some((star_pi, star_ti + 1));
            pi = star_pi + 1;
            ti = star_ti + 1;
        } else {
            return false;
        }
    }
    while pi < p.len() && p[pi] == '%' {
        pi += 1;
    }
    pi == p.len()
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn operator_aliases_parse() {
        assert_eq!("=".parse::<Op>().unwrap(), Op::Eq);
        assert_eq!("eq".parse::<Op>().unwrap(), Op::Eq);
        assert_eq!("is".parse::<Op>().unwrap(), Op::Eq);
        assert_eq!("is not".parse::<Op>().unwrap(), Op::Ne);
        assert_eq!("lte".parse::<Op>().unwrap(), Op::Le);
        assert_eq!("is in".parse::<Op>().unwrap(), Op::In);
        assert_eq!("not between".parse::<Op>().unwrap(), Op::NotBetween);
        assert!("~=".parse::<Op>().is_err());
    }

    #[test]
    fn order_parses() {
        assert_eq!("ASC".parse::<SortOrder>().unwrap(), SortOrder::Asc);
        assert_eq!("desc".parse::<SortOrder>().unwrap(), SortOrder::Desc);
        assert!(matches!(
            "sideways".parse::<SortOrder>(),
            Err(CoreError::QueryMalformed { .. })
        ));
    }

    #[test]
    fn relational_matches() {
        assert!(matches(&json!(5), Op::Gt, &json!(3)));
        assert!(matches(&json!(3), Op::Le, &json!(3)));
        assert!(!matches(&json!("5"), Op::Gt, &json!(3)));
        assert!(matches(&json!("b"), Op::Lt, &json!("c")));
        assert!(matches(&json!(1), Op::Eq, &json!(1.0)));
        assert!(matches(&json!(null), Op::Ne, &json!(1)));
    }

    #[test]
    fn membership_matches() {
        assert!(matches(&json!(2), Op::In, &json!([1, 2, 3])));
        assert!(matches(&json!(4), Op::NotIn, &json!([1, 2, 3])));
        assert!(matches(&json!("oce"), Op::In, &json!("processing")));
        // Non-container right side is not a match for either polarity.
        assert!(!matches(&json!(1), Op::In, &json!(5)));
        assert!(!matches(&json!(1), Op::NotIn, &json!(5)));
    }

    #[test]
    fn between_is_inclusive() {
        assert!(matches(&json!(5), Op::Between, &json!([1, 5])));
        assert!(matches(&json!(1), Op::Between, &json!([1, 5])));
        assert!(!matches(&json!(6), Op::Between, &json!([1, 5])));
        assert!(matches(&json!(6), Op::NotBetween, &json!([1, 5])));
        assert!(!matches(&json!(3), Op::NotBetween, &json!([1, 5])));
        assert!(!matches(&json!(3), Op::Between, &json!([1])));
    }

    #[test]
    fn like_wildcards() {
        assert!(like_match("jo%", "johndoe"));
        assert!(like_match("%doe", "johndoe"));
        assert!(like_match("j_hn%", "johndoe"));
        assert!(like_match("%", ""));
        assert!(!like_match("jo%x", "johndoe"));
        assert!(!like_match("j_hn", "johndoe"));
        assert!(like_match("%oh%oe", "johndoe"));
    }

    #[test]
    fn like_without_wildcards_is_equality() {
        assert!(matches(&json!("abc"), Op::Like, &json!("abc")));
        assert!(!matches(&json!("abcd"), Op::Like, &json!("abc")));
        assert!(matches(&json!("abcd"), Op::NotLike, &json!("abc")));
        assert!(matches(&json!(42), Op::Like, &json!("4%")));
        // Lists and objects are not like-able, for either polarity.
        assert!(!matches(&json!([1]), Op::Like, &json!("%")));
        assert!(!matches(&json!([1]), Op::NotLike, &json!("%")));
    }

    mod payload {
        use super::*;
        use crate::database::DatabaseConfig;
        use crate::Database;
        use tempfile::TempDir;

        fn db(dir: &TempDir) -> Database {
            Database::open("payloads", DatabaseConfig::new(dir.path())).unwrap()
        }

        #[test]
        fn clause_order_does_not_change_identity() {
            let dir = TempDir::new().unwrap();
            let db = db(&dir);

            let a = Query::new(&db, "t")
                .and_where("status", Op::Eq, json!("open"))
                .and_where("total", Op::Gt, json!(10))
                .select("name", "n")
                .distinct("status");
            let b = Query::new(&db, "t")
                .distinct("status")
                .select("name", "n")
                .and_where("total", Op::Gt, json!(10))
                .and_where("status", Op::Eq, json!("open"));

            assert_eq!(a.canonical_payload(), b.canonical_payload());
        }

        #[test]
        fn sort_order_is_part_of_identity() {
            let dir = TempDir::new().unwrap();
            let db = db(&dir);

            let a = Query::new(&db, "t")
                .sort("a", SortOrder::Asc)
                .sort("b", SortOrder::Asc);
            let b = Query::new(&db, "t")
                .sort("b", SortOrder::Asc)
                .sort("a", SortOrder::Asc);

            assert_ne!(a.canonical_payload(), b.canonical_payload());
        }

        #[test]
        fn anonymous_callables_defeat_identity() {
            let dir = TempDir::new().unwrap();
            let db = db(&dir);

            let named = Query::new(&db, "t").map(Transform::named("noop", |_| {}));
            assert!(named.canonical_payload().is_some());

            let anon = Query::new(&db, "t").map(Transform::new(|_| {}));
            assert!(anon.canonical_payload().is_none());

            let anon_filter = Query::new(&db, "t").filter(Predicate::new(|_| true));
            assert!(anon_filter.canonical_payload().is_none());
        }
    }
}
