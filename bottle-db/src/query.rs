//! # Query Module
//!
//! A `Query` is the value object every executed statement goes through: the
//! caller's template, the bound values, the final SQL after substitution,
//! timing, and the backend error if execution failed.
//!
//! ## Placeholders
//!
//! - Positional `?` markers, matched in order. Markers inside single-quoted
//!   literals are ignored. When the marker count does not equal the number of
//!   binds the SQL is left untouched.
//! - Named `:name:` markers. Longer names are substituted first, so `:site:`
//!   never eats into `:sitemap:`.
//!
//! ```rust,ignore
//! let q = Query::new("SELECT * FROM t WHERE id = ?", vec![13], dialect)?;
//! assert_eq!(q.get_query(), "SELECT * FROM t WHERE id = 13");
//! ```

use std::sync::OnceLock;
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use regex::Regex;

use crate::{Error, drivers::Dialect, escape::escape_value, value::Value};

/// Statements that change data or schema.
const WRITE_KEYWORDS: [&str; 18] = [
    "SET", "INSERT", "UPDATE", "DELETE", "REPLACE", "CREATE", "DROP", "TRUNCATE", "LOAD", "COPY", "ALTER",
    "RENAME", "GRANT", "REVOKE", "LOCK", "UNLOCK", "REINDEX", "MERGE",
];

// ============================================================================
// Binds
// ============================================================================

/// A bound value and whether it is escaped before substitution.
#[derive(Debug, Clone, PartialEq)]
pub struct Bind {
    pub value: Value,
    pub escape: bool,
}

impl Bind {
    pub fn escaped(value: impl Into<Value>) -> Self {
        Self { value: value.into(), escape: true }
    }

    /// Inserted verbatim. Only for trusted SQL fragments.
    pub fn raw(value: impl Into<Value>) -> Self {
        Self { value: value.into(), escape: false }
    }
}

/// The values bound to a query template.
#[derive(Debug, Clone, Default, PartialEq)]
pub enum Binds {
    #[default]
    None,
    Positional(Vec<Bind>),
    Named(Vec<(String, Bind)>),
}

impl Binds {
    /// Positional binds, all escaped.
    pub fn positional<I, V>(values: I) -> Self
    where
        I: IntoIterator<Item = V>,
        V: Into<Value>,
    {
        Binds::Positional(values.into_iter().map(Bind::escaped).collect())
    }

    /// Named binds, all escaped.
    pub fn named<I, K, V>(values: I) -> Self
    where
        I: IntoIterator<Item = (K, V)>,
        K: Into<String>,
        V: Into<Value>,
    {
        Binds::Named(values.into_iter().map(|(k, v)| (k.into(), Bind::escaped(v))).collect())
    }

    pub fn is_empty(&self) -> bool {
        match self {
            Binds::None => true,
            Binds::Positional(b) => b.is_empty(),
            Binds::Named(b) => b.is_empty(),
        }
    }

    pub fn len(&self) -> usize {
        match self {
            Binds::None => 0,
            Binds::Positional(b) => b.len(),
            Binds::Named(b) => b.len(),
        }
    }
}

impl From<()> for Binds {
    fn from(_: ()) -> Self {
        Binds::None
    }
}

impl<T: Into<Value>> From<Vec<T>> for Binds {
    fn from(values: Vec<T>) -> Self {
        Binds::positional(values)
    }
}

impl<K: Into<String>, V: Into<Value>, const N: usize> From<[(K, V); N]> for Binds {
    fn from(values: [(K, V); N]) -> Self {
        Binds::named(values)
    }
}

// ============================================================================
// Query
// ============================================================================

/// A compiled statement.
#[derive(Debug, Clone)]
pub struct Query {
    original: String,
    binds: Binds,
    final_sql: String,
    is_write: bool,
    started_at: Option<DateTime<Utc>>,
    start: Option<Instant>,
    end: Option<Instant>,
    error_code: Option<String>,
    error_message: Option<String>,
}

impl Query {
    /// Builds a query and substitutes its binds.
    ///
    /// # Errors
    ///
    /// `Error::Escape` when a bound value cannot be escaped.
    pub fn new(sql: impl Into<String>, binds: impl Into<Binds>, dialect: &dyn Dialect) -> Result<Self, Error> {
        let original = sql.into();
        let binds = binds.into();
        let final_sql = compile_binds(&original, &binds, dialect)?;
        let is_write = dialect.classify_write(&original, is_write_type(&original));

        Ok(Self {
            original,
            binds,
            final_sql,
            is_write,
            started_at: None,
            start: None,
            end: None,
            error_code: None,
            error_message: None,
        })
    }

    /// Returns a new query from the same template with different binds.
    pub fn rebind(&self, binds: impl Into<Binds>, dialect: &dyn Dialect) -> Result<Self, Error> {
        Query::new(self.original.clone(), binds, dialect)
    }

    /// Final SQL with binds substituted.
    pub fn get_query(&self) -> &str {
        &self.final_sql
    }

    /// The template as the caller wrote it.
    pub fn get_original_query(&self) -> &str {
        &self.original
    }

    pub fn get_binds(&self) -> &Binds {
        &self.binds
    }

    pub fn is_write_type(&self) -> bool {
        self.is_write
    }

    /// Rewrites table prefix `orig` to `swap` wherever it starts an identifier.
    ///
    /// ```rust,ignore
    /// q.swap_prefix("db_", "ci_")?;
    /// // SELECT * FROM db_users WHERE db_users.id = 1
    /// // SELECT * FROM ci_users WHERE ci_users.id = 1
    /// ```
    pub fn swap_prefix(&mut self, orig: &str, swap: &str) -> Result<&mut Self, Error> {
        self.final_sql = swap_prefix(&self.final_sql, orig, swap)?;
        Ok(self)
    }

    pub(crate) fn mark_start(&mut self) {
        self.started_at = Some(Utc::now());
        self.start = Some(Instant::now());
    }

    pub(crate) fn mark_end(&mut self) {
        self.end = Some(Instant::now());
    }

    pub(crate) fn set_error(&mut self, code: Option<String>, message: String) {
        self.error_code = code;
        self.error_message = Some(message);
    }

    /// Wall-clock time the query was sent.
    pub fn get_start_time(&self) -> Option<DateTime<Utc>> {
        self.started_at
    }

    pub fn duration(&self) -> Option<Duration> {
        match (self.start, self.end) {
            (Some(start), Some(end)) => Some(end.saturating_duration_since(start)),
            _ => None,
        }
    }

    /// Duration in seconds with `decimals` digits, e.g. `"0.000412"`.
    pub fn get_duration(&self, decimals: usize) -> String {
        let secs = self.duration().map(|d| d.as_secs_f64()).unwrap_or(0.0);
        format!("{:.*}", decimals, secs)
    }

    pub fn has_error(&self) -> bool {
        self.error_message.is_some()
    }

    pub fn get_error_code(&self) -> Option<&str> {
        self.error_code.as_deref()
    }

    pub fn get_error_message(&self) -> Option<&str> {
        self.error_message.as_deref()
    }
}

// ============================================================================
// Helpers
// ============================================================================

/// Returns a cached regex, compiling it on first use.
pub(crate) fn cached_regex(cell: &'static OnceLock<Regex>, pattern: &str) -> Result<&'static Regex, Error> {
    if let Some(re) = cell.get() {
        return Ok(re);
    }
    let re = Regex::new(pattern).map_err(|e| Error::InvalidArgument(format!("bad pattern {}: {}", pattern, e)))?;
    Ok(cell.get_or_init(|| re))
}

/// Whether a statement changes data or schema, judged by its leading keyword.
pub fn is_write_type(sql: &str) -> bool {
    let trimmed = sql.trim_start();
    let trimmed = trimmed.strip_prefix('"').unwrap_or(trimmed);

    let keyword_len = trimmed.find(|c: char| !c.is_ascii_alphabetic()).unwrap_or(trimmed.len());
    let (keyword, rest) = trimmed.split_at(keyword_len);

    if !rest.starts_with(|c: char| c.is_whitespace()) {
        return false;
    }

    WRITE_KEYWORDS.iter().any(|k| k.eq_ignore_ascii_case(keyword))
}

/// Rewrites `orig` to `swap` when it follows a non-word character.
pub fn swap_prefix(sql: &str, orig: &str, swap: &str) -> Result<String, Error> {
    if orig.is_empty() || orig == swap {
        return Ok(sql.to_string());
    }

    let pattern = format!(r"(\W){}(\S+?)", regex::escape(orig));
    let re = Regex::new(&pattern).map_err(|e| Error::InvalidArgument(format!("invalid prefix {}: {}", orig, e)))?;
    let replacement = format!("${{1}}{}${{2}}", swap.replace('$', "$$"));
    Ok(re.replace_all(sql, replacement.as_str()).into_owned())
}

fn render_bind(bind: &Bind, dialect: &dyn Dialect) -> Result<String, Error> {
    if bind.escape {
        return escape_value(dialect, &bind.value);
    }

    match &bind.value {
        Value::List(items) => {
            let parts: Vec<String> = items.iter().map(|v| v.as_text().unwrap_or_else(|| "NULL".to_string())).collect();
            Ok(format!("({})", parts.join(",")))
        }
        Value::Null => Ok("NULL".to_string()),
        other => other
            .as_text()
            .ok_or_else(|| Error::escape("unescaped binds must be textual or numeric")),
    }
}

fn compile_binds(sql: &str, binds: &Binds, dialect: &dyn Dialect) -> Result<String, Error> {
    match binds {
        Binds::None => Ok(sql.to_string()),
        Binds::Positional(values) if values.is_empty() => Ok(sql.to_string()),
        Binds::Named(values) if values.is_empty() => Ok(sql.to_string()),
        Binds::Positional(values) => compile_positional(sql, values, dialect),
        Binds::Named(values) => compile_named(sql, values, dialect),
    }
}

/// Byte offsets of `?` markers outside single-quoted literals.
fn marker_offsets(sql: &str) -> Vec<usize> {
    let mut offsets = Vec::new();
    let mut in_literal = false;

    for (idx, c) in sql.char_indices() {
        match c {
            '\'' => in_literal = !in_literal,
            '?' if !in_literal => offsets.push(idx),
            _ => {}
        }
    }
    offsets
}

fn compile_positional(sql: &str, values: &[Bind], dialect: &dyn Dialect) -> Result<String, Error> {
    let offsets = marker_offsets(sql);
    if offsets.len() != values.len() {
        return Ok(sql.to_string());
    }

    let mut out = String::with_capacity(sql.len() + values.len() * 8);
    let mut cursor = 0;
    for (offset, bind) in offsets.iter().zip(values) {
        out.push_str(&sql[cursor..*offset]);
        out.push_str(&render_bind(bind, dialect)?);
        cursor = offset + 1;
    }
    out.push_str(&sql[cursor..]);
    Ok(out)
}

fn compile_named(sql: &str, values: &[(String, Bind)], dialect: &dyn Dialect) -> Result<String, Error> {
    let mut replacers: Vec<(String, String)> = Vec::with_capacity(values.len());
    for (name, bind) in values {
        replacers.push((format!(":{}:", name), render_bind(bind, dialect)?));
    }
    replacers.sort_by(|a, b| b.0.len().cmp(&a.0.len()));

    // Single left-to-right pass, longest placeholder first at each position.
    // Substituted text is never scanned again.
    let mut out = String::with_capacity(sql.len());
    let mut rest = sql;
    'scan: while !rest.is_empty() {
        if rest.starts_with(':') {
            for (placeholder, replacement) in &replacers {
                if let Some(after) = rest.strip_prefix(placeholder.as_str()) {
                    out.push_str(replacement);
                    rest = after;
                    continue 'scan;
                }
            }
        }
        let mut chars = rest.chars();
        if let Some(c) = chars.next() {
            out.push(c);
        }
        rest = chars.as_str();
    }
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::database::Drivers;
    use rstest::rstest;

    fn pg() -> &'static dyn Dialect {
        Drivers::Postgres.dialect()
    }

    #[test]
    fn positional_binding() {
        let q = Query::new("SELECT * FROM t WHERE id = ?", vec![13], pg()).unwrap();
        assert_eq!(q.get_query(), "SELECT * FROM t WHERE id = 13");
        assert_eq!(q.get_original_query(), "SELECT * FROM t WHERE id = ?");
    }

    #[test]
    fn named_binding() {
        let q = Query::new(
            "SELECT * FROM t WHERE id = :id: OR name = :name:",
            [("id", Value::from(13)), ("name", Value::from("Geoffrey"))],
            pg(),
        )
        .unwrap();
        assert_eq!(q.get_query(), "SELECT * FROM t WHERE id = 13 OR name = 'Geoffrey'");
    }

    #[test]
    fn named_binds_do_not_cross_substitute() {
        let q = Query::new(
            "SELECT * FROM pages WHERE site = :site: AND sitemap = :sitemap:",
            [("site", "a"), ("sitemap", "b")],
            pg(),
        )
        .unwrap();
        assert_eq!(q.get_query(), "SELECT * FROM pages WHERE site = 'a' AND sitemap = 'b'");
    }

    #[test]
    fn markers_inside_literals_are_ignored() {
        let q = Query::new("SELECT '?' AS q, id FROM t WHERE id = ?", vec![5], pg()).unwrap();
        assert_eq!(q.get_query(), "SELECT '?' AS q, id FROM t WHERE id = 5");
    }

    #[test]
    fn count_mismatch_leaves_sql_unchanged() {
        let q = Query::new("SELECT * FROM t WHERE a = ? AND b = ?", vec![1], pg()).unwrap();
        assert_eq!(q.get_query(), "SELECT * FROM t WHERE a = ? AND b = ?");
    }

    #[test]
    fn list_binds_render_as_tuples() {
        let q = Query::new("SELECT * FROM t WHERE id IN ?", vec![Value::from(vec![1i64, 2, 3])], pg()).unwrap();
        assert_eq!(q.get_query(), "SELECT * FROM t WHERE id IN (1,2,3)");
    }

    #[test]
    fn raw_binds_are_not_escaped() {
        let q = Query::new("SELECT ? FROM t", Binds::Positional(vec![Bind::raw("MAX(id)")]), pg()).unwrap();
        assert_eq!(q.get_query(), "SELECT MAX(id) FROM t");
    }

    #[test]
    fn rebinding_preserves_the_template() {
        let q = Query::new("SELECT * FROM t WHERE id = ?", vec![1], pg()).unwrap();
        let q2 = q.rebind(vec![2], pg()).unwrap();
        assert_eq!(q2.get_query(), "SELECT * FROM t WHERE id = 2");
        assert_eq!(q2.get_original_query(), q.get_original_query());
        assert_eq!(q.get_query(), "SELECT * FROM t WHERE id = 1");
    }

    #[test]
    fn unescapable_bind_is_an_error() {
        let err = Query::new("INSERT INTO t VALUES (?)", vec![Value::Bytes(vec![0])], pg()).unwrap_err();
        assert!(matches!(err, Error::Escape(_)));
    }

    #[rstest]
    #[case("SET NAMES utf8")]
    #[case("INSERT INTO t VALUES (1)")]
    #[case("update t set a = 1")]
    #[case("  DELETE FROM t")]
    #[case("REPLACE INTO t VALUES (1)")]
    #[case("CREATE TABLE t (id INT)")]
    #[case("DROP TABLE t")]
    #[case("TRUNCATE t")]
    #[case("ALTER TABLE t ADD c INT")]
    #[case("GRANT ALL ON t TO u")]
    #[case("REVOKE ALL ON t FROM u")]
    #[case("LOCK TABLES t WRITE")]
    #[case("UNLOCK TABLES")]
    #[case("REINDEX TABLE t")]
    #[case("\"INSERT\" INTO t")]
    fn write_statements_are_detected(#[case] sql: &str) {
        assert!(is_write_type(sql));
    }

    #[rstest]
    #[case("SELECT * FROM t")]
    #[case("SHOW TABLES")]
    #[case("INSERTED")]
    #[case("WITH x AS (SELECT 1) SELECT * FROM x")]
    fn reads_are_not_writes(#[case] sql: &str) {
        assert!(!is_write_type(sql));
    }

    #[test]
    fn returning_counts_as_read_on_postgres() {
        let q = Query::new("INSERT INTO t (a) VALUES (1) RETURNING id", (), pg()).unwrap();
        assert!(!q.is_write_type());

        let q = Query::new("INSERT INTO t (a) VALUES (1) RETURNING id", (), Drivers::MySQL.dialect()).unwrap();
        assert!(q.is_write_type());
    }

    #[test]
    fn prefix_swap() {
        let out = swap_prefix("SELECT * FROM db_users WHERE db_users.id = 1", "db_", "ci_").unwrap();
        assert_eq!(out, "SELECT * FROM ci_users WHERE ci_users.id = 1");
    }

    #[test]
    fn duration_is_formatted() {
        let mut q = Query::new("SELECT 1", (), pg()).unwrap();
        assert_eq!(q.get_duration(3), "0.000");
        q.mark_start();
        q.mark_end();
        assert!(q.duration().is_some());
        assert!(q.get_start_time().is_some());
    }
}
