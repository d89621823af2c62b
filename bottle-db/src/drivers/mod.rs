//! # Driver Seams
//!
//! Everything that differs between backends sits behind the traits in this
//! module. A driver tag picks one implementation of each at configuration time:
//!
//! - [`Connector`]: opens a native handle and prepares the session
//! - [`NativeConnection`]: runs SQL on an open handle
//! - [`Dialect`]: SQL text rules and system catalog queries
//! - [`crate::forge::ForgeRules`]: DDL type mapping and attribute rules
//!
//! The default method bodies of [`Dialect`] are the shared base behavior.
//! Drivers override only the clauses that differ.

pub mod mysqli;
pub mod postgre;
pub mod sqlite3;

use std::sync::OnceLock;

use async_trait::async_trait;
use regex::Regex;
use sqlx::{Column, Row, TypeInfo, ValueRef, ColumnIndex, Decode};

use crate::{
    Error,
    config::ConnectionConfig,
    database::Drivers,
    introspection::{FieldData, ForeignKeyData, IndexData},
    query::cached_regex,
    value::Value,
};

static SOURCE_TABLE: OnceLock<Regex> = OnceLock::new();

// ============================================================================
// Native Results
// ============================================================================

/// Acknowledgement of a write statement.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ExecResult {
    pub affected_rows: u64,
    pub last_insert_id: Option<i64>,
}

/// Name and backend type of a result column, plus the key and nullability
/// flags of the table column it was read from.
///
/// Computed columns, and columns the driver cannot trace to a table, keep
/// the defaults: not a primary key, nullable.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ColumnMeta {
    pub name: String,
    pub type_name: String,
    pub primary_key: bool,
    pub nullable: bool,
}

impl ColumnMeta {
    pub fn new(name: impl Into<String>, type_name: impl Into<String>) -> Self {
        Self { name: name.into(), type_name: type_name.into(), primary_key: false, nullable: true }
    }
}

/// A fully buffered result set as delivered by a native handle.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RowSet {
    pub columns: Vec<ColumnMeta>,
    pub rows: Vec<Vec<Value>>,
}

impl RowSet {
    pub fn column_index(&self, name: &str) -> Option<usize> {
        self.columns.iter().position(|c| c.name.eq_ignore_ascii_case(name))
    }

    /// Value of column `name` in row `row`.
    pub fn value(&self, row: usize, name: &str) -> Option<&Value> {
        let idx = self.column_index(name)?;
        self.rows.get(row)?.get(idx)
    }

    /// Text of column `name` in row `row`, empty when absent or NULL.
    pub fn text(&self, row: usize, name: &str) -> String {
        self.value(row, name).and_then(Value::as_text).unwrap_or_default()
    }

    /// Text of the first column of every row.
    pub fn first_column(&self) -> Vec<String> {
        self.rows
            .iter()
            .filter_map(|r| r.first().and_then(Value::as_text))
            .collect()
    }
}

/// Outcome of running a prepared statement.
#[derive(Debug, Clone, PartialEq)]
pub enum PreparedOutcome {
    Rows(RowSet),
    Write(ExecResult),
}

// ============================================================================
// Native Connection
// ============================================================================

/// An open native handle.
///
/// Errors carry the backend code and message (`Error::Execution`).
#[async_trait]
pub trait NativeConnection: Send {
    /// Runs a statement that does not return rows.
    async fn execute(&mut self, sql: &str) -> Result<ExecResult, Error>;

    /// Runs a statement and buffers every row it returns.
    async fn fetch(&mut self, sql: &str) -> Result<RowSet, Error>;

    /// Asks the backend to prepare `sql` (native placeholders already applied).
    async fn prepare(&mut self, sql: &str) -> Result<(), Error>;

    /// Runs a statement previously prepared with `prepare`.
    async fn execute_prepared(&mut self, sql: &str, params: &[Value], read: bool) -> Result<PreparedOutcome, Error>;

    /// Releases a prepared statement on the backend.
    async fn deallocate(&mut self, _sql: &str) -> Result<(), Error> {
        Ok(())
    }

    /// Checks that the handle is still usable.
    async fn ping(&mut self) -> Result<(), Error>;

    /// Closes the handle.
    async fn close(self: Box<Self>) -> Result<(), Error>;
}

/// Opens native handles for one driver.
#[async_trait]
pub trait Connector: Send + Sync {
    /// Connects with an already resolved config, applying session settings
    /// (schema, charset, strict mode) and verifying encryption when configured.
    async fn connect(&self, config: &ConnectionConfig, persistent: bool) -> Result<Box<dyn NativeConnection>, Error>;
}

// ============================================================================
// Dialect
// ============================================================================

/// How a dialect expresses "insert, ignoring conflicts".
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IgnoreStyle {
    /// Replaces the leading `INSERT` keyword.
    Prefix(&'static str),
    /// Appended after the VALUES list.
    Suffix(&'static str),
}

/// Placeholder style of native prepared statements.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PlaceholderStyle {
    /// `?` for every parameter.
    Question,
    /// `$1`, `$2`, ...
    Dollar,
}

/// SQL text rules and catalog access of one backend.
#[async_trait]
pub trait Dialect: Send + Sync {
    fn driver(&self) -> Drivers;

    /// Identifier quote character.
    fn escape_char(&self) -> char {
        '"'
    }

    /// Escapes the body of a single-quoted string literal.
    fn escape_string_body(&self, value: &str) -> String {
        value.replace('\'', "''")
    }

    /// Escape character used inside LIKE patterns.
    fn like_escape_char(&self) -> char {
        '!'
    }

    fn bool_literal(&self, value: bool) -> &'static str {
        if value { "1" } else { "0" }
    }

    /// Random ordering function, optionally seeded.
    fn random_keyword(&self, seed: Option<u32>) -> String {
        match seed {
            Some(seed) => format!("RAND({})", seed),
            None => "RAND()".to_string(),
        }
    }

    /// Statement seeding the session random generator, for dialects that
    /// cannot seed inline.
    fn seed_statement(&self, _seed: u32) -> Option<String> {
        None
    }

    /// LIMIT clause including its leading space. Empty without a limit.
    fn compile_limit(&self, limit: Option<u64>, offset: Option<u64>) -> String {
        match (limit, offset) {
            (Some(limit), Some(offset)) if offset > 0 => format!(" LIMIT {}, {}", offset, limit),
            (Some(limit), _) => format!(" LIMIT {}", limit),
            (None, _) => String::new(),
        }
    }

    /// Whether UPDATE/DELETE accept a LIMIT clause.
    fn limit_on_write(&self) -> bool {
        true
    }

    /// Right-hand side of `col = <expr>` for increment/decrement.
    /// `column` is already escaped.
    fn increment_expression(&self, column: &str, sign: char, amount: i64) -> String {
        format!("{} {} {}", column, sign, amount)
    }

    /// Whether `REPLACE INTO` exists natively.
    fn supports_replace(&self) -> bool {
        true
    }

    fn insert_ignore(&self) -> IgnoreStyle {
        IgnoreStyle::Prefix("INSERT IGNORE")
    }

    /// Statement emptying a table. `table` is already escaped.
    fn truncate_statement(&self, table: &str) -> String {
        format!("TRUNCATE {}", table)
    }

    fn supports_full_outer_join(&self) -> bool {
        false
    }

    /// Case-insensitive LIKE: `(column, operator)` with column already escaped.
    fn case_insensitive_like(&self, column: &str, negate: bool) -> (String, &'static str) {
        (format!("LOWER({})", column), if negate { "NOT LIKE" } else { "LIKE" })
    }

    fn begin_statement(&self) -> &'static str {
        "BEGIN"
    }

    fn commit_statement(&self) -> &'static str {
        "COMMIT"
    }

    fn rollback_statement(&self) -> &'static str {
        "ROLLBACK"
    }

    fn placeholder_style(&self) -> PlaceholderStyle {
        PlaceholderStyle::Question
    }

    /// Write classification override, e.g. `INSERT ... RETURNING` reads rows.
    fn classify_write(&self, _sql: &str, generic: bool) -> bool {
        generic
    }

    /// Final rewrite right before a statement reaches the native handle.
    fn prepare_for_execution(&self, sql: &str) -> String {
        sql.to_string()
    }

    /// Server version string, used once per connection (the connection caches it).
    async fn version(&self, conn: &mut dyn NativeConnection) -> Result<String, Error>;

    /// Query listing tables, optionally limited to names starting with `prefix`.
    fn list_tables_sql(&self, prefix: Option<&str>) -> String;

    /// Query whose first column lists the columns of `table`.
    fn list_columns_sql(&self, table: &str) -> String;

    async fn field_data(&self, conn: &mut dyn NativeConnection, table: &str) -> Result<Vec<FieldData>, Error>;

    async fn index_data(&self, conn: &mut dyn NativeConnection, table: &str) -> Result<Vec<IndexData>, Error>;

    async fn foreign_key_data(&self, conn: &mut dyn NativeConnection, table: &str) -> Result<Vec<ForeignKeyData>, Error>;

    fn disable_foreign_key_checks_sql(&self) -> &'static str;

    fn enable_foreign_key_checks_sql(&self) -> &'static str;

    /// Query returning the last generated id when the native acknowledgement
    /// does not carry one.
    fn insert_id_query(&self) -> Option<&'static str> {
        None
    }
}

// ============================================================================
// Row Decoding
// ============================================================================

/// Decodes every cell of a sqlx row into `Value`s.
///
/// Cells are read as text (all three drivers run ad-hoc statements through
/// the text protocol) and typed from their backend type name. Binary columns
/// are read as bytes.
pub(crate) fn decode_row<R>(row: &R) -> Result<Vec<Value>, sqlx::Error>
where
    R: Row,
    usize: ColumnIndex<R>,
    for<'r> Option<String>: Decode<'r, R::Database>,
    for<'r> Option<Vec<u8>>: Decode<'r, R::Database>,
{
    let mut values = Vec::with_capacity(row.len());

    for idx in 0..row.len() {
        let (is_null, type_name) = {
            let raw = row.try_get_raw(idx)?;
            (raw.is_null(), raw.type_info().name().to_string())
        };

        if is_null {
            values.push(Value::Null);
            continue;
        }

        if is_binary_type(&type_name) {
            let bytes: Option<Vec<u8>> = row.try_get_unchecked(idx)?;
            values.push(bytes.map(Value::Bytes).unwrap_or(Value::Null));
            continue;
        }

        let text: Option<String> = row.try_get_unchecked(idx)?;
        values.push(text.map(|t| Value::from_column_text(&type_name, t)).unwrap_or(Value::Null));
    }

    Ok(values)
}

/// Column metadata of a sqlx row.
pub(crate) fn row_columns<R: Row>(row: &R) -> Vec<ColumnMeta> {
    row.columns()
        .iter()
        .map(|c| ColumnMeta::new(c.name(), c.type_info().name()))
        .collect()
}

/// Tables named after FROM or JOIN in a SELECT (or WITH) statement, unquoted
/// and without schema. Empty for any other statement.
pub(crate) fn source_tables(sql: &str) -> Vec<String> {
    let head = sql.trim_start();
    let reads = ["SELECT", "WITH"]
        .iter()
        .any(|kw| head.get(..kw.len()).is_some_and(|w| w.eq_ignore_ascii_case(kw)));
    if !reads {
        return Vec::new();
    }
    let Ok(re) = cached_regex(&SOURCE_TABLE, r#"(?i)\b(?:FROM|JOIN)\s+((?:[`"\[]?[\w$]+[`"\]]?\.)?[`"\[]?[\w$]+[`"\]]?)"#) else {
        return Vec::new();
    };

    let mut tables: Vec<String> = Vec::new();
    for cap in re.captures_iter(sql) {
        let qualified = cap.get(1).map(|m| m.as_str()).unwrap_or_default();
        let name = qualified
            .rsplit('.')
            .next()
            .unwrap_or_default()
            .trim_matches(|c| matches!(c, '`' | '"' | '[' | ']'));
        if !name.is_empty() && !tables.iter().any(|t| t == name) {
            tables.push(name.to_string());
        }
    }
    tables
}

/// Copies the catalog flags of same-named table columns onto `columns`.
/// A name found in more than one table stays unmarked.
pub(crate) fn apply_field_flags(columns: &mut [ColumnMeta], tables: &[Vec<FieldData>]) {
    for column in columns.iter_mut() {
        let mut found = tables.iter().flatten().filter(|f| f.name.eq_ignore_ascii_case(&column.name));
        if let (Some(field), None) = (found.next(), found.next()) {
            column.primary_key = field.primary_key;
            column.nullable = field.nullable;
        }
    }
}

/// Whether `sql` may change table definitions (and so invalidate cached
/// catalog flags).
pub(crate) fn is_schema_change(sql: &str) -> bool {
    let word = sql.split_whitespace().next().unwrap_or_default();
    ["CREATE", "ALTER", "DROP", "RENAME"].iter().any(|kw| word.eq_ignore_ascii_case(kw))
}

fn is_binary_type(type_name: &str) -> bool {
    let upper = type_name.to_ascii_uppercase();
    upper == "BYTEA" || upper.contains("BLOB") || upper.contains("BINARY")
}

/// Leading number of a parenthesised type length: `VARCHAR(255)` gives 255.
pub(crate) fn type_length(type_name: &str) -> Option<u64> {
    let open = type_name.find('(')?;
    let close = type_name[open..].find(')')? + open;
    type_name[open + 1..close].split(',').next()?.trim().parse().ok()
}

/// Folds one row per foreign key column into one record per constraint.
///
/// Expects the columns `constraint_name`, `table_name`, `column_name`,
/// `foreign_table_name`, `foreign_column_name`, `on_delete`, `on_update`
/// and `match_type`, ordered by constraint.
pub(crate) fn group_foreign_keys(rows: &RowSet) -> Vec<ForeignKeyData> {
    let mut keys: Vec<ForeignKeyData> = Vec::new();

    for i in 0..rows.rows.len() {
        let name = rows.text(i, "constraint_name");
        let column = rows.text(i, "column_name");
        let foreign_column = rows.text(i, "foreign_column_name");

        if let Some(fk) = keys.iter_mut().find(|fk| fk.constraint_name == name) {
            fk.column_name.push(column);
            fk.foreign_column_name.push(foreign_column);
            continue;
        }

        keys.push(ForeignKeyData {
            constraint_name: name,
            table_name: rows.text(i, "table_name"),
            column_name: vec![column],
            foreign_table_name: rows.text(i, "foreign_table_name"),
            foreign_column_name: vec![foreign_column],
            on_delete: rows.value(i, "on_delete").and_then(Value::as_text),
            on_update: rows.value(i, "on_update").and_then(Value::as_text),
            match_type: rows.value(i, "match_type").and_then(Value::as_text),
        });
    }
    keys
}

/// Wraps a sqlx error raised by a native call into a classified error.
pub(crate) fn native_error(sql: &str) -> impl FnOnce(sqlx::Error) -> Error + '_ {
    move |err| Error::execution(err, sql)
}

// ============================================================================
// Test Driver
// ============================================================================

#[cfg(test)]
pub(crate) mod mock {
    //! A recording driver for connection-level tests.

    use std::sync::{Arc, Mutex};

    use super::*;

    /// Shared log of connect attempts and statements.
    #[derive(Debug, Default, Clone)]
    pub struct MockLog {
        inner: Arc<Mutex<MockState>>,
    }

    #[derive(Debug, Default)]
    struct MockState {
        connects: Vec<(String, bool)>,
        statements: Vec<String>,
    }

    impl MockLog {
        pub fn statements(&self) -> Vec<String> {
            self.inner.lock().map(|s| s.statements.clone()).unwrap_or_default()
        }

        /// `(hostname, succeeded)` for every connect attempt.
        pub fn connects(&self) -> Vec<(String, bool)> {
            self.inner.lock().map(|s| s.connects.clone()).unwrap_or_default()
        }

        pub fn count(&self, sql: &str) -> usize {
            self.statements().iter().filter(|s| s.as_str() == sql).count()
        }

        fn record_connect(&self, host: &str, ok: bool) {
            if let Ok(mut s) = self.inner.lock() {
                s.connects.push((host.to_string(), ok));
            }
        }

        fn record(&self, sql: &str) {
            if let Ok(mut s) = self.inner.lock() {
                s.statements.push(sql.to_string());
            }
        }
    }

    /// Connector refusing every host listed in `failing_hosts`.
    pub struct MockConnector {
        pub log: MockLog,
        pub failing_hosts: Vec<String>,
        /// Statements containing this text fail with code `42000`.
        pub failing_sql: Option<String>,
        /// Rows returned for every read.
        pub rows: RowSet,
    }

    impl MockConnector {
        pub fn new(log: MockLog) -> Self {
            Self { log, failing_hosts: Vec::new(), failing_sql: None, rows: RowSet::default() }
        }
    }

    #[async_trait]
    impl Connector for MockConnector {
        async fn connect(&self, config: &ConnectionConfig, _persistent: bool) -> Result<Box<dyn NativeConnection>, Error> {
            if self.failing_hosts.iter().any(|h| h == &config.hostname) {
                self.log.record_connect(&config.hostname, false);
                return Err(Error::Connect(format!("host {} refused the connection", config.hostname)));
            }
            self.log.record_connect(&config.hostname, true);
            Ok(Box::new(MockConnection {
                log: self.log.clone(),
                failing_sql: self.failing_sql.clone(),
                rows: self.rows.clone(),
            }))
        }
    }

    struct MockConnection {
        log: MockLog,
        failing_sql: Option<String>,
        rows: RowSet,
    }

    impl MockConnection {
        fn run(&self, sql: &str) -> Result<(), Error> {
            self.log.record(sql);
            match &self.failing_sql {
                Some(needle) if sql.contains(needle.as_str()) => Err(Error::Execution {
                    code: Some("42000".to_string()),
                    message: "syntax error".to_string(),
                    sql: sql.to_string(),
                }),
                _ => Ok(()),
            }
        }
    }

    #[async_trait]
    impl NativeConnection for MockConnection {
        async fn execute(&mut self, sql: &str) -> Result<ExecResult, Error> {
            self.run(sql)?;
            Ok(ExecResult { affected_rows: 1, last_insert_id: Some(7) })
        }

        async fn fetch(&mut self, sql: &str) -> Result<RowSet, Error> {
            self.run(sql)?;
            Ok(self.rows.clone())
        }

        async fn prepare(&mut self, sql: &str) -> Result<(), Error> {
            self.run(&format!("PREPARE {}", sql))
        }

        async fn execute_prepared(&mut self, sql: &str, params: &[Value], read: bool) -> Result<PreparedOutcome, Error> {
            self.run(&format!("EXECUTE {} {:?}", sql, params))?;
            if read {
                Ok(PreparedOutcome::Rows(self.rows.clone()))
            } else {
                Ok(PreparedOutcome::Write(ExecResult { affected_rows: 1, last_insert_id: None }))
            }
        }

        async fn deallocate(&mut self, sql: &str) -> Result<(), Error> {
            self.run(&format!("DEALLOCATE {}", sql))
        }

        async fn ping(&mut self) -> Result<(), Error> {
            Ok(())
        }

        async fn close(self: Box<Self>) -> Result<(), Error> {
            self.log.record("CLOSE");
            Ok(())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn field(name: &str, primary_key: bool, nullable: bool) -> FieldData {
        FieldData { name: name.into(), type_name: "INT".into(), max_length: None, default: None, primary_key, nullable }
    }

    #[test]
    fn source_tables_follow_from_and_join() {
        assert_eq!(
            source_tables("SELECT u.id FROM \"public\".\"users\" u JOIN `teams` t ON t.id = u.team_id"),
            vec!["users", "teams"]
        );
        assert_eq!(source_tables("with recent AS (SELECT 1) SELECT * FROM recent"), vec!["recent"]);
        assert!(source_tables("SHOW COLUMNS FROM users").is_empty());
        assert!(source_tables("DELETE FROM users").is_empty());
    }

    #[test]
    fn ambiguous_columns_stay_unmarked() {
        let mut columns = vec![ColumnMeta::new("id", "INT"), ColumnMeta::new("email", "TEXT"), ColumnMeta::new("n", "INT")];
        let tables = vec![
            vec![field("id", true, false), field("email", false, false)],
            vec![field("id", true, false)],
        ];
        apply_field_flags(&mut columns, &tables);

        assert!(!columns[0].primary_key && columns[0].nullable);
        assert!(!columns[1].primary_key && !columns[1].nullable);
        assert_eq!(columns[2], ColumnMeta::new("n", "INT"));
    }

    #[test]
    fn schema_changes_are_recognised() {
        assert!(is_schema_change("  create TABLE t (id INT)"));
        assert!(is_schema_change("ALTER TABLE t ADD c INT"));
        assert!(!is_schema_change("INSERT INTO t VALUES (1)"));
    }
}
