//! # Query Builder Module
//!
//! A fluent builder for SELECT, INSERT, UPDATE, REPLACE and DELETE statements,
//! bound to one [`Connection`].
//!
//! ## Features
//!
//! - **Identifier protection**: tables get the connection prefix and every
//!   identifier is quoted for the driver. `protect(false)` turns quoting and
//!   value escaping off for the clauses added afterwards
//! - **Named binds**: values compile to `:name:` placeholders (`id`, `id0`,
//!   `id1`, ... for repeated names), so the template of a pretended query can
//!   be prepared later
//! - **Operators in keys**: `where_("age >=", 18)`, `where_("name !=", "x")`,
//!   `where_("id IN", vec![1, 2])`; a NULL value compiles to `IS NULL`
//! - **Predicate groups**: `group_start` / `or_group_start` / `not_group_start`
//!   / `or_not_group_start` / `group_end`
//! - **Reset after every terminal call**: the table stays, everything else is
//!   cleared
//!
//! ## Example Usage
//!
//! ```rust,ignore
//! let adults = conn
//!     .table("users u")?
//!     .select("u.id, u.name")
//!     .join("teams t", "t.id = u.team_id", JoinType::Left)
//!     .where_("u.age >=", 18)
//!     .or_group_start()
//!     .like("u.name", "ad", LikeSide::After)
//!     .where_("u.active", true)
//!     .group_end()
//!     .order_by("u.name", Direction::Asc)
//!     .limit(20)
//!     .get()
//!     .await?
//!     .into_result()?;
//!
//! conn.table("users")?.where_("id", 7).update([("name", "Ada")]).await?;
//! ```

use std::sync::OnceLock;

use regex::Regex;

use crate::{
    Error,
    connection::Connection,
    drivers::{Dialect, IgnoreStyle},
    escape::{escape_identifiers, escape_string, escape_value, like_escape_clause},
    query::{Bind, Binds, Query, cached_regex},
    record::IntoFields,
    result::{Outcome, WriteAck},
    value::Value,
};

static OPERATOR: OnceLock<Regex> = OnceLock::new();
static JOIN_CONNECTIVE: OnceLock<Regex> = OnceLock::new();
static JOIN_COMPARISON: OnceLock<Regex> = OnceLock::new();

/// Rows per statement in `insert_batch` when no size is given.
pub const DEFAULT_BATCH_SIZE: usize = 100;

// ============================================================================
// Clause Types
// ============================================================================

/// Join flavours.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JoinType {
    /// Bare `JOIN`.
    Plain,
    Inner,
    Left,
    Right,
    Outer,
    LeftOuter,
    RightOuter,
    /// Only on drivers with FULL OUTER JOIN (Postgre).
    FullOuter,
}

impl JoinType {
    fn keyword(self) -> &'static str {
        match self {
            JoinType::Plain => "",
            JoinType::Inner => "INNER ",
            JoinType::Left => "LEFT ",
            JoinType::Right => "RIGHT ",
            JoinType::Outer => "OUTER ",
            JoinType::LeftOuter => "LEFT OUTER ",
            JoinType::RightOuter => "RIGHT OUTER ",
            JoinType::FullOuter => "FULL OUTER ",
        }
    }
}

/// ORDER BY direction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    Asc,
    Desc,
    /// Random order, optionally seeded.
    Random(Option<u32>),
}

/// Where the wildcard goes in a LIKE pattern.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LikeSide {
    /// `%value`
    Before,
    /// `value%`
    After,
    /// `%value%`
    Both,
    /// Exact match.
    None,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Connective {
    And,
    Or,
}

impl Connective {
    fn as_str(self) -> &'static str {
        match self {
            Connective::And => "AND",
            Connective::Or => "OR",
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
enum Predicate {
    Condition(Connective, String),
    Open(Connective, bool),
    Close,
}

/// Joins predicates in insertion order with their recorded connective.
fn compile_predicates(predicates: &[Predicate]) -> String {
    let mut sql = String::new();
    let mut after_open = true;

    for predicate in predicates {
        match predicate {
            Predicate::Condition(connective, condition) => {
                if !after_open {
                    sql.push(' ');
                    sql.push_str(connective.as_str());
                    sql.push(' ');
                }
                sql.push_str(condition);
                after_open = false;
            }
            Predicate::Open(connective, negate) => {
                if !after_open {
                    sql.push(' ');
                    sql.push_str(connective.as_str());
                    sql.push(' ');
                }
                if *negate {
                    sql.push_str("NOT ");
                }
                sql.push('(');
                after_open = true;
            }
            Predicate::Close => {
                sql.push(')');
                after_open = false;
            }
        }
    }
    sql
}

/// Splits on commas that are not inside parentheses.
fn split_top_level(list: &str) -> Vec<String> {
    let mut items = Vec::new();
    let mut depth = 0usize;
    let mut current = String::new();

    for c in list.chars() {
        match c {
            '(' => depth += 1,
            ')' => depth = depth.saturating_sub(1),
            ',' if depth == 0 => {
                items.push(current.trim().to_string());
                current.clear();
                continue;
            }
            _ => {}
        }
        current.push(c);
    }
    if !current.trim().is_empty() {
        items.push(current.trim().to_string());
    }
    items.retain(|i| !i.is_empty());
    items
}

/// Splits `"age >="` into `("age", ">=")`. Keys without an operator get `=`.
fn split_operator(key: &str) -> Result<(String, String), Error> {
    let re = cached_regex(
        &OPERATOR,
        r"(?i)^(.+?)\s*(<=|>=|<>|!=|=|<|>|\s+IS\s+NOT|\s+IS|\s+NOT\s+LIKE|\s+LIKE|\s+NOT\s+IN|\s+IN)\s*$",
    )?;
    let key = key.trim();

    Ok(match re.captures(key) {
        Some(c) => {
            let op = c[2].split_whitespace().collect::<Vec<_>>().join(" ").to_ascii_uppercase();
            (c[1].trim().to_string(), op)
        }
        None => (key.to_string(), "=".to_string()),
    })
}

/// Placeholder-safe bind name for a column.
fn bind_name(key: &str) -> String {
    let name: String =
        key.chars().map(|c| if c.is_ascii_alphanumeric() || c == '_' { c } else { '_' }).collect();
    let name = name.trim_matches('_').to_string();
    if name.is_empty() || name.starts_with(|c: char| c.is_ascii_digit()) { format!("bind_{}", name) } else { name }
}

// ============================================================================
// Builder State
// ============================================================================

#[derive(Debug, Clone)]
struct BuilderState {
    /// Protected FROM entries.
    from: Vec<String>,
    aliased_tables: Vec<String>,
    select: Vec<String>,
    distinct: bool,
    joins: Vec<String>,
    wheres: Vec<Predicate>,
    group_by: Vec<String>,
    havings: Vec<Predicate>,
    order_by: Vec<String>,
    seed: Option<u32>,
    limit: Option<u64>,
    offset: Option<u64>,
    /// `(protected column, value expression)`.
    sets: Vec<(String, String)>,
    /// Raw `(key, value)` pairs given to `set`, in order.
    set_fields: Vec<(String, Value)>,
    binds: Vec<(String, Bind)>,
    ignore: bool,
    protect: bool,
    /// First error raised by a clause method, reported by the next terminal call.
    error: Option<String>,
}

impl Default for BuilderState {
    fn default() -> Self {
        Self {
            from: Vec::new(),
            aliased_tables: Vec::new(),
            select: Vec::new(),
            distinct: false,
            joins: Vec::new(),
            wheres: Vec::new(),
            group_by: Vec::new(),
            havings: Vec::new(),
            order_by: Vec::new(),
            seed: None,
            limit: None,
            offset: None,
            sets: Vec::new(),
            set_fields: Vec::new(),
            binds: Vec::new(),
            ignore: false,
            protect: true,
            error: None,
        }
    }
}

// ============================================================================
// Builder
// ============================================================================

/// Statement builder bound to a connection. Created by [`Connection::table`].
pub struct Builder<'c> {
    conn: &'c mut Connection,
    /// Unaliased main table, the target of writes.
    table: String,
    state: BuilderState,
    /// State right after construction; `reset_query` returns to it.
    initial: BuilderState,
}

impl<'c> Builder<'c> {
    pub(crate) fn new(conn: &'c mut Connection, table: &str) -> Result<Self, Error> {
        let main = split_top_level(table)
            .first()
            .and_then(|t| t.split_whitespace().next())
            .unwrap_or_default()
            .to_string();

        let mut builder = Self { conn, table: main, state: BuilderState::default(), initial: BuilderState::default() };
        if !table.trim().is_empty() {
            builder.from(table);
        }
        builder.initial = builder.state.clone();
        Ok(builder)
    }

    fn dialect(&self) -> &'static dyn Dialect {
        self.conn.dialect()
    }

    fn defer(&mut self, err: Error) {
        if self.state.error.is_none() {
            self.state.error = Some(err.to_string());
        }
    }

    fn protect_column(&self, item: &str) -> String {
        self.conn.identifiers(&self.state.aliased_tables).protect(item, false, self.state.protect, true)
    }

    fn protect_table(&self, item: &str) -> String {
        self.conn.identifiers(&self.state.aliased_tables).protect(item, true, self.state.protect, false)
    }

    fn track_alias(&mut self, table: &str) {
        let words: Vec<&str> = table.split_whitespace().collect();
        if words.len() > 1 {
            if let Some(alias) = words.last() {
                let alias = alias.to_string();
                if !self.state.aliased_tables.contains(&alias) {
                    self.state.aliased_tables.push(alias);
                }
            }
        }
    }

    /// Registers a bind and returns its (deduplicated) name.
    fn bind(&mut self, key: &str, value: Value) -> String {
        let base = bind_name(key);
        let exists = |name: &str, binds: &[(String, Bind)]| binds.iter().any(|(n, _)| n == name);

        let mut name = base.clone();
        let mut counter = 0usize;
        while exists(&name, &self.state.binds) {
            name = format!("{}{}", base, counter);
            counter += 1;
        }

        let bind = if self.state.protect { Bind::escaped(value) } else { Bind::raw(value) };
        self.state.binds.push((name.clone(), bind));
        name
    }

    fn condition(&mut self, key: &str, value: Value) -> Result<String, Error> {
        let (column, op) = split_operator(key)?;
        let column_sql = self.protect_column(&column);

        if value.is_null() {
            let null_op = match op.as_str() {
                "!=" | "<>" | "IS NOT" => "IS NOT NULL",
                _ => "IS NULL",
            };
            return Ok(format!("{} {}", column_sql, null_op));
        }

        let value = match (op.as_str(), value) {
            ("IN" | "NOT IN", Value::List(items)) => Value::List(items),
            ("IN" | "NOT IN", single) => Value::List(vec![single]),
            (_, other) => other,
        };
        let name = self.bind(&column, value);
        Ok(format!("{} {} :{}:", column_sql, op, name))
    }

    /// Quoting and escaping for the clauses added after this call.
    pub fn protect(&mut self, protect: bool) -> &mut Self {
        self.state.protect = protect;
        self
    }

    // ========================================================================
    // SELECT / FROM / JOIN
    // ========================================================================

    /// Adds columns, comma separated. Function calls are left unquoted.
    pub fn select(&mut self, columns: &str) -> &mut Self {
        for item in split_top_level(columns) {
            let protected = self.protect_column(&item);
            self.state.select.push(protected);
        }
        self
    }

    fn select_aggregate(&mut self, function: &str, column: &str, alias: Option<&str>) -> &mut Self {
        let alias = alias.map(str::to_string).unwrap_or_else(|| column.rsplit('.').next().unwrap_or(column).to_string());
        let alias = if self.state.protect { escape_identifiers(self.dialect(), &alias) } else { alias };
        let item = format!("{}({}) AS {}", function, self.protect_column(column), alias);
        self.state.select.push(item);
        self
    }

    pub fn select_max(&mut self, column: &str, alias: Option<&str>) -> &mut Self {
        self.select_aggregate("MAX", column, alias)
    }

    pub fn select_min(&mut self, column: &str, alias: Option<&str>) -> &mut Self {
        self.select_aggregate("MIN", column, alias)
    }

    pub fn select_avg(&mut self, column: &str, alias: Option<&str>) -> &mut Self {
        self.select_aggregate("AVG", column, alias)
    }

    pub fn select_sum(&mut self, column: &str, alias: Option<&str>) -> &mut Self {
        self.select_aggregate("SUM", column, alias)
    }

    pub fn select_count(&mut self, column: &str, alias: Option<&str>) -> &mut Self {
        self.select_aggregate("COUNT", column, alias)
    }

    pub fn distinct(&mut self, distinct: bool) -> &mut Self {
        self.state.distinct = distinct;
        self
    }

    /// Adds tables to FROM, comma separated, with optional aliases.
    pub fn from(&mut self, tables: &str) -> &mut Self {
        for table in split_top_level(tables) {
            self.track_alias(&table);
            let protected = self.protect_table(&table);
            if !self.state.from.contains(&protected) {
                self.state.from.push(protected);
            }
        }
        self
    }

    /// Joins a table. Both sides of every comparison in `condition` are protected.
    ///
    /// # Arguments
    ///
    /// * `table` - Table with optional alias (`"posts p"`)
    /// * `condition` - e.g. `"p.user_id = u.id AND p.published = 1"`
    /// * `join_type` - Join flavour
    pub fn join(&mut self, table: &str, condition: &str, join_type: JoinType) -> &mut Self {
        if join_type == JoinType::FullOuter && !self.dialect().supports_full_outer_join() {
            self.defer(Error::InvalidArgument(format!("{} does not support FULL OUTER JOIN.", self.conn.driver())));
            return self;
        }

        self.track_alias(table);
        let table_sql = self.protect_table(table);

        match self.compile_join_condition(condition) {
            Ok(on) => {
                let sql = format!("{}JOIN {} ON {}", join_type.keyword(), table_sql, on);
                self.state.joins.push(sql);
            }
            Err(err) => self.defer(err),
        }
        self
    }

    fn compile_join_condition(&self, condition: &str) -> Result<String, Error> {
        if !self.state.protect {
            return Ok(condition.to_string());
        }

        let connectives = cached_regex(&JOIN_CONNECTIVE, r"(?i)\s+(AND|OR)\s+")?;
        let comparison = cached_regex(&JOIN_COMPARISON, r"^\s*(.+?)\s*(<=|>=|<>|!=|=|<|>)\s*(.+?)\s*$")?;

        let mut sql = String::new();
        let mut cursor = 0;
        let mut parts: Vec<(String, Option<String>)> = Vec::new();
        for m in connectives.find_iter(condition) {
            parts.push((condition[cursor..m.start()].to_string(), Some(m.as_str().trim().to_ascii_uppercase())));
            cursor = m.end();
        }
        parts.push((condition[cursor..].to_string(), None));

        for (part, connective) in parts {
            match comparison.captures(&part) {
                Some(c) => {
                    sql.push_str(&format!("{} {} {}", self.protect_column(&c[1]), &c[2], self.protect_column(&c[3])));
                }
                None => sql.push_str(part.trim()),
            }
            if let Some(connective) = connective {
                sql.push(' ');
                sql.push_str(&connective);
                sql.push(' ');
            }
        }
        Ok(sql)
    }

    // ========================================================================
    // WHERE / HAVING
    // ========================================================================

    fn push_where(&mut self, connective: Connective, key: &str, value: Value) -> &mut Self {
        match self.condition(key, value) {
            Ok(sql) => self.state.wheres.push(Predicate::Condition(connective, sql)),
            Err(err) => self.defer(err),
        }
        self
    }

    /// `AND key <op> value`. The operator may trail the key (`"age >="`).
    pub fn where_(&mut self, key: &str, value: impl Into<Value>) -> &mut Self {
        self.push_where(Connective::And, key, value.into())
    }

    pub fn or_where(&mut self, key: &str, value: impl Into<Value>) -> &mut Self {
        self.push_where(Connective::Or, key, value.into())
    }

    /// Adds a literal condition, not escaped.
    pub fn where_raw(&mut self, condition: &str) -> &mut Self {
        self.state.wheres.push(Predicate::Condition(Connective::And, condition.to_string()));
        self
    }

    pub fn or_where_raw(&mut self, condition: &str) -> &mut Self {
        self.state.wheres.push(Predicate::Condition(Connective::Or, condition.to_string()));
        self
    }

    fn push_where_in<I, V>(&mut self, connective: Connective, key: &str, values: I, negate: bool) -> &mut Self
    where
        I: IntoIterator<Item = V>,
        V: Into<Value>,
    {
        let values: Vec<Value> = values.into_iter().map(Into::into).collect();
        if values.is_empty() {
            self.defer(Error::InvalidArgument(format!("where_in on '{}' needs at least one value.", key)));
            return self;
        }
        let op = if negate { "NOT IN" } else { "IN" };
        self.push_where(connective, &format!("{} {}", key.trim(), op), Value::List(values))
    }

    pub fn where_in<I, V>(&mut self, key: &str, values: I) -> &mut Self
    where
        I: IntoIterator<Item = V>,
        V: Into<Value>,
    {
        self.push_where_in(Connective::And, key, values, false)
    }

    pub fn or_where_in<I, V>(&mut self, key: &str, values: I) -> &mut Self
    where
        I: IntoIterator<Item = V>,
        V: Into<Value>,
    {
        self.push_where_in(Connective::Or, key, values, false)
    }

    pub fn where_not_in<I, V>(&mut self, key: &str, values: I) -> &mut Self
    where
        I: IntoIterator<Item = V>,
        V: Into<Value>,
    {
        self.push_where_in(Connective::And, key, values, true)
    }

    pub fn or_where_not_in<I, V>(&mut self, key: &str, values: I) -> &mut Self
    where
        I: IntoIterator<Item = V>,
        V: Into<Value>,
    {
        self.push_where_in(Connective::Or, key, values, true)
    }

    fn push_like(
        &mut self,
        connective: Connective,
        field: &str,
        value: &str,
        side: LikeSide,
        negate: bool,
        insensitive: bool,
    ) -> &mut Self {
        let dialect = self.dialect();
        let column = self.protect_column(field);

        let (lhs, op, value) = if insensitive {
            let (lhs, op) = dialect.case_insensitive_like(&column, negate);
            let value = if op.contains("ILIKE") { value.to_string() } else { value.to_lowercase() };
            (lhs, op, value)
        } else {
            (column, if negate { "NOT LIKE" } else { "LIKE" }, value.to_string())
        };

        let body = if self.state.protect { escape_string(dialect, &value, true) } else { value };
        let pattern = match side {
            LikeSide::Before => format!("%{}", body),
            LikeSide::After => format!("{}%", body),
            LikeSide::Both => format!("%{}%", body),
            LikeSide::None => body,
        };

        let name = self.bind(field, Value::Raw(format!("'{}'", pattern)));

        let sql = format!("{} {} :{}:{}", lhs, op, name, like_escape_clause(dialect));
        self.state.wheres.push(Predicate::Condition(connective, sql));
        self
    }

    pub fn like(&mut self, field: &str, value: &str, side: LikeSide) -> &mut Self {
        self.push_like(Connective::And, field, value, side, false, false)
    }

    pub fn or_like(&mut self, field: &str, value: &str, side: LikeSide) -> &mut Self {
        self.push_like(Connective::Or, field, value, side, false, false)
    }

    pub fn not_like(&mut self, field: &str, value: &str, side: LikeSide) -> &mut Self {
        self.push_like(Connective::And, field, value, side, true, false)
    }

    pub fn or_not_like(&mut self, field: &str, value: &str, side: LikeSide) -> &mut Self {
        self.push_like(Connective::Or, field, value, side, true, false)
    }

    /// Case-insensitive LIKE (`ILIKE` on Postgre, `LOWER()` elsewhere).
    pub fn ilike(&mut self, field: &str, value: &str, side: LikeSide) -> &mut Self {
        self.push_like(Connective::And, field, value, side, false, true)
    }

    pub fn or_ilike(&mut self, field: &str, value: &str, side: LikeSide) -> &mut Self {
        self.push_like(Connective::Or, field, value, side, false, true)
    }

    pub fn not_ilike(&mut self, field: &str, value: &str, side: LikeSide) -> &mut Self {
        self.push_like(Connective::And, field, value, side, true, true)
    }

    pub fn or_not_ilike(&mut self, field: &str, value: &str, side: LikeSide) -> &mut Self {
        self.push_like(Connective::Or, field, value, side, true, true)
    }

    pub fn group_start(&mut self) -> &mut Self {
        self.state.wheres.push(Predicate::Open(Connective::And, false));
        self
    }

    pub fn or_group_start(&mut self) -> &mut Self {
        self.state.wheres.push(Predicate::Open(Connective::Or, false));
        self
    }

    pub fn not_group_start(&mut self) -> &mut Self {
        self.state.wheres.push(Predicate::Open(Connective::And, true));
        self
    }

    pub fn or_not_group_start(&mut self) -> &mut Self {
        self.state.wheres.push(Predicate::Open(Connective::Or, true));
        self
    }

    pub fn group_end(&mut self) -> &mut Self {
        self.state.wheres.push(Predicate::Close);
        self
    }

    fn push_having(&mut self, connective: Connective, key: &str, value: Value) -> &mut Self {
        match self.condition(key, value) {
            Ok(sql) => self.state.havings.push(Predicate::Condition(connective, sql)),
            Err(err) => self.defer(err),
        }
        self
    }

    pub fn having(&mut self, key: &str, value: impl Into<Value>) -> &mut Self {
        self.push_having(Connective::And, key, value.into())
    }

    pub fn or_having(&mut self, key: &str, value: impl Into<Value>) -> &mut Self {
        self.push_having(Connective::Or, key, value.into())
    }

    // ========================================================================
    // GROUP / ORDER / LIMIT
    // ========================================================================

    pub fn group_by(&mut self, columns: &str) -> &mut Self {
        for column in split_top_level(columns) {
            let protected = self.protect_column(&column);
            self.state.group_by.push(protected);
        }
        self
    }

    /// Orders by one or more comma separated columns. A column may carry its
    /// own `ASC`/`DESC`. `Direction::Random` ignores the columns.
    pub fn order_by(&mut self, columns: &str, direction: Direction) -> &mut Self {
        if let Direction::Random(seed) = direction {
            let dialect = self.dialect();
            self.state.order_by.push(dialect.random_keyword(seed));
            self.state.seed = seed.filter(|s| dialect.seed_statement(*s).is_some());
            return self;
        }

        let default = if direction == Direction::Desc { "DESC" } else { "ASC" };
        for item in split_top_level(columns) {
            let (column, dir) = match item.rsplit_once(char::is_whitespace) {
                Some((column, dir)) if dir.eq_ignore_ascii_case("ASC") || dir.eq_ignore_ascii_case("DESC") => {
                    (column.trim().to_string(), dir.to_ascii_uppercase())
                }
                _ => (item.clone(), default.to_string()),
            };
            let protected = self.protect_column(&column);
            self.state.order_by.push(format!("{} {}", protected, dir));
        }
        self
    }

    pub fn limit(&mut self, limit: u64) -> &mut Self {
        self.state.limit = Some(limit);
        self
    }

    pub fn offset(&mut self, offset: u64) -> &mut Self {
        self.state.offset = Some(offset);
        self
    }

    // ========================================================================
    // SET
    // ========================================================================

    /// Adds a column value for the next insert, update or replace.
    pub fn set(&mut self, key: &str, value: impl Into<Value>) -> &mut Self {
        let value = value.into();
        let column = self.protect_column(key);
        self.state.set_fields.push((key.to_string(), value.clone()));
        let name = self.bind(key, value);
        self.state.sets.push((column, format!(":{}:", name)));
        self
    }

    /// Adds every pair of `data`, see [`Builder::set`].
    pub fn set_data(&mut self, data: impl IntoFields) -> &mut Self {
        for (key, value) in data.into_fields() {
            self.set(&key, value);
        }
        self
    }

    /// Makes inserts skip rows that violate a unique constraint.
    pub fn ignore(&mut self, ignore: bool) -> &mut Self {
        self.state.ignore = ignore;
        self
    }

    // ========================================================================
    // Compilation
    // ========================================================================

    fn write_table(&self) -> Result<String, Error> {
        if self.table.is_empty() {
            return Err(Error::invalid_argument("A table name is required for that operation."));
        }
        Ok(self.protect_table(&self.table))
    }

    fn check_error(&mut self) -> Result<(), Error> {
        if let Some(message) = self.state.error.take() {
            self.reset_query();
            return Err(Error::InvalidArgument(message));
        }
        Ok(())
    }

    fn compile_where(&self) -> String {
        if self.state.wheres.is_empty() {
            return String::new();
        }
        format!(" WHERE {}", compile_predicates(&self.state.wheres))
    }

    fn compile_select(&self, select_override: Option<&str>, for_count: bool) -> String {
        let mut sql = String::from(if self.state.distinct { "SELECT DISTINCT " } else { "SELECT " });

        match select_override {
            Some(select) => sql.push_str(select),
            None if self.state.select.is_empty() => sql.push('*'),
            None => sql.push_str(&self.state.select.join(", ")),
        }

        if !self.state.from.is_empty() {
            sql.push_str(" FROM ");
            sql.push_str(&self.state.from.join(", "));
        }
        for join in &self.state.joins {
            sql.push(' ');
            sql.push_str(join);
        }

        sql.push_str(&self.compile_where());

        if !self.state.group_by.is_empty() {
            sql.push_str(" GROUP BY ");
            sql.push_str(&self.state.group_by.join(", "));
        }
        if !self.state.havings.is_empty() {
            sql.push_str(" HAVING ");
            sql.push_str(&compile_predicates(&self.state.havings));
        }

        if !for_count {
            if !self.state.order_by.is_empty() {
                sql.push_str(" ORDER BY ");
                sql.push_str(&self.state.order_by.join(", "));
            }
            sql.push_str(&self.dialect().compile_limit(self.state.limit, self.state.offset));
        }
        sql
    }

    fn compile_insert(&self, verb: &str) -> Result<String, Error> {
        let table = self.write_table()?;
        if self.state.sets.is_empty() {
            return Err(Error::invalid_argument("You must use the \"set\" method to insert an entry."));
        }
        let columns: Vec<&str> = self.state.sets.iter().map(|(c, _)| c.as_str()).collect();
        let values: Vec<&str> = self.state.sets.iter().map(|(_, v)| v.as_str()).collect();
        Ok(self.insert_statement(verb, &table, &columns.join(", "), &format!("({})", values.join(", "))))
    }

    fn insert_statement(&self, verb: &str, table: &str, columns: &str, values: &str) -> String {
        let sql = format!("{} INTO {} ({}) VALUES {}", verb, table, columns, values);
        if !self.state.ignore || verb != "INSERT" {
            return sql;
        }
        match self.dialect().insert_ignore() {
            IgnoreStyle::Prefix(prefix) => format!("{}{}", prefix, &sql["INSERT".len()..]),
            IgnoreStyle::Suffix(suffix) => format!("{}{}", sql, suffix),
        }
    }

    /// LIMIT (and ORDER BY) for UPDATE/DELETE where the dialect allows it.
    fn compile_write_limit(&self) -> String {
        let Some(limit) = self.state.limit else {
            return String::new();
        };
        if !self.dialect().limit_on_write() {
            log::warn!("{} ignores LIMIT on UPDATE and DELETE", self.conn.driver());
            return String::new();
        }
        let mut sql = String::new();
        if !self.state.order_by.is_empty() {
            sql.push_str(" ORDER BY ");
            sql.push_str(&self.state.order_by.join(", "));
        }
        sql.push_str(&self.dialect().compile_limit(Some(limit), None));
        sql
    }

    fn compile_update(&self) -> Result<String, Error> {
        let table = self.write_table()?;
        if self.state.sets.is_empty() {
            return Err(Error::invalid_argument("You must use the \"set\" method to update an entry."));
        }
        let sets: Vec<String> = self.state.sets.iter().map(|(c, v)| format!("{} = {}", c, v)).collect();
        Ok(format!("UPDATE {} SET {}{}{}", table, sets.join(", "), self.compile_where(), self.compile_write_limit()))
    }

    fn compile_delete(&self) -> Result<String, Error> {
        let table = self.write_table()?;
        Ok(format!("DELETE FROM {}{}{}", table, self.compile_where(), self.compile_write_limit()))
    }

    /// Substitutes the current binds into `sql`.
    fn render(&self, sql: &str) -> Result<String, Error> {
        let query = Query::new(sql, Binds::Named(self.state.binds.clone()), self.dialect())?;
        Ok(query.get_query().to_string())
    }

    fn finish_compiled(&mut self, sql: Result<String, Error>, reset: bool) -> Result<String, Error> {
        self.check_error()?;
        let rendered = sql.and_then(|sql| self.render(&sql));
        if reset {
            self.reset_query();
        }
        rendered
    }

    /// The SELECT the builder would run, binds substituted.
    pub fn get_compiled_select(&mut self, reset: bool) -> Result<String, Error> {
        let sql = Ok(self.compile_select(None, false));
        self.finish_compiled(sql, reset)
    }

    pub fn get_compiled_insert(&mut self, reset: bool) -> Result<String, Error> {
        let sql = self.compile_insert("INSERT");
        self.finish_compiled(sql, reset)
    }

    pub fn get_compiled_update(&mut self, reset: bool) -> Result<String, Error> {
        let sql = self.compile_update();
        self.finish_compiled(sql, reset)
    }

    pub fn get_compiled_delete(&mut self, reset: bool) -> Result<String, Error> {
        let sql = self.compile_delete();
        self.finish_compiled(sql, reset)
    }

    /// Clears every clause. The table and its alias stay.
    pub fn reset_query(&mut self) -> &mut Self {
        self.state = self.initial.clone();
        self
    }

    // ========================================================================
    // Execution
    // ========================================================================

    /// Runs `sql` with the current binds, then resets.
    async fn execute(&mut self, sql: Result<String, Error>) -> Result<Outcome, Error> {
        let binds = Binds::Named(std::mem::take(&mut self.state.binds));
        self.reset_query();
        self.conn.query(&sql?, binds).await
    }

    async fn run_seed(&mut self) -> Result<(), Error> {
        if let Some(seed) = self.state.seed {
            if let Some(statement) = self.dialect().seed_statement(seed) {
                self.conn.query(&statement, ()).await?;
            }
        }
        Ok(())
    }

    /// Runs the SELECT.
    pub async fn get(&mut self) -> Result<Outcome, Error> {
        self.check_error()?;
        self.run_seed().await?;
        let sql = self.compile_select(None, false);
        self.execute(Ok(sql)).await
    }

    /// Adds the conditions, limit and offset, then runs the SELECT.
    pub async fn get_where(
        &mut self,
        conditions: impl IntoFields,
        limit: Option<u64>,
        offset: Option<u64>,
    ) -> Result<Outcome, Error> {
        for (key, value) in conditions.into_fields() {
            self.where_(&key, value);
        }
        self.state.limit = limit.or(self.state.limit);
        self.state.offset = offset.or(self.state.offset);
        self.get().await
    }

    /// Counts every row of the table, ignoring the builder's clauses.
    pub async fn count_all(&mut self) -> Result<u64, Error> {
        let table = self.write_table()?;
        let alias = escape_identifiers(self.dialect(), "numrows");
        let sql = format!("SELECT COUNT(*) AS {} FROM {}", alias, table);
        self.reset_query();
        let outcome = self.conn.query(&sql, ()).await?;
        Ok(numrows(outcome))
    }

    /// Counts the rows the current SELECT would return.
    ///
    /// With `reset` false the builder keeps its state for a following `get()`.
    pub async fn count_all_results(&mut self, reset: bool) -> Result<u64, Error> {
        self.check_error()?;
        let alias = escape_identifiers(self.dialect(), "numrows");
        let count = format!("COUNT(*) AS {}", alias);

        let sql = if self.state.distinct || !self.state.group_by.is_empty() {
            format!("SELECT {} FROM ({}) bottle_count_all_results", count, self.compile_select(None, true))
        } else {
            self.compile_select(Some(&count), true)
        };

        let binds = Binds::Named(self.state.binds.clone());
        if reset {
            self.reset_query();
        }
        let outcome = self.conn.query(&sql, binds).await?;
        Ok(numrows(outcome))
    }

    /// Inserts one row from `data` plus any values given with `set`.
    pub async fn insert(&mut self, data: impl IntoFields) -> Result<Outcome, Error> {
        self.check_error()?;
        self.set_data(data);
        let sql = self.compile_insert("INSERT");
        self.execute(sql).await
    }

    /// Inserts rows in chunks of `batch_size`, one statement per chunk.
    ///
    /// Every row must have the keys of the first row. Returns the total
    /// number of affected rows.
    pub async fn insert_batch<T: IntoFields>(&mut self, rows: Vec<T>, batch_size: usize) -> Result<u64, Error> {
        self.check_error()?;
        let table = self.write_table();
        let rows: Vec<Vec<(String, Value)>> = rows.into_iter().map(IntoFields::into_fields).collect();
        let statements = table.and_then(|table| self.compile_batch(&table, &rows, batch_size));
        self.reset_query();

        let mut total = 0;
        for sql in statements? {
            if let Outcome::Write(ack) = self.conn.query(&sql, ()).await? {
                total += ack.affected_rows;
            }
        }
        Ok(total)
    }

    fn compile_batch(&self, table: &str, rows: &[Vec<(String, Value)>], batch_size: usize) -> Result<Vec<String>, Error> {
        let first = rows.first().ok_or_else(|| Error::invalid_argument("insert_batch needs at least one row."))?;
        let keys: Vec<&str> = first.iter().map(|(k, _)| k.as_str()).collect();
        let columns: Vec<String> = keys.iter().map(|k| self.protect_column(k)).collect();
        let dialect = self.dialect();

        let mut statements = Vec::new();
        for chunk in rows.chunks(batch_size.max(1)) {
            let mut tuples = Vec::with_capacity(chunk.len());
            for row in chunk {
                if row.len() != keys.len() {
                    return Err(Error::invalid_argument("insert_batch rows must all have the same keys."));
                }
                let mut values = Vec::with_capacity(keys.len());
                for key in &keys {
                    let value = row
                        .iter()
                        .find(|(k, _)| k == key)
                        .map(|(_, v)| v)
                        .ok_or_else(|| Error::invalid_argument("insert_batch rows must all have the same keys."))?;
                    values.push(if self.state.protect {
                        escape_value(dialect, value)?
                    } else {
                        value.as_text().unwrap_or_else(|| "NULL".to_string())
                    });
                }
                tuples.push(format!("({})", values.join(", ")));
            }
            statements.push(self.insert_statement("INSERT", table, &columns.join(", "), &tuples.join(", ")));
        }
        Ok(statements)
    }

    /// Updates the rows matching the current WHERE state.
    pub async fn update(&mut self, data: impl IntoFields) -> Result<Outcome, Error> {
        self.check_error()?;
        self.set_data(data);
        let sql = self.compile_update();
        self.execute(sql).await
    }

    /// Adds `conditions` to the WHERE state, then updates.
    pub async fn update_where(&mut self, data: impl IntoFields, conditions: impl IntoFields) -> Result<Outcome, Error> {
        for (key, value) in conditions.into_fields() {
            self.where_(&key, value);
        }
        self.update(data).await
    }

    /// REPLACE INTO where the driver has it.
    ///
    /// Otherwise the pending `set` values come first, then `data`, and the
    /// first pair is the match key: an existing row with that value is
    /// updated with the remaining pairs, else every pair is inserted. A
    /// failed existence check is returned without writing. Unique constraints spanning several columns are not
    /// considered.
    pub async fn replace(&mut self, data: impl IntoFields) -> Result<Outcome, Error> {
        self.check_error()?;
        let data_fields = data.into_fields();

        if self.dialect().supports_replace() {
            self.set_data(data_fields);
            let sql = self.compile_insert("REPLACE");
            return self.execute(sql).await;
        }

        let mut fields = std::mem::take(&mut self.state.set_fields);
        fields.extend(data_fields);
        // The pending SET values now live in `fields`; the write below sets them again.
        self.reset_query();
        let Some((key, value)) = fields.first().cloned() else {
            return Err(Error::invalid_argument("You must use the \"set\" method to update an entry."));
        };

        let table = self.write_table()?;
        let name = bind_name(&key);
        let exists_sql = format!("SELECT 1 FROM {} WHERE {} = :{}:", table, self.protect_column(&key), name);
        let exists = match self.conn.query(&exists_sql, Binds::named([(name, value.clone())])).await? {
            Outcome::Rows(rows) => rows.get_num_rows() > 0,
            Outcome::Write(_) | Outcome::Pretend(_) => false,
            failed @ Outcome::Failed(_) => return Ok(failed),
        };

        if !exists {
            return self.insert(fields).await;
        }

        let rest: Vec<(String, Value)> = fields.into_iter().skip(1).collect();
        if rest.is_empty() {
            return Ok(Outcome::Write(WriteAck { affected_rows: 0, insert_id: None }));
        }
        self.where_(&key, value);
        self.update(rest).await
    }

    /// `column = column + amount` on the rows matching the WHERE state.
    pub async fn increment(&mut self, column: &str, amount: i64) -> Result<Outcome, Error> {
        self.step(column, '+', amount).await
    }

    /// `column = column - amount` on the rows matching the WHERE state.
    pub async fn decrement(&mut self, column: &str, amount: i64) -> Result<Outcome, Error> {
        self.step(column, '-', amount).await
    }

    async fn step(&mut self, column: &str, sign: char, amount: i64) -> Result<Outcome, Error> {
        self.check_error()?;
        let protected = self.protect_column(column);
        let expression = self.dialect().increment_expression(&protected, sign, amount);
        self.state.sets.push((protected, expression));
        let sql = self.compile_update();
        self.execute(sql).await
    }

    /// Deletes the rows matching the WHERE state.
    ///
    /// Without any condition the delete is refused: `Error::InvalidArgument`
    /// in debug mode, `Outcome::Failed` otherwise. Use `empty_table` to
    /// delete everything.
    pub async fn delete(&mut self) -> Result<Outcome, Error> {
        self.check_error()?;

        if self.state.wheres.is_empty() {
            let sql = self.compile_delete();
            self.reset_query();
            let message = "Deletes are not allowed unless they contain a \"where\" or \"like\" clause.";
            if self.conn.is_debug() {
                return Err(Error::invalid_argument(message));
            }
            log::error!("{}", message);
            let mut query = Query::new(sql?, (), self.dialect())?;
            query.set_error(None, message.to_string());
            return Ok(Outcome::Failed(query));
        }

        let sql = self.compile_delete();
        self.execute(sql).await
    }

    /// Adds `conditions` to the WHERE state, then deletes.
    pub async fn delete_where(&mut self, conditions: impl IntoFields) -> Result<Outcome, Error> {
        for (key, value) in conditions.into_fields() {
            self.where_(&key, value);
        }
        self.delete().await
    }

    /// `DELETE FROM table` without conditions.
    pub async fn empty_table(&mut self) -> Result<Outcome, Error> {
        let sql = self.write_table().map(|table| format!("DELETE FROM {}", table));
        self.execute(sql).await
    }

    /// Empties the table with the driver's truncate statement.
    pub async fn truncate(&mut self) -> Result<Outcome, Error> {
        let dialect = self.dialect();
        let sql = self.write_table().map(|table| dialect.truncate_statement(&table));
        self.execute(sql).await
    }
}

fn numrows(outcome: Outcome) -> u64 {
    match outcome {
        Outcome::Rows(mut rows) => rows
            .get_first_row()
            .and_then(|row| row.get_i64("numrows"))
            .and_then(|n| u64::try_from(n).ok())
            .unwrap_or(0),
        _ => 0,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        config::ConnectionConfig,
        drivers::{
            ColumnMeta, RowSet,
            mock::{MockConnector, MockLog},
        },
    };
    use rstest::rstest;

    fn config(driver: &str, prefix: &str) -> ConnectionConfig {
        ConnectionConfig {
            driver: driver.to_string(),
            hostname: "localhost".to_string(),
            database: "app".to_string(),
            prefix: prefix.to_string(),
            ..ConnectionConfig::default()
        }
    }

    fn connection(driver: &str) -> Connection {
        Connection::new(config(driver, "")).unwrap()
    }

    fn mocked(driver: &str, log: &MockLog, rows: RowSet) -> Connection {
        let mut connector = MockConnector::new(log.clone());
        connector.rows = rows;
        Connection::with_connector(config(driver, ""), Box::new(connector)).unwrap()
    }

    #[rstest]
    #[case("age >=", ("age", ">="))]
    #[case("name !=", ("name", "!="))]
    #[case("id in", ("id", "IN"))]
    #[case("x IS NOT", ("x", "IS NOT"))]
    #[case("title not like", ("title", "NOT LIKE"))]
    #[case("login", ("login", "="))]
    #[case("u.id", ("u.id", "="))]
    fn operators_are_split_from_keys(#[case] key: &str, #[case] expected: (&str, &str)) {
        let (column, op) = split_operator(key).unwrap();
        assert_eq!((column.as_str(), op.as_str()), expected);
    }

    #[test]
    fn select_with_operators_and_null() {
        let mut conn = connection("postgre");
        let sql = conn
            .table("users")
            .unwrap()
            .select("id, name")
            .where_("age >=", 18)
            .where_("deleted_at", Value::Null)
            .or_where("name !=", "bob")
            .get_compiled_select(true)
            .unwrap();
        assert_eq!(
            sql,
            "SELECT \"id\", \"name\" FROM \"users\" WHERE \"age\" >= 18 AND \"deleted_at\" IS NULL OR \"name\" != 'bob'"
        );
    }

    #[test]
    fn where_in_and_groups() {
        let mut conn = connection("mysqli");
        let sql = conn
            .table("posts")
            .unwrap()
            .where_in("id", [1, 2, 3])
            .or_group_start()
            .where_("author", "ada")
            .where_not_in("state", ["draft"])
            .group_end()
            .not_group_start()
            .where_("hidden", true)
            .group_end()
            .get_compiled_select(true)
            .unwrap();
        assert_eq!(
            sql,
            "SELECT * FROM `posts` WHERE `id` IN (1,2,3) OR (`author` = 'ada' AND `state` NOT IN ('draft')) AND NOT (`hidden` = 1)"
        );
    }

    #[test]
    fn empty_where_in_is_reported_at_compile_time() {
        let mut conn = connection("mysqli");
        let mut builder = conn.table("posts").unwrap();
        builder.where_in("id", Vec::<i64>::new());
        assert!(matches!(builder.get_compiled_select(true), Err(Error::InvalidArgument(_))));
        assert_eq!(builder.get_compiled_select(true).unwrap(), "SELECT * FROM `posts`");
    }

    #[rstest]
    #[case("mysqli", LikeSide::Both, false, "`title` LIKE '%50\\%%' ESCAPE '\\\\'")]
    #[case("postgre", LikeSide::After, false, "\"title\" LIKE '50!%%' ESCAPE '!'")]
    #[case("postgre", LikeSide::Before, true, "\"title\" ILIKE '%50!%' ESCAPE '!'")]
    #[case("sqlite3", LikeSide::None, true, "LOWER(\"title\") LIKE '50!%' ESCAPE '!'")]
    fn like_patterns(#[case] driver: &str, #[case] side: LikeSide, #[case] insensitive: bool, #[case] expected: &str) {
        let mut conn = connection(driver);
        let mut builder = conn.table("t").unwrap();
        if insensitive {
            builder.ilike("title", "50%", side);
        } else {
            builder.like("title", "50%", side);
        }
        let sql = builder.get_compiled_select(true).unwrap();
        assert_eq!(sql.split(" WHERE ").nth(1), Some(expected));
    }

    #[test]
    fn insensitive_like_lowers_the_value_without_ilike() {
        let mut conn = connection("mysqli");
        let sql = conn.table("t").unwrap().not_ilike("name", "AdA", LikeSide::Both).get_compiled_select(true).unwrap();
        assert!(sql.ends_with("LOWER(`name`) NOT LIKE '%ada%' ESCAPE '\\\\'"));
    }

    #[test]
    fn joins_prefix_tables_and_respect_aliases() {
        let mut conn = Connection::new(config("postgre", "app_")).unwrap();
        let sql = conn
            .table("users u")
            .unwrap()
            .join("posts p", "p.user_id = u.id AND p.published = 1", JoinType::Left)
            .select("u.name, p.title")
            .where_("u.id", 3)
            .get_compiled_select(true)
            .unwrap();
        assert_eq!(
            sql,
            "SELECT \"u\".\"name\", \"p\".\"title\" FROM \"app_users\" \"u\" \
             LEFT JOIN \"app_posts\" \"p\" ON \"p\".\"user_id\" = \"u\".\"id\" AND \"p\".\"published\" = 1 \
             WHERE \"u\".\"id\" = 3"
        );
    }

    #[test]
    fn full_outer_join_needs_driver_support() {
        let mut conn = connection("mysqli");
        let mut builder = conn.table("a").unwrap();
        builder.join("b", "b.id = a.id", JoinType::FullOuter);
        assert!(matches!(builder.get_compiled_select(true), Err(Error::InvalidArgument(_))));

        let mut pg = connection("postgre");
        let sql = pg.table("a").unwrap().join("b", "b.id = a.id", JoinType::FullOuter).get_compiled_select(true).unwrap();
        assert_eq!(sql, "SELECT * FROM \"a\" FULL OUTER JOIN \"b\" ON \"b\".\"id\" = \"a\".\"id\"");
    }

    #[test]
    fn aggregates_group_having_order_limit() {
        let mut conn = connection("mysqli");
        let sql = conn
            .table("orders")
            .unwrap()
            .select("customer_id")
            .select_sum("total", Some("spent"))
            .select_max("orders.created_at", None)
            .group_by("customer_id")
            .having("SUM(total) >", 100)
            .order_by("spent desc, customer_id", Direction::Asc)
            .limit(10)
            .offset(20)
            .get_compiled_select(true)
            .unwrap();
        assert_eq!(
            sql,
            "SELECT `customer_id`, SUM(`total`) AS `spent`, MAX(`orders`.`created_at`) AS `created_at` FROM `orders` \
             GROUP BY `customer_id` HAVING SUM(total) > 100 ORDER BY `spent` DESC, `customer_id` ASC LIMIT 20, 10"
        );
    }

    #[rstest]
    #[case("mysqli", "SELECT * FROM `t` ORDER BY RAND(5) LIMIT 3")]
    #[case("sqlite3", "SELECT * FROM \"t\" ORDER BY RANDOM() LIMIT 3")]
    fn random_order(#[case] driver: &str, #[case] expected: &str) {
        let mut conn = connection(driver);
        let sql = conn.table("t").unwrap().order_by("", Direction::Random(Some(5))).limit(3).get_compiled_select(true).unwrap();
        assert_eq!(sql, expected);
    }

    #[tokio::test]
    async fn seeded_random_order_seeds_the_session_first() {
        let log = MockLog::default();
        let mut conn = mocked("postgre", &log, RowSet::default());
        conn.table("t").unwrap().order_by("", Direction::Random(Some(42))).get().await.unwrap();
        assert_eq!(log.statements(), vec!["SET SEED 0.42", "SELECT * FROM \"t\" ORDER BY RANDOM()"]);
    }

    #[test]
    fn repeated_bind_names_are_numbered() {
        let mut conn = connection("postgre");
        let mut builder = conn.table("t").unwrap();
        builder.where_("id", 1).or_where("id", 2).or_where("id", 3);
        let sql = builder.get_compiled_select(false).unwrap();
        assert_eq!(sql, "SELECT * FROM \"t\" WHERE \"id\" = 1 OR \"id\" = 2 OR \"id\" = 3");
        let names: Vec<&str> = builder.state.binds.iter().map(|(n, _)| n.as_str()).collect();
        assert_eq!(names, vec!["id", "id0", "id1"]);
    }

    #[tokio::test]
    async fn pretend_mode_keeps_the_template() {
        let mut conn = connection("postgre");
        conn.pretend(true);
        let outcome = conn.table("users").unwrap().insert([("name", "Ada"), ("email", "ada@example.com")]).await.unwrap();
        let query = outcome.query().unwrap();
        assert_eq!(query.get_original_query(), "INSERT INTO \"users\" (\"name\", \"email\") VALUES (:name:, :email:)");
        assert_eq!(query.get_query(), "INSERT INTO \"users\" (\"name\", \"email\") VALUES ('Ada', 'ada@example.com')");
    }

    #[rstest]
    #[case("postgre", "INSERT INTO \"users\" (\"name\", \"age\") VALUES ('Ada', 36) ON CONFLICT DO NOTHING")]
    #[case("sqlite3", "INSERT OR IGNORE INTO \"users\" (\"name\", \"age\") VALUES ('Ada', 36)")]
    #[case("mysqli", "INSERT IGNORE INTO `users` (`name`, `age`) VALUES ('Ada', 36)")]
    fn insert_ignore_per_driver(#[case] driver: &str, #[case] expected: &str) {
        let mut conn = connection(driver);
        let sql = conn
            .table("users")
            .unwrap()
            .ignore(true)
            .set("name", "Ada")
            .set("age", 36)
            .get_compiled_insert(true)
            .unwrap();
        assert_eq!(sql, expected);
    }

    #[test]
    fn update_uses_where_state() {
        let mut conn = connection("postgre");
        let mut builder = conn.table("users").unwrap();
        assert!(matches!(builder.get_compiled_update(true), Err(Error::InvalidArgument(_))));

        let sql = builder.set("name", "x").where_("id", 1).get_compiled_update(true).unwrap();
        assert_eq!(sql, "UPDATE \"users\" SET \"name\" = 'x' WHERE \"id\" = 1");
    }

    #[test]
    fn write_limits_follow_the_driver() {
        let mut my = connection("mysqli");
        let sql = my.table("t").unwrap().where_("a", 1).order_by("id", Direction::Desc).limit(5).get_compiled_delete(true).unwrap();
        assert_eq!(sql, "DELETE FROM `t` WHERE `a` = 1 ORDER BY `id` DESC LIMIT 5");

        let mut pg = connection("postgre");
        let sql = pg.table("t").unwrap().where_("a", 1).limit(5).get_compiled_delete(true).unwrap();
        assert_eq!(sql, "DELETE FROM \"t\" WHERE \"a\" = 1");
    }

    #[tokio::test]
    async fn increment_casts_on_postgre() {
        let log = MockLog::default();
        let mut conn = mocked("postgre", &log, RowSet::default());
        conn.table("posts").unwrap().where_("id", 1).increment("hits", 2).await.unwrap();
        conn.table("posts").unwrap().where_("id", 1).decrement("hits", 1).await.unwrap();
        assert_eq!(
            log.statements(),
            vec![
                "UPDATE \"posts\" SET \"hits\" = to_number(\"hits\", '9999999') + 2 WHERE \"id\" = 1",
                "UPDATE \"posts\" SET \"hits\" = to_number(\"hits\", '9999999') - 1 WHERE \"id\" = 1",
            ]
        );
    }

    #[tokio::test]
    async fn delete_without_where_is_refused() {
        let log = MockLog::default();
        let mut conn = mocked("mysqli", &log, RowSet::default());
        assert!(matches!(conn.table("t").unwrap().delete().await, Err(Error::InvalidArgument(_))));

        let mut quiet = Connection::with_connector(
            ConnectionConfig { db_debug: false, ..config("mysqli", "") },
            Box::new(MockConnector::new(log.clone())),
        )
        .unwrap();
        let outcome = quiet.table("t").unwrap().delete().await.unwrap();
        assert!(matches!(outcome, Outcome::Failed(_)));
        assert!(log.statements().is_empty());

        quiet.table("t").unwrap().delete_where([("id", 4)]).await.unwrap();
        quiet.table("t").unwrap().empty_table().await.unwrap();
        assert_eq!(log.statements(), vec!["DELETE FROM `t` WHERE `id` = 4", "DELETE FROM `t` WHERE 1=1"]);
    }

    #[tokio::test]
    async fn replace_emulation_anchors_on_the_first_key() {
        let log = MockLog::default();
        let existing = RowSet {
            columns: vec![ColumnMeta::new("?column?", "INT4")],
            rows: vec![vec![Value::Int(1)]],
        };
        let mut conn = mocked("postgre", &log, existing);
        conn.table("users").unwrap().replace([("email", "a@b.c"), ("name", "Ada")]).await.unwrap();
        assert_eq!(
            log.statements(),
            vec![
                "SELECT 1 FROM \"users\" WHERE \"email\" = 'a@b.c'",
                "UPDATE \"users\" SET \"name\" = 'Ada' WHERE \"email\" = 'a@b.c'",
            ]
        );

        let log = MockLog::default();
        let mut conn = mocked("postgre", &log, RowSet::default());
        conn.table("users").unwrap().replace([("email", "a@b.c"), ("name", "Ada")]).await.unwrap();
        assert_eq!(log.statements()[1], "INSERT INTO \"users\" (\"email\", \"name\") VALUES ('a@b.c', 'Ada')");

        let mut my = connection("mysqli");
        my.pretend(true);
        let outcome = my.table("users").unwrap().replace([("id", 1)]).await.unwrap();
        assert_eq!(outcome.query().unwrap().get_query(), "REPLACE INTO `users` (`id`) VALUES (1)");
    }

    #[tokio::test]
    async fn replace_emulation_keeps_pending_sets() {
        let log = MockLog::default();
        let mut conn = mocked("postgre", &log, RowSet::default());
        conn.table("users").unwrap().set("name", "Ada").replace([("email", "a@b.c")]).await.unwrap();
        assert_eq!(
            log.statements(),
            vec![
                "SELECT 1 FROM \"users\" WHERE \"name\" = 'Ada'",
                "INSERT INTO \"users\" (\"name\", \"email\") VALUES ('Ada', 'a@b.c')",
            ]
        );

        let log = MockLog::default();
        let existing = RowSet {
            columns: vec![ColumnMeta::new("?column?", "INT4")],
            rows: vec![vec![Value::Int(1)]],
        };
        let mut conn = mocked("postgre", &log, existing);
        conn.table("users").unwrap().set("email", "a@b.c").replace([("name", "Ada")]).await.unwrap();
        assert_eq!(log.statements()[1], "UPDATE \"users\" SET \"name\" = 'Ada' WHERE \"email\" = 'a@b.c'");

        let mut my = connection("mysqli");
        my.pretend(true);
        let outcome = my.table("users").unwrap().set("name", "Ada").replace([("id", 1)]).await.unwrap();
        assert_eq!(outcome.query().unwrap().get_query(), "REPLACE INTO `users` (`name`, `id`) VALUES ('Ada', 1)");
    }

    #[tokio::test]
    async fn replace_emulation_stops_when_the_lookup_fails() {
        let log = MockLog::default();
        let mut connector = MockConnector::new(log.clone());
        connector.failing_sql = Some("SELECT 1".to_string());
        let quiet = ConnectionConfig { db_debug: false, ..config("postgre", "") };
        let mut conn = Connection::with_connector(quiet, Box::new(connector)).unwrap();

        let outcome = conn.table("users").unwrap().replace([("email", "a@b.c"), ("name", "Ada")]).await.unwrap();
        assert!(matches!(outcome, Outcome::Failed(_)));
        assert_eq!(log.statements(), vec!["SELECT 1 FROM \"users\" WHERE \"email\" = 'a@b.c'"]);
    }

    #[tokio::test]
    async fn counting() {
        let log = MockLog::default();
        let rows = RowSet {
            columns: vec![ColumnMeta::new("numrows", "BIGINT")],
            rows: vec![vec![Value::Int(3)]],
        };
        let mut conn = mocked("mysqli", &log, rows);

        assert_eq!(conn.table("users").unwrap().count_all().await.unwrap(), 3);

        let mut builder = conn.table("users").unwrap();
        builder.where_("active", true).order_by("name", Direction::Asc).limit(1);
        assert_eq!(builder.count_all_results(false).await.unwrap(), 3);
        builder.distinct(true).select("team_id");
        assert_eq!(builder.count_all_results(true).await.unwrap(), 3);

        assert_eq!(
            log.statements(),
            vec![
                "SELECT COUNT(*) AS `numrows` FROM `users`",
                "SELECT COUNT(*) AS `numrows` FROM `users` WHERE `active` = 1",
                "SELECT COUNT(*) AS `numrows` FROM (SELECT DISTINCT `team_id` FROM `users` WHERE `active` = 1) bottle_count_all_results",
            ]
        );
    }

    #[tokio::test]
    async fn insert_batch_chunks_rows() {
        let log = MockLog::default();
        let mut conn = mocked("sqlite3", &log, RowSet::default());
        let rows = vec![vec![("a", 1), ("b", 2)], vec![("a", 3), ("b", 4)], vec![("b", 6), ("a", 5)]];

        let affected = conn.table("t").unwrap().insert_batch(rows, 2).await.unwrap();
        assert_eq!(affected, 2);
        assert_eq!(
            log.statements(),
            vec![
                "INSERT INTO \"t\" (\"a\", \"b\") VALUES (1, 2), (3, 4)",
                "INSERT INTO \"t\" (\"a\", \"b\") VALUES (5, 6)",
            ]
        );

        let uneven = vec![vec![("a", 1)], vec![("b", 2)]];
        assert!(matches!(conn.table("t").unwrap().insert_batch(uneven, 10).await, Err(Error::InvalidArgument(_))));
    }

    #[tokio::test]
    async fn truncate_per_driver() {
        let log = MockLog::default();
        let mut pg = mocked("postgre", &log, RowSet::default());
        pg.table("logs").unwrap().truncate().await.unwrap();
        let mut lite = mocked("sqlite3", &log, RowSet::default());
        lite.table("logs").unwrap().truncate().await.unwrap();
        assert_eq!(log.statements(), vec!["TRUNCATE \"logs\" RESTART IDENTITY", "DELETE FROM \"logs\""]);
    }

    #[test]
    fn unprotected_clauses_pass_through() {
        let mut conn = connection("postgre");
        let sql = conn
            .table("t")
            .unwrap()
            .protect(false)
            .select("COUNT(*) AS n")
            .set("hits", "hits + 1")
            .where_("id", 4)
            .get_compiled_update(true)
            .unwrap();
        assert_eq!(sql, "UPDATE \"t\" SET hits = hits + 1 WHERE id = 4");
    }

    #[test]
    fn state_resets_but_table_stays() {
        let mut conn = connection("sqlite3");
        let mut builder = conn.table("users u").unwrap();
        builder.where_("u.id", 1).limit(2);
        builder.get_compiled_select(true).unwrap();
        assert_eq!(builder.get_compiled_select(true).unwrap(), "SELECT * FROM \"users\" \"u\"");
    }

    #[tokio::test]
    async fn get_where_adds_conditions_and_limit() {
        let log = MockLog::default();
        let mut conn = mocked("sqlite3", &log, RowSet::default());
        conn.table("users").unwrap().get_where([("team", "red")], Some(5), Some(10)).await.unwrap();
        assert_eq!(log.statements(), vec!["SELECT * FROM \"users\" WHERE \"team\" = 'red' LIMIT 5 OFFSET 10"]);
    }
}
