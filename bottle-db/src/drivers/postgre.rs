//! # Postgre Driver
//!
//! PostgreSQL over `PgConnection`.
//!
//! ## Differences from the shared behavior
//!
//! - Booleans render as `TRUE`/`FALSE`
//! - No `REPLACE`; insert-ignore appends `ON CONFLICT DO NOTHING`
//! - Case-insensitive LIKE uses `ILIKE`, and `FULL OUTER` joins exist
//! - Prepared statements use `$1`, `$2`, ... placeholders
//! - `INSERT`/`UPDATE`/`DELETE ... RETURNING` produce rows
//! - Random ordering is seeded with a separate `SET SEED`
//!
//! The session gets `search_path` set to the configured schema and the client
//! encoding set to the configured charset.

use std::{collections::HashMap, str::FromStr, sync::OnceLock};

use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, NaiveDateTime, NaiveTime, Utc};
use regex::Regex;
use sqlx::{
    Column, Connection as _, Executor, Row, Statement, TypeInfo, ValueRef,
    postgres::{PgArguments, PgColumn, PgConnectOptions, PgConnection, PgRow, PgSslMode},
};
use uuid::Uuid;

use super::{
    ColumnMeta, Connector, Dialect, ExecResult, IgnoreStyle, NativeConnection, PlaceholderStyle, PreparedOutcome,
    RowSet, decode_row, group_foreign_keys, is_schema_change, native_error,
};
use crate::{
    Error,
    config::ConnectionConfig,
    database::Drivers,
    escape::{escape_identifiers, escape_string},
    forge::{AlterKind, ColumnParts, Field, ForgeRules, UnsignedRule},
    introspection::{FieldData, ForeignKeyData, IndexData, IndexType},
    query::cached_regex,
    value::Value,
    value_binding::ValueBinder,
};

// ============================================================================
// Dialect
// ============================================================================

pub struct PostgreDialect;

pub static DIALECT: PostgreDialect = PostgreDialect;

static RETURNING: OnceLock<Regex> = OnceLock::new();
static INDEX_COLUMNS: OnceLock<Regex> = OnceLock::new();

#[async_trait]
impl Dialect for PostgreDialect {
    fn driver(&self) -> Drivers {
        Drivers::Postgres
    }

    fn bool_literal(&self, value: bool) -> &'static str {
        if value { "TRUE" } else { "FALSE" }
    }

    fn random_keyword(&self, _seed: Option<u32>) -> String {
        "RANDOM()".to_string()
    }

    fn seed_statement(&self, seed: u32) -> Option<String> {
        Some(format!("SET SEED 0.{}", seed))
    }

    fn compile_limit(&self, limit: Option<u64>, offset: Option<u64>) -> String {
        let mut sql = String::new();
        if let Some(limit) = limit {
            sql.push_str(&format!(" LIMIT {}", limit));
        }
        if let Some(offset) = offset.filter(|o| *o > 0) {
            sql.push_str(&format!(" OFFSET {}", offset));
        }
        sql
    }

    fn limit_on_write(&self) -> bool {
        false
    }

    fn increment_expression(&self, column: &str, sign: char, amount: i64) -> String {
        format!("to_number({}, '9999999') {} {}", column, sign, amount)
    }

    fn supports_replace(&self) -> bool {
        false
    }

    fn insert_ignore(&self) -> IgnoreStyle {
        IgnoreStyle::Suffix(" ON CONFLICT DO NOTHING")
    }

    fn truncate_statement(&self, table: &str) -> String {
        format!("TRUNCATE {} RESTART IDENTITY", table)
    }

    fn supports_full_outer_join(&self) -> bool {
        true
    }

    fn case_insensitive_like(&self, column: &str, negate: bool) -> (String, &'static str) {
        (column.to_string(), if negate { "NOT ILIKE" } else { "ILIKE" })
    }

    fn placeholder_style(&self) -> PlaceholderStyle {
        PlaceholderStyle::Dollar
    }

    fn classify_write(&self, sql: &str, generic: bool) -> bool {
        if !generic {
            return false;
        }
        match cached_regex(&RETURNING, r#"(?is)^\s*"?(INSERT|UPDATE|DELETE)\b.*\sRETURNING\s"#) {
            Ok(re) => !re.is_match(sql),
            Err(_) => generic,
        }
    }

    async fn version(&self, conn: &mut dyn NativeConnection) -> Result<String, Error> {
        let rows = conn.fetch("SHOW server_version").await?;
        Ok(rows.first_column().into_iter().next().unwrap_or_default())
    }

    fn list_tables_sql(&self, prefix: Option<&str>) -> String {
        let mut sql = String::from(
            "SELECT \"table_name\" FROM \"information_schema\".\"tables\" WHERE \"table_schema\" = current_schema()",
        );
        if let Some(prefix) = prefix {
            sql.push_str(&format!(" AND \"table_name\" LIKE '{}%' ESCAPE '!'", escape_string(self, prefix, true)));
        }
        sql
    }

    fn list_columns_sql(&self, table: &str) -> String {
        format!(
            "SELECT \"column_name\" FROM \"information_schema\".\"columns\" \
             WHERE \"table_schema\" = current_schema() AND LOWER(\"table_name\") = '{}' ORDER BY \"ordinal_position\"",
            escape_string(self, &table.to_lowercase(), false)
        )
    }

    async fn field_data(&self, conn: &mut dyn NativeConnection, table: &str) -> Result<Vec<FieldData>, Error> {
        let sql = format!(
            "SELECT c.column_name, c.data_type, c.character_maximum_length, c.numeric_precision, \
             c.column_default, c.is_nullable, \
             EXISTS (SELECT 1 FROM information_schema.table_constraints tc \
             JOIN information_schema.key_column_usage kcu \
             ON kcu.constraint_name = tc.constraint_name AND kcu.constraint_schema = tc.constraint_schema \
             WHERE tc.constraint_type = 'PRIMARY KEY' AND tc.table_schema = c.table_schema \
             AND tc.table_name = c.table_name AND kcu.column_name = c.column_name) AS primary_key \
             FROM information_schema.columns c \
             WHERE c.table_schema = current_schema() AND LOWER(c.table_name) = '{}' \
             ORDER BY c.ordinal_position",
            escape_string(self, &table.to_lowercase(), false)
        );
        let rows = conn.fetch(&sql).await?;

        Ok((0..rows.rows.len())
            .map(|i| {
                let length = rows
                    .value(i, "character_maximum_length")
                    .and_then(Value::as_i64)
                    .or_else(|| rows.value(i, "numeric_precision").and_then(Value::as_i64));
                FieldData {
                    name: rows.text(i, "column_name"),
                    type_name: rows.text(i, "data_type"),
                    max_length: length.and_then(|l| u64::try_from(l).ok()),
                    default: rows.value(i, "column_default").and_then(Value::as_text),
                    primary_key: rows.value(i, "primary_key").and_then(Value::as_bool).unwrap_or(false),
                    nullable: rows.text(i, "is_nullable") == "YES",
                }
            })
            .collect())
    }

    async fn index_data(&self, conn: &mut dyn NativeConnection, table: &str) -> Result<Vec<IndexData>, Error> {
        let sql = format!(
            "SELECT \"indexname\", \"indexdef\" FROM \"pg_indexes\" \
             WHERE LOWER(\"tablename\") = '{}' AND \"schemaname\" = current_schema()",
            escape_string(self, &table.to_lowercase(), false)
        );
        let rows = conn.fetch(&sql).await?;
        let columns = cached_regex(&INDEX_COLUMNS, r"\(([^()]+)\)\s*$")?;

        Ok((0..rows.rows.len())
            .map(|i| {
                let name = rows.text(i, "indexname");
                let definition = rows.text(i, "indexdef");
                let fields = columns
                    .captures(definition.trim())
                    .and_then(|c| c.get(1))
                    .map(|m| m.as_str().split(',').map(|f| f.trim().trim_matches('"').to_string()).collect())
                    .unwrap_or_default();
                let index_type = if name.ends_with("_pkey") || name.starts_with("pk_") {
                    IndexType::Primary
                } else if definition.starts_with("CREATE UNIQUE") {
                    IndexType::Unique
                } else {
                    IndexType::Index
                };
                IndexData { name, fields, index_type }
            })
            .collect())
    }

    async fn foreign_key_data(&self, conn: &mut dyn NativeConnection, table: &str) -> Result<Vec<ForeignKeyData>, Error> {
        let sql = format!(
            "SELECT c.constraint_name, x.table_name, x.column_name, \
             y.table_name AS foreign_table_name, y.column_name AS foreign_column_name, \
             c.delete_rule AS on_delete, c.update_rule AS on_update, c.match_option AS match_type \
             FROM information_schema.referential_constraints c \
             JOIN information_schema.key_column_usage x \
             ON x.constraint_name = c.constraint_name AND x.constraint_schema = c.constraint_schema \
             JOIN information_schema.key_column_usage y \
             ON y.ordinal_position = x.position_in_unique_constraint \
             AND y.constraint_name = c.unique_constraint_name AND y.constraint_schema = c.unique_constraint_schema \
             WHERE LOWER(x.table_name) = '{}' AND x.table_schema = current_schema() \
             ORDER BY c.constraint_name, x.ordinal_position",
            escape_string(self, &table.to_lowercase(), false)
        );
        let rows = conn.fetch(&sql).await?;
        Ok(group_foreign_keys(&rows))
    }

    fn disable_foreign_key_checks_sql(&self) -> &'static str {
        "SET CONSTRAINTS ALL DEFERRED"
    }

    fn enable_foreign_key_checks_sql(&self) -> &'static str {
        "SET CONSTRAINTS ALL IMMEDIATE"
    }

    fn insert_id_query(&self) -> Option<&'static str> {
        Some("SELECT LASTVAL()")
    }
}

// ============================================================================
// Forge Rules
// ============================================================================

pub struct PostgreForge;

pub static FORGE: PostgreForge = PostgreForge;

const UNSIGNED_WIDENING: [(&str, &str); 9] = [
    ("INT2", "INTEGER"),
    ("SMALLINT", "INTEGER"),
    ("INT", "BIGINT"),
    ("INT4", "BIGINT"),
    ("INTEGER", "BIGINT"),
    ("INT8", "NUMERIC"),
    ("BIGINT", "NUMERIC"),
    ("REAL", "DOUBLE PRECISION"),
    ("FLOAT", "DOUBLE PRECISION"),
];

fn is_integer_type(sql_type: &str) -> bool {
    sql_type.contains("INT") || sql_type.contains("SERIAL")
}

impl ForgeRules for PostgreForge {
    fn unsigned_rule(&self) -> UnsignedRule {
        UnsignedRule::Widen(&UNSIGNED_WIDENING)
    }

    fn attribute_type(&self, field: &mut Field) {
        if is_integer_type(&field.sql_type) || matches!(field.sql_type.as_str(), "REAL" | "FLOAT" | "DOUBLE") {
            field.constraint = None;
        }
        match field.sql_type.as_str() {
            "TINYINT" => {
                field.sql_type = "SMALLINT".to_string();
                field.unsigned = false;
            }
            "MEDIUMINT" => {
                field.sql_type = "INTEGER".to_string();
                field.unsigned = false;
            }
            "DOUBLE" => field.sql_type = "DOUBLE PRECISION".to_string(),
            "DATETIME" => field.sql_type = "TIMESTAMP".to_string(),
            "BLOB" | "LONGBLOB" | "MEDIUMBLOB" | "TINYBLOB" => field.sql_type = "BYTEA".to_string(),
            _ => {}
        }
    }

    fn attribute_auto_increment(&self, field: &Field, parts: &mut ColumnParts) -> bool {
        if field.auto_increment && is_integer_type(&field.sql_type) {
            let big = matches!(field.sql_type.as_str(), "INT8" | "BIGINT") || parts.type_name == "NUMERIC";
            parts.type_name = if big { "BIGSERIAL" } else { "SERIAL" }.to_string();
        }
        false
    }

    fn drop_table_cascade(&self) -> bool {
        true
    }

    fn alter_table(
        &self,
        dialect: &dyn Dialect,
        kind: AlterKind,
        table: &str,
        fields: &[ColumnParts],
    ) -> Result<Vec<String>, Error> {
        if kind == AlterKind::Add {
            let mut statements = Vec::new();
            for parts in fields {
                let mut parts = parts.clone();
                parts.new_name = None;
                let column = parts.literal.clone().unwrap_or_else(|| self.process_column(dialect, &parts));
                statements.push(format!("ALTER TABLE {} ADD {}", table, column));
                if let Some(comment) = &parts.comment {
                    statements.push(format!(
                        "COMMENT ON COLUMN {}.{} IS {}",
                        table,
                        escape_identifiers(dialect, &parts.name),
                        comment
                    ));
                }
            }
            return Ok(statements);
        }

        let mut statements = Vec::new();
        for parts in fields {
            if parts.literal.is_some() {
                return Err(Error::invalid_argument("Postgre cannot modify a column from a literal definition."));
            }
            let column = escape_identifiers(dialect, &parts.name);
            let alter = format!("ALTER TABLE {} ALTER COLUMN {}", table, column);

            statements.push(format!("{} TYPE {}{}", alter, parts.type_name, parts.length));

            if let Some(default) = &parts.default_value {
                statements.push(format!("{} SET DEFAULT {}", alter, default));
            }

            match parts.null.as_str() {
                " NULL" => statements.push(format!("{} DROP NOT NULL", alter)),
                " NOT NULL" => statements.push(format!("{} SET NOT NULL", alter)),
                _ => {}
            }

            let mut current = column;
            if let Some(new_name) = &parts.new_name {
                let renamed = escape_identifiers(dialect, new_name);
                statements.push(format!("ALTER TABLE {} RENAME COLUMN {} TO {}", table, current, renamed));
                current = renamed;
            }

            if let Some(comment) = &parts.comment {
                statements.push(format!("COMMENT ON COLUMN {}.{} IS {}", table, current, comment));
            }
        }
        Ok(statements)
    }

    fn drop_foreign_key_statement(&self, table: &str, name: &str) -> Option<String> {
        Some(format!("ALTER TABLE {} DROP CONSTRAINT {}", table, name))
    }

    fn database_exists_query(&self) -> Option<&'static str> {
        Some("SELECT 1 FROM pg_database WHERE datname = ?")
    }
}

// ============================================================================
// Connector
// ============================================================================

pub struct PostgreConnector;

#[async_trait]
impl Connector for PostgreConnector {
    async fn connect(&self, config: &ConnectionConfig, _persistent: bool) -> Result<Box<dyn NativeConnection>, Error> {
        let mut options = PgConnectOptions::new()
            .host(&config.hostname)
            .username(&config.username)
            .password(&config.password)
            .database(&config.database);

        if let Some(port) = config.port {
            options = options.port(port);
        }
        if let Some(name) = config.options.get("application_name") {
            options = options.application_name(name);
        }

        let mut ssl_mode = match config.options.get("sslmode") {
            Some(mode) => Some(PgSslMode::from_str(mode).map_err(|e| Error::Config(e.to_string()))?),
            None => None,
        };
        if let Some(encrypt) = &config.encrypt {
            if ssl_mode.is_none() {
                ssl_mode = Some(if encrypt.ssl_verify { PgSslMode::VerifyFull } else { PgSslMode::Require });
            }
            if let Some(ca) = &encrypt.ssl_ca {
                options = options.ssl_root_cert(ca);
            }
            if let Some(cert) = &encrypt.ssl_cert {
                options = options.ssl_client_cert(cert);
            }
            if let Some(key) = &encrypt.ssl_key {
                options = options.ssl_client_key(key);
            }
        }
        if let Some(mode) = ssl_mode {
            options = options.ssl_mode(mode);
        }

        let conn = PgConnection::connect_with(&options).await.map_err(|e| Error::Connect(e.to_string()))?;
        let mut native = PostgreNative { conn, catalog: HashMap::new(), annotating: false };

        if !config.charset.is_empty() {
            let sql = format!("SET client_encoding TO '{}'", escape_string(&DIALECT, &config.charset, false));
            native.session(&sql).await?;
        }
        if !config.schema.is_empty() {
            let sql = format!("SET search_path TO {},public", escape_identifiers(&DIALECT, &config.schema));
            native.session(&sql).await?;
        }

        let requires_ssl = matches!(ssl_mode, Some(PgSslMode::Require | PgSslMode::VerifyCa | PgSslMode::VerifyFull));
        if requires_ssl {
            let status = native
                .fetch("SELECT ssl FROM pg_stat_ssl WHERE pid = pg_backend_pid()")
                .await
                .map_err(|e| Error::Connect(e.to_string()))?;
            if status.value(0, "ssl").and_then(Value::as_bool) != Some(true) {
                return Err(Error::connect("Postgre was configured for an SSL connection, but got an unencrypted connection instead."));
            }
        }

        Ok(Box::new(native))
    }
}

// ============================================================================
// Native Connection
// ============================================================================

/// Table column a result column was read from: relation oid and attribute number.
type Origin = (u32, i16);

struct PostgreNative {
    conn: PgConnection,
    /// `(primary_key, nullable)` by attribute number, per relation read so far.
    catalog: HashMap<u32, HashMap<i16, (bool, bool)>>,
    annotating: bool,
}

/// Column metadata and origins of sqlx columns.
fn pg_columns(columns: &[PgColumn]) -> (Vec<ColumnMeta>, Vec<Option<Origin>>) {
    columns
        .iter()
        .map(|c| {
            let origin = c.relation_id().zip(c.relation_attribute_no()).map(|(rel, att)| (rel.0, att));
            (ColumnMeta::new(c.name(), c.type_info().name()), origin)
        })
        .unzip()
}

impl PostgreNative {
    async fn session(&mut self, sql: &str) -> Result<(), Error> {
        (&mut self.conn).execute(sqlx::raw_sql(sql)).await.map_err(|e| Error::Connect(e.to_string()))?;
        Ok(())
    }

    async fn describe_columns(&mut self, sql: &str) -> (Vec<ColumnMeta>, Vec<Option<Origin>>) {
        match (&mut self.conn).prepare(sql).await {
            Ok(stmt) => pg_columns(stmt.columns()),
            Err(_) => (Vec::new(), Vec::new()),
        }
    }

    /// Columns of a result: from the first row, or described when there is none.
    async fn result_columns(&mut self, sql: &str, first: Option<&PgRow>) -> Vec<ColumnMeta> {
        let (mut columns, origins) = match first {
            Some(row) => pg_columns(row.columns()),
            None => self.describe_columns(sql).await,
        };
        self.annotate(&mut columns, &origins).await;
        columns
    }

    /// Marks result columns with the primary-key and NOT NULL flags of the
    /// table columns they were read from.
    async fn annotate(&mut self, columns: &mut [ColumnMeta], origins: &[Option<Origin>]) {
        if self.annotating {
            return;
        }

        let mut missing: Vec<u32> = Vec::new();
        for (rel, _) in origins.iter().flatten() {
            if !self.catalog.contains_key(rel) && !missing.contains(rel) {
                missing.push(*rel);
            }
        }

        if !missing.is_empty() {
            let ids: Vec<String> = missing.iter().map(u32::to_string).collect();
            let sql = format!(
                "SELECT a.attrelid::int8 AS relid, a.attnum::int4 AS attnum, a.attnotnull, \
                 COALESCE(i.indisprimary, false) AS primary_key \
                 FROM pg_attribute a \
                 LEFT JOIN pg_index i ON i.indrelid = a.attrelid AND i.indisprimary AND a.attnum = ANY(i.indkey) \
                 WHERE a.attrelid IN ({}) AND a.attnum > 0 AND NOT a.attisdropped",
                ids.join(", ")
            );

            self.annotating = true;
            let rows = self.fetch(&sql).await;
            self.annotating = false;

            match rows {
                Ok(rows) => {
                    for rel in &missing {
                        self.catalog.entry(*rel).or_default();
                    }
                    for i in 0..rows.rows.len() {
                        let rel = rows.value(i, "relid").and_then(Value::as_i64).and_then(|v| u32::try_from(v).ok());
                        let att = rows.value(i, "attnum").and_then(Value::as_i64).and_then(|v| i16::try_from(v).ok());
                        if let (Some(rel), Some(att)) = (rel, att) {
                            let primary_key = rows.value(i, "primary_key").and_then(Value::as_bool).unwrap_or(false);
                            let not_null = rows.value(i, "attnotnull").and_then(Value::as_bool).unwrap_or(false);
                            self.catalog.entry(rel).or_default().insert(att, (primary_key, !not_null));
                        }
                    }
                }
                Err(e) => log::debug!("Postgre: no column flags for relations {}: {}", ids.join(", "), e),
            }
        }

        for (column, origin) in columns.iter_mut().zip(origins.iter().copied()) {
            let flags = origin.and_then(|(rel, att)| self.catalog.get(&rel)?.get(&att).copied());
            if let Some((primary_key, nullable)) = flags {
                column.primary_key = primary_key;
                column.nullable = nullable;
            }
        }
    }
}

/// Renders the binary NUMERIC wire format as decimal text.
///
/// Layout: digit count, weight, sign and display scale (all 16 bit), then
/// base-10000 digits.
fn numeric_text(buf: &[u8]) -> Option<String> {
    let word = |i: usize| -> Option<i16> { Some(i16::from_be_bytes([*buf.get(i)?, *buf.get(i + 1)?])) };

    let ndigits = usize::try_from(word(0)?).ok()?;
    let weight = i32::from(word(2)?);
    let sign = word(4)? as u16;
    let scale = usize::try_from(word(6)?).ok()?;

    if sign == 0xC000 {
        return Some("NaN".to_string());
    }

    let digits: Vec<i16> = (0..ndigits).map(|i| word(8 + 2 * i)).collect::<Option<_>>()?;
    let digit = |p: i32| -> i16 { usize::try_from(p).ok().and_then(|p| digits.get(p).copied()).unwrap_or(0) };

    let mut text = String::new();
    if sign == 0x4000 {
        text.push('-');
    }

    if weight < 0 {
        text.push('0');
    } else {
        text.push_str(&digit(0).to_string());
        for p in 1..=weight {
            text.push_str(&format!("{:04}", digit(p)));
        }
    }

    if scale > 0 {
        let mut fraction = String::new();
        let mut p = weight + 1;
        while fraction.len() < scale {
            fraction.push_str(&format!("{:04}", digit(p)));
            p += 1;
        }
        fraction.truncate(scale);
        text.push('.');
        text.push_str(&fraction);
    }

    Some(text)
}

/// Decodes a row delivered in the binary protocol (prepared statements).
fn decode_binary_row(row: &PgRow) -> Result<Vec<Value>, sqlx::Error> {
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

        let value = match type_name.as_str() {
            "BOOL" => Value::Bool(row.try_get(idx)?),
            "INT2" => Value::Int(i64::from(row.try_get::<i16, _>(idx)?)),
            "INT4" => Value::Int(i64::from(row.try_get::<i32, _>(idx)?)),
            "INT8" => Value::Int(row.try_get(idx)?),
            "FLOAT4" => Value::Float(f64::from(row.try_get::<f32, _>(idx)?)),
            "FLOAT8" => Value::Float(row.try_get(idx)?),
            "NUMERIC" => {
                let bytes: Vec<u8> = row.try_get_unchecked(idx)?;
                numeric_text(&bytes).map(Value::Text).unwrap_or(Value::Null)
            }
            "TIMESTAMP" => Value::DateTime(row.try_get::<NaiveDateTime, _>(idx)?),
            "TIMESTAMPTZ" => Value::from(row.try_get::<DateTime<Utc>, _>(idx)?),
            "DATE" => Value::Date(row.try_get::<NaiveDate, _>(idx)?),
            "TIME" => Value::Time(row.try_get::<NaiveTime, _>(idx)?),
            "UUID" => Value::from(row.try_get::<Uuid, _>(idx)?),
            "BYTEA" => Value::Bytes(row.try_get(idx)?),
            "JSON" | "JSONB" => Value::Text(row.try_get::<serde_json::Value, _>(idx)?.to_string()),
            _ => Value::Text(row.try_get_unchecked(idx)?),
        };
        values.push(value);
    }

    Ok(values)
}

#[async_trait]
impl NativeConnection for PostgreNative {
    async fn execute(&mut self, sql: &str) -> Result<ExecResult, Error> {
        let done = (&mut self.conn).execute(sqlx::raw_sql(sql)).await.map_err(native_error(sql))?;
        if is_schema_change(sql) {
            self.catalog.clear();
        }
        Ok(ExecResult { affected_rows: done.rows_affected(), last_insert_id: None })
    }

    async fn fetch(&mut self, sql: &str) -> Result<RowSet, Error> {
        let rows = (&mut self.conn).fetch_all(sqlx::raw_sql(sql)).await.map_err(native_error(sql))?;
        let mut values = Vec::with_capacity(rows.len());
        for row in &rows {
            values.push(decode_row(row)?);
        }
        let columns = self.result_columns(sql, rows.first()).await;
        Ok(RowSet { columns, rows: values })
    }

    async fn prepare(&mut self, sql: &str) -> Result<(), Error> {
        (&mut self.conn).prepare(sql).await.map_err(native_error(sql))?;
        Ok(())
    }

    async fn execute_prepared(&mut self, sql: &str, params: &[Value], read: bool) -> Result<PreparedOutcome, Error> {
        let mut args = PgArguments::default();
        args.bind_all(params)?;

        if read {
            let rows = (&mut self.conn).fetch_all(sqlx::query_with(sql, args)).await.map_err(native_error(sql))?;
            let mut values = Vec::with_capacity(rows.len());
            for row in &rows {
                values.push(decode_binary_row(row)?);
            }
            let columns = self.result_columns(sql, rows.first()).await;
            return Ok(PreparedOutcome::Rows(RowSet { columns, rows: values }));
        }

        let done = (&mut self.conn).execute(sqlx::query_with(sql, args)).await.map_err(native_error(sql))?;
        Ok(PreparedOutcome::Write(ExecResult { affected_rows: done.rows_affected(), last_insert_id: None }))
    }

    async fn deallocate(&mut self, sql: &str) -> Result<(), Error> {
        self.conn.clear_cached_statements().await.map_err(native_error(sql))
    }

    async fn ping(&mut self) -> Result<(), Error> {
        self.conn.ping().await.map_err(|e| Error::Connect(e.to_string()))
    }

    async fn close(self: Box<Self>) -> Result<(), Error> {
        self.conn.close().await.map_err(|e| Error::Connect(e.to_string()))
    }
}
