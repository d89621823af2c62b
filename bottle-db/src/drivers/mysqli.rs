//! # MySQLi Driver
//!
//! MySQL and MariaDB over `MySqlConnection`.
//!
//! ## Session Setup
//!
//! - `SET NAMES` with the configured charset and collation
//! - `strict_on` adds `STRICT_ALL_TABLES` to the session `sql_mode`, otherwise
//!   the strict modes are removed
//! - With encryption configured, a session without a negotiated cipher is
//!   a failed connect
//!
//! A bare `DELETE FROM t` is sent as `DELETE FROM t WHERE 1=1` so the server
//! reports the number of deleted rows.

use std::{collections::HashMap, sync::OnceLock};

use async_trait::async_trait;
use chrono::{NaiveDate, NaiveDateTime, NaiveTime};
use regex::Regex;
use sqlx::{
    Column, Connection as _, Executor, Row, Statement, TypeInfo, ValueRef,
    mysql::{MySqlArguments, MySqlConnectOptions, MySqlConnection, MySqlRow, MySqlSslMode},
};

use super::{
    ColumnMeta, Connector, Dialect, ExecResult, NativeConnection, PreparedOutcome, RowSet, apply_field_flags,
    decode_row, group_foreign_keys, is_schema_change, native_error, row_columns, source_tables, type_length,
};
use crate::{
    Error,
    config::ConnectionConfig,
    database::Drivers,
    escape::{escape_identifiers, escape_string},
    forge::{AlterKind, ColumnParts, ForgeRules, UnsignedRule},
    introspection::{FieldData, ForeignKeyData, IndexData, IndexType},
    query::cached_regex,
    value::Value,
    value_binding::ValueBinder,
};

// ============================================================================
// Dialect
// ============================================================================

pub struct MySqliDialect;

pub static DIALECT: MySqliDialect = MySqliDialect;

static BARE_DELETE: OnceLock<Regex> = OnceLock::new();

#[async_trait]
impl Dialect for MySqliDialect {
    fn driver(&self) -> Drivers {
        Drivers::MySQL
    }

    fn escape_char(&self) -> char {
        '`'
    }

    /// Same set as `mysqli::real_escape_string`.
    fn escape_string_body(&self, value: &str) -> String {
        let mut out = String::with_capacity(value.len() + 8);
        for c in value.chars() {
            match c {
                '\\' => out.push_str("\\\\"),
                '\'' => out.push_str("\\'"),
                '"' => out.push_str("\\\""),
                '\0' => out.push_str("\\0"),
                '\n' => out.push_str("\\n"),
                '\r' => out.push_str("\\r"),
                '\u{1a}' => out.push_str("\\Z"),
                c => out.push(c),
            }
        }
        out
    }

    fn like_escape_char(&self) -> char {
        '\\'
    }

    fn compile_limit(&self, limit: Option<u64>, offset: Option<u64>) -> String {
        match (limit, offset.filter(|o| *o > 0)) {
            (Some(limit), Some(offset)) => format!(" LIMIT {}, {}", offset, limit),
            (Some(limit), None) => format!(" LIMIT {}", limit),
            (None, Some(offset)) => format!(" LIMIT {}, {}", offset, u64::MAX),
            (None, None) => String::new(),
        }
    }

    fn prepare_for_execution(&self, sql: &str) -> String {
        match cached_regex(&BARE_DELETE, r"(?is)^\s*DELETE\s+FROM\s+(\S+)\s*$") {
            Ok(re) if re.is_match(sql) => format!("{} WHERE 1=1", sql.trim_end()),
            _ => sql.to_string(),
        }
    }

    async fn version(&self, conn: &mut dyn NativeConnection) -> Result<String, Error> {
        let rows = conn.fetch("SELECT VERSION()").await?;
        Ok(rows.first_column().into_iter().next().unwrap_or_default())
    }

    fn list_tables_sql(&self, prefix: Option<&str>) -> String {
        let mut sql = String::from(
            "SELECT TABLE_NAME AS table_name FROM information_schema.TABLES WHERE TABLE_SCHEMA = DATABASE()",
        );
        if let Some(prefix) = prefix {
            sql.push_str(&format!(" AND TABLE_NAME LIKE '{}%'", escape_string(self, prefix, true)));
        }
        sql
    }

    fn list_columns_sql(&self, table: &str) -> String {
        format!(
            "SELECT COLUMN_NAME AS column_name FROM information_schema.COLUMNS \
             WHERE TABLE_SCHEMA = DATABASE() AND TABLE_NAME = '{}' ORDER BY ORDINAL_POSITION",
            escape_string(self, table, false)
        )
    }

    async fn field_data(&self, conn: &mut dyn NativeConnection, table: &str) -> Result<Vec<FieldData>, Error> {
        let sql = format!("SHOW COLUMNS FROM {}", escape_identifiers(self, table));
        let rows = conn.fetch(&sql).await?;

        Ok((0..rows.rows.len())
            .map(|i| {
                let full_type = rows.text(i, "Type");
                let type_name = full_type.split(['(', ' ']).next().unwrap_or_default().to_string();
                FieldData {
                    name: rows.text(i, "Field"),
                    max_length: type_length(&full_type),
                    type_name,
                    default: rows.value(i, "Default").and_then(Value::as_text),
                    primary_key: rows.text(i, "Key") == "PRI",
                    nullable: rows.text(i, "Null") == "YES",
                }
            })
            .collect())
    }

    async fn index_data(&self, conn: &mut dyn NativeConnection, table: &str) -> Result<Vec<IndexData>, Error> {
        let sql = format!("SHOW INDEX FROM {}", escape_identifiers(self, table));
        let rows = conn.fetch(&sql).await?;

        let mut indexes: Vec<IndexData> = Vec::new();
        for i in 0..rows.rows.len() {
            let name = rows.text(i, "Key_name");
            let field = rows.text(i, "Column_name");

            if let Some(idx) = indexes.iter_mut().find(|idx| idx.name == name) {
                idx.fields.push(field);
                continue;
            }

            let index_type = if name == "PRIMARY" {
                IndexType::Primary
            } else {
                match rows.text(i, "Index_type").as_str() {
                    "FULLTEXT" => IndexType::Fulltext,
                    "SPATIAL" => IndexType::Spatial,
                    _ if rows.value(i, "Non_unique").and_then(Value::as_i64) == Some(0) => IndexType::Unique,
                    _ => IndexType::Index,
                }
            };
            indexes.push(IndexData { name, fields: vec![field], index_type });
        }
        Ok(indexes)
    }

    async fn foreign_key_data(&self, conn: &mut dyn NativeConnection, table: &str) -> Result<Vec<ForeignKeyData>, Error> {
        let sql = format!(
            "SELECT tc.CONSTRAINT_NAME AS constraint_name, tc.TABLE_NAME AS table_name, \
             kcu.COLUMN_NAME AS column_name, rc.REFERENCED_TABLE_NAME AS foreign_table_name, \
             kcu.REFERENCED_COLUMN_NAME AS foreign_column_name, rc.DELETE_RULE AS on_delete, \
             rc.UPDATE_RULE AS on_update, rc.MATCH_OPTION AS match_type \
             FROM information_schema.TABLE_CONSTRAINTS AS tc \
             INNER JOIN information_schema.REFERENTIAL_CONSTRAINTS AS rc \
             ON tc.CONSTRAINT_NAME = rc.CONSTRAINT_NAME AND tc.CONSTRAINT_SCHEMA = rc.CONSTRAINT_SCHEMA \
             INNER JOIN information_schema.KEY_COLUMN_USAGE AS kcu \
             ON tc.CONSTRAINT_NAME = kcu.CONSTRAINT_NAME AND tc.CONSTRAINT_SCHEMA = kcu.CONSTRAINT_SCHEMA \
             WHERE tc.CONSTRAINT_TYPE = 'FOREIGN KEY' AND tc.TABLE_SCHEMA = DATABASE() AND tc.TABLE_NAME = '{}' \
             ORDER BY tc.CONSTRAINT_NAME, kcu.ORDINAL_POSITION",
            escape_string(self, table, false)
        );
        let rows = conn.fetch(&sql).await?;
        Ok(group_foreign_keys(&rows))
    }

    fn disable_foreign_key_checks_sql(&self) -> &'static str {
        "SET FOREIGN_KEY_CHECKS=0"
    }

    fn enable_foreign_key_checks_sql(&self) -> &'static str {
        "SET FOREIGN_KEY_CHECKS=1"
    }
}

// ============================================================================
// Forge Rules
// ============================================================================

pub struct MySqliForge;

pub static FORGE: MySqliForge = MySqliForge;

const UNSIGNED_TYPES: [&str; 12] = [
    "TINYINT",
    "SMALLINT",
    "MEDIUMINT",
    "INT",
    "INTEGER",
    "BIGINT",
    "REAL",
    "DOUBLE",
    "DOUBLE PRECISION",
    "FLOAT",
    "DECIMAL",
    "NUMERIC",
];

/// Table options that carry the character set themselves.
const CHARSET_KEYS: [&str; 4] = ["CHARSET", "CHARACTER SET", "DEFAULT CHARSET", "DEFAULT CHARACTER SET"];

impl ForgeRules for MySqliForge {
    fn unsigned_rule(&self) -> UnsignedRule {
        UnsignedRule::Types(&UNSIGNED_TYPES)
    }

    fn process_column(&self, dialect: &dyn Dialect, parts: &ColumnParts) -> String {
        let mut sql = escape_identifiers(dialect, &parts.name);
        if let Some(new_name) = &parts.new_name {
            sql.push(' ');
            sql.push_str(&escape_identifiers(dialect, new_name));
        }
        sql.push_str(&format!(
            " {}{}{}{}{}{}{}",
            parts.type_name, parts.length, parts.unsigned, parts.null, parts.default, parts.auto_increment, parts.unique
        ));
        if let Some(comment) = &parts.comment {
            sql.push_str(" COMMENT ");
            sql.push_str(comment);
        }
        if let Some(after) = &parts.after {
            sql.push_str(" AFTER ");
            sql.push_str(&escape_identifiers(dialect, after));
        } else if parts.first {
            sql.push_str(" FIRST");
        }
        sql
    }

    fn keys_in_create_table(&self) -> bool {
        true
    }

    fn create_table_attributes(
        &self,
        _dialect: &dyn Dialect,
        attributes: &std::collections::BTreeMap<String, String>,
        charset: &str,
        collation: &str,
    ) -> String {
        let mut sql = String::new();
        let mut has_charset = false;
        let mut has_collate = false;

        for (key, value) in attributes {
            let key = key.to_ascii_uppercase();
            has_charset |= CHARSET_KEYS.contains(&key.as_str());
            has_collate |= key == "COLLATE";
            sql.push_str(&format!(" {} = {}", key, value));
        }

        if !has_charset && !charset.is_empty() {
            sql.push_str(&format!(" DEFAULT CHARACTER SET = {}", charset));
        }
        if !has_collate && !collation.is_empty() {
            sql.push_str(&format!(" COLLATE = {}", collation));
        }
        sql
    }

    fn alter_table(
        &self,
        dialect: &dyn Dialect,
        kind: AlterKind,
        table: &str,
        fields: &[ColumnParts],
    ) -> Result<Vec<String>, Error> {
        let clauses: Vec<String> = fields
            .iter()
            .map(|parts| {
                let mut parts = parts.clone();
                let action = match kind {
                    AlterKind::Add => {
                        parts.new_name = None;
                        "ADD"
                    }
                    AlterKind::Change if parts.new_name.is_some() => "CHANGE",
                    AlterKind::Change => "MODIFY",
                };
                let column = parts.literal.clone().unwrap_or_else(|| self.process_column(dialect, &parts));
                format!("\n\t{} {}", action, column)
            })
            .collect();

        Ok(vec![format!("ALTER TABLE {}{}", table, clauses.join(","))])
    }

    fn drop_foreign_key_statement(&self, table: &str, name: &str) -> Option<String> {
        Some(format!("ALTER TABLE {} DROP FOREIGN KEY {}", table, name))
    }

    fn create_database_statement(&self, name: &str, if_not_exists: bool, charset: &str, collation: &str) -> Option<String> {
        let mut sql = String::from("CREATE DATABASE ");
        if if_not_exists {
            sql.push_str("IF NOT EXISTS ");
        }
        sql.push_str(name);
        if !charset.is_empty() {
            sql.push_str(&format!(" CHARACTER SET {}", charset));
        }
        if !collation.is_empty() {
            sql.push_str(&format!(" COLLATE {}", collation));
        }
        Some(sql)
    }
}

// ============================================================================
// Connector
// ============================================================================

pub struct MySqliConnector;

#[async_trait]
impl Connector for MySqliConnector {
    async fn connect(&self, config: &ConnectionConfig, _persistent: bool) -> Result<Box<dyn NativeConnection>, Error> {
        let mut options = MySqlConnectOptions::new()
            .username(&config.username)
            .password(&config.password)
            .database(&config.database);

        if config.hostname.starts_with('/') {
            options = options.socket(&config.hostname);
        } else {
            options = options.host(&config.hostname);
            if let Some(port) = config.port {
                options = options.port(port);
            }
        }

        if let Some(encrypt) = &config.encrypt {
            options = options.ssl_mode(if encrypt.ssl_verify { MySqlSslMode::VerifyIdentity } else { MySqlSslMode::Required });
            if let Some(ca) = &encrypt.ssl_ca {
                options = options.ssl_ca(ca);
            }
            if let Some(cert) = &encrypt.ssl_cert {
                options = options.ssl_client_cert(cert);
            }
            if let Some(key) = &encrypt.ssl_key {
                options = options.ssl_client_key(key);
            }
        }

        if config.compress {
            log::warn!("MySQLi: protocol compression is not available, connecting without it");
        }

        let conn = MySqlConnection::connect_with(&options).await.map_err(|e| Error::Connect(e.to_string()))?;
        let mut native = MySqliNative { conn, catalog: HashMap::new(), annotating: false };

        if !config.charset.is_empty() {
            let mut sql = format!("SET NAMES '{}'", escape_string(&DIALECT, &config.charset, false));
            if !config.collation.is_empty() {
                sql.push_str(&format!(" COLLATE '{}'", escape_string(&DIALECT, &config.collation, false)));
            }
            native.session(&sql).await?;
        }

        let sql_mode = if config.strict_on {
            "SET SESSION sql_mode = CONCAT(@@sql_mode, ',', 'STRICT_ALL_TABLES')"
        } else {
            "SET SESSION sql_mode = REPLACE(REPLACE(REPLACE(@@sql_mode, 'STRICT_ALL_TABLES', ''), \
             'STRICT_TRANS_TABLES', ''), ',,', ',')"
        };
        native.session(sql_mode).await?;

        if config.encrypt.is_some() {
            let status = native.fetch("SHOW STATUS LIKE 'ssl_cipher'").await.map_err(|e| Error::Connect(e.to_string()))?;
            if status.text(0, "Value").is_empty() {
                return Err(Error::connect("MySQLi was configured for an SSL connection, but got an unencrypted connection instead."));
            }
        }

        Ok(Box::new(native))
    }
}

// ============================================================================
// Native Connection
// ============================================================================

struct MySqliNative {
    conn: MySqlConnection,
    /// `SHOW COLUMNS` rows of tables read so far.
    catalog: HashMap<String, Vec<FieldData>>,
    annotating: bool,
}

impl MySqliNative {
    async fn session(&mut self, sql: &str) -> Result<(), Error> {
        (&mut self.conn).execute(sqlx::raw_sql(sql)).await.map_err(|e| Error::Connect(e.to_string()))?;
        Ok(())
    }

    async fn describe_columns(&mut self, sql: &str) -> Vec<ColumnMeta> {
        match (&mut self.conn).prepare(sql).await {
            Ok(stmt) => stmt
                .columns()
                .iter()
                .map(|c| ColumnMeta::new(c.name(), c.type_info().name()))
                .collect(),
            Err(_) => Vec::new(),
        }
    }

    /// Marks result columns with the `Key` and `Null` flags of the tables
    /// the statement reads from.
    async fn annotate(&mut self, sql: &str, columns: &mut [ColumnMeta]) {
        if self.annotating || columns.is_empty() {
            return;
        }
        let tables = source_tables(sql);
        if tables.is_empty() {
            return;
        }

        self.annotating = true;
        let mut found = Vec::with_capacity(tables.len());
        for table in tables {
            if !self.catalog.contains_key(&table) {
                match DIALECT.field_data(self, &table).await {
                    Ok(fields) => {
                        self.catalog.insert(table.clone(), fields);
                    }
                    Err(e) => log::debug!("MySQLi: no column flags for {}: {}", table, e),
                }
            }
            if let Some(fields) = self.catalog.get(&table) {
                found.push(fields.clone());
            }
        }
        self.annotating = false;

        apply_field_flags(columns, &found);
    }
}

/// Decodes a row delivered in the binary protocol (prepared statements).
fn decode_binary_row(row: &MySqlRow) -> Result<Vec<Value>, sqlx::Error> {
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
            "BOOLEAN" => Value::Bool(row.try_get(idx)?),
            "TINYINT" | "SMALLINT" | "MEDIUMINT" | "INT" | "BIGINT" => Value::Int(row.try_get(idx)?),
            t if t.ends_with("UNSIGNED") => {
                let n: u64 = row.try_get(idx)?;
                i64::try_from(n).map(Value::Int).unwrap_or_else(|_| Value::Text(n.to_string()))
            }
            "YEAR" => Value::Int(i64::from(row.try_get_unchecked::<u16, _>(idx)?)),
            "FLOAT" => Value::Float(f64::from(row.try_get::<f32, _>(idx)?)),
            "DOUBLE" => Value::Float(row.try_get(idx)?),
            "DATETIME" | "TIMESTAMP" => Value::DateTime(row.try_get::<NaiveDateTime, _>(idx)?),
            "DATE" => Value::Date(row.try_get::<NaiveDate, _>(idx)?),
            "TIME" => Value::Time(row.try_get::<NaiveTime, _>(idx)?),
            "BLOB" | "TINYBLOB" | "MEDIUMBLOB" | "LONGBLOB" | "BINARY" | "VARBINARY" | "BIT" | "GEOMETRY" => {
                Value::Bytes(row.try_get_unchecked(idx)?)
            }
            _ => Value::Text(row.try_get_unchecked(idx)?),
        };
        values.push(value);
    }

    Ok(values)
}

#[async_trait]
impl NativeConnection for MySqliNative {
    async fn execute(&mut self, sql: &str) -> Result<ExecResult, Error> {
        let done = (&mut self.conn).execute(sqlx::raw_sql(sql)).await.map_err(native_error(sql))?;
        if is_schema_change(sql) {
            self.catalog.clear();
        }
        let id = done.last_insert_id();
        Ok(ExecResult {
            affected_rows: done.rows_affected(),
            last_insert_id: (id > 0).then(|| i64::try_from(id).ok()).flatten(),
        })
    }

    async fn fetch(&mut self, sql: &str) -> Result<RowSet, Error> {
        let rows = (&mut self.conn).fetch_all(sqlx::raw_sql(sql)).await.map_err(native_error(sql))?;
        let mut values = Vec::with_capacity(rows.len());
        for row in &rows {
            values.push(decode_row(row)?);
        }
        let mut columns = match rows.first() {
            Some(row) => row_columns(row),
            None => self.describe_columns(sql).await,
        };
        self.annotate(sql, &mut columns).await;
        Ok(RowSet { columns, rows: values })
    }

    async fn prepare(&mut self, sql: &str) -> Result<(), Error> {
        (&mut self.conn).prepare(sql).await.map_err(native_error(sql))?;
        Ok(())
    }

    async fn execute_prepared(&mut self, sql: &str, params: &[Value], read: bool) -> Result<PreparedOutcome, Error> {
        let mut args = MySqlArguments::default();
        args.bind_all(params)?;

        if read {
            let rows = (&mut self.conn).fetch_all(sqlx::query_with(sql, args)).await.map_err(native_error(sql))?;
            let mut values = Vec::with_capacity(rows.len());
            for row in &rows {
                values.push(decode_binary_row(row)?);
            }
            let mut columns = match rows.first() {
                Some(row) => row_columns(row),
                None => self.describe_columns(sql).await,
            };
            self.annotate(sql, &mut columns).await;
            return Ok(PreparedOutcome::Rows(RowSet { columns, rows: values }));
        }

        let done = (&mut self.conn).execute(sqlx::query_with(sql, args)).await.map_err(native_error(sql))?;
        let id = done.last_insert_id();
        Ok(PreparedOutcome::Write(ExecResult {
            affected_rows: done.rows_affected(),
            last_insert_id: (id > 0).then(|| i64::try_from(id).ok()).flatten(),
        }))
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

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    #[rstest]
    #[case("DELETE FROM `users`", "DELETE FROM `users` WHERE 1=1")]
    #[case("  delete from users  ", "  delete from users WHERE 1=1")]
    #[case("DELETE FROM users WHERE id = 1", "DELETE FROM users WHERE id = 1")]
    #[case("SELECT 1", "SELECT 1")]
    fn bare_deletes_get_a_where(#[case] sql: &str, #[case] expected: &str) {
        assert_eq!(DIALECT.prepare_for_execution(sql), expected);
    }

    #[test]
    fn limit_puts_offset_first() {
        assert_eq!(DIALECT.compile_limit(Some(10), Some(20)), " LIMIT 20, 10");
        assert_eq!(DIALECT.compile_limit(Some(10), None), " LIMIT 10");
    }

    #[test]
    fn strings_use_backslash_escapes() {
        assert_eq!(DIALECT.escape_string_body("a'b\\c\n"), "a\\'b\\\\c\\n");
        assert!(DIALECT.list_tables_sql(Some("app_")).ends_with("LIKE 'app\\_%'"));
    }

    #[test]
    fn table_attributes_keep_explicit_charset() {
        let attrs = std::collections::BTreeMap::from([
            ("charset".to_string(), "latin1".to_string()),
            ("comment".to_string(), "'logs'".to_string()),
        ]);
        assert_eq!(
            FORGE.create_table_attributes(&DIALECT, &attrs, "utf8", "utf8_general_ci"),
            " CHARSET = latin1 COMMENT = 'logs' COLLATE = utf8_general_ci"
        );
    }
}
