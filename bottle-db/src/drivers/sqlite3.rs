//! # SQLite3 Driver
//!
//! File and in-memory databases over `SqliteConnection`.
//!
//! - Persistent connections do not exist; asking for one fails in debug mode
//! - `foreign_keys` in the options turns on `PRAGMA foreign_keys`
//! - Truncate is `DELETE FROM`, insert-ignore is `INSERT OR IGNORE`
//! - UPDATE/DELETE never carry a LIMIT

use std::{
    collections::{BTreeMap, HashMap},
    str::FromStr,
    time::Duration,
};

use async_trait::async_trait;
use sqlx::{
    Column, Connection as _, Executor, Statement, TypeInfo,
    sqlite::{SqliteArguments, SqliteConnectOptions, SqliteConnection, SqliteRow},
};

use super::{
    ColumnMeta, Connector, Dialect, ExecResult, IgnoreStyle, NativeConnection, PreparedOutcome, RowSet,
    apply_field_flags, decode_row, is_schema_change, native_error, row_columns, source_tables, type_length,
};
use crate::{
    Error,
    config::ConnectionConfig,
    database::Drivers,
    escape::escape_string,
    forge::{AlterKind, ColumnParts, Field, ForgeRules, UnsignedRule},
    introspection::{FieldData, ForeignKeyData, IndexData, IndexType},
    value::Value,
    value_binding::ValueBinder,
};

// ============================================================================
// Dialect
// ============================================================================

pub struct Sqlite3Dialect;

pub static DIALECT: Sqlite3Dialect = Sqlite3Dialect;

#[async_trait]
impl Dialect for Sqlite3Dialect {
    fn driver(&self) -> Drivers {
        Drivers::SQLite
    }

    fn random_keyword(&self, _seed: Option<u32>) -> String {
        "RANDOM()".to_string()
    }

    fn compile_limit(&self, limit: Option<u64>, offset: Option<u64>) -> String {
        let offset = offset.filter(|o| *o > 0);
        match (limit, offset) {
            (Some(limit), Some(offset)) => format!(" LIMIT {} OFFSET {}", limit, offset),
            (Some(limit), None) => format!(" LIMIT {}", limit),
            (None, Some(offset)) => format!(" LIMIT -1 OFFSET {}", offset),
            (None, None) => String::new(),
        }
    }

    fn limit_on_write(&self) -> bool {
        false
    }

    fn insert_ignore(&self) -> IgnoreStyle {
        IgnoreStyle::Prefix("INSERT OR IGNORE")
    }

    fn truncate_statement(&self, table: &str) -> String {
        format!("DELETE FROM {}", table)
    }

    fn begin_statement(&self) -> &'static str {
        "BEGIN TRANSACTION"
    }

    async fn version(&self, conn: &mut dyn NativeConnection) -> Result<String, Error> {
        let rows = conn.fetch("SELECT sqlite_version()").await?;
        Ok(rows.first_column().into_iter().next().unwrap_or_default())
    }

    fn list_tables_sql(&self, prefix: Option<&str>) -> String {
        let mut sql = String::from(
            "SELECT \"NAME\" FROM \"SQLITE_MASTER\" WHERE \"TYPE\" = 'table' AND \"NAME\" NOT LIKE 'sqlite!_%' ESCAPE '!'",
        );
        if let Some(prefix) = prefix {
            sql.push_str(&format!(" AND \"NAME\" LIKE '{}%' ESCAPE '!'", escape_string(self, prefix, true)));
        }
        sql
    }

    fn list_columns_sql(&self, table: &str) -> String {
        format!("SELECT \"name\" FROM pragma_table_info('{}')", escape_string(self, table, false))
    }

    async fn field_data(&self, conn: &mut dyn NativeConnection, table: &str) -> Result<Vec<FieldData>, Error> {
        let sql = format!("PRAGMA TABLE_INFO('{}')", escape_string(self, table, false));
        let rows = conn.fetch(&sql).await?;

        Ok((0..rows.rows.len())
            .map(|i| {
                let type_name = rows.text(i, "type");
                FieldData {
                    name: rows.text(i, "name"),
                    max_length: type_length(&type_name),
                    type_name,
                    default: rows.value(i, "dflt_value").and_then(Value::as_text),
                    primary_key: rows.value(i, "pk").and_then(Value::as_i64).unwrap_or(0) > 0,
                    nullable: rows.value(i, "notnull").and_then(Value::as_i64).unwrap_or(0) == 0,
                }
            })
            .collect())
    }

    async fn index_data(&self, conn: &mut dyn NativeConnection, table: &str) -> Result<Vec<IndexData>, Error> {
        let table = escape_string(self, table, false);
        let sql = format!(
            "SELECT 'PRIMARY' AS indexname, l.name AS fieldname, 'PRIMARY' AS indextype \
             FROM pragma_table_info('{table}') AS l WHERE l.pk <> 0 \
             UNION ALL \
             SELECT sqlite_master.name AS indexname, ii.name AS fieldname, \
             CASE \
             WHEN ti.pk <> 0 AND sqlite_master.name LIKE 'sqlite_autoindex_%' THEN 'PRIMARY' \
             WHEN sqlite_master.sql LIKE '% UNIQUE %' THEN 'UNIQUE' \
             WHEN sqlite_master.sql LIKE '% INDEX %' THEN 'INDEX' \
             ELSE 'UNIQUE' END AS indextype \
             FROM sqlite_master \
             INNER JOIN pragma_index_xinfo(sqlite_master.name) ii ON ii.name IS NOT NULL \
             LEFT JOIN pragma_table_info('{table}') ti ON ti.name = ii.name \
             WHERE sqlite_master.type = 'index' AND sqlite_master.tbl_name = '{table}' COLLATE NOCASE"
        );
        let rows = conn.fetch(&sql).await?;

        let mut indexes: Vec<IndexData> = Vec::new();
        for i in 0..rows.rows.len() {
            let index_type = match rows.text(i, "indextype").as_str() {
                "PRIMARY" => IndexType::Primary,
                "INDEX" => IndexType::Index,
                _ => IndexType::Unique,
            };
            let mut name = rows.text(i, "indexname");
            // The automatic index of a non-integer primary key duplicates the PRIMARY entry.
            if index_type == IndexType::Primary {
                name = "PRIMARY".to_string();
            }
            let field = rows.text(i, "fieldname");

            match indexes.iter_mut().find(|idx| idx.name == name) {
                Some(idx) => {
                    if !idx.fields.contains(&field) {
                        idx.fields.push(field);
                    }
                }
                None => indexes.push(IndexData { name, fields: vec![field], index_type }),
            }
        }
        Ok(indexes)
    }

    async fn foreign_key_data(&self, conn: &mut dyn NativeConnection, table: &str) -> Result<Vec<ForeignKeyData>, Error> {
        let sql = format!("PRAGMA foreign_key_list('{}')", escape_string(self, table, false));
        let rows = conn.fetch(&sql).await?;

        let mut by_id: BTreeMap<i64, ForeignKeyData> = BTreeMap::new();
        for i in 0..rows.rows.len() {
            let id = rows.value(i, "id").and_then(Value::as_i64).unwrap_or(0);
            let entry = by_id.entry(id).or_insert_with(|| ForeignKeyData {
                constraint_name: String::new(),
                table_name: table.to_string(),
                column_name: Vec::new(),
                foreign_table_name: rows.text(i, "table"),
                foreign_column_name: Vec::new(),
                on_delete: rows.value(i, "on_delete").and_then(Value::as_text),
                on_update: rows.value(i, "on_update").and_then(Value::as_text),
                match_type: rows.value(i, "match").and_then(Value::as_text),
            });
            entry.column_name.push(rows.text(i, "from"));
            entry.foreign_column_name.push(rows.text(i, "to"));
        }

        Ok(by_id
            .into_values()
            .map(|mut fk| {
                fk.constraint_name = format!("{}_{}_foreign", table, fk.column_name.join("_"));
                fk
            })
            .collect())
    }

    fn disable_foreign_key_checks_sql(&self) -> &'static str {
        "PRAGMA foreign_keys = OFF"
    }

    fn enable_foreign_key_checks_sql(&self) -> &'static str {
        "PRAGMA foreign_keys = ON"
    }
}

// ============================================================================
// Forge Rules
// ============================================================================

pub struct Sqlite3Forge;

pub static FORGE: Sqlite3Forge = Sqlite3Forge;

impl ForgeRules for Sqlite3Forge {
    fn unsigned_rule(&self) -> UnsignedRule {
        UnsignedRule::Never
    }

    fn attribute_type(&self, field: &mut Field) {
        if matches!(field.sql_type.as_str(), "ENUM" | "SET") {
            field.sql_type = "TEXT".to_string();
            field.constraint = None;
        }
    }

    fn attribute_auto_increment(&self, field: &Field, parts: &mut ColumnParts) -> bool {
        if !field.auto_increment || !field.sql_type.contains("INT") {
            return false;
        }
        parts.type_name = "INTEGER PRIMARY KEY".to_string();
        parts.length.clear();
        parts.null.clear();
        parts.default.clear();
        parts.default_value = None;
        parts.auto_increment = " AUTOINCREMENT".to_string();
        true
    }

    fn unique_key_statement(&self, dialect: &dyn Dialect, table: &str, name: &str, fields: &[String]) -> String {
        let columns: Vec<String> = fields.iter().map(|f| crate::escape::escape_identifiers(dialect, f)).collect();
        format!(
            "CREATE UNIQUE INDEX {} ON {} ({})",
            crate::escape::escape_identifiers(dialect, name),
            table,
            columns.join(", ")
        )
    }

    fn alter_table(
        &self,
        dialect: &dyn Dialect,
        kind: AlterKind,
        table: &str,
        fields: &[ColumnParts],
    ) -> Result<Vec<String>, Error> {
        match kind {
            AlterKind::Add => Ok(fields
                .iter()
                .map(|parts| {
                    let column = parts.literal.clone().unwrap_or_else(|| self.process_column(dialect, parts));
                    format!("ALTER TABLE {} ADD {}", table, column)
                })
                .collect()),
            AlterKind::Change => Err(Error::invalid_argument("SQLite3 cannot modify existing columns.")),
        }
    }

    fn drop_column_statement(&self, _dialect: &dyn Dialect, _table: &str, _columns: &[String]) -> Result<String, Error> {
        Err(Error::invalid_argument("SQLite3 cannot drop columns."))
    }

    fn create_database_statement(&self, _name: &str, _if_not_exists: bool, _charset: &str, _collation: &str) -> Option<String> {
        None
    }

    fn drop_database_statement(&self, _name: &str) -> Option<String> {
        None
    }
}

// ============================================================================
// Connector
// ============================================================================

pub struct Sqlite3Connector;

#[async_trait]
impl Connector for Sqlite3Connector {
    async fn connect(&self, config: &ConnectionConfig, persistent: bool) -> Result<Box<dyn NativeConnection>, Error> {
        if persistent && config.db_debug {
            return Err(Error::connect("SQLite3 doesn't support persistent connections."));
        }

        let mut options = if config.database.is_empty() || config.database == ":memory:" {
            SqliteConnectOptions::from_str("sqlite::memory:").map_err(|e| Error::Connect(e.to_string()))?
        } else {
            SqliteConnectOptions::new().filename(&config.database).create_if_missing(true)
        };

        let foreign_keys = config
            .options
            .get("foreign_keys")
            .map(|v| matches!(v.to_ascii_lowercase().as_str(), "1" | "true" | "on" | "yes"))
            .unwrap_or(false);
        options = options.foreign_keys(foreign_keys);

        if let Some(ms) = config.options.get("busy_timeout").and_then(|v| v.parse::<u64>().ok()) {
            options = options.busy_timeout(Duration::from_millis(ms));
        }

        let conn = SqliteConnection::connect_with(&options).await.map_err(|e| Error::Connect(e.to_string()))?;
        Ok(Box::new(Sqlite3Native { conn, catalog: HashMap::new(), annotating: false }))
    }
}

// ============================================================================
// Native Connection
// ============================================================================

struct Sqlite3Native {
    conn: SqliteConnection,
    /// `PRAGMA TABLE_INFO` rows of tables read so far.
    catalog: HashMap<String, Vec<FieldData>>,
    annotating: bool,
}

impl Sqlite3Native {
    fn row_set(rows: &[SqliteRow]) -> Result<RowSet, Error> {
        let columns = rows.first().map(row_columns).unwrap_or_default();
        let mut values = Vec::with_capacity(rows.len());
        for row in rows {
            values.push(decode_row(row)?);
        }
        Ok(RowSet { columns, rows: values })
    }

    /// Column names of a statement that produced no rows.
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

    /// Marks result columns with the key and nullability flags of the
    /// tables the statement reads from.
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
                    Err(e) => log::debug!("SQLite3: no column flags for {}: {}", table, e),
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

#[async_trait]
impl NativeConnection for Sqlite3Native {
    async fn execute(&mut self, sql: &str) -> Result<ExecResult, Error> {
        let done = (&mut self.conn).execute(sqlx::raw_sql(sql)).await.map_err(native_error(sql))?;
        if is_schema_change(sql) {
            self.catalog.clear();
        }
        Ok(ExecResult { affected_rows: done.rows_affected(), last_insert_id: Some(done.last_insert_rowid()) })
    }

    async fn fetch(&mut self, sql: &str) -> Result<RowSet, Error> {
        let rows = (&mut self.conn).fetch_all(sqlx::raw_sql(sql)).await.map_err(native_error(sql))?;
        let mut set = Self::row_set(&rows)?;
        if rows.is_empty() {
            set.columns = self.describe_columns(sql).await;
        }
        self.annotate(sql, &mut set.columns).await;
        Ok(set)
    }

    async fn prepare(&mut self, sql: &str) -> Result<(), Error> {
        (&mut self.conn).prepare(sql).await.map_err(native_error(sql))?;
        Ok(())
    }

    async fn execute_prepared(&mut self, sql: &str, params: &[Value], read: bool) -> Result<PreparedOutcome, Error> {
        let mut args = SqliteArguments::default();
        args.bind_all(params)?;

        if read {
            let rows = (&mut self.conn).fetch_all(sqlx::query_with(sql, args)).await.map_err(native_error(sql))?;
            let mut set = Self::row_set(&rows)?;
            if rows.is_empty() {
                set.columns = self.describe_columns(sql).await;
            }
            self.annotate(sql, &mut set.columns).await;
            return Ok(PreparedOutcome::Rows(set));
        }

        let done = (&mut self.conn).execute(sqlx::query_with(sql, args)).await.map_err(native_error(sql))?;
        Ok(PreparedOutcome::Write(ExecResult {
            affected_rows: done.rows_affected(),
            last_insert_id: Some(done.last_insert_rowid()),
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

    #[test]
    fn limit_forms() {
        assert_eq!(DIALECT.compile_limit(Some(10), Some(20)), " LIMIT 10 OFFSET 20");
        assert_eq!(DIALECT.compile_limit(Some(10), Some(0)), " LIMIT 10");
        assert_eq!(DIALECT.compile_limit(None, Some(5)), " LIMIT -1 OFFSET 5");
        assert_eq!(DIALECT.compile_limit(None, None), "");
    }

    #[test]
    fn prefix_listing_escapes_underscores() {
        let sql = DIALECT.list_tables_sql(Some("app_"));
        assert!(sql.ends_with("AND \"NAME\" LIKE 'app!_%' ESCAPE '!'"));
        assert!(!DIALECT.list_tables_sql(None).contains("app"));
    }

    #[test]
    fn type_lengths_are_parsed() {
        assert_eq!(type_length("VARCHAR(255)"), Some(255));
        assert_eq!(type_length("DECIMAL(10, 2)"), Some(10));
        assert_eq!(type_length("TEXT"), None);
    }

    #[tokio::test]
    async fn persistent_connections_are_refused_in_debug_mode() {
        let config = ConnectionConfig { driver: "sqlite3".into(), database: ":memory:".into(), ..Default::default() };
        assert!(matches!(Sqlite3Connector.connect(&config, true).await, Err(Error::Connect(_))));

        let quiet = ConnectionConfig { db_debug: false, ..config };
        assert!(Sqlite3Connector.connect(&quiet, true).await.is_ok());
    }

    #[tokio::test]
    async fn native_round_trip() {
        let config = ConnectionConfig { driver: "sqlite3".into(), database: ":memory:".into(), ..Default::default() };
        let mut conn = Sqlite3Connector.connect(&config, false).await.unwrap();

        conn.execute("CREATE TABLE t (id INTEGER PRIMARY KEY, name TEXT)").await.unwrap();
        let ack = conn.execute("INSERT INTO t (name) VALUES ('a')").await.unwrap();
        assert_eq!(ack, ExecResult { affected_rows: 1, last_insert_id: Some(1) });

        let rows = conn.fetch("SELECT id, name FROM t").await.unwrap();
        assert_eq!(rows.rows, vec![vec![Value::Int(1), Value::from("a")]]);

        let empty = conn.fetch("SELECT id, name FROM t WHERE id = 99").await.unwrap();
        assert!(empty.rows.is_empty());
        assert_eq!(empty.columns.len(), 2);

        let outcome = conn.execute_prepared("SELECT name FROM t WHERE id = ?", &[Value::Int(1)], true).await.unwrap();
        match outcome {
            PreparedOutcome::Rows(set) => assert_eq!(set.text(0, "name"), "a"),
            other => panic!("unexpected outcome {:?}", other),
        }
        conn.close().await.unwrap();
    }
}
