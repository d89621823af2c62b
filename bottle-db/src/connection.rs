//! # Connection Module
//!
//! A `Connection` owns one native handle and everything scoped to it:
//! transaction depth, the data cache (server version, table names), the last
//! query and the write acknowledgement of the last statement.
//!
//! ## Lifecycle
//!
//! - Created unconnected from a resolved `ConnectionConfig`
//! - `initialize()` tries the primary config, then each failover candidate in
//!   order, stopping at the first success
//! - `close()` releases the handle and resets transaction depth
//! - `reconnect()` brings a closed or dropped connection back
//!
//! Queries on an unconnected `Connection` initialize it first.
//!
//! ## Example Usage
//!
//! ```rust,ignore
//! let mut conn = Connection::new(ConnectionConfig::from_dsn("sqlite::memory:")?)?;
//!
//! conn.query("CREATE TABLE users (id INTEGER PRIMARY KEY, name TEXT)", ()).await?;
//! conn.query("INSERT INTO users (name) VALUES (?)", vec!["Ada"]).await?;
//!
//! let rows = conn.query("SELECT * FROM users", ()).await?.into_result()?;
//! ```

use std::{
    fmt,
    time::{Duration, Instant},
};

use chrono::{DateTime, Utc};
use futures::future::BoxFuture;

use crate::{
    Error,
    config::ConnectionConfig,
    database::Drivers,
    drivers::{Connector, Dialect, ExecResult, NativeConnection, RowSet},
    escape::{self, Identifiers},
    forge::Forge,
    prepared::PreparedQuery,
    query::{Binds, Query},
    query_builder::Builder,
    result::{Outcome, ResultSet, WriteAck},
    transaction::TransactionState,
    value::Value,
};

/// Values computed once per connection.
#[derive(Debug, Clone, Default)]
pub(crate) struct DataCache {
    pub version: Option<String>,
    pub table_names: Option<Vec<String>>,
}

/// A database connection bound to one driver.
pub struct Connection {
    driver: Drivers,
    dialect: &'static dyn Dialect,
    connector: Box<dyn Connector>,
    config: ConnectionConfig,
    active_config: Option<ConnectionConfig>,
    handle: Option<Box<dyn NativeConnection>>,
    pub(crate) trans: TransactionState,
    pub(crate) data_cache: DataCache,
    connect_time: Option<DateTime<Utc>>,
    connect_duration: Option<Duration>,
    last_query: Option<Query>,
    last_ack: ExecResult,
    query_count: usize,
    pretend: bool,
}

impl fmt::Debug for Connection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Connection")
            .field("driver", &self.driver)
            .field("hostname", &self.config.hostname)
            .field("database", &self.config.database)
            .field("connected", &self.handle.is_some())
            .field("trans_depth", &self.trans.depth)
            .finish()
    }
}

impl Connection {
    // ========================================================================
    // Construction
    // ========================================================================

    /// Creates an unconnected connection. The config is resolved (DSN applied)
    /// and its driver tag selects the native connector.
    pub fn new(config: ConnectionConfig) -> Result<Self, Error> {
        let resolved = config.resolve()?;
        let driver = Drivers::from_tag(&resolved.driver)?;
        Ok(Self::build(driver, driver.connector(), resolved))
    }

    /// Creates an unconnected connection with a custom native connector.
    pub fn with_connector(config: ConnectionConfig, connector: Box<dyn Connector>) -> Result<Self, Error> {
        let resolved = config.resolve()?;
        let driver = Drivers::from_tag(&resolved.driver)?;
        Ok(Self::build(driver, connector, resolved))
    }

    fn build(driver: Drivers, connector: Box<dyn Connector>, config: ConnectionConfig) -> Self {
        Self {
            driver,
            dialect: driver.dialect(),
            connector,
            config,
            active_config: None,
            handle: None,
            trans: TransactionState::default(),
            data_cache: DataCache::default(),
            connect_time: None,
            connect_duration: None,
            last_query: None,
            last_ack: ExecResult::default(),
            query_count: 0,
            pretend: false,
        }
    }

    // ========================================================================
    // Accessors
    // ========================================================================

    pub fn driver(&self) -> Drivers {
        self.driver
    }

    /// Driver tag, e.g. `"postgre"`.
    pub fn get_platform(&self) -> &'static str {
        self.driver.tag()
    }

    pub fn dialect(&self) -> &'static dyn Dialect {
        self.dialect
    }

    /// The resolved primary config.
    pub fn config(&self) -> &ConnectionConfig {
        &self.config
    }

    /// The config of the candidate that actually connected.
    pub fn active_config(&self) -> Option<&ConnectionConfig> {
        self.active_config.as_ref()
    }

    pub fn get_database(&self) -> &str {
        self.active_config.as_ref().map(|c| c.database.as_str()).unwrap_or(&self.config.database)
    }

    pub fn get_prefix(&self) -> &str {
        &self.config.prefix
    }

    /// Replaces the table prefix, returning the previous one.
    pub fn set_prefix(&mut self, prefix: &str) -> String {
        std::mem::replace(&mut self.config.prefix, prefix.to_string())
    }

    pub fn is_debug(&self) -> bool {
        self.config.db_debug
    }

    pub fn is_connected(&self) -> bool {
        self.handle.is_some()
    }

    /// When the last connect started.
    pub fn connect_time(&self) -> Option<DateTime<Utc>> {
        self.connect_time
    }

    /// How long the last connect took, in seconds with `decimals` digits.
    pub fn connect_duration(&self, decimals: usize) -> String {
        let secs = self.connect_duration.map(|d| d.as_secs_f64()).unwrap_or(0.0);
        format!("{:.*}", decimals, secs)
    }

    pub fn last_query(&self) -> Option<&Query> {
        self.last_query.as_ref()
    }

    /// Number of statements sent to the backend.
    pub fn query_count(&self) -> usize {
        self.query_count
    }

    /// Rows affected by the last write.
    pub fn affected_rows(&self) -> u64 {
        self.last_ack.affected_rows
    }

    /// When set, queries are compiled and returned as `Outcome::Pretend`
    /// without reaching the backend.
    pub fn pretend(&mut self, pretend: bool) -> &mut Self {
        self.pretend = pretend;
        self
    }

    pub fn is_pretending(&self) -> bool {
        self.pretend
    }

    // ========================================================================
    // Lifecycle
    // ========================================================================

    /// Connects to the primary config or, failing that, the first failover
    /// candidate that accepts the connection.
    ///
    /// Does nothing when a handle is already open.
    ///
    /// # Errors
    ///
    /// `Error::UnableToConnect` listing every failed attempt.
    pub async fn initialize(&mut self) -> Result<(), Error> {
        if self.handle.is_some() {
            return Ok(());
        }

        let started = Instant::now();
        self.connect_time = Some(Utc::now());
        let mut attempts = Vec::new();

        match self.connector.connect(&self.config, self.config.pconnect).await {
            Ok(handle) => {
                self.handle = Some(handle);
                self.active_config = Some(self.config.clone());
            }
            Err(err) => {
                let msg = format!("Main connection [{}]: {}", self.driver, err);
                log::error!("{}", msg);
                attempts.push(msg);
            }
        }

        if self.handle.is_none() {
            for (idx, candidate) in self.config.failover.iter().enumerate() {
                let number = idx + 1;
                let outcome = match candidate.inherit_from(&self.config).resolve() {
                    Ok(resolved) => self
                        .connector
                        .connect(&resolved, resolved.pconnect)
                        .await
                        .map(|handle| (handle, resolved)),
                    Err(err) => Err(err),
                };

                match outcome {
                    Ok((handle, resolved)) => {
                        log::info!("Connected to failover #{} [{}] at {}", number, self.driver, resolved.hostname);
                        self.handle = Some(handle);
                        self.active_config = Some(resolved);
                        break;
                    }
                    Err(err) => {
                        let msg = format!("Failover #{} [{}]: {}", number, self.driver, err);
                        log::error!("{}", msg);
                        attempts.push(msg);
                    }
                }
            }
        }

        if self.handle.is_none() {
            return Err(Error::UnableToConnect { attempts });
        }

        self.connect_duration = Some(started.elapsed());
        Ok(())
    }

    /// Single native connect attempt against the primary config, replacing
    /// any open handle. Failover candidates are not consulted.
    ///
    /// Returns `Ok(false)` instead of an error when debug mode is off.
    pub async fn connect(&mut self, persistent: bool) -> Result<bool, Error> {
        self.close().await?;

        let started = Instant::now();
        self.connect_time = Some(Utc::now());

        match self.connector.connect(&self.config, persistent).await {
            Ok(handle) => {
                self.handle = Some(handle);
                self.active_config = Some(self.config.clone());
                self.connect_duration = Some(started.elapsed());
                Ok(true)
            }
            Err(err) if self.config.db_debug => Err(err),
            Err(err) => {
                log::error!("Main connection [{}]: {}", self.driver, err);
                Ok(false)
            }
        }
    }

    /// `connect(true)`.
    pub async fn persistent_connect(&mut self) -> Result<bool, Error> {
        self.connect(true).await
    }

    /// Releases the native handle and resets transaction depth.
    ///
    /// The config is kept, so the connection can be initialized again.
    pub async fn close(&mut self) -> Result<(), Error> {
        self.trans.depth = 0;
        self.trans.rollback_only = false;

        if let Some(handle) = self.handle.take() {
            handle.close().await?;
            log::debug!("Closed {} connection", self.driver);
        }
        Ok(())
    }

    /// Keeps a live handle, otherwise closes and initializes again.
    pub async fn reconnect(&mut self) -> Result<(), Error> {
        if let Some(handle) = self.handle.as_mut() {
            if handle.ping().await.is_ok() {
                return Ok(());
            }
        }
        self.close().await?;
        self.initialize().await
    }

    pub(crate) async fn ensure_connected(&mut self) -> Result<(), Error> {
        if self.handle.is_none() {
            self.initialize().await?;
        }
        Ok(())
    }

    pub(crate) fn handle_mut(&mut self) -> Result<&mut dyn NativeConnection, Error> {
        match self.handle.as_deref_mut() {
            Some(handle) => Ok(handle),
            None => Err(Error::connect("no open connection")),
        }
    }

    // ========================================================================
    // Query Execution
    // ========================================================================

    /// Binds and runs a statement.
    ///
    /// Writes return `Outcome::Write`, everything else `Outcome::Rows`.
    ///
    /// # Errors
    ///
    /// - `Error::Escape` when a bind cannot be escaped, always
    /// - `Error::Execution` when the backend rejects the statement and debug
    ///   mode is on; otherwise the failure is logged and `Outcome::Failed`
    ///   carries the query with its error code and message
    ///
    /// A failure inside a transaction marks the transaction failed. It is
    /// never rolled back automatically.
    pub async fn query(&mut self, sql: &str, binds: impl Into<Binds>) -> Result<Outcome, Error> {
        let mut query = Query::new(sql, binds, self.dialect)?;

        if !self.config.swap_pre.is_empty() && !self.config.prefix.is_empty() {
            query.swap_prefix(&self.config.swap_pre, &self.config.prefix)?;
        }

        self.run(query).await
    }

    /// Runs an already compiled query.
    pub async fn run(&mut self, mut query: Query) -> Result<Outcome, Error> {
        if self.pretend {
            self.last_query = Some(query.clone());
            return Ok(Outcome::Pretend(query));
        }

        self.ensure_connected().await?;

        let sql = self.dialect.prepare_for_execution(query.get_query());
        let is_write = query.is_write_type();

        query.mark_start();
        let result = {
            let handle = self.handle_mut()?;
            if is_write {
                handle.execute(&sql).await.map(NativeOutcome::Write)
            } else {
                handle.fetch(&sql).await.map(NativeOutcome::Rows)
            }
        };
        query.mark_end();
        self.query_count += 1;

        match result {
            Ok(outcome) => {
                log::debug!("[{}] {} ({}s)", self.driver, sql, query.get_duration(6));
                self.last_query = Some(query);
                Ok(match outcome {
                    NativeOutcome::Write(ack) => {
                        self.last_ack = ack;
                        Outcome::Write(WriteAck { affected_rows: ack.affected_rows, insert_id: ack.last_insert_id })
                    }
                    NativeOutcome::Rows(rows) => Outcome::Rows(ResultSet::new(rows)),
                })
            }
            Err(err) => {
                let (code, message) = err.code_and_message();
                query.set_error(code, message);
                self.last_query = Some(query.clone());

                if self.trans.depth > 0 {
                    self.trans.status = false;
                }

                if self.config.db_debug {
                    return Err(err);
                }

                log::error!("[{}] {} in {}", self.driver, err, query.get_query());
                Ok(Outcome::Failed(query))
            }
        }
    }

    /// Runs SQL as-is: no binding, no pretend mode, no logging and no
    /// debug-flag handling. Errors are always returned.
    pub async fn simple_query(&mut self, sql: &str) -> Result<Outcome, Error> {
        self.ensure_connected().await?;
        let dialect = self.dialect;
        let handle = self.handle_mut()?;

        if dialect.classify_write(sql, crate::query::is_write_type(sql)) {
            let ack = handle.execute(sql).await?;
            Ok(Outcome::Write(WriteAck { affected_rows: ack.affected_rows, insert_id: ack.last_insert_id }))
        } else {
            Ok(Outcome::Rows(ResultSet::new(handle.fetch(sql).await?)))
        }
    }

    /// Fetches rows for an internal catalog query.
    pub(crate) async fn fetch_internal(&mut self, sql: &str) -> Result<RowSet, Error> {
        self.ensure_connected().await?;
        self.query_count += 1;
        self.handle_mut()?.fetch(sql).await
    }

    /// Runs an internal statement that returns no rows.
    pub(crate) async fn execute_internal(&mut self, sql: &str) -> Result<ExecResult, Error> {
        self.ensure_connected().await?;
        self.query_count += 1;
        log::debug!("[{}] {}", self.driver, sql);
        self.handle_mut()?.execute(sql).await
    }

    /// Books a statement run outside `run` (prepared executions).
    pub(crate) fn record_query(&mut self, query: Query) {
        self.query_count += 1;
        if query.has_error() && self.trans.depth > 0 {
            self.trans.status = false;
        }
        self.last_query = Some(query);
    }

    pub(crate) fn record_ack(&mut self, ack: ExecResult) {
        self.last_ack = ack;
    }

    pub(crate) fn last_ack(&self) -> ExecResult {
        self.last_ack
    }

    // ========================================================================
    // Escaping
    // ========================================================================

    /// Renders a value as a SQL literal.
    pub fn escape(&self, value: impl Into<Value>) -> Result<String, Error> {
        escape::escape_value(self.dialect, &value.into())
    }

    /// Escapes a string body, optionally for use inside LIKE.
    pub fn escape_string(&self, value: &str, like: bool) -> String {
        escape::escape_string(self.dialect, value, like)
    }

    pub fn escape_like_string(&self, value: &str) -> String {
        escape::escape_string(self.dialect, value, true)
    }

    /// Quotes an identifier, each dotted segment independently.
    pub fn escape_identifiers(&self, item: &str) -> String {
        escape::escape_identifiers(self.dialect, item)
    }

    /// Prefixes and quotes a table or column reference.
    pub fn protect_identifiers(&self, item: &str, prefix_single: bool, field_exists: bool) -> String {
        self.identifiers(&[]).protect(item, prefix_single, true, field_exists)
    }

    pub(crate) fn identifiers<'a>(&'a self, aliased_tables: &'a [String]) -> Identifiers<'a> {
        Identifiers {
            dialect: self.dialect,
            prefix: &self.config.prefix,
            swap_pre: &self.config.swap_pre,
            aliased_tables,
        }
    }

    /// Adds the table prefix to a table name.
    ///
    /// # Errors
    ///
    /// `Error::InvalidArgument` for an empty name.
    pub fn prefix_table(&self, table: &str) -> Result<String, Error> {
        if table.is_empty() {
            return Err(Error::invalid_argument("A table name is required for that operation."));
        }
        Ok(format!("{}{}", self.config.prefix, table))
    }

    // ========================================================================
    // Companions
    // ========================================================================

    /// Starts a builder on `table` (`"users"`, `"users u"`, `"a, b"`).
    ///
    /// ```rust,ignore
    /// let rows = conn.table("users")?.where_("active", true).get().await?;
    /// ```
    pub fn table(&mut self, table: &str) -> Result<Builder<'_>, Error> {
        Builder::new(self, table)
    }

    /// Starts a schema builder.
    pub fn forge(&mut self) -> Forge<'_> {
        Forge::new(self)
    }

    /// Prepares a statement written with `?` or `:name` placeholders.
    pub async fn prepare(&mut self, sql: &str) -> Result<PreparedQuery<'_>, Error> {
        PreparedQuery::prepare(self, sql).await
    }

    /// Prepares the statement a builder callback would run.
    ///
    /// The callback runs in pretend mode. Its query template, with the
    /// builder's named placeholders, becomes the prepared statement.
    ///
    /// ```rust,ignore
    /// let mut stmt = conn
    ///     .prepare_with(|db| Box::pin(async move {
    ///         db.table("users")?.insert([("name", "x"), ("email", "y")]).await
    ///     }))
    ///     .await?;
    /// stmt.execute(vec!["Ada", "ada@example.com"]).await?;
    /// ```
    pub async fn prepare_with<F>(&mut self, callback: F) -> Result<PreparedQuery<'_>, Error>
    where
        F: for<'a> FnOnce(&'a mut Connection) -> BoxFuture<'a, Result<Outcome, Error>>,
    {
        let previous = self.pretend;
        self.pretend = true;
        let outcome = callback(self).await;
        self.pretend = previous;

        match outcome? {
            Outcome::Pretend(query) => {
                let template = query.get_original_query().to_string();
                PreparedQuery::prepare(self, &template).await
            }
            _ => Err(Error::invalid_argument("the prepare callback must return the query it built")),
        }
    }
}

enum NativeOutcome {
    Rows(RowSet),
    Write(ExecResult),
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::drivers::mock::{MockConnector, MockLog};

    fn config(host: &str) -> ConnectionConfig {
        ConnectionConfig {
            driver: "mysqli".to_string(),
            hostname: host.to_string(),
            database: "app".to_string(),
            ..ConnectionConfig::default()
        }
    }

    fn mock_connection(log: &MockLog) -> Connection {
        Connection::with_connector(config("primary"), Box::new(MockConnector::new(log.clone()))).unwrap()
    }

    #[tokio::test]
    async fn failover_uses_first_working_candidate() {
        let log = MockLog::default();
        let mut connector = MockConnector::new(log.clone());
        connector.failing_hosts = vec!["primary".to_string()];

        let mut cfg = config("primary");
        cfg.failover = vec![config("replica")];
        let mut conn = Connection::with_connector(cfg, Box::new(connector)).unwrap();

        conn.initialize().await.unwrap();

        assert_eq!(log.connects(), vec![("primary".to_string(), false), ("replica".to_string(), true)]);
        assert_eq!(conn.active_config().unwrap().hostname, "replica");
        assert_eq!(conn.active_config().unwrap().database, "app");
    }

    #[tokio::test]
    async fn exhausted_candidates_report_every_attempt() {
        let log = MockLog::default();
        let mut connector = MockConnector::new(log.clone());
        connector.failing_hosts = vec!["primary".to_string(), "replica".to_string()];

        let mut cfg = config("primary");
        cfg.failover = vec![config("replica")];
        let mut conn = Connection::with_connector(cfg, Box::new(connector)).unwrap();

        match conn.initialize().await {
            Err(Error::UnableToConnect { attempts }) => {
                assert_eq!(attempts.len(), 2);
                assert!(attempts[0].starts_with("Main connection [MySQLi]"));
                assert!(attempts[1].starts_with("Failover #1 [MySQLi]"));
            }
            other => panic!("unexpected {:?}", other),
        }
        assert!(!conn.is_connected());
    }

    #[tokio::test]
    async fn queries_initialize_lazily_and_classify_writes() {
        let log = MockLog::default();
        let mut conn = mock_connection(&log);

        let outcome = conn.query("UPDATE t SET a = ? WHERE id = ?", vec![1, 2]).await.unwrap();
        assert!(matches!(outcome, Outcome::Write(WriteAck { affected_rows: 1, .. })));
        assert_eq!(log.statements(), vec!["UPDATE t SET a = 1 WHERE id = 2"]);

        let outcome = conn.query("SELECT 1", ()).await.unwrap();
        assert!(matches!(outcome, Outcome::Rows(_)));
        assert_eq!(conn.query_count(), 2);
        assert_eq!(conn.last_query().unwrap().get_query(), "SELECT 1");
    }

    #[tokio::test]
    async fn failures_respect_debug_flag() {
        let log = MockLog::default();
        let mut connector = MockConnector::new(log.clone());
        connector.failing_sql = Some("BROKEN".to_string());

        let mut cfg = config("primary");
        cfg.db_debug = false;
        let mut conn = Connection::with_connector(cfg, Box::new(connector)).unwrap();

        match conn.query("SELECT BROKEN", ()).await.unwrap() {
            Outcome::Failed(q) => {
                assert_eq!(q.get_error_code(), Some("42000"));
                assert_eq!(q.get_error_message(), Some("syntax error"));
            }
            other => panic!("unexpected {:?}", other),
        }

        let log = MockLog::default();
        let mut connector = MockConnector::new(log.clone());
        connector.failing_sql = Some("BROKEN".to_string());
        let mut conn = Connection::with_connector(config("primary"), Box::new(connector)).unwrap();
        assert!(matches!(conn.query("SELECT BROKEN", ()).await, Err(Error::Execution { .. })));
    }

    #[tokio::test]
    async fn escape_errors_are_never_downgraded() {
        let log = MockLog::default();
        let mut cfg = config("primary");
        cfg.db_debug = false;
        let mut conn = Connection::with_connector(cfg, Box::new(MockConnector::new(log.clone()))).unwrap();

        let res = conn.query("INSERT INTO t VALUES (?)", vec![Value::Bytes(vec![1])]).await;
        assert!(matches!(res, Err(Error::Escape(_))));
        assert!(log.statements().is_empty());
    }

    #[tokio::test]
    async fn pretend_mode_skips_the_backend() {
        let log = MockLog::default();
        let mut conn = mock_connection(&log);
        conn.pretend(true);

        let outcome = conn.query("DELETE FROM t WHERE id = ?", vec![3]).await.unwrap();
        match outcome {
            Outcome::Pretend(q) => assert_eq!(q.get_query(), "DELETE FROM t WHERE id = 3"),
            other => panic!("unexpected {:?}", other),
        }
        assert!(log.connects().is_empty());
    }

    #[tokio::test]
    async fn close_releases_handle_and_allows_reconnect() {
        let log = MockLog::default();
        let mut conn = mock_connection(&log);
        conn.initialize().await.unwrap();
        conn.trans_begin(false).await.unwrap();

        conn.close().await.unwrap();
        assert!(!conn.is_connected());
        assert_eq!(conn.trans_depth(), 0);
        assert_eq!(log.count("CLOSE"), 1);

        conn.reconnect().await.unwrap();
        assert!(conn.is_connected());
        assert_eq!(log.connects().len(), 2);
    }

    #[test]
    fn prefix_and_identifier_helpers() {
        let log = MockLog::default();
        let mut cfg = config("primary");
        cfg.prefix = "app_".to_string();
        let conn = Connection::with_connector(cfg, Box::new(MockConnector::new(log))).unwrap();

        assert_eq!(conn.prefix_table("users").unwrap(), "app_users");
        assert!(matches!(conn.prefix_table(""), Err(Error::InvalidArgument(_))));
        assert_eq!(conn.protect_identifiers("users.id", false, true), "`app_users`.`id`");
        assert_eq!(conn.escape_identifiers("db.users"), "`db`.`users`");
        assert_eq!(conn.escape("O'Reilly").unwrap(), "'O\\'Reilly'");
    }

    #[tokio::test]
    async fn swap_prefix_applies_to_raw_queries() {
        let log = MockLog::default();
        let mut cfg = config("primary");
        cfg.prefix = "ci_".to_string();
        cfg.swap_pre = "db_".to_string();
        let mut conn = Connection::with_connector(cfg, Box::new(MockConnector::new(log.clone()))).unwrap();

        conn.query("SELECT * FROM db_users WHERE db_users.id = 1", ()).await.unwrap();
        assert_eq!(log.statements(), vec!["SELECT * FROM ci_users WHERE ci_users.id = 1"]);
    }
}
