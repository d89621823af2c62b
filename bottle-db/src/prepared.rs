//! # Prepared Query Module
//!
//! Server-side prepared statements, executed any number of times with
//! positional values.
//!
//! Templates may use `?` markers or named markers (`:name` and `:name:`), which
//! are all turned into positional markers in order of appearance. Postgre gets
//! `$1, $2, ...`. Markers inside single-quoted literals and `::` casts are left
//! alone.
//!
//! ## States
//!
//! ```text
//! Unprepared ──prepare──> Prepared ──close──> Closed
//!      └──────(backend refused, debug off)──> PrepareFailed
//! ```
//!
//! ## Example Usage
//!
//! ```rust,ignore
//! let mut stmt = conn.prepare("INSERT INTO users (name, email) VALUES (:name:, :email:)").await?;
//! stmt.execute(vec!["Ada", "ada@example.com"]).await?;
//! stmt.execute(vec!["Grace", "grace@example.com"]).await?;
//! stmt.close().await?;
//! ```

use crate::{
    Error,
    connection::Connection,
    drivers::{PlaceholderStyle, PreparedOutcome},
    query::{Binds, Query, is_write_type},
    result::{Outcome, ResultSet, WriteAck},
    value::Value,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PreparedState {
    Unprepared,
    Prepared,
    /// The backend refused the statement while debug mode was off.
    PrepareFailed,
    Closed,
}

/// Rewrites named markers to `?`, skipping quoted literals and `::` casts.
pub(crate) fn to_positional(sql: &str) -> String {
    let mut out = String::with_capacity(sql.len());
    let mut chars = sql.chars().peekable();
    let mut in_literal = false;

    while let Some(c) = chars.next() {
        if c == '\'' {
            in_literal = !in_literal;
            out.push(c);
            continue;
        }
        if in_literal || c != ':' {
            out.push(c);
            continue;
        }

        match chars.peek() {
            Some(':') => {
                chars.next();
                out.push_str("::");
            }
            Some(n) if n.is_ascii_alphabetic() || *n == '_' => {
                while chars.peek().is_some_and(|n| n.is_ascii_alphanumeric() || *n == '_') {
                    chars.next();
                }
                if chars.peek() == Some(&':') {
                    chars.next();
                }
                out.push('?');
            }
            _ => out.push(c),
        }
    }
    out
}

/// Numbers `?` markers outside literals as `$1, $2, ...`.
pub(crate) fn to_dollar(sql: &str) -> (String, usize) {
    let mut out = String::with_capacity(sql.len() + 8);
    let mut in_literal = false;
    let mut count = 0;

    for c in sql.chars() {
        match c {
            '\'' => {
                in_literal = !in_literal;
                out.push(c);
            }
            '?' if !in_literal => {
                count += 1;
                out.push('$');
                out.push_str(&count.to_string());
            }
            _ => out.push(c),
        }
    }
    (out, count)
}

/// A statement prepared on a connection.
pub struct PreparedQuery<'c> {
    conn: &'c mut Connection,
    state: PreparedState,
    /// Template with `?` markers.
    sql: String,
    /// What the backend prepared.
    native_sql: String,
    param_count: usize,
    is_write: bool,
    error: Option<(Option<String>, String)>,
}

impl<'c> PreparedQuery<'c> {
    /// Prepares `sql` on the connection.
    ///
    /// # Errors
    ///
    /// The backend error when it refuses the statement and debug mode is on.
    /// With debug mode off the statement is returned in the `PrepareFailed`
    /// state, its error available through `get_error_message`.
    pub(crate) async fn prepare(conn: &'c mut Connection, sql: &str) -> Result<Self, Error> {
        let mut template = to_positional(sql);
        let config = conn.config();
        if !config.swap_pre.is_empty() && !config.prefix.is_empty() {
            template = crate::query::swap_prefix(&template, &config.swap_pre, &config.prefix)?;
        }

        let dialect = conn.dialect();
        let (native_sql, param_count) = match dialect.placeholder_style() {
            PlaceholderStyle::Dollar => to_dollar(&template),
            PlaceholderStyle::Question => {
                let count = to_dollar(&template).1;
                (template.clone(), count)
            }
        };
        let is_write = dialect.classify_write(&template, is_write_type(&template));

        let mut prepared = Self {
            conn,
            state: PreparedState::Unprepared,
            sql: template,
            native_sql,
            param_count,
            is_write,
            error: None,
        };

        if prepared.conn.is_pretending() {
            prepared.state = PreparedState::Prepared;
            return Ok(prepared);
        }

        prepared.conn.ensure_connected().await?;
        let result = prepared.conn.handle_mut()?.prepare(&prepared.native_sql).await;

        match result {
            Ok(()) => {
                log::debug!("[{}] prepared {}", prepared.conn.driver(), prepared.native_sql);
                prepared.state = PreparedState::Prepared;
                Ok(prepared)
            }
            Err(err) if prepared.conn.is_debug() => Err(err),
            Err(err) => {
                log::error!("[{}] {} preparing {}", prepared.conn.driver(), err, prepared.native_sql);
                prepared.error = Some(err.code_and_message());
                prepared.state = PreparedState::PrepareFailed;
                Ok(prepared)
            }
        }
    }

    /// Runs the statement with `params`, one per marker.
    ///
    /// # Errors
    ///
    /// - `Error::InvalidArgument` after `close()` or for a wrong parameter count
    /// - the backend error when execution fails and debug mode is on;
    ///   otherwise `Outcome::Failed`
    pub async fn execute<I, V>(&mut self, params: I) -> Result<Outcome, Error>
    where
        I: IntoIterator<Item = V>,
        V: Into<Value>,
    {
        let params: Vec<Value> = params.into_iter().map(Into::into).collect();
        let dialect = self.conn.dialect();

        match self.state {
            PreparedState::Closed => {
                return Err(Error::invalid_argument("The prepared query has been closed."));
            }
            PreparedState::Unprepared => {
                return Err(Error::invalid_argument("The query has not been prepared."));
            }
            PreparedState::PrepareFailed => {
                let mut query = Query::new(self.sql.clone(), (), dialect)?;
                let (code, message) = self.error.clone().unwrap_or_default();
                query.set_error(code, message);
                return Ok(Outcome::Failed(query));
            }
            PreparedState::Prepared => {}
        }

        if params.len() != self.param_count {
            return Err(Error::InvalidArgument(format!(
                "The prepared query expects {} parameters, {} given.",
                self.param_count,
                params.len()
            )));
        }

        // Binary values cannot be rendered into the logged query.
        let mut query = Query::new(self.sql.clone(), Binds::positional(params.clone()), dialect)
            .or_else(|_| Query::new(self.sql.clone(), (), dialect))?;

        if self.conn.is_pretending() {
            return Ok(Outcome::Pretend(query));
        }

        self.conn.ensure_connected().await?;
        query.mark_start();
        let result = self.conn.handle_mut()?.execute_prepared(&self.native_sql, &params, !self.is_write).await;
        query.mark_end();

        match result {
            Ok(outcome) => {
                log::debug!("[{}] {} ({}s)", self.conn.driver(), query.get_query(), query.get_duration(6));
                self.error = None;
                self.conn.record_query(query);
                Ok(match outcome {
                    PreparedOutcome::Rows(rows) => Outcome::Rows(ResultSet::new(rows)),
                    PreparedOutcome::Write(ack) => {
                        self.conn.record_ack(ack);
                        Outcome::Write(WriteAck { affected_rows: ack.affected_rows, insert_id: ack.last_insert_id })
                    }
                })
            }
            Err(err) => {
                let (code, message) = err.code_and_message();
                query.set_error(code.clone(), message.clone());
                self.error = Some((code, message));
                self.conn.record_query(query.clone());

                if self.conn.is_debug() {
                    return Err(err);
                }
                log::error!("[{}] {} in {}", self.conn.driver(), err, query.get_query());
                Ok(Outcome::Failed(query))
            }
        }
    }

    /// Releases the statement. Further `execute` calls fail.
    pub async fn close(&mut self) -> Result<(), Error> {
        if self.state == PreparedState::Prepared && !self.conn.is_pretending() && self.conn.is_connected() {
            self.conn.handle_mut()?.deallocate(&self.native_sql).await?;
        }
        self.state = PreparedState::Closed;
        Ok(())
    }

    /// The template with `?` markers.
    pub fn get_query_string(&self) -> &str {
        &self.sql
    }

    pub fn state(&self) -> PreparedState {
        self.state
    }

    pub fn has_error(&self) -> bool {
        self.error.is_some()
    }

    pub fn get_error_code(&self) -> Option<&str> {
        self.error.as_ref().and_then(|(code, _)| code.as_deref())
    }

    pub fn get_error_message(&self) -> Option<&str> {
        self.error.as_ref().map(|(_, message)| message.as_str())
    }
}
