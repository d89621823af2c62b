//! # Error Handling Module
//!
//! This module defines the error types used throughout Bottle DB.
//! Every failure surfaced by a connection, builder, prepared query or forge
//! is one of the variants below, so callers match on a single enum.
//!
//! ## Error Types
//!
//! - **Config**: Malformed DSN, unknown driver, missing required field
//! - **UnableToConnect**: The primary config and every failover candidate failed
//! - **Connect**: A single native connect attempt failed
//! - **Execution**: The backend rejected a statement (code and message captured)
//! - **Escape**: A value cannot be rendered safely into SQL text
//! - **InvalidArgument**: Programming errors (empty table name, execute after close)
//! - **Decode**: A result row does not deserialize into the requested type
//! - **DatabaseError**: Wrapped sqlx errors that escaped classification
//!
//! ## Example Usage
//!
//! ```rust,ignore
//! use bottle_db::Error;
//!
//! match conn.query("SELEC 1", ()).await {
//!     Ok(outcome) => println!("{:?}", outcome),
//!     Err(Error::Execution { code, message, .. }) => {
//!         eprintln!("backend said {:?}: {}", code, message)
//!     }
//!     Err(e) => eprintln!("Other error: {}", e),
//! }
//! ```

// ============================================================================
// External Crate Imports
// ============================================================================

use thiserror::Error;

// ============================================================================
// Error Enum Definition
// ============================================================================

/// The main error type for Bottle DB operations.
///
/// The debug flag of a connection (`db_debug`) decides whether execution and
/// connect failures are returned as one of these variants or logged and turned
/// into a failure sentinel. `Escape` is never downgraded.
///
/// # Display Format
///
/// - `Config`: "Configuration error: {message}"
/// - `UnableToConnect`: "Unable to connect to the database." followed by one line per attempt
/// - `Execution`: "Query error {code}: {message}"
#[derive(Error, Debug)]
pub enum Error {
    /// Configuration error.
    ///
    /// Raised while loading or resolving configuration, before any native
    /// connect call is made.
    ///
    /// # When to Use
    ///
    /// - Malformed DSN strings
    /// - Unknown driver tags
    /// - Unreadable or malformed configuration files
    /// - A named connection group that does not exist
    #[error("Configuration error: {0}")]
    Config(String),

    /// Every connection candidate failed.
    ///
    /// `attempts` holds one entry per failed candidate in the order they were
    /// tried, e.g. `"Main connection [MySQLi]: Access denied"` and
    /// `"Failover #1 [MySQLi]: Connection refused"`.
    #[error("Unable to connect to the database.\n{}", attempts.join("\n"))]
    UnableToConnect {
        /// Messages collected from each failed attempt.
        attempts: Vec<String>,
    },

    /// A single native connect attempt failed.
    ///
    /// Also used when an encrypted connection was requested but the backend
    /// negotiated a plain one.
    #[error("Connection error: {0}")]
    Connect(String),

    /// The backend rejected a statement.
    ///
    /// The backend code and message are captured before wrapping, together
    /// with the SQL that was sent.
    ///
    /// # Example
    ///
    /// ```rust,ignore
    /// match conn.query("INSERT INTO users (id) VALUES (1)", ()).await {
    ///     Err(Error::Execution { code: Some(code), .. }) if code == "23505" => {
    ///         eprintln!("duplicate key");
    ///     }
    ///     other => { other?; }
    /// }
    /// ```
    #[error("Query error {}: {message}", code.as_deref().unwrap_or("-"))]
    Execution {
        /// Backend error code (SQLSTATE or vendor code), when available.
        code: Option<String>,
        /// Backend error message.
        message: String,
        /// The statement that failed.
        sql: String,
    },

    /// Escape error.
    ///
    /// Raised when a value cannot be rendered into SQL text safely: binary
    /// data, non-finite floats or nested lists. Always fatal.
    #[error("Escape error: {0}")]
    Escape(String),

    /// Invalid argument error.
    ///
    /// This variant indicates programmer error rather than runtime data issues.
    ///
    /// # When to Use
    ///
    /// - Empty table names
    /// - `delete()` without any WHERE condition
    /// - `execute()` on a closed prepared query
    /// - A feature the active driver does not support, in debug mode
    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    /// Row decode error.
    ///
    /// Raised when a result row cannot be deserialized into the requested type
    /// (`get_result_as`, `get_row_as`).
    #[error("Decode error: {0}")]
    Decode(#[from] serde_json::Error),

    /// Database operation error.
    ///
    /// This variant wraps errors from the underlying sqlx library that were not
    /// classified into `Execution` or `Connect`. It's converted automatically
    /// via the `#[from]` attribute.
    #[error("Database error: {0}")]
    DatabaseError(#[from] sqlx::Error),
}

// ============================================================================
// Helper Functions and Traits
// ============================================================================

impl Error {
    /// Creates a `Config` error from a string slice.
    ///
    /// # Example
    ///
    /// ```rust,ignore
    /// return Err(Error::config("missing driver tag"));
    /// ```
    pub fn config(msg: &str) -> Self {
        Error::Config(msg.to_string())
    }

    /// Creates an `InvalidArgument` error from a string slice.
    ///
    /// # Example
    ///
    /// ```rust,ignore
    /// if table.is_empty() {
    ///     return Err(Error::invalid_argument("A table name is required for that operation."));
    /// }
    /// ```
    pub fn invalid_argument(msg: &str) -> Self {
        Error::InvalidArgument(msg.to_string())
    }

    /// Creates an `Escape` error from a string slice.
    pub fn escape(msg: &str) -> Self {
        Error::Escape(msg.to_string())
    }

    /// Creates a `Connect` error from a string slice.
    pub fn connect(msg: &str) -> Self {
        Error::Connect(msg.to_string())
    }

    /// Wraps a sqlx error raised while executing `sql`.
    ///
    /// Database errors keep their backend code and message. Other sqlx errors
    /// (I/O, protocol, pool) keep their display text.
    pub fn execution(err: sqlx::Error, sql: &str) -> Self {
        let (code, message) = split_sqlx_error(&err);
        Error::Execution { code, message, sql: sql.to_string() }
    }

    /// Returns the backend code and message carried by this error, if any.
    pub fn code_and_message(&self) -> (Option<String>, String) {
        match self {
            Error::Execution { code, message, .. } => (code.clone(), message.clone()),
            Error::DatabaseError(err) => split_sqlx_error(err),
            other => (None, other.to_string()),
        }
    }
}

/// Extracts the backend error code and message from a sqlx error.
pub(crate) fn split_sqlx_error(err: &sqlx::Error) -> (Option<String>, String) {
    match err.as_database_error() {
        Some(db_err) => (db_err.code().map(|c| c.into_owned()), db_err.message().to_string()),
        None => (None, err.to_string()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unable_to_connect_lists_every_attempt() {
        let err = Error::UnableToConnect {
            attempts: vec![
                "Main connection [MySQLi]: refused".to_string(),
                "Failover #1 [MySQLi]: refused".to_string(),
            ],
        };

        let text = err.to_string();
        assert!(text.starts_with("Unable to connect to the database."));
        assert!(text.contains("Main connection [MySQLi]: refused"));
        assert!(text.contains("Failover #1 [MySQLi]: refused"));
    }

    #[test]
    fn execution_without_code_uses_placeholder() {
        let err = Error::Execution { code: None, message: "boom".to_string(), sql: "SELECT 1".to_string() };
        assert_eq!(err.to_string(), "Query error -: boom");
        assert_eq!(err.code_and_message(), (None, "boom".to_string()));
    }
}
