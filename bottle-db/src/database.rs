//! # Database Module
//!
//! Driver selection and the registry of named connection groups.
//!
//! ```rust,ignore
//! let db = Database::new(DatabaseConfig::from_file(Path::new("database.json"))?);
//! let mut conn = db.connect(None).await?;          // default group
//! let mut reports = db.connect(Some("reports")).await?;
//! ```

use std::fmt;

use crate::{
    Error,
    config::DatabaseConfig,
    connection::Connection,
    drivers::{Connector, Dialect, mysqli, postgre, sqlite3},
    forge::ForgeRules,
};

/// Supported database driver types.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Drivers {
    /// PostgreSQL driver (`postgre`).
    Postgres,
    /// SQLite driver (`sqlite3`).
    SQLite,
    /// MySQL / MariaDB driver (`mysqli`).
    MySQL,
}

impl Drivers {
    /// Resolves a driver tag. Tags are case-insensitive.
    pub fn from_tag(tag: &str) -> Result<Self, Error> {
        match tag.to_ascii_lowercase().as_str() {
            "postgre" | "postgres" | "postgresql" | "pgsql" => Ok(Drivers::Postgres),
            "mysqli" | "mysql" | "mariadb" => Ok(Drivers::MySQL),
            "sqlite3" | "sqlite" => Ok(Drivers::SQLite),
            other => Err(Error::Config(format!("unsupported database driver: {}", other))),
        }
    }

    /// Canonical tag.
    pub fn tag(self) -> &'static str {
        match self {
            Drivers::Postgres => "postgre",
            Drivers::MySQL => "mysqli",
            Drivers::SQLite => "sqlite3",
        }
    }

    pub fn dialect(self) -> &'static dyn Dialect {
        match self {
            Drivers::Postgres => &postgre::DIALECT,
            Drivers::MySQL => &mysqli::DIALECT,
            Drivers::SQLite => &sqlite3::DIALECT,
        }
    }

    pub fn forge_rules(self) -> &'static dyn ForgeRules {
        match self {
            Drivers::Postgres => &postgre::FORGE,
            Drivers::MySQL => &mysqli::FORGE,
            Drivers::SQLite => &sqlite3::FORGE,
        }
    }

    pub fn connector(self) -> Box<dyn Connector> {
        match self {
            Drivers::Postgres => Box::new(postgre::PostgreConnector),
            Drivers::MySQL => Box::new(mysqli::MySqliConnector),
            Drivers::SQLite => Box::new(sqlite3::Sqlite3Connector),
        }
    }
}

impl fmt::Display for Drivers {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Drivers::Postgres => "Postgre",
            Drivers::MySQL => "MySQLi",
            Drivers::SQLite => "SQLite3",
        };
        f.write_str(name)
    }
}

/// The registry of named connection groups.
///
/// Each call hands out a fresh `Connection`; connections are never shared.
#[derive(Debug, Clone, Default)]
pub struct Database {
    config: DatabaseConfig,
}

impl Database {
    pub fn new(config: DatabaseConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &DatabaseConfig {
        &self.config
    }

    /// Returns an unconnected connection for a group (default group for `None`).
    ///
    /// The connection initializes itself on first use.
    pub fn connection(&self, group: Option<&str>) -> Result<Connection, Error> {
        let config = self.config.group(group)?;
        Connection::new(config)
    }

    /// Returns an initialized connection for a group (default group for `None`).
    ///
    /// # Example
    ///
    /// ```rust,ignore
    /// let mut conn = db.connect(Some("tests")).await?;
    /// ```
    pub async fn connect(&self, group: Option<&str>) -> Result<Connection, Error> {
        let mut conn = self.connection(group)?;
        conn.initialize().await?;
        Ok(conn)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tags_resolve_to_drivers() {
        assert_eq!(Drivers::from_tag("MySQLi").unwrap(), Drivers::MySQL);
        assert_eq!(Drivers::from_tag("postgre").unwrap(), Drivers::Postgres);
        assert_eq!(Drivers::from_tag("sqlite").unwrap(), Drivers::SQLite);
        assert!(Drivers::from_tag("oracle").is_err());
        assert_eq!(Drivers::MySQL.to_string(), "MySQLi");
    }

    #[test]
    fn unknown_group_is_a_config_error() {
        let db = Database::new(DatabaseConfig::default());
        assert!(matches!(db.connection(Some("nope")), Err(Error::Config(_))));
    }
}
