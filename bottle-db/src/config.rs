//! # Configuration Module
//!
//! Connection settings for one connection (`ConnectionConfig`) and the map of
//! named connection groups an application declares (`DatabaseConfig`).
//!
//! ## Loading
//!
//! - JSON files or strings (`DatabaseConfig::from_file`, `DatabaseConfig::from_json`)
//! - Environment (`DATABASE_URL`, `DATABASE_GROUP`)
//! - `DatabaseConfig::resolve` tries the file first, then the environment
//!
//! ## Example
//!
//! ```json
//! {
//!   "default_group": "default",
//!   "groups": {
//!     "default": {
//!       "driver": "postgre",
//!       "hostname": "localhost",
//!       "username": "app",
//!       "database": "app",
//!       "failover": [{ "hostname": "replica.local" }]
//!     },
//!     "tests": "sqlite::memory:"
//!   }
//! }
//! ```

use std::collections::BTreeMap;
use std::fs;
use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::{Error, dsn};

// ============================================================================
// Encryption
// ============================================================================

/// TLS settings for drivers that support encrypted connections.
///
/// When present, the connector verifies after connecting that the session is
/// actually encrypted and fails the attempt otherwise.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EncryptConfig {
    pub ssl_key: Option<String>,
    pub ssl_cert: Option<String>,
    pub ssl_ca: Option<String>,
    pub ssl_capath: Option<String>,
    pub ssl_cipher: Option<String>,
    pub ssl_verify: bool,
}

// ============================================================================
// Connection Config
// ============================================================================

/// Settings for a single connection.
///
/// A `dsn`, when present, is parsed by [`ConnectionConfig::resolve`] and wins
/// over the discrete fields for every attribute it sets.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ConnectionConfig {
    pub dsn: Option<String>,
    pub driver: String,
    pub hostname: String,
    pub port: Option<u16>,
    pub username: String,
    pub password: String,
    pub database: String,
    pub schema: String,
    pub charset: String,
    pub collation: String,
    pub prefix: String,
    pub swap_pre: String,
    pub db_debug: bool,
    pub pconnect: bool,
    pub encrypt: Option<EncryptConfig>,
    pub strict_on: bool,
    pub compress: bool,
    pub failover: Vec<ConnectionConfig>,
    /// Backend specific extras (`sslmode`, `connect_timeout`, `foreign_keys`, ...).
    pub options: BTreeMap<String, String>,
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        Self {
            dsn: None,
            driver: String::new(),
            hostname: String::new(),
            port: None,
            username: String::new(),
            password: String::new(),
            database: String::new(),
            schema: "public".to_string(),
            charset: "utf8".to_string(),
            collation: "utf8_general_ci".to_string(),
            prefix: String::new(),
            swap_pre: String::new(),
            db_debug: true,
            pconnect: false,
            encrypt: None,
            strict_on: false,
            compress: false,
            failover: Vec::new(),
            options: BTreeMap::new(),
        }
    }
}

impl ConnectionConfig {
    /// Creates a config from a DSN string, resolved immediately.
    pub fn from_dsn(dsn: &str) -> Result<Self, Error> {
        Self { dsn: Some(dsn.to_string()), ..Self::default() }.resolve()
    }

    /// Applies the DSN (if any) over the discrete fields.
    ///
    /// Attributes present in the DSN replace the discrete values. Attributes
    /// the DSN does not mention keep the discrete values. Known URI query keys
    /// (`charset`, `prefix`, `DBDebug`, ...) are lifted into fields and the
    /// rest land in `options`. A socket hostname clears the port.
    pub fn resolve(&self) -> Result<Self, Error> {
        let mut resolved = self.clone();

        if let Some(raw) = self.dsn.as_deref().filter(|d| !d.trim().is_empty()) {
            let parsed = dsn::parse(raw)?;

            if let Some(driver) = parsed.driver {
                resolved.driver = driver;
            }
            if let Some(hostname) = parsed.hostname {
                resolved.hostname = hostname;
            }
            if parsed.port.is_some() {
                resolved.port = parsed.port;
            }
            if let Some(username) = parsed.username {
                resolved.username = username;
            }
            if let Some(password) = parsed.password {
                resolved.password = password;
            }
            if let Some(database) = parsed.database {
                resolved.database = database;
            }

            for (key, value) in parsed.options {
                resolved.apply_option(key, value)?;
            }
            resolved.dsn = None;
        }

        if resolved.driver.is_empty() {
            return Err(Error::config("no driver configured"));
        }

        if resolved.hostname.starts_with('/') {
            resolved.port = None;
        }

        Ok(resolved)
    }

    fn apply_option(&mut self, key: String, value: String) -> Result<(), Error> {
        match key.as_str() {
            "charset" => self.charset = value,
            "DBCollat" | "collation" => self.collation = value,
            "DBPrefix" | "prefix" => self.prefix = value,
            "swapPre" | "swap_pre" => self.swap_pre = value,
            "schema" => self.schema = value,
            "DBDebug" | "db_debug" => self.db_debug = parse_flag(&key, &value)?,
            "pConnect" | "pconnect" => self.pconnect = parse_flag(&key, &value)?,
            "compress" => self.compress = parse_flag(&key, &value)?,
            "strictOn" | "strict_on" => self.strict_on = parse_flag(&key, &value)?,
            "encrypt" => {
                if parse_flag(&key, &value)? {
                    self.encrypt.get_or_insert_with(EncryptConfig::default);
                } else {
                    self.encrypt = None;
                }
            }
            _ => {
                self.options.insert(key, value);
            }
        }
        Ok(())
    }

    /// Returns this failover candidate with unset fields taken from `primary`.
    ///
    /// The failover list itself is never inherited.
    pub fn inherit_from(&self, primary: &ConnectionConfig) -> ConnectionConfig {
        let mut merged = self.clone();
        let defaults = ConnectionConfig::default();

        fn fill(target: &mut String, fallback: &str) {
            if target.is_empty() {
                *target = fallback.to_string();
            }
        }

        fill(&mut merged.driver, &primary.driver);
        fill(&mut merged.hostname, &primary.hostname);
        fill(&mut merged.username, &primary.username);
        fill(&mut merged.password, &primary.password);
        fill(&mut merged.database, &primary.database);
        fill(&mut merged.prefix, &primary.prefix);
        fill(&mut merged.swap_pre, &primary.swap_pre);
        if merged.schema == defaults.schema {
            merged.schema = primary.schema.clone();
        }
        if merged.charset == defaults.charset {
            merged.charset = primary.charset.clone();
        }
        if merged.collation == defaults.collation {
            merged.collation = primary.collation.clone();
        }
        if merged.port.is_none() && !merged.hostname.starts_with('/') {
            merged.port = primary.port;
        }
        if merged.encrypt.is_none() {
            merged.encrypt = primary.encrypt.clone();
        }
        for (key, value) in &primary.options {
            merged.options.entry(key.clone()).or_insert_with(|| value.clone());
        }
        merged.failover = Vec::new();
        merged
    }

    /// Postgres keyword DSN for this config.
    pub fn to_keyword_dsn(&self) -> String {
        dsn::build(&self.hostname, self.port, &self.username, &self.password, &self.database, &self.options)
    }
}

fn parse_flag(key: &str, value: &str) -> Result<bool, Error> {
    match value.to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Ok(true),
        "0" | "false" | "no" | "off" | "" => Ok(false),
        _ => Err(Error::Config(format!("invalid boolean for '{}': {}", key, value))),
    }
}

// ============================================================================
// Named Groups
// ============================================================================

/// A group entry is either a full config or a bare DSN string.
#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
enum GroupEntry {
    Dsn(String),
    Config(Box<ConnectionConfig>),
}

#[derive(Debug, Deserialize)]
struct RawDatabaseConfig {
    #[serde(default = "default_group_name")]
    default_group: String,
    #[serde(default)]
    groups: BTreeMap<String, GroupEntry>,
}

fn default_group_name() -> String {
    "default".to_string()
}

/// Named connection groups plus the name of the default one.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DatabaseConfig {
    pub default_group: String,
    pub groups: BTreeMap<String, ConnectionConfig>,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self { default_group: default_group_name(), groups: BTreeMap::new() }
    }
}

impl DatabaseConfig {
    /// Builds a config with a single default group.
    pub fn single(config: ConnectionConfig) -> Self {
        let mut groups = BTreeMap::new();
        groups.insert(default_group_name(), config);
        Self { default_group: default_group_name(), groups }
    }

    /// Adds or replaces a group.
    pub fn with_group(mut self, name: &str, config: ConnectionConfig) -> Self {
        self.groups.insert(name.to_string(), config);
        self
    }

    /// Parses a JSON document.
    pub fn from_json(json: &str) -> Result<Self, Error> {
        let raw: RawDatabaseConfig =
            serde_json::from_str(json).map_err(|e| Error::Config(format!("invalid database config: {}", e)))?;

        let mut groups = BTreeMap::new();
        for (name, entry) in raw.groups {
            let config = match entry {
                GroupEntry::Dsn(dsn) => ConnectionConfig { dsn: Some(dsn), ..ConnectionConfig::default() },
                GroupEntry::Config(config) => *config,
            };
            groups.insert(name, config);
        }

        Ok(Self { default_group: raw.default_group, groups })
    }

    /// Reads and parses a JSON file.
    pub fn from_file(path: &Path) -> Result<Self, Error> {
        let content = fs::read_to_string(path)
            .map_err(|e| Error::Config(format!("failed to read {}: {}", path.display(), e)))?;
        Self::from_json(&content)
    }

    /// Loads from the environment.
    ///
    /// `DATABASE_URL` supplies the DSN of the default group and
    /// `DATABASE_GROUP` renames the default group. Returns `None` when
    /// `DATABASE_URL` is unset.
    pub fn from_env() -> Option<Self> {
        let url = std::env::var("DATABASE_URL").ok()?;
        let group = std::env::var("DATABASE_GROUP").unwrap_or_else(|_| default_group_name());

        let mut groups = BTreeMap::new();
        groups.insert(group.clone(), ConnectionConfig { dsn: Some(url), ..ConnectionConfig::default() });
        Some(Self { default_group: group, groups })
    }

    /// Resolves configuration from a file, then the environment.
    ///
    /// Priority: config file > environment.
    pub fn resolve(path: Option<&Path>) -> Result<Self, Error> {
        if let Some(path) = path.filter(|p| p.exists()) {
            return Self::from_file(path);
        }

        Self::from_env().ok_or_else(|| Error::config("no database configuration file and DATABASE_URL is not set"))
    }

    /// Returns the resolved config of a group, or of the default group for `None`.
    pub fn group(&self, name: Option<&str>) -> Result<ConnectionConfig, Error> {
        let name = name.unwrap_or(&self.default_group);
        self.groups
            .get(name)
            .ok_or_else(|| Error::Config(format!("{} is not a valid database connection group.", name)))?
            .resolve()
    }
}
