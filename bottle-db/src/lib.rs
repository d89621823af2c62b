//! # Bottle DB
//!
//! A vendor-agnostic database access layer over MySQL, PostgreSQL and SQLite.
//!
//! - [`Connection`]: one native handle with failover, transactions, escaping
//!   and introspection
//! - [`Builder`]: fluent SELECT / INSERT / UPDATE / DELETE compilation
//! - [`PreparedQuery`]: server-side prepared statements
//! - [`Forge`]: CREATE / ALTER / DROP for tables, columns, keys and databases
//! - [`ResultSet`]: buffered rows with a cursor
//!
//! ```rust,ignore
//! use bottle_db::{Connection, ConnectionConfig};
//!
//! let mut conn = Connection::new(ConnectionConfig::from_dsn("sqlite::memory:")?)?;
//! conn.table("users")?.insert([("name", "Ada")]).await?;
//! let users = conn.table("users")?.where_("name", "Ada").get().await?.into_result()?;
//! ```

extern crate self as bottle_db;

pub use bottle_db_macro::Record;

pub mod config;
pub mod connection;
pub mod database;
pub mod drivers;
pub mod dsn;
pub mod errors;
pub mod escape;
pub mod forge;
pub mod introspection;
pub mod prepared;
pub mod query;
pub mod query_builder;
pub mod record;
pub mod result;
pub mod temporal;
pub mod transaction;
pub mod value;
pub mod value_binding;

pub use config::{ConnectionConfig, DatabaseConfig, EncryptConfig};
pub use connection::Connection;
pub use database::{Database, Drivers};
pub use errors::Error;
pub use forge::{AlterKind, Constraint, Field, Forge};
pub use introspection::{FieldData, ForeignKeyData, IndexData, IndexType};
pub use prepared::{PreparedQuery, PreparedState};
pub use query::{Bind, Binds, Query};
pub use query_builder::{Builder, Direction, JoinType, LikeSide};
pub use record::{IntoFields, Record};
pub use result::{Outcome, ResultSet, Row, WriteAck};
pub use value::Value;
