//! # Record Module
//!
//! The `Record` trait maps a struct onto a table, and `IntoFields` is what
//! builder data arguments accept.
//!
//! `Record` is normally implemented with `#[derive(Record)]`:
//!
//! ```rust,ignore
//! use bottle_db::Record;
//!
//! #[derive(Record, Debug, Clone, serde::Deserialize)]
//! #[record(table = "users")]
//! struct User {
//!     #[record(primary_key, auto_increment)]
//!     id: i64,
//!     #[record(size = 100, unique)]
//!     email: String,
//!     nickname: Option<String>,
//! }
//!
//! conn.forge().add_record::<User>().create_table(User::table_name(), true, &BTreeMap::new()).await?;
//! conn.table(User::table_name())?.insert(&user).await?;
//! ```
//!
//! ## Supported Attributes
//!
//! - `#[record(table = "...")]` on the struct; snake_case struct name otherwise
//! - `#[record(primary_key)]`, `#[record(auto_increment)]`, `#[record(unique)]`
//! - `#[record(size = N)]` - `VARCHAR(N)` for strings, length for other types
//! - `#[record(column = "...")]` - column name differing from the field
//! - `#[record(skip)]` - not a column

use std::collections::{BTreeMap, HashMap};

use crate::{
    forge::{Field, Forge},
    value::Value,
};

/// A struct stored as one table row.
pub trait Record {
    /// Table name, without prefix.
    fn table_name() -> &'static str;

    /// Column/value pairs in declaration order.
    fn to_fields(&self) -> Vec<(String, Value)>;

    /// Column definitions for `Forge`.
    fn forge_fields() -> Vec<Field>;

    /// Columns of the primary key.
    fn primary_keys() -> Vec<&'static str> {
        Vec::new()
    }
}

/// Anything usable as builder data: `(key, value)` pairs in order.
pub trait IntoFields {
    fn into_fields(self) -> Vec<(String, Value)>;
}

impl<K: Into<String>, V: Into<Value>> IntoFields for Vec<(K, V)> {
    fn into_fields(self) -> Vec<(String, Value)> {
        self.into_iter().map(|(k, v)| (k.into(), v.into())).collect()
    }
}

impl<K: Into<String>, V: Into<Value>, const N: usize> IntoFields for [(K, V); N] {
    fn into_fields(self) -> Vec<(String, Value)> {
        self.into_iter().map(|(k, v)| (k.into(), v.into())).collect()
    }
}

impl<K: Into<String>, V: Into<Value>> IntoFields for BTreeMap<K, V> {
    fn into_fields(self) -> Vec<(String, Value)> {
        self.into_iter().map(|(k, v)| (k.into(), v.into())).collect()
    }
}

/// Iteration order of a `HashMap` is unspecified, so is the column order.
impl<K: Into<String>, V: Into<Value>> IntoFields for HashMap<K, V> {
    fn into_fields(self) -> Vec<(String, Value)> {
        self.into_iter().map(|(k, v)| (k.into(), v.into())).collect()
    }
}

impl<T: Record> IntoFields for &T {
    fn into_fields(self) -> Vec<(String, Value)> {
        self.to_fields()
    }
}

impl<'c> Forge<'c> {
    /// Adds the fields and primary key of `T`.
    pub fn add_record<T: Record>(&mut self) -> &mut Self {
        self.add_fields(T::forge_fields());
        let keys = T::primary_keys();
        let has_auto_increment = T::forge_fields().iter().any(|f| f.auto_increment);
        if !keys.is_empty() && !has_auto_increment {
            self.add_primary_key(&keys, None);
        }
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{config::ConnectionConfig, connection::Connection};

    struct Team {
        id: i64,
        name: String,
        motto: Option<String>,
    }

    impl Record for Team {
        fn table_name() -> &'static str {
            "teams"
        }

        fn to_fields(&self) -> Vec<(String, Value)> {
            vec![
                ("id".to_string(), Value::from(self.id)),
                ("name".to_string(), Value::from(self.name.clone())),
                ("motto".to_string(), Value::from(self.motto.clone())),
            ]
        }

        fn forge_fields() -> Vec<Field> {
            vec![
                Field::new("id", "BIGINT"),
                Field::new("name", "VARCHAR").constraint(40),
                Field::new("motto", "TEXT").null(true),
            ]
        }

        fn primary_keys() -> Vec<&'static str> {
            vec!["id"]
        }
    }

    fn connection() -> Connection {
        Connection::new(ConnectionConfig {
            driver: "postgre".to_string(),
            hostname: "localhost".to_string(),
            database: "app".to_string(),
            ..ConnectionConfig::default()
        })
        .unwrap()
    }

    #[test]
    fn pairs_keep_their_order() {
        let fields = [("b", 1), ("a", 2)].into_fields();
        assert_eq!(fields, vec![("b".to_string(), Value::Int(1)), ("a".to_string(), Value::Int(2))]);

        let mut map = BTreeMap::new();
        map.insert("z", "last");
        map.insert("m", "first");
        assert_eq!(map.into_fields()[0].0, "m");
    }

    #[test]
    fn records_feed_the_builder() {
        let mut conn = connection();
        let team = Team { id: 3, name: "Red".to_string(), motto: None };
        let sql = conn.table(Team::table_name()).unwrap().set_data(&team).get_compiled_insert(true).unwrap();
        assert_eq!(sql, "INSERT INTO \"teams\" (\"id\", \"name\", \"motto\") VALUES (3, 'Red', NULL)");
    }

    #[test]
    fn records_feed_the_forge() {
        let mut conn = connection();
        let mut forge = conn.forge();
        forge.add_record::<Team>();
        let statements = forge.compile_create_table("teams", false, &BTreeMap::new()).unwrap();
        assert_eq!(
            statements[0],
            "CREATE TABLE \"teams\" (\n\t\"id\" BIGINT NOT NULL,\n\t\"name\" VARCHAR(40) NOT NULL,\n\t\"motto\" TEXT NULL,\n\tCONSTRAINT \"pk_teams\" PRIMARY KEY(\"id\")\n)"
        );
    }
}
