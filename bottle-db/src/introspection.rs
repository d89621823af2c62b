//! # Introspection Module
//!
//! Catalog lookups on a [`Connection`]: server version, tables, columns,
//! indexes and foreign keys. Each driver supplies the catalog queries through
//! its `Dialect`; this module adds prefixing and the per-connection cache.
//!
//! The server version and the unconstrained table list are cached on the
//! connection. `reset_data_cache()` forgets them.

use serde::Serialize;

use crate::{Error, connection::Connection, value::Value};

// ============================================================================
// Catalog Records
// ============================================================================

/// One column of a table.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct FieldData {
    pub name: String,
    pub type_name: String,
    pub max_length: Option<u64>,
    pub default: Option<String>,
    pub primary_key: bool,
    pub nullable: bool,
}

/// Kind of an index.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum IndexType {
    Primary,
    Unique,
    Index,
    Fulltext,
    Spatial,
}

impl IndexType {
    pub fn as_str(self) -> &'static str {
        match self {
            IndexType::Primary => "PRIMARY",
            IndexType::Unique => "UNIQUE",
            IndexType::Index => "INDEX",
            IndexType::Fulltext => "FULLTEXT",
            IndexType::Spatial => "SPATIAL",
        }
    }
}

/// One index of a table.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct IndexData {
    pub name: String,
    pub fields: Vec<String>,
    pub index_type: IndexType,
}

/// One foreign key constraint of a table.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ForeignKeyData {
    pub constraint_name: String,
    pub table_name: String,
    pub column_name: Vec<String>,
    pub foreign_table_name: String,
    pub foreign_column_name: Vec<String>,
    pub on_delete: Option<String>,
    pub on_update: Option<String>,
    pub match_type: Option<String>,
}

// ============================================================================
// Connection Implementation
// ============================================================================

impl Connection {
    /// Server version, queried once per connection.
    pub async fn get_version(&mut self) -> Result<String, Error> {
        if let Some(version) = &self.data_cache.version {
            return Ok(version.clone());
        }

        self.ensure_connected().await?;
        let dialect = self.dialect();
        let version = dialect.version(self.handle_mut()?).await?;
        self.data_cache.version = Some(version.clone());
        Ok(version)
    }

    /// Table names in the current database.
    ///
    /// With `constrain_by_prefix` only tables starting with the configured
    /// prefix are listed. The unconstrained list is cached.
    pub async fn list_tables(&mut self, constrain_by_prefix: bool) -> Result<Vec<String>, Error> {
        let prefix = self.get_prefix().to_string();
        let constrained = constrain_by_prefix && !prefix.is_empty();

        if !constrained {
            if let Some(names) = &self.data_cache.table_names {
                return Ok(names.clone());
            }
        }

        let sql = self.dialect().list_tables_sql(if constrained { Some(&prefix) } else { None });
        let names = self.fetch_internal(&sql).await?.first_column();

        if !constrained {
            self.data_cache.table_names = Some(names.clone());
        }
        Ok(names)
    }

    /// Whether a table (prefix added) exists. With `cached` false the table
    /// list is refreshed first.
    pub async fn table_exists(&mut self, table: &str, cached: bool) -> Result<bool, Error> {
        if !cached {
            self.data_cache.table_names = None;
        }
        let name = self.prefix_table(table)?;
        let tables = self.list_tables(false).await?;
        Ok(tables.iter().any(|t| t.eq_ignore_ascii_case(&name)))
    }

    /// Column names of a table (prefix added).
    pub async fn get_field_names(&mut self, table: &str) -> Result<Vec<String>, Error> {
        let name = self.prefix_table(table)?;
        let sql = self.dialect().list_columns_sql(&name);
        Ok(self.fetch_internal(&sql).await?.first_column())
    }

    pub async fn field_exists(&mut self, field: &str, table: &str) -> Result<bool, Error> {
        let fields = self.get_field_names(table).await?;
        Ok(fields.iter().any(|f| f.eq_ignore_ascii_case(field)))
    }

    /// Column metadata of a table (prefix added).
    pub async fn get_field_data(&mut self, table: &str) -> Result<Vec<FieldData>, Error> {
        let name = self.prefix_table(table)?;
        self.ensure_connected().await?;
        let dialect = self.dialect();
        dialect.field_data(self.handle_mut()?, &name).await
    }

    /// Indexes of a table (prefix added).
    pub async fn get_index_data(&mut self, table: &str) -> Result<Vec<IndexData>, Error> {
        let name = self.prefix_table(table)?;
        self.ensure_connected().await?;
        let dialect = self.dialect();
        dialect.index_data(self.handle_mut()?, &name).await
    }

    /// Foreign keys of a table (prefix added).
    pub async fn get_foreign_key_data(&mut self, table: &str) -> Result<Vec<ForeignKeyData>, Error> {
        let name = self.prefix_table(table)?;
        self.ensure_connected().await?;
        let dialect = self.dialect();
        dialect.foreign_key_data(self.handle_mut()?, &name).await
    }

    pub async fn disable_foreign_key_checks(&mut self) -> Result<(), Error> {
        let sql = self.dialect().disable_foreign_key_checks_sql();
        self.execute_internal(sql).await.map(|_| ())
    }

    pub async fn enable_foreign_key_checks(&mut self) -> Result<(), Error> {
        let sql = self.dialect().enable_foreign_key_checks_sql();
        self.execute_internal(sql).await.map(|_| ())
    }

    /// Id generated by the last insert.
    ///
    /// Drivers whose acknowledgement carries no id ask the backend.
    pub async fn insert_id(&mut self) -> Result<Option<i64>, Error> {
        match self.dialect().insert_id_query() {
            Some(sql) => {
                let rows = self.fetch_internal(sql).await?;
                Ok(rows.rows.first().and_then(|r| r.first()).and_then(Value::as_i64))
            }
            None => Ok(self.last_ack().last_insert_id),
        }
    }

    /// Forgets the cached version and table list.
    pub fn reset_data_cache(&mut self) -> &mut Self {
        self.data_cache = Default::default();
        self
    }
}
