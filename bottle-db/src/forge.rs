//! # Forge Module
//!
//! Compiles and runs DDL: CREATE/ALTER/DROP TABLE, columns, keys, foreign keys
//! and databases.
//!
//! ## Features
//!
//! - **Fixed attribute order**: type, length, unsigned, null, default,
//!   auto-increment, unique, comment, position
//! - **Driver type rules**: narrowing and widening of types a backend lacks
//!   (see [`ForgeRules`])
//! - **Tolerant keys**: keys and foreign keys naming a column that was not
//!   defined in the same call are skipped with a warning
//!
//! ## Example Usage
//!
//! ```rust,ignore
//! let mut forge = conn.forge();
//! forge
//!     .add_field_definition("id")?
//!     .add_field(Field::new("email", "VARCHAR").constraint(255).unique())
//!     .add_field(Field::new("team_id", "INT").unsigned().null(true))
//!     .add_key(&["email"])
//!     .add_foreign_key(&["team_id"], "teams", &["id"], Some("CASCADE"), Some("SET NULL"));
//!
//! forge.create_table("users", true, &BTreeMap::new()).await?;
//! ```

use std::collections::BTreeMap;

use crate::{
    Error,
    connection::Connection,
    database::Drivers,
    drivers::Dialect,
    escape::{escape_identifiers, escape_value},
    result::Outcome,
    value::Value,
};

/// Referential actions accepted in ON DELETE / ON UPDATE.
pub const FK_ALLOWED_ACTIONS: [&str; 5] = ["CASCADE", "SET NULL", "NO ACTION", "RESTRICT", "SET DEFAULT"];

// ============================================================================
// Field Definition
// ============================================================================

/// Length, precision or value list of a column type.
#[derive(Debug, Clone, PartialEq)]
pub enum Constraint {
    Length(u32),
    Precision(u32, u32),
    /// ENUM/SET members.
    Values(Vec<String>),
}

/// A column definition.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct Field {
    pub name: String,
    pub sql_type: String,
    pub constraint: Option<Constraint>,
    pub unsigned: bool,
    /// `None` means NOT NULL on create and unchanged on modify.
    pub null: Option<bool>,
    /// `Some(Value::Null)` gives `DEFAULT NULL`; `Value::Raw` is not escaped.
    pub default: Option<Value>,
    pub auto_increment: bool,
    pub unique: bool,
    pub comment: Option<String>,
    pub after: Option<String>,
    pub first: bool,
    /// Rename target when modifying a column.
    pub new_name: Option<String>,
    /// Complete column SQL used as-is.
    pub literal: Option<String>,
}

impl Field {
    pub fn new(name: &str, sql_type: &str) -> Self {
        Self { name: name.to_string(), sql_type: sql_type.to_string(), ..Self::default() }
    }

    /// A column given as raw SQL, e.g. `"slug VARCHAR(64) NOT NULL"`.
    ///
    /// # Errors
    ///
    /// `Error::InvalidArgument` when the string has no type after the name.
    pub fn literal(sql: &str) -> Result<Self, Error> {
        let sql = sql.trim();
        let (name, _) = sql
            .split_once(' ')
            .ok_or_else(|| Error::invalid_argument("Field information is required for that operation."))?;
        let name = name.trim_matches(|c| c == '`' || c == '"' || c == '\'');
        Ok(Self { name: name.to_string(), literal: Some(sql.to_string()), ..Self::default() })
    }

    pub fn constraint(mut self, length: u32) -> Self {
        self.constraint = Some(Constraint::Length(length));
        self
    }

    pub fn precision(mut self, precision: u32, scale: u32) -> Self {
        self.constraint = Some(Constraint::Precision(precision, scale));
        self
    }

    pub fn values<I: IntoIterator<Item = S>, S: Into<String>>(mut self, values: I) -> Self {
        self.constraint = Some(Constraint::Values(values.into_iter().map(Into::into).collect()));
        self
    }

    pub fn unsigned(mut self) -> Self {
        self.unsigned = true;
        self
    }

    pub fn null(mut self, nullable: bool) -> Self {
        self.null = Some(nullable);
        self
    }

    pub fn default_value(mut self, value: impl Into<Value>) -> Self {
        self.default = Some(value.into());
        self
    }

    pub fn auto_increment(mut self) -> Self {
        self.auto_increment = true;
        self
    }

    pub fn unique(mut self) -> Self {
        self.unique = true;
        self
    }

    pub fn comment(mut self, comment: &str) -> Self {
        self.comment = Some(comment.to_string());
        self
    }

    pub fn after(mut self, column: &str) -> Self {
        self.after = Some(column.to_string());
        self
    }

    pub fn first(mut self) -> Self {
        self.first = true;
        self
    }

    pub fn rename(mut self, new_name: &str) -> Self {
        self.new_name = Some(new_name.to_string());
        self
    }
}

/// A compiled column: every attribute already rendered with its leading space.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ColumnParts {
    pub name: String,
    pub new_name: Option<String>,
    pub type_name: String,
    pub length: String,
    pub unsigned: String,
    pub null: String,
    pub default: String,
    /// The escaped default alone, for `SET DEFAULT`.
    pub default_value: Option<String>,
    pub auto_increment: String,
    pub unique: String,
    /// Escaped comment literal.
    pub comment: Option<String>,
    pub after: Option<String>,
    pub first: bool,
    pub literal: Option<String>,
}

/// How a backend treats `UNSIGNED`.
#[derive(Debug, Clone, Copy)]
pub enum UnsignedRule {
    /// Any type accepts the keyword.
    Everywhere,
    /// Only these types accept it; others drop it.
    Types(&'static [&'static str]),
    /// No keyword; the type is widened instead. Unlisted types drop it.
    Widen(&'static [(&'static str, &'static str)]),
    Never,
}

/// ALTER TABLE flavours compiled per field.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AlterKind {
    Add,
    Change,
}

// ============================================================================
// Driver Rules
// ============================================================================

/// DDL differences between backends. Default bodies are the shared behavior.
pub trait ForgeRules: Send + Sync {
    fn unsigned_rule(&self) -> UnsignedRule {
        UnsignedRule::Everywhere
    }

    /// Narrows or renames types the backend lacks. `field.sql_type` is upper case.
    fn attribute_type(&self, _field: &mut Field) {}

    fn attribute_unsigned(&self, field: &Field, parts: &mut ColumnParts) {
        if !field.unsigned {
            return;
        }
        match self.unsigned_rule() {
            UnsignedRule::Everywhere => parts.unsigned = " UNSIGNED".to_string(),
            UnsignedRule::Types(types) => {
                if types.contains(&field.sql_type.as_str()) {
                    parts.unsigned = " UNSIGNED".to_string();
                }
            }
            UnsignedRule::Widen(map) => {
                if let Some((_, wider)) = map.iter().find(|(from, _)| *from == field.sql_type) {
                    parts.type_name = wider.to_string();
                }
            }
            UnsignedRule::Never => {}
        }
    }

    /// Renders auto-increment. Returns true when the column became the
    /// table's primary key on its own, so the table level key is dropped.
    fn attribute_auto_increment(&self, field: &Field, parts: &mut ColumnParts) -> bool {
        if field.auto_increment && field.sql_type.contains("INT") {
            parts.auto_increment = " AUTO_INCREMENT".to_string();
        }
        false
    }

    fn process_column(&self, dialect: &dyn Dialect, parts: &ColumnParts) -> String {
        let mut sql = escape_identifiers(dialect, &parts.name);
        if let Some(new_name) = &parts.new_name {
            sql.push(' ');
            sql.push_str(&escape_identifiers(dialect, new_name));
        }
        format!(
            "{} {}{}{}{}{}{}{}",
            sql, parts.type_name, parts.length, parts.unsigned, parts.null, parts.default, parts.auto_increment, parts.unique
        )
    }

    /// Whether keys are declared inside CREATE TABLE.
    fn keys_in_create_table(&self) -> bool {
        false
    }

    /// Key clause inside CREATE TABLE, with leading separator.
    fn inline_key(&self, dialect: &dyn Dialect, name: &str, fields: &[String], unique: bool) -> String {
        format!(
            ",\n\t{}KEY {} ({})",
            if unique { "UNIQUE " } else { "" },
            escape_identifiers(dialect, name),
            join_identifiers(dialect, fields)
        )
    }

    /// Statement adding a unique key. `table` is escaped.
    fn unique_key_statement(&self, dialect: &dyn Dialect, table: &str, name: &str, fields: &[String]) -> String {
        format!(
            "ALTER TABLE {} ADD CONSTRAINT {} UNIQUE ({})",
            table,
            escape_identifiers(dialect, name),
            join_identifiers(dialect, fields)
        )
    }

    /// Statement adding a plain index. `table` is escaped.
    fn index_statement(&self, dialect: &dyn Dialect, table: &str, name: &str, fields: &[String]) -> String {
        format!("CREATE INDEX {} ON {} ({})", escape_identifiers(dialect, name), table, join_identifiers(dialect, fields))
    }

    /// Table options after the closing parenthesis.
    fn create_table_attributes(
        &self,
        _dialect: &dyn Dialect,
        _attributes: &BTreeMap<String, String>,
        _charset: &str,
        _collation: &str,
    ) -> String {
        String::new()
    }

    fn drop_table_cascade(&self) -> bool {
        false
    }

    /// ALTER statements for added or changed columns. `table` is escaped.
    fn alter_table(
        &self,
        dialect: &dyn Dialect,
        kind: AlterKind,
        table: &str,
        fields: &[ColumnParts],
    ) -> Result<Vec<String>, Error> {
        Ok(fields
            .iter()
            .map(|parts| {
                let mut parts = parts.clone();
                let action = match kind {
                    AlterKind::Add => {
                        parts.new_name = None;
                        "ADD"
                    }
                    AlterKind::Change => {
                        parts.new_name.get_or_insert_with(|| parts.name.clone());
                        "CHANGE COLUMN"
                    }
                };
                let column = parts.literal.clone().unwrap_or_else(|| self.process_column(dialect, &parts));
                format!("ALTER TABLE {} {} {}", table, action, column)
            })
            .collect())
    }

    /// `table` is escaped.
    fn drop_column_statement(&self, dialect: &dyn Dialect, table: &str, columns: &[String]) -> Result<String, Error> {
        let drops: Vec<String> =
            columns.iter().map(|c| format!("DROP COLUMN {}", escape_identifiers(dialect, c.trim()))).collect();
        Ok(format!("ALTER TABLE {} {}", table, drops.join(", ")))
    }

    /// `ALTER TABLE %s DROP ... %s` for foreign keys, when supported.
    fn drop_foreign_key_statement(&self, _table: &str, _name: &str) -> Option<String> {
        None
    }

    fn create_database_statement(&self, name: &str, _if_not_exists: bool, _charset: &str, _collation: &str) -> Option<String> {
        Some(format!("CREATE DATABASE {}", name))
    }

    /// Query with one `?` returning a row when a database exists.
    fn database_exists_query(&self) -> Option<&'static str> {
        None
    }

    fn drop_database_statement(&self, name: &str) -> Option<String> {
        Some(format!("DROP DATABASE {}", name))
    }
}

fn join_identifiers(dialect: &dyn Dialect, fields: &[String]) -> String {
    fields.iter().map(|f| escape_identifiers(dialect, f)).collect::<Vec<_>>().join(", ")
}

/// Renders one field with the driver's rules.
///
/// Returns the parts and whether the column carries the primary key itself.
pub fn process_field(
    rules: &dyn ForgeRules,
    dialect: &dyn Dialect,
    field: &Field,
    create_table: bool,
) -> Result<(ColumnParts, bool), Error> {
    if let Some(literal) = &field.literal {
        let parts = ColumnParts { name: field.name.clone(), literal: Some(literal.clone()), ..ColumnParts::default() };
        return Ok((parts, false));
    }

    let mut field = field.clone();
    field.sql_type = field.sql_type.to_ascii_uppercase();
    rules.attribute_type(&mut field);

    let mut parts = ColumnParts {
        name: field.name.clone(),
        new_name: field.new_name.clone(),
        type_name: field.sql_type.clone(),
        after: field.after.clone(),
        first: field.first,
        ..ColumnParts::default()
    };

    parts.length = match &field.constraint {
        Some(Constraint::Length(n)) => format!("({})", n),
        Some(Constraint::Precision(p, s)) => format!("({},{})", p, s),
        Some(Constraint::Values(values)) => {
            let escaped: Result<Vec<String>, Error> =
                values.iter().map(|v| escape_value(dialect, &Value::Text(v.clone()))).collect();
            format!("({})", escaped?.join(","))
        }
        None => String::new(),
    };

    rules.attribute_unsigned(&field, &mut parts);

    parts.null = match field.null {
        Some(true) => " NULL".to_string(),
        Some(false) => " NOT NULL".to_string(),
        None if create_table => " NOT NULL".to_string(),
        None => String::new(),
    };

    match &field.default {
        Some(Value::Null) => {
            parts.default = " DEFAULT NULL".to_string();
            parts.default_value = Some("NULL".to_string());
            parts.null = " NULL".to_string();
        }
        Some(value) => {
            let rendered = escape_value(dialect, value)?;
            parts.default = format!(" DEFAULT {}", rendered);
            parts.default_value = Some(rendered);
        }
        None => {}
    }

    let owns_primary_key = rules.attribute_auto_increment(&field, &mut parts);

    if field.unique {
        parts.unique = " UNIQUE".to_string();
    }

    if let Some(comment) = &field.comment {
        parts.comment = Some(escape_value(dialect, &Value::Text(comment.clone()))?);
    }

    Ok((parts, owns_primary_key))
}

// ============================================================================
// Keys
// ============================================================================

#[derive(Debug, Clone, PartialEq)]
struct KeyDef {
    fields: Vec<String>,
    name: Option<String>,
    unique: bool,
}

#[derive(Debug, Clone, PartialEq)]
struct ForeignKeyDef {
    fields: Vec<String>,
    reference_table: String,
    reference_fields: Vec<String>,
    on_delete: Option<String>,
    on_update: Option<String>,
    name: Option<String>,
}

// ============================================================================
// Forge
// ============================================================================

/// Schema builder bound to a connection.
pub struct Forge<'c> {
    conn: &'c mut Connection,
    fields: Vec<Field>,
    keys: Vec<KeyDef>,
    primary_key: Option<KeyDef>,
    foreign_keys: Vec<ForeignKeyDef>,
}

impl<'c> Forge<'c> {
    pub(crate) fn new(conn: &'c mut Connection) -> Self {
        Self { conn, fields: Vec::new(), keys: Vec::new(), primary_key: None, foreign_keys: Vec::new() }
    }

    fn rules(&self) -> &'static dyn ForgeRules {
        self.conn.driver().forge_rules()
    }

    fn dialect(&self) -> &'static dyn Dialect {
        self.conn.dialect()
    }

    fn reset(&mut self) {
        self.fields.clear();
        self.keys.clear();
        self.primary_key = None;
        self.foreign_keys.clear();
    }

    // ========================================================================
    // Definitions
    // ========================================================================

    pub fn add_field(&mut self, field: Field) -> &mut Self {
        self.fields.push(field);
        self
    }

    pub fn add_fields<I: IntoIterator<Item = Field>>(&mut self, fields: I) -> &mut Self {
        self.fields.extend(fields);
        self
    }

    /// `"id"` adds `id INT(9) NOT NULL AUTO_INCREMENT` as primary key; any
    /// other string is a literal column definition.
    pub fn add_field_definition(&mut self, definition: &str) -> Result<&mut Self, Error> {
        if definition == "id" {
            self.add_field(Field::new("id", "INT").constraint(9).auto_increment());
            return Ok(self.add_primary_key(&["id"], None));
        }
        let field = Field::literal(definition)?;
        Ok(self.add_field(field))
    }

    pub fn add_key(&mut self, fields: &[&str]) -> &mut Self {
        self.keys.push(KeyDef { fields: owned(fields), name: None, unique: false });
        self
    }

    pub fn add_named_key(&mut self, fields: &[&str], unique: bool, name: &str) -> &mut Self {
        self.keys.push(KeyDef { fields: owned(fields), name: Some(name.to_string()), unique });
        self
    }

    pub fn add_unique_key(&mut self, fields: &[&str]) -> &mut Self {
        self.keys.push(KeyDef { fields: owned(fields), name: None, unique: true });
        self
    }

    pub fn add_primary_key(&mut self, fields: &[&str], name: Option<&str>) -> &mut Self {
        self.primary_key = Some(KeyDef { fields: owned(fields), name: name.map(str::to_string), unique: true });
        self
    }

    /// Adds a foreign key. Actions outside [`FK_ALLOWED_ACTIONS`] are dropped.
    pub fn add_foreign_key(
        &mut self,
        fields: &[&str],
        reference_table: &str,
        reference_fields: &[&str],
        on_update: Option<&str>,
        on_delete: Option<&str>,
    ) -> &mut Self {
        let action = |a: Option<&str>| a.map(str::to_ascii_uppercase).filter(|a| FK_ALLOWED_ACTIONS.contains(&a.as_str()));
        self.foreign_keys.push(ForeignKeyDef {
            fields: owned(fields),
            reference_table: reference_table.to_string(),
            reference_fields: owned(reference_fields),
            on_delete: action(on_delete),
            on_update: action(on_update),
            name: None,
        });
        self
    }

    // ========================================================================
    // Compilation
    // ========================================================================

    fn defined(&self, name: &str) -> bool {
        self.fields.iter().any(|f| f.name == name)
    }

    fn defined_subset(&self, fields: &[String], what: &str) -> Vec<String> {
        fields
            .iter()
            .filter(|f| {
                let ok = self.defined(f);
                if !ok {
                    log::warn!("Skipping undefined field '{}' in {}", f, what);
                }
                ok
            })
            .cloned()
            .collect()
    }

    fn compile_foreign_key(&self, table: &str, fk: &ForeignKeyDef) -> String {
        let dialect = self.dialect();
        let name = fk.name.clone().unwrap_or_else(|| format!("{}_{}_foreign", table, fk.fields.join("_")));
        let reference = format!("{}{}", self.conn.get_prefix(), fk.reference_table);

        let mut sql = format!(
            "CONSTRAINT {} FOREIGN KEY ({}) REFERENCES {}({})",
            escape_identifiers(dialect, &name),
            join_identifiers(dialect, &fk.fields),
            escape_identifiers(dialect, &reference),
            join_identifiers(dialect, &fk.reference_fields)
        );
        if let Some(action) = &fk.on_delete {
            sql.push_str(" ON DELETE ");
            sql.push_str(action);
        }
        if let Some(action) = &fk.on_update {
            sql.push_str(" ON UPDATE ");
            sql.push_str(action);
        }
        sql
    }

    fn key_name(table: &str, key: &KeyDef, fields: &[String]) -> String {
        key.name.clone().unwrap_or_else(|| format!("{}_{}", table, fields.join("_")))
    }

    /// CREATE TABLE plus any separate index statements. `table` is prefixed.
    pub fn compile_create_table(
        &self,
        table: &str,
        if_not_exists: bool,
        attributes: &BTreeMap<String, String>,
    ) -> Result<Vec<String>, Error> {
        if self.fields.is_empty() {
            return Err(Error::invalid_argument("Field information is required."));
        }

        let rules = self.rules();
        let dialect = self.dialect();
        let escaped_table = escape_identifiers(dialect, table);

        let mut columns = Vec::with_capacity(self.fields.len());
        let mut column_owns_key = false;
        for field in &self.fields {
            let (parts, owns_key) = process_field(rules, dialect, field, true)?;
            column_owns_key |= owns_key;
            columns.push(parts.literal.clone().unwrap_or_else(|| rules.process_column(dialect, &parts)));
        }

        let mut body = format!("\n\t{}", columns.join(",\n\t"));

        if let Some(pk) = self.primary_key.as_ref().filter(|_| !column_owns_key) {
            let fields = self.defined_subset(&pk.fields, "primary key");
            if !fields.is_empty() {
                let name = pk.name.clone().unwrap_or_else(|| format!("pk_{}", table));
                body.push_str(&format!(
                    ",\n\tCONSTRAINT {} PRIMARY KEY({})",
                    escape_identifiers(dialect, &name),
                    join_identifiers(dialect, &fields)
                ));
            }
        }

        let mut index_statements = Vec::new();
        for key in &self.keys {
            let fields = self.defined_subset(&key.fields, "key");
            if fields.is_empty() {
                continue;
            }
            let name = Self::key_name(table, key, &fields);
            if rules.keys_in_create_table() {
                body.push_str(&rules.inline_key(dialect, &name, &fields, key.unique));
            } else if key.unique {
                index_statements.push(rules.unique_key_statement(dialect, &escaped_table, &name, &fields));
            } else {
                index_statements.push(rules.index_statement(dialect, &escaped_table, &name, &fields));
            }
        }

        for fk in &self.foreign_keys {
            if let Some(missing) = fk.fields.iter().find(|f| !self.defined(f)) {
                log::warn!("Skipping foreign key on undefined field '{}' of {}", missing, table);
                continue;
            }
            body.push_str(",\n\t");
            body.push_str(&self.compile_foreign_key(table, fk));
        }

        let keyword = if if_not_exists { "CREATE TABLE IF NOT EXISTS" } else { "CREATE TABLE" };
        let config = self.conn.config();
        let mut sql = format!("{} {} ({}\n)", keyword, escaped_table, body);
        sql.push_str(&rules.create_table_attributes(dialect, attributes, &config.charset, &config.collation));

        let mut statements = vec![sql];
        statements.extend(index_statements);
        Ok(statements)
    }

    /// ALTER statements for the pending fields. `table` is prefixed.
    pub fn compile_alter(&self, kind: AlterKind, table: &str) -> Result<Vec<String>, Error> {
        if self.fields.is_empty() {
            return Err(Error::invalid_argument("Field information is required."));
        }
        let rules = self.rules();
        let dialect = self.dialect();

        let mut parts = Vec::with_capacity(self.fields.len());
        for field in &self.fields {
            parts.push(process_field(rules, dialect, field, false)?.0);
        }
        rules.alter_table(dialect, kind, &escape_identifiers(dialect, table), &parts)
    }

    /// Index and foreign key statements for an existing table. `table` is prefixed.
    pub fn compile_indexes(&self, table: &str) -> Result<Vec<String>, Error> {
        let rules = self.rules();
        let dialect = self.dialect();
        let escaped_table = escape_identifiers(dialect, table);
        let mut statements = Vec::new();

        for key in &self.keys {
            let name = Self::key_name(table, key, &key.fields);
            if key.unique {
                statements.push(rules.unique_key_statement(dialect, &escaped_table, &name, &key.fields));
            } else {
                statements.push(rules.index_statement(dialect, &escaped_table, &name, &key.fields));
            }
        }

        if !self.foreign_keys.is_empty() && self.conn.driver() == Drivers::SQLite {
            return Err(Error::invalid_argument("SQLite cannot add foreign keys to an existing table."));
        }
        for fk in &self.foreign_keys {
            statements.push(format!("ALTER TABLE {} ADD {}", escaped_table, self.compile_foreign_key(table, fk)));
        }
        Ok(statements)
    }

    // ========================================================================
    // Execution
    // ========================================================================

    /// Runs statements in order. Stops at the first failure (debug off).
    async fn run_all(&mut self, statements: Vec<String>) -> Result<bool, Error> {
        for sql in statements {
            let outcome = self.conn.query(&sql, ()).await?;
            if let Outcome::Failed(_) = outcome {
                return Ok(false);
            }
        }
        Ok(true)
    }

    /// Fails with `InvalidArgument` in debug mode, otherwise logs and returns false.
    fn refuse(&self, err: Error) -> Result<bool, Error> {
        if self.conn.is_debug() {
            return Err(err);
        }
        log::error!("{}", err);
        Ok(false)
    }

    /// Creates a table from the pending fields and keys.
    ///
    /// # Arguments
    ///
    /// * `table` - Table name without prefix
    /// * `if_not_exists` - Adds `IF NOT EXISTS`
    /// * `attributes` - Table options (`ENGINE`, `COMMENT`, ... on MySQL)
    pub async fn create_table(
        &mut self,
        table: &str,
        if_not_exists: bool,
        attributes: &BTreeMap<String, String>,
    ) -> Result<bool, Error> {
        let prefixed = self.conn.prefix_table(table)?;
        let statements = self.compile_create_table(&prefixed, if_not_exists, attributes);
        self.reset();
        let ok = self.run_all(statements?).await?;

        if ok {
            if let Some(names) = self.conn.data_cache.table_names.as_mut() {
                if !names.contains(&prefixed) {
                    names.push(prefixed);
                }
            }
        }
        Ok(ok)
    }

    pub async fn drop_table(&mut self, table: &str, if_exists: bool, cascade: bool) -> Result<bool, Error> {
        let prefixed = self.conn.prefix_table(table)?;
        let rules = self.rules();

        let mut sql = String::from("DROP TABLE");
        if if_exists {
            sql.push_str(" IF EXISTS");
        }
        sql.push(' ');
        sql.push_str(&escape_identifiers(self.dialect(), &prefixed));
        if cascade && rules.drop_table_cascade() {
            sql.push_str(" CASCADE");
        }

        let ok = self.run_all(vec![sql]).await?;
        if ok {
            if let Some(names) = self.conn.data_cache.table_names.as_mut() {
                names.retain(|n| !n.eq_ignore_ascii_case(&prefixed));
            }
        }
        Ok(ok)
    }

    pub async fn rename_table(&mut self, table: &str, new_name: &str) -> Result<bool, Error> {
        let from = self.conn.prefix_table(table)?;
        let to = self.conn.prefix_table(new_name)?;
        let dialect = self.dialect();
        let sql = format!("ALTER TABLE {} RENAME TO {}", escape_identifiers(dialect, &from), escape_identifiers(dialect, &to));

        let ok = self.run_all(vec![sql]).await?;
        if ok {
            if let Some(names) = self.conn.data_cache.table_names.as_mut() {
                for name in names.iter_mut().filter(|n| **n == from) {
                    *name = to.clone();
                }
            }
        }
        Ok(ok)
    }

    /// Adds columns to an existing table.
    pub async fn add_column(&mut self, table: &str, fields: Vec<Field>) -> Result<bool, Error> {
        let prefixed = self.conn.prefix_table(table)?;
        self.fields.extend(fields);
        let statements = self.compile_alter(AlterKind::Add, &prefixed);
        self.reset();
        self.run_all(statements?).await
    }

    /// Changes column definitions. Use [`Field::rename`] to rename.
    pub async fn modify_column(&mut self, table: &str, fields: Vec<Field>) -> Result<bool, Error> {
        let prefixed = self.conn.prefix_table(table)?;
        self.fields.extend(fields);
        let statements = self.compile_alter(AlterKind::Change, &prefixed);
        self.reset();
        match statements {
            Ok(statements) => self.run_all(statements).await,
            Err(err @ Error::InvalidArgument(_)) => self.refuse(err),
            Err(err) => Err(err),
        }
    }

    pub async fn drop_column(&mut self, table: &str, columns: &[&str]) -> Result<bool, Error> {
        let prefixed = self.conn.prefix_table(table)?;
        let dialect = self.dialect();
        let statement = self
            .rules()
            .drop_column_statement(dialect, &escape_identifiers(dialect, &prefixed), &owned(columns));
        match statement {
            Ok(sql) => self.run_all(vec![sql]).await,
            Err(err) => self.refuse(err),
        }
    }

    /// Creates the pending keys and foreign keys on an existing table.
    pub async fn process_indexes(&mut self, table: &str) -> Result<bool, Error> {
        let prefixed = self.conn.prefix_table(table)?;
        let statements = self.compile_indexes(&prefixed);
        self.reset();
        match statements {
            Ok(statements) => self.run_all(statements).await,
            Err(err) => self.refuse(err),
        }
    }

    pub async fn drop_foreign_key(&mut self, table: &str, name: &str) -> Result<bool, Error> {
        let prefixed = self.conn.prefix_table(table)?;
        let dialect = self.dialect();
        let statement = self
            .rules()
            .drop_foreign_key_statement(&escape_identifiers(dialect, &prefixed), &escape_identifiers(dialect, name));
        match statement {
            Some(sql) => self.run_all(vec![sql]).await,
            None => self.refuse(Error::invalid_argument("This feature is not available for the database you are using.")),
        }
    }

    /// Creates a database. With `if_not_exists`, an existing database is left alone.
    pub async fn create_database(&mut self, name: &str, if_not_exists: bool) -> Result<bool, Error> {
        let rules = self.rules();
        let escaped = escape_identifiers(self.dialect(), name);

        if if_not_exists {
            if let Some(check) = rules.database_exists_query() {
                let outcome = self.conn.query(check, vec![name]).await?;
                if let Outcome::Rows(rows) = outcome {
                    if rows.get_num_rows() > 0 {
                        return Ok(true);
                    }
                }
            }
        }

        let config = self.conn.config();
        match rules.create_database_statement(&escaped, if_not_exists, &config.charset, &config.collation) {
            Some(sql) => self.run_all(vec![sql]).await,
            // Created on connect.
            None => Ok(true),
        }
    }

    /// Drops a database. On SQLite `name` is the database file, which is deleted.
    pub async fn drop_database(&mut self, name: &str) -> Result<bool, Error> {
        match self.rules().drop_database_statement(&escape_identifiers(self.dialect(), name)) {
            Some(sql) => {
                let ok = self.run_all(vec![sql]).await?;
                if ok {
                    self.conn.reset_data_cache();
                }
                Ok(ok)
            }
            None => match std::fs::remove_file(name) {
                Ok(()) => Ok(true),
                Err(e) => self.refuse(Error::InvalidArgument(format!("Unable to drop the specified database: {}", e))),
            },
        }
    }
}

fn owned(items: &[&str]) -> Vec<String> {
    items.iter().map(|s| s.to_string()).collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ConnectionConfig;
    use rstest::rstest;

    fn connection(driver: &str) -> Connection {
        let config = ConnectionConfig {
            driver: driver.to_string(),
            hostname: "localhost".to_string(),
            database: "app".to_string(),
            ..ConnectionConfig::default()
        };
        Connection::new(config).unwrap()
    }

    fn users_forge(forge: &mut Forge<'_>) {
        forge
            .add_field_definition("id")
            .unwrap()
            .add_field(Field::new("email", "varchar").constraint(255).unique())
            .add_field(Field::new("team_id", "INT").constraint(11).unsigned().null(true))
            .add_field(Field::new("active", "BOOLEAN").default_value(true))
            .add_key(&["email"])
            .add_foreign_key(&["team_id"], "teams", &["id"], Some("CASCADE"), Some("set null"));
    }

    #[test]
    fn mysql_create_table() {
        let mut conn = connection("mysqli");
        let mut forge = conn.forge();
        users_forge(&mut forge);
        forge.add_field(Field::new("note", "TEXT").null(true).comment("free text"));

        let attrs = BTreeMap::from([("engine".to_string(), "InnoDB".to_string())]);
        let sql = forge.compile_create_table("users", true, &attrs).unwrap();

        assert_eq!(sql.len(), 1);
        assert_eq!(
            sql[0],
            "CREATE TABLE IF NOT EXISTS `users` (\n\
             \t`id` INT(9) NOT NULL AUTO_INCREMENT,\n\
             \t`email` VARCHAR(255) NOT NULL UNIQUE,\n\
             \t`team_id` INT(11) UNSIGNED NULL,\n\
             \t`active` BOOLEAN NOT NULL DEFAULT 1,\n\
             \t`note` TEXT NULL COMMENT 'free text',\n\
             \tCONSTRAINT `pk_users` PRIMARY KEY(`id`),\n\
             \tKEY `users_email` (`email`),\n\
             \tCONSTRAINT `users_team_id_foreign` FOREIGN KEY (`team_id`) REFERENCES `teams`(`id`) ON DELETE SET NULL ON UPDATE CASCADE\n\
             ) ENGINE = InnoDB DEFAULT CHARACTER SET = utf8 COLLATE = utf8_general_ci"
        );
    }

    #[test]
    fn postgres_create_table() {
        let mut conn = connection("postgre");
        let mut forge = conn.forge();
        users_forge(&mut forge);

        let sql = forge.compile_create_table("users", false, &BTreeMap::new()).unwrap();
        assert_eq!(
            sql[0],
            "CREATE TABLE \"users\" (\n\
             \t\"id\" SERIAL NOT NULL,\n\
             \t\"email\" VARCHAR(255) NOT NULL UNIQUE,\n\
             \t\"team_id\" BIGINT NULL,\n\
             \t\"active\" BOOLEAN NOT NULL DEFAULT TRUE,\n\
             \tCONSTRAINT \"pk_users\" PRIMARY KEY(\"id\"),\n\
             \tCONSTRAINT \"users_team_id_foreign\" FOREIGN KEY (\"team_id\") REFERENCES \"teams\"(\"id\") ON DELETE SET NULL ON UPDATE CASCADE\n\
             )"
        );
        assert_eq!(sql[1], "CREATE INDEX \"users_email\" ON \"users\" (\"email\")");
    }

    #[test]
    fn sqlite_create_table() {
        let mut conn = connection("sqlite3");
        let mut forge = conn.forge();
        users_forge(&mut forge);
        forge.add_field(Field::new("role", "ENUM").values(["admin", "user"]));
        forge.add_unique_key(&["role", "email"]);

        let sql = forge.compile_create_table("users", false, &BTreeMap::new()).unwrap();
        assert_eq!(
            sql[0],
            "CREATE TABLE \"users\" (\n\
             \t\"id\" INTEGER PRIMARY KEY AUTOINCREMENT,\n\
             \t\"email\" VARCHAR(255) NOT NULL UNIQUE,\n\
             \t\"team_id\" INT(11) NULL,\n\
             \t\"active\" BOOLEAN NOT NULL DEFAULT 1,\n\
             \t\"role\" TEXT NOT NULL,\n\
             \tCONSTRAINT \"users_team_id_foreign\" FOREIGN KEY (\"team_id\") REFERENCES \"teams\"(\"id\") ON DELETE SET NULL ON UPDATE CASCADE\n\
             )"
        );
        assert_eq!(sql[1], "CREATE INDEX \"users_email\" ON \"users\" (\"email\")");
        assert_eq!(sql[2], "CREATE UNIQUE INDEX \"users_role_email\" ON \"users\" (\"role\", \"email\")");
    }

    #[rstest]
    #[case("postgre", "TINYINT", "\"flag\" SMALLINT NOT NULL")]
    #[case("postgre", "MEDIUMINT", "\"flag\" INTEGER NOT NULL")]
    #[case("postgre", "SMALLINT", "\"flag\" INTEGER NOT NULL")]
    #[case("postgre", "BIGINT", "\"flag\" NUMERIC NOT NULL")]
    #[case("postgre", "FLOAT", "\"flag\" DOUBLE PRECISION NOT NULL")]
    #[case("mysqli", "TINYINT", "`flag` TINYINT(3) UNSIGNED NOT NULL")]
    #[case("mysqli", "VARCHAR", "`flag` VARCHAR(3) NOT NULL")]
    #[case("sqlite3", "TINYINT", "\"flag\" TINYINT(3) NOT NULL")]
    fn unsigned_types_per_driver(#[case] driver: &str, #[case] sql_type: &str, #[case] expected: &str) {
        let conn = connection(driver);
        let rules = conn.driver().forge_rules();
        let field = Field::new("flag", sql_type).constraint(3).unsigned();
        let (parts, _) = process_field(rules, conn.dialect(), &field, true).unwrap();
        let column = rules.process_column(conn.dialect(), &parts);
        assert_eq!(column, expected);
        if driver != "mysqli" {
            assert!(!column.contains("UNSIGNED"));
        }
    }

    #[test]
    fn undefined_keys_are_skipped() {
        let mut conn = connection("postgre");
        let mut forge = conn.forge();
        forge
            .add_field(Field::new("id", "INT"))
            .add_primary_key(&["id", "ghost"], None)
            .add_key(&["ghost"])
            .add_foreign_key(&["ghost_id"], "ghosts", &["id"], None, Some("EXPLODE"));

        let sql = forge.compile_create_table("t", false, &BTreeMap::new()).unwrap();
        assert_eq!(sql, vec!["CREATE TABLE \"t\" (\n\t\"id\" INT NOT NULL,\n\tCONSTRAINT \"pk_t\" PRIMARY KEY(\"id\")\n)"]);
    }

    #[test]
    fn default_null_forces_nullable() {
        let conn = connection("mysqli");
        let rules = conn.driver().forge_rules();
        let field = Field::new("deleted_at", "DATETIME").default_value(Value::Null);
        let (parts, _) = process_field(rules, conn.dialect(), &field, true).unwrap();
        assert_eq!(rules.process_column(conn.dialect(), &parts), "`deleted_at` DATETIME NULL DEFAULT NULL");
    }

    #[test]
    fn constructors_start_from_blank_fields() {
        let field = Field::new("id", "INT");
        assert_eq!(field.default, None);
        assert_eq!(field.null, None);
        assert!(!field.auto_increment);

        let literal = Field::literal("`slug` VARCHAR(64)").unwrap();
        assert_eq!(literal.name, "slug");
        assert!(literal.sql_type.is_empty());

        assert_eq!(Field::new("id", "INT").default_value(0).default, Some(Value::from(0)));
    }

    #[test]
    fn literal_fields_pass_through() {
        let mut conn = connection("sqlite3");
        let mut forge = conn.forge();
        forge.add_field_definition("slug VARCHAR(64) NOT NULL").unwrap();
        assert!(forge.add_field_definition("nospace").is_err());

        let sql = forge.compile_create_table("pages", false, &BTreeMap::new()).unwrap();
        assert_eq!(sql[0], "CREATE TABLE \"pages\" (\n\tslug VARCHAR(64) NOT NULL\n)");
    }

    #[test]
    fn postgres_modify_column() {
        let mut conn = connection("postgre");
        let mut forge = conn.forge();
        forge.add_field(Field::new("name", "VARCHAR").constraint(100).null(false).default_value("n/a").rename("full_name"));

        let sql = forge.compile_alter(AlterKind::Change, "users").unwrap();
        assert_eq!(
            sql,
            vec![
                "ALTER TABLE \"users\" ALTER COLUMN \"name\" TYPE VARCHAR(100)",
                "ALTER TABLE \"users\" ALTER COLUMN \"name\" SET DEFAULT 'n/a'",
                "ALTER TABLE \"users\" ALTER COLUMN \"name\" SET NOT NULL",
                "ALTER TABLE \"users\" RENAME COLUMN \"name\" TO \"full_name\"",
            ]
        );
    }

    #[test]
    fn mysql_alter_combines_fields() {
        let mut conn = connection("mysqli");
        let mut forge = conn.forge();
        forge
            .add_field(Field::new("age", "INT").constraint(3).null(true))
            .add_field(Field::new("name", "VARCHAR").constraint(50).rename("title"));

        let add = forge.compile_alter(AlterKind::Add, "users").unwrap();
        assert_eq!(add, vec!["ALTER TABLE `users`\n\tADD `age` INT(3) NULL,\n\tADD `name` VARCHAR(50)"]);

        let change = forge.compile_alter(AlterKind::Change, "users").unwrap();
        assert_eq!(change, vec!["ALTER TABLE `users`\n\tMODIFY `age` INT(3) NULL,\n\tCHANGE `name` `title` VARCHAR(50)"]);
    }

    #[test]
    fn sqlite_refuses_column_changes() {
        let mut conn = connection("sqlite3");
        let mut forge = conn.forge();
        forge.add_field(Field::new("age", "INT"));
        assert!(matches!(forge.compile_alter(AlterKind::Change, "users"), Err(Error::InvalidArgument(_))));

        let add = forge.compile_alter(AlterKind::Add, "users").unwrap();
        assert_eq!(add, vec!["ALTER TABLE \"users\" ADD \"age\" INT"]);
    }

    #[test]
    fn drop_foreign_key_statements() {
        let pg = connection("postgre");
        let my = connection("mysqli");
        let lite = connection("sqlite3");
        assert_eq!(
            pg.driver().forge_rules().drop_foreign_key_statement("\"t\"", "\"fk\""),
            Some("ALTER TABLE \"t\" DROP CONSTRAINT \"fk\"".to_string())
        );
        assert_eq!(
            my.driver().forge_rules().drop_foreign_key_statement("`t`", "`fk`"),
            Some("ALTER TABLE `t` DROP FOREIGN KEY `fk`".to_string())
        );
        assert_eq!(lite.driver().forge_rules().drop_foreign_key_statement("\"t\"", "\"fk\""), None);
    }

    #[test]
    fn create_database_statements() {
        let my = connection("mysqli").driver().forge_rules();
        assert_eq!(
            my.create_database_statement("`shop`", true, "utf8mb4", "utf8mb4_unicode_ci"),
            Some("CREATE DATABASE IF NOT EXISTS `shop` CHARACTER SET utf8mb4 COLLATE utf8mb4_unicode_ci".to_string())
        );
        let pg = connection("postgre").driver().forge_rules();
        assert_eq!(pg.database_exists_query(), Some("SELECT 1 FROM pg_database WHERE datname = ?"));
        assert_eq!(pg.create_database_statement("\"shop\"", true, "", ""), Some("CREATE DATABASE \"shop\"".to_string()));
    }
}
