//! # Result Module
//!
//! What a statement gives back: rows (`ResultSet`), a write acknowledgement
//! (`WriteAck`), a failure sentinel or, in pretend mode, the compiled query.
//!
//! ## Row Access
//!
//! - `get_result()` / `get_result_array()` return every row
//! - `get_result_as::<T>()` deserializes rows through `serde_json`
//! - `get_row(n)`, `get_first_row()`, `get_next_row()`, ... move a cursor
//! - `get_unbuffered_row()` walks rows from the seek position
//!
//! ```rust,ignore
//! #[derive(Deserialize)]
//! struct User { id: i64, name: String }
//!
//! let users: Vec<User> = conn.table("users")?.get().await?.into_result()?.get_result_as()?;
//! ```

use std::{collections::BTreeMap, sync::OnceLock};

use serde::de::DeserializeOwned;

use crate::{
    Error,
    drivers::{ColumnMeta, RowSet},
    introspection::FieldData,
    query::Query,
    value::Value,
};

// ============================================================================
// Outcome
// ============================================================================

/// Acknowledgement of a write statement.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct WriteAck {
    pub affected_rows: u64,
    pub insert_id: Option<i64>,
}

/// Outcome of running a query.
#[derive(Debug)]
pub enum Outcome {
    /// A read returned rows.
    Rows(ResultSet),
    /// A write was acknowledged.
    Write(WriteAck),
    /// The backend rejected the query and debug mode is off. The query
    /// carries the error code and message.
    Failed(Query),
    /// Pretend mode: the compiled query, not executed.
    Pretend(Query),
}

impl Outcome {
    /// True unless the query failed.
    pub fn is_ok(&self) -> bool {
        !matches!(self, Outcome::Failed(_))
    }

    /// The rows of a read.
    ///
    /// # Errors
    ///
    /// - `Error::Execution` for a failed query
    /// - `Error::InvalidArgument` for writes and pretend outcomes
    pub fn into_result(self) -> Result<ResultSet, Error> {
        match self {
            Outcome::Rows(rows) => Ok(rows),
            Outcome::Failed(query) => Err(failure(&query)),
            Outcome::Write(_) => Err(Error::invalid_argument("the statement did not return rows")),
            Outcome::Pretend(_) => Err(Error::invalid_argument("pretend mode does not return rows")),
        }
    }

    /// The acknowledgement of a write.
    pub fn into_ack(self) -> Result<WriteAck, Error> {
        match self {
            Outcome::Write(ack) => Ok(ack),
            Outcome::Failed(query) => Err(failure(&query)),
            _ => Err(Error::invalid_argument("the statement was not a write")),
        }
    }

    pub fn affected_rows(&self) -> u64 {
        match self {
            Outcome::Write(ack) => ack.affected_rows,
            _ => 0,
        }
    }

    /// The compiled query, for pretend and failed outcomes.
    pub fn query(&self) -> Option<&Query> {
        match self {
            Outcome::Failed(q) | Outcome::Pretend(q) => Some(q),
            _ => None,
        }
    }
}

fn failure(query: &Query) -> Error {
    Error::Execution {
        code: query.get_error_code().map(str::to_string),
        message: query.get_error_message().unwrap_or_default().to_string(),
        sql: query.get_query().to_string(),
    }
}

// ============================================================================
// Row
// ============================================================================

/// One result row: column names and values in select order.
#[derive(Debug, Clone, PartialEq)]
pub struct Row {
    cells: Vec<(String, Value)>,
}

impl Row {
    /// Value of a column, matched case-insensitively.
    pub fn get(&self, column: &str) -> Option<&Value> {
        self.cells.iter().find(|(name, _)| name.eq_ignore_ascii_case(column)).map(|(_, v)| v)
    }

    pub fn get_i64(&self, column: &str) -> Option<i64> {
        self.get(column).and_then(Value::as_i64)
    }

    pub fn get_text(&self, column: &str) -> Option<String> {
        self.get(column).and_then(Value::as_text)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &Value)> {
        self.cells.iter().map(|(k, v)| (k.as_str(), v))
    }

    pub fn values(&self) -> Vec<&Value> {
        self.cells.iter().map(|(_, v)| v).collect()
    }

    pub fn len(&self) -> usize {
        self.cells.len()
    }

    pub fn is_empty(&self) -> bool {
        self.cells.is_empty()
    }

    /// Row as a JSON object.
    pub fn to_json(&self) -> serde_json::Value {
        let map = self.cells.iter().map(|(k, v)| (k.clone(), v.to_json())).collect();
        serde_json::Value::Object(map)
    }

    pub fn into_map(self) -> BTreeMap<String, Value> {
        self.cells.into_iter().collect()
    }

    /// Deserializes the row.
    pub fn deserialize<T: DeserializeOwned>(&self) -> Result<T, Error> {
        Ok(serde_json::from_value(self.to_json())?)
    }
}

// ============================================================================
// Result Set
// ============================================================================

/// A buffered result set with a row cursor.
#[derive(Debug)]
pub struct ResultSet {
    columns: Vec<ColumnMeta>,
    rows: Vec<Vec<Value>>,
    current_row: usize,
    fetch_position: usize,
    freed: bool,
    field_names: OnceLock<Vec<String>>,
    field_data: OnceLock<Vec<FieldData>>,
}

impl ResultSet {
    pub(crate) fn new(rows: RowSet) -> Self {
        Self {
            columns: rows.columns,
            rows: rows.rows,
            current_row: 0,
            fetch_position: 0,
            freed: false,
            field_names: OnceLock::new(),
            field_data: OnceLock::new(),
        }
    }

    fn row_at(&self, idx: usize) -> Option<Row> {
        let values = self.rows.get(idx)?;
        let cells = self.columns.iter().map(|c| c.name.clone()).zip(values.iter().cloned()).collect();
        Some(Row { cells })
    }

    // ========================================================================
    // Metadata
    // ========================================================================

    pub fn get_num_rows(&self) -> usize {
        self.rows.len()
    }

    pub fn get_field_count(&self) -> usize {
        self.columns.len()
    }

    /// Column names, computed once.
    pub fn get_field_names(&self) -> &[String] {
        self.field_names.get_or_init(|| self.columns.iter().map(|c| c.name.clone()).collect())
    }

    /// Column metadata, computed once. `max_length` is the widest value of the
    /// column in this result. Key and nullability flags come from the table
    /// column the driver traced the result column to.
    pub fn get_field_data(&self) -> &[FieldData] {
        self.field_data.get_or_init(|| {
            self.columns
                .iter()
                .enumerate()
                .map(|(idx, col)| {
                    let width = self
                        .rows
                        .iter()
                        .filter_map(|r| r.get(idx).and_then(Value::as_text))
                        .map(|t| t.chars().count() as u64)
                        .max();
                    FieldData {
                        name: col.name.clone(),
                        type_name: col.type_name.clone(),
                        max_length: width,
                        default: None,
                        primary_key: col.primary_key,
                        nullable: col.nullable,
                    }
                })
                .collect()
        })
    }

    // ========================================================================
    // Whole Result
    // ========================================================================

    /// Every row.
    pub fn get_result(&self) -> Vec<Row> {
        (0..self.rows.len()).filter_map(|i| self.row_at(i)).collect()
    }

    /// Every row as a column-keyed map.
    pub fn get_result_array(&self) -> Vec<BTreeMap<String, Value>> {
        self.get_result().into_iter().map(Row::into_map).collect()
    }

    /// Every row deserialized into `T`.
    ///
    /// # Errors
    ///
    /// `Error::Decode` when a row does not match `T`.
    pub fn get_result_as<T: DeserializeOwned>(&self) -> Result<Vec<T>, Error> {
        self.get_result().iter().map(Row::deserialize).collect()
    }

    // ========================================================================
    // Cursor
    // ========================================================================

    /// Row `n`. An out-of-range `n` returns the current row.
    pub fn get_row(&mut self, n: usize) -> Option<Row> {
        if n < self.rows.len() {
            self.current_row = n;
        }
        self.row_at(self.current_row)
    }

    /// Row `n` deserialized into `T`.
    pub fn get_row_as<T: DeserializeOwned>(&mut self, n: usize) -> Result<Option<T>, Error> {
        self.get_row(n).map(|row| row.deserialize()).transpose()
    }

    pub fn get_first_row(&mut self) -> Option<Row> {
        self.current_row = 0;
        self.row_at(0)
    }

    pub fn get_last_row(&mut self) -> Option<Row> {
        self.current_row = self.rows.len().saturating_sub(1);
        self.row_at(self.current_row)
    }

    pub fn get_next_row(&mut self) -> Option<Row> {
        let next = self.current_row + 1;
        let row = self.row_at(next)?;
        self.current_row = next;
        Some(row)
    }

    pub fn get_previous_row(&mut self) -> Option<Row> {
        let prev = self.current_row.checked_sub(1)?;
        let row = self.row_at(prev)?;
        self.current_row = prev;
        Some(row)
    }

    /// Next row from the fetch position, advancing it.
    pub fn get_unbuffered_row(&mut self) -> Option<Row> {
        let row = self.row_at(self.fetch_position)?;
        self.fetch_position += 1;
        Some(row)
    }

    /// Moves the fetch position. Returns false when `n` is out of range.
    pub fn data_seek(&mut self, n: usize) -> bool {
        if n >= self.rows.len() {
            return false;
        }
        self.fetch_position = n;
        true
    }

    /// Drops the buffered rows. Calling it again does nothing.
    pub fn free_result(&mut self) {
        if self.freed {
            return;
        }
        self.rows = Vec::new();
        self.current_row = 0;
        self.fetch_position = 0;
        self.freed = true;
    }

    pub fn is_freed(&self) -> bool {
        self.freed
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::Deserialize;

    fn sample() -> ResultSet {
        ResultSet::new(RowSet {
            columns: vec![
                ColumnMeta { primary_key: true, nullable: false, ..ColumnMeta::new("id", "INTEGER") },
                ColumnMeta::new("name", "TEXT"),
            ],
            rows: vec![
                vec![Value::Int(1), Value::from("Ada")],
                vec![Value::Int(2), Value::from("Grace")],
                vec![Value::Int(3), Value::Null],
            ],
        })
    }

    #[derive(Debug, Deserialize, PartialEq)]
    struct Person {
        id: i64,
        name: Option<String>,
    }

    #[test]
    fn rows_deserialize_into_structs() {
        let people: Vec<Person> = sample().get_result_as().unwrap();
        assert_eq!(people[0], Person { id: 1, name: Some("Ada".into()) });
        assert_eq!(people[2].name, None);
    }

    #[test]
    fn mismatched_rows_are_decode_errors() {
        #[derive(Debug, Deserialize)]
        #[allow(dead_code)]
        struct Wrong {
            id: String,
        }
        assert!(matches!(sample().get_result_as::<Wrong>(), Err(Error::Decode(_))));
    }

    #[test]
    fn cursor_navigation() {
        let mut rs = sample();
        assert_eq!(rs.get_row(1).unwrap().get_i64("id"), Some(2));
        assert_eq!(rs.get_next_row().unwrap().get_i64("id"), Some(3));
        assert!(rs.get_next_row().is_none());
        assert_eq!(rs.get_previous_row().unwrap().get_i64("id"), Some(2));
        assert_eq!(rs.get_first_row().unwrap().get_text("name").as_deref(), Some("Ada"));
        assert_eq!(rs.get_last_row().unwrap().get_i64("ID"), Some(3));
        // Out of range keeps the current row.
        assert_eq!(rs.get_row(10).unwrap().get_i64("id"), Some(3));
    }

    #[test]
    fn seek_and_unbuffered_reads() {
        let mut rs = sample();
        assert!(rs.data_seek(2));
        assert_eq!(rs.get_unbuffered_row().unwrap().get_i64("id"), Some(3));
        assert!(rs.get_unbuffered_row().is_none());
        assert!(!rs.data_seek(3));
    }

    #[test]
    fn field_metadata_is_cached() {
        let rs = sample();
        assert_eq!(rs.get_field_names(), ["id", "name"]);
        let data = rs.get_field_data();
        assert_eq!(data[1].max_length, Some(5));
        assert!(data[0].primary_key && !data[0].nullable);
        assert!(!data[1].primary_key && data[1].nullable);
        assert!(std::ptr::eq(data, rs.get_field_data()));
        assert_eq!(rs.get_field_count(), 2);
    }

    #[test]
    fn free_result_is_idempotent() {
        let mut rs = sample();
        rs.free_result();
        rs.free_result();
        assert!(rs.is_freed());
        assert_eq!(rs.get_num_rows(), 0);
    }

    #[test]
    fn result_array_is_keyed_by_column() {
        let rows = sample().get_result_array();
        assert_eq!(rows[1].get("name"), Some(&Value::from("Grace")));
    }
}
