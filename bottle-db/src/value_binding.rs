//! # Value Binding Module
//!
//! Binds [`Value`]s as native parameters of a prepared statement, for any
//! sqlx argument buffer whose database encodes the basic scalar types.
//!
//! ## Features
//!
//! - **Typed Binding**: integers, floats, booleans and text bind as their
//!   native types; binary data binds as a blob
//! - **Temporal Types**: chrono date, time and datetime values bind natively
//! - **Raw Fragments**: bind as plain text, they are never spliced into SQL
//!
//! ```rust,ignore
//! let mut args = SqliteArguments::default();
//! args.bind_all(&[Value::from(1), Value::from("Ada")])?;
//! sqlx::query_with("INSERT INTO users (id, name) VALUES (?, ?)", args).execute(&mut conn).await?;
//! ```

use chrono::{NaiveDate, NaiveDateTime, NaiveTime};
use sqlx::{Arguments, Encode, Type};

use crate::{Error, value::Value};

// ============================================================================
// Value Binding Trait
// ============================================================================

/// Extension trait for binding values to sqlx argument buffers.
pub trait ValueBinder<'q> {
    /// Binds one value.
    ///
    /// # Errors
    ///
    /// `Error::InvalidArgument` for lists (expand them into one placeholder per
    /// element) or when the driver refuses the value.
    fn bind_value(&mut self, value: &Value) -> Result<(), Error>;

    /// Binds every value in order.
    fn bind_all(&mut self, values: &[Value]) -> Result<(), Error> {
        for value in values {
            self.bind_value(value)?;
        }
        Ok(())
    }
}

impl<'q, A> ValueBinder<'q> for A
where
    A: Arguments<'q>,
    i64: Encode<'q, A::Database> + Type<A::Database>,
    f64: Encode<'q, A::Database> + Type<A::Database>,
    bool: Encode<'q, A::Database> + Type<A::Database>,
    String: Encode<'q, A::Database> + Type<A::Database>,
    Option<String>: Encode<'q, A::Database> + Type<A::Database>,
    Vec<u8>: Encode<'q, A::Database> + Type<A::Database>,
    NaiveDateTime: Encode<'q, A::Database> + Type<A::Database>,
    NaiveDate: Encode<'q, A::Database> + Type<A::Database>,
    NaiveTime: Encode<'q, A::Database> + Type<A::Database>,
{
    fn bind_value(&mut self, value: &Value) -> Result<(), Error> {
        let added = match value {
            Value::Null => self.add(None::<String>),
            Value::Bool(b) => self.add(*b),
            Value::Int(i) => self.add(*i),
            Value::Float(f) => self.add(*f),
            Value::Text(s) | Value::Raw(s) => self.add(s.clone()),
            Value::Bytes(b) => self.add(b.clone()),
            Value::DateTime(dt) => self.add(*dt),
            Value::Date(d) => self.add(*d),
            Value::Time(t) => self.add(*t),
            Value::List(_) => {
                return Err(Error::invalid_argument("list values cannot be bound to a single placeholder"));
            }
        };
        added.map_err(|e| Error::InvalidArgument(format!("failed to bind {:?}: {}", value, e)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use sqlx::sqlite::SqliteArguments;

    #[test]
    fn scalars_bind_in_order() {
        let mut args = SqliteArguments::default();
        args.bind_all(&[Value::from(1), Value::from("Ada"), Value::Null, Value::Bytes(vec![1, 2])])
            .unwrap();
        assert_eq!(args.len(), 4);
    }

    #[test]
    fn lists_cannot_be_bound() {
        let mut args = SqliteArguments::default();
        let err = args.bind_value(&Value::from(vec![1i64, 2])).unwrap_err();
        assert!(matches!(err, Error::InvalidArgument(_)));
    }
}
