//! # Value Module
//!
//! The dynamically typed value that flows through binds, builder data,
//! prepared parameters and result rows.
//!
//! Values coming out of the database are decoded from their column type name
//! (`Value::from_column_text`). Values going in are either escaped into SQL
//! text by a dialect or bound natively by a prepared query.

use chrono::{DateTime, NaiveDate, NaiveDateTime, NaiveTime, Utc};
use uuid::Uuid;

use crate::temporal;

/// A single SQL value.
#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    Null,
    Bool(bool),
    Int(i64),
    Float(f64),
    Text(String),
    Bytes(Vec<u8>),
    DateTime(NaiveDateTime),
    Date(NaiveDate),
    Time(NaiveTime),
    /// A list rendered as `(a,b,c)`, used by `IN` conditions.
    List(Vec<Value>),
    /// Raw SQL inserted verbatim, never escaped.
    Raw(String),
}

impl Value {
    /// Builds a `List` from anything convertible.
    pub fn list<I, T>(items: I) -> Self
    where
        I: IntoIterator<Item = T>,
        T: Into<Value>,
    {
        Value::List(items.into_iter().map(Into::into).collect())
    }

    /// Wraps a raw SQL fragment.
    pub fn raw(sql: impl Into<String>) -> Self {
        Value::Raw(sql.into())
    }

    pub fn is_null(&self) -> bool {
        matches!(self, Value::Null)
    }

    /// Returns the value as text, when it is textual or numeric.
    pub fn as_text(&self) -> Option<String> {
        match self {
            Value::Text(s) | Value::Raw(s) => Some(s.clone()),
            Value::Int(i) => Some(i.to_string()),
            Value::Float(f) => Some(f.to_string()),
            Value::Bool(b) => Some(b.to_string()),
            _ => None,
        }
    }

    pub fn as_i64(&self) -> Option<i64> {
        match self {
            Value::Int(i) => Some(*i),
            Value::Bool(b) => Some(i64::from(*b)),
            Value::Text(s) => s.trim().parse().ok(),
            _ => None,
        }
    }

    pub fn as_bool(&self) -> Option<bool> {
        match self {
            Value::Bool(b) => Some(*b),
            Value::Int(i) => Some(*i != 0),
            Value::Text(s) => match s.as_str() {
                "t" | "true" | "TRUE" | "1" | "YES" | "yes" => Some(true),
                "f" | "false" | "FALSE" | "0" | "NO" | "no" => Some(false),
                _ => None,
            },
            _ => None,
        }
    }

    /// Decodes a cell delivered in text form, using the backend type name of
    /// its column to pick the variant.
    ///
    /// Integer and floating point names parse into numbers, boolean names into
    /// `Bool`. Anything that fails to parse stays `Text` so no data is lost.
    pub fn from_column_text(type_name: &str, text: String) -> Self {
        let upper = type_name.to_ascii_uppercase();

        if upper == "BOOL" || upper == "BOOLEAN" {
            return match text.as_str() {
                "t" | "true" | "1" => Value::Bool(true),
                "f" | "false" | "0" => Value::Bool(false),
                _ => Value::Text(text),
            };
        }

        if is_integer_type(&upper) {
            return text.trim().parse::<i64>().map(Value::Int).unwrap_or(Value::Text(text));
        }

        if is_float_type(&upper) {
            return text.trim().parse::<f64>().map(Value::Float).unwrap_or(Value::Text(text));
        }

        if temporal::is_temporal_type(&upper) {
            let parsed = match upper.as_str() {
                "DATE" => temporal::parse_naive_date(&text).ok().map(Value::Date),
                "TIME" => temporal::parse_naive_time(&text).ok().map(Value::Time),
                _ => temporal::parse_naive_datetime(&text).ok().map(Value::DateTime),
            };
            return parsed.unwrap_or(Value::Text(text));
        }

        Value::Text(text)
    }

    /// Converts into a JSON value, used to deserialize rows into structs.
    pub fn to_json(&self) -> serde_json::Value {
        match self {
            Value::Null => serde_json::Value::Null,
            Value::Bool(b) => serde_json::Value::Bool(*b),
            Value::Int(i) => serde_json::Value::from(*i),
            Value::Float(f) => serde_json::Number::from_f64(*f)
                .map(serde_json::Value::Number)
                .unwrap_or(serde_json::Value::Null),
            Value::Text(s) | Value::Raw(s) => serde_json::Value::String(s.clone()),
            Value::Bytes(b) => serde_json::Value::Array(b.iter().map(|x| serde_json::Value::from(*x)).collect()),
            Value::DateTime(dt) => serde_json::Value::String(dt.format("%Y-%m-%dT%H:%M:%S%.f").to_string()),
            Value::Date(d) => serde_json::Value::String(d.format("%Y-%m-%d").to_string()),
            Value::Time(t) => serde_json::Value::String(t.format("%H:%M:%S%.f").to_string()),
            Value::List(items) => serde_json::Value::Array(items.iter().map(Value::to_json).collect()),
        }
    }
}

fn is_integer_type(upper: &str) -> bool {
    matches!(
        upper,
        "INT2" | "INT4" | "INT8" | "SMALLINT" | "INTEGER" | "INT" | "BIGINT" | "TINYINT" | "MEDIUMINT"
            | "SMALLINT UNSIGNED" | "INT UNSIGNED" | "BIGINT UNSIGNED" | "TINYINT UNSIGNED" | "MEDIUMINT UNSIGNED"
            | "YEAR" | "OID"
    )
}

fn is_float_type(upper: &str) -> bool {
    matches!(upper, "FLOAT4" | "FLOAT8" | "REAL" | "FLOAT" | "DOUBLE" | "DOUBLE PRECISION")
}

// ============================================================================
// Conversions
// ============================================================================

impl From<bool> for Value {
    fn from(v: bool) -> Self {
        Value::Bool(v)
    }
}

macro_rules! from_int {
    ($($t:ty),*) => {
        $(impl From<$t> for Value {
            fn from(v: $t) -> Self {
                Value::Int(i64::from(v))
            }
        })*
    };
}

from_int!(i8, i16, i32, i64, u8, u16, u32);

impl From<f32> for Value {
    fn from(v: f32) -> Self {
        Value::Float(f64::from(v))
    }
}

impl From<f64> for Value {
    fn from(v: f64) -> Self {
        Value::Float(v)
    }
}

impl From<&str> for Value {
    fn from(v: &str) -> Self {
        Value::Text(v.to_string())
    }
}

impl From<String> for Value {
    fn from(v: String) -> Self {
        Value::Text(v)
    }
}

impl From<&String> for Value {
    fn from(v: &String) -> Self {
        Value::Text(v.clone())
    }
}

impl From<Vec<u8>> for Value {
    fn from(v: Vec<u8>) -> Self {
        Value::Bytes(v)
    }
}

impl From<NaiveDateTime> for Value {
    fn from(v: NaiveDateTime) -> Self {
        Value::DateTime(v)
    }
}

impl From<DateTime<Utc>> for Value {
    fn from(v: DateTime<Utc>) -> Self {
        Value::DateTime(v.naive_utc())
    }
}

impl From<NaiveDate> for Value {
    fn from(v: NaiveDate) -> Self {
        Value::Date(v)
    }
}

impl From<NaiveTime> for Value {
    fn from(v: NaiveTime) -> Self {
        Value::Time(v)
    }
}

impl From<Uuid> for Value {
    fn from(v: Uuid) -> Self {
        Value::Text(v.hyphenated().to_string())
    }
}

impl<T: Into<Value>> From<Option<T>> for Value {
    fn from(v: Option<T>) -> Self {
        v.map(Into::into).unwrap_or(Value::Null)
    }
}

impl<T: Into<Value>, const N: usize> From<[T; N]> for Value {
    fn from(v: [T; N]) -> Self {
        Value::list(v)
    }
}

// `Vec<u8>` is binary data, so list conversions are spelled out per element type.
macro_rules! from_vec {
    ($($t:ty),*) => {
        $(impl From<Vec<$t>> for Value {
            fn from(v: Vec<$t>) -> Self {
                Value::list(v)
            }
        })*
    };
}

from_vec!(Value, i32, i64, u32, f64, bool, &str, String);

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn column_text_is_decoded_by_type_name() {
        assert_eq!(Value::from_column_text("INT4", "42".into()), Value::Int(42));
        assert_eq!(Value::from_column_text("bigint", "-7".into()), Value::Int(-7));
        assert_eq!(Value::from_column_text("FLOAT8", "1.5".into()), Value::Float(1.5));
        assert_eq!(Value::from_column_text("BOOL", "t".into()), Value::Bool(true));
        assert_eq!(Value::from_column_text("VARCHAR", "abc".into()), Value::Text("abc".into()));
        assert_eq!(Value::from_column_text("NUMERIC", "10.25".into()), Value::Text("10.25".into()));
        assert_eq!(
            Value::from_column_text("DATE", "2024-01-31".into()),
            Value::Date(NaiveDate::from_ymd_opt(2024, 1, 31).unwrap())
        );
        assert!(matches!(Value::from_column_text("DATETIME", "2024-01-31 08:00:00".into()), Value::DateTime(_)));
    }

    #[test]
    fn unparsable_numbers_stay_text() {
        assert_eq!(Value::from_column_text("INTEGER", "n/a".into()), Value::Text("n/a".into()));
    }

    #[test]
    fn option_and_vec_conversions() {
        assert_eq!(Value::from(None::<i32>), Value::Null);
        assert_eq!(Value::from(Some("x")), Value::Text("x".into()));
        assert_eq!(Value::from(vec![1i64, 2]), Value::List(vec![Value::Int(1), Value::Int(2)]));
        assert_eq!(Value::from(vec![1u8, 2]), Value::Bytes(vec![1, 2]));
        assert_eq!(Value::from(["a"]), Value::List(vec![Value::Text("a".into())]));
    }
}
