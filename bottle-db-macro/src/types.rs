//! # Type Mapping
//!
//! Maps Rust field types onto forge column types. The names are the generic
//! ones the forge understands; driver rules narrow them further (`DATETIME`
//! becomes `TIMESTAMP` on Postgre, unsigned types widen there, and so on).
//!
//! | Rust                              | Column           |
//! |-----------------------------------|------------------|
//! | `i8` / `u8`                       | `TINYINT`        |
//! | `i16` / `u16`                     | `SMALLINT`       |
//! | `i32` / `u32`                     | `INT`            |
//! | `i64`                             | `BIGINT`         |
//! | `f32`                             | `FLOAT`          |
//! | `f64`                             | `DOUBLE`         |
//! | `bool`                            | `BOOLEAN`        |
//! | `String`                          | `TEXT`, or `VARCHAR(N)` with `size` |
//! | `Vec<u8>`                         | `BLOB`           |
//! | `Uuid`                            | `CHAR(36)`       |
//! | `NaiveDateTime` / `DateTime<Tz>`  | `DATETIME`       |
//! | `NaiveDate`                       | `DATE`           |
//! | `NaiveTime`                       | `TIME`           |
//! | `Option<T>`                       | as `T`, nullable |
//!
//! Unsigned Rust integers set the column's unsigned flag. Anything else maps
//! to `TEXT`.

use syn::{GenericArgument, PathArguments, Type};

/// Column type derived from a field type.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ColumnType {
    pub sql_type: &'static str,
    pub length: Option<u32>,
    pub unsigned: bool,
    pub nullable: bool,
}

impl ColumnType {
    fn new(sql_type: &'static str) -> Self {
        Self { sql_type, length: None, unsigned: false, nullable: false }
    }

    fn unsigned(sql_type: &'static str) -> Self {
        Self { unsigned: true, ..Self::new(sql_type) }
    }
}

/// The generic argument of `Option<T>` / `Vec<T>`.
fn first_generic(arguments: &PathArguments) -> Option<&Type> {
    match arguments {
        PathArguments::AngleBracketed(args) => args.args.iter().find_map(|arg| match arg {
            GenericArgument::Type(ty) => Some(ty),
            _ => None,
        }),
        _ => None,
    }
}

pub fn rust_type_to_column(ty: &Type) -> ColumnType {
    let Type::Path(type_path) = ty else {
        return ColumnType::new("TEXT");
    };
    let Some(segment) = type_path.path.segments.last() else {
        return ColumnType::new("TEXT");
    };

    match segment.ident.to_string().as_str() {
        "Option" => match first_generic(&segment.arguments) {
            Some(inner) => ColumnType { nullable: true, ..rust_type_to_column(inner) },
            None => ColumnType { nullable: true, ..ColumnType::new("TEXT") },
        },
        "Vec" => match first_generic(&segment.arguments) {
            Some(Type::Path(inner)) if inner.path.is_ident("u8") => ColumnType::new("BLOB"),
            _ => ColumnType::new("TEXT"),
        },
        "i8" => ColumnType::new("TINYINT"),
        "u8" => ColumnType::unsigned("TINYINT"),
        "i16" => ColumnType::new("SMALLINT"),
        "u16" => ColumnType::unsigned("SMALLINT"),
        "i32" => ColumnType::new("INT"),
        "u32" => ColumnType::unsigned("INT"),
        "i64" => ColumnType::new("BIGINT"),
        "f32" => ColumnType::new("FLOAT"),
        "f64" => ColumnType::new("DOUBLE"),
        "bool" => ColumnType::new("BOOLEAN"),
        "String" => ColumnType::new("TEXT"),
        "Uuid" => ColumnType { length: Some(36), ..ColumnType::new("CHAR") },
        "NaiveDateTime" | "DateTime" => ColumnType::new("DATETIME"),
        "NaiveDate" => ColumnType::new("DATE"),
        "NaiveTime" => ColumnType::new("TIME"),
        _ => ColumnType::new("TEXT"),
    }
}

/// Applies `#[record(size = N)]`: strings become `VARCHAR(N)`, other types
/// take `N` as their length.
pub fn apply_size(column: &mut ColumnType, size: u32) {
    if column.sql_type == "TEXT" {
        column.sql_type = "VARCHAR";
    }
    column.length = Some(size);
}
