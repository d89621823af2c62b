//! # Bottle DB Procedural Macros
//!
//! Provides `#[derive(Record)]`, which implements `bottle_db::Record` for a
//! struct with named fields so it can be handed to the query builder as row
//! data and to the forge as a table definition.
//!
//! ## Architecture
//!
//! - **`lib.rs`** (this file): macro entry point
//! - **`derive_record.rs`**: expansion of the derive
//! - **`types.rs`**: Rust type to column type mapping
//!
//! ## Usage
//!
//! This crate is re-exported by `bottle-db`:
//!
//! ```rust,ignore
//! use bottle_db::Record;
//!
//! #[derive(Record)]
//! #[record(table = "users")]
//! struct User {
//!     #[record(primary_key, auto_increment)]
//!     id: i64,
//!     #[record(size = 100, unique)]
//!     email: String,
//!     #[record(column = "display_name")]
//!     name: Option<String>,
//!     #[record(skip)]
//!     cached_score: u32,
//! }
//! ```
//!
//! ## Supported Attributes
//!
//! ### Struct
//! - `table = "..."` - table name; the snake_case struct name otherwise
//!
//! ### Field
//! - `primary_key` - part of the primary key
//! - `auto_increment` - auto-incrementing column
//! - `unique` - UNIQUE column
//! - `size = N` - `VARCHAR(N)` for strings, a length for other types
//! - `column = "..."` - column name differing from the field name
//! - `skip` - not a column

use proc_macro::TokenStream;
use syn::{DeriveInput, parse_macro_input};

mod derive_record;
mod types;

/// Derives `bottle_db::Record`.
///
/// # Generated Implementation
///
/// - `table_name()` - `#[record(table = "...")]` or the snake_case struct name
/// - `to_fields()` - `(column, Value)` pairs in declaration order
/// - `forge_fields()` - one `Field` per column with type, length, nullability
///   and attributes
/// - `primary_keys()` - columns marked `primary_key`
///
/// Field types must convert into `bottle_db::Value` and implement `Clone`.
///
/// # Errors
///
/// Compile errors for enums, unions, tuple structs and malformed attributes.
#[proc_macro_derive(Record, attributes(record))]
pub fn record_derive(input: TokenStream) -> TokenStream {
    let ast = parse_macro_input!(input as DeriveInput);
    derive_record::expand(ast).unwrap_or_else(syn::Error::into_compile_error).into()
}
