//! # Temporal Formatting Module
//!
//! This module renders chrono values into the text form each database driver
//! expects, and parses the text forms back when rows are read.
//!
//! ## Key Features
//!
//! - **Driver-Specific Formats**: Fractional precision differs between MySQL/Postgres and SQLite
//! - **Format Consistency**: Escaped literals and bound parameters use the same text
//! - **Lenient Parsing**: Accepts `T` or space separators and optional fractions
//!
//! ## Supported Types
//!
//! - `NaiveDateTime` - Timestamp without timezone
//! - `NaiveDate` - Date only (year, month, day)
//! - `NaiveTime` - Time only (hour, minute, second)

use chrono::{NaiveDate, NaiveDateTime, NaiveTime};

use crate::Error;
use crate::database::Drivers;

// ============================================================================
// Format Conversion Utilities
// ============================================================================

/// Converts a `NaiveDateTime` to the format expected by a specific driver.
///
/// ## PostgreSQL / MySQL
/// - Format: "YYYY-MM-DD HH:MM:SS.ffffff"
///
/// ## SQLite
/// - Stored as TEXT, fraction only when present
/// - Format: "YYYY-MM-DD HH:MM:SS.fff"
pub fn format_naive_datetime_for_driver(value: &NaiveDateTime, driver: Drivers) -> String {
    match driver {
        Drivers::Postgres | Drivers::MySQL => value.format("%Y-%m-%d %H:%M:%S%.6f").to_string(),
        Drivers::SQLite => value.format("%Y-%m-%d %H:%M:%S%.f").to_string(),
    }
}

/// Converts a `NaiveDate` to ISO 8601 `YYYY-MM-DD`, identical for all drivers.
pub fn format_naive_date(value: &NaiveDate) -> String {
    value.format("%Y-%m-%d").to_string()
}

/// Converts a `NaiveTime` to the format expected by a specific driver.
pub fn format_naive_time_for_driver(value: &NaiveTime, driver: Drivers) -> String {
    match driver {
        Drivers::Postgres | Drivers::MySQL => value.format("%H:%M:%S%.6f").to_string(),
        Drivers::SQLite => value.format("%H:%M:%S%.f").to_string(),
    }
}

// ============================================================================
// Parsing
// ============================================================================

/// Parses a string into a `NaiveDateTime`.
///
/// Accepts both the ISO `T` separator and the SQL space separator.
pub fn parse_naive_datetime(value: &str) -> Result<NaiveDateTime, Error> {
    let trimmed = value.trim();
    NaiveDateTime::parse_from_str(trimmed, "%Y-%m-%d %H:%M:%S%.f")
        .or_else(|_| NaiveDateTime::parse_from_str(trimmed, "%Y-%m-%dT%H:%M:%S%.f"))
        .map_err(|e| Error::Escape(format!("Failed to parse NaiveDateTime '{}': {}", value, e)))
}

/// Parses a string into a `NaiveDate`.
pub fn parse_naive_date(value: &str) -> Result<NaiveDate, Error> {
    value
        .trim()
        .parse::<NaiveDate>()
        .map_err(|e| Error::Escape(format!("Failed to parse NaiveDate '{}': {}", value, e)))
}

/// Parses a string into a `NaiveTime`.
pub fn parse_naive_time(value: &str) -> Result<NaiveTime, Error> {
    value
        .trim()
        .parse::<NaiveTime>()
        .map_err(|e| Error::Escape(format!("Failed to parse NaiveTime '{}': {}", value, e)))
}

/// Checks if a column type name is a temporal type.
pub fn is_temporal_type(type_name: &str) -> bool {
    matches!(
        type_name.to_ascii_uppercase().as_str(),
        "TIMESTAMPTZ" | "TIMESTAMP" | "DATETIME" | "DATE" | "TIME" | "TIMETZ"
    )
}
