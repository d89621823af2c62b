//! String, value and identifier escaping shared by every driver.
//!
//! The dialect supplies the driver specific pieces (quote character, string
//! body escaping, boolean literals). Everything else is common.

use crate::{
    Error,
    drivers::Dialect,
    temporal,
    value::Value,
};

/// Identifiers never quoted.
const RESERVED_IDENTIFIERS: [&str; 1] = ["*"];

/// Removes ASCII control characters except tab, newline and carriage return.
pub fn remove_invisible_characters(value: &str) -> String {
    value
        .chars()
        .filter(|c| {
            let code = *c as u32;
            !(code <= 0x08 || code == 0x0B || code == 0x0C || (0x0E..=0x1F).contains(&code) || code == 0x7F)
        })
        .collect()
}

/// Escapes the body of a string literal (no surrounding quotes).
///
/// With `like` set, the dialect's LIKE escape character, `%` and `_` are
/// escaped so the value matches literally inside a LIKE pattern.
pub fn escape_string(dialect: &dyn Dialect, value: &str, like: bool) -> String {
    let cleaned = remove_invisible_characters(value);
    let escaped = dialect.escape_string_body(&cleaned);

    if !like {
        return escaped;
    }

    let esc = dialect.like_escape_char();
    let mut out = String::with_capacity(escaped.len() + 4);
    for c in escaped.chars() {
        // A backslash escape char was already doubled by the string escaping.
        if (c == esc && esc != '\\') || c == '%' || c == '_' {
            out.push(esc);
        }
        out.push(c);
    }
    out
}

/// `ESCAPE '<char>'` clause matching [`escape_string`] with `like` set.
pub fn like_escape_clause(dialect: &dyn Dialect) -> String {
    let esc = dialect.like_escape_char();
    if esc == '\\' {
        " ESCAPE '\\\\'".to_string()
    } else {
        format!(" ESCAPE '{}'", esc)
    }
}

/// Renders a value as a SQL literal.
///
/// # Errors
///
/// `Error::Escape` for binary data, non-finite floats and nested lists.
pub fn escape_value(dialect: &dyn Dialect, value: &Value) -> Result<String, Error> {
    match value {
        Value::Null => Ok("NULL".to_string()),
        Value::Bool(b) => Ok(dialect.bool_literal(*b).to_string()),
        Value::Int(i) => Ok(i.to_string()),
        Value::Float(f) if f.is_finite() => Ok(f.to_string()),
        Value::Float(f) => Err(Error::Escape(format!("cannot render non-finite float {} as SQL", f))),
        Value::Text(s) => Ok(format!("'{}'", escape_string(dialect, s, false))),
        Value::Raw(sql) => Ok(sql.clone()),
        Value::DateTime(dt) => Ok(format!(
            "'{}'",
            temporal::format_naive_datetime_for_driver(dt, dialect.driver())
        )),
        Value::Date(d) => Ok(format!("'{}'", temporal::format_naive_date(d))),
        Value::Time(t) => Ok(format!("'{}'", temporal::format_naive_time_for_driver(t, dialect.driver()))),
        Value::Bytes(_) => Err(Error::escape("binary values cannot be escaped into SQL text; use a prepared query")),
        Value::List(items) => {
            let mut parts = Vec::with_capacity(items.len());
            for item in items {
                if matches!(item, Value::List(_)) {
                    return Err(Error::escape("nested lists cannot be escaped"));
                }
                parts.push(escape_value(dialect, item)?);
            }
            Ok(format!("({})", parts.join(",")))
        }
    }
}

/// Quotes an identifier, each dot separated segment independently.
///
/// Numbers, string literals, function calls and `*` are returned unchanged.
/// Segments already wrapped in the quote character are not quoted twice.
pub fn escape_identifiers(dialect: &dyn Dialect, item: &str) -> String {
    let q = dialect.escape_char();

    if item.is_empty() || RESERVED_IDENTIFIERS.contains(&item) {
        return item.to_string();
    }

    if item.chars().all(|c| c.is_ascii_digit())
        || item.starts_with('\'')
        || (q != '"' && item.starts_with('"'))
        || item.contains('(')
    {
        return item.to_string();
    }

    item.split('.')
        .map(|segment| {
            if RESERVED_IDENTIFIERS.contains(&segment) {
                return segment.to_string();
            }
            let bare = segment.strip_prefix(q).unwrap_or(segment);
            let bare = bare.strip_suffix(q).unwrap_or(bare);
            format!("{q}{bare}{q}")
        })
        .collect::<Vec<_>>()
        .join(".")
}

/// Identifier protection with table prefix handling.
pub struct Identifiers<'a> {
    pub dialect: &'a dyn Dialect,
    pub prefix: &'a str,
    pub swap_pre: &'a str,
    /// Aliases declared in FROM/JOIN clauses of the current builder.
    pub aliased_tables: &'a [String],
}

impl Identifiers<'_> {
    /// Prefixes and quotes a table or column reference.
    ///
    /// - Aliases (`"users AS u"`, `"users u"`) are split off and quoted separately.
    /// - Function calls and literals pass through unchanged.
    /// - Dotted references get the table prefix on their table segment unless the
    ///   first segment is a known alias.
    /// - `prefix_single` prefixes bare names (used for table names).
    /// - `field_exists = false` means the last segment is the table itself.
    pub fn protect(&self, item: &str, prefix_single: bool, protect: bool, field_exists: bool) -> String {
        let collapsed = item.split_whitespace().collect::<Vec<_>>().join(" ");
        let mut item = collapsed.as_str();
        let mut alias = String::new();

        let upper = item.to_ascii_uppercase();
        if let Some(offset) = upper.rfind(" AS ").filter(|o| *o > 0) {
            let name = &item[offset + 4..];
            alias = if protect {
                format!(" AS {}", escape_identifiers(self.dialect, name))
            } else {
                item[offset..].to_string()
            };
            item = &item[..offset];
        } else if let Some(offset) = item.rfind(' ').filter(|o| *o > 0) {
            let name = &item[offset + 1..];
            alias = if protect {
                format!(" {}", escape_identifiers(self.dialect, name))
            } else {
                item[offset..].to_string()
            };
            item = &item[..offset];
        }

        if item.contains('(') || item.contains(')') || item.contains('\'') {
            return format!("{}{}", item, alias);
        }

        if item.contains('.') {
            let mut parts: Vec<String> = item.split('.').map(str::to_string).collect();

            if self.aliased_tables.iter().any(|a| a == &parts[0]) {
                let out = if protect { escape_identifiers(self.dialect, item) } else { item.to_string() };
                return format!("{}{}", out, alias);
            }

            if !self.prefix.is_empty() {
                let mut i = match parts.len() {
                    n if n >= 4 => 2,
                    3 => 1,
                    _ => 0,
                };
                if !field_exists {
                    i += 1;
                }
                if let Some(part) = parts.get_mut(i) {
                    *part = self.apply_prefix(part, true);
                }
            }

            let joined = parts.join(".");
            let out = if protect { escape_identifiers(self.dialect, &joined) } else { joined };
            return format!("{}{}", out, alias);
        }

        let mut name = item.to_string();
        if !self.prefix.is_empty() {
            name = self.apply_prefix(&name, prefix_single);
        }

        if protect && !RESERVED_IDENTIFIERS.contains(&name.as_str()) {
            name = escape_identifiers(self.dialect, &name);
        }

        format!("{}{}", name, alias)
    }

    fn apply_prefix(&self, name: &str, add_missing: bool) -> String {
        if !self.swap_pre.is_empty() {
            if let Some(rest) = name.strip_prefix(self.swap_pre) {
                return format!("{}{}", self.prefix, rest);
            }
        }
        if add_missing && !name.starts_with(self.prefix) {
            return format!("{}{}", self.prefix, name);
        }
        name.to_string()
    }
}
