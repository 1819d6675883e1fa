//! SQL injection guards used by the dialects and the bulk loader.
//!
//! Table names and native type names are interpolated into DDL text, so they
//! are validated before any statement is built. Values always travel as
//! positional parameters.

use crate::error::Error;

/// Longest identifier or type name accepted in DDL
const MAX_NAME_LEN: usize = 255;

/// Shared length and character checks; `what` names the kind of name in errors
fn check_name(what: &str, name: &str, allowed: impl Fn(char) -> bool) -> crate::Result<()> {
    if name.is_empty() {
        return Err(Error::config(format!("{} must not be empty", what)));
    }
    if name.len() > MAX_NAME_LEN {
        return Err(Error::config(format!(
            "{} is {} bytes long, at most {} allowed",
            what,
            name.len(),
            MAX_NAME_LEN
        )));
    }
    match name.chars().find(|c| !allowed(*c)) {
        Some(bad) => Err(Error::config(format!(
            "{} '{}' may not contain {:?}",
            what, name, bad
        ))),
        None => Ok(()),
    }
}

/// Validate one part of a table name (schema or table).
///
/// Accepts ASCII letters, digits and underscores, not starting with a digit,
/// up to 255 bytes.
///
/// ```
/// use cubestore_driver::security::validate_sql_identifier;
///
/// assert!(validate_sql_identifier("orders_main").is_ok());
/// assert!(validate_sql_identifier("_tmp").is_ok());
///
/// assert!(validate_sql_identifier("orders; DROP TABLE x").is_err());
/// assert!(validate_sql_identifier("").is_err());
/// assert!(validate_sql_identifier("1st").is_err());
/// ```
pub fn validate_sql_identifier(name: &str) -> crate::Result<()> {
    check_name("identifier", name, |c| c.is_ascii_alphanumeric() || c == '_')?;
    if name.starts_with(|c: char| c.is_ascii_digit()) {
        return Err(Error::config(format!(
            "identifier '{}' must not start with a digit",
            name
        )));
    }
    Ok(())
}

/// Validate a possibly schema-qualified table name (`schema.table` or `table`).
///
/// ```
/// use cubestore_driver::security::validate_table_name;
///
/// assert!(validate_table_name("dev_pre_aggregations.orders_main").is_ok());
/// assert!(validate_table_name("orders").is_ok());
///
/// assert!(validate_table_name("a.b.c").is_err());
/// assert!(validate_table_name("s.").is_err());
/// ```
pub fn validate_table_name(table: &str) -> crate::Result<()> {
    let parts: Vec<&str> = table.split('.').collect();
    if parts.len() > 2 {
        return Err(Error::config(format!(
            "table name '{}' must be 'schema.table' or 'table'",
            table
        )));
    }
    parts.into_iter().try_for_each(validate_sql_identifier)
}

/// Split a validated table name into its optional schema and table parts.
pub fn split_table_name(table: &str) -> (Option<&str>, &str) {
    match table.split_once('.') {
        Some((schema, name)) => (Some(schema), name),
        None => (None, table),
    }
}

/// Escape a string value for interpolation into a single-quoted SQL literal.
///
/// Used for `information_schema` filters, which are returned as complete SQL
/// text. Prefer parameters everywhere else.
///
/// ```
/// use cubestore_driver::security::escape_string_literal;
///
/// assert_eq!(escape_string_literal("db"), "db");
/// assert_eq!(escape_string_literal("don't"), "don''t");
/// ```
pub fn escape_string_literal(value: &str) -> String {
    value.replace('\'', "''")
}

/// Validate a native type name before it is placed in a `CREATE TABLE`.
///
/// Letters, digits, underscores, spaces, parentheses, commas and periods are
/// enough for `varchar(255)`, `decimal(10,2)` and `int unsigned`.
///
/// ```
/// use cubestore_driver::security::validate_sql_type_name;
///
/// assert!(validate_sql_type_name("varchar(255)").is_ok());
/// assert!(validate_sql_type_name("int) ; DROP TABLE x; --").is_err());
/// ```
pub fn validate_sql_type_name(type_name: &str) -> crate::Result<()> {
    check_name("type name", type_name, |c| {
        c.is_ascii_alphanumeric() || matches!(c, '_' | ' ' | '(' | ')' | ',' | '.')
    })
}
