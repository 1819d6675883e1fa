//! SQL dialect abstraction for cubestore-driver
//!
//! The core (pool, runner, loader) never writes backend-specific SQL itself;
//! it asks a `Dialect` for every statement. Multi-row inserts are built with
//! sea-query; DDL is assembled from validated identifiers and type names.
//!
//! - `MySqlDialect`: plain MySQL wire-protocol backend
//! - `CubeStoreDialect`: CubeStore (MySQL protocol, columnar storage), adds
//!   inline indexes, `LOCATION` file import and its own type mapping

use std::sync::LazyLock;

use sea_query::{Alias, Expr, IntoIden, MysqlQueryBuilder, Query, TableRef};

use crate::error::{Error, Result};
use crate::security::{
    escape_string_literal, split_table_name, validate_sql_type_name, validate_table_name,
};
use crate::types::{ColumnDescriptor, IndexSpec, SessionId, Value};

/// `CREATE INDEX <name> ON <table> (<rest>` → captures name and rest
static CREATE_INDEX_RE: LazyLock<regex::Regex> = LazyLock::new(|| {
    regex::Regex::new(r"(?is)^\s*CREATE\s+INDEX\s+(\S+)\s+ON\s+(\S+?)\s*\((.*)$")
        .expect("create index regex pattern is invalid - this is a bug")
});

fn sea_table_ref(schema: Option<&str>, table: &str) -> TableRef {
    match schema {
        Some(s) => TableRef::SchemaTable(Alias::new(s).into_iden(), Alias::new(table).into_iden()),
        None => TableRef::Table(Alias::new(table).into_iden()),
    }
}

/// `CREATE TABLE` built from a dialect's quoting and type mapping
fn create_table_with<D: Dialect + ?Sized>(
    dialect: &D,
    table: &str,
    columns: &[ColumnDescriptor],
) -> Result<String> {
    validate_table_name(table)?;
    if columns.is_empty() {
        return Err(Error::config(format!(
            "cannot create table {} without columns",
            table
        )));
    }

    let column_defs = columns
        .iter()
        .map(|c| {
            let native = dialect.from_generic_type(&c.generic_type);
            validate_sql_type_name(&native)?;
            Ok(format!("{} {}", dialect.quote_identifier(&c.name), native))
        })
        .collect::<Result<Vec<_>>>()?;

    Ok(format!("CREATE TABLE {} ({})", table, column_defs.join(", ")))
}

/// SQL dialect capability used by the connection layer
pub trait Dialect: Send + Sync {
    /// Get the dialect name
    fn name(&self) -> &'static str;

    /// Quote an identifier (column name)
    fn quote_identifier(&self, name: &str) -> String;

    /// Placeholder for the parameter at 0-based position `index`
    fn placeholder(&self, index: usize) -> String;

    /// Map a generic column type to the backend's native type
    fn from_generic_type(&self, generic_type: &str) -> String;

    /// Coerce an upload cell into the value the backend expects for `generic_type`
    fn to_column_value(&self, value: &Value, generic_type: &str) -> Value;

    /// Query listing user columns, optionally restricted to one database
    fn information_schema_query(&self, database: Option<&str>) -> String;

    /// `CREATE TABLE` statement for the given columns
    fn create_table_sql(&self, table: &str, columns: &[ColumnDescriptor]) -> Result<String>;

    /// `DROP TABLE` statement
    fn drop_table_sql(&self, table: &str) -> Result<String>;

    /// Query returning at least one row iff `table` exists
    fn table_exists_sql(&self, table: &str) -> Result<String>;

    /// Multi-row `INSERT` with `row_count × columns.len()` positional parameters
    fn insert_rows_sql(
        &self,
        table: &str,
        columns: &[ColumnDescriptor],
        row_count: usize,
    ) -> Result<String>;

    /// Whether tables can be created straight from file references
    fn supports_csv_import(&self) -> bool;

    /// Convert an index specification into a clause inlined in `CREATE TABLE`
    fn inline_index_clause(&self, index: &IndexSpec) -> Result<String>;

    /// Clause naming `file_count` file parameters as the table's data source
    fn location_clause(&self, file_count: usize) -> Result<String>;

    /// Trivial round-trip used for health checks
    fn ping_sql(&self) -> &'static str {
        "SELECT 1"
    }

    /// Introspection query returning the current session id in its first column
    fn session_id_sql(&self) -> &'static str {
        "select connection_id() as connectionId"
    }

    /// Statement killing another session
    fn kill_session_sql(&self, session: SessionId) -> String {
        format!("KILL {}", session)
    }
}

// ===========================================================================
// MySQL
// ===========================================================================

/// MySQL dialect
#[derive(Debug, Clone, Default)]
pub struct MySqlDialect;

impl Dialect for MySqlDialect {
    fn name(&self) -> &'static str {
        "MySQL"
    }

    fn quote_identifier(&self, name: &str) -> String {
        format!("`{}`", name.replace('`', "``"))
    }

    fn placeholder(&self, _index: usize) -> String {
        "?".to_string()
    }

    fn from_generic_type(&self, generic_type: &str) -> String {
        generic_type.to_string()
    }

    fn to_column_value(&self, value: &Value, _generic_type: &str) -> Value {
        value.clone()
    }

    fn information_schema_query(&self, _database: Option<&str>) -> String {
        format!(
            "SELECT columns.column_name as {}, \
             columns.table_name as {}, \
             columns.table_schema as {}, \
             columns.data_type as {} \
             FROM information_schema.columns \
             WHERE columns.table_schema NOT IN ('information_schema', 'mysql', 'performance_schema', 'sys')",
            self.quote_identifier("column_name"),
            self.quote_identifier("table_name"),
            self.quote_identifier("table_schema"),
            self.quote_identifier("data_type"),
        )
    }

    fn create_table_sql(&self, table: &str, columns: &[ColumnDescriptor]) -> Result<String> {
        create_table_with(self, table, columns)
    }

    fn drop_table_sql(&self, table: &str) -> Result<String> {
        validate_table_name(table)?;
        Ok(format!("DROP TABLE {}", table))
    }

    fn table_exists_sql(&self, table: &str) -> Result<String> {
        validate_table_name(table)?;
        let sql = match split_table_name(table) {
            (Some(schema), name) => format!(
                "SELECT table_name FROM information_schema.tables WHERE table_schema = '{}' AND table_name = '{}'",
                escape_string_literal(schema),
                escape_string_literal(name)
            ),
            (None, name) => format!(
                "SELECT table_name FROM information_schema.tables WHERE table_name = '{}'",
                escape_string_literal(name)
            ),
        };
        Ok(sql)
    }

    fn insert_rows_sql(
        &self,
        table: &str,
        columns: &[ColumnDescriptor],
        row_count: usize,
    ) -> Result<String> {
        validate_table_name(table)?;
        if row_count == 0 || columns.is_empty() {
            return Err(Error::internal(format!(
                "insert into {} needs at least one row and one column",
                table
            )));
        }

        let (schema, name) = split_table_name(table);
        let col_idens: Vec<_> = columns
            .iter()
            .map(|c| Alias::new(c.name.as_str()).into_iden())
            .collect();

        let mut stmt = Query::insert();
        stmt.into_table(sea_table_ref(schema, name)).columns(col_idens);
        for row in 0..row_count {
            let values: Vec<_> = (0..columns.len())
                .map(|col| Expr::cust(self.placeholder(row * columns.len() + col)))
                .collect();
            stmt.values(values)
                .map_err(|e| Error::internal(format!("failed to build insert: {}", e)))?;
        }

        Ok(stmt.to_string(MysqlQueryBuilder))
    }

    fn supports_csv_import(&self) -> bool {
        false
    }

    fn inline_index_clause(&self, _index: &IndexSpec) -> Result<String> {
        Err(Error::unsupported("MySQL dialect does not inline index definitions"))
    }

    fn location_clause(&self, _file_count: usize) -> Result<String> {
        Err(Error::unsupported("MySQL dialect does not import tables from files"))
    }
}

// ===========================================================================
// CubeStore: MySQL behaviour plus its own types, values and file import
// ===========================================================================

/// CubeStore dialect
#[derive(Debug, Clone, Default)]
pub struct CubeStoreDialect;

impl Dialect for CubeStoreDialect {
    fn name(&self) -> &'static str {
        "CubeStore"
    }

    fn quote_identifier(&self, name: &str) -> String {
        MySqlDialect.quote_identifier(name)
    }

    fn placeholder(&self, index: usize) -> String {
        MySqlDialect.placeholder(index)
    }

    fn from_generic_type(&self, generic_type: &str) -> String {
        match generic_type {
            "string" | "text" => "varchar(255)".to_string(),
            other => MySqlDialect.from_generic_type(other),
        }
    }

    fn to_column_value(&self, value: &Value, generic_type: &str) -> Value {
        match (generic_type, value) {
            // CubeStore rejects the trailing UTC designator
            ("timestamp", Value::String(s)) => Value::String(s.replacen('Z', "", 1)),
            ("boolean", Value::String(s)) if s.eq_ignore_ascii_case("true") => Value::Bool(true),
            ("boolean", Value::String(s)) if s.eq_ignore_ascii_case("false") => Value::Bool(false),
            _ => MySqlDialect.to_column_value(value, generic_type),
        }
    }

    fn information_schema_query(&self, database: Option<&str>) -> String {
        let base = MySqlDialect.information_schema_query(database);
        match database {
            Some(db) => format!(
                "{} AND columns.table_schema = '{}'",
                base,
                escape_string_literal(db)
            ),
            None => base,
        }
    }

    fn create_table_sql(&self, table: &str, columns: &[ColumnDescriptor]) -> Result<String> {
        create_table_with(self, table, columns)
    }

    fn drop_table_sql(&self, table: &str) -> Result<String> {
        MySqlDialect.drop_table_sql(table)
    }

    fn table_exists_sql(&self, table: &str) -> Result<String> {
        MySqlDialect.table_exists_sql(table)
    }

    fn insert_rows_sql(
        &self,
        table: &str,
        columns: &[ColumnDescriptor],
        row_count: usize,
    ) -> Result<String> {
        MySqlDialect.insert_rows_sql(table, columns, row_count)
    }

    fn supports_csv_import(&self) -> bool {
        true
    }

    fn inline_index_clause(&self, index: &IndexSpec) -> Result<String> {
        let caps = CREATE_INDEX_RE.captures(&index.sql).ok_or_else(|| {
            Error::unsupported(format!(
                "cannot inline index definition, expected 'CREATE INDEX <name> ON <table> (<columns>)': {}",
                index.sql
            ))
        })?;
        Ok(format!("INDEX {} ({}", &caps[1], &caps[3]))
    }

    fn location_clause(&self, file_count: usize) -> Result<String> {
        if file_count == 0 {
            return Err(Error::upload_shape("LOCATION needs at least one file"));
        }
        let placeholders: Vec<_> = (0..file_count).map(|i| self.placeholder(i)).collect();
        Ok(format!("LOCATION {}", placeholders.join(", ")))
    }
}

/// Get a dialect instance by backend name
pub fn dialect_for(name: &str) -> Box<dyn Dialect> {
    match name.to_lowercase().as_str() {
        "mysql" => Box::new(MySqlDialect),
        "cubestore" => Box::new(CubeStoreDialect),
        _ => Box::new(CubeStoreDialect), // Default to CubeStore
    }
}
