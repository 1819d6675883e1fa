//! Value and upload types for cubestore-driver
//!
//! - `Value`: a single cell, either sent as a parameter or read back
//! - `Row`: an ordered result row
//! - `ColumnDescriptor`, `TableData`, `IndexSpec`: inputs of a bulk upload
//! - `SessionId`: the backend identity of one physical connection

use chrono::{DateTime, NaiveDate, NaiveDateTime, NaiveTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Deserializer, Serialize};
use std::collections::HashMap;
use std::fmt;

use crate::error::{Error, Result};

/// SQL value type that can hold any cell sent to or read from the backend
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Value {
    /// SQL NULL
    Null,
    /// Boolean value
    Bool(bool),
    /// 8-bit signed integer (TINYINT)
    Int8(i8),
    /// 16-bit signed integer (SMALLINT)
    Int16(i16),
    /// 32-bit signed integer (INTEGER)
    Int32(i32),
    /// 64-bit signed integer (BIGINT)
    Int64(i64),
    /// 32-bit floating point (FLOAT)
    Float32(f32),
    /// 64-bit floating point (DOUBLE)
    Float64(f64),
    /// Arbitrary precision decimal (DECIMAL)
    Decimal(Decimal),
    /// Text string (VARCHAR, TEXT)
    String(String),
    /// Binary data (BLOB, VARBINARY)
    Bytes(Vec<u8>),
    /// Date without time (DATE)
    Date(NaiveDate),
    /// Time without date (TIME)
    Time(NaiveTime),
    /// Timestamp without timezone (TIMESTAMP)
    DateTime(NaiveDateTime),
    /// Timestamp with timezone
    DateTimeTz(DateTime<Utc>),
    /// JSON value that has no scalar representation
    Json(serde_json::Value),
}

impl Value {
    /// Check if value is NULL
    #[inline]
    pub const fn is_null(&self) -> bool {
        matches!(self, Self::Null)
    }

    /// Convert a JSON document cell into the closest scalar value.
    ///
    /// Objects and arrays stay as `Value::Json`.
    pub fn from_json(json: serde_json::Value) -> Self {
        match json {
            serde_json::Value::Null => Self::Null,
            serde_json::Value::Bool(b) => Self::Bool(b),
            serde_json::Value::Number(n) => match n.as_i64() {
                Some(i) => Self::Int64(i),
                None => n.as_f64().map(Self::Float64).unwrap_or(Self::Null),
            },
            serde_json::Value::String(s) => Self::String(s),
            other => Self::Json(other),
        }
    }

    /// Try to convert to bool
    pub fn as_bool(&self) -> Option<bool> {
        match self {
            Self::Bool(b) => Some(*b),
            Self::Int8(n) => Some(*n != 0),
            Self::Int16(n) => Some(*n != 0),
            Self::Int32(n) => Some(*n != 0),
            Self::Int64(n) => Some(*n != 0),
            _ => None,
        }
    }

    /// Try to convert to i64
    pub fn as_i64(&self) -> Option<i64> {
        match self {
            Self::Int8(n) => Some(i64::from(*n)),
            Self::Int16(n) => Some(i64::from(*n)),
            Self::Int32(n) => Some(i64::from(*n)),
            Self::Int64(n) => Some(*n),
            Self::Decimal(d) => d.to_string().parse().ok(),
            Self::String(s) => s.parse().ok(),
            _ => None,
        }
    }

    /// Try to convert to f64
    pub fn as_f64(&self) -> Option<f64> {
        match self {
            Self::Int8(n) => Some(f64::from(*n)),
            Self::Int16(n) => Some(f64::from(*n)),
            Self::Int32(n) => Some(f64::from(*n)),
            Self::Int64(n) => Some(*n as f64),
            Self::Float32(n) => Some(f64::from(*n)),
            Self::Float64(n) => Some(*n),
            Self::Decimal(d) => d.to_string().parse().ok(),
            Self::String(s) => s.parse().ok(),
            _ => None,
        }
    }

    /// Try to borrow as string
    pub fn as_str(&self) -> Option<&str> {
        match self {
            Self::String(s) => Some(s.as_str()),
            _ => None,
        }
    }

    /// Render as an owned string where a textual form exists
    pub fn as_string(&self) -> Option<String> {
        match self {
            Self::Null => None,
            Self::Bool(b) => Some(b.to_string()),
            Self::Int8(n) => Some(n.to_string()),
            Self::Int16(n) => Some(n.to_string()),
            Self::Int32(n) => Some(n.to_string()),
            Self::Int64(n) => Some(n.to_string()),
            Self::Float32(n) => Some(n.to_string()),
            Self::Float64(n) => Some(n.to_string()),
            Self::Decimal(d) => Some(d.to_string()),
            Self::String(s) => Some(s.clone()),
            Self::Bytes(b) => String::from_utf8(b.clone()).ok(),
            Self::Date(d) => Some(d.to_string()),
            Self::Time(t) => Some(t.to_string()),
            Self::DateTime(dt) => Some(dt.to_string()),
            Self::DateTimeTz(dt) => Some(dt.to_rfc3339()),
            Self::Json(j) => Some(j.to_string()),
        }
    }
}

impl From<bool> for Value {
    fn from(v: bool) -> Self {
        Self::Bool(v)
    }
}

impl From<i32> for Value {
    fn from(v: i32) -> Self {
        Self::Int32(v)
    }
}

impl From<i64> for Value {
    fn from(v: i64) -> Self {
        Self::Int64(v)
    }
}

impl From<f64> for Value {
    fn from(v: f64) -> Self {
        Self::Float64(v)
    }
}

impl From<Decimal> for Value {
    fn from(v: Decimal) -> Self {
        Self::Decimal(v)
    }
}

impl From<String> for Value {
    fn from(v: String) -> Self {
        Self::String(v)
    }
}

impl From<&str> for Value {
    fn from(v: &str) -> Self {
        Self::String(v.to_string())
    }
}

impl From<NaiveDateTime> for Value {
    fn from(v: NaiveDateTime) -> Self {
        Self::DateTime(v)
    }
}

impl<T: Into<Value>> From<Option<T>> for Value {
    fn from(v: Option<T>) -> Self {
        match v {
            Some(v) => v.into(),
            None => Self::Null,
        }
    }
}

/// Database row as ordered column values
#[derive(Debug, Clone)]
pub struct Row {
    columns: Vec<String>,
    values: Vec<Value>,
}

impl Row {
    /// Create a new row
    pub fn new(columns: Vec<String>, values: Vec<Value>) -> Self {
        debug_assert_eq!(columns.len(), values.len());
        Self { columns, values }
    }

    /// Get column count
    #[inline]
    pub fn len(&self) -> usize {
        self.columns.len()
    }

    /// Check if row is empty
    #[inline]
    pub fn is_empty(&self) -> bool {
        self.columns.is_empty()
    }

    /// Get column names
    #[inline]
    pub fn columns(&self) -> &[String] {
        &self.columns
    }

    /// Get all values
    #[inline]
    pub fn values(&self) -> &[Value] {
        &self.values
    }

    /// Get value by column index
    #[inline]
    pub fn get(&self, idx: usize) -> Option<&Value> {
        self.values.get(idx)
    }

    /// Get value by column name (case-insensitive)
    pub fn get_by_name(&self, name: &str) -> Option<&Value> {
        self.columns
            .iter()
            .position(|c| c.eq_ignore_ascii_case(name))
            .and_then(|idx| self.values.get(idx))
    }

    /// Convert row to a name → value map
    pub fn into_map(self) -> RowMap {
        self.columns.into_iter().zip(self.values).collect()
    }
}

/// One in-memory upload row, keyed by column name
pub type RowMap = HashMap<String, Value>;

/// Name and generic type of one column of an uploaded table
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ColumnDescriptor {
    /// Column name
    pub name: String,
    /// Backend-neutral type name (`string`, `int`, `timestamp`, ...)
    #[serde(rename = "type")]
    pub generic_type: String,
}

impl ColumnDescriptor {
    /// Create a column descriptor
    pub fn new(name: impl Into<String>, generic_type: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            generic_type: generic_type.into(),
        }
    }
}

/// A secondary index definition, as a `CREATE INDEX` statement and its parameters
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IndexSpec {
    /// `CREATE INDEX <name> ON <table> (<columns>)`
    pub sql: String,
    /// Positional parameters for `sql`
    #[serde(default)]
    pub params: Vec<Value>,
}

impl IndexSpec {
    /// Create an index spec without parameters
    pub fn new(sql: impl Into<String>) -> Self {
        Self {
            sql: sql.into(),
            params: Vec::new(),
        }
    }
}

/// Data for a new table: either file references or in-memory rows
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TableData {
    /// Files the backend imports itself; `csvFile` may be one path or a list
    #[serde(default, rename = "csvFile", deserialize_with = "one_or_many")]
    pub csv_files: Option<Vec<String>>,
    /// Rows inserted in batches
    #[serde(default)]
    pub rows: Option<Vec<RowMap>>,
}

#[derive(Deserialize)]
#[serde(untagged)]
enum OneOrMany {
    One(String),
    Many(Vec<String>),
}

fn one_or_many<'de, D>(deserializer: D) -> std::result::Result<Option<Vec<String>>, D::Error>
where
    D: Deserializer<'de>,
{
    Ok(
        Option::<OneOrMany>::deserialize(deserializer)?.map(|files| match files {
            OneOrMany::One(file) => vec![file],
            OneOrMany::Many(files) => files,
        }),
    )
}

/// Borrowed view of the one populated form of a `TableData`
#[derive(Debug, Clone, Copy)]
pub enum UploadShape<'a> {
    /// Bulk file import
    Files(&'a [String]),
    /// Batched row insertion
    Rows(&'a [RowMap]),
}

impl TableData {
    /// Table data backed by files
    pub fn files<I, S>(files: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            csv_files: Some(files.into_iter().map(Into::into).collect()),
            rows: None,
        }
    }

    /// Table data backed by rows
    pub fn rows(rows: Vec<RowMap>) -> Self {
        Self {
            csv_files: None,
            rows: Some(rows),
        }
    }

    /// Resolve which form is populated.
    ///
    /// Exactly one form must be present; an empty file list counts as absent.
    pub fn shape(&self) -> Result<UploadShape<'_>> {
        let files = self.csv_files.as_deref().filter(|f| !f.is_empty());
        match (files, self.rows.as_deref()) {
            (Some(files), None) => Ok(UploadShape::Files(files)),
            (None, Some(rows)) => Ok(UploadShape::Rows(rows)),
            (Some(_), Some(_)) => Err(Error::upload_shape(
                "table data carries both file references and rows",
            )),
            (None, None) => Err(Error::upload_shape(
                "only row and CSV file uploads are supported",
            )),
        }
    }
}

/// Backend-assigned identifier of a live connection, used to target it for cancellation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SessionId(u64);

impl SessionId {
    /// Wrap a raw session id
    pub const fn new(id: u64) -> Self {
        Self(id)
    }

    /// Raw numeric id
    pub const fn get(self) -> u64 {
        self.0
    }

    /// Read the session id from the first column of an introspection row
    pub fn from_row(row: &Row) -> Result<Self> {
        row.get(0)
            .and_then(Value::as_i64)
            .and_then(|id| u64::try_from(id).ok())
            .map(Self)
            .ok_or_else(|| Error::query("session id query returned no numeric id"))
    }
}

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}
