//! Error types for cubestore-driver
//!
//! Provides granular error classification so callers can decide on retries:
//! - Retriable errors (connection, pool exhaustion, timeout)
//! - Terminal errors (cancellation, malformed uploads, statement failures)

use std::fmt;
use thiserror::Error;

/// Result type for cubestore-driver operations
pub type Result<T> = std::result::Result<T, Error>;

/// Error categories for classification
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorCategory {
    /// Connection-related errors (retriable)
    Connection,
    /// Query execution errors
    Query,
    /// Query was cancelled by the caller
    Cancelled,
    /// Timeout errors (retriable)
    Timeout,
    /// Configuration or caller-input error
    Configuration,
    /// Pool exhausted or closed
    PoolExhausted,
    /// Unknown/other errors
    Other,
}

impl ErrorCategory {
    /// Whether errors in this category are generally retriable
    #[inline]
    pub const fn is_retriable(self) -> bool {
        matches!(self, Self::Connection | Self::Timeout | Self::PoolExhausted)
    }
}

/// Main error type for cubestore-driver
#[derive(Error, Debug)]
#[allow(missing_docs)]
pub enum Error {
    /// Establishing or using the transport failed
    #[error("connection error: {message}")]
    Connection {
        message: String,
        #[source]
        source: Option<Box<dyn std::error::Error + Send + Sync>>,
    },

    /// Statement rejected by the backend
    #[error("query error: {message}")]
    Query {
        message: String,
        sql: Option<String>,
        #[source]
        source: Option<Box<dyn std::error::Error + Send + Sync>>,
    },

    /// A statement failed while creating a table; carries the offending SQL
    #[error("error during create table: {sql}: {source}")]
    Statement {
        sql: String,
        #[source]
        source: Box<Error>,
    },

    /// Cancellation won the race against the query result
    #[error("query cancelled")]
    QueryCancelled,

    /// Upload data carried neither file references nor rows (or both)
    #[error("unsupported upload shape: {message}")]
    UnsupportedUploadShape { message: String },

    /// Operation timed out
    #[error("timeout: {message}")]
    Timeout { message: String },

    /// Configuration error
    #[error("configuration error: {message}")]
    Configuration { message: String },

    /// No connection became available within the acquire timeout
    #[error("pool exhausted: {message}")]
    PoolExhausted { message: String },

    /// The pool is draining or drained and accepts no new acquisitions
    #[error("pool closed")]
    PoolClosed,

    /// Unsupported operation for this dialect/backend
    #[error("unsupported: {message}")]
    Unsupported { message: String },

    /// Internal error
    #[error("internal error: {message}")]
    Internal { message: String },
}

impl Error {
    /// Get the error category
    pub fn category(&self) -> ErrorCategory {
        match self {
            Self::Connection { .. } => ErrorCategory::Connection,
            Self::Query { .. } => ErrorCategory::Query,
            Self::Statement { source, .. } => source.category(),
            Self::QueryCancelled => ErrorCategory::Cancelled,
            Self::Timeout { .. } => ErrorCategory::Timeout,
            Self::UnsupportedUploadShape { .. } | Self::Configuration { .. } => {
                ErrorCategory::Configuration
            }
            Self::PoolExhausted { .. } | Self::PoolClosed => ErrorCategory::PoolExhausted,
            Self::Unsupported { .. } | Self::Internal { .. } => ErrorCategory::Other,
        }
    }

    /// Whether this error is retriable
    #[inline]
    pub fn is_retriable(&self) -> bool {
        // a closed pool never reopens
        !matches!(self, Self::PoolClosed) && self.category().is_retriable()
    }

    /// Whether this error means the query was cancelled
    #[inline]
    pub fn is_cancelled(&self) -> bool {
        matches!(self, Self::QueryCancelled)
    }

    /// Create a connection error
    pub fn connection(message: impl Into<String>) -> Self {
        Self::Connection {
            message: message.into(),
            source: None,
        }
    }

    /// Create a connection error with source
    pub fn connection_with_source(
        message: impl Into<String>,
        source: impl std::error::Error + Send + Sync + 'static,
    ) -> Self {
        Self::Connection {
            message: message.into(),
            source: Some(Box::new(source)),
        }
    }

    /// Create a query error
    pub fn query(message: impl Into<String>) -> Self {
        Self::Query {
            message: message.into(),
            sql: None,
            source: None,
        }
    }

    /// Create a query error with SQL
    pub fn query_with_sql(message: impl Into<String>, sql: impl Into<String>) -> Self {
        Self::Query {
            message: message.into(),
            sql: Some(sql.into()),
            source: None,
        }
    }

    /// Annotate an error with the create-table statement that produced it
    pub fn during_create_table(self, sql: impl Into<String>) -> Self {
        Self::Statement {
            sql: sql.into(),
            source: Box::new(self),
        }
    }

    /// Create an upload shape error
    pub fn upload_shape(message: impl Into<String>) -> Self {
        Self::UnsupportedUploadShape {
            message: message.into(),
        }
    }

    /// Create a timeout error
    pub fn timeout(message: impl Into<String>) -> Self {
        Self::Timeout {
            message: message.into(),
        }
    }

    /// Create a configuration error
    pub fn config(message: impl Into<String>) -> Self {
        Self::Configuration {
            message: message.into(),
        }
    }

    /// Create a pool exhausted error
    pub fn pool_exhausted(message: impl Into<String>) -> Self {
        Self::PoolExhausted {
            message: message.into(),
        }
    }

    /// Create an unsupported operation error
    pub fn unsupported(message: impl Into<String>) -> Self {
        Self::Unsupported {
            message: message.into(),
        }
    }

    /// Create an internal error
    pub fn internal(message: impl Into<String>) -> Self {
        Self::Internal {
            message: message.into(),
        }
    }
}

impl fmt::Display for ErrorCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Connection => write!(f, "connection"),
            Self::Query => write!(f, "query"),
            Self::Cancelled => write!(f, "cancelled"),
            Self::Timeout => write!(f, "timeout"),
            Self::Configuration => write!(f, "configuration"),
            Self::PoolExhausted => write!(f, "pool_exhausted"),
            Self::Other => write!(f, "other"),
        }
    }
}
