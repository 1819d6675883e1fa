//! # cubestore-driver
//!
//! Managed connection layer for CubeStore, the columnar engine behind Cube
//! pre-aggregations, accessed over the MySQL wire protocol.
//!
//! ## Features
//!
//! - **Connection Pooling**: bounded pool with health checks on borrow,
//!   idle eviction and graceful drain
//! - **Cancellable Queries**: every query can be killed mid-flight through a
//!   second pooled connection, and its connection is always released once
//! - **Bulk Loading**: create-and-populate a table from files or in batched
//!   inserts, dropping the table again if any step fails
//! - **Dialect Abstraction**: identifier quoting, type mapping and DDL per
//!   backend, inserts generated with sea-query
//! - **Layered Configuration**: defaults, `CUBEJS_DB_*` environment, overrides
//!
//! ## Quick Start
//!
//! ```rust,ignore
//! use cubestore_driver::prelude::*;
//!
//! let driver = CubeStoreDriver::from_env().await?;
//!
//! let rows = driver.query("SELECT * FROM pre.orders WHERE id = ?", &[Value::Int64(1)]).await?;
//!
//! let handle = driver.with_connection(|conn| {
//!     Box::pin(async move { conn.query("SELECT count(*) FROM pre.events", &[]).await })
//! });
//! handle.cancel().await?;
//! assert!(handle.await.unwrap_err().is_cancelled());
//!
//! driver
//!     .upload_table_with_indexes("pre.orders", &columns, &TableData::rows(upload), &indexes)
//!     .await?;
//!
//! driver.release().await?;
//! ```
//!
//! ## Feature Flags
//!
//! - `mysql` (default) - MySQL-protocol backend via mysql_async

#![warn(missing_docs)]
#![warn(clippy::all)]
#![deny(unsafe_code)]

pub mod config;
pub mod connection;
pub mod dialect;
pub mod driver;
pub mod error;
pub mod loader;
pub mod pool;
pub mod runner;
pub mod security;
pub mod types;

#[cfg(feature = "mysql")]
pub mod mysql;

/// Prelude module for convenient imports
pub mod prelude {
    // Error types
    pub use crate::error::{Error, ErrorCategory, Result};

    // Value and upload types
    pub use crate::types::{
        ColumnDescriptor, IndexSpec, Row, RowMap, SessionId, TableData, UploadShape, Value,
    };

    // Connection traits and config
    pub use crate::connection::{Connection, ConnectionConfig, ConnectionFactory};
    pub use crate::config::{DriverConfig, DriverConfigBuilder};

    // Pool types
    pub use crate::pool::{AtomicPoolStats, ConnectionPool, PoolConfig, PoolStats, PooledConnection};

    // Execution
    pub use crate::runner::{CancelHandle, CancelOutcome, QueryHandle, QueryRunner};
    pub use crate::loader::{BulkLoader, LoaderStats, DEFAULT_BATCH_SIZE};
    pub use crate::driver::{Capabilities, CubeStoreDriver};

    // Dialect types
    pub use crate::dialect::{dialect_for, CubeStoreDialect, Dialect, MySqlDialect};

    #[cfg(feature = "mysql")]
    pub use crate::mysql::{MySqlConnection, MySqlConnectionFactory};
}

// Re-export commonly used items at crate root
pub use driver::CubeStoreDriver;
pub use error::{Error, Result};
pub use types::Value;
