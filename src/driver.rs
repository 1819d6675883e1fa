//! CubeStore driver facade
//!
//! Wires a [`ConnectionPool`], a [`QueryRunner`] and a [`BulkLoader`] together
//! behind the operations a query orchestrator calls.

use futures::future::BoxFuture;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info};

use crate::config::DriverConfig;
use crate::connection::{Connection, ConnectionFactory};
use crate::dialect::{dialect_for, Dialect};
use crate::error::{Error, Result};
use crate::loader::{BulkLoader, LoaderStats};
use crate::pool::{ConnectionPool, PoolStats};
use crate::runner::{QueryHandle, QueryRunner};
use crate::types::{ColumnDescriptor, IndexSpec, Row, TableData, Value};

/// Optional features the backend supports
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Capabilities {
    /// Tables can be created directly from file references
    pub csv_import: bool,
}

/// Pooled, cancellable driver for CubeStore
pub struct CubeStoreDriver {
    config: DriverConfig,
    dialect: Arc<dyn Dialect>,
    factory: Arc<dyn ConnectionFactory>,
    pool: Arc<ConnectionPool>,
    runner: QueryRunner,
    loader: BulkLoader,
}

impl CubeStoreDriver {
    /// Create a driver over connections made by `factory`
    pub async fn new(config: DriverConfig, factory: Arc<dyn ConnectionFactory>) -> Result<Self> {
        let dialect: Arc<dyn Dialect> = Arc::from(dialect_for(&config.dialect));
        let pool = ConnectionPool::new(
            config.pool.clone(),
            config.connection.clone(),
            Arc::clone(&factory),
            Arc::clone(&dialect),
        )
        .await?;
        let runner = QueryRunner::new(Arc::clone(&pool), Arc::clone(&dialect));
        let loader = BulkLoader::new(runner.clone(), Arc::clone(&dialect));

        info!(
            dialect = dialect.name(),
            host = %config.connection.host,
            max_pool = config.pool.max_size,
            "driver initialized"
        );

        Ok(Self {
            config,
            dialect,
            factory,
            pool,
            runner,
            loader,
        })
    }

    /// Create a MySQL-protocol driver configured from `CUBEJS_DB_*` variables
    #[cfg(feature = "mysql")]
    pub async fn from_env() -> Result<Self> {
        let config = DriverConfig::from_env()?;
        Self::new(config, Arc::new(crate::mysql::MySqlConnectionFactory)).await
    }

    /// Replace the loader's batch size
    pub fn with_batch_size(mut self, batch_size: usize) -> Result<Self> {
        self.loader = self.loader.with_batch_size(batch_size)?;
        Ok(self)
    }

    /// Resolved configuration
    pub fn config(&self) -> &DriverConfig {
        &self.config
    }

    /// Active dialect
    pub fn dialect(&self) -> &dyn Dialect {
        self.dialect.as_ref()
    }

    /// The underlying pool
    pub fn pool(&self) -> &Arc<ConnectionPool> {
        &self.pool
    }

    /// Run one statement and collect its rows
    pub async fn query(&self, sql: &str, params: &[Value]) -> Result<Vec<Row>> {
        self.runner.query(sql, params).await
    }

    /// Run `op` on a pooled connection as a cancellable query
    pub fn with_connection<T, F>(&self, op: F) -> QueryHandle<T>
    where
        T: Send + 'static,
        F: for<'c> FnOnce(&'c dyn Connection) -> BoxFuture<'c, Result<T>> + Send + 'static,
    {
        self.runner.with_connection(op)
    }

    /// Create and populate a table, see [`BulkLoader::upload_table_with_indexes`]
    pub async fn upload_table_with_indexes(
        &self,
        table: &str,
        columns: &[ColumnDescriptor],
        data: &TableData,
        indexes: &[IndexSpec],
    ) -> Result<()> {
        self.loader
            .upload_table_with_indexes(table, columns, data, indexes)
            .await
    }

    /// Create an empty table
    pub async fn create_table(&self, table: &str, columns: &[ColumnDescriptor]) -> Result<()> {
        let sql = self.dialect.create_table_sql(table, columns)?;
        self.query(&sql, &[])
            .await
            .map_err(|e| e.during_create_table(sql.as_str()))?;
        Ok(())
    }

    /// Drop a table
    pub async fn drop_table(&self, table: &str) -> Result<()> {
        let sql = self.dialect.drop_table_sql(table)?;
        self.query(&sql, &[]).await?;
        Ok(())
    }

    /// Whether `table` exists
    pub async fn table_exists(&self, table: &str) -> Result<bool> {
        let sql = self.dialect.table_exists_sql(table)?;
        Ok(!self.query(&sql, &[]).await?.is_empty())
    }

    /// Open a fresh connection outside the pool, run a trivial query, close it
    pub async fn test_connection(&self) -> Result<Vec<Row>> {
        let timeout = Duration::from_millis(self.config.connection.connect_timeout_ms);
        let conn = tokio::time::timeout(timeout, self.factory.connect(&self.config.connection))
            .await
            .map_err(|_| {
                Error::connection(format!("connect timed out after {}ms", timeout.as_millis()))
            })??;

        let result = conn.query(self.dialect.ping_sql(), &[]).await;
        if let Err(e) = conn.close().await {
            debug!(error = %e, "error closing test connection");
        }
        result
    }

    /// Drain the pool: wait for borrowed connections, then close everything
    pub async fn release(&self) -> Result<()> {
        self.pool.drain().await?;
        info!("driver released");
        Ok(())
    }

    /// Query listing user columns of the configured database
    pub fn information_schema_query(&self) -> String {
        let database = self.config.connection.database_name();
        self.dialect.information_schema_query(database.as_deref())
    }

    /// Optional features the backend supports
    pub fn capabilities(&self) -> Capabilities {
        Capabilities {
            csv_import: self.dialect.supports_csv_import(),
        }
    }

    /// Pool statistics
    pub fn pool_stats(&self) -> PoolStats {
        self.pool.stats()
    }

    /// Bulk loader statistics
    pub fn loader_stats(&self) -> LoaderStats {
        self.loader.stats()
    }
}

impl std::fmt::Debug for CubeStoreDriver {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CubeStoreDriver")
            .field("config", &self.config)
            .field("dialect", &self.dialect.name())
            .finish_non_exhaustive()
    }
}
