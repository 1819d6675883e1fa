//! Bulk loading of new tables
//!
//! [`BulkLoader::upload_table_with_indexes`] creates a table and fills it in
//! one guarded operation. The shape of the [`TableData`] picks the path:
//!
//! - **Files**: one `CREATE TABLE ... INDEX ... LOCATION ...` statement. The
//!   backend imports the files itself and the statement is atomic, so a
//!   failure leaves no table behind.
//! - **Rows**: `CREATE TABLE`, then each index statement, then multi-row
//!   inserts of at most `batch_size` rows, all sequential. If any step fails
//!   the table is dropped before the error is returned.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tracing::{debug, error, info};

use crate::dialect::Dialect;
use crate::error::{Error, Result};
use crate::runner::QueryRunner;
use crate::security::validate_table_name;
use crate::types::{ColumnDescriptor, IndexSpec, RowMap, TableData, UploadShape, Value};

/// Rows per insert statement
pub const DEFAULT_BATCH_SIZE: usize = 2000;

/// Loader statistics snapshot
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LoaderStats {
    /// Tables created successfully
    pub tables_loaded: u64,
    /// Insert statements executed
    pub batches_written: u64,
    /// Rows inserted
    pub rows_written: u64,
    /// Drop-table cleanups attempted after a failed upload
    pub cleanups: u64,
    /// Cleanups that themselves failed
    pub cleanup_failures: u64,
}

#[derive(Debug, Default)]
struct AtomicLoaderStats {
    tables_loaded: AtomicU64,
    batches_written: AtomicU64,
    rows_written: AtomicU64,
    cleanups: AtomicU64,
    cleanup_failures: AtomicU64,
}

impl AtomicLoaderStats {
    fn snapshot(&self) -> LoaderStats {
        LoaderStats {
            tables_loaded: self.tables_loaded.load(Ordering::Relaxed),
            batches_written: self.batches_written.load(Ordering::Relaxed),
            rows_written: self.rows_written.load(Ordering::Relaxed),
            cleanups: self.cleanups.load(Ordering::Relaxed),
            cleanup_failures: self.cleanup_failures.load(Ordering::Relaxed),
        }
    }
}

/// Creates and populates tables through a [`QueryRunner`]
pub struct BulkLoader {
    runner: QueryRunner,
    dialect: Arc<dyn Dialect>,
    batch_size: usize,
    stats: AtomicLoaderStats,
}

impl BulkLoader {
    /// Create a loader with the default batch size
    pub fn new(runner: QueryRunner, dialect: Arc<dyn Dialect>) -> Self {
        Self {
            runner,
            dialect,
            batch_size: DEFAULT_BATCH_SIZE,
            stats: AtomicLoaderStats::default(),
        }
    }

    /// Set rows per insert statement; zero is rejected
    pub fn with_batch_size(mut self, batch_size: usize) -> Result<Self> {
        if batch_size == 0 {
            return Err(Error::config("batch size must be greater than zero"));
        }
        self.batch_size = batch_size;
        Ok(self)
    }

    /// Rows per insert statement
    pub fn batch_size(&self) -> usize {
        self.batch_size
    }

    /// Get loader statistics
    pub fn stats(&self) -> LoaderStats {
        self.stats.snapshot()
    }

    /// Create `table` with `columns` and `indexes`, populated from `data`.
    ///
    /// Fails with `UnsupportedUploadShape` before issuing any statement when
    /// `data` carries neither or both forms. Errors from the create-table
    /// statement are annotated with its SQL text.
    pub async fn upload_table_with_indexes(
        &self,
        table: &str,
        columns: &[ColumnDescriptor],
        data: &TableData,
        indexes: &[IndexSpec],
    ) -> Result<()> {
        let shape = data.shape()?;
        validate_table_name(table)?;

        match shape {
            UploadShape::Files(files) => self.upload_files(table, columns, files, indexes).await?,
            UploadShape::Rows(rows) => self.upload_rows(table, columns, rows, indexes).await?,
        }

        self.stats.tables_loaded.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    async fn upload_files(
        &self,
        table: &str,
        columns: &[ColumnDescriptor],
        files: &[String],
        indexes: &[IndexSpec],
    ) -> Result<()> {
        if !self.dialect.supports_csv_import() {
            return Err(Error::unsupported(format!(
                "{} dialect cannot create tables from files",
                self.dialect.name()
            )));
        }

        let mut parts = vec![self.dialect.create_table_sql(table, columns)?];
        for index in indexes {
            parts.push(self.dialect.inline_index_clause(index)?);
        }
        parts.push(self.dialect.location_clause(files.len())?);
        let sql = parts.join(" ");

        let params: Vec<Value> = files.iter().map(|f| Value::String(f.clone())).collect();
        info!(table, files = files.len(), "creating table from files");
        self.runner
            .query(&sql, &params)
            .await
            .map_err(|e| e.during_create_table(sql.as_str()))?;
        Ok(())
    }

    async fn upload_rows(
        &self,
        table: &str,
        columns: &[ColumnDescriptor],
        rows: &[RowMap],
        indexes: &[IndexSpec],
    ) -> Result<()> {
        let create_sql = self.dialect.create_table_sql(table, columns)?;

        let result = self.populate(table, &create_sql, columns, rows, indexes).await;
        if let Err(e) = result {
            self.cleanup(table).await;
            return Err(e);
        }
        Ok(())
    }

    async fn populate(
        &self,
        table: &str,
        create_sql: &str,
        columns: &[ColumnDescriptor],
        rows: &[RowMap],
        indexes: &[IndexSpec],
    ) -> Result<()> {
        self.runner
            .query(create_sql, &[])
            .await
            .map_err(|e| e.during_create_table(create_sql))?;

        for index in indexes {
            self.runner.query(&index.sql, &index.params).await?;
        }

        let batches = rows.len().div_ceil(self.batch_size);
        for (n, batch) in rows.chunks(self.batch_size).enumerate() {
            let sql = self.dialect.insert_rows_sql(table, columns, batch.len())?;
            let params = self.batch_params(columns, batch);
            if params.len() != batch.len() * columns.len() {
                return Err(Error::internal(format!(
                    "batch for {} has {} parameters, expected {}",
                    table,
                    params.len(),
                    batch.len() * columns.len()
                )));
            }

            self.runner.query(&sql, &params).await?;
            self.stats.batches_written.fetch_add(1, Ordering::Relaxed);
            self.stats
                .rows_written
                .fetch_add(batch.len() as u64, Ordering::Relaxed);
            debug!(table, batch = n + 1, batches, rows = batch.len(), "inserted batch");
        }

        info!(table, rows = rows.len(), batches, "table loaded");
        Ok(())
    }

    /// Row-major parameters, each cell coerced for its column type
    fn batch_params(&self, columns: &[ColumnDescriptor], batch: &[RowMap]) -> Vec<Value> {
        batch
            .iter()
            .flat_map(|row| {
                columns.iter().map(move |c| {
                    let value = row.get(&c.name).unwrap_or(&Value::Null);
                    self.dialect.to_column_value(value, &c.generic_type)
                })
            })
            .collect()
    }

    /// Best-effort drop after a failed row upload
    async fn cleanup(&self, table: &str) {
        self.stats.cleanups.fetch_add(1, Ordering::Relaxed);
        let result = match self.dialect.drop_table_sql(table) {
            Ok(sql) => self.runner.query(&sql, &[]).await.map(|_| ()),
            Err(e) => Err(e),
        };
        match result {
            Ok(()) => info!(table, "dropped table after failed upload"),
            Err(e) => {
                self.stats.cleanup_failures.fetch_add(1, Ordering::Relaxed);
                error!(table, error = %e, "failed to drop table after failed upload");
            }
        }
    }
}

impl std::fmt::Debug for BulkLoader {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BulkLoader")
            .field("dialect", &self.dialect.name())
            .field("batch_size", &self.batch_size)
            .finish_non_exhaustive()
    }
}
