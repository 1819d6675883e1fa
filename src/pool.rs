//! Connection pool for cubestore-driver
//!
//! A bounded pool of physical connections with:
//! - Semaphore-based capacity control and an acquire timeout
//! - Health checking on borrow
//! - Background eviction of idle connections, never below `min_size`
//! - Graceful drain that waits for borrowed connections to come back
//!
//! # Example
//!
//! ```rust,ignore
//! use cubestore_driver::prelude::*;
//!
//! let pool = ConnectionPool::new(
//!     PoolConfig::default().with_max_size(4),
//!     ConnectionConfig::from_url("mysql://localhost:3306/db"),
//!     Arc::new(MySqlConnectionFactory),
//!     Arc::new(CubeStoreDialect),
//! ).await?;
//!
//! let conn = pool.acquire().await?;
//! conn.query("SELECT 1", &[]).await?;
//! pool.release(conn).await;
//! ```

use parking_lot::Mutex as SyncMutex;
use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::sync::{watch, Mutex, OwnedSemaphorePermit, Semaphore};
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, info, warn};

use crate::connection::{Connection, ConnectionConfig, ConnectionFactory};
use crate::dialect::Dialect;
use crate::error::{Error, Result};

/// Pool configuration
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PoolConfig {
    /// Minimum pool size; eviction never goes below it
    pub min_size: usize,
    /// Maximum number of live connections
    pub max_size: usize,
    /// Idle connections older than this are evicted, down to `min_size`
    pub idle_timeout: Duration,
    /// Idle connections older than this are evicted while the pool exceeds
    /// `min_size`.
    ///
    /// Both timeouts stop at the `min_size` floor, so the effective limit is
    /// whichever is shorter. Set this below `idle_timeout` to trim surplus
    /// connections sooner.
    pub soft_idle_timeout: Duration,
    /// How often the evictor runs (zero disables it)
    pub eviction_interval: Duration,
    /// Maximum time to wait for a connection
    pub acquire_timeout: Duration,
    /// Whether to health-check idle connections before handing them out
    pub validate_on_borrow: bool,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            min_size: 0,
            max_size: 8,
            idle_timeout: Duration::from_secs(30),
            soft_idle_timeout: Duration::from_secs(30),
            eviction_interval: Duration::from_secs(10),
            acquire_timeout: Duration::from_secs(20),
            validate_on_borrow: true,
        }
    }
}

impl PoolConfig {
    /// Set minimum pool size
    pub fn with_min_size(mut self, size: usize) -> Self {
        self.min_size = size;
        self
    }

    /// Set maximum pool size
    pub fn with_max_size(mut self, size: usize) -> Self {
        self.max_size = size;
        self
    }

    /// Set idle timeout
    pub fn with_idle_timeout(mut self, timeout: Duration) -> Self {
        self.idle_timeout = timeout;
        self
    }

    /// Set soft idle timeout
    pub fn with_soft_idle_timeout(mut self, timeout: Duration) -> Self {
        self.soft_idle_timeout = timeout;
        self
    }

    /// Set eviction interval
    pub fn with_eviction_interval(mut self, interval: Duration) -> Self {
        self.eviction_interval = interval;
        self
    }

    /// Set acquire timeout
    pub fn with_acquire_timeout(mut self, timeout: Duration) -> Self {
        self.acquire_timeout = timeout;
        self
    }

    /// Enable/disable validation on borrow
    pub fn with_validate_on_borrow(mut self, validate: bool) -> Self {
        self.validate_on_borrow = validate;
        self
    }

    /// Check `0 <= min_size <= max_size` and `max_size > 0`
    pub fn validate(&self) -> Result<()> {
        if self.max_size == 0 {
            return Err(Error::config("pool max_size must be greater than zero"));
        }
        if self.min_size > self.max_size {
            return Err(Error::config(format!(
                "pool min_size ({}) exceeds max_size ({})",
                self.min_size, self.max_size
            )));
        }
        Ok(())
    }
}

/// Pool statistics
#[derive(Debug, Clone, Default)]
pub struct PoolStats {
    /// Total number of connections created
    pub connections_created: u64,
    /// Total number of connections closed
    pub connections_closed: u64,
    /// Total number of connection acquisitions
    pub acquisitions: u64,
    /// Total number of connections returned
    pub releases: u64,
    /// Number of acquire timeouts
    pub exhausted_count: u64,
    /// Total wait time for connections (in milliseconds)
    pub total_wait_time_ms: u64,
    /// Number of health check failures
    pub health_check_failures: u64,
    /// Number of idle connections evicted
    pub evictions: u64,
}

/// Atomic pool stats for concurrent updates
#[derive(Debug, Default)]
#[allow(missing_docs)]
pub struct AtomicPoolStats {
    pub connections_created: AtomicU64,
    pub connections_closed: AtomicU64,
    pub acquisitions: AtomicU64,
    pub releases: AtomicU64,
    pub exhausted_count: AtomicU64,
    pub total_wait_time_ms: AtomicU64,
    pub health_check_failures: AtomicU64,
    pub evictions: AtomicU64,
}

impl AtomicPoolStats {
    /// Create new atomic stats
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a connection creation
    pub fn record_created(&self) {
        self.connections_created.fetch_add(1, Ordering::Relaxed);
    }

    /// Record a connection close
    pub fn record_closed(&self) {
        self.connections_closed.fetch_add(1, Ordering::Relaxed);
    }

    /// Record an acquisition
    pub fn record_acquisition(&self, wait_time_ms: u64) {
        self.acquisitions.fetch_add(1, Ordering::Relaxed);
        self.total_wait_time_ms
            .fetch_add(wait_time_ms, Ordering::Relaxed);
    }

    /// Record a connection coming back from a borrower
    pub fn record_release(&self) {
        self.releases.fetch_add(1, Ordering::Relaxed);
    }

    /// Record pool exhaustion
    pub fn record_exhausted(&self) {
        self.exhausted_count.fetch_add(1, Ordering::Relaxed);
    }

    /// Record health check failure
    pub fn record_health_check_failure(&self) {
        self.health_check_failures.fetch_add(1, Ordering::Relaxed);
    }

    /// Record an idle eviction
    pub fn record_eviction(&self) {
        self.evictions.fetch_add(1, Ordering::Relaxed);
    }

    /// Snapshot current stats
    pub fn snapshot(&self) -> PoolStats {
        PoolStats {
            connections_created: self.connections_created.load(Ordering::Relaxed),
            connections_closed: self.connections_closed.load(Ordering::Relaxed),
            acquisitions: self.acquisitions.load(Ordering::Relaxed),
            releases: self.releases.load(Ordering::Relaxed),
            exhausted_count: self.exhausted_count.load(Ordering::Relaxed),
            total_wait_time_ms: self.total_wait_time_ms.load(Ordering::Relaxed),
            health_check_failures: self.health_check_failures.load(Ordering::Relaxed),
            evictions: self.evictions.load(Ordering::Relaxed),
        }
    }

    /// Calculate average wait time in milliseconds
    pub fn avg_wait_time_ms(&self) -> f64 {
        let acquisitions = self.acquisitions.load(Ordering::Relaxed);
        if acquisitions == 0 {
            0.0
        } else {
            self.total_wait_time_ms.load(Ordering::Relaxed) as f64 / acquisitions as f64
        }
    }
}

/// Internal pool entry with bookkeeping
struct PoolEntry {
    /// Pool-unique connection id
    id: u64,
    /// The connection
    conn: Box<dyn Connection>,
    /// When last returned to the idle set
    last_used: Instant,
    /// When last health-checked successfully
    last_validated: Option<Instant>,
}

/// One unit of pool capacity, held from permit acquisition until the
/// connection is back in the idle set or closed.
struct Slot {
    _permit: OwnedSemaphorePermit,
    held: Arc<watch::Sender<usize>>,
}

impl Slot {
    fn new(permit: OwnedSemaphorePermit, held: Arc<watch::Sender<usize>>) -> Self {
        held.send_modify(|n| *n += 1);
        Self {
            _permit: permit,
            held,
        }
    }
}

impl Drop for Slot {
    fn drop(&mut self) {
        self.held.send_modify(|n| *n -= 1);
    }
}

/// Closes an entry that is dropped before it reaches a borrower or the idle set
struct EntryGuard {
    entry: Option<PoolEntry>,
    stats: Arc<AtomicPoolStats>,
}

impl EntryGuard {
    fn new(entry: PoolEntry, stats: Arc<AtomicPoolStats>) -> Self {
        Self {
            entry: Some(entry),
            stats,
        }
    }

    fn disarm(mut self) -> Option<PoolEntry> {
        self.entry.take()
    }
}

impl Drop for EntryGuard {
    fn drop(&mut self) {
        let Some(entry) = self.entry.take() else {
            return;
        };
        debug!(conn_id = entry.id, "closing connection abandoned mid-acquire");
        self.stats.record_closed();
        if let Ok(handle) = tokio::runtime::Handle::try_current() {
            handle.spawn(async move {
                if let Err(e) = entry.conn.close().await {
                    debug!(conn_id = entry.id, error = %e, "error closing connection");
                }
            });
        }
    }
}

/// A connection borrowed from the pool.
///
/// Hand it back with [`ConnectionPool::release`]. If it is dropped instead,
/// it is returned in the background.
pub struct PooledConnection {
    entry: Option<PoolEntry>,
    slot: Option<Slot>,
    pool: Weak<ConnectionPool>,
}

impl PooledConnection {
    /// Pool-unique id of the physical connection
    pub fn id(&self) -> u64 {
        self.entry().id
    }

    /// When this connection last passed a health check
    pub fn last_validated(&self) -> Option<Instant> {
        self.entry().last_validated
    }

    /// Get the underlying connection
    pub fn connection(&self) -> &(dyn Connection + 'static) {
        self.entry().conn.as_ref()
    }

    fn entry(&self) -> &PoolEntry {
        self.entry.as_ref().expect("connection already returned")
    }
}

impl std::ops::Deref for PooledConnection {
    type Target = dyn Connection;

    fn deref(&self) -> &Self::Target {
        self.connection()
    }
}

impl std::fmt::Debug for PooledConnection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PooledConnection")
            .field("id", &self.entry.as_ref().map(|e| e.id))
            .finish()
    }
}

impl Drop for PooledConnection {
    fn drop(&mut self) {
        let (Some(entry), Some(slot)) = (self.entry.take(), self.slot.take()) else {
            return;
        };
        let Some(pool) = self.pool.upgrade() else {
            return;
        };
        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                handle.spawn(async move {
                    pool.return_entry(entry, slot, false).await;
                });
            }
            Err(_) => {
                // no runtime to close on; forget the connection
                pool.stats.record_release();
                pool.stats.record_closed();
                pool.unmark_borrowed(entry.id);
            }
        }
    }
}

/// A bounded pool of physical connections.
pub struct ConnectionPool {
    /// Pool configuration
    config: PoolConfig,
    /// Where new connections go
    connection: ConnectionConfig,
    /// Connection factory
    factory: Arc<dyn ConnectionFactory>,
    /// Supplies the health-check statement
    dialect: Arc<dyn Dialect>,
    /// Idle connections (LIFO)
    idle: Mutex<Vec<PoolEntry>>,
    /// Ids of connections currently lent out
    borrowed: SyncMutex<HashSet<u64>>,
    /// Slots held by borrowers and in-flight acquires; drain waits for zero
    held: Arc<watch::Sender<usize>>,
    /// Limits live borrows to `max_size`
    semaphore: Arc<Semaphore>,
    /// Next connection id
    next_id: AtomicU64,
    /// Statistics
    stats: Arc<AtomicPoolStats>,
    /// Set once drain starts
    closing: AtomicBool,
    /// Self reference for creating PooledConnections
    self_ref: Weak<Self>,
}

impl ConnectionPool {
    /// Create a new connection pool.
    ///
    /// Opens `min_size` connections eagerly and starts the background evictor.
    pub async fn new(
        config: PoolConfig,
        connection: ConnectionConfig,
        factory: Arc<dyn ConnectionFactory>,
        dialect: Arc<dyn Dialect>,
    ) -> Result<Arc<Self>> {
        config.validate()?;

        let pool = Arc::new_cyclic(|weak| Self {
            semaphore: Arc::new(Semaphore::new(config.max_size)),
            idle: Mutex::new(Vec::with_capacity(config.max_size)),
            borrowed: SyncMutex::new(HashSet::with_capacity(config.max_size)),
            held: Arc::new(watch::Sender::new(0)),
            next_id: AtomicU64::new(1),
            stats: Arc::new(AtomicPoolStats::new()),
            closing: AtomicBool::new(false),
            self_ref: weak.clone(),
            config,
            connection,
            factory,
            dialect,
        });

        for _ in 0..pool.config.min_size {
            match pool.create_entry().await {
                Ok(entry) => pool.idle.lock().await.push(entry),
                Err(e) => warn!(error = %e, "failed to pre-populate connection pool"),
            }
        }

        Self::spawn_evictor(&pool);
        Ok(pool)
    }

    /// Get pool configuration
    pub fn config(&self) -> &PoolConfig {
        &self.config
    }

    /// Get pool statistics
    pub fn stats(&self) -> PoolStats {
        self.stats.snapshot()
    }

    /// Whether drain has started
    pub fn is_closed(&self) -> bool {
        self.closing.load(Ordering::Acquire)
    }

    /// Number of connections currently lent out
    pub fn borrowed(&self) -> usize {
        self.borrowed.lock().len()
    }

    /// Ids of connections currently lent out
    pub fn borrowed_ids(&self) -> Vec<u64> {
        self.borrowed.lock().iter().copied().collect()
    }

    /// Number of idle connections
    pub async fn idle(&self) -> usize {
        self.idle.lock().await.len()
    }

    /// Live connections, idle plus borrowed
    pub async fn size(&self) -> usize {
        let idle = self.idle.lock().await;
        idle.len() + self.borrowed()
    }

    /// Borrow a connection.
    ///
    /// Fails with `PoolExhausted` when nothing frees up within
    /// `acquire_timeout`, with `Connection` when a new connection cannot be
    /// established, and with `PoolClosed` once drain has started.
    pub async fn acquire(&self) -> Result<PooledConnection> {
        if self.is_closed() {
            return Err(Error::PoolClosed);
        }

        let start = Instant::now();
        match tokio::time::timeout(self.config.acquire_timeout, self.acquire_inner()).await {
            Ok(Ok(conn)) => {
                self.stats
                    .record_acquisition(start.elapsed().as_millis() as u64);
                Ok(conn)
            }
            Ok(Err(e)) => Err(e),
            Err(_) => {
                self.stats.record_exhausted();
                Err(Error::pool_exhausted(format!(
                    "timeout waiting for connection ({}ms)",
                    self.config.acquire_timeout.as_millis()
                )))
            }
        }
    }

    async fn acquire_inner(&self) -> Result<PooledConnection> {
        // Dropping this future at any await point frees the slot and closes
        // any connection taken so far.
        let permit = self
            .semaphore
            .clone()
            .acquire_owned()
            .await
            .map_err(|_| Error::PoolClosed)?;
        let slot = Slot::new(permit, self.held.clone());

        let entry = match self.take_idle().await {
            Some(entry) => entry,
            None => self.create_entry().await?,
        };

        // Drain may have started while this acquire was validating or connecting.
        if self.is_closed() {
            debug!(conn_id = entry.id, "pool drained during acquire, closing connection");
            self.discard(entry).await;
            drop(slot);
            return Err(Error::PoolClosed);
        }

        self.mark_borrowed(entry.id)?;
        Ok(PooledConnection {
            entry: Some(entry),
            slot: Some(slot),
            pool: self.self_ref.clone(),
        })
    }

    /// Pop idle connections until one passes the health check
    async fn take_idle(&self) -> Option<PoolEntry> {
        loop {
            let entry = self.idle.lock().await.pop()?;

            if entry.conn.is_broken() {
                debug!(conn_id = entry.id, "discarding broken idle connection");
                self.discard(entry).await;
                continue;
            }

            if !self.config.validate_on_borrow {
                return Some(entry);
            }

            // Out of the idle set but not yet borrowed; an acquire timeout here
            // must still close it.
            let guard = EntryGuard::new(entry, self.stats.clone());
            let healthy = match &guard.entry {
                Some(entry) => self.validate(entry.conn.as_ref()).await,
                None => false,
            };
            let Some(mut entry) = guard.disarm() else {
                continue;
            };
            if !healthy {
                warn!(conn_id = entry.id, "idle connection failed health check");
                self.stats.record_health_check_failure();
                self.discard(entry).await;
                continue;
            }
            entry.last_validated = Some(Instant::now());
            return Some(entry);
        }
    }

    async fn create_entry(&self) -> Result<PoolEntry> {
        let timeout = Duration::from_millis(self.connection.connect_timeout_ms);
        let conn = tokio::time::timeout(timeout, self.factory.connect(&self.connection))
            .await
            .map_err(|_| {
                Error::connection(format!("connect timed out after {}ms", timeout.as_millis()))
            })??;

        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        self.stats.record_created();
        debug!(conn_id = id, "created connection");

        let now = Instant::now();
        Ok(PoolEntry {
            id,
            conn,
            last_used: now,
            last_validated: Some(now),
        })
    }

    /// Health-check a connection with a trivial round-trip.
    ///
    /// Never fails: any error, including a transport error or a stalled
    /// round-trip, yields `false`.
    pub async fn validate(&self, conn: &dyn Connection) -> bool {
        if conn.is_broken() {
            return false;
        }
        let timeout = Duration::from_millis(self.connection.connect_timeout_ms);
        matches!(
            tokio::time::timeout(timeout, conn.query(self.dialect.ping_sql(), &[])).await,
            Ok(Ok(_))
        )
    }

    /// Return a borrowed connection to the idle set.
    ///
    /// Never fails; a broken connection is discarded and replaced on a later acquire.
    pub async fn release(&self, mut conn: PooledConnection) {
        if let (Some(entry), Some(slot)) = (conn.entry.take(), conn.slot.take()) {
            self.return_entry(entry, slot, false).await;
        }
    }

    /// Close a borrowed connection instead of returning it
    pub async fn destroy(&self, mut conn: PooledConnection) {
        if let (Some(entry), Some(slot)) = (conn.entry.take(), conn.slot.take()) {
            self.return_entry(entry, slot, true).await;
        }
    }

    async fn return_entry(&self, mut entry: PoolEntry, slot: Slot, destroy: bool) {
        self.stats.record_release();
        let id = entry.id;

        // The borrowed mark is cleared while the idle lock is held so a
        // concurrent drain sees the connection in exactly one of the two sets.
        let mut idle = self.idle.lock().await;
        if destroy || self.is_closed() || entry.conn.is_broken() {
            drop(idle);
            debug!(conn_id = id, destroy, "closing returned connection");
            self.discard(entry).await;
            self.unmark_borrowed(id);
        } else {
            entry.last_used = Instant::now();
            idle.push(entry);
            self.unmark_borrowed(id);
        }
        drop(slot);
    }

    async fn discard(&self, entry: PoolEntry) {
        if let Err(e) = entry.conn.close().await {
            debug!(conn_id = entry.id, error = %e, "error closing connection");
        }
        self.stats.record_closed();
    }

    fn mark_borrowed(&self, id: u64) -> Result<()> {
        let mut borrowed = self.borrowed.lock();
        if !borrowed.insert(id) {
            return Err(Error::internal(format!(
                "connection {} is already borrowed",
                id
            )));
        }
        Ok(())
    }

    fn unmark_borrowed(&self, id: u64) {
        self.borrowed.lock().remove(&id);
    }

    /// Close idle connections past their timeout, keeping at least `min_size`.
    ///
    /// A connection is expired once it has been idle longer than either
    /// `idle_timeout` or `soft_idle_timeout`, and only while the pool holds more
    /// than `min_size` connections. Broken idle connections are always removed.
    /// Returns the eviction count.
    pub async fn evict_idle(&self) -> usize {
        let expired = {
            let mut idle = self.idle.lock().await;
            let mut size = idle.len() + self.borrowed();
            let mut expired = Vec::new();
            let mut kept = Vec::with_capacity(idle.len());

            // Front of the LIFO holds the longest-idle connections.
            for entry in idle.drain(..) {
                let idle_for = entry.last_used.elapsed();
                let over_min = size > self.config.min_size;
                let timed_out = idle_for > self.config.idle_timeout
                    || idle_for > self.config.soft_idle_timeout;

                if entry.conn.is_broken() || (over_min && timed_out) {
                    size -= 1;
                    expired.push(entry);
                } else {
                    kept.push(entry);
                }
            }
            *idle = kept;
            expired
        };

        let count = expired.len();
        for entry in expired {
            debug!(conn_id = entry.id, "evicting idle connection");
            self.stats.record_eviction();
            self.discard(entry).await;
        }
        if count > 0 {
            info!(evicted = count, "evicted idle connections");
        }
        count
    }

    fn spawn_evictor(pool: &Arc<Self>) {
        let interval = pool.config.eviction_interval;
        if interval.is_zero() {
            return;
        }
        let weak = Arc::downgrade(pool);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            // first tick completes immediately
            ticker.tick().await;
            loop {
                ticker.tick().await;
                let Some(pool) = weak.upgrade() else {
                    break;
                };
                if pool.is_closed() {
                    break;
                }
                pool.evict_idle().await;
            }
        });
    }

    /// Stop accepting acquisitions, wait for every borrowed connection to be
    /// returned and every in-flight acquire to settle, then close all idle
    /// connections.
    ///
    /// In-flight work is not cancelled. Calling it again is a no-op that
    /// waits for the same condition.
    pub async fn drain(&self) -> Result<()> {
        if !self.closing.swap(true, Ordering::AcqRel) {
            self.semaphore.close();
            info!(borrowed = self.borrowed(), "draining connection pool");
        }

        let mut rx = self.held.subscribe();
        rx.wait_for(|count| *count == 0)
            .await
            .map_err(|_| Error::internal("pool state channel closed"))?;

        let entries: Vec<_> = self.idle.lock().await.drain(..).collect();
        for entry in entries {
            self.discard(entry).await;
        }
        Ok(())
    }
}
