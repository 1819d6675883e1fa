//! Cancellable query execution over pooled connections
//!
//! Each call to [`QueryRunner::with_connection`] runs one
//! `acquire → session id → operation → release` cycle as its own task and
//! returns a [`QueryHandle`]. The handle is a future for the result and can
//! cancel the query from anywhere via a [`CancelHandle`].
//!
//! Cancelling borrows a *second* connection from the same pool and sends a
//! kill command naming the first connection's session id. The target
//! connection is busy running the statement, so the kill cannot go through it.
//!
//! The connection is returned exactly once whether the operation succeeds,
//! fails or is cancelled. A connection whose session was named in a kill is
//! closed instead of going back to the idle set, so a late kill cannot reach
//! another caller's query. Once a cancel has been requested, the handle
//! resolves to [`Error::QueryCancelled`] even if a result arrived first.

use futures::future::BoxFuture;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::connection::Connection;
use crate::dialect::Dialect;
use crate::error::{Error, Result};
use crate::pool::ConnectionPool;
use crate::types::{Row, SessionId, Value};

/// What a call to [`CancelHandle::cancel`] did
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CancelOutcome {
    /// The kill command for this session was sent
    KillSent(SessionId),
    /// Cancelled before the operation started; it will not run
    NotStarted,
    /// A cancel had already been requested; nothing more was sent
    AlreadyRequested,
    /// The query had already completed; its result stands
    AlreadyCompleted,
}

#[derive(Debug, Default)]
struct CancelInner {
    cancelled: bool,
    completed: bool,
    session: Option<SessionId>,
}

/// Shared between the running query and every clone of its cancel handle.
///
/// The runner holds this lock across the release of its connection, so
/// "release, then check the flag" is atomic with respect to `cancel`.
#[derive(Debug, Default)]
struct CancelState {
    inner: Mutex<CancelInner>,
}

/// Cancels one running query
#[derive(Clone)]
pub struct CancelHandle {
    state: Arc<CancelState>,
    pool: Arc<ConnectionPool>,
    dialect: Arc<dyn Dialect>,
}

impl CancelHandle {
    /// Request cancellation.
    ///
    /// Sets the cancelled flag and, if the session id is known, sends the kill
    /// command through a second pooled connection. It does not wait for the
    /// query to observe the kill. An error means the kill could not be sent;
    /// the query still resolves as cancelled.
    pub async fn cancel(&self) -> Result<CancelOutcome> {
        let session = {
            let mut inner = self.state.inner.lock().await;
            if inner.completed {
                return Ok(CancelOutcome::AlreadyCompleted);
            }
            if inner.cancelled {
                return Ok(CancelOutcome::AlreadyRequested);
            }
            inner.cancelled = true;
            inner.session
        };

        let Some(session) = session else {
            info!("query cancelled before it started");
            return Ok(CancelOutcome::NotStarted);
        };

        info!(session = %session, "cancelling query");
        self.send_kill(session).await?;
        Ok(CancelOutcome::KillSent(session))
    }

    async fn send_kill(&self, session: SessionId) -> Result<()> {
        let conn = self.pool.acquire().await.inspect_err(|e| {
            warn!(session = %session, error = %e, "no connection available to send kill");
        })?;
        let sql = self.dialect.kill_session_sql(session);
        let result = conn.execute(&sql, &[]).await;
        self.pool.release(conn).await;

        match result {
            Ok(_) => {
                debug!(session = %session, "kill sent");
                Ok(())
            }
            Err(e) => {
                warn!(session = %session, error = %e, "failed to kill session");
                Err(e)
            }
        }
    }

    /// Whether a cancel has been requested
    pub async fn is_cancelled(&self) -> bool {
        self.state.inner.lock().await.cancelled
    }
}

impl std::fmt::Debug for CancelHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CancelHandle")
            .field("state", &self.state)
            .finish_non_exhaustive()
    }
}

/// A running query.
///
/// Await it for the result. Dropping it does not stop the query; the
/// connection is still released when the operation finishes.
pub struct QueryHandle<T> {
    task: JoinHandle<Result<T>>,
    cancel: CancelHandle,
}

impl<T> QueryHandle<T> {
    /// Request cancellation, see [`CancelHandle::cancel`]
    pub async fn cancel(&self) -> Result<CancelOutcome> {
        self.cancel.cancel().await
    }

    /// A handle that can cancel this query from another task
    pub fn cancel_handle(&self) -> CancelHandle {
        self.cancel.clone()
    }
}

impl<T> Future for QueryHandle<T> {
    type Output = Result<T>;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        Pin::new(&mut self.get_mut().task)
            .poll(cx)
            .map(|joined| match joined {
                Ok(result) => result,
                Err(e) => Err(Error::internal(format!("query task failed: {}", e))),
            })
    }
}

impl<T> std::fmt::Debug for QueryHandle<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("QueryHandle")
            .field("finished", &self.task.is_finished())
            .finish_non_exhaustive()
    }
}

/// Runs operations on pooled connections with cancellation support
#[derive(Clone)]
pub struct QueryRunner {
    pool: Arc<ConnectionPool>,
    dialect: Arc<dyn Dialect>,
}

impl QueryRunner {
    /// Create a runner over `pool`; `dialect` supplies the session and kill statements
    pub fn new(pool: Arc<ConnectionPool>, dialect: Arc<dyn Dialect>) -> Self {
        Self { pool, dialect }
    }

    /// The pool this runner borrows from
    pub fn pool(&self) -> &Arc<ConnectionPool> {
        &self.pool
    }

    /// Run `op` on a pooled connection as a cancellable query.
    ///
    /// ```rust,ignore
    /// let handle = runner.with_connection(|conn| {
    ///     Box::pin(async move { conn.query("SELECT * FROM big", &[]).await })
    /// });
    /// let canceller = handle.cancel_handle();
    /// tokio::spawn(async move { canceller.cancel().await });
    /// let rows = handle.await?;
    /// ```
    pub fn with_connection<T, F>(&self, op: F) -> QueryHandle<T>
    where
        T: Send + 'static,
        F: for<'c> FnOnce(&'c dyn Connection) -> BoxFuture<'c, Result<T>> + Send + 'static,
    {
        let state = Arc::new(CancelState::default());
        let task = tokio::spawn(run_cancellable(
            Arc::clone(&self.pool),
            Arc::clone(&self.dialect),
            Arc::clone(&state),
            op,
        ));

        QueryHandle {
            task,
            cancel: CancelHandle {
                state,
                pool: Arc::clone(&self.pool),
                dialect: Arc::clone(&self.dialect),
            },
        }
    }

    /// Run one statement and collect its rows
    pub async fn query(&self, sql: &str, params: &[Value]) -> Result<Vec<Row>> {
        let sql = sql.to_string();
        let params = params.to_vec();
        self.with_connection(move |conn| Box::pin(async move { conn.query(&sql, &params).await }))
            .await
    }
}

impl std::fmt::Debug for QueryRunner {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("QueryRunner")
            .field("dialect", &self.dialect.name())
            .finish_non_exhaustive()
    }
}

async fn run_cancellable<T, F>(
    pool: Arc<ConnectionPool>,
    dialect: Arc<dyn Dialect>,
    state: Arc<CancelState>,
    op: F,
) -> Result<T>
where
    F: for<'c> FnOnce(&'c dyn Connection) -> BoxFuture<'c, Result<T>>,
{
    // Nothing to release if this fails.
    let conn = pool.acquire().await?;

    let outcome = async {
        let row = conn
            .query_one(dialect.session_id_sql(), &[])
            .await?
            .ok_or_else(|| Error::query("session id query returned no rows"))?;
        let session = SessionId::from_row(&row)?;
        {
            let mut inner = state.inner.lock().await;
            if inner.cancelled {
                return Err(Error::QueryCancelled);
            }
            inner.session = Some(session);
        }
        debug!(conn_id = conn.id(), session = %session, "running query");
        op(&*conn).await
    }
    .await;

    let mut inner = state.inner.lock().await;
    if inner.cancelled && inner.session.is_some() {
        // A kill for this session may still be in flight; never reuse it.
        pool.destroy(conn).await;
    } else {
        pool.release(conn).await;
    }
    inner.completed = true;
    let cancelled = inner.cancelled;
    drop(inner);

    if cancelled {
        if outcome.is_ok() {
            // the statement may already have taken effect; it is not rolled back
            debug!("query finished after cancellation was requested");
        }
        return Err(Error::QueryCancelled);
    }
    outcome
}
