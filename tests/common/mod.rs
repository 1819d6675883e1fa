//! In-memory CubeStore stand-in shared by the integration tests

#![allow(dead_code)]

use async_trait::async_trait;
use cubestore_driver::prelude::*;
use parking_lot::Mutex;
use regex::Regex;
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, LazyLock};
use std::time::Duration;
use tokio::sync::{Notify, Semaphore};

static TABLE_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)^\s*(CREATE TABLE|DROP TABLE|INSERT INTO)\s+([`\w.]+)").unwrap()
});

static EXISTS_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"information_schema\.tables WHERE (?:table_schema = '(\w+)' AND )?table_name = '(\w+)'")
        .unwrap()
});

/// One statement as received by the backend
#[derive(Debug, Clone)]
pub struct Statement {
    pub session: u64,
    pub sql: String,
    pub params: Vec<Value>,
}

impl Statement {
    pub fn is_insert(&self) -> bool {
        self.sql.starts_with("INSERT INTO")
    }
}

/// Blocks matching statements until opened (or the session is killed)
#[derive(Debug)]
pub struct Gate {
    pattern: String,
    open: Semaphore,
    waiting: AtomicUsize,
}

impl Gate {
    /// Let every blocked and future matching statement through
    pub fn open(&self) {
        self.open.add_permits(Semaphore::MAX_PERMITS / 2);
    }

    /// Number of statements currently blocked
    pub fn waiting(&self) -> usize {
        self.waiting.load(Ordering::SeqCst)
    }

    /// Wait until at least one statement is blocked
    pub async fn wait_entered(&self) {
        while self.waiting() == 0 {
            tokio::time::sleep(Duration::from_millis(1)).await;
        }
    }
}

#[derive(Debug, Default)]
struct Session {
    killed: AtomicBool,
    kill: Notify,
}

#[derive(Debug, Default)]
struct State {
    statements: Vec<Statement>,
    tables: HashSet<String>,
    sessions: HashMap<u64, Arc<Session>>,
    fail_on: Vec<String>,
    fail_from: Vec<(String, usize)>,
    gates: Vec<Arc<Gate>>,
}

#[derive(Debug, Default)]
struct Shared {
    state: Mutex<State>,
    next_session: AtomicU64,
    opened: AtomicU64,
    closed: AtomicU64,
    fail_connect: AtomicBool,
    fail_ping: AtomicBool,
}

/// Fake backend; also the connection factory handed to the pool
#[derive(Debug, Clone, Default)]
pub struct MockBackend {
    shared: Arc<Shared>,
}

fn normalize_table(name: &str) -> String {
    name.replace('`', "")
}

impl MockBackend {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn factory(&self) -> Arc<dyn ConnectionFactory> {
        Arc::new(self.clone())
    }

    /// Refuse new connections
    pub fn set_fail_connect(&self, fail: bool) {
        self.shared.fail_connect.store(fail, Ordering::SeqCst);
    }

    /// Fail every health check
    pub fn set_fail_ping(&self, fail: bool) {
        self.shared.fail_ping.store(fail, Ordering::SeqCst);
    }

    /// Fail statements containing `pattern`
    pub fn fail_on(&self, pattern: &str) {
        self.shared.state.lock().fail_on.push(pattern.to_string());
    }

    /// Fail the `nth` (1-based) and later statements starting with `prefix`
    pub fn fail_from(&self, prefix: &str, nth: usize) {
        self.shared
            .state
            .lock()
            .fail_from
            .push((prefix.to_string(), nth));
    }

    /// Block statements containing `pattern` until the gate opens
    pub fn gate(&self, pattern: &str) -> Arc<Gate> {
        let gate = Arc::new(Gate {
            pattern: pattern.to_string(),
            open: Semaphore::new(0),
            waiting: AtomicUsize::new(0),
        });
        self.shared.state.lock().gates.push(Arc::clone(&gate));
        gate
    }

    /// Simulate an out-of-band transport failure of one session
    pub fn break_session(&self, session: u64) {
        if let Some(s) = self.shared.state.lock().sessions.get(&session) {
            s.killed.store(true, Ordering::SeqCst);
        }
    }

    pub fn create_table(&self, name: &str) {
        self.shared.state.lock().tables.insert(name.to_string());
    }

    pub fn has_table(&self, name: &str) -> bool {
        self.shared.state.lock().tables.contains(name)
    }

    pub fn statements(&self) -> Vec<Statement> {
        self.shared.state.lock().statements.clone()
    }

    /// Statements starting with `prefix`
    pub fn statements_starting(&self, prefix: &str) -> Vec<Statement> {
        self.statements()
            .into_iter()
            .filter(|s| s.sql.starts_with(prefix))
            .collect()
    }

    pub fn inserts(&self) -> Vec<Statement> {
        self.statements().into_iter().filter(Statement::is_insert).collect()
    }

    pub fn connections_opened(&self) -> u64 {
        self.shared.opened.load(Ordering::SeqCst)
    }

    pub fn connections_closed(&self) -> u64 {
        self.shared.closed.load(Ordering::SeqCst)
    }

    fn gate_for(&self, sql: &str) -> Option<Arc<Gate>> {
        self.shared
            .state
            .lock()
            .gates
            .iter()
            .find(|g| sql.contains(&g.pattern))
            .cloned()
    }

    fn apply(&self, session: u64, sql: &str, params: &[Value]) -> Result<Vec<Row>> {
        let mut state = self.shared.state.lock();
        state.statements.push(Statement {
            session,
            sql: sql.to_string(),
            params: params.to_vec(),
        });

        if sql.starts_with("select connection_id()") {
            return Ok(vec![Row::new(
                vec!["connectionId".into()],
                vec![Value::Int64(session as i64)],
            )]);
        }
        if sql == "SELECT 1" {
            if self.shared.fail_ping.load(Ordering::SeqCst) {
                return Err(Error::query("ping failed"));
            }
            return Ok(vec![Row::new(vec!["1".into()], vec![Value::Int64(1)])]);
        }
        if let Some(target) = sql.strip_prefix("KILL ") {
            let target: u64 = target
                .trim()
                .parse()
                .map_err(|_| Error::query_with_sql("bad session id", sql))?;
            let victim = state
                .sessions
                .get(&target)
                .cloned()
                .ok_or_else(|| Error::query_with_sql("unknown thread id", sql))?;
            victim.killed.store(true, Ordering::SeqCst);
            victim.kill.notify_one();
            return Ok(Vec::new());
        }
        if state.fail_on.iter().any(|p| sql.contains(p.as_str())) {
            return Err(Error::query_with_sql("injected failure", sql));
        }
        // the current statement is already recorded, so `seen` is 1-based
        let failing = state.fail_from.iter().any(|(prefix, nth)| {
            let seen = state
                .statements
                .iter()
                .filter(|s| s.sql.starts_with(prefix.as_str()))
                .count();
            sql.starts_with(prefix.as_str()) && seen >= *nth
        });
        if failing {
            return Err(Error::query_with_sql("injected failure", sql));
        }
        if let Some(caps) = EXISTS_RE.captures(sql) {
            let name = match caps.get(1) {
                Some(schema) => format!("{}.{}", schema.as_str(), &caps[2]),
                None => caps[2].to_string(),
            };
            let exists = state.tables.contains(&name);
            return Ok(if exists {
                vec![Row::new(vec!["table_name".into()], vec![Value::from(name)])]
            } else {
                Vec::new()
            });
        }

        let Some(caps) = TABLE_RE.captures(sql) else {
            return Ok(Vec::new());
        };
        let table = normalize_table(&caps[2]);
        match caps[1].to_ascii_uppercase().as_str() {
            "CREATE TABLE" => {
                if params
                    .iter()
                    .any(|p| p.as_str().is_some_and(|f| f.contains("malformed")))
                {
                    return Err(Error::query_with_sql("cannot read file", sql));
                }
                if !state.tables.insert(table.clone()) {
                    return Err(Error::query_with_sql(format!("table {} already exists", table), sql));
                }
            }
            "DROP TABLE" => {
                if !state.tables.remove(&table) {
                    return Err(Error::query_with_sql(format!("table {} does not exist", table), sql));
                }
            }
            _ => {
                if !state.tables.contains(&table) {
                    return Err(Error::query_with_sql(format!("table {} does not exist", table), sql));
                }
            }
        }
        Ok(Vec::new())
    }
}

#[async_trait]
impl ConnectionFactory for MockBackend {
    async fn connect(&self, _config: &ConnectionConfig) -> Result<Box<dyn Connection>> {
        if self.shared.fail_connect.load(Ordering::SeqCst) {
            return Err(Error::connection("connection refused"));
        }
        let id = self.shared.next_session.fetch_add(1, Ordering::SeqCst) + 1;
        let session = Arc::new(Session::default());
        self.shared
            .state
            .lock()
            .sessions
            .insert(id, Arc::clone(&session));
        self.shared.opened.fetch_add(1, Ordering::SeqCst);
        Ok(Box::new(MockConnection {
            id,
            session,
            backend: self.clone(),
            closed: AtomicBool::new(false),
        }))
    }
}

/// One fake session
pub struct MockConnection {
    id: u64,
    session: Arc<Session>,
    backend: MockBackend,
    closed: AtomicBool,
}

impl MockConnection {
    async fn run(&self, sql: &str, params: &[Value]) -> Result<Vec<Row>> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(Error::connection("connection closed"));
        }
        if self.is_broken() {
            return Err(Error::connection("connection lost"));
        }

        if let Some(gate) = self.backend.gate_for(sql) {
            gate.waiting.fetch_add(1, Ordering::SeqCst);
            let outcome = tokio::select! {
                permit = gate.open.acquire() => permit.map(|p| p.forget()).map_err(|_| ()),
                _ = self.session.kill.notified() => Err(()),
            };
            gate.waiting.fetch_sub(1, Ordering::SeqCst);
            if outcome.is_err() || self.is_broken() {
                return Err(Error::connection("query interrupted: session killed"));
            }
        }

        self.backend.apply(self.id, sql, params)
    }
}

#[async_trait]
impl Connection for MockConnection {
    async fn query(&self, sql: &str, params: &[Value]) -> Result<Vec<Row>> {
        self.run(sql, params).await
    }

    async fn execute(&self, sql: &str, params: &[Value]) -> Result<u64> {
        Ok(self.run(sql, params).await?.len() as u64)
    }

    fn is_broken(&self) -> bool {
        self.session.killed.load(Ordering::SeqCst)
    }

    async fn close(&self) -> Result<()> {
        if !self.closed.swap(true, Ordering::SeqCst) {
            self.backend.shared.closed.fetch_add(1, Ordering::SeqCst);
        }
        Ok(())
    }
}

/// Pool over `backend` with eviction disabled unless the config asks for it
pub async fn pool(backend: &MockBackend, config: PoolConfig) -> Arc<ConnectionPool> {
    ConnectionPool::new(
        config,
        ConnectionConfig::default(),
        backend.factory(),
        Arc::new(CubeStoreDialect),
    )
    .await
    .unwrap()
}

/// Small pool config with a short acquire timeout and no background eviction
pub fn test_pool_config(max_size: usize) -> PoolConfig {
    PoolConfig::default()
        .with_max_size(max_size)
        .with_acquire_timeout(Duration::from_millis(200))
        .with_eviction_interval(Duration::ZERO)
}

pub fn runner(pool: &Arc<ConnectionPool>) -> QueryRunner {
    QueryRunner::new(Arc::clone(pool), Arc::new(CubeStoreDialect))
}

pub async fn driver(backend: &MockBackend, max_pool: usize) -> CubeStoreDriver {
    let config = DriverConfig::builder()
        .database("pre")
        .max_pool_size(max_pool)
        .acquire_timeout(Duration::from_millis(500))
        .eviction_interval(Duration::ZERO)
        .build()
        .unwrap();
    CubeStoreDriver::new(config, backend.factory()).await.unwrap()
}

/// Upload rows with an `id` int and a `name` string column
pub fn numbered_rows(count: usize) -> Vec<RowMap> {
    (0..count)
        .map(|i| {
            let mut row = RowMap::new();
            row.insert("id".into(), Value::Int64(i as i64));
            row.insert("name".into(), Value::from(format!("row-{}", i)));
            row
        })
        .collect()
}

pub fn id_name_columns() -> Vec<ColumnDescriptor> {
    vec![
        ColumnDescriptor::new("id", "int"),
        ColumnDescriptor::new("name", "string"),
    ]
}
