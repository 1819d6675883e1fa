//! MySQL wire-protocol backend for cubestore-driver
//!
//! CubeStore speaks the MySQL protocol, so physical connections are
//! `mysql_async` sessions. Statements without parameters use the text
//! protocol (`KILL`, DDL, health checks); statements with parameters are
//! sent as prepared statements.
//!
//! A transport-level failure (I/O or protocol error) marks the connection
//! broken so the pool discards it. Server errors leave it usable.

use async_trait::async_trait;
use chrono::{Datelike, Timelike};
use mysql_async::prelude::*;
use mysql_async::{Conn, Opts, OptsBuilder};
use std::sync::atomic::{AtomicBool, Ordering};
use tokio::sync::Mutex;
use tracing::warn;

use crate::connection::{Connection, ConnectionConfig, ConnectionFactory};
use crate::error::{Error, Result};
use crate::types::{Row, Value};

fn date_value(date: chrono::NaiveDate, time: chrono::NaiveTime) -> mysql_async::Value {
    mysql_async::Value::Date(
        date.year() as u16,
        date.month() as u8,
        date.day() as u8,
        time.hour() as u8,
        time.minute() as u8,
        time.second() as u8,
        time.nanosecond() / 1000,
    )
}

/// Convert a Value to a MySQL parameter
fn value_to_sql(value: &Value) -> mysql_async::Value {
    match value {
        Value::Null => mysql_async::Value::NULL,
        Value::Bool(b) => mysql_async::Value::from(*b),
        Value::Int8(n) => mysql_async::Value::from(*n),
        Value::Int16(n) => mysql_async::Value::from(*n),
        Value::Int32(n) => mysql_async::Value::from(*n),
        Value::Int64(n) => mysql_async::Value::from(*n),
        Value::Float32(n) => mysql_async::Value::from(*n),
        Value::Float64(n) => mysql_async::Value::from(*n),
        Value::Decimal(d) => mysql_async::Value::from(d.to_string()),
        Value::String(s) => mysql_async::Value::from(s.clone()),
        Value::Bytes(b) => mysql_async::Value::from(b.clone()),
        Value::Date(d) => date_value(*d, chrono::NaiveTime::MIN),
        Value::Time(t) => mysql_async::Value::Time(
            false,
            0,
            t.hour() as u8,
            t.minute() as u8,
            t.second() as u8,
            t.nanosecond() / 1000,
        ),
        Value::DateTime(dt) => date_value(dt.date(), dt.time()),
        // sessions run in UTC
        Value::DateTimeTz(dt) => {
            let naive = dt.naive_utc();
            date_value(naive.date(), naive.time())
        }
        Value::Json(j) => mysql_async::Value::from(j.to_string()),
    }
}

/// Convert a MySQL result cell to a Value
fn mysql_value_to_value(val: mysql_async::Value) -> Value {
    match val {
        mysql_async::Value::NULL => Value::Null,
        mysql_async::Value::Bytes(b) => match String::from_utf8(b) {
            Ok(s) => Value::String(s),
            Err(e) => Value::Bytes(e.into_bytes()),
        },
        mysql_async::Value::Int(n) => Value::Int64(n),
        mysql_async::Value::UInt(n) => match i64::try_from(n) {
            Ok(n) => Value::Int64(n),
            Err(_) => Value::Decimal(n.into()),
        },
        mysql_async::Value::Float(f) => Value::Float32(f),
        mysql_async::Value::Double(d) => Value::Float64(d),
        mysql_async::Value::Date(year, month, day, hour, min, sec, micro) => {
            let Some(date) = chrono::NaiveDate::from_ymd_opt(year as i32, month as u32, day as u32)
            else {
                return Value::Null;
            };
            if hour == 0 && min == 0 && sec == 0 && micro == 0 {
                return Value::Date(date);
            }
            chrono::NaiveTime::from_hms_micro_opt(hour as u32, min as u32, sec as u32, micro)
                .map(|time| Value::DateTime(chrono::NaiveDateTime::new(date, time)))
                .unwrap_or(Value::Null)
        }
        mysql_async::Value::Time(neg, days, hour, min, sec, micro) => {
            if !neg && days == 0 {
                if let Some(time) =
                    chrono::NaiveTime::from_hms_micro_opt(hour as u32, min as u32, sec as u32, micro)
                {
                    return Value::Time(time);
                }
            }
            // durations outside a day keep their textual form
            let hours = days * 24 + hour as u32;
            Value::String(format!(
                "{}{:02}:{:02}:{:02}.{:06}",
                if neg { "-" } else { "" },
                hours,
                min,
                sec,
                micro
            ))
        }
    }
}

fn into_row(row: mysql_async::Row) -> Row {
    let columns: Vec<String> = row
        .columns_ref()
        .iter()
        .map(|c| c.name_str().to_string())
        .collect();
    let values: Vec<Value> = (0..row.len())
        .map(|i| {
            let val: mysql_async::Value = row.get(i).unwrap_or(mysql_async::Value::NULL);
            mysql_value_to_value(val)
        })
        .collect();
    Row::new(columns, values)
}

/// Server errors leave the session usable; anything else does not
fn is_transport_error(e: &mysql_async::Error) -> bool {
    !matches!(e, mysql_async::Error::Server(_))
}

/// One MySQL-protocol session
pub struct MySqlConnection {
    conn: Mutex<Option<Conn>>,
    broken: AtomicBool,
}

impl MySqlConnection {
    /// Wrap an established session
    pub fn new(conn: Conn) -> Self {
        Self {
            conn: Mutex::new(Some(conn)),
            broken: AtomicBool::new(false),
        }
    }

    /// Open a session described by `config`
    pub async fn connect(config: &ConnectionConfig) -> Result<Self> {
        let opts = connect_opts(config)?;
        let conn = Conn::new(opts)
            .await
            .map_err(|e| Error::connection_with_source("failed to connect to CubeStore", e))?;
        Ok(Self::new(conn))
    }

    async fn take_conn(&self) -> Result<Conn> {
        if self.is_broken() {
            return Err(Error::connection("connection is broken"));
        }
        self.conn
            .lock()
            .await
            .take()
            .ok_or_else(|| Error::connection("connection not available"))
    }

    async fn put_conn(&self, conn: Conn) {
        *self.conn.lock().await = Some(conn);
    }

    /// Put the session back unless the error killed it
    async fn settle<T>(
        &self,
        conn: Conn,
        sql: &str,
        result: std::result::Result<T, mysql_async::Error>,
    ) -> Result<T> {
        match result {
            Ok(value) => {
                self.put_conn(conn).await;
                Ok(value)
            }
            Err(e) => {
                if is_transport_error(&e) {
                    warn!(error = %e, "connection failed, marking broken");
                    self.broken.store(true, Ordering::Release);
                } else {
                    self.put_conn(conn).await;
                }
                Err(Error::Query {
                    message: e.to_string(),
                    sql: Some(sql.to_string()),
                    source: Some(Box::new(e)),
                })
            }
        }
    }
}

fn connect_opts(config: &ConnectionConfig) -> Result<Opts> {
    if let Some(url) = &config.url {
        return Opts::from_url(url)
            .map_err(|e| Error::config(format!("invalid MySQL connection URL: {}", e)));
    }

    if !matches!(config.timezone.as_str(), "Z" | "UTC" | "+00:00") {
        warn!(timezone = %config.timezone, "only UTC sessions are supported, ignoring timezone");
    }

    let builder = OptsBuilder::default()
        .ip_or_hostname(config.host.clone())
        .tcp_port(config.port)
        .user(config.user.clone())
        .pass(config.password.clone())
        .db_name(config.database.clone())
        .socket(config.socket_path.clone());
    Ok(builder.into())
}

#[async_trait]
impl Connection for MySqlConnection {
    async fn query(&self, sql: &str, params: &[Value]) -> Result<Vec<Row>> {
        let mut conn = self.take_conn().await?;
        let result: std::result::Result<Vec<mysql_async::Row>, _> = if params.is_empty() {
            conn.query(sql).await
        } else {
            let mysql_params: Vec<mysql_async::Value> = params.iter().map(value_to_sql).collect();
            conn.exec(sql, mysql_params).await
        };
        let rows = self.settle(conn, sql, result).await?;
        Ok(rows.into_iter().map(into_row).collect())
    }

    async fn execute(&self, sql: &str, params: &[Value]) -> Result<u64> {
        let mut conn = self.take_conn().await?;
        let result = if params.is_empty() {
            conn.query_drop(sql).await
        } else {
            let mysql_params: Vec<mysql_async::Value> = params.iter().map(value_to_sql).collect();
            conn.exec_drop(sql, mysql_params).await
        };
        let affected = conn.affected_rows();
        self.settle(conn, sql, result).await?;
        Ok(affected)
    }

    fn is_broken(&self) -> bool {
        self.broken.load(Ordering::Acquire)
    }

    async fn close(&self) -> Result<()> {
        if let Some(conn) = self.conn.lock().await.take() {
            conn.disconnect()
                .await
                .map_err(|e| Error::connection_with_source("failed to close connection", e))?;
        }
        Ok(())
    }
}

/// Opens [`MySqlConnection`]s for the pool
#[derive(Debug, Clone, Copy, Default)]
pub struct MySqlConnectionFactory;

#[async_trait]
impl ConnectionFactory for MySqlConnectionFactory {
    async fn connect(&self, config: &ConnectionConfig) -> Result<Box<dyn Connection>> {
        let conn = MySqlConnection::connect(config).await?;
        Ok(Box::new(conn))
    }
}
