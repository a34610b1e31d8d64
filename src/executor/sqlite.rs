//! Bundled SQLite executor.
//!
//! One connection behind a mutex; statements run on the blocking pool.
//! Dropping an `execute` future interrupts its statement if it is the one
//! running on the connection, or skips it if it has not started.

use std::path::Path;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;
use rusqlite::types::ValueRef;
use rusqlite::{Connection, ErrorCode, InterruptHandle};
use tracing::debug;

use super::{Executor, ExecutorError, ExecutorResult, ResultSet, ScalarValue};
use crate::sql::Dialect;

pub struct SqliteExecutor {
    conn: Arc<Mutex<Connection>>,
    interrupt: Arc<InterruptHandle>,
    /// Id of the statement currently holding the connection, 0 when idle.
    running: Arc<Mutex<u64>>,
    next_id: AtomicU64,
}

impl SqliteExecutor {
    pub fn open<P: AsRef<Path>>(path: P) -> ExecutorResult<Self> {
        Ok(Self::from_connection(Connection::open(path)?))
    }

    pub fn open_in_memory() -> ExecutorResult<Self> {
        Ok(Self::from_connection(Connection::open_in_memory()?))
    }

    pub fn from_connection(conn: Connection) -> Self {
        let interrupt = Arc::new(conn.get_interrupt_handle());
        Self {
            conn: Arc::new(Mutex::new(conn)),
            interrupt,
            running: Arc::new(Mutex::new(0)),
            next_id: AtomicU64::new(1),
        }
    }

    /// Run several statements synchronously (fixtures, migrations).
    pub fn execute_batch(&self, sql: &str) -> ExecutorResult<()> {
        self.conn.lock().execute_batch(sql)?;
        Ok(())
    }
}

impl std::fmt::Debug for SqliteExecutor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SqliteExecutor").finish_non_exhaustive()
    }
}

/// Cancels the statement `id` unless disarmed.
struct InterruptOnDrop {
    id: u64,
    running: Arc<Mutex<u64>>,
    cancelled: Arc<AtomicBool>,
    interrupt: Arc<InterruptHandle>,
    armed: bool,
}

impl Drop for InterruptOnDrop {
    fn drop(&mut self) {
        if !self.armed {
            return;
        }
        self.cancelled.store(true, Ordering::SeqCst);
        // The statement clears its id under this lock before releasing the
        // connection, so no other statement can be running while it is held.
        let running = self.running.lock();
        if *running == self.id {
            debug!(statement = self.id, "executor.sqlite.interrupt");
            self.interrupt.interrupt();
        }
    }
}

#[async_trait]
impl Executor for SqliteExecutor {
    async fn execute(&self, sql: &str) -> ExecutorResult<ResultSet> {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let cancelled = Arc::new(AtomicBool::new(false));
        let mut guard = InterruptOnDrop {
            id,
            running: self.running.clone(),
            cancelled: cancelled.clone(),
            interrupt: self.interrupt.clone(),
            armed: true,
        };

        let conn = self.conn.clone();
        let running = self.running.clone();
        let sql = sql.to_string();
        let result = tokio::task::spawn_blocking(move || {
            let conn = conn.lock();
            {
                let mut current = running.lock();
                if cancelled.load(Ordering::SeqCst) {
                    debug!(statement = id, "executor.sqlite.skipped");
                    return Err(ExecutorError::Interrupted);
                }
                *current = id;
            }
            let result = run_statement(&conn, &sql);
            *running.lock() = 0;
            result
        })
        .await
        .map_err(|e| ExecutorError::Unavailable(e.to_string()))?;

        guard.armed = false;
        result
    }

    fn dialect(&self) -> Dialect {
        Dialect::Sqlite
    }
}

fn run_statement(conn: &Connection, sql: &str) -> ExecutorResult<ResultSet> {
    let mut stmt = conn.prepare(sql)?;
    let columns: Vec<String> = stmt.column_names().into_iter().map(String::from).collect();
    if columns.is_empty() {
        stmt.execute([])?;
        return Ok(ResultSet::default());
    }

    let mut rows = stmt.query([])?;
    let mut out = Vec::new();
    while let Some(row) = rows.next()? {
        let mut values = Vec::with_capacity(columns.len());
        for (i, column) in columns.iter().enumerate() {
            let value = match row.get_ref(i)? {
                ValueRef::Null => ScalarValue::Null,
                ValueRef::Integer(v) => ScalarValue::Int(v),
                ValueRef::Real(v) => ScalarValue::Float(v),
                ValueRef::Text(bytes) => ScalarValue::String(String::from_utf8_lossy(bytes).into_owned()),
                ValueRef::Blob(_) => {
                    return Err(ExecutorError::UnsupportedValue {
                        column: column.clone(),
                    })
                }
            };
            values.push(value);
        }
        out.push(values);
    }

    Ok(ResultSet { columns, rows: out })
}

impl From<rusqlite::Error> for ExecutorError {
    fn from(err: rusqlite::Error) -> Self {
        match &err {
            rusqlite::Error::SqliteFailure(e, _) => match e.code {
                ErrorCode::OperationInterrupted => ExecutorError::Interrupted,
                ErrorCode::DatabaseBusy | ErrorCode::DatabaseLocked => {
                    ExecutorError::Unavailable(err.to_string())
                }
                _ => ExecutorError::Database(err.to_string()),
            },
            _ => ExecutorError::Database(err.to_string()),
        }
    }
}
