//! Embedded single-file ledger backend.

use crate::archive::ledger::backend::{
    BackendKind, LedgerBackend, LedgerTransaction, SqlRow, SqlValue,
};
use crate::error::LedgerError;
use rusqlite::types::{Value, ValueRef};
use rusqlite::{Connection, ToSql, TransactionBehavior};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use std::time::Duration;

const BUSY_TIMEOUT: Duration = Duration::from_secs(30);
const MAX_IDLE_CONNECTIONS: usize = 4;

/// Small connection pool: idle connections are kept on a stack, checked out
/// for the duration of one logical operation and returned afterwards.
pub struct SqlitePool {
    path: PathBuf,
    idle: Mutex<Vec<Connection>>,
}

impl SqlitePool {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            idle: Mutex::new(Vec::new()),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn with_connection<T>(
        &self,
        op: impl FnOnce(&mut Connection) -> Result<T, LedgerError>,
    ) -> Result<T, LedgerError> {
        let mut conn = self.acquire()?;
        let result = op(&mut conn);
        self.release(conn);
        result
    }

    #[cfg(test)]
    fn idle_count(&self) -> usize {
        self.idle
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .len()
    }

    fn acquire(&self) -> Result<Connection, LedgerError> {
        let reused = self
            .idle
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .pop();
        match reused {
            Some(conn) => Ok(conn),
            None => self.open(),
        }
    }

    fn open(&self) -> Result<Connection, LedgerError> {
        if let Some(parent) = self.path.parent().filter(|p| !p.as_os_str().is_empty()) {
            fs::create_dir_all(parent)?;
        }
        let conn = Connection::open(&self.path)?;
        conn.busy_timeout(BUSY_TIMEOUT)?;
        conn.pragma_update_and_check(None, "journal_mode", "WAL", |row| {
            row.get::<_, String>(0)
        })?;
        conn.pragma_update(None, "synchronous", "NORMAL")?;
        Ok(conn)
    }

    fn release(&self, conn: Connection) {
        let mut idle = self
            .idle
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        if idle.len() < MAX_IDLE_CONNECTIONS {
            idle.push(conn);
        }
    }
}

pub struct SqliteBackend {
    pool: SqlitePool,
}

impl SqliteBackend {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }
}

impl LedgerBackend for SqliteBackend {
    fn kind(&self) -> BackendKind {
        BackendKind::Sqlite {
            path: self.pool.path().to_path_buf(),
        }
    }

    fn ensure_schema(&self, statements: &[&str]) -> Result<(), LedgerError> {
        self.pool.with_connection(|conn| {
            for statement in statements {
                conn.execute_batch(statement)?;
            }
            Ok(())
        })
    }

    fn transaction(
        &self,
        op: &mut dyn FnMut(&mut dyn LedgerTransaction) -> Result<(), LedgerError>,
    ) -> Result<(), LedgerError> {
        self.pool.with_connection(|conn| {
            // IMMEDIATE takes the write lock up front so concurrent writer
            // processes serialize instead of failing on lock upgrade.
            let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
            {
                let mut handle = SqliteTransaction { conn: &*tx };
                op(&mut handle)?;
            }
            tx.commit()?;
            Ok(())
        })
    }
}

struct SqliteTransaction<'a> {
    conn: &'a Connection,
}

fn to_sqlite_value(value: &SqlValue) -> Value {
    match value {
        SqlValue::Null => Value::Null,
        SqlValue::Int(v) => Value::Integer(*v),
        SqlValue::Text(v) => Value::Text(v.clone()),
    }
}

fn from_sqlite_value(value: ValueRef<'_>) -> SqlValue {
    match value {
        ValueRef::Null => SqlValue::Null,
        ValueRef::Integer(v) => SqlValue::Int(v),
        ValueRef::Real(v) => SqlValue::Text(v.to_string()),
        ValueRef::Text(v) | ValueRef::Blob(v) => {
            SqlValue::Text(String::from_utf8_lossy(v).into_owned())
        }
    }
}

/// Runs `f` with the parameters in rusqlite's named form (`:name`).
fn with_named<T>(
    params: &[(&'static str, SqlValue)],
    f: impl FnOnce(&[(&str, &dyn ToSql)]) -> Result<T, LedgerError>,
) -> Result<T, LedgerError> {
    let names: Vec<String> = params.iter().map(|(name, _)| format!(":{name}")).collect();
    let values: Vec<Value> = params.iter().map(|(_, v)| to_sqlite_value(v)).collect();
    let bound: Vec<(&str, &dyn ToSql)> = names
        .iter()
        .zip(values.iter())
        .map(|(name, value)| (name.as_str(), value as &dyn ToSql))
        .collect();
    f(bound.as_slice())
}

impl LedgerTransaction for SqliteTransaction<'_> {
    fn execute(&mut self, sql: &str, params: &[(&'static str, SqlValue)]) -> Result<u64, LedgerError> {
        let mut stmt = self.conn.prepare_cached(sql)?;
        let changed = with_named(params, |bound| Ok(stmt.execute(bound)?))?;
        Ok(changed as u64)
    }

    fn query(&mut self, sql: &str, params: &[(&'static str, SqlValue)]) -> Result<Vec<SqlRow>, LedgerError> {
        let mut stmt = self.conn.prepare_cached(sql)?;
        let columns = stmt.column_count();
        with_named(params, |bound| {
            let mut rows = stmt.query(bound)?;
            let mut out = Vec::new();
            while let Some(row) = rows.next()? {
                let mut values = Vec::with_capacity(columns);
                for idx in 0..columns {
                    values.push(from_sqlite_value(row.get_ref(idx)?));
                }
                out.push(SqlRow(values));
            }
            Ok(out)
        })
    }
}
