//! Client/server ledger backend.
//!
//! The worker loop is synchronous, so the backend owns a current-thread
//! tokio runtime and drives the `sqlx` pool with `block_on`, one call at a
//! time. Calls are never nested. The runtime context stays entered for the
//! whole logical operation because sqlx returns pooled connections from a
//! spawned task when they drop.

use crate::archive::ledger::backend::{
    BackendKind, LedgerBackend, LedgerTransaction, SqlRow, SqlValue,
};
use crate::error::LedgerError;
use sqlx::postgres::{PgPool, PgPoolOptions, PgRow, Postgres};
use sqlx::{Column, Row, Transaction, TypeInfo};
use std::time::Duration;
use tokio::runtime::Runtime;

const MAX_CONNECTIONS: u32 = 4;
const ACQUIRE_TIMEOUT: Duration = Duration::from_secs(30);

pub struct PostgresBackend {
    url: String,
    pool: PgPool,
    runtime: Runtime,
}

impl PostgresBackend {
    pub fn connect(url: &str) -> Result<Self, LedgerError> {
        let runtime = tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()?;
        let pool = runtime.block_on(
            PgPoolOptions::new()
                .max_connections(MAX_CONNECTIONS)
                .acquire_timeout(ACQUIRE_TIMEOUT)
                .connect(url),
        )?;
        Ok(Self {
            url: url.to_string(),
            pool,
            runtime,
        })
    }
}

impl LedgerBackend for PostgresBackend {
    fn kind(&self) -> BackendKind {
        BackendKind::Postgres {
            url: self.url.clone(),
        }
    }

    fn ensure_schema(&self, statements: &[&str]) -> Result<(), LedgerError> {
        let _context = self.runtime.enter();
        for statement in statements {
            self.runtime
                .block_on(sqlx::query(statement).execute(&self.pool))?;
        }
        Ok(())
    }

    fn transaction(
        &self,
        op: &mut dyn FnMut(&mut dyn LedgerTransaction) -> Result<(), LedgerError>,
    ) -> Result<(), LedgerError> {
        let _context = self.runtime.enter();
        let mut tx = self.runtime.block_on(self.pool.begin())?;
        let outcome = {
            let mut handle = PostgresTransaction {
                runtime: &self.runtime,
                tx: &mut tx,
            };
            op(&mut handle)
        };
        match outcome {
            Ok(()) => {
                self.runtime.block_on(tx.commit())?;
                Ok(())
            }
            Err(err) => {
                let _ = self.runtime.block_on(tx.rollback());
                Err(err)
            }
        }
    }
}

struct PostgresTransaction<'a> {
    runtime: &'a Runtime,
    tx: &'a mut Transaction<'static, Postgres>,
}

impl PostgresTransaction<'_> {
    fn bound_query<'q>(
        sql: &'q str,
        order: &[String],
        params: &[(&'static str, SqlValue)],
    ) -> Result<sqlx::query::Query<'q, Postgres, sqlx::postgres::PgArguments>, LedgerError> {
        let mut query = sqlx::query(sql);
        for name in order {
            let value = params
                .iter()
                .find(|(candidate, _)| *candidate == name.as_str())
                .map(|(_, value)| value)
                .ok_or_else(|| LedgerError::Statement(format!("missing parameter `:{name}`")))?;
            query = match value {
                SqlValue::Null => query.bind(None::<String>),
                SqlValue::Int(v) => query.bind(*v),
                SqlValue::Text(v) => query.bind(v.clone()),
            };
        }
        Ok(query)
    }
}

impl LedgerTransaction for PostgresTransaction<'_> {
    fn execute(&mut self, sql: &str, params: &[(&'static str, SqlValue)]) -> Result<u64, LedgerError> {
        let (rendered, order) = render_named(sql);
        let query = Self::bound_query(&rendered, &order, params)?;
        let done = self.runtime.block_on(query.execute(&mut **self.tx))?;
        Ok(done.rows_affected())
    }

    fn query(&mut self, sql: &str, params: &[(&'static str, SqlValue)]) -> Result<Vec<SqlRow>, LedgerError> {
        let (rendered, order) = render_named(sql);
        let query = Self::bound_query(&rendered, &order, params)?;
        let rows = self.runtime.block_on(query.fetch_all(&mut **self.tx))?;
        rows.iter().map(decode_row).collect()
    }
}

fn decode_row(row: &PgRow) -> Result<SqlRow, LedgerError> {
    let mut values = Vec::with_capacity(row.len());
    for (idx, column) in row.columns().iter().enumerate() {
        let value = match column.type_info().name() {
            "INT8" => row.try_get::<Option<i64>, _>(idx)?.map(SqlValue::Int),
            "INT4" => row
                .try_get::<Option<i32>, _>(idx)?
                .map(|v| SqlValue::Int(i64::from(v))),
            "INT2" => row
                .try_get::<Option<i16>, _>(idx)?
                .map(|v| SqlValue::Int(i64::from(v))),
            "TEXT" | "VARCHAR" | "BPCHAR" | "NAME" => {
                row.try_get::<Option<String>, _>(idx)?.map(SqlValue::Text)
            }
            other => {
                return Err(LedgerError::Decode(format!(
                    "unsupported column type {other} for `{}`",
                    column.name()
                )));
            }
        };
        values.push(value.unwrap_or(SqlValue::Null));
    }
    Ok(SqlRow(values))
}

/// Rewrites `:name` placeholders into `$n`, numbering each distinct name once
/// in order of first appearance. `::type` casts are left alone.
pub fn render_named(sql: &str) -> (String, Vec<String>) {
    let chars: Vec<char> = sql.chars().collect();
    let mut out = String::with_capacity(sql.len());
    let mut order: Vec<String> = Vec::new();
    let mut i = 0usize;
    while i < chars.len() {
        let ch = chars[i];
        let prev_is_colon = i > 0 && chars[i - 1] == ':';
        let next_starts_name = chars
            .get(i + 1)
            .is_some_and(|c| c.is_ascii_lowercase() || *c == '_');
        if ch == ':' && !prev_is_colon && next_starts_name {
            let mut j = i + 1;
            while j < chars.len() && (chars[j].is_ascii_alphanumeric() || chars[j] == '_') {
                j += 1;
            }
            let name: String = chars[i + 1..j].iter().collect();
            let position = match order.iter().position(|existing| *existing == name) {
                Some(pos) => pos + 1,
                None => {
                    order.push(name);
                    order.len()
                }
            };
            out.push('$');
            out.push_str(&position.to_string());
            i = j;
            continue;
        }
        out.push(ch);
        i += 1;
    }
    (out, order)
}
