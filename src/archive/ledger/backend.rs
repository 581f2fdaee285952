//! Backend seam for the ledger.
//!
//! SQL templates are written once with named `:param` placeholders. Each
//! backend binds them its own way, and every logical ledger operation runs
//! inside [`LedgerBackend::transaction`], which checks a connection out of
//! the backend's pool and returns it when the operation ends.

use crate::archive::ledger::postgres::PostgresBackend;
use crate::archive::ledger::sqlite::{SqliteBackend, SqlitePool};
use crate::error::LedgerError;
use std::path::PathBuf;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SqlValue {
    Null,
    Int(i64),
    Text(String),
}

impl From<&str> for SqlValue {
    fn from(value: &str) -> Self {
        Self::Text(value.to_string())
    }
}

impl From<String> for SqlValue {
    fn from(value: String) -> Self {
        Self::Text(value)
    }
}

impl From<i64> for SqlValue {
    fn from(value: i64) -> Self {
        Self::Int(value)
    }
}

impl From<u32> for SqlValue {
    fn from(value: u32) -> Self {
        Self::Int(i64::from(value))
    }
}

/// Named parameters; names are written without the leading `:`.
pub type NamedParams = Vec<(&'static str, SqlValue)>;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SqlRow(pub Vec<SqlValue>);

impl SqlRow {
    pub fn text(&self, idx: usize) -> Result<String, LedgerError> {
        match self.0.get(idx) {
            Some(SqlValue::Text(v)) => Ok(v.clone()),
            Some(SqlValue::Int(v)) => Ok(v.to_string()),
            other => Err(LedgerError::Decode(format!(
                "column {idx} is not text: {other:?}"
            ))),
        }
    }

    pub fn int(&self, idx: usize) -> Result<i64, LedgerError> {
        match self.0.get(idx) {
            Some(SqlValue::Int(v)) => Ok(*v),
            Some(SqlValue::Text(v)) => v.trim().parse::<i64>().map_err(|_| {
                LedgerError::Decode(format!("column {idx} is not an integer: {v}"))
            }),
            other => Err(LedgerError::Decode(format!(
                "column {idx} is not an integer: {other:?}"
            ))),
        }
    }
}

pub trait LedgerTransaction {
    /// Runs a statement and returns the number of affected rows.
    fn execute(&mut self, sql: &str, params: &[(&'static str, SqlValue)]) -> Result<u64, LedgerError>;

    fn query(&mut self, sql: &str, params: &[(&'static str, SqlValue)]) -> Result<Vec<SqlRow>, LedgerError>;

    fn query_opt(
        &mut self,
        sql: &str,
        params: &[(&'static str, SqlValue)],
    ) -> Result<Option<SqlRow>, LedgerError> {
        Ok(self.query(sql, params)?.into_iter().next())
    }
}

pub trait LedgerBackend: Send {
    fn kind(&self) -> BackendKind;

    /// Applies idempotent DDL; called on every ledger construction.
    fn ensure_schema(&self, statements: &[&str]) -> Result<(), LedgerError>;

    /// Runs `op` in one atomic transaction. An `Err` from `op` rolls back.
    fn transaction(
        &self,
        op: &mut dyn FnMut(&mut dyn LedgerTransaction) -> Result<(), LedgerError>,
    ) -> Result<(), LedgerError>;
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BackendKind {
    Sqlite { path: PathBuf },
    Postgres { url: String },
}

impl BackendKind {
    pub fn from_locator(locator: &str) -> Result<Self, LedgerError> {
        let trimmed = locator.trim();
        if trimmed.is_empty() {
            return Err(LedgerError::InvalidLocator(
                "ledger locator cannot be empty".to_string(),
            ));
        }
        if trimmed.starts_with("postgres://") || trimmed.starts_with("postgresql://") {
            return Ok(Self::Postgres {
                url: trimmed.to_string(),
            });
        }
        let path = trimmed
            .strip_prefix("sqlite://")
            .or_else(|| trimmed.strip_prefix("sqlite:"))
            .unwrap_or(trimmed);
        if path.is_empty() || path == ":memory:" {
            return Err(LedgerError::InvalidLocator(format!(
                "sqlite ledger needs a file path, got `{trimmed}`"
            )));
        }
        Ok(Self::Sqlite {
            path: PathBuf::from(path),
        })
    }

    pub fn label(&self) -> &'static str {
        match self {
            Self::Sqlite { .. } => "sqlite",
            Self::Postgres { .. } => "postgres",
        }
    }

    /// Locator safe to print: credentials in a postgres URL are masked.
    pub fn redacted(&self) -> String {
        match self {
            Self::Sqlite { path } => path.display().to_string(),
            Self::Postgres { url } => redact_url_credentials(url),
        }
    }
}

/// Chooses the backend once, from the shape of the locator string.
pub fn open_backend(locator: &str) -> Result<Box<dyn LedgerBackend>, LedgerError> {
    match BackendKind::from_locator(locator)? {
        BackendKind::Sqlite { path } => Ok(Box::new(SqliteBackend::new(SqlitePool::new(path)))),
        BackendKind::Postgres { url } => Ok(Box::new(PostgresBackend::connect(&url)?)),
    }
}

fn redact_url_credentials(url: &str) -> String {
    let Some((scheme, rest)) = url.split_once("://") else {
        return url.to_string();
    };
    match rest.split_once('@') {
        Some((_, host)) => format!("{scheme}://***@{host}"),
        None => url.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn locator_selects_backend() {
        assert_eq!(
            BackendKind::from_locator("postgresql://u:p@db:5432/archive").expect("pg"),
            BackendKind::Postgres {
                url: "postgresql://u:p@db:5432/archive".to_string()
            }
        );
        assert_eq!(
            BackendKind::from_locator("sqlite:///var/lib/aw/ledger.db").expect("sqlite"),
            BackendKind::Sqlite {
                path: PathBuf::from("/var/lib/aw/ledger.db")
            }
        );
        assert_eq!(
            BackendKind::from_locator("runs/ledger.sqlite").expect("bare path"),
            BackendKind::Sqlite {
                path: PathBuf::from("runs/ledger.sqlite")
            }
        );
        assert!(BackendKind::from_locator("  ").is_err());
        assert!(BackendKind::from_locator(":memory:").is_err());
    }

    #[test]
    fn redaction_hides_credentials() {
        let kind = BackendKind::from_locator("postgres://writer:secret@db/archive").expect("pg");
        assert_eq!(kind.redacted(), "postgres://***@db/archive");
    }

    #[test]
    fn row_accessors_convert_between_text_and_int() {
        let row = SqlRow(vec![SqlValue::Text("12".into()), SqlValue::Int(3), SqlValue::Null]);
        assert_eq!(row.int(0).expect("int from text"), 12);
        assert_eq!(row.text(1).expect("text from int"), "3");
        assert!(row.text(2).is_err());
    }
}
