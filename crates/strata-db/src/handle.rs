//! The storage handle borrowed by every operation, plus scoped transactions.

use std::cell::Cell;

use chrono::{DateTime, Utc};
use strata_common::Result;
use tracing::warn;

use crate::dialect::{Capabilities, Dialect};

/// Text layout used for every datetime value bound by this crate.
pub const DATETIME_FORMAT: &str = "%Y-%m-%d %H:%M:%S%.6f";

/// A single bound parameter or result cell.
#[derive(Debug, Clone, PartialEq)]
pub enum SqlValue {
    Null,
    Integer(i64),
    Real(f64),
    Text(String),
    Blob(Vec<u8>),
}

pub type Row = Vec<SqlValue>;

impl SqlValue {
    /// Datetime as microsecond-precision UTC text.
    pub fn datetime(value: DateTime<Utc>) -> Self {
        Self::Text(value.format(DATETIME_FORMAT).to_string())
    }

    /// Datetime as fractional seconds since the Unix epoch.
    pub fn timestamp(value: DateTime<Utc>) -> Self {
        Self::Real(value.timestamp_micros() as f64 / 1_000_000.0)
    }

    pub fn is_null(&self) -> bool {
        matches!(self, Self::Null)
    }

    pub fn as_i64(&self) -> Option<i64> {
        match self {
            Self::Integer(v) => Some(*v),
            Self::Real(v) => Some(*v as i64),
            Self::Text(v) => v.trim().parse().ok(),
            _ => None,
        }
    }

    pub fn as_f64(&self) -> Option<f64> {
        match self {
            Self::Integer(v) => Some(*v as f64),
            Self::Real(v) => Some(*v),
            Self::Text(v) => v.trim().parse().ok(),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Self::Text(v) => Some(v),
            _ => None,
        }
    }
}

impl From<i64> for SqlValue {
    fn from(value: i64) -> Self {
        Self::Integer(value)
    }
}

impl From<f64> for SqlValue {
    fn from(value: f64) -> Self {
        Self::Real(value)
    }
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

impl<T: Into<SqlValue>> From<Option<T>> for SqlValue {
    fn from(value: Option<T>) -> Self {
        value.map_or(Self::Null, Into::into)
    }
}

/// Connection to a recorder database, owned by the caller.
///
/// Statements use `?` positional placeholders; implementations translate
/// them when the driver expects another style. Methods take `&self` so the
/// same handle can be threaded through nested scopes.
pub trait StorageHandle {
    fn dialect(&self) -> Dialect;

    /// Server or library version as reported by the engine.
    fn engine_version(&self) -> Option<&str> {
        None
    }

    fn capabilities(&self) -> Capabilities {
        self.dialect().capabilities_for(self.engine_version())
    }

    /// Run a statement and return the number of affected rows.
    fn execute(&self, sql: &str, params: &[SqlValue]) -> Result<usize>;

    fn query(&self, sql: &str, params: &[SqlValue]) -> Result<Vec<Row>>;

    fn query_one(&self, sql: &str, params: &[SqlValue]) -> Result<Option<Row>> {
        Ok(self.query(sql, params)?.into_iter().next())
    }

    fn begin(&self) -> Result<()> {
        self.execute(self.capabilities().begin_statement, &[]).map(|_| ())
    }

    fn commit(&self) -> Result<()> {
        self.execute("COMMIT", &[]).map(|_| ())
    }

    fn rollback(&self) -> Result<()> {
        self.execute("ROLLBACK", &[]).map(|_| ())
    }

    fn in_transaction(&self) -> bool;

    /// Number of savepoints currently opened through [`Scope`] on this handle.
    fn savepoint_depth(&self) -> &Cell<u32>;

    fn table_exists(&self, table: &str) -> Result<bool>;

    /// Names of the indexes currently defined on `table`.
    fn list_indexes(&self, table: &str) -> Result<Vec<String>>;
}

/// `?, ?, ?` for `count` parameters.
pub fn placeholders(count: usize) -> String {
    vec!["?"; count].join(", ")
}

/// A transaction, or a savepoint when one is already open.
///
/// Dropping an unfinished scope rolls it back.
pub struct Scope<'h> {
    handle: &'h dyn StorageHandle,
    savepoint: Option<String>,
    finished: bool,
}

impl<'h> Scope<'h> {
    pub fn begin(handle: &'h dyn StorageHandle) -> Result<Self> {
        let savepoint = if handle.in_transaction() {
            let depth = handle.savepoint_depth();
            let name = format!("strata_sp_{}", depth.get() + 1);
            handle.execute(&format!("SAVEPOINT {name}"), &[])?;
            depth.set(depth.get() + 1);
            Some(name)
        } else {
            handle.begin()?;
            None
        };

        Ok(Self {
            handle,
            savepoint,
            finished: false,
        })
    }

    pub fn handle(&self) -> &'h dyn StorageHandle {
        self.handle
    }

    pub fn is_savepoint(&self) -> bool {
        self.savepoint.is_some()
    }

    pub fn commit(mut self) -> Result<()> {
        let result = match &self.savepoint {
            Some(name) => self
                .handle
                .execute(&format!("RELEASE SAVEPOINT {name}"), &[])
                .map(|_| ()),
            None => self.handle.commit(),
        };
        if result.is_ok() {
            self.finish();
        }
        result
    }

    pub fn rollback(mut self) -> Result<()> {
        let result = self.undo();
        self.finish();
        result
    }

    fn finish(&mut self) {
        self.finished = true;
        if self.savepoint.is_some() {
            let depth = self.handle.savepoint_depth();
            depth.set(depth.get().saturating_sub(1));
        }
    }

    fn undo(&self) -> Result<()> {
        match &self.savepoint {
            Some(name) => {
                self.handle.execute(&format!("ROLLBACK TO SAVEPOINT {name}"), &[])?;
                self.handle.execute(&format!("RELEASE SAVEPOINT {name}"), &[])?;
                Ok(())
            }
            None => self.handle.rollback(),
        }
    }
}

impl Drop for Scope<'_> {
    fn drop(&mut self) {
        if self.finished {
            return;
        }
        if let Err(e) = self.undo() {
            warn!("failed to roll back unfinished scope: {e}");
        }
        self.finish();
    }
}

/// Run `f` in a scope that commits when it returns `Ok`.
pub fn session_scope<'h, T>(
    handle: &'h dyn StorageHandle,
    f: impl FnOnce(&'h dyn StorageHandle) -> Result<T>,
) -> Result<T> {
    let scope = Scope::begin(handle)?;
    let value = f(handle)?;
    scope.commit()?;
    Ok(value)
}

/// Run `f` in a scope that is always rolled back, whatever it returns.
pub fn rollback_scope<'h, T>(
    handle: &'h dyn StorageHandle,
    f: impl FnOnce(&'h dyn StorageHandle) -> Result<T>,
) -> Result<T> {
    let scope = Scope::begin(handle)?;
    let result = f(handle);
    scope.rollback()?;
    result
}
