use std::cell::Cell;
use std::fs;
use std::path::{Path, PathBuf};

use chrono::Utc;
use rusqlite::types::{ToSqlOutput, Value, ValueRef};
use rusqlite::{Connection, ToSql, params_from_iter};
use strata_common::{DriverCode, DriverError, Error, Result};
use tracing::{error, info};

use crate::dialect::{Dialect, ErrorClass};
use crate::handle::{Row, SqlValue, StorageHandle};

/// Files that make up one SQLite database.
const SQLITE_SUFFIXES: [&str; 3] = ["", "-wal", "-shm"];

/// [`StorageHandle`] backed by a single `rusqlite` connection.
pub struct SqliteHandle {
    conn: Connection,
    version: String,
    path: Option<PathBuf>,
    savepoint_depth: Cell<u32>,
}

impl SqliteHandle {
    /// Open `db_path`, failing with [`Error::Corruption`] when the file is
    /// not a usable database.
    pub fn open(db_path: &Path) -> Result<Self> {
        info!("opening recorder database at {}", db_path.display());
        let conn =
            Connection::open(db_path).map_err(|e| open_error("failed to open database", e))?;

        conn.execute_batch("PRAGMA journal_mode=WAL; PRAGMA foreign_keys=ON;")
            .map_err(|e| open_error("failed to set pragmas", e))?;

        let mut handle = Self::from_connection(conn)?;
        handle.path = Some(db_path.to_path_buf());
        Ok(handle)
    }

    pub fn in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory()
            .map_err(|e| open_error("failed to open in-memory database", e))?;

        conn.execute_batch("PRAGMA foreign_keys=ON;")
            .map_err(|e| open_error("failed to set pragmas", e))?;

        Self::from_connection(conn)
    }

    pub fn from_connection(conn: Connection) -> Result<Self> {
        let version: String = conn
            .query_row("SELECT sqlite_version()", [], |row| row.get(0))
            .map_err(|e| open_error("failed to read sqlite version", e))?;

        Ok(Self {
            conn,
            version,
            path: None,
            savepoint_depth: Cell::new(0),
        })
    }

    /// File the database was opened from, `None` for in-memory databases.
    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    pub fn connection(&self) -> &Connection {
        &self.conn
    }
}

impl StorageHandle for SqliteHandle {
    fn dialect(&self) -> Dialect {
        Dialect::Sqlite
    }

    fn engine_version(&self) -> Option<&str> {
        Some(&self.version)
    }

    fn execute(&self, sql: &str, params: &[SqlValue]) -> Result<usize> {
        if params.is_empty() {
            // Batch execution also accepts statements that yield rows (PRAGMA, VACUUM).
            self.conn.execute_batch(sql).map_err(driver_error)?;
            return Ok(self.conn.changes() as usize);
        }
        self.conn
            .execute(sql, params_from_iter(params.iter()))
            .map_err(driver_error)
    }

    fn query(&self, sql: &str, params: &[SqlValue]) -> Result<Vec<Row>> {
        let mut stmt = self.conn.prepare(sql).map_err(driver_error)?;
        let width = stmt.column_count();
        let rows = stmt
            .query_map(params_from_iter(params.iter()), |row| {
                (0..width)
                    .map(|idx| row.get_ref(idx).map(SqlValue::from))
                    .collect::<rusqlite::Result<Row>>()
            })
            .map_err(driver_error)?;

        rows.collect::<rusqlite::Result<Vec<_>>>()
            .map_err(driver_error)
    }

    fn in_transaction(&self) -> bool {
        !self.conn.is_autocommit()
    }

    fn savepoint_depth(&self) -> &Cell<u32> {
        &self.savepoint_depth
    }

    fn table_exists(&self, table: &str) -> Result<bool> {
        let row = self.query_one(
            "SELECT 1 FROM sqlite_master WHERE type = 'table' AND name = ?",
            &[SqlValue::from(table)],
        )?;
        Ok(row.is_some())
    }

    fn list_indexes(&self, table: &str) -> Result<Vec<String>> {
        let rows = self.query(
            "SELECT name FROM sqlite_master WHERE type = 'index' AND tbl_name = ? ORDER BY name",
            &[SqlValue::from(table)],
        )?;
        Ok(rows
            .into_iter()
            .filter_map(|row| row.into_iter().next())
            .filter_map(|value| match value {
                SqlValue::Text(name) => Some(name),
                _ => None,
            })
            .collect())
    }
}

/// Rename a broken database and its journal files out of the way so a fresh
/// one can be created. Returns the new path of the main file.
pub fn move_away_broken_database(db_path: &Path) -> Result<PathBuf> {
    let suffix = format!(".corrupt.{}", Utc::now().format("%Y-%m-%dT%H:%M:%S%.6f"));
    let moved = PathBuf::from(format!("{}{suffix}", db_path.display()));
    error!(
        "renaming corrupt database {} to {} so a new one can be created",
        db_path.display(),
        moved.display()
    );

    for file_suffix in SQLITE_SUFFIXES {
        let path = PathBuf::from(format!("{}{file_suffix}", db_path.display()));
        if !path.exists() {
            continue;
        }
        let target = PathBuf::from(format!("{}{suffix}", path.display()));
        fs::rename(&path, &target)?;
    }
    Ok(moved)
}

/// Failure while opening: corruption is reported as such, everything else
/// keeps its driver code.
fn open_error(context: &str, err: rusqlite::Error) -> Error {
    let code = driver_code(&err);
    let err = Error::Driver(DriverError::new(code, format!("{context}: {err}")));
    if Dialect::Sqlite.classify(&err) == ErrorClass::Corruption {
        return Error::Corruption(err.to_string());
    }
    err
}

fn driver_code(err: &rusqlite::Error) -> Option<DriverCode> {
    match err {
        rusqlite::Error::SqliteFailure(failure, _) => {
            Some(DriverCode::Numeric(failure.extended_code))
        }
        _ => None,
    }
}

fn driver_error(err: rusqlite::Error) -> Error {
    Error::Driver(DriverError::new(driver_code(&err), err.to_string()))
}

impl ToSql for SqlValue {
    fn to_sql(&self) -> rusqlite::Result<ToSqlOutput<'_>> {
        Ok(match self {
            Self::Null => ToSqlOutput::Owned(Value::Null),
            Self::Integer(v) => ToSqlOutput::Owned(Value::Integer(*v)),
            Self::Real(v) => ToSqlOutput::Owned(Value::Real(*v)),
            Self::Text(v) => ToSqlOutput::Borrowed(ValueRef::Text(v.as_bytes())),
            Self::Blob(v) => ToSqlOutput::Borrowed(ValueRef::Blob(v)),
        })
    }
}

impl From<ValueRef<'_>> for SqlValue {
    fn from(value: ValueRef<'_>) -> Self {
        match value {
            ValueRef::Null => Self::Null,
            ValueRef::Integer(v) => Self::Integer(v),
            ValueRef::Real(v) => Self::Real(v),
            ValueRef::Text(v) => Self::Text(String::from_utf8_lossy(v).into_owned()),
            ValueRef::Blob(v) => Self::Blob(v.to_vec()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::handle::session_scope;

    fn handle() -> SqliteHandle {
        SqliteHandle::in_memory().expect("in-memory database should open")
    }

    #[test]
    fn reports_engine_version() {
        let handle = handle();
        let version = handle.engine_version().expect("version should be known");
        assert!(version.starts_with('3'));
    }

    #[test]
    fn values_round_trip_through_statements() {
        let handle = handle();
        handle
            .execute("CREATE TABLE t (i INTEGER, r FLOAT, s TEXT, n TEXT)", &[])
            .expect("create table");
        let inserted = handle
            .execute(
                "INSERT INTO t (i, r, s, n) VALUES (?, ?, ?, ?)",
                &[
                    SqlValue::Integer(7),
                    SqlValue::Real(1.5),
                    SqlValue::from("Protect the 🏠"),
                    SqlValue::Null,
                ],
            )
            .expect("insert");
        assert_eq!(inserted, 1);

        let rows = handle.query("SELECT i, r, s, n FROM t", &[]).expect("select");
        assert_eq!(
            rows,
            vec![vec![
                SqlValue::Integer(7),
                SqlValue::Real(1.5),
                SqlValue::from("Protect the 🏠"),
                SqlValue::Null,
            ]]
        );
    }

    #[test]
    fn duplicate_index_error_keeps_driver_text() {
        let handle = handle();
        handle.execute("CREATE TABLE t (a INTEGER)", &[]).expect("create table");
        handle.execute("CREATE INDEX ix_t_a ON t (a)", &[]).expect("create index");

        let err = handle
            .execute("CREATE INDEX ix_t_a ON t (a)", &[])
            .expect_err("second create should fail");
        let driver = err.driver().expect("driver error");
        assert_eq!(driver.code, Some(DriverCode::Numeric(1)));
        assert!(driver.message.contains("already exists"));
    }

    #[test]
    fn tracks_transaction_state_and_indexes() {
        let handle = handle();
        assert!(!handle.in_transaction());

        session_scope(&handle, |h| {
            assert!(h.in_transaction());
            h.execute(
                "CREATE TABLE events (event_id INTEGER PRIMARY KEY, time_fired DATETIME)",
                &[],
            )?;
            h.execute("CREATE INDEX ix_events_time_fired ON events (time_fired)", &[])?;
            Ok(())
        })
        .expect("scope should commit");

        assert!(!handle.in_transaction());
        assert!(handle.table_exists("events").expect("table lookup"));
        assert!(!handle.table_exists("states").expect("table lookup"));
        assert_eq!(
            handle.list_indexes("events").expect("index lookup"),
            vec!["ix_events_time_fired".to_string()]
        );
    }

    #[test]
    fn open_file_uses_wal() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("recorder.db");
        let handle = SqliteHandle::open(&path).expect("open file database");

        let mode = handle
            .query_one("PRAGMA journal_mode", &[])
            .expect("pragma")
            .and_then(|row| row.into_iter().next());
        assert_eq!(mode, Some(SqlValue::from("wal")));
        assert_eq!(handle.path(), Some(path.as_path()));
    }

    #[test]
    fn garbage_file_is_reported_as_corruption() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("recorder.db");
        std::fs::write(&path, vec![0x42_u8; 8192]).expect("write garbage");

        let err = SqliteHandle::open(&path)
            .err()
            .expect("garbage file should not open");
        assert!(matches!(err, Error::Corruption(_)), "unexpected error: {err}");
        assert_eq!(Dialect::Sqlite.classify(&err), ErrorClass::Corruption);
    }

    #[test]
    fn broken_database_is_moved_away_with_journal_files() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("recorder.db");
        std::fs::write(&path, vec![0x42_u8; 8192]).expect("write garbage");
        std::fs::write(dir.path().join("recorder.db-wal"), b"wal").expect("write wal");

        let moved = move_away_broken_database(&path).expect("move away");

        assert!(!path.exists());
        assert!(!dir.path().join("recorder.db-wal").exists());
        assert!(moved.exists());
        let name = moved.file_name().and_then(|n| n.to_str()).unwrap_or_default();
        assert!(name.starts_with("recorder.db.corrupt."));

        let fresh = SqliteHandle::open(&path).expect("fresh database opens");
        assert!(!fresh.table_exists("events").expect("lookup"));
    }
}
