//! Scripted [`StorageHandle`] for exercising MySQL and PostgreSQL paths.
//!
//! It records every statement, emulates just enough DDL bookkeeping for the
//! primitives (tables, indexes, columns, ledger rows) and the probe tables,
//! and fails statements matching configured patterns. On MySQL, DDL commits
//! the open transaction and discards its savepoints, as the server does.

use std::cell::{Cell, OnceCell, RefCell};
use std::collections::{BTreeMap, BTreeSet, HashMap};

use strata_common::{DriverCode, DriverError, Error, Result};

use crate::dialect::Dialect;
use crate::handle::{Row, SqlValue, StorageHandle};

struct FailureRule {
    pattern: String,
    error: DriverError,
    remaining: Option<usize>,
}

#[derive(Default)]
struct State {
    statements: Vec<String>,
    queries: Vec<String>,
    failures: Vec<FailureRule>,
    responses: Vec<(String, Vec<Row>)>,
    tables: BTreeSet<String>,
    indexes: BTreeMap<String, BTreeSet<String>>,
    columns: BTreeMap<String, BTreeSet<String>>,
    ledger: Vec<u32>,
    savepoints: Vec<String>,
    implicit_commits: usize,
    last_rows: HashMap<String, HashMap<String, SqlValue>>,
}

pub(crate) struct FakeHandle {
    dialect: Dialect,
    state: RefCell<State>,
    in_transaction: Cell<bool>,
    savepoint_depth: Cell<u32>,
    engine_version: OnceCell<String>,
    narrow_text: Cell<bool>,
    narrow_numeric: Cell<bool>,
    low_time_precision: Cell<bool>,
}

impl FakeHandle {
    pub(crate) fn new(dialect: Dialect) -> Self {
        Self {
            dialect,
            state: RefCell::new(State::default()),
            in_transaction: Cell::new(false),
            savepoint_depth: Cell::new(0),
            engine_version: OnceCell::new(),
            narrow_text: Cell::new(false),
            narrow_numeric: Cell::new(false),
            low_time_precision: Cell::new(false),
        }
    }

    pub(crate) fn statements(&self) -> Vec<String> {
        self.state.borrow().statements.clone()
    }

    /// DDL statements that ended an open MySQL transaction.
    pub(crate) fn implicit_commits(&self) -> usize {
        self.state.borrow().implicit_commits
    }

    pub(crate) fn queries(&self) -> Vec<String> {
        self.state.borrow().queries.clone()
    }

    /// Fail every statement containing `pattern`.
    pub(crate) fn fail_on(&self, pattern: &str, error: DriverError) {
        self.push_failure(pattern, error, None);
    }

    /// Fail the next `times` statements containing `pattern`.
    pub(crate) fn fail_times(&self, pattern: &str, error: DriverError, times: usize) {
        self.push_failure(pattern, error, Some(times));
    }

    fn push_failure(&self, pattern: &str, error: DriverError, remaining: Option<usize>) {
        self.state.borrow_mut().failures.push(FailureRule {
            pattern: pattern.to_string(),
            error,
            remaining,
        });
    }

    /// Answer queries containing `pattern` with `rows`.
    pub(crate) fn respond(&self, pattern: &str, rows: Vec<Row>) {
        self.state
            .borrow_mut()
            .responses
            .push((pattern.to_string(), rows));
    }

    pub(crate) fn add_table(&self, table: &str) {
        self.state.borrow_mut().tables.insert(table.to_string());
    }

    pub(crate) fn add_index(&self, table: &str, name: &str) {
        let mut state = self.state.borrow_mut();
        state.tables.insert(table.to_string());
        state
            .indexes
            .entry(table.to_string())
            .or_default()
            .insert(name.to_string());
    }

    pub(crate) fn indexes(&self, table: &str) -> Vec<String> {
        self.state
            .borrow()
            .indexes
            .get(table)
            .map(|names| names.iter().cloned().collect())
            .unwrap_or_default()
    }

    pub(crate) fn add_column(&self, table: &str, column: &str) {
        self.state
            .borrow_mut()
            .columns
            .entry(table.to_string())
            .or_default()
            .insert(column.to_string());
    }

    pub(crate) fn has_column(&self, table: &str, column: &str) -> bool {
        self.state
            .borrow()
            .columns
            .get(table)
            .is_some_and(|columns| columns.contains(column))
    }

    /// Seed a ledger row.
    pub(crate) fn record(&self, version: u32) {
        let mut state = self.state.borrow_mut();
        state.tables.insert("schema_changes".to_string());
        state.ledger.push(version);
    }

    pub(crate) fn ledger(&self) -> Vec<u32> {
        self.state.borrow().ledger.clone()
    }

    /// Report `version` from [`StorageHandle::engine_version`]; set once.
    pub(crate) fn set_engine_version(&self, version: &str) {
        let _ = self.engine_version.set(version.to_string());
    }

    pub(crate) fn set_narrow_text(&self, value: bool) {
        self.narrow_text.set(value);
    }

    pub(crate) fn set_narrow_numeric(&self, value: bool) {
        self.narrow_numeric.set(value);
    }

    pub(crate) fn set_low_time_precision(&self, value: bool) {
        self.low_time_precision.set(value);
    }

    fn check_failures(&self, sql: &str) -> Result<()> {
        let mut state = self.state.borrow_mut();
        let rule = state.failures.iter_mut().find(|rule| {
            sql.contains(&rule.pattern) && rule.remaining.is_none_or(|left| left > 0)
        });
        if let Some(rule) = rule {
            if let Some(left) = rule.remaining.as_mut() {
                *left -= 1;
            }
            return Err(Error::Driver(rule.error.clone()));
        }
        Ok(())
    }

    fn error(&self, mysql: i32, sqlstate: &str, message: String) -> Error {
        let code = match self.dialect {
            Dialect::MySql => DriverCode::Numeric(mysql),
            Dialect::Postgres => DriverCode::SqlState(sqlstate.to_string()),
            Dialect::Sqlite => DriverCode::Numeric(1),
        };
        Error::Driver(DriverError::new(Some(code), message))
    }

    fn duplicate_table(&self, name: &str) -> Error {
        let message = match self.dialect {
            Dialect::MySql => format!("Table '{name}' already exists"),
            Dialect::Postgres => format!("relation \"{name}\" already exists"),
            Dialect::Sqlite => format!("table {name} already exists"),
        };
        self.error(1050, "42P07", message)
    }

    fn duplicate_index(&self, name: &str) -> Error {
        let message = match self.dialect {
            Dialect::MySql => format!("Duplicate key name '{name}'"),
            Dialect::Postgres => format!("relation \"{name}\" already exists"),
            Dialect::Sqlite => format!("index {name} already exists"),
        };
        self.error(1061, "42P07", message)
    }

    fn duplicate_column(&self, table: &str, name: &str) -> Error {
        let message = match self.dialect {
            Dialect::MySql => format!("Duplicate column name '{name}'"),
            Dialect::Postgres => {
                format!("column \"{name}\" of relation \"{table}\" already exists")
            }
            Dialect::Sqlite => format!("duplicate column name: {name}"),
        };
        self.error(1060, "42701", message)
    }

    fn missing_index(&self, name: &str) -> Error {
        let message = match self.dialect {
            Dialect::MySql => format!("Can't DROP '{name}'; check that column/key exists"),
            Dialect::Postgres => format!("index \"{name}\" does not exist"),
            Dialect::Sqlite => format!("no such index: {name}"),
        };
        self.error(1091, "42704", message)
    }

    fn apply(&self, sql: &str, params: &[SqlValue]) -> Result<usize> {
        match sql {
            "BEGIN" | "BEGIN IMMEDIATE" | "START TRANSACTION" => {
                self.in_transaction.set(true);
                return Ok(0);
            }
            "COMMIT" | "ROLLBACK" => {
                self.end_transaction();
                return Ok(0);
            }
            _ => {}
        }

        if let Some(name) = sql.strip_prefix("SAVEPOINT ") {
            self.state.borrow_mut().savepoints.push(name.to_string());
            return Ok(0);
        }
        if let Some(name) = sql.strip_prefix("RELEASE SAVEPOINT ") {
            let position = self.savepoint_position(name)?;
            self.state.borrow_mut().savepoints.truncate(position);
            return Ok(0);
        }
        if let Some(name) = sql.strip_prefix("ROLLBACK TO SAVEPOINT ") {
            let position = self.savepoint_position(name)?;
            self.state.borrow_mut().savepoints.truncate(position + 1);
            return Ok(0);
        }
        if let Some(rest) = sql.strip_prefix("CREATE TABLE ") {
            return self.create_table(first_word(rest));
        }
        if let Some(rest) = sql.strip_prefix("CREATE INDEX ") {
            return self.create_index(rest);
        }
        if let Some(rest) = sql.strip_prefix("DROP INDEX ") {
            return self.drop_index(rest);
        }
        if let Some(rest) = sql.strip_prefix("ALTER TABLE ") {
            return self.alter_table(rest);
        }
        if sql.starts_with("INSERT INTO schema_changes") {
            let version = params
                .first()
                .and_then(SqlValue::as_i64)
                .and_then(|v| u32::try_from(v).ok())
                .ok_or_else(|| Error::Database("ledger insert without version".to_string()))?;
            self.state.borrow_mut().ledger.push(version);
            return Ok(1);
        }
        if let Some(rest) = sql.strip_prefix("INSERT INTO ") {
            self.store_row(rest, params);
            return Ok(1);
        }
        Ok(0)
    }

    fn end_transaction(&self) {
        self.in_transaction.set(false);
        self.state.borrow_mut().savepoints.clear();
    }

    fn savepoint_position(&self, name: &str) -> Result<usize> {
        self.state
            .borrow()
            .savepoints
            .iter()
            .position(|existing| existing == name)
            .ok_or_else(|| self.error(1305, "3B001", format!("SAVEPOINT {name} does not exist")))
    }

    fn create_table(&self, name: &str) -> Result<usize> {
        let mut state = self.state.borrow_mut();
        if !state.tables.insert(name.to_string()) {
            return Err(self.duplicate_table(name));
        }
        Ok(0)
    }

    fn create_index(&self, rest: &str) -> Result<usize> {
        // `{name} ON {table} ({columns})`
        let mut words = rest.split_whitespace();
        let name = words.next().unwrap_or_default();
        let table = words.nth(1).unwrap_or_default();

        let mut state = self.state.borrow_mut();
        if state.indexes.values().any(|names| names.contains(name)) {
            return Err(self.duplicate_index(name));
        }
        state
            .indexes
            .entry(table.to_string())
            .or_default()
            .insert(name.to_string());
        Ok(0)
    }

    fn drop_index(&self, rest: &str) -> Result<usize> {
        let (table, name) = match rest.split_once(" ON ") {
            Some((name, table)) => (Some(table.trim()), name.trim()),
            None => match rest.split_once('.') {
                Some((table, name)) => (Some(table), name),
                None => (None, rest.trim()),
            },
        };

        let mut state = self.state.borrow_mut();
        let removed = state
            .indexes
            .iter_mut()
            .filter(|(owner, _)| table.is_none_or(|t| t == owner.as_str()))
            .any(|(_, names)| names.remove(name));
        if !removed {
            return Err(self.missing_index(name));
        }
        Ok(0)
    }

    fn alter_table(&self, rest: &str) -> Result<usize> {
        let (table, clauses) = rest.split_once(' ').unwrap_or((rest, ""));

        if clauses.contains("CONVERT TO CHARACTER SET utf8mb4") {
            self.narrow_text.set(false);
        }
        if clauses.contains("DOUBLE PRECISION") {
            self.narrow_numeric.set(false);
        }
        if clauses.contains("DATETIME(6)") || clauses.contains("TIMESTAMP(6)") {
            self.low_time_precision.set(false);
        }

        let added: Vec<&str> = clauses
            .split(", ")
            .filter_map(|clause| clause.strip_prefix("ADD "))
            .map(first_word)
            .collect();
        if added.is_empty() {
            return Ok(0);
        }

        let mut state = self.state.borrow_mut();
        let columns = state.columns.entry(table.to_string()).or_default();
        if let Some(existing) = added.iter().find(|column| columns.contains(**column)) {
            return Err(self.duplicate_column(table, existing));
        }
        columns.extend(added.iter().map(|column| column.to_string()));
        Ok(0)
    }

    /// Keep the inserted row, degraded the way a defective column would.
    fn store_row(&self, rest: &str, params: &[SqlValue]) {
        // `{table} ({columns}) VALUES (...)`
        let table = first_word(rest);
        let columns: Vec<&str> = rest
            .split_once('(')
            .and_then(|(_, tail)| tail.split_once(')'))
            .map(|(list, _)| list.split(',').map(str::trim).collect())
            .unwrap_or_default();

        let row = columns
            .iter()
            .zip(params)
            .map(|(column, value)| (column.to_string(), self.degrade(column, value)))
            .collect();
        self.state
            .borrow_mut()
            .last_rows
            .insert(table.to_string(), row);
    }

    fn degrade(&self, column: &str, value: &SqlValue) -> SqlValue {
        match value {
            SqlValue::Text(text) if column == "created" && self.low_time_precision.get() => {
                SqlValue::Text(text.split('.').next().unwrap_or_default().to_string())
            }
            SqlValue::Text(text) if self.narrow_text.get() => SqlValue::Text(
                text.chars()
                    .map(|c| if c.len_utf8() == 4 { '?' } else { c })
                    .collect(),
            ),
            SqlValue::Real(v) if self.narrow_numeric.get() => SqlValue::Real(f64::from(*v as f32)),
            other => other.clone(),
        }
    }

    fn answer(&self, sql: &str) -> Vec<Row> {
        let state = self.state.borrow();
        if let Some((_, rows)) = state
            .responses
            .iter()
            .find(|(pattern, _)| sql.contains(pattern.as_str()))
        {
            return rows.clone();
        }

        if sql.contains("FROM schema_changes") {
            let versions = state.ledger.iter().map(|v| vec![SqlValue::Integer(i64::from(*v))]);
            if sql.contains("LIMIT 1") {
                return versions.last().into_iter().collect();
            }
            return versions.collect();
        }

        // `SELECT {columns} FROM {table} ...` against the last inserted row.
        let Some((columns, tail)) = sql
            .strip_prefix("SELECT ")
            .and_then(|rest| rest.split_once(" FROM "))
        else {
            return Vec::new();
        };
        let Some(row) = state.last_rows.get(first_word(tail)) else {
            return Vec::new();
        };
        vec![
            columns
                .split(',')
                .map(|column| row.get(column.trim()).cloned().unwrap_or(SqlValue::Null))
                .collect(),
        ]
    }
}

fn is_ddl(sql: &str) -> bool {
    ["CREATE ", "ALTER ", "DROP "]
        .iter()
        .any(|prefix| sql.starts_with(prefix))
}

fn first_word(text: &str) -> &str {
    text.split_whitespace()
        .next()
        .unwrap_or_default()
        .trim_matches(|c| c == '`' || c == '"')
}

impl StorageHandle for FakeHandle {
    fn dialect(&self) -> Dialect {
        self.dialect
    }

    fn engine_version(&self) -> Option<&str> {
        self.engine_version.get().map(String::as_str)
    }

    fn execute(&self, sql: &str, params: &[SqlValue]) -> Result<usize> {
        self.state.borrow_mut().statements.push(sql.to_string());
        if self.dialect == Dialect::MySql && is_ddl(sql) && self.in_transaction.get() {
            self.state.borrow_mut().implicit_commits += 1;
            self.end_transaction();
        }
        self.check_failures(sql)?;
        self.apply(sql, params)
    }

    fn query(&self, sql: &str, _params: &[SqlValue]) -> Result<Vec<Row>> {
        self.state.borrow_mut().queries.push(sql.to_string());
        self.check_failures(sql)?;
        Ok(self.answer(sql))
    }

    fn in_transaction(&self) -> bool {
        self.in_transaction.get()
    }

    fn savepoint_depth(&self) -> &Cell<u32> {
        &self.savepoint_depth
    }

    fn table_exists(&self, table: &str) -> Result<bool> {
        Ok(self.state.borrow().tables.contains(table))
    }

    fn list_indexes(&self, table: &str) -> Result<Vec<String>> {
        Ok(self.indexes(table))
    }
}
