//! Closed set of supported SQL dialects and what each one can do.
//!
//! Every operation looks up [`Capabilities`] once through
//! [`Dialect::capabilities`] instead of comparing driver names inline.

use std::borrow::Cow;
use std::fmt;
use std::str::FromStr;

use strata_common::{DriverCode, Error, Result};
use tracing::warn;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Dialect {
    Sqlite,
    MySql,
    Postgres,
}

/// Which `DROP INDEX` spelling an engine accepts.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DropIndexSyntax {
    /// `DROP INDEX name`
    Bare,
    /// `DROP INDEX table.name`
    Qualified,
    /// `DROP INDEX name ON table`
    OnTable,
}

impl DropIndexSyntax {
    pub const ALL: [DropIndexSyntax; 3] = [Self::Bare, Self::Qualified, Self::OnTable];

    pub fn render(self, table: &str, name: &str) -> String {
        match self {
            Self::Bare => format!("DROP INDEX {name}"),
            Self::Qualified => format!("DROP INDEX {table}.{name}"),
            Self::OnTable => format!("DROP INDEX {name} ON {table}"),
        }
    }
}

/// Engine-level space reclamation issued after a purge completes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RepackCommand {
    Vacuum,
    VacuumFullAnalyze,
    OptimizeTables,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Capabilities {
    /// Text columns round-trip 4-byte UTF-8 without any charset configuration.
    pub supports_four_byte_text: bool,
    /// `ALTER TABLE t ADD a .., ADD b ..` is accepted as one statement.
    pub supports_combined_alter: bool,
    /// Column types are enforced, so widening a column is meaningful.
    pub static_column_types: bool,
    /// DDL can run inside an explicit transaction without an implicit commit.
    pub transactional_ddl: bool,
    pub drop_index_syntax: DropIndexSyntax,
    pub begin_statement: &'static str,
    pub repack: RepackCommand,
    /// Largest number of bound parameters a single statement may carry.
    pub max_bind_vars: usize,
}

const SQLITE: Capabilities = Capabilities {
    supports_four_byte_text: true,
    supports_combined_alter: false,
    static_column_types: false,
    transactional_ddl: true,
    drop_index_syntax: DropIndexSyntax::Bare,
    begin_statement: "BEGIN IMMEDIATE",
    repack: RepackCommand::Vacuum,
    max_bind_vars: 998,
};

const MYSQL: Capabilities = Capabilities {
    supports_four_byte_text: false,
    supports_combined_alter: true,
    static_column_types: true,
    transactional_ddl: false,
    drop_index_syntax: DropIndexSyntax::OnTable,
    begin_statement: "START TRANSACTION",
    repack: RepackCommand::OptimizeTables,
    max_bind_vars: 4000,
};

const POSTGRES: Capabilities = Capabilities {
    supports_four_byte_text: true,
    supports_combined_alter: true,
    static_column_types: true,
    transactional_ddl: true,
    drop_index_syntax: DropIndexSyntax::Bare,
    begin_statement: "BEGIN",
    repack: RepackCommand::VacuumFullAnalyze,
    max_bind_vars: 4000,
};

// SQLite 3.32 raised the default host parameter limit from 999 to 32766.
const SQLITE_MODERN_MAX_BIND_VARS: usize = 4000;

// Retryable lock errors, by dialect.
const SQLITE_BUSY: i32 = 5;
const SQLITE_LOCKED: i32 = 6;
const MYSQL_LOCK_ERRORS: [i32; 3] = [
    1205, // lock wait timeout exceeded
    1206, // total number of locks exceeds the lock table size
    1213, // deadlock found when trying to get lock
];
const POSTGRES_LOCK_STATES: [&str; 3] = ["40P01", "55P03", "40001"];

const SQLITE_CORRUPT: i32 = 11;
const SQLITE_NOTADB: i32 = 26;
const MYSQL_CORRUPTION_ERRORS: [i32; 5] = [126, 127, 144, 145, 1034];
const POSTGRES_CORRUPTION_STATES: [&str; 2] = ["XX001", "XX002"];

// Column names in the recorder schema that collide with reserved words.
const RESERVED_IDENTIFIERS: [&str; 1] = ["end"];

/// How an operation should react to a failed statement.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorClass {
    TransientLock,
    Corruption,
    Other,
}

impl Dialect {
    pub fn capabilities(self) -> Capabilities {
        match self {
            Self::Sqlite => SQLITE,
            Self::MySql => MYSQL,
            Self::Postgres => POSTGRES,
        }
    }

    /// Capabilities refined by the engine's reported version string.
    pub fn capabilities_for(self, engine_version: Option<&str>) -> Capabilities {
        let mut caps = self.capabilities();
        if self == Self::Sqlite && engine_version.and_then(parse_version) >= Some((3, 32, 0)) {
            caps.max_bind_vars = SQLITE_MODERN_MAX_BIND_VARS;
        }
        caps
    }

    /// Oldest engine release the schema and its migrations are known to run on.
    pub fn minimum_version(self, engine_version: Option<&str>) -> (u32, u32, u32) {
        match self {
            Self::Sqlite => (3, 31, 0),
            Self::MySql
                if engine_version.is_some_and(|v| v.to_lowercase().contains("mariadb")) =>
            {
                (10, 3, 0)
            }
            Self::MySql => (8, 0, 0),
            Self::Postgres => (12, 0, 0),
        }
    }

    /// Refuse engines older than [`Dialect::minimum_version`]. Versions that
    /// cannot be parsed are let through.
    pub fn check_engine_version(self, engine_version: Option<&str>) -> Result<()> {
        let Some(raw) = engine_version else {
            return Ok(());
        };
        let Some(found) = parse_version(raw) else {
            warn!("could not parse {self} engine version `{raw}`, skipping version check");
            return Ok(());
        };
        let (major, minor, patch) = self.minimum_version(engine_version);
        if found < (major, minor, patch) {
            return Err(Error::UnsupportedEngine {
                engine: self.to_string(),
                version: raw.to_string(),
                minimum: format!("{major}.{minor}.{patch}"),
            });
        }
        Ok(())
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Sqlite => "sqlite",
            Self::MySql => "mysql",
            Self::Postgres => "postgresql",
        }
    }

    /// Quote `name` if it is a reserved word in any supported dialect.
    pub fn quote_ident<'a>(self, name: &'a str) -> Cow<'a, str> {
        if !RESERVED_IDENTIFIERS.contains(&name) {
            return Cow::Borrowed(name);
        }
        match self {
            Self::MySql => Cow::Owned(format!("`{name}`")),
            Self::Sqlite | Self::Postgres => Cow::Owned(format!("\"{name}\"")),
        }
    }

    /// Classify a failed statement. Only driver errors carry native codes;
    /// SQLite corruption is also recognised by its message.
    pub fn classify(self, err: &Error) -> ErrorClass {
        if matches!(err, Error::Corruption(_)) {
            return ErrorClass::Corruption;
        }
        let Some(driver) = err.driver() else {
            return ErrorClass::Other;
        };

        match (self, &driver.code) {
            (Self::Sqlite, Some(DriverCode::Numeric(code))) => match code & 0xff {
                SQLITE_BUSY | SQLITE_LOCKED => ErrorClass::TransientLock,
                SQLITE_CORRUPT | SQLITE_NOTADB => ErrorClass::Corruption,
                _ => ErrorClass::Other,
            },
            (Self::MySql, Some(DriverCode::Numeric(code))) => {
                if MYSQL_LOCK_ERRORS.contains(code) {
                    ErrorClass::TransientLock
                } else if MYSQL_CORRUPTION_ERRORS.contains(code) {
                    ErrorClass::Corruption
                } else {
                    ErrorClass::Other
                }
            }
            (Self::Postgres, Some(DriverCode::SqlState(state))) => {
                if POSTGRES_LOCK_STATES.contains(&state.as_str()) {
                    ErrorClass::TransientLock
                } else if POSTGRES_CORRUPTION_STATES.contains(&state.as_str()) {
                    ErrorClass::Corruption
                } else {
                    ErrorClass::Other
                }
            }
            (Self::Sqlite, _) => {
                let message = driver.message.to_lowercase();
                if message.contains("database disk image is malformed")
                    || message.contains("file is not a database")
                {
                    ErrorClass::Corruption
                } else if message.contains("database is locked") {
                    ErrorClass::TransientLock
                } else {
                    ErrorClass::Other
                }
            }
            _ => ErrorClass::Other,
        }
    }
}

impl fmt::Display for Dialect {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Dialect {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "sqlite" => Ok(Self::Sqlite),
            "mysql" | "mariadb" => Ok(Self::MySql),
            "postgresql" | "postgres" => Ok(Self::Postgres),
            other => Err(Error::Database(format!("unsupported dialect: {other}"))),
        }
    }
}

fn parse_version(raw: &str) -> Option<(u32, u32, u32)> {
    let mut parts = raw
        .trim()
        .split(|c: char| !c.is_ascii_digit())
        .filter(|p| !p.is_empty())
        .map(|p| p.parse::<u32>().ok());
    let major = parts.next()??;
    let minor = parts.next().flatten().unwrap_or(0);
    let patch = parts.next().flatten().unwrap_or(0);
    Some((major, minor, patch))
}
