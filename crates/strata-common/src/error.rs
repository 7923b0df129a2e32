use std::fmt;
use std::path::PathBuf;

use thiserror::Error;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Error, Debug)]
pub enum Error {
    #[error("configuration error: {0}")]
    Config(String),

    #[error("database error: {0}")]
    Database(String),

    /// Raw failure reported by the storage driver, with its native code kept
    /// so callers can classify it per dialect.
    #[error("driver error: {0}")]
    Driver(#[from] DriverError),

    #[error("no migration step defined for schema version {0}")]
    NoMigrationStep(u32),

    #[error("migration to schema version {version} failed: {source}")]
    MigrationFailed {
        version: u32,
        #[source]
        source: Box<Error>,
    },

    #[error("a previous schema migration was interrupted (marker at {})", .0.display())]
    MigrationInterrupted(PathBuf),

    #[error("database schema version {found} is newer than the supported version {supported}")]
    SchemaTooNew { found: u32, supported: u32 },

    #[error("{engine} {version} is not supported, {minimum} or newer is required")]
    UnsupportedEngine {
        engine: String,
        version: String,
        minimum: String,
    },

    #[error("database storage is corrupt: {0}")]
    Corruption(String),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("{0}")]
    Other(String),
}

impl Error {
    /// The driver error at the root of this error, if any.
    pub fn driver(&self) -> Option<&DriverError> {
        match self {
            Self::Driver(err) => Some(err),
            Self::MigrationFailed { source, .. } => source.driver(),
            _ => None,
        }
    }
}

/// Error text and native code as reported by a database driver.
#[derive(Error, Debug, Clone, PartialEq)]
#[error("{message}")]
pub struct DriverError {
    pub code: Option<DriverCode>,
    pub message: String,
}

impl DriverError {
    pub fn new(code: Option<DriverCode>, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
        }
    }
}

/// Native error code. SQLite and MySQL report integers, PostgreSQL reports
/// five-character SQLSTATE strings.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DriverCode {
    Numeric(i32),
    SqlState(String),
}

impl fmt::Display for DriverCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Numeric(code) => write!(f, "{code}"),
            Self::SqlState(state) => f.write_str(state),
        }
    }
}
