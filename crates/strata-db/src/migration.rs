//! Ordered schema migration steps and the runner that applies them.

use std::cell::Cell;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::thread;
use std::time::Duration;

use chrono::Utc;
use serde::Serialize;
use strata_common::{Error, Result};
use tracing::{debug, error, info, warn};

use crate::ddl;
use crate::dialect::{Dialect, ErrorClass};
use crate::handle::{StorageHandle, session_scope};
use crate::schema::ColumnType::*;
use crate::schema::{ColumnDef, IndexDef};
use crate::version;

pub const DEFAULT_RETRY_WAIT: Duration = Duration::from_secs(3);
pub const DEFAULT_MAX_STEP_ATTEMPTS: u32 = 10;

const ALL_DIALECTS: &[Dialect] = &[Dialect::Sqlite, Dialect::MySql, Dialect::Postgres];
const MYSQL_ONLY: &[Dialect] = &[Dialect::MySql];
const MYSQL_AND_POSTGRES: &[Dialect] = &[Dialect::MySql, Dialect::Postgres];

/// One structural change within a migration step.
#[derive(Debug, Clone, Copy)]
pub enum Change {
    CreateTable {
        table: &'static str,
        columns: &'static [ColumnDef],
    },
    CreateIndex(IndexDef),
    DropIndex {
        table: &'static str,
        name: &'static str,
    },
    AddColumns {
        table: &'static str,
        columns: &'static [ColumnDef],
    },
    /// Only applied on the listed dialects.
    ModifyColumns {
        table: &'static str,
        columns: &'static [ColumnDef],
        dialects: &'static [Dialect],
    },
    ConvertCharset {
        table: &'static str,
    },
    /// Data statements rendered for the running dialect.
    Statement {
        description: &'static str,
        render: fn(Dialect) -> Vec<String>,
    },
}

impl Change {
    pub fn apply(&self, handle: &dyn StorageHandle) -> Result<()> {
        match self {
            Self::CreateTable { table, columns } => ddl::create_table(handle, table, columns),
            Self::CreateIndex(index) => ddl::create_index(handle, index),
            Self::DropIndex { table, name } => ddl::drop_index(handle, table, name),
            Self::AddColumns { table, columns } => ddl::add_columns(handle, table, columns),
            Self::ModifyColumns {
                table,
                columns,
                dialects,
            } => {
                if dialects.contains(&handle.dialect()) {
                    ddl::modify_columns(handle, table, columns)
                } else {
                    Ok(())
                }
            }
            Self::ConvertCharset { table } => ddl::convert_charset(handle, table),
            Self::Statement {
                description,
                render,
            } => {
                info!("{description}");
                for sql in render(handle.dialect()) {
                    let rows = handle.execute(&sql, &[])?;
                    debug!("{rows} rows affected by `{sql}`");
                }
                Ok(())
            }
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub struct MigrationStep {
    pub version: u32,
    pub description: &'static str,
    pub changes: &'static [Change],
}

pub const STEPS: &[MigrationStep] = &[
    MigrationStep {
        version: 1,
        description: "index events by time fired",
        changes: &[Change::CreateIndex(IndexDef::new(
            "ix_events_time_fired",
            "events",
            &["time_fired"],
        ))],
    },
    MigrationStep {
        version: 2,
        description: "index recorder runs by start and end",
        changes: &[Change::CreateIndex(IndexDef::new(
            "ix_recorder_runs_start_end",
            "recorder_runs",
            &["start", "end"],
        ))],
    },
    MigrationStep {
        version: 3,
        description: "index states by event",
        changes: &[Change::CreateIndex(IndexDef::new(
            "ix_states_event_id",
            "states",
            &["event_id"],
        ))],
    },
    MigrationStep {
        version: 4,
        description: "add context columns",
        changes: &[
            Change::AddColumns {
                table: "events",
                columns: &[
                    ColumnDef::new("context_id", Varchar(36)),
                    ColumnDef::new("context_user_id", Varchar(36)),
                ],
            },
            Change::CreateIndex(IndexDef::new("ix_events_context_id", "events", &["context_id"])),
            Change::AddColumns {
                table: "states",
                columns: &[
                    ColumnDef::new("context_id", Varchar(36)),
                    ColumnDef::new("context_user_id", Varchar(36)),
                ],
            },
            Change::CreateIndex(IndexDef::new("ix_states_context_id", "states", &["context_id"])),
        ],
    },
    MigrationStep {
        version: 5,
        description: "link states to their previous state",
        changes: &[
            Change::AddColumns {
                table: "states",
                columns: &[
                    ColumnDef::new("old_state_id", Integer).references("states", "state_id"),
                ],
            },
            Change::CreateIndex(IndexDef::new(
                "ix_states_old_state_id",
                "states",
                &["old_state_id"],
            )),
        ],
    },
    MigrationStep {
        version: 6,
        description: "widen event type and payload columns",
        changes: &[
            Change::ModifyColumns {
                table: "events",
                columns: &[ColumnDef::new("event_type", Varchar(64))],
                dialects: ALL_DIALECTS,
            },
            Change::ModifyColumns {
                table: "events",
                columns: &[ColumnDef::new("event_data", LongText)],
                dialects: MYSQL_ONLY,
            },
            Change::ModifyColumns {
                table: "states",
                columns: &[ColumnDef::new("attributes", LongText)],
                dialects: MYSQL_ONLY,
            },
        ],
    },
    MigrationStep {
        version: 7,
        description: "store datetimes with microsecond precision",
        changes: &[
            Change::ModifyColumns {
                table: "events",
                columns: &[
                    ColumnDef::new("time_fired", DateTime),
                    ColumnDef::new("created", DateTime),
                ],
                dialects: MYSQL_AND_POSTGRES,
            },
            Change::ModifyColumns {
                table: "states",
                columns: &[
                    ColumnDef::new("last_changed", DateTime),
                    ColumnDef::new("last_updated", DateTime),
                    ColumnDef::new("created", DateTime),
                ],
                dialects: MYSQL_AND_POSTGRES,
            },
            Change::ModifyColumns {
                table: "recorder_runs",
                columns: &[
                    ColumnDef::new("start", DateTime),
                    ColumnDef::new("end", DateTime),
                    ColumnDef::new("created", DateTime),
                ],
                dialects: MYSQL_AND_POSTGRES,
            },
        ],
    },
    MigrationStep {
        version: 8,
        description: "create long-term statistics",
        changes: &[
            Change::CreateTable {
                table: "statistics",
                columns: &[
                    ColumnDef::new("id", PrimaryKey),
                    ColumnDef::new("metadata_id", Integer),
                    ColumnDef::new("created", DateTime),
                    ColumnDef::new("start_ts", Double),
                    ColumnDef::new("mean", Double),
                    ColumnDef::new("min", Double),
                    ColumnDef::new("max", Double),
                    ColumnDef::new("state", Double),
                    ColumnDef::new("sum", Double),
                ],
            },
            Change::CreateIndex(IndexDef::new(
                "ix_statistics_metadata_id_start_ts",
                "statistics",
                &["metadata_id", "start_ts"],
            )),
        ],
    },
    MigrationStep {
        version: 9,
        description: "store 4-byte text on MySQL",
        changes: &[
            Change::ConvertCharset { table: "events" },
            Change::ConvertCharset { table: "states" },
            Change::ConvertCharset { table: "statistics" },
        ],
    },
    MigrationStep {
        version: 10,
        description: "add epoch timestamp columns",
        changes: &[
            Change::AddColumns {
                table: "events",
                columns: &[ColumnDef::new("time_fired_ts", Double)],
            },
            Change::AddColumns {
                table: "states",
                columns: &[
                    ColumnDef::new("last_updated_ts", Double),
                    ColumnDef::new("last_changed_ts", Double),
                ],
            },
            Change::Statement {
                description: "backfilling epoch timestamp columns",
                render: backfill_epoch_columns,
            },
            Change::CreateIndex(IndexDef::new(
                "ix_events_time_fired_ts",
                "events",
                &["time_fired_ts"],
            )),
            Change::CreateIndex(IndexDef::new(
                "ix_states_last_updated_ts",
                "states",
                &["last_updated_ts"],
            )),
            Change::CreateIndex(IndexDef::new(
                "ix_states_entity_id_last_updated_ts",
                "states",
                &["entity_id", "last_updated_ts"],
            )),
            Change::DropIndex {
                table: "events",
                name: "ix_events_time_fired",
            },
            Change::DropIndex {
                table: "states",
                name: "ix_states_entity_id",
            },
        ],
    },
];

const EPOCH_COLUMNS: [(&str, &str, &str); 3] = [
    ("events", "time_fired_ts", "time_fired"),
    ("states", "last_updated_ts", "last_updated"),
    ("states", "last_changed_ts", "last_changed"),
];

fn backfill_epoch_columns(dialect: Dialect) -> Vec<String> {
    EPOCH_COLUMNS
        .iter()
        .map(|(table, target, source)| {
            let seconds = match dialect {
                Dialect::Sqlite => format!("(julianday({source}) - 2440587.5) * 86400.0"),
                Dialect::MySql => {
                    format!("UNIX_TIMESTAMP(CONVERT_TZ({source}, '+00:00', @@session.time_zone))")
                }
                Dialect::Postgres => format!("EXTRACT(EPOCH FROM {source})"),
            };
            format!(
                "UPDATE {table} SET {target} = {seconds} WHERE {target} IS NULL AND {source} IS NOT NULL"
            )
        })
        .collect()
}

/// Progress of the most recent [`Migrator::migrate`] call.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(tag = "state", content = "version", rename_all = "snake_case")]
pub enum MigrationState {
    NotStarted,
    InProgress(u32),
    Completed(u32),
    Failed(u32),
}

/// File that exists while a migration is running.
///
/// A leftover marker means the process died mid-migration; the next run
/// refuses to start until an operator resumes it.
#[derive(Debug, Clone)]
pub struct MigrationMarker {
    path: PathBuf,
}

impl MigrationMarker {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    /// `<database>.migrating` next to the database file.
    pub fn for_database(db_path: &Path) -> Self {
        let mut name = db_path.as_os_str().to_owned();
        name.push(".migrating");
        Self::new(name)
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn exists(&self) -> bool {
        self.path.exists()
    }

    fn create(&self, from: u32, to: u32) -> Result<()> {
        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent)?;
        }
        fs::write(
            &self.path,
            format!("from={from}\nto={to}\nstarted={}\n", Utc::now().to_rfc3339()),
        )?;
        Ok(())
    }

    fn remove(&self) -> Result<()> {
        match fs::remove_file(&self.path) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }
}

/// Applies [`MigrationStep`]s in version order.
pub struct Migrator {
    steps: &'static [MigrationStep],
    marker: Option<MigrationMarker>,
    retry_wait: Duration,
    max_step_attempts: u32,
    state: Cell<MigrationState>,
}

impl Default for Migrator {
    fn default() -> Self {
        Self::new()
    }
}

impl Migrator {
    pub fn new() -> Self {
        Self {
            steps: STEPS,
            marker: None,
            retry_wait: DEFAULT_RETRY_WAIT,
            max_step_attempts: DEFAULT_MAX_STEP_ATTEMPTS,
            state: Cell::new(MigrationState::NotStarted),
        }
    }

    pub fn with_marker(mut self, marker: MigrationMarker) -> Self {
        self.marker = Some(marker);
        self
    }

    /// Wait between attempts of a step that hit lock contention, and the
    /// total number of attempts per step.
    pub fn with_retry(mut self, wait: Duration, max_step_attempts: u32) -> Self {
        self.retry_wait = wait;
        self.max_step_attempts = max_step_attempts.max(1);
        self
    }

    pub fn with_steps(mut self, steps: &'static [MigrationStep]) -> Self {
        self.steps = steps;
        self
    }

    pub fn marker(&self) -> Option<&MigrationMarker> {
        self.marker.as_ref()
    }

    pub fn state(&self) -> MigrationState {
        self.state.get()
    }

    /// Fail with [`Error::MigrationInterrupted`] if a marker was left behind.
    pub fn check_interrupted(&self) -> Result<()> {
        match &self.marker {
            Some(marker) if marker.exists() => {
                Err(Error::MigrationInterrupted(marker.path().to_path_buf()))
            }
            _ => Ok(()),
        }
    }

    /// Bring the schema from `from` to `to`, returning the reached version.
    pub fn migrate(&self, handle: &dyn StorageHandle, from: u32, to: u32) -> Result<u32> {
        if to <= from {
            debug!("schema at version {from}, nothing to migrate");
            return Ok(from);
        }

        let plan = self.plan(from, to)?;
        self.check_interrupted()?;

        let recorded = version::recorded_versions(handle)?;
        let pending: Vec<_> = plan
            .into_iter()
            .filter(|step| !recorded.contains(&step.version))
            .collect();
        if pending.is_empty() {
            info!("schema versions {}..={to} already recorded", from + 1);
            self.state.set(MigrationState::Completed(to));
            return Ok(to);
        }

        if let Some(marker) = &self.marker {
            marker.create(from, to)?;
        }
        warn!(
            "upgrading recorder database schema from version {from} to {to}; do not stop the process"
        );

        for step in pending {
            self.state.set(MigrationState::InProgress(step.version));
            info!(
                "applying schema migration to version {}: {}",
                step.version, step.description
            );
            if let Err(e) = self.apply_with_retry(handle, step) {
                self.state.set(MigrationState::Failed(step.version));
                error!("schema migration to version {} failed: {e}", step.version);
                if handle.dialect().classify(&e) == ErrorClass::Corruption {
                    return Err(match e {
                        Error::Corruption(_) => e,
                        other => Error::Corruption(other.to_string()),
                    });
                }
                return Err(Error::MigrationFailed {
                    version: step.version,
                    source: Box::new(e),
                });
            }
        }

        if let Some(marker) = &self.marker {
            marker.remove()?;
        }
        self.state.set(MigrationState::Completed(to));
        info!("schema migration to version {to} complete");
        Ok(to)
    }

    /// Clear a leftover marker and continue from the last recorded version.
    pub fn resume_interrupted(&self, handle: &dyn StorageHandle, to: u32) -> Result<u32> {
        if let Some(marker) = &self.marker {
            if marker.exists() {
                warn!(
                    "resuming interrupted schema migration, removing {}",
                    marker.path().display()
                );
                marker.remove()?;
            }
        }

        let from = version::current_version(handle)?
            .ok_or_else(|| Error::Database("no recorder schema to resume".to_string()))?;
        self.migrate(handle, from, to)
    }

    fn plan(&self, from: u32, to: u32) -> Result<Vec<&'static MigrationStep>> {
        let steps = self.steps;
        (from + 1..=to)
            .map(|version| {
                steps
                    .iter()
                    .find(|step| step.version == version)
                    .ok_or(Error::NoMigrationStep(version))
            })
            .collect()
    }

    fn apply_with_retry(&self, handle: &dyn StorageHandle, step: &MigrationStep) -> Result<()> {
        let mut attempt = 1;
        loop {
            match apply_step(handle, step) {
                Ok(()) => return Ok(()),
                Err(e)
                    if attempt < self.max_step_attempts
                        && handle.dialect().classify(&e) == ErrorClass::TransientLock =>
                {
                    warn!(
                        "schema migration to version {} hit lock contention (attempt {attempt}), retrying in {:?}: {e}",
                        step.version, self.retry_wait
                    );
                    thread::sleep(self.retry_wait);
                    attempt += 1;
                }
                Err(e) => return Err(e),
            }
        }
    }
}

/// Apply one step and record it in the ledger.
///
/// With transactional DDL the changes and the ledger row commit together.
/// MySQL commits each DDL statement implicitly, so changes run outside any
/// transaction and the ledger row follows once all of them succeeded.
fn apply_step(handle: &dyn StorageHandle, step: &MigrationStep) -> Result<()> {
    if handle.capabilities().transactional_ddl {
        return session_scope(handle, |h| {
            for change in step.changes {
                change.apply(h)?;
            }
            version::record_version(h, step.version)
        });
    }

    for change in step.changes {
        change.apply(handle)?;
    }
    version::ensure_ledger(handle)?;
    session_scope(handle, |h| version::record_version(h, step.version))
}
