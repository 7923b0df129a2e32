//! Persisted schema version ledger.

use std::collections::BTreeSet;

use chrono::Utc;
use strata_common::Result;
use tracing::{debug, info};

use crate::ddl;
use crate::handle::{SqlValue, StorageHandle};
use crate::schema::{ColumnDef, ColumnType};

pub const LEDGER_TABLE: &str = "schema_changes";

/// Index introduced by the first migration step; its presence on a database
/// without a ledger means that step already ran.
const VERSION_ONE_INDEX: &str = "ix_events_time_fired";

const LEDGER_COLUMNS: &[ColumnDef] = &[
    ColumnDef::new("change_id", ColumnType::PrimaryKey),
    ColumnDef::new("schema_version", ColumnType::Integer),
    ColumnDef::new("changed", ColumnType::DateTime),
];

/// Version of the live schema, or `None` for an empty database.
///
/// Falls back to inspecting the `events` indexes when the ledger has no rows.
pub fn current_version(handle: &dyn StorageHandle) -> Result<Option<u32>> {
    if let Some(version) = latest_recorded(handle)? {
        return Ok(Some(version));
    }

    if !handle.table_exists("events")? {
        debug!("no recorder tables found, database is new");
        return Ok(None);
    }

    let suffix = format!("_{VERSION_ONE_INDEX}");
    let has_v1_index = handle
        .list_indexes("events")?
        .iter()
        .any(|name| name == VERSION_ONE_INDEX || name.ends_with(&suffix));
    let version = u32::from(has_v1_index);
    info!("schema ledger is empty, inferred schema version {version} from live indexes");
    Ok(Some(version))
}

/// Latest version in the ledger, if it has any rows.
pub fn latest_recorded(handle: &dyn StorageHandle) -> Result<Option<u32>> {
    if !handle.table_exists(LEDGER_TABLE)? {
        return Ok(None);
    }
    let row = handle.query_one(
        "SELECT schema_version FROM schema_changes ORDER BY change_id DESC LIMIT 1",
        &[],
    )?;
    Ok(row
        .and_then(|row| row.into_iter().next())
        .and_then(|value| value.as_i64())
        .and_then(|version| u32::try_from(version).ok()))
}

pub fn recorded_versions(handle: &dyn StorageHandle) -> Result<BTreeSet<u32>> {
    if !handle.table_exists(LEDGER_TABLE)? {
        return Ok(BTreeSet::new());
    }
    let rows = handle.query("SELECT schema_version FROM schema_changes", &[])?;
    Ok(rows
        .iter()
        .filter_map(|row| row.first())
        .filter_map(SqlValue::as_i64)
        .filter_map(|version| u32::try_from(version).ok())
        .collect())
}

/// Create the ledger table if it is missing.
///
/// Without transactional DDL, call this before opening the transaction that
/// records a version: the `CREATE TABLE` would commit it early.
pub fn ensure_ledger(handle: &dyn StorageHandle) -> Result<()> {
    if !handle.table_exists(LEDGER_TABLE)? {
        ddl::create_table(handle, LEDGER_TABLE, LEDGER_COLUMNS)?;
    }
    Ok(())
}

/// Append `version` to the ledger, creating it on first use.
///
/// Versions not above the latest recorded one are skipped.
pub fn record_version(handle: &dyn StorageHandle, version: u32) -> Result<()> {
    ensure_ledger(handle)?;

    if let Some(latest) = latest_recorded(handle)? {
        if version <= latest {
            debug!("schema version {version} not above recorded {latest}, skipping");
            return Ok(());
        }
    }

    handle.execute(
        "INSERT INTO schema_changes (schema_version, changed) VALUES (?, ?)",
        &[SqlValue::Integer(i64::from(version)), SqlValue::datetime(Utc::now())],
    )?;
    debug!("recorded schema version {version}");
    Ok(())
}
