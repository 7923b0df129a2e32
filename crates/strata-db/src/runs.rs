//! Recorder run bookkeeping: one row per ingestion session.

use chrono::{DateTime, NaiveDateTime, Utc};
use serde::Serialize;
use strata_common::{Error, Result};
use tracing::{info, warn};

use crate::handle::{DATETIME_FORMAT, SqlValue, StorageHandle, session_scope};

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RecorderRun {
    pub run_id: i64,
    pub start: NaiveDateTime,
    pub end: Option<NaiveDateTime>,
    pub closed_incorrect: bool,
}

/// Open a new run starting at `now` and return its id.
pub fn start_run(handle: &dyn StorageHandle, now: DateTime<Utc>) -> Result<i64> {
    session_scope(handle, |h| {
        h.execute(
            "INSERT INTO recorder_runs (start, closed_incorrect, created) VALUES (?, FALSE, ?)",
            &[SqlValue::datetime(now), SqlValue::datetime(Utc::now())],
        )?;
        let row = h.query_one("SELECT MAX(run_id) FROM recorder_runs", &[])?;
        let run_id = row
            .and_then(|row| row.first().and_then(SqlValue::as_i64))
            .ok_or_else(|| Error::Database("recorder run was not created".to_string()))?;
        info!("started recorder run {run_id}");
        Ok(run_id)
    })
}

pub fn end_run(handle: &dyn StorageHandle, run_id: i64, now: DateTime<Utc>) -> Result<()> {
    let end = handle.dialect().quote_ident("end");
    let updated = session_scope(handle, |h| {
        h.execute(
            &format!("UPDATE recorder_runs SET {end} = ? WHERE run_id = ?"),
            &[SqlValue::datetime(now), SqlValue::Integer(run_id)],
        )
    })?;
    if updated == 0 {
        return Err(Error::Database(format!("no recorder run with id {run_id}")));
    }
    Ok(())
}

/// Close runs left open by an unclean shutdown and flag them.
pub fn end_incomplete_runs(handle: &dyn StorageHandle, now: DateTime<Utc>) -> Result<usize> {
    let end = handle.dialect().quote_ident("end");
    let closed = session_scope(handle, |h| {
        h.execute(
            &format!(
                "UPDATE recorder_runs SET {end} = ?, closed_incorrect = TRUE WHERE {end} IS NULL"
            ),
            &[SqlValue::datetime(now)],
        )
    })?;
    if closed > 0 {
        warn!("closed {closed} recorder runs left open by an unclean shutdown");
    }
    Ok(closed)
}

/// The most recently started run that has not ended.
pub fn active_run(handle: &dyn StorageHandle) -> Result<Option<RecorderRun>> {
    let end = handle.dialect().quote_ident("end");
    let row = handle.query_one(
        &format!(
            "SELECT run_id, start, {end}, closed_incorrect FROM recorder_runs WHERE {end} IS NULL ORDER BY start DESC, run_id DESC LIMIT 1"
        ),
        &[],
    )?;
    row.map(|row| run_from_row(&row)).transpose()
}

fn run_from_row(row: &[SqlValue]) -> Result<RecorderRun> {
    let [run_id, start, end, closed_incorrect] = row else {
        return Err(Error::Database(format!(
            "expected 4 recorder run columns, got {}",
            row.len()
        )));
    };

    Ok(RecorderRun {
        run_id: run_id
            .as_i64()
            .ok_or_else(|| Error::Database(format!("invalid run id: {run_id:?}")))?,
        start: parse_datetime(start)?,
        end: if end.is_null() {
            None
        } else {
            Some(parse_datetime(end)?)
        },
        closed_incorrect: closed_incorrect.as_i64().unwrap_or(0) != 0,
    })
}

fn parse_datetime(value: &SqlValue) -> Result<NaiveDateTime> {
    let raw = value
        .as_str()
        .ok_or_else(|| Error::Database(format!("expected datetime text, got {value:?}")))?;
    NaiveDateTime::parse_from_str(raw, DATETIME_FORMAT)
        .map_err(|e| Error::Database(format!("invalid datetime `{raw}`: {e}")))
}
