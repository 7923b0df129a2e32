//! Batched deletion of expired recorder rows.
//!
//! Each call deletes at most one batch of states and one batch of events, so
//! locks are held briefly. Callers repeat until [`Purger::purge`] returns
//! `true`.

use std::collections::BTreeSet;
use std::thread;
use std::time::Duration;

use chrono::{DateTime, Datelike, Utc, Weekday};
use strata_common::{Error, Result};
use tracing::{debug, info, warn};

use crate::dialect::{Dialect, ErrorClass, RepackCommand};
use crate::handle::{SqlValue, StorageHandle, placeholders, session_scope};

pub const DEFAULT_BATCH_SIZE: usize = 998;
pub const DEFAULT_RETRY_WAIT: Duration = Duration::from_secs(3);

/// Tables compacted by `OPTIMIZE TABLE` on MySQL.
const REPACK_TABLES: &str = "states, events, recorder_runs";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PurgeOptions {
    /// Upper bound on rows deleted per table per call; clamped to the
    /// dialect's bind variable limit.
    pub batch_size: usize,
    /// Sleep after lock contention before reporting the purge incomplete.
    pub retry_wait: Duration,
}

impl Default for PurgeOptions {
    fn default() -> Self {
        Self {
            batch_size: DEFAULT_BATCH_SIZE,
            retry_wait: DEFAULT_RETRY_WAIT,
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct Purger {
    options: PurgeOptions,
}

impl Purger {
    pub fn new(options: PurgeOptions) -> Self {
        Self { options }
    }

    pub fn options(&self) -> PurgeOptions {
        self.options
    }

    /// Delete rows strictly older than `cutoff`.
    ///
    /// Returns `true` once nothing eligible is left, `false` when more
    /// batches remain or lock contention cut the pass short. Storage errors
    /// other than locks and corruption are logged and reported as done so
    /// the next scheduled run retries.
    pub fn purge(
        &self,
        handle: &dyn StorageHandle,
        cutoff: DateTime<Utc>,
        repack: bool,
    ) -> Result<bool> {
        match self.purge_pass(handle, cutoff, repack) {
            Ok(done) => Ok(done),
            Err(e) => match handle.dialect().classify(&e) {
                ErrorClass::TransientLock => {
                    info!(
                        "purge hit lock contention, retrying in {:?}: {e}",
                        self.options.retry_wait
                    );
                    thread::sleep(self.options.retry_wait);
                    Ok(false)
                }
                ErrorClass::Corruption => Err(Error::Corruption(e.to_string())),
                ErrorClass::Other => {
                    warn!("error executing purge: {e}");
                    Ok(true)
                }
            },
        }
    }

    /// [`Purger::purge`] with the cutoff `retention` before now.
    pub fn purge_older_than(
        &self,
        handle: &dyn StorageHandle,
        retention: chrono::Duration,
        repack: bool,
    ) -> Result<bool> {
        self.purge(handle, Utc::now() - retention, repack)
    }

    fn purge_pass(
        &self,
        handle: &dyn StorageHandle,
        cutoff: DateTime<Utc>,
        repack: bool,
    ) -> Result<bool> {
        let batch = self
            .options
            .batch_size
            .min(handle.capabilities().max_bind_vars)
            .max(1);
        let cutoff_ts = SqlValue::timestamp(cutoff);
        debug!("purging rows older than {cutoff} in batches of {batch}");

        let event_ids = select_event_ids(handle, &cutoff_ts, batch)?;
        let state_ids = select_state_ids(handle, &cutoff_ts, &event_ids, batch)?;

        if !state_ids.is_empty() {
            let deleted = session_scope(handle, |h| purge_states(h, &state_ids))?;
            debug!("deleted {deleted} states");
        }
        if !event_ids.is_empty() {
            let deleted = session_scope(handle, |h| purge_events(h, &event_ids))?;
            debug!("deleted {deleted} events");
        }
        if !event_ids.is_empty() || !state_ids.is_empty() {
            return Ok(false);
        }

        let runs = session_scope(handle, |h| purge_recorder_runs(h, cutoff))?;
        debug!("deleted {runs} recorder runs");

        periodic_cleanup(handle)?;
        if repack {
            repack_database(handle)?;
        }
        info!("purge of rows older than {cutoff} complete");
        Ok(true)
    }
}

/// Monthly repack on the second Sunday of the month.
pub fn should_repack(now: DateTime<Utc>, auto_repack: bool) -> bool {
    auto_repack && now.weekday() == Weekday::Sun && (8..=14).contains(&now.day())
}

fn ids(rows: Vec<Vec<SqlValue>>) -> Vec<i64> {
    rows.iter()
        .filter_map(|row| row.first())
        .filter_map(SqlValue::as_i64)
        .collect()
}

fn id_params(ids: &[i64]) -> Vec<SqlValue> {
    ids.iter().copied().map(SqlValue::Integer).collect()
}

fn select_event_ids(
    handle: &dyn StorageHandle,
    cutoff_ts: &SqlValue,
    batch: usize,
) -> Result<Vec<i64>> {
    let rows = handle.query(
        &format!(
            "SELECT event_id FROM events WHERE time_fired_ts < ? ORDER BY time_fired_ts, event_id LIMIT {batch}"
        ),
        std::slice::from_ref(cutoff_ts),
    )?;
    Ok(ids(rows))
}

/// Expired states attached to `event_ids`, topped up with the oldest
/// expired states of any event.
fn select_state_ids(
    handle: &dyn StorageHandle,
    cutoff_ts: &SqlValue,
    event_ids: &[i64],
    batch: usize,
) -> Result<Vec<i64>> {
    let mut selected = BTreeSet::new();

    if !event_ids.is_empty() {
        let mut params = id_params(event_ids);
        params.push(cutoff_ts.clone());
        let rows = handle.query(
            &format!(
                "SELECT state_id FROM states WHERE event_id IN ({}) AND last_updated_ts < ? LIMIT {batch}",
                placeholders(event_ids.len())
            ),
            &params,
        )?;
        selected.extend(ids(rows));
    }

    let remaining = batch.saturating_sub(selected.len());
    if remaining > 0 {
        let rows = handle.query(
            &format!(
                "SELECT state_id FROM states WHERE last_updated_ts < ? ORDER BY last_updated_ts, state_id LIMIT {remaining}"
            ),
            std::slice::from_ref(cutoff_ts),
        )?;
        for id in ids(rows) {
            if selected.len() >= batch {
                break;
            }
            selected.insert(id);
        }
    }

    Ok(selected.into_iter().collect())
}

fn purge_states(handle: &dyn StorageHandle, state_ids: &[i64]) -> Result<usize> {
    let params = id_params(state_ids);
    let list = placeholders(state_ids.len());
    handle.execute(
        &format!("UPDATE states SET old_state_id = NULL WHERE old_state_id IN ({list})"),
        &params,
    )?;
    handle.execute(&format!("DELETE FROM states WHERE state_id IN ({list})"), &params)
}

fn purge_events(handle: &dyn StorageHandle, event_ids: &[i64]) -> Result<usize> {
    let params = id_params(event_ids);
    let list = placeholders(event_ids.len());
    handle.execute(
        &format!("UPDATE states SET event_id = NULL WHERE event_id IN ({list})"),
        &params,
    )?;
    handle.execute(&format!("DELETE FROM events WHERE event_id IN ({list})"), &params)
}

/// Ended runs that started before `cutoff`. The open run has no end and is
/// never selected.
fn purge_recorder_runs(handle: &dyn StorageHandle, cutoff: DateTime<Utc>) -> Result<usize> {
    let end = handle.dialect().quote_ident("end");
    handle.execute(
        &format!("DELETE FROM recorder_runs WHERE start < ? AND {end} IS NOT NULL"),
        &[SqlValue::datetime(cutoff)],
    )
}

fn periodic_cleanup(handle: &dyn StorageHandle) -> Result<()> {
    if handle.dialect() == Dialect::Sqlite {
        debug!("checkpointing write-ahead log");
        handle.execute("PRAGMA wal_checkpoint(TRUNCATE)", &[])?;
    }
    Ok(())
}

fn repack_database(handle: &dyn StorageHandle) -> Result<()> {
    let sql = match handle.capabilities().repack {
        RepackCommand::Vacuum => "VACUUM".to_string(),
        RepackCommand::VacuumFullAnalyze => "VACUUM FULL ANALYZE".to_string(),
        RepackCommand::OptimizeTables => format!("OPTIMIZE TABLE {REPACK_TABLES}"),
    };
    warn!("repacking database with `{sql}`; this can take a long time");
    handle.execute(&sql, &[])?;
    Ok(())
}
