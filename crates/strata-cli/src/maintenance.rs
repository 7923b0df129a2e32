use std::collections::BTreeSet;
use std::path::PathBuf;

use anyhow::{Context, Result, bail};
use chrono::{DateTime, Utc};
use serde::Serialize;
use strata_common::Error;
use strata_config::{ConfigLoader, StrataConfig};
use strata_db::sqlite::move_away_broken_database;
use strata_db::{
    DefectTag, MigrationMarker, Migrator, PurgeOptions, Purger, RecorderRun, SCHEMA_VERSION,
    SchemaDescription, SchemaStatus, SqliteHandle, ValidationReport, prepare_schema, runs,
    should_repack, validation, version,
};
use tracing::{info, warn};

/// Purge passes per command before giving up on a database that stays
/// locked.
pub const MAX_PURGE_PASSES: usize = 10_000;

/// Operator commands against one recorder database.
pub struct Maintenance {
    db_path: PathBuf,
    marker: MigrationMarker,
    config: StrataConfig,
}

#[derive(Debug, Serialize)]
pub struct StatusReport {
    pub database: PathBuf,
    pub exists: bool,
    pub schema_version: Option<u32>,
    pub supported_version: u32,
    pub migration_interrupted: bool,
    pub active_run: Option<RecorderRun>,
    pub keep_days: u32,
    pub auto_purge: bool,
    pub repack_due: bool,
}

impl StatusReport {
    pub fn print_summary(&self) {
        println!("Recorder database: {}", self.database.display());
        if !self.exists {
            println!("  (not created yet - run `strata migrate`)");
            return;
        }
        match self.schema_version {
            Some(v) if v == self.supported_version => println!("  Schema version: {v} (current)"),
            Some(v) => println!(
                "  Schema version: {v} (supported: {})",
                self.supported_version
            ),
            None => println!("  Schema version: none"),
        }
        if self.migration_interrupted {
            println!("  A schema migration was interrupted; run `strata migrate --resume`");
        }
        match &self.active_run {
            Some(run) => println!("  Active run: {} since {}", run.run_id, run.start),
            None => println!("  Active run: none"),
        }
        println!(
            "  Retention: {} days, auto purge {}, repack due: {}",
            self.keep_days,
            if self.auto_purge { "on" } else { "off" },
            if self.repack_due { "yes" } else { "no" }
        );
    }
}

#[derive(Debug, Serialize)]
pub struct MigrateReport {
    pub resumed: bool,
    /// Where a corrupt database was moved before starting over.
    pub quarantined: Option<PathBuf>,
    pub schema: SchemaStatus,
}

impl MigrateReport {
    pub fn print_summary(&self) {
        if let Some(moved) = &self.quarantined {
            println!("Moved corrupt database to {}", moved.display());
        }
        let mode = if self.resumed { " (resumed)" } else { "" };
        match self.schema.start_version {
            None => println!(
                "Created recorder schema at version {}{mode}",
                self.schema.current_version
            ),
            Some(v) if v == self.schema.current_version => {
                println!("Schema already at version {v}{mode}")
            }
            Some(v) => println!(
                "Migrated schema from version {v} to {}{mode}",
                self.schema.current_version
            ),
        }
        print_tags("Repaired", &self.schema.repaired);
        print_tags("Still defective", &self.schema.remaining);
    }
}

#[derive(Debug, Serialize)]
pub struct ValidateReport {
    pub found: ValidationReport,
    pub repaired: BTreeSet<DefectTag>,
    pub remaining: BTreeSet<DefectTag>,
}

impl ValidateReport {
    pub fn print_summary(&self) {
        if self.found.defects.is_empty() && self.found.unconfirmed.is_empty() {
            println!("No schema defects found");
            return;
        }
        print_tags("Defects", &self.found.defects);
        print_tags("Unconfirmed", &self.found.unconfirmed);
        print_tags("Repaired", &self.repaired);
        print_tags("Still defective", &self.remaining);
    }
}

#[derive(Debug, Serialize)]
pub struct PurgeReport {
    pub cutoff: DateTime<Utc>,
    pub passes: usize,
    /// False when the pass limit was reached with rows still pending.
    pub complete: bool,
    pub repacked: bool,
}

impl PurgeReport {
    pub fn print_summary(&self) {
        if !self.complete {
            println!(
                "Purge incomplete after {} passes; rows older than {} remain, run it again",
                self.passes,
                self.cutoff.format("%Y-%m-%d %H:%M:%S")
            );
            return;
        }
        println!(
            "Purged rows older than {} in {} passes{}",
            self.cutoff.format("%Y-%m-%d %H:%M:%S"),
            self.passes,
            if self.repacked { ", repacked" } else { "" }
        );
    }
}

fn is_corruption(err: &anyhow::Error) -> bool {
    matches!(err.downcast_ref::<Error>(), Some(Error::Corruption(_)))
}

fn print_tags(label: &str, tags: &BTreeSet<DefectTag>) {
    if tags.is_empty() {
        return;
    }
    let tags: Vec<_> = tags.iter().map(ToString::to_string).collect();
    println!("  {label}: {}", tags.join(", "));
}

impl Maintenance {
    pub fn new(loader: &ConfigLoader, config: StrataConfig) -> Self {
        let db_path = loader.database_path(&config);
        let marker = config
            .database
            .resolve_marker_path(loader.config_dir())
            .map(MigrationMarker::new)
            .unwrap_or_else(|| MigrationMarker::for_database(&db_path));
        Self {
            db_path,
            marker,
            config,
        }
    }

    fn open(&self) -> Result<SqliteHandle> {
        SqliteHandle::open(&self.db_path)
            .with_context(|| format!("failed to open {}", self.db_path.display()))
    }

    fn migrator(&self) -> Migrator {
        Migrator::new()
            .with_marker(self.marker.clone())
            .with_retry(self.config.retry.wait(), self.config.retry.max_step_attempts)
    }

    fn purger(&self) -> Purger {
        Purger::new(PurgeOptions {
            batch_size: self.config.purge.batch_size,
            retry_wait: self.config.retry.wait(),
        })
    }

    pub fn status(&self) -> Result<StatusReport> {
        let exists = self.db_path.exists();
        let (schema_version, active_run) = if exists {
            let handle = self.open()?;
            let schema_version = version::current_version(&handle)?;
            let active_run = if schema_version.is_some() {
                runs::active_run(&handle)?
            } else {
                None
            };
            (schema_version, active_run)
        } else {
            (None, None)
        };

        Ok(StatusReport {
            database: self.db_path.clone(),
            exists,
            schema_version,
            supported_version: SCHEMA_VERSION,
            migration_interrupted: self.marker.exists(),
            active_run,
            keep_days: self.config.purge.keep_days,
            auto_purge: self.config.purge.auto_purge,
            repack_due: should_repack(Utc::now(), self.config.purge.auto_repack),
        })
    }

    /// Bring the schema up to date. With `quarantine`, a database reported as
    /// corrupt is moved aside and recreated.
    pub fn migrate(&self, resume: bool, quarantine: bool) -> Result<MigrateReport> {
        match self.migrate_in_place(resume) {
            Err(e) if quarantine && is_corruption(&e) => {
                warn!("recorder database is corrupt, starting over: {e}");
                let moved = move_away_broken_database(&self.db_path)?;
                let mut report = self.migrate_in_place(false)?;
                report.quarantined = Some(moved);
                Ok(report)
            }
            other => other,
        }
    }

    fn migrate_in_place(&self, resume: bool) -> Result<MigrateReport> {
        let handle = self.open()?;
        let migrator = self.migrator();

        let resumed = resume && self.marker.exists();
        if resumed {
            if version::current_version(&handle)?.is_none() {
                bail!(
                    "{} holds no recorder schema; remove {} to start over",
                    self.db_path.display(),
                    self.marker.path().display()
                );
            }
            migrator.resume_interrupted(&handle, SCHEMA_VERSION)?;
        }

        let schema = prepare_schema(&handle, &SchemaDescription::current(), &migrator)?;
        Ok(MigrateReport {
            resumed,
            quarantined: None,
            schema,
        })
    }

    pub fn validate(&self, repair: bool) -> Result<ValidateReport> {
        let handle = self.open()?;
        let found = validation::probe(&handle)?;

        let (repaired, remaining) = if repair && !found.defects.is_empty() {
            let repaired = validation::repair(&handle, &found.defects);
            (repaired, validation::validate(&handle)?)
        } else {
            (BTreeSet::new(), found.defects.clone())
        };

        Ok(ValidateReport {
            found,
            repaired,
            remaining,
        })
    }

    pub fn purge(&self, keep_days: Option<u32>, repack: bool) -> Result<PurgeReport> {
        self.purge_bounded(keep_days, repack, MAX_PURGE_PASSES)
    }

    fn purge_bounded(
        &self,
        keep_days: Option<u32>,
        repack: bool,
        max_passes: usize,
    ) -> Result<PurgeReport> {
        let keep_days = keep_days.unwrap_or(self.config.purge.keep_days);
        if keep_days == 0 {
            bail!("retention must be at least one day");
        }

        let handle = self.open()?;
        match version::current_version(&handle)? {
            Some(SCHEMA_VERSION) => {}
            Some(v) => bail!("schema is at version {v}; run `strata migrate` first"),
            None => bail!("no recorder schema found; run `strata migrate` first"),
        }

        let now = Utc::now();
        let cutoff = now - chrono::Duration::days(i64::from(keep_days));
        let repack = repack || should_repack(now, self.config.purge.auto_repack);
        let purger = self.purger();

        let mut passes = 0;
        let mut complete = false;
        while passes < max_passes {
            passes += 1;
            if purger.purge(&handle, cutoff, repack)? {
                complete = true;
                break;
            }
        }
        if complete {
            info!("purge finished after {passes} passes");
        } else {
            warn!("purge still incomplete after {passes} passes, giving up for now");
        }

        Ok(PurgeReport {
            cutoff,
            passes,
            complete,
            repacked: repack && complete,
        })
    }
}
