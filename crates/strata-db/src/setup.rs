use std::collections::BTreeSet;

use serde::Serialize;
use strata_common::{Error, Result};
use tracing::{debug, info, warn};

use crate::handle::{StorageHandle, session_scope};
use crate::migration::Migrator;
use crate::schema::SchemaDescription;
use crate::validation::{self, DefectTag};
use crate::version;

/// Result of [`prepare_schema`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SchemaStatus {
    /// Version found on startup, `None` for a new database.
    pub start_version: Option<u32>,
    pub current_version: u32,
    pub repaired: BTreeSet<DefectTag>,
    /// Defects still reported after repair.
    pub remaining: BTreeSet<DefectTag>,
}

/// Bring a database to `schema.version`, then validate and repair it.
pub fn prepare_schema(
    handle: &dyn StorageHandle,
    schema: &SchemaDescription,
    migrator: &Migrator,
) -> Result<SchemaStatus> {
    handle
        .dialect()
        .check_engine_version(handle.engine_version())?;
    migrator.check_interrupted()?;

    let target = schema.version;
    let start_version = version::current_version(handle)?;
    match start_version {
        None => {
            info!("initializing new recorder database at schema version {target}");
            if handle.capabilities().transactional_ddl {
                session_scope(handle, |h| {
                    schema.create_all(h)?;
                    version::record_version(h, target)
                })?;
            } else {
                schema.create_all(handle)?;
                version::ensure_ledger(handle)?;
                session_scope(handle, |h| version::record_version(h, target))?;
            }
        }
        Some(found) if found > target => {
            return Err(Error::SchemaTooNew {
                found,
                supported: target,
            });
        }
        Some(found) if found < target => {
            migrator.migrate(handle, found, target)?;
        }
        Some(_) => debug!("schema is at version {target}"),
    }

    let defects = validation::validate(handle)?;
    let (repaired, remaining) = if defects.is_empty() {
        (BTreeSet::new(), BTreeSet::new())
    } else {
        let repaired = validation::repair(handle, &defects);
        let remaining = validation::validate(handle)?;
        if !remaining.is_empty() {
            let tags: Vec<_> = remaining.iter().map(ToString::to_string).collect();
            warn!("schema defects remain after repair: {}", tags.join(", "));
        }
        (repaired, remaining)
    };

    Ok(SchemaStatus {
        start_version,
        current_version: target,
        repaired,
        remaining,
    })
}
