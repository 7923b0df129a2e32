pub mod ddl;
pub mod dialect;
pub mod handle;
pub mod migration;
pub mod purge;
pub mod runs;
pub mod schema;
pub mod setup;
pub mod sqlite;
pub mod validation;
pub mod version;

#[cfg(test)]
pub(crate) mod testing;

pub use dialect::{Capabilities, Dialect, ErrorClass};
pub use handle::{Row, Scope, SqlValue, StorageHandle, rollback_scope, session_scope};
pub use migration::{MigrationMarker, MigrationState, Migrator};
pub use purge::{PurgeOptions, Purger, should_repack};
pub use runs::RecorderRun;
pub use schema::{SCHEMA_VERSION, SchemaDescription};
pub use setup::{SchemaStatus, prepare_schema};
pub use sqlite::SqliteHandle;
pub use validation::{DefectKind, DefectTag, ValidationReport};
