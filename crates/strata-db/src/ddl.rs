//! Dialect-aware schema mutations that tolerate being applied twice.
//!
//! With transactional DDL each attempt runs in its own savepoint when a
//! transaction is open, so an absorbed failure leaves the surrounding
//! transaction usable. MySQL commits before every DDL statement and drops
//! all savepoints, so attempts there run bare.

use strata_common::{Error, Result};
use tracing::{debug, info, warn};

use crate::dialect::{Dialect, DropIndexSyntax};
use crate::handle::{Scope, StorageHandle};
use crate::schema::{ColumnDef, IndexDef, render_create_table};

/// Whether a failed statement only reports that its object already exists.
pub fn is_duplicate(err: &Error) -> bool {
    let text = err.to_string().to_lowercase();
    text.contains("already exists") || text.contains("duplicate")
}

fn attempt(handle: &dyn StorageHandle, sql: &str) -> Result<()> {
    if !handle.in_transaction() || !handle.capabilities().transactional_ddl {
        return handle.execute(sql, &[]).map(|_| ());
    }
    let scope = Scope::begin(handle)?;
    handle.execute(sql, &[])?;
    scope.commit()
}

pub fn create_index(handle: &dyn StorageHandle, index: &IndexDef) -> Result<()> {
    warn!(
        "adding index `{}` to table `{}`; this can take several minutes on large databases",
        index.name, index.table
    );
    match attempt(handle, &index.render(handle.dialect())) {
        Ok(()) => debug!("finished creating index `{}`", index.name),
        Err(e) if is_duplicate(&e) => {
            debug!("index `{}` already exists on `{}`, continuing", index.name, index.table)
        }
        Err(e) => return Err(e),
    }
    Ok(())
}

/// Drop `name` from `table` if it is present, trying every `DROP INDEX`
/// spelling. Failure to drop is logged, not returned.
pub fn drop_index(handle: &dyn StorageHandle, table: &str, name: &str) -> Result<()> {
    let suffix = format!("_{name}");
    let live: Vec<String> = handle
        .list_indexes(table)?
        .into_iter()
        .filter(|existing| existing == name || existing.ends_with(&suffix))
        .collect();

    if live.is_empty() {
        debug!("index `{name}` is not present on `{table}`, nothing to drop");
        return Ok(());
    }

    info!("dropping index `{name}` from table `{table}`");
    let preferred = handle.capabilities().drop_index_syntax;
    let mut candidates = vec![preferred.render(table, name)];
    candidates.extend(
        DropIndexSyntax::ALL
            .into_iter()
            .filter(|syntax| *syntax != preferred)
            .map(|syntax| syntax.render(table, name)),
    );
    candidates.extend(
        live.iter()
            .filter(|existing| existing.as_str() != name)
            .map(|existing| preferred.render(table, existing)),
    );

    for sql in &candidates {
        match attempt(handle, sql) {
            Ok(()) => {
                debug!("finished dropping index `{name}` from `{table}`");
                return Ok(());
            }
            Err(e) => debug!("`{sql}` failed: {e}"),
        }
    }

    warn!("failed to drop index `{name}` from table `{table}`; continuing");
    Ok(())
}

pub fn add_columns(handle: &dyn StorageHandle, table: &str, columns: &[ColumnDef]) -> Result<()> {
    let dialect = handle.dialect();
    let names: Vec<_> = columns.iter().map(|c| c.name).collect();
    warn!(
        "adding columns {} to table `{table}`; this can take several minutes on large databases",
        names.join(", ")
    );

    if columns.len() > 1 && handle.capabilities().supports_combined_alter {
        let clauses: Vec<_> = columns
            .iter()
            .map(|column| format!("ADD {}", column.render(dialect)))
            .collect();
        let sql = format!("ALTER TABLE {table} {}", clauses.join(", "));
        match attempt(handle, &sql) {
            Ok(()) => return Ok(()),
            Err(e) => debug!("combined column add on `{table}` failed, adding one by one: {e}"),
        }
    }

    for column in columns {
        let sql = format!("ALTER TABLE {table} ADD {}", column.render(dialect));
        match attempt(handle, &sql) {
            Ok(()) => {}
            Err(e) if is_duplicate(&e) => {
                debug!("column `{}` already exists on `{table}`, continuing", column.name)
            }
            Err(e) => return Err(e),
        }
    }
    Ok(())
}

/// Change column types in place. SQLite has no static column types, so
/// this is a no-op there.
pub fn modify_columns(
    handle: &dyn StorageHandle,
    table: &str,
    columns: &[ColumnDef],
) -> Result<()> {
    let dialect = handle.dialect();
    if !handle.capabilities().static_column_types {
        debug!("{dialect} does not enforce column types, skipping modify on `{table}`");
        return Ok(());
    }

    warn!(
        "modifying columns {} in table `{table}`; this can take several minutes on large databases",
        columns.iter().map(|c| c.name).collect::<Vec<_>>().join(", ")
    );

    let clauses: Vec<String> = columns
        .iter()
        .map(|column| modify_clause(dialect, column))
        .collect();
    if clauses.len() > 1 {
        let sql = format!("ALTER TABLE {table} {}", clauses.join(", "));
        match attempt(handle, &sql) {
            Ok(()) => return Ok(()),
            Err(e) => {
                debug!("combined column modify on `{table}` failed, modifying one by one: {e}")
            }
        }
    }

    for clause in &clauses {
        attempt(handle, &format!("ALTER TABLE {table} {clause}"))?;
    }
    Ok(())
}

fn modify_clause(dialect: Dialect, column: &ColumnDef) -> String {
    let name = dialect.quote_ident(column.name);
    let ty = column.ty.render(dialect);
    match dialect {
        Dialect::Postgres => format!("ALTER COLUMN {name} TYPE {ty}"),
        _ => format!("MODIFY {name} {ty}"),
    }
}

pub fn create_table(handle: &dyn StorageHandle, table: &str, columns: &[ColumnDef]) -> Result<()> {
    let sql = render_create_table(handle.dialect(), table, columns);
    match attempt(handle, &sql) {
        Ok(()) => info!("created table `{table}`"),
        Err(e) if is_duplicate(&e) => debug!("table `{table}` already exists, continuing"),
        Err(e) => return Err(e),
    }
    Ok(())
}

/// Convert a MySQL table to the 4-byte `utf8mb4` character set.
pub fn convert_charset(handle: &dyn StorageHandle, table: &str) -> Result<()> {
    if handle.capabilities().supports_four_byte_text {
        debug!("{} stores 4-byte text natively, skipping `{table}`", handle.dialect());
        return Ok(());
    }
    warn!(
        "converting table `{table}` to utf8mb4; this can take several minutes on large databases"
    );
    attempt(
        handle,
        &format!(
            "ALTER TABLE {table} CONVERT TO CHARACTER SET utf8mb4 COLLATE utf8mb4_unicode_ci, LOCK=EXCLUSIVE"
        ),
    )
}
