//! Versioned description of the recorder schema.
//!
//! The description at version `v` is the pre-versioning baseline folded with
//! the structural changes of migration steps `1..=v`, so fresh databases and
//! historical fixtures are built from the same data the migrator applies.

use strata_common::{Error, Result};
use tracing::info;

use crate::ddl;
use crate::dialect::Dialect;
use crate::handle::StorageHandle;
use crate::migration::{Change, MigrationStep, STEPS};

/// Schema version produced by the last migration step.
pub const SCHEMA_VERSION: u32 = 10;

const MYSQL_TABLE_OPTIONS: &str =
    "ENGINE=InnoDB DEFAULT CHARSET=utf8mb4 COLLATE=utf8mb4_unicode_ci";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ColumnType {
    /// Auto-assigned integer primary key.
    PrimaryKey,
    Integer,
    Boolean,
    /// Double precision float.
    Double,
    /// Datetime with microsecond precision where the engine needs it spelled out.
    DateTime,
    /// Datetime at the engine's default precision (seconds on MySQL).
    LegacyDateTime,
    Text,
    /// Unbounded text; only differs from `Text` on MySQL.
    LongText,
    Varchar(u16),
    Char(u16),
}

impl ColumnType {
    pub fn render(self, dialect: Dialect) -> String {
        match (self, dialect) {
            (Self::PrimaryKey, Dialect::Sqlite) => "INTEGER PRIMARY KEY".into(),
            (Self::PrimaryKey, Dialect::MySql) => {
                "INTEGER NOT NULL AUTO_INCREMENT PRIMARY KEY".into()
            }
            (Self::PrimaryKey, Dialect::Postgres) => "SERIAL PRIMARY KEY".into(),
            (Self::Integer, _) => "INTEGER".into(),
            (Self::Boolean, _) => "BOOLEAN".into(),
            (Self::Double, Dialect::Sqlite) => "FLOAT".into(),
            (Self::Double, _) => "DOUBLE PRECISION".into(),
            (Self::DateTime, Dialect::Sqlite) => "DATETIME".into(),
            (Self::DateTime, Dialect::MySql) => "DATETIME(6)".into(),
            (Self::DateTime, Dialect::Postgres) => "TIMESTAMP(6) WITH TIME ZONE".into(),
            (Self::LegacyDateTime, Dialect::Postgres) => "TIMESTAMP WITH TIME ZONE".into(),
            (Self::LegacyDateTime, _) => "DATETIME".into(),
            (Self::Text, _) => "TEXT".into(),
            (Self::LongText, Dialect::MySql) => "LONGTEXT".into(),
            (Self::LongText, _) => "TEXT".into(),
            (Self::Varchar(len), _) => format!("VARCHAR({len})"),
            (Self::Char(len), _) => format!("CHAR({len})"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ColumnDef {
    pub name: &'static str,
    pub ty: ColumnType,
    /// Referenced `(table, column)`.
    pub references: Option<(&'static str, &'static str)>,
}

impl ColumnDef {
    pub const fn new(name: &'static str, ty: ColumnType) -> Self {
        Self {
            name,
            ty,
            references: None,
        }
    }

    pub const fn references(mut self, table: &'static str, column: &'static str) -> Self {
        self.references = Some((table, column));
        self
    }

    /// Column name followed by its type, as used in CREATE and ADD clauses.
    pub fn render(&self, dialect: Dialect) -> String {
        let mut sql = format!("{} {}", dialect.quote_ident(self.name), self.ty.render(dialect));
        if let Some((table, column)) = self.references {
            // InnoDB ignores inline references; MySQL gets table-level constraints instead.
            if dialect != Dialect::MySql {
                sql.push_str(&format!(" REFERENCES {table}({column})"));
            }
        }
        sql
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IndexDef {
    pub name: &'static str,
    pub table: &'static str,
    pub columns: &'static [&'static str],
}

impl IndexDef {
    pub const fn new(
        name: &'static str,
        table: &'static str,
        columns: &'static [&'static str],
    ) -> Self {
        Self {
            name,
            table,
            columns,
        }
    }

    pub fn render(&self, dialect: Dialect) -> String {
        let columns: Vec<_> = self
            .columns
            .iter()
            .map(|column| dialect.quote_ident(column))
            .collect();
        format!(
            "CREATE INDEX {} ON {} ({})",
            self.name,
            self.table,
            columns.join(", ")
        )
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TableDef {
    pub name: &'static str,
    pub columns: Vec<ColumnDef>,
    pub indexes: Vec<IndexDef>,
}

impl TableDef {
    pub fn new(name: &'static str, columns: &[ColumnDef]) -> Self {
        Self {
            name,
            columns: columns.to_vec(),
            indexes: Vec::new(),
        }
    }

    pub fn column(&self, name: &str) -> Option<&ColumnDef> {
        self.columns.iter().find(|column| column.name == name)
    }

    pub fn has_index(&self, name: &str) -> bool {
        self.indexes.iter().any(|index| index.name == name)
    }

    /// Columns of the given type, in declaration order.
    pub fn columns_of(&self, ty: ColumnType) -> Vec<ColumnDef> {
        self.columns.iter().filter(|c| c.ty == ty).copied().collect()
    }
}

/// `CREATE TABLE` statement for `columns` in `dialect`.
pub fn render_create_table(dialect: Dialect, table: &str, columns: &[ColumnDef]) -> String {
    let mut clauses: Vec<String> = columns.iter().map(|c| c.render(dialect)).collect();
    if dialect == Dialect::MySql {
        clauses.extend(columns.iter().filter_map(|c| {
            c.references
                .map(|(target, key)| format!("FOREIGN KEY({}) REFERENCES {target}({key})", c.name))
        }));
    }

    let mut sql = format!("CREATE TABLE {table} ({})", clauses.join(", "));
    if dialect == Dialect::MySql {
        sql.push(' ');
        sql.push_str(MYSQL_TABLE_OPTIONS);
    }
    sql
}

use ColumnType::*;

const EVENTS_V0: &[ColumnDef] = &[
    ColumnDef::new("event_id", PrimaryKey),
    ColumnDef::new("event_type", Varchar(32)),
    ColumnDef::new("event_data", Text),
    ColumnDef::new("origin", Varchar(32)),
    ColumnDef::new("time_fired", LegacyDateTime),
    ColumnDef::new("created", LegacyDateTime),
];

const STATES_V0: &[ColumnDef] = &[
    ColumnDef::new("state_id", PrimaryKey),
    ColumnDef::new("domain", Varchar(64)),
    ColumnDef::new("entity_id", Varchar(255)),
    ColumnDef::new("state", Varchar(255)),
    ColumnDef::new("attributes", Text),
    ColumnDef::new("event_id", Integer).references("events", "event_id"),
    ColumnDef::new("last_changed", LegacyDateTime),
    ColumnDef::new("last_updated", LegacyDateTime),
    ColumnDef::new("created", LegacyDateTime),
];

const RECORDER_RUNS_V0: &[ColumnDef] = &[
    ColumnDef::new("run_id", PrimaryKey),
    ColumnDef::new("start", LegacyDateTime),
    ColumnDef::new("end", LegacyDateTime),
    ColumnDef::new("closed_incorrect", Boolean),
    ColumnDef::new("created", LegacyDateTime),
];

const IX_STATES_ENTITY_ID: IndexDef =
    IndexDef::new("ix_states_entity_id", "states", &["entity_id"]);

/// Ordered set of table definitions at one schema version.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SchemaDescription {
    pub version: u32,
    pub tables: Vec<TableDef>,
}

impl SchemaDescription {
    /// Schema as it existed before versions were recorded.
    pub fn baseline() -> Self {
        let mut states = TableDef::new("states", STATES_V0);
        states.indexes.push(IX_STATES_ENTITY_ID);

        Self {
            version: 0,
            tables: vec![
                TableDef::new("events", EVENTS_V0),
                states,
                TableDef::new("recorder_runs", RECORDER_RUNS_V0),
            ],
        }
    }

    pub fn current() -> Self {
        STEPS.iter().fold(Self::baseline(), Self::apply)
    }

    /// Schema after migration step `version`.
    pub fn at_version(version: u32) -> Result<Self> {
        if version > SCHEMA_VERSION {
            return Err(Error::NoMigrationStep(version));
        }
        Ok(STEPS
            .iter()
            .take_while(|step| step.version <= version)
            .fold(Self::baseline(), Self::apply))
    }

    pub fn table(&self, name: &str) -> Option<&TableDef> {
        self.tables.iter().find(|table| table.name == name)
    }

    fn table_mut(&mut self, name: &str) -> Option<&mut TableDef> {
        self.tables.iter_mut().find(|table| table.name == name)
    }

    fn apply(mut self, step: &MigrationStep) -> Self {
        for change in step.changes {
            match change {
                Change::CreateTable { table, columns } => {
                    if self.table(table).is_none() {
                        self.tables.push(TableDef::new(*table, columns));
                    }
                }
                Change::CreateIndex(index) => {
                    if let Some(table) = self.table_mut(index.table) {
                        if !table.has_index(index.name) {
                            table.indexes.push(*index);
                        }
                    }
                }
                Change::DropIndex { table, name } => {
                    if let Some(table) = self.table_mut(table) {
                        table.indexes.retain(|index| index.name != *name);
                    }
                }
                Change::AddColumns { table, columns } => {
                    if let Some(table) = self.table_mut(table) {
                        for column in *columns {
                            if table.column(column.name).is_none() {
                                table.columns.push(*column);
                            }
                        }
                    }
                }
                Change::ModifyColumns { table, columns, .. } => {
                    if let Some(table) = self.table_mut(table) {
                        for modified in *columns {
                            if let Some(existing) =
                                table.columns.iter_mut().find(|c| c.name == modified.name)
                            {
                                existing.ty = modified.ty;
                            }
                        }
                    }
                }
                Change::ConvertCharset { .. } | Change::Statement { .. } => {}
            }
        }
        self.version = step.version;
        self
    }

    /// Create every table and index of this description.
    pub fn create_all(&self, handle: &dyn StorageHandle) -> Result<()> {
        info!(
            "creating {} dialect schema at version {}",
            handle.dialect(),
            self.version
        );
        for table in &self.tables {
            ddl::create_table(handle, table.name, &table.columns)?;
        }
        for index in self.tables.iter().flat_map(|table| &table.indexes) {
            ddl::create_index(handle, index)?;
        }
        Ok(())
    }
}
