//! Behavioural schema checks and their repairs.
//!
//! Each probe writes a value chosen to stress one weak point of a column,
//! reads it back and compares. Probe writes are always rolled back.

use std::collections::BTreeSet;
use std::fmt;
use std::str::FromStr;

use chrono::NaiveDateTime;
use serde::{Serialize, Serializer};
use strata_common::{DriverCode, Error, Result};
use tracing::{debug, info, warn};

use crate::ddl;
use crate::dialect::{Dialect, ErrorClass};
use crate::handle::{SqlValue, StorageHandle, rollback_scope};
use crate::schema::{ColumnType, SchemaDescription};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum DefectKind {
    /// Text column cannot store 4-byte UTF-8.
    NarrowText,
    /// Floating point column is single precision.
    NarrowNumeric,
    /// Datetime column drops microseconds.
    LowTimePrecision,
}

impl DefectKind {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::NarrowText => "narrow-text",
            Self::NarrowNumeric => "narrow-numeric",
            Self::LowTimePrecision => "low-time-precision",
        }
    }
}

impl fmt::Display for DefectKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for DefectKind {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "narrow-text" => Ok(Self::NarrowText),
            "narrow-numeric" => Ok(Self::NarrowNumeric),
            "low-time-precision" => Ok(Self::LowTimePrecision),
            other => Err(Error::Other(format!("unknown defect kind: {other}"))),
        }
    }
}

/// `{table}.{kind}`, e.g. `states.narrow-text`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct DefectTag {
    pub table: String,
    pub kind: DefectKind,
}

impl DefectTag {
    pub fn new(table: impl Into<String>, kind: DefectKind) -> Self {
        Self {
            table: table.into(),
            kind,
        }
    }
}

impl fmt::Display for DefectTag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}", self.table, self.kind)
    }
}

impl FromStr for DefectTag {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        let (table, kind) = s
            .rsplit_once('.')
            .ok_or_else(|| Error::Other(format!("malformed defect tag: {s}")))?;
        if table.is_empty() {
            return Err(Error::Other(format!("malformed defect tag: {s}")));
        }
        Ok(Self::new(table, kind.parse()?))
    }
}

impl Serialize for DefectTag {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

/// Outcome of one validation pass.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ValidationReport {
    pub defects: BTreeSet<DefectTag>,
    /// Probes that raised instead of answering.
    pub unconfirmed: BTreeSet<DefectTag>,
}

const PROBE_TEXT: &str = "Protect the 🏠";
const PROBE_ENTITY: &str = "sensor.strata_schema_probe";
// Not representable in single precision.
const PROBE_NUMBER: f64 = 1.000000000000001;
const PROBE_DATETIME: &str = "2020-10-06 12:34:56.123456";
const PROBE_DATETIME_FORMAT: &str = "%Y-%m-%d %H:%M:%S%.f";
const NUMERIC_COLUMNS: [&str; 6] = ["start_ts", "mean", "min", "max", "state", "sum"];

// MySQL "Incorrect string value", raised in strict mode instead of truncating.
const MYSQL_INCORRECT_STRING: i32 = 1366;

struct Probe {
    table: &'static str,
    kind: DefectKind,
    dialects: &'static [Dialect],
    /// Returns `true` when the defect is present.
    run: fn(&dyn StorageHandle) -> Result<bool>,
}

const PROBES: &[Probe] = &[
    Probe {
        table: "states",
        kind: DefectKind::NarrowText,
        dialects: &[Dialect::MySql],
        run: probe_four_byte_text,
    },
    Probe {
        table: "statistics",
        kind: DefectKind::NarrowNumeric,
        dialects: &[Dialect::MySql, Dialect::Postgres],
        run: probe_double_precision,
    },
    Probe {
        table: "statistics",
        kind: DefectKind::LowTimePrecision,
        dialects: &[Dialect::MySql, Dialect::Postgres],
        run: probe_datetime_precision,
    },
];

/// Run every probe that applies to the handle's dialect.
pub fn probe(handle: &dyn StorageHandle) -> Result<ValidationReport> {
    let dialect = handle.dialect();
    let mut report = ValidationReport::default();

    for probe in PROBES.iter().filter(|p| p.dialects.contains(&dialect)) {
        let tag = DefectTag::new(probe.table, probe.kind);
        if !handle.table_exists(probe.table)? {
            debug!("table `{}` missing, skipping {tag} probe", probe.table);
            continue;
        }

        match rollback_scope(handle, probe.run) {
            Ok(true) => {
                warn!("detected schema defect {tag}");
                report.defects.insert(tag);
            }
            Ok(false) => debug!("{tag} probe passed"),
            Err(e) if dialect.classify(&e) == ErrorClass::Corruption => {
                return Err(Error::Corruption(e.to_string()));
            }
            Err(e) => {
                warn!("could not validate {tag}: {e}");
                report.unconfirmed.insert(tag);
            }
        }
    }

    Ok(report)
}

/// Defects confirmed by a probe pass.
pub fn validate(handle: &dyn StorageHandle) -> Result<BTreeSet<DefectTag>> {
    Ok(probe(handle)?.defects)
}

/// Repair each defect independently, returning the ones that were fixed.
pub fn repair(handle: &dyn StorageHandle, defects: &BTreeSet<DefectTag>) -> BTreeSet<DefectTag> {
    let schema = SchemaDescription::current();
    let mut repaired = BTreeSet::new();

    for tag in defects {
        match repair_one(handle, &schema, tag) {
            Ok(()) => {
                info!("repaired schema defect {tag}");
                repaired.insert(tag.clone());
            }
            Err(e) => warn!("failed to repair schema defect {tag}: {e}"),
        }
    }
    repaired
}

fn repair_one(
    handle: &dyn StorageHandle,
    schema: &SchemaDescription,
    tag: &DefectTag,
) -> Result<()> {
    let table = schema
        .table(&tag.table)
        .ok_or_else(|| Error::Other(format!("no table `{}` in schema", tag.table)))?;

    match tag.kind {
        DefectKind::NarrowText => ddl::convert_charset(handle, table.name),
        DefectKind::NarrowNumeric => {
            ddl::modify_columns(handle, table.name, &table.columns_of(ColumnType::Double))
        }
        DefectKind::LowTimePrecision => {
            ddl::modify_columns(handle, table.name, &table.columns_of(ColumnType::DateTime))
        }
    }
}

fn probe_four_byte_text(handle: &dyn StorageHandle) -> Result<bool> {
    let inserted = handle.execute(
        "INSERT INTO states (entity_id, state) VALUES (?, ?)",
        &[SqlValue::from(PROBE_ENTITY), SqlValue::from(PROBE_TEXT)],
    );
    if let Err(e) = inserted {
        let rejected = e.driver().is_some_and(|driver| {
            driver.code == Some(DriverCode::Numeric(MYSQL_INCORRECT_STRING))
                || driver.message.to_lowercase().contains("incorrect string value")
        });
        if rejected {
            debug!("4-byte text rejected by `states`: {e}");
            return Ok(true);
        }
        return Err(e);
    }

    let stored = last_row(handle, "SELECT state FROM states ORDER BY state_id DESC LIMIT 1")?;
    Ok(stored.first().and_then(SqlValue::as_str) != Some(PROBE_TEXT))
}

fn probe_double_precision(handle: &dyn StorageHandle) -> Result<bool> {
    let mut params = vec![SqlValue::from(PROBE_DATETIME)];
    params.extend(NUMERIC_COLUMNS.iter().map(|_| SqlValue::Real(PROBE_NUMBER)));
    handle.execute(
        &format!(
            "INSERT INTO statistics (created, {}) VALUES (?, {})",
            NUMERIC_COLUMNS.join(", "),
            crate::handle::placeholders(NUMERIC_COLUMNS.len())
        ),
        &params,
    )?;

    let stored = last_row(
        handle,
        &format!(
            "SELECT {} FROM statistics ORDER BY id DESC LIMIT 1",
            NUMERIC_COLUMNS.join(", ")
        ),
    )?;
    Ok(stored.len() != NUMERIC_COLUMNS.len()
        || stored.iter().any(|value| value.as_f64() != Some(PROBE_NUMBER)))
}

fn probe_datetime_precision(handle: &dyn StorageHandle) -> Result<bool> {
    handle.execute(
        "INSERT INTO statistics (created) VALUES (?)",
        &[SqlValue::from(PROBE_DATETIME)],
    )?;

    let stored = last_row(handle, "SELECT created FROM statistics ORDER BY id DESC LIMIT 1")?;
    let value = stored
        .first()
        .ok_or_else(|| Error::Database("probe row has no created column".to_string()))?;
    let expected = NaiveDateTime::parse_from_str(PROBE_DATETIME, PROBE_DATETIME_FORMAT)
        .map_err(|e| Error::Other(format!("invalid probe datetime: {e}")))?;
    Ok(parse_stored_datetime(value)? != expected)
}

fn last_row(handle: &dyn StorageHandle, sql: &str) -> Result<Vec<SqlValue>> {
    handle
        .query_one(sql, &[])?
        .ok_or_else(|| Error::Database(format!("probe row not found by `{sql}`")))
}

/// Parse a datetime read back from any backend, ignoring a UTC offset.
fn parse_stored_datetime(value: &SqlValue) -> Result<NaiveDateTime> {
    let raw = value
        .as_str()
        .ok_or_else(|| Error::Database(format!("expected datetime text, got {value:?}")))?;
    let normalized = raw.trim().replace('T', " ");
    let normalized = normalized
        .trim_end_matches('Z')
        .trim_end_matches("+00:00")
        .trim_end_matches("+00");
    NaiveDateTime::parse_from_str(normalized, PROBE_DATETIME_FORMAT)
        .map_err(|e| Error::Database(format!("unrecognised datetime `{raw}`: {e}")))
}
