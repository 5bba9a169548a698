//! Cell normalization applied before rows are submitted.
//!
//! NaN-like markers become [`CellValue::Null`]; datetime-bearing columns are
//! parsed into dates or timestamps, and values that cannot be parsed are
//! coerced to null instead of failing the load.

use chrono::{DateTime, NaiveDate, NaiveDateTime};
use serde::Serialize;
use std::fmt;

use crate::plan::EntityDescriptor;
use crate::source::SourceTable;

/// Markers read as missing values, matched after trimming whitespace.
pub const NULL_TOKENS: &[&str] = &[
    "", "#N/A", "#N/A N/A", "#NA", "-1.#IND", "-1.#QNAN", "-NaN", "-nan", "1.#IND",
    "1.#QNAN", "<NA>", "N/A", "NA", "NULL", "NaN", "None", "n/a", "nan", "null",
];

const TIMESTAMP_FORMATS: &[&str] = &[
    "%Y-%m-%d %H:%M:%S%.f",
    "%Y-%m-%dT%H:%M:%S%.f",
    "%Y-%m-%d %H:%M",
    "%Y-%m-%dT%H:%M",
    "%m/%d/%Y %H:%M:%S",
    "%m/%d/%Y %H:%M",
];

const DATE_FORMATS: &[&str] = &["%Y-%m-%d", "%Y/%m/%d", "%m/%d/%Y", "%d-%b-%Y"];

/// A normalized cell, ready for staging or binding.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub enum CellValue {
    Null,
    Text(String),
    Date(NaiveDate),
    Timestamp(NaiveDateTime),
}

impl CellValue {
    /// Text form sent to the database; `None` for null.
    pub fn to_sql_text(&self) -> Option<String> {
        match self {
            CellValue::Null => None,
            other => Some(other.to_string()),
        }
    }
}

impl fmt::Display for CellValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CellValue::Null => write!(f, "null"),
            CellValue::Text(s) => write!(f, "{}", s),
            CellValue::Date(d) => write!(f, "{}", d.format("%Y-%m-%d")),
            CellValue::Timestamp(ts) => write!(f, "{}", ts),
        }
    }
}

pub fn is_null_token(raw: &str) -> bool {
    NULL_TOKENS.contains(&raw.trim())
}

/// Parse a datetime-bearing value; `None` when no known layout matches.
pub fn parse_datetime(raw: &str) -> Option<CellValue> {
    let raw = raw.trim();

    if let Ok(ts) = DateTime::parse_from_rfc3339(raw) {
        return Some(CellValue::Timestamp(ts.naive_utc()));
    }
    for format in TIMESTAMP_FORMATS {
        if let Ok(ts) = NaiveDateTime::parse_from_str(raw, format) {
            return Some(CellValue::Timestamp(ts));
        }
    }
    for format in DATE_FORMATS {
        if let Ok(date) = NaiveDate::parse_from_str(raw, format) {
            return Some(CellValue::Date(date));
        }
    }
    None
}

/// Normalize one raw cell. The flag is set when a non-null value was
/// coerced to null because it could not be parsed as a datetime.
pub fn normalize_cell(raw: Option<&str>, datetime: bool) -> (CellValue, bool) {
    let raw = match raw {
        Some(raw) if !is_null_token(raw) => raw,
        _ => return (CellValue::Null, false),
    };

    if !datetime {
        return (CellValue::Text(raw.to_string()), false);
    }

    match parse_datetime(raw) {
        Some(value) => (value, false),
        None => (CellValue::Null, true),
    }
}

/// Rows with destination column names and normalized cells.
#[derive(Debug, Clone, PartialEq)]
pub struct NormalizedTable {
    pub columns: Vec<String>,
    pub rows: Vec<Vec<CellValue>>,
    /// Datetime cells that could not be parsed and were submitted as null.
    pub coerced_to_null: usize,
}

impl NormalizedTable {
    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }
}

/// Normalize a source table for an entity, renaming mapped columns.
pub fn normalize(entity: &EntityDescriptor, table: SourceTable) -> NormalizedTable {
    let datetime_flags: Vec<bool> = table
        .columns
        .iter()
        .map(|c| entity.is_datetime_column(c) || entity.is_datetime_column(&entity.destination_column(c)))
        .collect();

    let columns = table
        .columns
        .iter()
        .map(|c| entity.destination_column(c).into_owned())
        .collect();

    let mut coerced_to_null = 0;
    let rows = table
        .rows
        .into_iter()
        .map(|row| {
            datetime_flags
                .iter()
                .enumerate()
                .map(|(i, &datetime)| {
                    let (value, coerced) =
                        normalize_cell(row.get(i).and_then(|c| c.as_deref()), datetime);
                    if coerced {
                        coerced_to_null += 1;
                    }
                    value
                })
                .collect()
        })
        .collect();

    NormalizedTable {
        columns,
        rows,
        coerced_to_null,
    }
}
