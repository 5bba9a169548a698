//! In-memory destination used by the integration tests.

#![allow(dead_code)]

use chrono::{Local, NaiveDate};
use indexmap::IndexMap;
use std::fs;
use std::path::Path;

use odsloader::{CancelFlag, CellValue, CheckQuery, DateRange, Destination, DestinationError};

pub type Row = IndexMap<String, Option<String>>;

#[derive(Debug, Clone, Default)]
pub struct MemoryTable {
    /// Column with a uniqueness constraint.
    pub key: Option<String>,
    pub rows: Vec<Row>,
}

impl MemoryTable {
    fn has_key(&self, value: &Option<String>) -> bool {
        match (&self.key, value) {
            (Some(key), Some(_)) => self.rows.iter().any(|r| r.get(key) == Some(value)),
            _ => false,
        }
    }
}

/// A destination keeping relations in memory, with transaction rollback and
/// evaluation of structured integrity checks.
#[derive(Debug, Default)]
pub struct MemoryDestination {
    pub tables: IndexMap<String, MemoryTable>,
    pub constraints_enabled: bool,
    pub transactions_committed: usize,
    pub transactions_rolled_back: usize,
    /// Fail the nth (1-based) insert page submitted to a relation.
    pub fail_on_page: Option<(String, usize)>,
    pub fail_truncate: Option<String>,
    pub reject_copy: Option<String>,
    /// Raise the flag once the nth (1-based) insert page of a relation is written.
    pub cancel_after_page: Option<(String, usize, CancelFlag)>,
    /// Raise the flag while truncating a relation.
    pub cancel_on_truncate: Option<(String, CancelFlag)>,
    pages_seen: IndexMap<String, usize>,
}

impl MemoryDestination {
    pub fn new() -> Self {
        MemoryDestination {
            constraints_enabled: true,
            ..Default::default()
        }
    }

    pub fn with_relation(mut self, relation: &str, key: &str) -> Self {
        self.tables.insert(
            relation.to_string(),
            MemoryTable {
                key: Some(key.to_string()),
                rows: Vec::new(),
            },
        );
        self
    }

    pub fn rows(&self, relation: &str) -> &[Row] {
        self.tables
            .get(relation)
            .map(|t| t.rows.as_slice())
            .unwrap_or(&[])
    }

    fn table_mut(&mut self, relation: &str) -> Result<&mut MemoryTable, DestinationError> {
        self.tables
            .get_mut(relation)
            .ok_or_else(|| DestinationError::UnknownRelation(relation.to_string()))
    }

    fn table(&self, relation: &str) -> Result<&MemoryTable, DestinationError> {
        self.tables
            .get(relation)
            .ok_or_else(|| DestinationError::UnknownRelation(relation.to_string()))
    }
}

impl Destination for MemoryDestination {
    fn in_transaction<T, F>(&mut self, f: F) -> Result<T, DestinationError>
    where
        F: FnOnce(&mut Self) -> Result<T, DestinationError>,
    {
        let snapshot = self.tables.clone();
        let constraints = self.constraints_enabled;

        match f(self) {
            Ok(value) => {
                self.transactions_committed += 1;
                Ok(value)
            }
            Err(e) => {
                self.tables = snapshot;
                self.constraints_enabled = constraints;
                self.transactions_rolled_back += 1;
                Err(e)
            }
        }
    }

    fn copy_in(
        &mut self,
        relation: &str,
        columns: &[String],
        staged: &[u8],
    ) -> Result<u64, DestinationError> {
        if self.reject_copy.as_deref() == Some(relation) {
            return Err(DestinationError::Rejected(format!(
                "invalid input syntax in COPY to {}",
                relation
            )));
        }

        let mut reader = csv::ReaderBuilder::new()
            .has_headers(true)
            .from_reader(staged);

        let header: Vec<String> = reader
            .headers()
            .map_err(|e| DestinationError::Rejected(e.to_string()))?
            .iter()
            .map(String::from)
            .collect();
        assert_eq!(&header, columns, "staged header must match the column list");

        let table = self.table_mut(relation)?;
        let mut incoming = Vec::new();
        for record in reader.records() {
            let record = record.map_err(|e| DestinationError::Rejected(e.to_string()))?;
            let row: Row = header
                .iter()
                .zip(record.iter())
                .map(|(column, value)| {
                    // FORCE_NULL: an empty field, quoted or not, is null
                    let value = if value.is_empty() {
                        None
                    } else {
                        Some(value.to_string())
                    };
                    (column.clone(), value)
                })
                .collect();

            if let Some(ref key) = table.key {
                let value = row.get(key).cloned().flatten();
                let duplicate_incoming = incoming
                    .iter()
                    .any(|r: &Row| value.is_some() && r.get(key).cloned().flatten() == value);
                if table.has_key(&value) || duplicate_incoming {
                    return Err(DestinationError::Rejected(format!(
                        "duplicate key value violates unique constraint on {}.{}",
                        relation, key
                    )));
                }
            }
            incoming.push(row);
        }

        let copied = incoming.len() as u64;
        table.rows.extend(incoming);
        Ok(copied)
    }

    fn insert_page(
        &mut self,
        relation: &str,
        columns: &[String],
        rows: &[Vec<CellValue>],
    ) -> Result<u64, DestinationError> {
        let page = {
            let seen = self.pages_seen.entry(relation.to_string()).or_insert(0);
            *seen += 1;
            *seen
        };
        if let Some((ref failing, n)) = self.fail_on_page {
            if failing == relation && n == page {
                return Err(DestinationError::Rejected(format!(
                    "value too long for type character varying(50) in {}",
                    relation
                )));
            }
        }

        let table = self.table_mut(relation)?;
        let mut inserted = 0;
        for values in rows {
            let row: Row = columns
                .iter()
                .enumerate()
                .map(|(i, column)| (column.clone(), values.get(i).and_then(CellValue::to_sql_text)))
                .collect();

            let key_value = table.key.as_ref().and_then(|k| row.get(k).cloned().flatten());
            if table.has_key(&key_value) {
                continue;
            }
            table.rows.push(row);
            inserted += 1;
        }

        if let Some((ref relation_to_watch, n, ref flag)) = self.cancel_after_page {
            if relation_to_watch == relation && n == page {
                flag.cancel();
            }
        }

        Ok(inserted)
    }

    fn count_rows(&mut self, relation: &str) -> Result<i64, DestinationError> {
        Ok(self.table(relation)?.rows.len() as i64)
    }

    fn set_constraint_enforcement(&mut self, enabled: bool) -> Result<(), DestinationError> {
        self.constraints_enabled = enabled;
        Ok(())
    }

    fn truncate_cascade(&mut self, relation: &str) -> Result<(), DestinationError> {
        if let Some((ref watched, ref flag)) = self.cancel_on_truncate {
            if watched == relation {
                flag.cancel();
            }
        }
        if self.fail_truncate.as_deref() == Some(relation) {
            return Err(DestinationError::Rejected(format!(
                "permission denied for table {}",
                relation
            )));
        }
        self.table_mut(relation)?.rows.clear();
        Ok(())
    }

    fn evaluate(&mut self, query: &CheckQuery) -> Result<i64, DestinationError> {
        match query {
            CheckQuery::DanglingReference {
                relation,
                column,
                references,
                referenced_column,
            } => {
                let parent = self.table(references)?;
                let child = self.table(relation)?;
                let count = child
                    .rows
                    .iter()
                    .filter_map(|r| r.get(column).cloned().flatten())
                    .filter(|value| {
                        !parent
                            .rows
                            .iter()
                            .any(|p| p.get(referenced_column).cloned().flatten().as_ref() == Some(value))
                    })
                    .count();
                Ok(count as i64)
            }
            CheckQuery::InvalidDate { relation, column } => {
                let today = Local::now().date_naive();
                let count = self
                    .table(relation)?
                    .rows
                    .iter()
                    .filter(|r| match r.get(column).cloned().flatten() {
                        None => true,
                        Some(value) => NaiveDate::parse_from_str(&value[..value.len().min(10)], "%Y-%m-%d")
                            .map(|date| date > today)
                            .unwrap_or(true),
                    })
                    .count();
                Ok(count as i64)
            }
            CheckQuery::RowCount { relation, filter } => {
                let table = self.table(relation)?;
                let count = match filter {
                    None => table.rows.len(),
                    Some(filter) => {
                        let (column, value) = filter.split_once('=').ok_or_else(|| {
                            DestinationError::Rejected(format!("unsupported filter: {}", filter))
                        })?;
                        let column = column.trim();
                        let value = value.trim().trim_matches('\'');
                        table
                            .rows
                            .iter()
                            .filter(|r| r.get(column).cloned().flatten().as_deref() == Some(value))
                            .count()
                    }
                };
                Ok(count as i64)
            }
            CheckQuery::Sql { query } => Err(DestinationError::Rejected(format!(
                "syntax error at or near \"{}\"",
                query.split_whitespace().next().unwrap_or_default()
            ))),
        }
    }

    fn date_bounds(
        &mut self,
        range: &DateRange,
    ) -> Result<(Option<NaiveDate>, Option<NaiveDate>), DestinationError> {
        let dates: Vec<NaiveDate> = self
            .table(&range.relation)?
            .rows
            .iter()
            .filter_map(|r| r.get(&range.column).cloned().flatten())
            .filter_map(|value| {
                NaiveDate::parse_from_str(&value[..value.len().min(10)], "%Y-%m-%d").ok()
            })
            .collect();

        Ok((dates.iter().min().copied(), dates.iter().max().copied()))
    }
}

pub fn write_source(dir: &Path, entity: &str, contents: &str) {
    fs::write(dir.join(format!("{}.csv", entity)), contents).unwrap();
}
