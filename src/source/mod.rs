//! Source tables: one delimited file per entity.
//!
//! Files are read fresh for each entity and dropped once the entity is loaded.

pub mod normalize;

use csv::ReaderBuilder;
use std::io::Read;
use std::path::{Path, PathBuf};

use crate::plan::{LoadPlan, SourceSettings};

pub use normalize::{normalize, CellValue, NormalizedTable};

/// Errors raised while reading a source file.
#[derive(Debug, thiserror::Error)]
pub enum SourceError {
    #[error("{0}")]
    Csv(#[from] csv::Error),

    #[error("line {line} has {found} fields but the header has {expected}")]
    RaggedRow {
        line: u64,
        expected: usize,
        found: usize,
    },
}

/// In-memory contents of one source file.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct SourceTable {
    pub columns: Vec<String>,
    /// Raw cells by column position; `None` marks a missing trailing cell.
    pub rows: Vec<Vec<Option<String>>>,
}

impl SourceTable {
    pub fn new(columns: Vec<String>, rows: Vec<Vec<Option<String>>>) -> Self {
        SourceTable { columns, rows }
    }

    /// Read a table from any reader; the first record is the header.
    ///
    /// Rows shorter than the header are padded with missing cells. Rows
    /// longer than the header are rejected.
    pub fn from_reader<R: Read>(reader: R, delimiter: u8) -> Result<Self, SourceError> {
        let mut rdr = ReaderBuilder::new()
            .has_headers(true)
            .delimiter(delimiter)
            .flexible(true)
            .from_reader(reader);

        let columns: Vec<String> = rdr.headers()?.iter().map(|h| h.to_string()).collect();

        let mut rows = Vec::new();
        for record in rdr.records() {
            let record = record?;
            if record.len() > columns.len() {
                return Err(SourceError::RaggedRow {
                    line: record.position().map(|p| p.line()).unwrap_or_default(),
                    expected: columns.len(),
                    found: record.len(),
                });
            }

            let mut row: Vec<Option<String>> =
                record.iter().map(|field| Some(field.to_string())).collect();
            row.resize(columns.len(), None);
            rows.push(row);
        }

        Ok(SourceTable { columns, rows })
    }

    /// Read a table from a file.
    pub fn read_path<P: AsRef<Path>>(path: P, delimiter: u8) -> Result<Self, SourceError> {
        let file = std::fs::File::open(path.as_ref()).map_err(csv::Error::from)?;
        Self::from_reader(std::io::BufReader::new(file), delimiter)
    }

    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    pub fn column_index(&self, name: &str) -> Option<usize> {
        self.columns.iter().position(|c| c == name)
    }
}

/// Path of an entity's source file within a data directory.
pub fn source_path(data_dir: &Path, settings: &SourceSettings, entity: &str) -> PathBuf {
    data_dir.join(settings.file_name(entity))
}

/// Which planned sources exist in a data directory.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SourceInventory {
    pub present: Vec<(String, PathBuf)>,
    pub missing: Vec<(String, PathBuf)>,
}

impl SourceInventory {
    /// Check every planned entity for its source file.
    pub fn discover(plan: &LoadPlan, data_dir: &Path) -> Self {
        let mut inventory = SourceInventory::default();

        for entity in plan.order() {
            let path = source_path(data_dir, &plan.source, &entity.name);
            if path.is_file() {
                inventory.present.push((entity.name.clone(), path));
            } else {
                inventory.missing.push((entity.name.clone(), path));
            }
        }

        inventory
    }

    pub fn is_complete(&self) -> bool {
        self.missing.is_empty()
    }
}
