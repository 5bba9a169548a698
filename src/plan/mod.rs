//! Load plans: entity descriptors ordered by foreign-key dependencies.
//!
//! The plan is computed, never curated: each entity declares the entities it
//! references, and [`DependencyGraph`] derives a topological order from those
//! edges. Loading walks the plan forwards; clearing walks it backwards.
//!
//! Changing a foreign key in the destination schema means updating the
//! matching `depends_on` entry in the plan YAML. A missing edge is not caught
//! here; it surfaces as a constraint violation while loading.

pub mod config_loader;
pub mod dependency_graph;

use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use std::borrow::Cow;
use std::fmt;
use std::path::Path;
use std::str::FromStr;

use crate::error::PlanError;
use crate::verify::{DateRange, IntegrityCheck};

pub use config_loader::{EntityConfig, PlanConfig, BUILTIN_PLAN};
pub use dependency_graph::{DependencyGraph, DependencyNode};

/// Default number of rows per batched insert statement.
pub const DEFAULT_PAGE_SIZE: usize = 1000;

/// How an entity's rows are submitted to the destination.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SubmissionStrategy {
    /// Stage all rows as CSV and stream them through `COPY ... FROM STDIN`.
    BulkCopy,
    /// Multi-row parameterized inserts, duplicates skipped.
    BatchedInsert { page_size: usize },
}

impl SubmissionStrategy {
    pub fn kind(&self) -> StrategyKind {
        match self {
            SubmissionStrategy::BulkCopy => StrategyKind::BulkCopy,
            SubmissionStrategy::BatchedInsert { .. } => StrategyKind::BatchedInsert,
        }
    }
}

impl fmt::Display for SubmissionStrategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SubmissionStrategy::BulkCopy => write!(f, "bulk-copy"),
            SubmissionStrategy::BatchedInsert { page_size } => {
                write!(f, "batched-insert ({} rows/page)", page_size)
            }
        }
    }
}

/// Strategy selector as written in configuration and on the command line.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StrategyKind {
    BulkCopy,
    BatchedInsert,
}

impl StrategyKind {
    pub fn with_page_size(self, page_size: usize) -> SubmissionStrategy {
        match self {
            StrategyKind::BulkCopy => SubmissionStrategy::BulkCopy,
            StrategyKind::BatchedInsert => SubmissionStrategy::BatchedInsert { page_size },
        }
    }
}

impl FromStr for StrategyKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().replace('-', "_").as_str() {
            "bulk_copy" | "copy" => Ok(StrategyKind::BulkCopy),
            "batched_insert" | "insert" => Ok(StrategyKind::BatchedInsert),
            other => Err(format!(
                "Unsupported strategy: '{}'. Supported strategies: bulk-copy, batched-insert",
                other
            )),
        }
    }
}

/// One logical table: its source file stem and destination relation.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct EntityDescriptor {
    /// Source file stem, e.g. `members` for `members.csv`.
    pub name: String,
    /// Destination relation, optionally schema-qualified.
    pub relation: String,
    pub depends_on: Vec<String>,
    pub strategy: SubmissionStrategy,
    /// Source column -> destination column, for columns whose names differ.
    pub column_map: IndexMap<String, String>,
    /// Columns coerced to dates/timestamps before submission.
    pub datetime_columns: Vec<String>,
}

impl EntityDescriptor {
    /// Destination column name for a source column.
    ///
    /// Mapped names are used as written. Unmapped names are folded to lower
    /// case, as PostgreSQL folds unquoted identifiers.
    pub fn destination_column<'a>(&'a self, source_column: &'a str) -> Cow<'a, str> {
        match self.column_map.get(source_column) {
            Some(mapped) => Cow::Borrowed(mapped.as_str()),
            None if source_column.bytes().any(|b| b.is_ascii_uppercase()) => {
                Cow::Owned(source_column.to_ascii_lowercase())
            }
            None => Cow::Borrowed(source_column),
        }
    }

    pub fn is_datetime_column(&self, source_column: &str) -> bool {
        self.datetime_columns.iter().any(|c| c == source_column)
    }
}

/// How source files are located and parsed.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SourceSettings {
    pub extension: String,
    pub delimiter: u8,
}

impl Default for SourceSettings {
    fn default() -> Self {
        SourceSettings {
            extension: "csv".to_string(),
            delimiter: b',',
        }
    }
}

impl SourceSettings {
    pub fn file_name(&self, entity: &str) -> String {
        format!("{}.{}", entity, self.extension)
    }
}

/// Entities in a valid topological order, plus the checks run after loading.
#[derive(Debug, Clone)]
pub struct LoadPlan {
    entities: Vec<EntityDescriptor>,
    graph: DependencyGraph,
    checks: Vec<IntegrityCheck>,
    date_ranges: Vec<DateRange>,
    pub source: SourceSettings,
    pub strict_sources: bool,
}

impl LoadPlan {
    /// Order descriptors by their dependency graph.
    pub fn new(
        entities: Vec<EntityDescriptor>,
        checks: Vec<IntegrityCheck>,
        source: SourceSettings,
    ) -> Result<Self, PlanError> {
        let graph = DependencyGraph::build(&entities)?;

        let mut by_name: IndexMap<String, EntityDescriptor> = entities
            .into_iter()
            .map(|e| (e.name.clone(), e))
            .collect();

        let ordered = graph
            .processing_order()
            .into_iter()
            .filter_map(|name| by_name.shift_remove(&name))
            .collect();

        Ok(LoadPlan {
            entities: ordered,
            graph,
            checks,
            date_ranges: Vec::new(),
            source,
            strict_sources: false,
        })
    }

    /// Date columns summarized in the run report.
    pub fn with_date_ranges(mut self, date_ranges: Vec<DateRange>) -> Self {
        self.date_ranges = date_ranges;
        self
    }

    /// The plan shipped with the crate for the fitness-center ODS.
    pub fn builtin() -> Result<Self, PlanError> {
        PlanConfig::from_yaml(BUILTIN_PLAN)?.into_plan()
    }

    /// Load a plan from a YAML file.
    pub fn load_from_file<P: AsRef<Path>>(path: P) -> Result<Self, PlanError> {
        PlanConfig::load_from_file(path)?.into_plan()
    }

    /// Descriptors in load order.
    pub fn order(&self) -> &[EntityDescriptor] {
        &self.entities
    }

    /// Descriptors in clear order (reverse of load order).
    pub fn reversed(&self) -> impl Iterator<Item = &EntityDescriptor> {
        self.entities.iter().rev()
    }

    pub fn entity(&self, name: &str) -> Option<&EntityDescriptor> {
        self.entities.iter().find(|e| e.name == name)
    }

    pub fn graph(&self) -> &DependencyGraph {
        &self.graph
    }

    pub fn checks(&self) -> &[IntegrityCheck] {
        &self.checks
    }

    pub fn date_ranges(&self) -> &[DateRange] {
        &self.date_ranges
    }

    pub fn len(&self) -> usize {
        self.entities.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entities.is_empty()
    }

    /// Force every entity onto one strategy, keeping batched page sizes.
    pub fn override_strategy(&mut self, kind: StrategyKind, page_size: usize) {
        for entity in &mut self.entities {
            entity.strategy = match (kind, entity.strategy) {
                (StrategyKind::BatchedInsert, SubmissionStrategy::BatchedInsert { page_size }) => {
                    SubmissionStrategy::BatchedInsert { page_size }
                }
                _ => kind.with_page_size(page_size),
            };
        }
    }
}
