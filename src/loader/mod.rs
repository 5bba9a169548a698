//! Bulk loading of source tables into the destination.
//!
//! [`BulkLoader`] walks a [`LoadPlan`] in dependency order. Each entity is
//! read, normalized and submitted in one transaction, then its relation is
//! counted. The first failure stops the run.

pub mod staging;

use indexmap::IndexMap;
use serde::Serialize;
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Instant;

use crate::destination::Destination;
use crate::error::{DestinationError, LoadError, PartialLoad};
use crate::plan::{EntityDescriptor, LoadPlan, SubmissionStrategy};
use crate::report::{EventSink, LoadEvent};
use crate::source::{normalize, source_path, NormalizedTable, SourceInventory, SourceTable};
use crate::verify::{DateSpan, IntegrityVerifier, VerificationReport};

pub use staging::stage_csv;

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum LoadStatus {
    Loaded,
    SkippedEmpty,
    SkippedMissingSource,
    Failed { reason: String },
}

/// Outcome of loading one entity.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct LoadResult {
    pub entity: String,
    pub relation: String,
    /// Rows read from the source.
    pub records_submitted: usize,
    /// Rows in the relation after the load committed.
    pub records_confirmed: i64,
    #[serde(flatten)]
    pub status: LoadStatus,
}

impl LoadResult {
    fn skipped(entity: &EntityDescriptor, status: LoadStatus) -> Self {
        LoadResult {
            entity: entity.name.clone(),
            relation: entity.relation.clone(),
            records_submitted: 0,
            records_confirmed: 0,
            status,
        }
    }

    fn failed(entity: &EntityDescriptor, error: &LoadError) -> Self {
        LoadResult::skipped(
            entity,
            LoadStatus::Failed {
                reason: error.to_string(),
            },
        )
    }

    pub fn is_failed(&self) -> bool {
        matches!(self.status, LoadStatus::Failed { .. })
    }
}

/// Operator interrupt, shared between the signal handler and the loader.
#[derive(Debug, Clone, Default)]
pub struct CancelFlag(Arc<AtomicBool>);

impl CancelFlag {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

/// Loads, clears and counts the relations of a plan through one destination.
pub struct BulkLoader<D: Destination> {
    dest: D,
    sink: Arc<dyn EventSink>,
    cancel: CancelFlag,
}

impl<D: Destination> BulkLoader<D> {
    pub fn new(dest: D, sink: Arc<dyn EventSink>) -> Self {
        BulkLoader {
            dest,
            sink,
            cancel: CancelFlag::new(),
        }
    }

    pub fn with_cancel_flag(mut self, cancel: CancelFlag) -> Self {
        self.cancel = cancel;
        self
    }

    pub fn destination(&self) -> &D {
        &self.dest
    }

    /// Load one entity from an already-read source table.
    ///
    /// A missing source or a source with no rows is skipped, not failed.
    pub fn load_entity(
        &mut self,
        entity: &EntityDescriptor,
        source: Option<SourceTable>,
    ) -> Result<LoadResult, LoadError> {
        self.emit(LoadEvent::EntityStarted {
            entity: entity.name.clone(),
            relation: entity.relation.clone(),
            strategy: entity.strategy.to_string(),
        });

        let table = match source {
            Some(table) => table,
            None => return Ok(self.skip(entity, LoadStatus::SkippedMissingSource)),
        };
        if table.is_empty() {
            return Ok(self.skip(entity, LoadStatus::SkippedEmpty));
        }

        match self.submit_entity(entity, table) {
            Ok(result) => Ok(result),
            Err(e) => {
                self.emit_failure(&entity.name, &e);
                Err(e)
            }
        }
    }

    fn submit_entity(
        &mut self,
        entity: &EntityDescriptor,
        table: SourceTable,
    ) -> Result<LoadResult, LoadError> {
        let started = Instant::now();
        let normalized = normalize(entity, table);
        let submitted = normalized.len();

        if self.cancel.is_cancelled() {
            return Err(LoadError::Cancelled {
                entity: entity.name.clone(),
            });
        }

        let written = match entity.strategy {
            SubmissionStrategy::BulkCopy => self.bulk_copy(entity, &normalized)?,
            SubmissionStrategy::BatchedInsert { page_size } => {
                self.batched_insert(entity, &normalized, page_size)?
            }
        };

        let confirmed = match self.dest.count_rows(&entity.relation) {
            Ok(count) => count,
            Err(e) => {
                self.emit(LoadEvent::CountUnavailable {
                    relation: entity.relation.clone(),
                    message: e.to_string(),
                });
                written as i64
            }
        };

        self.emit(LoadEvent::EntityLoaded {
            entity: entity.name.clone(),
            relation: entity.relation.clone(),
            submitted,
            written,
            confirmed,
            coerced_to_null: normalized.coerced_to_null,
            elapsed_ms: started.elapsed().as_millis() as u64,
        });

        Ok(LoadResult {
            entity: entity.name.clone(),
            relation: entity.relation.clone(),
            records_submitted: submitted,
            records_confirmed: confirmed,
            status: LoadStatus::Loaded,
        })
    }

    /// One COPY statement; it commits or fails as a whole.
    fn bulk_copy(
        &mut self,
        entity: &EntityDescriptor,
        table: &NormalizedTable,
    ) -> Result<u64, LoadError> {
        let staged = stage_csv(table).map_err(|source| LoadError::Staging {
            entity: entity.name.clone(),
            source,
        })?;

        tracing::debug!(
            "Staged {} rows ({} bytes) for {}",
            table.len(),
            staged.len(),
            entity.relation
        );

        self.dest
            .copy_in(&entity.relation, &table.columns, &staged)
            .map_err(|e| submission_error(entity, e))
    }

    /// Every page runs inside a single transaction.
    fn batched_insert(
        &mut self,
        entity: &EntityDescriptor,
        table: &NormalizedTable,
        page_size: usize,
    ) -> Result<u64, LoadError> {
        let page_size = effective_page_size(
            page_size,
            table.columns.len(),
            self.dest.max_bind_parameters(),
        );
        let cancel = self.cancel.clone();
        let relation = entity.relation.as_str();
        let columns = &table.columns;

        self.dest
            .in_transaction(|dest| {
                let mut inserted = 0;
                for page in table.rows.chunks(page_size) {
                    if cancel.is_cancelled() {
                        return Err(DestinationError::Interrupted);
                    }
                    inserted += dest.insert_page(relation, columns, page)?;
                }
                Ok(inserted)
            })
            .map_err(|e| submission_error(entity, e))
    }

    /// Load every entity of the plan from `data_dir`, stopping at the first
    /// failure.
    pub fn load_all(
        &mut self,
        plan: &LoadPlan,
        data_dir: &Path,
    ) -> Result<Vec<LoadResult>, PartialLoad> {
        let inventory = SourceInventory::discover(plan, data_dir);
        self.emit(LoadEvent::SourcesDiscovered {
            present: inventory.present.iter().map(|(name, _)| name.clone()).collect(),
            missing: inventory.missing.iter().map(|(name, _)| name.clone()).collect(),
        });

        let mut results = Vec::with_capacity(plan.len());

        if plan.strict_sources {
            if let Some((name, path)) = inventory.missing.first() {
                let error = LoadError::MissingSource {
                    entity: name.clone(),
                    path: path.clone(),
                };
                if let Some(entity) = plan.entity(name) {
                    results.push(LoadResult::failed(entity, &error));
                }
                self.emit_failure(name, &error);
                return Err(PartialLoad {
                    results,
                    source: error,
                });
            }
        }

        for entity in plan.order() {
            if self.cancel.is_cancelled() {
                let error = LoadError::Cancelled {
                    entity: entity.name.clone(),
                };
                self.emit_failure(&entity.name, &error);
                results.push(LoadResult::failed(entity, &error));
                return Err(PartialLoad {
                    results,
                    source: error,
                });
            }

            let path = source_path(data_dir, &plan.source, &entity.name);
            let source = if path.is_file() {
                match SourceTable::read_path(&path, plan.source.delimiter) {
                    Ok(table) => Some(table),
                    Err(source) => {
                        let error = LoadError::Source {
                            entity: entity.name.clone(),
                            path,
                            source,
                        };
                        self.emit_failure(&entity.name, &error);
                        results.push(LoadResult::failed(entity, &error));
                        return Err(PartialLoad {
                            results,
                            source: error,
                        });
                    }
                }
            } else {
                None
            };

            match self.load_entity(entity, source) {
                Ok(result) => results.push(result),
                Err(error) => {
                    results.push(LoadResult::failed(entity, &error));
                    return Err(PartialLoad {
                        results,
                        source: error,
                    });
                }
            }
        }

        Ok(results)
    }

    /// Empty every planned relation in reverse load order, atomically.
    ///
    /// An interrupt between truncations rolls back the ones already made.
    pub fn clear_all(&mut self, plan: &LoadPlan) -> Result<(), LoadError> {
        let relations: Vec<String> = plan.reversed().map(|e| e.relation.clone()).collect();
        self.emit(LoadEvent::ClearStarted {
            relations: relations.clone(),
        });
        let cancel = self.cancel.clone();

        self.dest
            .in_transaction(|dest| {
                dest.set_constraint_enforcement(false)?;
                for relation in &relations {
                    if cancel.is_cancelled() {
                        return Err(DestinationError::Interrupted);
                    }
                    dest.truncate_cascade(relation)?;
                }
                if cancel.is_cancelled() {
                    return Err(DestinationError::Interrupted);
                }
                dest.set_constraint_enforcement(true)
            })
            .map_err(|source| LoadError::Clear { source })?;

        self.emit(LoadEvent::Cleared {
            relations: relations.len(),
        });
        Ok(())
    }

    /// Row count of every planned relation, keyed by entity name. A relation
    /// that cannot be counted is reported as zero.
    pub fn census(&mut self, plan: &LoadPlan) -> IndexMap<String, i64> {
        let mut counts = IndexMap::with_capacity(plan.len());

        for entity in plan.order() {
            let count = match self.dest.count_rows(&entity.relation) {
                Ok(count) => count,
                Err(e) => {
                    self.emit(LoadEvent::CountUnavailable {
                        relation: entity.relation.clone(),
                        message: e.to_string(),
                    });
                    0
                }
            };
            counts.insert(entity.name.clone(), count);
        }

        counts
    }

    /// Earliest and latest value of each date column the plan summarizes.
    pub fn date_spans(&mut self, plan: &LoadPlan) -> Vec<DateSpan> {
        let mut spans = Vec::with_capacity(plan.date_ranges().len());

        for range in plan.date_ranges() {
            let span = match self.dest.date_bounds(range) {
                Ok((earliest, latest)) => DateSpan::measured(range, earliest, latest),
                Err(e) => DateSpan::unavailable(range, e.to_string()),
            };
            self.emit(LoadEvent::DateRangeMeasured { span: span.clone() });
            spans.push(span);
        }

        spans
    }

    /// Run the plan's integrity checks.
    pub fn verify(&mut self, plan: &LoadPlan) -> VerificationReport {
        IntegrityVerifier::new(plan.checks()).verify(&mut self.dest, self.sink.as_ref())
    }

    fn skip(&self, entity: &EntityDescriptor, status: LoadStatus) -> LoadResult {
        self.emit(LoadEvent::EntitySkipped {
            entity: entity.name.clone(),
            status: status.clone(),
        });
        LoadResult::skipped(entity, status)
    }

    fn emit(&self, event: LoadEvent) {
        self.sink.emit(&event);
    }

    fn emit_failure(&self, entity: &str, error: &LoadError) {
        self.emit(LoadEvent::EntityFailed {
            entity: entity.to_string(),
            error: error.to_string(),
        });
    }
}

fn submission_error(entity: &EntityDescriptor, error: DestinationError) -> LoadError {
    match error {
        DestinationError::Interrupted => LoadError::Cancelled {
            entity: entity.name.clone(),
        },
        source => LoadError::Submission {
            entity: entity.name.clone(),
            relation: entity.relation.clone(),
            source,
        },
    }
}

/// Rows per insert statement, kept under the bind-parameter limit.
pub fn effective_page_size(requested: usize, columns: usize, max_parameters: usize) -> usize {
    let by_parameters = max_parameters / columns.max(1);
    requested.min(by_parameters).max(1)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_effective_page_size() {
        assert_eq!(effective_page_size(1000, 10, 65_535), 1000);
        assert_eq!(effective_page_size(1000, 100, 65_535), 655);
        assert_eq!(effective_page_size(0, 3, 65_535), 1);
        assert_eq!(effective_page_size(50, 0, 65_535), 50);
    }

    #[test]
    fn test_cancel_flag_is_shared() {
        let flag = CancelFlag::new();
        let handle = flag.clone();

        assert!(!flag.is_cancelled());
        handle.cancel();
        assert!(flag.is_cancelled());
    }

    #[test]
    fn test_load_result_serializes_status_inline() {
        let result = LoadResult {
            entity: "members".to_string(),
            relation: "ods.members".to_string(),
            records_submitted: 5,
            records_confirmed: 5,
            status: LoadStatus::Loaded,
        };

        let json = serde_json::to_value(&result).unwrap();
        assert_eq!(json["status"], "loaded");
        assert_eq!(json["records_confirmed"], 5);

        let failed = LoadResult {
            status: LoadStatus::Failed {
                reason: "boom".to_string(),
            },
            ..result
        };
        assert!(failed.is_failed());
        assert_eq!(serde_json::to_value(&failed).unwrap()["reason"], "boom");
    }
}
