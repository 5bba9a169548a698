//! # odsloader: Dependency-Ordered Bulk Loading for an Operational Data Store
//!
//! odsloader fills a PostgreSQL operational data store from one CSV file per
//! table, in an order that always satisfies foreign keys, then checks the
//! loaded data for referential integrity.
//!
//! ## Features
//!
//! - **Computed load order**: entities declare what they reference; a dependency graph derives the order and rejects cycles
//! - **Two submission strategies**: a single `COPY ... FROM STDIN` stream, or paged multi-row inserts that skip duplicates
//! - **Normalization**: NaN-like markers become SQL null, date columns are parsed, unparseable dates are nulled and counted
//! - **Atomic clear**: every relation truncated in reverse order inside one transaction
//! - **Integrity verification**: dangling references, invalid dates and informational row counts
//! - **Date ranges**: earliest and latest activity dates summarized per relation
//! - **Run report**: per-entity results, table counts and check outcomes, persisted as JSON
//!
//! ## Example: Load Plan
//!
//! ```yaml
//! schema: ods
//! default_strategy: bulk_copy
//! entities:
//!   - name: facilities
//!   - name: members
//!     depends_on: [facilities]
//!   - name: class_enrollments
//!     depends_on: [members]
//!     strategy: batched_insert
//!     page_size: 500
//! integrity_checks:
//!   - name: Class Enrollments → Members
//!     kind: dangling_reference
//!     relation: class_enrollments
//!     column: member_id
//!     references: members
//!     referenced_column: member_id
//! ```
//!
//! ## Example: Loading
//!
//! ```ignore
//! let plan = LoadPlan::builtin()?;
//! let dest = PgDestination::connect(&descriptor)?;
//! let mut loader = BulkLoader::new(dest, Arc::new(TracingSink));
//! let results = loader.load_all(&plan, Path::new("data"))?;
//! let integrity = loader.verify(&plan);
//! ```

pub mod error;

// Load plans and dependency ordering
pub mod plan;

// Source files and cell normalization
pub mod source;

// Destination database access
pub mod destination;

// Loading, clearing and counting
pub mod loader;

// Post-load integrity checks
pub mod verify;

// Events and run summary
pub mod report;

pub use error::{DestinationError, LoadError, PartialLoad, PlanError};
pub use plan::{
    DependencyGraph, EntityDescriptor, LoadPlan, SourceSettings, StrategyKind, SubmissionStrategy,
};
pub use source::{CellValue, SourceInventory, SourceTable};
pub use destination::{ConnectionDescriptor, Destination, PgDestination};
pub use loader::{BulkLoader, CancelFlag, LoadResult, LoadStatus};
pub use verify::{
    CheckOutcome, CheckQuery, DateRange, DateSpan, IntegrityCheck, IntegrityVerifier,
    VerificationReport, Verdict,
};
pub use report::{EventSink, LoadEvent, MemorySink, RunMode, SummaryReport, TracingSink};
