//! Destination database access.
//!
//! The loader and verifier talk to the database only through the
//! [`Destination`] trait. [`PgDestination`] implements it on PostgreSQL with
//! diesel, plus a direct `postgres` client for the COPY stream.

pub mod connection;
pub mod pg;

use chrono::NaiveDate;

use crate::error::DestinationError;
use crate::source::CellValue;
use crate::verify::{CheckQuery, DateRange};

pub use connection::ConnectionDescriptor;
pub use pg::PgDestination;

/// PostgreSQL's limit on bind parameters in one statement.
pub const MAX_BIND_PARAMETERS: usize = 65_535;

/// Operations the loader, clearer and verifier need from a database.
pub trait Destination {
    /// Run `f` in one transaction: commit on `Ok`, roll back on `Err`.
    fn in_transaction<T, F>(&mut self, f: F) -> Result<T, DestinationError>
    where
        F: FnOnce(&mut Self) -> Result<T, DestinationError>,
        Self: Sized;

    /// Stream staged CSV (header line, every value quoted, null as an empty
    /// field) into `relation` with a single COPY statement. Returns the
    /// number of rows copied.
    fn copy_in(
        &mut self,
        relation: &str,
        columns: &[String],
        staged: &[u8],
    ) -> Result<u64, DestinationError>;

    /// Insert one page of rows with a single multi-row statement, skipping
    /// rows that conflict with a uniqueness constraint. Returns rows inserted.
    fn insert_page(
        &mut self,
        relation: &str,
        columns: &[String],
        rows: &[Vec<CellValue>],
    ) -> Result<u64, DestinationError>;

    fn count_rows(&mut self, relation: &str) -> Result<i64, DestinationError>;

    /// Toggle foreign-key and trigger enforcement for the session.
    fn set_constraint_enforcement(&mut self, enabled: bool) -> Result<(), DestinationError>;

    /// Remove every row of `relation` and of relations referencing it.
    fn truncate_cascade(&mut self, relation: &str) -> Result<(), DestinationError>;

    /// Evaluate an integrity query to a count.
    fn evaluate(&mut self, query: &CheckQuery) -> Result<i64, DestinationError>;

    /// Earliest and latest date in a column; `None` when it holds no values.
    fn date_bounds(
        &mut self,
        range: &DateRange,
    ) -> Result<(Option<NaiveDate>, Option<NaiveDate>), DestinationError>;

    /// Most bind parameters one insert statement may carry.
    fn max_bind_parameters(&self) -> usize {
        MAX_BIND_PARAMETERS
    }
}

/// Quote a single SQL identifier.
pub fn quote_ident(ident: &str) -> String {
    format!("\"{}\"", ident.replace('"', "\"\""))
}

/// Quote a possibly schema-qualified relation name (`schema.table`).
pub fn quote_relation(relation: &str) -> String {
    relation
        .split('.')
        .map(quote_ident)
        .collect::<Vec<_>>()
        .join(".")
}

/// Quoted, comma-separated column list.
pub fn column_list(columns: &[String]) -> String {
    columns
        .iter()
        .map(|c| quote_ident(c))
        .collect::<Vec<_>>()
        .join(", ")
}
