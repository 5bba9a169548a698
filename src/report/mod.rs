//! Progress events and the end-of-run summary.

pub mod events;
pub mod summary;

pub use events::{EventSink, LoadEvent, MemorySink, TracingSink};
pub use summary::{thousands, RunMode, SummaryReport};
