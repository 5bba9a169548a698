//! Error types for plan construction, destination access and loading.

use std::path::PathBuf;

use crate::loader::LoadResult;
use crate::source::SourceError;

/// Errors raised while building a load plan from configuration.
#[derive(Debug, thiserror::Error)]
pub enum PlanError {
    #[error("Failed to read plan file {}: {source}", .path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to parse plan YAML: {0}")]
    Yaml(#[from] serde_yaml::Error),

    #[error("Entity '{0}' is declared more than once")]
    DuplicateEntity(String),

    #[error("Entity '{entity}' depends on undefined entity '{dependency}'")]
    UnknownDependency { entity: String, dependency: String },

    #[error("Entity '{0}' depends on itself")]
    SelfDependency(String),

    #[error("Circular dependency detected involving entities: {0:?}")]
    Cycle(Vec<String>),

    #[error("Invalid identifier '{identifier}' in {context}")]
    InvalidIdentifier { identifier: String, context: String },

    #[error("Delimiter {0:?} must be a single ASCII character")]
    InvalidDelimiter(char),

    #[error("Page size for '{0}' must be greater than zero")]
    ZeroPageSize(String),
}

/// Errors reported by a [`Destination`](crate::destination::Destination).
///
/// Each message carries the underlying cause in full; the cause is not
/// exposed again through `source()`.
#[derive(Debug, thiserror::Error)]
pub enum DestinationError {
    #[error("connection failed: {0}")]
    Connection(diesel::ConnectionError),

    #[error("query failed: {0}")]
    Query(diesel::result::Error),

    #[error("COPY stream failed: {0}")]
    Copy(String),

    #[error("I/O error: {0}")]
    Io(std::io::Error),

    #[error("invalid connection descriptor: {0}")]
    InvalidDescriptor(String),

    #[error("interrupted by operator")]
    Interrupted,

    #[error("relation '{0}' does not exist")]
    UnknownRelation(String),

    #[error("column '{column}' does not exist in relation '{relation}'")]
    UnknownColumn { relation: String, column: String },

    #[error("{0}")]
    Rejected(String),
}

impl From<diesel::ConnectionError> for DestinationError {
    fn from(e: diesel::ConnectionError) -> Self {
        DestinationError::Connection(e)
    }
}

impl From<diesel::result::Error> for DestinationError {
    fn from(e: diesel::result::Error) -> Self {
        DestinationError::Query(e)
    }
}

impl From<std::io::Error> for DestinationError {
    fn from(e: std::io::Error) -> Self {
        DestinationError::Io(e)
    }
}

/// `postgres::Error` displays only `db error` for server-side failures; the
/// server's message, detail and context are taken from the `DbError` instead.
impl From<postgres::Error> for DestinationError {
    fn from(e: postgres::Error) -> Self {
        let message = match e.as_db_error() {
            Some(db) => server_message(db.severity(), db.message(), db.detail(), db.where_()),
            None => display_chain(&e),
        };
        DestinationError::Copy(message)
    }
}

/// `SEVERITY: message (detail) [context]`, as the server reported it.
pub fn server_message(
    severity: &str,
    message: &str,
    detail: Option<&str>,
    context: Option<&str>,
) -> String {
    let mut out = format!("{}: {}", severity, message);
    if let Some(detail) = detail {
        out.push_str(&format!(" ({})", detail));
    }
    if let Some(context) = context {
        out.push_str(&format!(" [{}]", context));
    }
    out
}

/// An error followed by each cause in its source chain, joined with `": "`.
/// A cause whose text already ends the message is not repeated.
pub fn display_chain(error: &(dyn std::error::Error + 'static)) -> String {
    let mut message = error.to_string();
    let mut cause = error.source();
    while let Some(e) = cause {
        let text = e.to_string();
        if !message.ends_with(&text) {
            message.push_str(": ");
            message.push_str(&text);
        }
        cause = e.source();
    }
    message
}

/// Errors that abort a load, clear or connect step.
#[derive(Debug, thiserror::Error)]
pub enum LoadError {
    #[error("Could not connect to {target}: {source}")]
    Connection {
        target: String,
        #[source]
        source: DestinationError,
    },

    #[error("Source for '{entity}' not found at {}", .path.display())]
    MissingSource { entity: String, path: PathBuf },

    #[error("Failed to read source for '{entity}' from {}: {source}", .path.display())]
    Source {
        entity: String,
        path: PathBuf,
        #[source]
        source: SourceError,
    },

    #[error("Failed to stage rows for '{entity}': {source}")]
    Staging {
        entity: String,
        #[source]
        source: csv::Error,
    },

    #[error("Failed to load '{entity}' into {relation}: {source}")]
    Submission {
        entity: String,
        relation: String,
        #[source]
        source: DestinationError,
    },

    #[error("Failed to clear relations (rolled back): {source}")]
    Clear {
        #[source]
        source: DestinationError,
    },

    #[error("Load cancelled before '{entity}'")]
    Cancelled { entity: String },
}

impl LoadError {
    /// Entity the failure is attributed to, if any.
    pub fn entity(&self) -> Option<&str> {
        match self {
            LoadError::MissingSource { entity, .. }
            | LoadError::Source { entity, .. }
            | LoadError::Staging { entity, .. }
            | LoadError::Submission { entity, .. }
            | LoadError::Cancelled { entity } => Some(entity.as_str()),
            LoadError::Connection { .. } | LoadError::Clear { .. } => None,
        }
    }
}

/// A fail-fast load that stopped partway through the plan.
///
/// `results` holds every result collected before the failure, followed by a
/// `Failed` result for the entity that stopped the run.
#[derive(Debug, thiserror::Error)]
#[error("{source} ({} of the plan's entities processed)", .results.len())]
pub struct PartialLoad {
    pub results: Vec<LoadResult>,
    #[source]
    pub source: LoadError,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_server_message_carries_cause() {
        let message = server_message(
            "ERROR",
            "invalid input syntax for type boolean: \"notabool\"",
            None,
            Some("COPY facilities, line 2, column is_active: \"notabool\""),
        );

        assert_eq!(
            message,
            "ERROR: invalid input syntax for type boolean: \"notabool\" \
             [COPY facilities, line 2, column is_active: \"notabool\"]"
        );

        let copy = DestinationError::Copy(server_message(
            "ERROR",
            "duplicate key value violates unique constraint \"facilities_pkey\"",
            Some("Key (facility_id)=(1) already exists."),
            None,
        ));
        assert_eq!(
            copy.to_string(),
            "COPY stream failed: ERROR: duplicate key value violates unique constraint \
             \"facilities_pkey\" (Key (facility_id)=(1) already exists.)"
        );
    }

    #[test]
    fn test_destination_errors_have_no_source() {
        let error = DestinationError::from(std::io::Error::other("broken pipe"));

        assert_eq!(error.to_string(), "I/O error: broken pipe");
        assert!(std::error::Error::source(&error).is_none());
    }

    #[test]
    fn test_display_chain_does_not_repeat_causes() {
        let error = LoadError::Submission {
            entity: "facilities".to_string(),
            relation: "ods.facilities".to_string(),
            source: DestinationError::Rejected("relation \"ods.facilities\" does not exist".to_string()),
        };

        assert_eq!(
            display_chain(&error),
            "Failed to load 'facilities' into ods.facilities: relation \"ods.facilities\" does not exist"
        );

        let wrapped = anyhow::Error::new(error).context("Load task failed");
        assert_eq!(
            display_chain(&*wrapped),
            "Load task failed: Failed to load 'facilities' into ods.facilities: \
             relation \"ods.facilities\" does not exist"
        );
    }
}
