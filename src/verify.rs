//! Post-load integrity verification.
//!
//! Each [`IntegrityCheck`] evaluates to a count. Checks with an expected value
//! pass when the observed count matches it; informational checks are only
//! reported. A check whose query cannot run is recorded as an error and the
//! remaining checks still run.

use chrono::NaiveDate;
use serde::{Deserialize, Serialize};
use std::fmt;

use crate::destination::{quote_ident, quote_relation, Destination};
use crate::report::{EventSink, LoadEvent};

/// The query behind a check.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum CheckQuery {
    /// Rows of `relation` whose non-null `column` matches no row of `references`.
    DanglingReference {
        relation: String,
        column: String,
        references: String,
        referenced_column: String,
    },
    /// Rows whose date `column` is null or in the future.
    InvalidDate { relation: String, column: String },
    /// Rows of `relation`, optionally filtered by a SQL predicate.
    RowCount {
        relation: String,
        #[serde(default)]
        filter: Option<String>,
    },
    /// Any scalar query returning a number.
    Sql { query: String },
}

impl CheckQuery {
    /// Render as a query returning one `count` column.
    pub fn to_sql(&self) -> String {
        match self {
            CheckQuery::DanglingReference {
                relation,
                column,
                references,
                referenced_column,
            } => format!(
                "SELECT COUNT(*) AS count FROM {} c LEFT JOIN {} p ON c.{col} = p.{ref_col} \
                 WHERE c.{col} IS NOT NULL AND p.{ref_col} IS NULL",
                quote_relation(relation),
                quote_relation(references),
                col = quote_ident(column),
                ref_col = quote_ident(referenced_column),
            ),
            CheckQuery::InvalidDate { relation, column } => format!(
                "SELECT COUNT(*) AS count FROM {} WHERE {col} IS NULL OR {col} > CURRENT_DATE",
                quote_relation(relation),
                col = quote_ident(column),
            ),
            CheckQuery::RowCount { relation, filter } => match filter {
                Some(filter) => format!(
                    "SELECT COUNT(*) AS count FROM {} WHERE {}",
                    quote_relation(relation),
                    filter
                ),
                None => format!("SELECT COUNT(*) AS count FROM {}", quote_relation(relation)),
            },
            CheckQuery::Sql { query } => {
                format!("SELECT COALESCE(({}), 0)::bigint AS count", query)
            }
        }
    }

    /// Rewrite every relation name the query refers to.
    pub fn map_relations<F: Fn(&str) -> String>(&mut self, f: F) {
        match self {
            CheckQuery::DanglingReference {
                relation,
                references,
                ..
            } => {
                *relation = f(relation);
                *references = f(references);
            }
            CheckQuery::InvalidDate { relation, .. } | CheckQuery::RowCount { relation, .. } => {
                *relation = f(relation);
            }
            CheckQuery::Sql { .. } => {}
        }
    }
}

/// A named check and what it should evaluate to.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IntegrityCheck {
    pub name: String,
    #[serde(flatten)]
    pub query: CheckQuery,
    /// Expected count; zero when omitted.
    #[serde(default)]
    pub expected: Option<i64>,
    /// Report the count without judging it.
    #[serde(default)]
    pub informational: bool,
}

impl IntegrityCheck {
    pub fn expecting(name: &str, query: CheckQuery, expected: i64) -> Self {
        IntegrityCheck {
            name: name.to_string(),
            query,
            expected: Some(expected),
            informational: false,
        }
    }

    pub fn informational(name: &str, query: CheckQuery) -> Self {
        IntegrityCheck {
            name: name.to_string(),
            query,
            expected: None,
            informational: true,
        }
    }

    pub fn expectation(&self) -> Expectation {
        if self.informational {
            Expectation::Informational
        } else {
            Expectation::Exactly(self.expected.unwrap_or(0))
        }
    }
}

/// What a check's count is judged against.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Expectation {
    Exactly(i64),
    Informational,
}

impl Expectation {
    pub fn count(&self) -> Option<i64> {
        match self {
            Expectation::Exactly(n) => Some(*n),
            Expectation::Informational => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum Verdict {
    Passed,
    Failed,
    Informational,
    Error { message: String },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CheckOutcome {
    pub name: String,
    pub observed: Option<i64>,
    pub expected: Option<i64>,
    #[serde(flatten)]
    pub verdict: Verdict,
}

impl CheckOutcome {
    /// Informational outcomes count as passing.
    pub fn is_passing(&self) -> bool {
        matches!(self.verdict, Verdict::Passed | Verdict::Informational)
    }
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct VerificationReport {
    pub outcomes: Vec<CheckOutcome>,
    pub all_passed: bool,
}

impl VerificationReport {
    pub fn failures(&self) -> impl Iterator<Item = &CheckOutcome> {
        self.outcomes.iter().filter(|o| !o.is_passing())
    }

    pub fn outcome(&self, name: &str) -> Option<&CheckOutcome> {
        self.outcomes.iter().find(|o| o.name == name)
    }
}

/// A date column whose earliest and latest values are reported after a run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct DateRange {
    pub name: String,
    pub relation: String,
    pub column: String,
}

impl DateRange {
    /// Render as a query returning `earliest` and `latest` as ISO dates.
    pub fn to_sql(&self) -> String {
        format!(
            "SELECT MIN({col})::date::text AS earliest, MAX({col})::date::text AS latest FROM {}",
            quote_relation(&self.relation),
            col = quote_ident(&self.column),
        )
    }
}

/// Measured bounds of a [`DateRange`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DateSpan {
    pub name: String,
    pub earliest: Option<NaiveDate>,
    pub latest: Option<NaiveDate>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl DateSpan {
    pub fn measured(range: &DateRange, earliest: Option<NaiveDate>, latest: Option<NaiveDate>) -> Self {
        DateSpan {
            name: range.name.clone(),
            earliest,
            latest,
            error: None,
        }
    }

    pub fn unavailable(range: &DateRange, message: String) -> Self {
        DateSpan {
            name: range.name.clone(),
            earliest: None,
            latest: None,
            error: Some(message),
        }
    }
}

/// `earliest to latest`, `no data`, or the error that prevented measuring.
impl fmt::Display for DateSpan {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match (&self.error, self.earliest, self.latest) {
            (Some(message), _, _) => write!(f, "ERROR - {}", message),
            (None, Some(earliest), Some(latest)) => write!(f, "{} to {}", earliest, latest),
            _ => write!(f, "no data"),
        }
    }
}

/// Runs a fixed set of checks against a destination.
pub struct IntegrityVerifier<'a> {
    checks: &'a [IntegrityCheck],
}

impl<'a> IntegrityVerifier<'a> {
    pub fn new(checks: &'a [IntegrityCheck]) -> Self {
        IntegrityVerifier { checks }
    }

    /// Evaluate every check; individual failures never stop the run.
    pub fn verify<D: Destination>(&self, dest: &mut D, sink: &dyn EventSink) -> VerificationReport {
        let mut outcomes = Vec::with_capacity(self.checks.len());

        for check in self.checks {
            let expectation = check.expectation();
            let expected = expectation.count();

            let outcome = match dest.evaluate(&check.query) {
                Ok(observed) => CheckOutcome {
                    name: check.name.clone(),
                    observed: Some(observed),
                    expected,
                    verdict: match expectation {
                        Expectation::Informational => Verdict::Informational,
                        Expectation::Exactly(n) if n == observed => Verdict::Passed,
                        Expectation::Exactly(_) => Verdict::Failed,
                    },
                },
                Err(e) => CheckOutcome {
                    name: check.name.clone(),
                    observed: None,
                    expected,
                    verdict: Verdict::Error {
                        message: e.to_string(),
                    },
                },
            };

            sink.emit(&LoadEvent::CheckEvaluated {
                outcome: outcome.clone(),
            });
            outcomes.push(outcome);
        }

        let all_passed = outcomes.iter().all(CheckOutcome::is_passing);

        VerificationReport {
            outcomes,
            all_passed,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_dangling_reference_sql() {
        let query = CheckQuery::DanglingReference {
            relation: "ods.equipment".to_string(),
            column: "facility_id".to_string(),
            references: "ods.facilities".to_string(),
            referenced_column: "facility_id".to_string(),
        };

        assert_eq!(
            query.to_sql(),
            "SELECT COUNT(*) AS count FROM \"ods\".\"equipment\" c LEFT JOIN \"ods\".\"facilities\" p \
             ON c.\"facility_id\" = p.\"facility_id\" \
             WHERE c.\"facility_id\" IS NOT NULL AND p.\"facility_id\" IS NULL"
        );
    }

    #[test]
    fn test_invalid_date_and_row_count_sql() {
        let invalid = CheckQuery::InvalidDate {
            relation: "ods.members".to_string(),
            column: "date_of_birth".to_string(),
        };
        assert!(invalid.to_sql().ends_with(
            "WHERE \"date_of_birth\" IS NULL OR \"date_of_birth\" > CURRENT_DATE"
        ));

        let count = CheckQuery::RowCount {
            relation: "ods.staff".to_string(),
            filter: Some("status = 'Active'".to_string()),
        };
        assert_eq!(
            count.to_sql(),
            "SELECT COUNT(*) AS count FROM \"ods\".\"staff\" WHERE status = 'Active'"
        );

        let custom = CheckQuery::Sql {
            query: "SELECT MAX(member_id) FROM ods.members".to_string(),
        };
        assert_eq!(
            custom.to_sql(),
            "SELECT COALESCE((SELECT MAX(member_id) FROM ods.members), 0)::bigint AS count"
        );
    }

    #[test]
    fn test_date_range_sql() {
        let range = DateRange {
            name: "Enrollments".to_string(),
            relation: "ods.class_enrollments".to_string(),
            column: "class_date".to_string(),
        };

        assert_eq!(
            range.to_sql(),
            "SELECT MIN(\"class_date\")::date::text AS earliest, \
             MAX(\"class_date\")::date::text AS latest FROM \"ods\".\"class_enrollments\""
        );
    }

    #[test]
    fn test_date_span_rendering() {
        let range = DateRange {
            name: "Equipment Usage".to_string(),
            relation: "equipment_usage".to_string(),
            column: "usage_date".to_string(),
        };

        let span = DateSpan::measured(
            &range,
            NaiveDate::from_ymd_opt(2024, 1, 5),
            NaiveDate::from_ymd_opt(2024, 6, 30),
        );
        assert_eq!(span.to_string(), "2024-01-05 to 2024-06-30");
        assert_eq!(DateSpan::measured(&range, None, None).to_string(), "no data");

        let failed = DateSpan::unavailable(&range, "relation does not exist".to_string());
        assert_eq!(failed.to_string(), "ERROR - relation does not exist");

        let json = serde_json::to_value(&span).unwrap();
        assert_eq!(json["earliest"], "2024-01-05");
        assert!(json.get("error").is_none());
    }

    #[test]
    fn test_expectation() {
        let query = CheckQuery::RowCount {
            relation: "members".to_string(),
            filter: None,
        };
        assert_eq!(
            IntegrityCheck::expecting("rows", query.clone(), 3).expectation(),
            Expectation::Exactly(3)
        );
        assert_eq!(
            IntegrityCheck::informational("rows", query).expectation(),
            Expectation::Informational
        );
    }

    #[test]
    fn test_check_deserializes_from_yaml() {
        let yaml = r#"
name: Equipment → Facilities
kind: dangling_reference
relation: equipment
column: facility_id
references: facilities
referenced_column: facility_id
"#;
        let check: IntegrityCheck = serde_yaml::from_str(yaml).unwrap();

        assert_eq!(check.name, "Equipment → Facilities");
        assert_eq!(check.expectation(), Expectation::Exactly(0));
        assert!(matches!(check.query, CheckQuery::DanglingReference { .. }));
    }

    #[test]
    fn test_outcome_serializes_verdict_inline() {
        let outcome = CheckOutcome {
            name: "Equipment → Facilities".to_string(),
            observed: None,
            expected: Some(0),
            verdict: Verdict::Error {
                message: "relation \"ods.equipment\" does not exist".to_string(),
            },
        };

        let json = serde_json::to_value(&outcome).unwrap();
        assert_eq!(json["status"], "error");
        assert_eq!(json["expected"], 0);
        assert!(json["message"].as_str().unwrap().contains("does not exist"));
    }
}
