//! Plan configuration loader.
//!
//! Loads the entity graph, source settings and integrity checks from YAML
//! and turns them into an ordered [`LoadPlan`].

use indexmap::IndexMap;
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;
use std::sync::OnceLock;

use crate::error::PlanError;
use crate::plan::{
    EntityDescriptor, LoadPlan, SourceSettings, StrategyKind, DEFAULT_PAGE_SIZE,
};
use crate::verify::{DateRange, IntegrityCheck};

/// Plan for the fitness-center ODS, compiled into the binary.
pub const BUILTIN_PLAN: &str = include_str!("../../config/fitness_center.yaml");

/// Top-level plan file.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PlanConfig {
    /// Schema prefixed to entity names that do not set `relation`.
    #[serde(default)]
    pub schema: Option<String>,

    #[serde(default = "default_extension")]
    pub source_extension: String,

    #[serde(default = "default_delimiter")]
    pub delimiter: char,

    /// Abort before loading when any source file is missing.
    #[serde(default)]
    pub strict_sources: bool,

    #[serde(default = "default_strategy")]
    pub default_strategy: StrategyKind,

    #[serde(default = "default_page_size")]
    pub page_size: usize,

    /// Datetime-bearing columns, applied to every entity that has them.
    #[serde(default)]
    pub datetime_columns: Vec<String>,

    pub entities: Vec<EntityConfig>,

    #[serde(default)]
    pub integrity_checks: Vec<IntegrityCheck>,

    /// Date columns whose earliest and latest values are reported.
    #[serde(default)]
    pub date_ranges: Vec<DateRange>,
}

/// One entity as written in the plan file.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct EntityConfig {
    pub name: String,

    #[serde(default)]
    pub relation: Option<String>,

    #[serde(default)]
    pub depends_on: Vec<String>,

    #[serde(default)]
    pub strategy: Option<StrategyKind>,

    #[serde(default)]
    pub page_size: Option<usize>,

    /// Source column -> destination column.
    #[serde(default)]
    pub columns: IndexMap<String, String>,

    #[serde(default)]
    pub datetime_columns: Vec<String>,
}

fn default_extension() -> String {
    "csv".to_string()
}

fn default_delimiter() -> char {
    ','
}

fn default_strategy() -> StrategyKind {
    StrategyKind::BulkCopy
}

fn default_page_size() -> usize {
    DEFAULT_PAGE_SIZE
}

fn identifier_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| {
        Regex::new(r"^[A-Za-z_][A-Za-z0-9_$]*(\.[A-Za-z_][A-Za-z0-9_$]*)?$")
            .expect("identifier pattern is valid")
    })
}

fn validate_identifier(identifier: &str, context: &str) -> Result<(), PlanError> {
    if identifier_pattern().is_match(identifier) {
        Ok(())
    } else {
        Err(PlanError::InvalidIdentifier {
            identifier: identifier.to_string(),
            context: context.to_string(),
        })
    }
}

impl PlanConfig {
    /// Parse a plan from YAML text.
    pub fn from_yaml(contents: &str) -> Result<Self, PlanError> {
        Ok(serde_yaml::from_str(contents)?)
    }

    /// Load a plan from a YAML file.
    ///
    /// # Example
    /// ```ignore
    /// use odsloader::plan::PlanConfig;
    ///
    /// let plan = PlanConfig::load_from_file("config/fitness_center.yaml")?.into_plan()?;
    /// println!("Load order: {:?}", plan.graph().processing_order());
    /// ```
    pub fn load_from_file<P: AsRef<Path>>(path: P) -> Result<Self, PlanError> {
        let path = path.as_ref();

        let contents = fs::read_to_string(path).map_err(|source| PlanError::Io {
            path: path.to_path_buf(),
            source,
        })?;

        Self::from_yaml(&contents)
    }

    /// Relation an entity name resolves to.
    fn relation_for(&self, name: &str, explicit: Option<&str>) -> String {
        match (explicit, &self.schema) {
            (Some(relation), _) => relation.to_string(),
            (None, Some(schema)) => format!("{}.{}", schema, name),
            (None, None) => name.to_string(),
        }
    }

    /// Validate the configuration and compute the load order.
    pub fn into_plan(self) -> Result<LoadPlan, PlanError> {
        if !self.delimiter.is_ascii() {
            return Err(PlanError::InvalidDelimiter(self.delimiter));
        }
        if let Some(ref schema) = self.schema {
            validate_identifier(schema, "plan schema")?;
        }

        let mut descriptors = Vec::with_capacity(self.entities.len());

        for entity in &self.entities {
            validate_identifier(&entity.name, "entity name")?;

            let relation = self.relation_for(&entity.name, entity.relation.as_deref());
            validate_identifier(&relation, &format!("relation of '{}'", entity.name))?;

            for destination in entity.columns.values() {
                validate_identifier(destination, &format!("column map of '{}'", entity.name))?;
            }

            let page_size = entity.page_size.unwrap_or(self.page_size);
            if page_size == 0 {
                return Err(PlanError::ZeroPageSize(entity.name.clone()));
            }

            let mut datetime_columns = self.datetime_columns.clone();
            for column in &entity.datetime_columns {
                if !datetime_columns.contains(column) {
                    datetime_columns.push(column.clone());
                }
            }

            descriptors.push(EntityDescriptor {
                name: entity.name.clone(),
                relation,
                depends_on: entity.depends_on.clone(),
                strategy: entity
                    .strategy
                    .unwrap_or(self.default_strategy)
                    .with_page_size(page_size),
                column_map: entity.columns.clone(),
                datetime_columns,
            });
        }

        // Checks and date ranges name entities; point them at the entities' relations.
        let relation_of = |name: &str| match descriptors.iter().find(|d| d.name == name) {
            Some(descriptor) => descriptor.relation.clone(),
            None => name.to_string(),
        };

        let mut checks = self.integrity_checks.clone();
        for check in &mut checks {
            check.query.map_relations(relation_of);
        }

        let mut date_ranges = self.date_ranges.clone();
        for range in &mut date_ranges {
            validate_identifier(&range.column, &format!("date range '{}'", range.name))?;
            range.relation = relation_of(&range.relation);
            validate_identifier(&range.relation, &format!("date range '{}'", range.name))?;
        }

        let source = SourceSettings {
            extension: self.source_extension.clone(),
            delimiter: self.delimiter as u8,
        };

        let mut plan = LoadPlan::new(descriptors, checks, source)?.with_date_ranges(date_ranges);
        plan.strict_sources = self.strict_sources;
        Ok(plan)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::plan::SubmissionStrategy;
    use crate::verify::CheckQuery;

    const SMALL_PLAN: &str = r#"
schema: ods
default_strategy: batched_insert
page_size: 500
datetime_columns: [join_date]
entities:
  - name: members
    depends_on: [facilities]
    columns:
      dob: date_of_birth
    datetime_columns: [dob]
  - name: facilities
    strategy: bulk_copy
integrity_checks:
  - name: Members → Facilities
    kind: dangling_reference
    relation: members
    column: home_facility_id
    references: facilities
    referenced_column: facility_id
  - name: Active Facilities
    kind: row_count
    relation: facilities
    filter: "is_active = true"
    informational: true
date_ranges:
  - name: Members joined
    relation: members
    column: join_date
"#;

    #[test]
    fn test_into_plan_resolves_relations_and_order() {
        let plan = PlanConfig::from_yaml(SMALL_PLAN).unwrap().into_plan().unwrap();

        let names: Vec<_> = plan.order().iter().map(|e| e.name.as_str()).collect();
        assert_eq!(names, vec!["facilities", "members"]);

        let members = plan.entity("members").unwrap();
        assert_eq!(members.relation, "ods.members");
        assert_eq!(members.strategy, SubmissionStrategy::BatchedInsert { page_size: 500 });
        assert_eq!(members.datetime_columns, vec!["join_date", "dob"]);
        assert_eq!(members.destination_column("dob"), "date_of_birth");

        let facilities = plan.entity("facilities").unwrap();
        assert_eq!(facilities.strategy, SubmissionStrategy::BulkCopy);
    }

    #[test]
    fn test_checks_point_at_relations() {
        let plan = PlanConfig::from_yaml(SMALL_PLAN).unwrap().into_plan().unwrap();

        match &plan.checks()[0].query {
            CheckQuery::DanglingReference { relation, references, .. } => {
                assert_eq!(relation, "ods.members");
                assert_eq!(references, "ods.facilities");
            }
            other => panic!("unexpected query {other:?}"),
        }
        assert!(plan.checks()[1].informational);

        assert_eq!(plan.date_ranges().len(), 1);
        assert_eq!(plan.date_ranges()[0].relation, "ods.members");
    }

    #[test]
    fn test_rejects_bad_identifiers() {
        let yaml = "entities:\n  - name: \"members; DROP TABLE x\"\n";
        let err = PlanConfig::from_yaml(yaml).unwrap().into_plan().unwrap_err();
        assert!(matches!(err, PlanError::InvalidIdentifier { .. }));
    }

    #[test]
    fn test_rejects_zero_page_size() {
        let yaml = "page_size: 0\nentities:\n  - name: members\n";
        let err = PlanConfig::from_yaml(yaml).unwrap().into_plan().unwrap_err();
        assert!(matches!(err, PlanError::ZeroPageSize(name) if name == "members"));
    }

    #[test]
    fn test_unknown_entity_field_is_an_error() {
        let yaml = "entities:\n  - name: members\n    dependson: [facilities]\n";
        assert!(PlanConfig::from_yaml(yaml).is_err());
    }

    #[test]
    fn test_builtin_plan_parses() {
        let config = PlanConfig::from_yaml(BUILTIN_PLAN).unwrap();
        assert_eq!(config.schema.as_deref(), Some("ods"));
        assert_eq!(config.entities.len(), 8);

        let plan = config.into_plan().unwrap();
        assert_eq!(plan.len(), 8);
        assert!(!plan.checks().is_empty());
        let ranges: Vec<_> = plan.date_ranges().iter().map(|r| r.relation.as_str()).collect();
        assert_eq!(ranges, vec!["ods.class_enrollments", "ods.equipment_usage"]);
    }
}
