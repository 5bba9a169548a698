//! Dependency graph for entity load order
//!
//! Builds a directed acyclic graph (DAG) from entity descriptors
//! and computes the topological load order.

use crate::error::PlanError;
use crate::plan::EntityDescriptor;
use indexmap::IndexMap;
use std::collections::{HashMap, HashSet};

#[derive(Debug, Clone)]
pub struct DependencyNode {
    pub entity: String,
    pub depends_on: Vec<String>,
    pub level: usize,
}

#[derive(Debug, Clone)]
pub struct DependencyGraph {
    /// Nodes keyed by entity name, in declaration order.
    pub nodes: IndexMap<String, DependencyNode>,
    pub levels: Vec<Vec<String>>,
}

impl DependencyGraph {
    /// Build dependency graph from entity descriptors
    pub fn build(entities: &[EntityDescriptor]) -> Result<Self, PlanError> {
        let mut nodes = IndexMap::new();

        for entity in entities {
            if nodes.contains_key(&entity.name) {
                return Err(PlanError::DuplicateEntity(entity.name.clone()));
            }

            let mut depends_on = Vec::new();
            for dep in &entity.depends_on {
                if dep == &entity.name {
                    return Err(PlanError::SelfDependency(entity.name.clone()));
                }
                if !depends_on.contains(dep) {
                    depends_on.push(dep.clone());
                }
            }

            nodes.insert(
                entity.name.clone(),
                DependencyNode {
                    entity: entity.name.clone(),
                    depends_on,
                    level: 0, // Will be computed
                },
            );
        }

        // Every edge must point at a declared entity
        for node in nodes.values() {
            for dep in &node.depends_on {
                if !nodes.contains_key(dep) {
                    return Err(PlanError::UnknownDependency {
                        entity: node.entity.clone(),
                        dependency: dep.clone(),
                    });
                }
            }
        }

        let levels = Self::compute_levels(&nodes)?;

        for (level_num, level_entities) in levels.iter().enumerate() {
            for entity_name in level_entities {
                if let Some(node) = nodes.get_mut(entity_name) {
                    node.level = level_num;
                }
            }
        }

        Ok(DependencyGraph { nodes, levels })
    }

    /// Compute load levels using topological sort (Kahn's algorithm).
    ///
    /// Entities inside a level keep their declaration order.
    fn compute_levels(
        nodes: &IndexMap<String, DependencyNode>,
    ) -> Result<Vec<Vec<String>>, PlanError> {
        // Build reverse dependency map (who depends on this entity)
        let mut reverse_deps: HashMap<&str, Vec<&str>> = HashMap::new();
        let mut in_degree: HashMap<&str, usize> = HashMap::new();

        for (entity_name, node) in nodes {
            in_degree.insert(entity_name.as_str(), node.depends_on.len());

            for dep in &node.depends_on {
                reverse_deps
                    .entry(dep.as_str())
                    .or_default()
                    .push(entity_name.as_str());
            }
        }

        let mut current: Vec<&str> = nodes
            .keys()
            .map(String::as_str)
            .filter(|name| in_degree.get(name) == Some(&0))
            .collect();

        let mut levels: Vec<Vec<String>> = Vec::new();
        let mut processed = HashSet::new();

        while !current.is_empty() {
            let mut next = Vec::new();

            for entity_name in &current {
                processed.insert(*entity_name);

                // Reduce in-degree for dependents
                if let Some(dependents) = reverse_deps.get(entity_name) {
                    for dependent in dependents {
                        if let Some(degree) = in_degree.get_mut(dependent) {
                            *degree -= 1;
                            if *degree == 0 {
                                next.push(*dependent);
                            }
                        }
                    }
                }
            }

            levels.push(current.iter().map(|s| s.to_string()).collect());

            next.sort_by_key(|name| nodes.get_index_of(*name));
            current = next;
        }

        // Check for cycles
        if processed.len() != nodes.len() {
            let unprocessed: Vec<String> = nodes
                .keys()
                .filter(|k| !processed.contains(k.as_str()))
                .cloned()
                .collect();
            return Err(PlanError::Cycle(unprocessed));
        }

        Ok(levels)
    }

    /// Get entities at a specific level
    pub fn get_level(&self, level: usize) -> Option<&Vec<String>> {
        self.levels.get(level)
    }

    /// Get total number of levels
    pub fn num_levels(&self) -> usize {
        self.levels.len()
    }

    /// Get all entities in load order (flattened levels)
    pub fn processing_order(&self) -> Vec<String> {
        self.levels.iter().flatten().cloned().collect()
    }

    /// Check if an entity depends on another entity (directly or indirectly)
    pub fn depends_on(&self, entity: &str, dependency: &str) -> bool {
        if let Some(node) = self.nodes.get(entity) {
            if node.depends_on.iter().any(|d| d == dependency) {
                return true;
            }
            // Check transitive dependencies
            for dep in &node.depends_on {
                if self.depends_on(dep, dependency) {
                    return true;
                }
            }
        }
        false
    }
}
