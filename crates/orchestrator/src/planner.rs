//! Execution planning: turn a set of engines into ordered parallel waves.
//!
//! Rules enforced:
//! 1. Every requested engine must be registered.
//! 2. The induced dependency graph must be acyclic (layering must place every engine).
//! 3. Each wave only depends on earlier waves; dependencies outside the
//!    requested set count as already satisfied.
//!
//! Within a wave engines are ordered by registry declaration order, so the
//! plan is a pure, deterministic function of its inputs.

use std::collections::{BTreeSet, HashMap};

use serde::{Deserialize, Serialize};

use crate::{ConfigurationError, EngineRegistry};

/// An ordered sequence of waves. Engines inside one wave are independent.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExecutionPlan {
    waves: Vec<Vec<String>>,
}

impl ExecutionPlan {
    pub fn waves(&self) -> &[Vec<String>] {
        &self.waves
    }

    /// All engines in execution order.
    pub fn engines(&self) -> impl Iterator<Item = &str> {
        self.waves.iter().flatten().map(String::as_str)
    }

    pub fn contains(&self, engine: &str) -> bool {
        self.engines().any(|name| name == engine)
    }

    pub fn len(&self) -> usize {
        self.waves.iter().map(Vec::len).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.waves.is_empty()
    }
}

/// One vertex handed to [`plan_waves`]. The slice position is the tie-break
/// order.
#[derive(Debug, Clone)]
pub struct PlanNode<'a> {
    pub name: &'a str,
    pub depends_on: Vec<&'a str>,
}

/// Plan `required` against the registry snapshot.
///
/// # Errors
/// - [`ConfigurationError::UnknownEngine`] if a name isn't registered.
/// - [`ConfigurationError::CyclicDependency`] if the induced graph has a cycle.
pub fn plan(
    registry: &EngineRegistry,
    required: &BTreeSet<String>,
) -> Result<ExecutionPlan, ConfigurationError> {
    let mut nodes = Vec::with_capacity(required.len());
    for name in required {
        let descriptor = registry
            .descriptor(name)
            .ok_or_else(|| ConfigurationError::UnknownEngine(name.clone()))?;
        let order = registry.declaration_index(name).unwrap_or(usize::MAX);
        nodes.push((
            order,
            PlanNode {
                name: descriptor.name.as_str(),
                depends_on: descriptor.depends_on.iter().map(String::as_str).collect(),
            },
        ));
    }
    nodes.sort_by_key(|(order, _)| *order);
    let nodes: Vec<PlanNode<'_>> = nodes.into_iter().map(|(_, node)| node).collect();

    Ok(ExecutionPlan {
        waves: plan_waves(&nodes)?,
    })
}

/// Layered topological sort (Kahn's algorithm) over `nodes`.
///
/// Edges to names outside `nodes` are ignored. Each wave keeps the relative
/// order of `nodes`.
///
/// # Errors
/// [`ConfigurationError::CyclicDependency`] listing the engines that could
/// not be placed.
pub fn plan_waves(nodes: &[PlanNode<'_>]) -> Result<Vec<Vec<String>>, ConfigurationError> {
    // -----------------------------------------------------------------------
    // 1. Index the induced subgraph
    // -----------------------------------------------------------------------
    let position: HashMap<&str, usize> = nodes
        .iter()
        .enumerate()
        .map(|(idx, node)| (node.name, idx))
        .collect();

    let mut dependents: Vec<Vec<usize>> = vec![Vec::new(); nodes.len()];
    let mut in_degree: Vec<usize> = vec![0; nodes.len()];

    for (idx, node) in nodes.iter().enumerate() {
        let internal: BTreeSet<usize> = node
            .depends_on
            .iter()
            .filter_map(|dep| position.get(dep).copied())
            .collect();
        in_degree[idx] = internal.len();
        for dep in internal {
            dependents[dep].push(idx);
        }
    }

    // -----------------------------------------------------------------------
    // 2. Peel off zero in-degree layers
    // -----------------------------------------------------------------------
    let mut current: Vec<usize> = (0..nodes.len()).filter(|&idx| in_degree[idx] == 0).collect();
    let mut waves: Vec<Vec<String>> = Vec::new();
    let mut placed = 0usize;

    while !current.is_empty() {
        placed += current.len();

        let mut next: Vec<usize> = Vec::new();
        for &idx in &current {
            for &dependent in &dependents[idx] {
                in_degree[dependent] -= 1;
                if in_degree[dependent] == 0 {
                    next.push(dependent);
                }
            }
        }
        next.sort_unstable();

        waves.push(current.iter().map(|&idx| nodes[idx].name.to_owned()).collect());
        current = next;
    }

    // Anything left over sits on a cycle (or behind one).
    if placed != nodes.len() {
        let engines = (0..nodes.len())
            .filter(|&idx| in_degree[idx] > 0)
            .map(|idx| nodes[idx].name.to_owned())
            .collect();
        return Err(ConfigurationError::CyclicDependency { engines });
    }

    Ok(waves)
}
