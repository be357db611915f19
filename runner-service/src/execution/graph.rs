// Step Graph (DAG)
// Validates step dependencies before execution

use crate::ir::Spec;

use std::collections::{HashMap, HashSet};
use std::fmt;

/// Error type for graph operations
#[derive(Debug, Clone)]
pub struct GraphError {
    pub message: String,
    pub kind: GraphErrorKind,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum GraphErrorKind {
    /// Circular dependency detected
    CyclicDependency,
    /// Reference to unknown step
    UnknownDependency,
    /// Two steps share a name
    DuplicateName,
}

impl fmt::Display for GraphError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "graph error: {}", self.message)
    }
}

impl std::error::Error for GraphError {}

impl GraphError {
    pub fn cyclic(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            kind: GraphErrorKind::CyclicDependency,
        }
    }

    pub fn unknown_dependency(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            kind: GraphErrorKind::UnknownDependency,
        }
    }

    pub fn duplicate(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            kind: GraphErrorKind::DuplicateName,
        }
    }
}

/// A vertex of the step graph
#[derive(Debug, Clone)]
pub struct StepNode {
    pub name: String,
    /// Names of steps this step depends on
    pub dependencies: Vec<String>,
}

/// Directed acyclic graph of steps keyed by name
#[derive(Debug, Clone)]
pub struct StepGraph {
    /// Nodes in source order
    pub nodes: Vec<StepNode>,
    /// Quick lookup of node index by name
    indices: HashMap<String, usize>,
}

impl StepGraph {
    /// Build and validate a graph from `(name, dependencies)` pairs
    pub fn new<I, N, D>(nodes: I) -> Result<Self, GraphError>
    where
        I: IntoIterator<Item = (N, D)>,
        N: Into<String>,
        D: IntoIterator,
        D::Item: Into<String>,
    {
        let mut graph = Self {
            nodes: Vec::new(),
            indices: HashMap::new(),
        };

        for (name, deps) in nodes {
            let name = name.into();
            if graph.indices.contains_key(&name) {
                return Err(GraphError::duplicate(format!(
                    "duplicate step name '{}'",
                    name
                )));
            }
            graph.indices.insert(name.clone(), graph.nodes.len());
            graph.nodes.push(StepNode {
                name,
                dependencies: deps.into_iter().map(Into::into).collect(),
            });
        }

        graph.validate()?;
        Ok(graph)
    }

    /// Build the graph of a compiled spec
    pub fn from_spec(spec: &Spec) -> Result<Self, GraphError> {
        Self::new(
            spec.steps
                .iter()
                .map(|s| (s.name.clone(), s.depends_on.clone())),
        )
    }

    /// Validate the graph (unknown dependencies and cycles)
    pub fn validate(&self) -> Result<(), GraphError> {
        for node in &self.nodes {
            for dep in &node.dependencies {
                if !self.indices.contains_key(dep) {
                    return Err(GraphError::unknown_dependency(format!(
                        "step '{}' depends on unknown step '{}'",
                        node.name, dep
                    )));
                }
            }
        }

        self.detect_cycles()
    }

    /// Detect cycles using DFS
    fn detect_cycles(&self) -> Result<(), GraphError> {
        let mut visited = HashSet::new();
        let mut rec_stack = HashSet::new();

        for node in &self.nodes {
            if !visited.contains(&node.name) {
                if let Some(cycle) = self.dfs_cycle(node, &mut visited, &mut rec_stack) {
                    return Err(GraphError::cyclic(format!(
                        "circular dependency detected in steps: {}",
                        cycle.join(" -> ")
                    )));
                }
            }
        }

        Ok(())
    }

    fn dfs_cycle(
        &self,
        node: &StepNode,
        visited: &mut HashSet<String>,
        rec_stack: &mut HashSet<String>,
    ) -> Option<Vec<String>> {
        visited.insert(node.name.clone());
        rec_stack.insert(node.name.clone());

        for dep in &node.dependencies {
            if !visited.contains(dep) {
                if let Some(idx) = self.indices.get(dep) {
                    if let Some(mut cycle) = self.dfs_cycle(&self.nodes[*idx], visited, rec_stack)
                    {
                        cycle.insert(0, node.name.clone());
                        return Some(cycle);
                    }
                }
            } else if rec_stack.contains(dep) {
                return Some(vec![node.name.clone(), dep.clone()]);
            }
        }

        rec_stack.remove(&node.name);
        None
    }
}
