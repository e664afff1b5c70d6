//! Validated set of service specifications

use crate::graph::DependencyGraph;
use crate::service::ServiceSpec;
use crate::types::ServiceName;
use std::collections::HashMap;
use std::sync::Arc;
use thiserror::Error;

/// Errors raised while loading service specifications. Nothing is applied
/// when loading fails.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ValidationError {
    /// A service was declared with an empty name
    #[error("service #{position} has an empty name")]
    EmptyName {
        /// Zero-based declaration position
        position: usize,
    },
    /// Two services share a name
    #[error("service {0} is declared more than once")]
    DuplicateName(ServiceName),
    /// A dependency names a service that is not declared
    #[error("service {service} depends on undeclared service {dependency}")]
    UnknownDependency {
        /// Declaring service
        service: ServiceName,
        /// Missing dependency
        dependency: ServiceName,
    },
    /// Dependencies form a cycle; the path starts and ends on the same service
    #[error("dependency cycle: {}", path.join(" -> "))]
    Cycle {
        /// Every service on the cycle, closed by repeating the first one
        path: Vec<ServiceName>,
    },
}

/// Immutable, validated service registry.
#[derive(Debug, Clone)]
pub struct Registry {
    specs: Vec<Arc<ServiceSpec>>,
    index: HashMap<ServiceName, usize>,
    graph: DependencyGraph,
}

impl Registry {
    /// Validates and loads service specifications.
    ///
    /// Names must be unique and non-empty, every dependency must be declared,
    /// and the dependency graph must be acyclic.
    pub fn load(specs: impl IntoIterator<Item = ServiceSpec>) -> Result<Self, ValidationError> {
        let specs: Vec<Arc<ServiceSpec>> = specs.into_iter().map(Arc::new).collect();

        let mut index = HashMap::with_capacity(specs.len());
        for (position, spec) in specs.iter().enumerate() {
            if spec.name.is_empty() {
                return Err(ValidationError::EmptyName { position });
            }
            if index.insert(spec.name.clone(), position).is_some() {
                return Err(ValidationError::DuplicateName(spec.name.clone()));
            }
        }

        for spec in &specs {
            if let Some(missing) = spec.depends_on.iter().find(|d| !index.contains_key(*d)) {
                return Err(ValidationError::UnknownDependency {
                    service: spec.name.clone(),
                    dependency: missing.clone(),
                });
            }
        }

        let graph = match DependencyGraph::build(&specs) {
            Ok(graph) => graph,
            Err(unordered) => {
                let path = find_cycle(&specs, &index, &unordered);
                return Err(ValidationError::Cycle { path });
            }
        };

        Ok(Self {
            specs,
            index,
            graph,
        })
    }

    /// Looks up a service by name.
    pub fn get(&self, name: &str) -> Option<&Arc<ServiceSpec>> {
        self.index.get(name).map(|&i| &self.specs[i])
    }

    /// Services in declaration order.
    pub fn iter(&self) -> impl Iterator<Item = &Arc<ServiceSpec>> {
        self.specs.iter()
    }

    /// Number of services.
    pub fn len(&self) -> usize {
        self.specs.len()
    }

    /// Whether no service is declared.
    pub fn is_empty(&self) -> bool {
        self.specs.is_empty()
    }

    /// Dependency graph derived at load time.
    pub fn graph(&self) -> &DependencyGraph {
        &self.graph
    }

    pub(crate) fn position(&self, name: &str) -> Option<usize> {
        self.index.get(name).copied()
    }

    pub(crate) fn spec_at(&self, position: usize) -> &Arc<ServiceSpec> {
        &self.specs[position]
    }
}

#[derive(Clone, Copy, PartialEq)]
enum Mark {
    Unvisited,
    OnStack,
    Done,
}

/// Depth-first search with a recursion stack, started from the services Kahn's
/// algorithm could not order. Returns the first closed path found.
fn find_cycle(
    specs: &[Arc<ServiceSpec>],
    index: &HashMap<ServiceName, usize>,
    unordered: &[usize],
) -> Vec<ServiceName> {
    fn visit(
        node: usize,
        specs: &[Arc<ServiceSpec>],
        index: &HashMap<ServiceName, usize>,
        marks: &mut [Mark],
        stack: &mut Vec<usize>,
    ) -> Option<Vec<usize>> {
        marks[node] = Mark::OnStack;
        stack.push(node);
        for dep in &specs[node].depends_on {
            let next = index[dep];
            match marks[next] {
                Mark::OnStack => {
                    let start = stack.iter().position(|&n| n == next).unwrap_or(0);
                    let mut cycle = stack[start..].to_vec();
                    cycle.push(next);
                    return Some(cycle);
                }
                Mark::Unvisited => {
                    if let Some(cycle) = visit(next, specs, index, marks, stack) {
                        return Some(cycle);
                    }
                }
                Mark::Done => {}
            }
        }
        stack.pop();
        marks[node] = Mark::Done;
        None
    }

    let mut marks = vec![Mark::Unvisited; specs.len()];
    let mut stack = Vec::new();
    for &root in unordered {
        if marks[root] != Mark::Unvisited {
            continue;
        }
        if let Some(cycle) = visit(root, specs, index, &mut marks, &mut stack) {
            // Report the cycle in dependency order: a depends on b depends on ... a
            return cycle.into_iter().map(|i| specs[i].name.clone()).collect();
        }
    }

    unordered.iter().map(|&i| specs[i].name.clone()).collect()
}
