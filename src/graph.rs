//! Start-order graph over `depends_on` edges

use crate::service::ServiceSpec;
use crate::types::ServiceName;
use std::collections::HashMap;
use std::sync::Arc;

/// Immutable dependency graph derived from a set of service specifications.
///
/// Ordering uses Kahn's algorithm level by level. Ties inside a level are
/// broken by declaration order, so the same input always yields the same
/// startup order.
#[derive(Debug, Clone)]
pub struct DependencyGraph {
    names: Vec<ServiceName>,
    index: HashMap<ServiceName, usize>,
    dependencies: Vec<Vec<usize>>,
    dependents: Vec<Vec<usize>>,
    levels: Vec<Vec<usize>>,
    rank: Vec<usize>,
}

impl DependencyGraph {
    /// Builds the graph. On a cycle, returns the indices of every service that
    /// could not be ordered, in declaration order.
    ///
    /// Every `depends_on` entry must name a declared service.
    pub(crate) fn build(specs: &[Arc<ServiceSpec>]) -> Result<Self, Vec<usize>> {
        let names: Vec<ServiceName> = specs.iter().map(|s| s.name.clone()).collect();
        let index: HashMap<ServiceName, usize> = names
            .iter()
            .enumerate()
            .map(|(i, name)| (name.clone(), i))
            .collect();

        let mut dependencies = vec![Vec::new(); specs.len()];
        let mut dependents = vec![Vec::new(); specs.len()];
        for (i, spec) in specs.iter().enumerate() {
            for dep in &spec.depends_on {
                let d = index[dep];
                if !dependencies[i].contains(&d) {
                    dependencies[i].push(d);
                    dependents[d].push(i);
                }
            }
        }
        for list in &mut dependents {
            list.sort_unstable();
        }

        let mut in_degree: Vec<usize> = dependencies.iter().map(Vec::len).collect();
        let mut current: Vec<usize> = (0..specs.len()).filter(|&i| in_degree[i] == 0).collect();
        let mut levels = Vec::new();
        let mut rank = vec![usize::MAX; specs.len()];
        let mut ordered = 0;

        while !current.is_empty() {
            let mut next = Vec::new();
            for &node in &current {
                rank[node] = ordered;
                ordered += 1;
                for &dependent in &dependents[node] {
                    in_degree[dependent] -= 1;
                    if in_degree[dependent] == 0 {
                        next.push(dependent);
                    }
                }
            }
            next.sort_unstable();
            levels.push(std::mem::replace(&mut current, next));
        }

        if ordered < specs.len() {
            return Err((0..specs.len()).filter(|&i| in_degree[i] > 0).collect());
        }

        Ok(Self {
            names,
            index,
            dependencies,
            dependents,
            levels,
            rank,
        })
    }

    /// Number of services in the graph.
    pub fn len(&self) -> usize {
        self.names.len()
    }

    /// Whether the graph has no services.
    pub fn is_empty(&self) -> bool {
        self.names.is_empty()
    }

    /// Every service, each placed after all of its dependencies.
    pub fn topological_order(&self) -> Vec<&str> {
        self.levels
            .iter()
            .flatten()
            .map(|&i| self.names[i].as_str())
            .collect()
    }

    /// Startup batches: services in one level only depend on earlier levels.
    pub fn levels(&self) -> Vec<Vec<&str>> {
        self.levels
            .iter()
            .map(|level| level.iter().map(|&i| self.names[i].as_str()).collect())
            .collect()
    }

    /// Services that directly depend on `name`, in declaration order.
    pub fn dependents_of(&self, name: &str) -> Vec<&str> {
        self.index
            .get(name)
            .map(|&i| self.names_of(&self.dependents[i]))
            .unwrap_or_default()
    }

    /// Services that depend on `name` directly or indirectly, in startup order.
    pub fn transitive_dependents_of(&self, name: &str) -> Vec<&str> {
        let Some(&start) = self.index.get(name) else {
            return Vec::new();
        };
        let mut seen = vec![false; self.names.len()];
        let mut stack = self.dependents[start].clone();
        while let Some(node) = stack.pop() {
            if !seen[node] {
                seen[node] = true;
                stack.extend(&self.dependents[node]);
            }
        }
        let mut found: Vec<usize> = (0..self.names.len()).filter(|&i| seen[i]).collect();
        found.sort_by_key(|&i| self.rank[i]);
        self.names_of(&found)
    }

    /// Direct dependencies of `name`, in declaration order.
    pub fn dependencies_of(&self, name: &str) -> Vec<&str> {
        self.index
            .get(name)
            .map(|&i| self.names_of(&self.dependencies[i]))
            .unwrap_or_default()
    }

    pub(crate) fn dependency_indices(&self, node: usize) -> &[usize] {
        &self.dependencies[node]
    }

    pub(crate) fn transitive_dependent_indices(&self, node: usize) -> Vec<usize> {
        self.transitive_dependents_of(&self.names[node])
            .into_iter()
            .map(|name| self.index[name])
            .collect()
    }

    /// Declaration indices in startup order.
    pub(crate) fn order_indices(&self) -> impl DoubleEndedIterator<Item = usize> + '_ {
        self.levels.iter().flatten().copied()
    }

    fn names_of(&self, nodes: &[usize]) -> Vec<&str> {
        nodes.iter().map(|&i| self.names[i].as_str()).collect()
    }
}
