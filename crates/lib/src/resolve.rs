//! Dependency graph resolution.
//!
//! Builds a directed graph from a project's dependency list and the
//! transitive `dependencies` of each descriptor, then provides:
//! - a stable topological order (ties broken by discovery order)
//! - parallel execution waves (groups of mutually independent descriptors)
//! - dependency queries used for skip propagation
//!
//! Discovery order is the project's list order followed by transitive
//! dependencies in the order they are first reached (breadth-first).
//!
//! The project list is a chain: each entry depends on the one listed before
//! it, unless descriptor edges already order them the other way.

use std::cmp::Reverse;
use std::collections::{BinaryHeap, HashMap, VecDeque};

use petgraph::Direction;
use petgraph::algo::{has_path_connecting, tarjan_scc};
use petgraph::graph::{DiGraph, NodeIndex};
use thiserror::Error;
use tracing::debug;

use crate::descriptor::{Project, Registry};

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ResolveError {
  /// The graph contains a cycle; members are listed in discovery order.
  #[error("dependency cycle detected: {}", .members.join(" -> "))]
  CycleDetected { members: Vec<String> },

  /// A dependency names a descriptor nobody registered.
  #[error("unresolved dependency '{name}' (required by '{required_by}')")]
  UnresolvedDependency { name: String, required_by: String },

  /// The project lists the same dependency twice.
  #[error("duplicate dependency '{name}' in project")]
  DuplicateDependency { name: String },
}

/// Resolved dependency graph for one session.
#[derive(Debug)]
pub struct ExecutionGraph {
  /// Edges point from a dependency to its dependent. Node indices follow
  /// discovery order.
  graph: DiGraph<String, ()>,
  nodes: HashMap<String, NodeIndex>,
  order: Vec<NodeIndex>,
}

impl ExecutionGraph {
  /// Build and verify the graph for `project`.
  pub fn build(project: &Project, registry: &Registry) -> Result<Self, ResolveError> {
    let mut graph: DiGraph<String, ()> = DiGraph::new();
    let mut nodes: HashMap<String, NodeIndex> = HashMap::new();
    let mut queue: VecDeque<(String, String)> = VecDeque::new();

    for (i, name) in project.dependencies.iter().enumerate() {
      if project.dependencies[..i].contains(name) {
        return Err(ResolveError::DuplicateDependency { name: name.clone() });
      }
      queue.push_back((name.clone(), project.name.clone()));
    }

    // Breadth-first discovery; node indices are assigned in discovery order.
    while let Some((name, required_by)) = queue.pop_front() {
      if nodes.contains_key(&name) {
        continue;
      }
      let descriptor = registry
        .get(&name)
        .ok_or_else(|| ResolveError::UnresolvedDependency {
          name: name.clone(),
          required_by: required_by.clone(),
        })?;

      let idx = graph.add_node(name.clone());
      nodes.insert(name.clone(), idx);

      for dep in descriptor.dependencies() {
        if !nodes.contains_key(dep) {
          queue.push_back((dep.clone(), name.clone()));
        }
      }
    }

    for idx in graph.node_indices().collect::<Vec<_>>() {
      let name = graph[idx].clone();
      // Every node came from the registry during discovery.
      let Some(descriptor) = registry.get(&name) else {
        continue;
      };
      for dep in descriptor.dependencies() {
        if let Some(&dep_idx) = nodes.get(dep) {
          graph.add_edge(dep_idx, idx, ());
        }
      }
    }

    for pair in project.dependencies.windows(2) {
      let (prev, cur) = (nodes[&pair[0]], nodes[&pair[1]]);
      if has_path_connecting(&graph, cur, prev, None) {
        debug!(before = %pair[0], after = %pair[1], "declared order conflicts with dependencies, skipping chain link");
        continue;
      }
      if !graph.contains_edge(prev, cur) {
        graph.add_edge(prev, cur, ());
      }
    }

    let order = stable_toposort(&graph).ok_or_else(|| ResolveError::CycleDetected {
      members: first_cycle(&graph),
    })?;

    debug!(nodes = graph.node_count(), edges = graph.edge_count(), "resolved dependency graph");

    Ok(Self { graph, nodes, order })
  }

  /// Descriptor names in a dependency-respecting order.
  pub fn order(&self) -> Vec<String> {
    self.order.iter().map(|&idx| self.graph[idx].clone()).collect()
  }

  /// Group descriptors into waves: every descriptor's dependencies sit in
  /// earlier waves. Each wave is sorted by discovery order.
  pub fn waves(&self) -> Vec<Vec<String>> {
    let mut level: HashMap<NodeIndex, usize> = HashMap::new();
    for &idx in &self.order {
      let lvl = self
        .graph
        .neighbors_directed(idx, Direction::Incoming)
        .filter_map(|dep| level.get(&dep))
        .map(|l| l + 1)
        .max()
        .unwrap_or(0);
      level.insert(idx, lvl);
    }

    let max_level = level.values().copied().max().map(|m| m + 1).unwrap_or(0);
    let mut waves: Vec<Vec<NodeIndex>> = vec![Vec::new(); max_level];
    for (&idx, &lvl) in &level {
      waves[lvl].push(idx);
    }

    waves
      .into_iter()
      .map(|mut wave| {
        wave.sort();
        wave.into_iter().map(|idx| self.graph[idx].clone()).collect()
      })
      .collect()
  }

  /// Direct dependencies of a descriptor.
  pub fn dependencies(&self, name: &str) -> Vec<String> {
    self.neighbors(name, Direction::Incoming)
  }

  /// Descriptors that directly depend on `name`.
  pub fn dependents(&self, name: &str) -> Vec<String> {
    self.neighbors(name, Direction::Outgoing)
  }

  fn neighbors(&self, name: &str, direction: Direction) -> Vec<String> {
    let Some(&idx) = self.nodes.get(name) else {
      return Vec::new();
    };
    let mut found: Vec<NodeIndex> = self.graph.neighbors_directed(idx, direction).collect();
    found.sort();
    found.into_iter().map(|i| self.graph[i].clone()).collect()
  }

  pub fn contains(&self, name: &str) -> bool {
    self.nodes.contains_key(name)
  }

  pub fn len(&self) -> usize {
    self.graph.node_count()
  }

  pub fn is_empty(&self) -> bool {
    self.graph.node_count() == 0
  }
}

/// Resolve `project` into a dependency-respecting build order.
pub fn resolve(project: &Project, registry: &Registry) -> Result<Vec<String>, ResolveError> {
  Ok(ExecutionGraph::build(project, registry)?.order())
}

/// Kahn's algorithm with a min-heap on node index, so ready nodes are always
/// taken in discovery order. Returns `None` if the graph has a cycle.
fn stable_toposort(graph: &DiGraph<String, ()>) -> Option<Vec<NodeIndex>> {
  let mut in_degree: Vec<usize> = graph
    .node_indices()
    .map(|idx| graph.neighbors_directed(idx, Direction::Incoming).count())
    .collect();

  let mut ready: BinaryHeap<Reverse<NodeIndex>> = graph
    .node_indices()
    .filter(|idx| in_degree[idx.index()] == 0)
    .map(Reverse)
    .collect();

  let mut order = Vec::with_capacity(graph.node_count());
  while let Some(Reverse(idx)) = ready.pop() {
    order.push(idx);
    for next in graph.neighbors_directed(idx, Direction::Outgoing) {
      in_degree[next.index()] -= 1;
      if in_degree[next.index()] == 0 {
        ready.push(Reverse(next));
      }
    }
  }

  (order.len() == graph.node_count()).then_some(order)
}

/// Members of the earliest-discovered cycle, in discovery order.
fn first_cycle(graph: &DiGraph<String, ()>) -> Vec<String> {
  let mut cycles: Vec<Vec<NodeIndex>> = tarjan_scc(graph)
    .into_iter()
    .filter(|scc| scc.len() > 1 || scc.iter().any(|&n| graph.contains_edge(n, n)))
    .map(|mut scc| {
      scc.sort();
      scc
    })
    .collect();
  cycles.sort();
  cycles
    .into_iter()
    .next()
    .map(|scc| scc.into_iter().map(|idx| graph[idx].clone()).collect())
    .unwrap_or_default()
}
