//! Dependency graph over resource declarations.
//!
//! Edges point from a dependency to its dependent. The apply order is a
//! depth-first topological sort that visits roots and dependencies in
//! declaration order, so the same plan always yields the same order; the
//! destroy order is its exact reverse.

use std::collections::{HashMap, HashSet};

use petgraph::Direction;
use petgraph::algo::tarjan_scc;
use petgraph::dot::{Config, Dot};
use petgraph::graph::{DiGraph, NodeIndex};
use petgraph::visit::{Bfs, Reversed};

use crate::error::{ConfigError, Result};

use super::plan::Plan;

/// A validated, acyclic dependency graph.
#[derive(Debug, Clone)]
pub struct DependencyGraph {
    /// Nodes are identifiers; an edge `a -> b` means `b` depends on `a`.
    graph: DiGraph<String, ()>,
    /// Identifier to node index.
    nodes: HashMap<String, NodeIndex>,
    /// Direct dependencies per node, in declaration order.
    dependencies: Vec<Vec<NodeIndex>>,
    /// Cached apply order.
    order: Vec<NodeIndex>,
    /// Position of each node in the apply order.
    positions: Vec<usize>,
}

impl DependencyGraph {
    /// Builds the graph of a plan.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::CircularDependency`] naming every member of the
    /// first cycle found.
    pub fn from_plan(plan: &Plan) -> Result<Self> {
        Self::from_nodes(
            plan.declarations()
                .iter()
                .map(|d| (d.id.clone(), d.dependencies.clone())),
        )
    }

    /// Builds a graph from `(id, dependencies)` pairs in declaration order.
    ///
    /// Dependencies on identifiers that are not nodes are ignored, which lets
    /// the graph be rebuilt from recorded state where some records are gone.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::CircularDependency`] if the edges form a cycle.
    pub fn from_nodes(nodes: impl IntoIterator<Item = (String, Vec<String>)>) -> Result<Self> {
        let mut graph = DiGraph::new();
        let mut index = HashMap::new();
        let mut declared = Vec::new();

        for (id, deps) in nodes {
            if index.contains_key(&id) {
                continue;
            }
            let idx = graph.add_node(id.clone());
            index.insert(id, idx);
            declared.push(deps);
        }

        let mut dependencies = Vec::with_capacity(declared.len());
        for (i, deps) in declared.iter().enumerate() {
            let dependent = NodeIndex::new(i);
            let mut direct = Vec::new();
            for dep in deps {
                if let Some(&dep_idx) = index.get(dep)
                    && !direct.contains(&dep_idx)
                {
                    graph.add_edge(dep_idx, dependent, ());
                    direct.push(dep_idx);
                }
            }
            dependencies.push(direct);
        }

        let mut dag = Self {
            graph,
            nodes: index,
            dependencies,
            order: Vec::new(),
            positions: Vec::new(),
        };

        dag.verify_acyclic()?;
        dag.order = dag.depth_first_order();
        dag.positions = vec![0; dag.order.len()];
        for (position, idx) in dag.order.iter().enumerate() {
            dag.positions[idx.index()] = position;
        }

        Ok(dag)
    }

    /// Fails with the members of the first cycle, in declaration order.
    fn verify_acyclic(&self) -> Result<()> {
        let mut cycles: Vec<Vec<NodeIndex>> = tarjan_scc(&self.graph)
            .into_iter()
            .filter(|scc| scc.len() > 1 || self.graph.contains_edge(scc[0], scc[0]))
            .collect();

        if cycles.is_empty() {
            return Ok(());
        }

        for scc in &mut cycles {
            scc.sort();
        }
        cycles.sort();

        let members = cycles[0].iter().map(|&idx| self.graph[idx].clone()).collect();
        Err(ConfigError::CircularDependency { members }.into())
    }

    fn depth_first_order(&self) -> Vec<NodeIndex> {
        let mut visited = vec![false; self.graph.node_count()];
        let mut order = Vec::with_capacity(self.graph.node_count());
        for idx in self.graph.node_indices() {
            self.visit(idx, &mut visited, &mut order);
        }
        order
    }

    fn visit(&self, idx: NodeIndex, visited: &mut [bool], order: &mut Vec<NodeIndex>) {
        if visited[idx.index()] {
            return;
        }
        visited[idx.index()] = true;
        for &dep in &self.dependencies[idx.index()] {
            self.visit(dep, visited, order);
        }
        order.push(idx);
    }

    /// Returns identifiers with every dependency before its dependents.
    #[must_use]
    pub fn apply_order(&self) -> Vec<String> {
        self.order.iter().map(|&idx| self.graph[idx].clone()).collect()
    }

    /// Returns the exact reverse of [`apply_order`](Self::apply_order).
    #[must_use]
    pub fn destroy_order(&self) -> Vec<String> {
        self.order.iter().rev().map(|&idx| self.graph[idx].clone()).collect()
    }

    /// Groups identifiers by topological depth.
    ///
    /// Wave `n` holds the nodes whose longest dependency chain has length
    /// `n`; every node in a wave only depends on earlier waves. Each wave is
    /// in declaration order.
    #[must_use]
    pub fn waves(&self) -> Vec<Vec<String>> {
        let mut depth = vec![0usize; self.graph.node_count()];
        for &idx in &self.order {
            depth[idx.index()] = self.dependencies[idx.index()]
                .iter()
                .map(|dep| depth[dep.index()] + 1)
                .max()
                .unwrap_or(0);
        }

        let levels = depth.iter().copied().max().map_or(0, |d| d + 1);
        let mut waves = vec![Vec::new(); levels];
        for idx in self.graph.node_indices() {
            waves[depth[idx.index()]].push(self.graph[idx].clone());
        }
        waves
    }

    /// Returns the direct dependencies of `id`.
    #[must_use]
    pub fn dependencies(&self, id: &str) -> Vec<String> {
        self.nodes.get(id).map_or_else(Vec::new, |&idx| {
            self.dependencies[idx.index()]
                .iter()
                .map(|&dep| self.graph[dep].clone())
                .collect()
        })
    }

    /// Returns the direct dependents of `id`, in declaration order.
    #[must_use]
    pub fn dependents(&self, id: &str) -> Vec<String> {
        self.nodes.get(id).map_or_else(Vec::new, |&idx| {
            let mut direct: Vec<_> = self.graph.neighbors_directed(idx, Direction::Outgoing).collect();
            direct.sort();
            direct.into_iter().map(|n| self.graph[n].clone()).collect()
        })
    }

    /// Returns everything that depends on `id`, directly or not, in apply order.
    #[must_use]
    pub fn transitive_dependents(&self, id: &str) -> Vec<String> {
        let Some(&start) = self.nodes.get(id) else {
            return Vec::new();
        };
        let mut found = Vec::new();
        let mut bfs = Bfs::new(&self.graph, start);
        while let Some(idx) = bfs.next(&self.graph) {
            if idx != start {
                found.push(idx);
            }
        }
        self.in_apply_order(found)
    }

    /// Returns everything `id` depends on, directly or not, in apply order.
    #[must_use]
    pub fn transitive_dependencies(&self, id: &str) -> Vec<String> {
        let Some(&start) = self.nodes.get(id) else {
            return Vec::new();
        };
        let reversed = Reversed(&self.graph);
        let mut found = Vec::new();
        let mut bfs = Bfs::new(reversed, start);
        while let Some(idx) = bfs.next(reversed) {
            if idx != start {
                found.push(idx);
            }
        }
        self.in_apply_order(found)
    }

    /// Returns the targets plus everything they depend on.
    #[must_use]
    pub fn apply_closure(&self, targets: &[String]) -> HashSet<String> {
        let mut closure = HashSet::new();
        for target in targets.iter().filter(|t| self.contains(t)) {
            closure.insert(target.clone());
            closure.extend(self.transitive_dependencies(target));
        }
        closure
    }

    /// Returns the targets plus everything that depends on them.
    #[must_use]
    pub fn destroy_closure(&self, targets: &[String]) -> HashSet<String> {
        let mut closure = HashSet::new();
        for target in targets.iter().filter(|t| self.contains(t)) {
            closure.insert(target.clone());
            closure.extend(self.transitive_dependents(target));
        }
        closure
    }

    /// Returns true if `id` is a node.
    #[must_use]
    pub fn contains(&self, id: &str) -> bool {
        self.nodes.contains_key(id)
    }

    /// Returns the number of nodes.
    #[must_use]
    pub fn len(&self) -> usize {
        self.graph.node_count()
    }

    /// Returns true if the graph has no nodes.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.graph.node_count() == 0
    }

    /// Returns the number of edges.
    #[must_use]
    pub fn edge_count(&self) -> usize {
        self.graph.edge_count()
    }

    /// Renders the graph in Graphviz DOT format.
    #[must_use]
    pub fn to_dot(&self) -> String {
        format!("{:?}", Dot::with_config(&self.graph, &[Config::EdgeNoLabel]))
    }

    fn in_apply_order(&self, mut found: Vec<NodeIndex>) -> Vec<String> {
        found.sort_by_key(|idx| self.positions[idx.index()]);
        found.into_iter().map(|idx| self.graph[idx].clone()).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::TierformError;

    fn graph(nodes: &[(&str, &[&str])]) -> Result<DependencyGraph> {
        DependencyGraph::from_nodes(
            nodes
                .iter()
                .map(|(id, deps)| ((*id).to_string(), deps.iter().map(|d| (*d).to_string()).collect())),
        )
    }

    fn example() -> DependencyGraph {
        graph(&[
            ("v1", &[]),
            ("s1", &["v1"]),
            ("lb1", &["s1"]),
            ("tg1", &["v1"]),
            ("asg1", &["s1", "tg1"]),
        ])
        .unwrap()
    }

    #[test]
    fn test_example_apply_order() {
        assert_eq!(example().apply_order(), vec!["v1", "s1", "lb1", "tg1", "asg1"]);
    }

    #[test]
    fn test_destroy_is_exact_reverse() {
        let dag = example();
        let mut reversed = dag.apply_order();
        reversed.reverse();
        assert_eq!(dag.destroy_order(), reversed);
    }

    #[test]
    fn test_dependencies_precede_dependents() {
        // Declared dependents first to force reordering.
        let dag = graph(&[
            ("app", &["db", "cache"]),
            ("cache", &["subnet"]),
            ("db", &["subnet"]),
            ("subnet", &["vpc"]),
            ("vpc", &[]),
        ])
        .unwrap();
        let order = dag.apply_order();
        let pos = |id: &str| order.iter().position(|x| x == id).unwrap();

        for (id, deps) in [("app", vec!["db", "cache"]), ("cache", vec!["subnet"]), ("db", vec!["subnet"]), ("subnet", vec!["vpc"])] {
            for dep in deps {
                assert!(pos(dep) < pos(id), "{dep} must precede {id}");
            }
        }
        assert_eq!(order, vec!["vpc", "subnet", "db", "cache", "app"]);
    }

    #[test]
    fn test_cycle_names_members() {
        let err = graph(&[("vpc", &[]), ("a", &["c"]), ("b", &["a"]), ("c", &["b"])]).unwrap_err();
        match err {
            TierformError::Config(ConfigError::CircularDependency { members }) => {
                assert_eq!(members, vec!["a", "b", "c"]);
            }
            other => panic!("expected cycle, got {other:?}"),
        }
    }

    #[test]
    fn test_self_loop_is_a_cycle() {
        let err = graph(&[("a", &["a"])]).unwrap_err();
        assert!(err.is_config());
    }

    #[test]
    fn test_unknown_dependencies_ignored() {
        let dag = graph(&[("subnet", &["vpc-that-was-removed"])]).unwrap();
        assert_eq!(dag.apply_order(), vec!["subnet"]);
        assert_eq!(dag.edge_count(), 0);
    }

    #[test]
    fn test_waves_by_depth() {
        let waves = example().waves();
        assert_eq!(
            waves,
            vec![
                vec![String::from("v1")],
                vec![String::from("s1"), String::from("tg1")],
                vec![String::from("lb1"), String::from("asg1")],
            ]
        );
    }

    #[test]
    fn test_transitive_queries() {
        let dag = example();
        assert_eq!(dag.transitive_dependents("s1"), vec!["lb1", "asg1"]);
        assert_eq!(dag.transitive_dependents("v1"), vec!["s1", "lb1", "tg1", "asg1"]);
        assert_eq!(dag.transitive_dependencies("asg1"), vec!["v1", "s1", "tg1"]);
        assert!(dag.transitive_dependencies("v1").is_empty());
        assert_eq!(dag.dependents("v1"), vec!["s1", "tg1"]);
        assert_eq!(dag.dependencies("asg1"), vec!["s1", "tg1"]);
    }

    #[test]
    fn test_closures() {
        let dag = example();
        let apply = dag.apply_closure(&[String::from("lb1")]);
        assert_eq!(apply, HashSet::from([String::from("lb1"), String::from("s1"), String::from("v1")]));

        let destroy = dag.destroy_closure(&[String::from("tg1")]);
        assert_eq!(destroy, HashSet::from([String::from("tg1"), String::from("asg1")]));
    }

    #[test]
    fn test_dot_output_mentions_nodes() {
        let dot = example().to_dot();
        assert!(dot.starts_with("digraph"));
        assert!(dot.contains("asg1"));
    }
}
