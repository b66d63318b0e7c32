//! Workflow graph model and validator
//!
//! Builds the dependency structure of a [`WorkflowDefinition`] on top of
//! `petgraph` and rejects definitions the scheduler cannot drive: cycles,
//! dangling edges, undeclared ports, ambiguous input wiring and malformed
//! expressions.

use crate::error::GraphError;
use crate::expr::ExpressionRegistry;
use crate::models::{configured_timeouts, timeout_in_range, Edge, WorkflowDefinition};
use petgraph::algo::{is_cyclic_directed, toposort};
use petgraph::graph::{DiGraph, NodeIndex};
use petgraph::visit::Dfs;
use petgraph::Direction;
use std::collections::{HashMap, HashSet};

/// Source output name that forwards the whole output map
pub const WHOLE_OUTPUT: &str = "*";

/// Validated dependency graph of a workflow
#[derive(Debug, Clone)]
pub struct WorkflowGraph {
    graph: DiGraph<String, usize>,
    indices: HashMap<String, NodeIndex>,
    order: Vec<String>,
    edges: Vec<Edge>,
    output_nodes: Vec<String>,
}

impl WorkflowGraph {
    /// Build and validate the graph of a definition
    pub fn build(
        definition: &WorkflowDefinition,
        expressions: &ExpressionRegistry,
    ) -> Result<Self, GraphError> {
        if definition.nodes.is_empty() {
            return Err(GraphError::NoEntryNode);
        }

        // Definitions built in code never pass through the parser
        if let Some((owner, secs)) = configured_timeouts(definition).find(|(_, secs)| !timeout_in_range(*secs)) {
            return Err(GraphError::InvalidTimeout {
                owner: owner.to_string(),
                secs,
            });
        }

        let mut graph = DiGraph::new();
        let mut indices = HashMap::new();
        let mut order = Vec::with_capacity(definition.nodes.len());

        for node in &definition.nodes {
            if indices.contains_key(&node.id) {
                return Err(GraphError::DuplicateNode(node.id.clone()));
            }
            let index = graph.add_node(node.id.clone());
            indices.insert(node.id.clone(), index);
            order.push(node.id.clone());
        }

        let mut wired_inputs: HashMap<(&str, &str), &str> = HashMap::new();

        for (position, edge) in definition.edges.iter().enumerate() {
            let source = Self::endpoint(&indices, edge, &edge.source)?;
            let target = Self::endpoint(&indices, edge, &edge.target)?;

            Self::check_ports(definition, edge)?;

            let slot = (edge.target.as_str(), edge.target_input.as_str());
            if let Some(first) = wired_inputs.insert(slot, edge.id.as_str()) {
                return Err(GraphError::ConflictingEdges {
                    node: edge.target.clone(),
                    input: edge.target_input.clone(),
                    first: first.to_string(),
                    second: edge.id.clone(),
                });
            }

            for expression in edge.condition.iter().chain(edge.transform.iter()) {
                expressions
                    .check(expression)
                    .map_err(|e| GraphError::InvalidExpression {
                        edge: edge.id.clone(),
                        reason: e.to_string(),
                    })?;
            }

            // Edge from source to target (source must finish before target)
            graph.add_edge(source, target, position);
        }

        let mut engine = Self {
            graph,
            indices,
            order,
            edges: definition.edges.clone(),
            output_nodes: Vec::new(),
        };

        engine.validate_acyclic()?;

        let typed: Vec<String> = definition
            .nodes
            .iter()
            .filter(|n| n.is_output())
            .map(|n| n.id.clone())
            .collect();
        let output_nodes = if typed.is_empty() {
            engine
                .order
                .iter()
                .filter(|id| engine.dependents(id).is_empty())
                .cloned()
                .collect()
        } else {
            typed
        };
        engine.output_nodes = output_nodes;

        Ok(engine)
    }

    fn endpoint(
        indices: &HashMap<String, NodeIndex>,
        edge: &Edge,
        node_id: &str,
    ) -> Result<NodeIndex, GraphError> {
        indices
            .get(node_id)
            .copied()
            .ok_or_else(|| GraphError::UnknownNode {
                edge: edge.id.clone(),
                node: node_id.to_string(),
            })
    }

    /// Ports are only checked against nodes that declare them
    fn check_ports(definition: &WorkflowDefinition, edge: &Edge) -> Result<(), GraphError> {
        let unknown = |node: &str, port: &str| GraphError::UnknownPort {
            edge: edge.id.clone(),
            node: node.to_string(),
            port: port.to_string(),
        };

        if let Some(source) = definition.node(&edge.source) {
            if edge.source_output != WHOLE_OUTPUT
                && !source.outputs.is_empty()
                && !source.outputs.iter().any(|p| p.name == edge.source_output)
            {
                return Err(unknown(&edge.source, &edge.source_output));
            }
        }

        if let Some(target) = definition.node(&edge.target) {
            if !target.inputs.is_empty() && !target.inputs.iter().any(|p| p.name == edge.target_input) {
                return Err(unknown(&edge.target, &edge.target_input));
            }
        }

        Ok(())
    }

    /// Validate that the graph is acyclic
    pub fn validate_acyclic(&self) -> Result<(), GraphError> {
        if is_cyclic_directed(&self.graph) {
            return Err(GraphError::CycleDetected(self.find_cycle()));
        }
        Ok(())
    }

    /// Name one cycle as `a -> b -> a`
    fn find_cycle(&self) -> String {
        let mut on_path: HashMap<NodeIndex, bool> = HashMap::new();
        let mut path = Vec::new();

        for node in self.graph.node_indices() {
            if !on_path.contains_key(&node) {
                if let Some(cycle) = self.dfs_find_cycle(node, &mut on_path, &mut path) {
                    return cycle;
                }
            }
        }

        "unknown cycle".to_string()
    }

    fn dfs_find_cycle(
        &self,
        node: NodeIndex,
        on_path: &mut HashMap<NodeIndex, bool>,
        path: &mut Vec<NodeIndex>,
    ) -> Option<String> {
        if let Some(&active) = on_path.get(&node) {
            if !active {
                return None;
            }
            let start = path.iter().position(|&n| n == node).unwrap_or(0);
            let mut names: Vec<&str> = path[start..].iter().map(|&n| self.graph[n].as_str()).collect();
            names.push(self.graph[node].as_str());
            return Some(names.join(" -> "));
        }

        on_path.insert(node, true);
        path.push(node);

        for neighbor in self.graph.neighbors(node) {
            if let Some(cycle) = self.dfs_find_cycle(neighbor, on_path, path) {
                return Some(cycle);
            }
        }

        path.pop();
        on_path.insert(node, false);
        None
    }

    /// Node ids in declaration order
    pub fn node_ids(&self) -> &[String] {
        &self.order
    }

    pub fn node_count(&self) -> usize {
        self.order.len()
    }

    pub fn contains(&self, node_id: &str) -> bool {
        self.indices.contains_key(node_id)
    }

    /// Topologically sorted node ids
    pub fn topological_order(&self) -> Result<Vec<String>, GraphError> {
        let sorted = toposort(&self.graph, None)
            .map_err(|_| GraphError::CycleDetected("cycle detected during topological sort".to_string()))?;

        Ok(sorted.iter().map(|&idx| self.graph[idx].clone()).collect())
    }

    /// Nodes grouped into parallel groups.
    ///
    /// Each group holds the not-yet-processed nodes whose dependencies were
    /// all processed by earlier groups. Nodes inside a group have no path to
    /// one another. Order inside a group follows declaration order.
    pub fn parallel_levels(&self) -> Vec<Vec<String>> {
        let mut processed: HashSet<&str> = HashSet::new();
        let mut levels = Vec::new();

        while processed.len() < self.order.len() {
            let level: Vec<&String> = self
                .order
                .iter()
                .filter(|id| !processed.contains(id.as_str()))
                .filter(|id| {
                    self.dependencies(id)
                        .iter()
                        .all(|dep| processed.contains(dep.as_str()))
                })
                .collect();

            if level.is_empty() {
                break;
            }
            processed.extend(level.iter().map(|id| id.as_str()));
            levels.push(level.into_iter().cloned().collect());
        }

        levels
    }

    /// Distinct nodes that consume the given node's output
    pub fn dependents(&self, node_id: &str) -> Vec<String> {
        self.neighbors(node_id, Direction::Outgoing)
    }

    /// The node and everything reachable from it, in definition order
    pub fn downstream(&self, node_id: &str) -> Vec<String> {
        let Some(&start) = self.indices.get(node_id) else {
            return Vec::new();
        };
        let mut reached = HashSet::new();
        let mut dfs = Dfs::new(&self.graph, start);
        while let Some(index) = dfs.next(&self.graph) {
            reached.insert(self.graph[index].as_str());
        }
        self.order
            .iter()
            .filter(|id| reached.contains(id.as_str()))
            .cloned()
            .collect()
    }

    /// Distinct nodes the given node waits on
    pub fn dependencies(&self, node_id: &str) -> Vec<String> {
        self.neighbors(node_id, Direction::Incoming)
    }

    fn neighbors(&self, node_id: &str, direction: Direction) -> Vec<String> {
        let Some(&index) = self.indices.get(node_id) else {
            return Vec::new();
        };
        let mut seen = HashSet::new();
        let mut ids: Vec<String> = self
            .graph
            .neighbors_directed(index, direction)
            .filter(|n| seen.insert(*n))
            .map(|n| self.graph[n].clone())
            .collect();
        ids.sort_by_key(|id| self.order.iter().position(|o| o == id));
        ids
    }

    /// Edges that write into the given node
    pub fn incoming_edges<'a>(&'a self, node_id: &'a str) -> impl Iterator<Item = &'a Edge> + 'a {
        self.edges.iter().filter(move |e| e.target == node_id)
    }

    /// Edges that read from the given node
    pub fn outgoing_edges<'a>(&'a self, node_id: &'a str) -> impl Iterator<Item = &'a Edge> + 'a {
        self.edges.iter().filter(move |e| e.source == node_id)
    }

    /// Nodes with no incoming edge
    pub fn entry_nodes(&self) -> Vec<String> {
        self.order
            .iter()
            .filter(|id| self.dependencies(id).is_empty())
            .cloned()
            .collect()
    }

    /// Nodes whose results make up `output_data`: nodes of type `output`,
    /// otherwise every sink.
    pub fn output_nodes(&self) -> &[String] {
        &self.output_nodes
    }
}

/// Validate a definition, discarding the built graph
pub fn validate(definition: &WorkflowDefinition, expressions: &ExpressionRegistry) -> Result<(), GraphError> {
    WorkflowGraph::build(definition, expressions).map(|_| ())
}
