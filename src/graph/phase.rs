use crate::core::errors::{EngineError, Result};
use crate::graph::node::Node;
use crate::graph::Edge;
use async_trait::async_trait;
use petgraph::algo::is_cyclic_directed;
use petgraph::graph::{DiGraph, NodeIndex};
use petgraph::visit::Topo;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;

/// Hooks run around a phase by its controller; all default to no-ops
#[async_trait]
pub trait PhaseLifecycle: Send + Sync {
    /// Runs before any node is started; failure ends the phase with ERROR
    async fn init(&self) -> anyhow::Result<()> {
        Ok(())
    }

    async fn pre_execute(&self) -> anyhow::Result<()> {
        Ok(())
    }

    /// Always runs after the nodes, whatever the outcome
    async fn post_execute(&self) -> anyhow::Result<()> {
        Ok(())
    }

    /// Releases phase resources after `post_execute`
    async fn free(&self) {}
}

#[derive(Debug, Default)]
pub struct NoopPhaseLifecycle;

impl PhaseLifecycle for NoopPhaseLifecycle {}

/// One ordered stage of a graph
pub struct Phase {
    number: i32,
    nodes: Vec<Arc<dyn Node>>,
    edges: Vec<Edge>,
    lifecycle: Arc<dyn PhaseLifecycle>,
}

impl Phase {
    pub fn new(number: i32) -> Self {
        Self {
            number,
            nodes: Vec::new(),
            edges: Vec::new(),
            lifecycle: Arc::new(NoopPhaseLifecycle),
        }
    }

    pub fn with_node(mut self, node: Arc<dyn Node>) -> Self {
        self.nodes.push(node);
        self
    }

    /// Connect `from`'s output to `to`'s input
    pub fn with_edge(mut self, from: impl Into<String>, to: impl Into<String>) -> Self {
        self.edges.push(Edge::new(from, to));
        self
    }

    pub fn with_lifecycle(mut self, lifecycle: Arc<dyn PhaseLifecycle>) -> Self {
        self.lifecycle = lifecycle;
        self
    }

    pub fn number(&self) -> i32 {
        self.number
    }

    pub fn nodes(&self) -> &[Arc<dyn Node>] {
        &self.nodes
    }

    pub fn edges(&self) -> &[Edge] {
        &self.edges
    }

    pub fn node(&self, id: &str) -> Option<&Arc<dyn Node>> {
        self.nodes.iter().find(|n| n.id() == id)
    }

    pub fn lifecycle(&self) -> &Arc<dyn PhaseLifecycle> {
        &self.lifecycle
    }

    /// Nodes without a downstream consumer in this phase
    pub fn leaf_nodes(&self) -> Vec<Arc<dyn Node>> {
        let producers: HashSet<&str> = self.edges.iter().map(|e| e.from.as_str()).collect();
        self.nodes
            .iter()
            .filter(|n| !producers.contains(n.id()))
            .cloned()
            .collect()
    }

    fn build_dag(&self) -> Result<DiGraph<Arc<dyn Node>, ()>> {
        let mut dag = DiGraph::<Arc<dyn Node>, ()>::new();
        let mut node_indices: HashMap<&str, NodeIndex> = HashMap::new();

        for node in &self.nodes {
            let index = dag.add_node(Arc::clone(node));
            if node_indices.insert(node.id(), index).is_some() {
                return Err(EngineError::validation_element(
                    format!("duplicate node in phase {}", self.number),
                    node.id(),
                ));
            }
        }

        for edge in &self.edges {
            let from = node_indices.get(edge.from.as_str());
            let to = node_indices.get(edge.to.as_str());
            match (from, to) {
                (Some(from), Some(to)) => {
                    dag.add_edge(*from, *to, ());
                }
                _ => {
                    return Err(EngineError::validation_element(
                        format!(
                            "edge {} -> {} references a node outside phase {}",
                            edge.from, edge.to, self.number
                        ),
                        edge.to_string(),
                    ))
                }
            }
        }

        if is_cyclic_directed(&dag) {
            return Err(EngineError::validation_element(
                "phase graph contains a cycle",
                format!("phase {}", self.number),
            ));
        }

        Ok(dag)
    }

    /// Check edges stay inside the phase and the phase is acyclic
    pub fn validate(&self) -> Result<()> {
        self.build_dag().map(|_| ())
    }

    /// Nodes ordered so every producer precedes its consumers
    pub fn topological_order(&self) -> Result<Vec<Arc<dyn Node>>> {
        let dag = self.build_dag()?;
        let mut topo = Topo::new(&dag);
        let mut ordered = Vec::with_capacity(self.nodes.len());
        while let Some(index) = topo.next(&dag) {
            ordered.push(Arc::clone(&dag[index]));
        }
        Ok(ordered)
    }
}

impl std::fmt::Debug for Phase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Phase")
            .field("number", &self.number)
            .field("nodes", &self.nodes.iter().map(|n| n.id()).collect::<Vec<_>>())
            .field("edges", &self.edges)
            .finish()
    }
}
