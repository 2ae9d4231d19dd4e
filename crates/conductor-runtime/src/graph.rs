//! Workflow graphs: named nodes bound to registered steps, ordered (optionally guarded) edges,
//! one entry node, terminal exits and static interrupt points.
//!
//! A [GraphBuilder] is compiled against a [StepRegistry]; the resulting [CompiledGraph] holds
//! every node's resolved step so nothing is looked up by name during execution.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use serde_json::Value;

use conductor_kernel::{NodeId, RegisteredStep, StepRegistry};

/// Predicate over the current run state guarding an edge.
pub type EdgePredicate = Arc<dyn Fn(&Value) -> bool + Send + Sync>;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum GraphError {
    #[error("graph {graph}: duplicate node {node}")]
    DuplicateNode { graph: String, node: NodeId },
    #[error("graph {graph}: node {node} uses unregistered step {step}")]
    MissingStep {
        graph: String,
        node: NodeId,
        step: String,
    },
    #[error("graph {graph}: edge {from} -> {to} references an unknown node")]
    UnknownEdgeEndpoint {
        graph: String,
        from: NodeId,
        to: NodeId,
    },
    #[error("graph {graph}: no entry node")]
    MissingEntry { graph: String },
    #[error("graph {graph}: unknown node {node}")]
    UnknownNode { graph: String, node: NodeId },
    #[error("graph {graph}: no exit nodes")]
    NoExits { graph: String },
    #[error("no route from node {node}")]
    NoRoute { node: NodeId },
}

#[derive(Clone)]
enum EdgeCondition {
    Always,
    When(EdgePredicate),
}

#[derive(Clone)]
struct EdgeSpec {
    from: NodeId,
    to: NodeId,
    condition: EdgeCondition,
}

/// Declarative graph definition.
#[derive(Clone)]
pub struct GraphBuilder {
    name: String,
    nodes: Vec<(NodeId, String)>,
    edges: Vec<EdgeSpec>,
    entry: Option<NodeId>,
    exits: Vec<NodeId>,
    interrupt_before: Vec<NodeId>,
}

impl GraphBuilder {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            nodes: Vec::new(),
            edges: Vec::new(),
            entry: None,
            exits: Vec::new(),
            interrupt_before: Vec::new(),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Adds node `name` executing the registered step `step`.
    pub fn node(mut self, name: impl Into<NodeId>, step: impl Into<String>) -> Self {
        self.nodes.push((name.into(), step.into()));
        self
    }

    /// Unconditional edge.
    pub fn edge(mut self, from: impl Into<NodeId>, to: impl Into<NodeId>) -> Self {
        self.edges.push(EdgeSpec {
            from: from.into(),
            to: to.into(),
            condition: EdgeCondition::Always,
        });
        self
    }

    /// Edge taken only when `predicate` holds for the current run state.
    pub fn edge_if<P>(mut self, from: impl Into<NodeId>, to: impl Into<NodeId>, predicate: P) -> Self
    where
        P: Fn(&Value) -> bool + Send + Sync + 'static,
    {
        self.edges.push(EdgeSpec {
            from: from.into(),
            to: to.into(),
            condition: EdgeCondition::When(Arc::new(predicate)),
        });
        self
    }

    pub fn entry(mut self, node: impl Into<NodeId>) -> Self {
        self.entry = Some(node.into());
        self
    }

    pub fn exit(mut self, node: impl Into<NodeId>) -> Self {
        self.exits.push(node.into());
        self
    }

    /// Declares a static interrupt point: the run pauses before `node` executes.
    pub fn interrupt_before(mut self, node: impl Into<NodeId>) -> Self {
        self.interrupt_before.push(node.into());
        self
    }

    pub fn compile(&self, registry: &StepRegistry) -> Result<CompiledGraph, GraphError> {
        let graph = self.name.clone();
        let mut nodes = HashMap::with_capacity(self.nodes.len());
        for (node, step_name) in &self.nodes {
            let step = registry
                .get(step_name)
                .cloned()
                .ok_or_else(|| GraphError::MissingStep {
                    graph: graph.clone(),
                    node: node.clone(),
                    step: step_name.clone(),
                })?;
            if nodes.insert(node.clone(), step).is_some() {
                return Err(GraphError::DuplicateNode {
                    graph: graph.clone(),
                    node: node.clone(),
                });
            }
        }

        let mut edges: HashMap<NodeId, Vec<CompiledEdge>> = HashMap::new();
        for edge in &self.edges {
            if !nodes.contains_key(&edge.from) || !nodes.contains_key(&edge.to) {
                return Err(GraphError::UnknownEdgeEndpoint {
                    graph: graph.clone(),
                    from: edge.from.clone(),
                    to: edge.to.clone(),
                });
            }
            edges.entry(edge.from.clone()).or_default().push(CompiledEdge {
                to: edge.to.clone(),
                condition: edge.condition.clone(),
            });
        }

        let entry = self
            .entry
            .clone()
            .ok_or_else(|| GraphError::MissingEntry {
                graph: graph.clone(),
            })?;
        if self.exits.is_empty() {
            return Err(GraphError::NoExits { graph });
        }
        for node in std::iter::once(&entry)
            .chain(self.exits.iter())
            .chain(self.interrupt_before.iter())
        {
            if !nodes.contains_key(node) {
                return Err(GraphError::UnknownNode {
                    graph: graph.clone(),
                    node: node.clone(),
                });
            }
        }

        Ok(CompiledGraph {
            name: graph,
            nodes,
            edges,
            entry,
            exits: self.exits.iter().cloned().collect(),
            interrupt_before: self.interrupt_before.iter().cloned().collect(),
        })
    }
}

#[derive(Clone)]
struct CompiledEdge {
    to: NodeId,
    condition: EdgeCondition,
}

impl CompiledEdge {
    fn holds(&self, state: &Value) -> bool {
        match &self.condition {
            EdgeCondition::Always => true,
            EdgeCondition::When(predicate) => predicate(state),
        }
    }
}

/// Where execution goes after a node.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Route {
    Next(NodeId),
    Exit,
}

#[derive(Clone)]
pub struct CompiledGraph {
    name: String,
    nodes: HashMap<NodeId, RegisteredStep>,
    edges: HashMap<NodeId, Vec<CompiledEdge>>,
    entry: NodeId,
    exits: HashSet<NodeId>,
    interrupt_before: HashSet<NodeId>,
}

impl CompiledGraph {
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn entry(&self) -> &NodeId {
        &self.entry
    }

    pub fn step(&self, node: &str) -> Option<&RegisteredStep> {
        self.nodes.get(node)
    }

    pub fn is_exit(&self, node: &str) -> bool {
        self.exits.contains(node)
    }

    pub fn interrupts_before(&self, node: &str) -> bool {
        self.interrupt_before.contains(node)
    }

    pub fn node_count(&self) -> usize {
        self.nodes.len()
    }

    /// Exits terminate; otherwise the first outgoing edge (declaration order) whose predicate
    /// holds is taken.
    pub fn route(&self, node: &str, state: &Value) -> Result<Route, GraphError> {
        if self.is_exit(node) {
            return Ok(Route::Exit);
        }
        self.edges
            .get(node)
            .and_then(|edges| edges.iter().find(|edge| edge.holds(state)))
            .map(|edge| Route::Next(edge.to.clone()))
            .ok_or_else(|| GraphError::NoRoute {
                node: node.to_string(),
            })
    }
}

impl std::fmt::Debug for CompiledGraph {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let mut nodes: Vec<&NodeId> = self.nodes.keys().collect();
        nodes.sort();
        f.debug_struct("CompiledGraph")
            .field("name", &self.name)
            .field("nodes", &nodes)
            .field("entry", &self.entry)
            .field("exits", &self.exits)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use conductor_kernel::{step_fn, StepOutcome};
    use serde_json::json;

    use super::*;

    fn registry() -> StepRegistry {
        let mut registry = StepRegistry::new();
        for name in ["extract", "score", "review", "approve"] {
            registry.register(RegisteredStep::new(
                name,
                step_fn(|_ctx, _state| async { Ok(StepOutcome::Update(json!({}))) }),
            ));
        }
        registry
    }

    fn grading() -> GraphBuilder {
        GraphBuilder::new("grading")
            .node("extract", "extract")
            .node("score", "score")
            .node("review", "review")
            .node("approve", "approve")
            .entry("extract")
            .edge("extract", "score")
            .edge_if("score", "review", |s| s["needs_review"] == json!(true))
            .edge("score", "approve")
            .edge("review", "approve")
            .exit("approve")
    }

    #[test]
    fn conditional_edges_evaluate_in_declaration_order() {
        let graph = grading().compile(&registry()).unwrap();
        assert_eq!(
            graph.route("score", &json!({ "needs_review": true })).unwrap(),
            Route::Next("review".into())
        );
        assert_eq!(
            graph.route("score", &json!({ "needs_review": false })).unwrap(),
            Route::Next("approve".into())
        );
        assert_eq!(graph.route("approve", &json!({})).unwrap(), Route::Exit);
    }

    #[test]
    fn node_without_matching_edge_has_no_route() {
        let graph = GraphBuilder::new("g")
            .node("a", "extract")
            .node("b", "approve")
            .entry("a")
            .edge_if("a", "b", |s| s.get("go").is_some())
            .exit("b")
            .compile(&registry())
            .unwrap();
        assert_eq!(
            graph.route("a", &json!({})),
            Err(GraphError::NoRoute { node: "a".into() })
        );
    }

    #[test]
    fn compile_rejects_malformed_graphs() {
        let reg = registry();
        let missing_step = GraphBuilder::new("g")
            .node("a", "nope")
            .entry("a")
            .exit("a")
            .compile(&reg);
        assert!(matches!(missing_step, Err(GraphError::MissingStep { .. })));

        let bad_edge = GraphBuilder::new("g")
            .node("a", "extract")
            .edge("a", "ghost")
            .entry("a")
            .exit("a")
            .compile(&reg);
        assert!(matches!(bad_edge, Err(GraphError::UnknownEdgeEndpoint { .. })));

        let no_entry = GraphBuilder::new("g").node("a", "extract").exit("a").compile(&reg);
        assert!(matches!(no_entry, Err(GraphError::MissingEntry { .. })));

        let no_exit = GraphBuilder::new("g").node("a", "extract").entry("a").compile(&reg);
        assert!(matches!(no_exit, Err(GraphError::NoExits { .. })));
    }

    #[test]
    fn interrupt_points_are_recorded() {
        let graph = grading().interrupt_before("review").compile(&registry()).unwrap();
        assert!(graph.interrupts_before("review"));
        assert!(!graph.interrupts_before("score"));
        assert_eq!(graph.entry(), "extract");
        assert_eq!(graph.node_count(), 4);
    }
}
