use crate::error::{EngineError, EngineResult};
use crate::types::{Action, ActionId};
use petgraph::graph::{DiGraph, NodeIndex};
use petgraph::visit::EdgeRef;
use petgraph::Direction;
use std::cmp::Reverse;
use std::collections::{BinaryHeap, HashMap, HashSet};

/// Why one action must wait for another
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EdgeKind {
    /// Declared in `depends_on`
    Dependency,
    /// The target is the `on_failure` fallback of the source
    Fallback,
}

/// Dependency graph over a workflow's actions
#[derive(Debug, Clone)]
pub struct ActionGraph {
    graph: DiGraph<ActionId, EdgeKind>,
    action_indices: HashMap<ActionId, NodeIndex>,
    order: Vec<ActionId>,
}

impl ActionGraph {
    /// Build and validate the graph.
    ///
    /// Rejects empty or duplicate IDs and references to unknown actions with
    /// `InvalidWorkflow`, and cycles with `CyclicDependency`.
    pub fn build(actions: &[Action]) -> EngineResult<Self> {
        let mut graph = DiGraph::new();
        let mut action_indices = HashMap::new();

        // Add all actions as nodes, in declaration order
        for action in actions {
            if action.id.0.trim().is_empty() {
                return Err(EngineError::InvalidWorkflow("action with empty id".to_string()));
            }
            let node = graph.add_node(action.id.clone());
            if action_indices.insert(action.id.clone(), node).is_some() {
                return Err(EngineError::InvalidWorkflow(format!(
                    "duplicate action id {}",
                    action.id
                )));
            }
        }

        let lookup = |from: &ActionId, target: &ActionId, what: &str| {
            action_indices.get(target).copied().ok_or_else(|| {
                EngineError::InvalidWorkflow(format!(
                    "action {} {} unknown action {}",
                    from, what, target
                ))
            })
        };

        let mut edges = Vec::new();
        for action in actions {
            let node = action_indices[&action.id];

            // Edge from dependency to dependent (dep -> action)
            let mut seen = HashSet::new();
            for dep in &action.depends_on {
                let dep_idx = lookup(&action.id, dep, "depends on")?;
                if seen.insert(dep_idx) {
                    edges.push((dep_idx, node, EdgeKind::Dependency));
                }
            }

            if let Some(target) = &action.on_failure {
                let target_idx = lookup(&action.id, target, "falls back to")?;
                edges.push((node, target_idx, EdgeKind::Fallback));
            }

            if let Some(target) = &action.on_success {
                lookup(&action.id, target, "branches to")?;
            }
        }

        for (from, to, kind) in edges {
            graph.add_edge(from, to, kind);
        }

        let order = kahn_order(&graph)?;

        Ok(Self {
            graph,
            action_indices,
            order,
        })
    }

    /// Action IDs with every dependency ahead of its dependents
    pub fn topological_order(&self) -> &[ActionId] {
        &self.order
    }

    fn incoming(&self, id: &ActionId, kind: EdgeKind) -> Vec<ActionId> {
        let Some(&node) = self.action_indices.get(id) else {
            return Vec::new();
        };

        let mut ids: Vec<(NodeIndex, ActionId)> = self
            .graph
            .edges_directed(node, Direction::Incoming)
            .filter(|e| *e.weight() == kind)
            .map(|e| (e.source(), self.graph[e.source()].clone()))
            .collect();
        ids.sort_by_key(|(idx, _)| *idx);
        ids.into_iter().map(|(_, id)| id).collect()
    }

    /// Declared dependencies of an action
    pub fn dependencies(&self, id: &ActionId) -> Vec<ActionId> {
        self.incoming(id, EdgeKind::Dependency)
    }

    /// Actions whose failure activates this one as a fallback
    pub fn fallback_sources(&self, id: &ActionId) -> Vec<ActionId> {
        self.incoming(id, EdgeKind::Fallback)
    }

    pub fn is_fallback(&self, id: &ActionId) -> bool {
        !self.fallback_sources(id).is_empty()
    }

    /// Actions that wait on the given one
    pub fn dependents(&self, id: &ActionId) -> Vec<ActionId> {
        let Some(&node) = self.action_indices.get(id) else {
            return Vec::new();
        };

        let mut ids: Vec<NodeIndex> = self
            .graph
            .neighbors_directed(node, Direction::Outgoing)
            .collect();
        ids.sort();
        ids.dedup();
        ids.into_iter().map(|n| self.graph[n].clone()).collect()
    }

    /// Actions with nothing to wait for
    pub fn entry_actions(&self) -> Vec<ActionId> {
        self.graph
            .node_indices()
            .filter(|&n| {
                self.graph
                    .neighbors_directed(n, Direction::Incoming)
                    .next()
                    .is_none()
            })
            .map(|n| self.graph[n].clone())
            .collect()
    }

    pub fn len(&self) -> usize {
        self.graph.node_count()
    }

    pub fn is_empty(&self) -> bool {
        self.graph.node_count() == 0
    }
}

/// Kahn's algorithm. Ties go to the earliest-declared action so the order is
/// stable; leftover nodes mean a cycle.
fn kahn_order(graph: &DiGraph<ActionId, EdgeKind>) -> EngineResult<Vec<ActionId>> {
    let mut in_degree: HashMap<NodeIndex, usize> = graph
        .node_indices()
        .map(|n| (n, graph.neighbors_directed(n, Direction::Incoming).count()))
        .collect();

    let mut ready: BinaryHeap<Reverse<NodeIndex>> = in_degree
        .iter()
        .filter(|(_, d)| **d == 0)
        .map(|(&n, _)| Reverse(n))
        .collect();

    let mut order = Vec::with_capacity(graph.node_count());
    while let Some(Reverse(node)) = ready.pop() {
        order.push(graph[node].clone());

        for next in graph.neighbors_directed(node, Direction::Outgoing) {
            if let Some(degree) = in_degree.get_mut(&next) {
                *degree -= 1;
                if *degree == 0 {
                    ready.push(Reverse(next));
                }
            }
        }
    }

    if order.len() < graph.node_count() {
        let mut stuck: Vec<NodeIndex> = in_degree
            .into_iter()
            .filter(|(_, d)| *d > 0)
            .map(|(n, _)| n)
            .collect();
        stuck.sort();
        return Err(EngineError::CyclicDependency(
            stuck.into_iter().map(|n| graph[n].clone()).collect(),
        ));
    }

    Ok(order)
}

/// Order actions so that each appears after all of its dependencies
pub fn order(actions: &[Action]) -> EngineResult<Vec<Action>> {
    let graph = ActionGraph::build(actions)?;
    let by_id: HashMap<&ActionId, &Action> = actions.iter().map(|a| (&a.id, a)).collect();

    Ok(graph
        .topological_order()
        .iter()
        .filter_map(|id| by_id.get(id).map(|a| (*a).clone()))
        .collect())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::ActionKind;

    fn action(id: &str, deps: &[&str]) -> Action {
        let mut action = Action::new(id, ActionKind::Notify);
        action.depends_on = deps.iter().map(|d| ActionId::new(*d)).collect();
        action
    }

    fn ids(actions: &[Action]) -> Vec<&str> {
        actions.iter().map(|a| a.id.0.as_str()).collect()
    }

    fn assert_topologically_valid(actions: &[Action], ordered: &[Action]) {
        assert_eq!(ordered.len(), actions.len());
        let position: HashMap<&ActionId, usize> =
            ordered.iter().enumerate().map(|(i, a)| (&a.id, i)).collect();
        for action in actions {
            for dep in &action.depends_on {
                assert!(
                    position[dep] < position[&action.id],
                    "{} must come after {}",
                    action.id,
                    dep
                );
            }
        }
    }

    #[test]
    fn test_linear_order() {
        let actions = vec![
            action("publish", &["review"]),
            action("review", &["draft"]),
            action("draft", &[]),
        ];

        let ordered = order(&actions).unwrap();
        assert_eq!(ids(&ordered), vec!["draft", "review", "publish"]);
    }

    #[test]
    fn test_diamond_is_valid_and_stable() {
        let actions = vec![
            action("a", &[]),
            action("b", &["a"]),
            action("c", &["a"]),
            action("d", &["b", "c"]),
            action("e", &[]),
        ];

        let ordered = order(&actions).unwrap();
        assert_topologically_valid(&actions, &ordered);
        assert_eq!(ids(&ordered), vec!["a", "b", "c", "d", "e"]);

        let graph = ActionGraph::build(&actions).unwrap();
        assert_eq!(
            graph.entry_actions(),
            vec![ActionId::new("a"), ActionId::new("e")]
        );
        assert_eq!(
            graph.dependencies(&ActionId::new("d")),
            vec![ActionId::new("b"), ActionId::new("c")]
        );
        assert_eq!(
            graph.dependents(&ActionId::new("a")),
            vec![ActionId::new("b"), ActionId::new("c")]
        );
    }

    #[test]
    fn test_many_shapes_are_valid() {
        // Each action depends on a deterministic subset of earlier ones
        for size in 1..12usize {
            let actions: Vec<Action> = (0..size)
                .rev()
                .map(|i| {
                    let deps: Vec<String> = (0..i)
                        .filter(|j| (i * 7 + j * 3) % 4 == 0)
                        .map(|j| format!("n{}", j))
                        .collect();
                    let deps: Vec<&str> = deps.iter().map(String::as_str).collect();
                    action(&format!("n{}", i), &deps)
                })
                .collect();

            let ordered = order(&actions).unwrap();
            assert_topologically_valid(&actions, &ordered);
        }
    }

    #[test]
    fn test_cycle_rejected() {
        let actions = vec![
            action("a", &["c"]),
            action("b", &["a"]),
            action("c", &["b"]),
            action("d", &[]),
        ];

        let err = order(&actions).unwrap_err();
        assert_eq!(
            err,
            EngineError::CyclicDependency(vec![
                ActionId::new("a"),
                ActionId::new("b"),
                ActionId::new("c"),
            ])
        );
    }

    #[test]
    fn test_self_dependency_rejected() {
        let actions = vec![action("a", &["a"])];
        assert!(matches!(
            ActionGraph::build(&actions),
            Err(EngineError::CyclicDependency(_))
        ));
    }

    #[test]
    fn test_unknown_dependency_rejected() {
        let actions = vec![action("a", &["ghost"])];
        match ActionGraph::build(&actions) {
            Err(EngineError::InvalidWorkflow(msg)) => assert!(msg.contains("ghost")),
            other => panic!("unexpected: {:?}", other),
        }
    }

    #[test]
    fn test_duplicate_id_rejected() {
        let actions = vec![action("a", &[]), action("a", &[])];
        assert!(matches!(
            ActionGraph::build(&actions),
            Err(EngineError::InvalidWorkflow(_))
        ));
    }

    #[test]
    fn test_fallback_edges() {
        let actions = vec![
            action("launch", &[]).on_failure("alert"),
            action("alert", &[]),
        ];

        let graph = ActionGraph::build(&actions).unwrap();
        assert!(graph.is_fallback(&ActionId::new("alert")));
        assert!(graph.dependencies(&ActionId::new("alert")).is_empty());
        assert_eq!(
            graph.fallback_sources(&ActionId::new("alert")),
            vec![ActionId::new("launch")]
        );
        assert_eq!(
            graph.topological_order(),
            &[ActionId::new("launch"), ActionId::new("alert")]
        );
    }

    #[test]
    fn test_fallback_cycle_rejected() {
        let actions = vec![
            action("a", &["b"]),
            action("b", &[]).on_failure("a"),
        ];
        // a depends on b and is also b's fallback: fine, no cycle
        assert!(ActionGraph::build(&actions).is_ok());

        let actions = vec![
            action("a", &[]).on_failure("b"),
            action("b", &[]).on_failure("a"),
        ];
        assert!(matches!(
            ActionGraph::build(&actions),
            Err(EngineError::CyclicDependency(_))
        ));
    }
}
