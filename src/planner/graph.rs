//! Dependency graph of planned changes.
//!
//! Nodes live in an arena and refer to each other by [`NodeId`]. Edges
//! point from a dependency to its dependent:
//!
//! - configuration references and `depends_on` order creates and updates
//! - recorded dependencies order deletions in reverse, so dependents go
//!   first
//! - a replacement is two nodes: its destroy half runs with the deletes,
//!   its create half with the creates, so a replaced dependent is gone
//!   before the object it used is destroyed
//! - providers that cannot run operations concurrently get a chain of
//!   edges between their nodes

use std::collections::{BTreeSet, HashMap};
use tracing::debug;

use crate::address::ResourceAddress;
use crate::error::GraphError;

use super::change::{Action, Change};

/// Index of a node in the graph arena.
pub type NodeId = usize;

/// Which half of a change a node performs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum NodePhase {
    /// Creates, updates, reads, deletes, or the create half of a replace.
    Apply,
    /// Destroys the prior object of a replaced instance.
    Destroy,
}

/// One instance and its planned change.
#[derive(Debug, Clone)]
pub struct GraphNode {
    /// The planned change.
    pub change: Change,
    /// The half of the change this node performs.
    pub phase: NodePhase,
    /// Nodes that must complete first.
    pub dependencies: BTreeSet<NodeId>,
    /// Nodes waiting on this one.
    pub dependents: BTreeSet<NodeId>,
}

/// Acyclic graph of planned changes.
#[derive(Debug, Clone, Default)]
pub struct DependencyGraph {
    nodes: Vec<GraphNode>,
    index: HashMap<ResourceAddress, NodeId>,
    destroy_index: HashMap<ResourceAddress, NodeId>,
}

/// Orders `0..n` so every node follows its dependencies. Ties keep index
/// order. On a cycle, returns the nodes on it with the first repeated at
/// the end.
pub(crate) fn topological_order<F>(n: usize, dependencies: F) -> Result<Vec<usize>, Vec<usize>>
where
    F: Fn(usize) -> Vec<usize>,
{
    #[derive(Clone, Copy, PartialEq, Eq)]
    enum Mark {
        New,
        OnPath,
        Done,
    }

    let mut marks = vec![Mark::New; n];
    let mut order = Vec::with_capacity(n);

    for root in 0..n {
        if marks[root] != Mark::New {
            continue;
        }
        // Explicit stack of (node, remaining dependencies)
        let mut path: Vec<(usize, std::vec::IntoIter<usize>)> = vec![(root, dependencies(root).into_iter())];
        marks[root] = Mark::OnPath;

        while let Some((node, pending)) = path.last_mut() {
            if let Some(next) = pending.next() {
                match marks[next] {
                    Mark::Done => {}
                    Mark::OnPath => {
                        let start = path.iter().position(|(id, _)| *id == next).unwrap_or(0);
                        let mut cycle: Vec<usize> = path[start..].iter().map(|(id, _)| *id).collect();
                        cycle.push(next);
                        return Err(cycle);
                    }
                    Mark::New => {
                        marks[next] = Mark::OnPath;
                        path.push((next, dependencies(next).into_iter()));
                    }
                }
            } else {
                let node = *node;
                marks[node] = Mark::Done;
                order.push(node);
                path.pop();
            }
        }
    }

    Ok(order)
}

impl DependencyGraph {
    /// Builds the graph for a set of changes.
    ///
    /// `serialized` names providers whose operations must not overlap.
    ///
    /// # Errors
    ///
    /// Returns [`GraphError::MissingNode`] if a change depends on an
    /// address with no change of its own, and [`GraphError::CycleDetected`]
    /// if the edges form a cycle.
    pub fn build(changes: Vec<Change>, serialized: &BTreeSet<String>) -> Result<Self, GraphError> {
        let mut graph = Self::default();
        for change in changes {
            if change.action == Action::Replace {
                graph.destroy_index.insert(change.address.clone(), graph.nodes.len());
                graph.push(change.clone(), NodePhase::Destroy);
            }
            graph.index.insert(change.address.clone(), graph.nodes.len());
            graph.push(change, NodePhase::Apply);
        }

        let mut edges = Vec::new();
        for (id, node) in graph.nodes.iter().enumerate() {
            let change = &node.change;

            if node.phase == NodePhase::Destroy || change.action == Action::Delete {
                // Destroy before anything it depended on is destroyed too
                for dep in &change.recorded_dependencies {
                    if let Some(dep_id) = graph.destroy_node(dep) {
                        edges.push((id, dep_id));
                    }
                }
                if node.phase == NodePhase::Destroy
                    && let Some(&create_id) = graph.index.get(&change.address)
                {
                    edges.push((id, create_id));
                }
                continue;
            }

            for dep in &change.depends_on {
                let dep_id = *graph.index.get(dep).ok_or_else(|| GraphError::MissingNode {
                    from: change.address.clone(),
                    to: dep.clone(),
                })?;
                edges.push((dep_id, id));
            }

            // A kept instance that used to depend on a deleted one must stop
            // using it before it goes away.
            if change.action != Action::Replace {
                for dep in &change.recorded_dependencies {
                    if let Some(&dep_id) = graph.index.get(dep)
                        && graph.nodes[dep_id].change.action == Action::Delete
                    {
                        edges.push((id, dep_id));
                    }
                }
            }
        }

        for (from, to) in edges {
            graph.add_edge(from, to);
        }
        graph.check_acyclic()?;

        if !serialized.is_empty() {
            graph.serialize_providers(serialized)?;
        }

        debug!(nodes = graph.nodes.len(), "Built dependency graph");
        Ok(graph)
    }

    fn push(&mut self, change: Change, phase: NodePhase) {
        self.nodes.push(GraphNode {
            change,
            phase,
            dependencies: BTreeSet::new(),
            dependents: BTreeSet::new(),
        });
    }

    /// Node that removes the existing object at `address`, if any.
    fn destroy_node(&self, address: &ResourceAddress) -> Option<NodeId> {
        self.destroy_index.get(address).copied().or_else(|| {
            self.index
                .get(address)
                .copied()
                .filter(|&id| self.nodes[id].change.action == Action::Delete)
        })
    }

    fn add_edge(&mut self, from: NodeId, to: NodeId) {
        self.nodes[to].dependencies.insert(from);
        self.nodes[from].dependents.insert(to);
    }

    fn check_acyclic(&self) -> Result<Vec<NodeId>, GraphError> {
        topological_order(self.nodes.len(), |id| self.nodes[id].dependencies.iter().copied().collect())
            .map_err(|cycle| GraphError::CycleDetected {
                cycle: cycle
                    .into_iter()
                    .rev()
                    .map(|id| self.nodes[id].change.address.clone())
                    .collect(),
            })
    }

    /// Chains the changing nodes of each serialized provider in
    /// dependency order, ties broken by declaration order.
    fn serialize_providers(&mut self, serialized: &BTreeSet<String>) -> Result<(), GraphError> {
        let order = self.check_acyclic()?;
        let mut last: HashMap<&str, NodeId> = HashMap::new();
        let mut chain = Vec::new();
        for id in order {
            let change = &self.nodes[id].change;
            if !change.action.is_change() || !serialized.contains(&change.provider) {
                continue;
            }
            if let Some(prev) = last.insert(change.provider.as_str(), id) {
                chain.push((prev, id));
            }
        }
        for (from, to) in chain {
            self.add_edge(from, to);
        }
        Ok(())
    }

    /// All nodes, indexed by [`NodeId`].
    #[must_use]
    pub fn nodes(&self) -> &[GraphNode] {
        &self.nodes
    }

    /// Node by id.
    #[must_use]
    pub fn node(&self, id: NodeId) -> &GraphNode {
        &self.nodes[id]
    }

    /// Node id for an address. For a replacement this is the create half.
    #[must_use]
    pub fn find(&self, address: &ResourceAddress) -> Option<NodeId> {
        self.index.get(address).copied()
    }

    /// Destroy half of a replaced address.
    #[must_use]
    pub fn find_destroy(&self, address: &ResourceAddress) -> Option<NodeId> {
        self.destroy_index.get(address).copied()
    }

    /// Change planned for an address.
    #[must_use]
    pub fn change(&self, address: &ResourceAddress) -> Option<&Change> {
        self.find(address).map(|id| &self.nodes[id].change)
    }

    /// Changes in dependency order, one per address.
    #[must_use]
    pub fn ordered_changes(&self) -> Vec<&Change> {
        self.check_acyclic()
            .map(|order| {
                order
                    .into_iter()
                    .map(|id| &self.nodes[id])
                    .filter(|n| n.phase == NodePhase::Apply)
                    .map(|n| &n.change)
                    .collect()
            })
            .unwrap_or_default()
    }

    /// Every change, in declaration order, one per address.
    pub fn changes(&self) -> impl Iterator<Item = &Change> {
        self.nodes
            .iter()
            .filter(|n| n.phase == NodePhase::Apply)
            .map(|n| &n.change)
    }

    /// Number of nodes, counting both halves of a replacement.
    #[must_use]
    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    /// Returns true if the graph has no nodes.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    /// Takes the changes out of the graph.
    #[must_use]
    pub fn into_changes(self) -> Vec<Change> {
        self.nodes
            .into_iter()
            .filter(|n| n.phase == NodePhase::Apply)
            .map(|n| n.change)
            .collect()
    }
}

impl GraphNode {
    /// Action this node performs: the destroy half of a replacement is a
    /// delete.
    #[must_use]
    pub fn action(&self) -> Action {
        match self.phase {
            NodePhase::Apply => self.change.action,
            NodePhase::Destroy => Action::Delete,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::provider::ObjectState;

    fn change(name: &str, action: Action, deps: &[&str]) -> Change {
        let mut c = Change::no_op(ResourceAddress::new("null_resource", name), "null", ObjectState::default());
        c.action = action;
        c.depends_on = deps.iter().map(|d| ResourceAddress::new("null_resource", *d)).collect();
        c
    }

    fn id(graph: &DependencyGraph, name: &str) -> NodeId {
        graph.find(&ResourceAddress::new("null_resource", name)).unwrap()
    }

    #[test]
    fn test_reference_edges() {
        let graph = DependencyGraph::build(
            vec![
                change("a", Action::Create, &["b"]),
                change("b", Action::Create, &[]),
                change("c", Action::NoOp, &["a"]),
            ],
            &BTreeSet::new(),
        )
        .unwrap();
        let (a, b, c) = (id(&graph, "a"), id(&graph, "b"), id(&graph, "c"));
        assert!(graph.node(a).dependencies.contains(&b));
        assert!(graph.node(c).dependencies.contains(&a));
        let order: Vec<String> = graph.ordered_changes().iter().map(|c| c.address.name().to_string()).collect();
        assert_eq!(order, vec!["b", "a", "c"]);
    }

    #[test]
    fn test_cycle_names_both_addresses() {
        let err = DependencyGraph::build(
            vec![change("a", Action::Create, &["b"]), change("b", Action::Create, &["a"])],
            &BTreeSet::new(),
        )
        .unwrap_err();
        let GraphError::CycleDetected { cycle } = &err else {
            panic!("expected cycle, got {err}");
        };
        assert_eq!(cycle.len(), 3);
        assert_eq!(cycle.first(), cycle.last());
        let message = err.to_string();
        assert!(message.contains("null_resource.a"));
        assert!(message.contains("null_resource.b"));
    }

    #[test]
    fn test_self_reference_is_a_cycle() {
        let err = DependencyGraph::build(vec![change("a", Action::Create, &["a"])], &BTreeSet::new()).unwrap_err();
        assert!(matches!(err, GraphError::CycleDetected { ref cycle } if cycle.len() == 2));
    }

    #[test]
    fn test_missing_dependency() {
        let err = DependencyGraph::build(vec![change("a", Action::Create, &["ghost"])], &BTreeSet::new()).unwrap_err();
        assert!(matches!(err, GraphError::MissingNode { .. }));
    }

    #[test]
    fn test_destroy_edges_are_reversed() {
        // Both removed from configuration: app depended on db when applied.
        let mut app = change("app", Action::Delete, &[]);
        app.recorded_dependencies = vec![ResourceAddress::new("null_resource", "db")];
        let db = change("db", Action::Delete, &[]);

        let graph = DependencyGraph::build(vec![db, app], &BTreeSet::new()).unwrap();
        let (app, db) = (id(&graph, "app"), id(&graph, "db"));
        assert!(graph.node(db).dependencies.contains(&app));
        assert!(graph.node(app).dependencies.is_empty());
    }

    #[test]
    fn test_kept_dependent_updates_before_delete() {
        let mut app = change("app", Action::Update, &[]);
        app.recorded_dependencies = vec![ResourceAddress::new("null_resource", "old")];
        let old = change("old", Action::Delete, &[]);

        let graph = DependencyGraph::build(vec![app, old], &BTreeSet::new()).unwrap();
        assert!(graph.node(id(&graph, "old")).dependencies.contains(&id(&graph, "app")));
    }

    #[test]
    fn test_replace_chain_destroys_dependents_first() {
        // b referenced a when applied, and both are replaced
        let a = change("a", Action::Replace, &[]);
        let mut b = change("b", Action::Replace, &["a"]);
        b.recorded_dependencies = vec![ResourceAddress::new("null_resource", "a")];

        let graph = DependencyGraph::build(vec![a, b], &BTreeSet::new()).unwrap();
        assert_eq!(graph.len(), 4);
        assert_eq!(graph.changes().count(), 2);

        let address = |name: &str| ResourceAddress::new("null_resource", name);
        let destroy_a = graph.find_destroy(&address("a")).unwrap();
        let destroy_b = graph.find_destroy(&address("b")).unwrap();
        let (create_a, create_b) = (id(&graph, "a"), id(&graph, "b"));
        assert_eq!(graph.node(destroy_a).action(), Action::Delete);
        assert_eq!(graph.node(create_a).action(), Action::Replace);

        let order = graph.check_acyclic().unwrap();
        let position = |node: NodeId| order.iter().position(|&n| n == node).unwrap();
        assert!(position(destroy_b) < position(destroy_a));
        assert!(position(destroy_a) < position(create_a));
        assert!(position(create_a) < position(create_b));
        assert!(position(destroy_b) < position(create_b));
    }

    #[test]
    fn test_delete_waits_for_replaced_dependent_to_be_destroyed() {
        let mut app = change("app", Action::Replace, &[]);
        app.recorded_dependencies = vec![ResourceAddress::new("null_resource", "old")];
        let old = change("old", Action::Delete, &[]);

        let graph = DependencyGraph::build(vec![app, old], &BTreeSet::new()).unwrap();
        let destroy_app = graph.find_destroy(&ResourceAddress::new("null_resource", "app")).unwrap();
        let old = id(&graph, "old");
        assert!(graph.node(old).dependencies.contains(&destroy_app));
        assert!(!graph.node(old).dependencies.contains(&id(&graph, "app")));
    }

    #[test]
    fn test_serialized_provider_chain_follows_dependencies() {
        // a is declared first but depends on b
        let graph = DependencyGraph::build(
            vec![
                change("a", Action::Create, &["b"]),
                change("b", Action::Create, &[]),
                change("c", Action::Create, &[]),
                change("d", Action::NoOp, &[]),
            ],
            &BTreeSet::from([String::from("null")]),
        )
        .unwrap();
        let (a, b, c, d) = (id(&graph, "a"), id(&graph, "b"), id(&graph, "c"), id(&graph, "d"));
        assert!(graph.node(a).dependencies.contains(&b));
        assert!(graph.node(c).dependencies.contains(&a));
        assert!(graph.node(d).dependencies.is_empty());
        assert!(graph.node(d).dependents.is_empty());
    }
}
