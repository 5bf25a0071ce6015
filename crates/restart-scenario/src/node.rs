use serde::Serialize;
use std::fmt;

/// Ordinal index of a node in the launched cluster.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
pub struct NodeId(pub usize);

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "node_{:02}", self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum NodeRole {
    Producer,
    NonProducer,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NodeState {
    Running,
    Killed,
    /// Process restarted, not yet confirmed back in sync.
    Relaunching,
}

#[derive(Debug, Clone)]
pub struct NodeInstance {
    pub id: NodeId,
    pub role: NodeRole,
    pub state: NodeState,
    pub last_height: Option<u64>,
}

impl NodeInstance {
    pub fn new(id: NodeId, role: NodeRole) -> Self {
        Self { id, role, state: NodeState::Running, last_height: None }
    }

    /// Counted in convergence checks.
    pub fn is_live(&self) -> bool {
        matches!(self.state, NodeState::Running | NodeState::Relaunching)
    }
}

/// The orchestrator's view of the cluster's node lifecycle.
///
/// Only the fault injector and the sync barrier move nodes between states.
#[derive(Debug, Default, Clone)]
pub struct NodeSet {
    nodes: Vec<NodeInstance>,
}

impl NodeSet {
    pub fn new(nodes: Vec<NodeInstance>) -> Self {
        Self { nodes }
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &NodeInstance> {
        self.nodes.iter()
    }

    pub fn get(&self, id: NodeId) -> Option<&NodeInstance> {
        self.nodes.iter().find(|n| n.id == id)
    }

    /// Running and relaunching nodes.
    pub fn live(&self) -> Vec<NodeId> {
        self.nodes.iter().filter(|n| n.is_live()).map(|n| n.id).collect()
    }

    pub fn running(&self) -> Vec<NodeId> {
        self.with_state(NodeState::Running)
    }

    /// Running nodes with their roles.
    pub fn running_roles(&self) -> Vec<(NodeId, NodeRole)> {
        self.nodes.iter().filter(|n| n.state == NodeState::Running).map(|n| (n.id, n.role)).collect()
    }

    pub fn killed(&self) -> Vec<NodeId> {
        self.with_state(NodeState::Killed)
    }

    pub fn relaunching(&self) -> Vec<NodeId> {
        self.with_state(NodeState::Relaunching)
    }

    fn with_state(&self, state: NodeState) -> Vec<NodeId> {
        self.nodes.iter().filter(|n| n.state == state).map(|n| n.id).collect()
    }

    pub fn mark_killed(&mut self, id: NodeId) {
        self.set_state(id, NodeState::Killed);
    }

    pub fn mark_relaunching(&mut self, id: NodeId) {
        self.set_state(id, NodeState::Relaunching);
    }

    /// Promotes every relaunching node back to running. Called once the sync
    /// barrier has seen them converge with the rest of the cluster.
    pub fn confirm_rejoined(&mut self) -> Vec<NodeId> {
        let mut rejoined = Vec::new();
        for node in &mut self.nodes {
            if node.state == NodeState::Relaunching {
                node.state = NodeState::Running;
                rejoined.push(node.id);
            }
        }
        rejoined
    }

    pub fn record_height(&mut self, id: NodeId, height: u64) {
        if let Some(node) = self.nodes.iter_mut().find(|n| n.id == id) {
            node.last_height = Some(height);
        }
    }

    fn set_state(&mut self, id: NodeId, state: NodeState) {
        if let Some(node) = self.nodes.iter_mut().find(|n| n.id == id) {
            node.state = state;
        }
    }

    /// `node_00=12 node_01=?` style summary for logs and error messages.
    pub fn height_summary(&self) -> String {
        self.nodes
            .iter()
            .map(|n| match (n.state, n.last_height) {
                (NodeState::Killed, _) => format!("{}=killed", n.id),
                (_, Some(h)) => format!("{}={h}", n.id),
                (_, None) => format!("{}=?", n.id),
            })
            .collect::<Vec<_>>()
            .join(" ")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn three_nodes() -> NodeSet {
        NodeSet::new(vec![
            NodeInstance::new(NodeId(0), NodeRole::Producer),
            NodeInstance::new(NodeId(1), NodeRole::Producer),
            NodeInstance::new(NodeId(2), NodeRole::NonProducer),
        ])
    }

    #[test]
    fn test_killed_node_leaves_live_set() {
        let mut nodes = three_nodes();
        nodes.mark_killed(NodeId(1));
        assert_eq!(nodes.live(), vec![NodeId(0), NodeId(2)]);
        assert_eq!(nodes.killed(), vec![NodeId(1)]);
    }

    #[test]
    fn test_relaunching_is_live_but_not_running() {
        let mut nodes = three_nodes();
        nodes.mark_killed(NodeId(2));
        nodes.mark_relaunching(NodeId(2));
        assert!(nodes.live().contains(&NodeId(2)));
        assert!(!nodes.running().contains(&NodeId(2)));

        let rejoined = nodes.confirm_rejoined();
        assert_eq!(rejoined, vec![NodeId(2)]);
        assert_eq!(nodes.running().len(), 3);
    }

    #[test]
    fn test_height_summary() {
        let mut nodes = three_nodes();
        nodes.record_height(NodeId(0), 7);
        nodes.mark_killed(NodeId(1));
        assert_eq!(nodes.height_summary(), "node_00=7 node_01=killed node_02=?");
    }

    #[test]
    fn test_node_id_display() {
        assert_eq!(NodeId(3).to_string(), "node_03");
        assert_eq!(NodeId(12).to_string(), "node_12");
    }
}
