use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use parking_lot::RwLock;

use super::node::Node;

/// Selection strategy over the currently active nodes.
///
/// Selection is called concurrently by every request while the health
/// monitor adds and removes nodes, so implementations must be thread-safe.
pub trait LoadBalancer: Send + Sync {
    /// Next node to use, or `None` when no node is active.
    fn select_node(&self) -> Option<Arc<Node>>;

    /// Register a node as active. Adding a node twice is a no-op.
    fn add_node(&self, node: Arc<Node>);

    /// Unregister a node by id.
    fn remove_node(&self, node: &Node);

    fn node_count(&self) -> usize;
}

/// Round-robin over the active set
#[derive(Default)]
pub struct RoundRobinBalancer {
    nodes: RwLock<Vec<Arc<Node>>>,
    cursor: AtomicUsize,
}

impl RoundRobinBalancer {
    pub fn new(nodes: Vec<Arc<Node>>) -> Self {
        let balancer = Self::default();
        for node in nodes {
            balancer.add_node(node);
        }
        balancer
    }

    /// Ids of the active nodes, in selection order.
    pub fn node_ids(&self) -> Vec<String> {
        self.nodes
            .read()
            .iter()
            .map(|n| n.id().to_string())
            .collect()
    }
}

impl LoadBalancer for RoundRobinBalancer {
    fn select_node(&self) -> Option<Arc<Node>> {
        let nodes = self.nodes.read();
        if nodes.is_empty() {
            return None;
        }
        let i = self.cursor.fetch_add(1, Ordering::Relaxed) % nodes.len();
        Some(nodes[i].clone())
    }

    fn add_node(&self, node: Arc<Node>) {
        let mut nodes = self.nodes.write();
        if !nodes.iter().any(|n| n.id() == node.id()) {
            nodes.push(node);
        }
    }

    fn remove_node(&self, node: &Node) {
        self.nodes.write().retain(|n| n.id() != node.id());
    }

    fn node_count(&self) -> usize {
        self.nodes.read().len()
    }
}
