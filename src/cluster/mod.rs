pub mod balancer;
pub mod config;
pub(crate) mod health;
pub mod manager;
pub mod node;

pub use balancer::{LoadBalancer, RoundRobinBalancer};
pub use config::{ClusterConfig, NodeConfig};
pub use manager::{Cluster, ClusterStatus};
pub use node::{Node, NodeId, NodeState, NodeStatus};
