//! Cluster-aware client core for a key-value database speaking a framed
//! binary protocol over TCP.
//!
//! A [`Cluster`] owns one [`Node`] per configured server, each with a
//! bounded pool of connections. Requests are closures run on a pooled
//! [`SocketTransport`]; the cluster picks a node round-robin, retries on
//! transport failures, and quarantines unreachable nodes until a background
//! health monitor sees them answer again.

pub mod cluster;
pub mod error;
pub mod pool;
pub mod protocol;
pub mod transport;

#[cfg(test)]
pub(crate) mod test_support;

pub use cluster::{
    Cluster, ClusterConfig, ClusterStatus, LoadBalancer, Node, NodeConfig, NodeState, NodeStatus,
    RoundRobinBalancer,
};
pub use error::{DriverError, DriverResult, ResultCode, ResultCodeExt};
pub use pool::{ConnectionPool, PoolStats, PooledTransport};
pub use protocol::{Frame, Message, MessageCode};
pub use transport::{ResponseStream, SocketTransport};
