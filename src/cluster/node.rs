use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use bytes::Bytes;
use futures::future::BoxFuture;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

use super::config::NodeConfig;
use crate::error::DriverResult;
use crate::pool::{ConnectionPool, PoolStats, PooledTransport};
use crate::transport::SocketTransport;

/// Unique identifier for a node in the cluster
pub type NodeId = String;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum NodeState {
    /// Eligible for selection by the load balancer
    Active,
    /// Quarantined until the health monitor sees a successful probe
    Offline,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct NodeStatus {
    pub id: NodeId,
    pub address: String,
    pub state: NodeState,
    pub pool: PoolStats,
}

/// One cluster member and its connection pool.
///
/// The node never retries: whatever the work function returns, including
/// communication errors, is handed back to the caller unchanged.
pub struct Node {
    id: NodeId,
    config: Arc<NodeConfig>,
    pool: Arc<ConnectionPool>,
    client_id: Option<Bytes>,
    offline: AtomicBool,
    transition: Mutex<()>,
}

impl Node {
    pub fn new(config: NodeConfig, client_id: Option<Bytes>) -> Self {
        let config = Arc::new(config);
        Self {
            id: config.name(),
            pool: ConnectionPool::new(config.clone()),
            config,
            client_id,
            offline: AtomicBool::new(false),
            transition: Mutex::new(()),
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn address(&self) -> String {
        self.config.address()
    }

    pub fn config(&self) -> &NodeConfig {
        &self.config
    }

    pub fn is_offline(&self) -> bool {
        self.offline.load(Ordering::Acquire)
    }

    /// Move to the given state, running `on_change` under the transition
    /// lock if the state actually changed. Returns whether it did.
    pub(crate) fn transition(&self, offline: bool, on_change: impl FnOnce()) -> bool {
        let _guard = self.transition.lock();
        if self.offline.swap(offline, Ordering::AcqRel) == offline {
            return false;
        }
        on_change();
        true
    }

    /// Check out a connection and run the per-use setup exchange.
    pub async fn checkout(&self) -> DriverResult<PooledTransport> {
        let mut conn = self.pool.acquire().await?;
        if let Some(client_id) = &self.client_id {
            conn.set_client_id(client_id).await?;
        }
        Ok(conn)
    }

    /// Run `work` on a pooled connection, which is released when it finishes.
    pub async fn use_connection<T, F>(&self, work: F) -> DriverResult<T>
    where
        F: FnOnce(&mut SocketTransport) -> BoxFuture<'_, DriverResult<T>>,
    {
        let mut conn = self.checkout().await?;
        work(&mut *conn).await
    }

    /// Hand the checked-out connection itself to `work`.
    ///
    /// The connection is released only when whatever `work` returns lets go
    /// of it, typically a [`crate::transport::ResponseStream`] that is drained
    /// or dropped by the caller.
    pub async fn use_delayed_connection<S, F>(&self, work: F) -> DriverResult<S>
    where
        F: FnOnce(PooledTransport) -> BoxFuture<'static, DriverResult<S>>,
    {
        let conn = self.checkout().await?;
        work(conn).await
    }

    /// Minimal round trip used as the health probe.
    pub async fn ping(&self) -> DriverResult<()> {
        let mut conn = self.pool.acquire().await?;
        conn.ping().await
    }

    pub fn pool_stats(&self) -> PoolStats {
        self.pool.stats()
    }

    pub fn reset_connections(&self) {
        self.pool.reset_all();
    }

    pub fn shutdown(&self) {
        self.pool.close();
    }

    pub fn status(&self) -> NodeStatus {
        NodeStatus {
            id: self.id.clone(),
            address: self.address(),
            state: if self.is_offline() {
                NodeState::Offline
            } else {
                NodeState::Active
            },
            pool: self.pool_stats(),
        }
    }
}

impl std::fmt::Debug for Node {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Node")
            .field("id", &self.id)
            .field("address", &self.address())
            .field("offline", &self.is_offline())
            .finish()
    }
}
