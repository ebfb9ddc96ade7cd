use std::collections::VecDeque;
use std::sync::Arc;

use bytes::Bytes;
use futures::future::BoxFuture;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::balancer::{LoadBalancer, RoundRobinBalancer};
use super::config::ClusterConfig;
use super::health::HealthMonitor;
use super::node::{Node, NodeState, NodeStatus};
use crate::error::{DriverError, DriverResult, ResultCode};
use crate::pool::PooledTransport;
use crate::transport::SocketTransport;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ClusterStatus {
    pub active_nodes: usize,
    pub offline_nodes: usize,
    pub nodes: Vec<NodeStatus>,
}

/// State shared between the cluster handle and its health monitor
pub(crate) struct ClusterShared {
    pub(crate) config: ClusterConfig,
    pub(crate) nodes: Vec<Arc<Node>>,
    pub(crate) balancer: Arc<dyn LoadBalancer>,
    pub(crate) offline: Mutex<VecDeque<Arc<Node>>>,
    pub(crate) cancel: CancellationToken,
}

impl ClusterShared {
    /// Quarantine a node: out of the balancer, onto the offline queue.
    /// A node already offline is left where it is.
    pub(crate) fn deactivate_node(&self, node: &Arc<Node>, reason: &DriverError) {
        let changed = node.transition(true, || {
            self.balancer.remove_node(node);
            self.offline.lock().push_back(node.clone());
        });
        if changed {
            warn!("Node {} marked offline: {}", node.id(), reason);
        }
    }

    /// Put a node that passed its probe back into rotation.
    pub(crate) fn reactivate_node(&self, node: &Arc<Node>) {
        let changed = node.transition(false, || self.balancer.add_node(node.clone()));
        if changed {
            info!("Node {} is back online", node.id());
        }
    }

    pub(crate) fn requeue_offline(&self, node: Arc<Node>) {
        self.offline.lock().push_back(node);
    }

    pub(crate) fn take_offline(&self) -> Vec<Arc<Node>> {
        self.offline.lock().drain(..).collect()
    }

    /// Decide what to do with a failed attempt: `Ok` means try again after
    /// the backoff, `Err` is the error to hand back to the caller.
    async fn on_attempt_failed(
        &self,
        node: &Arc<Node>,
        err: DriverError,
    ) -> DriverResult<DriverError> {
        match err.code() {
            ResultCode::NoConnections => {
                debug!("No connection to {} available, retrying", node.id());
            }
            ResultCode::CommunicationError => {
                if err.node_offline() {
                    self.deactivate_node(node, &err);
                } else {
                    debug!("Request to {} failed, retrying: {}", node.id(), err);
                }
            }
            _ => return Err(err),
        }

        tokio::select! {
            _ = self.cancel.cancelled() => Err(DriverError::ShuttingDown),
            _ = tokio::time::sleep(self.config.retry_wait()) => Ok(err),
        }
    }
}

/// Client handle onto a set of interchangeable nodes.
///
/// Every request goes through [`Cluster::execute`], which picks an active
/// node, runs the work on one of its pooled connections, and fails over to
/// another node on transport errors. Nodes that fail are quarantined until
/// the background health monitor sees them answer a ping again.
///
/// Construction spawns the monitor, so it must happen inside a tokio runtime.
pub struct Cluster {
    shared: Arc<ClusterShared>,
    monitor: Mutex<Option<JoinHandle<()>>>,
}

impl Cluster {
    pub fn new(config: ClusterConfig) -> DriverResult<Self> {
        Self::with_balancer(config, Arc::new(RoundRobinBalancer::default()))
    }

    pub fn with_balancer(
        config: ClusterConfig,
        balancer: Arc<dyn LoadBalancer>,
    ) -> DriverResult<Self> {
        config.validate()?;

        let client_id = config.client_id.clone().map(Bytes::from);
        let nodes: Vec<Arc<Node>> = config
            .nodes
            .iter()
            .map(|nc| Arc::new(Node::new(nc.clone(), client_id.clone())))
            .collect();
        for node in &nodes {
            balancer.add_node(node.clone());
        }

        let shared = Arc::new(ClusterShared {
            config,
            nodes,
            balancer,
            offline: Mutex::new(VecDeque::new()),
            cancel: CancellationToken::new(),
        });

        let monitor = HealthMonitor::new(shared.clone()).spawn();
        info!("Cluster started with {} nodes", shared.nodes.len());

        Ok(Self {
            shared,
            monitor: Mutex::new(Some(monitor)),
        })
    }

    pub fn config(&self) -> &ClusterConfig {
        &self.shared.config
    }

    pub fn nodes(&self) -> &[Arc<Node>] {
        &self.shared.nodes
    }

    pub fn node(&self, id: &str) -> Option<Arc<Node>> {
        self.shared.nodes.iter().find(|n| n.id() == id).cloned()
    }

    pub fn is_shutting_down(&self) -> bool {
        self.shared.cancel.is_cancelled()
    }

    /// Run `work` with the configured default retry count.
    pub async fn execute<T, F>(&self, work: F) -> DriverResult<T>
    where
        T: Send,
        F: Fn(&mut SocketTransport) -> BoxFuture<'_, DriverResult<T>> + Sync,
    {
        self.execute_with_retries(work, self.shared.config.default_retry_count)
            .await
    }

    /// Run `work` on some active node, trying at most `retries + 1` times.
    ///
    /// Pool exhaustion and communication errors are retried after the
    /// retry wait; any other error is returned at once. Once the attempts
    /// are used up the result is `NoRetries`.
    pub async fn execute_with_retries<T, F>(&self, work: F, retries: usize) -> DriverResult<T>
    where
        T: Send,
        F: Fn(&mut SocketTransport) -> BoxFuture<'_, DriverResult<T>> + Sync,
    {
        let mut last_error = None;
        for _ in 0..=retries {
            let node = self.select_node()?;
            match node.use_connection(&work).await {
                Ok(value) => return Ok(value),
                Err(e) => last_error = Some(self.shared.on_attempt_failed(&node, e).await?),
            }
        }
        Err(self.exhausted(retries, last_error))
    }

    /// Streaming counterpart of [`Cluster::execute`].
    pub async fn execute_streaming<S, F>(&self, work: F) -> DriverResult<S>
    where
        S: Send,
        F: Fn(PooledTransport) -> BoxFuture<'static, DriverResult<S>> + Sync,
    {
        self.execute_streaming_with_retries(work, self.shared.config.default_retry_count)
            .await
    }

    /// Like [`Cluster::execute_with_retries`], but `work` takes ownership of
    /// the checked-out connection. It stays checked out until the returned
    /// value (usually a `ResponseStream`) is drained or dropped.
    pub async fn execute_streaming_with_retries<S, F>(
        &self,
        work: F,
        retries: usize,
    ) -> DriverResult<S>
    where
        S: Send,
        F: Fn(PooledTransport) -> BoxFuture<'static, DriverResult<S>> + Sync,
    {
        let mut last_error = None;
        for _ in 0..=retries {
            let node = self.select_node()?;
            match node.use_delayed_connection(&work).await {
                Ok(value) => return Ok(value),
                Err(e) => last_error = Some(self.shared.on_attempt_failed(&node, e).await?),
            }
        }
        Err(self.exhausted(retries, last_error))
    }

    /// Ping whichever node the balancer picks.
    pub async fn ping(&self) -> DriverResult<()> {
        self.execute(|conn| Box::pin(conn.ping())).await
    }

    pub fn status(&self) -> ClusterStatus {
        let nodes: Vec<NodeStatus> = self.shared.nodes.iter().map(|n| n.status()).collect();
        let offline_nodes = nodes
            .iter()
            .filter(|n| n.state == NodeState::Offline)
            .count();
        ClusterStatus {
            active_nodes: nodes.len() - offline_nodes,
            offline_nodes,
            nodes,
        }
    }

    /// Drop every pooled connection on every node.
    pub fn reset_connections(&self) {
        for node in &self.shared.nodes {
            node.reset_connections();
        }
    }

    /// Stop the health monitor and close every pool. Requests in their
    /// retry wait fail with `ShuttingDown`.
    pub async fn shutdown(&self) {
        if self.shared.cancel.is_cancelled() {
            return;
        }
        info!("Shutting down cluster");
        self.shared.cancel.cancel();

        let monitor = self.monitor.lock().take();
        if let Some(handle) = monitor {
            if let Err(e) = handle.await {
                warn!("Health monitor ended abnormally: {}", e);
            }
        }

        for node in &self.shared.nodes {
            node.shutdown();
        }
    }

    #[cfg(test)]
    pub(crate) fn shared_for_tests(&self) -> Arc<ClusterShared> {
        self.shared.clone()
    }

    fn select_node(&self) -> DriverResult<Arc<Node>> {
        if self.shared.cancel.is_cancelled() {
            return Err(DriverError::ShuttingDown);
        }
        self.shared
            .balancer
            .select_node()
            .ok_or(DriverError::ClusterOffline)
    }

    fn exhausted(&self, retries: usize, last_error: Option<DriverError>) -> DriverError {
        let attempts = retries + 1;
        match last_error {
            Some(e) => {
                DriverError::NoRetries(format!("{} attempts failed, last error: {}", attempts, e))
            }
            None => DriverError::NoRetries(format!("{} attempts failed", attempts)),
        }
    }
}

impl Drop for Cluster {
    fn drop(&mut self) {
        self.shared.cancel.cancel();
    }
}
