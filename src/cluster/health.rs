use std::sync::Arc;
use std::time::Duration;

use tokio::task::JoinHandle;
use tracing::{debug, info};

use super::manager::ClusterShared;

/// Background loop that re-probes quarantined nodes.
///
/// Every poll interval it drains the offline queue and pings each node.
/// Nodes that answer go back into the balancer; the rest are queued again
/// for the next pass.
pub(crate) struct HealthMonitor {
    shared: Arc<ClusterShared>,
    poll_interval: Duration,
}

impl HealthMonitor {
    pub(crate) fn new(shared: Arc<ClusterShared>) -> Self {
        let poll_interval = shared.config.node_poll_interval();
        Self {
            shared,
            poll_interval,
        }
    }

    pub(crate) fn spawn(self) -> JoinHandle<()> {
        tokio::spawn(self.run())
    }

    /// Runs until the cluster's cancellation token fires.
    pub(crate) async fn run(self) {
        debug!("Health monitor started, polling every {:?}", self.poll_interval);
        let cancel = self.shared.cancel.clone();

        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = tokio::time::sleep(self.poll_interval) => {}
            }

            tokio::select! {
                _ = cancel.cancelled() => break,
                recovered = self.check_offline_nodes() => {
                    if recovered > 0 {
                        debug!("Health pass recovered {} nodes", recovered);
                    }
                }
            }
        }

        info!("Health monitor stopped");
    }

    /// One pass over the offline queue. Returns how many nodes came back.
    pub(crate) async fn check_offline_nodes(&self) -> usize {
        let pending = self.shared.take_offline();
        let mut recovered = 0;

        for node in pending {
            match node.ping().await {
                Ok(()) => {
                    self.shared.reactivate_node(&node);
                    recovered += 1;
                }
                Err(e) => {
                    debug!("Node {} still offline: {}", node.id(), e);
                    self.shared.requeue_offline(node);
                }
            }
        }

        recovered
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cluster::config::{ClusterConfig, NodeConfig};
    use crate::cluster::Cluster;
    use crate::error::DriverError;
    use crate::test_support::{dead_port, responder};

    async fn cluster_with(ports: &[u16], node_poll_ms: u64) -> Cluster {
        let nodes = ports
            .iter()
            .map(|&port| {
                let mut nc = NodeConfig::new("127.0.0.1", port);
                nc.connect_timeout_ms = 200;
                nc.read_timeout_ms = 500;
                nc
            })
            .collect();
        let mut config = ClusterConfig::new(nodes);
        config.node_poll_ms = node_poll_ms;
        Cluster::new(config).unwrap()
    }

    #[tokio::test]
    async fn test_probe_pass_splits_nodes() {
        let alive = responder().await;
        let dead = dead_port().await;
        let cluster = cluster_with(&[alive, dead], 60_000).await;
        let shared = cluster.shared_for_tests();
        let reason = DriverError::communication("connection reset");
        for node in cluster.nodes() {
            shared.deactivate_node(node, &reason);
        }
        assert_eq!(shared.balancer.node_count(), 0);

        let monitor = HealthMonitor::new(shared.clone());
        assert_eq!(monitor.check_offline_nodes().await, 1);

        assert_eq!(shared.balancer.node_count(), 1);
        let queued: Vec<String> = shared
            .offline
            .lock()
            .iter()
            .map(|n| n.id().to_string())
            .collect();
        assert_eq!(queued, vec![format!("127.0.0.1:{}", dead)]);

        let status = cluster.status();
        assert_eq!(status.active_nodes, 1);
        assert_eq!(status.offline_nodes, 1);
    }

    #[tokio::test]
    async fn test_monitor_recovers_node() {
        let alive = responder().await;
        let cluster = cluster_with(&[alive], 20).await;
        let shared = cluster.shared_for_tests();
        let node = cluster.nodes()[0].clone();
        shared.deactivate_node(&node, &DriverError::communication("timed out"));
        assert!(node.is_offline());

        tokio::time::timeout(Duration::from_secs(5), async {
            while node.is_offline() {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .unwrap();
        assert_eq!(shared.balancer.node_count(), 1);
    }

    #[tokio::test]
    async fn test_monitor_stops_on_shutdown() {
        let cluster = cluster_with(&[1], 60_000).await;
        tokio::time::timeout(Duration::from_secs(1), cluster.shutdown())
            .await
            .unwrap();
    }
}
