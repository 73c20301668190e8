//! Cluster Membership Management
//!
//! Tracks the ordered local cluster view, member health, and the installed
//! cache topology. The first member of the view is the coordinator.

use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};
use tokio::sync::{watch, RwLock};

use super::topology::CacheTopology;
use crate::error::{Error, Result};

/// Node status in the cluster
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum NodeStatus {
    /// Node is in the view but has not been heard from yet
    Joining,
    /// Node is answering heartbeats
    Active,
    /// Node missed heartbeats and is about to be removed
    Suspected,
}

impl std::fmt::Display for NodeStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            NodeStatus::Joining => write!(f, "JOINING"),
            NodeStatus::Active => write!(f, "ACTIVE"),
            NodeStatus::Suspected => write!(f, "SUSPECTED"),
        }
    }
}

/// State of a single node
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeState {
    /// Unique node identifier
    pub id: String,
    /// Node address (host:port)
    pub address: String,
    /// Current status
    pub status: NodeStatus,
    /// When the node was last heard from, or entered the view (not serialized)
    #[serde(skip)]
    pub last_seen: Option<Instant>,
    /// When the node joined the view
    pub joined_at: chrono::DateTime<chrono::Utc>,
}

impl NodeState {
    /// Create a new node state
    pub fn new(id: String, address: String) -> Self {
        Self {
            id,
            address,
            status: NodeStatus::Joining,
            last_seen: Some(Instant::now()),
            joined_at: chrono::Utc::now(),
        }
    }

    /// Check if the node was heard from (or joined) within `timeout`
    pub fn is_healthy(&self, timeout: Duration) -> bool {
        match self.last_seen {
            Some(last) => last.elapsed() < timeout,
            None => false,
        }
    }

    /// Update heartbeat time
    pub fn touch(&mut self) {
        self.last_seen = Some(Instant::now());
    }
}

/// Cluster membership tracker
pub struct ClusterMembership {
    /// This node's ID
    node_id: String,
    /// All members in view order (including self)
    nodes: RwLock<Vec<NodeState>>,
    /// Number of data segments
    num_segments: usize,
    /// Heartbeat timeout
    heartbeat_timeout: Duration,
    /// Latest installed topology
    topology: watch::Sender<CacheTopology>,
}

impl ClusterMembership {
    /// Create a membership view containing only this node
    pub fn new(
        node_id: String,
        address: String,
        num_segments: usize,
        heartbeat_timeout: Duration,
    ) -> Self {
        let mut self_node = NodeState::new(node_id.clone(), address);
        self_node.status = NodeStatus::Active;

        let initial = CacheTopology::round_robin(0, vec![node_id.clone()], num_segments, false);
        let (topology, _) = watch::channel(initial);

        Self {
            node_id,
            nodes: RwLock::new(vec![self_node]),
            num_segments,
            heartbeat_timeout,
            topology,
        }
    }

    /// Create a membership view from `(id, address)` pairs in view order.
    ///
    /// The local node is appended if the view does not list it.
    pub fn from_view(
        node_id: String,
        address: String,
        view: Vec<(String, String)>,
        num_segments: usize,
        heartbeat_timeout: Duration,
    ) -> Self {
        let mut nodes: Vec<NodeState> = view
            .into_iter()
            .map(|(id, addr)| NodeState::new(id, addr))
            .collect();
        match nodes.iter_mut().find(|n| n.id == node_id) {
            Some(me) => me.status = NodeStatus::Active,
            None => {
                let mut me = NodeState::new(node_id.clone(), address);
                me.status = NodeStatus::Active;
                nodes.push(me);
            }
        }

        let members = nodes.iter().map(|n| n.id.clone()).collect();
        let initial = CacheTopology::round_robin(0, members, num_segments, false);
        let (topology, _) = watch::channel(initial);

        Self {
            node_id,
            nodes: RwLock::new(nodes),
            num_segments,
            heartbeat_timeout,
            topology,
        }
    }

    /// Get this node's ID
    pub fn node_id(&self) -> &str {
        &self.node_id
    }

    /// Append a member to the end of the view
    pub async fn add_peer(&self, id: String, address: String) -> Result<()> {
        let mut nodes = self.nodes.write().await;
        if let Some(existing) = nodes.iter_mut().find(|n| n.id == id) {
            existing.address = address;
        } else {
            nodes.push(NodeState::new(id, address));
        }
        Ok(())
    }

    /// Remove a member from the view
    pub async fn remove_peer(&self, id: &str) -> Result<Option<NodeState>> {
        if id == self.node_id {
            return Err(Error::Internal("cannot remove the local node from its own view".into()));
        }
        let mut nodes = self.nodes.write().await;
        Ok(nodes
            .iter()
            .position(|n| n.id == id)
            .map(|idx| nodes.remove(idx)))
    }

    /// Get a node's state
    pub async fn get_node(&self, id: &str) -> Option<NodeState> {
        let nodes = self.nodes.read().await;
        nodes.iter().find(|n| n.id == id).cloned()
    }

    /// Member ids in view order
    pub async fn members(&self) -> Vec<String> {
        let nodes = self.nodes.read().await;
        nodes.iter().map(|n| n.id.clone()).collect()
    }

    /// All member states in view order
    pub async fn all_nodes(&self) -> Vec<NodeState> {
        self.nodes.read().await.clone()
    }

    /// Member ids excluding self, in view order
    pub async fn peers(&self) -> Vec<String> {
        let nodes = self.nodes.read().await;
        nodes
            .iter()
            .filter(|n| n.id != self.node_id)
            .map(|n| n.id.clone())
            .collect()
    }

    /// Whether `id` is in the current view
    pub async fn contains(&self, id: &str) -> bool {
        self.nodes.read().await.iter().any(|n| n.id == id)
    }

    /// Address of a member
    pub async fn address_of(&self, id: &str) -> Option<String> {
        let nodes = self.nodes.read().await;
        nodes.iter().find(|n| n.id == id).map(|n| n.address.clone())
    }

    /// The first member of the view
    pub async fn coordinator(&self) -> Option<String> {
        self.nodes.read().await.first().map(|n| n.id.clone())
    }

    /// Whether this node is the first member of the view
    pub async fn is_coordinator(&self) -> bool {
        self.coordinator().await.as_deref() == Some(self.node_id.as_str())
    }

    /// Record a heartbeat from a node
    pub async fn record_heartbeat(&self, id: &str) -> Result<()> {
        let mut nodes = self.nodes.write().await;
        if let Some(node) = nodes.iter_mut().find(|n| n.id == id) {
            node.touch();
            node.status = NodeStatus::Active;
        } else {
            tracing::trace!("record_heartbeat: node '{}' is not in the view", id);
        }
        Ok(())
    }

    /// Mark silent nodes as suspected and return them.
    ///
    /// A node that was never heard from is timed out once it has been in
    /// the view for longer than the timeout.
    pub async fn check_timeouts(&self) -> Vec<String> {
        let mut nodes = self.nodes.write().await;
        let mut timed_out = Vec::new();

        for node in nodes.iter_mut() {
            if node.id == self.node_id {
                continue;
            }
            if !node.is_healthy(self.heartbeat_timeout) {
                node.status = NodeStatus::Suspected;
                timed_out.push(node.id.clone());
            }
        }

        timed_out
    }

    /// Install a new topology for the current view and publish it
    pub async fn install_topology(&self, rebalance_in_progress: bool) -> CacheTopology {
        let members = self.members().await;
        let next_id = self.topology.borrow().topology_id + 1;
        let topology =
            CacheTopology::round_robin(next_id, members, self.num_segments, rebalance_in_progress);
        tracing::debug!(
            "Installing topology {} with members {:?} (rebalance: {})",
            topology.topology_id,
            topology.members,
            rebalance_in_progress
        );
        self.topology.send_replace(topology.clone());
        topology
    }

    /// Publish a topology computed elsewhere
    pub fn set_topology(&self, topology: CacheTopology) {
        self.topology.send_replace(topology);
    }

    /// Install a topology announced by the coordinator unless a topology
    /// with the same or a higher id is already installed.
    ///
    /// Returns `true` if it was installed.
    pub fn adopt_topology(&self, topology: &CacheTopology) -> bool {
        self.topology.send_if_modified(|current| {
            if topology.topology_id > current.topology_id {
                tracing::debug!(
                    "Adopting topology {} (had {})",
                    topology.topology_id,
                    current.topology_id
                );
                *current = topology.clone();
                true
            } else {
                false
            }
        })
    }

    /// The latest installed topology
    pub fn current_topology(&self) -> CacheTopology {
        self.topology.borrow().clone()
    }

    /// Wait until a topology with at least `min_topology_id` is installed
    pub async fn wait_for_topology(&self, min_topology_id: u64) -> Result<CacheTopology> {
        let mut rx = self.topology.subscribe();
        let topology = rx
            .wait_for(|t| t.topology_id >= min_topology_id)
            .await
            .map_err(|_| Error::ShuttingDown)?;
        Ok(topology.clone())
    }

    /// Get the cluster size (total nodes)
    pub async fn size(&self) -> usize {
        self.nodes.read().await.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cluster() -> ClusterMembership {
        ClusterMembership::new(
            "node-1".to_string(),
            "localhost:7800".to_string(),
            8,
            Duration::from_millis(100),
        )
    }

    #[tokio::test]
    async fn test_cluster_membership() {
        let cluster = cluster();
        cluster.add_peer("node-2".to_string(), "localhost:7801".to_string()).await.unwrap();
        cluster.add_peer("node-3".to_string(), "localhost:7802".to_string()).await.unwrap();

        assert_eq!(cluster.size().await, 3);
        assert_eq!(cluster.members().await, vec!["node-1", "node-2", "node-3"]);
        assert_eq!(cluster.peers().await, vec!["node-2", "node-3"]);
        assert!(cluster.is_coordinator().await);
        assert_eq!(cluster.address_of("node-3").await.as_deref(), Some("localhost:7802"));

        cluster.remove_peer("node-2").await.unwrap();
        assert!(!cluster.contains("node-2").await);
        assert!(cluster.remove_peer("node-1").await.is_err());
    }

    #[tokio::test]
    async fn test_coordinator_is_first_member() {
        let cluster = ClusterMembership::new(
            "node-2".to_string(),
            "localhost:7801".to_string(),
            8,
            Duration::from_secs(1),
        );
        cluster.add_peer("node-3".to_string(), "localhost:7802".to_string()).await.unwrap();
        assert!(cluster.is_coordinator().await);

        let topology = CacheTopology::round_robin(5, vec!["node-1".into(), "node-2".into()], 8, false);
        cluster.set_topology(topology);
        assert_eq!(cluster.current_topology().coordinator(), Some("node-1"));
    }

    #[tokio::test]
    async fn test_view_order() {
        let view = vec![
            ("node-1".to_string(), "localhost:7800".to_string()),
            ("node-2".to_string(), "localhost:7801".to_string()),
        ];
        let cluster = ClusterMembership::from_view(
            "node-2".to_string(),
            "localhost:7801".to_string(),
            view,
            8,
            Duration::from_secs(1),
        );
        assert_eq!(cluster.members().await, vec!["node-1", "node-2"]);
        assert!(!cluster.is_coordinator().await);
        assert_eq!(cluster.current_topology().coordinator(), Some("node-1"));

        let outsider = ClusterMembership::from_view(
            "node-9".to_string(),
            "localhost:7809".to_string(),
            vec![("node-1".to_string(), "localhost:7800".to_string())],
            8,
            Duration::from_secs(1),
        );
        assert_eq!(outsider.members().await, vec!["node-1", "node-9"]);
    }

    #[tokio::test]
    async fn test_heartbeat_and_timeout() {
        let cluster = ClusterMembership::new(
            "node-1".to_string(),
            "localhost:7800".to_string(),
            8,
            Duration::from_millis(200),
        );
        cluster.add_peer("node-2".to_string(), "localhost:7801".to_string()).await.unwrap();
        cluster.add_peer("node-3".to_string(), "localhost:7802".to_string()).await.unwrap();
        assert_eq!(cluster.get_node("node-3").await.unwrap().status, NodeStatus::Joining);

        tokio::time::sleep(Duration::from_millis(120)).await;
        cluster.record_heartbeat("node-2").await.unwrap();
        assert_eq!(cluster.get_node("node-2").await.unwrap().status, NodeStatus::Active);
        tokio::time::sleep(Duration::from_millis(120)).await;

        // node-3 stayed silent past the grace period
        let timed_out = cluster.check_timeouts().await;
        assert_eq!(timed_out, vec!["node-3".to_string()]);
        assert_eq!(cluster.get_node("node-3").await.unwrap().status, NodeStatus::Suspected);
    }

    #[tokio::test]
    async fn test_topology_barrier() {
        let cluster = std::sync::Arc::new(cluster());
        cluster.add_peer("node-2".to_string(), "localhost:7801".to_string()).await.unwrap();

        let waiter = {
            let cluster = std::sync::Arc::clone(&cluster);
            tokio::spawn(async move { cluster.wait_for_topology(2).await })
        };

        let first = cluster.install_topology(false).await;
        assert_eq!(first.topology_id, 1);
        assert!(!waiter.is_finished());

        let second = cluster.install_topology(true).await;
        let seen = waiter.await.unwrap().unwrap();
        assert_eq!(seen, second);
        assert!(seen.rebalance_in_progress);
        assert_eq!(seen.members.len(), 2);
    }

    #[tokio::test]
    async fn test_adopt_newer_topology_only() {
        let cluster = cluster();
        cluster.install_topology(false).await;

        let announced = CacheTopology::round_robin(7, vec!["node-0".into(), "node-1".into()], 8, false);
        assert!(cluster.adopt_topology(&announced));
        assert_eq!(cluster.wait_for_topology(7).await.unwrap(), announced);

        let stale = CacheTopology::round_robin(3, vec!["node-1".into()], 8, false);
        assert!(!cluster.adopt_topology(&stale));
        assert_eq!(cluster.current_topology().topology_id, 7);

        // local installs continue from the adopted id
        assert_eq!(cluster.install_topology(false).await.topology_id, 8);
    }
}
