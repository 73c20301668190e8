//! Membership Monitor
//!
//! Heartbeats local members, removes the ones that stay silent, admits nodes
//! that announce themselves, and probes backup sites. Every view change
//! installs a new topology and hands it to the state transfer manager.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use futures::future::join_all;
use tokio::sync::{mpsc, watch};

use super::NetworkClient;
use crate::rpc::Transport;
use crate::state::ClusterMembership;
use crate::transfer::{Command, Message, StateTransferManager};

/// Drives failure detection and site reachability for one node
pub struct MembershipMonitor {
    membership: Arc<ClusterMembership>,
    manager: Arc<StateTransferManager>,
    client: NetworkClient,
    transport: Arc<dyn Transport>,
    advertise_address: String,
    interval: Duration,
    probe_timeout: Duration,
    /// Backup sites whose last probe failed
    unreachable: HashSet<String>,
}

impl MembershipMonitor {
    pub fn new(
        manager: Arc<StateTransferManager>,
        client: NetworkClient,
        transport: Arc<dyn Transport>,
        advertise_address: String,
        interval: Duration,
        probe_timeout: Duration,
    ) -> Self {
        Self {
            membership: Arc::clone(manager.membership()),
            manager,
            client,
            transport,
            advertise_address,
            interval,
            probe_timeout,
            unreachable: HashSet::new(),
        }
    }

    /// Run until shutdown. `joins` carries heartbeats from nodes outside the view.
    pub async fn run(
        mut self,
        mut joins: mpsc::UnboundedReceiver<(String, String)>,
        mut shutdown: watch::Receiver<bool>,
    ) {
        let mut ticker = tokio::time::interval(self.interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = ticker.tick() => self.tick().await,
                Some((id, address)) = joins.recv() => self.admit(id, address).await,
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
            }
        }
        tracing::info!("Membership monitor stopped");
    }

    async fn tick(&mut self) {
        self.send_heartbeats().await;
        self.remove_silent_members().await;
        self.probe_sites().await;
    }

    async fn send_heartbeats(&self) {
        let mut targets = Vec::new();
        for peer in self.membership.peers().await {
            if let Some(address) = self.membership.address_of(&peer).await {
                targets.push((peer, address));
            }
        }

        let heartbeat = Message::Heartbeat {
            node_id: self.membership.node_id().to_string(),
            address: self.advertise_address.clone(),
        };
        let sends = targets.iter().map(|(peer, address)| {
            let heartbeat = heartbeat.clone();
            async move { (peer, self.client.send(address, heartbeat).await) }
        });

        for (peer, result) in join_all(sends).await {
            match result {
                Ok(Message::HeartbeatAck { node_id }) => {
                    if let Err(e) = self.membership.record_heartbeat(&node_id).await {
                        tracing::warn!("Failed to record heartbeat from {}: {}", node_id, e);
                    }
                }
                Ok(other) => tracing::warn!("Unexpected {} from {}", other.type_name(), peer),
                Err(e) => tracing::trace!("Heartbeat to {} failed: {}", peer, e),
            }
        }
    }

    async fn remove_silent_members(&self) {
        let timed_out = self.membership.check_timeouts().await;
        let mut removed = false;
        for node_id in &timed_out {
            tracing::warn!("Node {} timed out, removing it from the view", node_id);
            match self.membership.remove_peer(node_id).await {
                Ok(Some(_)) => removed = true,
                Ok(None) => {}
                Err(e) => tracing::error!("Failed to remove {}: {}", node_id, e),
            }
        }
        if removed {
            self.install_view().await;
        }
    }

    async fn admit(&self, id: String, address: String) {
        tracing::info!("Node {} ({}) joined the view", id, address);
        if let Err(e) = self.membership.add_peer(id.clone(), address).await {
            tracing::error!("Failed to add {}: {}", id, e);
            return;
        }
        if let Err(e) = self.membership.record_heartbeat(&id).await {
            tracing::warn!("Failed to record heartbeat from {}: {}", id, e);
        }
        self.install_view().await;
    }

    async fn install_view(&self) {
        let topology = self.membership.install_topology(false).await;
        tracing::info!(
            "Installed topology {} with members {:?}",
            topology.topology_id,
            topology.members
        );
        self.manager.on_topology_updated(&topology).await;
    }

    async fn probe_sites(&mut self) {
        let sites: Vec<String> = self.manager.sites().map(str::to_string).collect();
        let mut came_up = Vec::new();

        for site in sites {
            let probe = self
                .transport
                .invoke_site(&site, Command::StatusRequest, self.probe_timeout)
                .await;
            match probe {
                Ok(_) => {
                    if self.unreachable.remove(&site) {
                        tracing::info!("Site {} is reachable again", site);
                        came_up.push(site);
                    }
                }
                Err(e) => {
                    if self.unreachable.insert(site.clone()) {
                        tracing::warn!("Site {} is unreachable, taking it offline: {}", site, e);
                        self.manager.take_site_offline(&site);
                    }
                }
            }
        }

        if !came_up.is_empty() {
            self.manager.on_sites_up(&came_up).await;
        }
    }
}
