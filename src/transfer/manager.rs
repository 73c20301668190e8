//! State Transfer Manager
//!
//! Entry point for pushing state to remote sites. The node that starts a push
//! (its originator) tracks the other nodes' confirmations; every node runs its
//! own share of the push through the outbound provider. When the originator
//! leaves, the first member of the new view takes over.

use std::collections::BTreeMap;
use std::sync::Arc;

use tokio::sync::{mpsc, watch, Mutex};
use tokio::task::JoinHandle;

use super::consumer::InboundConsumer;
use super::protocol::{Command, Reply};
use super::provider::{OutboundProvider, PushCompletion};
use super::push_task::PushOutcome;
use crate::cache::{ConflictTracker, EntrySource, WritePipeline, XSiteState};
use crate::config::BackupConfig;
use crate::error::{Error, Result};
use crate::rpc::{self, Transport};
use crate::state::{
    CacheTopology, ClusterMembership, RemoteSiteStatus, SiteAvailability, SiteState, StateTransferStatus,
    XSiteStateTransferMode,
};

/// Coordinates pushes to every configured backup site
pub struct StateTransferManager {
    node_id: String,
    local_site: String,
    sites: BTreeMap<String, RemoteSiteStatus>,
    provider: OutboundProvider,
    consumer: InboundConsumer,
    availability: SiteAvailability,
    membership: Arc<ClusterMembership>,
    transport: Arc<dyn Transport>,
    completions: Mutex<Option<mpsc::UnboundedReceiver<PushCompletion>>>,
    shutdown: watch::Sender<bool>,
}

impl StateTransferManager {
    pub fn new(
        local_site: String,
        backups: &[BackupConfig],
        membership: Arc<ClusterMembership>,
        transport: Arc<dyn Transport>,
        source: Arc<dyn EntrySource>,
        pipeline: Arc<dyn WritePipeline>,
        tracker: Arc<dyn ConflictTracker>,
    ) -> Arc<Self> {
        let (tx, rx) = mpsc::unbounded_channel();
        let provider = OutboundProvider::new(
            local_site.clone(),
            source,
            Arc::clone(&membership),
            Arc::clone(&transport),
            tracker,
            tx,
        );
        let sites = backups
            .iter()
            .map(|b| (b.site.clone(), RemoteSiteStatus::new(b.clone())))
            .collect();
        let (shutdown, _) = watch::channel(false);

        Arc::new(Self {
            node_id: membership.node_id().to_string(),
            local_site,
            sites,
            provider,
            consumer: InboundConsumer::new(pipeline),
            availability: SiteAvailability::new(backups.iter().map(|b| b.site.clone())),
            membership,
            transport,
            completions: Mutex::new(Some(rx)),
            shutdown,
        })
    }

    /// Start relaying local push completions to their originators
    pub async fn start(self: &Arc<Self>) -> Result<JoinHandle<()>> {
        let mut completions = self
            .completions
            .lock()
            .await
            .take()
            .ok_or_else(|| Error::Internal("state transfer manager already started".into()))?;
        let mut shutdown = self.shutdown.subscribe();
        let manager = Arc::clone(self);

        Ok(tokio::spawn(async move {
            tracing::debug!("State transfer manager started on {}", manager.node_id);
            loop {
                tokio::select! {
                    next = completions.recv() => match next {
                        Some(completion) => manager.on_push_completed(completion).await,
                        None => break,
                    },
                    _ = shutdown.changed() => break,
                }
            }
            tracing::debug!("State transfer manager stopped on {}", manager.node_id);
        }))
    }

    /// Cancel local pushes and stop relaying completions
    pub fn stop(&self) {
        self.provider.cancel_all();
        self.shutdown.send_replace(true);
    }

    pub fn node_id(&self) -> &str {
        &self.node_id
    }

    pub fn local_site(&self) -> &str {
        &self.local_site
    }

    pub fn membership(&self) -> &Arc<ClusterMembership> {
        &self.membership
    }

    /// Configured backup site names
    pub fn sites(&self) -> impl Iterator<Item = &str> {
        self.sites.keys().map(String::as_str)
    }

    fn site(&self, site: &str) -> Result<&RemoteSiteStatus> {
        self.sites
            .get(site)
            .ok_or_else(|| Error::UnknownSite(site.to_string()))
    }

    // ========== Operator operations ==========

    /// Push this site's state to `site`, coordinated by this node
    pub async fn start_push_state(&self, site: &str) -> Result<()> {
        let status = self.site(site)?;
        let members = self.membership.members().await;
        let Some(push_id) = status.start_state_transfer(members.clone()) else {
            return Err(Error::TransferInProgress(site.to_string()));
        };

        if status.is_sync() {
            let command = Command::StartReceive {
                site: self.local_site.clone(),
            };
            if let Err(e) = self.transport.invoke_site(site, command, status.backup().timeout()).await {
                tracing::error!("Site {} refused to receive state: {}", site, e);
                status.fail_state_transfer();
                return Err(e);
            }
        }

        let topology = self.membership.current_topology();
        tracing::info!(
            "Starting push {} to {} from {} members (topology {})",
            push_id,
            site,
            members.len(),
            topology.topology_id
        );

        let command = Command::StartSend {
            site: site.to_string(),
            originator: self.node_id.clone(),
            push_id,
            topology: topology.clone(),
        };
        let peers = self.others(&members);
        if let Err(e) = rpc::broadcast_ignore_leavers(self.transport.as_ref(), &peers, &command).await {
            tracing::error!("Failed to start push to {} on every member: {}", site, e);
            status.fail_state_transfer();
            self.cleanup(status).await;
            return Err(e);
        }
        self.handle_start_send(site, &self.node_id, push_id, topology).await
    }

    /// Cancel the push to `site` cluster-wide. Safe when nothing is running.
    pub async fn cancel_push_state(&self, site: &str) -> Result<()> {
        let status = self.site(site)?;
        if status.cancel_state_transfer() {
            tracing::info!("Push to {} canceled", site);
        }
        self.cleanup(status).await;
        Ok(())
    }

    /// Record that `node` finished its share of push `push_id` to `site`.
    /// Reports for an earlier push to the site are ignored.
    pub async fn notify_state_push_finished(&self, site: &str, push_id: u64, node: &str, ok: bool) -> Result<()> {
        let status = self.site(site)?;
        match status.confirm_state_transfer(push_id, node, ok) {
            Some(outcome) => self.complete(status, outcome).await,
            None => tracing::debug!("Push to {}: {} finished (ok: {})", site, node, ok),
        }
        Ok(())
    }

    /// Local status of every site
    pub fn get_status(&self) -> BTreeMap<String, StateTransferStatus> {
        self.sites
            .iter()
            .map(|(site, status)| (site.clone(), status.status()))
            .collect()
    }

    /// Status of every site merged across the cluster
    pub async fn get_cluster_status(&self) -> Result<BTreeMap<String, StateTransferStatus>> {
        let peers = self.membership.peers().await;
        let replies =
            rpc::broadcast_ignore_leavers(self.transport.as_ref(), &peers, &Command::StatusRequest).await?;

        let mut merged = self.get_status();
        for (node, reply) in replies {
            let Reply::Status(remote) = reply else {
                tracing::warn!("Unexpected status reply from {}: {:?}", node, reply);
                continue;
            };
            for (site, status) in remote {
                let current = merged.entry(site).or_insert(StateTransferStatus::Idle);
                *current = StateTransferStatus::merge(*current, status);
            }
        }
        Ok(merged)
    }

    /// Reset finished statuses to idle on every member
    pub async fn clear_cluster_status(&self) -> Result<()> {
        let peers = self.membership.peers().await;
        rpc::broadcast_ignore_leavers(self.transport.as_ref(), &peers, &Command::ClearStatus).await?;
        self.clear_local_status();
        Ok(())
    }

    /// Sites with a push in flight coordinated by this node
    pub fn get_running_state_transfers(&self) -> Vec<String> {
        self.sites
            .iter()
            .filter(|(_, status)| status.status() == StateTransferStatus::Sending)
            .map(|(site, _)| site.clone())
            .collect()
    }

    /// Members that have not yet confirmed the push to `site`
    pub fn pending_confirmations(&self, site: &str) -> Vec<String> {
        self.sites
            .get(site)
            .and_then(RemoteSiteStatus::collector)
            .map(|collector| collector.pending())
            .unwrap_or_default()
    }

    /// Id of the push to `site` this node is coordinating
    pub fn push_id(&self, site: &str) -> Option<u64> {
        self.sites.get(site).and_then(RemoteSiteStatus::push_id)
    }

    /// Site this node is receiving state from
    pub fn get_sending_site_name(&self) -> Option<String> {
        self.consumer.sending_site()
    }

    /// Stop receiving from `site` on every member of this cluster
    pub async fn cancel_receive(&self, site: &str) -> Result<()> {
        let peers = self.membership.peers().await;
        let command = Command::FinishReceive {
            site: site.to_string(),
        };
        rpc::broadcast_ignore_leavers(self.transport.as_ref(), &peers, &command).await?;
        self.consumer.end_state_transfer(site);
        Ok(())
    }

    /// Change the automatic transfer mode. `false` for unknown or synchronous sites.
    pub fn set_automatic_state_transfer(&self, site: &str, mode: XSiteStateTransferMode) -> bool {
        match self.sites.get(site) {
            Some(status) => {
                let changed = status.set_mode(mode);
                if changed {
                    tracing::info!("Automatic state transfer to {} is now {}", site, mode);
                }
                changed
            }
            None => false,
        }
    }

    pub fn get_automatic_state_transfer(&self, site: &str) -> Option<XSiteStateTransferMode> {
        self.sites.get(site).map(RemoteSiteStatus::mode)
    }

    /// Availability of a backup site
    pub fn site_state(&self, site: &str) -> Option<SiteState> {
        self.availability.state(site)
    }

    pub fn take_site_offline(&self, site: &str) -> bool {
        self.availability.take_offline(site)
    }

    pub fn bring_site_online(&self, site: &str) -> bool {
        self.availability.bring_online(site)
    }

    // ========== Topology ==========

    /// React to a newly installed topology
    pub async fn on_topology_updated(&self, topology: &CacheTopology) {
        let members = &topology.members;

        if topology.coordinator() == Some(self.node_id.as_str()) {
            for site in self.provider.sites_missing_coordinator(members) {
                self.become_coordinator(&site, topology).await;
            }
        }

        if topology.rebalance_in_progress {
            for (site, status) in &self.sites {
                if status.defer_restart() {
                    tracing::info!("Rebalance in progress, push to {} will restart afterwards", site);
                }
            }
            self.provider.cancel_all();
            return;
        }

        for (site, status) in &self.sites {
            if let Some(push_id) = status.take_deferred_restart(members.clone()) {
                tracing::info!("Rebalance finished, restarting push to {}", site);
                self.restart_sending(status, push_id, topology).await;
            } else if let Some(outcome) = status.update_members(members) {
                tracing::info!("Remaining members confirmed push to {}", site);
                self.complete(status, outcome).await;
            }
        }

        if topology.coordinator() == Some(self.node_id.as_str()) {
            for site in self.sites.keys() {
                self.check_automatic_state_transfer(site).await;
            }
        }
    }

    /// Take over the push to `site` from a coordinator that left
    pub async fn become_coordinator(&self, site: &str, topology: &CacheTopology) {
        let Ok(status) = self.site(site) else {
            return;
        };
        tracing::info!("Taking over coordination of push to {}", site);

        let members = topology.members.clone();
        let push_id = match status.start_state_transfer(members.clone()) {
            Some(push_id) => push_id,
            None => match status.restart_state_transfer(members) {
                Some(push_id) => push_id,
                None => return,
            },
        };

        if topology.rebalance_in_progress {
            self.broadcast_cancel_send(site).await;
            status.defer_restart();
        } else {
            self.restart_sending(status, push_id, topology).await;
        }
    }

    /// Remote sites became reachable
    pub async fn on_sites_up(&self, sites: &[String]) {
        if !self.membership.is_coordinator().await {
            return;
        }
        for site in sites {
            self.check_automatic_state_transfer(site).await;
        }
    }

    /// Start a push to `site` if every member runs it in automatic mode and
    /// at least one of them has it offline
    pub async fn check_automatic_state_transfer(&self, site: &str) {
        let Ok(status) = self.site(site) else {
            return;
        };
        if status.is_sync() || status.mode() != XSiteStateTransferMode::Auto {
            return;
        }

        let peers = self.membership.peers().await;
        let command = Command::AutoTransferStatus {
            site: site.to_string(),
        };
        let replies = match rpc::broadcast_ignore_leavers(self.transport.as_ref(), &peers, &command).await {
            Ok(replies) => replies,
            Err(e) => {
                tracing::warn!("Automatic state transfer probe for {} failed: {}", site, e);
                return;
            }
        };

        let mut answers = vec![(self.availability.is_offline(site), status.mode())];
        answers.extend(replies.into_iter().filter_map(|(_, reply)| match reply {
            Reply::AutoStatus { offline, mode } => Some((offline, mode)),
            _ => None,
        }));

        let all_auto = answers.iter().all(|(_, mode)| *mode == XSiteStateTransferMode::Auto);
        let any_offline = answers.iter().any(|(offline, _)| *offline);
        if !all_auto || !any_offline {
            tracing::debug!(
                "No automatic push to {} (all auto: {}, offline somewhere: {})",
                site,
                all_auto,
                any_offline
            );
            return;
        }

        tracing::info!("Site {} is back, starting automatic push", site);
        let command = Command::BringOnline {
            site: site.to_string(),
        };
        for (node, result) in rpc::broadcast(self.transport.as_ref(), &peers, &command).await {
            if let Err(e) = result {
                tracing::warn!("Failed to bring {} online on {}: {}", site, node, e);
            }
        }
        self.availability.bring_online(site);

        match self.start_push_state(site).await {
            Ok(()) | Err(Error::TransferInProgress(_)) => {}
            Err(e) => tracing::warn!("Automatic push to {} failed to start: {}", site, e),
        }
    }

    // ========== Command handlers ==========

    pub(crate) async fn handle_start_send(
        &self,
        site: &str,
        originator: &str,
        push_id: u64,
        topology: CacheTopology,
    ) -> Result<()> {
        let status = self.site(site)?;
        self.provider
            .start_state_transfer(status.backup(), originator, push_id, topology)
            .await;
        Ok(())
    }

    pub(crate) async fn handle_restart_send(
        &self,
        site: &str,
        originator: &str,
        push_id: u64,
        topology: CacheTopology,
    ) -> Result<()> {
        let status = self.site(site)?;
        self.provider.cancel_state_transfer(site);
        self.provider
            .start_state_transfer(status.backup(), originator, push_id, topology)
            .await;
        Ok(())
    }

    pub(crate) fn handle_cancel_send(&self, site: &str) -> Result<()> {
        self.site(site)?;
        self.provider.cancel_state_transfer(site);
        Ok(())
    }

    pub(crate) fn clear_local_status(&self) {
        for status in self.sites.values() {
            status.clear_status();
        }
    }

    pub(crate) fn auto_transfer_status(&self, site: &str) -> Result<(bool, XSiteStateTransferMode)> {
        let status = self.site(site)?;
        Ok((self.availability.is_offline(site), status.mode()))
    }

    /// Begin receiving from `site`; when the command came from the other
    /// site, pass it on to the rest of this cluster first
    pub(crate) async fn handle_start_receive(&self, site: &str, from_remote: bool) -> Result<()> {
        if from_remote {
            let peers = self.membership.peers().await;
            let command = Command::StartReceive {
                site: site.to_string(),
            };
            rpc::broadcast_ignore_leavers(self.transport.as_ref(), &peers, &command).await?;
        }
        self.consumer.start_state_transfer(site)
    }

    pub(crate) async fn handle_finish_receive(&self, site: &str, from_remote: bool) -> Result<()> {
        if from_remote {
            let peers = self.membership.peers().await;
            let command = Command::FinishReceive {
                site: site.to_string(),
            };
            rpc::broadcast_ignore_leavers(self.transport.as_ref(), &peers, &command).await?;
        }
        self.consumer.end_state_transfer(site);
        Ok(())
    }

    pub(crate) async fn handle_push_state(&self, chunk: &[XSiteState]) -> Result<()> {
        self.consumer.apply_state(chunk).await
    }

    // ========== Internals ==========

    async fn on_push_completed(&self, completion: PushCompletion) {
        let PushCompletion {
            site,
            originator,
            push_id,
            node,
            outcome,
        } = completion;
        if outcome == PushOutcome::Canceled {
            tracing::debug!("Push to {} canceled locally, not reporting", site);
            return;
        }

        let ok = outcome.is_ok();
        if originator == self.node_id {
            if let Err(e) = self.notify_state_push_finished(&site, push_id, &node, ok).await {
                tracing::warn!("Failed to record local push completion for {}: {}", site, e);
            }
            return;
        }

        let command = Command::FinishSend {
            site: site.clone(),
            push_id,
            node,
            ok,
        };
        if let Err(e) = self.transport.invoke(&originator, command).await {
            tracing::warn!(
                "Could not report push to {} to coordinator {}: {}",
                site,
                originator,
                e
            );
        }
    }

    /// The push reached a terminal outcome: stop every sender and release the receiver
    async fn complete(&self, status: &RemoteSiteStatus, outcome: StateTransferStatus) {
        match outcome {
            StateTransferStatus::SendOk => tracing::info!("Push to {} completed", status.site()),
            _ => tracing::error!("Push to {} ended with {}", status.site(), outcome),
        }
        self.cleanup(status).await;
    }

    async fn cleanup(&self, status: &RemoteSiteStatus) {
        self.broadcast_cancel_send(status.site()).await;
        if status.is_sync() {
            let command = Command::FinishReceive {
                site: self.local_site.clone(),
            };
            if let Err(e) = self
                .transport
                .invoke_site(status.site(), command, status.backup().timeout())
                .await
            {
                tracing::warn!("Failed to tell {} that sending ended: {}", status.site(), e);
            }
        }
    }

    async fn broadcast_cancel_send(&self, site: &str) {
        let peers = self.membership.peers().await;
        let command = Command::CancelSend {
            site: site.to_string(),
        };
        if let Err(e) = rpc::broadcast_ignore_leavers(self.transport.as_ref(), &peers, &command).await {
            tracing::warn!("Failed to cancel push to {} on every member: {}", site, e);
        }
        self.provider.cancel_state_transfer(site);
    }

    async fn restart_sending(&self, status: &RemoteSiteStatus, push_id: u64, topology: &CacheTopology) {
        let site = status.site();
        let command = Command::RestartSend {
            site: site.to_string(),
            originator: self.node_id.clone(),
            push_id,
            topology: topology.clone(),
        };
        let peers = self.membership.peers().await;
        if let Err(e) = rpc::broadcast_ignore_leavers(self.transport.as_ref(), &peers, &command).await {
            tracing::error!("Failed to restart push to {}: {}", site, e);
            status.fail_state_transfer();
            self.cleanup(status).await;
            return;
        }
        if let Err(e) = self
            .handle_restart_send(site, &self.node_id, push_id, topology.clone())
            .await
        {
            tracing::error!("Failed to restart local push to {}: {}", site, e);
        }
    }

    fn others(&self, members: &[String]) -> Vec<String> {
        members
            .iter()
            .filter(|m| **m != self.node_id)
            .cloned()
            .collect()
    }
}
