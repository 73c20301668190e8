//! End-to-end push scenarios on an in-process cluster.
//!
//! Nodes talk through `LoopbackTransport`, which calls the target's
//! dispatcher directly. The remote site is a single real node behind a
//! scripted link that can delay or fail chunks.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::watch;

use super::*;
use crate::cache::{IracForwarder, MemoryCache, XSiteState};
use crate::config::{BackupConfig, BackupStrategy};
use crate::error::{Error, Result};
use crate::rpc::Transport;
use crate::state::{ClusterMembership, StateTransferStatus, XSiteStateTransferMode};

const ENTRIES: usize = 30;
const SEGMENTS: usize = 16;

#[derive(Default)]
struct Router {
    nodes: RwLock<HashMap<String, Arc<dyn CommandHandler>>>,
    down: RwLock<HashSet<String>>,
    sites: RwLock<HashMap<String, Arc<RemoteLink>>>,
}

impl Router {
    fn handler(&self, node: &str) -> Option<Arc<dyn CommandHandler>> {
        if self.down.read().unwrap().contains(node) {
            return None;
        }
        self.nodes.read().unwrap().get(node).cloned()
    }

    fn site(&self, site: &str) -> Option<Arc<RemoteLink>> {
        self.sites.read().unwrap().get(site).cloned()
    }

    fn crash(&self, node: &str) {
        self.down.write().unwrap().insert(node.to_string());
    }
}

struct LoopbackTransport {
    local: String,
    router: Arc<Router>,
}

#[async_trait]
impl Transport for LoopbackTransport {
    async fn invoke(&self, target: &str, command: Command) -> Result<Reply> {
        let handler = self
            .router
            .handler(target)
            .ok_or_else(|| Error::SuspectNode(target.to_string()))?;
        handler.handle(&self.local, command).await
    }

    async fn invoke_site(&self, site: &str, command: Command, timeout: Duration) -> Result<Reply> {
        let link = self.router.site(site).ok_or_else(|| Error::ConnectionFailed {
            address: site.to_string(),
            reason: "unknown site".to_string(),
        })?;
        tokio::time::timeout(timeout, link.handle(&self.local, command))
            .await
            .map_err(|_| Error::ConnectionTimeout(site.to_string()))?
    }
}

/// Link to the remote site's entry node
struct RemoteLink {
    node: TestNode,
    dispatcher: Dispatcher,
    push_failures: AtomicU32,
    delays: Mutex<HashMap<String, Duration>>,
    start_receives: AtomicU32,
    finish_receives: AtomicU32,
}

impl RemoteLink {
    async fn handle(&self, origin: &str, command: Command) -> Result<Reply> {
        match &command {
            Command::PushState { .. } => {
                let delay = self.delays.lock().unwrap().get(origin).copied();
                if let Some(delay) = delay {
                    tokio::time::sleep(delay).await;
                }
                if self
                    .push_failures
                    .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
                    .is_ok()
                {
                    return Err(Error::Network("link down".into()));
                }
            }
            Command::StartReceive { .. } => {
                self.start_receives.fetch_add(1, Ordering::SeqCst);
            }
            Command::FinishReceive { .. } => {
                self.finish_receives.fetch_add(1, Ordering::SeqCst);
            }
            _ => {}
        }
        self.dispatcher.handle(origin, command).await
    }

    fn fail_next_pushes(&self, count: u32) {
        self.push_failures.store(count, Ordering::SeqCst);
    }

    fn slow_down(&self, origin: &str, delay: Duration) {
        self.delays.lock().unwrap().insert(origin.to_string(), delay);
    }

    fn received(&self) -> usize {
        self.node.cache.len()
    }
}

struct TestNode {
    id: String,
    manager: Arc<StateTransferManager>,
    membership: Arc<ClusterMembership>,
    cache: Arc<MemoryCache>,
}

struct Harness {
    router: Arc<Router>,
    nodes: Vec<TestNode>,
    remote: Arc<RemoteLink>,
    _shutdown: watch::Sender<bool>,
}

fn backup(strategy: BackupStrategy) -> BackupConfig {
    let mut backup = BackupConfig::new("NYC", "nyc-1:7800", strategy);
    backup.chunk_size = 4;
    backup.max_retries = 2;
    backup.wait_time_ms = 0;
    backup.timeout_ms = 5_000;
    backup
}

async fn node(
    id: &str,
    site: &str,
    view: &[&str],
    backups: &[BackupConfig],
    router: &Arc<Router>,
    shutdown: &watch::Receiver<bool>,
) -> TestNode {
    let view = view
        .iter()
        .map(|m| (m.to_string(), format!("{}:7800", m)))
        .collect();
    let membership = Arc::new(ClusterMembership::from_view(
        id.to_string(),
        format!("{}:7800", id),
        view,
        SEGMENTS,
        Duration::from_secs(60),
    ));
    membership.install_topology(false).await;

    let transport: Arc<dyn Transport> = Arc::new(LoopbackTransport {
        local: id.to_string(),
        router: Arc::clone(router),
    });
    let tracker = Arc::new(IracForwarder::spawn(
        site.to_string(),
        Arc::clone(&transport),
        backups,
        shutdown.clone(),
    ));
    let cache = Arc::new(MemoryCache::transactional());
    let manager = StateTransferManager::new(
        site.to_string(),
        backups,
        Arc::clone(&membership),
        transport,
        cache.clone(),
        cache.clone(),
        tracker,
    );
    manager.start().await.unwrap();

    TestNode {
        id: id.to_string(),
        manager,
        membership,
        cache,
    }
}

impl Harness {
    async fn new(members: &[&str], backup: BackupConfig) -> Self {
        let router = Arc::new(Router::default());
        let (shutdown_tx, shutdown_rx) = watch::channel(false);

        let remote_node = node("nyc-1", "NYC", &["nyc-1"], &[], &router, &shutdown_rx).await;
        let remote = Arc::new(RemoteLink {
            dispatcher: Dispatcher::new(Arc::clone(&remote_node.manager)),
            node: remote_node,
            push_failures: AtomicU32::new(0),
            delays: Mutex::new(HashMap::new()),
            start_receives: AtomicU32::new(0),
            finish_receives: AtomicU32::new(0),
        });
        router.sites.write().unwrap().insert("NYC".to_string(), Arc::clone(&remote));

        let mut nodes = Vec::new();
        for id in members {
            let n = node(id, "LON", members, &[backup.clone()], &router, &shutdown_rx).await;
            for i in 0..ENTRIES {
                n.cache.insert(XSiteState::new(
                    format!("key-{}", i).into_bytes(),
                    format!("value-{}", i).into_bytes(),
                    Vec::new(),
                    Vec::new(),
                ));
            }
            let dispatcher: Arc<dyn CommandHandler> = Arc::new(Dispatcher::new(Arc::clone(&n.manager)));
            router.nodes.write().unwrap().insert(id.to_string(), dispatcher);
            nodes.push(n);
        }

        Self {
            router,
            nodes,
            remote,
            _shutdown: shutdown_tx,
        }
    }

    fn node(&self, id: &str) -> &TestNode {
        self.nodes.iter().find(|n| n.id == id).unwrap()
    }

    fn status(&self, id: &str) -> StateTransferStatus {
        self.node(id).manager.get_status()["NYC"]
    }

    /// Drop `id` from every surviving view and install the new topology
    async fn leave(&self, id: &str, rebalance: bool) {
        for n in self.nodes.iter().filter(|n| n.id != id) {
            n.membership.remove_peer(id).await.unwrap();
        }
        self.install(Some(id), rebalance).await;
    }

    async fn install(&self, excluded: Option<&str>, rebalance: bool) {
        let survivors: Vec<_> = self.nodes.iter().filter(|n| Some(n.id.as_str()) != excluded).collect();
        let mut topologies = Vec::new();
        for n in &survivors {
            topologies.push(n.membership.install_topology(rebalance).await);
        }
        for (n, topology) in survivors.iter().zip(&topologies) {
            n.manager.on_topology_updated(topology).await;
        }
    }
}

async fn eventually(what: &str, condition: impl Fn() -> bool) {
    for _ in 0..500 {
        if condition() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("timed out waiting for {}", what);
}

#[tokio::test]
async fn test_sync_push_completes() {
    let h = Harness::new(&["lon-1", "lon-2", "lon-3"], backup(BackupStrategy::Sync)).await;
    let lon1 = &h.node("lon-1").manager;

    lon1.start_push_state("NYC").await.unwrap();
    eventually("push to finish", || h.status("lon-1") == StateTransferStatus::SendOk).await;

    assert_eq!(h.remote.received(), ENTRIES);
    assert_eq!(h.remote.start_receives.load(Ordering::SeqCst), 1);
    eventually("receiver release", || h.remote.node.manager.get_sending_site_name().is_none()).await;
    assert!(lon1.get_running_state_transfers().is_empty());
    // only the coordinator tracks the push
    assert_eq!(h.status("lon-2"), StateTransferStatus::Idle);
}

#[tokio::test]
async fn test_receiver_knows_sender() {
    let h = Harness::new(&["lon-1"], backup(BackupStrategy::Sync)).await;
    h.remote.slow_down("lon-1", Duration::from_millis(50));

    h.node("lon-1").manager.start_push_state("NYC").await.unwrap();
    assert_eq!(h.remote.node.manager.get_sending_site_name().as_deref(), Some("LON"));
    eventually("push to finish", || h.status("lon-1") == StateTransferStatus::SendOk).await;
}

#[tokio::test]
async fn test_transient_failures_are_retried() {
    let h = Harness::new(&["lon-1", "lon-2", "lon-3"], backup(BackupStrategy::Sync)).await;
    h.remote.fail_next_pushes(2);

    h.node("lon-1").manager.start_push_state("NYC").await.unwrap();
    eventually("push to finish", || h.status("lon-1").is_terminal()).await;

    assert_eq!(h.status("lon-1"), StateTransferStatus::SendOk);
    assert_eq!(h.remote.received(), ENTRIES);
}

#[tokio::test]
async fn test_retry_exhaustion_fails_push() {
    let mut config = backup(BackupStrategy::Sync);
    config.max_retries = 1;
    let h = Harness::new(&["lon-1", "lon-2"], config).await;
    h.remote.fail_next_pushes(u32::MAX);

    h.node("lon-1").manager.start_push_state("NYC").await.unwrap();
    eventually("push to fail", || h.status("lon-1").is_terminal()).await;

    assert_eq!(h.status("lon-1"), StateTransferStatus::SendFailed);
    assert_eq!(h.status("lon-1").as_text(), "ERROR");
    eventually("finish receive", || h.remote.finish_receives.load(Ordering::SeqCst) >= 1).await;
    eventually("receiver release", || h.remote.node.manager.get_sending_site_name().is_none()).await;
}

#[tokio::test]
async fn test_unknown_site() {
    let h = Harness::new(&["lon-1"], backup(BackupStrategy::Sync)).await;
    let err = h.node("lon-1").manager.start_push_state("NO_SITE").await.unwrap_err();
    assert_eq!(
        err.to_string(),
        "Unable to pushState to 'NO_SITE'. Incorrect site name: NO_SITE"
    );
    assert_eq!(h.remote.start_receives.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn test_one_push_at_a_time() {
    let h = Harness::new(&["lon-1", "lon-2"], backup(BackupStrategy::Sync)).await;
    h.remote.slow_down("lon-1", Duration::from_millis(100));
    let lon1 = &h.node("lon-1").manager;

    lon1.start_push_state("NYC").await.unwrap();
    assert_eq!(lon1.get_running_state_transfers(), vec!["NYC".to_string()]);
    let err = lon1.start_push_state("NYC").await.unwrap_err();
    assert!(matches!(err, Error::TransferInProgress(_)));

    eventually("push to finish", || h.status("lon-1") == StateTransferStatus::SendOk).await;
}

#[tokio::test]
async fn test_cancel_without_push_is_noop() {
    let h = Harness::new(&["lon-1", "lon-2"], backup(BackupStrategy::Async)).await;
    h.node("lon-1").manager.cancel_push_state("NYC").await.unwrap();
    assert_eq!(h.status("lon-1"), StateTransferStatus::Idle);
}

#[tokio::test]
async fn test_cancel_in_flight() {
    let h = Harness::new(&["lon-1", "lon-2"], backup(BackupStrategy::Sync)).await;
    h.remote.slow_down("lon-1", Duration::from_millis(50));
    h.remote.slow_down("lon-2", Duration::from_millis(50));
    let lon1 = &h.node("lon-1").manager;

    lon1.start_push_state("NYC").await.unwrap();
    lon1.cancel_push_state("NYC").await.unwrap();
    assert_eq!(h.status("lon-1"), StateTransferStatus::SendCanceled);
    assert_eq!(h.remote.finish_receives.load(Ordering::SeqCst), 1);

    tokio::time::sleep(Duration::from_millis(200)).await;
    assert_eq!(h.status("lon-1"), StateTransferStatus::SendCanceled);
    assert!(h.remote.received() < ENTRIES);
}

#[tokio::test]
async fn test_departed_node_does_not_block_completion() {
    let h = Harness::new(&["lon-1", "lon-2", "lon-3"], backup(BackupStrategy::Sync)).await;
    h.remote.slow_down("lon-2", Duration::from_secs(30));
    let lon1 = &h.node("lon-1").manager;

    lon1.start_push_state("NYC").await.unwrap();
    eventually("lon-2 to be the last pending node", || {
        lon1.pending_confirmations("NYC") == vec!["lon-2".to_string()]
    })
    .await;
    assert_eq!(h.status("lon-1"), StateTransferStatus::Sending);

    h.router.crash("lon-2");
    h.leave("lon-2", false).await;

    assert_eq!(h.status("lon-1"), StateTransferStatus::SendOk);
    eventually("finish receive", || h.remote.finish_receives.load(Ordering::SeqCst) >= 1).await;
}

#[tokio::test]
async fn test_coordinator_crash_is_taken_over() {
    let h = Harness::new(&["lon-1", "lon-2", "lon-3"], backup(BackupStrategy::Sync)).await;
    h.remote.slow_down("lon-1", Duration::from_secs(30));

    h.node("lon-1").manager.start_push_state("NYC").await.unwrap();
    eventually("lon-1 to be the last pending node", || {
        h.node("lon-1").manager.pending_confirmations("NYC") == vec!["lon-1".to_string()]
    })
    .await;

    h.router.crash("lon-1");
    h.node("lon-1").manager.stop();
    h.leave("lon-1", false).await;

    eventually("new coordinator to finish", || h.status("lon-2") == StateTransferStatus::SendOk).await;
    assert_eq!(h.remote.received(), ENTRIES);
    eventually("receiver release", || h.remote.node.manager.get_sending_site_name().is_none()).await;
}

#[tokio::test]
async fn test_rebalance_defers_restart() {
    let h = Harness::new(&["lon-1", "lon-2", "lon-3"], backup(BackupStrategy::Sync)).await;
    for id in ["lon-1", "lon-2", "lon-3"] {
        h.remote.slow_down(id, Duration::from_millis(40));
    }
    let lon1 = &h.node("lon-1").manager;

    lon1.start_push_state("NYC").await.unwrap();
    h.install(None, true).await;
    assert_eq!(h.status("lon-1"), StateTransferStatus::Sending);

    h.install(None, false).await;
    eventually("restarted push to finish", || h.status("lon-1") == StateTransferStatus::SendOk).await;
    assert_eq!(h.remote.received(), ENTRIES);
}

#[tokio::test]
async fn test_members_with_different_topology_ids() {
    let h = Harness::new(&["lon-1", "lon-2"], backup(BackupStrategy::Sync)).await;
    // lon-1 went through a view change lon-2 never saw
    h.node("lon-1").membership.install_topology(false).await;
    assert_ne!(
        h.node("lon-1").membership.current_topology().topology_id,
        h.node("lon-2").membership.current_topology().topology_id
    );

    h.node("lon-1").manager.start_push_state("NYC").await.unwrap();
    eventually("push to finish", || h.status("lon-1") == StateTransferStatus::SendOk).await;
    assert_eq!(h.remote.received(), ENTRIES);
    assert_eq!(
        h.node("lon-2").membership.current_topology(),
        h.node("lon-1").membership.current_topology()
    );
}

#[tokio::test]
async fn test_coordinator_with_older_topology_id() {
    let h = Harness::new(&["lon-1", "lon-2"], backup(BackupStrategy::Sync)).await;
    for _ in 0..3 {
        h.node("lon-2").membership.install_topology(false).await;
    }

    h.node("lon-1").manager.start_push_state("NYC").await.unwrap();
    eventually("push to finish", || h.status("lon-1") == StateTransferStatus::SendOk).await;
    assert_eq!(h.remote.received(), ENTRIES);
}

#[tokio::test]
async fn test_completion_from_before_restart_is_ignored() {
    let h = Harness::new(&["lon-1", "lon-2"], backup(BackupStrategy::Sync)).await;
    h.remote.slow_down("lon-2", Duration::from_secs(30));
    let lon1 = &h.node("lon-1").manager;

    lon1.start_push_state("NYC").await.unwrap();
    let first = lon1.push_id("NYC").unwrap();
    eventually("lon-2 to be the last pending node", || {
        lon1.pending_confirmations("NYC") == vec!["lon-2".to_string()]
    })
    .await;

    // a rebalance restarts the push under a new id
    h.install(None, true).await;
    h.install(None, false).await;
    let second = lon1.push_id("NYC").unwrap();
    assert_ne!(first, second);
    eventually("lon-2 to be the last pending node again", || {
        lon1.pending_confirmations("NYC") == vec!["lon-2".to_string()]
    })
    .await;

    let coordinator = h.router.handler("lon-1").unwrap();
    let late = Command::FinishSend {
        site: "NYC".into(),
        push_id: first,
        node: "lon-2".into(),
        ok: true,
    };
    coordinator.handle("lon-2", late).await.unwrap();
    assert_eq!(h.status("lon-1"), StateTransferStatus::Sending);
    assert_eq!(lon1.pending_confirmations("NYC"), vec!["lon-2".to_string()]);

    let current = Command::FinishSend {
        site: "NYC".into(),
        push_id: second,
        node: "lon-2".into(),
        ok: true,
    };
    coordinator.handle("lon-2", current).await.unwrap();
    assert_eq!(h.status("lon-1"), StateTransferStatus::SendOk);
}

#[tokio::test]
async fn test_cluster_status_and_clear() {
    let h = Harness::new(&["lon-1", "lon-2", "lon-3"], backup(BackupStrategy::Sync)).await;
    h.node("lon-1").manager.start_push_state("NYC").await.unwrap();
    eventually("push to finish", || h.status("lon-1") == StateTransferStatus::SendOk).await;

    // an unreachable member contributes nothing
    h.router.crash("lon-3");
    let lon2 = &h.node("lon-2").manager;
    let merged = lon2.get_cluster_status().await.unwrap();
    assert_eq!(merged["NYC"], StateTransferStatus::SendOk);
    assert_eq!(lon2.get_status()["NYC"], StateTransferStatus::Idle);

    lon2.clear_cluster_status().await.unwrap();
    assert_eq!(h.status("lon-1"), StateTransferStatus::Idle);
}

#[tokio::test]
async fn test_async_push_goes_through_tracking() {
    let h = Harness::new(&["lon-1", "lon-2"], backup(BackupStrategy::Async)).await;

    h.node("lon-1").manager.start_push_state("NYC").await.unwrap();
    eventually("push to finish", || h.status("lon-1") == StateTransferStatus::SendOk).await;
    eventually("tracked chunks to arrive", || h.remote.received() == ENTRIES).await;
    assert_eq!(h.remote.start_receives.load(Ordering::SeqCst), 0);
    assert_eq!(h.remote.finish_receives.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn test_automatic_transfer() {
    let mut config = backup(BackupStrategy::Async);
    config.mode = XSiteStateTransferMode::Auto;
    let h = Harness::new(&["lon-1", "lon-2"], config).await;

    // nothing is offline, nothing to do
    h.node("lon-1").manager.on_sites_up(&["NYC".to_string()]).await;
    assert_eq!(h.status("lon-1"), StateTransferStatus::Idle);

    assert!(h.node("lon-2").manager.take_site_offline("NYC"));
    h.node("lon-1").manager.on_sites_up(&["NYC".to_string()]).await;

    assert!(!h.node("lon-2").manager.take_site_offline("NO_SITE"));
    assert_eq!(
        h.node("lon-2").manager.site_state("NYC"),
        Some(crate::state::SiteState::Online)
    );
    eventually("automatic push to finish", || h.status("lon-1") == StateTransferStatus::SendOk).await;
    eventually("tracked chunks to arrive", || h.remote.received() == ENTRIES).await;
}

#[tokio::test]
async fn test_automatic_transfer_needs_every_member_in_auto() {
    let mut config = backup(BackupStrategy::Async);
    config.mode = XSiteStateTransferMode::Auto;
    let h = Harness::new(&["lon-1", "lon-2"], config).await;

    assert!(h
        .node("lon-2")
        .manager
        .set_automatic_state_transfer("NYC", XSiteStateTransferMode::Manual));
    h.node("lon-1").manager.take_site_offline("NYC");
    h.node("lon-1").manager.on_sites_up(&["NYC".to_string()]).await;
    assert_eq!(h.status("lon-1"), StateTransferStatus::Idle);
}

#[tokio::test]
async fn test_automatic_mode_rejected_for_sync() {
    let h = Harness::new(&["lon-1"], backup(BackupStrategy::Sync)).await;
    let manager = &h.node("lon-1").manager;
    assert!(!manager.set_automatic_state_transfer("NYC", XSiteStateTransferMode::Auto));
    assert!(!manager.set_automatic_state_transfer("NO_SITE", XSiteStateTransferMode::Auto));
    assert_eq!(manager.get_automatic_state_transfer("NYC"), Some(XSiteStateTransferMode::Manual));
    assert_eq!(manager.get_automatic_state_transfer("NO_SITE"), None);
}

#[tokio::test]
async fn test_second_sender_is_rejected() {
    let h = Harness::new(&["lon-1"], backup(BackupStrategy::Sync)).await;
    let remote = &h.remote.dispatcher;

    remote
        .handle("lon-1", Command::StartReceive { site: "LON".into() })
        .await
        .unwrap();
    let err = remote
        .handle("sfo-1", Command::StartReceive { site: "SFO".into() })
        .await
        .unwrap_err();
    assert!(matches!(err, Error::ConcurrentReceive { .. }));

    h.remote.node.manager.cancel_receive("LON").await.unwrap();
    assert_eq!(h.remote.node.manager.get_sending_site_name(), None);
}
