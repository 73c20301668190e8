//! Outbound Provider
//!
//! Owns at most one push per remote site on this node. The per-site record
//! outlives the push itself until the site's sends are canceled, so the
//! originator of a finished push is still known when a coordinator leaves.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

use tokio::sync::mpsc;

use super::push_task::{owned_entries, CancelHandle, ChunkStream, Delivery, PushOutcome, PushTask};
use crate::cache::{ConflictTracker, EntrySource};
use crate::config::BackupConfig;
use crate::error::Error;
use crate::rpc::Transport;
use crate::state::{CacheTopology, ClusterMembership};

/// Reported once per push when it ends
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PushCompletion {
    pub site: String,
    /// Coordinator that asked for the push
    pub originator: String,
    /// The coordinator's id for the push
    pub push_id: u64,
    /// Node that ran the push
    pub node: String,
    pub outcome: PushOutcome,
}

#[derive(Debug)]
struct PushRecord {
    originator: String,
    push_id: u64,
    cancel: Arc<CancelHandle>,
    generation: u64,
    finished: bool,
}

/// Starts, tracks and cancels local pushes
pub struct OutboundProvider {
    node_id: String,
    local_site: String,
    source: Arc<dyn EntrySource>,
    membership: Arc<ClusterMembership>,
    transport: Arc<dyn Transport>,
    tracker: Arc<dyn ConflictTracker>,
    records: Arc<Mutex<HashMap<String, PushRecord>>>,
    completions: mpsc::UnboundedSender<PushCompletion>,
    generation: AtomicU64,
}

impl OutboundProvider {
    pub fn new(
        local_site: String,
        source: Arc<dyn EntrySource>,
        membership: Arc<ClusterMembership>,
        transport: Arc<dyn Transport>,
        tracker: Arc<dyn ConflictTracker>,
        completions: mpsc::UnboundedSender<PushCompletion>,
    ) -> Self {
        Self {
            node_id: membership.node_id().to_string(),
            local_site,
            source,
            membership,
            transport,
            tracker,
            records: Arc::new(Mutex::new(HashMap::new())),
            completions,
            generation: AtomicU64::new(1),
        }
    }

    /// Start push `push_id` to `backup.site` on behalf of `originator`.
    ///
    /// The entries sent are the ones the coordinator's `topology` makes this
    /// node the primary owner of. The topology is installed locally first if
    /// it is newer than the local one, so the push never waits on a topology
    /// this node would not install by itself.
    ///
    /// The same push already running is left alone and `false` is returned.
    /// A running push whose originator left the cluster, or that belongs to
    /// another push id, is replaced.
    pub async fn start_state_transfer(
        &self,
        backup: &BackupConfig,
        originator: &str,
        push_id: u64,
        topology: CacheTopology,
    ) -> bool {
        let members = self.membership.members().await;
        let site = backup.site.clone();

        let (cancel, generation) = {
            let mut records = self.records();
            if let Some(existing) = records.get(&site) {
                if !existing.finished {
                    let departed = !members.contains(&existing.originator);
                    if !departed && existing.push_id == push_id {
                        tracing::debug!("Push {} to {} already running for {}", push_id, site, existing.originator);
                        return false;
                    }
                    if departed {
                        tracing::warn!(
                            "Push to {} belongs to departed coordinator {}, restarting for {}",
                            site,
                            existing.originator,
                            originator
                        );
                    } else {
                        tracing::info!("Push {} to {} replaced by push {}", existing.push_id, site, push_id);
                    }
                    existing.cancel.cancel();
                }
            }

            let cancel = CancelHandle::new();
            let generation = self.generation.fetch_add(1, Ordering::SeqCst);
            records.insert(
                site.clone(),
                PushRecord {
                    originator: originator.to_string(),
                    push_id,
                    cancel: Arc::clone(&cancel),
                    generation,
                    finished: false,
                },
            );
            (cancel, generation)
        };

        let delivery = if backup.is_sync() {
            Delivery::Sync(Arc::clone(&self.transport))
        } else {
            Delivery::Async(Arc::clone(&self.tracker))
        };
        let task = PushTask::new(backup.clone(), self.local_site.clone(), originator.to_string(), cancel.clone());
        let chunk_size = backup.chunk_size;
        let node_id = self.node_id.clone();
        let source = Arc::clone(&self.source);
        let membership = Arc::clone(&self.membership);
        let records = Arc::clone(&self.records);
        let completions = self.completions.clone();

        tracing::info!(
            "Starting push {} to {} for coordinator {} (topology {})",
            push_id,
            site,
            originator,
            topology.topology_id
        );
        membership.adopt_topology(&topology);

        tokio::spawn(async move {
            let installed = tokio::select! {
                installed = membership.wait_for_topology(topology.topology_id) => installed,
                _ = cancel.canceled() => Err(Error::Cancelled),
            };

            let outcome = match installed {
                Ok(_) => {
                    let segments = topology.primary_segments(&node_id);
                    let chunks = ChunkStream::new(owned_entries(source, &segments), chunk_size);
                    task.execute(chunks, &delivery).await
                }
                Err(_) if cancel.is_canceled() => PushOutcome::Canceled,
                Err(e) => {
                    tracing::error!("Push to {} could not start: {}", task.site(), e);
                    PushOutcome::Failed
                }
            };

            if let Some(record) = lock(&records).get_mut(task.site()) {
                if record.generation == generation {
                    record.finished = true;
                }
            }

            let completion = PushCompletion {
                site: task.site().to_string(),
                originator: task.originator().to_string(),
                push_id,
                node: node_id,
                outcome,
            };
            if completions.send(completion).is_err() {
                tracing::debug!("Push completion for {} dropped, manager stopped", task.site());
            }
        });

        true
    }

    /// Cancel the push to `site` and forget it. Returns `false` if there was none.
    pub fn cancel_state_transfer(&self, site: &str) -> bool {
        match self.records().remove(site) {
            Some(record) => {
                if !record.finished {
                    tracing::info!("Canceling push to {}", site);
                }
                record.cancel.cancel();
                true
            }
            None => false,
        }
    }

    /// Cancel every local push
    pub fn cancel_all(&self) {
        for (site, record) in self.records().drain() {
            if !record.finished {
                tracing::info!("Canceling push to {}", site);
            }
            record.cancel.cancel();
        }
    }

    /// Sites whose push was requested by a node that is not in `members`
    pub fn sites_missing_coordinator(&self, members: &[String]) -> Vec<String> {
        let mut sites: Vec<_> = self
            .records()
            .iter()
            .filter(|(_, r)| !members.contains(&r.originator))
            .map(|(site, _)| site.clone())
            .collect();
        sites.sort();
        sites
    }

    /// Whether a push to `site` is currently running here
    pub fn is_running(&self, site: &str) -> bool {
        self.records().get(site).is_some_and(|r| !r.finished)
    }

    /// Originator recorded for `site`
    pub fn originator(&self, site: &str) -> Option<String> {
        self.records().get(site).map(|r| r.originator.clone())
    }

    fn records(&self) -> MutexGuard<'_, HashMap<String, PushRecord>> {
        lock(&self.records)
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|e| e.into_inner())
}
