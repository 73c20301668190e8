//! Asynchronous backup forwarding
//!
//! Chunks handed over for an asynchronous backup are queued and delivered to
//! the remote site in the background. Every site has its own queue and
//! delivery task, so an unreachable site only holds up its own chunks.
//! A chunk that fails with a retryable error is retried until it is
//! delivered or the node shuts down; any other error drops it.

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::{mpsc, watch};

use super::{ConflictTracker, XSiteState};
use crate::config::BackupConfig;
use crate::error::{Error, Result};
use crate::rpc::Transport;
use crate::transfer::Command;

const MIN_RETRY_DELAY: Duration = Duration::from_millis(10);

struct SiteQueue {
    queue: mpsc::UnboundedSender<Vec<XSiteState>>,
    pending: Arc<AtomicUsize>,
}

/// Delivers one site's queued chunks in order
struct SiteWorker {
    site: String,
    local_site: String,
    transport: Arc<dyn Transport>,
    timeout: Duration,
    retry_delay: Duration,
    pending: Arc<AtomicUsize>,
}

impl SiteWorker {
    async fn run(self, mut rx: mpsc::UnboundedReceiver<Vec<XSiteState>>, mut shutdown: watch::Receiver<bool>) {
        loop {
            let chunk = tokio::select! {
                next = rx.recv() => match next {
                    Some(chunk) => chunk,
                    None => break,
                },
                _ = shutdown.changed() => break,
            };
            if !self.deliver(&chunk, &mut shutdown).await {
                break;
            }
            self.pending.fetch_sub(1, Ordering::SeqCst);
        }
        tracing::debug!("Async backup forwarding to {} stopped", self.site);
    }

    /// Returns `false` if shutdown interrupted the retries
    async fn deliver(&self, chunk: &[XSiteState], shutdown: &mut watch::Receiver<bool>) -> bool {
        let mut attempt = 1u32;
        loop {
            let command = Command::PushState {
                site: self.local_site.clone(),
                chunk: chunk.to_vec(),
            };
            match self.transport.invoke_site(&self.site, command, self.timeout).await {
                Ok(_) => {
                    tracing::debug!("Delivered {} entries to {}", chunk.len(), self.site);
                    return true;
                }
                Err(e) if !e.is_retryable() => {
                    tracing::error!("Dropping {} entries for {}: {}", chunk.len(), self.site, e);
                    return true;
                }
                Err(e) => {
                    tracing::warn!(
                        "Delivery of {} entries to {} failed (attempt {}): {}",
                        chunk.len(),
                        self.site,
                        attempt,
                        e
                    );
                    attempt += 1;
                    tokio::select! {
                        _ = tokio::time::sleep(self.retry_delay) => {}
                        _ = shutdown.changed() => return false,
                    }
                }
            }
        }
    }
}

/// Background delivery queues for asynchronous backups
pub struct IracForwarder {
    sites: HashMap<String, SiteQueue>,
}

impl IracForwarder {
    /// Start one delivery task per asynchronous backup in `backups`.
    ///
    /// `local_site` is the name chunks are pushed under.
    pub fn spawn(
        local_site: String,
        transport: Arc<dyn Transport>,
        backups: &[BackupConfig],
        shutdown: watch::Receiver<bool>,
    ) -> Self {
        let sites = backups
            .iter()
            .filter(|b| !b.is_sync())
            .map(|backup| {
                let (queue, rx) = mpsc::unbounded_channel();
                let pending = Arc::new(AtomicUsize::new(0));
                let worker = SiteWorker {
                    site: backup.site.clone(),
                    local_site: local_site.clone(),
                    transport: Arc::clone(&transport),
                    timeout: backup.timeout(),
                    retry_delay: backup.wait_time().max(MIN_RETRY_DELAY),
                    pending: Arc::clone(&pending),
                };
                tokio::spawn(worker.run(rx, shutdown.clone()));
                (backup.site.clone(), SiteQueue { queue, pending })
            })
            .collect();

        Self { sites }
    }

    /// Chunks queued or in delivery, over every site
    pub fn pending(&self) -> usize {
        self.sites
            .values()
            .map(|q| q.pending.load(Ordering::SeqCst))
            .sum()
    }

    /// Chunks queued or in delivery for `site`
    pub fn pending_for(&self, site: &str) -> usize {
        self.sites
            .get(site)
            .map_or(0, |q| q.pending.load(Ordering::SeqCst))
    }
}

#[async_trait]
impl ConflictTracker for IracForwarder {
    async fn track_for_state_transfer(&self, site: &str, chunk: Vec<XSiteState>) -> Result<()> {
        let site_queue = self
            .sites
            .get(site)
            .ok_or_else(|| Error::UnknownSite(site.to_string()))?;
        site_queue.pending.fetch_add(1, Ordering::SeqCst);
        if site_queue.queue.send(chunk).is_err() {
            site_queue.pending.fetch_sub(1, Ordering::SeqCst);
            return Err(Error::ShuttingDown);
        }
        Ok(())
    }
}
