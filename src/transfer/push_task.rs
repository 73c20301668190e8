//! Push Task
//!
//! Pulls chunks of locally owned entries and ships them to one remote site.
//! Synchronous backups wait for the remote acknowledgment of each chunk;
//! asynchronous backups hand chunks to conflict tracking.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use tokio::sync::Notify;

use super::protocol::Command;
use super::retry::RetryHelper;
use crate::cache::{ConflictTracker, EntryIter, EntrySource, XSiteState};
use crate::config::BackupConfig;
use crate::error::Result;
use crate::rpc::Transport;
use crate::state::SegmentFilter;

/// How a push ended
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PushOutcome {
    Ok,
    Failed,
    Canceled,
}

impl PushOutcome {
    pub fn is_ok(self) -> bool {
        self == PushOutcome::Ok
    }
}

/// Cooperative cancellation shared between a push and whoever may cancel it
#[derive(Debug, Default)]
pub struct CancelHandle {
    flag: AtomicBool,
    notify: Notify,
}

impl CancelHandle {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn cancel(&self) {
        self.flag.store(true, Ordering::SeqCst);
        self.notify.notify_waiters();
    }

    pub fn is_canceled(&self) -> bool {
        self.flag.load(Ordering::SeqCst)
    }

    /// Resolves once `cancel` has been called
    pub async fn canceled(&self) {
        let notified = self.notify.notified();
        if self.is_canceled() {
            return;
        }
        notified.await;
    }
}

/// Entries to push: memory first, then persisted entries that are not in memory
pub fn owned_entries(source: Arc<dyn EntrySource>, segments: &SegmentFilter) -> EntryIter {
    let memory = source.memory_entries(segments);
    let persisted = source.persisted_entries(segments);
    let not_in_memory = move |entry: &Result<XSiteState>| match entry {
        Ok(state) => !source.contains_in_memory(state.key()),
        Err(_) => true,
    };
    Box::new(memory.chain(persisted.filter(not_in_memory)))
}

/// Groups entries into chunks of at most `chunk_size`
pub struct ChunkStream {
    entries: EntryIter,
    chunk_size: usize,
}

impl ChunkStream {
    pub fn new(entries: EntryIter, chunk_size: usize) -> Self {
        Self {
            entries,
            chunk_size: chunk_size.max(1),
        }
    }
}

impl Iterator for ChunkStream {
    type Item = Result<Vec<XSiteState>>;

    fn next(&mut self) -> Option<Self::Item> {
        let mut chunk = Vec::with_capacity(self.chunk_size);
        while chunk.len() < self.chunk_size {
            match self.entries.next() {
                Some(Ok(state)) => chunk.push(state),
                Some(Err(e)) => return Some(Err(e)),
                None => break,
            }
        }
        if chunk.is_empty() {
            None
        } else {
            Some(Ok(chunk))
        }
    }
}

/// Where chunks go
#[derive(Clone)]
pub enum Delivery {
    /// Straight to the remote site, one acknowledged chunk at a time
    Sync(Arc<dyn Transport>),
    /// Through conflict tracking
    Async(Arc<dyn ConflictTracker>),
}

/// One node's push of its primary-owned entries to one site
pub struct PushTask {
    backup: BackupConfig,
    local_site: String,
    originator: String,
    cancel: Arc<CancelHandle>,
}

impl PushTask {
    pub fn new(backup: BackupConfig, local_site: String, originator: String, cancel: Arc<CancelHandle>) -> Self {
        Self {
            backup,
            local_site,
            originator,
            cancel,
        }
    }

    pub fn site(&self) -> &str {
        &self.backup.site
    }

    /// Coordinator this push reports to
    pub fn originator(&self) -> &str {
        &self.originator
    }

    /// Send every chunk, stopping early on cancellation or permanent failure
    pub async fn execute(&self, mut chunks: ChunkStream, delivery: &Delivery) -> PushOutcome {
        let mut sent = 0usize;

        loop {
            if self.cancel.is_canceled() {
                tracing::info!("Push to {} canceled after {} entries", self.site(), sent);
                return PushOutcome::Canceled;
            }

            let chunk = match chunks.next() {
                Some(Ok(chunk)) => chunk,
                Some(Err(e)) => {
                    tracing::error!("Failed to read entries for push to {}: {}", self.site(), e);
                    return PushOutcome::Failed;
                }
                None => break,
            };

            let size = chunk.len();
            if let Err(e) = self.deliver(chunk, delivery).await {
                if self.cancel.is_canceled() {
                    return PushOutcome::Canceled;
                }
                tracing::error!("Push to {} failed after {} entries: {}", self.site(), sent, e);
                return PushOutcome::Failed;
            }
            sent += size;
            tracing::debug!("Pushed {} entries to {} ({} so far)", size, self.site(), sent);
        }

        if self.cancel.is_canceled() {
            return PushOutcome::Canceled;
        }
        tracing::info!("Push to {} finished, {} entries sent", self.site(), sent);
        PushOutcome::Ok
    }

    async fn deliver(&self, chunk: Vec<XSiteState>, delivery: &Delivery) -> Result<()> {
        match delivery {
            Delivery::Sync(transport) => {
                let transport: &dyn Transport = transport.as_ref();
                let site = self.backup.site.as_str();
                let local_site = self.local_site.as_str();
                let timeout = self.backup.timeout();
                let helper = RetryHelper::new(self.backup.max_retries, self.backup.wait_time());
                helper
                    .run(move || {
                        let command = Command::PushState {
                            site: local_site.to_string(),
                            chunk: chunk.clone(),
                        };
                        transport.invoke_site(site, command, timeout)
                    })
                    .await?;
                Ok(())
            }
            Delivery::Async(tracker) => tracker.track_for_state_transfer(self.site(), chunk).await,
        }
    }
}
