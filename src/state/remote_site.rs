//! Remote Site Status
//!
//! The per-backup state machine kept by the coordinator: which transfer is in
//! flight, who still has to confirm, and how the last one ended.

use std::sync::{Arc, Mutex, MutexGuard};

use chrono::{DateTime, Utc};

use super::collector::ConfirmationCollector;
use super::status::{StateTransferStatus, XSiteStateTransferMode};
use crate::config::BackupConfig;

/// Transfer phase of one remote site
#[derive(Debug, Clone)]
pub enum TransferPhase {
    /// Nothing has run yet, or the status was cleared
    Idle,
    /// A push is in flight and `collector` waits for the participating nodes
    Sending {
        /// Identifies this collector in the nodes' completion reports
        push_id: u64,
        collector: Arc<ConfirmationCollector>,
        started_at: DateTime<Utc>,
        /// Sends were canceled by a rebalance and must restart once it ends
        restart_pending: bool,
    },
    /// The last push ended with this status
    Finished(StateTransferStatus),
}

#[derive(Debug)]
struct Inner {
    phase: TransferPhase,
    mode: XSiteStateTransferMode,
    next_push_id: u64,
}

/// State of one configured backup site
#[derive(Debug)]
pub struct RemoteSiteStatus {
    backup: BackupConfig,
    inner: Mutex<Inner>,
}

impl RemoteSiteStatus {
    /// Create the status for a configured backup.
    ///
    /// A synchronous backup always starts in `Manual` mode.
    pub fn new(backup: BackupConfig) -> Self {
        let mode = if backup.is_sync() {
            XSiteStateTransferMode::Manual
        } else {
            backup.mode
        };
        // push ids from a restarted coordinator must not collide with its old ones
        let next_push_id = Utc::now().timestamp_micros().unsigned_abs();
        Self {
            backup,
            inner: Mutex::new(Inner {
                phase: TransferPhase::Idle,
                mode,
                next_push_id,
            }),
        }
    }

    /// Site name
    pub fn site(&self) -> &str {
        &self.backup.site
    }

    /// Backup configuration (address, strategy, timeouts)
    pub fn backup(&self) -> &BackupConfig {
        &self.backup
    }

    /// Whether the remote site acknowledges each chunk
    pub fn is_sync(&self) -> bool {
        self.backup.is_sync()
    }

    /// Current status
    pub fn status(&self) -> StateTransferStatus {
        match &self.lock().phase {
            TransferPhase::Idle => StateTransferStatus::Idle,
            TransferPhase::Sending { .. } => StateTransferStatus::Sending,
            TransferPhase::Finished(status) => *status,
        }
    }

    /// Snapshot of the current phase
    pub fn phase(&self) -> TransferPhase {
        self.lock().phase.clone()
    }

    /// The collector of the in-flight push, if any
    pub fn collector(&self) -> Option<Arc<ConfirmationCollector>> {
        match &self.lock().phase {
            TransferPhase::Sending { collector, .. } => Some(Arc::clone(collector)),
            _ => None,
        }
    }

    /// Enter `Sending` with a fresh collector and return its push id.
    ///
    /// Returns `None` (and changes nothing) if a push is already in flight.
    pub fn start_state_transfer(&self, members: Vec<String>) -> Option<u64> {
        let mut inner = self.lock();
        if matches!(inner.phase, TransferPhase::Sending { .. }) {
            return None;
        }
        Some(inner.begin_sending(members))
    }

    /// Replace the collector of an in-flight push with one for `members`.
    ///
    /// Returns the new push id, or `None` if no push is in flight.
    pub fn restart_state_transfer(&self, members: Vec<String>) -> Option<u64> {
        let mut inner = self.lock();
        if !matches!(inner.phase, TransferPhase::Sending { .. }) {
            return None;
        }
        Some(inner.begin_sending(members))
    }

    /// Push id of the in-flight push
    pub fn push_id(&self) -> Option<u64> {
        match &self.lock().phase {
            TransferPhase::Sending { push_id, .. } => Some(*push_id),
            _ => None,
        }
    }

    /// Record a node's confirmation for push `push_id`.
    ///
    /// Confirmations for any other push are ignored. Returns the terminal
    /// status when this confirmation completed the push.
    pub fn confirm_state_transfer(&self, push_id: u64, node: &str, ok: bool) -> Option<StateTransferStatus> {
        let mut inner = self.lock();
        let finished = match &inner.phase {
            TransferPhase::Sending {
                push_id: current,
                collector,
                ..
            } if *current == push_id => collector
                .confirm(node, ok)
                .then(|| Self::outcome(collector)),
            TransferPhase::Sending { push_id: current, .. } => {
                tracing::debug!(
                    "Ignoring confirmation from {} for push {} to {}, current push is {}",
                    node,
                    push_id,
                    self.backup.site,
                    current
                );
                None
            }
            _ => None,
        };
        if let Some(status) = finished {
            inner.phase = TransferPhase::Finished(status);
        }
        finished
    }

    /// Intersect the pending nodes with the current members.
    ///
    /// Returns the terminal status when departures completed the push.
    pub fn update_members(&self, members: &[String]) -> Option<StateTransferStatus> {
        let mut inner = self.lock();
        let finished = match &inner.phase {
            TransferPhase::Sending { collector, .. } => collector
                .update_members(members)
                .then(|| Self::outcome(collector)),
            _ => None,
        };
        if let Some(status) = finished {
            inner.phase = TransferPhase::Finished(status);
        }
        finished
    }

    /// Move an in-flight push to `SendCanceled`. No-op when nothing is sending.
    pub fn cancel_state_transfer(&self) -> bool {
        self.finish_with(StateTransferStatus::SendCanceled)
    }

    /// Move an in-flight push to `SendFailed`. No-op when nothing is sending.
    pub fn fail_state_transfer(&self) -> bool {
        self.finish_with(StateTransferStatus::SendFailed)
    }

    /// Mark an in-flight push as waiting for the end of a rebalance
    pub fn defer_restart(&self) -> bool {
        let mut inner = self.lock();
        match &mut inner.phase {
            TransferPhase::Sending { restart_pending, .. } => {
                *restart_pending = true;
                true
            }
            _ => false,
        }
    }

    /// If a restart was deferred, start over with a collector for `members`
    /// and return the new push id
    pub fn take_deferred_restart(&self, members: Vec<String>) -> Option<u64> {
        let mut inner = self.lock();
        let deferred = matches!(
            inner.phase,
            TransferPhase::Sending { restart_pending: true, .. }
        );
        deferred.then(|| inner.begin_sending(members))
    }

    /// Reset a terminal status to `Idle`; an in-flight push is left alone
    pub fn clear_status(&self) {
        let mut inner = self.lock();
        if matches!(inner.phase, TransferPhase::Finished(_)) {
            inner.phase = TransferPhase::Idle;
        }
    }

    /// Automatic transfer mode
    pub fn mode(&self) -> XSiteStateTransferMode {
        self.lock().mode
    }

    /// Change the automatic transfer mode.
    ///
    /// Synchronous backups only support `Manual`; returns `false` otherwise.
    pub fn set_mode(&self, mode: XSiteStateTransferMode) -> bool {
        if self.is_sync() && mode == XSiteStateTransferMode::Auto {
            return false;
        }
        self.lock().mode = mode;
        true
    }

    fn finish_with(&self, status: StateTransferStatus) -> bool {
        let mut inner = self.lock();
        if matches!(inner.phase, TransferPhase::Sending { .. }) {
            inner.phase = TransferPhase::Finished(status);
            true
        } else {
            false
        }
    }

    fn outcome(collector: &ConfirmationCollector) -> StateTransferStatus {
        if collector.is_ok() {
            StateTransferStatus::SendOk
        } else {
            StateTransferStatus::SendFailed
        }
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }
}

impl Inner {
    fn begin_sending(&mut self, members: Vec<String>) -> u64 {
        let push_id = self.next_push_id;
        self.next_push_id += 1;
        self.phase = TransferPhase::Sending {
            push_id,
            collector: Arc::new(ConfirmationCollector::new(members)),
            started_at: Utc::now(),
            restart_pending: false,
        };
        push_id
    }
}
