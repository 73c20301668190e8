//! Confirmation Collector
//!
//! Tracks which local nodes still have to report the end of their push.

use std::collections::HashSet;
use std::sync::Mutex;

#[derive(Debug)]
struct Pending {
    nodes: HashSet<String>,
    all_ok: bool,
}

/// Per-push tracker of the nodes that have not finished sending yet
#[derive(Debug)]
pub struct ConfirmationCollector {
    /// Members expected to take part, as of the push start
    members: Vec<String>,
    pending: Mutex<Pending>,
}

impl ConfirmationCollector {
    /// Create a collector expecting a confirmation from each member
    pub fn new(members: Vec<String>) -> Self {
        let nodes = members.iter().cloned().collect();
        Self {
            members,
            pending: Mutex::new(Pending { nodes, all_ok: true }),
        }
    }

    /// Record that `node` finished its push.
    ///
    /// Returns `true` only when this removal emptied the pending set. A repeated
    /// confirmation for a node that was already removed never returns `true`,
    /// even though the set is empty by then.
    pub fn confirm(&self, node: &str, ok: bool) -> bool {
        let mut pending = self.lock();
        if !ok {
            pending.all_ok = false;
        }
        pending.nodes.remove(node) && pending.nodes.is_empty()
    }

    /// Drop pending nodes that are no longer cluster members.
    ///
    /// Returns `true` if this emptied a non-empty pending set.
    pub fn update_members(&self, members: &[String]) -> bool {
        let mut pending = self.lock();
        if pending.nodes.is_empty() {
            return false;
        }
        pending.nodes.retain(|n| members.iter().any(|m| m == n));
        pending.nodes.is_empty()
    }

    /// Whether every confirmation so far reported success
    pub fn is_ok(&self) -> bool {
        self.lock().all_ok
    }

    /// Nodes that have not confirmed yet
    pub fn pending(&self) -> Vec<String> {
        let mut nodes: Vec<String> = self.lock().nodes.iter().cloned().collect();
        nodes.sort();
        nodes
    }

    /// The members this collector was created with
    pub fn members(&self) -> &[String] {
        &self.members
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Pending> {
        // A poisoned lock only means another confirmer panicked; the set is still usable.
        self.pending.lock().unwrap_or_else(|e| e.into_inner())
    }
}
