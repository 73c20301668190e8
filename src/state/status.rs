//! Transfer Status
//!
//! Per-site state transfer outcome and the automatic transfer mode.

use serde::{Deserialize, Serialize};

/// Outcome of the most recent state transfer to a remote site
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum StateTransferStatus {
    /// No transfer has run (or the status was cleared)
    Idle,
    /// A transfer is in flight
    Sending,
    /// Every participating node finished successfully
    SendOk,
    /// At least one participating node failed
    SendFailed,
    /// The transfer was canceled
    SendCanceled,
}

impl StateTransferStatus {
    /// Combine two observations of the same site's status.
    ///
    /// `Idle` is the identity, `Sending` yields to any terminal status, and
    /// terminal statuses resolve as `SendOk < SendFailed < SendCanceled`.
    pub fn merge(a: Self, b: Self) -> Self {
        if a.rank() >= b.rank() {
            a
        } else {
            b
        }
    }

    fn rank(self) -> u8 {
        match self {
            StateTransferStatus::Idle => 0,
            StateTransferStatus::Sending => 1,
            StateTransferStatus::SendOk => 2,
            StateTransferStatus::SendFailed => 3,
            StateTransferStatus::SendCanceled => 4,
        }
    }

    /// Whether this is a final outcome
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            StateTransferStatus::SendOk
                | StateTransferStatus::SendFailed
                | StateTransferStatus::SendCanceled
        )
    }

    /// Operator-facing text
    pub fn as_text(self) -> &'static str {
        match self {
            StateTransferStatus::Idle => "IDLE",
            StateTransferStatus::Sending => "SENDING",
            StateTransferStatus::SendOk => "OK",
            StateTransferStatus::SendFailed => "ERROR",
            StateTransferStatus::SendCanceled => "CANCELED",
        }
    }

    /// Parse operator-facing text
    pub fn from_text(text: &str) -> Option<Self> {
        match text {
            "IDLE" => Some(StateTransferStatus::Idle),
            "SENDING" => Some(StateTransferStatus::Sending),
            "OK" => Some(StateTransferStatus::SendOk),
            "ERROR" => Some(StateTransferStatus::SendFailed),
            "CANCELED" => Some(StateTransferStatus::SendCanceled),
            _ => None,
        }
    }
}

impl std::fmt::Display for StateTransferStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_text())
    }
}

/// Whether a push is started automatically when a site becomes reachable
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum XSiteStateTransferMode {
    /// Only an operator starts a push
    #[default]
    Manual,
    /// The coordinator starts a push once the site is back (async backups only)
    Auto,
}

impl std::fmt::Display for XSiteStateTransferMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            XSiteStateTransferMode::Manual => write!(f, "MANUAL"),
            XSiteStateTransferMode::Auto => write!(f, "AUTO"),
        }
    }
}
