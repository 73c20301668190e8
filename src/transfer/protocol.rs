//! State Transfer Protocol
//!
//! Defines the control commands exchanged between nodes and sites, and the
//! framed wire messages that carry them.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::cache::XSiteState;
use crate::error::Error;
use crate::state::{CacheTopology, StateTransferStatus, XSiteStateTransferMode};

/// Control commands. Receivers interpret them against their own local
/// components; nothing about the sender's context travels with them.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Command {
    // ========== Sending side, local cluster ==========
    /// Start push `push_id` of the data `topology` makes this node the
    /// primary owner of
    StartSend {
        site: String,
        originator: String,
        push_id: u64,
        topology: CacheTopology,
    },

    /// A node finished its part of push `push_id` to `site`
    FinishSend {
        site: String,
        push_id: u64,
        node: String,
        ok: bool,
    },

    /// Stop pushing to `site`
    CancelSend { site: String },

    /// Cancel and start pushing again under a new originator or push id
    RestartSend {
        site: String,
        originator: String,
        push_id: u64,
        topology: CacheTopology,
    },

    /// Ask a node for its local status map
    StatusRequest,

    /// Reset terminal statuses to idle
    ClearStatus,

    /// Ask a node whether an automatic push to `site` is warranted
    AutoTransferStatus { site: String },

    /// Mark `site` online
    BringOnline { site: String },

    // ========== Receiving side ==========
    /// `site` is about to push its state here
    StartReceive { site: String },

    /// `site` has finished (or abandoned) its push
    FinishReceive { site: String },

    /// One chunk of state pushed from `site`
    PushState { site: String, chunk: Vec<XSiteState> },
}

impl Command {
    /// Get the command name (for logging)
    pub fn type_name(&self) -> &'static str {
        match self {
            Command::StartSend { .. } => "START_SEND",
            Command::FinishSend { .. } => "FINISH_SEND",
            Command::CancelSend { .. } => "CANCEL_SEND",
            Command::RestartSend { .. } => "RESTART_SEND",
            Command::StatusRequest => "STATUS_REQUEST",
            Command::ClearStatus => "CLEAR_STATUS",
            Command::AutoTransferStatus { .. } => "AUTO_TRANSFER_STATUS",
            Command::BringOnline { .. } => "BRING_ONLINE",
            Command::StartReceive { .. } => "START_RECEIVE",
            Command::FinishReceive { .. } => "FINISH_RECEIVE",
            Command::PushState { .. } => "PUSH_STATE",
        }
    }
}

/// Replies to commands
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Reply {
    /// Command applied
    Ack,

    /// Local status per site
    Status(BTreeMap<String, StateTransferStatus>),

    /// Automatic transfer probe answer
    AutoStatus {
        offline: bool,
        mode: XSiteStateTransferMode,
    },
}

/// Wire messages
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Message {
    /// A command sent by `origin`
    Request { origin: String, command: Command },

    /// Successful reply
    Response { reply: Reply },

    /// Error response
    Error { code: ErrorCode, message: String },

    /// Membership heartbeat
    Heartbeat { node_id: String, address: String },

    /// Heartbeat answer
    HeartbeatAck { node_id: String },
}

impl Message {
    /// Serialize message to bytes
    pub fn serialize(&self) -> Result<Vec<u8>, bincode::Error> {
        bincode::serialize(self)
    }

    /// Deserialize message from bytes
    pub fn deserialize(bytes: &[u8]) -> Result<Self, bincode::Error> {
        bincode::deserialize(bytes)
    }

    /// Get the message type name (for logging)
    pub fn type_name(&self) -> &'static str {
        match self {
            Message::Request { command, .. } => command.type_name(),
            Message::Response { .. } => "Response",
            Message::Error { .. } => "Error",
            Message::Heartbeat { .. } => "Heartbeat",
            Message::HeartbeatAck { .. } => "HeartbeatAck",
        }
    }

    /// Build the error response for a failed command
    pub fn from_error(err: &Error) -> Self {
        Message::Error {
            code: ErrorCode::of(err),
            message: err.to_string(),
        }
    }
}

/// Error codes for protocol errors
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ErrorCode {
    /// Site is not a configured backup
    UnknownSite,
    /// Receiver is already taking state from another site
    ConcurrentReceive,
    /// Receiver is not part of the cluster (any more)
    NotMember,
    /// Receiver is stopping
    ShuttingDown,
    /// Anything else
    Internal,
}

impl ErrorCode {
    /// Classify a local error for the wire
    pub fn of(err: &Error) -> Self {
        match err {
            Error::UnknownSite(_) => ErrorCode::UnknownSite,
            Error::ConcurrentReceive { .. } => ErrorCode::ConcurrentReceive,
            Error::SuspectNode(_) => ErrorCode::NotMember,
            Error::ShuttingDown => ErrorCode::ShuttingDown,
            _ => ErrorCode::Internal,
        }
    }

    /// Rebuild the caller-side error for an error response from `node`.
    ///
    /// A node that has left or is stopping counts as departed.
    pub fn into_error(self, node: &str, message: String) -> Error {
        match self {
            ErrorCode::NotMember | ErrorCode::ShuttingDown => Error::SuspectNode(node.to_string()),
            _ => Error::Remote {
                node: node.to_string(),
                message,
            },
        }
    }
}

/// Frame header for length-prefixed messages
#[derive(Debug, Clone, Copy)]
pub struct FrameHeader {
    /// Message length
    pub length: u32,
    /// Message checksum
    pub checksum: u32,
}

impl FrameHeader {
    /// Header size in bytes
    pub const SIZE: usize = 8;

    /// Create a new frame header
    pub fn new(data: &[u8]) -> Self {
        Self {
            length: data.len() as u32,
            checksum: crc32fast::hash(data),
        }
    }

    /// Serialize header to bytes
    pub fn to_bytes(&self) -> [u8; Self::SIZE] {
        let mut bytes = [0u8; Self::SIZE];
        bytes[0..4].copy_from_slice(&self.length.to_le_bytes());
        bytes[4..8].copy_from_slice(&self.checksum.to_le_bytes());
        bytes
    }

    /// Deserialize header from bytes
    pub fn from_bytes(bytes: &[u8; Self::SIZE]) -> Self {
        let [l0, l1, l2, l3, c0, c1, c2, c3] = *bytes;
        Self {
            length: u32::from_le_bytes([l0, l1, l2, l3]),
            checksum: u32::from_le_bytes([c0, c1, c2, c3]),
        }
    }
}
