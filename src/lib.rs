//! xsitepush - Cross-site state transfer for replicated cache clusters
//!
//! Pushes the full contents of one cache cluster (a site) to a remote backup
//! site, coordinated across the local cluster members.
//!
//! # Architecture
//!
//! Every member pushes the segments it primarily owns. The member that
//! started the push (the originator) collects confirmations from the others
//! and reports the aggregate outcome; if it leaves, the first member of the
//! new view takes over and restarts the push. On the receiving site the
//! inbound consumer applies chunks through the local write pipeline.
//!
//! # Features
//!
//! - Synchronous backups with per-chunk retries, asynchronous backups through
//!   a background forwarding queue
//! - Coordinator failover and restart after rebalance
//! - Cluster-wide status with IDLE/SENDING/OK/ERROR/CANCELED aggregation
//! - Automatic push when an offline site becomes reachable again
//! - Framed TCP transport, heartbeats, and an HTTP operator API

pub mod api;
pub mod cache;
pub mod config;
pub mod error;
pub mod network;
pub mod rpc;
pub mod state;
pub mod transfer;

pub use config::XSiteConfig;
pub use error::{Error, Result};

/// Re-export commonly used types
pub mod prelude {
    pub use crate::config::{BackupConfig, BackupStrategy, XSiteConfig};
    pub use crate::error::{Error, Result};
    pub use crate::state::{ClusterMembership, StateTransferStatus, XSiteStateTransferMode};
    pub use crate::transfer::{Command, Message, StateTransferManager};
}
