//! State Management Module
//!
//! Per-site transfer state, confirmation tracking, site availability,
//! and the local cluster view.

mod availability;
mod collector;
mod membership;
mod remote_site;
mod status;
mod topology;

pub use availability::{SiteAvailability, SiteState};
pub use collector::ConfirmationCollector;
pub use membership::{ClusterMembership, NodeState, NodeStatus};
pub use remote_site::{RemoteSiteStatus, TransferPhase};
pub use status::{StateTransferStatus, XSiteStateTransferMode};
pub use topology::{CacheTopology, KeyPartitioner, SegmentFilter};
