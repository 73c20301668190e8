//! xsitepush Error Types

use thiserror::Error;

/// Result type alias for xsitepush operations
pub type Result<T> = std::result::Result<T, Error>;

/// xsitepush error types
#[derive(Error, Debug)]
pub enum Error {
    // Configuration errors
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Invalid configuration file: {0}")]
    ConfigParse(#[from] toml::de::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] bincode::Error),

    // State transfer errors
    #[error("Unable to pushState to '{0}'. Incorrect site name: {0}")]
    UnknownSite(String),

    #[error("State transfer to site {0} is already in progress")]
    TransferInProgress(String),

    #[error("Already receiving state from site {current}, rejecting state from {requested}")]
    ConcurrentReceive { current: String, requested: String },

    #[error("Remote site {site} failed to accept state: {reason}")]
    RemoteSite { site: String, reason: String },

    // Storage errors
    #[error("Storage error: {0}")]
    Storage(String),

    #[error("Transaction error: {0}")]
    Transaction(String),

    // Network errors
    #[error("Network error: {0}")]
    Network(String),

    #[error("Connection failed to {address}: {reason}")]
    ConnectionFailed { address: String, reason: String },

    #[error("Connection timeout to {0}")]
    ConnectionTimeout(String),

    #[error("Node {0} is not a member of the cluster")]
    SuspectNode(String),

    #[error("Node {node} replied with an error: {message}")]
    Remote { node: String, message: String },

    #[error("{} node(s) failed: {}", .0.len(), join_errors(.0))]
    Aggregate(Vec<Error>),

    // I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    // Internal errors
    #[error("Internal error: {0}")]
    Internal(String),

    #[error("Operation cancelled")]
    Cancelled,

    #[error("Shutdown in progress")]
    ShuttingDown,
}

fn join_errors(errors: &[Error]) -> String {
    errors
        .iter()
        .map(|e| e.to_string())
        .collect::<Vec<_>>()
        .join("; ")
}

impl Error {
    /// Check if this error is a remote failure worth retrying
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Error::ConnectionTimeout(_)
                | Error::ConnectionFailed { .. }
                | Error::Network(_)
                | Error::RemoteSite { .. }
                | Error::Remote { .. }
                | Error::Io(_)
        )
    }

    /// Check if this error means the peer is gone (unreachable or left the view)
    ///
    /// Cluster-wide aggregations treat these as "no contribution" instead of failures.
    pub fn is_suspect(&self) -> bool {
        matches!(
            self,
            Error::SuspectNode(_) | Error::ConnectionFailed { .. }
        )
    }
}
