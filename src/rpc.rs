//! RPC seam
//!
//! How commands reach other local cluster members and remote sites. The
//! production implementation is `network::TcpTransport`.

use std::time::Duration;

use async_trait::async_trait;

use crate::error::{Error, Result};
use crate::transfer::{Command, Reply};

/// Delivers commands to local members and remote sites
#[async_trait]
pub trait Transport: Send + Sync {
    /// Invoke a command on one member of the local cluster
    async fn invoke(&self, target: &str, command: Command) -> Result<Reply>;

    /// Invoke a command on a remote site
    async fn invoke_site(&self, site: &str, command: Command, timeout: Duration) -> Result<Reply>;
}

/// Send `command` to every target concurrently and collect each outcome
pub async fn broadcast(
    transport: &dyn Transport,
    targets: &[String],
    command: &Command,
) -> Vec<(String, Result<Reply>)> {
    let calls = targets.iter().map(|target| async move {
        let result = transport.invoke(target, command.clone()).await;
        (target.clone(), result)
    });
    futures::future::join_all(calls).await
}

/// Broadcast ignoring members that have left.
///
/// Replies from departed or unreachable members are dropped; any other
/// failure is returned, aggregated when there is more than one.
pub async fn broadcast_ignore_leavers(
    transport: &dyn Transport,
    targets: &[String],
    command: &Command,
) -> Result<Vec<(String, Reply)>> {
    let mut replies = Vec::with_capacity(targets.len());
    let mut errors = Vec::new();

    for (target, result) in broadcast(transport, targets, command).await {
        match result {
            Ok(reply) => replies.push((target, reply)),
            Err(e) if e.is_suspect() => {
                tracing::debug!("Ignoring {} from departed node {}: {}", command.type_name(), target, e);
            }
            Err(e) => errors.push(e),
        }
    }

    match errors.len() {
        0 => Ok(replies),
        1 => Err(errors.remove(0)),
        _ => Err(Error::Aggregate(errors)),
    }
}
