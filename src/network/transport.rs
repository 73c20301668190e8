//! TCP Transport
//!
//! `Transport` over framed TCP: local members are addressed through the
//! membership view, remote sites through their configured address.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;

use super::NetworkClient;
use crate::config::BackupConfig;
use crate::error::{Error, Result};
use crate::rpc::Transport;
use crate::state::ClusterMembership;
use crate::transfer::{Command, ErrorCode, Message, Reply};

/// Production transport
pub struct TcpTransport {
    membership: Arc<ClusterMembership>,
    client: NetworkClient,
    /// Site name -> remote address
    sites: HashMap<String, String>,
}

impl TcpTransport {
    pub fn new(
        membership: Arc<ClusterMembership>,
        client: NetworkClient,
        backups: &[BackupConfig],
    ) -> Self {
        let sites = backups
            .iter()
            .map(|b| (b.site.clone(), b.address.clone()))
            .collect();
        Self {
            membership,
            client,
            sites,
        }
    }

    fn request(&self, command: Command) -> Message {
        Message::Request {
            origin: self.membership.node_id().to_string(),
            command,
        }
    }
}

fn into_reply(response: Message, peer: &str) -> Result<Reply> {
    match response {
        Message::Response { reply } => Ok(reply),
        Message::Error { code, message } => Err(code.into_error(peer, message)),
        other => Err(Error::Network(format!(
            "Unexpected {} from {}",
            other.type_name(),
            peer
        ))),
    }
}

#[async_trait]
impl Transport for TcpTransport {
    async fn invoke(&self, target: &str, command: Command) -> Result<Reply> {
        let address = self
            .membership
            .address_of(target)
            .await
            .ok_or_else(|| Error::SuspectNode(target.to_string()))?;

        let response = self.client.send(&address, self.request(command)).await?;
        into_reply(response, target)
    }

    async fn invoke_site(&self, site: &str, command: Command, timeout: Duration) -> Result<Reply> {
        let address = self
            .sites
            .get(site)
            .ok_or_else(|| Error::UnknownSite(site.to_string()))?;

        let response = self
            .client
            .send_with_timeout(address, self.request(command), timeout)
            .await
            .map_err(|e| match e {
                // A remote site never leaves the view; an unreachable one is a
                // transient failure
                Error::ConnectionFailed { reason, .. } => Error::RemoteSite {
                    site: site.to_string(),
                    reason,
                },
                other => other,
            })?;

        match response {
            Message::Error {
                code: code @ (ErrorCode::NotMember | ErrorCode::ShuttingDown),
                message,
            } => Err(Error::RemoteSite {
                site: site.to_string(),
                reason: format!("{:?}: {}", code, message),
            }),
            other => into_reply(other, site),
        }
    }
}
