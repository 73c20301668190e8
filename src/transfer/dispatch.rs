//! Command dispatch
//!
//! Interprets received commands against the local manager.

use std::sync::Arc;

use async_trait::async_trait;

use super::manager::StateTransferManager;
use super::protocol::{Command, Reply};
use crate::error::Result;

/// Something that executes commands received from other nodes or sites
#[async_trait]
pub trait CommandHandler: Send + Sync {
    async fn handle(&self, origin: &str, command: Command) -> Result<Reply>;
}

/// Routes each command to the matching manager operation
pub struct Dispatcher {
    manager: Arc<StateTransferManager>,
}

impl Dispatcher {
    pub fn new(manager: Arc<StateTransferManager>) -> Self {
        Self { manager }
    }

    /// Receiving-side commands from outside the local cluster are relayed
    /// to the other members
    async fn from_remote_site(&self, origin: &str) -> bool {
        !self.manager.membership().contains(origin).await
    }
}

#[async_trait]
impl CommandHandler for Dispatcher {
    async fn handle(&self, origin: &str, command: Command) -> Result<Reply> {
        tracing::trace!("Handling {} from {}", command.type_name(), origin);
        let manager = &self.manager;

        match command {
            Command::StartSend {
                site,
                originator,
                push_id,
                topology,
            } => {
                manager.handle_start_send(&site, &originator, push_id, topology).await?;
                Ok(Reply::Ack)
            }
            Command::RestartSend {
                site,
                originator,
                push_id,
                topology,
            } => {
                manager.handle_restart_send(&site, &originator, push_id, topology).await?;
                Ok(Reply::Ack)
            }
            Command::CancelSend { site } => {
                manager.handle_cancel_send(&site)?;
                Ok(Reply::Ack)
            }
            Command::FinishSend {
                site,
                push_id,
                node,
                ok,
            } => {
                manager.notify_state_push_finished(&site, push_id, &node, ok).await?;
                Ok(Reply::Ack)
            }
            Command::StatusRequest => Ok(Reply::Status(manager.get_status())),
            Command::ClearStatus => {
                manager.clear_local_status();
                Ok(Reply::Ack)
            }
            Command::AutoTransferStatus { site } => {
                let (offline, mode) = manager.auto_transfer_status(&site)?;
                Ok(Reply::AutoStatus { offline, mode })
            }
            Command::BringOnline { site } => {
                manager.bring_site_online(&site);
                Ok(Reply::Ack)
            }
            Command::StartReceive { site } => {
                let from_remote = self.from_remote_site(origin).await;
                manager.handle_start_receive(&site, from_remote).await?;
                Ok(Reply::Ack)
            }
            Command::FinishReceive { site } => {
                let from_remote = self.from_remote_site(origin).await;
                manager.handle_finish_receive(&site, from_remote).await?;
                Ok(Reply::Ack)
            }
            Command::PushState { site, chunk } => {
                tracing::debug!("Received {} entries from site {}", chunk.len(), site);
                manager.handle_push_state(&chunk).await?;
                Ok(Reply::Ack)
            }
        }
    }
}
