//! Network Server
//!
//! TCP server for accepting connections from other nodes and remote sites.

use std::net::SocketAddr;
use std::sync::Arc;

use async_trait::async_trait;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, watch};

use super::{read_message, write_message};
use crate::error::{Error, Result};
use crate::state::ClusterMembership;
use crate::transfer::{CommandHandler, ErrorCode, Message};

/// Produces the response (if any) for each received message
#[async_trait]
pub trait MessageHandler: Send + Sync {
    async fn on_message(&self, peer: &str, message: Message) -> Option<Message>;
}

/// Network server for cluster and cross-site communication
pub struct NetworkServer {
    listener: TcpListener,
    handler: Arc<dyn MessageHandler>,
    shutdown: watch::Receiver<bool>,
}

impl NetworkServer {
    /// Bind the listening socket
    pub async fn bind(
        bind_address: &str,
        handler: Arc<dyn MessageHandler>,
        shutdown: watch::Receiver<bool>,
    ) -> Result<Self> {
        let listener = TcpListener::bind(bind_address).await?;
        Ok(Self {
            listener,
            handler,
            shutdown,
        })
    }

    /// Address the server is listening on
    pub fn local_addr(&self) -> Result<SocketAddr> {
        Ok(self.listener.local_addr()?)
    }

    /// Accept connections until shutdown is signalled
    pub async fn run(self) -> Result<()> {
        let Self {
            listener,
            handler,
            mut shutdown,
        } = self;
        tracing::info!("Network server listening on {}", listener.local_addr()?);

        loop {
            tokio::select! {
                result = listener.accept() => {
                    match result {
                        Ok((socket, addr)) => {
                            let peer_addr = addr.to_string();
                            let handler = Arc::clone(&handler);

                            tokio::spawn(async move {
                                if let Err(e) = handle_connection(socket, &peer_addr, handler).await {
                                    tracing::warn!("Connection error from {}: {}", peer_addr, e);
                                }
                            });
                        }
                        Err(e) => {
                            tracing::error!("Accept error: {}", e);
                        }
                    }
                }
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
            }
        }

        tracing::info!("Network server stopped");
        Ok(())
    }
}

/// Handle a single connection
async fn handle_connection(
    socket: TcpStream,
    peer_addr: &str,
    handler: Arc<dyn MessageHandler>,
) -> Result<()> {
    let (mut reader, mut writer) = socket.into_split();

    loop {
        match read_message(&mut reader).await {
            Ok(message) => {
                tracing::trace!("Received {} from {}", message.type_name(), peer_addr);

                if let Some(response) = handler.on_message(peer_addr, message).await {
                    write_message(&mut writer, &response).await?;
                }
            }
            Err(Error::Io(ref e)) if e.kind() == std::io::ErrorKind::UnexpectedEof => {
                // Connection closed
                break;
            }
            Err(e) => {
                tracing::warn!("Error reading message: {}", e);
                break;
            }
        }
    }

    Ok(())
}

/// Node-side handler: commands go to the dispatcher, heartbeats feed the
/// membership view.
pub struct NodeHandler {
    commands: Arc<dyn CommandHandler>,
    membership: Arc<ClusterMembership>,
    /// Heartbeats from nodes outside the view, as `(id, address)`
    joins: mpsc::UnboundedSender<(String, String)>,
}

impl NodeHandler {
    pub fn new(
        commands: Arc<dyn CommandHandler>,
        membership: Arc<ClusterMembership>,
        joins: mpsc::UnboundedSender<(String, String)>,
    ) -> Self {
        Self {
            commands,
            membership,
            joins,
        }
    }
}

#[async_trait]
impl MessageHandler for NodeHandler {
    async fn on_message(&self, peer: &str, message: Message) -> Option<Message> {
        match message {
            Message::Request { origin, command } => {
                let name = command.type_name();
                let response = match self.commands.handle(&origin, command).await {
                    Ok(reply) => Message::Response { reply },
                    Err(e) => {
                        tracing::debug!("{} from {} failed: {}", name, origin, e);
                        Message::from_error(&e)
                    }
                };
                Some(response)
            }
            Message::Heartbeat { node_id, address } => {
                if self.membership.contains(&node_id).await {
                    if let Err(e) = self.membership.record_heartbeat(&node_id).await {
                        tracing::warn!("Failed to record heartbeat from {}: {}", node_id, e);
                    }
                } else if self.joins.send((node_id, address)).is_err() {
                    tracing::debug!("Membership loop is gone, ignoring join");
                }
                Some(Message::HeartbeatAck {
                    node_id: self.membership.node_id().to_string(),
                })
            }
            other => {
                tracing::warn!("Unexpected {} from {}", other.type_name(), peer);
                Some(Message::Error {
                    code: ErrorCode::Internal,
                    message: format!("unexpected {}", other.type_name()),
                })
            }
        }
    }
}
