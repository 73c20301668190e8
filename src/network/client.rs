//! Network Client
//!
//! TCP client for request/response exchanges with nodes and remote sites.

use std::time::Duration;

use tokio::net::TcpStream;
use tokio::time::timeout;

use super::{read_message, write_message};
use crate::error::{Error, Result};
use crate::transfer::Message;

/// Network client for connecting to peer nodes
#[derive(Debug, Clone)]
pub struct NetworkClient {
    /// Connection timeout
    connect_timeout: Duration,
    /// Request timeout
    request_timeout: Duration,
}

impl NetworkClient {
    /// Create a new network client
    pub fn new(connect_timeout: Duration, request_timeout: Duration) -> Self {
        Self {
            connect_timeout,
            request_timeout,
        }
    }

    /// Send a message to a peer and wait for its response
    pub async fn send(&self, address: &str, message: Message) -> Result<Message> {
        self.send_with_timeout(address, message, self.request_timeout).await
    }

    /// Send a message with an explicit request timeout
    pub async fn send_with_timeout(
        &self,
        address: &str,
        message: Message,
        request_timeout: Duration,
    ) -> Result<Message> {
        match timeout(request_timeout, self.send_inner(address, &message)).await {
            Ok(inner_result) => inner_result,
            Err(_) => Err(Error::ConnectionTimeout(address.to_string())),
        }
    }

    async fn send_inner(&self, address: &str, message: &Message) -> Result<Message> {
        let stream = self.connect(address).await?;
        let (mut reader, mut writer) = stream.into_split();

        write_message(&mut writer, message).await?;
        read_message(&mut reader).await
    }

    /// Connect to an address
    async fn connect(&self, address: &str) -> Result<TcpStream> {
        let result = timeout(self.connect_timeout, TcpStream::connect(address)).await;

        match result {
            Ok(Ok(stream)) => {
                stream.set_nodelay(true)?;
                Ok(stream)
            }
            Ok(Err(e)) => Err(Error::ConnectionFailed {
                address: address.to_string(),
                reason: e.to_string(),
            }),
            Err(_) => Err(Error::ConnectionTimeout(address.to_string())),
        }
    }
}

impl Default for NetworkClient {
    fn default() -> Self {
        Self::new(Duration::from_secs(5), Duration::from_secs(30))
    }
}
