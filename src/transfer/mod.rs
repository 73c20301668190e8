//! Cross-Site State Transfer Module
//!
//! Pushes the contents of this cluster to a remote backup site: coordination
//! across local members, per-node pushes, and the receiving side.

mod consumer;
mod dispatch;
mod manager;
mod protocol;
mod provider;
mod push_task;
mod retry;

#[cfg(test)]
mod tests;

pub use consumer::InboundConsumer;
pub use dispatch::{CommandHandler, Dispatcher};
pub use manager::StateTransferManager;
pub use protocol::{Command, ErrorCode, FrameHeader, Message, Reply};
pub use provider::{OutboundProvider, PushCompletion};
pub use push_task::{CancelHandle, ChunkStream, Delivery, PushOutcome, PushTask};
pub use retry::RetryHelper;
