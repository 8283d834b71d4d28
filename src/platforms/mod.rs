use anyhow::Result;
use async_trait::async_trait;
use std::sync::Arc;
use tokio::sync::broadcast;

use crate::types::ChatMessage;

pub mod console;
#[cfg(test)]
pub(crate) mod recording;

/// Shared handle to a connection; the delivery queues hold one per channel
pub type SharedConnection = Arc<dyn PlatformConnection>;

/// Trait defining the interface all platform connections must implement.
///
/// Wire protocol, authentication and reconnection live behind this boundary;
/// the pipeline only ever hands finished text to `send_message`.
#[async_trait]
pub trait PlatformConnection: Send + Sync {
    /// Connect to the platform and start receiving messages
    async fn connect(&self) -> Result<()>;

    /// Send already-prepared text to the specified channel
    async fn send_message(&self, channel: &str, message: &str) -> Result<()>;

    /// Send a private message (whisper / DM) to a user
    async fn send_private_message(&self, user: &str, message: &str) -> Result<()>;

    /// Get the platform identifier (e.g., "twitch", "discord")
    fn platform_name(&self) -> &str;

    /// Check if the connection is healthy
    async fn is_connected(&self) -> bool;

    /// Get a receiver for incoming messages
    fn get_message_receiver(&self) -> Option<broadcast::Receiver<ChatMessage>>;

    /// Gracefully disconnect
    async fn disconnect(&self) -> Result<()>;
}
