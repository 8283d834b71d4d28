use anyhow::Result;
use async_trait::async_trait;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::Duration;
use tokio::sync::{broadcast, Mutex};
use tokio::time::Instant;

use crate::platforms::PlatformConnection;
use crate::types::ChatMessage;

/// A delivery observed by the recording transport
#[derive(Debug, Clone)]
pub struct Delivery {
    pub channel: String,
    pub text: String,
    pub at: Instant,
    pub private: bool,
}

/// In-memory transport that remembers everything it was asked to send
pub struct RecordingConnection {
    platform: String,
    deliveries: Mutex<Vec<Delivery>>,
    fail_sends: AtomicBool,
    send_delay_ms: AtomicU64,
    sender: broadcast::Sender<ChatMessage>,
}

impl RecordingConnection {
    pub fn new(platform: &str) -> Self {
        let (sender, _) = broadcast::channel(16);
        Self {
            platform: platform.to_string(),
            deliveries: Mutex::new(Vec::new()),
            fail_sends: AtomicBool::new(false),
            send_delay_ms: AtomicU64::new(0),
            sender,
        }
    }

    pub fn set_failing(&self, failing: bool) {
        self.fail_sends.store(failing, Ordering::SeqCst);
    }

    /// Make every send take this long; deliveries are stamped when they complete
    pub fn set_delay(&self, delay: Duration) {
        self.send_delay_ms.store(delay.as_millis() as u64, Ordering::SeqCst);
    }

    pub async fn deliveries(&self) -> Vec<Delivery> {
        self.deliveries.lock().await.clone()
    }

    pub async fn texts(&self) -> Vec<String> {
        self.deliveries.lock().await.iter().map(|d| d.text.clone()).collect()
    }

    pub fn inject(&self, message: ChatMessage) {
        let _ = self.sender.send(message);
    }

    async fn record(&self, channel: &str, text: &str, private: bool) -> Result<()> {
        let delay = self.send_delay_ms.load(Ordering::SeqCst);
        if delay > 0 {
            tokio::time::sleep(Duration::from_millis(delay)).await;
        }

        let mut deliveries = self.deliveries.lock().await;
        deliveries.push(Delivery {
            channel: channel.to_string(),
            text: text.to_string(),
            at: Instant::now(),
            private,
        });
        if self.fail_sends.load(Ordering::SeqCst) {
            return Err(anyhow::anyhow!("simulated transport failure"));
        }
        Ok(())
    }
}

#[async_trait]
impl PlatformConnection for RecordingConnection {
    async fn connect(&self) -> Result<()> {
        Ok(())
    }

    async fn send_message(&self, channel: &str, message: &str) -> Result<()> {
        self.record(channel, message, false).await
    }

    async fn send_private_message(&self, user: &str, message: &str) -> Result<()> {
        self.record(user, message, true).await
    }

    fn platform_name(&self) -> &str {
        &self.platform
    }

    async fn is_connected(&self) -> bool {
        true
    }

    fn get_message_receiver(&self) -> Option<broadcast::Receiver<ChatMessage>> {
        Some(self.sender.subscribe())
    }

    async fn disconnect(&self) -> Result<()> {
        Ok(())
    }
}
