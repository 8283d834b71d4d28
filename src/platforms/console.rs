use anyhow::Result;
use async_trait::async_trait;
use log::{debug, info, warn};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::sync::{broadcast, Mutex};

use crate::platforms::PlatformConnection;
use crate::types::ChatMessage;

/// Terminal transport used by the binary and for local testing.
///
/// Outgoing text goes to stdout, and every stdin line of the form
/// `#channel [user:] text` is turned into an incoming chat message.
pub struct ConsoleConnection {
    platform: String,
    username: String,
    message_sender: broadcast::Sender<ChatMessage>,
    is_connected: Arc<AtomicBool>,
    read_input: bool,
    stdout: Mutex<tokio::io::Stdout>,
}

impl ConsoleConnection {
    pub fn new(platform: impl Into<String>, username: impl Into<String>) -> Self {
        let (message_sender, _) = broadcast::channel(100);
        Self {
            platform: platform.into(),
            username: username.into(),
            message_sender,
            is_connected: Arc::new(AtomicBool::new(false)),
            read_input: true,
            stdout: Mutex::new(tokio::io::stdout()),
        }
    }

    /// Only one transport per process should read stdin
    pub fn with_input(mut self, read_input: bool) -> Self {
        self.read_input = read_input;
        self
    }

    /// Parse `#channel user: text` or `#channel text` into a chat message
    fn parse_line(platform: &str, default_user: &str, line: &str) -> Option<ChatMessage> {
        let line = line.trim();
        let rest = line.strip_prefix('#')?;
        let (channel, text) = rest.split_once(' ')?;

        let (username, content) = match text.split_once(": ") {
            Some((user, content)) if !user.contains(' ') => (user.to_string(), content.to_string()),
            _ => (default_user.to_string(), text.to_string()),
        };

        if channel.is_empty() || content.trim().is_empty() {
            return None;
        }

        Some(ChatMessage {
            platform: platform.to_string(),
            channel: channel.to_string(),
            username,
            display_name: None,
            content,
            timestamp: chrono::Utc::now(),
            user_badges: Vec::new(),
            command_used: false,
        })
    }

    async fn write_line(&self, line: &str) -> Result<()> {
        let mut stdout = self.stdout.lock().await;
        stdout.write_all(line.as_bytes()).await?;
        stdout.write_all(b"\n").await?;
        stdout.flush().await?;
        Ok(())
    }
}

#[async_trait]
impl PlatformConnection for ConsoleConnection {
    async fn connect(&self) -> Result<()> {
        if self.is_connected.swap(true, Ordering::SeqCst) {
            return Ok(());
        }

        if !self.read_input {
            info!("Console transport '{}' connected (output only)", self.platform);
            return Ok(());
        }

        let sender = self.message_sender.clone();
        let platform = self.platform.clone();
        let default_user = format!("{}_user", self.platform);
        let is_connected = Arc::clone(&self.is_connected);

        tokio::spawn(async move {
            let mut lines = BufReader::new(tokio::io::stdin()).lines();
            while is_connected.load(Ordering::SeqCst) {
                match lines.next_line().await {
                    Ok(Some(line)) => match Self::parse_line(&platform, &default_user, &line) {
                        Some(message) => {
                            if sender.send(message).is_err() {
                                debug!("No console message subscribers");
                            }
                        }
                        None => warn!("Ignoring console line, expected '#channel [user:] text'"),
                    },
                    Ok(None) => break,
                    Err(e) => {
                        warn!("Console input error: {}", e);
                        break;
                    }
                }
            }
            info!("Console input closed");
        });

        info!("Console transport '{}' connected as {}", self.platform, self.username);
        Ok(())
    }

    async fn send_message(&self, channel: &str, message: &str) -> Result<()> {
        self.write_line(&format!("[{}#{}] {}: {}", self.platform, channel, self.username, message)).await
    }

    async fn send_private_message(&self, user: &str, message: &str) -> Result<()> {
        self.write_line(&format!("[{} whisper -> {}] {}", self.platform, user, message)).await
    }

    fn platform_name(&self) -> &str {
        &self.platform
    }

    async fn is_connected(&self) -> bool {
        self.is_connected.load(Ordering::SeqCst)
    }

    fn get_message_receiver(&self) -> Option<broadcast::Receiver<ChatMessage>> {
        Some(self.message_sender.subscribe())
    }

    async fn disconnect(&self) -> Result<()> {
        self.is_connected.store(false, Ordering::SeqCst);
        info!("Console transport '{}' disconnected", self.platform);
        Ok(())
    }
}
