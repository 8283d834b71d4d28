// src/bot/channels.rs - Channel and platform records with id lookups

use anyhow::Result;
use log::{debug, info};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use tokio::sync::RwLock;

use crate::types::{ChannelId, ChannelMode, DowntimeBehavior, PlatformId, PipelineError};

fn default_link_placeholder() -> String {
    "[LINK]".to_string()
}

fn default_true() -> bool {
    true
}

/// Platform-wide settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PlatformRecord {
    pub id: PlatformId,
    pub name: String,
    /// The bot's own user name on this platform
    pub self_name: String,
    /// Prefix for mirrored messages; `None` disables mirroring for the whole platform
    pub mirror_marker: Option<String>,
    pub message_limit: usize,
    pub private_message_limit: usize,
    #[serde(default = "default_link_placeholder")]
    pub link_placeholder: String,
}

/// External banphrase API attached to a channel
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BanphraseApiConfig {
    /// API flavour, resolved when the API is first used (only "pajbot" exists)
    pub kind: String,
    pub url: String,
    #[serde(default)]
    pub downtime: DowntimeBehavior,
}

/// A single channel the bot is present in
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChannelRecord {
    pub id: ChannelId,
    pub platform: PlatformId,
    pub name: String,
    pub mode: ChannelMode,
    #[serde(default = "default_true")]
    pub links_allowed: bool,
    /// Overrides the platform message limit
    #[serde(default)]
    pub message_limit: Option<usize>,
    /// Channel that receives a copy of this channel's traffic
    #[serde(default)]
    pub mirror: Option<ChannelId>,
    #[serde(default)]
    pub banphrase_api: Option<BanphraseApiConfig>,
}

#[derive(Default)]
struct DirectoryInner {
    platforms: HashMap<PlatformId, PlatformRecord>,
    channels: Vec<ChannelRecord>,
    by_id: HashMap<ChannelId, usize>,
    by_name: HashMap<(PlatformId, String), ChannelId>,
    by_platform: HashMap<PlatformId, Vec<ChannelId>>,
}

impl DirectoryInner {
    fn build(platforms: Vec<PlatformRecord>, channels: Vec<ChannelRecord>) -> Result<Self> {
        let mut inner = DirectoryInner::default();

        for platform in platforms {
            if inner.platforms.contains_key(&platform.id) {
                return Err(anyhow::anyhow!("Duplicate platform id {}", platform.id));
            }
            inner.platforms.insert(platform.id, platform);
        }

        for channel in channels {
            if !inner.platforms.contains_key(&channel.platform) {
                return Err(PipelineError::UnknownPlatform(channel.platform).into());
            }
            if inner.by_id.contains_key(&channel.id) {
                return Err(anyhow::anyhow!("Duplicate channel id {}", channel.id));
            }

            let index = inner.channels.len();
            inner.by_id.insert(channel.id, index);
            inner.by_name.insert((channel.platform, channel.name.to_lowercase()), channel.id);
            inner.by_platform.entry(channel.platform).or_default().push(channel.id);
            inner.channels.push(channel);
        }

        Ok(inner)
    }
}

/// Owning store of every channel and platform record.
///
/// Records refer to each other by id only; callers get clones.
pub struct ChannelDirectory {
    inner: RwLock<DirectoryInner>,
}

impl ChannelDirectory {
    pub fn new(platforms: Vec<PlatformRecord>, channels: Vec<ChannelRecord>) -> Result<Self> {
        Ok(Self {
            inner: RwLock::new(DirectoryInner::build(platforms, channels)?),
        })
    }

    /// Replace every record at once (used after a configuration reload)
    pub async fn replace_all(&self, platforms: Vec<PlatformRecord>, channels: Vec<ChannelRecord>) -> Result<()> {
        let rebuilt = DirectoryInner::build(platforms, channels)?;
        let count = rebuilt.channels.len();
        *self.inner.write().await = rebuilt;
        info!("Channel directory reloaded with {} channels", count);
        Ok(())
    }

    pub async fn channel(&self, id: ChannelId) -> Option<ChannelRecord> {
        let inner = self.inner.read().await;
        inner.by_id.get(&id).map(|&index| inner.channels[index].clone())
    }

    pub async fn platform(&self, id: PlatformId) -> Option<PlatformRecord> {
        self.inner.read().await.platforms.get(&id).cloned()
    }

    pub async fn platform_by_name(&self, name: &str) -> Option<PlatformRecord> {
        self.inner
            .read()
            .await
            .platforms
            .values()
            .find(|p| p.name.eq_ignore_ascii_case(name))
            .cloned()
    }

    /// Look a channel up by platform and (case-insensitive) name
    pub async fn find(&self, platform: PlatformId, name: &str) -> Option<ChannelRecord> {
        let inner = self.inner.read().await;
        let id = inner.by_name.get(&(platform, name.to_lowercase()))?;
        inner.by_id.get(id).map(|&index| inner.channels[index].clone())
    }

    /// Channel together with its platform record
    pub async fn resolve(&self, id: ChannelId) -> Result<(ChannelRecord, PlatformRecord), PipelineError> {
        let inner = self.inner.read().await;
        let channel = inner
            .by_id
            .get(&id)
            .map(|&index| inner.channels[index].clone())
            .ok_or(PipelineError::UnknownChannel(id))?;
        let platform = inner
            .platforms
            .get(&channel.platform)
            .cloned()
            .ok_or(PipelineError::UnknownPlatform(channel.platform))?;
        Ok((channel, platform))
    }

    pub async fn channels_for(&self, platform: PlatformId) -> Vec<ChannelRecord> {
        let inner = self.inner.read().await;
        inner
            .by_platform
            .get(&platform)
            .map(|ids| {
                ids.iter()
                    .filter_map(|id| inner.by_id.get(id))
                    .map(|&index| inner.channels[index].clone())
                    .collect()
            })
            .unwrap_or_default()
    }

    pub async fn all_channels(&self) -> Vec<ChannelRecord> {
        self.inner.read().await.channels.clone()
    }

    /// Change the bot's mode in a channel, returning the previous mode
    pub async fn set_mode(&self, id: ChannelId, mode: ChannelMode) -> Result<ChannelMode, PipelineError> {
        let mut inner = self.inner.write().await;
        let index = *inner.by_id.get(&id).ok_or(PipelineError::UnknownChannel(id))?;
        let channel = &mut inner.channels[index];
        let previous = channel.mode;
        if previous != mode {
            info!("Mode of #{} changed: {} -> {}", channel.name, previous, mode);
            channel.mode = mode;
        } else {
            debug!("Mode of #{} unchanged ({})", channel.name, mode);
        }
        Ok(previous)
    }
}
