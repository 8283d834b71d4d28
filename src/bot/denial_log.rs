// src/bot/denial_log.rs - Record of messages the external API refused

use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use tokio::io::AsyncWriteExt;
use tokio::sync::{Mutex, RwLock};
use uuid::Uuid;

use crate::bot::banphrase_api::BanphraseData;
use crate::types::{ChannelId, PlatformId};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DenialRecord {
    pub id: Uuid,
    pub timestamp: DateTime<Utc>,
    pub platform: PlatformId,
    pub channel: Option<ChannelId>,
    pub api_url: String,
    /// Text exactly as it was sent to the API
    pub message: String,
    pub banphrase: BanphraseData,
}

impl DenialRecord {
    pub fn new(
        platform: PlatformId,
        channel: Option<ChannelId>,
        api_url: &str,
        message: &str,
        banphrase: BanphraseData,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            timestamp: Utc::now(),
            platform,
            channel,
            api_url: api_url.to_string(),
            message: message.to_string(),
            banphrase,
        }
    }
}

#[async_trait]
pub trait DenialLog: Send + Sync {
    async fn record(&self, record: DenialRecord) -> Result<()>;
}

/// Appends one JSON object per line
pub struct JsonLinesDenialLog {
    path: PathBuf,
    write_lock: Mutex<()>,
}

impl JsonLinesDenialLog {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            write_lock: Mutex::new(()),
        }
    }
}

#[async_trait]
impl DenialLog for JsonLinesDenialLog {
    async fn record(&self, record: DenialRecord) -> Result<()> {
        let mut line = serde_json::to_string(&record)?;
        line.push('\n');

        let _guard = self.write_lock.lock().await;
        if let Some(parent) = self.path.parent() {
            if !parent.as_os_str().is_empty() {
                tokio::fs::create_dir_all(parent).await?;
            }
        }
        let mut file = tokio::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .await?;
        file.write_all(line.as_bytes()).await?;
        file.flush().await?;
        Ok(())
    }
}

#[derive(Default)]
pub struct MemoryDenialLog {
    records: RwLock<Vec<DenialRecord>>,
}

impl MemoryDenialLog {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn records(&self) -> Vec<DenialRecord> {
        self.records.read().await.clone()
    }
}

#[async_trait]
impl DenialLog for MemoryDenialLog {
    async fn record(&self, record: DenialRecord) -> Result<()> {
        self.records.write().await.push(record);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_jsonl_appends_lines() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("logs").join("denials.jsonl");
        let log = JsonLinesDenialLog::new(&path);

        for text in ["first", "second"] {
            let record = DenialRecord::new(
                PlatformId(1),
                Some(ChannelId(5)),
                "https://pajbot.example",
                text,
                BanphraseData::default(),
            );
            log.record(record).await.unwrap();
        }

        let contents = tokio::fs::read_to_string(&path).await.unwrap();
        let records: Vec<DenialRecord> = contents
            .lines()
            .map(|line| serde_json::from_str(line).unwrap())
            .collect();
        assert_eq!(records.len(), 2);
        assert_eq!(records[0].message, "first");
        assert_eq!(records[1].channel, Some(ChannelId(5)));
        assert_ne!(records[0].id, records[1].id);
    }

    #[tokio::test]
    async fn test_memory_log() {
        let log = MemoryDenialLog::new();
        log.record(DenialRecord::new(PlatformId(2), None, "u", "m", BanphraseData::default()))
            .await
            .unwrap();
        assert_eq!(log.records().await.len(), 1);
    }
}
