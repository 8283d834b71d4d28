// src/config/mod.rs - Configuration files with validation and hot reload

use anyhow::Result;
use log::{debug, error, info, warn};
use notify::{Event, EventKind, RecommendedWatcher, RecursiveMode, Watcher};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::fs;
use tokio::sync::{broadcast, RwLock};
use tokio::time::Duration;

use crate::bot::channels::{BanphraseApiConfig, ChannelRecord, PlatformRecord};
use crate::bot::moderation::API_MESSAGE_LIMIT;
use crate::bot::registry::RuleSet;
use crate::bot::rules::{Rule, RuleCode, RuleDefinition, RuleFunctionTable, RuleType};
use crate::bot::scheduler::SchedulerConfig;
use crate::types::{ChannelId, ChannelMode, PlatformId};

pub const BOT_CONFIG_FILE: &str = "bot.yaml";
pub const RULES_CONFIG_FILE: &str = "rules.yaml";

/// Owns the configuration directory and keeps the parsed files cached
#[derive(Clone)]
pub struct ConfigurationManager {
    config_dir: PathBuf,

    bot_config: Arc<RwLock<BotConfiguration>>,
    rule_config: Arc<RwLock<RuleConfiguration>>,

    /// Kept alive for as long as the manager lives
    watchers: Arc<RwLock<Vec<RecommendedWatcher>>>,

    change_notifier: broadcast::Sender<ConfigChangeEvent>,
    validator: Arc<ConfigValidator>,
    last_reload: Arc<RwLock<std::time::Instant>>,
}

/// Events broadcast when configuration changes
#[derive(Debug, Clone)]
pub enum ConfigChangeEvent {
    RulesUpdated { file: String },
    BotConfigUpdated { file: String },
    ValidationError { file: String, error: String },
    ReloadComplete { files_updated: Vec<String> },
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BotConfiguration {
    pub version: String,
    pub description: String,
    pub last_updated: chrono::DateTime<chrono::Utc>,

    pub core: CoreBotSettings,

    /// Delivery queue parameters per channel mode
    #[serde(default)]
    pub scheduler: SchedulerConfig,

    pub platforms: Vec<PlatformRecord>,
    #[serde(default)]
    pub channels: Vec<ChannelRecord>,
}

fn default_api_message_limit() -> usize {
    API_MESSAGE_LIMIT
}

fn default_api_timeout_ms() -> u64 {
    5000
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CoreBotSettings {
    pub bot_name: String,
    pub log_level: String,
    pub default_banphrase_response: String,
    #[serde(default = "default_api_message_limit")]
    pub api_message_limit: usize,
    #[serde(default = "default_api_timeout_ms")]
    pub api_timeout_ms: u64,
    /// JSON-lines file receiving a record for every external API denial
    pub denial_log_path: PathBuf,
}

/// The `rules.yaml` file
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RuleConfiguration {
    pub version: String,
    pub description: String,
    pub last_updated: chrono::DateTime<chrono::Utc>,
    #[serde(flatten)]
    pub set: RuleSet,
}

/// Checks configuration before it is applied
pub struct ConfigValidator {
    known_api_kinds: Vec<&'static str>,
}

impl ConfigValidator {
    pub fn new() -> Self {
        Self {
            known_api_kinds: vec!["pajbot"],
        }
    }

    pub fn validate_bot_config(&self, config: &BotConfiguration) -> Result<()> {
        if config.version.is_empty() {
            return Err(anyhow::anyhow!("Version cannot be empty"));
        }
        if config.core.api_message_limit == 0 {
            return Err(anyhow::anyhow!("core.api_message_limit must be positive"));
        }

        let mut platform_ids = HashSet::new();
        for platform in &config.platforms {
            if !platform_ids.insert(platform.id) {
                return Err(anyhow::anyhow!("Duplicate platform id {}", platform.id.0));
            }
            if platform.name.trim().is_empty() || platform.self_name.trim().is_empty() {
                return Err(anyhow::anyhow!("Platform {} needs a name and a self name", platform.id.0));
            }
            if platform.message_limit == 0 || platform.private_message_limit == 0 {
                return Err(anyhow::anyhow!("Platform '{}' has a zero message limit", platform.name));
            }
        }

        let channel_ids: HashSet<ChannelId> = config.channels.iter().map(|c| c.id).collect();
        if channel_ids.len() != config.channels.len() {
            return Err(anyhow::anyhow!("Channel ids must be unique"));
        }

        for channel in &config.channels {
            self.validate_channel(channel, &platform_ids, &channel_ids)?;
        }

        for (mode, limits) in [
            ("moderator", config.scheduler.moderator),
            ("vip", config.scheduler.vip),
            ("write", config.scheduler.write),
        ] {
            if limits.max_queue_size == 0 {
                return Err(anyhow::anyhow!("scheduler.{}.max_queue_size must be positive", mode));
            }
        }

        Ok(())
    }

    fn validate_channel(
        &self,
        channel: &ChannelRecord,
        platforms: &HashSet<PlatformId>,
        channels: &HashSet<ChannelId>,
    ) -> Result<()> {
        if !platforms.contains(&channel.platform) {
            return Err(anyhow::anyhow!(
                "Channel '{}' refers to unknown platform {}",
                channel.name,
                channel.platform.0
            ));
        }
        if let Some(target) = channel.mirror {
            if target == channel.id {
                return Err(anyhow::anyhow!("Channel '{}' mirrors into itself", channel.name));
            }
            if !channels.contains(&target) {
                return Err(anyhow::anyhow!(
                    "Channel '{}' mirrors into unknown channel {}",
                    channel.name,
                    target.0
                ));
            }
        }
        if let Some(api) = &channel.banphrase_api {
            self.validate_banphrase_api(&channel.name, api)?;
        }
        Ok(())
    }

    fn validate_banphrase_api(&self, channel: &str, api: &BanphraseApiConfig) -> Result<()> {
        if !self.known_api_kinds.contains(&api.kind.to_ascii_lowercase().as_str()) {
            return Err(anyhow::anyhow!(
                "Channel '{}' uses unknown banphrase API type '{}'",
                channel,
                api.kind
            ));
        }
        url::Url::parse(&api.url)
            .map_err(|e| anyhow::anyhow!("Channel '{}' has an invalid banphrase API url: {}", channel, e))?;
        Ok(())
    }

    /// Validate rule definitions. Native functions are resolved later, at load.
    pub fn validate_rule_config(&self, config: &RuleConfiguration) -> Result<()> {
        if config.version.is_empty() {
            return Err(anyhow::anyhow!("Version cannot be empty"));
        }

        let mut ids = HashSet::new();
        let builtins = RuleFunctionTable::new();
        for rule in &config.set.rules {
            if !ids.insert(rule.id) {
                return Err(anyhow::anyhow!("Duplicate rule id {}", rule.id));
            }
            self.validate_rule(rule, &builtins)?;
        }
        Ok(())
    }

    fn validate_rule(&self, rule: &RuleDefinition, builtins: &RuleFunctionTable) -> Result<()> {
        match &rule.code {
            RuleCode::Native { function } if function.trim().is_empty() => {
                Err(anyhow::anyhow!("Rule {} names an empty native function", rule.id))
            }
            RuleCode::Native { .. } => Ok(()),
            _ => Rule::compile(rule, builtins).map(|_| ()),
        }
    }
}

impl Default for ConfigValidator {
    fn default() -> Self {
        Self::new()
    }
}

impl ConfigurationManager {
    pub fn new<P: AsRef<Path>>(config_dir: P) -> Self {
        let (tx, _) = broadcast::channel(100);

        Self {
            config_dir: config_dir.as_ref().to_path_buf(),
            bot_config: Arc::new(RwLock::new(BotConfiguration::default())),
            rule_config: Arc::new(RwLock::new(RuleConfiguration::default())),
            watchers: Arc::new(RwLock::new(Vec::new())),
            change_notifier: tx,
            validator: Arc::new(ConfigValidator::new()),
            last_reload: Arc::new(RwLock::new(std::time::Instant::now())),
        }
    }

    /// Read only the log level, before logging is set up
    pub fn peek_log_level<P: AsRef<Path>>(config_dir: P) -> Option<String> {
        let content = std::fs::read_to_string(config_dir.as_ref().join(BOT_CONFIG_FILE)).ok()?;
        let config: BotConfiguration = serde_yaml::from_str(&content).ok()?;
        Some(config.core.log_level)
    }

    /// Load (or create) every file, then start watching the directory
    pub async fn initialize(&self) -> Result<()> {
        if !self.config_dir.exists() {
            fs::create_dir_all(&self.config_dir).await?;
            info!("Created configuration directory: {}", self.config_dir.display());
        }

        self.load_all_configs().await?;
        self.setup_file_watchers().await?;

        info!("Configuration manager initialized successfully");
        Ok(())
    }

    async fn load_all_configs(&self) -> Result<()> {
        let mut files_loaded = Vec::new();

        if let Err(e) = self.load_bot_config().await {
            warn!("Failed to load bot config, using defaults: {}", e);
            self.create_default_bot_config().await?;
            files_loaded.push(format!("{} (created default)", BOT_CONFIG_FILE));
        } else {
            files_loaded.push(BOT_CONFIG_FILE.to_string());
        }

        if let Err(e) = self.load_rule_config().await {
            warn!("Failed to load rule config, using defaults: {}", e);
            self.create_default_rule_config().await?;
            files_loaded.push(format!("{} (created default)", RULES_CONFIG_FILE));
        } else {
            files_loaded.push(RULES_CONFIG_FILE.to_string());
        }

        let _ = self.change_notifier.send(ConfigChangeEvent::ReloadComplete { files_updated: files_loaded });
        Ok(())
    }

    async fn load_bot_config(&self) -> Result<()> {
        let config_path = self.bot_config_path();
        if !config_path.exists() {
            return Err(anyhow::anyhow!("Bot config file not found"));
        }
        Self::reload_bot_config(&config_path, &self.bot_config, &self.validator).await
    }

    async fn load_rule_config(&self) -> Result<()> {
        let config_path = self.rules_path();
        if !config_path.exists() {
            return Err(anyhow::anyhow!("Rule config file not found"));
        }
        Self::reload_rule_config(&config_path, &self.rule_config, &self.validator).await
    }

    async fn create_default_bot_config(&self) -> Result<()> {
        let config = BotConfiguration::default();
        let config_path = self.bot_config_path();
        fs::write(&config_path, serde_yaml::to_string(&config)?).await?;

        *self.bot_config.write().await = config;
        info!("Created default bot configuration: {}", config_path.display());
        Ok(())
    }

    async fn create_default_rule_config(&self) -> Result<()> {
        let config = RuleConfiguration::default();
        let config_path = self.rules_path();
        fs::write(&config_path, serde_yaml::to_string(&config)?).await?;

        *self.rule_config.write().await = config;
        info!("Created default rule configuration: {}", config_path.display());
        Ok(())
    }

    async fn setup_file_watchers(&self) -> Result<()> {
        let config_dir = self.config_dir.clone();
        let change_notifier = self.change_notifier.clone();
        let bot_config = self.bot_config.clone();
        let rule_config = self.rule_config.clone();
        let validator = self.validator.clone();
        let last_reload = self.last_reload.clone();

        let (tx, mut rx) = tokio::sync::mpsc::channel(100);

        let mut watcher = notify::recommended_watcher(move |res: Result<Event, notify::Error>| {
            if let Ok(event) = res {
                if let Err(e) = tx.blocking_send(event) {
                    error!("Failed to send file watch event: {}", e);
                }
            }
        })?;

        watcher.watch(&config_dir, RecursiveMode::NonRecursive)?;
        self.watchers.write().await.push(watcher);

        tokio::spawn(async move {
            while let Some(event) = rx.recv().await {
                if !matches!(event.kind, EventKind::Modify(_) | EventKind::Create(_)) {
                    continue;
                }

                // Editors tend to fire several events per save
                {
                    let now = std::time::Instant::now();
                    let last = *last_reload.read().await;
                    if now.duration_since(last) < Duration::from_millis(500) {
                        continue;
                    }
                    *last_reload.write().await = now;
                }

                for path in event.paths {
                    let Some(filename) = path.file_name().and_then(|n| n.to_str()) else {
                        continue;
                    };

                    let (result, updated) = match filename {
                        "bot.yaml" | "bot.yml" => {
                            info!("Bot configuration file changed, reloading...");
                            (
                                Self::reload_bot_config(&path, &bot_config, &validator).await,
                                ConfigChangeEvent::BotConfigUpdated {
                                    file: filename.to_string(),
                                },
                            )
                        }
                        "rules.yaml" | "rules.yml" => {
                            info!("Rule configuration file changed, reloading...");
                            (
                                Self::reload_rule_config(&path, &rule_config, &validator).await,
                                ConfigChangeEvent::RulesUpdated {
                                    file: filename.to_string(),
                                },
                            )
                        }
                        _ => {
                            debug!("Ignoring change to non-config file: {}", filename);
                            continue;
                        }
                    };

                    let event = match result {
                        Ok(()) => updated,
                        Err(e) => {
                            error!("Failed to reload {}: {:#}", filename, e);
                            ConfigChangeEvent::ValidationError {
                                file: filename.to_string(),
                                error: e.to_string(),
                            }
                        }
                    };
                    let _ = change_notifier.send(event);
                }
            }
        });

        info!("File watchers setup for hot-reloading");
        Ok(())
    }

    async fn reload_bot_config(
        path: &Path,
        bot_config: &Arc<RwLock<BotConfiguration>>,
        validator: &Arc<ConfigValidator>,
    ) -> Result<()> {
        let content = fs::read_to_string(path).await?;
        let config: BotConfiguration = serde_yaml::from_str(&content)?;

        validator.validate_bot_config(&config)?;

        *bot_config.write().await = config;
        debug!("Reloaded bot configuration from {}", path.display());
        Ok(())
    }

    async fn reload_rule_config(
        path: &Path,
        rule_config: &Arc<RwLock<RuleConfiguration>>,
        validator: &Arc<ConfigValidator>,
    ) -> Result<()> {
        let content = fs::read_to_string(path).await?;
        let config: RuleConfiguration = serde_yaml::from_str(&content)?;

        validator.validate_rule_config(&config)?;

        *rule_config.write().await = config;
        debug!("Reloaded rule configuration from {}", path.display());
        Ok(())
    }

    pub fn config_dir(&self) -> &Path {
        &self.config_dir
    }

    pub fn bot_config_path(&self) -> PathBuf {
        self.config_dir.join(BOT_CONFIG_FILE)
    }

    pub fn rules_path(&self) -> PathBuf {
        self.config_dir.join(RULES_CONFIG_FILE)
    }

    pub async fn get_bot_config(&self) -> BotConfiguration {
        self.bot_config.read().await.clone()
    }

    pub async fn get_rule_config(&self) -> RuleConfiguration {
        self.rule_config.read().await.clone()
    }

    pub fn subscribe_to_changes(&self) -> broadcast::Receiver<ConfigChangeEvent> {
        self.change_notifier.subscribe()
    }

    pub async fn save_bot_config(&self, mut config: BotConfiguration) -> Result<()> {
        self.validator.validate_bot_config(&config)?;
        config.last_updated = chrono::Utc::now();

        let config_path = self.bot_config_path();
        fs::write(&config_path, serde_yaml::to_string(&config)?).await?;

        *self.bot_config.write().await = config;
        info!("Saved bot configuration to {}", config_path.display());
        Ok(())
    }

    pub async fn save_rule_config(&self, mut config: RuleConfiguration) -> Result<()> {
        self.validator.validate_rule_config(&config)?;
        config.last_updated = chrono::Utc::now();

        let config_path = self.rules_path();
        fs::write(&config_path, serde_yaml::to_string(&config)?).await?;

        *self.rule_config.write().await = config;
        info!("Saved rule configuration to {}", config_path.display());
        Ok(())
    }

    /// Change one channel's stored mode
    pub async fn set_channel_mode(&self, channel: ChannelId, mode: ChannelMode) -> Result<()> {
        let mut config = self.get_bot_config().await;
        let record = config
            .channels
            .iter_mut()
            .find(|c| c.id == channel)
            .ok_or_else(|| anyhow::anyhow!("Unknown channel {}", channel))?;
        record.mode = mode;
        self.save_bot_config(config).await
    }
}

impl Default for BotConfiguration {
    fn default() -> Self {
        Self {
            version: "1.0".to_string(),
            description: "chatpipe bot configuration".to_string(),
            last_updated: chrono::Utc::now(),
            core: CoreBotSettings {
                bot_name: "chatpipe".to_string(),
                log_level: "info".to_string(),
                default_banphrase_response: "[Banphrased]".to_string(),
                api_message_limit: API_MESSAGE_LIMIT,
                api_timeout_ms: default_api_timeout_ms(),
                denial_log_path: PathBuf::from("logs/denials.jsonl"),
            },
            scheduler: SchedulerConfig::default(),
            platforms: vec![PlatformRecord {
                id: PlatformId(1),
                name: "console".to_string(),
                self_name: "chatpipe".to_string(),
                mirror_marker: Some("[console]".to_string()),
                message_limit: 500,
                private_message_limit: 500,
                link_placeholder: "[LINK]".to_string(),
            }],
            channels: vec![
                ChannelRecord {
                    id: ChannelId(1),
                    platform: PlatformId(1),
                    name: "lobby".to_string(),
                    mode: ChannelMode::Write,
                    links_allowed: false,
                    message_limit: None,
                    mirror: Some(ChannelId(2)),
                    banphrase_api: None,
                },
                ChannelRecord {
                    id: ChannelId(2),
                    platform: PlatformId(1),
                    name: "mirror".to_string(),
                    mode: ChannelMode::Moderator,
                    links_allowed: true,
                    message_limit: None,
                    mirror: None,
                    banphrase_api: None,
                },
            ],
        }
    }
}

impl Default for RuleConfiguration {
    fn default() -> Self {
        Self {
            version: "1.0".to_string(),
            description: "chatpipe banphrase rules".to_string(),
            last_updated: chrono::Utc::now(),
            set: RuleSet {
                shared: Default::default(),
                rules: vec![
                    RuleDefinition {
                        id: 1,
                        rule_type: RuleType::Replacement,
                        platform: None,
                        channel: None,
                        active: true,
                        priority: 100,
                        description: Some("Normalize lookalike and invisible characters".to_string()),
                        code: RuleCode::Normalize,
                    },
                    RuleDefinition {
                        id: 2,
                        rule_type: RuleType::Denial,
                        platform: None,
                        channel: None,
                        active: true,
                        priority: 50,
                        description: Some("Example phrase list".to_string()),
                        code: RuleCode::Pattern {
                            patterns: vec!["badword".to_string(), "*scam*".to_string()],
                            response: Some("That message contains a banned phrase.".to_string()),
                            case_sensitive: false,
                            whole_words_only: false,
                        },
                    },
                ],
            },
        }
    }
}
