use anyhow::Result;
use log::{debug, error, info, warn};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, Mutex, RwLock};
use tokio::task::JoinHandle;

use crate::config::{BotConfiguration, ConfigChangeEvent, ConfigurationManager};
use crate::platforms::SharedConnection;
use crate::types::{ChannelId, ChannelMode, ChatMessage, PipelineError, PlatformId};

pub mod banphrase_api;
pub mod channels;
pub mod denial_log;
pub mod mirror;
pub mod moderation;
pub mod preparer;
pub mod registry;
pub mod rules;
pub mod scheduler;

use banphrase_api::{ApiKind, BanphraseApi, PajbotClient};
use channels::{ChannelDirectory, PlatformRecord};
use denial_log::DenialLog;
use mirror::{MirrorOptions, MirrorOutcome, MirrorRelay};
use moderation::{ModerationEngine, ModerationSettings};
use preparer::{MessagePreparer, PrepareOptions, Prepared};
use registry::{RuleRegistry, RuleSnapshot, RuleSource};
use rules::RuleFunctionTable;
use scheduler::{DeliveryScheduler, EnqueueOutcome, QueueStats};

/// How a message should be sent
#[derive(Debug, Clone, Default)]
pub struct SendOptions {
    pub prepare: PrepareOptions,
    /// The message is a command result
    pub command_used: bool,
    /// User who triggered the message; receives private fallbacks
    pub invoker: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SendOutcome {
    Queued(EnqueueOutcome),
    Whispered,
    Refused,
}

/// Owns every part of the outbound pipeline and the platform connections
pub struct ChatBot {
    connections: Arc<RwLock<HashMap<String, SharedConnection>>>,
    directory: Arc<ChannelDirectory>,
    registry: Arc<RuleRegistry>,
    rule_source: Arc<dyn RuleSource>,
    preparer: Arc<MessagePreparer>,
    scheduler: Arc<DeliveryScheduler>,
    mirror: Arc<MirrorRelay>,
    /// Modes as written in `bot.yaml`, to tell file edits from runtime changes
    configured_modes: RwLock<HashMap<ChannelId, ChannelMode>>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl ChatBot {
    /// Build the pipeline with the Pajbot client as the external API
    pub fn new(
        config: &BotConfiguration,
        functions: RuleFunctionTable,
        rule_source: Arc<dyn RuleSource>,
        denial_log: Arc<dyn DenialLog>,
    ) -> Result<Self> {
        let pajbot = PajbotClient::new(Duration::from_millis(config.core.api_timeout_ms))?;
        let apis: Vec<(ApiKind, Arc<dyn BanphraseApi>)> = vec![(ApiKind::Pajbot, Arc::new(pajbot))];
        Self::with_apis(config, functions, rule_source, denial_log, apis)
    }

    pub fn with_apis(
        config: &BotConfiguration,
        functions: RuleFunctionTable,
        rule_source: Arc<dyn RuleSource>,
        denial_log: Arc<dyn DenialLog>,
        apis: Vec<(ApiKind, Arc<dyn BanphraseApi>)>,
    ) -> Result<Self> {
        let directory = Arc::new(ChannelDirectory::new(config.platforms.clone(), config.channels.clone())?);
        let registry = Arc::new(RuleRegistry::new(functions));

        let settings = ModerationSettings {
            default_banphrase_response: config.core.default_banphrase_response.clone(),
            api_message_limit: config.core.api_message_limit,
        };
        let engine = apis
            .into_iter()
            .fold(ModerationEngine::new(Arc::clone(&registry), denial_log, settings), |engine, (kind, api)| {
                engine.with_api(kind, api)
            });
        let preparer = Arc::new(MessagePreparer::new(Arc::new(engine))?);

        let connections = Arc::new(RwLock::new(HashMap::new()));
        let scheduler = Arc::new(DeliveryScheduler::new(config.scheduler.clone(), Arc::clone(&connections)));
        let mirror = Arc::new(MirrorRelay::new(
            Arc::clone(&directory),
            Arc::clone(&preparer),
            Arc::clone(&scheduler),
        ));

        Ok(Self {
            connections,
            directory,
            registry,
            rule_source,
            preparer,
            scheduler,
            mirror,
            configured_modes: RwLock::new(config.channels.iter().map(|c| (c.id, c.mode)).collect()),
            tasks: Mutex::new(Vec::new()),
        })
    }

    /// Add a platform connection; it is keyed by its platform name
    pub async fn add_connection(&self, connection: SharedConnection) {
        let platform_name = connection.platform_name().to_string();
        info!("Added {} connection", platform_name);
        self.connections.write().await.insert(platform_name, connection);
    }

    pub fn directory(&self) -> &Arc<ChannelDirectory> {
        &self.directory
    }

    pub async fn rule_snapshot(&self) -> Arc<RuleSnapshot> {
        self.registry.snapshot().await
    }

    pub async fn queue_stats(&self) -> Vec<QueueStats> {
        self.scheduler.stats().await
    }

    pub async fn reload_rules(&self) -> Result<usize> {
        self.registry.reload_all(self.rule_source.as_ref()).await
    }

    pub async fn reload_rules_by_ids(&self, ids: &[u32]) -> Result<usize> {
        self.registry.reload_by_ids(self.rule_source.as_ref(), ids).await
    }

    /// Prepare, queue and mirror a message for a channel
    pub async fn send(&self, channel: ChannelId, text: &str, options: &SendOptions) -> Result<SendOutcome> {
        let (record, platform) = self.directory.resolve(channel).await?;

        match self.preparer.prepare(text, Some(&record), &platform, options.prepare).await? {
            Prepared::Ready(prepared) => {
                let outcome = self.scheduler.enqueue(&record, &platform, &prepared).await?;
                if outcome == EnqueueOutcome::Queued {
                    let mirror_options = MirrorOptions {
                        command_used: options.command_used,
                    };
                    if let Err(e) = self.mirror.forward(channel, &prepared, None, mirror_options).await {
                        error!("Mirroring from #{} failed: {}", record.name, e);
                    }
                }
                Ok(SendOutcome::Queued(outcome))
            }
            Prepared::Private(prepared) => match &options.invoker {
                Some(user) => {
                    self.whisper(&platform, user, &prepared).await?;
                    Ok(SendOutcome::Whispered)
                }
                None => {
                    warn!("Message for #{} can only go out privately but nobody invoked it", record.name);
                    Ok(SendOutcome::Refused)
                }
            },
            Prepared::Refused => Ok(SendOutcome::Refused),
        }
    }

    /// Prepare and send a private message; there is no queue for these
    pub async fn send_private(
        &self,
        platform: PlatformId,
        user: &str,
        text: &str,
        options: PrepareOptions,
    ) -> Result<SendOutcome> {
        let record = self
            .directory
            .platform(platform)
            .await
            .ok_or(PipelineError::UnknownPlatform(platform))?;

        match self.preparer.prepare(text, None, &record, options).await? {
            Prepared::Ready(prepared) | Prepared::Private(prepared) => {
                self.whisper(&record, user, &prepared).await?;
                Ok(SendOutcome::Whispered)
            }
            Prepared::Refused => Ok(SendOutcome::Refused),
        }
    }

    async fn whisper(&self, platform: &PlatformRecord, user: &str, text: &str) -> Result<()> {
        let connection = self
            .connections
            .read()
            .await
            .get(&platform.name)
            .cloned()
            .ok_or_else(|| PipelineError::MissingConnection(platform.name.clone()))?;
        connection.send_private_message(user, text).await
    }

    /// Feed a message seen in chat: the bot's own messages update its mode,
    /// everything else is a candidate for mirroring
    pub async fn handle_incoming(&self, message: &ChatMessage) -> Result<Option<MirrorOutcome>> {
        let Some(platform) = self.directory.platform_by_name(&message.platform).await else {
            debug!("Message from unconfigured platform {}", message.platform);
            return Ok(None);
        };
        let Some(channel) = self.directory.find(platform.id, &message.channel).await else {
            debug!("Message from unconfigured channel {}#{}", platform.name, message.channel);
            return Ok(None);
        };

        if message.username.eq_ignore_ascii_case(&platform.self_name) {
            self.observe_badges(channel.id, &message.user_badges).await?;
        }

        let options = MirrorOptions {
            command_used: message.command_used,
        };
        let outcome = self
            .mirror
            .forward(channel.id, &message.content, Some(&message.username), options)
            .await?;
        Ok(Some(outcome))
    }

    /// Update the bot's mode in a channel from the badges it was seen with
    pub async fn observe_badges(&self, channel: ChannelId, badges: &[String]) -> Result<ChannelMode> {
        let record = self
            .directory
            .channel(channel)
            .await
            .ok_or(PipelineError::UnknownChannel(channel))?;

        let mode = ChannelMode::from_badges(record.mode, badges);
        if mode != record.mode {
            self.set_channel_mode(channel, mode).await?;
        }
        Ok(mode)
    }

    /// Returns the previous mode
    pub async fn set_channel_mode(&self, channel: ChannelId, mode: ChannelMode) -> Result<ChannelMode> {
        let previous = self.directory.set_mode(channel, mode).await?;
        if !mode.can_send() {
            self.scheduler.teardown(channel).await;
        }
        Ok(previous)
    }

    /// Swap in a reloaded `bot.yaml`. A channel keeps the mode it reached at
    /// runtime unless the file changed that channel's mode.
    pub async fn apply_bot_config(&self, config: &BotConfiguration) -> Result<()> {
        let mut configured = self.configured_modes.write().await;

        let mut channels = config.channels.clone();
        for channel in &mut channels {
            if configured.get(&channel.id) != Some(&channel.mode) {
                continue;
            }
            if let Some(current) = self.directory.channel(channel.id).await {
                channel.mode = current.mode;
            }
        }

        self.directory
            .replace_all(config.platforms.clone(), channels.clone())
            .await?;
        for channel in channels.iter().filter(|c| !c.mode.can_send()) {
            self.scheduler.teardown(channel.id).await;
        }

        *configured = config.channels.iter().map(|c| (c.id, c.mode)).collect();
        Ok(())
    }

    /// Connect every platform and start consuming incoming messages
    pub async fn start(self: &Arc<Self>) -> Result<()> {
        info!("Starting chat bot...");

        let mut receivers = Vec::new();
        {
            let connections_guard = self.connections.read().await;
            for (platform_name, connection) in connections_guard.iter() {
                if let Err(e) = connection.connect().await {
                    error!("Failed to connect to {}: {}", platform_name, e);
                    continue;
                }

                if let Some(receiver) = connection.get_message_receiver() {
                    receivers.push((platform_name.clone(), receiver));
                    info!("Set up message receiver for {}", platform_name);
                }
            }
        }

        let mut tasks = self.tasks.lock().await;
        for (platform_name, receiver) in receivers {
            tasks.push(tokio::spawn(Arc::clone(self).process_messages(platform_name, receiver)));
        }

        info!("Chat bot started successfully");
        Ok(())
    }

    async fn process_messages(self: Arc<Self>, platform: String, mut receiver: broadcast::Receiver<ChatMessage>) {
        loop {
            match receiver.recv().await {
                Ok(message) => {
                    debug!("Incoming {}#{} <{}>: {}", platform, message.channel, message.username, message.content);
                    if let Err(e) = self.handle_incoming(&message).await {
                        error!("Failed to handle message from {}#{}: {:#}", platform, message.channel, e);
                    }
                }
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    warn!("{} message processor lagged, skipped {} messages", platform, skipped);
                }
                Err(broadcast::error::RecvError::Closed) => {
                    info!("{} message stream closed", platform);
                    break;
                }
            }
        }
    }

    /// Follow configuration changes: rules are reloaded, channel records replaced
    pub async fn watch_config(self: &Arc<Self>, manager: &ConfigurationManager) {
        let mut changes = manager.subscribe_to_changes();
        let manager = manager.clone();
        let bot = Arc::clone(self);

        let handle = tokio::spawn(async move {
            loop {
                let event = match changes.recv().await {
                    Ok(event) => event,
                    Err(broadcast::error::RecvError::Lagged(_)) => continue,
                    Err(broadcast::error::RecvError::Closed) => break,
                };

                match event {
                    ConfigChangeEvent::RulesUpdated { file } => match bot.reload_rules().await {
                        Ok(count) => info!("Applied {} rules from {}", count, file),
                        Err(e) => error!("Failed to apply rules from {}: {:#}", file, e),
                    },
                    ConfigChangeEvent::BotConfigUpdated { file } => {
                        if let Err(e) = bot.apply_bot_config(&manager.get_bot_config().await).await {
                            error!("Failed to apply {}: {:#}", file, e);
                        }
                    }
                    ConfigChangeEvent::ValidationError { file, error } => {
                        warn!("Keeping previous configuration, {} is invalid: {}", file, error);
                    }
                    ConfigChangeEvent::ReloadComplete { files_updated } => {
                        debug!("Configuration reload complete: {:?}", files_updated);
                    }
                }
            }
        });

        self.tasks.lock().await.push(handle);
    }

    /// Connection status per platform
    pub async fn health_check(&self) -> HashMap<String, bool> {
        let mut status = HashMap::new();
        let connections_guard = self.connections.read().await;

        for (platform_name, connection) in connections_guard.iter() {
            let is_healthy = connection.is_connected().await;
            status.insert(platform_name.clone(), is_healthy);

            if !is_healthy {
                warn!("{} connection is unhealthy", platform_name);
            }
        }

        status
    }

    /// Start the admin API on the specified port
    #[cfg(feature = "web")]
    pub async fn start_web_dashboard(self: &Arc<Self>, port: u16) -> Result<()> {
        let server = crate::web::AdminServer::new(Arc::clone(self));
        let handle = tokio::spawn(async move {
            if let Err(e) = server.start_server(port).await {
                error!("Admin API error: {}", e);
            }
        });
        self.tasks.lock().await.push(handle);
        info!("Admin API started on port {}", port);
        Ok(())
    }

    #[cfg(not(feature = "web"))]
    pub async fn start_web_dashboard(self: &Arc<Self>, _port: u16) -> Result<()> {
        warn!("Admin API is disabled. Enable with --features web");
        Ok(())
    }

    /// Stop background tasks, drain the delivery queues, then disconnect
    pub async fn shutdown(&self) -> Result<()> {
        info!("Shutting down chat bot...");

        for task in self.tasks.lock().await.drain(..) {
            task.abort();
        }

        self.scheduler.shutdown().await;

        let connections_guard = self.connections.read().await;
        for (platform_name, connection) in connections_guard.iter() {
            if let Err(e) = connection.disconnect().await {
                error!("Error disconnecting from {}: {}", platform_name, e);
            }
        }

        info!("Chat bot shutdown complete");
        Ok(())
    }
}
