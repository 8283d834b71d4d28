//! # chatpipe
//!
//! The outbound half of a multi-platform chat bot. Every piece of text the bot
//! wants to say passes through the same pipeline before it reaches a chat
//! network:
//!
//! - **Banphrase engine**: prioritized local rules, then an optional
//!   Pajbot-compatible API with a per-channel downtime policy
//! - **Message preparation**: channel mode gating, link placeholders and
//!   length limits
//! - **Delivery queues**: one rate-limited FIFO per channel, sized by the
//!   bot's mode in that channel
//! - **Mirroring**: single-hop relay of a channel's traffic into another channel
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use chatpipe::prelude::*;
//! use std::sync::Arc;
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let config = ConfigurationManager::new("config");
//!     config.initialize().await?;
//!
//!     let bot = Arc::new(ChatBot::new(
//!         &config.get_bot_config().await,
//!         RuleFunctionTable::new(),
//!         Arc::new(YamlRuleSource::new(config.rules_path())),
//!         Arc::new(MemoryDenialLog::new()),
//!     )?);
//!     bot.add_connection(Arc::new(ConsoleConnection::new("console", "chatpipe"))).await;
//!     bot.reload_rules().await?;
//!     bot.start().await?;
//!
//!     bot.send(ChannelId(1), "Hello chat!", &SendOptions::default()).await?;
//!     Ok(())
//! }
//! ```

pub mod types;
pub mod platforms;
pub mod bot;
pub mod config;

#[cfg(feature = "web")]
pub mod web;

// Re-export commonly used items
pub mod prelude {
    pub use crate::bot::{ChatBot, SendOptions, SendOutcome};
    pub use crate::bot::channels::{ChannelRecord, PlatformRecord};
    pub use crate::bot::denial_log::{JsonLinesDenialLog, MemoryDenialLog};
    pub use crate::bot::preparer::PrepareOptions;
    pub use crate::bot::registry::{MemoryRuleSource, RuleSet, YamlRuleSource};
    pub use crate::bot::rules::{RuleFunctionTable, RuleOutcome, RuleType, SharedRuleConfig};
    pub use crate::config::{BotConfiguration, ConfigurationManager};
    pub use crate::platforms::{console::ConsoleConnection, PlatformConnection, SharedConnection};
    pub use crate::types::{ChannelId, ChannelMode, ChatMessage, DowntimeBehavior, PipelineError, PlatformId};
    #[cfg(feature = "web")]
    pub use crate::web::AdminServer;
    pub use anyhow::Result;
}

// Version information
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
