// src/types/mod.rs - Shared data model for the outbound pipeline

use serde::{Deserialize, Serialize};
use std::fmt;

/// Numeric id of a platform record (Twitch, Discord, Cytube, IRC...)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct PlatformId(pub u32);

/// Numeric id of a channel record, unique across all platforms
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ChannelId(pub u32);

impl fmt::Display for PlatformId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "platform#{}", self.0)
    }
}

impl fmt::Display for ChannelId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "channel#{}", self.0)
    }
}

/// A chat message received from a platform, already reduced to plain fields
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatMessage {
    pub platform: String,
    pub channel: String,
    pub username: String,
    pub display_name: Option<String>,
    pub content: String,
    pub timestamp: chrono::DateTime<chrono::Utc>,
    pub user_badges: Vec<String>,
    /// Set when the message was produced by a command invocation
    pub command_used: bool,
}

/// The bot's operating privilege level in a channel
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ChannelMode {
    Inactive,
    #[serde(rename = "Last seen", alias = "LastSeen")]
    LastSeen,
    Read,
    Write,
    #[serde(rename = "VIP", alias = "Vip")]
    Vip,
    Moderator,
}

impl ChannelMode {
    /// Read and Inactive channels never receive anything from the bot
    pub fn can_send(&self) -> bool {
        !matches!(self, ChannelMode::Read | ChannelMode::Inactive)
    }

    /// Derive the mode from the badges the platform reports for the bot itself.
    ///
    /// Only sending modes are affected; a channel that was muted by an
    /// administrator stays muted regardless of what badges show up.
    pub fn from_badges(current: ChannelMode, badges: &[String]) -> ChannelMode {
        if !current.can_send() {
            return current;
        }

        let has = |name: &str| badges.iter().any(|b| b.eq_ignore_ascii_case(name));
        if has("moderator") || has("broadcaster") {
            ChannelMode::Moderator
        } else if has("vip") {
            ChannelMode::Vip
        } else if matches!(current, ChannelMode::Moderator | ChannelMode::Vip) {
            ChannelMode::Write
        } else {
            current
        }
    }
}

impl fmt::Display for ChannelMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ChannelMode::Inactive => "Inactive",
            ChannelMode::LastSeen => "Last seen",
            ChannelMode::Read => "Read",
            ChannelMode::Write => "Write",
            ChannelMode::Vip => "VIP",
            ChannelMode::Moderator => "Moderator",
        };
        f.write_str(name)
    }
}

/// What the bot does when the external banphrase API cannot be reached
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum DowntimeBehavior {
    /// Send the message anyway
    #[default]
    Ignore,
    /// Send the message with a warning prefix
    Notify,
    /// Send nothing at all
    Nothing,
    /// Reply with the reason the message could not be checked
    Refuse,
    /// Deliver the message privately to the invoking user
    Whisper,
}

/// Fatal, internal errors of the pipeline.
///
/// These indicate misconfiguration or corrupted rule data and are surfaced to
/// operators; user-facing refusals never use this type.
#[derive(Debug, thiserror::Error)]
pub enum PipelineError {
    #[error("rule {rule_id} broke its contract: {detail}")]
    ContractViolation { rule_id: u32, detail: String },

    #[error("unknown banphrase API type '{0}'")]
    UnknownApiKind(String),

    #[error("mirror target {target} of {origin} does not exist")]
    MirrorTargetMissing { origin: ChannelId, target: ChannelId },

    #[error("unknown channel {0}")]
    UnknownChannel(ChannelId),

    #[error("unknown platform {0}")]
    UnknownPlatform(PlatformId),

    #[error("no connection registered for platform '{0}'")]
    MissingConnection(String),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sending_modes() {
        assert!(!ChannelMode::Read.can_send());
        assert!(!ChannelMode::Inactive.can_send());
        assert!(ChannelMode::LastSeen.can_send());
        assert!(ChannelMode::Write.can_send());
        assert!(ChannelMode::Moderator.can_send());
    }

    #[test]
    fn test_mode_from_badges() {
        let badges = vec!["subscriber".to_string(), "moderator".to_string()];
        assert_eq!(ChannelMode::from_badges(ChannelMode::Write, &badges), ChannelMode::Moderator);

        let vip = vec!["VIP".to_string()];
        assert_eq!(ChannelMode::from_badges(ChannelMode::Write, &vip), ChannelMode::Vip);

        // Losing the badge drops back to plain Write
        assert_eq!(ChannelMode::from_badges(ChannelMode::Moderator, &[]), ChannelMode::Write);

        // Muted channels stay muted
        assert_eq!(ChannelMode::from_badges(ChannelMode::Read, &badges), ChannelMode::Read);
    }

    #[test]
    fn test_mode_yaml_names() {
        let mode: ChannelMode = serde_yaml::from_str("Last seen").unwrap();
        assert_eq!(mode, ChannelMode::LastSeen);
        let mode: ChannelMode = serde_yaml::from_str("VIP").unwrap();
        assert_eq!(mode, ChannelMode::Vip);
        assert_eq!(serde_yaml::to_string(&ChannelMode::Vip).unwrap().trim(), "VIP");
    }
}
