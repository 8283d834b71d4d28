// src/bot/preparer.rs - Gating, link policy and length limiting ahead of moderation

use anyhow::Result;
use log::{debug, warn};
use regex::Regex;
use std::sync::Arc;

use crate::bot::channels::{ChannelRecord, PlatformRecord};
use crate::bot::moderation::{ModerationContext, ModerationEngine, RunOptions};
use crate::types::PipelineError;

const LINK_PATTERN: &str = r"(?i)\b(?:https?://|www\.)\S+|\b[a-z0-9][a-z0-9-]*(?:\.[a-z0-9-]+)*\.(?:com|net|org|tv|gg|io|me|co|ly|be|gl|xyz|dev|app)\b(?:/\S*)?";

#[derive(Debug, Clone, Copy, Default)]
pub struct PrepareOptions {
    pub skip_banphrases: bool,
    pub skip_external_api: bool,
    pub skip_length_check: bool,
    pub keep_whitespace: bool,
    /// Refuse quietly instead of sending the denial reply
    pub return_boolean_on_fail: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Prepared {
    /// Text ready for the channel (a passed message or a denial reply)
    Ready(String),
    /// Text that may only be delivered privately to the invoking user
    Private(String),
    Refused,
}

pub struct MessagePreparer {
    engine: Arc<ModerationEngine>,
    link_regex: Regex,
}

impl MessagePreparer {
    pub fn new(engine: Arc<ModerationEngine>) -> Result<Self> {
        Ok(Self {
            engine,
            link_regex: Regex::new(LINK_PATTERN)?,
        })
    }

    pub fn engine(&self) -> &Arc<ModerationEngine> {
        &self.engine
    }

    /// Prepare `text` for a channel, or for a private message when `channel` is `None`
    pub async fn prepare(
        &self,
        text: &str,
        channel: Option<&ChannelRecord>,
        platform: &PlatformRecord,
        options: PrepareOptions,
    ) -> Result<Prepared, PipelineError> {
        let mut message = text.to_string();

        let (limit, context) = match channel {
            Some(channel) => {
                if !channel.mode.can_send() {
                    debug!("Not preparing message for #{} in mode {}", channel.name, channel.mode);
                    return Ok(Prepared::Refused);
                }
                if !channel.links_allowed {
                    message = self.replace_links(&message, &platform.link_placeholder);
                }
                (
                    channel.message_limit.unwrap_or(platform.message_limit),
                    ModerationContext::for_channel(channel),
                )
            }
            None => (platform.private_message_limit, ModerationContext::for_platform(platform)),
        };

        let limit = (!options.skip_length_check).then_some(limit);
        message = fit_message(&message, limit, options.keep_whitespace);
        if message.is_empty() {
            debug!("Dropping empty message for {}", context.label);
            return Ok(Prepared::Refused);
        }

        if options.skip_banphrases {
            return Ok(Prepared::Ready(message));
        }

        let run_options = RunOptions {
            skip_external_api: options.skip_external_api,
        };
        let result = self.engine.run(&message, &context, run_options).await?;
        if result.warn {
            warn!("Message for {} went out without an external banphrase check", context.label);
        }

        if !result.passed {
            return Ok(match result.text {
                Some(reply) if !options.return_boolean_on_fail => {
                    Prepared::Ready(fit_message(&reply, limit, options.keep_whitespace))
                }
                _ => Prepared::Refused,
            });
        }

        let text = fit_message(&result.text.unwrap_or_default(), limit, options.keep_whitespace);
        if text.is_empty() {
            return Ok(Prepared::Refused);
        }
        Ok(if result.private_message {
            Prepared::Private(text)
        } else {
            Prepared::Ready(text)
        })
    }

    fn replace_links(&self, text: &str, placeholder: &str) -> String {
        self.link_regex.replace_all(text, placeholder).into_owned()
    }
}

/// Collapse whitespace (unless asked not to) and cut the text down to `limit` characters
fn fit_message(text: &str, limit: Option<usize>, keep_whitespace: bool) -> String {
    let text = if keep_whitespace {
        text.trim_end().to_string()
    } else {
        text.split_whitespace().collect::<Vec<_>>().join(" ")
    };

    match limit {
        Some(limit) if text.chars().count() > limit => {
            if limit == 0 {
                return String::new();
            }
            let mut cut: String = text.chars().take(limit - 1).collect();
            cut.push('…');
            cut
        }
        _ => text,
    }
}
