// src/bot/mirror.rs - Single-hop relay of channel traffic into a mirror channel

use log::{debug, error};
use std::sync::Arc;

use crate::bot::channels::ChannelDirectory;
use crate::bot::preparer::{MessagePreparer, PrepareOptions, Prepared};
use crate::bot::scheduler::{DeliveryScheduler, EnqueueOutcome};
use crate::types::{ChannelId, PipelineError};

#[derive(Debug, Clone, Copy, Default)]
pub struct MirrorOptions {
    /// The text came out of a command, so the author prefix is left off
    pub command_used: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MirrorOutcome {
    /// The source channel has no mirror target
    NotConfigured,
    /// The platform has no mirror marker
    Disabled,
    /// The bot wrote this message itself
    SelfAuthored,
    /// The target channel's preparation refused the text
    Refused,
    Forwarded(EnqueueOutcome),
}

pub struct MirrorRelay {
    directory: Arc<ChannelDirectory>,
    preparer: Arc<MessagePreparer>,
    scheduler: Arc<DeliveryScheduler>,
}

impl MirrorRelay {
    pub fn new(
        directory: Arc<ChannelDirectory>,
        preparer: Arc<MessagePreparer>,
        scheduler: Arc<DeliveryScheduler>,
    ) -> Self {
        Self {
            directory,
            preparer,
            scheduler,
        }
    }

    /// Copy `text` from `source` into its mirror channel, if any.
    ///
    /// The copy goes through the target's own preparation and queue and is
    /// never mirrored again.
    pub async fn forward(
        &self,
        source: ChannelId,
        text: &str,
        author: Option<&str>,
        options: MirrorOptions,
    ) -> Result<MirrorOutcome, PipelineError> {
        let (channel, platform) = self.directory.resolve(source).await?;

        let Some(target_id) = channel.mirror else {
            return Ok(MirrorOutcome::NotConfigured);
        };
        let Some(marker) = platform.mirror_marker.as_deref() else {
            debug!("Mirroring disabled on {}, not relaying #{}", platform.name, channel.name);
            return Ok(MirrorOutcome::Disabled);
        };
        if author.is_some_and(|name| name.eq_ignore_ascii_case(&platform.self_name)) {
            return Ok(MirrorOutcome::SelfAuthored);
        }

        let (target, target_platform) = self.directory.resolve(target_id).await.map_err(|_| {
            error!("Mirror target {} of #{} does not exist", target_id, channel.name);
            PipelineError::MirrorTargetMissing {
                origin: source,
                target: target_id,
            }
        })?;

        let forwarded = match author {
            Some(author) if !options.command_used => format!("{} {}: {}", marker, author, text),
            _ => format!("{} {}", marker, text),
        };

        let prepared = self
            .preparer
            .prepare(&forwarded, Some(&target), &target_platform, PrepareOptions::default())
            .await?;
        match prepared {
            Prepared::Ready(text) => {
                let outcome = self.scheduler.enqueue(&target, &target_platform, &text).await?;
                debug!("Mirrored #{} -> #{}: {:?}", channel.name, target.name, outcome);
                Ok(MirrorOutcome::Forwarded(outcome))
            }
            Prepared::Private(_) | Prepared::Refused => Ok(MirrorOutcome::Refused),
        }
    }
}
