// src/bot/scheduler.rs - Per-channel rate-limited delivery queues

use log::{debug, error, info, warn};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch, Mutex, RwLock};
use tokio::task::JoinHandle;
use tokio::time::Instant;

use crate::bot::channels::{ChannelRecord, PlatformRecord};
use crate::platforms::SharedConnection;
use crate::types::{ChannelId, ChannelMode, PipelineError};

/// Appended to a message identical to the previous one, so platforms don't
/// swallow it as a duplicate
pub const EVASION_MARKER: &str = " \u{E0000}";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ModeLimits {
    pub cooldown_ms: u64,
    pub max_queue_size: usize,
}

impl ModeLimits {
    pub fn cooldown(&self) -> Duration {
        Duration::from_millis(self.cooldown_ms)
    }
}

fn default_shutdown_timeout_ms() -> u64 {
    5000
}

/// Queue parameters for each sending mode
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SchedulerConfig {
    pub moderator: ModeLimits,
    pub vip: ModeLimits,
    pub write: ModeLimits,
    #[serde(default = "default_shutdown_timeout_ms")]
    pub shutdown_timeout_ms: u64,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            moderator: ModeLimits {
                cooldown_ms: 50,
                max_queue_size: 1000,
            },
            vip: ModeLimits {
                cooldown_ms: 250,
                max_queue_size: 10,
            },
            write: ModeLimits {
                cooldown_ms: 1250,
                max_queue_size: 3,
            },
            shutdown_timeout_ms: default_shutdown_timeout_ms(),
        }
    }
}

impl SchedulerConfig {
    /// `None` for modes that never send
    pub fn limits_for(&self, mode: ChannelMode) -> Option<ModeLimits> {
        match mode {
            ChannelMode::Moderator => Some(self.moderator),
            ChannelMode::Vip => Some(self.vip),
            ChannelMode::Write | ChannelMode::LastSeen => Some(self.write),
            ChannelMode::Read | ChannelMode::Inactive => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EnqueueOutcome {
    Queued,
    /// The queue was full; the new message was discarded
    Dropped,
    /// The channel's mode does not allow sending
    Muted,
}

#[derive(Debug, Default)]
struct QueueCounters {
    sent: AtomicU64,
    failed: AtomicU64,
    dropped: AtomicU64,
}

/// The channel's most recent transmission
#[derive(Debug, Clone, Copy)]
struct LastSent {
    at: Instant,
    chars: usize,
}

#[derive(Debug, Clone, Serialize)]
pub struct QueueStats {
    pub channel: ChannelId,
    pub name: String,
    pub mode: ChannelMode,
    pub cooldown_ms: u64,
    pub capacity: usize,
    pub pending: usize,
    pub sent: u64,
    pub failed: u64,
    pub dropped: u64,
    /// Length of the last transmitted message
    pub last_sent_chars: Option<usize>,
    pub last_sent_ms_ago: Option<u64>,
}

struct ChannelQueue {
    name: String,
    mode: ChannelMode,
    limits: ModeLimits,
    sender: mpsc::Sender<String>,
    cancel: watch::Sender<bool>,
    worker: JoinHandle<()>,
    counters: Arc<QueueCounters>,
}

impl ChannelQueue {
    fn pending(&self) -> usize {
        self.sender.max_capacity() - self.sender.capacity()
    }
}

/// Per-channel delivery state. Outlives the queue, which is rebuilt on every
/// mode change.
#[derive(Default)]
struct ChannelState {
    last_text: Option<String>,
    last_payload: Option<String>,
    /// Held by a worker for the duration of a transmission
    last_sent: Arc<Mutex<Option<LastSent>>>,
    queue: Option<ChannelQueue>,
}

/// Text to hand to the transport: a repeat of the previous text gets the
/// evasion marker toggled so it never matches the previous payload
fn evasion_payload(text: &str, last_text: Option<&str>, last_payload: Option<&str>) -> String {
    if last_text != Some(text) {
        return text.to_string();
    }

    let toggled = match text.strip_suffix(EVASION_MARKER) {
        Some(stripped) if !stripped.is_empty() => stripped.to_string(),
        _ => format!("{}{}", text, EVASION_MARKER),
    };
    if last_payload == Some(toggled.as_str()) {
        text.to_string()
    } else {
        toggled
    }
}

pub struct DeliveryScheduler {
    config: SchedulerConfig,
    connections: Arc<RwLock<HashMap<String, SharedConnection>>>,
    channels: Mutex<HashMap<ChannelId, ChannelState>>,
}

impl DeliveryScheduler {
    pub fn new(config: SchedulerConfig, connections: Arc<RwLock<HashMap<String, SharedConnection>>>) -> Self {
        Self {
            config,
            connections,
            channels: Mutex::new(HashMap::new()),
        }
    }

    pub fn config(&self) -> &SchedulerConfig {
        &self.config
    }

    /// Queue finished text for delivery to a channel
    pub async fn enqueue(
        &self,
        channel: &ChannelRecord,
        platform: &PlatformRecord,
        text: &str,
    ) -> Result<EnqueueOutcome, PipelineError> {
        let Some(limits) = self.config.limits_for(channel.mode) else {
            debug!("Not queueing for #{} in mode {}", channel.name, channel.mode);
            self.teardown(channel.id).await;
            return Ok(EnqueueOutcome::Muted);
        };

        let mut channels = self.channels.lock().await;
        let state = channels.entry(channel.id).or_default();

        let stale = state
            .queue
            .as_ref()
            .map(|queue| queue.mode != channel.mode || queue.worker.is_finished())
            .unwrap_or(true);
        if stale {
            if let Some(old) = state.queue.take() {
                Self::discard(old);
            }
            let queue = self
                .build_queue(channel, platform, limits, Arc::clone(&state.last_sent))
                .await?;
            state.queue = Some(queue);
        }

        let payload = evasion_payload(text, state.last_text.as_deref(), state.last_payload.as_deref());
        let Some(queue) = state.queue.as_ref() else {
            return Ok(EnqueueOutcome::Dropped);
        };

        match queue.sender.try_send(payload.clone()) {
            Ok(()) => {
                state.last_text = Some(text.to_string());
                state.last_payload = Some(payload);
                Ok(EnqueueOutcome::Queued)
            }
            Err(mpsc::error::TrySendError::Full(_)) => {
                queue.counters.dropped.fetch_add(1, Ordering::Relaxed);
                warn!(
                    "Delivery queue for #{} is full ({} entries), dropping message",
                    queue.name, queue.limits.max_queue_size
                );
                Ok(EnqueueOutcome::Dropped)
            }
            Err(mpsc::error::TrySendError::Closed(_)) => {
                error!("Delivery worker for #{} is gone, dropping message", queue.name);
                queue.counters.dropped.fetch_add(1, Ordering::Relaxed);
                Ok(EnqueueOutcome::Dropped)
            }
        }
    }

    async fn build_queue(
        &self,
        channel: &ChannelRecord,
        platform: &PlatformRecord,
        limits: ModeLimits,
        last_sent: Arc<Mutex<Option<LastSent>>>,
    ) -> Result<ChannelQueue, PipelineError> {
        let connection = self
            .connections
            .read()
            .await
            .get(&platform.name)
            .cloned()
            .ok_or_else(|| PipelineError::MissingConnection(platform.name.clone()))?;

        let (sender, receiver) = mpsc::channel(limits.max_queue_size.max(1));
        let (cancel, cancelled) = watch::channel(false);
        let counters = Arc::new(QueueCounters::default());
        let worker = tokio::spawn(Self::deliver(
            receiver,
            cancelled,
            connection,
            channel.name.clone(),
            limits.cooldown(),
            last_sent,
            Arc::clone(&counters),
        ));

        info!(
            "Delivery queue for #{} ready: mode {}, cooldown {}ms, capacity {}",
            channel.name, channel.mode, limits.cooldown_ms, limits.max_queue_size
        );

        Ok(ChannelQueue {
            name: channel.name.clone(),
            mode: channel.mode,
            limits,
            sender,
            cancel,
            worker,
            counters,
        })
    }

    /// Worker loop: one transmission at a time, each at least `cooldown` after
    /// the channel's previous one, whichever queue sent it
    async fn deliver(
        mut receiver: mpsc::Receiver<String>,
        mut cancelled: watch::Receiver<bool>,
        connection: SharedConnection,
        channel: String,
        cooldown: Duration,
        last_sent: Arc<Mutex<Option<LastSent>>>,
        counters: Arc<QueueCounters>,
    ) {
        loop {
            let text = tokio::select! {
                biased;
                _ = cancelled.changed() => break,
                text = receiver.recv() => match text {
                    Some(text) => text,
                    None => break,
                },
            };

            let mut last = loop {
                let last = last_sent.lock().await;
                if *cancelled.borrow() {
                    debug!("Delivery worker for #{} cancelled with a message in hand", channel);
                    return;
                }
                let previous = *last;
                match previous {
                    Some(previous) if previous.at + cooldown > Instant::now() => {
                        let ready = previous.at + cooldown;
                        drop(last);
                        tokio::select! {
                            biased;
                            _ = cancelled.changed() => {
                                debug!("Delivery worker for #{} cancelled during cooldown", channel);
                                return;
                            }
                            _ = tokio::time::sleep_until(ready) => {}
                        }
                    }
                    _ => break last,
                }
            };

            // Never interrupted: a cancelled worker still finishes this send
            let started = Instant::now();
            match connection.send_message(&channel, &text).await {
                Ok(()) => {
                    counters.sent.fetch_add(1, Ordering::Relaxed);
                    debug!("Delivered message to #{}", channel);
                }
                Err(e) => {
                    counters.failed.fetch_add(1, Ordering::Relaxed);
                    error!("Failed to deliver message to #{}: {:#}", channel, e);
                }
            }
            *last = Some(LastSent {
                at: started,
                chars: text.chars().count(),
            });
        }
        debug!("Delivery worker for #{} finished", channel);
    }

    /// Stop a queue: its backlog is dropped, a send in progress completes
    fn discard(queue: ChannelQueue) {
        let backlog = queue.pending();
        let _ = queue.cancel.send(true);
        if backlog > 0 {
            warn!(
                "Discarded {} queued message(s) for #{} after a mode change from {}",
                backlog, queue.name, queue.mode
            );
        } else {
            debug!("Rebuilding delivery queue for #{}", queue.name);
        }
    }

    /// Drop a channel's queue and its backlog
    pub async fn teardown(&self, channel: ChannelId) {
        let queue = self
            .channels
            .lock()
            .await
            .get_mut(&channel)
            .and_then(|state| state.queue.take());
        if let Some(queue) = queue {
            Self::discard(queue);
        }
    }

    pub async fn stats(&self) -> Vec<QueueStats> {
        let channels = self.channels.lock().await;
        let mut stats = Vec::new();
        for (id, state) in channels.iter() {
            let Some(queue) = &state.queue else {
                continue;
            };
            let last = *state.last_sent.lock().await;
            stats.push(QueueStats {
                channel: *id,
                name: queue.name.clone(),
                mode: queue.mode,
                cooldown_ms: queue.limits.cooldown_ms,
                capacity: queue.limits.max_queue_size,
                pending: queue.pending(),
                sent: queue.counters.sent.load(Ordering::Relaxed),
                failed: queue.counters.failed.load(Ordering::Relaxed),
                dropped: queue.counters.dropped.load(Ordering::Relaxed),
                last_sent_chars: last.map(|l| l.chars),
                last_sent_ms_ago: last.map(|l| l.at.elapsed().as_millis() as u64),
            });
        }
        stats.sort_by_key(|s| s.channel);
        stats
    }

    /// Close every queue and let the workers drain, up to the configured timeout
    pub async fn shutdown(&self) {
        let queues: Vec<ChannelQueue> = self
            .channels
            .lock()
            .await
            .values_mut()
            .filter_map(|state| state.queue.take())
            .collect();
        if queues.is_empty() {
            return;
        }

        info!("Draining {} delivery queue(s)", queues.len());
        let deadline = Instant::now() + Duration::from_millis(self.config.shutdown_timeout_ms);

        for queue in queues {
            let ChannelQueue {
                name,
                sender,
                cancel,
                mut worker,
                ..
            } = queue;
            drop(sender);
            match tokio::time::timeout_at(deadline, &mut worker).await {
                Ok(_) => debug!("Delivery queue for #{} drained", name),
                Err(_) => {
                    warn!("Delivery queue for #{} did not drain in time, aborting", name);
                    let _ = cancel.send(true);
                    worker.abort();
                }
            }
        }
    }
}
