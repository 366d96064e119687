//! Message Bus (C2): channel-keyed publish/subscribe with a per-priority
//! publish delay, generalized from a single global `broadcast::channel`
//! (the `orchestrator::event_bus` shape) into a per-channel registry.

pub mod channels;
pub mod message;

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{broadcast, mpsc, RwLock};
use tokio_stream::wrappers::BroadcastStream;
use tracing::{debug, warn};

use crate::config::QueueDelays;
pub use message::{Message, MessageType, Priority, Recipient};

const CHANNEL_CAPACITY: usize = 1024;

struct QueuedMessage {
    channel: String,
    message: Message,
    delay: Duration,
}

/// Channel-keyed pub/sub. `publish` never blocks the caller: the message
/// is handed to a per-channel delay worker that enforces the configured
/// priority delay before the broadcast fan-out, preserving publish order
/// within a channel even when a later message has a shorter delay (§4.3,
/// scenario E6).
pub struct Bus {
    delays: RwLock<QueueDelays>,
    senders: RwLock<HashMap<String, broadcast::Sender<Message>>>,
    pattern_senders: RwLock<Vec<(String, broadcast::Sender<Message>)>>,
    queue_tx: mpsc::UnboundedSender<QueuedMessage>,
}

impl Bus {
    pub fn new(delays: QueueDelays) -> Arc<Self> {
        let (queue_tx, queue_rx) = mpsc::unbounded_channel();
        let bus = Arc::new(Self {
            delays: RwLock::new(delays),
            senders: RwLock::new(HashMap::new()),
            pattern_senders: RwLock::new(Vec::new()),
            queue_tx,
        });
        tokio::spawn(Self::run_delay_worker(bus.clone(), queue_rx));
        bus
    }

    /// Replaces the per-priority publish delays in place (§6:
    /// `queue.delay_<priority>` changeable at runtime without a process
    /// restart). Takes effect for every message queued after this call.
    pub async fn set_delays(&self, delays: QueueDelays) {
        *self.delays.write().await = delays;
    }

    async fn delay_for(&self, priority: Priority) -> Duration {
        let delays = self.delays.read().await;
        let ms = match priority {
            Priority::Critical => delays.critical,
            Priority::Urgent => delays.urgent,
            Priority::High => delays.high,
            Priority::Normal => delays.normal,
            Priority::Low => delays.low,
            Priority::Operational => delays.operational,
        };
        Duration::from_millis(ms)
    }

    /// Enqueues `message` for delayed delivery. The only await is a quick
    /// `RwLock` read to resolve the current delay for this priority; the
    /// actual broadcast still happens on the bus's delay worker.
    pub async fn publish(&self, channel: impl Into<String>, message: Message) {
        let channel = channel.into();
        let delay = self.delay_for(message.priority).await;
        debug!(channel = %channel, priority = ?message.priority, delay_ms = delay.as_millis(), "bus: message queued");
        if self
            .queue_tx
            .send(QueuedMessage { channel, message, delay })
            .is_err()
        {
            warn!("bus: delay worker is gone, dropping message");
        }
    }

    /// The delay worker processes messages strictly in arrival order: it
    /// sleeps out each message's own delay before broadcasting, then
    /// moves to the next. This keeps FIFO-per-channel intact because a
    /// later, low-delay message still waits behind an earlier,
    /// high-delay one rather than racing ahead of it.
    async fn run_delay_worker(bus: Arc<Self>, mut queue_rx: mpsc::UnboundedReceiver<QueuedMessage>) {
        while let Some(queued) = queue_rx.recv().await {
            if !queued.delay.is_zero() {
                tokio::time::sleep(queued.delay).await;
            }
            bus.broadcast(&queued.channel, queued.message).await;
        }
    }

    async fn broadcast(&self, channel: &str, message: Message) {
        let senders = self.senders.read().await;
        if let Some(tx) = senders.get(channel) {
            let _ = tx.send(message.clone());
        }
        drop(senders);

        let patterns = self.pattern_senders.read().await;
        for (pattern, tx) in patterns.iter() {
            if glob_match(pattern, channel) {
                let _ = tx.send(message.clone());
            }
        }
        // No subscribers yet is not an error: at-most-once delivery (§4.3).
    }

    /// Returns a cancellable stream of messages on `channel`. Dropping
    /// the stream unsubscribes.
    ///
    /// `channel` may be an exact channel name or a glob pattern
    /// containing `*` (e.g. `channel:agent:*` to hear every agent's
    /// channel) — §4.3's `subscribe(channel|pattern)` contract. A
    /// pattern subscription sees every future message published to any
    /// channel matching it, including channels created after the
    /// subscription.
    pub async fn subscribe(&self, channel: impl Into<String>) -> BroadcastStream<Message> {
        let channel = channel.into();
        if channel.contains('*') {
            let mut patterns = self.pattern_senders.write().await;
            if let Some((_, tx)) = patterns.iter().find(|(pattern, _)| pattern == &channel) {
                return BroadcastStream::new(tx.subscribe());
            }
            let (tx, rx) = broadcast::channel(CHANNEL_CAPACITY);
            patterns.push((channel, tx));
            BroadcastStream::new(rx)
        } else {
            let mut senders = self.senders.write().await;
            let tx = senders
                .entry(channel)
                .or_insert_with(|| broadcast::channel(CHANNEL_CAPACITY).0);
            BroadcastStream::new(tx.subscribe())
        }
    }
}

/// Minimal `*`-only glob matcher (no `?`/character classes — channel
/// names are colon-delimited identifiers, not paths). `*` matches any
/// run of characters, including none.
fn glob_match(pattern: &str, text: &str) -> bool {
    let p: Vec<char> = pattern.chars().collect();
    let t: Vec<char> = text.chars().collect();
    let (mut pi, mut ti) = (0, 0);
    let mut star: Option<(usize, usize)> = None;
    while ti < t.len() {
        if pi < p.len() && (p[pi] == t[ti]) {
            pi += 1;
            ti += 1;
        } else if pi < p.len() && p[pi] == '*' {
            star = Some((pi, ti));
            pi += 1;
        } else if let Some((star_pi, star_ti)) = star {
            pi = star_pi + 1;
            ti = star_ti + 1;
            star = Some((star_pi, ti));
        } else {
            return false;
        }
    }
    while pi < p.len() && p[pi] == '*' {
        pi += 1;
    }
    pi == p.len()
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures_util::StreamExt;
    use serde_json::json;

    fn zero_delays() -> QueueDelays {
        QueueDelays {
            critical: 0,
            urgent: 0,
            high: 0,
            normal: 0,
            low: 0,
            operational: 0,
        }
    }

    #[tokio::test]
    async fn messages_are_delivered_fifo_to_a_subscriber() {
        let bus = Bus::new(zero_delays());
        let mut stream = bus.subscribe(channels::BROADCAST).await;
        for i in 0..50 {
            bus.publish(
                channels::BROADCAST,
                Message::new(MessageType::Broadcast, "cmo", Recipient::All, json!({"i": i}), Priority::Normal),
            )
            .await;
        }
        for i in 0..50 {
            let msg = stream.next().await.unwrap().unwrap();
            assert_eq!(msg.payload["i"], i);
        }
    }

    #[tokio::test]
    async fn higher_delay_message_still_precedes_a_later_lower_delay_one() {
        let delays = QueueDelays {
            critical: 0,
            urgent: 0,
            high: 0,
            normal: 30,
            low: 0,
            operational: 0,
        };
        let bus = Bus::new(delays);
        let mut stream = bus.subscribe(channels::BROADCAST).await;
        bus.publish(
            channels::BROADCAST,
            Message::new(MessageType::Broadcast, "cmo", Recipient::All, json!({"which": "normal"}), Priority::Normal),
        )
        .await;
        bus.publish(
            channels::BROADCAST,
            Message::new(MessageType::Alert, "cmo", Recipient::All, json!({"which": "critical"}), Priority::Critical),
        )
        .await;
        let first = stream.next().await.unwrap().unwrap();
        let second = stream.next().await.unwrap().unwrap();
        assert_eq!(first.payload["which"], "normal");
        assert_eq!(second.payload["which"], "critical");
    }

    #[tokio::test]
    async fn pattern_subscriber_hears_every_matching_channel() {
        let bus = Bus::new(zero_delays());
        let mut stream = bus.subscribe("channel:agent:*").await;
        bus.publish(
            channels::agent("cfo-1"),
            Message::new(MessageType::Direct, "cfo-1", Recipient::All, json!({"from": "cfo"}), Priority::Normal),
        )
        .await;
        bus.publish(
            channels::agent("coo-1"),
            Message::new(MessageType::Direct, "coo-1", Recipient::All, json!({"from": "coo"}), Priority::Normal),
        )
        .await;
        bus.publish(
            channels::BROADCAST,
            Message::new(MessageType::Broadcast, "cmo", Recipient::All, json!({"from": "broadcast"}), Priority::Normal),
        )
        .await;

        let first = stream.next().await.unwrap().unwrap();
        let second = stream.next().await.unwrap().unwrap();
        assert_eq!(first.payload["from"], "cfo");
        assert_eq!(second.payload["from"], "coo");
    }

    #[tokio::test]
    async fn pattern_subscription_sees_channels_created_after_it() {
        let bus = Bus::new(zero_delays());
        let mut stream = bus.subscribe("channel:agent:*").await;
        // no channel named "channel:agent:new-agent" exists in `senders`
        // until this publish creates it via the delay worker's broadcast.
        bus.publish(
            channels::agent("new-agent"),
            Message::new(MessageType::Direct, "new-agent", Recipient::All, json!({"ok": true}), Priority::Normal),
        )
        .await;
        let msg = stream.next().await.unwrap().unwrap();
        assert_eq!(msg.payload["ok"], true);
    }

    #[tokio::test]
    async fn set_delays_applies_to_messages_published_after_the_change() {
        let bus = Bus::new(zero_delays());
        bus.set_delays(QueueDelays { critical: 0, urgent: 0, high: 0, normal: 0, low: 0, operational: 0 }).await;
        let mut stream = bus.subscribe(channels::BROADCAST).await;
        bus.publish(
            channels::BROADCAST,
            Message::new(MessageType::Broadcast, "cmo", Recipient::All, json!({"ok": true}), Priority::Normal),
        )
        .await;
        let msg = stream.next().await.unwrap().unwrap();
        assert_eq!(msg.payload["ok"], true);
    }

    #[test]
    fn glob_match_supports_prefix_suffix_and_middle_wildcards() {
        assert!(glob_match("channel:agent:*", "channel:agent:ceo-1"));
        assert!(!glob_match("channel:agent:*", "channel:broadcast"));
        assert!(glob_match("*:status-feed", "channel:status-feed"));
        assert!(glob_match("channel:*:logs", "channel:worker:logs"));
        assert!(!glob_match("channel:*:logs", "channel:worker:events"));
        assert!(glob_match("*", "anything"));
    }
}
