//! In-process message bus connecting channels to the orchestrator.
//!
//! The bus has two independent sides:
//!
//! - **Inbound** — a strict single-consumer FIFO. Producers call
//!   [`MessageBus::publish_inbound`]; the orchestrator's dispatch loop calls
//!   [`MessageBus::consume_inbound`]. When consumers outpace producers they
//!   park as waiters and are woken in FIFO order, one message per waiter.
//! - **Outbound** — per-channel pub/sub. [`MessageBus::publish_outbound`]
//!   delivers synchronously to every subscriber of the message's channel in
//!   registration order. Messages published to a channel with no subscribers
//!   are dropped; there is no replay, so subscribers must register before the
//!   messages they care about are published.

use std::{
    collections::{HashMap, VecDeque},
    sync::{Arc, Mutex},
};

use serde::{Deserialize, Serialize};
use tokio::sync::oneshot;

// ─── Messages ────────────────────────────────────────────────────────────────

/// A message entering the agent (user input, cron system events).
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct InboundMessage {
    /// Originating channel (`"cli"`, `"http"`, `"cron"`, …).
    pub channel: String,
    /// Conversation id within the channel.
    pub chat_id: String,
    pub text: String,
}

impl InboundMessage {
    pub fn new(
        channel: impl Into<String>,
        chat_id: impl Into<String>,
        text: impl Into<String>,
    ) -> Self {
        Self {
            channel: channel.into(),
            chat_id: chat_id.into(),
            text: text.into(),
        }
    }
}

/// A message leaving the agent toward a channel.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct OutboundMessage {
    pub channel: String,
    pub chat_id: String,
    pub text: String,
}

impl OutboundMessage {
    pub fn new(
        channel: impl Into<String>,
        chat_id: impl Into<String>,
        text: impl Into<String>,
    ) -> Self {
        Self {
            channel: channel.into(),
            chat_id: chat_id.into(),
            text: text.into(),
        }
    }
}

/// Callback invoked for every outbound message on a subscribed channel.
///
/// Subscribers run on the publisher's task and must not block.
pub type OutboundSubscriber = Arc<dyn Fn(&OutboundMessage) + Send + Sync>;

// ─── MessageBus ──────────────────────────────────────────────────────────────

struct InboundState {
    queue: VecDeque<InboundMessage>,
    waiters: VecDeque<oneshot::Sender<InboundMessage>>,
    closed: bool,
}

/// Single-consumer inbound queue plus per-channel outbound fan-out.
pub struct MessageBus {
    inbound: Mutex<InboundState>,
    outbound: Mutex<HashMap<String, Vec<OutboundSubscriber>>>,
}

impl MessageBus {
    pub fn new() -> Self {
        Self {
            inbound: Mutex::new(InboundState {
                queue: VecDeque::new(),
                waiters: VecDeque::new(),
                closed: false,
            }),
            outbound: Mutex::new(HashMap::new()),
        }
    }

    /// Enqueue an inbound message, handing it directly to the head waiter if
    /// one is parked. Exactly one consumer receives each message.
    pub fn publish_inbound(&self, message: InboundMessage) {
        let mut inbound = match self.inbound.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        if inbound.closed {
            log::warn!("[bus] dropping inbound message on closed bus");
            return;
        }
        let mut message = message;
        // A waiter may have been cancelled; skip dead ones in order.
        while let Some(waiter) = inbound.waiters.pop_front() {
            match waiter.send(message) {
                Ok(()) => return,
                Err(returned) => message = returned,
            }
        }
        inbound.queue.push_back(message);
    }

    /// Dequeue the next inbound message, parking until one arrives.
    ///
    /// Returns `None` once the bus is closed and drained. Parked consumers
    /// are served in FIFO order.
    pub async fn consume_inbound(&self) -> Option<InboundMessage> {
        let receiver = {
            let mut inbound = match self.inbound.lock() {
                Ok(guard) => guard,
                Err(poisoned) => poisoned.into_inner(),
            };
            if let Some(message) = inbound.queue.pop_front() {
                return Some(message);
            }
            if inbound.closed {
                return None;
            }
            let (tx, rx) = oneshot::channel();
            inbound.waiters.push_back(tx);
            rx
        };
        receiver.await.ok()
    }

    /// Close the inbound side: parked consumers wake with `None` and further
    /// publishes are dropped.
    pub fn close(&self) {
        let mut inbound = match self.inbound.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        inbound.closed = true;
        inbound.waiters.clear();
    }

    /// Register an outbound subscriber for `channel`.
    ///
    /// Subscribers only see messages published after registration.
    pub fn subscribe(&self, channel: impl Into<String>, subscriber: OutboundSubscriber) {
        let mut outbound = match self.outbound.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        outbound.entry(channel.into()).or_default().push(subscriber);
    }

    /// Deliver `message` to every subscriber of its channel, in registration
    /// order. No subscribers means the message is silently dropped.
    pub fn publish_outbound(&self, message: &OutboundMessage) {
        let subscribers: Vec<OutboundSubscriber> = {
            let outbound = match self.outbound.lock() {
                Ok(guard) => guard,
                Err(poisoned) => poisoned.into_inner(),
            };
            outbound
                .get(&message.channel)
                .map(|subs| subs.to_vec())
                .unwrap_or_default()
        };
        for subscriber in subscribers {
            subscriber(message);
        }
    }
}

impl Default for MessageBus {
    fn default() -> Self {
        Self::new()
    }
}

// ─── Tests ───────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn msg(text: &str) -> InboundMessage {
        InboundMessage::new("cli", "chat-1", text)
    }

    #[tokio::test]
    async fn queued_messages_consumed_in_enqueue_order() {
        let bus = MessageBus::new();
        for i in 0..4 {
            bus.publish_inbound(msg(&format!("m{i}")));
        }
        for i in 0..4 {
            let m = bus.consume_inbound().await.unwrap();
            assert_eq!(m.text, format!("m{i}"), "FIFO among enqueued messages");
        }
    }

    #[tokio::test]
    async fn waiter_receives_published_message() {
        let bus = Arc::new(MessageBus::new());
        let consumer = {
            let bus = Arc::clone(&bus);
            tokio::spawn(async move { bus.consume_inbound().await })
        };
        // Let the consumer park before publishing.
        tokio::task::yield_now().await;
        bus.publish_inbound(msg("hello"));
        let received = consumer.await.unwrap().unwrap();
        assert_eq!(received.text, "hello");
    }

    #[tokio::test]
    async fn each_message_goes_to_exactly_one_consumer() {
        let bus = Arc::new(MessageBus::new());
        for i in 0..8 {
            bus.publish_inbound(msg(&format!("m{i}")));
        }
        let mut handles = Vec::new();
        for _ in 0..8 {
            let bus = Arc::clone(&bus);
            handles.push(tokio::spawn(async move { bus.consume_inbound().await }));
        }
        let mut texts: Vec<String> = Vec::new();
        for handle in handles {
            texts.push(handle.await.unwrap().unwrap().text);
        }
        texts.sort();
        let expected: Vec<String> = (0..8).map(|i| format!("m{i}")).collect();
        assert_eq!(texts, expected, "every message delivered exactly once");
    }

    #[tokio::test]
    async fn close_wakes_parked_consumer_with_none() {
        let bus = Arc::new(MessageBus::new());
        let consumer = {
            let bus = Arc::clone(&bus);
            tokio::spawn(async move { bus.consume_inbound().await })
        };
        tokio::task::yield_now().await;
        bus.close();
        assert!(consumer.await.unwrap().is_none());
    }

    #[test]
    fn outbound_delivers_in_registration_order() {
        let bus = MessageBus::new();
        let order = Arc::new(Mutex::new(Vec::new()));
        for tag in ["first", "second", "third"] {
            let order = Arc::clone(&order);
            bus.subscribe(
                "cli",
                Arc::new(move |_m: &OutboundMessage| {
                    order.lock().unwrap().push(tag);
                }),
            );
        }
        bus.publish_outbound(&OutboundMessage::new("cli", "c", "hi"));
        assert_eq!(*order.lock().unwrap(), vec!["first", "second", "third"]);
    }

    #[test]
    fn outbound_without_subscribers_is_dropped() {
        let bus = MessageBus::new();
        // Publishing to a channel nobody watches must not panic or buffer.
        bus.publish_outbound(&OutboundMessage::new("nowhere", "c", "lost"));

        let count = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&count);
        bus.subscribe(
            "nowhere",
            Arc::new(move |_m: &OutboundMessage| {
                counter.fetch_add(1, Ordering::SeqCst);
            }),
        );
        assert_eq!(
            count.load(Ordering::SeqCst),
            0,
            "late subscriber sees no replay"
        );
    }

    #[test]
    fn outbound_only_matching_channel_receives() {
        let bus = MessageBus::new();
        let count = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&count);
        bus.subscribe(
            "telegram",
            Arc::new(move |_m: &OutboundMessage| {
                counter.fetch_add(1, Ordering::SeqCst);
            }),
        );
        bus.publish_outbound(&OutboundMessage::new("cli", "c", "hi"));
        bus.publish_outbound(&OutboundMessage::new("telegram", "c", "hi"));
        assert_eq!(count.load(Ordering::SeqCst), 1);
    }
}
