//! Queue and topic consumers for messages the remote peer pushes unasked.
//!
//! Queues are point-to-point: messages delivered before anyone is receiving
//! are buffered in an unbounded channel. Topics fan out: every subscriber
//! sees every published or delivered message exactly once.

use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use dashmap::DashMap;
use hostbridge_core::Message;
use parking_lot::{Mutex, RwLock};
use tokio::sync::mpsc;
use tracing::{debug, error, warn};

use crate::connection::Connection;
use crate::error::ConnectionError;
use crate::pending::PendingResponse;

/// Identifies one topic subscription.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SubscriptionId(pub u64);

type Subscriber = Arc<dyn Fn(&Message) + Send + Sync>;

/// Where an unsolicited message ended up.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Delivery {
    /// Buffered on a queue.
    Queue,
    /// Handed to every subscriber of a topic. `panicked` of them panicked.
    Topic { subscribers: usize, panicked: usize },
    /// No open queue or topic has this name.
    Unrouted,
}

// ---------------------------------------------------------------------------
// Channels
// ---------------------------------------------------------------------------

struct QueueChannel {
    name: String,
    tx: Mutex<Option<mpsc::UnboundedSender<Message>>>,
    rx: tokio::sync::Mutex<mpsc::UnboundedReceiver<Message>>,
}

impl QueueChannel {
    fn new(name: &str) -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        Self {
            name: name.to_string(),
            tx: Mutex::new(Some(tx)),
            rx: tokio::sync::Mutex::new(rx),
        }
    }

    fn push(&self, message: Message) -> bool {
        self.tx
            .lock()
            .as_ref()
            .is_some_and(|tx| tx.send(message).is_ok())
    }

    fn close(&self) {
        self.tx.lock().take();
    }
}

struct TopicChannel {
    name: String,
    subscribers: RwLock<Vec<(SubscriptionId, Subscriber)>>,
    next_id: AtomicU64,
}

impl TopicChannel {
    fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            subscribers: RwLock::new(Vec::new()),
            next_id: AtomicU64::new(1),
        }
    }

    /// Invokes every subscriber once. Returns `(invoked, panicked)`.
    fn publish(&self, message: &Message) -> (usize, usize) {
        // Snapshot so subscribers may (un)subscribe from inside their callback.
        let subscribers: Vec<(SubscriptionId, Subscriber)> = self
            .subscribers
            .read()
            .iter()
            .map(|(id, subscriber)| (*id, Arc::clone(subscriber)))
            .collect();

        let mut panicked = 0;
        for (id, subscriber) in &subscribers {
            if catch_unwind(AssertUnwindSafe(|| subscriber(message))).is_err() {
                panicked += 1;
                error!(
                    topic = %self.name,
                    subscription = id.0,
                    correlation_id = %message.correlation_id(),
                    "Topic subscriber panicked"
                );
            }
        }
        (subscribers.len(), panicked)
    }
}

// ---------------------------------------------------------------------------
// ConsumerRegistry
// ---------------------------------------------------------------------------

/// Queues and topics registered on a connection, looked up by destination.
#[derive(Default)]
pub struct ConsumerRegistry {
    queues: DashMap<String, Arc<QueueChannel>>,
    topics: DashMap<String, Arc<TopicChannel>>,
}

impl std::fmt::Debug for ConsumerRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConsumerRegistry")
            .field("queues", &self.queues.len())
            .field("topics", &self.topics.len())
            .finish()
    }
}

impl ConsumerRegistry {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    fn queue_channel(&self, name: &str) -> Arc<QueueChannel> {
        self.queues
            .entry(name.to_string())
            .or_insert_with(|| Arc::new(QueueChannel::new(name)))
            .clone()
    }

    fn topic_channel(&self, name: &str) -> Arc<TopicChannel> {
        self.topics
            .entry(name.to_string())
            .or_insert_with(|| Arc::new(TopicChannel::new(name)))
            .clone()
    }

    /// Routes an unsolicited message to the consumer for its destination.
    ///
    /// Queues are checked before topics when both use the same name.
    pub fn deliver(&self, message: Message) -> Delivery {
        let destination = message.destination().to_string();

        if let Some(queue) = self.queues.get(&destination).map(|q| Arc::clone(q.value())) {
            if queue.push(message) {
                debug!(destination = %destination, "Buffered message on queue");
                return Delivery::Queue;
            }
            warn!(destination = %destination, "Queue is closed, dropping message");
            return Delivery::Unrouted;
        }

        if let Some(topic) = self.topics.get(&destination).map(|t| Arc::clone(t.value())) {
            let (subscribers, panicked) = topic.publish(&message);
            debug!(destination = %destination, subscribers, panicked, "Published message to topic");
            return Delivery::Topic {
                subscribers,
                panicked,
            };
        }

        warn!(destination = %destination, "No consumer registered for destination, dropping message");
        Delivery::Unrouted
    }

    /// Closes every queue. Buffered messages can still be received.
    pub fn close_all(&self) {
        for queue in &self.queues {
            queue.value().close();
        }
    }

    #[must_use]
    pub fn has_destination(&self, name: &str) -> bool {
        self.queues.contains_key(name) || self.topics.contains_key(name)
    }
}

// ---------------------------------------------------------------------------
// Queue
// ---------------------------------------------------------------------------

/// Point-to-point destination served by a connection.
#[derive(Clone)]
pub struct Queue {
    channel: Arc<QueueChannel>,
    connection: Connection,
}

impl std::fmt::Debug for Queue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Queue").field("name", &self.channel.name).finish()
    }
}

impl Queue {
    pub(crate) fn open(registry: &ConsumerRegistry, name: &str, connection: Connection) -> Self {
        Self {
            channel: registry.queue_channel(name),
            connection,
        }
    }

    #[must_use]
    pub fn name(&self) -> &str {
        &self.channel.name
    }

    /// Sends a request to the remote side of this queue, using the
    /// connection's default time-to-live.
    ///
    /// # Errors
    ///
    /// See [`Connection::send`].
    pub fn send(&self, body: serde_json::Value) -> Result<PendingResponse, ConnectionError> {
        self.connection.request(self.name(), body)
    }

    /// Waits for the next message delivered to this queue.
    ///
    /// Returns `None` once the queue is closed and drained.
    pub async fn receive(&self) -> Option<Message> {
        self.channel.rx.lock().await.recv().await
    }

    /// Takes the next buffered message without waiting.
    #[must_use]
    pub fn try_receive(&self) -> Option<Message> {
        self.channel.rx.try_lock().ok()?.try_recv().ok()
    }
}

// ---------------------------------------------------------------------------
// Topic
// ---------------------------------------------------------------------------

/// Publish/subscribe destination served by a connection.
#[derive(Clone)]
pub struct Topic {
    channel: Arc<TopicChannel>,
}

impl std::fmt::Debug for Topic {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Topic").field("name", &self.channel.name).finish()
    }
}

impl Topic {
    pub(crate) fn open(registry: &ConsumerRegistry, name: &str) -> Self {
        Self {
            channel: registry.topic_channel(name),
        }
    }

    #[must_use]
    pub fn name(&self) -> &str {
        &self.channel.name
    }

    /// Registers a callback invoked once for every message on this topic.
    pub fn subscribe<F>(&self, subscriber: F) -> SubscriptionId
    where
        F: Fn(&Message) + Send + Sync + 'static,
    {
        let id = SubscriptionId(self.channel.next_id.fetch_add(1, Ordering::Relaxed));
        self.channel
            .subscribers
            .write()
            .push((id, Arc::new(subscriber)));
        id
    }

    /// Removes a subscription. Returns `false` if it was not registered.
    pub fn unsubscribe(&self, id: SubscriptionId) -> bool {
        let mut subscribers = self.channel.subscribers.write();
        let before = subscribers.len();
        subscribers.retain(|(existing, _)| *existing != id);
        subscribers.len() != before
    }

    /// Publishes `body` to local subscribers. Returns how many were invoked.
    ///
    /// A panicking subscriber is logged and does not stop the others.
    pub fn publish(&self, body: serde_json::Value) -> usize {
        let message = Message::create(self.name(), body, None);
        self.channel.publish(&message).0
    }

    #[must_use]
    pub fn subscriber_count(&self) -> usize {
        self.channel.subscribers.read().len()
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use std::sync::atomic::AtomicUsize;

    use serde_json::json;

    use super::*;

    #[test]
    fn unknown_destination_is_unrouted() {
        let registry = ConsumerRegistry::new();
        let delivery = registry.deliver(Message::create("/nowhere", json!({}), None));
        assert_eq!(delivery, Delivery::Unrouted);
    }

    #[test]
    fn topic_fans_out_to_every_subscriber_once() {
        let registry = ConsumerRegistry::new();
        let topic = Topic::open(&registry, "/some/topic");
        let received = Arc::new(AtomicUsize::new(0));

        for _ in 0..2 {
            let received = Arc::clone(&received);
            topic.subscribe(move |message| {
                assert_eq!(message.body, json!({"test": "foo"}));
                received.fetch_add(1, Ordering::SeqCst);
            });
        }

        let delivery = registry.deliver(Message::create("/some/topic", json!({"test": "foo"}), None));
        assert_eq!(
            delivery,
            Delivery::Topic {
                subscribers: 2,
                panicked: 0
            }
        );
        assert_eq!(received.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn panicking_subscriber_does_not_starve_the_rest() {
        let registry = ConsumerRegistry::new();
        let topic = Topic::open(&registry, "/t");
        let received = Arc::new(AtomicUsize::new(0));
        topic.subscribe(|_| panic!("subscriber bug"));
        let counter = Arc::clone(&received);
        topic.subscribe(move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
        });

        let delivery = registry.deliver(Message::create("/t", json!({}), None));
        assert_eq!(
            delivery,
            Delivery::Topic {
                subscribers: 2,
                panicked: 1
            }
        );
        assert_eq!(received.load(Ordering::SeqCst), 1);

        // Local publishing is isolated the same way.
        assert_eq!(topic.publish(json!({})), 2);
        assert_eq!(received.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn unsubscribe_stops_delivery() {
        let registry = ConsumerRegistry::new();
        let topic = Topic::open(&registry, "/t");
        let received = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&received);
        let id = topic.subscribe(move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
        });

        assert!(topic.unsubscribe(id));
        assert!(!topic.unsubscribe(id));
        assert_eq!(topic.publish(json!({})), 0);
        assert_eq!(received.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn subscriber_may_unsubscribe_itself() {
        let registry = ConsumerRegistry::new();
        let topic = Topic::open(&registry, "/t");
        let handle = topic.clone();
        let own_id = Arc::new(Mutex::new(None));
        let own_id_in_callback = Arc::clone(&own_id);

        let id = topic.subscribe(move |_| {
            if let Some(id) = *own_id_in_callback.lock() {
                handle.unsubscribe(id);
            }
        });
        *own_id.lock() = Some(id);

        assert_eq!(topic.publish(json!({})), 1);
        assert_eq!(topic.subscriber_count(), 0);
    }

    #[test]
    fn reopening_a_topic_shares_subscribers() {
        let registry = ConsumerRegistry::new();
        let first = Topic::open(&registry, "/t");
        first.subscribe(|_| {});
        let second = Topic::open(&registry, "/t");
        assert_eq!(second.subscriber_count(), 1);
        assert!(registry.has_destination("/t"));
    }
}
