//! Event union and the notification bus.
//!
//! Events for a given topic (a room or a session) reach every subscriber in
//! the order they were published. Two delivery modes share one content
//! guarantee: push subscribers get events over an open channel as they are
//! produced, poll subscribers drain a bounded per-client queue on their own
//! interval. Only latency differs.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use uuid::Uuid;

use crate::common::AppError;

/// Everything the server broadcasts to connected clients, decoded once at
/// the boundary instead of sniffing dynamic JSON blobs.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Event {
    Joined {
        username: String,
        connected_users: Vec<String>,
    },
    Left {
        username: String,
        connected_users: Vec<String>,
    },
    StatusChanged {
        msg: String,
        connected_users: Vec<String>,
    },
    ChatMessage {
        username: String,
        msg: String,
    },
    UploadStarted {
        transfer_id: String,
        filenames: Vec<String>,
    },
    UploadProgress {
        transfer_id: String,
        bytes_transferred: u64,
        /// Omitted when the total size is unknown upfront.
        #[serde(skip_serializing_if = "Option::is_none")]
        percent: Option<u8>,
    },
    UploadCompleted {
        transfer_id: String,
    },
    PageLoaded {
        path: String,
    },
    OtherRequest {
        path: String,
    },
}

impl Event {
    fn progress_transfer_id(&self) -> Option<&str> {
        match self {
            Event::UploadProgress { transfer_id, .. } => Some(transfer_id),
            _ => None,
        }
    }
}

/// Handle identifying one subscriber on one topic.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SubscriberId(Uuid);

impl SubscriberId {
    fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl std::fmt::Display for SubscriberId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        self.0.fmt(f)
    }
}

impl std::str::FromStr for SubscriberId {
    type Err = uuid::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(Self(Uuid::parse_str(s)?))
    }
}

struct PollQueue {
    queue: VecDeque<Event>,
    last_poll: Instant,
}

impl PollQueue {
    fn push(&mut self, event: Event, capacity: usize) {
        // A newer progress report supersedes the buffered one for the same
        // transfer. Chat messages and roster events are never coalesced.
        if let Some(id) = event.progress_transfer_id() {
            self.queue
                .retain(|queued| queued.progress_transfer_id() != Some(id));
        }
        if self.queue.len() >= capacity {
            self.queue.pop_front();
        }
        self.queue.push_back(event);
    }
}

enum Delivery {
    Push(mpsc::UnboundedSender<Event>),
    Poll(Mutex<PollQueue>),
}

struct Subscriber {
    /// Username for roster-tailored broadcasts; None for non-room listeners.
    name: Mutex<Option<String>>,
    delivery: Delivery,
}

impl Subscriber {
    fn name(&self) -> Option<String> {
        lock_clean(&self.name).clone()
    }
}

type TopicSubscribers = Mutex<Vec<(SubscriberId, Arc<Subscriber>)>>;

/// Fan-out point for progress and room events.
///
/// Publishing locks the topic's subscriber list, which is the serializing
/// point that makes per-subscriber ordering identical across delivery modes.
pub struct EventBus {
    topics: DashMap<String, TopicSubscribers>,
    poll_queue_capacity: usize,
}

impl EventBus {
    pub fn new(poll_queue_capacity: usize) -> Self {
        Self {
            topics: DashMap::new(),
            poll_queue_capacity,
        }
    }

    /// Register a push subscriber; events arrive on the returned channel.
    pub fn subscribe_push(
        &self,
        topic: &str,
        name: Option<String>,
    ) -> (SubscriberId, mpsc::UnboundedReceiver<Event>) {
        let (sender, receiver) = mpsc::unbounded_channel();
        let id = self.insert(
            topic,
            Subscriber {
                name: Mutex::new(name),
                delivery: Delivery::Push(sender),
            },
        );
        (id, receiver)
    }

    /// Register a poll subscriber with a bounded buffer.
    pub fn subscribe_poll(&self, topic: &str, name: Option<String>) -> SubscriberId {
        self.insert(
            topic,
            Subscriber {
                name: Mutex::new(name),
                delivery: Delivery::Poll(Mutex::new(PollQueue {
                    queue: VecDeque::new(),
                    last_poll: Instant::now(),
                })),
            },
        )
    }

    fn insert(&self, topic: &str, subscriber: Subscriber) -> SubscriberId {
        let id = SubscriberId::new();
        let entry = self
            .topics
            .entry(topic.to_string())
            .or_insert_with(|| Mutex::new(Vec::new()));
        lock_clean(&entry).push((id, Arc::new(subscriber)));
        id
    }

    /// Broadcast one event to every subscriber of a topic.
    pub fn publish(&self, topic: &str, event: Event) {
        self.publish_with(topic, |_| event.clone());
    }

    /// Broadcast a per-recipient event, built from the recipient's
    /// registered name. Rooms use this so each client sees a roster that
    /// excludes itself.
    pub fn publish_with<F>(&self, topic: &str, build: F)
    where
        F: Fn(Option<&str>) -> Event,
    {
        let Some(entry) = self.topics.get(topic) else {
            return;
        };
        let mut subscribers = lock_clean(&entry);
        subscribers.retain(|(id, subscriber)| {
            let name = subscriber.name();
            let event = build(name.as_deref());
            match &subscriber.delivery {
                Delivery::Push(sender) => {
                    if sender.send(event).is_err() {
                        tracing::debug!(subscriber = %id, topic, "push channel closed, dropping subscriber");
                        return false;
                    }
                    true
                }
                Delivery::Poll(queue) => {
                    lock_clean(queue).push(event, self.poll_queue_capacity);
                    true
                }
            }
        });
        let now_empty = subscribers.is_empty();
        drop(subscribers);
        drop(entry);
        if now_empty {
            self.prune_topic(topic);
        }
    }

    /// Drain buffered events for a polling client and refresh its liveness.
    pub fn poll(&self, topic: &str, id: SubscriberId) -> Result<Vec<Event>, AppError> {
        let entry = self
            .topics
            .get(topic)
            .ok_or_else(|| AppError::NotFound(format!("unknown topic: {topic}")))?;
        let subscribers = lock_clean(&entry);
        let subscriber = subscribers
            .iter()
            .find(|(sid, _)| *sid == id)
            .map(|(_, s)| s.clone())
            .ok_or_else(|| AppError::NotFound(format!("unknown poll client: {id}")))?;
        drop(subscribers);

        match &subscriber.delivery {
            Delivery::Poll(queue) => {
                let mut queue = lock_clean(queue);
                queue.last_poll = Instant::now();
                Ok(queue.queue.drain(..).collect())
            }
            Delivery::Push(_) => Err(AppError::BadRequest(
                "subscriber is not in poll mode".to_string(),
            )),
        }
    }

    /// Refresh a polling client's liveness without draining its queue.
    pub fn touch(&self, topic: &str, id: SubscriberId) -> Result<(), AppError> {
        let entry = self
            .topics
            .get(topic)
            .ok_or_else(|| AppError::NotFound(format!("unknown topic: {topic}")))?;
        let subscribers = lock_clean(&entry);
        let subscriber = subscribers
            .iter()
            .find(|(sid, _)| *sid == id)
            .map(|(_, s)| s.clone())
            .ok_or_else(|| AppError::NotFound(format!("unknown poll client: {id}")))?;
        drop(subscribers);

        if let Delivery::Poll(queue) = &subscriber.delivery {
            lock_clean(queue).last_poll = Instant::now();
        }
        Ok(())
    }

    /// Remove a subscriber, returning its registered name so the caller can
    /// revoke roster presence.
    pub fn unsubscribe(&self, topic: &str, id: SubscriberId) -> Option<String> {
        let name = {
            let entry = self.topics.get(topic)?;
            let mut subscribers = lock_clean(&entry);
            let index = subscribers.iter().position(|(sid, _)| *sid == id)?;
            let (_, subscriber) = subscribers.remove(index);
            subscriber.name()
        };
        self.prune_topic(topic);
        name
    }

    /// Topic names are client-supplied, so entries whose last subscriber is
    /// gone must not accumulate.
    fn prune_topic(&self, topic: &str) {
        self.topics
            .remove_if(topic, |_, subscribers| lock_clean(subscribers).is_empty());
    }

    /// Drop poll clients that have not fetched within `max_idle`. Returns
    /// `(topic, id, name)` for each revoked client.
    pub fn sweep_stale_pollers(
        &self,
        max_idle: Duration,
    ) -> Vec<(String, SubscriberId, Option<String>)> {
        let now = Instant::now();
        let mut revoked = Vec::new();
        let mut emptied = Vec::new();
        for entry in self.topics.iter() {
            let mut subscribers = lock_clean(entry.value());
            subscribers.retain(|(id, subscriber)| match &subscriber.delivery {
                Delivery::Poll(queue) => {
                    let stale = now.duration_since(lock_clean(queue).last_poll) >= max_idle;
                    if stale {
                        revoked.push((entry.key().clone(), *id, subscriber.name()));
                    }
                    !stale
                }
                Delivery::Push(sender) => !sender.is_closed(),
            });
            if subscribers.is_empty() {
                emptied.push(entry.key().clone());
            }
        }
        for topic in emptied {
            self.prune_topic(&topic);
        }
        revoked
    }

    /// Point subscribers registered under `old_name` at `new_name` so
    /// roster-tailored broadcasts keep excluding the right recipient.
    pub fn rename_subscriber(&self, topic: &str, old_name: &str, new_name: &str) {
        let Some(entry) = self.topics.get(topic) else {
            return;
        };
        let subscribers = lock_clean(&entry);
        for (_, subscriber) in subscribers.iter() {
            let mut name = lock_clean(&subscriber.name);
            if name.as_deref() == Some(old_name) {
                *name = Some(new_name.to_string());
            }
        }
    }

    pub fn subscriber_count(&self, topic: &str) -> usize {
        self.topics
            .get(topic)
            .map(|entry| lock_clean(&entry).len())
            .unwrap_or(0)
    }

    pub fn topic_count(&self) -> usize {
        self.topics.len()
    }
}

fn lock_clean<T>(mutex: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    match mutex.lock() {
        Ok(guard) => guard,
        Err(poisoned) => {
            tracing::error!("event bus lock poisoned, recovering");
            poisoned.into_inner()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn progress(transfer_id: &str, bytes: u64) -> Event {
        Event::UploadProgress {
            transfer_id: transfer_id.to_string(),
            bytes_transferred: bytes,
            percent: None,
        }
    }

    fn chat(msg: &str) -> Event {
        Event::ChatMessage {
            username: "alice".to_string(),
            msg: msg.to_string(),
        }
    }

    #[test]
    fn poll_queue_supersedes_progress_for_same_transfer() {
        let bus = EventBus::new(16);
        let id = bus.subscribe_poll("t1", None);

        bus.publish("t1", progress("x", 100));
        bus.publish("t1", chat("hello"));
        bus.publish("t1", progress("x", 200));
        bus.publish("t1", progress("y", 50));

        let events = bus.poll("t1", id).expect("poll");
        assert_eq!(
            events,
            vec![chat("hello"), progress("x", 200), progress("y", 50)]
        );
    }

    #[test]
    fn poll_queue_drops_oldest_on_overflow() {
        let bus = EventBus::new(2);
        let id = bus.subscribe_poll("t1", None);

        bus.publish("t1", chat("one"));
        bus.publish("t1", chat("two"));
        bus.publish("t1", chat("three"));

        let events = bus.poll("t1", id).expect("poll");
        assert_eq!(events, vec![chat("two"), chat("three")]);
    }

    #[tokio::test]
    async fn push_and_poll_see_identical_sequences() {
        let bus = EventBus::new(16);
        let (_push_id, mut receiver) = bus.subscribe_push("room", None);
        let poll_id = bus.subscribe_poll("room", None);

        for i in 0..5 {
            bus.publish("room", chat(&format!("m{i}")));
        }

        let mut pushed = Vec::new();
        while let Ok(event) = receiver.try_recv() {
            pushed.push(event);
        }
        let polled = bus.poll("room", poll_id).expect("poll");
        assert_eq!(pushed, polled);
        assert_eq!(pushed.len(), 5);
    }

    #[test]
    fn unsubscribe_returns_registered_name() {
        let bus = EventBus::new(16);
        let id = bus.subscribe_poll("room", Some("carol".to_string()));

        assert_eq!(bus.subscriber_count("room"), 1);
        assert_eq!(bus.unsubscribe("room", id), Some("carol".to_string()));
        assert_eq!(bus.subscriber_count("room"), 0);
    }

    #[test]
    fn stale_pollers_are_revoked() {
        let bus = EventBus::new(16);
        let id = bus.subscribe_poll("room", Some("dan".to_string()));

        let revoked = bus.sweep_stale_pollers(Duration::ZERO);
        assert_eq!(revoked.len(), 1);
        assert_eq!(revoked[0].0, "room");
        assert_eq!(revoked[0].1, id);
        assert_eq!(revoked[0].2.as_deref(), Some("dan"));
        assert_eq!(bus.subscriber_count("room"), 0);
    }

    #[test]
    fn topics_without_subscribers_are_dropped() {
        let bus = EventBus::new(16);

        let id = bus.subscribe_poll("room-a", None);
        bus.subscribe_poll("room-b", Some("erin".to_string()));
        assert_eq!(bus.topic_count(), 2);

        bus.unsubscribe("room-a", id);
        assert_eq!(bus.topic_count(), 1);

        bus.sweep_stale_pollers(Duration::ZERO);
        assert_eq!(bus.topic_count(), 0);
    }

    #[test]
    fn event_serializes_with_type_tag() {
        let json = serde_json::to_string(&progress("abc", 10)).expect("serialize");
        assert!(json.contains("\"type\":\"upload_progress\""));
        assert!(!json.contains("percent"));

        let json = serde_json::to_string(&Event::UploadProgress {
            transfer_id: "abc".to_string(),
            bytes_transferred: 10,
            percent: Some(50),
        })
        .expect("serialize");
        assert!(json.contains("\"percent\":50"));
    }
}
