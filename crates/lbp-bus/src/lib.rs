// SPDX-License-Identifier: MIT OR Apache-2.0
//! Topic-based publish/subscribe bus for decoupled event distribution
//!.
//!
//! Delivery is best-effort and fans out to all current subscribers of a
//! topic; there is no replay or persistence for subscribers that join late
//! or lag behind.
#![deny(unsafe_code)]
#![warn(missing_docs)]

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use tokio::sync::broadcast;

/// Stable pub/sub topic names; these strings are part of the contract and
/// must not change.
pub mod topics {
    /// Published by the reconciler whenever it replaces the live state
    /// snapshot.
    pub const RUNTIME_STATE_CHANGED: &str = "runtime.state.changed";
    /// Published whenever a job is appended to the pending queue, so a
    /// sweeper can wake early instead of waiting out its interval.
    pub const JOBS_PENDING_SIGNAL: &str = "jobs.pending.signal";
}

/// Default per-topic channel capacity.
const DEFAULT_CAPACITY: usize = 256;

#[derive(Default)]
struct TopicStats {
    total_published: AtomicU64,
    dropped_events: AtomicU64,
}

struct Topic {
    tx: broadcast::Sender<Vec<u8>>,
    stats: Arc<TopicStats>,
}

/// A minimal, in-process, string-topic publish/subscribe bus.
pub struct Bus {
    capacity: usize,
    topics: Mutex<HashMap<String, Topic>>,
}

impl Bus {
    /// Construct a bus with the default per-topic channel capacity.
    #[must_use]
    pub fn new() -> Self {
        Self::with_capacity(DEFAULT_CAPACITY)
    }

    /// Construct a bus with a given per-topic channel capacity.
    #[must_use]
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            capacity,
            topics: Mutex::new(HashMap::new()),
        }
    }

    /// Publish `payload` to every current subscriber of `topic`.
    ///
    /// If the topic has never been subscribed to, the event is published
    /// into a freshly created (and therefore subscriber-less) channel and
    /// counted as dropped — publishing never blocks waiting for a
    /// subscriber to show up.
    pub fn publish(&self, topic: &str, payload: Vec<u8>) {
        let mut topics = self.topics.lock().expect("bus lock poisoned");
        let entry = topics
            .entry(topic.to_string())
            .or_insert_with(|| new_topic(self.capacity));
        entry.stats.total_published.fetch_add(1, Ordering::Relaxed);
        if entry.tx.send(payload).is_err() {
            entry.stats.dropped_events.fetch_add(1, Ordering::Relaxed);
        }
    }

    /// Subscribe to future events on `topic`.
    #[must_use]
    pub fn subscribe(&self, topic: &str) -> Subscription {
        let mut topics = self.topics.lock().expect("bus lock poisoned");
        let entry = topics
            .entry(topic.to_string())
            .or_insert_with(|| new_topic(self.capacity));
        Subscription {
            rx: entry.tx.subscribe(),
            stats: Arc::clone(&entry.stats),
        }
    }

    /// Number of subscribers currently listening on `topic`.
    #[must_use]
    pub fn subscriber_count(&self, topic: &str) -> usize {
        self.topics
            .lock()
            .expect("bus lock poisoned")
            .get(topic)
            .map(|t| t.tx.receiver_count())
            .unwrap_or(0)
    }

    /// Snapshot of publish statistics for `topic`.
    #[must_use]
    pub fn stats(&self, topic: &str) -> BusStats {
        let topics = self.topics.lock().expect("bus lock poisoned");
        match topics.get(topic) {
            Some(t) => BusStats {
                total_published: t.stats.total_published.load(Ordering::Relaxed),
                active_subscribers: t.tx.receiver_count(),
                dropped_events: t.stats.dropped_events.load(Ordering::Relaxed),
            },
            None => BusStats::default(),
        }
    }
}

fn new_topic(capacity: usize) -> Topic {
    let (tx, _) = broadcast::channel(capacity);
    Topic {
        tx,
        stats: Arc::new(TopicStats::default()),
    }
}

impl Default for Bus {
    fn default() -> Self {
        Self::new()
    }
}

/// A handle for receiving events published to one topic.
pub struct Subscription {
    rx: broadcast::Receiver<Vec<u8>>,
    stats: Arc<TopicStats>,
}

impl Subscription {
    /// Receive the next event, waiting asynchronously.
    ///
    /// Returns `None` when the bus is dropped. A lagging subscriber skips
    /// forward past the events it missed; those are counted as dropped.
    pub async fn recv(&mut self) -> Option<Vec<u8>> {
        loop {
            match self.rx.recv().await {
                Ok(payload) => return Some(payload),
                Err(broadcast::error::RecvError::Lagged(n)) => {
                    self.stats.dropped_events.fetch_add(n, Ordering::Relaxed);
                    continue;
                }
                Err(broadcast::error::RecvError::Closed) => return None,
            }
        }
    }
}

/// Snapshot of bus publish statistics for one topic.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BusStats {
    /// Total number of events published to this topic.
    pub total_published: u64,
    /// Number of subscribers currently listening.
    pub active_subscribers: usize,
    /// Events lost because no subscriber was listening at publish time, or
    /// because a subscriber lagged behind.
    pub dropped_events: u64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn subscriber_receives_published_event() {
        let bus = Bus::new();
        let mut sub = bus.subscribe(topics::RUNTIME_STATE_CHANGED);
        bus.publish(topics::RUNTIME_STATE_CHANGED, b"snapshot-1".to_vec());
        let received = sub.recv().await.unwrap();
        assert_eq!(received, b"snapshot-1");
    }

    #[tokio::test]
    async fn fans_out_to_all_subscribers() {
        let bus = Bus::new();
        let mut a = bus.subscribe("t");
        let mut b = bus.subscribe("t");
        bus.publish("t", b"x".to_vec());
        assert_eq!(a.recv().await.unwrap(), b"x");
        assert_eq!(b.recv().await.unwrap(), b"x");
    }

    #[tokio::test]
    async fn publish_with_no_subscribers_is_counted_dropped() {
        let bus = Bus::new();
        bus.publish("no-one-listening", b"x".to_vec());
        let stats = bus.stats("no-one-listening");
        assert_eq!(stats.total_published, 1);
        assert_eq!(stats.dropped_events, 1);
        assert_eq!(stats.active_subscribers, 0);
    }

    #[tokio::test]
    async fn topics_are_independent() {
        let bus = Bus::new();
        let mut sub = bus.subscribe(topics::JOBS_PENDING_SIGNAL);
        bus.publish(topics::RUNTIME_STATE_CHANGED, b"unrelated".to_vec());
        assert_eq!(bus.subscriber_count(topics::RUNTIME_STATE_CHANGED), 0);
        assert_eq!(bus.subscriber_count(topics::JOBS_PENDING_SIGNAL), 1);
        bus.publish(topics::JOBS_PENDING_SIGNAL, b"job".to_vec());
        assert_eq!(sub.recv().await.unwrap(), b"job");
    }

    #[tokio::test]
    async fn subscriber_count_reflects_live_subscriptions() {
        let bus = Bus::new();
        assert_eq!(bus.subscriber_count("t"), 0);
        let sub = bus.subscribe("t");
        assert_eq!(bus.subscriber_count("t"), 1);
        drop(sub);
        assert_eq!(bus.subscriber_count("t"), 0);
    }

    #[tokio::test]
    async fn lagging_subscriber_skips_forward_and_counts_dropped() {
        let bus = Bus::with_capacity(2);
        let mut sub = bus.subscribe("t");
        bus.publish("t", b"1".to_vec());
        bus.publish("t", b"2".to_vec());
        bus.publish("t", b"3".to_vec());
        bus.publish("t", b"4".to_vec());
        let received = sub.recv().await.unwrap();
        assert!(received == b"3" || received == b"4");
        let stats = bus.stats("t");
        assert!(stats.dropped_events >= 1);
    }

    #[tokio::test]
    async fn bus_dropped_closes_subscriptions() {
        let bus = Bus::new();
        let mut sub = bus.subscribe("t");
        drop(bus);
        assert_eq!(sub.recv().await, None);
    }
}
