//! Local broker — in-process implementation of the transport contract.
//!
//! DESIGN
//! ======
//! One `LocalBroker` plays the hosted pub/sub service for every registry
//! that shares it. Each topic keeps its tracked members (session key ->
//! payloads) and its subscribers (session key -> event sender). Every
//! mutation fans out to all subscribers of the topic while the broker lock
//! is held, so all subscribers observe events in the same order.
//!
//! TRADE-OFFS
//! ==========
//! Fan-out is best-effort (`try_send`): a subscriber with a full buffer
//! misses that event. Registries re-derive from `current_state()` on the
//! next event, so a miss delays an update rather than corrupting it.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

use tokio::sync::mpsc;
use tracing::{debug, info};
use uuid::Uuid;

use super::{ChannelEvent, ChannelHandle, ChannelStatus, RawPresence, Transport};
use crate::config::PresenceConfig;
use crate::error::TransportError;
use crate::state::PresenceState;

// =============================================================================
// BROKER STATE
// =============================================================================

#[derive(Default)]
struct BrokerTopic {
    members: HashMap<String, Vec<PresenceState>>,
    subscribers: HashMap<String, mpsc::Sender<ChannelEvent>>,
}

impl BrokerTopic {
    fn is_empty(&self) -> bool {
        self.members.is_empty() && self.subscribers.is_empty()
    }

    fn fan_out(&self, event: &ChannelEvent) {
        for tx in self.subscribers.values() {
            // Best-effort: if a subscriber's channel is full, skip it.
            let _ = tx.try_send(event.clone());
        }
    }
}

struct BrokerInner {
    topics: Mutex<HashMap<String, BrokerTopic>>,
    event_capacity: usize,
    available: AtomicBool,
    subscribe_status: Mutex<ChannelStatus>,
    channels_opened: AtomicUsize,
    channels_closed: AtomicUsize,
    track_calls: AtomicUsize,
}

impl BrokerInner {
    fn lock(&self) -> MutexGuard<'_, HashMap<String, BrokerTopic>> {
        self.topics
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
    }

    /// Drop `key` from `topic`, announcing a leave if it was tracked.
    fn remove_session(&self, topic: &str, key: &str) -> bool {
        let mut topics = self.lock();
        let Some(entry) = topics.get_mut(topic) else {
            return false;
        };
        let was_subscribed = entry.subscribers.remove(key).is_some();
        let removed = entry.members.remove(key);
        if let Some(presences) = removed.clone() {
            entry.fan_out(&ChannelEvent::Leave { key: key.to_string(), presences });
        }
        if entry.is_empty() {
            topics.remove(topic);
        }
        was_subscribed || removed.is_some()
    }
}

// =============================================================================
// BROKER
// =============================================================================

/// In-process pub/sub broker. Clones share the same topics.
#[derive(Clone)]
pub struct LocalBroker {
    inner: Arc<BrokerInner>,
}

impl LocalBroker {
    #[must_use]
    pub fn new() -> Self {
        Self::from_config(&PresenceConfig::default())
    }

    /// Broker sized by `config.event_capacity` (`PRESENCE_EVENT_CAPACITY`).
    #[must_use]
    pub fn from_config(config: &PresenceConfig) -> Self {
        Self::with_capacity(config.event_capacity)
    }

    /// Broker whose per-channel event buffers hold `event_capacity` events.
    #[must_use]
    pub fn with_capacity(event_capacity: usize) -> Self {
        Self {
            inner: Arc::new(BrokerInner {
                topics: Mutex::new(HashMap::new()),
                event_capacity: event_capacity.max(1),
                available: AtomicBool::new(true),
                subscribe_status: Mutex::new(ChannelStatus::Subscribed),
                channels_opened: AtomicUsize::new(0),
                channels_closed: AtomicUsize::new(0),
                track_calls: AtomicUsize::new(0),
            }),
        }
    }

    /// When unavailable, `open_channel` fails with [`TransportError::Unavailable`].
    pub fn set_available(&self, available: bool) {
        self.inner.available.store(available, Ordering::SeqCst);
    }

    /// Status delivered to new subscriptions. Anything but `Subscribed`
    /// leaves the subscriber unregistered.
    pub fn set_subscribe_status(&self, status: ChannelStatus) {
        *self
            .inner
            .subscribe_status
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner) = status;
    }

    /// Simulate an unclean connection drop for one session.
    pub fn disconnect(&self, topic: &str, key: &str) {
        if self.inner.remove_session(topic, key) {
            info!(%topic, %key, "broker: session disconnected");
        }
    }

    /// Push a reconciliation event to every subscriber of `topic`.
    pub fn sync(&self, topic: &str) {
        if let Some(entry) = self.inner.lock().get(topic) {
            entry.fan_out(&ChannelEvent::Sync);
        }
    }

    #[must_use]
    pub fn session_keys(&self, topic: &str) -> Vec<String> {
        let topics = self.inner.lock();
        let mut keys: Vec<String> = topics
            .get(topic)
            .map(|t| t.subscribers.keys().cloned().collect())
            .unwrap_or_default();
        keys.sort();
        keys
    }

    #[must_use]
    pub fn subscriber_count(&self, topic: &str) -> usize {
        self.inner.lock().get(topic).map_or(0, |t| t.subscribers.len())
    }

    #[must_use]
    pub fn member_count(&self, topic: &str) -> usize {
        self.inner.lock().get(topic).map_or(0, |t| t.members.len())
    }

    #[must_use]
    pub fn topic_count(&self) -> usize {
        self.inner.lock().len()
    }

    #[must_use]
    pub fn channels_opened(&self) -> usize {
        self.inner.channels_opened.load(Ordering::SeqCst)
    }

    #[must_use]
    pub fn channels_closed(&self) -> usize {
        self.inner.channels_closed.load(Ordering::SeqCst)
    }

    #[must_use]
    pub fn track_calls(&self) -> usize {
        self.inner.track_calls.load(Ordering::SeqCst)
    }
}

impl Default for LocalBroker {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait::async_trait]
impl Transport for LocalBroker {
    async fn open_channel(&self, topic: &str) -> Result<Arc<dyn ChannelHandle>, TransportError> {
        if !self.inner.available.load(Ordering::SeqCst) {
            return Err(TransportError::Unavailable(format!("broker offline for {topic}")));
        }
        self.inner.channels_opened.fetch_add(1, Ordering::SeqCst);
        let channel = LocalChannel { topic: topic.to_string(), key: Uuid::new_v4().to_string(), broker: self.inner.clone() };
        debug!(%topic, key = %channel.key, "broker: channel opened");
        Ok(Arc::new(channel))
    }

    async fn close_channel(&self, channel: Arc<dyn ChannelHandle>) -> Result<(), TransportError> {
        self.inner.remove_session(channel.topic(), channel.key());
        self.inner.channels_closed.fetch_add(1, Ordering::SeqCst);
        debug!(topic = %channel.topic(), key = %channel.key(), "broker: channel closed");
        Ok(())
    }
}

// =============================================================================
// CHANNEL
// =============================================================================

/// One session's handle on a broker topic.
pub struct LocalChannel {
    topic: String,
    key: String,
    broker: Arc<BrokerInner>,
}

#[async_trait::async_trait]
impl ChannelHandle for LocalChannel {
    fn topic(&self) -> &str {
        &self.topic
    }

    fn key(&self) -> &str {
        &self.key
    }

    async fn subscribe(&self) -> Result<mpsc::Receiver<ChannelEvent>, TransportError> {
        let (tx, rx) = mpsc::channel(self.broker.event_capacity);
        let status = *self
            .broker
            .subscribe_status
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner);

        let _ = tx.try_send(ChannelEvent::Status(status));
        if !status.is_ready() {
            return Ok(rx);
        }

        let mut topics = self.broker.lock();
        let entry = topics.entry(self.topic.clone()).or_default();
        let _ = tx.try_send(ChannelEvent::Sync);
        entry.subscribers.insert(self.key.clone(), tx);
        Ok(rx)
    }

    async fn track(&self, state: &PresenceState) -> Result<(), TransportError> {
        let mut topics = self.broker.lock();
        let Some(entry) = topics
            .get_mut(&self.topic)
            .filter(|t| t.subscribers.contains_key(&self.key))
        else {
            return Err(TransportError::NotSubscribed { topic: self.topic.clone() });
        };

        self.broker.track_calls.fetch_add(1, Ordering::SeqCst);
        entry.members.insert(self.key.clone(), vec![state.clone()]);
        entry.fan_out(&ChannelEvent::Join { key: self.key.clone(), presences: vec![state.clone()] });
        Ok(())
    }

    async fn untrack(&self) -> Result<(), TransportError> {
        let mut topics = self.broker.lock();
        let Some(entry) = topics.get_mut(&self.topic) else {
            return Ok(());
        };
        if let Some(presences) = entry.members.remove(&self.key) {
            entry.fan_out(&ChannelEvent::Leave { key: self.key.clone(), presences });
        }
        Ok(())
    }

    fn current_state(&self) -> RawPresence {
        self.broker
            .lock()
            .get(&self.topic)
            .map(|t| t.members.clone())
            .unwrap_or_default()
    }
}

#[cfg(test)]
#[path = "local_test.rs"]
mod tests;
