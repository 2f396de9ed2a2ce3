//! Presence registry — topic -> channel -> snapshot.
//!
//! DESIGN
//! ======
//! The registry is the only component that talks to the transport. It keeps
//! one entry per logical topic holding the shared transport channel, the
//! local `PresenceState` this process publishes, the set of local consumers,
//! and the last computed snapshot. The first `join` on a topic opens the
//! channel; the last `leave` untracks and closes it.
//!
//! Each open channel gets one event task. Every sync/join/leave event makes
//! it re-read `current_state()`, flatten, and broadcast the result to all
//! local consumers of the topic, so consumers of one topic observe the same
//! sequence of snapshots.
//!
//! CONCURRENCY
//! ===========
//! The topic map sits behind a std `Mutex` that is never held across an
//! await. Entry creation happens under the lock, so concurrent joins for a
//! new topic produce exactly one `open_channel`. Each entry carries a
//! generation and each consumer an id; a `Membership` only releases the
//! generation it joined, which makes leave idempotent and stale leaves
//! harmless. `leave_all` bumps an epoch so joins that straddle it come back
//! already left, and a channel whose open completes after its entry is gone
//! is closed immediately. A `join` future dropped mid-flight releases its
//! consumer through `Membership`'s `Drop`, and a channel it had opened but
//! not yet installed is closed on the runtime.
//!
//! Topic names are trimmed on every entry point.
//!
//! ERROR HANDLING
//! ==============
//! Transport errors are logged and swallowed. A topic whose channel never
//! opens or never becomes ready simply reports an empty snapshot.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, Weak};

use tokio::sync::{broadcast, mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::config::PresenceConfig;
use crate::error::ErrorCode;
use crate::identity::IdentityProvider;
use crate::snapshot;
use crate::state::{PresencePatch, PresenceState, Snapshot, now_ms};
use crate::transport::{ChannelEvent, ChannelHandle, Transport};

// =============================================================================
// TOPIC STATE
// =============================================================================

struct TopicEntry {
    generation: u64,
    consumers: HashSet<u64>,
    /// State this process publishes on the topic.
    local: PresenceState,
    channel: Option<Arc<dyn ChannelHandle>>,
    ready: bool,
    ready_tx: Arc<watch::Sender<bool>>,
    snapshot: Snapshot,
    snapshot_tx: broadcast::Sender<Snapshot>,
    /// Serializes `track` calls so the last publish carries the latest state.
    publish_gate: Arc<tokio::sync::Mutex<()>>,
    events_task: Option<JoinHandle<()>>,
}

impl TopicEntry {
    fn release(self, transport: Arc<dyn Transport>, topic: String) -> Release {
        Release { transport, topic, channel: self.channel, events_task: self.events_task }
    }
}

#[derive(Default)]
struct Topics {
    entries: HashMap<String, TopicEntry>,
    next_id: u64,
    epoch: u64,
}

impl Topics {
    fn next_id(&mut self) -> u64 {
        self.next_id += 1;
        self.next_id
    }
}

struct RegistryInner {
    transport: Arc<dyn Transport>,
    identity: Arc<dyn IdentityProvider>,
    config: PresenceConfig,
    topics: Mutex<Topics>,
    runtime: Option<tokio::runtime::Handle>,
}

// =============================================================================
// RELEASE
// =============================================================================

/// Transport work left over after an entry is removed from the map.
struct Release {
    transport: Arc<dyn Transport>,
    topic: String,
    channel: Option<Arc<dyn ChannelHandle>>,
    events_task: Option<JoinHandle<()>>,
}

impl Release {
    async fn run(self) {
        if let Some(channel) = self.channel {
            if let Err(e) = channel.untrack().await {
                warn!(topic = %self.topic, code = e.error_code(), error = %e, "presence untrack failed");
            }
            if let Err(e) = self.transport.close_channel(channel).await {
                warn!(topic = %self.topic, code = e.error_code(), error = %e, "presence channel close failed");
            }
        }
        if let Some(task) = self.events_task {
            task.abort();
        }
        info!(topic = %self.topic, "presence channel released");
    }
}

/// A channel that has been opened but not yet installed on its entry.
/// Closed on drop unless disarmed, so a cancelled join cannot leak it.
struct PendingChannel {
    registry: PresenceRegistry,
    topic: String,
    channel: Option<Arc<dyn ChannelHandle>>,
}

impl PendingChannel {
    fn disarm(mut self) {
        self.channel = None;
    }
}

impl Drop for PendingChannel {
    fn drop(&mut self) {
        let Some(channel) = self.channel.take() else {
            return;
        };
        debug!(topic = %self.topic, "presence join cancelled mid-open; closing channel");
        self.registry.spawn_release(Release {
            transport: self.registry.inner.transport.clone(),
            topic: std::mem::take(&mut self.topic),
            channel: Some(channel),
            events_task: None,
        });
    }
}

// =============================================================================
// REGISTRY
// =============================================================================

/// Process-wide presence registry. Clones share the same topics.
#[derive(Clone)]
pub struct PresenceRegistry {
    inner: Arc<RegistryInner>,
}

impl PresenceRegistry {
    #[must_use]
    pub fn new(transport: Arc<dyn Transport>, identity: Arc<dyn IdentityProvider>, config: PresenceConfig) -> Self {
        Self {
            inner: Arc::new(RegistryInner {
                transport,
                identity,
                config,
                topics: Mutex::new(Topics::default()),
                runtime: tokio::runtime::Handle::try_current().ok(),
            }),
        }
    }

    #[must_use]
    pub fn config(&self) -> &PresenceConfig {
        &self.inner.config
    }

    fn lock(&self) -> MutexGuard<'_, Topics> {
        self.inner
            .topics
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
    }

    // =========================================================================
    // JOIN
    // =========================================================================

    /// Join `topic` with `initial` fields merged over the resolved identity.
    ///
    /// Returns an inert membership (already left, never produces a snapshot)
    /// when the topic is blank, nobody is signed in, or `leave_all` ran while
    /// the identity was being resolved.
    pub async fn join(&self, topic: &str, initial: PresencePatch) -> Membership {
        let topic = topic.trim();
        if topic.is_empty() {
            debug!("presence join skipped: empty topic");
            return Membership::inert(topic);
        }

        let epoch = self.lock().epoch;
        let Some(user) = self.inner.identity.current_user().await else {
            info!(%topic, "presence join skipped: no authenticated user");
            return Membership::inert(topic);
        };
        let now = now_ms();

        let mut open_generation = None;
        let mut republish = None;
        let membership = {
            let mut topics = self.lock();
            if topics.epoch != epoch {
                info!(%topic, "presence join raced leave_all; dropping");
                return Membership::inert(topic);
            }
            let consumer = topics.next_id();

            if !topics.entries.contains_key(topic) {
                let generation = topics.next_id();
                let (ready_tx, _) = watch::channel(false);
                let (snapshot_tx, _) = broadcast::channel(self.inner.config.snapshot_capacity);
                topics.entries.insert(
                    topic.to_string(),
                    TopicEntry {
                        generation,
                        consumers: HashSet::new(),
                        local: PresenceState::compose(&user, &initial, now),
                        channel: None,
                        ready: false,
                        ready_tx: Arc::new(ready_tx),
                        snapshot: Snapshot::default(),
                        snapshot_tx,
                        publish_gate: Arc::new(tokio::sync::Mutex::new(())),
                        events_task: None,
                    },
                );
                open_generation = Some(generation);
            } else if let Some(entry) = topics.entries.get_mut(topic) {
                if entry.local.user_id == user.id {
                    entry.local.merge(&initial);
                    entry.local.touch(now);
                } else {
                    entry.local = PresenceState::compose(&user, &initial, now);
                }
                if entry.ready {
                    republish = Some(entry.generation);
                }
            }

            let Some(entry) = topics.entries.get_mut(topic) else {
                return Membership::inert(topic);
            };
            entry.consumers.insert(consumer);
            info!(%topic, consumers = entry.consumers.len(), "presence consumer joined");

            Membership {
                topic: topic.to_string(),
                slot: Some(Slot {
                    registry: self.clone(),
                    generation: entry.generation,
                    consumer,
                    snapshots: entry.snapshot_tx.subscribe(),
                    ready: entry.ready_tx.subscribe(),
                }),
                left: AtomicBool::new(false),
            }
        };

        if let Some(generation) = open_generation {
            self.open_topic(topic, generation).await;
        } else if let Some(generation) = republish {
            self.publish(topic, generation).await;
        }
        membership
    }

    async fn open_topic(&self, topic: &str, generation: u64) {
        let transport_topic = self.inner.config.transport_topic(topic);
        let channel = match self.inner.transport.open_channel(&transport_topic).await {
            Ok(channel) => channel,
            Err(e) => {
                warn!(%topic, code = e.error_code(), error = %e, "presence channel open failed");
                return;
            }
        };
        let pending = PendingChannel { registry: self.clone(), topic: topic.to_string(), channel: Some(channel.clone()) };
        let subscribed = channel.subscribe().await;
        pending.disarm();
        let events = match subscribed {
            Ok(events) => events,
            Err(e) => {
                warn!(%topic, code = e.error_code(), error = %e, "presence subscribe failed");
                self.close_orphan(topic, channel).await;
                return;
            }
        };

        let installed = {
            let mut topics = self.lock();
            match topics.entries.get_mut(topic) {
                Some(entry) if entry.generation == generation => {
                    entry.channel = Some(channel.clone());
                    entry.events_task = Some(tokio::spawn(run_events(
                        Arc::downgrade(&self.inner),
                        topic.to_string(),
                        generation,
                        channel.clone(),
                        events,
                    )));
                    true
                }
                _ => false,
            }
        };

        if installed {
            debug!(%topic, %transport_topic, "presence channel opened");
        } else {
            info!(%topic, "presence topic left before channel opened; closing");
            self.close_orphan(topic, channel).await;
        }
    }

    async fn close_orphan(&self, topic: &str, channel: Arc<dyn ChannelHandle>) {
        if let Err(e) = self.inner.transport.close_channel(channel).await {
            warn!(%topic, code = e.error_code(), error = %e, "presence channel close failed");
        }
    }

    // =========================================================================
    // EVENTS
    // =========================================================================

    async fn on_ready(&self, topic: &str, generation: u64) {
        let ready_tx = {
            let mut topics = self.lock();
            let Some(entry) = topics.entries.get_mut(topic).filter(|e| e.generation == generation) else {
                return;
            };
            entry.ready = true;
            entry.local.touch(now_ms());
            entry.ready_tx.clone()
        };
        // Readers may hold the watch value while waiting on the topic lock.
        ready_tx.send_replace(true);
        info!(%topic, "presence channel ready");
        self.publish(topic, generation).await;
    }

    /// Re-derive the snapshot from the channel's authoritative state.
    fn recompute(&self, topic: &str, generation: u64, channel: &dyn ChannelHandle) {
        let raw = channel.current_state();
        let presences = snapshot::flatten(&raw, self.inner.config.dedup);

        let mut topics = self.lock();
        let Some(entry) = topics.entries.get_mut(topic).filter(|e| e.generation == generation) else {
            return;
        };
        let snapshot = Snapshot::new(entry.snapshot.seq + 1, presences);
        debug!(%topic, seq = snapshot.seq, online = snapshot.len(), "presence snapshot recomputed");
        entry.snapshot = snapshot.clone();
        // No receivers is fine: nobody is listening yet.
        let _ = entry.snapshot_tx.send(snapshot);
    }

    /// Track the latest local state if the channel is ready.
    async fn publish(&self, topic: &str, generation: u64) {
        let gate = {
            let topics = self.lock();
            let Some(entry) = topics.entries.get(topic).filter(|e| e.generation == generation) else {
                return;
            };
            entry.publish_gate.clone()
        };
        let _guard = gate.lock().await;

        let (channel, state) = {
            let topics = self.lock();
            let Some(entry) = topics.entries.get(topic).filter(|e| e.generation == generation) else {
                return;
            };
            let Some(channel) = entry.channel.clone().filter(|_| entry.ready) else {
                return;
            };
            (channel, entry.local.clone())
        };

        if let Err(e) = channel.track(&state).await {
            warn!(%topic, code = e.error_code(), retryable = e.retryable(), error = %e, "presence track failed");
        }
    }

    // =========================================================================
    // UPDATE / READ
    // =========================================================================

    /// Merge `patch` into the local state for `topic` and re-publish.
    /// Silent no-op when the topic is not joined.
    pub async fn update_presence(&self, topic: &str, patch: PresencePatch) {
        let topic = topic.trim();
        let generation = {
            let mut topics = self.lock();
            let Some(entry) = topics.entries.get_mut(topic) else {
                debug!(%topic, "presence update dropped: topic not joined");
                return;
            };
            entry.local.merge(&patch);
            entry.local.touch(now_ms());
            entry.generation
        };
        self.publish(topic, generation).await;
    }

    /// Last computed snapshot for `topic`; empty if the topic is not open.
    /// Topic names are trimmed the same way `join` trims them.
    #[must_use]
    pub fn get_snapshot(&self, topic: &str) -> Snapshot {
        self.lock()
            .entries
            .get(topic.trim())
            .map(|e| e.snapshot.clone())
            .unwrap_or_default()
    }

    /// State this process publishes on `topic`, if joined.
    #[must_use]
    pub fn local_state(&self, topic: &str) -> Option<PresenceState> {
        self.lock().entries.get(topic.trim()).map(|e| e.local.clone())
    }

    #[must_use]
    pub fn has_topic(&self, topic: &str) -> bool {
        self.lock().entries.contains_key(topic.trim())
    }

    #[must_use]
    pub fn consumer_count(&self, topic: &str) -> usize {
        self.lock().entries.get(topic.trim()).map_or(0, |e| e.consumers.len())
    }

    /// Logical names of every open topic, sorted.
    #[must_use]
    pub fn topics(&self) -> Vec<String> {
        let mut names: Vec<String> = self.lock().entries.keys().cloned().collect();
        names.sort();
        names
    }

    // =========================================================================
    // LEAVE
    // =========================================================================

    /// Drop one consumer. Returns the transport work to run if it was the last.
    fn detach(&self, topic: &str, generation: u64, consumer: u64) -> Option<Release> {
        let mut topics = self.lock();
        let entry = topics.entries.get_mut(topic).filter(|e| e.generation == generation)?;
        if !entry.consumers.remove(&consumer) {
            return None;
        }
        info!(%topic, consumers = entry.consumers.len(), "presence consumer left");
        if !entry.consumers.is_empty() {
            return None;
        }
        let entry = topics.entries.remove(topic)?;
        Some(entry.release(self.inner.transport.clone(), topic.to_string()))
    }

    /// Leave every open topic. Joins that complete afterwards come back inert.
    pub async fn leave_all(&self) {
        let releases: Vec<Release> = {
            let mut topics = self.lock();
            topics.epoch += 1;
            topics
                .entries
                .drain()
                .map(|(topic, entry)| entry.release(self.inner.transport.clone(), topic))
                .collect()
        };
        info!(count = releases.len(), "leaving all presence topics");
        futures::future::join_all(releases.into_iter().map(Release::run)).await;
    }

    fn spawn_release(&self, release: Release) {
        match tokio::runtime::Handle::try_current()
            .ok()
            .or_else(|| self.inner.runtime.clone())
        {
            Some(runtime) => {
                runtime.spawn(release.run());
            }
            None => warn!(topic = %release.topic, "no runtime available; presence channel release skipped"),
        }
    }
}

async fn run_events(
    registry: Weak<RegistryInner>,
    topic: String,
    generation: u64,
    channel: Arc<dyn ChannelHandle>,
    mut events: mpsc::Receiver<ChannelEvent>,
) {
    while let Some(event) = events.recv().await {
        let Some(inner) = registry.upgrade() else {
            break;
        };
        let registry = PresenceRegistry { inner };
        match event {
            ChannelEvent::Status(status) if status.is_ready() => registry.on_ready(&topic, generation).await,
            ChannelEvent::Status(status) => warn!(%topic, ?status, "presence channel not ready"),
            other => {
                debug!(%topic, kind = other.kind(), "presence event");
                registry.recompute(&topic, generation, channel.as_ref());
            }
        }
    }
    debug!(%topic, "presence event stream ended");
}

// =============================================================================
// MEMBERSHIP
// =============================================================================

struct Slot {
    registry: PresenceRegistry,
    generation: u64,
    consumer: u64,
    snapshots: broadcast::Receiver<Snapshot>,
    ready: watch::Receiver<bool>,
}

/// One consumer's hold on a topic, returned by [`PresenceRegistry::join`].
///
/// `leave` is idempotent. Dropping an un-left membership leaves it.
pub struct Membership {
    topic: String,
    slot: Option<Slot>,
    left: AtomicBool,
}

impl Membership {
    fn inert(topic: &str) -> Self {
        Self { topic: topic.to_string(), slot: None, left: AtomicBool::new(true) }
    }

    #[must_use]
    pub fn topic(&self) -> &str {
        &self.topic
    }

    /// `true` when the join was a no-op (blank topic, unauthenticated, teardown).
    #[must_use]
    pub fn is_inert(&self) -> bool {
        self.slot.is_none()
    }

    #[must_use]
    pub fn is_left(&self) -> bool {
        self.left.load(Ordering::SeqCst)
    }

    /// Latest snapshot for the topic; empty once left.
    #[must_use]
    pub fn snapshot(&self) -> Snapshot {
        match &self.slot {
            Some(slot) if !self.is_left() => slot.registry.get_snapshot(&self.topic),
            _ => Snapshot::default(),
        }
    }

    /// Stream of snapshot updates. `None` for inert memberships.
    #[must_use]
    pub fn subscribe(&self) -> Option<broadcast::Receiver<Snapshot>> {
        self.slot.as_ref().map(|slot| slot.snapshots.resubscribe())
    }

    /// Whether the transport has confirmed the subscription.
    #[must_use]
    pub fn ready(&self) -> watch::Receiver<bool> {
        match &self.slot {
            Some(slot) => slot.ready.clone(),
            None => watch::channel(false).1,
        }
    }

    /// Leave the topic, releasing the channel if this was the last consumer.
    pub async fn leave(&self) {
        if self.left.swap(true, Ordering::SeqCst) {
            return;
        }
        let Some(slot) = &self.slot else {
            return;
        };
        if let Some(release) = slot.registry.detach(&self.topic, slot.generation, slot.consumer) {
            release.run().await;
        }
    }
}

impl Drop for Membership {
    fn drop(&mut self) {
        if self.left.swap(true, Ordering::SeqCst) {
            return;
        }
        let Some(slot) = &self.slot else {
            return;
        };
        if let Some(release) = slot.registry.detach(&self.topic, slot.generation, slot.consumer) {
            slot.registry.spawn_release(release);
        }
    }
}

#[cfg(test)]
#[path = "registry_test.rs"]
mod tests;
