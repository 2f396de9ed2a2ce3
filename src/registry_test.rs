use super::*;
use crate::config::DedupPolicy;
use crate::error::TransportError;
use crate::identity::{CurrentUser, StaticIdentity};
use crate::state::test_helpers::{self, eventually};
use crate::transport::local::LocalBroker;
use crate::transport::{ChannelStatus, RawPresence};
use std::sync::atomic::AtomicUsize;
use std::time::Duration;
use tokio::sync::Notify;

const TOPIC: &str = "project:42";
const WIRE_TOPIC: &str = "presence:project:42";

// =========================================================================
// Gated fakes
// =========================================================================

/// Identity provider that blocks until released.
struct GatedIdentity {
    user: CurrentUser,
    entered: Arc<Notify>,
    gate: Arc<Notify>,
}

#[async_trait::async_trait]
impl IdentityProvider for GatedIdentity {
    async fn current_user(&self) -> Option<CurrentUser> {
        self.entered.notify_one();
        self.gate.notified().await;
        Some(self.user.clone())
    }
}

/// Transport whose `open_channel` blocks until released.
struct GatedTransport {
    broker: LocalBroker,
    gate: Arc<Notify>,
}

#[async_trait::async_trait]
impl Transport for GatedTransport {
    async fn open_channel(&self, topic: &str) -> Result<Arc<dyn ChannelHandle>, TransportError> {
        self.gate.notified().await;
        self.broker.open_channel(topic).await
    }

    async fn close_channel(&self, channel: Arc<dyn ChannelHandle>) -> Result<(), TransportError> {
        self.broker.close_channel(channel).await
    }
}

/// Channel whose `subscribe` never completes.
struct StalledChannel {
    topic: String,
}

#[async_trait::async_trait]
impl ChannelHandle for StalledChannel {
    fn topic(&self) -> &str {
        &self.topic
    }

    fn key(&self) -> &str {
        "stalled"
    }

    async fn subscribe(&self) -> Result<mpsc::Receiver<ChannelEvent>, TransportError> {
        std::future::pending().await
    }

    async fn track(&self, _state: &PresenceState) -> Result<(), TransportError> {
        Ok(())
    }

    async fn untrack(&self) -> Result<(), TransportError> {
        Ok(())
    }

    fn current_state(&self) -> RawPresence {
        RawPresence::new()
    }
}

/// Transport handing out channels that never finish subscribing.
#[derive(Default)]
struct StalledSubscribeTransport {
    opened: AtomicUsize,
    closed: AtomicUsize,
}

#[async_trait::async_trait]
impl Transport for StalledSubscribeTransport {
    async fn open_channel(&self, topic: &str) -> Result<Arc<dyn ChannelHandle>, TransportError> {
        self.opened.fetch_add(1, Ordering::SeqCst);
        Ok(Arc::new(StalledChannel { topic: topic.to_string() }))
    }

    async fn close_channel(&self, _channel: Arc<dyn ChannelHandle>) -> Result<(), TransportError> {
        self.closed.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

async fn wait_online(registry: &PresenceRegistry, topic: &str, count: usize) -> Snapshot {
    eventually(|| registry.get_snapshot(topic).len() == count).await;
    registry.get_snapshot(topic)
}

// =========================================================================
// join
// =========================================================================

#[tokio::test]
async fn join_tracks_local_state_and_syncs_snapshot() {
    let broker = LocalBroker::new();
    let ada = test_helpers::user("Ada");
    let registry = test_helpers::registry_for(&broker, &ada);

    let membership = registry.join(TOPIC, PresencePatch::page("overview")).await;

    let snap = wait_online(&registry, TOPIC, 1).await;
    assert_eq!(snap.presences()[0].user_id, ada.id);
    assert_eq!(snap.presences()[0].current_page.as_deref(), Some("overview"));
    assert!(*membership.ready().borrow());
    assert_eq!(broker.channels_opened(), 1);
    assert_eq!(broker.subscriber_count(WIRE_TOPIC), 1);
    assert!(!membership.is_inert());
}

#[tokio::test]
async fn blank_topic_is_inert() {
    let broker = LocalBroker::new();
    let registry = test_helpers::registry_for(&broker, &test_helpers::user("Ada"));

    let membership = registry.join("   ", PresencePatch::default()).await;

    assert!(membership.is_inert());
    assert!(membership.subscribe().is_none());
    assert_eq!(broker.channels_opened(), 0);
    assert!(registry.topics().is_empty());
}

#[tokio::test]
async fn unauthenticated_join_issues_no_transport_call() {
    let broker = LocalBroker::new();
    let registry = test_helpers::anonymous_registry(&broker);

    let membership = registry.join(TOPIC, PresencePatch::default()).await;

    assert!(membership.is_inert());
    assert!(membership.is_left());
    assert!(membership.snapshot().is_empty());
    assert!(!*membership.ready().borrow());
    assert_eq!(broker.channels_opened(), 0);
    assert_eq!(broker.track_calls(), 0);
    // Leaving an inert membership is a no-op.
    membership.leave().await;
    assert!(registry.get_snapshot(TOPIC).is_empty());
}

#[tokio::test]
async fn concurrent_joins_open_exactly_one_channel() {
    let broker = LocalBroker::new();
    let registry = test_helpers::registry_for(&broker, &test_helpers::user("Ada"));

    let (a, b) = tokio::join!(
        registry.join("case:7", PresencePatch::entity("case", "7")),
        registry.join("case:7", PresencePatch::entity("case", "7")),
    );

    assert_eq!(broker.channels_opened(), 1);
    assert_eq!(registry.consumer_count("case:7"), 2);
    wait_online(&registry, "case:7", 1).await;
    drop((a, b));
}

#[tokio::test]
async fn second_join_merges_fields_into_shared_state() {
    let broker = LocalBroker::new();
    let registry = test_helpers::registry_for(&broker, &test_helpers::user("Ada"));

    let _first = registry.join(TOPIC, PresencePatch::page("overview")).await;
    wait_online(&registry, TOPIC, 1).await;
    let _second = registry.join(TOPIC, PresencePatch::entity("project", "42")).await;

    let local = registry.local_state(TOPIC).unwrap();
    assert_eq!(local.current_page.as_deref(), Some("overview"));
    assert_eq!(local.current_entity_id.as_deref(), Some("42"));
    eventually(|| {
        registry
            .get_snapshot(TOPIC)
            .presences()
            .first()
            .is_some_and(|p| p.current_entity_id.as_deref() == Some("42"))
    })
    .await;
    assert_eq!(broker.channels_opened(), 1);
}

#[tokio::test]
async fn topic_prefix_comes_from_config() {
    let broker = LocalBroker::new();
    let config = PresenceConfig { topic_prefix: "crm:".into(), ..PresenceConfig::default() };
    let registry = PresenceRegistry::new(
        Arc::new(broker.clone()),
        Arc::new(StaticIdentity::signed_in(test_helpers::user("Ada"))),
        config,
    );

    let _m = registry.join("global", PresencePatch::default()).await;

    eventually(|| broker.member_count("crm:global") == 1).await;
    assert_eq!(registry.topics(), vec!["global".to_string()]);
}

// =========================================================================
// dedup
// =========================================================================

#[tokio::test]
async fn two_tabs_of_one_user_show_once() {
    let broker = LocalBroker::new();
    let ada = test_helpers::user("Ada");
    let tab_a = test_helpers::registry_for(&broker, &ada);
    let tab_b = test_helpers::registry_for(&broker, &ada);

    let _a = tab_a.join(TOPIC, PresencePatch::default()).await;
    let _b = tab_b.join(TOPIC, PresencePatch::default()).await;

    eventually(|| broker.member_count(WIRE_TOPIC) == 2).await;
    let seq = tab_a.get_snapshot(TOPIC).seq;
    broker.sync(WIRE_TOPIC);
    eventually(|| tab_a.get_snapshot(TOPIC).seq > seq).await;

    let snap = tab_a.get_snapshot(TOPIC);
    assert_eq!(snap.len(), 1);
    assert_eq!(snap.presences()[0].user_id, ada.id);
}

#[tokio::test]
async fn session_dedup_policy_shows_every_tab() {
    let broker = LocalBroker::new();
    let ada = test_helpers::user("Ada");
    let config = PresenceConfig { dedup: DedupPolicy::BySession, ..PresenceConfig::default() };
    let tab_a = PresenceRegistry::new(
        Arc::new(broker.clone()),
        Arc::new(StaticIdentity::signed_in(ada.clone())),
        config,
    );
    let tab_b = test_helpers::registry_for(&broker, &ada);

    let _a = tab_a.join(TOPIC, PresencePatch::default()).await;
    let _b = tab_b.join(TOPIC, PresencePatch::default()).await;

    wait_online(&tab_a, TOPIC, 2).await;
}

#[tokio::test]
async fn cancelled_join_closes_channel_it_opened() {
    let transport = Arc::new(StalledSubscribeTransport::default());
    let registry = PresenceRegistry::new(
        transport.clone(),
        Arc::new(StaticIdentity::signed_in(test_helpers::user("Ada"))),
        PresenceConfig::default(),
    );

    let joined = tokio::time::timeout(Duration::from_millis(50), registry.join(TOPIC, PresencePatch::default())).await;

    assert!(joined.is_err());
    assert_eq!(transport.opened.load(Ordering::SeqCst), 1);
    assert!(!registry.has_topic(TOPIC));
    eventually(|| transport.closed.load(Ordering::SeqCst) == 1).await;
}

#[tokio::test]
async fn padded_topic_names_address_the_joined_topic() {
    let broker = LocalBroker::new();
    let registry = test_helpers::registry_for(&broker, &test_helpers::user("Ada"));
    let _m = registry.join(" project:1 ", PresencePatch::page("overview")).await;
    wait_online(&registry, "project:1", 1).await;

    registry.update_presence("  project:1", PresencePatch::page("tasks")).await;

    assert_eq!(registry.local_state("project:1 ").unwrap().current_page.as_deref(), Some("tasks"));
    assert!(registry.has_topic(" project:1"));
    assert_eq!(registry.consumer_count(" project:1 "), 1);
    eventually(|| {
        registry
            .get_snapshot(" project:1 ")
            .presences()
            .first()
            .is_some_and(|p| p.current_page.as_deref() == Some("tasks"))
    })
    .await;
    assert_eq!(registry.topics(), vec!["project:1".to_string()]);
}

// =========================================================================
// update_presence
// =========================================================================

#[tokio::test]
async fn update_presence_republishes_merged_state() {
    let broker = LocalBroker::new();
    let registry = test_helpers::registry_for(&broker, &test_helpers::user("Ada"));
    let _m = registry.join(TOPIC, PresencePatch::page("overview")).await;
    let before = wait_online(&registry, TOPIC, 1).await.presences()[0].clone();

    registry.update_presence(TOPIC, PresencePatch::page("tasks")).await;

    eventually(|| registry.get_snapshot(TOPIC).presences()[0].current_page.as_deref() == Some("tasks")).await;
    let after = registry.get_snapshot(TOPIC).presences()[0].clone();
    assert!(after.last_active >= before.last_active);
    assert_eq!(broker.member_count(WIRE_TOPIC), 1);
}

#[tokio::test]
async fn update_presence_on_unjoined_topic_is_noop() {
    let broker = LocalBroker::new();
    let registry = test_helpers::registry_for(&broker, &test_helpers::user("Ada"));

    registry.update_presence(TOPIC, PresencePatch::page("tasks")).await;

    assert!(!registry.has_topic(TOPIC));
    assert_eq!(broker.track_calls(), 0);
}

#[tokio::test]
async fn update_before_ready_is_held_not_published() {
    let broker = LocalBroker::new();
    broker.set_subscribe_status(ChannelStatus::TimedOut);
    let registry = test_helpers::registry_for(&broker, &test_helpers::user("Ada"));
    let membership = registry.join(TOPIC, PresencePatch::default()).await;

    registry.update_presence(TOPIC, PresencePatch::page("tasks")).await;

    assert_eq!(registry.local_state(TOPIC).unwrap().current_page.as_deref(), Some("tasks"));
    assert_eq!(broker.track_calls(), 0);
    assert!(!*membership.ready().borrow());
    assert!(membership.snapshot().is_empty());
}

// =========================================================================
// leave
// =========================================================================

#[tokio::test]
async fn last_leave_closes_channel_and_clears_entry() {
    let broker = LocalBroker::new();
    let registry = test_helpers::registry_for(&broker, &test_helpers::user("Ada"));
    let membership = registry.join(TOPIC, PresencePatch::default()).await;
    wait_online(&registry, TOPIC, 1).await;

    membership.leave().await;

    assert!(!registry.has_topic(TOPIC));
    assert!(registry.get_snapshot(TOPIC).is_empty());
    assert_eq!(broker.channels_closed(), 1);
    assert_eq!(broker.topic_count(), 0);
}

#[tokio::test]
async fn leave_is_idempotent() {
    let broker = LocalBroker::new();
    let registry = test_helpers::registry_for(&broker, &test_helpers::user("Ada"));
    let first = registry.join(TOPIC, PresencePatch::default()).await;
    let second = registry.join(TOPIC, PresencePatch::default()).await;

    first.leave().await;
    first.leave().await;

    assert_eq!(registry.consumer_count(TOPIC), 1);
    assert_eq!(broker.channels_closed(), 0);

    second.leave().await;
    second.leave().await;
    assert!(!registry.has_topic(TOPIC));
    assert_eq!(broker.channels_closed(), 1);
}

#[tokio::test]
async fn dropping_membership_releases_channel() {
    let broker = LocalBroker::new();
    let registry = test_helpers::registry_for(&broker, &test_helpers::user("Ada"));
    let membership = registry.join(TOPIC, PresencePatch::default()).await;

    drop(membership);

    assert!(!registry.has_topic(TOPIC));
    eventually(|| broker.channels_closed() == 1).await;
}

#[tokio::test]
async fn failed_open_degrades_to_empty_and_still_cleans_up() {
    let broker = LocalBroker::new();
    broker.set_available(false);
    let registry = test_helpers::registry_for(&broker, &test_helpers::user("Ada"));

    let membership = registry.join(TOPIC, PresencePatch::default()).await;

    assert!(registry.has_topic(TOPIC));
    assert!(membership.snapshot().is_empty());
    membership.leave().await;
    assert!(!registry.has_topic(TOPIC));
    assert_eq!(broker.channels_closed(), 0);
}

// =========================================================================
// leave_all
// =========================================================================

#[tokio::test]
async fn leave_all_closes_every_topic() {
    let broker = LocalBroker::new();
    let registry = test_helpers::registry_for(&broker, &test_helpers::user("Ada"));
    let project = registry.join(TOPIC, PresencePatch::default()).await;
    let _global = registry.join("global", PresencePatch::default()).await;

    registry.leave_all().await;

    assert!(registry.topics().is_empty());
    assert_eq!(broker.channels_closed(), 2);
    assert_eq!(broker.topic_count(), 0);
    // A stale leave after teardown touches nothing.
    project.leave().await;
    assert_eq!(broker.channels_closed(), 2);
}

#[tokio::test]
async fn stale_membership_does_not_release_reopened_topic() {
    let broker = LocalBroker::new();
    let registry = test_helpers::registry_for(&broker, &test_helpers::user("Ada"));
    let old = registry.join(TOPIC, PresencePatch::default()).await;
    registry.leave_all().await;

    let fresh = registry.join(TOPIC, PresencePatch::default()).await;
    old.leave().await;

    assert!(registry.has_topic(TOPIC));
    assert_eq!(registry.consumer_count(TOPIC), 1);
    fresh.leave().await;
    assert!(!registry.has_topic(TOPIC));
}

#[tokio::test]
async fn join_straddling_leave_all_comes_back_inert() {
    let broker = LocalBroker::new();
    let entered = Arc::new(Notify::new());
    let gate = Arc::new(Notify::new());
    let registry = PresenceRegistry::new(
        Arc::new(broker.clone()),
        Arc::new(GatedIdentity { user: test_helpers::user("Ada"), entered: entered.clone(), gate: gate.clone() }),
        PresenceConfig::default(),
    );

    let pending = tokio::spawn({
        let registry = registry.clone();
        async move { registry.join(TOPIC, PresencePatch::default()).await }
    });
    entered.notified().await;
    registry.leave_all().await;
    gate.notify_one();

    let membership = pending.await.unwrap();
    assert!(membership.is_inert());
    assert!(!registry.has_topic(TOPIC));
    assert_eq!(broker.channels_opened(), 0);
}

#[tokio::test]
async fn channel_opened_after_leave_is_closed_immediately() {
    let broker = LocalBroker::new();
    let gate = Arc::new(Notify::new());
    let registry = PresenceRegistry::new(
        Arc::new(GatedTransport { broker: broker.clone(), gate: gate.clone() }),
        Arc::new(StaticIdentity::signed_in(test_helpers::user("Ada"))),
        PresenceConfig::default(),
    );

    let pending = tokio::spawn({
        let registry = registry.clone();
        async move { registry.join(TOPIC, PresencePatch::default()).await }
    });
    eventually(|| registry.has_topic(TOPIC)).await;
    registry.leave_all().await;
    gate.notify_one();

    let _membership = pending.await.unwrap();
    assert!(!registry.has_topic(TOPIC));
    assert_eq!(broker.channels_opened(), 1);
    assert_eq!(broker.channels_closed(), 1);
    assert_eq!(broker.topic_count(), 0);
}

// =========================================================================
// broadcast consistency
// =========================================================================

#[tokio::test]
async fn consumers_of_one_topic_see_the_same_sequence() {
    let broker = LocalBroker::new();
    let ada = test_helpers::user("Ada");
    let bob = test_helpers::user("Bob");
    let registry = test_helpers::registry_for(&broker, &ada);
    let other = test_helpers::registry_for(&broker, &bob);

    let first = registry.join(TOPIC, PresencePatch::default()).await;
    let second = registry.join(TOPIC, PresencePatch::default()).await;
    let mut rx_first = first.subscribe().unwrap();
    let mut rx_second = second.subscribe().unwrap();

    let bob_membership = other.join(TOPIC, PresencePatch::default()).await;
    wait_online(&registry, TOPIC, 2).await;
    bob_membership.leave().await;
    wait_online(&registry, TOPIC, 1).await;

    let mut seen_first = Vec::new();
    while let Ok(snap) = rx_first.try_recv() {
        seen_first.push(snap);
    }
    let mut seen_second = Vec::new();
    while let Ok(snap) = rx_second.try_recv() {
        seen_second.push(snap);
    }
    assert!(!seen_first.is_empty());
    assert_eq!(seen_first, seen_second);
    assert!(seen_first.windows(2).all(|w| w[0].seq < w[1].seq));
}
