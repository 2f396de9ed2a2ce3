//! Transport — the pub/sub collaborator presence is built on.
//!
//! DESIGN
//! ======
//! A `Transport` opens and closes per-topic channels. A `ChannelHandle`
//! tracks one local state blob and reports activity as an ordered stream of
//! `ChannelEvent`s: status changes plus `sync` / `join` / `leave`. The
//! registry treats events only as "something changed" signals and always
//! re-reads `current_state()`, so a dropped or reordered event cannot make
//! the snapshot diverge from the transport.

pub mod local;

use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::mpsc;

use crate::error::TransportError;
use crate::state::PresenceState;

/// Raw presence as the transport holds it: session key -> tracked payloads.
pub type RawPresence = HashMap<String, Vec<PresenceState>>;

/// Subscription status reported by a channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChannelStatus {
    Subscribed,
    ChannelError,
    TimedOut,
    Closed,
}

impl ChannelStatus {
    #[must_use]
    pub fn is_ready(self) -> bool {
        matches!(self, Self::Subscribed)
    }
}

/// One notification from a channel.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChannelEvent {
    Status(ChannelStatus),
    /// Full-state reconciliation (on connect and periodically).
    Sync,
    /// Sessions newly present under `key`.
    Join { key: String, presences: Vec<PresenceState> },
    /// Sessions gone from `key`.
    Leave { key: String, presences: Vec<PresenceState> },
}

impl ChannelEvent {
    /// Short name for log fields.
    #[must_use]
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Status(_) => "status",
            Self::Sync => "sync",
            Self::Join { .. } => "join",
            Self::Leave { .. } => "leave",
        }
    }
}

// =============================================================================
// TRAITS
// =============================================================================

/// One open synchronization topic.
#[async_trait::async_trait]
pub trait ChannelHandle: Send + Sync {
    /// Transport topic name this handle is bound to.
    fn topic(&self) -> &str;

    /// Session key this handle tracks its state under.
    fn key(&self) -> &str;

    /// Start receiving events. The first event is the subscription status.
    ///
    /// # Errors
    ///
    /// Returns a [`TransportError`] if the channel cannot be subscribed.
    async fn subscribe(&self) -> Result<mpsc::Receiver<ChannelEvent>, TransportError>;

    /// Publish (or replace) this session's state on the topic.
    ///
    /// # Errors
    ///
    /// Returns a [`TransportError`] if the channel is not subscribed or closed.
    async fn track(&self, state: &PresenceState) -> Result<(), TransportError>;

    /// Withdraw this session's state from the topic.
    ///
    /// # Errors
    ///
    /// Returns a [`TransportError`] if the transport rejects the request.
    async fn untrack(&self) -> Result<(), TransportError>;

    /// Authoritative current presence on the topic.
    fn current_state(&self) -> RawPresence;
}

/// Opens and releases channels. Enables swapping in fakes for tests.
#[async_trait::async_trait]
pub trait Transport: Send + Sync {
    /// Open a channel for `topic`. The channel is not subscribed yet.
    ///
    /// # Errors
    ///
    /// Returns a [`TransportError`] if the transport is unreachable.
    async fn open_channel(&self, topic: &str) -> Result<Arc<dyn ChannelHandle>, TransportError>;

    /// Release a channel. Its event stream ends.
    ///
    /// # Errors
    ///
    /// Returns a [`TransportError`] if the transport rejects the request.
    async fn close_channel(&self, channel: Arc<dyn ChannelHandle>) -> Result<(), TransportError>;
}
