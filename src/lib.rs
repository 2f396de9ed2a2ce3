//! Real-time presence for the CRM: who is looking at which record, right now.
//!
//! ARCHITECTURE
//! ============
//! - `transport` is the pub/sub collaborator contract (plus an in-process
//!   `LocalBroker`). `identity` resolves the acting user.
//! - `registry` multiplexes topics onto transport channels: one channel per
//!   topic per process, shared by every local consumer, released when the
//!   last one leaves.
//! - `binding` ties one UI scope to one topic membership, with the
//!   `entity_presence` / `global_presence` naming conventions on top.
//!
//! ```no_run
//! use std::sync::Arc;
//!
//! use crm_presence::binding::entity_presence;
//! use crm_presence::config::PresenceConfig;
//! use crm_presence::identity::{CurrentUser, StaticIdentity};
//! use crm_presence::registry::PresenceRegistry;
//! use crm_presence::transport::local::LocalBroker;
//!
//! # async fn demo(user: CurrentUser) {
//! let registry = PresenceRegistry::new(
//!     Arc::new(LocalBroker::new()),
//!     Arc::new(StaticIdentity::signed_in(user)),
//!     PresenceConfig::default(),
//! );
//! let mut viewers = entity_presence(&registry, "project", "42", true);
//! viewers.wait_for(|v| v.is_joined()).await;
//! println!("{} online", viewers.online_count());
//! # }
//! ```

pub mod binding;
pub mod config;
pub mod error;
pub mod identity;
pub mod registry;
pub mod snapshot;
pub mod state;
pub mod transport;

pub use binding::{BindingPhase, BindingView, PresenceBinding, entity_presence, global_presence};
pub use registry::{Membership, PresenceRegistry};
pub use state::{PresencePatch, PresenceState, Snapshot};
