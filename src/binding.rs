//! Presence binding — one UI scope's hold on one topic.
//!
//! DESIGN
//! ======
//! `PresenceBinding::mount` is the acquisition and `Drop` (or `unmount`) is
//! the release; both live on the same value, so nothing can separate a join
//! from its leave. Mounting spawns a driver task that joins through the
//! registry, mirrors snapshots into a `watch` cell the UI reads, and always
//! leaves its membership on the way out.
//!
//! LIFECYCLE
//! =========
//! `Idle -> Joining -> Joined -> Leaving -> Idle`
//!
//! 1. Disabled or blank topic: stay `Idle`, never touch the registry.
//! 2. Mount: `Joining` with an empty snapshot until the transport confirms.
//! 3. Ready: `Joined`; `update_presence` is forwarded only in this phase.
//! 4. Unmount: `Leaving`, membership left exactly once, back to `Idle`.
//!
//! A join still in flight when the binding goes away is abandoned; the
//! registry releases whatever it had registered. No snapshot is applied
//! after cancellation. When the registry tears the topic down underneath
//! the binding (`leave_all` on sign-out), the binding returns to `Idle`
//! with an empty snapshot.

use tokio::sync::{broadcast, watch};
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use crate::registry::{Membership, PresenceRegistry};
use crate::state::{PresencePatch, PresenceState, Snapshot};

/// Topic used by [`global_presence`].
pub const GLOBAL_TOPIC: &str = "global";

// =============================================================================
// VIEW
// =============================================================================

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum BindingPhase {
    #[default]
    Idle,
    Joining,
    Joined,
    Leaving,
}

/// What a UI consumer renders from.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BindingView {
    pub phase: BindingPhase,
    pub snapshot: Snapshot,
}

impl BindingView {
    #[must_use]
    pub fn is_joined(&self) -> bool {
        self.phase == BindingPhase::Joined
    }

    #[must_use]
    pub fn online_count(&self) -> usize {
        self.snapshot.len()
    }

    #[must_use]
    pub fn presences(&self) -> &[PresenceState] {
        self.snapshot.presences()
    }
}

// =============================================================================
// BINDING
// =============================================================================

struct Scope {
    cancel: watch::Sender<bool>,
    driver: JoinHandle<()>,
}

impl Scope {
    async fn stop(self) {
        // The driver may already have exited; a closed channel is fine.
        let _ = self.cancel.send(true);
        if let Err(e) = self.driver.await {
            warn!(error = %e, "presence binding driver failed");
        }
    }
}

/// Per-scope presence binding. See the module docs for the lifecycle.
pub struct PresenceBinding {
    registry: PresenceRegistry,
    topic: Option<String>,
    view: watch::Receiver<BindingView>,
    scope: Option<Scope>,
}

impl PresenceBinding {
    /// Bind to `topic`. Nothing is joined when `enabled` is false or the
    /// topic is missing or blank.
    ///
    /// # Panics
    ///
    /// Panics if called outside a Tokio runtime while enabled.
    #[must_use]
    pub fn mount(registry: &PresenceRegistry, topic: Option<&str>, initial: PresencePatch, enabled: bool) -> Self {
        let topic = topic.map(str::trim).filter(|t| !t.is_empty()).map(str::to_owned);
        let (view_tx, view) = watch::channel(BindingView::default());

        let scope = match (&topic, enabled) {
            (Some(name), true) => {
                view_tx.send_replace(BindingView { phase: BindingPhase::Joining, snapshot: Snapshot::default() });
                let (cancel, cancel_rx) = watch::channel(false);
                let driver = tokio::spawn(drive(registry.clone(), name.clone(), initial, view_tx, cancel_rx));
                Some(Scope { cancel, driver })
            }
            _ => {
                debug!(topic = ?topic, enabled, "presence binding idle");
                None
            }
        };

        Self { registry: registry.clone(), topic, view, scope }
    }

    #[must_use]
    pub fn topic(&self) -> Option<&str> {
        self.topic.as_deref()
    }

    #[must_use]
    pub fn view(&self) -> BindingView {
        self.view.borrow().clone()
    }

    #[must_use]
    pub fn phase(&self) -> BindingPhase {
        self.view.borrow().phase
    }

    #[must_use]
    pub fn is_joined(&self) -> bool {
        self.view.borrow().is_joined()
    }

    #[must_use]
    pub fn snapshot(&self) -> Snapshot {
        self.view.borrow().snapshot.clone()
    }

    #[must_use]
    pub fn presences(&self) -> Vec<PresenceState> {
        self.view.borrow().snapshot.to_vec()
    }

    #[must_use]
    pub fn online_count(&self) -> usize {
        self.view.borrow().online_count()
    }

    /// A receiver a UI can hold on to and await changes from.
    #[must_use]
    pub fn watch(&self) -> watch::Receiver<BindingView> {
        self.view.clone()
    }

    /// Wait until the view satisfies `pred`. `None` once the binding's
    /// driver has finished and the view can no longer change.
    pub async fn wait_for(&mut self, mut pred: impl FnMut(&BindingView) -> bool) -> Option<BindingView> {
        self.view.wait_for(|v| pred(v)).await.ok().map(|v| v.clone())
    }

    /// Merge `patch` into the local presence. Dropped unless `Joined`.
    pub async fn update_presence(&self, patch: PresencePatch) {
        let Some(topic) = self.topic.as_deref().filter(|_| self.is_joined()) else {
            debug!(topic = ?self.topic, "presence update dropped: binding not joined");
            return;
        };
        self.registry.update_presence(topic, patch).await;
    }

    /// End the scope and wait until its membership has been left.
    pub async fn unmount(&mut self) {
        if let Some(scope) = self.scope.take() {
            scope.stop().await;
        }
    }

    /// Leave the current topic, then bind to a new one.
    pub async fn rebind(&mut self, topic: Option<&str>, initial: PresencePatch, enabled: bool) {
        self.unmount().await;
        *self = Self::mount(&self.registry, topic, initial, enabled);
    }
}

impl Drop for PresenceBinding {
    fn drop(&mut self) {
        if let Some(scope) = self.scope.take() {
            // The driver notices the closed channel and leaves.
            let _ = scope.cancel.send(true);
        }
    }
}

// =============================================================================
// DRIVER
// =============================================================================

fn cancelled(cancel: &watch::Receiver<bool>) -> bool {
    *cancel.borrow() || cancel.has_changed().is_err()
}

async fn drive(
    registry: PresenceRegistry,
    topic: String,
    initial: PresencePatch,
    view: watch::Sender<BindingView>,
    mut cancel: watch::Receiver<bool>,
) {
    // Dropping an unfinished join releases whatever it had registered.
    let membership = tokio::select! {
        biased;
        _ = cancel.changed() => {
            debug!(%topic, "presence binding unmounted during join");
            view.send_replace(BindingView::default());
            return;
        }
        membership = registry.join(&topic, initial) => membership,
    };
    if cancelled(&cancel) {
        debug!(%topic, "presence binding unmounted during join");
        finish(&membership, &view).await;
        return;
    }

    let mut ready = membership.ready();
    let live = !membership.is_inert();
    let mut snapshots = membership.subscribe();
    let is_ready = *ready.borrow();
    apply(&view, &membership, phase_for(is_ready), membership.snapshot());

    loop {
        tokio::select! {
            biased;
            _ = cancel.changed() => break,
            changed = ready.changed(), if live => {
                if changed.is_err() {
                    debug!(%topic, "presence topic torn down under binding");
                    break;
                }
                let is_ready = *ready.borrow_and_update();
                if is_ready && !cancelled(&cancel) {
                    view.send_modify(|v| v.phase = BindingPhase::Joined);
                }
            }
            update = recv_snapshot(&mut snapshots), if snapshots.is_some() => {
                if cancelled(&cancel) {
                    break;
                }
                match update {
                    Ok(snapshot) => apply_newer(&view, snapshot),
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        warn!(%topic, skipped, "presence binding lagged; resyncing");
                        apply_newer(&view, membership.snapshot());
                    }
                    Err(broadcast::error::RecvError::Closed) => {
                        debug!(%topic, "presence topic torn down under binding");
                        break;
                    }
                }
            }
        }
    }

    finish(&membership, &view).await;
}

async fn recv_snapshot(rx: &mut Option<broadcast::Receiver<Snapshot>>) -> Result<Snapshot, broadcast::error::RecvError> {
    match rx {
        Some(rx) => rx.recv().await,
        None => std::future::pending().await,
    }
}

fn phase_for(ready: bool) -> BindingPhase {
    if ready { BindingPhase::Joined } else { BindingPhase::Joining }
}

fn apply(view: &watch::Sender<BindingView>, membership: &Membership, phase: BindingPhase, snapshot: Snapshot) {
    let phase = if membership.is_inert() { BindingPhase::Joining } else { phase };
    view.send_replace(BindingView { phase, snapshot });
}

/// Apply `snapshot` unless the view already holds a newer one.
fn apply_newer(view: &watch::Sender<BindingView>, snapshot: Snapshot) {
    view.send_if_modified(|v| {
        if snapshot.seq <= v.snapshot.seq && snapshot.seq != 0 {
            return false;
        }
        v.snapshot = snapshot;
        true
    });
}

async fn finish(membership: &Membership, view: &watch::Sender<BindingView>) {
    view.send_modify(|v| v.phase = BindingPhase::Leaving);
    membership.leave().await;
    view.send_replace(BindingView::default());
}

// =============================================================================
// NAMED CONVENTIONS
// =============================================================================

/// Topic name for one CRM record, e.g. `project:42`.
#[must_use]
pub fn entity_topic(entity_type: &str, entity_id: &str) -> Option<String> {
    let (entity_type, entity_id) = (entity_type.trim(), entity_id.trim());
    if entity_type.is_empty() || entity_id.is_empty() {
        return None;
    }
    Some(format!("{entity_type}:{entity_id}"))
}

/// Bind to the viewers of one record. A blank id (still loading) binds nothing.
#[must_use]
pub fn entity_presence(
    registry: &PresenceRegistry,
    entity_type: &str,
    entity_id: &str,
    enabled: bool,
) -> PresenceBinding {
    let topic = entity_topic(entity_type, entity_id);
    PresenceBinding::mount(registry, topic.as_deref(), PresencePatch::entity(entity_type, entity_id), enabled)
}

/// Bind to application-wide presence.
#[must_use]
pub fn global_presence(registry: &PresenceRegistry, enabled: bool) -> PresenceBinding {
    PresenceBinding::mount(registry, Some(GLOBAL_TOPIC), PresencePatch::default(), enabled)
}

#[cfg(test)]
#[path = "binding_test.rs"]
mod tests;
