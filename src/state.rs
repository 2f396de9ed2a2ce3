//! Presence data model.
//!
//! DESIGN
//! ======
//! `PresenceState` is what one session publishes about itself on a topic.
//! `PresencePatch` carries the optional fields a caller may merge into it.
//! `Snapshot` is the flattened, immutable view of one topic handed to every
//! local consumer; cloning it is an `Arc` bump, so one consumer can never
//! mutate another's view.

use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::identity::CurrentUser;

/// Current time as milliseconds since Unix epoch.
#[must_use]
pub fn now_ms() -> i64 {
    let Ok(dur) = SystemTime::now().duration_since(UNIX_EPOCH) else {
        return 0;
    };
    i64::try_from(dur.as_millis()).unwrap_or(0)
}

// =============================================================================
// PRESENCE STATE
// =============================================================================

/// The value one session publishes about itself on a topic.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PresenceState {
    pub user_id: Uuid,
    pub user_name: String,
    pub user_email: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user_avatar_url: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user_role: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub current_page: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub current_entity_type: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub current_entity_id: Option<String>,
    /// Milliseconds since Unix epoch. Never decreases for one session.
    pub last_active: i64,
}

impl PresenceState {
    /// Compose the local state from the resolved identity and the caller's
    /// initial fields. Identity fields always come from `user`.
    #[must_use]
    pub fn compose(user: &CurrentUser, initial: &PresencePatch, now: i64) -> Self {
        let mut state = Self {
            user_id: user.id,
            user_name: user.display_name().to_string(),
            user_email: user.email.clone(),
            user_avatar_url: user.avatar_url.clone(),
            user_role: user.role.clone(),
            current_page: None,
            current_entity_type: None,
            current_entity_id: None,
            last_active: now,
        };
        state.merge(initial);
        state
    }

    /// Merge the set fields of `patch` into this state.
    pub fn merge(&mut self, patch: &PresencePatch) {
        if let Some(page) = &patch.current_page {
            self.current_page = Some(page.clone());
        }
        if let Some(kind) = &patch.current_entity_type {
            self.current_entity_type = Some(kind.clone());
        }
        if let Some(id) = &patch.current_entity_id {
            self.current_entity_id = Some(id.clone());
        }
        if let Some(role) = &patch.user_role {
            self.user_role = Some(role.clone());
        }
        if let Some(url) = &patch.user_avatar_url {
            self.user_avatar_url = Some(url.clone());
        }
    }

    /// Refresh `last_active`, keeping it monotonic.
    pub fn touch(&mut self, now: i64) {
        self.last_active = self.last_active.max(now);
    }
}

// =============================================================================
// PRESENCE PATCH
// =============================================================================

/// Partial presence fields. `None` means "leave unchanged".
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PresencePatch {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub current_page: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub current_entity_type: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub current_entity_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user_role: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user_avatar_url: Option<String>,
}

impl PresencePatch {
    #[must_use]
    pub fn page(page: impl Into<String>) -> Self {
        Self { current_page: Some(page.into()), ..Self::default() }
    }

    #[must_use]
    pub fn entity(entity_type: impl Into<String>, entity_id: impl Into<String>) -> Self {
        Self {
            current_entity_type: Some(entity_type.into()),
            current_entity_id: Some(entity_id.into()),
            ..Self::default()
        }
    }
}

// =============================================================================
// SNAPSHOT
// =============================================================================

/// Immutable, flattened view of one topic.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Snapshot {
    /// Recompute counter for the topic; 0 means "never synced".
    pub seq: u64,
    presences: Arc<Vec<PresenceState>>,
}

impl Snapshot {
    #[must_use]
    pub fn new(seq: u64, presences: Vec<PresenceState>) -> Self {
        Self { seq, presences: Arc::new(presences) }
    }

    #[must_use]
    pub fn presences(&self) -> &[PresenceState] {
        &self.presences
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.presences.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.presences.is_empty()
    }

    #[must_use]
    pub fn contains_user(&self, user_id: Uuid) -> bool {
        self.presences.iter().any(|p| p.user_id == user_id)
    }

    #[must_use]
    pub fn find_user(&self, user_id: Uuid) -> Option<&PresenceState> {
        self.presences.iter().find(|p| p.user_id == user_id)
    }

    #[must_use]
    pub fn to_vec(&self) -> Vec<PresenceState> {
        self.presences.as_ref().clone()
    }
}

// =============================================================================
// TEST HELPERS
// =============================================================================


#[cfg(test)]
#[path = "state_test.rs"]
mod tests;
