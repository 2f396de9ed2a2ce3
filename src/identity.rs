//! Identity resolution for the acting user.
//!
//! The presence core never authenticates anyone. It asks an
//! [`IdentityProvider`] once per join and treats `None` as "nobody signed in".

use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// The signed-in user as reported by the authentication layer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CurrentUser {
    pub id: Uuid,
    pub email: String,
    pub name: Option<String>,
    pub avatar_url: Option<String>,
    pub role: Option<String>,
}

impl CurrentUser {
    /// Display name, falling back to the email address.
    #[must_use]
    pub fn display_name(&self) -> &str {
        match self.name.as_deref() {
            Some(name) if !name.trim().is_empty() => name,
            _ => &self.email,
        }
    }
}

/// Resolves the acting user. Enables swapping in fakes for tests.
#[async_trait::async_trait]
pub trait IdentityProvider: Send + Sync {
    /// Current user, or `None` when unauthenticated.
    async fn current_user(&self) -> Option<CurrentUser>;
}

/// Provider with a fixed answer, set at construction or swapped on sign-in/out.
#[derive(Debug, Default)]
pub struct StaticIdentity {
    user: std::sync::RwLock<Option<CurrentUser>>,
}

impl StaticIdentity {
    #[must_use]
    pub fn signed_in(user: CurrentUser) -> Self {
        Self { user: std::sync::RwLock::new(Some(user)) }
    }

    #[must_use]
    pub fn anonymous() -> Self {
        Self::default()
    }

    /// Replace the current user (`None` signs out).
    pub fn set(&self, user: Option<CurrentUser>) {
        *self
            .user
            .write()
            .unwrap_or_else(std::sync::PoisonError::into_inner) = user;
    }
}

#[async_trait::async_trait]
impl IdentityProvider for StaticIdentity {
    async fn current_user(&self) -> Option<CurrentUser> {
        self.user
            .read()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .clone()
    }
}

#[cfg(test)]
#[path = "identity_test.rs"]
mod tests;
