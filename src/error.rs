//! Error types for the presence core.
//!
//! ERROR HANDLING
//! ==============
//! Transport failures never cross the registry boundary as errors. They are
//! logged with a grepable code and the affected topic degrades to its last
//! known (or empty) snapshot. Config errors are the only ones surfaced to the
//! embedding application, and only at startup.

// =============================================================================
// ERROR CODES
// =============================================================================

/// Grepable error code and retryable flag for structured log fields.
pub trait ErrorCode: std::fmt::Display {
    fn error_code(&self) -> &'static str;

    fn retryable(&self) -> bool {
        false
    }
}

// =============================================================================
// TRANSPORT
// =============================================================================

/// Errors reported by a [`crate::transport::Transport`] implementation.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum TransportError {
    /// The channel was closed before the operation could run.
    #[error("channel closed: {topic}")]
    ChannelClosed { topic: String },

    /// The channel has not been subscribed yet.
    #[error("channel not subscribed: {topic}")]
    NotSubscribed { topic: String },

    /// The transport refused the request (auth expiry, policy, etc).
    #[error("transport rejected request: {0}")]
    Rejected(String),

    /// The transport could not be reached.
    #[error("transport unavailable: {0}")]
    Unavailable(String),
}

impl ErrorCode for TransportError {
    fn error_code(&self) -> &'static str {
        match self {
            Self::ChannelClosed { .. } => "E_CHANNEL_CLOSED",
            Self::NotSubscribed { .. } => "E_NOT_SUBSCRIBED",
            Self::Rejected(_) => "E_TRANSPORT_REJECTED",
            Self::Unavailable(_) => "E_TRANSPORT_UNAVAILABLE",
        }
    }

    fn retryable(&self) -> bool {
        matches!(self, Self::Unavailable(_))
    }
}

// =============================================================================
// CONFIG
// =============================================================================

/// Errors produced while reading [`crate::config::PresenceConfig`].
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ConfigError {
    /// A configuration value could not be parsed.
    #[error("config parse failed: {0}")]
    Parse(String),
}

impl ErrorCode for ConfigError {
    fn error_code(&self) -> &'static str {
        match self {
            Self::Parse(_) => "E_CONFIG_PARSE",
        }
    }
}

#[cfg(test)]
#[path = "error_test.rs"]
mod tests;
