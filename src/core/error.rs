//! Realtime Errors

use thiserror::Error;

/// Result type for realtime operations
pub type RealtimeResult<T> = Result<T, RealtimeError>;

/// Errors surfaced by the manager and its transports.
///
/// Only `subscribe` returns these to the caller; everything else reaches
/// user code through the `on_error` handler.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RealtimeError {
    // ==================
    // Transport handshake
    // ==================
    /// Transport reported CHANNEL_ERROR
    #[error("Channel error on [{id}]: {reason}")]
    ChannelError { id: String, reason: String },

    /// Handshake did not complete in time
    #[error("Subscription [{0}] timed out")]
    TimedOut(String),

    /// Transport closed the channel without being asked to
    #[error("Channel closed for [{0}]")]
    ChannelClosed(String),

    /// A newer subscribe() call replaced this one before it went live
    #[error("Subscription [{0}] superseded by a newer subscribe")]
    Superseded(String),

    /// Transport refused to open a channel
    #[error("Transport failure: {0}")]
    Transport(String),

    // ==================
    // Input
    // ==================
    #[error("Invalid subscription config: {0}")]
    InvalidConfig(String),

    #[error("Invalid row filter '{filter}': {reason}")]
    InvalidFilter { filter: String, reason: String },

    // ==================
    // Dispatch
    // ==================
    /// User handler returned an error or panicked
    #[error("Handler failed on [{id}]: {message}")]
    Handler { id: String, message: String },

    /// Manager was destroyed
    #[error("Realtime manager destroyed")]
    Destroyed,
}

impl RealtimeError {
    pub(crate) fn invalid_filter(filter: &str, reason: impl Into<String>) -> Self {
        Self::InvalidFilter {
            filter: filter.to_string(),
            reason: reason.into(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_display() {
        let e = RealtimeError::ChannelError {
            id: "orders".into(),
            reason: "boom".into(),
        };
        assert_eq!(e.to_string(), "Channel error on [orders]: boom");
    }
}
