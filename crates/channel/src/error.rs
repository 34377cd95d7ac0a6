//! Error taxonomy for the device channel.

use std::time::Duration;

use thiserror::Error;

/// Why a dispatched call did not produce an output.
#[derive(Debug, Error)]
pub enum ChannelError {
    /// The cancellation signal fired before the call resolved. Callers treat
    /// this as a user-initiated stop, not a step failure.
    #[error("stopped before a response arrived")]
    Stopped,
    /// No matching response arrived within the bound.
    #[error("no response within {after:?}")]
    Timeout {
        /// The bound that elapsed.
        after: Duration,
    },
    /// The router or its incoming feed went away mid-call.
    #[error("device channel closed")]
    Closed,
    /// An image match is already in flight; the match protocol carries no
    /// correlation id, so a second concurrent match cannot be delivered.
    #[error("an image match is already in flight")]
    MatchBusy,
    /// The transport failed to emit the outgoing frame.
    #[error("transport error: {0}")]
    Transport(String),
}

impl ChannelError {
    /// True when the call ended because of cancellation.
    pub fn is_stopped(&self) -> bool {
        matches!(self, ChannelError::Stopped)
    }
}
