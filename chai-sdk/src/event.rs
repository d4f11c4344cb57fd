//! Events emitted by a mounted channel for the UI layer to observe.

use std::time::Duration;

use crate::envelope::ChatMessage;

/// Side-channel events. The UI's primary surface is the channel's
/// connected status and latest message; these carry the rest.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Event {
    /// A socket opened and the authenticate frame was sent.
    Connected {
        socket: String,
    },

    /// The current socket closed.
    Disconnected {
        code: u16,
    },

    /// A message from another user was surfaced.
    Message(ChatMessage),

    /// Informational frame from the server.
    ServerInfo(String),

    /// Server sent an `error` frame.
    ServerError(String),

    /// A frame that could not be understood.
    Unrecognized(String),

    /// A reconnect is armed. `attempt` is 1-based.
    RetryScheduled {
        attempt: u32,
        delay: Duration,
    },

    /// Retry budget spent; no further attempts until remount.
    RetriesExhausted {
        attempts: u32,
    },

    /// Expired credentials were refreshed.
    Renewed,
    RenewalFailed {
        reason: String,
    },
}
