//! Error types for the SDK.
//!
//! None of these cross the [`Channel`](crate::channel::Channel) boundary; the
//! channel turns them into log lines, events and `false` returns.

/// Failures reading, writing or refreshing stored credentials.
#[derive(Debug, thiserror::Error)]
pub enum CredentialError {
    #[error("no signed-in user")]
    NoUser,
    #[error("stored user is {found}, refresh requested for {expected}")]
    UserMismatch { expected: i64, found: i64 },
    #[error("refresh request failed with status {status}: {body}")]
    Http { status: u16, body: String },
    #[error("refresh timed out after {0:?}")]
    Timeout(std::time::Duration),
    #[error("refresh endpoint did not return JSON: {0}")]
    NotJson(String),
    #[error("refresh request failed: {0}")]
    Request(#[from] reqwest::Error),
    #[error("credential file: {0}")]
    Io(#[from] std::io::Error),
    #[error("credential encoding: {0}")]
    Json(#[from] serde_json::Error),
}

/// Failures handing a frame to a socket.
#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    #[error("socket is closed")]
    Closed,
    #[error("no socket for handle {0}")]
    UnknownHandle(u64),
}
