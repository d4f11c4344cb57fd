//! chai-sdk: real-time connection manager for the chai chat client.
//!
//! Keeps one authenticated socket per mounted conversation view:
//! - Envelope codec: wire frames in and out
//! - Connection machine: open, authenticate, bounded retry, teardown
//! - Renewal: refresh expired tokens after an abnormal close
//! - Channel: connected status, latest message and `send` for the UI

pub mod channel;
pub mod credentials;
pub mod envelope;
pub mod error;
pub mod event;
pub mod machine;
pub mod refresh;
pub mod renewal;
pub mod transport;

pub use channel::{Channel, EventReceiver};
pub use credentials::{CachedCredentialStore, CredentialPair, CredentialStore, TokenRefresher};
pub use envelope::{ChatMessage, OutgoingMessage};
pub use event::Event;
pub use machine::ConnectParams;
pub use refresh::HttpRefresher;
pub use transport::{Connector, Socket, WsConnector};
