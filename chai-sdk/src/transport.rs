//! Socket transport.
//!
//! A [`Connector`] turns a target URL into a [`Socket`] and reports
//! everything that happens on it as [`Input`]s tagged with the socket's
//! [`HandleId`]. The machine decides what those callbacks mean; the
//! transport only moves frames.
//!
//! A failed or stalled handshake, or a stream that ends without a close frame,
//! is reported as `Errored` followed by `Closed(1006)`. So is a peer that
//! stays silent through a ping and the idle timeout.

use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use tokio::sync::mpsc;
use tokio::time::Instant;
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::tungstenite::protocol::CloseFrame;
use tokio_tungstenite::tungstenite::Message;

use crate::error::TransportError;
use crate::machine::{HandleId, Input, ABNORMAL_CLOSURE, NORMAL_CLOSURE};

/// Close received without a status code.
const NO_STATUS: u16 = 1005;

/// One physical socket, seen from the channel.
pub trait Socket: Send + Sync {
    fn send_text(&self, frame: String) -> Result<(), TransportError>;
    fn close(&self, code: u16);
}

/// Opens sockets. Must not block; the handshake runs in the background.
pub trait Connector: Send + Sync {
    fn open(
        &self,
        handle: HandleId,
        target: &str,
        inputs: mpsc::UnboundedSender<Input>,
    ) -> Box<dyn Socket>;
}

#[derive(Debug)]
enum Outbound {
    Text(String),
    Close(u16),
}

/// Liveness limits for a socket.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Timeouts {
    /// Upper bound on the TCP, TLS and HTTP upgrade handshake.
    pub handshake: Duration,
    /// A ping is sent after this long without an outbound ping.
    pub ping_interval: Duration,
    /// The socket is considered dead after this long without inbound traffic.
    pub idle: Duration,
}

impl Default for Timeouts {
    fn default() -> Self {
        Self {
            handshake: Duration::from_secs(10),
            ping_interval: Duration::from_secs(30),
            idle: Duration::from_secs(75),
        }
    }
}

/// WebSocket connector on tokio-tungstenite.
#[derive(Debug, Default, Clone)]
pub struct WsConnector {
    timeouts: Timeouts,
}

impl WsConnector {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_timeouts(timeouts: Timeouts) -> Self {
        Self { timeouts }
    }
}

impl Connector for WsConnector {
    fn open(
        &self,
        handle: HandleId,
        target: &str,
        inputs: mpsc::UnboundedSender<Input>,
    ) -> Box<dyn Socket> {
        let (tx, rx) = mpsc::unbounded_channel();
        tokio::spawn(run_socket(handle, target.to_string(), self.timeouts, rx, inputs));
        Box::new(WsSocket { tx })
    }
}

/// Queue-backed socket. Frames queued before the handshake completes are
/// flushed once it does.
pub struct WsSocket {
    tx: mpsc::UnboundedSender<Outbound>,
}

impl Socket for WsSocket {
    fn send_text(&self, frame: String) -> Result<(), TransportError> {
        self.tx
            .send(Outbound::Text(frame))
            .map_err(|_| TransportError::Closed)
    }

    fn close(&self, code: u16) {
        let _ = self.tx.send(Outbound::Close(code));
    }
}

fn install_crypto_provider() {
    #[cfg(feature = "ring")]
    {
        let _ = rustls::crypto::ring::default_provider().install_default();
    }
    #[cfg(all(feature = "aws-lc-rs", not(feature = "ring")))]
    {
        let _ = rustls::crypto::aws_lc_rs::default_provider().install_default();
    }
}

/// Strip the query so tokens never reach the logs.
fn redact(target: &str) -> &str {
    target.split('?').next().unwrap_or(target)
}

async fn run_socket(
    handle: HandleId,
    target: String,
    timeouts: Timeouts,
    mut outbound: mpsc::UnboundedReceiver<Outbound>,
    inputs: mpsc::UnboundedSender<Input>,
) {
    if target.starts_with("wss:") {
        install_crypto_provider();
    }

    let connect = tokio_tungstenite::connect_async(target.as_str());
    let handshake = match tokio::time::timeout(timeouts.handshake, connect).await {
        Ok(Ok((ws, _))) => Ok(ws),
        Ok(Err(e)) => Err(e.to_string()),
        Err(_) => Err(format!("handshake timed out after {:?}", timeouts.handshake)),
    };
    let ws = match handshake {
        Ok(ws) => ws,
        Err(reason) => {
            tracing::warn!(
                %handle,
                endpoint = redact(&target),
                error = %reason,
                "WebSocket connect failed"
            );
            let _ = inputs.send(Input::Errored(handle, reason));
            let _ = inputs.send(Input::Closed(handle, ABNORMAL_CLOSURE));
            return;
        }
    };
    let (mut sink, mut stream) = ws.split();
    if inputs.send(Input::Opened(handle)).is_err() {
        return;
    }

    let mut last_activity = Instant::now();
    let mut next_ping = last_activity + timeouts.ping_interval;

    loop {
        tokio::select! {
            frame = stream.next() => {
                last_activity = Instant::now();
                match frame {
                    Some(Ok(Message::Text(text))) => {
                        let _ = inputs.send(Input::Frame(handle, text));
                    }
                    Some(Ok(Message::Close(frame))) => {
                        let code = frame.map(|f| u16::from(f.code)).unwrap_or(NO_STATUS);
                        let _ = inputs.send(Input::Closed(handle, code));
                        return;
                    }
                    Some(Ok(_)) => {}
                    Some(Err(e)) => {
                        let _ = inputs.send(Input::Errored(handle, e.to_string()));
                        let _ = inputs.send(Input::Closed(handle, ABNORMAL_CLOSURE));
                        return;
                    }
                    None => {
                        let _ = inputs.send(Input::Closed(handle, ABNORMAL_CLOSURE));
                        return;
                    }
                }
            }
            // Periodic ping and idle detection
            _ = tokio::time::sleep_until(next_ping.min(last_activity + timeouts.idle)) => {
                if last_activity.elapsed() >= timeouts.idle {
                    tracing::warn!(%handle, idle = ?timeouts.idle, "Socket idle, giving up");
                    let _ = inputs.send(Input::Errored(handle, "ping timeout".to_string()));
                    let _ = inputs.send(Input::Closed(handle, ABNORMAL_CLOSURE));
                    return;
                }
                if Instant::now() >= next_ping {
                    next_ping = Instant::now() + timeouts.ping_interval;
                    if let Err(e) = sink.send(Message::Ping(Vec::new())).await {
                        tracing::debug!(%handle, error = %e, "WebSocket ping failed");
                        let _ = inputs.send(Input::Errored(handle, e.to_string()));
                        let _ = inputs.send(Input::Closed(handle, ABNORMAL_CLOSURE));
                        return;
                    }
                }
            }
            out = outbound.recv() => {
                let (msg, closing) = match out {
                    Some(Outbound::Text(text)) => (Message::Text(text), None),
                    Some(Outbound::Close(code)) => (close_message(code), Some(code)),
                    // Socket dropped by the channel.
                    None => (close_message(NORMAL_CLOSURE), Some(NORMAL_CLOSURE)),
                };
                if let Err(e) = sink.send(msg).await {
                    tracing::debug!(%handle, error = %e, "WebSocket write failed");
                    let _ = inputs.send(Input::Errored(handle, e.to_string()));
                    let _ = inputs.send(Input::Closed(handle, ABNORMAL_CLOSURE));
                    return;
                }
                if let Some(code) = closing {
                    let _ = inputs.send(Input::Closed(handle, code));
                    return;
                }
            }
        }
    }
}

fn close_message(code: u16) -> Message {
    Message::Close(Some(CloseFrame {
        code: CloseCode::from(code),
        reason: "".into(),
    }))
}
