//! Connection state machine.
//!
//! The machine owns the identity and lifecycle of the current socket but no
//! I/O. Each [`Input`] (a socket callback, a timer, a renewal result, or a
//! call from the UI) is applied by [`ConnectionMachine::handle`], which
//! returns the [`Effect`]s the caller must carry out. Tests drive it
//! directly without a socket.
//!
//! ## Rules
//!
//! - At most one handle is current. A handle becomes current when it is
//!   created and stops being current when it closes or the channel unmounts.
//! - Callbacks from a handle that is not current are stale: opens are closed
//!   immediately, frames and closes are ignored.
//! - Retries are bounded by [`ConnectParams::retry_attempts`]. The counter
//!   advances when a retry timer fires and resets on (re)mount and after a
//!   successful credential renewal.

use std::collections::{HashSet, VecDeque};
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use percent_encoding::{utf8_percent_encode, AsciiSet, NON_ALPHANUMERIC};

use crate::credentials::CredentialStore;
use crate::envelope::{self, ChatMessage, Disposition, OutboundEnvelope, OutgoingMessage};
use crate::error::CredentialError;
use crate::event::Event;
use crate::renewal::{RenewalCoordinator, RenewalDecision};

/// Normal closure.
pub const NORMAL_CLOSURE: u16 = 1000;
/// Close without a close frame. The only code that triggers the expiry check.
pub const ABNORMAL_CLOSURE: u16 = 1006;

/// How many surfaced message ids are remembered for deduplication.
const RECENT_IDS: usize = 256;

/// Unreserved URL characters pass through untouched.
const QUERY_VALUE: &AsciiSet = &NON_ALPHANUMERIC
    .remove(b'-')
    .remove(b'_')
    .remove(b'.')
    .remove(b'~');

/// Parameters for connection attempts.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectParams {
    /// Socket endpoint, e.g. `wss://chat.example.com/ws`.
    pub endpoint: String,
    /// Retries allowed after the first attempt.
    pub retry_attempts: u32,
    /// Fixed delay before each retry.
    pub retry_interval: Duration,
    /// How long a credential refresh may take before it counts as failed.
    pub renewal_timeout: Duration,
}

impl ConnectParams {
    pub fn new(endpoint: impl Into<String>) -> Self {
        Self {
            endpoint: endpoint.into(),
            ..Default::default()
        }
    }
}

impl Default for ConnectParams {
    fn default() -> Self {
        Self {
            endpoint: "ws://127.0.0.1:8080/ws".to_string(),
            retry_attempts: 3,
            retry_interval: Duration::from_millis(1500),
            renewal_timeout: Duration::from_secs(10),
        }
    }
}

/// Build `<endpoint>?userID=<id>&token=<socketToken>`.
pub fn connection_target(endpoint: &str, user_id: i64, socket_token: &str) -> String {
    let sep = if endpoint.contains('?') { '&' } else { '?' };
    format!(
        "{endpoint}{sep}userID={user_id}&token={}",
        utf8_percent_encode(socket_token, QUERY_VALUE)
    )
}

fn now_ms() -> i64 {
    chrono::Utc::now().timestamp_millis()
}

/// Opaque identity of one physical socket.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct HandleId(pub u64);

impl fmt::Display for HandleId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HandleStatus {
    Connecting,
    Open,
    Closed,
}

#[derive(Debug, Clone)]
struct Handle {
    id: HandleId,
    /// `<userId>-<createdAtMillis>`, for logs.
    label: String,
    status: HandleStatus,
}

impl Handle {
    fn is_live(&self) -> bool {
        matches!(self.status, HandleStatus::Connecting | HandleStatus::Open)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    /// Not mounted.
    Detached,
    /// Mounted. A handle may be connecting or open.
    Active,
    /// Waiting for a credential refresh started by an abnormal close.
    Renewing,
    /// A retry timer is armed. Only a timer with this epoch is honoured.
    AwaitingRetry { epoch: u64 },
    /// Retry budget spent.
    Exhausted,
}

/// Mutable retry count for one mounted channel.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct RetryCounter {
    attempt: u32,
}

impl RetryCounter {
    pub fn value(&self) -> u32 {
        self.attempt
    }

    pub fn below(&self, max: u32) -> bool {
        self.attempt < max
    }

    pub fn increment(&mut self) {
        self.attempt = self.attempt.saturating_add(1);
    }

    pub fn reset(&mut self) {
        self.attempt = 0;
    }
}

/// Bounded memory of surfaced message ids.
#[derive(Debug, Default)]
struct RecentIds {
    order: VecDeque<i64>,
    seen: HashSet<i64>,
}

impl RecentIds {
    /// Returns false if `id` was already surfaced.
    fn insert(&mut self, id: i64) -> bool {
        if !self.seen.insert(id) {
            return false;
        }
        self.order.push_back(id);
        if self.order.len() > RECENT_IDS {
            if let Some(old) = self.order.pop_front() {
                self.seen.remove(&old);
            }
        }
        true
    }

    fn clear(&mut self) {
        self.order.clear();
        self.seen.clear();
    }
}

/// Everything that can happen to a channel.
#[derive(Debug)]
pub enum Input {
    /// UI mounted the channel (or asked for a connection).
    Mount,
    /// Connection parameters changed while mounted.
    Reconfigure(ConnectParams),
    Opened(HandleId),
    Frame(HandleId, String),
    Closed(HandleId, u16),
    Errored(HandleId, String),
    /// A retry timer armed with this epoch fired.
    RetryElapsed(u64),
    RenewalFinished(Result<(), CredentialError>),
    /// UI unmounted the channel.
    Unmount,
}

/// Work the machine asks its driver to perform.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Effect {
    Open { handle: HandleId, target: String },
    Send { handle: HandleId, frame: String },
    Close { handle: HandleId, code: u16 },
    ArmRetry { epoch: u64, delay: Duration },
    CancelRetry,
    Renew { user_id: i64, timeout: Duration },
    /// Connected status changed.
    Status(bool),
    /// Latest message for the UI.
    Surface(ChatMessage),
    Emit(Event),
}

pub struct ConnectionMachine {
    params: ConnectParams,
    store: Arc<dyn CredentialStore>,
    phase: Phase,
    current: Option<Handle>,
    connected: bool,
    retry: RetryCounter,
    renewal: RenewalCoordinator,
    recent: RecentIds,
    next_handle: u64,
    next_epoch: u64,
}

impl ConnectionMachine {
    pub fn new(params: ConnectParams, store: Arc<dyn CredentialStore>) -> Self {
        Self {
            params,
            store,
            phase: Phase::Detached,
            current: None,
            connected: false,
            retry: RetryCounter::default(),
            renewal: RenewalCoordinator::new(),
            recent: RecentIds::default(),
            next_handle: 1,
            next_epoch: 0,
        }
    }

    pub fn params(&self) -> &ConnectParams {
        &self.params
    }

    pub fn phase(&self) -> Phase {
        self.phase
    }

    pub fn retry_attempt(&self) -> u32 {
        self.retry.value()
    }

    pub fn is_connected(&self) -> bool {
        self.connected
    }

    pub fn current_handle(&self) -> Option<HandleId> {
        self.current.as_ref().map(|h| h.id)
    }

    pub fn current_status(&self) -> Option<HandleStatus> {
        self.current.as_ref().map(|h| h.status)
    }

    /// Apply one input.
    pub fn handle(&mut self, input: Input) -> Vec<Effect> {
        let mut fx = Vec::new();
        match input {
            Input::Mount => self.on_mount(&mut fx),
            Input::Reconfigure(params) => self.on_reconfigure(params, &mut fx),
            Input::Opened(h) => self.on_open(h, &mut fx),
            Input::Frame(h, raw) => self.on_frame(h, &raw, &mut fx),
            Input::Closed(h, code) => self.on_close(h, code, &mut fx),
            Input::Errored(h, reason) => self.on_error(h, &reason, &mut fx),
            Input::RetryElapsed(epoch) => self.on_retry_elapsed(epoch, &mut fx),
            Input::RenewalFinished(outcome) => self.on_renewal_finished(outcome, &mut fx),
            Input::Unmount => self.on_unmount(&mut fx),
        }
        fx
    }

    /// Serialize `message` for the current socket, or `None` if it cannot
    /// be sent right now.
    pub fn prepare_send(&self, message: &OutgoingMessage) -> Option<(HandleId, String)> {
        let Some(handle) = self.current.as_ref().filter(|h| h.status == HandleStatus::Open) else {
            tracing::debug!("No open socket, not sending");
            return None;
        };
        let creds = self.store.user().filter(|c| c.can_send())?;
        match OutboundEnvelope::message(&creds.jwt, message, now_ms()).to_json() {
            Ok(frame) => {
                tracing::debug!(
                    socket = %handle.label,
                    conversation_id = message.conversation_id,
                    "Sending message"
                );
                Some((handle.id, frame))
            }
            Err(e) => {
                tracing::error!(error = %e, "Failed to encode message");
                None
            }
        }
    }

    fn set_connected(&mut self, connected: bool, fx: &mut Vec<Effect>) {
        if self.connected != connected {
            self.connected = connected;
            fx.push(Effect::Status(connected));
        }
    }

    fn on_mount(&mut self, fx: &mut Vec<Effect>) {
        match self.phase {
            Phase::Detached | Phase::Exhausted => {
                if self.phase == Phase::Detached {
                    self.recent.clear();
                }
                self.retry.reset();
                self.phase = Phase::Active;
                self.open_connection(fx);
            }
            Phase::Active => self.open_connection(fx),
            _ => tracing::debug!(phase = ?self.phase, "Already mounted"),
        }
    }

    fn on_reconfigure(&mut self, params: ConnectParams, fx: &mut Vec<Effect>) {
        self.params = params;
        let live = self.current.as_ref().is_some_and(Handle::is_live);
        match self.phase {
            Phase::Active | Phase::Exhausted if !live => {
                self.retry.reset();
                self.phase = Phase::Active;
                self.open_connection(fx);
            }
            _ => tracing::debug!(phase = ?self.phase, live, "New parameters apply on next connect"),
        }
    }

    fn open_connection(&mut self, fx: &mut Vec<Effect>) {
        if let Some(current) = self.current.as_ref().filter(|h| h.is_live()) {
            tracing::debug!(socket = %current.label, "Connection already exists, skipping");
            return;
        }
        let Some(creds) = self.store.user().filter(|c| c.can_connect()) else {
            tracing::debug!("No user or socket token, skipping connection");
            return;
        };

        let id = HandleId(self.next_handle);
        self.next_handle += 1;
        let label = format!("{}-{}", creds.id, now_ms());
        tracing::debug!(socket = %label, endpoint = %self.params.endpoint, "Opening socket");

        self.current = Some(Handle {
            id,
            label,
            status: HandleStatus::Connecting,
        });
        fx.push(Effect::Open {
            handle: id,
            target: connection_target(&self.params.endpoint, creds.id, &creds.web_socket_token),
        });
    }

    fn on_open(&mut self, h: HandleId, fx: &mut Vec<Effect>) {
        let Some(current) = self.current.as_mut() else {
            tracing::debug!(handle = %h, "Stale socket opened, closing it");
            fx.push(Effect::Close { handle: h, code: NORMAL_CLOSURE });
            return;
        };
        if current.id != h {
            tracing::info!(
                socket = %current.label,
                duplicate = %h,
                "Duplicate socket opened, closing it"
            );
            fx.push(Effect::Close { handle: h, code: NORMAL_CLOSURE });
            return;
        }
        if current.status != HandleStatus::Connecting {
            return;
        }

        current.status = HandleStatus::Open;
        let label = current.label.clone();
        tracing::info!(socket = %label, "Connection opened");
        self.set_connected(true, fx);
        fx.push(Effect::Emit(Event::Connected { socket: label }));

        let token = self.store.user().map(|c| c.jwt).unwrap_or_default();
        match OutboundEnvelope::authenticate(&token, now_ms()).to_json() {
            Ok(frame) => fx.push(Effect::Send { handle: h, frame }),
            Err(e) => tracing::error!(error = %e, "Failed to encode authenticate frame"),
        }
    }

    fn on_frame(&mut self, h: HandleId, raw: &str, fx: &mut Vec<Effect>) {
        let open = self
            .current
            .as_ref()
            .filter(|c| c.id == h && c.status == HandleStatus::Open);
        let Some(current) = open else {
            tracing::debug!(handle = %h, "Frame from stale socket ignored");
            return;
        };
        let socket = current.label.clone();
        let local_user = self.store.user().map(|c| c.id);

        match envelope::parse(raw).into_disposition(local_user) {
            Disposition::Surface(msg) => {
                if !self.recent.insert(msg.id) {
                    tracing::debug!(%socket, id = msg.id, "Duplicate message ignored");
                    return;
                }
                tracing::debug!(
                    %socket,
                    id = msg.id,
                    conversation_id = msg.conversation_id,
                    "Message received"
                );
                fx.push(Effect::Surface(msg.clone()));
                fx.push(Effect::Emit(Event::Message(msg)));
            }
            Disposition::Acknowledged => tracing::debug!(%socket, "Authentication acknowledged"),
            Disposition::Info(text) => {
                tracing::info!(%socket, info = %text, "Server info");
                fx.push(Effect::Emit(Event::ServerInfo(text)));
            }
            Disposition::ServerError(text) => {
                tracing::warn!(%socket, error = %text, "Server error frame");
                fx.push(Effect::Emit(Event::ServerError(text)));
            }
            Disposition::Unrecognized(text) => {
                tracing::warn!(%socket, frame = %text, "Unrecognized frame");
                fx.push(Effect::Emit(Event::Unrecognized(text)));
            }
            Disposition::SelfEcho(msg) => {
                tracing::debug!(%socket, id = msg.id, "Message is from self, ignoring");
            }
            Disposition::Rejected => tracing::debug!(%socket, "Invalid message frame discarded"),
        }
    }

    fn on_close(&mut self, h: HandleId, code: u16, fx: &mut Vec<Effect>) {
        let Some(mut closed) = self.current.take_if(|c| c.id == h) else {
            tracing::debug!(handle = %h, code, "Close from stale socket ignored");
            return;
        };
        closed.status = HandleStatus::Closed;
        tracing::info!(socket = %closed.label, code, "Connection closed");
        self.set_connected(false, fx);
        fx.push(Effect::Emit(Event::Disconnected { code }));

        if code == ABNORMAL_CLOSURE {
            let creds = self.store.user();
            match self.renewal.on_abnormal_close(creds.as_ref(), now_ms()) {
                RenewalDecision::Renew { user_id } => {
                    self.phase = Phase::Renewing;
                    fx.push(Effect::Renew {
                        user_id,
                        timeout: self.params.renewal_timeout,
                    });
                    return;
                }
                decision => tracing::debug!(?decision, "No renewal before retry"),
            }
        }
        self.schedule_retry(fx);
    }

    fn on_error(&mut self, h: HandleId, reason: &str, fx: &mut Vec<Effect>) {
        tracing::warn!(handle = %h, error = %reason, "Socket error");
        if self.current.as_ref().is_some_and(|c| c.id == h) {
            self.set_connected(false, fx);
        }
        fx.push(Effect::Close { handle: h, code: NORMAL_CLOSURE });
    }

    fn schedule_retry(&mut self, fx: &mut Vec<Effect>) {
        let max = self.params.retry_attempts;
        if self.retry.below(max) {
            self.next_epoch += 1;
            let epoch = self.next_epoch;
            let attempt = self.retry.value() + 1;
            let delay = self.params.retry_interval;
            tracing::info!(
                attempt,
                max,
                delay_ms = delay.as_millis() as u64,
                "Retrying connection"
            );
            self.phase = Phase::AwaitingRetry { epoch };
            fx.push(Effect::ArmRetry { epoch, delay });
            fx.push(Effect::Emit(Event::RetryScheduled { attempt, delay }));
        } else {
            tracing::warn!(attempts = max, "Max retries reached, giving up");
            self.phase = Phase::Exhausted;
            fx.push(Effect::Emit(Event::RetriesExhausted { attempts: max }));
        }
    }

    fn on_retry_elapsed(&mut self, epoch: u64, fx: &mut Vec<Effect>) {
        if self.phase != (Phase::AwaitingRetry { epoch }) {
            tracing::debug!(epoch, phase = ?self.phase, "Cancelled retry timer ignored");
            return;
        }
        self.retry.increment();
        self.phase = Phase::Active;
        self.open_connection(fx);
    }

    fn on_renewal_finished(&mut self, outcome: Result<(), CredentialError>, fx: &mut Vec<Effect>) {
        if self.phase != Phase::Renewing {
            self.renewal.abandon();
            tracing::debug!(phase = ?self.phase, "Renewal finished after teardown");
            return;
        }
        if self.renewal.finish(&outcome, &mut self.retry) {
            fx.push(Effect::Emit(Event::Renewed));
        } else if let Err(e) = &outcome {
            fx.push(Effect::Emit(Event::RenewalFailed { reason: e.to_string() }));
        }
        self.schedule_retry(fx);
    }

    fn on_unmount(&mut self, fx: &mut Vec<Effect>) {
        if self.phase == Phase::Detached {
            return;
        }
        if let Some(current) = self.current.take() {
            if current.status == HandleStatus::Open {
                tracing::debug!(socket = %current.label, "Closing connection on teardown");
                fx.push(Effect::Close { handle: current.id, code: NORMAL_CLOSURE });
            } else {
                tracing::debug!(
                    socket = %current.label,
                    "Abandoning connecting socket on teardown"
                );
            }
        }
        if matches!(self.phase, Phase::AwaitingRetry { .. }) {
            fx.push(Effect::CancelRetry);
        }
        self.set_connected(false, fx);
        self.phase = Phase::Detached;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::credentials::tests::{pair, CountingRefresher};
    use crate::credentials::{CachedCredentialStore, CredentialPair};

    fn fresh_pair(id: i64) -> CredentialPair {
        pair(id, i64::MAX, i64::MAX)
    }

    fn machine_with(user: Option<CredentialPair>, retry_attempts: u32) -> ConnectionMachine {
        let store = Arc::new(CachedCredentialStore::in_memory(
            user,
            Arc::new(CountingRefresher::default()),
        ));
        ConnectionMachine::new(
            ConnectParams {
                endpoint: "wss://host".into(),
                retry_attempts,
                retry_interval: Duration::from_millis(1500),
                ..Default::default()
            },
            store,
        )
    }

    fn opened(fx: &[Effect]) -> Option<HandleId> {
        fx.iter().find_map(|e| match e {
            Effect::Open { handle, .. } => Some(*handle),
            _ => None,
        })
    }

    fn armed(fx: &[Effect]) -> Option<u64> {
        fx.iter().find_map(|e| match e {
            Effect::ArmRetry { epoch, .. } => Some(*epoch),
            _ => None,
        })
    }

    fn surfaced(fx: &[Effect]) -> Vec<i64> {
        fx.iter()
            .filter_map(|e| match e {
                Effect::Surface(m) => Some(m.id),
                _ => None,
            })
            .collect()
    }

    fn chat_frame(id: i64, user_id: i64) -> String {
        serde_json::json!({
            "type": "message",
            "isValid": true,
            "content": {
                "id": id,
                "content": "hey",
                "createdAt": "2025-01-01T00:00:00Z",
                "userId": user_id,
                "conversationId": 1,
            }
        })
        .to_string()
    }

    /// Mount and open; returns the open handle.
    fn connect(m: &mut ConnectionMachine) -> HandleId {
        let h = opened(&m.handle(Input::Mount)).expect("socket opened");
        m.handle(Input::Opened(h));
        h
    }

    #[test]
    fn target_carries_user_and_socket_token() {
        assert_eq!(connection_target("wss://host", 7, "tok"), "wss://host?userID=7&token=tok");
        assert_eq!(
            connection_target("wss://host/ws?v=2", 7, "a b"),
            "wss://host/ws?v=2&userID=7&token=a%20b"
        );
    }

    #[test]
    fn mount_opens_socket_with_target() {
        let mut m = machine_with(Some(pair(7, i64::MAX, i64::MAX)), 3);
        let fx = m.handle(Input::Mount);
        assert!(fx.contains(&Effect::Open {
            handle: HandleId(1),
            target: "wss://host?userID=7&token=tok".into(),
        }));
        assert_eq!(m.current_status(), Some(HandleStatus::Connecting));
    }

    #[test]
    fn missing_credentials_is_a_no_op() {
        let mut m = machine_with(None, 3);
        assert!(m.handle(Input::Mount).is_empty());

        let mut no_token = fresh_pair(7);
        no_token.web_socket_token.clear();
        let mut m = machine_with(Some(no_token), 3);
        assert!(m.handle(Input::Mount).is_empty());
        assert_eq!(m.current_handle(), None);
    }

    #[test]
    fn open_is_idempotent_while_connecting_or_open() {
        let mut m = machine_with(Some(fresh_pair(7)), 3);
        let h = opened(&m.handle(Input::Mount)).unwrap();
        assert_eq!(opened(&m.handle(Input::Mount)), None);
        m.handle(Input::Opened(h));
        assert_eq!(opened(&m.handle(Input::Mount)), None);
        assert_eq!(m.current_handle(), Some(h));
    }

    #[test]
    fn open_sends_authenticate_frame() {
        let mut m = machine_with(Some(fresh_pair(7)), 3);
        let h = opened(&m.handle(Input::Mount)).unwrap();
        let fx = m.handle(Input::Opened(h));
        assert!(fx.contains(&Effect::Status(true)));
        let frame = fx
            .iter()
            .find_map(|e| match e {
                Effect::Send { handle, frame } if *handle == h => Some(frame.clone()),
                _ => None,
            })
            .expect("authenticate frame");
        let v: serde_json::Value = serde_json::from_str(&frame).unwrap();
        assert_eq!(v["type"], "authenticate");
        assert_eq!(v["token"], "jwt-old");
        assert!(m.is_connected());
    }

    #[test]
    fn duplicate_race_keeps_one_socket() {
        let mut m = machine_with(Some(fresh_pair(7)), 3);
        let first = opened(&m.handle(Input::Mount)).unwrap();
        // Rapid remount while the first socket is still connecting.
        m.handle(Input::Unmount);
        let second = opened(&m.handle(Input::Mount)).unwrap();
        assert_ne!(first, second);

        let fx = m.handle(Input::Opened(second));
        assert!(fx.contains(&Effect::Status(true)));

        let fx = m.handle(Input::Opened(first));
        assert_eq!(fx, vec![Effect::Close { handle: first, code: NORMAL_CLOSURE }]);
        assert_eq!(m.current_handle(), Some(second));
        assert!(m.is_connected());

        // The loser's error and close do not disturb the survivor.
        assert_eq!(
            m.handle(Input::Errored(first, "reset".into())),
            vec![Effect::Close { handle: first, code: NORMAL_CLOSURE }]
        );
        assert!(m.handle(Input::Closed(first, NORMAL_CLOSURE)).is_empty());
        assert!(m.is_connected());
        assert_eq!(m.current_status(), Some(HandleStatus::Open));
    }

    #[test]
    fn duplicate_opening_first_is_closed_when_current_is_connecting() {
        let mut m = machine_with(Some(fresh_pair(7)), 3);
        let first = opened(&m.handle(Input::Mount)).unwrap();
        m.handle(Input::Unmount);
        let second = opened(&m.handle(Input::Mount)).unwrap();

        let fx = m.handle(Input::Opened(first));
        assert_eq!(fx, vec![Effect::Close { handle: first, code: NORMAL_CLOSURE }]);
        assert!(!m.is_connected());

        m.handle(Input::Opened(second));
        assert!(m.is_connected());
    }

    #[test]
    fn surfaces_foreign_messages_only() {
        let mut m = machine_with(Some(fresh_pair(7)), 3);
        let h = connect(&mut m);

        assert_eq!(surfaced(&m.handle(Input::Frame(h, chat_frame(1, 4)))), vec![1]);
        assert!(surfaced(&m.handle(Input::Frame(h, chat_frame(2, 7)))).is_empty());
        assert!(surfaced(&m.handle(Input::Frame(h, chat_frame(-1, 4)))).is_empty());
        assert!(surfaced(&m.handle(Input::Frame(h, "not json".into()))).is_empty());
    }

    #[test]
    fn duplicate_ids_surface_once() {
        let mut m = machine_with(Some(fresh_pair(7)), 3);
        let h = connect(&mut m);
        assert_eq!(surfaced(&m.handle(Input::Frame(h, chat_frame(5, 4)))), vec![5]);
        assert!(surfaced(&m.handle(Input::Frame(h, chat_frame(5, 4)))).is_empty());
    }

    #[test]
    fn frames_from_stale_sockets_are_ignored() {
        let mut m = machine_with(Some(fresh_pair(7)), 3);
        let h = connect(&mut m);
        assert!(m.handle(Input::Frame(HandleId(h.0 + 10), chat_frame(1, 4))).is_empty());
    }

    #[test]
    fn error_frames_are_reported() {
        let mut m = machine_with(Some(fresh_pair(7)), 3);
        let h = connect(&mut m);
        let fx = m.handle(Input::Frame(
            h,
            r#"{"type":"error","isValid":true,"content":"bad token"}"#.into(),
        ));
        assert_eq!(fx, vec![Effect::Emit(Event::ServerError("bad token".into()))]);
    }

    #[test]
    fn close_schedules_retry_then_reconnects() {
        let mut m = machine_with(Some(fresh_pair(7)), 3);
        let h = connect(&mut m);

        let fx = m.handle(Input::Closed(h, NORMAL_CLOSURE));
        assert!(fx.contains(&Effect::Status(false)));
        let epoch = armed(&fx).expect("retry armed");
        assert_eq!(m.phase(), Phase::AwaitingRetry { epoch });
        assert_eq!(m.current_handle(), None);

        let fx = m.handle(Input::RetryElapsed(epoch));
        assert!(opened(&fx).is_some());
        assert_eq!(m.retry_attempt(), 1);
    }

    #[test]
    fn retries_stop_at_bound() {
        let mut m = machine_with(Some(fresh_pair(7)), 3);
        let mut h = opened(&m.handle(Input::Mount)).unwrap();
        let mut timers = 0;

        for _ in 0..4 {
            let fx = m.handle(Input::Closed(h, ABNORMAL_CLOSURE));
            match armed(&fx) {
                Some(epoch) => {
                    timers += 1;
                    h = opened(&m.handle(Input::RetryElapsed(epoch))).unwrap();
                }
                None => {
                    assert!(fx.contains(&Effect::Emit(Event::RetriesExhausted { attempts: 3 })));
                }
            }
        }

        assert_eq!(timers, 3);
        assert_eq!(m.phase(), Phase::Exhausted);
        assert!(m.handle(Input::RetryElapsed(99)).is_empty());
    }

    #[test]
    fn expired_token_renewal_resets_counter() {
        // Socket token already lapsed; the first two closes use a normal code
        // so the counter climbs without renewing.
        let mut m = machine_with(Some(pair(7, i64::MAX, 1)), 3);
        let mut h = opened(&m.handle(Input::Mount)).unwrap();
        for _ in 0..2 {
            let epoch = armed(&m.handle(Input::Closed(h, NORMAL_CLOSURE))).unwrap();
            h = opened(&m.handle(Input::RetryElapsed(epoch))).unwrap();
        }
        assert_eq!(m.retry_attempt(), 2);

        let fx = m.handle(Input::Closed(h, ABNORMAL_CLOSURE));
        assert!(fx.contains(&Effect::Renew {
            user_id: 7,
            timeout: Duration::from_secs(10),
        }));
        assert_eq!(armed(&fx), None);
        assert_eq!(m.phase(), Phase::Renewing);

        let fx = m.handle(Input::RenewalFinished(Ok(())));
        assert_eq!(m.retry_attempt(), 0);
        assert!(fx.contains(&Effect::Emit(Event::Renewed)));
        assert!(armed(&fx).is_some());
    }

    #[test]
    fn failed_renewal_keeps_counter_and_retries() {
        let mut m = machine_with(Some(pair(7, 1, i64::MAX)), 3);
        let h = opened(&m.handle(Input::Mount)).unwrap();
        m.handle(Input::Closed(h, ABNORMAL_CLOSURE));
        assert_eq!(m.phase(), Phase::Renewing);

        let fx = m.handle(Input::RenewalFinished(Err(CredentialError::NoUser)));
        assert!(fx.contains(&Effect::Emit(Event::RenewalFailed {
            reason: CredentialError::NoUser.to_string()
        })));
        assert!(armed(&fx).is_some());
        assert_eq!(m.retry_attempt(), 0);
    }

    #[test]
    fn non_abnormal_close_skips_renewal() {
        let mut m = machine_with(Some(pair(7, 1, 1)), 3);
        let h = opened(&m.handle(Input::Mount)).unwrap();
        let fx = m.handle(Input::Closed(h, NORMAL_CLOSURE));
        assert!(!fx.iter().any(|e| matches!(e, Effect::Renew { .. })));
        assert!(armed(&fx).is_some());
    }

    #[test]
    fn unmount_cancels_pending_retry() {
        let mut m = machine_with(Some(fresh_pair(7)), 3);
        let h = connect(&mut m);
        let epoch = armed(&m.handle(Input::Closed(h, NORMAL_CLOSURE))).unwrap();

        let fx = m.handle(Input::Unmount);
        assert!(fx.contains(&Effect::CancelRetry));
        assert!(m.handle(Input::RetryElapsed(epoch)).is_empty());
    }

    #[test]
    fn unmount_closes_open_socket() {
        let mut m = machine_with(Some(fresh_pair(7)), 3);
        let h = connect(&mut m);
        let fx = m.handle(Input::Unmount);
        assert!(fx.contains(&Effect::Close { handle: h, code: NORMAL_CLOSURE }));
        assert!(fx.contains(&Effect::Status(false)));
        assert_eq!(m.phase(), Phase::Detached);

        // Late callbacks are inert.
        assert!(m.handle(Input::Closed(h, ABNORMAL_CLOSURE)).is_empty());
        assert!(m.handle(Input::Frame(h, chat_frame(1, 4))).is_empty());
    }

    #[test]
    fn renewal_finishing_after_unmount_schedules_nothing() {
        let mut m = machine_with(Some(pair(7, 1, 1)), 3);
        let h = opened(&m.handle(Input::Mount)).unwrap();
        m.handle(Input::Closed(h, ABNORMAL_CLOSURE));
        m.handle(Input::Unmount);
        assert!(m.handle(Input::RenewalFinished(Ok(()))).is_empty());
    }

    #[test]
    fn stale_timer_after_remount_is_ignored() {
        let mut m = machine_with(Some(fresh_pair(7)), 3);
        let h = connect(&mut m);
        let old = armed(&m.handle(Input::Closed(h, NORMAL_CLOSURE))).unwrap();
        m.handle(Input::Unmount);
        let h2 = opened(&m.handle(Input::Mount)).unwrap();
        m.handle(Input::Opened(h2));
        assert!(m.handle(Input::RetryElapsed(old)).is_empty());
        assert_eq!(m.current_handle(), Some(h2));
    }

    #[test]
    fn reconfigure_after_exhaustion_reconnects() {
        let mut m = machine_with(Some(fresh_pair(7)), 0);
        let h = connect(&mut m);
        m.handle(Input::Closed(h, NORMAL_CLOSURE));
        assert_eq!(m.phase(), Phase::Exhausted);

        let fx = m.handle(Input::Reconfigure(ConnectParams::new("wss://other")));
        assert!(fx.iter().any(|e| matches!(
            e,
            Effect::Open { target, .. } if target == "wss://other?userID=7&token=tok"
        )));
    }

    #[test]
    fn remount_after_exhaustion_starts_a_fresh_budget() {
        let mut m = machine_with(Some(fresh_pair(7)), 0);
        let h = connect(&mut m);
        m.handle(Input::Closed(h, NORMAL_CLOSURE));
        assert_eq!(m.phase(), Phase::Exhausted);

        assert!(opened(&m.handle(Input::Mount)).is_some());
        assert_eq!(m.phase(), Phase::Active);
        assert_eq!(m.retry_attempt(), 0);
    }

    #[test]
    fn reconfigure_does_not_migrate_live_socket() {
        let mut m = machine_with(Some(fresh_pair(7)), 3);
        let h = connect(&mut m);
        assert!(m.handle(Input::Reconfigure(ConnectParams::new("wss://other"))).is_empty());
        assert_eq!(m.current_handle(), Some(h));
        assert_eq!(m.params().endpoint, "wss://other");
    }

    #[test]
    fn send_requires_open_socket() {
        let mut m = machine_with(Some(fresh_pair(7)), 3);
        let msg = OutgoingMessage {
            content: "hi".into(),
            user_id: 7,
            conversation_id: 1,
        };
        assert_eq!(m.prepare_send(&msg), None);

        let h = opened(&m.handle(Input::Mount)).unwrap();
        assert_eq!(m.prepare_send(&msg), None);

        m.handle(Input::Opened(h));
        let (handle, frame) = m.prepare_send(&msg).unwrap();
        assert_eq!(handle, h);
        let v: serde_json::Value = serde_json::from_str(&frame).unwrap();
        assert_eq!(v["type"], "message");
        assert_eq!(v["token"], "jwt-old");
        assert_eq!(v["message"]["content"], "hi");
    }
}
