//! Client-facing channel.
//!
//! A [`Channel`] is what the UI holds while a conversation view is mounted.
//! It exposes connected status, the latest surfaced message and `send`, and
//! runs the [`ConnectionMachine`] by executing the effects it returns: opening
//! and closing sockets, arming the retry timer and spawning renewals.
//!
//! Every input, whether from a socket callback, a timer, a renewal or a public
//! method, is applied under the machine lock together with its effects, so no
//! two transitions interleave.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::Mutex;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;

use crate::credentials::CredentialStore;
use crate::envelope::{ChatMessage, OutgoingMessage};
use crate::error::{CredentialError, TransportError};
use crate::event::Event;
use crate::machine::{ConnectParams, ConnectionMachine, Effect, HandleId, Input};
use crate::renewal;
use crate::transport::{Connector, Socket};

/// Receiver half for side-channel [`Event`]s.
pub type EventReceiver = mpsc::UnboundedReceiver<Event>;

struct Shared {
    machine: Mutex<ConnectionMachine>,
    sockets: Mutex<HashMap<HandleId, Box<dyn Socket>>>,
    retry_timer: Mutex<Option<JoinHandle<()>>>,
    connector: Arc<dyn Connector>,
    store: Arc<dyn CredentialStore>,
    inputs: mpsc::UnboundedSender<Input>,
    connected: watch::Sender<bool>,
    data: watch::Sender<Option<ChatMessage>>,
    events: mpsc::UnboundedSender<Event>,
}

impl Shared {
    fn apply(&self, input: Input) {
        let closed = match &input {
            Input::Closed(h, _) => Some(*h),
            _ => None,
        };

        let mut machine = self.machine.lock();
        let effects = machine.handle(input);
        for effect in effects {
            self.execute(effect);
        }
        drop(machine);

        if let Some(h) = closed {
            self.sockets.lock().remove(&h);
        }
    }

    fn execute(&self, effect: Effect) {
        match effect {
            Effect::Open { handle, target } => {
                let socket = self.connector.open(handle, &target, self.inputs.clone());
                self.sockets.lock().insert(handle, socket);
            }
            Effect::Send { handle, frame } => {
                if let Err(e) = self.send_frame(handle, frame) {
                    tracing::warn!(%handle, error = %e, "Failed to send frame");
                }
            }
            Effect::Close { handle, code } => {
                if let Some(socket) = self.sockets.lock().remove(&handle) {
                    socket.close(code);
                }
            }
            Effect::ArmRetry { epoch, delay } => {
                let inputs = self.inputs.clone();
                let timer = tokio::spawn(async move {
                    tokio::time::sleep(delay).await;
                    let _ = inputs.send(Input::RetryElapsed(epoch));
                });
                if let Some(old) = self.retry_timer.lock().replace(timer) {
                    old.abort();
                }
            }
            Effect::CancelRetry => {
                if let Some(timer) = self.retry_timer.lock().take() {
                    timer.abort();
                }
            }
            Effect::Renew { user_id, timeout } => {
                let store = self.store.clone();
                let inputs = self.inputs.clone();
                tokio::spawn(async move {
                    let renew = renewal::renew(store.as_ref(), user_id);
                    let outcome = tokio::time::timeout(timeout, renew)
                        .await
                        .unwrap_or(Err(CredentialError::Timeout(timeout)));
                    let _ = inputs.send(Input::RenewalFinished(outcome));
                });
            }
            Effect::Status(connected) => {
                self.connected.send_replace(connected);
            }
            Effect::Surface(message) => {
                self.data.send_replace(Some(message));
            }
            Effect::Emit(event) => {
                let _ = self.events.send(event);
            }
        }
    }

    fn send_frame(&self, handle: HandleId, frame: String) -> Result<(), TransportError> {
        let sockets = self.sockets.lock();
        let socket = sockets
            .get(&handle)
            .ok_or(TransportError::UnknownHandle(handle.0))?;
        socket.send_text(frame)
    }
}

pub struct Channel {
    shared: Arc<Shared>,
    driver: JoinHandle<()>,
}

impl Channel {
    /// Mount a channel and start connecting. Must be called inside a tokio
    /// runtime.
    pub fn mount(
        params: ConnectParams,
        store: Arc<dyn CredentialStore>,
        connector: Arc<dyn Connector>,
    ) -> (Self, EventReceiver) {
        let (inputs, mut input_rx) = mpsc::unbounded_channel();
        let (events, event_rx) = mpsc::unbounded_channel();

        let shared = Arc::new(Shared {
            machine: Mutex::new(ConnectionMachine::new(params, store.clone())),
            sockets: Mutex::new(HashMap::new()),
            retry_timer: Mutex::new(None),
            connector,
            store,
            inputs,
            connected: watch::channel(false).0,
            data: watch::channel(None).0,
            events,
        });

        let driver = {
            let shared = shared.clone();
            tokio::spawn(async move {
                while let Some(input) = input_rx.recv().await {
                    shared.apply(input);
                }
            })
        };

        shared.apply(Input::Mount);
        (Self { shared, driver }, event_rx)
    }

    pub fn is_connected(&self) -> bool {
        *self.shared.connected.borrow()
    }

    /// Latest surfaced message.
    pub fn data(&self) -> Option<ChatMessage> {
        self.shared.data.borrow().clone()
    }

    pub fn watch_connected(&self) -> watch::Receiver<bool> {
        self.shared.connected.subscribe()
    }

    pub fn watch_data(&self) -> watch::Receiver<Option<ChatMessage>> {
        self.shared.data.subscribe()
    }

    /// Send a chat message on the current socket. Returns `false` if there is
    /// no open socket, credentials are missing, or the transport refused it.
    pub fn send(&self, message: &OutgoingMessage) -> bool {
        let prepared = self.shared.machine.lock().prepare_send(message);
        let Some((handle, frame)) = prepared else {
            return false;
        };
        match self.shared.send_frame(handle, frame) {
            Ok(()) => true,
            Err(e) => {
                tracing::warn!(%handle, error = %e, "Failed to send message");
                false
            }
        }
    }

    /// Replace the connection parameters. A live socket is kept; a channel
    /// with no live socket connects with the new parameters.
    pub fn reconfigure(&self, params: ConnectParams) {
        self.shared.apply(Input::Reconfigure(params));
    }

    /// Mount again after [`Self::unmount`].
    pub fn remount(&self) {
        self.shared.apply(Input::Mount);
    }

    /// Close the live socket and cancel pending retries. Callbacks that
    /// arrive afterwards are ignored.
    pub fn unmount(&self) {
        self.shared.apply(Input::Unmount);
    }

    pub fn params(&self) -> ConnectParams {
        self.shared.machine.lock().params().clone()
    }

    pub fn retry_attempt(&self) -> u32 {
        self.shared.machine.lock().retry_attempt()
    }
}

impl Drop for Channel {
    fn drop(&mut self) {
        self.shared.apply(Input::Unmount);
        self.driver.abort();
    }
}
