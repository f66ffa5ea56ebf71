//! Transport connection manager
//!
//! Owns the single websocket connection to the chat server. A supervisor task
//! connects, authenticates, re-joins remembered rooms and then pumps frames in
//! both directions. When the connection drops it retries with exponential
//! backoff and full jitter until [`ConnectionManager::disconnect`] is called or
//! the server rejects the token.
//!
//! All events, including synthetic connection-state changes, are dispatched
//! from the supervisor task one at a time, in arrival order.

use crate::config::ClientConfig;
use crate::error::TransportError;
use crate::models::*;
use futures::{SinkExt, StreamExt};
use parking_lot::{Mutex, RwLock};
use rand::Rng;
use std::collections::BTreeSet;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio_tungstenite::{connect_async, tungstenite::Message as WsMessage};
use tracing::{debug, error, info, warn};

const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(10);

pub const AUTHENTICATED: &str = "authenticated";
pub const AUTH_ERROR: &str = "auth-error";

#[derive(Debug, Clone, PartialEq)]
pub enum TransportEvent {
    StateChanged(ConnectionState),
    /// The server refused the token. The manager has stopped retrying.
    AuthFailed(String),
    Frame(RawEvent),
}

pub type EventHandler = Arc<dyn Fn(&TransportEvent) + Send + Sync>;

/// The event-stream seam the chat session talks to.
pub trait Transport: Send + Sync {
    /// Queue an event for the server. Fails with `NotConnected` unless the
    /// connection is up; callers decide whether that matters.
    fn emit(&self, event: OutboundEvent) -> Result<(), TransportError>;

    fn state(&self) -> ConnectionState;

    fn watch_state(&self) -> watch::Receiver<ConnectionState>;

    fn on_event(&self, handler: EventHandler);

    /// Remember a room and join it now if connected. Remembered rooms are
    /// re-joined after every reconnect.
    fn join_room(&self, room_id: &str);

    fn leave_room(&self, room_id: &str);
}

// ============================================================================
// Backoff
// ============================================================================

#[derive(Debug, Clone)]
pub struct Backoff {
    base: Duration,
    cap: Duration,
    attempt: u32,
}

impl Backoff {
    pub fn new(base: Duration, cap: Duration) -> Self {
        Self {
            base,
            cap,
            attempt: 0,
        }
    }

    /// Upper bound of the delay for a given attempt: `min(cap, base * 2^attempt)`.
    pub fn ceiling(&self, attempt: u32) -> Duration {
        let factor = 1u32.checked_shl(attempt.min(31)).unwrap_or(u32::MAX);
        self.base.saturating_mul(factor).min(self.cap)
    }

    /// Full jitter: uniform in `[0, ceiling]`.
    pub fn next_delay(&mut self) -> Duration {
        let ceiling = self.ceiling(self.attempt);
        self.attempt = self.attempt.saturating_add(1);
        let millis = ceiling.as_millis() as u64;
        Duration::from_millis(rand::thread_rng().gen_range(0..=millis))
    }

    pub fn attempt(&self) -> u32 {
        self.attempt
    }

    pub fn reset(&mut self) {
        self.attempt = 0;
    }
}

// ============================================================================
// Connection manager
// ============================================================================

enum SessionEnd {
    Dropped(String),
    AuthRejected(String),
}

struct Inner {
    ws_url: String,
    backoff_base: Duration,
    backoff_cap: Duration,
    state_tx: watch::Sender<ConnectionState>,
    handlers: RwLock<Vec<EventHandler>>,
    rooms: Mutex<BTreeSet<String>>,
    sender: Mutex<Option<mpsc::UnboundedSender<String>>>,
}

#[derive(Clone)]
pub struct ConnectionManager {
    inner: Arc<Inner>,
    supervisor: Arc<Mutex<Option<JoinHandle<()>>>>,
}

impl ConnectionManager {
    pub fn new(config: &ClientConfig) -> Self {
        Self::with_url(
            &config.ws_url(),
            config.sync.backoff_base(),
            config.sync.backoff_cap(),
        )
    }

    pub fn with_url(ws_url: &str, backoff_base: Duration, backoff_cap: Duration) -> Self {
        let (state_tx, _) = watch::channel(ConnectionState::Disconnected);
        Self {
            inner: Arc::new(Inner {
                ws_url: ws_url.to_string(),
                backoff_base,
                backoff_cap,
                state_tx,
                handlers: RwLock::new(Vec::new()),
                rooms: Mutex::new(BTreeSet::new()),
                sender: Mutex::new(None),
            }),
            supervisor: Arc::new(Mutex::new(None)),
        }
    }

    /// Start the connection. A no-op while a connection is up or being
    /// established. Must be called from within a tokio runtime.
    pub fn connect(&self, auth_token: &str) {
        let mut supervisor = self.supervisor.lock();
        if supervisor.as_ref().map_or(false, |h| !h.is_finished()) {
            debug!("connect() while already connected or connecting, ignoring");
            return;
        }

        self.inner.set_state(ConnectionState::Connecting);
        let inner = self.inner.clone();
        let token = auth_token.to_string();
        *supervisor = Some(tokio::spawn(async move { inner.supervise(token).await }));
    }

    /// Close the connection and stop reconnecting.
    pub fn disconnect(&self) {
        if let Some(handle) = self.supervisor.lock().take() {
            handle.abort();
        }
        *self.inner.sender.lock() = None;
        self.inner.set_state(ConnectionState::Disconnected);
        info!("Disconnected");
    }

    pub fn rooms(&self) -> Vec<String> {
        self.inner.rooms.lock().iter().cloned().collect()
    }
}

impl Transport for ConnectionManager {
    fn emit(&self, event: OutboundEvent) -> Result<(), TransportError> {
        self.inner.send(&event)
    }

    fn state(&self) -> ConnectionState {
        *self.inner.state_tx.borrow()
    }

    fn watch_state(&self) -> watch::Receiver<ConnectionState> {
        self.inner.state_tx.subscribe()
    }

    fn on_event(&self, handler: EventHandler) {
        self.inner.handlers.write().push(handler);
    }

    fn join_room(&self, room_id: &str) {
        let mut rooms = self.inner.rooms.lock();
        if rooms.insert(room_id.to_string()) {
            let event = OutboundEvent::UserJoinRoom {
                room_id: room_id.to_string(),
            };
            // Not connected: the room is joined on the next (re)connect.
            let _ = self.inner.send(&event);
        }
    }

    fn leave_room(&self, room_id: &str) {
        let mut rooms = self.inner.rooms.lock();
        if rooms.remove(room_id) {
            let event = OutboundEvent::UserLeaveRoom {
                room_id: room_id.to_string(),
            };
            let _ = self.inner.send(&event);
        }
    }
}

impl Inner {
    fn send(&self, event: &OutboundEvent) -> Result<(), TransportError> {
        let text = serde_json::to_string(event)
            .map_err(|e| TransportError::WebSocket(e.to_string()))?;
        match self.sender.lock().as_ref() {
            Some(tx) => tx.send(text).map_err(|_| TransportError::NotConnected),
            None => Err(TransportError::NotConnected),
        }
    }

    fn set_state(&self, state: ConnectionState) {
        let changed = self.state_tx.send_if_modified(|current| {
            if *current == state {
                false
            } else {
                *current = state;
                true
            }
        });
        if changed {
            debug!(?state, "Connection state changed");
            self.dispatch(&TransportEvent::StateChanged(state));
        }
    }

    fn dispatch(&self, event: &TransportEvent) {
        let handlers = self.handlers.read().clone();
        for handler in handlers.iter() {
            if catch_unwind(AssertUnwindSafe(|| handler(event))).is_err() {
                error!("Transport event handler panicked");
            }
        }
    }

    async fn supervise(self: Arc<Self>, token: String) {
        let mut backoff = Backoff::new(self.backoff_base, self.backoff_cap);

        loop {
            match self.session(&token, &mut backoff).await {
                SessionEnd::AuthRejected(reason) => {
                    error!(reason = %reason, "Server rejected authentication");
                    *self.sender.lock() = None;
                    self.set_state(ConnectionState::Disconnected);
                    self.dispatch(&TransportEvent::AuthFailed(reason));
                    return;
                }
                SessionEnd::Dropped(reason) => {
                    *self.sender.lock() = None;
                    warn!(reason = %reason, "Connection lost");
                }
            }

            self.set_state(ConnectionState::Reconnecting);
            let delay = backoff.next_delay();
            info!(
                attempt = backoff.attempt(),
                delay_ms = delay.as_millis() as u64,
                "Reconnecting"
            );
            tokio::time::sleep(delay).await;
        }
    }

    async fn session(&self, token: &str, backoff: &mut Backoff) -> SessionEnd {
        let (ws_stream, _) = match connect_async(self.ws_url.as_str()).await {
            Ok(conn) => conn,
            Err(e) => return SessionEnd::Dropped(e.to_string()),
        };
        let (mut write, mut read) = ws_stream.split();

        // Authenticate
        let auth = OutboundEvent::Authenticate {
            token: token.to_string(),
        };
        let auth_text = match serde_json::to_string(&auth) {
            Ok(text) => text,
            Err(e) => return SessionEnd::Dropped(e.to_string()),
        };
        if let Err(e) = write.send(WsMessage::Text(auth_text)).await {
            return SessionEnd::Dropped(e.to_string());
        }

        let mut early_frames = Vec::new();
        let handshake = async {
            while let Some(msg) = read.next().await {
                match msg {
                    Ok(WsMessage::Text(text)) => match serde_json::from_str::<RawEvent>(&text) {
                        Ok(raw) if raw.name == AUTHENTICATED => return None,
                        Ok(raw) if raw.name == AUTH_ERROR => {
                            let reason = raw.payload["reason"]
                                .as_str()
                                .unwrap_or("unauthorized")
                                .to_string();
                            return Some(SessionEnd::AuthRejected(reason));
                        }
                        Ok(raw) => early_frames.push(raw),
                        Err(e) => warn!(error = %e, "Unparseable frame during handshake"),
                    },
                    Ok(WsMessage::Close(_)) => {
                        return Some(SessionEnd::Dropped("closed during handshake".into()))
                    }
                    Err(e) => return Some(SessionEnd::Dropped(e.to_string())),
                    _ => {}
                }
            }
            Some(SessionEnd::Dropped("stream ended during handshake".into()))
        };
        match tokio::time::timeout(HANDSHAKE_TIMEOUT, handshake).await {
            Ok(None) => {}
            Ok(Some(end)) => return end,
            Err(_) => return SessionEnd::Dropped("handshake timed out".into()),
        }

        // Re-join rooms and open the outbound queue atomically with respect
        // to join_room(), so no room is missed.
        let (tx, mut rx) = mpsc::unbounded_channel::<String>();
        {
            let rooms = self.rooms.lock();
            for room in rooms.iter() {
                let join = OutboundEvent::UserJoinRoom {
                    room_id: room.clone(),
                };
                if let Ok(text) = serde_json::to_string(&join) {
                    let _ = tx.send(text);
                }
            }
            *self.sender.lock() = Some(tx);
        }
        while let Ok(text) = rx.try_recv() {
            if let Err(e) = write.send(WsMessage::Text(text)).await {
                return SessionEnd::Dropped(e.to_string());
            }
        }

        backoff.reset();
        self.set_state(ConnectionState::Connected);
        info!(url = %self.ws_url, "Connected");

        for raw in early_frames {
            self.dispatch(&TransportEvent::Frame(raw));
        }

        loop {
            tokio::select! {
                incoming = read.next() => match incoming {
                    Some(Ok(WsMessage::Text(text))) => {
                        match serde_json::from_str::<RawEvent>(&text) {
                            Ok(raw) => self.dispatch(&TransportEvent::Frame(raw)),
                            Err(e) => warn!(error = %e, "Unparseable frame dropped"),
                        }
                    }
                    Some(Ok(WsMessage::Close(_))) | None => {
                        return SessionEnd::Dropped("closed by server".into());
                    }
                    Some(Err(e)) => return SessionEnd::Dropped(e.to_string()),
                    Some(Ok(_)) => {}
                },
                outgoing = rx.recv() => match outgoing {
                    Some(text) => {
                        if let Err(e) = write.send(WsMessage::Text(text)).await {
                            return SessionEnd::Dropped(e.to_string());
                        }
                    }
                    None => return SessionEnd::Dropped("outbound queue closed".into()),
                },
            }
        }
    }
}
