//! A single managed link to one host under one connection kind
//!
//! A [`Connection`] outlives any number of physical links: when the transport
//! reports a close, or a liveness probe fails, the handle is dropped under the
//! connection's own state lock and the next [`Connection::connect`] opens a
//! fresh one in place.
//!
//! State transitions:
//! - `Disconnected -> Connecting -> Connected` on a successful connect
//! - `Connecting -> Disconnected` when opening fails
//! - `Connected -> Disconnected` on explicit close or a close notification

use std::fmt;
use std::sync::atomic::{AtomicU64, AtomicU8, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use tracing::{debug, info, warn};

use super::auth::CredentialResponder;
use super::kind::{ConnectUri, ConnectionKind};
use crate::config::{Credentials, KeepaliveConfig};
use crate::transport::{CloseReason, Handle, Transport, TransportError};

/// Error recorded by a connection and returned to pool callers
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ConnectionError {
    #[error("Connection Failed: {0}")]
    Transport(String),

    #[error("Authentication failed: {0}")]
    Auth(String),

    #[error("connection closed: {0}")]
    Closed(CloseReason),

    #[error("keepalive setup failed: {0}")]
    Keepalive(String),

    #[error("\"{0}\" is not a valid connection type")]
    InvalidKind(String),

    #[error("not connected")]
    NotConnected,
}

/// Lifecycle of a managed connection
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
}

impl ConnectionState {
    fn as_u8(self) -> u8 {
        match self {
            ConnectionState::Disconnected => 0,
            ConnectionState::Connecting => 1,
            ConnectionState::Connected => 2,
        }
    }

    fn from_u8(value: u8) -> Self {
        match value {
            1 => ConnectionState::Connecting,
            2 => ConnectionState::Connected,
            _ => ConnectionState::Disconnected,
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            ConnectionState::Disconnected => "disconnected",
            ConnectionState::Connecting => "connecting",
            ConnectionState::Connected => "connected",
        }
    }
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Settings applied on every (re)connect
#[derive(Debug, Clone, Default)]
pub struct ConnectSettings {
    pub keepalive: KeepaliveConfig,

    /// Offered once when the host rejects an unauthenticated open
    pub credentials: Option<Credentials>,
}

/// Point-in-time view of a connection
#[derive(Debug, Clone)]
pub struct ConnectionInfo {
    pub uri: String,
    pub host: String,
    pub kind: ConnectionKind,
    pub state: ConnectionState,
    pub last_error: Option<String>,
    pub connect_attempts: u64,
    pub reconnects: u64,
}

/// Everything guarded by the state lock
struct LinkState<H> {
    handle: Option<H>,
    last_error: Option<ConnectionError>,
    /// Bumped whenever the handle is replaced or dropped; close notifications
    /// carry the generation they were registered under
    generation: u64,
}

/// A managed, self-healing connection to one host
pub struct Connection<T: Transport> {
    uri: ConnectUri,
    transport: Arc<T>,
    settings: ConnectSettings,
    link: Mutex<LinkState<T::Handle>>,
    /// Mirror of the state, written only under `link` so it can be read
    /// while a connect attempt holds the lock
    state: AtomicU8,
    connect_attempts: AtomicU64,
    connects: AtomicU64,
    this: Weak<Self>,
}

impl<T: Transport> Connection<T> {
    /// Create a disconnected connection; nothing is opened until [`connect`](Self::connect)
    pub fn new(uri: ConnectUri, transport: Arc<T>, settings: ConnectSettings) -> Arc<Self> {
        Arc::new_cyclic(|this| Self {
            uri,
            transport,
            settings,
            link: Mutex::new(LinkState {
                handle: None,
                last_error: None,
                generation: 0,
            }),
            state: AtomicU8::new(ConnectionState::Disconnected.as_u8()),
            connect_attempts: AtomicU64::new(0),
            connects: AtomicU64::new(0),
            this: this.clone(),
        })
    }

    pub fn uri(&self) -> &ConnectUri {
        &self.uri
    }

    pub fn host(&self) -> &str {
        &self.uri.host
    }

    pub fn kind(&self) -> ConnectionKind {
        self.uri.kind
    }

    /// Current state, readable without waiting on an in-flight connect
    pub fn state(&self) -> ConnectionState {
        ConnectionState::from_u8(self.state.load(Ordering::Acquire))
    }

    /// Last recorded failure, if any
    pub fn last_error(&self) -> Option<ConnectionError> {
        self.lock().last_error.clone()
    }

    /// Number of times a physical link was attempted
    pub fn connect_attempts(&self) -> u64 {
        self.connect_attempts.load(Ordering::Relaxed)
    }

    /// Number of successful connects after the first one
    pub fn reconnects(&self) -> u64 {
        self.connects.load(Ordering::Relaxed).saturating_sub(1)
    }

    /// Whether a handle exists and its liveness probe succeeds
    pub fn is_live(&self) -> bool {
        let link = self.lock();
        link.handle.as_ref().is_some_and(|handle| self.probe(handle))
    }

    /// The current handle if it passes a liveness probe
    pub fn live_handle(&self) -> Option<T::Handle> {
        let link = self.lock();
        link.handle
            .as_ref()
            .filter(|handle| self.probe(handle))
            .cloned()
    }

    /// Make sure a live link exists, opening one if needed
    ///
    /// Returns the existing handle untouched when it is still alive. Failures
    /// are recorded in [`last_error`](Self::last_error) and leave the
    /// connection disconnected.
    pub fn connect(&self) -> Result<T::Handle, ConnectionError> {
        let mut link = self.lock();

        // Another caller may have reconnected while we waited for the lock
        if let Some(handle) = link.handle.as_ref() {
            if self.probe(handle) {
                return Ok(handle.clone());
            }
        }
        if let Some(stale) = link.handle.take() {
            debug!(uri = %self.uri, "Dropping dead link");
            link.generation += 1;
            let _ = stale.unregister_close_callback();
        }

        self.connect_attempts.fetch_add(1, Ordering::Relaxed);
        self.set_state(ConnectionState::Connecting);
        debug!(uri = %self.uri, "Connecting");

        let handle = match self.open() {
            Ok(handle) => handle,
            Err(err) => {
                warn!(uri = %self.uri, error = %err, "Connect failed");
                link.last_error = Some(err.clone());
                self.set_state(ConnectionState::Disconnected);
                return Err(err);
            }
        };

        link.generation += 1;
        link.last_error = None;

        let keepalive = self.settings.keepalive;
        if let Err(e) = handle.set_keepalive(keepalive.interval_duration(), keepalive.count) {
            // The link is still usable, it just won't detect silent failures
            warn!(uri = %self.uri, error = %e, "Keepalive not supported");
            link.last_error = Some(ConnectionError::Keepalive(e.to_string()));
        }

        let this = self.this.clone();
        let generation = link.generation;
        let callback = Box::new(move |reason: CloseReason| {
            if let Some(conn) = this.upgrade() {
                conn.on_close(generation, reason);
            }
        });
        if let Err(e) = handle.register_close_callback(callback) {
            debug!(uri = %self.uri, error = %e, "Close callback not registered");
        }

        link.handle = Some(handle.clone());
        self.set_state(ConnectionState::Connected);
        let connects = self.connects.fetch_add(1, Ordering::Relaxed) + 1;
        info!(uri = %self.uri, connects, "Connected");

        Ok(handle)
    }

    /// Close the link if it is live and forget any recorded error
    pub fn close(&self) {
        let mut link = self.lock();

        if let Some(handle) = link.handle.take() {
            link.generation += 1;
            if self.probe(&handle) {
                let _ = handle.unregister_close_callback();
                if let Err(e) = handle.close() {
                    debug!(uri = %self.uri, error = %e, "Ignoring close error");
                }
            }
        }

        link.last_error = None;
        self.set_state(ConnectionState::Disconnected);
        debug!(uri = %self.uri, "Closed");
    }

    /// Point-in-time view for status listings
    pub fn info(&self) -> ConnectionInfo {
        let last_error = self.last_error().map(|e| e.to_string());
        ConnectionInfo {
            uri: self.uri.to_string(),
            host: self.uri.host.clone(),
            kind: self.uri.kind,
            state: self.state(),
            last_error,
            connect_attempts: self.connect_attempts(),
            reconnects: self.reconnects(),
        }
    }

    /// Close notification delivered from the event pump thread
    fn on_close(&self, generation: u64, reason: CloseReason) {
        let mut link = self.lock();

        if link.generation != generation || link.handle.is_none() {
            debug!(uri = %self.uri, reason = %reason, "Ignoring close of a replaced link");
            return;
        }

        let err = ConnectionError::Closed(reason);
        warn!(uri = %self.uri, error = %err, "Connection lost");
        link.last_error = Some(err);
        link.handle = None;
        link.generation += 1;
        self.set_state(ConnectionState::Disconnected);
    }

    /// Open a link, retrying once with credentials if the host asks for them
    fn open(&self) -> Result<T::Handle, ConnectionError> {
        match self.transport.open(&self.uri) {
            Ok(handle) => Ok(handle),
            Err(TransportError::AuthFailed(reason)) => {
                let Some(credentials) = self.settings.credentials.as_ref() else {
                    return Err(ConnectionError::Auth(format!(
                        "{}; no credentials configured for {}",
                        reason, self.uri.host
                    )));
                };

                debug!(uri = %self.uri, user = %credentials.username, "Retrying with credentials");
                let responder = CredentialResponder::new(credentials);
                self.transport
                    .open_auth(&self.uri, &responder)
                    .map_err(|e| match e {
                        TransportError::AuthFailed(reason) => ConnectionError::Auth(reason),
                        other => ConnectionError::Transport(other.to_string()),
                    })
            }
            Err(e) => Err(ConnectionError::Transport(e.to_string())),
        }
    }

    fn probe(&self, handle: &T::Handle) -> bool {
        match handle.is_alive() {
            Ok(alive) => alive,
            Err(e) => {
                debug!(uri = %self.uri, error = %e, "Liveness probe failed");
                false
            }
        }
    }

    fn set_state(&self, state: ConnectionState) {
        self.state.store(state.as_u8(), Ordering::Release);
    }

    fn lock(&self) -> MutexGuard<'_, LinkState<T::Handle>> {
        self.link.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl<T: Transport> Drop for Connection<T> {
    fn drop(&mut self) {
        let link = self.link.get_mut().unwrap_or_else(PoisonError::into_inner);
        if let Some(handle) = link.handle.take() {
            if let Err(e) = handle.unregister_close_callback() {
                debug!(uri = %self.uri, error = %e, "Close callback not unregistered");
            }
        }
    }
}

impl<T: Transport> fmt::Display for Connection<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(&self.uri, f)
    }
}

impl<T: Transport> fmt::Debug for Connection<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "<Connection {}>", self.uri)
    }
}
