//! Scripted in-memory transport for unit tests

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::Duration;

use super::{
    AuthResponder, CloseCallback, CloseReason, CredentialChallenge, CredentialType, Handle,
    Transport, TransportError,
};
use crate::pool::ConnectUri;

#[derive(Default)]
struct MockState {
    unreachable: AtomicBool,
    keepalive_fails: AtomicBool,
    dispatch_fails: AtomicBool,
    no_unregister: AtomicBool,
    registered: AtomicBool,
    /// (username, passphrase) the host insists on, if any
    required: Mutex<Option<(String, String)>>,
    open_delay: Mutex<Duration>,
    opens: AtomicUsize,
    auth_opens: AtomicUsize,
    dispatches: AtomicUsize,
    handles: Mutex<Vec<MockHandle>>,
}

#[derive(Clone, Default)]
pub(crate) struct MockTransport {
    state: Arc<MockState>,
}

impl MockTransport {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    pub(crate) fn set_unreachable(&self, unreachable: bool) {
        self.state.unreachable.store(unreachable, Ordering::SeqCst);
    }

    pub(crate) fn require_auth(&self, username: &str, passphrase: &str) {
        *self.state.required.lock().unwrap() = Some((username.to_string(), passphrase.to_string()));
    }

    pub(crate) fn set_open_delay(&self, delay: Duration) {
        *self.state.open_delay.lock().unwrap() = delay;
    }

    pub(crate) fn set_keepalive_fails(&self, fails: bool) {
        self.state.keepalive_fails.store(fails, Ordering::SeqCst);
    }

    pub(crate) fn set_unregister_supported(&self, supported: bool) {
        self.state.no_unregister.store(!supported, Ordering::SeqCst);
    }

    pub(crate) fn set_dispatch_fails(&self, fails: bool) {
        self.state.dispatch_fails.store(fails, Ordering::SeqCst);
    }

    pub(crate) fn opens(&self) -> usize {
        self.state.opens.load(Ordering::SeqCst)
    }

    pub(crate) fn auth_opens(&self) -> usize {
        self.state.auth_opens.load(Ordering::SeqCst)
    }

    pub(crate) fn dispatches(&self) -> usize {
        self.state.dispatches.load(Ordering::SeqCst)
    }

    fn establish(&self) -> Result<MockHandle, TransportError> {
        let delay = *self.state.open_delay.lock().unwrap();
        if !delay.is_zero() {
            thread::sleep(delay);
        }

        if self.state.unreachable.load(Ordering::SeqCst) {
            return Err(TransportError::Connect {
                target: "mock".to_string(),
                source: std::io::Error::from(std::io::ErrorKind::ConnectionRefused),
            });
        }

        let mut handles = self.state.handles.lock().unwrap();
        let handle = MockHandle {
            link: Arc::new(MockLink {
                id: handles.len() + 1,
                alive: AtomicBool::new(true),
                keepalive_fails: self.state.keepalive_fails.load(Ordering::SeqCst),
                no_unregister: self.state.no_unregister.load(Ordering::SeqCst),
                ..Default::default()
            }),
        };
        handles.push(handle.clone());
        Ok(handle)
    }
}

impl Transport for MockTransport {
    type Handle = MockHandle;

    fn open(&self, _uri: &ConnectUri) -> Result<MockHandle, TransportError> {
        self.state.opens.fetch_add(1, Ordering::SeqCst);
        if self.state.required.lock().unwrap().is_some() {
            return Err(TransportError::AuthFailed("authentication required".to_string()));
        }
        self.establish()
    }

    fn open_auth(
        &self,
        _uri: &ConnectUri,
        auth: &dyn AuthResponder,
    ) -> Result<MockHandle, TransportError> {
        self.state.auth_opens.fetch_add(1, Ordering::SeqCst);

        let mut challenges = vec![
            CredentialChallenge::new(CredentialType::AuthName, "Username"),
            CredentialChallenge::new(CredentialType::Passphrase, "Password"),
        ];
        auth.respond(&mut challenges)?;

        let expected = self.state.required.lock().unwrap().clone();
        if let Some((username, passphrase)) = expected {
            let given_user = challenges[0].result.as_deref().unwrap_or_default();
            let given_pass = challenges[1].result.as_deref().unwrap_or_default();
            if given_user != username || given_pass != passphrase {
                return Err(TransportError::AuthFailed("bad credentials".to_string()));
            }
        }

        self.establish()
    }

    fn register_event_impl(&self) -> Result<(), TransportError> {
        if self.state.registered.swap(true, Ordering::SeqCst) {
            return Err(TransportError::AlreadyRegistered);
        }
        Ok(())
    }

    fn run_event_impl(&self) -> Result<(), TransportError> {
        if !self.state.registered.load(Ordering::SeqCst) {
            return Err(TransportError::NotRegistered);
        }
        self.state.dispatches.fetch_add(1, Ordering::SeqCst);
        if self.state.dispatch_fails.load(Ordering::SeqCst) {
            return Err(TransportError::Io(std::io::Error::other("dispatch failed")));
        }
        thread::sleep(Duration::from_millis(5));
        Ok(())
    }
}

#[derive(Default)]
struct MockLink {
    id: usize,
    alive: AtomicBool,
    probe_fails: AtomicBool,
    keepalive_fails: bool,
    no_unregister: bool,
    keepalive: Mutex<Option<(Duration, u32)>>,
    callback: Mutex<Option<CloseCallback>>,
    closed_by_client: AtomicBool,
    unregistered: AtomicBool,
}

#[derive(Clone)]
pub(crate) struct MockHandle {
    link: Arc<MockLink>,
}

impl MockHandle {
    pub(crate) fn id(&self) -> usize {
        self.link.id
    }

    /// Simulate the transport dropping the link and notifying its owner
    pub(crate) fn fire_close(&self, reason: CloseReason) {
        self.link.alive.store(false, Ordering::SeqCst);
        let callback = self.link.callback.lock().unwrap().take();
        if let Some(callback) = callback {
            callback(reason);
        }
    }

    /// Kill the link without delivering a notification
    pub(crate) fn kill(&self) {
        self.link.alive.store(false, Ordering::SeqCst);
    }

    pub(crate) fn set_probe_fails(&self, fails: bool) {
        self.link.probe_fails.store(fails, Ordering::SeqCst);
    }

    pub(crate) fn keepalive(&self) -> Option<(Duration, u32)> {
        *self.link.keepalive.lock().unwrap()
    }

    pub(crate) fn has_callback(&self) -> bool {
        self.link.callback.lock().unwrap().is_some()
    }

    pub(crate) fn closed_by_client(&self) -> bool {
        self.link.closed_by_client.load(Ordering::SeqCst)
    }

    pub(crate) fn unregistered(&self) -> bool {
        self.link.unregistered.load(Ordering::SeqCst)
    }
}

impl std::fmt::Debug for MockHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MockHandle").field("id", &self.link.id).finish()
    }
}

impl Handle for MockHandle {
    fn is_alive(&self) -> Result<bool, TransportError> {
        if self.link.probe_fails.load(Ordering::SeqCst) {
            return Err(TransportError::ProbeTimeout);
        }
        Ok(self.link.alive.load(Ordering::SeqCst))
    }

    fn set_keepalive(&self, interval: Duration, max_missed: u32) -> Result<(), TransportError> {
        if self.link.keepalive_fails {
            return Err(TransportError::Unsupported);
        }
        *self.link.keepalive.lock().unwrap() = Some((interval, max_missed));
        Ok(())
    }

    fn register_close_callback(&self, callback: CloseCallback) -> Result<(), TransportError> {
        *self.link.callback.lock().unwrap() = Some(callback);
        Ok(())
    }

    fn unregister_close_callback(&self) -> Result<(), TransportError> {
        if self.link.no_unregister {
            return Err(TransportError::Unsupported);
        }
        self.link.unregistered.store(true, Ordering::SeqCst);
        self.link.callback.lock().unwrap().take();
        Ok(())
    }

    fn close(&self) -> Result<(), TransportError> {
        self.link.alive.store(false, Ordering::SeqCst);
        self.link.closed_by_client.store(true, Ordering::SeqCst);
        self.link.callback.lock().unwrap().take();
        Ok(())
    }
}
