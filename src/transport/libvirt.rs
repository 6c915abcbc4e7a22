//! libvirt transport for `qemu+tcp` hosts
//!
//! Links are `virConnect` handles opened through the `virt` bindings. Keepalive
//! is libvirt's own protocol keepalive, driven by the default event loop, and
//! close notifications come from `virConnectRegisterCloseCallback`.
//!
//! libvirt invokes close callbacks from inside `virEventRunDefaultImpl` while
//! holding its own connection locks, so the native callback only queues the
//! notification. The queue is drained after each dispatch step and the
//! registered [`CloseCallback`]s run with no libvirt lock held.

use std::cell::RefCell;
use std::os::raw::{c_int, c_void};
use std::ptr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tracing::{debug, info};
use virt::connect::{Connect, ConnectAuth, ConnectCredential};
use virt::error::{Error as VirtError, ErrorNumber};
use virt::sys;

use super::{
    AuthResponder, CloseCallback, CloseReason, CredentialChallenge, CredentialType, Handle,
    Transport, TransportError,
};
use crate::config::TransportConfig;
use crate::pool::ConnectUri;
use crate::probe;

/// libvirt's default event implementation is process-wide
static EVENT_IMPL_REGISTERED: AtomicBool = AtomicBool::new(false);

/// Close notifications waiting for the end of the current dispatch step
static PENDING_CLOSES: Mutex<Vec<(Arc<CloseSlot>, CloseReason)>> = Mutex::new(Vec::new());

thread_local! {
    /// Answers for the credential callback of the `open_auth` running on this thread
    static AUTH_ANSWERS: RefCell<Vec<CredentialChallenge>> = const { RefCell::new(Vec::new()) };
}

/// Settings for [`LibvirtTransport`]
#[derive(Debug, Clone)]
pub struct LibvirtTransportConfig {
    /// Upper bound for the TCP reachability check made before each open
    pub connect_timeout: Duration,

    /// Period of the timer that bounds one event dispatch step
    pub event_tick: Duration,
}

impl Default for LibvirtTransportConfig {
    fn default() -> Self {
        Self {
            connect_timeout: Duration::from_secs(10),
            event_tick: Duration::from_millis(200),
        }
    }
}

impl From<&TransportConfig> for LibvirtTransportConfig {
    fn from(config: &TransportConfig) -> Self {
        Self {
            connect_timeout: Duration::from_secs(config.connect_timeout),
            event_tick: Duration::from_millis(config.event_tick_ms),
        }
    }
}

/// libvirt implementation of [`Transport`]
#[derive(Debug, Clone, Default)]
pub struct LibvirtTransport {
    config: LibvirtTransportConfig,
}

impl LibvirtTransport {
    pub fn new(config: LibvirtTransportConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &LibvirtTransportConfig {
        &self.config
    }

    /// Open any libvirt URI directly, without the reachability check
    pub fn open_uri(&self, uri: &str) -> Result<LibvirtHandle, TransportError> {
        let conn = Connect::open(Some(uri)).map_err(|e| open_error(uri, e))?;
        debug!(uri = %uri, "libvirt connection opened");
        Ok(LibvirtHandle::new(uri, conn))
    }
}

impl Transport for LibvirtTransport {
    type Handle = LibvirtHandle;

    fn open(&self, uri: &ConnectUri) -> Result<LibvirtHandle, TransportError> {
        probe::reachable(uri, self.config.connect_timeout)?;
        self.open_uri(&uri.to_string())
    }

    fn open_auth(&self, uri: &ConnectUri, auth: &dyn AuthResponder) -> Result<LibvirtHandle, TransportError> {
        let supported: Vec<CredentialType> = auth
            .supported()
            .iter()
            .copied()
            .filter(|kind| matches!(kind, CredentialType::AuthName | CredentialType::Passphrase))
            .collect();
        if supported.is_empty() {
            return Err(TransportError::AuthFailed(
                "responder answers neither username nor passphrase challenges".to_string(),
            ));
        }

        probe::reachable(uri, self.config.connect_timeout)?;

        // The libvirt callback is a plain fn, so answers are prepared up front
        let mut answers: Vec<CredentialChallenge> = supported
            .iter()
            .map(|kind| CredentialChallenge::new(*kind, prompt_for(*kind)))
            .collect();
        auth.respond(&mut answers)?;

        let target = uri.to_string();
        AUTH_ANSWERS.with(|cell| *cell.borrow_mut() = answers);
        let mut connect_auth = ConnectAuth::new(
            vec![sys::VIR_CRED_AUTHNAME, sys::VIR_CRED_PASSPHRASE],
            fill_credentials,
        );
        let result = Connect::open_auth(Some(&target), &mut connect_auth, 0);
        AUTH_ANSWERS.with(|cell| cell.borrow_mut().clear());

        let conn = result.map_err(|e| open_error(&target, e))?;
        debug!(uri = %target, "libvirt connection opened with credentials");
        Ok(LibvirtHandle::new(&target, conn))
    }

    fn register_event_impl(&self) -> Result<(), TransportError> {
        if EVENT_IMPL_REGISTERED.swap(true, Ordering::AcqRel) {
            return Err(TransportError::AlreadyRegistered);
        }

        // SAFETY: plain FFI call without arguments
        if unsafe { sys::virEventRegisterDefaultImpl() } < 0 {
            EVENT_IMPL_REGISTERED.store(false, Ordering::Release);
            return Err(TransportError::Libvirt(
                "unable to register the default event implementation".to_string(),
            ));
        }

        // A periodic timer makes every dispatch step return within one tick
        let tick_ms = c_int::try_from(self.config.event_tick.as_millis()).unwrap_or(c_int::MAX);
        // SAFETY: the callback ignores its opaque pointer, which is null and never freed
        if unsafe { sys::virEventAddTimeout(tick_ms, Some(on_event_tick), ptr::null_mut(), None) } < 0 {
            return Err(TransportError::Libvirt("unable to add the event tick timer".to_string()));
        }

        info!(tick_ms, "Registered libvirt default event implementation");
        Ok(())
    }

    fn run_event_impl(&self) -> Result<(), TransportError> {
        if !EVENT_IMPL_REGISTERED.load(Ordering::Acquire) {
            return Err(TransportError::NotRegistered);
        }

        // SAFETY: plain FFI call; the default implementation is registered
        if unsafe { sys::virEventRunDefaultImpl() } < 0 {
            return Err(TransportError::Libvirt("event loop iteration failed".to_string()));
        }

        let pending = std::mem::take(&mut *PENDING_CLOSES.lock());
        for (slot, reason) in pending {
            let callback = slot.callback.lock().take();
            if let Some(callback) = callback {
                callback(reason);
            }
        }
        Ok(())
    }
}

/// Registered close callback; emptied when unregistered or fired
struct CloseSlot {
    callback: Mutex<Option<CloseCallback>>,
}

unsafe extern "C" fn on_connection_close(_conn: sys::virConnectPtr, reason: c_int, opaque: *mut c_void) {
    // SAFETY: `opaque` is the `Box<Arc<CloseSlot>>` leaked in
    // `register_close_callback`; libvirt frees it through `release_close_slot`
    // only after the callback can no longer run.
    let slot = unsafe { &*(opaque as *const Arc<CloseSlot>) };
    PENDING_CLOSES.lock().push((Arc::clone(slot), CloseReason::from_code(reason)));
}

unsafe extern "C" fn release_close_slot(opaque: *mut c_void) {
    // SAFETY: called once by libvirt for the pointer handed over at registration
    drop(unsafe { Box::from_raw(opaque as *mut Arc<CloseSlot>) });
}

unsafe extern "C" fn on_event_tick(_timer: c_int, _opaque: *mut c_void) {}

#[allow(clippy::ptr_arg)]
fn fill_credentials(creds: &mut Vec<ConnectCredential>) {
    AUTH_ANSWERS.with(|answers| {
        let answers = answers.borrow();
        for cred in creds.iter_mut() {
            let kind = credential_type(cred.typed as i64);
            let Some(answer) = answers.iter().find(|answer| answer.kind == kind) else {
                continue;
            };
            cred.result = match (kind, answer.result.as_deref()) {
                (CredentialType::AuthName, None | Some("")) => Some(cred.def_result.clone()),
                (_, value) => value.map(str::to_string),
            };
        }
    });
}

fn credential_type(code: i64) -> CredentialType {
    if code == sys::VIR_CRED_AUTHNAME as i64 {
        CredentialType::AuthName
    } else if code == sys::VIR_CRED_PASSPHRASE as i64 {
        CredentialType::Passphrase
    } else {
        CredentialType::Other(code as i32)
    }
}

fn prompt_for(kind: CredentialType) -> &'static str {
    match kind {
        CredentialType::AuthName => "Username",
        CredentialType::Passphrase => "Password",
        CredentialType::Other(_) => "Credential",
    }
}

fn open_error(uri: &str, err: VirtError) -> TransportError {
    let auth = matches!(
        err.code(),
        ErrorNumber::AuthFailed | ErrorNumber::AuthCancelled | ErrorNumber::AuthUnavailable
    ) || err.to_string().contains("authentication failed");

    if auth {
        TransportError::AuthFailed(err.to_string())
    } else {
        TransportError::Libvirt(format!("{}: {}", uri, err))
    }
}

fn call_error(err: VirtError) -> TransportError {
    TransportError::Libvirt(err.to_string())
}

struct Link {
    uri: String,
    conn: Mutex<Option<Connect>>,
    close_slot: Mutex<Option<Arc<CloseSlot>>>,
}

/// Handle to one libvirt connection; clones share the connection
#[derive(Clone)]
pub struct LibvirtHandle {
    link: Arc<Link>,
}

impl LibvirtHandle {
    fn new(uri: &str, conn: Connect) -> Self {
        Self {
            link: Arc::new(Link {
                uri: uri.to_string(),
                conn: Mutex::new(Some(conn)),
                close_slot: Mutex::new(None),
            }),
        }
    }

    /// URI this connection was opened with
    pub fn uri(&self) -> &str {
        &self.link.uri
    }

    /// Run `f` against the underlying connection, for domain, pool and
    /// network queries
    pub fn with_connect<R>(&self, f: impl FnOnce(&Connect) -> R) -> Result<R, TransportError> {
        let conn = self.link.conn.lock();
        match conn.as_ref() {
            Some(conn) => Ok(f(conn)),
            None => Err(TransportError::Closed),
        }
    }

    /// Host name reported by the hypervisor
    pub fn hostname(&self) -> Result<String, TransportError> {
        self.with_connect(|conn| conn.get_hostname())?.map_err(call_error)
    }

    /// Whether two handles refer to the same connection
    pub fn same_link(&self, other: &LibvirtHandle) -> bool {
        Arc::ptr_eq(&self.link, &other.link)
    }
}

impl std::fmt::Debug for LibvirtHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LibvirtHandle")
            .field("uri", &self.link.uri)
            .field("open", &self.link.conn.lock().is_some())
            .finish()
    }
}

impl Handle for LibvirtHandle {
    fn is_alive(&self) -> Result<bool, TransportError> {
        let conn = self.link.conn.lock();
        match conn.as_ref() {
            Some(conn) => conn.is_alive().map_err(call_error),
            None => Ok(false),
        }
    }

    fn set_keepalive(&self, interval: Duration, max_missed: u32) -> Result<(), TransportError> {
        let interval = i32::try_from(interval.as_secs()).unwrap_or(i32::MAX);
        let supported = self.with_connect(|conn| conn.set_keep_alive(interval, max_missed))?;
        match supported.map_err(call_error)? {
            // The remote side does not speak the keepalive protocol
            1 => Err(TransportError::Unsupported),
            _ => Ok(()),
        }
    }

    fn register_close_callback(&self, callback: CloseCallback) -> Result<(), TransportError> {
        let conn = self.link.conn.lock();
        let conn = conn.as_ref().ok_or(TransportError::Closed)?;

        let slot = Arc::new(CloseSlot {
            callback: Mutex::new(Some(callback)),
        });
        let opaque = Box::into_raw(Box::new(Arc::clone(&slot))) as *mut c_void;

        // SAFETY: the connection pointer is valid while `conn` is held, and
        // ownership of `opaque` passes to libvirt, which frees it through
        // `release_close_slot`.
        let ret = unsafe {
            sys::virConnectRegisterCloseCallback(
                conn.as_ptr(),
                Some(on_connection_close),
                opaque,
                Some(release_close_slot),
            )
        };
        if ret < 0 {
            // SAFETY: libvirt did not take ownership after a failed registration
            drop(unsafe { Box::from_raw(opaque as *mut Arc<CloseSlot>) });
            return Err(TransportError::Libvirt(format!(
                "{}: unable to register close callback",
                self.link.uri
            )));
        }

        *self.link.close_slot.lock() = Some(slot);
        Ok(())
    }

    fn unregister_close_callback(&self) -> Result<(), TransportError> {
        let Some(slot) = self.link.close_slot.lock().take() else {
            return Ok(());
        };
        slot.callback.lock().take();

        let conn = self.link.conn.lock();
        let Some(conn) = conn.as_ref() else {
            return Ok(());
        };

        // SAFETY: the connection pointer is valid while `conn` is held
        let ret = unsafe {
            sys::virConnectUnregisterCloseCallback(conn.as_ptr(), Some(on_connection_close))
        };
        if ret < 0 {
            return Err(TransportError::Libvirt(format!(
                "{}: unable to unregister close callback",
                self.link.uri
            )));
        }
        Ok(())
    }

    fn close(&self) -> Result<(), TransportError> {
        if let Some(slot) = self.link.close_slot.lock().as_ref() {
            slot.callback.lock().take();
        }
        if let Err(e) = self.unregister_close_callback() {
            debug!(uri = %self.link.uri, error = %e, "Close callback not unregistered");
        }

        let Some(mut conn) = self.link.conn.lock().take() else {
            return Ok(());
        };
        conn.close().map_err(call_error)?;
        Ok(())
    }
}
