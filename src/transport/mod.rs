//! Virtualization transport boundary
//!
//! The connection manager never talks to a hypervisor directly. Everything it
//! needs from the transport library is described by two traits:
//!
//! - [`Transport`]: opens links (plain or with a credential challenge) and owns
//!   the default event implementation that delivers close notifications
//! - [`Handle`]: one established link, with liveness, keepalive and close
//!   callback management
//!
//! With the `libvirt` feature, [`libvirt::LibvirtTransport`] implements both
//! on top of the `virt` bindings.

#[cfg(feature = "libvirt")]
pub mod libvirt;

#[cfg(test)]
pub(crate) mod mock;

use std::fmt;
use std::time::Duration;

use crate::pool::ConnectUri;

#[cfg(feature = "libvirt")]
pub use self::libvirt::{LibvirtHandle, LibvirtTransport, LibvirtTransportConfig};

/// Errors reported by a transport implementation
#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    #[error("authentication failed: {0}")]
    AuthFailed(String),

    #[error("unable to connect to {target}: {source}")]
    Connect {
        target: String,
        #[source]
        source: std::io::Error,
    },

    #[error("unable to resolve {0}")]
    Resolve(String),

    #[error("invalid connection URI: {0}")]
    InvalidUri(String),

    #[error("liveness probe timed out")]
    ProbeTimeout,

    #[error("event implementation is not registered")]
    NotRegistered,

    #[error("event implementation is already registered")]
    AlreadyRegistered,

    #[error("operation not supported by this transport")]
    Unsupported,

    #[error("connection is closed")]
    Closed,

    #[error("libvirt: {0}")]
    Libvirt(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Why a transport closed a link underneath its owner
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CloseReason {
    /// Misc I/O error
    Error,
    /// End-of-file from server
    Eof,
    /// Keepalive timer triggered
    Keepalive,
    /// Client requested it
    Client,
    /// Any code this crate does not know about
    Unknown(i32),
}

impl CloseReason {
    /// Map a raw close reason code as reported by libvirt-style transports
    pub fn from_code(code: i32) -> Self {
        match code {
            0 => CloseReason::Error,
            1 => CloseReason::Eof,
            2 => CloseReason::Keepalive,
            3 => CloseReason::Client,
            other => CloseReason::Unknown(other),
        }
    }

    pub fn description(&self) -> &'static str {
        match self {
            CloseReason::Error => "Misc I/O error",
            CloseReason::Eof => "End-of-file from server",
            CloseReason::Keepalive => "Keepalive timer triggered",
            CloseReason::Client => "Client requested it",
            CloseReason::Unknown(_) => "Unknown error",
        }
    }
}

impl fmt::Display for CloseReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.description())
    }
}

/// Callback fired by the event implementation when a link goes away
pub type CloseCallback = Box<dyn Fn(CloseReason) + Send + Sync>;

/// Kind of value a credential challenge asks for
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CredentialType {
    AuthName,
    Passphrase,
    Other(i32),
}

/// One question asked by the transport during an authenticated open
#[derive(Debug, Clone)]
pub struct CredentialChallenge {
    pub kind: CredentialType,
    pub prompt: String,
    /// Value suggested by the transport, if any
    pub default: String,
    /// Filled in by the responder
    pub result: Option<String>,
}

impl CredentialChallenge {
    pub fn new(kind: CredentialType, prompt: impl Into<String>) -> Self {
        Self {
            kind,
            prompt: prompt.into(),
            default: String::new(),
            result: None,
        }
    }
}

/// Answers credential challenges during [`Transport::open_auth`]
pub trait AuthResponder: Send + Sync {
    /// Credential kinds this responder is able to answer
    fn supported(&self) -> &[CredentialType];

    /// Fill in `result` for every challenge, or reject the whole set
    fn respond(&self, challenges: &mut [CredentialChallenge]) -> Result<(), TransportError>;
}

/// One established link to a host
///
/// Clones refer to the same link. Implementations must be safe to use from
/// the event pump thread and caller threads at the same time.
pub trait Handle: Clone + Send + Sync + 'static {
    /// Whether the link is currently usable
    fn is_alive(&self) -> Result<bool, TransportError>;

    /// Enable keepalive probing; an interval of zero disables it
    fn set_keepalive(&self, interval: Duration, max_missed: u32) -> Result<(), TransportError>;

    /// Register the callback fired once when the link closes
    fn register_close_callback(&self, callback: CloseCallback) -> Result<(), TransportError>;

    /// Drop a previously registered close callback
    fn unregister_close_callback(&self) -> Result<(), TransportError> {
        Err(TransportError::Unsupported)
    }

    /// Close the link; never fires the close callback
    fn close(&self) -> Result<(), TransportError>;
}

/// A virtualization transport library
pub trait Transport: Send + Sync + 'static {
    type Handle: Handle;

    /// Open a link without credentials
    fn open(&self, uri: &ConnectUri) -> Result<Self::Handle, TransportError>;

    /// Open a link, answering credential challenges through `auth`
    fn open_auth(
        &self,
        uri: &ConnectUri,
        auth: &dyn AuthResponder,
    ) -> Result<Self::Handle, TransportError>;

    /// Install the default event implementation; allowed once per transport
    fn register_event_impl(&self) -> Result<(), TransportError>;

    /// Run one blocking dispatch step of the default event implementation
    fn run_event_impl(&self) -> Result<(), TransportError>;
}
