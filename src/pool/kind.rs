//! Connection kinds and the URIs they produce

use std::fmt;
use std::str::FromStr;

use url::{Host, Url};

use super::connection::ConnectionError;
use crate::transport::TransportError;

/// Port libvirtd listens on for unencrypted TCP connections
pub const TCP_PORT: u16 = 16509;

/// Transport/auth scheme used to reach a hypervisor host
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ConnectionKind {
    /// `qemu+tcp://HOST/system`
    Tcp,
}

impl ConnectionKind {
    /// Numeric code used by older callers
    pub fn code(&self) -> i32 {
        match self {
            ConnectionKind::Tcp => 1,
        }
    }

    /// URI scheme for this kind
    pub fn scheme(&self) -> &'static str {
        match self {
            ConnectionKind::Tcp => "qemu+tcp",
        }
    }

    /// Management port used when the host carries none
    pub fn default_port(&self) -> u16 {
        match self {
            ConnectionKind::Tcp => TCP_PORT,
        }
    }

    /// Registry key for `host` under this kind
    ///
    /// Normalizes the name and drops an explicit port equal to the kind's
    /// default, so `h1` and `h1:16509` share one connection.
    pub fn canonical_host(&self, host: &str) -> String {
        let host = normalize_host(host);
        let suffix = format!(":{}", self.default_port());
        match host.strip_suffix(&suffix) {
            Some(name) if !name.is_empty() && (name.ends_with(']') || !name.contains(':')) => {
                name.to_string()
            }
            _ => host,
        }
    }
}

impl fmt::Display for ConnectionKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConnectionKind::Tcp => f.write_str("tcp"),
        }
    }
}

impl FromStr for ConnectionKind {
    type Err = ConnectionError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "tcp" | "qemu+tcp" | "1" => Ok(ConnectionKind::Tcp),
            _ => Err(ConnectionError::InvalidKind(s.to_string())),
        }
    }
}

impl TryFrom<i32> for ConnectionKind {
    type Error = ConnectionError;

    fn try_from(code: i32) -> Result<Self, Self::Error> {
        match code {
            1 => Ok(ConnectionKind::Tcp),
            other => Err(ConnectionError::InvalidKind(other.to_string())),
        }
    }
}

/// Canonical text form of a host name used as the registry key
pub fn normalize_host(host: &str) -> String {
    host.trim().trim_end_matches('.').to_ascii_lowercase()
}

/// Address of one hypervisor endpoint under one kind
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ConnectUri {
    pub kind: ConnectionKind,
    pub host: String,
}

impl ConnectUri {
    pub fn new(kind: ConnectionKind, host: impl Into<String>) -> Self {
        Self {
            kind,
            host: host.into(),
        }
    }

    /// Host and port to open a socket to, using the kind's management port
    /// when the host does not name one
    pub fn socket_target(&self) -> Result<(String, u16), TransportError> {
        self.socket_target_or(self.kind.default_port())
    }

    /// Host and port to open a socket to, falling back to `default_port`
    pub fn socket_target_or(&self, default_port: u16) -> Result<(String, u16), TransportError> {
        let uri = self.to_string();
        let url = Url::parse(&uri).map_err(|e| TransportError::InvalidUri(format!("{}: {}", uri, e)))?;

        let host = match url.host() {
            Some(Host::Domain(name)) if !name.is_empty() => name.to_string(),
            Some(Host::Ipv4(addr)) => addr.to_string(),
            Some(Host::Ipv6(addr)) => addr.to_string(),
            _ => return Err(TransportError::InvalidUri(format!("{}: missing host", uri))),
        };

        Ok((host, url.port().unwrap_or(default_port)))
    }
}

impl fmt::Display for ConnectUri {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}://{}/system", self.kind.scheme(), self.host)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_kind() {
        assert_eq!("tcp".parse::<ConnectionKind>().unwrap(), ConnectionKind::Tcp);
        assert_eq!(" TCP ".parse::<ConnectionKind>().unwrap(), ConnectionKind::Tcp);
        assert_eq!("1".parse::<ConnectionKind>().unwrap(), ConnectionKind::Tcp);
        assert_eq!(ConnectionKind::try_from(1).unwrap(), ConnectionKind::Tcp);

        let err = "ssh".parse::<ConnectionKind>().unwrap_err();
        assert_eq!(err.to_string(), "\"ssh\" is not a valid connection type");
        assert!(ConnectionKind::try_from(7).is_err());
    }

    #[test]
    fn test_normalize_host() {
        assert_eq!(normalize_host("  KVM-01.Example.COM. "), "kvm-01.example.com");
        assert_eq!(normalize_host("10.0.0.5"), "10.0.0.5");
    }

    #[test]
    fn test_canonical_host_drops_default_port() {
        let kind = ConnectionKind::Tcp;
        assert_eq!(kind.canonical_host("H1:16509"), "h1");
        assert_eq!(kind.canonical_host("h1"), "h1");
        assert_eq!(kind.canonical_host("h1:16510"), "h1:16510");
        assert_eq!(kind.canonical_host("[::1]:16509"), "[::1]");
        assert_eq!(kind.canonical_host("10.0.0.5:16509"), "10.0.0.5");
        assert_eq!(kind.canonical_host(":16509"), ":16509");
    }

    #[test]
    fn test_uri_display() {
        let uri = ConnectUri::new(ConnectionKind::Tcp, "h1");
        assert_eq!(uri.to_string(), "qemu+tcp://h1/system");
    }

    #[test]
    fn test_socket_target() {
        let uri = ConnectUri::new(ConnectionKind::Tcp, "h1");
        assert_eq!(uri.socket_target().unwrap(), ("h1".to_string(), TCP_PORT));

        let uri = ConnectUri::new(ConnectionKind::Tcp, "127.0.0.1:16510");
        assert_eq!(uri.socket_target().unwrap(), ("127.0.0.1".to_string(), 16510));

        let uri = ConnectUri::new(ConnectionKind::Tcp, "[::1]:2000");
        assert_eq!(uri.socket_target().unwrap(), ("::1".to_string(), 2000));

        let uri = ConnectUri::new(ConnectionKind::Tcp, "h2");
        assert_eq!(uri.socket_target_or(22).unwrap(), ("h2".to_string(), 22));

        let uri = ConnectUri::new(ConnectionKind::Tcp, "");
        assert!(uri.socket_target().is_err());
    }
}
