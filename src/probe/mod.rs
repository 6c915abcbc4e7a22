//! Host reachability checks, independent of pooling
//!
//! [`host_is_up`] is the async one-shot check exposed to callers.
//! [`reachable`] is its blocking counterpart, used by transports to fail fast
//! before a handshake that would otherwise wait out the kernel's SYN timeout.

use std::net::{SocketAddr, TcpStream as StdTcpStream, ToSocketAddrs};
use std::time::Duration;
use tokio::net::TcpStream;
use tracing::debug;

use crate::pool::{normalize_host, ConnectUri, ConnectionKind};
use crate::transport::TransportError;

/// Whether `host` accepts a TCP connection within `timeout`
///
/// `default_port` is used unless the host names its own (`host:port`).
/// Resolution failures, refusals and timeouts all count as unreachable.
pub async fn host_is_up(host: &str, default_port: u16, timeout: Duration) -> bool {
    let uri = ConnectUri::new(ConnectionKind::Tcp, normalize_host(host));
    let (name, port) = match uri.socket_target_or(default_port) {
        Ok(target) => target,
        Err(e) => {
            debug!(host = %host, error = %e, "Invalid host");
            return false;
        }
    };

    match tokio::time::timeout(timeout, TcpStream::connect((name.as_str(), port))).await {
        Ok(Ok(_stream)) => true,
        Ok(Err(e)) => {
            debug!(host = %name, port, error = %e, "Host unreachable");
            false
        }
        Err(_) => {
            debug!(host = %name, port, timeout_secs = timeout.as_secs_f64(), "Host probe timed out");
            false
        }
    }
}

/// Blocking check that the endpoint behind `uri` accepts TCP connections
///
/// Tries every resolved address, each bounded by `timeout`, and returns the
/// first one that answered.
pub fn reachable(uri: &ConnectUri, timeout: Duration) -> Result<SocketAddr, TransportError> {
    let (host, port) = uri.socket_target()?;
    let target = format!("{}:{}", host, port);

    let addrs: Vec<SocketAddr> = (host.as_str(), port)
        .to_socket_addrs()
        .map_err(|_| TransportError::Resolve(target.clone()))?
        .collect();
    if addrs.is_empty() {
        return Err(TransportError::Resolve(target));
    }

    let mut last_err = None;
    for addr in addrs {
        match StdTcpStream::connect_timeout(&addr, timeout) {
            Ok(_stream) => return Ok(addr),
            Err(e) => {
                debug!(target = %target, addr = %addr, error = %e, "Connect attempt failed");
                last_err = Some(e);
            }
        }
    }

    Err(TransportError::Connect {
        target,
        source: last_err.unwrap_or_else(|| std::io::ErrorKind::AddrNotAvailable.into()),
    })
}
