//! Process-wide registry of managed connections
//!
//! Maps each host to the connections opened for it, at most one per
//! [`ConnectionKind`]. Lookups run under the registry's read mode; inserts take
//! the write mode and search again before creating anything, since another
//! caller may have inserted the same pair while we waited for exclusive access.
//!
//! The registry lock is always released before touching a connection, so a
//! thread never holds the registry lock and a connection's state lock at the
//! same time.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tracing::{debug, info};

use super::connection::{ConnectSettings, Connection, ConnectionError, ConnectionInfo, ConnectionState};
use super::kind::{ConnectUri, ConnectionKind};
use super::rwlock::RwLock;
use crate::config::{Config, CredentialsConfig, KeepaliveConfig, ProbeConfig};
use crate::probe;
use crate::transport::Transport;

type Registry<T> = HashMap<String, Vec<Arc<Connection<T>>>>;

/// Configuration for connection pool behavior
#[derive(Debug, Clone, Default)]
pub struct PoolConfig {
    /// Applied to every (re)connect
    pub keepalive: KeepaliveConfig,

    /// Used by [`ConnectionPool::host_is_up`]
    pub probe: ProbeConfig,

    /// Offered when a host rejects an unauthenticated open
    pub credentials: CredentialsConfig,
}

impl From<&Config> for PoolConfig {
    fn from(config: &Config) -> Self {
        Self {
            keepalive: config.keepalive,
            probe: config.probe.clone(),
            credentials: config.credentials.clone(),
        }
    }
}

/// Statistics for the connection pool
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PoolStats {
    /// Hosts with at least one connection
    pub hosts: usize,

    /// Managed connections
    pub connections: usize,

    /// Connections currently in the connected state
    pub connected: usize,

    /// Connection objects created since startup
    pub total_created: u64,

    /// Physical connect attempts across all connections
    pub connect_attempts: u64,

    /// Successful reconnects across all connections
    pub reconnects: u64,
}

/// Connection pool shared by every caller in the process
pub struct ConnectionPool<T: Transport> {
    transport: Arc<T>,
    connections: RwLock<Registry<T>>,
    config: PoolConfig,
    total_created: AtomicU64,
}

impl<T: Transport> ConnectionPool<T> {
    /// Create an empty pool on top of `transport`
    pub fn new(transport: Arc<T>, config: PoolConfig) -> Self {
        Self {
            transport,
            connections: RwLock::new(HashMap::new()),
            config,
            total_created: AtomicU64::new(0),
        }
    }

    pub fn transport(&self) -> &Arc<T> {
        &self.transport
    }

    pub fn config(&self) -> &PoolConfig {
        &self.config
    }

    /// Get a live handle for `host`, creating or reconnecting as needed
    pub fn get_connection(&self, host: &str, kind: ConnectionKind) -> Result<T::Handle, ConnectionError> {
        let host = kind.canonical_host(host);

        if let Some(conn) = self.search(&host, kind) {
            if let Some(handle) = conn.live_handle() {
                return Ok(handle);
            }
            debug!(uri = %conn, "Connection not live, reconnecting");
            return conn.connect();
        }

        let mut registry = self.connections.write();
        let conn = match find(&registry, &host, kind) {
            Some(existing) => existing,
            None => {
                let conn = Connection::new(
                    ConnectUri::new(kind, host.clone()),
                    Arc::clone(&self.transport),
                    self.settings_for(&host),
                );
                registry.entry(host).or_default().push(Arc::clone(&conn));
                let total = self.total_created.fetch_add(1, Ordering::Relaxed) + 1;
                info!(uri = %conn, total_created = total, "Registered connection");
                conn
            }
        };
        self.connections.release(registry);

        conn.connect()
    }

    /// Like [`get_connection`](Self::get_connection) with the kind given as text
    pub fn get_connection_str(&self, host: &str, kind: &str) -> Result<T::Handle, ConnectionError> {
        let kind: ConnectionKind = kind.parse()?;
        self.get_connection(host, kind)
    }

    /// The managed connection for (`host`, `kind`), if one was ever requested
    pub fn connection(&self, host: &str, kind: ConnectionKind) -> Option<Arc<Connection<T>>> {
        self.search(&kind.canonical_host(host), kind)
    }

    /// Whether `host` accepts TCP connections on its management port
    pub async fn host_is_up(&self, host: &str) -> bool {
        probe::host_is_up(host, self.config.probe.port, self.config.probe.timeout_duration()).await
    }

    /// Snapshot of every managed connection
    pub fn connections(&self) -> Vec<ConnectionInfo> {
        self.snapshot().iter().map(|conn| conn.info()).collect()
    }

    /// Get pool statistics
    pub fn stats(&self) -> PoolStats {
        let hosts = self.connections.read().len();
        let snapshot = self.snapshot();

        PoolStats {
            hosts,
            connections: snapshot.len(),
            connected: snapshot
                .iter()
                .filter(|conn| conn.state() == ConnectionState::Connected)
                .count(),
            total_created: self.total_created.load(Ordering::Relaxed),
            connect_attempts: snapshot.iter().map(|conn| conn.connect_attempts()).sum(),
            reconnects: snapshot.iter().map(|conn| conn.reconnects()).sum(),
        }
    }

    /// Close every managed connection; the entries stay registered
    pub fn close_all(&self) {
        let snapshot = self.snapshot();
        for conn in &snapshot {
            conn.close();
        }
        info!(count = snapshot.len(), "Closed all connections");
    }

    fn search(&self, host: &str, kind: ConnectionKind) -> Option<Arc<Connection<T>>> {
        let registry = self.connections.read();
        find(&registry, host, kind)
    }

    fn snapshot(&self) -> Vec<Arc<Connection<T>>> {
        let registry = self.connections.read();
        registry.values().flatten().cloned().collect()
    }

    fn settings_for(&self, host: &str) -> ConnectSettings {
        ConnectSettings {
            keepalive: self.config.keepalive,
            credentials: self.config.credentials.for_host(host).cloned(),
        }
    }
}

fn find<T: Transport>(registry: &Registry<T>, host: &str, kind: ConnectionKind) -> Option<Arc<Connection<T>>> {
    registry
        .get(host)?
        .iter()
        .find(|conn| conn.kind() == kind)
        .cloned()
}
