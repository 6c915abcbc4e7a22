use anyhow::{Context, Result};
use std::sync::{Arc, Mutex, PoisonError};
use tracing::info;

use crate::config::Config;
use crate::pool::{ConnectionInfo, ConnectionKind, ConnectionPool, PoolConfig, PoolStats};
use crate::pump::EventPump;
use crate::transport::Transport;
#[cfg(feature = "libvirt")]
use crate::transport::LibvirtTransport;

/// Composition root shared by every caller in the process
///
/// Built once at startup: it owns the transport's event pump and the single
/// connection pool. Clones share both. Call [`Core::shutdown`] before exit to
/// stop the pump and close every connection.
pub struct Core<T: Transport> {
    pub config: Arc<Config>,
    pub pool: Arc<ConnectionPool<T>>,
    pump: Arc<Mutex<EventPump>>,
}

impl<T: Transport> std::fmt::Debug for Core<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Core")
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

impl<T: Transport> Clone for Core<T> {
    fn clone(&self) -> Self {
        Self {
            config: Arc::clone(&self.config),
            pool: Arc::clone(&self.pool),
            pump: Arc::clone(&self.pump),
        }
    }
}

#[cfg(feature = "libvirt")]
impl Core<LibvirtTransport> {
    /// Build the core on libvirt
    ///
    /// libvirt's event loop is process-wide, so only one such core can exist
    /// per process; a second call fails while registering the event loop.
    pub fn new(config: Config) -> Result<Self> {
        let transport = Arc::new(LibvirtTransport::new((&config.transport).into()));
        Self::with_transport(config, transport)
    }
}

impl<T: Transport> Core<T> {
    /// Build the core on any transport
    pub fn with_transport(config: Config, transport: Arc<T>) -> Result<Self> {
        config.validate().context("Invalid configuration")?;

        let pump = EventPump::start(Arc::clone(&transport)).context("Failed to start event pump")?;

        let pool_config = PoolConfig::from(&config);
        info!(
            keepalive_interval = pool_config.keepalive.interval,
            keepalive_count = pool_config.keepalive.count,
            "Connection pool ready"
        );
        let pool = Arc::new(ConnectionPool::new(transport, pool_config));

        Ok(Self {
            config: Arc::new(config),
            pool,
            pump: Arc::new(Mutex::new(pump)),
        })
    }

    /// Get a live handle from async code without blocking the runtime
    pub async fn get_connection(&self, host: &str, kind: ConnectionKind) -> Result<T::Handle> {
        let pool = Arc::clone(&self.pool);
        let host = host.to_string();
        let handle = tokio::task::spawn_blocking(move || pool.get_connection(&host, kind))
            .await
            .context("Connection task failed")??;
        Ok(handle)
    }

    /// Whether `host` accepts TCP connections on its management port
    pub async fn host_is_up(&self, host: &str) -> bool {
        self.pool.host_is_up(host).await
    }

    pub fn stats(&self) -> PoolStats {
        self.pool.stats()
    }

    pub fn connections(&self) -> Vec<ConnectionInfo> {
        self.pool.connections()
    }

    /// Whether close notifications are still being delivered
    pub fn event_pump_running(&self) -> bool {
        self.pump().is_running()
    }

    /// Stop the event pump and close every connection
    pub fn shutdown(&self) {
        self.pump().stop();
        self.pool.close_all();
        info!("Core shut down");
    }

    fn pump(&self) -> std::sync::MutexGuard<'_, EventPump> {
        self.pump.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pool::ConnectionState;
    use crate::transport::mock::MockTransport;

    #[tokio::test]
    async fn test_core_lifecycle() {
        let transport = MockTransport::new();
        let core = Core::with_transport(Config::default(), Arc::new(transport.clone())).unwrap();
        assert!(core.event_pump_running());

        let handle = core.get_connection("h1", ConnectionKind::Tcp).await.unwrap();
        let again = core.get_connection("H1", ConnectionKind::Tcp).await.unwrap();
        assert_eq!(handle.id(), again.id());
        assert_eq!(core.stats().connected, 1);

        core.shutdown();

        assert!(!core.event_pump_running());
        assert!(handle.closed_by_client());
        assert_eq!(core.connections()[0].state, ConnectionState::Disconnected);
    }

    #[tokio::test]
    async fn test_core_reports_connect_errors() {
        let transport = MockTransport::new();
        transport.set_unreachable(true);
        let core = Core::with_transport(Config::default(), Arc::new(transport)).unwrap();

        let err = core.get_connection("h1", ConnectionKind::Tcp).await.unwrap_err();
        assert!(err.to_string().starts_with("Connection Failed: "));

        core.shutdown();
    }

    #[test]
    fn test_core_rejects_invalid_config() {
        let mut config = Config::default();
        config.probe.timeout = 0;
        assert!(Core::with_transport(config, Arc::new(MockTransport::new())).is_err());
    }

    #[test]
    fn test_clones_share_the_pump() {
        let transport = Arc::new(MockTransport::new());
        let core = Core::with_transport(Config::default(), Arc::clone(&transport)).unwrap();
        let clone = core.clone();

        // One transport, one pump: building a second core on it is refused
        assert!(Core::with_transport(Config::default(), transport).is_err());

        clone.shutdown();
        assert!(!core.event_pump_running());
    }

    #[cfg(feature = "libvirt")]
    #[test]
    fn test_second_libvirt_core_is_refused() {
        let mut config = Config::default();
        config.transport.event_tick_ms = 20;

        let first = Core::new(config.clone()).unwrap();
        assert!(first.event_pump_running());

        let err = Core::new(config.clone()).err().unwrap();
        assert!(format!("{:#}", err).contains("already registered"));
        assert!(first.event_pump_running());

        // The event loop stays registered for the life of the process
        first.shutdown();
        assert!(!first.event_pump_running());
        assert!(Core::new(config).is_err());
    }
}
