//! Background worker driving the transport's event implementation
//!
//! Keepalive and close notifications only fire while something runs the
//! transport's dispatch step, so one pump is started at process start.
//! Registration fails on a second start, which keeps the pump unique; for
//! libvirt the registration flag is process-wide, like libvirt's event loop.
//!
//! A dispatch fault ends the pump thread. It is logged, but no further close
//! notifications are delivered for the rest of the process; connections then
//! rely on liveness probes alone to notice dead links.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use tracing::{debug, error, info};

use crate::transport::{Transport, TransportError};

const THREAD_NAME: &str = "virt-event-pump";

/// Error types for starting the event pump
#[derive(Debug, thiserror::Error)]
pub enum PumpError {
    #[error("failed to register event implementation: {0}")]
    Register(#[source] TransportError),

    #[error("failed to spawn event pump thread: {0}")]
    Spawn(#[source] std::io::Error),
}

/// Handle to the running event pump thread
pub struct EventPump {
    shutdown: Arc<AtomicBool>,
    thread: Option<JoinHandle<()>>,
}

impl EventPump {
    /// Register the transport's default event implementation and start dispatching
    pub fn start<T: Transport>(transport: Arc<T>) -> Result<Self, PumpError> {
        transport.register_event_impl().map_err(PumpError::Register)?;

        let shutdown = Arc::new(AtomicBool::new(false));
        let stop = Arc::clone(&shutdown);
        let thread = thread::Builder::new()
            .name(THREAD_NAME.to_string())
            .spawn(move || run(transport, stop))
            .map_err(PumpError::Spawn)?;

        info!(thread = THREAD_NAME, "Event pump started");

        Ok(Self {
            shutdown,
            thread: Some(thread),
        })
    }

    /// Whether the dispatch loop is still running
    pub fn is_running(&self) -> bool {
        self.thread.as_ref().is_some_and(|thread| !thread.is_finished())
    }

    /// Ask the loop to exit after its current dispatch step and wait for it
    pub fn stop(&mut self) {
        self.shutdown.store(true, Ordering::Release);
        if let Some(thread) = self.thread.take() {
            if thread.join().is_err() {
                error!("Event pump thread panicked");
            }
            info!("Event pump stopped");
        }
    }
}

impl Drop for EventPump {
    fn drop(&mut self) {
        // Never block on drop; the thread notices the flag on its next step
        self.shutdown.store(true, Ordering::Release);
    }
}

fn run<T: Transport>(transport: Arc<T>, shutdown: Arc<AtomicBool>) {
    while !shutdown.load(Ordering::Acquire) {
        if let Err(e) = transport.run_event_impl() {
            error!(
                error = %e,
                "Event dispatch failed, close notifications will no longer be delivered"
            );
            return;
        }
    }
    debug!("Event pump exiting");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::mock::MockTransport;
    use std::time::{Duration, Instant};

    fn wait_until(deadline: Duration, mut cond: impl FnMut() -> bool) -> bool {
        let start = Instant::now();
        while start.elapsed() < deadline {
            if cond() {
                return true;
            }
            thread::sleep(Duration::from_millis(5));
        }
        cond()
    }

    #[test]
    fn test_pump_dispatches_until_stopped() {
        let transport = MockTransport::new();
        let mut pump = EventPump::start(Arc::new(transport.clone())).unwrap();

        assert!(wait_until(Duration::from_secs(2), || transport.dispatches() >= 3));
        assert!(pump.is_running());

        pump.stop();
        assert!(!pump.is_running());

        let after_stop = transport.dispatches();
        thread::sleep(Duration::from_millis(30));
        assert_eq!(transport.dispatches(), after_stop);
    }

    #[test]
    fn test_pump_cannot_start_twice() {
        let transport = Arc::new(MockTransport::new());
        let mut pump = EventPump::start(Arc::clone(&transport)).unwrap();

        let err = EventPump::start(Arc::clone(&transport)).err().unwrap();
        assert!(matches!(err, PumpError::Register(TransportError::AlreadyRegistered)));

        pump.stop();
    }

    #[test]
    fn test_dispatch_fault_ends_only_the_pump() {
        let transport = MockTransport::new();
        transport.set_dispatch_fails(true);

        let pump = EventPump::start(Arc::new(transport.clone())).unwrap();

        assert!(wait_until(Duration::from_secs(2), || !pump.is_running()));
        assert_eq!(transport.dispatches(), 1);
    }
}
