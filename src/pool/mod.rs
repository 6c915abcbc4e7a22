//! Connection pooling for virtualization hosts
//!
//! This module provides:
//! - A registry keeping at most one managed connection per (host, kind)
//! - Self-healing connections that reconnect in place after a failure
//! - A writer-preferring read/write lock guarding the registry
//! - Credential challenge handling for hosts that require a login

pub mod auth;
pub mod connection;
pub mod kind;
pub mod registry;
pub mod rwlock;

pub use auth::CredentialResponder;
pub use connection::{ConnectSettings, Connection, ConnectionError, ConnectionInfo, ConnectionState};
pub use kind::{normalize_host, ConnectUri, ConnectionKind, TCP_PORT};
pub use registry::{ConnectionPool, PoolConfig, PoolStats};
pub use rwlock::{ReadGuard, RwLock, WriteGuard};
