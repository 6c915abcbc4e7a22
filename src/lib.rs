//! virtpool - Shared, self-healing connections to remote virtualization hosts

pub mod config;
pub mod core;
pub mod pool;
pub mod probe;
pub mod pump;
pub mod transport;

pub use crate::config::Config;
pub use crate::core::Core;
pub use crate::pool::{ConnectionError, ConnectionKind, ConnectionPool};
