//! Operator commands for the virtpool binary
//!
//! ```bash
//! # Is the management port reachable?
//! virtpool check kvm-01 kvm-02:16510
//!
//! # Open a pooled connection and keep it for a minute
//! virtpool connect kvm-01 --hold 60
//!
//! # Re-acquire connections every 5 seconds, reconnecting as hosts come and go
//! virtpool watch kvm-01 kvm-02 --interval 5
//! ```

pub mod commands;
