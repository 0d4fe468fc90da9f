//! Tunnel connections and the pools that own them.
//!
//! Shared by both ends: the gateway wraps accepted WebSockets, the agent
//! wraps the ones it dials.

pub mod connection;
pub mod pool;
pub mod transport;

pub use connection::{Handoff, Side, Status, TunnelConnection};
pub use pool::{ConnectionPool, PoolLimits, PoolSize, PoolStats};
pub use transport::{Frame, Transport};
