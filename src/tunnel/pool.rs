//! Bounded collection of tunnel connections for one peer.
//!
//! The same type backs both ends. On the gateway a pool is keyed by agent
//! name; `take` activates an idle member in place, so busy connections stay
//! members and count in `size`. On the agent a pool is keyed by target URL
//! and tracks every connection it dialed, whatever its state, so maintenance
//! can count idle and connecting ones.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use tokio::sync::{Notify, RwLock};
use tracing::{debug, warn};

use super::connection::{Status, TunnelConnection};
use crate::error::TunnelError;

/// Admission limits of one pool.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct PoolLimits {
    /// Maximum IDLE members after an `offer`.
    pub capacity: usize,
    /// Idle count maintenance steers toward (agent side).
    pub idle_target: usize,
    /// Hard cap on membership.
    pub max_size: usize,
}

impl PoolLimits {
    /// Gateway pools: capacity is the size announced in the agent greeting,
    /// `max_size` bounds idle and busy members together.
    pub fn gateway(capacity: usize, max_size: usize) -> Self {
        Self {
            capacity,
            idle_target: capacity,
            max_size: max_size.max(capacity),
        }
    }

    /// Agent pools: keep `idle` connections ready, never more than `max` in total.
    pub fn agent(idle: usize, max: usize) -> Self {
        Self {
            capacity: max,
            idle_target: idle,
            max_size: max,
        }
    }
}

/// Point-in-time count of members by status.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct PoolSize {
    pub connecting: usize,
    pub idle: usize,
    pub active: usize,
    pub closed: usize,
    pub total: usize,
}

impl fmt::Display for PoolSize {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "Connecting {}, idle {}, active {}, closed {}, total {}",
            self.connecting, self.idle, self.active, self.closed, self.total
        )
    }
}

/// Pool summary served by the gateway stats endpoint.
#[derive(Debug, Clone, Serialize)]
pub struct PoolStats {
    pub name: String,
    pub limits: PoolLimits,
    pub size: PoolSize,
}

pub struct ConnectionPool {
    name: String,
    limits: PoolLimits,
    connections: RwLock<Vec<Arc<TunnelConnection>>>,
    /// Woken whenever a member becomes IDLE.
    available: Notify,
}

impl fmt::Debug for ConnectionPool {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConnectionPool")
            .field("name", &self.name)
            .field("limits", &self.limits)
            .finish_non_exhaustive()
    }
}

fn count(connections: &[Arc<TunnelConnection>]) -> PoolSize {
    let mut size = PoolSize {
        total: connections.len(),
        ..PoolSize::default()
    };
    for conn in connections {
        match conn.status() {
            Status::Connecting => size.connecting += 1,
            Status::Idle => size.idle += 1,
            Status::Active => size.active += 1,
            Status::Closed => size.closed += 1,
        }
    }
    size
}

impl ConnectionPool {
    pub fn new(name: impl Into<String>, limits: PoolLimits) -> Arc<Self> {
        Arc::new(Self {
            name: name.into(),
            limits,
            connections: RwLock::new(Vec::new()),
            available: Notify::new(),
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn limits(&self) -> PoolLimits {
        self.limits
    }

    /// Admit a connection for dispatch. On `PoolFull` the caller owns the
    /// connection and must close it.
    pub async fn offer(&self, conn: Arc<TunnelConnection>) -> Result<(), TunnelError> {
        let mut connections = self.connections.write().await;
        let live: Vec<_> = connections
            .drain(..)
            .filter(|c| !c.is_closed())
            .collect();
        *connections = live;

        if conn.is_closed() {
            return Err(TunnelError::Closed);
        }
        if connections.iter().any(|c| Arc::ptr_eq(c, &conn)) {
            return Ok(());
        }

        let size = count(&connections);
        if size.idle >= self.limits.capacity || size.total >= self.limits.max_size {
            warn!(pool = %self.name, conn = %conn.id(), %size, "Discarding connection, pool is full");
            return Err(TunnelError::PoolFull);
        }

        connections.push(conn);
        drop(connections);
        self.available.notify_waiters();
        Ok(())
    }

    /// Add a connection that is still dialing (agent side). Only the hard cap
    /// applies; the idle target is the caller's concern.
    pub async fn reserve(&self, conn: Arc<TunnelConnection>) -> Result<(), TunnelError> {
        let mut connections = self.connections.write().await;
        if connections.len() >= self.limits.max_size {
            return Err(TunnelError::PoolFull);
        }
        connections.push(conn);
        Ok(())
    }

    /// Hand out an IDLE member without waiting, already switched to ACTIVE.
    /// It stays a member; finishing the exchange makes it IDLE again.
    pub async fn take(&self) -> Option<Arc<TunnelConnection>> {
        let connections = self.connections.read().await;
        connections.iter().find(|c| c.try_activate()).cloned()
    }

    /// Wake [`take_timeout`](Self::take_timeout) callers after a member went
    /// back to IDLE.
    pub(crate) fn notify_available(&self) {
        self.available.notify_waiters();
    }

    /// Like [`take`](Self::take), but wait up to `timeout` for a connection
    /// to be offered or released.
    pub async fn take_timeout(
        &self,
        timeout: Duration,
    ) -> Result<Arc<TunnelConnection>, TunnelError> {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            // Register before checking so an offer or release in between is not missed.
            let offered = self.available.notified();
            tokio::pin!(offered);
            offered.as_mut().enable();

            if let Some(conn) = self.take().await {
                return Ok(conn);
            }
            if tokio::time::timeout_at(deadline, offered).await.is_err() {
                return Err(TunnelError::Timeout);
            }
        }
    }

    /// Drop a connection from membership. No-op when it is not a member.
    pub async fn remove(&self, id: &str) {
        let mut connections = self.connections.write().await;
        let before = connections.len();
        connections.retain(|c| c.id() != id);
        if connections.len() != before {
            debug!(pool = %self.name, conn = %id, "Removed connection from pool");
        }
    }

    pub async fn size(&self) -> PoolSize {
        count(&self.connections.read().await)
    }

    pub async fn stats(&self) -> PoolStats {
        PoolStats {
            name: self.name.clone(),
            limits: self.limits,
            size: self.size().await,
        }
    }

    /// Rebuild membership without CLOSED connections. Returns the remaining
    /// count, busy members included.
    pub async fn prune(&self) -> usize {
        let mut connections = self.connections.write().await;
        let live: Vec<_> = connections
            .drain(..)
            .filter(|c| !c.is_closed())
            .collect();
        *connections = live;
        connections.len()
    }

    /// Close every member.
    pub async fn close_all(&self) {
        let connections = std::mem::take(&mut *self.connections.write().await);
        for conn in connections {
            conn.close().await;
        }
    }
}
