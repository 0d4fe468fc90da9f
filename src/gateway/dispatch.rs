//! Time-boxed admission loop: pick a pool, take a connection, run the exchange.

use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use axum::body::Body;
use axum::http::{Request, Response};
use bytes::Bytes;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use tokio::time::Instant;
use tracing::{debug, warn};

use super::registry::PoolRegistry;
use crate::error::TunnelError;

pub struct Dispatcher {
    registry: Arc<PoolRegistry>,
    /// Chooses the starting pool of each request.
    rng: Mutex<StdRng>,
    deadline: Duration,
    retry_interval: Duration,
}

impl Dispatcher {
    pub fn new(registry: Arc<PoolRegistry>, deadline: Duration, retry_interval: Duration) -> Self {
        Self {
            registry,
            rng: Mutex::new(StdRng::from_entropy()),
            deadline,
            retry_interval,
        }
    }

    /// Deterministic start-index selection.
    #[must_use]
    pub fn with_seed(mut self, seed: u64) -> Self {
        self.rng = Mutex::new(StdRng::seed_from_u64(seed));
        self
    }

    pub fn registry(&self) -> &Arc<PoolRegistry> {
        &self.registry
    }

    /// Tunnel one buffered request to some agent.
    ///
    /// Fails at once with `NoProxyAvailable` when no agent is registered, and
    /// with `NoConnection` once the deadline passes without a connection. An
    /// exchange failure is returned as is; the connection is already closed.
    pub async fn dispatch(&self, request: &Request<Bytes>) -> Result<Response<Body>, TunnelError> {
        let pools = self.registry.len().await;
        if pools == 0 {
            return Err(TunnelError::NoProxyAvailable);
        }

        let deadline = Instant::now() + self.deadline;
        let mut index = self
            .rng
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .gen_range(0..pools);

        loop {
            if let Some(pool) = self.registry.pick(index).await {
                if let Some(conn) = pool.take().await {
                    // The connection stays a pool member throughout; a
                    // successful exchange leaves it IDLE for the next taker.
                    match conn.proxy_activated(request).await {
                        Ok(response) => return Ok(response),
                        // Lost a race with close; the connection is gone.
                        Err(TunnelError::NotReady) => {
                            debug!(pool = %pool.name(), conn = %conn.id(), "Skipping connection that is not ready");
                        }
                        Err(e) => {
                            warn!(pool = %pool.name(), conn = %conn.id(), "Proxy request failed: {e}");
                            return Err(e);
                        }
                    }
                }
            }

            if Instant::now() >= deadline {
                return Err(TunnelError::NoConnection);
            }
            index = index.wrapping_add(1);
            tokio::time::sleep(self.retry_interval).await;
        }
    }
}
