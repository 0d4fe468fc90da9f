//! Agent name -> connection pool, plus the order used for round-robin selection.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::RwLock;
use tracing::{debug, info, warn};

use crate::config::GatewayConfig;
use crate::error::TunnelError;
use crate::record::Greeting;
use crate::tunnel::{ConnectionPool, Frame, PoolLimits, PoolStats, Side, Transport, TunnelConnection};

/// Every name in `order` has exactly one pool in `pools`.
#[derive(Default)]
struct Inner {
    pools: HashMap<String, Arc<ConnectionPool>>,
    order: Vec<String>,
}

/// Registration settings taken from the gateway configuration.
#[derive(Debug, Clone, Copy)]
pub struct RegistrySettings {
    pub default_pool_size: usize,
    pub max_pool_size: usize,
    pub frame_timeout: Duration,
    pub greeting_timeout: Duration,
}

impl From<&GatewayConfig> for RegistrySettings {
    fn from(config: &GatewayConfig) -> Self {
        Self {
            default_pool_size: config.default_pool_size,
            max_pool_size: config.max_pool_size,
            frame_timeout: config.frame_timeout(),
            greeting_timeout: config.greeting_timeout(),
        }
    }
}

/// Explicitly owned registry, shared by the registration handler, the
/// dispatcher and the sweep task.
pub struct PoolRegistry {
    inner: RwLock<Inner>,
    settings: RegistrySettings,
}

impl PoolRegistry {
    pub fn new(settings: RegistrySettings) -> Arc<Self> {
        Arc::new(Self {
            inner: RwLock::new(Inner::default()),
            settings,
        })
    }

    /// Register a freshly upgraded transport. Reads the greeting, finds or
    /// creates the agent's pool and offers the new connection to it.
    ///
    /// On any failure the transport is closed before returning.
    pub async fn register(&self, mut transport: Transport) -> Result<Arc<TunnelConnection>, TunnelError> {
        let greeting = match self.read_greeting(&mut transport).await {
            Ok(greeting) => greeting,
            Err(e) => {
                if let Err(close_err) = futures::SinkExt::close(&mut transport.sink).await {
                    debug!("Closing rejected transport failed: {close_err}");
                }
                return Err(e);
            }
        };

        let capacity = greeting
            .pool_size
            .unwrap_or(self.settings.default_pool_size)
            .min(self.settings.max_pool_size);

        // Holding the registry lock while offering keeps a pool from being
        // pruned between lookup and insertion.
        let mut inner = self.inner.write().await;
        let pool = match inner.pools.get(&greeting.name) {
            Some(pool) => Arc::clone(pool),
            None => {
                info!(pool = %greeting.name, capacity, "Creating new connection pool");
                let limits = PoolLimits::gateway(capacity, self.settings.max_pool_size);
                let pool = ConnectionPool::new(greeting.name.clone(), limits);
                inner.pools.insert(greeting.name.clone(), Arc::clone(&pool));
                inner.order.push(greeting.name.clone());
                pool
            }
        };

        let conn = TunnelConnection::new(Side::Gateway, &pool, self.settings.frame_timeout);
        conn.attach(transport).await?;
        if let Err(e) = pool.offer(Arc::clone(&conn)).await {
            drop(inner);
            conn.close().await;
            return Err(e);
        }
        debug!(pool = %greeting.name, conn = %conn.id(), "Registered tunnel connection");
        Ok(conn)
    }

    async fn read_greeting(&self, transport: &mut Transport) -> Result<Greeting, TunnelError> {
        let frame = tokio::time::timeout(self.settings.greeting_timeout, transport.next_data_frame())
            .await
            .map_err(|_| TunnelError::Greeting("timed out waiting for greeting".to_string()))??;
        match frame {
            Frame::Text(text) => Greeting::parse(&text),
            other => Err(TunnelError::Greeting(format!(
                "expected text frame, got {}",
                other.kind()
            ))),
        }
    }

    pub async fn len(&self) -> usize {
        self.inner.read().await.order.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }

    /// Pool at `index` in selection order, wrapping around.
    pub async fn pick(&self, index: usize) -> Option<Arc<ConnectionPool>> {
        let inner = self.inner.read().await;
        if inner.order.is_empty() {
            return None;
        }
        let name = &inner.order[index % inner.order.len()];
        inner.pools.get(name).cloned()
    }

    pub async fn get(&self, name: &str) -> Option<Arc<ConnectionPool>> {
        self.inner.read().await.pools.get(name).cloned()
    }

    /// Drop closed connections from every pool, then drop pools left without
    /// members. Busy connections are members, so a pool whose every connection
    /// is mid-exchange survives. Returns the names of removed pools.
    pub async fn prune(&self) -> Vec<String> {
        let mut inner = self.inner.write().await;
        let mut removed = Vec::new();
        for (name, pool) in &inner.pools {
            if pool.prune().await == 0 {
                removed.push(name.clone());
            }
        }
        for name in &removed {
            info!(pool = %name, "Removing empty connection pool");
            inner.pools.remove(name);
        }
        inner.order.retain(|name| !removed.contains(name));
        removed
    }

    /// Pool summaries in selection order.
    pub async fn snapshot(&self) -> Vec<PoolStats> {
        let pools: Vec<_> = {
            let inner = self.inner.read().await;
            inner
                .order
                .iter()
                .filter_map(|name| inner.pools.get(name).cloned())
                .collect()
        };
        let mut stats = Vec::with_capacity(pools.len());
        for pool in pools {
            stats.push(pool.stats().await);
        }
        stats
    }

    /// Close every pooled connection and forget every pool.
    pub async fn close_all(&self) {
        let pools = {
            let mut inner = self.inner.write().await;
            inner.order.clear();
            std::mem::take(&mut inner.pools)
        };
        for (name, pool) in pools {
            warn!(pool = %name, "Closing connection pool");
            pool.close_all().await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tunnel::transport::memory_pair;
    use futures::{SinkExt, StreamExt};

    fn settings() -> RegistrySettings {
        RegistrySettings {
            default_pool_size: 10,
            max_pool_size: 100,
            frame_timeout: Duration::from_secs(2),
            greeting_timeout: Duration::from_millis(200),
        }
    }

    async fn greet(registry: &PoolRegistry, greeting: &str) -> (Result<Arc<TunnelConnection>, TunnelError>, Transport) {
        let (local, mut peer) = memory_pair();
        peer.sink.send(Frame::Text(greeting.to_string())).await.unwrap();
        (registry.register(local).await, peer)
    }

    #[tokio::test]
    async fn test_register_creates_pool_from_greeting() {
        let registry = PoolRegistry::new(settings());
        let (conn, _peer) = greet(&registry, "agent-1_2").await;
        let conn = conn.unwrap();

        assert_eq!(conn.pool_name(), "agent-1");
        assert_eq!(registry.len().await, 1);
        let pool = registry.get("agent-1").await.unwrap();
        assert_eq!(pool.limits().capacity, 2);
        assert_eq!(pool.size().await.idle, 1);
    }

    #[tokio::test]
    async fn test_bare_greeting_uses_default_size() {
        let registry = PoolRegistry::new(settings());
        let (conn, _peer) = greet(&registry, "agent-1").await;
        conn.unwrap();
        assert_eq!(registry.get("agent-1").await.unwrap().limits().capacity, 10);
    }

    #[tokio::test]
    async fn test_announced_size_is_capped() {
        let registry = PoolRegistry::new(settings());
        let (conn, _peer) = greet(&registry, "agent-1_5000").await;
        conn.unwrap();
        assert_eq!(registry.get("agent-1").await.unwrap().limits().capacity, 100);
    }

    #[tokio::test]
    async fn test_full_pool_rejects_and_closes_transport() {
        let registry = PoolRegistry::new(settings());
        let mut peers = Vec::new();
        for _ in 0..2 {
            let (conn, peer) = greet(&registry, "agent-1_2").await;
            conn.unwrap();
            peers.push(peer);
        }

        let (rejected, mut peer) = greet(&registry, "agent-1_2").await;
        assert!(matches!(rejected, Err(TunnelError::PoolFull)));
        let end = tokio::time::timeout(Duration::from_secs(2), peer.stream.next())
            .await
            .unwrap();
        assert!(end.is_none());
        assert_eq!(registry.get("agent-1").await.unwrap().size().await.total, 2);
    }

    #[tokio::test]
    async fn test_binary_greeting_rejected() {
        let registry = PoolRegistry::new(settings());
        let (local, mut peer) = memory_pair();
        peer.sink
            .send(Frame::Binary(bytes::Bytes::from_static(b"agent")))
            .await
            .unwrap();
        let err = registry.register(local).await.unwrap_err();
        assert!(matches!(err, TunnelError::Greeting(_)));
        assert!(peer.stream.next().await.is_none());
        assert!(registry.is_empty().await);
    }

    #[tokio::test]
    async fn test_silent_transport_times_out() {
        let registry = PoolRegistry::new(settings());
        let (local, _peer) = memory_pair();
        let err = registry.register(local).await.unwrap_err();
        assert!(matches!(err, TunnelError::Greeting(_)));
    }

    #[tokio::test]
    async fn test_pick_wraps_around() {
        let registry = PoolRegistry::new(settings());
        let (_a, _pa) = greet(&registry, "a_1").await;
        let (_b, _pb) = greet(&registry, "b_1").await;
        assert_eq!(registry.pick(0).await.unwrap().name(), "a");
        assert_eq!(registry.pick(1).await.unwrap().name(), "b");
        assert_eq!(registry.pick(2).await.unwrap().name(), "a");
    }

    #[tokio::test]
    async fn test_prune_drops_empty_pools() {
        let registry = PoolRegistry::new(settings());
        let (a, _pa) = greet(&registry, "a_1").await;
        let (_b, _pb) = greet(&registry, "b_1").await;
        a.unwrap().close().await;

        assert_eq!(registry.prune().await, vec!["a".to_string()]);
        assert_eq!(registry.len().await, 1);
        assert_eq!(registry.pick(0).await.unwrap().name(), "b");
    }

    #[tokio::test]
    async fn test_prune_keeps_pool_with_busy_connection() {
        let registry = PoolRegistry::new(settings());
        let (conn, _peer) = greet(&registry, "a_1").await;
        let conn = conn.unwrap();
        let pool = registry.get("a").await.unwrap();
        assert!(Arc::ptr_eq(&pool.take().await.unwrap(), &conn));

        assert!(registry.prune().await.is_empty());
        assert!(conn.release());
        assert!(Arc::ptr_eq(&registry.pick(0).await.unwrap(), &pool));
        assert_eq!(pool.size().await.idle, 1);
    }

    #[tokio::test]
    async fn test_close_all_closes_connections() {
        let registry = PoolRegistry::new(settings());
        let (conn, mut peer) = greet(&registry, "a_1").await;
        let conn = conn.unwrap();
        registry.close_all().await;
        assert!(conn.is_closed());
        assert!(registry.is_empty().await);
        assert!(peer.stream.next().await.is_none());
    }
}
