//! One gateway target: dials tunnel connections and keeps the idle count up.

use std::sync::Arc;
use std::time::Duration;

use futures_util::future::BoxFuture;
use futures_util::SinkExt;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, info_span, warn, Instrument};

use super::executor::Executor;
use crate::config::AgentConfig;
use crate::error::TunnelError;
use crate::tunnel::{ConnectionPool, Frame, PoolLimits, Side, Transport, TunnelConnection};

/// Opens the transport under a new tunnel connection.
pub trait Connector: Send + Sync {
    fn connect<'a>(&'a self, target: &'a str) -> BoxFuture<'a, Result<Transport, TunnelError>>;
}

/// Dials `ws://` and `wss://` targets with tokio-tungstenite.
#[derive(Debug, Clone, Copy, Default)]
pub struct WsConnector;

impl Connector for WsConnector {
    fn connect<'a>(&'a self, target: &'a str) -> BoxFuture<'a, Result<Transport, TunnelError>> {
        Box::pin(async move {
            let (ws, _response) = tokio_tungstenite::connect_async(target).await?;
            Ok(Transport::from_tungstenite(ws))
        })
    }
}

pub struct TargetPool {
    target: String,
    pool: Arc<ConnectionPool>,
    connector: Arc<dyn Connector>,
    executor: Executor,
    config: Arc<AgentConfig>,
    cancel: CancellationToken,
}

impl TargetPool {
    pub fn new(
        target: impl Into<String>,
        config: Arc<AgentConfig>,
        connector: Arc<dyn Connector>,
        executor: Executor,
    ) -> Arc<Self> {
        let target = target.into();
        let pool = ConnectionPool::new(
            target.clone(),
            PoolLimits::agent(config.pool_idle_size, config.pool_max_size),
        );
        Arc::new(Self {
            target,
            pool,
            connector,
            executor,
            config,
            cancel: CancellationToken::new(),
        })
    }

    pub fn target(&self) -> &str {
        &self.target
    }

    pub fn pool(&self) -> &Arc<ConnectionPool> {
        &self.pool
    }

    /// Open one more tunnel connection if the pool wants one.
    ///
    /// Returns `Ok(false)` when the idle target or the hard cap is already
    /// met, or enough connections are already dialing.
    pub async fn connect(self: &Arc<Self>) -> Result<bool, TunnelError> {
        if self.cancel.is_cancelled() {
            return Ok(false);
        }
        let size = self.pool.size().await;
        let limits = self.pool.limits();
        if size.idle >= limits.idle_target || size.total >= limits.max_size {
            return Ok(false);
        }
        if size.connecting >= limits.idle_target.saturating_sub(size.idle) {
            return Ok(false);
        }

        let conn = TunnelConnection::new(Side::Agent, &self.pool, self.config.frame_timeout());
        self.pool.reserve(Arc::clone(&conn)).await?;
        if self.cancel.is_cancelled() {
            // Shut down between the check and the reservation.
            conn.close().await;
            return Ok(false);
        }
        if let Err(e) = self.dial(&conn).await {
            conn.close().await;
            return Err(e);
        }
        debug!(target = %self.target, conn = %conn.id(), "Tunnel connection established");
        self.spawn_serve(conn);
        Ok(true)
    }

    /// Dial, greet, then hand the transport to the connection.
    async fn dial(&self, conn: &Arc<TunnelConnection>) -> Result<(), TunnelError> {
        let timeout = self.config.frame_timeout();
        let mut transport = tokio::time::timeout(timeout, self.connector.connect(&self.target)).await??;
        tokio::time::timeout(timeout, transport.sink.send(Frame::Text(self.config.greeting()))).await??;
        conn.attach(transport).await
    }

    fn spawn_serve(self: &Arc<Self>, conn: Arc<TunnelConnection>) {
        let span = info_span!("tunnel_conn", target = %self.target, conn = %conn.id());
        let this = Arc::clone(self);
        let serving = Arc::clone(&conn);
        tokio::spawn(
            async move {
                let replenish = Arc::clone(&this);
                this.executor
                    .serve(serving, move || {
                        let target = Arc::clone(&replenish);
                        tokio::spawn(async move {
                            if let Err(e) = target.connect().await {
                                debug!(target = %target.target, "Replenishing connect failed: {e}");
                            }
                        });
                    })
                    .await;
            }
            .instrument(span),
        );

        let every = self.config.ping_interval();
        tokio::spawn(keepalive(conn, every));
    }

    /// Run the maintenance policy once.
    pub async fn maintain(self: &Arc<Self>) {
        let size = self.pool.size().await;
        debug!(target = %self.target, "{size}");
        let idle_target = self.pool.limits().idle_target;

        if size.total == 0 {
            if let Err(e) = self.connect().await {
                warn!(target = %self.target, "Unable to connect: {e}");
            }
            return;
        }

        if size.idle < idle_target {
            for _ in 0..idle_target - size.idle {
                let this = Arc::clone(self);
                tokio::spawn(async move {
                    if let Err(e) = this.connect().await {
                        debug!(target = %this.target, "Unable to connect: {e}");
                    }
                });
            }
        } else if size.idle > idle_target {
            // Surplus idle connections are left to expire on their own.
            debug!(target = %self.target, idle = size.idle, idle_target, "Too many idle connections");
        }
    }

    /// First connection with exponential backoff, then periodic maintenance
    /// until [`shutdown`](Self::shutdown).
    pub async fn start(self: Arc<Self>) {
        let mut delay = Duration::from_secs(self.config.reconnect_delay_secs);
        let max_delay = Duration::from_secs(self.config.reconnect_max_delay_secs);

        loop {
            info!(target = %self.target, "Connecting to gateway");
            match self.connect().await {
                Ok(_) => break,
                Err(e) => warn!(
                    target = %self.target,
                    "Unable to connect: {e}, retrying in {}s",
                    delay.as_secs()
                ),
            }
            tokio::select! {
                () = self.cancel.cancelled() => return,
                () = tokio::time::sleep(delay) => {}
            }
            delay = (delay * 2).min(max_delay);
        }
        info!(target = %self.target, "Connected to gateway");

        let mut interval = tokio::time::interval(self.config.maintenance_interval());
        loop {
            tokio::select! {
                () = self.cancel.cancelled() => break,
                _ = interval.tick() => self.maintain().await,
            }
        }
    }

    /// Stop maintenance and close every connection to this target.
    pub async fn shutdown(&self) {
        self.cancel.cancel();
        self.pool.close_all().await;
        info!(target = %self.target, "Closed all tunnel connections");
    }
}

/// Ping until the connection closes; a failed ping closes it.
async fn keepalive(conn: Arc<TunnelConnection>, every: Duration) {
    let mut interval = tokio::time::interval(every);
    interval.tick().await;
    loop {
        tokio::select! {
            () = conn.closed() => break,
            _ = interval.tick() => {
                if let Err(e) = conn.ping().await {
                    debug!(conn = %conn.id(), "Keepalive ping failed: {e}");
                    conn.close().await;
                    break;
                }
            }
        }
    }
}
