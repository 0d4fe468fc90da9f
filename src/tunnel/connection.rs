//! One tunnel connection: a WebSocket carrying one exchange at a time.
//!
//! The transport tolerates a single outstanding read, yet control frames must
//! keep flowing and application frames must reach whichever phase of the
//! exchange is waiting for them. A dedicated reader task therefore owns the
//! read half. Exchange code never reads the socket itself: it hands the
//! reader a one-shot slot via [`TunnelConnection::next_frame`], the reader
//! fills the slot with the next data frame and waits until the resulting
//! [`Handoff`] is dropped before reading again.
//!
//! The two sides differ in when a data frame is legal. A gateway connection
//! only reads while its own exchange is ACTIVE. An agent connection waits
//! IDLE for the next request header; that frame is what starts its exchange.

use std::sync::atomic::{AtomicU64, AtomicU8, Ordering};
use std::sync::{Arc, Weak};
use std::time::{Duration, Instant};

use axum::body::Body;
use axum::http::{Request, Response};
use bytes::Bytes;
use futures::{SinkExt, StreamExt};
use tokio::sync::{mpsc, oneshot, Mutex};
use tokio_util::sync::{CancellationToken, WaitForCancellationFuture};
use tracing::{debug, info, info_span, warn, Instrument};

use super::pool::ConnectionPool;
use super::transport::{Frame, FrameSink, FrameStream, Transport};
use crate::error::TunnelError;
use crate::record::{HttpRequestRecord, HttpResponseRecord};

/// Lifecycle of a tunnel connection. `Closed` is terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum Status {
    /// Agent side only: the outbound dial or greeting is in flight.
    Connecting = 0,
    Idle = 1,
    Active = 2,
    Closed = 3,
}

impl Status {
    fn from_u8(value: u8) -> Self {
        match value {
            0 => Self::Connecting,
            1 => Self::Idle,
            2 => Self::Active,
            _ => Self::Closed,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Connecting => "connecting",
            Self::Idle => "idle",
            Self::Active => "active",
            Self::Closed => "closed",
        }
    }
}

/// Which end of the tunnel a connection lives on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Side {
    /// Accepted by the gateway; frames are only legal while an exchange runs.
    Gateway,
    /// Dialed by the agent; a request header may arrive while idle.
    Agent,
}

/// A frame delivered by the reader loop. Dropping it tells the reader the
/// frame is consumed and it may read the next one.
pub struct Handoff {
    frame: Frame,
    _consumed: oneshot::Sender<()>,
}

impl Handoff {
    pub fn frame(&self) -> &Frame {
        &self.frame
    }

    pub fn into_text(self) -> Result<String, TunnelError> {
        let Handoff { frame, .. } = self;
        match frame {
            Frame::Text(text) => Ok(text),
            other => Err(TunnelError::Protocol(format!(
                "expected text frame, got {}",
                other.kind()
            ))),
        }
    }

    pub fn into_binary(self) -> Result<Bytes, TunnelError> {
        let Handoff { frame, .. } = self;
        match frame {
            Frame::Binary(data) => Ok(data),
            other => Err(TunnelError::Protocol(format!(
                "expected binary frame, got {}",
                other.kind()
            ))),
        }
    }
}

type Slot = oneshot::Sender<Handoff>;

pub struct TunnelConnection {
    id: String,
    side: Side,
    pool_name: String,
    /// Back-reference only; the pool owns its connections.
    pool: Weak<ConnectionPool>,
    status: AtomicU8,
    epoch: Instant,
    /// Last exchange start as ms since `epoch`.
    last_activity_ms: AtomicU64,
    frame_timeout: Duration,
    sink: Mutex<Option<FrameSink>>,
    slots: mpsc::Sender<Slot>,
    /// Moved into the reader task on attach.
    slot_rx: Mutex<Option<mpsc::Receiver<Slot>>>,
    closed: CancellationToken,
}

impl std::fmt::Debug for TunnelConnection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TunnelConnection")
            .field("id", &self.id)
            .field("side", &self.side)
            .field("pool", &self.pool_name)
            .field("status", &self.status())
            .finish_non_exhaustive()
    }
}

impl TunnelConnection {
    /// Create a connection owned by `pool`, in `Connecting` state and without
    /// a transport yet.
    pub fn new(side: Side, pool: &Arc<ConnectionPool>, frame_timeout: Duration) -> Arc<Self> {
        let (slots, slot_rx) = mpsc::channel(1);
        let mut id = uuid::Uuid::new_v4().simple().to_string();
        id.truncate(8);
        Arc::new(Self {
            id,
            side,
            pool_name: pool.name().to_string(),
            pool: Arc::downgrade(pool),
            status: AtomicU8::new(Status::Connecting as u8),
            epoch: Instant::now(),
            last_activity_ms: AtomicU64::new(0),
            frame_timeout,
            sink: Mutex::new(None),
            slots,
            slot_rx: Mutex::new(Some(slot_rx)),
            closed: CancellationToken::new(),
        })
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn side(&self) -> Side {
        self.side
    }

    pub fn pool_name(&self) -> &str {
        &self.pool_name
    }

    pub fn status(&self) -> Status {
        Status::from_u8(self.status.load(Ordering::Acquire))
    }

    pub fn is_closed(&self) -> bool {
        self.status() == Status::Closed
    }

    /// When the last exchange started (creation time if none has).
    pub fn last_activity(&self) -> Instant {
        self.epoch + Duration::from_millis(self.last_activity_ms.load(Ordering::Relaxed))
    }

    /// Resolves once the connection is closed.
    pub fn closed(&self) -> WaitForCancellationFuture<'_> {
        self.closed.cancelled()
    }

    fn touch(&self) {
        #[allow(clippy::cast_possible_truncation)]
        let now_ms = self.epoch.elapsed().as_millis() as u64;
        self.last_activity_ms.store(now_ms, Ordering::Relaxed);
    }

    fn transition(&self, from: Status, to: Status) -> bool {
        self.status
            .compare_exchange(from as u8, to as u8, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    /// IDLE -> ACTIVE. The only gate to starting an exchange: at most one
    /// caller wins per idle period.
    pub fn try_activate(&self) -> bool {
        let activated = self.transition(Status::Idle, Status::Active);
        if activated {
            self.touch();
        }
        activated
    }

    /// ACTIVE -> IDLE after a complete exchange, waking pool waiters. Fails
    /// if the connection was closed meanwhile.
    pub fn release(&self) -> bool {
        let released = self.transition(Status::Active, Status::Idle);
        if released {
            if let Some(pool) = self.pool.upgrade() {
                pool.notify_available();
            }
        }
        released
    }

    /// Install the transport, enter IDLE and start the reader loop.
    pub async fn attach(self: &Arc<Self>, transport: Transport) -> Result<(), TunnelError> {
        let Transport { sink, stream } = transport;
        let Some(slot_rx) = self.slot_rx.lock().await.take() else {
            return Err(TunnelError::Protocol(
                "transport already attached".to_string(),
            ));
        };
        *self.sink.lock().await = Some(sink);

        if !self.transition(Status::Connecting, Status::Idle) {
            // Closed while the dial was in flight.
            self.shutdown_sink().await;
            return Err(TunnelError::Closed);
        }
        self.touch();

        let span = info_span!("tunnel_conn", pool = %self.pool_name, conn = %self.id);
        tokio::spawn(Arc::clone(self).read_loop(stream, slot_rx).instrument(span));
        Ok(())
    }

    /// Whether an incoming data frame is legal in the current state.
    fn accepts_frame(&self) -> bool {
        match (self.side, self.status()) {
            (_, Status::Active) | (Side::Agent, Status::Idle) => true,
            (_, Status::Connecting | Status::Idle | Status::Closed) => false,
        }
    }

    async fn read_loop(self: Arc<Self>, mut stream: FrameStream, mut slots: mpsc::Receiver<Slot>) {
        loop {
            let next = tokio::select! {
                () = self.closed.cancelled() => break,
                next = stream.next() => next,
            };
            let frame = match next {
                Some(Ok(Frame::Ping(_) | Frame::Pong(_))) => continue,
                Some(Ok(Frame::Close)) | None => {
                    debug!("Peer closed the tunnel");
                    break;
                }
                Some(Err(e)) => {
                    debug!("Tunnel read failed: {e}");
                    break;
                }
                Some(Ok(frame)) => frame,
            };

            if !self.accepts_frame() {
                warn!(
                    status = self.status().as_str(),
                    kind = frame.kind(),
                    "Unexpected frame on tunnel connection"
                );
                break;
            }

            // Wait for the exchange to ask for this frame.
            let slot = tokio::select! {
                () = self.closed.cancelled() => break,
                slot = slots.recv() => match slot {
                    Some(slot) => slot,
                    None => break,
                },
            };

            let (consumed_tx, consumed_rx) = oneshot::channel();
            let handoff = Handoff {
                frame,
                _consumed: consumed_tx,
            };
            if slot.send(handoff).is_err() {
                // The waiting exchange gave up.
                break;
            }

            tokio::select! {
                () = self.closed.cancelled() => break,
                _ = consumed_rx => {}
            }
        }

        self.close().await;
        // Dropping `slots` here fails any exchange still waiting on a frame.
        drop(slots);
        self.shutdown_sink().await;
    }

    async fn shutdown_sink(&self) {
        if let Some(mut sink) = self.sink.lock().await.take() {
            if let Err(e) = sink.close().await {
                debug!(pool = %self.pool_name, conn = %self.id, "Tunnel close failed: {e}");
            }
        }
    }

    /// Send one frame, bounded by the frame timeout.
    pub async fn send(&self, frame: Frame) -> Result<(), TunnelError> {
        let mut guard = self.sink.lock().await;
        let sink = guard.as_mut().ok_or(TunnelError::Closed)?;
        tokio::time::timeout(self.frame_timeout, sink.send(frame)).await?
    }

    pub async fn ping(&self) -> Result<(), TunnelError> {
        self.send(Frame::Ping(Bytes::new())).await
    }

    /// Ask the reader loop for the next data frame. `None` waits without limit
    /// (an idle agent connection waiting for its next request).
    pub async fn next_frame(&self, timeout: Option<Duration>) -> Result<Handoff, TunnelError> {
        if self.is_closed() {
            return Err(TunnelError::Closed);
        }
        let wait = async {
            let (slot, delivery) = oneshot::channel();
            self.slots
                .send(slot)
                .await
                .map_err(|_| TunnelError::Closed)?;
            delivery.await.map_err(|_| TunnelError::Closed)
        };
        match timeout {
            Some(limit) => tokio::time::timeout(limit, wait).await?,
            None => wait.await,
        }
    }

    /// The default bound for frames awaited inside an exchange.
    pub fn frame_timeout(&self) -> Duration {
        self.frame_timeout
    }

    /// Run one gateway-side exchange: request header, request body, response
    /// header, response body, in that order.
    ///
    /// On success the connection is back to IDLE. On any failure it is closed,
    /// since a half-consumed exchange leaves the framing unusable.
    pub async fn proxy_request(
        &self,
        request: &Request<Bytes>,
    ) -> Result<Response<Body>, TunnelError> {
        if !self.try_activate() {
            return Err(TunnelError::NotReady);
        }
        self.proxy_activated(request).await
    }

    /// Same as [`proxy_request`](Self::proxy_request) for a connection the
    /// caller already switched to ACTIVE, as [`ConnectionPool::take`] does.
    pub async fn proxy_activated(
        &self,
        request: &Request<Bytes>,
    ) -> Result<Response<Body>, TunnelError> {
        if self.status() != Status::Active {
            return Err(TunnelError::NotReady);
        }
        debug!(
            pool = %self.pool_name,
            conn = %self.id,
            method = %request.method(),
            uri = %request.uri(),
            "Proxying request"
        );

        match self.exchange(request).await {
            Ok(response) => {
                if !self.release() {
                    debug!(pool = %self.pool_name, conn = %self.id, "Connection closed after exchange");
                }
                Ok(response)
            }
            Err(e) => {
                self.close().await;
                Err(e)
            }
        }
    }

    async fn exchange(&self, request: &Request<Bytes>) -> Result<Response<Body>, TunnelError> {
        let record = HttpRequestRecord::from_request(request, request.body().len());
        self.send(Frame::Text(serde_json::to_string(&record)?))
            .await?;
        // Zero bytes is still a frame.
        self.send(Frame::Binary(request.body().clone())).await?;

        let head = self
            .next_frame(Some(self.frame_timeout))
            .await?
            .into_text()?;
        let record: HttpResponseRecord = serde_json::from_str(&head)?;

        let body = self
            .next_frame(Some(self.frame_timeout))
            .await?
            .into_binary()?;
        record.into_response(body)
    }

    /// Idempotent. Unblocks the reader loop (which then closes the transport)
    /// and removes the connection from its pool.
    pub async fn close(&self) {
        let previous = Status::from_u8(self.status.swap(Status::Closed as u8, Ordering::AcqRel));
        if previous == Status::Closed {
            return;
        }
        info!(
            pool = %self.pool_name,
            conn = %self.id,
            was = previous.as_str(),
            "Closing tunnel connection"
        );
        self.closed.cancel();
        if let Some(pool) = self.pool.upgrade() {
            pool.remove(&self.id).await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tunnel::pool::PoolLimits;
    use crate::tunnel::transport::memory_pair;

    const WAIT: Duration = Duration::from_secs(2);

    fn pool() -> Arc<ConnectionPool> {
        ConnectionPool::new("agent-1", PoolLimits::gateway(4, 4))
    }

    async fn attached(side: Side, pool: &Arc<ConnectionPool>) -> (Arc<TunnelConnection>, Transport) {
        let (local, peer) = memory_pair();
        let conn = TunnelConnection::new(side, pool, Duration::from_secs(2));
        conn.attach(local).await.unwrap();
        (conn, peer)
    }

    fn get(uri: &str, body: &'static [u8]) -> Request<Bytes> {
        Request::builder()
            .uri(uri)
            .header("x-trace", "abc")
            .body(Bytes::from_static(body))
            .unwrap()
    }

    async fn respond(peer: &mut Transport, status: u16, body: &'static [u8]) {
        let head = format!(r#"{{"Status":"","StatusCode":{status},"Header":{{"X-From":["agent"]}},"ContentLength":{}}}"#, body.len());
        peer.sink.send(Frame::Text(head)).await.unwrap();
        peer.sink
            .send(Frame::Binary(Bytes::from_static(body)))
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_attach_enters_idle() {
        let pool = pool();
        let conn = TunnelConnection::new(Side::Gateway, &pool, WAIT);
        assert_eq!(conn.status(), Status::Connecting);
        let (local, _peer) = memory_pair();
        conn.attach(local).await.unwrap();
        assert_eq!(conn.status(), Status::Idle);
    }

    #[tokio::test]
    async fn test_attach_after_close_fails() {
        let pool = pool();
        let conn = TunnelConnection::new(Side::Agent, &pool, WAIT);
        conn.close().await;
        let (local, mut peer) = memory_pair();
        assert!(matches!(conn.attach(local).await, Err(TunnelError::Closed)));
        // Transport was shut down.
        assert!(peer.stream.next().await.is_none());
    }

    #[tokio::test]
    async fn test_close_is_idempotent() {
        let pool = pool();
        let (conn, mut peer) = attached(Side::Gateway, &pool).await;
        pool.offer(conn.clone()).await.unwrap();
        assert_eq!(pool.size().await.total, 1);

        conn.close().await;
        conn.close().await;
        assert_eq!(conn.status(), Status::Closed);
        assert_eq!(pool.size().await.total, 0);

        let end = tokio::time::timeout(WAIT, peer.stream.next()).await.unwrap();
        assert!(end.is_none());
        conn.close().await;
    }

    #[tokio::test]
    async fn test_only_one_activation_wins() {
        let pool = pool();
        let (conn, _peer) = attached(Side::Gateway, &pool).await;

        let mut handles = Vec::new();
        for _ in 0..32 {
            let conn = conn.clone();
            handles.push(tokio::spawn(async move { conn.try_activate() }));
        }
        let mut winners = 0;
        for handle in handles {
            if handle.await.unwrap() {
                winners += 1;
            }
        }
        assert_eq!(winners, 1);
        assert_eq!(conn.status(), Status::Active);
        assert!(conn.release());
        assert!(!conn.release());
    }

    #[tokio::test]
    async fn test_activation_touches_last_activity() {
        let pool = pool();
        let (conn, _peer) = attached(Side::Gateway, &pool).await;
        let before = conn.last_activity();
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(conn.try_activate());
        assert!(conn.last_activity() > before);
    }

    #[tokio::test]
    async fn test_unexpected_frame_closes_gateway_connection() {
        let pool = pool();
        let (conn, mut peer) = attached(Side::Gateway, &pool).await;
        peer.sink.send(Frame::Text("surprise".into())).await.unwrap();
        tokio::time::timeout(WAIT, conn.closed()).await.unwrap();
        assert!(conn.is_closed());
    }

    #[tokio::test]
    async fn test_control_frames_are_not_handed_off() {
        let pool = pool();
        let (conn, mut peer) = attached(Side::Gateway, &pool).await;
        peer.sink.send(Frame::Ping(Bytes::new())).await.unwrap();
        peer.sink.send(Frame::Pong(Bytes::new())).await.unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(conn.status(), Status::Idle);
    }

    #[tokio::test]
    async fn test_agent_accepts_request_while_idle() {
        let pool = pool();
        let (conn, mut peer) = attached(Side::Agent, &pool).await;
        peer.sink.send(Frame::Text("{}".into())).await.unwrap();
        let handoff = tokio::time::timeout(WAIT, conn.next_frame(None))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(handoff.frame(), &Frame::Text("{}".into()));
        assert_eq!(conn.status(), Status::Idle);
    }

    #[tokio::test]
    async fn test_slow_consumer_keeps_frame_order() {
        let pool = pool();
        let (conn, mut peer) = attached(Side::Gateway, &pool).await;
        assert!(conn.try_activate());
        peer.sink.send(Frame::Text("head".into())).await.unwrap();
        peer.sink
            .send(Frame::Binary(Bytes::from_static(b"body")))
            .await
            .unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;

        let head = conn.next_frame(Some(WAIT)).await.unwrap().into_text().unwrap();
        let body = conn.next_frame(Some(WAIT)).await.unwrap().into_binary().unwrap();
        assert_eq!(head, "head");
        assert_eq!(&body[..], b"body");
    }

    #[tokio::test]
    async fn test_close_unblocks_waiting_exchange() {
        let pool = pool();
        let (conn, _peer) = attached(Side::Gateway, &pool).await;
        assert!(conn.try_activate());
        let waiter = {
            let conn = conn.clone();
            tokio::spawn(async move { conn.next_frame(None).await.map(|_| ()) })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        conn.close().await;
        let result = tokio::time::timeout(WAIT, waiter).await.unwrap().unwrap();
        assert!(matches!(result, Err(TunnelError::Closed)));
    }

    #[tokio::test]
    async fn test_proxy_request_frames_in_order() {
        let pool = pool();
        let (conn, mut peer) = attached(Side::Gateway, &pool).await;

        let agent = tokio::spawn(async move {
            let head = peer.next_data_frame().await.unwrap();
            let body = peer.next_data_frame().await.unwrap();
            respond(&mut peer, 200, b"pong").await;
            (head, body, peer)
        });

        let response = conn
            .proxy_request(&get("http://origin/ping", b"ping"))
            .await
            .unwrap();
        let (head, body, _peer) = agent.await.unwrap();

        let Frame::Text(head) = head else {
            panic!("request header must be a text frame");
        };
        let record: HttpRequestRecord = serde_json::from_str(&head).unwrap();
        assert_eq!(record.method, "GET");
        assert_eq!(record.url, "http://origin/ping");
        assert_eq!(record.content_length, 4);
        assert_eq!(record.header["X-Trace"], vec!["abc"]);
        assert_eq!(body, Frame::Binary(Bytes::from_static(b"ping")));

        assert_eq!(response.status(), 200);
        assert_eq!(response.headers()["x-from"], "agent");
        let bytes = axum::body::to_bytes(response.into_body(), 1024).await.unwrap();
        assert_eq!(&bytes[..], b"pong");
        assert_eq!(conn.status(), Status::Idle);
    }

    #[tokio::test]
    async fn test_empty_body_still_sends_frame() {
        let pool = pool();
        let (conn, mut peer) = attached(Side::Gateway, &pool).await;
        let agent = tokio::spawn(async move {
            let _head = peer.next_data_frame().await.unwrap();
            let body = peer.next_data_frame().await.unwrap();
            respond(&mut peer, 204, b"").await;
            body
        });
        let response = conn.proxy_request(&get("http://origin/", b"")).await.unwrap();
        assert_eq!(agent.await.unwrap(), Frame::Binary(Bytes::new()));
        assert_eq!(response.status(), 204);
    }

    #[tokio::test]
    async fn test_proxy_request_requires_idle() {
        let pool = pool();
        let (conn, _peer) = attached(Side::Gateway, &pool).await;
        assert!(conn.try_activate());
        let err = conn.proxy_request(&get("http://origin/", b"")).await.unwrap_err();
        assert!(matches!(err, TunnelError::NotReady));
        // A refused start does not tear the connection down.
        assert_eq!(conn.status(), Status::Active);
    }

    #[tokio::test]
    async fn test_proxy_activated_requires_active() {
        let pool = pool();
        let (conn, _peer) = attached(Side::Gateway, &pool).await;
        let err = conn.proxy_activated(&get("http://origin/", b"")).await.unwrap_err();
        assert!(matches!(err, TunnelError::NotReady));
        assert_eq!(conn.status(), Status::Idle);
    }

    #[tokio::test]
    async fn test_malformed_response_closes_connection() {
        let pool = pool();
        let (conn, mut peer) = attached(Side::Gateway, &pool).await;
        tokio::spawn(async move {
            let _ = peer.next_data_frame().await;
            let _ = peer.next_data_frame().await;
            peer.sink.send(Frame::Text("not json".into())).await.unwrap();
            // Hold the transport open.
            let _ = peer.stream.next().await;
        });
        let err = conn.proxy_request(&get("http://origin/", b"")).await.unwrap_err();
        assert!(matches!(err, TunnelError::Codec(_)));
        assert_eq!(conn.status(), Status::Closed);
    }

    #[tokio::test]
    async fn test_out_of_order_frame_is_protocol_error() {
        let pool = pool();
        let (conn, mut peer) = attached(Side::Gateway, &pool).await;
        tokio::spawn(async move {
            let _ = peer.next_data_frame().await;
            let _ = peer.next_data_frame().await;
            peer.sink
                .send(Frame::Binary(Bytes::from_static(b"body first")))
                .await
                .unwrap();
            let _ = peer.stream.next().await;
        });
        let err = conn.proxy_request(&get("http://origin/", b"")).await.unwrap_err();
        assert!(matches!(err, TunnelError::Protocol(_)));
        assert!(conn.is_closed());
    }

    #[tokio::test]
    async fn test_silent_agent_times_out() {
        let pool = pool();
        let (local, mut peer) = memory_pair();
        let conn = TunnelConnection::new(Side::Gateway, &pool, Duration::from_millis(50));
        conn.attach(local).await.unwrap();
        tokio::spawn(async move { while peer.stream.next().await.is_some() {} });

        let err = conn.proxy_request(&get("http://origin/", b"")).await.unwrap_err();
        assert!(matches!(err, TunnelError::Timeout));
        assert!(conn.is_closed());
    }
}
