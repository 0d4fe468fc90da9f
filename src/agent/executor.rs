//! Agent-side request execution: one loop per tunnel connection.

use std::sync::Arc;

use bytes::Bytes;
use http_body_util::{BodyExt, Full, Limited};
use hyper_tls::HttpsConnector;
use hyper_util::client::legacy::connect::HttpConnector;
use hyper_util::client::legacy::Client;
use hyper_util::rt::TokioExecutor;
use tracing::{debug, info};

use crate::config::{AgentConfig, DestinationMode};
use crate::error::TunnelError;
use crate::record::{HttpRequestRecord, HttpResponseRecord};
use crate::tunnel::{Frame, TunnelConnection};

/// Runs tunneled requests against the real origins over HTTP/1.1, with TLS
/// for `https` destinations.
#[derive(Clone)]
pub struct Executor {
    client: Client<HttpsConnector<HttpConnector>, Full<Bytes>>,
    destination: DestinationMode,
    max_body: usize,
}

impl Executor {
    pub fn new(config: &AgentConfig) -> Self {
        Self {
            client: Client::builder(TokioExecutor::new()).build(HttpsConnector::new()),
            destination: config.destination,
            max_body: config.max_body_bytes,
        }
    }

    /// Serve requests on `conn` until an exchange fails, then close it.
    ///
    /// `on_request` fires as soon as a request starts, so the owner can
    /// replenish idle capacity while this connection is busy.
    pub async fn serve<F>(&self, conn: Arc<TunnelConnection>, on_request: F)
    where
        F: Fn() + Send + Sync,
    {
        loop {
            if let Err(e) = self.execute_one(&conn, &on_request).await {
                match e {
                    TunnelError::Closed => debug!(conn = %conn.id(), "Tunnel connection closed"),
                    e => info!(conn = %conn.id(), "Tunneled request failed: {e}"),
                }
                break;
            }
        }
        conn.close().await;
    }

    async fn execute_one<F>(&self, conn: &TunnelConnection, on_request: &F) -> Result<(), TunnelError>
    where
        F: Fn() + Send + Sync,
    {
        // Idle wait for the next request has no deadline.
        let head = conn.next_frame(None).await?;
        if !conn.try_activate() {
            return Err(TunnelError::NotReady);
        }
        on_request();

        let record: HttpRequestRecord = serde_json::from_str(&head.into_text()?)?;
        let body = conn
            .next_frame(Some(conn.frame_timeout()))
            .await?
            .into_binary()?;

        let (head, body) = self.execute(record, body).await?;
        conn.send(Frame::Text(serde_json::to_string(&head)?)).await?;
        conn.send(Frame::Binary(body)).await?;

        if !conn.release() {
            return Err(TunnelError::Closed);
        }
        Ok(())
    }

    /// Call the origin and buffer its response.
    async fn execute(
        &self,
        record: HttpRequestRecord,
        body: Bytes,
    ) -> Result<(HttpResponseRecord, Bytes), TunnelError> {
        let request = record.into_request(self.destination, body)?;
        debug!(method = %request.method(), uri = %request.uri(), "Executing tunneled request");

        let response = self
            .client
            .request(request)
            .await
            .map_err(|e| TunnelError::Origin(e.to_string()))?;
        let (parts, body) = response.into_parts();
        let body = Limited::new(body, self.max_body)
            .collect()
            .await
            .map_err(|e| TunnelError::Origin(format!("reading response body: {e}")))?
            .to_bytes();
        Ok((HttpResponseRecord::from_parts(&parts, body.len()), body))
    }
}
