//! Gateway: accepts agent registrations and tunnels client requests to them.
//!
//! | Method | Path                 | Description                                  |
//! |--------|----------------------|----------------------------------------------|
//! | GET    | `{register_path}`    | Agent WebSocket registration (one connection) |
//! | GET    | `/stats`             | Pools with their limits and size snapshot    |
//! | GET    | `/test`              | Liveness probe, returns `ok`                 |
//! | any    | anything else        | Tunneled to an agent                         |
//!
//! Failures to reach an agent answer with status 526 and a plain-text reason.

pub mod dispatch;
pub mod registry;

use std::sync::Arc;
use std::time::Duration;

use axum::{
    extract::{Request, State, WebSocketUpgrade},
    http::{header, StatusCode, Uri},
    response::{IntoResponse, Response},
    routing::get,
    Json, Router,
};
use bytes::Bytes;
use serde_json::json;
use tokio::task::JoinHandle;
use tower::limit::GlobalConcurrencyLimitLayer;
use tower_http::trace::TraceLayer;
use tracing::{debug, warn};

use crate::config::{DestinationMode, GatewayConfig};
use crate::error::TunnelError;
use crate::record::{parse_absolute, DESTINATION_HEADER};
use crate::tunnel::Transport;

pub use dispatch::Dispatcher;
pub use registry::{PoolRegistry, RegistrySettings};

/// Room for the request record on top of the largest body frame.
const RECORD_ALLOWANCE: usize = 64 * 1024;

/// State shared by every gateway handler.
#[derive(Clone)]
pub struct GatewayState {
    pub config: Arc<GatewayConfig>,
    pub registry: Arc<PoolRegistry>,
    pub dispatcher: Arc<Dispatcher>,
}

impl GatewayState {
    pub fn new(config: GatewayConfig) -> Self {
        let registry = PoolRegistry::new(RegistrySettings::from(&config));
        let dispatcher = Dispatcher::new(
            Arc::clone(&registry),
            config.dispatch_deadline(),
            config.retry_interval(),
        );
        Self {
            config: Arc::new(config),
            registry,
            dispatcher: Arc::new(dispatcher),
        }
    }
}

/// Build the gateway router.
pub fn gateway_router(state: GatewayState) -> Router {
    Router::new()
        .route(&state.config.register_path, get(register_ws))
        .route("/stats", get(stats))
        .route("/test", get(|| async { "ok" }))
        .fallback(proxy)
        .layer(GlobalConcurrencyLimitLayer::new(
            state.config.max_concurrent_requests,
        ))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

/// Periodically drop closed connections and empty pools.
pub fn spawn_sweep(registry: Arc<PoolRegistry>, every: Duration) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(every);
        interval.tick().await;
        loop {
            interval.tick().await;
            let removed = registry.prune().await;
            if !removed.is_empty() {
                debug!(count = removed.len(), "Swept empty connection pools");
            }
        }
    })
}

/// The distinguished upstream-error status.
fn tunnel_error_status() -> StatusCode {
    StatusCode::from_u16(526).unwrap_or(StatusCode::BAD_GATEWAY)
}

fn tunnel_error(e: &TunnelError) -> Response {
    (
        tunnel_error_status(),
        [(header::CONTENT_TYPE, "text/plain; charset=utf-8")],
        e.to_string(),
    )
        .into_response()
}

/// `GET {register_path}`: one WebSocket, one tunnel connection.
async fn register_ws(State(state): State<GatewayState>, ws: WebSocketUpgrade) -> Response {
    let registry = Arc::clone(&state.registry);
    ws.max_message_size(state.config.max_body_bytes.saturating_add(RECORD_ALLOWANCE))
        .on_upgrade(move |socket| async move {
            if let Err(e) = registry.register(Transport::from_axum(socket)).await {
                warn!("Rejected tunnel registration: {e}");
            }
        })
}

/// `GET /stats`
async fn stats(State(state): State<GatewayState>) -> Response {
    Json(json!({ "pools": state.registry.snapshot().await })).into_response()
}

/// Any other request: buffer it and tunnel it through some agent.
async fn proxy(State(state): State<GatewayState>, request: Request) -> Response {
    let request = match prepare(&state.config, request).await {
        Ok(request) => request,
        Err(e) => {
            debug!("Rejected proxy request: {e}");
            return tunnel_error(&e);
        }
    };

    match state.dispatcher.dispatch(&request).await {
        Ok(response) => response,
        Err(e) => {
            if e.is_admission() {
                debug!(uri = %request.uri(), "No tunnel connection: {e}");
            }
            tunnel_error(&e)
        }
    }
}

/// Resolve the destination and read the whole body, so a failed attempt
/// never has to replay a half-consumed client stream.
async fn prepare(config: &GatewayConfig, request: Request) -> Result<axum::http::Request<Bytes>, TunnelError> {
    let (mut parts, body) = request.into_parts();

    match config.destination {
        DestinationMode::Header => {
            let value = parts
                .headers
                .get(DESTINATION_HEADER)
                .ok_or_else(|| {
                    TunnelError::Destination(format!("Missing {DESTINATION_HEADER} header"))
                })?;
            value
                .to_str()
                .ok()
                .and_then(|raw| parse_absolute(raw).ok())
                .ok_or_else(|| {
                    TunnelError::Destination(format!("Unable to parse {DESTINATION_HEADER} header"))
                })?;
        }
        DestinationMode::Url => {
            parts.uri = absolute_uri(&parts.uri, &parts.headers)?;
        }
    }

    let body = axum::body::to_bytes(body, config.max_body_bytes)
        .await
        .map_err(|e| TunnelError::Body(e.to_string()))?;
    Ok(axum::http::Request::from_parts(parts, body))
}

/// Forward-proxy requests already carry an absolute URI; origin-form ones
/// are completed from `Host`.
fn absolute_uri(uri: &Uri, headers: &axum::http::HeaderMap) -> Result<Uri, TunnelError> {
    if uri.scheme().is_some() && uri.authority().is_some() {
        return Ok(uri.clone());
    }
    let host = headers
        .get(header::HOST)
        .and_then(|h| h.to_str().ok())
        .ok_or_else(|| TunnelError::Destination("Missing destination host".to_string()))?;
    let path = uri.path_and_query().map_or("/", |pq| pq.as_str());
    parse_absolute(&format!("http://{host}{path}"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::Body;

    fn config(destination: DestinationMode) -> GatewayConfig {
        GatewayConfig {
            destination,
            max_body_bytes: 16,
            ..GatewayConfig::default()
        }
    }

    fn request(uri: &str) -> axum::http::request::Builder {
        axum::http::Request::builder().method("POST").uri(uri)
    }

    #[tokio::test]
    async fn test_prepare_keeps_absolute_uri() {
        let req = request("http://origin:9000/a?b=1")
            .body(Body::from("hi"))
            .unwrap();
        let prepared = prepare(&config(DestinationMode::Url), req).await.unwrap();
        assert_eq!(prepared.uri().to_string(), "http://origin:9000/a?b=1");
        assert_eq!(&prepared.body()[..], b"hi");
    }

    #[tokio::test]
    async fn test_prepare_completes_relative_uri_from_host() {
        let req = request("/a?b=1")
            .header("host", "origin.local")
            .body(Body::empty())
            .unwrap();
        let prepared = prepare(&config(DestinationMode::Url), req).await.unwrap();
        assert_eq!(prepared.uri().to_string(), "http://origin.local/a?b=1");
    }

    #[tokio::test]
    async fn test_prepare_requires_destination_header() {
        let req = request("/a").body(Body::empty()).unwrap();
        let err = prepare(&config(DestinationMode::Header), req).await.unwrap_err();
        assert_eq!(err.to_string(), "Missing X-PROXY-DESTINATION header");

        let req = request("/a")
            .header(DESTINATION_HEADER, "not a url")
            .body(Body::empty())
            .unwrap();
        let err = prepare(&config(DestinationMode::Header), req).await.unwrap_err();
        assert_eq!(err.to_string(), "Unable to parse X-PROXY-DESTINATION header");
    }

    #[tokio::test]
    async fn test_prepare_rejects_oversized_body() {
        let req = request("http://origin/")
            .body(Body::from(vec![0u8; 64]))
            .unwrap();
        let err = prepare(&config(DestinationMode::Url), req).await.unwrap_err();
        assert!(matches!(err, TunnelError::Body(_)));
    }

    #[tokio::test]
    async fn test_errors_map_to_526() {
        let response = tunnel_error(&TunnelError::NoProxyAvailable);
        assert_eq!(response.status().as_u16(), 526);
        let body = axum::body::to_bytes(response.into_body(), 1024).await.unwrap();
        assert_eq!(&body[..], b"No proxy available");
    }

    #[tokio::test]
    async fn test_proxy_without_agents_answers_526() {
        let state = GatewayState::new(config(DestinationMode::Url));
        let req = request("http://origin/").body(Body::empty()).unwrap();
        let response = proxy(State(state), req).await;
        assert_eq!(response.status().as_u16(), 526);
        let body = axum::body::to_bytes(response.into_body(), 1024).await.unwrap();
        assert_eq!(&body[..], b"No proxy available");
    }

    #[tokio::test]
    async fn test_stats_lists_pools() {
        let state = GatewayState::new(GatewayConfig::default());
        let response = stats(State(state)).await;
        assert_eq!(response.status(), StatusCode::OK);
        let body = axum::body::to_bytes(response.into_body(), 1024).await.unwrap();
        let value: serde_json::Value = serde_json::from_slice(&body).unwrap();
        assert_eq!(value["pools"], json!([]));
    }
}
