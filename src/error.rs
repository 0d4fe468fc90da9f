//! Error taxonomy shared by the gateway and the agent.
//!
//! Admission failures (`NoProxyAvailable`, `NoConnection`, `PoolFull`) are
//! recoverable and reported to the HTTP caller. Everything else is fatal to
//! the tunnel connection it happened on, never to the pool or the process.

use thiserror::Error;

/// Errors raised by tunnel connections, pools and the request paths on both sides.
#[derive(Debug, Error)]
pub enum TunnelError {
    /// The connection was not IDLE when an exchange tried to start on it.
    #[error("Proxy connection is not ready")]
    NotReady,

    /// `Offer` found the pool at capacity; the caller must close the connection.
    #[error("Connection pool is full")]
    PoolFull,

    /// The registry holds no pool at all.
    #[error("No proxy available")]
    NoProxyAvailable,

    /// The dispatch deadline elapsed before any pool handed out a connection.
    #[error("Unable to get a proxy connection")]
    NoConnection,

    /// The connection (or its reader loop) is gone.
    #[error("Tunnel connection closed")]
    Closed,

    /// A frame was not sent or received within the per-frame timeout.
    #[error("Timed out waiting on tunnel frame")]
    Timeout,

    /// Unexpected frame type or order.
    #[error("Protocol violation: {0}")]
    Protocol(String),

    /// The first message of a registering transport was unusable.
    #[error("Invalid greeting message: {0}")]
    Greeting(String),

    /// A request/response record failed to encode or decode.
    #[error("Unable to (de)serialize http record: {0}")]
    Codec(#[from] serde_json::Error),

    /// Read, write or dial failure on the underlying WebSocket.
    #[error("Transport error: {0}")]
    Transport(String),

    /// The client-facing request body could not be read.
    #[error("Unable to read request body: {0}")]
    Body(String),

    /// The agent's HTTP call against the real origin failed.
    #[error("Unable to execute request: {0}")]
    Origin(String),

    /// The request destination was missing or unparsable.
    #[error("{0}")]
    Destination(String),
}

impl TunnelError {
    /// Admission failures leave the connection (if any) untouched.
    pub fn is_admission(&self) -> bool {
        matches!(
            self,
            Self::PoolFull | Self::NoProxyAvailable | Self::NoConnection
        )
    }
}

impl From<axum::Error> for TunnelError {
    fn from(e: axum::Error) -> Self {
        Self::Transport(e.to_string())
    }
}

impl From<tokio_tungstenite::tungstenite::Error> for TunnelError {
    fn from(e: tokio_tungstenite::tungstenite::Error) -> Self {
        Self::Transport(e.to_string())
    }
}

impl From<tokio::time::error::Elapsed> for TunnelError {
    fn from(_: tokio::time::error::Elapsed) -> Self {
        Self::Timeout
    }
}
