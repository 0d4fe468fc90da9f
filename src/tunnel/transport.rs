//! Message-oriented duplex transport under a tunnel connection.
//!
//! Both ends of the tunnel speak WebSocket, but through two different
//! libraries: the gateway gets an axum `WebSocket` from its upgrade handler,
//! the agent dials with `tokio-tungstenite`. [`Transport`] erases the
//! difference into a boxed frame sink and a boxed frame stream.

use std::pin::Pin;

use bytes::Bytes;
use futures::{future, Sink, SinkExt, Stream, StreamExt};
use tokio::io::{AsyncRead, AsyncWrite};

use crate::error::TunnelError;

/// One discrete WebSocket message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Frame {
    Text(String),
    Binary(Bytes),
    Ping(Bytes),
    Pong(Bytes),
    Close,
}

impl Frame {
    /// Short name used in protocol-violation messages.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Text(_) => "text",
            Self::Binary(_) => "binary",
            Self::Ping(_) => "ping",
            Self::Pong(_) => "pong",
            Self::Close => "close",
        }
    }
}

pub type FrameSink = Pin<Box<dyn Sink<Frame, Error = TunnelError> + Send>>;
pub type FrameStream = Pin<Box<dyn Stream<Item = Result<Frame, TunnelError>> + Send>>;

/// An established tunnel transport, split into its write and read halves.
pub struct Transport {
    pub sink: FrameSink,
    pub stream: FrameStream,
}

impl Transport {
    /// Wrap a WebSocket accepted by the gateway's axum upgrade handler.
    pub fn from_axum(socket: axum::extract::ws::WebSocket) -> Self {
        use axum::extract::ws::Message;

        let (sink, stream) = socket.split();
        let sink = sink.sink_map_err(TunnelError::from).with(|frame: Frame| {
            future::ready(Ok::<_, TunnelError>(match frame {
                Frame::Text(text) => Message::Text(text.into()),
                Frame::Binary(data) => Message::Binary(data),
                Frame::Ping(data) => Message::Ping(data),
                Frame::Pong(data) => Message::Pong(data),
                Frame::Close => Message::Close(None),
            }))
        });
        let stream = stream.map(|msg| -> Result<Frame, TunnelError> {
            Ok(match msg? {
                Message::Text(text) => Frame::Text(text.as_str().to_owned()),
                Message::Binary(data) => Frame::Binary(data),
                Message::Ping(data) => Frame::Ping(data),
                Message::Pong(data) => Frame::Pong(data),
                Message::Close(_) => Frame::Close,
            })
        });

        Self {
            sink: Box::pin(sink),
            stream: Box::pin(stream),
        }
    }

    /// Wrap a WebSocket dialed by the agent.
    pub fn from_tungstenite<S>(ws: tokio_tungstenite::WebSocketStream<S>) -> Self
    where
        S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
    {
        use tokio_tungstenite::tungstenite::Message;

        let (sink, stream) = ws.split();
        let sink = sink.sink_map_err(TunnelError::from).with(|frame: Frame| {
            future::ready(Ok::<_, TunnelError>(match frame {
                Frame::Text(text) => Message::Text(text.into()),
                Frame::Binary(data) => Message::Binary(data),
                Frame::Ping(data) => Message::Ping(data),
                Frame::Pong(data) => Message::Pong(data),
                Frame::Close => Message::Close(None),
            }))
        });
        // Raw frames only exist on the write path.
        let stream = stream.filter_map(|msg| {
            future::ready(match msg {
                Ok(Message::Text(text)) => Some(Ok(Frame::Text(text.as_str().to_owned()))),
                Ok(Message::Binary(data)) => Some(Ok(Frame::Binary(data))),
                Ok(Message::Ping(data)) => Some(Ok(Frame::Ping(data))),
                Ok(Message::Pong(data)) => Some(Ok(Frame::Pong(data))),
                Ok(Message::Close(_)) => Some(Ok(Frame::Close)),
                Ok(Message::Frame(_)) => None,
                Err(e) => Some(Err(TunnelError::from(e))),
            })
        });

        Self {
            sink: Box::pin(sink),
            stream: Box::pin(stream),
        }
    }

    /// Read the first data message, skipping control frames.
    pub async fn next_data_frame(&mut self) -> Result<Frame, TunnelError> {
        loop {
            match self.stream.next().await {
                Some(Ok(Frame::Ping(_) | Frame::Pong(_))) => {}
                Some(Ok(Frame::Close)) | None => return Err(TunnelError::Closed),
                Some(Ok(frame)) => return Ok(frame),
                Some(Err(e)) => return Err(e),
            }
        }
    }
}

/// In-memory transport pair for tests: frames sent on one side arrive on the other.
#[cfg(test)]
pub(crate) fn memory_pair() -> (Transport, Transport) {
    use futures::channel::mpsc;

    fn side(tx: mpsc::UnboundedSender<Frame>, rx: mpsc::UnboundedReceiver<Frame>) -> Transport {
        Transport {
            sink: Box::pin(tx.sink_map_err(|_| TunnelError::Closed)),
            stream: Box::pin(rx.map(Ok)),
        }
    }

    let (a_tx, a_rx) = mpsc::unbounded();
    let (b_tx, b_rx) = mpsc::unbounded();
    (side(a_tx, b_rx), side(b_tx, a_rx))
}
