//! WebSocket transport abstraction.
//!
//! The tunnel core never talks to a concrete WebSocket type. Both ends of the
//! system are adapted to one [`Transport`]:
//!
//! - the server side wraps the socket handed out by axum's `WebSocketUpgrade`
//!   ([`Transport::from_axum`]),
//! - the client side wraps a `tokio-tungstenite` client stream
//!   ([`Transport::from_tungstenite`]), opened by a [`TransportFactory`].
//!
//! Ping/pong frames are answered by the WebSocket libraries themselves and
//! never surface here. What remains is [`Frame::Binary`] (tunnel bytes),
//! [`Frame::Text`] (never valid for a tunnel) and [`Frame::Close`].
//!
//! A transport is split into a sink and a stream guarded by separate locks so
//! one task can block on [`Transport::recv`] while another calls
//! [`Transport::send`].

use std::fmt;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, Ordering};

use bytes::Bytes;
use futures::future::{self, BoxFuture};
use futures::{Sink, SinkExt, Stream, StreamExt};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::Mutex;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::http::{header::AUTHORIZATION, HeaderValue};
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::tungstenite::protocol::CloseFrame;
use tokio_tungstenite::tungstenite::{self, Message};
use tokio_tungstenite::WebSocketStream;
use tracing::debug;

/// Close code for a normal closure (RFC 6455 §7.4.1).
pub const NORMAL_CLOSURE: u16 = 1000;

/// Close code for an unexpected server-side condition.
pub const INTERNAL_ERROR: u16 = 1011;

/// Maximum payload carried by one binary frame. Readers feeding a transport
/// use a buffer of this size so one read maps to one frame.
pub const FRAME_SIZE: usize = 32 * 1024;

/// A single frame exchanged over a [`Transport`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Frame {
    /// Raw tunnel bytes.
    Binary(Bytes),
    /// Text payload. Only produced by misbehaving peers.
    Text(String),
    /// Close frame with an optional status.
    Close(Option<CloseReason>),
}

/// Status carried by a close frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CloseReason {
    pub code: u16,
    pub reason: String,
}

impl CloseReason {
    /// A normal-closure status with a diagnostic reason (e.g. `"handover"`).
    pub fn normal(reason: &str) -> Self {
        Self {
            code: NORMAL_CLOSURE,
            reason: reason.to_string(),
        }
    }

    /// An internal-error status, e.g. when the tunnel's process cannot start.
    pub fn internal_error(reason: &str) -> Self {
        Self {
            code: INTERNAL_ERROR,
            reason: reason.to_string(),
        }
    }

    pub fn is_normal(&self) -> bool {
        self.code == NORMAL_CLOSURE
    }
}

impl fmt::Display for CloseReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.reason.is_empty() {
            write!(f, "code {}", self.code)
        } else {
            write!(f, "code {} ({})", self.code, self.reason)
        }
    }
}

/// Returns `true` when a received close frame means "clean shutdown".
///
/// An empty close frame carries no status; peers use it for orderly
/// shutdown, so it counts as normal.
pub fn is_normal_close(reason: Option<&CloseReason>) -> bool {
    reason.is_none_or(CloseReason::is_normal)
}

/// Errors produced by a [`Transport`] or [`TransportFactory`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransportError {
    /// The stream ended after the close handshake completed.
    Eof,
    /// Socket-level failure.
    Io(String),
    /// WebSocket protocol failure (bad framing, reset without close, ...).
    Protocol(String),
    /// Opening a new transport failed before the upgrade completed.
    Connect(String),
    /// The endpoint answered the upgrade request with a non-101 status.
    Rejected(u16),
}

impl fmt::Display for TransportError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Eof => write!(f, "transport closed"),
            Self::Io(e) => write!(f, "transport I/O error: {e}"),
            Self::Protocol(e) => write!(f, "WebSocket protocol error: {e}"),
            Self::Connect(e) => write!(f, "failed to open transport: {e}"),
            Self::Rejected(status) => write!(f, "upgrade rejected with HTTP {status}"),
        }
    }
}

impl std::error::Error for TransportError {}

impl From<tungstenite::Error> for TransportError {
    fn from(e: tungstenite::Error) -> Self {
        match e {
            tungstenite::Error::ConnectionClosed | tungstenite::Error::AlreadyClosed => Self::Eof,
            tungstenite::Error::Io(e) => Self::Io(e.to_string()),
            tungstenite::Error::Http(response) => Self::Rejected(response.status().as_u16()),
            other => Self::Protocol(other.to_string()),
        }
    }
}

impl From<axum::Error> for TransportError {
    fn from(e: axum::Error) -> Self {
        Self::Io(e.to_string())
    }
}

type FrameSink = Pin<Box<dyn Sink<Frame, Error = TransportError> + Send>>;
type FrameStream = Pin<Box<dyn Stream<Item = Result<Frame, TransportError>> + Send>>;

/// One live WebSocket connection carrying tunnel frames.
pub struct Transport {
    sink: Mutex<FrameSink>,
    stream: Mutex<FrameStream>,
    /// Set once a close frame was sent or received; further close requests
    /// only flush the handshake.
    closing: AtomicBool,
}

impl Transport {
    /// Build a transport from any frame sink/stream pair.
    pub fn new<Si, St>(sink: Si, stream: St) -> Self
    where
        Si: Sink<Frame, Error = TransportError> + Send + 'static,
        St: Stream<Item = Result<Frame, TransportError>> + Send + 'static,
    {
        Self {
            sink: Mutex::new(Box::pin(sink)),
            stream: Mutex::new(Box::pin(stream)),
            closing: AtomicBool::new(false),
        }
    }

    /// Wrap a `tokio-tungstenite` stream (client side, or raw sockets in tests).
    pub fn from_tungstenite<S>(ws: WebSocketStream<S>) -> Self
    where
        S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
    {
        let (sink, stream) = ws.split();
        let sink = sink
            .sink_map_err(TransportError::from)
            .with(|frame: Frame| future::ready(Ok::<_, TransportError>(to_tungstenite(frame))));
        let stream = stream.filter_map(|msg| {
            future::ready(match msg {
                Ok(Message::Binary(data)) => Some(Ok(Frame::Binary(data))),
                Ok(Message::Text(text)) => Some(Ok(Frame::Text(text.as_str().to_owned()))),
                Ok(Message::Close(frame)) => Some(Ok(Frame::Close(frame.map(|f| CloseReason {
                    code: f.code.into(),
                    reason: f.reason.as_str().to_owned(),
                })))),
                Ok(Message::Ping(_) | Message::Pong(_) | Message::Frame(_)) => None,
                Err(e) => Some(Err(e.into())),
            })
        });
        Self::new(sink, stream)
    }

    /// Wrap an upgraded axum socket (server side).
    pub fn from_axum(socket: axum::extract::ws::WebSocket) -> Self {
        use axum::extract::ws::Message as AxumMessage;

        let (sink, stream) = socket.split();
        let sink = sink
            .sink_map_err(TransportError::from)
            .with(|frame: Frame| future::ready(Ok::<_, TransportError>(to_axum(frame))));
        let stream = stream.filter_map(|msg| {
            future::ready(match msg {
                Ok(AxumMessage::Binary(data)) => Some(Ok(Frame::Binary(data))),
                Ok(AxumMessage::Text(text)) => Some(Ok(Frame::Text(text.as_str().to_owned()))),
                Ok(AxumMessage::Close(frame)) => Some(Ok(Frame::Close(frame.map(|f| {
                    CloseReason {
                        code: f.code,
                        reason: f.reason.as_str().to_owned(),
                    }
                })))),
                Ok(AxumMessage::Ping(_) | AxumMessage::Pong(_)) => None,
                Err(e) => Some(Err(e.into())),
            })
        });
        Self::new(sink, stream)
    }

    /// Write one frame.
    ///
    /// Sending a close frame on a transport that is already closing is a
    /// no-op apart from flushing the pending handshake.
    pub async fn send(&self, frame: Frame) -> Result<(), TransportError> {
        let is_close = matches!(frame, Frame::Close(_));
        if is_close && self.closing.swap(true, Ordering::SeqCst) {
            self.shutdown().await;
            return Ok(());
        }
        let mut sink = self.sink.lock().await;
        match sink.send(frame).await {
            Err(TransportError::Eof) if is_close => Ok(()),
            other => other,
        }
    }

    /// Read the next frame. A stream that ended yields [`TransportError::Eof`].
    pub async fn recv(&self) -> Result<Frame, TransportError> {
        let mut stream = self.stream.lock().await;
        match stream.next().await {
            Some(Ok(frame)) => {
                if matches!(frame, Frame::Close(_)) {
                    self.closing.store(true, Ordering::SeqCst);
                }
                Ok(frame)
            }
            Some(Err(e)) => Err(e),
            None => Err(TransportError::Eof),
        }
    }

    /// Flush any pending close reply and close the write half. Errors are
    /// ignored: the transport is being retired either way.
    pub async fn shutdown(&self) {
        let mut sink = self.sink.lock().await;
        if let Err(e) = sink.close().await {
            debug!("transport shutdown: {e}");
        }
    }

    pub fn is_closing(&self) -> bool {
        self.closing.load(Ordering::SeqCst)
    }
}

fn to_tungstenite(frame: Frame) -> Message {
    match frame {
        Frame::Binary(data) => Message::Binary(data),
        Frame::Text(text) => Message::Text(text.into()),
        Frame::Close(reason) => Message::Close(reason.map(|r| CloseFrame {
            code: CloseCode::from(r.code),
            reason: r.reason.into(),
        })),
    }
}

fn to_axum(frame: Frame) -> axum::extract::ws::Message {
    use axum::extract::ws::{CloseFrame as AxumCloseFrame, Message as AxumMessage};

    match frame {
        Frame::Binary(data) => AxumMessage::Binary(data),
        Frame::Text(text) => AxumMessage::Text(text.into()),
        Frame::Close(reason) => AxumMessage::Close(reason.map(|r| AxumCloseFrame {
            code: r.code,
            reason: r.reason.into(),
        })),
    }
}

/// Opens (or re-opens) a transport for a correlation id.
///
/// The same id is passed for the initial connection and for every handover
/// of that tunnel; the server uses it to tell a reconnect from a new session.
pub trait TransportFactory: Send + Sync {
    fn open<'a>(&'a self, id: &'a str) -> BoxFuture<'a, Result<Transport, TransportError>>;
}

/// Client-side factory dialing the tunnel endpoint with `tokio-tungstenite`.
pub struct WsTransportFactory {
    url: String,
    token: Option<String>,
}

impl WsTransportFactory {
    /// `url` is the tunnel endpoint (`ws://` or `wss://`). `token`, when set,
    /// is sent as `Authorization: Bearer <token>` on every upgrade request.
    pub fn new(url: impl Into<String>, token: Option<String>) -> Self {
        Self {
            url: url.into(),
            token,
        }
    }

    /// Endpoint URL with the correlation id appended as the `id` query param.
    pub fn url_for(&self, id: &str) -> String {
        let sep = if self.url.contains('?') { '&' } else { '?' };
        format!("{}{sep}id={id}", self.url)
    }
}

impl TransportFactory for WsTransportFactory {
    fn open<'a>(&'a self, id: &'a str) -> BoxFuture<'a, Result<Transport, TransportError>> {
        Box::pin(async move {
            let url = self.url_for(id);
            let mut request = url.as_str().into_client_request()?;
            if let Some(token) = &self.token {
                let value = HeaderValue::from_str(&format!("Bearer {token}"))
                    .map_err(|e| TransportError::Connect(e.to_string()))?;
                request.headers_mut().insert(AUTHORIZATION, value);
            }
            let (ws, response) = tokio_tungstenite::connect_async(request).await?;
            debug!(id, status = %response.status(), "transport opened");
            Ok(Transport::from_tungstenite(ws))
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::transport_pair;

    #[test]
    fn test_url_for_appends_id() {
        let factory = WsTransportFactory::new("ws://127.0.0.1:7777/api/tunnel", None);
        assert_eq!(
            factory.url_for("abc-1"),
            "ws://127.0.0.1:7777/api/tunnel?id=abc-1"
        );

        let factory = WsTransportFactory::new("wss://host/tunnel?cluster=x", None);
        assert_eq!(factory.url_for("abc"), "wss://host/tunnel?cluster=x&id=abc");
    }

    #[test]
    fn test_close_reason_normal() {
        assert!(is_normal_close(None));
        assert!(is_normal_close(Some(&CloseReason::normal("handover"))));
        assert!(!is_normal_close(Some(&CloseReason {
            code: 1011,
            reason: String::new(),
        })));
    }

    #[test]
    fn test_tungstenite_error_mapping() {
        assert_eq!(
            TransportError::from(tungstenite::Error::ConnectionClosed),
            TransportError::Eof
        );
        assert_eq!(
            TransportError::from(tungstenite::Error::AlreadyClosed),
            TransportError::Eof
        );
    }

    #[tokio::test]
    async fn test_binary_frames_in_order() {
        let (client, server) = transport_pair().await;
        for i in 0..5u8 {
            client
                .send(Frame::Binary(Bytes::from(vec![i; 3])))
                .await
                .unwrap();
        }
        for i in 0..5u8 {
            assert_eq!(
                server.recv().await.unwrap(),
                Frame::Binary(Bytes::from(vec![i; 3]))
            );
        }
    }

    #[tokio::test]
    async fn test_close_handshake() {
        let (client, server) = transport_pair().await;
        server
            .send(Frame::Close(Some(CloseReason::normal("handover"))))
            .await
            .unwrap();

        let frame = client.recv().await.unwrap();
        assert_eq!(frame, Frame::Close(Some(CloseReason::normal("handover"))));
        assert!(client.is_closing());

        // Flushes the automatic close reply.
        client.shutdown().await;
        assert!(matches!(server.recv().await.unwrap(), Frame::Close(_)));
        assert_eq!(server.recv().await.unwrap_err(), TransportError::Eof);
    }

    #[tokio::test]
    async fn test_second_close_is_noop() {
        let (client, _server) = transport_pair().await;
        client
            .send(Frame::Close(Some(CloseReason::normal(""))))
            .await
            .unwrap();
        client
            .send(Frame::Close(Some(CloseReason::normal(""))))
            .await
            .unwrap();
    }
}
