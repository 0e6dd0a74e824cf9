//! Bidirectional frame transport with a connect/close lifecycle.
//!
//! The same [`Transport`] shape is used whether the peer is the hosted model,
//! the relay gateway, a client socket accepted by the relay, or an in-memory
//! test double:
//!
//! - [`WsConnector`]: tokio-tungstenite client (model or relay)
//! - [`socket_transport`]: adapter over an accepted axum WebSocket
//! - [`memory_pair`] / [`MemoryConnector`]: in-process channels for tests
//!
//! An I/O failure is reported once as [`TransportError::Connection`]; after
//! that (or after a clean close) the stream yields `None` forever.

use async_trait::async_trait;
use axum::extract::ws::{Message as AxumMessage, WebSocket};
use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::fmt;
use std::sync::atomic::{AtomicUsize, Ordering};
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::http::{HeaderName, HeaderValue};
use tokio_tungstenite::tungstenite::Message as WsMessage;

/// One message on the wire.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Frame {
    Text(String),
    Binary(Vec<u8>),
}

impl Frame {
    pub fn text(text: impl Into<String>) -> Self {
        Self::Text(text.into())
    }

    pub fn as_text(&self) -> Option<&str> {
        match self {
            Self::Text(text) => Some(text),
            Self::Binary(_) => None,
        }
    }
}

#[derive(Debug, Clone, thiserror::Error, PartialEq, Eq)]
pub enum TransportError {
    /// Connect failure or I/O error on an open connection. Fatal to the session.
    #[error("connection error: {0}")]
    Connection(String),
    /// Send after `close()` or after the peer went away.
    #[error("transport closed")]
    Closed,
    #[error("invalid transport config: {0}")]
    Config(String),
}

/// Outbound half of a transport.
#[async_trait]
pub trait FrameSink: Send {
    async fn send(&mut self, frame: Frame) -> Result<(), TransportError>;

    /// Close the connection. Idempotent.
    async fn close(&mut self);
}

/// Inbound half of a transport.
#[async_trait]
pub trait FrameStream: Send {
    /// Next inbound frame, in arrival order. `None` once closed or failed.
    async fn recv(&mut self) -> Option<Result<Frame, TransportError>>;
}

/// A connected transport, split into its two halves so each can be owned by
/// exactly one loop.
pub struct Transport {
    pub sink: Box<dyn FrameSink>,
    pub stream: Box<dyn FrameStream>,
}

impl Transport {
    pub fn new(sink: impl FrameSink + 'static, stream: impl FrameStream + 'static) -> Self {
        Self {
            sink: Box::new(sink),
            stream: Box::new(stream),
        }
    }

    pub fn split(self) -> (Box<dyn FrameSink>, Box<dyn FrameStream>) {
        (self.sink, self.stream)
    }
}

// ── Connection config ──────────────────────────────────────────────

/// How session configuration reaches the model.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransportMode {
    /// Talking to the model: the engine sends `session.update` itself.
    Direct,
    /// Talking to the relay: the engine sends `set_direction` and the relay
    /// builds the `session.update`.
    ViaRelay,
}

/// Endpoint, handshake headers and mode for a [`Connector`].
#[derive(Clone)]
pub struct TransportConfig {
    pub url: String,
    pub headers: Vec<(String, String)>,
    pub mode: TransportMode,
}

impl TransportConfig {
    /// Direct connection to the realtime model (`{base}?model={model}`).
    pub fn direct(base_url: &str, model: &str, api_key: &str) -> Self {
        let separator = if base_url.contains('?') { '&' } else { '?' };
        Self {
            url: format!("{base_url}{separator}model={model}"),
            headers: vec![
                ("Authorization".to_string(), format!("Bearer {api_key}")),
                ("OpenAI-Beta".to_string(), "realtime=v1".to_string()),
            ],
            mode: TransportMode::Direct,
        }
    }

    /// Connection to a relay gateway. No credential leaves the client.
    pub fn via_relay(relay_url: &str) -> Self {
        Self {
            url: relay_url.to_string(),
            headers: Vec::new(),
            mode: TransportMode::ViaRelay,
        }
    }
}

impl fmt::Debug for TransportConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let headers: Vec<(&str, &str)> = self
            .headers
            .iter()
            .map(|(name, value)| {
                if name.eq_ignore_ascii_case("authorization") {
                    (name.as_str(), "[REDACTED]")
                } else {
                    (name.as_str(), value.as_str())
                }
            })
            .collect();
        f.debug_struct("TransportConfig")
            .field("url", &self.url)
            .field("headers", &headers)
            .field("mode", &self.mode)
            .finish()
    }
}

/// Transport factory. The engine and relay only ever see this trait.
#[async_trait]
pub trait Connector: Send + Sync {
    async fn connect(&self) -> Result<Transport, TransportError>;

    fn mode(&self) -> TransportMode;
}

// ── WebSocket client (tokio-tungstenite) ───────────────────────────

type ClientSocket =
    tokio_tungstenite::WebSocketStream<tokio_tungstenite::MaybeTlsStream<tokio::net::TcpStream>>;

/// Connects to the model or the relay over `ws://` / `wss://`.
pub struct WsConnector {
    config: TransportConfig,
}

impl WsConnector {
    pub fn new(config: TransportConfig) -> Self {
        Self { config }
    }
}

#[async_trait]
impl Connector for WsConnector {
    async fn connect(&self) -> Result<Transport, TransportError> {
        let mut request = self
            .config
            .url
            .as_str()
            .into_client_request()
            .map_err(|e| TransportError::Config(format!("invalid url {}: {e}", self.config.url)))?;

        for (name, value) in &self.config.headers {
            let name = HeaderName::from_bytes(name.as_bytes())
                .map_err(|e| TransportError::Config(format!("invalid header name {name}: {e}")))?;
            let value = HeaderValue::from_str(value)
                .map_err(|e| TransportError::Config(format!("invalid header value: {e}")))?;
            request.headers_mut().insert(name, value);
        }

        let (socket, _response) = tokio_tungstenite::connect_async(request)
            .await
            .map_err(|e| TransportError::Connection(e.to_string()))?;

        tracing::info!(url = %self.config.url, mode = ?self.config.mode, "Transport connected");

        let (sink, stream) = socket.split();
        Ok(Transport::new(
            WsSink {
                inner: sink,
                closed: false,
            },
            WsStream {
                inner: stream,
                done: false,
            },
        ))
    }

    fn mode(&self) -> TransportMode {
        self.config.mode
    }
}

struct WsSink {
    inner: SplitSink<ClientSocket, WsMessage>,
    closed: bool,
}

#[async_trait]
impl FrameSink for WsSink {
    async fn send(&mut self, frame: Frame) -> Result<(), TransportError> {
        if self.closed {
            return Err(TransportError::Closed);
        }
        let message = match frame {
            Frame::Text(text) => WsMessage::Text(text.into()),
            Frame::Binary(bytes) => WsMessage::Binary(bytes.into()),
        };
        self.inner
            .send(message)
            .await
            .map_err(|e| TransportError::Connection(e.to_string()))
    }

    async fn close(&mut self) {
        if self.closed {
            return;
        }
        self.closed = true;
        let _ = self.inner.send(WsMessage::Close(None)).await;
        let _ = self.inner.close().await;
    }
}

struct WsStream {
    inner: SplitStream<ClientSocket>,
    done: bool,
}

#[async_trait]
impl FrameStream for WsStream {
    async fn recv(&mut self) -> Option<Result<Frame, TransportError>> {
        if self.done {
            return None;
        }
        loop {
            match self.inner.next().await {
                Some(Ok(WsMessage::Text(text))) => return Some(Ok(Frame::Text(text.as_str().to_owned()))),
                Some(Ok(WsMessage::Binary(bytes))) => return Some(Ok(Frame::Binary(bytes.to_vec()))),
                Some(Ok(WsMessage::Close(frame))) => {
                    tracing::debug!(close_frame = ?frame, "Peer closed websocket");
                    self.done = true;
                    return None;
                }
                // Ping/pong are answered by tungstenite.
                Some(Ok(WsMessage::Ping(_) | WsMessage::Pong(_) | WsMessage::Frame(_))) => {}
                Some(Err(e)) => {
                    self.done = true;
                    return Some(Err(TransportError::Connection(e.to_string())));
                }
                None => {
                    self.done = true;
                    return None;
                }
            }
        }
    }
}

// ── Accepted axum socket (relay client side) ───────────────────────

/// Wrap a socket accepted by the gateway's `/ws` upgrade.
pub fn socket_transport(socket: WebSocket) -> Transport {
    let (sink, stream) = socket.split();
    Transport::new(
        SocketSink {
            inner: sink,
            closed: false,
        },
        SocketStream {
            inner: stream,
            done: false,
        },
    )
}

struct SocketSink {
    inner: SplitSink<WebSocket, AxumMessage>,
    closed: bool,
}

#[async_trait]
impl FrameSink for SocketSink {
    async fn send(&mut self, frame: Frame) -> Result<(), TransportError> {
        if self.closed {
            return Err(TransportError::Closed);
        }
        let message = match frame {
            Frame::Text(text) => AxumMessage::Text(text.into()),
            Frame::Binary(bytes) => AxumMessage::Binary(bytes.into()),
        };
        self.inner
            .send(message)
            .await
            .map_err(|e| TransportError::Connection(e.to_string()))
    }

    async fn close(&mut self) {
        if self.closed {
            return;
        }
        self.closed = true;
        let _ = self.inner.send(AxumMessage::Close(None)).await;
        let _ = self.inner.close().await;
    }
}

struct SocketStream {
    inner: SplitStream<WebSocket>,
    done: bool,
}

#[async_trait]
impl FrameStream for SocketStream {
    async fn recv(&mut self) -> Option<Result<Frame, TransportError>> {
        if self.done {
            return None;
        }
        loop {
            match self.inner.next().await {
                Some(Ok(AxumMessage::Text(text))) => return Some(Ok(Frame::Text(text.as_str().to_owned()))),
                Some(Ok(AxumMessage::Binary(bytes))) => return Some(Ok(Frame::Binary(bytes.to_vec()))),
                Some(Ok(AxumMessage::Close(_))) | None => {
                    self.done = true;
                    return None;
                }
                Some(Ok(AxumMessage::Ping(_) | AxumMessage::Pong(_))) => {}
                Some(Err(e)) => {
                    self.done = true;
                    return Some(Err(TransportError::Connection(e.to_string())));
                }
            }
        }
    }
}

// ── In-memory transport ────────────────────────────────────────────

/// A connected in-process transport and the peer end that drives it.
pub fn memory_pair() -> (Transport, MemoryPeer) {
    let (to_peer_tx, to_peer_rx) = mpsc::unbounded_channel();
    let (from_peer_tx, from_peer_rx) = mpsc::unbounded_channel();
    let transport = Transport::new(
        MemorySink {
            tx: Some(to_peer_tx),
        },
        MemoryStream {
            rx: from_peer_rx,
            done: false,
        },
    );
    let peer = MemoryPeer {
        tx: from_peer_tx,
        rx: to_peer_rx,
    };
    (transport, peer)
}

/// The far side of a [`memory_pair`]: plays the model, relay or client.
pub struct MemoryPeer {
    tx: mpsc::UnboundedSender<Result<Frame, TransportError>>,
    rx: mpsc::UnboundedReceiver<Frame>,
}

impl MemoryPeer {
    /// Deliver a frame to the transport's stream. False once it was dropped.
    pub fn send(&self, frame: Frame) -> bool {
        self.tx.send(Ok(frame)).is_ok()
    }

    pub fn send_text(&self, text: impl Into<String>) -> bool {
        self.send(Frame::Text(text.into()))
    }

    /// Make the transport's stream report an I/O failure.
    pub fn fail(&self, reason: &str) {
        let _ = self
            .tx
            .send(Err(TransportError::Connection(reason.to_string())));
    }

    /// Next frame sent by the transport; `None` after its sink closed.
    pub async fn recv(&mut self) -> Option<Frame> {
        self.rx.recv().await
    }

    /// Everything the transport has sent so far.
    pub fn drain(&mut self) -> Vec<Frame> {
        let mut frames = Vec::new();
        while let Ok(frame) = self.rx.try_recv() {
            frames.push(frame);
        }
        frames
    }

    /// True once the transport's sink closed or was dropped.
    pub fn is_closed(&self) -> bool {
        self.rx.is_closed()
    }
}

struct MemorySink {
    tx: Option<mpsc::UnboundedSender<Frame>>,
}

#[async_trait]
impl FrameSink for MemorySink {
    async fn send(&mut self, frame: Frame) -> Result<(), TransportError> {
        let tx = self.tx.as_ref().ok_or(TransportError::Closed)?;
        tx.send(frame)
            .map_err(|_| TransportError::Connection("peer dropped".to_string()))
    }

    async fn close(&mut self) {
        self.tx = None;
    }
}

struct MemoryStream {
    rx: mpsc::UnboundedReceiver<Result<Frame, TransportError>>,
    done: bool,
}

#[async_trait]
impl FrameStream for MemoryStream {
    async fn recv(&mut self) -> Option<Result<Frame, TransportError>> {
        if self.done {
            return None;
        }
        match self.rx.recv().await {
            Some(Ok(frame)) => Some(Ok(frame)),
            Some(Err(e)) => {
                self.done = true;
                Some(Err(e))
            }
            None => {
                self.done = true;
                None
            }
        }
    }
}

/// Hands out pre-built transports in order; fails once they run out.
pub struct MemoryConnector {
    mode: TransportMode,
    pending: Mutex<VecDeque<Transport>>,
    attempts: AtomicUsize,
}

impl MemoryConnector {
    pub fn new(mode: TransportMode) -> Self {
        Self {
            mode,
            pending: Mutex::new(VecDeque::new()),
            attempts: AtomicUsize::new(0),
        }
    }

    /// Queue a transport and return the peer that drives it.
    pub fn push_pair(&self) -> MemoryPeer {
        let (transport, peer) = memory_pair();
        self.pending.lock().push_back(transport);
        peer
    }

    /// Number of `connect()` calls so far, successful or not.
    pub fn attempts(&self) -> usize {
        self.attempts.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Connector for MemoryConnector {
    async fn connect(&self) -> Result<Transport, TransportError> {
        self.attempts.fetch_add(1, Ordering::SeqCst);
        self.pending
            .lock()
            .pop_front()
            .ok_or_else(|| TransportError::Connection("connection refused".to_string()))
    }

    fn mode(&self) -> TransportMode {
        self.mode
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn memory_pair_is_fifo_both_ways() {
        let (transport, mut peer) = memory_pair();
        let (mut sink, mut stream) = transport.split();

        sink.send(Frame::text("one")).await.unwrap();
        sink.send(Frame::Binary(vec![2])).await.unwrap();
        assert_eq!(peer.recv().await, Some(Frame::text("one")));
        assert_eq!(peer.recv().await, Some(Frame::Binary(vec![2])));

        peer.send_text("a");
        peer.send_text("b");
        assert_eq!(stream.recv().await, Some(Ok(Frame::text("a"))));
        assert_eq!(stream.recv().await, Some(Ok(Frame::text("b"))));
    }

    #[tokio::test]
    async fn failure_surfaces_once_then_none() {
        let (transport, peer) = memory_pair();
        let (_sink, mut stream) = transport.split();

        peer.fail("reset by peer");
        peer.send_text("after failure");

        assert_eq!(
            stream.recv().await,
            Some(Err(TransportError::Connection("reset by peer".to_string())))
        );
        assert_eq!(stream.recv().await, None);
        assert_eq!(stream.recv().await, None);
    }

    #[tokio::test]
    async fn close_is_idempotent_and_visible_to_peer() {
        let (transport, peer) = memory_pair();
        let (mut sink, _stream) = transport.split();

        sink.close().await;
        sink.close().await;
        assert_eq!(sink.send(Frame::text("late")).await, Err(TransportError::Closed));
        assert!(peer.is_closed());
    }

    #[tokio::test]
    async fn dropped_peer_ends_stream() {
        let (transport, peer) = memory_pair();
        let (mut sink, mut stream) = transport.split();
        drop(peer);

        assert_eq!(stream.recv().await, None);
        assert!(matches!(
            sink.send(Frame::text("x")).await,
            Err(TransportError::Connection(_))
        ));
    }

    #[tokio::test]
    async fn memory_connector_hands_out_in_order() {
        let connector = MemoryConnector::new(TransportMode::ViaRelay);
        let mut first = connector.push_pair();
        let _second = connector.push_pair();

        let (mut sink, _) = connector.connect().await.unwrap().split();
        sink.send(Frame::text("hi")).await.unwrap();
        assert_eq!(first.recv().await, Some(Frame::text("hi")));

        assert!(connector.connect().await.is_ok());
        assert!(matches!(
            connector.connect().await,
            Err(TransportError::Connection(_))
        ));
        assert_eq!(connector.attempts(), 3);
        assert_eq!(connector.mode(), TransportMode::ViaRelay);
    }

    #[test]
    fn direct_config_carries_model_and_auth() {
        let config = TransportConfig::direct("wss://api.openai.com/v1/realtime", "gpt-4o-realtime-preview", "sk-test");
        assert_eq!(
            config.url,
            "wss://api.openai.com/v1/realtime?model=gpt-4o-realtime-preview"
        );
        assert_eq!(config.mode, TransportMode::Direct);
        assert!(config
            .headers
            .iter()
            .any(|(k, v)| k == "Authorization" && v == "Bearer sk-test"));

        let with_query = TransportConfig::direct("wss://host/rt?x=1", "m", "k");
        assert_eq!(with_query.url, "wss://host/rt?x=1&model=m");
    }

    #[test]
    fn debug_redacts_credentials() {
        let config = TransportConfig::direct("wss://host/rt", "m", "sk-secret");
        let printed = format!("{config:?}");
        assert!(!printed.contains("sk-secret"));
        assert!(printed.contains("[REDACTED]"));

        let relay = TransportConfig::via_relay("ws://localhost:8787/ws");
        assert_eq!(relay.mode, TransportMode::ViaRelay);
        assert!(relay.headers.is_empty());
    }
}
