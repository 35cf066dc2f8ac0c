//! WebSocket transport behind object-safe traits so the engine can run against
//! a real socket or an in-memory peer.

use std::sync::{Arc, Mutex, MutexGuard, Once};

use async_trait::async_trait;
use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::handshake::client::Request;
use tokio_tungstenite::tungstenite::http::HeaderValue;
use tokio_tungstenite::tungstenite::protocol::CloseFrame;
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::tungstenite::{Error as WsError, Message};
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};
use tracing::{debug, info};

use super::protocol::WireFrame;
use crate::defaults;
use crate::error::{Result, VoxlinkError};

/// Reason sent with a client-initiated close.
pub const CLOSE_REASON: &str = "Closed by user";

/// Outbound half of a connection.
#[async_trait]
pub trait WireSender: Send {
    async fn send_text(&mut self, text: String) -> Result<()>;

    /// Send a normal-closure frame and shut the write half.
    async fn close(&mut self) -> Result<()>;
}

/// Inbound half of a connection. `None` once the stream has ended.
#[async_trait]
pub trait WireReceiver: Send {
    async fn next_frame(&mut self) -> Option<Result<WireFrame>>;
}

/// Opens connections to the realtime endpoint.
#[async_trait]
pub trait Connector: Send + Sync {
    async fn connect(&self) -> Result<(Box<dyn WireSender>, Box<dyn WireReceiver>)>;
}

static CRYPTO_PROVIDER: Once = Once::new();

fn install_crypto_provider() {
    CRYPTO_PROVIDER.call_once(|| {
        if rustls::crypto::ring::default_provider()
            .install_default()
            .is_err()
        {
            debug!("rustls crypto provider already installed");
        }
    });
}

fn map_ws_error(error: WsError) -> VoxlinkError {
    match error {
        WsError::ConnectionClosed | WsError::AlreadyClosed => VoxlinkError::NotConnected,
        other => VoxlinkError::ConnectionFailed {
            message: other.to_string(),
        },
    }
}

/// Connects with tokio-tungstenite over rustls.
#[derive(Debug, Clone)]
pub struct TungsteniteConnector {
    url: String,
    api_key: Option<String>,
}

impl TungsteniteConnector {
    pub fn new(url: impl Into<String>, api_key: Option<String>) -> Self {
        Self {
            url: url.into(),
            api_key,
        }
    }

    pub fn url(&self) -> &str {
        &self.url
    }

    /// Handshake request with bearer auth and the beta header.
    pub fn build_request(&self) -> Result<Request> {
        let mut request =
            self.url
                .as_str()
                .into_client_request()
                .map_err(|e| VoxlinkError::ConnectionFailed {
                    message: format!("invalid endpoint {}: {}", self.url, e),
                })?;
        let headers = request.headers_mut();
        if let Some(key) = &self.api_key {
            let value = HeaderValue::from_str(&format!("Bearer {}", key)).map_err(|e| {
                VoxlinkError::ConfigInvalidValue {
                    key: "realtime.api_key".to_string(),
                    message: e.to_string(),
                }
            })?;
            headers.insert("Authorization", value);
        }
        headers.insert(
            "OpenAI-Beta",
            HeaderValue::from_static(defaults::REALTIME_BETA_HEADER),
        );
        Ok(request)
    }
}

#[async_trait]
impl Connector for TungsteniteConnector {
    async fn connect(&self) -> Result<(Box<dyn WireSender>, Box<dyn WireReceiver>)> {
        install_crypto_provider();
        let request = self.build_request()?;
        info!(url = %self.url, "connecting");
        let (stream, response) = tokio_tungstenite::connect_async(request)
            .await
            .map_err(|e| VoxlinkError::ConnectionFailed {
                message: e.to_string(),
            })?;
        debug!(status = %response.status(), "handshake complete");

        let (sink, stream) = stream.split();
        Ok((
            Box::new(TungsteniteSender { sink }),
            Box::new(TungsteniteReceiver { stream }),
        ))
    }
}

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

struct TungsteniteSender {
    sink: SplitSink<WsStream, Message>,
}

#[async_trait]
impl WireSender for TungsteniteSender {
    async fn send_text(&mut self, text: String) -> Result<()> {
        self.sink.send(Message::Text(text)).await.map_err(map_ws_error)
    }

    async fn close(&mut self) -> Result<()> {
        let frame = CloseFrame {
            code: CloseCode::Normal,
            reason: CLOSE_REASON.into(),
        };
        self.sink
            .send(Message::Close(Some(frame)))
            .await
            .map_err(map_ws_error)?;
        self.sink.close().await.map_err(map_ws_error)
    }
}

struct TungsteniteReceiver {
    stream: SplitStream<WsStream>,
}

#[async_trait]
impl WireReceiver for TungsteniteReceiver {
    async fn next_frame(&mut self) -> Option<Result<WireFrame>> {
        loop {
            let message = match self.stream.next().await? {
                Ok(message) => message,
                Err(e) => return Some(Err(map_ws_error(e))),
            };
            let frame = match message {
                Message::Text(text) => WireFrame::text(text),
                Message::Binary(payload) => WireFrame::Data { payload, fin: true },
                Message::Frame(frame) => {
                    let fin = frame.header().is_final;
                    WireFrame::Data {
                        payload: frame.into_data(),
                        fin,
                    }
                }
                Message::Close(frame) => {
                    if let Some(frame) = frame {
                        debug!(code = ?frame.code, reason = %frame.reason, "server sent close frame");
                    }
                    WireFrame::Close
                }
                // tungstenite answers pings itself
                Message::Ping(_) | Message::Pong(_) => continue,
            };
            return Some(Ok(frame));
        }
    }
}

// ---------------------------------------------------------------------------
// In-memory peer
// ---------------------------------------------------------------------------

#[derive(Default)]
struct MockState {
    sent: Vec<String>,
    inbound: Option<mpsc::UnboundedSender<Result<WireFrame>>>,
    connect_count: usize,
    close_count: usize,
    connect_error: Option<String>,
    fail_sends: bool,
}

/// In-memory connector. Clone it to keep a handle for injecting server
/// messages and inspecting what the client sent.
#[derive(Clone, Default)]
pub struct MockConnector {
    state: Arc<Mutex<MockState>>,
}

impl MockConnector {
    pub fn new() -> Self {
        Self::default()
    }

    /// Every connect attempt fails with this message.
    pub fn with_connect_failure(self, message: &str) -> Self {
        self.lock().connect_error = Some(message.to_string());
        self
    }

    /// Make subsequent sends fail as if the socket had dropped.
    pub fn fail_sends(&self, fail: bool) {
        self.lock().fail_sends = fail;
    }

    fn lock(&self) -> MutexGuard<'_, MockState> {
        self.state
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Deliver a complete text message to the client. Returns false when no
    /// connection is open.
    pub fn push_text(&self, text: &str) -> bool {
        self.push_frame(WireFrame::text(text))
    }

    pub fn push_frame(&self, frame: WireFrame) -> bool {
        self.push(Ok(frame))
    }

    /// Deliver a transport error to the client.
    pub fn push_error(&self, error: VoxlinkError) -> bool {
        self.push(Err(error))
    }

    fn push(&self, item: Result<WireFrame>) -> bool {
        self.lock()
            .inbound
            .as_ref()
            .is_some_and(|tx| tx.send(item).is_ok())
    }

    /// Server-side close: a close frame, then end of stream.
    pub fn close_remote(&self) {
        let mut state = self.lock();
        if let Some(tx) = state.inbound.take()
            && tx.send(Ok(WireFrame::Close)).is_err()
        {
            debug!("mock peer already gone");
        }
    }

    /// Raw JSON text of every message the client sent, in order.
    pub fn sent(&self) -> Vec<String> {
        self.lock().sent.clone()
    }

    /// The `type` field of every message the client sent.
    pub fn sent_types(&self) -> Vec<String> {
        self.sent()
            .iter()
            .filter_map(|text| serde_json::from_str::<serde_json::Value>(text).ok())
            .filter_map(|value| value.get("type").and_then(|t| t.as_str()).map(String::from))
            .collect()
    }

    pub fn clear_sent(&self) {
        self.lock().sent.clear();
    }

    pub fn connect_count(&self) -> usize {
        self.lock().connect_count
    }

    pub fn close_count(&self) -> usize {
        self.lock().close_count
    }
}

#[async_trait]
impl Connector for MockConnector {
    async fn connect(&self) -> Result<(Box<dyn WireSender>, Box<dyn WireReceiver>)> {
        let mut state = self.lock();
        state.connect_count += 1;
        if let Some(message) = &state.connect_error {
            return Err(VoxlinkError::ConnectionFailed {
                message: message.clone(),
            });
        }
        let (tx, rx) = mpsc::unbounded_channel();
        state.inbound = Some(tx);
        Ok((
            Box::new(MockSender {
                state: Arc::clone(&self.state),
                closed: false,
            }),
            Box::new(MockReceiver { rx }),
        ))
    }
}

struct MockSender {
    state: Arc<Mutex<MockState>>,
    closed: bool,
}

#[async_trait]
impl WireSender for MockSender {
    async fn send_text(&mut self, text: String) -> Result<()> {
        let mut state = self
            .state
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        if self.closed || state.fail_sends {
            return Err(VoxlinkError::NotConnected);
        }
        state.sent.push(text);
        Ok(())
    }

    async fn close(&mut self) -> Result<()> {
        if self.closed {
            return Err(VoxlinkError::NotConnected);
        }
        self.closed = true;
        let mut state = self
            .state
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        state.close_count += 1;
        // Peer acknowledges by ending the stream
        state.inbound = None;
        Ok(())
    }
}

struct MockReceiver {
    rx: mpsc::UnboundedReceiver<Result<WireFrame>>,
}

#[async_trait]
impl WireReceiver for MockReceiver {
    async fn next_frame(&mut self) -> Option<Result<WireFrame>> {
        self.rx.recv().await
    }
}
