//! Socket plumbing: the authenticated dial and the per-socket reader and
//! writer tasks.
//!
//! The tasks never touch client state. They forward frames and lifecycle
//! events, tagged with the socket generation they belong to, into the
//! dispatcher's event queue.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use futures_util::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::handshake::client::Request;
use tokio_tungstenite::tungstenite::http::HeaderValue;
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::tungstenite::protocol::CloseFrame;
use tokio_tungstenite::tungstenite::{Message, Utf8Bytes};
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};

use crate::error::{Result, SyncError};
use crate::session::{SessionId, TokenProvider};

pub(crate) type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// Outgoing frames buffered per socket before sends start failing.
const OUTGOING_CAPACITY: usize = 64;

/// Events flowing from socket tasks to the dispatcher.
pub(crate) enum TransportEvent {
    Opened { socket: u64, stream: Box<WsStream> },
    DialFailed { socket: u64, error: SyncError },
    Frame { socket: u64, text: String },
    Pong { socket: u64 },
    Closed { socket: u64, code: Option<u16> },
}

/// Build the handshake request. Token and session id travel in the
/// `Sec-WebSocket-Protocol` header as `"<idToken>, <sessionId>"`.
pub(crate) fn build_request(url: &str, id_token: &str, session: &SessionId) -> Result<Request> {
    let mut request = url
        .into_client_request()
        .map_err(|e| SyncError::InvalidRequest(e.to_string()))?;
    let protocols = HeaderValue::from_str(&format!("{id_token}, {}", session.as_str()))
        .map_err(|_| SyncError::InvalidRequest("token is not a valid header value".into()))?;
    request
        .headers_mut()
        .insert("Sec-WebSocket-Protocol", protocols);
    Ok(request)
}

/// Fetch a token and open the socket, bounded by `open_timeout`.
pub(crate) async fn dial(
    url: &str,
    tokens: &dyn TokenProvider,
    session: &SessionId,
    open_timeout: Duration,
) -> Result<WsStream> {
    let tokens = tokens
        .auth_tokens()
        .await
        .filter(|t| t.is_valid_at(Utc::now()))
        .ok_or(SyncError::AuthUnavailable)?;
    let request = build_request(url, &tokens.id_token, session)?;

    let (stream, _response) = tokio::time::timeout(open_timeout, connect_async(request))
        .await
        .map_err(|_| SyncError::OpenTimeout(open_timeout))??;
    Ok(stream)
}

/// Spawn the dial on its own task so the dispatcher keeps running while the
/// token is fetched and the handshake completes.
pub(crate) fn spawn_dial(
    socket: u64,
    url: String,
    tokens: Arc<dyn TokenProvider>,
    session: SessionId,
    open_timeout: Duration,
    events: mpsc::Sender<TransportEvent>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let event = match dial(&url, tokens.as_ref(), &session, open_timeout).await {
            Ok(stream) => TransportEvent::Opened {
                socket,
                stream: Box::new(stream),
            },
            Err(error) => TransportEvent::DialFailed { socket, error },
        };
        let _ = events.send(event).await;
    })
}

/// A live socket: the sender into its writer task plus both task handles.
pub(crate) struct SocketHandle {
    pub(crate) id: u64,
    outgoing: mpsc::Sender<Message>,
    reader: JoinHandle<()>,
    writer: JoinHandle<()>,
}

impl SocketHandle {
    pub(crate) fn spawn(id: u64, stream: WsStream, events: mpsc::Sender<TransportEvent>) -> Self {
        let (mut sink, mut source) = stream.split();
        let (outgoing, mut outgoing_rx) = mpsc::channel::<Message>(OUTGOING_CAPACITY);

        let writer = tokio::spawn(async move {
            while let Some(msg) = outgoing_rx.recv().await {
                let closing = matches!(msg, Message::Close(_));
                if let Err(e) = sink.send(msg).await {
                    log::debug!("socket {id}: write failed: {e}");
                    break;
                }
                if closing {
                    break;
                }
            }
        });

        let reader = tokio::spawn(async move {
            let mut code = None;
            while let Some(msg) = source.next().await {
                match msg {
                    Ok(Message::Text(text)) => {
                        log::trace!("socket {id}: <- {} bytes", text.len());
                        let event = TransportEvent::Frame {
                            socket: id,
                            text: text.as_str().to_owned(),
                        };
                        if events.send(event).await.is_err() {
                            return;
                        }
                    }
                    Ok(Message::Pong(_)) => {
                        let _ = events.send(TransportEvent::Pong { socket: id }).await;
                    }
                    Ok(Message::Close(frame)) => {
                        code = frame.map(|f| u16::from(f.code));
                        break;
                    }
                    Ok(_) => {}
                    Err(e) => {
                        log::warn!("socket {id}: read error: {e}");
                        break;
                    }
                }
            }
            let _ = events.send(TransportEvent::Closed { socket: id, code }).await;
        });

        Self {
            id,
            outgoing,
            reader,
            writer,
        }
    }

    /// Queue a text frame. Fails if the writer is gone or backed up.
    pub(crate) fn send_text(&self, frame: String) -> Result<()> {
        self.outgoing
            .try_send(Message::text(frame))
            .map_err(|_| SyncError::NotConnected)
    }

    /// Send a normal close frame and stop reading. The writer exits after
    /// flushing the close frame.
    pub(crate) fn close(self) {
        let frame = CloseFrame {
            code: CloseCode::Normal,
            reason: Utf8Bytes::from_static("session closed"),
        };
        if self.outgoing.try_send(Message::Close(Some(frame))).is_err() {
            self.writer.abort();
        }
        self.reader.abort();
    }

    /// Drop a socket whose reader already saw it close.
    pub(crate) fn discard(self) {
        self.reader.abort();
        self.writer.abort();
    }
}
