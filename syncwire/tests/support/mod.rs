//! A minimal sync relay for integration tests.
//!
//! Accepts WebSocket clients, answers the subprotocol offer, records every
//! frame it receives, answers `presencePing` with a pong, and can be told to
//! push frames or close sockets.

#![allow(dead_code)]

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use futures_util::{SinkExt, StreamExt};
use serde_json::{json, Value};
use syncwire::{AuthTokens, SyncHooks, TokenProvider};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::broadcast;
use tokio::time::{sleep, Duration, Instant};
use tokio_tungstenite::tungstenite::handshake::server::{ErrorResponse, Request, Response};
use tokio_tungstenite::tungstenite::http::HeaderValue;
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::tungstenite::protocol::CloseFrame;
use tokio_tungstenite::tungstenite::{Message, Utf8Bytes};

#[derive(Debug, Clone)]
enum ServerCommand {
    Push(String),
    Close(u16),
    Drop,
}

#[derive(Default)]
struct RelayState {
    protocols: Mutex<Vec<String>>,
    frames: Mutex<Vec<Value>>,
    connections: AtomicUsize,
    disconnections: AtomicUsize,
    echo_messages: AtomicBool,
}

pub struct Relay {
    pub url: String,
    state: Arc<RelayState>,
    commands: broadcast::Sender<ServerCommand>,
}

impl Relay {
    /// Bind on a free port and start accepting.
    pub async fn start() -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        let state = Arc::new(RelayState::default());
        let (commands, _) = broadcast::channel(64);

        let accept_state = Arc::clone(&state);
        let accept_commands = commands.clone();
        tokio::spawn(async move {
            while let Ok((stream, _)) = listener.accept().await {
                let state = Arc::clone(&accept_state);
                let commands = accept_commands.subscribe();
                tokio::spawn(handle_client(stream, state, commands));
            }
        });

        Self {
            url: format!("ws://127.0.0.1:{port}"),
            state,
            commands,
        }
    }

    /// Answer `sendMessage` with a `newMessage` echo carrying a server id.
    pub fn echo_messages(&self, enabled: bool) {
        self.state.echo_messages.store(enabled, Ordering::SeqCst);
    }

    pub fn push(&self, frame: Value) {
        let _ = self.commands.send(ServerCommand::Push(frame.to_string()));
    }

    pub fn push_raw(&self, frame: &str) {
        let _ = self.commands.send(ServerCommand::Push(frame.to_owned()));
    }

    /// Close every live socket with `code`.
    pub fn close_all(&self, code: u16) {
        let _ = self.commands.send(ServerCommand::Close(code));
    }

    /// Drop every live socket without a close frame.
    pub fn drop_all(&self) {
        let _ = self.commands.send(ServerCommand::Drop);
    }

    pub fn connections(&self) -> usize {
        self.state.connections.load(Ordering::SeqCst)
    }

    pub fn disconnections(&self) -> usize {
        self.state.disconnections.load(Ordering::SeqCst)
    }

    /// `Sec-WebSocket-Protocol` values offered by each handshake.
    pub fn protocols(&self) -> Vec<String> {
        self.state.protocols.lock().unwrap().clone()
    }

    pub fn frames(&self) -> Vec<Value> {
        self.state.frames.lock().unwrap().clone()
    }

    pub fn frames_with_action(&self, action: &str) -> Vec<Value> {
        self.frames()
            .into_iter()
            .filter(|f| f["action"] == action)
            .collect()
    }
}

async fn handle_client(
    stream: TcpStream,
    state: Arc<RelayState>,
    mut commands: broadcast::Receiver<ServerCommand>,
) {
    let handshake_state = Arc::clone(&state);
    let callback = move |req: &Request, mut response: Response| -> Result<Response, ErrorResponse> {
        if let Some(offered) = req
            .headers()
            .get("Sec-WebSocket-Protocol")
            .and_then(|v| v.to_str().ok())
        {
            handshake_state
                .protocols
                .lock()
                .unwrap()
                .push(offered.to_owned());
            let first = offered.split(',').next().unwrap_or_default().trim().to_owned();
            if let Ok(value) = HeaderValue::from_str(&first) {
                response.headers_mut().insert("Sec-WebSocket-Protocol", value);
            }
        }
        Ok(response)
    };

    let ws = match tokio_tungstenite::accept_hdr_async(stream, callback).await {
        Ok(ws) => ws,
        Err(_) => return,
    };
    state.connections.fetch_add(1, Ordering::SeqCst);
    let (mut sink, mut source) = ws.split();

    loop {
        tokio::select! {
            msg = source.next() => match msg {
                Some(Ok(Message::Text(text))) => {
                    let Ok(frame) = serde_json::from_str::<Value>(text.as_str()) else {
                        continue;
                    };
                    state.frames.lock().unwrap().push(frame.clone());
                    if let Some(reply) = reply_for(&frame, &state) {
                        if sink.send(Message::text(reply.to_string())).await.is_err() {
                            break;
                        }
                    }
                }
                Some(Ok(Message::Close(_))) | None | Some(Err(_)) => break,
                Some(Ok(_)) => {}
            },
            cmd = commands.recv() => match cmd {
                Ok(ServerCommand::Push(text)) => {
                    if sink.send(Message::text(text)).await.is_err() {
                        break;
                    }
                }
                Ok(ServerCommand::Close(code)) => {
                    let frame = CloseFrame {
                        code: CloseCode::from(code),
                        reason: Utf8Bytes::from_static("relay closing"),
                    };
                    let _ = sink.send(Message::Close(Some(frame))).await;
                    break;
                }
                Ok(ServerCommand::Drop) | Err(_) => break,
            },
        }
    }
    state.disconnections.fetch_add(1, Ordering::SeqCst);
}

fn reply_for(frame: &Value, state: &RelayState) -> Option<Value> {
    match frame["action"].as_str()? {
        "presencePing" => Some(json!({ "type": "pong" })),
        "sendMessage" if state.echo_messages.load(Ordering::SeqCst) => {
            let mut echo = frame.clone();
            let optimistic = frame["optimisticId"].as_str().unwrap_or("none").to_owned();
            echo["action"] = json!("newMessage");
            echo["messageId"] = json!(format!("srv-{optimistic}"));
            Some(echo)
        }
        _ => None,
    }
}

// ─── Test doubles ────────────────────────────────────────────────

/// Returns no token for the first `missing` calls, then a valid one.
pub struct FlakyTokens {
    missing: usize,
    calls: AtomicUsize,
}

impl FlakyTokens {
    pub fn new(missing: usize) -> Self {
        Self {
            missing,
            calls: AtomicUsize::new(0),
        }
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl TokenProvider for FlakyTokens {
    async fn auth_tokens(&self) -> Option<AuthTokens> {
        let call = self.calls.fetch_add(1, Ordering::SeqCst);
        (call >= self.missing).then(|| AuthTokens::new("test-token"))
    }
}

#[derive(Default)]
pub struct RecordingHooks {
    pub collaborator_refreshes: AtomicUsize,
    pub project_refreshes: Mutex<Vec<Option<String>>>,
}

#[async_trait]
impl SyncHooks for RecordingHooks {
    async fn refresh_collaborators(&self) {
        self.collaborator_refreshes.fetch_add(1, Ordering::SeqCst);
    }

    async fn refresh_projects(&self, project_id: Option<&str>) {
        self.project_refreshes
            .lock()
            .unwrap()
            .push(project_id.map(str::to_owned));
    }
}

/// Poll `condition` every 10ms until it holds or `limit` elapses.
pub async fn wait_until<F>(limit: Duration, mut condition: F) -> bool
where
    F: FnMut() -> bool,
{
    let deadline = Instant::now() + limit;
    loop {
        if condition() {
            return true;
        }
        if Instant::now() >= deadline {
            return false;
        }
        sleep(Duration::from_millis(10)).await;
    }
}
