//! The dispatcher: a single task that owns the socket, the lifecycle, the
//! health monitor, and client state.
//!
//! ```text
//!  ConnectionManager ──Command──►┐
//!  reader/writer/dial ──Event───►├─► select! ─► Lifecycle / SyncState ─► ChannelStore
//!  keepalive tick ──────────────►│
//!  retry timer / debounce ──────►┘
//! ```
//!
//! Everything reaches the dispatcher as a message and is handled in receipt
//! order, so no state is ever touched from two tasks.

use std::pin::Pin;
use std::sync::Arc;

use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tokio::time::{interval_at, Instant, Interval, MissedTickBehavior, Sleep};

use super::transport::{self, SocketHandle, TransportEvent, WsStream};
use crate::channel_store::{channels, ChannelStore};
use crate::config::SyncConfig;
use crate::envelope::{action, ConversationEvent, Inbound, Outbound};
use crate::error::{Result, SyncError};
use crate::health::HealthMonitor;
use crate::lifecycle::{CloseKind, ConnectionState, Lifecycle, LifecycleEvent};
use crate::model::{ConversationType, Message, Project};
use crate::session::{SessionId, SyncHooks, TokenProvider};
use crate::state::{DeletedIds, Effect, SyncState};

/// Transport events buffered between socket tasks and the dispatcher.
const EVENT_CAPACITY: usize = 256;

/// Requests from [`ConnectionManager`](super::ConnectionManager) handles.
pub(crate) enum Command {
    Connect,
    Transmit {
        frame: String,
        action: String,
        responder: oneshot::Sender<Result<()>>,
    },
    /// Acknowledged once the update is applied and published.
    Apply(LocalUpdate, oneshot::Sender<()>),
    Shutdown(oneshot::Sender<()>),
}

/// Local state changes requested by the UI, applied in order with the
/// socket traffic.
pub(crate) enum LocalUpdate {
    Optimistic {
        conversation_type: ConversationType,
        project_id: Option<String>,
        message: Message,
    },
    Conversation(ConversationEvent),
    ToggleReaction {
        id: String,
        emoji: String,
        user_id: String,
    },
    ActiveConversation(Option<String>),
    MarkRead {
        conversation_type: ConversationType,
        conversation_id: String,
        project_id: Option<String>,
    },
    NotificationRead(String),
    LoadProjects(Vec<Project>),
    ActiveProject(Option<String>),
}

struct ActiveSocket {
    handle: SocketHandle,
    keepalive: Interval,
}

struct Dialing {
    socket: u64,
    task: JoinHandle<()>,
}

pub(crate) struct Dispatcher {
    config: Arc<SyncConfig>,
    session: SessionId,
    tokens: Arc<dyn TokenProvider>,
    hooks: Arc<dyn SyncHooks>,
    store: ChannelStore,
    commands: mpsc::Receiver<Command>,
    events_tx: mpsc::Sender<TransportEvent>,
    events_rx: mpsc::Receiver<TransportEvent>,
    state_tx: watch::Sender<ConnectionState>,
    lifecycle: Lifecycle,
    health: HealthMonitor,
    state: SyncState,
    socket: Option<ActiveSocket>,
    dialing: Option<Dialing>,
    next_socket: u64,
    retry_at: Option<Pin<Box<Sleep>>>,
    collaborators_at: Option<Pin<Box<Sleep>>>,
}

impl Dispatcher {
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn new(
        config: Arc<SyncConfig>,
        session: SessionId,
        tokens: Arc<dyn TokenProvider>,
        hooks: Arc<dyn SyncHooks>,
        store: ChannelStore,
        deleted: DeletedIds,
        commands: mpsc::Receiver<Command>,
        state_tx: watch::Sender<ConnectionState>,
    ) -> Self {
        let (events_tx, events_rx) = mpsc::channel(EVENT_CAPACITY);
        let health_store = store.clone();
        let health = HealthMonitor::with_callback(move |snapshot| {
            health_store.update(channels::CONNECTION_HEALTH, snapshot.clone());
        });
        let state = SyncState::new(config.user_id.clone(), store.clone(), deleted);

        store.update(channels::CONNECTION_STATE, ConnectionState::Disconnected);
        store.update(channels::CONNECTION_HEALTH, health.snapshot());

        Self {
            config,
            session,
            tokens,
            hooks,
            store,
            commands,
            events_tx,
            events_rx,
            state_tx,
            lifecycle: Lifecycle::default(),
            health,
            state,
            socket: None,
            dialing: None,
            next_socket: 1,
            retry_at: None,
            collaborators_at: None,
        }
    }

    /// Run until shutdown or until every handle is dropped.
    pub(crate) async fn run(mut self) {
        loop {
            tokio::select! {
                cmd = self.commands.recv() => match cmd {
                    Some(Command::Shutdown(done)) => {
                        self.commands.close();
                        self.teardown();
                        let _ = done.send(());
                        break;
                    }
                    Some(cmd) => self.handle_command(cmd),
                    None => {
                        log::debug!("all handles dropped");
                        self.teardown();
                        break;
                    }
                },
                Some(event) = self.events_rx.recv() => self.handle_transport(event),
                _ = keepalive_tick(&mut self.socket) => {
                    self.send_presence_ping();
                }
                _ = sleep_until_set(&mut self.retry_at) => {
                    self.retry_at = None;
                    self.on_retry_due();
                }
                _ = sleep_until_set(&mut self.collaborators_at) => {
                    self.collaborators_at = None;
                    let hooks = Arc::clone(&self.hooks);
                    tokio::spawn(async move { hooks.refresh_collaborators().await });
                }
            }
        }
        log::info!("dispatcher for session {} stopped", self.session.short());
    }

    // ─── Commands ────────────────────────────────────────────────

    fn handle_command(&mut self, cmd: Command) {
        match cmd {
            Command::Connect => self.connect(),
            Command::Transmit {
                frame,
                action,
                responder,
            } => {
                let _ = responder.send(self.transmit(frame, &action));
            }
            Command::Apply(update, done) => {
                self.apply_local(update);
                let _ = done.send(());
            }
            Command::Shutdown(_) => {}
        }
    }

    fn apply_local(&mut self, update: LocalUpdate) {
        match update {
            LocalUpdate::Optimistic {
                conversation_type,
                project_id,
                message,
            } => self
                .state
                .insert_optimistic(conversation_type, project_id.as_deref(), message),
            LocalUpdate::Conversation(event) => self.state.apply_conversation(event),
            LocalUpdate::ToggleReaction { id, emoji, user_id } => {
                self.state.toggle_reaction(&id, &emoji, &user_id);
            }
            LocalUpdate::ActiveConversation(id) => self.state.set_active_conversation(id),
            LocalUpdate::MarkRead {
                conversation_type,
                conversation_id,
                project_id,
            } => self
                .state
                .mark_read(conversation_type, &conversation_id, project_id.as_deref()),
            LocalUpdate::NotificationRead(id) => self.state.mark_notification_read(&id),
            LocalUpdate::LoadProjects(projects) => self.state.load_projects(projects),
            LocalUpdate::ActiveProject(id) => self.state.set_active_project(id),
        }
    }

    fn transmit(&mut self, frame: String, action: &str) -> Result<()> {
        let Some(active) = &self.socket else {
            return Err(SyncError::NotConnected);
        };
        if !self.lifecycle.state().is_open() {
            return Err(SyncError::NotConnected);
        }
        active.handle.send_text(frame)?;
        log::trace!("-> {action}");
        if action == action::PRESENCE_PING {
            self.health.record_ping();
        }
        Ok(())
    }

    fn send_presence_ping(&mut self) {
        match Outbound::PresencePing.encode() {
            Ok(frame) => {
                if let Err(e) = self.transmit(frame, action::PRESENCE_PING) {
                    log::debug!("presence ping not sent: {e}");
                }
            }
            Err(e) => log::error!("failed to encode presence ping: {e}"),
        }
    }

    // ─── Lifecycle ───────────────────────────────────────────────

    fn connect(&mut self) {
        if self.socket.is_some() || self.dialing.is_some() {
            log::debug!("connect ignored: a socket already exists");
            return;
        }
        self.advance(LifecycleEvent::Dial);
        if self.lifecycle.state() == ConnectionState::Connecting {
            self.retry_at = None;
            self.start_dial();
        }
    }

    fn on_retry_due(&mut self) {
        if self.socket.is_some() || self.dialing.is_some() {
            log::debug!("retry skipped: a socket already exists");
            return;
        }
        self.advance(LifecycleEvent::RetryDue);
        if self.lifecycle.state() == ConnectionState::Connecting {
            self.start_dial();
        }
    }

    fn start_dial(&mut self) {
        let socket = self.next_socket;
        self.next_socket += 1;
        log::info!(
            "dialing {} (session {}, attempt {})",
            self.config.url,
            self.session.short(),
            self.lifecycle.attempts() + 1
        );
        let task = transport::spawn_dial(
            socket,
            self.config.url.clone(),
            Arc::clone(&self.tokens),
            self.session.clone(),
            self.config.open_timeout,
            self.events_tx.clone(),
        );
        self.dialing = Some(Dialing { socket, task });
    }

    /// Feed an event into the lifecycle, publish the new state, and arm the
    /// retry timer if a reconnect was scheduled.
    fn advance(&mut self, event: LifecycleEvent) {
        let prev = self.lifecycle;
        let next = prev.step(event, &self.config.reconnect);
        self.lifecycle = next;

        let state = next.state();
        if prev.state() != state {
            log::info!("connection {} -> {}", prev.state().label(), state.label());
            self.state_tx.send_replace(state);
            self.store.update(channels::CONNECTION_STATE, state);
        }

        match state {
            ConnectionState::Reconnecting { attempt, delay } => {
                log::warn!(
                    "reconnecting in {delay:?} (attempt {attempt}/{})",
                    self.config.reconnect.max_attempts
                );
                self.retry_at = Some(Box::pin(tokio::time::sleep(delay)));
            }
            ConnectionState::Disconnected
                if prev.state() != ConnectionState::Disconnected
                    && matches!(
                        event,
                        LifecycleEvent::DialFailed | LifecycleEvent::Closed(CloseKind::Abnormal)
                    ) =>
            {
                log::error!(
                    "giving up after {} failed attempts; call connect() to retry",
                    next.attempts()
                );
            }
            _ => {}
        }
    }

    fn teardown(&mut self) {
        if let Some(dialing) = self.dialing.take() {
            dialing.task.abort();
        }
        if let Some(active) = self.socket.take() {
            active.handle.close();
            self.health.record_disconnect();
        }
        self.retry_at = None;
        self.collaborators_at = None;
        self.advance(LifecycleEvent::Shutdown);
        log::info!("session {} torn down", self.session.short());
    }

    // ─── Transport events ────────────────────────────────────────

    fn handle_transport(&mut self, event: TransportEvent) {
        match event {
            TransportEvent::Opened { socket, stream } => self.on_opened(socket, *stream),
            TransportEvent::DialFailed { socket, error } => self.on_dial_failed(socket, error),
            TransportEvent::Frame { socket, text } => {
                if self.is_current(socket) {
                    self.on_frame(&text);
                }
            }
            TransportEvent::Pong { socket } => {
                if self.is_current(socket) {
                    self.health.record_pong();
                }
            }
            TransportEvent::Closed { socket, code } => self.on_closed(socket, code),
        }
    }

    fn is_current(&self, socket: u64) -> bool {
        self.socket.as_ref().is_some_and(|a| a.handle.id == socket)
    }

    fn take_dial(&mut self, socket: u64) -> bool {
        match &self.dialing {
            Some(dialing) if dialing.socket == socket => {
                self.dialing = None;
                true
            }
            _ => false,
        }
    }

    fn on_opened(&mut self, socket: u64, stream: WsStream) {
        if !self.take_dial(socket) || self.lifecycle.state() != ConnectionState::Connecting {
            log::debug!("discarding stale socket {socket}");
            return;
        }
        self.advance(LifecycleEvent::Opened);

        let handle = SocketHandle::spawn(socket, stream, self.events_tx.clone());
        let period = self.config.keepalive_interval;
        let mut keepalive = interval_at(Instant::now() + period, period);
        keepalive.set_missed_tick_behavior(MissedTickBehavior::Delay);
        self.socket = Some(ActiveSocket { handle, keepalive });

        self.health.record_connect();
        log::info!("socket {socket} open");
        self.send_presence_ping();
    }

    fn on_dial_failed(&mut self, socket: u64, error: SyncError) {
        if !self.take_dial(socket) {
            return;
        }
        match &error {
            SyncError::AuthUnavailable => log::warn!("no valid auth token, connect deferred"),
            other => log::warn!("dial failed: {other}"),
        }
        self.health.record_disconnect();
        if error.is_retryable() {
            self.advance(LifecycleEvent::DialFailed);
        } else {
            log::error!("not retrying: {error}");
            self.advance(LifecycleEvent::Fatal);
        }
    }

    fn on_closed(&mut self, socket: u64, code: Option<u16>) {
        if !self.is_current(socket) {
            log::debug!("close of stale socket {socket} ignored");
            return;
        }
        if let Some(active) = self.socket.take() {
            active.handle.discard();
        }
        self.health.record_disconnect();

        let kind = CloseKind::from_code(code);
        match kind {
            CloseKind::Clean => log::info!("socket {socket} closed ({code:?})"),
            CloseKind::Abnormal => log::warn!("socket {socket} closed abnormally ({code:?})"),
        }
        self.advance(LifecycleEvent::Closed(kind));
    }

    fn on_frame(&mut self, text: &str) {
        let inbound = match Inbound::parse(text) {
            Ok(inbound) => inbound,
            Err(e) => {
                log::warn!("dropping malformed frame: {e}");
                return;
            }
        };
        match self.state.apply(inbound) {
            Effect::None => {}
            Effect::Pong => self.health.record_pong(),
            Effect::RefreshCollaborators => {
                self.collaborators_at = Some(Box::pin(tokio::time::sleep(
                    self.config.collaborators_debounce,
                )));
            }
            Effect::RefreshProjects(project_id) => {
                let hooks = Arc::clone(&self.hooks);
                tokio::spawn(async move { hooks.refresh_projects(project_id.as_deref()).await });
            }
        }
    }
}

async fn keepalive_tick(socket: &mut Option<ActiveSocket>) {
    match socket {
        Some(active) => {
            active.keepalive.tick().await;
        }
        None => std::future::pending::<()>().await,
    }
}

async fn sleep_until_set(timer: &mut Option<Pin<Box<Sleep>>>) {
    match timer {
        Some(sleep) => sleep.as_mut().await,
        None => std::future::pending::<()>().await,
    }
}
