//! Connection manager: the public handle to one sync session.
//!
//! ```text
//!   UI ──► ConnectionManager ──Command──► Dispatcher task ──► socket
//!    ▲                                        │
//!    └────────── ChannelStore ◄───────────────┘
//! ```
//!
//! The handle is cheap to clone. All state lives in the dispatcher task;
//! the handle only sends it commands and reads what it publishes.

mod runtime;
mod transport;

use std::sync::Arc;
use std::time::Duration;

use serde_json::{Map, Value};
use tokio::sync::{mpsc, oneshot, watch};

use crate::channel_store::{channels, ChannelStore};
use crate::config::SyncConfig;
use crate::envelope::{
    encode_value, project_id_from_conversation, ConversationEvent, ConversationOp, Outbound,
};
use crate::error::{Result, SyncError};
use crate::health::ConnectionHealth;
use crate::lifecycle::ConnectionState;
use crate::model::{now_iso, ConversationType, Message, Notification, Project, ThreadSummary};
use crate::session::{SessionId, SyncHooks, TokenProvider};
use crate::state::DeletedIds;

use runtime::{Command, Dispatcher, LocalUpdate};

/// A message the user is about to send.
#[derive(Debug, Clone, PartialEq)]
pub struct MessageDraft {
    pub conversation_type: ConversationType,
    pub conversation_id: String,
    pub text: String,
    /// The other participant of a DM.
    pub recipient_id: Option<String>,
    /// Overrides the id derived from a `project#<id>` conversation.
    pub project_id: Option<String>,
}

impl MessageDraft {
    pub fn dm(conversation_id: impl Into<String>, recipient_id: impl Into<String>, text: impl Into<String>) -> Self {
        Self {
            conversation_type: ConversationType::Dm,
            conversation_id: conversation_id.into(),
            text: text.into(),
            recipient_id: Some(recipient_id.into()),
            project_id: None,
        }
    }

    pub fn project(project_id: impl Into<String>, text: impl Into<String>) -> Self {
        let project_id = project_id.into();
        Self {
            conversation_type: ConversationType::Project,
            conversation_id: format!("project#{project_id}"),
            text: text.into(),
            recipient_id: None,
            project_id: Some(project_id),
        }
    }

    fn resolved_project_id(&self) -> Option<String> {
        match self.conversation_type {
            ConversationType::Dm => None,
            ConversationType::Project => self
                .project_id
                .clone()
                .or_else(|| project_id_from_conversation(&self.conversation_id).map(str::to_owned)),
        }
    }
}

/// Handle to a running sync session.
#[derive(Clone)]
pub struct ConnectionManager {
    config: Arc<SyncConfig>,
    session: SessionId,
    commands: mpsc::Sender<Command>,
    state: watch::Receiver<ConnectionState>,
    store: ChannelStore,
    deleted: DeletedIds,
}

impl ConnectionManager {
    /// Load the session id and spawn the dispatcher. Does not dial; call
    /// [`connect`](Self::connect) for that.
    pub fn start(
        config: SyncConfig,
        tokens: Arc<dyn TokenProvider>,
        hooks: Arc<dyn SyncHooks>,
        store: ChannelStore,
    ) -> Result<Self> {
        let session = SessionId::load_or_create(config.session_file.as_deref())?;
        let config = Arc::new(config);
        let (commands, commands_rx) = mpsc::channel(config.command_capacity.max(1));
        let (state_tx, state) = watch::channel(ConnectionState::Disconnected);
        let deleted = DeletedIds::default();

        let dispatcher = Dispatcher::new(
            Arc::clone(&config),
            session.clone(),
            tokens,
            hooks,
            store.clone(),
            deleted.clone(),
            commands_rx,
            state_tx,
        );
        tokio::spawn(dispatcher.run());
        log::info!("sync session {} started for {}", session.short(), config.url);

        Ok(Self {
            config,
            session,
            commands,
            state,
            store,
            deleted,
        })
    }

    // ─── Lifecycle ───────────────────────────────────────────────

    /// Open the socket if it is not already open or opening. After the
    /// reconnect budget is spent this starts a fresh streak.
    pub async fn connect(&self) -> Result<()> {
        self.command(Command::Connect).await
    }

    pub fn state(&self) -> ConnectionState {
        *self.state.borrow()
    }

    pub fn is_connected(&self) -> bool {
        self.state().is_open()
    }

    pub fn watch_state(&self) -> watch::Receiver<ConnectionState> {
        self.state.clone()
    }

    /// Wait until the socket is open. Returns `false` on timeout or when the
    /// session has shut down.
    pub async fn wait_until_open(&self, timeout: Duration) -> bool {
        let mut rx = self.state.clone();
        let opened = matches!(
            tokio::time::timeout(timeout, rx.wait_for(ConnectionState::is_open)).await,
            Ok(Ok(_))
        );
        opened
    }

    /// Close the socket, cancel pending retries, and stop the dispatcher.
    pub async fn shutdown(&self) {
        let (tx, rx) = oneshot::channel();
        if self.commands.send(Command::Shutdown(tx)).await.is_ok() {
            let _ = rx.await;
        }
    }

    // ─── Readers ─────────────────────────────────────────────────

    pub fn store(&self) -> &ChannelStore {
        &self.store
    }

    pub fn session_id(&self) -> &SessionId {
        &self.session
    }

    pub fn online_users(&self) -> Vec<String> {
        self.store.get(channels::ONLINE_USERS, Vec::new())
    }

    pub fn connection_health(&self) -> ConnectionHealth {
        self.store.get(channels::CONNECTION_HEALTH, ConnectionHealth::default())
    }

    pub fn dm_messages(&self) -> Vec<Message> {
        self.store.get(channels::DM_MESSAGES, Vec::new())
    }

    pub fn dm_threads(&self) -> Vec<ThreadSummary> {
        self.store.get(channels::DM_THREADS, Vec::new())
    }

    pub fn project_messages(&self, project_id: &str) -> Vec<Message> {
        self.store.get(&channels::project_messages(project_id), Vec::new())
    }

    pub fn notifications(&self) -> Vec<Notification> {
        self.store.get(channels::NOTIFICATIONS, Vec::new())
    }

    pub fn pending_invites(&self) -> Vec<Value> {
        self.store.get(channels::PENDING_INVITES, Vec::new())
    }

    pub fn projects(&self) -> Vec<Project> {
        self.store.get(channels::PROJECTS, Vec::new())
    }

    pub fn active_project(&self) -> Option<Project> {
        self.store.get(channels::ACTIVE_PROJECT, None)
    }

    /// Ids deleted locally. Echoes carrying them are dropped until cleared.
    pub fn deleted_ids(&self) -> &DeletedIds {
        &self.deleted
    }

    /// Allow `id` to appear again. Returns whether it was marked.
    pub fn clear_deleted(&self, id: &str) -> bool {
        self.deleted.clear(id)
    }

    // ─── Sending ─────────────────────────────────────────────────

    /// Send a typed envelope. While the socket is not open the send is
    /// retried `send_attempts` times, `send_retry_delay` apart, then
    /// abandoned.
    pub async fn send(&self, envelope: Outbound) -> Result<()> {
        let frame = envelope.encode()?;
        self.transmit(frame, envelope.action()).await
    }

    /// Send an arbitrary JSON payload, stamping `default_action` when it has
    /// no `action` field.
    pub async fn send_value(&self, value: Value, default_action: &str) -> Result<()> {
        let action = value
            .get("action")
            .and_then(Value::as_str)
            .unwrap_or(default_action)
            .to_owned();
        let frame = encode_value(value, default_action)?;
        self.transmit(frame, &action).await
    }

    pub async fn presence_ping(&self) -> Result<()> {
        self.send(Outbound::PresencePing).await
    }

    /// Insert the message optimistically, then send it. Returns the
    /// optimistic id the server echo will carry.
    pub async fn send_message(&self, draft: MessageDraft) -> Result<String> {
        let sender_id = self.require_user()?;
        let optimistic_id = uuid::Uuid::new_v4().to_string();
        let timestamp = now_iso();
        let project_id = draft.resolved_project_id();
        if draft.conversation_type == ConversationType::Project && project_id.is_none() {
            return Err(SyncError::InvalidRequest(format!(
                "no project id for conversation '{}'",
                draft.conversation_id
            )));
        }

        let mut extra = Map::new();
        if let Some(recipient) = &draft.recipient_id {
            extra.insert("recipientId".to_owned(), Value::String(recipient.clone()));
        }
        let message = Message {
            optimistic_id: Some(optimistic_id.clone()),
            sender_id: sender_id.clone(),
            conversation_id: draft.conversation_id.clone(),
            text: draft.text.clone(),
            timestamp: timestamp.clone(),
            extra,
            ..Message::default()
        };
        self.apply(LocalUpdate::Optimistic {
            conversation_type: draft.conversation_type,
            project_id: project_id.clone(),
            message,
        })
        .await?;

        self.send(Outbound::SendMessage {
            conversation_type: draft.conversation_type,
            conversation_id: draft.conversation_id,
            optimistic_id: optimistic_id.clone(),
            sender_id,
            text: draft.text,
            timestamp,
            recipient_id: draft.recipient_id,
            project_id,
        })
        .await?;
        Ok(optimistic_id)
    }

    /// Remove a message locally and ask the server to delete it. The ids are
    /// remembered so a late echo cannot bring the message back.
    pub async fn delete_message(
        &self,
        conversation_type: ConversationType,
        conversation_id: &str,
        message_id: Option<&str>,
        optimistic_id: Option<&str>,
    ) -> Result<()> {
        if message_id.is_none() && optimistic_id.is_none() {
            return Err(SyncError::InvalidRequest("delete needs a message id".into()));
        }
        self.apply(LocalUpdate::Conversation(ConversationEvent {
            conversation_type,
            conversation_id: conversation_id.to_owned(),
            project_id: project_id_from_conversation(conversation_id).map(str::to_owned),
            op: ConversationOp::Delete {
                message_id: message_id.map(str::to_owned),
                optimistic_id: optimistic_id.map(str::to_owned),
            },
        }))
        .await?;

        self.send(Outbound::DeleteMessage {
            conversation_type,
            conversation_id: conversation_id.to_owned(),
            message_id: message_id.map(str::to_owned),
            optimistic_id: optimistic_id.map(str::to_owned),
        })
        .await
    }

    /// Ask the server to edit a message. The local copy changes when the
    /// echo arrives.
    pub async fn edit_message(
        &self,
        conversation_type: ConversationType,
        conversation_id: &str,
        message_id: &str,
        text: &str,
    ) -> Result<()> {
        self.send(Outbound::EditMessage {
            conversation_type,
            conversation_id: conversation_id.to_owned(),
            message_id: message_id.to_owned(),
            text: text.to_owned(),
            edited_at: now_iso(),
        })
        .await
    }

    /// Flip the reaction locally, then send it. The echo replaces the local
    /// reaction map with the server's.
    pub async fn toggle_reaction(
        &self,
        conversation_type: ConversationType,
        conversation_id: &str,
        message_id: &str,
        emoji: &str,
    ) -> Result<()> {
        let user_id = self.require_user()?;
        self.apply(LocalUpdate::ToggleReaction {
            id: message_id.to_owned(),
            emoji: emoji.to_owned(),
            user_id: user_id.clone(),
        })
        .await?;
        self.send(Outbound::ToggleReaction {
            conversation_type,
            conversation_id: conversation_id.to_owned(),
            message_id: message_id.to_owned(),
            emoji: emoji.to_owned(),
            user_id,
        })
        .await
    }

    /// Track which conversation is on screen. Incoming DMs for it arrive
    /// already read. Only a `Some` id is reported to the server.
    pub async fn set_active_conversation(&self, conversation_id: Option<&str>) -> Result<()> {
        self.apply(LocalUpdate::ActiveConversation(conversation_id.map(str::to_owned)))
            .await?;
        match conversation_id {
            Some(id) => {
                self.send(Outbound::SetActiveConversation {
                    conversation_id: id.to_owned(),
                })
                .await
            }
            None => Ok(()),
        }
    }

    pub async fn mark_read(&self, conversation_type: ConversationType, conversation_id: &str) -> Result<()> {
        let user_id = self.require_user()?;
        self.apply(LocalUpdate::MarkRead {
            conversation_type,
            conversation_id: conversation_id.to_owned(),
            project_id: project_id_from_conversation(conversation_id).map(str::to_owned),
        })
        .await?;
        self.send(Outbound::MarkRead {
            conversation_type,
            conversation_id: conversation_id.to_owned(),
            user_id,
        })
        .await
    }

    pub async fn mark_notification_read(&self, timestamp_uuid: &str) -> Result<()> {
        self.apply(LocalUpdate::NotificationRead(timestamp_uuid.to_owned()))
            .await?;
        self.send(Outbound::NotificationRead {
            timestamp_uuid: timestamp_uuid.to_owned(),
        })
        .await
    }

    /// Seed the project list, typically from a REST fetch.
    pub async fn load_projects(&self, projects: Vec<Project>) -> Result<()> {
        self.apply(LocalUpdate::LoadProjects(projects)).await
    }

    pub async fn set_active_project(&self, project_id: Option<&str>) -> Result<()> {
        self.apply(LocalUpdate::ActiveProject(project_id.map(str::to_owned)))
            .await
    }

    // ─── Internals ───────────────────────────────────────────────

    fn require_user(&self) -> Result<String> {
        self.config
            .user_id
            .clone()
            .ok_or_else(|| SyncError::InvalidRequest("no user id configured".into()))
    }

    async fn command(&self, cmd: Command) -> Result<()> {
        self.commands.send(cmd).await.map_err(|_| SyncError::Closed)
    }

    async fn apply(&self, update: LocalUpdate) -> Result<()> {
        let (tx, rx) = oneshot::channel();
        self.command(Command::Apply(update, tx)).await?;
        rx.await.map_err(|_| SyncError::Closed)
    }

    async fn transmit(&self, frame: String, action: &str) -> Result<()> {
        let attempts = self.config.send_attempts.max(1);
        for attempt in 1..=attempts {
            if self.is_connected() {
                let (tx, rx) = oneshot::channel();
                self.command(Command::Transmit {
                    frame: frame.clone(),
                    action: action.to_owned(),
                    responder: tx,
                })
                .await?;
                match rx.await.map_err(|_| SyncError::Closed)? {
                    Ok(()) => return Ok(()),
                    Err(SyncError::NotConnected) => {}
                    Err(e) => return Err(e),
                }
            }
            if attempt < attempts {
                log::debug!("{action}: socket not open, retry {attempt}/{attempts}");
                tokio::time::sleep(self.config.send_retry_delay).await;
            }
        }
        log::warn!("{action}: abandoned after {attempts} attempts");
        Err(SyncError::SendAbandoned {
            action: action.to_owned(),
            attempts,
        })
    }
}
