//! Client-side application state fed by the socket.
//!
//! [`SyncState`] owns the presence list, DM messages and thread summaries,
//! per-project message lists, projects, notifications, and pending invites.
//! Every list sits behind an `Arc`; a change clones the list
//! (`Arc::make_mut`), edits the copy, and publishes the new `Arc` into the
//! [`ChannelStore`]. Subscribers always see whole, immutable snapshots.
//!
//! The state is owned by the connection dispatcher and is never shared
//! across tasks, with one exception: the deleted-id set, which UI code may
//! clear directly.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use serde_json::Value;

use crate::channel_store::{channels, ChannelStore};
use crate::dedupe::{merge_messages, merge_notifications};
use crate::envelope::{ConversationEvent, ConversationOp, Inbound};
use crate::model::{now_iso, ConversationType, Message, Notification, Project, ThreadSummary};

/// Message ids deleted in this session. Inbound copies of these ids are
/// ignored so late echoes and replays cannot resurrect them.
#[derive(Debug, Clone, Default)]
pub struct DeletedIds(Arc<Mutex<HashSet<String>>>);

impl DeletedIds {
    pub fn mark(&self, id: &str) {
        if !id.is_empty() {
            self.lock().insert(id.to_owned());
        }
    }

    /// Forget `id`. Returns whether it was present.
    pub fn clear(&self, id: &str) -> bool {
        self.lock().remove(id)
    }

    pub fn contains(&self, id: &str) -> bool {
        self.lock().contains(id)
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    fn suppresses(&self, message: &Message) -> bool {
        let set = self.lock();
        [&message.message_id, &message.optimistic_id]
            .into_iter()
            .flatten()
            .any(|id| set.contains(id))
    }

    fn lock(&self) -> MutexGuard<'_, HashSet<String>> {
        self.0.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Side effects the dispatcher must carry out after applying a frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Effect {
    None,
    Pong,
    RefreshCollaborators,
    RefreshProjects(Option<String>),
}

pub struct SyncState {
    user_id: Option<String>,
    store: ChannelStore,
    deleted: DeletedIds,
    active_conversation: Option<String>,
    active_project: Option<String>,
    online_users: Arc<Vec<String>>,
    dm_messages: Arc<Vec<Message>>,
    dm_threads: Arc<Vec<ThreadSummary>>,
    project_messages: HashMap<String, Arc<Vec<Message>>>,
    projects: Arc<Vec<Project>>,
    notifications: Arc<Vec<Notification>>,
    pending_invites: Arc<Vec<Value>>,
}

impl SyncState {
    pub fn new(user_id: Option<String>, store: ChannelStore, deleted: DeletedIds) -> Self {
        Self {
            user_id,
            store,
            deleted,
            active_conversation: None,
            active_project: None,
            online_users: Arc::default(),
            dm_messages: Arc::default(),
            dm_threads: Arc::default(),
            project_messages: HashMap::new(),
            projects: Arc::default(),
            notifications: Arc::default(),
            pending_invites: Arc::default(),
        }
    }

    pub fn user_id(&self) -> Option<&str> {
        self.user_id.as_deref()
    }

    pub fn online_users(&self) -> &[String] {
        &self.online_users
    }

    pub fn dm_messages(&self) -> &[Message] {
        &self.dm_messages
    }

    pub fn dm_threads(&self) -> &[ThreadSummary] {
        &self.dm_threads
    }

    pub fn project_messages(&self, project_id: &str) -> &[Message] {
        self.project_messages
            .get(project_id)
            .map(|list| list.as_slice())
            .unwrap_or(&[])
    }

    pub fn projects(&self) -> &[Project] {
        &self.projects
    }

    pub fn active_project(&self) -> Option<&Project> {
        let id = self.active_project.as_deref()?;
        self.projects.iter().find(|p| p.project_id == id)
    }

    pub fn notifications(&self) -> &[Notification] {
        &self.notifications
    }

    pub fn pending_invites(&self) -> &[Value] {
        &self.pending_invites
    }

    pub fn active_conversation(&self) -> Option<&str> {
        self.active_conversation.as_deref()
    }

    // ─── Inbound ─────────────────────────────────────────────────

    /// Apply one classified frame.
    pub fn apply(&mut self, inbound: Inbound) -> Effect {
        match inbound {
            Inbound::OnlineUsers(users) => self.set_online_users(users),
            Inbound::TimelineUpdated { project_id, events } => {
                self.patch_project(&project_id, |p| p.set_timeline(events));
            }
            Inbound::ProjectUpdated { project_id, fields } => {
                self.patch_project(&project_id, |p| p.apply_fields(&fields));
            }
            Inbound::CollaboratorsUpdated => return Effect::RefreshCollaborators,
            Inbound::Pong => return Effect::Pong,
            Inbound::Conversation(event) => self.apply_conversation(event),
            Inbound::Notifications(items) => self.add_notifications(items),
            Inbound::NotificationRead { timestamp_uuid } => {
                self.mark_notification_read(&timestamp_uuid);
            }
            Inbound::ProjectInvite(invite) => self.add_invite(invite),
            Inbound::GalleryCreated { project_id } => return Effect::RefreshProjects(project_id),
            Inbound::Unrouted(value) => {
                log::warn!("dropping unroutable envelope: {}", truncate(&value.to_string(), 200));
            }
        }
        Effect::None
    }

    fn set_online_users(&mut self, mut users: Vec<String>) {
        if let Some(me) = &self.user_id {
            if !users.iter().any(|u| u == me) {
                users.push(me.clone());
            }
        }
        log::debug!("presence: {} users online", users.len());
        self.online_users = Arc::new(users);
        self.store
            .update_arc(channels::ONLINE_USERS, Arc::clone(&self.online_users));
    }

    /// Apply a message-level event, inbound or local.
    pub fn apply_conversation(&mut self, event: ConversationEvent) {
        let ConversationEvent {
            conversation_type,
            conversation_id,
            project_id,
            op,
        } = event;

        match (conversation_type, op) {
            (ConversationType::Dm, ConversationOp::Upsert(message)) => self.upsert_dm(message),
            (ConversationType::Dm, ConversationOp::Delete { message_id, optimistic_id }) => {
                self.delete_dm(&conversation_id, message_id.as_deref(), optimistic_id.as_deref());
            }
            (ConversationType::Dm, ConversationOp::Edit { message_id, text, edited_at, timestamp }) => {
                edit_in(Arc::make_mut(&mut self.dm_messages).as_mut_slice(), &message_id, &text, edited_at);
                if let Some(ts) = timestamp {
                    let threads = Arc::make_mut(&mut self.dm_threads);
                    for thread in threads.iter_mut() {
                        if thread.conversation_id == conversation_id && thread.last_msg_ts == ts {
                            thread.snippet = text.clone();
                        }
                    }
                }
                self.publish_dm();
            }
            (ConversationType::Dm, ConversationOp::Reaction { message_id, reactions }) => {
                for message in Arc::make_mut(&mut self.dm_messages).iter_mut() {
                    if message.message_id.as_deref() == Some(message_id.as_str()) {
                        message.reactions = Some(reactions.clone());
                    }
                }
                self.publish_dm_messages();
            }
            (ConversationType::Project, op) => {
                let Some(project_id) = project_id else {
                    log::warn!("project message without a project id dropped");
                    return;
                };
                self.apply_project_op(&project_id, op);
            }
        }
    }

    fn upsert_dm(&mut self, mut message: Message) {
        if self.deleted.suppresses(&message) {
            log::debug!("ignoring message for deleted id {:?}", message.id());
            return;
        }
        let is_self = self.user_id.is_some() && self.user_id.as_deref() == Some(message.sender_id.as_str());
        let viewing = self.active_conversation.as_deref() == Some(message.conversation_id.as_str());
        let read = viewing || is_self;
        message.read = Some(read);

        let other_user = if is_self {
            message.extra_str("recipientId").map(str::to_owned)
        } else {
            Some(message.sender_id.clone())
        };
        let threads = Arc::make_mut(&mut self.dm_threads);
        match threads
            .iter_mut()
            .find(|t| t.conversation_id == message.conversation_id)
        {
            Some(thread) => {
                thread.snippet = message.text.clone();
                thread.last_msg_ts = message.timestamp.clone();
                thread.read = read;
            }
            None => threads.push(ThreadSummary {
                conversation_id: message.conversation_id.clone(),
                snippet: message.text.clone(),
                last_msg_ts: message.timestamp.clone(),
                read,
                other_user_id: other_user,
            }),
        }

        self.dm_messages = Arc::new(merge_messages(&self.dm_messages, [message]));
        self.publish_dm();
    }

    fn delete_dm(&mut self, conversation_id: &str, message_id: Option<&str>, optimistic_id: Option<&str>) {
        self.mark_deleted(message_id, optimistic_id);
        let viewing = self.active_conversation.as_deref() == Some(conversation_id);

        let messages = Arc::make_mut(&mut self.dm_messages);
        messages.retain(|m| !is_target(m, message_id, optimistic_id));

        let latest = messages
            .iter()
            .filter(|m| m.conversation_id == conversation_id)
            .max_by_key(|m| m.parsed_timestamp());
        let (snippet, last_ts) = match latest {
            Some(m) => (m.text.clone(), m.timestamp.clone()),
            None => (String::new(), now_iso()),
        };

        for thread in Arc::make_mut(&mut self.dm_threads).iter_mut() {
            if thread.conversation_id == conversation_id {
                thread.snippet = snippet.clone();
                thread.last_msg_ts = last_ts.clone();
                thread.read = viewing || thread.read;
            }
        }
        self.publish_dm();
    }

    fn apply_project_op(&mut self, project_id: &str, op: ConversationOp) {
        if let ConversationOp::Upsert(message) = op {
            if self.deleted.suppresses(&message) {
                log::debug!("ignoring message for deleted id {:?}", message.id());
                return;
            }
            let list = self.project_messages.entry(project_id.to_owned()).or_default();
            *list = Arc::new(merge_messages(list.as_slice(), [message]));
            self.publish_project_messages(project_id);
            return;
        }

        if let ConversationOp::Delete { message_id, optimistic_id } = &op {
            self.mark_deleted(message_id.as_deref(), optimistic_id.as_deref());
        }
        // Only upserts create a project's list.
        let Some(list) = self.project_messages.get_mut(project_id) else {
            log::debug!("no messages loaded for project {project_id}, event ignored");
            return;
        };
        match op {
            ConversationOp::Upsert(_) => {}
            ConversationOp::Delete { message_id, optimistic_id } => {
                let (message_id, optimistic_id) = (message_id.as_deref(), optimistic_id.as_deref());
                Arc::make_mut(list).retain(|m| !is_target(m, message_id, optimistic_id));
            }
            ConversationOp::Edit { message_id, text, edited_at, .. } => {
                edit_in(Arc::make_mut(list).as_mut_slice(), &message_id, &text, edited_at);
            }
            ConversationOp::Reaction { message_id, reactions } => {
                for message in Arc::make_mut(list).iter_mut() {
                    if message.message_id.as_deref() == Some(message_id.as_str()) {
                        message.reactions = Some(reactions.clone());
                    }
                }
            }
        }
        self.publish_project_messages(project_id);
    }

    fn patch_project(&mut self, project_id: &str, patch: impl FnOnce(&mut Project)) {
        let Some(index) = self.projects.iter().position(|p| p.project_id == project_id) else {
            log::debug!("update for unknown project {project_id} ignored");
            return;
        };
        patch(&mut Arc::make_mut(&mut self.projects)[index]);
        self.publish_projects();
    }

    fn add_notifications(&mut self, items: Vec<Notification>) {
        self.notifications = Arc::new(merge_notifications(&self.notifications, items));
        self.store
            .update_arc(channels::NOTIFICATIONS, Arc::clone(&self.notifications));
    }

    fn add_invite(&mut self, invite: Value) {
        let invite_id = invite.get("inviteId").cloned();
        let duplicate = invite_id.is_some()
            && self
                .pending_invites
                .iter()
                .any(|i| i.get("inviteId") == invite_id.as_ref());
        if duplicate {
            return;
        }
        Arc::make_mut(&mut self.pending_invites).push(invite);
        self.store
            .update_arc(channels::PENDING_INVITES, Arc::clone(&self.pending_invites));
    }

    // ─── Local mutations ─────────────────────────────────────────

    /// Insert a message this client is about to send.
    pub fn insert_optimistic(&mut self, conversation_type: ConversationType, project_id: Option<&str>, message: Message) {
        match (conversation_type, project_id) {
            (ConversationType::Dm, _) => self.upsert_dm(message),
            (ConversationType::Project, Some(project_id)) => {
                self.apply_project_op(project_id, ConversationOp::Upsert(message));
            }
            (ConversationType::Project, None) => {
                log::warn!("optimistic project message without a project id dropped");
            }
        }
    }

    /// Flip `user_id` in the `emoji` set of the message addressed by `id`.
    pub fn toggle_reaction(&mut self, id: &str, emoji: &str, user_id: &str) {
        if self.dm_messages.iter().any(|m| m.matches_id(id)) {
            for message in Arc::make_mut(&mut self.dm_messages).iter_mut() {
                if message.matches_id(id) {
                    message.toggle_reaction(emoji, user_id);
                }
            }
            self.publish_dm_messages();
        }

        let mut touched = Vec::new();
        for (project_id, list) in self.project_messages.iter_mut() {
            if !list.iter().any(|m| m.matches_id(id)) {
                continue;
            }
            for message in Arc::make_mut(list).iter_mut() {
                if message.matches_id(id) {
                    message.toggle_reaction(emoji, user_id);
                }
            }
            touched.push(project_id.clone());
        }
        for project_id in touched {
            self.publish_project_messages(&project_id);
        }
    }

    pub fn set_active_conversation(&mut self, conversation_id: Option<String>) {
        self.active_conversation = conversation_id;
    }

    /// Mark a conversation read locally.
    pub fn mark_read(&mut self, conversation_type: ConversationType, conversation_id: &str, project_id: Option<&str>) {
        match (conversation_type, project_id) {
            (ConversationType::Dm, _) => {
                for thread in Arc::make_mut(&mut self.dm_threads).iter_mut() {
                    if thread.conversation_id == conversation_id {
                        thread.read = true;
                    }
                }
                for message in Arc::make_mut(&mut self.dm_messages).iter_mut() {
                    if message.conversation_id == conversation_id {
                        message.read = Some(true);
                    }
                }
                self.publish_dm();
            }
            (ConversationType::Project, Some(project_id)) => {
                if let Some(list) = self.project_messages.get_mut(project_id) {
                    for message in Arc::make_mut(list).iter_mut() {
                        message.read = Some(true);
                    }
                    self.publish_project_messages(project_id);
                }
            }
            (ConversationType::Project, None) => {}
        }
    }

    pub fn mark_notification_read(&mut self, timestamp_uuid: &str) {
        let list = Arc::make_mut(&mut self.notifications);
        let mut changed = false;
        for notification in list.iter_mut() {
            if notification.timestamp_uuid.as_deref() == Some(timestamp_uuid) && !notification.is_read() {
                notification.read = Some(true);
                changed = true;
            }
        }
        if changed {
            self.store
                .update_arc(channels::NOTIFICATIONS, Arc::clone(&self.notifications));
        }
    }

    /// Replace the project list with one fetched by the host.
    pub fn load_projects(&mut self, projects: Vec<Project>) {
        self.projects = Arc::new(projects);
        self.publish_projects();
    }

    pub fn set_active_project(&mut self, project_id: Option<String>) {
        self.active_project = project_id;
        self.store
            .update(channels::ACTIVE_PROJECT, self.active_project().cloned());
    }

    fn mark_deleted(&self, message_id: Option<&str>, optimistic_id: Option<&str>) {
        if let Some(id) = message_id.or(optimistic_id) {
            self.deleted.mark(id);
        }
    }

    // ─── Publishing ──────────────────────────────────────────────

    fn publish_dm(&self) {
        self.publish_dm_messages();
        self.store
            .update_arc(channels::DM_THREADS, Arc::clone(&self.dm_threads));
    }

    fn publish_dm_messages(&self) {
        self.store
            .update_arc(channels::DM_MESSAGES, Arc::clone(&self.dm_messages));
    }

    fn publish_project_messages(&self, project_id: &str) {
        if let Some(list) = self.project_messages.get(project_id) {
            self.store
                .update_arc(&channels::project_messages(project_id), Arc::clone(list));
        }
    }

    fn publish_projects(&self) {
        self.store
            .update_arc(channels::PROJECTS, Arc::clone(&self.projects));
        if self.active_project.is_some() {
            self.store
                .update(channels::ACTIVE_PROJECT, self.active_project().cloned());
        }
    }
}

fn is_target(message: &Message, message_id: Option<&str>, optimistic_id: Option<&str>) -> bool {
    let by_server = message_id.is_some() && message.message_id.as_deref() == message_id;
    let by_client = optimistic_id.is_some() && message.optimistic_id.as_deref() == optimistic_id;
    by_server || by_client
}

fn edit_in(messages: &mut [Message], message_id: &str, text: &str, edited_at: Option<String>) {
    for message in messages.iter_mut() {
        if message.message_id.as_deref() == Some(message_id) {
            message.text = text.to_owned();
            message.edited = true;
            message.edited_at = edited_at.clone();
        }
    }
}

fn truncate(s: &str, max: usize) -> &str {
    match s.char_indices().nth(max) {
        Some((i, _)) => &s[..i],
        None => s,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::{json, Map};

    fn fields(pairs: impl IntoIterator<Item = (&'static str, Value)>) -> Map<String, Value> {
        pairs.into_iter().map(|(k, v)| (k.to_owned(), v)).collect()
    }

    fn state() -> (SyncState, ChannelStore) {
        let store = ChannelStore::new();
        let state = SyncState::new(Some("me".into()), store.clone(), DeletedIds::default());
        (state, store)
    }

    fn dm(value: Value) -> Inbound {
        Inbound::classify(value)
    }

    fn new_dm(message_id: &str, sender: &str, text: &str, ts: &str) -> Inbound {
        dm(json!({
            "action": "newMessage", "conversationType": "dm", "conversationId": "me#you",
            "messageId": message_id, "senderId": sender, "recipientId": "me",
            "text": text, "timestamp": ts
        }))
    }

    #[test]
    fn test_presence_appends_self() {
        let (mut state, store) = state();
        state.apply(Inbound::OnlineUsers(vec!["a".into()]));
        assert_eq!(store.get(channels::ONLINE_USERS, Vec::<String>::new()), vec!["a", "me"]);

        state.apply(Inbound::OnlineUsers(vec!["me".into(), "b".into()]));
        assert_eq!(state.online_users(), &["me".to_string(), "b".to_string()]);
    }

    #[test]
    fn test_inbound_dm_creates_thread_unread() {
        let (mut state, store) = state();
        state.apply(new_dm("m1", "you", "hello", "2024-05-01T12:00:00.000Z"));

        let threads = store.get(channels::DM_THREADS, Vec::<ThreadSummary>::new());
        assert_eq!(threads.len(), 1);
        assert_eq!(threads[0].snippet, "hello");
        assert!(!threads[0].read);
        assert_eq!(threads[0].other_user_id.as_deref(), Some("you"));
        assert_eq!(state.dm_messages()[0].read, Some(false));
    }

    #[test]
    fn test_viewing_conversation_marks_read() {
        let (mut state, _store) = state();
        state.set_active_conversation(Some("me#you".into()));
        state.apply(new_dm("m1", "you", "hello", "2024-05-01T12:00:00.000Z"));
        assert!(state.dm_threads()[0].read);
        assert_eq!(state.dm_messages()[0].read, Some(true));
    }

    #[test]
    fn test_optimistic_dm_reconciled_by_echo() {
        let (mut state, _store) = state();
        let optimistic = Message {
            optimistic_id: Some("opt-1".into()),
            sender_id: "me".into(),
            conversation_id: "me#you".into(),
            text: "hi".into(),
            timestamp: "2024-05-01T12:00:00.000Z".into(),
            extra: fields([("recipientId", json!("you"))]),
            ..Default::default()
        };
        state.insert_optimistic(ConversationType::Dm, None, optimistic);
        assert_eq!(state.dm_threads()[0].other_user_id.as_deref(), Some("you"));
        assert!(state.dm_threads()[0].read);

        state.apply(dm(json!({
            "action": "newMessage", "conversationType": "dm", "conversationId": "me#you",
            "messageId": "m1", "optimisticId": "opt-1", "senderId": "me",
            "text": "hi", "timestamp": "2024-05-01T12:00:00.000Z"
        })));

        assert_eq!(state.dm_messages().len(), 1);
        assert_eq!(state.dm_messages()[0].message_id.as_deref(), Some("m1"));
    }

    #[test]
    fn test_delete_suppresses_resurrection() {
        let (mut state, _store) = state();
        state.apply(new_dm("m1", "you", "first", "2024-05-01T12:00:00.000Z"));
        state.apply(new_dm("m2", "you", "second", "2024-05-01T12:01:00.000Z"));

        state.apply(dm(json!({
            "action": "deleteMessage", "conversationType": "dm",
            "conversationId": "me#you", "messageId": "m2"
        })));
        assert_eq!(state.dm_messages().len(), 1);
        assert_eq!(state.dm_threads()[0].snippet, "first");
        assert_eq!(state.dm_threads()[0].last_msg_ts, "2024-05-01T12:00:00.000Z");

        state.apply(new_dm("m2", "you", "second", "2024-05-01T12:01:00.000Z"));
        assert_eq!(state.dm_messages().len(), 1);
    }

    #[test]
    fn test_deleting_last_message_empties_snippet() {
        let (mut state, _store) = state();
        state.apply(new_dm("m1", "you", "only", "2024-05-01T12:00:00.000Z"));
        state.apply(dm(json!({
            "action": "deleteMessage", "conversationType": "dm",
            "conversationId": "me#you", "messageId": "m1"
        })));
        let thread = &state.dm_threads()[0];
        assert_eq!(thread.snippet, "");
        assert!(crate::model::parse_timestamp(&thread.last_msg_ts).is_some());
    }

    #[test]
    fn test_edit_updates_latest_snippet() {
        let (mut state, _store) = state();
        state.apply(new_dm("m1", "you", "typo", "2024-05-01T12:00:00.000Z"));
        state.apply(dm(json!({
            "action": "editMessage", "conversationType": "dm", "conversationId": "me#you",
            "messageId": "m1", "text": "fixed", "editedAt": "2024-05-01T12:05:00.000Z",
            "timestamp": "2024-05-01T12:00:00.000Z"
        })));

        let message = &state.dm_messages()[0];
        assert_eq!(message.text, "fixed");
        assert!(message.edited);
        assert_eq!(state.dm_threads()[0].snippet, "fixed");
    }

    #[test]
    fn test_reaction_map_replaced() {
        let (mut state, _store) = state();
        state.apply(new_dm("m1", "you", "hi", "2024-05-01T12:00:00.000Z"));
        state.toggle_reaction("m1", "🎉", "me");
        assert!(state.dm_messages()[0].reactions.as_ref().unwrap()["🎉"].contains("me"));

        state.apply(dm(json!({
            "action": "toggleReaction", "conversationType": "dm", "conversationId": "me#you",
            "messageId": "m1", "reactions": {"👍": ["you"]}
        })));
        let reactions = state.dm_messages()[0].reactions.clone().unwrap();
        assert!(reactions.get("🎉").is_none());
        assert!(reactions["👍"].contains("you"));
    }

    #[test]
    fn test_project_messages_use_own_channel() {
        let (mut state, store) = state();
        let dm_updates = Arc::new(std::sync::atomic::AtomicUsize::new(0));
        let counter = Arc::clone(&dm_updates);
        let _sub = store.subscribe(channels::DM_MESSAGES, move || {
            counter.fetch_add(1, std::sync::atomic::Ordering::SeqCst);
        });

        state.apply(dm(json!({
            "action": "newMessage", "conversationType": "project", "conversationId": "project#p1",
            "messageId": "m1", "senderId": "you", "text": "status?", "timestamp": "2024-05-01T12:00:00.000Z"
        })));

        let list = store.get(&channels::project_messages("p1"), Vec::<Message>::new());
        assert_eq!(list.len(), 1);
        assert_eq!(dm_updates.load(std::sync::atomic::Ordering::SeqCst), 0);
    }

    #[test]
    fn test_project_delete_and_suppress() {
        let (mut state, _store) = state();
        let new = json!({
            "action": "newMessage", "conversationType": "project", "projectId": "p1",
            "conversationId": "project#p1", "messageId": "m1", "senderId": "you",
            "text": "x", "timestamp": "2024-05-01T12:00:00.000Z"
        });
        state.apply(dm(new.clone()));
        state.apply(dm(json!({
            "action": "deleteMessage", "conversationType": "project",
            "conversationId": "project#p1", "messageId": "m1"
        })));
        state.apply(dm(new));
        assert!(state.project_messages("p1").is_empty());
        assert!(state.deleted.contains("m1"));
    }

    #[test]
    fn test_events_for_unloaded_project_leave_no_list() {
        let (mut state, _store) = state();
        state.apply(dm(json!({
            "action": "deleteMessage", "conversationType": "project",
            "conversationId": "project#p9", "messageId": "m1"
        })));
        state.apply(dm(json!({
            "action": "editMessage", "conversationType": "project", "conversationId": "project#p9",
            "messageId": "m2", "text": "fixed", "editedAt": "2024-05-01T12:05:00.000Z"
        })));
        state.apply(dm(json!({
            "action": "toggleReaction", "conversationType": "project", "conversationId": "project#p9",
            "messageId": "m3", "reactions": {"👍": ["you"]}
        })));

        assert!(state.project_messages.is_empty());
        assert!(state.deleted.contains("m1"));
    }

    #[test]
    fn test_project_edit_rewrites_text() {
        let (mut state, _store) = state();
        state.apply(dm(json!({
            "action": "newMessage", "conversationType": "project", "conversationId": "project#p1",
            "messageId": "m1", "senderId": "you", "text": "draft", "timestamp": "2024-05-01T12:00:00.000Z"
        })));
        state.apply(dm(json!({
            "action": "editMessage", "conversationType": "project", "conversationId": "project#p1",
            "messageId": "m1", "text": "final", "editedAt": "2024-05-01T12:05:00.000Z"
        })));

        let message = &state.project_messages("p1")[0];
        assert_eq!(message.text, "final");
        assert!(message.edited);
    }

    #[test]
    fn test_toggle_reaction_by_optimistic_id_after_echo() {
        let (mut state, _store) = state();
        let optimistic = Message {
            optimistic_id: Some("opt-1".into()),
            sender_id: "me".into(),
            conversation_id: "me#you".into(),
            text: "hi".into(),
            timestamp: "2024-05-01T12:00:00.000Z".into(),
            extra: fields([("recipientId", json!("you"))]),
            ..Default::default()
        };
        state.insert_optimistic(ConversationType::Dm, None, optimistic);
        state.apply(dm(json!({
            "action": "newMessage", "conversationType": "dm", "conversationId": "me#you",
            "messageId": "m1", "optimisticId": "opt-1", "senderId": "me",
            "text": "hi", "timestamp": "2024-05-01T12:00:00.000Z"
        })));

        state.toggle_reaction("opt-1", "👍", "me");
        let reactions = state.dm_messages()[0].reactions.clone().unwrap();
        assert!(reactions["👍"].contains("me"));
    }

    #[test]
    fn test_project_updates_patch_loaded_projects() {
        let (mut state, store) = state();
        state.load_projects(vec![Project::new("p1"), Project::new("p2")]);
        state.set_active_project(Some("p1".into()));

        state.apply(Inbound::ProjectUpdated {
            project_id: "p1".into(),
            fields: fields([("status", json!("done"))]),
        });
        state.apply(Inbound::TimelineUpdated {
            project_id: "p1".into(),
            events: vec![json!({"id": "e1"})],
        });
        state.apply(Inbound::ProjectUpdated {
            project_id: "unknown".into(),
            fields: fields([("status", json!("x"))]),
        });

        let active = store.get(channels::ACTIVE_PROJECT, None::<Project>).unwrap();
        assert_eq!(active.fields["status"], "done");
        assert_eq!(active.timeline().len(), 1);
        assert!(state.projects()[1].fields.is_empty());
    }

    #[test]
    fn test_notifications_merge_and_read() {
        let (mut state, store) = state();
        state.apply(Inbound::classify(json!({
            "action": "notificationsBatch",
            "items": [
                {"timestamp#uuid": "a", "timestamp": "2024-01-01T00:00:00Z"},
                {"timestamp#uuid": "b", "timestamp": "2024-02-01T00:00:00Z"}
            ]
        })));
        state.apply(Inbound::classify(json!({
            "action": "notification", "timestamp#uuid": "a", "timestamp": "2024-01-01T00:00:00Z"
        })));
        assert_eq!(state.notifications().len(), 2);
        assert_eq!(state.notifications()[0].timestamp_uuid.as_deref(), Some("b"));

        state.apply(Inbound::NotificationRead { timestamp_uuid: "a".into() });
        let list = store.get(channels::NOTIFICATIONS, Vec::<Notification>::new());
        assert!(list[1].is_read());
        assert!(!list[0].is_read());
    }

    #[test]
    fn test_invites_dedupe_by_id() {
        let (mut state, _store) = state();
        let invite = json!({"action": "projectInvite", "invite": {"inviteId": "i1", "projectId": "p1"}});
        state.apply(Inbound::classify(invite.clone()));
        state.apply(Inbound::classify(invite));
        assert_eq!(state.pending_invites().len(), 1);
    }

    #[test]
    fn test_effects() {
        let (mut state, _store) = state();
        assert_eq!(state.apply(Inbound::Pong), Effect::Pong);
        assert_eq!(state.apply(Inbound::CollaboratorsUpdated), Effect::RefreshCollaborators);
        assert_eq!(
            state.apply(Inbound::GalleryCreated { project_id: Some("p1".into()) }),
            Effect::RefreshProjects(Some("p1".into()))
        );
        assert_eq!(state.apply(Inbound::Unrouted(json!({"action": "?"}))), Effect::None);
    }

    #[test]
    fn test_mark_read_dm() {
        let (mut state, _store) = state();
        state.apply(new_dm("m1", "you", "hi", "2024-05-01T12:00:00.000Z"));
        state.mark_read(ConversationType::Dm, "me#you", None);
        assert!(state.dm_threads()[0].read);
        assert_eq!(state.dm_messages()[0].read, Some(true));
    }

    #[test]
    fn test_published_snapshots_are_immutable() {
        let (mut state, store) = state();
        state.apply(new_dm("m1", "you", "one", "2024-05-01T12:00:00.000Z"));
        let before = store.get_arc::<Vec<Message>>(channels::DM_MESSAGES).unwrap();
        state.apply(new_dm("m2", "you", "two", "2024-05-01T12:01:00.000Z"));
        assert_eq!(before.len(), 1);
        assert_eq!(state.dm_messages().len(), 2);
    }

    #[test]
    fn test_cleared_deleted_id_allows_insert() {
        let (mut state, _store) = state();
        let deleted = state.deleted.clone();
        deleted.mark("m1");
        state.apply(new_dm("m1", "you", "hi", "2024-05-01T12:00:00.000Z"));
        assert!(state.dm_messages().is_empty());

        assert!(deleted.clear("m1"));
        state.apply(new_dm("m1", "you", "hi", "2024-05-01T12:00:00.000Z"));
        assert_eq!(state.dm_messages().len(), 1);
    }
}
