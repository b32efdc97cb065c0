//! JSON envelope codec for the sync socket.
//!
//! Every frame is a JSON object carrying an `action` discriminator
//! (presence frames use `type` instead):
//! ```text
//! {"action":"sendMessage","conversationType":"dm","conversationId":"a#b",
//!  "optimisticId":"…","senderId":"a","text":"hi","timestamp":"…"}
//! {"type":"onlineUsers","users":["a","b"]}
//! ```
//!
//! Outbound envelopes are typed ([`Outbound`]) and stamped by
//! [`normalize_envelope`]; inbound frames are classified into [`Inbound`]
//! before they reach client state.

use serde::Serialize;
use serde_json::{Map, Value};

use crate::error::Result;
use crate::model::{ConversationType, Message, Notification, Reactions};

/// Action names used on the wire.
pub mod action {
    pub const PRESENCE_PING: &str = "presencePing";
    pub const SEND_MESSAGE: &str = "sendMessage";
    pub const NEW_MESSAGE: &str = "newMessage";
    pub const DELETE_MESSAGE: &str = "deleteMessage";
    pub const EDIT_MESSAGE: &str = "editMessage";
    pub const TOGGLE_REACTION: &str = "toggleReaction";
    pub const SET_ACTIVE_CONVERSATION: &str = "setActiveConversation";
    pub const MARK_READ: &str = "markRead";
    pub const TIMELINE_UPDATED: &str = "timelineUpdated";
    pub const PROJECT_UPDATED: &str = "projectUpdated";
    pub const NOTIFICATION: &str = "notification";
    pub const NOTIFICATIONS_BATCH: &str = "notificationsBatch";
    pub const NOTIFICATION_READ: &str = "notificationRead";
    pub const PROJECT_INVITE: &str = "projectInvite";
    pub const GALLERY_CREATED: &str = "galleryCreated";
}

const PROJECT_CONVERSATION_PREFIX: &str = "project#";

/// Guarantee an `action` field on `value`.
///
/// Objects without one get `default_action` copied in; objects that have one
/// pass through untouched; anything that is not an object is replaced by
/// `{"action": default_action}`.
pub fn normalize_envelope(value: Value, default_action: &str) -> Value {
    match value {
        Value::Object(mut map) => {
            if !map.contains_key("action") {
                map.insert("action".to_owned(), Value::String(default_action.to_owned()));
            }
            Value::Object(map)
        }
        _ => {
            let mut map = Map::new();
            map.insert("action".to_owned(), Value::String(default_action.to_owned()));
            Value::Object(map)
        }
    }
}

// ─── Outbound ────────────────────────────────────────────────────

/// Envelopes this client sends.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "action", rename_all = "camelCase", rename_all_fields = "camelCase")]
pub enum Outbound {
    PresencePing,
    SendMessage {
        conversation_type: ConversationType,
        conversation_id: String,
        optimistic_id: String,
        sender_id: String,
        text: String,
        timestamp: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        recipient_id: Option<String>,
        #[serde(skip_serializing_if = "Option::is_none")]
        project_id: Option<String>,
    },
    DeleteMessage {
        conversation_type: ConversationType,
        conversation_id: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        message_id: Option<String>,
        #[serde(skip_serializing_if = "Option::is_none")]
        optimistic_id: Option<String>,
    },
    EditMessage {
        conversation_type: ConversationType,
        conversation_id: String,
        message_id: String,
        text: String,
        edited_at: String,
    },
    ToggleReaction {
        conversation_type: ConversationType,
        conversation_id: String,
        message_id: String,
        emoji: String,
        user_id: String,
    },
    SetActiveConversation {
        conversation_id: String,
    },
    MarkRead {
        conversation_type: ConversationType,
        conversation_id: String,
        user_id: String,
    },
    NotificationRead {
        timestamp_uuid: String,
    },
}

impl Outbound {
    pub fn action(&self) -> &'static str {
        match self {
            Self::PresencePing => action::PRESENCE_PING,
            Self::SendMessage { .. } => action::SEND_MESSAGE,
            Self::DeleteMessage { .. } => action::DELETE_MESSAGE,
            Self::EditMessage { .. } => action::EDIT_MESSAGE,
            Self::ToggleReaction { .. } => action::TOGGLE_REACTION,
            Self::SetActiveConversation { .. } => action::SET_ACTIVE_CONVERSATION,
            Self::MarkRead { .. } => action::MARK_READ,
            Self::NotificationRead { .. } => action::NOTIFICATION_READ,
        }
    }

    /// Serialize to a text frame.
    pub fn encode(&self) -> Result<String> {
        let value = normalize_envelope(serde_json::to_value(self)?, self.action());
        Ok(serde_json::to_string(&value)?)
    }
}

/// Encode an arbitrary JSON value as a frame, stamping `default_action` if
/// the value carries none.
pub fn encode_value(value: Value, default_action: &str) -> Result<String> {
    Ok(serde_json::to_string(&normalize_envelope(value, default_action))?)
}

// ─── Inbound ─────────────────────────────────────────────────────

/// What a conversation envelope asks the client to do.
#[derive(Debug, Clone, PartialEq)]
pub enum ConversationOp {
    /// `sendMessage` / `newMessage`: merge the record.
    Upsert(Message),
    Delete {
        message_id: Option<String>,
        optimistic_id: Option<String>,
    },
    Edit {
        message_id: String,
        text: String,
        edited_at: Option<String>,
        /// Timestamp of the edited message, used to refresh thread snippets.
        timestamp: Option<String>,
    },
    Reaction {
        message_id: String,
        reactions: Reactions,
    },
}

#[derive(Debug, Clone, PartialEq)]
pub struct ConversationEvent {
    pub conversation_type: ConversationType,
    pub conversation_id: String,
    /// Resolved for project conversations, `None` for DMs.
    pub project_id: Option<String>,
    pub op: ConversationOp,
}

/// A classified inbound frame.
#[derive(Debug, Clone, PartialEq)]
pub enum Inbound {
    OnlineUsers(Vec<String>),
    TimelineUpdated {
        project_id: String,
        events: Vec<Value>,
    },
    ProjectUpdated {
        project_id: String,
        fields: Map<String, Value>,
    },
    CollaboratorsUpdated,
    Pong,
    Conversation(ConversationEvent),
    Notifications(Vec<Notification>),
    NotificationRead {
        timestamp_uuid: String,
    },
    ProjectInvite(Value),
    GalleryCreated {
        project_id: Option<String>,
    },
    /// Valid JSON that matched no known shape.
    Unrouted(Value),
}

impl Inbound {
    /// Parse a text frame. Only malformed JSON is an error; unknown shapes
    /// come back as [`Inbound::Unrouted`].
    pub fn parse(frame: &str) -> Result<Self> {
        let value: Value = serde_json::from_str(frame)?;
        Ok(Self::classify(value))
    }

    pub fn classify(value: Value) -> Self {
        let map = match value {
            Value::Object(map) => map,
            other => return Self::Unrouted(other),
        };

        let kind = str_field(&map, "type");
        let act = str_field(&map, "action");

        match (kind, act) {
            (Some("onlineUsers"), _) => {
                if let Some(users) = map.get("users").and_then(Value::as_array) {
                    let users = users
                        .iter()
                        .filter_map(|u| u.as_str().map(str::to_owned))
                        .collect();
                    return Self::OnlineUsers(users);
                }
            }
            (Some("collaborators-updated"), _) => return Self::CollaboratorsUpdated,
            (Some("pong"), _) | (_, Some("pong")) => return Self::Pong,
            _ => {}
        }

        if let Some(conversation_type) = conversation_type(&map) {
            if let Some(event) = conversation_event(conversation_type, &map) {
                return Self::Conversation(event);
            }
            return Self::Unrouted(Value::Object(map));
        }

        match act {
            Some(action::TIMELINE_UPDATED) => {
                if let (Some(project_id), Some(events)) = (
                    str_field(&map, "projectId"),
                    map.get("events").and_then(Value::as_array),
                ) {
                    return Self::TimelineUpdated {
                        project_id: project_id.to_owned(),
                        events: events.clone(),
                    };
                }
            }
            Some(action::PROJECT_UPDATED) => {
                if let (Some(project_id), Some(fields)) = (
                    str_field(&map, "projectId"),
                    map.get("fields").and_then(Value::as_object),
                ) {
                    return Self::ProjectUpdated {
                        project_id: project_id.to_owned(),
                        fields: fields.clone(),
                    };
                }
            }
            Some(action::NOTIFICATION) => {
                if let Ok(notification) = serde_json::from_value(Value::Object(map.clone())) {
                    return Self::Notifications(vec![unread(notification)]);
                }
            }
            Some(action::NOTIFICATIONS_BATCH) => {
                if let Some(items) = map.get("items").and_then(Value::as_array) {
                    let notifications = items
                        .iter()
                        .filter_map(|item| serde_json::from_value(item.clone()).ok())
                        .map(unread)
                        .collect();
                    return Self::Notifications(notifications);
                }
            }
            Some(action::NOTIFICATION_READ) => {
                if let Some(id) = str_field(&map, "timestampUuid") {
                    return Self::NotificationRead {
                        timestamp_uuid: id.to_owned(),
                    };
                }
            }
            Some(action::PROJECT_INVITE) => {
                if let Some(invite) = map.get("invite").filter(|i| i.is_object()) {
                    return Self::ProjectInvite(invite.clone());
                }
            }
            Some(action::GALLERY_CREATED) => {
                return Self::GalleryCreated {
                    project_id: str_field(&map, "projectId").map(str::to_owned),
                };
            }
            _ => {}
        }

        Self::Unrouted(Value::Object(map))
    }
}

fn str_field<'a>(map: &'a Map<String, Value>, key: &str) -> Option<&'a str> {
    map.get(key).and_then(Value::as_str).filter(|s| !s.is_empty())
}

fn conversation_type(map: &Map<String, Value>) -> Option<ConversationType> {
    match str_field(map, "conversationType")? {
        "dm" => Some(ConversationType::Dm),
        "project" => Some(ConversationType::Project),
        _ => None,
    }
}

fn unread(mut notification: Notification) -> Notification {
    notification.read = Some(false);
    notification
}

/// The project id embedded in a `project#<id>` conversation id.
pub fn project_id_from_conversation(conversation_id: &str) -> Option<&str> {
    conversation_id
        .strip_prefix(PROJECT_CONVERSATION_PREFIX)
        .filter(|id| !id.is_empty())
}

/// `projectId` if present, otherwise the `conversationId` with its
/// `project#` prefix stripped.
pub fn resolve_project_id(map: &Map<String, Value>) -> Option<String> {
    if let Some(id) = str_field(map, "projectId") {
        return Some(id.to_owned());
    }
    str_field(map, "conversationId")
        .and_then(project_id_from_conversation)
        .map(str::to_owned)
}

fn conversation_event(
    conversation_type: ConversationType,
    map: &Map<String, Value>,
) -> Option<ConversationEvent> {
    let project_id = match conversation_type {
        ConversationType::Project => Some(resolve_project_id(map)?),
        ConversationType::Dm => None,
    };
    let conversation_id = str_field(map, "conversationId").unwrap_or_default().to_owned();
    let owned = |key: &str| str_field(map, key).map(str::to_owned);

    let op = match str_field(map, "action")? {
        action::SEND_MESSAGE | action::NEW_MESSAGE => {
            let message: Message = serde_json::from_value(Value::Object(map.clone())).ok()?;
            ConversationOp::Upsert(message)
        }
        action::DELETE_MESSAGE => {
            let message_id = owned("messageId");
            let optimistic_id = owned("optimisticId");
            if message_id.is_none() && optimistic_id.is_none() {
                return None;
            }
            ConversationOp::Delete {
                message_id,
                optimistic_id,
            }
        }
        action::EDIT_MESSAGE => ConversationOp::Edit {
            message_id: owned("messageId")?,
            text: map.get("text").and_then(Value::as_str)?.to_owned(),
            edited_at: owned("editedAt"),
            timestamp: owned("timestamp"),
        },
        action::TOGGLE_REACTION => ConversationOp::Reaction {
            message_id: owned("messageId")?,
            reactions: map
                .get("reactions")
                .cloned()
                .and_then(|r| serde_json::from_value(r).ok())
                .unwrap_or_default(),
        },
        _ => return None,
    };

    Some(ConversationEvent {
        conversation_type,
        conversation_id,
        project_id,
        op,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_normalize_copies_default() {
        let out = normalize_envelope(json!({"conversationId": "c1"}), "markRead");
        assert_eq!(out, json!({"conversationId": "c1", "action": "markRead"}));
    }

    #[test]
    fn test_normalize_keeps_existing_action() {
        let input = json!({"action": "editMessage", "text": "x"});
        assert_eq!(normalize_envelope(input.clone(), "markRead"), input);
    }

    #[test]
    fn test_normalize_wraps_non_objects() {
        assert_eq!(normalize_envelope(json!("ping"), "presencePing"), json!({"action": "presencePing"}));
        assert_eq!(normalize_envelope(Value::Null, "x"), json!({"action": "x"}));
        assert_eq!(normalize_envelope(json!([1, 2]), "x"), json!({"action": "x"}));
    }

    #[test]
    fn test_outbound_encoding() {
        let frame = Outbound::MarkRead {
            conversation_type: ConversationType::Dm,
            conversation_id: "a#b".into(),
            user_id: "a".into(),
        }
        .encode()
        .unwrap();
        let value: Value = serde_json::from_str(&frame).unwrap();
        assert_eq!(
            value,
            json!({"action": "markRead", "conversationType": "dm", "conversationId": "a#b", "userId": "a"})
        );

        let ping: Value = serde_json::from_str(&Outbound::PresencePing.encode().unwrap()).unwrap();
        assert_eq!(ping, json!({"action": "presencePing"}));
    }

    #[test]
    fn test_delete_omits_missing_ids() {
        let value = serde_json::to_value(Outbound::DeleteMessage {
            conversation_type: ConversationType::Project,
            conversation_id: "project#p1".into(),
            message_id: None,
            optimistic_id: Some("o1".into()),
        })
        .unwrap();
        assert!(value.get("messageId").is_none());
        assert_eq!(value["optimisticId"], "o1");
        assert_eq!(value["conversationType"], "project");
    }

    #[test]
    fn test_classify_presence_and_control() {
        assert_eq!(
            Inbound::classify(json!({"type": "onlineUsers", "users": ["u1", "u2"]})),
            Inbound::OnlineUsers(vec!["u1".into(), "u2".into()])
        );
        assert_eq!(Inbound::classify(json!({"type": "collaborators-updated"})), Inbound::CollaboratorsUpdated);
        assert_eq!(Inbound::classify(json!({"type": "pong"})), Inbound::Pong);
    }

    #[test]
    fn test_classify_project_updates() {
        let timeline = Inbound::classify(json!({
            "action": "timelineUpdated", "projectId": "p1", "events": [{"id": 1}]
        }));
        assert_eq!(
            timeline,
            Inbound::TimelineUpdated { project_id: "p1".into(), events: vec![json!({"id": 1})] }
        );

        let missing_events = Inbound::classify(json!({"action": "timelineUpdated", "projectId": "p1"}));
        assert!(matches!(missing_events, Inbound::Unrouted(_)));

        let fields = Inbound::classify(json!({
            "action": "projectUpdated", "projectId": "p1", "fields": {"name": "N"}
        }));
        assert!(matches!(fields, Inbound::ProjectUpdated { ref project_id, .. } if project_id == "p1"));
    }

    #[test]
    fn test_classify_dm_message() {
        let inbound = Inbound::classify(json!({
            "action": "newMessage",
            "conversationType": "dm",
            "conversationId": "a#b",
            "messageId": "m1",
            "senderId": "b",
            "text": "hello",
            "timestamp": "2024-05-01T12:00:00.000Z"
        }));
        let Inbound::Conversation(event) = inbound else {
            panic!("expected conversation event");
        };
        assert_eq!(event.conversation_type, ConversationType::Dm);
        assert_eq!(event.project_id, None);
        let ConversationOp::Upsert(msg) = event.op else {
            panic!("expected upsert");
        };
        assert_eq!(msg.message_id.as_deref(), Some("m1"));
        assert_eq!(msg.extra["action"], "newMessage");
    }

    #[test]
    fn test_project_id_resolution() {
        let from_prefix = Inbound::classify(json!({
            "action": "deleteMessage", "conversationType": "project",
            "conversationId": "project#p7", "messageId": "m1"
        }));
        let Inbound::Conversation(event) = from_prefix else {
            panic!("expected conversation event");
        };
        assert_eq!(event.project_id.as_deref(), Some("p7"));

        let unresolvable = Inbound::classify(json!({
            "action": "deleteMessage", "conversationType": "project",
            "conversationId": "general", "messageId": "m1"
        }));
        assert!(matches!(unresolvable, Inbound::Unrouted(_)));
    }

    #[test]
    fn test_delete_without_ids_is_unrouted() {
        let inbound = Inbound::classify(json!({
            "action": "deleteMessage", "conversationType": "dm", "conversationId": "a#b"
        }));
        assert!(matches!(inbound, Inbound::Unrouted(_)));
    }

    #[test]
    fn test_classify_notifications() {
        let single = Inbound::classify(json!({
            "action": "notification",
            "timestamp#uuid": "t#1",
            "timestamp": "2024-01-01T00:00:00Z",
            "read": true
        }));
        let Inbound::Notifications(items) = single else {
            panic!("expected notifications");
        };
        assert_eq!(items.len(), 1);
        assert!(!items[0].is_read());

        let batch = Inbound::classify(json!({
            "action": "notificationsBatch",
            "items": [{"timestamp#uuid": "t#1"}, {"timestamp#uuid": "t#2"}]
        }));
        assert!(matches!(batch, Inbound::Notifications(ref v) if v.len() == 2));

        assert_eq!(
            Inbound::classify(json!({"action": "notificationRead", "timestampUuid": "t#1"})),
            Inbound::NotificationRead { timestamp_uuid: "t#1".into() }
        );
    }

    #[test]
    fn test_parse_rejects_malformed_json() {
        assert!(Inbound::parse("{\"action\":").is_err());
        assert!(matches!(Inbound::parse("{\"action\":\"mystery\"}").unwrap(), Inbound::Unrouted(_)));
        assert!(matches!(Inbound::parse("42").unwrap(), Inbound::Unrouted(_)));
    }
}
