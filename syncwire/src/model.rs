//! Records held in client state: chat messages, thread summaries,
//! notifications, and projects.
//!
//! Every record keeps the wire fields it does not model in a flattened
//! `extra` map, so re-serializing a record never loses data the server sent.

use std::collections::{BTreeMap, BTreeSet};

use chrono::{DateTime, SecondsFormat, Utc};
use serde::{Deserialize, Deserializer, Serialize};
use serde_json::{Map, Value};

/// Emoji → set of user ids who reacted with it.
pub type Reactions = BTreeMap<String, BTreeSet<String>>;

/// Which kind of conversation a message envelope belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ConversationType {
    Dm,
    Project,
}

impl ConversationType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Dm => "dm",
            Self::Project => "project",
        }
    }
}

/// A chat message, optimistic or authoritative.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Message {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub optimistic_id: Option<String>,
    #[serde(default)]
    pub sender_id: String,
    #[serde(default)]
    pub conversation_id: String,
    #[serde(default)]
    pub text: String,
    #[serde(default)]
    pub timestamp: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reactions: Option<Reactions>,
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub edited: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub edited_at: Option<String>,
    #[serde(
        default,
        deserialize_with = "lenient_bool",
        skip_serializing_if = "Option::is_none"
    )]
    pub read: Option<bool>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl Message {
    /// The id a caller would use to address this message: the server id once
    /// known, otherwise the client's optimistic id.
    pub fn id(&self) -> Option<&str> {
        non_empty(&self.message_id).or_else(|| non_empty(&self.optimistic_id))
    }

    /// Whether `id` names this message by either identifier.
    pub fn matches_id(&self, id: &str) -> bool {
        non_empty(&self.message_id) == Some(id) || non_empty(&self.optimistic_id) == Some(id)
    }

    pub fn parsed_timestamp(&self) -> Option<DateTime<Utc>> {
        parse_timestamp(&self.timestamp)
    }

    /// Read an extra wire field as a string (`recipientId`, `projectId`, ...).
    pub fn extra_str(&self, field: &str) -> Option<&str> {
        self.extra.get(field).and_then(Value::as_str).filter(|s| !s.is_empty())
    }

    /// Add or remove `user_id` from the `emoji` reaction set.
    pub fn toggle_reaction(&mut self, emoji: &str, user_id: &str) {
        let reactions = self.reactions.get_or_insert_with(Reactions::new);
        let users = reactions.entry(emoji.to_owned()).or_default();
        if !users.remove(user_id) {
            users.insert(user_id.to_owned());
        }
        if users.is_empty() {
            reactions.remove(emoji);
        }
    }
}

/// Sidebar summary of one direct-message conversation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ThreadSummary {
    pub conversation_id: String,
    pub snippet: String,
    pub last_msg_ts: String,
    pub read: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub other_user_id: Option<String>,
}

/// A user notification.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Notification {
    #[serde(
        rename = "timestamp#uuid",
        default,
        skip_serializing_if = "Option::is_none"
    )]
    pub timestamp_uuid: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub dedupe_id: Option<String>,
    #[serde(default)]
    pub timestamp: String,
    #[serde(default, deserialize_with = "lenient_bool")]
    pub read: Option<bool>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl Notification {
    pub fn is_read(&self) -> bool {
        self.read.unwrap_or(false)
    }

    pub fn parsed_timestamp(&self) -> Option<DateTime<Utc>> {
        parse_timestamp(&self.timestamp)
    }
}

/// A project as loaded by the host application. Only the id is modelled;
/// everything else is an opaque field map patched by `projectUpdated`.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Project {
    pub project_id: String,
    #[serde(flatten)]
    pub fields: Map<String, Value>,
}

impl Project {
    pub const TIMELINE_FIELD: &'static str = "timelineEvents";

    pub fn new(project_id: impl Into<String>) -> Self {
        Self {
            project_id: project_id.into(),
            fields: Map::new(),
        }
    }

    /// Shallow merge: keys in `patch` overwrite existing keys. The project id
    /// itself is never rewritten.
    pub fn apply_fields(&mut self, patch: &Map<String, Value>) {
        for (key, value) in patch {
            if key == "projectId" {
                continue;
            }
            self.fields.insert(key.clone(), value.clone());
        }
    }

    pub fn set_timeline(&mut self, events: Vec<Value>) {
        self.fields
            .insert(Self::TIMELINE_FIELD.to_owned(), Value::Array(events));
    }

    pub fn timeline(&self) -> &[Value] {
        self.fields
            .get(Self::TIMELINE_FIELD)
            .and_then(Value::as_array)
            .map(Vec::as_slice)
            .unwrap_or(&[])
    }
}

/// Parse an ISO-8601 / RFC 3339 timestamp.
pub fn parse_timestamp(raw: &str) -> Option<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(raw)
        .ok()
        .map(|ts| ts.with_timezone(&Utc))
}

/// Current time in the wire format (`2024-05-01T12:00:00.000Z`).
pub fn now_iso() -> String {
    Utc::now().to_rfc3339_opts(SecondsFormat::Millis, true)
}

fn non_empty(id: &Option<String>) -> Option<&str> {
    id.as_deref().filter(|s| !s.is_empty())
}

/// Servers have been seen sending `read` as a bool, a `"true"`/`"false"`
/// string, or 0/1.
fn lenient_bool<'de, D>(deserializer: D) -> Result<Option<bool>, D::Error>
where
    D: Deserializer<'de>,
{
    let value = Option::<Value>::deserialize(deserializer)?;
    Ok(match value {
        Some(Value::Bool(b)) => Some(b),
        Some(Value::String(s)) => match s.as_str() {
            "true" => Some(true),
            "false" => Some(false),
            _ => None,
        },
        Some(Value::Number(n)) => n.as_i64().map(|n| n != 0),
        _ => None,
    })
}
