//! Dedupe/merge engine for optimistic and authoritative records.
//!
//! A locally-sent message first exists only under its client-generated
//! `optimisticId`. When the server echoes it back, the echo carries both the
//! `optimisticId` and the server's `messageId`. Merging previous and incoming
//! records by dedupe key collapses the two into one entry, in the position
//! the optimistic copy already held:
//!
//! ```text
//!   prev:     [ {optimisticId: a} ]
//!   incoming: [ {optimisticId: a, messageId: m1} ]
//!   merged:   [ {optimisticId: a, messageId: m1} ]
//! ```
//!
//! An authoritative record never gets replaced, so replays are idempotent.

use std::cmp::Reverse;
use std::collections::HashMap;

use crate::model::{Message, Notification};

/// A record that can be collapsed with other copies of itself.
pub trait Dedupe {
    /// Merge key, or `None` for records that are carried through unmerged.
    fn dedupe_key(&self) -> Option<&str>;

    /// Whether this copy carries the server-assigned identity.
    fn is_authoritative(&self) -> bool;
}

impl Dedupe for Message {
    fn dedupe_key(&self) -> Option<&str> {
        non_empty(self.optimistic_id.as_deref()).or_else(|| non_empty(self.message_id.as_deref()))
    }

    fn is_authoritative(&self) -> bool {
        non_empty(self.message_id.as_deref()).is_some()
    }
}

impl Dedupe for Notification {
    fn dedupe_key(&self) -> Option<&str> {
        non_empty(self.dedupe_id.as_deref()).or_else(|| non_empty(self.timestamp_uuid.as_deref()))
    }

    fn is_authoritative(&self) -> bool {
        non_empty(self.timestamp_uuid.as_deref()).is_some()
    }
}

fn non_empty(s: Option<&str>) -> Option<&str> {
    s.filter(|s| !s.is_empty())
}

/// Collapse `items` by dedupe key.
///
/// Keyed records come out in first-seen order, followed by unkeyed records
/// in their original order. A stored record is replaced only when it is not
/// authoritative and the later one is.
pub fn dedupe<T, I>(items: I) -> Vec<T>
where
    T: Dedupe,
    I: IntoIterator<Item = T>,
{
    let mut keyed: Vec<T> = Vec::new();
    let mut index: HashMap<String, usize> = HashMap::new();
    let mut unkeyed: Vec<T> = Vec::new();

    for item in items {
        let Some(key) = item.dedupe_key().map(str::to_owned) else {
            unkeyed.push(item);
            continue;
        };
        match index.get(&key) {
            Some(&slot) => {
                if !keyed[slot].is_authoritative() && item.is_authoritative() {
                    keyed[slot] = item;
                }
            }
            None => {
                index.insert(key, keyed.len());
                keyed.push(item);
            }
        }
    }

    keyed.extend(unkeyed);
    keyed
}

/// Merge incoming messages into the previous list.
pub fn merge_messages<I>(prev: &[Message], incoming: I) -> Vec<Message>
where
    I: IntoIterator<Item = Message>,
{
    dedupe(prev.iter().cloned().chain(incoming))
}

/// Dedupe notifications and order them newest first. Records whose
/// timestamp does not parse sort after all dated ones, keeping their
/// relative order.
pub fn dedupe_notifications<I>(items: I) -> Vec<Notification>
where
    I: IntoIterator<Item = Notification>,
{
    let mut merged = dedupe(items);
    merged.sort_by_cached_key(|n| Reverse(n.parsed_timestamp()));
    merged
}

/// Merge incoming notifications into the previous list.
pub fn merge_notifications<I>(prev: &[Notification], incoming: I) -> Vec<Notification>
where
    I: IntoIterator<Item = Notification>,
{
    dedupe_notifications(prev.iter().cloned().chain(incoming))
}
