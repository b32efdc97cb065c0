//! Keyed pub/sub cache for UI consumers.
//!
//! Each channel holds the latest value written to it and a set of listeners
//! that are told (without arguments) when that channel changes. Listeners on
//! other channels are never woken, so a presence update does not disturb a
//! message list.
//!
//! ```text
//!   update("presence:online", users) ──► values["presence:online"] = users
//!                                      └► listeners["presence:online"]: f1, f2
//! ```
//!
//! Values are stored type-erased (`Arc<dyn Any>`); readers ask for the type
//! they expect and fall back when the channel is empty or holds something
//! else.

use std::any::Any;
use std::collections::HashMap;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, RwLock, Weak};

/// Well-known channel keys published by the connection manager.
pub mod channels {
    /// `ConnectionState`
    pub const CONNECTION_STATE: &str = "connection:state";
    /// `ConnectionHealth`
    pub const CONNECTION_HEALTH: &str = "connection:health";
    /// `Vec<String>`
    pub const ONLINE_USERS: &str = "presence:online";
    /// `Vec<Message>`
    pub const DM_MESSAGES: &str = "messages:dm";
    /// `Vec<ThreadSummary>`
    pub const DM_THREADS: &str = "threads:dm";
    /// `Vec<Notification>`
    pub const NOTIFICATIONS: &str = "notifications";
    /// `Vec<serde_json::Value>`
    pub const PENDING_INVITES: &str = "invites:pending";
    /// `Vec<Project>`
    pub const PROJECTS: &str = "projects";
    /// `Option<Project>`
    pub const ACTIVE_PROJECT: &str = "projects:active";

    /// `Vec<Message>` for one project.
    pub fn project_messages(project_id: &str) -> String {
        format!("messages:project:{project_id}")
    }
}

type Value = Arc<dyn Any + Send + Sync>;
type Listener = Arc<dyn Fn() + Send + Sync>;

/// Counters for monitoring fan-out.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ChannelStats {
    pub updates: u64,
    pub notifications: u64,
    pub listener_panics: u64,
}

struct Inner {
    values: RwLock<HashMap<String, Value>>,
    listeners: Mutex<HashMap<String, Vec<(u64, Listener)>>>,
    next_listener: AtomicU64,
    updates: AtomicU64,
    notifications: AtomicU64,
    listener_panics: AtomicU64,
}

/// Per-session channel registry. Cloning shares the registry.
#[derive(Clone)]
pub struct ChannelStore {
    inner: Arc<Inner>,
}

impl Default for ChannelStore {
    fn default() -> Self {
        Self::new()
    }
}

impl ChannelStore {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(Inner {
                values: RwLock::new(HashMap::new()),
                listeners: Mutex::new(HashMap::new()),
                next_listener: AtomicU64::new(0),
                updates: AtomicU64::new(0),
                notifications: AtomicU64::new(0),
                listener_panics: AtomicU64::new(0),
            }),
        }
    }

    /// Latest value of `key`, or `fallback` if the channel is empty or holds
    /// a different type.
    pub fn get<T>(&self, key: &str, fallback: T) -> T
    where
        T: Clone + Send + Sync + 'static,
    {
        match self.get_arc::<T>(key) {
            Some(value) => (*value).clone(),
            None => fallback,
        }
    }

    /// Shared handle to the latest value without cloning it.
    pub fn get_arc<T>(&self, key: &str) -> Option<Arc<T>>
    where
        T: Send + Sync + 'static,
    {
        let value = self.values().get(key).cloned()?;
        match value.downcast::<T>() {
            Ok(typed) => Some(typed),
            Err(_) => {
                log::debug!("channel '{key}' holds a different type than requested");
                None
            }
        }
    }

    pub fn contains(&self, key: &str) -> bool {
        self.values().contains_key(key)
    }

    /// Replace the value of `key` and notify its listeners.
    pub fn update<T>(&self, key: &str, value: T)
    where
        T: Send + Sync + 'static,
    {
        self.update_arc(key, Arc::new(value));
    }

    /// Like [`update`](Self::update) for values already behind an `Arc`, so
    /// copy-on-write state can be published without a deep clone.
    pub fn update_arc<T>(&self, key: &str, value: Arc<T>)
    where
        T: Send + Sync + 'static,
    {
        {
            let mut values = self.inner.values.write().unwrap_or_else(PoisonError::into_inner);
            values.insert(key.to_owned(), value);
        }
        self.inner.updates.fetch_add(1, Ordering::Relaxed);
        self.notify(key);
    }

    /// Register `listener` for changes to `key`.
    pub fn subscribe<F>(&self, key: &str, listener: F) -> Subscription
    where
        F: Fn() + Send + Sync + 'static,
    {
        let id = self.inner.next_listener.fetch_add(1, Ordering::Relaxed);
        self.listeners()
            .entry(key.to_owned())
            .or_default()
            .push((id, Arc::new(listener)));

        Subscription {
            store: Arc::downgrade(&self.inner),
            key: key.to_owned(),
            id,
        }
    }

    /// Call every listener of `key`. Listeners run outside the registry lock,
    /// so they may read or write the store themselves. A panicking listener
    /// is logged and does not stop the others.
    pub fn notify(&self, key: &str) {
        let snapshot: Vec<Listener> = match self.listeners().get(key) {
            Some(set) => set.iter().map(|(_, l)| Arc::clone(l)).collect(),
            None => return,
        };

        for listener in snapshot {
            self.inner.notifications.fetch_add(1, Ordering::Relaxed);
            if panic::catch_unwind(AssertUnwindSafe(|| listener())).is_err() {
                self.inner.listener_panics.fetch_add(1, Ordering::Relaxed);
                log::error!("listener on channel '{key}' panicked");
            }
        }
    }

    pub fn listener_count(&self, key: &str) -> usize {
        self.listeners().get(key).map_or(0, Vec::len)
    }

    /// Number of keys that currently have at least one listener.
    pub fn subscribed_channels(&self) -> usize {
        self.listeners().len()
    }

    pub fn stats(&self) -> ChannelStats {
        ChannelStats {
            updates: self.inner.updates.load(Ordering::Relaxed),
            notifications: self.inner.notifications.load(Ordering::Relaxed),
            listener_panics: self.inner.listener_panics.load(Ordering::Relaxed),
        }
    }

    /// Drop every value and listener. Called when the session ends.
    pub fn clear(&self) {
        self.inner
            .values
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .clear();
        self.listeners().clear();
    }

    fn values(&self) -> std::sync::RwLockReadGuard<'_, HashMap<String, Value>> {
        self.inner.values.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn listeners(&self) -> MutexGuard<'_, HashMap<String, Vec<(u64, Listener)>>> {
        lock_listeners(&self.inner)
    }
}

fn lock_listeners(inner: &Inner) -> MutexGuard<'_, HashMap<String, Vec<(u64, Listener)>>> {
    inner.listeners.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Handle returned by [`ChannelStore::subscribe`].
///
/// Dropping the handle leaves the listener registered; call
/// [`unsubscribe`](Self::unsubscribe) to remove it.
#[must_use = "keep the subscription to be able to unsubscribe"]
pub struct Subscription {
    store: Weak<Inner>,
    key: String,
    id: u64,
}

impl Subscription {
    pub fn key(&self) -> &str {
        &self.key
    }

    pub fn unsubscribe(self) {
        let Some(inner) = self.store.upgrade() else {
            return;
        };
        let mut listeners = lock_listeners(&inner);
        if let Some(set) = listeners.get_mut(&self.key) {
            set.retain(|(id, _)| *id != self.id);
            if set.is_empty() {
                listeners.remove(&self.key);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    fn counter() -> (Arc<AtomicUsize>, impl Fn() + Send + Sync + 'static) {
        let count = Arc::new(AtomicUsize::new(0));
        let c = Arc::clone(&count);
        (count, move || {
            c.fetch_add(1, Ordering::SeqCst);
        })
    }

    #[test]
    fn test_get_returns_fallback_when_empty() {
        let store = ChannelStore::new();
        assert_eq!(store.get("missing", 7u32), 7);
        store.update("n", 3u32);
        assert_eq!(store.get("n", 7u32), 3);
    }

    #[test]
    fn test_get_with_wrong_type_falls_back() {
        let store = ChannelStore::new();
        store.update("n", 3u32);
        assert_eq!(store.get("n", String::from("none")), "none");
        assert!(store.contains("n"));
    }

    #[test]
    fn test_channel_isolation() {
        let store = ChannelStore::new();
        let (a_count, a) = counter();
        let (b_count, b) = counter();
        let _sa = store.subscribe("a", a);
        let _sb = store.subscribe("b", b);

        store.update("a", 1u8);
        store.update("a", 2u8);

        assert_eq!(a_count.load(Ordering::SeqCst), 2);
        assert_eq!(b_count.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn test_unsubscribe_removes_empty_set() {
        let store = ChannelStore::new();
        let (count, listener) = counter();
        let sub = store.subscribe("k", listener);
        assert_eq!(store.listener_count("k"), 1);
        assert_eq!(store.subscribed_channels(), 1);

        sub.unsubscribe();
        store.notify("k");

        assert_eq!(count.load(Ordering::SeqCst), 0);
        assert_eq!(store.listener_count("k"), 0);
        assert_eq!(store.subscribed_channels(), 0);
    }

    #[test]
    fn test_dropped_subscription_stays_registered() {
        let store = ChannelStore::new();
        let (count, listener) = counter();
        drop(store.subscribe("k", listener));
        store.notify("k");
        assert_eq!(count.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_panicking_listener_is_isolated() {
        let store = ChannelStore::new();
        let (count, listener) = counter();
        let _bad = store.subscribe("k", || panic!("listener bug"));
        let _good = store.subscribe("k", listener);

        store.update("k", ());

        assert_eq!(count.load(Ordering::SeqCst), 1);
        assert_eq!(store.stats().listener_panics, 1);
    }

    #[test]
    fn test_listener_can_read_store() {
        let store = ChannelStore::new();
        let seen = Arc::new(AtomicUsize::new(0));
        let reader = store.clone();
        let s = Arc::clone(&seen);
        let _sub = store.subscribe("n", move || {
            s.store(reader.get("n", 0usize), Ordering::SeqCst);
        });

        store.update("n", 42usize);
        assert_eq!(seen.load(Ordering::SeqCst), 42);
    }

    #[test]
    fn test_update_arc_shares_value() {
        let store = ChannelStore::new();
        let list = Arc::new(vec![1, 2, 3]);
        store.update_arc("list", Arc::clone(&list));
        let got = store.get_arc::<Vec<i32>>("list").unwrap();
        assert!(Arc::ptr_eq(&got, &list));
    }

    #[test]
    fn test_clear_drops_everything() {
        let store = ChannelStore::new();
        let (_count, listener) = counter();
        let _sub = store.subscribe("k", listener);
        store.update("k", 1u8);

        store.clear();

        assert!(!store.contains("k"));
        assert_eq!(store.subscribed_channels(), 0);
    }

    #[test]
    fn test_project_channel_key() {
        assert_eq!(channels::project_messages("p1"), "messages:project:p1");
    }
}
