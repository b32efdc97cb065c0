//! syncwire-monitor: connect to a sync endpoint and log what arrives.
//!
//! ```text
//! SYNCWIRE_URL=wss://sync.example/ws SYNCWIRE_USER_ID=me SYNCWIRE_TOKEN=... \
//!     RUST_LOG=info syncwire-monitor
//! ```
//!
//! With `SYNCWIRE_AUTO_READ=1`, unread DM threads are marked read through a
//! write coalescer, one `markRead` per thread per window.

use std::env;
use std::sync::Arc;

use async_trait::async_trait;
use serde_json::json;
use syncwire::{
    channels, AuthTokens, ChannelStore, CoalescerConfig, ConnectionManager, ConnectionState,
    ConversationType, StaticTokenProvider, SyncConfig, SyncHooks, WriteCoalescer,
};
use tokio::sync::mpsc;

struct LoggingHooks;

#[async_trait]
impl SyncHooks for LoggingHooks {
    async fn refresh_collaborators(&self) {
        log::info!("collaborator roster changed");
    }

    async fn refresh_projects(&self, project_id: Option<&str>) {
        log::info!("gallery created, project list stale ({project_id:?})");
    }
}

const WATCHED: [&str; 6] = [
    channels::CONNECTION_STATE,
    channels::CONNECTION_HEALTH,
    channels::ONLINE_USERS,
    channels::DM_THREADS,
    channels::NOTIFICATIONS,
    channels::PENDING_INVITES,
];

#[tokio::main]
async fn main() {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let config = SyncConfig::from_env();
    let token = env::var("SYNCWIRE_TOKEN").ok().filter(|t| !t.is_empty());
    if token.is_none() {
        log::warn!("SYNCWIRE_TOKEN not set; connect will keep retrying");
    }
    let auto_read = env::var("SYNCWIRE_AUTO_READ").is_ok_and(|v| v == "1");

    let store = ChannelStore::new();
    let (changed_tx, mut changed_rx) = mpsc::unbounded_channel::<&'static str>();
    let subscriptions: Vec<_> = WATCHED
        .iter()
        .map(|&key| {
            let tx = changed_tx.clone();
            store.subscribe(key, move || {
                let _ = tx.send(key);
            })
        })
        .collect();

    let tokens = Arc::new(StaticTokenProvider::new(token.map(AuthTokens::new)));
    let mgr = match ConnectionManager::start(config, tokens, Arc::new(LoggingHooks), store) {
        Ok(mgr) => mgr,
        Err(e) => {
            log::error!("failed to start session: {e}");
            std::process::exit(1);
        }
    };
    if let Err(e) = mgr.connect().await {
        log::error!("connect failed: {e}");
    }

    let coalescer = WriteCoalescer::new(CoalescerConfig::default());

    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                log::info!("interrupted, shutting down");
                break;
            }
            Some(key) = changed_rx.recv() => {
                report(&mgr, key);
                if auto_read && key == channels::DM_THREADS {
                    mark_unread_threads(&mgr, &coalescer);
                }
            }
        }
    }

    coalescer.flush().await;
    mgr.shutdown().await;
    for sub in subscriptions {
        sub.unsubscribe();
    }
}

fn report(mgr: &ConnectionManager, key: &str) {
    let store = mgr.store();
    match key {
        channels::CONNECTION_STATE => {
            let state = store.get(key, ConnectionState::Disconnected);
            log::info!("state: {}", state.label());
        }
        channels::CONNECTION_HEALTH => {
            let health = mgr.connection_health();
            log::debug!(
                "health: connected={} failures={} up={}ms",
                health.is_connected,
                health.consecutive_failures,
                health.connection_duration
            );
        }
        channels::ONLINE_USERS => log::info!("online: {}", mgr.online_users().join(", ")),
        channels::DM_THREADS => {
            for thread in mgr.dm_threads().iter().filter(|t| !t.read) {
                log::info!("unread {}: {}", thread.conversation_id, thread.snippet);
            }
        }
        channels::NOTIFICATIONS => {
            let unread = mgr.notifications().iter().filter(|n| !n.is_read()).count();
            log::info!("notifications: {unread} unread");
        }
        channels::PENDING_INVITES => {
            log::info!("pending invites: {}", mgr.pending_invites().len());
        }
        _ => {}
    }
}

fn mark_unread_threads(mgr: &ConnectionManager, coalescer: &WriteCoalescer) {
    for thread in mgr.dm_threads().into_iter().filter(|t| !t.read) {
        let handle = mgr.clone();
        let update = coalescer.enqueue(
            move |conversation_id: String, _payload: serde_json::Value| {
                let handle = handle.clone();
                async move { handle.mark_read(ConversationType::Dm, &conversation_id).await }
            },
            thread.conversation_id,
            json!({ "lastMsgTs": thread.last_msg_ts }),
        );
        tokio::spawn(update);
    }
}
