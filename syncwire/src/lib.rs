//! # syncwire: client-side real-time sync layer
//!
//! Keeps one authenticated WebSocket per session alive, turns the JSON
//! envelopes it carries into client state, and publishes that state on
//! keyed channels for the UI.
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────────────┐   Command    ┌──────────────────┐   JSON frames   ┌────────┐
//! │ ConnectionManager│ ───────────► │ Dispatcher task  │ ◄─────────────► │ server │
//! │ (cloneable)      │              │ (select! loop)   │   WebSocket     └────────┘
//! └────────▲─────────┘              └───────┬──────────┘
//!          │                                │ Lifecycle / HealthMonitor
//!          │ get / subscribe                ▼ SyncState (dedupe + merge)
//!          │                        ┌──────────────────┐
//!          └────────────────────────│  ChannelStore    │
//!                                   │  (keyed pub/sub) │
//!                                   └──────────────────┘
//! ```
//!
//! ## Modules
//!
//! - [`connection`]: session handle, dispatcher, socket tasks
//! - [`lifecycle`]: connection state machine and reconnect backoff
//! - [`envelope`]: wire codec and envelope normalization
//! - [`dedupe`]: optimistic/authoritative merge of messages and notifications
//! - [`state`]: client state updated from inbound envelopes
//! - [`channel_store`]: keyed pub/sub cache the UI reads from
//! - [`coalesce`]: per-resource write coalescing for REST updates
//! - [`health`]: heartbeat and connection-duration tracking
//! - [`session`]: session id, auth tokens, host hooks

pub mod channel_store;
pub mod coalesce;
pub mod config;
pub mod connection;
pub mod dedupe;
pub mod envelope;
pub mod error;
pub mod health;
pub mod lifecycle;
pub mod model;
pub mod session;
pub mod state;

// Re-exports for convenience
pub use channel_store::{channels, ChannelStats, ChannelStore, Subscription};
pub use coalesce::{CoalescerConfig, WriteCoalescer};
pub use config::SyncConfig;
pub use connection::{ConnectionManager, MessageDraft};
pub use dedupe::{dedupe_notifications, merge_messages, merge_notifications, Dedupe};
pub use envelope::{normalize_envelope, Inbound, Outbound};
pub use error::{Result, SyncError};
pub use health::{ConnectionHealth, HealthMonitor};
pub use lifecycle::{CloseKind, ConnectionState, Lifecycle, LifecycleEvent, ReconnectPolicy};
pub use model::{ConversationType, Message, Notification, Project, Reactions, ThreadSummary};
pub use session::{AuthTokens, NoopHooks, SessionId, StaticTokenProvider, SyncHooks, TokenProvider};
pub use state::DeletedIds;
