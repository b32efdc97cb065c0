//! Heartbeat bookkeeping for the sync socket.
//!
//! The connection manager reports connects, disconnects, pings sent, and
//! pongs received; the monitor turns those into [`ConnectionHealth`]
//! snapshots and pushes one to its callback after each event.

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::time::Instant;

/// Point-in-time view of connection health.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ConnectionHealth {
    pub is_connected: bool,
    pub last_ping: Option<DateTime<Utc>>,
    pub last_pong: Option<DateTime<Utc>>,
    pub consecutive_failures: u32,
    /// Milliseconds since the current connection opened; 0 while disconnected.
    pub connection_duration: u64,
}

pub type HealthCallback = Box<dyn Fn(&ConnectionHealth) + Send + Sync>;

#[derive(Default)]
pub struct HealthMonitor {
    connected_at: Option<Instant>,
    last_ping: Option<DateTime<Utc>>,
    last_pong: Option<DateTime<Utc>>,
    consecutive_failures: u32,
    callback: Option<HealthCallback>,
}

impl HealthMonitor {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_callback<F>(callback: F) -> Self
    where
        F: Fn(&ConnectionHealth) + Send + Sync + 'static,
    {
        Self {
            callback: Some(Box::new(callback)),
            ..Self::default()
        }
    }

    pub fn set_callback<F>(&mut self, callback: F)
    where
        F: Fn(&ConnectionHealth) + Send + Sync + 'static,
    {
        self.callback = Some(Box::new(callback));
    }

    pub fn record_connect(&mut self) {
        self.connected_at = Some(Instant::now());
        self.emit();
    }

    pub fn record_disconnect(&mut self) {
        self.connected_at = None;
        self.consecutive_failures = self.consecutive_failures.saturating_add(1);
        self.emit();
    }

    pub fn record_ping(&mut self) {
        self.last_ping = Some(Utc::now());
        self.emit();
    }

    pub fn record_pong(&mut self) {
        self.last_pong = Some(Utc::now());
        self.consecutive_failures = 0;
        self.emit();
    }

    pub fn is_connected(&self) -> bool {
        self.connected_at.is_some()
    }

    pub fn snapshot(&self) -> ConnectionHealth {
        let connection_duration = self
            .connected_at
            .map(|since| u64::try_from(since.elapsed().as_millis()).unwrap_or(u64::MAX))
            .unwrap_or(0);
        ConnectionHealth {
            is_connected: self.connected_at.is_some(),
            last_ping: self.last_ping,
            last_pong: self.last_pong,
            consecutive_failures: self.consecutive_failures,
            connection_duration,
        }
    }

    fn emit(&self) {
        if let Some(callback) = &self.callback {
            callback(&self.snapshot());
        }
    }
}
