//! Socket lifecycle state machine.
//!
//! ```text
//!                 Dial                Opened
//!  Disconnected ───────► Connecting ─────────► Open
//!       ▲                 │   ▲                 │
//!       │   DialFailed /  │   │ RetryDue        │ Closed(Abnormal)
//!       │   Closed(Abn.)  ▼   │                 ▼
//!       └──(exhausted)── Reconnecting{attempt, delay} ◄──┘
//!
//!  Closed(Clean) or Shutdown from anywhere ─► Disconnected
//! ```
//!
//! Transitions are pure; the connection runtime owns the timers and the
//! socket and feeds events in.

use std::time::Duration;

/// Connection state published to the UI.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ConnectionState {
    #[default]
    Disconnected,
    Connecting,
    Open,
    Reconnecting { attempt: u32, delay: Duration },
}

impl ConnectionState {
    pub fn is_open(&self) -> bool {
        matches!(self, Self::Open)
    }

    pub fn label(&self) -> &'static str {
        match self {
            Self::Disconnected => "disconnected",
            Self::Connecting => "connecting",
            Self::Open => "open",
            Self::Reconnecting { .. } => "reconnecting",
        }
    }
}

/// How a socket ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CloseKind {
    Clean,
    Abnormal,
}

impl CloseKind {
    /// 1000 (normal) and 1001 (going away) are clean; anything else,
    /// including no close frame at all, is abnormal.
    pub fn from_code(code: Option<u16>) -> Self {
        match code {
            Some(1000) | Some(1001) => Self::Clean,
            _ => Self::Abnormal,
        }
    }
}

/// Exponential backoff schedule.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReconnectPolicy {
    pub base_delay: Duration,
    pub max_delay: Duration,
    pub max_attempts: u32,
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        Self {
            base_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(30),
            max_attempts: 10,
        }
    }
}

impl ReconnectPolicy {
    /// Delay before retry number `attempt` (1-based): `base * 2^(attempt-1)`,
    /// capped at `max_delay`.
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(31);
        self.base_delay
            .saturating_mul(1u32 << exponent)
            .min(self.max_delay)
    }
}

/// Inputs to the state machine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LifecycleEvent {
    /// Caller asked for a connection.
    Dial,
    /// The backoff delay elapsed.
    RetryDue,
    Opened,
    Closed(CloseKind),
    /// Token missing, handshake failed, or the open timed out.
    DialFailed,
    /// A failure that retrying cannot fix (malformed URL).
    Fatal,
    Shutdown,
}

/// Current state plus the failure streak that drives the backoff.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Lifecycle {
    state: ConnectionState,
    attempts: u32,
}

impl Lifecycle {
    pub fn state(&self) -> ConnectionState {
        self.state
    }

    /// Consecutive failed attempts since the last successful open.
    pub fn attempts(&self) -> u32 {
        self.attempts
    }

    /// Delay of the pending retry, if one is scheduled.
    pub fn retry_delay(&self) -> Option<Duration> {
        match self.state {
            ConnectionState::Reconnecting { delay, .. } => Some(delay),
            _ => None,
        }
    }

    pub fn step(self, event: LifecycleEvent, policy: &ReconnectPolicy) -> Self {
        use ConnectionState::*;
        use LifecycleEvent::*;

        match (self.state, event) {
            (_, Shutdown) | (_, Fatal) => Self::default(),

            // A caller-initiated dial after giving up starts a fresh streak.
            (Disconnected, Dial) => Self {
                state: Connecting,
                attempts: 0,
            },
            (Reconnecting { .. }, Dial) | (Reconnecting { .. }, RetryDue) => Self {
                state: Connecting,
                ..self
            },
            (Connecting | Open, Dial) | (_, RetryDue) => self,

            (Connecting, Opened) => Self {
                state: Open,
                attempts: 0,
            },
            (_, Opened) => self,

            (Connecting | Open, Closed(CloseKind::Clean)) => Self::default(),
            (Connecting | Open, Closed(CloseKind::Abnormal)) | (Connecting, DialFailed) => {
                self.schedule_retry(policy)
            }
            (_, Closed(_)) | (_, DialFailed) => self,
        }
    }

    fn schedule_retry(self, policy: &ReconnectPolicy) -> Self {
        let attempt = self.attempts.saturating_add(1);
        if attempt > policy.max_attempts {
            return Self {
                state: ConnectionState::Disconnected,
                attempts: self.attempts,
            };
        }
        Self {
            state: ConnectionState::Reconnecting {
                attempt,
                delay: policy.delay_for(attempt),
            },
            attempts: attempt,
        }
    }
}
