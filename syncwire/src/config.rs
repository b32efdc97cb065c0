//! Connection manager configuration.

use std::env;
use std::path::PathBuf;
use std::time::Duration;

use crate::lifecycle::ReconnectPolicy;

/// Settings for one sync session.
#[derive(Debug, Clone)]
pub struct SyncConfig {
    /// Socket endpoint, `ws://` or `wss://`.
    pub url: String,
    /// The signed-in user. Appended to presence lists the server sends
    /// without it, and used as sender id for outgoing messages.
    pub user_id: Option<String>,
    /// Where the session id is kept between runs. `None` regenerates it on
    /// every start.
    pub session_file: Option<PathBuf>,
    pub keepalive_interval: Duration,
    pub open_timeout: Duration,
    pub reconnect: ReconnectPolicy,
    /// Tries per send while the socket is not open, including the first.
    pub send_attempts: u32,
    pub send_retry_delay: Duration,
    pub collaborators_debounce: Duration,
    /// Capacity of the command channel into the dispatcher.
    pub command_capacity: usize,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            url: "ws://127.0.0.1:8080".to_string(),
            user_id: None,
            session_file: None,
            keepalive_interval: Duration::from_secs(30),
            open_timeout: Duration::from_secs(10),
            reconnect: ReconnectPolicy::default(),
            send_attempts: 3,
            send_retry_delay: Duration::from_secs(1),
            collaborators_debounce: Duration::from_secs(1),
            command_capacity: 256,
        }
    }
}

impl SyncConfig {
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            ..Self::default()
        }
    }

    /// Build from `SYNCWIRE_*` environment variables. Unset or unparsable
    /// values keep their defaults.
    pub fn from_env() -> Self {
        let mut config = Self::default();
        if let Ok(url) = env::var("SYNCWIRE_URL") {
            config.url = url;
        }
        config.user_id = env::var("SYNCWIRE_USER_ID").ok().filter(|u| !u.is_empty());
        config.session_file = env::var("SYNCWIRE_SESSION_FILE").ok().map(PathBuf::from);
        if let Some(secs) = env_parse::<u64>("SYNCWIRE_KEEPALIVE_SECS") {
            config.keepalive_interval = Duration::from_secs(secs);
        }
        if let Some(secs) = env_parse::<u64>("SYNCWIRE_OPEN_TIMEOUT_SECS") {
            config.open_timeout = Duration::from_secs(secs);
        }
        if let Some(attempts) = env_parse::<u32>("SYNCWIRE_MAX_RECONNECT_ATTEMPTS") {
            config.reconnect.max_attempts = attempts;
        }
        config
    }

    pub fn with_user_id(mut self, user_id: impl Into<String>) -> Self {
        self.user_id = Some(user_id.into());
        self
    }

    pub fn with_session_file(mut self, path: impl Into<PathBuf>) -> Self {
        self.session_file = Some(path.into());
        self
    }

    pub fn with_keepalive_interval(mut self, interval: Duration) -> Self {
        self.keepalive_interval = interval;
        self
    }

    pub fn with_open_timeout(mut self, timeout: Duration) -> Self {
        self.open_timeout = timeout;
        self
    }

    pub fn with_reconnect(mut self, policy: ReconnectPolicy) -> Self {
        self.reconnect = policy;
        self
    }

    pub fn with_send_retry(mut self, attempts: u32, delay: Duration) -> Self {
        self.send_attempts = attempts.max(1);
        self.send_retry_delay = delay;
        self
    }

    pub fn with_collaborators_debounce(mut self, debounce: Duration) -> Self {
        self.collaborators_debounce = debounce;
        self
    }
}

fn env_parse<T: std::str::FromStr>(key: &str) -> Option<T> {
    env::var(key).ok().and_then(|v| v.trim().parse().ok())
}
