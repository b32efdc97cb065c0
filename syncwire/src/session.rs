//! Session identity and the host-side collaborators the sync layer calls out
//! to: the auth token provider and the refresh hooks.

use std::fmt;
use std::path::Path;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use uuid::Uuid;

use crate::error::Result;

/// Stable per-session identifier sent alongside the auth token.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct SessionId(String);

impl SessionId {
    pub fn generate() -> Self {
        Self(Uuid::new_v4().to_string())
    }

    pub fn from_string(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Read the id from `path`, or generate one and write it there. With no
    /// path the id lives only as long as the process.
    pub fn load_or_create(path: Option<&Path>) -> Result<Self> {
        let Some(path) = path else {
            return Ok(Self::generate());
        };

        match std::fs::read_to_string(path) {
            Ok(contents) if !contents.trim().is_empty() => {
                return Ok(Self(contents.trim().to_owned()));
            }
            Ok(_) => {}
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {}
            Err(err) => return Err(err.into()),
        }

        let id = Self::generate();
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::write(path, &id.0)?;
        log::info!("generated new session id {}", id.short());
        Ok(id)
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// First 8 characters, for logs.
    pub fn short(&self) -> &str {
        let end = self.0.char_indices().nth(8).map_or(self.0.len(), |(i, _)| i);
        &self.0[..end]
    }
}

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Credentials handed over by the host's auth layer.
#[derive(Clone, PartialEq, Eq)]
pub struct AuthTokens {
    pub id_token: String,
    pub expires_at: Option<DateTime<Utc>>,
}

impl AuthTokens {
    pub fn new(id_token: impl Into<String>) -> Self {
        Self {
            id_token: id_token.into(),
            expires_at: None,
        }
    }

    pub fn expiring_at(mut self, expires_at: DateTime<Utc>) -> Self {
        self.expires_at = Some(expires_at);
        self
    }

    pub fn is_valid_at(&self, now: DateTime<Utc>) -> bool {
        !self.id_token.is_empty() && self.expires_at.map_or(true, |exp| exp > now)
    }
}

impl fmt::Debug for AuthTokens {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AuthTokens")
            .field("id_token", &"<redacted>")
            .field("expires_at", &self.expires_at)
            .finish()
    }
}

/// Source of auth tokens. Returns `None` while the user is signed out.
#[async_trait]
pub trait TokenProvider: Send + Sync {
    async fn auth_tokens(&self) -> Option<AuthTokens>;
}

/// A provider that always hands out the same tokens.
#[derive(Debug, Clone)]
pub struct StaticTokenProvider(Option<AuthTokens>);

impl StaticTokenProvider {
    pub fn new(tokens: Option<AuthTokens>) -> Self {
        Self(tokens)
    }
}

#[async_trait]
impl TokenProvider for StaticTokenProvider {
    async fn auth_tokens(&self) -> Option<AuthTokens> {
        self.0.clone()
    }
}

/// Host callbacks for invalidations that need a REST round trip.
#[async_trait]
pub trait SyncHooks: Send + Sync {
    /// The collaborator roster changed. Called at most once per debounce
    /// window.
    async fn refresh_collaborators(&self) {}

    /// A gallery was created; the project list should be refetched.
    async fn refresh_projects(&self, _project_id: Option<&str>) {}
}

/// Hooks that do nothing.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoopHooks;

impl SyncHooks for NoopHooks {}
