//! Credential pair and the store that owns it.
//!
//! The connection manager only reads credentials through [`CredentialStore`]
//! and only changes them through [`CredentialStore::refresh`]. The default
//! [`CachedCredentialStore`] keeps an instance-scoped copy of the signed-in
//! user, optionally mirrored to a JSON file, and delegates the network side of
//! a refresh to a [`TokenRefresher`].

use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};

use crate::error::CredentialError;

/// The signed-in user with both tokens. Expiries are epoch milliseconds;
/// an expiry of 0 means "unknown" and never counts as expired.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CredentialPair {
    pub id: i64,
    #[serde(default)]
    pub username: String,
    pub jwt: String,
    pub expiry_epoch: i64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub refresh_token: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub refresh_token_expiry_epoch: Option<i64>,
    pub web_socket_token: String,
    pub web_socket_token_expiry_epoch: i64,
}

impl CredentialPair {
    pub fn access_expired_at(&self, now_ms: i64) -> bool {
        self.expiry_epoch > 0 && now_ms > self.expiry_epoch
    }

    pub fn socket_expired_at(&self, now_ms: i64) -> bool {
        self.web_socket_token_expiry_epoch > 0 && now_ms > self.web_socket_token_expiry_epoch
    }

    pub fn any_expired_at(&self, now_ms: i64) -> bool {
        self.access_expired_at(now_ms) || self.socket_expired_at(now_ms)
    }

    /// A socket handshake needs a socket token.
    pub fn can_connect(&self) -> bool {
        !self.web_socket_token.is_empty()
    }

    /// `send` needs both tokens.
    pub fn can_send(&self) -> bool {
        !self.jwt.is_empty() && !self.web_socket_token.is_empty()
    }
}

/// Read/replace/refresh access to the signed-in user's credentials.
#[async_trait]
pub trait CredentialStore: Send + Sync {
    /// Current credentials, or `None` when nobody is signed in.
    fn user(&self) -> Option<CredentialPair>;

    /// Replace (or clear, with `None`) the stored credentials.
    fn replace(&self, user: Option<CredentialPair>) -> Result<(), CredentialError>;

    /// Obtain fresh tokens for `user_id` and store them.
    async fn refresh(&self, user_id: i64) -> Result<CredentialPair, CredentialError>;
}

/// The network half of a refresh.
#[async_trait]
pub trait TokenRefresher: Send + Sync {
    async fn refresh(&self, current: &CredentialPair) -> Result<CredentialPair, CredentialError>;
}

/// Default location of the persisted user: `<config dir>/chai/user.json`.
pub fn default_path() -> PathBuf {
    dirs::config_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("chai")
        .join("user.json")
}

/// Credential store with an in-memory cache, optionally backed by a file.
pub struct CachedCredentialStore {
    path: Option<PathBuf>,
    cache: RwLock<Option<CredentialPair>>,
    refresher: Arc<dyn TokenRefresher>,
}

impl CachedCredentialStore {
    /// A store that never touches disk.
    pub fn in_memory(user: Option<CredentialPair>, refresher: Arc<dyn TokenRefresher>) -> Self {
        Self {
            path: None,
            cache: RwLock::new(user),
            refresher,
        }
    }

    /// Load the user from `path` (if the file exists) and write through on
    /// every replace.
    pub fn open(
        path: impl Into<PathBuf>,
        refresher: Arc<dyn TokenRefresher>,
    ) -> Result<Self, CredentialError> {
        let path = path.into();
        let user = if path.exists() {
            let raw = std::fs::read_to_string(&path)?;
            Some(serde_json::from_str(&raw)?)
        } else {
            None
        };
        tracing::debug!(
            path = %path.display(),
            signed_in = user.is_some(),
            "Loaded credential store"
        );
        Ok(Self {
            path: Some(path),
            cache: RwLock::new(user),
            refresher,
        })
    }

    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    fn persist(&self, user: Option<&CredentialPair>) -> Result<(), CredentialError> {
        let Some(path) = &self.path else {
            return Ok(());
        };
        match user {
            Some(user) => {
                if let Some(dir) = path.parent() {
                    std::fs::create_dir_all(dir)?;
                }
                std::fs::write(path, serde_json::to_string_pretty(user)?)?;
            }
            None => {
                if path.exists() {
                    std::fs::remove_file(path)?;
                }
            }
        }
        Ok(())
    }
}

#[async_trait]
impl CredentialStore for CachedCredentialStore {
    fn user(&self) -> Option<CredentialPair> {
        self.cache.read().clone()
    }

    fn replace(&self, user: Option<CredentialPair>) -> Result<(), CredentialError> {
        self.persist(user.as_ref())?;
        *self.cache.write() = user;
        Ok(())
    }

    async fn refresh(&self, user_id: i64) -> Result<CredentialPair, CredentialError> {
        let current = self.user().ok_or(CredentialError::NoUser)?;
        if current.id != user_id {
            return Err(CredentialError::UserMismatch {
                expected: user_id,
                found: current.id,
            });
        }
        let fresh = self.refresher.refresh(&current).await?;
        self.replace(Some(fresh.clone()))?;
        tracing::debug!(
            user_id,
            expiry = fresh.expiry_epoch,
            socket_expiry = fresh.web_socket_token_expiry_epoch,
            "Stored refreshed credentials"
        );
        Ok(fresh)
    }
}
