//! Credential renewal on abnormal socket closure.
//!
//! The server drops the socket with code 1006 when either token has lapsed.
//! The coordinator decides whether that close warrants a refresh and keeps
//! at most one refresh in flight. It never opens connections itself.

use crate::credentials::{CredentialPair, CredentialStore};
use crate::error::CredentialError;
use crate::machine::RetryCounter;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RenewalDecision {
    /// Start a refresh for this user.
    Renew { user_id: i64 },
    NotExpired,
    NoCredentials,
    AlreadyRenewing,
}

#[derive(Debug, Default)]
pub struct RenewalCoordinator {
    in_flight: bool,
}

impl RenewalCoordinator {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn in_flight(&self) -> bool {
        self.in_flight
    }

    /// Called for a 1006 close of the current socket.
    pub fn on_abnormal_close(
        &mut self,
        creds: Option<&CredentialPair>,
        now_ms: i64,
    ) -> RenewalDecision {
        if self.in_flight {
            return RenewalDecision::AlreadyRenewing;
        }
        let Some(creds) = creds else {
            return RenewalDecision::NoCredentials;
        };
        if !creds.any_expired_at(now_ms) {
            tracing::debug!(user_id = creds.id, "Tokens not expired, not refreshing");
            return RenewalDecision::NotExpired;
        }
        tracing::info!(
            user_id = creds.id,
            access_expired = creds.access_expired_at(now_ms),
            socket_expired = creds.socket_expired_at(now_ms),
            "Token expired, refreshing"
        );
        self.in_flight = true;
        RenewalDecision::Renew { user_id: creds.id }
    }

    /// Forget an in-flight refresh whose result no longer matters.
    pub fn abandon(&mut self) {
        self.in_flight = false;
    }

    /// Record the outcome of the refresh started by [`Self::on_abnormal_close`].
    /// A success resets the retry budget; a failure leaves it untouched.
    pub fn finish(
        &mut self,
        outcome: &Result<(), CredentialError>,
        retry: &mut RetryCounter,
    ) -> bool {
        self.in_flight = false;
        match outcome {
            Ok(()) => {
                retry.reset();
                tracing::info!("Credentials refreshed");
                true
            }
            Err(e) => {
                tracing::warn!(error = %e, "Failed to refresh credentials");
                false
            }
        }
    }
}

/// Run the refresh against the store. The store updates itself in place.
pub async fn renew(store: &dyn CredentialStore, user_id: i64) -> Result<(), CredentialError> {
    store.refresh(user_id).await.map(|_| ())
}
