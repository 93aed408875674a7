//! Side effects of transport failure kinds.

use std::sync::Arc;

use metrics::counter;
use tokio::sync::watch;
use tracing::{info, warn};
use uuid::Uuid;

use super::error::{ErrorKind, SyncError, TransportError};
use super::key::ResourceKey;
use super::store::CacheStore;

const METRIC_AUTH_EXPIRED: &str = "almanac_sync_auth_expired_total";

/// Session signal published upward; the core never tears a session down.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Active,
    ReauthRequired,
}

/// What a failure caused besides its error value.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Reaction {
    None,
    /// Every key was invalidated and re-authentication was requested.
    SessionExpired { invalidated: usize },
    /// The affected keys were invalidated as stale.
    Invalidated { invalidated: usize },
}

pub struct FailureReactor {
    store: Arc<CacheStore>,
    session: watch::Sender<SessionState>,
}

impl FailureReactor {
    pub fn new(store: Arc<CacheStore>) -> Self {
        let (session, _) = watch::channel(SessionState::Active);
        Self { store, session }
    }

    /// Receiver that observes [`SessionState`] changes.
    pub fn session(&self) -> watch::Receiver<SessionState> {
        self.session.subscribe()
    }

    pub fn session_state(&self) -> SessionState {
        *self.session.borrow()
    }

    /// Called by the embedding application after a successful sign-in.
    pub fn mark_active(&self) {
        self.session.send_replace(SessionState::Active);
    }

    /// Apply the side effects of `error` for the given keys.
    pub fn react(&self, error: &TransportError, affected: &[ResourceKey]) -> Reaction {
        match error.kind {
            ErrorKind::Unauthorized => {
                let invalidated = self.store.invalidate_all();
                let previous = self.session.send_replace(SessionState::ReauthRequired);
                counter!(METRIC_AUTH_EXPIRED).increment(1);
                if previous == SessionState::Active {
                    warn!(
                        invalidated,
                        message = %error.message,
                        "Session rejected by the API; re-authentication required"
                    );
                }
                Reaction::SessionExpired { invalidated }
            }
            ErrorKind::NotFound => {
                let invalidated = affected
                    .iter()
                    .map(|key| self.store.invalidate(key))
                    .sum();
                info!(
                    keys = affected.len(),
                    invalidated,
                    "Record missing on the server; cached copies marked stale"
                );
                Reaction::Invalidated { invalidated }
            }
            ErrorKind::Network | ErrorKind::Validation | ErrorKind::Server => Reaction::None,
        }
    }

    /// Map a fetch failure into the error stored on the entry.
    pub fn fetch_error(&self, key: &ResourceKey, error: TransportError) -> SyncError {
        match error.kind {
            ErrorKind::Unauthorized => SyncError::AuthExpired {
                message: error.message,
            },
            _ => SyncError::FetchFailed {
                key: key.serialize().to_string(),
                source: error,
            },
        }
    }

    /// Map a mutation failure into the error returned to the caller.
    pub fn mutation_error(
        &self,
        mutation: Uuid,
        resource: &'static str,
        error: TransportError,
    ) -> SyncError {
        match error.kind {
            ErrorKind::Unauthorized => SyncError::AuthExpired {
                message: error.message,
            },
            _ => SyncError::MutationFailed {
                mutation,
                resource,
                source: error,
            },
        }
    }
}
