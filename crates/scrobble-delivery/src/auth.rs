//! OAuth authorization flow state and completion.
//!
//! An authorization starts by issuing an opaque state token that travels
//! through the upstream consent page and comes back with the authorization
//! code. The token is single-use and expires after fifteen minutes whether
//! or not it was consumed.

use std::{collections::HashMap, sync::Arc, time::Duration};

use chrono::{DateTime, Utc};
use scrobble_core::{normalize_username, Clock, Store, User, UserId};
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;
use tracing::{debug, info, info_span, warn, Instrument};
use uuid::Uuid;

use crate::{
    client::TrackerApi,
    error::{DeliveryError, Result},
    lock::MultipleLock,
};

/// Lifetime of an issued state token.
pub const AUTH_STATE_TTL: Duration = Duration::from_secs(15 * 60);

/// Whether an authorization creates a user or renews an existing one.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AuthMode {
    /// First authorization; always creates a new user.
    First,
    /// Re-authorization of an existing user.
    Renew,
}

/// Pending authorization.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AuthState {
    /// Create or renew
    pub mode: AuthMode,
    /// Normalized target username
    pub username: String,
    /// User picked for renewal, if any
    pub selected_user: Option<UserId>,
    /// Correlation id for logs
    pub correlation_id: Uuid,
    /// Issue time
    pub created_at: DateTime<Utc>,
}

impl AuthState {
    fn is_expired(&self, now: DateTime<Utc>, ttl: Duration) -> bool {
        match chrono::Duration::from_std(ttl) {
            Ok(ttl) => now.signed_duration_since(self.created_at) >= ttl,
            Err(_) => false,
        }
    }
}

/// In-memory registry of pending authorizations.
#[derive(Debug)]
pub struct AuthStateRegistry {
    states: Mutex<HashMap<String, AuthState>>,
    clock: Arc<dyn Clock>,
    ttl: Duration,
}

impl AuthStateRegistry {
    /// Creates an empty registry with the standard lifetime.
    pub fn new(clock: Arc<dyn Clock>) -> Self {
        Self { states: Mutex::new(HashMap::new()), clock, ttl: AUTH_STATE_TTL }
    }

    /// Overrides the state lifetime.
    #[must_use]
    pub fn with_ttl(mut self, ttl: Duration) -> Self {
        self.ttl = ttl;
        self
    }

    /// Registers a pending authorization and returns its state token.
    pub async fn issue(
        &self,
        mode: AuthMode,
        username: &str,
        selected_user: Option<UserId>,
    ) -> String {
        let token = Uuid::new_v4().simple().to_string();
        let state = AuthState {
            mode,
            username: normalize_username(username),
            selected_user,
            correlation_id: Uuid::new_v4(),
            created_at: self.clock.now_utc(),
        };

        debug!(correlation_id = %state.correlation_id, mode = ?mode, "issued authorization state");
        self.states.lock().await.insert(token.clone(), state);
        token
    }

    /// Removes and returns the state for `token`.
    ///
    /// Returns `None` for unknown, already consumed, or expired tokens.
    pub async fn consume(&self, token: &str) -> Option<AuthState> {
        let state = self.states.lock().await.remove(token)?;
        if state.is_expired(self.clock.now_utc(), self.ttl) {
            debug!(correlation_id = %state.correlation_id, "authorization state expired");
            return None;
        }
        Some(state)
    }

    /// Drops expired states and returns how many were removed.
    pub async fn sweep_expired(&self) -> usize {
        let now = self.clock.now_utc();
        let mut states = self.states.lock().await;
        let before = states.len();
        states.retain(|_, state| !state.is_expired(now, self.ttl));
        before - states.len()
    }

    /// Number of pending states, expired ones included until swept.
    pub async fn len(&self) -> usize {
        self.states.lock().await.len()
    }

    /// Returns true when no states are pending.
    pub async fn is_empty(&self) -> bool {
        self.states.lock().await.is_empty()
    }
}

/// Completes authorizations by exchanging codes and persisting users.
#[derive(Clone)]
pub struct Authorizer {
    store: Arc<dyn Store>,
    api: Arc<dyn TrackerApi>,
    locks: Arc<MultipleLock>,
    states: Arc<AuthStateRegistry>,
    clock: Arc<dyn Clock>,
}

impl Authorizer {
    /// Creates an authorizer sharing the relay's lock registry.
    pub fn new(
        store: Arc<dyn Store>,
        api: Arc<dyn TrackerApi>,
        locks: Arc<MultipleLock>,
        states: Arc<AuthStateRegistry>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self { store, api, locks, states, clock }
    }

    /// State registry used by this authorizer.
    pub fn states(&self) -> &Arc<AuthStateRegistry> {
        &self.states
    }

    /// Starts an authorization and returns the state token.
    pub async fn begin(&self, mode: AuthMode, username: &str, selected_user: Option<UserId>) -> String {
        self.states.issue(mode, username, selected_user).await
    }

    /// Finishes the authorization identified by `state_token`.
    ///
    /// # Errors
    ///
    /// Returns `InvalidAuthState` when the token is unknown, consumed, or
    /// expired, the upstream failure when the code exchange fails, and
    /// `Storage` when the user cannot be written.
    pub async fn complete(&self, state_token: &str, code: &str) -> Result<User> {
        let Some(state) = self.states.consume(state_token).await else {
            return Err(DeliveryError::invalid_auth_state("unknown or expired state token"));
        };

        let span = info_span!(
            "authorize",
            correlation_id = %state.correlation_id,
            mode = ?state.mode,
            username = %state.username
        );
        self.complete_state(state, code).instrument(span).await
    }

    async fn complete_state(&self, state: AuthState, code: &str) -> Result<User> {
        let grant = self.api.exchange_code(code).await?;
        let now = self.clock.now_utc();

        let display_name = match self.api.display_name(&grant.access_token).await {
            Ok(name) => name,
            Err(e) => {
                warn!(error = %e, "display name lookup failed, continuing without it");
                None
            },
        };

        let target = match state.mode {
            AuthMode::First => None,
            AuthMode::Renew => self.find_renewal_target(&state).await?,
        };

        let (mut user, _guard) = match target {
            Some(target) => {
                let guard = self.locks.lock(&MultipleLock::lock_key(&target.username, &target.id)).await;
                // Re-read under the lock so concurrent edits survive the renewal.
                let mut user = self.store.get_user(&target.id).await?.unwrap_or(target);
                user.rotate_tokens(grant.access_token, grant.refresh_token, now);
                (user, guard)
            },
            None => {
                let user = User::new(&state.username, grant.access_token, grant.refresh_token, now);
                let guard = self.locks.lock(&MultipleLock::lock_key(&user.username, &user.id)).await;
                (user, guard)
            },
        };
        if let Some(name) = display_name.as_deref() {
            user.set_display_name(name);
        }

        self.store.write_user(&user).await?;

        info!(
            user_id = %user.id,
            truncated_display_name = user.display_name_truncated,
            "authorization completed"
        );
        Ok(user)
    }

    async fn find_renewal_target(&self, state: &AuthState) -> Result<Option<User>> {
        if let Some(id) = state.selected_user {
            if let Some(user) = self.store.get_user(&id).await? {
                return Ok(Some(user));
            }
            debug!(user_id = %id, "selected user missing, falling back to username");
        }
        Ok(self.store.get_user_by_name(&state.username).await?)
    }
}
