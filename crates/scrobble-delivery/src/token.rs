//! Access token lifecycle.
//!
//! Upstream access tokens expire after 24 hours; anything older than the
//! refresh threshold (23 hours by default) is refreshed before use. A failed
//! refresh removes the user: the grant is treated as revoked and the user
//! has to authorize again.
//!
//! Refresh and the delivery that follows run under the user's lock, so a
//! slow refresh is never triggered twice and a fresher token is never
//! overwritten by a stale one.

use std::{sync::Arc, time::Duration};

use scrobble_core::{Clock, Store, User, UserId};
use tracing::{error, info, warn};

use crate::{
    client::TrackerApi,
    error::{DeliveryError, Result},
    lock::{KeyGuard, MultipleLock},
};

/// Default age after which an access token is refreshed.
pub const DEFAULT_REFRESH_AFTER: Duration = Duration::from_secs(23 * 60 * 60);

/// A user record read under its lock with a usable access token.
///
/// The lock is held until the lease is dropped.
#[derive(Debug)]
pub struct UserLease {
    /// Current user record
    pub user: User,
    _guard: KeyGuard,
}

/// Decides when tokens are stale and drives the refresh exchange.
#[derive(Clone)]
pub struct TokenManager {
    store: Arc<dyn Store>,
    api: Arc<dyn TrackerApi>,
    locks: Arc<MultipleLock>,
    clock: Arc<dyn Clock>,
    refresh_after: Duration,
}

impl std::fmt::Debug for TokenManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TokenManager")
            .field("backend", &self.store.backend())
            .field("refresh_after", &self.refresh_after)
            .finish_non_exhaustive()
    }
}

impl TokenManager {
    /// Creates a manager with the default refresh threshold.
    pub fn new(
        store: Arc<dyn Store>,
        api: Arc<dyn TrackerApi>,
        locks: Arc<MultipleLock>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self { store, api, locks, clock, refresh_after: DEFAULT_REFRESH_AFTER }
    }

    /// Overrides the refresh threshold.
    #[must_use]
    pub fn with_refresh_after(mut self, refresh_after: Duration) -> Self {
        self.refresh_after = refresh_after;
        self
    }

    /// Returns true when the user's access token must be refreshed.
    pub fn is_stale(&self, user: &User) -> bool {
        user.is_token_stale(self.clock.now_utc(), self.refresh_after)
    }

    /// Locks the user, rereads it, and refreshes its token if stale.
    ///
    /// Returns `Ok(None)` when the user does not exist.
    ///
    /// # Errors
    ///
    /// Returns `DeliveryError::Unauthorized` when the refresh fails (the
    /// user has been deleted) and `DeliveryError::Storage` when the store
    /// cannot be read or written.
    pub async fn lease(&self, user_id: &UserId) -> Result<Option<UserLease>> {
        let Some(user) = self.store.get_user(user_id).await? else {
            return Ok(None);
        };

        let guard = self.locks.lock(&MultipleLock::lock_key(&user.username, &user.id)).await;

        // Another holder may have refreshed or removed the user meanwhile.
        let Some(user) = self.store.get_user(user_id).await? else {
            return Ok(None);
        };
        let user = self.ensure_fresh(user).await?;

        Ok(Some(UserLease { user, _guard: guard }))
    }

    /// Refreshes the token if stale. The caller must hold the user's lock.
    pub async fn ensure_fresh(&self, user: User) -> Result<User> {
        if !self.is_stale(&user) {
            return Ok(user);
        }
        self.refresh(user).await
    }

    /// Performs the refresh-token exchange. The caller must hold the user's lock.
    pub async fn refresh(&self, mut user: User) -> Result<User> {
        let age_minutes = self.clock.now_utc().signed_duration_since(user.updated).num_minutes();
        info!(user_id = %user.id, username = %user.username, age_minutes, "refreshing access token");

        match self.api.refresh_token(&user.refresh_token).await {
            Ok(grant) => {
                user.rotate_tokens(grant.access_token, grant.refresh_token, self.clock.now_utc());
                self.store.write_user(&user).await.map_err(|e| {
                    error!(user_id = %user.id, error = %e, "failed to persist refreshed tokens");
                    DeliveryError::from(e)
                })?;
                Ok(user)
            },
            Err(refresh_error) => {
                warn!(
                    user_id = %user.id,
                    username = %user.username,
                    status = ?refresh_error.status(),
                    code = ?refresh_error.upstream_code(),
                    error = %refresh_error,
                    "token refresh failed, removing user"
                );

                if let Err(e) = self.store.delete_user(&user.id, &user.username).await {
                    error!(user_id = %user.id, error = %e, "failed to delete revoked user");
                    return Err(e.into());
                }
                Err(DeliveryError::unauthorized(user.id, refresh_error.to_string()))
            },
        }
    }
}
