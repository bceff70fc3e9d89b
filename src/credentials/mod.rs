//! Usage: Session credential cache with single-flight refresh.
//!
//! `CredentialRefreshManager` hands out temporary session credentials, and
//! re-exchanges them when they come within the refresh lead of expiry. All
//! concurrent callers that find the cache stale funnel through one async gate,
//! so exactly one exchange runs while the rest wait for its result.

use crate::config::AuthConfig;
use crate::identity::IdentityResolver;
use crate::shared::error::{AuthError, AuthResult};
use crate::shared::security::mask_token;
use crate::shared::time::now_unix_seconds;
use crate::store::{keys, TokenStore};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::future::Future;
use std::pin::Pin;
use std::sync::{Arc, RwLock};

/// Temporary credentials scoped to a resolved identity.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionCredentials {
    pub access_key_id: String,
    pub secret_key: String,
    pub session_token: Option<String>,
    /// `None` means the credentials never expire and are never refreshed.
    pub expires_at_unix: Option<i64>,
}

impl SessionCredentials {
    /// Within `lead_s` of expiry, or past it. Non-expiring credentials are
    /// never stale.
    pub(crate) fn is_stale(&self, lead_s: i64, now_unix: i64) -> bool {
        match self.expires_at_unix {
            Some(expires_at) => expires_at.saturating_sub(lead_s) <= now_unix,
            None => false,
        }
    }
}

impl fmt::Debug for SessionCredentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SessionCredentials")
            .field("access_key_id", &self.access_key_id)
            .field("secret_key", &mask_token(&self.secret_key))
            .field(
                "session_token",
                &self.session_token.as_deref().map(mask_token),
            )
            .field("expires_at_unix", &self.expires_at_unix)
            .finish()
    }
}

/// Exchanges an identity id and its logins for session credentials.
pub trait CredentialExchange: Send + Sync {
    fn exchange(
        &self,
        identity_id: String,
        logins: HashMap<String, String>,
        session_duration_s: i64,
    ) -> Pin<Box<dyn Future<Output = AuthResult<SessionCredentials>> + Send + '_>>;
}

pub struct CredentialRefreshManager {
    exchange: Arc<dyn CredentialExchange>,
    identity: Arc<IdentityResolver>,
    store: Arc<TokenStore>,
    refresh_lead_s: i64,
    session_duration_s: i64,
    cached: RwLock<Option<SessionCredentials>>,
    /// Single-flight gate for the exchange path.
    gate: tokio::sync::Mutex<()>,
}

impl CredentialRefreshManager {
    pub fn new(
        config: &AuthConfig,
        store: Arc<TokenStore>,
        identity: Arc<IdentityResolver>,
        exchange: Arc<dyn CredentialExchange>,
    ) -> Self {
        let cached = store
            .get(keys::SESSION_CREDENTIALS)
            .and_then(|raw| match serde_json::from_str(&raw) {
                Ok(creds) => Some(creds),
                Err(e) => {
                    tracing::warn!(error = %e, "discarding unreadable persisted session credentials");
                    None
                }
            });

        Self {
            exchange,
            identity,
            store,
            refresh_lead_s: config.refresh_lead_s,
            session_duration_s: config.session_duration_s,
            cached: RwLock::new(cached),
            gate: tokio::sync::Mutex::new(()),
        }
    }

    /// Current session credentials, exchanging for fresh ones when the cache
    /// is empty or within the refresh lead of expiry.
    pub async fn credentials(&self) -> AuthResult<SessionCredentials> {
        if let Some(creds) = self.fresh_cached() {
            return Ok(creds);
        }

        let _guard = self.gate.lock().await;
        // Another caller may have refreshed while this one waited.
        if let Some(creds) = self.fresh_cached() {
            return Ok(creds);
        }

        let identity_id = self.identity.identity_id().await?;
        let logins = self.identity.logins();
        tracing::debug!(identity_id = %identity_id, "exchanging for session credentials");
        let creds = self
            .exchange
            .exchange(identity_id, logins, self.session_duration_s)
            .await?;

        self.persist(&creds)?;
        *self.lock_cached_mut() = Some(creds.clone());
        Ok(creds)
    }

    pub fn cached_credentials(&self) -> Option<SessionCredentials> {
        self.cached
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    /// Replace the login map behind the identity resolver. The cached
    /// credentials belong to the old logins and are dropped along with the
    /// persisted copy.
    pub fn set_logins(&self, logins: HashMap<String, String>) -> AuthResult<()> {
        self.identity.set_logins(logins);
        *self.lock_cached_mut() = None;
        self.store.remove(keys::SESSION_CREDENTIALS)
    }

    /// Drop cached credentials so the next call re-exchanges.
    pub fn invalidate(&self) -> AuthResult<()> {
        *self.lock_cached_mut() = None;
        self.store.remove(keys::SESSION_CREDENTIALS)
    }

    /// Wipe everything for this credential set, in memory and on disk, and
    /// drop registered identity listeners.
    pub fn clear(&self) -> AuthResult<()> {
        *self.lock_cached_mut() = None;
        self.identity.clear();
        self.identity.clear_listeners();
        self.store.clear()
    }

    fn fresh_cached(&self) -> Option<SessionCredentials> {
        self.cached
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .as_ref()
            .filter(|c| !c.is_stale(self.refresh_lead_s, now_unix_seconds()))
            .cloned()
    }

    fn persist(&self, creds: &SessionCredentials) -> AuthResult<()> {
        let raw = serde_json::to_string(creds)
            .map_err(|e| AuthError::Store(format!("failed to encode session credentials: {e}")))?;
        self.store.set(keys::SESSION_CREDENTIALS, &raw)
    }

    fn lock_cached_mut(&self) -> std::sync::RwLockWriteGuard<'_, Option<SessionCredentials>> {
        self.cached.write().unwrap_or_else(|e| e.into_inner())
    }
}
