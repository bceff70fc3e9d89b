//! Usage: Top-level wiring for one credential set.
//!
//! `AuthContext` owns the store, flow controller, identity resolver, and
//! credential manager for a single configuration, all sharing the same
//! namespace. Embedders that bring their own presentation surface use
//! `build_with_surface`.

use crate::config::AuthConfig;
use crate::credentials::{CredentialExchange, CredentialRefreshManager};
use crate::flow::{AuthSurface, FlowController, SystemBrowser};
use crate::identity::{IdentityExchange, IdentityResolver};
use crate::shared::error::AuthResult;
use crate::store::TokenStore;
use std::sync::Arc;

pub struct AuthContext {
    config: AuthConfig,
    store: Arc<TokenStore>,
    flow: Arc<FlowController>,
    identity: Arc<IdentityResolver>,
    credentials: Arc<CredentialRefreshManager>,
}

impl AuthContext {
    /// Build a context that presents authorization URLs in the system browser.
    pub fn build(
        config: AuthConfig,
        identity_exchange: Arc<dyn IdentityExchange>,
        credential_exchange: Arc<dyn CredentialExchange>,
    ) -> AuthResult<Self> {
        Self::build_with_surface(
            config,
            Arc::new(SystemBrowser),
            identity_exchange,
            credential_exchange,
        )
    }

    pub fn build_with_surface(
        config: AuthConfig,
        surface: Arc<dyn AuthSurface>,
        identity_exchange: Arc<dyn IdentityExchange>,
        credential_exchange: Arc<dyn CredentialExchange>,
    ) -> AuthResult<Self> {
        config.validate()?;
        let store = Arc::new(TokenStore::open(
            &config.store_id,
            config.persist_path.as_deref(),
        )?);
        let flow = Arc::new(FlowController::new(&config, Arc::clone(&store), surface)?);
        let identity = Arc::new(IdentityResolver::new(identity_exchange));
        let credentials = Arc::new(CredentialRefreshManager::new(
            &config,
            Arc::clone(&store),
            Arc::clone(&identity),
            credential_exchange,
        ));
        Ok(Self {
            config,
            store,
            flow,
            identity,
            credentials,
        })
    }

    pub fn config(&self) -> &AuthConfig {
        &self.config
    }

    pub fn store(&self) -> &Arc<TokenStore> {
        &self.store
    }

    pub fn flow(&self) -> &Arc<FlowController> {
        &self.flow
    }

    pub fn identity(&self) -> &Arc<IdentityResolver> {
        &self.identity
    }

    pub fn credentials(&self) -> &Arc<CredentialRefreshManager> {
        &self.credentials
    }

    /// Sign out locally: cancel any active flow and wipe every token,
    /// credential, and listener for this credential set.
    pub fn clear(&self) -> AuthResult<()> {
        self.flow.reset();
        self.credentials.clear()
    }
}
