//! OAuth2 token lifecycle management for native apps.
//!
//! The crate drives a browser-mediated authorization-code flow (with PKCE),
//! keeps the resulting tokens in a namespaced durable store, exchanges them
//! for temporary session credentials with single-flight refresh, and resolves
//! a memoized identity id with change notifications.
//!
//! Typical wiring goes through [`AuthContext`]:
//!
//! ```no_run
//! # use authkeep::{AuthConfig, AuthContext};
//! # use std::sync::Arc;
//! # fn identity_exchange() -> Arc<dyn authkeep::IdentityExchange> { unimplemented!() }
//! # fn credential_exchange() -> Arc<dyn authkeep::CredentialExchange> { unimplemented!() }
//! # fn main() -> Result<(), authkeep::AuthError> {
//! let config = AuthConfig::new(
//!     "my-pool",
//!     "my-client-id",
//!     "https://auth.example.com/oauth2/token",
//!     "myapp://signin",
//! );
//! let ctx = AuthContext::build(config, identity_exchange(), credential_exchange())?;
//! let pending = ctx.flow().authorize(
//!     "https://auth.example.com/oauth2/authorize?client_id=my-client-id&redirect_uri=myapp%3A%2F%2Fsignin",
//! )?;
//! # Ok(())
//! # }
//! ```

pub mod config;
pub mod context;
pub mod credentials;
pub mod flow;
pub mod identity;
pub mod logging;
pub mod shared;
pub mod store;

pub use config::AuthConfig;
pub use context::AuthContext;
pub use credentials::{CredentialExchange, CredentialRefreshManager, SessionCredentials};
pub use flow::{
    AuthSurface, ChallengeMethod, FlowController, FlowPhase, PendingFlow, RedirectOutcome,
    SystemBrowser, TokenRequestOptions,
};
pub use identity::{IdentityChangedListener, IdentityExchange, IdentityResolver};
pub use shared::error::{AuthError, AuthResult};
pub use store::{TokenBundle, TokenStore};
