//! Usage: OAuth2 authorization-code flow (PKCE, redirect handling, exchanges).

pub(crate) mod controller;
pub(crate) mod pkce;
pub(crate) mod state;
pub(crate) mod token_exchange;

pub use controller::{
    AuthSurface, FlowController, FlowPhase, PendingFlow, RedirectOutcome, SystemBrowser,
    TokenRequestOptions,
};
pub use pkce::ChallengeMethod;
