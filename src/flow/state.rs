//! Usage: Transient flow state persisted across the browser redirect round trip.
//!
//! The redirect callback arrives on an arbitrary later invocation, so the state
//! nonce, PKCE verifier, and redirect URIs live in the token store rather than
//! on the stack. The nonce is consumed exactly once by the matching redirect
//! (a replayed redirect no longer matches); the verifier and redirect URI stay
//! until the code exchange that needs them completes.

use crate::flow::pkce::ChallengeMethod;
use crate::shared::error::AuthResult;
use crate::store::TokenStore;

const KEY_STATE: &str = "flowState";
const KEY_VERIFIER: &str = "flowPkceVerifier";
const KEY_METHOD: &str = "flowChallengeMethod";
const KEY_SIGN_IN_REDIRECT: &str = "flowSignInRedirectUri";
const KEY_SIGN_OUT_REDIRECT: &str = "flowSignOutRedirectUri";

#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct FlowState {
    /// Nonce expected on the next redirect; `None` once consumed.
    pub(crate) state: Option<String>,
    pub(crate) pkce_verifier: Option<String>,
    pub(crate) challenge_method: ChallengeMethod,
    pub(crate) sign_in_redirect_uri: String,
    pub(crate) sign_out_redirect_uri: Option<String>,
}

impl FlowState {
    pub(crate) fn save(&self, store: &TokenStore) -> AuthResult<()> {
        store.set_many(&[
            (KEY_STATE, self.state.clone()),
            (KEY_VERIFIER, self.pkce_verifier.clone()),
            (
                KEY_METHOD,
                Some(self.challenge_method.as_str().to_string()),
            ),
            (
                KEY_SIGN_IN_REDIRECT,
                Some(self.sign_in_redirect_uri.clone()),
            ),
            (KEY_SIGN_OUT_REDIRECT, self.sign_out_redirect_uri.clone()),
        ])
    }

    pub(crate) fn load(store: &TokenStore) -> Option<Self> {
        let sign_in_redirect_uri = store.get(KEY_SIGN_IN_REDIRECT)?;
        Some(Self {
            state: store.get(KEY_STATE),
            pkce_verifier: store.get(KEY_VERIFIER),
            challenge_method: store
                .get(KEY_METHOD)
                .map(|raw| ChallengeMethod::parse_lossy(&raw))
                .unwrap_or(ChallengeMethod::None),
            sign_in_redirect_uri,
            sign_out_redirect_uri: store.get(KEY_SIGN_OUT_REDIRECT),
        })
    }

    /// Invalidate the nonce after a dispatched redirect so it cannot be
    /// replayed, keeping the exchange context alive.
    pub(crate) fn consume_nonce(store: &TokenStore) -> AuthResult<()> {
        store.remove(KEY_STATE)
    }

    pub(crate) fn clear(store: &TokenStore) -> AuthResult<()> {
        store.set_many(&[
            (KEY_STATE, None),
            (KEY_VERIFIER, None),
            (KEY_METHOD, None),
            (KEY_SIGN_IN_REDIRECT, None),
            (KEY_SIGN_OUT_REDIRECT, None),
        ])
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_state() -> FlowState {
        FlowState {
            state: Some("nonce-123".to_string()),
            pkce_verifier: Some("verifier-abc".to_string()),
            challenge_method: ChallengeMethod::S256,
            sign_in_redirect_uri: "myapp://signin".to_string(),
            sign_out_redirect_uri: Some("myapp://signout".to_string()),
        }
    }

    #[test]
    fn flow_state_survives_store_round_trip() {
        let store = TokenStore::open("pool-a", None).expect("open store");
        sample_state().save(&store).expect("save");
        assert_eq!(FlowState::load(&store), Some(sample_state()));
    }

    #[test]
    fn consume_nonce_keeps_exchange_context() {
        let store = TokenStore::open("pool-a", None).expect("open store");
        sample_state().save(&store).expect("save");
        FlowState::consume_nonce(&store).expect("consume");

        let loaded = FlowState::load(&store).expect("still loadable");
        assert!(loaded.state.is_none());
        assert_eq!(loaded.pkce_verifier.as_deref(), Some("verifier-abc"));
        assert_eq!(loaded.sign_in_redirect_uri, "myapp://signin");
    }

    #[test]
    fn clear_removes_everything() {
        let store = TokenStore::open("pool-a", None).expect("open store");
        sample_state().save(&store).expect("save");
        FlowState::clear(&store).expect("clear");
        assert!(FlowState::load(&store).is_none());
    }

    #[test]
    fn load_without_a_saved_flow_is_none() {
        let store = TokenStore::open("pool-a", None).expect("open store");
        assert!(FlowState::load(&store).is_none());
    }
}
