//! Usage: Authorization-code flow state machine.
//!
//! `FlowController` drives a browser-mediated OAuth2 flow end to end: it
//! finalizes the authorization URL (state nonce, PKCE challenge), opens the
//! configured surface, matches and validates the redirect callback, and runs
//! the code-for-token and refresh exchanges against the token endpoint. One
//! sign-in or sign-out flow is active at a time; starting a new one cancels
//! the waiter of the previous one.

use crate::config::AuthConfig;
use crate::flow::pkce::{generate_pkce_pair, ChallengeMethod};
use crate::flow::state::FlowState;
use crate::flow::token_exchange::{post_token, TokenEndpointRequest};
use crate::shared::error::{AuthError, AuthResult};
use crate::shared::security::constant_time_eq;
use crate::shared::time::now_unix_seconds;
use crate::store::{keys, TokenBundle, TokenStore};
use rand::rngs::OsRng;
use rand::RngCore;
use reqwest::Url;
use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex};
use tokio::sync::oneshot;

/// Where the finalized authorization URL gets presented to the user.
///
/// The default implementation launches the operating system browser; tests
/// and embedders with their own web view substitute their own surface.
pub trait AuthSurface: Send + Sync {
    fn open(&self, url: &Url) -> AuthResult<()>;
}

/// Opens URLs with the platform launcher.
pub struct SystemBrowser;

impl AuthSurface for SystemBrowser {
    fn open(&self, url: &Url) -> AuthResult<()> {
        open_system_browser(url.as_str())
            .map_err(|e| AuthError::Transport(format!("failed to open system browser: {e}")))
    }
}

#[cfg(target_os = "windows")]
fn open_system_browser(url: &str) -> std::io::Result<()> {
    std::process::Command::new("rundll32")
        .args(["url.dll,FileProtocolHandler", url])
        .spawn()
        .map(|_| ())
}

#[cfg(target_os = "macos")]
fn open_system_browser(url: &str) -> std::io::Result<()> {
    std::process::Command::new("open").arg(url).spawn().map(|_| ())
}

#[cfg(all(unix, not(target_os = "macos")))]
fn open_system_browser(url: &str) -> std::io::Result<()> {
    std::process::Command::new("xdg-open").arg(url).spawn().map(|_| ())
}

/// Observable phase of the controller, mostly useful for UI surfaces.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FlowPhase {
    Idle,
    AwaitingRedirect,
    SigningOut,
    Completed,
    Cancelled,
    Errored,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum FlowKind {
    SignIn,
    SignOut,
}

/// What a matched redirect carried back.
#[derive(Debug, Clone)]
pub struct RedirectOutcome {
    /// Authorization code for a sign-in redirect; `None` for sign-out.
    pub code: Option<String>,
    pub redirect_uri: Url,
}

/// Handle returned by `authorize` / `sign_out`; resolves when the redirect
/// for this flow is dispatched, the surface is dismissed, or the flow is
/// displaced by a newer one.
pub struct PendingFlow {
    rx: oneshot::Receiver<AuthResult<RedirectOutcome>>,
}

impl PendingFlow {
    pub async fn wait(self) -> AuthResult<RedirectOutcome> {
        match self.rx.await {
            Ok(outcome) => outcome,
            Err(_) => Err(AuthError::Cancelled(
                "flow controller went away before the redirect arrived".to_string(),
            )),
        }
    }
}

/// Caller-supplied overrides for a token endpoint call. Anything left unset
/// falls back to the stored flow context and configuration.
#[derive(Debug, Clone, Default)]
pub struct TokenRequestOptions {
    pub token_uri: Option<String>,
    pub code: Option<String>,
    pub headers: Vec<(String, String)>,
    pub body: HashMap<String, String>,
}

struct Pending {
    kind: FlowKind,
    tx: oneshot::Sender<AuthResult<RedirectOutcome>>,
}

struct ControllerInner {
    phase: FlowPhase,
    pending: Option<Pending>,
    /// Code captured by `handle_redirect`, consumed by the next exchange.
    last_code: Option<String>,
}

pub struct FlowController {
    client_id: String,
    token_uri: String,
    scopes: Vec<String>,
    challenge_method: ChallengeMethod,
    sign_out_redirect_uri: Option<String>,
    store: Arc<TokenStore>,
    surface: Arc<dyn AuthSurface>,
    client: reqwest::Client,
    inner: Mutex<ControllerInner>,
}

impl FlowController {
    pub fn new(
        config: &AuthConfig,
        store: Arc<TokenStore>,
        surface: Arc<dyn AuthSurface>,
    ) -> AuthResult<Self> {
        config.validate()?;
        let client = config.http_client()?;

        // Record the endpoint configuration alongside the tokens it produces,
        // stamping the set with a creation date on first use.
        let mut seed: Vec<(&str, Option<String>)> = vec![
            (keys::TOKEN_URI, Some(config.token_uri.clone())),
            (
                keys::SIGN_IN_REDIRECT_URI,
                Some(config.sign_in_redirect_uri.clone()),
            ),
            (
                keys::SIGN_OUT_REDIRECT_URI,
                config.sign_out_redirect_uri.clone(),
            ),
        ];
        if store.get(keys::CREATE_DATE).is_none() {
            seed.push((keys::CREATE_DATE, Some(now_unix_seconds().to_string())));
        }
        store.set_many(&seed)?;

        Ok(Self {
            client_id: config.client_id.clone(),
            token_uri: config.token_uri.clone(),
            scopes: config.scopes.clone(),
            challenge_method: config.challenge_method,
            sign_out_redirect_uri: config.sign_out_redirect_uri.clone(),
            store,
            surface,
            client,
            inner: Mutex::new(ControllerInner {
                phase: FlowPhase::Idle,
                pending: None,
                last_code: None,
            }),
        })
    }

    pub fn phase(&self) -> FlowPhase {
        self.lock_inner().phase
    }

    /// Finalize an authorization URL and present it on the surface.
    ///
    /// The URI must already name `client_id` and `redirect_uri`; missing
    /// required parameters fail here, before anything is shown to the user.
    /// `response_type`, the state nonce, and the PKCE challenge are appended
    /// when absent. Returns a handle that resolves once the matching redirect
    /// is handled.
    pub fn authorize(&self, authorize_uri: &str) -> AuthResult<PendingFlow> {
        let mut url = Url::parse(authorize_uri.trim())
            .map_err(|e| AuthError::invalid_input(format!("invalid authorize URI: {e}")))?;

        let present: HashSet<String> = url.query_pairs().map(|(k, _)| k.into_owned()).collect();
        if !present.contains("client_id") {
            return Err(AuthError::invalid_input(
                "authorize URI is missing the client_id parameter",
            ));
        }
        let redirect_uri = url
            .query_pairs()
            .find(|(k, _)| k == "redirect_uri")
            .map(|(_, v)| v.into_owned())
            .ok_or_else(|| {
                AuthError::invalid_input("authorize URI is missing the redirect_uri parameter")
            })?;

        let state = match url.query_pairs().find(|(k, _)| k == "state") {
            Some((_, v)) => v.into_owned(),
            None => build_state_nonce(),
        };

        let pkce = match self.challenge_method {
            ChallengeMethod::S256 if !present.contains("code_challenge") => {
                Some(generate_pkce_pair())
            }
            _ => None,
        };

        {
            let mut pairs = url.query_pairs_mut();
            if !present.contains("response_type") {
                pairs.append_pair("response_type", "code");
            }
            if !present.contains("state") {
                pairs.append_pair("state", &state);
            }
            if !present.contains("scope") && !self.scopes.is_empty() {
                pairs.append_pair("scope", &self.scopes.join(" "));
            }
            if let Some(pair) = &pkce {
                pairs.append_pair("code_challenge", &pair.code_challenge);
                pairs.append_pair("code_challenge_method", ChallengeMethod::S256.as_str());
            }
        }

        let flow = FlowState {
            state: Some(state),
            pkce_verifier: pkce.map(|p| p.code_verifier),
            challenge_method: if present.contains("code_challenge") {
                // Caller brought their own challenge; they hold the verifier.
                ChallengeMethod::None
            } else {
                self.challenge_method
            },
            sign_in_redirect_uri: redirect_uri,
            sign_out_redirect_uri: self.sign_out_redirect_uri.clone(),
        };
        flow.save(&self.store)?;

        let rx = self.arm(FlowKind::SignIn);
        self.open_surface(&url)?;
        Ok(PendingFlow { rx })
    }

    /// Open the sign-out endpoint. The URI must carry the parameter naming
    /// where the provider sends the user afterwards (`logout_uri` or
    /// `redirect_uri`); that value is matched by `handle_redirect`.
    pub fn sign_out(&self, sign_out_uri: &str) -> AuthResult<PendingFlow> {
        let url = Url::parse(sign_out_uri.trim())
            .map_err(|e| AuthError::invalid_input(format!("invalid sign-out URI: {e}")))?;

        let redirect_uri = url
            .query_pairs()
            .find(|(k, _)| k == "logout_uri" || k == "redirect_uri")
            .map(|(_, v)| v.into_owned())
            .ok_or_else(|| {
                AuthError::invalid_input(
                    "sign-out URI is missing a logout_uri or redirect_uri parameter",
                )
            })?;

        let flow = FlowState {
            state: None,
            pkce_verifier: None,
            challenge_method: ChallengeMethod::None,
            // Keep any prior sign-in redirect from matching this flow.
            sign_in_redirect_uri: String::new(),
            sign_out_redirect_uri: Some(redirect_uri),
        };
        flow.save(&self.store)?;

        let rx = self.arm(FlowKind::SignOut);
        self.open_surface(&url)?;
        {
            let mut inner = self.lock_inner();
            if inner.pending.is_some() {
                inner.phase = FlowPhase::SigningOut;
            }
        }
        Ok(PendingFlow { rx })
    }

    /// Offer a redirect URI to the controller.
    ///
    /// Returns `true` when the URI belongs to the active flow and was
    /// dispatched, `false` when it should be handled elsewhere. A sign-in
    /// redirect must carry the expected state nonce; on a mismatch the flow
    /// stays armed and the URI is rejected.
    pub fn handle_redirect(&self, uri: &str) -> bool {
        let Ok(url) = Url::parse(uri.trim()) else {
            return false;
        };
        let Some(flow) = FlowState::load(&self.store) else {
            return false;
        };

        if uri_matches(&url, &flow.sign_in_redirect_uri) {
            return self.dispatch_sign_in(&url, &flow);
        }
        if let Some(out_uri) = &flow.sign_out_redirect_uri {
            if uri_matches(&url, out_uri) {
                return self.dispatch_sign_out(&url);
            }
        }
        false
    }

    fn dispatch_sign_in(&self, url: &Url, flow: &FlowState) -> bool {
        let Some(expected) = &flow.state else {
            // Nonce already consumed; a replayed redirect is not ours.
            return false;
        };
        let params: HashMap<String, String> = url
            .query_pairs()
            .map(|(k, v)| (k.into_owned(), v.into_owned()))
            .collect();
        let Some(got) = params.get("state") else {
            return false;
        };
        if !constant_time_eq(expected.as_bytes(), got.as_bytes()) {
            tracing::warn!("redirect state nonce mismatch, ignoring callback");
            return false;
        }

        let outcome = if let Some(error) = params.get("error") {
            Err(AuthError::oauth(
                error.clone(),
                params.get("error_description").cloned(),
                params.get("error_uri").cloned(),
            ))
        } else if let Some(code) = params.get("code") {
            Ok(RedirectOutcome {
                code: Some(code.clone()),
                redirect_uri: url.clone(),
            })
        } else {
            return false;
        };

        // Success keeps the verifier and redirect URI for the code exchange;
        // an error outcome has no exchange ahead, so the whole record goes.
        let cleanup = if outcome.is_ok() {
            FlowState::consume_nonce(&self.store)
        } else {
            FlowState::clear(&self.store)
        };
        if let Err(e) = cleanup {
            tracing::warn!(error = %e, "failed to retire flow state after dispatch");
        }

        let mut inner = self.lock_inner();
        inner.phase = if outcome.is_ok() {
            FlowPhase::Completed
        } else {
            FlowPhase::Errored
        };
        if let Ok(out) = &outcome {
            inner.last_code = out.code.clone();
        }
        if let Some(pending) = inner.pending.take_if(|p| p.kind == FlowKind::SignIn) {
            let _ = pending.tx.send(outcome);
        }
        true
    }

    fn dispatch_sign_out(&self, url: &Url) -> bool {
        // Only an armed sign-out flow may claim this URI. A sign-in flow also
        // records the configured sign-out redirect, and a stray hit on it must
        // not tear down the sign-in that is still awaiting its own redirect.
        let pending = {
            let mut inner = self.lock_inner();
            let Some(pending) = inner.pending.take_if(|p| p.kind == FlowKind::SignOut) else {
                return false;
            };
            inner.phase = FlowPhase::Completed;
            pending
        };
        if let Err(e) = FlowState::clear(&self.store) {
            tracing::warn!(error = %e, "failed to clear flow state after sign-out");
        }
        let _ = pending.tx.send(Ok(RedirectOutcome {
            code: None,
            redirect_uri: url.clone(),
        }));
        true
    }

    /// Report that the user closed the surface without completing the flow.
    /// The waiter gets a cancellation and the controller returns to idle.
    pub fn surface_dismissed(&self) {
        {
            let mut inner = self.lock_inner();
            if let Some(pending) = inner.pending.take() {
                let _ = pending.tx.send(Err(AuthError::Cancelled(
                    "authorization surface dismissed before the redirect arrived".to_string(),
                )));
            }
            inner.phase = FlowPhase::Cancelled;
            inner.last_code = None;
        }
        if let Err(e) = FlowState::clear(&self.store) {
            tracing::warn!(error = %e, "failed to clear flow state after dismissal");
        }
    }

    /// Exchange the captured authorization code for a token bundle and
    /// persist it. Uses the stored flow context for the redirect URI and, if
    /// the flow used PKCE, the verifier.
    pub async fn request_tokens(&self, options: TokenRequestOptions) -> AuthResult<TokenBundle> {
        let flow = FlowState::load(&self.store);

        let code = match options.code {
            Some(code) => code,
            None => self
                .lock_inner()
                .last_code
                .take()
                .ok_or_else(|| AuthError::invalid_input("no authorization code to exchange"))?,
        };

        let redirect_uri = flow
            .as_ref()
            .map(|f| f.sign_in_redirect_uri.clone())
            .filter(|v| !v.is_empty())
            .or_else(|| self.store.get(keys::SIGN_IN_REDIRECT_URI))
            .ok_or_else(|| {
                AuthError::invalid_input("no redirect_uri recorded for the code exchange")
            })?;

        let verifier = match &flow {
            Some(flow) if flow.challenge_method == ChallengeMethod::S256 => {
                Some(flow.pkce_verifier.clone().ok_or_else(|| {
                    AuthError::invalid_input("flow used PKCE but no verifier was recorded")
                })?)
            }
            _ => None,
        };
        let form =
            build_code_exchange_form(options.body, &self.client_id, &redirect_uri, code, verifier);

        let request = TokenEndpointRequest {
            token_uri: self.resolve_token_uri(options.token_uri),
            headers: options.headers,
            form,
        };
        let bundle = post_token(&self.client, &request).await?;

        self.store.set_bundle(&bundle)?;
        // The code and verifier are single-use.
        self.lock_inner().last_code = None;
        FlowState::clear(&self.store)?;
        Ok(bundle)
    }

    /// Obtain a fresh token bundle with the cached refresh token.
    ///
    /// Fails with `NoRefreshToken` before any network activity when none is
    /// cached. A response that omits `refresh_token` keeps the previous one.
    pub async fn refresh(&self, options: TokenRequestOptions) -> AuthResult<TokenBundle> {
        let refresh_token = self
            .store
            .get(keys::REFRESH_TOKEN)
            .filter(|v| !v.trim().is_empty())
            .ok_or(AuthError::NoRefreshToken)?;

        let form = build_refresh_form(options.body, &self.client_id, &refresh_token);

        let request = TokenEndpointRequest {
            token_uri: self.resolve_token_uri(options.token_uri),
            headers: options.headers,
            form,
        };
        let mut bundle = post_token(&self.client, &request).await?;

        carry_forward_refresh_token(&mut bundle, refresh_token);
        self.store.set_bundle(&bundle)?;
        Ok(bundle)
    }

    /// True when no usable bundle is stored or the stored one is inside the
    /// token refresh lead.
    pub fn needs_refresh(&self) -> bool {
        match self.store.bundle() {
            Some(bundle) => {
                bundle.is_stale(crate::config::DEFAULT_TOKEN_REFRESH_LEAD_S, now_unix_seconds())
            }
            None => true,
        }
    }

    /// Drop any active flow and return to idle, cancelling its waiter.
    pub fn reset(&self) {
        let mut inner = self.lock_inner();
        if let Some(pending) = inner.pending.take() {
            let _ = pending.tx.send(Err(AuthError::Cancelled(
                "flow controller was reset".to_string(),
            )));
        }
        inner.phase = FlowPhase::Idle;
        inner.last_code = None;
    }

    fn resolve_token_uri(&self, explicit: Option<String>) -> String {
        explicit
            .map(|v| v.trim().to_string())
            .filter(|v| !v.is_empty())
            .or_else(|| self.store.get(keys::TOKEN_URI))
            .unwrap_or_else(|| self.token_uri.clone())
    }

    /// Install a fresh waiter, cancelling whichever flow was active.
    fn arm(&self, kind: FlowKind) -> oneshot::Receiver<AuthResult<RedirectOutcome>> {
        let (tx, rx) = oneshot::channel();
        let mut inner = self.lock_inner();
        if let Some(displaced) = inner.pending.take() {
            let _ = displaced.tx.send(Err(AuthError::Cancelled(
                "flow displaced by a newer authorization request".to_string(),
            )));
        }
        inner.pending = Some(Pending { kind, tx });
        inner.phase = FlowPhase::AwaitingRedirect;
        inner.last_code = None;
        rx
    }

    fn open_surface(&self, url: &Url) -> AuthResult<()> {
        if let Err(e) = self.surface.open(url) {
            {
                let mut inner = self.lock_inner();
                inner.pending = None;
                inner.phase = FlowPhase::Errored;
            }
            if let Err(clear_err) = FlowState::clear(&self.store) {
                tracing::warn!(error = %clear_err, "failed to clear flow state after open failure");
            }
            return Err(e);
        }
        Ok(())
    }

    fn lock_inner(&self) -> std::sync::MutexGuard<'_, ControllerInner> {
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }
}

/// Assemble the authorization-code grant form. Caller-supplied entries are
/// kept, but the flow's own values win for the reserved keys; `grant_type`
/// defaults to `authorization_code` only when the caller left it unset.
fn build_code_exchange_form(
    mut form: HashMap<String, String>,
    client_id: &str,
    redirect_uri: &str,
    code: String,
    verifier: Option<String>,
) -> HashMap<String, String> {
    form.entry("grant_type".to_string())
        .or_insert_with(|| "authorization_code".to_string());
    form.insert("client_id".to_string(), client_id.to_string());
    form.insert("redirect_uri".to_string(), redirect_uri.to_string());
    form.insert("code".to_string(), code);
    if let Some(verifier) = verifier {
        form.insert("code_verifier".to_string(), verifier);
    }
    form
}

/// Assemble the refresh grant form with the same precedence rules.
fn build_refresh_form(
    mut form: HashMap<String, String>,
    client_id: &str,
    refresh_token: &str,
) -> HashMap<String, String> {
    form.entry("grant_type".to_string())
        .or_insert_with(|| "refresh_token".to_string());
    form.insert("client_id".to_string(), client_id.to_string());
    form.insert("refresh_token".to_string(), refresh_token.to_string());
    form
}

/// Providers may omit `refresh_token` on a refresh response; the session
/// keeps rolling on the one it already had.
fn carry_forward_refresh_token(bundle: &mut TokenBundle, prior: String) {
    if bundle.refresh_token.is_none() {
        bundle.refresh_token = Some(prior);
    }
}

/// 32 bytes of OS randomness, hex encoded.
fn build_state_nonce() -> String {
    let mut bytes = [0u8; 32];
    OsRng.fill_bytes(&mut bytes);
    bytes.iter().map(|b| format!("{b:02x}")).collect()
}

/// A redirect matches when scheme, authority, and path equal the registered
/// URI and every query parameter name the registered URI carries also appears
/// on the incoming one. The provider appends its own parameters (`code`,
/// `state`, `error`), so exact query equality would reject valid callbacks.
fn uri_matches(incoming: &Url, registered: &str) -> bool {
    let registered = registered.trim();
    if registered.is_empty() {
        return false;
    }
    let Ok(expected) = Url::parse(registered) else {
        return false;
    };
    if incoming.scheme() != expected.scheme()
        || incoming.host_str() != expected.host_str()
        || incoming.port_or_known_default() != expected.port_or_known_default()
        || incoming.path() != expected.path()
    {
        return false;
    }
    let incoming_names: HashSet<String> =
        incoming.query_pairs().map(|(k, _)| k.into_owned()).collect();
    expected
        .query_pairs()
        .all(|(k, _)| incoming_names.contains(k.as_ref()))
}
