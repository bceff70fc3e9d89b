//! Usage: Explicit configuration context for the credential/token subsystem.
//!
//! One `AuthConfig` instance is passed to the components that need it instead of
//! being read from process-global state. Refresh windows and timeouts can be
//! overridden through environment variables using the same trimmed-parse rules
//! as the rest of the configuration surface.

use crate::flow::pkce::ChallengeMethod;
use crate::shared::error::{AuthError, AuthResult};
use std::env;
use std::path::PathBuf;
use std::time::Duration;

/// Refresh lead for exchanged session credentials (seconds before expiry).
pub const DEFAULT_SESSION_REFRESH_LEAD_S: i64 = 500;
/// Refresh lead for raw OAuth token bundles (seconds before expiry).
pub const DEFAULT_TOKEN_REFRESH_LEAD_S: i64 = 60;
const DEFAULT_SESSION_DURATION_S: i64 = 3600;
const DEFAULT_HTTP_CONNECT_TIMEOUT: Duration = Duration::from_secs(10);
const MAX_REFRESH_LEAD_S: i64 = 7 * 24 * 60 * 60;

#[derive(Debug, Clone)]
pub struct AuthConfig {
    /// Namespace under which all keys for this credential set are persisted.
    pub store_id: String,
    pub client_id: String,
    pub token_uri: String,
    pub sign_in_redirect_uri: String,
    pub sign_out_redirect_uri: Option<String>,
    pub scopes: Vec<String>,
    pub challenge_method: ChallengeMethod,
    /// Credentials are refreshed once `expires_at - now` falls below this.
    pub refresh_lead_s: i64,
    pub session_duration_s: i64,
    /// `None` keeps the token store memory-only.
    pub persist_path: Option<PathBuf>,
    pub http_connect_timeout: Duration,
}

impl AuthConfig {
    pub fn new(
        store_id: impl Into<String>,
        client_id: impl Into<String>,
        token_uri: impl Into<String>,
        sign_in_redirect_uri: impl Into<String>,
    ) -> Self {
        Self {
            store_id: store_id.into(),
            client_id: client_id.into(),
            token_uri: token_uri.into(),
            sign_in_redirect_uri: sign_in_redirect_uri.into(),
            sign_out_redirect_uri: None,
            scopes: Vec::new(),
            challenge_method: ChallengeMethod::S256,
            refresh_lead_s: DEFAULT_SESSION_REFRESH_LEAD_S,
            session_duration_s: DEFAULT_SESSION_DURATION_S,
            persist_path: None,
            http_connect_timeout: DEFAULT_HTTP_CONNECT_TIMEOUT,
        }
    }

    pub fn with_sign_out_redirect_uri(mut self, uri: impl Into<String>) -> Self {
        self.sign_out_redirect_uri = Some(uri.into());
        self
    }

    pub fn with_scopes(mut self, scopes: impl IntoIterator<Item = impl Into<String>>) -> Self {
        self.scopes = scopes.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_persist_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.persist_path = Some(path.into());
        self
    }

    pub fn with_refresh_lead_s(mut self, lead: i64) -> Self {
        self.refresh_lead_s = lead;
        self
    }

    pub fn with_session_duration_s(mut self, duration: i64) -> Self {
        self.session_duration_s = duration;
        self
    }

    pub fn with_challenge_method(mut self, method: ChallengeMethod) -> Self {
        self.challenge_method = method;
        self
    }

    /// Apply `AUTHKEEP_*` environment overrides.
    pub fn apply_env_overrides(self) -> Self {
        self.apply_env_overrides_get(|key| env::var(key).ok())
    }

    fn apply_env_overrides_get(mut self, mut get: impl FnMut(&str) -> Option<String>) -> Self {
        if let Some(lead) = get("AUTHKEEP_REFRESH_LEAD_S")
            .as_deref()
            .and_then(parse_i64_trimmed)
            .filter(|v| (0..=MAX_REFRESH_LEAD_S).contains(v))
        {
            self.refresh_lead_s = lead;
        }

        if let Some(duration) = get("AUTHKEEP_SESSION_DURATION_S")
            .as_deref()
            .and_then(parse_i64_trimmed)
            .filter(|v| *v > 0)
        {
            self.session_duration_s = duration;
        }

        if let Some(timeout_ms) = get("AUTHKEEP_HTTP_CONNECT_TIMEOUT_MS")
            .as_deref()
            .and_then(parse_u64_trimmed)
            .filter(|v| *v > 0)
        {
            self.http_connect_timeout = Duration::from_millis(timeout_ms);
        }

        self
    }

    pub(crate) fn validate(&self) -> AuthResult<()> {
        if self.store_id.trim().is_empty() {
            return Err(AuthError::invalid_input("store_id is required"));
        }
        if self.client_id.trim().is_empty() {
            return Err(AuthError::invalid_input("client_id is required"));
        }
        if self.token_uri.trim().is_empty() {
            return Err(AuthError::invalid_input("token_uri is required"));
        }
        if self.sign_in_redirect_uri.trim().is_empty() {
            return Err(AuthError::invalid_input("sign_in_redirect_uri is required"));
        }
        Ok(())
    }

    pub(crate) fn http_client(&self) -> AuthResult<reqwest::Client> {
        let client = reqwest::Client::builder()
            .user_agent(format!("authkeep/{}", env!("CARGO_PKG_VERSION")))
            .connect_timeout(self.http_connect_timeout)
            .build()?;
        Ok(client)
    }
}

fn parse_i64_trimmed(raw: &str) -> Option<i64> {
    let trimmed = raw.trim();
    if trimmed.is_empty() {
        return None;
    }
    trimmed.parse::<i64>().ok()
}

fn parse_u64_trimmed(raw: &str) -> Option<u64> {
    let trimmed = raw.trim();
    if trimmed.is_empty() {
        return None;
    }
    trimmed.parse::<u64>().ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn base_config() -> AuthConfig {
        AuthConfig::new(
            "test-pool",
            "client-abc",
            "https://auth.example.com/token",
            "myapp://signin",
        )
    }

    #[test]
    fn env_overrides_apply_trimmed_values() {
        let cfg = base_config().apply_env_overrides_get(|key| match key {
            "AUTHKEEP_REFRESH_LEAD_S" => Some(" 120 ".to_string()),
            "AUTHKEEP_HTTP_CONNECT_TIMEOUT_MS" => Some("2500".to_string()),
            _ => None,
        });
        assert_eq!(cfg.refresh_lead_s, 120);
        assert_eq!(cfg.http_connect_timeout, Duration::from_millis(2500));
        assert_eq!(cfg.session_duration_s, DEFAULT_SESSION_DURATION_S);
    }

    #[test]
    fn env_overrides_reject_out_of_range_values() {
        let cfg = base_config().apply_env_overrides_get(|key| match key {
            "AUTHKEEP_REFRESH_LEAD_S" => Some("-5".to_string()),
            "AUTHKEEP_SESSION_DURATION_S" => Some("0".to_string()),
            "AUTHKEEP_HTTP_CONNECT_TIMEOUT_MS" => Some("garbage".to_string()),
            _ => None,
        });
        assert_eq!(cfg.refresh_lead_s, DEFAULT_SESSION_REFRESH_LEAD_S);
        assert_eq!(cfg.session_duration_s, DEFAULT_SESSION_DURATION_S);
        assert_eq!(cfg.http_connect_timeout, DEFAULT_HTTP_CONNECT_TIMEOUT);
    }

    #[test]
    fn validate_requires_client_id_and_redirect() {
        let mut cfg = base_config();
        cfg.client_id = "  ".to_string();
        assert!(cfg.validate().is_err());

        let mut cfg = base_config();
        cfg.sign_in_redirect_uri = String::new();
        assert!(cfg.validate().is_err());

        assert!(base_config().validate().is_ok());
    }
}
