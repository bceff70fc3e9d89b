//! Usage: Unified error model for the credential/token subsystem.

pub type AuthResult<T> = Result<T, AuthError>;

/// Errors surfaced by the credential/token subsystem.
///
/// The variants mirror how callers must react: `InvalidInput` is raised
/// synchronously and never retried; `OAuth` carries the structured error body a
/// token or redirect response reported; `Transport` is an HTTP-level failure
/// without an OAuth error body; `Cancelled` is user cancellation and must not be
/// conflated with service errors; `NoRefreshToken` is a terminal local error
/// raised before any network call.
#[derive(Debug, Clone, thiserror::Error)]
pub enum AuthError {
    #[error("invalid input: {0}")]
    InvalidInput(String),

    #[error("oauth error {error}{}", render_detail(.error_description, .error_uri))]
    OAuth {
        error: String,
        error_description: Option<String>,
        error_uri: Option<String>,
    },

    #[error("transport failure: {0}")]
    Transport(String),

    #[error("cancelled: {0}")]
    Cancelled(String),

    #[error("no refresh token available")]
    NoRefreshToken,

    #[error("token store failure: {0}")]
    Store(String),
}

impl AuthError {
    pub fn invalid_input(message: impl Into<String>) -> Self {
        Self::InvalidInput(message.into())
    }

    pub fn oauth(
        error: impl Into<String>,
        error_description: Option<String>,
        error_uri: Option<String>,
    ) -> Self {
        Self::OAuth {
            error: error.into(),
            error_description,
            error_uri,
        }
    }

    /// True for user/displacement cancellation, distinct from service errors.
    pub fn is_cancellation(&self) -> bool {
        matches!(self, Self::Cancelled(_))
    }
}

fn render_detail(description: &Option<String>, uri: &Option<String>) -> String {
    let mut out = String::new();
    if let Some(description) = description {
        out.push_str(": ");
        out.push_str(description);
    }
    if let Some(uri) = uri {
        out.push_str(" (see ");
        out.push_str(uri);
        out.push(')');
    }
    out
}

impl From<rusqlite::Error> for AuthError {
    fn from(value: rusqlite::Error) -> Self {
        AuthError::Store(value.to_string())
    }
}

impl From<reqwest::Error> for AuthError {
    fn from(value: reqwest::Error) -> Self {
        // reqwest errors can embed the request URL; keep the message but not the
        // query string, which may carry token material.
        AuthError::Transport(value.without_url().to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn oauth_error_display_includes_description_and_uri() {
        let err = AuthError::oauth(
            "invalid_grant",
            Some("token is invalid".to_string()),
            Some("https://example.com/errors/invalid_grant".to_string()),
        );
        let text = err.to_string();
        assert!(text.contains("invalid_grant"));
        assert!(text.contains("token is invalid"));
        assert!(text.contains("https://example.com/errors/invalid_grant"));
    }

    #[test]
    fn oauth_error_display_without_detail_is_compact() {
        let err = AuthError::oauth("access_denied", None, None);
        assert_eq!(err.to_string(), "oauth error access_denied");
    }

    #[test]
    fn cancellation_is_distinguishable_from_service_errors() {
        assert!(AuthError::Cancelled("surface dismissed".to_string()).is_cancellation());
        assert!(!AuthError::oauth("access_denied", None, None).is_cancellation());
        assert!(!AuthError::NoRefreshToken.is_cancellation());
    }
}
