//! Usage: Token endpoint POST helpers (authorization_code + refresh_token grants).

use crate::shared::error::{AuthError, AuthResult};
use crate::shared::security::mask_token;
use crate::shared::time::now_unix_seconds;
use crate::store::TokenBundle;
use serde_json::Value;
use std::collections::HashMap;

const ERROR_SNIPPET_MAX_CHARS: usize = 500;

/// A fully assembled token endpoint request. The controller fills in the
/// defaults (`grant_type`, `client_id`, PKCE verifier) before handing it here.
#[derive(Debug, Clone)]
pub(crate) struct TokenEndpointRequest {
    pub(crate) token_uri: String,
    pub(crate) headers: Vec<(String, String)>,
    pub(crate) form: HashMap<String, String>,
}

pub(crate) async fn post_token(
    client: &reqwest::Client,
    request: &TokenEndpointRequest,
) -> AuthResult<TokenBundle> {
    let mut builder = client.post(request.token_uri.trim());
    for (name, value) in &request.headers {
        builder = builder.header(name, value);
    }

    let response = builder.form(&request.form).send().await?;

    let status = response.status();
    let body = response.text().await?;

    parse_token_body(status.is_success(), status.as_u16(), &body, now_unix_seconds())
}

/// Parse a token endpoint response body. A JSON `error` field always wins over
/// the HTTP status; a non-2xx without one is a plain transport failure.
pub(crate) fn parse_token_body(
    success: bool,
    status: u16,
    body: &str,
    now_unix: i64,
) -> AuthResult<TokenBundle> {
    let value = serde_json::from_str::<Value>(body).ok();

    if let Some(err) = value.as_ref().and_then(extract_oauth_error) {
        return Err(err);
    }

    if !success {
        return Err(AuthError::Transport(format!(
            "token endpoint returned status={status} body={}",
            sanitize_body_snippet(body)
        )));
    }

    let value = value.ok_or_else(|| {
        AuthError::Transport(format!(
            "token response is not valid json: {}",
            sanitize_body_snippet(body)
        ))
    })?;

    let access_token = string_field(&value, "access_token")
        .ok_or_else(|| AuthError::Transport("token response missing access_token".to_string()))?;

    let expires_in_s = value
        .get("expires_in")
        .and_then(parse_i64_lossy)
        .filter(|v| *v > 0);

    Ok(TokenBundle {
        access_token,
        id_token: string_field(&value, "id_token"),
        refresh_token: string_field(&value, "refresh_token"),
        token_type: string_field(&value, "token_type").unwrap_or_else(|| "Bearer".to_string()),
        expires_in_s,
        issued_at_unix: now_unix,
        scopes: string_field(&value, "scope"),
    })
}

fn extract_oauth_error(value: &Value) -> Option<AuthError> {
    let error = string_field(value, "error")?;
    Some(AuthError::oauth(
        error,
        string_field(value, "error_description"),
        string_field(value, "error_uri"),
    ))
}

fn string_field(value: &Value, key: &str) -> Option<String> {
    value
        .get(key)
        .and_then(Value::as_str)
        .map(str::trim)
        .filter(|v| !v.is_empty())
        .map(str::to_string)
}

fn parse_i64_lossy(value: &Value) -> Option<i64> {
    match value {
        Value::Number(n) => n.as_i64(),
        Value::String(s) => s.trim().parse::<i64>().ok(),
        _ => None,
    }
}

fn is_sensitive_key(key: &str) -> bool {
    let key_lc = key.trim().to_ascii_lowercase();
    key_lc.contains("token") || key_lc.contains("secret") || key_lc == "code"
}

fn redact_sensitive_json_fields(value: &mut Value) {
    match value {
        Value::Object(map) => {
            for (key, nested) in map {
                if is_sensitive_key(key) {
                    if let Some(raw) = nested.as_str() {
                        *nested = Value::String(mask_token(raw));
                        continue;
                    }
                }
                redact_sensitive_json_fields(nested);
            }
        }
        Value::Array(items) => {
            for nested in items {
                redact_sensitive_json_fields(nested);
            }
        }
        _ => {}
    }
}

fn sanitize_body_snippet(body: &str) -> String {
    if let Ok(mut value) = serde_json::from_str::<Value>(body) {
        redact_sensitive_json_fields(&mut value);
        if let Ok(encoded) = serde_json::to_string(&value) {
            return encoded.chars().take(ERROR_SNIPPET_MAX_CHARS).collect();
        }
    }
    body.chars().take(ERROR_SNIPPET_MAX_CHARS).collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::shared::security::mask_token;

    #[test]
    fn successful_response_parses_to_bundle() {
        let body = r#"{"access_token":"A","token_type":"Bearer","expires_in":"3600"}"#;
        let bundle = parse_token_body(true, 200, body, 1_700_000_000).expect("bundle");
        assert_eq!(bundle.access_token, "A");
        assert_eq!(bundle.token_type, "Bearer");
        assert_eq!(bundle.expires_in_s, Some(3600));
        assert_eq!(bundle.issued_at_unix, 1_700_000_000);
        assert!(bundle.refresh_token.is_none());
    }

    #[test]
    fn expires_in_accepts_number_and_string() {
        assert_eq!(parse_i64_lossy(&Value::from(1200)), Some(1200));
        assert_eq!(parse_i64_lossy(&Value::from("3600")), Some(3600));
        assert_eq!(parse_i64_lossy(&Value::from("x")), None);
    }

    #[test]
    fn non_positive_expires_in_means_no_expiry() {
        let body = r#"{"access_token":"A","token_type":"Bearer","expires_in":0}"#;
        let bundle = parse_token_body(true, 200, body, 100).expect("bundle");
        assert!(bundle.expires_in_s.is_none());
        assert!(bundle.expires_at_unix().is_none());
    }

    #[test]
    fn oauth_error_field_wins_even_on_http_200() {
        let body = r#"{"error":"invalid_grant","error_description":"code expired","error_uri":"https://e.example/x"}"#;
        let err = parse_token_body(true, 200, body, 100).expect_err("oauth error");
        match err {
            AuthError::OAuth {
                error,
                error_description,
                error_uri,
            } => {
                assert_eq!(error, "invalid_grant");
                assert_eq!(error_description.as_deref(), Some("code expired"));
                assert_eq!(error_uri.as_deref(), Some("https://e.example/x"));
            }
            other => panic!("expected OAuth error, got {other:?}"),
        }
    }

    #[test]
    fn non_success_without_oauth_body_is_transport_error() {
        let err = parse_token_body(false, 502, "<html>bad gateway</html>", 100)
            .expect_err("transport error");
        match err {
            AuthError::Transport(message) => {
                assert!(message.contains("status=502"));
            }
            other => panic!("expected Transport error, got {other:?}"),
        }
    }

    #[test]
    fn error_snippets_mask_token_fields() {
        let body = r#"{"message":"denied","refresh_token":"abcd1234xyz9876","nested":{"id_token":"idtokenvalue123456"}}"#;
        let err = parse_token_body(false, 400, body, 100).expect_err("transport error");
        let text = err.to_string();
        assert!(text.contains(mask_token("abcd1234xyz9876").as_str()));
        assert!(!text.contains("abcd1234xyz9876"));
        assert!(!text.contains("idtokenvalue123456"));
    }

    #[test]
    fn missing_access_token_on_success_is_transport_error() {
        let body = r#"{"token_type":"Bearer"}"#;
        let err = parse_token_body(true, 200, body, 100).expect_err("transport error");
        assert!(matches!(err, AuthError::Transport(_)));
    }

    #[tokio::test]
    async fn unreachable_endpoint_surfaces_as_transport_error() {
        let client = reqwest::Client::new();
        let request = TokenEndpointRequest {
            // Discard port on loopback; nothing listens there.
            token_uri: "http://127.0.0.1:9/token".to_string(),
            headers: Vec::new(),
            form: HashMap::new(),
        };
        let err = post_token(&client, &request).await.expect_err("no listener");
        assert!(matches!(err, AuthError::Transport(_)));
    }
}
