//! Usage: Security-sensitive helpers (token masking and constant-time equality).

use subtle::ConstantTimeEq;

const MASK_PREFIX_LEN: usize = 4;
const MASK_SUFFIX_LEN: usize = 4;

/// Redact a token-like value for logs and error snippets, keeping just enough to
/// correlate with provider dashboards.
pub(crate) fn mask_token(token: &str) -> String {
    let trimmed = token.trim();
    if trimmed.is_empty() {
        return String::new();
    }

    let len = trimmed.len();
    if len <= MASK_PREFIX_LEN + MASK_SUFFIX_LEN {
        return "*".repeat(len.min(8));
    }

    let prefix = &trimmed[..MASK_PREFIX_LEN];
    let suffix = &trimmed[len - MASK_SUFFIX_LEN..];
    format!("{prefix}...{suffix}")
}

/// Timing-safe comparison for the redirect `state` nonce.
pub(crate) fn constant_time_eq(a: &[u8], b: &[u8]) -> bool {
    a.ct_eq(b).into()
}

#[cfg(test)]
mod tests {
    use super::{constant_time_eq, mask_token};

    #[test]
    fn mask_token_keeps_prefix_and_suffix() {
        assert_eq!(mask_token("abcdef1234567890"), "abcd...7890");
    }

    #[test]
    fn mask_token_redacts_short_values_fully() {
        assert_eq!(mask_token("abcdefg"), "*******");
        assert_eq!(mask_token(""), "");
    }

    #[test]
    fn constant_time_eq_matches_exact_bytes_only() {
        assert!(constant_time_eq(b"nonce-1", b"nonce-1"));
        assert!(!constant_time_eq(b"nonce-1", b"nonce-2"));
        assert!(!constant_time_eq(b"nonce-1", b"nonce-10"));
    }
}
