//! Usage: Namespaced durable key/value store for tokens and flow state.
//!
//! All values live in an in-memory map guarded by a read/write lock; writers
//! take the exclusive lock, so a reader can never observe a half-written
//! bundle. When a persistence path is configured, writes go through to SQLite
//! inside the same exclusive section and the namespace is reloaded on open.

use crate::shared::error::{AuthError, AuthResult};
use crate::shared::time::now_unix_seconds;
use rusqlite::{params, Connection};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::Path;
use std::sync::{Mutex, RwLock};
use std::time::Duration;

const BUSY_TIMEOUT: Duration = Duration::from_millis(2000);

/// Well-known store keys. Everything is namespaced under the store identifier,
/// so two credential sets never collide in the same backing file.
pub(crate) mod keys {
    pub const ACCESS_TOKEN: &str = "accessToken";
    pub const ID_TOKEN: &str = "idToken";
    pub const REFRESH_TOKEN: &str = "refreshToken";
    pub const TOKEN_TYPE: &str = "tokenType";
    pub const EXPIRES_IN: &str = "expiresIn";
    pub const ISSUED_AT: &str = "issuedAt";
    pub const SCOPES: &str = "scopes";
    pub const TOKEN_URI: &str = "tokenUri";
    pub const CREATE_DATE: &str = "createDate";
    pub const SIGN_IN_REDIRECT_URI: &str = "signInRedirectUri";
    pub const SIGN_OUT_REDIRECT_URI: &str = "signOutRedirectUri";
    pub const SESSION_CREDENTIALS: &str = "sessionCredentials";
}

/// A complete set of OAuth tokens as returned by a token endpoint.
///
/// `issued_at_unix` is always set. An absent `expires_in_s` means the bundle is
/// treated as non-expiring until explicitly invalidated.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TokenBundle {
    pub access_token: String,
    pub id_token: Option<String>,
    pub refresh_token: Option<String>,
    pub token_type: String,
    pub expires_in_s: Option<i64>,
    pub issued_at_unix: i64,
    pub scopes: Option<String>,
}

impl TokenBundle {
    pub fn expires_at_unix(&self) -> Option<i64> {
        self.expires_in_s
            .map(|expires_in| self.issued_at_unix.saturating_add(expires_in))
    }

    /// Within `lead_s` of expiry, or past it. Non-expiring bundles are never
    /// stale.
    pub fn is_stale(&self, lead_s: i64, now_unix: i64) -> bool {
        match self.expires_at_unix() {
            Some(expires_at) => expires_at.saturating_sub(lead_s) <= now_unix,
            None => false,
        }
    }
}

pub struct TokenStore {
    namespace: String,
    values: RwLock<HashMap<String, String>>,
    conn: Option<Mutex<Connection>>,
}

impl TokenStore {
    /// Open a store for `namespace`. `persist_path = None` keeps it memory-only;
    /// otherwise previously persisted values for the namespace are loaded.
    pub fn open(namespace: &str, persist_path: Option<&Path>) -> AuthResult<Self> {
        let namespace = namespace.trim();
        if namespace.is_empty() {
            return Err(AuthError::invalid_input("store namespace is required"));
        }

        let mut values = HashMap::new();
        let conn = match persist_path {
            None => None,
            Some(path) => {
                let conn = Connection::open(path)?;
                conn.busy_timeout(BUSY_TIMEOUT)?;
                conn.execute_batch(
                    r#"
CREATE TABLE IF NOT EXISTS token_store (
  namespace TEXT NOT NULL,
  key TEXT NOT NULL,
  value TEXT NOT NULL,
  updated_at INTEGER NOT NULL,
  PRIMARY KEY (namespace, key)
);
"#,
                )?;

                let mut stmt =
                    conn.prepare("SELECT key, value FROM token_store WHERE namespace = ?1")?;
                let rows = stmt.query_map(params![namespace], |row| {
                    Ok((row.get::<_, String>(0)?, row.get::<_, String>(1)?))
                })?;
                for row in rows {
                    let (key, value) = row?;
                    values.insert(key, value);
                }
                drop(stmt);
                Some(Mutex::new(conn))
            }
        };

        Ok(Self {
            namespace: namespace.to_string(),
            values: RwLock::new(values),
            conn,
        })
    }

    pub fn namespace(&self) -> &str {
        &self.namespace
    }

    pub fn get(&self, key: &str) -> Option<String> {
        let values = self.values.read().unwrap_or_else(|e| e.into_inner());
        values.get(key).cloned()
    }

    pub fn set(&self, key: &str, value: &str) -> AuthResult<()> {
        self.set_many(&[(key, Some(value.to_string()))])
    }

    pub fn remove(&self, key: &str) -> AuthResult<()> {
        self.set_many(&[(key, None)])
    }

    /// Apply several key updates under one exclusive section. `None` removes
    /// the key. Persistence happens first so a failed write leaves the
    /// in-memory state untouched.
    pub fn set_many(&self, entries: &[(&str, Option<String>)]) -> AuthResult<()> {
        let mut values = self.values.write().unwrap_or_else(|e| e.into_inner());

        if let Some(conn) = &self.conn {
            let mut conn = conn.lock().unwrap_or_else(|e| e.into_inner());
            let now = now_unix_seconds();
            let tx = conn.transaction()?;
            for (key, value) in entries {
                match value {
                    Some(value) => {
                        tx.execute(
                            r#"
INSERT INTO token_store (namespace, key, value, updated_at)
VALUES (?1, ?2, ?3, ?4)
ON CONFLICT (namespace, key) DO UPDATE SET value = excluded.value, updated_at = excluded.updated_at
"#,
                            params![self.namespace, key, value, now],
                        )?;
                    }
                    None => {
                        tx.execute(
                            "DELETE FROM token_store WHERE namespace = ?1 AND key = ?2",
                            params![self.namespace, key],
                        )?;
                    }
                }
            }
            tx.commit()?;
        }

        for (key, value) in entries {
            match value {
                Some(value) => {
                    values.insert((*key).to_string(), value.clone());
                }
                None => {
                    values.remove(*key);
                }
            }
        }
        Ok(())
    }

    /// Replace the persisted token bundle wholesale. Absent optional fields are
    /// removed rather than left stale.
    pub fn set_bundle(&self, bundle: &TokenBundle) -> AuthResult<()> {
        self.set_many(&[
            (keys::ACCESS_TOKEN, Some(bundle.access_token.clone())),
            (keys::ID_TOKEN, bundle.id_token.clone()),
            (keys::REFRESH_TOKEN, bundle.refresh_token.clone()),
            (keys::TOKEN_TYPE, Some(bundle.token_type.clone())),
            (keys::EXPIRES_IN, bundle.expires_in_s.map(|v| v.to_string())),
            (keys::ISSUED_AT, Some(bundle.issued_at_unix.to_string())),
            (keys::SCOPES, bundle.scopes.clone()),
        ])
    }

    /// Read back the persisted bundle. A missing or unparsable required field
    /// reads as `None`; callers treat a partially populated bundle as "no
    /// usable tokens", never as an error.
    pub fn bundle(&self) -> Option<TokenBundle> {
        let values = self.values.read().unwrap_or_else(|e| e.into_inner());

        let access_token = non_empty(values.get(keys::ACCESS_TOKEN))?;
        let token_type = non_empty(values.get(keys::TOKEN_TYPE))?;
        let issued_at_unix = match values.get(keys::ISSUED_AT).map(|v| v.trim().parse::<i64>()) {
            Some(Ok(v)) => v,
            _ => {
                tracing::warn!(
                    namespace = %self.namespace,
                    "stored token bundle has no usable issuedAt; treating as no tokens"
                );
                return None;
            }
        };

        Some(TokenBundle {
            access_token,
            id_token: non_empty(values.get(keys::ID_TOKEN)),
            refresh_token: non_empty(values.get(keys::REFRESH_TOKEN)),
            token_type,
            expires_in_s: values
                .get(keys::EXPIRES_IN)
                .and_then(|v| v.trim().parse::<i64>().ok()),
            issued_at_unix,
            scopes: non_empty(values.get(keys::SCOPES)),
        })
    }

    /// Wipe everything in this namespace, in memory and on disk.
    pub fn clear(&self) -> AuthResult<()> {
        let mut values = self.values.write().unwrap_or_else(|e| e.into_inner());
        if let Some(conn) = &self.conn {
            let conn = conn.lock().unwrap_or_else(|e| e.into_inner());
            conn.execute(
                "DELETE FROM token_store WHERE namespace = ?1",
                params![self.namespace],
            )?;
        }
        values.clear();
        Ok(())
    }
}

fn non_empty(value: Option<&String>) -> Option<String> {
    value
        .map(|v| v.trim())
        .filter(|v| !v.is_empty())
        .map(str::to_string)
}
