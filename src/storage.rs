//! Session credentials in the OS credential store.
//!
//! On Windows this uses the Credential Manager (via the `keyring` crate),
//! on macOS Keychain, and on Linux the Secret Service API. The bearer token
//! issued by the identity provider is only held in memory inside a
//! zeroizing buffer.

use base64::{engine::general_purpose::URL_SAFE_NO_PAD, Engine as _};
use keyring::Entry;
use serde_json::Value;
use std::fmt;
use tracing::{info, warn};
use zeroize::Zeroizing;

const SERVICE_NAME: &str = "recordbook";

// Credential keys
const KEY_API_BASE_URL: &str = "api_base_url";
const KEY_SESSION_TOKEN: &str = "session_token";

const ALL_KEYS: &[&str] = &[KEY_API_BASE_URL, KEY_SESSION_TOKEN];

// ---------------------------------------------------------------------------
// Low-level helpers
// ---------------------------------------------------------------------------

/// Retrieve a single credential from the OS keyring. Returns `None` when the
/// entry does not exist (or the platform returns a "not found" error).
pub fn get_credential(key: &str) -> Option<String> {
    let entry = match Entry::new(SERVICE_NAME, key) {
        Ok(e) => e,
        Err(e) => {
            warn!(key, error = %e, "keyring: failed to create entry");
            return None;
        }
    };
    match entry.get_password() {
        Ok(pw) => Some(pw),
        Err(keyring::Error::NoEntry) => None,
        Err(e) => {
            warn!(key, error = %e, "keyring: failed to read credential");
            None
        }
    }
}

pub fn set_credential(key: &str, value: &str) -> Result<(), keyring::Error> {
    Entry::new(SERVICE_NAME, key)?.set_password(value)
}

/// Delete a credential. Silently succeeds if the entry does not exist.
pub fn delete_credential(key: &str) -> Result<(), keyring::Error> {
    match Entry::new(SERVICE_NAME, key)?.delete_credential() {
        Ok(()) | Err(keyring::Error::NoEntry) => Ok(()),
        Err(e) => Err(e),
    }
}

// ---------------------------------------------------------------------------
// Session
// ---------------------------------------------------------------------------

/// Claims read from the session token payload. The signature is verified by
/// the server; the client only uses these for display and routing.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SessionClaims {
    pub user_id: String,
    pub role: Option<String>,
    pub expires_at: Option<i64>,
}

impl SessionClaims {
    /// Decode the payload segment of a JWT.
    ///
    /// The role is read from `role`, falling back to `metadata.role`
    /// (identity-provider public metadata).
    pub fn decode(token: &str) -> Option<Self> {
        let payload = token.split('.').nth(1)?;
        let bytes = URL_SAFE_NO_PAD.decode(payload.trim_end_matches('=')).ok()?;
        let json: Value = serde_json::from_slice(&bytes).ok()?;

        let user_id = json.get("sub").and_then(Value::as_str)?.to_string();
        let role = json
            .get("role")
            .or_else(|| json.get("metadata").and_then(|m| m.get("role")))
            .and_then(Value::as_str)
            .map(str::to_string);
        Some(Self {
            user_id,
            role,
            expires_at: json.get("exp").and_then(Value::as_i64),
        })
    }

    pub fn is_admin(&self) -> bool {
        self.role.as_deref() == Some("admin")
    }

    pub fn is_expired(&self, now_unix: i64) -> bool {
        self.expires_at.is_some_and(|exp| exp <= now_unix)
    }
}

/// Authenticated API session.
#[derive(Clone)]
pub struct Session {
    base_url: String,
    token: Zeroizing<String>,
    claims: Option<SessionClaims>,
}

impl fmt::Debug for Session {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Session")
            .field("base_url", &self.base_url)
            .field("token", &"[REDACTED]")
            .field("claims", &self.claims)
            .finish()
    }
}

impl Session {
    pub fn new(base_url: &str, token: &str) -> Self {
        Self {
            base_url: crate::api::normalize_base_url(base_url),
            token: Zeroizing::new(token.trim().to_string()),
            claims: SessionClaims::decode(token.trim()),
        }
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    pub fn token(&self) -> &str {
        self.token.as_str()
    }

    pub fn claims(&self) -> Option<&SessionClaims> {
        self.claims.as_ref()
    }

    pub fn user_id(&self) -> Option<&str> {
        self.claims.as_ref().map(|c| c.user_id.as_str())
    }

    /// Load the stored session, if both the base URL and token exist.
    pub fn load() -> Option<Self> {
        let base_url = get_credential(KEY_API_BASE_URL)?;
        let token = Zeroizing::new(get_credential(KEY_SESSION_TOKEN)?);
        if base_url.trim().is_empty() || token.trim().is_empty() {
            return None;
        }
        Some(Self::new(&base_url, &token))
    }

    pub fn store(&self) -> Result<(), keyring::Error> {
        set_credential(KEY_API_BASE_URL, &self.base_url)?;
        set_credential(KEY_SESSION_TOKEN, &self.token)?;
        info!(user_id = ?self.user_id(), "session stored in credential store");
        Ok(())
    }
}

/// Delete the stored session (sign-out).
pub fn clear_session() -> Result<(), keyring::Error> {
    info!("clearing stored session");
    for key in ALL_KEYS {
        delete_credential(key)?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn token_with(payload: Value) -> String {
        let header = URL_SAFE_NO_PAD.encode(br#"{"alg":"RS256","typ":"JWT"}"#);
        let body = URL_SAFE_NO_PAD.encode(payload.to_string());
        format!("{header}.{body}.signature")
    }

    #[test]
    fn test_decode_claims_with_top_level_role() {
        let token = token_with(json!({ "sub": "user_2abc", "role": "admin", "exp": 1_900_000_000 }));
        let claims = SessionClaims::decode(&token).unwrap();
        assert_eq!(claims.user_id, "user_2abc");
        assert!(claims.is_admin());
        assert!(!claims.is_expired(1_800_000_000));
        assert!(claims.is_expired(1_900_000_000));
    }

    #[test]
    fn test_decode_claims_with_metadata_role() {
        let token = token_with(json!({ "sub": "user_9", "metadata": { "role": "member" } }));
        let claims = SessionClaims::decode(&token).unwrap();
        assert_eq!(claims.role.as_deref(), Some("member"));
        assert!(!claims.is_admin());
        assert_eq!(claims.expires_at, None);
    }

    #[test]
    fn test_decode_rejects_garbage() {
        assert!(SessionClaims::decode("not-a-jwt").is_none());
        assert!(SessionClaims::decode("a.%%%.c").is_none());
        assert!(SessionClaims::decode(&token_with(json!({ "role": "admin" }))).is_none());
    }

    #[test]
    fn test_session_debug_redacts_token() {
        let token = token_with(json!({ "sub": "user_1" }));
        let session = Session::new("app.recordbook.io/api", &token);
        let printed = format!("{session:?}");
        assert!(!printed.contains(&token));
        assert!(printed.contains("[REDACTED]"));
        assert_eq!(session.base_url(), "https://app.recordbook.io");
        assert_eq!(session.user_id(), Some("user_1"));
    }
}
