//! Bearer token extraction and classification.

use std::fmt;

use base64::Engine;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use sha2::{Digest, Sha256};

/// Shortest string accepted as a bearer token.
pub const MIN_TOKEN_LEN: usize = 20;

/// Longest string accepted as a bearer token.
pub const MAX_TOKEN_LEN: usize = 2048;

/// Prefix of Google OAuth access tokens.
const GOOGLE_ACCESS_TOKEN_PREFIX: &str = "ya29.";

/// Hex characters kept in a token fingerprint.
const FINGERPRINT_LEN: usize = 12;

/// Pull the raw token out of an `Authorization` header value.
///
/// Accepts `Bearer <token>` (scheme matched case-insensitively) or a bare
/// token. The token must be 20 to 2048 characters with no whitespace;
/// anything else yields `None`.
pub fn extract_bearer_token(header: &str) -> Option<&str> {
    let value = header.trim();
    let token = match value.get(..7) {
        Some(scheme) if scheme.eq_ignore_ascii_case("bearer ") => value[7..].trim_start(),
        _ => value,
    };

    let len = token.chars().count();
    if !(MIN_TOKEN_LEN..=MAX_TOKEN_LEN).contains(&len) {
        return None;
    }
    if token.chars().any(char::is_whitespace) {
        return None;
    }
    Some(token)
}

/// Short stable digest used to refer to a token in logs.
pub fn token_fingerprint(token: &str) -> String {
    let digest = format!("{:x}", Sha256::digest(token.as_bytes()));
    digest[..FINGERPRINT_LEN].to_string()
}

/// Which issuer a bearer token appears to come from, judged by its shape alone.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TokenProvider {
    /// Opaque Google OAuth access token (`ya29.` prefix).
    Google,
    /// Three-segment JSON Web Token.
    Jwt,
    Unknown,
}

impl TokenProvider {
    pub fn detect(token: &str) -> Self {
        if token.starts_with(GOOGLE_ACCESS_TOKEN_PREFIX) {
            Self::Google
        } else if looks_like_jwt(token) {
            Self::Jwt
        } else {
            Self::Unknown
        }
    }

    /// Tokens issued by a provider this gateway holds OAuth credentials for.
    pub fn is_first_party(&self) -> bool {
        matches!(self, Self::Google)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Google => "google",
            Self::Jwt => "jwt",
            Self::Unknown => "unknown",
        }
    }
}

impl fmt::Display for TokenProvider {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

fn looks_like_jwt(token: &str) -> bool {
    let segments: Vec<&str> = token.split('.').collect();
    segments.len() == 3 && segments.iter().all(|s| !s.is_empty())
}

/// Decode the payload of a JWT without checking its signature.
///
/// Only used to read descriptive claims after some other party has vouched
/// for the token. Returns `None` for anything that is not a JWT with a JSON
/// object payload.
pub fn decode_unverified_claims(token: &str) -> Option<Map<String, Value>> {
    if !looks_like_jwt(token) {
        return None;
    }
    let payload = token.split('.').nth(1)?;
    let bytes = URL_SAFE_NO_PAD.decode(payload.trim_end_matches('=')).ok()?;
    match serde_json::from_slice(&bytes).ok()? {
        Value::Object(claims) => Some(claims),
        _ => None,
    }
}
