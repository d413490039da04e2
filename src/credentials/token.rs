//! OAuth token and client configuration records.

use std::collections::BTreeSet;
use std::fmt;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::types::ClientId;

fn default_token_type() -> String {
    "Bearer".to_string()
}

/// Access/refresh token pair for one identity.
///
/// A token without `expires_at` never expires.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OAuthToken {
    pub access_token: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub refresh_token: Option<String>,
    #[serde(default = "default_token_type")]
    pub token_type: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub expires_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub scopes: Option<BTreeSet<String>>,
}

impl OAuthToken {
    /// Create a non-expiring bearer token.
    pub fn new(access_token: impl Into<String>) -> Self {
        Self {
            access_token: access_token.into(),
            refresh_token: None,
            token_type: default_token_type(),
            expires_at: None,
            scopes: None,
        }
    }

    pub fn with_refresh_token(mut self, refresh_token: impl Into<String>) -> Self {
        self.refresh_token = Some(refresh_token.into());
        self
    }

    pub fn with_expires_at(mut self, expires_at: DateTime<Utc>) -> Self {
        self.expires_at = Some(expires_at);
        self
    }

    /// Set the expiry relative to now, as returned by a token endpoint's `expires_in`.
    pub fn with_expires_in(mut self, expires_in: Duration) -> Self {
        let delta = chrono::Duration::from_std(expires_in).unwrap_or(chrono::Duration::MAX);
        self.expires_at = Some(Utc::now().checked_add_signed(delta).unwrap_or(DateTime::<Utc>::MAX_UTC));
        self
    }

    pub fn with_scopes<I, S>(mut self, scopes: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.scopes = Some(scopes.into_iter().map(Into::into).collect());
        self
    }

    /// Whether the token is expired at `now`. The boundary instant counts as expired.
    pub fn is_expired_at(&self, now: DateTime<Utc>) -> bool {
        match self.expires_at {
            Some(expires_at) => now >= expires_at,
            None => false,
        }
    }

    pub fn is_expired(&self) -> bool {
        self.is_expired_at(Utc::now())
    }

    /// Non-empty access token that has not expired.
    pub fn is_valid(&self) -> bool {
        !self.access_token.is_empty() && !self.is_expired()
    }

    /// Whether the token expires within `window` from now (or already has).
    pub fn expires_within(&self, window: Duration) -> bool {
        match self.expires_at {
            Some(expires_at) => {
                let delta = chrono::Duration::from_std(window).unwrap_or(chrono::Duration::MAX);
                match Utc::now().checked_add_signed(delta) {
                    Some(horizon) => horizon >= expires_at,
                    None => true,
                }
            }
            None => false,
        }
    }

    /// Scopes from `required` that this token does not carry.
    ///
    /// A token without recorded scopes is treated as carrying none.
    pub fn missing_scopes<'a, I>(&self, required: I) -> Vec<String>
    where
        I: IntoIterator<Item = &'a str>,
    {
        required
            .into_iter()
            .filter(|scope| {
                !self
                    .scopes
                    .as_ref()
                    .is_some_and(|granted| granted.contains(*scope))
            })
            .map(str::to_string)
            .collect()
    }
}

impl fmt::Debug for OAuthToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("OAuthToken")
            .field("access_token", &"[REDACTED]")
            .field(
                "refresh_token",
                &self.refresh_token.as_ref().map(|_| "[REDACTED]"),
            )
            .field("token_type", &self.token_type)
            .field("expires_at", &self.expires_at)
            .field("scopes", &self.scopes)
            .finish()
    }
}

fn default_auth_uri() -> String {
    "https://accounts.google.com/o/oauth2/auth".to_string()
}

fn default_token_uri() -> String {
    "https://oauth2.googleapis.com/token".to_string()
}

/// The single OAuth client registration shared by every identity.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OAuthClientInfo {
    pub client_id: ClientId,
    pub client_secret: String,
    #[serde(default)]
    pub redirect_uris: Vec<String>,
    #[serde(default = "default_auth_uri")]
    pub auth_uri: String,
    #[serde(default = "default_token_uri")]
    pub token_uri: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub revoke_uri: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub userinfo_uri: Option<String>,
}

impl OAuthClientInfo {
    /// Client registration using Google's OAuth endpoints.
    pub fn google(
        client_id: impl Into<ClientId>,
        client_secret: impl Into<String>,
        redirect_uris: Vec<String>,
    ) -> Self {
        Self {
            client_id: client_id.into(),
            client_secret: client_secret.into(),
            redirect_uris,
            auth_uri: default_auth_uri(),
            token_uri: default_token_uri(),
            revoke_uri: Some("https://oauth2.googleapis.com/revoke".to_string()),
            userinfo_uri: Some("https://www.googleapis.com/oauth2/v3/userinfo".to_string()),
        }
    }
}

impl fmt::Debug for OAuthClientInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("OAuthClientInfo")
            .field("client_id", &self.client_id)
            .field("client_secret", &"[REDACTED]")
            .field("redirect_uris", &self.redirect_uris)
            .field("auth_uri", &self.auth_uri)
            .field("token_uri", &self.token_uri)
            .field("revoke_uri", &self.revoke_uri)
            .field("userinfo_uri", &self.userinfo_uri)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_token_without_expiry_never_expires() {
        let token = OAuthToken::new("ya29.access");
        assert!(!token.is_expired());
        assert!(token.is_valid());
        assert_eq!(token.token_type, "Bearer");
    }

    #[test]
    fn test_token_expired_at_boundary() {
        let expires_at = Utc::now();
        let token = OAuthToken::new("ya29.access").with_expires_at(expires_at);

        assert!(token.is_expired_at(expires_at));
        assert!(!token.is_expired_at(expires_at - chrono::Duration::milliseconds(1)));
        assert!(token.is_expired_at(expires_at + chrono::Duration::milliseconds(1)));
    }

    #[test]
    fn test_empty_access_token_is_invalid() {
        let token = OAuthToken::new("");
        assert!(!token.is_valid());
    }

    #[test]
    fn test_expired_token_is_invalid() {
        let token = OAuthToken::new("ya29.access")
            .with_expires_at(Utc::now() - chrono::Duration::seconds(5));
        assert!(token.is_expired());
        assert!(!token.is_valid());
    }

    #[test]
    fn test_expires_within() {
        let token = OAuthToken::new("ya29.access").with_expires_in(Duration::from_secs(60));
        assert!(token.expires_within(Duration::from_secs(120)));
        assert!(!token.expires_within(Duration::from_secs(10)));
        assert!(!OAuthToken::new("x").expires_within(Duration::from_secs(3600)));
    }

    #[test]
    fn test_missing_scopes() {
        let token = OAuthToken::new("ya29.access").with_scopes(["email", "drive"]);
        assert_eq!(
            token.missing_scopes(["email", "gmail.send"]),
            vec!["gmail.send".to_string()]
        );
        assert!(token.missing_scopes(["drive"]).is_empty());

        let unscoped = OAuthToken::new("ya29.access");
        assert_eq!(unscoped.missing_scopes(["email"]), vec!["email".to_string()]);
    }

    #[test]
    fn test_debug_redacts_secrets() {
        let token = OAuthToken::new("ya29.super-secret").with_refresh_token("1//refresh-secret");
        let debug = format!("{:?}", token);
        assert!(!debug.contains("super-secret"));
        assert!(!debug.contains("refresh-secret"));

        let client = OAuthClientInfo::google("client-id", "client-secret-value", vec![]);
        let debug = format!("{:?}", client);
        assert!(debug.contains("client-id"));
        assert!(!debug.contains("client-secret-value"));
    }

    #[test]
    fn test_token_deserialization_defaults() {
        let json = r#"{"access_token": "ya29.abc"}"#;
        let token: OAuthToken = serde_json::from_str(json).unwrap();
        assert_eq!(token.token_type, "Bearer");
        assert!(token.refresh_token.is_none());
        assert!(token.expires_at.is_none());
        assert!(token.scopes.is_none());
    }

    #[test]
    fn test_client_info_deserialization_defaults() {
        let json = r#"{"client_id": "abc.apps.googleusercontent.com", "client_secret": "s"}"#;
        let info: OAuthClientInfo = serde_json::from_str(json).unwrap();
        assert_eq!(info.client_id.as_str(), "abc.apps.googleusercontent.com");
        assert_eq!(info.token_uri, "https://oauth2.googleapis.com/token");
        assert!(info.redirect_uris.is_empty());
    }
}
