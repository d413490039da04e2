//! User-actionable authentication error descriptors.
//!
//! Every failure the auth core surfaces to a person or a client maps to one
//! [`AuthErrorKind`]. An [`AuthErrorGuidance`] pairs the kind with a title,
//! an explanation and a recommended action, and renders either as terminal
//! text ([`AuthErrorGuidance::format`]) or as a machine-readable record
//! ([`AuthErrorGuidance::to_structured`]).
//!
//! Technical detail is always passed through [`redact_secrets`] so raw token
//! values never reach the user.

use std::sync::LazyLock;
use std::time::Duration;

use regex::Regex;
use serde::Serialize;

use crate::error::StaleCredentialError;

/// Replacement text for redacted secrets.
pub const REDACTED: &str = "[REDACTED]";

/// Closed set of authentication failure categories.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AuthErrorKind {
    TokenExpired,
    TokenRevoked,
    /// The token lacks these scopes.
    InsufficientScopes { missing: Vec<String> },
    ClientNotConfigured,
    SessionAlreadyBound,
    /// OAuth callback state did not match the pending request.
    InvalidState,
    CallbackTimeout,
    NetworkError,
    Generic,
}

impl AuthErrorKind {
    /// Stable machine-readable code.
    pub fn code(&self) -> &'static str {
        match self {
            Self::TokenExpired => "token_expired",
            Self::TokenRevoked => "token_revoked",
            Self::InsufficientScopes { .. } => "insufficient_scopes",
            Self::ClientNotConfigured => "client_not_configured",
            Self::SessionAlreadyBound => "session_already_bound",
            Self::InvalidState => "invalid_state",
            Self::CallbackTimeout => "callback_timeout",
            Self::NetworkError => "network_error",
            Self::Generic => "generic",
        }
    }

    fn emoji(&self) -> &'static str {
        match self {
            Self::TokenExpired => "⏰",
            Self::TokenRevoked => "🚫",
            Self::InsufficientScopes { .. } => "🔒",
            Self::ClientNotConfigured => "⚙️",
            Self::SessionAlreadyBound => "👥",
            Self::InvalidState => "🛡️",
            Self::CallbackTimeout => "⌛",
            Self::NetworkError => "🌐",
            Self::Generic => "❌",
        }
    }
}

/// A structured, user-actionable description of an auth failure.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AuthErrorGuidance {
    pub kind: AuthErrorKind,
    pub title: String,
    pub message: String,
    pub action: String,
    pub technical_detail: Option<String>,
    pub help_url: Option<String>,
}

/// Serializable form for machine-readable error channels.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct StructuredAuthError {
    pub error_type: &'static str,
    pub title: String,
    pub message: String,
    pub action: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub technical_detail: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub help_url: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub missing_scopes: Option<Vec<String>>,
}

impl AuthErrorGuidance {
    fn new(
        kind: AuthErrorKind,
        title: impl Into<String>,
        message: impl Into<String>,
        action: impl Into<String>,
    ) -> Self {
        Self {
            kind,
            title: title.into(),
            message: message.into(),
            action: action.into(),
            technical_detail: None,
            help_url: None,
        }
    }

    pub fn token_expired(identity: Option<&str>) -> Self {
        let message = match identity {
            Some(identity) => format!("The stored access token for {} has expired.", identity),
            None => "The stored access token has expired.".to_string(),
        };
        Self::new(
            AuthErrorKind::TokenExpired,
            "Authentication Expired",
            message,
            "Re-authenticate to obtain a fresh token, then retry the operation.",
        )
    }

    pub fn token_revoked(identity: Option<&str>) -> Self {
        let message = match identity {
            Some(identity) => format!(
                "Access for {} was revoked by the provider or the refresh token is no longer valid.",
                identity
            ),
            None => "Access was revoked by the provider or the refresh token is no longer valid."
                .to_string(),
        };
        Self::new(
            AuthErrorKind::TokenRevoked,
            "Access Revoked",
            message,
            "Start the authorization flow again and grant access to the requested services.",
        )
        .with_help_url("https://myaccount.google.com/permissions")
    }

    pub fn insufficient_scopes<I, S>(missing: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let missing: Vec<String> = missing.into_iter().map(Into::into).collect();
        let message = format!(
            "The current token does not grant the required permission(s): {}.",
            missing.join(", ")
        );
        Self::new(
            AuthErrorKind::InsufficientScopes { missing },
            "Insufficient Permissions",
            message,
            "Re-authenticate and approve the additional permissions when prompted.",
        )
        .with_help_url("https://developers.google.com/identity/protocols/oauth2/scopes")
    }

    pub fn client_not_configured() -> Self {
        Self::new(
            AuthErrorKind::ClientNotConfigured,
            "OAuth Client Not Configured",
            "No OAuth client id and secret are configured for this gateway.",
            "Create OAuth client credentials with your provider and store them in the gateway configuration.",
        )
        .with_help_url("https://console.cloud.google.com/apis/credentials")
    }

    pub fn session_already_bound() -> Self {
        Self::new(
            AuthErrorKind::SessionAlreadyBound,
            "Session Already In Use",
            "This session is already bound to a different account.",
            "Start a new session to act as a different account.",
        )
    }

    pub fn invalid_state() -> Self {
        Self::new(
            AuthErrorKind::InvalidState,
            "Authorization Could Not Be Verified",
            "The authorization callback did not match a pending request. It may be stale or forged.",
            "Restart the authorization flow from the beginning.",
        )
    }

    pub fn callback_timeout(timeout: Duration) -> Self {
        Self::new(
            AuthErrorKind::CallbackTimeout,
            "Authorization Timed Out",
            format!(
                "No authorization callback was received within {} seconds.",
                timeout.as_secs()
            ),
            "Open the authorization link again and complete it promptly.",
        )
    }

    pub fn network_error(detail: impl Into<String>) -> Self {
        Self::new(
            AuthErrorKind::NetworkError,
            "Network Error",
            "The identity provider could not be reached.",
            "Check your network connection and retry.",
        )
        .with_technical_detail(detail)
    }

    pub fn generic(message: impl Into<String>) -> Self {
        Self::new(
            AuthErrorKind::Generic,
            "Authentication Error",
            message,
            "Retry the operation. If it keeps failing, re-authenticate.",
        )
    }

    /// Replace the recommended action.
    pub fn with_action(mut self, action: impl Into<String>) -> Self {
        self.action = action.into();
        self
    }

    /// Attach technical detail. Secrets are redacted.
    pub fn with_technical_detail(mut self, detail: impl Into<String>) -> Self {
        self.technical_detail = Some(redact_secrets(&detail.into()));
        self
    }

    pub fn with_help_url(mut self, url: impl Into<String>) -> Self {
        self.help_url = Some(url.into());
        self
    }

    /// Render for a human terminal.
    pub fn format(&self, include_technical: bool, use_emojis: bool) -> String {
        let mut out = String::new();

        if use_emojis {
            out.push_str(self.kind.emoji());
            out.push(' ');
        } else {
            out.push_str("Error: ");
        }
        out.push_str(&self.title);
        out.push('\n');
        out.push_str(&self.message);
        out.push('\n');

        out.push_str(if use_emojis { "💡 " } else { "Action: " });
        out.push_str(&self.action);

        if include_technical && let Some(detail) = &self.technical_detail {
            out.push('\n');
            out.push_str(if use_emojis { "🔧 " } else { "Technical details: " });
            out.push_str(detail);
        }

        if let Some(url) = &self.help_url {
            out.push('\n');
            out.push_str(if use_emojis { "🔗 " } else { "Help: " });
            out.push_str(url);
        }

        out
    }

    /// Render for a machine-readable channel.
    pub fn to_structured(&self) -> StructuredAuthError {
        let missing_scopes = match &self.kind {
            AuthErrorKind::InsufficientScopes { missing } => Some(missing.clone()),
            _ => None,
        };

        StructuredAuthError {
            error_type: self.kind.code(),
            title: self.title.clone(),
            message: self.message.clone(),
            action: self.action.clone(),
            technical_detail: self.technical_detail.clone(),
            help_url: self.help_url.clone(),
            missing_scopes,
        }
    }
}

impl From<&StaleCredentialError> for AuthErrorGuidance {
    fn from(err: &StaleCredentialError) -> Self {
        let identity = err.identity.as_ref().map(|i| i.as_str());
        let base = if err.last_error.to_lowercase().contains("revoked") {
            Self::token_revoked(identity)
        } else {
            Self::token_expired(identity)
        };
        base.with_technical_detail(err.last_error.clone())
    }
}

impl std::fmt::Display for AuthErrorGuidance {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.format(false, false))
    }
}

static TOKEN_LIKE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"[A-Za-z0-9\-._~+/]{20,}=*").expect("token pattern is a valid regex")
});

/// Unbroken alphanumeric run at which a candidate counts as a secret.
const MIN_SECRET_SEGMENT: usize = 20;

/// Candidate length from which mixed-case alphanumerics count as a secret
/// even when separators break them into short pieces.
const MIN_MIXED_SECRET_LEN: usize = 32;

/// Replace token-like substrings with [`REDACTED`].
///
/// A run of token characters (`A-Z a-z 0-9 - . _ ~ + /`) is a secret when
/// it holds an alphanumeric segment of 20 or more characters, or when it is
/// at least 32 characters long and mixes upper case, lower case and digits.
/// The second rule skips URL authorities and paths (runs starting with
/// `//`). Words, identifiers, hostnames, emails and URLs pass through.
pub fn redact_secrets(text: &str) -> String {
    TOKEN_LIKE
        .replace_all(text, |caps: &regex::Captures<'_>| {
            let candidate = &caps[0];
            if looks_like_secret(candidate) {
                REDACTED.to_string()
            } else {
                candidate.to_string()
            }
        })
        .into_owned()
}

fn looks_like_secret(candidate: &str) -> bool {
    let long_segment = candidate
        .split(|c: char| !c.is_ascii_alphanumeric())
        .any(|segment| segment.len() >= MIN_SECRET_SEGMENT);
    if long_segment {
        return true;
    }

    candidate.len() >= MIN_MIXED_SECRET_LEN
        && !candidate.starts_with("//")
        && candidate.chars().any(|c| c.is_ascii_uppercase())
        && candidate.chars().any(|c| c.is_ascii_lowercase())
        && candidate.chars().any(|c| c.is_ascii_digit())
}

/// Replace every occurrence of a known secret with [`REDACTED`].
pub fn redact_token(text: &str, token: &str) -> String {
    if token.is_empty() {
        return text.to_string();
    }
    text.replace(token, REDACTED)
}
