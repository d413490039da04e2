//! Resolve the identity behind one inbound request.
//!
//! Resolution order, first match wins:
//!
//! 1. An identity already recorded on the request state.
//! 2. A bearer token from the `Authorization` header, classified by shape
//!    and checked by the [`TokenVerifier`]. A verified token is bound to the
//!    request's session. A first-party token that fails verification is
//!    kept as an unverified credential.
//! 3. On single-user transports: the identity hint if it has a live
//!    session, else the registry's only live session.
//! 4. An existing binding for the request's session id.
//!
//! Otherwise the request stays unauthenticated. Resolution never fails;
//! operations that need an identity call [`RequestAuthState::require_identity`].

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use http::HeaderMap;
use http::header::AUTHORIZATION;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::auth::bearer::{
    TokenProvider, decode_unverified_claims, extract_bearer_token, token_fingerprint,
};
use crate::auth::verifier::{
    TokenVerifier, VerifiedAuth, VerifyError, claim_audience, claim_scopes, claim_str,
    claim_timestamp,
};
use crate::error::GatewayError;
use crate::guidance::{redact_secrets, redact_token};
use crate::session::{BindOptions, SessionRegistry};
use crate::types::{Identity, SessionId};

/// Inputs the transport supplies for one request.
#[derive(Debug, Clone, Default)]
pub struct TransportContext {
    pub headers: HeaderMap,
    pub session_id: Option<SessionId>,
    /// Local single-tenant transport such as stdio.
    pub single_user: bool,
    /// Identity the caller claims to be acting as, if any.
    pub identity_hint: Option<Identity>,
}

impl TransportContext {
    pub fn http(headers: HeaderMap) -> Self {
        Self {
            headers,
            ..Default::default()
        }
    }

    pub fn stdio() -> Self {
        Self {
            single_user: true,
            ..Default::default()
        }
    }

    pub fn with_session_id(mut self, session_id: impl Into<SessionId>) -> Self {
        self.session_id = Some(session_id.into());
        self
    }

    pub fn with_identity_hint(mut self, identity: impl Into<Identity>) -> Self {
        self.identity_hint = Some(identity.into());
        self
    }

    pub fn with_bearer_token(mut self, token: &str) -> Self {
        if let Ok(value) = format!("Bearer {}", token).parse::<http::HeaderValue>() {
            self.headers.insert(AUTHORIZATION, value);
        }
        self
    }

    pub fn authorization(&self) -> Option<&str> {
        self.headers
            .get(AUTHORIZATION)
            .and_then(|v| v.to_str().ok())
    }
}

/// How an identity was established, strongest first.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AuthMethod {
    /// Bearer token accepted by the verifier.
    Bearer,
    /// Identity hint matched a live session on a single-user transport.
    IdentityHint,
    /// Only live session on a single-user transport.
    SingleSession,
    /// Session id was bound by an earlier request.
    SessionBinding,
}

impl AuthMethod {
    /// Whether a credential was cryptographically or remotely checked.
    pub fn is_verified(&self) -> bool {
        matches!(self, Self::Bearer)
    }
}

/// Descriptive claims of a verified token.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TokenMetadata {
    pub issuer: Option<String>,
    pub audience: Vec<String>,
    pub subject: Option<String>,
    pub expires_at: Option<DateTime<Utc>>,
    pub scopes: Vec<String>,
    pub client_id: Option<String>,
}

impl TokenMetadata {
    /// Structured verifier fields take precedence over raw claims, which take
    /// precedence over the token's own payload.
    fn derive(verified: &VerifiedAuth, token: &str) -> Self {
        let payload = decode_unverified_claims(token).unwrap_or_default();
        let claims = &verified.claims;

        let subject = Some(verified.sub.clone())
            .filter(|s| !s.is_empty())
            .or_else(|| claim_str(&payload, "sub"));

        let mut audience = claim_audience(claims);
        if audience.is_empty() {
            audience = claim_audience(&payload);
        }

        let mut scopes = verified.scopes.clone();
        if scopes.is_empty() {
            scopes = claim_scopes(claims);
        }
        if scopes.is_empty() {
            scopes = claim_scopes(&payload);
        }

        Self {
            issuer: claim_str(claims, "iss").or_else(|| claim_str(&payload, "iss")),
            audience,
            subject,
            expires_at: verified
                .expires_at
                .or_else(|| claim_timestamp(claims, "exp"))
                .or_else(|| claim_timestamp(&payload, "exp")),
            scopes,
            client_id: verified
                .client_id
                .clone()
                .or_else(|| claim_str(&payload, "client_id")),
        }
    }
}

/// The request's established identity.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AuthenticatedRequest {
    pub identity: Identity,
    pub method: AuthMethod,
    /// Set for bearer authentication.
    pub provider: Option<TokenProvider>,
    pub metadata: Option<TokenMetadata>,
}

/// A first-party token the verifier could not vouch for.
#[derive(Clone)]
pub struct UnverifiedCredential {
    pub provider: TokenProvider,
    pub fingerprint: String,
    token: String,
}

impl UnverifiedCredential {
    /// The raw token, for passing on to the provider's own API.
    pub fn token(&self) -> &str {
        &self.token
    }
}

impl fmt::Debug for UnverifiedCredential {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("UnverifiedCredential")
            .field("provider", &self.provider)
            .field("fingerprint", &self.fingerprint)
            .finish_non_exhaustive()
    }
}

/// Per-request authentication state shared between middleware and handlers.
#[derive(Debug, Clone, Default)]
pub struct RequestAuthState {
    pub authenticated: Option<AuthenticatedRequest>,
    pub unverified: Option<UnverifiedCredential>,
}

impl RequestAuthState {
    pub fn identity(&self) -> Option<&Identity> {
        self.authenticated.as_ref().map(|a| &a.identity)
    }

    /// The identity, or [`GatewayError::NotAuthenticated`].
    pub fn require_identity(&self) -> Result<&Identity, GatewayError> {
        self.identity().ok_or(GatewayError::NotAuthenticated)
    }

    pub fn is_authenticated(&self) -> bool {
        self.authenticated.is_some()
    }
}

/// What [`RequestAuthenticator::authenticate`] did.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AuthOutcome {
    /// The state already carried an identity.
    AlreadyAuthenticated,
    Authenticated(AuthMethod),
    /// No identity; an unverified first-party credential was recorded.
    Unverified,
    Unauthenticated,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuthenticatorConfig {
    /// Upper bound on one verifier call.
    #[serde(default = "default_verify_timeout_seconds")]
    pub verify_timeout_seconds: u64,
    /// JWKS endpoint for RS256 JWT verification.
    #[serde(default)]
    pub jwks_url: Option<String>,
    #[serde(default)]
    pub jwt_issuer: Option<String>,
    #[serde(default)]
    pub jwt_audience: Option<String>,
    #[serde(default = "default_jwks_cache_seconds")]
    pub jwks_cache_seconds: u64,
    #[serde(default = "default_allow_stale_jwks")]
    pub allow_stale_jwks: bool,
    /// Google `tokeninfo` endpoint for opaque Google access tokens.
    #[serde(default)]
    pub google_tokeninfo_url: Option<String>,
    /// OAuth client id Google tokens must be issued to.
    #[serde(default)]
    pub google_client_id: Option<String>,
}

fn default_verify_timeout_seconds() -> u64 {
    10
}

fn default_jwks_cache_seconds() -> u64 {
    crate::auth::jwks::DEFAULT_JWKS_CACHE_TTL_SECONDS
}

fn default_allow_stale_jwks() -> bool {
    true
}

impl Default for AuthenticatorConfig {
    fn default() -> Self {
        Self {
            verify_timeout_seconds: default_verify_timeout_seconds(),
            jwks_url: None,
            jwt_issuer: None,
            jwt_audience: None,
            jwks_cache_seconds: default_jwks_cache_seconds(),
            allow_stale_jwks: default_allow_stale_jwks(),
            google_tokeninfo_url: None,
            google_client_id: None,
        }
    }
}

impl AuthenticatorConfig {
    pub fn verify_timeout(&self) -> Duration {
        Duration::from_secs(self.verify_timeout_seconds)
    }
}

/// Resolves request identities against a verifier and a [`SessionRegistry`].
#[derive(Clone)]
pub struct RequestAuthenticator {
    verifier: Option<Arc<dyn TokenVerifier>>,
    sessions: SessionRegistry,
    verify_timeout: Duration,
}

impl RequestAuthenticator {
    pub fn new(sessions: SessionRegistry) -> Self {
        Self {
            verifier: None,
            sessions,
            verify_timeout: Duration::from_secs(default_verify_timeout_seconds()),
        }
    }

    pub fn with_verifier(mut self, verifier: Arc<dyn TokenVerifier>) -> Self {
        self.verifier = Some(verifier);
        self
    }

    pub fn with_verify_timeout(mut self, timeout: Duration) -> Self {
        self.verify_timeout = timeout;
        self
    }

    pub fn sessions(&self) -> &SessionRegistry {
        &self.sessions
    }

    pub async fn authenticate(
        &self,
        ctx: &TransportContext,
        state: &mut RequestAuthState,
    ) -> AuthOutcome {
        if state.is_authenticated() {
            return AuthOutcome::AlreadyAuthenticated;
        }

        if let Some(token) = ctx.authorization().and_then(extract_bearer_token)
            && let Some(auth) = self.authenticate_bearer(token, ctx, state).await
        {
            state.authenticated = Some(auth);
            return AuthOutcome::Authenticated(AuthMethod::Bearer);
        }

        if ctx.single_user
            && let Some(identity) = self.resolve_single_user(ctx).await
        {
            return self.adopt(state, identity);
        }

        if let Some(session_id) = &ctx.session_id
            && let Some(identity) = self.sessions.get_identity(session_id.as_str()).await
        {
            debug!(session_id = %session_id, identity = %identity, "Authenticated from session binding");
            return self.adopt(state, (identity, AuthMethod::SessionBinding));
        }

        if state.unverified.is_some() {
            AuthOutcome::Unverified
        } else {
            AuthOutcome::Unauthenticated
        }
    }

    fn adopt(&self, state: &mut RequestAuthState, (identity, method): (Identity, AuthMethod)) -> AuthOutcome {
        state.authenticated = Some(AuthenticatedRequest {
            identity,
            method,
            provider: None,
            metadata: None,
        });
        AuthOutcome::Authenticated(method)
    }

    async fn authenticate_bearer(
        &self,
        token: &str,
        ctx: &TransportContext,
        state: &mut RequestAuthState,
    ) -> Option<AuthenticatedRequest> {
        let provider = TokenProvider::detect(token);
        let fingerprint = token_fingerprint(token);

        let verified = match self.verify(token, provider).await {
            Ok(verified) => verified,
            Err(e) => {
                let reason = redact_secrets(&redact_token(&e.to_string(), token));
                if provider.is_first_party() {
                    debug!(
                        "Keeping unverified {} token {}: {}",
                        provider, fingerprint, reason
                    );
                    state.unverified = Some(UnverifiedCredential {
                        provider,
                        fingerprint,
                        token: token.to_string(),
                    });
                } else {
                    debug!("Bearer token {} not accepted: {}", fingerprint, reason);
                }
                return None;
            }
        };

        let Some(identity) = identity_for(&verified, provider) else {
            warn!("Verified token {} carries no usable identity", fingerprint);
            return None;
        };

        let metadata = TokenMetadata::derive(&verified, token);
        if let Some(session_id) = &ctx.session_id
            && !self
                .sessions
                .bind(session_id.as_str(), identity.as_str(), BindOptions::default())
                .await
        {
            warn!(
                session_id = %session_id,
                "Session is bound to another identity; keeping bearer authentication for this request only"
            );
        }

        info!(identity = %identity, provider = %provider, "Authenticated bearer token {}", fingerprint);
        Some(AuthenticatedRequest {
            identity,
            method: AuthMethod::Bearer,
            provider: Some(provider),
            metadata: Some(metadata),
        })
    }

    async fn verify(&self, token: &str, provider: TokenProvider) -> Result<VerifiedAuth, VerifyError> {
        let Some(verifier) = &self.verifier else {
            return Err(VerifyError::Unsupported(provider));
        };
        match tokio::time::timeout(self.verify_timeout, verifier.verify(token, provider)).await {
            Ok(result) => result,
            Err(_) => Err(VerifyError::Timeout(self.verify_timeout)),
        }
    }

    /// Identity for a single-user transport.
    ///
    /// Falling back to the only live session trusts whoever can reach the
    /// transport. Only single-user transports set the flag.
    async fn resolve_single_user(&self, ctx: &TransportContext) -> Option<(Identity, AuthMethod)> {
        if let Some(hint) = &ctx.identity_hint
            && self.sessions.has_live_session_for(hint.as_str()).await
        {
            debug!(identity = %hint, "Authenticated from identity hint");
            return Some((hint.clone(), AuthMethod::IdentityHint));
        }

        let mut live = self.sessions.live_sessions().await;
        if live.len() == 1 {
            let (session_id, identity) = live.remove(0);
            debug!(session_id = %session_id, identity = %identity, "Defaulting to the only live session");
            return Some((identity, AuthMethod::SingleSession));
        }
        None
    }
}

/// Email claim first, then the provider's own notion of who the subject is.
fn identity_for(verified: &VerifiedAuth, provider: TokenProvider) -> Option<Identity> {
    let non_empty = |value: Option<String>| value.filter(|s| !s.trim().is_empty());

    if let Some(email) = non_empty(verified.email.clone())
        .or_else(|| non_empty(claim_str(&verified.claims, "email")))
    {
        return Some(Identity::new(email));
    }

    let sub = || non_empty(Some(verified.sub.clone()));

    let fallback = match provider {
        TokenProvider::Jwt => {
            non_empty(claim_str(&verified.claims, "preferred_username")).or_else(sub)
        }
        TokenProvider::Google => sub(),
        TokenProvider::Unknown => sub().or_else(|| non_empty(verified.client_id.clone())),
    };
    fallback.map(Identity::new)
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use base64::Engine;
    use base64::engine::general_purpose::URL_SAFE_NO_PAD;
    use serde_json::{Map, Value, json};
    use std::sync::atomic::{AtomicUsize, Ordering};

    const GOOD_TOKEN: &str = "ya29.good-google-access-token";
    const BAD_GOOGLE_TOKEN: &str = "ya29.revoked-google-access-token";
    const OPAQUE_TOKEN: &str = "opaque-token-0123456789abcdef";

    /// Accepts [`GOOD_TOKEN`] and JWTs whose payload has `"valid": true`.
    #[derive(Default)]
    struct FakeVerifier {
        calls: AtomicUsize,
    }

    #[async_trait]
    impl TokenVerifier for FakeVerifier {
        async fn verify(&self, token: &str, provider: TokenProvider) -> Result<VerifiedAuth, VerifyError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if token == GOOD_TOKEN {
                return VerifiedAuth::from_claims(obj(json!({
                    "sub": "google-sub-1",
                    "email": "a@example.com",
                    "scope": "openid email"
                })));
            }
            if provider == TokenProvider::Jwt
                && let Some(claims) = decode_unverified_claims(token)
                && claims.get("valid") == Some(&Value::Bool(true))
            {
                // No structured fields; metadata must come from the token payload.
                return Ok(VerifiedAuth {
                    sub: claim_str(&claims, "sub").unwrap_or_default(),
                    email: None,
                    claims: Map::new(),
                    scopes: Vec::new(),
                    client_id: None,
                    expires_at: None,
                });
            }
            Err(VerifyError::Rejected("bad token".to_string()))
        }
    }

    struct SlowVerifier;

    #[async_trait]
    impl TokenVerifier for SlowVerifier {
        async fn verify(&self, _token: &str, _provider: TokenProvider) -> Result<VerifiedAuth, VerifyError> {
            tokio::time::sleep(Duration::from_secs(60)).await;
            Err(VerifyError::Rejected("unreachable".to_string()))
        }
    }

    fn obj(value: Value) -> Map<String, Value> {
        match value {
            Value::Object(map) => map,
            _ => unreachable!(),
        }
    }

    fn jwt(payload: Value) -> String {
        format!(
            "{}.{}.sig",
            URL_SAFE_NO_PAD.encode(r#"{"alg":"RS256","typ":"JWT"}"#),
            URL_SAFE_NO_PAD.encode(payload.to_string())
        )
    }

    fn authenticator() -> (RequestAuthenticator, Arc<FakeVerifier>) {
        let verifier = Arc::new(FakeVerifier::default());
        let auth = RequestAuthenticator::new(SessionRegistry::default()).with_verifier(verifier.clone());
        (auth, verifier)
    }

    #[tokio::test]
    async fn test_verified_bearer_binds_session() {
        let (auth, _) = authenticator();
        let ctx = TransportContext::default()
            .with_bearer_token(GOOD_TOKEN)
            .with_session_id("s1");
        let mut state = RequestAuthState::default();

        let outcome = auth.authenticate(&ctx, &mut state).await;

        assert_eq!(outcome, AuthOutcome::Authenticated(AuthMethod::Bearer));
        let authed = state.authenticated.as_ref().unwrap();
        assert_eq!(authed.identity, Identity::new("a@example.com"));
        assert_eq!(authed.provider, Some(TokenProvider::Google));
        assert_eq!(authed.metadata.as_ref().unwrap().scopes, vec!["openid", "email"]);
        assert_eq!(
            auth.sessions().get_identity("s1").await,
            Some(Identity::new("a@example.com"))
        );
    }

    #[tokio::test]
    async fn test_already_authenticated_skips_verification() {
        let (auth, verifier) = authenticator();
        let ctx = TransportContext::default().with_bearer_token(GOOD_TOKEN);
        let mut state = RequestAuthState::default();

        auth.authenticate(&ctx, &mut state).await;
        let outcome = auth.authenticate(&ctx, &mut state).await;

        assert_eq!(outcome, AuthOutcome::AlreadyAuthenticated);
        assert_eq!(verifier.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_failed_first_party_token_is_kept_unverified() {
        let (auth, _) = authenticator();
        let ctx = TransportContext::default().with_bearer_token(BAD_GOOGLE_TOKEN);
        let mut state = RequestAuthState::default();

        let outcome = auth.authenticate(&ctx, &mut state).await;

        assert_eq!(outcome, AuthOutcome::Unverified);
        assert!(state.authenticated.is_none());
        let unverified = state.unverified.as_ref().unwrap();
        assert_eq!(unverified.provider, TokenProvider::Google);
        assert_eq!(unverified.token(), BAD_GOOGLE_TOKEN);
        assert!(!format!("{:?}", unverified).contains(BAD_GOOGLE_TOKEN));
    }

    #[tokio::test]
    async fn test_failed_opaque_token_is_unauthenticated() {
        let (auth, _) = authenticator();
        let ctx = TransportContext::default().with_bearer_token(OPAQUE_TOKEN);
        let mut state = RequestAuthState::default();

        assert_eq!(
            auth.authenticate(&ctx, &mut state).await,
            AuthOutcome::Unauthenticated
        );
        assert!(state.unverified.is_none());
        assert!(matches!(
            state.require_identity(),
            Err(GatewayError::NotAuthenticated)
        ));
    }

    #[tokio::test]
    async fn test_no_verifier_means_cannot_verify() {
        let auth = RequestAuthenticator::new(SessionRegistry::default());
        let ctx = TransportContext::default().with_bearer_token(GOOD_TOKEN);
        let mut state = RequestAuthState::default();

        assert_eq!(auth.authenticate(&ctx, &mut state).await, AuthOutcome::Unverified);
    }

    #[tokio::test]
    async fn test_metadata_parsed_from_token_claims() {
        let (auth, _) = authenticator();
        let token = jwt(json!({
            "valid": true,
            "sub": "user-42",
            "iss": "https://issuer.example",
            "aud": ["gateway", "other"],
            "exp": 1_900_000_000,
            "scp": ["tools:read"],
            "client_id": "cli"
        }));
        let ctx = TransportContext::default().with_bearer_token(&token);
        let mut state = RequestAuthState::default();

        auth.authenticate(&ctx, &mut state).await;

        let authed = state.authenticated.unwrap();
        assert_eq!(authed.identity, Identity::new("user-42"));
        let metadata = authed.metadata.unwrap();
        assert_eq!(metadata.issuer.as_deref(), Some("https://issuer.example"));
        assert_eq!(metadata.audience, vec!["gateway", "other"]);
        assert_eq!(metadata.subject.as_deref(), Some("user-42"));
        assert_eq!(metadata.expires_at.unwrap().timestamp(), 1_900_000_000);
        assert_eq!(metadata.scopes, vec!["tools:read"]);
        assert_eq!(metadata.client_id.as_deref(), Some("cli"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_verifier_timeout_is_bounded() {
        let auth = RequestAuthenticator::new(SessionRegistry::default())
            .with_verifier(Arc::new(SlowVerifier))
            .with_verify_timeout(Duration::from_secs(2));
        let ctx = TransportContext::default().with_bearer_token(OPAQUE_TOKEN);
        let mut state = RequestAuthState::default();

        let start = tokio::time::Instant::now();
        let outcome = auth.authenticate(&ctx, &mut state).await;

        assert_eq!(outcome, AuthOutcome::Unauthenticated);
        assert_eq!(start.elapsed(), Duration::from_secs(2));
    }

    #[tokio::test]
    async fn test_session_binding_from_earlier_request() {
        let (auth, _) = authenticator();
        auth.sessions()
            .bind("s1", "a@example.com", BindOptions::default())
            .await;

        let ctx = TransportContext::default().with_session_id("s1");
        let mut state = RequestAuthState::default();

        assert_eq!(
            auth.authenticate(&ctx, &mut state).await,
            AuthOutcome::Authenticated(AuthMethod::SessionBinding)
        );
        assert_eq!(state.identity(), Some(&Identity::new("a@example.com")));
        assert!(!state.authenticated.unwrap().method.is_verified());
    }

    #[tokio::test]
    async fn test_bearer_wins_over_session_binding() {
        let (auth, _) = authenticator();
        auth.sessions()
            .bind("s1", "other@example.com", BindOptions::default())
            .await;

        let ctx = TransportContext::default()
            .with_bearer_token(GOOD_TOKEN)
            .with_session_id("s1");
        let mut state = RequestAuthState::default();
        auth.authenticate(&ctx, &mut state).await;

        assert_eq!(state.identity(), Some(&Identity::new("a@example.com")));
        // The conflicting binding is left alone.
        assert_eq!(
            auth.sessions().get_identity("s1").await,
            Some(Identity::new("other@example.com"))
        );
    }

    #[tokio::test]
    async fn test_stdio_identity_hint() {
        let (auth, _) = authenticator();
        auth.sessions().bind("s1", "a@example.com", BindOptions::default()).await;
        auth.sessions().bind("s2", "b@example.com", BindOptions::default()).await;

        let ctx = TransportContext::stdio().with_identity_hint("b@example.com");
        let mut state = RequestAuthState::default();

        assert_eq!(
            auth.authenticate(&ctx, &mut state).await,
            AuthOutcome::Authenticated(AuthMethod::IdentityHint)
        );
        assert_eq!(state.identity(), Some(&Identity::new("b@example.com")));
    }

    #[tokio::test]
    async fn test_stdio_defaults_to_single_live_session() {
        let (auth, _) = authenticator();
        auth.sessions().bind("s1", "a@example.com", BindOptions::default()).await;

        let mut state = RequestAuthState::default();
        assert_eq!(
            auth.authenticate(&TransportContext::stdio(), &mut state).await,
            AuthOutcome::Authenticated(AuthMethod::SingleSession)
        );
        assert_eq!(state.identity(), Some(&Identity::new("a@example.com")));
    }

    #[tokio::test]
    async fn test_stdio_with_several_sessions_stays_unauthenticated() {
        let (auth, _) = authenticator();
        auth.sessions().bind("s1", "a@example.com", BindOptions::default()).await;
        auth.sessions().bind("s2", "b@example.com", BindOptions::default()).await;

        let ctx = TransportContext::stdio().with_identity_hint("nobody@example.com");
        let mut state = RequestAuthState::default();
        assert_eq!(
            auth.authenticate(&ctx, &mut state).await,
            AuthOutcome::Unauthenticated
        );
    }

    #[tokio::test]
    async fn test_single_session_default_only_on_single_user_transport() {
        let (auth, _) = authenticator();
        auth.sessions().bind("s1", "a@example.com", BindOptions::default()).await;

        let mut state = RequestAuthState::default();
        assert_eq!(
            auth.authenticate(&TransportContext::default(), &mut state).await,
            AuthOutcome::Unauthenticated
        );
    }

    #[test]
    fn test_identity_fallbacks() {
        let google = VerifiedAuth::from_claims(obj(json!({ "sub": "123" }))).unwrap();
        assert_eq!(
            identity_for(&google, TokenProvider::Google),
            Some(Identity::new("123"))
        );

        let jwt = VerifiedAuth::from_claims(obj(json!({
            "sub": "123",
            "preferred_username": "alice"
        })))
        .unwrap();
        assert_eq!(
            identity_for(&jwt, TokenProvider::Jwt),
            Some(Identity::new("alice"))
        );

        let with_email = VerifiedAuth::from_claims(obj(json!({
            "sub": "123",
            "email": "a@example.com"
        })))
        .unwrap();
        assert_eq!(
            identity_for(&with_email, TokenProvider::Jwt),
            Some(Identity::new("a@example.com"))
        );
    }

    #[test]
    fn test_identity_falls_back_past_empty_values() {
        let client_only = VerifiedAuth {
            sub: String::new(),
            email: None,
            claims: Map::new(),
            scopes: Vec::new(),
            client_id: Some("cli-app".to_string()),
            expires_at: None,
        };
        assert_eq!(
            identity_for(&client_only, TokenProvider::Unknown),
            Some(Identity::new("cli-app"))
        );
        assert_eq!(identity_for(&client_only, TokenProvider::Google), None);

        let blank_username = VerifiedAuth::from_claims(obj(json!({
            "sub": "123",
            "preferred_username": ""
        })))
        .unwrap();
        assert_eq!(
            identity_for(&blank_username, TokenProvider::Jwt),
            Some(Identity::new("123"))
        );

        let sub_and_client = VerifiedAuth {
            sub: "svc-1".to_string(),
            client_id: Some("cli-app".to_string()),
            ..client_only.clone()
        };
        assert_eq!(
            identity_for(&sub_and_client, TokenProvider::Unknown),
            Some(Identity::new("svc-1"))
        );
    }

    #[test]
    fn test_authorization_header_lookup() {
        let ctx = TransportContext::default().with_bearer_token(GOOD_TOKEN);
        assert_eq!(
            ctx.authorization(),
            Some(format!("Bearer {}", GOOD_TOKEN).as_str())
        );
        assert!(TransportContext::stdio().authorization().is_none());
    }
}
