//! HTTP surface for the auth core.
//!
//! Every request passes through [`auth_layer`], which resolves its identity
//! and stores the [`RequestAuthState`] in the request extensions.

use std::time::Duration;

use anyhow::Result;
use axum::extract::{Request, State};
use axum::http::{HeaderMap, HeaderName, HeaderValue, StatusCode, header};
use axum::middleware::{self, Next};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Extension, Json, Router};
use serde::{Deserialize, Serialize};
use serde_json::json;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use tracing::{debug, info};

use crate::auth::{AuthMethod, RequestAuthState, TransportContext};
use crate::error::GatewayError;
use crate::gateway::AuthServices;
use crate::session::BindOptions;
use crate::types::{Identity, SessionId};

pub const SESSION_ID_HEADER: &str = "mcp-session-id";
pub const IDENTITY_HINT_HEADER: &str = "x-identity-hint";

/// Upper bound on a client-requested probe timeout.
const MAX_PROBE_TIMEOUT: Duration = Duration::from_secs(30);

/// Upper bound on the number of URLs in one probe request.
pub const MAX_PROBE_URLS: usize = 50;

#[derive(Clone)]
pub struct ServerState {
    pub services: AuthServices,
    /// Treat callers as the single local user (enables the single-session fallback).
    pub single_user: bool,
}

pub fn router(state: ServerState) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/whoami", get(whoami))
        .route("/sessions/stats", get(session_stats))
        .route("/probe", post(probe))
        .layer(middleware::from_fn_with_state(state.clone(), auth_layer))
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
        .with_state(state)
}

fn header_str<'a>(headers: &'a HeaderMap, name: &str) -> Option<&'a str> {
    headers
        .get(name)
        .and_then(|v| v.to_str().ok())
        .map(str::trim)
        .filter(|v| !v.is_empty())
}

/// Resolve the caller's identity and attach it to the request.
///
/// A bearer-authenticated request without a session id is issued a new
/// session, returned in the `Mcp-Session-Id` response header.
pub async fn auth_layer(State(state): State<ServerState>, mut req: Request, next: Next) -> Response {
    let headers = req.headers();
    let mut ctx = TransportContext::http(headers.clone());
    ctx.single_user = state.single_user;
    ctx.session_id = header_str(headers, SESSION_ID_HEADER).map(SessionId::new);
    ctx.identity_hint = header_str(headers, IDENTITY_HINT_HEADER).map(Identity::new);

    let mut auth = RequestAuthState::default();
    state
        .services
        .authenticator
        .authenticate(&ctx, &mut auth)
        .await;

    let mut issued_session = None;
    if ctx.session_id.is_none()
        && let Some(authed) = &auth.authenticated
        && authed.method == AuthMethod::Bearer
    {
        let session_id = SessionId::generate();
        if state
            .services
            .sessions
            .bind(session_id.as_str(), authed.identity.as_str(), BindOptions::default())
            .await
        {
            debug!(session_id = %session_id, "Issued session for bearer-authenticated request");
            issued_session = Some(session_id);
        }
    }

    req.extensions_mut().insert(auth);
    let mut response = next.run(req).await;

    if let Some(session_id) = issued_session
        && let Ok(value) = HeaderValue::from_str(session_id.as_str())
    {
        response
            .headers_mut()
            .insert(HeaderName::from_static(SESSION_ID_HEADER), value);
    }
    response
}

async fn health() -> Json<serde_json::Value> {
    Json(json!({ "status": "ok" }))
}

#[derive(Debug, Serialize, Deserialize)]
pub struct WhoAmI {
    pub identity: String,
    pub method: AuthMethod,
    pub verified: bool,
    pub provider: Option<String>,
    pub scopes: Vec<String>,
}

async fn whoami(Extension(auth): Extension<RequestAuthState>) -> Response {
    match auth.require_identity() {
        Ok(identity) => {
            let Some(authed) = &auth.authenticated else {
                return StatusCode::INTERNAL_SERVER_ERROR.into_response();
            };
            Json(WhoAmI {
                identity: identity.to_string(),
                method: authed.method,
                verified: authed.method.is_verified(),
                provider: authed.provider.map(|p| p.to_string()),
                scopes: authed
                    .metadata
                    .as_ref()
                    .map(|m| m.scopes.clone())
                    .unwrap_or_default(),
            })
            .into_response()
        }
        Err(e) => unauthorized(&e),
    }
}

fn unauthorized(err: &GatewayError) -> Response {
    (
        StatusCode::UNAUTHORIZED,
        [(header::WWW_AUTHENTICATE, "Bearer")],
        Json(err.guidance().to_structured()),
    )
        .into_response()
}

async fn session_stats(State(state): State<ServerState>) -> Response {
    Json(state.services.sessions.stats().await).into_response()
}

#[derive(Debug, Deserialize)]
pub struct ProbeRequest {
    pub urls: Vec<String>,
    /// Per-URL timeout; the configured probe timeout when absent.
    #[serde(default)]
    pub timeout_ms: Option<u64>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct ProbeResult {
    pub url: String,
    pub requires_auth: bool,
}

async fn probe(
    State(state): State<ServerState>,
    Extension(auth): Extension<RequestAuthState>,
    Json(body): Json<ProbeRequest>,
) -> Response {
    if let Err(e) = auth.require_identity() {
        return unauthorized(&e);
    }
    if body.urls.len() > MAX_PROBE_URLS {
        return (
            StatusCode::BAD_REQUEST,
            Json(json!({
                "error": format!(
                    "Too many URLs: {} requested, at most {} allowed",
                    body.urls.len(),
                    MAX_PROBE_URLS
                )
            })),
        )
            .into_response();
    }

    let timeout = body
        .timeout_ms
        .map(Duration::from_millis)
        .unwrap_or_else(|| state.services.config.probe.timeout())
        .min(MAX_PROBE_TIMEOUT);

    let results: Vec<ProbeResult> = state
        .services
        .probe
        .probe_many(&body.urls, timeout)
        .await
        .into_iter()
        .map(|(url, requires_auth)| ProbeResult { url, requires_auth })
        .collect();

    Json(json!({
        "results": results,
        "cache": state.services.probe.cache_stats().await,
    }))
    .into_response()
}

/// Serve on `bind` until Ctrl-C, then stop background work.
pub async fn serve(services: AuthServices, bind: &str, single_user: bool) -> Result<()> {
    services.start().await;

    let app = router(ServerState {
        services: services.clone(),
        single_user,
    });
    let listener = tokio::net::TcpListener::bind(bind).await?;

    info!(
        "Gateway auth server listening on http://{} ({} mode)",
        bind,
        if single_user { "single-user" } else { "multi-tenant" }
    );

    axum::serve(listener, app)
        .with_graceful_shutdown(async {
            let _ = tokio::signal::ctrl_c().await;
            info!("Shutdown signal received");
        })
        .await?;

    services.shutdown().await;
    Ok(())
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;
    use crate::auth::{
        RequestAuthenticator, TokenProvider, TokenVerifier, VerifiedAuth, VerifyError,
    };
    use crate::config::GatewayAuthConfig;
    use crate::credentials::MemoryCredentialStore;
    use async_trait::async_trait;
    use axum::body::Body;
    use tower::ServiceExt;

    const TOKEN: &str = "ya29.valid-access-token-for-tests";

    struct AcceptOne;

    #[async_trait]
    impl TokenVerifier for AcceptOne {
        async fn verify(&self, token: &str, _provider: TokenProvider) -> Result<VerifiedAuth, VerifyError> {
            if token != TOKEN {
                return Err(VerifyError::Rejected("unknown token".to_string()));
            }
            Ok(VerifiedAuth {
                sub: "1".to_string(),
                email: Some("a@example.com".to_string()),
                claims: Default::default(),
                scopes: vec!["email".to_string()],
                client_id: None,
                expires_at: None,
            })
        }
    }

    fn state(single_user: bool) -> ServerState {
        let mut services = AuthServices::with_store(
            GatewayAuthConfig::default(),
            Arc::new(MemoryCredentialStore::new()),
        )
        .unwrap();
        services.authenticator =
            RequestAuthenticator::new(services.sessions.clone()).with_verifier(Arc::new(AcceptOne));
        ServerState {
            services,
            single_user,
        }
    }

    async fn body_json(response: Response) -> serde_json::Value {
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        serde_json::from_slice(&bytes).unwrap()
    }

    fn get_request(uri: &str) -> http::request::Builder {
        http::Request::builder().method("GET").uri(uri)
    }

    #[tokio::test]
    async fn test_health() {
        let response = router(state(false))
            .oneshot(get_request("/health").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(body_json(response).await["status"], "ok");
    }

    #[tokio::test]
    async fn test_whoami_unauthenticated_returns_guidance() {
        let response = router(state(false))
            .oneshot(get_request("/whoami").body(Body::empty()).unwrap())
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
        assert_eq!(response.headers()[header::WWW_AUTHENTICATE], "Bearer");
        let body = body_json(response).await;
        assert_eq!(body["error_type"], "generic");
        assert!(body["action"].as_str().unwrap().contains("bearer token"));
    }

    #[tokio::test]
    async fn test_whoami_with_bearer_issues_session() {
        let state = state(false);
        let sessions = state.services.sessions.clone();

        let response = router(state)
            .oneshot(
                get_request("/whoami")
                    .header(header::AUTHORIZATION, format!("Bearer {}", TOKEN))
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::OK);
        let session_id = response.headers()[SESSION_ID_HEADER]
            .to_str()
            .unwrap()
            .to_string();
        let body = body_json(response).await;
        assert_eq!(body["identity"], "a@example.com");
        assert_eq!(body["method"], "bearer");
        assert_eq!(body["verified"], true);
        assert_eq!(body["provider"], "google");
        assert_eq!(body["scopes"], json!(["email"]));

        assert_eq!(
            sessions.get_identity(&session_id).await,
            Some(Identity::new("a@example.com"))
        );
    }

    #[tokio::test]
    async fn test_session_header_reuses_binding() {
        let state = state(false);
        state
            .services
            .sessions
            .bind("s1", "b@example.com", BindOptions::default())
            .await;

        let response = router(state)
            .oneshot(
                get_request("/whoami")
                    .header("Mcp-Session-Id", "s1")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::OK);
        assert!(response.headers().get(SESSION_ID_HEADER).is_none());
        let body = body_json(response).await;
        assert_eq!(body["identity"], "b@example.com");
        assert_eq!(body["method"], "session_binding");
        assert_eq!(body["verified"], false);
    }

    #[tokio::test]
    async fn test_single_user_mode_uses_identity_hint() {
        let state = state(true);
        state.services.sessions.bind("s1", "a@example.com", BindOptions::default()).await;
        state.services.sessions.bind("s2", "b@example.com", BindOptions::default()).await;

        let response = router(state)
            .oneshot(
                get_request("/whoami")
                    .header("X-Identity-Hint", "b@example.com")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();

        let body = body_json(response).await;
        assert_eq!(body["identity"], "b@example.com");
        assert_eq!(body["method"], "identity_hint");
    }

    #[tokio::test]
    async fn test_identity_hint_ignored_in_multi_tenant_mode() {
        let state = state(false);
        state.services.sessions.bind("s1", "a@example.com", BindOptions::default()).await;

        let response = router(state)
            .oneshot(
                get_request("/whoami")
                    .header("X-Identity-Hint", "a@example.com")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
    }

    #[tokio::test]
    async fn test_session_stats() {
        let state = state(false);
        state.services.sessions.bind("s1", "a@example.com", BindOptions::default()).await;

        let response = router(state)
            .oneshot(get_request("/sessions/stats").body(Body::empty()).unwrap())
            .await
            .unwrap();

        let body = body_json(response).await;
        assert_eq!(body["total"], 1);
        assert_eq!(body["active"], 1);
        assert_eq!(body["max_sessions"], 10_000);
    }

    #[tokio::test]
    async fn test_probe_endpoint() {
        use wiremock::matchers::method;
        use wiremock::{Mock, MockServer, ResponseTemplate};

        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(401))
            .mount(&server)
            .await;

        let request = json!({
            "urls": [format!("{}/mcp", server.uri()), "http://127.0.0.1:1/down"],
            "timeout_ms": 2000
        });
        let response = router(state(false))
            .oneshot(auth_check_request(&request, Some(TOKEN)))
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::OK);
        let body = body_json(response).await;
        assert_eq!(body["results"][0]["requires_auth"], true);
        assert_eq!(body["results"][1]["requires_auth"], false);
        assert_eq!(body["cache"]["entries"], 1);
    }

    fn auth_check_request(body: &serde_json::Value, bearer: Option<&str>) -> http::Request<Body> {
        let mut builder = http::Request::builder()
            .method("POST")
            .uri("/probe")
            .header(header::CONTENT_TYPE, "application/json");
        if let Some(token) = bearer {
            builder = builder.header(header::AUTHORIZATION, format!("Bearer {}", token));
        }
        builder.body(Body::from(body.to_string())).unwrap()
    }

    #[tokio::test]
    async fn test_auth_check_endpoint_requires_identity() {
        let request = json!({ "urls": ["http://127.0.0.1:1/mcp"] });
        let state = state(false);
        let probe = state.services.probe.clone();

        let response = router(state)
            .oneshot(auth_check_request(&request, None))
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
        assert_eq!(response.headers()[header::WWW_AUTHENTICATE], "Bearer");
        let body = body_json(response).await;
        assert_eq!(body["error_type"], "generic");
        assert_eq!(probe.cache_stats().await.misses, 0);
    }

    #[tokio::test]
    async fn test_auth_check_endpoint_rejects_too_many_urls() {
        let urls: Vec<String> = (0..=MAX_PROBE_URLS)
            .map(|i| format!("http://127.0.0.1:1/mcp/{}", i))
            .collect();
        let request = json!({ "urls": urls });
        let state = state(false);
        let probe = state.services.probe.clone();

        let response = router(state)
            .oneshot(auth_check_request(&request, Some(TOKEN)))
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        let body = body_json(response).await;
        assert!(body["error"].as_str().unwrap().contains("at most 50"));
        assert_eq!(probe.cache_stats().await.misses, 0);
    }
}
