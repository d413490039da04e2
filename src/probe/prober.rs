//! Active check of whether an endpoint currently demands authentication.

use std::sync::Arc;
use std::time::Duration;

use http::StatusCode;
use http::header::{PROXY_AUTHENTICATE, WWW_AUTHENTICATE};
use reqwest::redirect::Policy;
use serde::{Deserialize, Serialize};
use tokio::task::JoinSet;
use tracing::{debug, warn};
use url::Url;

use crate::error::GatewayError;
use crate::probe::cache::{DEFAULT_MAX_CACHE_ENTRIES, ProbeCache, ProbeCacheStats};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProbeConfig {
    /// Per-request timeout.
    #[serde(default = "default_timeout_seconds")]
    pub timeout_seconds: u64,
    #[serde(default = "default_cache_ttl_seconds")]
    pub cache_ttl_seconds: u64,
    /// Upper bound on cached verdicts.
    #[serde(default = "default_max_cache_entries")]
    pub max_cache_entries: usize,
}

fn default_timeout_seconds() -> u64 {
    5
}

fn default_cache_ttl_seconds() -> u64 {
    300
}

fn default_max_cache_entries() -> usize {
    DEFAULT_MAX_CACHE_ENTRIES
}

impl Default for ProbeConfig {
    fn default() -> Self {
        Self {
            timeout_seconds: default_timeout_seconds(),
            cache_ttl_seconds: default_cache_ttl_seconds(),
            max_cache_entries: default_max_cache_entries(),
        }
    }
}

impl ProbeConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_seconds)
    }

    pub fn cache_ttl(&self) -> Duration {
        Duration::from_secs(self.cache_ttl_seconds)
    }
}

/// Probes URLs with a single GET and caches the verdict.
///
/// An endpoint requires auth when it answers 401/403 or sends a
/// `WWW-Authenticate`/`Proxy-Authenticate` header. Network failures,
/// timeouts and unparseable URLs report `false` and are not cached.
#[derive(Clone)]
pub struct AuthProbe {
    client: reqwest::Client,
    cache: Arc<ProbeCache>,
    default_timeout: Duration,
}

impl AuthProbe {
    pub fn new(config: &ProbeConfig) -> Result<Self, GatewayError> {
        let client = reqwest::Client::builder()
            .redirect(Policy::none())
            .build()
            .map_err(|e| GatewayError::HttpClient(e.to_string()))?;

        Ok(Self {
            client,
            cache: Arc::new(
                ProbeCache::new(config.cache_ttl()).with_max_entries(config.max_cache_entries),
            ),
            default_timeout: config.timeout(),
        })
    }

    pub fn cache(&self) -> &ProbeCache {
        &self.cache
    }

    pub async fn cache_stats(&self) -> ProbeCacheStats {
        self.cache.stats().await
    }

    /// [`probe`](Self::probe) with the configured timeout.
    pub async fn requires_auth(&self, url: &str) -> bool {
        self.probe(url, self.default_timeout).await
    }

    pub async fn probe(&self, url: &str, timeout: Duration) -> bool {
        if let Some(cached) = self.cache.get(url).await {
            return cached;
        }

        match self.check(url, timeout).await {
            Some(requires_auth) => {
                self.cache.set(url, requires_auth).await;
                requires_auth
            }
            None => false,
        }
    }

    /// Probe every URL concurrently, each bounded by `timeout`.
    ///
    /// Results are returned in input order.
    pub async fn probe_many(&self, urls: &[String], timeout: Duration) -> Vec<(String, bool)> {
        let mut tasks = JoinSet::new();
        for (index, url) in urls.iter().enumerate() {
            let probe = self.clone();
            let url = url.clone();
            tasks.spawn(async move {
                let requires_auth = probe.probe(&url, timeout).await;
                (index, requires_auth)
            });
        }

        let mut results = vec![false; urls.len()];
        while let Some(joined) = tasks.join_next().await {
            match joined {
                Ok((index, requires_auth)) => results[index] = requires_auth,
                Err(e) => warn!("Auth probe task failed: {}", e),
            }
        }

        urls.iter().cloned().zip(results).collect()
    }

    /// `None` when the endpoint could not be reached.
    async fn check(&self, url: &str, timeout: Duration) -> Option<bool> {
        let parsed = match Url::parse(url) {
            Ok(parsed) => parsed,
            Err(e) => {
                debug!("Not probing invalid URL {}: {}", url, e);
                return None;
            }
        };

        let response = match self.client.get(parsed).timeout(timeout).send().await {
            Ok(response) => response,
            Err(e) => {
                if e.is_timeout() {
                    debug!("Auth probe of {} timed out after {:?}", url, timeout);
                } else {
                    debug!("Auth probe of {} failed: {}", url, e);
                }
                return None;
            }
        };

        let status = response.status();
        let headers = response.headers();
        let requires_auth = status == StatusCode::UNAUTHORIZED
            || status == StatusCode::FORBIDDEN
            || headers.contains_key(WWW_AUTHENTICATE)
            || headers.contains_key(PROXY_AUTHENTICATE);

        debug!(
            "Auth probe of {} returned {}; requires auth: {}",
            url, status, requires_auth
        );
        Some(requires_auth)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Instant;
    use wiremock::matchers::{method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn probe() -> AuthProbe {
        AuthProbe::new(&ProbeConfig::default()).unwrap()
    }

    async fn server_with(route: &str, response: ResponseTemplate) -> MockServer {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path(route))
            .respond_with(response)
            .mount(&server)
            .await;
        server
    }

    #[tokio::test]
    async fn test_401_requires_auth() {
        let server = server_with("/mcp", ResponseTemplate::new(401)).await;
        assert!(probe().requires_auth(&format!("{}/mcp", server.uri())).await);
    }

    #[tokio::test]
    async fn test_403_requires_auth() {
        let server = server_with("/mcp", ResponseTemplate::new(403)).await;
        assert!(probe().requires_auth(&format!("{}/mcp", server.uri())).await);
    }

    #[tokio::test]
    async fn test_200_with_www_authenticate_requires_auth() {
        let server = server_with(
            "/mcp",
            ResponseTemplate::new(200).insert_header("WWW-Authenticate", "Bearer realm=\"mcp\""),
        )
        .await;
        assert!(probe().requires_auth(&format!("{}/mcp", server.uri())).await);
    }

    #[tokio::test]
    async fn test_proxy_authenticate_requires_auth() {
        let server = server_with(
            "/mcp",
            ResponseTemplate::new(200).insert_header("Proxy-Authenticate", "Basic"),
        )
        .await;
        assert!(probe().requires_auth(&format!("{}/mcp", server.uri())).await);
    }

    #[tokio::test]
    async fn test_bare_200_does_not_require_auth() {
        let server = server_with("/mcp", ResponseTemplate::new(200)).await;
        assert!(!probe().requires_auth(&format!("{}/mcp", server.uri())).await);
    }

    #[tokio::test]
    async fn test_redirect_is_not_followed() {
        let server = server_with(
            "/mcp",
            ResponseTemplate::new(302).insert_header("Location", "https://login.example/"),
        )
        .await;
        assert!(!probe().requires_auth(&format!("{}/mcp", server.uri())).await);
    }

    #[tokio::test]
    async fn test_timeout_fails_open() {
        let server = server_with(
            "/slow",
            ResponseTemplate::new(401).set_delay(Duration::from_secs(5)),
        )
        .await;
        let probe = probe();
        let url = format!("{}/slow", server.uri());

        assert!(!probe.probe(&url, Duration::from_millis(200)).await);
        assert_eq!(probe.cache_stats().await.entries, 0);
    }

    #[tokio::test]
    async fn test_connection_failure_fails_open() {
        assert!(!probe().probe("http://127.0.0.1:1/mcp", Duration::from_secs(2)).await);
    }

    #[tokio::test]
    async fn test_invalid_url_fails_open() {
        assert!(!probe().requires_auth("not a url").await);
    }

    #[tokio::test]
    async fn test_results_are_cached() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/mcp"))
            .respond_with(ResponseTemplate::new(401))
            .expect(1)
            .mount(&server)
            .await;

        let probe = probe();
        let url = format!("{}/mcp", server.uri());
        assert!(probe.requires_auth(&url).await);
        assert!(probe.requires_auth(&url).await);

        let stats = probe.cache_stats().await;
        assert_eq!(stats.hits, 1);
        assert_eq!(stats.entries, 1);
    }

    #[tokio::test]
    async fn test_probe_many_runs_concurrently() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(401).set_delay(Duration::from_secs(10)))
            .mount(&server)
            .await;

        let urls: Vec<String> = (0..5).map(|i| format!("{}/s{}", server.uri(), i)).collect();
        let timeout = Duration::from_millis(500);

        let start = Instant::now();
        let results = probe().probe_many(&urls, timeout).await;
        let elapsed = start.elapsed();

        assert_eq!(results.len(), 5);
        assert!(results.iter().all(|(_, requires_auth)| !requires_auth));
        assert!(elapsed < timeout * 3, "batch took {:?}", elapsed);
    }

    #[tokio::test]
    async fn test_probe_many_preserves_order() {
        let open = server_with("/open", ResponseTemplate::new(200)).await;
        let closed = server_with("/closed", ResponseTemplate::new(401)).await;
        let urls = vec![
            format!("{}/closed", closed.uri()),
            format!("{}/open", open.uri()),
            "http://127.0.0.1:1/down".to_string(),
        ];

        let results = probe().probe_many(&urls, Duration::from_secs(2)).await;
        assert_eq!(
            results.iter().map(|(_, r)| *r).collect::<Vec<_>>(),
            vec![true, false, false]
        );
        assert_eq!(results[0].0, urls[0]);
    }
}
