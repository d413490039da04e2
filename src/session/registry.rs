//! TTL-expiring, LRU-bounded registry of session bindings.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use tokio::sync::Mutex;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::error::GatewayError;
use crate::session::binding::{SessionBinding, SessionStatus};
use crate::session::sweeper::SweeperHandle;
use crate::types::{Identity, SessionId};

/// Bindings evicted at once when the registry is full.
pub const EVICTION_BATCH: usize = 100;

/// Default session TTL (24 hours).
pub const DEFAULT_SESSION_TTL_SECONDS: u64 = 86_400;

/// Default sweep interval (1 hour).
pub const DEFAULT_CLEANUP_INTERVAL_SECONDS: u64 = 3_600;

pub(crate) type BindingMap = HashMap<SessionId, SessionBinding>;

/// Session registry configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionRegistryConfig {
    #[serde(default = "default_max_sessions")]
    pub max_sessions: usize,
    #[serde(default = "default_ttl_seconds")]
    pub default_ttl_seconds: u64,
    /// Count every successful lookup as an access.
    #[serde(default = "default_auto_refresh")]
    pub auto_refresh: bool,
    #[serde(default = "default_cleanup_interval_seconds")]
    pub cleanup_interval_seconds: u64,
    /// How long `stop_sweeper` waits for the sweep task to exit.
    #[serde(default = "default_stop_timeout_seconds")]
    pub stop_timeout_seconds: u64,
}

fn default_max_sessions() -> usize {
    10_000
}

fn default_ttl_seconds() -> u64 {
    DEFAULT_SESSION_TTL_SECONDS
}

fn default_auto_refresh() -> bool {
    true
}

fn default_cleanup_interval_seconds() -> u64 {
    DEFAULT_CLEANUP_INTERVAL_SECONDS
}

fn default_stop_timeout_seconds() -> u64 {
    5
}

impl Default for SessionRegistryConfig {
    fn default() -> Self {
        Self {
            max_sessions: default_max_sessions(),
            default_ttl_seconds: default_ttl_seconds(),
            auto_refresh: default_auto_refresh(),
            cleanup_interval_seconds: default_cleanup_interval_seconds(),
            stop_timeout_seconds: default_stop_timeout_seconds(),
        }
    }
}

impl SessionRegistryConfig {
    pub fn default_ttl(&self) -> Duration {
        Duration::from_secs(self.default_ttl_seconds)
    }

    pub fn cleanup_interval(&self) -> Duration {
        Duration::from_secs(self.cleanup_interval_seconds.max(1))
    }

    pub fn stop_timeout(&self) -> Duration {
        Duration::from_secs(self.stop_timeout_seconds)
    }
}

/// Optional arguments to [`SessionRegistry::bind`].
#[derive(Debug, Clone, Default)]
pub struct BindOptions {
    /// Lifetime of the binding; the registry default when `None`.
    pub ttl: Option<Duration>,
    pub metadata: Option<Map<String, Value>>,
    /// Replace a binding to a different identity instead of refusing.
    pub allow_rebind: bool,
}

impl BindOptions {
    pub fn with_ttl(mut self, ttl: Duration) -> Self {
        self.ttl = Some(ttl);
        self
    }

    pub fn with_metadata(mut self, metadata: Map<String, Value>) -> Self {
        self.metadata = Some(metadata);
        self
    }

    pub fn allow_rebind(mut self) -> Self {
        self.allow_rebind = true;
        self
    }
}

/// Registry counters.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionStats {
    pub total: usize,
    pub active: usize,
    pub expired: usize,
    pub revoked: usize,
    pub unique_identities: usize,
    pub max_sessions: usize,
    pub default_ttl_seconds: u64,
    pub auto_refresh: bool,
}

/// Wall-clock timestamps that advance with the tokio clock.
///
/// Anchored to `Utc::now()` once, then moved forward by tokio's monotonic
/// `Instant`, so expiry honours a paused or advanced runtime clock.
#[derive(Debug, Clone, Copy)]
pub(crate) struct SessionClock {
    wall: DateTime<Utc>,
    mono: Instant,
}

impl SessionClock {
    pub(crate) fn new() -> Self {
        Self {
            wall: Utc::now(),
            mono: Instant::now(),
        }
    }

    pub(crate) fn now(&self) -> DateTime<Utc> {
        let elapsed =
            chrono::Duration::from_std(self.mono.elapsed()).unwrap_or(chrono::Duration::MAX);
        self.wall
            .checked_add_signed(elapsed)
            .unwrap_or(DateTime::<Utc>::MAX_UTC)
    }
}

/// Concurrency-safe map from session id to identity binding.
///
/// Cloning is cheap and clones share state. Every public operation takes the
/// inner lock exactly once; nothing inside the lock awaits other components.
#[derive(Clone)]
pub struct SessionRegistry {
    pub(crate) config: Arc<SessionRegistryConfig>,
    pub(crate) bindings: Arc<Mutex<BindingMap>>,
    pub(crate) sweeper: Arc<Mutex<Option<SweeperHandle>>>,
    pub(crate) clock: SessionClock,
}

impl Default for SessionRegistry {
    fn default() -> Self {
        Self::new(SessionRegistryConfig::default())
    }
}

impl SessionRegistry {
    pub fn new(config: SessionRegistryConfig) -> Self {
        Self {
            config: Arc::new(config),
            bindings: Arc::new(Mutex::new(HashMap::new())),
            sweeper: Arc::new(Mutex::new(None)),
            clock: SessionClock::new(),
        }
    }

    pub fn config(&self) -> &SessionRegistryConfig {
        &self.config
    }

    /// Bind `session_id` to `identity`.
    ///
    /// - Same identity already bound: counts as an access, reactivates an
    ///   expired binding, returns true.
    /// - Different identity (or a revoked binding) without `allow_rebind`:
    ///   returns false and leaves the binding untouched.
    /// - With `allow_rebind`: the old binding is replaced entirely.
    /// - New session on a full registry: the [`EVICTION_BATCH`] least
    ///   recently accessed bindings are evicted first.
    pub async fn bind(&self, session_id: &str, identity: &str, options: BindOptions) -> bool {
        let now = self.clock.now();
        let ttl = options.ttl.unwrap_or_else(|| self.config.default_ttl());
        let mut bindings = self.bindings.lock().await;

        if let Some(existing) = bindings.get_mut(session_id) {
            let same_identity = existing.identity.as_str() == identity;

            if same_identity && existing.status != SessionStatus::Revoked {
                existing.mark_expired_if_due(now);
                if existing.status == SessionStatus::Expired {
                    existing.refresh_at(now, ttl);
                    debug!(session_id, "Reactivated expired session on rebind");
                } else {
                    existing.touch_at(now);
                }
                return true;
            }

            if !options.allow_rebind {
                warn!(
                    session_id,
                    "Refusing to bind session: already bound to another identity or revoked"
                );
                return false;
            }

            info!(session_id, identity, "Replacing existing session binding");
            *existing = SessionBinding::new_at(
                SessionId::new(session_id),
                Identity::new(identity),
                ttl,
                options.metadata.unwrap_or_default(),
                now,
            );
            return true;
        }

        if bindings.len() >= self.config.max_sessions {
            let evicted = evict_least_recently_used(&mut bindings, EVICTION_BATCH);
            warn!(
                "Session registry at capacity ({}); evicted {} least recently used session(s)",
                self.config.max_sessions, evicted
            );
        }

        bindings.insert(
            SessionId::new(session_id),
            SessionBinding::new_at(
                SessionId::new(session_id),
                Identity::new(identity),
                ttl,
                options.metadata.unwrap_or_default(),
                now,
            ),
        );
        debug!(session_id, identity, "Bound session");
        true
    }

    /// [`bind`](Self::bind) with a typed error instead of `false`.
    pub async fn try_bind(
        &self,
        session_id: &str,
        identity: &str,
        options: BindOptions,
    ) -> Result<(), GatewayError> {
        if self.bind(session_id, identity, options).await {
            Ok(())
        } else {
            Err(GatewayError::SessionAlreadyBound {
                session_id: SessionId::new(session_id),
            })
        }
    }

    /// Identity bound to a live session.
    ///
    /// An expired binding is marked `Expired` and treated as absent. With
    /// `auto_refresh` every successful lookup counts as an access (this
    /// does not extend the expiry).
    pub async fn get_identity(&self, session_id: &str) -> Option<Identity> {
        let now = self.clock.now();
        let mut bindings = self.bindings.lock().await;
        let binding = bindings.get_mut(session_id)?;

        if binding.status != SessionStatus::Active {
            return None;
        }
        if binding.mark_expired_if_due(now) {
            debug!(session_id, "Session expired");
            return None;
        }
        if self.config.auto_refresh {
            binding.touch_at(now);
        }
        Some(binding.identity.clone())
    }

    /// Snapshot of a binding in any state. Expiry is detected but not counted as an access.
    pub async fn get_binding(&self, session_id: &str) -> Option<SessionBinding> {
        let now = self.clock.now();
        let mut bindings = self.bindings.lock().await;
        let binding = bindings.get_mut(session_id)?;
        binding.mark_expired_if_due(now);
        Some(binding.clone())
    }

    pub async fn unbind(&self, session_id: &str) -> bool {
        let removed = self.bindings.lock().await.remove(session_id).is_some();
        if removed {
            debug!(session_id, "Unbound session");
        }
        removed
    }

    /// Mark a binding revoked. Returns false if the session is unknown.
    pub async fn revoke(&self, session_id: &str) -> bool {
        let mut bindings = self.bindings.lock().await;
        match bindings.get_mut(session_id) {
            Some(binding) => {
                binding.revoke();
                info!(session_id, "Revoked session");
                true
            }
            None => false,
        }
    }

    /// Extend a binding's expiry by `ttl` (registry default when `None`).
    ///
    /// Reactivates expired bindings. Returns false for unknown or revoked sessions.
    pub async fn refresh(&self, session_id: &str, ttl: Option<Duration>) -> bool {
        let now = self.clock.now();
        let ttl = ttl.unwrap_or_else(|| self.config.default_ttl());
        let mut bindings = self.bindings.lock().await;
        bindings
            .get_mut(session_id)
            .is_some_and(|binding| binding.refresh_at(now, ttl))
    }

    /// Remove every binding with `expires_at <= now`.
    pub async fn cleanup_expired(&self) -> usize {
        let mut bindings = self.bindings.lock().await;
        remove_expired(&mut bindings, self.clock.now())
    }

    pub async fn cleanup_revoked(&self) -> usize {
        let mut bindings = self.bindings.lock().await;
        remove_revoked(&mut bindings)
    }

    /// Every session id bound to `identity`, in any state.
    pub async fn get_sessions_for_identity(&self, identity: &str) -> Vec<SessionId> {
        let bindings = self.bindings.lock().await;
        let mut sessions: Vec<SessionId> = bindings
            .values()
            .filter(|b| b.identity.as_str() == identity)
            .map(|b| b.session_id.clone())
            .collect();
        sessions.sort();
        sessions
    }

    pub async fn unbind_all_for_identity(&self, identity: &str) -> usize {
        let mut bindings = self.bindings.lock().await;
        let before = bindings.len();
        bindings.retain(|_, b| b.identity.as_str() != identity);
        let removed = before - bindings.len();
        if removed > 0 {
            info!(identity, "Unbound {} session(s)", removed);
        }
        removed
    }

    /// Live (active, unexpired) sessions as `(session_id, identity)` pairs.
    pub async fn live_sessions(&self) -> Vec<(SessionId, Identity)> {
        let now = self.clock.now();
        let bindings = self.bindings.lock().await;
        let mut live: Vec<(SessionId, Identity)> = bindings
            .values()
            .filter(|b| b.is_live_at(now))
            .map(|b| (b.session_id.clone(), b.identity.clone()))
            .collect();
        live.sort();
        live
    }

    pub async fn has_live_session_for(&self, identity: &str) -> bool {
        let now = self.clock.now();
        self.bindings
            .lock()
            .await
            .values()
            .any(|b| b.identity.as_str() == identity && b.is_live_at(now))
    }

    pub async fn len(&self) -> usize {
        self.bindings.lock().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.bindings.lock().await.is_empty()
    }

    pub async fn stats(&self) -> SessionStats {
        let now = self.clock.now();
        let bindings = self.bindings.lock().await;

        let mut active = 0;
        let mut expired = 0;
        let mut revoked = 0;
        let mut identities = HashSet::new();

        for binding in bindings.values() {
            identities.insert(binding.identity.as_str());
            match binding.status {
                SessionStatus::Revoked => revoked += 1,
                SessionStatus::Expired => expired += 1,
                SessionStatus::Active if binding.is_expired_at(now) => expired += 1,
                SessionStatus::Active => active += 1,
            }
        }

        SessionStats {
            total: bindings.len(),
            active,
            expired,
            revoked,
            unique_identities: identities.len(),
            max_sessions: self.config.max_sessions,
            default_ttl_seconds: self.config.default_ttl_seconds,
            auto_refresh: self.config.auto_refresh,
        }
    }
}

/// Remove up to `count` bindings with the oldest `last_accessed_at`.
fn evict_least_recently_used(bindings: &mut BindingMap, count: usize) -> usize {
    let mut by_access: Vec<(DateTime<Utc>, SessionId)> = bindings
        .values()
        .map(|b| (b.last_accessed_at, b.session_id.clone()))
        .collect();
    by_access.sort_by_key(|(accessed, _)| *accessed);

    let mut evicted = 0;
    for (_, session_id) in by_access.into_iter().take(count) {
        if bindings.remove(&session_id).is_some() {
            evicted += 1;
        }
    }
    evicted
}

pub(crate) fn remove_expired(bindings: &mut BindingMap, now: DateTime<Utc>) -> usize {
    let before = bindings.len();
    bindings.retain(|_, b| !b.is_expired_at(now));
    let removed = before - bindings.len();
    if removed > 0 {
        info!("Removed {} expired session(s)", removed);
    }
    removed
}

pub(crate) fn remove_revoked(bindings: &mut BindingMap) -> usize {
    let before = bindings.len();
    bindings.retain(|_, b| b.status != SessionStatus::Revoked);
    let removed = before - bindings.len();
    if removed > 0 {
        info!("Removed {} revoked session(s)", removed);
    }
    removed
}
