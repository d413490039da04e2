//! A single session-to-identity binding and its state machine.
//!
//! ```text
//! Active --(now >= expires_at, seen on read)--> Expired
//! Active --revoke()--> Revoked
//! Expired --refresh()--> Active
//! ```

use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::types::{Identity, SessionId};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionStatus {
    Active,
    Expired,
    Revoked,
}

/// Time-bounded association between a session id and an identity.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SessionBinding {
    pub session_id: SessionId,
    pub identity: Identity,
    pub bound_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
    pub last_accessed_at: DateTime<Utc>,
    pub access_count: u64,
    pub status: SessionStatus,
    #[serde(default)]
    pub metadata: Map<String, Value>,
}

pub(crate) fn expiry_from(now: DateTime<Utc>, ttl: Duration) -> DateTime<Utc> {
    let delta = chrono::Duration::from_std(ttl).unwrap_or(chrono::Duration::MAX);
    now.checked_add_signed(delta)
        .unwrap_or(DateTime::<Utc>::MAX_UTC)
}

impl SessionBinding {
    /// Create an active binding at `now` that lives for `ttl`.
    pub fn new_at(
        session_id: SessionId,
        identity: Identity,
        ttl: Duration,
        metadata: Map<String, Value>,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            session_id,
            identity,
            bound_at: now,
            expires_at: expiry_from(now, ttl),
            last_accessed_at: now,
            access_count: 1,
            status: SessionStatus::Active,
            metadata,
        }
    }

    /// Whether the binding's lifetime has run out at `now`.
    ///
    /// The instant `now == expires_at` already counts as expired.
    pub fn is_expired_at(&self, now: DateTime<Utc>) -> bool {
        now >= self.expires_at
    }

    /// Active and not past its expiry.
    pub fn is_live_at(&self, now: DateTime<Utc>) -> bool {
        self.status == SessionStatus::Active && !self.is_expired_at(now)
    }

    /// Move an active binding to `Expired` if its time is up. Returns true on transition.
    pub fn mark_expired_if_due(&mut self, now: DateTime<Utc>) -> bool {
        if self.status == SessionStatus::Active && self.is_expired_at(now) {
            self.status = SessionStatus::Expired;
            return true;
        }
        false
    }

    /// Record an access.
    pub fn touch_at(&mut self, now: DateTime<Utc>) {
        self.access_count = self.access_count.saturating_add(1);
        self.last_accessed_at = now;
    }

    /// Extend the lifetime by `ttl` from `now`, reactivating an expired binding.
    ///
    /// Revoked bindings stay revoked; returns false for them.
    pub fn refresh_at(&mut self, now: DateTime<Utc>, ttl: Duration) -> bool {
        if self.status == SessionStatus::Revoked {
            return false;
        }
        self.expires_at = expiry_from(now, ttl);
        self.status = SessionStatus::Active;
        self.touch_at(now);
        true
    }

    pub fn revoke(&mut self) {
        self.status = SessionStatus::Revoked;
    }
}
