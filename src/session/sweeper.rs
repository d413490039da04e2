//! Background task that periodically drops expired and revoked bindings.

use std::sync::{Arc, Weak};

use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::session::registry::{
    BindingMap, SessionClock, SessionRegistry, remove_expired, remove_revoked,
};

pub(crate) struct SweeperHandle {
    cancel: CancellationToken,
    task: JoinHandle<()>,
}

/// Counts from one sweep.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SweepReport {
    pub expired: usize,
    pub revoked: usize,
}

impl SessionRegistry {
    /// Remove expired bindings, then revoked ones.
    pub async fn sweep(&self) -> SweepReport {
        sweep_map(&self.bindings, self.clock).await
    }

    /// Start the periodic sweep. A second call while running only logs a warning.
    pub async fn start_sweeper(&self) {
        let mut slot = self.sweeper.lock().await;
        if slot.as_ref().is_some_and(|h| !h.task.is_finished()) {
            warn!("Session sweeper already running");
            return;
        }

        let interval = self.config.cleanup_interval();
        let cancel = CancellationToken::new();
        let bindings = Arc::downgrade(&self.bindings);
        let task = tokio::spawn(run_sweeper(bindings, self.clock, interval, cancel.clone()));

        info!("Session sweeper started (interval {}s)", interval.as_secs());
        *slot = Some(SweeperHandle { cancel, task });
    }

    /// Stop the sweep task, waiting at most the configured stop timeout before aborting it.
    pub async fn stop_sweeper(&self) {
        let Some(SweeperHandle { cancel, mut task }) = self.sweeper.lock().await.take() else {
            return;
        };

        cancel.cancel();
        match tokio::time::timeout(self.config.stop_timeout(), &mut task).await {
            Ok(_) => info!("Session sweeper stopped"),
            Err(_) => {
                warn!(
                    "Session sweeper did not stop within {}s; aborting",
                    self.config.stop_timeout().as_secs()
                );
                task.abort();
            }
        }
    }

    pub async fn is_sweeper_running(&self) -> bool {
        self.sweeper
            .lock()
            .await
            .as_ref()
            .is_some_and(|h| !h.task.is_finished())
    }
}

async fn sweep_map(bindings: &Mutex<BindingMap>, clock: SessionClock) -> SweepReport {
    let mut bindings = bindings.lock().await;
    let expired = remove_expired(&mut bindings, clock.now());
    let revoked = remove_revoked(&mut bindings);
    SweepReport { expired, revoked }
}

async fn run_sweeper(
    bindings: Weak<Mutex<BindingMap>>,
    clock: SessionClock,
    period: std::time::Duration,
    cancel: CancellationToken,
) {
    let mut interval = tokio::time::interval_at(Instant::now() + period, period);
    interval.set_missed_tick_behavior(MissedTickBehavior::Skip);

    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = interval.tick() => {
                let Some(bindings) = bindings.upgrade() else {
                    debug!("Session registry dropped; sweeper exiting");
                    break;
                };
                let report = sweep_map(&bindings, clock).await;
                if report.expired + report.revoked > 0 {
                    debug!(
                        "Sweep removed {} expired and {} revoked session(s)",
                        report.expired, report.revoked
                    );
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;
    use crate::session::{BindOptions, SessionRegistryConfig};

    fn registry(interval_seconds: u64) -> SessionRegistry {
        SessionRegistry::new(SessionRegistryConfig {
            cleanup_interval_seconds: interval_seconds,
            ..Default::default()
        })
    }

    #[tokio::test]
    async fn test_sweep_removes_expired_and_revoked() {
        let registry = registry(3600);
        registry
            .bind("expired", "a@example.com", BindOptions::default().with_ttl(Duration::ZERO))
            .await;
        registry.bind("revoked", "b@example.com", BindOptions::default()).await;
        registry.revoke("revoked").await;
        registry.bind("live", "c@example.com", BindOptions::default()).await;

        let report = registry.sweep().await;
        assert_eq!(report, SweepReport { expired: 1, revoked: 1 });
        assert_eq!(registry.len().await, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_sweeper_runs_on_interval() {
        let registry = registry(60);
        registry
            .bind("expired", "a@example.com", BindOptions::default().with_ttl(Duration::ZERO))
            .await;

        registry.start_sweeper().await;
        assert!(registry.is_sweeper_running().await);
        assert_eq!(registry.len().await, 1);

        tokio::time::sleep(Duration::from_secs(61)).await;
        assert_eq!(registry.len().await, 0);

        registry.stop_sweeper().await;
        assert!(!registry.is_sweeper_running().await);
    }

    #[tokio::test(start_paused = true)]
    async fn test_start_sweeper_is_idempotent() {
        let registry = registry(60);
        registry.start_sweeper().await;
        registry.start_sweeper().await;
        assert!(registry.is_sweeper_running().await);

        registry.stop_sweeper().await;
        assert!(!registry.is_sweeper_running().await);
    }

    #[tokio::test]
    async fn test_stop_without_start_is_noop() {
        let registry = registry(60);
        registry.stop_sweeper().await;
        assert!(!registry.is_sweeper_running().await);
    }

    #[tokio::test(start_paused = true)]
    async fn test_sweeper_can_restart() {
        let registry = registry(60);
        registry.start_sweeper().await;
        registry.stop_sweeper().await;
        registry.start_sweeper().await;
        assert!(registry.is_sweeper_running().await);
        registry.stop_sweeper().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_sweeper_exits_when_registry_dropped() {
        let registry = registry(60);
        registry.start_sweeper().await;
        let slot = registry.sweeper.clone();
        drop(registry);

        tokio::time::sleep(Duration::from_secs(61)).await;
        tokio::task::yield_now().await;

        let guard = slot.lock().await;
        assert!(guard.as_ref().is_some_and(|h| h.task.is_finished()));
    }
}
