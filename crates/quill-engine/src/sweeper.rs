//! Background sweeper
//!
//! Periodically reclaims expired sessions, expired bans and idle rate-limit
//! records. Expiry is already enforced lazily on every lookup, so the
//! sweeper only bounds memory.

use crate::engine::TransformEngine;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

/// Handle to a running sweeper task
pub struct SweeperHandle {
    shutdown_tx: mpsc::Sender<()>,
    handle: JoinHandle<()>,
}

impl SweeperHandle {
    /// Stop the task and wait for it to finish
    pub async fn shutdown(self) {
        let _ = self.shutdown_tx.send(()).await;
        if let Err(e) = self.handle.await {
            tracing::error!("Sweeper task failed: {}", e);
        }
    }

    pub fn is_finished(&self) -> bool {
        self.handle.is_finished()
    }
}

/// Spawn the sweeper on the current tokio runtime
pub fn spawn_sweeper(engine: Arc<TransformEngine>, interval: Duration) -> SweeperHandle {
    let (shutdown_tx, mut shutdown_rx) = mpsc::channel::<()>(1);

    let handle = tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        // The first tick completes immediately
        ticker.tick().await;

        tracing::debug!("Sweeper started ({:?} interval)", interval);

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    let summary = engine.sweep();
                    if summary.sessions_expired > 0
                        || summary.rate_limit.expired_bans > 0
                        || summary.rate_limit.idle_records > 0
                    {
                        tracing::info!(
                            "Sweep: {} sessions, {} bans, {} rate records reclaimed",
                            summary.sessions_expired,
                            summary.rate_limit.expired_bans,
                            summary.rate_limit.idle_records
                        );
                    }
                }
                _ = shutdown_rx.recv() => {
                    tracing::debug!("Sweeper stopping");
                    break;
                }
            }
        }
    });

    SweeperHandle {
        shutdown_tx,
        handle,
    }
}

impl TransformEngine {
    /// Spawn a background sweeper for this engine
    pub fn spawn_sweeper(self: &Arc<Self>, interval: Duration) -> SweeperHandle {
        spawn_sweeper(Arc::clone(self), interval)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::EngineConfig;
    use crate::engine::TransformRequest;
    use quill_core::ManualClock;

    #[tokio::test]
    async fn test_sweeper_reclaims_expired_sessions() {
        let clock = Arc::new(ManualClock::new(0));
        let engine = Arc::new(
            TransformEngine::with_clock(EngineConfig::default(), clock.clone()).unwrap(),
        );

        engine
            .transform(&TransformRequest::new("隐藏横幅", "192.0.2.1", "ua"))
            .unwrap();
        assert_eq!(engine.stats().sessions.active_sessions, 1);

        clock.advance(Duration::from_secs(31 * 60));
        let sweeper = engine.spawn_sweeper(Duration::from_millis(10));

        let mut reclaimed = false;
        for _ in 0..100 {
            tokio::time::sleep(Duration::from_millis(10)).await;
            if engine.stats().sessions.active_sessions == 0 {
                reclaimed = true;
                break;
            }
        }
        assert!(reclaimed);
        assert_eq!(engine.stats().sessions.stored_snapshots, 0);

        sweeper.shutdown().await;
    }

    #[tokio::test]
    async fn test_shutdown_stops_task() {
        let engine = Arc::new(TransformEngine::new(EngineConfig::default()).unwrap());
        let sweeper = spawn_sweeper(engine, Duration::from_secs(3600));
        assert!(!sweeper.is_finished());
        sweeper.shutdown().await;
    }
}
