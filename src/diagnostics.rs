//! Periodic diagnostics reporting over the session registry.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tokio::task::JoinHandle;

use crate::session::SessionRegistry;

/// Read-only counters snapshot, taken under the registry lock.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DiagnosticsSnapshot {
    pub total_sessions: usize,
    pub connected_sessions: usize,
    pub total_actions: usize,
    pub recurring_actions: usize,
}

/// Spawn the periodic reporter as a background task.
///
/// Skips the immediate first tick, then logs a snapshot every `interval`
/// until the shutdown signal flips.
pub fn spawn_diagnostics(
    registry: Arc<SessionRegistry>,
    interval: Duration,
    mut shutdown: watch::Receiver<bool>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        // Don't report at startup before anything has happened.
        ticker.tick().await;

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    let snap = registry.snapshot().await;
                    tracing::info!(
                        total_sessions = snap.total_sessions,
                        connected_sessions = snap.connected_sessions,
                        total_actions = snap.total_actions,
                        recurring_actions = snap.recurring_actions,
                        "session diagnostics"
                    );
                }
                _ = shutdown.changed() => break,
            }
        }
    })
}
