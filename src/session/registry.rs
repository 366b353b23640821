//! Shared registry of all endpoint sessions.
//!
//! The registry owns every session. The list lives behind one async mutex:
//! creation, enumeration, counts, and shutdown all take that lock, so
//! observers always see a consistent snapshot. The registry lock is never
//! held across network I/O — session work happens through the sessions'
//! own locks and control loops.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use tokio::sync::Mutex;
use tokio::time::{Duration, Instant};

use crate::action::{Action, ActionSpec};
use crate::config::SessionTunables;
use crate::diagnostics::DiagnosticsSnapshot;
use crate::session::{Session, SessionState};
use crate::transport::Transport;

/// How many short intervals `shutdown_all` waits for loops to finish.
const SHUTDOWN_RETRIES: u32 = 10;

/// Length of one shutdown retry interval.
const SHUTDOWN_RETRY_INTERVAL: Duration = Duration::from_millis(200);

/// Concurrency-safe collection of all sessions.
pub struct SessionRegistry {
    sessions: Mutex<Vec<Arc<Session>>>,
    tunables: SessionTunables,
    transport: Arc<dyn Transport>,
    /// Action ids are assigned in creation order, starting at 1.
    next_action_id: AtomicU64,
}

impl SessionRegistry {
    pub fn new(transport: Arc<dyn Transport>, tunables: SessionTunables) -> Self {
        Self {
            sessions: Mutex::new(Vec::new()),
            tunables,
            transport,
            next_action_id: AtomicU64::new(1),
        }
    }

    /// Get or create the session for an (endpoint, security) pair and
    /// schedule the given actions on it.
    ///
    /// Idempotent per pair: a second call with the same endpoint and
    /// security mode accumulates its actions on the existing session.
    pub async fn create_session(
        &self,
        endpoint_url: &str,
        use_security: bool,
        specs: Vec<ActionSpec>,
    ) -> Arc<Session> {
        let session = {
            let mut sessions = self.sessions.lock().await;
            match sessions
                .iter()
                .find(|s| s.endpoint_url() == endpoint_url && s.use_security() == use_security)
            {
                Some(existing) => Arc::clone(existing),
                None => {
                    tracing::info!(
                        endpoint = endpoint_url,
                        security = use_security,
                        "creating session"
                    );
                    let session = Session::spawn(
                        endpoint_url,
                        use_security,
                        self.tunables.clone(),
                        Arc::clone(&self.transport),
                    );
                    sessions.push(Arc::clone(&session));
                    session
                }
            }
        };

        let now = Instant::now();
        let actions: Vec<Action> = specs
            .into_iter()
            .map(|spec| {
                let id = self.next_action_id.fetch_add(1, Ordering::Relaxed);
                Action::new(id, endpoint_url, spec, now)
            })
            .collect();
        if !actions.is_empty() {
            session.add_actions(actions).await;
        }
        session
    }

    pub async fn count_all(&self) -> usize {
        self.sessions.lock().await.len()
    }

    pub async fn count_connected(&self) -> usize {
        let sessions = self.snapshot_sessions().await;
        let mut connected = 0;
        for session in &sessions {
            if session.state().await == SessionState::Connected {
                connected += 1;
            }
        }
        connected
    }

    pub async fn count_actions(&self) -> usize {
        let sessions = self.snapshot_sessions().await;
        let mut total = 0;
        for session in &sessions {
            total += session.action_count().await;
        }
        total
    }

    pub async fn count_recurring_actions(&self) -> usize {
        let sessions = self.snapshot_sessions().await;
        let mut total = 0;
        for session in &sessions {
            total += session.recurring_action_count().await;
        }
        total
    }

    /// One-pass snapshot of all diagnostics counters.
    pub async fn snapshot(&self) -> DiagnosticsSnapshot {
        let sessions = self.snapshot_sessions().await;
        let mut snap = DiagnosticsSnapshot {
            total_sessions: sessions.len(),
            connected_sessions: 0,
            total_actions: 0,
            recurring_actions: 0,
        };
        for session in &sessions {
            if session.state().await == SessionState::Connected {
                snap.connected_sessions += 1;
            }
            snap.total_actions += session.action_count().await;
            snap.recurring_actions += session.recurring_action_count().await;
        }
        snap
    }

    /// Wake every session's control loop so freshly configured sessions
    /// connect immediately instead of waiting a full poll interval.
    pub async fn start_all(&self) {
        let sessions = self.snapshot_sessions().await;
        tracing::info!(sessions = sessions.len(), "starting all sessions");
        for session in &sessions {
            session.wake();
        }
    }

    /// Drain the registry and stop every session, waiting a bounded
    /// number of short intervals for the loops to finish. Best-effort:
    /// stragglers are logged and abandoned.
    pub async fn shutdown_all(&self) {
        let sessions: Vec<Arc<Session>> = {
            let mut guard = self.sessions.lock().await;
            guard.drain(..).collect()
        };
        if sessions.is_empty() {
            return;
        }
        tracing::info!(sessions = sessions.len(), "shutting down all sessions");

        for session in &sessions {
            session.shutdown().await;
        }

        for _ in 0..SHUTDOWN_RETRIES {
            if sessions.iter().all(|s| s.is_finished()) {
                tracing::info!("all sessions shut down");
                return;
            }
            tokio::time::sleep(SHUTDOWN_RETRY_INTERVAL).await;
        }

        for session in sessions.iter().filter(|s| !s.is_finished()) {
            tracing::warn!(
                endpoint = session.endpoint_url(),
                "session did not shut down in time, abandoning"
            );
        }
    }

    /// Clone the session list under the registry lock.
    async fn snapshot_sessions(&self) -> Vec<Arc<Session>> {
        self.sessions.lock().await.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::action::ActionKind;
    use crate::transport::CURRENT_TIME_NODE;
    use crate::transport::sim::SimTransport;

    fn tunables() -> SessionTunables {
        SessionTunables {
            session_timeout_base: Duration::from_secs(10),
            backoff_max: 5,
            keep_alive_threshold: 3,
            poll_interval: Duration::from_secs(5),
        }
    }

    fn registry(sim: &Arc<SimTransport>) -> SessionRegistry {
        SessionRegistry::new(Arc::clone(sim) as Arc<dyn Transport>, tunables())
    }

    fn probe_spec(interval_secs: u64) -> ActionSpec {
        ActionSpec::new(
            ActionKind::Test,
            CURRENT_TIME_NODE,
            Duration::from_secs(interval_secs),
        )
    }

    async fn settle() {
        for _ in 0..64 {
            tokio::task::yield_now().await;
        }
    }

    #[tokio::test(start_paused = true)]
    async fn create_session_is_idempotent_per_pair() {
        let sim = Arc::new(SimTransport::new());
        let registry = registry(&sim);

        let a = registry
            .create_session("opc.tcp://plant-7:4840", true, vec![probe_spec(30)])
            .await;
        let b = registry
            .create_session("opc.tcp://plant-7:4840", true, vec![probe_spec(60)])
            .await;
        assert!(Arc::ptr_eq(&a, &b), "same pair reuses the session");
        assert_eq!(a.action_count().await, 2, "actions accumulate");

        // Same endpoint, different security mode: a distinct session.
        let c = registry
            .create_session("opc.tcp://plant-7:4840", false, vec![])
            .await;
        assert!(!Arc::ptr_eq(&a, &c));
        assert_eq!(registry.count_all().await, 2);

        registry.shutdown_all().await;
    }

    #[tokio::test(start_paused = true)]
    async fn action_ids_follow_creation_order() {
        let sim = Arc::new(SimTransport::new());
        let registry = registry(&sim);

        let session = registry
            .create_session(
                "opc.tcp://plant-7:4840",
                true,
                vec![probe_spec(10), probe_spec(0), probe_spec(20)],
            )
            .await;

        let ids: Vec<u64> = session.actions().await.iter().map(|a| a.id).collect();
        assert_eq!(ids, vec![1, 2, 3]);

        registry.shutdown_all().await;
    }

    #[tokio::test(start_paused = true)]
    async fn counts_and_snapshot() {
        let sim = Arc::new(SimTransport::new());
        let registry = registry(&sim);

        registry
            .create_session(
                "opc.tcp://plant-7:4840",
                true,
                vec![probe_spec(30), probe_spec(0)],
            )
            .await;
        registry
            .create_session("opc.tcp://plant-8:4840", true, vec![probe_spec(60)])
            .await;

        assert_eq!(registry.count_all().await, 2);
        assert_eq!(registry.count_connected().await, 0);
        assert_eq!(registry.count_actions().await, 3);
        assert_eq!(registry.count_recurring_actions().await, 2);

        registry.start_all().await;
        settle().await;

        let snap = registry.snapshot().await;
        assert_eq!(snap.total_sessions, 2);
        assert_eq!(snap.connected_sessions, 2);
        // The one-shot ran on the first tick and left the schedule.
        assert_eq!(snap.total_actions, 2);
        assert_eq!(snap.recurring_actions, 2);

        registry.shutdown_all().await;
    }

    #[tokio::test(start_paused = true)]
    async fn shutdown_all_closes_handles_and_drains_the_list() {
        let sim = Arc::new(SimTransport::new());
        let registry = registry(&sim);

        let a = registry
            .create_session("opc.tcp://plant-7:4840", true, vec![probe_spec(30)])
            .await;
        let b = registry
            .create_session("opc.tcp://plant-8:4840", true, vec![probe_spec(30)])
            .await;

        registry.start_all().await;
        settle().await;
        assert_eq!(registry.count_connected().await, 2);
        assert_eq!(sim.open_connections(), 2);

        registry.shutdown_all().await;

        assert_eq!(registry.count_all().await, 0, "registry list is drained");
        assert!(a.is_finished());
        assert!(b.is_finished());
        assert_eq!(sim.open_connections(), 0, "both handles closed");
        assert_eq!(a.state().await, SessionState::Disconnected);
        assert_eq!(b.state().await, SessionState::Disconnected);
    }

    #[tokio::test(start_paused = true)]
    async fn shutdown_all_on_empty_registry_is_a_no_op() {
        let sim = Arc::new(SimTransport::new());
        let registry = registry(&sim);
        registry.shutdown_all().await;
        assert_eq!(registry.count_all().await, 0);
    }
}
