//! Per-endpoint session: connection state machine and control loop.
//!
//! Each unique (endpoint, security) pair gets one [`Session`] and one
//! spawned control task. The task owns the timing contract: every
//! iteration waits for the next required activity — the fixed reconnect
//! poll tick or the earliest due action — or an explicit wake, then runs
//! connect-if-disconnected, execute-due-actions, and the prune hook in
//! order. Keep-alive signals arrive on a channel owned by the loop and can
//! force a disconnect so the following tick replaces a half-open
//! connection.
//!
//! Locking: all mutable session fields live behind one async mutex. The
//! connect step takes the lock to guard and transition, releases it across
//! the network call, and re-acquires it to commit the result, so observers
//! and health handling are never blocked on a slow round-trip.

mod registry;

pub use registry::SessionRegistry;

use std::sync::Arc;

use tokio::sync::{Mutex, mpsc};
use tokio::task::JoinHandle;
use tokio::time::{Duration, Instant};

use crate::action::Action;
use crate::config::SessionTunables;
use crate::error::TransportError;
use crate::transport::{
    ConnectionHandle, EndpointInfo, HealthReceiver, HealthStatus, Transport, Value,
};

/// Buffer for wake/shutdown commands; a full buffer means a wake is
/// already pending.
const COMMAND_BUFFER: usize = 4;

/// Connection lifecycle state.
///
/// Legal transitions: `Disconnected → Connecting → Connected →
/// Disconnected`, plus `Connecting → Disconnected` on a failed attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Disconnected,
    Connecting,
    Connected,
}

impl SessionState {
    pub fn as_str(&self) -> &'static str {
        match self {
            SessionState::Disconnected => "disconnected",
            SessionState::Connecting => "connecting",
            SessionState::Connected => "connected",
        }
    }
}

/// Control messages delivered into a session's loop.
#[derive(Debug)]
enum SessionCommand {
    /// Run an iteration now instead of waiting out the poll interval.
    Start,
    /// Stop the loop and close any open connection.
    Shutdown,
}

/// Mutable per-session fields, guarded by the session lock.
struct SessionInner {
    state: SessionState,
    connection: Option<ConnectionHandle>,
    unsuccessful_connects: u32,
    missed_keep_alives: u32,
    endpoint_info: Option<EndpointInfo>,
    /// Insertion order is execution order.
    actions: Vec<Action>,
    last_error: Option<String>,
}

impl SessionInner {
    /// `Connected` iff a handle is held; checked after every transition.
    fn assert_handle_matches_state(&self) {
        debug_assert_eq!(
            self.state == SessionState::Connected,
            self.connection.is_some(),
            "connection handle must be held exactly while connected"
        );
    }
}

/// One persistent, independently recovering connection to an endpoint.
pub struct Session {
    endpoint_url: String,
    use_security: bool,
    inner: Arc<Mutex<SessionInner>>,
    cmd_tx: mpsc::Sender<SessionCommand>,
    task: std::sync::Mutex<Option<JoinHandle<()>>>,
}

impl Session {
    /// Create the session and spawn its control loop. The loop starts in
    /// `Disconnected` and waits for its first tick or an explicit wake.
    pub fn spawn(
        endpoint_url: impl Into<String>,
        use_security: bool,
        tunables: SessionTunables,
        transport: Arc<dyn Transport>,
    ) -> Arc<Self> {
        let endpoint_url = endpoint_url.into();
        let inner = Arc::new(Mutex::new(SessionInner {
            state: SessionState::Disconnected,
            connection: None,
            unsuccessful_connects: 0,
            missed_keep_alives: 0,
            endpoint_info: None,
            actions: Vec::new(),
            last_error: None,
        }));
        let (cmd_tx, cmd_rx) = mpsc::channel(COMMAND_BUFFER);

        let session = Arc::new(Self {
            endpoint_url: endpoint_url.clone(),
            use_security,
            inner: Arc::clone(&inner),
            cmd_tx,
            task: std::sync::Mutex::new(None),
        });

        let control = SessionLoop {
            endpoint_url,
            use_security,
            tunables,
            transport,
            inner,
            cmd_rx,
            health_rx: None,
        };
        let handle = tokio::spawn(control.run());
        if let Ok(mut task) = session.task.lock() {
            *task = Some(handle);
        }
        session
    }

    pub fn endpoint_url(&self) -> &str {
        &self.endpoint_url
    }

    pub fn use_security(&self) -> bool {
        self.use_security
    }

    pub async fn state(&self) -> SessionState {
        self.inner.lock().await.state
    }

    pub async fn connection(&self) -> Option<ConnectionHandle> {
        self.inner.lock().await.connection
    }

    pub async fn unsuccessful_connects(&self) -> u32 {
        self.inner.lock().await.unsuccessful_connects
    }

    pub async fn missed_keep_alives(&self) -> u32 {
        self.inner.lock().await.missed_keep_alives
    }

    pub async fn last_error(&self) -> Option<String> {
        self.inner.lock().await.last_error.clone()
    }

    /// Namespace table and minimum sampling interval cached from the
    /// current connection, if any.
    pub async fn endpoint_info(&self) -> Option<EndpointInfo> {
        self.inner.lock().await.endpoint_info.clone()
    }

    pub async fn action_count(&self) -> usize {
        self.inner.lock().await.actions.len()
    }

    pub async fn recurring_action_count(&self) -> usize {
        self.inner
            .lock()
            .await
            .actions
            .iter()
            .filter(|a| !a.is_one_shot())
            .count()
    }

    /// Snapshot of the scheduled actions, in execution order.
    pub async fn actions(&self) -> Vec<Action> {
        self.inner.lock().await.actions.clone()
    }

    /// Append actions to the schedule, preserving insertion order.
    pub async fn add_actions(&self, actions: Vec<Action>) {
        self.inner.lock().await.actions.extend(actions);
    }

    /// Ask the control loop to run an iteration immediately instead of
    /// waiting out the poll interval. A full command buffer means a wake
    /// is already pending, which is just as good.
    pub fn wake(&self) {
        let _ = self.cmd_tx.try_send(SessionCommand::Start);
    }

    /// Ask the control loop to stop. In-flight work completes; the open
    /// connection, if any, is closed on the way out.
    pub async fn shutdown(&self) {
        let _ = self.cmd_tx.send(SessionCommand::Shutdown).await;
    }

    /// Whether the control loop has exited.
    pub fn is_finished(&self) -> bool {
        match self.task.lock() {
            Ok(task) => task.as_ref().map(|t| t.is_finished()).unwrap_or(true),
            Err(_) => true,
        }
    }
}

/// What woke the control loop.
enum LoopEvent {
    /// Run an iteration: poll tick elapsed or an explicit wake arrived.
    Tick,
    /// A health signal (or the end of the health stream) arrived.
    Health(Option<HealthStatus>),
    /// Shutdown was requested or the command channel closed.
    Stop,
}

/// State owned by the spawned control task.
struct SessionLoop {
    endpoint_url: String,
    use_security: bool,
    tunables: SessionTunables,
    transport: Arc<dyn Transport>,
    inner: Arc<Mutex<SessionInner>>,
    cmd_rx: mpsc::Receiver<SessionCommand>,
    /// Health subscription for the current connection; `None` while
    /// disconnected.
    health_rx: Option<HealthReceiver>,
}

impl SessionLoop {
    async fn run(mut self) {
        tracing::debug!(
            endpoint = %self.endpoint_url,
            security = self.use_security,
            "session control loop started"
        );

        loop {
            let wait = self.next_wait().await;

            let event = tokio::select! {
                cmd = self.cmd_rx.recv() => match cmd {
                    Some(SessionCommand::Start) => LoopEvent::Tick,
                    Some(SessionCommand::Shutdown) | None => LoopEvent::Stop,
                },
                status = Self::recv_health(&mut self.health_rx) => LoopEvent::Health(status),
                _ = tokio::time::sleep(wait) => LoopEvent::Tick,
            };

            match event {
                LoopEvent::Stop => break,
                LoopEvent::Health(status) => {
                    self.on_health_event(status).await;
                }
                LoopEvent::Tick => {
                    self.connect_if_disconnected().await;
                    self.execute_due_actions().await;
                    self.prune_if_unused().await;
                }
            }
        }

        self.disconnect("shutdown").await;
        tracing::debug!(endpoint = %self.endpoint_url, "session control loop stopped");
    }

    /// Minimal wait until the next required activity. While disconnected
    /// the reconnect tick alone paces the loop; due actions cannot run
    /// anyway and would otherwise turn an unreachable endpoint into a
    /// busy retry loop.
    async fn next_wait(&self) -> Duration {
        let inner = self.inner.lock().await;
        if inner.state != SessionState::Connected {
            return self.tunables.poll_interval;
        }

        let now = Instant::now();
        let mut wait = self.tunables.poll_interval;
        for action in &inner.actions {
            let until = action.next_execution.saturating_duration_since(now);
            if until < wait {
                wait = until;
            }
        }
        wait
    }

    /// Pending-forever when no connection is live, so the select arm only
    /// fires while a health subscription exists.
    async fn recv_health(rx: &mut Option<HealthReceiver>) -> Option<HealthStatus> {
        match rx {
            Some(rx) => rx.recv().await,
            None => std::future::pending().await,
        }
    }

    async fn connect_if_disconnected(&mut self) {
        let timeout = {
            let mut inner = self.inner.lock().await;
            match inner.state {
                SessionState::Connecting | SessionState::Connected => return,
                SessionState::Disconnected => {}
            }
            inner.state = SessionState::Connecting;
            self.tunables.attempt_timeout(inner.unsuccessful_connects)
        };

        tracing::debug!(
            endpoint = %self.endpoint_url,
            security = self.use_security,
            ?timeout,
            "connecting"
        );

        // Lock released across the network call.
        let result = self
            .transport
            .connect(&self.endpoint_url, self.use_security, timeout)
            .await;

        match result {
            Ok(connected) => {
                let info = match self.transport.endpoint_info(connected.handle).await {
                    Ok(info) => info,
                    Err(e) => {
                        tracing::warn!(
                            endpoint = %self.endpoint_url,
                            error = %e,
                            "endpoint info unavailable"
                        );
                        EndpointInfo::default()
                    }
                };

                let mut inner = self.inner.lock().await;
                inner.state = SessionState::Connected;
                inner.connection = Some(connected.handle);
                inner.unsuccessful_connects = 0;
                inner.missed_keep_alives = 0;
                inner.last_error = None;
                tracing::info!(
                    endpoint = %self.endpoint_url,
                    security = self.use_security,
                    namespaces = info.namespaces.len(),
                    "session connected"
                );
                inner.endpoint_info = Some(info);
                inner.assert_handle_matches_state();
                self.health_rx = Some(connected.health);
            }
            Err(e) => {
                let mut inner = self.inner.lock().await;
                inner.state = SessionState::Disconnected;
                inner.unsuccessful_connects += 1;
                inner.last_error = Some(e.to_string());
                inner.assert_handle_matches_state();
                tracing::warn!(
                    endpoint = %self.endpoint_url,
                    attempts = inner.unsuccessful_connects,
                    error = %e,
                    "connect failed, retrying on next tick"
                );
            }
        }
    }

    /// Execute every due action in insertion order, then apply the
    /// schedule changes: one-shots leave the list, recurring actions
    /// advance by their fixed period whether or not they succeeded.
    ///
    /// Execution runs over a snapshot with the lock released, and removals
    /// are applied afterwards, so the live list is never mutated while
    /// being iterated.
    async fn execute_due_actions(&mut self) {
        let (handle, due) = {
            let inner = self.inner.lock().await;
            let Some(handle) = inner.connection else {
                return;
            };
            let now = Instant::now();
            let due: Vec<Action> = inner.actions.iter().filter(|a| a.is_due(now)).cloned().collect();
            (handle, due)
        };

        let mut outcomes = Vec::with_capacity(due.len());
        for action in &due {
            let outcome = self.execute_action(handle, action).await;
            match &outcome {
                Ok(value) => tracing::info!(
                    endpoint = %self.endpoint_url,
                    action = action.id,
                    kind = action.kind.as_str(),
                    node = %action.node_id,
                    value_kind = value.kind(),
                    value = %value,
                    "action executed"
                ),
                Err(e) => tracing::warn!(
                    endpoint = %self.endpoint_url,
                    action = action.id,
                    kind = action.kind.as_str(),
                    node = %action.node_id,
                    error = %e,
                    "action failed"
                ),
            }
            outcomes.push((action.id, outcome));
        }

        if outcomes.is_empty() {
            return;
        }

        let mut inner = self.inner.lock().await;
        for (id, outcome) in outcomes {
            let Some(pos) = inner.actions.iter().position(|a| a.id == id) else {
                continue;
            };
            if inner.actions[pos].is_one_shot() {
                // One-shots leave the schedule even on failure.
                inner.actions.remove(pos);
                continue;
            }
            let action = &mut inner.actions[pos];
            action.advance();
            match outcome {
                Ok(value) => action.record_success(value),
                Err(e) => action.record_failure(e.to_string()),
            }
        }
    }

    /// Single dispatch site over the closed action kind set.
    async fn execute_action(
        &self,
        handle: ConnectionHandle,
        action: &Action,
    ) -> Result<Value, TransportError> {
        match action.kind {
            crate::action::ActionKind::Read => {
                let node = self.transport.read_node(handle, &action.node_id).await?;
                tracing::debug!(
                    endpoint = %self.endpoint_url,
                    node = %node.node_id,
                    browse_name = %node.browse_name,
                    class = %node.node_class,
                    "node metadata"
                );
                self.transport.read_value(handle, &action.node_id).await
            }
            crate::action::ActionKind::Test => {
                self.transport.read_value(handle, &action.node_id).await
            }
        }
    }

    async fn on_health_event(&mut self, status: Option<HealthStatus>) {
        match status {
            Some(HealthStatus::Healthy) => {
                let mut inner = self.inner.lock().await;
                if inner.missed_keep_alives != 0 {
                    tracing::debug!(endpoint = %self.endpoint_url, "keep-alive recovered");
                    inner.missed_keep_alives = 0;
                }
            }
            Some(HealthStatus::Unhealthy) => {
                let trip = {
                    let mut inner = self.inner.lock().await;
                    if inner.state != SessionState::Connected {
                        return;
                    }
                    inner.missed_keep_alives += 1;
                    tracing::warn!(
                        endpoint = %self.endpoint_url,
                        missed = inner.missed_keep_alives,
                        threshold = self.tunables.keep_alive_threshold,
                        "missed keep-alive"
                    );
                    inner.missed_keep_alives >= self.tunables.keep_alive_threshold
                };
                if trip {
                    self.disconnect("keep-alive threshold reached").await;
                }
            }
            None => {
                // The stack dropped the health stream: the connection is gone.
                let connected = self.inner.lock().await.state == SessionState::Connected;
                self.health_rx = None;
                if connected {
                    self.disconnect("health stream closed").await;
                }
            }
        }
    }

    /// Close the current connection, if any, and return to `Disconnected`
    /// so the next tick retries cleanly.
    async fn disconnect(&mut self, reason: &str) {
        let handle = {
            let mut inner = self.inner.lock().await;
            let handle = inner.connection.take();
            if handle.is_some() {
                inner.state = SessionState::Disconnected;
                inner.missed_keep_alives = 0;
                inner.endpoint_info = None;
            }
            inner.assert_handle_matches_state();
            handle
        };
        self.health_rx = None;

        if let Some(handle) = handle {
            self.transport.close(handle).await;
            tracing::info!(endpoint = %self.endpoint_url, reason, "session disconnected");
        }
    }

    /// Hook for endpoint cleanup policies. A session whose schedule has
    /// drained stays connected for now; a future policy may close it here.
    async fn prune_if_unused(&self) {
        let inner = self.inner.lock().await;
        if inner.actions.is_empty() {
            tracing::trace!(endpoint = %self.endpoint_url, "no scheduled actions remain");
        }
    }
}
