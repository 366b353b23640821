//! Simulated in-memory protocol stack.
//!
//! Stands in for a real transport during dry runs and in every timing test.
//! Connect failures, per-node values, read failures, and health signals are
//! all scriptable, and the stack records the attempt timeouts and reads it
//! observes so tests can assert on backoff and scheduling behavior.

use std::collections::HashMap;
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use rand::Rng;
use tokio::sync::mpsc;

use crate::error::TransportError;
use crate::transport::{
    CURRENT_TIME_NODE, Connected, ConnectionHandle, EndpointInfo, HealthStatus, NodeInfo,
    Transport, Value,
};

/// Buffer size for a connection's health signal stream.
const HEALTH_BUFFER: usize = 8;

/// In-memory transport with scriptable behavior.
pub struct SimTransport {
    state: Mutex<SimState>,
    /// Upper bound for simulated per-call latency; zero disables the sleep.
    latency: Duration,
}

struct SimState {
    connections: HashMap<ConnectionHandle, SimConnection>,
    values: HashMap<String, Value>,
    failing_nodes: HashMap<String, String>,
    connect_failures_remaining: u32,
    attempt_timeouts: Vec<Duration>,
    read_log: Vec<String>,
    namespaces: Vec<String>,
}

struct SimConnection {
    endpoint: String,
    health_tx: mpsc::Sender<HealthStatus>,
}

impl SimTransport {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(SimState {
                connections: HashMap::new(),
                values: HashMap::new(),
                failing_nodes: HashMap::new(),
                connect_failures_remaining: 0,
                attempt_timeouts: Vec::new(),
                read_log: Vec::new(),
                namespaces: vec!["http://opcfoundation.org/UA/".to_string()],
            }),
            latency: Duration::ZERO,
        }
    }

    /// Sleep a random duration up to `latency` before each call, to make
    /// dry runs look like a network is involved.
    pub fn with_latency(mut self, latency: Duration) -> Self {
        self.latency = latency;
        self
    }

    /// Serve `value` for reads of `node_id`.
    pub fn with_value(self, node_id: impl Into<String>, value: Value) -> Self {
        self.lock().values.insert(node_id.into(), value);
        self
    }

    /// Fail the next `n` connection attempts.
    pub fn fail_connects(self, n: u32) -> Self {
        self.lock().connect_failures_remaining = n;
        self
    }

    /// Fail every read of `node_id` with the given reason.
    pub fn fail_reads(self, node_id: impl Into<String>, reason: impl Into<String>) -> Self {
        self.lock()
            .failing_nodes
            .insert(node_id.into(), reason.into());
        self
    }

    /// Deliver a health signal to the connection's subscriber.
    ///
    /// Returns false if the handle is unknown or the subscriber's buffer is
    /// full or dropped.
    pub fn emit_health(&self, handle: ConnectionHandle, status: HealthStatus) -> bool {
        let tx = match self.lock().connections.get(&handle) {
            Some(conn) => conn.health_tx.clone(),
            None => return false,
        };
        tx.try_send(status).is_ok()
    }

    /// Connection attempt timeouts observed so far, in order.
    pub fn attempt_timeouts(&self) -> Vec<Duration> {
        self.lock().attempt_timeouts.clone()
    }

    /// Number of value reads issued against `node_id`.
    pub fn reads_of(&self, node_id: &str) -> usize {
        self.lock().read_log.iter().filter(|n| *n == node_id).count()
    }

    /// Connections currently open.
    pub fn open_connections(&self) -> usize {
        self.lock().connections.len()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, SimState> {
        // The sim holds the lock only for map access, never across awaits.
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    async fn simulate_latency(&self) {
        if self.latency.is_zero() {
            return;
        }
        let cap = self.latency.as_millis() as u64;
        let jitter = rand::thread_rng().gen_range(0..=cap);
        tokio::time::sleep(Duration::from_millis(jitter)).await;
    }

    fn lookup_value(state: &SimState, node_id: &str) -> Result<Value, TransportError> {
        if let Some(reason) = state.failing_nodes.get(node_id) {
            return Err(TransportError::ReadFailed {
                node_id: node_id.to_string(),
                reason: reason.clone(),
            });
        }
        if let Some(value) = state.values.get(node_id) {
            return Ok(value.clone());
        }
        if node_id == CURRENT_TIME_NODE {
            return Ok(Value::DateTime(Utc::now()));
        }
        Err(TransportError::NodeNotFound {
            node_id: node_id.to_string(),
        })
    }
}

impl Default for SimTransport {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Transport for SimTransport {
    async fn connect(
        &self,
        endpoint: &str,
        _use_security: bool,
        timeout: Duration,
    ) -> Result<Connected, TransportError> {
        self.simulate_latency().await;

        let mut state = self.lock();
        state.attempt_timeouts.push(timeout);

        if state.connect_failures_remaining > 0 {
            state.connect_failures_remaining -= 1;
            return Err(TransportError::ConnectFailed {
                endpoint: endpoint.to_string(),
                reason: "simulated connect failure".to_string(),
            });
        }

        let handle = ConnectionHandle::new();
        let (health_tx, health) = mpsc::channel(HEALTH_BUFFER);
        state.connections.insert(
            handle,
            SimConnection {
                endpoint: endpoint.to_string(),
                health_tx,
            },
        );
        Ok(Connected { handle, health })
    }

    async fn endpoint_info(
        &self,
        handle: ConnectionHandle,
    ) -> Result<EndpointInfo, TransportError> {
        self.simulate_latency().await;

        let state = self.lock();
        let conn = state
            .connections
            .get(&handle)
            .ok_or(TransportError::StaleHandle)?;

        let mut namespaces = state.namespaces.clone();
        namespaces.push(conn.endpoint.clone());
        Ok(EndpointInfo {
            namespaces,
            min_sampling_interval: Some(Duration::from_millis(50)),
        })
    }

    async fn read_node(
        &self,
        handle: ConnectionHandle,
        node_id: &str,
    ) -> Result<NodeInfo, TransportError> {
        self.simulate_latency().await;

        let state = self.lock();
        if !state.connections.contains_key(&handle) {
            return Err(TransportError::StaleHandle);
        }
        // Metadata exists for exactly the nodes that serve values.
        Self::lookup_value(&state, node_id)?;
        Ok(NodeInfo {
            node_id: node_id.to_string(),
            browse_name: node_id.rsplit(['=', ';']).next().unwrap_or(node_id).to_string(),
            node_class: "Variable".to_string(),
            description: None,
        })
    }

    async fn read_value(
        &self,
        handle: ConnectionHandle,
        node_id: &str,
    ) -> Result<Value, TransportError> {
        self.simulate_latency().await;

        let mut state = self.lock();
        if !state.connections.contains_key(&handle) {
            return Err(TransportError::StaleHandle);
        }
        state.read_log.push(node_id.to_string());
        Self::lookup_value(&state, node_id)
    }

    async fn close(&self, handle: ConnectionHandle) {
        // Dropping the connection drops its health sender too.
        self.lock().connections.remove(&handle);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn connect_then_read_current_time() {
        let sim = SimTransport::new();
        let conn = sim
            .connect("opc.tcp://sim:4840", true, Duration::from_secs(5))
            .await
            .unwrap();

        let value = sim.read_value(conn.handle, CURRENT_TIME_NODE).await.unwrap();
        assert_eq!(value.kind(), "datetime");
        assert_eq!(sim.reads_of(CURRENT_TIME_NODE), 1);
    }

    #[tokio::test]
    async fn scripted_connect_failures_then_success() {
        let sim = SimTransport::new().fail_connects(2);

        for _ in 0..2 {
            let err = sim
                .connect("opc.tcp://sim:4840", true, Duration::from_secs(5))
                .await
                .unwrap_err();
            assert!(matches!(err, TransportError::ConnectFailed { .. }));
        }
        assert!(
            sim.connect("opc.tcp://sim:4840", true, Duration::from_secs(5))
                .await
                .is_ok()
        );
        assert_eq!(sim.attempt_timeouts().len(), 3);
    }

    #[tokio::test]
    async fn unknown_node_and_scripted_read_failure() {
        let sim = SimTransport::new()
            .with_value("ns=2;s=Level", Value::Double(7.25))
            .fail_reads("ns=2;s=Broken", "sensor offline");
        let conn = sim
            .connect("opc.tcp://sim:4840", true, Duration::from_secs(5))
            .await
            .unwrap();

        assert_eq!(
            sim.read_value(conn.handle, "ns=2;s=Level").await.unwrap(),
            Value::Double(7.25)
        );
        assert!(matches!(
            sim.read_value(conn.handle, "ns=2;s=Missing").await,
            Err(TransportError::NodeNotFound { .. })
        ));
        assert!(matches!(
            sim.read_value(conn.handle, "ns=2;s=Broken").await,
            Err(TransportError::ReadFailed { .. })
        ));
    }

    #[tokio::test]
    async fn close_invalidates_handle_and_health_channel() {
        let sim = SimTransport::new();
        let mut conn = sim
            .connect("opc.tcp://sim:4840", true, Duration::from_secs(5))
            .await
            .unwrap();

        assert!(sim.emit_health(conn.handle, HealthStatus::Healthy));
        assert_eq!(conn.health.recv().await, Some(HealthStatus::Healthy));

        sim.close(conn.handle).await;
        assert_eq!(sim.open_connections(), 0);
        assert!(!sim.emit_health(conn.handle, HealthStatus::Healthy));
        assert!(matches!(
            sim.read_value(conn.handle, CURRENT_TIME_NODE).await,
            Err(TransportError::StaleHandle)
        ));
        // Sender side is gone, so the stream ends.
        assert_eq!(conn.health.recv().await, None);
    }

    #[tokio::test]
    async fn endpoint_info_reports_namespaces() {
        let sim = SimTransport::new();
        let conn = sim
            .connect("opc.tcp://plant-7:4840", true, Duration::from_secs(5))
            .await
            .unwrap();

        let info = sim.endpoint_info(conn.handle).await.unwrap();
        assert_eq!(info.namespaces[0], "http://opcfoundation.org/UA/");
        assert!(info.namespaces.contains(&"opc.tcp://plant-7:4840".to_string()));
        assert!(info.min_sampling_interval.is_some());
    }
}
