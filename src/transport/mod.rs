//! Boundary to the protocol stack.
//!
//! The core never speaks the wire protocol itself. Everything it needs from
//! the stack is expressed by the [`Transport`] trait: connecting with an
//! explicit timeout, reading node metadata and values, and closing. Health
//! signals for an established connection arrive as messages on an mpsc
//! channel handed back with the connection handle, so keep-alives enter the
//! session's control loop like any other event instead of mutating shared
//! state from a foreign thread.

pub mod sim;

use std::fmt;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::mpsc;
use uuid::Uuid;

use crate::error::TransportError;

/// Well-known node carrying the server's current time. Every conformant
/// server exposes it, which makes it the natural connectivity-probe target.
pub const CURRENT_TIME_NODE: &str = "i=2258";

/// Opaque identity of one live connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ConnectionHandle(Uuid);

impl ConnectionHandle {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for ConnectionHandle {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for ConnectionHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// A decoded attribute value, tagged with its primitive kind.
#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    Null,
    Boolean(bool),
    Int32(i32),
    UInt32(u32),
    Int64(i64),
    UInt64(u64),
    Float(f32),
    Double(f64),
    Text(String),
    DateTime(DateTime<Utc>),
    Bytes(Vec<u8>),
}

impl Value {
    /// The wire-level type tag carried alongside the decoded value.
    pub fn kind(&self) -> &'static str {
        match self {
            Value::Null => "null",
            Value::Boolean(_) => "boolean",
            Value::Int32(_) => "int32",
            Value::UInt32(_) => "uint32",
            Value::Int64(_) => "int64",
            Value::UInt64(_) => "uint64",
            Value::Float(_) => "float",
            Value::Double(_) => "double",
            Value::Text(_) => "string",
            Value::DateTime(_) => "datetime",
            Value::Bytes(_) => "bytestring",
        }
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::Null => write!(f, "null"),
            Value::Boolean(v) => write!(f, "{v}"),
            Value::Int32(v) => write!(f, "{v}"),
            Value::UInt32(v) => write!(f, "{v}"),
            Value::Int64(v) => write!(f, "{v}"),
            Value::UInt64(v) => write!(f, "{v}"),
            Value::Float(v) => write!(f, "{v}"),
            Value::Double(v) => write!(f, "{v}"),
            Value::Text(v) => write!(f, "{v}"),
            Value::DateTime(v) => write!(f, "{}", v.to_rfc3339()),
            Value::Bytes(v) => write!(f, "{} bytes", v.len()),
        }
    }
}

/// Node metadata returned by a metadata read.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NodeInfo {
    pub node_id: String,
    pub browse_name: String,
    pub node_class: String,
    pub description: Option<String>,
}

/// Endpoint facts that cannot change while a connection is live,
/// fetched once after connect and cached on the session.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct EndpointInfo {
    /// Namespace table of the server, in index order.
    pub namespaces: Vec<String>,
    /// Fastest sampling interval the server supports, if it reports one.
    pub min_sampling_interval: Option<Duration>,
}

/// Health signal emitted by an established connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HealthStatus {
    /// The connection answered its keep-alive.
    Healthy,
    /// A keep-alive window elapsed without an answer.
    Unhealthy,
}

/// Receiver half of a connection's health signal stream.
pub type HealthReceiver = mpsc::Receiver<HealthStatus>;

/// A freshly established connection: the opaque handle plus the health
/// subscription registered for it.
#[derive(Debug)]
pub struct Connected {
    pub handle: ConnectionHandle,
    pub health: HealthReceiver,
}

/// Capability the core requires from the protocol stack.
///
/// Implementations own session negotiation, security channels, and message
/// encoding; the core only schedules calls and reacts to their outcomes.
#[async_trait]
pub trait Transport: Send + Sync {
    /// Establish a connection to `endpoint`, giving up after `timeout`.
    async fn connect(
        &self,
        endpoint: &str,
        use_security: bool,
        timeout: Duration,
    ) -> Result<Connected, TransportError>;

    /// Fetch the endpoint facts cached for the lifetime of the connection.
    async fn endpoint_info(
        &self,
        handle: ConnectionHandle,
    ) -> Result<EndpointInfo, TransportError>;

    /// Read metadata for a node.
    async fn read_node(
        &self,
        handle: ConnectionHandle,
        node_id: &str,
    ) -> Result<NodeInfo, TransportError>;

    /// Read the current value of a node.
    async fn read_value(
        &self,
        handle: ConnectionHandle,
        node_id: &str,
    ) -> Result<Value, TransportError>;

    /// Close the connection. Closing an already-dead handle is a no-op.
    async fn close(&self, handle: ConnectionHandle);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn value_kind_tags() {
        assert_eq!(Value::Null.kind(), "null");
        assert_eq!(Value::Boolean(true).kind(), "boolean");
        assert_eq!(Value::Int32(-5).kind(), "int32");
        assert_eq!(Value::Double(1.5).kind(), "double");
        assert_eq!(Value::Text("x".into()).kind(), "string");
        assert_eq!(Value::Bytes(vec![1, 2]).kind(), "bytestring");
    }

    #[test]
    fn value_display() {
        assert_eq!(Value::Int32(42).to_string(), "42");
        assert_eq!(Value::Text("hello".into()).to_string(), "hello");
        assert_eq!(Value::Bytes(vec![0; 3]).to_string(), "3 bytes");
    }

    #[test]
    fn handles_are_distinct() {
        assert_ne!(ConnectionHandle::new(), ConnectionHandle::new());
    }
}
