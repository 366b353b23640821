//! Scheduled operations executed against an endpoint.
//!
//! An action is one configured unit of work: read a node's metadata and
//! value, or probe just the value. Actions with a zero interval run once
//! and leave the schedule; recurring actions advance by a fixed period
//! after every attempt, deliberately without drift correction.

use std::time::Duration;

use tokio::time::Instant;

use crate::transport::Value;

/// Identifier assigned in creation order.
pub type ActionId = u64;

/// What an action does when it fires.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ActionKind {
    /// Fetch node metadata and the current value.
    Read,
    /// Fetch the value only, as a connectivity probe.
    Test,
}

impl ActionKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ActionKind::Read => "read",
            ActionKind::Test => "test",
        }
    }
}

/// Unscheduled description of an action, as produced by configuration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ActionSpec {
    pub kind: ActionKind,
    pub node_id: String,
    /// Zero means one-shot.
    pub interval: Duration,
}

impl ActionSpec {
    pub fn new(kind: ActionKind, node_id: impl Into<String>, interval: Duration) -> Self {
        Self {
            kind,
            node_id: node_id.into(),
            interval,
        }
    }
}

/// One scheduled operation against a node, plus its last observed result.
#[derive(Debug, Clone)]
pub struct Action {
    pub id: ActionId,
    pub endpoint_url: String,
    pub node_id: String,
    pub kind: ActionKind,
    /// Zero means one-shot.
    pub interval: Duration,
    /// Monotonic due time; new actions are due immediately.
    pub next_execution: Instant,
    pub last_value: Option<Value>,
    pub last_error: Option<String>,
}

impl Action {
    pub fn new(id: ActionId, endpoint_url: impl Into<String>, spec: ActionSpec, now: Instant) -> Self {
        Self {
            id,
            endpoint_url: endpoint_url.into(),
            node_id: spec.node_id,
            kind: spec.kind,
            interval: spec.interval,
            next_execution: now,
            last_value: None,
            last_error: None,
        }
    }

    pub fn is_one_shot(&self) -> bool {
        self.interval.is_zero()
    }

    pub fn is_due(&self, now: Instant) -> bool {
        self.next_execution <= now
    }

    /// Fixed-period advance: the next due time moves by exactly the
    /// interval, regardless of when the execution actually ran.
    pub fn advance(&mut self) {
        self.next_execution += self.interval;
    }

    pub fn record_success(&mut self, value: Value) {
        self.last_value = Some(value);
        self.last_error = None;
    }

    pub fn record_failure(&mut self, error: impl Into<String>) {
        self.last_error = Some(error.into());
    }
}
