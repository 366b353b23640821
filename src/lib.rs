//! Session-lifecycle core for a persistent industrial endpoint client.
//!
//! ironprobe maintains independently recovering connections to a
//! configurable set of endpoints and executes scheduled read/probe actions
//! against each one. The wire protocol itself is out of scope: a protocol
//! stack plugs in through the [`transport::Transport`] trait, and the core
//! only drives connect/retry/health/scheduling policy around it.
//!
//! The moving parts:
//! - [`session::Session`] — one control loop per endpoint: connection state
//!   machine with capped linear backoff, keep-alive accounting, and a
//!   scheduler that waits exactly until the next required activity.
//! - [`session::SessionRegistry`] — the shared, lock-disciplined collection
//!   of sessions: creation, counts, coordinated startup and shutdown.
//! - [`action::Action`] — one configured unit of work, one-shot or
//!   recurring with fixed-period scheduling.
//! - [`diagnostics`] — periodic read-only counter reporting.

pub mod action;
pub mod config;
pub mod diagnostics;
pub mod error;
pub mod session;
pub mod transport;
