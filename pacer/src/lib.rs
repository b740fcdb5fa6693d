//! Emit fixed-size messages at a target rate on a discrete-event scheduler.
//!
//! A [sender::PacedSender] sends a bounded number of equally sized units over a
//! [Connection], spacing them so the average throughput matches a [rate::DataRate].
//! Every completed send schedules exactly one follow-up send through a [Scheduler]
//! and stopping the sender cancels whatever is still pending.
//!
//! # Terminology
//!
//! The sender never owns a clock. It is handed a [Scheduler] (virtual time plus
//! "call me back after `d`") and a [Connection] (bind, connect, send, close). The
//! `deterministic` module provides a scheduler for tests and simulations, `mocks`
//! a recording connection, and `simulated` a connection backed by a multi-hop
//! link model.
//!
//! # Status
//!
//! `commonware-pacer` is **ALPHA** software and is not yet recommended for production use. Developers should
//! expect breaking changes and occasional instability.

#![doc(
    html_logo_url = "https://commonware.xyz/imgs/rustdoc_logo.svg",
    html_favicon_url = "https://commonware.xyz/favicon.ico"
)]

use bytes::Bytes;
use std::{
    fmt::Debug,
    time::{Duration, SystemTime},
};
use thiserror::Error;

pub mod application;
pub mod deterministic;
pub mod mocks;
pub mod rate;
pub mod sender;
pub mod simulated;
pub mod trace;

pub use application::{install, Application};
pub use rate::DataRate;
pub use sender::PacedSender;
pub use trace::WindowTracer;

/// Prefix for scheduler metrics.
const METRICS_PREFIX: &str = "runtime";

/// Errors that can occur when configuring or driving a sender.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum Error {
    #[error("unit size must be non-zero")]
    InvalidUnitSize,
    #[error("invalid rate: {0}")]
    InvalidRate(String),
    #[error("stop must not precede start")]
    InvalidLifetime,
    #[error("sender not configured")]
    NotConfigured,
    #[error("sender already running")]
    AlreadyRunning,
    #[error("bind failed")]
    BindFailed,
    #[error("connection failed")]
    ConnectionFailed,
    #[error("not connected")]
    NotConnected,
    #[error("send failed")]
    SendFailed,
}

/// Identifier of a callback registered with a [Scheduler].
#[derive(Clone, Copy, Debug, Hash, PartialEq, Eq, PartialOrd, Ord)]
pub struct EventId(u64);

impl EventId {
    /// Wrap a raw identifier.
    pub const fn new(id: u64) -> Self {
        Self(id)
    }

    /// Raw identifier.
    pub const fn get(&self) -> u64 {
        self.0
    }
}

/// Interface that any discrete-event scheduler must implement.
///
/// Callbacks run one at a time, ordered by due time and then by the order in
/// which they were scheduled. A callback never runs concurrently with the code
/// that scheduled it.
pub trait Scheduler: Clone + Send + Sync + 'static {
    /// Returns the current (virtual) time.
    fn current(&self) -> SystemTime;

    /// Invoke `callback` once `delay` has elapsed.
    fn schedule<F>(&self, delay: Duration, callback: F) -> EventId
    where
        F: FnOnce() + Send + 'static;

    /// Drop a pending callback.
    ///
    /// Cancelling an event that already fired (or was already cancelled) is a no-op.
    fn cancel(&self, event: EventId);

    /// Returns whether `event` is still waiting to fire.
    fn is_pending(&self, event: EventId) -> bool;
}

/// Interface that any message-oriented connection must implement.
///
/// All calls are treated as immediate: latency is modeled by whoever schedules
/// the delivery, never by blocking the caller.
pub trait Connection: Send + 'static {
    /// Identifier of the remote endpoint.
    type Address: Clone + Debug + Send + Sync + 'static;

    /// Allocate a local endpoint.
    fn bind(&mut self) -> Result<(), Error>;

    /// Associate the bound endpoint with `peer`.
    fn connect(&mut self, peer: Self::Address) -> Result<(), Error>;

    /// Hand `payload` to the connection.
    fn send(&mut self, payload: Bytes) -> Result<(), Error>;

    /// Release the endpoint. Closing a closed connection is a no-op.
    fn close(&mut self);
}

/// Encode `bytes` as lowercase hexadecimal.
pub(crate) fn hex(bytes: &[u8]) -> String {
    let mut hex = String::with_capacity(bytes.len() * 2);
    for byte in bytes.iter() {
        hex.push_str(&format!("{:02x}", byte));
    }
    hex
}
