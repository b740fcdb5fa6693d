//! Send a bounded burst of fixed-size units at a target rate.
//!
//! # Design
//!
//! A [PacedSender] performs one send when started and, while units remain,
//! schedules exactly one callback that performs the next send `unit_size * 8 / rate`
//! seconds later. At most one callback is outstanding at any time:
//!
//! ```text
//!   start ──▶ send_one ──▶ schedule_next ──(Δ)──▶ send_one ──▶ ... ──▶ exhausted
//!                               │
//!   stop  ──────────────────────┴──▶ cancel pending + close connection
//! ```
//!
//! Each session carries a generation number. A callback only acts if it belongs
//! to the session that is still running, and it only holds a weak reference to
//! the sender (dropping the sender silences it).

use crate::{rate::DataRate, Connection, Error, EventId, Scheduler};
use bytes::Bytes;
use prometheus_client::{metrics::counter::Counter, registry::Registry};
use std::sync::{Arc, Mutex};
use tracing::{debug, trace};

/// Parameters of a pacing session.
#[derive(Clone, Debug)]
pub struct Config<A> {
    /// Destination handed to [Connection::connect].
    pub peer: A,

    /// Size of each unit in bytes (must be non-zero).
    pub unit_size: usize,

    /// Number of units to send per session.
    pub total_units: u64,

    /// Target average rate.
    pub rate: DataRate,
}

/// Lifecycle of a [PacedSender].
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum State {
    Idle,
    Running,
}

struct Metrics {
    sessions: Counter,
    units_sent: Counter,
    bytes_sent: Counter,
    send_failures: Counter,
    scheduled: Counter,
    schedule_skipped: Counter,
    cancelled: Counter,
}

impl Metrics {
    fn init(registry: &mut Registry) -> Self {
        let metrics = Self {
            sessions: Counter::default(),
            units_sent: Counter::default(),
            bytes_sent: Counter::default(),
            send_failures: Counter::default(),
            scheduled: Counter::default(),
            schedule_skipped: Counter::default(),
            cancelled: Counter::default(),
        };
        registry.register("sessions", "sessions started", metrics.sessions.clone());
        registry.register(
            "units_sent",
            "units handed to the connection",
            metrics.units_sent.clone(),
        );
        registry.register(
            "bytes_sent",
            "bytes accepted by the connection",
            metrics.bytes_sent.clone(),
        );
        registry.register(
            "send_failures",
            "units rejected by the connection",
            metrics.send_failures.clone(),
        );
        registry.register(
            "scheduled",
            "follow-up sends scheduled",
            metrics.scheduled.clone(),
        );
        registry.register(
            "schedule_skipped",
            "schedule requests ignored because an event was already pending",
            metrics.schedule_skipped.clone(),
        );
        registry.register(
            "cancelled",
            "pending sends cancelled by stop",
            metrics.cancelled.clone(),
        );
        metrics
    }
}

struct Inner<C: Connection> {
    connection: Option<C>,
    config: Option<Config<C::Address>>,
    payload: Bytes,

    state: State,
    session: u64,
    pending: Option<EventId>,
    sent: u64,
}

struct Shared<S: Scheduler, C: Connection> {
    scheduler: S,
    metrics: Metrics,
    inner: Mutex<Inner<C>>,
}

impl<S: Scheduler, C: Connection> Shared<S, C> {
    /// Send one unit and, if more remain, schedule the next.
    fn send_one(self: &Arc<Self>, inner: &mut Inner<C>) {
        let Some(config) = inner.config.as_ref() else {
            return;
        };
        let (unit_size, total_units) = (config.unit_size, config.total_units);
        if inner.sent >= total_units {
            self.finish(inner);
            return;
        }

        // The connection owns delivery, we only note whether it accepted the unit
        let Some(connection) = inner.connection.as_mut() else {
            return;
        };
        match connection.send(inner.payload.clone()) {
            Ok(()) => {
                self.metrics.bytes_sent.inc_by(unit_size as u64);
            }
            Err(err) => {
                self.metrics.send_failures.inc();
                debug!(?err, sent = inner.sent, "connection rejected unit");
            }
        }
        inner.sent += 1;
        self.metrics.units_sent.inc();
        trace!(sent = inner.sent, total_units, "sent unit");

        if inner.sent < total_units {
            self.schedule_next(inner);
        } else {
            self.finish(inner);
        }
    }

    /// Schedule the next send, unless one is already pending.
    fn schedule_next(self: &Arc<Self>, inner: &mut Inner<C>) {
        if let Some(event) = inner.pending {
            if self.scheduler.is_pending(event) {
                self.metrics.schedule_skipped.inc();
                debug!(id = event.get(), "send already pending");
                return;
            }
        }
        let Some(config) = inner.config.as_ref() else {
            return;
        };
        let delay = config.rate.transmission_time(config.unit_size);
        let sender = Arc::downgrade(self);
        let session = inner.session;
        let event = self.scheduler.schedule(delay, move || {
            if let Some(sender) = sender.upgrade() {
                sender.fire(session);
            }
        });
        inner.pending = Some(event);
        self.metrics.scheduled.inc();
        trace!(id = event.get(), ?delay, "scheduled send");
    }

    /// Handle a scheduled send.
    fn fire(self: &Arc<Self>, session: u64) {
        let mut inner = self.inner.lock().unwrap();
        if inner.session != session || inner.state != State::Running {
            trace!(session, "ignoring send from finished session");
            return;
        }
        inner.pending = None;
        self.send_one(&mut inner);
    }

    /// End a session that sent every unit.
    fn finish(&self, inner: &mut Inner<C>) {
        inner.state = State::Idle;
        debug!(session = inner.session, sent = inner.sent, "session exhausted");
    }
}

/// Emits `total_units` units of `unit_size` bytes at `rate` over a [Connection].
pub struct PacedSender<S: Scheduler, C: Connection> {
    shared: Arc<Shared<S, C>>,
}

impl<S: Scheduler, C: Connection> Clone for PacedSender<S, C> {
    fn clone(&self) -> Self {
        Self {
            shared: self.shared.clone(),
        }
    }
}

impl<S: Scheduler, C: Connection> PacedSender<S, C> {
    /// Create an unconfigured sender driven by `scheduler`.
    pub fn new(scheduler: S, registry: &mut Registry) -> Self {
        Self {
            shared: Arc::new(Shared {
                scheduler,
                metrics: Metrics::init(registry),
                inner: Mutex::new(Inner {
                    connection: None,
                    config: None,
                    payload: Bytes::new(),
                    state: State::Idle,
                    session: 0,
                    pending: None,
                    sent: 0,
                }),
            }),
        }
    }

    /// Store the connection and session parameters.
    ///
    /// May be called any number of times while idle, each call replacing the last.
    pub fn setup(&self, connection: C, config: Config<C::Address>) -> Result<(), Error> {
        if config.unit_size == 0 {
            return Err(Error::InvalidUnitSize);
        }
        let mut inner = self.shared.inner.lock().unwrap();
        if inner.state == State::Running {
            return Err(Error::AlreadyRunning);
        }
        debug!(
            peer = ?config.peer,
            unit_size = config.unit_size,
            total_units = config.total_units,
            rate = %config.rate,
            "configured sender"
        );
        inner.payload = Bytes::from(vec![0; config.unit_size]);
        inner.connection = Some(connection);
        inner.config = Some(config);
        Ok(())
    }

    /// Bind and connect the connection, then send the first unit.
    pub fn start(&self) -> Result<(), Error> {
        let mut guard = self.shared.inner.lock().unwrap();
        let inner = &mut *guard;
        if inner.state == State::Running {
            return Err(Error::AlreadyRunning);
        }
        let (Some(config), Some(connection)) = (inner.config.as_ref(), inner.connection.as_mut())
        else {
            return Err(Error::NotConfigured);
        };
        inner.sent = 0;
        connection.bind()?;
        if let Err(err) = connection.connect(config.peer.clone()) {
            connection.close();
            return Err(err);
        }
        inner.session += 1;
        inner.state = State::Running;
        self.shared.metrics.sessions.inc();
        debug!(session = inner.session, "started session");
        self.shared.send_one(inner);
        Ok(())
    }

    /// Cancel any pending send and close the connection.
    ///
    /// Stopping an idle sender is a no-op (beyond closing its connection).
    pub fn stop(&self) {
        let mut guard = self.shared.inner.lock().unwrap();
        let inner = &mut *guard;
        if let Some(event) = inner.pending.take() {
            if self.shared.scheduler.is_pending(event) {
                self.shared.metrics.cancelled.inc();
            }
            self.shared.scheduler.cancel(event);
        }
        if let Some(connection) = inner.connection.as_mut() {
            connection.close();
        }
        if inner.state == State::Running {
            inner.state = State::Idle;
            debug!(session = inner.session, sent = inner.sent, "stopped session");
        }
    }

    /// Hand the connection back to the caller.
    pub fn release(&self) -> Result<C, Error> {
        let mut inner = self.shared.inner.lock().unwrap();
        if inner.state == State::Running {
            return Err(Error::AlreadyRunning);
        }
        inner.connection.take().ok_or(Error::NotConfigured)
    }

    /// Units sent in the current (or most recent) session.
    pub fn sent(&self) -> u64 {
        self.shared.inner.lock().unwrap().sent
    }

    /// Current lifecycle state.
    pub fn state(&self) -> State {
        self.shared.inner.lock().unwrap().state
    }

    /// Returns whether a session is in progress.
    pub fn is_running(&self) -> bool {
        self.state() == State::Running
    }

    /// The outstanding send, if any.
    pub fn pending(&self) -> Option<EventId> {
        self.shared.inner.lock().unwrap().pending
    }
}
