use super::{Config, Error as ConfigError};
use crate::{Error, Scheduler};
use bytes::Bytes;
use prometheus_client::{metrics::counter::Counter, registry::Registry};
use rand::{Rng, RngCore};
use std::{
    collections::VecDeque,
    net::SocketAddr,
    sync::{Arc, Mutex},
    time::{Duration, SystemTime},
};
use tracing::{debug, trace};

type Observer = Box<dyn FnMut(SystemTime, u32, u32) + Send + 'static>;

struct Metrics {
    delivered: Counter,
    delivered_bytes: Counter,
    dropped: Counter,
    corrupted: Counter,
}

impl Metrics {
    fn init(registry: &mut Registry) -> Self {
        let metrics = Self {
            delivered: Counter::default(),
            delivered_bytes: Counter::default(),
            dropped: Counter::default(),
            corrupted: Counter::default(),
        };
        registry.register(
            "delivered",
            "units received by the sink",
            metrics.delivered.clone(),
        );
        registry.register(
            "delivered_bytes",
            "bytes received by the sink",
            metrics.delivered_bytes.clone(),
        );
        registry.register(
            "dropped",
            "units dropped by a full queue",
            metrics.dropped.clone(),
        );
        registry.register(
            "corrupted",
            "units corrupted in transit",
            metrics.corrupted.clone(),
        );
        metrics
    }
}

/// Units that have entered a hop but not yet left it.
struct Hop {
    busy_until: SystemTime,
    departures: VecDeque<SystemTime>,
}

/// What happens to a unit handed to the path.
enum Outcome {
    Delivered(SystemTime),
    Dropped(SystemTime),
    Corrupted(SystemTime),
}

struct State {
    hops: Vec<Hop>,
    bound: bool,
    peer: Option<SocketAddr>,

    // Bumped on close so units still in flight stop moving the window
    generation: u64,
    window: u32,
    ssthresh: u32,
}

struct Shared<E: Scheduler + RngCore> {
    context: E,
    cfg: Config,
    metrics: Metrics,
    state: Mutex<State>,
    observers: Mutex<Vec<Observer>>,
}

impl<E: Scheduler + RngCore> Shared<E> {
    /// Walk a unit of `len` bytes sent at `now` through every hop.
    fn route(&self, state: &mut State, now: SystemTime, len: usize) -> Outcome {
        let mut arrival = now;
        for (link, hop) in self.cfg.path.iter().zip(state.hops.iter_mut()) {
            while hop.departures.front().is_some_and(|left| *left <= arrival) {
                hop.departures.pop_front();
            }
            if hop.departures.len() >= link.queue {
                return Outcome::Dropped(arrival);
            }
            let departure = arrival.max(hop.busy_until) + link.rate.transmission_time(len);
            hop.busy_until = departure;
            hop.departures.push_back(departure);
            arrival = departure + link.delay;
            if link.error_rate > 0.0 && self.context.clone().gen_bool(link.error_rate) {
                return Outcome::Corrupted(arrival);
            }
        }
        Outcome::Delivered(arrival)
    }

    fn deliver(self: &Arc<Self>, len: usize, generation: u64) {
        self.metrics.delivered.inc();
        self.metrics.delivered_bytes.inc_by(len as u64);
        trace!(len, "unit delivered");

        // The sender learns about the delivery one return trip later
        let shared = self.clone();
        let acknowledge = move || shared.acknowledge(generation);
        self.context.schedule(self.cfg.one_way_delay(), acknowledge);
    }

    fn acknowledge(&self, generation: u64) {
        let segment = self.cfg.segment_size;
        let change = {
            let mut state = self.state.lock().unwrap();
            if state.generation != generation {
                return;
            }
            let old = state.window;
            state.window = if old < state.ssthresh {
                old.saturating_add(segment)
            } else {
                let increase = segment.saturating_mul(segment) / old.max(1);
                old.saturating_add(increase.max(1))
            };
            (old, state.window)
        };
        self.notify(change);
    }

    fn lose(&self, generation: u64) {
        let segment = self.cfg.segment_size;
        let change = {
            let mut state = self.state.lock().unwrap();
            if state.generation != generation {
                return;
            }
            let old = state.window;
            state.ssthresh = (old / 2).max(segment.saturating_mul(2));
            state.window = state.ssthresh;
            (old, state.window)
        };
        self.notify(change);
    }

    fn reopen(&self, (old, new, generation): (u32, u32, u64)) {
        if self.state.lock().unwrap().generation != generation {
            return;
        }
        self.notify((old, new));
    }

    fn notify(&self, (old, new): (u32, u32)) {
        if old == new {
            return;
        }
        let now = self.context.current();
        for observer in self.observers.lock().unwrap().iter_mut() {
            observer(now, old, new);
        }
    }
}

/// A [crate::Connection] whose units travel a simulated path to a counting sink.
///
/// Clones share the same endpoint.
#[derive(Clone)]
pub struct Connection<E: Scheduler + RngCore> {
    shared: Arc<Shared<E>>,
}

impl<E: Scheduler + RngCore> Connection<E> {
    /// Create a connection over the path described by `cfg`.
    ///
    /// `context` drives deliveries and supplies randomness for corruption.
    pub fn new(context: E, cfg: Config, registry: &mut Registry) -> Result<Self, ConfigError> {
        cfg.validate()?;
        let start = context.current();
        let hops = cfg
            .path
            .iter()
            .map(|_| Hop {
                busy_until: start,
                departures: VecDeque::new(),
            })
            .collect();
        Ok(Self {
            shared: Arc::new(Shared {
                context,
                cfg,
                metrics: Metrics::init(registry),
                state: Mutex::new(State {
                    hops,
                    bound: false,
                    peer: None,
                    generation: 0,
                    window: 0,
                    ssthresh: u32::MAX,
                }),
                observers: Mutex::new(Vec::new()),
            }),
        })
    }

    /// Invoke `observer` with `(time, old, new)` whenever the window changes.
    ///
    /// Observers run from scheduled events (including the window set by
    /// `connect`), so they may call back into whoever drives this connection.
    pub fn on_window_change<F>(&self, observer: F)
    where
        F: FnMut(SystemTime, u32, u32) + Send + 'static,
    {
        self.shared
            .observers
            .lock()
            .unwrap()
            .push(Box::new(observer));
    }

    /// Current window (in bytes).
    pub fn window(&self) -> u32 {
        self.shared.state.lock().unwrap().window
    }

    /// Units received by the sink.
    pub fn delivered(&self) -> u64 {
        self.shared.metrics.delivered.get()
    }

    /// Bytes received by the sink.
    pub fn delivered_bytes(&self) -> u64 {
        self.shared.metrics.delivered_bytes.get()
    }

    /// Units dropped by a full queue.
    pub fn dropped(&self) -> u64 {
        self.shared.metrics.dropped.get()
    }

    /// Units corrupted in transit.
    pub fn corrupted(&self) -> u64 {
        self.shared.metrics.corrupted.get()
    }
}

impl<E: Scheduler + RngCore> crate::Connection for Connection<E> {
    type Address = SocketAddr;

    fn bind(&mut self) -> Result<(), Error> {
        let mut state = self.shared.state.lock().unwrap();
        if state.bound {
            return Err(Error::BindFailed);
        }
        state.bound = true;
        Ok(())
    }

    fn connect(&mut self, peer: SocketAddr) -> Result<(), Error> {
        let change = {
            let mut state = self.shared.state.lock().unwrap();
            if !state.bound {
                return Err(Error::ConnectionFailed);
            }
            state.peer = Some(peer);
            let old = state.window;
            state.window = self
                .shared
                .cfg
                .initial_window
                .saturating_mul(self.shared.cfg.segment_size);
            state.ssthresh = u32::MAX;
            (old, state.window, state.generation)
        };
        debug!(?peer, window = change.1, "connected");

        // Observers never run while the caller is inside a connection method
        let shared = self.shared.clone();
        let reopen = move || shared.reopen(change);
        self.shared.context.schedule(Duration::ZERO, reopen);
        Ok(())
    }

    fn send(&mut self, payload: Bytes) -> Result<(), Error> {
        let now = self.shared.context.current();
        let len = payload.len();
        let (outcome, generation) = {
            let mut state = self.shared.state.lock().unwrap();
            if state.peer.is_none() {
                return Err(Error::NotConnected);
            }
            let outcome = self.shared.route(&mut state, now, len);
            (outcome, state.generation)
        };

        let shared = self.shared.clone();
        match outcome {
            Outcome::Delivered(at) => {
                let delay = at.duration_since(now).unwrap_or_default();
                self.shared
                    .context
                    .schedule(delay, move || shared.deliver(len, generation));
            }
            Outcome::Dropped(at) => {
                let delay = at.duration_since(now).unwrap_or_default();
                self.shared.context.schedule(delay, move || {
                    shared.metrics.dropped.inc();
                    trace!(len, "unit dropped");
                    shared.lose(generation);
                });
            }
            Outcome::Corrupted(at) => {
                let delay = at.duration_since(now).unwrap_or_default();
                self.shared.context.schedule(delay, move || {
                    shared.metrics.corrupted.inc();
                    trace!(len, "unit corrupted");
                    shared.lose(generation);
                });
            }
        }
        Ok(())
    }

    fn close(&mut self) {
        let mut state = self.shared.state.lock().unwrap();
        if !state.bound {
            return;
        }
        state.bound = false;
        state.peer = None;
        state.generation += 1;
        debug!(generation = state.generation, "closed");
    }
}
