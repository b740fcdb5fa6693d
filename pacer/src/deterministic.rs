//! A deterministic, single-threaded discrete-event scheduler.
//!
//! Virtual time starts at [UNIX_EPOCH] and only moves when the [Runner] pops the
//! next due event. Events due at the same instant fire in the order they were
//! scheduled. Randomness is drawn from a seeded generator, so two runs with the
//! same seed (and the same callbacks) produce the same [Auditor] state.
//!
//! # Example
//!
//! ```rust
//! use commonware_pacer::{deterministic::Executor, Scheduler};
//! use std::time::{Duration, UNIX_EPOCH};
//!
//! let (runner, context, auditor) = Executor::default();
//! context.schedule(Duration::from_secs(1), {
//!     let context = context.clone();
//!     move || println!("fired at {:?}", context.current())
//! });
//! let end = runner.run();
//! assert_eq!(end, UNIX_EPOCH + Duration::from_secs(1));
//! println!("Auditor state: {}", auditor.state());
//! ```

use crate::{hex, EventId, METRICS_PREFIX};
use prometheus_client::{
    encoding::text::encode,
    metrics::{counter::Counter, gauge::Gauge},
    registry::Registry,
};
use rand::{rngs::StdRng, CryptoRng, RngCore, SeedableRng};
use sha2::{Digest, Sha256};
use std::{
    collections::{BinaryHeap, HashMap},
    sync::{Arc, Mutex},
    time::{Duration, SystemTime, UNIX_EPOCH},
};
use tracing::trace;

type Callback = Box<dyn FnOnce() + Send + 'static>;

#[derive(Debug)]
struct Metrics {
    events_scheduled: Counter,
    events_fired: Counter,
    events_cancelled: Counter,
    events_pending: Gauge,
}

impl Metrics {
    pub fn init(registry: &mut Registry) -> Self {
        let metrics = Self {
            events_scheduled: Counter::default(),
            events_fired: Counter::default(),
            events_cancelled: Counter::default(),
            events_pending: Gauge::default(),
        };
        registry.register(
            "events_scheduled",
            "Total number of events scheduled",
            metrics.events_scheduled.clone(),
        );
        registry.register(
            "events_fired",
            "Total number of events fired",
            metrics.events_fired.clone(),
        );
        registry.register(
            "events_cancelled",
            "Total number of events cancelled before firing",
            metrics.events_cancelled.clone(),
        );
        registry.register(
            "events_pending",
            "Number of events waiting to fire",
            metrics.events_pending.clone(),
        );
        metrics
    }
}

/// Track the state of the scheduler for determinism auditing.
pub struct Auditor {
    hash: Mutex<Vec<u8>>,
}

impl Default for Auditor {
    fn default() -> Self {
        Self {
            hash: Vec::new().into(),
        }
    }
}

impl Auditor {
    fn schedule(&self, event: EventId, at: SystemTime) {
        let mut hash = self.hash.lock().unwrap();
        let mut hasher = Sha256::new();
        hasher.update(&*hash);
        hasher.update(b"schedule");
        hasher.update(event.get().to_be_bytes());
        hasher.update(epoch_nanos(at).to_be_bytes());
        *hash = hasher.finalize().to_vec();
    }

    fn cancel(&self, event: EventId) {
        let mut hash = self.hash.lock().unwrap();
        let mut hasher = Sha256::new();
        hasher.update(&*hash);
        hasher.update(b"cancel");
        hasher.update(event.get().to_be_bytes());
        *hash = hasher.finalize().to_vec();
    }

    fn fire(&self, event: EventId) {
        let mut hash = self.hash.lock().unwrap();
        let mut hasher = Sha256::new();
        hasher.update(&*hash);
        hasher.update(b"fire");
        hasher.update(event.get().to_be_bytes());
        *hash = hasher.finalize().to_vec();
    }

    fn rand(&self, method: &str) {
        let mut hash = self.hash.lock().unwrap();
        let mut hasher = Sha256::new();
        hasher.update(&*hash);
        hasher.update(b"rand");
        hasher.update(method.as_bytes());
        *hash = hasher.finalize().to_vec();
    }

    /// Generate a representation of the current state of the scheduler.
    ///
    /// This can be used to ensure that logic running on top
    /// of the scheduler is interacting deterministically.
    pub fn state(&self) -> String {
        let hash = self.hash.lock().unwrap().clone();
        hex(&hash)
    }
}

fn epoch_nanos(at: SystemTime) -> u128 {
    at.duration_since(UNIX_EPOCH)
        .expect("virtual time precedes epoch")
        .as_nanos()
}

/// Configuration for the `deterministic` scheduler.
#[derive(Clone)]
pub struct Config {
    /// Seed for the random number generator.
    pub seed: u64,

    /// If an event is due after this point (measured from the start of virtual time), panic.
    pub timeout: Option<Duration>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            seed: 42,
            timeout: None,
        }
    }
}

struct Alarm {
    time: SystemTime,
    event: EventId,
}

impl PartialEq for Alarm {
    fn eq(&self, other: &Self) -> bool {
        self.time.eq(&other.time) && self.event.eq(&other.event)
    }
}

impl Eq for Alarm {}

impl PartialOrd for Alarm {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Alarm {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        // Reverse the ordering for min-heap (ties broken by scheduling order)
        other
            .time
            .cmp(&self.time)
            .then_with(|| other.event.cmp(&self.event))
    }
}

/// Pending events.
///
/// Cancelled events leave their [Alarm] in the heap; only the callback is removed.
struct Queue {
    next: u64,
    alarms: BinaryHeap<Alarm>,
    callbacks: HashMap<EventId, Callback>,
}

/// Deterministic scheduler that fires events in virtual-time order.
pub struct Executor {
    registry: Mutex<Registry>,
    deadline: Option<SystemTime>,
    metrics: Metrics,
    auditor: Arc<Auditor>,
    rng: Mutex<StdRng>,
    time: Mutex<SystemTime>,
    queue: Mutex<Queue>,
}

impl Executor {
    /// Initialize a new `deterministic` scheduler with the given configuration.
    pub fn init(cfg: Config) -> (Runner, Context, Arc<Auditor>) {
        // Create a new registry
        let mut registry = Registry::default();
        let runtime_registry = registry.sub_registry_with_prefix(METRICS_PREFIX);

        // Initialize scheduler
        let metrics = Metrics::init(runtime_registry);
        let auditor = Arc::new(Auditor::default());
        let start_time = UNIX_EPOCH;
        let deadline = cfg
            .timeout
            .map(|timeout| start_time.checked_add(timeout).expect("timeout overflowed"));
        let executor = Arc::new(Self {
            registry: Mutex::new(registry),
            deadline,
            metrics,
            auditor: auditor.clone(),
            rng: Mutex::new(StdRng::seed_from_u64(cfg.seed)),
            time: Mutex::new(start_time),
            queue: Mutex::new(Queue {
                next: 0,
                alarms: BinaryHeap::new(),
                callbacks: HashMap::new(),
            }),
        });
        (
            Runner {
                executor: executor.clone(),
            },
            Context { executor },
            auditor,
        )
    }

    /// Initialize a new `deterministic` scheduler with the default configuration
    /// and the provided seed.
    pub fn seeded(seed: u64) -> (Runner, Context, Arc<Auditor>) {
        let cfg = Config {
            seed,
            ..Config::default()
        };
        Self::init(cfg)
    }

    /// Initialize a new `deterministic` scheduler with the default configuration
    /// but panic if an event is due after the given timeout.
    pub fn timed(timeout: Duration) -> (Runner, Context, Arc<Auditor>) {
        let cfg = Config {
            timeout: Some(timeout),
            ..Config::default()
        };
        Self::init(cfg)
    }

    /// Initialize a new `deterministic` scheduler with the default configuration.
    // We'd love to implement the trait but we can't because of the return type.
    #[allow(clippy::should_implement_trait)]
    pub fn default() -> (Runner, Context, Arc<Auditor>) {
        Self::init(Config::default())
    }

    /// Pop the next live event due at or before `deadline`.
    fn next(&self, deadline: Option<SystemTime>) -> Option<(SystemTime, EventId, Callback)> {
        let mut queue = self.queue.lock().unwrap();
        loop {
            let alarm = queue.alarms.peek()?;
            if let Some(deadline) = deadline {
                if alarm.time > deadline {
                    return None;
                }
            }
            let alarm = queue.alarms.pop().unwrap();
            if let Some(callback) = queue.callbacks.remove(&alarm.event) {
                return Some((alarm.time, alarm.event, callback));
            }
        }
    }
}

/// Drives a `deterministic` scheduler.
pub struct Runner {
    executor: Arc<Executor>,
}

impl Runner {
    /// Fire events until none remain, returning the final virtual time.
    pub fn run(self) -> SystemTime {
        self.process(None);
        *self.executor.time.lock().unwrap()
    }

    /// Fire every event due at or before `deadline`, then advance virtual time to `deadline`.
    ///
    /// Events due later stay queued, so this may be called repeatedly.
    pub fn run_until(&self, deadline: SystemTime) {
        self.process(Some(deadline));
        let mut time = self.executor.time.lock().unwrap();
        if *time < deadline {
            *time = deadline;
        }
        trace!(now = ?deadline.duration_since(UNIX_EPOCH), "time advanced");
    }

    fn process(&self, deadline: Option<SystemTime>) {
        while let Some((time, event, callback)) = self.executor.next(deadline) {
            // Ensure we have not exceeded our timeout
            if let Some(timeout) = self.executor.deadline {
                if time > timeout {
                    panic!("runtime timeout");
                }
            }

            // Advance time (callbacks run without any scheduler lock held)
            *self.executor.time.lock().unwrap() = time;
            self.executor.auditor.fire(event);
            self.executor.metrics.events_fired.inc();
            self.executor.metrics.events_pending.dec();
            trace!(id = event.get(), now = ?time.duration_since(UNIX_EPOCH), "firing event");
            callback();
        }
    }
}

/// Implementation of [crate::Scheduler] and [RngCore] for the `deterministic` scheduler.
#[derive(Clone)]
pub struct Context {
    executor: Arc<Executor>,
}

impl Context {
    /// Encode all scheduler metrics in the Prometheus text format.
    pub fn encode(&self) -> String {
        let mut buffer = String::new();
        encode(&mut buffer, &self.executor.registry.lock().unwrap()).expect("encoding failed");
        buffer
    }

    /// Register additional metrics alongside the scheduler's.
    pub fn with_registry<F, T>(&self, f: F) -> T
    where
        F: FnOnce(&mut Registry) -> T,
    {
        f(&mut self.executor.registry.lock().unwrap())
    }

    /// Number of events waiting to fire.
    pub fn pending(&self) -> usize {
        self.executor.queue.lock().unwrap().callbacks.len()
    }
}

impl crate::Scheduler for Context {
    fn current(&self) -> SystemTime {
        *self.executor.time.lock().unwrap()
    }

    fn schedule<F>(&self, delay: Duration, callback: F) -> EventId
    where
        F: FnOnce() + Send + 'static,
    {
        let time = self
            .current()
            .checked_add(delay)
            .expect("overflow when scheduling event");
        let event = {
            let mut queue = self.executor.queue.lock().unwrap();
            let event = EventId::new(queue.next);
            queue.next = queue.next.checked_add(1).expect("event counter overflow");
            queue.alarms.push(Alarm { time, event });
            queue.callbacks.insert(event, Box::new(callback));
            event
        };
        self.executor.auditor.schedule(event, time);
        self.executor.metrics.events_scheduled.inc();
        self.executor.metrics.events_pending.inc();
        trace!(id = event.get(), ?delay, "scheduled event");
        event
    }

    fn cancel(&self, event: EventId) {
        let removed = self
            .executor
            .queue
            .lock()
            .unwrap()
            .callbacks
            .remove(&event)
            .is_some();
        if !removed {
            return;
        }
        self.executor.auditor.cancel(event);
        self.executor.metrics.events_cancelled.inc();
        self.executor.metrics.events_pending.dec();
        trace!(id = event.get(), "cancelled event");
    }

    fn is_pending(&self, event: EventId) -> bool {
        self.executor
            .queue
            .lock()
            .unwrap()
            .callbacks
            .contains_key(&event)
    }
}

impl RngCore for Context {
    fn next_u32(&mut self) -> u32 {
        self.executor.auditor.rand("next_u32");
        self.executor.rng.lock().unwrap().next_u32()
    }

    fn next_u64(&mut self) -> u64 {
        self.executor.auditor.rand("next_u64");
        self.executor.rng.lock().unwrap().next_u64()
    }

    fn fill_bytes(&mut self, dest: &mut [u8]) {
        self.executor.auditor.rand("fill_bytes");
        self.executor.rng.lock().unwrap().fill_bytes(dest)
    }

    fn try_fill_bytes(&mut self, dest: &mut [u8]) -> Result<(), rand::Error> {
        self.executor.auditor.rand("try_fill_bytes");
        self.executor.rng.lock().unwrap().try_fill_bytes(dest)
    }
}

impl CryptoRng for Context {}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::Scheduler;
    use rand::Rng;

    type Log = Arc<Mutex<Vec<(u64, Duration)>>>;

    fn record(context: &Context, log: &Log, id: u64, delay: Duration) -> EventId {
        let log = log.clone();
        let clock = context.clone();
        context.schedule(delay, move || {
            let now = clock.current().duration_since(UNIX_EPOCH).unwrap();
            log.lock().unwrap().push((id, now));
        })
    }

    #[test]
    fn test_events_fire_in_time_order() {
        let (runner, context, _) = Executor::default();
        let log = Arc::new(Mutex::new(Vec::new()));
        record(&context, &log, 1, Duration::from_secs(3));
        record(&context, &log, 2, Duration::from_secs(1));
        record(&context, &log, 3, Duration::from_secs(2));
        let end = runner.run();
        assert_eq!(end, UNIX_EPOCH + Duration::from_secs(3));
        assert_eq!(
            *log.lock().unwrap(),
            vec![
                (2, Duration::from_secs(1)),
                (3, Duration::from_secs(2)),
                (1, Duration::from_secs(3)),
            ]
        );
    }

    #[test]
    fn test_same_instant_fires_in_schedule_order() {
        let (runner, context, _) = Executor::default();
        let log = Arc::new(Mutex::new(Vec::new()));
        for id in 0..5 {
            record(&context, &log, id, Duration::from_millis(10));
        }
        runner.run();
        let order: Vec<u64> = log.lock().unwrap().iter().map(|(id, _)| *id).collect();
        assert_eq!(order, vec![0, 1, 2, 3, 4]);
    }

    #[test]
    fn test_cancel() {
        let (runner, context, _) = Executor::default();
        let log = Arc::new(Mutex::new(Vec::new()));
        let keep = record(&context, &log, 1, Duration::from_secs(1));
        let drop = record(&context, &log, 2, Duration::from_secs(1));
        assert!(context.is_pending(drop));
        context.cancel(drop);
        assert!(!context.is_pending(drop));
        assert!(context.is_pending(keep));

        // Cancelling twice is a no-op
        context.cancel(drop);
        runner.run();
        assert_eq!(*log.lock().unwrap(), vec![(1, Duration::from_secs(1))]);
        assert!(!context.is_pending(keep));

        // Cancelling a fired event is a no-op
        context.cancel(keep);
        let metrics = context.encode();
        assert!(metrics.contains("runtime_events_scheduled_total 2"));
        assert!(metrics.contains("runtime_events_fired_total 1"));
        assert!(metrics.contains("runtime_events_cancelled_total 1"));
        assert!(metrics.contains("runtime_events_pending 0"));
    }

    #[test]
    fn test_cancel_same_instant_from_callback() {
        // An event cancelled by an earlier callback at the same instant never fires
        let (runner, context, _) = Executor::default();
        let log = Arc::new(Mutex::new(Vec::new()));
        let victim = Arc::new(Mutex::new(None));
        context.schedule(Duration::from_secs(1), {
            let context = context.clone();
            let victim = victim.clone();
            move || context.cancel(victim.lock().unwrap().unwrap())
        });
        *victim.lock().unwrap() = Some(record(&context, &log, 1, Duration::from_secs(1)));
        runner.run();
        assert!(log.lock().unwrap().is_empty());
    }

    #[test]
    fn test_schedule_from_callback() {
        let (runner, context, _) = Executor::default();
        let log = Arc::new(Mutex::new(Vec::new()));
        context.schedule(Duration::from_secs(1), {
            let context = context.clone();
            let log = log.clone();
            move || {
                record(&context, &log, 1, Duration::ZERO);
                record(&context, &log, 2, Duration::from_secs(1));
            }
        });
        runner.run();
        assert_eq!(
            *log.lock().unwrap(),
            vec![(1, Duration::from_secs(1)), (2, Duration::from_secs(2))]
        );
    }

    #[test]
    fn test_run_until() {
        let (runner, context, _) = Executor::default();
        let log = Arc::new(Mutex::new(Vec::new()));
        record(&context, &log, 1, Duration::from_secs(1));
        let late = record(&context, &log, 2, Duration::from_secs(5));
        runner.run_until(UNIX_EPOCH + Duration::from_secs(2));
        assert_eq!(context.current(), UNIX_EPOCH + Duration::from_secs(2));
        assert_eq!(log.lock().unwrap().len(), 1);
        assert!(context.is_pending(late));
        assert_eq!(context.pending(), 1);

        // Remaining events fire on a later call
        runner.run_until(UNIX_EPOCH + Duration::from_secs(5));
        assert_eq!(log.lock().unwrap().len(), 2);
        assert_eq!(context.pending(), 0);
    }

    #[test]
    fn test_run_empty() {
        let (runner, _, _) = Executor::default();
        assert_eq!(runner.run(), UNIX_EPOCH);
    }

    #[test]
    #[should_panic(expected = "runtime timeout")]
    fn test_timeout() {
        let (runner, context, _) = Executor::timed(Duration::from_secs(10));
        fn tick(context: Context) {
            let next = context.clone();
            context.schedule(Duration::from_secs(1), move || tick(next));
        }
        tick(context);
        runner.run();
    }

    #[test]
    fn test_alarm_min_heap() {
        let now = UNIX_EPOCH;
        let mut heap = BinaryHeap::new();
        for (time, event) in [(10, 0), (5, 1), (15, 2), (5, 3)] {
            heap.push(Alarm {
                time: now + Duration::from_secs(time),
                event: EventId::new(event),
            });
        }
        let mut sorted = Vec::new();
        while let Some(alarm) = heap.pop() {
            sorted.push(alarm.event.get());
        }
        assert_eq!(sorted, vec![1, 3, 0, 2]);
    }

    fn run_with_seed(seed: u64) -> (String, Vec<u64>) {
        let (runner, context, auditor) = Executor::seeded(seed);
        let draws = Arc::new(Mutex::new(Vec::new()));
        for i in 0..5 {
            let mut context = context.clone();
            let draws = draws.clone();
            context.clone().schedule(Duration::from_millis(i), move || {
                let draw = context.gen_range(0..1_000);
                draws.lock().unwrap().push(draw);
            });
        }
        runner.run();
        let draws = draws.lock().unwrap().clone();
        (auditor.state(), draws)
    }

    #[test]
    fn test_same_seed_same_state() {
        for seed in 0..100 {
            assert_eq!(run_with_seed(seed), run_with_seed(seed));
        }
    }

    #[test]
    fn test_different_seeds_different_state() {
        assert_ne!(run_with_seed(12345), run_with_seed(54321));
    }
}
