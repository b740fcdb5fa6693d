//! Pace a bulk transfer over a simulated two-hop path and trace its window.
//!
//! A sender emits `packets` units of `payload_size` bytes at `rate` towards a sink
//! two hops away. Each hop has its own bandwidth, propagation delay, drop-tail
//! queue, and corruption probability. The sender starts at `start_ms` and stops at
//! `duration_ms` (both measured from the start of the simulation), at which point
//! the simulation ends.
//!
//! # Usage
//!
//! ```bash
//! cargo run --release --bin tcp
//! ```
//!
//! Any field of [Config] can be loaded from YAML and individual fields overridden on
//! the command line:
//!
//! ```bash
//! cargo run --release --bin tcp -- --config tcp.yaml --error-rate 0.001 --seed 7
//! ```
//!
//! Every change to the window is written to `trace` as `"<seconds> <window>"`.

use commonware_pacer::{
    deterministic::{self, Executor},
    install,
    sender::{self, PacedSender},
    simulated::{self, Link},
    DataRate, WindowTracer,
};
use prometheus_client::metrics::gauge::Gauge;
use serde::{Deserialize, Serialize};
use std::{
    net::SocketAddr,
    path::PathBuf,
    time::{Duration, UNIX_EPOCH},
};
use thiserror::Error;
use tracing::{debug, info};

/// Address of the sink.
const SINK: ([u8; 4], u16) = ([10, 1, 2, 2], 8080);

/// Segments in the window after connecting.
const INITIAL_WINDOW: u32 = 1;

/// Errors that can occur when running the simulation.
#[derive(Debug, Error)]
pub enum Error {
    #[error("sender: {0}")]
    Sender(#[from] commonware_pacer::Error),
    #[error("path: {0}")]
    Path(#[from] simulated::Error),
    #[error("payload size too large: {0}")]
    PayloadSize(usize),
    #[error("start must not follow the end of the simulation")]
    InvalidSchedule,
}

/// One hop between the sender and the sink.
#[derive(Clone, Debug, PartialEq, Deserialize, Serialize)]
pub struct Hop {
    pub rate: String,
    pub delay_ms: u64,
    pub queue: usize,
    pub error_rate: f64,
}

impl Default for Hop {
    fn default() -> Self {
        Self {
            rate: "10Mbps".into(),
            delay_ms: 100,
            queue: 50,
            error_rate: 1e-6,
        }
    }
}

/// Configuration for the simulation.
#[derive(Clone, Debug, PartialEq, Deserialize, Serialize)]
#[serde(default)]
pub struct Config {
    pub payload_size: usize,
    pub packets: u64,
    pub rate: String,
    pub start_ms: u64,
    pub duration_ms: u64,
    pub hops: Vec<Hop>,
    pub seed: u64,
    pub trace: Option<PathBuf>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            payload_size: 1_460,
            packets: 5_000,
            rate: "10Mbps".into(),
            start_ms: 1_000,
            duration_ms: 10_000,
            hops: vec![Hop::default(), Hop::default()],
            seed: 42,
            trace: Some(PathBuf::from("tcp-example.cwnd")),
        }
    }
}

impl Config {
    /// Set the corruption probability of every hop.
    pub fn set_error_rate(&mut self, error_rate: f64) {
        for hop in &mut self.hops {
            hop.error_rate = error_rate;
        }
    }

    fn path(&self) -> Result<simulated::Config, Error> {
        let path = self
            .hops
            .iter()
            .map(|hop| -> Result<Link, Error> {
                Ok(Link {
                    rate: hop.rate.parse::<DataRate>()?,
                    delay: Duration::from_millis(hop.delay_ms),
                    queue: hop.queue,
                    error_rate: hop.error_rate,
                })
            })
            .collect::<Result<Vec<_>, Error>>()?;
        let segment_size =
            u32::try_from(self.payload_size).map_err(|_| Error::PayloadSize(self.payload_size))?;
        Ok(simulated::Config {
            path,
            segment_size,
            initial_window: INITIAL_WINDOW,
        })
    }
}

/// Outcome of a simulation.
pub struct Report {
    /// Units handed to the path.
    pub sent: u64,

    /// Units received by the sink.
    pub delivered: u64,

    /// Bytes received by the sink.
    pub delivered_bytes: u64,

    /// Units dropped by a full queue.
    pub dropped: u64,

    /// Units corrupted in transit.
    pub corrupted: u64,

    /// Every window change.
    pub window: WindowTracer,

    /// Hash of everything the scheduler did.
    pub auditor: String,

    /// Encoded metrics.
    pub metrics: String,
}

/// Run the simulation described by `cfg`.
pub fn simulate(cfg: &Config) -> Result<Report, Error> {
    if cfg.start_ms > cfg.duration_ms {
        return Err(Error::InvalidSchedule);
    }
    let path = cfg.path()?;
    let rate = cfg.rate.parse::<DataRate>()?;

    let (runner, context, auditor) = Executor::init(deterministic::Config {
        seed: cfg.seed,
        timeout: None,
    });
    let connection = context.with_registry(|registry| {
        simulated::Connection::new(
            context.clone(),
            path,
            registry.sub_registry_with_prefix("link"),
        )
    })?;
    let sender = context.with_registry(|registry| {
        PacedSender::new(context.clone(), registry.sub_registry_with_prefix("sender"))
    });

    // Trace every change to the window and expose the latest value
    let window = WindowTracer::new();
    let latest = Gauge::<i64>::default();
    context.with_registry(|registry| {
        registry.sub_registry_with_prefix("link").register(
            "window",
            "current window in bytes",
            latest.clone(),
        )
    });
    connection.on_window_change(window.observer());
    connection.on_window_change(move |_, _, new| {
        latest.set(new as i64);
    });

    let peer = SocketAddr::from(SINK);
    sender.setup(
        connection.clone(),
        sender::Config {
            peer,
            unit_size: cfg.payload_size,
            total_units: cfg.packets,
            rate,
        },
    )?;
    install(
        &context,
        sender.clone(),
        Duration::from_millis(cfg.start_ms),
        Duration::from_millis(cfg.duration_ms),
    )?;
    debug!(
        packets = cfg.packets,
        payload_size = cfg.payload_size,
        %rate,
        hops = cfg.hops.len(),
        "installed sender"
    );

    runner.run_until(UNIX_EPOCH + Duration::from_millis(cfg.duration_ms));
    info!(
        sent = sender.sent(),
        delivered = connection.delivered(),
        dropped = connection.dropped(),
        corrupted = connection.corrupted(),
        "simulation complete"
    );

    Ok(Report {
        sent: sender.sent(),
        delivered: connection.delivered(),
        delivered_bytes: connection.delivered_bytes(),
        dropped: connection.dropped(),
        corrupted: connection.corrupted(),
        window,
        auditor: auditor.state(),
        metrics: context.encode(),
    })
}
