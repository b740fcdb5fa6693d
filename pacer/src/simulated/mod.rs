//! Deliver units over a simulated multi-hop path (bandwidth, latency, queues, corruption).
//!
//! Each hop is a store-and-forward FIFO with a finite queue: a unit leaves a hop
//! once every unit ahead of it has been serialized, arrives at the next hop after
//! the hop's propagation delay, and is dropped if the hop's queue is full or (with
//! probability `error_rate`) if it is corrupted in transit.
//!
//! The far end of the path is a sink that counts what it receives. Delivered units
//! grow a congestion-window metric (after the return delay) and drops shrink it.
//! The window is only observed, never enforced: the sender decides when to send.

mod connection;

pub use connection::Connection;

use crate::rate::DataRate;
use std::time::Duration;
use thiserror::Error;

/// Errors that can occur when configuring a simulated path.
#[derive(Debug, Error, Clone, PartialEq)]
pub enum Error {
    #[error("path must contain at least one hop")]
    EmptyPath,
    #[error("queue must hold at least one unit")]
    InvalidQueue,
    #[error("invalid error rate (must be in [0, 1]): {0}")]
    InvalidErrorRate(f64),
    #[error("segment size must be non-zero")]
    InvalidSegmentSize,
}

/// One hop of a simulated path.
#[derive(Clone, Debug)]
pub struct Link {
    /// Serialization rate.
    pub rate: DataRate,

    /// Propagation delay.
    pub delay: Duration,

    /// Maximum number of units held at the hop, including the one being serialized.
    pub queue: usize,

    /// Probability that a unit is corrupted on this hop (in range [0,1]).
    pub error_rate: f64,
}

/// Configuration for a simulated [Connection].
#[derive(Clone, Debug)]
pub struct Config {
    /// Hops from the sender to the sink, in order.
    pub path: Vec<Link>,

    /// Segment size (in bytes) used to grow and shrink the window metric.
    pub segment_size: u32,

    /// Window (in segments) after connecting.
    pub initial_window: u32,
}

impl Config {
    fn validate(&self) -> Result<(), Error> {
        if self.path.is_empty() {
            return Err(Error::EmptyPath);
        }
        if self.segment_size == 0 {
            return Err(Error::InvalidSegmentSize);
        }
        for link in &self.path {
            if link.queue == 0 {
                return Err(Error::InvalidQueue);
            }
            if !(0.0..=1.0).contains(&link.error_rate) {
                return Err(Error::InvalidErrorRate(link.error_rate));
            }
        }
        Ok(())
    }

    /// Sum of propagation delays along the path.
    fn one_way_delay(&self) -> Duration {
        self.path.iter().map(|link| link.delay).sum()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn link(queue: usize, error_rate: f64) -> Link {
        Link {
            rate: "10Mbps".parse().unwrap(),
            delay: Duration::from_millis(100),
            queue,
            error_rate,
        }
    }

    fn config(path: Vec<Link>) -> Config {
        Config {
            path,
            segment_size: 1460,
            initial_window: 1,
        }
    }

    #[test]
    fn test_validate() {
        assert_eq!(config(vec![]).validate(), Err(Error::EmptyPath));
        assert_eq!(
            config(vec![link(50, 0.0), link(0, 0.0)]).validate(),
            Err(Error::InvalidQueue)
        );
        assert_eq!(
            config(vec![link(50, 1.5)]).validate(),
            Err(Error::InvalidErrorRate(1.5))
        );
        assert!(matches!(
            config(vec![link(50, f64::NAN)]).validate(),
            Err(Error::InvalidErrorRate(_))
        ));
        let mut zero_segment = config(vec![link(50, 0.0)]);
        zero_segment.segment_size = 0;
        assert_eq!(zero_segment.validate(), Err(Error::InvalidSegmentSize));
        assert_eq!(
            config(vec![link(50, 0.0), link(50, 1.0)]).validate(),
            Ok(())
        );
    }

    #[test]
    fn test_one_way_delay() {
        let cfg = config(vec![link(50, 0.0), link(50, 0.0)]);
        assert_eq!(cfg.one_way_delay(), Duration::from_millis(200));
    }
}
