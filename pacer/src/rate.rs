//! Bit rates and the transmission delays they imply.
//!
//! A [DataRate] is always positive, so converting a message size into a delay
//! can never divide by zero. Delays are computed in integer nanoseconds (the
//! scheduler's resolution) and rounded to the nearest nanosecond, so repeatedly
//! scheduling the same delay never accumulates floating-point error.

use crate::Error;
use std::{fmt, num::NonZeroU64, str::FromStr, time::Duration};

const NANOS_PER_SEC: u128 = 1_000_000_000;

/// Recognized unit suffixes and the number of bits per second each represents.
const UNITS: &[(&str, u64)] = &[
    ("bps", 1),
    ("b/s", 1),
    ("Bps", 8),
    ("B/s", 8),
    ("kbps", 1_000),
    ("kb/s", 1_000),
    ("Kbps", 1_000),
    ("Kb/s", 1_000),
    ("kBps", 8_000),
    ("kB/s", 8_000),
    ("KBps", 8_000),
    ("KB/s", 8_000),
    ("Kibps", 1 << 10),
    ("Kib/s", 1 << 10),
    ("KiBps", 8 << 10),
    ("KiB/s", 8 << 10),
    ("Mbps", 1_000_000),
    ("Mb/s", 1_000_000),
    ("MBps", 8_000_000),
    ("MB/s", 8_000_000),
    ("Mibps", 1 << 20),
    ("Mib/s", 1 << 20),
    ("MiBps", 8 << 20),
    ("MiB/s", 8 << 20),
    ("Gbps", 1_000_000_000),
    ("Gb/s", 1_000_000_000),
    ("GBps", 8_000_000_000),
    ("GB/s", 8_000_000_000),
    ("Gibps", 1 << 30),
    ("Gib/s", 1 << 30),
    ("GiBps", 8 << 30),
    ("GiB/s", 8 << 30),
];

/// Units used when rendering a rate, largest first.
const DISPLAY_UNITS: &[(&str, u64)] = &[
    ("Gbps", 1_000_000_000),
    ("Mbps", 1_000_000),
    ("kbps", 1_000),
];

/// A positive bit rate, in bits per (simulated) second.
#[derive(Clone, Copy, Debug, Hash, PartialEq, Eq, PartialOrd, Ord)]
pub struct DataRate(NonZeroU64);

impl DataRate {
    /// Create a rate of `bps` bits per second.
    pub fn from_bps(bps: u64) -> Result<Self, Error> {
        NonZeroU64::new(bps)
            .map(Self)
            .ok_or_else(|| Error::InvalidRate(format!("{bps}bps")))
    }

    /// Bits per second.
    pub const fn bps(&self) -> u64 {
        self.0.get()
    }

    /// Time needed to emit `bytes` at this rate.
    pub fn transmission_time(&self, bytes: usize) -> Duration {
        let bits = (bytes as u128) * 8;
        let bps = self.0.get() as u128;
        let nanos = (bits * NANOS_PER_SEC + bps / 2) / bps;
        let subsec = (nanos % NANOS_PER_SEC) as u32;
        match u64::try_from(nanos / NANOS_PER_SEC) {
            Ok(secs) => Duration::new(secs, subsec),
            Err(_) => Duration::MAX,
        }
    }
}

impl FromStr for DataRate {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let invalid = || Error::InvalidRate(s.to_string());
        let trimmed = s.trim();
        let split = trimmed
            .find(|c: char| !(c.is_ascii_digit() || c == '.'))
            .ok_or_else(invalid)?;
        let (value, unit) = trimmed.split_at(split);
        let (_, multiplier) = UNITS
            .iter()
            .find(|(suffix, _)| *suffix == unit.trim_start())
            .ok_or_else(invalid)?;

        // Integers are scaled exactly, fractions go through a float
        let bps = if value.contains('.') {
            let value: f64 = value.parse().map_err(|_| invalid())?;
            let bps = (value * *multiplier as f64).round();
            if !bps.is_finite() || bps < 1.0 || bps >= u64::MAX as f64 {
                return Err(invalid());
            }
            bps as u64
        } else {
            let value: u64 = value.parse().map_err(|_| invalid())?;
            value.checked_mul(*multiplier).ok_or_else(invalid)?
        };
        Self::from_bps(bps).map_err(|_| invalid())
    }
}

impl fmt::Display for DataRate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let bps = self.bps();
        for (suffix, scale) in DISPLAY_UNITS {
            if bps % scale == 0 {
                return write!(f, "{}{}", bps / scale, suffix);
            }
        }
        write!(f, "{bps}bps")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use test_case::test_case;

    #[test_case("10Mbps", 10_000_000; "megabits")]
    #[test_case("10Mb/s", 10_000_000; "megabits slash")]
    #[test_case("1.5Gbps", 1_500_000_000; "fractional gigabits")]
    #[test_case("100kbps", 100_000; "kilobits")]
    #[test_case("8000bps", 8_000; "bits")]
    #[test_case("1000B/s", 8_000; "bytes")]
    #[test_case("1KiB/s", 8_192; "binary kilobytes")]
    #[test_case("2Mib/s", 2_097_152; "binary megabits")]
    #[test_case(" 5 Mbps ", 5_000_000; "whitespace")]
    fn test_parse(input: &str, expected: u64) {
        let rate: DataRate = input.parse().unwrap();
        assert_eq!(rate.bps(), expected);
    }

    #[test_case(""; "empty")]
    #[test_case("Mbps"; "missing value")]
    #[test_case("10"; "missing unit")]
    #[test_case("10Xbps"; "unknown unit")]
    #[test_case("0Mbps"; "zero")]
    #[test_case("0.0001bps"; "below one bit")]
    #[test_case("1.2.3Mbps"; "malformed number")]
    #[test_case("99999999999999GiB/s"; "overflow")]
    fn test_parse_invalid(input: &str) {
        assert!(matches!(
            input.parse::<DataRate>(),
            Err(Error::InvalidRate(_))
        ));
    }

    #[test]
    fn test_zero_rate_rejected() {
        assert_eq!(
            DataRate::from_bps(0),
            Err(Error::InvalidRate("0bps".into()))
        );
    }

    #[test]
    fn test_display() {
        assert_eq!(
            DataRate::from_bps(10_000_000).unwrap().to_string(),
            "10Mbps"
        );
        assert_eq!(
            DataRate::from_bps(2_000_000_000).unwrap().to_string(),
            "2Gbps"
        );
        assert_eq!(DataRate::from_bps(1_500).unwrap().to_string(), "1500bps");
        assert_eq!(DataRate::from_bps(64_000).unwrap().to_string(), "64kbps");
    }

    #[test]
    fn test_display_parses_back() {
        let rate = DataRate::from_bps(1_500_000).unwrap();
        assert_eq!(rate.to_string().parse::<DataRate>().unwrap(), rate);
    }

    #[test_case(1460, 10_000_000, Duration::from_nanos(1_168_000); "default payload")]
    #[test_case(1, 8, Duration::from_secs(1); "one byte per second")]
    #[test_case(0, 1_000, Duration::ZERO; "empty message")]
    #[test_case(1, 3, Duration::new(2, 666_666_667); "rounds up")]
    #[test_case(1, 24_000_000_000, Duration::ZERO; "below resolution")]
    fn test_transmission_time(bytes: usize, bps: u64, expected: Duration) {
        let rate = DataRate::from_bps(bps).unwrap();
        assert_eq!(rate.transmission_time(bytes), expected);
    }

    #[test]
    fn test_transmission_time_no_drift() {
        // 4999 gaps of a constant delay land exactly where the closed form says
        let rate: DataRate = "10Mbps".parse().unwrap();
        let gap = rate.transmission_time(1460);
        let total = gap * 4999;
        assert_eq!(total, Duration::from_nanos(1_168_000 * 4999));
    }

    #[test]
    fn test_transmission_time_saturates() {
        let rate = DataRate::from_bps(1).unwrap();
        assert_eq!(rate.transmission_time(usize::MAX), Duration::MAX);
    }
}
