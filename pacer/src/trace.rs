//! Record how a window evolves over virtual time.

use std::{
    io,
    sync::{Arc, Mutex},
    time::{Duration, SystemTime, UNIX_EPOCH},
};

/// Collects `(time, window)` samples.
///
/// Clones share the same samples.
#[derive(Clone, Default)]
pub struct WindowTracer {
    samples: Arc<Mutex<Vec<(Duration, u32)>>>,
}

impl WindowTracer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record that the window became `window` at `at`.
    pub fn record(&self, at: SystemTime, window: u32) {
        let at = at.duration_since(UNIX_EPOCH).unwrap_or_default();
        self.samples.lock().unwrap().push((at, window));
    }

    /// Samples recorded so far (time since the start of the simulation, window).
    pub fn samples(&self) -> Vec<(Duration, u32)> {
        self.samples.lock().unwrap().clone()
    }

    /// A window-change observer that records the new window.
    pub fn observer(&self) -> impl FnMut(SystemTime, u32, u32) + Send + 'static {
        let tracer = self.clone();
        move |at, _, window| tracer.record(at, window)
    }

    /// Write one `"<seconds> <window>"` line per sample.
    pub fn write<W: io::Write>(&self, mut out: W) -> io::Result<()> {
        for (at, window) in self.samples.lock().unwrap().iter() {
            writeln!(out, "{} {}", at.as_secs_f64(), window)?;
        }
        out.flush()
    }
}
