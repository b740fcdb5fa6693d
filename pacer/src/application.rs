//! Start and stop applications at fixed points in virtual time.

use crate::{sender::PacedSender, Connection, Error, EventId, Scheduler};
use std::time::Duration;
use tracing::warn;

/// Something a host starts and stops.
pub trait Application: Clone + Send + 'static {
    /// Begin a session.
    fn start(&self) -> Result<(), Error>;

    /// End the current session (no-op when idle).
    fn stop(&self);
}

impl<S: Scheduler, C: Connection> Application for PacedSender<S, C> {
    fn start(&self) -> Result<(), Error> {
        PacedSender::start(self)
    }

    fn stop(&self) {
        PacedSender::stop(self)
    }
}

/// Schedule `app` to start after `start` and stop after `stop` (both measured from now).
///
/// A start that fails is logged and the later stop still runs.
pub fn install<S, A>(
    scheduler: &S,
    app: A,
    start: Duration,
    stop: Duration,
) -> Result<(EventId, EventId), Error>
where
    S: Scheduler,
    A: Application,
{
    if stop < start {
        return Err(Error::InvalidLifetime);
    }
    let started = scheduler.schedule(start, {
        let app = app.clone();
        move || {
            if let Err(err) = app.start() {
                warn!(?err, "failed to start application");
            }
        }
    });
    let stopped = scheduler.schedule(stop, move || app.stop());
    Ok((started, stopped))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        deterministic::{Context, Executor},
        mocks,
        sender::Config,
    };
    use std::{
        net::SocketAddr,
        time::{Duration, UNIX_EPOCH},
    };

    #[test]
    fn test_install_bounds_session() {
        let (runner, context, _) = Executor::default();
        let sender = context.with_registry(|registry| PacedSender::new(context.clone(), registry));
        let connection = mocks::Connection::new(context.clone());
        let peer: SocketAddr = "10.1.2.2:8080".parse().unwrap();
        sender
            .setup(
                connection.clone(),
                Config {
                    peer,
                    unit_size: 125,
                    total_units: 1_000,
                    rate: "1Mbps".parse().unwrap(),
                },
            )
            .unwrap();
        install(
            &context,
            sender.clone(),
            Duration::from_secs(1),
            Duration::from_millis(1_010),
        )
        .unwrap();
        runner.run();

        // Sends at 1.000s through 1.009s, the one due at 1.010s is cancelled
        let sends = connection.sends();
        assert_eq!(sends.len(), 10);
        assert_eq!(sends[0].at, Duration::from_secs(1));
        assert_eq!(sends[9].at, Duration::from_millis(1_009));
        assert!(!sender.is_running());
        assert_eq!(context.current(), UNIX_EPOCH + Duration::from_millis(1_010));
    }

    #[test]
    fn test_install_rejects_inverted_lifetime() {
        let (_, context, _) = Executor::default();
        let sender: PacedSender<Context, mocks::Connection<Context>> =
            context.with_registry(|registry| PacedSender::new(context.clone(), registry));
        let result = install(
            &context,
            sender,
            Duration::from_secs(2),
            Duration::from_secs(1),
        );
        assert_eq!(result, Err(Error::InvalidLifetime));
        assert_eq!(context.pending(), 0);
    }

    #[test]
    fn test_failed_start_is_contained() {
        let (runner, context, _) = Executor::default();
        let sender: PacedSender<Context, mocks::Connection<Context>> =
            context.with_registry(|registry| PacedSender::new(context.clone(), registry));
        install(
            &context,
            sender.clone(),
            Duration::ZERO,
            Duration::from_secs(1),
        )
        .unwrap();
        runner.run();
        assert!(!sender.is_running());
    }
}
