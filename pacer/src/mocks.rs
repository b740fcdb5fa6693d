//! A mock implementation of a connection that records every call.

use crate::{Error, Scheduler};
use bytes::Bytes;
use std::{
    net::SocketAddr,
    sync::{Arc, Mutex},
    time::{Duration, UNIX_EPOCH},
};

/// A call made on a mock [Connection].
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Operation {
    Bind,
    Connect(SocketAddr),
    Send(Sent),
    Close,
}

/// A payload handed to a mock [Connection].
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Sent {
    /// Virtual time of the call (since the start of the simulation).
    pub at: Duration,

    /// Payload length in bytes.
    pub len: usize,
}

#[derive(Default)]
struct State {
    operations: Vec<Operation>,
    bound: bool,
    connected: bool,

    fail_bind: bool,
    fail_connect: bool,
    fail_sends: bool,
}

/// A connection that records calls and can be told to fail them.
///
/// Clones share the same record, so a test can keep one handle while the
/// sender owns another.
#[derive(Clone)]
pub struct Connection<S: Scheduler> {
    clock: S,
    state: Arc<Mutex<State>>,
}

impl<S: Scheduler> Connection<S> {
    /// Create a connection that timestamps sends with `clock`.
    pub fn new(clock: S) -> Self {
        Self {
            clock,
            state: Arc::new(Mutex::new(State::default())),
        }
    }

    /// Make subsequent calls to `bind` fail.
    pub fn fail_bind(&self, fail: bool) {
        self.state.lock().unwrap().fail_bind = fail;
    }

    /// Make subsequent calls to `connect` fail.
    pub fn fail_connect(&self, fail: bool) {
        self.state.lock().unwrap().fail_connect = fail;
    }

    /// Make subsequent calls to `send` fail (they are still recorded).
    pub fn fail_sends(&self, fail: bool) {
        self.state.lock().unwrap().fail_sends = fail;
    }

    /// Every call made so far.
    pub fn operations(&self) -> Vec<Operation> {
        self.state.lock().unwrap().operations.clone()
    }

    /// Every send attempted so far.
    pub fn sends(&self) -> Vec<Sent> {
        self.state
            .lock()
            .unwrap()
            .operations
            .iter()
            .filter_map(|op| match op {
                Operation::Send(sent) => Some(sent.clone()),
                _ => None,
            })
            .collect()
    }

    /// Returns whether the connection is connected (and not yet closed).
    pub fn is_connected(&self) -> bool {
        self.state.lock().unwrap().connected
    }
}

impl<S: Scheduler> crate::Connection for Connection<S> {
    type Address = SocketAddr;

    fn bind(&mut self) -> Result<(), Error> {
        let mut state = self.state.lock().unwrap();
        state.operations.push(Operation::Bind);
        if state.fail_bind || state.bound {
            return Err(Error::BindFailed);
        }
        state.bound = true;
        Ok(())
    }

    fn connect(&mut self, peer: SocketAddr) -> Result<(), Error> {
        let mut state = self.state.lock().unwrap();
        state.operations.push(Operation::Connect(peer));
        if state.fail_connect || !state.bound {
            return Err(Error::ConnectionFailed);
        }
        state.connected = true;
        Ok(())
    }

    fn send(&mut self, payload: Bytes) -> Result<(), Error> {
        let at = self
            .clock
            .current()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default();
        let mut state = self.state.lock().unwrap();
        state.operations.push(Operation::Send(Sent {
            at,
            len: payload.len(),
        }));
        if state.fail_sends {
            return Err(Error::SendFailed);
        }
        if !state.connected {
            return Err(Error::NotConnected);
        }
        Ok(())
    }

    fn close(&mut self) {
        let mut state = self.state.lock().unwrap();
        state.operations.push(Operation::Close);
        state.bound = false;
        state.connected = false;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{deterministic::Executor, Connection as _};

    #[test]
    fn test_lifecycle() {
        let (_, context, _) = Executor::default();
        let mut connection = Connection::new(context);
        let peer: SocketAddr = "127.0.0.1:9000".parse().unwrap();

        assert_eq!(
            connection.send(Bytes::from_static(b"early")),
            Err(Error::NotConnected)
        );
        assert_eq!(connection.connect(peer), Err(Error::ConnectionFailed));
        connection.bind().unwrap();
        assert_eq!(connection.bind(), Err(Error::BindFailed));
        connection.connect(peer).unwrap();
        connection.send(Bytes::from_static(b"hello")).unwrap();
        connection.close();
        connection.close();
        assert!(!connection.is_connected());

        // Closed connections can be reopened
        connection.bind().unwrap();
        assert_eq!(connection.sends().len(), 2);
        assert_eq!(
            connection.sends()[1],
            Sent {
                at: Duration::ZERO,
                len: 5
            }
        );
        assert_eq!(connection.operations().len(), 9);
    }

    #[test]
    fn test_injected_failures() {
        let (_, context, _) = Executor::default();
        let mut connection = Connection::new(context);
        let peer: SocketAddr = "127.0.0.1:9000".parse().unwrap();
        connection.fail_bind(true);
        assert_eq!(connection.bind(), Err(Error::BindFailed));
        connection.fail_bind(false);
        connection.bind().unwrap();
        connection.fail_connect(true);
        assert_eq!(connection.connect(peer), Err(Error::ConnectionFailed));
        connection.fail_connect(false);
        connection.connect(peer).unwrap();
        connection.fail_sends(true);
        assert_eq!(connection.send(Bytes::new()), Err(Error::SendFailed));
        assert_eq!(connection.sends().len(), 1);
    }
}
