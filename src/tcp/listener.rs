//! `TcpListener`: the passive-open handle returned by
//! [`crate::NetStack::bind`] (spec §4.1, §6), with `accept` gaining a
//! cancellable timeout.

use std::sync::Arc;
use std::time::{Duration, Instant};

use crate::error::Error;
use crate::tcp::registry::{Entry, Registry};
use crate::tcp::stream::TcpStream;

pub struct TcpListener {
    registry: Arc<Registry>,
    port: u16,
    entry: Arc<Entry>,
}

impl TcpListener {
    pub(crate) fn new(registry: Arc<Registry>, port: u16, entry: Arc<Entry>) -> TcpListener {
        TcpListener {
            registry,
            port,
            entry,
        }
    }

    pub fn local_port(&self) -> u16 {
        self.port
    }

    /// Blocks until a connection completes its handshake, with no timeout.
    pub fn accept(&self) -> Result<TcpStream, Error> {
        self.accept_timeout(None)
    }

    pub fn accept_timeout(&self, timeout: Option<Duration>) -> Result<TcpStream, Error> {
        let deadline = timeout.map(|d| Instant::now() + d);
        let guard = self.entry.accept_queue.lock().unwrap();
        let (mut guard, ready) =
            self.entry
                .wait_until(&self.entry.accept_cv, guard, deadline, |q| !q.is_empty());
        if !ready {
            return Err(Error::TimedOut);
        }
        let quad = guard.pop_front().expect("wait_until guaranteed non-empty");
        drop(guard);

        let conn_entry = self
            .registry
            .lookup(&quad)
            .ok_or(Error::StreamClosed(quad))?;
        Ok(TcpStream::new(self.registry.clone(), quad, conn_entry))
    }
}

impl Drop for TcpListener {
    fn drop(&mut self) {
        self.registry.unbind_listener(self.port);
    }
}
