//! `TcpStream`: the established-connection handle (spec §4.1, §6).
//! A `Read`/`Write` impl backed by condvar waits on the connection's
//! send/receive buffers, plus a `close` that drives the State Machine's
//! active-close path and blocks
//! until it finishes.

use std::io;
use std::sync::Arc;
use std::time::{Duration, Instant};

use crate::error::Error;
use crate::tcp::registry::{Entry, Registry};
use crate::tcp::{Quad, State};

pub struct TcpStream {
    registry: Arc<Registry>,
    quad: Quad,
    entry: Arc<Entry>,
}

impl TcpStream {
    pub(crate) fn new(registry: Arc<Registry>, quad: Quad, entry: Arc<Entry>) -> TcpStream {
        TcpStream {
            registry,
            quad,
            entry,
        }
    }

    pub fn peer_addr(&self) -> std::net::SocketAddr {
        std::net::SocketAddr::new(self.quad.remote.addr, self.quad.remote.port)
    }

    pub fn local_addr(&self) -> std::net::SocketAddr {
        std::net::SocketAddr::new(self.quad.local.addr, self.quad.local.port)
    }

    fn is_gone(state: State, reset: bool) -> Option<Error> {
        if reset {
            Some(Error::ConnectionReset)
        } else if state == State::Closed {
            Some(Error::StreamClosed(Quad {
                local: crate::tcp::Dual::new(std::net::IpAddr::V4(std::net::Ipv4Addr::UNSPECIFIED), 0),
                remote: crate::tcp::Dual::new(std::net::IpAddr::V4(std::net::Ipv4Addr::UNSPECIFIED), 0),
            }))
        } else {
            None
        }
    }

    /// Blocks until at least one byte has been delivered in order, the
    /// connection's read side has been closed (peer's FIN consumed, or
    /// reset), or `timeout` elapses.
    pub fn read_timeout(&self, buf: &mut [u8], timeout: Option<Duration>) -> Result<usize, Error> {
        let deadline = timeout.map(|d| Instant::now() + d);
        let guard = self.entry.tcb.lock().unwrap();
        let (mut guard, ready) = self.entry.wait_until(&self.entry.reader_cv, guard, deadline, |tcb| {
            tcb.recv.has_data() || tcb.recv.fin_seen || tcb.reset || tcb.state == State::Closed
        });
        if !ready {
            return Err(Error::TimedOut);
        }
        let n = guard.recv(buf);
        if n == 0 {
            if guard.reset {
                return Err(Error::ConnectionReset);
            }
            if guard.recv.fin_seen {
                return Ok(0);
            }
        }
        Ok(n)
    }

    pub fn write_timeout(&self, buf: &[u8], timeout: Option<Duration>) -> Result<usize, Error> {
        if buf.is_empty() {
            return Ok(0);
        }
        let deadline = timeout.map(|d| Instant::now() + d);
        let guard = self.entry.tcb.lock().unwrap();
        let (mut guard, ready) = self.entry.wait_until(&self.entry.writer_cv, guard, deadline, |tcb| {
            tcb.send.usable_window() > 0 || tcb.reset || tcb.state == State::Closed
        });
        if !ready {
            return Err(Error::TimedOut);
        }
        if guard.reset {
            return Err(Error::ConnectionReset);
        }
        if guard.state == State::Closed {
            return Err(Error::StreamClosed(self.quad));
        }
        Ok(guard.send(buf))
    }

    /// Drives the active-close path (spec §4.2) and blocks until the
    /// connection fully winds down or `timeout` elapses.
    pub fn close_timeout(&self, timeout: Option<Duration>) -> Result<(), Error> {
        let deadline = timeout.map(|d| Instant::now() + d);
        {
            let mut guard = self.entry.tcb.lock().unwrap();
            guard.close(Instant::now());
        }
        let guard = self.entry.tcb.lock().unwrap();
        let (_, ready) = self.entry.wait_until(&self.entry.closer_cv, guard, deadline, |tcb| {
            matches!(tcb.state, State::Closed | State::TimeWait) || tcb.reset
        });
        if !ready {
            return Err(Error::TimedOut);
        }
        Ok(())
    }

    pub fn close(&self) -> Result<(), Error> {
        self.close_timeout(None)
    }
}

impl io::Read for TcpStream {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        self.read_timeout(buf, None)
            .map_err(|e| io::Error::new(io::ErrorKind::Other, e))
    }
}

impl io::Write for TcpStream {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.write_timeout(buf, None)
            .map_err(|e| io::Error::new(io::ErrorKind::Other, e))
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

impl Drop for TcpStream {
    fn drop(&mut self) {
        let _ = self.close_timeout(Some(Duration::from_millis(0)));
    }
}
