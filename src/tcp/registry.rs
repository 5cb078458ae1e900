//! The Endpoint Registry (spec §4.1): the map from four-tuple to connection
//! state, exact-match vs. wildcard LISTEN lookup, and the per-connection
//! wait queues `TcpListener`/`TcpStream` block on.
//!
//! Where a connection manager might keep three separate maps (`bounded`,
//! `established`, `streams`) behind one `Mutex`, this crate folds them into
//! a single table behind an
//! `RwLock` (reader-preferring: lookups on the inbound-segment hot path take
//! a read lock, only `register`/`unregister` take a write lock) and gives
//! each connection its own `Mutex<Tcb>` + `Condvar`s, so unrelated
//! connections never block on each other. The Registry lock is always
//! acquired before a connection's lock, never the reverse (spec §5).

use std::collections::{HashMap, VecDeque};
use std::net::IpAddr;
use std::sync::{Arc, Condvar, Mutex, RwLock};
use std::time::{Duration, Instant};

use crate::config::TcpConfig;
use crate::error::Error;
use crate::tcp::{Dual, Quad};
use crate::tcp::tcb::Tcb;

/// One registered connection: its `Tcb` behind a lock, plus the condition
/// variables blocked readers/writers/closers/accepters wait on.
pub struct Entry {
    pub tcb: Mutex<Tcb>,
    pub reader_cv: Condvar,
    pub writer_cv: Condvar,
    pub closer_cv: Condvar,
    /// Only meaningful for a LISTEN entry: established children waiting to
    /// be handed to `accept`.
    pub accept_queue: Mutex<VecDeque<Quad>>,
    pub accept_cv: Condvar,
}

impl Entry {
    fn new(tcb: Tcb) -> Entry {
        Entry {
            tcb: Mutex::new(tcb),
            reader_cv: Condvar::new(),
            writer_cv: Condvar::new(),
            closer_cv: Condvar::new(),
            accept_queue: Mutex::new(VecDeque::new()),
            accept_cv: Condvar::new(),
        }
    }

    pub fn wake(&self, reader: bool, writer: bool, closer: bool) {
        if reader {
            self.reader_cv.notify_all();
        }
        if writer {
            self.writer_cv.notify_all();
        }
        if closer {
            self.closer_cv.notify_all();
        }
    }

    /// Blocks until `pred` is satisfied or `deadline` passes, re-checking
    /// whenever the condvar wakes.
    pub fn wait_until<'a, T, F>(
        &self,
        cv: &Condvar,
        mut guard: std::sync::MutexGuard<'a, T>,
        deadline: Option<Instant>,
        mut pred: F,
    ) -> (std::sync::MutexGuard<'a, T>, bool)
    where
        F: FnMut(&mut T) -> bool,
    {
        loop {
            if pred(&mut guard) {
                return (guard, true);
            }
            match deadline {
                None => {
                    guard = cv.wait(guard).unwrap();
                }
                Some(d) => {
                    let now = Instant::now();
                    if now >= d {
                        return (guard, false);
                    }
                    let (g, timeout) = cv.wait_timeout(guard, d - now).unwrap();
                    guard = g;
                    if timeout.timed_out() && !pred(&mut guard) {
                        return (guard, false);
                    }
                }
            }
        }
    }
}

/// Whether a port is already bound by some other LISTEN (spec §4.1
/// "a new listen on an already-bound port is rejected").
pub struct Registry {
    listeners: RwLock<HashMap<u16, Arc<Entry>>>,
    connections: RwLock<HashMap<Quad, Arc<Entry>>>,
    cfg: TcpConfig,
}

impl Registry {
    pub fn new(cfg: TcpConfig) -> Registry {
        Registry {
            listeners: RwLock::new(HashMap::new()),
            connections: RwLock::new(HashMap::new()),
            cfg,
        }
    }

    pub fn config(&self) -> &TcpConfig {
        &self.cfg
    }

    pub fn bind_listener(&self, port: u16, tcb: Tcb) -> Result<Arc<Entry>, Error> {
        let mut listeners = self.listeners.write().unwrap();
        if listeners.contains_key(&port) {
            return Err(Error::PortInUse(port));
        }
        let entry = Arc::new(Entry::new(tcb));
        listeners.insert(port, entry.clone());
        Ok(entry)
    }

    pub fn listener(&self, port: u16) -> Option<Arc<Entry>> {
        self.listeners.read().unwrap().get(&port).cloned()
    }

    pub fn unbind_listener(&self, port: u16) {
        self.listeners.write().unwrap().remove(&port);
    }

    /// Total connections, for the `max_connections` pool limit (spec §3, §6).
    pub fn len(&self) -> usize {
        self.connections.read().unwrap().len()
    }

    pub fn register(&self, quad: Quad, tcb: Tcb) -> Result<Arc<Entry>, Error> {
        let mut connections = self.connections.write().unwrap();
        if connections.len() >= self.cfg.max_connections {
            return Err(Error::NoMemory);
        }
        let entry = Arc::new(Entry::new(tcb));
        connections.insert(quad, entry.clone());
        Ok(entry)
    }

    pub fn unregister(&self, quad: &Quad) {
        self.connections.write().unwrap().remove(quad);
    }

    /// Exact four-tuple match only. A bare inbound SYN that misses here
    /// falls back to `listener(port)` in the dispatch loop
    /// (`lib.rs::handle_raw_segment`), which spawns the SYN_RECEIVED child
    /// — that fallback is not part of this method (spec §4.1 precedence
    /// rule: exact match takes priority over any LISTEN).
    pub fn lookup(&self, quad: &Quad) -> Option<Arc<Entry>> {
        self.connections.read().unwrap().get(quad).cloned()
    }

    pub fn enumerate(&self) -> Vec<(Quad, Arc<Entry>)> {
        self.connections
            .read()
            .unwrap()
            .iter()
            .map(|(q, e)| (*q, e.clone()))
            .collect()
    }

    pub fn enumerate_listeners(&self) -> Vec<(u16, Arc<Entry>)> {
        self.listeners
            .read()
            .unwrap()
            .iter()
            .map(|(p, e)| (*p, e.clone()))
            .collect()
    }
}

pub fn is_wildcard(addr: IpAddr) -> bool {
    addr.is_unspecified()
}
