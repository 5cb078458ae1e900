//! `tcp-core`: a userspace TCP transport core (RFC 9293) built around an
//! [`ip::Sender`]/[`ip::Receiver`] boundary instead of a concrete network
//! interface, so the State Machine, Send Engine and Receive Engine can be
//! driven from anything — a TUN device, a test double, another process's
//! loopback queue.
//!
//! A background thread increments the ISS clock, a dispatch thread services
//! every connection's timers before blocking for the next inbound segment.

pub mod config;
pub mod error;
pub mod ip;
pub mod stats;
pub mod tcp;

pub use config::TcpConfig;
pub use error::{DecodeError, Error};
pub use stats::Stats;
pub use tcp::{TcpListener, TcpStream};

use std::net::{IpAddr, SocketAddr};
use std::sync::atomic::{AtomicBool, AtomicU16, AtomicU32, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use log::{debug, trace, warn};

use tcp::registry::{Entry, Registry};
use tcp::tcb::{Effects, Tcb};
use tcp::{Dual, Flags, Kind, Quad, State};

const DISPATCH_TICK: Duration = Duration::from_millis(10);
const CONNECT_TIMEOUT: Duration = Duration::from_secs(75);

/// The registry, the dispatch loop and the public handle API described in
/// spec §4.1 and §6: one per host-side TCP instance.
pub struct NetStack {
    registry: Arc<Registry>,
    sender: Arc<dyn ip::Sender>,
    stats: Arc<Stats>,
    iss_clock: Arc<AtomicU32>,
    local_addr: IpAddr,
    next_ephemeral: AtomicU16,
    shutdown: Arc<AtomicBool>,
}

impl NetStack {
    /// Spins up the ISS clock and dispatch threads and returns a handle.
    /// `receiver` is consumed by the dispatch thread; it never needs to be
    /// touched again directly.
    pub fn new(
        local_addr: IpAddr,
        sender: Arc<dyn ip::Sender>,
        receiver: Box<dyn ip::Receiver>,
        cfg: TcpConfig,
    ) -> Arc<NetStack> {
        let registry = Arc::new(Registry::new(cfg));
        let stats = Arc::new(Stats::default());
        let iss_clock = Arc::new(AtomicU32::new(rand::random()));
        let shutdown = Arc::new(AtomicBool::new(false));

        let stack = Arc::new(NetStack {
            registry: registry.clone(),
            sender: sender.clone(),
            stats: stats.clone(),
            iss_clock: iss_clock.clone(),
            local_addr,
            next_ephemeral: AtomicU16::new(49152),
            shutdown: shutdown.clone(),
        });

        // RFC 9293 §3.4.1: the ISS is driven by a clock that increments
        // roughly every 4 microseconds independent of segment traffic.
        {
            let iss_clock = iss_clock.clone();
            let shutdown = shutdown.clone();
            thread::spawn(move || {
                while !shutdown.load(Ordering::Relaxed) {
                    thread::sleep(Duration::from_micros(4));
                    iss_clock.fetch_add(1, Ordering::Relaxed);
                }
            });
        }

        {
            let registry = registry.clone();
            let sender = sender.clone();
            let stats = stats.clone();
            let shutdown = shutdown.clone();
            thread::spawn(move || dispatch_loop(registry, sender, receiver, stats, shutdown));
        }

        stack
    }

    pub fn stats(&self) -> &Stats {
        &self.stats
    }

    pub fn local_addr(&self) -> IpAddr {
        self.local_addr
    }

    /// Binds a passive-open endpoint (spec §4.1). Fails with
    /// [`Error::PortInUse`] if another LISTEN already owns this port.
    pub fn bind(&self, port: u16) -> Result<TcpListener, Error> {
        let quad = Quad::new(
            Dual::new(self.local_addr, port),
            Dual::new(unspecified(self.local_addr), 0),
        );
        let tcb = Tcb::listen_stub(quad, self.registry.config());
        let entry = self.registry.bind_listener(port, tcb)?;
        Ok(TcpListener::new(self.registry.clone(), port, entry))
    }

    /// Initiates an active open (spec §4.1, §4.2) and blocks until the
    /// handshake completes, the peer refuses it, or
    /// [`CONNECT_TIMEOUT`][CONNECT_TIMEOUT] elapses.
    pub fn connect(&self, remote: SocketAddr) -> Result<TcpStream, Error> {
        let local_port = self.allocate_ephemeral_port()?;
        let quad = Quad::new(
            Dual::new(self.local_addr, local_port),
            Dual::new(remote.ip(), remote.port()),
        );

        let iss = self.iss_clock.load(Ordering::Relaxed) ^ rand::random::<u32>();
        let mut tcb = Tcb::syn_sent(quad, iss, self.registry.config());
        let now = Instant::now();
        let syn = tcb.initial_syn(now);
        let entry = self.registry.register(quad, tcb)?;

        send_segment(&self.sender, &quad, &syn);
        debug!("tx SYN {:?}", quad);

        let deadline = Some(now + CONNECT_TIMEOUT);
        let guard = entry.tcb.lock().unwrap();
        let (guard, ready) = entry.wait_until(&entry.writer_cv, guard, deadline, |tcb| {
            tcb.state == State::Estab || tcb.reset
        });
        let refused = guard.reset;
        drop(guard);

        if !ready {
            self.registry.unregister(&quad);
            return Err(Error::TimedOut);
        }
        if refused {
            self.registry.unregister(&quad);
            return Err(Error::ConnectionRefused);
        }

        Ok(TcpStream::new(self.registry.clone(), quad, entry))
    }

    fn allocate_ephemeral_port(&self) -> Result<u16, Error> {
        for _ in 0..u16::MAX {
            let port = self.next_ephemeral.fetch_add(1, Ordering::Relaxed);
            let port = if port < 49152 { port.wrapping_add(49152) } else { port };
            if self.registry.listener(port).is_none() {
                return Ok(port);
            }
        }
        Err(Error::NoMemory)
    }
}

impl Drop for NetStack {
    fn drop(&mut self) {
        self.shutdown.store(true, Ordering::Relaxed);
    }
}

fn unspecified(addr: IpAddr) -> IpAddr {
    match addr {
        IpAddr::V4(_) => IpAddr::V4(std::net::Ipv4Addr::UNSPECIFIED),
        IpAddr::V6(_) => IpAddr::V6(std::net::Ipv6Addr::UNSPECIFIED),
    }
}

fn send_segment(sender: &Arc<dyn ip::Sender>, quad: &Quad, seg: &tcp::tcb::OutSegment) {
    let bytes = tcp::codec::encode(&seg.header, &seg.options, &seg.payload);
    if let Err(e) = sender.send(quad, &bytes) {
        warn!("ip sender failed for {:?}: {}", quad, e);
    }
}

/// The main loop: services every connection's timers, then blocks for one
/// inbound segment (or the tick interval, whichever comes first) and
/// dispatches it through the State Machine.
fn dispatch_loop(
    registry: Arc<Registry>,
    sender: Arc<dyn ip::Sender>,
    mut receiver: Box<dyn ip::Receiver>,
    stats: Arc<Stats>,
    shutdown: Arc<AtomicBool>,
) {
    while !shutdown.load(Ordering::Relaxed) {
        let now = Instant::now();

        for (quad, entry) in registry.enumerate() {
            let (segments, effects) = {
                let mut tcb = entry.tcb.lock().unwrap();
                tcb.on_tick(now, registry.config())
            };
            for seg in &segments {
                send_segment(&sender, &quad, seg);
            }
            apply_effects(&registry, &quad, &entry, effects, &stats);
        }

        match receiver.recv_timeout(DISPATCH_TICK) {
            Ok(Some(raw)) => handle_raw_segment(&registry, &sender, &stats, raw, now),
            Ok(None) => {}
            Err(e) => warn!("ip receiver error: {}", e),
        }
    }
}

fn handle_raw_segment(
    registry: &Arc<Registry>,
    sender: &Arc<dyn ip::Sender>,
    stats: &Arc<Stats>,
    raw: ip::RawSegment,
    now: Instant,
) {
    let seg = match tcp::codec::decode(&raw.tcp_bytes, raw.tcp_bytes.len()) {
        Ok(seg) => {
            Stats::bump(&stats.segments_decoded);
            seg
        }
        Err(e) => {
            Stats::bump(&stats.decode_errors);
            trace!("dropping undecodable segment: {}", e);
            return;
        }
    };

    let quad = Quad::new(
        Dual::new(raw.quad.local.addr, seg.header.dst_port),
        Dual::new(raw.quad.remote.addr, seg.header.src_port),
    );

    if let Some(entry) = registry.lookup(&quad) {
        let (out, effects) = {
            let mut tcb = entry.tcb.lock().unwrap();
            tcb.on_segment(&seg, now, registry.config())
        };
        for o in &out {
            send_segment(sender, &quad, o);
        }
        apply_effects(registry, &quad, &entry, effects, stats);
        return;
    }

    if seg.header.flags.contains(Flags::SYN) && !seg.header.flags.contains(Flags::ACK) {
        if registry.listener(quad.local.port).is_some() {
            let iss = rand::random();
            let mut child = Tcb::listen_child(quad, iss, &seg, registry.config());
            let synack = child.initial_synack(now);
            match registry.register(quad, child) {
                Ok(_entry) => {
                    send_segment(sender, &quad, &synack);
                    debug!("accepted SYN, tx SYN+ACK {:?}", quad);
                }
                Err(_) => {
                    Stats::bump(&stats.pool_exhausted);
                    let rst = Tcb::stray_rst(&seg, &quad);
                    send_segment(sender, &quad, &rst);
                }
            }
        }
        return;
    }

    if !seg.header.flags.contains(Flags::RST) {
        Stats::bump(&stats.segments_dropped_unacceptable);
        let rst = Tcb::stray_rst(&seg, &quad);
        send_segment(sender, &quad, &rst);
    }
}

fn apply_effects(registry: &Arc<Registry>, quad: &Quad, entry: &Arc<Entry>, effects: Effects, stats: &Arc<Stats>) {
    entry.wake(effects.wake_reader, effects.wake_writer, effects.wake_closer);

    if effects.retransmit {
        Stats::bump(&stats.retransmits);
    }
    if effects.fast_retransmit {
        Stats::bump(&stats.fast_retransmits);
    }
    if effects.persist_probe {
        Stats::bump(&stats.persist_probes);
    }

    if effects.established {
        let kind = entry.tcb.lock().unwrap().kind;
        if kind == Kind::Passive {
            if let Some(listener) = registry.listener(quad.local.port) {
                listener.accept_queue.lock().unwrap().push_back(*quad);
                listener.accept_cv.notify_all();
            }
        }
    }

    if effects.remove {
        let reset = entry.tcb.lock().unwrap().reset;
        if reset {
            Stats::bump(&stats.connections_aborted);
            if effects.refused {
                Stats::bump(&stats.connections_reset_by_peer);
            }
        }
        registry.unregister(quad);
    }
}
