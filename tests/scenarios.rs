//! End-to-end scenarios driving two [`NetStack`]s against each other over
//! an in-memory wire instead of a TUN device — a mock `ip::Sender`/
//! `ip::Receiver` pair wired the same way a concrete transport would be:
//! two structs implementing the same two traits.

use std::collections::VecDeque;
use std::io;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::sync::{Arc, Condvar, Mutex};
use std::time::Duration;

use tcp_core::ip::{RawSegment, Receiver, Sender};
use tcp_core::tcp::Quad;
use tcp_core::{NetStack, TcpConfig};

struct Wire {
    queue: Mutex<VecDeque<RawSegment>>,
    cv: Condvar,
    drop_next: Mutex<usize>,
}

impl Wire {
    fn new() -> Arc<Wire> {
        Arc::new(Wire {
            queue: Mutex::new(VecDeque::new()),
            cv: Condvar::new(),
            drop_next: Mutex::new(0),
        })
    }
}

struct WireSender {
    to: Arc<Wire>,
}

impl Sender for WireSender {
    fn send(&self, quad: &Quad, tcp_bytes: &[u8]) -> io::Result<()> {
        let mut drop_next = self.to.drop_next.lock().unwrap();
        if *drop_next > 0 {
            *drop_next -= 1;
            return Ok(());
        }
        drop(drop_next);

        let mut q = self.to.queue.lock().unwrap();
        q.push_back(RawSegment {
            quad: quad.reversed(),
            tcp_bytes: tcp_bytes.to_vec(),
        });
        self.to.cv.notify_all();
        Ok(())
    }
}

struct WireReceiver {
    from: Arc<Wire>,
}

impl Receiver for WireReceiver {
    fn recv_timeout(&mut self, timeout: Duration) -> io::Result<Option<RawSegment>> {
        let mut q = self.from.queue.lock().unwrap();
        if q.is_empty() {
            let (guard, _) = self.from.cv.wait_timeout(q, timeout).unwrap();
            q = guard;
        }
        Ok(q.pop_front())
    }
}

/// Wires up two NetStacks so traffic sent by one is delivered to the
/// other, with an optional number of the first sends from `a` dropped
/// (to exercise retransmission).
fn harness(drop_from_a: usize) -> (Arc<NetStack>, Ipv4Addr, Arc<NetStack>, Ipv4Addr) {
    let a_to_b = Wire::new();
    let b_to_a = Wire::new();
    *a_to_b.drop_next.lock().unwrap() = drop_from_a;

    let addr_a = Ipv4Addr::new(10, 0, 0, 1);
    let addr_b = Ipv4Addr::new(10, 0, 0, 2);

    let stack_a = NetStack::new(
        IpAddr::V4(addr_a),
        Arc::new(WireSender { to: a_to_b.clone() }),
        Box::new(WireReceiver { from: b_to_a.clone() }),
        TcpConfig {
            initial_rto_ms: 50,
            max_rto_ms: 400,
            ..TcpConfig::default()
        },
    );
    let stack_b = NetStack::new(
        IpAddr::V4(addr_b),
        Arc::new(WireSender { to: b_to_a }),
        Box::new(WireReceiver { from: a_to_b }),
        TcpConfig {
            initial_rto_ms: 50,
            max_rto_ms: 400,
            ..TcpConfig::default()
        },
    );

    (stack_a, addr_a, stack_b, addr_b)
}

/// Scenario A: three-way handshake, data in both directions, graceful
/// active close from the client.
#[test]
fn handshake_data_exchange_and_graceful_close() {
    let (client, _addr_a, server, addr_b) = harness(0);

    let listener = server.bind(7000).unwrap();
    let accept_thread = std::thread::spawn(move || listener.accept().unwrap());

    let mut stream = client
        .connect(SocketAddr::new(IpAddr::V4(addr_b), 7000))
        .unwrap();

    let mut server_stream = accept_thread.join().unwrap();

    stream.write_timeout(b"hello", Some(Duration::from_secs(2))).unwrap();

    let mut buf = [0u8; 64];
    let n = server_stream
        .read_timeout(&mut buf, Some(Duration::from_secs(2)))
        .unwrap();
    assert_eq!(&buf[..n], b"hello");

    server_stream
        .write_timeout(b"world", Some(Duration::from_secs(2)))
        .unwrap();
    let n = stream.read_timeout(&mut buf, Some(Duration::from_secs(2))).unwrap();
    assert_eq!(&buf[..n], b"world");

    stream.close_timeout(Some(Duration::from_secs(2))).unwrap();

    let n = server_stream
        .read_timeout(&mut buf, Some(Duration::from_secs(2)))
        .unwrap();
    assert_eq!(n, 0, "peer FIN should surface as a zero-length read");
}

/// Scenario B: a lost SYN+ACK forces the client's retransmission timer to
/// fire before the handshake completes.
#[test]
fn lost_synack_is_recovered_by_retransmission() {
    let (client, _addr_a, server, addr_b) = harness(1);

    let listener = server.bind(7001).unwrap();
    let accept_thread = std::thread::spawn(move || listener.accept().unwrap());

    let stream = client
        .connect(SocketAddr::new(IpAddr::V4(addr_b), 7001))
        .expect("connect should still succeed after one retransmitted SYN+ACK");

    let _server_stream = accept_thread.join().unwrap();
    drop(stream);
}

/// Scenario C: the peer actively refuses a connection attempt (RST while
/// SYN_SENT) when nothing is listening on the target port.
#[test]
fn connect_to_closed_port_is_refused() {
    let (client, _addr_a, _server, addr_b) = harness(0);

    let err = client
        .connect(SocketAddr::new(IpAddr::V4(addr_b), 9999))
        .unwrap_err();
    assert!(matches!(err, tcp_core::Error::ConnectionRefused));
}

/// Scenario: a passive close — the server reads the client's FIN, keeps
/// writing, then closes itself (CLOSE_WAIT -> LAST_ACK -> gone).
#[test]
fn passive_close_after_peer_fin() {
    let (client, _addr_a, server, addr_b) = harness(0);

    let listener = server.bind(7002).unwrap();
    let accept_thread = std::thread::spawn(move || listener.accept().unwrap());

    let stream = client
        .connect(SocketAddr::new(IpAddr::V4(addr_b), 7002))
        .unwrap();
    let mut server_stream = accept_thread.join().unwrap();

    stream.close_timeout(Some(Duration::from_secs(2))).unwrap();

    let mut buf = [0u8; 16];
    let n = server_stream
        .read_timeout(&mut buf, Some(Duration::from_secs(2)))
        .unwrap();
    assert_eq!(n, 0);

    server_stream
        .close_timeout(Some(Duration::from_secs(2)))
        .unwrap();
}
