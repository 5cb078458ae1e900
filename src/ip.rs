//! The IP sender and IP receiver collaborators named in spec §1 and §6: the
//! only two points where this crate touches anything below TCP. Everything
//! in `tcp::` takes and produces plain TCP segment bytes; encapsulating
//! those in IP, computing the IP/TCP checksums and moving bytes across a
//! real interface all happen here.
//!
//! The IPv4 header and checksum are hand-rolled here rather than pulled
//! from a parsing crate (see DESIGN.md for the dependency tradeoff).

use std::io::{Read, Write};
use std::io;
use std::net::Ipv4Addr;
use std::os::fd::AsRawFd;
use std::time::Duration;

use nix::poll::{poll, PollFd, PollFlags};

use crate::tcp::{Dual, Quad};

pub const PROTO_TCP: u8 = 6;

/// One TCP segment lifted off an IP packet, with enough of the IP header
/// left to build the reply [`Quad`].
pub struct RawSegment {
    pub quad: Quad,
    pub tcp_bytes: Vec<u8>,
}

/// Hands a TCP segment's bytes to whatever sits below TCP. Implementations
/// are responsible for IP encapsulation and for filling in the TCP
/// checksum the [`crate::tcp::codec`] leaves as zero.
pub trait Sender: Send + Sync {
    fn send(&self, quad: &Quad, tcp_bytes: &[u8]) -> io::Result<()>;
}

/// Produces inbound segments. `recv_timeout` returns `Ok(None)` on a
/// timeout with nothing received, so the dispatch loop can still service
/// timers (spec §4.4) while otherwise blocked on I/O.
pub trait Receiver: Send {
    fn recv_timeout(&mut self, timeout: Duration) -> io::Result<Option<RawSegment>>;
}

/// Minimal IPv4 header, just the fields a loopback/TUN TCP stack needs.
#[derive(Debug, Clone, Copy)]
pub struct Ipv4Header {
    pub src: Ipv4Addr,
    pub dst: Ipv4Addr,
    pub total_len: u16,
}

const IPV4_HEADER_LEN: usize = 20;

pub fn parse_ipv4(bytes: &[u8]) -> Option<(Ipv4Header, &[u8])> {
    if bytes.len() < IPV4_HEADER_LEN {
        return None;
    }
    let version = bytes[0] >> 4;
    if version != 4 {
        return None;
    }
    let ihl = (bytes[0] & 0x0f) as usize * 4;
    if ihl < IPV4_HEADER_LEN || bytes.len() < ihl {
        return None;
    }
    let total_len = u16::from_be_bytes([bytes[2], bytes[3]]);
    let protocol = bytes[9];
    if protocol != PROTO_TCP {
        return None;
    }
    let src = Ipv4Addr::new(bytes[12], bytes[13], bytes[14], bytes[15]);
    let dst = Ipv4Addr::new(bytes[16], bytes[17], bytes[18], bytes[19]);
    let end = (total_len as usize).min(bytes.len());
    Some((
        Ipv4Header {
            src,
            dst,
            total_len,
        },
        &bytes[ihl..end],
    ))
}

fn ip_checksum(header: &[u8]) -> u16 {
    let mut sum = 0u32;
    for chunk in header.chunks(2) {
        let word = if chunk.len() == 2 {
            u16::from_be_bytes([chunk[0], chunk[1]])
        } else {
            u16::from_be_bytes([chunk[0], 0])
        };
        sum += word as u32;
    }
    while sum >> 16 != 0 {
        sum = (sum & 0xffff) + (sum >> 16);
    }
    !(sum as u16)
}

fn build_ipv4_header(src: Ipv4Addr, dst: Ipv4Addr, payload_len: usize) -> [u8; IPV4_HEADER_LEN] {
    let mut h = [0u8; IPV4_HEADER_LEN];
    h[0] = 0x45; // version 4, IHL 5
    let total_len = (IPV4_HEADER_LEN + payload_len) as u16;
    h[2..4].copy_from_slice(&total_len.to_be_bytes());
    h[8] = 64; // TTL
    h[9] = PROTO_TCP;
    h[12..16].copy_from_slice(&src.octets());
    h[16..20].copy_from_slice(&dst.octets());
    let checksum = ip_checksum(&h);
    h[10..12].copy_from_slice(&checksum.to_be_bytes());
    h
}

/// TCP checksum over the pseudo-header plus the TCP segment (RFC 793 §3.1),
/// written into `tcp_bytes[16..18]` in place.
pub fn fill_tcp_checksum(src: Ipv4Addr, dst: Ipv4Addr, tcp_bytes: &mut [u8]) {
    tcp_bytes[16] = 0;
    tcp_bytes[17] = 0;

    let mut sum = 0u32;
    for chunk in src.octets().chunks(2).chain(dst.octets().chunks(2)) {
        sum += u16::from_be_bytes([chunk[0], chunk[1]]) as u32;
    }
    sum += PROTO_TCP as u32;
    sum += tcp_bytes.len() as u32;

    for chunk in tcp_bytes.chunks(2) {
        let word = if chunk.len() == 2 {
            u16::from_be_bytes([chunk[0], chunk[1]])
        } else {
            u16::from_be_bytes([chunk[0], 0])
        };
        sum += word as u32;
    }
    while sum >> 16 != 0 {
        sum = (sum & 0xffff) + (sum >> 16);
    }
    let checksum = !(sum as u16);
    tcp_bytes[16..18].copy_from_slice(&checksum.to_be_bytes());
}

/// A [`Sender`]/[`Receiver`] pair backed by a TUN device, for the `client`
/// and `server` binaries. The two halves share the same file descriptor behind a
/// `Mutex`, since `Sender` is handed out as `Arc<dyn Sender>` (shared across
/// every connection) while `Receiver` is owned exclusively by the dispatch
/// thread.
type SharedTun = std::sync::Arc<std::sync::Mutex<tidy_tuntap::Tun>>;

pub struct TunSender {
    iface: SharedTun,
}

pub struct TunReceiver {
    iface: SharedTun,
    local_addr: Ipv4Addr,
}

/// Opens one TUN device and returns its `Sender`/`Receiver` halves, backed
/// by the same file descriptor.
pub fn open_tun(
    name: &str,
    addr: Ipv4Addr,
    netmask: Ipv4Addr,
) -> io::Result<(std::sync::Arc<TunSender>, Box<TunReceiver>)> {
    let iface = tidy_tuntap::Tun::new(name, false)
        .map_err(|e| io::Error::new(io::ErrorKind::Other, e.to_string()))?;
    iface
        .set_addr(addr)
        .map_err(|e| io::Error::new(io::ErrorKind::Other, e.to_string()))?;
    iface
        .set_netmask(netmask)
        .map_err(|e| io::Error::new(io::ErrorKind::Other, e.to_string()))?;
    iface
        .bring_up()
        .map_err(|e| io::Error::new(io::ErrorKind::Other, e.to_string()))?;

    let iface: SharedTun = std::sync::Arc::new(std::sync::Mutex::new(iface));

    let sender = std::sync::Arc::new(TunSender {
        iface: iface.clone(),
    });
    let receiver = Box::new(TunReceiver {
        iface,
        local_addr: addr,
    });

    Ok((sender, receiver))
}

impl Sender for TunSender {
    fn send(&self, quad: &Quad, tcp_bytes: &[u8]) -> io::Result<()> {
        let (std::net::IpAddr::V4(src), std::net::IpAddr::V4(dst)) = (quad.local.addr, quad.remote.addr) else {
            return Err(io::Error::new(io::ErrorKind::InvalidInput, "ipv6 unsupported over this Tun"));
        };
        let mut tcp_bytes = tcp_bytes.to_vec();
        fill_tcp_checksum(src, dst, &mut tcp_bytes);
        let ip_header = build_ipv4_header(src, dst, tcp_bytes.len());

        let mut packet = Vec::with_capacity(ip_header.len() + tcp_bytes.len());
        packet.extend_from_slice(&ip_header);
        packet.extend_from_slice(&tcp_bytes);
        self.iface.lock().unwrap().write_all(&packet)
    }
}

impl Receiver for TunReceiver {
    fn recv_timeout(&mut self, timeout: Duration) -> io::Result<Option<RawSegment>> {
        let mut iface = self.iface.lock().unwrap();
        let mut pfd = [PollFd::new(iface.as_raw_fd(), PollFlags::POLLIN)];
        let ready = poll(&mut pfd[..], timeout.as_millis() as i32)
            .map_err(|e| io::Error::new(io::ErrorKind::Other, e.to_string()))?;
        if ready == 0 {
            return Ok(None);
        }

        let mut buf = [0u8; 1500];
        let n = iface.read(&mut buf)?;
        drop(iface);

        let Some((ip_header, tcp_bytes)) = parse_ipv4(&buf[..n]) else {
            return Ok(None);
        };
        if ip_header.dst != self.local_addr {
            return Ok(None);
        }
        if tcp_bytes.len() < crate::tcp::codec::HEADER_LEN {
            return Ok(None);
        }
        let src_port = u16::from_be_bytes([tcp_bytes[0], tcp_bytes[1]]);
        let dst_port = u16::from_be_bytes([tcp_bytes[2], tcp_bytes[3]]);

        Ok(Some(RawSegment {
            quad: Quad::new(
                Dual::new(std::net::IpAddr::V4(ip_header.dst), dst_port),
                Dual::new(std::net::IpAddr::V4(ip_header.src), src_port),
            ),
            tcp_bytes: tcp_bytes.to_vec(),
        }))
    }
}
