//! Wire-level types shared by every other `tcp` submodule: the four-tuple
//! key, the fixed TCP header and its control bits, the eleven RFC 793
//! states, and the wrapping sequence-number arithmetic the whole state
//! machine depends on.

use std::net::IpAddr;

pub mod codec;
pub mod listener;
pub mod recv;
pub mod registry;
pub mod send;
pub mod stream;
pub mod tcb;

pub use codec::{Header, Options, Segment};
pub use listener::TcpListener;
pub use registry::Registry;
pub use stream::TcpStream;
pub use tcb::Tcb;

/// One endpoint of a connection: an address and a port. `port: 0` or
/// `addr` set to an unspecified address denotes a wildcard for listen
/// matching (spec §4.1).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Dual {
    pub addr: IpAddr,
    pub port: u16,
}

impl Dual {
    pub fn new(addr: IpAddr, port: u16) -> Self {
        Dual { addr, port }
    }

    fn is_wildcard_addr(&self) -> bool {
        self.addr.is_unspecified()
    }
}

/// The four-tuple identifying a synchronized TCP connection (spec §3, §4.1,
/// GLOSSARY). Both endpoints must share an address family.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Quad {
    pub local: Dual,
    pub remote: Dual,
}

impl Quad {
    pub fn new(local: Dual, remote: Dual) -> Self {
        Quad { local, remote }
    }

    pub fn reversed(&self) -> Quad {
        Quad {
            local: self.remote,
            remote: self.local,
        }
    }
}

bitflags::bitflags! {
    /// Control bits of the TCP header (spec §6): FIN, SYN, RST, PSH, ACK,
    /// URG in LSB-to-MSB order, the bits ECN/CWR and reserved are not
    /// implemented per the Non-goals in spec §1.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct Flags: u8 {
        const FIN = 0x01;
        const SYN = 0x02;
        const RST = 0x04;
        const PSH = 0x08;
        const ACK = 0x10;
        const URG = 0x20;
    }
}

/// The eleven RFC 793 connection states (spec §3, §4.2).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum State {
    Listen,
    SynSent,
    SynRcvd,
    Estab,
    FinWait1,
    FinWait2,
    CloseWait,
    Closing,
    LastAck,
    TimeWait,
    Closed,
}

/// Whether a connection was created by a local `connect` (active) or is the
/// child of a `listen`-ing connection that accepted a SYN (passive).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Kind {
    Active,
    Passive,
}

/// `lhs` is strictly before `rhs` in the 32-bit wrapping sequence space
/// (RFC 1323 §4).
pub fn wrapping_lt(lhs: u32, rhs: u32) -> bool {
    lhs.wrapping_sub(rhs) > (1 << 31)
}

pub fn wrapping_le(lhs: u32, rhs: u32) -> bool {
    lhs == rhs || wrapping_lt(lhs, rhs)
}

/// `start < x < end` in wrapping sequence space.
pub fn is_between_wrapped(start: u32, x: u32, end: u32) -> bool {
    wrapping_lt(start, x) && wrapping_lt(x, end)
}
