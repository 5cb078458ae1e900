use crate::tcp::Quad;

/// Errors surfaced at the upstream socket-layer API boundary (spec §7).
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("Tun error: {0}")]
    Tun(#[from] tidy_tuntap::error::Error),

    #[error("invalid argument: {0}")]
    InvalidArgument(&'static str),

    #[error("address already in use")]
    AddressInUse,

    #[error("port {0} already in use")]
    PortInUse(u16),

    #[error("socket is not bound to a local address")]
    NotBound,

    #[error("socket is not connected")]
    NotConnected,

    #[error("socket is already connected")]
    AlreadyConnected,

    #[error("port {0} has been unexpectedly closed")]
    PortClosed(u16),

    #[error("stream for {0:?} has been closed")]
    StreamClosed(Quad),

    #[error("connection refused")]
    ConnectionRefused,

    #[error("connection reset by peer")]
    ConnectionReset,

    #[error("connection aborted: {0}")]
    ConnectionAborted(&'static str),

    #[error("connection timed out")]
    ConnectionTimedOut,

    #[error("operation timed out")]
    TimedOut,

    #[error("no memory available for a new connection or buffer")]
    NoMemory,

    #[error("message too long for a single segment")]
    MessageTooLong,

    #[error("malformed segment: {0}")]
    Decode(#[from] DecodeError),
}

/// Reasons a [`crate::tcp::codec`] decode can fail (spec §4.3, §7).
///
/// These are never fatal to a connection: the offending segment is dropped
/// and counted in [`crate::stats::Stats`], per the propagation policy in
/// spec §7.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum DecodeError {
    #[error("data offset below minimum header size or past the end of the packet")]
    BadOffset,

    #[error("option kind/length malformed or truncated")]
    BadOption,

    #[error("segment shorter than its declared header length")]
    BadLength,
}
