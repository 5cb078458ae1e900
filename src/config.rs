use std::time::Duration;

/// Every configuration knob named in spec §6, collected into one struct
/// rather than hardcoded per-constructor (`rto: 1000`, `cwnd: 4 * 536`, the
/// R1/R2 thresholds, ...), so a [`crate::NetStack`] can be configured once
/// and threaded through every [`crate::tcp::tcb::Tcb`] it creates.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct TcpConfig {
    /// Initial retransmission timeout, before any RTT sample is available.
    pub initial_rto_ms: u64,
    /// Ceiling the retransmission timer's exponential backoff is clamped to.
    pub max_rto_ms: u64,
    /// Retransmissions of the same segment allowed before the connection is
    /// aborted with `ConnectionTimedOut`.
    pub max_retries: u32,
    /// How long a connection lingers in TIME_WAIT (2*MSL) before it is
    /// freed. Embedded profiles favor a short delay; host profiles a long
    /// one (RFC 793 recommends 2*MSL, commonly 4 minutes on hosts).
    pub time_wait: Duration,
    /// Receive buffer capacity handed to a newly-created connection.
    pub default_recv_window: u16,
    /// Maximum connections the [`crate::tcp::registry::Registry`] will hold
    /// at once (pool size); further `register` calls fail `NoMemory`.
    pub max_connections: usize,
    /// Maximum segment size advertised and accepted when the peer's SYN
    /// carries no MSS option.
    pub default_mss: u16,
    /// Disables Nagle-style coalescing when true: every `enqueue`d byte is
    /// sent as soon as the window allows, instead of waiting to fill a
    /// full-sized segment.
    pub tcp_nodelay: bool,
    /// How long FIN_WAIT_2 may sit with no peer FIN before the watchdog
    /// forces the connection to CLOSED with `ConnectionTimedOut`.
    pub fin_wait2_timeout: Duration,
    /// Maximum number of zero-window persist probes sent without a window
    /// update before the connection is aborted.
    pub max_persist_probes: u32,
    /// Delayed-ACK hold, armed by the first in-order segment (spec §4.5).
    pub delayed_ack: Duration,
    /// Keep-alive idle period before the first probe is sent. `None`
    /// disables keep-alive (the default; spec §9 leaves thresholds
    /// unspecified in the source).
    pub keepalive_idle: Option<Duration>,
    /// Interval between keep-alive probes once idle.
    pub keepalive_interval: Duration,
    /// Unacknowledged keep-alive probes tolerated before `ConnectionReset`.
    pub keepalive_probes: u32,
}

impl Default for TcpConfig {
    fn default() -> Self {
        TcpConfig {
            initial_rto_ms: 1000,
            max_rto_ms: 64_000,
            max_retries: 9,
            time_wait: Duration::from_secs(2 * 60),
            default_recv_window: 64240,
            max_connections: 1024,
            default_mss: 536,
            tcp_nodelay: false,
            fin_wait2_timeout: Duration::from_secs(60),
            max_persist_probes: 8,
            delayed_ack: Duration::from_millis(40),
            keepalive_idle: None,
            keepalive_interval: Duration::from_secs(75),
            keepalive_probes: 9,
        }
    }
}
