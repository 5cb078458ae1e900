//! The Send Engine (spec §4.4): the send buffer, the retransmission queue,
//! the single retransmission timer, Reno congestion control, fast
//! retransmit and the zero-window persist timer.
//!
//! Congestion control, retransmission timing and window bookkeeping live
//! here as their own type, driven by the state machine without reaching
//! into its fields directly.

use std::cmp;
use std::collections::VecDeque;
use std::time::{Duration, Instant};

use log::trace;

use crate::config::TcpConfig;

/// A still-unacknowledged segment on the retransmission queue. Doubles as
/// the "pending-data record" spec §3 describes: `sent_at` is the timestamp
/// used for RTT sampling, following Karn's algorithm (a retransmitted
/// segment is marked `retransmitted` and never contributes a sample).
#[derive(Debug, Clone)]
pub struct Unacked {
    pub seq: u32,
    pub len: u32,
    pub syn: bool,
    pub fin: bool,
    pub sent_at: Instant,
    pub retransmitted: bool,
}

impl Unacked {
    fn seg_len(&self) -> u32 {
        self.len + self.syn as u32 + self.fin as u32
    }

    fn end(&self) -> u32 {
        self.seq.wrapping_add(self.seg_len()).wrapping_sub(1)
    }
}

/// A segment the state machine should hand to the [`crate::tcp::codec`] and
/// transmit.
#[derive(Debug, Clone)]
pub struct Outgoing {
    pub seq: u32,
    pub data: Vec<u8>,
    pub fin: bool,
    /// Set when this is a retransmission of the connection's own SYN (or
    /// SYN+ACK) rather than a data/FIN segment — the caller must reinstate
    /// the SYN control bit, which this type otherwise never carries.
    pub syn: bool,
}

pub struct SendEngine {
    pub una: u32,
    pub nxt: u32,
    pub iss: u32,
    /// Peer's advertised window, already left-shifted by the negotiated
    /// window-scale factor.
    pub wnd: u32,
    pub wnd_max: u32,
    pub wl1: u32,
    pub wl2: u32,
    pub mss: u16,
    pub wscale: u8,
    pub cwnd: u32,
    pub ssthresh: u32,
    dup_ack_seq: Option<u32>,
    dup_ack_cnt: u32,
    srtt: Option<f64>,
    rttvar: f64,
    pub rto_ms: u64,
    pub retries: u32,
    retransmit_deadline: Option<Instant>,
    persist_deadline: Option<Instant>,
    persist_probes: u32,
    pub nodelay: bool,
    /// Bytes queued for transmission; offset 0 corresponds to `una`.
    buffer: VecDeque<u8>,
    unacked: VecDeque<Unacked>,
    pub fin_queued: bool,
}

/// Initial window per RFC 5681 §3.1.
fn initial_cwnd(mss: u16) -> u32 {
    if mss > 2190 {
        2 * mss as u32
    } else if mss > 1095 {
        3 * mss as u32
    } else {
        4 * mss as u32
    }
}

impl SendEngine {
    pub fn new(iss: u32, mss: u16, cfg: &TcpConfig) -> Self {
        SendEngine {
            una: iss,
            nxt: iss,
            iss,
            wnd: 0,
            wnd_max: 0,
            wl1: 0,
            wl2: 0,
            mss,
            wscale: 0,
            cwnd: initial_cwnd(mss),
            ssthresh: u32::MAX,
            dup_ack_seq: None,
            dup_ack_cnt: 0,
            srtt: None,
            rttvar: 0.0,
            rto_ms: cfg.initial_rto_ms,
            retries: 0,
            retransmit_deadline: None,
            persist_deadline: None,
            persist_probes: 0,
            nodelay: cfg.tcp_nodelay,
            buffer: VecDeque::new(),
            unacked: VecDeque::new(),
            fin_queued: false,
        }
    }

    pub fn flight(&self) -> u32 {
        self.nxt.wrapping_sub(self.una)
    }

    fn sent_len(&self) -> usize {
        self.flight() as usize
    }

    fn available(&self) -> usize {
        self.buffer.len() - self.sent_len()
    }

    /// Appends to the send buffer, which grows without a fixed ceiling —
    /// admission is bounded at the connection level (`Registry::register`'s
    /// `max_connections` check), not per byte; see spec §5 "Shared
    /// resources".
    pub fn enqueue(&mut self, bytes: &[u8]) -> usize {
        self.buffer.extend(bytes.iter());
        bytes.len()
    }

    /// Invariant 1 (spec §3): usable window, clamped to the peer's window
    /// and the congestion window, less bytes already in flight.
    pub fn usable_window(&self) -> usize {
        let limit = cmp::min(self.cwnd, self.wnd) as usize;
        limit.saturating_sub(self.sent_len())
    }

    /// RFC 9293 §3.8.6.2.1 Sender's Algorithm — whether to send now versus
    /// coalescing more data first.
    fn sws_allows_send(&self) -> bool {
        if self.nodelay {
            return true;
        }
        let d = self.available();
        let u = self.usable_window();
        cmp::min(d, u) >= self.mss as usize
            || (self.sent_len() == 0 && d <= u)
            || (self.sent_len() == 0 && cmp::min(d, u) >= (self.wnd_max as usize) / 2)
    }

    /// Produces the next segment to transmit, if the usable window and send
    /// buffer allow one (spec §4.4 "Segment sizing").
    pub fn produce_segment(&mut self, now: Instant) -> Option<Outgoing> {
        if self.available() == 0 && !(self.fin_queued && self.flight() == 0 && !self.has_fin_queued_unacked()) {
            return None;
        }
        if self.available() > 0 && !self.sws_allows_send() {
            return None;
        }

        let usable = self.usable_window();
        let available = self.available();
        let send_len = cmp::min(cmp::min(available, usable), self.mss as usize);

        let want_fin = self.fin_queued && send_len == available && !self.has_fin_queued_unacked();

        if send_len == 0 && !want_fin {
            return None;
        }

        let seq = self.nxt;
        let sent_len = self.sent_len();
        let data: Vec<u8> = self.buffer.iter().copied().skip(sent_len).take(send_len).collect();

        self.unacked.push_back(Unacked {
            seq,
            len: send_len as u32,
            syn: false,
            fin: want_fin,
            sent_at: now,
            retransmitted: false,
        });

        self.nxt = self
            .nxt
            .wrapping_add(send_len as u32)
            .wrapping_add(want_fin as u32);

        self.arm_retransmit_timer(now);

        Some(Outgoing {
            seq,
            data,
            fin: want_fin,
            syn: false,
        })
    }

    fn has_fin_queued_unacked(&self) -> bool {
        self.unacked.iter().any(|u| u.fin)
    }

    /// Registers the local SYN (or SYN+ACK) as the first unacked segment.
    pub fn queue_syn(&mut self, now: Instant) {
        self.unacked.push_back(Unacked {
            seq: self.iss,
            len: 0,
            syn: true,
            fin: false,
            sent_at: now,
            retransmitted: false,
        });
        self.nxt = self.iss.wrapping_add(1);
        self.arm_retransmit_timer(now);
    }

    /// Marks the send buffer as closed: once every queued byte has been
    /// sent, `produce_segment` appends FIN to the final segment (or sends
    /// it bare if nothing was queued), the same path ordinary data takes.
    pub fn queue_bare_fin(&mut self, _now: Instant) {
        self.fin_queued = true;
    }

    pub fn fin_acked(&self) -> bool {
        self.fin_queued && self.unacked.is_empty() && self.una == self.nxt
    }

    /// Processes a cumulative ACK: retires fully/partially acked segments,
    /// returns bytes freed (for a blocked writer) and an RTT sample if one
    /// was collected (Karn's algorithm: only from a non-retransmitted
    /// segment).
    pub fn on_ack(&mut self, ack: u32, now: Instant) -> (bool, Option<Duration>) {
        let before = self.buffer.len();
        self.una = ack;

        let mut sample = None;

        while let Some(seg) = self.unacked.front() {
            let end = seg.end();
            if super::wrapping_lt(end, ack) || end.wrapping_add(1) == ack {
                let seg = self.unacked.pop_front().unwrap();
                let drain = cmp::min(seg.len as usize, self.buffer.len());
                self.buffer.drain(..drain);
                if !seg.retransmitted && sample.is_none() {
                    sample = Some(now.saturating_duration_since(seg.sent_at));
                }
            } else if super::is_between_wrapped(seg.seq.wrapping_sub(1), ack, end.wrapping_add(1)) {
                let acked = ack.wrapping_sub(seg.seq) as usize;
                let seg = self.unacked.front_mut().unwrap();
                let drain = acked.saturating_sub((seg.seq.wrapping_sub(self.una)) as usize);
                let _ = drain;
                self.buffer.drain(..cmp::min(acked, self.buffer.len()));
                seg.seq = ack;
                seg.len = seg.len.saturating_sub(acked as u32);
                if !seg.retransmitted && sample.is_none() {
                    sample = Some(now.saturating_duration_since(seg.sent_at));
                }
                break;
            } else {
                break;
            }
        }

        if self.unacked.is_empty() {
            self.retransmit_deadline = None;
        } else {
            let next = self.unacked.front().unwrap();
            self.retransmit_deadline = Some(next.sent_at + Duration::from_millis(self.rto_ms));
        }

        (self.buffer.len() < before, sample)
    }

    /// Updates `snd.wnd`/`wl1`/`wl2` per RFC 793 §3.4, given the segment
    /// that carried the window update, and arms/disarms the persist timer.
    pub fn update_window(&mut self, seg_seq: u32, seg_ack: u32, window: u32, now: Instant) {
        let accept = super::wrapping_lt(self.wl1, seg_seq)
            || (self.wl1 == seg_seq && super::wrapping_le(self.wl2, seg_ack));
        if !accept {
            return;
        }
        self.wnd = window;
        self.wl1 = seg_seq;
        self.wl2 = seg_ack;
        if self.wnd > self.wnd_max {
            self.wnd_max = self.wnd;
        }

        if self.wnd == 0 && self.available() > 0 {
            if self.persist_deadline.is_none() {
                self.persist_deadline = Some(now + Duration::from_millis(self.rto_ms));
                self.persist_probes = 0;
            }
        } else {
            self.persist_deadline = None;
            self.persist_probes = 0;
        }
    }

    /// RTT estimation, Jacobson/Karels (spec §4.4).
    pub fn record_rtt_sample(&mut self, r: Duration, cfg: &TcpConfig) {
        let r_ms = r.as_millis() as f64;
        match self.srtt {
            None => {
                self.srtt = Some(r_ms);
                self.rttvar = r_ms / 2.0;
            }
            Some(srtt) => {
                self.rttvar = 0.75 * self.rttvar + 0.25 * (srtt - r_ms).abs();
                self.srtt = Some(0.875 * srtt + 0.125 * r_ms);
            }
        }
        let rto = self.srtt.unwrap() + (100.0f64).max(4.0 * self.rttvar);
        self.rto_ms = cmp::max(rto as u64, 1000).min(cfg.max_rto_ms);
    }

    /// Reno congestion control on a new-data ACK (spec §4.4).
    pub fn on_new_data_acked(&mut self) {
        if self.dup_ack_cnt >= 3 {
            // Deflate after a fast-retransmit episode recovers.
            self.cwnd = self.ssthresh;
        } else if self.cwnd < self.ssthresh {
            self.cwnd += self.mss as u32;
        } else {
            self.cwnd += cmp::max(
                ((self.mss as u64 * self.mss as u64) / self.cwnd.max(1) as u64) as u32,
                1,
            );
        }
        self.dup_ack_cnt = 0;
        self.dup_ack_seq = None;
    }

    /// Tracks duplicate ACKs; returns `true` exactly once, the instant the
    /// third duplicate for a given byte arrives, so the caller can trigger
    /// fast retransmit (spec §4.4).
    pub fn on_duplicate_ack(&mut self, ack: u32) -> bool {
        if self.dup_ack_seq == Some(ack) {
            self.dup_ack_cnt += 1;
        } else {
            self.dup_ack_seq = Some(ack);
            self.dup_ack_cnt = 1;
        }

        if self.dup_ack_cnt == 3 {
            let flight = self.flight();
            self.ssthresh = cmp::max(flight / 2, 2 * self.mss as u32);
            self.cwnd = self.ssthresh + 3 * self.mss as u32;
            trace!(
                "fast retransmit triggered: ssthresh={} cwnd={}",
                self.ssthresh, self.cwnd
            );
            true
        } else if self.dup_ack_cnt > 3 {
            self.cwnd += self.mss as u32;
            false
        } else {
            false
        }
    }

    /// Immediately resends the oldest unacked segment on fast retransmit
    /// (spec §4.4), without touching `retries`/`rto_ms` the way a timeout
    /// retransmit does — cwnd/ssthresh were already adjusted by
    /// [`SendEngine::on_duplicate_ack`].
    pub fn resend_oldest_unacked(&mut self, now: Instant) -> Option<Outgoing> {
        let seg = self.unacked.front_mut()?;
        seg.retransmitted = true;
        seg.sent_at = now;
        let (seq, len, syn, fin) = (seg.seq, seg.len, seg.syn, seg.fin);

        let sent_len = (seq.wrapping_sub(self.una)) as usize;
        let data: Vec<u8> = self
            .buffer
            .iter()
            .copied()
            .skip(sent_len)
            .take(len as usize)
            .collect();

        Some(Outgoing { seq, data, fin, syn })
    }

    fn arm_retransmit_timer(&mut self, now: Instant) {
        if self.retransmit_deadline.is_none() {
            self.retransmit_deadline = Some(now + Duration::from_millis(self.rto_ms));
        }
    }

    /// Fires on retransmission-timer expiry: doubles `rto_ms` (capped),
    /// applies Reno's timeout penalty, and returns the oldest unacked
    /// segment to resend, or `None`/abort if retries are exhausted.
    pub fn on_retransmit_timeout(&mut self, now: Instant, cfg: &TcpConfig) -> RetransmitOutcome {
        let Some(seg) = self.unacked.front_mut() else {
            self.retransmit_deadline = None;
            return RetransmitOutcome::Nothing;
        };

        self.retries += 1;
        if self.retries > cfg.max_retries {
            return RetransmitOutcome::Abort;
        }

        seg.retransmitted = true;
        seg.sent_at = now;
        let data_range = (seg.seq, seg.len, seg.syn, seg.fin);

        self.ssthresh = cmp::max(self.flight() / 2, 2 * self.mss as u32);
        self.cwnd = self.mss as u32;
        self.dup_ack_cnt = 0;
        self.dup_ack_seq = None;

        self.rto_ms = cmp::min(self.rto_ms * 2, cfg.max_rto_ms);
        trace!(
            "retransmit timeout: retries={} rto_ms={} ssthresh={} cwnd={}",
            self.retries, self.rto_ms, self.ssthresh, self.cwnd
        );
        self.retransmit_deadline = Some(now + Duration::from_millis(self.rto_ms));

        let (seq, len, syn, fin) = data_range;
        let sent_len = (seq.wrapping_sub(self.una)) as usize;
        let data: Vec<u8> = self
            .buffer
            .iter()
            .copied()
            .skip(sent_len)
            .take(len as usize)
            .collect();

        RetransmitOutcome::Resend(Outgoing { seq, data, fin, syn })
    }

    pub fn retransmit_due(&self, now: Instant) -> bool {
        self.retransmit_deadline.map_or(false, |d| now >= d)
    }

    pub fn persist_due(&self, now: Instant) -> bool {
        self.persist_deadline.map_or(false, |d| now >= d)
    }

    /// Fires on persist-timer expiry: sends a one-byte probe and
    /// exponentially backs off, or signals abort once
    /// `max_persist_probes` has been exceeded (spec §4.4, §9 Open Question).
    pub fn on_persist_timeout(&mut self, now: Instant, cfg: &TcpConfig) -> PersistOutcome {
        self.persist_probes += 1;
        if self.persist_probes > cfg.max_persist_probes {
            return PersistOutcome::Abort;
        }

        let probe_byte = self
            .buffer
            .get(self.sent_len())
            .copied()
            .map(|b| vec![b])
            .unwrap_or_default();

        let backoff = cmp::min(self.rto_ms * (1 << cmp::min(self.persist_probes, 6)), cfg.max_rto_ms);
        self.persist_deadline = Some(now + Duration::from_millis(backoff));

        PersistOutcome::Probe(self.una.wrapping_sub(1), probe_byte)
    }
}

pub enum RetransmitOutcome {
    Nothing,
    Abort,
    Resend(Outgoing),
}

pub enum PersistOutcome {
    Abort,
    Probe(u32, Vec<u8>),
}
